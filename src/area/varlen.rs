/*!

Variable-length allocation, following the main ideas of the Doug Lea allocator.

Allocation looks in this order:

 1. The exact bucket for the request's real size: pop and return, no split.
 2. The designated victim (dv): carve the request off its front.
 3. Every bucket above the request's own bucket: take the first object that fits and split it. The remainder replaces
    the dv if it is larger, otherwise it goes back into a bucket.
 4. A new subarea, installed as the dv, followed by one more attempt at step 2.

A split never leaves a remainder smaller than `MIN_VARLEN_OBJECT_SIZE`; such slivers stay inside the allocated
object.

Freeing coalesces with both neighbours. A used object's tag says whether its predecessor is free, and the predecessor's
trailing tag gives its size. The successor is inspected directly. A merged span touching the dv is folded into the
dv. Otherwise it goes to the head of its bucket. Free objects are therefore never adjacent to each other or to the dv.

Specials (dv and subarea markers) count as used predecessors: the object following one never has its prev-free bit
set.

*/

use tracing::{debug, trace};

use crate::{
  area::{bucket::{bucket_index, NEXT_LINK}, Area, AreaHeader},
  error::{AllocationError, Result},
  segment::{
    codec::{self, SpecialKind, TagStatus},
    layout::*,
    memory::SegmentMemory
  }
};
use super::subarea::SENTINEL_BYTES;

impl Area<'_> {
  /// Allocates an object of `count` words, the leading tag word included, and returns its offset.
  pub(crate) fn allocate_words(&mut self, count: Word) -> Result<Offset> {
    let wanted = count.checked_mul(WORD_BYTES)
        .filter(|bytes| *bytes > 0 && *bytes <= MAX_OBJECT_BYTES)
        .ok_or_else(|| AllocationError::InvalidRequest(format!("cannot allocate {} words", count)))?;
    let real   = codec::real_size(wanted);

    if (real as usize) < EXACT_BUCKETS {
      let head = self.header.bucket(self.memory, real as usize);
      if head != 0 {
        self.unlink_free(head, real);
        self.mark_used(head, wanted, real);
        trace!(area = %self.kind, object = head, size = real, "allocated from exact bucket");
        return Ok(head);
      }
    }

    if let Some(object) = self.split_designated_victim(wanted, real) {
      return Ok(object);
    }
    if let Some(object) = self.split_from_buckets(wanted, real) {
      return Ok(object);
    }

    self.extend_varlen(real)?;
    self.split_designated_victim(wanted, real)
        .ok_or(AllocationError::SegmentExhausted { requested: real as usize, available: 0 })
  }

  /// Frees the used object at `object`, coalescing it with free neighbours. Every tag involved is validated before
  /// anything is written.
  pub(crate) fn free_varlen(&mut self, object: Offset) -> Result<()> {
    let subarea = self.header.subarea_containing(self.memory, object)
        .ok_or_else(|| self.corrupt(object, "object lies outside every subarea of the area"))?;
    let (lower, upper) = subarea.object_bounds(self.memory)
        .ok_or_else(|| self.corrupt(object, "subarea header describes an impossible span"))?;

    if object < lower || object >= upper || object % OBJECT_ALIGNMENT != 0 {
      return Err(self.corrupt(object, "object overlaps the subarea markers or is misaligned"));
    }
    let tag = self.read(object);
    if !codec::is_normal_used(tag) {
      return Err(self.corrupt(object, "tag does not mark a used object"));
    }
    let size = codec::used_object_size(tag);
    let end  = object.checked_add(size).filter(|end| *end <= upper)
        .ok_or_else(|| self.corrupt(object, "object runs past the end of its subarea"))?;

    let left = match codec::is_prev_free(tag) {
      true  => Some(self.free_neighbour_before(object, lower)?),
      false => None,
    };
    let right = match codec::is_free(self.read(end)) {
      true  => Some(self.free_neighbour_at(end, upper)?),
      false => None,
    };

    // Validated; from here on only writes.
    let mut start    = object;
    let mut span_end = end;
    if let Some((previous, previous_size)) = left {
      self.unlink_free(previous, previous_size);
      start = previous;
    }
    if let Some((next, next_size)) = right {
      self.unlink_free(next, next_size);
      span_end = next + next_size;
    }
    let span = span_end - start;

    match self.header.designated_victim(self.memory) {
      Some((dv, dv_size)) if dv == span_end => {
        self.set_designated_victim(start, dv_size + span);
      }
      Some((dv, dv_size)) if dv + dv_size == start => {
        self.set_designated_victim(dv, dv_size + span);
        self.set_prev_free(span_end, false);
      }
      _ => {
        self.push_free(start, span);
        self.set_prev_free(span_end, true);
      }
    }

    trace!(area = %self.kind, object, size, merged = span, "freed object");
    Ok(())
  }

  // region Designated victim

  pub(crate) fn set_designated_victim(&mut self, offset: Offset, size: Word) {
    self.write_special(offset, size, SpecialKind::DesignatedVictim);
    self.header.set_bucket(self.memory, DV_BUCKET, offset);
    self.header.set_bucket(self.memory, DV_SIZE_BUCKET, size);
  }

  fn clear_designated_victim(&mut self) {
    self.header.set_bucket(self.memory, DV_BUCKET, 0);
    self.header.set_bucket(self.memory, DV_SIZE_BUCKET, 0);
  }

  /// Turns the current dv, if any, into an ordinary free object.
  fn retire_designated_victim(&mut self) {
    if let Some((dv, dv_size)) = self.header.designated_victim(self.memory) {
      self.clear_designated_victim();
      self.push_free(dv, dv_size);
      self.set_prev_free(dv + dv_size, true);
    }
  }

  fn split_designated_victim(&mut self, wanted: Word, real: Word) -> Option<Offset> {
    let (dv, dv_size) = self.header.designated_victim(self.memory)?;
    if dv_size < real {
      return None;
    }

    let remainder = dv_size - real;
    if remainder < MIN_VARLEN_OBJECT_SIZE {
      self.clear_designated_victim();
      self.mark_used(dv, wanted, dv_size);
    } else {
      // The new dv is written first so `mark_used` finds a special successor.
      self.set_designated_victim(dv + real, remainder);
      self.mark_used(dv, wanted, real);
    }

    trace!(area = %self.kind, object = dv, size = real, "allocated from designated victim");
    Some(dv)
  }

  // endregion Designated victim

  /// Takes the first free object that fits from the buckets at or above the request's own bucket.
  fn split_from_buckets(&mut self, wanted: Word, real: Word) -> Option<Offset> {
    for bucket in bucket_index(real)..DV_BUCKET {
      let mut object = self.header.bucket(self.memory, bucket);
      while object != 0 {
        let size = codec::tag_size(self.read(object));
        if size >= real {
          trace!(area = %self.kind, object, size, bucket, "splitting free object");
          return Some(self.split_free(object, size, wanted, real));
        }
        object = self.read(object + NEXT_LINK);
      }
    }
    None
  }

  fn split_free(&mut self, object: Offset, size: Word, wanted: Word, real: Word) -> Offset {
    self.unlink_free(object, size);

    let remainder = size - real;
    if remainder < MIN_VARLEN_OBJECT_SIZE {
      self.mark_used(object, wanted, size);
      return object;
    }

    let rest    = object + real;
    let dv_size = self.header.designated_victim(self.memory).map_or(0, |(_, dv_size)| dv_size);
    if remainder > dv_size {
      self.retire_designated_victim();
      self.set_designated_victim(rest, remainder);
      self.set_prev_free(rest + remainder, false);
    } else {
      // The successor of `rest` keeps its prev-free bit.
      self.push_free(rest, remainder);
    }
    self.mark_used(object, wanted, real);
    object
  }

  /// Adds a subarea large enough for an object of `real` bytes and makes it the dv.
  fn extend_varlen(&mut self, real: Word) -> Result<()> {
    let index  = self.next_subarea_index()?;
    let needed = real.checked_add(SENTINEL_BYTES + SUBAREA_ALIGNMENT_BYTES)
        .ok_or_else(|| AllocationError::InvalidRequest(format!("object of {} bytes is too large", real)))?;
    let size   = self.next_subarea_size(needed)?;

    let subarea = self.create_subarea(index, size)?;
    self.retire_designated_victim();
    self.initialize_free_span(subarea);

    debug!(area = %self.kind, index, size, "extended variable-length area");
    Ok(())
  }

  /// Writes the used tag of an object occupying `span` bytes at `object`. Its predecessor is never free: the space
  /// came from a free object or from the dv, and neither has a free neighbour.
  fn mark_used(&mut self, object: Offset, wanted: Word, span: Word) {
    let recorded = match codec::real_size(wanted) == span {
      true  => wanted,
      false => span,
    };
    self.write(object, codec::encode(recorded, TagStatus::Used));
    self.write(object + span - WORD_BYTES, 0);
    self.set_prev_free(object + span, false);
  }

  /// Updates the prev-free bit of the object at `object` if it is a normal used object.
  fn set_prev_free(&mut self, object: Offset, prev_free: bool) {
    let tag = self.read(object);
    if codec::is_normal_used(tag) {
      self.write(object, codec::with_prev_free(tag, prev_free));
    }
  }

  /// Validates the free object ending right before `object` and returns its offset and size.
  fn free_neighbour_before(&self, object: Offset, lower: Offset) -> Result<(Offset, Word)> {
    let trailing = self.read(object - WORD_BYTES);
    let size     = codec::tag_size(trailing);

    if !codec::is_free(trailing) || size < MIN_VARLEN_OBJECT_SIZE || size % OBJECT_ALIGNMENT != 0
        || size > object - lower {
      return Err(self.corrupt(object, "prev-free bit set but no free object precedes it"));
    }
    let previous = object - size;
    if self.read(previous) != trailing {
      return Err(self.corrupt(previous, "leading and trailing tags of free object differ"));
    }
    Ok((previous, size))
  }

  /// Validates the free object starting at `next` and returns its offset and size.
  fn free_neighbour_at(&self, next: Offset, upper: Offset) -> Result<(Offset, Word)> {
    let tag  = self.read(next);
    let size = codec::tag_size(tag);

    if size < MIN_VARLEN_OBJECT_SIZE || size % OBJECT_ALIGNMENT != 0 || size > upper - next {
      return Err(self.corrupt(next, "free object has an impossible size"));
    }
    if self.read(next + size - WORD_BYTES) != tag {
      return Err(self.corrupt(next, "leading and trailing tags of free object differ"));
    }
    Ok((next, size))
  }
}

impl AreaHeader {
  /// Wanted byte size recorded in the tag of the used object at `object`.
  pub fn object_size(self, memory: &SegmentMemory, object: Offset) -> Result<Word> {
    let tag = memory.try_read_word(object)
        .filter(|_| self.subarea_containing(memory, object).is_some())
        .ok_or(AllocationError::CorruptObject {
          offset: object,
          reason: "object lies outside every subarea of the area",
        })?;
    match codec::is_normal_used(tag) {
      true  => Ok(codec::tag_size(tag)),
      false => Err(AllocationError::CorruptObject { offset: object, reason: "tag does not mark a used object" }),
    }
  }
}
