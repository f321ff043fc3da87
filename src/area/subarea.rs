/*!

Subarea management: carving raw blocks out of the segment, registering them with an area, marking their bounds and
turning their usable span into allocatable space.

A variable-length subarea looks like this once initialised:

```text
  aligned_offset                                                   aligned_end
  ┌──────────┬──────────────────────────────────────────────────┬──────────┐
  │ start    │ designated victim                                │ end      │
  │ 11 | 0   │ 11 | 1                                           │ 11 | 2   │
  └──────────┴──────────────────────────────────────────────────┴──────────┘
   MIN_VARLEN_OBJECT_SIZE                                        MIN_VARLEN_OBJECT_SIZE
```

A fixed-length subarea carries no markers: its whole aligned span is threaded into cells.

*/

use tracing::{debug, warn};

use crate::{
  area::{Area, SubareaHeader},
  error::{AllocationError, Result},
  segment::{
    codec::{self, SpecialKind, TagStatus},
    layout::*
  }
};

/// Bytes of every variable-length subarea taken by its start and end markers.
pub const SENTINEL_BYTES: Word = 2 * MIN_VARLEN_OBJECT_SIZE;

impl Area<'_> {
  /// Carves a block of `requested` bytes from the segment's free region and registers it as subarea `index`.
  /// Variable-length subareas get their start and end markers. Nothing is modified when an error is returned.
  pub(crate) fn create_subarea(&mut self, index: usize, requested: Word) -> Result<SubareaHeader> {
    if requested < MINIMAL_SUBAREA_SIZE {
      return Err(AllocationError::InvalidRequest(
        format!("subarea of {} bytes is below the minimum of {}", requested, MINIMAL_SUBAREA_SIZE)
      ));
    }
    let subarea = self.header.subarea(index).ok_or(AllocationError::CapacityExceeded {
      area    : self.kind,
      capacity: SUBAREA_ARRAY_SIZE,
    })?;

    let segment_size = self.read(SEG_SIZE);
    let offset       = self.read(SEG_FREE);
    let available    = segment_size.saturating_sub(offset);
    if requested > available {
      warn!(area = %self.kind, requested, available, "segment cannot host a new subarea");
      return Err(AllocationError::SegmentExhausted {
        requested: requested as usize,
        available: available as usize,
      });
    }

    let aligned_offset = align_up(offset, SUBAREA_ALIGNMENT_BYTES);
    let aligned_size   = align_down(requested - (aligned_offset - offset), OBJECT_ALIGNMENT);
    let next_free      = align_up(offset + requested, SUBAREA_ALIGNMENT_BYTES).min(segment_size);

    self.write(SEG_FREE, next_free);
    subarea.write(self.memory, requested, offset, aligned_size, aligned_offset);
    self.write(self.header.at + AREA_LAST_SUBAREA, index as Word);

    if !self.is_fixed() {
      self.write_special(aligned_offset, MIN_VARLEN_OBJECT_SIZE, SpecialKind::Start);
      self.write_special(aligned_offset + aligned_size - MIN_VARLEN_OBJECT_SIZE, MIN_VARLEN_OBJECT_SIZE, SpecialKind::End);
    }

    debug!(area = %self.kind, index, offset, size = requested, "created subarea");
    Ok(subarea)
  }

  /// Makes the usable span of a freshly created subarea allocatable: the span between the markers becomes the
  /// area's designated victim, or the cells of a fixed-length subarea are threaded onto the freelist.
  pub(crate) fn initialize_free_span(&mut self, subarea: SubareaHeader) {
    let start = subarea.aligned_offset(self.memory);
    let size  = subarea.aligned_size(self.memory);

    match self.is_fixed() {
      true => {
        self.thread_freelist(start, size);
      }
      false => {
        self.set_designated_victim(start + MIN_VARLEN_OBJECT_SIZE, size - SENTINEL_BYTES);
      }
    }
  }

  /// Size of the next subarea: double the last one, doubled further until it hosts `needed` bytes. When the segment
  /// cannot host that, the size is halved down towards `needed`.
  pub(crate) fn next_subarea_size(&self, needed: Word) -> Result<Word> {
    let segment_size = self.read(SEG_SIZE);
    let available    = segment_size.saturating_sub(self.read(SEG_FREE));
    let floor        = needed.max(MINIMAL_SUBAREA_SIZE);

    if floor > available {
      warn!(area = %self.kind, needed = floor, available, "segment cannot host a new subarea");
      return Err(AllocationError::SegmentExhausted {
        requested: floor as usize,
        available: available as usize,
      });
    }

    let last = self.header.subarea(self.header.last_subarea_index(self.memory))
        .map_or(INITIAL_SUBAREA_SIZE, |subarea| subarea.size(self.memory));
    let mut size = last.saturating_mul(2).max(MINIMAL_SUBAREA_SIZE);
    while size < floor {
      size = size.saturating_mul(2);
    }
    while size > available && size / 2 >= floor {
      size /= 2;
    }

    Ok(size.min(available).max(floor))
  }

  /// The index the next subarea would take, if the array has room for it.
  pub(crate) fn next_subarea_index(&self) -> Result<usize> {
    let index = self.header.last_subarea_index(self.memory) + 1;
    match index < SUBAREA_ARRAY_SIZE {
      true  => Ok(index),
      false => {
        warn!(area = %self.kind, capacity = SUBAREA_ARRAY_SIZE, "subarea array is full");
        Err(AllocationError::CapacityExceeded { area: self.kind, capacity: SUBAREA_ARRAY_SIZE })
      }
    }
  }

  pub(crate) fn write_special(&mut self, offset: Offset, size: Word, kind: SpecialKind) {
    self.write(offset, codec::encode(size, TagStatus::Special));
    self.write(offset + WORD_BYTES, kind.marker());
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    area::{AreaHeader, AreaKind},
    segment::{Segment, SegmentConfig}
  };

  fn small_segment(size: usize) -> Segment {
    Segment::new(&SegmentConfig::new(size)).unwrap()
  }

  #[test]
  fn varlen_subarea_markers() {
    let segment = small_segment(256 * 1024);
    let memory  = segment.memory();
    let header  = AreaHeader::of(AreaKind::DataRecord);
    let subarea = header.subarea(0).unwrap();

    let start = subarea.aligned_offset(memory);
    let end   = subarea.aligned_end(memory).unwrap() - MIN_VARLEN_OBJECT_SIZE;
    assert_eq!(subarea.aligned_size(memory), INITIAL_SUBAREA_SIZE);
    assert_eq!(start % SUBAREA_ALIGNMENT_BYTES, 0);
    assert!(start >= subarea.offset(memory));

    assert!(codec::is_special(memory.read_word(start)));
    assert_eq!(memory.read_word(start + WORD_BYTES), SPECIAL_START);
    assert!(codec::is_special(memory.read_word(end)));
    assert_eq!(memory.read_word(end + WORD_BYTES), SPECIAL_END);

    let (dv, dv_size) = header.designated_victim(memory).unwrap();
    assert_eq!(dv, start + MIN_VARLEN_OBJECT_SIZE);
    assert_eq!(dv_size, INITIAL_SUBAREA_SIZE - SENTINEL_BYTES);
    assert_eq!(memory.read_word(dv + WORD_BYTES), SPECIAL_DV);
  }

  #[test]
  fn refuses_small_subareas() {
    let mut segment = small_segment(256 * 1024);
    let mut area    = Area::new(segment.memory_mut(), AreaKind::DataRecord);
    let result      = area.create_subarea(1, MINIMAL_SUBAREA_SIZE - 8);
    assert!(matches!(result, Err(AllocationError::InvalidRequest(_))));
  }

  #[test]
  fn exhaustion_leaves_segment_untouched() {
    let mut segment = small_segment(SEGMENT_HEADER_BYTES as usize + 6 * INITIAL_SUBAREA_SIZE as usize + 1024);
    let before      = segment.memory().as_bytes().to_vec();
    let mut area    = Area::new(segment.memory_mut(), AreaKind::LongString);

    let result = area.create_subarea(1, MINIMAL_SUBAREA_SIZE);
    assert!(matches!(result, Err(AllocationError::SegmentExhausted { .. })));
    assert!(matches!(area.next_subarea_size(64), Err(AllocationError::SegmentExhausted { .. })));
    assert_eq!(segment.memory().as_bytes(), &before[..]);
  }

  #[test]
  fn capacity_is_checked() {
    let mut segment = small_segment(256 * 1024);
    let mut area    = Area::new(segment.memory_mut(), AreaKind::ListCell);
    let result      = area.create_subarea(SUBAREA_ARRAY_SIZE, MINIMAL_SUBAREA_SIZE);
    assert!(matches!(result, Err(AllocationError::CapacityExceeded { capacity: SUBAREA_ARRAY_SIZE, .. })));
  }

  #[test]
  fn full_subarea_array_refuses_extension_without_writing() {
    let mut segment = small_segment(256 * 1024);
    for kind in [AreaKind::ListCell, AreaKind::DataRecord] {
      assert!(segment.write_word(kind.header_offset() + AREA_LAST_SUBAREA, SUBAREA_ARRAY_SIZE as Word - 1));
    }

    let mut area = Area::new(segment.memory_mut(), AreaKind::ListCell);
    for _ in 0..INITIAL_SUBAREA_SIZE / 8 {
      area.allocate_fixed().unwrap();
    }
    let before = segment.memory().as_bytes().to_vec();
    let mut area = Area::new(segment.memory_mut(), AreaKind::ListCell);
    let result   = area.allocate_fixed();
    assert!(matches!(
      result,
      Err(AllocationError::CapacityExceeded { area: AreaKind::ListCell, capacity: SUBAREA_ARRAY_SIZE })
    ));
    assert_eq!(segment.memory().as_bytes(), &before[..]);

    // The request outgrows the first subarea's dv.
    let mut area = Area::new(segment.memory_mut(), AreaKind::DataRecord);
    let result   = area.allocate_words(3000);
    assert!(matches!(
      result,
      Err(AllocationError::CapacityExceeded { area: AreaKind::DataRecord, capacity: SUBAREA_ARRAY_SIZE })
    ));
    assert_eq!(segment.memory().as_bytes(), &before[..]);
  }

  #[test]
  fn growth_doubles_then_backs_off() {
    let mut segment = small_segment(256 * 1024);
    let area        = Area::new(segment.memory_mut(), AreaKind::DataRecord);

    assert_eq!(area.next_subarea_size(64).unwrap(), 2 * INITIAL_SUBAREA_SIZE);
    assert_eq!(area.next_subarea_size(40_000).unwrap(), 64 * 1024);

    // Under 200 KiB remain, so a doubled 256 KiB subarea falls back to what fits.
    let available = segment.size() as Word - segment.free_offset();
    let area      = Area::new(segment.memory_mut(), AreaKind::DataRecord);
    let size      = area.next_subarea_size(150_000).unwrap();
    assert!(size >= 150_000 && size <= available);
  }
}
