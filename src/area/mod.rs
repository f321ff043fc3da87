/*!

Areas are the subdivisions of a segment, one per category of object. Each area owns up to `SUBAREA_ARRAY_SIZE`
subareas, added as the area runs out of space, plus the metadata its allocator needs:

 1. Fixed-length areas (list cells, short strings, words, double words) keep a singly linked freelist of equal-size
    cells. See `fixed`.
 2. Variable-length areas (data records, long strings) keep a bucket table of doubly linked free lists and a
    designated victim. See `varlen`.

The headers live inside the segment itself. `AreaHeader` and `SubareaHeader` are typed views holding nothing but the
header's offset; every field access goes through the segment memory.

*/

mod bucket;
mod fixed;
mod subarea;
mod varlen;

use std::fmt::{Display, Formatter};

use crate::{
  error::{AllocationError, Result},
  segment::{
    layout::*,
    memory::SegmentMemory
  }
};

pub use bucket::{bucket_index, NEXT_LINK, PREV_LINK};
pub use subarea::SENTINEL_BYTES;

/// The object categories of a segment, in the order their headers appear.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum AreaKind {
  DataRecord,
  LongString,
  ListCell,
  ShortString,
  Word,
  DoubleWord,
}

impl AreaKind {
  pub const ALL: [AreaKind; AREA_COUNT] = [
    AreaKind::DataRecord,
    AreaKind::LongString,
    AreaKind::ListCell,
    AreaKind::ShortString,
    AreaKind::Word,
    AreaKind::DoubleWord,
  ];

  pub fn index(self) -> usize {
    self as usize
  }

  /// Offset of this area's header from the segment start.
  pub fn header_offset(self) -> Offset {
    SEG_AREAS + self.index() as Word * AREA_HEADER_BYTES
  }

  /// Cell length in bytes for fixed-length areas, `None` for variable-length ones.
  pub fn fixed_length(self) -> Option<Word> {
    match self {
      AreaKind::DataRecord  => None,
      AreaKind::LongString  => None,
      AreaKind::ListCell    => Some(2 * WORD_BYTES),
      AreaKind::ShortString => Some(SHORTSTR_SIZE),
      AreaKind::Word        => Some(WORD_BYTES),
      AreaKind::DoubleWord  => Some(2 * WORD_BYTES),
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      AreaKind::DataRecord  => "datarec",
      AreaKind::LongString  => "longstr",
      AreaKind::ListCell    => "listcell",
      AreaKind::ShortString => "shortstr",
      AreaKind::Word        => "word",
      AreaKind::DoubleWord  => "doubleword",
    }
  }
}

impl Display for AreaKind {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// View of one subarea header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubareaHeader {
  at: Offset,
}

impl SubareaHeader {
  pub fn size(self, memory: &SegmentMemory) -> Word {
    memory.read_word(self.at + SUBAREA_SIZE)
  }

  /// Raw start of the subarea. Objects never start here; use `aligned_offset`.
  pub fn offset(self, memory: &SegmentMemory) -> Offset {
    memory.read_word(self.at + SUBAREA_OFFSET)
  }

  pub fn aligned_size(self, memory: &SegmentMemory) -> Word {
    memory.read_word(self.at + SUBAREA_ALIGNED_SIZE)
  }

  pub fn aligned_offset(self, memory: &SegmentMemory) -> Offset {
    memory.read_word(self.at + SUBAREA_ALIGNED_OFFSET)
  }

  /// One past the last usable byte, or `None` if the header describes a span past the end of the offset range.
  pub fn aligned_end(self, memory: &SegmentMemory) -> Option<Offset> {
    self.aligned_offset(memory).checked_add(self.aligned_size(memory))
  }

  pub fn contains(self, memory: &SegmentMemory, offset: Offset) -> bool {
    offset.checked_sub(self.aligned_offset(memory))
        .is_some_and(|distance| distance < self.aligned_size(memory))
  }

  /// First and one-past-last offset a variable-length object may occupy: the span between the markers. `None` if
  /// the span does not lie inside the segment memory.
  pub fn object_bounds(self, memory: &SegmentMemory) -> Option<(Offset, Offset)> {
    let end   = self.aligned_end(memory).filter(|end| *end as usize <= memory.size())?;
    let lower = self.aligned_offset(memory).checked_add(MIN_VARLEN_OBJECT_SIZE)?;
    let upper = end.checked_sub(MIN_VARLEN_OBJECT_SIZE)?;
    (lower <= upper).then_some((lower, upper))
  }

  fn write(self, memory: &mut SegmentMemory, size: Word, offset: Offset, aligned_size: Word, aligned_offset: Offset) {
    memory.write_word(self.at + SUBAREA_SIZE, size);
    memory.write_word(self.at + SUBAREA_OFFSET, offset);
    memory.write_word(self.at + SUBAREA_ALIGNED_SIZE, aligned_size);
    memory.write_word(self.at + SUBAREA_ALIGNED_OFFSET, aligned_offset);
  }
}

/// View of one area header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AreaHeader {
  at: Offset,
}

impl AreaHeader {
  pub fn of(kind: AreaKind) -> AreaHeader {
    AreaHeader { at: kind.header_offset() }
  }

  pub fn is_fixed(self, memory: &SegmentMemory) -> bool {
    memory.read_word(self.at + AREA_FIXED_LENGTH) != 0
  }

  pub fn object_length(self, memory: &SegmentMemory) -> Word {
    memory.read_word(self.at + AREA_OBJECT_LENGTH)
  }

  pub fn freelist(self, memory: &SegmentMemory) -> Offset {
    memory.read_word(self.at + AREA_FREELIST)
  }

  pub fn set_freelist(self, memory: &mut SegmentMemory, head: Offset) {
    memory.write_word(self.at + AREA_FREELIST, head)
  }

  pub fn last_subarea_index(self, memory: &SegmentMemory) -> usize {
    memory.read_word(self.at + AREA_LAST_SUBAREA) as usize
  }

  /// Number of subareas in use. Every initialised area owns at least one.
  pub fn subarea_count(self, memory: &SegmentMemory) -> usize {
    (self.last_subarea_index(memory) + 1).min(SUBAREA_ARRAY_SIZE)
  }

  /// The subarea header at `index`, if the array has room for it.
  pub fn subarea(self, index: usize) -> Option<SubareaHeader> {
    (index < SUBAREA_ARRAY_SIZE).then(|| SubareaHeader {
      at: self.at + AREA_SUBAREAS + index as Word * SUBAREA_HEADER_BYTES
    })
  }

  pub fn subareas(self, memory: &SegmentMemory) -> impl Iterator<Item = SubareaHeader> {
    (0..self.subarea_count(memory)).filter_map(move |index| self.subarea(index))
  }

  /// The subarea whose usable span contains `offset`.
  pub fn subarea_containing(self, memory: &SegmentMemory, offset: Offset) -> Option<SubareaHeader> {
    self.subareas(memory).find(|subarea| subarea.contains(memory, offset))
  }

  pub fn bucket(self, memory: &SegmentMemory, index: usize) -> Offset {
    assert!(index < BUCKET_TABLE_SIZE, "bucket index {} out of range", index);
    memory.read_word(self.at + AREA_BUCKETS + index as Word * WORD_BYTES)
  }

  pub fn set_bucket(self, memory: &mut SegmentMemory, index: usize, value: Word) {
    assert!(index < BUCKET_TABLE_SIZE, "bucket index {} out of range", index);
    memory.write_word(self.at + AREA_BUCKETS + index as Word * WORD_BYTES, value)
  }

  /// Offset and byte size of the designated victim, if the area has one.
  pub fn designated_victim(self, memory: &SegmentMemory) -> Option<(Offset, Word)> {
    match self.bucket(memory, DV_BUCKET) {
      0      => None,
      offset => Some((offset, self.bucket(memory, DV_SIZE_BUCKET))),
    }
  }
}

/// Mutable access to one area of a segment. Allocation, freeing and growth are implemented on this type in the
/// `fixed`, `varlen` and `subarea` modules.
pub(crate) struct Area<'s> {
  memory: &'s mut SegmentMemory,
  header: AreaHeader,
  kind  : AreaKind,
}

impl<'s> Area<'s> {
  pub(crate) fn new(memory: &'s mut SegmentMemory, kind: AreaKind) -> Self {
    Area {
      memory,
      header: AreaHeader::of(kind),
      kind,
    }
  }

  /// Writes a fresh header for this area and creates its first subarea.
  pub(crate) fn initialize(&mut self, subarea_size: Word) -> Result<()> {
    let (fixed, length) = match self.kind.fixed_length() {
      Some(length) => (1, length),
      None         => (0, 0),
    };
    let at = self.header.at;
    self.memory.write_word(at + AREA_FIXED_LENGTH, fixed);
    self.memory.write_word(at + AREA_OBJECT_LENGTH, length);
    self.memory.write_word(at + AREA_FREELIST, 0);
    self.memory.write_word(at + AREA_LAST_SUBAREA, 0);
    for index in 0..BUCKET_TABLE_SIZE {
      self.header.set_bucket(self.memory, index, 0);
    }

    let subarea = self.create_subarea(0, subarea_size)?;
    self.initialize_free_span(subarea);
    Ok(())
  }

  #[inline(always)]
  pub(crate) fn is_fixed(&self) -> bool {
    self.header.is_fixed(self.memory)
  }

  /// Frees the object at `offset` with the strategy this area uses.
  pub(crate) fn free(&mut self, offset: Offset) -> Result<()> {
    match self.is_fixed() {
      true  => self.free_fixed(offset),
      false => self.free_varlen(offset),
    }
  }

  #[inline(always)]
  fn read(&self, offset: Offset) -> Word {
    self.memory.read_word(offset)
  }

  #[inline(always)]
  fn write(&mut self, offset: Offset, value: Word) {
    self.memory.write_word(offset, value)
  }

  fn corrupt(&self, offset: Offset, reason: &'static str) -> AllocationError {
    tracing::warn!(area = %self.kind, offset, reason, "rejected corrupt object");
    AllocationError::CorruptObject { offset, reason }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn area_headers_do_not_overlap() {
    let mut previous_end = SEG_AREAS;
    for kind in AreaKind::ALL {
      assert_eq!(kind.header_offset(), previous_end);
      previous_end = kind.header_offset() + AREA_HEADER_BYTES;
    }
    assert_eq!(previous_end, SEGMENT_HEADER_BYTES);
  }

  #[test]
  fn subarea_array_is_bounded() {
    let header = AreaHeader::of(AreaKind::ListCell);
    assert!(header.subarea(SUBAREA_ARRAY_SIZE - 1).is_some());
    assert!(header.subarea(SUBAREA_ARRAY_SIZE).is_none());
  }

  #[test]
  fn wrapping_subarea_spans_do_not_overflow() {
    let mut memory = SegmentMemory::new(SEGMENT_HEADER_BYTES as usize).unwrap();
    let subarea    = AreaHeader::of(AreaKind::DataRecord).subarea(0).unwrap();
    subarea.write(&mut memory, 0x20000, 0xFFFF0000, 0x20000, 0xFFFF0000);

    assert_eq!(subarea.aligned_end(&memory), None);
    assert_eq!(subarea.object_bounds(&memory), None);
    assert!(subarea.contains(&memory, 0xFFFF0010));
    assert!(!subarea.contains(&memory, 0xFFFEFFF0));
  }

  #[test]
  fn fixed_lengths() {
    assert_eq!(AreaKind::ListCell.fixed_length(), Some(8));
    assert_eq!(AreaKind::ShortString.fixed_length(), Some(32));
    assert_eq!(AreaKind::Word.fixed_length(), Some(4));
    assert_eq!(AreaKind::DoubleWord.fixed_length(), Some(8));
    assert_eq!(AreaKind::DataRecord.fixed_length(), None);
    assert_eq!(AreaKind::LongString.fixed_length(), None);
  }
}
