/*!

Backing storage for a segment. This is the only place where segment memory is reinterpreted: everything above it
reads and writes whole words at offsets through bounds-checked accessors.

*/

use std::{
  alloc::{alloc_zeroed, dealloc, Layout},
  ptr::NonNull,
  slice
};

use crate::{
  error::{AllocationError, Result},
  segment::layout::{Offset, Word, SUBAREA_ALIGNMENT_BYTES, WORD_BYTES}
};

/// One contiguous, zero-initialised block of memory holding a whole segment.
pub struct SegmentMemory {
  base: NonNull<u8>,
  size: usize,
}

// The memory is owned exclusively; shared access goes through a lock.
unsafe impl Send for SegmentMemory {}

impl SegmentMemory {
  pub fn new(size: usize) -> Result<Self> {
    if size == 0 || size > Word::MAX as usize {
      return Err(AllocationError::InvalidRequest(format!("segment size {} is out of range", size)));
    }
    let layout = Self::layout(size)?;
    let chunk  = unsafe { alloc_zeroed(layout) };

    match NonNull::new(chunk) {
      Some(base) => Ok(SegmentMemory { base, size }),
      None       => Err(AllocationError::SegmentExhausted { requested: size, available: 0 }),
    }
  }

  /// Copies an existing segment image, e.g. one produced by another process, into freshly allocated memory.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    let mut memory = SegmentMemory::new(bytes.len())?;
    memory.as_bytes_mut().copy_from_slice(bytes);
    Ok(memory)
  }

  fn layout(size: usize) -> Result<Layout> {
    Layout::from_size_align(size, SUBAREA_ALIGNMENT_BYTES as usize)
        .map_err(|e| AllocationError::InvalidRequest(e.to_string()))
  }

  #[inline(always)]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline(always)]
  pub fn base(&self) -> *const u8 {
    self.base.as_ptr()
  }

  pub fn as_bytes(&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.base.as_ptr(), self.size) }
  }

  pub fn as_bytes_mut(&mut self) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.size) }
  }

  /// True if a whole word can be read at `offset`.
  #[inline(always)]
  pub fn holds_word(&self, offset: Offset) -> bool {
    offset % WORD_BYTES == 0 && (offset as usize) + (WORD_BYTES as usize) <= self.size
  }

  /// Reads the word at `offset`.
  ///
  /// Panics if `offset` is misaligned or outside the segment. Allocator code only follows offsets it has validated;
  /// use `try_read_word` for offsets of unknown provenance.
  #[inline(always)]
  pub fn read_word(&self, offset: Offset) -> Word {
    assert!(self.holds_word(offset), "word read at offset {} outside segment of {} bytes", offset, self.size);
    unsafe { self.base.as_ptr().add(offset as usize).cast::<Word>().read() }
  }

  #[inline(always)]
  pub fn try_read_word(&self, offset: Offset) -> Option<Word> {
    match self.holds_word(offset) {
      true  => Some(unsafe { self.base.as_ptr().add(offset as usize).cast::<Word>().read() }),
      false => None,
    }
  }

  #[inline(always)]
  pub fn write_word(&mut self, offset: Offset, value: Word) {
    assert!(self.holds_word(offset), "word write at offset {} outside segment of {} bytes", offset, self.size);
    unsafe { self.base.as_ptr().add(offset as usize).cast::<Word>().write(value) }
  }

  /// The `len` bytes starting at `offset`, if they lie inside the segment.
  pub fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
    let start = offset as usize;
    self.as_bytes().get(start..start.checked_add(len)?)
  }

  pub fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]> {
    let start = offset as usize;
    self.as_bytes_mut().get_mut(start..start.checked_add(len)?)
  }
}

impl Drop for SegmentMemory {
  fn drop(&mut self) {
    // The layout was valid when the memory was allocated.
    if let Ok(layout) = Self::layout(self.size) {
      unsafe { dealloc(self.base.as_ptr(), layout) }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn zeroed_and_aligned() {
    let memory = SegmentMemory::new(4096).unwrap();
    assert_eq!(memory.base() as usize % SUBAREA_ALIGNMENT_BYTES as usize, 0);
    assert!(memory.as_bytes().iter().all(|b| *b == 0));
  }

  #[test]
  fn word_access() {
    let mut memory = SegmentMemory::new(64).unwrap();
    memory.write_word(8, 0xDEADBEEF);
    memory.write_word(60, 7);
    assert_eq!(memory.read_word(8), 0xDEADBEEF);
    assert_eq!(memory.read_word(60), 7);
    assert_eq!(memory.try_read_word(60), Some(7));
    assert_eq!(memory.try_read_word(64), None);
    assert_eq!(memory.try_read_word(6), None);
  }

  #[test]
  #[should_panic]
  fn write_past_end_panics() {
    let mut memory = SegmentMemory::new(64).unwrap();
    memory.write_word(64, 1);
  }

  #[test]
  fn byte_ranges() {
    let mut memory = SegmentMemory::new(32).unwrap();
    memory.bytes_mut(4, 3).unwrap().copy_from_slice(b"abc");
    assert_eq!(memory.bytes(4, 3), Some(&b"abc"[..]));
    assert!(memory.bytes(30, 3).is_none());

    let copy = SegmentMemory::from_bytes(memory.as_bytes()).unwrap();
    assert_ne!(copy.base(), memory.base());
    assert_eq!(copy.as_bytes(), memory.as_bytes());
  }

  #[test]
  fn rejects_empty() {
    assert!(SegmentMemory::new(0).is_err());
  }
}
