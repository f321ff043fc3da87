//! Parameters for creating a new segment.

use crate::{
  error::{AllocationError, Result},
  segment::layout::{Word, MINIMAL_SUBAREA_SIZE, INITIAL_SUBAREA_SIZE, SEGMENT_HEADER_BYTES}
};

pub const DEFAULT_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentConfig {
  /// Total segment size in bytes, headers included.
  pub size               : usize,
  /// Shared key recorded in the header; zero means none.
  pub key                : Word,
  /// Size of the first subarea of each fixed-length area.
  pub fixed_subarea_size : Word,
  /// Size of the first subarea of each variable-length area.
  pub varlen_subarea_size: Word,
}

impl Default for SegmentConfig {
  fn default() -> Self {
    SegmentConfig {
      size               : DEFAULT_SEGMENT_SIZE,
      key                : 0,
      fixed_subarea_size : INITIAL_SUBAREA_SIZE,
      varlen_subarea_size: INITIAL_SUBAREA_SIZE,
    }
  }
}

impl SegmentConfig {
  pub fn new(size: usize) -> Self {
    SegmentConfig { size, ..SegmentConfig::default() }
  }

  pub fn with_key(mut self, key: Word) -> Self {
    self.key = key;
    self
  }

  pub fn with_fixed_subarea_size(mut self, size: Word) -> Self {
    self.fixed_subarea_size = size;
    self
  }

  pub fn with_varlen_subarea_size(mut self, size: Word) -> Self {
    self.varlen_subarea_size = size;
    self
  }

  pub fn validate(&self) -> Result<()> {
    if self.size > Word::MAX as usize {
      return Err(AllocationError::InvalidRequest(
        format!("segment size {} does not fit in a {}-bit offset", self.size, Word::BITS)
      ));
    }
    if self.size < SEGMENT_HEADER_BYTES as usize {
      return Err(AllocationError::InvalidRequest(
        format!("segment size {} cannot hold the {} byte header", self.size, SEGMENT_HEADER_BYTES)
      ));
    }
    if self.fixed_subarea_size < MINIMAL_SUBAREA_SIZE || self.varlen_subarea_size < MINIMAL_SUBAREA_SIZE {
      return Err(AllocationError::InvalidRequest(
        format!("initial subareas must be at least {} bytes", MINIMAL_SUBAREA_SIZE)
      ));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder() {
    let config = SegmentConfig::new(1 << 20).with_key(42).with_varlen_subarea_size(16384);
    assert_eq!(config.size, 1 << 20);
    assert_eq!(config.key, 42);
    assert_eq!(config.fixed_subarea_size, INITIAL_SUBAREA_SIZE);
    assert_eq!(config.varlen_subarea_size, 16384);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn rejects_bad_sizes() {
    assert!(SegmentConfig::new(100).validate().is_err());
    assert!(SegmentConfig::new(1 << 20).with_fixed_subarea_size(4096).validate().is_err());
    assert!(SegmentConfig::new(Word::MAX as usize + 1).validate().is_err());
  }
}
