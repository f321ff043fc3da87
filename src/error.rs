//! Errors returned by allocation entry points.

use thiserror::Error;

use crate::{
  area::AreaKind,
  segment::layout::Offset
};

/// A failed allocate or free leaves every structure in the segment exactly as it was before the call.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum AllocationError {
  /// The segment has no contiguous free region large enough for a new subarea.
  #[error("segment exhausted: no contiguous region of {requested} bytes ({available} bytes left)")]
  SegmentExhausted { requested: usize, available: usize },

  /// The memory does not hold a segment this crate can interpret.
  #[error("invalid segment: {0}")]
  InvalidSegment(String),

  /// A tag read while freeing does not satisfy the boundary-tag invariants.
  #[error("corrupt object at offset {offset}: {reason}")]
  CorruptObject { offset: Offset, reason: &'static str },

  /// The area's subarea array is full.
  #[error("area {area} cannot grow past {capacity} subareas")]
  CapacityExceeded { area: AreaKind, capacity: usize },

  /// The request itself is malformed: zero or oversized counts, wrong kind of area, bad configuration.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, AllocationError>;
