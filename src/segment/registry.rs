/*!

Process-wide table of segments by shared key. Creating a segment under a key publishes it; attaching by key hands out
another handle to the same segment. Every handle locks the whole segment, which is the exclusive lock the allocator
expects its callers to hold.

*/

use std::{
  collections::HashMap,
  sync::{Arc, Mutex, MutexGuard}
};

use once_cell::sync::Lazy;
use tracing::{debug, warn};

use crate::{
  error::{AllocationError, Result},
  segment::{layout::Word, Segment, SegmentConfig}
};

pub type SharedSegment = Arc<Mutex<Segment>>;

static SEGMENT_REGISTRY: Lazy<Mutex<HashMap<Word, SharedSegment>>> = Lazy::new(|| {
  Mutex::new(HashMap::new())
});

#[inline(always)]
fn acquire_registry() -> MutexGuard<'static, HashMap<Word, SharedSegment>> {
  // The table stays consistent even if a holder panicked: every update is a single insert or remove.
  SEGMENT_REGISTRY.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates a segment and registers it under `config.key`, which must be nonzero and not yet taken.
pub fn create_segment(config: &SegmentConfig) -> Result<SharedSegment> {
  if config.key == 0 {
    return Err(AllocationError::InvalidRequest("shared segments need a nonzero key".to_string()));
  }

  let mut registry = acquire_registry();
  if registry.contains_key(&config.key) {
    warn!(key = config.key, "segment key already in use");
    return Err(AllocationError::InvalidRequest(format!("segment key {} is already in use", config.key)));
  }

  let segment = Arc::new(Mutex::new(Segment::new(config)?));
  registry.insert(config.key, segment.clone());
  debug!(key = config.key, "registered segment");
  Ok(segment)
}

/// A handle to the segment registered under `key`.
pub fn attach_segment(key: Word) -> Option<SharedSegment> {
  acquire_registry().get(&key).cloned()
}

/// Unregisters the segment under `key`. Its memory is released once the last handle is dropped.
pub fn delete_segment(key: Word) -> bool {
  let removed = acquire_registry().remove(&key).is_some();
  if removed {
    debug!(key, "unregistered segment");
  }
  removed
}

#[cfg(test)]
mod tests {
  use super::*;

  // Keys are process-wide; each test uses its own.

  #[test]
  fn create_attach_delete() {
    let config  = SegmentConfig::new(1 << 20).with_key(0x5E61);
    let created = create_segment(&config).unwrap();
    let cell    = created.lock().unwrap().alloc_listcell().unwrap();

    let attached = attach_segment(0x5E61).unwrap();
    assert!(Arc::ptr_eq(&created, &attached));
    attached.lock().unwrap().free_listcell(cell).unwrap();

    assert!(delete_segment(0x5E61));
    assert!(!delete_segment(0x5E61));
    assert!(attach_segment(0x5E61).is_none());
    // Outstanding handles stay usable.
    assert!(created.lock().unwrap().is_valid());
  }

  #[test]
  fn keys_are_unique_and_nonzero() {
    let config = SegmentConfig::new(1 << 20).with_key(0x5E62);
    let _first = create_segment(&config).unwrap();
    assert!(matches!(create_segment(&config), Err(AllocationError::InvalidRequest(_))));
    assert!(matches!(create_segment(&SegmentConfig::new(1 << 20)), Err(AllocationError::InvalidRequest(_))));
    assert!(delete_segment(0x5E62));
  }
}
