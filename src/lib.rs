/*!

Heap allocation for an in-memory database kept in one contiguous, offset-addressed segment.

A `Segment` holds six areas, one per object category. Four of them hand out fixed-length cells from singly linked
freelists; the other two allocate variable-length objects with boundary tags, size-class buckets and a designated
victim. Every reference inside the segment is an offset, so a segment image can be relocated and attached again.

```rust
use wgheap::{AreaKind, Segment};

let mut segment = Segment::init(1, 1 << 20)?;
let record      = segment.alloc_datarec(16)?;
let cell        = segment.alloc_listcell()?;
segment.free_object(AreaKind::DataRecord, record)?;
segment.free_listcell(cell)?;
assert!(segment.check().is_ok());
# Ok::<(), wgheap::AllocationError>(())
```

The allocator is not internally synchronised. Callers hold one exclusive lock over the whole segment for every call;
`segment::registry` keeps shared segments behind such a lock.

*/

pub mod area;
pub mod check;
pub mod error;
pub mod segment;

pub use area::{AreaKind, bucket_index};
pub use check::{AreaStats, CheckReport, Violation};
pub use error::{AllocationError, Result};
pub use segment::{
  config::SegmentConfig,
  layout::{Offset, Word},
  memory::SegmentMemory,
  registry::{attach_segment, create_segment, delete_segment, SharedSegment},
  Segment
};
