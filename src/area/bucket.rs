/*!

Buckets of a variable-length area. A bucket holds the offset of the first object of a doubly linked list of free
objects, or zero when empty. Free objects link to each other through their second and third words:

```text
  ┌────────────┬────────────┬────────────┬─────────────┬────────────┐
  │ size | 01  │ next       │ prev       │ ...         │ size | 01  │
  └────────────┴────────────┴────────────┴─────────────┴────────────┘
```

The head of a list has `prev == 0`; its bucket is recomputed from its size with `bucket_index`.

*/

use crate::{
  area::Area,
  segment::{
    codec::{self, TagStatus},
    layout::*
  }
};

pub const NEXT_LINK: Offset = WORD_BYTES;
pub const PREV_LINK: Offset = 2 * WORD_BYTES;

/// Maps an object size in bytes to its bucket. Sizes below `EXACT_BUCKETS` get a bucket of their own; above that,
/// range bucket `i` covers sizes below `EXACT_BUCKETS * 2^(i+1)` and the last range bucket takes everything larger.
/// The mapping is monotonic in `size`.
pub fn bucket_index(size: Word) -> usize {
  if (size as usize) < EXACT_BUCKETS {
    return size as usize;
  }
  let mut upper = 2 * EXACT_BUCKETS as u64;
  for i in 0..VAR_BUCKETS {
    if (size as u64) < upper {
      return EXACT_BUCKETS + i;
    }
    upper *= 2;
  }
  EXACT_BUCKETS + VAR_BUCKETS - 1
}

impl Area<'_> {
  /// Marks `size` bytes at `object` free and pushes them onto the head of their bucket.
  pub(crate) fn push_free(&mut self, object: Offset, size: Word) {
    let bucket = bucket_index(size);
    let head   = self.header.bucket(self.memory, bucket);
    let tag    = codec::encode(size, TagStatus::Free);

    self.write(object, tag);
    self.write(object + size - WORD_BYTES, tag);
    self.write(object + NEXT_LINK, head);
    self.write(object + PREV_LINK, 0);
    if head != 0 {
      self.write(head + PREV_LINK, object);
    }
    self.header.set_bucket(self.memory, bucket, object);
  }

  /// Removes the free object at `object` from its bucket list. Its tags are left for the caller to overwrite.
  pub(crate) fn unlink_free(&mut self, object: Offset, size: Word) {
    let next = self.read(object + NEXT_LINK);
    let prev = self.read(object + PREV_LINK);

    match prev {
      0 => self.header.set_bucket(self.memory, bucket_index(size), next),
      _ => self.write(prev + NEXT_LINK, next),
    }
    if next != 0 {
      self.write(next + PREV_LINK, prev);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  #[test]
  fn exact_and_range_buckets() {
    assert_eq!(bucket_index(16), 16);
    assert_eq!(bucket_index(248), 248);
    assert_eq!(bucket_index(255), 255);
    assert_eq!(bucket_index(256), EXACT_BUCKETS);
    assert_eq!(bucket_index(511), EXACT_BUCKETS);
    assert_eq!(bucket_index(512), EXACT_BUCKETS + 1);
    assert_eq!(bucket_index(8160), EXACT_BUCKETS + 4);
    // 32-bit sizes never reach the top range buckets.
    assert_eq!(bucket_index(1 << 31), EXACT_BUCKETS + 23);
    assert_eq!(bucket_index(Word::MAX), EXACT_BUCKETS + 23);
  }

  #[test]
  fn range_buckets_stay_below_cache_slots() {
    for shift in 0..32 {
      assert!(bucket_index(1 << shift) < DV_BUCKET);
    }
  }

  proptest! {
    #[test]
    fn bucket_index_is_monotonic(a in any::<u32>(), b in any::<u32>()) {
      let (small, large) = if a <= b { (a, b) } else { (b, a) };
      prop_assert!(bucket_index(small) <= bucket_index(large));
    }
  }
}
