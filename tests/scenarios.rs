use std::{sync::Arc, thread};

use rand::{rngs::StdRng, Rng, SeedableRng};

use wgheap::{
  attach_segment,
  create_segment,
  delete_segment,
  AllocationError,
  AreaKind,
  Offset,
  Segment,
  SegmentConfig,
  SegmentMemory,
  Word,
};

const CELLS_PER_SUBAREA: usize = 8192 / 8;

fn assert_clean(segment: &Segment) {
  let report = segment.check();
  assert!(report.is_ok(), "{}", report);
}

/// Every byte of every area is used, free, in the dv or a marker.
fn assert_conserved(segment: &Segment) {
  for kind in AreaKind::ALL {
    let stats = segment.area_stats(kind);
    assert_eq!(
      stats.used_bytes + stats.free_bytes + stats.dv_bytes + stats.sentinel_bytes,
      stats.usable_bytes,
      "{}: {:?}",
      kind,
      stats
    );
  }
}

#[test]
fn separated_holes_are_reused_before_the_designated_victim() {
  let mut segment = Segment::init(0, 1 << 20).unwrap();

  let first  = segment.alloc_datarec(16).unwrap();
  let second = segment.alloc_datarec(32).unwrap();
  let third  = segment.alloc_datarec(16).unwrap();
  let _guard = segment.alloc_datarec(4).unwrap();
  assert_eq!(second, first + 64);
  assert_eq!(third, second + 128);

  segment.free_datarec(first).unwrap();
  segment.free_datarec(third).unwrap();

  // Not adjacent, so nothing merges.
  let stats = segment.area_stats(AreaKind::DataRecord);
  assert_eq!(stats.free_objects, 2);
  assert_eq!(stats.free_bytes, 128);
  let dv_bytes = stats.dv_bytes;

  // The last hole freed is the head of its exact bucket.
  assert_eq!(segment.alloc_datarec(16).unwrap(), third);
  assert_eq!(segment.area_stats(AreaKind::DataRecord).dv_bytes, dv_bytes);
  assert_clean(&segment);

  // The middle object merges with the hole left at `first`.
  segment.free_datarec(second).unwrap();
  let stats = segment.area_stats(AreaKind::DataRecord);
  assert_eq!(stats.free_objects, 1);
  assert_eq!(stats.free_bytes, 192);
  assert_clean(&segment);
}

#[test]
fn fixed_area_extends_once_when_exhausted() {
  let mut segment = Segment::init(0, 1 << 20).unwrap();
  assert_eq!(segment.freelist_len(AreaKind::ListCell).unwrap(), CELLS_PER_SUBAREA);

  for _ in 0..CELLS_PER_SUBAREA {
    segment.alloc_listcell().unwrap();
  }
  assert_eq!(segment.freelist_len(AreaKind::ListCell).unwrap(), 0);
  assert_eq!(segment.subarea_count(AreaKind::ListCell), 1);

  segment.alloc_listcell().unwrap();
  assert_eq!(segment.subarea_count(AreaKind::ListCell), 2);
  assert_eq!(
    segment.freelist_len(AreaKind::ListCell).unwrap(),
    CELLS_PER_SUBAREA + 2 * CELLS_PER_SUBAREA - (CELLS_PER_SUBAREA + 1)
  );
  assert_clean(&segment);
}

#[test]
fn exhausted_segment_is_left_untouched() {
  let size        = wgheap::segment::layout::SEGMENT_HEADER_BYTES as usize + 7 * 8192;
  let mut segment = Segment::new(&SegmentConfig::new(size)).unwrap();
  let before      = segment.memory().as_bytes().to_vec();

  let result = segment.alloc_longstr(4096);
  assert!(matches!(result, Err(AllocationError::SegmentExhausted { .. })), "{:?}", result);
  assert_eq!(segment.memory().as_bytes(), &before[..]);
  assert_clean(&segment);
}

#[test]
fn relocated_segment_behaves_identically() {
  let mut original = Segment::init(9, 1 << 20).unwrap();
  let records: Vec<Offset> = (1..20).map(|words| original.alloc_datarec(words * 3).unwrap()).collect();
  let strings: Vec<Offset> = (0..10).map(|_| original.alloc_shortstr().unwrap()).collect();
  for record in records.iter().step_by(2) {
    original.free_datarec(*record).unwrap();
  }
  original.bytes_mut(strings[0], 3).unwrap().copy_from_slice(b"abc");

  let image     = SegmentMemory::from_bytes(original.memory().as_bytes()).unwrap();
  let mut moved = Segment::attach(image).unwrap();
  assert_ne!(moved.memory().base(), original.memory().base());
  assert_eq!(moved.initial_address(), original.initial_address());
  assert_eq!(moved.key(), 9);
  assert_eq!(moved.bytes(strings[0], 3), Some(&b"abc"[..]));
  assert_clean(&moved);

  for record in records.iter().skip(1).step_by(2) {
    original.free_datarec(*record).unwrap();
    moved.free_datarec(*record).unwrap();
  }
  for words in [5, 40, 2, 700] {
    assert_eq!(original.alloc_datarec(words).unwrap(), moved.alloc_datarec(words).unwrap());
  }
  assert_eq!(original.alloc_shortstr().unwrap(), moved.alloc_shortstr().unwrap());
  assert_eq!(original.memory().as_bytes(), moved.memory().as_bytes());
}

#[test]
fn foreign_images_are_refused() {
  let zeroes = SegmentMemory::new(1 << 16).unwrap();
  assert!(matches!(Segment::attach(zeroes), Err(AllocationError::InvalidSegment(_))));

  let mut segment = Segment::init(0, 1 << 20).unwrap();
  segment.write_word(wgheap::segment::layout::SEG_VERSION, 0x0200);
  let image = SegmentMemory::from_bytes(segment.memory().as_bytes()).unwrap();
  assert!(matches!(Segment::attach(image), Err(AllocationError::InvalidSegment(_))));
}

#[test]
fn images_with_damaged_area_headers_are_refused() {
  use wgheap::segment::layout::*;

  let refused = |damage: &dyn Fn(&mut Segment)| {
    let mut segment = Segment::init(0, 1 << 20).unwrap();
    segment.alloc_datarec(4).unwrap();
    damage(&mut segment);
    let image = SegmentMemory::from_bytes(segment.memory().as_bytes()).unwrap();
    matches!(Segment::attach(image), Err(AllocationError::InvalidSegment(_)))
  };
  let data_subarea = AreaKind::DataRecord.header_offset() + AREA_SUBAREAS;
  let long_subarea = AreaKind::LongString.header_offset() + AREA_SUBAREAS;

  // A span that wraps around the end of the address space.
  assert!(refused(&|segment| {
    segment.write_word(data_subarea + SUBAREA_ALIGNED_OFFSET, 0xFFFF_0000);
    segment.write_word(data_subarea + SUBAREA_ALIGNED_SIZE, 0x2_0000);
  }));
  assert!(refused(&|segment| {
    segment.write_word(AreaKind::ListCell.header_offset() + AREA_OBJECT_LENGTH, 16);
  }));
  assert!(refused(&|segment| {
    segment.write_word(AreaKind::Word.header_offset() + AREA_LAST_SUBAREA, SUBAREA_ARRAY_SIZE as Word);
  }));
  assert!(refused(&|segment| {
    let start = segment.read_word(data_subarea + SUBAREA_ALIGNED_OFFSET).unwrap();
    segment.write_word(long_subarea + SUBAREA_ALIGNED_OFFSET, start);
  }));
  assert!(!refused(&|_| {}));
}

#[test]
fn free_in_a_wrapping_subarea_is_an_error() {
  use wgheap::segment::layout::*;

  let mut segment = Segment::init(0, 1 << 20).unwrap();
  let subarea     = AreaKind::DataRecord.header_offset() + AREA_SUBAREAS;
  segment.write_word(subarea + SUBAREA_ALIGNED_OFFSET, 0xFFFF_0000);
  segment.write_word(subarea + SUBAREA_ALIGNED_SIZE, 0x2_0000);

  let result = segment.free_datarec(0xFFFF_0010);
  assert!(matches!(result, Err(AllocationError::CorruptObject { .. })), "{:?}", result);
}

struct Live {
  kind  : AreaKind,
  offset: Offset,
  stamp : Option<Word>,
}

#[test]
fn random_workload_keeps_every_invariant() {
  let mut rng     = StdRng::seed_from_u64(0x5EED);
  let mut segment = Segment::init(0, 8 << 20).unwrap();
  let mut live: Vec<Live> = Vec::new();

  for step in 0..6000u32 {
    if live.is_empty() || rng.random_bool(0.55) {
      let kind   = AreaKind::ALL[rng.random_range(0..AreaKind::ALL.len())];
      let result = match kind.fixed_length() {
        Some(_) => segment.allocate_fixed(kind).map(|offset| (offset, true)),
        None    => {
          let words = match rng.random_bool(0.05) {
            true  => rng.random_range(1000..5000),
            false => rng.random_range(1..120),
          };
          segment.allocate_words(kind, words).map(|offset| (offset, words > 1))
        }
      };
      let (offset, has_payload) = result.unwrap();

      // Fixed cells are stamped in their first word, variable objects right after the tag.
      let stamp = has_payload.then_some(step);
      if let Some(stamp) = stamp {
        let at = if kind.fixed_length().is_some() { offset } else { offset + 4 };
        assert!(segment.write_word(at, stamp));
      }
      live.push(Live { kind, offset, stamp });
    } else {
      let victim = live.swap_remove(rng.random_range(0..live.len()));
      if let Some(stamp) = victim.stamp {
        let at = if victim.kind.fixed_length().is_some() { victim.offset } else { victim.offset + 4 };
        assert_eq!(segment.read_word(at), Some(stamp), "object at {} was overwritten", victim.offset);
      }
      segment.free_object(victim.kind, victim.offset).unwrap();
    }

    if step % 500 == 0 {
      assert_clean(&segment);
      assert_conserved(&segment);
      for kind in AreaKind::ALL {
        let expected = live.iter().filter(|object| object.kind == kind).count();
        assert_eq!(segment.area_stats(kind).used_objects, expected, "{}", kind);
      }
    }
  }

  for object in live.drain(..) {
    segment.free_object(object.kind, object.offset).unwrap();
  }
  assert_clean(&segment);
  assert_conserved(&segment);
  for kind in AreaKind::ALL {
    let stats = segment.area_stats(kind);
    assert_eq!(stats.used_bytes, 0, "{}", kind);
    assert_eq!(stats.used_objects, 0, "{}", kind);
  }
}

#[test]
fn registry_shares_one_locked_segment_between_threads() {
  let key    = 0xA110C;
  let shared = create_segment(&SegmentConfig::new(1 << 20).with_key(key)).unwrap();

  let workers: Vec<_> = (0..4)
      .map(|_| {
        thread::spawn(move || {
          let segment = attach_segment(key).unwrap();
          for _ in 0..200 {
            let mut guard = segment.lock().unwrap();
            let cell      = guard.alloc_listcell().unwrap();
            let record    = guard.alloc_datarec(12).unwrap();
            guard.free_listcell(cell).unwrap();
            guard.free_datarec(record).unwrap();
          }
        })
      })
      .collect();
  for worker in workers {
    worker.join().unwrap();
  }

  let segment = shared.lock().unwrap();
  assert_clean(&segment);
  assert_eq!(segment.freelist_len(AreaKind::ListCell).unwrap(), CELLS_PER_SUBAREA);
  assert_eq!(segment.area_stats(AreaKind::DataRecord).used_objects, 0);
  drop(segment);

  assert!(delete_segment(key));
  assert_eq!(Arc::strong_count(&shared), 1);
}
