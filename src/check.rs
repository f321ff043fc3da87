/*!

Integrity checker. Walks the segment header, every subarea of every area, every bucket list and every fixed-length
freelist, and reports each broken invariant it finds as a `Violation`. The checker only reads, through bounds-checked
accessors, so it is safe to run on a corrupted segment; it never repairs anything.

For a variable-length area it checks that

 1. the objects of each subarea tile it exactly between the start and end markers,
 2. every free object's leading and trailing tags agree, and no free object touches another free object or the dv,
 3. every used object's prev-free bit matches the real status of its predecessor,
 4. every bucket entry is free, lies inside a subarea, sits in the bucket its size maps to and links back to its
    predecessor in the list,
 5. the free objects found by walking the subareas are exactly those on the bucket lists, and
 6. the dv recorded in the area header is a special object found in one subarea and in no bucket.

The same walk yields the `AreaStats` used to account for every byte of an area.

*/

use std::{
  collections::HashSet,
  fmt::{Display, Formatter}
};

use thiserror::Error;

use crate::{
  area::{bucket_index, AreaHeader, AreaKind, NEXT_LINK, PREV_LINK, SENTINEL_BYTES},
  segment::{
    codec::{self, SpecialKind, TagStatus},
    layout::*,
    memory::SegmentMemory,
    Segment
  }
};

/// One broken invariant.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum Violation {
  #[error("segment mark {found:#x} is not the magic mark")]
  BadMagic { found: Word },

  #[error("segment version {found:#x} is not supported")]
  BadVersion { found: Word },

  #[error("segment header: {reason}")]
  BadHeader { reason: &'static str },

  #[error("{area} header: {reason}")]
  BadAreaHeader { area: AreaKind, reason: &'static str },

  #[error("{area} subarea {index}: {reason}")]
  BadSubarea { area: AreaKind, index: usize, reason: &'static str },

  #[error("{area}: offset {offset} lies outside every subarea")]
  OutOfBounds { area: AreaKind, offset: Offset },

  #[error("{area}: bucket entry at {offset} is not tagged free")]
  NotFree { area: AreaKind, offset: Offset },

  #[error("{area}: leading and trailing tags of free object at {offset} differ")]
  TagMismatch { area: AreaKind, offset: Offset },

  #[error("{area}: free object at {offset} is in bucket {bucket} instead of {expected}")]
  WrongBucket { area: AreaKind, offset: Offset, bucket: usize, expected: usize },

  #[error("{area}: bucket list broken at {offset}: {reason}")]
  BrokenLink { area: AreaKind, offset: Offset, reason: &'static str },

  #[error("{area}: prev-free bit of object at {offset} does not match its predecessor")]
  PrevFreeMismatch { area: AreaKind, offset: Offset },

  #[error("{area}: free object at {offset} follows another free object or the dv")]
  AdjacentFree { area: AreaKind, offset: Offset },

  #[error("{area}: bad tag at {offset}: {reason}")]
  BadTag { area: AreaKind, offset: Offset, reason: &'static str },

  #[error("{area}: designated victim at {offset}: {reason}")]
  BadDesignatedVictim { area: AreaKind, offset: Offset, reason: &'static str },

  #[error("{area}: free object at {offset} is on no bucket list")]
  Unlisted { area: AreaKind, offset: Offset },

  #[error("{area}: bucket entry at {offset} is not a free object of any subarea")]
  StrayEntry { area: AreaKind, offset: Offset },

  #[error("{area}: freelist is longer than the area's capacity or loops")]
  FreelistOverrun { area: AreaKind },

  #[error("{area}: freelist entry at {offset} is not a cell boundary")]
  MisalignedCell { area: AreaKind, offset: Offset },
}

/// Every violation found by one check.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct CheckReport {
  pub violations: Vec<Violation>,
}

impl CheckReport {
  pub fn is_ok(&self) -> bool {
    self.violations.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Violation> {
    self.violations.iter()
  }

  fn push(&mut self, violation: Violation) {
    self.violations.push(violation);
  }

  fn extend(&mut self, other: CheckReport) {
    self.violations.extend(other.violations);
  }
}

impl Display for CheckReport {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.violations.is_empty() {
      return write!(f, "no violations");
    }
    for violation in &self.violations {
      writeln!(f, "{}", violation)?;
    }
    Ok(())
  }
}

/// Byte accounting of one area. For a consistent variable-length area
/// `used_bytes + free_bytes + dv_bytes + sentinel_bytes == usable_bytes`; for a fixed-length area
/// `used_bytes + free_bytes == usable_bytes`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AreaStats {
  pub subareas      : usize,
  pub usable_bytes  : u64,
  pub used_bytes    : u64,
  pub free_bytes    : u64,
  pub dv_bytes      : u64,
  pub sentinel_bytes: u64,
  pub used_objects  : usize,
  pub free_objects  : usize,
}

// region Public entry points

/// Checks the segment header and every area.
pub fn check_segment(segment: &Segment) -> CheckReport {
  let memory     = segment.memory();
  let mut report = CheckReport::default();

  let mark = memory.try_read_word(SEG_MARK).unwrap_or(0);
  if mark != MEMSEGMENT_MAGIC_MARK {
    // Nothing else in the header can be trusted.
    report.push(Violation::BadMagic { found: mark });
    return report;
  }
  let version = memory.read_word(SEG_VERSION);
  if version != MEMSEGMENT_VERSION {
    report.push(Violation::BadVersion { found: version });
  }
  let size = memory.read_word(SEG_SIZE);
  if size as usize > memory.size() {
    report.push(Violation::BadHeader { reason: "recorded size exceeds the segment memory" });
  }
  report.extend(claimed_span_violations(memory));

  for kind in AreaKind::ALL {
    report.extend(check_area(segment, kind));
  }
  report
}

/// Checks one area: its subareas, and its bucket lists or freelist.
pub fn check_area(segment: &Segment, kind: AreaKind) -> CheckReport {
  Inspector::new(segment.memory(), kind).inspect().0
}

/// Checks a single bucket list of a variable-length area in isolation.
pub fn check_bucket_freelist(segment: &Segment, kind: AreaKind, bucket: usize) -> CheckReport {
  let mut inspector = Inspector::new(segment.memory(), kind);
  if bucket < DV_BUCKET {
    let spans = inspector.subarea_spans();
    inspector.check_bucket(bucket, &spans, &mut HashSet::new());
  }
  inspector.report
}

/// True if `size` bytes at `offset` lie inside the allocatable span of one subarea of the area: between the markers
/// of a variable-length subarea, or anywhere in a fixed-length one.
pub fn check_object_within_bounds(segment: &Segment, kind: AreaKind, offset: Offset, size: Word) -> bool {
  let mut inspector = Inspector::new(segment.memory(), kind);
  let spans         = inspector.subarea_spans();
  within_spans(&spans, offset, size)
}

/// Byte accounting of one area, computed by the same walk as `check_area`.
pub fn area_stats(segment: &Segment, kind: AreaKind) -> AreaStats {
  Inspector::new(segment.memory(), kind).inspect().1
}

impl Segment {
  pub fn check(&self) -> CheckReport {
    check_segment(self)
  }

  pub fn check_area(&self, kind: AreaKind) -> CheckReport {
    check_area(self, kind)
  }

  pub fn area_stats(&self, kind: AreaKind) -> AreaStats {
    area_stats(self, kind)
  }
}

// endregion Public entry points

/// Violations in the segment, area and subarea headers alone, without walking any object. These are the headers
/// allocation relies on, so an image with any of them cannot be attached.
pub(crate) fn header_violations(memory: &SegmentMemory) -> Vec<Violation> {
  let mut report = claimed_span_violations(memory);
  for kind in AreaKind::ALL {
    let mut inspector = Inspector::new(memory, kind);
    if inspector.check_area_header() {
      inspector.subarea_spans();
    }
    report.extend(inspector.report);
  }
  report.violations
}

/// Checks the free offset and that every subarea lies below it without overlapping a subarea of another area.
fn claimed_span_violations(memory: &SegmentMemory) -> CheckReport {
  let mut report = CheckReport::default();
  let size       = memory.read_word(SEG_SIZE).min(memory.size() as Word);
  let free       = memory.read_word(SEG_FREE);
  if free > size || free < SEGMENT_HEADER_BYTES {
    report.push(Violation::BadHeader { reason: "free offset lies outside the subarea region" });
  }

  let mut claimed: Vec<(AreaKind, Offset, Offset)> = Vec::new();
  for kind in AreaKind::ALL {
    let header = AreaHeader::of(kind);
    for index in 0..header.subarea_count(memory) {
      let Some(subarea) = header.subarea(index) else { break };
      // Spans that wrap are reported by the per-area check.
      let Some(end) = subarea.aligned_end(memory) else { continue };
      let start     = subarea.aligned_offset(memory);

      if end > free {
        report.push(Violation::BadSubarea { area: kind, index, reason: "span lies beyond the free offset" });
      }
      if claimed.iter().any(|(owner, s, e)| *owner != kind && start < *e && *s < end) {
        report.push(Violation::BadSubarea { area: kind, index, reason: "span overlaps a subarea of another area" });
      }
      claimed.push((kind, start, end));
    }
  }
  report
}

/// What preceded the current object during a subarea walk.
#[derive(Copy, Clone, Eq, PartialEq)]
enum Neighbour {
  Marker,
  Used,
  Free,
  Victim,
}

fn within_spans(spans: &[(Offset, Offset)], offset: Offset, size: Word) -> bool {
  spans.iter().any(|(lower, upper)| {
    offset >= *lower && offset.checked_add(size).is_some_and(|end| end <= *upper)
  })
}

struct Inspector<'m> {
  memory: &'m SegmentMemory,
  kind  : AreaKind,
  header: AreaHeader,
  report: CheckReport,
  stats : AreaStats,
}

impl<'m> Inspector<'m> {
  fn new(memory: &'m SegmentMemory, kind: AreaKind) -> Self {
    Inspector {
      memory,
      kind,
      header: AreaHeader::of(kind),
      report: CheckReport::default(),
      stats : AreaStats::default(),
    }
  }

  fn inspect(mut self) -> (CheckReport, AreaStats) {
    if !self.check_area_header() {
      return (self.report, self.stats);
    }
    let spans = self.subarea_spans();
    match self.header.is_fixed(self.memory) {
      true  => self.check_fixed(&spans),
      false => self.check_varlen(&spans),
    }
    (self.report, self.stats)
  }

  fn violation(&mut self, violation: Violation) {
    self.report.push(violation);
  }

  /// The fixed flag and object length must be those of the area's kind. False if they are not.
  fn check_area_header(&mut self) -> bool {
    let fixed  = self.memory.read_word(self.kind.header_offset() + AREA_FIXED_LENGTH);
    let length = self.header.object_length(self.memory);
    let reason = match self.kind.fixed_length() {
      _ if fixed > 1                              => Some("fixed flag is neither 0 nor 1"),
      Some(_) if fixed == 0                       => Some("fixed-length area is flagged variable-length"),
      None if fixed == 1                          => Some("variable-length area is flagged fixed-length"),
      expected if length != expected.unwrap_or(0) => Some("object length does not match the area"),
      _                                           => None,
    };
    match reason {
      Some(reason) => {
        self.violation(Violation::BadAreaHeader { area: self.kind, reason });
        false
      }
      None => true,
    }
  }

  /// The allocatable span of every subarea whose header is sane. Variable-length spans exclude the markers.
  fn subarea_spans(&mut self) -> Vec<(Offset, Offset)> {
    let limit = self.memory.read_word(SEG_SIZE).min(self.memory.size() as Word);
    let fixed = self.header.is_fixed(self.memory);

    if self.header.last_subarea_index(self.memory) >= SUBAREA_ARRAY_SIZE {
      self.violation(Violation::BadSubarea {
        area  : self.kind,
        index : self.header.last_subarea_index(self.memory),
        reason: "last subarea index exceeds the subarea array",
      });
    }

    let mut spans: Vec<(Offset, Offset)> = Vec::new();
    for index in 0..self.header.subarea_count(self.memory) {
      let Some(subarea) = self.header.subarea(index) else { break };
      let start = subarea.aligned_offset(self.memory);
      let size  = subarea.aligned_size(self.memory);
      let end   = start.checked_add(size).filter(|end| *end <= limit);

      let reason = match end {
        None                                                  => Some("span runs past the end of the segment"),
        Some(_) if start < SEGMENT_HEADER_BYTES               => Some("span overlaps the segment header"),
        Some(_) if start % OBJECT_ALIGNMENT != 0              => Some("span is misaligned"),
        Some(_) if start < subarea.offset(self.memory)        => Some("aligned offset precedes the raw offset"),
        Some(_) if !fixed && size < SENTINEL_BYTES            => Some("span cannot hold the subarea markers"),
        Some(end) if spans.iter().any(|(s, e)| start < *e && *s < end) => Some("span overlaps another subarea"),
        Some(_)                                               => None,
      };
      if let Some(reason) = reason {
        self.violation(Violation::BadSubarea { area: self.kind, index, reason });
        continue;
      }

      let end = start + size;
      self.stats.subareas     += 1;
      self.stats.usable_bytes += size as u64;
      match fixed {
        true  => spans.push((start, end)),
        false => spans.push((start + MIN_VARLEN_OBJECT_SIZE, end - MIN_VARLEN_OBJECT_SIZE)),
      }
    }
    spans
  }

  // region Variable-length areas

  fn check_varlen(&mut self, spans: &[(Offset, Offset)]) {
    let dv         = self.header.designated_victim(self.memory);
    let mut walked = HashSet::new();
    let mut listed = HashSet::new();
    let mut dv_seen = 0;

    for (lower, upper) in spans {
      dv_seen += self.walk_subarea(*lower, *upper, dv, &mut walked);
    }
    for bucket in 0..DV_BUCKET {
      self.check_bucket(bucket, spans, &mut listed);
    }

    let mut unlisted: Vec<Offset> = walked.difference(&listed).copied().collect();
    let mut stray: Vec<Offset>    = listed.difference(&walked).copied().collect();
    unlisted.sort_unstable();
    stray.sort_unstable();
    for offset in unlisted {
      self.violation(Violation::Unlisted { area: self.kind, offset });
    }
    for offset in stray {
      self.violation(Violation::StrayEntry { area: self.kind, offset });
    }

    if let Some((offset, _)) = dv {
      if dv_seen != 1 {
        self.violation(Violation::BadDesignatedVictim {
          area  : self.kind,
          offset,
          reason: "not found exactly once in the subareas",
        });
      }
      if listed.contains(&offset) {
        self.violation(Violation::BadDesignatedVictim { area: self.kind, offset, reason: "also on a bucket list" });
      }
    }
  }

  fn expect_marker(&mut self, offset: Offset, expected: SpecialKind) {
    let tag    = self.memory.try_read_word(offset);
    let marker = self.memory.try_read_word(offset + WORD_BYTES).and_then(SpecialKind::from_marker);
    let valid  = tag == Some(codec::encode(MIN_VARLEN_OBJECT_SIZE, TagStatus::Special)) && marker == Some(expected);
    if !valid {
      self.violation(Violation::BadTag { area: self.kind, offset, reason: "subarea marker is damaged" });
    }
  }

  /// Walks the objects between the markers of one subarea. Returns how many dv objects it met.
  fn walk_subarea(
    &mut self,
    lower : Offset,
    upper : Offset,
    dv    : Option<(Offset, Word)>,
    walked: &mut HashSet<Offset>,
  ) -> usize
  {
    let kind = self.kind;
    self.expect_marker(lower - MIN_VARLEN_OBJECT_SIZE, SpecialKind::Start);
    self.expect_marker(upper, SpecialKind::End);

    let mut dv_seen  = 0;
    let mut previous = Neighbour::Marker;
    let mut position = lower;
    while position < upper {
      let Some(tag) = self.memory.try_read_word(position) else {
        self.violation(Violation::OutOfBounds { area: kind, offset: position });
        return dv_seen;
      };
      let status = codec::tag_status(tag);
      let size   = match status {
        TagStatus::Special => codec::tag_size(tag),
        TagStatus::Free    => codec::tag_size(tag),
        _                  => codec::used_object_size(tag),
      };
      if size < MIN_VARLEN_OBJECT_SIZE || size % OBJECT_ALIGNMENT != 0 || size > upper - position {
        self.violation(Violation::BadTag { area: kind, offset: position, reason: "size does not fit the subarea" });
        return dv_seen;
      }

      match status {
        TagStatus::Special => {
          let marker = self.memory.try_read_word(position + WORD_BYTES).and_then(SpecialKind::from_marker);
          if marker != Some(SpecialKind::DesignatedVictim) {
            self.violation(Violation::BadTag { area: kind, offset: position, reason: "marker inside a subarea" });
            return dv_seen;
          }
          if dv != Some((position, size)) {
            self.violation(Violation::BadDesignatedVictim {
              area  : kind,
              offset: position,
              reason: "does not match the area header",
            });
          }
          if previous == Neighbour::Free {
            self.violation(Violation::AdjacentFree { area: kind, offset: position });
          }
          dv_seen             += 1;
          self.stats.dv_bytes += size as u64;
          previous             = Neighbour::Victim;
        }

        TagStatus::Free => {
          if self.memory.try_read_word(position + size - WORD_BYTES) != Some(tag) {
            self.violation(Violation::TagMismatch { area: kind, offset: position });
          }
          if matches!(previous, Neighbour::Free | Neighbour::Victim) {
            self.violation(Violation::AdjacentFree { area: kind, offset: position });
          }
          walked.insert(position);
          self.stats.free_bytes   += size as u64;
          self.stats.free_objects += 1;
          previous                 = Neighbour::Free;
        }

        _ => {
          if (status == TagStatus::UsedPrevFree) != (previous == Neighbour::Free) {
            self.violation(Violation::PrevFreeMismatch { area: kind, offset: position });
          }
          self.stats.used_bytes   += size as u64;
          self.stats.used_objects += 1;
          previous                 = Neighbour::Used;
        }
      }
      position += size;
    }

    self.stats.sentinel_bytes += SENTINEL_BYTES as u64;
    dv_seen
  }

  fn check_bucket(&mut self, bucket: usize, spans: &[(Offset, Offset)], listed: &mut HashSet<Offset>) {
    let kind         = self.kind;
    let max_entries  = (self.stats.usable_bytes / MIN_VARLEN_OBJECT_SIZE as u64) as usize;
    let mut previous = 0;
    let mut object   = self.header.bucket(self.memory, bucket);
    let mut entries  = 0;

    while object != 0 {
      entries += 1;
      if entries > max_entries || !listed.insert(object) {
        self.violation(Violation::BrokenLink { area: kind, offset: object, reason: "entry is reached twice" });
        return;
      }
      if object % OBJECT_ALIGNMENT != 0 || !within_spans(spans, object, MIN_VARLEN_OBJECT_SIZE) {
        self.violation(Violation::OutOfBounds { area: kind, offset: object });
        return;
      }

      let tag  = self.memory.read_word(object);
      let size = codec::tag_size(tag);
      if !codec::is_free(tag) {
        self.violation(Violation::NotFree { area: kind, offset: object });
        return;
      }
      if !within_spans(spans, object, size) || size < MIN_VARLEN_OBJECT_SIZE {
        self.violation(Violation::OutOfBounds { area: kind, offset: object });
        return;
      }
      if self.memory.try_read_word(object + size - WORD_BYTES) != Some(tag) {
        self.violation(Violation::TagMismatch { area: kind, offset: object });
      }
      let expected = bucket_index(size);
      if expected != bucket {
        self.violation(Violation::WrongBucket { area: kind, offset: object, bucket, expected });
      }
      if self.memory.read_word(object + PREV_LINK) != previous {
        self.violation(Violation::BrokenLink { area: kind, offset: object, reason: "prev link does not point back" });
      }

      previous = object;
      object   = self.memory.read_word(object + NEXT_LINK);
    }
  }

  // endregion Variable-length areas

  fn check_fixed(&mut self, spans: &[(Offset, Offset)]) {
    let kind   = self.kind;
    // Vetted against the kind by `check_area_header`.
    let length = self.header.object_length(self.memory);

    let capacity: usize = spans.iter().map(|(start, end)| ((end - start) / length) as usize).sum();
    let mut seen = HashSet::new();
    let mut cell = self.header.freelist(self.memory);
    while cell != 0 {
      if seen.len() >= capacity || seen.contains(&cell) {
        self.violation(Violation::FreelistOverrun { area: kind });
        break;
      }
      let Some((start, end)) = spans.iter().find(|(start, end)| cell >= *start && cell < *end).copied() else {
        self.violation(Violation::OutOfBounds { area: kind, offset: cell });
        break;
      };
      if (cell - start) % length != 0 || (cell - start) / length >= (end - start) / length {
        self.violation(Violation::MisalignedCell { area: kind, offset: cell });
        break;
      }
      seen.insert(cell);
      cell = self.memory.read_word(cell);
    }

    self.stats.usable_bytes = capacity as u64 * length as u64;
    self.stats.free_objects = seen.len();
    self.stats.free_bytes   = seen.len() as u64 * length as u64;
    self.stats.used_objects = capacity - seen.len();
    self.stats.used_bytes   = self.stats.usable_bytes - self.stats.free_bytes;
  }
}
