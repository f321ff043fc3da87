/*!

The segment: one contiguous, offset-addressed block of memory holding a header, one area header per object category,
and the subareas those areas grow into. A `Segment` is the explicit context handle every operation goes through.

Nothing inside the segment refers to an absolute address, so a segment image can be mapped at any base address and
attached with `Segment::attach`. The allocator is not internally synchronised: callers hold one exclusive lock over
the whole segment for the duration of every call. `registry` keeps segments behind such a lock.

*/

pub mod codec;
pub mod config;
pub mod layout;
pub mod memory;
pub mod registry;

use tracing::{debug, warn};

use crate::{
  area::{Area, AreaHeader, AreaKind},
  check,
  error::{AllocationError, Result},
};
pub use config::SegmentConfig;
use layout::*;
use memory::SegmentMemory;

pub struct Segment {
  memory: SegmentMemory,
}

impl Segment {
  // region Constructors

  /// Creates a segment and the first subarea of every area.
  pub fn new(config: &SegmentConfig) -> Result<Self> {
    config.validate()?;
    let size       = align_down(config.size as Word, SUBAREA_ALIGNMENT_BYTES);
    let mut memory = SegmentMemory::new(size as usize)?;

    let initial_address = memory.base() as u64;
    memory.write_word(SEG_VERSION, MEMSEGMENT_VERSION);
    memory.write_word(SEG_SIZE, size);
    memory.write_word(SEG_FREE, align_up(SEGMENT_HEADER_BYTES, SUBAREA_ALIGNMENT_BYTES));
    memory.write_word(SEG_INITIAL_ADDRESS, initial_address as Word);
    memory.write_word(SEG_INITIAL_ADDRESS + WORD_BYTES, (initial_address >> Word::BITS) as Word);
    memory.write_word(SEG_KEY, config.key);
    memory.write_word(SEG_PARENT, 0);

    for kind in AreaKind::ALL {
      let subarea_size = match kind.fixed_length() {
        Some(_) => config.fixed_subarea_size,
        None    => config.varlen_subarea_size,
      };
      Area::new(&mut memory, kind).initialize(subarea_size)?;
    }

    // Written last: a half-built segment never passes `is_valid`.
    memory.write_word(SEG_MARK, MEMSEGMENT_MAGIC_MARK);
    debug!(size, key = config.key, "created segment");
    Ok(Segment { memory })
  }

  /// Creates a segment of `size` bytes with the given shared key and default subarea sizes.
  pub fn init(key: Word, size: usize) -> Result<Self> {
    Segment::new(&SegmentConfig::new(size).with_key(key))
  }

  /// Adopts an existing segment image, which may have been built at a different base address.
  pub fn attach(memory: SegmentMemory) -> Result<Self> {
    if memory.size() < SEGMENT_HEADER_BYTES as usize {
      return Err(AllocationError::InvalidSegment(format!("{} bytes cannot hold a segment header", memory.size())));
    }
    let mark = memory.read_word(SEG_MARK);
    if mark != MEMSEGMENT_MAGIC_MARK {
      return Err(AllocationError::InvalidSegment(format!("magic mark {:#x} does not match", mark)));
    }
    let version = memory.read_word(SEG_VERSION);
    if version != MEMSEGMENT_VERSION {
      return Err(AllocationError::InvalidSegment(
        format!("version {:#x}, expected {:#x}", version, MEMSEGMENT_VERSION)
      ));
    }
    if memory.read_word(SEG_SIZE) as usize > memory.size() {
      return Err(AllocationError::InvalidSegment(
        format!("recorded size {} exceeds the {} bytes supplied", memory.read_word(SEG_SIZE), memory.size())
      ));
    }
    // Allocation trusts the area and subarea headers, so they are vetted once here.
    if let Some(violation) = check::header_violations(&memory).into_iter().next() {
      warn!(%violation, "refused segment image");
      return Err(AllocationError::InvalidSegment(violation.to_string()));
    }
    Ok(Segment { memory })
  }

  // endregion Constructors

  // region Header accessors

  /// True if the magic mark at offset 0 is intact.
  pub fn is_valid(&self) -> bool {
    self.memory.try_read_word(SEG_MARK) == Some(MEMSEGMENT_MAGIC_MARK)
  }

  pub fn version(&self) -> Word {
    self.memory.read_word(SEG_VERSION)
  }

  pub fn size(&self) -> usize {
    self.memory.read_word(SEG_SIZE) as usize
  }

  /// Offset of the first byte not yet given to any subarea.
  pub fn free_offset(&self) -> Offset {
    self.memory.read_word(SEG_FREE)
  }

  /// Base address of the creating process. Meaningless elsewhere.
  pub fn initial_address(&self) -> u64 {
    let low  = self.memory.read_word(SEG_INITIAL_ADDRESS) as u64;
    let high = self.memory.read_word(SEG_INITIAL_ADDRESS + WORD_BYTES) as u64;
    (high << Word::BITS) | low
  }

  pub fn key(&self) -> Word {
    self.memory.read_word(SEG_KEY)
  }

  /// Offset of the parent segment, zero if there is none.
  pub fn parent(&self) -> Offset {
    self.memory.read_word(SEG_PARENT)
  }

  pub fn set_parent(&mut self, parent: Offset) {
    self.memory.write_word(SEG_PARENT, parent)
  }

  pub fn memory(&self) -> &SegmentMemory {
    &self.memory
  }

  pub(crate) fn memory_mut(&mut self) -> &mut SegmentMemory {
    &mut self.memory
  }

  pub fn into_memory(self) -> SegmentMemory {
    self.memory
  }

  // endregion Header accessors

  // region Offset addressing

  /// Offset of `address` inside this segment, if it lies inside it.
  pub fn to_offset(&self, address: *const u8) -> Option<Offset> {
    codec::to_offset(self.memory.base(), address).filter(|offset| (*offset as usize) < self.memory.size())
  }

  /// Address of `offset` in this process's mapping of the segment.
  pub fn to_address(&self, offset: Offset) -> *const u8 {
    codec::to_address(self.memory.base(), offset)
  }

  pub fn read_word(&self, offset: Offset) -> Option<Word> {
    self.memory.try_read_word(offset)
  }

  /// Writes a word into an object. Returns false, writing nothing, if `offset` is outside the segment.
  pub fn write_word(&mut self, offset: Offset, value: Word) -> bool {
    let fits = self.memory.holds_word(offset);
    if fits {
      self.memory.write_word(offset, value);
    }
    fits
  }

  pub fn bytes(&self, offset: Offset, len: usize) -> Option<&[u8]> {
    self.memory.bytes(offset, len)
  }

  pub fn bytes_mut(&mut self, offset: Offset, len: usize) -> Option<&mut [u8]> {
    self.memory.bytes_mut(offset, len)
  }

  // endregion Offset addressing

  // region Allocation

  fn ensure_valid(&self) -> Result<()> {
    match self.is_valid() {
      true  => Ok(()),
      false => Err(AllocationError::InvalidSegment("magic mark does not match".to_string())),
    }
  }

  fn area(&mut self, kind: AreaKind) -> Result<Area<'_>> {
    self.ensure_valid()?;
    Ok(Area::new(&mut self.memory, kind))
  }

  /// Allocates one cell from a fixed-length area and returns its offset.
  pub fn allocate_fixed(&mut self, kind: AreaKind) -> Result<Offset> {
    let mut area = self.area(kind)?;
    if !area.is_fixed() {
      return Err(AllocationError::InvalidRequest(format!("{} is not a fixed-length area", kind)));
    }
    let offset = area.allocate_fixed()?;
    self.debug_check();
    Ok(offset)
  }

  /// Allocates an object of `count` words from a variable-length area. The first word of the object is its tag;
  /// the caller owns the remaining `count - 1` words.
  pub fn allocate_words(&mut self, kind: AreaKind, count: Word) -> Result<Offset> {
    let mut area = self.area(kind)?;
    if area.is_fixed() {
      return Err(AllocationError::InvalidRequest(format!("{} is not a variable-length area", kind)));
    }
    let offset = area.allocate_words(count)?;
    self.debug_check();
    Ok(offset)
  }

  /// Returns the object at `offset` to its area.
  pub fn free_object(&mut self, kind: AreaKind, offset: Offset) -> Result<()> {
    self.area(kind)?.free(offset)?;
    self.debug_check();
    Ok(())
  }

  /// Byte size the caller asked for when the variable-length object at `offset` was allocated.
  /// Fixed-length areas report their cell length.
  pub fn object_size(&self, kind: AreaKind, offset: Offset) -> Result<Word> {
    self.ensure_valid()?;
    let header = AreaHeader::of(kind);
    if header.is_fixed(&self.memory) {
      return Ok(header.object_length(&self.memory));
    }
    header.object_size(&self.memory, offset)
        .inspect_err(|error| warn!(area = %kind, offset, %error, "size query on a non-object"))
  }

  /// Number of cells on a fixed-length area's freelist.
  pub fn freelist_len(&self, kind: AreaKind) -> Result<usize> {
    self.ensure_valid()?;
    Ok(AreaHeader::of(kind).freelist_len(&self.memory))
  }

  pub fn subarea_count(&self, kind: AreaKind) -> usize {
    AreaHeader::of(kind).subarea_count(&self.memory)
  }

  pub fn alloc_datarec(&mut self, words: Word) -> Result<Offset> {
    self.allocate_words(AreaKind::DataRecord, words)
  }

  pub fn alloc_longstr(&mut self, words: Word) -> Result<Offset> {
    self.allocate_words(AreaKind::LongString, words)
  }

  pub fn alloc_listcell(&mut self) -> Result<Offset> {
    self.allocate_fixed(AreaKind::ListCell)
  }

  pub fn alloc_shortstr(&mut self) -> Result<Offset> {
    self.allocate_fixed(AreaKind::ShortString)
  }

  pub fn alloc_word(&mut self) -> Result<Offset> {
    self.allocate_fixed(AreaKind::Word)
  }

  pub fn alloc_doubleword(&mut self) -> Result<Offset> {
    self.allocate_fixed(AreaKind::DoubleWord)
  }

  pub fn free_datarec(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::DataRecord, offset)
  }

  pub fn free_longstr(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::LongString, offset)
  }

  pub fn free_listcell(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::ListCell, offset)
  }

  pub fn free_shortstr(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::ShortString, offset)
  }

  pub fn free_word(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::Word, offset)
  }

  pub fn free_doubleword(&mut self, offset: Offset) -> Result<()> {
    self.free_object(AreaKind::DoubleWord, offset)
  }

  // endregion Allocation

  // region Debugging

  #[inline(always)]
  fn debug_check(&self) {
    #[cfg(feature = "alloc_debug")]
    {
      let report = self.check();
      for violation in report.iter() {
        eprintln!("debug_check() : {}", violation);
      }
    }
  }

  /// Prints the header of every area.
  #[cfg(feature = "alloc_debug")]
  pub fn dump_area_variables(&self) {
    eprintln!("--------------------------------------");
    eprintln!("\tsize = {}\n\tfree = {}\n\tkey = {}", self.size(), self.free_offset(), self.key());
    for kind in AreaKind::ALL {
      let header = AreaHeader::of(kind);
      eprintln!(
        "\t{}: fixed = {} objlength = {} freelist = {} subareas = {} dv = {:?}",
        kind,
        header.is_fixed(&self.memory),
        header.object_length(&self.memory),
        header.freelist(&self.memory),
        header.subarea_count(&self.memory),
        header.designated_victim(&self.memory),
      );
      for subarea in header.subareas(&self.memory) {
        eprintln!(
          "\t\toffset = {} size = {} aligned offset = {} aligned size = {}",
          subarea.offset(&self.memory),
          subarea.size(&self.memory),
          subarea.aligned_offset(&self.memory),
          subarea.aligned_size(&self.memory),
        );
      }
    }
  }

  // endregion Debugging
}
