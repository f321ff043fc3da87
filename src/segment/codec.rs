/*!

Offset addressing and the boundary-tag codec.

Every object inside a subarea starts with a tag word. The two lowest bits of the tag carry the object's status and
the remaining bits carry its size in bytes:

| bits | meaning                                              |
|:-----|:-----------------------------------------------------|
| `00` | normal used object, previous neighbour used          |
| `10` | normal used object, previous neighbour free          |
| `01` | free object                                          |
| `11` | special object: designated victim or subarea marker  |

A free object repeats its tag in its last word so that the object following it can find its start. A special object
stores a marker word right after the tag: `SPECIAL_START`, `SPECIAL_DV` or `SPECIAL_END`.

A used object's tag holds the byte count the caller asked for. The space it really occupies is always a multiple of
`OBJECT_ALIGNMENT` and never less than `MIN_VARLEN_OBJECT_SIZE`; see `used_object_size`.

*/

use enumflags2::{bitflags, BitFlags};

use crate::segment::layout::{
  align_up,
  Offset,
  Word,
  MIN_VARLEN_OBJECT_SIZE,
  OBJECT_ALIGNMENT,
  SPECIAL_DV,
  SPECIAL_END,
  SPECIAL_START,
  WORD_BYTES
};

pub const STATUS_MASK: Word = 0b11;

#[bitflags]
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TagBit {
  /// Lowest bit: the object is free. Set together with `PrevFree` it marks a special object.
  Free     = 0b01,
  /// The previous neighbour of a normal used object is free.
  PrevFree = 0b10,
}

pub type TagBits = BitFlags<TagBit>;

/// Status encoded in the two lowest bits of a tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TagStatus {
  Used,
  UsedPrevFree,
  Free,
  Special,
}

impl TagStatus {
  pub const ALL: [TagStatus; 4] = [TagStatus::Used, TagStatus::UsedPrevFree, TagStatus::Free, TagStatus::Special];

  pub fn bits(self) -> TagBits {
    match self {
      TagStatus::Used         => TagBits::empty(),
      TagStatus::UsedPrevFree => TagBit::PrevFree.into(),
      TagStatus::Free         => TagBit::Free.into(),
      TagStatus::Special      => TagBit::Free | TagBit::PrevFree,
    }
  }

  pub fn from_bits(bits: TagBits) -> TagStatus {
    match (bits.contains(TagBit::Free), bits.contains(TagBit::PrevFree)) {
      (false, false) => TagStatus::Used,
      (false, true)  => TagStatus::UsedPrevFree,
      (true, false)  => TagStatus::Free,
      (true, true)   => TagStatus::Special,
    }
  }
}

/// The role of a special object, read from the word following its tag.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SpecialKind {
  Start,
  DesignatedVictim,
  End,
}

impl SpecialKind {
  pub fn marker(self) -> Word {
    match self {
      SpecialKind::Start            => SPECIAL_START,
      SpecialKind::DesignatedVictim => SPECIAL_DV,
      SpecialKind::End              => SPECIAL_END,
    }
  }

  pub fn from_marker(marker: Word) -> Option<SpecialKind> {
    match marker {
      SPECIAL_START => Some(SpecialKind::Start),
      SPECIAL_DV    => Some(SpecialKind::DesignatedVictim),
      SPECIAL_END   => Some(SpecialKind::End),
      _             => None,
    }
  }
}

// region Offset addressing

/// Converts an absolute address into an offset from `base`. Returns `None` for addresses below `base` or too far
/// away to be represented.
pub fn to_offset(base: *const u8, address: *const u8) -> Option<Offset> {
  let distance = (address as usize).checked_sub(base as usize)?;
  Offset::try_from(distance).ok()
}

/// Converts an offset from `base` into an absolute address. The result is only meaningful inside the process that
/// mapped the segment at `base`.
pub fn to_address(base: *const u8, offset: Offset) -> *const u8 {
  base.wrapping_add(offset as usize)
}

// endregion Offset addressing

// region Tag encoding

#[inline(always)]
pub fn encode(size: Word, status: TagStatus) -> Word {
  (size & !STATUS_MASK) | status.bits().bits()
}

#[inline(always)]
pub fn decode(tag: Word) -> (Word, TagStatus) {
  (tag_size(tag), tag_status(tag))
}

/// The size field of a tag with the status bits masked off.
#[inline(always)]
pub fn tag_size(tag: Word) -> Word {
  tag & !STATUS_MASK
}

#[inline(always)]
pub fn tag_status(tag: Word) -> TagStatus {
  TagStatus::from_bits(TagBits::from_bits_truncate(tag & STATUS_MASK))
}

#[inline(always)]
pub fn is_free(tag: Word) -> bool {
  tag_status(tag) == TagStatus::Free
}

/// True for `00` and `10` tags.
#[inline(always)]
pub fn is_normal_used(tag: Word) -> bool {
  !TagBits::from_bits_truncate(tag).contains(TagBit::Free)
}

#[inline(always)]
pub fn is_special(tag: Word) -> bool {
  tag_status(tag) == TagStatus::Special
}

#[inline(always)]
pub fn is_prev_free(tag: Word) -> bool {
  tag_status(tag) == TagStatus::UsedPrevFree
}

/// Rewrites the previous-neighbour bit of a normal used tag.
#[inline(always)]
pub fn with_prev_free(tag: Word, prev_free: bool) -> Word {
  debug_assert!(is_normal_used(tag), "only normal used objects record their predecessor");
  let status = if prev_free { TagStatus::UsedPrevFree } else { TagStatus::Used };
  encode(tag, status)
}

/// The number of bytes a used object really occupies, decoded from its tag.
///
/// Sizes at or below the minimum object size occupy exactly the minimum. Sizes that are not a multiple of the
/// object alignment occupy one more word; the extra word is padding the caller never sees.
#[inline(always)]
pub fn used_object_size(tag: Word) -> Word {
  let size = tag_size(tag);
  if size <= MIN_VARLEN_OBJECT_SIZE {
    MIN_VARLEN_OBJECT_SIZE
  } else if size % OBJECT_ALIGNMENT != 0 {
    size + WORD_BYTES
  } else {
    size
  }
}

/// The number of bytes an object of `wanted` bytes occupies once allocated. Agrees with `used_object_size` for every
/// word-multiple `wanted`.
#[inline(always)]
pub fn real_size(wanted: Word) -> Word {
  align_up(wanted, OBJECT_ALIGNMENT).max(MIN_VARLEN_OBJECT_SIZE)
}

// endregion Tag encoding
