/*!

Binary layout of a segment. Every position inside a segment is a byte offset from the segment start, and every
header field, tag, link and bucket slot is exactly one `Word`. The layout is shared by every process that maps the
segment, so the numbers in this file are part of the persisted format.

```text
  offset 0
  ┌──────────────────────────────────────────────────────────────┐
  │ segment header: mark, version, size, free, initial address,  │
  │                 key, parent                                  │
  ├──────────────────────────────────────────────────────────────┤
  │ area header (data records)                                   │
  │   fixed flag, object length, freelist, last subarea index    │
  │   subarea headers [SUBAREA_ARRAY_SIZE]                       │
  │   buckets [EXACT_BUCKETS + VAR_BUCKETS + 2 dv slots]         │
  ├──────────────────────────────────────────────────────────────┤
  │ ... one area header per AreaKind ...                         │
  ├──────────────────────────────────────────────────────────────┤
  │ subareas, carved in order from `free`                        │
  └──────────────────────────────────────────────────────────────┘
```

*/

/// The scalar used for offsets, sizes and tags.
pub type Word = u32;
/// A byte offset from the segment start. Zero never addresses an object.
pub type Offset = Word;

pub const WORD_BYTES: Word = std::mem::size_of::<Word>() as Word;

pub const MEMSEGMENT_MAGIC_MARK: Word = 1232319011;     // Uncommon value marking a real segment
pub const VERSION_MAJOR: Word         = 0;
pub const VERSION_MINOR: Word         = 1;
pub const VERSION_REVISION: Word      = 0;
pub const MEMSEGMENT_VERSION: Word    = (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_REVISION;

pub const SUBAREA_ARRAY_SIZE: usize     = 64;    // Subareas each area can own
pub const INITIAL_SUBAREA_SIZE: Word    = 8192;  // Size of the first subarea of every area
pub const MINIMAL_SUBAREA_SIZE: Word    = 8192;  // Smaller subarea requests are refused
pub const SUBAREA_ALIGNMENT_BYTES: Word = 8;
pub const OBJECT_ALIGNMENT: Word        = 8;     // Real object sizes are multiples of this

pub const EXACT_BUCKETS: usize     = 256;                            // One bucket per byte size below this
pub const VAR_BUCKETS: usize       = 32;                             // Exponentially growing size ranges
pub const CACHE_BUCKETS: usize     = 2;                              // Designated victim offset and size
pub const DV_BUCKET: usize         = EXACT_BUCKETS + VAR_BUCKETS;
pub const DV_SIZE_BUCKET: usize    = DV_BUCKET + 1;
pub const BUCKET_TABLE_SIZE: usize = EXACT_BUCKETS + VAR_BUCKETS + CACHE_BUCKETS;

/// Smallest variable-length object: tag, next link, prev link, trailing tag.
pub const MIN_VARLEN_OBJECT_SIZE: Word = 4 * WORD_BYTES;
/// Largest byte count a single variable-length request may ask for.
pub const MAX_OBJECT_BYTES: Word       = Word::MAX / 2;

pub const SHORTSTR_SIZE: Word = 32;

// Segment header fields
pub const SEG_MARK: Offset            = 0;
pub const SEG_VERSION: Offset         = 4;
pub const SEG_SIZE: Offset            = 8;
pub const SEG_FREE: Offset            = 12;
pub const SEG_INITIAL_ADDRESS: Offset = 16; // Two words, low word first
pub const SEG_KEY: Offset             = 24;
pub const SEG_PARENT: Offset          = 28;
pub const SEG_AREAS: Offset           = 32;

// Area header fields, relative to the area header
pub const AREA_FIXED_LENGTH: Offset   = 0;
pub const AREA_OBJECT_LENGTH: Offset  = 4;
pub const AREA_FREELIST: Offset       = 8;
pub const AREA_LAST_SUBAREA: Offset   = 12;
pub const AREA_SUBAREAS: Offset       = 16;
pub const SUBAREA_HEADER_BYTES: Word  = 4 * WORD_BYTES;
pub const AREA_BUCKETS: Offset        = AREA_SUBAREAS + SUBAREA_ARRAY_SIZE as Word * SUBAREA_HEADER_BYTES;
pub const AREA_HEADER_BYTES: Word     = AREA_BUCKETS + BUCKET_TABLE_SIZE as Word * WORD_BYTES;

// Subarea header fields, relative to the subarea header
pub const SUBAREA_SIZE: Offset           = 0;
pub const SUBAREA_OFFSET: Offset         = 4;
pub const SUBAREA_ALIGNED_SIZE: Offset   = 8;
pub const SUBAREA_ALIGNED_OFFSET: Offset = 12;

pub const AREA_COUNT: usize          = 6;
pub const SEGMENT_HEADER_BYTES: Word = SEG_AREAS + AREA_COUNT as Word * AREA_HEADER_BYTES;

// Marker word following the tag of a special object
pub const SPECIAL_START: Word = 0;
pub const SPECIAL_DV: Word    = 1;
pub const SPECIAL_END: Word   = 2;

/// Rounds `value` up to a multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub const fn align_up(value: Word, alignment: Word) -> Word {
  (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment`, which must be a power of two.
#[inline(always)]
pub const fn align_down(value: Word, alignment: Word) -> Word {
  value & !(alignment - 1)
}
