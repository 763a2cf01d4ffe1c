/// log2 of the number of bytes in a byte
pub const LOG_BYTES_IN_BYTE: u8 = 0;
/// The number of bytes in a byte
pub const BYTES_IN_BYTE: usize = 1;
/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: u8 = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: u8 = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

#[cfg(target_pointer_width = "32")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 2;
#[cfg(target_pointer_width = "64")]
/// log2 of the number of bytes in an address
pub const LOG_BYTES_IN_ADDRESS: u8 = 3;
/// The number of bytes in an address
pub const BYTES_IN_ADDRESS: usize = 1 << LOG_BYTES_IN_ADDRESS;

/// log2 of the number of bytes in a word
pub const LOG_BYTES_IN_WORD: u8 = LOG_BYTES_IN_ADDRESS;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE as usize + LOG_BYTES_IN_WORD as usize;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// Metadata allocations are aligned to 8 bytes so that 64 bit fields are
/// naturally aligned on every platform.
pub const METADATA_ALIGNMENT: usize = 8;

/// The fill value used when verification mangles an uninitialized chunk payload.
#[cfg(target_pointer_width = "64")]
pub const UNINIT_META_WORD_VAL: usize = 0xf7f7_f7f7_f7f7_f7f7;
#[cfg(target_pointer_width = "32")]
pub const UNINIT_META_WORD_VAL: usize = 0xf7f7_f7f7;

/// Default percentage of a region's capacity above which the region is
/// considered too full of live data to be worth evacuating.
pub const DEFAULT_MIXED_GC_LIVE_THRESHOLD_PERCENT: usize = 85;

/// Default heap region size in bytes.
pub const DEFAULT_REGION_BYTES: usize = BYTES_IN_MBYTE;

/// The fill value used when verification mangles a chunk returned to the free pool.
#[cfg(target_pointer_width = "64")]
pub const BAD_META_WORD_VAL: usize = 0xfbfb_fbfb_fbfb_fbfb;
#[cfg(target_pointer_width = "32")]
pub const BAD_META_WORD_VAL: usize = 0xfbfb_fbfb;
