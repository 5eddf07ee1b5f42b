//! Constants and configuration for the IP set radix tree

/// Bits of an address consumed by each level of the tree.
pub const NUM_BITS: u8 = 4;
/// Fan-out of every interior node (`1 << NUM_BITS`).
pub const NUM_CHILDREN: usize = 1 << NUM_BITS;
/// Deepest possible path: one node per nibble of an IPv6 address, plus the leaf.
pub const MAX_DEPTH: usize = 128 / NUM_BITS as usize + 1;

/// Slots reserved up front the first time an arena grows.
pub const ARENA_INITIAL_SLOTS: usize = 256;

// ---- file header -------------------------------------------------------
pub const FILE_MAGIC: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
pub const FILE_TYPE_IPSET: u8 = 0x1D;
pub const FILE_HEADER_VERSION: u8 = 1;
pub const FILE_HEADER_LEN: usize = 48;
pub const COMPRESSION_NONE: u8 = 0;

// ---- legacy /24 bitmap stream -----------------------------------------
pub const LEGACY_WORDS_PER_SLASH24: usize = 8;
pub const LEGACY_BLOCK_LEN: usize = 4 * (1 + LEGACY_WORDS_PER_SLASH24); // 36

// ---- cidr/bitmap stream -----------------------------------------------
/// Marker byte announcing a 256-bit bitmap after the base address.
pub const CIDRBMAP_MAP256: u8 = 0x81;
/// Host bits covered by one bitmap record (256 addresses).
pub const CIDRBMAP_BLOCK_BITS: u8 = 8;
pub const CIDRBMAP_WORDS: usize = 8;
