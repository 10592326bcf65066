//! # Engine Configuration Constants
//!
//! Centralizes every tunable and layout constant for the engine. Several of
//! these values are interdependent (the slot and header sizes participate in
//! the persisted page format, the hash chain minimum bounds the pool size),
//! so they live in one place with their relationships spelled out and
//! compile-time checked where possible.

/// Logical page number. 48 bits are sufficient on the wire (see [`ID_SIZE`]);
/// 64 bits in memory and in the checkpoint entries.
pub type PageNo = u64;

/// Host page identifier, assigned by the embedding application's buffer pool.
pub type HostPageId = i32;

/// Smallest supported page size exponent (512-byte pages).
pub const MIN_BITS: u8 = 9;

/// Largest supported page size exponent (16MB pages). Slot offsets are
/// stored as 32-bit values, so anything under 32 would fit; 24 matches the
/// largest page any realistic host pool hands out.
pub const MAX_BITS: u8 = 24;

/// Byte size of the on-page header: cnt(4) act(4) min(4) garbage(4) bits(1)
/// free(1) lvl(1) kill(1) right(6).
pub const PAGE_HEADER_SIZE: usize = 26;

/// Byte size of one slot array entry: key_off(4) kind(1) dead(1).
pub const SLOT_SIZE: u32 = 6;

/// Width of an encoded page id (48-bit, high byte first). Used for the
/// right-sibling pointer, fence values, and the free chain head.
pub const ID_SIZE: usize = 6;

/// Maximum user key length. One length byte encodes the key, and two bytes
/// of headroom are reserved for the stopper.
pub const KEY_MAX: usize = 253;

/// Maximum value length (one length byte on the heap).
pub const VALUE_MAX: usize = 255;

/// Minimum buffer pool size, and the expected hash chain length: the latch
/// hash table gets `node_max / HASH_CHAIN_MIN` buckets.
pub const HASH_CHAIN_MIN: usize = 16;

/// Number of levels a freshly created tree starts with (root + first leaf).
pub const MIN_LEVEL: u8 = 2;

/// Logical page holding allocation state and the checkpointed id map.
pub const ALLOC_PAGE: PageNo = 0;

/// The root is always reachable at logical page 1, whatever its level.
pub const ROOT_PAGE: PageNo = 1;

/// First leaf page of a freshly created tree.
pub const LEAF_PAGE: PageNo = 2;

/// High bit of a latch's pin word. Set on unpin, cleared by the eviction
/// sweep; a frame whose clock bit is set survives one sweep.
pub const CLOCK_BIT: u32 = 1 << 15;

/// Offset of the duplicate-sequence counter inside PageZero's data region.
pub const PAGE_ZERO_DUPS: usize = 0;

/// Offset of the free chain head inside PageZero's data region.
pub const PAGE_ZERO_CHAIN: usize = PAGE_ZERO_DUPS + 8;

/// Offset of the first id-map chain record inside PageZero's data region.
pub const PAGE_ZERO_MAP: usize = PAGE_ZERO_CHAIN + ID_SIZE;

/// Id-map chain record header: next_host_id(4) entry_count(4), little-endian.
pub const MAP_HEADER_SIZE: usize = 8;

/// Id-map entry: page_no(8) host_id(4), little-endian.
pub const MAP_ENTRY_SIZE: usize = 12;

/// Terminator written in the next_host_id field of the last chain record.
pub const MAP_CHAIN_END: u32 = 0xFFFF_FFFF;

// The smallest page must hold the header, PageZero's fixed fields, and at
// least one id-map record.
const _: () = assert!(
    (1 << MIN_BITS) - PAGE_HEADER_SIZE >= PAGE_ZERO_MAP + MAP_HEADER_SIZE + MAP_ENTRY_SIZE
);
