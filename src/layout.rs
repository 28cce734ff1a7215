//! On-media structures: zones, chunk headers, runs, and the allocation
//! header that precedes every live object. The allocation header and the
//! redo slot are bit-exact, fixed-width records; everything else
//! (zone/chunk sizing, the run bitmap width) is this crate's own choice
//! of concrete constants.

use bytemuck::{Pod, Zeroable};

use crate::pmem::CACHE_LINE;

/// Size of a chunk: the finest whole-number-of-chunks unit the HUGE bucket
/// deals in, and the size of a RUN's backing slab.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Magic number stamped into every zone header, used by `Heap::boot` to
/// sanity-check that a region really is a zone before trusting its chunk
/// table.
pub const ZONE_MAGIC: u64 = 0x5A4F4E455F504D00; // "ZONE_PM\0"

/// Chunk header tag. Stored as the low 16 bits of the 8-byte
/// [`ChunkHeader`] word so the whole header can flip atomically via a
/// single redo-log entry -- a redo entry is always one absolute 64-bit
/// store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    Free = 0,
    Used = 1,
    Run = 2,
    Footer = 3,
}

impl ChunkType {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0 => Some(ChunkType::Free),
            1 => Some(ChunkType::Used),
            2 => Some(ChunkType::Run),
            3 => Some(ChunkType::Footer),
            _ => None,
        }
    }
}

/// A chunk header, one of which precedes every chunk in a zone's header
/// table. Exactly 8 bytes so it can be flipped with a single redo-log
/// entry: `type_tag`/`flags` occupy the low 32 bits, `size_idx` the high
/// 32 bits.
///
/// For a `Free`/`Used` chunk, `size_idx` is the number of chunks in the
/// (possibly multi-chunk) extent starting here. For `Run`, `size_idx` is
/// unused (the run's own header records its unit size and bitmap). For
/// `Footer`, `size_idx` is the number of chunks in the extent this footer
/// terminates, letting a neighbor-coalesce walk backward from any chunk to
/// the start of the free extent immediately before it.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkHeader {
    pub type_tag: u16,
    pub flags: u16,
    pub size_idx: u32,
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == 8);

impl ChunkHeader {
    pub const fn free(size_idx: u32) -> Self {
        Self {
            type_tag: ChunkType::Free as u16,
            flags: 0,
            size_idx,
        }
    }

    pub const fn footer(size_idx: u32) -> Self {
        Self {
            type_tag: ChunkType::Footer as u16,
            flags: 0,
            size_idx,
        }
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_tag(self.type_tag)
    }

    /// Reinterpret as the 64-bit word a redo-log entry stores.
    pub fn as_u64(&self) -> u64 {
        bytemuck::cast(*self)
    }

    pub fn from_u64(word: u64) -> Self {
        bytemuck::cast(word)
    }
}

/// Header of a zone: a fixed-size prologue followed immediately by
/// `chunk_count` [`ChunkHeader`] entries, followed by `chunk_count` chunks
/// of [`CHUNK_SIZE`] bytes each.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ZoneHeader {
    pub magic: u64,
    pub chunk_count: u32,
    pub zone_id: u32,
}

/// Persistent run header: occupies the first bytes of a chunk that has
/// been repurposed into a slab of `unit_size`-byte units. Followed
/// immediately, in the same chunk, by the unit data itself.
///
/// `bitmap` is sized generously (2048 bits) rather than exactly
/// `CHUNK_SIZE / unit_size`, favoring a fixed, statically-sized on-media
/// record over a variable-length one; only the low `nbits` bits of the
/// bitmap are ever valid.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct RunHeader {
    pub unit_size: u64,
    pub nbits: u32,
    pub _pad: u32,
    pub bitmap: [u64; RunHeader::BITMAP_WORDS],
}

impl RunHeader {
    pub const BITMAP_WORDS: usize = 32;
    pub const MAX_UNITS: usize = Self::BITMAP_WORDS * 64;

    pub fn data_offset() -> usize {
        std::mem::size_of::<RunHeader>()
    }

    pub fn units_for(unit_size: u64) -> u32 {
        let available = CHUNK_SIZE - Self::data_offset();
        ((available as u64 / unit_size) as u32).min(Self::MAX_UNITS as u32)
    }

    pub fn bit(&self, idx: u32) -> bool {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        (self.bitmap[word] >> bit) & 1 != 0
    }
}

/// Allocation header: placed immediately before every live user region.
/// Bit-exact layout: `{ uint64 chunk_id; uint64 size; uint32 zone_id;
/// uint32 pad; }`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct AllocationHeader {
    pub chunk_id: u64,
    pub size: u64,
    pub zone_id: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<AllocationHeader>() == 24);

impl AllocationHeader {
    /// Bytes usable by the caller: total block size minus the
    /// cache-line-rounded header offset ([`ALLOC_OFF`]), not just the raw
    /// header struct size -- user data starts at `ALLOC_OFF`, not
    /// immediately after the last header field.
    pub fn usable_size(&self) -> u64 {
        self.size - ALLOC_OFF as u64
    }
}

/// Number of bytes from the start of a memory block (chunk, or run unit)
/// to the start of user data: the allocation header, rounded up so both
/// the header and the user region land on a cache-line boundary.
pub const ALLOC_OFF: usize = {
    let hdr = std::mem::size_of::<AllocationHeader>();
    (hdr + CACHE_LINE - 1) & !(CACHE_LINE - 1)
};

// --- File-layer reference constants -----------------------------------
//
// These describe on-media layouts consumed by a POSIX file layer built on
// top of this allocator, which is out of scope for this crate. They're
// kept here, unused by the allocator core itself, purely as the contract
// such a file-layer implementation would need to match.

/// Fixed size of an inode record in the (out-of-scope) file layer.
pub const INODE_SIZE: usize = 4096;

/// Number of inode entries referenced by a single `pmemfile_inode_array`
/// entry in the (out-of-scope) file layer.
pub const NUMINODES_PER_ENTRY: usize = 249;

/// A directory entry in the (out-of-scope) file layer: a 64-bit inode
/// offset followed by a NUL-terminated name of at most 255 bytes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Dirent {
    pub inode_offset: u64,
    pub name: [u8; 256],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_header_round_trips_through_u64() {
        let hdr = ChunkHeader::free(7);
        let word = hdr.as_u64();
        let back = ChunkHeader::from_u64(word);
        assert_eq!(hdr.type_tag, back.type_tag);
        assert_eq!(hdr.size_idx, back.size_idx);
    }

    #[test]
    fn allocation_header_is_bit_exact_size() {
        assert_eq!(std::mem::size_of::<AllocationHeader>(), 24);
    }

    #[test]
    fn alloc_off_is_cache_line_aligned() {
        assert_eq!(ALLOC_OFF % CACHE_LINE, 0);
        assert!(ALLOC_OFF >= std::mem::size_of::<AllocationHeader>());
    }

    #[test]
    fn run_header_units_for_respects_max() {
        assert!(RunHeader::units_for(1) as usize <= RunHeader::MAX_UNITS);
        assert!(RunHeader::units_for(4096) < RunHeader::units_for(16));
    }
}
