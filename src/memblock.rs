//! Memory blocks: the polymorphic handle `{chunk_id, zone_id, size_idx,
//! block_off}` used by every allocator operation, and the shared
//! capability set ([`MemoryBlock::get_data`], `block_size`,
//! `block_offset`, `get_lock`, `get_state`, `prep_hdr`) dispatched
//! statically over the two chunk shapes (HUGE, RUN) rather than through a
//! function-table tagged union.

use std::sync::{Arc, Mutex};

use crate::heap::Heap;
use crate::layout::{ChunkType, RunHeader};
use crate::operation::OperationContext;

/// A transient handle identifying one persistent location: either a whole
/// multi-chunk (HUGE) extent, or a single unit within a RUN's slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLoc {
    pub zone_id: u32,
    pub chunk_id: u32,
    /// Number of chunks in the extent (HUGE) or number of units requested
    /// (RUN). Zero means "no block".
    pub size_idx: u32,
    /// Unit index within the run; always 0 for HUGE.
    pub block_off: u32,
}

impl BlockLoc {
    pub const NONE: BlockLoc = BlockLoc {
        zone_id: 0,
        chunk_id: 0,
        size_idx: 0,
        block_off: 0,
    };

    pub fn is_none(&self) -> bool {
        self.size_idx == 0
    }
}

/// State of a memory block as recorded in the persistent layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Allocated,
}

/// The polymorphic memory-block handle: a HUGE multi-chunk extent, or a
/// single unit of a RUN's slab. Methods dispatch statically on the
/// variant; the variant itself is recovered from the persistent chunk
/// header's type tag by [`MemoryBlock::autodetect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBlock {
    Huge(BlockLoc),
    Run(BlockLoc),
}

impl MemoryBlock {
    pub fn loc(&self) -> BlockLoc {
        match self {
            MemoryBlock::Huge(l) | MemoryBlock::Run(l) => *l,
        }
    }

    pub fn is_none(&self) -> bool {
        self.loc().is_none()
    }

    /// Inspect the chunk header's type tag to recover which variant a bare
    /// `(zone_id, chunk_id)` pair refers to.
    pub fn autodetect(heap: &Heap, zone_id: u32, chunk_id: u32) -> Option<ChunkType> {
        heap.chunk_header(zone_id, chunk_id).chunk_type()
    }

    /// Start of the chunk's (HUGE) or run unit's (RUN) data, relative to
    /// the heap base.
    pub fn get_data(&self, heap: &Heap) -> *mut u8 {
        match self {
            MemoryBlock::Huge(l) => heap.chunk_data_ptr(l.zone_id, l.chunk_id),
            MemoryBlock::Run(l) => {
                let run_base = heap.chunk_data_ptr(l.zone_id, l.chunk_id);
                let run_hdr = unsafe { &*(run_base as *const RunHeader) };
                unsafe {
                    run_base
                        .add(RunHeader::data_offset())
                        .add(l.block_off as usize * run_hdr.unit_size as usize)
                }
            }
        }
    }

    /// Size, in bytes, of one unit of this block: the whole multi-chunk
    /// extent for HUGE, or one run unit for RUN.
    pub fn block_size(&self, heap: &Heap) -> u64 {
        match self {
            MemoryBlock::Huge(l) => l.size_idx as u64 * crate::layout::CHUNK_SIZE as u64,
            MemoryBlock::Run(l) => {
                let run_base = heap.chunk_data_ptr(l.zone_id, l.chunk_id);
                let run_hdr = unsafe { &*(run_base as *const RunHeader) };
                run_hdr.unit_size
            }
        }
    }

    /// Index of this block within its run (0 for HUGE).
    pub fn block_offset(&self) -> u32 {
        match self {
            MemoryBlock::Huge(_) => 0,
            MemoryBlock::Run(l) => l.block_off,
        }
    }

    /// The mutex protecting this block's bitmap word, for RUN; `None` for
    /// HUGE (whose caller substitutes the bucket mutex instead).
    pub fn get_lock(&self, heap: &Heap) -> Option<Arc<Mutex<()>>> {
        match self {
            MemoryBlock::Huge(_) => None,
            MemoryBlock::Run(l) => Some(heap.run_lock(l.zone_id, l.chunk_id)),
        }
    }

    /// Read the persistent state of this block: the chunk header's type
    /// tag for HUGE, or the corresponding bitmap bit for RUN.
    pub fn get_state(&self, heap: &Heap) -> BlockState {
        match self {
            MemoryBlock::Huge(l) => {
                match heap.chunk_header(l.zone_id, l.chunk_id).chunk_type() {
                    Some(ChunkType::Used) => BlockState::Allocated,
                    _ => BlockState::Free,
                }
            }
            MemoryBlock::Run(l) => {
                let run_base = heap.chunk_data_ptr(l.zone_id, l.chunk_id);
                let run_hdr = unsafe { &*(run_base as *const RunHeader) };
                if run_hdr.bit(l.block_off) {
                    BlockState::Allocated
                } else {
                    BlockState::Free
                }
            }
        }
    }

    /// Queue the redo entries that flip this block between FREE and
    /// ALLOCATED: the chunk header word for HUGE, or the relevant 64-bit
    /// bitmap word for RUN (bit position derived from `block_off`).
    pub fn prep_hdr(&self, heap: &Heap, new_state: BlockState, ctx: &mut OperationContext) {
        match self {
            MemoryBlock::Huge(l) => {
                let tag = match new_state {
                    BlockState::Allocated => ChunkType::Used,
                    BlockState::Free => ChunkType::Free,
                };
                heap.queue_chunk_state(ctx, l.zone_id, l.chunk_id, l.size_idx, tag);
            }
            MemoryBlock::Run(l) => {
                let run_base = heap.chunk_data_ptr(l.zone_id, l.chunk_id);
                let run_hdr = unsafe { &*(run_base as *const RunHeader) };
                let word_idx = (l.block_off / 64) as usize;
                let bit = l.block_off % 64;
                let mut word = run_hdr.bitmap[word_idx];
                match new_state {
                    BlockState::Allocated => word |= 1u64 << bit,
                    BlockState::Free => word &= !(1u64 << bit),
                }
                let bitmap_offset = heap.chunk_data_offset(l.zone_id, l.chunk_id)
                    + RunHeader::bitmap_field_offset()
                    + word_idx * 8;
                ctx.add_entry(bitmap_offset as u64, word);
            }
        }
    }
}

impl RunHeader {
    /// Byte offset of `bitmap` within [`RunHeader`], needed to compute the
    /// absolute redo offset of a single bitmap word.
    pub fn bitmap_field_offset() -> usize {
        std::mem::offset_of!(RunHeader, bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_loc_none_has_zero_size_idx() {
        assert!(BlockLoc::NONE.is_none());
        let present = BlockLoc {
            zone_id: 0,
            chunk_id: 1,
            size_idx: 1,
            block_off: 0,
        };
        assert!(!present.is_none());
    }
}
