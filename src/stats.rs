//! Heap-wide occupancy statistics, derived by walking the persistent chunk
//! headers rather than tracked incrementally -- `palloc_operation` has
//! enough bookkeeping of its own without a running counter to keep
//! consistent under rollback.

use crate::heap::Heap;
use crate::layout::{ChunkType, CHUNK_SIZE};

/// A point-in-time snapshot of a heap's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapStats {
    pub total_bytes: u64,
    pub allocated_bytes: u64,
    pub free_bytes: u64,
    pub chunks_used: u32,
    pub chunks_free: u32,
    pub runs_active: u32,
}

/// Walk every zone's chunk table once, classifying each chunk (or run
/// unit) and accumulating totals. `O(chunks + live run units)`.
pub fn heap_stats(heap: &Heap) -> HeapStats {
    let mut stats = HeapStats::default();

    for zone_id in 0..heap.num_zones() {
        let zh = heap.zone_header(zone_id);
        let mut chunk_id = 0u32;
        while chunk_id < zh.chunk_count {
            let ch = heap.chunk_header(zone_id, chunk_id);
            match ch.chunk_type() {
                Some(ChunkType::Free) => {
                    let len = ch.size_idx.max(1);
                    stats.chunks_free += len;
                    stats.free_bytes += len as u64 * CHUNK_SIZE as u64;
                    chunk_id += len;
                }
                Some(ChunkType::Used) => {
                    let len = ch.size_idx.max(1);
                    stats.chunks_used += len;
                    stats.allocated_bytes += len as u64 * CHUNK_SIZE as u64;
                    chunk_id += len;
                }
                Some(ChunkType::Run) => {
                    stats.chunks_used += 1;
                    stats.runs_active += 1;
                    let (used_units, total_units, unit_size) = run_occupancy(heap, zone_id, chunk_id);
                    stats.allocated_bytes += used_units as u64 * unit_size;
                    stats.free_bytes += (total_units - used_units) as u64 * unit_size;
                    chunk_id += 1;
                }
                Some(ChunkType::Footer) | None => {
                    chunk_id += 1;
                }
            }
        }
    }

    stats.total_bytes = (stats.chunks_used + stats.chunks_free) as u64 * CHUNK_SIZE as u64;
    stats
}

fn run_occupancy(heap: &Heap, zone_id: u32, chunk_id: u32) -> (u32, u32, u64) {
    use crate::layout::RunHeader;
    let run_ptr = heap.chunk_data_ptr(zone_id, chunk_id);
    let run_hdr = unsafe { &*(run_ptr as *const RunHeader) };
    let used = (0..run_hdr.nbits).filter(|&off| run_hdr.bit(off)).count() as u32;
    (used, run_hdr.nbits, run_hdr.unit_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::palloc_operation;
    use crate::config::HeapConfig;

    fn small_heap() -> Heap {
        Heap::open_anon(
            4 << 20,
            HeapConfig {
                chunks_per_zone: 8,
                redo_pool_size: 4,
                ..HeapConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn fresh_heap_is_entirely_free() {
        let heap = small_heap();
        let stats = heap_stats(&heap);
        assert_eq!(stats.allocated_bytes, 0);
        assert_eq!(stats.chunks_used, 0);
        assert!(stats.chunks_free > 0);
        assert_eq!(stats.total_bytes, stats.free_bytes);
    }

    #[test]
    fn allocation_moves_bytes_from_free_to_allocated() {
        let heap = small_heap();
        let before = heap_stats(&heap);
        let off = palloc_operation(&heap, 0, None, 100, None).unwrap();
        let after = heap_stats(&heap);
        assert!(after.allocated_bytes > before.allocated_bytes);
        assert_eq!(after.total_bytes, before.total_bytes);
        assert!(after.runs_active >= 1);
        let _ = off;
    }
}
