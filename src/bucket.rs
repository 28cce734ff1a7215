//! Transient free-block containers: the process-wide HUGE bucket (whole
//! free chunk extents, coalescing neighbors) and the per-allocation-class
//! RUN buckets (free units of one unit size). Best-fit selection is
//! smallest-size-that-fits with FIFO tie-break among equal sizes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::error::PallocError;
use crate::heap::Heap;
use crate::layout::{ChunkType, RunHeader, CHUNK_SIZE};
use crate::memblock::{BlockLoc, MemoryBlock};
use crate::operation::OperationContext;

/// Whole multi-chunk free extents, keyed by chunk count. FIFO within a
/// size class; coalescing with physical neighbors happens at both insert
/// (on free, via [`coalesce_for_free`]) and never needs undoing, since a
/// merged entry is just a bigger entry at the same key space.
pub struct HugeBucket {
    by_size: BTreeMap<u32, VecDeque<(u32, u32)>>,
}

impl HugeBucket {
    pub fn new() -> Self {
        Self { by_size: BTreeMap::new() }
    }

    pub fn insert(&mut self, zone_id: u32, chunk_id: u32, size_idx: u32) {
        self.by_size.entry(size_idx).or_default().push_back((zone_id, chunk_id));
    }

    /// Remove a specific, known-present entry (used to pull a neighbor out
    /// of the bucket before merging it into a coalesced extent).
    pub fn remove(&mut self, zone_id: u32, chunk_id: u32, size_idx: u32) -> bool {
        if let Some(q) = self.by_size.get_mut(&size_idx) {
            if let Some(pos) = q.iter().position(|&e| e == (zone_id, chunk_id)) {
                q.remove(pos);
                if q.is_empty() {
                    self.by_size.remove(&size_idx);
                }
                return true;
            }
        }
        false
    }

    /// Best-fit: the smallest size class `>= min_chunks`, FIFO within it.
    pub fn take_best_fit(&mut self, min_chunks: u32) -> Option<(u32, u32, u32)> {
        let key = *self.by_size.range(min_chunks..).next()?.0;
        let q = self.by_size.get_mut(&key).unwrap();
        let entry = q.pop_front().unwrap();
        if q.is_empty() {
            self.by_size.remove(&key);
        }
        Some((entry.0, entry.1, key))
    }
}

impl Default for HugeBucket {
    fn default() -> Self {
        Self::new()
    }
}

/// Free units of one allocation class, within runs already claimed from
/// the HUGE bucket.
pub struct RunBucket {
    pub unit_size: u64,
    free: VecDeque<(u32, u32, u32)>,
}

impl RunBucket {
    pub fn new(unit_size: u64) -> Self {
        Self { unit_size, free: VecDeque::new() }
    }

    pub fn push_free(&mut self, zone_id: u32, chunk_id: u32, block_off: u32) {
        self.free.push_back((zone_id, chunk_id, block_off));
    }

    pub fn take_free(&mut self) -> Option<(u32, u32, u32)> {
        self.free.pop_front()
    }
}

pub struct Buckets {
    pub huge: Mutex<HugeBucket>,
    pub runs: Vec<Mutex<RunBucket>>,
}

/// Which allocation class a request resolves to: the process-wide HUGE
/// bucket, or one of the per-class RUN buckets (by index into
/// `HeapConfig::alloc_classes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Huge,
    Run(usize),
}

/// Lazily locks the heap-wide HUGE bucket at most once per operation, and
/// holds it until dropped. HUGE has no per-block lock the way a RUN unit
/// has a per-chunk bitmap lock (see `memblock::MemoryBlock::get_lock`); the
/// bucket mutex substitutes. An operation that touches the HUGE bucket more
/// than once -- a reservation and, on a realloc, a same-call HUGE free --
/// reuses this one guard rather than locking (and deadlocking on) the mutex
/// again. Callers are expected to keep a `HugeGuard` alive from the first
/// reservation/coalesce through the redo commit that follows, so no other
/// thread can observe a HUGE split's remainder before this operation's own
/// commit has made it durable (see `alloc::run_operation`).
pub struct HugeGuard<'a> {
    heap: &'a Heap,
    guard: Option<MutexGuard<'a, HugeBucket>>,
}

impl<'a> HugeGuard<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self { heap, guard: None }
    }

    pub fn get(&mut self) -> &mut HugeBucket {
        if self.guard.is_none() {
            self.guard = Some(self.heap.buckets.huge.lock().unwrap());
        }
        &mut *self.guard.as_mut().unwrap()
    }
}

/// What [`heap_get_bestfit_block`] removed from transient bucket state, so
/// a canceled allocation can be undone exactly -- put back precisely what
/// was taken, rather than re-deriving free state from scratch.
pub enum Reservation {
    Huge {
        zone_id: u32,
        original_chunk_id: u32,
        original_size_idx: u32,
        reserved_units: u32,
    },
    RunExisting {
        class_idx: usize,
        zone_id: u32,
        chunk_id: u32,
        block_off: u32,
    },
    RunFresh {
        class_idx: usize,
        inner: Box<Reservation>,
    },
}

/// Chunk-granularity for HUGE, one unit for RUN.
pub fn calc_units(kind: BucketKind, bytes: u64) -> u32 {
    match kind {
        BucketKind::Huge => ((bytes as usize + CHUNK_SIZE - 1) / CHUNK_SIZE) as u32,
        BucketKind::Run(_) => 1,
    }
}

/// Resolve a reservation of at least `min_units` units from `kind`, queuing
/// any redo entries the reservation itself requires (a HUGE split writes
/// the remainder's new head/footer; a RUN bucket that must claim a fresh
/// run writes that run's chunk-header flip) into `ctx` -- they commit
/// atomically with the rest of the calling `palloc_operation`.
///
/// `huge` locks `heap.buckets.huge` only if this reservation actually
/// touches it (a HUGE request, or a RUN bucket empty enough to need a
/// fresh run); the caller is expected to keep `huge` alive from this call
/// through the redo commit that follows -- see `alloc::run_operation`.
pub fn heap_get_bestfit_block(
    heap: &Heap,
    kind: BucketKind,
    min_units: u32,
    ctx: &mut OperationContext,
    huge: &mut HugeGuard,
) -> Result<(MemoryBlock, Reservation), PallocError> {
    match kind {
        BucketKind::Huge => reserve_huge(heap, huge.get(), min_units, ctx),
        BucketKind::Run(idx) => {
            let existing = heap.buckets.runs[idx].lock().unwrap().take_free();
            if let Some((zone_id, chunk_id, block_off)) = existing {
                let block = MemoryBlock::Run(BlockLoc { zone_id, chunk_id, size_idx: 1, block_off });
                let reservation = Reservation::RunExisting { class_idx: idx, zone_id, chunk_id, block_off };
                return Ok((block, reservation));
            }
            claim_new_run(heap, idx, ctx, huge)
        }
    }
}

fn reserve_huge(
    heap: &Heap,
    huge: &mut HugeBucket,
    min_units: u32,
    ctx: &mut OperationContext,
) -> Result<(MemoryBlock, Reservation), PallocError> {
    let (zone_id, chunk_id, size_idx) = huge.take_best_fit(min_units).ok_or(PallocError::NoMemory)?;
    log::trace!("heap_get_bestfit_block: HUGE min_units={min_units} -> zone={zone_id} chunk={chunk_id} size_idx={size_idx}");
    if size_idx > min_units {
        let remainder_start = chunk_id + min_units;
        let remainder_size = size_idx - min_units;
        heap.queue_chunk_state(ctx, zone_id, remainder_start, remainder_size, ChunkType::Free);
        huge.insert(zone_id, remainder_start, remainder_size);
    }
    let block = MemoryBlock::Huge(BlockLoc {
        zone_id,
        chunk_id,
        size_idx: min_units,
        block_off: 0,
    });
    let reservation = Reservation::Huge {
        zone_id,
        original_chunk_id: chunk_id,
        original_size_idx: size_idx,
        reserved_units: min_units,
    };
    Ok((block, reservation))
}

/// Undo a reservation that was never committed (constructor canceled the
/// allocation): put back exactly what [`heap_get_bestfit_block`] removed.
/// Any redo entries it queued into the caller's `OperationContext` are
/// discarded along with the rest of that context, so nothing persistent
/// needs reverting here -- only transient bucket bookkeeping. `huge` is the
/// same guard the reservation was taken under; for a HUGE reservation it is
/// necessarily already locked.
pub fn rollback(heap: &Heap, reservation: &Reservation, huge: &mut HugeGuard) {
    match reservation {
        Reservation::Huge { zone_id, original_chunk_id, original_size_idx, reserved_units } => {
            let huge = huge.get();
            if *original_size_idx > *reserved_units {
                let remainder_start = original_chunk_id + reserved_units;
                let remainder_size = original_size_idx - reserved_units;
                huge.remove(*zone_id, remainder_start, remainder_size);
            }
            huge.insert(*zone_id, *original_chunk_id, *original_size_idx);
        }
        Reservation::RunExisting { class_idx, zone_id, chunk_id, block_off } => {
            heap.buckets.runs[*class_idx].lock().unwrap().push_free(*zone_id, *chunk_id, *block_off);
        }
        Reservation::RunFresh { inner, .. } => rollback(heap, inner, huge),
    }
}

/// Claim a fresh run from the HUGE bucket for allocation class `class_idx`:
/// reserve one chunk, format its [`RunHeader`] directly (the chunk is
/// still persistently FREE, so nothing else can observe this write), then
/// queue the redo entry flipping the chunk's header to RUN. Returns a
/// reservation of unit 0; remaining units become available to the class
/// only after [`commit_fresh_run`] runs, post-commit -- the same ordering
/// HUGE's coalesce-then-reinsert uses.
fn claim_new_run(
    heap: &Heap,
    class_idx: usize,
    ctx: &mut OperationContext,
    huge: &mut HugeGuard,
) -> Result<(MemoryBlock, Reservation), PallocError> {
    let (huge_block, huge_reservation) = reserve_huge(heap, huge.get(), 1, ctx)?;
    let MemoryBlock::Huge(loc) = huge_block else {
        unreachable!("HUGE bucket always yields a Huge block")
    };

    let unit_size = heap.buckets.runs[class_idx].lock().unwrap().unit_size;
    let nbits = RunHeader::units_for(unit_size);
    let run_hdr = RunHeader {
        unit_size,
        nbits,
        _pad: 0,
        bitmap: [0u64; RunHeader::BITMAP_WORDS],
    };
    let run_base = heap.chunk_data_ptr(loc.zone_id, loc.chunk_id);
    unsafe {
        let bytes: &[u8] = bytemuck::bytes_of(&run_hdr);
        heap.ops().memcpy(run_base, bytes.as_ptr(), bytes.len(), crate::pmem::MemHint::Default);
    }

    heap.queue_chunk_state(ctx, loc.zone_id, loc.chunk_id, 0, ChunkType::Run);

    let block = MemoryBlock::Run(BlockLoc { zone_id: loc.zone_id, chunk_id: loc.chunk_id, size_idx: 1, block_off: 0 });
    let reservation = Reservation::RunFresh { class_idx, inner: Box::new(huge_reservation) };
    Ok((block, reservation))
}

/// After a `palloc_operation` that froze a fresh run via [`claim_new_run`]
/// commits successfully, make every unit but the one just allocated
/// available to the class's free list.
pub fn commit_fresh_run(heap: &Heap, class_idx: usize, zone_id: u32, chunk_id: u32, allocated_off: u32) {
    let unit_size = heap.buckets.runs[class_idx].lock().unwrap().unit_size;
    let nbits = RunHeader::units_for(unit_size);
    let mut bucket = heap.buckets.runs[class_idx].lock().unwrap();
    for off in 0..nbits {
        if off != allocated_off {
            bucket.push_free(zone_id, chunk_id, off);
        }
    }
}

/// Coalesce a block about to be freed with any FREE physical neighbors,
/// removing them from the HUGE bucket (they must be merged into one
/// entry, not left as two). Returns the merged extent's bounds; the
/// caller queues the merged head/footer redo entries and, only after the
/// overall commit succeeds, reinserts the merged entry into the bucket.
/// Takes the caller's own `HugeGuard` rather than locking
/// `heap.buckets.huge` directly, for the same reason as
/// [`heap_get_bestfit_block`] -- always actually needed here, since this is
/// only ever called to free a HUGE block.
pub fn coalesce_for_free(huge: &mut HugeGuard, heap: &Heap, zone_id: u32, chunk_id: u32, size_idx: u32) -> (u32, u32) {
    let huge = huge.get();
    let mut start = chunk_id;
    let mut len = size_idx;

    let chunks_per_zone = heap.chunks_per_zone();

    // Forward neighbor: immediately follows this extent.
    let next = start + len;
    if next < chunks_per_zone {
        let next_hdr = heap.chunk_header(zone_id, next);
        if next_hdr.chunk_type() == Some(ChunkType::Free) && next_hdr.size_idx > 0 {
            if huge.remove(zone_id, next, next_hdr.size_idx) {
                len += next_hdr.size_idx;
            }
        }
    }

    // Backward neighbor: either the chunk directly before `start` (a
    // 1-chunk free extent, recognizable because it's a head not a
    // footer), or, if that chunk is a FOOTER, the extent it terminates.
    if start > 0 {
        let prev_hdr = heap.chunk_header(zone_id, start - 1);
        match prev_hdr.chunk_type() {
            Some(ChunkType::Free) if prev_hdr.size_idx == 1 => {
                if huge.remove(zone_id, start - 1, 1) {
                    start -= 1;
                    len += 1;
                }
            }
            Some(ChunkType::Footer) if prev_hdr.size_idx > 0 => {
                let prev_start = start - prev_hdr.size_idx;
                let prev_head = heap.chunk_header(zone_id, prev_start);
                if prev_head.chunk_type() == Some(ChunkType::Free)
                    && prev_head.size_idx == prev_hdr.size_idx
                    && huge.remove(zone_id, prev_start, prev_hdr.size_idx)
                {
                    start = prev_start;
                    len += prev_hdr.size_idx;
                }
            }
            _ => {}
        }
    }

    (start, len)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_bucket_best_fit_picks_smallest_sufficient_size() {
        let mut b = HugeBucket::new();
        b.insert(0, 10, 5);
        b.insert(0, 20, 2);
        b.insert(0, 30, 3);
        let (_, chunk_id, size) = b.take_best_fit(3).unwrap();
        assert_eq!((chunk_id, size), (30, 3));
    }

    #[test]
    fn huge_bucket_fifo_within_equal_size() {
        let mut b = HugeBucket::new();
        b.insert(0, 10, 4);
        b.insert(0, 20, 4);
        let (_, first, _) = b.take_best_fit(4).unwrap();
        assert_eq!(first, 10);
        let (_, second, _) = b.take_best_fit(4).unwrap();
        assert_eq!(second, 20);
    }

    #[test]
    fn run_bucket_free_list_is_fifo() {
        let mut r = RunBucket::new(64);
        r.push_free(0, 1, 0);
        r.push_free(0, 1, 1);
        assert_eq!(r.take_free(), Some((0, 1, 0)));
        assert_eq!(r.take_free(), Some((0, 1, 1)));
        assert_eq!(r.take_free(), None);
    }
}
