//! The allocator front-end: `palloc_operation` unifies malloc, free, and
//! realloc over a single redo-log commit, plus the stateless iteration
//! entry points `palloc_first`/`palloc_next` and `palloc_usable_size`.

use std::sync::Arc;

use crate::bucket::{calc_units, coalesce_for_free, commit_fresh_run, heap_get_bestfit_block, rollback, HugeGuard, Reservation};
use crate::error::PallocError;
use crate::heap::Heap;
use crate::layout::{AllocationHeader, ChunkType, RunHeader, ALLOC_OFF};
use crate::memblock::{BlockLoc, BlockState, MemoryBlock};
use crate::operation::OperationContext;
use crate::pmem::MemHint;
use crate::redo::RedoLog;

/// Caller-supplied initializer for a fresh allocation's user region.
/// Returning `Err(())` cancels the allocation (`ECANCELED`); the
/// reservation is rolled back and nothing becomes visible.
pub type Constructor<'a> = dyn Fn(*mut u8, usize) -> Result<(), ()> + 'a;

/// Read the allocation header preceding `user_off` without validating
/// that `user_off` is actually live -- callers must already know it is.
fn read_header(heap: &Heap, user_off: u64) -> AllocationHeader {
    let hdr_off = user_off - ALLOC_OFF as u64;
    unsafe { *(heap.offset_to_ptr(hdr_off) as *const AllocationHeader) }
}

/// Recover the `MemoryBlock` backing a live user offset from its
/// allocation header: the header names `{zone_id, chunk_id}` directly;
/// whether it's HUGE or RUN, and a RUN block's unit index, are derived
/// from the owning chunk's current header (grounded in the original's
/// `get_mblock_from_alloc`, see SPEC_FULL.md section 3).
pub(crate) fn resolve_block(heap: &Heap, user_off: u64) -> MemoryBlock {
    let hdr = read_header(heap, user_off);
    let zone_id = hdr.zone_id;
    let chunk_id = hdr.chunk_id as u32;
    if heap.chunk_header(zone_id, chunk_id).chunk_type() == Some(ChunkType::Run) {
        let run_ptr = heap.chunk_data_ptr(zone_id, chunk_id);
        let run_hdr = unsafe { &*(run_ptr as *const RunHeader) };
        let run_data_off = heap.ptr_to_offset(run_ptr) + RunHeader::data_offset() as u64;
        let hdr_off = user_off - ALLOC_OFF as u64;
        let block_off = ((hdr_off - run_data_off) / run_hdr.unit_size) as u32;
        MemoryBlock::Run(BlockLoc { zone_id, chunk_id, size_idx: 1, block_off })
    } else {
        let size_idx = heap.chunk_header(zone_id, chunk_id).size_idx;
        MemoryBlock::Huge(BlockLoc { zone_id, chunk_id, size_idx, block_off: 0 })
    }
}

fn write_allocation_header(heap: &Heap, block: &MemoryBlock, total_size: u64) -> u64 {
    let loc = block.loc();
    let hdr = AllocationHeader {
        chunk_id: loc.chunk_id as u64,
        size: total_size,
        zone_id: loc.zone_id,
        _pad: 0,
    };
    let block_start = block.get_data(heap);
    unsafe {
        let bytes: &[u8] = bytemuck::bytes_of(&hdr);
        heap.ops().memcpy(block_start, bytes.as_ptr(), bytes.len(), MemHint::Default);
        let user_ptr = block_start.add(ALLOC_OFF);
        heap.ptr_to_offset(user_ptr)
    }
}

/// Single entry point unifying allocate/free/realloc over one atomic redo
/// commit.
pub fn palloc_operation(
    heap: &Heap,
    old_off: u64,
    dest_off: Option<u64>,
    new_size: u64,
    ctor: Option<&Constructor>,
) -> Result<u64, PallocError> {
    let _heap_guard = heap.heap_lock.read().unwrap();

    if old_off == 0 && new_size == 0 {
        return Ok(0);
    }

    // Covers both the same-size and the shrink case: neither moves the
    // block, so both are a no-op short of touching the redo log at all.
    if old_off != 0 && new_size > 0 {
        let existing = read_header(heap, old_off);
        if existing.usable_size() >= new_size {
            return Ok(old_off);
        }
    }

    let (redo_idx, redo_ptr, capacity) = heap.acquire_redo();
    let redo = unsafe { RedoLog::new(redo_ptr, capacity) };
    let mut ctx = OperationContext::new(redo, heap.ops(), heap.base());

    log::trace!("palloc_operation: old_off=0x{old_off:x} new_size={new_size} redo_slot={redo_idx}");
    let outcome = run_operation(heap, &mut ctx, old_off, dest_off, new_size, ctor);

    match outcome {
        Ok(mut post) => {
            if ctx.is_empty() {
                heap.release_redo(redo_idx);
                return Ok(post.result_off);
            }
            let entries = ctx.len();
            ctx.commit();
            log::debug!("palloc_operation: committed {entries} redo entries -> 0x{:x}", post.result_off);
            heap.release_redo(redo_idx);
            post.finish(heap);
            Ok(post.result_off)
        }
        Err((err, reservation, mut huge_guard)) => {
            if let Some(r) = reservation {
                rollback(heap, &r, &mut huge_guard);
            }
            heap.release_redo(redo_idx);
            log::debug!("palloc_operation: failed with {err}");
            Err(err)
        }
    }
}

/// Bookkeeping a successful `run_operation` defers until after the redo
/// commit lands: bucket reinsertion for coalesced/fresh-run blocks. Also
/// carries the HUGE bucket guard (if this operation ever touched it) so it
/// stays locked across the caller's `ctx.commit()` and is only released
/// once `self` is dropped, after `finish` runs.
struct PostCommit<'a> {
    result_off: u64,
    huge_free_reinsert: Option<(u32, u32, u32)>,
    run_free_reinsert: Option<(usize, u32, u32, u32)>,
    fresh_run: Option<(usize, u32, u32, u32)>,
    huge_guard: HugeGuard<'a>,
}

impl<'a> PostCommit<'a> {
    fn finish(&mut self, heap: &Heap) {
        if let Some((zone_id, chunk_id, size_idx)) = self.huge_free_reinsert {
            self.huge_guard.get().insert(zone_id, chunk_id, size_idx);
        }
        if let Some((class_idx, zone_id, chunk_id, block_off)) = self.run_free_reinsert {
            heap.buckets.runs[class_idx].lock().unwrap().push_free(zone_id, chunk_id, block_off);
        }
        if let Some((class_idx, zone_id, chunk_id, allocated_off)) = self.fresh_run {
            commit_fresh_run(heap, class_idx, zone_id, chunk_id, allocated_off);
        }
    }
}

/// What freeing a block leaves for the caller to reinsert into the
/// appropriate bucket once the redo commit has landed.
enum FreeOutcome {
    Huge { zone_id: u32, chunk_id: u32, size_idx: u32 },
    Run { class_idx: usize, zone_id: u32, chunk_id: u32, block_off: u32 },
}

#[allow(clippy::type_complexity)]
fn run_operation<'a>(
    heap: &'a Heap,
    ctx: &mut OperationContext,
    old_off: u64,
    dest_off: Option<u64>,
    new_size: u64,
    ctor: Option<&Constructor>,
) -> Result<PostCommit<'a>, (PallocError, Option<Reservation>, HugeGuard<'a>)> {
    let mut huge_guard = HugeGuard::new(heap);

    // --- free-only path --------------------------------------------------
    if new_size == 0 {
        let old_block = resolve_block(heap, old_off);
        let lock = old_block.get_lock(heap);
        let _guard = lock.as_ref().map(|l| l.lock().unwrap());
        let outcome = free_block(heap, ctx, old_block, &mut huge_guard);
        if let Some(off) = dest_off {
            ctx.add_entry(off, 0);
        }
        let (huge_free_reinsert, run_free_reinsert) = match outcome {
            FreeOutcome::Huge { zone_id, chunk_id, size_idx } => (Some((zone_id, chunk_id, size_idx)), None),
            FreeOutcome::Run { class_idx, zone_id, chunk_id, block_off } => {
                (None, Some((class_idx, zone_id, chunk_id, block_off)))
            }
        };
        return Ok(PostCommit {
            result_off: 0,
            huge_free_reinsert,
            run_free_reinsert,
            fresh_run: None,
            huge_guard,
        });
    }

    // --- allocate (fresh or realloc) -------------------------------------
    let total_size = new_size + ALLOC_OFF as u64;
    let kind = heap.bucket_for(total_size);
    let min_units = calc_units(kind, total_size);

    let (new_block, reservation) = match heap_get_bestfit_block(heap, kind, min_units, ctx, &mut huge_guard) {
        Ok(v) => v,
        Err(e) => return Err((e, None, huge_guard)),
    };

    let user_off = write_allocation_header(heap, &new_block, total_size);
    let user_ptr = heap.offset_to_ptr(user_off);

    if let Some(f) = ctor {
        if f(user_ptr, new_size as usize).is_err() {
            return Err((PallocError::Canceled, Some(reservation), huge_guard));
        }
    }

    // Old block is resolved before either lock is taken, so the two locks
    // (when both blocks carry one) can be acquired in address order
    // regardless of which side of the realloc call them "new"/"old". Both
    // `new_lock`/`old_lock` are kept alive for the rest of this function so
    // the guards below can borrow from them. Neither side ever carries a
    // lock for a HUGE block -- that's `huge_guard`'s job instead.
    let old_block = if old_off != 0 { Some(resolve_block(heap, old_off)) } else { None };
    let new_lock = new_block.get_lock(heap);
    let old_lock = old_block.as_ref().and_then(|b| b.get_lock(heap));

    let same_lock = matches!((&new_lock, &old_lock), (Some(a), Some(b)) if Arc::ptr_eq(a, b));
    let new_first = match (&new_lock, &old_lock) {
        (Some(a), Some(b)) => Arc::as_ptr(a) <= Arc::as_ptr(b),
        _ => true,
    };
    let (mut _new_guard, mut _old_guard) = (None, None);
    if new_first {
        _new_guard = new_lock.as_ref().map(|l| l.lock().unwrap());
        if !same_lock {
            _old_guard = old_lock.as_ref().map(|l| l.lock().unwrap());
        }
    } else {
        _old_guard = old_lock.as_ref().map(|l| l.lock().unwrap());
        _new_guard = new_lock.as_ref().map(|l| l.lock().unwrap());
    }

    new_block.prep_hdr(heap, BlockState::Allocated, ctx);

    let fresh_run = match &reservation {
        Reservation::RunFresh { class_idx, .. } => {
            let loc = new_block.loc();
            Some((*class_idx, loc.zone_id, loc.chunk_id, loc.block_off))
        }
        _ => None,
    };

    let mut huge_free_reinsert = None;
    let mut run_free_reinsert = None;

    if let Some(old_block) = old_block {
        match free_block(heap, ctx, old_block, &mut huge_guard) {
            FreeOutcome::Huge { zone_id, chunk_id, size_idx } => {
                huge_free_reinsert = Some((zone_id, chunk_id, size_idx));
            }
            FreeOutcome::Run { class_idx, zone_id, chunk_id, block_off } => {
                run_free_reinsert = Some((class_idx, zone_id, chunk_id, block_off));
            }
        }

        let copy_len = new_size.min(read_header(heap, old_off).usable_size()) as usize;
        unsafe {
            let src = heap.offset_to_ptr(old_off);
            heap.ops().memcpy(user_ptr, src, copy_len, MemHint::Default);
        }
    }

    if let Some(off) = dest_off {
        ctx.add_entry(off, user_off);
    }

    Ok(PostCommit {
        result_off: user_off,
        huge_free_reinsert,
        run_free_reinsert,
        fresh_run,
        huge_guard,
    })
}

/// Free `block` via the redo log, reporting what bucket bookkeeping the
/// caller must do once the operation's commit has landed. `huge` is the
/// operation's `HugeGuard`; a HUGE free locks it (or reuses the lock if
/// this operation already holds it), a RUN free never touches it.
fn free_block(heap: &Heap, ctx: &mut OperationContext, block: MemoryBlock, huge: &mut HugeGuard) -> FreeOutcome {
    match block {
        MemoryBlock::Huge(loc) => {
            let (start, len) = coalesce_for_free(huge, heap, loc.zone_id, loc.chunk_id, loc.size_idx);
            heap.queue_chunk_state(ctx, loc.zone_id, start, len, ChunkType::Free);
            FreeOutcome::Huge { zone_id: loc.zone_id, chunk_id: start, size_idx: len }
        }
        MemoryBlock::Run(loc) => {
            block.prep_hdr(heap, BlockState::Free, ctx);
            let class_idx = run_class_idx(heap, loc.zone_id, loc.chunk_id);
            FreeOutcome::Run { class_idx, zone_id: loc.zone_id, chunk_id: loc.chunk_id, block_off: loc.block_off }
        }
    }
}

fn run_class_idx(heap: &Heap, zone_id: u32, chunk_id: u32) -> usize {
    let run_ptr = heap.chunk_data_ptr(zone_id, chunk_id);
    let unit_size = unsafe { (*(run_ptr as *const RunHeader)).unit_size };
    heap.config().alloc_classes.iter().position(|&c| c == unit_size).expect("run unit size matches a configured class")
}

/// Bytes usable by the caller at `off`: `header.size - header offset`.
pub fn palloc_usable_size(heap: &Heap, off: u64) -> u64 {
    read_header(heap, off).usable_size()
}

/// First live allocation strictly after `after`, or `None` if there are
/// none. `after == u64::MAX` means "from the start".
pub fn palloc_first(heap: &Heap) -> Option<u64> {
    palloc_next_inner(heap, u64::MAX)
}

/// Next live allocation strictly after `off`, ordered by
/// `(zone_id, chunk_id, block_off)`.
pub fn palloc_next(heap: &Heap, off: u64) -> Option<u64> {
    let cur = resolve_block(heap, off);
    palloc_next_inner(heap, encode_order_key(&cur))
}

fn encode_order_key(block: &MemoryBlock) -> u64 {
    let loc = block.loc();
    ((loc.zone_id as u64) << 48) | ((loc.chunk_id as u64) << 16) | loc.block_off as u64
}

fn palloc_next_inner(heap: &Heap, after_key: u64) -> Option<u64> {
    for zone_id in 0..heap.num_zones() {
        let zh = heap.zone_header(zone_id);
        let mut chunk_id = 0u32;
        while chunk_id < zh.chunk_count {
            let ch = heap.chunk_header(zone_id, chunk_id);
            match ch.chunk_type() {
                Some(ChunkType::Used) => {
                    let key = (zone_id as u64) << 48 | (chunk_id as u64) << 16;
                    if after_key == u64::MAX || key > after_key {
                        let block = MemoryBlock::Huge(BlockLoc { zone_id, chunk_id, size_idx: ch.size_idx, block_off: 0 });
                        let ptr = unsafe { block.get_data(heap).add(ALLOC_OFF) };
                        return Some(heap.ptr_to_offset(ptr));
                    }
                    chunk_id += ch.size_idx.max(1);
                }
                Some(ChunkType::Run) => {
                    let run_ptr = heap.chunk_data_ptr(zone_id, chunk_id);
                    let run_hdr = unsafe { &*(run_ptr as *const RunHeader) };
                    for off in 0..run_hdr.nbits {
                        let key = (zone_id as u64) << 48 | (chunk_id as u64) << 16 | off as u64;
                        if run_hdr.bit(off) && (after_key == u64::MAX || key > after_key) {
                            let block = MemoryBlock::Run(BlockLoc { zone_id, chunk_id, size_idx: 1, block_off: off });
                            let ptr = unsafe { block.get_data(heap) };
                            return Some(heap.ptr_to_offset(ptr));
                        }
                    }
                    chunk_id += 1;
                }
                _ => chunk_id += ch.size_idx.max(1),
            }
        }
    }
    None
}

/// Iterator over every live allocation in a heap, in `(zone_id, chunk_id,
/// block_off)` order. Stateless under the hood -- each `next()` is just
/// another `palloc_next` call -- so it reflects concurrent frees/allocs
/// made while the iteration is in progress rather than a frozen snapshot.
enum Cursor {
    NotStarted,
    At(u64),
    Done,
}

pub struct LiveAllocations<'a> {
    heap: &'a Heap,
    cursor: Cursor,
}

impl<'a> Iterator for LiveAllocations<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let found = match self.cursor {
            Cursor::Done => None,
            Cursor::NotStarted => palloc_first(self.heap),
            Cursor::At(off) => palloc_next(self.heap, off),
        };
        self.cursor = match found {
            Some(off) => Cursor::At(off),
            None => Cursor::Done,
        };
        found
    }
}

impl Heap {
    /// Iterate every live allocation's user offset.
    pub fn iter(&self) -> LiveAllocations<'_> {
        LiveAllocations { heap: self, cursor: Cursor::NotStarted }
    }
}
