//! The per-call accumulator that turns a sequence of metadata changes into
//! one atomic redo-log commit.

use crate::pmem::PmemOps;
use crate::redo::RedoLog;

/// The external consumer interface a redo log is checked against: a base
/// pointer for offset-to-address resolution, a bounds predicate, and the
/// log's entry capacity.
pub trait RedoCtx {
    fn base(&self) -> *mut u8;
    fn check_offset(&self, offset: u64) -> bool;
    fn redo_num_entries(&self) -> usize;
}

/// Accumulates the redo entries produced by a single `palloc_operation`
/// call (or an internal sub-operation like claiming a new run) and commits
/// them as one atomic unit.
///
/// Entries are buffered in plain memory until [`OperationContext::commit`]
/// -- only at that point are they written into the redo log's volatile
/// mirror and published, so building up a multi-step operation (reserve,
/// prepare, record header flip, record destination write) never touches
/// persistent state until the single commit at the end.
pub struct OperationContext<'a> {
    redo: RedoLog,
    entries: Vec<(u64, u64)>,
    ops: &'a dyn PmemOps,
    base: *mut u8,
}

impl<'a> OperationContext<'a> {
    pub fn new(redo: RedoLog, ops: &'a dyn PmemOps, base: *mut u8) -> Self {
        Self {
            redo,
            entries: Vec::new(),
            ops,
            base,
        }
    }

    /// Queue `*(base + offset) = value` as part of this commit.
    pub fn add_entry(&mut self, offset: u64, value: u64) {
        debug_assert_eq!(offset & crate::redo::FINISH_FLAG, 0, "offset must be even");
        self.entries.push((offset, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Write every queued entry into the redo log and commit: `store` for
    /// all but the last, `store_last` (checksum + persist) for the final
    /// one, then `process` to apply them and retire the log. Consumes
    /// `self`, returning the now-idle `RedoLog` for reuse.
    ///
    /// Calling this with no queued entries is a caller error -- a
    /// `palloc_operation(0, _, 0, ...)` no-op never constructs a context.
    pub fn commit(mut self) -> RedoLog {
        assert!(!self.entries.is_empty(), "commit called with no redo entries");
        let last = self.entries.len() - 1;
        for (i, (offset, value)) in self.entries[..last].iter().enumerate() {
            self.redo.store(i, *offset, *value);
        }
        let (offset, value) = self.entries[last];
        self.redo.store_last(last, offset, value, self.ops);
        self.redo.process(self.entries.len(), self.ops, self.base);
        self.redo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pmem::MemHint;
    use crate::redo::RedoSlot;
    use std::cell::RefCell;

    struct VecPmem {
        buf: RefCell<Vec<u8>>,
    }

    impl PmemOps for VecPmem {
        fn base(&self) -> *mut u8 {
            self.buf.borrow_mut().as_mut_ptr()
        }
        fn flush(&self, _ptr: *const u8, _len: usize) {}
        fn drain(&self) {}
        unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, _hint: MemHint) {
            std::ptr::copy_nonoverlapping(src, dst, len);
        }
        unsafe fn memset(&self, dst: *mut u8, val: u8, len: usize, _hint: MemHint) {
            std::ptr::write_bytes(dst, val, len);
        }
    }

    #[test]
    fn commit_applies_all_queued_entries_atomically() {
        let redo_region_len = 8 * std::mem::size_of::<RedoSlot>();
        let heap = VecPmem {
            buf: RefCell::new(vec![0u8; redo_region_len + 64]),
        };
        let redo_ptr = heap.base() as *mut RedoSlot;
        let redo = unsafe { RedoLog::new(redo_ptr, 4) };

        // Put two u64 destinations right after the redo log region.
        let dest_base = redo_region_len;
        let base_ptr = heap.base();

        let mut ctx = OperationContext::new(redo, &heap, base_ptr);
        ctx.add_entry(dest_base as u64, 111);
        ctx.add_entry((dest_base + 8) as u64, 222);
        assert_eq!(ctx.len(), 2);
        let _redo = ctx.commit();

        let buf = heap.buf.borrow();
        let a = u64::from_ne_bytes(buf[dest_base..dest_base + 8].try_into().unwrap());
        let b = u64::from_ne_bytes(buf[dest_base + 8..dest_base + 16].try_into().unwrap());
        assert_eq!(a, 111);
        assert_eq!(b, 222);
    }
}
