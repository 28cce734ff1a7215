//! Integration-style scenario tests run against the public API over an
//! anonymous heap. Crash injection and a corrupted redo-log offset need
//! access to the redo-log pool's raw layout and are covered as
//! crate-internal unit tests instead, in `src/heap.rs` and `src/redo.rs`
//! (see DESIGN.md's "Testable properties coverage" section).

use std::cell::Cell;

use crab_pmalloc::{heap_stats, palloc_first, palloc_next, palloc_operation, palloc_usable_size, Heap, HeapConfig, OpenOptions, PallocError};

fn init_logging() {
    let _ = env_logger::try_init();
}

fn small_heap() -> Heap {
    OpenOptions::new()
        .config(HeapConfig {
            chunks_per_zone: 16,
            redo_pool_size: 4,
            ..HeapConfig::default()
        })
        .open_anon(8 << 20)
        .unwrap()
}

/// S1 - alloc/free small: a fresh heap satisfies a 100-byte request with a
/// non-zero offset whose usable size is at least what was asked for, and
/// freeing it returns the destination pointer to zero and drops it from
/// the live-allocation walk.
#[test]
fn s1_alloc_then_free_small() {
    init_logging();
    let heap = small_heap();

    let off = palloc_operation(&heap, 0, None, 100, None).unwrap();
    assert_ne!(off, 0);
    assert!(palloc_usable_size(&heap, off) >= 100);
    assert!(heap.iter().any(|live| live == off));

    let freed = palloc_operation(&heap, off, None, 0, None).unwrap();
    assert_eq!(freed, 0);
    assert!(heap.iter().all(|live| live != off));
}

/// S2 - realloc grow: a 100-byte allocation written with a known pattern,
/// grown to 500 bytes, keeps its first 100 bytes intact regardless of
/// whether realloc moved the block. The constructor callback is the only
/// public hook that sees a raw pointer into the user region, so both the
/// initial write and the post-grow capture go through it.
#[test]
fn s2_realloc_grow_preserves_prefix() {
    init_logging();
    let heap = small_heap();

    let off = palloc_operation(
        &heap,
        0,
        None,
        100,
        Some(&|ptr, len| {
            unsafe { std::ptr::write_bytes(ptr, 0xAB, len) };
            Ok(())
        }),
    )
    .unwrap();

    let captured: Cell<*mut u8> = Cell::new(std::ptr::null_mut());
    let new_off = palloc_operation(
        &heap,
        off,
        None,
        500,
        Some(&|ptr, _len| {
            captured.set(ptr);
            Ok(())
        }),
    )
    .unwrap();

    assert_ne!(new_off, 0);
    assert!(palloc_usable_size(&heap, new_off) >= 500);
    assert!(!captured.get().is_null());

    // The constructor runs before the old payload is copied in, so read
    // back after the call returns rather than from inside the callback.
    let bytes = unsafe { std::slice::from_raw_parts(captured.get(), 100) };
    assert!(bytes.iter().all(|&b| b == 0xAB), "first 100 bytes must survive the grow");
}

/// S3 - constructor cancel: an allocation whose constructor returns an
/// error surfaces `Canceled` and leaves the heap's occupancy unchanged --
/// the reservation must have been rolled back, not merely abandoned.
#[test]
fn s3_constructor_cancel_leaves_heap_unchanged() {
    init_logging();
    let heap = small_heap();
    let before = heap_stats(&heap);

    let err = palloc_operation(&heap, 0, None, 100, Some(&|_ptr, _len| Err(()))).unwrap_err();
    assert!(matches!(err, PallocError::Canceled));

    let after = heap_stats(&heap);
    assert_eq!(before, after);
}

/// Property 3 (bitmap <-> headers): allocating and freeing a batch of
/// small, same-class objects never leaks occupancy -- every freed unit's
/// bytes are reusable, and the heap returns to its original occupancy once
/// everything is freed.
#[test]
fn run_allocations_track_bitmap_occupancy() {
    init_logging();
    let heap = small_heap();
    let before = heap_stats(&heap);

    let offs: Vec<u64> = (0..64).map(|_| palloc_operation(&heap, 0, None, 48, None).unwrap()).collect();
    let mid = heap_stats(&heap);
    assert!(mid.allocated_bytes > before.allocated_bytes);
    assert_eq!(mid.runs_active, before.runs_active + 1, "64 48-byte units should fit in one run");

    for off in offs {
        palloc_operation(&heap, off, None, 0, None).unwrap();
    }
    let after = heap_stats(&heap);
    assert_eq!(after.allocated_bytes, before.allocated_bytes);
}

/// Property 4 (coalescing): freeing the middle, then the outer two, of
/// three adjacent HUGE allocations leaves one merged free extent rather
/// than three fragments -- observable indirectly by a subsequent
/// allocation that needs close to all three chunks' worth of space.
#[test]
fn free_coalesces_with_both_neighbors() {
    init_logging();
    let heap = OpenOptions::new()
        .config(HeapConfig {
            chunks_per_zone: 8,
            redo_pool_size: 4,
            alloc_classes: vec![16],
            ..HeapConfig::default()
        })
        .open_anon(8 << 20)
        .unwrap();

    // Each of these exceeds the single 16-byte RUN class, landing in HUGE
    // and consuming a whole chunk apiece.
    let big = 300_000u64;
    let a = palloc_operation(&heap, 0, None, big, None).unwrap();
    let b = palloc_operation(&heap, 0, None, big, None).unwrap();
    let c = palloc_operation(&heap, 0, None, big, None).unwrap();

    palloc_operation(&heap, b, None, 0, None).unwrap();
    palloc_operation(&heap, a, None, 0, None).unwrap();
    palloc_operation(&heap, c, None, 0, None).unwrap();

    // All three chunks' worth of space must now be a single free extent.
    let d = palloc_operation(&heap, 0, None, big * 2, None).unwrap();
    assert_ne!(d, 0);
}

/// Iteration (section 4.6) visits every live allocation exactly once, in
/// ascending order, and restarts cleanly from a sentinel each call.
#[test]
fn iteration_is_stateless_and_complete() {
    init_logging();
    let heap = small_heap();
    let a = palloc_operation(&heap, 0, None, 64, None).unwrap();
    let b = palloc_operation(&heap, 0, None, 128, None).unwrap();
    let c = palloc_operation(&heap, 0, None, 4096, None).unwrap();

    let mut seen = vec![];
    let mut cur = palloc_first(&heap);
    while let Some(off) = cur {
        seen.push(off);
        cur = palloc_next(&heap, off);
    }
    seen.sort_unstable();

    let mut expect = vec![a, b, c];
    expect.sort_unstable();
    assert_eq!(seen, expect);

    let mut again: Vec<u64> = heap.iter().collect();
    again.sort_unstable();
    assert_eq!(again, expect);
}

/// A heap exhausted of HUGE space returns `NoMemory` rather than panicking
/// or corrupting bucket state -- a subsequent smaller allocation still
/// succeeds once something is freed.
#[test]
fn exhausted_heap_returns_no_memory_and_stays_usable() {
    init_logging();
    let heap = OpenOptions::new()
        .config(HeapConfig {
            chunks_per_zone: 4,
            redo_pool_size: 2,
            alloc_classes: vec![16],
            ..HeapConfig::default()
        })
        .open_anon(2 << 20)
        .unwrap();

    let a = palloc_operation(&heap, 0, None, 300_000, None).unwrap();
    let b = palloc_operation(&heap, 0, None, 300_000, None).unwrap();

    let err = palloc_operation(&heap, 0, None, 300_000, None).unwrap_err();
    assert!(matches!(err, PallocError::NoMemory));

    palloc_operation(&heap, a, None, 0, None).unwrap();
    let c = palloc_operation(&heap, 0, None, 300_000, None).unwrap();
    assert_ne!(c, 0);

    palloc_operation(&heap, b, None, 0, None).unwrap();
    palloc_operation(&heap, c, None, 0, None).unwrap();
}
