//! A crash-consistent, transactional allocator for persistent memory,
//! modeled on `libpmemobj`'s heap and redo-log machinery: zones of
//! fixed-size chunks, HUGE (whole-chunk) and RUN (fixed-size-unit slab)
//! allocation classes, and a single-commit [`palloc_operation`] front end
//! unifying allocate/free/realloc so that any state a crash could observe
//! mid-call is either fully applied or not applied at all.
//!
//! ```no_run
//! use crab_pmalloc::{palloc_operation, OpenOptions};
//!
//! let heap = OpenOptions::new().open_anon(64 << 20)?;
//! let off = palloc_operation(&heap, 0, None, 256, None)?;
//! palloc_operation(&heap, off, None, 0, None)?;
//! # Ok::<(), crab_pmalloc::PallocError>(())
//! ```

pub mod alloc;
pub mod bucket;
pub mod config;
pub mod error;
pub mod heap;
pub mod layout;
pub mod memblock;
pub mod operation;
pub mod pmem;
pub mod redo;
pub mod stats;

pub use alloc::{palloc_first, palloc_next, palloc_operation, palloc_usable_size, Constructor, LiveAllocations};
pub use config::{HeapConfig, OpenOptions};
pub use error::PallocError;
pub use heap::Heap;
pub use memblock::{BlockLoc, BlockState, MemoryBlock};
pub use stats::{heap_stats, HeapStats};
