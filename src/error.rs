use thiserror::Error;

/// Errors surfaced by the allocator's public API.
///
/// The taxonomy separates "this call failed" (`NoMemory`, `Canceled`,
/// `InvalidInput`) from "the on-media layout itself is inconsistent"
/// (`HeapCorruption`), and again from plain I/O failure opening or growing
/// the backing store. A torn redo log is *not* one of these variants: it
/// is erased silently by [`crate::redo::RedoLog::recover`] rather than
/// surfaced, since it only ever indicates an operation that never
/// committed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PallocError {
    /// No bucket could satisfy the requested size, and the heap has no more
    /// room to carve out a new run or chunk.
    #[error("out of memory: no bucket could satisfy the request")]
    NoMemory,

    /// The caller-supplied constructor returned a non-zero status, so the
    /// reservation was rolled back before anything became visible.
    #[error("allocation canceled by constructor")]
    Canceled,

    /// Misuse of the API: bad flags, a zero-sized non-free request, or
    /// similar caller errors.
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    /// The persistent layout itself is inconsistent. Only returned from the
    /// read-only validation entry points (`Heap::check`/`check_remote`) --
    /// invariant violations detected *during* a live allocator call are
    /// debug-only assertions, never a `Result`.
    #[error("heap corruption detected: {0}")]
    HeapCorruption(&'static str),

    /// Couldn't open the backing file.
    #[error("opening the backing file failed")]
    Open(#[source] std::io::Error),
    /// Couldn't lock the backing file.
    #[error("failed to lock the backing file for exclusive use")]
    Lock(#[source] std::io::Error),
    /// Couldn't synchronize to the backing file.
    #[error("synchronizing to the backing file failed")]
    Sync(#[source] std::io::Error),
    /// Couldn't resize the backing file.
    #[error(
        "can't resize the backing file: have 0x{size:x} bytes, wanted 0x{requested:x} bytes"
    )]
    ResizeFailed {
        size: usize,
        requested: usize,
        source: std::io::Error,
    },
    /// Couldn't create the memory map.
    #[error("can't map 0x{requested:x} bytes for the heap")]
    MapFailed {
        requested: usize,
        source: std::io::Error,
    },
    /// Other, miscellaneous errors that don't fit the categories above.
    #[error("{0}")]
    Other(&'static str),
}

impl PallocError {
    /// `true` for the subset of errors a caller can retry after freeing
    /// memory elsewhere; `false` for errors that indicate misuse or a fatal
    /// layout problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PallocError::NoMemory)
    }
}
