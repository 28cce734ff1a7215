//! Heap configuration: zone geometry and the allocation-class table,
//! exposed through an `OpenOptions`-style builder for opening or creating
//! a heap.

use std::path::Path;

use crate::error::PallocError;
use crate::heap::Heap;
use crate::layout::CHUNK_SIZE;

/// Default allocation classes, in bytes, ascending. A request whose
/// header-inclusive size exceeds the largest class falls to the HUGE
/// bucket and is satisfied chunk-granularly instead of from a run.
const DEFAULT_ALLOC_CLASSES: &[u64] = &[
    16, 32, 48, 64, 96, 128, 192, 256, 320, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 8192,
    16384, 32768, 65536, 131072,
];

/// Parameters governing a heap's layout: how many chunks make up a zone,
/// the allocation-class table RUN buckets are built from, and the redo
/// log's entry capacity and pool size.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub chunks_per_zone: u32,
    pub alloc_classes: Vec<u64>,
    pub redo_num_entries: usize,
    pub redo_pool_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunks_per_zone: 64,
            alloc_classes: DEFAULT_ALLOC_CLASSES.to_vec(),
            redo_num_entries: 8,
            redo_pool_size: 64,
        }
    }
}

impl HeapConfig {
    /// Validate that the class table is ascending and fits within a chunk.
    pub fn validate(&self) -> Result<(), PallocError> {
        if self.alloc_classes.is_empty() {
            return Err(PallocError::InvalidInput("alloc_classes must not be empty"));
        }
        if self.alloc_classes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(PallocError::InvalidInput("alloc_classes must be strictly ascending"));
        }
        if *self.alloc_classes.last().unwrap() as usize >= CHUNK_SIZE {
            return Err(PallocError::InvalidInput("alloc_classes entries must fit within a chunk"));
        }
        if self.redo_num_entries == 0 {
            return Err(PallocError::InvalidInput("redo_num_entries must be nonzero"));
        }
        if self.redo_pool_size == 0 {
            return Err(PallocError::InvalidInput("redo_pool_size must be nonzero"));
        }
        Ok(())
    }

    /// Resolve the RUN bucket index for a header-inclusive allocation size,
    /// or `None` if the request belongs in the HUGE bucket.
    pub fn bucket_index_for(&self, total_bytes: u64) -> Option<usize> {
        self.alloc_classes.iter().position(|&class| class >= total_bytes)
    }
}

/// Builder for opening or creating a heap, following the standard
/// `OpenOptions` pattern used for opening a backing file.
pub struct OpenOptions {
    config: HeapConfig,
    create_size: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            config: HeapConfig::default(),
            create_size: None,
        }
    }

    pub fn config(mut self, config: HeapConfig) -> Self {
        self.config = config;
        self
    }

    /// If the backing file doesn't exist, create it at this size and
    /// `init` a fresh heap over it instead of `boot`-ing an existing one.
    pub fn create_new_size(mut self, size: u64) -> Self {
        self.create_size = Some(size);
        self
    }

    /// Open a file-backed heap, creating and `init`-ing it first if
    /// `create_new_size` was set and the file doesn't already exist.
    pub fn open<P: AsRef<Path>>(self, path: P) -> Result<Heap, PallocError> {
        self.config.validate()?;
        Heap::open_file(path.as_ref(), self.config, self.create_size)
    }

    /// Open an anonymous, memory-backed heap of `size` bytes -- useful for
    /// tests and ephemeral use where no backing file is wanted.
    pub fn open_anon(self, size: usize) -> Result<Heap, PallocError> {
        self.config.validate()?;
        Heap::open_anon(size, self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_index_for_resolves_smallest_fitting_class() {
        let cfg = HeapConfig::default();
        assert_eq!(cfg.bucket_index_for(1), Some(0));
        assert_eq!(cfg.bucket_index_for(17), Some(1));
        assert_eq!(cfg.bucket_index_for(131072), Some(cfg.alloc_classes.len() - 1));
        assert_eq!(cfg.bucket_index_for(200000), None);
    }

    #[test]
    fn default_config_validates() {
        assert!(HeapConfig::default().validate().is_ok());
    }

    #[test]
    fn non_ascending_classes_rejected() {
        let cfg = HeapConfig {
            alloc_classes: vec![32, 16],
            ..HeapConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
