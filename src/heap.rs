//! Heap geometry: zones, chunk header tables, the redo-log pool, and the
//! `PmemOps` implementation (`MmapPmem`) backing a real file or anonymous
//! map. `Heap` ties layout, buckets, and per-run locks into the single
//! process-wide value every allocator operation is passed explicitly (no
//! ambient global), per Design Note section 9.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions as FsOpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use fs4::fs_std::FileExt;
use memmap2::{MmapMut, MmapRaw};

use crate::bucket::{BucketKind, Buckets, HugeBucket, RunBucket};
use crate::config::HeapConfig;
use crate::error::PallocError;
use crate::layout::{ChunkHeader, ChunkType, RunHeader, ZoneHeader, CHUNK_SIZE, ZONE_MAGIC};
use crate::pmem::{self, MemHint, PmemOps};
use crate::redo::RedoSlot;

/// `PmemOps` backed by `memmap2::MmapRaw` for the heap's storage.
pub struct MmapPmem {
    map: MmapRaw,
    _file: Option<File>,
}

impl MmapPmem {
    fn anon(size: usize) -> Result<Self, PallocError> {
        let map = MmapMut::map_anon(size)
            .map_err(|e| PallocError::MapFailed { requested: size, source: e })?;
        Ok(Self { map: MmapRaw::from(map), _file: None })
    }

    fn file_backed(file: File, size: usize) -> Result<Self, PallocError> {
        let map = memmap2::MmapOptions::new()
            .len(size)
            .map_raw(&file)
            .map_err(|e| PallocError::MapFailed { requested: size, source: e })?;
        Ok(Self { map, _file: Some(file) })
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

impl PmemOps for MmapPmem {
    fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    fn flush(&self, ptr: *const u8, len: usize) {
        unsafe { pmem::flush_range(ptr, len) };
    }

    fn drain(&self) {
        pmem::store_fence();
    }

    unsafe fn memcpy(&self, dst: *mut u8, src: *const u8, len: usize, hint: MemHint) {
        pmem::memcpy_persist(dst, src, len);
        let _ = hint;
    }

    unsafe fn memset(&self, dst: *mut u8, val: u8, len: usize, hint: MemHint) {
        pmem::memset_persist(dst, val, len);
        let _ = hint;
    }
}

/// Fixed header at offset 0 of the heap region: enough to re-derive the
/// layout that `Heap::open_file`/`open_anon` computed from `HeapConfig` at
/// `init` time, so `boot` doesn't need the config passed back in.
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct HeapHeader {
    magic: u64,
    chunks_per_zone: u32,
    redo_num_entries: u32,
    redo_pool_size: u32,
    num_zones: u32,
    num_classes: u32,
    _pad: u32,
}

const HEAP_MAGIC: u64 = 0x5041_4C4C_4F43_5248; // "PALLOCRH"

/// A live heap: geometry derived from [`HeapConfig`], the free-block
/// buckets, per-run locks, and a pool of pre-allocated redo logs so
/// concurrent `palloc_operation` calls don't serialize on a shared log.
pub struct Heap {
    ops: Box<dyn PmemOps + Send + Sync>,
    config: HeapConfig,
    redo_pool_off: u64,
    redo_slot_stride: usize,
    zones_off: u64,
    zone_stride: usize,
    chunk_table_off_in_zone: usize,
    chunks_start_in_zone: usize,
    num_zones: u32,

    /// Held read during normal allocation, write during `cleanup`/`end`.
    /// The bucket map never actually reconfigures at runtime, but the lock
    /// still serializes teardown against in-flight operations.
    pub(crate) heap_lock: RwLock<()>,
    pub(crate) buckets: Buckets,
    run_locks: Mutex<HashMap<(u32, u32), Arc<Mutex<()>>>>,
    redo_free: Mutex<VecDeque<u32>>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    fn geometry(config: &HeapConfig, total_size: usize) -> (u64, usize, u64, usize, usize, usize, u32) {
        let redo_pool_off = std::mem::size_of::<HeapHeader>() as u64;
        let redo_pool_off = (redo_pool_off + 63) & !63;
        // Round up to 64 bytes so `RedoLog::persist`'s own 64-byte-rounded
        // publish write -- at most `redo_slot_stride` bytes before this
        // rounding -- never spills into the next pool slot.
        let redo_slot_stride = (config.redo_num_entries + 1) * std::mem::size_of::<RedoSlot>();
        let redo_slot_stride = (redo_slot_stride + 63) & !63;
        let redo_pool_bytes = config.redo_pool_size * redo_slot_stride;

        let zones_off = redo_pool_off + redo_pool_bytes as u64;
        let zones_off = (zones_off + 63) & !63;

        let zone_header_size = std::mem::size_of::<ZoneHeader>();
        let chunk_table_off_in_zone = zone_header_size;
        let chunk_table_bytes = config.chunks_per_zone as usize * std::mem::size_of::<ChunkHeader>();
        let chunks_start_in_zone = (chunk_table_off_in_zone + chunk_table_bytes + 63) & !63;
        let zone_stride = chunks_start_in_zone + config.chunks_per_zone as usize * CHUNK_SIZE;

        let available = (total_size as u64).saturating_sub(zones_off);
        let num_zones = (available / zone_stride as u64) as u32;

        (
            redo_pool_off,
            redo_slot_stride,
            zones_off,
            zone_stride,
            chunk_table_off_in_zone,
            chunks_start_in_zone,
            num_zones,
        )
    }

    fn new(ops: Box<dyn PmemOps + Send + Sync>, config: HeapConfig, total_size: usize) -> Self {
        let (redo_pool_off, redo_slot_stride, zones_off, zone_stride, chunk_table_off_in_zone, chunks_start_in_zone, num_zones) =
            Self::geometry(&config, total_size);

        let run_buckets = config
            .alloc_classes
            .iter()
            .map(|&unit_size| Mutex::new(RunBucket::new(unit_size)))
            .collect();

        Self {
            ops,
            config,
            redo_pool_off,
            redo_slot_stride,
            zones_off,
            zone_stride,
            chunk_table_off_in_zone,
            chunks_start_in_zone,
            num_zones,
            heap_lock: RwLock::new(()),
            buckets: Buckets {
                huge: Mutex::new(HugeBucket::new()),
                runs: run_buckets,
            },
            run_locks: Mutex::new(HashMap::new()),
            redo_free: Mutex::new((0..config_redo_pool_size(&config)).collect()),
        }
    }

    /// Create and `init` a fresh anonymous heap.
    pub fn open_anon(size: usize, config: HeapConfig) -> Result<Self, PallocError> {
        let ops = MmapPmem::anon(size)?;
        let heap = Self::new(Box::new(ops), config, size);
        heap.init();
        Ok(heap)
    }

    /// Open (creating if requested) a file-backed heap.
    ///
    /// File-backed heaps are mapped with [`memmap2::MmapOptions::map_raw`],
    /// so the OS page size governs how dirty pages are written back; a
    /// page size larger than a chunk would make a single chunk's dirty-page
    /// tracking granularity coarser than the chunk itself, so that case is
    /// rejected up front rather than allowed to silently degrade crash
    /// granularity.
    pub fn open_file(path: &Path, config: HeapConfig, create_size: Option<u64>) -> Result<Self, PallocError> {
        if page_size::get() > CHUNK_SIZE {
            return Err(PallocError::InvalidInput(
                "system page size is larger than a chunk; unsupported",
            ));
        }
        let existed = path.exists();
        let file = FsOpenOptions::new()
            .read(true)
            .write(true)
            .create(create_size.is_some())
            .open(path)
            .map_err(PallocError::Open)?;
        FileExt::try_lock_exclusive(&file).map_err(PallocError::Lock)?;

        let size = if !existed {
            let size = create_size.ok_or(PallocError::InvalidInput(
                "heap file doesn't exist and no create_new_size was given",
            ))?;
            file.set_len(size).map_err(|e| PallocError::ResizeFailed {
                size: 0,
                requested: size as usize,
                source: e,
            })?;
            file.sync_all().map_err(PallocError::Sync)?;
            size as usize
        } else {
            file.metadata().map_err(PallocError::Open)?.len() as usize
        };

        let ops = MmapPmem::file_backed(file, size)?;
        let heap = Self::new(Box::new(ops), config, size);
        if existed {
            heap.boot()?;
        } else {
            heap.init();
        }
        Ok(heap)
    }

    /// Write the fixed heap header, every zone header, and every chunk
    /// header (all `FREE`), then populate the HUGE bucket with one free
    /// extent per zone. Called once over a freshly mapped, zeroed region.
    fn init(&self) {
        let header = HeapHeader {
            magic: HEAP_MAGIC,
            chunks_per_zone: self.config.chunks_per_zone,
            redo_num_entries: self.config.redo_num_entries as u32,
            redo_pool_size: self.config.redo_pool_size as u32,
            num_zones: self.num_zones,
            num_classes: self.config.alloc_classes.len() as u32,
            _pad: 0,
        };
        unsafe {
            let bytes: &[u8] = bytemuck::bytes_of(&header);
            self.ops.memcpy(self.base(), bytes.as_ptr(), bytes.len(), MemHint::Default);
        }

        for zone_id in 0..self.num_zones {
            let zone_off = self.zone_off(zone_id);
            let zh = ZoneHeader {
                magic: ZONE_MAGIC,
                chunk_count: self.config.chunks_per_zone,
                zone_id,
            };
            unsafe {
                let bytes: &[u8] = bytemuck::bytes_of(&zh);
                self.ops
                    .memcpy(self.base().add(zone_off as usize), bytes.as_ptr(), bytes.len(), MemHint::Default);
            }
            let free_hdr = ChunkHeader::free(self.config.chunks_per_zone);
            unsafe {
                let ptr = self.base().add(self.chunk_header_offset(zone_id, 0) as usize) as *mut u64;
                ptr.write(free_hdr.as_u64());
                self.ops.persist(ptr as *const u8, 8);
            }
            self.buckets
                .huge
                .lock()
                .unwrap()
                .insert(zone_id, 0, self.config.chunks_per_zone);
        }
    }

    /// Rebuild transient state (buckets, nothing else) from an existing
    /// persistent layout: first replay or erase every redo log slot left
    /// behind by a crash, then walk every zone's chunk table and classify
    /// each chunk as FREE
    /// (insert into HUGE), USED (skip), or RUN (register its free bitmap
    /// bits into the matching RUN bucket). Recovery must run first: a
    /// replayed log may flip a chunk header or bitmap word the walk below
    /// depends on reading in its post-commit state.
    fn boot(&self) -> Result<(), PallocError> {
        let hdr = unsafe { &*(self.base() as *const HeapHeader) };
        if hdr.magic != HEAP_MAGIC {
            return Err(PallocError::HeapCorruption("heap header magic mismatch"));
        }
        self.recover_redo_pool();
        for zone_id in 0..self.num_zones {
            let zh = self.zone_header(zone_id);
            if zh.magic != ZONE_MAGIC {
                return Err(PallocError::HeapCorruption("zone header magic mismatch"));
            }
            let mut chunk_id = 0u32;
            while chunk_id < zh.chunk_count {
                let ch = self.chunk_header(zone_id, chunk_id);
                match ch.chunk_type() {
                    Some(ChunkType::Free) => {
                        self.buckets.huge.lock().unwrap().insert(zone_id, chunk_id, ch.size_idx.max(1));
                        chunk_id += ch.size_idx.max(1);
                    }
                    Some(ChunkType::Used) => {
                        chunk_id += ch.size_idx.max(1);
                    }
                    Some(ChunkType::Run) => {
                        let run_base = self.chunk_data_ptr(zone_id, chunk_id);
                        let run_hdr = unsafe { &*(run_base as *const RunHeader) };
                        if let Some(idx) = self.config.alloc_classes.iter().position(|&c| c == run_hdr.unit_size) {
                            let mut bucket = self.buckets.runs[idx].lock().unwrap();
                            for off in 0..run_hdr.nbits {
                                if !run_hdr.bit(off) {
                                    bucket.push_free(zone_id, chunk_id, off);
                                }
                            }
                        }
                        chunk_id += 1;
                    }
                    Some(ChunkType::Footer) | None => {
                        chunk_id += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate persistent layout consistency: every zone's magic is
    /// intact and every chunk header carries a recognized type tag.
    /// Read-only; returns `HeapCorruption` rather than panicking.
    pub fn check(&self) -> Result<(), PallocError> {
        for zone_id in 0..self.num_zones {
            let zh = self.zone_header(zone_id);
            if zh.magic != ZONE_MAGIC {
                log::error!("heap_check: zone {zone_id} bad magic");
                return Err(PallocError::HeapCorruption("zone header magic mismatch"));
            }
            let mut chunk_id = 0u32;
            while chunk_id < zh.chunk_count {
                let ch = self.chunk_header(zone_id, chunk_id);
                if ch.chunk_type().is_none() {
                    log::error!("heap_check: zone {zone_id} chunk {chunk_id} unrecognized type tag");
                    return Err(PallocError::HeapCorruption("unrecognized chunk type tag"));
                }
                chunk_id += ch.size_idx.max(1);
            }
        }
        Ok(())
    }

    /// As [`Heap::check`], but intended for a remotely-replicated copy of
    /// the heap passed in as a raw snapshot rather than this heap's own
    /// mapping -- kept as a thin, separately-named entry point since a
    /// remote replica has no backing `Heap` value of its own to call
    /// `check` on.
    pub fn check_remote(snapshot: &[u8]) -> Result<(), PallocError> {
        if snapshot.len() < std::mem::size_of::<HeapHeader>() {
            log::error!("heap_check_remote: snapshot too short for a heap header");
            return Err(PallocError::HeapCorruption("remote snapshot too short for a heap header"));
        }
        let hdr: &HeapHeader = bytemuck::from_bytes(&snapshot[..std::mem::size_of::<HeapHeader>()]);
        if hdr.magic != HEAP_MAGIC {
            log::error!("heap_check_remote: snapshot magic mismatch");
            return Err(PallocError::HeapCorruption("remote snapshot magic mismatch"));
        }
        Ok(())
    }

    /// Flush the whole mapping and drop transient state. Takes the heap
    /// rwlock for write, so no concurrent allocation can be in flight.
    pub fn cleanup(&self) -> Result<(), PallocError> {
        let _guard = self.heap_lock.write().unwrap();
        self.ops.persist(self.base(), 0);
        Ok(())
    }

    /// Final teardown before the heap value is dropped: same as
    /// [`Heap::cleanup`], kept as a distinct name for symmetry with the
    /// boot-time entry point.
    pub fn end(&self) -> Result<(), PallocError> {
        self.cleanup()
    }

    // --- layout accessors ------------------------------------------------

    pub(crate) fn base(&self) -> *mut u8 {
        self.ops.base()
    }

    pub(crate) fn ops(&self) -> &dyn PmemOps {
        self.ops.as_ref()
    }

    pub(crate) fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn num_zones(&self) -> u32 {
        self.num_zones
    }

    pub fn chunks_per_zone(&self) -> u32 {
        self.config.chunks_per_zone
    }

    fn zone_off(&self, zone_id: u32) -> u64 {
        self.zones_off + zone_id as u64 * self.zone_stride as u64
    }

    pub(crate) fn zone_header(&self, zone_id: u32) -> ZoneHeader {
        let off = self.zone_off(zone_id);
        unsafe { *(self.base().add(off as usize) as *const ZoneHeader) }
    }

    pub(crate) fn chunk_header_offset(&self, zone_id: u32, chunk_id: u32) -> u64 {
        self.zone_off(zone_id) + self.chunk_table_off_in_zone as u64 + chunk_id as u64 * 8
    }

    pub(crate) fn chunk_header(&self, zone_id: u32, chunk_id: u32) -> ChunkHeader {
        let off = self.chunk_header_offset(zone_id, chunk_id);
        let word = unsafe { (self.base().add(off as usize) as *const u64).read() };
        ChunkHeader::from_u64(word)
    }

    pub(crate) fn chunk_data_offset(&self, zone_id: u32, chunk_id: u32) -> usize {
        self.zone_off(zone_id) as usize + self.chunks_start_in_zone + chunk_id as usize * CHUNK_SIZE
    }

    pub(crate) fn chunk_data_ptr(&self, zone_id: u32, chunk_id: u32) -> *mut u8 {
        unsafe { self.base().add(self.chunk_data_offset(zone_id, chunk_id)) }
    }

    pub(crate) fn offset_to_ptr(&self, offset: u64) -> *mut u8 {
        unsafe { self.base().add(offset as usize) }
    }

    pub(crate) fn ptr_to_offset(&self, ptr: *const u8) -> u64 {
        (ptr as usize - self.base() as usize) as u64
    }

    /// Bounds predicate for redo entries: any even offset strictly within
    /// the mapped region.
    pub(crate) fn check_offset(&self, offset: u64) -> bool {
        offset & 1 == 0 && (offset as usize) < self.mapped_len()
    }

    fn mapped_len(&self) -> usize {
        self.zones_off as usize + self.num_zones as usize * self.zone_stride
    }

    /// Mutex guarding the bitmap word of the run at `(zone_id, chunk_id)`.
    pub(crate) fn run_lock(&self, zone_id: u32, chunk_id: u32) -> Arc<Mutex<()>> {
        let mut locks = self.run_locks.lock().unwrap();
        locks
            .entry((zone_id, chunk_id))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub(crate) fn bucket_for(&self, total_bytes: u64) -> BucketKind {
        match self.config.bucket_index_for(total_bytes) {
            Some(idx) => BucketKind::Run(idx),
            None => BucketKind::Huge,
        }
    }

    /// Queue the redo entries describing a HUGE extent's head chunk header
    /// (and, for multi-chunk extents, its footer) as `tag`/`size_idx`. Used
    /// both for allocate/free state flips (size_idx unchanged) and for
    /// splitting/coalescing (size_idx changes), so both call sites produce
    /// a head+footer pair that always agree.
    pub(crate) fn queue_chunk_state(
        &self,
        ctx: &mut crate::operation::OperationContext,
        zone_id: u32,
        chunk_id: u32,
        size_idx: u32,
        tag: ChunkType,
    ) {
        let head_off = self.chunk_header_offset(zone_id, chunk_id);
        let head = ChunkHeader {
            type_tag: tag as u16,
            flags: 0,
            size_idx,
        };
        ctx.add_entry(head_off, head.as_u64());
        if size_idx > 1 {
            let foot_off = self.chunk_header_offset(zone_id, chunk_id + size_idx - 1);
            let foot = ChunkHeader::footer(size_idx);
            ctx.add_entry(foot_off, foot.as_u64());
        }
    }

    // --- redo log pool -----------------------------------------------

    /// Claim a free slot's pointer and capacity from the redo pool. Blocks
    /// (briefly spins, in practice never contended beyond `redo_pool_size`
    /// concurrent callers) until a slot is available.
    pub(crate) fn acquire_redo(&self) -> (u32, *mut RedoSlot, usize) {
        loop {
            if let Some(idx) = self.redo_free.lock().unwrap().pop_front() {
                let off = self.redo_pool_off + idx as u64 * self.redo_slot_stride as u64;
                let ptr = unsafe { self.base().add(off as usize) as *mut RedoSlot };
                return (idx, ptr, self.config.redo_num_entries);
            }
            std::thread::yield_now();
        }
    }

    pub(crate) fn release_redo(&self, idx: u32) {
        self.redo_free.lock().unwrap().push_back(idx);
    }

    /// Walk every slot in the redo-log pool and [`crate::redo::RedoLog::recover`]
    /// it: a log with a good checksum and finish flag is replayed, a torn
    /// one (checksum mismatch) is erased, and an empty one is left alone.
    /// Only meaningful right after `boot`, before any caller can have
    /// acquired a slot -- a live heap's in-flight logs are owned by whatever
    /// `palloc_operation` call is using them and must not be touched here.
    fn recover_redo_pool(&self) {
        for idx in 0..self.config.redo_pool_size as u32 {
            let off = self.redo_pool_off + idx as u64 * self.redo_slot_stride as u64;
            let ptr = unsafe { self.base().add(off as usize) as *mut RedoSlot };
            let mut log = unsafe { crate::redo::RedoLog::new(ptr, self.config.redo_num_entries) };
            let before = log.verify(self.config.redo_num_entries);
            log.recover(self.config.redo_num_entries, self.ops.as_ref(), self.base());
            if before != 0 {
                log::debug!("heap boot: recovered redo log slot {idx} (verify={before})");
            }
        }
    }
}

fn config_redo_pool_size(config: &HeapConfig) -> u32 {
    config.redo_pool_size as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> HeapConfig {
        HeapConfig {
            chunks_per_zone: 4,
            redo_pool_size: 4,
            ..HeapConfig::default()
        }
    }

    #[test]
    fn open_anon_initializes_at_least_one_zone() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        assert!(heap.num_zones() >= 1);
        let zh = heap.zone_header(0);
        assert_eq!(zh.magic, ZONE_MAGIC);
        assert_eq!(zh.chunk_count, heap.chunks_per_zone());
    }

    #[test]
    fn fresh_heap_has_all_chunks_free() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        let ch = heap.chunk_header(0, 0);
        assert_eq!(ch.chunk_type(), Some(ChunkType::Free));
        assert_eq!(ch.size_idx, heap.chunks_per_zone());
    }

    #[test]
    fn check_passes_on_freshly_initialized_heap() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        assert!(heap.check().is_ok());
    }

    #[test]
    fn redo_pool_round_trips_acquire_release() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        let (idx, _ptr, cap) = heap.acquire_redo();
        assert_eq!(cap, heap.config().redo_num_entries);
        heap.release_redo(idx);
        let (idx2, _, _) = heap.acquire_redo();
        assert_eq!(idx, idx2);
    }

    /// S4: a crash after `store_last` (checksummed, finish-flagged, and
    /// published to pmem) but before `process` must still replay on the
    /// next `boot`-style recovery pass.
    #[test]
    fn recover_redo_pool_replays_a_log_committed_but_not_processed() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        let (idx, redo_ptr, cap) = heap.acquire_redo();

        let head_off = heap.chunk_header_offset(0, 0);
        let flipped = ChunkHeader {
            type_tag: ChunkType::Used as u16,
            flags: 0,
            size_idx: heap.chunks_per_zone(),
        };

        let mut log = unsafe { crate::redo::RedoLog::new(redo_ptr, cap) };
        log.store_last(0, head_off, flipped.as_u64(), heap.ops());
        // Crash here: never call `log.process`, never `release_redo`.
        drop(log);

        assert_eq!(heap.chunk_header(0, 0).chunk_type(), Some(ChunkType::Free));
        heap.recover_redo_pool();
        assert_eq!(heap.chunk_header(0, 0).chunk_type(), Some(ChunkType::Used));

        // The recovered slot is retired (zeroed) and reusable.
        let mut log = unsafe { crate::redo::RedoLog::new(redo_ptr, cap) };
        assert_eq!(log.verify(cap), 0);
        heap.release_redo(idx);
    }

    /// S5: a crash after some `store` calls but before `store_last` never
    /// reached pmem at all (only `store_last`/`set_last` persist), so
    /// recovery must leave the heap untouched.
    #[test]
    fn recover_redo_pool_ignores_a_log_that_never_reached_store_last() {
        let heap = Heap::open_anon(4 << 20, small_config()).unwrap();
        let (idx, redo_ptr, cap) = heap.acquire_redo();

        let head_off = heap.chunk_header_offset(0, 0);
        let mut log = unsafe { crate::redo::RedoLog::new(redo_ptr, cap) };
        log.store(0, head_off, 0xDEAD_BEEF);
        // Crash here: volatile-only, slot 0 in pmem is still all zero.
        drop(log);

        heap.recover_redo_pool();
        assert_eq!(heap.chunk_header(0, 0).chunk_type(), Some(ChunkType::Free));
        heap.release_redo(idx);
    }
}
