use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use parking_lot::Mutex;
use thread_local::ThreadLocal;

use crate::block_layer::{BlockLayer, BlockOpenOptions, CacheMode};
use crate::error::{MuxError, Result};
use crate::file_layer::FileLayer;
use crate::header::{validate_block_size, FileHeader};
use crate::mapped::MappedSlices;
use crate::OpenMode;

/// Default memory budget (in bytes) for each block cache.
pub const DEFAULT_CACHE_BUDGET_BYTES: usize = 2 * 1024 * 1024;

/// Maximum entry count for a block cache.
/// Prevents excessive LRU overhead when block sizes are very small.
const BLOCK_CACHE_MAX_ENTRIES: usize = 4096;

/// Address that is never handed out; keeps the block count within `u32`.
const NO_BLOCK: u32 = u32::MAX;

/// Allocation state protected by a Mutex.
struct AllocState {
    total_blocks: u32,
    free: BTreeSet<u32>,
}

/// Real L2 implementation that stores blocks within a single file managed by L1.
///
/// Block `n` is at file offset `data_offset + n * block_size`. Freed blocks are
/// kept in an ordered in-memory set owned by this instance; allocation takes
/// the lowest free address before extending the file.
///
/// Dual-cache design:
/// - **Per-thread LRU** (`block_cache`): zero cross-thread contention. Only
///   coherent while the file is immutable, so it is used on read-only opens;
///   on writable files thread-local requests fall through to the shared cache.
/// - **Shared LRU** (`shared_cache`): Mutex-guarded, kept coherent on writes,
///   frees and truncation.
///
/// On read-only opens with memory mapping enabled, reads are served from
/// `MappedSlices` and bypass both caches and the L1 file lock.
pub struct BlocksInFile<L1: FileLayer, const CACHE_BUDGET_BYTES: usize> {
    layer1: L1,
    block_size: usize,
    mode: OpenMode,
    state: Mutex<AllocState>,
    /// Per-thread LRU cache of full block contents.
    block_cache: ThreadLocal<RefCell<LruCache<u32, Vec<u8>>>>,
    /// Shared LRU cache of full block contents.
    shared_cache: Mutex<LruCache<u32, Vec<u8>>>,
    /// Precomputed cache capacity (entry count).
    cache_capacity: NonZeroUsize,
    mapped: Option<MappedSlices>,
}

impl<L1: FileLayer, const CACHE_BUDGET_BYTES: usize> BlocksInFile<L1, CACHE_BUDGET_BYTES> {
    /// File offset of block `n`.
    fn block_offset(&self, index: u32) -> u64 {
        self.layer1.data_offset() + index as u64 * self.block_size as u64
    }

    /// Compute cache entry count from block size.
    fn compute_cache_capacity(block_size: usize) -> NonZeroUsize {
        let by_budget = CACHE_BUDGET_BYTES / block_size;
        let entries = by_budget.clamp(1, BLOCK_CACHE_MAX_ENTRIES);
        NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN)
    }

    fn new(layer1: L1, block_size: usize, mode: OpenMode, total_blocks: u32) -> Self {
        let cache_capacity = Self::compute_cache_capacity(block_size);
        BlocksInFile {
            layer1,
            block_size,
            mode,
            state: Mutex::new(AllocState {
                total_blocks,
                free: BTreeSet::new(),
            }),
            block_cache: ThreadLocal::new(),
            shared_cache: Mutex::new(LruCache::new(cache_capacity)),
            cache_capacity,
            mapped: None,
        }
    }

    /// Get or create the calling thread's block cache.
    fn thread_cache(&self) -> &RefCell<LruCache<u32, Vec<u8>>> {
        self.block_cache
            .get_or(|| RefCell::new(LruCache::new(self.cache_capacity)))
    }

    /// Thread-local caching is only safe while nobody can rewrite blocks.
    fn effective_cache(&self, cache: CacheMode) -> CacheMode {
        match (cache, self.mode) {
            (CacheMode::ThreadLocal, OpenMode::Write) => CacheMode::Shared,
            _ => cache,
        }
    }

    fn check_index(&self, index: u32, op: &str) -> Result<()> {
        let total = self.state.lock().total_blocks;
        if index >= total {
            return Err(MuxError::Format(format!(
                "{}: block {} out of range ({} blocks)",
                op, index, total
            )));
        }
        Ok(())
    }

    fn check_len(&self, len: usize, op: &str) -> Result<()> {
        if len != self.block_size {
            return Err(MuxError::Usage(format!(
                "{}: buffer of {} bytes, block size is {}",
                op, len, self.block_size
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Cache helpers: route to the appropriate cache based on CacheMode
    // -----------------------------------------------------------------

    fn try_cache_read(&self, index: u32, buf: &mut [u8], cache: CacheMode) -> Option<()> {
        if CACHE_BUDGET_BYTES == 0 {
            return None;
        }
        match cache {
            CacheMode::None => None,
            CacheMode::ThreadLocal => {
                let mut lru = self.thread_cache().borrow_mut();
                let cached = lru.get(&index)?;
                buf.copy_from_slice(cached);
                Some(())
            }
            CacheMode::Shared => {
                let mut lru = self.shared_cache.lock();
                let cached = lru.get(&index)?;
                buf.copy_from_slice(cached);
                Some(())
            }
        }
    }

    fn cache_put(&self, index: u32, block: &[u8], cache: CacheMode) {
        if CACHE_BUDGET_BYTES == 0 {
            return;
        }
        match cache {
            CacheMode::None => {}
            CacheMode::ThreadLocal => {
                self.thread_cache().borrow_mut().put(index, block.to_vec());
            }
            CacheMode::Shared => {
                self.shared_cache.lock().put(index, block.to_vec());
            }
        }
    }

    /// Keep the shared cache coherent with a block write that did not ask
    /// for caching.
    fn refresh_if_cached(&self, index: u32, block: &[u8]) {
        if CACHE_BUDGET_BYTES == 0 {
            return;
        }
        if let Some(cached) = self.shared_cache.lock().get_mut(&index) {
            cached.copy_from_slice(block);
        }
    }

    fn evict(&self, index: u32) {
        if CACHE_BUDGET_BYTES == 0 {
            return;
        }
        self.shared_cache.lock().pop(&index);
    }
}

impl<L1: FileLayer, const CACHE_BUDGET_BYTES: usize> BlockLayer
    for BlocksInFile<L1, CACHE_BUDGET_BYTES>
{
    fn create(path: &Path, block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;
        let layer1 = L1::create(path)?;
        Ok(Self::new(layer1, block_size as usize, OpenMode::Write, 0))
    }

    fn open(path: &Path, mode: OpenMode, options: BlockOpenOptions) -> Result<Self> {
        let layer1 = L1::open(path, mode)?;
        let header = layer1.read_header()?;
        let block_size = header.block_size as usize;

        let region = layer1.len()? - layer1.data_offset();
        if region % block_size as u64 != 0 {
            return Err(MuxError::Format(format!(
                "block region of {} bytes is not a whole number of {}-byte blocks",
                region, block_size
            )));
        }
        let total_blocks = region / block_size as u64;
        if total_blocks >= NO_BLOCK as u64 {
            return Err(MuxError::Format(format!(
                "{} blocks exceed the 32-bit block space",
                total_blocks
            )));
        }
        let total_blocks = total_blocks as u32;

        let mut blocks = Self::new(layer1, block_size, mode, total_blocks);
        if options.use_memory_mapping && mode == OpenMode::Read && total_blocks > 0 {
            blocks.mapped = Some(MappedSlices::new(block_size, total_blocks));
        }
        Ok(blocks)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.state.lock().total_blocks
    }

    fn free_count(&self) -> u32 {
        self.state.lock().free.len() as u32
    }

    fn free_blocks(&self) -> Vec<u32> {
        self.state.lock().free.iter().copied().collect()
    }

    fn allocate_block(&self) -> Result<u32> {
        if self.mode == OpenMode::Read {
            return Err(MuxError::Usage("block store is read-only".to_string()));
        }
        let mut state = self.state.lock();
        if let Some(index) = state.free.pop_first() {
            return Ok(index);
        }
        if state.total_blocks == NO_BLOCK {
            return Err(MuxError::Capacity(format!(
                "32-bit block address space exhausted ({} blocks)",
                state.total_blocks
            )));
        }
        let index = state.total_blocks;
        state.total_blocks += 1;
        Ok(index)
    }

    fn deallocate_blocks(&self, indices: &[u32]) -> Result<()> {
        let mut state = self.state.lock();
        for &index in indices {
            if index >= state.total_blocks {
                return Err(MuxError::Usage(format!(
                    "cannot free block {}: only {} blocks allocated",
                    index, state.total_blocks
                )));
            }
        }
        for &index in indices {
            if !state.free.insert(index) {
                return Err(MuxError::Usage(format!("block {} freed twice", index)));
            }
        }
        drop(state);

        for &index in indices {
            self.evict(index);
        }
        Ok(())
    }

    fn read_block(&self, index: u32, buf: &mut [u8], cache: CacheMode) -> Result<()> {
        self.check_len(buf.len(), "read_block")?;

        if let Some(mapped) = &self.mapped {
            return mapped.read_block(&self.layer1, index, buf);
        }
        self.check_index(index, "read_block")?;

        let cache = self.effective_cache(cache);
        if self.try_cache_read(index, buf, cache).is_some() {
            return Ok(());
        }
        self.layer1.read_exact_at(self.block_offset(index), buf)?;
        self.cache_put(index, buf, cache);
        Ok(())
    }

    fn write_block(&self, index: u32, buf: &[u8], cache: CacheMode) -> Result<()> {
        self.check_len(buf.len(), "write_block")?;
        self.check_index(index, "write_block")?;
        if self.mode == OpenMode::Read {
            return Err(MuxError::Usage("block store is read-only".to_string()));
        }

        self.layer1.write_at(self.block_offset(index), buf)?;
        match self.effective_cache(cache) {
            CacheMode::None => self.refresh_if_cached(index, buf),
            mode => self.cache_put(index, buf, mode),
        }
        Ok(())
    }

    fn truncate(&self, live_blocks: u32) -> Result<()> {
        let mut state = self.state.lock();
        let dropped = state.total_blocks.saturating_sub(live_blocks);
        state.total_blocks = live_blocks;
        state.free.clear();
        drop(state);

        self.layer1.set_len(self.block_offset(live_blocks))?;
        if CACHE_BUDGET_BYTES > 0 {
            let mut lru = self.shared_cache.lock();
            let stale: Vec<u32> = lru
                .iter()
                .map(|(&index, _)| index)
                .filter(|&index| index >= live_blocks)
                .collect();
            for index in stale {
                lru.pop(&index);
            }
        }
        tracing::debug!(live_blocks, dropped, "truncated block region");
        Ok(())
    }

    fn read_header(&self) -> Result<FileHeader> {
        self.layer1.read_header()
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        self.layer1.write_header(header)
    }

    fn sync(&self) -> Result<()> {
        self.layer1.sync()
    }

    fn verify(&self, claimed_blocks: &[u32]) -> Result<Vec<String>> {
        let mut issues = Vec::new();

        let state = self.state.lock();
        let total_blocks = state.total_blocks;
        let free: HashSet<u32> = state.free.iter().copied().collect();
        drop(state);

        // 1. File size consistency
        let file_len = self.layer1.len()?;
        let expected_len = self.block_offset(total_blocks);
        if file_len != expected_len {
            issues.push(format!(
                "L2: file size ({}) does not match expected ({}) for {} blocks",
                file_len, expected_len, total_blocks
            ));
        }

        // 2. Out-of-range and duplicate claims
        let mut seen = HashSet::with_capacity(claimed_blocks.len());
        for &block in claimed_blocks {
            if block >= total_blocks {
                issues.push(format!(
                    "L2: claimed block {} is >= total_blocks ({})",
                    block, total_blocks
                ));
            }
            if !seen.insert(block) {
                issues.push(format!("L2: block {} claimed by multiple trees", block));
            }
            if free.contains(&block) {
                issues.push(format!(
                    "L2: block {} is both claimed and on the free list",
                    block
                ));
            }
        }

        // 3. Orphans: neither claimed nor free
        for block in 0..total_blocks {
            if !seen.contains(&block) && !free.contains(&block) {
                issues.push(format!(
                    "L2: block {} is orphaned (not claimed by any tree, not on free list)",
                    block
                ));
            }
        }

        Ok(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_on_disk::FileOnDisk;

    type Blocks = BlocksInFile<FileOnDisk, DEFAULT_CACHE_BUDGET_BYTES>;

    #[test]
    fn test_allocation_prefers_lowest_free_block() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("alloc.mux"), 16).unwrap();

        let ids: Vec<u32> = (0..5).map(|_| blocks.allocate_block().unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);

        blocks.deallocate_blocks(&[3, 1]).unwrap();
        assert_eq!(blocks.free_count(), 2);
        assert_eq!(blocks.free_blocks(), vec![1, 3]);

        assert_eq!(blocks.allocate_block().unwrap(), 1);
        assert_eq!(blocks.allocate_block().unwrap(), 3);
        assert_eq!(blocks.allocate_block().unwrap(), 5);
        assert_eq!(blocks.block_count(), 6);
    }

    #[test]
    fn test_double_free_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("double.mux"), 16).unwrap();
        let id = blocks.allocate_block().unwrap();
        blocks.deallocate_blocks(&[id]).unwrap();
        assert!(matches!(
            blocks.deallocate_blocks(&[id]),
            Err(MuxError::Usage(_))
        ));
        assert!(blocks.deallocate_blocks(&[42]).is_err());
    }

    #[test]
    fn test_cached_block_stays_coherent_with_writes() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("cache.mux"), 16).unwrap();
        let id = blocks.allocate_block().unwrap();

        blocks.write_block(id, &[1u8; 16], CacheMode::Shared).unwrap();
        let mut buf = [0u8; 16];
        blocks.read_block(id, &mut buf, CacheMode::Shared).unwrap();
        assert_eq!(buf, [1u8; 16]);

        // An uncached write must not leave a stale cached copy behind.
        blocks.write_block(id, &[2u8; 16], CacheMode::None).unwrap();
        blocks.read_block(id, &mut buf, CacheMode::Shared).unwrap();
        assert_eq!(buf, [2u8; 16]);

        // Thread-local requests on a writable store go through the shared cache.
        blocks.write_block(id, &[3u8; 16], CacheMode::ThreadLocal).unwrap();
        blocks.read_block(id, &mut buf, CacheMode::Shared).unwrap();
        assert_eq!(buf, [3u8; 16]);
    }

    #[test]
    fn test_reads_and_writes_are_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("bounds.mux"), 16).unwrap();
        let mut buf = [0u8; 16];
        assert!(blocks.read_block(0, &mut buf, CacheMode::None).is_err());
        let id = blocks.allocate_block().unwrap();
        assert!(blocks.write_block(id, &[0u8; 8], CacheMode::None).is_err());
    }

    #[test]
    fn test_truncate_shrinks_file_and_clears_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("trunc.mux"), 16).unwrap();
        for i in 0..4u8 {
            let id = blocks.allocate_block().unwrap();
            blocks.write_block(id, &[i; 16], CacheMode::Shared).unwrap();
        }
        blocks.deallocate_blocks(&[3]).unwrap();
        blocks.truncate(3).unwrap();
        assert_eq!(blocks.block_count(), 3);
        assert_eq!(blocks.free_count(), 0);
        assert!(blocks.verify(&[0, 1, 2]).unwrap().is_empty());
    }

    #[test]
    fn test_verify_reports_orphans_and_double_claims() {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join("verify.mux"), 16).unwrap();
        for _ in 0..3 {
            let id = blocks.allocate_block().unwrap();
            blocks.write_block(id, &[0u8; 16], CacheMode::None).unwrap();
        }
        let issues = blocks.verify(&[0, 0]).unwrap();
        assert!(issues.iter().any(|i| i.contains("multiple")));
        assert!(issues.iter().any(|i| i.contains("block 1 is orphaned")));
        assert!(issues.iter().any(|i| i.contains("block 2 is orphaned")));
    }
}
