use std::path::Path;

use crate::error::Result;
use crate::header::FileHeader;
use crate::OpenMode;

/// Controls which cache layer a block read/write should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Bypass all caches; read from / write through to L1 directly.
    None,
    /// Per-thread LRU cache (no cross-thread synchronization).
    ThreadLocal,
    /// Shared Mutex-guarded LRU cache (cross-thread coherent).
    Shared,
}

/// Options that only matter when opening an existing container.
#[derive(Debug, Clone, Copy)]
pub struct BlockOpenOptions {
    /// Serve reads from lazily mapped slices of the file (read-only opens only).
    pub use_memory_mapping: bool,
}

/// L2 trait: Block storage abstraction.
///
/// Provides numbered fixed-size blocks addressed by `u32`, a free list of
/// reclaimed addresses, and pass-through access to the file header.
///
/// All methods take `&self` (not `&mut self`) so that a single L2 instance
/// can be shared by every stream of a writer. Implementations use interior
/// mutability to protect allocation state.
pub trait BlockLayer: Send + Sync {
    /// Create a new block store at `path` with the given block size.
    fn create(path: &Path, block_size: u32) -> Result<Self>
    where
        Self: Sized;

    /// Open an existing, finalized block store. The block size and the
    /// block count come from the header and the file length.
    fn open(path: &Path, mode: OpenMode, options: BlockOpenOptions) -> Result<Self>
    where
        Self: Sized;

    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Number of block addresses handed out so far (the file's block count).
    fn block_count(&self) -> u32;

    /// Number of addresses currently on the free list.
    fn free_count(&self) -> u32;

    /// Snapshot of the free list in ascending order.
    fn free_blocks(&self) -> Vec<u32>;

    /// Allocate a block: the lowest free address if any, else the next
    /// never-used address. Contents are undefined until written.
    fn allocate_block(&self) -> Result<u32>;

    /// Return blocks to the free list.
    fn deallocate_blocks(&self, indices: &[u32]) -> Result<()>;

    /// Read a whole block into `buf` (`buf.len() == block_size`).
    fn read_block(&self, index: u32, buf: &mut [u8], cache: CacheMode) -> Result<()>;

    /// Write a whole block (`buf.len() == block_size`).
    fn write_block(&self, index: u32, buf: &[u8], cache: CacheMode) -> Result<()>;

    /// Drop every block at or above `live_blocks` and forget the free list.
    /// The caller guarantees nothing live remains above the cut.
    fn truncate(&self, live_blocks: u32) -> Result<()>;

    fn read_header(&self) -> Result<FileHeader>;

    fn write_header(&self, header: &FileHeader) -> Result<()>;

    /// Flush everything to stable storage.
    fn sync(&self) -> Result<()>;

    /// Run L2 integrity checks. `claimed_blocks` are addresses the upper
    /// layers assert are in use. Returns a list of issues found.
    fn verify(&self, claimed_blocks: &[u32]) -> Result<Vec<String>> {
        let _ = claimed_blocks;
        Ok(Vec::new())
    }
}
