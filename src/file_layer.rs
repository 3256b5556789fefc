use std::path::Path;

use memmap2::Mmap;

use crate::error::Result;
use crate::header::FileHeader;
use crate::OpenMode;

/// L1 trait: File system abstraction.
///
/// Wraps OS file I/O and provides random-access reads and writes to a single
/// file. L1 is header-aware: it knows the fixed header size, reads and writes
/// the header, and knows where block data starts.
///
/// All methods take `&self` (not `&mut self`) so that a single L1 instance
/// can be safely shared across threads. Implementations use interior
/// mutability to serialize access to the file handle.
pub trait FileLayer: Send + Sync {
    /// Create a new container file at `path`. Fails if the path exists.
    ///
    /// The header region is reserved but left zeroed (no magic) until
    /// `write_header` is called, so an unfinished file is never valid.
    fn create(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Open an existing container file.
    ///
    /// Acquires a shared process lock for `Read` mode or an exclusive lock
    /// for `Write` mode.
    fn open(path: &Path, mode: OpenMode) -> Result<Self>
    where
        Self: Sized;

    /// Byte offset in the file where block data begins.
    fn data_offset(&self) -> u64;

    /// Fill `buf` from the given absolute file offset.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write bytes at the given absolute file offset, growing the file if needed.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Set file length. Used to truncate after compaction.
    fn set_len(&self, len: u64) -> Result<()>;

    /// Flush file contents and metadata to stable storage.
    fn sync(&self) -> Result<()>;

    /// Read and validate the header.
    fn read_header(&self) -> Result<FileHeader>;

    /// Write the header.
    fn write_header(&self, header: &FileHeader) -> Result<()>;

    /// Map `len` bytes starting at absolute offset `offset` read-only.
    fn map(&self, offset: u64, len: usize) -> Result<Mmap>;
}
