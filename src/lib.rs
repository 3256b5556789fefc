mod block_layer;
mod blocks_in_file;
mod compactor;
mod directory;
mod error;
mod file_layer;
mod file_on_disk;
mod header;
mod live_reader;
mod mapped;
pub mod pyramid;
mod reader;
mod stream_tree;
mod tree_cursor;
mod writer;

pub use block_layer::{BlockLayer, BlockOpenOptions, CacheMode};
pub use blocks_in_file::{BlocksInFile, DEFAULT_CACHE_BUDGET_BYTES};
pub use compactor::CompactionReport;
pub use directory::{DirectoryEntry, DIRECTORY_STREAM_ID, ENTRY_SIZE};
pub use error::{MuxError, Result};
pub use file_layer::FileLayer;
pub use file_on_disk::FileOnDisk;
pub use header::{FileHeader, HEADER_SIZE, MAGIC};
pub use live_reader::LiveReader;
pub use reader::{MuxReader, ReaderOptions, StreamReader};
pub use writer::{MuxWriter, StreamHandle, WriterOptions};

/// Access mode for an opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Shared lock; the file is immutable.
    Read,
    /// Exclusive lock.
    Write,
}

/// Block store over a single file on disk.
pub type DefaultBlocks = BlocksInFile<FileOnDisk, DEFAULT_CACHE_BUDGET_BYTES>;

/// Writer over the default on-disk block store.
pub type DefaultWriter = MuxWriter<DefaultBlocks>;

/// Reader over the default on-disk block store.
pub type DefaultReader = MuxReader<DefaultBlocks>;
