use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use crate::block_layer::{BlockLayer, BlockOpenOptions, CacheMode};
use crate::directory::{self, DirectoryEntry, ENTRY_SIZE};
use crate::error::{MuxError, Result};
use crate::header::FileHeader;
use crate::pyramid;
use crate::tree_cursor::TreeCursor;
use crate::OpenMode;

/// Options for opening a finalized container.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Serve block reads from memory-mapped slices of the file.
    pub use_memory_mapping: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            use_memory_mapping: cfg!(target_pointer_width = "64"),
        }
    }
}

/// Read side of a finalized container file.
///
/// The directory is replayed once at open; streams are then served
/// independently, and any number of [`StreamReader`]s may be used from
/// different threads at once.
pub struct MuxReader<L2: BlockLayer> {
    store: L2,
    header: FileHeader,
    entries: BTreeMap<i32, DirectoryEntry>,
}

impl<L2: BlockLayer> MuxReader<L2> {
    pub fn open(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let store = L2::open(
            path,
            OpenMode::Read,
            BlockOpenOptions {
                use_memory_mapping: options.use_memory_mapping,
            },
        )?;
        let header = store.read_header()?;
        let total_blocks = store.block_count();

        if header.directory_root >= total_blocks {
            return Err(MuxError::Format(format!(
                "directory root {} is beyond the end of the file ({} blocks)",
                header.directory_root, total_blocks
            )));
        }
        if header.directory_length % ENTRY_SIZE as u64 != 0 {
            return Err(MuxError::Format(format!(
                "directory length {} is not a multiple of {}",
                header.directory_length, ENTRY_SIZE
            )));
        }
        let region = total_blocks as u64 * header.block_size as u64;
        if header.directory_length > region {
            return Err(MuxError::Format(format!(
                "directory length {} exceeds the block region ({} bytes)",
                header.directory_length, region
            )));
        }

        let mut payload = vec![0u8; header.directory_length as usize];
        let mut cursor = TreeCursor::new(
            header.directory_root,
            header.directory_length,
            header.block_size as usize,
        );
        let mut filled = 0;
        while filled < payload.len() {
            let n = cursor.read_at(&store, filled as u64, &mut payload[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let entries = directory::parse_directory(&payload, total_blocks)?;

        tracing::info!(
            path = %path.display(),
            streams = entries.len(),
            blocks = total_blocks,
            mapped = options.use_memory_mapping,
            "opened container"
        );
        Ok(MuxReader {
            store,
            header,
            entries,
        })
    }

    pub fn block_size(&self) -> usize {
        self.header.block_size as usize
    }

    pub fn block_count(&self) -> u32 {
        self.store.block_count()
    }

    pub fn stream_count(&self) -> usize {
        self.entries.len()
    }

    pub fn stream_ids(&self) -> BTreeSet<i32> {
        self.entries.keys().copied().collect()
    }

    pub fn has_stream(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn entry(&self, id: i32) -> Option<DirectoryEntry> {
        self.entries.get(&id).copied()
    }

    /// A reader positioned at the start of stream `id`, if it exists.
    pub fn open_stream(&self, id: i32) -> Option<StreamReader<'_, L2>> {
        let entry = self.entries.get(&id)?;
        Some(StreamReader {
            store: &self.store,
            entry: *entry,
            cursor: TreeCursor::new(entry.root, entry.length, self.block_size()),
            position: 0,
        })
    }

    /// Walk the directory and every stream tree, then check that each block
    /// is claimed exactly once. Returns a list of issues (empty = clean).
    pub fn verify(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let mut claimed = Vec::new();
        let total_blocks = self.store.block_count();

        let mut collect = |label: String, root: u32, length: u64, issues: &mut Vec<String>| {
            let result = pyramid::walk_tree(
                &self.store,
                root,
                length,
                CacheMode::ThreadLocal,
                &mut |address, _, _| {
                    if address >= total_blocks {
                        return Err(MuxError::Format(format!(
                            "block {} out of range ({} blocks)",
                            address, total_blocks
                        )));
                    }
                    claimed.push(address);
                    Ok(())
                },
            );
            if let Err(e) = result {
                issues.push(format!("{}: {}", label, e));
            }
        };

        collect(
            "directory".to_string(),
            self.header.directory_root,
            self.header.directory_length,
            &mut issues,
        );
        for entry in self.entries.values() {
            collect(
                format!("stream {}", entry.id),
                entry.root,
                entry.length,
                &mut issues,
            );
        }

        issues.extend(self.store.verify(&claimed)?);
        Ok(issues)
    }
}

/// Random-access reader over one finalized stream.
pub struct StreamReader<'a, L2: BlockLayer> {
    store: &'a L2,
    entry: DirectoryEntry,
    cursor: TreeCursor,
    position: u64,
}

impl<L2: BlockLayer> StreamReader<'_, L2> {
    pub fn id(&self) -> i32 {
        self.entry.id
    }

    pub fn length(&self) -> u64 {
        self.entry.length
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn depth(&self) -> u32 {
        self.cursor.depth()
    }

    /// Move to `pos`; `pos == length` is allowed (end of stream).
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.entry.length {
            return Err(MuxError::SeekOutOfBounds(format!(
                "position {} is beyond the length {} of stream {}",
                pos, self.entry.length, self.entry.id
            )));
        }
        self.position = pos;
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns 0 at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self
                .cursor
                .read_at(self.store, self.position, &mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
            self.position += n as u64;
        }
        Ok(done)
    }
}

impl<L2: BlockLayer> io::Read for StreamReader<'_, L2> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(StreamReader::read(self, buf)?)
    }
}

impl<L2: BlockLayer> io::Seek for StreamReader<'_, L2> {
    fn seek(&mut self, from: io::SeekFrom) -> io::Result<u64> {
        let target = match from {
            io::SeekFrom::Start(pos) => Some(pos),
            io::SeekFrom::End(delta) => self.entry.length.checked_add_signed(delta),
            io::SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of stream")
        })?;
        StreamReader::seek(self, target)?;
        Ok(target)
    }
}
