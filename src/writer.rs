use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::block_layer::BlockLayer;
use crate::compactor;
use crate::directory::DirectoryEntry;
use crate::error::{MuxError, Result};
use crate::header::{validate_block_size, FileHeader};
use crate::live_reader::LiveReader;
use crate::pyramid;
use crate::stream_tree::WriteTree;

/// Options for creating a new container.
///
/// Defaults: 1 KB blocks, depth limit 5 (1 KB * 256^5 = 1 PB per stream),
/// removed stream ids are not handed out again.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Block size in bytes; a multiple of 4, at least 8.
    pub block_size: u32,
    /// Maximum pointer levels per stream, bounding the stream length to
    /// `block_size * (block_size / 4)^max_depth`.
    pub max_depth: u32,
    /// Hand out removed stream ids again (smallest first).
    pub reuse_stream_ids: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            max_depth: 5,
            reuse_stream_ids: false,
        }
    }
}

impl WriterOptions {
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)
    }
}

/// Lifecycle of one stream.
#[derive(Debug)]
pub(crate) enum SlotState {
    Open(WriteTree),
    Closed(DirectoryEntry),
    Removed,
    /// Finalizing hit an I/O error; the stream's blocks are in limbo.
    Failed,
}

#[derive(Debug)]
pub(crate) struct StreamSlot {
    pub(crate) id: i32,
    pub(crate) length: u64,
    pub(crate) state: SlotState,
}

impl StreamSlot {
    /// The write tree of a still-open stream, or a usage error naming `op`.
    pub(crate) fn tree(&self, op: &str) -> Result<&WriteTree> {
        match &self.state {
            SlotState::Open(tree) => Ok(tree),
            other => Err(not_open(self.id, op, other)),
        }
    }
}

fn not_open(id: i32, op: &str, state: &SlotState) -> MuxError {
    let what = match state {
        SlotState::Open(_) => "open",
        SlotState::Closed(_) => "closed",
        SlotState::Removed => "removed",
        SlotState::Failed => "failed",
    };
    MuxError::Usage(format!("cannot {} stream {}: stream is {}", op, id, what))
}

/// The directory stream and the entries it has recorded so far.
struct DirectoryLog {
    tree: Option<WriteTree>,
    entries: Vec<DirectoryEntry>,
}

/// Open Stream Registry plus id bookkeeping.
struct Registry {
    /// `None` once `i32::MAX` has been handed out.
    next_id: Option<i32>,
    reusable: BTreeSet<i32>,
    open: HashMap<i32, Arc<Mutex<StreamSlot>>>,
}

/// State shared between the writer and its stream handles.
///
/// Lock order: stream slot, then directory, then registry; the block
/// store's own locks are innermost. The registry is never held while a slot
/// lock is being acquired.
pub(crate) struct Shared<L2: BlockLayer> {
    pub(crate) store: L2,
    options: WriterOptions,
    max_length: u64,
    directory: Mutex<DirectoryLog>,
    registry: Mutex<Registry>,
    deferred: Mutex<Option<MuxError>>,
}

impl<L2: BlockLayer> Shared<L2> {
    /// Finalize an open stream and record it in the directory. The stream
    /// leaves the registry whether or not this succeeds.
    fn close_slot(&self, slot: &mut StreamSlot) -> Result<DirectoryEntry> {
        let mut tree = match std::mem::replace(&mut slot.state, SlotState::Failed) {
            SlotState::Open(tree) => tree,
            other => {
                let err = not_open(slot.id, "close", &other);
                slot.state = other;
                return Err(err);
            }
        };

        let result = self.record(slot.id, &mut tree);
        self.registry.lock().open.remove(&slot.id);
        let entry = result?;
        slot.state = SlotState::Closed(entry);

        tracing::debug!(
            stream = entry.id,
            root = entry.root,
            length = entry.length,
            "stream closed"
        );
        Ok(entry)
    }

    /// Write out a stream's tree and append its entry to the directory.
    fn record(&self, id: i32, tree: &mut WriteTree) -> Result<DirectoryEntry> {
        let root = tree.finish(&self.store)?;
        let entry = DirectoryEntry {
            id,
            root,
            length: tree.length(),
        };

        let mut directory = self.directory.lock();
        let log = &mut *directory;
        let dir_tree = log.tree.as_mut().ok_or_else(|| {
            MuxError::Usage(format!(
                "cannot close stream {}: directory already finalized",
                id
            ))
        })?;
        dir_tree.write(&self.store, &entry.to_bytes())?;
        log.entries.push(entry);
        Ok(entry)
    }

    /// Discard an open stream and return its blocks to the free list.
    fn remove_slot(&self, slot: &mut StreamSlot) -> Result<()> {
        let blocks = match &slot.state {
            SlotState::Open(tree) => tree.written_blocks(&self.store)?,
            other => return Err(not_open(slot.id, "remove", other)),
        };
        self.store.deallocate_blocks(&blocks)?;
        slot.state = SlotState::Removed;

        let mut registry = self.registry.lock();
        registry.open.remove(&slot.id);
        if self.options.reuse_stream_ids {
            registry.reusable.insert(slot.id);
        }
        drop(registry);

        tracing::debug!(stream = slot.id, freed = blocks.len(), "stream removed");
        Ok(())
    }

    fn take_deferred(&self) -> Option<MuxError> {
        self.deferred
            .lock()
            .take()
            .map(|e| MuxError::Deferred(Box::new(e)))
    }
}

/// Writer side of a container file.
///
/// Streams are created with [`MuxWriter::new_stream`] and may be written
/// from many threads at once (one writer per stream). Nothing is readable by
/// [`crate::MuxReader`] until [`MuxWriter::close`] succeeds.
pub struct MuxWriter<L2: BlockLayer> {
    shared: Arc<Shared<L2>>,
    finished: bool,
}

impl<L2: BlockLayer> MuxWriter<L2> {
    /// Create a new container at `path`. Fails if the path exists.
    pub fn create(path: impl AsRef<Path>, options: WriterOptions) -> Result<Self> {
        options.validate()?;
        let path = path.as_ref();
        let store = L2::create(path, options.block_size)?;
        let block_size = options.block_size as usize;
        let max_length = pyramid::capacity(block_size, options.max_depth);

        tracing::info!(
            path = %path.display(),
            block_size,
            max_depth = options.max_depth,
            "created container"
        );
        Ok(MuxWriter {
            shared: Arc::new(Shared {
                store,
                options,
                max_length,
                directory: Mutex::new(DirectoryLog {
                    // The directory is bounded only by the block address space.
                    tree: Some(WriteTree::new(block_size, u64::MAX)),
                    entries: Vec::new(),
                }),
                registry: Mutex::new(Registry {
                    next_id: Some(0),
                    reusable: BTreeSet::new(),
                    open: HashMap::new(),
                }),
                deferred: Mutex::new(None),
            }),
            finished: false,
        })
    }

    pub fn options(&self) -> &WriterOptions {
        &self.shared.options
    }

    /// Start a new, empty stream.
    ///
    /// Returns a pending failure from an implicitly closed (dropped) stream
    /// instead, if there is one.
    pub fn new_stream(&self) -> Result<StreamHandle<L2>> {
        if let Some(err) = self.shared.take_deferred() {
            return Err(err);
        }

        let mut registry = self.shared.registry.lock();
        let reused = if self.shared.options.reuse_stream_ids {
            registry.reusable.pop_first()
        } else {
            None
        };
        let id = match reused {
            Some(id) => id,
            None => {
                let id = registry.next_id.ok_or_else(|| {
                    MuxError::Capacity("stream id space exhausted".to_string())
                })?;
                registry.next_id = id.checked_add(1);
                id
            }
        };

        let slot = Arc::new(Mutex::new(StreamSlot {
            id,
            length: 0,
            state: SlotState::Open(WriteTree::new(
                self.shared.options.block_size as usize,
                self.shared.max_length,
            )),
        }));
        registry.open.insert(id, Arc::clone(&slot));
        drop(registry);

        Ok(StreamHandle {
            shared: Arc::downgrade(&self.shared),
            id,
            block_size: self.shared.options.block_size as usize,
            slot,
        })
    }

    /// Blocks allocated so far (including freed ones).
    pub fn block_count(&self) -> u32 {
        self.shared.store.block_count()
    }

    /// Blocks currently on the free list.
    pub fn free_block_count(&self) -> u32 {
        self.shared.store.free_count()
    }

    pub fn open_stream_count(&self) -> usize {
        self.shared.registry.lock().open.len()
    }

    /// Finalize the file: close every still-open stream, write out the
    /// directory, compact if blocks were freed, and write the header.
    ///
    /// Every open stream is attempted even if an earlier one fails; the
    /// first failure is returned and the header is then not written, so
    /// the file is not a valid container.
    pub fn close(mut self) -> Result<()> {
        self.finished = true;
        let shared = &self.shared;

        let mut first_err = shared.take_deferred();

        let mut open: Vec<(i32, Arc<Mutex<StreamSlot>>)> = shared
            .registry
            .lock()
            .open
            .iter()
            .map(|(&id, slot)| (id, Arc::clone(slot)))
            .collect();
        open.sort_unstable_by_key(|(id, _)| *id);
        for (id, slot) in open {
            let mut slot = slot.lock();
            if !matches!(slot.state, SlotState::Open(_)) {
                continue;
            }
            if let Err(e) = shared.close_slot(&mut slot) {
                tracing::warn!(stream = id, error = %e, "failed to close stream at file close");
                first_err.get_or_insert(e);
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        let (mut directory_root, directory_length, mut entries) = {
            let mut directory = shared.directory.lock();
            let mut tree = directory.tree.take().ok_or_else(|| {
                MuxError::Usage("directory already finalized".to_string())
            })?;
            let root = tree.finish(&shared.store)?;
            (root, tree.length(), std::mem::take(&mut directory.entries))
        };

        let report = compactor::compact(
            &shared.store,
            &mut directory_root,
            directory_length,
            &mut entries,
        )?;

        let header = FileHeader {
            block_size: shared.options.block_size,
            directory_root,
            directory_length,
        };
        shared.store.write_header(&header)?;
        shared.store.sync()?;

        tracing::info!(
            streams = entries.len(),
            blocks = report.live_blocks,
            relocated = report.relocated,
            reclaimed = report.reclaimed,
            "closed container"
        );
        Ok(())
    }
}

impl<L2: BlockLayer> Drop for MuxWriter<L2> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("writer dropped without close; file is not a valid container");
        }
    }
}

/// A writable stream.
///
/// Dropping a handle whose stream is still open closes the stream; a
/// failure there is reported by the writer's next `new_stream` or `close`.
pub struct StreamHandle<L2: BlockLayer> {
    shared: Weak<Shared<L2>>,
    id: i32,
    block_size: usize,
    slot: Arc<Mutex<StreamSlot>>,
}

impl<L2: BlockLayer> StreamHandle<L2> {
    fn shared(&self, op: &str) -> Result<Arc<Shared<L2>>> {
        self.shared.upgrade().ok_or_else(|| {
            MuxError::Usage(format!(
                "cannot {} stream {}: writer is closed",
                op, self.id
            ))
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Bytes written so far.
    pub fn length(&self) -> u64 {
        self.slot.lock().length
    }

    /// Current pointer levels above the data level (0 once removed).
    pub fn depth(&self) -> u32 {
        match &self.slot.lock().state {
            SlotState::Open(tree) => tree.depth(),
            SlotState::Closed(entry) => entry.depth(self.block_size),
            SlotState::Removed | SlotState::Failed => 0,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.slot.lock().state, SlotState::Open(_))
    }

    /// Append bytes.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let shared = self.shared("write to")?;
        let mut slot = self.slot.lock();
        let slot = &mut *slot;
        match &mut slot.state {
            SlotState::Open(tree) => {
                // A failed flush may still have buffered part of `data`.
                let result = tree.write(&shared.store, data);
                slot.length = tree.length();
                result
            }
            other => Err(not_open(slot.id, "write to", other)),
        }
    }

    /// Finalize the stream and record it in the directory.
    pub fn close(&self) -> Result<DirectoryEntry> {
        let shared = self.shared("close")?;
        let mut slot = self.slot.lock();
        shared.close_slot(&mut slot)
    }

    /// Discard the stream, freeing its blocks. Only valid while open.
    pub fn remove(&self) -> Result<()> {
        let shared = self.shared("remove")?;
        let mut slot = self.slot.lock();
        shared.remove_slot(&mut slot)
    }

    /// A reader over the stream as written so far, positioned at `start_pos`.
    pub fn get_reader(&self, start_pos: u64) -> Result<LiveReader<L2>> {
        let shared = self.shared("read")?;
        LiveReader::new(Arc::downgrade(&shared), Arc::clone(&self.slot), start_pos)
    }
}

impl<L2: BlockLayer> Drop for StreamHandle<L2> {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut slot = self.slot.lock();
        if !matches!(slot.state, SlotState::Open(_)) {
            return;
        }
        tracing::warn!(stream = self.id, "stream handle dropped while open; closing it");
        if let Err(e) = shared.close_slot(&mut slot) {
            tracing::warn!(stream = self.id, error = %e, "implicit close of dropped stream failed");
            shared.deferred.lock().get_or_insert(e);
        }
    }
}

impl<L2: BlockLayer> std::fmt::Debug for StreamHandle<L2> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultWriter;

    #[test]
    fn test_last_stream_id_is_handed_out() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DefaultWriter::create(dir.path().join("ids.mux"), WriterOptions::default())
            .unwrap();
        writer.shared.registry.lock().next_id = Some(i32::MAX - 1);

        let a = writer.new_stream().unwrap();
        let b = writer.new_stream().unwrap();
        assert_eq!((a.id(), b.id()), (i32::MAX - 1, i32::MAX));
        assert!(matches!(writer.new_stream(), Err(MuxError::Capacity(_))));

        b.write(b"last").unwrap();
        b.close().unwrap();
        a.close().unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn test_options_validation() {
        assert!(WriterOptions::default().validate().is_ok());
        for block_size in [0, 4, 10, 1023] {
            let options = WriterOptions {
                block_size,
                ..Default::default()
            };
            assert!(matches!(
                options.validate(),
                Err(MuxError::InvalidConfig(_))
            ));
        }
    }
}
