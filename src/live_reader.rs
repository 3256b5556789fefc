use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::block_layer::{BlockLayer, CacheMode};
use crate::error::{MuxError, Result};
use crate::pyramid;
use crate::stream_tree::WriteTree;
use crate::writer::{Shared, StreamSlot};

/// Reader over a stream that is still being written.
///
/// Sees every byte written so far, including bytes still sitting in the
/// writer's in-memory nodes. Nodes that are already on disk are cached one
/// per height; the in-memory node at each height is read in place.
///
/// Each call takes the stream's lock, so reads are ordered with respect to
/// writes on the same stream but a reader positioned mid-write sees the
/// length as of its own call.
///
/// The reader does not keep the writer alive: once the writer is closed,
/// reads fail with a usage error and the file is free to be reopened.
pub struct LiveReader<L2: BlockLayer> {
    shared: Weak<Shared<L2>>,
    slot: Arc<Mutex<StreamSlot>>,
    position: u64,
    /// `cache[h]` = (node index at height h, block contents), disk nodes only
    cache: Vec<Option<(u64, Vec<u8>)>>,
}

impl<L2: BlockLayer> LiveReader<L2> {
    pub(crate) fn new(
        shared: Weak<Shared<L2>>,
        slot: Arc<Mutex<StreamSlot>>,
        start_pos: u64,
    ) -> Result<Self> {
        let mut reader = LiveReader {
            shared,
            slot,
            position: 0,
            cache: Vec::new(),
        };
        reader.seek(start_pos)?;
        Ok(reader)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes written to the stream so far.
    pub fn length(&self) -> Result<u64> {
        Ok(self.slot.lock().tree("read")?.length())
    }

    /// Move to `pos`, which may equal the current length but not exceed it.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        let length = self.length()?;
        if pos > length {
            return Err(MuxError::SeekOutOfBounds(format!(
                "position {} is beyond the stream length {}",
                pos, length
            )));
        }
        self.position = pos;
        Ok(())
    }

    /// Read up to `buf.len()` bytes from the current position. Returns 0 at
    /// the current end of the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let shared = self.shared.upgrade().ok_or_else(|| {
            MuxError::Usage("cannot read stream: writer is closed".to_string())
        })?;
        let slot = Arc::clone(&self.slot);
        let slot = slot.lock();
        let tree = slot.tree("read")?;

        let block_size = tree.block_size();
        let mut done = 0;
        while done < buf.len() && self.position < tree.length() {
            let index = self.position / block_size as u64;
            let offset = (self.position % block_size as u64) as usize;
            let n = ((block_size - offset) as u64)
                .min(tree.length() - self.position)
                .min((buf.len() - done) as u64) as usize;

            self.resolve(&shared.store, tree, 0, index)?;
            let block = self.view(tree, 0, index);
            buf[done..done + n].copy_from_slice(&block[offset..offset + n]);
            done += n;
            self.position += n as u64;
        }
        Ok(done)
    }

    /// Make node `node` at `height` readable: either it is the writer's
    /// in-memory node, or it is loaded into the cache via its parent.
    fn resolve(&mut self, store: &L2, tree: &WriteTree, height: usize, node: u64) -> Result<()> {
        if node == tree.flushed(height) {
            return Ok(());
        }
        if matches!(self.cache.get(height), Some(Some((cached, _))) if *cached == node) {
            return Ok(());
        }
        if height + 1 >= tree.level_count() {
            return Err(MuxError::Format(format!(
                "node {} at height {} has no parent",
                node, height
            )));
        }

        let fan_out = pyramid::fan_out(tree.block_size());
        let parent = node / fan_out;
        self.resolve(store, tree, height + 1, parent)?;
        let address = pyramid::read_pointer(
            self.view(tree, height + 1, parent),
            (node % fan_out) as usize,
        );

        if self.cache.len() < tree.level_count() {
            self.cache.resize(tree.level_count(), None);
        }
        let mut block = match self.cache[height].take() {
            Some((_, buf)) => buf,
            None => vec![0u8; tree.block_size()],
        };
        let cache = if height == 0 {
            CacheMode::None
        } else {
            CacheMode::Shared
        };
        store.read_block(address, &mut block, cache)?;
        self.cache[height] = Some((node, block));
        Ok(())
    }

    /// Bytes of a node made readable by `resolve`.
    fn view<'a>(&'a self, tree: &'a WriteTree, height: usize, node: u64) -> &'a [u8] {
        if node == tree.flushed(height) {
            return tree.buffer(height);
        }
        match self.cache.get(height) {
            Some(Some((_, block))) => block.as_slice(),
            _ => &[],
        }
    }
}
