use crate::block_layer::{BlockLayer, CacheMode};
use crate::error::{MuxError, Result};
use crate::pyramid::{self, POINTER_SIZE};

/// One in-progress block of the tree.
#[derive(Debug)]
struct Level {
    buf: Vec<u8>,
    filled: usize,
    /// How many nodes of this height have already been written out.
    flushed: u64,
}

impl Level {
    fn new(block_size: usize) -> Self {
        Level {
            buf: vec![0u8; block_size],
            filled: 0,
            flushed: 0,
        }
    }
}

/// Write side of a stream's block tree.
///
/// `levels[h]` is the in-progress node at height `h`: `levels[0]` buffers
/// data, the last level is the current root. Appending behaves like a
/// mixed-radix counter: a full node is written to a fresh block and its
/// address is appended to the node above it, and when the root itself has
/// to be written a new root is pushed on top.
///
/// Nodes are flushed lazily (only when one more byte or pointer has to go
/// in), so a full root is not replaced until the next write or `finish`.
/// The in-memory levels can therefore trail the minimal depth for the
/// length by one; `depth` reports the minimal depth regardless.
#[derive(Debug)]
pub struct WriteTree {
    block_size: usize,
    max_length: u64,
    levels: Vec<Level>,
    length: u64,
}

fn cache_for_height(height: usize) -> CacheMode {
    if height == 0 {
        CacheMode::None
    } else {
        CacheMode::Shared
    }
}

impl WriteTree {
    /// A tree that refuses to grow past `max_length` bytes.
    pub fn new(block_size: usize, max_length: u64) -> Self {
        WriteTree {
            block_size,
            max_length,
            levels: vec![Level::new(block_size)],
            length: 0,
        }
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Pointer levels above the data level that the length written so far
    /// needs; the finished tree has exactly this depth.
    pub fn depth(&self) -> u32 {
        pyramid::depth_for_length(self.length, self.block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of levels (`depth + 1`).
    pub(crate) fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Nodes already written at `height`; the in-memory node has this index.
    pub(crate) fn flushed(&self, height: usize) -> u64 {
        self.levels.get(height).map_or(0, |l| l.flushed)
    }

    /// Contents of the in-memory node at `height`.
    pub(crate) fn buffer(&self, height: usize) -> &[u8] {
        match self.levels.get(height) {
            Some(level) => level.buf.as_slice(),
            None => &[],
        }
    }

    /// Append bytes to the stream.
    pub fn write<L2: BlockLayer>(&mut self, store: &L2, mut data: &[u8]) -> Result<()> {
        let end = self.length.saturating_add(data.len() as u64);
        if end > self.max_length {
            return Err(MuxError::Capacity(format!(
                "writing {} bytes at length {} exceeds the stream limit of {} bytes",
                data.len(),
                self.length,
                self.max_length
            )));
        }

        while !data.is_empty() {
            if self.levels[0].filled == self.block_size {
                self.flush_level(store, 0)?;
            }
            let level = &mut self.levels[0];
            let n = data.len().min(self.block_size - level.filled);
            level.buf[level.filled..level.filled + n].copy_from_slice(&data[..n]);
            level.filled += n;
            self.length += n as u64;
            data = &data[n..];
        }
        Ok(())
    }

    /// Write the node at `height` to a new block and record its address in
    /// the node above, making room there (or growing a new root) first.
    fn flush_level<L2: BlockLayer>(&mut self, store: &L2, height: usize) -> Result<()> {
        if height + 1 == self.levels.len() {
            self.levels.push(Level::new(self.block_size));
        }
        if self.levels[height + 1].filled == self.block_size {
            self.flush_level(store, height + 1)?;
        }

        let address = store.allocate_block()?;
        let level = &mut self.levels[height];
        store.write_block(address, &level.buf, cache_for_height(height))?;
        level.buf.fill(0);
        level.filled = 0;
        level.flushed += 1;

        let parent = &mut self.levels[height + 1];
        pyramid::write_pointer(&mut parent.buf, parent.filled / POINTER_SIZE, address);
        parent.filled += POINTER_SIZE;
        Ok(())
    }

    /// Zero-pad and write out every in-memory node, returning the root
    /// address. The tree must not be used afterwards.
    pub fn finish<L2: BlockLayer>(&mut self, store: &L2) -> Result<u32> {
        let mut height = 0;
        while height + 1 < self.levels.len() {
            self.flush_level(store, height)?;
            height += 1;
        }

        let root = store.allocate_block()?;
        store.write_block(root, &self.levels[height].buf, cache_for_height(height))?;
        Ok(root)
    }

    /// Every block this tree has written so far. Pointers still sitting in
    /// the in-memory nodes reference complete subtrees.
    pub fn written_blocks<L2: BlockLayer>(&self, store: &L2) -> Result<Vec<u32>> {
        let mut blocks = Vec::new();
        for height in 1..self.levels.len() {
            let level = &self.levels[height];
            let child_leaves = pyramid::span(self.block_size, height as u32 - 1);
            for slot in 0..level.filled / POINTER_SIZE {
                let child = pyramid::read_pointer(&level.buf, slot);
                pyramid::walk_node(
                    store,
                    child,
                    height as u32 - 1,
                    child_leaves,
                    None,
                    CacheMode::Shared,
                    &mut |address, _, _| {
                        blocks.push(address);
                        Ok(())
                    },
                )?;
            }
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks_in_file::{BlocksInFile, DEFAULT_CACHE_BUDGET_BYTES};
    use crate::file_on_disk::FileOnDisk;

    type Blocks = BlocksInFile<FileOnDisk, DEFAULT_CACHE_BUDGET_BYTES>;

    fn scratch(name: &str) -> (tempfile::TempDir, Blocks) {
        let dir = tempfile::tempdir().unwrap();
        let blocks = Blocks::create(&dir.path().join(name), 16).unwrap();
        (dir, blocks)
    }

    #[test]
    fn test_depth_grows_lazily() {
        let (_dir, store) = scratch("lazy.mux");
        let mut tree = WriteTree::new(16, u64::MAX);

        tree.write(&store, &[1u8; 16]).unwrap();
        assert_eq!(tree.depth(), 0);
        assert_eq!(store.block_count(), 0);

        tree.write(&store, &[2u8]).unwrap();
        assert_eq!(tree.depth(), 1);
        assert_eq!(store.block_count(), 1);

        // 64 bytes fill exactly one pointer block's worth of data blocks.
        tree.write(&store, &[3u8; 47]).unwrap();
        assert_eq!(tree.length(), 64);
        assert_eq!(tree.depth(), 1);
    }

    #[test]
    fn test_depth_is_minimal_past_each_threshold() {
        let (_dir, store) = scratch("thresholds.mux");
        let mut tree = WriteTree::new(16, u64::MAX);
        // block_size=16, fan_out=4: one more byte than 16, 64, 256
        for (length, depth) in [(16u64, 0u32), (17, 1), (64, 1), (65, 2), (256, 2), (257, 3)] {
            let grow = (length - tree.length()) as usize;
            tree.write(&store, &vec![5u8; grow]).unwrap();
            assert_eq!(tree.depth(), depth, "length {}", length);
        }
        assert_eq!(tree.level_count(), 3);

        tree.finish(&store).unwrap();
        assert_eq!(tree.depth(), 3);
    }

    #[test]
    fn test_finish_block_counts() {
        // (length, data blocks + pointer blocks) for block_size=16, fan_out=4
        for (length, expected) in [(0u64, 1u32), (16, 1), (17, 3), (64, 5), (65, 8)] {
            let (_dir, store) = scratch("count.mux");
            let mut tree = WriteTree::new(16, u64::MAX);
            tree.write(&store, &vec![7u8; length as usize]).unwrap();
            let root = tree.finish(&store).unwrap();
            assert_eq!(store.block_count(), expected, "length {}", length);
            assert!(root < store.block_count());
        }
    }

    #[test]
    fn test_root_points_at_data_in_order() {
        let (_dir, store) = scratch("order.mux");
        let mut tree = WriteTree::new(16, u64::MAX);
        let data: Vec<u8> = (0..40u8).collect();
        tree.write(&store, &data).unwrap();
        let root = tree.finish(&store).unwrap();

        let mut root_block = vec![0u8; 16];
        store.read_block(root, &mut root_block, CacheMode::None).unwrap();
        let mut read_back = Vec::new();
        for slot in 0..3 {
            let mut block = vec![0u8; 16];
            let address = pyramid::read_pointer(&root_block, slot);
            store.read_block(address, &mut block, CacheMode::None).unwrap();
            read_back.extend_from_slice(&block);
        }
        assert_eq!(&read_back[..40], &data[..]);
        assert!(read_back[40..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (_dir, store) = scratch("cap.mux");
        let mut tree = WriteTree::new(16, pyramid::capacity(16, 1));
        tree.write(&store, &[0u8; 64]).unwrap();
        assert!(matches!(
            tree.write(&store, &[0u8]),
            Err(MuxError::Capacity(_))
        ));
        assert_eq!(tree.length(), 64);
        tree.finish(&store).unwrap();
        assert_eq!(store.block_count(), 5);
    }

    #[test]
    fn test_written_blocks_covers_every_flushed_block() {
        let (_dir, store) = scratch("written.mux");
        let mut tree = WriteTree::new(16, u64::MAX);
        tree.write(&store, &[9u8; 300]).unwrap();

        let mut written = tree.written_blocks(&store).unwrap();
        written.sort_unstable();
        let all: Vec<u32> = (0..store.block_count()).collect();
        assert_eq!(written, all);
    }
}
