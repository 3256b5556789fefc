use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::{MuxError, Result};
use crate::file_layer::FileLayer;

/// Target size of one mapped slice of the block region.
pub const SLICE_BYTES: u64 = 256 * 1024 * 1024;

/// Lazily mapped, read-only view of the block region.
///
/// The region is cut into slices of whole blocks; slice `k` is mapped the
/// first time a block inside it is read and kept for the life of the reader.
pub struct MappedSlices {
    block_size: usize,
    blocks_per_slice: u64,
    total_blocks: u32,
    slices: RwLock<Vec<Option<Arc<Mmap>>>>,
}

impl MappedSlices {
    pub fn new(block_size: usize, total_blocks: u32) -> Self {
        Self::with_slice_bytes(block_size, total_blocks, SLICE_BYTES)
    }

    /// Slices of at most `slice_bytes` each, rounded down to whole blocks
    /// (at least one block per slice).
    pub fn with_slice_bytes(block_size: usize, total_blocks: u32, slice_bytes: u64) -> Self {
        let blocks_per_slice = (slice_bytes / block_size as u64).max(1);
        MappedSlices {
            block_size,
            blocks_per_slice,
            total_blocks,
            slices: RwLock::new(Vec::new()),
        }
    }

    pub fn read_block<L1: FileLayer>(&self, layer1: &L1, index: u32, buf: &mut [u8]) -> Result<()> {
        if index >= self.total_blocks {
            return Err(MuxError::Format(format!(
                "block {} is beyond the end of the file ({} blocks)",
                index, self.total_blocks
            )));
        }
        let slice_index = index as u64 / self.blocks_per_slice;
        let start = (index as u64 % self.blocks_per_slice) as usize * self.block_size;
        let map = self.slice(layer1, slice_index as usize)?;
        buf.copy_from_slice(&map[start..start + self.block_size]);
        Ok(())
    }

    fn slice<L1: FileLayer>(&self, layer1: &L1, slice_index: usize) -> Result<Arc<Mmap>> {
        if let Some(Some(map)) = self.slices.read().get(slice_index) {
            return Ok(Arc::clone(map));
        }

        let mut table = self.slices.write();
        if table.len() <= slice_index {
            table.resize(slice_index + 1, None);
        }
        // Another thread may have mapped it while we waited for the write lock.
        if let Some(map) = &table[slice_index] {
            return Ok(Arc::clone(map));
        }

        let first_block = slice_index as u64 * self.blocks_per_slice;
        let blocks = self
            .blocks_per_slice
            .min(self.total_blocks as u64 - first_block);
        let offset = layer1.data_offset() + first_block * self.block_size as u64;
        let map = Arc::new(layer1.map(offset, blocks as usize * self.block_size)?);
        table[slice_index] = Some(Arc::clone(&map));
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_on_disk::FileOnDisk;
    use crate::header::HEADER_SIZE;
    use crate::OpenMode;

    const BLOCK: usize = 16;

    fn block_bytes(index: u32) -> Vec<u8> {
        (0..BLOCK).map(|i| (index as u8).wrapping_mul(7) ^ i as u8).collect()
    }

    fn write_blocks(path: &std::path::Path, count: u32) {
        let l1 = FileOnDisk::create(path).unwrap();
        for index in 0..count {
            let offset = HEADER_SIZE as u64 + index as u64 * BLOCK as u64;
            l1.write_at(offset, &block_bytes(index)).unwrap();
        }
    }

    #[test]
    fn test_reads_across_slice_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slices.mux");
        write_blocks(&path, 10);
        let l1 = FileOnDisk::open(&path, OpenMode::Read).unwrap();

        // 3 blocks per slice: [0,3) [3,6) [6,9) and a one-block last slice.
        let mapped = MappedSlices::with_slice_bytes(BLOCK, 10, 3 * BLOCK as u64);
        let mut buf = vec![0u8; BLOCK];
        for index in [2u32, 3, 5, 6, 8, 9, 0, 4] {
            mapped.read_block(&l1, index, &mut buf).unwrap();
            assert_eq!(buf, block_bytes(index), "block {}", index);
        }
        assert_eq!(mapped.slices.read().len(), 4);
        assert!(matches!(
            mapped.read_block(&l1, 10, &mut buf),
            Err(MuxError::Format(_))
        ));
    }

    #[test]
    fn test_slice_size_rounds_down_to_whole_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uneven.mux");
        write_blocks(&path, 7);
        let l1 = FileOnDisk::open(&path, OpenMode::Read).unwrap();

        // 40 bytes hold two whole blocks; a slice smaller than a block still
        // holds one.
        for (slice_bytes, per_slice) in [(40u64, 2u64), (5, 1)] {
            let mapped = MappedSlices::with_slice_bytes(BLOCK, 7, slice_bytes);
            assert_eq!(mapped.blocks_per_slice, per_slice);
            let mut buf = vec![0u8; BLOCK];
            for index in (0..7u32).rev() {
                mapped.read_block(&l1, index, &mut buf).unwrap();
                assert_eq!(buf, block_bytes(index), "block {}", index);
            }
        }
    }
}
