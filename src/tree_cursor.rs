use crate::block_layer::{BlockLayer, CacheMode};
use crate::error::{MuxError, Result};
use crate::pyramid;

/// Read-side navigator over a finalized stream tree.
///
/// Keeps one cached block per height, tagged with the node index it holds.
/// Moving to another data block only reloads the heights whose node index
/// changed; everything above the first unchanged height stays cached.
pub struct TreeCursor {
    root: u32,
    length: u64,
    depth: u32,
    block_size: usize,
    fan_out: u64,
    /// `levels[h]` = (node index at height h, block contents)
    levels: Vec<Option<(u64, Vec<u8>)>>,
}

impl TreeCursor {
    pub fn new(root: u32, length: u64, block_size: usize) -> Self {
        let depth = pyramid::depth_for_length(length, block_size);
        TreeCursor {
            root,
            length,
            depth,
            block_size,
            fan_out: pyramid::fan_out(block_size),
            levels: vec![None; depth as usize + 1],
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Copy bytes starting at `pos` into `buf`, stopping at the end of the
    /// containing data block or of the stream. Returns the bytes copied.
    pub fn read_at<L2: BlockLayer>(
        &mut self,
        store: &L2,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if pos >= self.length || buf.is_empty() {
            return Ok(0);
        }
        let index = pos / self.block_size as u64;
        let offset = (pos % self.block_size as u64) as usize;
        // Bounded by the block size, so the narrowing cast is lossless.
        let n = ((self.block_size - offset) as u64)
            .min(self.length - pos)
            .min(buf.len() as u64) as usize;

        let block = self.load(store, index)?;
        buf[..n].copy_from_slice(&block[offset..offset + n]);
        Ok(n)
    }

    /// Make data block `index` the cached height-0 node and return it.
    fn load<L2: BlockLayer>(&mut self, store: &L2, index: u64) -> Result<&[u8]> {
        for height in (0..=self.depth).rev() {
            let node = index / self.fan_out.saturating_pow(height);
            let h = height as usize;
            if matches!(&self.levels[h], Some((cached, _)) if *cached == node) {
                continue;
            }

            let address = if height == self.depth {
                self.root
            } else {
                match &self.levels[h + 1] {
                    Some((_, parent)) => {
                        pyramid::read_pointer(parent, (node % self.fan_out) as usize)
                    }
                    None => {
                        return Err(MuxError::Format(format!(
                            "pointer block above height {} not loaded",
                            height
                        )))
                    }
                }
            };

            let cache = if height == 0 {
                CacheMode::None
            } else {
                CacheMode::ThreadLocal
            };
            let mut block = match self.levels[h].take() {
                Some((_, buf)) => buf,
                None => vec![0u8; self.block_size],
            };
            store.read_block(address, &mut block, cache)?;
            self.levels[h] = Some((node, block));
        }

        match &self.levels[0] {
            Some((_, block)) => Ok(block.as_slice()),
            None => Err(MuxError::Format("data block not loaded".to_string())),
        }
    }
}
