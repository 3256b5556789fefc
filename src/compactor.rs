//! End-of-life compaction.
//!
//! After every stream and the directory are finalized, blocks above the
//! live watermark are moved into the free slots below it and the file is
//! truncated. Only pointers change: a moved block's single referrer (the
//! header, a directory record, or a parent pointer slot) is rewritten to
//! the new address.

use std::collections::{BTreeMap, HashMap};

use crate::block_layer::{BlockLayer, CacheMode};
use crate::directory::{DirectoryEntry, ENTRY_SIZE, ROOT_FIELD_OFFSET};
use crate::error::{MuxError, Result};
use crate::pyramid::{self, POINTER_SIZE};

/// Who holds the only pointer to a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Referrer {
    /// The header's directory root field.
    DirectoryRoot,
    /// The root field of directory record `n`.
    StreamRoot(usize),
    /// A slot inside a pointer block.
    Slot { parent: u32, slot: usize },
}

/// Outcome of one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactionReport {
    pub relocated: usize,
    pub live_blocks: u32,
    pub reclaimed: u32,
}

/// Compact a finalized container in place.
///
/// `directory_root` and `entries` (in directory order) are updated to the
/// relocated addresses; the directory's data blocks are patched on disk.
pub fn compact<L2: BlockLayer>(
    store: &L2,
    directory_root: &mut u32,
    directory_length: u64,
    entries: &mut [DirectoryEntry],
) -> Result<CompactionReport> {
    let free = store.free_blocks();
    let total = store.block_count();
    if free.is_empty() {
        return Ok(CompactionReport {
            live_blocks: total,
            ..Default::default()
        });
    }
    let live = total - free.len() as u32;

    // 1. Who points at what. Directory data blocks are kept in stream order
    //    so record roots can be patched afterwards.
    let mut referrers: HashMap<u32, Referrer> = HashMap::with_capacity(live as usize);
    let mut directory_data: Vec<u32> = Vec::new();
    let mut claim = |address: u32, referrer: Referrer| -> Result<()> {
        if referrers.insert(address, referrer).is_some() {
            return Err(MuxError::Format(format!(
                "block {} is referenced twice",
                address
            )));
        }
        Ok(())
    };

    pyramid::walk_tree(
        store,
        *directory_root,
        directory_length,
        CacheMode::Shared,
        &mut |address, height, parent| {
            if height == 0 {
                directory_data.push(address);
            }
            match parent {
                None => claim(address, Referrer::DirectoryRoot),
                Some((parent, slot)) => claim(address, Referrer::Slot { parent, slot }),
            }
        },
    )?;
    for (index, entry) in entries.iter().enumerate() {
        pyramid::walk_tree(
            store,
            entry.root,
            entry.length,
            CacheMode::Shared,
            &mut |address, _, parent| match parent {
                None => claim(address, Referrer::StreamRoot(index)),
                Some((parent, slot)) => claim(address, Referrer::Slot { parent, slot }),
            },
        )?;
    }

    if referrers.len() != live as usize {
        return Err(MuxError::Format(format!(
            "{} blocks reachable but {} expected live ({} allocated, {} free)",
            referrers.len(),
            live,
            total,
            free.len()
        )));
    }

    // 2. Pair high referenced blocks with low free slots.
    let mut high: Vec<u32> = referrers.keys().copied().filter(|&a| a >= live).collect();
    high.sort_unstable();
    let low: Vec<u32> = free.iter().copied().filter(|&a| a < live).collect();
    if high.len() != low.len() {
        return Err(MuxError::Format(format!(
            "{} blocks to move but {} free slots below {}",
            high.len(),
            low.len(),
            live
        )));
    }

    // 3. Copy contents.
    let block_size = store.block_size();
    let mut block = vec![0u8; block_size];
    let mut moved: HashMap<u32, u32> = HashMap::with_capacity(high.len());
    for (&from, &to) in high.iter().zip(low.iter()) {
        store.read_block(from, &mut block, CacheMode::None)?;
        store.write_block(to, &block, CacheMode::None)?;
        moved.insert(from, to);
    }

    // 4. Rewrite the referrers, grouped per pointer block.
    let mut slot_updates: BTreeMap<u32, Vec<(usize, u32)>> = BTreeMap::new();
    let mut dirty_records: Vec<usize> = Vec::new();
    for (&from, &to) in &moved {
        match referrers[&from] {
            Referrer::DirectoryRoot => *directory_root = to,
            Referrer::StreamRoot(index) => {
                entries[index].root = to;
                dirty_records.push(index);
            }
            Referrer::Slot { parent, slot } => {
                let parent = moved.get(&parent).copied().unwrap_or(parent);
                slot_updates.entry(parent).or_default().push((slot, to));
            }
        }
    }
    for (parent, updates) in slot_updates {
        store.read_block(parent, &mut block, CacheMode::Shared)?;
        for (slot, to) in updates {
            pyramid::write_pointer(&mut block, slot, to);
        }
        store.write_block(parent, &block, CacheMode::Shared)?;
    }

    // 5. Patch relocated roots inside the directory's data blocks. A root
    //    field sits at a multiple of 4 and never straddles two blocks.
    let mut record_updates: BTreeMap<u32, Vec<(usize, u32)>> = BTreeMap::new();
    for index in dirty_records {
        let offset = (index * ENTRY_SIZE + ROOT_FIELD_OFFSET) as u64;
        let data_index = (offset / block_size as u64) as usize;
        let within = (offset % block_size as u64) as usize;
        let address = directory_data.get(data_index).copied().ok_or_else(|| {
            MuxError::Format(format!(
                "directory record {} lies beyond the directory stream",
                index
            ))
        })?;
        let address = moved.get(&address).copied().unwrap_or(address);
        record_updates
            .entry(address)
            .or_default()
            .push((within, entries[index].root));
    }
    for (address, updates) in record_updates {
        store.read_block(address, &mut block, CacheMode::None)?;
        for (within, root) in updates {
            block[within..within + POINTER_SIZE].copy_from_slice(&root.to_be_bytes());
        }
        store.write_block(address, &block, CacheMode::None)?;
    }

    // 6. Drop the tail.
    store.truncate(live)?;

    tracing::debug!(
        relocated = moved.len(),
        live_blocks = live,
        "relocated blocks below the live watermark"
    );
    Ok(CompactionReport {
        relocated: moved.len(),
        live_blocks: live,
        reclaimed: total - live,
    })
}
