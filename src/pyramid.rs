//! Tree arithmetic shared by the write side, the read side and the compactor.
//!
//! A stream of depth `d` is a fixed-arity tree: the root sits at height `d`,
//! data blocks at height 0, and every pointer block holds `block_size / 4`
//! big-endian 32-bit child addresses. Nodes at each height are numbered
//! left to right from 0, so data block `i` lives under pointer node
//! `i / fan_out^h` at height `h`.

use crate::block_layer::{BlockLayer, CacheMode};
use crate::error::Result;

/// Bytes per pointer slot.
pub const POINTER_SIZE: usize = 4;

/// Number of child pointers in one pointer block.
pub fn fan_out(block_size: usize) -> u64 {
    (block_size / POINTER_SIZE) as u64
}

/// Number of data blocks a stream of `length` bytes occupies once finalized.
/// An empty stream still owns one (zero-filled) data block.
pub fn data_blocks(length: u64, block_size: usize) -> u64 {
    length.div_ceil(block_size as u64).max(1)
}

/// Maximum byte length of a tree of the given depth (saturating).
pub fn capacity(block_size: usize, depth: u32) -> u64 {
    (block_size as u64).saturating_mul(fan_out(block_size).saturating_pow(depth))
}

/// Minimal depth `d` with `block_size * fan_out^d >= length`.
/// depth 0: the root is the single data block.
pub fn depth_for_length(length: u64, block_size: usize) -> u32 {
    let fan_out = fan_out(block_size);
    let mut depth: u32 = 0;
    let mut reach = block_size as u64;
    while reach < length {
        depth += 1;
        reach = reach.saturating_mul(fan_out);
    }
    depth
}

/// Number of data blocks covered by one node at `height`.
pub fn span(block_size: usize, height: u32) -> u64 {
    fan_out(block_size).saturating_pow(height)
}

/// Read the address stored in pointer slot `slot` of a pointer block.
pub fn read_pointer(block: &[u8], slot: usize) -> u32 {
    let at = slot * POINTER_SIZE;
    u32::from_be_bytes([block[at], block[at + 1], block[at + 2], block[at + 3]])
}

/// Store `address` in pointer slot `slot` of a pointer block.
pub fn write_pointer(block: &mut [u8], slot: usize, address: u32) {
    let at = slot * POINTER_SIZE;
    block[at..at + POINTER_SIZE].copy_from_slice(&address.to_be_bytes());
}

/// Where a block was found during a tree walk: the pointer block and slot
/// that reference it, or `None` for the root.
pub type Parent = Option<(u32, usize)>;

/// Depth-first, left-to-right walk over the subtree rooted at `address`.
///
/// `leaves` is the number of data blocks the subtree covers; only that many
/// leading pointers of each pointer block are followed. `visit` sees every
/// node (pointer blocks before their children), with its height and parent.
pub fn walk_node<L2, F>(
    store: &L2,
    address: u32,
    height: u32,
    leaves: u64,
    parent: Parent,
    cache: CacheMode,
    visit: &mut F,
) -> Result<()>
where
    L2: BlockLayer,
    F: FnMut(u32, u32, Parent) -> Result<()>,
{
    visit(address, height, parent)?;
    if height == 0 {
        return Ok(());
    }

    let block_size = store.block_size();
    let mut block = vec![0u8; block_size];
    store.read_block(address, &mut block, cache)?;

    let child_span = span(block_size, height - 1);
    let children = leaves.div_ceil(child_span).min(fan_out(block_size));
    for slot in 0..children {
        let child = read_pointer(&block, slot as usize);
        let child_leaves = (leaves - slot * child_span).min(child_span);
        walk_node(
            store,
            child,
            height - 1,
            child_leaves,
            Some((address, slot as usize)),
            cache,
            visit,
        )?;
    }
    Ok(())
}

/// Walk a whole finalized tree given its root and byte length.
pub fn walk_tree<L2, F>(
    store: &L2,
    root: u32,
    length: u64,
    cache: CacheMode,
    visit: &mut F,
) -> Result<()>
where
    L2: BlockLayer,
    F: FnMut(u32, u32, Parent) -> Result<()>,
{
    let block_size = store.block_size();
    walk_node(
        store,
        root,
        depth_for_length(length, block_size),
        data_blocks(length, block_size),
        None,
        cache,
        visit,
    )
}
