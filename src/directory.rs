use std::collections::BTreeMap;

use crate::error::{MuxError, Result};
use crate::pyramid;

/// Stream id reserved for the directory stream itself.
pub const DIRECTORY_STREAM_ID: i32 = -1;

/// Size of one serialized directory record.
pub const ENTRY_SIZE: usize = 16;

// Record layout (big-endian): | id: i32 | root: u32 | length: u64 |
const E_ID_OFFSET: usize = 0;
pub(crate) const ROOT_FIELD_OFFSET: usize = E_ID_OFFSET + 4;
const E_LENGTH_OFFSET: usize = ROOT_FIELD_OFFSET + 4;

/// Location and size of one finalized stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryEntry {
    pub id: i32,
    /// Block address of the stream's tree root.
    pub root: u32,
    /// Stream length in bytes.
    pub length: u64,
}

impl DirectoryEntry {
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[E_ID_OFFSET..ROOT_FIELD_OFFSET].copy_from_slice(&self.id.to_be_bytes());
        buf[ROOT_FIELD_OFFSET..E_LENGTH_OFFSET].copy_from_slice(&self.root.to_be_bytes());
        buf[E_LENGTH_OFFSET..ENTRY_SIZE].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8; ENTRY_SIZE]) -> Self {
        let mut id = [0u8; 4];
        let mut root = [0u8; 4];
        let mut length = [0u8; 8];
        id.copy_from_slice(&data[E_ID_OFFSET..ROOT_FIELD_OFFSET]);
        root.copy_from_slice(&data[ROOT_FIELD_OFFSET..E_LENGTH_OFFSET]);
        length.copy_from_slice(&data[E_LENGTH_OFFSET..ENTRY_SIZE]);
        DirectoryEntry {
            id: i32::from_be_bytes(id),
            root: u32::from_be_bytes(root),
            length: u64::from_be_bytes(length),
        }
    }

    /// Tree depth implied by the stream length.
    pub fn depth(&self, block_size: usize) -> u32 {
        pyramid::depth_for_length(self.length, block_size)
    }
}

/// Replay a directory stream payload into an id-ordered index.
///
/// Rejects a payload that is not a whole number of records, the reserved
/// id, duplicate ids, and roots outside the block region.
pub(crate) fn parse_directory(
    payload: &[u8],
    total_blocks: u32,
) -> Result<BTreeMap<i32, DirectoryEntry>> {
    if payload.len() % ENTRY_SIZE != 0 {
        return Err(MuxError::Format(format!(
            "directory length {} is not a multiple of {}",
            payload.len(),
            ENTRY_SIZE
        )));
    }

    let mut entries = BTreeMap::new();
    for chunk in payload.chunks_exact(ENTRY_SIZE) {
        let mut record = [0u8; ENTRY_SIZE];
        record.copy_from_slice(chunk);
        let entry = DirectoryEntry::from_bytes(&record);

        if entry.id == DIRECTORY_STREAM_ID {
            return Err(MuxError::Format(
                "directory contains an entry for the reserved id -1".to_string(),
            ));
        }
        if entry.root >= total_blocks {
            return Err(MuxError::Format(format!(
                "stream {} root block {} is beyond the end of the file ({} blocks)",
                entry.id, entry.root, total_blocks
            )));
        }
        if entries.insert(entry.id, entry).is_some() {
            return Err(MuxError::Format(format!(
                "stream {} appears twice in the directory",
                entry.id
            )));
        }
    }
    Ok(entries)
}
