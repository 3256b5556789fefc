use crate::error::{MuxError, Result};

/// Magic bytes at the start of every finalized container.
pub const MAGIC: &[u8; 4] = b"MUXF";

// Header layout (all fields big-endian):
// | magic: [u8;4] | block_size: u32 | directory_root: u32 | directory_length: u64 |
const H_MAGIC_OFFSET: usize = 0;
const H_BLOCK_SIZE_OFFSET: usize = H_MAGIC_OFFSET + 4;
const H_DIR_ROOT_OFFSET: usize = H_BLOCK_SIZE_OFFSET + 4;
const H_DIR_LENGTH_OFFSET: usize = H_DIR_ROOT_OFFSET + 4;

/// Total header size; block data starts right after it.
pub const HEADER_SIZE: usize = H_DIR_LENGTH_OFFSET + 8; // = 20

/// The fixed file header, written once when the writer closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub block_size: u32,
    pub directory_root: u32,
    pub directory_length: u64,
}

impl FileHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[H_MAGIC_OFFSET..H_BLOCK_SIZE_OFFSET].copy_from_slice(MAGIC);
        buf[H_BLOCK_SIZE_OFFSET..H_DIR_ROOT_OFFSET].copy_from_slice(&self.block_size.to_be_bytes());
        buf[H_DIR_ROOT_OFFSET..H_DIR_LENGTH_OFFSET]
            .copy_from_slice(&self.directory_root.to_be_bytes());
        buf[H_DIR_LENGTH_OFFSET..HEADER_SIZE]
            .copy_from_slice(&self.directory_length.to_be_bytes());
        buf
    }

    /// Parse and validate a header. `data` must hold at least `HEADER_SIZE` bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(MuxError::Format(format!(
                "truncated header: {} < {} bytes",
                data.len(),
                HEADER_SIZE
            )));
        }
        if &data[H_MAGIC_OFFSET..H_BLOCK_SIZE_OFFSET] != MAGIC {
            return Err(MuxError::Format(
                "bad magic (foreign file, or writer never closed)".to_string(),
            ));
        }
        let block_size = read_u32(&data[H_BLOCK_SIZE_OFFSET..H_DIR_ROOT_OFFSET]);
        validate_block_size(block_size).map_err(|e| match e {
            MuxError::InvalidConfig(msg) => MuxError::Format(msg),
            other => other,
        })?;
        Ok(FileHeader {
            block_size,
            directory_root: read_u32(&data[H_DIR_ROOT_OFFSET..H_DIR_LENGTH_OFFSET]),
            directory_length: u64::from_be_bytes([
                data[H_DIR_LENGTH_OFFSET],
                data[H_DIR_LENGTH_OFFSET + 1],
                data[H_DIR_LENGTH_OFFSET + 2],
                data[H_DIR_LENGTH_OFFSET + 3],
                data[H_DIR_LENGTH_OFFSET + 4],
                data[H_DIR_LENGTH_OFFSET + 5],
                data[H_DIR_LENGTH_OFFSET + 6],
                data[H_DIR_LENGTH_OFFSET + 7],
            ]),
        })
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Block sizes must hold whole 4-byte pointer slots, and at least two of them.
pub(crate) fn validate_block_size(block_size: u32) -> Result<()> {
    if block_size < 8 || block_size % 4 != 0 {
        return Err(MuxError::InvalidConfig(format!(
            "block size {} must be a multiple of 4 and at least 8",
            block_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FileHeader {
            block_size: 1024,
            directory_root: 7,
            directory_length: 48,
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..4], b"MUXF");
        assert_eq!(&bytes[4..8], &[0, 0, 4, 0]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 7]);
        assert_eq!(&bytes[12..20], &[0, 0, 0, 0, 0, 0, 0, 48]);
        assert_eq!(FileHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_unfinished_header_is_rejected() {
        let zeros = [0u8; HEADER_SIZE];
        assert!(matches!(
            FileHeader::from_bytes(&zeros),
            Err(MuxError::Format(_))
        ));
    }

    #[test]
    fn test_truncated_and_bad_block_size() {
        let header = FileHeader {
            block_size: 1024,
            directory_root: 0,
            directory_length: 0,
        };
        let bytes = header.to_bytes();
        assert!(matches!(
            FileHeader::from_bytes(&bytes[..12]),
            Err(MuxError::Format(_))
        ));

        let mut odd = bytes;
        odd[4..8].copy_from_slice(&1022u32.to_be_bytes());
        assert!(matches!(FileHeader::from_bytes(&odd), Err(MuxError::Format(_))));
    }
}
