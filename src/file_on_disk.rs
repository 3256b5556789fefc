use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;

use crate::error::{MuxError, Result};
use crate::file_layer::FileLayer;
use crate::header::{FileHeader, HEADER_SIZE};
use crate::OpenMode;

/// L1 implementation that wraps a real file on disk.
///
/// Creates/opens a single file, acquires a process-level lock, and provides
/// random-access I/O. Every read and write goes through one mutex-guarded
/// file handle; memory mappings are created from the same handle.
pub struct FileOnDisk {
    file: Mutex<fs::File>,
    mode: OpenMode,
}

impl FileOnDisk {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

impl FileLayer for FileOnDisk {
    fn create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Err(MuxError::Usage(format!(
                "refusing to overwrite existing file {}",
                path.display()
            )));
        }

        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        FileExt::try_lock_exclusive(&file)
            .map_err(|e| MuxError::LockConflict(format!("{}: {}", path.display(), e)))?;

        // Reserve the header; it stays zero (no magic) until the writer closes.
        file.write_all(&[0u8; HEADER_SIZE])?;

        Ok(FileOnDisk {
            file: Mutex::new(file),
            mode: OpenMode::Write,
        })
    }

    fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let file = match mode {
            OpenMode::Read => fs::OpenOptions::new().read(true).open(path)?,
            OpenMode::Write => fs::OpenOptions::new().read(true).write(true).open(path)?,
        };

        match mode {
            OpenMode::Read => FileExt::try_lock_shared(&file),
            OpenMode::Write => FileExt::try_lock_exclusive(&file),
        }
        .map_err(|e| MuxError::LockConflict(format!("{}: {}", path.display(), e)))?;

        Ok(FileOnDisk {
            file: Mutex::new(file),
            mode,
        })
    }

    fn data_offset(&self) -> u64 {
        HEADER_SIZE as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        self.file.lock().set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn read_header(&self) -> Result<FileHeader> {
        let file_len = self.len()?;
        if file_len < HEADER_SIZE as u64 {
            return Err(MuxError::Format(format!(
                "file too short for header: {} < {} bytes",
                file_len, HEADER_SIZE
            )));
        }
        let mut buf = [0u8; HEADER_SIZE];
        self.read_exact_at(0, &mut buf)?;
        FileHeader::from_bytes(&buf)
    }

    fn write_header(&self, header: &FileHeader) -> Result<()> {
        self.write_at(0, &header.to_bytes())
    }

    fn map(&self, offset: u64, len: usize) -> Result<Mmap> {
        if self.mode != OpenMode::Read {
            return Err(MuxError::Usage(
                "memory mapping is only available on read-only opens".to_string(),
            ));
        }
        let file = self.file.lock();
        // SAFETY: the file is opened read-only under a shared process lock and
        // a finalized container is never modified, so the mapped bytes do not
        // change underneath us.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map(&*file)? };
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_refuses_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exists.mux");
        std::fs::write(&path, b"occupied").unwrap();
        assert!(matches!(FileOnDisk::create(&path), Err(MuxError::Usage(_))));
    }

    #[test]
    fn test_fresh_file_has_no_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.mux");
        let l1 = FileOnDisk::create(&path).unwrap();
        assert_eq!(l1.len().unwrap(), HEADER_SIZE as u64);
        assert!(matches!(l1.read_header(), Err(MuxError::Format(_))));

        let header = FileHeader {
            block_size: 64,
            directory_root: 0,
            directory_length: 0,
        };
        l1.write_header(&header).unwrap();
        assert_eq!(l1.read_header().unwrap(), header);
    }

    #[test]
    fn test_write_grows_file_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("io.mux");
        let l1 = FileOnDisk::create(&path).unwrap();
        l1.write_at(l1.data_offset() + 8, b"abcd").unwrap();
        assert_eq!(l1.len().unwrap(), HEADER_SIZE as u64 + 12);

        let mut buf = [0u8; 4];
        l1.read_exact_at(l1.data_offset() + 8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert!(l1.read_exact_at(l1.data_offset() + 10, &mut buf).is_err());
    }
}
