//! Random-access byte containers backing a TSFile.
//!
//! The file core never touches `std::fs` directly; everything goes through
//! the `Storage` trait so tests can run against an in-memory buffer and the
//! outer services can hand in whatever container they manage.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;

/// A random-access byte container: positional read/write, size, durability.
///
/// Implementations must be safe to share between threads; the file core
/// serializes page-level access itself but issues reads from several threads.
pub trait Storage: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `data` starting at `offset`, growing the container if needed.
    /// Bytes between the old end and `offset` read back as zero.
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size in bytes.
    fn size(&self) -> Result<u64>;

    /// Flush to the durable medium, if there is one.
    fn sync(&self) -> Result<()>;
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        (**self).write_at(offset, data)
    }
    fn size(&self) -> Result<u64> {
        (**self).size()
    }
    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// File-backed storage. A single mutex serializes the seek+IO pairs.
pub struct FileStorage {
    file: Mutex<File>,
}

impl FileStorage {
    /// Create or truncate a file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    /// Open an existing file at `path` for reading and writing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl Storage for FileStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().expect("storage mutex poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().expect("storage mutex poisoned");
        let len = file.seek(SeekFrom::End(0))?;
        if offset > len {
            // Zero-fill the gap so the byte image stays page-aligned.
            let gap = vec![0u8; (offset - len) as usize];
            file.write_all(&gap)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        let file = self.file.lock().expect("storage mutex poisoned");
        Ok(file.metadata()?.len())
    }

    fn sync(&self) -> Result<()> {
        let file = self.file.lock().expect("storage mutex poisoned");
        file.sync_all()?;
        Ok(())
    }
}

/// In-memory storage used by tests and the import paths.
pub struct MemStorage {
    data: Mutex<Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self { data: Mutex::new(Vec::new()) }
    }

    /// Wrap an existing byte image, e.g. one produced by another file.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: Mutex::new(bytes) }
    }

    /// Clone out the current byte image.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.lock().expect("storage mutex poisoned").clone()
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().expect("storage mutex poisoned");
        let start = offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read [{start}, {end}) past end {}", data.len()),
            )
            .into());
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, offset: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock().expect("storage mutex poisoned");
        let start = offset as usize;
        let end = start + src.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.lock().expect("storage mutex poisoned").len() as u64)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_storage_zero_fill() {
        let storage = MemStorage::new();
        storage.write_at(8, &[1, 2, 3]).unwrap();
        assert_eq!(storage.size().unwrap(), 11);

        let mut buf = [0xFFu8; 11];
        storage.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[0; 8]);
        assert_eq!(&buf[8..], &[1, 2, 3]);
    }

    #[test]
    fn test_mem_storage_read_past_end() {
        let storage = MemStorage::new();
        storage.write_at(0, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 4];
        assert!(storage.read_at(1, &mut buf).is_err());
    }

    #[test]
    fn test_file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.tsf");

        let storage = FileStorage::create(&path).unwrap();
        storage.write_at(4096, &[7u8; 16]).unwrap();
        storage.sync().unwrap();
        drop(storage);

        let storage = FileStorage::open(&path).unwrap();
        assert_eq!(storage.size().unwrap(), 4096 + 16);
        let mut buf = [0u8; 16];
        storage.read_at(4096, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);

        // The gap below the write reads back as zeros.
        let mut gap = [1u8; 8];
        storage.read_at(0, &mut gap).unwrap();
        assert_eq!(gap, [0u8; 8]);
    }
}
