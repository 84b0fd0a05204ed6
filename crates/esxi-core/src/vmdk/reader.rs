//! Random-access byte sources for the disk adapter.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A source that can read arbitrary byte ranges.
///
/// Implementations must be safe to call from several threads at once.
pub trait RangeReader: Send + Sync {
    /// Total size of the source in bytes.
    fn size(&self) -> Result<u64>;

    /// Read into `buf` starting at `offset`; returns the number of bytes read.
    ///
    /// A short read only happens at the end of the source.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let read = self.read_at(buf, offset)?;
        if read != buf.len() {
            return Err(Error::vmdk(format!(
                "short read at offset {}: wanted {} bytes, got {}",
                offset,
                buf.len(),
                read
            )));
        }
        Ok(())
    }
}

impl RangeReader for Vec<u8> {
    fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(copy_from(self, buf, offset))
    }
}

impl<R: RangeReader + ?Sized> RangeReader for std::sync::Arc<R> {
    fn size(&self) -> Result<u64> {
        (**self).size()
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        (**self).read_at(buf, offset)
    }
}

fn copy_from(data: &[u8], buf: &mut [u8], offset: u64) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let len = buf.len().min(data.len() - start);
    buf[..len].copy_from_slice(&data[start..start + len]);
    len
}

/// A memory-mapped local file.
///
/// ```no_run
/// use esxi_core::vmdk::{FileRangeReader, RangeReader};
/// use std::path::Path;
///
/// let reader = FileRangeReader::open(Path::new("disk.vmdk")).unwrap();
/// let mut magic = [0u8; 4];
/// reader.read_exact_at(&mut magic, 0).unwrap();
/// ```
pub struct FileRangeReader {
    path: PathBuf,
    /// `None` for empty files, which cannot be mapped.
    mmap: Option<Mmap>,
}

impl FileRangeReader {
    /// Open and map a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let size = file.metadata().map_err(|e| Error::io(e, path))?.len();

        let mmap = if size == 0 {
            None
        } else {
            // Safety: the file is opened read-only and the map lives no longer than the reader.
            Some(unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? })
        };

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// Path of the mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }
}

impl RangeReader for FileRangeReader {
    fn size(&self) -> Result<u64> {
        Ok(self.data().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        Ok(copy_from(self.data(), buf, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        let pattern: Vec<u8> = (0u8..=255).cycle().take(size).collect();
        file.write_all(&pattern).expect("Failed to write test data");
        file.flush().expect("Failed to flush");
        file
    }

    #[test]
    fn test_open_and_size() {
        let file = create_test_file(1024);
        let reader = FileRangeReader::open(file.path()).unwrap();
        assert_eq!(reader.size().unwrap(), 1024);
    }

    #[test]
    fn test_read_at_offset() {
        let file = create_test_file(1024);
        let reader = FileRangeReader::open(file.path()).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact_at(&mut buf, 300).unwrap();
        assert_eq!(buf, [44, 45, 46, 47]);
    }

    #[test]
    fn test_short_read_at_end() {
        let file = create_test_file(10);
        let reader = FileRangeReader::open(file.path()).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(&mut buf, 6).unwrap(), 4);
        assert_eq!(reader.read_at(&mut buf, 64).unwrap(), 0);
        assert!(reader.read_exact_at(&mut buf, 6).is_err());
    }

    #[test]
    fn test_empty_file() {
        let file = create_test_file(0);
        let reader = FileRangeReader::open(file.path()).unwrap();
        assert_eq!(reader.size().unwrap(), 0);
        let mut buf = [0u8; 1];
        assert_eq!(reader.read_at(&mut buf, 0).unwrap(), 0);
    }

    #[test]
    fn test_open_missing_file() {
        let result = FileRangeReader::open(Path::new("/nonexistent/disk.vmdk"));
        assert!(result.is_err());
    }
}
