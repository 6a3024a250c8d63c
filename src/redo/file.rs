//! On-disk sink for redo bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use super::error::RedoResult;

/// Append-only redo file.
pub struct RedoFile {
    /// File handle.
    file: BufWriter<File>,
    /// Bytes written so far.
    size: u64,
    path: PathBuf,
}

impl RedoFile {
    /// Create (or truncate) the redo file at `path`.
    pub fn create(path: &Path) -> RedoResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(path)?;

        Ok(RedoFile {
            file: BufWriter::new(file),
            size: 0,
            path: path.to_path_buf(),
        })
    }

    pub fn write(&mut self, data: &[u8]) -> RedoResult<()> {
        self.file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> RedoResult<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Sync the file to disk.
    pub fn sync(&mut self) -> RedoResult<()> {
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back everything written to the redo file at `path`.
    pub fn read_all(path: &Path) -> RedoResult<Vec<u8>> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("redo").join("ib_logfile0");

        let mut file = RedoFile::create(&path).unwrap();
        file.write(b"abc").unwrap();
        file.write(b"def").unwrap();
        file.flush().unwrap();
        file.sync().unwrap();

        assert_eq!(file.size(), 6);
        assert_eq!(RedoFile::read_all(&path).unwrap(), b"abcdef");
    }
}
