//! Positional file I/O
//!
//! Both store files are accessed through BlockFile, which issues positional
//! reads and writes (pread/pwrite style) so reader threads and the flusher
//! never contend on a shared file cursor. The append cursor is tracked in an
//! atomic rather than re-stat'ing the file on every write.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::durability::durable_sync;
use crate::error::{StrideError, StrideResult};

pub struct BlockFile {
    file: File,
    path: PathBuf,
    size: AtomicU64,
}

impl BlockFile {
    /// Open or create the file at `path`, creating parent directories as
    /// needed.
    pub fn open<P: AsRef<Path>>(path: P) -> StrideResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StrideError::Io {
                    path: Some(parent.to_path_buf()),
                    kind: e.kind(),
                    message: format!("Failed to create parent directory: {}", e),
                })?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StrideError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to open file: {}", e),
            })?;

        let size = file
            .metadata()
            .map_err(|e| StrideError::Io {
                path: Some(path.clone()),
                kind: e.kind(),
                message: format!("Failed to stat file: {}", e),
            })?
            .len();

        Ok(Self {
            file,
            path,
            size: AtomicU64::new(size),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Read at most `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; fewer than requested means end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StrideResult<usize> {
        let mut read = 0;
        while read < buf.len() {
            match pread(&self.file, &mut buf[read..], offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e, "read")),
            }
        }
        Ok(read)
    }

    /// Write all of `buf` at `offset`, extending the file if necessary.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> StrideResult<()> {
        let mut written = 0;
        while written < buf.len() {
            match pwrite(&self.file, &buf[written..], offset + written as u64) {
                Ok(0) => {
                    return Err(StrideError::ShortWrite {
                        path: self.path.clone(),
                        offset,
                        expected: buf.len(),
                        actual: written,
                    })
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.io_error(e, "write")),
            }
        }
        self.size.fetch_max(offset + buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Write all of `buf` at the current end of file. Only one thread appends
    /// at a time (the flusher), so the load-then-write pair does not race.
    pub fn append(&self, buf: &[u8]) -> StrideResult<()> {
        let offset = self.size.load(Ordering::Acquire);
        self.write_at(offset, buf)
    }

    pub fn truncate(&self) -> StrideResult<()> {
        self.file
            .set_len(0)
            .map_err(|e| self.io_error(e, "truncate"))?;
        self.size.store(0, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> StrideResult<()> {
        durable_sync(&self.file).map_err(|e| self.io_error(e, "sync"))
    }

    fn io_error(&self, e: io::Error, op: &str) -> StrideError {
        StrideError::Io {
            path: Some(self.path.clone()),
            kind: e.kind(),
            message: format!("{} failed: {}", op, e),
        }
    }
}

#[cfg(unix)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pread(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp(name: &str) -> (BlockFile, TempDir) {
        let dir = TempDir::new().unwrap();
        let file = BlockFile::open(dir.path().join(name)).unwrap();
        (file, dir)
    }

    #[test]
    fn test_open_creates_empty_file() {
        let (file, _dir) = open_temp("empty.dat");
        assert_eq!(file.size(), 0);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b").join("file.dat");
        let file = BlockFile::open(&nested).unwrap();
        assert_eq!(file.size(), 0);
        assert!(nested.exists());
    }

    #[test]
    fn test_write_read_round_trip() {
        let (file, _dir) = open_temp("rw.dat");

        file.write_at(0, b"hello world").unwrap();
        assert_eq!(file.size(), 11);

        let mut buf = [0u8; 5];
        let n = file.read_at(6, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"world");
    }

    #[test]
    fn test_read_past_end_is_short() {
        let (file, _dir) = open_temp("short.dat");
        file.write_at(0, b"abc").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 3);
        assert_eq!(file.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_append_tracks_size() {
        let (file, _dir) = open_temp("append.dat");

        file.append(b"one").unwrap();
        file.append(b"two").unwrap();
        assert_eq!(file.size(), 6);

        let mut buf = [0u8; 6];
        file.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"onetwo");
    }

    #[test]
    fn test_sparse_write_extends_size() {
        let (file, _dir) = open_temp("sparse.dat");
        file.write_at(4096, b"block").unwrap();
        assert_eq!(file.size(), 4101);
    }

    #[test]
    fn test_truncate_resets() {
        let (file, _dir) = open_temp("trunc.dat");
        file.append(b"data").unwrap();
        file.truncate().unwrap();
        assert_eq!(file.size(), 0);

        let mut buf = [0u8; 4];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_reopen_recovers_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.dat");
        {
            let file = BlockFile::open(&path).unwrap();
            file.append(b"persistent bytes").unwrap();
            file.sync().unwrap();
        }
        let file = BlockFile::open(&path).unwrap();
        assert_eq!(file.size(), 16);
    }
}
