// Benji backup system.

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.

//! File and block-device adapter.
//!
//! Every read opens the file anew so the adapter can be shared across
//! reader threads without interior locking. Page-cache pollution from
//! streaming a whole image is avoided with `posix_fadvise(DONTNEED)`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::config::{module_configuration, ModuleSpec};
use crate::errors::Error;
use crate::io::Io;
use crate::Result;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FileIoConfig {
    #[serde(default = "default_simultaneous_reads")]
    simultaneous_reads: usize,
}

impl Default for FileIoConfig {
    fn default() -> Self {
        FileIoConfig {
            simultaneous_reads: default_simultaneous_reads(),
        }
    }
}

fn default_simultaneous_reads() -> usize {
    3
}

pub struct FileIo {
    path: PathBuf,
    block_size: u32,
    simultaneous_reads: usize,
}

impl FileIo {
    pub fn new(path: &str, block_size: u32, spec: Option<&ModuleSpec>) -> Result<FileIo> {
        let config: FileIoConfig = match spec {
            Some(spec) => module_configuration(spec)?,
            None => FileIoConfig::default(),
        };
        Ok(FileIo {
            path: PathBuf::from(path),
            block_size,
            simultaneous_reads: config.simultaneous_reads,
        })
    }

    fn io_error(&self, source: std::io::Error) -> Error {
        Error::io(self.path.display().to_string(), source)
    }

    #[cfg(unix)]
    fn drop_cache(&self, file: &File, offset: u64, length: usize) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                offset as libc::off_t,
                length as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            );
        }
    }

    #[cfg(not(unix))]
    fn drop_cache(&self, _file: &File, _offset: u64, _length: usize) {}
}

impl Io for FileIo {
    fn name(&self) -> &str {
        "file"
    }

    fn display_uri(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn size(&self) -> Result<u64> {
        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::End(0)).map_err(|e| self.io_error(e))
    }

    fn open_write(&self, size: u64, force: bool, _sparse: bool) -> Result<()> {
        if self.path.exists() {
            if !force {
                return Err(Error::PolicyViolation {
                    reason: format!(
                        "restore target {} already exists, use --force to overwrite it",
                        self.display_uri()
                    ),
                });
            }
            let existing = self.size()?;
            if existing < size {
                return Err(Error::io(
                    self.path.display().to_string(),
                    std::io::Error::other(format!(
                        "restore target is too small: {} bytes, need {}",
                        existing, size
                    )),
                ));
            }
            return Ok(());
        }
        // Creating a fresh file and seeking to the end leaves it sparse on
        // every mainstream filesystem.
        let mut file = File::create(&self.path).map_err(|e| self.io_error(e))?;
        if size > 0 {
            file.seek(SeekFrom::Start(size - 1))
                .map_err(|e| self.io_error(e))?;
            file.write_all(&[0]).map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    fn read_block(&self, idx: u64, length: usize) -> Result<Vec<u8>> {
        let offset = idx * u64::from(self.block_size);
        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(e))?;
        let mut data = vec![0u8; length];
        file.read_exact(&mut data).map_err(|e| self.io_error(e))?;
        self.drop_cache(&file, offset, length);
        debug!(idx, length, "read source block");
        Ok(data)
    }

    fn write_block(&self, idx: u64, data: &[u8]) -> Result<()> {
        let offset = idx * u64::from(self.block_size);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_error(e))?;
        file.write_all(data).map_err(|e| self.io_error(e))?;
        self.drop_cache(&file, offset, data.len());
        Ok(())
    }

    fn discard(&self, _offset: u64, _length: u64) -> Result<()> {
        // Plain files need no explicit discard: unwritten regions of a
        // fresh target are holes already.
        Ok(())
    }

    fn simultaneous_reads(&self) -> usize {
        self.simultaneous_reads
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn image(dir: &TempDir, name: &str, content: &[u8]) -> FileIo {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        FileIo::new(&path.to_string_lossy(), 4, None).unwrap()
    }

    #[test]
    fn size_and_block_reads() {
        let dir = TempDir::new().unwrap();
        let io = image(&dir, "img", b"0123456789ab");
        assert_eq!(io.size().unwrap(), 12);
        assert_eq!(io.read_block(0, 4).unwrap(), b"0123");
        assert_eq!(io.read_block(2, 4).unwrap(), b"89ab");
        // Reading past the end fails.
        assert!(io.read_block(3, 4).is_err());
    }

    #[test]
    fn write_target_creation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out");
        let io = FileIo::new(&path.to_string_lossy(), 4, None).unwrap();
        io.open_write(12, false, false).unwrap();
        assert_eq!(io.size().unwrap(), 12);
        io.write_block(1, b"XXXX").unwrap();
        assert_eq!(io.read_block(1, 4).unwrap(), b"XXXX");
    }

    #[test]
    fn existing_target_requires_force() {
        let dir = TempDir::new().unwrap();
        let io = image(&dir, "img", b"0123456789ab");
        assert!(io.open_write(12, false, false).is_err());
        io.open_write(12, true, false).unwrap();
        // Even forced, a too-small target is refused.
        assert!(io.open_write(16, true, false).is_err());
    }
}
