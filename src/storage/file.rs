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

//! File-backed object storage.
//!
//! Objects are plain files below a configured root directory; keys map
//! directly to relative paths. Writes go to a temporary file first and are
//! renamed into place so readers never observe partial objects.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::Deserialize;

use crate::config::{module_configuration, ModuleSpec};
use crate::errors::Error;
use crate::storage::StorageBackend;
use crate::Result;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileBackendConfig {
    path: PathBuf,
}

pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(spec: &ModuleSpec) -> Result<FileBackend> {
        let config: FileBackendConfig = module_configuration(spec)?;
        if config.path.as_os_str().is_empty() {
            return Err(Error::config(format!(
                "storage {:?} requires a path",
                spec.name
            )));
        }
        fs::create_dir_all(&config.path)
            .map_err(|source| Error::io(config.path.display().to_string(), source))?;
        Ok(FileBackend { root: config.path })
    }

    pub fn with_root(root: &Path) -> Result<FileBackend> {
        fs::create_dir_all(root).map_err(|source| Error::io(root.display().to_string(), source))?;
        Ok(FileBackend {
            root: root.to_owned(),
        })
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn not_found(&self, key: &str) -> Error {
        Error::Storage {
            key: key.to_owned(),
            reason: "object not found".to_owned(),
        }
    }
}

impl StorageBackend for FileBackend {
    fn write_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.full_path(key);
        let dir = path.parent().expect("object path has a parent");
        fs::create_dir_all(dir).map_err(|source| Error::io(dir.display().to_string(), source))?;
        let tmp = dir.join(format!(
            "{}{}",
            crate::TMP_PREFIX,
            path.file_name()
                .expect("object path has a file name")
                .to_string_lossy()
        ));
        fs::write(&tmp, data).map_err(|source| Error::io(tmp.display().to_string(), source))?;
        fs::rename(&tmp, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp);
            Error::io(path.display().to_string(), source)
        })
    }

    fn read_object(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key);
        fs::read(&path).map(Bytes::from).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                self.not_found(key)
            } else {
                Error::io(path.display().to_string(), source)
            }
        })
    }

    fn object_size(&self, key: &str) -> Result<u64> {
        let path = self.full_path(key);
        match fs::metadata(&path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Err(self.not_found(key)),
            Err(source) => Err(Error::io(path.display().to_string(), source)),
        }
    }

    fn remove_object(&self, key: &str) -> Result<()> {
        let path = self.full_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == io::ErrorKind::NotFound => Err(self.not_found(key)),
            Err(source) => Err(Error::io(path.display().to_string(), source)),
        }
    }

    fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.full_path(prefix);
        let mut keys = Vec::new();
        if !base.exists() {
            return Ok(keys);
        }
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let entries = fs::read_dir(&dir)
                .map_err(|source| Error::io(dir.display().to_string(), source))?;
            for entry in entries {
                let entry =
                    entry.map_err(|source| Error::io(dir.display().to_string(), source))?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    let key = relative.to_string_lossy().into_owned();
                    if !key.starts_with(crate::TMP_PREFIX)
                        && !relative
                            .file_name()
                            .map_or(false, |n| n.to_string_lossy().starts_with(crate::TMP_PREFIX))
                    {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn backend() -> (TempDir, FileBackend) {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::with_root(dir.path()).unwrap();
        (dir, backend)
    }

    #[test]
    fn write_read_remove() {
        let (_dir, backend) = backend();
        backend.write_object("blocks/x", b"data").unwrap();
        assert_eq!(backend.read_object("blocks/x").unwrap().as_ref(), b"data");
        assert_eq!(backend.object_size("blocks/x").unwrap(), 4);
        backend.remove_object("blocks/x").unwrap();
        assert!(backend.read_object("blocks/x").is_err());
        assert!(backend.remove_object("blocks/x").is_err());
    }

    #[test]
    fn list_by_prefix() {
        let (_dir, backend) = backend();
        backend.write_object("blocks/a", b"1").unwrap();
        backend.write_object("blocks/b", b"2").unwrap();
        backend.write_object("versions/V0000000001", b"3").unwrap();
        let mut keys = backend.list_objects("blocks/").unwrap();
        keys.sort();
        assert_eq!(keys, vec!["blocks/a", "blocks/b"]);
        assert_eq!(backend.list_objects("missing/").unwrap().len(), 0);
    }

    #[test]
    fn overwrite_is_atomic_replacement() {
        let (_dir, backend) = backend();
        backend.write_object("blocks/x", b"one").unwrap();
        backend.write_object("blocks/x", b"two").unwrap();
        assert_eq!(backend.read_object("blocks/x").unwrap().as_ref(), b"two");
    }
}
