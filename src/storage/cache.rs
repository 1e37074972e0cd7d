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

//! Sharded on-disk read cache.
//!
//! Entries are spread over a fixed number of shard directories by a hash of
//! the object key. Each shard is bounded at `maximum_size / shards` bytes;
//! inserts evict least-recently-used entries (by file modification time)
//! until the new entry fits. The cache is an optimization only: every error
//! degrades to a miss.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::Result;

pub struct DiskCache {
    directory: PathBuf,
    shards: u32,
    shard_limit: u64,
    // One lock per shard so concurrent readers of different shards do not
    // serialize on eviction.
    locks: Vec<Mutex<()>>,
}

fn key_file_name(key: &str) -> String {
    hex::encode(key.as_bytes())
}

fn shard_of(key: &str, shards: u32) -> u32 {
    // FNV-1a, enough to spread keys over shard directories.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % u64::from(shards)) as u32
}

impl DiskCache {
    pub fn open(config: &CacheConfig) -> Result<DiskCache> {
        let shards = config.shards.max(1);
        for shard in 0..shards {
            let dir = config.directory.join(format!("{:02x}", shard));
            fs::create_dir_all(&dir)
                .map_err(|source| crate::errors::Error::io(dir.display().to_string(), source))?;
        }
        Ok(DiskCache {
            directory: config.directory.clone(),
            shards,
            shard_limit: (config.maximum_size / u64::from(shards)).max(1),
            locks: (0..shards).map(|_| Mutex::new(())).collect(),
        })
    }

    fn entry_path(&self, key: &str) -> (usize, PathBuf) {
        let shard = shard_of(key, self.shards) as usize;
        let path = self
            .directory
            .join(format!("{:02x}", shard))
            .join(key_file_name(key));
        (shard, path)
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let (shard, path) = self.entry_path(key);
        let _guard = self.locks[shard].lock().unwrap();
        match fs::read(&path) {
            Ok(data) => {
                // Refresh the modification time so eviction treats the entry
                // as recently used.
                let _ = fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .and_then(|f| f.set_modified(std::time::SystemTime::now()));
                Some(data)
            }
            Err(_) => None,
        }
    }

    pub fn set(&self, key: &str, data: &[u8]) {
        if data.len() as u64 > self.shard_limit {
            return;
        }
        let (shard, path) = self.entry_path(key);
        let _guard = self.locks[shard].lock().unwrap();
        let shard_dir = path.parent().expect("entry path has a parent");
        if let Err(err) = self.evict(shard_dir, data.len() as u64) {
            warn!(?err, "read cache eviction failed, skipping insert");
            return;
        }
        if let Err(err) = fs::write(&path, data) {
            warn!(?err, key, "read cache insert failed");
        }
    }

    /// Delete least-recently-used entries until `incoming` more bytes fit.
    fn evict(&self, shard_dir: &Path, incoming: u64) -> std::io::Result<()> {
        let mut entries: Vec<(std::time::SystemTime, PathBuf, u64)> = Vec::new();
        let mut used: u64 = 0;
        for entry in fs::read_dir(shard_dir)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            used += metadata.len();
            entries.push((
                metadata.modified().unwrap_or(std::time::UNIX_EPOCH),
                entry.path(),
                metadata.len(),
            ));
        }
        if used + incoming <= self.shard_limit {
            return Ok(());
        }
        entries.sort_by_key(|(mtime, _, _)| *mtime);
        for (_, path, len) in entries {
            fs::remove_file(&path)?;
            debug!(path = %path.display(), "evicted read cache entry");
            used -= len;
            if used + incoming <= self.shard_limit {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn cache(maximum_size: u64) -> (TempDir, DiskCache) {
        let dir = TempDir::new().unwrap();
        let config = CacheConfig {
            directory: dir.path().to_owned(),
            maximum_size,
            shards: 2,
        };
        let cache = DiskCache::open(&config).unwrap();
        (dir, cache)
    }

    #[test]
    fn get_set_round_trip() {
        let (_dir, cache) = cache(1 << 20);
        assert!(cache.get("blocks/a").is_none());
        cache.set("blocks/a", b"data");
        assert_eq!(cache.get("blocks/a").unwrap(), b"data");
    }

    #[test]
    fn eviction_bounds_shard_size() {
        let (_dir, cache) = cache(64);
        // Shard limit is 32 bytes: the second insert into the same shard
        // must evict the first.
        let value = vec![0u8; 20];
        cache.set("a", &value);
        cache.set("b", &value);
        cache.set("c", &value);
        let present = ["a", "b", "c"]
            .iter()
            .filter(|k| cache.get(k).is_some())
            .count();
        assert!(present < 3);
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        let (_dir, cache) = cache(16);
        cache.set("big", &vec![0u8; 1024]);
        assert!(cache.get("big").is_none());
    }
}
