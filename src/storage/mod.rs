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

//! Object storages.
//!
//! Every stored block is a pair of coupled objects: the data object and a
//! JSON metadata sidecar at the same key with a `.meta` suffix. The sidecar
//! records schema version, timestamps, pre- and post-transform sizes, the
//! block checksum, and the ordered list of transforms actually applied, and
//! is optionally signed with HMAC-SHA-256. Version-metadata backups use the
//! same envelope under the `versions/` prefix.

pub mod cache;
pub mod file;
pub mod hmac;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, ModuleSpec};
use crate::errors::Error;
use crate::ratelimit::TokenBucket;
use crate::transform::{self, Transform, TransformRecord, TransformRegistry};
use crate::version::{BlockUid, VersionUid};
use crate::Result;

pub const METADATA_VERSION: &str = "2.0.0";
const META_SUFFIX: &str = ".meta";
const BLOCK_PREFIX: &str = "blocks/";
const VERSION_PREFIX: &str = "versions/";

const READ_ATTEMPTS: u32 = 3;
const WRITE_ATTEMPTS: u32 = 3;

/// Retry transient backend failures with exponential backoff. Missing
/// objects and integrity failures are permanent and surface immediately.
fn with_retries<T>(attempts: u32, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = std::time::Duration::from_millis(100);
    let mut last = None;
    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err @ Error::Io { .. }) => {
                warn!(%err, what, attempt, "transient storage error");
                last = Some(err);
                if attempt < attempts {
                    std::thread::sleep(delay);
                    delay *= 2;
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| Error::internal("retry budget exhausted")))
}

/// Low-level object operations a backend must provide. Only `file` is built
/// in; `s3` and `b2` plug in behind the same capability set.
pub trait StorageBackend: Send + Sync {
    fn write_object(&self, key: &str, data: &[u8]) -> Result<()>;
    fn read_object(&self, key: &str) -> Result<Bytes>;
    fn object_size(&self, key: &str) -> Result<u64>;
    fn remove_object(&self, key: &str) -> Result<()>;
    fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Metadata sidecar document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub metadata_version: String,
    pub created: String,
    pub modified: String,
    /// Pre-transform size of the payload.
    pub size: u64,
    /// Post-transform size, i.e. the size of the data object.
    pub object_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transforms: Option<Vec<TransformRecord>>,
}

// Module-specific keys (e.g. the file backend's `path`) live in the same
// configuration block, so unknown fields must be tolerated here.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageCommonConfig {
    #[serde(default = "default_workers")]
    simultaneous_reads: usize,
    #[serde(default = "default_workers")]
    simultaneous_writes: usize,
    #[serde(default = "default_workers")]
    simultaneous_removals: usize,
    #[serde(default)]
    bandwidth_read: u64,
    #[serde(default)]
    bandwidth_write: u64,
    #[serde(default)]
    consistency_check_writes: bool,
    #[serde(default)]
    active_transforms: Vec<String>,
    #[serde(default)]
    hmac: Option<HmacSection>,
    #[serde(default)]
    read_cache: Option<CacheConfig>,
}

fn default_workers() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct HmacSection {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    kdf_salt: Option<String>,
    #[serde(default)]
    kdf_iterations: Option<u32>,
}

/// A configured storage: a backend plus transforms, integrity protection,
/// rate limits, and worker counts.
pub struct Storage {
    name: String,
    id: u32,
    backend: Box<dyn StorageBackend>,
    active_transforms: Vec<Arc<dyn Transform>>,
    registry: Arc<TransformRegistry>,
    sidecar_hmac: Option<hmac::SidecarHmac>,
    read_cache: Option<cache::DiskCache>,
    read_cache_enabled: AtomicBool,
    read_throttle: TokenBucket,
    write_throttle: TokenBucket,
    consistency_check_writes: bool,
    pub simultaneous_reads: usize,
    pub simultaneous_writes: usize,
    pub simultaneous_removals: usize,
}

impl Storage {
    pub fn from_spec(
        spec: &ModuleSpec,
        id: u32,
        registry: Arc<TransformRegistry>,
    ) -> Result<Storage> {
        let configuration = if spec.configuration.is_null() {
            serde_yaml::Value::Mapping(Default::default())
        } else {
            spec.configuration.clone()
        };
        let common: StorageCommonConfig =
            serde_yaml::from_value(configuration).map_err(|err| {
                Error::config(format!(
                    "invalid configuration for storage {:?}: {}",
                    spec.name, err
                ))
            })?;

        let backend: Box<dyn StorageBackend> = match spec.module.as_str() {
            "file" => Box::new(file::FileBackend::new(spec)?),
            "s3" | "b2" => {
                return Err(Error::config(format!(
                    "storage module {:?} is not built into this binary",
                    spec.module
                )));
            }
            other => {
                return Err(Error::config(format!(
                    "unknown storage module {:?}",
                    other
                )));
            }
        };

        let active_transforms = registry.resolve(&common.active_transforms)?;
        if !active_transforms.is_empty() {
            info!(
                storage = %spec.name,
                transforms = %common.active_transforms.join(", "),
                "active transforms"
            );
        }

        let sidecar_hmac = match &common.hmac {
            None => None,
            Some(section) => {
                let key = crate::transform::aes_256_gcm::key_from_config(
                    &format!("storage {} hmac", spec.name),
                    section.key.as_deref(),
                    section.password.as_deref(),
                    section.kdf_salt.as_deref(),
                    section.kdf_iterations,
                    32,
                )?;
                info!(storage = %spec.name, "sidecar HMAC protection enabled");
                Some(hmac::SidecarHmac::new(key))
            }
        };

        let read_cache = match &common.read_cache {
            Some(config) => match cache::DiskCache::open(config) {
                Ok(cache) => Some(cache),
                Err(err) => {
                    warn!(?err, "unable to open read cache, continuing without it");
                    None
                }
            },
            None => None,
        };

        Ok(Storage {
            name: spec.name.clone(),
            id,
            backend,
            active_transforms,
            registry,
            sidecar_hmac,
            read_cache,
            read_cache_enabled: AtomicBool::new(true),
            read_throttle: TokenBucket::new(common.bandwidth_read),
            write_throttle: TokenBucket::new(common.bandwidth_write),
            consistency_check_writes: common.consistency_check_writes,
            simultaneous_reads: common.simultaneous_reads,
            simultaneous_writes: common.simultaneous_writes,
            simultaneous_removals: common.simultaneous_removals,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Temporarily disable the read cache (deep-scrub must observe the
    /// backend, not the cache). Returns the previous setting.
    pub fn set_read_cache_enabled(&self, enabled: bool) -> bool {
        self.read_cache_enabled.swap(enabled, Ordering::SeqCst)
    }

    fn timestamp() -> String {
        let format = time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        );
        OffsetDateTime::now_utc()
            .format(format)
            .expect("format UTC timestamp")
    }

    fn encode_sidecar(&self, metadata: &ObjectMetadata) -> Result<Vec<u8>> {
        let mut document = serde_json::to_value(metadata)?;
        if let Some(hmac) = &self.sidecar_hmac {
            hmac.sign(&mut document)?;
        }
        Ok(serde_json::to_vec(&document)?)
    }

    fn decode_sidecar(&self, raw: &[u8], subject: &str) -> Result<ObjectMetadata> {
        let mut document: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|err| Error::integrity(subject, format!("sidecar is not JSON: {}", err)))?;
        if let Some(hmac) = &self.sidecar_hmac {
            hmac.verify(&mut document, subject)?;
        }
        let metadata: ObjectMetadata = serde_json::from_value(document)
            .map_err(|err| Error::integrity(subject, format!("malformed sidecar: {}", err)))?;
        if metadata.metadata_version != METADATA_VERSION {
            return Err(Error::integrity(
                subject,
                format!(
                    "unsupported object metadata version {:?}",
                    metadata.metadata_version
                ),
            ));
        }
        Ok(metadata)
    }

    /// Write one payload as a data object plus sidecar, applying the active
    /// transform chain. Returns the sidecar.
    fn write_payload(
        &self,
        key: &str,
        payload: Vec<u8>,
        checksum: Option<&str>,
    ) -> Result<ObjectMetadata> {
        let size = payload.len() as u64;
        let (data, records) = transform::encapsulate(&self.active_transforms, payload)?;
        let timestamp = Self::timestamp();
        let metadata = ObjectMetadata {
            metadata_version: METADATA_VERSION.to_owned(),
            created: timestamp.clone(),
            modified: timestamp,
            size,
            object_size: data.len() as u64,
            checksum: checksum.map(str::to_owned),
            transforms: if records.is_empty() {
                None
            } else {
                Some(records)
            },
        };
        let sidecar = self.encode_sidecar(&metadata)?;
        self.write_throttle
            .throttle(data.len() as u64 + sidecar.len() as u64);

        let meta_key = format!("{}{}", key, META_SUFFIX);
        let write_pair = || {
            self.backend
                .write_object(key, &data)
                .and_then(|()| self.backend.write_object(&meta_key, &sidecar))
        };
        if let Err(err) = with_retries(WRITE_ATTEMPTS, key, write_pair) {
            // Do not leave a dangling half of the pair behind.
            let _ = self.backend.remove_object(key);
            let _ = self.backend.remove_object(&meta_key);
            return Err(err);
        }

        if self.consistency_check_writes {
            let written = self.backend.read_object(key)?;
            if written != data {
                return Err(Error::integrity(key, "read-after-write data mismatch"));
            }
            let raw_sidecar = self.backend.read_object(&meta_key)?;
            self.decode_sidecar(&raw_sidecar, key)?;
        }
        Ok(metadata)
    }

    /// A missing half of an object pair is corruption from the reader's
    /// point of view, not a backend failure.
    fn missing_as_integrity(err: Error) -> Error {
        match err {
            Error::Storage { key, reason } => Error::StorageIntegrity {
                subject: key,
                reason,
            },
            other => other,
        }
    }

    /// Read a payload back: sidecar first (HMAC verified, size checked
    /// against the data object), then the data object with the recorded
    /// transform chain inverted.
    fn read_payload(&self, key: &str, use_cache: bool) -> Result<(Bytes, ObjectMetadata)> {
        let meta_key = format!("{}{}", key, META_SUFFIX);
        let cache_enabled =
            use_cache && self.read_cache.is_some() && self.read_cache_enabled.load(Ordering::SeqCst);
        if cache_enabled {
            let cache = self.read_cache.as_ref().expect("checked above");
            if let (Some(data), Some(raw_sidecar)) = (cache.get(key), cache.get(&meta_key)) {
                let metadata = self.decode_sidecar(&raw_sidecar, key)?;
                debug!(key, "read cache hit");
                return Ok((Bytes::from(data), metadata));
            }
        }

        let data = with_retries(READ_ATTEMPTS, key, || self.backend.read_object(key))
            .map_err(Self::missing_as_integrity)?;
        let raw_sidecar =
            with_retries(READ_ATTEMPTS, &meta_key, || self.backend.read_object(&meta_key))
                .map_err(Self::missing_as_integrity)?;
        self.read_throttle
            .throttle(data.len() as u64 + raw_sidecar.len() as u64);
        let metadata = self.decode_sidecar(&raw_sidecar, key)?;
        if metadata.object_size != data.len() as u64 {
            return Err(Error::integrity(
                key,
                format!(
                    "data object is {} bytes but the sidecar records {}",
                    data.len(),
                    metadata.object_size
                ),
            ));
        }
        let payload = match &metadata.transforms {
            Some(records) => {
                Bytes::from(transform::decapsulate(&self.registry, records, data.to_vec())?)
            }
            None => data,
        };
        if payload.len() as u64 != metadata.size {
            return Err(Error::integrity(
                key,
                format!(
                    "payload is {} bytes after inverse transforms, sidecar records {}",
                    payload.len(),
                    metadata.size
                ),
            ));
        }
        // Cache the decoded payload: NBD and restore reads skip the inverse
        // transforms on a hit. The sidecar is cached alongside.
        if let Some(cache) = &self.read_cache {
            cache.set(key, &payload);
            cache.set(&meta_key, &raw_sidecar);
        }
        Ok((payload, metadata))
    }

    // --- Blocks -----------------------------------------------------------

    pub fn write_block(&self, uid: BlockUid, checksum: &str, data: Vec<u8>) -> Result<u64> {
        let metadata = self.write_payload(&uid.storage_key(), data, Some(checksum))?;
        Ok(metadata.object_size)
    }

    /// Read a block payload plus its verified sidecar.
    pub fn read_block(&self, uid: BlockUid, use_cache: bool) -> Result<(Bytes, ObjectMetadata)> {
        self.read_payload(&uid.storage_key(), use_cache)
    }

    /// Fetch only the sidecar and the data object's size, for light scrubs.
    pub fn read_block_metadata(&self, uid: BlockUid) -> Result<(u64, ObjectMetadata)> {
        let key = uid.storage_key();
        let meta_key = format!("{}{}", key, META_SUFFIX);
        let data_length = with_retries(READ_ATTEMPTS, &key, || self.backend.object_size(&key))
            .map_err(Self::missing_as_integrity)?;
        let raw_sidecar =
            with_retries(READ_ATTEMPTS, &meta_key, || self.backend.read_object(&meta_key))
                .map_err(Self::missing_as_integrity)?;
        self.read_throttle.throttle(raw_sidecar.len() as u64);
        let metadata = self.decode_sidecar(&raw_sidecar, &key)?;
        if metadata.object_size != data_length {
            return Err(Error::integrity(
                &key,
                format!(
                    "data object is {} bytes but the sidecar records {}",
                    data_length, metadata.object_size
                ),
            ));
        }
        Ok((data_length, metadata))
    }

    /// Consistency checks shared by scrub and restore: recorded sizes and
    /// checksum must match the block row.
    pub fn check_block_metadata(
        &self,
        uid: BlockUid,
        metadata: &ObjectMetadata,
        expected_size: u32,
        expected_checksum: Option<&str>,
    ) -> Result<()> {
        let key = uid.storage_key();
        if metadata.size != u64::from(expected_size) {
            return Err(Error::integrity(
                &key,
                format!(
                    "recorded size {} does not match block size {}",
                    metadata.size, expected_size
                ),
            ));
        }
        match (&metadata.checksum, expected_checksum) {
            (Some(recorded), Some(expected)) if recorded == expected => Ok(()),
            (recorded, expected) => Err(Error::integrity(
                &key,
                format!(
                    "recorded checksum {:?} does not match block checksum {:?}",
                    recorded.as_deref().map(|c| &c[..16.min(c.len())]),
                    expected.map(|c| &c[..16.min(c.len())]),
                ),
            )),
        }
    }

    pub fn remove_block(&self, uid: BlockUid) -> Result<()> {
        let key = uid.storage_key();
        let meta_key = format!("{}{}", key, META_SUFFIX);
        let result = self.backend.remove_object(&key);
        // Remove the sidecar even when the data object was already gone.
        let _ = self.backend.remove_object(&meta_key);
        result
    }

    /// All block uids present on the storage, stray objects skipped.
    pub fn list_block_uids(&self) -> Result<Vec<BlockUid>> {
        Ok(self
            .backend
            .list_objects(BLOCK_PREFIX)?
            .into_iter()
            .filter(|key| !key.ends_with(META_SUFFIX))
            .filter_map(|key| BlockUid::from_storage_key(&key))
            .collect())
    }

    // --- Version metadata backups ----------------------------------------

    pub fn write_version_metadata(
        &self,
        uid: VersionUid,
        document: &str,
        overwrite: bool,
    ) -> Result<()> {
        let key = uid.storage_key();
        if !overwrite && self.backend.read_object(&key).is_ok() {
            return Err(Error::Storage {
                key,
                reason: "version metadata already exists on the storage".to_owned(),
            });
        }
        self.write_payload(&key, document.as_bytes().to_vec(), None)?;
        Ok(())
    }

    pub fn read_version_metadata(&self, uid: VersionUid) -> Result<String> {
        let (payload, _) = self.read_payload(&uid.storage_key(), false)?;
        String::from_utf8(payload.to_vec()).map_err(|_| {
            Error::integrity(uid.storage_key(), "version metadata is not valid UTF-8")
        })
    }

    pub fn remove_version_metadata(&self, uid: VersionUid) -> Result<()> {
        let key = uid.storage_key();
        let meta_key = format!("{}{}", key, META_SUFFIX);
        let result = self.backend.remove_object(&key);
        let _ = self.backend.remove_object(&meta_key);
        result
    }

    pub fn list_version_uids(&self) -> Result<Vec<VersionUid>> {
        Ok(self
            .backend
            .list_objects(VERSION_PREFIX)?
            .into_iter()
            .filter(|key| !key.ends_with(META_SUFFIX))
            .filter_map(|key| VersionUid::from_storage_key(&key))
            .collect())
    }

    // --- Statistics -------------------------------------------------------

    /// Object count and total bytes, data objects and sidecars included.
    pub fn stats(&self) -> Result<(u64, u64)> {
        let mut count = 0u64;
        let mut bytes = 0u64;
        for prefix in [BLOCK_PREFIX, VERSION_PREFIX] {
            for key in self.backend.list_objects(prefix)? {
                count += 1;
                bytes += self.backend.object_size(&key)?;
            }
        }
        Ok((count, bytes))
    }

    /// Number of block data objects, used by the dedup tests.
    pub fn block_object_count(&self) -> Result<u64> {
        Ok(self.list_block_uids()?.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn storage_with_transforms(active: &[&str]) -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(
            TransformRegistry::from_config(&[
                ModuleSpec {
                    name: "zstd".to_owned(),
                    module: "zstd".to_owned(),
                    configuration: serde_yaml::from_str("level: 1").unwrap(),
                },
                ModuleSpec {
                    name: "encrypt".to_owned(),
                    module: "aes_256_gcm".to_owned(),
                    configuration: serde_yaml::from_str(
                        "password: secret\nkdfSalt: AAAAAAAAAAAAAAAA\nkdfIterations: 100",
                    )
                    .unwrap(),
                },
            ])
            .unwrap(),
        );
        let active_yaml = if active.is_empty() {
            String::new()
        } else {
            format!(
                "activeTransforms:\n{}",
                active
                    .iter()
                    .map(|t| format!("  - {}\n", t))
                    .collect::<String>()
            )
        };
        let spec = ModuleSpec {
            name: "local".to_owned(),
            module: "file".to_owned(),
            configuration: serde_yaml::from_str(&format!(
                "path: {}\n{}",
                dir.path().display(),
                active_yaml
            ))
            .unwrap(),
        };
        let storage = Storage::from_spec(&spec, 1, registry).unwrap();
        (dir, storage)
    }

    #[test]
    fn block_round_trip_plain() {
        let (_dir, storage) = storage_with_transforms(&[]);
        let uid = BlockUid::new(1, 1);
        let data = vec![0x41u8; 4096];
        storage.write_block(uid, &"ab".repeat(32), data.clone()).unwrap();
        let (read, metadata) = storage.read_block(uid, false).unwrap();
        assert_eq!(read, data);
        assert_eq!(metadata.size, 4096);
        assert_eq!(metadata.checksum.as_deref(), Some("ab".repeat(32).as_str()));
        assert!(metadata.transforms.is_none());
    }

    #[test]
    fn block_round_trip_with_transform_chain() {
        let (_dir, storage) = storage_with_transforms(&["zstd", "encrypt"]);
        let uid = BlockUid::new(1, 1);
        let data = vec![0x42u8; 65536];
        storage.write_block(uid, &"cd".repeat(32), data.clone()).unwrap();
        let (read, metadata) = storage.read_block(uid, false).unwrap();
        assert_eq!(read, data);
        let transforms = metadata.transforms.unwrap();
        assert_eq!(transforms.len(), 2);
        assert_eq!(transforms[0].name, "zstd");
        assert_eq!(transforms[1].name, "encrypt");
    }

    #[test]
    fn sidecar_size_mismatch_detected() {
        let (dir, storage) = storage_with_transforms(&[]);
        let uid = BlockUid::new(1, 1);
        storage
            .write_block(uid, &"ab".repeat(32), vec![1u8; 128])
            .unwrap();
        // Truncate the data object behind the storage's back.
        let path = dir.path().join(uid.storage_key());
        std::fs::write(&path, b"short").unwrap();
        let err = storage.read_block(uid, false).unwrap_err();
        assert!(err.is_integrity());
        assert!(storage.read_block_metadata(uid).is_err());
    }

    #[test]
    fn version_metadata_overwrite_control() {
        let (_dir, storage) = storage_with_transforms(&[]);
        let uid = VersionUid(1);
        storage
            .write_version_metadata(uid, "{\"x\":1}", false)
            .unwrap();
        assert!(storage
            .write_version_metadata(uid, "{\"x\":2}", false)
            .is_err());
        storage
            .write_version_metadata(uid, "{\"x\":2}", true)
            .unwrap();
        assert_eq!(storage.read_version_metadata(uid).unwrap(), "{\"x\":2}");
        assert_eq!(storage.list_version_uids().unwrap(), vec![uid]);
        storage.remove_version_metadata(uid).unwrap();
        assert!(storage.read_version_metadata(uid).is_err());
    }

    #[test]
    fn check_block_metadata_mismatches() {
        let (_dir, storage) = storage_with_transforms(&[]);
        let uid = BlockUid::new(1, 1);
        let checksum = "ab".repeat(32);
        storage.write_block(uid, &checksum, vec![0u8; 4096]).unwrap();
        let (_, metadata) = storage.read_block(uid, false).unwrap();
        storage
            .check_block_metadata(uid, &metadata, 4096, Some(&checksum))
            .unwrap();
        assert!(storage
            .check_block_metadata(uid, &metadata, 8192, Some(&checksum))
            .is_err());
        assert!(storage
            .check_block_metadata(uid, &metadata, 4096, Some(&"ff".repeat(32)))
            .is_err());
    }
}
