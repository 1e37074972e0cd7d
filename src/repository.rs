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

//! The repository ties the configured pieces together: database, storages,
//! transforms, and the block hash. Command implementations live in their
//! own modules and operate on a `Repository`.

use std::collections::HashMap;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::cleanup;
use crate::config::Config;
use crate::database::{Database, LockDescriptor, LockMode};
use crate::errors::Error;
use crate::export;
use crate::filter::FilterExpression;
use crate::hash::BlockHasher;
use crate::retention::RetentionPolicy;
use crate::storage::Storage;
use crate::transform::TransformRegistry;
use crate::version::{Version, VersionUid};
use crate::Result;

pub struct Repository {
    config: Config,
    db: Arc<Database>,
    hasher: BlockHasher,
    storages: HashMap<String, Arc<Storage>>,
}

impl Repository {
    /// Open the repository described by a configuration: connect to the
    /// database and register every configured storage.
    pub fn open(config: Config) -> Result<Repository> {
        let db = Arc::new(Database::open(&config.database_engine)?);
        Repository::with_database(config, db)
    }

    /// Open against an explicit database. The database-less restore path
    /// uses this with an in-memory store.
    pub fn with_database(config: Config, db: Arc<Database>) -> Result<Repository> {
        let hasher = BlockHasher::parse(&config.hash_function)?;
        let transforms = Arc::new(TransformRegistry::from_config(&config.transforms)?);
        let mut storages = HashMap::new();
        for spec in &config.storages {
            let record = db.sync_storage(&spec.name)?;
            let storage = Storage::from_spec(spec, record.id, transforms.clone())?;
            storages.insert(spec.name.clone(), Arc::new(storage));
        }
        Ok(Repository {
            config,
            db,
            hasher,
            storages,
        })
    }

    pub fn init_database(config: &Config) -> Result<()> {
        let db = Database::open(&config.database_engine)?;
        db.init()
    }

    pub fn migrate_database(config: &Config) -> Result<()> {
        let db = Database::open(&config.database_engine)?;
        db.migrate()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn hasher(&self) -> &BlockHasher {
        &self.hasher
    }

    pub fn storage(&self, name: Option<&str>) -> Result<Arc<Storage>> {
        let name = name.unwrap_or(&self.config.default_storage);
        self.storages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "storage",
                name: name.to_owned(),
            })
    }

    pub fn storage_by_id(&self, id: u32) -> Result<Arc<Storage>> {
        self.storages
            .values()
            .find(|s| s.id() == id)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "storage",
                name: format!("id {}", id),
            })
    }

    pub fn storage_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.storages.keys().cloned().collect();
        names.sort();
        names
    }

    // --- Version queries --------------------------------------------------

    pub fn version_by_uid(&self, uid: VersionUid) -> Result<Version> {
        self.db.version_by_uid(uid)
    }

    pub fn versions_with_filter(&self, filter_expression: Option<&str>) -> Result<Vec<Version>> {
        let filter = filter_expression
            .map(FilterExpression::parse)
            .transpose()?;
        self.db.versions_with_filter(filter.as_ref())
    }

    // --- Simple state commands -------------------------------------------

    pub fn protect(&self, uid: VersionUid, protected: bool) -> Result<()> {
        // Existence check first so the caller gets NotFound, not a no-op.
        self.db.version_by_uid(uid)?;
        self.db.set_version_protected(uid, protected)
    }

    /// Apply label changes: `name=value` sets, a trailing `-` removes.
    pub fn label(&self, uid: VersionUid, changes: &[String]) -> Result<()> {
        self.db.version_by_uid(uid)?;
        for change in changes {
            if let Some(name) = change.strip_suffix('-') {
                if name.is_empty() || change.contains('=') {
                    return Err(Error::InvalidInput {
                        reason: format!("invalid label removal {:?}", change),
                    });
                }
                self.db.rm_label(uid, name)?;
                continue;
            }
            let (name, value) = change.split_once('=').ok_or_else(|| Error::InvalidInput {
                reason: format!("invalid label {:?}, expected name=value or name-", change),
            })?;
            if !crate::version::is_valid_name(name)
                || !crate::version::is_valid_optional_name(value)
            {
                return Err(Error::InvalidInput {
                    reason: format!("invalid label {:?}", change),
                });
            }
            self.db.add_label(uid, name, value)?;
        }
        Ok(())
    }

    // --- Metadata surfaces ------------------------------------------------

    /// Serialize versions to a metadata document (schema 2.0.0).
    pub fn metadata_export(
        &self,
        uids: &[VersionUid],
        writer: &mut dyn std::io::Write,
    ) -> Result<()> {
        let mut locked = Vec::new();
        let result = (|| {
            for &uid in uids {
                let descriptor = LockDescriptor::version(uid);
                self.db
                    .lock(&descriptor, LockMode::Exclusive, "Exporting version metadata", false)?;
                locked.push(descriptor);
            }
            export::export(&self.db, uids, writer)
        })();
        for descriptor in locked {
            let _ = self.db.unlock(&descriptor);
        }
        result
    }

    pub fn metadata_import(&self, raw: &str) -> Result<Vec<VersionUid>> {
        let uids = export::import(&self.db, raw)?;
        info!(
            versions = %uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(", "),
            "imported version metadata"
        );
        Ok(uids)
    }

    /// Write each version's metadata document to its storage, enabling
    /// database-less restore.
    pub fn metadata_backup(&self, uids: &[VersionUid], overwrite: bool) -> Result<()> {
        for &uid in uids {
            let version = self.db.version_by_uid(uid)?;
            let storage = self.storage_by_id(version.storage_id)?;
            let mut document = Vec::new();
            export::export(&self.db, &[uid], &mut document)?;
            let document = String::from_utf8(document)
                .map_err(|_| Error::internal("metadata export produced invalid UTF-8"))?;
            storage.write_version_metadata(uid, &document, overwrite)?;
            info!(version = %uid, "backed up version metadata to storage");
        }
        Ok(())
    }

    /// Import version metadata back from a storage.
    pub fn metadata_restore(&self, uids: &[VersionUid], storage_name: Option<&str>) -> Result<()> {
        let storage = self.storage(storage_name)?;
        for &uid in uids {
            let document = storage.read_version_metadata(uid)?;
            self.metadata_import(&document)?;
        }
        Ok(())
    }

    /// List version metadata backups present on a storage.
    pub fn metadata_ls(&self, storage_name: Option<&str>) -> Result<Vec<VersionUid>> {
        let storage = self.storage(storage_name)?;
        let mut uids = storage.list_version_uids()?;
        uids.sort();
        Ok(uids)
    }

    // --- Statistics -------------------------------------------------------

    pub fn storage_stats(&self, storage_name: Option<&str>) -> Result<(u64, u64)> {
        self.storage(storage_name)?.stats()
    }

    pub fn storage_usage(
        &self,
        filter_expression: Option<&str>,
    ) -> Result<std::collections::BTreeMap<String, crate::database::StorageUsage>> {
        let versions = self.versions_with_filter(filter_expression)?;
        self.db.storage_usage(&versions)
    }

    // --- Retention enforcement -------------------------------------------

    /// Apply a retention policy to the versions matching the filter. Kept
    /// and dismissed sets are computed per volume; protected and too-young
    /// versions are never removed. Returns the removed version uids.
    pub fn enforce(
        &self,
        filter_expression: Option<&str>,
        rules_spec: &str,
        dry_run: bool,
        keep_metadata_backup: bool,
    ) -> Result<Vec<VersionUid>> {
        let policy = RetentionPolicy::parse(rules_spec)?;
        let versions = self.versions_with_filter(filter_expression)?;

        let mut by_volume: HashMap<&str, Vec<&Version>> = HashMap::new();
        for version in &versions {
            if version.protected {
                info!(version = %version.uid, "not considering version, it is protected");
                continue;
            }
            if !version.status.is_removable() {
                info!(
                    version = %version.uid,
                    status = %version.status,
                    "not considering version due to its status"
                );
                continue;
            }
            if version.age_days() < i64::from(self.config.disallow_remove_when_younger) {
                info!(version = %version.uid, "not considering version, it is too young");
                continue;
            }
            by_volume.entry(&version.volume).or_default().push(version);
        }

        // Serialize policy application against concurrent backups creating
        // new versions of the same volumes.
        let mut volume_locks = Vec::new();
        for volume in by_volume.keys() {
            let descriptor = LockDescriptor::named(&format!("enforce:{}", volume));
            if let Err(err) = self.db.lock(
                &descriptor,
                LockMode::Exclusive,
                "Enforcing retention policy",
                false,
            ) {
                for descriptor in volume_locks {
                    let _ = self.db.unlock(&descriptor);
                }
                return Err(err);
            }
            volume_locks.push(descriptor);
        }

        let result = (|| {
            let reference = OffsetDateTime::now_utc();
            let offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
            let mut dismissed: Vec<VersionUid> = Vec::new();
            for versions in by_volume.values() {
                let pairs: Vec<(VersionUid, OffsetDateTime)> =
                    versions.iter().map(|v| (v.uid, v.date)).collect();
                dismissed.extend(policy.dismissed(&pairs, reference, offset));
            }
            dismissed.sort();

            if dismissed.is_empty() {
                info!("all versions conform to the retention policy");
                return Ok(dismissed);
            }
            info!(
                versions = %dismissed.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(", "),
                "removing versions"
            );
            if dry_run {
                info!("dry run, not removing anything");
                return Ok(Vec::new());
            }

            let mut removed = Vec::new();
            for uid in dismissed {
                match cleanup::rm(self, uid, true, keep_metadata_backup, false) {
                    Ok(()) => removed.push(uid),
                    Err(Error::LockConflict { .. }) => {
                        warn!(version = %uid, "version is locked, skipping");
                    }
                    Err(Error::NotFound { .. }) => {
                        warn!(version = %uid, "version was removed in the meantime");
                    }
                    Err(err) => return Err(err),
                }
            }
            Ok(removed)
        })();
        for descriptor in volume_locks {
            let _ = self.db.unlock(&descriptor);
        }
        result
    }
}
