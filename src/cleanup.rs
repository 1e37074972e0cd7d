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

//! Version removal and deferred block deletion.
//!
//! `rm` is logical: the version row goes away and every stored object it
//! referenced becomes a deletion candidate. `cleanup` later deletes the
//! objects of candidates that are past the grace window and no longer
//! referenced by any surviving block row. The grace window closes the race
//! against a concurrent backup that re-used a candidate by checksum just
//! before its rows were committed.

use time::Duration;
use tracing::{info, warn};

use crate::database::{LockDescriptor, LockMode};
use crate::errors::Error;
use crate::pool::ParallelHandler;
use crate::repository::Repository;
use crate::version::VersionUid;
use crate::Result;

/// Remove one version. Without `force`, protected versions, versions
/// younger than `disallowRemoveWhenYounger` days, and incomplete versions
/// are refused. The version's metadata backup on the storage is removed too
/// unless `keep_metadata_backup`.
pub fn rm(
    repo: &Repository,
    uid: VersionUid,
    force: bool,
    keep_metadata_backup: bool,
    override_lock: bool,
) -> Result<()> {
    let descriptor = LockDescriptor::version(uid);
    repo.db().lock(
        &descriptor,
        LockMode::Exclusive,
        "Removing version",
        override_lock,
    )?;
    let result = rm_locked(repo, uid, force, keep_metadata_backup);
    let _ = repo.db().unlock(&descriptor);
    result
}

fn rm_locked(
    repo: &Repository,
    uid: VersionUid,
    force: bool,
    keep_metadata_backup: bool,
) -> Result<()> {
    let version = repo.db().version_by_uid(uid)?;
    if version.protected {
        return Err(Error::PolicyViolation {
            reason: format!("version {} is protected, will not remove it", uid),
        });
    }
    if !force {
        let minimum_age = i64::from(repo.config().disallow_remove_when_younger);
        if version.age_days() < minimum_age {
            return Err(Error::PolicyViolation {
                reason: format!(
                    "version {} is younger than {} days, will not remove it",
                    uid, minimum_age
                ),
            });
        }
        if !version.status.is_removable() {
            return Err(Error::PolicyViolation {
                reason: format!(
                    "version {} cannot be removed without force, its status is {}",
                    uid, version.status
                ),
            });
        }
    }

    let storage = repo.storage_by_id(version.storage_id)?;
    // Removal conflicts with any concurrent writer on the same storage.
    let storage_lock = LockDescriptor::storage(storage.name());
    repo.db()
        .lock(&storage_lock, LockMode::Exclusive, "Removing version", false)?;
    let num_blocks = match repo.db().rm_version(uid) {
        Ok(n) => {
            let _ = repo.db().unlock(&storage_lock);
            n
        }
        Err(err) => {
            let _ = repo.db().unlock(&storage_lock);
            return Err(err);
        }
    };

    if !keep_metadata_backup {
        match storage.remove_version_metadata(uid) {
            Ok(()) => info!(version = %uid, "removed version metadata backup from storage"),
            Err(_) => warn!(
                version = %uid,
                "unable to remove the version metadata backup from storage, object not found"
            ),
        }
    }
    info!(version = %uid, blocks = num_blocks, "removed version");
    Ok(())
}

/// Process deletion candidates: anything older than the grace window whose
/// stored object is no longer referenced is deleted from its storage.
/// Restartable and idempotent.
pub fn cleanup(repo: &Repository, grace_minutes: Option<u64>, override_lock: bool) -> Result<()> {
    let descriptor = LockDescriptor::named("cleanup");
    repo.db().lock(
        &descriptor,
        LockMode::Exclusive,
        "Cleanup",
        override_lock,
    )?;
    let result = cleanup_locked(repo, grace_minutes);
    let _ = repo.db().unlock(&descriptor);
    result
}

fn cleanup_locked(repo: &Repository, grace_minutes: Option<u64>) -> Result<()> {
    let grace = Duration::minutes(
        grace_minutes.unwrap_or(repo.config().cleanup_grace_minutes) as i64
    );
    let mut deleted = 0u64;
    while let Some(hit_list) = repo.db().take_delete_candidates(grace)? {
        for (storage_id, uids) in hit_list {
            let storage = repo.storage_by_id(storage_id)?;
            let storage_lock = LockDescriptor::storage(storage.name());
            repo.db()
                .lock(&storage_lock, LockMode::Exclusive, "Cleanup", false)?;
            let pool = {
                let storage = storage.clone();
                ParallelHandler::new(
                    "cleanup-remove",
                    storage.simultaneous_removals,
                    storage.simultaneous_removals,
                    move |uid: crate::version::BlockUid| {
                        match storage.remove_block(uid) {
                            Ok(()) => Ok(()),
                            // Already gone: an earlier interrupted cleanup
                            // may have deleted it.
                            Err(Error::Storage { .. }) => {
                                warn!(block_uid = %uid, "block object was already gone");
                                Ok(())
                            }
                            Err(err) => Err(err),
                        }
                    },
                )
            };
            let mut send_result = Ok(());
            for uid in uids {
                deleted += 1;
                if let Err(err) = pool.send(uid) {
                    send_result = Err(err);
                    break;
                }
            }
            let pool_result = pool.complete();
            let _ = repo.db().unlock(&storage_lock);
            send_result?;
            pool_result?;
        }
    }
    info!(deleted, "cleanup finished");
    Ok(())
}

/// Full cleanup: enumerate every block object on a storage and delete those
/// referenced neither by a block row nor by a pending deletion candidate
/// (candidates are still inside their grace window).
pub fn cleanup_full(repo: &Repository, storage_name: Option<&str>, override_lock: bool) -> Result<()> {
    let storage = repo.storage(storage_name)?;
    let storage_lock = LockDescriptor::storage(storage.name());
    repo.db().lock(
        &storage_lock,
        LockMode::Exclusive,
        "Full cleanup",
        override_lock,
    )?;
    let result = cleanup_full_locked(repo, &storage);
    let _ = repo.db().unlock(&storage_lock);
    result
}

fn cleanup_full_locked(
    repo: &Repository,
    storage: &std::sync::Arc<crate::storage::Storage>,
) -> Result<()> {
    let referenced = repo.db().referenced_block_uids(storage.id())?;
    let pending = repo.db().pending_delete_candidates(storage.id())?;
    let mut removed = 0u64;
    for uid in storage.list_block_uids()? {
        if referenced.contains(&uid) || pending.contains(&uid) {
            continue;
        }
        info!(block_uid = %uid, "removing unreferenced block object");
        storage.remove_block(uid)?;
        removed += 1;
    }
    info!(removed, storage = storage.name(), "full cleanup finished");
    Ok(())
}
