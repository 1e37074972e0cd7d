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

//! The backup pipeline.
//!
//! Blocks stream through bounded stages: source readers feed hash/dedup/
//! storage workers over bounded channels, a committer thread folds results
//! into the block table in batched transactions. Back-pressure is inherent:
//! a full queue blocks the producer. No stage holds a database transaction
//! across an I/O suspension point.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_channel::bounded;
use tracing::{debug, info, warn};

use crate::database::{LockDescriptor, LockMode, NewBlock, NewVersion};
use crate::errors::Error;
use crate::io::{self, Hint, Io};
use crate::pool::ParallelHandler;
use crate::repository::Repository;
use crate::version::{BlockUid, Version, VersionStatus, VersionUid};
use crate::Result;

/// Block rows per commit while seeding and while folding results.
const COMMIT_BATCH: usize = 1_000;

/// Rows per bulk insert when seeding a new version's block plan.
const SEED_BATCH: usize = 10_000;

#[derive(Debug, Default)]
pub struct BackupRequest {
    pub source: String,
    pub volume: String,
    pub snapshot: String,
    pub uid: Option<VersionUid>,
    pub base_version_uid: Option<VersionUid>,
    pub hints: Option<Vec<Hint>>,
    pub block_size: Option<u32>,
    pub storage_name: Option<String>,
    pub labels: Vec<(String, String)>,
}

#[derive(Default)]
struct BackupStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    bytes_deduplicated: AtomicU64,
    bytes_sparse: AtomicU64,
}

/// At most one concurrent builder per block fingerprint within this
/// process. Across processes duplicate uploads are tolerated: equal
/// checksum implies equal plaintext and object writes are idempotent.
pub(crate) struct SingleFlight {
    in_flight: Mutex<HashSet<String>>,
    done: Condvar,
}

pub(crate) struct SingleFlightGuard<'a> {
    owner: &'a SingleFlight,
    key: String,
}

impl SingleFlight {
    pub(crate) fn new() -> SingleFlight {
        SingleFlight {
            in_flight: Mutex::new(HashSet::new()),
            done: Condvar::new(),
        }
    }

    /// Block until no other worker is building this fingerprint, then claim
    /// it. The caller re-checks the dedup index after acquisition.
    pub(crate) fn acquire(&self, key: &str) -> SingleFlightGuard<'_> {
        let mut in_flight = self.in_flight.lock().unwrap();
        while in_flight.contains(key) {
            in_flight = self.done.wait(in_flight).unwrap();
        }
        in_flight.insert(key.to_owned());
        SingleFlightGuard {
            owner: self,
            key: key.to_owned(),
        }
    }
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.in_flight.lock().unwrap().remove(&self.key);
        self.owner.done.notify_all();
    }
}

/// Create the metadata for a new version, seeding its block plan from a
/// base version when given. Leaves the new version locked exclusively.
pub(crate) fn create_version(
    repo: &Repository,
    uid: Option<VersionUid>,
    volume: &str,
    snapshot: &str,
    size: u64,
    block_size: u32,
    storage_name: Option<&str>,
    base_version_uid: Option<VersionUid>,
) -> Result<Version> {
    let storage = repo.storage(storage_name)?;

    let base = match base_version_uid {
        Some(base_uid) => {
            let base = repo.db().version_by_uid(base_uid)?;
            if !base.status.is_valid() {
                return Err(Error::BaseInvalid {
                    uid: base_uid.to_string(),
                    reason: format!("its status is {}", base.status),
                });
            }
            if base.block_size != block_size {
                return Err(Error::BlockSizeMismatch {
                    base: base.block_size,
                    requested: block_size,
                });
            }
            if base.storage_id != storage.id() {
                return Err(Error::BaseInvalid {
                    uid: base_uid.to_string(),
                    reason: "it lives on a different storage".to_owned(),
                });
            }
            Some(base)
        }
        None => None,
    };

    let version = repo.db().create_version(NewVersion {
        uid,
        date: None,
        volume: volume.to_owned(),
        snapshot: snapshot.to_owned(),
        size,
        block_size,
        storage_id: storage.id(),
        status: VersionStatus::Incomplete,
        protected: false,
    })?;
    repo.db().lock(
        &LockDescriptor::version(version.uid),
        LockMode::Exclusive,
        "Preparing version",
        false,
    )?;

    let result = seed_blocks(repo, &version, base.as_ref());
    if let Err(err) = result {
        let _ = repo.db().unlock(&LockDescriptor::version(version.uid));
        return Err(err);
    }
    Ok(version)
}

fn seed_blocks(repo: &Repository, version: &Version, base: Option<&Version>) -> Result<()> {
    let mut base_blocks = base.map(|b| repo.db().block_iter(b.uid));
    let mut batch: Vec<NewBlock> = Vec::with_capacity(SEED_BATCH);
    for idx in 0..version.blocks_count() {
        let inherited = match &mut base_blocks {
            Some(iter) => match iter.next() {
                Some(row) => {
                    let row = row?;
                    debug_assert_eq!(row.idx, idx);
                    Some(row)
                }
                None => {
                    base_blocks = None;
                    None
                }
            },
            None => None,
        };
        let (mut uid, mut checksum, mut size, mut valid) = match inherited {
            Some(row) => (row.uid, row.checksum, row.size, row.valid),
            None => (None, None, version.block_size, true),
        };
        // Blocks whose size changed between base and new version (the
        // boundary block when the sizes differ) must be re-read.
        let offset = idx * u64::from(version.block_size);
        let expected_size =
            u64::from(version.block_size).min(version.size - offset) as u32;
        if size != expected_size {
            uid = None;
            checksum = None;
            size = expected_size;
            valid = false;
        }
        batch.push(NewBlock {
            idx,
            uid,
            checksum,
            size,
            valid,
        });
        if batch.len() == SEED_BATCH {
            repo.db().create_blocks(version.uid, &batch)?;
            batch.clear();
        }
    }
    repo.db().create_blocks(version.uid, &batch)
}

/// An update to one block row produced by the pipeline.
struct BlockUpdate {
    idx: u64,
    uid: Option<BlockUid>,
    checksum: Option<String>,
    size: u32,
}

pub fn backup(repo: &Repository, request: BackupRequest) -> Result<Version> {
    if !crate::version::is_valid_name(&request.volume) {
        return Err(Error::InvalidInput {
            reason: format!("volume name {:?} is invalid", request.volume),
        });
    }
    if !crate::version::is_valid_optional_name(&request.snapshot) {
        return Err(Error::InvalidInput {
            reason: format!("snapshot name {:?} is invalid", request.snapshot),
        });
    }

    let block_size = request.block_size.unwrap_or(repo.config().block_size);
    let io: Arc<dyn Io> = Arc::from(io::open(&request.source, block_size, &repo.config().ios)?);
    let source_size = io.size()?;

    if let Some(base_uid) = request.base_version_uid {
        let base = repo.db().version_by_uid(base_uid)?;
        if source_size < base.size {
            return Err(Error::SourceTooSmall {
                source_size,
                base_size: base.size,
            });
        }
    }

    let storage = repo.storage(request.storage_name.as_deref())?;
    let storage_lock = LockDescriptor::storage(storage.name());
    repo.db()
        .lock(&storage_lock, LockMode::Shared, "Backup", false)?;

    let result = backup_locked(repo, &request, io, source_size, block_size, &storage);
    let _ = repo.db().unlock(&storage_lock);
    result
}

fn backup_locked(
    repo: &Repository,
    request: &BackupRequest,
    io: Arc<dyn Io>,
    source_size: u64,
    block_size: u32,
    storage: &Arc<crate::storage::Storage>,
) -> Result<Version> {
    let start = Instant::now();
    let version = create_version(
        repo,
        request.uid,
        &request.volume,
        &request.snapshot,
        source_size,
        block_size,
        request.storage_name.as_deref(),
        request.base_version_uid,
    )?;
    let version_lock = LockDescriptor::version(version.uid);

    let result = (|| -> Result<()> {
        for (name, value) in &request.labels {
            repo.db().add_label(version.uid, name, value)?;
        }

        let (read_blocks, sparse_blocks) = match &request.hints {
            Some(hints) if hints.is_empty() => {
                // Two snapshots can be identical between one backup and the
                // next.
                warn!("hints are empty, assuming nothing has changed");
                (BTreeSet::new(), BTreeSet::new())
            }
            Some(hints) => {
                let max_end = hints.iter().map(|h| h.offset + h.length).max().unwrap_or(0);
                if max_end > source_size {
                    return Err(Error::InvalidInput {
                        reason: "hints reach beyond the end of the source".to_owned(),
                    });
                }
                io::blocks_from_hints(hints, block_size)
            }
            None => ((0..version.blocks_count()).collect(), BTreeSet::new()),
        };

        if request.base_version_uid.is_some() && request.hints.is_some() {
            hint_sanity_check(repo, &version, &io, &read_blocks, &sparse_blocks)?;
        }

        info!(
            source = %io.display_uri(),
            storage = storage.name(),
            version = %version.uid,
            "starting backup"
        );
        run_pipeline(
            repo,
            &version,
            io.clone(),
            storage,
            &read_blocks,
            &sparse_blocks,
        )?;
        Ok(())
    })();

    if let Err(err) = result {
        // Leave the version in `incomplete`; blocks already written are
        // dedup-eligible on retry.
        let _ = repo.db().unlock(&version_lock);
        return Err(err);
    }

    repo.db()
        .set_version_status(version.uid, VersionStatus::Valid)?;
    repo.metadata_backup(&[version.uid], true)?;

    let version = repo.db().version_by_uid(version.uid)?;
    repo.db().set_version_stats(
        version.uid,
        version.bytes_read,
        version.bytes_written,
        version.bytes_deduplicated,
        version.bytes_sparse,
        start.elapsed().as_secs(),
    )?;
    repo.db().unlock(&version_lock)?;
    info!(version = %version.uid, "backup successful");
    repo.db().version_by_uid(version.uid)
}

/// Read a small sample of blocks outside the hinted regions and compare
/// them against the checksums inherited from the base version. A mismatch
/// means the hints are wrong or the source is not what the base was taken
/// from; the backup would be silently corrupt.
fn hint_sanity_check(
    repo: &Repository,
    version: &Version,
    io: &Arc<dyn Io>,
    read_blocks: &BTreeSet<u64>,
    sparse_blocks: &BTreeSet<u64>,
) -> Result<()> {
    use rand::seq::SliceRandom;

    let ignored: Vec<u64> = (0..version.blocks_count())
        .filter(|idx| !read_blocks.contains(idx) && !sparse_blocks.contains(idx))
        .collect();
    if ignored.is_empty() {
        return Ok(());
    }
    let check_count = (ignored.len() / 1000).max(10).min(ignored.len());
    let mut check: BTreeSet<u64> = ignored[..check_count / 2].iter().copied().collect();
    let mut rng = rand::thread_rng();
    check.extend(ignored.choose_multiple(&mut rng, check_count / 2).copied());

    let mut checked = 0;
    for idx in check {
        let Some(row) = repo.db().block_by_idx(version.uid, idx)? else {
            continue;
        };
        let (Some(_), Some(checksum), true) = (row.uid, &row.checksum, row.valid) else {
            // Sparse or invalid in the base plan, nothing to compare.
            continue;
        };
        let data = io.read_block(idx, row.size as usize)?;
        if repo.hasher().digest_hex(&data) != *checksum {
            let _ = repo.db().rm_version(version.uid);
            return Err(Error::InvalidInput {
                reason: format!(
                    "source and base differ outside the hinted regions at block {} \
                     (offset {}), the hints look wrong",
                    idx,
                    idx * u64::from(version.block_size)
                ),
            });
        }
        checked += 1;
    }
    info!(checked, "hint sanity check passed");
    Ok(())
}

fn run_pipeline(
    repo: &Repository,
    version: &Version,
    io: Arc<dyn Io>,
    storage: &Arc<crate::storage::Storage>,
    read_blocks: &BTreeSet<u64>,
    sparse_blocks: &BTreeSet<u64>,
) -> Result<()> {
    let stats = Arc::new(BackupStats::default());
    let singleflight = Arc::new(SingleFlight::new());
    // Blocks written in this run, by fingerprint. Row updates are committed
    // in batches, so a block that just went to storage is not yet visible
    // to the database dedup lookup; this map closes that window.
    let written_blocks: Arc<Mutex<std::collections::HashMap<String, (BlockUid, u32)>>> =
        Arc::new(Mutex::new(std::collections::HashMap::new()));
    let sparse_checksum = repo.hasher().sparse_digest_hex(version.block_size);

    let (result_tx, result_rx) = bounded::<BlockUpdate>(COMMIT_BATCH);

    // Committer: folds block updates into the database in batched
    // transactions. Keeps draining after an error so the bounded channel
    // never wedges the workers.
    let committer = {
        let db = repo.db().clone();
        let version_uid = version.uid;
        std::thread::Builder::new()
            .name("backup-commit".to_owned())
            .spawn(move || -> Result<()> {
                let mut first_error: Option<Error> = None;
                let mut batch: Vec<NewBlock> = Vec::with_capacity(COMMIT_BATCH);
                let mut flush = |batch: &mut Vec<NewBlock>| -> Result<()> {
                    let updates = std::mem::take(batch);
                    db.set_blocks(version_uid, &updates)
                };
                for update in result_rx {
                    if first_error.is_some() {
                        continue;
                    }
                    batch.push(NewBlock {
                        idx: update.idx,
                        uid: update.uid,
                        checksum: update.checksum,
                        size: update.size,
                        valid: true,
                    });
                    if batch.len() == COMMIT_BATCH {
                        if let Err(err) = flush(&mut batch) {
                            first_error = Some(err);
                        }
                    }
                }
                if let Some(err) = first_error {
                    return Err(err);
                }
                flush(&mut batch)
            })
            .expect("spawn committer thread")
    };

    // Hash, dedup, transform, and store one block.
    let process_pool = {
        let db = repo.db().clone();
        let hasher = repo.hasher().clone();
        let storage = storage.clone();
        let stats = stats.clone();
        let singleflight = singleflight.clone();
        let written_blocks = written_blocks.clone();
        let result_tx = result_tx.clone();
        let sparse_checksum = sparse_checksum.clone();
        let version_uid = version.uid;
        let version_block_size = version.block_size;
        let storage_id = storage.id();
        ParallelHandler::new(
            "backup-store",
            storage.simultaneous_writes,
            storage.simultaneous_writes,
            move |(idx, data): (u64, Vec<u8>)| {
                let size = data.len() as u32;
                stats.bytes_read.fetch_add(u64::from(size), Ordering::Relaxed);
                let checksum = hasher.digest_hex(&data);

                if checksum == sparse_checksum && size == version_block_size {
                    stats
                        .bytes_sparse
                        .fetch_add(u64::from(size), Ordering::Relaxed);
                    debug!(idx, "detected sparse block");
                    result_tx
                        .send(BlockUpdate {
                            idx,
                            uid: None,
                            checksum: None,
                            size,
                        })
                        .map_err(|_| Error::internal("committer channel closed"))?;
                    return Ok(());
                }

                // Dedup lookup: this run's fresh writes first, then the
                // committed rows of the metadata store.
                let lookup = |checksum: &str| -> Result<Option<BlockUid>> {
                    if let Some(&(uid, written_size)) =
                        written_blocks.lock().unwrap().get(checksum)
                    {
                        if written_size == size {
                            return Ok(Some(uid));
                        }
                    }
                    match db.block_by_checksum(checksum, storage_id)? {
                        Some(existing) if existing.size == size => Ok(existing.uid),
                        _ => Ok(None),
                    }
                };

                let update = match lookup(&checksum)? {
                    Some(existing_uid) => {
                        stats
                            .bytes_deduplicated
                            .fetch_add(u64::from(size), Ordering::Relaxed);
                        debug!(idx, block_uid = %existing_uid, "found existing block");
                        BlockUpdate {
                            idx,
                            uid: Some(existing_uid),
                            checksum: Some(checksum),
                            size,
                        }
                    }
                    None => {
                        let _guard = singleflight.acquire(&checksum);
                        // Another worker may have finished this fingerprint
                        // while we waited.
                        match lookup(&checksum)? {
                            Some(existing_uid) => {
                                stats
                                    .bytes_deduplicated
                                    .fetch_add(u64::from(size), Ordering::Relaxed);
                                BlockUpdate {
                                    idx,
                                    uid: Some(existing_uid),
                                    checksum: Some(checksum),
                                    size,
                                }
                            }
                            None => {
                                let uid = BlockUid::new(version_uid.0, idx + 1);
                                storage.write_block(uid, &checksum, data)?;
                                stats
                                    .bytes_written
                                    .fetch_add(u64::from(size), Ordering::Relaxed);
                                written_blocks
                                    .lock()
                                    .unwrap()
                                    .insert(checksum.clone(), (uid, size));
                                debug!(idx, block_uid = %uid, "wrote new block");
                                BlockUpdate {
                                    idx,
                                    uid: Some(uid),
                                    checksum: Some(checksum),
                                    size,
                                }
                            }
                        }
                    }
                };
                result_tx
                    .send(update)
                    .map_err(|_| Error::internal("committer channel closed"))
            },
        )
    };

    // Source readers feed the store workers.
    let reader_pool = {
        let io = io.clone();
        let process_handle = process_pool.channel();
        ParallelHandler::new(
            "backup-read",
            io.simultaneous_reads(),
            io.simultaneous_reads(),
            move |(idx, length): (u64, usize)| {
                let data = io.read_block(idx, length)?;
                process_handle.send((idx, data))
            },
        )
    };

    // Walk the block plan and dispatch work.
    let dispatch_result = (|| -> Result<()> {
        let mut sparse_updates: Vec<NewBlock> = Vec::with_capacity(COMMIT_BATCH);
        for row in repo.db().block_iter(version.uid) {
            let row = row?;
            if read_blocks.contains(&row.idx) || !row.valid {
                reader_pool.send((row.idx, row.size as usize))?;
            } else if sparse_blocks.contains(&row.idx) {
                stats
                    .bytes_sparse
                    .fetch_add(u64::from(row.size), Ordering::Relaxed);
                if row.uid.is_some() {
                    debug!(idx = row.idx, "block turned sparse");
                    sparse_updates.push(NewBlock {
                        idx: row.idx,
                        uid: None,
                        checksum: None,
                        size: row.size,
                        valid: true,
                    });
                    if sparse_updates.len() == COMMIT_BATCH {
                        repo.db().set_blocks(version.uid, &sparse_updates)?;
                        sparse_updates.clear();
                    }
                }
            } else {
                debug!(idx = row.idx, "keeping block from base version");
            }
        }
        repo.db().set_blocks(version.uid, &sparse_updates)
    })();

    // Wind the stages down in order; surface the first error of any stage.
    let reader_result = reader_pool.complete();
    let process_result = process_pool.complete();
    drop(result_tx);
    let committer_result = committer
        .join()
        .map_err(|_| Error::internal("committer thread panicked"))?;

    dispatch_result?;
    reader_result?;
    process_result?;
    committer_result?;

    repo.db().set_version_stats(
        version.uid,
        stats.bytes_read.load(Ordering::Relaxed),
        stats.bytes_written.load(Ordering::Relaxed),
        stats.bytes_deduplicated.load(Ordering::Relaxed),
        stats.bytes_sparse.load(Ordering::Relaxed),
        0,
    )?;
    Ok(())
}
