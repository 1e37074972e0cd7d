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

//! The scrub engine.
//!
//! A light scrub verifies that every stored object pair of a version exists,
//! that the sidecar passes its integrity checks, and that the recorded sizes
//! match. A deep scrub additionally fetches the data, inverts the transform
//! chain, and recomputes the block checksum; optionally it compares against
//! a live source. Corruption found anywhere propagates: the block and every
//! version referencing it are marked invalid.
//!
//! Sampled runs (`--block-percentage < 100`) may only ever downgrade a
//! version's status; a full deep-scrub is the only way back from `invalid`
//! to `valid`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::database::{LockDescriptor, LockMode};
use crate::errors::Error;
use crate::io::{self, Io};
use crate::pool::ParallelHandler;
use crate::repository::Repository;
use crate::version::{BlockRow, BlockUid, Version, VersionStatus, VersionUid};
use crate::Result;

/// Stored objects already verified in this batch run, so shared blocks are
/// checked once per run rather than once per referencing version. Blocks
/// enter the history only after they verified cleanly, so a bad block is
/// flagged again under every version referencing it.
pub type ScrubHistory = Arc<Mutex<HashSet<(u32, BlockUid)>>>;

pub fn new_history() -> ScrubHistory {
    Arc::new(Mutex::new(HashSet::new()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Light,
    Deep,
}

pub fn scrub(
    repo: &Repository,
    uid: VersionUid,
    block_percentage: u8,
    history: Option<&ScrubHistory>,
) -> Result<()> {
    run_scrub(repo, uid, block_percentage, history, Mode::Light, None)
}

pub fn deep_scrub(
    repo: &Repository,
    uid: VersionUid,
    block_percentage: u8,
    source: Option<&str>,
    history: Option<&ScrubHistory>,
) -> Result<()> {
    run_scrub(repo, uid, block_percentage, history, Mode::Deep, source)
}

fn run_scrub(
    repo: &Repository,
    uid: VersionUid,
    block_percentage: u8,
    history: Option<&ScrubHistory>,
    mode: Mode,
    source: Option<&str>,
) -> Result<()> {
    let block_percentage = block_percentage.clamp(1, 100);
    let descriptor = LockDescriptor::version(uid);
    repo.db().lock(
        &descriptor,
        LockMode::Exclusive,
        if mode == Mode::Deep {
            "Deep-scrubbing"
        } else {
            "Scrubbing"
        },
        false,
    )?;
    let result = scrub_locked(repo, uid, block_percentage, history, mode, source);
    let _ = repo.db().unlock(&descriptor);
    result
}

fn scrub_locked(
    repo: &Repository,
    uid: VersionUid,
    block_percentage: u8,
    history: Option<&ScrubHistory>,
    mode: Mode,
    source: Option<&str>,
) -> Result<()> {
    let version = repo.db().version_by_uid(uid)?;
    if !version.status.is_scrubbable() {
        return Err(Error::PolicyViolation {
            reason: format!(
                "version {} cannot be scrubbed, its status is {}",
                uid, version.status
            ),
        });
    }
    if !version.status.is_valid() {
        warn!(version = %uid, status = %version.status, "scrubbing an invalid version");
    }
    let storage = repo.storage_by_id(version.storage_id)?;
    let io = match source {
        Some(source_uri) => Some(Arc::<dyn Io>::from(io::open(
            source_uri,
            version.block_size,
            &repo.config().ios,
        )?)),
        None => None,
    };

    // Deep-scrub must observe the backend, not the read cache.
    let restore_cache = if mode == Mode::Deep {
        Some(storage.set_read_cache_enabled(false))
    } else {
        None
    };
    let result = scrub_blocks(
        repo,
        &version,
        &storage,
        block_percentage,
        history,
        mode,
        io,
    );
    if let Some(previous) = restore_cache {
        storage.set_read_cache_enabled(previous);
    }

    let outcome = result?;
    if outcome.source_mismatches > 0 {
        error!(version = %uid, "version had source mismatches");
    }
    if outcome.sparse_mismatches > 0 {
        error!(
            version = %uid,
            "version has sparse blocks where the source has data"
        );
        repo.db().set_version_status(uid, VersionStatus::Invalid)?;
    }

    if outcome.invalid_blocks == 0 && outcome.sparse_mismatches == 0 {
        if mode == Mode::Deep && block_percentage == 100 {
            // Only a full deep-scrub may bring a version back to valid.
            repo.db().set_version_status(uid, VersionStatus::Valid)?;
        }
        info!(version = %uid, "scrub successful");
        Ok(())
    } else {
        error!(version = %uid, "marked version as invalid because it has errors");
        Err(Error::ScrubFailed {
            uid: uid.to_string(),
        })
    }
}

#[derive(Default)]
struct ScrubOutcome {
    invalid_blocks: u64,
    source_mismatches: u64,
    sparse_mismatches: u64,
}

fn scrub_blocks(
    repo: &Repository,
    version: &Version,
    storage: &Arc<crate::storage::Storage>,
    block_percentage: u8,
    history: Option<&ScrubHistory>,
    mode: Mode,
    io: Option<Arc<dyn Io>>,
) -> Result<ScrubOutcome> {
    let invalid_blocks = Arc::new(AtomicU64::new(0));
    let source_mismatches = Arc::new(AtomicU64::new(0));
    let revalidated = Arc::new(AtomicU64::new(0));

    let pool = {
        let db = repo.db().clone();
        let hasher = repo.hasher().clone();
        let storage = storage.clone();
        let io = io.clone();
        let history = history.cloned();
        let invalid_blocks = invalid_blocks.clone();
        let source_mismatches = source_mismatches.clone();
        let revalidated = revalidated.clone();
        let version_uid = version.uid;
        let version_storage_id = version.storage_id;
        ParallelHandler::new(
            "scrub-read",
            storage.simultaneous_reads,
            storage.simultaneous_reads,
            move |row: BlockRow| {
                let uid = row.uid.expect("only stored blocks are scheduled");
                let check = (|| -> Result<()> {
                    match mode {
                        Mode::Light => {
                            let (_, metadata) = storage.read_block_metadata(uid)?;
                            storage.check_block_metadata(
                                uid,
                                &metadata,
                                row.size,
                                row.checksum.as_deref(),
                            )?;
                        }
                        Mode::Deep => {
                            let (data, metadata) = storage.read_block(uid, false)?;
                            storage.check_block_metadata(
                                uid,
                                &metadata,
                                row.size,
                                row.checksum.as_deref(),
                            )?;
                            let checksum = hasher.digest_hex(&data);
                            if Some(checksum.as_str()) != row.checksum.as_deref() {
                                return Err(Error::integrity(
                                    uid.storage_key(),
                                    "checksum mismatch during deep-scrub",
                                ));
                            }
                            if let Some(io) = &io {
                                let source_data = io.read_block(row.idx, row.size as usize)?;
                                if data[..] != source_data[..] {
                                    // The stored block checks out, so the
                                    // source side changed; do not mark the
                                    // block invalid.
                                    error!(
                                        block = row.idx,
                                        version = %version_uid,
                                        "source data differs from the stored block"
                                    );
                                    source_mismatches.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }
                    }
                    Ok(())
                })();
                match check {
                    Ok(()) => {
                        if let Some(history) = &history {
                            history
                                .lock()
                                .unwrap()
                                .insert((version_storage_id, uid));
                        }
                        if mode == Mode::Deep && !row.valid {
                            info!(
                                block = row.idx,
                                block_uid = %uid,
                                "block passed revalidation, marking it valid"
                            );
                            db.set_block_valid(uid)?;
                            revalidated.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(())
                    }
                    Err(err) if err.is_integrity() => {
                        error!(block = row.idx, block_uid = %uid, %err, "block is invalid");
                        db.set_block_invalid(uid)?;
                        invalid_blocks.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            },
        )
    };

    let sparse_checksum = repo.hasher().sparse_digest_hex(version.block_size);
    let mut sparse_mismatches = 0u64;
    let mut rng = rand::thread_rng();
    let mut scheduled_any = false;

    let dispatch_result = (|| -> Result<()> {
        for row in repo.db().block_iter(version.uid) {
            let row = row?;
            let Some(uid) = row.uid else {
                // Sparse block. With a source at hand, verify the region
                // really is all zero there.
                if let (Mode::Deep, Some(io)) = (mode, &io) {
                    let source_data = io.read_block(row.idx, row.size as usize)?;
                    let expected = if row.size == version.block_size {
                        sparse_checksum.clone()
                    } else {
                        repo.hasher().digest_hex(&vec![0u8; row.size as usize])
                    };
                    if repo.hasher().digest_hex(&source_data) != expected {
                        error!(
                            block = row.idx,
                            version = %version.uid,
                            "block is sparse but the source has data there"
                        );
                        sparse_mismatches += 1;
                    }
                }
                continue;
            };
            if let Some(history) = history {
                if history
                    .lock()
                    .unwrap()
                    .contains(&(version.storage_id, uid))
                {
                    debug!(block = row.idx, "skipping block, already seen in this run");
                    continue;
                }
            }
            // Sample, but always scrub at least the first considered block.
            if scheduled_any && block_percentage < 100 && rng.gen_range(1..=100) > block_percentage
            {
                continue;
            }
            scheduled_any = true;
            pool.send(row)?;
        }
        Ok(())
    })();

    let pool_result = pool.complete();
    dispatch_result?;
    pool_result?;

    Ok(ScrubOutcome {
        invalid_blocks: invalid_blocks.load(Ordering::Relaxed),
        source_mismatches: source_mismatches.load(Ordering::Relaxed),
        sparse_mismatches,
    })
}

/// Outcome of a batch scrub: which versions were considered and which
/// failed.
pub struct BatchScrubResult {
    pub considered: Vec<VersionUid>,
    pub errors: Vec<VersionUid>,
}

pub fn batch_scrub(
    repo: &Repository,
    filter_expression: Option<&str>,
    version_percentage: u8,
    block_percentage: u8,
) -> Result<BatchScrubResult> {
    run_batch(repo, filter_expression, version_percentage, block_percentage, Mode::Light)
}

pub fn batch_deep_scrub(
    repo: &Repository,
    filter_expression: Option<&str>,
    version_percentage: u8,
    block_percentage: u8,
) -> Result<BatchScrubResult> {
    run_batch(repo, filter_expression, version_percentage, block_percentage, Mode::Deep)
}

fn run_batch(
    repo: &Repository,
    filter_expression: Option<&str>,
    version_percentage: u8,
    block_percentage: u8,
    mode: Mode,
) -> Result<BatchScrubResult> {
    let version_percentage = version_percentage.clamp(1, 100);
    let history = new_history();
    let mut versions = repo.versions_with_filter(filter_expression)?;

    if version_percentage < 100 && !versions.is_empty() {
        // Sample versions, but always scrub at least one.
        use rand::seq::SliceRandom;
        let keep = ((versions.len() * version_percentage as usize) / 100).max(1);
        let mut rng = rand::thread_rng();
        versions.shuffle(&mut rng);
        versions.truncate(keep);
        versions.sort_by_key(|v| v.uid);
    }
    if versions.is_empty() {
        info!("no matching versions found");
        return Ok(BatchScrubResult {
            considered: Vec::new(),
            errors: Vec::new(),
        });
    }

    let mut errors = Vec::new();
    for version in &versions {
        info!(
            version = %version.uid,
            volume = %version.volume,
            block_percentage,
            "batch scrubbing version"
        );
        let result = match mode {
            Mode::Light => scrub(repo, version.uid, block_percentage, Some(&history)),
            Mode::Deep => deep_scrub(repo, version.uid, block_percentage, None, Some(&history)),
        };
        match result {
            Ok(()) => {}
            Err(Error::ScrubFailed { .. }) => errors.push(version.uid),
            Err(Error::LockConflict { .. }) => {
                warn!(version = %version.uid, "skipping version, it is locked");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(BatchScrubResult {
        considered: versions.iter().map(|v| v.uid).collect(),
        errors,
    })
}
