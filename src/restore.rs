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

//! The restore pipeline.
//!
//! Restore is best-effort: a block that fails its integrity checks is
//! marked invalid (together with every version referencing it), the error
//! is logged, and the restore continues with the remaining blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::bounded;
use tracing::{debug, error, info};

use crate::database::{Database, LockDescriptor, LockMode};
use crate::errors::Error;
use crate::io::{self, Io};
use crate::pool::ParallelHandler;
use crate::repository::Repository;
use crate::version::{BlockRow, Version, VersionUid};
use crate::Result;

#[derive(Debug, Default)]
pub struct RestoreRequest {
    pub version_uid: VersionUid,
    pub target: String,
    pub sparse: bool,
    pub force: bool,
    pub database_less: bool,
    pub storage_name: Option<String>,
}

pub fn restore(repo: &Repository, request: RestoreRequest) -> Result<()> {
    if request.database_less {
        // Import the version's metadata backup from the storage into an
        // ephemeral store and restore from that.
        let db = Arc::new(Database::open_in_memory()?);
        db.init()?;
        let ephemeral =
            Repository::with_database(repo.config().clone(), db)?;
        let storage = ephemeral.storage(request.storage_name.as_deref())?;
        let document = storage.read_version_metadata(request.version_uid)?;
        ephemeral.metadata_import(&document)?;
        return restore_from_database(&ephemeral, &request);
    }
    restore_from_database(repo, &request)
}

fn restore_from_database(repo: &Repository, request: &RestoreRequest) -> Result<()> {
    let uid = request.version_uid;
    repo.db().lock(
        &LockDescriptor::version(uid),
        LockMode::Exclusive,
        "Restoring version",
        false,
    )?;
    let result = restore_locked(repo, request);
    let _ = repo.db().unlock(&LockDescriptor::version(uid));
    result
}

fn restore_locked(repo: &Repository, request: &RestoreRequest) -> Result<()> {
    let version = repo.db().version_by_uid(request.version_uid)?;
    let storage = repo.storage_by_id(version.storage_id)?;

    let io: Arc<dyn Io> = Arc::from(io::open(
        &request.target,
        version.block_size,
        &repo.config().ios,
    )?);
    io.open_write(version.size, request.force, request.sparse)?;
    if request.sparse {
        // Leave sparse regions unmapped on thin targets.
        io.discard(0, version.size)?;
    }

    let start = std::time::Instant::now();
    let written = Arc::new(AtomicU64::new(0));
    let errors = run_pipeline(repo, &version, &storage, io, request.sparse, &written)?;

    let elapsed = start.elapsed().as_secs().max(1);
    info!(
        version = %version.uid,
        bytes = written.load(Ordering::Relaxed),
        seconds = elapsed,
        "restore finished"
    );
    if errors > 0 {
        error!(
            version = %version.uid,
            errors,
            "restore completed with integrity errors, the restored image contains invalid blocks"
        );
    }
    Ok(())
}

/// Stream the block list; sparse blocks are zero-filled (or skipped with
/// `--sparse`), stored blocks are fetched, verified, and written. Returns
/// the number of blocks with integrity errors.
fn run_pipeline(
    repo: &Repository,
    version: &Version,
    storage: &Arc<crate::storage::Storage>,
    io: Arc<dyn Io>,
    sparse: bool,
    written: &Arc<AtomicU64>,
) -> Result<u64> {
    let integrity_errors = Arc::new(AtomicU64::new(0));

    // Storage readers fetch and verify; a bounded channel hands the decoded
    // payloads to the writer thread.
    let (write_tx, write_rx) = bounded::<(BlockRow, Bytes)>(storage.simultaneous_reads);

    let writer = {
        let io = io.clone();
        let written = written.clone();
        std::thread::Builder::new()
            .name("restore-write".to_owned())
            .spawn(move || -> Result<()> {
                let mut first_error: Option<Error> = None;
                for (row, data) in write_rx {
                    if first_error.is_some() {
                        continue;
                    }
                    if let Err(err) = io.write_block(row.idx, &data) {
                        first_error = Some(err);
                        continue;
                    }
                    written.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            })
            .expect("spawn writer thread")
    };

    let reader_pool = {
        let db = repo.db().clone();
        let hasher = repo.hasher().clone();
        let storage = storage.clone();
        let integrity_errors = integrity_errors.clone();
        let write_tx = write_tx.clone();
        ParallelHandler::new(
            "restore-read",
            storage.simultaneous_reads,
            storage.simultaneous_reads,
            move |row: BlockRow| {
                let uid = row.uid.expect("only stored blocks are scheduled");
                let fetched = match storage.read_block(uid, true) {
                    Ok(fetched) => Some(fetched),
                    Err(err) if err.is_integrity() => None,
                    Err(err) => return Err(err),
                };
                let verified = fetched.as_ref().map_or(
                    Err(Error::integrity(uid.storage_key(), "object unreadable")),
                    |(data, metadata)| {
                        storage.check_block_metadata(
                            uid,
                            metadata,
                            row.size,
                            row.checksum.as_deref(),
                        )?;
                        let checksum = hasher.digest_hex(data);
                        if Some(checksum.as_str()) != row.checksum.as_deref() {
                            return Err(Error::integrity(
                                uid.storage_key(),
                                "checksum mismatch during restore",
                            ));
                        }
                        Ok(())
                    },
                );
                if let Err(err) = verified {
                    // Mark the block and all referencing versions invalid,
                    // log, and continue: restore is best-effort.
                    error!(
                        block = row.idx,
                        block_uid = %uid,
                        %err,
                        "block is invalid, restored image will be damaged"
                    );
                    db.set_block_invalid(uid)?;
                    integrity_errors.fetch_add(1, Ordering::Relaxed);
                }
                // Write what we have, even when it failed verification.
                if let Some((data, _)) = fetched {
                    write_tx
                        .send((row, data))
                        .map_err(|_| Error::internal("writer channel closed"))?;
                }
                Ok(())
            },
        )
    };

    let dispatch_result = (|| -> Result<()> {
        let zero_block = Bytes::from(vec![0u8; version.block_size as usize]);
        for row in repo.db().block_iter(version.uid) {
            let row = row?;
            if row.is_sparse() {
                if sparse {
                    debug!(idx = row.idx, "skipping sparse block");
                } else {
                    let size = row.size as usize;
                    write_tx
                        .send((row, zero_block.slice(..size)))
                        .map_err(|_| Error::internal("writer channel closed"))?;
                }
            } else {
                reader_pool.send(row)?;
            }
        }
        Ok(())
    })();

    let reader_result = reader_pool.complete();
    drop(write_tx);
    let writer_result = writer
        .join()
        .map_err(|_| Error::internal("writer thread panicked"))?;

    dispatch_result?;
    reader_result?;
    writer_result?;
    Ok(integrity_errors.load(Ordering::Relaxed))
}
