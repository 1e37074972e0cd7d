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

//! Version-metadata import and export, schema `2.0.0`.
//!
//! The same document format serves three purposes: `metadata-export` to a
//! file, the per-version metadata backup embedded on the storage after every
//! successful backup, and `metadata-import`/`metadata-restore` back into a
//! database. Export streams block rows so a version's block list is never
//! held in memory at once.

use std::io::Write;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::database::{Database, NewBlock, NewVersion};
use crate::errors::Error;
use crate::version::{BlockUid, Version, VersionStatus, VersionUid};
use crate::Result;

pub const METADATA_VERSION: &str = "2.0.0";

/// Block rows per bulk insert while importing.
const IMPORT_BATCH: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
struct DocumentHead {
    metadata_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersionDocument {
    pub uid: String,
    pub date: String,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage: String,
    pub status: VersionStatus,
    pub protected: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    pub duration: u64,
    pub labels: std::collections::BTreeMap<String, String>,
    pub blocks: Vec<BlockDocument>,
}

/// Block order is by `idx` ascending; the index itself is implicit from the
/// position in the list.
#[derive(Debug, Serialize, Deserialize)]
pub struct BlockDocument {
    pub uid: Option<BlockUid>,
    pub size: u32,
    pub valid: bool,
    pub checksum: Option<String>,
}

fn format_date(date: OffsetDateTime) -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    date.to_offset(time::UtcOffset::UTC)
        .format(format)
        .expect("format UTC timestamp")
}

/// Export the given versions as one JSON document, streaming the block lists.
pub fn export(db: &Database, uids: &[VersionUid], writer: &mut dyn Write) -> Result<()> {
    let io_err = |source| Error::io("metadata export", source);

    write!(
        writer,
        "{{\"metadata_version\":{},\"versions\":[",
        serde_json::to_string(METADATA_VERSION)?
    )
    .map_err(io_err)?;
    for (i, &uid) in uids.iter().enumerate() {
        if i > 0 {
            writer.write_all(b",").map_err(io_err)?;
        }
        let version = db.version_by_uid(uid)?;
        let storage_name = db.storage_name(version.storage_id)?;
        export_version_head(&version, &storage_name, writer)?;
        let mut first = true;
        for block in db.block_iter(uid) {
            let block = block?;
            if !first {
                writer.write_all(b",").map_err(io_err)?;
            }
            first = false;
            serde_json::to_writer(
                &mut *writer,
                &BlockDocument {
                    uid: block.uid,
                    size: block.size,
                    valid: block.valid,
                    checksum: block.checksum,
                },
            )?;
        }
        writer.write_all(b"]}").map_err(io_err)?;
    }
    writer.write_all(b"]}").map_err(io_err)?;
    Ok(())
}

fn export_version_head(
    version: &Version,
    storage_name: &str,
    writer: &mut dyn Write,
) -> Result<()> {
    // Serialize everything except the block list through serde, then splice
    // the streamed block array in.
    #[derive(Serialize)]
    struct Head<'a> {
        uid: String,
        date: String,
        volume: &'a str,
        snapshot: &'a str,
        size: u64,
        block_size: u32,
        storage: &'a str,
        status: VersionStatus,
        protected: bool,
        bytes_read: u64,
        bytes_written: u64,
        bytes_deduplicated: u64,
        bytes_sparse: u64,
        duration: u64,
        labels: &'a std::collections::BTreeMap<String, String>,
    }
    let head = serde_json::to_string(&Head {
        uid: version.uid.to_string(),
        date: format_date(version.date),
        volume: &version.volume,
        snapshot: &version.snapshot,
        size: version.size,
        block_size: version.block_size,
        storage: storage_name,
        status: version.status,
        protected: version.protected,
        bytes_read: version.bytes_read,
        bytes_written: version.bytes_written,
        bytes_deduplicated: version.bytes_deduplicated,
        bytes_sparse: version.bytes_sparse,
        duration: version.duration,
        labels: &version.labels,
    })?;
    // Replace the closing brace with the opening of the blocks array.
    let trimmed = &head[..head.len() - 1];
    write!(writer, "{},\"blocks\":[", trimmed)
        .map_err(|source| Error::io("metadata export", source))
}

/// Import a metadata document. Existing versions with the same uid are an
/// error. Returns the imported version uids.
pub fn import(db: &Database, raw: &str) -> Result<Vec<VersionUid>> {
    #[derive(Deserialize)]
    struct Document {
        metadata_version: String,
        versions: Vec<VersionDocument>,
    }

    let document: Document = serde_json::from_str(raw)?;
    if document.metadata_version != METADATA_VERSION {
        return Err(Error::InvalidInput {
            reason: format!(
                "unsupported metadata version {:?}, expected {:?}",
                document.metadata_version, METADATA_VERSION
            ),
        });
    }

    let mut imported = Vec::new();
    for version_doc in document.versions {
        let uid: VersionUid = version_doc.uid.parse()?;
        if db.version_by_uid(uid).is_ok() {
            return Err(Error::InvalidInput {
                reason: format!("version {} already exists in the database", uid),
            });
        }
        let date = OffsetDateTime::parse(&version_doc.date, &Rfc3339)
            .map_err(|err| Error::InvalidInput {
                reason: format!("malformed date {:?}: {}", version_doc.date, err),
            })?
            .to_offset(time::UtcOffset::UTC);
        let storage = db.sync_storage(&version_doc.storage)?;
        db.create_version(NewVersion {
            uid: Some(uid),
            date: Some(date),
            volume: version_doc.volume,
            snapshot: version_doc.snapshot,
            size: version_doc.size,
            block_size: version_doc.block_size,
            storage_id: storage.id,
            status: version_doc.status,
            protected: version_doc.protected,
        })?;
        db.set_version_stats(
            uid,
            version_doc.bytes_read,
            version_doc.bytes_written,
            version_doc.bytes_deduplicated,
            version_doc.bytes_sparse,
            version_doc.duration,
        )?;
        for (name, value) in &version_doc.labels {
            db.add_label(uid, name, value)?;
        }
        let mut batch: Vec<NewBlock> = Vec::with_capacity(IMPORT_BATCH);
        for (idx, block) in version_doc.blocks.into_iter().enumerate() {
            batch.push(NewBlock {
                idx: idx as u64,
                uid: block.uid,
                checksum: block.checksum,
                size: block.size,
                valid: block.valid,
            });
            if batch.len() == IMPORT_BATCH {
                db.create_blocks(uid, &batch)?;
                batch.clear();
            }
        }
        db.create_blocks(uid, &batch)?;
        imported.push(uid);
    }
    Ok(imported)
}
