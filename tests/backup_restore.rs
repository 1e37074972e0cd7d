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

//! End-to-end backup and restore behavior.

mod common;

use common::*;

use benji::backup::{backup, BackupRequest};
use benji::io::Hint;
use benji::restore::{restore, RestoreRequest};
use benji::version::VersionStatus;
use benji::Result;

#[test]
fn fresh_backup_deduplicates_equal_blocks() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());

    let version = backup_simple(&repo, &source, "vol");
    assert_eq!(version.size, 12 * MIB);
    assert_eq!(version.status, VersionStatus::Valid);
    assert_eq!(version.blocks_count(), 3);
    assert_eq!(version.bytes_read, 12 * MIB);
    assert_eq!(version.bytes_deduplicated, 4 * MIB);
    assert_eq!(version.bytes_sparse, 0);

    let blocks: Vec<_> = repo
        .db()
        .block_iter(version.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_eq!(blocks.len(), 3);
    // The two A blocks share one stored object.
    assert_eq!(blocks[0].uid, blocks[1].uid);
    assert_ne!(blocks[0].uid, blocks[2].uid);
    assert_eq!(blocks[0].checksum, blocks[1].checksum);

    // Two unique data objects on the storage.
    let storage = repo.storage(None).unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 2);
    // Plus the version metadata backup.
    assert_eq!(storage.list_version_uids().unwrap(), vec![version.uid]);
}

#[test]
fn all_zero_source_stores_nothing() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &vec![0u8; 8 * MIB as usize]);

    let version = backup_simple(&repo, &source, "vol");
    assert_eq!(version.blocks_count(), 2);
    assert_eq!(version.bytes_sparse, 8 * MIB);
    assert_eq!(version.bytes_written, 0);

    let blocks: Vec<_> = repo
        .db()
        .block_iter(version.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert!(blocks.iter().all(|b| b.is_sparse()));

    let storage = repo.storage(None).unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 0);
}

#[test]
fn backing_up_twice_writes_no_new_data_objects() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());

    backup_simple(&repo, &source, "vol");
    let storage = repo.storage(None).unwrap();
    let objects_before = storage.block_object_count().unwrap();

    let second = backup_simple(&repo, &source, "vol");
    assert_eq!(second.bytes_deduplicated, 12 * MIB);
    assert_eq!(second.bytes_written, 0);
    assert_eq!(storage.block_object_count().unwrap(), objects_before);
    // Only a new metadata backup appeared.
    assert_eq!(storage.list_version_uids().unwrap().len(), 2);
}

#[test]
fn differential_backup_with_hints() {
    let (dir, repo) = scratch_repository();
    let mut content = aab_image();
    let source = source_image(&dir, "src", &content);
    let base = backup_simple(&repo, &source, "vol");

    // Change a single byte in block 0 and hint only that block.
    content[0] = 0x01;
    std::fs::write(&source, &content).unwrap();
    let hints = vec![Hint {
        offset: 0,
        length: 4 * MIB,
        exists: true,
    }];
    let version = backup(
        &repo,
        BackupRequest {
            source: file_uri(&source),
            volume: "vol".to_owned(),
            base_version_uid: Some(base.uid),
            hints: Some(hints),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(version.blocks_count(), 3);
    assert!(version.bytes_read <= 4 * MIB);

    let base_blocks: Vec<_> = repo
        .db()
        .block_iter(base.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    let new_blocks: Vec<_> = repo
        .db()
        .block_iter(version.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert_ne!(new_blocks[0].uid, base_blocks[0].uid);
    assert_eq!(new_blocks[1].uid, base_blocks[1].uid);
    assert_eq!(new_blocks[2].uid, base_blocks[2].uid);
}

#[test]
fn differential_backup_refuses_shrunk_source() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let base = backup_simple(&repo, &source, "vol");

    std::fs::write(&source, vec![0x11u8; 4 * MIB as usize]).unwrap();
    let err = backup(
        &repo,
        BackupRequest {
            source: file_uri(&source),
            volume: "vol".to_owned(),
            base_version_uid: Some(base.uid),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, benji::Error::SourceTooSmall { .. }));
}

#[test]
fn differential_backup_refuses_other_block_size() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let base = backup_simple(&repo, &source, "vol");

    let err = backup(
        &repo,
        BackupRequest {
            source: file_uri(&source),
            volume: "vol".to_owned(),
            base_version_uid: Some(base.uid),
            block_size: Some(1024 * 1024),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, benji::Error::BlockSizeMismatch { .. }));
}

#[test]
fn wrong_hints_are_caught_by_the_sanity_check() {
    let (dir, repo) = scratch_repository();
    let content = aab_image();
    let source = source_image(&dir, "src", &content);
    let base = backup_simple(&repo, &source, "vol");

    // Change block 1 but hint only block 0: the source no longer matches
    // the base outside the hinted region. (The sanity check always samples
    // the first blocks outside the hints, so block 1 is deterministic.)
    let mut changed = content.clone();
    changed[5 * MIB as usize] = 0x55;
    std::fs::write(&source, &changed).unwrap();
    let err = backup(
        &repo,
        BackupRequest {
            source: file_uri(&source),
            volume: "vol".to_owned(),
            base_version_uid: Some(base.uid),
            hints: Some(vec![Hint {
                offset: 0,
                length: 4 * MIB,
                exists: true,
            }]),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, benji::Error::InvalidInput { .. }));
    // The aborted version was removed again.
    assert_eq!(repo.versions_with_filter(None).unwrap().len(), 1);
}

#[test]
fn restore_round_trip_is_byte_identical() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    // Uneven size: the last block is short.
    let content: Vec<u8> = (0..3 * MIB as usize + 12345)
        .map(|i| (i % 251) as u8)
        .collect();
    let source = source_image(&dir, "src", &content);
    let version = backup_simple(&repo, &source, "vol");

    let target = dir.path().join("restored");
    restore(
        &repo,
        RestoreRequest {
            version_uid: version.uid,
            target: file_uri(&target),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[test]
fn restore_writes_zeros_for_sparse_blocks() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    let mut content = vec![0u8; 2 * MIB as usize];
    content.extend(std::iter::repeat(0x77).take(MIB as usize));
    let source = source_image(&dir, "src", &content);
    let version = backup_simple(&repo, &source, "vol");
    assert_eq!(version.bytes_sparse, 2 * MIB);

    let target = dir.path().join("restored");
    restore(
        &repo,
        RestoreRequest {
            version_uid: version.uid,
            target: file_uri(&target),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[test]
fn restore_refuses_existing_target_without_force() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    let content = vec![0x42u8; MIB as usize];
    let source = source_image(&dir, "src", &content);
    let version = backup_simple(&repo, &source, "vol");

    let target = source_image(&dir, "existing", &vec![0u8; MIB as usize]);
    let err = restore(
        &repo,
        RestoreRequest {
            version_uid: version.uid,
            target: file_uri(&target),
            ..Default::default()
        },
    )
    .unwrap_err();
    assert!(matches!(err, benji::Error::PolicyViolation { .. }));

    restore(
        &repo,
        RestoreRequest {
            version_uid: version.uid,
            target: file_uri(&target),
            force: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[test]
fn database_less_restore_uses_the_metadata_backup() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    let content: Vec<u8> = (0..2 * MIB as usize).map(|i| (i % 199) as u8).collect();
    let source = source_image(&dir, "src", &content);
    let version = backup_simple(&repo, &source, "vol");

    let target = dir.path().join("restored");
    restore(
        &repo,
        RestoreRequest {
            version_uid: version.uid,
            target: file_uri(&target),
            database_less: true,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), content);
}

#[test]
fn labels_are_recorded_on_the_version() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    let source = source_image(&dir, "src", &vec![0x13u8; MIB as usize]);
    let version = backup(
        &repo,
        BackupRequest {
            source: file_uri(&source),
            volume: "vol".to_owned(),
            snapshot: "snap-1".to_owned(),
            labels: vec![("env".to_owned(), "prod".to_owned())],
            ..Default::default()
        },
    )
    .unwrap();
    let loaded = repo.version_by_uid(version.uid).unwrap();
    assert_eq!(loaded.snapshot, "snap-1");
    assert_eq!(loaded.labels.get("env").map(String::as_str), Some("prod"));

    let matching = repo
        .versions_with_filter(Some("labels['env'] == 'prod'"))
        .unwrap();
    assert_eq!(matching.len(), 1);
    assert!(repo
        .versions_with_filter(Some("labels['env'] == 'dev'"))
        .unwrap()
        .is_empty());
}
