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

//! Corruption detection, invalidity propagation, and garbage collection.

mod common;

use common::*;

use benji::restore::{restore, RestoreRequest};
use benji::scrub::{deep_scrub, scrub};
use benji::version::VersionStatus;
use benji::{cleanup, Result};

/// Corrupt one byte of the stored data object behind a block row.
fn corrupt_block_object(dir: &tempfile::TempDir, repo: &std::sync::Arc<benji::Repository>, version_uid: benji::VersionUid, idx: u64) {
    let row = repo.db().block_by_idx(version_uid, idx).unwrap().unwrap();
    let key = row.uid.unwrap().storage_key();
    let path = dir.path().join("objects").join(key);
    let mut data = std::fs::read(&path).unwrap();
    data[0] ^= 0x01;
    std::fs::write(&path, &data).unwrap();
}

#[test]
fn deep_scrub_detects_corruption_and_propagates() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let v1 = backup_simple(&repo, &source, "vol");
    // A second version sharing all stored objects.
    let v2 = backup_simple(&repo, &source, "vol");

    corrupt_block_object(&dir, &repo, v1.uid, 0);

    let err = deep_scrub(&repo, v1.uid, 100, None, None).unwrap_err();
    assert!(matches!(err, benji::Error::ScrubFailed { .. }));

    // Both versions reference the corrupt object, both are invalid now.
    assert_eq!(
        repo.version_by_uid(v1.uid).unwrap().status,
        VersionStatus::Invalid
    );
    assert_eq!(
        repo.version_by_uid(v2.uid).unwrap().status,
        VersionStatus::Invalid
    );

    // Restore is best-effort: it completes, writes what it can, and flags
    // the bad block again.
    let target = dir.path().join("restored");
    restore(
        &repo,
        RestoreRequest {
            version_uid: v1.uid,
            target: file_uri(&target),
            ..Default::default()
        },
    )
    .unwrap();
    let restored = std::fs::read(&target).unwrap();
    assert_eq!(restored.len() as u64, v1.size);
    // Blocks 1 and 2 are intact.
    assert!(restored[4 * MIB as usize..].iter().zip(aab_image()[4 * MIB as usize..].iter()).all(|(a, b)| a == b));
    let block0 = repo.db().block_by_idx(v1.uid, 0).unwrap().unwrap();
    assert!(!block0.valid);
}

#[test]
fn light_scrub_checks_existence_only() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let version = backup_simple(&repo, &source, "vol");

    scrub(&repo, version.uid, 100, None).unwrap();

    // A light scrub does not read data, so flipping a byte goes unnoticed
    // as long as the size is unchanged.
    corrupt_block_object(&dir, &repo, version.uid, 0);
    scrub(&repo, version.uid, 100, None).unwrap();

    // Deleting the data object is noticed.
    let row = repo.db().block_by_idx(version.uid, 2).unwrap().unwrap();
    let path = dir.path().join("objects").join(row.uid.unwrap().storage_key());
    std::fs::remove_file(&path).unwrap();
    let err = scrub(&repo, version.uid, 100, None).unwrap_err();
    assert!(matches!(err, benji::Error::ScrubFailed { .. }));
    assert_eq!(
        repo.version_by_uid(version.uid).unwrap().status,
        VersionStatus::Invalid
    );
}

#[test]
fn full_deep_scrub_revalidates_a_version() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let version = backup_simple(&repo, &source, "vol");

    // Mark a block (and with it the version) invalid even though the
    // stored object is fine.
    let row = repo.db().block_by_idx(version.uid, 0).unwrap().unwrap();
    repo.db().set_block_invalid(row.uid.unwrap()).unwrap();
    assert_eq!(
        repo.version_by_uid(version.uid).unwrap().status,
        VersionStatus::Invalid
    );

    // A sampled deep-scrub may not upgrade the status, even when clean.
    let _ = deep_scrub(&repo, version.uid, 50, None, None);
    assert_eq!(
        repo.version_by_uid(version.uid).unwrap().status,
        VersionStatus::Invalid
    );

    // A full deep-scrub revalidates the block and the version.
    deep_scrub(&repo, version.uid, 100, None, None).unwrap();
    assert_eq!(
        repo.version_by_uid(version.uid).unwrap().status,
        VersionStatus::Valid
    );
    assert!(repo
        .db()
        .block_by_idx(version.uid, 0)
        .unwrap()
        .unwrap()
        .valid);
}

#[test]
fn deep_scrub_with_source_compare() {
    let (dir, repo) = scratch_repository();
    let content = aab_image();
    let source = source_image(&dir, "src", &content);
    let version = backup_simple(&repo, &source, "vol");

    deep_scrub(&repo, version.uid, 100, Some(&file_uri(&source)), None).unwrap();

    // A changed source is reported but does not invalidate the version:
    // the stored data still matches its checksums.
    let mut changed = content;
    changed[0] ^= 0xFF;
    std::fs::write(&source, &changed).unwrap();
    deep_scrub(&repo, version.uid, 100, Some(&file_uri(&source)), None).unwrap();
    assert_eq!(
        repo.version_by_uid(version.uid).unwrap().status,
        VersionStatus::Valid
    );
}

#[test]
fn rm_and_cleanup_remove_exactly_the_unshared_objects() {
    let (dir, repo) = scratch_repository();
    // v1 = [A, B], v2 = [A, C]: A is shared.
    let mut v1_content = vec![0xAAu8; 4 * MIB as usize];
    v1_content.extend(std::iter::repeat(0xBB).take(4 * MIB as usize));
    let mut v2_content = vec![0xAAu8; 4 * MIB as usize];
    v2_content.extend(std::iter::repeat(0xCC).take(4 * MIB as usize));

    let src1 = source_image(&dir, "src1", &v1_content);
    let src2 = source_image(&dir, "src2", &v2_content);
    let v1 = backup_simple(&repo, &src1, "vol1");
    let v2 = backup_simple(&repo, &src2, "vol2");

    let storage = repo.storage(None).unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 3);

    cleanup::rm(&repo, v1.uid, true, false, false).unwrap();
    // Grace window is zero in the test configuration.
    cleanup::cleanup(&repo, None, false).unwrap();

    // Only B is gone; the shared A and v2's C survive.
    assert_eq!(storage.block_object_count().unwrap(), 2);
    let remaining: Vec<_> = repo
        .db()
        .block_iter(v2.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    for row in remaining {
        let (_, metadata) = storage.read_block(row.uid.unwrap(), false).unwrap();
        assert_eq!(metadata.checksum, row.checksum);
    }

    // Cleanup is idempotent.
    cleanup::cleanup(&repo, None, false).unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 2);
}

#[test]
fn rm_refuses_protected_versions() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let version = backup_simple(&repo, &source, "vol");

    repo.protect(version.uid, true).unwrap();
    let err = cleanup::rm(&repo, version.uid, true, false, false).unwrap_err();
    assert!(matches!(err, benji::Error::PolicyViolation { .. }));

    repo.protect(version.uid, false).unwrap();
    cleanup::rm(&repo, version.uid, true, false, false).unwrap();
}

#[test]
fn full_cleanup_sweeps_orphans() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    backup_simple(&repo, &source, "vol");

    // Drop an orphan object pair onto the storage.
    let storage = repo.storage(None).unwrap();
    storage
        .write_block(
            benji::BlockUid::new(999, 999),
            &"ee".repeat(32),
            vec![1u8; 64],
        )
        .unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 3);

    cleanup::cleanup_full(&repo, None, false).unwrap();
    assert_eq!(storage.block_object_count().unwrap(), 2);
}
