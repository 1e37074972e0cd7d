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

//! Copy-on-write NBD exports and fixation.

mod common;

use common::*;

use benji::nbd::NbdStore;
use benji::version::VersionStatus;
use benji::Result;

#[test]
fn cow_write_and_fixation_create_a_protected_version() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let v1 = backup_simple(&repo, &source, "vol");

    let storage = repo.storage(None).unwrap();
    let objects_before = storage.block_object_count().unwrap();

    let store = NbdStore::new(repo.clone()).unwrap();
    let export = store.open(v1.uid).unwrap();

    // Reads see the original content.
    let head = store.read(&export, None, 0, 16).unwrap();
    assert_eq!(head, vec![0xAA; 16]);

    // Write one byte at offset 0; the read path sees it through the COW
    // store, the original stays untouched.
    let cow = store.create_cow(&export).unwrap();
    store.write(&cow, 0, &[0xFF]).unwrap();
    let head = store.read(&export, Some(&cow), 0, 16).unwrap();
    assert_eq!(head[0], 0xFF);
    assert_eq!(&head[1..], &[0xAA; 15][..]);

    let cow_uid = cow.version.uid;
    store.fixate(cow).unwrap();
    store.close(&export);

    let v2 = repo.version_by_uid(cow_uid).unwrap();
    assert_eq!(v2.status, VersionStatus::Valid);
    assert!(v2.protected);
    assert!(v2.snapshot.starts_with(&format!("nbd-cow-{}-", v1.uid)));
    assert_eq!(v2.blocks_count(), 3);

    let v1_blocks: Vec<_> = repo
        .db()
        .block_iter(v1.uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    let v2_blocks: Vec<_> = repo
        .db()
        .block_iter(cow_uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    // Block 0 is a new stored object; blocks 1 and 2 are inherited.
    assert_ne!(v2_blocks[0].uid, v1_blocks[0].uid);
    assert_eq!(v2_blocks[1].uid, v1_blocks[1].uid);
    assert_eq!(v2_blocks[2].uid, v1_blocks[2].uid);

    // Exactly one new data object was written.
    assert_eq!(storage.block_object_count().unwrap(), objects_before + 1);

    // The original version still restores bit for bit.
    let target = dir.path().join("restored");
    benji::restore::restore(
        &repo,
        benji::restore::RestoreRequest {
            version_uid: v1.uid,
            target: file_uri(&target),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), aab_image());
}

#[test]
fn discarding_cow_changes_leaves_no_trace() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let v1 = backup_simple(&repo, &source, "vol");

    let store = NbdStore::new(repo.clone()).unwrap();
    let export = store.open(v1.uid).unwrap();
    let cow = store.create_cow(&export).unwrap();
    store.write(&cow, 0, &[0xFF; 4096]).unwrap();
    store.discard(cow).unwrap();
    store.close(&export);

    // Only the original version remains.
    let versions = repo.versions_with_filter(None).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].uid, v1.uid);
}

#[test]
fn cow_fixation_turns_zeroed_blocks_sparse() {
    let (dir, repo) = scratch_repository();
    let source = source_image(&dir, "src", &aab_image());
    let v1 = backup_simple(&repo, &source, "vol");

    let store = NbdStore::new(repo.clone()).unwrap();
    let export = store.open(v1.uid).unwrap();
    let cow = store.create_cow(&export).unwrap();
    // Overwrite block 2 entirely with zeros.
    store
        .write(&cow, 2 * 4 * MIB, &vec![0u8; 4 * MIB as usize])
        .unwrap();
    let cow_uid = cow.version.uid;
    store.fixate(cow).unwrap();
    store.close(&export);

    let blocks: Vec<_> = repo
        .db()
        .block_iter(cow_uid)
        .collect::<Result<Vec<_>>>()
        .unwrap();
    assert!(blocks[2].is_sparse());
    assert!(!blocks[0].is_sparse());
}

#[test]
fn reads_beyond_the_content_return_zeros() {
    let (dir, repo) = scratch_repository_with(1024 * 1024, "");
    // Size not aligned to the NBD device granularity.
    let content = vec![0x21u8; 1024 * 1024 + 100];
    let source = source_image(&dir, "src", &content);
    let v1 = backup_simple(&repo, &source, "vol");

    let store = NbdStore::new(repo.clone()).unwrap();
    let export = store.open(v1.uid).unwrap();
    // Read across the boundary of the short last block.
    let data = store
        .read(&export, None, 1024 * 1024, 4096)
        .unwrap();
    assert_eq!(data.len(), 4096);
    assert!(data[..100].iter().all(|&b| b == 0x21));
    assert!(data[100..].iter().all(|&b| b == 0));
    store.close(&export);
}
