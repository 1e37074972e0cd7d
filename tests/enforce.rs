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

//! Retention enforcement end to end.

mod common;

use common::*;

use time::{Duration, OffsetDateTime};

use benji::database::NewVersion;
use benji::version::{VersionStatus, VersionUid};

/// Insert a bare valid version with a given age in days.
fn aged_version(repo: &benji::Repository, volume: &str, age_days: i64) -> VersionUid {
    let storage_id = repo.storage(None).unwrap().id();
    let version = repo
        .db()
        .create_version(NewVersion {
            uid: None,
            date: Some(OffsetDateTime::now_utc() - Duration::days(age_days)),
            volume: volume.to_owned(),
            snapshot: String::new(),
            size: 0,
            block_size: 4 * MIB as u32,
            storage_id,
            status: VersionStatus::Valid,
            protected: false,
        })
        .unwrap();
    version.uid
}

#[test]
fn latest_and_days_policy_keeps_five_of_ten() {
    let (_dir, repo) = scratch_repository();
    // Ten versions on successive days, youngest today.
    let uids: Vec<VersionUid> = (0..10).map(|i| aged_version(&repo, "vol", i)).collect();

    let removed = repo.enforce(None, "latest2,days5", false, false).unwrap();
    assert_eq!(removed.len(), 5);

    let kept: Vec<VersionUid> = repo
        .versions_with_filter(None)
        .unwrap()
        .iter()
        .map(|v| v.uid)
        .collect();
    assert_eq!(kept.len(), 5);
    // The two youngest survive.
    assert!(kept.contains(&uids[0]));
    assert!(kept.contains(&uids[1]));
    // The oldest are gone.
    assert!(!kept.contains(&uids[9]));
}

#[test]
fn enforce_is_idempotent() {
    let (_dir, repo) = scratch_repository();
    for i in 0..10 {
        aged_version(&repo, "vol", i);
    }
    repo.enforce(None, "latest2,days5", false, false).unwrap();
    let kept_after_first: Vec<VersionUid> = repo
        .versions_with_filter(None)
        .unwrap()
        .iter()
        .map(|v| v.uid)
        .collect();
    let removed = repo.enforce(None, "latest2,days5", false, false).unwrap();
    assert!(removed.is_empty());
    let kept_after_second: Vec<VersionUid> = repo
        .versions_with_filter(None)
        .unwrap()
        .iter()
        .map(|v| v.uid)
        .collect();
    assert_eq!(kept_after_first, kept_after_second);
}

#[test]
fn enforce_never_touches_protected_versions() {
    let (_dir, repo) = scratch_repository();
    let old = aged_version(&repo, "vol", 30);
    aged_version(&repo, "vol", 0);
    repo.protect(old, true).unwrap();

    repo.enforce(None, "latest1", false, false).unwrap();
    let kept: Vec<VersionUid> = repo
        .versions_with_filter(None)
        .unwrap()
        .iter()
        .map(|v| v.uid)
        .collect();
    assert!(kept.contains(&old));
}

#[test]
fn enforce_is_scoped_per_volume() {
    let (_dir, repo) = scratch_repository();
    let a = aged_version(&repo, "vol-a", 10);
    let b = aged_version(&repo, "vol-b", 10);

    // latest1 per volume: both single versions survive.
    let removed = repo.enforce(None, "latest1", false, false).unwrap();
    assert!(removed.is_empty());
    let kept: Vec<VersionUid> = repo
        .versions_with_filter(None)
        .unwrap()
        .iter()
        .map(|v| v.uid)
        .collect();
    assert!(kept.contains(&a));
    assert!(kept.contains(&b));
}

#[test]
fn dry_run_removes_nothing() {
    let (_dir, repo) = scratch_repository();
    for i in 0..5 {
        aged_version(&repo, "vol", i);
    }
    let removed = repo.enforce(None, "latest1", true, false).unwrap();
    assert!(removed.is_empty());
    assert_eq!(repo.versions_with_filter(None).unwrap().len(), 5);
}

#[test]
fn enforce_honors_the_filter_expression() {
    let (_dir, repo) = scratch_repository();
    for i in 0..4 {
        aged_version(&repo, "keepme", i + 10);
    }
    for i in 0..4 {
        aged_version(&repo, "other", i + 10);
    }
    repo.enforce(Some("volume == 'other'"), "latest1", false, false)
        .unwrap();
    let versions = repo.versions_with_filter(None).unwrap();
    let keepme = versions.iter().filter(|v| v.volume == "keepme").count();
    let other = versions.iter().filter(|v| v.volume == "other").count();
    assert_eq!(keepme, 4);
    assert_eq!(other, 1);
}
