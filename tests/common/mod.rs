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

//! Shared fixtures for the integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use benji::{Config, Repository};

pub const MIB: u64 = 1024 * 1024;

/// A repository on a fresh temporary directory: file storage, sqlite
/// database, 4 MiB blocks, no transforms.
pub fn scratch_repository() -> (TempDir, Arc<Repository>) {
    scratch_repository_with(4 * MIB as u32, "")
}

pub fn scratch_repository_with(block_size: u32, extra_yaml: &str) -> (TempDir, Arc<Repository>) {
    let dir = TempDir::new().unwrap();
    let yaml = format!(
        r#"
configurationVersion: '1'
databaseEngine: sqlite://{db}
blockSize: {block_size}
disallowRemoveWhenYounger: 0
cleanupGraceMinutes: 0
defaultStorage: local
storages:
  - name: local
    module: file
    configuration:
      path: {objects}
nbd:
  cowStore:
    directory: {cow}
{extra_yaml}
"#,
        db = dir.path().join("benji.sqlite").display(),
        objects = dir.path().join("objects").display(),
        cow = dir.path().join("cow").display(),
    );
    let config = Config::parse(&yaml).unwrap();
    Repository::init_database(&config).unwrap();
    let repo = Repository::open(config).unwrap();
    (dir, Arc::new(repo))
}

/// Write a source image file and return its path.
pub fn source_image(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

pub fn file_uri(path: &Path) -> String {
    format!("file:{}", path.display())
}

/// Three 4 MiB blocks [A, A, B] with A and B non-zero and distinct.
pub fn aab_image() -> Vec<u8> {
    let mut content = vec![0xAAu8; 2 * 4 * MIB as usize];
    content.extend(std::iter::repeat(0xBB).take(4 * MIB as usize));
    content
}

pub fn backup_simple(
    repo: &Arc<Repository>,
    source: &Path,
    volume: &str,
) -> benji::version::Version {
    benji::backup::backup(
        repo,
        benji::backup::BackupRequest {
            source: file_uri(source),
            volume: volume.to_owned(),
            ..Default::default()
        },
    )
    .unwrap()
}
