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

//! Core identifiers and row types: versions, blocks, and their UIDs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::errors::Error;
use crate::Result;

/// Identifier of a version: a monotonically assigned integer, rendered as
/// `V` followed by the zero-padded value, e.g. `V0000000001`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionUid(pub u64);

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{:010}", self.0)
    }
}

impl FromStr for VersionUid {
    type Err = Error;

    /// Accepts both the `V`-prefixed form and the bare integer.
    fn from_str(s: &str) -> Result<VersionUid> {
        let digits = match s.strip_prefix('V').or_else(|| s.strip_prefix('v')) {
            Some(rest) => rest,
            None => s,
        };
        digits
            .parse::<u64>()
            .map(VersionUid)
            .map_err(|_| Error::InvalidInput {
                reason: format!("version UID {:?} is invalid", s),
            })
    }
}

impl VersionUid {
    /// Object key of this version's metadata backup on a storage.
    pub fn storage_key(&self) -> String {
        format!("versions/{}", self)
    }

    pub fn from_storage_key(key: &str) -> Option<VersionUid> {
        key.strip_prefix("versions/")
            .filter(|rest| rest.len() == 11 && !rest.ends_with(".meta"))
            .and_then(|rest| rest.parse().ok())
    }
}

/// Identifier of a stored object: an opaque pair of integers. The left half
/// is the database id of the version that first wrote the block, the right
/// half its block index plus one, which makes allocation collision-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockUid {
    pub left: u64,
    pub right: u64,
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.left, self.right)
    }
}

impl BlockUid {
    pub fn new(left: u64, right: u64) -> BlockUid {
        BlockUid { left, right }
    }

    /// Object key of the block's data object on a storage. The metadata
    /// sidecar lives at the same key with a `.meta` suffix.
    pub fn storage_key(&self) -> String {
        format!("blocks/{:016x}-{:016x}", self.left, self.right)
    }

    pub fn from_storage_key(key: &str) -> Option<BlockUid> {
        let rest = key.strip_prefix("blocks/")?;
        if rest.len() != 33 || rest.as_bytes().get(16) != Some(&b'-') {
            return None;
        }
        let left = u64::from_str_radix(&rest[..16], 16).ok()?;
        let right = u64::from_str_radix(&rest[17..], 16).ok()?;
        Some(BlockUid { left, right })
    }
}

/// Lifecycle state of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Incomplete,
    Valid,
    Invalid,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Incomplete => "incomplete",
            VersionStatus::Valid => "valid",
            VersionStatus::Invalid => "invalid",
        }
    }

    pub fn parse(s: &str) -> Result<VersionStatus> {
        match s {
            "incomplete" => Ok(VersionStatus::Incomplete),
            "valid" => Ok(VersionStatus::Valid),
            "invalid" => Ok(VersionStatus::Invalid),
            other => Err(Error::InvalidInput {
                reason: format!("unknown version status {:?}", other),
            }),
        }
    }

    pub fn is_valid(&self) -> bool {
        *self == VersionStatus::Valid
    }

    /// Incomplete versions may only be removed with `--force`.
    pub fn is_removable(&self) -> bool {
        *self != VersionStatus::Incomplete
    }

    /// Scrubbing an incomplete version makes no sense: its block list is
    /// still in flux.
    pub fn is_scrubbable(&self) -> bool {
        *self != VersionStatus::Incomplete
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time backup of one source volume.
#[derive(Debug, Clone)]
pub struct Version {
    pub uid: VersionUid,
    pub date: OffsetDateTime,
    pub volume: String,
    pub snapshot: String,
    pub size: u64,
    pub block_size: u32,
    pub storage_id: u32,
    pub status: VersionStatus,
    pub protected: bool,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_deduplicated: u64,
    pub bytes_sparse: u64,
    pub duration: u64,
    pub labels: BTreeMap<String, String>,
}

impl Version {
    /// Number of blocks covering `size` bytes: the last block may be short.
    pub fn blocks_count(&self) -> u64 {
        blocks_count(self.size, self.block_size)
    }
}

pub fn blocks_count(size: u64, block_size: u32) -> u64 {
    debug_assert!(block_size > 0);
    size.div_ceil(u64::from(block_size))
}

/// One cell of a version's content. `uid` and `checksum` are both null iff
/// the block is sparse (known to be all zero, not stored).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub version_uid: VersionUid,
    pub idx: u64,
    pub uid: Option<BlockUid>,
    pub checksum: Option<String>,
    pub size: u32,
    pub valid: bool,
}

impl BlockRow {
    pub fn is_sparse(&self) -> bool {
        self.uid.is_none()
    }
}

/// Volume and snapshot names as well as label names and values are restricted
/// to a conservative character set so they can be used in object keys and
/// expressions without quoting problems.
pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_.:/@+".contains(&b))
}

pub fn is_valid_optional_name(s: &str) -> bool {
    s.is_empty() || is_valid_name(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_uid_round_trip() {
        let uid = VersionUid(1);
        assert_eq!(uid.to_string(), "V0000000001");
        assert_eq!("V0000000001".parse::<VersionUid>().unwrap(), uid);
        assert_eq!("1".parse::<VersionUid>().unwrap(), uid);
        assert!("W1".parse::<VersionUid>().is_err());
        assert!("V".parse::<VersionUid>().is_err());
    }

    #[test]
    fn block_uid_storage_key() {
        let uid = BlockUid::new(1, 2);
        assert_eq!(
            uid.storage_key(),
            "blocks/0000000000000001-0000000000000002"
        );
        assert_eq!(BlockUid::from_storage_key(&uid.storage_key()), Some(uid));
        assert_eq!(BlockUid::from_storage_key("blocks/short"), None);
        assert_eq!(
            BlockUid::from_storage_key("blocks/0000000000000001-0000000000000002.meta"),
            None
        );
    }

    #[test]
    fn version_storage_key() {
        let uid = VersionUid(7);
        assert_eq!(uid.storage_key(), "versions/V0000000007");
        assert_eq!(VersionUid::from_storage_key(&uid.storage_key()), Some(uid));
        assert_eq!(VersionUid::from_storage_key("versions/nope"), None);
    }

    #[test]
    fn blocks_count_rounds_up() {
        assert_eq!(blocks_count(0, 4096), 0);
        assert_eq!(blocks_count(1, 4096), 1);
        assert_eq!(blocks_count(4096, 4096), 1);
        assert_eq!(blocks_count(4097, 4096), 2);
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("data"));
        assert!(is_valid_name("pool/image@snap"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("-leading"));
        assert!(!is_valid_name("space here"));
        assert!(is_valid_optional_name(""));
    }
}
