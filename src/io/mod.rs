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

//! Source and destination I/O.
//!
//! An adapter reads and writes a raw image as ordered fixed-size blocks.
//! Selection is by URI scheme: `file:` is built in; `rbd`, `rbdaio`, and
//! `iscsi` are declared interfaces that plug in behind the same capability
//! set. Adapters must be usable from multiple reader threads at once.

pub mod file;

use serde::Deserialize;
use url::Url;

use crate::config::ModuleSpec;
use crate::errors::Error;
use crate::Result;

pub trait Io: Send + Sync {
    /// Adapter name for log messages, e.g. `file`.
    fn name(&self) -> &str;

    /// Sanitized form of the URI, safe to log (no credentials).
    fn display_uri(&self) -> String;

    /// Size of the source in bytes.
    fn size(&self) -> Result<u64>;

    /// Prepare the target for writing `size` bytes. Refuses existing
    /// non-empty targets unless `force`. With `sparse`, thin targets are
    /// discarded over the whole extent first so sparse skips leave regions
    /// unmapped.
    fn open_write(&self, size: u64, force: bool, sparse: bool) -> Result<()>;

    /// Read `length` bytes at `idx * block_size`.
    fn read_block(&self, idx: u64, length: usize) -> Result<Vec<u8>>;

    /// Write a block's payload at `idx * block_size`.
    fn write_block(&self, idx: u64, data: &[u8]) -> Result<()>;

    /// Deallocate a byte range on thin targets. A no-op where unsupported.
    fn discard(&self, offset: u64, length: u64) -> Result<()>;

    /// Reader worker count for this adapter.
    fn simultaneous_reads(&self) -> usize;
}

/// Open an adapter for a URI like `file:/path/to/image`. Anything that does
/// not parse as a URL is treated as a local file path.
pub fn open(
    uri: &str,
    block_size: u32,
    ios: &[ModuleSpec],
) -> Result<Box<dyn Io>> {
    let (scheme, rest) = match Url::parse(uri) {
        // A one-letter scheme is probably a Windows drive letter, not a URL.
        Ok(url) if url.scheme().len() > 1 => {
            (url.scheme().to_owned(), url.path().to_owned())
        }
        _ => ("file".to_owned(), uri.to_owned()),
    };
    let spec = ios.iter().find(|s| s.name == scheme);
    let module = spec.map_or(scheme.as_str(), |s| s.module.as_str());
    match module {
        "file" => Ok(Box::new(file::FileIo::new(&rest, block_size, spec)?)),
        "rbd" | "rbdaio" | "iscsi" => Err(Error::config(format!(
            "I/O module {:?} is not built into this binary",
            module
        ))),
        other => Err(Error::config(format!("unknown I/O module {:?}", other))),
    }
}

/// One element of a hints file: a changed (`exists`) or known-sparse region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hint {
    pub offset: u64,
    pub length: u64,
    pub exists: bool,
}

/// Parse a hints document: a JSON list of `{"offset", "length", "exists"}`
/// where `exists` is the string `"true"`/`"false"` (as emitted by
/// `rbd diff --format=json`) or a plain boolean.
pub fn parse_hints(raw: &str) -> Result<Vec<Hint>> {
    #[derive(Deserialize)]
    struct RawHint {
        offset: u64,
        length: u64,
        exists: serde_json::Value,
    }
    let raw_hints: Vec<RawHint> = serde_json::from_str(raw)?;
    raw_hints
        .into_iter()
        .map(|h| {
            let exists = match &h.exists {
                serde_json::Value::Bool(b) => *b,
                serde_json::Value::String(s) => s == "true",
                other => {
                    return Err(Error::InvalidInput {
                        reason: format!("hint field \"exists\" has invalid value {}", other),
                    });
                }
            };
            Ok(Hint {
                offset: h.offset,
                length: h.length,
                exists,
            })
        })
        .collect()
}

/// Translate hints into block index sets: blocks that must be read and
/// blocks known to be sparse. A partially covered boundary block of a
/// sparse region must still be read. When an index appears in both sets,
/// reading wins.
pub fn blocks_from_hints(
    hints: &[Hint],
    block_size: u32,
) -> (std::collections::BTreeSet<u64>, std::collections::BTreeSet<u64>) {
    let block_size = u64::from(block_size);
    let mut read_blocks = std::collections::BTreeSet::new();
    let mut sparse_blocks = std::collections::BTreeSet::new();
    for hint in hints {
        if hint.length == 0 {
            continue;
        }
        let start_block = hint.offset / block_size;
        let end_block = (hint.offset + hint.length - 1) / block_size;
        if hint.exists {
            for idx in start_block..=end_block {
                read_blocks.insert(idx);
            }
        } else {
            if hint.offset % block_size > 0 {
                read_blocks.insert(start_block);
            }
            if (hint.offset + hint.length) % block_size > 0 {
                read_blocks.insert(end_block);
            }
            for idx in start_block..=end_block {
                sparse_blocks.insert(idx);
            }
        }
    }
    (read_blocks, sparse_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rbd_diff_format() {
        let raw = r#"[{"offset": 0, "length": 4096, "exists": "true"},
                      {"offset": 4096, "length": 4096, "exists": "false"}]"#;
        let hints = parse_hints(raw).unwrap();
        assert_eq!(hints.len(), 2);
        assert!(hints[0].exists);
        assert!(!hints[1].exists);
        // Plain booleans are accepted too.
        let raw = r#"[{"offset": 0, "length": 1, "exists": true}]"#;
        assert!(parse_hints(raw).unwrap()[0].exists);
        assert!(parse_hints(r#"[{"offset": 0, "length": 1, "exists": 3}]"#).is_err());
    }

    #[test]
    fn hint_block_translation() {
        let hints = [Hint {
            offset: 0,
            length: 4096,
            exists: true,
        }];
        let (read, sparse) = blocks_from_hints(&hints, 4096);
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![0]);
        assert!(sparse.is_empty());

        // A region spanning two blocks marks both.
        let hints = [Hint {
            offset: 4000,
            length: 200,
            exists: true,
        }];
        let (read, _) = blocks_from_hints(&hints, 4096);
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn partial_sparse_boundaries_are_read() {
        // Sparse region starting mid-block: the boundary block must be read.
        let hints = [Hint {
            offset: 2048,
            length: 8192,
            exists: false,
        }];
        let (read, sparse) = blocks_from_hints(&hints, 4096);
        assert_eq!(read.into_iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(sparse.into_iter().collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[test]
    fn aligned_sparse_region_is_not_read() {
        let hints = [Hint {
            offset: 4096,
            length: 8192,
            exists: false,
        }];
        let (read, sparse) = blocks_from_hints(&hints, 4096);
        assert!(read.is_empty());
        assert_eq!(sparse.into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(open("tape:/dev/nst0", 4096, &[]).is_err());
        assert!(open("rbd:pool/image", 4096, &[]).is_err());
    }
}
