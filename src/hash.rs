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

//! Block fingerprints.
//!
//! Blocks are identified for deduplication by the BLAKE2b hash of their
//! plaintext. The digest length is configurable through the `hashFunction`
//! configuration key and is fixed for the life of a repository: changing it
//! after data exists would orphan every stored block.

use blake2_rfc::blake2b::Blake2b;

use crate::errors::Error;
use crate::Result;

/// Longest digest the blocks table can hold.
pub const MAXIMUM_CHECKSUM_LENGTH: usize = 64;

/// A configured block hash function, e.g. `BLAKE2b,digest_bits=256`.
#[derive(Debug, Clone)]
pub struct BlockHasher {
    digest_bytes: usize,
    spec: String,
}

impl BlockHasher {
    /// Parse a `hashFunction` specification. Only BLAKE2b is supported; the
    /// single recognized argument is `digest_bits`.
    pub fn parse(spec: &str) -> Result<BlockHasher> {
        let mut parts = spec.split(',');
        let name = parts.next().unwrap_or("").trim();
        if !name.eq_ignore_ascii_case("blake2b") {
            return Err(Error::config(format!("unsupported block hash {:?}", name)));
        }
        let mut digest_bits: u32 = 512;
        for arg in parts {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::config(format!("malformed hash argument {:?}", arg)))?;
            match key.trim() {
                "digest_bits" => {
                    digest_bits = value.trim().parse().map_err(|_| {
                        Error::config(format!("digest_bits value {:?} is not a number", value))
                    })?;
                }
                other => {
                    return Err(Error::config(format!("unknown hash argument {:?}", other)));
                }
            }
        }
        if digest_bits == 0 || digest_bits % 8 != 0 {
            return Err(Error::config("digest_bits must be a positive multiple of 8"));
        }
        let digest_bytes = digest_bits as usize / 8;
        if digest_bytes > MAXIMUM_CHECKSUM_LENGTH {
            return Err(Error::config(format!(
                "digest length {} exceeds the maximum of {} bytes",
                digest_bytes, MAXIMUM_CHECKSUM_LENGTH
            )));
        }
        Ok(BlockHasher {
            digest_bytes,
            spec: spec.to_owned(),
        })
    }

    /// Hex digest of a block's plaintext.
    pub fn digest_hex(&self, data: &[u8]) -> String {
        let mut hasher = Blake2b::new(self.digest_bytes);
        hasher.update(data);
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Hex digest of an all-zero block of the given size, precomputed once
    /// per pipeline and compared against to detect sparse blocks.
    pub fn sparse_digest_hex(&self, block_size: u32) -> String {
        self.digest_hex(&vec![0u8; block_size as usize])
    }

    pub fn digest_bytes(&self) -> usize {
        self.digest_bytes
    }

    pub fn spec(&self) -> &str {
        &self.spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_default_spec() {
        let hasher = BlockHasher::parse("BLAKE2b,digest_bits=256").unwrap();
        assert_eq!(hasher.digest_bytes(), 32);
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(BlockHasher::parse("SHA-256").is_err());
        assert!(BlockHasher::parse("BLAKE2b,digest_bits=7").is_err());
        assert!(BlockHasher::parse("BLAKE2b,rounds=3").is_err());
        assert!(BlockHasher::parse("BLAKE2b,digest_bits=1024").is_err());
    }

    #[test]
    fn digest_is_stable() {
        let hasher = BlockHasher::parse("BLAKE2b,digest_bits=256").unwrap();
        let a = hasher.digest_hex(b"hello");
        let b = hasher.digest_hex(b"hello");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, hasher.digest_hex(b"world"));
    }

    #[test]
    fn sparse_digest_matches_zero_block() {
        let hasher = BlockHasher::parse("BLAKE2b,digest_bits=256").unwrap();
        assert_eq!(
            hasher.sparse_digest_hex(4096),
            hasher.digest_hex(&[0u8; 4096])
        );
    }
}
