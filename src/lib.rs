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

//! Block-level, content-addressed, deduplicating backup engine.
//!
//! Sources (raw block devices or image files) are chunked into fixed-size
//! blocks. Each block is fingerprinted with a cryptographic hash and unique
//! blocks are stored once on an object storage, optionally compressed and
//! encrypted. Per-backup metadata lives in a relational database so any
//! point-in-time version can be restored, scrubbed, or served over NBD.

pub mod backup;
pub mod cleanup;
pub mod config;
pub mod database;
pub mod errors;
pub mod export;
pub mod filter;
pub mod hash;
pub mod io;
pub mod nbd;
pub(crate) mod pool;
pub(crate) mod ratelimit;
pub mod repository;
pub mod restore;
pub mod retention;
pub mod scrub;
pub mod storage;
pub mod transform;
pub mod version;

pub use crate::config::Config;
pub use crate::database::Database;
pub use crate::errors::Error;
pub use crate::repository::Repository;
pub use crate::version::{BlockUid, VersionStatus, VersionUid};

pub type Result<T> = std::result::Result<T, Error>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default block size: 4 MiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Default block fingerprint function.
pub const DEFAULT_HASH_FUNCTION: &str = "BLAKE2b,digest_bits=256";

/// Temporary files written by storage backends have this prefix.
pub(crate) const TMP_PREFIX: &str = "tmp-";

/// Set when `BENJI_EXPERIMENTAL=1` is present in the environment.
pub fn experimental_enabled() -> bool {
    std::env::var("BENJI_EXPERIMENTAL").map_or(false, |v| v == "1")
}
