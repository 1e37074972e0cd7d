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

//! Crate-wide error type.

use thiserror::Error;

/// Any error surfaced by the engine.
///
/// Block-level integrity problems found during restore or deep-scrub are not
/// errors in this sense: they are converted into state updates (the block and
/// every referencing version are marked invalid) and the operation continues.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("storage error on {key}: {reason}")]
    Storage { key: String, reason: String },

    #[error("integrity error on {subject}: {reason}")]
    StorageIntegrity { subject: String, reason: String },

    #[error("lock {scope}:{name} is held by {owner}: {reason}")]
    LockConflict {
        scope: String,
        name: String,
        owner: String,
        reason: String,
    },

    #[error("{reason}")]
    PolicyViolation { reason: String },

    #[error("block size mismatch: base version uses {base} bytes, requested {requested} bytes")]
    BlockSizeMismatch { base: u32, requested: u32 },

    #[error("source is smaller than the base version ({source_size} < {base_size} bytes)")]
    SourceTooSmall { source_size: u64, base_size: u64 },

    #[error("base version {uid} is unusable: {reason}")]
    BaseInvalid { uid: String, reason: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("transform {name} failed: {reason}")]
    Transform { name: String, reason: String },

    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("scrub of version {uid} failed")]
    ScrubFailed { uid: String },

    #[error("database error: {source}")]
    Database {
        #[from]
        source: rusqlite::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("OpenSSL error: {source}")]
    Crypto {
        #[from]
        source: openssl::error::ErrorStack,
    },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl Error {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Error {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Error {
        Error::Config {
            reason: reason.into(),
        }
    }

    pub(crate) fn internal(reason: impl Into<String>) -> Error {
        Error::Internal {
            reason: reason.into(),
        }
    }

    pub(crate) fn integrity(subject: impl Into<String>, reason: impl Into<String>) -> Error {
        Error::StorageIntegrity {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that describe corrupt or missing stored data rather
    /// than an environmental failure.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Error::StorageIntegrity { .. } | Error::Transform { .. }
        )
    }
}
