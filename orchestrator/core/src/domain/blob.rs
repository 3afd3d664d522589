// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Blob Domain Types
//!
//! Content-addressed blobs are identified by the lowercase hex SHA-1 of
//! their bytes. The identifier is validated on construction so every
//! `BlobId` in the system can be used directly as a file name.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Blob identity, metadata and cache errors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use thiserror::Error;

/// SHA-1 digest of a blob, lowercase hex (40 chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    pub fn parse(value: &str) -> Result<Self, BlobError> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() != 40 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::InvalidId(value));
        }
        Ok(Self(value))
    }

    /// Digest of an in-memory buffer
    pub fn digest(data: &[u8]) -> Self {
        Self(hex::encode(Sha1::digest(data)))
    }

    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard directory the blob lives under
    pub fn bucket(&self) -> &str {
        &self.0[..2]
    }

    /// Numeric bucket index used to serialize mutation per shard
    pub fn bucket_index(&self) -> usize {
        u8::from_str_radix(self.bucket(), 16).unwrap_or(0) as usize
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobId {
    type Error = BlobError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobId> for String {
    fn from(id: BlobId) -> Self {
        id.0
    }
}

/// Persisted metadata stored next to every blob payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMeta {
    pub id: BlobId,
    pub size: u64,
    pub create_time: DateTime<Utc>,
    pub access_time: DateTime<Utc>,
    /// Do-not-delete: protected from space-pressure eviction
    #[serde(default)]
    pub dnd: bool,
}

impl BlobMeta {
    pub fn new(id: BlobId, size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            size,
            create_time: now,
            access_time: now,
            dnd: false,
        }
    }

    pub fn touch(&mut self) {
        self.access_time = Utc::now();
    }
}

/// Read-only presence check used by task integrity validation
pub trait BlobIndex: Send + Sync {
    fn contains_blob(&self, id: &BlobId) -> bool;
}

/// Which artifact of a task a blob represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Preview,
    Render,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Preview => "preview",
            ResultKind::Render => "render",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "preview" => Some(ResultKind::Preview),
            "render" => Some(ResultKind::Render),
            _ => None,
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Invalid blob id: {0}")]
    InvalidId(String),

    #[error("Blob not found: {0}")]
    NotFound(BlobId),

    #[error("Digest mismatch: declared {declared}, computed {computed}")]
    DigestMismatch { declared: BlobId, computed: BlobId },

    #[error("Size mismatch for {id}: declared {declared} bytes, received {received}")]
    SizeMismatch {
        id: BlobId,
        declared: u64,
        received: u64,
    },

    #[error("Insufficient space: required {required} bytes, available {available}")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("Blob {0} is linked into an active workspace")]
    Pinned(BlobId),

    #[error("Invalid workspace path: {0}")]
    InvalidPath(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}
