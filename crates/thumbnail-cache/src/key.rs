//! Content-addressed thumbnail identity
//!
//! A thumbnail is identified by the frame it depicts, a caller-supplied
//! freshness hash (content checksum, color pipeline hash, ...) and the pixel
//! size it was rendered at. Those three inputs are folded into a single
//! `ThumbnailKey` which is used by both cache tiers and names the file on disk.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

/// Identity of one frame of a media source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId {
    pub source: String,
    pub frame: i64,
}

impl FrameId {
    pub fn new(source: impl Into<String>, frame: i64) -> Self {
        Self {
            source: source.into(),
            frame,
        }
    }

    /// Stable textual key for this frame
    pub fn key(&self) -> String {
        format!("{}@{}", self.source, self.frame)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source, self.frame)
    }
}

/// Opaque, stable key of a cached thumbnail
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThumbnailKey(u64);

impl ThumbnailKey {
    /// Key for a thumbnail of `frame` rendered at `size` pixels
    pub fn new(frame: &FrameId, freshness_hash: u64, size: u32) -> Self {
        Self::digest(&format!("{}/{}/{}", frame.key(), freshness_hash, size))
    }

    /// Key for a thumbnail stored under a caller-chosen name, bypassing frame identity
    pub fn named(name: &str, size: u32) -> Self {
        Self::digest(&format!("{}/{}", name, size))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// 16 lowercase hex digits, the on-disk file stem
    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }

    /// Parse the output of [`ThumbnailKey::to_hex`]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 {
            return None;
        }
        let bytes: [u8; 8] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }

    fn digest(input: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        let result = hasher.finalize();

        let mut head = [0u8; 8];
        head.copy_from_slice(&result[..8]);
        Self(u64::from_be_bytes(head))
    }
}

impl fmt::Display for ThumbnailKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Freshness hash for a file on disk, from its absolute path, size and mtime
///
/// Changes whenever the file is rewritten, so stale thumbnails are never
/// served for an edited source.
pub fn file_freshness_hash(path: &Path) -> anyhow::Result<u64> {
    let metadata = fs::metadata(path)?;
    let absolute_path = path.canonicalize()?;
    let modified_time = metadata.modified()?.duration_since(UNIX_EPOCH)?.as_millis();

    let mut hasher = Sha256::new();
    hasher.update(absolute_path.to_string_lossy().as_bytes());
    hasher.update(metadata.len().to_le_bytes());
    hasher.update(modified_time.to_le_bytes());
    let result = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&result[..8]);
    Ok(u64::from_be_bytes(head))
}

/// Caller-supplied identifier used to cancel a queued request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl JobId {
    /// Allocate a process-unique job id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}
