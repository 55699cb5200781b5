//! Revision: opaque per-write version token assigned by the document store.
//!
//! Rendered as `<generation>-<hash>` (e.g. `3-9f2c4e1a0b7d6c55a1e0f3b2c4d5e6f7`). The generation
//! counts edits along a branch; the hash identifies the edit. Revisions are
//! totally ordered by `(generation, hash)`, which is how every replica picks
//! the same winner among conflicting leaves.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Maximum ancestry length kept per revision.
pub const REVS_LIMIT: usize = 1000;

/// Hex characters of the SHA-256 digest kept in a revision hash.
const HASH_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RevisionError {
    #[error("Invalid revision format: {0}")]
    InvalidFormat(String),
    #[error("Invalid generation: {0}")]
    InvalidGeneration(#[from] std::num::ParseIntError),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    generation: u64,
    hash: String,
}

impl Revision {
    /// Derive the revision for an edit on top of `parent`.
    ///
    /// Same parent plus same body yields the same revision on every replica.
    pub fn next(parent: Option<&Revision>, body: &serde_json::Map<String, serde_json::Value>, deleted: bool) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(serde_json::Value::Object(body.clone()).to_string().as_bytes());
        hasher.update([deleted as u8]);

        Self {
            generation: parent.map(|p| p.generation).unwrap_or(0) + 1,
            hash: truncated_hex(&hasher.finalize()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

/// Hex-encode a digest, keeping the first `HASH_LEN` characters.
fn truncated_hex(digest: &[u8]) -> String {
    let mut hex = hex::encode(digest);
    hex.truncate(HASH_LEN);
    hex
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Revision {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = RevisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionError::InvalidFormat(s.to_string()))?;
        if hash.is_empty() {
            return Err(RevisionError::InvalidFormat(s.to_string()));
        }
        Ok(Self {
            generation: generation.parse()?,
            hash: hash.to_string(),
        })
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How an incoming revision relates to the one we hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionRelation {
    /// Same revision.
    Same,
    /// Incoming revision descends from ours.
    Descendant,
    /// Incoming revision is one of our ancestors (stale).
    Ancestor,
    /// Neither history contains the other.
    Concurrent,
}

/// Compare two revision histories (newest first, each starting with its own revision).
pub fn relation(ours: &[Revision], theirs: &[Revision]) -> RevisionRelation {
    match (ours.first(), theirs.first()) {
        (Some(a), Some(b)) if a == b => RevisionRelation::Same,
        (Some(a), Some(_)) if theirs.contains(a) => RevisionRelation::Descendant,
        (Some(_), Some(b)) if ours.contains(b) => RevisionRelation::Ancestor,
        (None, Some(_)) => RevisionRelation::Descendant,
        _ => RevisionRelation::Concurrent,
    }
}
