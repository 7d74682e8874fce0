//! Source dataset identity and fingerprinting.
//!
//! Each region is fed by three datasets. A parsed dataset is fingerprinted by
//! content hash so that byte-identical re-runs can be detected and skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The three per-region source kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Parcel boundaries and locations; authoritative for spatial shape only.
    Geometry,
    /// Single source of truth for any attribute field it populates.
    Authoritative,
    /// Looser secondary dataset, used only to fill gaps.
    Supplemental,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Geometry => "geometry",
            Self::Authoritative => "authoritative",
            Self::Supplemental => "supplemental",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "geometry" => Some(Self::Geometry),
            "authoritative" => Some(Self::Authoritative),
            "supplemental" => Some(Self::Supplemental),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed source file for one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDataset {
    pub region: String,
    pub kind: SourceKind,
    /// SHA-256 hash of the file content.
    pub fingerprint: String,
    pub row_count: u64,
    pub parsed_at: DateTime<Utc>,
}

impl SourceDataset {
    pub fn new(region: &str, kind: SourceKind, content: &[u8], row_count: u64) -> Self {
        Self {
            region: region.to_string(),
            kind,
            fingerprint: fingerprint(content),
            row_count,
            parsed_at: Utc::now(),
        }
    }
}

/// Compute the SHA-256 content fingerprint of a source file.
pub fn fingerprint(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}
