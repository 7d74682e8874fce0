//! Per-region run statistics and verification reports. Both histories are
//! append-only: a run or report row is never rewritten once recorded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result counts from one upsert pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertStats {
    pub inserted: u64,
    pub updated: u64,
    /// Records identical to what the store already holds.
    pub skipped_unchanged: u64,
    /// Records addressed to a region other than the upsert's target. Never
    /// moved or merged.
    pub skipped_foreign_region: u64,
}

impl UpsertStats {
    pub fn skipped(&self) -> u64 {
        self.skipped_unchanged + self.skipped_foreign_region
    }

    pub fn merge(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped_unchanged += other.skipped_unchanged;
        self.skipped_foreign_region += other.skipped_foreign_region;
    }
}

/// Terminal status of one region in one orchestrator pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Done,
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "done" => Some(Self::Done),
            "skipped" => Some(Self::Skipped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One region's statistics for one orchestrator pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionImportRun {
    pub run_id: String,
    pub region: String,
    pub status: RunStatus,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    /// Total parcels in the geometry source.
    pub geometry_total: u64,
    /// Records stored for the region after the pass.
    pub stored_count: u64,
    /// (geometry_total - stored_count) / geometry_total; data-quality signal.
    pub discrepancy_ratio: f64,
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RegionImportRun {
    pub fn discrepancy_ratio(geometry_total: u64, stored_count: u64) -> f64 {
        if geometry_total == 0 {
            return 0.0;
        }
        (geometry_total as f64 - stored_count as f64) / geometry_total as f64
    }
}

/// Verification outcome for one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Mismatch rate is exactly zero against the authoritative source.
    Verified,
    /// One or more stored fields disagree with the authoritative source.
    Failed,
    /// The authoritative file is no longer available to verify against.
    Unverifiable,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Unverifiable => "unverifiable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "verified" => Some(Self::Verified),
            "failed" => Some(Self::Failed),
            "unverifiable" => Some(Self::Unverifiable),
            _ => None,
        }
    }
}

/// Per-region verification rates against the authoritative source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub region: String,
    /// Run that triggered this report, when verification ran inside a
    /// pipeline pass.
    pub run_id: Option<String>,
    /// Authoritative rows associated with a stored record.
    pub checked: u64,
    pub matches: u64,
    pub mismatches: u64,
    pub match_rate: f64,
    pub mismatch_rate: f64,
    /// stored_count / geometry_total.
    pub completeness: f64,
    pub status: VerificationStatus,
    pub generated_at: DateTime<Utc>,
}
