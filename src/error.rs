//! Error taxonomy for the reconciliation pipeline.
//!
//! Region-local errors (`RegionError`) are contained at the region boundary:
//! they mark one region skipped or failed and let the batch continue. Only
//! store-level or cross-region corruption errors (`PipelineError`) abort the
//! whole run.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::SourceKind;

/// Errors contained at the region boundary.
#[derive(Debug, Error)]
pub enum RegionError {
    /// A required source file is absent. The region is skipped, the batch
    /// continues.
    #[error("required {kind} source for region '{region}' is missing: {}", path.display())]
    SourceMissing {
        region: String,
        kind: SourceKind,
        path: PathBuf,
    },

    /// The supplemental file's column layout matches no registered mapping.
    /// The region fails with an actionable diagnostic, the batch continues.
    #[error(
        "unrecognized supplemental column layout for region '{region}' in {}: \
         headers [{headers}] match no registered column mapping; register one \
         in the [mappings] config section",
        path.display()
    )]
    ColumnMappingUnknown {
        region: String,
        path: PathBuf,
        headers: String,
    },

    /// A source file exists but cannot be parsed into the expected shape.
    #[error("invalid {kind} source for region '{region}': {message}")]
    SourceInvalid {
        region: String,
        kind: SourceKind,
        message: String,
    },

    /// The region references a coordinate reference system the registry does
    /// not know.
    #[error("region '{region}' references unknown CRS '{code}'")]
    UnknownCrs { region: String, code: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the record store. `Unreachable` is fatal to the whole run.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode record column: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the underlying SQLite error is a uniqueness-constraint
    /// violation, which the upsert path absorbs via row-level fallback.
    pub fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

/// Errors that abort an entire orchestrator run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A previously-verified region no longer verifies cleanly before the
    /// run starts. The run refuses to proceed.
    #[error(
        "pre-run verification failed: region '{region}' was verified but now \
         shows {mismatches} mismatch(es) (rate {mismatch_rate:.4}); refusing to run"
    )]
    PreVerificationFailed {
        region: String,
        mismatches: u64,
        mismatch_rate: f64,
    },

    /// A region unrelated to this run regressed after the run. The store is
    /// left as-is for inspection and the run is reported failed.
    #[error(
        "verification mismatch after run: region '{region}' shows {mismatches} \
         mismatch(es) (rate {mismatch_rate:.4}); run marked failed"
    )]
    VerificationMismatch {
        region: String,
        mismatches: u64,
        mismatch_rate: f64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}
