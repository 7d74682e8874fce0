//! Cadastre - municipal parcel record reconciliation and matching system.
//!
//! Ingests per-region property records from three partially-overlapping
//! sources (geometry, authoritative attributes, supplemental attributes) and
//! reconciles them into a single deduplicated record store. Re-runnable: a
//! verification protocol re-checks every region after each run so that no
//! previously-correct region can regress silently.

pub mod cli;
pub mod config;
pub mod error;
pub mod geocode;
pub mod geometry;
pub mod matcher;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod readers;
pub mod reconcile;
pub mod reports;
pub mod store;
pub mod verify;

pub use config::Settings;
pub use error::{PipelineError, RegionError, StoreError};
pub use models::{
    MatchCandidate, MatchStrategy, ParcelRecord, RegionImportRun, RunStatus, SourceDataset,
    SourceKind, UpsertStats, VerificationReport, VerificationStatus,
};
pub use orchestrator::{BatchControl, BatchController, Orchestrator};
pub use store::ParcelStore;
