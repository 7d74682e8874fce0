//! Domain models for parcel reconciliation.

mod parcel;
mod row;
mod run;
mod source;

pub use parcel::{AttributeField, ParcelRecord};
pub use row::{AttributeRow, GeometryRow, MatchCandidate, MatchStrategy};
pub use run::{
    RegionImportRun, RunStatus, UpsertStats, VerificationReport, VerificationStatus,
};
pub use source::{fingerprint, SourceDataset, SourceKind};
