//! In-memory row shapes produced by the source readers, and the match
//! candidates pairing them.

use std::collections::BTreeMap;

use crate::geometry::Geometry;
use crate::normalize::NormalizedAddress;

use super::{AttributeField, SourceKind};

/// One parsed row from a region's geometry source, in the region's native
/// coordinate reference system.
#[derive(Debug, Clone)]
pub struct GeometryRow {
    pub identifier: String,
    pub geometry: Geometry,
    /// The geometry as it appeared in the file.
    pub wkt: String,
    pub raw_address: Option<String>,
    pub normalized: Option<NormalizedAddress>,
    /// 1-based line in the source file, for diagnostics and exports.
    pub line: usize,
}

/// One parsed row from an attribute source (authoritative or supplemental).
#[derive(Debug, Clone)]
pub struct AttributeRow {
    pub source: SourceKind,
    pub identifier: Option<String>,
    pub raw_address: Option<String>,
    pub normalized: Option<NormalizedAddress>,
    /// Non-empty, canonicalized attribute values keyed by logical field.
    pub fields: BTreeMap<AttributeField, String>,
    /// 1-based line in the source file.
    pub line: usize,
}

impl AttributeRow {
    /// The normalized street string, when the row carried a usable address.
    pub fn street(&self) -> Option<&str> {
        self.normalized.as_ref().map(|n| n.street.as_str())
    }
}

/// The strategy chain, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MatchStrategy {
    /// Exact match on a shared parcel identifier.
    Identifier,
    /// Both addresses reduce to the same normalized string.
    Address,
    /// Edit-distance similarity above the configured threshold.
    Fuzzy,
    /// Geocoded attribute address against the reprojected geometry centroid.
    Spatial,
}

impl MatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identifier => "identifier",
            Self::Address => "address",
            Self::Fuzzy => "fuzzy",
            Self::Spatial => "spatial",
        }
    }
}

/// A (geometry row, attribute row) pairing.
///
/// Invariant: within one matching pass, a geometry row accepts at most one
/// attribute row per source, chosen by the highest-priority successful
/// strategy.
#[derive(Debug, Clone)]
pub struct MatchCandidate {
    pub geometry_idx: usize,
    pub attribute_idx: usize,
    pub source: SourceKind,
    pub strategy: MatchStrategy,
    /// 1.0 for exact strategies, the similarity score for fuzzy matches, and
    /// a radius-scaled score for spatial matches.
    pub confidence: f64,
    /// Great-circle distance in meters, for spatial matches.
    pub distance_m: Option<f64>,
}
