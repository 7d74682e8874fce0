//! Canonical parcel records with per-field provenance.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SourceKind;

/// Attribute fields reconciled across sources.
///
/// The geometry and address live on the record itself; everything here is
/// subject to the authoritative > supplemental > existing priority rule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AttributeField {
    OwnerName,
    CoOwnerName,
    MailingAddress,
    AssessedValue,
    AppraisedValue,
    Zoning,
    LandUse,
    YearBuilt,
    LivingArea,
    LastSalePrice,
    LastSaleDate,
}

impl AttributeField {
    pub const ALL: [AttributeField; 11] = [
        AttributeField::OwnerName,
        AttributeField::CoOwnerName,
        AttributeField::MailingAddress,
        AttributeField::AssessedValue,
        AttributeField::AppraisedValue,
        AttributeField::Zoning,
        AttributeField::LandUse,
        AttributeField::YearBuilt,
        AttributeField::LivingArea,
        AttributeField::LastSalePrice,
        AttributeField::LastSaleDate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnerName => "owner_name",
            Self::CoOwnerName => "co_owner_name",
            Self::MailingAddress => "mailing_address",
            Self::AssessedValue => "assessed_value",
            Self::AppraisedValue => "appraised_value",
            Self::Zoning => "zoning",
            Self::LandUse => "land_use",
            Self::YearBuilt => "year_built",
            Self::LivingArea => "living_area",
            Self::LastSalePrice => "last_sale_price",
            Self::LastSaleDate => "last_sale_date",
        }
    }
}

/// A reconciled parcel record.
///
/// Invariant: `(identifier, region)` is globally unique. Identifiers are NOT
/// unique across regions - the same identifier string in two regions is two
/// distinct parcels and must never be merged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelRecord {
    /// Parcel identifier, unique only within its region.
    pub identifier: String,
    /// Region (administrative jurisdiction) this parcel belongs to.
    pub region: String,
    /// Geometry in well-known text, always from the geometry source.
    pub geometry_wkt: String,
    /// WGS84 centroid latitude.
    pub latitude: f64,
    /// WGS84 centroid longitude.
    pub longitude: f64,
    /// Site address as it appeared in the winning source.
    pub raw_address: Option<String>,
    /// Canonicalized street address used for matching.
    pub normalized_address: Option<String>,
    /// Unit/apartment designator stripped during normalization.
    pub unit: Option<String>,
    /// Reconciled attribute values.
    pub attributes: BTreeMap<AttributeField, String>,
    /// Which source last wrote each attribute field.
    pub provenance: BTreeMap<AttributeField, SourceKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ParcelRecord {
    /// Compare everything except timestamps. Used by the upsert store to
    /// classify a re-written record as unchanged (skip) vs updated.
    pub fn same_content(&self, other: &ParcelRecord) -> bool {
        self.identifier == other.identifier
            && self.region == other.region
            && self.geometry_wkt == other.geometry_wkt
            && self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.raw_address == other.raw_address
            && self.normalized_address == other.normalized_address
            && self.unit == other.unit
            && self.attributes == other.attributes
            && self.provenance == other.provenance
    }

    /// Value of one attribute field, if populated.
    pub fn attribute(&self, field: AttributeField) -> Option<&str> {
        self.attributes.get(&field).map(|s| s.as_str())
    }
}
