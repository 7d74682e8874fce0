//! Field-level reconciliation.
//!
//! Merges a matched geometry row and its attribute rows into one canonical
//! record under strict source priority: an authoritative value wins wherever
//! it is present, a supplemental value only fills fields the authoritative
//! source left empty, and the existing stored value survives when neither
//! new source supplies the field. A populated field is never overwritten
//! with an empty one, regardless of source. Geometry always comes from the
//! geometry source.

use chrono::{DateTime, Utc};

use crate::geometry::Coordinate;
use crate::models::{AttributeField, AttributeRow, GeometryRow, ParcelRecord, SourceKind};
use crate::normalize;

/// Build the canonical record for one parcel.
pub fn reconcile(
    region: &str,
    geometry: &GeometryRow,
    centroid: Coordinate,
    authoritative: Option<&AttributeRow>,
    supplemental: Option<&AttributeRow>,
    existing: Option<&ParcelRecord>,
    now: DateTime<Utc>,
) -> ParcelRecord {
    let mut attributes = std::collections::BTreeMap::new();
    let mut provenance = std::collections::BTreeMap::new();

    for field in AttributeField::ALL {
        let auth_value = authoritative.and_then(|r| r.fields.get(&field));
        let supp_value = supplemental.and_then(|r| r.fields.get(&field));
        let existing_value = existing.and_then(|r| r.attributes.get(&field));

        if let Some(value) = auth_value {
            attributes.insert(field, value.clone());
            provenance.insert(field, SourceKind::Authoritative);
        } else if let Some(value) = supp_value {
            attributes.insert(field, value.clone());
            provenance.insert(field, SourceKind::Supplemental);
        } else if let Some(value) = existing_value {
            attributes.insert(field, value.clone());
            let kept = existing
                .and_then(|r| r.provenance.get(&field).copied())
                .unwrap_or(SourceKind::Supplemental);
            provenance.insert(field, kept);
        }
    }

    // Address follows the same priority; the geometry source's own address
    // ranks below both attribute sources but above the stored value.
    let raw_address = authoritative
        .and_then(|r| r.raw_address.clone())
        .or_else(|| supplemental.and_then(|r| r.raw_address.clone()))
        .or_else(|| geometry.raw_address.clone())
        .or_else(|| existing.and_then(|r| r.raw_address.clone()));
    let normalized = raw_address.as_deref().map(normalize::normalize);

    ParcelRecord {
        identifier: geometry.identifier.clone(),
        region: region.to_string(),
        geometry_wkt: geometry.wkt.clone(),
        latitude: centroid.latitude,
        longitude: centroid.longitude,
        raw_address,
        normalized_address: normalized.as_ref().map(|n| n.street.clone()),
        unit: normalized.and_then(|n| n.unit),
        attributes,
        provenance,
        created_at: existing.map(|r| r.created_at).unwrap_or(now),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Geometry, Xy};
    use std::collections::BTreeMap;

    fn geometry_row() -> GeometryRow {
        GeometryRow {
            identifier: "12-1".to_string(),
            geometry: Geometry::Point(Xy { x: -72.8, y: 41.8 }),
            wkt: "POINT(-72.8 41.8)".to_string(),
            raw_address: Some("12 Main St".to_string()),
            normalized: Some(normalize::normalize("12 Main St")),
            line: 2,
        }
    }

    fn centroid() -> Coordinate {
        Coordinate {
            latitude: 41.8,
            longitude: -72.8,
        }
    }

    fn attr(source: SourceKind, fields: &[(AttributeField, &str)]) -> AttributeRow {
        AttributeRow {
            source,
            identifier: Some("12-1".to_string()),
            raw_address: Some("12 Main St".to_string()),
            normalized: Some(normalize::normalize("12 Main St")),
            fields: fields
                .iter()
                .map(|(f, v)| (*f, v.to_string()))
                .collect(),
            line: 2,
        }
    }

    #[test]
    fn test_authoritative_beats_supplemental() {
        let auth = attr(
            SourceKind::Authoritative,
            &[(AttributeField::OwnerName, "SMITH JOHN")],
        );
        let supp = attr(
            SourceKind::Supplemental,
            &[
                (AttributeField::OwnerName, "SMITH J"),
                (AttributeField::Zoning, "R-1"),
            ],
        );
        let record = reconcile(
            "avon",
            &geometry_row(),
            centroid(),
            Some(&auth),
            Some(&supp),
            None,
            Utc::now(),
        );
        assert_eq!(record.attribute(AttributeField::OwnerName), Some("SMITH JOHN"));
        assert_eq!(
            record.provenance.get(&AttributeField::OwnerName),
            Some(&SourceKind::Authoritative)
        );
        // Supplemental only fills the gap the authoritative source left.
        assert_eq!(record.attribute(AttributeField::Zoning), Some("R-1"));
        assert_eq!(
            record.provenance.get(&AttributeField::Zoning),
            Some(&SourceKind::Supplemental)
        );
    }

    #[test]
    fn test_existing_value_survives_when_sources_are_silent() {
        let auth = attr(
            SourceKind::Authoritative,
            &[(AttributeField::OwnerName, "SMITH JOHN")],
        );
        let mut existing_attributes = BTreeMap::new();
        existing_attributes.insert(AttributeField::YearBuilt, "1962".to_string());
        let mut existing_provenance = BTreeMap::new();
        existing_provenance.insert(AttributeField::YearBuilt, SourceKind::Supplemental);
        let existing = ParcelRecord {
            identifier: "12-1".to_string(),
            region: "avon".to_string(),
            geometry_wkt: "POINT(-72.8 41.8)".to_string(),
            latitude: 41.8,
            longitude: -72.8,
            raw_address: Some("12 Main St".to_string()),
            normalized_address: Some("12 MAIN STREET".to_string()),
            unit: None,
            attributes: existing_attributes,
            provenance: existing_provenance,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let record = reconcile(
            "avon",
            &geometry_row(),
            centroid(),
            Some(&auth),
            None,
            Some(&existing),
            Utc::now(),
        );
        // Neither new source carries YearBuilt: the stored value is kept, it
        // is never blanked.
        assert_eq!(record.attribute(AttributeField::YearBuilt), Some("1962"));
        assert_eq!(
            record.provenance.get(&AttributeField::YearBuilt),
            Some(&SourceKind::Supplemental)
        );
        assert_eq!(record.created_at, existing.created_at);
    }

    #[test]
    fn test_no_blanking_on_empty_sources() {
        // Attribute rows whose fields maps are empty (blank columns) must not
        // erase anything.
        let auth = attr(SourceKind::Authoritative, &[]);
        let mut existing_attributes = BTreeMap::new();
        existing_attributes.insert(AttributeField::OwnerName, "SMITH JOHN".to_string());
        let mut existing_provenance = BTreeMap::new();
        existing_provenance.insert(AttributeField::OwnerName, SourceKind::Authoritative);
        let existing = ParcelRecord {
            identifier: "12-1".to_string(),
            region: "avon".to_string(),
            geometry_wkt: "POINT(-72.8 41.8)".to_string(),
            latitude: 41.8,
            longitude: -72.8,
            raw_address: None,
            normalized_address: None,
            unit: None,
            attributes: existing_attributes,
            provenance: existing_provenance,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let record = reconcile(
            "avon",
            &geometry_row(),
            centroid(),
            Some(&auth),
            None,
            Some(&existing),
            Utc::now(),
        );
        assert_eq!(record.attribute(AttributeField::OwnerName), Some("SMITH JOHN"));
    }

    #[test]
    fn test_geometry_always_from_geometry_source() {
        let auth = attr(SourceKind::Authoritative, &[]);
        let record = reconcile(
            "avon",
            &geometry_row(),
            centroid(),
            Some(&auth),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(record.geometry_wkt, "POINT(-72.8 41.8)");
        assert_eq!(record.latitude, 41.8);
    }

    #[test]
    fn test_unit_split_from_winning_address() {
        let mut auth = attr(SourceKind::Authoritative, &[]);
        auth.raw_address = Some("12 Main St Apt 4".to_string());
        let record = reconcile(
            "avon",
            &geometry_row(),
            centroid(),
            Some(&auth),
            None,
            None,
            Utc::now(),
        );
        assert_eq!(record.normalized_address.as_deref(), Some("12 MAIN STREET"));
        assert_eq!(record.unit.as_deref(), Some("4"));
    }
}
