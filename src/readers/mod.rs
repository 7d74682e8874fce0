//! Source readers: parse the three per-region datasets into common row
//! shapes.
//!
//! The geometry source yields [`GeometryRow`]s in the region's native
//! coordinate reference system; the authoritative and supplemental sources
//! yield [`AttributeRow`]s with canonicalized field values. Every file is
//! fingerprinted on read so unchanged inputs can be detected.

pub mod column_map;
pub mod table;

pub use column_map::{ColumnMapping, MappingRegistry};
pub use table::{Table, TableRow};

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::RegionError;
use crate::geometry::{Crs, Geometry, Xy};
use crate::models::{
    AttributeField, AttributeRow, GeometryRow, SourceDataset, SourceKind,
};
use crate::normalize;

/// Resolved file locations for one region's three sources.
#[derive(Debug, Clone)]
pub struct SourcePaths {
    pub geometry: PathBuf,
    pub authoritative: PathBuf,
    pub supplemental: PathBuf,
}

/// Parsed geometry source: rows plus the reference system they are in.
#[derive(Debug)]
pub struct GeometrySource {
    pub dataset: SourceDataset,
    pub rows: Vec<GeometryRow>,
    pub crs: Crs,
}

/// Parsed attribute source (authoritative or supplemental).
#[derive(Debug)]
pub struct AttributeSource {
    pub dataset: SourceDataset,
    pub rows: Vec<AttributeRow>,
    /// Name of the column mapping used, for supplemental sources.
    pub mapping: Option<String>,
}

const IDENTIFIER_COLUMNS: &[&str] = &["PARCEL_ID", "PIN", "GIS_ID", "MAP_LOT", "ACCOUNT", "UNIQUE_ID", "PID", "ID"];
const WKT_COLUMNS: &[&str] = &["WKT", "GEOMETRY", "THE_GEOM", "SHAPE"];
const LAT_COLUMNS: &[&str] = &["LATITUDE", "LAT"];
const LON_COLUMNS: &[&str] = &["LONGITUDE", "LON", "LNG"];
const EASTING_COLUMNS: &[&str] = &["EASTING", "X"];
const NORTHING_COLUMNS: &[&str] = &["NORTHING", "Y"];
const ADDRESS_COLUMNS: &[&str] = &["PROPERTY_ADDRESS", "SITE_ADDRESS", "ADDRESS", "LOCATION"];
const OWNER_COLUMNS: &[&str] = &["OWNER_NAME", "OWNER", "OWNER_1"];

/// Candidate headers for each authoritative attribute field.
const AUTHORITATIVE_FIELDS: &[(AttributeField, &[&str])] = &[
    (AttributeField::OwnerName, OWNER_COLUMNS),
    (AttributeField::CoOwnerName, &["CO_OWNER", "OWNER_2", "CO_OWNER_NAME"]),
    (AttributeField::MailingAddress, &["MAILING_ADDRESS", "MAIL_ADDR", "OWNER_ADDRESS"]),
    (AttributeField::AssessedValue, &["ASSESSED_VALUE", "ASSESSMENT", "NET_ASSESSMENT"]),
    (AttributeField::AppraisedValue, &["APPRAISED_VALUE", "APPRAISAL"]),
    (AttributeField::Zoning, &["ZONING", "ZONE"]),
    (AttributeField::LandUse, &["LAND_USE", "USE_CODE", "LUC"]),
    (AttributeField::YearBuilt, &["YEAR_BUILT", "AYB", "YR_BUILT"]),
    (AttributeField::LivingArea, &["LIVING_AREA", "GLA", "FINISHED_AREA"]),
    (AttributeField::LastSalePrice, &["SALE_PRICE", "LAST_SALE_PRICE"]),
    (AttributeField::LastSaleDate, &["SALE_DATE", "LAST_SALE_DATE", "SALEDATE"]),
];

/// Canonicalize one raw field value so that equal values from different
/// sources compare equal. Returns `None` for blanks.
pub fn canonical_value(field: AttributeField, raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match field {
        AttributeField::AssessedValue
        | AttributeField::AppraisedValue
        | AttributeField::LastSalePrice => {
            let stripped: String = trimmed
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            match stripped.parse::<f64>() {
                Ok(v) => Some(format!("{}", v.round() as i64)),
                Err(_) => Some(collapse_whitespace(trimmed)),
            }
        }
        AttributeField::YearBuilt => match trimmed.parse::<f64>() {
            Ok(v) => Some(format!("{}", v as i32)),
            Err(_) => Some(collapse_whitespace(trimmed)),
        },
        AttributeField::LivingArea => {
            let stripped: String = trimmed.chars().filter(|c| *c != ',').collect();
            match stripped.parse::<f64>() {
                Ok(v) => Some(format!("{v}")),
                Err(_) => Some(collapse_whitespace(trimmed)),
            }
        }
        _ => Some(collapse_whitespace(trimmed)),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn read_source_file(
    region: &str,
    kind: SourceKind,
    path: &Path,
) -> Result<String, RegionError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RegionError::SourceMissing {
            region: region.to_string(),
            kind,
            path: path.to_path_buf(),
        }),
        Err(e) => Err(RegionError::Io(e)),
    }
}

enum GeometryColumns {
    Wkt(usize),
    LatLon(usize, usize),
    NativeXy(usize, usize),
}

/// Parse a region's geometry source. `region_crs` is the reference system of
/// projected coordinates; files that carry latitude/longitude columns are
/// geographic regardless of the region's grid system.
pub fn read_geometry(
    region: &str,
    path: &Path,
    region_crs: Crs,
) -> Result<GeometrySource, RegionError> {
    let content = read_source_file(region, SourceKind::Geometry, path)?;
    let table = Table::parse(&content).map_err(|e| RegionError::SourceInvalid {
        region: region.to_string(),
        kind: SourceKind::Geometry,
        message: e.to_string(),
    })?;

    let id_idx = table
        .find_column(IDENTIFIER_COLUMNS)
        .ok_or_else(|| RegionError::SourceInvalid {
            region: region.to_string(),
            kind: SourceKind::Geometry,
            message: format!("no parcel identifier column among {IDENTIFIER_COLUMNS:?}"),
        })?;

    let columns = if let Some(wkt) = table.find_column(WKT_COLUMNS) {
        GeometryColumns::Wkt(wkt)
    } else if let (Some(lat), Some(lon)) =
        (table.find_column(LAT_COLUMNS), table.find_column(LON_COLUMNS))
    {
        GeometryColumns::LatLon(lat, lon)
    } else if let (Some(x), Some(y)) = (
        table.find_column(EASTING_COLUMNS),
        table.find_column(NORTHING_COLUMNS),
    ) {
        GeometryColumns::NativeXy(x, y)
    } else {
        return Err(RegionError::SourceInvalid {
            region: region.to_string(),
            kind: SourceKind::Geometry,
            message: "no geometry column: need WKT, latitude/longitude, or easting/northing"
                .to_string(),
        });
    };

    let crs = match columns {
        GeometryColumns::LatLon(..) => Crs::Geographic,
        _ => region_crs,
    };
    let address_idx = table.find_column(ADDRESS_COLUMNS);

    let mut rows = Vec::new();
    for row in &table.rows {
        let Some(identifier) = row.get_non_empty(id_idx) else {
            warn!("{region}: geometry row at line {} has no identifier, skipped", row.line);
            continue;
        };
        let parsed = match &columns {
            GeometryColumns::Wkt(idx) => {
                let text = row.get(*idx);
                match Geometry::parse_wkt(text) {
                    Ok(g) => Some((g, text.trim().to_string())),
                    Err(e) => {
                        warn!("{region}: bad geometry at line {}: {e}", row.line);
                        None
                    }
                }
            }
            GeometryColumns::LatLon(lat_idx, lon_idx) => {
                parse_point(row.get(*lon_idx), row.get(*lat_idx))
            }
            GeometryColumns::NativeXy(x_idx, y_idx) => {
                parse_point(row.get(*x_idx), row.get(*y_idx))
            }
        };
        let Some((geometry, wkt)) = parsed else {
            continue;
        };

        let raw_address = address_idx
            .and_then(|idx| row.get_non_empty(idx))
            .map(|s| s.to_string());
        let normalized = raw_address.as_deref().map(normalize::normalize);

        rows.push(GeometryRow {
            identifier: identifier.to_string(),
            geometry,
            wkt,
            raw_address,
            normalized,
            line: row.line,
        });
    }

    let dataset = SourceDataset::new(region, SourceKind::Geometry, content.as_bytes(), rows.len() as u64);
    Ok(GeometrySource { dataset, rows, crs })
}

fn parse_point(x: &str, y: &str) -> Option<(Geometry, String)> {
    let x: f64 = x.trim().parse().ok()?;
    let y: f64 = y.trim().parse().ok()?;
    Some((Geometry::Point(Xy { x, y }), format!("POINT({x} {y})")))
}

/// Parse a region's authoritative attribute source. Must carry at minimum a
/// property-address column and an owner-name column.
pub fn read_authoritative(region: &str, path: &Path) -> Result<AttributeSource, RegionError> {
    let content = read_source_file(region, SourceKind::Authoritative, path)?;
    let table = Table::parse(&content).map_err(|e| RegionError::SourceInvalid {
        region: region.to_string(),
        kind: SourceKind::Authoritative,
        message: e.to_string(),
    })?;

    let address_idx =
        table
            .find_column(ADDRESS_COLUMNS)
            .ok_or_else(|| RegionError::SourceInvalid {
                region: region.to_string(),
                kind: SourceKind::Authoritative,
                message: format!("no property-address column among {ADDRESS_COLUMNS:?}"),
            })?;
    if table.find_column(OWNER_COLUMNS).is_none() {
        return Err(RegionError::SourceInvalid {
            region: region.to_string(),
            kind: SourceKind::Authoritative,
            message: format!("no owner-name column among {OWNER_COLUMNS:?}"),
        });
    }
    let id_idx = table.find_column(IDENTIFIER_COLUMNS);

    let field_columns: Vec<(AttributeField, usize)> = AUTHORITATIVE_FIELDS
        .iter()
        .filter_map(|(field, candidates)| table.find_column(candidates).map(|idx| (*field, idx)))
        .collect();

    let mut rows = Vec::new();
    for row in &table.rows {
        let identifier = id_idx
            .and_then(|idx| row.get_non_empty(idx))
            .map(|s| s.to_string());
        let raw_address = row.get_non_empty(address_idx).map(|s| s.to_string());
        let normalized = raw_address.as_deref().map(normalize::normalize);

        let mut fields = std::collections::BTreeMap::new();
        for (field, idx) in &field_columns {
            if let Some(value) = canonical_value(*field, row.get(*idx)) {
                fields.insert(*field, value);
            }
        }

        rows.push(AttributeRow {
            source: SourceKind::Authoritative,
            identifier,
            raw_address,
            normalized,
            fields,
            line: row.line,
        });
    }

    let dataset =
        SourceDataset::new(region, SourceKind::Authoritative, content.as_bytes(), rows.len() as u64);
    Ok(AttributeSource {
        dataset,
        rows,
        mapping: None,
    })
}

/// Parse a region's supplemental source, selecting a column mapping by
/// header signature. Returns `Ok(None)` when the region has no supplemental
/// file; an unrecognized signature is a region failure.
pub fn read_supplemental(
    region: &str,
    path: &Path,
    registry: &MappingRegistry,
) -> Result<Option<AttributeSource>, RegionError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = read_source_file(region, SourceKind::Supplemental, path)?;
    let table = Table::parse(&content).map_err(|e| RegionError::SourceInvalid {
        region: region.to_string(),
        kind: SourceKind::Supplemental,
        message: e.to_string(),
    })?;

    let mapping = registry
        .detect(&table)
        .ok_or_else(|| RegionError::ColumnMappingUnknown {
            region: region.to_string(),
            path: path.to_path_buf(),
            headers: table.headers.join(", "),
        })?;

    let address_idx = table
        .column(&mapping.address)
        .expect("detected mapping has address column");
    let id_idx = mapping.identifier.as_deref().and_then(|h| table.column(h));
    let field_columns: Vec<(AttributeField, usize)> = mapping
        .fields
        .iter()
        .filter_map(|(field, header)| table.column(header).map(|idx| (*field, idx)))
        .collect();

    let mut rows = Vec::new();
    for row in &table.rows {
        let identifier = id_idx
            .and_then(|idx| row.get_non_empty(idx))
            .map(|s| s.to_string());
        let raw_address = row.get_non_empty(address_idx).map(|s| s.to_string());
        let normalized = raw_address.as_deref().map(normalize::normalize);

        let mut fields = std::collections::BTreeMap::new();
        for (field, idx) in &field_columns {
            if let Some(value) = canonical_value(*field, row.get(*idx)) {
                fields.insert(*field, value);
            }
        }

        rows.push(AttributeRow {
            source: SourceKind::Supplemental,
            identifier,
            raw_address,
            normalized,
            fields,
            line: row.line,
        });
    }

    let dataset =
        SourceDataset::new(region, SourceKind::Supplemental, content.as_bytes(), rows.len() as u64);
    Ok(Some(AttributeSource {
        dataset,
        rows,
        mapping: Some(mapping.name.clone()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_read_geometry_wkt() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "geometry.csv",
            "PARCEL_ID,WKT,ADDRESS\n12-1,\"POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))\",12 Main St\n",
        );
        let src = read_geometry("avon", &path, Crs::Geographic).unwrap();
        assert_eq!(src.rows.len(), 1);
        assert_eq!(src.rows[0].identifier, "12-1");
        assert_eq!(
            src.rows[0].normalized.as_ref().unwrap().street,
            "12 MAIN STREET"
        );
        assert_eq!(src.dataset.row_count, 1);
    }

    #[test]
    fn test_read_geometry_latlon_is_geographic() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "geometry.csv",
            "PIN,LAT,LON\n7,41.81,-72.83\n",
        );
        let crs = Crs::from_code("EPSG:2234").unwrap();
        let src = read_geometry("avon", &path, crs).unwrap();
        assert_eq!(src.crs, Crs::Geographic);
        match &src.rows[0].geometry {
            Geometry::Point(p) => {
                assert_eq!(p.x, -72.83);
                assert_eq!(p.y, 41.81);
            }
            other => panic!("expected point, got {other:?}"),
        }
    }

    #[test]
    fn test_read_geometry_missing_file() {
        let dir = tempdir().unwrap();
        let err = read_geometry("avon", &dir.path().join("nope.csv"), Crs::Geographic)
            .unwrap_err();
        assert!(matches!(err, RegionError::SourceMissing { .. }));
    }

    #[test]
    fn test_read_geometry_skips_bad_rows() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "geometry.csv",
            "PARCEL_ID,WKT\n1,POINT(1 2)\n,POINT(3 4)\n3,NOT WKT(\n",
        );
        let src = read_geometry("avon", &path, Crs::Geographic).unwrap();
        assert_eq!(src.rows.len(), 1);
    }

    #[test]
    fn test_read_authoritative() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "authoritative.csv",
            "PARCEL_ID,PROPERTY_ADDRESS,OWNER_NAME,ASSESSED_VALUE\n\
             12-1,12 Main St,\"SMITH, JOHN\",\"$251,300\"\n",
        );
        let src = read_authoritative("avon", &path).unwrap();
        let row = &src.rows[0];
        assert_eq!(row.identifier.as_deref(), Some("12-1"));
        assert_eq!(row.fields.get(&AttributeField::OwnerName).unwrap(), "SMITH, JOHN");
        assert_eq!(row.fields.get(&AttributeField::AssessedValue).unwrap(), "251300");
    }

    #[test]
    fn test_read_authoritative_requires_owner() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "authoritative.csv", "PROPERTY_ADDRESS\n12 Main St\n");
        let err = read_authoritative("avon", &path).unwrap_err();
        assert!(matches!(err, RegionError::SourceInvalid { .. }));
    }

    #[test]
    fn test_read_supplemental_unknown_layout() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "supplemental.csv", "FOO,BAR\n1,2\n");
        let err = read_supplemental("avon", &path, &MappingRegistry::builtin()).unwrap_err();
        match err {
            RegionError::ColumnMappingUnknown { headers, .. } => {
                assert!(headers.contains("FOO"));
            }
            other => panic!("expected ColumnMappingUnknown, got {other:?}"),
        }
    }

    #[test]
    fn test_read_supplemental_absent_is_ok() {
        let dir = tempdir().unwrap();
        let result =
            read_supplemental("avon", &dir.path().join("none.csv"), &MappingRegistry::builtin())
                .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_read_supplemental_vision_layout() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "supplemental.csv",
            "PID,LOCATION,OWNER,MAIL_ADDR,ASSESSMENT,APPRAISAL,ZONE,AYB,GLA\n\
             12-1,12 MAIN ST,SMITH JOHN,PO BOX 9,251300,310000,R-1,1962,1840\n",
        );
        let src = read_supplemental("avon", &path, &MappingRegistry::builtin())
            .unwrap()
            .unwrap();
        assert_eq!(src.mapping.as_deref(), Some("vision-export"));
        let row = &src.rows[0];
        assert_eq!(row.source, SourceKind::Supplemental);
        assert_eq!(row.fields.get(&AttributeField::Zoning).unwrap(), "R-1");
        assert_eq!(row.fields.get(&AttributeField::YearBuilt).unwrap(), "1962");
    }

    #[test]
    fn test_canonical_value_money() {
        assert_eq!(
            canonical_value(AttributeField::AssessedValue, " $1,250,000 "),
            Some("1250000".to_string())
        );
        assert_eq!(canonical_value(AttributeField::AssessedValue, ""), None);
        assert_eq!(
            canonical_value(AttributeField::OwnerName, "  SMITH   JOHN "),
            Some("SMITH JOHN".to_string())
        );
    }
}
