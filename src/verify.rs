//! Verification engine: zero-mismatch checking against authoritative
//! sources.
//!
//! A region is "verified" only when every stored record that the
//! authoritative file speaks for agrees with it on every populated field.
//! The engine is record-centric: all authoritative rows associated with a
//! stored record (several tax records can share one parcel) are consulted,
//! and the record matches when at least one of them agrees in full. Any
//! mismatch anywhere is a hard failure, never a warning.

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Settings;
use crate::error::StoreError;
use crate::models::{SourceKind, VerificationReport, VerificationStatus};
use crate::readers;
use crate::store::ParcelStore;

pub struct VerificationEngine<'a> {
    store: &'a ParcelStore,
    settings: &'a Settings,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(store: &'a ParcelStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    /// Verify one region against its authoritative source file.
    ///
    /// A region whose authoritative file is gone is reported `unverifiable`:
    /// it stops counting as verified but does not fail the run by itself.
    pub fn verify(
        &self,
        region: &str,
        run_id: Option<&str>,
    ) -> Result<VerificationReport, StoreError> {
        let stored = self.store.get_region(region)?;
        let stored_count = stored.len() as u64;
        let geometry_total = self.store.geometry_total(region)?.unwrap_or(stored_count);
        let completeness = if geometry_total == 0 {
            0.0
        } else {
            stored_count as f64 / geometry_total as f64
        };

        let path = self.settings.source_path(region, SourceKind::Authoritative);
        let source = match readers::read_authoritative(region, &path) {
            Ok(source) => source,
            Err(e) => {
                warn!("{region}: cannot verify: {e}");
                return Ok(VerificationReport {
                    region: region.to_string(),
                    run_id: run_id.map(|s| s.to_string()),
                    checked: 0,
                    matches: 0,
                    mismatches: 0,
                    match_rate: 0.0,
                    mismatch_rate: 0.0,
                    completeness,
                    status: VerificationStatus::Unverifiable,
                    generated_at: Utc::now(),
                });
            }
        };

        // Stored-record lookup by identifier, then by normalized street.
        let mut by_identifier: HashMap<&str, usize> = HashMap::new();
        let mut by_street: HashMap<&str, usize> = HashMap::new();
        for (idx, record) in stored.iter().enumerate() {
            by_identifier.insert(record.identifier.as_str(), idx);
            if let Some(street) = record.normalized_address.as_deref() {
                by_street.entry(street).or_insert(idx);
            }
        }

        // Associate every authoritative row with the record it speaks for.
        let mut associations: HashMap<usize, Vec<usize>> = HashMap::new();
        for (row_idx, row) in source.rows.iter().enumerate() {
            let record_idx = row
                .identifier
                .as_deref()
                .and_then(|id| by_identifier.get(id))
                .or_else(|| row.street().and_then(|s| by_street.get(s)));
            if let Some(&record_idx) = record_idx {
                associations.entry(record_idx).or_default().push(row_idx);
            }
        }

        let mut matches = 0u64;
        let mut mismatches = 0u64;
        for (&record_idx, row_idxs) in &associations {
            let record = &stored[record_idx];
            let agrees = row_idxs.iter().any(|&row_idx| {
                source.rows[row_idx]
                    .fields
                    .iter()
                    .all(|(field, value)| record.attribute(*field) == Some(value.as_str()))
            });
            if agrees {
                matches += 1;
            } else {
                mismatches += 1;
                warn!(
                    "{region}: stored record {} disagrees with authoritative source",
                    record.identifier
                );
            }
        }

        let checked = matches + mismatches;
        let (match_rate, mismatch_rate) = if checked == 0 {
            (1.0, 0.0)
        } else {
            (
                matches as f64 / checked as f64,
                mismatches as f64 / checked as f64,
            )
        };
        let status = if mismatches == 0 {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Failed
        };

        info!(
            "{region}: verification {} ({checked} checked, {mismatches} mismatched, \
             completeness {completeness:.3})",
            status.as_str()
        );

        Ok(VerificationReport {
            region: region.to_string(),
            run_id: run_id.map(|s| s.to_string()),
            checked,
            matches,
            mismatches,
            match_rate,
            mismatch_rate,
            completeness,
            status,
            generated_at: Utc::now(),
        })
    }

    /// Verify every region with stored parcels.
    pub fn verify_all(
        &self,
        run_id: Option<&str>,
    ) -> Result<Vec<VerificationReport>, StoreError> {
        let mut reports = Vec::new();
        for region in self.store.regions()? {
            reports.push(self.verify(&region, run_id)?);
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{AttributeField, ParcelRecord};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(identifier: &str, owner: &str, value: &str) -> ParcelRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert(AttributeField::OwnerName, owner.to_string());
        attributes.insert(AttributeField::AssessedValue, value.to_string());
        let mut provenance = BTreeMap::new();
        provenance.insert(AttributeField::OwnerName, SourceKind::Authoritative);
        provenance.insert(AttributeField::AssessedValue, SourceKind::Authoritative);
        ParcelRecord {
            identifier: identifier.to_string(),
            region: "avon".to_string(),
            geometry_wkt: "POINT(-72.8 41.8)".to_string(),
            latitude: 41.8,
            longitude: -72.8,
            raw_address: Some("12 Main St".to_string()),
            normalized_address: Some("12 MAIN STREET".to_string()),
            unit: None,
            attributes,
            provenance,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn setup(authoritative: &str) -> (ParcelStore, Settings, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let data_dir = dir.path().join("data");
        std::fs::create_dir_all(data_dir.join("avon")).unwrap();
        std::fs::write(data_dir.join("avon/authoritative.csv"), authoritative).unwrap();
        let settings = Settings::for_root(dir.path());
        let store = ParcelStore::open(&settings.database_path).unwrap();
        (store, settings, dir)
    }

    #[test]
    fn test_clean_region_verifies() {
        let (store, settings, _dir) = setup(
            "PARCEL_ID,PROPERTY_ADDRESS,OWNER_NAME,ASSESSED_VALUE\n\
             1,12 Main St,SMITH,251300\n",
        );
        store.upsert(&[record("1", "SMITH", "251300")], "avon", 100).unwrap();

        let engine = VerificationEngine::new(&store, &settings);
        let report = engine.verify("avon", Some("r1")).unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
        assert_eq!(report.checked, 1);
        assert_eq!(report.mismatches, 0);
        assert_eq!(report.match_rate, 1.0);
    }

    #[test]
    fn test_divergent_field_fails_verification() {
        let (store, settings, _dir) = setup(
            "PARCEL_ID,PROPERTY_ADDRESS,OWNER_NAME,ASSESSED_VALUE\n\
             1,12 Main St,SMITH,251300\n",
        );
        // Stored owner disagrees with the authoritative file.
        store.upsert(&[record("1", "JONES", "251300")], "avon", 100).unwrap();

        let engine = VerificationEngine::new(&store, &settings);
        let report = engine.verify("avon", None).unwrap();
        assert_eq!(report.status, VerificationStatus::Failed);
        assert_eq!(report.mismatches, 1);
        assert!(report.mismatch_rate > 0.0);
    }

    #[test]
    fn test_shared_parcel_rows_need_only_one_agreeing() {
        // Two authoritative rows share the parcel's address; the stored
        // record reconciled from the first. The second must not poison
        // verification.
        let (store, settings, _dir) = setup(
            "PROPERTY_ADDRESS,OWNER_NAME,ASSESSED_VALUE\n\
             12 Main St,SMITH,251300\n\
             12 Main St Unit 2,OTHER,99\n",
        );
        store.upsert(&[record("1", "SMITH", "251300")], "avon", 100).unwrap();

        let engine = VerificationEngine::new(&store, &settings);
        let report = engine.verify("avon", None).unwrap();
        assert_eq!(report.status, VerificationStatus::Verified);
    }

    #[test]
    fn test_missing_file_is_unverifiable() {
        let dir = tempdir().unwrap();
        let settings = Settings::for_root(dir.path());
        let store = ParcelStore::open(&settings.database_path).unwrap();
        store.upsert(&[record("1", "SMITH", "1")], "avon", 100).unwrap();

        let engine = VerificationEngine::new(&store, &settings);
        let report = engine.verify("avon", None).unwrap();
        assert_eq!(report.status, VerificationStatus::Unverifiable);
        assert_eq!(report.checked, 0);
    }
}
