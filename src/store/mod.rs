//! Record store: idempotent parcel persistence plus run history.
//!
//! Parcels are keyed by `(identifier, region)`; the uniqueness constraint on
//! that pair is the store's sole concurrency guard. The upsert path loads the
//! target region's identifier set up front to classify inserts vs updates,
//! writes in bounded chunks inside transactions, and falls back to row-level
//! conflict-safe writes when a bulk chunk hits a uniqueness violation.

mod history;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::{ParcelRecord, SourceDataset, SourceKind, UpsertStats};

/// SQLite-backed parcel store.
pub struct ParcelStore {
    db_path: PathBuf,
}

impl ParcelStore {
    /// Open (and initialize) the store. Failure here is `Unreachable` and
    /// aborts the whole run.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unreachable(format!("{}: {e}", parent.display())))?;
            }
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path)
            .map_err(|e| StoreError::Unreachable(format!("{}: {e}", self.db_path.display())))
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS parcels (
                identifier TEXT NOT NULL,
                region TEXT NOT NULL,
                geometry_wkt TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                raw_address TEXT,
                normalized_address TEXT,
                unit TEXT,
                attributes TEXT NOT NULL,
                provenance TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (identifier, region)
            );
            CREATE INDEX IF NOT EXISTS idx_parcels_region ON parcels(region);

            CREATE TABLE IF NOT EXISTS source_datasets (
                region TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                parsed_at TEXT NOT NULL,
                PRIMARY KEY (region, source_kind)
            );

            CREATE TABLE IF NOT EXISTS import_runs (
                run_id TEXT NOT NULL,
                region TEXT NOT NULL,
                status TEXT NOT NULL,
                inserted INTEGER NOT NULL,
                updated INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                geometry_total INTEGER NOT NULL,
                stored_count INTEGER NOT NULL,
                discrepancy_ratio REAL NOT NULL,
                failure TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                PRIMARY KEY (run_id, region)
            );

            CREATE TABLE IF NOT EXISTS verification_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                region TEXT NOT NULL,
                run_id TEXT,
                checked INTEGER NOT NULL,
                matches INTEGER NOT NULL,
                mismatches INTEGER NOT NULL,
                match_rate REAL NOT NULL,
                mismatch_rate REAL NOT NULL,
                completeness REAL NOT NULL,
                status TEXT NOT NULL,
                generated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_region ON verification_reports(region, id);
        "#,
        )?;
        Ok(())
    }

    /// Identifiers already stored for one region. Never crosses regions.
    pub fn existing_identifiers(&self, region: &str) -> Result<HashSet<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT identifier FROM parcels WHERE region = ?1")?;
        let ids = stmt
            .query_map(params![region], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// One stored record.
    pub fn get(&self, region: &str, identifier: &str) -> Result<Option<ParcelRecord>, StoreError> {
        let conn = self.connect()?;
        Self::get_in_conn(&conn, region, identifier)
    }

    fn get_in_conn(
        conn: &Connection,
        region: &str,
        identifier: &str,
    ) -> Result<Option<ParcelRecord>, StoreError> {
        let mut stmt =
            conn.prepare("SELECT * FROM parcels WHERE region = ?1 AND identifier = ?2")?;
        let record = stmt
            .query_row(params![region, identifier], row_to_record)
            .optional()?;
        Ok(record)
    }

    /// All stored records for one region.
    pub fn get_region(&self, region: &str) -> Result<Vec<ParcelRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT * FROM parcels WHERE region = ?1 ORDER BY identifier")?;
        let records = stmt
            .query_map(params![region], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Stored record count for one region.
    pub fn count(&self, region: &str) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM parcels WHERE region = ?1",
            params![region],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Every region with stored parcels.
    pub fn regions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT DISTINCT region FROM parcels ORDER BY region")?;
        let regions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(regions)
    }

    /// Idempotently persist records for one region.
    ///
    /// Records addressed to a different region are `skipped-foreign-region`
    /// and never written. Records identical to the stored row are skipped so
    /// a byte-identical re-run reports zero inserts and zero updates.
    pub fn upsert(
        &self,
        records: &[ParcelRecord],
        region: &str,
        chunk_size: usize,
    ) -> Result<UpsertStats, StoreError> {
        let chunk_size = chunk_size.max(1);
        let mut existing_ids = self.existing_identifiers(region)?;
        let mut conn = self.connect()?;
        let mut stats = UpsertStats::default();

        for chunk in records.chunks(chunk_size) {
            match Self::write_chunk(&mut conn, region, chunk, &mut existing_ids) {
                Ok(chunk_stats) => stats.merge(chunk_stats),
                Err(e) if e.is_unique_violation() => {
                    warn!(
                        "{region}: uniqueness violation during bulk write, \
                         falling back to row-by-row for {} record(s)",
                        chunk.len()
                    );
                    stats.merge(Self::write_rows_individually(
                        &mut conn,
                        region,
                        chunk,
                        &mut existing_ids,
                    )?);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(
            "{region}: upsert inserted={} updated={} skipped={}",
            stats.inserted,
            stats.updated,
            stats.skipped()
        );
        Ok(stats)
    }

    /// Bulk path: one transaction per chunk, plain INSERT/UPDATE statements.
    fn write_chunk(
        conn: &mut Connection,
        region: &str,
        chunk: &[ParcelRecord],
        existing_ids: &mut HashSet<String>,
    ) -> Result<UpsertStats, StoreError> {
        let mut stats = UpsertStats::default();
        let mut inserted_ids: Vec<String> = Vec::new();

        let tx = conn.transaction()?;
        for record in chunk {
            if record.region != region {
                stats.skipped_foreign_region += 1;
                continue;
            }
            if existing_ids.contains(&record.identifier) {
                let current = Self::get_in_conn(&tx, region, &record.identifier)?;
                match current {
                    Some(current) if current.same_content(record) => {
                        stats.skipped_unchanged += 1;
                    }
                    Some(_) => {
                        update_record(&tx, record)?;
                        stats.updated += 1;
                    }
                    // Classified as existing but gone mid-write: insert.
                    None => {
                        insert_record(&tx, record)?;
                        stats.inserted += 1;
                    }
                }
            } else {
                insert_record(&tx, record)?;
                inserted_ids.push(record.identifier.clone());
                stats.inserted += 1;
            }
        }
        tx.commit()?;

        existing_ids.extend(inserted_ids);
        Ok(stats)
    }

    /// Fallback path: per-row conflict-safe upserts. Guarantees no duplicate
    /// `(identifier, region)` pair regardless of what the bulk pass saw.
    fn write_rows_individually(
        conn: &mut Connection,
        region: &str,
        chunk: &[ParcelRecord],
        existing_ids: &mut HashSet<String>,
    ) -> Result<UpsertStats, StoreError> {
        let mut stats = UpsertStats::default();
        for record in chunk {
            if record.region != region {
                stats.skipped_foreign_region += 1;
                continue;
            }
            let current = Self::get_in_conn(conn, region, &record.identifier)?;
            match current {
                Some(current) if current.same_content(record) => {
                    stats.skipped_unchanged += 1;
                }
                Some(_) => {
                    upsert_record(conn, record)?;
                    stats.updated += 1;
                }
                None => {
                    upsert_record(conn, record)?;
                    existing_ids.insert(record.identifier.clone());
                    stats.inserted += 1;
                }
            }
        }
        Ok(stats)
    }

    /// Record the parsed fingerprint of one source file.
    pub fn record_dataset(&self, dataset: &SourceDataset) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO source_datasets (region, source_kind, fingerprint, row_count, parsed_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(region, source_kind) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                row_count = excluded.row_count,
                parsed_at = excluded.parsed_at
            "#,
            params![
                dataset.region,
                dataset.kind.as_str(),
                dataset.fingerprint,
                dataset.row_count as i64,
                dataset.parsed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Last recorded fingerprint for (region, kind).
    pub fn dataset_fingerprint(
        &self,
        region: &str,
        kind: SourceKind,
    ) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        let fingerprint = conn
            .query_row(
                "SELECT fingerprint FROM source_datasets WHERE region = ?1 AND source_kind = ?2",
                params![region, kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint)
    }

    /// Last recorded geometry-source row count, used as the denominator of
    /// the discrepancy ratio when verifying outside a pipeline pass.
    pub fn geometry_total(&self, region: &str) -> Result<Option<u64>, StoreError> {
        let conn = self.connect()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT row_count FROM source_datasets WHERE region = ?1 AND source_kind = 'geometry'",
                params![region],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.map(|c| c as u64))
    }
}

fn insert_record(conn: &Connection, record: &ParcelRecord) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO parcels (identifier, region, geometry_wkt, latitude, longitude,
                             raw_address, normalized_address, unit, attributes, provenance,
                             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            record.identifier,
            record.region,
            record.geometry_wkt,
            record.latitude,
            record.longitude,
            record.raw_address,
            record.normalized_address,
            record.unit,
            serde_json::to_string(&record.attributes)?,
            serde_json::to_string(&record.provenance)?,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn update_record(conn: &Connection, record: &ParcelRecord) -> Result<(), StoreError> {
    conn.execute(
        r#"
        UPDATE parcels SET
            geometry_wkt = ?3, latitude = ?4, longitude = ?5,
            raw_address = ?6, normalized_address = ?7, unit = ?8,
            attributes = ?9, provenance = ?10, updated_at = ?11
        WHERE identifier = ?1 AND region = ?2
        "#,
        params![
            record.identifier,
            record.region,
            record.geometry_wkt,
            record.latitude,
            record.longitude,
            record.raw_address,
            record.normalized_address,
            record.unit,
            serde_json::to_string(&record.attributes)?,
            serde_json::to_string(&record.provenance)?,
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_record(conn: &Connection, record: &ParcelRecord) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO parcels (identifier, region, geometry_wkt, latitude, longitude,
                             raw_address, normalized_address, unit, attributes, provenance,
                             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(identifier, region) DO UPDATE SET
            geometry_wkt = excluded.geometry_wkt,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            raw_address = excluded.raw_address,
            normalized_address = excluded.normalized_address,
            unit = excluded.unit,
            attributes = excluded.attributes,
            provenance = excluded.provenance,
            updated_at = excluded.updated_at
        "#,
        params![
            record.identifier,
            record.region,
            record.geometry_wkt,
            record.latitude,
            record.longitude,
            record.raw_address,
            record.normalized_address,
            record.unit,
            serde_json::to_string(&record.attributes)?,
            serde_json::to_string(&record.provenance)?,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ParcelRecord> {
    let attributes: String = row.get("attributes")?;
    let provenance: String = row.get("provenance")?;
    Ok(ParcelRecord {
        identifier: row.get("identifier")?,
        region: row.get("region")?,
        geometry_wkt: row.get("geometry_wkt")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        raw_address: row.get("raw_address")?,
        normalized_address: row.get("normalized_address")?,
        unit: row.get("unit")?,
        attributes: serde_json::from_str(&attributes).unwrap_or_default(),
        provenance: serde_json::from_str(&provenance).unwrap_or_default(),
        created_at: parse_datetime(&row.get::<_, String>("created_at")?),
        updated_at: parse_datetime(&row.get::<_, String>("updated_at")?),
    })
}

/// Parse a datetime string from the database, defaulting to Unix epoch on
/// error.
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// Index a region's records by identifier, for reconciliation and
/// verification lookups.
pub fn index_by_identifier(records: Vec<ParcelRecord>) -> HashMap<String, ParcelRecord> {
    records
        .into_iter()
        .map(|r| (r.identifier.clone(), r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttributeField;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(identifier: &str, region: &str, owner: &str) -> ParcelRecord {
        let mut attributes = BTreeMap::new();
        attributes.insert(AttributeField::OwnerName, owner.to_string());
        let mut provenance = BTreeMap::new();
        provenance.insert(AttributeField::OwnerName, SourceKind::Authoritative);
        ParcelRecord {
            identifier: identifier.to_string(),
            region: region.to_string(),
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

    fn store() -> (ParcelStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = ParcelStore::open(&dir.path().join("cadastre.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_insert_then_reload() {
        let (store, _dir) = store();
        let stats = store.upsert(&[record("42", "avon", "SMITH")], "avon", 100).unwrap();
        assert_eq!(stats.inserted, 1);

        let loaded = store.get("avon", "42").unwrap().unwrap();
        assert_eq!(loaded.attribute(AttributeField::OwnerName), Some("SMITH"));
        assert_eq!(store.count("avon").unwrap(), 1);
    }

    #[test]
    fn test_idempotent_rerun_is_all_skips() {
        let (store, _dir) = store();
        let records = vec![record("1", "avon", "SMITH"), record("2", "avon", "JONES")];
        let first = store.upsert(&records, "avon", 100).unwrap();
        assert_eq!(first.inserted, 2);

        let second = store.upsert(&records, "avon", 100).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped_unchanged, 2);
        assert_eq!(store.count("avon").unwrap(), 2);
    }

    #[test]
    fn test_update_on_changed_content() {
        let (store, _dir) = store();
        store.upsert(&[record("1", "avon", "SMITH")], "avon", 100).unwrap();
        let stats = store.upsert(&[record("1", "avon", "JONES")], "avon", 100).unwrap();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.inserted, 0);
        let loaded = store.get("avon", "1").unwrap().unwrap();
        assert_eq!(loaded.attribute(AttributeField::OwnerName), Some("JONES"));
    }

    #[test]
    fn test_cross_region_isolation() {
        let (store, _dir) = store();
        store.upsert(&[record("42", "avon", "SMITH")], "avon", 100).unwrap();
        store.upsert(&[record("42", "bethel", "JONES")], "bethel", 100).unwrap();

        // Two distinct records, never merged or overwritten.
        let avon = store.get("avon", "42").unwrap().unwrap();
        let bethel = store.get("bethel", "42").unwrap().unwrap();
        assert_eq!(avon.attribute(AttributeField::OwnerName), Some("SMITH"));
        assert_eq!(bethel.attribute(AttributeField::OwnerName), Some("JONES"));
        assert_eq!(store.count("avon").unwrap(), 1);
        assert_eq!(store.count("bethel").unwrap(), 1);
    }

    #[test]
    fn test_foreign_region_records_are_skipped() {
        let (store, _dir) = store();
        let stats = store
            .upsert(&[record("42", "bethel", "JONES")], "avon", 100)
            .unwrap();
        assert_eq!(stats.skipped_foreign_region, 1);
        assert_eq!(stats.inserted, 0);
        assert_eq!(store.count("avon").unwrap(), 0);
        assert_eq!(store.count("bethel").unwrap(), 0);
    }

    #[test]
    fn test_duplicate_identifiers_in_one_batch_do_not_duplicate() {
        let (store, _dir) = store();
        // Same (identifier, region) twice in one upsert: the constraint
        // trips in the bulk path and the row fallback absorbs it.
        let records = vec![record("1", "avon", "SMITH"), record("1", "avon", "SMITH B")];
        let stats = store.upsert(&records, "avon", 100).unwrap();
        assert_eq!(store.count("avon").unwrap(), 1);
        assert_eq!(stats.inserted + stats.updated + stats.skipped(), 2);
    }

    #[test]
    fn test_chunked_writes() {
        let (store, _dir) = store();
        let records: Vec<ParcelRecord> = (0..25)
            .map(|i| record(&format!("p{i}"), "avon", "OWNER"))
            .collect();
        let stats = store.upsert(&records, "avon", 10).unwrap();
        assert_eq!(stats.inserted, 25);
        assert_eq!(store.count("avon").unwrap(), 25);
    }

    #[test]
    fn test_dataset_fingerprints() {
        let (store, _dir) = store();
        let dataset = SourceDataset::new("avon", SourceKind::Geometry, b"content", 10);
        store.record_dataset(&dataset).unwrap();
        assert_eq!(
            store.dataset_fingerprint("avon", SourceKind::Geometry).unwrap(),
            Some(dataset.fingerprint.clone())
        );
        assert_eq!(store.dataset_fingerprint("avon", SourceKind::Supplemental).unwrap(), None);
        assert_eq!(store.geometry_total("avon").unwrap(), Some(10));
    }

    #[test]
    fn test_regions_listing() {
        let (store, _dir) = store();
        store.upsert(&[record("1", "bethel", "X")], "bethel", 100).unwrap();
        store.upsert(&[record("1", "avon", "X")], "avon", 100).unwrap();
        assert_eq!(store.regions().unwrap(), vec!["avon", "bethel"]);
    }
}
