//! Append-only run and verification history.

use rusqlite::{params, OptionalExtension};

use crate::error::StoreError;
use crate::models::{
    RegionImportRun, RunStatus, VerificationReport, VerificationStatus,
};

use super::{parse_datetime, ParcelStore};

impl ParcelStore {
    /// Append one region's run statistics. Runs are immutable once written.
    pub fn record_run(&self, run: &RegionImportRun) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO import_runs (run_id, region, status, inserted, updated, skipped,
                                     geometry_total, stored_count, discrepancy_ratio,
                                     failure, started_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                run.run_id,
                run.region,
                run.status.as_str(),
                run.inserted as i64,
                run.updated as i64,
                run.skipped as i64,
                run.geometry_total as i64,
                run.stored_count as i64,
                run.discrepancy_ratio,
                run.failure,
                run.started_at.to_rfc3339(),
                run.finished_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Run history, newest first, optionally filtered by region.
    pub fn runs(&self, region: Option<&str>) -> Result<Vec<RegionImportRun>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM import_runs
             WHERE ?1 IS NULL OR region = ?1
             ORDER BY finished_at DESC, region",
        )?;
        let runs = stmt
            .query_map(params![region], row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Most recent run for one region.
    pub fn latest_run(&self, region: &str) -> Result<Option<RegionImportRun>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM import_runs WHERE region = ?1
             ORDER BY finished_at DESC LIMIT 1",
        )?;
        let run = stmt.query_row(params![region], row_to_run).optional()?;
        Ok(run)
    }

    /// Append a verification report.
    pub fn record_report(&self, report: &VerificationReport) -> Result<(), StoreError> {
        let conn = self.connect()?;
        conn.execute(
            r#"
            INSERT INTO verification_reports (region, run_id, checked, matches, mismatches,
                                              match_rate, mismatch_rate, completeness,
                                              status, generated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                report.region,
                report.run_id,
                report.checked as i64,
                report.matches as i64,
                report.mismatches as i64,
                report.match_rate,
                report.mismatch_rate,
                report.completeness,
                report.status.as_str(),
                report.generated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest verification report for one region.
    pub fn latest_report(&self, region: &str) -> Result<Option<VerificationReport>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM verification_reports WHERE region = ?1
             ORDER BY id DESC LIMIT 1",
        )?;
        let report = stmt.query_row(params![region], row_to_report).optional()?;
        Ok(report)
    }

    /// Regions whose latest report says "verified". These are the regions the
    /// pre-run protocol re-checks before any import may proceed.
    pub fn verified_regions(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT region FROM verification_reports r
            WHERE id = (SELECT MAX(id) FROM verification_reports WHERE region = r.region)
              AND status = 'verified'
            ORDER BY region
            "#,
        )?;
        let regions = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(regions)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegionImportRun> {
    let status: String = row.get("status")?;
    Ok(RegionImportRun {
        run_id: row.get("run_id")?,
        region: row.get("region")?,
        status: RunStatus::from_str(&status).unwrap_or(RunStatus::Failed),
        inserted: row.get::<_, i64>("inserted")? as u64,
        updated: row.get::<_, i64>("updated")? as u64,
        skipped: row.get::<_, i64>("skipped")? as u64,
        geometry_total: row.get::<_, i64>("geometry_total")? as u64,
        stored_count: row.get::<_, i64>("stored_count")? as u64,
        discrepancy_ratio: row.get("discrepancy_ratio")?,
        failure: row.get("failure")?,
        started_at: parse_datetime(&row.get::<_, String>("started_at")?),
        finished_at: parse_datetime(&row.get::<_, String>("finished_at")?),
    })
}

fn row_to_report(row: &rusqlite::Row<'_>) -> rusqlite::Result<VerificationReport> {
    let status: String = row.get("status")?;
    Ok(VerificationReport {
        region: row.get("region")?,
        run_id: row.get("run_id")?,
        checked: row.get::<_, i64>("checked")? as u64,
        matches: row.get::<_, i64>("matches")? as u64,
        mismatches: row.get::<_, i64>("mismatches")? as u64,
        match_rate: row.get("match_rate")?,
        mismatch_rate: row.get("mismatch_rate")?,
        completeness: row.get("completeness")?,
        status: VerificationStatus::from_str(&status).unwrap_or(VerificationStatus::Failed),
        generated_at: parse_datetime(&row.get::<_, String>("generated_at")?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn run(run_id: &str, region: &str, status: RunStatus) -> RegionImportRun {
        RegionImportRun {
            run_id: run_id.to_string(),
            region: region.to_string(),
            status,
            inserted: 5,
            updated: 1,
            skipped: 0,
            geometry_total: 10,
            stored_count: 6,
            discrepancy_ratio: 0.4,
            failure: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    fn report(region: &str, status: VerificationStatus) -> VerificationReport {
        VerificationReport {
            region: region.to_string(),
            run_id: Some("r1".to_string()),
            checked: 6,
            matches: 6,
            mismatches: 0,
            match_rate: 1.0,
            mismatch_rate: 0.0,
            completeness: 0.6,
            status,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_run_history_round_trip() {
        let dir = tempdir().unwrap();
        let store = ParcelStore::open(&dir.path().join("db")).unwrap();

        store.record_run(&run("r1", "avon", RunStatus::Done)).unwrap();
        store.record_run(&run("r1", "bethel", RunStatus::Skipped)).unwrap();

        let all = store.runs(None).unwrap();
        assert_eq!(all.len(), 2);
        let avon = store.runs(Some("avon")).unwrap();
        assert_eq!(avon.len(), 1);
        assert_eq!(avon[0].status, RunStatus::Done);
        assert_eq!(avon[0].stored_count, 6);

        let latest = store.latest_run("bethel").unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Skipped);
    }

    #[test]
    fn test_verified_regions_follow_latest_report() {
        let dir = tempdir().unwrap();
        let store = ParcelStore::open(&dir.path().join("db")).unwrap();

        store.record_report(&report("avon", VerificationStatus::Verified)).unwrap();
        store.record_report(&report("bethel", VerificationStatus::Verified)).unwrap();
        assert_eq!(store.verified_regions().unwrap(), vec!["avon", "bethel"]);

        // A later failed report demotes the region.
        store.record_report(&report("avon", VerificationStatus::Failed)).unwrap();
        assert_eq!(store.verified_regions().unwrap(), vec!["bethel"]);

        let latest = store.latest_report("avon").unwrap().unwrap();
        assert_eq!(latest.status, VerificationStatus::Failed);
    }
}
