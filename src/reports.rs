//! Run reporting: console summaries, the per-region unmatched export, and
//! the cross-region discrepancy summary.

use std::io::Write;
use std::path::{Path, PathBuf};

use console::style;

use crate::error::StoreError;
use crate::models::{RunStatus, SourceKind, VerificationStatus};
use crate::orchestrator::PipelineReport;
use crate::store::ParcelStore;

/// One row of the unmatched-records export: an attribute row that ended the
/// run without a geometry association.
#[derive(Debug, Clone)]
pub struct UnmatchedRecord {
    pub source: SourceKind,
    pub line: usize,
    pub identifier: Option<String>,
    pub address: Option<String>,
    pub reason: &'static str,
}

/// Write a region's unmatched export as CSV. Returns the path written, or
/// `None` when there was nothing to export.
pub fn write_unmatched(
    reports_dir: &Path,
    region: &str,
    rows: &[UnmatchedRecord],
) -> std::io::Result<Option<PathBuf>> {
    if rows.is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(reports_dir)?;
    let path = reports_dir.join(format!("{region}-unmatched.csv"));
    let mut file = std::fs::File::create(&path)?;
    writeln!(file, "source,line,identifier,address,reason")?;
    for row in rows {
        writeln!(
            file,
            "{},{},{},{},{}",
            row.source,
            row.line,
            csv_field(row.identifier.as_deref().unwrap_or("")),
            csv_field(row.address.as_deref().unwrap_or("")),
            row.reason,
        )?;
    }
    Ok(Some(path))
}

fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Render a pipeline run to the console: per-region lines, verification
/// results, and the overall verdict. Every run prints a full report even on
/// partial failure.
pub fn render_pipeline_report(report: &PipelineReport) {
    println!();
    println!("{} run {}", style("cadastre").bold(), report.run_id);

    for outcome in &report.outcomes {
        let marker = match outcome.status {
            RunStatus::Done => style("✓").green(),
            RunStatus::Skipped => style("-").yellow(),
            RunStatus::Failed => style("✗").red(),
        };
        let run = &outcome.run;
        match outcome.status {
            RunStatus::Done => println!(
                "{marker} {}: {} inserted, {} updated, {} skipped, {}/{} stored \
                 (discrepancy {:.1}%)",
                outcome.region,
                run.inserted,
                run.updated,
                run.skipped,
                run.stored_count,
                run.geometry_total,
                run.discrepancy_ratio * 100.0,
            ),
            _ => println!(
                "{marker} {}: {} ({})",
                outcome.region,
                outcome.status.as_str(),
                outcome.reason.as_deref().unwrap_or("unknown"),
            ),
        }
        if let Some(path) = &outcome.unmatched_export {
            println!("    unmatched export: {}", path.display());
        }
    }

    for region in &report.pending {
        println!("{} {}: pending (stopped before batch)", style("…").dim(), region);
    }

    if !report.verification.is_empty() {
        println!();
        println!("{}", style("verification").bold());
        for v in &report.verification {
            let marker = match v.status {
                VerificationStatus::Verified => style("✓").green(),
                VerificationStatus::Failed => style("✗").red(),
                VerificationStatus::Unverifiable => style("?").yellow(),
            };
            println!(
                "{marker} {}: {} ({} checked, mismatch rate {:.2}%, completeness {:.1}%)",
                v.region,
                v.status.as_str(),
                v.checked,
                v.mismatch_rate * 100.0,
                v.completeness * 100.0,
            );
        }
    }

    let geocode = &report.geocode;
    if geocode.lookups > 0 {
        println!();
        println!(
            "geocode: {} lookups, {} cache hits, {} provider calls, {} not found",
            geocode.lookups, geocode.cache_hits, geocode.provider_calls, geocode.not_found
        );
    }

    println!();
    if report.failed {
        println!(
            "{} {}",
            style("run failed:").red().bold(),
            report.failure_reason.as_deref().unwrap_or("verification mismatch"),
        );
    } else {
        println!("{}", style("run complete").green().bold());
    }
}

/// Cross-region discrepancy summary from the latest run of each region.
pub fn render_discrepancy_summary(store: &ParcelStore) -> Result<(), StoreError> {
    println!("{}", style("discrepancy summary").bold());
    for region in store.regions()? {
        let Some(run) = store.latest_run(&region)? else {
            continue;
        };
        println!(
            "  {}: {}/{} stored ({:.1}% discrepancy)",
            region,
            run.stored_count,
            run.geometry_total,
            run.discrepancy_ratio * 100.0,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_unmatched() {
        let dir = tempdir().unwrap();
        let rows = vec![
            UnmatchedRecord {
                source: SourceKind::Authoritative,
                line: 7,
                identifier: Some("12-1".to_string()),
                address: Some("12 Main St, Rear".to_string()),
                reason: "geocode-not-found",
            },
            UnmatchedRecord {
                source: SourceKind::Supplemental,
                line: 9,
                identifier: None,
                address: None,
                reason: "no-address",
            },
        ];
        let path = write_unmatched(dir.path(), "avon", &rows).unwrap().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("source,line,identifier,address,reason\n"));
        assert!(content.contains("authoritative,7,12-1,\"12 Main St, Rear\",geocode-not-found"));
        assert!(content.contains("supplemental,9,,,no-address"));
    }

    #[test]
    fn test_write_unmatched_empty_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = write_unmatched(dir.path(), "avon", &[]).unwrap();
        assert!(path.is_none());
        assert!(!dir.path().join("avon-unmatched.csv").exists());
    }
}
