//! Run history and discrepancy summary.

use console::style;

use crate::config::Settings;
use crate::models::RunStatus;
use crate::reports;
use crate::store::ParcelStore;

pub fn cmd_status(settings: &Settings, region: Option<&str>) -> anyhow::Result<()> {
    let store = ParcelStore::open(&settings.database_path)?;

    let runs = store.runs(region)?;
    if runs.is_empty() {
        println!("no runs recorded");
        return Ok(());
    }

    println!("{}", style("recent runs").bold());
    for run in runs.iter().take(20) {
        let marker = match run.status {
            RunStatus::Done => style("✓").green(),
            RunStatus::Skipped => style("-").yellow(),
            RunStatus::Failed => style("✗").red(),
        };
        println!(
            "{marker} {} [{}] {}: +{} ~{} ={} stored {}/{}{}",
            run.finished_at.format("%Y-%m-%d %H:%M"),
            &run.run_id[..8.min(run.run_id.len())],
            run.region,
            run.inserted,
            run.updated,
            run.skipped,
            run.stored_count,
            run.geometry_total,
            run.failure
                .as_deref()
                .map(|f| format!(" ({f})"))
                .unwrap_or_default(),
        );
    }

    if let Some(region) = region {
        if let Some(report) = store.latest_report(region)? {
            println!();
            println!(
                "last verification: {} (mismatch rate {:.2}%)",
                report.status.as_str(),
                report.mismatch_rate * 100.0
            );
        }
    } else {
        println!();
        reports::render_discrepancy_summary(&store)?;
    }
    Ok(())
}
