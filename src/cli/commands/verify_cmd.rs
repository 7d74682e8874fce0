//! Standalone verification command.

use console::style;

use crate::config::Settings;
use crate::models::VerificationStatus;
use crate::store::ParcelStore;
use crate::verify::VerificationEngine;

pub fn cmd_verify(settings: &Settings, region: Option<String>, all: bool) -> anyhow::Result<()> {
    let store = ParcelStore::open(&settings.database_path)?;
    let engine = VerificationEngine::new(&store, settings);

    let reports = match (region, all) {
        (Some(region), _) => vec![engine.verify(&region, None)?],
        (None, true) => engine.verify_all(None)?,
        (None, false) => {
            println!("{} name a region or pass --all", style("✗").red());
            return Ok(());
        }
    };

    let mut failed = false;
    for report in &reports {
        store.record_report(report)?;
        let marker = match report.status {
            VerificationStatus::Verified => style("✓").green(),
            VerificationStatus::Failed => style("✗").red(),
            VerificationStatus::Unverifiable => style("?").yellow(),
        };
        println!(
            "{marker} {}: {} ({} checked, {} mismatched, match rate {:.2}%, completeness {:.1}%)",
            report.region,
            report.status.as_str(),
            report.checked,
            report.mismatches,
            report.match_rate * 100.0,
            report.completeness * 100.0,
        );
        failed |= report.status == VerificationStatus::Failed;
    }

    if failed {
        anyhow::bail!("verification mismatch: zero-mismatch policy breached");
    }
    Ok(())
}
