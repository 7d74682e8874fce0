//! Region import command: the full reconciliation pipeline.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::Settings;
use crate::geocode::HttpGeocoder;
use crate::orchestrator::{AutoContinue, BatchControl, BatchController, Orchestrator};
use crate::reports;
use crate::store::ParcelStore;

/// Prompts the operator for continue/stop at each batch boundary.
struct InteractiveController;

#[async_trait::async_trait]
impl BatchController for InteractiveController {
    async fn checkpoint(&mut self, completed: usize, total: usize) -> BatchControl {
        let term = console::Term::stderr();
        let _ = term.write_str(&format!("batch {completed}/{total} complete, continue? [Y/n] "));
        match term.read_line() {
            Ok(answer) if answer.trim().eq_ignore_ascii_case("n") => BatchControl::Stop,
            Ok(_) => BatchControl::Continue,
            Err(_) => BatchControl::Stop,
        }
    }
}

pub async fn cmd_import(
    settings: &Settings,
    regions: Vec<String>,
    all: bool,
    batch_size: Option<usize>,
    interactive: bool,
    force: bool,
) -> anyhow::Result<()> {
    let regions = if all {
        settings.configured_regions()
    } else {
        regions
    };
    if regions.is_empty() {
        println!(
            "{} no regions given; name regions or pass --all with a [regions] config section",
            style("✗").red()
        );
        return Ok(());
    }

    let mut settings = settings.clone();
    if let Some(batch_size) = batch_size {
        settings.pipeline.batch_size = batch_size;
    }

    let store = ParcelStore::open(&settings.database_path)?;
    let provider = Arc::new(HttpGeocoder::new(
        &settings.geocoder.base_url,
        &settings.geocoder.user_agent,
    )?);
    let orchestrator = Orchestrator::new(&settings, &store, provider)?;

    let spinner = if interactive {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::with_template("{spinner} {msg}").expect("static template"));
        pb.set_message(format!("reconciling {} region(s)", regions.len()));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let report = if interactive {
        let mut controller = InteractiveController;
        orchestrator
            .run_pipeline(&regions, &mut controller, force)
            .await?
    } else {
        let mut controller = AutoContinue;
        orchestrator
            .run_pipeline(&regions, &mut controller, force)
            .await?
    };

    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }
    reports::render_pipeline_report(&report);
    if report.failed {
        anyhow::bail!(
            "run failed: {}",
            report
                .failure_reason
                .as_deref()
                .unwrap_or("verification mismatch")
        );
    }
    Ok(())
}
