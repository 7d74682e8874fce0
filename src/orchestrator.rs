//! Region orchestrator.
//!
//! Drives the pipeline across regions in controlled batches. Each region
//! walks PENDING → READING → MATCHING → RECONCILING → PERSISTING →
//! VERIFYING and ends DONE, SKIPPED (required source absent), or FAILED.
//! Failures in one region never roll back or block others; only a
//! store-level error aborts the run. Between batches the orchestrator
//! consumes a typed control signal - continue or stop - from a
//! [`BatchController`], never a disk sentinel.
//!
//! Every run is wrapped in the zero-regression protocol: previously-verified
//! regions are re-checked before anything runs (refusing to start on any
//! mismatch), and after the run every region in the store is re-verified so
//! corruption introduced through shared code paths or shared cache state
//! cannot pass silently.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::error::{PipelineError, RegionError, StoreError};
use crate::geocode::{GeocodeCache, GeocodeProvider, GeocodeService, GeocodeStats};
use crate::matcher::{MatchOutcome, Matcher};
use crate::models::{
    GeometryRow, RegionImportRun, RunStatus, SourceKind, UpsertStats, VerificationReport,
    VerificationStatus,
};
use crate::readers::{self, AttributeSource, MappingRegistry};
use crate::reconcile::reconcile;
use crate::reports::{self, UnmatchedRecord};
use crate::store::{index_by_identifier, ParcelStore};
use crate::verify::VerificationEngine;

/// Typed batch-boundary control input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchControl {
    Continue,
    Stop,
}

/// Supplies the control signal consumed once per batch boundary.
#[async_trait]
pub trait BatchController: Send {
    async fn checkpoint(&mut self, completed_batches: usize, total_batches: usize) -> BatchControl;
}

/// Runs every batch without pausing.
pub struct AutoContinue;

#[async_trait]
impl BatchController for AutoContinue {
    async fn checkpoint(&mut self, _completed: usize, _total: usize) -> BatchControl {
        BatchControl::Continue
    }
}

/// Awaits an external continue/stop signal between batches. A closed channel
/// reads as stop.
pub struct ChannelController {
    receiver: mpsc::Receiver<BatchControl>,
}

impl ChannelController {
    pub fn new(receiver: mpsc::Receiver<BatchControl>) -> Self {
        Self { receiver }
    }
}

#[async_trait]
impl BatchController for ChannelController {
    async fn checkpoint(&mut self, completed: usize, total: usize) -> BatchControl {
        info!("batch {completed}/{total} complete, awaiting control signal");
        self.receiver.recv().await.unwrap_or(BatchControl::Stop)
    }
}

/// Pipeline phases, in order. Used for progress logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionPhase {
    Reading,
    Matching,
    Reconciling,
    Persisting,
    Verifying,
}

impl RegionPhase {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Reading => "reading",
            Self::Matching => "matching",
            Self::Reconciling => "reconciling",
            Self::Persisting => "persisting",
            Self::Verifying => "verifying",
        }
    }
}

/// One region's result within a pipeline run.
#[derive(Debug)]
pub struct RegionOutcome {
    pub region: String,
    pub status: RunStatus,
    pub run: RegionImportRun,
    pub verification: Option<VerificationReport>,
    pub reason: Option<String>,
    pub unmatched_export: Option<PathBuf>,
}

/// Everything a pipeline run produced.
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: String,
    pub outcomes: Vec<RegionOutcome>,
    /// Post-run verification across every region in the store.
    pub verification: Vec<VerificationReport>,
    /// Regions left untouched because a stop signal arrived.
    pub pending: Vec<String>,
    pub geocode: GeocodeStats,
    pub failed: bool,
    pub failure_reason: Option<String>,
}

pub struct Orchestrator<'a> {
    settings: &'a Settings,
    store: &'a ParcelStore,
    geocoder: GeocodeService,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        settings: &'a Settings,
        store: &'a ParcelStore,
        provider: Arc<dyn GeocodeProvider>,
    ) -> Result<Self, StoreError> {
        let cache = GeocodeCache::open(store.db_path())?;
        let geocoder = GeocodeService::new(provider, cache, settings.geocode_policy());
        Ok(Self {
            settings,
            store,
            geocoder,
        })
    }

    pub fn geocoder(&self) -> &GeocodeService {
        &self.geocoder
    }

    /// Run the pipeline over `regions` with the zero-regression protocol.
    pub async fn run_pipeline(
        &self,
        regions: &[String],
        controller: &mut dyn BatchController,
        force: bool,
    ) -> Result<PipelineReport, PipelineError> {
        let engine = VerificationEngine::new(self.store, self.settings);

        // Step 1: previously-verified regions must still be clean, or the
        // run refuses to start.
        for region in self.store.verified_regions()? {
            let report = engine.verify(&region, None)?;
            match report.status {
                VerificationStatus::Verified => {}
                VerificationStatus::Unverifiable => {
                    warn!("{region}: previously verified but currently unverifiable");
                    self.store.record_report(&report)?;
                }
                VerificationStatus::Failed => {
                    error!("{region}: pre-run verification failed, refusing to run");
                    self.store.record_report(&report)?;
                    return Err(PipelineError::PreVerificationFailed {
                        region,
                        mismatches: report.mismatches,
                        mismatch_rate: report.mismatch_rate,
                    });
                }
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        info!("pipeline run {run_id}: {} region(s) queued", regions.len());

        // Step 2: process the queued regions in batches.
        let batch_size = self.settings.pipeline.batch_size.max(1);
        let batches: Vec<&[String]> = regions.chunks(batch_size).collect();
        let total_batches = batches.len();
        let mut outcomes = Vec::new();
        let mut pending = Vec::new();

        for (batch_idx, batch) in batches.iter().enumerate() {
            for region in batch.iter() {
                outcomes.push(self.process_region(&run_id, region, force).await?);
            }
            if batch_idx + 1 < total_batches {
                match controller.checkpoint(batch_idx + 1, total_batches).await {
                    BatchControl::Continue => {}
                    BatchControl::Stop => {
                        pending = batches[batch_idx + 1..]
                            .iter()
                            .flat_map(|b| b.iter().cloned())
                            .collect();
                        info!("stop signal received, {} region(s) left pending", pending.len());
                        break;
                    }
                }
            }
        }

        // Steps 3-4: re-verify everything, touched or not.
        let mut verification = Vec::new();
        let mut failed = false;
        let mut failure_reason = None;
        let touched: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.status == RunStatus::Done)
            .map(|o| o.region.as_str())
            .collect();

        for report in engine.verify_all(Some(run_id.as_str()))? {
            self.store.record_report(&report)?;
            if report.status == VerificationStatus::Failed && !failed {
                failed = true;
                failure_reason = Some(if touched.contains(&report.region.as_str()) {
                    format!(
                        "region '{}' failed verification after import ({} mismatches)",
                        report.region, report.mismatches
                    )
                } else {
                    format!(
                        "previously-clean region '{}' regressed ({} mismatches); \
                         the pipeline damaged unrelated data",
                        report.region, report.mismatches
                    )
                });
                error!("run {run_id} failed: {}", failure_reason.as_deref().unwrap_or(""));
            }
            verification.push(report);
        }

        // Attach each region's post-run report to its outcome.
        for outcome in &mut outcomes {
            outcome.verification = verification
                .iter()
                .find(|r| r.region == outcome.region)
                .cloned();
            if outcome.status == RunStatus::Done
                && outcome
                    .verification
                    .as_ref()
                    .is_some_and(|v| v.status == VerificationStatus::Failed)
            {
                outcome.status = RunStatus::Failed;
                outcome.reason = Some("verification mismatch".to_string());
            }
        }

        Ok(PipelineReport {
            run_id,
            outcomes,
            verification,
            pending,
            geocode: self.geocoder.stats(),
            failed,
            failure_reason,
        })
    }

    /// Run one region through the pipeline. Region-local problems land in
    /// the returned outcome; only store-level errors propagate.
    async fn process_region(
        &self,
        run_id: &str,
        region: &str,
        force: bool,
    ) -> Result<RegionOutcome, StoreError> {
        let started_at = Utc::now();
        info!("{region}: {}", RegionPhase::Reading.as_str());

        let inputs = match self.read_region(region) {
            Ok(inputs) => inputs,
            Err(RegionError::Store(e)) => return Err(e),
            Err(e @ RegionError::SourceMissing { .. }) => {
                warn!("{region}: skipped: {e}");
                return Ok(self.terminal_outcome(
                    run_id,
                    region,
                    RunStatus::Skipped,
                    e.to_string(),
                    started_at,
                )?);
            }
            Err(e) => {
                error!("{region}: failed: {e}");
                return Ok(self.terminal_outcome(
                    run_id,
                    region,
                    RunStatus::Failed,
                    e.to_string(),
                    started_at,
                )?);
            }
        };

        let geometry_total = inputs.geometry.rows.len() as u64;

        // Unchanged inputs and a prior successful run: nothing to redo, the
        // run is a verified no-op.
        if !force && self.inputs_unchanged(region, &inputs)? {
            info!("{region}: sources unchanged, skipping to verification");
            let mut outcome = self.finish_region(
                run_id,
                region,
                geometry_total,
                UpsertStats::default(),
                started_at,
                None,
            )?;
            outcome.reason = Some("sources unchanged".to_string());
            return Ok(outcome);
        }

        info!("{region}: {}", RegionPhase::Matching.as_str());
        let policy = self.settings.match_policy(region);
        let matcher = Matcher::new(&self.geocoder, policy);
        let auth_outcome = matcher
            .match_source(
                region,
                &inputs.geometry.rows,
                inputs.geometry.crs,
                &inputs.authoritative.rows,
                SourceKind::Authoritative,
            )
            .await?;
        let supp_outcome = match &inputs.supplemental {
            Some(supplemental) => Some(
                matcher
                    .match_source(
                        region,
                        &inputs.geometry.rows,
                        inputs.geometry.crs,
                        &supplemental.rows,
                        SourceKind::Supplemental,
                    )
                    .await?,
            ),
            None => None,
        };

        log_ambiguities(region, &inputs.geometry.rows, &auth_outcome);
        if let Some(outcome) = &supp_outcome {
            log_ambiguities(region, &inputs.geometry.rows, outcome);
        }

        info!("{region}: {}", RegionPhase::Reconciling.as_str());
        let auth_for: HashMap<usize, usize> = auth_outcome
            .candidates
            .iter()
            .map(|c| (c.geometry_idx, c.attribute_idx))
            .collect();
        let supp_for: HashMap<usize, usize> = supp_outcome
            .as_ref()
            .map(|o| {
                o.candidates
                    .iter()
                    .map(|c| (c.geometry_idx, c.attribute_idx))
                    .collect()
            })
            .unwrap_or_default();

        let existing = index_by_identifier(self.store.get_region(region)?);
        let now = Utc::now();
        let mut records = Vec::new();
        for (gidx, grow) in inputs.geometry.rows.iter().enumerate() {
            let auth_row = auth_for.get(&gidx).map(|&a| &inputs.authoritative.rows[a]);
            let supp_row = supp_for
                .get(&gidx)
                .and_then(|&a| inputs.supplemental.as_ref().map(|s| &s.rows[a]));
            // Parcels with no attribute association are not stored; they
            // count into the discrepancy ratio instead.
            if auth_row.is_none() && supp_row.is_none() {
                continue;
            }
            let centroid = inputs.geometry.crs.to_wgs84(grow.geometry.centroid());
            records.push(reconcile(
                region,
                grow,
                centroid,
                auth_row,
                supp_row,
                existing.get(&grow.identifier),
                now,
            ));
        }

        info!("{region}: {}", RegionPhase::Persisting.as_str());
        let stats = self
            .store
            .upsert(&records, region, self.settings.pipeline.chunk_size)?;
        self.store.record_dataset(&inputs.geometry.dataset)?;
        self.store.record_dataset(&inputs.authoritative.dataset)?;
        if let Some(supplemental) = &inputs.supplemental {
            self.store.record_dataset(&supplemental.dataset)?;
        }

        let unmatched_export =
            self.export_unmatched(region, &inputs, &auth_outcome, supp_outcome.as_ref());

        self.finish_region(
            run_id,
            region,
            geometry_total,
            stats,
            started_at,
            unmatched_export,
        )
    }

    /// VERIFYING phase plus the append-only run record shared by the normal
    /// and no-op paths.
    fn finish_region(
        &self,
        run_id: &str,
        region: &str,
        geometry_total: u64,
        stats: UpsertStats,
        started_at: chrono::DateTime<Utc>,
        unmatched_export: Option<PathBuf>,
    ) -> Result<RegionOutcome, StoreError> {
        info!("{region}: {}", RegionPhase::Verifying.as_str());
        let stored_count = self.store.count(region)?;
        let run = RegionImportRun {
            run_id: run_id.to_string(),
            region: region.to_string(),
            status: RunStatus::Done,
            inserted: stats.inserted,
            updated: stats.updated,
            skipped: stats.skipped(),
            geometry_total,
            stored_count,
            discrepancy_ratio: RegionImportRun::discrepancy_ratio(geometry_total, stored_count),
            failure: None,
            started_at,
            finished_at: Utc::now(),
        };
        self.store.record_run(&run)?;
        Ok(RegionOutcome {
            region: region.to_string(),
            status: RunStatus::Done,
            run,
            verification: None,
            reason: None,
            unmatched_export,
        })
    }

    /// Record and report a skipped or failed region.
    fn terminal_outcome(
        &self,
        run_id: &str,
        region: &str,
        status: RunStatus,
        reason: String,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<RegionOutcome, StoreError> {
        let stored_count = self.store.count(region)?;
        let run = RegionImportRun {
            run_id: run_id.to_string(),
            region: region.to_string(),
            status,
            inserted: 0,
            updated: 0,
            skipped: 0,
            geometry_total: 0,
            stored_count,
            discrepancy_ratio: 0.0,
            failure: Some(reason.clone()),
            started_at,
            finished_at: Utc::now(),
        };
        self.store.record_run(&run)?;
        Ok(RegionOutcome {
            region: region.to_string(),
            status,
            run,
            verification: None,
            reason: Some(reason),
            unmatched_export: None,
        })
    }

    fn read_region(&self, region: &str) -> Result<RegionInputs, RegionError> {
        let crs = self.settings.region_crs(region)?;
        let paths = self.settings.source_paths(region);

        let geometry = readers::read_geometry(region, &paths.geometry, crs)?;
        let authoritative = readers::read_authoritative(region, &paths.authoritative)?;

        let registry = self.region_registry(region)?;
        let supplemental = readers::read_supplemental(region, &paths.supplemental, &registry)?;

        Ok(RegionInputs {
            geometry,
            authoritative,
            supplemental,
        })
    }

    /// The mapping registry a region's supplemental file is detected
    /// against; a pinned mapping narrows detection to that one layout.
    fn region_registry(&self, region: &str) -> Result<MappingRegistry, RegionError> {
        let registry = self.settings.mapping_registry();
        match self.settings.pinned_mapping(region) {
            None => Ok(registry),
            Some(name) => match registry.get(name) {
                Some(mapping) => {
                    let mut narrowed = MappingRegistry::empty();
                    narrowed.register(mapping.clone());
                    Ok(narrowed)
                }
                None => Err(RegionError::ColumnMappingUnknown {
                    region: region.to_string(),
                    path: self.settings.source_path(region, SourceKind::Supplemental),
                    headers: format!("pinned mapping '{name}' is not registered"),
                }),
            },
        }
    }

    fn inputs_unchanged(&self, region: &str, inputs: &RegionInputs) -> Result<bool, StoreError> {
        let last_done = self
            .store
            .latest_run(region)?
            .is_some_and(|r| r.status == RunStatus::Done);
        if !last_done {
            return Ok(false);
        }
        let same = |kind: SourceKind, current: Option<&str>| -> Result<bool, StoreError> {
            Ok(self.store.dataset_fingerprint(region, kind)?.as_deref() == current)
        };
        Ok(same(SourceKind::Geometry, Some(&inputs.geometry.dataset.fingerprint))?
            && same(
                SourceKind::Authoritative,
                Some(&inputs.authoritative.dataset.fingerprint),
            )?
            && same(
                SourceKind::Supplemental,
                inputs
                    .supplemental
                    .as_ref()
                    .map(|s| s.dataset.fingerprint.as_str()),
            )?)
    }

    fn export_unmatched(
        &self,
        region: &str,
        inputs: &RegionInputs,
        auth_outcome: &MatchOutcome,
        supp_outcome: Option<&MatchOutcome>,
    ) -> Option<PathBuf> {
        let mut rows: Vec<UnmatchedRecord> = Vec::new();
        let mut collect = |outcome: &MatchOutcome, source: &AttributeSource| {
            for unmatched in &outcome.unmatched {
                let row = &source.rows[unmatched.attribute_idx];
                rows.push(UnmatchedRecord {
                    source: row.source,
                    line: row.line,
                    identifier: row.identifier.clone(),
                    address: row.raw_address.clone(),
                    reason: unmatched.reason.as_str(),
                });
            }
        };
        collect(auth_outcome, &inputs.authoritative);
        if let (Some(outcome), Some(source)) = (supp_outcome, inputs.supplemental.as_ref()) {
            collect(outcome, source);
        }

        match reports::write_unmatched(&self.settings.reports_dir, region, &rows) {
            Ok(path) => path,
            Err(e) => {
                warn!("{region}: failed to write unmatched export: {e}");
                None
            }
        }
    }
}

struct RegionInputs {
    geometry: readers::GeometrySource,
    authoritative: AttributeSource,
    supplemental: Option<AttributeSource>,
}

/// Later claims on an already-taken attribute row are surfaced, not silently
/// dropped.
fn log_ambiguities(region: &str, geometry_rows: &[GeometryRow], outcome: &MatchOutcome) {
    for claim in &outcome.ambiguous {
        warn!(
            "{region}: {} match is ambiguous: parcel {} also claimed the row first \
             matched to parcel {}",
            claim.strategy.as_str(),
            geometry_rows[claim.later_geometry_idx].identifier,
            geometry_rows[claim.first_geometry_idx].identifier,
        );
    }
}
