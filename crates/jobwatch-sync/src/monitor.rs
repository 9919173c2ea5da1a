//! Batch orchestration over watch targets.
//!
//! Each target runs fetch, extract, diff, persist and notify in that order. A failure
//! in any stage ends that target's run without touching its stored state; the batch
//! moves on to the next target.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobwatch_adapters::{AdapterRegistry, ExtractionError};
use jobwatch_core::{filter_new, record_seen, CandidatePosting, WatchTarget};
use jobwatch_fetch::{FetchError, PageRenderer, RenderBudget};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

use crate::notify::Notifier;
use crate::store::{AlertStore, PersistenceError, TargetUpdate};

pub const DEFAULT_PACING: Duration = Duration::from_secs(2);
pub const DRY_RUN_PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum TargetRunError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    /// Postings were saved (and possibly announced) but the history write-back failed.
    #[error("updating target history: {source}")]
    HistoryUpdate {
        outcome: TargetOutcome,
        source: PersistenceError,
    },
    #[error("target run cancelled")]
    Cancelled,
}

impl TargetRunError {
    fn log(&self) {
        match self {
            TargetRunError::Fetch(err) => warn!(error = %err, "fetch failed"),
            TargetRunError::Extraction(err) => warn!(error = %err, "extraction failed"),
            TargetRunError::Persistence(err) => error!(error = %err, "persistence failed"),
            TargetRunError::HistoryUpdate { outcome, source } => error!(
                error = %source,
                saved = outcome.postings_found,
                notified = outcome.notified,
                "history update failed; saved postings may be announced again"
            ),
            TargetRunError::Cancelled => info!("target run cancelled"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("loading active targets: {0}")]
    LoadTargets(#[source] PersistenceError),
    #[error("a batch is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum DryRunError {
    #[error("target {0} not found")]
    UnknownTarget(Uuid),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetOutcome {
    pub postings_found: usize,
    pub notified: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Active targets attempted, including those that failed.
    pub targets_checked: usize,
    /// Postings saved, including those of targets whose history update then failed.
    pub postings_found: usize,
    /// Delivered notifications, counted the same way as `postings_found`.
    pub notifications_sent: usize,
    pub cancelled: bool,
}

impl BatchReport {
    /// Folds one target result into the report. Returns true when the run was cancelled.
    fn absorb(&mut self, result: Result<TargetOutcome, TargetRunError>) -> bool {
        match result {
            Ok(outcome) | Err(TargetRunError::HistoryUpdate { outcome, .. }) => {
                self.targets_checked += 1;
                self.postings_found += outcome.postings_found;
                if outcome.notified {
                    self.notifications_sent += 1;
                }
                false
            }
            Err(TargetRunError::Cancelled) => {
                self.cancelled = true;
                true
            }
            Err(_) => {
                self.targets_checked += 1;
                false
            }
        }
    }
}

/// Preview of what a target's page currently yields, without touching history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunReport {
    pub company: String,
    pub jobs_found: usize,
    pub jobs: Vec<CandidatePosting>,
}

impl DryRunReport {
    fn new(target: &WatchTarget, candidates: Vec<CandidatePosting>) -> Self {
        Self {
            company: target.organization.clone(),
            jobs_found: candidates.len(),
            jobs: candidates.into_iter().take(DRY_RUN_PREVIEW_LIMIT).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub budget: RenderBudget,
    pub pacing: Duration,
    pub max_in_flight: usize,
    pub respect_cadence: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            budget: RenderBudget::default(),
            pacing: DEFAULT_PACING,
            max_in_flight: 1,
            respect_cadence: false,
        }
    }
}

#[derive(Clone)]
pub struct Monitor {
    store: Arc<dyn AlertStore>,
    renderer: Arc<dyn PageRenderer>,
    registry: AdapterRegistry,
    notifier: Arc<dyn Notifier>,
    settings: MonitorSettings,
    batch_lock: Arc<Mutex<()>>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn AlertStore>,
        renderer: Arc<dyn PageRenderer>,
        registry: AdapterRegistry,
        notifier: Arc<dyn Notifier>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            store,
            renderer,
            registry,
            notifier,
            settings,
            batch_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.batch_lock.try_lock().is_err()
    }

    /// Loads active targets and runs them, refusing to start while another batch is running.
    pub async fn try_run_batch(&self, cancel: &CancellationToken) -> Result<BatchReport, BatchError> {
        let _guard = self
            .batch_lock
            .try_lock()
            .map_err(|_| BatchError::AlreadyRunning)?;
        let targets = self
            .store
            .load_active_targets()
            .await
            .map_err(BatchError::LoadTargets)?;
        Ok(self.run_locked(targets, cancel).await)
    }

    /// Runs the given targets, waiting for any batch already in progress to finish first.
    pub async fn run_batch(&self, targets: Vec<WatchTarget>, cancel: &CancellationToken) -> BatchReport {
        let _guard = self.batch_lock.lock().await;
        self.run_locked(targets, cancel).await
    }

    async fn run_locked(&self, targets: Vec<WatchTarget>, cancel: &CancellationToken) -> BatchReport {
        let run_id = Uuid::new_v4();
        let now = Utc::now();
        let eligible: Vec<WatchTarget> = targets
            .into_iter()
            .filter(|t| t.is_active() && (!self.settings.respect_cadence || t.is_due(now)))
            .collect();
        info!(%run_id, targets = eligible.len(), max_in_flight = self.settings.max_in_flight, "batch started");

        let report = if self.settings.max_in_flight > 1 {
            self.run_pooled(run_id, eligible, cancel).await
        } else {
            self.run_sequential(run_id, eligible, cancel).await
        };

        info!(
            %run_id,
            targets_checked = report.targets_checked,
            postings_found = report.postings_found,
            notifications_sent = report.notifications_sent,
            cancelled = report.cancelled,
            "batch finished"
        );
        report
    }

    async fn run_sequential(
        &self,
        run_id: Uuid,
        targets: Vec<WatchTarget>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let total = targets.len();
        for (index, target) in targets.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if report.absorb(self.run_target(run_id, target, cancel).await) {
                break;
            }
            if index + 1 < total && !pace_until(Instant::now() + self.settings.pacing, cancel).await {
                report.cancelled = true;
                break;
            }
        }
        report
    }

    async fn run_pooled(
        &self,
        run_id: Uuid,
        targets: Vec<WatchTarget>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_in_flight));
        let pacer = HostPacer::default();
        let mut tasks = JoinSet::new();

        for target in targets {
            let monitor = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let pacing = self.settings.pacing;
            let slot = pacer.slot_for(&target.source_url).await;

            tasks.spawn(async move {
                let mut last_finished: OwnedMutexGuard<Option<Instant>> = slot.lock_owned().await;
                if let Some(finished) = *last_finished {
                    if !pace_until(finished + pacing, &cancel).await {
                        return Err(TargetRunError::Cancelled);
                    }
                }
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return Err(TargetRunError::Cancelled),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(TargetRunError::Cancelled),
                    },
                };
                let result = monitor.run_target(run_id, target, &cancel).await;
                *last_finished = Some(Instant::now());
                result
            });
        }

        let mut report = BatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    report.absorb(result);
                }
                Err(err) => {
                    error!(%run_id, error = %err, "target task aborted");
                    report.targets_checked += 1;
                }
            }
        }
        report.cancelled |= cancel.is_cancelled();
        report
    }

    /// Checks one target end to end and writes back its history on success.
    pub async fn run_target(
        &self,
        run_id: Uuid,
        target: WatchTarget,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome, TargetRunError> {
        let span = info_span!(
            "target",
            %run_id,
            target_id = %target.id,
            url = %target.source_url
        );
        async move {
            let result = self.check_target(target, cancel).await;
            match &result {
                Ok(outcome) => info!(
                    new_postings = outcome.postings_found,
                    notified = outcome.notified,
                    "target checked"
                ),
                Err(err) => err.log(),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn check_target(
        &self,
        target: WatchTarget,
        cancel: &CancellationToken,
    ) -> Result<TargetOutcome, TargetRunError> {
        let snapshot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TargetRunError::Cancelled),
            rendered = self.renderer.render(&target.source_url, &self.settings.budget) => rendered?,
        };
        let candidates = self.registry.extract(&snapshot, &target)?;

        let now = Utc::now();
        let fresh = filter_new(&target, candidates, now);
        let mut outcome = TargetOutcome::default();
        if !fresh.is_empty() {
            outcome.postings_found = self.store.save_new_postings(&fresh).await?;
            let delivery = self
                .notifier
                .notify(&target.destination, &fresh, &target.organization)
                .await;
            outcome.notified = delivery.success;
            if !delivery.success {
                warn!(
                    notifier = self.notifier.name(),
                    error = delivery.error.as_deref().unwrap_or("unspecified"),
                    "notification failed"
                );
            }
        }

        let updated = record_seen(target, &fresh, now);
        self.store
            .update_target(updated.id, TargetUpdate::from_target(&updated, now))
            .await
            .map_err(|source| TargetRunError::HistoryUpdate { outcome, source })?;
        Ok(outcome)
    }

    /// Fetches and extracts one stored target without persisting or notifying.
    pub async fn dry_run(&self, target_id: Uuid) -> Result<DryRunReport, DryRunError> {
        let target = self
            .store
            .load_target(target_id)
            .await?
            .ok_or(DryRunError::UnknownTarget(target_id))?;
        let snapshot = self
            .renderer
            .render(&target.source_url, &self.settings.budget)
            .instrument(info_span!("dry_run", target_id = %target.id, url = %target.source_url))
            .await?;
        let candidates = self.registry.extract(&snapshot, &target)?;
        Ok(DryRunReport::new(&target, candidates))
    }
}

/// Sleeps until `deadline`. Returns false if cancelled first.
async fn pace_until(deadline: Instant, cancel: &CancellationToken) -> bool {
    if deadline <= Instant::now() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep_until(deadline) => true,
    }
}

type HostSlot = Arc<Mutex<Option<Instant>>>;

/// One slot per host holding when the last check against it finished.
#[derive(Debug, Clone, Default)]
struct HostPacer {
    slots: Arc<Mutex<HashMap<String, HostSlot>>>,
}

impl HostPacer {
    async fn slot_for(&self, source_url: &str) -> HostSlot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(host_key(source_url)).or_default())
    }
}

fn host_key(source_url: &str) -> String {
    Url::parse(source_url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_else(|| source_url.to_string())
}
