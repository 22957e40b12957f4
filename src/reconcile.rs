use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use rand::{SeedableRng, rngs::StdRng};
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::{
    apply::{ApplyError, ApplyMode, Applier, Rollback},
    backoff::{Retry, RetryPolicy},
    convert::{ConvertOptions, convert},
    diff::{ChangeSummary, ReconcileInvariantError, reconcile},
    id::CycleId,
    render::{RenderOptions, render},
    source::SharedObjects,
    state::StateStore,
    status::{CycleResult, CycleSummary, LoopPhase, StatusBoard},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRequest {
    /// Watched objects changed.
    Changed,
    /// Re-run and verify the live proxy even if nothing changed.
    Resync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Pending {
    changed: bool,
    resync: bool,
}

impl Pending {
    fn has_any(self) -> bool {
        self.changed || self.resync
    }

    fn add(&mut self, req: ReconcileRequest) {
        match req {
            ReconcileRequest::Changed => self.changed = true,
            ReconcileRequest::Resync => self.resync = true,
        }
    }

    fn merge(&mut self, other: Pending) {
        self.changed |= other.changed;
        self.resync |= other.resync;
    }
}

/// Single-slot mailbox: flags record what was requested, the `Notify` permit
/// wakes the loop at most once however many requests piled up.
#[derive(Debug, Default)]
struct Trigger {
    notify: Notify,
    changed: AtomicBool,
    resync: AtomicBool,
}

impl Trigger {
    fn take(&self) -> Pending {
        Pending {
            changed: self.changed.swap(false, Ordering::AcqRel),
            resync: self.resync.swap(false, Ordering::AcqRel),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileHandle {
    trigger: Option<Arc<Trigger>>,
}

impl ReconcileHandle {
    pub fn noop() -> Self {
        Self { trigger: None }
    }

    /// Never blocks; requests made while a cycle runs collapse into one re-run.
    pub fn request(&self, req: ReconcileRequest) {
        let Some(trigger) = &self.trigger else {
            return;
        };
        match req {
            ReconcileRequest::Changed => trigger.changed.store(true, Ordering::Release),
            ReconcileRequest::Resync => trigger.resync.store(true, Ordering::Release),
        }
        trigger.notify.notify_one();
    }

    pub fn request_changed(&self) {
        self.request(ReconcileRequest::Changed);
    }

    pub fn request_resync(&self) {
        self.request(ReconcileRequest::Resync);
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            trigger: Some(Arc::new(Trigger::default())),
        }
    }

    #[cfg(test)]
    pub(crate) fn changed_requested(&self) -> bool {
        self.trigger
            .as_ref()
            .is_some_and(|t| t.changed.load(Ordering::Acquire))
    }

    #[cfg(test)]
    pub(crate) fn resync_requested(&self) -> bool {
        self.trigger
            .as_ref()
            .is_some_and(|t| t.resync.load(Ordering::Acquire))
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Quiet period after the latest trigger before a cycle starts.
    pub debounce: Duration,
    /// Longest a burst may postpone a cycle.
    pub debounce_max: Duration,
    pub resync_interval: Duration,
    /// Minimum time between two reload-requiring cycles.
    pub reload_cooldown: Duration,
    pub cycle_timeout: Duration,
    /// Delay before retrying a failed cycle.
    pub retry: RetryPolicy,
    pub convert: ConvertOptions,
    pub render: RenderOptions,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
            debounce_max: Duration::from_secs(2),
            resync_interval: Duration::from_secs(60),
            reload_cooldown: Duration::from_secs(5),
            cycle_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            convert: ConvertOptions::default(),
            render: RenderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: String,
    pub mode: ApplyMode,
    pub operations: usize,
    pub changes: ChangeSummary,
    pub validation_errors: usize,
    pub reloaded: bool,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Applied(CycleReport),
    /// A reload is needed but the cooldown has not elapsed.
    Deferred { until: Instant },
}

#[derive(Debug)]
pub enum CycleError {
    Invariant(ReconcileInvariantError),
    Apply(ApplyError),
    DeadlineExceeded,
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invariant(e) => write!(f, "reconcile invariant violated: {e}"),
            Self::Apply(e) => write!(f, "apply failed: {e}"),
            Self::DeadlineExceeded => write!(f, "cycle deadline exceeded before apply"),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invariant(e) => Some(e),
            Self::Apply(e) => Some(e),
            Self::DeadlineExceeded => None,
        }
    }
}

impl From<ReconcileInvariantError> for CycleError {
    fn from(value: ReconcileInvariantError) -> Self {
        Self::Invariant(value)
    }
}

impl From<ApplyError> for CycleError {
    fn from(value: ApplyError) -> Self {
        Self::Apply(value)
    }
}

/// Drives convert, diff, render and apply one cycle at a time.
pub struct SyncLoop {
    objects: SharedObjects,
    store: StateStore,
    applier: Applier,
    board: StatusBoard,
    options: SyncOptions,
    trigger: Arc<Trigger>,
    last_reload: Option<Instant>,
}

impl SyncLoop {
    pub fn new(
        objects: SharedObjects,
        store: StateStore,
        applier: Applier,
        board: StatusBoard,
        options: SyncOptions,
    ) -> Self {
        Self {
            objects,
            store,
            applier,
            board,
            options,
            trigger: Arc::new(Trigger::default()),
            last_reload: None,
        }
    }

    pub fn handle(&self) -> ReconcileHandle {
        ReconcileHandle {
            trigger: Some(self.trigger.clone()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Runs one cycle. `verify_live` additionally checks the live route table
    /// when nothing changed.
    pub async fn run_cycle(
        &mut self,
        verify_live: bool,
        deadline: Instant,
    ) -> Result<CycleOutcome, CycleError> {
        let id = CycleId::new();
        let started_at = id.started_at();
        let cycle_id = id.to_string();
        let span = info_span!("cycle", cycle_id = %cycle_id);
        let result = self
            .run_cycle_inner(&cycle_id, verify_live, deadline)
            .instrument(span)
            .await;
        self.record(cycle_id, started_at, &result).await;
        result
            .map(|(outcome, _)| outcome)
            .map_err(|failed| failed.error)
    }

    async fn run_cycle_inner(
        &mut self,
        cycle_id: &str,
        verify_live: bool,
        deadline: Instant,
    ) -> Result<(CycleOutcome, CycleFacts), FailedCycle> {
        self.board.set_phase(LoopPhase::Reconciling).await;
        let objects = self.objects.read().await.objects().clone();
        let conversion = convert(&objects, &self.options.convert);
        for err in &conversion.errors {
            warn!(entity = %err.entity_label(), %err, "invalid declaration excluded");
        }
        let mut facts = CycleFacts {
            changes: ChangeSummary::default(),
            validation_errors: conversion.errors.len(),
        };
        let changes = match reconcile(&conversion.snapshot, self.store.applied()) {
            Ok(changes) => changes,
            Err(err) => {
                self.board.record_entities(Vec::new(), &conversion.errors).await;
                return Err(CycleError::Invariant(err).with_facts(facts));
            }
        };
        self.store.set_desired(conversion.snapshot);
        facts.changes = changes.summary();
        self.board
            .record_entities(changes.entity_statuses(), &conversion.errors)
            .await;
        let artifacts = render(&changes, &self.options.render);
        drop(changes);

        let plan = self
            .applier
            .plan(&artifacts, self.store.last_good(), verify_live);
        if plan.starts_with_reload()
            && let Some(last) = self.last_reload
        {
            let until = last + self.options.reload_cooldown;
            if until > Instant::now() {
                debug!(wait = ?(until - Instant::now()), "reload cooldown active; deferring cycle");
                return Ok((CycleOutcome::Deferred { until }, facts));
            }
        }
        if Instant::now() >= deadline {
            return Err(CycleError::DeadlineExceeded.with_facts(facts));
        }

        self.board.set_phase(LoopPhase::Applying).await;
        let applied = self
            .applier
            .apply(&plan, &artifacts, &mut self.store, deadline, Some(cycle_id))
            .await;
        let reloaded = match &applied {
            Ok(outcome) => outcome.reloaded,
            Err(err) => err.reloaded,
        };
        if reloaded {
            self.last_reload = Some(Instant::now());
        }
        let outcome = applied.map_err(|e| CycleError::Apply(e).with_facts(facts.clone()))?;
        let report = CycleReport {
            cycle_id: cycle_id.to_string(),
            mode: outcome.mode,
            operations: outcome.operations,
            changes: facts.changes.clone(),
            validation_errors: facts.validation_errors,
            reloaded: outcome.reloaded,
            digest: outcome.digest,
        };
        if report.mode != ApplyMode::Noop {
            info!(
                mode = report.mode.as_str(),
                added = report.changes.added,
                modified = report.changes.modified,
                deleted = report.changes.deleted,
                invalid = report.validation_errors,
                "cycle applied"
            );
        }
        Ok((CycleOutcome::Applied(report), facts))
    }

    async fn record(
        &self,
        cycle_id: String,
        started_at: chrono::DateTime<Utc>,
        result: &Result<(CycleOutcome, CycleFacts), FailedCycle>,
    ) {
        let (result_kind, mode, error, facts, reloaded, rollback) = match result {
            Ok((CycleOutcome::Applied(report), facts)) => {
                let kind = if report.mode == ApplyMode::Noop {
                    CycleResult::Noop
                } else {
                    CycleResult::Applied
                };
                (kind, Some(report.mode.as_str()), None, facts.clone(), report.reloaded, false)
            }
            Ok((CycleOutcome::Deferred { .. }, facts)) => {
                (CycleResult::Deferred, None, None, facts.clone(), false, false)
            }
            Err(failed) => {
                let (reloaded, rollback) = match &failed.error {
                    CycleError::Apply(e) => (e.reloaded, e.rollback == Rollback::Restored),
                    _ => (false, false),
                };
                (
                    CycleResult::Failed,
                    None,
                    Some(failed.error.to_string()),
                    failed.facts.clone(),
                    reloaded,
                    rollback,
                )
            }
        };
        let summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            result: result_kind,
            mode,
            error,
            changes: facts.changes,
            validation_errors: facts.validation_errors,
        };
        self.board
            .record_cycle(summary, u64::from(reloaded), rollback)
            .await;
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Serves triggers until `shutdown` flips to true. A cycle that has
    /// reached Applying finishes before shutdown is observed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let now = Instant::now();
        let mut pending = Pending {
            changed: true,
            resync: false,
        };
        let mut collect_started: Option<Instant> = Some(now);
        let mut debounce_until: Option<Instant> = Some(now);
        let mut hold_until: Option<Instant> = None;
        let mut retry = Retry::new(self.options.retry, StdRng::from_entropy());

        let mut periodic = tokio::time::interval_at(
            now + self.options.resync_interval,
            self.options.resync_interval,
        );
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Instant::now();
            let run_at = if pending.has_any() {
                let started = *collect_started.get_or_insert(now);
                let debounce_at = std::cmp::min(
                    debounce_until.unwrap_or(now),
                    started + self.options.debounce_max,
                );
                Some(std::cmp::max(debounce_at, hold_until.unwrap_or(now)))
            } else {
                None
            };
            let phase = match (run_at, hold_until) {
                (None, _) => LoopPhase::Idle,
                (Some(_), Some(_)) => LoopPhase::Cooldown,
                (Some(_), None) => LoopPhase::Collecting,
            };
            self.board.set_phase(phase).await;

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = periodic.tick() => {
                    pending.add(ReconcileRequest::Resync);
                    debounce_until = Some(Instant::now() + self.options.debounce);
                }
                _ = self.trigger.notify.notified() => {
                    let taken = self.trigger.take();
                    if taken.has_any() {
                        pending.merge(taken);
                        debounce_until = Some(Instant::now() + self.options.debounce);
                    }
                }
                _ = async {
                    if let Some(at) = run_at {
                        tokio::time::sleep_until(at).await;
                    }
                }, if run_at.is_some() => {
                    let batch = std::mem::take(&mut pending);
                    // waits for cooldown or retry backoff do not count against the cycle
                    let started = std::cmp::max(
                        collect_started.unwrap_or(now),
                        hold_until.unwrap_or(now),
                    );
                    let deadline = started + self.options.cycle_timeout;
                    debounce_until = None;
                    collect_started = None;
                    hold_until = None;

                    match self.run_cycle(batch.resync, deadline).await {
                        Ok(CycleOutcome::Applied(_)) => {
                            retry.restart();
                        }
                        Ok(CycleOutcome::Deferred { until }) => {
                            pending.merge(batch);
                            hold_until = Some(until);
                        }
                        Err(err) => {
                            let delay = retry.failure_delay();
                            warn!(%err, failures = retry.failures(), ?delay, "sync cycle failed; retrying");
                            pending.merge(batch);
                            hold_until = Some(Instant::now() + delay);
                        }
                    }
                }
            }
        }

        self.board.set_phase(LoopPhase::Stopped).await;
        info!("sync loop stopped");
    }
}

/// Counts known before a cycle ends, kept for the status board on any path.
#[derive(Debug, Clone, Default)]
struct CycleFacts {
    changes: ChangeSummary,
    validation_errors: usize,
}

#[derive(Debug)]
struct FailedCycle {
    error: CycleError,
    facts: CycleFacts,
}

impl CycleError {
    fn with_facts(self, facts: CycleFacts) -> FailedCycle {
        FailedCycle { error: self, facts }
    }
}
