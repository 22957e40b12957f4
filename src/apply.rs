use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    backoff::{Retry, RetryDecision, RetryPolicy},
    proxy::{ControlError, ControlFuture, ControlSurface},
    render::{Artifacts, FullConfig},
    state::{StateStore, StoreError},
};

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Per control-surface call; `Unavailable` is retried up to `max_attempts`.
    pub retry: RetryPolicy,
    /// Time allowed for a rollback once the cycle has failed.
    pub rollback_timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy {
                first: Duration::from_millis(200),
                ceiling: Duration::from_secs(5),
                jitter_percent: 25,
                max_attempts: Some(3),
            },
            rollback_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Compare the live route table with the full config; stop if they agree.
    Verify,
    Dynamic,
    FullReload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPlan {
    pub strategies: Vec<Strategy>,
}

impl ApplyPlan {
    pub fn is_noop(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Whether the first thing this plan does is a reload.
    pub fn starts_with_reload(&self) -> bool {
        self.strategies.first() == Some(&Strategy::FullReload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Noop,
    Verified,
    Dynamic,
    Reload,
}

impl ApplyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Noop => "noop",
            Self::Verified => "verified",
            Self::Dynamic => "dynamic",
            Self::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub mode: ApplyMode,
    pub operations: usize,
    /// A reload was issued, successful or not.
    pub reloaded: bool,
    pub digest: String,
}

#[derive(Debug)]
pub enum ApplyFailure {
    Transient {
        during: &'static str,
        attempts: u32,
        details: String,
    },
    Rejected {
        during: &'static str,
        details: String,
    },
    Validation {
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    DeadlineExceeded {
        during: &'static str,
    },
    Store(StoreError),
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient {
                during,
                attempts,
                details,
            } => write!(f, "{during} failed after {attempts} attempts: {details}"),
            Self::Rejected { during, details } => write!(f, "{during} rejected: {details}"),
            Self::Validation {
                missing,
                unexpected,
            } => write!(
                f,
                "live routes diverge: missing [{}], unexpected [{}]",
                missing.join(", "),
                unexpected.join(", ")
            ),
            Self::DeadlineExceeded { during } => write!(f, "deadline exceeded during {during}"),
            Self::Store(e) => write!(f, "commit failed: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
    Restored,
    NoKnownGood,
    Failed { details: String },
}

#[derive(Debug)]
pub struct ApplyError {
    pub failure: ApplyFailure,
    pub rollback: Rollback,
    pub reloaded: bool,
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.failure)?;
        match &self.rollback {
            Rollback::Restored => write!(f, " (rolled back to last known good)"),
            Rollback::NoKnownGood => write!(f, " (no known good configuration to restore)"),
            Rollback::Failed { details } => write!(f, " (rollback failed: {details})"),
        }
    }
}

impl std::error::Error for ApplyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.failure {
            ApplyFailure::Store(e) => Some(e),
            _ => None,
        }
    }
}

pub struct Applier {
    surface: Arc<dyn ControlSurface>,
    options: ApplyOptions,
    retry: Retry<StdRng>,
}

impl Applier {
    pub fn new(surface: Arc<dyn ControlSurface>, options: ApplyOptions) -> Self {
        Self::with_rng(surface, options, StdRng::from_entropy())
    }

    pub fn with_rng(surface: Arc<dyn ControlSurface>, options: ApplyOptions, rng: StdRng) -> Self {
        let retry = Retry::new(options.retry, rng);
        Self {
            surface,
            options,
            retry,
        }
    }

    pub fn surface(&self) -> &Arc<dyn ControlSurface> {
        &self.surface
    }

    /// Orders the strategies to try for `artifacts`. Pure.
    pub fn plan(
        &self,
        artifacts: &Artifacts,
        last_good: Option<&FullConfig>,
        verify_live: bool,
    ) -> ApplyPlan {
        let in_sync = last_good.is_some_and(|g| g.digest == artifacts.full.digest);
        let strategies = if artifacts.operations.is_empty() && in_sync {
            if verify_live {
                vec![Strategy::Verify, Strategy::FullReload]
            } else {
                vec![]
            }
        } else if !artifacts.operations.is_empty()
            && last_good.is_some_and(|g| same_frontends(g, &artifacts.full))
            && self.surface.supports_dynamic()
            && artifacts.operations.iter().all(|op| self.surface.accepts(op))
        {
            vec![Strategy::Dynamic, Strategy::FullReload]
        } else {
            vec![Strategy::FullReload]
        };
        ApplyPlan { strategies }
    }

    /// Executes `plan`. On success the store's applied snapshot advances; on
    /// failure the last-known-good config is restored and the store is left
    /// as it was.
    pub async fn apply(
        &mut self,
        plan: &ApplyPlan,
        artifacts: &Artifacts,
        store: &mut StateStore,
        deadline: Instant,
        cycle_id: Option<&str>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let full = &artifacts.full;
        let mut reloaded = false;
        let outcome = |mode: ApplyMode, reloaded: bool| ApplyOutcome {
            mode,
            operations: artifacts.operations.len(),
            reloaded,
            digest: full.digest.clone(),
        };

        if plan.is_noop() {
            return Ok(outcome(ApplyMode::Noop, false));
        }

        let mut result = Err(ApplyFailure::Rejected {
            during: "plan",
            details: "no strategy succeeded".to_string(),
        });
        for strategy in &plan.strategies {
            result = match strategy {
                Strategy::Verify => match self.validate(full, deadline).await {
                    Ok(()) => return Ok(outcome(ApplyMode::Verified, false)),
                    Err(failure) => {
                        warn!(%failure, "live proxy drifted from last applied config; reloading");
                        Err(failure)
                    }
                },
                Strategy::Dynamic => match self.run_dynamic(artifacts, deadline).await {
                    Ok(()) => Ok(ApplyMode::Dynamic),
                    Err(failure @ ApplyFailure::Validation { .. }) => {
                        warn!(
                            %failure,
                            operations = artifacts.operations.len(),
                            "dynamic operations were accepted but live routes diverge; reloading"
                        );
                        Err(failure)
                    }
                    Err(failure) => {
                        warn!(%failure, "dynamic update failed; falling back to full reload");
                        Err(failure)
                    }
                },
                Strategy::FullReload => {
                    reloaded = true;
                    self.run_reload(full, deadline)
                        .await
                        .map(|()| ApplyMode::Reload)
                }
            };
            if matches!(result, Ok(_) | Err(ApplyFailure::DeadlineExceeded { .. })) {
                break;
            }
        }

        let result = result.and_then(|mode| {
            store
                .commit(full, cycle_id)
                .map(|()| mode)
                .map_err(ApplyFailure::Store)
        });

        match result {
            Ok(mode) => {
                info!(
                    mode = mode.as_str(),
                    operations = artifacts.operations.len(),
                    digest = short_digest(&full.digest),
                    "configuration applied"
                );
                Ok(outcome(mode, reloaded))
            }
            Err(failure) => {
                let rollback = self.rollback(store.last_good().cloned()).await;
                let reloaded = reloaded || rollback != Rollback::NoKnownGood;
                warn!(%failure, ?rollback, "apply failed");
                Err(ApplyError {
                    failure,
                    rollback,
                    reloaded,
                })
            }
        }
    }

    async fn run_dynamic(
        &mut self,
        artifacts: &Artifacts,
        deadline: Instant,
    ) -> Result<(), ApplyFailure> {
        for op in &artifacts.operations {
            debug!(%op, "applying dynamic operation");
            let surface = self.surface.clone();
            self.call("dynamic update", deadline, || surface.apply(op))
                .await?;
        }
        let surface = self.surface.clone();
        self.call("write config", deadline, || {
            surface.write_config(&artifacts.full)
        })
        .await?;
        self.validate(&artifacts.full, deadline).await
    }

    async fn run_reload(&mut self, full: &FullConfig, deadline: Instant) -> Result<(), ApplyFailure> {
        let surface = self.surface.clone();
        self.call("write config", deadline, || surface.write_config(full))
            .await?;
        self.call("reload", deadline, || surface.reload()).await?;
        self.validate(full, deadline).await
    }

    async fn validate(&mut self, full: &FullConfig, deadline: Instant) -> Result<(), ApplyFailure> {
        let surface = self.surface.clone();
        let live = self
            .call("read live routes", deadline, || surface.live_routes())
            .await?;
        compare_routes(&full.routes, &live)
    }

    async fn rollback(&mut self, last_good: Option<FullConfig>) -> Rollback {
        let Some(last_good) = last_good else {
            return Rollback::NoKnownGood;
        };
        let deadline = Instant::now() + self.options.rollback_timeout;
        match self.run_reload(&last_good, deadline).await {
            Ok(()) => {
                info!(
                    digest = short_digest(&last_good.digest),
                    "restored last known good configuration"
                );
                Rollback::Restored
            }
            Err(e) => Rollback::Failed {
                details: e.to_string(),
            },
        }
    }

    async fn call<T, F>(
        &mut self,
        during: &'static str,
        deadline: Instant,
        f: F,
    ) -> Result<T, ApplyFailure>
    where
        F: FnMut() -> ControlFuture<T>,
    {
        call_with_retry(during, f, &mut self.retry, deadline).await
    }
}

/// Retries `Unavailable` with backoff; `Rejected` is returned at once. Every
/// attempt and every wait stays inside `deadline`.
pub(crate) async fn call_with_retry<T, F, R>(
    during: &'static str,
    mut f: F,
    retry: &mut Retry<R>,
    deadline: Instant,
) -> Result<T, ApplyFailure>
where
    F: FnMut() -> ControlFuture<T>,
    R: rand::RngCore,
{
    retry.restart();
    loop {
        let result = match tokio::time::timeout_at(deadline, f()).await {
            Ok(result) => result,
            Err(_) => return Err(ApplyFailure::DeadlineExceeded { during }),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(ControlError::Rejected { details }) => {
                return Err(ApplyFailure::Rejected { during, details });
            }
            Err(ControlError::Unavailable { details }) => {
                match retry.after_failure(Instant::now(), Some(deadline)) {
                    RetryDecision::Wait { delay, attempt } => {
                        debug!(during, attempt, ?delay, %details, "proxy unavailable; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        return Err(ApplyFailure::Transient {
                            during,
                            attempts,
                            details,
                        });
                    }
                    RetryDecision::OutOfTime => {
                        return Err(ApplyFailure::DeadlineExceeded { during });
                    }
                }
            }
        }
    }
}

/// The https frontend exists only while some certificate does; adding the
/// first or removing the last one changes the listeners and needs a reload.
fn same_frontends(a: &FullConfig, b: &FullConfig) -> bool {
    a.certificates.is_empty() == b.certificates.is_empty()
}

fn compare_routes(
    expected: &BTreeMap<String, String>,
    live: &BTreeMap<String, String>,
) -> Result<(), ApplyFailure> {
    let missing: Vec<String> = expected
        .iter()
        .filter(|(k, v)| live.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    let unexpected: Vec<String> = live
        .keys()
        .filter(|k| !expected.contains_key(*k))
        .cloned()
        .collect();
    if missing.is_empty() && unexpected.is_empty() {
        Ok(())
    } else {
        Err(ApplyFailure::Validation {
            missing,
            unexpected,
        })
    }
}

fn short_digest(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
