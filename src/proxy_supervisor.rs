use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    proxy::{ControlError, ControlSurface},
    reconcile::ReconcileHandle,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Up,
    Down,
}

impl ProxyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProxyHealthSnapshot {
    pub status: ProxyStatus,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_fail_at: Option<DateTime<Utc>>,
    pub down_since: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub recoveries_observed: u64,
}

/// What a single probe result did to the tracked status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Steady,
    /// First success after startup.
    Available,
    /// Down -> Up: the proxy restarted and may have lost runtime-only state.
    Recovered,
    WentDown,
    StillDown,
}

impl ProxyHealthSnapshot {
    fn observe_ok(&mut self, at: DateTime<Utc>) -> Transition {
        self.last_ok_at = Some(at);
        self.consecutive_failures = 0;
        let transition = match self.status {
            ProxyStatus::Down => {
                self.down_since = None;
                self.recoveries_observed = self.recoveries_observed.saturating_add(1);
                Transition::Recovered
            }
            ProxyStatus::Unknown => Transition::Available,
            ProxyStatus::Up => Transition::Steady,
        };
        self.status = ProxyStatus::Up;
        transition
    }

    fn observe_failure(&mut self, at: DateTime<Utc>, fails_before_down: u32) -> Transition {
        self.last_fail_at = Some(at);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.status {
            ProxyStatus::Down => Transition::StillDown,
            _ if self.consecutive_failures >= fails_before_down.max(1) => {
                self.status = ProxyStatus::Down;
                self.down_since = Some(at);
                Transition::WentDown
            }
            _ => Transition::Steady,
        }
    }
}

/// Read side of the supervisor, shared with the HTTP surface.
#[derive(Debug, Clone)]
pub struct ProxyHealthHandle {
    inner: Arc<RwLock<ProxyHealthSnapshot>>,
}

impl ProxyHealthHandle {
    pub fn new_unknown() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProxyHealthSnapshot::default())),
        }
    }

    pub async fn snapshot(&self) -> ProxyHealthSnapshot {
        self.inner.read().await.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ProxySupervisorOptions {
    pub interval: Duration,
    /// Consecutive failed probes before the proxy counts as down.
    pub fails_before_down: u32,
    pub probe_timeout: Duration,
    /// Minimum spacing of "still down" warnings.
    pub down_log_throttle: Duration,
}

impl Default for ProxySupervisorOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            fails_before_down: 3,
            probe_timeout: Duration::from_secs(2),
            down_log_throttle: Duration::from_secs(30),
        }
    }
}

/// Probes the proxy on a fixed interval. Recovery from down requests a
/// verifying resync so the live config is rebuilt if the restart lost it.
pub fn spawn_proxy_supervisor(
    surface: Arc<dyn ControlSurface>,
    opts: ProxySupervisorOptions,
    reconcile: ReconcileHandle,
    mut shutdown: watch::Receiver<bool>,
) -> (ProxyHealthHandle, JoinHandle<()>) {
    let health = ProxyHealthHandle::new_unknown();
    let shared = health.inner.clone();

    let task = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(opts.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut down_warned_at: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = ticks.tick() => {}
            }

            let probe = tokio::time::timeout(opts.probe_timeout, surface.probe())
                .await
                .unwrap_or_else(|_| Err(ControlError::unavailable("probe timed out")));
            let at = Utc::now();
            let (transition, failures) = {
                let mut snap = shared.write().await;
                let transition = match &probe {
                    Ok(()) => snap.observe_ok(at),
                    Err(_) => snap.observe_failure(at, opts.fails_before_down),
                };
                (transition, snap.consecutive_failures)
            };

            let proxy = surface.name();
            match (transition, probe) {
                (Transition::Recovered, _) => {
                    info!(proxy, "proxy recovered; requesting resync");
                    down_warned_at = None;
                    reconcile.request_resync();
                }
                (Transition::Available, _) => info!(proxy, "proxy available"),
                (Transition::WentDown, Err(err)) => {
                    warn!(proxy, failures, error = %err, "proxy marked down");
                    down_warned_at = Some(Instant::now());
                }
                (Transition::StillDown, Err(err)) => {
                    let due = down_warned_at
                        .is_none_or(|t| t.elapsed() >= opts.down_log_throttle);
                    if due {
                        warn!(proxy, failures, error = %err, "proxy still down");
                        down_warned_at = Some(Instant::now());
                    } else {
                        debug!(error = %err, "proxy probe failed");
                    }
                }
                (_, Err(err)) => debug!(proxy, failures, error = %err, "proxy probe failed"),
                (_, Ok(())) => debug!(proxy, "proxy probe ok"),
            }
        }
    });

    (health, task)
}
