use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{convert::ValidationError, diff::ChangeSummary, domain::StatusTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Collecting,
    Reconciling,
    Applying,
    Cooldown,
    Stopped,
}

impl LoopPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Collecting => "collecting",
            Self::Reconciling => "reconciling",
            Self::Applying => "applying",
            Self::Cooldown => "cooldown",
            Self::Stopped => "stopped",
        }
    }
}

/// Latest known state of one entity: its change tag, or why it was excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EntityReport {
    Status { status: StatusTag },
    Error { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleResult {
    Applied,
    Noop,
    Deferred,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub cycle_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: CycleResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub changes: ChangeSummary,
    pub validation_errors: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopCounters {
    pub cycles: u64,
    pub applied: u64,
    pub noop: u64,
    pub deferred: u64,
    pub failed: u64,
    pub dynamic_applies: u64,
    pub reloads: u64,
    pub rollbacks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub phase: LoopPhase,
    pub phase_since: DateTime<Utc>,
    pub counters: LoopCounters,
    pub last_cycle: Option<CycleSummary>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BoardState {
    phase: LoopPhase,
    phase_since: DateTime<Utc>,
    counters: LoopCounters,
    last_cycle: Option<CycleSummary>,
    last_success_at: Option<DateTime<Utc>>,
    entities: BTreeMap<String, EntityReport>,
}

/// Shared, read-mostly view of the sync loop for the HTTP surface.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    inner: Arc<RwLock<BoardState>>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(BoardState {
                phase: LoopPhase::Idle,
                phase_since: Utc::now(),
                counters: LoopCounters::default(),
                last_cycle: None,
                last_success_at: None,
                entities: BTreeMap::new(),
            })),
        }
    }

    pub async fn set_phase(&self, phase: LoopPhase) {
        let mut state = self.inner.write().await;
        if state.phase != phase {
            state.phase = phase;
            state.phase_since = Utc::now();
        }
    }

    pub async fn phase(&self) -> LoopPhase {
        self.inner.read().await.phase
    }

    /// Replaces the entity table with the outcome of the latest reconcile.
    pub async fn record_entities(
        &self,
        statuses: Vec<(String, StatusTag)>,
        errors: &[ValidationError],
    ) {
        let mut entities: BTreeMap<String, EntityReport> = statuses
            .into_iter()
            .map(|(label, status)| (label, EntityReport::Status { status }))
            .collect();
        for err in errors {
            entities.insert(
                err.entity_label(),
                EntityReport::Error {
                    error: err.to_string(),
                },
            );
        }
        self.inner.write().await.entities = entities;
    }

    pub async fn record_cycle(&self, summary: CycleSummary, reloads: u64, rollback: bool) {
        let mut state = self.inner.write().await;
        let counters = &mut state.counters;
        counters.cycles += 1;
        counters.reloads += reloads;
        if rollback {
            counters.rollbacks += 1;
        }
        match summary.result {
            CycleResult::Applied => {
                counters.applied += 1;
                if summary.mode == Some("dynamic") {
                    counters.dynamic_applies += 1;
                }
            }
            CycleResult::Noop => counters.noop += 1,
            CycleResult::Deferred => counters.deferred += 1,
            CycleResult::Failed => counters.failed += 1,
        }
        if matches!(summary.result, CycleResult::Applied | CycleResult::Noop) {
            state.last_success_at = Some(summary.finished_at);
        }
        state.last_cycle = Some(summary);
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.inner.read().await;
        StatusSnapshot {
            phase: state.phase,
            phase_since: state.phase_since,
            counters: state.counters.clone(),
            last_cycle: state.last_cycle.clone(),
            last_success_at: state.last_success_at,
        }
    }

    pub async fn entities(&self) -> BTreeMap<String, EntityReport> {
        self.inner.read().await.entities.clone()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::domain::ObjectRef;

    fn summary(result: CycleResult, mode: Option<&'static str>) -> CycleSummary {
        CycleSummary {
            cycle_id: "c".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            result,
            mode,
            error: None,
            changes: ChangeSummary::default(),
            validation_errors: 0,
        }
    }

    #[tokio::test]
    async fn counters_follow_cycle_results() {
        let board = StatusBoard::new();
        board
            .record_cycle(summary(CycleResult::Applied, Some("dynamic")), 0, false)
            .await;
        board
            .record_cycle(summary(CycleResult::Failed, None), 2, true)
            .await;
        board.record_cycle(summary(CycleResult::Noop, None), 0, false).await;

        let snap = board.snapshot().await;
        assert_eq!(
            snap.counters,
            LoopCounters {
                cycles: 3,
                applied: 1,
                noop: 1,
                deferred: 0,
                failed: 1,
                dynamic_applies: 1,
                reloads: 2,
                rollbacks: 1,
            }
        );
        assert!(snap.last_success_at.is_some());
        assert_eq!(snap.last_cycle.unwrap().result, CycleResult::Noop);
    }

    #[tokio::test]
    async fn entity_table_carries_statuses_and_errors() {
        let board = StatusBoard::new();
        let errors = vec![ValidationError::MissingSecret {
            ingress: Some(ObjectRef::new("ns", "web")),
            host: Some("b.example.com".to_string()),
            secret: ObjectRef::new("ns", "b-tls"),
        }];
        board
            .record_entities(
                vec![("rule:a.example.com".to_string(), StatusTag::Added)],
                &errors,
            )
            .await;

        let entities = board.entities().await;
        assert_eq!(
            entities["rule:a.example.com"],
            EntityReport::Status {
                status: StatusTag::Added
            }
        );
        assert!(matches!(
            &entities["tls:b.example.com"],
            EntityReport::Error { error } if error.contains("ns/b-tls")
        ));
    }

    #[tokio::test]
    async fn phase_changes_update_timestamp_only_on_transition() {
        let board = StatusBoard::new();
        let since = board.snapshot().await.phase_since;
        board.set_phase(LoopPhase::Idle).await;
        assert_eq!(board.snapshot().await.phase_since, since);
        board.set_phase(LoopPhase::Collecting).await;
        assert_eq!(board.phase().await, LoopPhase::Collecting);
    }
}
