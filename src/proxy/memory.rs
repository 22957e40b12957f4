//! In-process proxy used by `--dry-run` and tests.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
};

use super::{ControlError, ControlFuture, ControlSurface};
use crate::render::{FullConfig, Operation, route_key};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Apply(Operation),
    WriteConfig { digest: String },
    Reload,
    LiveRoutes,
    Probe,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub routes: BTreeMap<String, String>,
    /// TLS host -> PEM installed through dynamic updates.
    pub certificates: BTreeMap<String, String>,
    pub backends: BTreeMap<String, Vec<String>>,
    /// Config on disk.
    pub written: Option<FullConfig>,
    /// Config loaded by the last successful reload.
    pub running: Option<FullConfig>,
    pub reloads: usize,
    pub calls: Vec<Call>,
    pub faults: Faults,
}

#[derive(Debug, Default)]
pub struct Faults {
    pub no_dynamic: bool,
    /// Operation kinds the capability check refuses.
    pub refuse_kinds: BTreeSet<&'static str>,
    /// Operation kinds that pass the capability check but fail when applied.
    pub reject_kinds: BTreeSet<&'static str>,
    /// The next N calls fail as unavailable.
    pub unavailable_calls: usize,
    /// The next N reloads are rejected.
    pub reject_reloads: usize,
    /// The next N reloads report success but keep serving the old routes.
    pub stale_reloads: usize,
    pub down: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reloads(&self) -> usize {
        self.state().reloads
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn applied_ops(&self) -> Vec<Operation> {
        self.state()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Apply(op) => Some(op.clone()),
                _ => None,
            })
            .collect()
    }

    fn enter(&self, call: Call) -> Result<MutexGuard<'_, MemoryState>, ControlError> {
        let mut state = self.state();
        state.calls.push(call);
        if state.faults.down {
            return Err(ControlError::unavailable("proxy is down"));
        }
        if state.faults.unavailable_calls > 0 {
            state.faults.unavailable_calls -= 1;
            return Err(ControlError::unavailable("injected outage"));
        }
        Ok(state)
    }

    fn apply_now(&self, op: &Operation) -> Result<(), ControlError> {
        let mut state = self.enter(Call::Apply(op.clone()))?;
        if state.faults.reject_kinds.contains(op.kind()) {
            return Err(ControlError::rejected(format!("{} refused", op.kind())));
        }
        match op {
            Operation::UpsertCertificate { host, pem, .. } => {
                state.certificates.insert(host.clone(), pem.clone());
            }
            Operation::RemoveCertificate { host } => {
                state.certificates.remove(host);
            }
            Operation::AddBackend { backend, servers }
            | Operation::SetBackendServers { backend, servers } => {
                state.backends.insert(backend.clone(), servers.clone());
            }
            Operation::RemoveBackend { backend } => {
                state.backends.remove(backend);
            }
            Operation::UpsertRoute {
                host,
                path,
                backend,
            } => {
                state.routes.insert(route_key(host, path), backend.clone());
            }
            Operation::RemoveRoute { host, path } => {
                state.routes.remove(&route_key(host, path));
            }
            Operation::SetDefaultBackend { .. } | Operation::SetDefaultCertificate { .. } => {
                return Err(ControlError::rejected("requires reload"));
            }
        }
        Ok(())
    }

    fn reload_now(&self) -> Result<(), ControlError> {
        let mut state = self.enter(Call::Reload)?;
        if state.faults.reject_reloads > 0 {
            state.faults.reject_reloads -= 1;
            return Err(ControlError::rejected("configuration check failed"));
        }
        let Some(written) = state.written.clone() else {
            return Err(ControlError::rejected("no configuration on disk"));
        };
        state.reloads += 1;
        if state.faults.stale_reloads > 0 {
            state.faults.stale_reloads -= 1;
            return Ok(());
        }
        state.routes = written.routes.clone();
        state.running = Some(written);
        Ok(())
    }
}

impl ControlSurface for MemorySurface {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_dynamic(&self) -> bool {
        !self.state().faults.no_dynamic
    }

    fn accepts(&self, op: &Operation) -> bool {
        if matches!(
            op,
            Operation::SetDefaultBackend { .. } | Operation::SetDefaultCertificate { .. }
        ) {
            return false;
        }
        !self.state().faults.refuse_kinds.contains(op.kind())
    }

    fn apply(&self, op: &Operation) -> ControlFuture<()> {
        let result = self.apply_now(op);
        Box::pin(async move { result })
    }

    fn write_config(&self, full: &FullConfig) -> ControlFuture<()> {
        let result = self
            .enter(Call::WriteConfig {
                digest: full.digest.clone(),
            })
            .map(|mut state| {
                state.written = Some(full.clone());
            });
        Box::pin(async move { result })
    }

    fn reload(&self) -> ControlFuture<()> {
        let result = self.reload_now();
        Box::pin(async move { result })
    }

    fn live_routes(&self) -> ControlFuture<BTreeMap<String, String>> {
        let result = self.enter(Call::LiveRoutes).map(|state| state.routes.clone());
        Box::pin(async move { result })
    }

    fn probe(&self) -> ControlFuture<()> {
        let result = self.enter(Call::Probe).map(|_| ());
        Box::pin(async move { result })
    }
}
