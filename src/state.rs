use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{domain::Snapshot, render::FullConfig};

pub const SCHEMA_VERSION: u32 = 1;
pub const STATE_FILE: &str = "applied.json";

#[derive(Debug, Clone, Default)]
pub struct StoreInit {
    /// Where the applied snapshot is persisted; `None` keeps it in memory.
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
    SchemaVersionMismatch { expected: u32, got: u32 },
    NoDesiredSnapshot,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
            Self::SchemaVersionMismatch { expected, got } => {
                write!(f, "schema_version mismatch: expected {expected}, got {got}")
            }
            Self::NoDesiredSnapshot => write!(f, "no desired snapshot to commit"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
            Self::SchemaVersionMismatch { .. } | Self::NoDesiredSnapshot => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedState {
    pub schema_version: u32,
    #[serde(default)]
    pub applied: Snapshot,
    /// Full configuration last confirmed live; rollback target.
    #[serde(default)]
    pub last_good: Option<FullConfig>,
    #[serde(default)]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cycle_id: Option<String>,
}

impl PersistedState {
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            applied: Snapshot::default(),
            last_good: None,
            applied_at: None,
            cycle_id: None,
        }
    }
}

/// Owns the desired and applied snapshots. Only the sync loop holds it.
#[derive(Debug)]
pub struct StateStore {
    state_path: Option<PathBuf>,
    state: PersistedState,
    desired: Option<Snapshot>,
}

impl StateStore {
    pub fn load_or_init(init: StoreInit) -> Result<Self, StoreError> {
        let Some(state_dir) = init.state_dir else {
            return Ok(Self::in_memory());
        };
        fs::create_dir_all(&state_dir)?;

        let state_path = state_dir.join(STATE_FILE);
        let state = if state_path.exists() {
            let bytes = fs::read(&state_path)?;
            let state: PersistedState = serde_json::from_slice(&bytes)?;
            if state.schema_version != SCHEMA_VERSION {
                return Err(StoreError::SchemaVersionMismatch {
                    expected: SCHEMA_VERSION,
                    got: state.schema_version,
                });
            }
            state
        } else {
            PersistedState::empty()
        };

        Ok(Self {
            state_path: Some(state_path),
            state,
            desired: None,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            state_path: None,
            state: PersistedState::empty(),
            desired: None,
        }
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn applied(&self) -> &Snapshot {
        &self.state.applied
    }

    pub fn last_good(&self) -> Option<&FullConfig> {
        self.state.last_good.as_ref()
    }

    pub fn desired(&self) -> Option<&Snapshot> {
        self.desired.as_ref()
    }

    /// Replaces the desired snapshot; the previous one is dropped untouched.
    pub fn set_desired(&mut self, snapshot: Snapshot) {
        self.desired = Some(snapshot);
    }

    /// Advances applied to the current desired snapshot and records `full` as
    /// the last-known-good configuration. Disk is written before memory so a
    /// failed write leaves both unchanged.
    pub(crate) fn commit(
        &mut self,
        full: &FullConfig,
        cycle_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let desired = self.desired.as_ref().ok_or(StoreError::NoDesiredSnapshot)?;
        let next = PersistedState {
            schema_version: SCHEMA_VERSION,
            applied: desired.normalized(),
            last_good: Some(full.clone()),
            applied_at: Some(Utc::now()),
            cycle_id: cycle_id.map(str::to_string),
        };
        if let Some(path) = self.state_path.as_deref() {
            let mut bytes = serde_json::to_vec_pretty(&next)?;
            bytes.push(b'\n');
            write_atomic(path, &bytes)?;
        }
        self.state = next;
        Ok(())
    }
}

/// Replaces `path` through a synced sibling `.tmp` file and a rename, so a
/// reader sees either the old or the new content. The `.tmp` file does not
/// outlive a failed write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a file path: {}", path.display()),
        ));
    };
    let staging = dir.join(format!("{}.tmp", name.to_string_lossy()));
    let written = fs::File::create(&staging)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&staging, path));
    if written.is_err() && staging.is_file() {
        let _ = fs::remove_file(&staging);
    }
    written
}
