use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;
use tokio::{
    sync::{RwLock, watch},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

use crate::{
    reconcile::ReconcileHandle,
    resources::{Object, ObjectKey, ObjectKind, ObjectSet},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    Applied(Object),
    Deleted(ObjectKey),
}

/// Latest known version of every watched object.
#[derive(Debug, Clone, Default)]
pub struct ObjectCache {
    objects: ObjectSet,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the cache changed; identical re-deliveries do not.
    pub fn apply(&mut self, event: ObjectEvent) -> bool {
        match event {
            ObjectEvent::Applied(object) => self.objects.upsert(object),
            ObjectEvent::Deleted(key) => self.objects.remove(&key),
        }
    }

    pub fn replace_all(&mut self, objects: ObjectSet) -> bool {
        if self.objects == objects {
            return false;
        }
        self.objects = objects;
        true
    }

    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }
}

pub type SharedObjects = Arc<RwLock<ObjectCache>>;

pub fn shared_objects() -> SharedObjects {
    Arc::new(RwLock::new(ObjectCache::new()))
}

/// Applies `event` and wakes the sync loop when it changed something.
pub async fn deliver(objects: &SharedObjects, handle: &ReconcileHandle, event: ObjectEvent) -> bool {
    let changed = objects.write().await.apply(event);
    if changed {
        handle.request_changed();
    }
    changed
}

#[derive(Debug)]
pub enum SourceError {
    Io { path: PathBuf, source: io::Error },
    Parse { path: PathBuf, details: String },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "read {}: {source}", path.display()),
            Self::Parse { path, details } => write!(f, "parse {}: {details}", path.display()),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

fn is_manifest(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Parses every document in `text`. Documents of other kinds are skipped;
/// `kind: List` documents are flattened.
pub fn parse_manifests(path: &Path, text: &str) -> Result<Vec<Object>, SourceError> {
    let parse_err = |details: String| SourceError::Parse {
        path: path.to_path_buf(),
        details,
    };
    let mut out = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document).map_err(|e| parse_err(e.to_string()))?;
        collect_objects(value, &mut out).map_err(parse_err)?;
    }
    Ok(out)
}

fn collect_objects(value: serde_yaml::Value, out: &mut Vec<Object>) -> Result<(), String> {
    if value.is_null() {
        return Ok(());
    }
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .map(str::to_string)
        .ok_or_else(|| "document has no kind".to_string())?;
    if kind == "List" {
        let items = value
            .get("items")
            .and_then(|i| i.as_sequence())
            .cloned()
            .unwrap_or_default();
        for item in items {
            collect_objects(item, out)?;
        }
        return Ok(());
    }
    if ObjectKind::parse(&kind).is_none() {
        debug!(kind, "skipping unsupported manifest kind");
        return Ok(());
    }
    let object: Object = serde_yaml::from_value(value).map_err(|e| format!("{kind}: {e}"))?;
    out.push(object);
    Ok(())
}

/// Reads every manifest file directly under `dir` in file-name order; a
/// later definition of the same object replaces an earlier one.
pub fn load_manifest_dir(dir: &Path) -> Result<ObjectSet, SourceError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| SourceError::Io { path, source }
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if path.is_file() && is_manifest(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut objects = ObjectSet::default();
    for path in paths {
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        for object in parse_manifests(&path, &text)? {
            objects.upsert(object);
        }
    }
    Ok(objects)
}

#[derive(Debug, Clone)]
pub struct ManifestDirSource {
    pub dir: PathBuf,
    pub poll_interval: Duration,
}

impl ManifestDirSource {
    /// Reloads the directory into `objects`; returns whether anything changed.
    /// A directory that fails to parse leaves the cache untouched.
    pub async fn poll_once(&self, objects: &SharedObjects) -> Result<bool, SourceError> {
        let dir = self.dir.clone();
        let loaded = tokio::task::spawn_blocking(move || load_manifest_dir(&dir))
            .await
            .map_err(|e| SourceError::Parse {
                path: self.dir.clone(),
                details: format!("loader task failed: {e}"),
            })??;
        Ok(objects.write().await.replace_all(loaded))
    }

    pub fn spawn(
        self,
        objects: SharedObjects,
        handle: ReconcileHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failing = false;
            info!(dir = %self.dir.display(), "watching manifest directory");
            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tick.tick() => {
                        match self.poll_once(&objects).await {
                            Ok(changed) => {
                                if failing {
                                    info!(dir = %self.dir.display(), "manifest directory readable again");
                                    failing = false;
                                }
                                if changed {
                                    debug!("manifest objects changed");
                                    handle.request_changed();
                                }
                            }
                            Err(err) => {
                                if !failing {
                                    warn!(%err, "manifest load failed; keeping previous objects");
                                }
                                failing = true;
                            }
                        }
                    }
                }
            }
        })
    }
}
