use std::{
    cmp::Ordering,
    collections::{BTreeMap, btree_map},
    fmt,
    iter::Peekable,
};

use serde::Serialize;

use crate::domain::{
    Backend, BackendKey, Certificate, Entity, ObjectRef, RoutingPath, Snapshot, StatusTag,
    TlsBinding,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileInvariantError {
    KeyMismatch {
        kind: &'static str,
        map_key: String,
        entity_key: String,
    },
    MissingCertificate {
        host: String,
        secret: ObjectRef,
    },
}

impl fmt::Display for ReconcileInvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyMismatch {
                kind,
                map_key,
                entity_key,
            } => write!(
                f,
                "{kind} stored under key {map_key:?} identifies itself as {entity_key:?}"
            ),
            Self::MissingCertificate { host, secret } => {
                write!(f, "tls binding for {host} references unknown certificate {secret}")
            }
        }
    }
}

impl std::error::Error for ReconcileInvariantError {}

/// One entity's transition. `previous` holds the applied version for
/// `Modified` and `Deleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub status: StatusTag,
    pub entity: T,
    pub previous: Option<T>,
}

impl<T> Change<T> {
    pub fn is_live(&self) -> bool {
        self.status != StatusTag::Deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleChange {
    pub host: String,
    pub status: StatusTag,
    pub paths: BTreeMap<String, Change<RoutingPath>>,
}

/// Transition of a single optional setting such as the default backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChange<T> {
    pub previous: Option<T>,
    pub current: Option<T>,
}

impl<T> Default for ValueChange<T> {
    fn default() -> Self {
        Self {
            previous: None,
            current: None,
        }
    }
}

impl<T: PartialEq> ValueChange<T> {
    pub fn status(&self) -> StatusTag {
        match (&self.previous, &self.current) {
            (None, None) => StatusTag::Unchanged,
            (None, Some(_)) => StatusTag::Added,
            (Some(_), None) => StatusTag::Deleted,
            (Some(a), Some(b)) if a == b => StatusTag::Unchanged,
            (Some(_), Some(_)) => StatusTag::Modified,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub rules: BTreeMap<String, RuleChange>,
    pub tls: BTreeMap<String, Change<TlsBinding>>,
    pub certificates: BTreeMap<ObjectRef, Change<Certificate>>,
    pub backends: BTreeMap<BackendKey, Change<Backend>>,
    pub default_backend: ValueChange<BackendKey>,
    pub default_certificate: ValueChange<ObjectRef>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSummary {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

impl ChangeSummary {
    fn count(&mut self, status: StatusTag) {
        match status {
            StatusTag::Added => self.added += 1,
            StatusTag::Modified => self.modified += 1,
            StatusTag::Deleted => self.deleted += 1,
            StatusTag::Unchanged => self.unchanged += 1,
        }
    }

    pub fn writes(&self) -> usize {
        self.added + self.modified + self.deleted
    }
}

impl ChangeSet {
    /// Status of every entity in the cycle, labelled as on the status board.
    pub fn entity_statuses(&self) -> Vec<(String, StatusTag)> {
        let mut out = Vec::new();
        for rule in self.rules.values() {
            out.push((format!("rule:{}", rule.host), rule.status));
            for change in rule.paths.values() {
                out.push((
                    format!("path:{}{}", rule.host, change.entity.path),
                    change.status,
                ));
            }
        }
        for (host, change) in &self.tls {
            let status = match change.status {
                StatusTag::Unchanged => change.entity.secret.status,
                other => other,
            };
            out.push((format!("tls:{host}"), status));
        }
        for (secret, change) in &self.certificates {
            out.push((format!("certificate:{secret}"), change.status));
        }
        for (key, change) in &self.backends {
            out.push((format!("backend:{key}"), change.status));
        }
        out
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for (_, status) in self.entity_statuses() {
            summary.count(status);
        }
        for status in [
            self.default_backend.status(),
            self.default_certificate.status(),
        ] {
            if status.is_write() {
                summary.count(status);
            }
        }
        summary
    }

    pub fn is_noop(&self) -> bool {
        self.summary().writes() == 0
    }

    /// Certificate backing the default TLS identity, if one is configured.
    pub fn default_certificate(&self) -> Option<&Certificate> {
        self.default_certificate
            .current
            .as_ref()
            .and_then(|secret| self.certificates.get(secret))
            .filter(|c| c.is_live())
            .map(|c| &c.entity)
    }
}

enum Joined<'a, V> {
    Desired(&'a V),
    Applied(&'a V),
    Both(&'a V, &'a V),
}

/// Sorted merge-join over two ordered maps; each key is visited once.
struct MergeJoin<'a, K, V> {
    desired: Peekable<btree_map::Iter<'a, K, V>>,
    applied: Peekable<btree_map::Iter<'a, K, V>>,
}

fn merge_join<'a, K: Ord, V>(
    desired: &'a BTreeMap<K, V>,
    applied: &'a BTreeMap<K, V>,
) -> MergeJoin<'a, K, V> {
    MergeJoin {
        desired: desired.iter().peekable(),
        applied: applied.iter().peekable(),
    }
}

impl<'a, K: Ord, V> Iterator for MergeJoin<'a, K, V> {
    type Item = (&'a K, Joined<'a, V>);

    fn next(&mut self) -> Option<Self::Item> {
        let order = match (self.desired.peek(), self.applied.peek()) {
            (None, None) => return None,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((d, _)), Some((a, _))) => d.cmp(a),
        };
        match order {
            Ordering::Less => {
                let (k, v) = self.desired.next()?;
                Some((k, Joined::Desired(v)))
            }
            Ordering::Greater => {
                let (k, v) = self.applied.next()?;
                Some((k, Joined::Applied(v)))
            }
            Ordering::Equal => {
                let (k, d) = self.desired.next()?;
                let (_, a) = self.applied.next()?;
                Some((k, Joined::Both(d, a)))
            }
        }
    }
}

fn check_key<E: Entity>(map_key: &E::Key, entity: &E) -> Result<(), ReconcileInvariantError> {
    let entity_key = entity.key();
    if *map_key != entity_key {
        return Err(ReconcileInvariantError::KeyMismatch {
            kind: E::KIND,
            map_key: map_key.to_string(),
            entity_key: entity_key.to_string(),
        });
    }
    Ok(())
}

fn tagged<E: Entity>(entity: &E, status: StatusTag) -> E {
    let mut out = entity.clone();
    out.set_status(status);
    out
}

fn classify<E: Entity>(joined: Joined<'_, E>) -> Change<E> {
    match joined {
        Joined::Desired(d) => Change {
            status: StatusTag::Added,
            entity: tagged(d, StatusTag::Added),
            previous: None,
        },
        Joined::Applied(a) => Change {
            status: StatusTag::Deleted,
            entity: tagged(a, StatusTag::Deleted),
            previous: Some(tagged(a, StatusTag::Unchanged)),
        },
        Joined::Both(d, a) if d.same_as(a) => Change {
            status: StatusTag::Unchanged,
            entity: tagged(d, StatusTag::Unchanged),
            previous: None,
        },
        Joined::Both(d, a) => Change {
            status: StatusTag::Modified,
            entity: tagged(d, StatusTag::Modified),
            previous: Some(tagged(a, StatusTag::Unchanged)),
        },
    }
}

fn diff_entities<E: Entity>(
    desired: &BTreeMap<E::Key, E>,
    applied: &BTreeMap<E::Key, E>,
) -> Result<BTreeMap<E::Key, Change<E>>, ReconcileInvariantError> {
    merge_join(desired, applied)
        .map(|(key, joined)| {
            match &joined {
                Joined::Desired(e) | Joined::Applied(e) => check_key(key, *e)?,
                Joined::Both(d, a) => {
                    check_key(key, *d)?;
                    check_key(key, *a)?;
                }
            }
            Ok((key.clone(), classify(joined)))
        })
        .collect()
}

fn all_paths(
    paths: &BTreeMap<String, RoutingPath>,
    status: StatusTag,
) -> Result<BTreeMap<String, Change<RoutingPath>>, ReconcileInvariantError> {
    paths
        .iter()
        .map(|(key, path)| {
            check_key(key, path)?;
            let previous = (status == StatusTag::Deleted).then(|| tagged(path, StatusTag::Unchanged));
            Ok((
                key.clone(),
                Change {
                    status,
                    entity: tagged(path, status),
                    previous,
                },
            ))
        })
        .collect()
}

fn check_bindings(snapshot: &Snapshot) -> Result<(), ReconcileInvariantError> {
    for (host, binding) in &snapshot.tls {
        if !snapshot.certificates.contains_key(&binding.secret.secret) {
            return Err(ReconcileInvariantError::MissingCertificate {
                host: host.clone(),
                secret: binding.secret.secret.clone(),
            });
        }
    }
    Ok(())
}

/// Computes the change set turning `applied` into `desired`.
///
/// Runs in time linear in the total number of entities. Neither input is
/// modified.
pub fn reconcile(
    desired: &Snapshot,
    applied: &Snapshot,
) -> Result<ChangeSet, ReconcileInvariantError> {
    check_bindings(desired)?;
    check_bindings(applied)?;

    let mut rules = BTreeMap::new();
    for (host, joined) in merge_join(&desired.rules, &applied.rules) {
        let change = match joined {
            Joined::Desired(d) => {
                check_key(host, d)?;
                RuleChange {
                    host: host.clone(),
                    status: StatusTag::Added,
                    paths: all_paths(&d.paths, StatusTag::Added)?,
                }
            }
            Joined::Applied(a) => {
                check_key(host, a)?;
                RuleChange {
                    host: host.clone(),
                    status: StatusTag::Deleted,
                    paths: all_paths(&a.paths, StatusTag::Deleted)?,
                }
            }
            Joined::Both(d, a) => {
                check_key(host, d)?;
                check_key(host, a)?;
                RuleChange {
                    host: host.clone(),
                    status: StatusTag::Unchanged,
                    paths: diff_entities(&d.paths, &a.paths)?,
                }
            }
        };
        rules.insert(host.clone(), change);
    }

    let certificates = diff_entities(&desired.certificates, &applied.certificates)?;

    let mut tls = diff_entities(&desired.tls, &applied.tls)?;
    for change in tls.values_mut() {
        change.entity.secret.status = match change.status {
            StatusTag::Unchanged => {
                let content_changed = certificates
                    .get(&change.entity.secret.secret)
                    .is_some_and(|c| c.status == StatusTag::Modified);
                if content_changed {
                    StatusTag::Modified
                } else {
                    StatusTag::Unchanged
                }
            }
            other => other,
        };
    }

    let backends = diff_entities(&desired.backends, &applied.backends)?;

    Ok(ChangeSet {
        rules,
        tls,
        certificates,
        backends,
        default_backend: ValueChange {
            previous: applied.default_backend.clone(),
            current: desired.default_backend.clone(),
        },
        default_certificate: ValueChange {
            previous: applied.default_certificate.clone(),
            current: desired.default_certificate.clone(),
        },
    })
}
