use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    InvalidObjectRef { value: String },
    InvalidBackendSpec { value: String, reason: &'static str },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidObjectRef { value } => {
                write!(f, "invalid object reference (expected namespace/name): {value}")
            }
            Self::InvalidBackendSpec { value, reason } => {
                write!(f, "invalid backend spec {value:?}: {reason}")
            }
        }
    }
}

impl std::error::Error for DomainError {}

/// Per-entity change status assigned by the reconciler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusTag {
    #[default]
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl StatusTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unchanged => "unchanged",
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the entity costs a write downstream.
    pub fn is_write(self) -> bool {
        self != Self::Unchanged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let invalid = || DomainError::InvalidObjectRef {
            value: value.to_string(),
        };
        let (namespace, name) = value.trim().split_once('/').ok_or_else(invalid)?;
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Target port of a route: numeric or named, never both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePort {
    Number(u16),
    Name(String),
}

impl fmt::Display for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Common surface of every status-tagged entity in a snapshot.
pub trait Entity: Clone {
    type Key: Ord + Clone + fmt::Display;
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
    fn status(&self) -> StatusTag;
    fn set_status(&mut self, status: StatusTag);
    /// Structural equality over semantic fields; status is ignored.
    fn same_as(&self, other: &Self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingPath {
    pub path: String,
    pub service: ObjectRef,
    pub port: ServicePort,
    #[serde(default)]
    pub status: StatusTag,
}

impl RoutingPath {
    pub fn new(path: impl Into<String>, service: ObjectRef, port: ServicePort) -> Self {
        Self {
            path: path.into(),
            service,
            port,
            status: StatusTag::Unchanged,
        }
    }

    pub fn backend_key(&self) -> BackendKey {
        BackendKey {
            service: self.service.clone(),
            port: self.port.clone(),
        }
    }
}

impl Entity for RoutingPath {
    type Key = String;
    const KIND: &'static str = "path";

    fn key(&self) -> String {
        self.path.clone()
    }

    fn status(&self) -> StatusTag {
        self.status
    }

    fn set_status(&mut self, status: StatusTag) {
        self.status = status;
    }

    fn same_as(&self, other: &Self) -> bool {
        self.path == other.path && self.service == other.service && self.port == other.port
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingRule {
    pub host: String,
    #[serde(with = "keyed_seq", default)]
    pub paths: BTreeMap<String, RoutingPath>,
    #[serde(default)]
    pub status: StatusTag,
}

impl RoutingRule {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            paths: BTreeMap::new(),
            status: StatusTag::Unchanged,
        }
    }

    /// Inserts a path; an existing entry with the same literal path is replaced.
    pub fn insert_path(&mut self, path: RoutingPath) -> Option<RoutingPath> {
        self.paths.insert(path.path.clone(), path)
    }
}

impl Entity for RoutingRule {
    type Key = String;
    const KIND: &'static str = "rule";

    fn key(&self) -> String {
        self.host.clone()
    }

    fn status(&self) -> StatusTag {
        self.status
    }

    fn set_status(&mut self, status: StatusTag) {
        self.status = status;
    }

    fn same_as(&self, other: &Self) -> bool {
        self.host == other.host
            && self.paths.len() == other.paths.len()
            && self
                .paths
                .iter()
                .zip(other.paths.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.same_as(b))
    }
}

/// Reference from a TLS binding to the secret holding its certificate.
///
/// Carries its own status: the secret content can change while the binding
/// keeps pointing at the same secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub secret: ObjectRef,
    #[serde(default)]
    pub status: StatusTag,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsBinding {
    pub host: String,
    pub secret: SecretRef,
    #[serde(default)]
    pub status: StatusTag,
}

impl TlsBinding {
    pub fn new(host: impl Into<String>, secret: ObjectRef) -> Self {
        Self {
            host: host.into(),
            secret: SecretRef {
                secret,
                status: StatusTag::Unchanged,
            },
            status: StatusTag::Unchanged,
        }
    }
}

impl Entity for TlsBinding {
    type Key = String;
    const KIND: &'static str = "tls";

    fn key(&self) -> String {
        self.host.clone()
    }

    fn status(&self) -> StatusTag {
        self.status
    }

    fn set_status(&mut self, status: StatusTag) {
        self.status = status;
    }

    fn same_as(&self, other: &Self) -> bool {
        self.host == other.host && self.secret.secret == other.secret.secret
    }
}

/// PEM bundle (chain followed by key) decoded from a TLS secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub secret: ObjectRef,
    pub pem: String,
    pub digest: String,
    #[serde(default)]
    pub status: StatusTag,
}

impl Certificate {
    pub fn new(secret: ObjectRef, pem: String) -> Self {
        let digest = sha256_hex(pem.as_bytes());
        Self {
            secret,
            pem,
            digest,
            status: StatusTag::Unchanged,
        }
    }
}

impl Entity for Certificate {
    type Key = ObjectRef;
    const KIND: &'static str = "certificate";

    fn key(&self) -> ObjectRef {
        self.secret.clone()
    }

    fn status(&self) -> StatusTag {
        self.status
    }

    fn set_status(&mut self, status: StatusTag) {
        self.status = status;
    }

    fn same_as(&self, other: &Self) -> bool {
        self.secret == other.secret && self.digest == other.digest
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub service: ObjectRef,
    pub port: ServicePort,
}

impl BackendKey {
    /// Parses `namespace/name:port`, where port is a number or a port name.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let (object, port) =
            value
                .trim()
                .rsplit_once(':')
                .ok_or_else(|| DomainError::InvalidBackendSpec {
                    value: value.to_string(),
                    reason: "missing :port suffix",
                })?;
        let service = ObjectRef::parse(object)?;
        let port = match port.parse::<u16>() {
            Ok(0) => {
                return Err(DomainError::InvalidBackendSpec {
                    value: value.to_string(),
                    reason: "port must be non-zero",
                });
            }
            Ok(n) => ServicePort::Number(n),
            Err(_) if !port.is_empty() => ServicePort::Name(port.to_string()),
            Err(_) => {
                return Err(DomainError::InvalidBackendSpec {
                    value: value.to_string(),
                    reason: "empty port",
                });
            }
        };
        Ok(Self { service, port })
    }

    /// Proxy-side backend name, e.g. `default_web_80`.
    pub fn name(&self) -> String {
        let raw = format!(
            "{}_{}_{}",
            self.service.namespace, self.service.name, self.port
        );
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

/// Backend definition with resolved `ip:port` servers, kept sorted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub key: BackendKey,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub status: StatusTag,
}

impl Backend {
    pub fn new(key: BackendKey, mut servers: Vec<String>) -> Self {
        servers.sort();
        servers.dedup();
        Self {
            key,
            servers,
            status: StatusTag::Unchanged,
        }
    }
}

impl Entity for Backend {
    type Key = BackendKey;
    const KIND: &'static str = "backend";

    fn key(&self) -> BackendKey {
        self.key.clone()
    }

    fn status(&self) -> StatusTag {
        self.status
    }

    fn set_status(&mut self, status: StatusTag) {
        self.status = status;
    }

    fn same_as(&self, other: &Self) -> bool {
        self.key == other.key && self.servers == other.servers
    }
}

/// Complete point-in-time view of routing and TLS state, desired or applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(with = "keyed_seq", default)]
    pub rules: BTreeMap<String, RoutingRule>,
    #[serde(with = "keyed_seq", default)]
    pub tls: BTreeMap<String, TlsBinding>,
    #[serde(with = "keyed_seq", default)]
    pub certificates: BTreeMap<ObjectRef, Certificate>,
    #[serde(with = "keyed_seq", default)]
    pub backends: BTreeMap<BackendKey, Backend>,
    #[serde(default)]
    pub default_backend: Option<BackendKey>,
    #[serde(default)]
    pub default_certificate: Option<ObjectRef>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
            && self.tls.is_empty()
            && self.backends.is_empty()
            && self.default_backend.is_none()
            && self.default_certificate.is_none()
    }

    pub fn path_count(&self) -> usize {
        self.rules.values().map(|r| r.paths.len()).sum()
    }

    pub fn default_certificate(&self) -> Option<&Certificate> {
        self.default_certificate
            .as_ref()
            .and_then(|secret| self.certificates.get(secret))
    }

    /// Copy with every status reset to `Unchanged`, as stored once applied.
    pub fn normalized(&self) -> Snapshot {
        let mut out = self.clone();
        for rule in out.rules.values_mut() {
            rule.status = StatusTag::Unchanged;
            for path in rule.paths.values_mut() {
                path.status = StatusTag::Unchanged;
            }
        }
        for binding in out.tls.values_mut() {
            binding.status = StatusTag::Unchanged;
            binding.secret.status = StatusTag::Unchanged;
        }
        for cert in out.certificates.values_mut() {
            cert.status = StatusTag::Unchanged;
        }
        for backend in out.backends.values_mut() {
            backend.status = StatusTag::Unchanged;
        }
        out
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes an entity map as a list of values; keys are rebuilt from the
/// entities on load so JSON never needs non-string map keys.
mod keyed_seq {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::Entity;

    pub fn serialize<S, V>(map: &BTreeMap<V::Key, V>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        V: Entity + Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, V>(deserializer: D) -> Result<BTreeMap<V::Key, V>, D::Error>
    where
        D: Deserializer<'de>,
        V: Entity + Deserialize<'de>,
    {
        let items = Vec::<V>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|v| (v.key(), v)).collect())
    }
}
