use std::{collections::BTreeMap, fmt::Write as _, path::PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::{
    diff::ChangeSet,
    domain::{ObjectRef, StatusTag},
};

pub const FALLBACK_BACKEND: &str = "_default_404";
pub const DEFAULT_CERT_FILE: &str = "_default.pem";

/// A single incremental change for the running proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    UpsertCertificate {
        host: String,
        secret: ObjectRef,
        pem: String,
    },
    RemoveCertificate {
        host: String,
    },
    SetDefaultCertificate {
        secret: Option<ObjectRef>,
    },
    AddBackend {
        backend: String,
        servers: Vec<String>,
    },
    SetBackendServers {
        backend: String,
        servers: Vec<String>,
    },
    RemoveBackend {
        backend: String,
    },
    UpsertRoute {
        host: String,
        path: String,
        backend: String,
    },
    RemoveRoute {
        host: String,
        path: String,
    },
    SetDefaultBackend {
        backend: Option<String>,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpsertCertificate { .. } => "upsert_certificate",
            Self::RemoveCertificate { .. } => "remove_certificate",
            Self::SetDefaultCertificate { .. } => "set_default_certificate",
            Self::AddBackend { .. } => "add_backend",
            Self::SetBackendServers { .. } => "set_backend_servers",
            Self::RemoveBackend { .. } => "remove_backend",
            Self::UpsertRoute { .. } => "upsert_route",
            Self::RemoveRoute { .. } => "remove_route",
            Self::SetDefaultBackend { .. } => "set_default_backend",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpsertCertificate { host, secret, .. } => {
                write!(f, "upsert certificate {host} from {secret}")
            }
            Self::RemoveCertificate { host } => write!(f, "remove certificate {host}"),
            Self::SetDefaultCertificate { secret: Some(s) } => {
                write!(f, "set default certificate {s}")
            }
            Self::SetDefaultCertificate { secret: None } => write!(f, "clear default certificate"),
            Self::AddBackend { backend, servers } => {
                write!(f, "add backend {backend} ({} servers)", servers.len())
            }
            Self::SetBackendServers { backend, servers } => {
                write!(f, "set backend {backend} servers ({})", servers.len())
            }
            Self::RemoveBackend { backend } => write!(f, "remove backend {backend}"),
            Self::UpsertRoute {
                host,
                path,
                backend,
            } => write!(f, "route {host}{path} -> {backend}"),
            Self::RemoveRoute { host, path } => write!(f, "remove route {host}{path}"),
            Self::SetDefaultBackend { backend: Some(b) } => write!(f, "set default backend {b}"),
            Self::SetDefaultBackend { backend: None } => write!(f, "clear default backend"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub http_port: u16,
    pub https_port: u16,
    pub map_path: PathBuf,
    pub wildcard_map_path: PathBuf,
    pub crt_list_path: PathBuf,
    pub cert_dir: PathBuf,
    pub admin_socket: PathBuf,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            map_path: PathBuf::from("/etc/haproxy/routes.map"),
            wildcard_map_path: PathBuf::from("/etc/haproxy/routes-wildcard.map"),
            crt_list_path: PathBuf::from("/etc/haproxy/crt-list.txt"),
            cert_dir: PathBuf::from("/etc/haproxy/certs"),
            admin_socket: PathBuf::from("/var/run/haproxy/admin.sock"),
        }
    }
}

/// Complete proxy configuration for the effective state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullConfig {
    pub config: String,
    pub route_map: String,
    /// Regex-keyed map for `*.` hosts, consulted after `route_map`.
    #[serde(default)]
    pub wildcard_map: String,
    pub crt_list: String,
    /// Certificate file name -> PEM bundle.
    pub certificates: BTreeMap<String, String>,
    /// `host+path` -> backend name; what the live route table should hold.
    pub routes: BTreeMap<String, String>,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifacts {
    pub operations: Vec<Operation>,
    pub full: FullConfig,
}

pub fn route_key(host: &str, path: &str) -> String {
    format!("{host}{path}")
}

const WILDCARD_LABEL: &str = "^[^./]+";

/// `map_reg` key for a `*.suffix/path` route key. The `*` stands for exactly
/// one DNS label and the path stays a prefix match.
pub fn wildcard_pattern(key: &str) -> Option<String> {
    let rest = key.strip_prefix('*')?;
    if !rest.starts_with('.') {
        return None;
    }
    let mut pattern = String::from(WILDCARD_LABEL);
    for c in rest.chars() {
        if matches!(
            c,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    Some(pattern)
}

/// Route key a `wildcard_pattern` was built from.
pub fn wildcard_route_key(pattern: &str) -> Option<String> {
    let escaped = pattern.strip_prefix(WILDCARD_LABEL)?;
    let mut key = String::from("*");
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            key.extend(chars.next());
        } else {
            key.push(c);
        }
    }
    Some(key)
}

/// Certificate file name for a TLS host; wildcards become `_wildcard.`.
pub fn cert_file_name(host: &str) -> String {
    let base = match host.strip_prefix("*.") {
        Some(rest) => format!("_wildcard.{rest}"),
        None => host.to_string(),
    };
    let safe: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.pem")
}

pub fn render(changes: &ChangeSet, options: &RenderOptions) -> Artifacts {
    Artifacts {
        operations: render_operations(changes),
        full: render_full(changes, options),
    }
}

/// Incremental operations, ordered so that nothing a route needs is missing
/// while the route is live.
pub fn render_operations(changes: &ChangeSet) -> Vec<Operation> {
    let mut ops = Vec::new();

    // certificate upserts
    for (host, change) in &changes.tls {
        let needs_upsert = match change.status {
            StatusTag::Added | StatusTag::Modified => true,
            StatusTag::Unchanged => change.entity.secret.status == StatusTag::Modified,
            StatusTag::Deleted => false,
        };
        if !needs_upsert {
            continue;
        }
        let secret = &change.entity.secret.secret;
        if let Some(cert) = changes.certificates.get(secret).filter(|c| c.is_live()) {
            ops.push(Operation::UpsertCertificate {
                host: host.clone(),
                secret: secret.clone(),
                pem: cert.entity.pem.clone(),
            });
        }
    }
    let default_cert_content_changed = changes
        .default_certificate
        .current
        .as_ref()
        .and_then(|s| changes.certificates.get(s))
        .is_some_and(|c| c.status == StatusTag::Modified);
    if changes.default_certificate.status().is_write() || default_cert_content_changed {
        ops.push(Operation::SetDefaultCertificate {
            secret: changes.default_certificate.current.clone(),
        });
    }

    // backend upserts
    for change in changes.backends.values() {
        let backend = change.entity.key.name();
        match change.status {
            StatusTag::Added => ops.push(Operation::AddBackend {
                backend,
                servers: change.entity.servers.clone(),
            }),
            StatusTag::Modified => ops.push(Operation::SetBackendServers {
                backend,
                servers: change.entity.servers.clone(),
            }),
            StatusTag::Unchanged | StatusTag::Deleted => {}
        }
    }

    // route removals
    for rule in changes.rules.values() {
        for change in rule.paths.values() {
            if change.status == StatusTag::Deleted {
                ops.push(Operation::RemoveRoute {
                    host: rule.host.clone(),
                    path: change.entity.path.clone(),
                });
            }
        }
    }

    // route upserts
    for rule in changes.rules.values() {
        for change in rule.paths.values() {
            if matches!(change.status, StatusTag::Added | StatusTag::Modified) {
                ops.push(Operation::UpsertRoute {
                    host: rule.host.clone(),
                    path: change.entity.path.clone(),
                    backend: change.entity.backend_key().name(),
                });
            }
        }
    }

    if changes.default_backend.status().is_write() {
        ops.push(Operation::SetDefaultBackend {
            backend: changes.default_backend.current.as_ref().map(|k| k.name()),
        });
    }

    // backend removals
    for change in changes.backends.values() {
        if change.status == StatusTag::Deleted {
            ops.push(Operation::RemoveBackend {
                backend: change.entity.key.name(),
            });
        }
    }

    // certificate removals
    for (host, change) in &changes.tls {
        if change.status == StatusTag::Deleted {
            ops.push(Operation::RemoveCertificate { host: host.clone() });
        }
    }

    ops
}

/// Full configuration of everything that is not `Deleted`.
pub fn render_full(changes: &ChangeSet, options: &RenderOptions) -> FullConfig {
    let mut routes = BTreeMap::new();
    for rule in changes.rules.values().filter(|r| r.status != StatusTag::Deleted) {
        for change in rule.paths.values().filter(|c| c.is_live()) {
            routes.insert(
                route_key(&rule.host, &change.entity.path),
                change.entity.backend_key().name(),
            );
        }
    }

    let mut certificates = BTreeMap::new();
    if let Some(cert) = changes.default_certificate() {
        certificates.insert(DEFAULT_CERT_FILE.to_string(), cert.pem.clone());
    }
    let mut sni_entries = Vec::new();
    for (host, change) in changes.tls.iter().filter(|(_, c)| c.is_live()) {
        let Some(cert) = changes
            .certificates
            .get(&change.entity.secret.secret)
            .filter(|c| c.is_live())
        else {
            continue;
        };
        let file = cert_file_name(host);
        certificates.insert(file.clone(), cert.entity.pem.clone());
        sni_entries.push((file, host.clone()));
    }

    let mut crt_list = String::new();
    let cert_path = |file: &str| options.cert_dir.join(file).display().to_string();
    if certificates.contains_key(DEFAULT_CERT_FILE) {
        let _ = writeln!(crt_list, "{}", cert_path(DEFAULT_CERT_FILE));
    }
    for (file, host) in &sni_entries {
        let _ = writeln!(crt_list, "{} [] {host}", cert_path(file));
    }

    let (wildcard_routes, exact_routes): (BTreeMap<_, _>, BTreeMap<_, _>) = routes
        .clone()
        .into_iter()
        .partition(|(key, _)| wildcard_pattern(key).is_some());
    let route_map = render_route_map(&exact_routes, |key| Some(key.to_string()));
    let wildcard_map = render_route_map(&wildcard_routes, wildcard_pattern);

    let backends: Vec<_> = changes
        .backends
        .values()
        .filter(|c| c.is_live())
        .map(|c| &c.entity)
        .collect();
    let default_backend = changes
        .default_backend
        .current
        .as_ref()
        .map(|k| k.name())
        .unwrap_or_else(|| FALLBACK_BACKEND.to_string());
    let exact = format!("base,map_beg({})", options.map_path.display());
    let lookup = [
        format!("%[{exact}] if {{ {exact} -m found }}"),
        format!(
            "%[base,map_reg({},{default_backend})]",
            options.wildcard_map_path.display()
        ),
    ];

    let mut config = String::new();
    let _ = writeln!(config, "global");
    let _ = writeln!(config, "    maxconn 4096");
    let _ = writeln!(
        config,
        "    stats socket {} mode 600 level admin expose-fd listeners",
        options.admin_socket.display()
    );
    let _ = writeln!(config);
    let _ = writeln!(config, "defaults");
    let _ = writeln!(config, "    mode http");
    let _ = writeln!(config, "    option forwardfor");
    let _ = writeln!(config, "    timeout connect 5s");
    let _ = writeln!(config, "    timeout client 50s");
    let _ = writeln!(config, "    timeout server 50s");
    let _ = writeln!(config);
    let _ = writeln!(config, "frontend http");
    let _ = writeln!(config, "    bind *:{}", options.http_port);
    for rule in &lookup {
        let _ = writeln!(config, "    use_backend {rule}");
    }
    if !certificates.is_empty() {
        let _ = writeln!(config);
        let _ = writeln!(config, "frontend https");
        let _ = writeln!(
            config,
            "    bind *:{} ssl crt-list {}",
            options.https_port,
            options.crt_list_path.display()
        );
        for rule in &lookup {
            let _ = writeln!(config, "    use_backend {rule}");
        }
    }
    for backend in backends {
        let _ = writeln!(config);
        let _ = writeln!(config, "backend {}", backend.key.name());
        for (i, server) in backend.servers.iter().enumerate() {
            let _ = writeln!(config, "    server srv{i} {server} check");
        }
    }
    let _ = writeln!(config);
    let _ = writeln!(config, "backend {FALLBACK_BACKEND}");
    let _ = writeln!(config, "    http-request return status 404");

    let digest = digest_files(
        &[
            config.as_str(),
            route_map.as_str(),
            wildcard_map.as_str(),
            crt_list.as_str(),
        ],
        &certificates,
    );
    FullConfig {
        config,
        route_map,
        wildcard_map,
        crt_list,
        certificates,
        routes,
        digest,
    }
}

/// Map file with the longest path of each host first so prefix lookups
/// pick the most specific route.
fn render_route_map(
    routes: &BTreeMap<String, String>,
    map_key: impl Fn(&str) -> Option<String>,
) -> String {
    let mut entries: Vec<(&String, &String)> = routes.iter().collect();
    entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let mut out = String::new();
    for (key, backend) in entries {
        if let Some(key) = map_key(key) {
            let _ = writeln!(out, "{key} {backend}");
        }
    }
    out
}

fn digest_files(parts: &[&str], certificates: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    for (name, pem) in certificates {
        hasher.update((name.len() as u64).to_be_bytes());
        hasher.update(name.as_bytes());
        hasher.update((pem.len() as u64).to_be_bytes());
        hasher.update(pem.as_bytes());
    }
    hex::encode(hasher.finalize())
}
