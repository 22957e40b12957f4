use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    ControlError, ControlFuture, ControlSurface,
    command::{CommandError, expand_command, run_command_with_timeout},
};
use crate::{
    render::{FullConfig, Operation, route_key, wildcard_route_key},
    state::write_atomic,
};

#[derive(Debug, Clone)]
pub struct HaproxyOptions {
    pub config_path: PathBuf,
    pub map_path: PathBuf,
    pub wildcard_map_path: PathBuf,
    pub crt_list_path: PathBuf,
    pub cert_dir: PathBuf,
    /// Runtime API base URL; without it every change goes through a reload.
    pub runtime_api_url: Option<Url>,
    pub check_command: String,
    pub reload_command: String,
    pub command_timeout: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HaproxyControl {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    options: HaproxyOptions,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct RouteBody<'a> {
    backend: &'a str,
}

#[derive(Debug, Serialize)]
struct CertificateBody<'a> {
    pem: &'a str,
}

#[derive(Debug, Serialize)]
struct ServersBody<'a> {
    servers: &'a [String],
}

#[derive(Debug, Deserialize)]
struct RoutesResponse {
    routes: BTreeMap<String, String>,
}

impl HaproxyControl {
    pub fn new(options: HaproxyOptions) -> Result<Self, ControlError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .user_agent(crate::version::user_agent())
            .build()
            .map_err(|e| ControlError::unavailable(format!("build http client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner { options, client }),
        })
    }
}

impl Inner {
    fn runtime_url(&self, segments: &[&str]) -> Result<Url, ControlError> {
        let base = self
            .options
            .runtime_api_url
            .as_ref()
            .ok_or_else(|| ControlError::rejected("runtime api not configured"))?;
        let mut url = base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ControlError::rejected("runtime api url cannot be a base"))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<reqwest::Response, ControlError> {
        let url = self.runtime_url(segments)?;
        let mut req = self.client.request(method.clone(), url.clone());
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ControlError::unavailable(format!("{method} {url}: {e}")))?;

        let status = resp.status();
        if status.is_success() || (method == Method::DELETE && status == StatusCode::NOT_FOUND) {
            return Ok(resp);
        }
        let text = resp.text().await.unwrap_or_default();
        let details = format!("{method} {url}: {status} {}", text.trim());
        Err(classify_status(status, details))
    }

    async fn apply(&self, op: &Operation) -> Result<(), ControlError> {
        match op {
            Operation::UpsertRoute {
                host,
                path,
                backend,
            } => {
                let key = route_key(host, path);
                self.send(
                    Method::PUT,
                    &["v1", "runtime", "routes", key.as_str()],
                    Some(&RouteBody { backend }),
                )
                .await?;
            }
            Operation::RemoveRoute { host, path } => {
                let key = route_key(host, path);
                self.send::<()>(Method::DELETE, &["v1", "runtime", "routes", key.as_str()], None)
                    .await?;
            }
            Operation::UpsertCertificate { host, pem, .. } => {
                self.send(
                    Method::PUT,
                    &["v1", "runtime", "certificates", host.as_str()],
                    Some(&CertificateBody { pem }),
                )
                .await?;
            }
            Operation::RemoveCertificate { host } => {
                self.send::<()>(
                    Method::DELETE,
                    &["v1", "runtime", "certificates", host.as_str()],
                    None,
                )
                .await?;
            }
            Operation::SetBackendServers { backend, servers } => {
                self.send(
                    Method::PUT,
                    &["v1", "runtime", "backends", backend.as_str(), "servers"],
                    Some(&ServersBody { servers }),
                )
                .await?;
            }
            Operation::AddBackend { .. }
            | Operation::RemoveBackend { .. }
            | Operation::SetDefaultBackend { .. }
            | Operation::SetDefaultCertificate { .. } => {
                return Err(ControlError::rejected(format!(
                    "{} requires a reload",
                    op.kind()
                )));
            }
        }
        Ok(())
    }

    fn write_files(&self, full: &FullConfig) -> Result<(), io::Error> {
        let opts = &self.options;
        fs::create_dir_all(&opts.cert_dir)?;
        for (name, pem) in &full.certificates {
            write_atomic(&opts.cert_dir.join(name), pem.as_bytes())?;
        }
        remove_stale_certificates(&opts.cert_dir, &full.certificates.keys().collect())?;
        for (path, body) in [
            (&opts.crt_list_path, &full.crt_list),
            (&opts.map_path, &full.route_map),
            (&opts.wildcard_map_path, &full.wildcard_map),
            (&opts.config_path, &full.config),
        ] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_atomic(path, body.as_bytes())?;
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ControlError> {
        let opts = &self.options;
        let check = expand_command(&opts.check_command, &opts.config_path);
        if !check.is_empty() {
            run_command_with_timeout(&check, opts.command_timeout)
                .await
                .map_err(|e| command_failure("config check", e))?;
        }
        let reload = expand_command(&opts.reload_command, &opts.config_path);
        run_command_with_timeout(&reload, opts.command_timeout)
            .await
            .map_err(|e| command_failure("reload", e))
    }

    async fn live_routes(&self) -> Result<BTreeMap<String, String>, ControlError> {
        if self.options.runtime_api_url.is_none() {
            let text = tokio::fs::read_to_string(&self.options.map_path)
                .await
                .map_err(|e| ControlError::unavailable(format!("read route map: {e}")))?;
            let mut routes = parse_route_map(&text);
            match tokio::fs::read_to_string(&self.options.wildcard_map_path).await {
                Ok(text) => routes.extend(parse_route_map(&text)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ControlError::unavailable(format!("read wildcard map: {e}")));
                }
            }
            return Ok(routes);
        }
        let resp = self
            .send::<()>(Method::GET, &["v1", "runtime", "routes"], None)
            .await?;
        let body: RoutesResponse = resp
            .json()
            .await
            .map_err(|e| ControlError::unavailable(format!("decode routes: {e}")))?;
        Ok(body.routes)
    }

    async fn probe(&self) -> Result<(), ControlError> {
        if self.options.runtime_api_url.is_none() {
            return tokio::fs::metadata(&self.options.config_path)
                .await
                .map(|_| ())
                .map_err(|e| ControlError::unavailable(format!("config not readable: {e}")));
        }
        self.send::<()>(Method::GET, &["v1", "info"], None).await?;
        Ok(())
    }
}

/// 5xx and throttling are worth retrying; other client errors are not.
fn classify_status(status: StatusCode, details: String) -> ControlError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ControlError::Unavailable { details }
    } else {
        ControlError::Rejected { details }
    }
}

/// A command that ran and exited non-zero refused the config; anything else
/// may succeed on a later attempt.
fn command_failure(stage: &str, err: CommandError) -> ControlError {
    match err {
        CommandError::Failed { .. } => ControlError::rejected(format!("{stage}: {err}")),
        other => ControlError::unavailable(format!("{stage}: {other}")),
    }
}

fn remove_stale_certificates(dir: &Path, keep: &BTreeSet<&String>) -> Result<(), io::Error> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".pem") && !keep.contains(&name) {
            debug!(file = %name, "removing stale certificate");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn parse_route_map(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, backend) = line.split_once(char::is_whitespace)?;
            let key = wildcard_route_key(key).unwrap_or_else(|| key.to_string());
            Some((key, backend.trim().to_string()))
        })
        .collect()
}

impl ControlSurface for HaproxyControl {
    fn name(&self) -> &'static str {
        "haproxy"
    }

    fn supports_dynamic(&self) -> bool {
        self.inner.options.runtime_api_url.is_some()
    }

    fn accepts(&self, op: &Operation) -> bool {
        matches!(
            op,
            Operation::UpsertRoute { .. }
                | Operation::RemoveRoute { .. }
                | Operation::UpsertCertificate { .. }
                | Operation::RemoveCertificate { .. }
                | Operation::SetBackendServers { .. }
        )
    }

    fn apply(&self, op: &Operation) -> ControlFuture<()> {
        let inner = self.inner.clone();
        let op = op.clone();
        Box::pin(async move { inner.apply(&op).await })
    }

    fn write_config(&self, full: &FullConfig) -> ControlFuture<()> {
        let inner = self.inner.clone();
        let full = full.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || inner.write_files(&full))
                .await
                .map_err(|e| ControlError::unavailable(format!("write task: {e}")))?
                .map_err(|e| {
                    warn!(error = %e, "writing proxy configuration failed");
                    ControlError::unavailable(format!("write config: {e}"))
                })
        })
    }

    fn reload(&self) -> ControlFuture<()> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.reload().await })
    }

    fn live_routes(&self) -> ControlFuture<BTreeMap<String, String>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.live_routes().await })
    }

    fn probe(&self) -> ControlFuture<()> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.probe().await })
    }
}
