use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};
use reqwest::Url;

use crate::{
    apply::ApplyOptions,
    backoff::RetryPolicy,
    convert::ConvertOptions,
    domain::{BackendKey, ObjectRef},
    proxy::haproxy::HaproxyOptions,
    proxy_supervisor::ProxySupervisorOptions,
    reconcile::SyncOptions,
    render::RenderOptions,
    source::ManifestDirSource,
    state::StoreInit,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "edge-sync",
    about = "Keeps an HAProxy edge in sync with Ingress-style manifests",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the sync loop and the status HTTP server (default).
    Run,

    /// Render the full proxy configuration for the manifests and print it.
    Render(RenderArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Print the route maps, exact hosts before wildcards, instead of the config file.
    #[arg(long)]
    pub route_map: bool,
}

fn parse_backend_key(value: &str) -> Result<BackendKey, String> {
    BackendKey::parse(value).map_err(|e| e.to_string())
}

fn parse_object_ref(value: &str) -> Result<ObjectRef, String> {
    ObjectRef::parse(value).map_err(|e| e.to_string())
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_BIND",
        value_name = "ADDR",
        default_value = "127.0.0.1:9180"
    )]
    pub bind: SocketAddr,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_MANIFEST_DIR",
        value_name = "DIR",
        default_value = "/etc/edge-sync/manifests"
    )]
    pub manifest_dir: PathBuf,

    #[arg(
        long = "manifest-poll-secs",
        global = true,
        env = "EDGE_SYNC_MANIFEST_POLL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub manifest_poll_secs: u64,

    /// Directory for the applied snapshot; state is kept in memory when unset.
    #[arg(long, global = true, env = "EDGE_SYNC_STATE_DIR", value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "EDGE_SYNC_INGRESS_CLASS", value_name = "CLASS")]
    pub ingress_class: Option<String>,

    /// Backend for requests that match no route, as `namespace/service:port`.
    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_DEFAULT_BACKEND",
        value_name = "NS/SVC:PORT",
        value_parser = parse_backend_key
    )]
    pub default_backend: Option<BackendKey>,

    /// TLS secret served when no SNI entry matches, as `namespace/name`.
    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_DEFAULT_CERTIFICATE",
        value_name = "NS/NAME",
        value_parser = parse_object_ref
    )]
    pub default_certificate: Option<ObjectRef>,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_HAPROXY_CONFIG",
        value_name = "PATH",
        default_value = "/etc/haproxy/haproxy.cfg"
    )]
    pub haproxy_config: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_MAP_PATH",
        value_name = "PATH",
        default_value = "/etc/haproxy/routes.map"
    )]
    pub map_path: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_WILDCARD_MAP_PATH",
        value_name = "PATH",
        default_value = "/etc/haproxy/routes-wildcard.map"
    )]
    pub wildcard_map_path: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_CRT_LIST_PATH",
        value_name = "PATH",
        default_value = "/etc/haproxy/crt-list.txt"
    )]
    pub crt_list_path: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_CERT_DIR",
        value_name = "DIR",
        default_value = "/etc/haproxy/certs"
    )]
    pub cert_dir: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_ADMIN_SOCKET",
        value_name = "PATH",
        default_value = "/var/run/haproxy/admin.sock"
    )]
    pub admin_socket: PathBuf,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_HTTP_PORT",
        value_name = "PORT",
        default_value_t = 80,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub http_port: u16,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_HTTPS_PORT",
        value_name = "PORT",
        default_value_t = 443,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub https_port: u16,

    /// Runtime API of the proxy; without it every change is applied by reload.
    #[arg(long, global = true, env = "EDGE_SYNC_RUNTIME_API_URL", value_name = "URL")]
    pub runtime_api_url: Option<Url>,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_CHECK_COMMAND",
        value_name = "CMD",
        default_value = "haproxy -c -f {config}"
    )]
    pub check_command: String,

    #[arg(
        long,
        global = true,
        env = "EDGE_SYNC_RELOAD_COMMAND",
        value_name = "CMD",
        default_value = "systemctl reload haproxy"
    )]
    pub reload_command: String,

    #[arg(
        long = "command-timeout-secs",
        global = true,
        env = "EDGE_SYNC_COMMAND_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=300)
    )]
    pub command_timeout_secs: u64,

    #[arg(
        long = "debounce-ms",
        global = true,
        env = "EDGE_SYNC_DEBOUNCE_MS",
        value_name = "MS",
        default_value_t = 200,
        value_parser = clap::value_parser!(u64).range(0..=60_000)
    )]
    pub debounce_ms: u64,

    #[arg(
        long = "debounce-max-ms",
        global = true,
        env = "EDGE_SYNC_DEBOUNCE_MAX_MS",
        value_name = "MS",
        default_value_t = 2_000,
        value_parser = clap::value_parser!(u64).range(0..=300_000)
    )]
    pub debounce_max_ms: u64,

    #[arg(
        long = "resync-interval-secs",
        global = true,
        env = "EDGE_SYNC_RESYNC_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(5..=86_400)
    )]
    pub resync_interval_secs: u64,

    #[arg(
        long = "reload-cooldown-secs",
        global = true,
        env = "EDGE_SYNC_RELOAD_COOLDOWN_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(0..=3600)
    )]
    pub reload_cooldown_secs: u64,

    #[arg(
        long = "cycle-timeout-secs",
        global = true,
        env = "EDGE_SYNC_CYCLE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..=3600)
    )]
    pub cycle_timeout_secs: u64,

    #[arg(
        long = "apply-max-attempts",
        global = true,
        env = "EDGE_SYNC_APPLY_MAX_ATTEMPTS",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub apply_max_attempts: u32,

    #[arg(
        long = "health-interval-secs",
        global = true,
        env = "EDGE_SYNC_HEALTH_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub health_interval_secs: u64,

    #[arg(
        long = "health-fails-before-down",
        global = true,
        env = "EDGE_SYNC_HEALTH_FAILS_BEFORE_DOWN",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub health_fails_before_down: u32,

    /// Apply to an in-memory proxy instead of HAProxy.
    #[arg(long, global = true, env = "EDGE_SYNC_DRY_RUN")]
    pub dry_run: bool,
}

/// Flag combinations that pass clap's per-flag checks but cannot work together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    DebounceExceedsCycleTimeout {
        debounce_max: Duration,
        cycle_timeout: Duration,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DebounceExceedsCycleTimeout {
                debounce_max,
                cycle_timeout,
            } => write!(
                f,
                "--debounce-max-ms ({}ms) must be below --cycle-timeout-secs ({}s)",
                debounce_max.as_millis(),
                cycle_timeout.as_secs()
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let debounce_max = self.effective_debounce_max();
        let cycle_timeout = Duration::from_secs(self.cycle_timeout_secs);
        if debounce_max >= cycle_timeout {
            return Err(ConfigError::DebounceExceedsCycleTimeout {
                debounce_max,
                cycle_timeout,
            });
        }
        Ok(())
    }

    fn effective_debounce_max(&self) -> Duration {
        Duration::from_millis(self.debounce_max_ms.max(self.debounce_ms))
    }

    pub fn convert_options(&self) -> ConvertOptions {
        ConvertOptions {
            ingress_class: self.ingress_class.clone(),
            default_backend: self.default_backend.clone(),
            default_certificate: self.default_certificate.clone(),
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            http_port: self.http_port,
            https_port: self.https_port,
            map_path: self.map_path.clone(),
            wildcard_map_path: self.wildcard_map_path.clone(),
            crt_list_path: self.crt_list_path.clone(),
            cert_dir: self.cert_dir.clone(),
            admin_socket: self.admin_socket.clone(),
        }
    }

    pub fn haproxy_options(&self) -> HaproxyOptions {
        HaproxyOptions {
            config_path: self.haproxy_config.clone(),
            map_path: self.map_path.clone(),
            wildcard_map_path: self.wildcard_map_path.clone(),
            crt_list_path: self.crt_list_path.clone(),
            cert_dir: self.cert_dir.clone(),
            runtime_api_url: self.runtime_api_url.clone(),
            check_command: self.check_command.clone(),
            reload_command: self.reload_command.clone(),
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn apply_options(&self) -> ApplyOptions {
        let defaults = ApplyOptions::default();
        ApplyOptions {
            retry: RetryPolicy {
                max_attempts: Some(self.apply_max_attempts),
                ..defaults.retry
            },
            ..defaults
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            debounce: Duration::from_millis(self.debounce_ms),
            debounce_max: self.effective_debounce_max(),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            reload_cooldown: Duration::from_secs(self.reload_cooldown_secs),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
            retry: RetryPolicy::default(),
            convert: self.convert_options(),
            render: self.render_options(),
        }
    }

    pub fn supervisor_options(&self) -> ProxySupervisorOptions {
        ProxySupervisorOptions {
            interval: Duration::from_secs(self.health_interval_secs),
            fails_before_down: self.health_fails_before_down,
            ..ProxySupervisorOptions::default()
        }
    }

    pub fn manifest_source(&self) -> ManifestDirSource {
        ManifestDirSource {
            dir: self.manifest_dir.clone(),
            poll_interval: Duration::from_secs(self.manifest_poll_secs),
        }
    }

    pub fn store_init(&self) -> StoreInit {
        StoreInit {
            state_dir: self.state_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_apply_when_flags_absent() {
        let cli = Cli::try_parse_from(["edge-sync"]).unwrap();
        assert!(cli.command.is_none());
        let config = cli.config;
        assert_eq!(config.bind, SocketAddr::from(([127, 0, 0, 1], 9180)));
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.debounce_max_ms, 2_000);
        assert_eq!(config.resync_interval_secs, 60);
        assert_eq!(config.reload_cooldown_secs, 5);
        assert_eq!(config.apply_max_attempts, 3);
        assert_eq!(config.apply_options().retry.max_attempts, Some(3));
        assert_eq!(config.check_command, "haproxy -c -f {config}");
        assert!(config.state_dir.is_none());
        assert!(config.runtime_api_url.is_none());
        assert!(!config.dry_run);
    }

    #[test]
    fn parses_default_backend_and_certificate() {
        let cli = Cli::try_parse_from([
            "edge-sync",
            "--default-backend",
            "infra/fallback:8080",
            "--default-certificate",
            "infra/wildcard-tls",
        ])
        .unwrap();
        let options = cli.config.convert_options();
        assert_eq!(
            options.default_backend.map(|k| k.to_string()),
            Some("infra/fallback:8080".to_string())
        );
        assert_eq!(
            options.default_certificate,
            Some(ObjectRef::new("infra", "wildcard-tls"))
        );
    }

    #[test]
    fn rejects_default_backend_without_port() {
        let err = Cli::try_parse_from(["edge-sync", "--default-backend", "infra/fallback"])
            .unwrap_err();
        assert!(err.to_string().contains("--default-backend"));
    }

    #[test]
    fn rejects_invalid_resync_interval_secs() {
        let err = Cli::try_parse_from(["edge-sync", "--resync-interval-secs", "1"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--resync-interval-secs"));
        assert!(msg.contains("5..=86400"));
    }

    #[test]
    fn rejects_invalid_apply_max_attempts() {
        let err = Cli::try_parse_from(["edge-sync", "--apply-max-attempts", "0"]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("--apply-max-attempts"));
        assert!(msg.contains("1..=10"));
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli =
            Cli::try_parse_from(["edge-sync", "render", "--manifest-dir", "/tmp/m", "--route-map"])
                .unwrap();
        assert_eq!(cli.config.manifest_dir, PathBuf::from("/tmp/m"));
        match cli.command {
            Some(Command::Render(args)) => assert!(args.route_map),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn debounce_max_never_undercuts_debounce() {
        let cli = Cli::try_parse_from([
            "edge-sync",
            "--debounce-ms",
            "5000",
            "--debounce-max-ms",
            "1000",
        ])
        .unwrap();
        let options = cli.config.sync_options();
        assert_eq!(options.debounce_max, Duration::from_millis(5000));
    }

    #[test]
    fn debounce_cap_must_stay_below_cycle_timeout() {
        let parse = |debounce: &str, debounce_max: &str, timeout: &str| {
            Cli::try_parse_from([
                "edge-sync",
                "--debounce-ms",
                debounce,
                "--debounce-max-ms",
                debounce_max,
                "--cycle-timeout-secs",
                timeout,
            ])
            .unwrap()
            .config
        };
        assert_eq!(parse("200", "2000", "60").validate(), Ok(()));
        assert_eq!(
            parse("200", "10000", "10").validate(),
            Err(ConfigError::DebounceExceedsCycleTimeout {
                debounce_max: Duration::from_secs(10),
                cycle_timeout: Duration::from_secs(10),
            })
        );
        // the cap is raised to the debounce window before the check
        let err = parse("30000", "0", "20").validate().unwrap_err();
        assert!(err.to_string().contains("30000ms"));
        assert!(Cli::try_parse_from(["edge-sync"]).unwrap().config.validate().is_ok());
    }
}
