use anyhow::{Context as _, Result};
use std::sync::Arc;

use clap::Parser;
use tokio::{sync::watch, time::Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use edge_sync::{
    apply::Applier,
    config::{Cli, Command, Config, RenderArgs},
    convert::convert,
    diff::reconcile,
    domain::Snapshot,
    http::{AppState, build_router},
    proxy::{ControlSurface, haproxy::HaproxyControl, memory::MemorySurface},
    proxy_supervisor::spawn_proxy_supervisor,
    reconcile::SyncLoop,
    render::render,
    source::{load_manifest_dir, shared_objects},
    state::StateStore,
    status::StatusBoard,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    cli.config.validate()?;
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Render(args) => render_config(&cli.config, &args),
    }
}

fn render_config(config: &Config, args: &RenderArgs) -> Result<()> {
    let objects = load_manifest_dir(&config.manifest_dir)
        .with_context(|| format!("load manifests from {}", config.manifest_dir.display()))?;
    let conversion = convert(&objects, &config.convert_options());
    for err in &conversion.errors {
        warn!(entity = %err.entity_label(), %err, "invalid declaration excluded");
    }
    let changes = reconcile(&conversion.snapshot, &Snapshot::default())?;
    let artifacts = render(&changes, &config.render_options());
    if args.route_map {
        print!("{}", artifacts.full.route_map);
        print!("{}", artifacts.full.wildcard_map);
    } else {
        print!("{}", artifacts.full.config);
    }
    Ok(())
}

async fn run_server(config: Config) -> Result<()> {
    let surface: Arc<dyn ControlSurface> = if config.dry_run {
        info!("dry run: applying to an in-memory proxy");
        Arc::new(MemorySurface::new())
    } else {
        Arc::new(HaproxyControl::new(config.haproxy_options())?)
    };

    let store = StateStore::load_or_init(config.store_init())?;
    let board = StatusBoard::new();
    let objects = shared_objects();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The first cycle must see the manifests, or it would delete every route.
    let source = config.manifest_source();
    source
        .poll_once(&objects)
        .await
        .with_context(|| format!("load manifests from {}", config.manifest_dir.display()))?;

    let applier = Applier::new(surface.clone(), config.apply_options());
    let sync = SyncLoop::new(
        objects.clone(),
        store,
        applier,
        board.clone(),
        config.sync_options(),
    );
    let reconcile = sync.handle();
    let sync_task = sync.spawn(shutdown_rx.clone());
    let _source_task = source.spawn(objects, reconcile.clone(), shutdown_rx.clone());
    let (proxy_health, _supervisor_task) = spawn_proxy_supervisor(
        surface.clone(),
        config.supervisor_options(),
        reconcile.clone(),
        shutdown_rx,
    );

    let app = build_router(AppState {
        board,
        proxy_health,
        reconcile,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        proxy = surface.name(),
        manifest_dir = %config.manifest_dir.display(),
        version = edge_sync::version::VERSION,
        "starting edge-sync"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let started = Instant::now();
    if sync_task.await.is_err() {
        warn!("sync loop task ended abnormally");
    }
    info!(waited = ?started.elapsed(), "edge-sync stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries `render` output
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
