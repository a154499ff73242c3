use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use stationcast_engine::{
    api::{build_router, AppState},
    config::EngineConfig,
    media_server::IcecastControl,
    notify::BroadcastBus,
    orchestrator::Orchestrator,
    origin::{HttpOriginRegistry, OriginRegistry},
    process::{CommandSupervisor, ProcessSupervisor},
    store::Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let version = env!("CARGO_PKG_VERSION").to_string();
    let cfg = EngineConfig::from_env()?;

    let store = Store::open(&cfg.db_path).with_context(|| format!("opening database {}", cfg.db_path))?;

    let processes: Arc<dyn ProcessSupervisor> = Arc::new(CommandSupervisor::new());
    let control = Arc::new(IcecastControl::new(
        processes.clone(),
        cfg.runtime_dir.clone(),
        cfg.icecast_bin.clone(),
        cfg.admin_password.clone(),
    ));
    let origin = cfg
        .origin_url
        .clone()
        .map(|url| Arc::new(HttpOriginRegistry::new(url, cfg.origin_timeout)) as Arc<dyn OriginRegistry>);
    if origin.is_none() {
        warn!("STATIONCAST_ORIGIN_URL is not set; on-air status follows origin push hooks only");
    }
    let bus = Arc::new(BroadcastBus::default());

    let orch = Orchestrator::build(&cfg, store, processes, control, origin, bus.clone());

    // Instances from a previous run are replaced, never reused.
    orch.startup().await.context("startup reconciliation failed")?;
    let poller = orch.reconciler().spawn(cfg.reconcile_interval);

    let app = build_router(AppState {
        orch: orch.clone(),
        bus,
        auth_timeout: cfg.auth_timeout,
        version,
    });

    // Bind loopback only; the media server hooks and the API share this port.
    info!("stationcast engine starting on http://{}", cfg.bind);

    let listener = tokio::net::TcpListener::bind(cfg.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(poller) = poller {
        poller.abort();
    }
    orch.shutdown().await;
    info!("auto dj processes stopped; media server instances left running");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let term = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = term => {},
    }

    warn!("Shutdown signal received.");
}
