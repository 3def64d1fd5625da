use anyhow::Context as _;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use minifw::api;
use minifw::config::{CliArgs, Config};
use minifw::control::ControlHandler;
use minifw::datapath::Datapath;
use minifw::server::ControlServer;
use minifw::store::RuleStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))
            .with_context(|| format!("failed to load config {}", config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);
    config.validate()?;

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── Rule store ────────────────────────────────────────────────────
    let store = Arc::new(RuleStore::new(config.max_rules));
    for (i, spec) in config.rules.iter().enumerate() {
        let rule = spec.to_rule()?;
        store
            .add(rule)
            .with_context(|| format!("failed to add initial rule #{}", i + 1))?;
    }
    match store.capacity() {
        Some(capacity) => tracing::info!("rule store ready ({}/{} rules)", store.len(), capacity),
        None => tracing::info!("rule store ready ({} rules, unbounded)", store.len()),
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let datapath_task = if config.no_datapath {
        tracing::warn!("datapath disabled; rules are stored but not enforced");
        None
    } else {
        let datapath = Datapath::load(&config.ebpf_object, &config.interfaces, &store.snapshot())?;
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let updates = store.subscribe();
        let task = tokio::spawn(datapath.run_until(updates, async move {
            let _ = stop_rx.await;
        }));
        Some((stop_tx, task))
    };

    // ── Control socket ────────────────────────────────────────────────
    let handler = Arc::new(ControlHandler::new(store.clone()));
    let server = ControlServer::bind(&config.control_socket, handler.clone())
        .with_context(|| format!("failed to bind {}", config.control_socket.display()))?;

    // ── HTTP API ──────────────────────────────────────────────────────
    if let Some(port) = config.api_port {
        let app_state = Arc::new(api::AppState::new(handler.clone()));
        let app = api::router(app_state, &config.allowed_ips);

        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
        tracing::info!("admin API running on http://0.0.0.0:{}", port);
        tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<std::net::SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                tracing::error!("admin API stopped: {}", e);
            }
        });
    }

    server.serve_until(shutdown_signal()).await?;

    let released = store.shutdown();
    tracing::info!("released {} rules", released);

    if let Some((stop_tx, task)) = datapath_task {
        let _ = stop_tx.send(());
        if let Err(e) = task.await {
            tracing::error!("datapath task failed: {}", e);
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT (Ctrl+C)"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
