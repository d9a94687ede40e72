// RelayPlane proxy - a local LLM routing proxy.
//
// Intercepts OpenAI- and Anthropic-shaped chat-completion requests, runs
// them through a policy pipeline (cache, budget, anomaly detection,
// auto-downgrade, complexity routing, provider cooldowns, alerting), and
// forwards them to the appropriate upstream provider.
//
// Architecture:
// - `server`: axum HTTP surface (ingress routes + read-only telemetry views)
// - `orchestrator`: drives every request through the pipeline stages in order
// - `state::Deps`: the subsystem bundle built once at startup and shared
//   across every request via axum's `State`

mod alerts;
mod anomaly;
mod auth;
mod budget;
mod cache;
mod cli;
mod config;
mod cooldown;
mod downgrade;
mod envelope;
mod error;
mod orchestrator;
mod pricing;
mod provider;
mod router;
mod server;
mod state;
mod translation;

use clap::Parser;
use cli::Cli;
use config::Config;
use state::Deps;
use std::time::Duration;

/// How long shutdown waits for in-flight requests to drain before the
/// listener's remaining connections are force-closed.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli::handle_cli(&cli) {
        return Ok(());
    }

    let config = match Config::load() {
        Ok(mut config) => {
            if let Some(bind) = &cli.bind {
                config.bind_addr = bind
                    .parse()
                    .map_err(|_| anyhow::anyhow!("--bind '{bind}' is not a valid address"))?;
            }
            config
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init(&config.log_dir)?;

    tracing::info!(
        bind_addr = %config.bind_addr,
        router_mode = config::router_mode_name(&config.router.mode),
        cache_enabled = config.cache.enabled,
        "starting relayplane-proxy"
    );

    let deps = match Deps::new(config.clone()) {
        Ok(deps) => deps,
        Err(e) => {
            eprintln!("fatal: failed to initialize proxy state: {e}");
            std::process::exit(1);
        }
    };

    deps.cache.prune_expired();

    let app = server::build_router(deps.clone());

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("fatal: failed to bind {}: {e}", config.bind_addr);
            std::process::exit(1);
        }
    };

    tracing::info!("listening on {}", config.bind_addr);

    // Write-behind flusher: drains queued spend records to the durable log
    // roughly every second. Shutdown flushes synchronously below instead of
    // waiting on this tick.
    let flush_deps = deps.clone();
    let flush_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            flush_deps.budget.flush_durable();
        }
    });

    let shutdown = shutdown_signal(deps.clone());
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown);
    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, serve).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server error: {e}"),
        Err(_) => tracing::warn!(
            grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "grace period elapsed with requests still in flight, force-closing"
        ),
    }

    flush_handle.abort();
    tracing::info!("shutting down...");
    deps.budget.flush_durable();
    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for Ctrl+C or SIGTERM, then gives in-flight requests a grace
/// period before axum force-closes remaining connections.
async fn shutdown_signal(deps: Deps) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    deps.set_enabled(false);
    tracing::info!("shutdown signal received, draining in-flight requests");
}

mod logging;
