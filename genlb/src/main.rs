use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{BoxError, Router};
use clap::Parser;
use genlb_core::{DispatcherConfig, Engine, EngineConfig};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod config;
mod control_api;
mod front_api;
#[cfg(feature = "gateway")]
mod gateway;
mod http_error;
mod state;
mod stream;
mod ws;

use config::GenlbConfig;
use state::AppState;

/// Reverse-proxy load balancer for a fleet of generative-worker backends
/// (spec.md §6 CLI flags).
#[derive(Parser, Debug)]
#[command(name = "genlb", version, about)]
struct Cli {
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
    #[arg(short = 'H', long = "host")]
    host: Option<String>,
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.debug {
        config.server.debug = true;
    }

    init_tracing(config.server.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "genlb exited with an error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: GenlbConfig) -> anyhow::Result<()> {
    for line in config.describe().lines() {
        tracing::info!("{line}");
    }

    let engine_config = EngineConfig {
        queue_max_size: config.queue.max_size,
        terminal_cap: EngineConfig::default().terminal_cap,
        upstream_timeout: config.health_check.timeout,
        ws_reconnect_backoff: EngineConfig::default().ws_reconnect_backoff,
        health_check: config.health_check.clone().into(),
        dispatcher: DispatcherConfig {
            max_retries: config.queue.max_retries,
            retry_interval: config.queue.retry_interval,
        },
        scheduler_strategy: config.scheduler.strategy,
        prefer_idle: config.scheduler.prefer_idle,
    };

    let engine = Engine::new(engine_config);
    for backend in &config.backends {
        engine.register_worker(backend.clone()).await;
    }
    // Seed health state immediately rather than waiting out the first
    // interval tick, so backends configured at startup are usable right away.
    engine.trigger_health_check().await;

    let shutdown = CancellationToken::new();
    let background = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run_background_tasks(shutdown).await })
    };

    let state = Arc::new(AppState { engine: engine.clone() });
    let app = build_router(state, config.health_check.timeout);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "genlb listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            wait_for_shutdown_signal().await;
            server_shutdown.cancel();
        })
        .await?;

    // Spec §5: stop accepting new downstream sockets, cancel upstream
    // readers, then wait a bounded grace period before the process exits.
    engine.ws_hub.shutdown(Duration::from_secs(5)).await;
    let _ = background.await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
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
    tracing::info!("shutdown signal received, draining");
}

/// Converts a timeout (or any other middleware-layer error, none of which
/// should otherwise occur) into a gateway-timeout response, so handlers
/// downstream of the `TimeoutLayer` never see an `Infallible`-violating
/// service error reach `axum::serve` (spec.md §5's per-request deadline).
async fn handle_layer_error(err: BoxError) -> (StatusCode, String) {
    if err.is::<tower::timeout::error::Elapsed>() {
        (StatusCode::GATEWAY_TIMEOUT, "request timed out".to_string())
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

fn build_router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    let router = Router::new()
        // Worker-compatible client-facing surface (spec.md §6, §4.8).
        .route("/prompt", post(front_api::post_prompt))
        .route("/queue", get(front_api::get_queue).post(front_api::post_queue))
        .route("/history", get(front_api::get_history))
        .route("/history/:id", get(front_api::get_history_by_id))
        .route("/object_info", get(front_api::get_object_info))
        .route("/system_stats", get(front_api::get_system_stats))
        .route("/embeddings", get(front_api::get_embeddings))
        .route("/extensions", get(front_api::get_extensions))
        .route("/view", get(front_api::get_view))
        .route("/ws", get(ws::ws_handler))
        // Control surface (spec.md §6, §4.9).
        .route("/lb/stats", get(control_api::get_stats))
        .route(
            "/lb/backends",
            get(control_api::list_backends).post(control_api::register_backend),
        )
        .route("/lb/backends/:name", delete(control_api::delete_backend))
        .route("/lb/backends/:name/enable", post(control_api::enable_backend))
        .route("/lb/backends/:name/disable", post(control_api::disable_backend))
        .route("/lb/tasks", get(control_api::list_tasks))
        .route(
            "/lb/tasks/:id",
            get(control_api::get_task).delete(control_api::delete_task),
        )
        .route("/lb/health-check", post(control_api::trigger_health_check))
        .route("/lb/scheduler", get(control_api::get_scheduler))
        .route(
            "/lb/scheduler/strategy/:name",
            post(control_api::set_scheduler_strategy),
        )
        .with_state(state);

    #[cfg(feature = "gateway")]
    let router = {
        let admin_url = std::env::var("GENLB_GATEWAY_ADMIN_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8001".to_string());
        router.merge(gateway::router(admin_url))
    };

    router
        .layer(
            ServiceBuilder::new()
                .layer(axum::error_handling::HandleErrorLayer::new(handle_layer_error))
                .timeout(request_timeout),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
