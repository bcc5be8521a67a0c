/**
 * RELAY KERNEL - Entry point of the Junction Engine server
 *
 * ROLE: Wires config, catalog store, transports, the engine, the cron trigger
 * loop and the HTTP control API, then serves until Ctrl-C.
 *
 * SHUTDOWN: every running junction is stopped (in-flight cycles awaited) and
 * the catalog saved before the process exits.
 */

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use relay_kernel::config::load_config;
use relay_kernel::cron::spawn_cron;
use relay_kernel::health::HealthTracker;
use relay_kernel::http::{build_router, AppState};
use relay_kernel::store::JsonStore;
use relay_kernel::transport::Transports;
use relay_kernel::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_kernel=info")))
        .init();

    let cfg = load_config().await;
    let transports = Transports::new(&cfg).context("building transports")?;
    let store = JsonStore::new(&cfg.storage.data_file);
    let addr: SocketAddr = cfg
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.http.bind))?;

    let engine = Arc::new(
        Engine::open(cfg, transports, store)
            .await
            .context("loading catalog")?,
    );

    let started = engine.autostart().await;
    tracing::info!("[kernel] auto-started {started} junction(s)");

    let cron_token = CancellationToken::new();
    let cron = spawn_cron(engine.clone(), cron_token.clone());

    let app_state = AppState {
        engine: engine.clone(),
        health_tracker: HealthTracker::new(),
    };
    let app = build_router(app_state).layer(CorsLayer::permissive());

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("[kernel] listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("[kernel] cannot listen for Ctrl-C: {e}");
            }
            tracing::info!("[kernel] shutting down");
        })
        .await
        .context("http server")?;

    cron_token.cancel();
    let _ = cron.await;
    engine.shutdown().await;
    tracing::info!("[kernel] stopped");
    Ok(())
}
