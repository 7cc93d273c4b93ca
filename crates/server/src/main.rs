//! ChatDock Server
//!
//! Real-time visitor chat relay. Bridges many concurrent WebSocket
//! connections to an external reply-generation endpoint, persisting each
//! session's lifecycle and message history in SQLite.

mod config;
mod http;
mod logging;
mod migration_runner;
mod persistence;
mod registry;
mod responder;
mod sweep;
mod websocket;

use std::sync::Arc;
use std::time::Duration;

use axum::{response::IntoResponse, routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::persistence::SessionStore;
use crate::registry::Registry;
use crate::responder::ResponderClient;
use crate::sweep::{SweepConfig, Sweeper};
use crate::websocket::ws_handler;

/// Shared application context, threaded explicitly into every handler.
pub struct AppContext {
    pub store: SessionStore,
    pub registry: Registry,
    pub responder: ResponderClient,
    pub history_page_size: usize,
    pub context_window: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    config.ensure_dirs()?;
    let _guard = logging::init_logging(&config.log_dir())?;

    info!(
        component = "server",
        event = "server.starting",
        bind = %config.bind,
        db_path = %config.db_path().display(),
        "Starting ChatDock server"
    );

    // Apply migrations before anything else touches the database.
    {
        let mut conn = rusqlite::Connection::open(config.db_path())?;
        migration_runner::run_migrations(&mut conn)?;
    }

    let store = SessionStore::new(config.db_path());
    let responder = ResponderClient::new(
        config.responder_url.clone(),
        Duration::from_secs(config.responder_timeout_secs),
    )?;

    let ctx = Arc::new(AppContext {
        store: store.clone(),
        registry: Registry::new(),
        responder,
        history_page_size: config.history_page_size,
        context_window: config.context_window,
    });

    // The sweeper refuses to run on misconfigured thresholds rather than
    // comparing against undefined cutoffs.
    let sweep_config = SweepConfig {
        interval: Duration::from_secs(config.sweep_interval_secs),
        inactivity_timeout_secs: config.inactivity_timeout_secs,
        close_after_secs: config.close_after_secs,
    };
    match Sweeper::new(store, sweep_config) {
        Ok(sweeper) => {
            tokio::spawn(sweeper.run());
        }
        Err(e) => {
            warn!(
                component = "sweep",
                event = "sweep.misconfigured",
                error = %e,
                "Sweep scheduler disabled"
            );
        }
    }

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(http::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx);

    info!(
        component = "server",
        event = "server.listening",
        addr = %config.bind,
        "Listening"
    );

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
