//! copybot: process bootstrap.
//!
//! Composition root: builds one instance of each service, wires the
//! streaming feed into the engine's price path, spawns the engine loop,
//! and serves the dashboard until SIGINT/SIGTERM. Shutdown is cooperative:
//! the engine flag flips, the loop drains, and the ledger gets a final
//! atomic rewrite before exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use dotenv::dotenv;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use copybot::api::{self, ApiState};
use copybot::audit::{AuditCategory, AuditLog};
use copybot::blacklist::PositionFilter;
use copybot::config::Config;
use copybot::engine::{CopyEngine, EngineConfig};
use copybot::ledger::LedgerStore;
use copybot::settings::SettingsStore;
use copybot::venue::{MarketWsFeed, Venue, VenueClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let config = Config::from_env()?;
    init_tracing(config.debug_logs);

    info!(profile = %config.profile_address, "copybot starting");

    let audit = Arc::new(AuditLog::new(&config.log_dir));
    audit.log(
        AuditCategory::Boot,
        &format!("copybot booting, copying {}", config.profile_address),
    );

    let ledger = Arc::new(
        LedgerStore::open(config.ledger_path(), config.starting_balance)
            .context("opening ledger")?,
    );
    let filter = Arc::new(PositionFilter::open(config.blacklist_path()));
    let settings = Arc::new(SettingsStore::open(
        config.settings_path(),
        config.default_settings,
    ));
    let venue = Arc::new(VenueClient::new());

    let engine = CopyEngine::new(
        venue.clone(),
        ledger.clone(),
        filter,
        settings,
        audit.clone(),
        EngineConfig::from_config(&config),
    );

    // Streaming book updates write through the same ledger path as REST.
    let stream_engine = engine.clone();
    let ws = MarketWsFeed::spawn(Arc::new(move |update| {
        stream_engine.handle_stream_update(update);
    }));
    engine.attach_ws(ws);

    let profile_name = venue
        .user_profile(&config.profile_address)
        .await
        .and_then(|p| p.name);
    if let Some(name) = &profile_name {
        info!(name = %name, "source profile resolved");
    }

    let engine_task = tokio::spawn(engine.clone().run());

    let app = api::router(ApiState {
        engine: engine.clone(),
        ledger: ledger.clone(),
        audit: audit.clone(),
        profile_address: config.profile_address.clone(),
        profile_name,
    });
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %addr, "dashboard listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Signal received: stop the engine loop and flush state.
    engine.request_shutdown();
    if let Err(e) = engine_task.await {
        warn!(error = %e, "engine task join failed");
    }
    audit.log(AuditCategory::Shutdown, "copybot shutting down");
    ledger.save().context("final ledger save")?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn init_tracing(debug_logs: bool) {
    let default_filter = if debug_logs { "copybot=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
