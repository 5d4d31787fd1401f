//! Trade replication & position lifecycle engine.
//!
//! One owner task polls the source account, replicates trades, and sweeps
//! position lifecycles. All ledger mutation flows through [`LedgerStore`];
//! websocket price updates arrive through [`handle_stream_update`] on the
//! same path. Control commands flip atomics and are picked up at the next
//! loop iteration, so the dashboard never blocks on engine suspension
//! points.
//!
//! [`handle_stream_update`]: CopyEngine::handle_stream_update

mod close;
mod replicate;
mod sweep;

pub use close::CloseRequest;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditCategory, AuditLog};
use crate::blacklist::PositionFilter;
use crate::config::Config;
use crate::ledger::LedgerStore;
use crate::models::{MarketType, Side};
use crate::retry::RetryConfig;
use crate::settings::{SettingsStore, TradeSettings, TradeSettingsPatch};
use crate::ticks::clamp_signed;
use crate::venue::{BookTick, MarketWsFeed, Venue};

/// Every Nth poll tick runs the lifecycle sweep.
const LIFECYCLE_SWEEP_EVERY: u64 = 10;
/// Every Nth poll tick runs the liquidity check.
const LIQUIDITY_CHECK_EVERY: u64 = 5;

/// Engine-facing slice of the process configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub profile_address: String,
    pub poll_interval_ms: u64,
    pub expected_edge: f64,
    pub slippage_delay_penalty: Option<f64>,
    pub min_order_size_shares: f64,
    pub start_from_now: bool,
    pub enable_trade_filters: bool,
    pub skip_active_positions: bool,
    /// Wait before re-checking a book pinned at the max tick.
    pub max_tick_recheck_ms: u64,
    /// How often the streaming subscription set is rebuilt.
    pub subscription_refresh_ms: u64,
    /// Positions younger than this only close on user action or resolution.
    pub min_hold_ms: i64,
}

impl EngineConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            profile_address: cfg.profile_address.clone(),
            poll_interval_ms: cfg.poll_interval_ms,
            expected_edge: cfg.expected_edge,
            slippage_delay_penalty: cfg.slippage_delay_penalty,
            min_order_size_shares: cfg.min_order_size_shares,
            start_from_now: cfg.start_from_now,
            enable_trade_filters: cfg.enable_trade_filters,
            skip_active_positions: cfg.skip_active_positions,
            max_tick_recheck_ms: 30_000,
            subscription_refresh_ms: 60_000,
            min_hold_ms: 5_000,
        }
    }
}

/// Snapshot for the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub is_running: bool,
    pub profile_address: String,
    /// Milliseconds since epoch; trades older than this are never copied.
    pub startup_cursor_ms: i64,
}

pub struct CopyEngine {
    pub(crate) venue: Arc<dyn Venue>,
    pub(crate) ledger: Arc<LedgerStore>,
    pub(crate) filter: Arc<PositionFilter>,
    pub(crate) settings: Arc<SettingsStore>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) config: EngineConfig,
    pub(crate) retry: RetryConfig,
    ws: Mutex<Option<Arc<MarketWsFeed>>>,
    running: AtomicBool,
    shutdown: AtomicBool,
    startup_cursor_ms: AtomicI64,
    /// Consecutive empty-bid observations per position key.
    pub(crate) empty_bid_streaks: Mutex<HashMap<String, u32>>,
}

impl CopyEngine {
    pub fn new(
        venue: Arc<dyn Venue>,
        ledger: Arc<LedgerStore>,
        filter: Arc<PositionFilter>,
        settings: Arc<SettingsStore>,
        audit: Arc<AuditLog>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let now_ms = Utc::now().timestamp_millis();
        let cursor = if config.start_from_now {
            now_ms
        } else {
            now_ms - 10 * 60 * 1000
        };
        Arc::new(Self {
            venue,
            ledger,
            filter,
            settings,
            audit,
            config,
            retry: RetryConfig::default(),
            ws: Mutex::new(None),
            running: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            startup_cursor_ms: AtomicI64::new(cursor),
            empty_bid_streaks: Mutex::new(HashMap::new()),
        })
    }

    /// Attach the streaming feed once the composition root has spawned it.
    pub fn attach_ws(&self, ws: Arc<MarketWsFeed>) {
        *self.ws.lock() = Some(ws);
        self.refresh_subscriptions();
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.audit.log(AuditCategory::Engine, "engine started");
        info!("engine started");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.audit.log(AuditCategory::Engine, "engine stopped");
        info!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Toggle and report the new state.
    pub fn toggle(&self) -> bool {
        if self.is_running() {
            self.stop();
        } else {
            self.start();
        }
        self.is_running()
    }

    /// Request process shutdown; the loop exits at its next iteration.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            is_running: self.is_running(),
            profile_address: self.config.profile_address.clone(),
            startup_cursor_ms: self.startup_cursor_ms.load(Ordering::SeqCst),
        }
    }

    pub(crate) fn cursor_ms(&self) -> i64 {
        self.startup_cursor_ms.load(Ordering::SeqCst)
    }

    pub fn get_trade_settings(&self) -> TradeSettings {
        self.settings.get()
    }

    pub fn set_trade_settings(&self, patch: TradeSettingsPatch) -> TradeSettings {
        let updated = self.settings.patch(patch);
        self.audit.log(
            AuditCategory::Api,
            &format!(
                "trade settings updated: mode={:?} pct={} fixed=${}",
                updated.mode, updated.percentage, updated.fixed_amount_usd
            ),
        );
        updated
    }

    // ------------------------------------------------------------------
    // Main loop
    // ------------------------------------------------------------------

    /// Startup sequence followed by the poll loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>) {
        self.startup().await;

        let mut tick: u64 = 0;
        let mut last_refresh = Instant::now();
        let refresh_every = Duration::from_millis(self.config.subscription_refresh_ms);

        while !self.shutdown.load(Ordering::SeqCst) {
            if self.is_running() {
                tick += 1;
                if let Err(e) = self.poll_once(tick).await {
                    // A broken tick must not kill the loop.
                    error!(error = %e, "poll tick failed");
                    self.audit
                        .log(AuditCategory::Crash, &format!("poll tick failed: {e}"));
                }
                if last_refresh.elapsed() >= refresh_every {
                    self.refresh_subscriptions();
                    last_refresh = Instant::now();
                }
            }
            sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }

        self.audit.log(AuditCategory::Shutdown, "engine loop exited");
        info!("engine loop exited");
    }

    async fn startup(&self) {
        self.audit.log(
            AuditCategory::Boot,
            &format!("copy engine booting for {}", self.config.profile_address),
        );

        if self.config.skip_active_positions {
            self.seed_blacklist().await;
        }
        self.refresh_subscriptions();
        info!(
            cursor_ms = self.cursor_ms(),
            blacklisted = self.filter.len(),
            "engine ready"
        );
    }

    /// Blacklist markets the source already holds, except those the paper
    /// ledger also holds (scale-in stays possible there).
    async fn seed_blacklist(&self) {
        let Some(holdings) = self.venue.user_positions(&self.config.profile_address).await else {
            warn!("holdings scan failed; blacklist left as loaded");
            return;
        };
        let ids: Vec<String> = holdings
            .into_iter()
            .filter(|p| p.size > 0.0 && !p.market_id.is_empty())
            .map(|p| p.market_id)
            .filter(|id| !self.ledger.has_position_in_market(id))
            .collect();
        self.audit.log(
            AuditCategory::Engine,
            &format!("blacklisted {} pre-existing markets", ids.len()),
        );
        self.filter.initialize(ids);
    }

    /// One pass of the main loop. Public so integration tests and operator
    /// tooling can drive ticks without the timer.
    pub async fn poll_once(&self, tick: u64) -> Result<()> {
        if let Some(activity) = self
            .venue
            .user_activity(&self.config.profile_address)
            .await
        {
            // The venue sends newest first; replicate oldest first.
            for item in activity.iter().rev().filter(|a| a.is_trade()) {
                self.replicate_trade(item).await;
            }
        } else {
            debug!("activity fetch returned nothing this tick");
        }

        if tick % LIFECYCLE_SWEEP_EVERY == 0 {
            self.lifecycle_sweep().await;
        }
        if tick % LIQUIDITY_CHECK_EVERY == 0 {
            self.liquidity_check().await;
        }
        self.price_fallback().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streaming price path
    // ------------------------------------------------------------------

    /// Route one decoded stream update into the ledger.
    ///
    /// A multi-outcome NO position is tracked via the other leg's YES token,
    /// so its own tick is the complement of the update.
    pub fn handle_stream_update(&self, update: BookTick) {
        let positions = self.ledger.positions();

        for pos in positions.values() {
            if pos.token_id.as_deref() == Some(update.token_id.as_str()) {
                self.ledger.update_real_time_price(
                    &pos.market_id,
                    update.tick,
                    pos.token_id.as_deref(),
                );
                return;
            }
        }

        // Other-leg lookup for multi-NO positions.
        for pos in positions.values() {
            if pos.market_type != MarketType::Multi || pos.side != Side::No {
                continue;
            }
            let Some(own_token) = pos.token_id.as_deref() else {
                continue;
            };
            let Some(cache) = self.ledger.market_cache(&pos.market_id) else {
                continue;
            };
            let is_other_leg = cache
                .clob_token_ids
                .iter()
                .any(|t| t == &update.token_id && t != own_token);
            if is_other_leg {
                let complement = clamp_signed(1000 - update.tick as i32);
                self.ledger
                    .update_real_time_price(&pos.market_id, complement, Some(own_token));
                return;
            }
        }
    }

    /// Rebuild the streaming asset set from the open positions: each
    /// position's own token, plus the other leg for multi-NO positions.
    pub(crate) fn refresh_subscriptions(&self) {
        let Some(ws) = self.ws.lock().clone() else {
            return;
        };
        let positions = self.ledger.positions();
        let mut assets: Vec<String> = Vec::new();
        for pos in positions.values() {
            let Some(token) = pos.token_id.as_deref() else {
                continue;
            };
            if !assets.iter().any(|t| t == token) {
                assets.push(token.to_string());
            }
            if pos.market_type == MarketType::Multi && pos.side == Side::No {
                if let Some(cache) = self.ledger.market_cache(&pos.market_id) {
                    for other in cache.clob_token_ids.iter().filter(|t| *t != token) {
                        if !assets.iter().any(|t| t == other) {
                            assets.push(other.clone());
                        }
                    }
                }
            }
        }
        debug!(assets = assets.len(), "streaming subscription refreshed");
        ws.set_assets(assets);
    }
}
