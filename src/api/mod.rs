//! Dashboard control plane: read-only stats plus engine commands.
//!
//! Handlers take lock-scoped ledger snapshots and delegate commands to the
//! engine handle; nothing here holds a lock across IO.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::audit::{AuditCategory, AuditLog};
use crate::engine::CopyEngine;
use crate::ledger::LedgerStore;
use crate::models::{ClosedPosition, Position, Side, TradeEvent};
use crate::settings::{TradeSettings, TradeSettingsPatch};
use crate::ticks::from_tick;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<CopyEngine>,
    pub ledger: Arc<LedgerStore>,
    pub audit: Arc<AuditLog>,
    pub profile_address: String,
    pub profile_name: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/stats", get(get_stats))
        .route("/api/control/toggle", post(post_toggle))
        .route("/api/control/close-all", post(post_close_all))
        .route("/api/close", post(post_close))
        .route(
            "/api/settings/trade-amount",
            get(get_trade_amount).post(post_trade_amount),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ----------------------------------------------------------------------
// Stats
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionView {
    market_id: String,
    token_id: Option<String>,
    market_name: String,
    slug: String,
    side: Side,
    outcome_label: String,
    size: f64,
    entry_price: f64,
    invested_usd: f64,
    current_price: f64,
    current_value: f64,
    unrealized_pnl: f64,
    realized_pnl: f64,
    state: String,
}

impl From<&Position> for PositionView {
    fn from(p: &Position) -> Self {
        Self {
            market_id: p.market_id.clone(),
            token_id: p.token_id.clone(),
            market_name: p.market_name.clone(),
            slug: p.slug.clone(),
            side: p.side,
            outcome_label: p.outcome_label.clone(),
            size: p.size,
            entry_price: from_tick(p.entry_tick),
            invested_usd: p.invested_usd,
            current_price: from_tick(p.current_tick),
            current_value: p.current_value,
            unrealized_pnl: p.unrealized_pnl,
            realized_pnl: p.realized_pnl,
            state: p.state.as_str().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClosedPositionView {
    market_id: String,
    market_name: String,
    side: Side,
    outcome_label: String,
    size: f64,
    entry_price: f64,
    exit_price: f64,
    invested_usd: f64,
    return_usd: f64,
    realized_pnl: f64,
    close_trigger: String,
    close_cause: String,
    close_timestamp: i64,
}

impl From<&ClosedPosition> for ClosedPositionView {
    fn from(c: &ClosedPosition) -> Self {
        Self {
            market_id: c.market_id.clone(),
            market_name: c.market_name.clone(),
            side: c.side,
            outcome_label: c.outcome_label.clone(),
            size: c.size,
            entry_price: from_tick(c.entry_tick),
            exit_price: from_tick(c.exit_tick),
            invested_usd: c.invested_usd,
            return_usd: c.return_usd,
            realized_pnl: c.realized_pnl,
            close_trigger: c.close_trigger.as_str().to_string(),
            close_cause: c.close_cause.as_str().to_string(),
            close_timestamp: c.close_timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradeEventView {
    tx_hash: String,
    timestamp: i64,
    side: String,
    market_id: String,
    market_name: String,
    outcome_label: String,
    size: f64,
    price: f64,
    reason: String,
}

impl From<&TradeEvent> for TradeEventView {
    fn from(e: &TradeEvent) -> Self {
        Self {
            tx_hash: e.tx_hash.clone(),
            timestamp: e.timestamp,
            side: e.side.as_str().to_string(),
            market_id: e.market_id.clone(),
            market_name: e.market_name.clone(),
            outcome_label: e.outcome_label.clone(),
            size: e.size,
            price: from_tick(e.tick),
            reason: e.reason.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProfileView {
    address: String,
    name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    bot_status: String,
    balance: f64,
    daily_realized_pnl: f64,
    total_unrealized_pnl: f64,
    daily_pnl: f64,
    all_time_pnl: f64,
    active_positions: Vec<PositionView>,
    closed_positions: Vec<ClosedPositionView>,
    history: Vec<TradeEventView>,
    profile: ProfileView,
}

async fn get_stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let positions = state.ledger.positions();
    let closed = state.ledger.closed_positions();
    let events = state.ledger.trade_events();

    let day_start_ms = Utc
        .from_utc_datetime(
            &Utc::now()
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap_or_default(),
        )
        .timestamp_millis();

    let daily_realized: f64 = closed
        .iter()
        .filter(|c| c.close_timestamp >= day_start_ms)
        .map(|c| c.realized_pnl)
        .sum();
    let all_time_realized: f64 = closed.iter().map(|c| c.realized_pnl).sum();
    let total_unrealized: f64 = positions.values().map(|p| p.unrealized_pnl).sum();

    Json(StatsResponse {
        bot_status: if state.engine.is_running() {
            "RUNNING".to_string()
        } else {
            "STOPPED".to_string()
        },
        balance: state.ledger.balance(),
        daily_realized_pnl: daily_realized,
        total_unrealized_pnl: total_unrealized,
        daily_pnl: daily_realized + total_unrealized,
        all_time_pnl: all_time_realized,
        active_positions: positions.values().map(PositionView::from).collect(),
        closed_positions: closed.iter().map(ClosedPositionView::from).collect(),
        history: events.iter().map(TradeEventView::from).collect(),
        profile: ProfileView {
            address: state.profile_address.clone(),
            name: state.profile_name.clone(),
        },
    })
}

// ----------------------------------------------------------------------
// Control
// ----------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToggleResponse {
    success: bool,
    is_running: bool,
}

async fn post_toggle(State(state): State<ApiState>) -> Json<ToggleResponse> {
    let is_running = state.engine.toggle();
    state.audit.log(
        AuditCategory::Api,
        if is_running {
            "bot started via dashboard"
        } else {
            "bot stopped via dashboard"
        },
    );
    Json(ToggleResponse {
        success: true,
        is_running,
    })
}

#[derive(Debug, Serialize)]
struct SuccessResponse {
    success: bool,
}

async fn post_close_all(State(state): State<ApiState>) -> Json<SuccessResponse> {
    state.audit.log(AuditCategory::Api, "close-all requested");
    let closed = state.engine.close_all().await;
    info!(closed, "close-all handled");
    Json(SuccessResponse { success: true })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseRequestBody {
    market_id: String,
    side: String,
    token_id: Option<String>,
    outcome_label: Option<String>,
}

async fn post_close(
    State(state): State<ApiState>,
    Json(body): Json<CloseRequestBody>,
) -> Json<SuccessResponse> {
    state.audit.log(
        AuditCategory::Api,
        &format!("manual close requested for {} {}", body.market_id, body.side),
    );
    let success = state
        .engine
        .manual_close(
            &body.market_id,
            Side::parse_loose(&body.side),
            body.token_id,
            body.outcome_label,
        )
        .await;
    Json(SuccessResponse { success })
}

// ----------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------

async fn get_trade_amount(State(state): State<ApiState>) -> Json<TradeSettings> {
    Json(state.engine.get_trade_settings())
}

async fn post_trade_amount(
    State(state): State<ApiState>,
    Json(patch): Json<TradeSettingsPatch>,
) -> Json<TradeSettings> {
    Json(state.engine.set_trade_settings(patch))
}
