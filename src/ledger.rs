//! Durable paper ledger: cash, positions, closed positions, trade events,
//! market cache, processed-hash set.
//!
//! One mutex owns all mutation; every state-changing call rewrites the
//! backing JSON file atomically (write temp + rename), so a crash leaves the
//! last successfully-persisted state. Serialization happens under the lock,
//! file IO after it is dropped.
//!
//! Position identity is canonical `(market_id, token_id)`. Ledgers written
//! by older builds keyed binary positions `(market_id, side)`; those resolve
//! through fallback keys and migrate to the canonical key on first write.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::models::{
    CachedMarket, CloseCause, ClosedPosition, CloseTrigger, MarketType, Position, PositionState,
    Side, TradeEvent, TradeSide,
};
use crate::ticks::{clamp_signed, clamp_tick, from_tick, to_tick, Tick};

/// Open positions below this share count are dust and move to the closed set.
pub const MIN_POSITION_SIZE: f64 = 0.1;
/// Price-cache entries older than this are stale for the REST fallback.
pub const PRICE_CACHE_MAX_AGE_MS: i64 = 30_000;

/// Root schema persisted to `data/ledger.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerState {
    pub balance: f64,
    #[serde(default)]
    pub positions: HashMap<String, Position>,
    #[serde(default)]
    pub closed_positions: Vec<ClosedPosition>,
    #[serde(default)]
    pub trade_events: Vec<TradeEvent>,
    #[serde(default)]
    pub market_cache: HashMap<String, CachedMarket>,
    #[serde(default)]
    pub processed_tx_hashes: HashSet<String>,
}

impl LedgerState {
    fn fresh(starting_balance: f64) -> Self {
        Self {
            balance: starting_balance,
            positions: HashMap::new(),
            closed_positions: Vec::new(),
            trade_events: Vec::new(),
            market_cache: HashMap::new(),
            processed_tx_hashes: HashSet::new(),
        }
    }
}

/// Latest known price for a token, not persisted.
#[derive(Debug, Clone, Copy)]
pub struct PriceEntry {
    pub tick: Tick,
    pub updated_at_ms: i64,
}

/// Everything needed to apply one replicated fill to the ledger.
#[derive(Debug, Clone)]
pub struct TradeFill {
    pub market_id: String,
    pub market_name: String,
    pub slug: String,
    pub side: Side,
    pub outcome_label: String,
    /// Positive buys, negative sells.
    pub signed_shares: f64,
    pub tick: Tick,
    pub tx_hash: String,
    /// `"TRIGGER|CAUSE"` for closes, plain action names otherwise.
    pub reason: String,
    pub source_tick: Option<Tick>,
    pub latency_ms: Option<i64>,
    pub token_id: Option<String>,
    pub market_type: MarketType,
}

/// How callers name a position; the store resolves it to a concrete key.
#[derive(Debug, Clone)]
pub struct PositionQuery {
    pub market_id: String,
    pub side: Side,
    pub token_id: Option<String>,
    pub outcome_label: Option<String>,
}

fn canonical_key(market_id: &str, token_id: &str) -> String {
    format!("{market_id}:{token_id}")
}

fn labeled_key(market_id: &str, side: Side, outcome_label: &str) -> String {
    format!("{market_id}:{}:{}", side.as_str(), outcome_label.to_uppercase())
}

fn legacy_key(market_id: &str, side: Side) -> String {
    format!("{market_id}:{}", side.as_str())
}

/// Durable ledger store. All writes funnel through the inner mutex.
pub struct LedgerStore {
    path: PathBuf,
    state: Mutex<LedgerState>,
    price_cache: Mutex<HashMap<String, PriceEntry>>,
}

impl LedgerStore {
    /// Load from `path`, or start fresh with `starting_balance` when the
    /// file is absent or unreadable. Unreadable never aborts: a paper
    /// account prefers starting clean over refusing to start.
    pub fn open(path: impl Into<PathBuf>, starting_balance: f64) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger dir {}", parent.display()))?;
        }

        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<LedgerState>(&raw) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        balance = state.balance,
                        open = state.positions.len(),
                        "ledger loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ledger unreadable, starting fresh");
                    LedgerState::fresh(starting_balance)
                }
            },
            Err(_) => {
                info!(path = %path.display(), balance = starting_balance, "new ledger");
                LedgerState::fresh(starting_balance)
            }
        };

        let store = Self {
            path,
            state: Mutex::new(state),
            price_cache: Mutex::new(HashMap::new()),
        };
        store.save()?;
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Read accessors (lock-scoped snapshots)
    // ------------------------------------------------------------------

    pub fn balance(&self) -> f64 {
        self.state.lock().balance
    }

    pub fn positions(&self) -> HashMap<String, Position> {
        self.state.lock().positions.clone()
    }

    pub fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.state.lock().closed_positions.clone()
    }

    pub fn trade_events(&self) -> Vec<TradeEvent> {
        self.state.lock().trade_events.clone()
    }

    pub fn market_cache(&self, market_id: &str) -> Option<CachedMarket> {
        self.state.lock().market_cache.get(market_id).cloned()
    }

    pub fn is_processed(&self, tx_hash: &str) -> bool {
        self.state.lock().processed_tx_hashes.contains(tx_hash)
    }

    /// Whether the external id already appears in the trade-event log.
    pub fn has_trade_event(&self, tx_hash: &str) -> bool {
        self.state
            .lock()
            .trade_events
            .iter()
            .any(|e| e.tx_hash == tx_hash)
    }

    /// Whether the paper account holds any open position in `market_id`.
    pub fn has_position_in_market(&self, market_id: &str) -> bool {
        self.state
            .lock()
            .positions
            .values()
            .any(|p| p.market_id == market_id)
    }

    pub fn price_cache_entry(&self, key: &str) -> Option<PriceEntry> {
        self.price_cache.lock().get(key).copied()
    }

    /// Fresh means younger than [`PRICE_CACHE_MAX_AGE_MS`].
    pub fn has_fresh_price(&self, key: &str, now_ms: i64) -> bool {
        self.price_cache_entry(key)
            .map(|e| now_ms - e.updated_at_ms <= PRICE_CACHE_MAX_AGE_MS)
            .unwrap_or(false)
    }

    /// Resolve a query to its stored key and a snapshot of the position.
    pub fn resolve_position(&self, q: &PositionQuery) -> Option<(String, Position)> {
        let state = self.state.lock();
        resolve_key(&state.positions, q).map(|k| (k.clone(), state.positions[&k].clone()))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Cache market metadata. Second-resolution end times normalize to ms.
    #[allow(clippy::too_many_arguments)]
    pub fn update_market_cache(
        &self,
        market_id: &str,
        question: &str,
        slug: &str,
        outcomes: Vec<String>,
        clob_token_ids: Vec<String>,
        end_time: Option<i64>,
        market_type: MarketType,
    ) {
        let json = {
            let mut state = self.state.lock();
            let end_time_ms = end_time.map(|t| if t < 10_000_000_000 { t * 1000 } else { t });
            state.market_cache.insert(
                market_id.to_string(),
                CachedMarket {
                    market_id: market_id.to_string(),
                    question: question.to_string(),
                    slug: slug.to_string(),
                    outcomes,
                    clob_token_ids,
                    end_time_ms,
                    market_type,
                },
            );
            serialize_state(&state)
        };
        self.write_file(json);
    }

    /// Record a live price and mark open positions to it.
    ///
    /// With a token id, only positions holding exactly that token update.
    /// Legacy binary positions without a token id derive their own tick from
    /// the market's YES price: `tick` for YES holders, `1000 - tick` for NO.
    pub fn update_real_time_price(&self, market_id: &str, tick: Tick, token_id: Option<&str>) {
        let tick = clamp_tick(tick);
        let now_ms = Utc::now().timestamp_millis();
        let cache_key = token_id.unwrap_or(market_id).to_string();
        self.price_cache.lock().insert(
            cache_key,
            PriceEntry {
                tick,
                updated_at_ms: now_ms,
            },
        );

        let json = {
            let mut state = self.state.lock();
            let mut touched = false;
            for pos in state.positions.values_mut() {
                if pos.market_id != market_id {
                    continue;
                }
                match (&pos.token_id, token_id) {
                    (Some(own), Some(incoming)) if own == incoming => {
                        pos.mark_price(tick);
                        touched = true;
                    }
                    (None, _) => {
                        let derived = match pos.side {
                            Side::Yes => tick,
                            Side::No => clamp_signed(1000 - tick as i32),
                        };
                        pos.mark_price(derived);
                        touched = true;
                    }
                    _ => {}
                }
            }
            if !touched {
                return;
            }
            serialize_state(&state)
        };
        self.write_file(json);
    }

    /// Apply a fill. Returns `false` when the ledger refuses it: replayed
    /// hash, orphan sell, insolvency, or a state that does not admit sells.
    pub fn apply_trade(&self, fill: TradeFill) -> bool {
        let now_ms = Utc::now().timestamp_millis();
        let (applied, json) = {
            let mut state = self.state.lock();
            if state.processed_tx_hashes.contains(&fill.tx_hash) {
                debug!(tx = %fill.tx_hash, "duplicate fill ignored");
                return false;
            }

            let applied = if fill.signed_shares >= 0.0 {
                apply_buy(&mut state, &fill, now_ms)
            } else {
                apply_sell(&mut state, &fill, now_ms)
            };

            match applied {
                Applied::Committed | Applied::RefusedProcessed => {
                    state.processed_tx_hashes.insert(fill.tx_hash.clone());
                }
                Applied::RefusedRetryable => {}
            }
            (applied, serialize_state(&state))
        };
        self.write_file(json);
        matches!(applied, Applied::Committed)
    }

    /// Overwrite a position's lifecycle state.
    pub fn update_position_state(&self, key: &str, new_state: PositionState) {
        let json = {
            let mut state = self.state.lock();
            let Some(pos) = state.positions.get_mut(key) else {
                return;
            };
            pos.state = new_state;
            serialize_state(&state)
        };
        self.write_file(json);
    }

    /// Stamp a position as `Closing` with its trigger metadata.
    ///
    /// This is the write-time arbiter for concurrent close intents.
    /// Callers decide on lock-scoped snapshots, so two racing closes can
    /// both believe they win; the stored priority and state are therefore
    /// re-checked here, under the same lock as the stamp. A weaker
    /// incoming trigger is refused; ties overwrite.
    pub fn mark_closing(
        &self,
        key: &str,
        trigger: CloseTrigger,
        cause: CloseCause,
    ) -> bool {
        let json = {
            let mut state = self.state.lock();
            let Some(pos) = state.positions.get_mut(key) else {
                return false;
            };

            let state_ok = matches!(pos.state, PositionState::Open | PositionState::Closing)
                || (pos.state == PositionState::PendingResolution
                    && trigger == CloseTrigger::MarketResolution);
            if !state_ok {
                debug!(key = %key, state = pos.state.as_str(), "close stamp refused by state");
                return false;
            }

            let incoming = trigger.priority();
            if let Some(existing) = pos.close_priority {
                if incoming > existing {
                    debug!(key = %key, existing, incoming, "close stamp lost arbitration");
                    return false;
                }
            }

            pos.state = PositionState::Closing;
            pos.close_trigger = Some(trigger);
            pos.close_cause = Some(cause);
            pos.close_priority = Some(incoming);
            serialize_state(&state)
        };
        self.write_file(json);
        true
    }

    /// Undo a failed close attempt so a later trigger can retry.
    pub fn revert_close(&self, key: &str) {
        let json = {
            let mut state = self.state.lock();
            let Some(pos) = state.positions.get_mut(key) else {
                return;
            };
            pos.revert_close();
            serialize_state(&state)
        };
        self.write_file(json);
    }

    /// Force a full atomic rewrite of the backing file.
    pub fn save(&self) -> Result<()> {
        let json = serialize_state(&self.state.lock());
        atomic_write(&self.path, &json)
    }

    fn write_file(&self, json: String) {
        if let Err(e) = atomic_write(&self.path, &json) {
            warn!(path = %self.path.display(), error = %e, "ledger persist failed");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Applied {
    Committed,
    /// Refused, and the hash is burned so the trade never replays.
    RefusedProcessed,
    /// Refused, but retryable once state is repaired.
    RefusedRetryable,
}

fn resolve_key(positions: &HashMap<String, Position>, q: &PositionQuery) -> Option<String> {
    if let Some(token) = &q.token_id {
        let k = canonical_key(&q.market_id, token);
        if positions.contains_key(&k) {
            return Some(k);
        }
    }
    if let Some(label) = &q.outcome_label {
        let k = labeled_key(&q.market_id, q.side, label);
        if positions.contains_key(&k) {
            return Some(k);
        }
    }
    let k = legacy_key(&q.market_id, q.side);
    positions.contains_key(&k).then_some(k)
}

fn primary_key(fill: &TradeFill) -> String {
    match &fill.token_id {
        Some(token) => canonical_key(&fill.market_id, token),
        None => labeled_key(&fill.market_id, fill.side, &fill.outcome_label),
    }
}

/// Find an existing entry for this fill and migrate it under the primary
/// key if it currently lives under a legacy one.
fn migrate_to_primary(state: &mut LedgerState, fill: &TradeFill) -> Option<String> {
    let primary = primary_key(fill);
    if state.positions.contains_key(&primary) {
        return Some(primary);
    }
    let q = PositionQuery {
        market_id: fill.market_id.clone(),
        side: fill.side,
        token_id: fill.token_id.clone(),
        outcome_label: Some(fill.outcome_label.clone()),
    };
    let old_key = resolve_key(&state.positions, &q)?;
    let mut pos = state.positions.remove(&old_key)?;
    if pos.token_id.is_none() {
        pos.token_id = fill.token_id.clone();
    }
    debug!(from = %old_key, to = %primary, "position key migrated");
    state.positions.insert(primary.clone(), pos);
    Some(primary)
}

fn apply_buy(state: &mut LedgerState, fill: &TradeFill, now_ms: i64) -> Applied {
    let tick = clamp_tick(fill.tick);
    let shares = fill.signed_shares;
    let notional = shares * from_tick(tick);

    if state.balance < notional {
        warn!(
            market = %fill.market_id,
            needed = notional,
            balance = state.balance,
            "buy refused: insufficient balance"
        );
        return Applied::RefusedProcessed;
    }

    state.balance -= notional;
    let key = migrate_to_primary(state, fill).unwrap_or_else(|| primary_key(fill));

    match state.positions.get_mut(&key) {
        Some(pos) => {
            let old_cost = pos.invested_usd;
            let old_shares = pos.size;
            let new_shares = old_shares + shares;
            pos.entry_tick = to_tick((old_cost + notional) / new_shares);
            pos.size = new_shares;
            pos.invested_usd = old_cost + notional;
            pos.state = PositionState::Open;
            pos.last_entry_time = now_ms;
            pos.mark_price(tick);
        }
        None => {
            let mut pos = Position {
                market_id: fill.market_id.clone(),
                token_id: fill.token_id.clone(),
                market_name: fill.market_name.clone(),
                slug: fill.slug.clone(),
                side: fill.side,
                outcome_label: fill.outcome_label.clone(),
                market_type: fill.market_type,
                size: shares,
                entry_tick: tick,
                invested_usd: notional,
                realized_pnl: 0.0,
                current_tick: tick,
                current_value: 0.0,
                unrealized_pnl: 0.0,
                state: PositionState::Open,
                close_trigger: None,
                close_cause: None,
                close_priority: None,
                last_entry_time: now_ms,
            };
            pos.mark_price(tick);
            state.positions.insert(key, pos);
        }
    }

    push_trade_event(state, fill, TradeSide::Buy, shares, tick, now_ms);
    Applied::Committed
}

fn apply_sell(state: &mut LedgerState, fill: &TradeFill, now_ms: i64) -> Applied {
    let tick = clamp_tick(fill.tick);
    let is_resolution = fill.reason.contains("RESOLUTION");

    let Some(key) = migrate_to_primary(state, fill) else {
        if is_resolution {
            // A resolution for a position we never held; burn the hash.
            return Applied::RefusedProcessed;
        }
        warn!(market = %fill.market_id, "orphan sell ignored");
        return Applied::RefusedProcessed;
    };

    let Some(pos) = state.positions.get_mut(&key) else {
        return Applied::RefusedRetryable;
    };
    if !matches!(pos.state, PositionState::Open | PositionState::Closing) {
        debug!(key = %key, state = pos.state.as_str(), "sell refused by state gate");
        return Applied::RefusedRetryable;
    }

    let sell_shares = fill.signed_shares.abs().min(pos.size);
    if sell_shares <= 0.0 {
        return Applied::RefusedRetryable;
    }

    let cost_basis = from_tick(pos.entry_tick) * sell_shares;
    let proceeds = from_tick(tick) * sell_shares;
    let pnl = proceeds - cost_basis;

    pos.size -= sell_shares;
    pos.invested_usd = (pos.invested_usd - cost_basis).max(0.0);
    pos.realized_pnl += pnl;
    let dust = pos.size < MIN_POSITION_SIZE;
    state.balance += proceeds;

    if dust {
        let Some(pos) = state.positions.remove(&key) else {
            return Applied::Committed;
        };
        let (trigger, cause) = parse_close_reason(&fill.reason);
        state.closed_positions.push(ClosedPosition {
            market_id: pos.market_id.clone(),
            token_id: pos.token_id.clone(),
            market_name: pos.market_name.clone(),
            slug: pos.slug.clone(),
            side: pos.side,
            outcome_label: pos.outcome_label.clone(),
            market_type: pos.market_type,
            size: sell_shares,
            entry_tick: pos.entry_tick,
            exit_tick: tick,
            invested_usd: cost_basis,
            return_usd: proceeds,
            realized_pnl: pos.realized_pnl,
            close_trigger: trigger,
            close_cause: cause,
            close_timestamp: now_ms,
        });
        info!(
            market = %fill.market_id,
            pnl,
            trigger = trigger.as_str(),
            "position closed"
        );
    }

    if !is_resolution {
        push_trade_event(state, fill, TradeSide::Sell, sell_shares, tick, now_ms);
    }
    Applied::Committed
}

/// `"TRIGGER|CAUSE"`; anything unparseable lands on safe defaults.
fn parse_close_reason(reason: &str) -> (CloseTrigger, CloseCause) {
    let mut parts = reason.splitn(2, '|');
    let trigger = CloseTrigger::parse(parts.next().unwrap_or(""));
    let cause = CloseCause::parse(parts.next().unwrap_or(""));
    (trigger, cause)
}

fn push_trade_event(
    state: &mut LedgerState,
    fill: &TradeFill,
    side: TradeSide,
    size: f64,
    tick: Tick,
    now_ms: i64,
) {
    state.trade_events.push(TradeEvent {
        tx_hash: fill.tx_hash.clone(),
        timestamp: now_ms,
        side,
        market_id: fill.market_id.clone(),
        market_name: fill.market_name.clone(),
        outcome_label: fill.outcome_label.clone(),
        size,
        tick,
        source_tick: fill.source_tick,
        latency_ms: fill.latency_ms,
        reason: fill.reason.clone(),
    });
}

fn serialize_state(state: &LedgerState) -> String {
    serde_json::to_string_pretty(state).unwrap_or_else(|e| {
        warn!(error = %e, "ledger serialization failed");
        String::new()
    })
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if contents.is_empty() {
        anyhow::bail!("refusing to write empty ledger");
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("renaming over {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LedgerStore) {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::open(dir.path().join("ledger.json"), 1000.0).unwrap();
        (dir, store)
    }

    fn buy(market: &str, token: &str, shares: f64, tick: Tick, tx: &str) -> TradeFill {
        TradeFill {
            market_id: market.into(),
            market_name: "Test market".into(),
            slug: "test-market".into(),
            side: Side::Yes,
            outcome_label: "Yes".into(),
            signed_shares: shares,
            tick,
            tx_hash: tx.into(),
            reason: "COPY_TRADE".into(),
            source_tick: Some(tick),
            latency_ms: Some(10),
            token_id: Some(token.into()),
            market_type: MarketType::Single,
        }
    }

    fn sell(market: &str, token: &str, shares: f64, tick: Tick, tx: &str, reason: &str) -> TradeFill {
        TradeFill {
            signed_shares: -shares,
            tx_hash: tx.into(),
            tick,
            reason: reason.into(),
            ..buy(market, token, 0.0, tick, tx)
        }
    }

    #[test]
    fn buy_opens_position_and_debits_balance() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        assert!((s.balance() - 995.6).abs() < 1e-9);
        let positions = s.positions();
        let pos = positions.get("m1:t1").unwrap();
        assert_eq!(pos.entry_tick, 440);
        assert_eq!(pos.size, 10.0);
        assert!((pos.invested_usd - 4.4).abs() < 1e-9);
        assert_eq!(s.trade_events().len(), 1);
    }

    #[test]
    fn scale_in_weights_entry_tick() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        assert!(s.apply_trade(buy("m1", "t1", 20.0, 500, "h2")));
        let positions = s.positions();
        let pos = positions.get("m1:t1").unwrap();
        assert_eq!(pos.size, 30.0);
        // (10*0.44 + 20*0.50) / 30 = 0.48
        assert_eq!(pos.entry_tick, 480);
    }

    #[test]
    fn duplicate_tx_hash_is_idempotent() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        let balance = s.balance();
        assert!(!s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        assert_eq!(s.balance(), balance);
        assert_eq!(s.positions().get("m1:t1").unwrap().size, 10.0);
        assert_eq!(s.trade_events().len(), 1);
    }

    #[test]
    fn full_sell_realizes_pnl_and_closes() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 30.0, 480, "h1")));
        assert!(s.apply_trade(sell(
            "m1",
            "t1",
            30.0,
            550,
            "h2",
            "COPY_TRADER_EVENT|TARGET_SELLOFF"
        )));
        assert!(s.positions().is_empty());
        let closed = s.closed_positions();
        assert_eq!(closed.len(), 1);
        let c = &closed[0];
        assert_eq!(c.exit_tick, 550);
        assert_eq!(c.entry_tick, 480);
        assert!((c.realized_pnl - 2.10).abs() < 1e-9);
        assert_eq!(c.close_trigger, CloseTrigger::CopyTraderEvent);
        assert_eq!(c.close_cause, CloseCause::TargetSelloff);
        // 1000 - 14.4 + 16.5
        assert!((s.balance() - 1002.1).abs() < 1e-9);
    }

    #[test]
    fn partial_sell_keeps_position_open() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 30.0, 480, "h1")));
        assert!(s.apply_trade(sell("m1", "t1", 10.0, 550, "h2", "COPY_TRADER_EVENT|TARGET_SELLOFF")));
        let positions = s.positions();
        let pos = positions.get("m1:t1").unwrap();
        assert_eq!(pos.size, 20.0);
        assert!((pos.realized_pnl - 0.7).abs() < 1e-9);
        assert!(pos.size >= 0.0);
    }

    #[test]
    fn orphan_sell_burns_hash_and_refuses() {
        let (_d, s) = store();
        assert!(!s.apply_trade(sell(
            "m1",
            "t1",
            5.0,
            500,
            "h1",
            "COPY_TRADER_EVENT|TARGET_SELLOFF"
        )));
        assert!(s.is_processed("h1"));
        assert_eq!(s.balance(), 1000.0);
    }

    #[test]
    fn insolvent_buy_refused_and_burned() {
        let (_d, s) = store();
        // 10,000 shares at 0.50 = $5,000 > $1,000.
        assert!(!s.apply_trade(buy("m1", "t1", 10_000.0, 500, "h1")));
        assert!(s.is_processed("h1"));
        assert_eq!(s.balance(), 1000.0);
        assert!(s.positions().is_empty());
    }

    #[test]
    fn resolution_sell_emits_no_trade_event() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        assert!(s.apply_trade(sell(
            "m1",
            "t1",
            10.0,
            999,
            "h2",
            "MARKET_RESOLUTION|WINNER_YES"
        )));
        // Only the BUY event recorded.
        assert_eq!(s.trade_events().len(), 1);
        assert_eq!(s.trade_events()[0].side, TradeSide::Buy);
        assert_eq!(s.closed_positions()[0].close_trigger, CloseTrigger::MarketResolution);
    }

    #[test]
    fn sell_refused_when_state_gate_blocks_but_hash_survives() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        s.update_position_state("m1:t1", PositionState::PendingResolution);
        assert!(!s.apply_trade(sell("m1", "t1", 10.0, 500, "h2", "COPY_TRADER_EVENT|TARGET_SELLOFF")));
        // Retryable: the hash is not burned.
        assert!(!s.is_processed("h2"));
        s.update_position_state("m1:t1", PositionState::Open);
        assert!(s.apply_trade(sell("m1", "t1", 10.0, 500, "h2", "COPY_TRADER_EVENT|TARGET_SELLOFF")));
    }

    #[test]
    fn mark_closing_arbitrates_at_write_time() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));

        // Resolution stamps first.
        assert!(s.mark_closing("m1:t1", CloseTrigger::MarketResolution, CloseCause::WinnerYes));
        // A weaker trigger deciding on a stale snapshot is refused here.
        assert!(!s.mark_closing("m1:t1", CloseTrigger::CopyTraderEvent, CloseCause::TargetSelloff));
        let positions = s.positions();
        let pos = positions.get("m1:t1").unwrap();
        assert_eq!(pos.close_trigger, Some(CloseTrigger::MarketResolution));
        assert_eq!(pos.close_priority, Some(1));
        assert_eq!(pos.close_cause, Some(CloseCause::WinnerYes));

        // Ties overwrite.
        assert!(s.mark_closing("m1:t1", CloseTrigger::MarketResolution, CloseCause::WinnerNo));
        assert_eq!(
            s.positions().get("m1:t1").unwrap().close_cause,
            Some(CloseCause::WinnerNo)
        );

        // Terminal states refuse the stamp outright.
        s.update_position_state("m1:t1", PositionState::Settled);
        assert!(!s.mark_closing("m1:t1", CloseTrigger::MarketResolution, CloseCause::WinnerYes));
    }

    #[test]
    fn balance_conservation_over_sequence() {
        let (_d, s) = store();
        let start = s.balance();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 400, "h1")));
        assert!(s.apply_trade(buy("m2", "t2", 5.0, 200, "h2")));
        assert!(s.apply_trade(sell("m1", "t1", 10.0, 450, "h3", "USER_ACTION|MANUAL_CLOSE")));
        let expected = start - 10.0 * 0.4 - 5.0 * 0.2 + 10.0 * 0.45;
        assert!((s.balance() - expected).abs() < 1e-9);
    }

    #[test]
    fn legacy_position_migrates_to_canonical_key() {
        let (_d, s) = store();
        // Seed a legacy entry by hand: (market, side) key, no token id.
        {
            let mut state = s.state.lock();
            state.positions.insert(
                "m1:YES".into(),
                Position {
                    market_id: "m1".into(),
                    token_id: None,
                    market_name: "Legacy".into(),
                    slug: String::new(),
                    side: Side::Yes,
                    outcome_label: "Yes".into(),
                    market_type: MarketType::Single,
                    size: 10.0,
                    entry_tick: 400,
                    invested_usd: 4.0,
                    realized_pnl: 0.0,
                    current_tick: 400,
                    current_value: 4.0,
                    unrealized_pnl: 0.0,
                    state: PositionState::Open,
                    close_trigger: None,
                    close_cause: None,
                    close_priority: None,
                    last_entry_time: 0,
                },
            );
        }
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 500, "h1")));
        let positions = s.positions();
        assert!(positions.get("m1:YES").is_none());
        let pos = positions.get("m1:t1").unwrap();
        assert_eq!(pos.size, 20.0);
        assert_eq!(pos.token_id.as_deref(), Some("t1"));
        // (4.0 + 5.0) / 20 = 0.45
        assert_eq!(pos.entry_tick, 450);
    }

    #[test]
    fn real_time_price_marks_matching_and_legacy_positions() {
        let (_d, s) = store();
        assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        {
            let mut state = s.state.lock();
            state.positions.insert(
                "m1:NO".into(),
                Position {
                    market_id: "m1".into(),
                    token_id: None,
                    market_name: "Legacy NO".into(),
                    slug: String::new(),
                    side: Side::No,
                    outcome_label: "No".into(),
                    market_type: MarketType::Single,
                    size: 10.0,
                    entry_tick: 500,
                    invested_usd: 5.0,
                    realized_pnl: 0.0,
                    current_tick: 500,
                    current_value: 5.0,
                    unrealized_pnl: 0.0,
                    state: PositionState::Open,
                    close_trigger: None,
                    close_cause: None,
                    close_priority: None,
                    last_entry_time: 0,
                },
            );
        }
        s.update_real_time_price("m1", 600, Some("t1"));
        let positions = s.positions();
        assert_eq!(positions.get("m1:t1").unwrap().current_tick, 600);
        // Legacy NO derives the complement.
        assert_eq!(positions.get("m1:NO").unwrap().current_tick, 400);
    }

    #[test]
    fn persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let s = LedgerStore::open(&path, 1000.0).unwrap();
            assert!(s.apply_trade(buy("m1", "t1", 10.0, 440, "h1")));
        }
        let s2 = LedgerStore::open(&path, 1000.0).unwrap();
        assert!((s2.balance() - 995.6).abs() < 1e-9);
        assert_eq!(s2.positions().len(), 1);
        assert!(s2.is_processed("h1"));
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        fs::write(&path, "not json at all").unwrap();
        let s = LedgerStore::open(&path, 1000.0).unwrap();
        assert_eq!(s.balance(), 1000.0);
    }

    #[test]
    fn market_cache_normalizes_seconds_to_millis() {
        let (_d, s) = store();
        s.update_market_cache(
            "m1",
            "Q?",
            "q",
            vec!["Yes".into()],
            vec!["t".into()],
            Some(1_700_000_000),
            MarketType::Single,
        );
        assert_eq!(s.market_cache("m1").unwrap().end_time_ms, Some(1_700_000_000_000));
        s.update_market_cache("m2", "Q?", "q", vec![], vec![], Some(1_700_000_000_000), MarketType::Single);
        assert_eq!(s.market_cache("m2").unwrap().end_time_ms, Some(1_700_000_000_000));
    }
}
