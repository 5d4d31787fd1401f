//! Core domain types for the paper copy-trader.
//!
//! Everything the ledger persists lives here. Enumerations are closed: the
//! ledger file may come from an older build, so unknown variant strings
//! coerce to safe defaults at load instead of failing the whole file.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ticks::Tick;

/// Which leg of a binary market a position holds. Multi-outcome positions
/// always trade their own leg as YES.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    /// Lenient parse for dashboard input and legacy ledger entries.
    pub fn parse_loose(s: &str) -> Side {
        match s.trim().to_uppercase().as_str() {
            "NO" | "N" => Side::No,
            _ => Side::Yes,
        }
    }
}

impl Serialize for Side {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Side {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(Side::parse_loose(&raw))
    }
}

/// Single (binary YES/NO) vs multi-outcome market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketType {
    #[serde(rename = "SINGLE")]
    Single,
    #[serde(rename = "MULTI", alias = "MULTI_OUTCOME")]
    Multi,
}

impl Default for MarketType {
    fn default() -> Self {
        MarketType::Single
    }
}

/// Position lifecycle. Unknown strings from older ledgers coerce to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    Open,
    Closing,
    PendingResolution,
    Closed,
    Settled,
    Invalidated,
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::PendingResolution => "PENDING_RESOLUTION",
            PositionState::Closed => "CLOSED",
            PositionState::Settled => "SETTLED",
            PositionState::Invalidated => "INVALIDATED",
        }
    }

    fn parse(s: &str) -> PositionState {
        match s {
            "OPEN" => PositionState::Open,
            "CLOSING" => PositionState::Closing,
            "PENDING_RESOLUTION" => PositionState::PendingResolution,
            "CLOSED" => PositionState::Closed,
            "SETTLED" => PositionState::Settled,
            "INVALIDATED" => PositionState::Invalidated,
            _ => PositionState::Open,
        }
    }
}

impl Serialize for PositionState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PositionState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(PositionState::parse(&raw))
    }
}

/// What initiated a close. Lower priority number wins arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    MarketResolution,
    SystemGuard,
    UserAction,
    CopyTraderEvent,
    SystemPolicy,
    Timeout,
}

impl CloseTrigger {
    /// Numeric rank; 1 is strongest.
    pub fn priority(&self) -> u8 {
        match self {
            CloseTrigger::MarketResolution => 1,
            CloseTrigger::SystemGuard => 2,
            CloseTrigger::UserAction => 3,
            CloseTrigger::CopyTraderEvent => 4,
            CloseTrigger::SystemPolicy => 5,
            CloseTrigger::Timeout => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTrigger::MarketResolution => "MARKET_RESOLUTION",
            CloseTrigger::SystemGuard => "SYSTEM_GUARD",
            CloseTrigger::UserAction => "USER_ACTION",
            CloseTrigger::CopyTraderEvent => "COPY_TRADER_EVENT",
            CloseTrigger::SystemPolicy => "SYSTEM_POLICY",
            CloseTrigger::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> CloseTrigger {
        match s {
            "MARKET_RESOLUTION" => CloseTrigger::MarketResolution,
            "SYSTEM_GUARD" => CloseTrigger::SystemGuard,
            "USER_ACTION" => CloseTrigger::UserAction,
            "COPY_TRADER_EVENT" => CloseTrigger::CopyTraderEvent,
            "TIMEOUT" => CloseTrigger::Timeout,
            _ => CloseTrigger::SystemPolicy,
        }
    }
}

impl Serialize for CloseTrigger {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CloseTrigger {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(CloseTrigger::parse(&raw))
    }
}

/// Why the close happened, recorded alongside the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    WinnerYes,
    WinnerNo,
    TargetSelloff,
    ManualClose,
    CloseAll,
    Unspecified,
}

impl CloseCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::WinnerYes => "WINNER_YES",
            CloseCause::WinnerNo => "WINNER_NO",
            CloseCause::TargetSelloff => "TARGET_SELLOFF",
            CloseCause::ManualClose => "MANUAL_CLOSE",
            CloseCause::CloseAll => "CLOSE_ALL",
            CloseCause::Unspecified => "UNSPECIFIED",
        }
    }

    pub fn parse(s: &str) -> CloseCause {
        match s {
            "WINNER_YES" => CloseCause::WinnerYes,
            "WINNER_NO" => CloseCause::WinnerNo,
            "TARGET_SELLOFF" => CloseCause::TargetSelloff,
            "MANUAL_CLOSE" => CloseCause::ManualClose,
            "CLOSE_ALL" => CloseCause::CloseAll,
            _ => CloseCause::Unspecified,
        }
    }
}

impl Serialize for CloseCause {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CloseCause {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(CloseCause::parse(&raw))
    }
}

/// An open (or transitioning) paper position.
///
/// Canonical identity is `(market_id, token_id)`. Entries written by old
/// builds may lack `token_id`; they resolve through the legacy
/// `(market_id, side)` key until first touched, then migrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub market_name: String,
    #[serde(default)]
    pub slug: String,
    pub side: Side,
    #[serde(default)]
    pub outcome_label: String,
    #[serde(default)]
    pub market_type: MarketType,
    /// Shares held; never negative.
    pub size: f64,
    /// Size-weighted average entry price.
    pub entry_tick: Tick,
    pub invested_usd: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    pub current_tick: Tick,
    #[serde(default)]
    pub current_value: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default = "default_state")]
    pub state: PositionState,
    #[serde(default)]
    pub close_trigger: Option<CloseTrigger>,
    #[serde(default)]
    pub close_cause: Option<CloseCause>,
    #[serde(default)]
    pub close_priority: Option<u8>,
    /// Milliseconds since epoch of the most recent buy into this position.
    #[serde(default)]
    pub last_entry_time: i64,
}

fn default_state() -> PositionState {
    PositionState::Open
}

impl Position {
    /// Refresh the derived mark-to-market fields from a new price.
    pub fn mark_price(&mut self, tick: Tick) {
        self.current_tick = tick;
        self.current_value = self.size * crate::ticks::from_tick(tick);
        self.unrealized_pnl = self.current_value - self.invested_usd;
    }

    /// Clear transient close markers after a failed commit so a later
    /// trigger can retry.
    pub fn revert_close(&mut self) {
        self.state = PositionState::Open;
        self.close_trigger = None;
        self.close_cause = None;
        self.close_priority = None;
    }
}

/// Immutable record of a realized close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub market_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub market_name: String,
    #[serde(default)]
    pub slug: String,
    pub side: Side,
    #[serde(default)]
    pub outcome_label: String,
    #[serde(default)]
    pub market_type: MarketType,
    pub size: f64,
    pub entry_tick: Tick,
    pub exit_tick: Tick,
    pub invested_usd: f64,
    pub return_usd: f64,
    pub realized_pnl: f64,
    pub close_trigger: CloseTrigger,
    pub close_cause: CloseCause,
    /// Milliseconds since epoch.
    pub close_timestamp: i64,
}

/// Direction of a replicated trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Append-only audit record, one per BUY and one per user-initiated SELL.
/// System settlements never emit trade events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// External transaction hash; the dedup key.
    pub tx_hash: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub side: TradeSide,
    pub market_id: String,
    pub market_name: String,
    #[serde(default)]
    pub outcome_label: String,
    pub size: f64,
    pub tick: Tick,
    /// Price the source account traded at, when known.
    #[serde(default)]
    pub source_tick: Option<Tick>,
    /// Observed copy latency from source trade to our commit.
    #[serde(default)]
    pub latency_ms: Option<i64>,
    pub reason: String,
}

/// Cached market metadata so replication does not refetch per trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMarket {
    pub market_id: String,
    pub question: String,
    #[serde(default)]
    pub slug: String,
    pub outcomes: Vec<String>,
    pub clob_token_ids: Vec<String>,
    /// Milliseconds since epoch; absent for perpetual/unknown end.
    #[serde(default)]
    pub end_time_ms: Option<i64>,
    /// Whether this market is a child of a multi-outcome event.
    #[serde(default)]
    pub market_type: MarketType,
}

/// One outcome leg of a normalized market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeInfo {
    pub token_id: String,
    pub label: String,
    #[serde(default)]
    pub tick_price: Option<Tick>,
}

/// Normalized market model produced by the venue client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketInfo {
    pub market_id: String,
    pub question: String,
    #[serde(default)]
    pub slug: String,
    /// Venue order preserved; token ids aligned by index.
    pub outcomes: Vec<OutcomeInfo>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub end_time_ms: Option<i64>,
    pub is_binary: bool,
    pub is_resolved: bool,
    #[serde(default)]
    pub winner_token_id: Option<String>,
}

/// One depth level of a normalized book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickLevel {
    pub tick: Tick,
    pub size: f64,
}

/// Order book with prices already on the tick grid.
/// Bids sorted descending, asks ascending, all sizes positive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickBook {
    pub bids: Vec<TickLevel>,
    pub asks: Vec<TickLevel>,
}

impl TickBook {
    pub fn best_bid(&self) -> Option<Tick> {
        self.bids.first().map(|l| l.tick)
    }

    pub fn best_ask(&self) -> Option<Tick> {
        self.asks.first().map(|l| l.tick)
    }

    /// Midpoint of the touch, when both sides exist.
    pub fn mid_tick(&self) -> Option<Tick> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(crate::ticks::clamp_signed((b as i32 + a as i32) / 2)),
            _ => None,
        }
    }
}

/// Synonyms the venue uses for the YES leg of a binary market.
pub const YES_SYNONYMS: [&str; 5] = ["YES", "1", "TRUE", "UP", "PASS"];
/// Synonyms the venue uses for the NO leg of a binary market.
pub const NO_SYNONYMS: [&str; 5] = ["NO", "0", "FALSE", "DOWN", "FAIL"];

/// Whether an uppercased outcome label reads as a NO leg.
pub fn is_no_synonym(label_upper: &str) -> bool {
    NO_SYNONYMS.contains(&label_upper)
}

/// Whether an uppercased outcome label reads as a YES leg.
pub fn is_yes_synonym(label_upper: &str) -> bool {
    YES_SYNONYMS.contains(&label_upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_state_coerces_to_open() {
        let s: PositionState = serde_json::from_str("\"LIMBO\"").unwrap();
        assert_eq!(s, PositionState::Open);
    }

    #[test]
    fn unknown_trigger_coerces_to_system_policy() {
        let t: CloseTrigger = serde_json::from_str("\"GREMLIN\"").unwrap();
        assert_eq!(t, CloseTrigger::SystemPolicy);
    }

    #[test]
    fn trigger_priorities_are_ordered() {
        assert!(CloseTrigger::MarketResolution.priority() < CloseTrigger::SystemGuard.priority());
        assert!(CloseTrigger::SystemGuard.priority() < CloseTrigger::UserAction.priority());
        assert!(CloseTrigger::UserAction.priority() < CloseTrigger::CopyTraderEvent.priority());
        assert!(CloseTrigger::CopyTraderEvent.priority() < CloseTrigger::SystemPolicy.priority());
        assert!(CloseTrigger::SystemPolicy.priority() < CloseTrigger::Timeout.priority());
    }

    #[test]
    fn state_round_trips_through_json() {
        for s in [
            PositionState::Open,
            PositionState::Closing,
            PositionState::PendingResolution,
            PositionState::Closed,
            PositionState::Settled,
            PositionState::Invalidated,
        ] {
            let json = serde_json::to_string(&s).unwrap();
            let back: PositionState = serde_json::from_str(&json).unwrap();
            assert_eq!(back, s);
        }
    }

    #[test]
    fn synonym_tables() {
        assert!(is_yes_synonym("UP"));
        assert!(is_no_synonym("DOWN"));
        assert!(!is_yes_synonym("ARSENAL"));
        assert!(!is_no_synonym("ARSENAL"));
    }

    #[test]
    fn mark_price_updates_derived_fields() {
        let mut p = Position {
            market_id: "m".into(),
            token_id: Some("t".into()),
            market_name: "q".into(),
            slug: String::new(),
            side: Side::Yes,
            outcome_label: "Yes".into(),
            market_type: MarketType::Single,
            size: 10.0,
            entry_tick: 440,
            invested_usd: 4.4,
            realized_pnl: 0.0,
            current_tick: 440,
            current_value: 4.4,
            unrealized_pnl: 0.0,
            state: PositionState::Open,
            close_trigger: None,
            close_cause: None,
            close_priority: None,
            last_entry_time: 0,
        };
        p.mark_price(500);
        assert_eq!(p.current_tick, 500);
        assert!((p.current_value - 5.0).abs() < 1e-9);
        assert!((p.unrealized_pnl - 0.6).abs() < 1e-9);
    }
}
