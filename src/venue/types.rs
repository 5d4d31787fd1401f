//! Raw venue payloads and the deserializers that tame them.
//!
//! The venue is loose with types: floats arrive as strings, arrays arrive as
//! JSON-encoded strings, and half the fields are optional. Everything is
//! normalized here so the rest of the crate never sees a stringly price.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::models::{MarketInfo, OutcomeInfo, TickBook, TickLevel};
use crate::ticks::to_tick;

/// Accept a float that may arrive as a JSON number or a string.
pub fn de_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| serde::de::Error::custom("invalid number")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom("invalid float string")),
        _ => Err(serde::de::Error::custom("expected string or number")),
    }
}

/// Optional variant of [`de_f64`]; null/absent/unparseable become `None`.
pub fn de_f64_opt<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    })
}

/// Accept a list of strings that may arrive as a native array or as a
/// JSON-encoded string (e.g. `"[\"Yes\",\"No\"]"`).
pub fn de_string_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(flatten_string_vec(v))
}

fn flatten_string_vec(v: Value) -> Vec<String> {
    match v {
        Value::Array(arr) => arr
            .into_iter()
            .filter_map(|x| match x {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .map(flatten_string_vec)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Same tolerance for numeric lists (outcome prices arrive every which way).
pub fn de_f64_vec<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Value::deserialize(deserializer)?;
    Ok(flatten_f64_vec(v))
}

fn flatten_f64_vec(v: Value) -> Vec<f64> {
    match v {
        Value::Array(arr) => arr
            .into_iter()
            .filter_map(|x| match x {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.parse::<f64>().ok(),
                _ => None,
            })
            .collect(),
        Value::String(s) => serde_json::from_str::<Value>(&s)
            .map(flatten_f64_vec)
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// One activity item from the source account's feed, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "transactionHash", default, alias = "tx_hash")]
    pub transaction_hash: Option<String>,
    /// Seconds since epoch.
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub activity_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default, deserialize_with = "de_f64")]
    pub size: f64,
    #[serde(default, deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(rename = "conditionId", alias = "marketId", default)]
    pub market_id: String,
}

impl ActivityItem {
    /// Dedup key: transaction hash when present, synthetic id otherwise.
    pub fn external_id(&self) -> Option<String> {
        self.transaction_hash
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| self.id.clone().filter(|s| !s.is_empty()))
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp * 1000
    }

    pub fn is_trade(&self) -> bool {
        self.activity_type.eq_ignore_ascii_case("TRADE")
    }

    pub fn is_buy(&self) -> bool {
        self.side.eq_ignore_ascii_case("BUY")
    }
}

/// One depth level as the venue sends it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOrder {
    #[serde(deserialize_with = "de_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub size: f64,
}

/// Raw order book from `clob/book`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBook {
    #[serde(default)]
    pub bids: Vec<RawOrder>,
    #[serde(default)]
    pub asks: Vec<RawOrder>,
}

impl RawBook {
    /// Convert to the tick grid: drop non-positive sizes, sort bids
    /// descending and asks ascending.
    pub fn normalize(&self) -> TickBook {
        let mut bids: Vec<TickLevel> = self
            .bids
            .iter()
            .filter(|o| o.size > 0.0 && o.price > 0.0)
            .map(|o| TickLevel {
                tick: to_tick(o.price),
                size: o.size,
            })
            .collect();
        let mut asks: Vec<TickLevel> = self
            .asks
            .iter()
            .filter(|o| o.size > 0.0 && o.price > 0.0)
            .map(|o| TickLevel {
                tick: to_tick(o.price),
                size: o.size,
            })
            .collect();
        bids.sort_by(|a, b| b.tick.cmp(&a.tick));
        asks.sort_by(|a, b| a.tick.cmp(&b.tick));
        TickBook { bids, asks }
    }
}

/// A market record from the metadata API. Doubles as an event container:
/// multi-outcome responses carry child markets under `events[].markets[]`
/// or directly under `markets[]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaMarket {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "conditionId", alias = "condition_id", default)]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "de_string_vec")]
    pub outcomes: Vec<String>,
    #[serde(rename = "clobTokenIds", default, deserialize_with = "de_string_vec")]
    pub clob_token_ids: Vec<String>,
    #[serde(rename = "outcomePrices", default, deserialize_with = "de_f64_vec")]
    pub outcome_prices: Vec<f64>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(rename = "umaResolutionStatus", default)]
    pub uma_resolution_status: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "winnerTokenId", default)]
    pub winner_token_id: Option<String>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(rename = "outcomeStatuses", default)]
    pub outcome_statuses: Vec<String>,
    #[serde(rename = "endDate", alias = "endDateIso", alias = "end_date_iso", default)]
    pub end_date: Option<String>,
    #[serde(rename = "acceptingOrders", default)]
    pub accepting_orders: Option<bool>,
    #[serde(default)]
    pub events: Vec<GammaEvent>,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

/// Event wrapper embedded in market responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GammaEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

impl GammaMarket {
    /// The id replication keys on; the venue calls it the condition id.
    pub fn market_id(&self) -> Option<&str> {
        self.condition_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.id.as_deref())
    }

    /// `endDate` parsed to milliseconds since epoch.
    pub fn end_date_ms(&self) -> Option<i64> {
        let raw = self.end_date.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp_millis())
    }

    /// Whether any child market matches `target` on condition id or id.
    pub fn matches(&self, target: &str) -> bool {
        self.condition_id.as_deref() == Some(target) || self.id.as_deref() == Some(target)
    }

    /// Resolution is declared through several venue fields; any one counts.
    pub fn is_resolved(&self) -> bool {
        if self.resolved == Some(true) {
            return true;
        }
        if self
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("resolved"))
            .unwrap_or(false)
        {
            return true;
        }
        if self
            .uma_resolution_status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("resolved"))
            .unwrap_or(false)
        {
            return true;
        }
        if self.winner_token_id.is_some() {
            return true;
        }
        !self.outcome_statuses.is_empty()
            && self
                .outcome_statuses
                .iter()
                .all(|s| s.eq_ignore_ascii_case("resolved"))
    }

    /// Build the normalized market model: outcomes aligned with token ids
    /// in venue order. Returns `None` when the record has no usable legs.
    pub fn normalize(&self) -> Option<MarketInfo> {
        let market_id = self.market_id()?.to_string();
        if self.outcomes.is_empty() || self.clob_token_ids.len() < self.outcomes.len() {
            return None;
        }
        let outcomes: Vec<OutcomeInfo> = self
            .outcomes
            .iter()
            .zip(self.clob_token_ids.iter())
            .enumerate()
            .map(|(i, (label, token_id))| OutcomeInfo {
                token_id: token_id.clone(),
                label: label.clone(),
                tick_price: self.outcome_prices.get(i).map(|p| to_tick(*p)),
            })
            .collect();

        Some(MarketInfo {
            market_id,
            question: self.question.clone().unwrap_or_default(),
            slug: self.slug.clone().unwrap_or_default(),
            outcomes,
            end_time_ms: self.end_date_ms(),
            is_binary: self.outcomes.len() == 2,
            is_resolved: self.is_resolved(),
            winner_token_id: self.winner_token_id.clone(),
        })
    }

    /// Flatten into the event container view used by classification:
    /// child markets when this record wraps an event, else just itself.
    pub fn container(&self) -> MarketContainer {
        let children = if !self.markets.is_empty() {
            self.markets.clone()
        } else if let Some(ev) = self.events.iter().find(|e| e.markets.len() > 1) {
            ev.markets.clone()
        } else {
            vec![self.clone()]
        };
        MarketContainer { markets: children }
    }
}

/// The event container handed to the lifecycle classifier.
#[derive(Debug, Clone, Default)]
pub struct MarketContainer {
    pub markets: Vec<GammaMarket>,
}

/// Best bid/ask snapshot derived from the YES-leg book.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LivePrice {
    pub best_bid: crate::ticks::Tick,
    pub best_ask: crate::ticks::Tick,
    pub mid_tick: crate::ticks::Tick,
}

/// Source-account profile from the data API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, alias = "proxyWallet", alias = "address")]
    pub wallet: Option<String>,
    #[serde(default, alias = "pseudonym", alias = "displayName")]
    pub name: Option<String>,
}

/// One live holding of the source account, used to seed the blacklist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPosition {
    #[serde(rename = "conditionId", alias = "marketId", default)]
    pub market_id: String,
    #[serde(default, deserialize_with = "de_f64")]
    pub size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encoded_arrays_parse() {
        let json = r#"{
            "conditionId": "0xabc",
            "question": "Will it rain?",
            "outcomes": "[\"No\",\"Yes\"]",
            "clobTokenIds": "[\"t0\",\"t1\"]",
            "outcomePrices": "[\"0.42\",\"0.58\"]"
        }"#;
        let m: GammaMarket = serde_json::from_str(json).unwrap();
        assert_eq!(m.outcomes, vec!["No", "Yes"]);
        assert_eq!(m.clob_token_ids, vec!["t0", "t1"]);
        assert_eq!(m.outcome_prices, vec![0.42, 0.58]);
        let info = m.normalize().unwrap();
        assert!(info.is_binary);
        assert_eq!(info.outcomes[1].token_id, "t1");
        assert_eq!(info.outcomes[1].tick_price, Some(580));
    }

    #[test]
    fn native_arrays_parse_too() {
        let json = r#"{
            "conditionId": "0xabc",
            "outcomes": ["A", "B", "C"],
            "clobTokenIds": ["t0", "t1", "t2"],
            "outcomePrices": [0.2, 0.3, 0.5]
        }"#;
        let m: GammaMarket = serde_json::from_str(json).unwrap();
        assert_eq!(m.outcomes.len(), 3);
        assert!(!m.normalize().unwrap().is_binary);
    }

    #[test]
    fn resolution_flags_any_of() {
        let mut m = GammaMarket {
            condition_id: Some("0xabc".into()),
            ..Default::default()
        };
        assert!(!m.is_resolved());
        m.resolved = Some(true);
        assert!(m.is_resolved());

        let m2 = GammaMarket {
            condition_id: Some("0xabc".into()),
            uma_resolution_status: Some("resolved".into()),
            ..Default::default()
        };
        assert!(m2.is_resolved());

        let m3 = GammaMarket {
            condition_id: Some("0xabc".into()),
            winner_token_id: Some("t1".into()),
            ..Default::default()
        };
        assert!(m3.is_resolved());

        let m4 = GammaMarket {
            condition_id: Some("0xabc".into()),
            outcome_statuses: vec!["resolved".into(), "resolved".into()],
            ..Default::default()
        };
        assert!(m4.is_resolved());

        let m5 = GammaMarket {
            condition_id: Some("0xabc".into()),
            outcome_statuses: vec!["resolved".into(), "open".into()],
            ..Default::default()
        };
        assert!(!m5.is_resolved());
    }

    #[test]
    fn book_normalization_sorts_and_filters() {
        let raw: RawBook = serde_json::from_str(
            r#"{
                "bids": [{"price":"0.40","size":"100"},{"price":"0.42","size":"50"},{"price":"0.41","size":"0"}],
                "asks": [{"price":"0.45","size":"10"},{"price":"0.44","size":"20"}]
            }"#,
        )
        .unwrap();
        let book = raw.normalize();
        assert_eq!(book.best_bid(), Some(420));
        assert_eq!(book.best_ask(), Some(440));
        assert_eq!(book.bids.len(), 2);
    }

    #[test]
    fn activity_external_id_prefers_tx_hash() {
        let a: ActivityItem = serde_json::from_str(
            r#"{"id":"42","transactionHash":"0xdead","timestamp":1700000000,"type":"TRADE",
                "side":"BUY","outcome":"Yes","size":"100","price":"0.44","conditionId":"0xabc"}"#,
        )
        .unwrap();
        assert_eq!(a.external_id().as_deref(), Some("0xdead"));
        assert_eq!(a.timestamp_ms(), 1_700_000_000_000);
        assert!(a.is_trade());
        assert!(a.is_buy());
    }

    #[test]
    fn container_prefers_event_children() {
        let json = r#"{
            "conditionId": "0xparent",
            "outcomes": ["Yes","No"],
            "clobTokenIds": ["a","b"],
            "events": [{"markets": [
                {"conditionId": "0xchild1"},
                {"conditionId": "0xchild2"}
            ]}]
        }"#;
        let m: GammaMarket = serde_json::from_str(json).unwrap();
        let c = m.container();
        assert_eq!(c.markets.len(), 2);
    }
}
