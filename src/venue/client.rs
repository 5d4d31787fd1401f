//! Typed REST access to the venue.
//!
//! Every operation is best-effort: transient failures are retried with
//! bounded backoff and exhaustion surfaces as `None`, which callers treat as
//! "no update this tick". The engine consumes this through the [`Venue`]
//! trait so the scenario suite can script a venue without a network.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::models::{is_yes_synonym, MarketInfo, TickBook};
use crate::retry::{with_retry, CallError, RetryConfig};
use crate::ticks::clamp_signed;
use crate::venue::types::{
    ActivityItem, GammaMarket, LivePrice, MarketContainer, RawBook, UserPosition, UserProfile,
};

const DATA_API_BASE: &str = "https://data-api.polymarket.com";
const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const CLOB_API_BASE: &str = "https://clob.polymarket.com";

/// Timeout for order-book snapshots; books go stale fast.
const BOOK_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for metadata and account lookups.
const META_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of activity rows fetched per poll.
const ACTIVITY_LIMIT: u32 = 10;

/// The venue surface the engine depends on.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Source-account activity, newest first as the venue sends it.
    async fn user_activity(&self, address: &str) -> Option<Vec<ActivityItem>>;
    /// Normalized market model.
    async fn market_details(&self, market_id: &str) -> Option<MarketInfo>;
    /// The raw event container for lifecycle classification.
    async fn market_container(&self, market_id: &str) -> Option<MarketContainer>;
    /// Tick-normalized book for one outcome token.
    async fn order_book(&self, token_id: &str) -> Option<TickBook>;
    /// Best bid/ask derived from the YES-leg book.
    async fn live_price(&self, market_id: &str) -> Option<LivePrice>;
    /// Source account's live holdings (blacklist seeding).
    async fn user_positions(&self, address: &str) -> Option<Vec<UserPosition>>;
    /// Source account's public profile.
    async fn user_profile(&self, address: &str) -> Option<UserProfile>;
}

/// Production client over the venue's data, gamma, and CLOB APIs.
pub struct VenueClient {
    client: Client,
    retry: RetryConfig,
    data_api: String,
    gamma_api: String,
    clob_api: String,
}

impl VenueClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("copybot/0.1 (paper trading)")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            retry: RetryConfig::default(),
            data_api: DATA_API_BASE.to_string(),
            gamma_api: GAMMA_API_BASE.to_string(),
            clob_api: CLOB_API_BASE.to_string(),
        }
    }

    /// Point the client at non-default hosts (local stubs in tests).
    pub fn with_base_urls(data_api: String, gamma_api: String, clob_api: String) -> Self {
        Self {
            data_api,
            gamma_api,
            clob_api,
            ..Self::new()
        }
    }

    /// One GET with a per-call timeout, classified for the retry wrapper.
    /// Timeouts (aborts) and connection failures read differently in logs.
    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, CallError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::Transient(format!("aborted after {}ms: {url}", timeout.as_millis()))
                } else if e.is_connect() {
                    CallError::Transient(format!("connect failed: {e}"))
                } else {
                    CallError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(CallError::Transient(format!("status {status}: {url}")));
        }
        if !status.is_success() {
            return Err(CallError::Permanent(format!("status {status}: {url}")));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CallError::Permanent(format!("decode failed: {e}")))
    }

    /// Raw market record by id, falling back to the condition-id filter.
    async fn fetch_market_raw(&self, market_id: &str) -> Option<GammaMarket> {
        let direct_url = format!("{}/markets/{}", self.gamma_api, market_id);
        let direct = with_retry(&self.retry, "market_details", || {
            self.fetch_json::<GammaMarket>(&direct_url, &[], META_TIMEOUT)
        })
        .await;
        if let Some(m) = direct.data {
            return Some(m);
        }

        debug!(market = market_id, "direct lookup missed, trying condition_ids filter");
        let list_url = format!("{}/markets", self.gamma_api);
        let query = [("condition_ids", market_id.to_string())];
        with_retry(&self.retry, "market_details_by_condition", || {
            self.fetch_json::<Vec<GammaMarket>>(&list_url, &query, META_TIMEOUT)
        })
        .await
        .data
        .and_then(|markets| markets.into_iter().next())
    }

    /// The YES-leg token of a market, by label; first leg when no label reads
    /// as YES (multi-outcome parents have no YES leg to speak of).
    fn yes_leg_token(info: &MarketInfo) -> Option<String> {
        info.outcomes
            .iter()
            .find(|o| is_yes_synonym(&o.label.to_uppercase()))
            .or_else(|| info.outcomes.first())
            .map(|o| o.token_id.clone())
    }
}

impl Default for VenueClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Venue for VenueClient {
    async fn user_activity(&self, address: &str) -> Option<Vec<ActivityItem>> {
        let url = format!("{}/activity", self.data_api);
        let query = [
            ("user", address.to_string()),
            ("limit", ACTIVITY_LIMIT.to_string()),
        ];
        with_retry(&self.retry, "user_activity", || {
            self.fetch_json::<Vec<ActivityItem>>(&url, &query, META_TIMEOUT)
        })
        .await
        .data
    }

    async fn market_details(&self, market_id: &str) -> Option<MarketInfo> {
        let raw = self.fetch_market_raw(market_id).await?;
        let info = raw.normalize();
        if info.is_none() {
            warn!(market = market_id, "market record had no usable outcomes");
        }
        info
    }

    async fn market_container(&self, market_id: &str) -> Option<MarketContainer> {
        self.fetch_market_raw(market_id)
            .await
            .map(|raw| raw.container())
    }

    async fn order_book(&self, token_id: &str) -> Option<TickBook> {
        let url = format!("{}/book", self.clob_api);
        let query = [("token_id", token_id.to_string())];
        with_retry(&self.retry, "order_book", || {
            self.fetch_json::<RawBook>(&url, &query, BOOK_TIMEOUT)
        })
        .await
        .data
        .map(|raw| raw.normalize())
    }

    async fn live_price(&self, market_id: &str) -> Option<LivePrice> {
        let info = self.market_details(market_id).await?;
        let token = Self::yes_leg_token(&info)?;
        let book = self.order_book(&token).await?;
        let (best_bid, best_ask) = match (book.best_bid(), book.best_ask()) {
            (Some(b), Some(a)) => (b, a),
            _ => return None,
        };
        Some(LivePrice {
            best_bid,
            best_ask,
            mid_tick: clamp_signed((best_bid as i32 + best_ask as i32) / 2),
        })
    }

    async fn user_positions(&self, address: &str) -> Option<Vec<UserPosition>> {
        let url = format!("{}/positions", self.data_api);
        let query = [("user", address.to_string()), ("size_min", "1".to_string())];
        with_retry(&self.retry, "user_positions", || {
            self.fetch_json::<Vec<UserPosition>>(&url, &query, META_TIMEOUT)
        })
        .await
        .data
    }

    async fn user_profile(&self, address: &str) -> Option<UserProfile> {
        let url = format!("{}/users/{}", self.data_api, address);
        with_retry(&self.retry, "user_profile", || {
            self.fetch_json::<UserProfile>(&url, &[], META_TIMEOUT)
        })
        .await
        .data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutcomeInfo;

    fn info(labels: &[&str]) -> MarketInfo {
        MarketInfo {
            market_id: "m".into(),
            question: "q".into(),
            slug: String::new(),
            outcomes: labels
                .iter()
                .enumerate()
                .map(|(i, l)| OutcomeInfo {
                    token_id: format!("t{i}"),
                    label: l.to_string(),
                    tick_price: None,
                })
                .collect(),
            end_time_ms: None,
            is_binary: labels.len() == 2,
            is_resolved: false,
            winner_token_id: None,
        }
    }

    #[test]
    fn yes_leg_found_by_label_not_index() {
        let m = info(&["No", "Yes"]);
        assert_eq!(VenueClient::yes_leg_token(&m).as_deref(), Some("t1"));
    }

    #[test]
    fn yes_leg_falls_back_to_first_outcome() {
        let m = info(&["Arsenal", "Chelsea"]);
        assert_eq!(VenueClient::yes_leg_token(&m).as_deref(), Some("t0"));
    }

    #[tokio::test]
    #[ignore] // Hits the live venue; run manually.
    async fn live_activity_fetch() {
        let client = VenueClient::new();
        let out = client
            .user_activity("0x0000000000000000000000000000000000000000")
            .await;
        println!("activity: {:?}", out.map(|v| v.len()));
    }
}
