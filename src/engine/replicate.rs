//! Replication of one observed source trade into a paper fill.
//!
//! The pipeline runs its gates in a fixed order: cursor, dedup,
//! blacklist, metadata, outcome mapping, execution pricing, the max-tick
//! guard, sizing, the sell loss-guard, and the slippage gate. Skips never
//! burn the transaction hash: a trade skipped on a bad book is retried
//! when the book heals; only the ledger itself marks hashes processed.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::CopyEngine;
use crate::audit::{AuditCategory, TradeCsvRow};
use crate::ledger::TradeFill;
use crate::models::{
    is_no_synonym, is_yes_synonym, CachedMarket, CloseCause, CloseTrigger, MarketType, Side,
    TickBook,
};
use crate::retry::{with_retry, CallError};
use crate::settings::{SizingMode, TradeSettings};
use crate::slippage;
use crate::ticks::{from_tick, to_tick, Tick, MAX_TICK};
use crate::venue::types::ActivityItem;

/// Sells losing more than this fraction against entry are not copied.
const MAX_SELL_LOSS_PCT: f64 = 0.10;
/// Floor for the tick used in fixed-USD share sizing.
const MIN_SIZING_TICK: Tick = 10;

/// Outcome selected for replication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SelectedOutcome {
    pub index: usize,
    pub label: String,
    pub token_id: String,
}

/// Label-based outcome selection: exact match first, binary synonym
/// tables second. Index order is never used to infer YES/NO.
pub(crate) fn select_outcome(
    outcomes: &[String],
    token_ids: &[String],
    source_outcome: &str,
) -> Option<SelectedOutcome> {
    let src = source_outcome.trim().to_uppercase();
    if src.is_empty() {
        return None;
    }

    let exact = outcomes
        .iter()
        .position(|label| label.to_uppercase() == src);
    let index = exact.or_else(|| {
        if outcomes.len() != 2 {
            return None;
        }
        if is_yes_synonym(&src) {
            outcomes
                .iter()
                .position(|label| is_yes_synonym(&label.to_uppercase()))
        } else if is_no_synonym(&src) {
            outcomes
                .iter()
                .position(|label| is_no_synonym(&label.to_uppercase()))
        } else {
            None
        }
    })?;

    Some(SelectedOutcome {
        index,
        label: outcomes.get(index)?.clone(),
        token_id: token_ids.get(index)?.clone(),
    })
}

/// Canonical side for a selected outcome: binary NO legs are NO, everything
/// else (including every multi-outcome leg) trades as its own YES.
pub(crate) fn canonical_side(label: &str, market_type: MarketType, is_binary: bool) -> Side {
    if market_type == MarketType::Single && is_binary && is_no_synonym(&label.to_uppercase()) {
        Side::No
    } else {
        Side::Yes
    }
}

/// Share sizing per the active settings.
pub(crate) fn size_shares(
    settings: &TradeSettings,
    source_size: f64,
    execution_tick: Tick,
    min_order_shares: f64,
) -> f64 {
    let shares = match settings.mode {
        SizingMode::Fixed => {
            let price = from_tick(execution_tick.max(MIN_SIZING_TICK));
            settings.fixed_amount_usd / price
        }
        SizingMode::Percentage => source_size * settings.percentage,
    };
    shares.max(min_order_shares)
}

impl CopyEngine {
    /// Replicate one source trade. Skips are silent at info level and never
    /// mark the hash processed.
    pub(crate) async fn replicate_trade(&self, item: &ActivityItem) {
        let Some(tx_hash) = item.external_id() else {
            debug!("activity item without id skipped");
            return;
        };

        if item.timestamp_ms() < self.cursor_ms() {
            return;
        }
        if self.ledger.has_trade_event(&tx_hash) || self.ledger.is_processed(&tx_hash) {
            return;
        }
        if item.market_id.is_empty() {
            return;
        }
        if self.filter.is_blacklisted(&item.market_id)
            && !self.ledger.has_position_in_market(&item.market_id)
        {
            debug!(market = %item.market_id, "blacklisted market skipped");
            return;
        }

        let Some(market) = self.market_model(&item.market_id).await else {
            debug!(market = %item.market_id, "no usable market model");
            return;
        };

        let Some(selected) =
            select_outcome(&market.outcomes, &market.clob_token_ids, &item.outcome)
        else {
            debug!(
                market = %item.market_id,
                outcome = %item.outcome,
                "source outcome did not map to any leg"
            );
            return;
        };
        let is_binary = market.outcomes.len() == 2;
        let side = canonical_side(&selected.label, market.market_type, is_binary);

        let is_buy = item.is_buy();
        let fetch_time_ms = Utc::now().timestamp_millis();
        let mut book = self.venue.order_book(&selected.token_id).await;
        let mut execution_tick = execution_tick_from(book.as_ref(), is_buy, item.price);

        // Max-tick guard: a book pinned at 0.999 is a resolution in all but
        // name. Wait once, look again, and walk away if nothing moved.
        if execution_tick >= MAX_TICK {
            tokio::time::sleep(std::time::Duration::from_millis(
                self.config.max_tick_recheck_ms,
            ))
            .await;
            let retried = self.venue.order_book(&selected.token_id).await;
            execution_tick = execution_tick_from(retried.as_ref(), is_buy, item.price);
            if execution_tick >= MAX_TICK {
                info!(
                    market = %item.market_id,
                    outcome = %selected.label,
                    "skipped: book pinned at max tick"
                );
                return;
            }
            book = retried;
        }

        let settings = self.settings.get();
        let mut shares = size_shares(
            &settings,
            item.size,
            execution_tick,
            self.config.min_order_size_shares,
        );

        let existing = self.ledger.resolve_position(&crate::ledger::PositionQuery {
            market_id: item.market_id.clone(),
            side,
            token_id: Some(selected.token_id.clone()),
            outcome_label: Some(selected.label.clone()),
        });

        if !is_buy {
            let Some((_, pos)) = &existing else {
                debug!(market = %item.market_id, "sell without a local position skipped");
                return;
            };
            shares = shares.min(pos.size);
            if shares <= 0.0 {
                return;
            }

            // Loss-guard: do not chase the source into a deep drawdown.
            if self.config.enable_trade_filters {
                let entry = pos.entry_tick as f64;
                let loss_pct = (entry - execution_tick as f64) / entry;
                if loss_pct > MAX_SELL_LOSS_PCT {
                    info!(
                        market = %item.market_id,
                        loss_pct,
                        "sell skipped by loss-guard"
                    );
                    return;
                }
            }
        }

        if self.config.enable_trade_filters && self.config.expected_edge > 0.0 {
            if let Some(book) = book.as_ref() {
                if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
                    let notional = shares * from_tick(execution_tick);
                    let est = slippage::estimate(
                        bid,
                        ask,
                        book,
                        notional,
                        is_buy,
                        self.config.expected_edge,
                        self.config.slippage_delay_penalty,
                    );
                    if !est.should_execute {
                        info!(market = %item.market_id, reason = %est.reason, "skipped by slippage gate");
                        return;
                    }
                }
            }
        }

        let source_tick = to_tick(item.price);
        if is_buy {
            self.commit_buy(
                item,
                &market,
                &selected.label,
                &selected.token_id,
                side,
                shares,
                execution_tick,
                source_tick,
                fetch_time_ms,
                tx_hash,
            )
            .await;
        } else {
            let closed = self
                .close_position(super::CloseRequest {
                    market_id: item.market_id.clone(),
                    side,
                    trigger: CloseTrigger::CopyTraderEvent,
                    cause: CloseCause::TargetSelloff,
                    force_tick: Some(execution_tick),
                    token_id: Some(selected.token_id.clone()),
                    outcome_label: Some(selected.label.clone()),
                    tx_hash: Some(tx_hash),
                })
                .await;
            if closed {
                info!(market = %item.market_id, "source sell-off copied");
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_buy(
        &self,
        item: &ActivityItem,
        market: &CachedMarket,
        outcome_label: &str,
        token_id: &str,
        side: Side,
        shares: f64,
        execution_tick: Tick,
        source_tick: Tick,
        fetch_time_ms: i64,
        tx_hash: String,
    ) {
        let latency_ms = (Utc::now().timestamp_millis() - fetch_time_ms).max(0);
        let fill = TradeFill {
            market_id: market.market_id.clone(),
            market_name: market.question.clone(),
            slug: market.slug.clone(),
            side,
            outcome_label: outcome_label.to_string(),
            signed_shares: shares,
            tick: execution_tick,
            tx_hash,
            reason: "COPY_TRADE".to_string(),
            source_tick: Some(source_tick),
            latency_ms: Some(latency_ms),
            token_id: Some(token_id.to_string()),
            market_type: market.market_type,
        };

        let committed = with_retry(&self.retry, "ledger_commit", || {
            let fill = fill.clone();
            async move {
                if self.ledger.apply_trade(fill) {
                    Ok(())
                } else {
                    Err(CallError::Permanent("ledger refused fill".to_string()))
                }
            }
        })
        .await;

        if !committed.success {
            warn!(market = %market.market_id, "buy commit refused");
            return;
        }

        info!(
            market = %market.market_id,
            outcome = outcome_label,
            shares,
            tick = execution_tick,
            latency_ms,
            "copy buy committed"
        );
        self.audit.log(
            AuditCategory::Trade,
            &format!(
                "copied BUY {:.2} {} @ {:.3} on {} (source size {:.2})",
                shares,
                outcome_label,
                from_tick(execution_tick),
                market.question,
                item.size
            ),
        );
        self.audit.log_trade(&TradeCsvRow {
            profile_address: self.config.profile_address.clone(),
            market_question: market.question.clone(),
            side: "BUY".into(),
            size: shares,
            price: from_tick(execution_tick),
            intent: "COPY_TRADE".into(),
        });

        self.refresh_subscriptions();
    }

    /// Cached market model, fetching and classifying on a miss.
    pub(crate) async fn market_model(&self, market_id: &str) -> Option<CachedMarket> {
        if let Some(cached) = self.ledger.market_cache(market_id) {
            return Some(cached);
        }

        let container = self.venue.market_container(market_id).await?;
        let now_ms = Utc::now().timestamp_millis();
        let classification = crate::lifecycle::classify(&container, market_id, now_ms);

        let child = container
            .markets
            .iter()
            .find(|m| m.matches(market_id))
            .or_else(|| container.markets.first())?;
        let info = child.normalize()?;

        self.ledger.update_market_cache(
            &info.market_id,
            &info.question,
            &info.slug,
            info.outcomes.iter().map(|o| o.label.clone()).collect(),
            info.outcomes.iter().map(|o| o.token_id.clone()).collect(),
            info.end_time_ms,
            classification.market_type,
        );
        self.ledger.market_cache(market_id)
    }
}

/// Best ask on buys, best bid on sells; the source's own price when the
/// book is one-sided or missing.
pub(crate) fn execution_tick_from(book: Option<&TickBook>, is_buy: bool, source_price: f64) -> Tick {
    match book {
        Some(b) => match (b.best_bid(), b.best_ask()) {
            (Some(bid), Some(ask)) => {
                if is_buy {
                    ask
                } else {
                    bid
                }
            }
            _ => to_tick(source_price),
        },
        None => to_tick(source_price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_label_match_wins() {
        let outcomes = vec!["Arsenal".to_string(), "Chelsea".to_string()];
        let tokens = vec!["t0".to_string(), "t1".to_string()];
        let sel = select_outcome(&outcomes, &tokens, "chelsea").unwrap();
        assert_eq!(sel.index, 1);
        assert_eq!(sel.token_id, "t1");
    }

    #[test]
    fn binary_synonyms_resolve() {
        let outcomes = vec!["No".to_string(), "Yes".to_string()];
        let tokens = vec!["t0".to_string(), "t1".to_string()];
        // UP is a YES synonym; label order must not matter.
        let sel = select_outcome(&outcomes, &tokens, "UP").unwrap();
        assert_eq!(sel.label, "Yes");
        let sel = select_outcome(&outcomes, &tokens, "FALSE").unwrap();
        assert_eq!(sel.label, "No");
    }

    #[test]
    fn synonyms_ignored_for_multi() {
        let outcomes = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let tokens = vec!["t0".to_string(), "t1".to_string(), "t2".to_string()];
        assert!(select_outcome(&outcomes, &tokens, "YES").is_none());
    }

    #[test]
    fn unmapped_outcome_skips() {
        let outcomes = vec!["No".to_string(), "Yes".to_string()];
        let tokens = vec!["t0".to_string(), "t1".to_string()];
        assert!(select_outcome(&outcomes, &tokens, "MAYBE").is_none());
        assert!(select_outcome(&outcomes, &tokens, "").is_none());
    }

    #[test]
    fn canonical_side_rules() {
        assert_eq!(canonical_side("No", MarketType::Single, true), Side::No);
        assert_eq!(canonical_side("Down", MarketType::Single, true), Side::No);
        assert_eq!(canonical_side("Yes", MarketType::Single, true), Side::Yes);
        // Every multi leg trades as its own YES, whatever the label.
        assert_eq!(canonical_side("No", MarketType::Multi, true), Side::Yes);
        assert_eq!(canonical_side("Chelsea", MarketType::Multi, false), Side::Yes);
    }

    #[test]
    fn fixed_sizing_uses_tick_floor() {
        let settings = TradeSettings {
            mode: SizingMode::Fixed,
            percentage: 0.1,
            fixed_amount_usd: 10.0,
        };
        // $10 at 0.5 = 20 shares.
        assert!((size_shares(&settings, 0.0, 500, 1.0) - 20.0).abs() < 1e-9);
        // A 1-tick price would explode; the sizing floor caps shares at
        // $10 / 0.010 = 1000.
        assert!((size_shares(&settings, 0.0, 1, 1.0) - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn percentage_sizing_scales_source() {
        let settings = TradeSettings {
            mode: SizingMode::Percentage,
            percentage: 0.10,
            fixed_amount_usd: 10.0,
        };
        assert!((size_shares(&settings, 100.0, 440, 1.0) - 10.0).abs() < 1e-9);
        // Minimum order floor.
        assert!((size_shares(&settings, 2.0, 440, 1.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn execution_tick_prefers_book_touch() {
        use crate::models::TickLevel;
        let book = TickBook {
            bids: vec![TickLevel { tick: 420, size: 10.0 }],
            asks: vec![TickLevel { tick: 440, size: 10.0 }],
        };
        assert_eq!(execution_tick_from(Some(&book), true, 0.9), 440);
        assert_eq!(execution_tick_from(Some(&book), false, 0.9), 420);
        // One-sided or missing books fall back to the source price.
        let one_sided = TickBook {
            bids: vec![],
            asks: vec![TickLevel { tick: 440, size: 10.0 }],
        };
        assert_eq!(execution_tick_from(Some(&one_sided), true, 0.55), 550);
        assert_eq!(execution_tick_from(None, false, 0.31), 310);
    }
}
