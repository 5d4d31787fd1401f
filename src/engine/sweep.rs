//! Periodic maintenance over open positions: lifecycle transitions,
//! liquidity observation, and the REST price fallback for tokens the
//! stream has gone quiet on.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{CloseRequest, CopyEngine};
use crate::audit::AuditCategory;
use crate::lifecycle::{classify, MarketStatus, WinnerSide};
use crate::models::{is_yes_synonym, CloseCause, CloseTrigger, MarketType, Position, PositionState, Side};
use crate::ticks::clamp_signed;

/// Consecutive empty-bid observations before the warning fires.
const EMPTY_BID_WARN_STREAK: u32 = 3;

impl CopyEngine {
    /// Re-classify every open position's market and apply transitions.
    pub(crate) async fn lifecycle_sweep(&self) {
        let positions = self.ledger.positions();
        let now_ms = Utc::now().timestamp_millis();

        for (key, pos) in positions {
            let Some(container) = self.venue.market_container(&pos.market_id).await else {
                debug!(market = %pos.market_id, "container fetch failed in sweep");
                continue;
            };
            let classification = classify(&container, &pos.market_id, now_ms);

            match classification.status {
                MarketStatus::Active => {
                    if pos.state == PositionState::PendingResolution {
                        self.ledger.update_position_state(&key, PositionState::Open);
                        self.audit.log(
                            AuditCategory::Lifecycle,
                            &format!("{} re-opened for trading", pos.market_name),
                        );
                        info!(market = %pos.market_id, "market re-opened; position back to OPEN");
                    }
                }
                MarketStatus::PendingResolution => {
                    if pos.state == PositionState::Open {
                        self.ledger
                            .update_position_state(&key, PositionState::PendingResolution);
                        self.audit.log(
                            AuditCategory::Lifecycle,
                            &format!("{} awaiting resolution", pos.market_name),
                        );
                        info!(market = %pos.market_id, "position now PENDING_RESOLUTION");
                    }
                }
                MarketStatus::Closed => {
                    self.settle_position(&pos, classification.result.as_ref())
                        .await;
                }
            }
        }
    }

    /// Settle one position against a closed market's result.
    async fn settle_position(
        &self,
        pos: &Position,
        result: Option<&crate::lifecycle::ResolutionResult>,
    ) {
        let Some(result) = result else {
            warn!(market = %pos.market_id, "market closed without extractable result");
            return;
        };

        let won = if pos.market_type == MarketType::Multi {
            match result.winning_side {
                Some(side) => side == pos.side,
                None => {
                    warn!(market = %pos.market_id, "multi child closed without winning side");
                    return;
                }
            }
        } else if let Some(label) = &result.winning_label {
            label.eq_ignore_ascii_case(&pos.outcome_label)
        } else {
            match result.winner {
                Some(WinnerSide::YesWon) => pos.side == Side::Yes,
                Some(WinnerSide::NoWon) => pos.side == Side::No,
                None => {
                    warn!(market = %pos.market_id, "resolution winner unknown");
                    return;
                }
            }
        };

        // Cause chosen so the resolution-tick rule pays 999 to winners
        // and 1 to losers.
        let cause = match (won, pos.side) {
            (true, Side::Yes) | (false, Side::No) => CloseCause::WinnerYes,
            (true, Side::No) | (false, Side::Yes) => CloseCause::WinnerNo,
        };

        self.audit.log(
            AuditCategory::Lifecycle,
            &format!(
                "{} resolved; {} position {}",
                pos.market_name,
                pos.outcome_label,
                if won { "won" } else { "lost" }
            ),
        );
        self.close_position(CloseRequest {
            market_id: pos.market_id.clone(),
            side: pos.side,
            trigger: CloseTrigger::MarketResolution,
            cause,
            force_tick: None,
            token_id: pos.token_id.clone(),
            outcome_label: Some(pos.outcome_label.clone()),
            tx_hash: None,
        })
        .await;
    }

    /// Observe bid liquidity for open positions. Empty books are warned
    /// about after a streak, never force-closed: waiting for resolution
    /// beats a zero-proceed exit.
    pub(crate) async fn liquidity_check(&self) {
        let positions = self.ledger.positions();
        let now_ms = Utc::now().timestamp_millis();

        for (key, pos) in positions {
            if pos.state != PositionState::Open {
                continue;
            }
            // Markets past their end time are the lifecycle sweep's problem.
            let past_end = self
                .ledger
                .market_cache(&pos.market_id)
                .and_then(|m| m.end_time_ms)
                .map(|end| now_ms >= end)
                .unwrap_or(false);
            if past_end {
                continue;
            }

            let Some(token) = self.tracked_token(&pos) else {
                continue;
            };
            let Some(book) = self.venue.order_book(&token).await else {
                continue;
            };

            let mut streaks = self.empty_bid_streaks.lock();
            if book.bids.is_empty() {
                let streak = streaks.entry(key.clone()).or_insert(0);
                *streak += 1;
                if *streak == EMPTY_BID_WARN_STREAK {
                    warn!(
                        market = %pos.market_id,
                        outcome = %pos.outcome_label,
                        "no bid liquidity for {EMPTY_BID_WARN_STREAK} consecutive checks"
                    );
                    self.audit.log(
                        AuditCategory::Engine,
                        &format!("{} has no bid liquidity; holding for resolution", pos.market_name),
                    );
                }
            } else {
                streaks.remove(&key);
            }
        }
    }

    /// Refresh marks for positions whose streaming price has gone stale.
    pub(crate) async fn price_fallback(&self) {
        let positions = self.ledger.positions();
        let now_ms = Utc::now().timestamp_millis();

        for pos in positions.values() {
            let cache_key = pos
                .token_id
                .clone()
                .unwrap_or_else(|| pos.market_id.clone());
            if self.ledger.has_fresh_price(&cache_key, now_ms) {
                continue;
            }

            let Some(fetch_token) = self.tracked_token(pos) else {
                continue;
            };
            let Some(book) = self.venue.order_book(&fetch_token).await else {
                continue;
            };
            let Some(mid) = book.mid_tick() else {
                continue;
            };

            match &pos.token_id {
                Some(own_token) => {
                    let tick = if self.tracks_other_leg(pos) {
                        clamp_signed(1000 - mid as i32)
                    } else {
                        mid
                    };
                    self.ledger
                        .update_real_time_price(&pos.market_id, tick, Some(own_token));
                }
                None => {
                    // Legacy binary: the ledger derives the side complement.
                    self.ledger
                        .update_real_time_price(&pos.market_id, mid, None);
                }
            }
        }
    }

    /// Whether this position's live price comes from the other leg's
    /// YES token (multi-outcome NO positions).
    fn tracks_other_leg(&self, pos: &Position) -> bool {
        pos.market_type == MarketType::Multi && pos.side == Side::No
    }

    /// The token whose book prices this position: its own token, the other
    /// leg for multi-NO, or the YES leg looked up by label for legacy
    /// entries. Token ordering in the market cache is never assumed.
    fn tracked_token(&self, pos: &Position) -> Option<String> {
        if self.tracks_other_leg(pos) {
            let own = pos.token_id.as_deref()?;
            let cache = self.ledger.market_cache(&pos.market_id)?;
            return cache
                .clob_token_ids
                .iter()
                .find(|t| t.as_str() != own)
                .cloned();
        }
        if let Some(token) = &pos.token_id {
            return Some(token.clone());
        }
        let cache = self.ledger.market_cache(&pos.market_id)?;
        let idx = cache
            .outcomes
            .iter()
            .position(|label| is_yes_synonym(&label.to_uppercase()))
            .unwrap_or(0);
        cache.clob_token_ids.get(idx).cloned()
    }
}
