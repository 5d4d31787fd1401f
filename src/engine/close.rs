//! Centralized position close with priority arbitration.
//!
//! Every close path in the system funnels through [`CopyEngine::close_position`]:
//! copy-sells, manual closes, close-all, and market resolution. The gates
//! run in order (state, minimum hold, priority) and only the winner gets
//! to stamp the position `CLOSING` and commit the sell. A failed commit
//! reverts the stamp so a stronger trigger can retry.

use chrono::Utc;
use tracing::{debug, info, warn};

use super::CopyEngine;
use crate::audit::{AuditCategory, TradeCsvRow};
use crate::ledger::{PositionQuery, TradeFill};
use crate::models::{CloseCause, CloseTrigger, PositionState, Side};
use crate::ticks::{clamp_signed, clamp_tick, from_tick, Tick, MAX_TICK, MIN_TICK};

/// A close intent against one position.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub market_id: String,
    pub side: Side,
    pub trigger: CloseTrigger,
    pub cause: CloseCause,
    /// Execution tick already known by the caller (copy-sells).
    pub force_tick: Option<Tick>,
    pub token_id: Option<String>,
    pub outcome_label: Option<String>,
    /// External transaction hash for copy-sells; synthetic otherwise.
    pub tx_hash: Option<String>,
}

impl CopyEngine {
    /// Arbitrate and, if this intent wins, commit the close.
    /// Returns true only when the ledger accepted the sell.
    pub async fn close_position(&self, req: CloseRequest) -> bool {
        let query = PositionQuery {
            market_id: req.market_id.clone(),
            side: req.side,
            token_id: req.token_id.clone(),
            outcome_label: req.outcome_label.clone(),
        };
        let Some((key, pos)) = self.ledger.resolve_position(&query) else {
            debug!(market = %req.market_id, side = req.side.as_str(), "close for unknown position");
            return false;
        };

        // State gate: an in-flight CLOSING is contested through the
        // priority gate below; resolution may settle a pending position;
        // CLOSED/SETTLED/INVALIDATED admit nothing.
        let state_ok = matches!(pos.state, PositionState::Open | PositionState::Closing)
            || (pos.state == PositionState::PendingResolution
                && req.trigger == CloseTrigger::MarketResolution);
        if !state_ok {
            debug!(
                key = %key,
                state = pos.state.as_str(),
                trigger = req.trigger.as_str(),
                "close blocked by state gate"
            );
            return false;
        }

        // Minimum hold, waived for user action and resolution.
        let now_ms = Utc::now().timestamp_millis();
        if !matches!(
            req.trigger,
            CloseTrigger::UserAction | CloseTrigger::MarketResolution
        ) && now_ms - pos.last_entry_time < self.config.min_hold_ms
        {
            debug!(key = %key, "close blocked by minimum hold");
            return false;
        }

        // Priority gate: a stronger (or equal) incoming priority overwrites,
        // a weaker one is dropped. This check runs on the snapshot and is
        // only an early-out; the authoritative comparison happens inside
        // `mark_closing`, under the ledger lock.
        let incoming = req.trigger.priority();
        if let Some(existing) = pos.close_priority {
            if incoming > existing {
                debug!(
                    key = %key,
                    existing,
                    incoming,
                    "close outranked by pending trigger"
                );
                return false;
            }
        }

        let exit_tick = self.determine_exit_tick(&req, &pos).await;

        // Write-time arbitration: state and priority are re-checked under
        // the same lock as the stamp, so a concurrent stronger close that
        // landed while we awaited the exit price wins here.
        if !self.ledger.mark_closing(&key, req.trigger, req.cause) {
            debug!(key = %key, trigger = req.trigger.as_str(), "close lost write-time arbitration");
            return false;
        }

        let tx_hash = req.tx_hash.clone().unwrap_or_else(|| {
            format!("{}_{}_{}", req.trigger.as_str(), req.market_id, now_ms)
        });
        let reason = format!("{}|{}", req.trigger.as_str(), req.cause.as_str());
        let fill = TradeFill {
            market_id: pos.market_id.clone(),
            market_name: pos.market_name.clone(),
            slug: pos.slug.clone(),
            side: pos.side,
            outcome_label: pos.outcome_label.clone(),
            signed_shares: -pos.size,
            tick: exit_tick,
            tx_hash,
            reason: reason.clone(),
            source_tick: req.force_tick,
            latency_ms: None,
            token_id: pos.token_id.clone(),
            market_type: pos.market_type,
        };

        if !self.ledger.apply_trade(fill) {
            warn!(key = %key, "close commit refused; reverting to OPEN");
            self.ledger.revert_close(&key);
            return false;
        }

        let pnl = pos.size * (from_tick(exit_tick) - from_tick(pos.entry_tick));
        info!(
            market = %pos.market_id,
            outcome = %pos.outcome_label,
            exit_tick,
            pnl,
            trigger = req.trigger.as_str(),
            "position closed"
        );
        self.audit.log(
            AuditCategory::Close,
            &format!(
                "closed {} {} {:.2} shares @ {:.3} ({})",
                pos.market_name,
                pos.outcome_label,
                pos.size,
                from_tick(exit_tick),
                reason
            ),
        );
        if req.trigger != CloseTrigger::MarketResolution {
            self.audit.log_trade(&TradeCsvRow {
                profile_address: self.config.profile_address.clone(),
                market_question: pos.market_name.clone(),
                side: "SELL".into(),
                size: pos.size,
                price: from_tick(exit_tick),
                intent: reason,
            });
        }

        self.refresh_subscriptions();
        true
    }

    /// Exit-tick rule: forced price first, the resolution payoff second,
    /// live book third, last mark as the final fallback.
    async fn determine_exit_tick(&self, req: &CloseRequest, pos: &crate::models::Position) -> Tick {
        if let Some(forced) = req.force_tick {
            return clamp_tick(forced);
        }

        if req.trigger == CloseTrigger::MarketResolution {
            let won = matches!(
                (req.cause, pos.side),
                (CloseCause::WinnerYes, Side::Yes) | (CloseCause::WinnerNo, Side::No)
            );
            return if won { MAX_TICK } else { MIN_TICK };
        }

        match self.venue.live_price(&pos.market_id).await {
            Some(price) => match pos.side {
                Side::Yes => clamp_tick(price.best_bid),
                Side::No => clamp_signed(1000 - price.best_ask as i32),
            },
            None => {
                debug!(market = %pos.market_id, "live price unavailable, using last mark");
                clamp_tick(pos.current_tick)
            }
        }
    }

    /// Close every open position on user request.
    pub async fn close_all(&self) -> usize {
        let positions = self.ledger.positions();
        let mut closed = 0usize;
        for pos in positions.values() {
            let ok = self
                .close_position(CloseRequest {
                    market_id: pos.market_id.clone(),
                    side: pos.side,
                    trigger: CloseTrigger::UserAction,
                    cause: CloseCause::CloseAll,
                    force_tick: None,
                    token_id: pos.token_id.clone(),
                    outcome_label: Some(pos.outcome_label.clone()),
                    tx_hash: None,
                })
                .await;
            if ok {
                closed += 1;
            }
        }
        self.audit.log(
            AuditCategory::Close,
            &format!("close-all: {closed}/{} positions closed", positions.len()),
        );
        closed
    }

    /// Close one position on user request.
    pub async fn manual_close(
        &self,
        market_id: &str,
        side: Side,
        token_id: Option<String>,
        outcome_label: Option<String>,
    ) -> bool {
        self.close_position(CloseRequest {
            market_id: market_id.to_string(),
            side,
            trigger: CloseTrigger::UserAction,
            cause: CloseCause::ManualClose,
            force_tick: None,
            token_id,
            outcome_label,
            tx_hash: None,
        })
        .await
    }
}
