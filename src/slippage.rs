//! Execution-cost gate for replicated trades.
//!
//! Decomposes the expected cost of crossing the book into spread, depth
//! impact, and a fixed delay penalty, then compares the total against an
//! edge-scaled threshold. A blown-out spread rejects outright regardless of
//! edge: there is no price discovery to copy in a dead market.

use serde::Serialize;

use crate::models::TickBook;
use crate::ticks::Tick;

/// Spread ratio above which a market is treated as dead.
pub const MAX_SPREAD_RATIO: f64 = 0.15;
/// Fraction of the expected edge we are willing to give back to costs.
pub const EDGE_TOLERANCE: f64 = 0.4;
/// Bounds for the delay penalty override; out-of-range collapses to default.
pub const MIN_DELAY_PENALTY: f64 = 0.002;
pub const MAX_DELAY_PENALTY: f64 = 0.005;
pub const DEFAULT_DELAY_PENALTY: f64 = 0.003;

/// Decomposed cost estimate and the execute/skip decision.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageEstimate {
    pub spread_ratio: f64,
    pub depth_usd: f64,
    pub impact_ratio: f64,
    pub delay_penalty: f64,
    pub total_slippage: f64,
    pub threshold: f64,
    pub should_execute: bool,
    pub reason: String,
}

/// Validate a delay-penalty override: out-of-range values silently
/// collapse to the default.
pub fn effective_delay_penalty(requested: Option<f64>) -> f64 {
    match requested {
        Some(v) if (MIN_DELAY_PENALTY..=MAX_DELAY_PENALTY).contains(&v) => v,
        _ => DEFAULT_DELAY_PENALTY,
    }
}

/// Estimate the cost of taking `notional_usd` out of `book` and decide
/// whether the copy is worth executing against `expected_edge`.
pub fn estimate(
    best_bid: Tick,
    best_ask: Tick,
    book: &TickBook,
    notional_usd: f64,
    is_buy: bool,
    expected_edge: f64,
    delay_penalty_override: Option<f64>,
) -> SlippageEstimate {
    let mid = (best_bid as f64 + best_ask as f64) / 2.0;
    let spread_ratio = if mid > 0.0 {
        (best_ask as f64 - best_bid as f64) / mid
    } else {
        f64::INFINITY
    };

    let depth_usd = near_touch_depth_usd(book, best_bid, best_ask, is_buy);
    let impact_ratio = if depth_usd > 0.0 {
        notional_usd / depth_usd
    } else {
        f64::INFINITY
    };

    let delay_penalty = effective_delay_penalty(delay_penalty_override);
    let total_slippage = spread_ratio + impact_ratio + delay_penalty;
    let threshold = spread_ratio + EDGE_TOLERANCE * expected_edge.max(0.0);

    if spread_ratio > MAX_SPREAD_RATIO {
        return SlippageEstimate {
            spread_ratio,
            depth_usd,
            impact_ratio,
            delay_penalty,
            total_slippage,
            threshold,
            should_execute: false,
            reason: format!(
                "dead market: spread {:.1}% exceeds {:.0}% cap",
                spread_ratio * 100.0,
                MAX_SPREAD_RATIO * 100.0
            ),
        };
    }

    let should_execute = total_slippage.is_finite() && total_slippage <= threshold;
    let reason = if should_execute {
        format!(
            "total slippage {:.2}% within threshold {:.2}%",
            total_slippage * 100.0,
            threshold * 100.0
        )
    } else if !total_slippage.is_finite() {
        "no depth near the touch".to_string()
    } else {
        format!(
            "total slippage {:.2}% exceeds threshold {:.2}% (impact {:.2}%)",
            total_slippage * 100.0,
            threshold * 100.0,
            impact_ratio * 100.0
        )
    };

    SlippageEstimate {
        spread_ratio,
        depth_usd,
        impact_ratio,
        delay_penalty,
        total_slippage,
        threshold,
        should_execute,
        reason,
    }
}

/// USD depth resting within 1% of the touch on the side we would hit.
fn near_touch_depth_usd(book: &TickBook, best_bid: Tick, best_ask: Tick, is_buy: bool) -> f64 {
    if is_buy {
        let limit = (best_ask as f64 * 1.01).floor() as u32;
        book.asks
            .iter()
            .filter(|l| (l.tick as u32) <= limit)
            .map(|l| l.tick as f64 / 1000.0 * l.size)
            .sum()
    } else {
        let limit = (best_bid as f64 * 0.99).floor() as u32;
        book.bids
            .iter()
            .filter(|l| (l.tick as u32) >= limit)
            .map(|l| l.tick as f64 / 1000.0 * l.size)
            .sum()
    }
}
