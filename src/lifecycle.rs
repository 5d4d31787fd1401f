//! Market-lifecycle classification.
//!
//! Pure and deterministic: given the venue's event container and a target
//! market id, decide whether the market is single or multi-outcome, whether
//! it is active, pending resolution, or closed, and once closed which
//! outcome won.
//!
//! Multi-outcome pending state comes from `acceptingOrders`, never from the
//! child's end date: the venue flips children off at different times.

use serde::Serialize;

use crate::models::{MarketType, Side};
use crate::venue::types::{GammaMarket, MarketContainer};

/// Threshold above which an outcome price declares the winner.
const WINNER_PRICE: f64 = 0.99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarketStatus {
    Active,
    PendingResolution,
    Closed,
}

/// Winner expressed against the legacy binary YES/NO model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WinnerSide {
    YesWon,
    NoWon,
}

/// Resolution details extracted from a closed market.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionResult {
    pub winning_index: Option<usize>,
    pub winning_label: Option<String>,
    pub winner: Option<WinnerSide>,
    /// For a multi-outcome child: which leg won *within that child*.
    pub winning_side: Option<Side>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub market_type: MarketType,
    pub status: MarketStatus,
    pub result: Option<ResolutionResult>,
}

impl Classification {
    fn active(market_type: MarketType) -> Self {
        Self {
            market_type,
            status: MarketStatus::Active,
            result: None,
        }
    }
}

/// Classify `target_market_id` within its event container.
pub fn classify(container: &MarketContainer, target_market_id: &str, now_ms: i64) -> Classification {
    let market_type = if container.markets.len() > 1 {
        MarketType::Multi
    } else {
        MarketType::Single
    };

    let child = match market_type {
        MarketType::Single => container.markets.first(),
        MarketType::Multi => container
            .markets
            .iter()
            .find(|m| m.matches(target_market_id)),
    };

    let Some(child) = child else {
        // Unmatched target in a multi container: nothing to say yet.
        return Classification::active(market_type);
    };

    let status = match market_type {
        MarketType::Single => {
            if child.is_resolved() {
                MarketStatus::Closed
            } else if child
                .end_date_ms()
                .map(|end| now_ms >= end)
                .unwrap_or(false)
            {
                MarketStatus::PendingResolution
            } else {
                MarketStatus::Active
            }
        }
        MarketType::Multi => {
            if child.is_resolved() {
                MarketStatus::Closed
            } else if child.accepting_orders == Some(false) {
                MarketStatus::PendingResolution
            } else {
                MarketStatus::Active
            }
        }
    };

    let result = if status == MarketStatus::Closed {
        Some(extract_result(child, market_type))
    } else {
        None
    };

    Classification {
        market_type,
        status,
        result,
    }
}

/// Winner extraction: the outcome whose price pinned at (or above) 0.99.
fn extract_result(child: &GammaMarket, market_type: MarketType) -> ResolutionResult {
    let winning_index = child
        .outcome_prices
        .iter()
        .position(|p| *p >= WINNER_PRICE);
    let winning_label = winning_index.and_then(|i| child.outcomes.get(i).cloned());

    let winner = winning_label.as_deref().and_then(label_to_winner);
    let winning_side = match market_type {
        MarketType::Multi => winner.map(|w| match w {
            WinnerSide::YesWon => Side::Yes,
            WinnerSide::NoWon => Side::No,
        }),
        MarketType::Single => None,
    };

    ResolutionResult {
        winning_index,
        winning_label,
        winner,
        winning_side,
    }
}

fn label_to_winner(label: &str) -> Option<WinnerSide> {
    let upper = label.to_uppercase();
    if upper.contains("YES") || upper.contains("UP") {
        Some(WinnerSide::YesWon)
    } else if upper.contains("NO") || upper.contains("DOWN") {
        Some(WinnerSide::NoWon)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(uma: Option<&str>, end_date: Option<&str>, prices: Vec<f64>) -> MarketContainer {
        MarketContainer {
            markets: vec![GammaMarket {
                condition_id: Some("0xabc".into()),
                outcomes: vec!["No".into(), "Yes".into()],
                clob_token_ids: vec!["t0".into(), "t1".into()],
                outcome_prices: prices,
                uma_resolution_status: uma.map(|s| s.to_string()),
                end_date: end_date.map(|s| s.to_string()),
                ..Default::default()
            }],
        }
    }

    #[test]
    fn single_active_before_end() {
        let c = single(None, Some("2100-01-01T00:00:00Z"), vec![0.4, 0.6]);
        let out = classify(&c, "0xabc", 1_700_000_000_000);
        assert_eq!(out.market_type, MarketType::Single);
        assert_eq!(out.status, MarketStatus::Active);
        assert!(out.result.is_none());
    }

    #[test]
    fn single_pending_after_end() {
        let c = single(None, Some("2020-01-01T00:00:00Z"), vec![0.4, 0.6]);
        let out = classify(&c, "0xabc", 1_700_000_000_000);
        assert_eq!(out.status, MarketStatus::PendingResolution);
    }

    #[test]
    fn single_closed_with_yes_winner() {
        let c = single(Some("resolved"), None, vec![0.0, 1.0]);
        let out = classify(&c, "0xabc", 1_700_000_000_000);
        assert_eq!(out.status, MarketStatus::Closed);
        let r = out.result.unwrap();
        assert_eq!(r.winning_index, Some(1));
        assert_eq!(r.winning_label.as_deref(), Some("Yes"));
        assert_eq!(r.winner, Some(WinnerSide::YesWon));
        assert!(r.winning_side.is_none());
    }

    fn multi(accepting: Option<bool>, uma: Option<&str>, prices: Vec<f64>) -> MarketContainer {
        MarketContainer {
            markets: vec![
                GammaMarket {
                    condition_id: Some("0xother".into()),
                    outcomes: vec!["Yes".into(), "No".into()],
                    accepting_orders: Some(true),
                    ..Default::default()
                },
                GammaMarket {
                    condition_id: Some("0xtarget".into()),
                    outcomes: vec!["Yes".into(), "No".into()],
                    clob_token_ids: vec!["a".into(), "b".into()],
                    outcome_prices: prices,
                    accepting_orders: accepting,
                    uma_resolution_status: uma.map(|s| s.to_string()),
                    // End date must be ignored for multi pending state.
                    end_date: Some("2020-01-01T00:00:00Z".into()),
                    ..Default::default()
                },
            ],
        }
    }

    #[test]
    fn multi_pending_from_accepting_orders_not_end_date() {
        let active = multi(Some(true), None, vec![0.5, 0.5]);
        let out = classify(&active, "0xtarget", 1_700_000_000_000);
        assert_eq!(out.market_type, MarketType::Multi);
        assert_eq!(out.status, MarketStatus::Active);

        let pending = multi(Some(false), None, vec![0.5, 0.5]);
        let out = classify(&pending, "0xtarget", 1_700_000_000_000);
        assert_eq!(out.status, MarketStatus::PendingResolution);
    }

    #[test]
    fn multi_closed_reports_winning_side_within_child() {
        let c = multi(Some(false), Some("resolved"), vec![0.0, 1.0]);
        let out = classify(&c, "0xtarget", 1_700_000_000_000);
        assert_eq!(out.status, MarketStatus::Closed);
        let r = out.result.unwrap();
        assert_eq!(r.winner, Some(WinnerSide::NoWon));
        assert_eq!(r.winning_side, Some(Side::No));
    }

    #[test]
    fn multi_unmatched_target_is_active_no_result() {
        let c = multi(Some(false), Some("resolved"), vec![0.0, 1.0]);
        let out = classify(&c, "0xmissing", 1_700_000_000_000);
        assert_eq!(out.status, MarketStatus::Active);
        assert!(out.result.is_none());
    }

    #[test]
    fn up_down_labels_map_to_sides() {
        assert_eq!(label_to_winner("Up"), Some(WinnerSide::YesWon));
        assert_eq!(label_to_winner("Down"), Some(WinnerSide::NoWon));
        assert_eq!(label_to_winner("Arsenal"), None);
    }
}
