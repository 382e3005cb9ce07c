use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::{EventDirection, FinancialEvent};

/// A buy event matched against a sell under FIFO ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchedTrade {
    pub buy_event: FinancialEvent,
    pub sell_event: FinancialEvent,
    /// Quantity covered by this pairing; a single sell can split across
    /// several buy lots and vice versa.
    #[serde(with = "rust_decimal::serde::str")]
    pub matched_quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_pnl_usd: Decimal,
    pub hold_time_seconds: i64,
}

/// A sell (or part of one) with no prior buy to match against.
///
/// The tokens arrived outside the observed swap history (airdrop, transfer
/// in), so the cost basis is assumed zero and the entire sale value is
/// recognized as phantom profit rather than silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedSell {
    pub sell_event: FinancialEvent,
    #[serde(with = "rust_decimal::serde::str")]
    pub unmatched_quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub assumed_unit_cost_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub phantom_pnl_usd: Decimal,
}

/// Buy quantity never sold, valued at the weighted-average cost of the
/// surviving lots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemainingPosition {
    pub token_address: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub weighted_avg_cost_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_cost_basis_usd: Decimal,
}

/// Full matching outcome for one token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMatchOutcome {
    pub token_address: String,
    pub matched_trades: Vec<MatchedTrade>,
    pub unmatched_sells: Vec<UnmatchedSell>,
    pub remaining_position: Option<RemainingPosition>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_bought: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_sold: Decimal,
    /// Number of events consumed for this token.
    #[serde(default)]
    pub events_processed: usize,
}

/// An open buy lot waiting to be consumed by later sells.
struct BuyLot {
    event: FinancialEvent,
    remaining: Decimal,
}

/// FIFO cost-basis matcher. Operates on one token's chronologically ordered
/// event stream at a time; tokens never share lots.
pub struct FifoMatcher;

impl FifoMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Match a token's events. `events` must be sorted chronologically, as
    /// produced by [`crate::group_events_by_token`].
    pub fn match_token(&self, token_address: &str, events: &[FinancialEvent]) -> TokenMatchOutcome {
        let mut lots: VecDeque<BuyLot> = VecDeque::new();
        let mut matched_trades = Vec::new();
        let mut unmatched_sells = Vec::new();
        let mut total_bought = Decimal::ZERO;
        let mut total_sold = Decimal::ZERO;

        for event in events {
            match event.direction {
                EventDirection::Buy => {
                    total_bought += event.quantity;
                    lots.push_back(BuyLot {
                        event: event.clone(),
                        remaining: event.quantity,
                    });
                }
                EventDirection::Sell => {
                    total_sold += event.quantity;
                    self.consume_lots(
                        &mut lots,
                        event,
                        &mut matched_trades,
                        &mut unmatched_sells,
                    );
                }
            }
        }

        let remaining_position = self.remaining_position(token_address, &lots);

        debug!(
            "Token {}: {} matched trades, {} unmatched sells, remaining {}",
            token_address,
            matched_trades.len(),
            unmatched_sells.len(),
            remaining_position
                .as_ref()
                .map(|p| p.quantity)
                .unwrap_or(Decimal::ZERO)
        );

        TokenMatchOutcome {
            token_address: token_address.to_string(),
            matched_trades,
            unmatched_sells,
            remaining_position,
            total_bought,
            total_sold,
            events_processed: events.len(),
        }
    }

    /// Walk the lot queue oldest-first, pairing off as much of the sell as
    /// open lots can cover. Whatever is left becomes an unmatched sell.
    fn consume_lots(
        &self,
        lots: &mut VecDeque<BuyLot>,
        sell: &FinancialEvent,
        matched_trades: &mut Vec<MatchedTrade>,
        unmatched_sells: &mut Vec<UnmatchedSell>,
    ) {
        let mut outstanding = sell.quantity;

        while outstanding > Decimal::ZERO {
            let Some(lot) = lots.front_mut() else {
                break;
            };

            let matched_quantity = outstanding.min(lot.remaining);
            let realized_pnl_usd =
                matched_quantity * (sell.usd_price_per_token - lot.event.usd_price_per_token);
            let hold_time_seconds = (sell.timestamp - lot.event.timestamp).num_seconds();

            matched_trades.push(MatchedTrade {
                buy_event: lot.event.clone(),
                sell_event: sell.clone(),
                matched_quantity,
                realized_pnl_usd,
                hold_time_seconds,
            });

            lot.remaining -= matched_quantity;
            outstanding -= matched_quantity;

            if lot.remaining <= Decimal::ZERO {
                lots.pop_front();
            }
        }

        if outstanding > Decimal::ZERO {
            let phantom_pnl_usd = outstanding * sell.usd_price_per_token;
            warn!(
                "Sell of {} {} in tx {} exceeds tracked buys by {}; assuming zero cost basis",
                sell.quantity, sell.token_address, sell.transaction_hash, outstanding
            );
            unmatched_sells.push(UnmatchedSell {
                sell_event: sell.clone(),
                unmatched_quantity: outstanding,
                assumed_unit_cost_usd: Decimal::ZERO,
                phantom_pnl_usd,
            });
        }
    }

    fn remaining_position(
        &self,
        token_address: &str,
        lots: &VecDeque<BuyLot>,
    ) -> Option<RemainingPosition> {
        let quantity: Decimal = lots.iter().map(|l| l.remaining).sum();
        if quantity <= Decimal::ZERO {
            return None;
        }

        let total_cost_basis_usd: Decimal = lots
            .iter()
            .map(|l| l.remaining * l.event.usd_price_per_token)
            .sum();

        Some(RemainingPosition {
            token_address: token_address.to_string(),
            quantity,
            weighted_avg_cost_usd: total_cost_basis_usd / quantity,
            total_cost_basis_usd,
        })
    }
}

impl Default for FifoMatcher {
    fn default() -> Self {
        Self::new()
    }
}
