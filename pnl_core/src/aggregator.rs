use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::{MatchedTrade, TokenMatchOutcome};

/// Thresholds for flagging pass-through routing tokens.
///
/// Stablecoins and wrapped assets used as swap intermediaries show up as
/// rapid-fire trades with near-zero realized PnL. They are real events but
/// meaningless as trading positions, so they are flagged and excluded from
/// portfolio totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Average hold time at or below this is considered a pass-through hold.
    pub short_hold_seconds: i64,
    /// Absolute realized PnL strictly below this counts as near-zero.
    #[serde(with = "rust_decimal::serde::str")]
    pub near_zero_pnl_usd: Decimal,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            short_hold_seconds: 6,
            near_zero_pnl_usd: Decimal::new(1, 2), // $0.01
        }
    }
}

/// Per-token PnL rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPnLResult {
    pub token_address: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub realized_pnl_usd: Decimal,
    /// Profit from sells with no tracked cost basis, reported separately so
    /// it cannot masquerade as trading skill.
    #[serde(with = "rust_decimal::serde::str")]
    pub phantom_pnl_usd: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub unrealized_pnl_usd: Option<Decimal>,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub avg_hold_time_seconds: f64,
    #[serde(default)]
    pub min_hold_time_seconds: i64,
    #[serde(default)]
    pub max_hold_time_seconds: i64,
    #[serde(default)]
    pub longest_win_streak: u32,
    #[serde(default)]
    pub longest_loss_streak: u32,
    #[serde(default)]
    pub current_win_streak: u32,
    #[serde(default)]
    pub current_loss_streak: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_bought: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_sold: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub remaining_quantity: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub remaining_avg_cost_usd: Option<Decimal>,
    /// Flagged as a routing intermediary; retained for transparency but
    /// excluded from portfolio totals and streaks.
    #[serde(default)]
    pub is_intermediary: bool,
}

/// Wallet-level rollup across all tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioPnLResult {
    pub wallet_address: String,
    pub token_results: Vec<TokenPnLResult>,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_realized_pnl_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_phantom_pnl_usd: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub total_unrealized_pnl_usd: Option<Decimal>,
    pub total_trades: usize,
    pub overall_win_rate: f64,
    #[serde(default)]
    pub longest_win_streak: u32,
    #[serde(default)]
    pub longest_loss_streak: u32,
    #[serde(default)]
    pub current_win_streak: u32,
    #[serde(default)]
    pub current_loss_streak: u32,
    /// All tokens in the report, intermediaries included.
    pub tokens_analyzed: usize,
    /// Total financial events consumed across every token.
    pub events_processed: usize,
    pub intermediary_token_count: usize,
    pub generated_at: DateTime<Utc>,
}

/// Rolls token match outcomes up into a portfolio report, applying the
/// intermediary filter along the way.
pub struct PortfolioAggregator {
    filter: FilterConfig,
}

impl PortfolioAggregator {
    pub fn new(filter: FilterConfig) -> Self {
        Self { filter }
    }

    /// Aggregate one wallet's outcomes. `current_prices` maps token address
    /// to a spot USD price; tokens without one simply report no unrealized
    /// PnL.
    pub fn aggregate(
        &self,
        wallet_address: &str,
        outcomes: Vec<TokenMatchOutcome>,
        current_prices: &HashMap<String, Decimal>,
    ) -> PortfolioPnLResult {
        let mut token_results = Vec::with_capacity(outcomes.len());
        let mut portfolio_trades: Vec<&MatchedTrade> = Vec::new();
        let mut counted_outcomes: Vec<&TokenMatchOutcome> = Vec::new();

        for outcome in &outcomes {
            let result = self.token_result(outcome, current_prices);
            if result.is_intermediary {
                debug!(
                    "Token {} flagged as routing intermediary (avg hold {:.1}s, pnl ${})",
                    result.token_address, result.avg_hold_time_seconds, result.realized_pnl_usd
                );
            } else {
                counted_outcomes.push(outcome);
            }
            token_results.push(result);
        }

        for outcome in &counted_outcomes {
            portfolio_trades.extend(outcome.matched_trades.iter());
        }
        portfolio_trades.sort_by_key(|t| t.sell_event.timestamp);

        let counted: Vec<&TokenPnLResult> = token_results
            .iter()
            .filter(|r| !r.is_intermediary)
            .collect();

        let total_realized_pnl_usd = counted.iter().map(|r| r.realized_pnl_usd).sum();
        let total_phantom_pnl_usd = counted.iter().map(|r| r.phantom_pnl_usd).sum();
        let unrealized: Vec<Decimal> = counted
            .iter()
            .filter_map(|r| r.unrealized_pnl_usd)
            .collect();
        let total_unrealized_pnl_usd = if unrealized.is_empty() {
            None
        } else {
            Some(unrealized.into_iter().sum())
        };

        let total_trades: usize = counted.iter().map(|r| r.trade_count).sum();
        let winning: usize = counted.iter().map(|r| r.winning_trades).sum();
        let overall_win_rate = if total_trades > 0 {
            winning as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let portfolio_streaks = streaks(portfolio_trades.iter().map(|t| t.realized_pnl_usd));

        let tokens_analyzed = token_results.len();
        let events_processed = outcomes.iter().map(|o| o.events_processed).sum();
        let intermediary_token_count = tokens_analyzed - counted.len();

        info!(
            "Wallet {}: {} tokens ({} intermediaries), {} trades, realized ${}",
            wallet_address,
            token_results.len(),
            intermediary_token_count,
            total_trades,
            total_realized_pnl_usd
        );

        PortfolioPnLResult {
            wallet_address: wallet_address.to_string(),
            token_results,
            total_realized_pnl_usd,
            total_phantom_pnl_usd,
            total_unrealized_pnl_usd,
            total_trades,
            overall_win_rate,
            longest_win_streak: portfolio_streaks.longest_win,
            longest_loss_streak: portfolio_streaks.longest_loss,
            current_win_streak: portfolio_streaks.current_win,
            current_loss_streak: portfolio_streaks.current_loss,
            tokens_analyzed,
            events_processed,
            intermediary_token_count,
            generated_at: Utc::now(),
        }
    }

    fn token_result(
        &self,
        outcome: &TokenMatchOutcome,
        current_prices: &HashMap<String, Decimal>,
    ) -> TokenPnLResult {
        let realized_pnl_usd: Decimal = outcome
            .matched_trades
            .iter()
            .map(|t| t.realized_pnl_usd)
            .sum();
        let phantom_pnl_usd: Decimal = outcome
            .unmatched_sells
            .iter()
            .map(|u| u.phantom_pnl_usd)
            .sum();

        let trade_count = outcome.matched_trades.len();
        let winning_trades = outcome
            .matched_trades
            .iter()
            .filter(|t| t.realized_pnl_usd > Decimal::ZERO)
            .count();
        let losing_trades = outcome
            .matched_trades
            .iter()
            .filter(|t| t.realized_pnl_usd < Decimal::ZERO)
            .count();

        let avg_hold_time_seconds = if trade_count > 0 {
            outcome
                .matched_trades
                .iter()
                .map(|t| t.hold_time_seconds as f64)
                .sum::<f64>()
                / trade_count as f64
        } else {
            0.0
        };
        let min_hold_time_seconds = outcome
            .matched_trades
            .iter()
            .map(|t| t.hold_time_seconds)
            .min()
            .unwrap_or(0);
        let max_hold_time_seconds = outcome
            .matched_trades
            .iter()
            .map(|t| t.hold_time_seconds)
            .max()
            .unwrap_or(0);

        let token_streaks = streaks(outcome.matched_trades.iter().map(|t| t.realized_pnl_usd));

        let unrealized_pnl_usd = outcome.remaining_position.as_ref().and_then(|position| {
            current_prices
                .get(&outcome.token_address)
                .map(|price| position.quantity * (*price - position.weighted_avg_cost_usd))
        });

        let is_intermediary = trade_count > 0
            && avg_hold_time_seconds <= self.filter.short_hold_seconds as f64
            && realized_pnl_usd.abs() < self.filter.near_zero_pnl_usd;

        TokenPnLResult {
            token_address: outcome.token_address.clone(),
            realized_pnl_usd,
            phantom_pnl_usd,
            unrealized_pnl_usd,
            trade_count,
            winning_trades,
            losing_trades,
            avg_hold_time_seconds,
            min_hold_time_seconds,
            max_hold_time_seconds,
            longest_win_streak: token_streaks.longest_win,
            longest_loss_streak: token_streaks.longest_loss,
            current_win_streak: token_streaks.current_win,
            current_loss_streak: token_streaks.current_loss,
            total_bought: outcome.total_bought,
            total_sold: outcome.total_sold,
            remaining_quantity: outcome.remaining_position.as_ref().map(|p| p.quantity),
            remaining_avg_cost_usd: outcome
                .remaining_position
                .as_ref()
                .map(|p| p.weighted_avg_cost_usd),
            is_intermediary,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct StreakStats {
    longest_win: u32,
    longest_loss: u32,
    current_win: u32,
    current_loss: u32,
}

/// Win and loss streaks over a chronological PnL sequence, both the longest
/// seen and the run still open at the end. A break-even trade neither
/// extends nor resets the running streak.
fn streaks(pnls: impl Iterator<Item = Decimal>) -> StreakStats {
    let mut stats = StreakStats::default();

    for pnl in pnls {
        if pnl > Decimal::ZERO {
            stats.current_win += 1;
            stats.current_loss = 0;
            stats.longest_win = stats.longest_win.max(stats.current_win);
        } else if pnl < Decimal::ZERO {
            stats.current_loss += 1;
            stats.current_win = 0;
            stats.longest_loss = stats.longest_loss.max(stats.current_loss);
        }
        // zero: streak continues untouched
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventDirection, FinancialEvent, MatchedTrade, RemainingPosition};
    use uuid::Uuid;

    fn timestamp(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    fn stub_event(direction: EventDirection, secs: i64) -> FinancialEvent {
        FinancialEvent {
            id: Uuid::new_v4(),
            transaction_hash: format!("tx_{}", secs),
            wallet_address: "test_wallet".to_string(),
            direction,
            token_address: "token".to_string(),
            quantity: Decimal::ONE,
            native_value: Decimal::ONE,
            usd_price_per_token: Decimal::ONE,
            usd_value: Decimal::ONE,
            timestamp: timestamp(secs),
            fee: None,
        }
    }

    fn trade(pnl: i64, hold_seconds: i64, sell_secs: i64) -> MatchedTrade {
        MatchedTrade {
            buy_event: stub_event(EventDirection::Buy, sell_secs - hold_seconds),
            sell_event: stub_event(EventDirection::Sell, sell_secs),
            matched_quantity: Decimal::ONE,
            realized_pnl_usd: Decimal::from(pnl),
            hold_time_seconds: hold_seconds,
        }
    }

    fn outcome(token: &str, trades: Vec<MatchedTrade>) -> TokenMatchOutcome {
        let events_processed = trades.len() * 2;
        TokenMatchOutcome {
            token_address: token.to_string(),
            matched_trades: trades,
            unmatched_sells: vec![],
            remaining_position: None,
            total_bought: Decimal::from(10),
            total_sold: Decimal::from(10),
            events_processed,
        }
    }

    /// Trade with fractional dollar PnL for threshold tests.
    fn cents_trade(cents: i64, hold_seconds: i64, sell_secs: i64) -> MatchedTrade {
        let mut t = trade(0, hold_seconds, sell_secs);
        t.realized_pnl_usd = Decimal::new(cents, 2);
        t
    }

    #[test]
    fn streak_scan_skips_break_even_trades() {
        let pnls = [1, 2, 0, 3, -1, -2, 0, 1]
            .iter()
            .map(|p| Decimal::from(*p));
        let stats = streaks(pnls);
        // win streak runs 1, 2, 3 through the zero; losses run -1, -2
        assert_eq!(stats.longest_win, 3);
        assert_eq!(stats.longest_loss, 2);
        // the final win is the run still open
        assert_eq!(stats.current_win, 1);
        assert_eq!(stats.current_loss, 0);
    }

    #[test]
    fn hold_time_stats_span_min_and_max() {
        let aggregator = PortfolioAggregator::new(FilterConfig::default());

        let mixed = outcome(
            "mixed",
            vec![
                trade(10, 600, 1_000),
                trade(-5, 7_200, 2_000),
                trade(3, 1_800, 3_000),
            ],
        );
        let result = aggregator.aggregate("w", vec![mixed], &HashMap::new());

        let token = &result.token_results[0];
        assert_eq!(token.min_hold_time_seconds, 600);
        assert_eq!(token.max_hold_time_seconds, 7_200);
        assert_eq!(token.avg_hold_time_seconds, 3_200.0);
        // chronological: win, loss, win
        assert_eq!(token.longest_win_streak, 1);
        assert_eq!(token.current_win_streak, 1);
        assert_eq!(token.current_loss_streak, 0);
    }

    #[test]
    fn portfolio_counts_tokens_and_events() {
        let aggregator = PortfolioAggregator::new(FilterConfig {
            short_hold_seconds: 60,
            near_zero_pnl_usd: Decimal::ONE,
        });

        let routing = outcome("routing", vec![cents_trade(5, 5, 1_000)]);
        let real = outcome("real", vec![trade(100, 3_600, 2_000), trade(20, 3_600, 3_000)]);

        let result = aggregator.aggregate("w", vec![routing, real], &HashMap::new());

        // Counters cover every token, intermediaries included.
        assert_eq!(result.tokens_analyzed, 2);
        assert_eq!(result.events_processed, 6);
        assert_eq!(result.intermediary_token_count, 1);
        // Streaks and trades still exclude the intermediary.
        assert_eq!(result.total_trades, 2);
        assert_eq!(result.current_win_streak, 2);
    }

    #[test]
    fn intermediary_flag_requires_both_conditions() {
        let aggregator = PortfolioAggregator::new(FilterConfig {
            short_hold_seconds: 60,
            near_zero_pnl_usd: Decimal::ONE,
        });
        let prices = HashMap::new();

        // Fast flips, near-zero pnl: a routing token.
        let routing = outcome("routing", vec![cents_trade(5, 10, 1_000)]);
        // Fast flips but real profit: a scalper, not an intermediary.
        let scalper = outcome("scalper", vec![trade(50, 10, 2_000)]);
        // Near-zero pnl but held for hours: just a bad trade.
        let slow = outcome("slow", vec![cents_trade(5, 7_200, 3_000)]);

        let result = aggregator.aggregate("w", vec![routing, scalper, slow], &prices);

        let flags: HashMap<&str, bool> = result
            .token_results
            .iter()
            .map(|r| (r.token_address.as_str(), r.is_intermediary))
            .collect();
        assert!(flags["routing"]);
        assert!(!flags["scalper"]);
        assert!(!flags["slow"]);
        assert_eq!(result.intermediary_token_count, 1);
    }

    #[test]
    fn hold_time_exactly_at_threshold_is_filtered() {
        let aggregator = PortfolioAggregator::new(FilterConfig {
            short_hold_seconds: 60,
            near_zero_pnl_usd: Decimal::ONE,
        });
        let prices = HashMap::new();

        let at_threshold = outcome("at", vec![cents_trade(1, 60, 1_000)]);
        let over_threshold = outcome("over", vec![cents_trade(1, 61, 2_000)]);

        let result = aggregator.aggregate("w", vec![at_threshold, over_threshold], &prices);

        assert!(result.token_results[0].is_intermediary);
        assert!(!result.token_results[1].is_intermediary);
    }

    #[test]
    fn intermediaries_are_kept_but_excluded_from_totals() {
        let aggregator = PortfolioAggregator::new(FilterConfig {
            short_hold_seconds: 60,
            near_zero_pnl_usd: Decimal::ONE,
        });
        let prices = HashMap::new();

        let routing = outcome("routing", vec![cents_trade(5, 5, 1_000)]);
        let real = outcome("real", vec![trade(100, 3_600, 2_000)]);

        let result = aggregator.aggregate("w", vec![routing, real], &prices);

        // Both tokens present in the report
        assert_eq!(result.token_results.len(), 2);
        // Totals count only the real position
        assert_eq!(result.total_realized_pnl_usd, Decimal::from(100));
        assert_eq!(result.total_trades, 1);
    }

    #[test]
    fn token_with_no_trades_is_never_an_intermediary() {
        let aggregator = PortfolioAggregator::new(FilterConfig::default());
        let prices = HashMap::new();

        let hold_only = TokenMatchOutcome {
            remaining_position: Some(RemainingPosition {
                token_address: "held".to_string(),
                quantity: Decimal::from(100),
                weighted_avg_cost_usd: Decimal::TWO,
                total_cost_basis_usd: Decimal::from(200),
            }),
            ..outcome("held", vec![])
        };

        let result = aggregator.aggregate("w", vec![hold_only], &prices);
        assert!(!result.token_results[0].is_intermediary);
    }

    #[test]
    fn unrealized_pnl_uses_spot_price_when_available() {
        let aggregator = PortfolioAggregator::new(FilterConfig::default());
        let mut prices = HashMap::new();
        prices.insert("held".to_string(), Decimal::from(5));

        let held = TokenMatchOutcome {
            remaining_position: Some(RemainingPosition {
                token_address: "held".to_string(),
                quantity: Decimal::from(100),
                weighted_avg_cost_usd: Decimal::TWO,
                total_cost_basis_usd: Decimal::from(200),
            }),
            ..outcome("held", vec![])
        };
        let unpriced = TokenMatchOutcome {
            remaining_position: Some(RemainingPosition {
                token_address: "unpriced".to_string(),
                quantity: Decimal::from(10),
                weighted_avg_cost_usd: Decimal::ONE,
                total_cost_basis_usd: Decimal::from(10),
            }),
            ..outcome("unpriced", vec![])
        };

        let result = aggregator.aggregate("w", vec![held, unpriced], &prices);

        // 100 × ($5 − $2)
        assert_eq!(
            result.token_results[0].unrealized_pnl_usd,
            Some(Decimal::from(300))
        );
        assert_eq!(result.token_results[1].unrealized_pnl_usd, None);
        assert_eq!(result.total_unrealized_pnl_usd, Some(Decimal::from(300)));
    }

    #[test]
    fn report_serializes_decimals_as_strings() {
        let aggregator = PortfolioAggregator::new(FilterConfig::default());
        let real = outcome("real", vec![trade(100, 3_600, 2_000)]);

        let result = aggregator.aggregate("w", vec![real], &HashMap::new());
        let json = serde_json::to_value(&result).expect("serialize");

        // Decimal fields travel as strings so precision survives JSON.
        assert_eq!(json["total_realized_pnl_usd"], "100");
        assert_eq!(json["token_results"][0]["realized_pnl_usd"], "100");

        let back: PortfolioPnLResult = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.total_realized_pnl_usd, result.total_realized_pnl_usd);
    }

    #[test]
    fn portfolio_streaks_cross_token_boundaries() {
        let aggregator = PortfolioAggregator::new(FilterConfig::default());
        let prices = HashMap::new();

        // Interleaved sell timestamps: win@1000 (a), win@2000 (b), win@3000 (a)
        let a = outcome("a", vec![trade(10, 3_600, 1_000), trade(10, 3_600, 3_000)]);
        let b = outcome("b", vec![trade(10, 3_600, 2_000), trade(-5, 3_600, 4_000)]);

        let result = aggregator.aggregate("w", vec![a, b], &prices);

        assert_eq!(result.longest_win_streak, 3);
        assert_eq!(result.longest_loss_streak, 1);
        assert_eq!(result.overall_win_rate, 75.0);
    }
}
