pub mod aggregator;
pub mod matcher;
pub mod normalizer;


// Re-export the types callers actually wire together
pub use aggregator::{FilterConfig, PortfolioAggregator, PortfolioPnLResult, TokenPnLResult};
pub use matcher::{FifoMatcher, MatchedTrade, RemainingPosition, TokenMatchOutcome, UnmatchedSell};
pub use normalizer::{group_events_by_token, SwapNormalizer};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PnLError {
    #[error("Price resolution error: {0}")]
    PriceResolution(String),
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
}

pub type Result<T> = std::result::Result<T, PnLError>;

/// Direction of a financial event. Every event has exactly one direction
/// and one token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventDirection {
    Buy,
    Sell,
}

/// Directional financial event produced by the normalizer from a raw swap.
/// Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinancialEvent {
    /// Unique identifier for the event
    pub id: Uuid,

    /// Transaction signature/hash this event was derived from
    pub transaction_hash: String,

    /// Wallet address that performed the swap
    pub wallet_address: String,

    /// Buy or Sell
    pub direction: EventDirection,

    /// Token address (mint)
    pub token_address: String,

    /// Token quantity, always positive
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,

    /// Native-asset-equivalent value of this leg of the swap.
    /// For token-to-token swaps both legs carry the same value.
    #[serde(with = "rust_decimal::serde::str")]
    pub native_value: Decimal,

    /// USD price per token at transaction time
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_price_per_token: Decimal,

    /// USD value (quantity × price)
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_value: Decimal,

    /// Transaction timestamp
    pub timestamp: DateTime<Utc>,

    /// Transaction fee in native units, if known
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub fee: Option<Decimal>,
}

/// Pre-normalization swap as delivered by the transaction-history provider.
/// Transient: consumed immediately by the normalizer, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedSwap {
    /// Token address disposed of by the wallet
    pub token_in: String,

    /// Token address acquired by the wallet
    pub token_out: String,

    #[serde(with = "rust_decimal::serde::str")]
    pub amount_in: Decimal,

    #[serde(with = "rust_decimal::serde::str")]
    pub amount_out: Decimal,

    /// USD price per unit of `token_out`, embedded in the transaction record
    #[serde(with = "rust_decimal::serde::str")]
    pub unit_price_usd: Decimal,

    /// Native-asset/USD quote at the swap's timestamp, when the transaction
    /// record embeds one. Required to normalize token-to-token swaps.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub native_price_usd: Option<Decimal>,

    /// Transaction fee in native units, if known
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub fee: Option<Decimal>,

    pub transaction_hash: String,

    pub timestamp: DateTime<Utc>,
}
