use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{EventDirection, FinancialEvent, PnLError, ProcessedSwap, Result};

/// Converts raw swaps into directional financial events.
///
/// A swap touching the native asset yields one event; a token-to-token swap
/// yields a sell of `token_in` and a buy of `token_out` that carry the same
/// native-asset-equivalent value, because both legs represent the same
/// underlying value transfer.
pub struct SwapNormalizer {
    wallet_address: String,
    native_token: String,
}

impl SwapNormalizer {
    pub fn new(wallet_address: String, native_token: String) -> Self {
        Self {
            wallet_address,
            native_token,
        }
    }

    /// Normalize a batch of swaps in order. Any unresolvable swap fails the
    /// whole wallet; partial event streams would corrupt FIFO matching.
    pub fn normalize_all(&self, swaps: &[ProcessedSwap]) -> Result<Vec<FinancialEvent>> {
        let mut events = Vec::with_capacity(swaps.len() * 2);

        for swap in swaps {
            trace!(
                "Normalizing swap {} ({} -> {})",
                swap.transaction_hash,
                swap.token_in,
                swap.token_out
            );
            events.extend(self.normalize(swap)?);
        }

        debug!(
            "Normalized {} swaps into {} events for wallet {}",
            swaps.len(),
            events.len(),
            self.wallet_address
        );

        Ok(events)
    }

    /// Normalize one swap into one or two financial events.
    pub fn normalize(&self, swap: &ProcessedSwap) -> Result<Vec<FinancialEvent>> {
        if swap.amount_in <= Decimal::ZERO || swap.amount_out <= Decimal::ZERO {
            return Err(PnLError::MalformedEvent(format!(
                "Non-positive swap amounts in tx {}: in={}, out={}",
                swap.transaction_hash, swap.amount_in, swap.amount_out
            )));
        }

        let native_in = swap.token_in == self.native_token;
        let native_out = swap.token_out == self.native_token;

        if native_in && native_out {
            return Err(PnLError::MalformedEvent(format!(
                "Native-to-native swap in tx {}",
                swap.transaction_hash
            )));
        }

        if native_in {
            // Buying token_out with the native asset: the native value is the
            // amount actually spent, no price resolution needed.
            let price = self.resolve_out_price(swap)?;
            return Ok(vec![self.event(
                swap,
                EventDirection::Buy,
                &swap.token_out,
                swap.amount_out,
                swap.amount_in,
                price,
                swap.fee,
            )]);
        }

        if native_out {
            // Selling token_in for the native asset. The embedded unit price
            // quotes token_out, which here is the native asset itself.
            let native_price = self.native_price(swap)?;
            let usd_value = swap.amount_out * native_price;
            let unit_price = usd_value / swap.amount_in;
            return Ok(vec![self.event(
                swap,
                EventDirection::Sell,
                &swap.token_in,
                swap.amount_in,
                swap.amount_out,
                unit_price,
                swap.fee,
            )]);
        }

        // Token-to-token: economically a sell of token_in for native followed
        // by a buy of token_out with that native. Value the swap in USD from
        // the known token_out price, then convert to native units with the
        // transaction's embedded native quote. The raw USD value must never be
        // used as a native quantity.
        let out_price = self.resolve_out_price(swap)?;
        let usd_value = swap.amount_out * out_price;

        let native_price = swap.native_price_usd.ok_or_else(|| {
            PnLError::PriceResolution(format!(
                "No native-asset price embedded in token-to-token tx {}",
                swap.transaction_hash
            ))
        })?;
        if native_price <= Decimal::ZERO {
            return Err(PnLError::PriceResolution(format!(
                "Unusable native-asset price {} in tx {}",
                native_price, swap.transaction_hash
            )));
        }

        let native_equivalent = usd_value / native_price;

        let sell = self.event(
            swap,
            EventDirection::Sell,
            &swap.token_in,
            swap.amount_in,
            native_equivalent,
            usd_value / swap.amount_in,
            swap.fee,
        );
        // Fee rides on the sell leg only; one underlying transaction, one fee.
        let buy = self.event(
            swap,
            EventDirection::Buy,
            &swap.token_out,
            swap.amount_out,
            native_equivalent,
            out_price,
            None,
        );

        debug!(
            "Token-to-token tx {}: USD value {} -> native equivalent {}",
            swap.transaction_hash, usd_value, native_equivalent
        );

        Ok(vec![sell, buy])
    }

    /// USD price per unit of `token_out`, preferring the embedded unit price
    /// and falling back to deriving it from the native leg.
    fn resolve_out_price(&self, swap: &ProcessedSwap) -> Result<Decimal> {
        if swap.unit_price_usd > Decimal::ZERO {
            return Ok(swap.unit_price_usd);
        }

        if swap.token_in == self.native_token {
            if let Some(native_price) = swap.native_price_usd {
                if native_price > Decimal::ZERO {
                    return Ok(swap.amount_in * native_price / swap.amount_out);
                }
            }
        }

        Err(PnLError::PriceResolution(format!(
            "No usable USD price for token {} in tx {}",
            swap.token_out, swap.transaction_hash
        )))
    }

    /// Native-asset/USD quote for a swap whose outgoing side is native.
    fn native_price(&self, swap: &ProcessedSwap) -> Result<Decimal> {
        let price = swap.native_price_usd.unwrap_or(swap.unit_price_usd);
        if price > Decimal::ZERO {
            Ok(price)
        } else {
            Err(PnLError::PriceResolution(format!(
                "No usable native-asset price in tx {}",
                swap.transaction_hash
            )))
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn event(
        &self,
        swap: &ProcessedSwap,
        direction: EventDirection,
        token_address: &str,
        quantity: Decimal,
        native_value: Decimal,
        usd_price_per_token: Decimal,
        fee: Option<Decimal>,
    ) -> FinancialEvent {
        FinancialEvent {
            id: Uuid::new_v4(),
            transaction_hash: swap.transaction_hash.clone(),
            wallet_address: self.wallet_address.clone(),
            direction,
            token_address: token_address.to_string(),
            quantity,
            native_value,
            usd_price_per_token,
            usd_value: quantity * usd_price_per_token,
            timestamp: swap.timestamp,
            fee,
        }
    }
}

/// Group events by token address, each group sorted chronologically with the
/// transaction hash as a stable tiebreak. Handoff interface to the matcher.
pub fn group_events_by_token(
    events: Vec<FinancialEvent>,
) -> HashMap<String, Vec<FinancialEvent>> {
    let mut grouped: HashMap<String, Vec<FinancialEvent>> = HashMap::new();

    for event in events {
        grouped
            .entry(event.token_address.clone())
            .or_default()
            .push(event);
    }

    for events in grouped.values_mut() {
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.transaction_hash.cmp(&b.transaction_hash))
        });
    }

    debug!("Grouped events into {} token groups", grouped.len());

    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn timestamp(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    const NATIVE: &str = "So11111111111111111111111111111111111111112";
    const USDC: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const RENDER: &str = "rndrizKT3MK1iimdxRdWabcF7Zg7AR5T4nud4EkHBof";

    fn normalizer() -> SwapNormalizer {
        SwapNormalizer::new("test_wallet".to_string(), NATIVE.to_string())
    }

    fn token_to_token_swap() -> ProcessedSwap {
        // 1000 USDC -> 50 RENDER @ $20, native quoted at $150
        ProcessedSwap {
            token_in: USDC.to_string(),
            token_out: RENDER.to_string(),
            amount_in: Decimal::from(1000),
            amount_out: Decimal::from(50),
            unit_price_usd: Decimal::from(20),
            native_price_usd: Some(Decimal::from(150)),
            fee: None,
            transaction_hash: "tx_token_to_token".to_string(),
            timestamp: timestamp(1_751_414_738),
        }
    }

    #[test]
    fn native_in_emits_single_buy() {
        let swap = ProcessedSwap {
            token_in: NATIVE.to_string(),
            token_out: USDC.to_string(),
            amount_in: Decimal::new(667, 2), // 6.67 native
            amount_out: Decimal::from(1000),
            unit_price_usd: Decimal::ONE,
            native_price_usd: Some(Decimal::from(150)),
            fee: None,
            transaction_hash: "tx_buy".to_string(),
            timestamp: timestamp(1_751_414_700),
        };

        let events = normalizer().normalize(&swap).unwrap();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.direction, EventDirection::Buy);
        assert_eq!(event.token_address, USDC);
        assert_eq!(event.quantity, Decimal::from(1000));
        assert_eq!(event.native_value, Decimal::new(667, 2));
        assert_eq!(event.usd_price_per_token, Decimal::ONE);
    }

    #[test]
    fn native_out_emits_single_sell() {
        let swap = ProcessedSwap {
            token_in: USDC.to_string(),
            token_out: NATIVE.to_string(),
            amount_in: Decimal::from(300),
            amount_out: Decimal::from(2),
            unit_price_usd: Decimal::from(150),
            native_price_usd: Some(Decimal::from(150)),
            fee: None,
            transaction_hash: "tx_sell".to_string(),
            timestamp: timestamp(1_751_414_800),
        };

        let events = normalizer().normalize(&swap).unwrap();
        assert_eq!(events.len(), 1);

        let event = &events[0];
        assert_eq!(event.direction, EventDirection::Sell);
        assert_eq!(event.token_address, USDC);
        assert_eq!(event.native_value, Decimal::from(2));
        // 2 native @ $150 for 300 USDC -> $1 per USDC
        assert_eq!(event.usd_price_per_token, Decimal::ONE);
    }

    #[test]
    fn token_to_token_uses_native_equivalent_not_usd() {
        let events = normalizer().normalize(&token_to_token_swap()).unwrap();
        assert_eq!(events.len(), 2);

        // USD value = 50 × $20 = $1000; native equivalent = 1000 / 150 ≈ 6.667
        let expected = Decimal::from(1000) / Decimal::from(150);
        assert_eq!(events[0].native_value, expected);

        // NOT the raw USD value assigned as a native quantity
        assert!(events[0].native_value < Decimal::from(100));
    }

    #[test]
    fn token_to_token_legs_are_symmetric() {
        let events = normalizer().normalize(&token_to_token_swap()).unwrap();

        let sell = &events[0];
        let buy = &events[1];
        assert_eq!(sell.direction, EventDirection::Sell);
        assert_eq!(buy.direction, EventDirection::Buy);
        assert_eq!(sell.token_address, USDC);
        assert_eq!(buy.token_address, RENDER);
        assert_eq!(sell.native_value, buy.native_value);
        assert_eq!(sell.quantity, Decimal::from(1000));
        assert_eq!(buy.quantity, Decimal::from(50));
        // Both legs value the same $1000 transfer
        assert_eq!(sell.usd_value, buy.usd_value);
    }

    #[test]
    fn token_to_token_without_native_quote_fails() {
        let mut swap = token_to_token_swap();
        swap.native_price_usd = None;

        let err = normalizer().normalize(&swap).unwrap_err();
        assert!(matches!(err, PnLError::PriceResolution(_)));
    }

    #[test]
    fn non_positive_amounts_are_malformed() {
        let mut swap = token_to_token_swap();
        swap.amount_out = Decimal::ZERO;

        let err = normalizer().normalize(&swap).unwrap_err();
        assert!(matches!(err, PnLError::MalformedEvent(_)));
    }

    #[test]
    fn normalize_all_propagates_first_failure() {
        let mut bad = token_to_token_swap();
        bad.native_price_usd = None;

        let result = normalizer().normalize_all(&[token_to_token_swap(), bad]);
        assert!(result.is_err());
    }

    #[test]
    fn grouping_sorts_each_token_chronologically() {
        let normalizer = normalizer();
        let mut swaps = vec![token_to_token_swap(), token_to_token_swap()];
        swaps[1].timestamp = timestamp(1_751_414_000);
        swaps[1].transaction_hash = "tx_earlier".to_string();

        let events = normalizer.normalize_all(&swaps).unwrap();
        let grouped = group_events_by_token(events);

        assert_eq!(grouped.len(), 2);
        let usdc_events = &grouped[USDC];
        assert_eq!(usdc_events.len(), 2);
        assert!(usdc_events[0].timestamp <= usdc_events[1].timestamp);
        assert_eq!(usdc_events[0].transaction_hash, "tx_earlier");
    }
}
