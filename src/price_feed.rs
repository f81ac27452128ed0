// Price feeds.
//
// The engine is agnostic to where prices come from. Two capabilities cover it:
// an execution oracle returning (price, confidence, exponent, publish time)
// per feed id, and an independent reference feed used to bound the oracle.
// In-memory implementations back the test suites and host simulations; real
// hosts adapt Pyth/Chainlink/API3 behind the same traits.

use crate::market::Market;
use crate::types::{Amount, Bps, Price, Timestamp};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// A raw oracle quote: integer mantissa plus decimal exponent, Pyth style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleQuote {
    pub price: i64,
    pub conf: u64,
    pub expo: i32,
    pub publish_time: Timestamp,
}

impl OracleQuote {
    pub fn new(price: i64, conf: u64, expo: i32, publish_time: Timestamp) -> Self {
        Self {
            price,
            conf,
            expo,
            publish_time,
        }
    }

    /// Mantissa + exponent to a decimal price. Non-positive prices and
    /// positive exponents are rejected.
    pub fn normalized_price(&self) -> Option<Price> {
        if self.price <= 0 || self.expo > 0 {
            return None;
        }
        Price::new(Decimal::new(self.price, (-self.expo) as u32))
    }

    pub fn normalized_conf(&self) -> Decimal {
        if self.expo > 0 {
            return Decimal::ZERO;
        }
        Decimal::new(self.conf as i64, (-self.expo) as u32)
    }
}

/// Execution oracle capability.
pub trait PriceFeed {
    /// Latest quote with no freshness guarantee; callers check staleness.
    fn get_unsafe(&self, feed_id: u64) -> Option<OracleQuote>;

    /// Apply a keeper-relayed update payload, returning the fee it consumed.
    fn apply_update(&mut self, payload: &[u8]) -> Result<Amount, FeedError>;
}

/// Secondary bounding feed. `None` means no reference available.
pub trait ReferencePriceFeed {
    fn get(&self, feed_id: u64) -> Option<Price>;

    /// Host-driven push, the reference analog of an oracle update.
    fn push(&mut self, feed_id: u64, price: Option<Price>);
}

// 6.1: confidence-bounded oracle read. when the quoted confidence interval is
// wide relative to price, execution prices are pushed against the taker:
// maximise for longs entering / shorts being liquidated, minimise otherwise.
pub fn bounded_oracle_price(market: &Market, quote: &OracleQuote, maximise: bool) -> Option<Price> {
    let price = quote.normalized_price()?;

    if market.price_conf_multiplier.is_zero() {
        return Some(price);
    }

    let conf = quote.normalized_conf();
    let conf_ratio_bps = conf * Decimal::from(crate::types::BPS) / price.value();
    if conf_ratio_bps <= Decimal::from(market.price_conf_threshold.value()) {
        return Some(price);
    }

    let delta = conf * market.price_conf_multiplier.as_fraction();
    if maximise {
        Price::new(price.value() + delta)
    } else {
        Price::new(price.value() - delta)
    }
}

/// True when `price` sits inside the reference band. No reference or a zero
/// deviation budget disables the check.
pub fn within_reference(price: Price, reference: Option<Price>, max_deviation: Bps) -> bool {
    let Some(reference) = reference else {
        return true;
    };
    if max_deviation.is_zero() {
        return true;
    }
    let low = reference.value() * max_deviation.complement_fraction();
    let high = reference.value() * (Decimal::ONE + max_deviation.as_fraction());
    price.value() >= low && price.value() <= high
}

/// One entry of the in-memory feed's update payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub feed_id: u64,
    pub quote: OracleQuote,
}

/// Serialize updates the way `MemoryPriceFeed` consumes them.
pub fn encode_updates(updates: &[PriceUpdate]) -> Vec<u8> {
    serde_json::to_vec(updates).expect("price updates serialize")
}

/// In-memory execution oracle. Payloads are JSON update lists; the per-update
/// fee imitates oracles that charge for on-chain refreshes.
#[derive(Debug, Clone, Default)]
pub struct MemoryPriceFeed {
    quotes: HashMap<u64, OracleQuote>,
    update_fee: Amount,
}

impl MemoryPriceFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_update_fee(update_fee: Amount) -> Self {
        Self {
            quotes: HashMap::new(),
            update_fee,
        }
    }

    pub fn set_quote(&mut self, feed_id: u64, quote: OracleQuote) {
        self.quotes.insert(feed_id, quote);
    }
}

impl PriceFeed for MemoryPriceFeed {
    fn get_unsafe(&self, feed_id: u64) -> Option<OracleQuote> {
        self.quotes.get(&feed_id).copied()
    }

    fn apply_update(&mut self, payload: &[u8]) -> Result<Amount, FeedError> {
        if payload.is_empty() {
            return Ok(Amount::zero());
        }
        let updates: Vec<PriceUpdate> =
            serde_json::from_slice(payload).map_err(|e| FeedError::BadPayload(e.to_string()))?;
        let count = updates.len();
        for update in updates {
            self.quotes.insert(update.feed_id, update.quote);
        }
        Ok(self.update_fee.mul(Decimal::from(count as u64)))
    }
}

/// In-memory reference feed.
#[derive(Debug, Clone, Default)]
pub struct MemoryReferenceFeed {
    prices: HashMap<u64, Price>,
}

impl MemoryReferenceFeed {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReferencePriceFeed for MemoryReferenceFeed {
    fn get(&self, feed_id: u64) -> Option<Price> {
        self.prices.get(&feed_id).copied()
    }

    fn push(&mut self, feed_id: u64, price: Option<Price>) {
        match price {
            Some(p) => {
                self.prices.insert(feed_id, p);
            }
            None => {
                self.prices.remove(&feed_id);
            }
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("malformed oracle payload: {0}")]
    BadPayload(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quote(price: i64, conf: u64, expo: i32) -> OracleQuote {
        OracleQuote::new(price, conf, expo, Timestamp::from_secs(100))
    }

    #[test]
    fn normalization_applies_exponent() {
        let q = quote(204_000_000, 0, -5);
        assert_eq!(q.normalized_price().unwrap().value(), dec!(2040));
    }

    #[test]
    fn normalization_rejects_bad_quotes() {
        assert!(quote(-5, 0, -2).normalized_price().is_none());
        assert!(quote(0, 0, -2).normalized_price().is_none());
        assert!(quote(100, 0, 2).normalized_price().is_none());
    }

    #[test]
    fn confidence_widening_is_directional() {
        let mut market = Market::eth_usd();
        market.price_conf_threshold = Bps::new(50); // 0.5%
        market.price_conf_multiplier = Bps::new(10_000); // full confidence

        // conf 2% of price: above threshold, widened by the full interval
        let q = quote(2_000_00, 40_00, -2);
        let up = bounded_oracle_price(&market, &q, true).unwrap();
        let down = bounded_oracle_price(&market, &q, false).unwrap();
        assert_eq!(up.value(), dec!(2040));
        assert_eq!(down.value(), dec!(1960));

        // tight confidence: untouched either way
        let tight = quote(2_000_00, 1_00, -2);
        assert_eq!(
            bounded_oracle_price(&market, &tight, true).unwrap().value(),
            dec!(2000)
        );
    }

    #[test]
    fn no_multiplier_means_no_widening() {
        let market = Market::eth_usd();
        let q = quote(2_000_00, 500_00, -2);
        assert_eq!(
            bounded_oracle_price(&market, &q, true).unwrap().value(),
            dec!(2000)
        );
    }

    #[test]
    fn reference_band_edges() {
        let max_dev = Bps::new(100); // 1%
        let reference = Some(Price::new_unchecked(dec!(2000)));

        assert!(within_reference(Price::new_unchecked(dec!(2020)), reference, max_dev));
        assert!(within_reference(Price::new_unchecked(dec!(1980)), reference, max_dev));
        assert!(!within_reference(Price::new_unchecked(dec!(2021)), reference, max_dev));
        assert!(!within_reference(Price::new_unchecked(dec!(1979)), reference, max_dev));

        // missing reference or zero budget disables the check
        assert!(within_reference(Price::new_unchecked(dec!(9999)), None, max_dev));
        assert!(within_reference(
            Price::new_unchecked(dec!(9999)),
            reference,
            Bps::zero()
        ));
    }

    #[test]
    fn memory_feed_update_round_trip() {
        let mut feed = MemoryPriceFeed::with_update_fee(Amount::new(dec!(0.001)));
        let payload = encode_updates(&[
            PriceUpdate {
                feed_id: 101,
                quote: quote(2_000_00, 0, -2),
            },
            PriceUpdate {
                feed_id: 102,
                quote: quote(45_000_00, 0, -2),
            },
        ]);

        let fee = feed.apply_update(&payload).unwrap();
        assert_eq!(fee.value(), dec!(0.002));
        assert_eq!(
            feed.get_unsafe(101).unwrap().normalized_price().unwrap().value(),
            dec!(2000)
        );
        assert!(feed.get_unsafe(999).is_none());
    }

    #[test]
    fn memory_feed_rejects_garbage() {
        let mut feed = MemoryPriceFeed::new();
        assert!(matches!(
            feed.apply_update(b"not json"),
            Err(FeedError::BadPayload(_))
        ));
        assert_eq!(feed.apply_update(b"").unwrap(), Amount::zero());
    }

    #[test]
    fn reference_feed_push_and_clear() {
        let mut feed = MemoryReferenceFeed::new();
        feed.push(1, Price::new(dec!(2000)));
        assert_eq!(feed.get(1).unwrap().value(), dec!(2000));
        feed.push(1, None);
        assert!(feed.get(1).is_none());
    }
}
