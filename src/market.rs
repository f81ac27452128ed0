//! Market and asset configuration.
//!
//! A market is a tradable pair priced by an external oracle; an asset is a
//! collateral token with its own siloed liquidity pool. Both are listed by
//! governance and carry hard parameter bounds that listing validates.

use crate::types::{Amount, AssetId, Bps, MarketId};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard parameter bounds enforced at listing time.
pub const MAX_FEE_BPS: u32 = 1_000;
pub const MAX_DEVIATION_BPS: u32 = 1_000;
pub const MAX_LIQ_THRESHOLD_BPS: u32 = 9_800;
pub const MAX_MIN_ORDER_AGE_S: i64 = 30;
pub const MIN_ORACLE_MAX_AGE_S: i64 = 3;

/// Static per-market configuration, updatable only by governance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Human-readable name (e.g., "Ethereum / U.S. Dollar").
    pub name: String,
    /// Grouping label ("crypto", "fx", ...).
    pub category: String,
    /// Feed id consulted on the reference (bounding) feed.
    pub reference_feed_id: u64,
    /// Feed id consulted on the execution oracle.
    pub oracle_feed_id: u64,
    /// Maximum position leverage, whole multiples >= 1.
    pub max_leverage: Decimal,
    /// Allowed divergence between oracle and reference price.
    pub max_deviation: Bps,
    /// Taker fee charged on order size.
    pub fee: Bps,
    /// Fraction of margin that may be lost before liquidation.
    pub liq_threshold: Bps,
    /// Yearly funding rate at full one-sided skew.
    pub funding_factor: Bps,
    /// Orders younger than this are skipped by keepers.
    pub min_order_age: i64,
    /// Oracle publish times older than this are stale.
    pub oracle_max_age: i64,
    /// When set, only position-reducing orders are accepted.
    pub is_reduce_only: bool,
    /// Confidence-to-price ratio above which the price gets widened.
    pub price_conf_threshold: Bps,
    /// How much of the confidence interval to apply when widening.
    pub price_conf_multiplier: Bps,
}

impl Market {
    /// Validate the governance bounds from the listing rules.
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.max_leverage < Decimal::ONE {
            return Err(MarketError::LeverageBelowOne(self.max_leverage));
        }
        if self.max_deviation.value() > MAX_DEVIATION_BPS {
            return Err(MarketError::ParamAboveCap {
                param: "max_deviation",
                value: self.max_deviation.value() as i64,
                cap: MAX_DEVIATION_BPS as i64,
            });
        }
        if self.fee.value() > MAX_FEE_BPS {
            return Err(MarketError::ParamAboveCap {
                param: "fee",
                value: self.fee.value() as i64,
                cap: MAX_FEE_BPS as i64,
            });
        }
        if self.liq_threshold.value() > MAX_LIQ_THRESHOLD_BPS {
            return Err(MarketError::ParamAboveCap {
                param: "liq_threshold",
                value: self.liq_threshold.value() as i64,
                cap: MAX_LIQ_THRESHOLD_BPS as i64,
            });
        }
        if self.min_order_age > MAX_MIN_ORDER_AGE_S {
            return Err(MarketError::ParamAboveCap {
                param: "min_order_age",
                value: self.min_order_age,
                cap: MAX_MIN_ORDER_AGE_S,
            });
        }
        if self.oracle_max_age < MIN_ORACLE_MAX_AGE_S {
            return Err(MarketError::OracleMaxAgeTooLow(self.oracle_max_age));
        }
        Ok(())
    }

    /// Default ETH-USD listing used across the test suites.
    pub fn eth_usd() -> Self {
        Self {
            name: "Ethereum / U.S. Dollar".to_string(),
            category: "crypto".to_string(),
            reference_feed_id: 1,
            oracle_feed_id: 101,
            max_leverage: dec!(50),
            max_deviation: Bps::new(500),
            fee: Bps::new(10),
            liq_threshold: Bps::new(8000),
            funding_factor: Bps::new(1000),
            min_order_age: 0,
            oracle_max_age: 30,
            is_reduce_only: false,
            price_conf_threshold: Bps::zero(),
            price_conf_multiplier: Bps::zero(),
        }
    }

    pub fn btc_usd() -> Self {
        Self {
            name: "Bitcoin / U.S. Dollar".to_string(),
            category: "crypto".to_string(),
            reference_feed_id: 2,
            oracle_feed_id: 102,
            max_leverage: dec!(100),
            max_deviation: Bps::new(500),
            fee: Bps::new(10),
            liq_threshold: Bps::new(9000),
            funding_factor: Bps::new(1000),
            min_order_age: 0,
            oracle_max_age: 30,
            is_reduce_only: false,
            price_conf_threshold: Bps::zero(),
            price_conf_multiplier: Bps::zero(),
        }
    }
}

/// Collateral asset listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Token decimals, informational for hosts.
    pub decimals: u32,
    /// Smallest position size accepted for non-reduce-only orders.
    pub min_size: Amount,
    /// Feed id for the asset's own reference price.
    pub reference_feed_id: u64,
}

impl Asset {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.min_size.is_negative() {
            return Err(MarketError::NegativeMinSize(self.min_size.value()));
        }
        Ok(())
    }

    /// Six-decimal stable-style collateral used across the test suites.
    pub fn usdc() -> Self {
        Self {
            decimals: 6,
            min_size: Amount::new(dec!(1)),
            reference_feed_id: 10,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MarketError {
    #[error("max leverage {0} is below 1x")]
    LeverageBelowOne(Decimal),

    #[error("{param} = {value} exceeds cap {cap}")]
    ParamAboveCap {
        param: &'static str,
        value: i64,
        cap: i64,
    },

    #[error("oracle max age {0}s is below the {MIN_ORACLE_MAX_AGE_S}s floor")]
    OracleMaxAgeTooLow(i64),

    #[error("asset min size {0} is negative")]
    NegativeMinSize(Decimal),

    #[error("market {0} is not listed")]
    UnknownMarket(MarketId),

    #[error("asset {0:?} is not listed")]
    UnknownAsset(AssetId),
}
