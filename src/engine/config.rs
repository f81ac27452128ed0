//! Engine configuration: the governance-settable global parameters.

use crate::funding::DEFAULT_FUNDING_INTERVAL_S;
use crate::pool::{MAX_BUFFER_PAYOUT_PERIOD_S, MAX_LIQUIDITY_ORDER_TTL_S};
use crate::risk::{DEFAULT_POOL_HOURLY_DECAY_BPS, DEFAULT_POOL_PROFIT_LIMIT_BPS};
use crate::types::{Amount, Bps, BPS};
use serde::{Deserialize, Serialize};

pub const MAX_KEEPER_FEE_SHARE_BPS: u32 = 2_000;
pub const MAX_TRAILING_STOP_FEE_BPS: u32 = 500;
pub const MAX_MIN_POSITION_HOLD_TIME_S: i64 = 1_800;

/// Global engine parameters. Per-market parameters live on `Market`, and
/// per-asset ones on `Asset` / `PoolState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Share of net trading fees credited to the pool; remainder to treasury.
    pub pool_fee_share: Bps,
    /// Keeper cut taken off the top of every trading fee.
    pub keeper_fee_share: Bps,
    /// Buffer payout epoch length in seconds.
    pub buffer_payout_period: i64,
    /// TTL for pending liquidity orders.
    pub max_liquidity_order_ttl: i64,
    /// TTL for market orders awaiting execution.
    pub max_market_order_ttl: i64,
    /// TTL for limit/stop/trailing-stop orders.
    pub max_trigger_order_ttl: i64,
    /// Minimum seconds between increasing and decreasing a position.
    pub min_position_hold_time: i64,
    /// Extra margin cushion required when removing margin at a loss.
    pub remove_margin_buffer: Bps,
    /// Surcharge on trailing-stop executions.
    pub trailing_stop_fee: Bps,
    /// Extra fee rate charged on liquidated size.
    pub liquidation_fee: Bps,
    /// Hourly decay of the pool drawdown tracker.
    pub pool_hourly_decay: Bps,
    /// Default pool profit limit applied to newly listed assets.
    pub pool_profit_limit: Bps,
    /// Funding index commit cadence.
    pub funding_interval: i64,
    /// Keeper compensation escrowed per order, in the native asset.
    pub order_execution_fee: Amount,
    /// Maximum number of events to retain in memory.
    pub max_events: usize,
    /// Enable verbose event logging.
    pub verbose: bool,
}

impl EngineConfig {
    /// Check the configuration bounds. Governance setters call this through
    /// the per-field checks below; constructors use it wholesale.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pool_fee_share.value() >= BPS {
            return Err("!fee-share");
        }
        if self.keeper_fee_share.value() > MAX_KEEPER_FEE_SHARE_BPS {
            return Err("!keeper-fee-share");
        }
        if self.buffer_payout_period <= 0 || self.buffer_payout_period > MAX_BUFFER_PAYOUT_PERIOD_S
        {
            return Err("!buffer-payout-period");
        }
        if self.max_liquidity_order_ttl <= 0
            || self.max_liquidity_order_ttl > MAX_LIQUIDITY_ORDER_TTL_S
        {
            return Err("!liquidity-order-ttl");
        }
        if self.max_market_order_ttl <= 0 || self.max_trigger_order_ttl <= 0 {
            return Err("!order-ttl");
        }
        if self.min_position_hold_time < 0
            || self.min_position_hold_time > MAX_MIN_POSITION_HOLD_TIME_S
        {
            return Err("!min-hold-time");
        }
        if self.remove_margin_buffer.value() >= BPS {
            return Err("!remove-margin-buffer");
        }
        if self.trailing_stop_fee.value() > MAX_TRAILING_STOP_FEE_BPS {
            return Err("!trailing-stop-fee");
        }
        if self.pool_hourly_decay.value() >= BPS {
            return Err("!pool-hourly-decay");
        }
        if self.pool_profit_limit.value() >= BPS {
            return Err("!pool-profit-limit");
        }
        if self.funding_interval <= 0 {
            return Err("!funding-interval");
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_fee_share: Bps::new(5_000),
            keeper_fee_share: Bps::new(1_000),
            buffer_payout_period: 7 * 24 * 3600,
            max_liquidity_order_ttl: 600,
            max_market_order_ttl: 300,
            max_trigger_order_ttl: 30 * 24 * 3600,
            min_position_hold_time: 0,
            remove_margin_buffer: Bps::new(1_000),
            trailing_stop_fee: Bps::new(50),
            liquidation_fee: Bps::new(100),
            pool_hourly_decay: Bps::new(DEFAULT_POOL_HOURLY_DECAY_BPS),
            pool_profit_limit: Bps::new(DEFAULT_POOL_PROFIT_LIMIT_BPS),
            funding_interval: DEFAULT_FUNDING_INTERVAL_S,
            order_execution_fee: Amount::zero(),
            max_events: 100_000,
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut config = EngineConfig::default();
        config.keeper_fee_share = Bps::new(2_001);
        assert_eq!(config.validate(), Err("!keeper-fee-share"));

        let mut config = EngineConfig::default();
        config.buffer_payout_period = 8 * 24 * 3600;
        assert_eq!(config.validate(), Err("!buffer-payout-period"));

        let mut config = EngineConfig::default();
        config.max_liquidity_order_ttl = 2 * 3600;
        assert_eq!(config.validate(), Err("!liquidity-order-ttl"));

        let mut config = EngineConfig::default();
        config.min_position_hold_time = 3_600;
        assert_eq!(config.validate(), Err("!min-hold-time"));
    }

    #[test]
    fn config_serde_round_trip() {
        let mut config = EngineConfig::default();
        config.order_execution_fee = Amount::new(dec!(0.0005));

        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.order_execution_fee, config.order_execution_fee);
        assert_eq!(back.pool_fee_share, config.pool_fee_share);
    }
}
