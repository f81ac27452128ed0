//! Risk validation.
//!
//! Two gates protect depositors: per-market open-interest caps checked at
//! submission and execution, and a pool-drawdown tracker that accumulates
//! trader P&L against each pool and decays hourly, blocking closes once the
//! pool has paid out more than its configured share over a rolling window.

use crate::types::{Amount, AssetId, Bps, MarketId, Timestamp, BPS};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Default hourly decay applied to the drawdown tracker (~100%/day).
pub const DEFAULT_POOL_HOURLY_DECAY_BPS: u32 = 416;

/// Default pool profit limit, 10% of principal.
pub const DEFAULT_POOL_PROFIT_LIMIT_BPS: u32 = 1_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DrawdownState {
    /// Net trader P&L charged to the pool, signed. Positive = pool drained.
    profit_tracker: Decimal,
    last_checked: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskValidator {
    drawdown: HashMap<AssetId, DrawdownState>,
    profit_limit: HashMap<AssetId, Bps>,
    max_oi: HashMap<(AssetId, MarketId), Decimal>,
    hourly_decay: Bps,
}

impl RiskValidator {
    pub fn new() -> Self {
        Self {
            drawdown: HashMap::new(),
            profit_limit: HashMap::new(),
            max_oi: HashMap::new(),
            hourly_decay: Bps::new(DEFAULT_POOL_HOURLY_DECAY_BPS),
        }
    }

    pub fn set_max_oi(&mut self, asset: AssetId, market: MarketId, cap: Decimal) {
        self.max_oi.insert((asset, market), cap);
    }

    pub fn max_oi(&self, asset: AssetId, market: MarketId) -> Decimal {
        self.max_oi
            .get(&(asset, market))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn set_profit_limit(&mut self, asset: AssetId, limit: Bps) {
        self.profit_limit.insert(asset, limit);
    }

    pub fn set_hourly_decay(&mut self, decay: Bps) {
        self.hourly_decay = decay;
    }

    pub fn hourly_decay(&self) -> Bps {
        self.hourly_decay
    }

    /// Reject an OI increase that would push total open interest past the
    /// per-market cap. A cap of zero means uncapped.
    pub fn check_max_oi(
        &self,
        asset: AssetId,
        market: MarketId,
        current_total_oi: Decimal,
        added_size: Amount,
    ) -> Result<(), RiskError> {
        let cap = self.max_oi(asset, market);
        if cap.is_zero() {
            return Ok(());
        }
        if current_total_oi + added_size.value() > cap {
            return Err(RiskError::OiCapExceeded {
                asset,
                market,
                cap,
            });
        }
        Ok(())
    }

    /// Tracker after decay but before any new P&L lands.
    pub fn decayed_profit_tracker(&self, asset: AssetId, now: Timestamp) -> Decimal {
        let Some(state) = self.drawdown.get(&asset) else {
            return Decimal::ZERO;
        };
        decay(state.profit_tracker, state.last_checked, now, self.hourly_decay)
    }

    /// Charge a realized trader P&L against the pool's rolling drawdown
    /// window. Bookkeeping persists only when the check passes; a failing
    /// command rolls back whole.
    pub fn check_pool_drawdown(
        &mut self,
        asset: AssetId,
        trader_pnl: Decimal,
        pool_balance: Amount,
        now: Timestamp,
    ) -> Result<(), RiskError> {
        let tracker = self.decayed_profit_tracker(asset, now) + trader_pnl;

        if let Some(limit) = self.profit_limit.get(&asset) {
            if !limit.is_zero() {
                let limit_amount = pool_balance.value() * limit.as_fraction();
                if tracker > limit_amount {
                    return Err(RiskError::PoolDrawdownExceeded {
                        asset,
                        tracker,
                        limit: limit_amount,
                    });
                }
            }
        }

        let state = self.drawdown.entry(asset).or_default();
        state.profit_tracker = tracker;
        state.last_checked = now;
        Ok(())
    }
}

impl Default for RiskValidator {
    fn default() -> Self {
        Self::new()
    }
}

// linear hourly decay toward zero. hours are capped where the multiplier
// would cross zero, so very long gaps clear the tracker instead of flipping
// its sign. applies symmetrically to negative trackers.
fn decay(tracker: Decimal, last_checked: Timestamp, now: Timestamp, hourly_decay: Bps) -> Decimal {
    if tracker.is_zero() || hourly_decay.is_zero() {
        return tracker;
    }
    let max_hours = (BPS / hourly_decay.value()) as i64;
    let hours = now.hours_since(last_checked).min(max_hours);
    if hours == 0 {
        return tracker;
    }
    let remaining = BPS as i64 - hourly_decay.value() as i64 * hours;
    if remaining <= 0 {
        return Decimal::ZERO;
    }
    tracker * Decimal::new(remaining, 4)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RiskError {
    #[error("open interest cap {cap} exceeded for {market} in asset {asset:?}")]
    OiCapExceeded {
        asset: AssetId,
        market: MarketId,
        cap: Decimal,
    },

    #[error("pool drawdown limit hit for asset {asset:?}: tracker {tracker} > limit {limit}")]
    PoolDrawdownExceeded {
        asset: AssetId,
        tracker: Decimal,
        limit: Decimal,
    },
}
