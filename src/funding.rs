// 5.0: funding. the cumulative index per (asset, market) drifts toward the
// heavier side of the book: longs pay shorts when long OI dominates, and the
// reverse. positions sample the index at open and settle the delta at close.
// 5.1 has the accrual math, 5.2 the tracker state machine.

use crate::position::OpenInterest;
use crate::types::{AssetId, Bps, MarketId, Timestamp, SECONDS_PER_YEAR};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default commit cadence for the index, one hour.
pub const DEFAULT_FUNDING_INTERVAL_S: i64 = 3_600;

// 5.1: signed accrual over `intervals` commit periods.
//
//   accrued = yearly_rate * |skew| / total_oi * intervals / intervals_per_year
//
// positive when longs dominate. a balanced book accrues exactly zero no
// matter how much time passed.
pub fn accrued_funding(
    yearly_factor: Bps,
    oi: &OpenInterest,
    intervals: i64,
    interval_secs: i64,
) -> Decimal {
    let total = oi.total();
    if total.is_zero() || intervals <= 0 || interval_secs <= 0 {
        return Decimal::ZERO;
    }

    let intervals_per_year = Decimal::from(SECONDS_PER_YEAR / interval_secs);
    if intervals_per_year.is_zero() {
        return Decimal::ZERO;
    }

    let skew = oi.skew();
    let magnitude = yearly_factor.as_fraction() * skew.abs() * Decimal::from(intervals)
        / (intervals_per_year * total);

    if skew.is_sign_negative() {
        -magnitude
    } else {
        magnitude
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FundingState {
    /// Cumulative signed index, a dimensionless fraction of notional.
    pub index: Decimal,
    /// `None` until the first update seeds the clock.
    pub last_updated: Option<Timestamp>,
}

// 5.2: tracker over every listed (asset, market) pair. OI is passed in by the
// caller; the tracker never reaches back into position state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingTracker {
    states: HashMap<(AssetId, MarketId), FundingState>,
    interval_secs: i64,
}

impl FundingTracker {
    pub fn new(interval_secs: i64) -> Self {
        Self {
            states: HashMap::new(),
            interval_secs,
        }
    }

    pub fn interval_secs(&self) -> i64 {
        self.interval_secs
    }

    /// Latest committed index, zero for never-touched pairs.
    pub fn current(&self, asset: AssetId, market: MarketId) -> Decimal {
        self.states
            .get(&(asset, market))
            .map(|s| s.index)
            .unwrap_or(Decimal::ZERO)
    }

    /// Committed index plus the accrual that `update` would add right now.
    /// Used for P&L so closes settle funding up to the current second.
    pub fn projected(
        &self,
        asset: AssetId,
        market: MarketId,
        yearly_factor: Bps,
        oi: &OpenInterest,
        now: Timestamp,
    ) -> Decimal {
        let Some(state) = self.states.get(&(asset, market)) else {
            return Decimal::ZERO;
        };
        let Some(last) = state.last_updated else {
            return state.index;
        };

        let intervals = now.seconds_since(last) / self.interval_secs;
        state.index + accrued_funding(yearly_factor, oi, intervals, self.interval_secs)
    }

    /// Advance the committed index. Returns the increment when one was
    /// committed.
    ///
    /// The first call only seeds the clock. Later calls are no-ops until a
    /// full interval has elapsed, and a zero increment (empty or balanced
    /// book) leaves the clock untouched so idle time keeps accumulating.
    pub fn update(
        &mut self,
        asset: AssetId,
        market: MarketId,
        yearly_factor: Bps,
        oi: &OpenInterest,
        now: Timestamp,
    ) -> Option<Decimal> {
        let state = self.states.entry((asset, market)).or_default();

        let Some(last) = state.last_updated else {
            state.last_updated = Some(now);
            return None;
        };

        let elapsed = now.seconds_since(last);
        if elapsed < self.interval_secs {
            return None;
        }

        let intervals = elapsed / self.interval_secs;
        let increment = accrued_funding(yearly_factor, oi, intervals, self.interval_secs);
        if increment.is_zero() {
            return None;
        }

        state.index += increment;
        state.last_updated = Some(now);
        Some(increment)
    }
}
