// 4.0: open position tracking. one position per (user, asset, market), isolated
// margin, direction flips go through full close then reopen.
// 4.1 has the average-price and pnl math at the bottom.

use crate::types::{Amount, AssetId, MarketId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// structural key; equality over the triple replaces the source's hash key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionKey {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
}

impl PositionKey {
    pub fn new(user: UserId, asset: AssetId, market: MarketId) -> Self {
        Self {
            user,
            asset,
            market,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size: Amount,
    pub margin: Amount,
    pub avg_price: Price,
    pub timestamp: Timestamp,
    /// Cumulative funding index sampled when the position was opened or last
    /// partially closed.
    pub funding_snapshot: Decimal,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.user, self.asset, self.market)
    }

    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }

    /// `size / margin`; meaningful only while margin > 0.
    pub fn leverage(&self) -> Decimal {
        self.size.value() / self.margin.value()
    }
}

// 4.1: size-weighted average entry. two increases at p1, p2 land exactly on
// (s1*p1 + s2*p2) / (s1 + s2).
pub fn average_entry_price(
    existing_size: Amount,
    existing_price: Price,
    added_size: Amount,
    fill_price: Price,
) -> Price {
    let total = existing_size.add(added_size);
    if total.is_zero() {
        return fill_price;
    }
    let weighted = existing_size.value() * existing_price.value()
        + added_size.value() * fill_price.value();
    Price::new_unchecked(weighted / total.value())
}

// 4.2: directional price pnl plus funding. longs pay positive funding deltas,
// shorts receive them. returns (pnl, funding_fee), both signed.
pub fn position_pnl(
    side: Side,
    price: Price,
    avg_price: Price,
    size: Amount,
    funding_snapshot: Decimal,
    funding_index: Decimal,
) -> (Decimal, Decimal) {
    if size.is_zero() {
        return (Decimal::ZERO, Decimal::ZERO);
    }

    let price_move = match side {
        Side::Long => price.value() - avg_price.value(),
        Side::Short => avg_price.value() - price.value(),
    };
    let mut pnl = size.value() * price_move / avg_price.value();

    let funding_fee = size.value() * (funding_index - funding_snapshot);
    match side {
        Side::Long => pnl -= funding_fee,
        Side::Short => pnl += funding_fee,
    }

    (pnl, funding_fee)
}

/// Long/short aggregate notional, tracked per (asset, market) and per asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub long: Decimal,
    pub short: Decimal,
}

impl OpenInterest {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn total(&self) -> Decimal {
        self.long + self.short
    }

    pub fn skew(&self) -> Decimal {
        self.long - self.short
    }

    pub fn increment(&mut self, side: Side, size: Amount) {
        match side {
            Side::Long => self.long += size.value(),
            Side::Short => self.short += size.value(),
        }
    }

    // decrements clamp at zero so aggregate counters never go negative
    pub fn decrement(&mut self, side: Side, size: Amount) {
        match side {
            Side::Long => self.long = (self.long - size.value()).max(Decimal::ZERO),
            Side::Short => self.short = (self.short - size.value()).max(Decimal::ZERO),
        }
    }
}
