//! Order records and the keeper-executed order store.
//!
//! Orders here never match against each other. They rest in the store until a
//! whitelisted keeper executes them against an oracle price, cancels them, or
//! they expire. Market orders and trigger orders (limit/stop/trailing-stop)
//! are indexed separately so keepers can sweep each family in insertion order.

use crate::types::{Amount, AssetId, Bps, MarketId, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maximum trailing-stop distance, 20%.
pub const MAX_TRAILING_STOP_BPS: u32 = 2_000;

/// How an order is matched against the oracle price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Execute at the next oracle price. With a trigger price set it becomes a
    /// protected market order: cancelled instead of filled through the bound.
    Market,
    /// Execute at trigger or better.
    Limit,
    /// Execute once price crosses the trigger away from entry.
    Stop,
    /// Reduce-only close that fires a fixed percentage off a keeper-supplied
    /// reference price.
    TrailingStop,
}

impl OrderKind {
    pub fn is_market(&self) -> bool {
        matches!(self, OrderKind::Market)
    }

    pub fn is_trigger(&self) -> bool {
        !self.is_market()
    }
}

/// A resting order. Flat record; margin and fee are escrowed at submission for
/// non-reduce-only orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub margin: Amount,
    pub size: Amount,
    pub fee: Amount,
    pub timestamp: Timestamp,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub trigger_price: Option<Price>,
    pub expiry: Option<Timestamp>,
    /// Sibling order cancelled when this one executes (OCO pairing).
    pub cancel_on_execute: Option<OrderId>,
    /// Keeper compensation, escrowed in the native asset.
    pub execution_fee: Amount,
    /// Distance for trailing stops; `None` for every other kind.
    pub trailing_stop: Option<Bps>,
}

impl Order {
    pub fn is_empty(&self) -> bool {
        self.size.is_zero()
    }

    /// Escrow this order holds: margin plus fee for orders that opened custody.
    pub fn escrow(&self) -> Amount {
        if self.reduce_only {
            Amount::zero()
        } else {
            self.margin.add(self.fee)
        }
    }

    /// `size / margin`; callers must have checked `margin > 0`.
    pub fn leverage(&self) -> Decimal {
        self.size.value() / self.margin.value()
    }
}

/// Order storage with stable, insertion-ordered iteration.
///
/// `market_ids` and `trigger_ids` keep the id sets keepers page through;
/// `by_user` backs owner lookups and cancels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderStore {
    orders: HashMap<OrderId, Order>,
    by_user: HashMap<UserId, Vec<OrderId>>,
    market_ids: Vec<OrderId>,
    trigger_ids: Vec<OrderId>,
    next_id: u32,
}

impl OrderStore {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
            by_user: HashMap::new(),
            market_ids: Vec::new(),
            trigger_ids: Vec::new(),
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> OrderId {
        let id = OrderId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, order: Order) {
        let id = order.id;
        let user = order.user;
        if order.kind.is_market() {
            self.market_ids.push(id);
        } else {
            self.trigger_ids.push(id);
        }
        self.by_user.entry(user).or_default().push(id);
        self.orders.insert(id, order);
    }

    pub fn remove(&mut self, id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&id)?;
        if order.kind.is_market() {
            self.market_ids.retain(|&oid| oid != id);
        } else {
            self.trigger_ids.retain(|&oid| oid != id);
        }
        if let Some(ids) = self.by_user.get_mut(&order.user) {
            ids.retain(|&oid| oid != id);
            if ids.is_empty() {
                self.by_user.remove(&order.user);
            }
        }
        Some(order)
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn contains(&self, id: OrderId) -> bool {
        self.orders.contains_key(&id)
    }

    pub fn get_by_user(&self, user: UserId) -> Vec<&Order> {
        self.by_user
            .get(&user)
            .map(|ids| ids.iter().filter_map(|id| self.orders.get(id)).collect())
            .unwrap_or_default()
    }

    /// Page through market-order ids in insertion order.
    pub fn market_order_ids(&self, offset: usize, limit: usize) -> &[OrderId] {
        page(&self.market_ids, offset, limit)
    }

    /// Page through trigger-order ids in insertion order.
    pub fn trigger_order_ids(&self, offset: usize, limit: usize) -> &[OrderId] {
        page(&self.trigger_ids, offset, limit)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

fn page(ids: &[OrderId], offset: usize, limit: usize) -> &[OrderId] {
    let start = offset.min(ids.len());
    let end = start.saturating_add(limit).min(ids.len());
    &ids[start..end]
}
