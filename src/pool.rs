//! Per-asset liquidity pools.
//!
//! Each collateral asset has its own siloed pool. LPs hold shares of the pool
//! principal; trader losses land in a side buffer and drip into the principal
//! over a payout epoch, trader profits drain the buffer first and principal
//! second. Deposit and withdrawal taxes lean against anyone trying to trade
//! around pending unrealized P&L.

use crate::types::{
    Amount, AssetId, Bps, LiquidityOrderId, Timestamp, UserId, BPS,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Upper bound on the buffer payout epoch, 7 days.
pub const MAX_BUFFER_PAYOUT_PERIOD_S: i64 = 7 * 24 * 3600;

/// Upper bound on how long a liquidity order may wait for a keeper, 1 hour.
pub const MAX_LIQUIDITY_ORDER_TTL_S: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidityOrderKind {
    Deposit,
    Withdraw,
}

/// A pending two-phase pool deposit or withdrawal, executed later by a keeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityOrder {
    pub id: LiquidityOrderId,
    pub user: UserId,
    pub asset: AssetId,
    pub kind: LiquidityOrderKind,
    pub amount: Amount,
    /// Execution fails rather than deliver less than this after tax.
    pub min_amount_after_tax: Amount,
    pub timestamp: Timestamp,
    pub execution_fee: Amount,
}

impl LiquidityOrder {
    /// Asset escrow held for this order. Deposits escrow the amount up front;
    /// withdrawals move nothing until executed.
    pub fn escrow(&self) -> Amount {
        match self.kind {
            LiquidityOrderKind::Deposit => self.amount,
            LiquidityOrderKind::Withdraw => Amount::zero(),
        }
    }
}

/// Pending liquidity orders with stable insertion-ordered iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiquidityOrderStore {
    orders: HashMap<LiquidityOrderId, LiquidityOrder>,
    by_user: HashMap<UserId, Vec<LiquidityOrderId>>,
    order_ids: Vec<LiquidityOrderId>,
    next_id: u32,
}

impl LiquidityOrderStore {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
            by_user: HashMap::new(),
            order_ids: Vec::new(),
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> LiquidityOrderId {
        let id = LiquidityOrderId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, order: LiquidityOrder) {
        let id = order.id;
        self.order_ids.push(id);
        self.by_user.entry(order.user).or_default().push(id);
        self.orders.insert(id, order);
    }

    pub fn remove(&mut self, id: LiquidityOrderId) -> Option<LiquidityOrder> {
        let order = self.orders.remove(&id)?;
        self.order_ids.retain(|&oid| oid != id);
        if let Some(ids) = self.by_user.get_mut(&order.user) {
            ids.retain(|&oid| oid != id);
            if ids.is_empty() {
                self.by_user.remove(&order.user);
            }
        }
        Some(order)
    }

    pub fn get(&self, id: LiquidityOrderId) -> Option<&LiquidityOrder> {
        self.orders.get(&id)
    }

    pub fn get_by_user(&self, user: UserId) -> Vec<&LiquidityOrder> {
        self.by_user
            .get(&user)
            .map(|ids| ids.iter().filter_map(|id| self.orders.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn ids(&self, offset: usize, limit: usize) -> &[LiquidityOrderId] {
        let start = offset.min(self.order_ids.len());
        let end = start.saturating_add(limit).min(self.order_ids.len());
        &self.order_ids[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiquidityOrder> {
        self.orders.values()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

/// State of one asset's pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolState {
    /// Principal backing LP shares.
    pub balance: Amount,
    /// Trader losses not yet recognized by the principal.
    pub buffer: Amount,
    pub lp_supply: Decimal,
    pub user_lp: HashMap<UserId, Decimal>,
    /// Last time the buffer streamer ran.
    pub last_paid: Timestamp,
    /// Portion of the buffer committed to the current payout epoch.
    pub epoch_remaining: Amount,
    /// Keeper-posted aggregate unrealized trader P&L, signed.
    pub global_upl: Decimal,
    /// Treasury share of trading fees, held until governance withdrawal.
    pub fee_reserve: Amount,
    /// Scales the liquidity withdrawals must leave behind versus open interest.
    pub utilization_multiplier: Bps,
}

impl PoolState {
    pub fn new() -> Self {
        Self {
            balance: Amount::zero(),
            buffer: Amount::zero(),
            lp_supply: Decimal::ZERO,
            user_lp: HashMap::new(),
            last_paid: Timestamp::from_secs(0),
            epoch_remaining: Amount::zero(),
            global_upl: Decimal::ZERO,
            fee_reserve: Amount::zero(),
            utilization_multiplier: Bps::new(BPS),
        }
    }

    pub fn lp_of(&self, user: UserId) -> Decimal {
        self.user_lp.get(&user).copied().unwrap_or(Decimal::ZERO)
    }

    /// Current redemption value of a user's shares.
    pub fn lp_value_of(&self, user: UserId) -> Amount {
        if self.lp_supply.is_zero() {
            return Amount::zero();
        }
        Amount::new(self.lp_of(user) * self.balance.value() / self.lp_supply)
    }

    // 2-epoch streamer. losses parked in the buffer reach the principal
    // linearly over the rest of the current epoch; a full missed epoch
    // flushes everything at once.
    pub fn stream_buffer(&mut self, now: Timestamp, period_secs: i64) -> Amount {
        if period_secs <= 0 {
            return Amount::zero();
        }

        let epoch_start = Timestamp::from_secs(now.as_secs() / period_secs * period_secs);
        let buffer = self.buffer;
        let mut amount = Amount::zero();

        if self.last_paid.as_secs() < epoch_start.as_secs() - period_secs {
            // more than a grace epoch behind: flush the whole buffer
            amount = buffer;
            self.epoch_remaining = Amount::zero();
        } else {
            let mut paid_from = self.last_paid;
            if paid_from < epoch_start {
                // crossed into a new epoch: emit last epoch's pot, commit the
                // rest of the buffer to the new one
                amount = self.epoch_remaining.min(buffer);
                self.epoch_remaining = buffer.saturating_sub(self.epoch_remaining);
                paid_from = epoch_start;
            }

            if self.epoch_remaining.is_positive() {
                let window = epoch_start.as_secs() + period_secs - paid_from.as_secs();
                if window > 0 {
                    let elapsed = Decimal::from(now.seconds_since(paid_from));
                    let slice = self
                        .epoch_remaining
                        .mul(elapsed / Decimal::from(window))
                        .min(self.epoch_remaining);
                    self.epoch_remaining = self.epoch_remaining.sub(slice);
                    amount = amount.add(slice);
                }
            }

            if amount >= buffer {
                amount = buffer;
                self.epoch_remaining = Amount::zero();
            }
        }

        self.last_paid = now;
        if amount.is_positive() {
            self.buffer = self.buffer.sub(amount);
            self.balance = self.balance.add(amount);
        }
        amount
    }

    /// Park a fresh trader loss in the buffer. Streams first so the loss only
    /// starts paying out from `now`. Returns what the stream moved.
    pub fn credit_trader_loss(
        &mut self,
        amount: Amount,
        now: Timestamp,
        period_secs: i64,
    ) -> Amount {
        let streamed = self.stream_buffer(now, period_secs);
        self.buffer = self.buffer.add(amount);
        streamed
    }

    /// Pay a trader profit out of buffer first, principal second. Checks run
    /// before any mutation so a failed debit leaves the pool untouched.
    pub fn debit_trader_profit(
        &mut self,
        amount: Amount,
        now: Timestamp,
        period_secs: i64,
    ) -> Result<ProfitDebit, PoolError> {
        if amount.is_zero() {
            return Ok(ProfitDebit::default());
        }

        let from_buffer = self.buffer.min(amount);
        let from_principal = amount.sub(from_buffer);
        if from_principal > self.balance {
            return Err(PoolError::InsufficientLiquidity {
                needed: from_principal.value(),
                available: self.balance.value(),
            });
        }

        self.buffer = self.buffer.sub(from_buffer);
        if self.epoch_remaining > self.buffer {
            self.epoch_remaining = self.buffer;
        }
        self.balance = self.balance.sub(from_principal);

        let streamed = self.stream_buffer(now, period_secs);
        Ok(ProfitDebit {
            from_buffer,
            from_principal,
            streamed,
        })
    }

    // 3.1: deposit tax leans against depositors buying in while the pool is
    // owed money (buffer above posted upl). truncated to whole bps like the
    // source system's integer division.
    pub fn deposit_tax(&self, amount: Amount) -> Bps {
        let liability = self.buffer.value() - self.global_upl;
        if liability <= Decimal::ZERO {
            return Bps::zero();
        }
        let denom = self.balance.value() + amount.value();
        if denom <= Decimal::ZERO {
            return Bps::new(BPS);
        }
        truncated_bps(liability / denom)
    }

    // 3.2: withdrawal tax leans the other way: leaving while traders are up
    // costs the upl excess. withdrawing the whole pool is always blocked.
    pub fn withdrawal_tax(&self, amount: Amount) -> Bps {
        if amount >= self.balance {
            return Bps::new(BPS);
        }
        let excess = self.global_upl - self.buffer.value();
        if excess <= Decimal::ZERO {
            return Bps::zero();
        }
        let denom = self.balance.value() - amount.value();
        truncated_bps(excess / denom)
    }

    /// Mint shares for a post-tax deposit. Must run before the principal is
    /// credited so the mint prices against the pre-deposit pool.
    pub fn mint_lp(&mut self, user: UserId, amount_after_tax: Amount) -> Decimal {
        let minted = if self.balance.is_zero() || self.lp_supply.is_zero() {
            amount_after_tax.value()
        } else {
            amount_after_tax.value() * self.lp_supply / self.balance.value()
        };
        *self.user_lp.entry(user).or_insert(Decimal::ZERO) += minted;
        self.lp_supply += minted;
        minted
    }

    /// Burn shares covering a withdrawal of `amount` (pre-tax).
    pub fn burn_lp(&mut self, user: UserId, amount: Amount) -> Decimal {
        if self.balance.is_zero() || self.lp_supply.is_zero() {
            return Decimal::ZERO;
        }
        let burned = (amount.value() * self.lp_supply / self.balance.value())
            .min(self.lp_of(user));
        if let Some(lp) = self.user_lp.get_mut(&user) {
            *lp -= burned;
            if lp.is_zero() {
                self.user_lp.remove(&user);
            }
        }
        self.lp_supply -= burned;
        burned
    }
}

impl Default for PoolState {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a profit payout was taken from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfitDebit {
    pub from_buffer: Amount,
    pub from_principal: Amount,
    pub streamed: Amount,
}

// truncate like the source's integer division, clamp into [0, BPS]
fn truncated_bps(fraction: Decimal) -> Bps {
    let scaled = (fraction * Decimal::from(BPS)).floor();
    Bps::new(scaled.to_u32().unwrap_or(BPS).min(BPS))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("insufficient pool liquidity: needed {needed}, available {available}")]
    InsufficientLiquidity { needed: Decimal, available: Decimal },
}
