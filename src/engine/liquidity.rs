//! Liquidity provision: two-phase deposit/withdraw orders, keeper execution,
//! direct pool gifts and keeper-posted global UPL.
//!
//! Requests escrow value up front (deposits escrow the amount, every order
//! escrows the keeper execution fee); a keeper later executes against the
//! current tax state or the order cancels with a reason code.

use super::core::Engine;
use super::results::{EngineError, LiquidityOutcome};
use crate::custody::Ledger as _;
use crate::events::{
    BookKind, EventPayload, GlobalUplSetEvent, OrderCancelledEvent, OrderCreatedEvent,
    DirectPoolDepositEvent, PoolDepositEvent, PoolWithdrawalEvent,
};
use crate::pool::{LiquidityOrder, LiquidityOrderKind};
use crate::types::{Amount, AssetId, Bps, LiquidityOrderId, UserId, BPS};
use rust_decimal::Decimal;

impl Engine {
    /// Request a pool deposit. Funding accounts may deposit on behalf of
    /// `user`; everyone else deposits for themselves.
    pub fn deposit_request(
        &mut self,
        sender: UserId,
        user: UserId,
        asset: AssetId,
        amount: Amount,
        min_amount_after_tax: Amount,
    ) -> Result<LiquidityOrderId, EngineError> {
        let beneficiary = if self.funding_accounts.contains(&sender) {
            if user.is_zero() {
                return Err(EngineError::InvalidInput("!user"));
            }
            user
        } else {
            sender
        };
        self.submit_liquidity_order(
            sender,
            beneficiary,
            asset,
            LiquidityOrderKind::Deposit,
            amount,
            min_amount_after_tax,
        )
    }

    /// Request a pool withdrawal. The amount is clamped to the caller's LP
    /// claim at execution time.
    pub fn withdraw_request(
        &mut self,
        sender: UserId,
        asset: AssetId,
        amount: Amount,
        min_amount_after_tax: Amount,
    ) -> Result<LiquidityOrderId, EngineError> {
        self.submit_liquidity_order(
            sender,
            sender,
            asset,
            LiquidityOrderKind::Withdraw,
            amount,
            min_amount_after_tax,
        )
    }

    fn submit_liquidity_order(
        &mut self,
        sender: UserId,
        user: UserId,
        asset: AssetId,
        kind: LiquidityOrderKind,
        amount: Amount,
        min_amount_after_tax: Amount,
    ) -> Result<LiquidityOrderId, EngineError> {
        if self.new_orders_paused {
            return Err(EngineError::Paused);
        }
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput("!amount"));
        }
        self.asset_of(asset)?;
        self.pool_of(asset)?;

        let execution_fee = self.config.order_execution_fee;
        let escrow = match kind {
            LiquidityOrderKind::Deposit => amount,
            LiquidityOrderKind::Withdraw => Amount::zero(),
        };

        if asset.is_native() {
            self.ledger
                .transfer_in(AssetId::NATIVE, sender, escrow.add(execution_fee))?;
        } else {
            if escrow.is_positive() {
                self.ledger.transfer_in(asset, sender, escrow)?;
            }
            if execution_fee.is_positive() {
                self.ledger
                    .transfer_in(AssetId::NATIVE, sender, execution_fee)?;
            }
        }
        self.pending_execution_fees = self.pending_execution_fees.add(execution_fee);

        let id = self.liquidity_orders.next_id();
        let order = LiquidityOrder {
            id,
            user,
            asset,
            kind,
            amount,
            min_amount_after_tax,
            timestamp: self.current_time,
            execution_fee,
        };

        self.emit_event(EventPayload::OrderCreated(OrderCreatedEvent {
            book: BookKind::Liquidity,
            order_id: id.0,
            user,
            asset,
            market: None,
            side: None,
            margin: Amount::zero(),
            size: amount,
            fee: Amount::zero(),
            execution_fee,
        }));
        self.liquidity_orders.insert(order);
        Ok(id)
    }

    /// Cancel one of the caller's own pending liquidity orders.
    pub fn cancel_liquidity_order(
        &mut self,
        sender: UserId,
        id: LiquidityOrderId,
    ) -> Result<(), EngineError> {
        self.require_processing_live()?;
        let order = self
            .liquidity_orders
            .get(id)
            .ok_or(EngineError::LiquidityOrderNotFound(id))?;
        if order.user != sender {
            return Err(EngineError::Unauthorized);
        }
        self.cancel_liquidity_internal(id, "user", sender)
    }

    fn cancel_liquidity_internal(
        &mut self,
        id: LiquidityOrderId,
        reason: &str,
        fee_receiver: UserId,
    ) -> Result<(), EngineError> {
        let order = self
            .liquidity_orders
            .remove(id)
            .ok_or(EngineError::LiquidityOrderNotFound(id))?;

        let escrow = order.escrow();
        self.pending_execution_fees = self.pending_execution_fees.sub(order.execution_fee);

        if order.asset.is_native() && fee_receiver == order.user {
            self.ledger
                .transfer_out(AssetId::NATIVE, order.user, escrow.add(order.execution_fee))?;
        } else {
            if escrow.is_positive() {
                self.ledger.transfer_out(order.asset, order.user, escrow)?;
            }
            if order.execution_fee.is_positive() {
                self.ledger
                    .transfer_out(AssetId::NATIVE, fee_receiver, order.execution_fee)?;
            }
        }

        self.emit_event(EventPayload::OrderCancelled(OrderCancelledEvent {
            book: BookKind::Liquidity,
            order_id: id.0,
            user: order.user,
            reason: reason.to_string(),
        }));
        Ok(())
    }

    /// Keeper batch: post fresh global UPLs, stream the named pools, then
    /// execute the orders. Failing orders cancel with their reason.
    pub fn execute_liquidity_orders(
        &mut self,
        keeper: UserId,
        ids: &[LiquidityOrderId],
        assets: &[AssetId],
        upls: &[Decimal],
    ) -> Result<Vec<(LiquidityOrderId, LiquidityOutcome)>, EngineError> {
        self.require_keeper(keeper)?;
        self.require_processing_live()?;
        self.apply_global_upls(assets, upls)?;
        for &asset in assets {
            self.stream_pool_buffer(asset);
        }

        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = match self.execute_liquidity_order(id, keeper) {
                Ok(()) => LiquidityOutcome::Executed,
                Err(err) => {
                    let code = err.code().to_string();
                    if self.liquidity_orders.get(id).is_some() {
                        self.cancel_liquidity_internal(id, &code, keeper)?;
                    }
                    LiquidityOutcome::Cancelled(code)
                }
            };
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    /// Keeper-posted aggregate unrealized P&L per asset, biasing the taxes.
    pub fn set_global_upls(
        &mut self,
        keeper: UserId,
        assets: &[AssetId],
        upls: &[Decimal],
    ) -> Result<(), EngineError> {
        self.require_keeper(keeper)?;
        self.apply_global_upls(assets, upls)
    }

    fn apply_global_upls(
        &mut self,
        assets: &[AssetId],
        upls: &[Decimal],
    ) -> Result<(), EngineError> {
        if assets.len() != upls.len() {
            return Err(EngineError::InvalidInput("!length"));
        }
        for (&asset, &upl) in assets.iter().zip(upls) {
            let pool = self.pool_mut(asset)?;
            pool.global_upl = upl;
            self.emit_event(EventPayload::GlobalUPLSet(GlobalUplSetEvent { asset, upl }));
        }
        Ok(())
    }

    /// A no-strings gift to the pool buffer. Mints no shares.
    pub fn direct_pool_deposit(
        &mut self,
        sender: UserId,
        asset: AssetId,
        amount: Amount,
    ) -> Result<(), EngineError> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidInput("!amount"));
        }
        self.asset_of(asset)?;
        self.pool_of(asset)?;

        self.stream_pool_buffer(asset);
        self.ledger.transfer_in(asset, sender, amount)?;
        let pool = self.pool_mut(asset)?;
        pool.buffer = pool.buffer.add(amount);

        self.emit_event(EventPayload::DirectPoolDeposit(DirectPoolDepositEvent {
            user: sender,
            asset,
            amount,
        }));
        Ok(())
    }

    fn execute_liquidity_order(
        &mut self,
        id: LiquidityOrderId,
        keeper: UserId,
    ) -> Result<(), EngineError> {
        let order = self
            .liquidity_orders
            .get(id)
            .ok_or(EngineError::LiquidityOrderNotFound(id))?
            .clone();
        if order.amount.is_zero() {
            return Err(EngineError::LiquidityOrderNotFound(id));
        }

        let age = self.current_time.seconds_since(order.timestamp);
        if age > self.config.max_liquidity_order_ttl {
            return Err(EngineError::Expired);
        }

        match order.kind {
            LiquidityOrderKind::Deposit => self.execute_deposit(&order)?,
            LiquidityOrderKind::Withdraw => self.execute_withdrawal(&order)?,
        }

        self.liquidity_orders.remove(id);
        self.pending_execution_fees = self.pending_execution_fees.sub(order.execution_fee);
        if order.execution_fee.is_positive() {
            self.ledger
                .transfer_out(AssetId::NATIVE, keeper, order.execution_fee)?;
        }
        Ok(())
    }

    fn execute_deposit(&mut self, order: &LiquidityOrder) -> Result<(), EngineError> {
        let pool = self.pool_of(order.asset)?;
        let tax = pool.deposit_tax(order.amount);
        if tax.value() >= BPS {
            return Err(EngineError::TaxExceedsBps);
        }
        let amount_after_tax = order.amount.mul(tax.complement_fraction());
        if amount_after_tax < order.min_amount_after_tax {
            return Err(EngineError::MinAmountAfterTax);
        }

        let pool = self.pool_mut(order.asset)?;
        let lp_minted = pool.mint_lp(order.user, amount_after_tax);
        // the full amount lands in the principal; the taxed slice dilutes in
        // favor of existing holders
        pool.balance = pool.balance.add(order.amount);
        let pool_balance = pool.balance;

        self.emit_event(EventPayload::PoolDeposit(PoolDepositEvent {
            user: order.user,
            asset: order.asset,
            amount: order.amount,
            tax_bps: tax.value(),
            lp_minted,
            pool_balance,
        }));
        Ok(())
    }

    fn execute_withdrawal(&mut self, order: &LiquidityOrder) -> Result<(), EngineError> {
        let pool = self.pool_of(order.asset)?;
        let claim = pool.lp_value_of(order.user);
        let amount = order.amount.min(claim);
        if amount.is_zero() {
            return Err(EngineError::InvalidInput("!zero-amount"));
        }

        // withdrawals must leave enough liquidity behind for open interest
        let multiplier = Bps::new(pool.utilization_multiplier.value().max(BPS));
        let remaining = pool.balance.sub(amount);
        let required = self.asset_open_interest(order.asset).total();
        if remaining.value() * multiplier.as_fraction() < required {
            return Err(EngineError::InvalidInput("!not-available-liquidity"));
        }

        let tax = pool.withdrawal_tax(amount);
        if tax.value() >= BPS {
            return Err(EngineError::TaxExceedsBps);
        }
        let amount_after_tax = amount.mul(tax.complement_fraction());
        if amount_after_tax < order.min_amount_after_tax {
            return Err(EngineError::MinAmountAfterTax);
        }

        let pool = self.pool_mut(order.asset)?;
        let lp_burned = pool.burn_lp(order.user, amount);
        pool.balance = pool.balance.sub(amount_after_tax);
        let pool_balance = pool.balance;

        self.ledger
            .transfer_out(order.asset, order.user, amount_after_tax)?;

        self.emit_event(EventPayload::PoolWithdrawal(PoolWithdrawalEvent {
            user: order.user,
            asset: order.asset,
            amount,
            tax_bps: tax.value(),
            amount_after_tax,
            lp_burned,
            pool_balance,
        }));
        Ok(())
    }
}
