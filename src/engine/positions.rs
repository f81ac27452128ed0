//! Position management: increases, decreases, direction flips, margin
//! operations and fee distribution.
//!
//! All fallible checks run before state moves, so a failing item inside a
//! keeper batch cancels cleanly without leaving a half-applied position.

use super::core::Engine;
use super::results::EngineError;
use crate::custody::Ledger as _;
use crate::events::{
    EventPayload, FeePaidEvent, MarginChangedEvent, OrderExecutedEvent, PoolPayInEvent,
    PoolPayOutEvent, PositionDecreasedEvent, PositionIncreasedEvent,
};
use crate::order::{Order, OrderKind};
use crate::position::{average_entry_price, position_pnl, Position, PositionKey};
use crate::types::{Amount, AssetId, MarketId, OrderId, Price, Timestamp, UserId};
use rust_decimal::Decimal;

impl Engine {
    /// Open or grow a position from an executed order.
    pub(super) fn increase_position(
        &mut self,
        order_id: OrderId,
        price: Price,
        keeper: UserId,
    ) -> Result<(), EngineError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?
            .clone();

        let total_oi = self.open_interest(order.asset, order.market).total();
        self.risk
            .check_max_oi(order.asset, order.market, total_oi, order.size)?;

        self.orders.remove(order_id);
        self.apply_increase(&order, price, keeper)
    }

    /// Shared increase path, also entered once for the flip remainder of a
    /// direction-crossing decrease.
    fn apply_increase(
        &mut self,
        order: &Order,
        price: Price,
        keeper: UserId,
    ) -> Result<(), EngineError> {
        self.update_funding(order.asset, order.market);
        self.increment_oi(order.asset, order.market, order.side, order.size);

        let key = PositionKey::new(order.user, order.asset, order.market);
        let position = match self.positions.get(&key) {
            Some(existing) => {
                let mut position = existing.clone();
                position.avg_price =
                    average_entry_price(position.size, position.avg_price, order.size, price);
                position.size = position.size.add(order.size);
                position.margin = position.margin.add(order.margin);
                position
            }
            None => Position {
                user: order.user,
                asset: order.asset,
                market: order.market,
                side: order.side,
                size: order.size,
                margin: order.margin,
                avg_price: price,
                timestamp: self.current_time,
                funding_snapshot: self.funding.current(order.asset, order.market),
            },
        };

        let new_size = position.size;
        let new_margin = position.margin;
        let new_avg_price = position.avg_price;
        self.insert_position(position);

        self.credit_fee(
            order.user,
            order.asset,
            order.market,
            order.fee,
            order.execution_fee,
            false,
            keeper,
        )?;

        self.last_increased
            .insert((order.user, order.market), self.current_time);

        self.emit_event(EventPayload::OrderExecuted(OrderExecutedEvent {
            order_id: order.id,
            user: order.user,
            asset: order.asset,
            market: order.market,
            side: order.side,
            size: order.size,
            price,
        }));
        self.emit_event(EventPayload::PositionIncreased(PositionIncreasedEvent {
            user: order.user,
            asset: order.asset,
            market: order.market,
            side: order.side,
            size_added: order.size,
            margin_added: order.margin,
            price,
            new_size,
            new_margin,
            new_avg_price,
        }));

        Ok(())
    }

    /// Close a position (partially or fully) from an executed opposite-side
    /// order. A non-reduce-only order larger than the position flips the
    /// remainder into a fresh opposite position, exactly one level deep.
    pub(super) fn decrease_position(
        &mut self,
        order_id: OrderId,
        price: Price,
        is_trailing_stop: bool,
        keeper: UserId,
    ) -> Result<(), EngineError> {
        let order = self
            .orders
            .get(order_id)
            .ok_or(EngineError::OrderNotFound(order_id))?
            .clone();

        let opened_at = self
            .last_increased
            .get(&(order.user, order.market))
            .copied()
            .unwrap_or(Timestamp::from_secs(0));
        if self.current_time.seconds_since(opened_at) <= self.config.min_position_hold_time {
            return Err(EngineError::MinHoldTime);
        }

        let key = PositionKey::new(order.user, order.asset, order.market);
        let position = self
            .positions
            .get(&key)
            .ok_or(EngineError::PositionNotFound(key))?
            .clone();

        let mut executed = position.size.min(order.size);
        let remaining_order_size = order.size.sub(executed);
        let mut amount_to_return = Amount::zero();
        if !order.reduce_only {
            // refund the executed slice of the order's own escrowed margin
            amount_to_return =
                amount_to_return.add(order.margin.mul(ratio(executed, order.size)));
        }

        let left_open = position.size.sub(executed);
        if left_open.is_positive() {
            let min_size = self.asset_of(order.asset)?.min_size;
            if left_open < min_size {
                return Err(EngineError::MinRemainingSize);
            }
        }

        // a direction flip must clear the OI cap up front: after the close
        // has applied this command can no longer be rejected whole
        if remaining_order_size.is_positive() && !order.reduce_only {
            let projected_oi = self.open_interest(order.asset, order.market).total()
                - executed.value();
            self.risk.check_max_oi(
                order.asset,
                order.market,
                projected_oi,
                remaining_order_size,
            )?;
        }

        // prorated fee; trailing stops pay a surcharge on the executed size
        let trailing_surcharge = if is_trailing_stop {
            executed.mul(self.config.trailing_stop_fee.as_fraction())
        } else {
            Amount::zero()
        };
        let fee = order
            .fee
            .add(trailing_surcharge)
            .mul(ratio(executed, order.size));

        self.update_funding(order.asset, order.market);
        let funding_index = self.projected_funding(order.asset, order.market);
        let (mut pnl, funding_fee) = position_pnl(
            position.side,
            price,
            position.avg_price,
            executed,
            position.funding_snapshot,
            funding_index,
        );

        let mut executed_margin = position.margin.mul(ratio(executed, position.size));
        let mut new_position = position.clone();
        if pnl <= -executed_margin.value() {
            // margin wiped: force a full close
            executed_margin = position.margin;
            executed = position.size;
            pnl = -executed_margin.value();
            new_position.size = Amount::zero();
            new_position.margin = Amount::zero();
        } else {
            new_position.size = new_position.size.sub(executed);
            new_position.margin = new_position.margin.sub(executed_margin);
            new_position.funding_snapshot = funding_index;
        }

        // reduce-only orders pay the fee out of position margin; flip orders
        // escrowed theirs at submission
        let fee_from_margin = if order.reduce_only {
            fee.min(executed_margin)
        } else {
            Amount::zero()
        };

        let pool_balance = self.pool_of(order.asset)?.balance;
        self.risk
            .check_pool_drawdown(order.asset, pnl, pool_balance, self.current_time)?;

        if pnl < Decimal::ZERO {
            // the margin covers the fee first, the pool absorbs the rest
            let pool_credit = Amount::new(-pnl).min(executed_margin.saturating_sub(fee_from_margin));
            self.pool_pay_in(order.user, order.asset, order.market, pool_credit);
            let total_loss = pool_credit.add(fee_from_margin);
            if total_loss < executed_margin {
                amount_to_return = amount_to_return.add(executed_margin.sub(total_loss));
            }
        } else {
            self.pool_pay_out(order.user, order.asset, order.market, Amount::new(pnl))?;
            amount_to_return = amount_to_return.add(executed_margin.sub(fee_from_margin));
        }

        self.decrement_oi(order.asset, order.market, position.side, executed);

        let remaining_size = new_position.size;
        if new_position.is_empty() {
            self.remove_position(key);
        } else {
            self.insert_position(new_position);
        }

        self.orders.remove(order.id);

        self.credit_fee(
            order.user,
            order.asset,
            order.market,
            fee,
            order.execution_fee,
            false,
            keeper,
        )?;

        if amount_to_return.is_positive() {
            self.ledger
                .transfer_out(order.asset, order.user, amount_to_return)?;
        }

        self.emit_event(EventPayload::OrderExecuted(OrderExecutedEvent {
            order_id: order.id,
            user: order.user,
            asset: order.asset,
            market: order.market,
            side: order.side,
            size: executed,
            price,
        }));
        self.emit_event(EventPayload::PositionDecreased(PositionDecreasedEvent {
            user: order.user,
            asset: order.asset,
            market: order.market,
            side: position.side,
            size_closed: executed,
            margin_released: executed_margin,
            price,
            pnl,
            funding_fee,
            remaining_size,
            amount_returned: amount_to_return,
        }));

        // direction flip: the unexecuted remainder opens the other way.
        // recursion is impossible because the position is now gone.
        if remaining_order_size.is_positive() && !order.reduce_only {
            let flip = Order {
                id: order.id,
                user: order.user,
                asset: order.asset,
                market: order.market,
                side: order.side,
                margin: order.margin.mul(ratio(remaining_order_size, order.size)),
                size: remaining_order_size,
                fee: order.fee.mul(ratio(remaining_order_size, order.size)),
                timestamp: self.current_time,
                kind: OrderKind::Market,
                reduce_only: false,
                trigger_price: None,
                expiry: None,
                cancel_on_execute: None,
                execution_fee: Amount::zero(),
                trailing_stop: None,
            };
            self.apply_increase(&flip, price, keeper)?;
        }

        Ok(())
    }

    // ---- margin operations ----

    /// Add margin to an open position, lowering its leverage.
    pub fn add_margin(
        &mut self,
        sender: UserId,
        asset: AssetId,
        market: MarketId,
        margin: Amount,
    ) -> Result<(), EngineError> {
        self.require_processing_live()?;
        if !margin.is_positive() {
            return Err(EngineError::InvalidInput("!margin"));
        }

        let key = PositionKey::new(sender, asset, market);
        let position = self
            .positions
            .get(&key)
            .ok_or(EngineError::PositionNotFound(key))?;

        let new_margin = position.margin.add(margin);
        // leverage may not drop below 1x
        if position.size.value() / new_margin.value() < Decimal::ONE {
            return Err(EngineError::InvalidInput("!min-leverage"));
        }

        self.ledger.transfer_in(asset, sender, margin)?;
        let position = self.positions.get_mut(&key).expect("checked above");
        position.margin = new_margin;

        self.emit_event(EventPayload::MarginIncreased(MarginChangedEvent {
            user: sender,
            asset,
            market,
            delta: margin,
            new_margin,
        }));
        Ok(())
    }

    /// Remove margin from an open position. Blocked when the position is
    /// under water past the configured cushion.
    pub fn remove_margin(
        &mut self,
        sender: UserId,
        asset: AssetId,
        market: MarketId,
        margin: Amount,
    ) -> Result<(), EngineError> {
        self.require_processing_live()?;
        if !margin.is_positive() {
            return Err(EngineError::InvalidInput("!margin"));
        }

        let key = PositionKey::new(sender, asset, market);
        let position = self
            .positions
            .get(&key)
            .ok_or(EngineError::PositionNotFound(key))?
            .clone();

        if position.margin <= margin {
            return Err(EngineError::InsufficientMargin);
        }
        let new_margin = position.margin.sub(margin);

        let market_cfg = self.market_of(market)?;
        if position.size.value() / new_margin.value() > market_cfg.max_leverage {
            return Err(EngineError::InvalidInput("!max-leverage"));
        }

        let price = self
            .reference_price(market_cfg)
            .ok_or(EngineError::PriceUnavailable)?;

        let funding_index = self.projected_funding(asset, market);
        let (pnl, _) = position_pnl(
            position.side,
            price,
            position.avg_price,
            position.size,
            position.funding_snapshot,
            funding_index,
        );
        if pnl < Decimal::ZERO {
            let headroom =
                new_margin.value() * self.config.remove_margin_buffer.complement_fraction();
            if -pnl >= headroom {
                return Err(EngineError::InvalidInput("!upl"));
            }
        }

        let position = self.positions.get_mut(&key).expect("checked above");
        position.margin = new_margin;
        self.ledger.transfer_out(asset, sender, margin)?;

        self.emit_event(EventPayload::MarginDecreased(MarginChangedEvent {
            user: sender,
            asset,
            market,
            delta: margin,
            new_margin,
        }));
        Ok(())
    }

    // ---- fee and pool flows ----

    /// Split a trading fee between keeper, pool and treasury, and release the
    /// order's keeper execution fee.
    pub(super) fn credit_fee(
        &mut self,
        user: UserId,
        asset: AssetId,
        market: MarketId,
        fee: Amount,
        execution_fee: Amount,
        is_liquidation: bool,
        keeper: UserId,
    ) -> Result<(), EngineError> {
        let keeper_fee = fee.mul(self.config.keeper_fee_share.as_fraction());
        let net = fee.sub(keeper_fee);
        let fee_to_pool = net.mul(self.config.pool_fee_share.as_fraction());
        let fee_to_treasury = net.sub(fee_to_pool);

        {
            let pool = self.pool_mut(asset)?;
            pool.balance = pool.balance.add(fee_to_pool);
            pool.fee_reserve = pool.fee_reserve.add(fee_to_treasury);
        }

        if keeper_fee.is_positive() {
            self.ledger.transfer_out(asset, keeper, keeper_fee)?;
        }
        if execution_fee.is_positive() {
            self.pending_execution_fees = self.pending_execution_fees.sub(execution_fee);
            self.ledger
                .transfer_out(AssetId::NATIVE, keeper, execution_fee)?;
        }

        self.emit_event(EventPayload::FeePaid(FeePaidEvent {
            user,
            asset,
            market,
            fee,
            pool_fee: fee_to_pool,
            treasury_fee: fee_to_treasury,
            keeper_fee,
            is_liquidation,
        }));
        Ok(())
    }

    /// Park a trader loss in the pool buffer.
    pub(super) fn pool_pay_in(
        &mut self,
        user: UserId,
        asset: AssetId,
        market: MarketId,
        amount: Amount,
    ) {
        self.stream_pool_buffer(asset);
        let Some(pool) = self.pools.get_mut(&asset) else {
            return;
        };
        pool.buffer = pool.buffer.add(amount);
        let buffer_balance = pool.buffer;

        self.emit_event(EventPayload::PoolPayIn(PoolPayInEvent {
            user,
            asset,
            market,
            amount,
            buffer_balance,
        }));
    }

    /// Pay a trader profit out of the pool and transfer it to the user.
    pub(super) fn pool_pay_out(
        &mut self,
        user: UserId,
        asset: AssetId,
        market: MarketId,
        amount: Amount,
    ) -> Result<(), EngineError> {
        if amount.is_zero() {
            return Ok(());
        }
        let now = self.current_time;
        let period = self.config.buffer_payout_period;
        let debit = {
            let pool = self.pool_mut(asset)?;
            pool.debit_trader_profit(amount, now, period)?
        };
        if debit.streamed.is_positive() {
            let pool = self.pool_of(asset)?;
            let (buffer_balance, pool_balance) = (pool.buffer, pool.balance);
            self.emit_event(EventPayload::BufferToPool(crate::events::BufferToPoolEvent {
                asset,
                amount: debit.streamed,
                buffer_balance,
                pool_balance,
            }));
        }

        self.ledger.transfer_out(asset, user, amount)?;

        self.emit_event(EventPayload::PoolPayOut(PoolPayOutEvent {
            user,
            asset,
            market,
            amount,
            from_buffer: debit.from_buffer,
            from_principal: debit.from_principal,
        }));
        Ok(())
    }
}

/// `numerator / denominator` as a plain factor; zero denominator yields zero.
fn ratio(numerator: Amount, denominator: Amount) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator.value() / denominator.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{Ledger, MemoryLedger};
    use crate::engine::EngineConfig;
    use crate::market::{Asset, Market};
    use crate::price_feed::{MemoryPriceFeed, MemoryReferenceFeed, ReferencePriceFeed};
    use crate::types::Side;
    use rust_decimal_macros::dec;

    const USDC: AssetId = AssetId(1);
    const ALICE: UserId = UserId(1);

    fn eth() -> MarketId {
        MarketId::from_tag("ETH-USD")
    }

    fn setup_engine() -> Engine {
        let mut ledger = MemoryLedger::new();
        ledger.mint(USDC, ALICE, Amount::new(dec!(1_000_000)));

        let mut reference = MemoryReferenceFeed::new();
        reference.push(Market::eth_usd().reference_feed_id, Price::new(dec!(2_000)));

        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(ledger),
            Box::new(MemoryPriceFeed::new()),
            Box::new(MemoryReferenceFeed::new()),
        )
        .unwrap();
        engine.reference_feed = Box::new(reference);
        engine.set_asset(USDC, Asset::usdc()).unwrap();
        engine.set_market(eth(), Market::eth_usd()).unwrap();
        engine.set_time(Timestamp::from_secs(1_000));
        engine
    }

    fn open_long(engine: &mut Engine, margin: Decimal, size: Decimal) {
        let position = Position {
            user: ALICE,
            asset: USDC,
            market: eth(),
            side: Side::Long,
            size: Amount::new(size),
            margin: Amount::new(margin),
            avg_price: Price::new_unchecked(dec!(2_000)),
            timestamp: engine.time(),
            funding_snapshot: Decimal::ZERO,
        };
        engine
            .ledger
            .transfer_in(USDC, ALICE, Amount::new(margin))
            .unwrap();
        engine.insert_position(position);
        engine.increment_oi(USDC, eth(), Side::Long, Amount::new(size));
    }

    #[test]
    fn add_margin_lowers_leverage() {
        let mut engine = setup_engine();
        open_long(&mut engine, dec!(10_000), dec!(100_000));

        engine
            .add_margin(ALICE, USDC, eth(), Amount::new(dec!(5_000)))
            .unwrap();
        let position = engine.position(ALICE, USDC, eth()).unwrap();
        assert_eq!(position.margin.value(), dec!(15_000));
    }

    #[test]
    fn add_margin_cannot_push_below_one_x() {
        let mut engine = setup_engine();
        open_long(&mut engine, dec!(10_000), dec!(100_000));

        let err = engine
            .add_margin(ALICE, USDC, eth(), Amount::new(dec!(95_000)))
            .unwrap_err();
        assert_eq!(err.code(), "!min-leverage");
    }

    #[test]
    fn remove_margin_respects_max_leverage() {
        let mut engine = setup_engine();
        open_long(&mut engine, dec!(10_000), dec!(100_000));

        // 100_000 / 1_000 = 100x > 50x cap
        let err = engine
            .remove_margin(ALICE, USDC, eth(), Amount::new(dec!(9_000)))
            .unwrap_err();
        assert_eq!(err.code(), "!max-leverage");

        // 100_000 / 5_000 = 20x is fine
        engine
            .remove_margin(ALICE, USDC, eth(), Amount::new(dec!(5_000)))
            .unwrap();
        assert_eq!(
            engine.position(ALICE, USDC, eth()).unwrap().margin.value(),
            dec!(5_000)
        );
        assert_eq!(
            engine.ledger().balance_of(USDC, ALICE).value(),
            dec!(995_000)
        );
    }

    #[test]
    fn remove_margin_blocked_under_water() {
        let mut engine = setup_engine();
        open_long(&mut engine, dec!(10_000), dec!(100_000));

        // mark the reference well below entry: upl = 100_000 * (-200/2000) = -10_000
        engine.push_reference_price(Market::eth_usd().reference_feed_id, Price::new(dec!(1_800)));

        let err = engine
            .remove_margin(ALICE, USDC, eth(), Amount::new(dec!(2_000)))
            .unwrap_err();
        assert_eq!(err.code(), "!upl");
    }

    #[test]
    fn remove_margin_needs_reference_price() {
        let mut engine = setup_engine();
        open_long(&mut engine, dec!(10_000), dec!(100_000));
        engine.push_reference_price(Market::eth_usd().reference_feed_id, None);

        let err = engine
            .remove_margin(ALICE, USDC, eth(), Amount::new(dec!(1_000)))
            .unwrap_err();
        assert!(matches!(err, EngineError::PriceUnavailable));
    }

    #[test]
    fn credit_fee_splits_three_ways() {
        let mut engine = setup_engine();
        // park fee money in custody the way an order escrow would
        engine
            .ledger
            .transfer_in(USDC, ALICE, Amount::new(dec!(100)))
            .unwrap();

        engine
            .credit_fee(
                ALICE,
                USDC,
                eth(),
                Amount::new(dec!(100)),
                Amount::zero(),
                false,
                UserId(50),
            )
            .unwrap();

        // keeper 10% = 10, net 90: pool 50% = 45, treasury 45
        let pool = engine.pool(USDC).unwrap();
        assert_eq!(pool.balance.value(), dec!(45));
        assert_eq!(pool.fee_reserve.value(), dec!(45));
        assert_eq!(engine.ledger().balance_of(USDC, UserId(50)).value(), dec!(10));
    }

    #[test]
    fn pool_pay_in_lands_in_buffer() {
        let mut engine = setup_engine();
        engine
            .ledger
            .transfer_in(USDC, ALICE, Amount::new(dec!(500)))
            .unwrap();

        engine.pool_pay_in(ALICE, USDC, eth(), Amount::new(dec!(500)));
        assert_eq!(engine.pool(USDC).unwrap().buffer.value(), dec!(500));
    }

    #[test]
    fn pool_pay_out_fails_on_empty_pool() {
        let mut engine = setup_engine();
        let err = engine
            .pool_pay_out(ALICE, USDC, eth(), Amount::new(dec!(1_000)))
            .unwrap_err();
        assert_eq!(err.code(), "!insufficient-pool");
    }
}
