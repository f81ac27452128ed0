//! Order submission and cancellation.
//!
//! One logical submit builds the main order plus up to two attached
//! reduce-only orders (stop-loss or trailing-stop, then take-profit), links
//! the pair OCO-style, and escrows margin, fee and keeper execution fees in a
//! single ledger pull. Validation runs to completion before any funds move so
//! a rejected submit leaves no partial state.

use super::core::Engine;
use super::results::EngineError;
use crate::custody::{Ledger as _, ReferralDirectory as _, SignatureVerifier as _};
use crate::events::{BookKind, EventPayload, OrderCancelledEvent, OrderCreatedEvent};
use crate::order::{Order, OrderKind, MAX_TRAILING_STOP_BPS};
use crate::types::{Amount, AssetId, Bps, MarketId, OrderId, Price, Side, Timestamp, UserId};
use rust_decimal::Decimal;

/// Caller-supplied order fields. `user` is honored only for whitelisted
/// funding accounts; everyone else trades for themselves.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub margin: Amount,
    pub size: Amount,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub trigger_price: Option<Price>,
    pub expiry: Option<Timestamp>,
    pub cancel_on_execute: Option<OrderId>,
    pub trailing_stop: Option<Bps>,
}

/// Optional protective orders created alongside the main order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Attached {
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub trailing_stop: Option<Bps>,
}

impl Attached {
    pub fn none() -> Self {
        Self::default()
    }

    fn any(&self) -> bool {
        self.take_profit.is_some() || self.stop_loss.is_some() || self.trailing_stop.is_some()
    }
}

impl Engine {
    /// Submit an order with optional attached TP/SL/trailing-stop.
    ///
    /// Returns the created order ids, main order first.
    pub fn submit_order(
        &mut self,
        sender: UserId,
        request: OrderRequest,
        attached: Attached,
        referral_code: Option<u64>,
        signature: Option<&[u8]>,
    ) -> Result<Vec<OrderId>, EngineError> {
        if self.new_orders_paused {
            return Err(EngineError::Paused);
        }
        self.check_approval(sender, signature)?;

        let mut request = request;

        // attached protections only make sense on an opening order
        if attached.any() {
            request.reduce_only = false;
        }

        // closes against an existing position only
        if request.kind == OrderKind::TrailingStop || request.reduce_only {
            let open = self
                .position(request.user, request.asset, request.market)
                .or_else(|| self.position(sender, request.asset, request.market));
            match open {
                Some(position) if position.side == request.side.opposite() => {}
                _ => return Err(EngineError::InvalidInput("!no-position")),
            }
        }
        if request.kind == OrderKind::TrailingStop {
            request.trigger_price = None;
        }

        // funding accounts may name the beneficiary; everyone else is themself
        if self.funding_accounts.contains(&sender) {
            if request.user.is_zero() || request.reduce_only || request.kind != OrderKind::Market {
                return Err(EngineError::InvalidInput("!funding-account-order"));
            }
        } else {
            request.user = sender;
        }
        if request.user != sender {
            request.cancel_on_execute = None;
        }

        self.validate_request(&request)?;

        let execution_fee = self.config.order_execution_fee;
        let main_fee = self.order_fee(&request)?;

        let aux_requests = self.build_attached(&request, &attached)?;
        for aux in &aux_requests {
            self.validate_request(aux)?;
        }

        // OI gate before any funds move
        if !request.reduce_only {
            let total_oi = self.open_interest(request.asset, request.market).total();
            self.risk
                .check_max_oi(request.asset, request.market, total_oi, request.size)?;
        }

        let order_count = 1 + aux_requests.len();
        let total_execution_fee = execution_fee.mul(Decimal::from(order_count as u64));
        self.pull_submission_funds(sender, &request, main_fee, total_execution_fee)?;

        // ids assigned only after everything that can fail has passed
        let main_id = self.orders.next_id();
        let mut ids = vec![main_id];
        let mut aux_orders: Vec<Order> = Vec::with_capacity(aux_requests.len());
        for aux in &aux_requests {
            let id = self.orders.next_id();
            ids.push(id);
            let fee = self.order_fee(aux)?;
            aux_orders.push(self.materialize(id, aux, fee, execution_fee));
        }

        // SL/TS and TP cancel each other on execution
        if aux_orders.len() == 2 {
            let (first, second) = (aux_orders[0].id, aux_orders[1].id);
            aux_orders[0].cancel_on_execute = Some(second);
            aux_orders[1].cancel_on_execute = Some(first);
        }

        let main_order = self.materialize(main_id, &request, main_fee, execution_fee);
        self.insert_and_announce(main_order);
        for order in aux_orders {
            self.insert_and_announce(order);
        }

        if let (Some(code), Some(directory)) = (referral_code, self.referrals.as_mut()) {
            if code != 0 {
                directory.set(request.user, code);
            }
        }

        Ok(ids)
    }

    /// Cancel one of the caller's own orders.
    pub fn cancel_order(&mut self, sender: UserId, id: OrderId) -> Result<(), EngineError> {
        self.require_processing_live()?;
        let order = self.orders.get(id).ok_or(EngineError::OrderNotFound(id))?;
        if order.user != sender {
            return Err(EngineError::Unauthorized);
        }
        self.cancel_order_internal(id, "user", sender)
    }

    pub fn cancel_orders(&mut self, sender: UserId, ids: &[OrderId]) -> Result<(), EngineError> {
        for &id in ids {
            self.cancel_order(sender, id)?;
        }
        Ok(())
    }

    /// Remove an order, refunding escrow to its owner and the execution fee
    /// to `fee_receiver`. Used for user cancels (receiver = owner), keeper
    /// cancels and OCO cancellation.
    pub(super) fn cancel_order_internal(
        &mut self,
        id: OrderId,
        reason: &str,
        fee_receiver: UserId,
    ) -> Result<(), EngineError> {
        let order = self
            .orders
            .remove(id)
            .ok_or(EngineError::OrderNotFound(id))?;

        let escrow = order.escrow();
        self.pending_execution_fees = self.pending_execution_fees.sub(order.execution_fee);

        if order.asset.is_native() && fee_receiver == order.user {
            // one native transfer covers escrow and fee
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
            book: BookKind::Trade,
            order_id: id.0,
            user: order.user,
            reason: reason.to_string(),
        }));
        Ok(())
    }

    // ---- submission internals ----

    fn check_approval(&mut self, sender: UserId, signature: Option<&[u8]>) -> Result<(), EngineError> {
        if self.approved_accounts.contains(&sender) {
            return Ok(());
        }
        let verified = match (self.verifier.as_ref(), signature) {
            // no verifier configured: the gate is disabled
            (None, _) => true,
            (Some(verifier), Some(sig)) => verifier.verify(sender, sig),
            (Some(_), None) => false,
        };
        if !verified {
            return Err(EngineError::Unauthorized);
        }
        if self.verifier.is_some() {
            self.approved_accounts.insert(sender);
        }
        Ok(())
    }

    fn order_fee(&self, request: &OrderRequest) -> Result<Amount, EngineError> {
        let market = self.market_of(request.market)?;
        Ok(request.size.mul(market.fee.as_fraction()))
    }

    fn validate_request(&self, request: &OrderRequest) -> Result<(), EngineError> {
        let asset = self.asset_of(request.asset)?;
        let market = self.market_of(request.market)?;

        match request.kind {
            OrderKind::Limit | OrderKind::Stop => {
                if request.trigger_price.is_none() {
                    return Err(EngineError::InvalidInput("!trigger-price"));
                }
            }
            OrderKind::TrailingStop => {
                let bps = request
                    .trailing_stop
                    .ok_or(EngineError::InvalidInput("!trailing-stop"))?;
                if bps.is_zero() || bps.value() > MAX_TRAILING_STOP_BPS {
                    return Err(EngineError::InvalidInput("!trailing-stop"));
                }
                if !request.reduce_only {
                    return Err(EngineError::InvalidInput("!trailing-stop"));
                }
            }
            OrderKind::Market => {}
        }

        if !request.reduce_only {
            if market.is_reduce_only {
                return Err(EngineError::InvalidInput("!market-reduce-only"));
            }
            if request.size < asset.min_size {
                return Err(EngineError::InvalidInput("!min-size"));
            }
            if !request.margin.is_positive() {
                return Err(EngineError::InsufficientMargin);
            }
            let leverage = request.size.value() / request.margin.value();
            if leverage < Decimal::ONE || leverage > market.max_leverage {
                return Err(EngineError::InvalidInput("!leverage"));
            }
        }

        if let Some(expiry) = request.expiry {
            let ttl_cap = if request.kind.is_market() {
                self.config.max_market_order_ttl
            } else {
                self.config.max_trigger_order_ttl
            };
            if expiry < self.current_time || expiry > self.current_time.plus(ttl_cap) {
                return Err(EngineError::InvalidInput("!expiry"));
            }
        }

        if let Some(sibling) = request.cancel_on_execute {
            match self.orders.get(sibling) {
                Some(other) if other.user == request.user => {}
                _ => return Err(EngineError::InvalidInput("!cancel-order")),
            }
        }

        Ok(())
    }

    fn build_attached(
        &self,
        main: &OrderRequest,
        attached: &Attached,
    ) -> Result<Vec<OrderRequest>, EngineError> {
        let mut aux = Vec::new();
        if !attached.any() {
            return Ok(aux);
        }

        let close_side = main.side.opposite();
        let trigger = main.trigger_price;

        if let (Some(tp), Some(sl)) = (attached.take_profit, attached.stop_loss) {
            let consistent = match main.side {
                Side::Long => tp > sl,
                Side::Short => tp < sl,
            };
            if !consistent {
                return Err(EngineError::InvalidInput("!tp-sl"));
            }
        }
        if let (Some(tp), Some(trigger)) = (attached.take_profit, trigger) {
            let ok = match main.side {
                Side::Long => tp > trigger,
                Side::Short => tp < trigger,
            };
            if !ok {
                return Err(EngineError::InvalidInput("!tp-invalid"));
            }
        }
        if let (Some(sl), Some(trigger)) = (attached.stop_loss, trigger) {
            let ok = match main.side {
                Side::Long => sl < trigger,
                Side::Short => sl > trigger,
            };
            if !ok {
                return Err(EngineError::InvalidInput("!sl-invalid"));
            }
        }
        if attached.stop_loss.is_some() && attached.trailing_stop.is_some() {
            return Err(EngineError::InvalidInput("!sl-and-trailing"));
        }

        let protective = |kind: OrderKind, trigger_price: Option<Price>, trailing: Option<Bps>| {
            OrderRequest {
                user: main.user,
                asset: main.asset,
                market: main.market,
                side: close_side,
                margin: Amount::zero(),
                size: main.size,
                kind,
                reduce_only: true,
                trigger_price,
                expiry: None,
                cancel_on_execute: None,
                trailing_stop: trailing,
            }
        };

        if let Some(sl) = attached.stop_loss {
            aux.push(protective(OrderKind::Stop, Some(sl), None));
        } else if let Some(ts) = attached.trailing_stop {
            aux.push(protective(OrderKind::TrailingStop, None, Some(ts)));
        }
        if let Some(tp) = attached.take_profit {
            aux.push(protective(OrderKind::Limit, Some(tp), None));
        }

        Ok(aux)
    }

    fn pull_submission_funds(
        &mut self,
        sender: UserId,
        main: &OrderRequest,
        main_fee: Amount,
        total_execution_fee: Amount,
    ) -> Result<(), EngineError> {
        let escrow = if main.reduce_only {
            Amount::zero()
        } else {
            main.margin.add(main_fee)
        };

        if main.asset.is_native() {
            self.ledger
                .transfer_in(AssetId::NATIVE, sender, escrow.add(total_execution_fee))?;
        } else {
            if escrow.is_positive() {
                self.ledger.transfer_in(main.asset, sender, escrow)?;
            }
            if total_execution_fee.is_positive() {
                self.ledger
                    .transfer_in(AssetId::NATIVE, sender, total_execution_fee)?;
            }
        }
        self.pending_execution_fees = self.pending_execution_fees.add(total_execution_fee);
        Ok(())
    }

    fn materialize(
        &self,
        id: OrderId,
        request: &OrderRequest,
        fee: Amount,
        execution_fee: Amount,
    ) -> Order {
        Order {
            id,
            user: request.user,
            asset: request.asset,
            market: request.market,
            side: request.side,
            margin: if request.reduce_only {
                Amount::zero()
            } else {
                request.margin
            },
            size: request.size,
            fee,
            timestamp: self.current_time,
            kind: request.kind,
            reduce_only: request.reduce_only,
            trigger_price: request.trigger_price,
            expiry: request.expiry,
            cancel_on_execute: request.cancel_on_execute,
            execution_fee,
            trailing_stop: request.trailing_stop,
        }
    }

    fn insert_and_announce(&mut self, order: Order) {
        self.emit_event(EventPayload::OrderCreated(OrderCreatedEvent {
            book: BookKind::Trade,
            order_id: order.id.0,
            user: order.user,
            asset: order.asset,
            market: Some(order.market),
            side: Some(order.side),
            margin: order.margin,
            size: order.size,
            fee: order.fee,
            execution_fee: order.execution_fee,
        }));
        self.orders.insert(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::{Ledger, MemoryLedger};
    use crate::engine::EngineConfig;
    use crate::market::{Asset, Market};
    use crate::price_feed::{MemoryPriceFeed, MemoryReferenceFeed};
    use rust_decimal_macros::dec;

    const USDC: AssetId = AssetId(1);
    const ALICE: UserId = UserId(1);

    fn eth() -> MarketId {
        MarketId::from_tag("ETH-USD")
    }

    fn setup_engine() -> Engine {
        let mut ledger = MemoryLedger::new();
        ledger.mint(USDC, ALICE, Amount::new(dec!(1_000_000)));
        ledger.mint(AssetId::NATIVE, ALICE, Amount::new(dec!(10)));

        let mut engine = Engine::new(
            EngineConfig::default(),
            Box::new(ledger),
            Box::new(MemoryPriceFeed::new()),
            Box::new(MemoryReferenceFeed::new()),
        )
        .unwrap();
        engine.set_asset(USDC, Asset::usdc()).unwrap();
        engine.set_market(eth(), Market::eth_usd()).unwrap();
        engine.set_time(Timestamp::from_secs(1_000));
        engine
    }

    fn market_request(margin: Decimal, size: Decimal) -> OrderRequest {
        OrderRequest {
            user: ALICE,
            asset: USDC,
            market: eth(),
            side: Side::Long,
            margin: Amount::new(margin),
            size: Amount::new(size),
            kind: OrderKind::Market,
            reduce_only: false,
            trigger_price: None,
            expiry: None,
            cancel_on_execute: None,
            trailing_stop: None,
        }
    }

    #[test]
    fn submit_escrows_margin_and_fee() {
        let mut engine = setup_engine();

        let ids = engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap();
        assert_eq!(ids.len(), 1);

        let order = engine.order(ids[0]).unwrap();
        // fee = 100_000 * 10bps
        assert_eq!(order.fee.value(), dec!(100));
        assert_eq!(engine.ledger().custody(USDC).value(), dec!(10_100));
        assert_eq!(
            engine.ledger().balance_of(USDC, ALICE).value(),
            dec!(989_900)
        );
    }

    #[test]
    fn leverage_bounds_enforced() {
        let mut engine = setup_engine();

        // 0.5x: below 1x floor
        let err = engine
            .submit_order(ALICE, market_request(dec!(1_000), dec!(500)), Attached::none(), None, None)
            .unwrap_err();
        assert_eq!(err.code(), "!leverage");

        // 51x: above the market's 50x cap
        let err = engine
            .submit_order(ALICE, market_request(dec!(1_000), dec!(51_000)), Attached::none(), None, None)
            .unwrap_err();
        assert_eq!(err.code(), "!leverage");
    }

    #[test]
    fn min_size_enforced() {
        let mut engine = setup_engine();
        let err = engine
            .submit_order(ALICE, market_request(dec!(0.5), dec!(0.5)), Attached::none(), None, None)
            .unwrap_err();
        assert_eq!(err.code(), "!min-size");
    }

    #[test]
    fn trigger_orders_require_price() {
        let mut engine = setup_engine();
        let mut request = market_request(dec!(1_000), dec!(10_000));
        request.kind = OrderKind::Limit;
        let err = engine
            .submit_order(ALICE, request, Attached::none(), None, None)
            .unwrap_err();
        assert_eq!(err.code(), "!trigger-price");
    }

    #[test]
    fn reduce_only_without_position_rejected() {
        let mut engine = setup_engine();
        let mut request = market_request(dec!(0), dec!(10_000));
        request.reduce_only = true;
        let err = engine
            .submit_order(ALICE, request, Attached::none(), None, None)
            .unwrap_err();
        assert_eq!(err.code(), "!no-position");
    }

    #[test]
    fn attached_orders_cross_link() {
        let mut engine = setup_engine();
        let mut request = market_request(dec!(10_000), dec!(100_000));
        request.trigger_price = Price::new(dec!(2_000));

        let ids = engine
            .submit_order(
                ALICE,
                request,
                Attached {
                    take_profit: Price::new(dec!(2_100)),
                    stop_loss: Price::new(dec!(1_950)),
                    trailing_stop: None,
                },
                None,
                None,
            )
            .unwrap();
        assert_eq!(ids.len(), 3);

        let sl = engine.order(ids[1]).unwrap();
        let tp = engine.order(ids[2]).unwrap();
        assert_eq!(sl.kind, OrderKind::Stop);
        assert_eq!(tp.kind, OrderKind::Limit);
        assert_eq!(sl.side, Side::Short);
        assert!(sl.reduce_only && tp.reduce_only);
        assert_eq!(sl.cancel_on_execute, Some(tp.id));
        assert_eq!(tp.cancel_on_execute, Some(sl.id));
    }

    #[test]
    fn inconsistent_tp_sl_rejected() {
        let mut engine = setup_engine();
        let err = engine
            .submit_order(
                ALICE,
                market_request(dec!(10_000), dec!(100_000)),
                Attached {
                    take_profit: Price::new(dec!(1_900)),
                    stop_loss: Price::new(dec!(2_100)),
                    trailing_stop: None,
                },
                None,
                None,
            )
            .unwrap_err();
        assert_eq!(err.code(), "!tp-sl");
    }

    #[test]
    fn cancel_refunds_escrow() {
        let mut engine = setup_engine();
        let ids = engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap();

        engine.cancel_order(ALICE, ids[0]).unwrap();
        assert!(engine.order(ids[0]).is_none());
        assert!(engine.ledger().custody(USDC).is_zero());
        assert_eq!(
            engine.ledger().balance_of(USDC, ALICE).value(),
            dec!(1_000_000)
        );
    }

    #[test]
    fn cancel_foreign_order_unauthorized() {
        let mut engine = setup_engine();
        let ids = engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap();

        let err = engine.cancel_order(UserId(99), ids[0]).unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized));
    }

    #[test]
    fn paused_engine_rejects_submissions() {
        let mut engine = setup_engine();
        engine.set_new_orders_paused(true);
        let err = engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Paused));
    }

    #[test]
    fn execution_fees_escrowed_in_native() {
        let mut engine = setup_engine();
        engine
            .set_order_execution_fee(Amount::new(dec!(0.01)))
            .unwrap();

        engine
            .submit_order(
                ALICE,
                market_request(dec!(10_000), dec!(100_000)),
                Attached {
                    take_profit: Price::new(dec!(2_100)),
                    stop_loss: None,
                    trailing_stop: None,
                },
                None,
                None,
            )
            .unwrap();

        // two orders, 0.01 native each
        assert_eq!(engine.pending_execution_fees().value(), dec!(0.02));
        assert_eq!(
            engine.ledger().custody(AssetId::NATIVE).value(),
            dec!(0.02)
        );
    }

    #[test]
    fn signature_gate_admits_once() {
        use crate::custody::AllowListVerifier;

        let mut engine = setup_engine();
        let mut verifier = AllowListVerifier::new();
        verifier.allow(ALICE);
        engine.set_signature_verifier(Box::new(verifier));

        // no signature, not approved
        let err = engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Unauthorized));

        // valid signature approves and submits
        engine
            .submit_order(
                ALICE,
                market_request(dec!(10_000), dec!(100_000)),
                Attached::none(),
                None,
                Some(b"sig"),
            )
            .unwrap();

        // approval sticks
        engine
            .submit_order(ALICE, market_request(dec!(10_000), dec!(100_000)), Attached::none(), None, None)
            .unwrap();
    }
}
