//! Keeper-driven order execution.
//!
//! Keepers relay an oracle update and a batch of order ids. Each order is
//! executed against the bounded oracle price independently: hard failures
//! cancel the order with a reason code, transient conditions (too young,
//! stale oracle, trigger not met, reference deviation) leave it resting.
//! A failing item never aborts the batch.

use super::core::Engine;
use super::results::{EngineError, ExecuteOutcome};
use crate::events::{EventPayload, OrderSkippedEvent, TrailingStopOrderExecutedEvent};
use crate::market::Market;
use crate::order::OrderKind;
use crate::position::PositionKey;
use crate::price_feed::{bounded_oracle_price, within_reference, PriceFeed as _};
use crate::types::{OrderId, Price, Side, UserId};
use rust_decimal::Decimal;

/// Outcome of an oracle read, shared with the liquidation path.
pub(super) enum PriceRead {
    Fresh(Price),
    Stale,
    Unusable,
}

impl Engine {
    /// Execute a batch of trading orders against a fresh oracle update.
    pub fn execute_orders(
        &mut self,
        keeper: UserId,
        ids: &[OrderId],
        oracle_payload: &[u8],
    ) -> Result<Vec<(OrderId, ExecuteOutcome)>, EngineError> {
        self.execute_batch(keeper, ids, None, oracle_payload)
    }

    /// Execute trailing-stop orders; each id is paired with the keeper's
    /// reference price the trailing distance is measured from.
    pub fn execute_trailing_stop_orders(
        &mut self,
        keeper: UserId,
        ids: &[OrderId],
        reference_prices: &[Price],
        oracle_payload: &[u8],
    ) -> Result<Vec<(OrderId, ExecuteOutcome)>, EngineError> {
        if ids.len() != reference_prices.len() {
            return Err(EngineError::InvalidInput("!length"));
        }
        self.execute_batch(keeper, ids, Some(reference_prices), oracle_payload)
    }

    fn execute_batch(
        &mut self,
        keeper: UserId,
        ids: &[OrderId],
        trailing_refs: Option<&[Price]>,
        oracle_payload: &[u8],
    ) -> Result<Vec<(OrderId, ExecuteOutcome)>, EngineError> {
        self.require_keeper(keeper)?;
        self.require_processing_live()?;
        self.price_feed.apply_update(oracle_payload)?;

        let mut outcomes = Vec::with_capacity(ids.len());
        for (index, &id) in ids.iter().enumerate() {
            let trailing_ref = trailing_refs.map(|refs| refs[index]);
            let outcome = self.execute_one(id, trailing_ref, keeper)?;
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    fn execute_one(
        &mut self,
        id: OrderId,
        trailing_ref: Option<Price>,
        keeper: UserId,
    ) -> Result<ExecuteOutcome, EngineError> {
        let Some(order) = self.orders.get(id) else {
            return Ok(ExecuteOutcome::Cancelled("!order".to_string()));
        };
        let market_id = order.market;
        let order_side = order.side;
        let order_age = self.current_time.seconds_since(order.timestamp);

        let market = match self.market_of(market_id) {
            Ok(market) => market.clone(),
            Err(err) => {
                self.cancel_order_internal(id, err.code(), keeper)?;
                return Ok(ExecuteOutcome::Cancelled(err.code().to_string()));
            }
        };

        // keepers must not race fresh orders ahead of the oracle
        if order_age < market.min_order_age {
            return Ok(self.skip(id, market_id, "!early"));
        }

        let price = match self.read_price(&market, order_side.is_long()) {
            PriceRead::Fresh(price) => Some(price),
            PriceRead::Stale => return Ok(self.skip(id, market_id, EngineError::Stale.code())),
            PriceRead::Unusable => None,
        };

        match self.execute_against_price(id, &market, price, trailing_ref, keeper) {
            Ok(None) => Ok(ExecuteOutcome::Executed),
            Ok(Some(reason)) => Ok(self.skip(id, market_id, reason)),
            Err(err) => {
                let code = err.code().to_string();
                // hard failure: the order comes off the book with the reason
                self.cancel_order_internal(id, &code, keeper)?;
                Ok(ExecuteOutcome::Cancelled(code))
            }
        }
    }

    /// Core execution: trigger matching, OCO cancellation, and routing into
    /// increase or decrease. `Ok(Some(reason))` keeps the order resting.
    fn execute_against_price(
        &mut self,
        id: OrderId,
        market: &Market,
        price: Option<Price>,
        trailing_ref: Option<Price>,
        keeper: UserId,
    ) -> Result<Option<&'static str>, EngineError> {
        let order = self
            .orders
            .get(id)
            .ok_or(EngineError::OrderNotFound(id))?
            .clone();
        if order.is_empty() {
            return Err(EngineError::OrderNotFound(id));
        }

        if let Some(expiry) = order.expiry {
            if expiry <= self.current_time {
                return Err(EngineError::Expired);
            }
        }

        let age = self.current_time.seconds_since(order.timestamp);
        let ttl_cap = if order.kind.is_market() {
            self.config.max_market_order_ttl
        } else {
            self.config.max_trigger_order_ttl
        };
        if age > ttl_cap {
            return Err(EngineError::TooOld);
        }

        let Some(price) = price else {
            return Err(EngineError::PriceUnavailable);
        };

        let reference = self.reference_price(market);
        if !within_reference(price, reference, market.max_deviation) {
            return Ok(Some(EngineError::ReferenceDeviation.code()));
        }

        match order.kind {
            OrderKind::TrailingStop => {
                let Some(bps) = order.trailing_stop.filter(|b| !b.is_zero()) else {
                    return Err(EngineError::InvalidInput("!no-trailing-stop-percentage"));
                };
                let Some(reference) = trailing_ref else {
                    return Ok(Some("!ts-no-ref-price"));
                };
                let fires = match order.side {
                    // closing a long: price must have fallen off the reference
                    Side::Short => {
                        price.value() <= reference.value() * bps.complement_fraction()
                    }
                    // closing a short: price must have bounced off the reference
                    Side::Long => {
                        price.value()
                            >= reference.value() * (Decimal::ONE + bps.as_fraction())
                    }
                };
                if !fires {
                    return Ok(Some("!no-trailing-stop-execution"));
                }
            }
            OrderKind::Limit => {
                let trigger = order
                    .trigger_price
                    .ok_or(EngineError::InvalidInput("!trigger-price"))?;
                let fires = match order.side {
                    Side::Long => price <= trigger,
                    Side::Short => price >= trigger,
                };
                if !fires {
                    return Ok(Some(EngineError::NotExecutable.code()));
                }
            }
            OrderKind::Stop => {
                let trigger = order
                    .trigger_price
                    .ok_or(EngineError::InvalidInput("!trigger-price"))?;
                let fires = match order.side {
                    Side::Long => price >= trigger,
                    Side::Short => price <= trigger,
                };
                if !fires {
                    return Ok(Some(EngineError::NotExecutable.code()));
                }
            }
            OrderKind::Market => {
                // protected market order: the trigger is a worst-case bound
                if let Some(bound) = order.trigger_price {
                    let acceptable = match order.side {
                        Side::Long => price <= bound,
                        Side::Short => price >= bound,
                    };
                    if !acceptable {
                        return Err(EngineError::ProtectedMarketRejected);
                    }
                }
            }
        }

        // OCO: executing this order takes its sibling off the book
        if let Some(sibling) = order.cancel_on_execute {
            if self.orders.contains(sibling) {
                self.cancel_order_internal(sibling, "!oco", keeper)?;
            }
        }

        let key = PositionKey::new(order.user, order.asset, order.market);
        let position_side = self.positions.get(&key).map(|p| p.side);
        let closes_existing = position_side == Some(order.side.opposite());

        if closes_existing {
            let is_trailing = order.kind == OrderKind::TrailingStop;
            self.decrease_position(id, price, is_trailing, keeper)?;
            if is_trailing {
                if let Some(reference) = trailing_ref {
                    self.emit_event(EventPayload::TrailingStopOrderExecuted(
                        TrailingStopOrderExecutedEvent {
                            order_id: id,
                            user: order.user,
                            market: order.market,
                            reference_price: reference,
                            execution_price: price,
                        },
                    ));
                }
            }
        } else if !order.reduce_only {
            // no position or same direction: open or grow
            self.increase_position(id, price, keeper)?;
        } else {
            return Err(EngineError::InvalidInput("!reduce"));
        }

        Ok(None)
    }

    fn read_price(&self, market: &Market, maximise: bool) -> PriceRead {
        let Some(quote) = self.price_feed.get_unsafe(market.oracle_feed_id) else {
            return PriceRead::Stale;
        };
        if self.current_time.seconds_since(quote.publish_time) > market.oracle_max_age {
            return PriceRead::Stale;
        }
        match bounded_oracle_price(market, &quote, maximise) {
            Some(price) => PriceRead::Fresh(price),
            None => PriceRead::Unusable,
        }
    }

    /// Liquidation-path read: bias against the trader, maximise for shorts
    /// and minimise for longs.
    pub(super) fn read_liquidation_price(&self, market: &Market, position_side: Side) -> PriceRead {
        self.read_price(market, !position_side.is_long())
    }

    fn skip(&mut self, id: OrderId, market: crate::types::MarketId, reason: &'static str) -> ExecuteOutcome {
        self.emit_event(EventPayload::OrderSkipped(OrderSkippedEvent {
            order_id: id,
            market,
            reason: reason.to_string(),
        }));
        ExecuteOutcome::Skipped(reason)
    }
}
