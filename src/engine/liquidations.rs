//! Keeper-driven liquidation batches.
//!
//! Each row names a position. The oracle price is biased against the trader,
//! and a position liquidates once its loss reaches the market's threshold
//! share of margin. Margin net of the liquidation fee lands in the pool
//! buffer. Per-row failures are reported as events and never abort the batch.

use super::core::Engine;
use super::execution::PriceRead;
use super::results::{EngineError, LiquidationOutcome};
use crate::events::{EventPayload, LiquidationErrorEvent, PositionLiquidatedEvent};
use crate::position::{position_pnl, PositionKey};
use crate::price_feed::{within_reference, PriceFeed as _};
use crate::types::{AssetId, MarketId, UserId};

impl Engine {
    /// Liquidate a batch of positions. Row order is preserved in the result.
    pub fn liquidate_positions(
        &mut self,
        keeper: UserId,
        rows: &[(UserId, AssetId, MarketId)],
        oracle_payload: &[u8],
    ) -> Result<Vec<LiquidationOutcome>, EngineError> {
        self.require_keeper(keeper)?;
        self.require_processing_live()?;
        self.price_feed.apply_update(oracle_payload)?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for &(user, asset, market) in rows {
            let outcome = self.liquidate_one(user, asset, market, keeper)?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn liquidate_one(
        &mut self,
        user: UserId,
        asset: AssetId,
        market_id: MarketId,
        keeper: UserId,
    ) -> Result<LiquidationOutcome, EngineError> {
        let key = PositionKey::new(user, asset, market_id);
        let Some(position) = self.positions.get(&key).cloned() else {
            return Ok(self.liquidation_failed(user, asset, market_id, "!position"));
        };
        let market = match self.market_of(market_id) {
            Ok(market) => market.clone(),
            Err(_) => return Ok(self.liquidation_failed(user, asset, market_id, "!market")),
        };

        let price = match self.read_liquidation_price(&market, position.side) {
            PriceRead::Fresh(price) => price,
            PriceRead::Stale => {
                return Ok(self.liquidation_failed(user, asset, market_id, "!stale"))
            }
            PriceRead::Unusable => {
                return Ok(self.liquidation_failed(user, asset, market_id, "!no-price"))
            }
        };

        let reference = self.reference_price(&market);
        if !within_reference(price, reference, market.max_deviation) {
            return Ok(self.liquidation_failed(
                user,
                asset,
                market_id,
                "!reference-price-deviation",
            ));
        }

        let funding_index = self.projected_funding(asset, market_id);
        let (pnl, _) = position_pnl(
            position.side,
            price,
            position.avg_price,
            position.size,
            position.funding_snapshot,
            funding_index,
        );

        let threshold = position.margin.mul(market.liq_threshold.as_fraction());
        if pnl > -threshold.value() {
            return Ok(self.liquidation_failed(user, asset, market_id, "!not-liquidatable"));
        }

        let fee_rate = market.fee.as_fraction() + self.config.liquidation_fee.as_fraction();
        let fee = position.size.mul(fee_rate).min(position.margin);
        let margin_to_pool = position.margin.saturating_sub(fee);

        self.pool_pay_in(user, asset, market_id, margin_to_pool);
        self.credit_fee(
            user,
            asset,
            market_id,
            fee,
            crate::types::Amount::zero(),
            true,
            keeper,
        )?;
        self.update_funding(asset, market_id);
        self.decrement_oi(asset, market_id, position.side, position.size);
        self.remove_position(key);

        self.emit_event(EventPayload::PositionLiquidated(PositionLiquidatedEvent {
            user,
            asset,
            market: market_id,
            side: position.side,
            size: position.size,
            margin: position.margin,
            price,
            fee,
            margin_to_pool,
        }));

        Ok(LiquidationOutcome::Liquidated)
    }

    fn liquidation_failed(
        &mut self,
        user: UserId,
        asset: AssetId,
        market: MarketId,
        reason: &str,
    ) -> LiquidationOutcome {
        self.emit_event(EventPayload::LiquidationError(LiquidationErrorEvent {
            user,
            asset,
            market,
            reason: reason.to_string(),
        }));
        LiquidationOutcome::Failed(reason.to_string())
    }
}
