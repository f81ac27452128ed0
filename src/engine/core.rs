//! Core engine struct, clock, governance surface and queries.

use super::config::EngineConfig;
use super::results::EngineError;
use crate::custody::{Ledger, ReferralDirectory, SignatureVerifier};
use crate::events::{BufferToPoolEvent, Event, EventId, EventPayload, OiChangedEvent};
use crate::events::FundingUpdatedEvent;
use crate::funding::FundingTracker;
use crate::market::{Asset, Market, MarketError};
use crate::order::{Order, OrderStore};
use crate::pool::{LiquidityOrder, LiquidityOrderStore, PoolState};
use crate::position::{OpenInterest, Position, PositionKey};
use crate::price_feed::{PriceFeed, ReferencePriceFeed};
use crate::risk::RiskValidator;
use crate::types::{
    Amount, AssetId, Bps, LiquidityOrderId, MarketId, OrderId, Price, Side, Timestamp, UserId,
};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};

/// The perpetual-futures engine: a deterministic state machine over orders,
/// positions, pools, funding and risk, driven by trader and keeper commands.
pub struct Engine {
    pub(super) config: EngineConfig,
    pub(super) assets: HashMap<AssetId, Asset>,
    pub(super) markets: HashMap<MarketId, Market>,
    pub(super) pools: HashMap<AssetId, PoolState>,
    pub(super) positions: HashMap<PositionKey, Position>,
    pub(super) position_keys: Vec<PositionKey>,
    pub(super) market_oi: HashMap<(AssetId, MarketId), OpenInterest>,
    pub(super) asset_oi: HashMap<AssetId, OpenInterest>,
    pub(super) funding: FundingTracker,
    pub(super) risk: RiskValidator,
    pub(super) orders: OrderStore,
    pub(super) liquidity_orders: LiquidityOrderStore,
    pub(super) last_increased: HashMap<(UserId, MarketId), Timestamp>,
    /// Native-asset escrow backing keeper execution fees on resting orders.
    pub(super) pending_execution_fees: Amount,
    pub(super) approved_accounts: HashSet<UserId>,
    pub(super) keepers: HashSet<UserId>,
    pub(super) funding_accounts: HashSet<UserId>,
    pub(super) new_orders_paused: bool,
    pub(super) processing_paused: bool,
    pub(super) ledger: Box<dyn Ledger>,
    pub(super) price_feed: Box<dyn PriceFeed>,
    pub(super) reference_feed: Box<dyn ReferencePriceFeed>,
    pub(super) referrals: Option<Box<dyn ReferralDirectory>>,
    pub(super) verifier: Option<Box<dyn SignatureVerifier>>,
    pub(super) events: Vec<Event>,
    pub(super) next_event_id: u64,
    pub(super) current_time: Timestamp,
}

impl Engine {
    /// Create an engine over the given external capabilities.
    pub fn new(
        config: EngineConfig,
        ledger: Box<dyn Ledger>,
        price_feed: Box<dyn PriceFeed>,
        reference_feed: Box<dyn ReferencePriceFeed>,
    ) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::InvalidInput)?;
        let funding = FundingTracker::new(config.funding_interval);
        let mut risk = RiskValidator::new();
        risk.set_hourly_decay(config.pool_hourly_decay);

        Ok(Self {
            config,
            assets: HashMap::new(),
            markets: HashMap::new(),
            pools: HashMap::new(),
            positions: HashMap::new(),
            position_keys: Vec::new(),
            market_oi: HashMap::new(),
            asset_oi: HashMap::new(),
            funding,
            risk,
            orders: OrderStore::new(),
            liquidity_orders: LiquidityOrderStore::new(),
            last_increased: HashMap::new(),
            pending_execution_fees: Amount::zero(),
            approved_accounts: HashSet::new(),
            keepers: HashSet::new(),
            funding_accounts: HashSet::new(),
            new_orders_paused: false,
            processing_paused: false,
            ledger,
            price_feed,
            reference_feed,
            referrals: None,
            verifier: None,
            events: Vec::new(),
            next_event_id: 1,
            current_time: Timestamp::from_secs(0),
        })
    }

    pub fn set_referral_directory(&mut self, directory: Box<dyn ReferralDirectory>) {
        self.referrals = Some(directory);
    }

    pub fn set_signature_verifier(&mut self, verifier: Box<dyn SignatureVerifier>) {
        self.verifier = Some(verifier);
    }

    // ---- clock ----

    pub fn set_time(&mut self, timestamp: Timestamp) {
        self.current_time = timestamp;
    }

    pub fn time(&self) -> Timestamp {
        self.current_time
    }

    pub fn advance_time(&mut self, secs: i64) {
        self.current_time = self.current_time.plus(secs);
    }

    // ---- listings ----

    /// List or update a market. Bounds are validated before the listing lands.
    pub fn set_market(&mut self, id: MarketId, market: Market) -> Result<(), EngineError> {
        market.validate()?;
        self.markets.insert(id, market);
        Ok(())
    }

    /// List or update a collateral asset; creates its pool on first listing.
    pub fn set_asset(&mut self, id: AssetId, asset: Asset) -> Result<(), EngineError> {
        asset.validate()?;
        self.assets.insert(id, asset);
        self.pools.entry(id).or_default();
        self.risk.set_profit_limit(id, self.config.pool_profit_limit);
        Ok(())
    }

    // ---- governance setters ----

    pub fn set_fee_share(&mut self, share: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.pool_fee_share = share)
    }

    pub fn set_keeper_fee_share(&mut self, share: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.keeper_fee_share = share)
    }

    pub fn set_buffer_payout_period(&mut self, secs: i64) -> Result<(), EngineError> {
        self.mutate_config(|c| c.buffer_payout_period = secs)
    }

    pub fn set_max_liquidity_order_ttl(&mut self, secs: i64) -> Result<(), EngineError> {
        self.mutate_config(|c| c.max_liquidity_order_ttl = secs)
    }

    pub fn set_max_market_order_ttl(&mut self, secs: i64) -> Result<(), EngineError> {
        self.mutate_config(|c| c.max_market_order_ttl = secs)
    }

    pub fn set_max_trigger_order_ttl(&mut self, secs: i64) -> Result<(), EngineError> {
        self.mutate_config(|c| c.max_trigger_order_ttl = secs)
    }

    pub fn set_min_position_hold_time(&mut self, secs: i64) -> Result<(), EngineError> {
        self.mutate_config(|c| c.min_position_hold_time = secs)
    }

    pub fn set_remove_margin_buffer(&mut self, buffer: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.remove_margin_buffer = buffer)
    }

    pub fn set_trailing_stop_fee(&mut self, fee: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.trailing_stop_fee = fee)
    }

    pub fn set_liquidation_fee(&mut self, fee: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.liquidation_fee = fee)
    }

    pub fn set_order_execution_fee(&mut self, fee: Amount) -> Result<(), EngineError> {
        if fee.is_negative() {
            return Err(EngineError::InvalidInput("!execution-fee"));
        }
        self.config.order_execution_fee = fee;
        Ok(())
    }

    pub fn set_pool_hourly_decay(&mut self, decay: Bps) -> Result<(), EngineError> {
        self.mutate_config(|c| c.pool_hourly_decay = decay)?;
        self.risk.set_hourly_decay(decay);
        Ok(())
    }

    /// Default limit for future listings plus an immediate per-asset override.
    pub fn set_pool_profit_limit(&mut self, asset: AssetId, limit: Bps) -> Result<(), EngineError> {
        if limit.value() >= crate::types::BPS {
            return Err(EngineError::InvalidInput("!pool-profit-limit"));
        }
        self.asset_of(asset)?;
        self.risk.set_profit_limit(asset, limit);
        Ok(())
    }

    pub fn set_utilization_multiplier(
        &mut self,
        asset: AssetId,
        multiplier: Bps,
    ) -> Result<(), EngineError> {
        let pool = self.pool_mut(asset)?;
        pool.utilization_multiplier = multiplier;
        Ok(())
    }

    pub fn set_max_oi(
        &mut self,
        asset: AssetId,
        market: MarketId,
        cap: Decimal,
    ) -> Result<(), EngineError> {
        if cap.is_sign_negative() {
            return Err(EngineError::InvalidInput("!max-oi"));
        }
        self.asset_of(asset)?;
        self.market_of(market)?;
        self.risk.set_max_oi(asset, market, cap);
        Ok(())
    }

    /// Move accumulated treasury fees out of custody.
    pub fn withdraw_fee_reserve(
        &mut self,
        asset: AssetId,
        to: UserId,
        amount: Amount,
    ) -> Result<(), EngineError> {
        let pool = self.pool_mut(asset)?;
        if amount > pool.fee_reserve || amount.is_negative() {
            return Err(EngineError::InvalidInput("!fee-reserve"));
        }
        pool.fee_reserve = pool.fee_reserve.sub(amount);
        self.ledger.transfer_out(asset, to, amount)?;
        Ok(())
    }

    fn mutate_config(&mut self, f: impl FnOnce(&mut EngineConfig)) -> Result<(), EngineError> {
        let mut candidate = self.config.clone();
        f(&mut candidate);
        candidate.validate().map_err(EngineError::InvalidInput)?;
        self.config = candidate;
        Ok(())
    }

    // ---- whitelists and pauses ----

    pub fn add_keeper(&mut self, keeper: UserId) {
        self.keepers.insert(keeper);
    }

    pub fn remove_keeper(&mut self, keeper: UserId) {
        self.keepers.remove(&keeper);
    }

    pub fn add_funding_account(&mut self, account: UserId) {
        self.funding_accounts.insert(account);
    }

    pub fn remove_funding_account(&mut self, account: UserId) {
        self.funding_accounts.remove(&account);
    }

    pub fn approve_account(&mut self, account: UserId) {
        self.approved_accounts.insert(account);
    }

    pub fn set_new_orders_paused(&mut self, paused: bool) {
        self.new_orders_paused = paused;
    }

    pub fn set_processing_paused(&mut self, paused: bool) {
        self.processing_paused = paused;
    }

    /// Host-driven reference feed update.
    pub fn push_reference_price(&mut self, feed_id: u64, price: Option<Price>) {
        self.reference_feed.push(feed_id, price);
    }

    // ---- queries ----

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn market(&self, id: MarketId) -> Option<&Market> {
        self.markets.get(&id)
    }

    pub fn asset(&self, id: AssetId) -> Option<&Asset> {
        self.assets.get(&id)
    }

    pub fn pool(&self, asset: AssetId) -> Option<&PoolState> {
        self.pools.get(&asset)
    }

    pub fn lp_balance_of(&self, asset: AssetId, user: UserId) -> Amount {
        self.pools
            .get(&asset)
            .map(|p| p.lp_value_of(user))
            .unwrap_or_else(Amount::zero)
    }

    pub fn position(&self, user: UserId, asset: AssetId, market: MarketId) -> Option<&Position> {
        self.positions.get(&PositionKey::new(user, asset, market))
    }

    /// Stable insertion-ordered page of open positions.
    pub fn positions_page(&self, offset: usize, limit: usize) -> Vec<&Position> {
        let start = offset.min(self.position_keys.len());
        let end = start.saturating_add(limit).min(self.position_keys.len());
        self.position_keys[start..end]
            .iter()
            .filter_map(|key| self.positions.get(key))
            .collect()
    }

    pub fn open_interest(&self, asset: AssetId, market: MarketId) -> OpenInterest {
        self.market_oi
            .get(&(asset, market))
            .copied()
            .unwrap_or_default()
    }

    pub fn asset_open_interest(&self, asset: AssetId) -> OpenInterest {
        self.asset_oi.get(&asset).copied().unwrap_or_default()
    }

    pub fn funding_index(&self, asset: AssetId, market: MarketId) -> Decimal {
        self.funding.current(asset, market)
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn orders_for_user(&self, user: UserId) -> Vec<&Order> {
        self.orders.get_by_user(user)
    }

    pub fn market_order_ids(&self, offset: usize, limit: usize) -> &[OrderId] {
        self.orders.market_order_ids(offset, limit)
    }

    pub fn trigger_order_ids(&self, offset: usize, limit: usize) -> &[OrderId] {
        self.orders.trigger_order_ids(offset, limit)
    }

    pub fn liquidity_order(&self, id: LiquidityOrderId) -> Option<&LiquidityOrder> {
        self.liquidity_orders.get(id)
    }

    pub fn liquidity_orders_for_user(&self, user: UserId) -> Vec<&LiquidityOrder> {
        self.liquidity_orders.get_by_user(user)
    }

    pub fn liquidity_order_ids(&self, offset: usize, limit: usize) -> &[LiquidityOrderId] {
        self.liquidity_orders.ids(offset, limit)
    }

    pub fn pending_execution_fees(&self) -> Amount {
        self.pending_execution_fees
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent_events(&self, count: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(count);
        &self.events[start..]
    }

    // ---- shared internals ----

    pub(super) fn market_of(&self, id: MarketId) -> Result<&Market, EngineError> {
        self.markets
            .get(&id)
            .ok_or(EngineError::Market(MarketError::UnknownMarket(id)))
    }

    pub(super) fn asset_of(&self, id: AssetId) -> Result<&Asset, EngineError> {
        self.assets
            .get(&id)
            .ok_or(EngineError::Market(MarketError::UnknownAsset(id)))
    }

    pub(super) fn pool_mut(&mut self, asset: AssetId) -> Result<&mut PoolState, EngineError> {
        self.pools
            .get_mut(&asset)
            .ok_or(EngineError::Market(MarketError::UnknownAsset(asset)))
    }

    pub(super) fn pool_of(&self, asset: AssetId) -> Result<&PoolState, EngineError> {
        self.pools
            .get(&asset)
            .ok_or(EngineError::Market(MarketError::UnknownAsset(asset)))
    }

    pub(super) fn require_keeper(&self, caller: UserId) -> Result<(), EngineError> {
        if self.keepers.contains(&caller) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized)
        }
    }

    pub(super) fn require_processing_live(&self) -> Result<(), EngineError> {
        if self.processing_paused {
            Err(EngineError::Paused)
        } else {
            Ok(())
        }
    }

    pub(super) fn insert_position(&mut self, position: Position) {
        let key = position.key();
        if self.positions.insert(key, position).is_none() {
            self.position_keys.push(key);
        }
    }

    pub(super) fn remove_position(&mut self, key: PositionKey) -> Option<Position> {
        let removed = self.positions.remove(&key);
        if removed.is_some() {
            self.position_keys.retain(|k| *k != key);
        }
        removed
    }

    pub(super) fn increment_oi(
        &mut self,
        asset: AssetId,
        market: MarketId,
        side: Side,
        size: Amount,
    ) {
        let entry = self.market_oi.entry((asset, market)).or_default();
        entry.increment(side, size);
        let snapshot = *entry;
        self.asset_oi.entry(asset).or_default().increment(side, size);

        self.emit_event(EventPayload::IncrementOI(OiChangedEvent {
            asset,
            market,
            side,
            size,
            market_long: snapshot.long,
            market_short: snapshot.short,
        }));
    }

    pub(super) fn decrement_oi(
        &mut self,
        asset: AssetId,
        market: MarketId,
        side: Side,
        size: Amount,
    ) {
        let entry = self.market_oi.entry((asset, market)).or_default();
        entry.decrement(side, size);
        let snapshot = *entry;
        self.asset_oi.entry(asset).or_default().decrement(side, size);

        self.emit_event(EventPayload::DecrementOI(OiChangedEvent {
            asset,
            market,
            side,
            size,
            market_long: snapshot.long,
            market_short: snapshot.short,
        }));
    }

    /// Commit funding for the pair. Always called before OI moves within a
    /// command so accrual prices against the pre-command book.
    pub(super) fn update_funding(&mut self, asset: AssetId, market: MarketId) {
        let Ok(listing) = self.market_of(market) else {
            return;
        };
        let factor = listing.funding_factor;
        let oi = self.open_interest(asset, market);
        if let Some(increment) =
            self.funding
                .update(asset, market, factor, &oi, self.current_time)
        {
            let index = self.funding.current(asset, market);
            self.emit_event(EventPayload::FundingUpdated(FundingUpdatedEvent {
                asset,
                market,
                increment,
                index,
            }));
        }
    }

    /// Funding index including pending accrual, used for every P&L read.
    pub(super) fn projected_funding(&self, asset: AssetId, market: MarketId) -> Decimal {
        let Ok(listing) = self.market_of(market) else {
            return self.funding.current(asset, market);
        };
        let oi = self.open_interest(asset, market);
        self.funding
            .projected(asset, market, listing.funding_factor, &oi, self.current_time)
    }

    /// Run the buffer streamer for an asset, emitting when value moved.
    pub(super) fn stream_pool_buffer(&mut self, asset: AssetId) {
        let now = self.current_time;
        let period = self.config.buffer_payout_period;
        let Some(pool) = self.pools.get_mut(&asset) else {
            return;
        };
        let moved = pool.stream_buffer(now, period);
        if moved.is_positive() {
            let buffer_balance = pool.buffer;
            let pool_balance = pool.balance;
            self.emit_event(EventPayload::BufferToPool(BufferToPoolEvent {
                asset,
                amount: moved,
                buffer_balance,
                pool_balance,
            }));
        }
    }

    pub(super) fn reference_price(&self, market: &Market) -> Option<Price> {
        self.reference_feed.get(market.reference_feed_id)
    }

    /// Emit an event and append it to the bounded log.
    pub(super) fn emit_event(&mut self, payload: EventPayload) {
        let event = Event::new(EventId(self.next_event_id), self.current_time, payload);
        self.next_event_id += 1;

        if self.config.verbose {
            println!("[Event {}] {:?}", event.id.0, event.payload);
        }

        self.events.push(event);

        if self.events.len() > self.config.max_events {
            let drain_count = self.events.len() - self.config.max_events;
            self.events.drain(0..drain_count);
        }
    }
}
