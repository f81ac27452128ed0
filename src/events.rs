// 11.0: every state change produces exactly one event. used for audit trails,
// state reconstruction, and notifying keepers. the EventPayload enum lists all
// event types the engine can emit.

use crate::types::{
    Amount, AssetId, LiquidityOrderId, MarketId, OrderId, Price, Side, Timestamp, UserId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

/// Which order book an order-lifecycle event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookKind {
    Trade,
    Liquidity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    // Order lifecycle
    OrderCreated(OrderCreatedEvent),
    OrderCancelled(OrderCancelledEvent),
    OrderExecuted(OrderExecutedEvent),
    OrderSkipped(OrderSkippedEvent),
    TrailingStopOrderExecuted(TrailingStopOrderExecutedEvent),

    // Positions
    PositionIncreased(PositionIncreasedEvent),
    PositionDecreased(PositionDecreasedEvent),
    MarginIncreased(MarginChangedEvent),
    MarginDecreased(MarginChangedEvent),
    PositionLiquidated(PositionLiquidatedEvent),
    LiquidationError(LiquidationErrorEvent),

    // Fees and funding
    FeePaid(FeePaidEvent),
    FundingUpdated(FundingUpdatedEvent),

    // Open interest
    IncrementOI(OiChangedEvent),
    DecrementOI(OiChangedEvent),

    // Pool
    PoolDeposit(PoolDepositEvent),
    PoolWithdrawal(PoolWithdrawalEvent),
    DirectPoolDeposit(DirectPoolDepositEvent),
    PoolPayIn(PoolPayInEvent),
    PoolPayOut(PoolPayOutEvent),
    BufferToPool(BufferToPoolEvent),
    GlobalUPLSet(GlobalUplSetEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub book: BookKind,
    pub order_id: u32,
    pub user: UserId,
    pub asset: AssetId,
    pub market: Option<MarketId>,
    pub side: Option<Side>,
    pub margin: Amount,
    pub size: Amount,
    pub fee: Amount,
    pub execution_fee: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelledEvent {
    pub book: BookKind,
    pub order_id: u32,
    pub user: UserId,
    /// Short reason code ("!expired", "!oco", "user", ...).
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExecutedEvent {
    pub order_id: OrderId,
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size: Amount,
    pub price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSkippedEvent {
    pub order_id: OrderId,
    pub market: MarketId,
    /// Transient, order stays live ("!early", "!stale", "!no-trailing-stop-execution", ...).
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopOrderExecutedEvent {
    pub order_id: OrderId,
    pub user: UserId,
    pub market: MarketId,
    pub reference_price: Price,
    pub execution_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionIncreasedEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size_added: Amount,
    pub margin_added: Amount,
    pub price: Price,
    pub new_size: Amount,
    pub new_margin: Amount,
    pub new_avg_price: Price,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionDecreasedEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size_closed: Amount,
    pub margin_released: Amount,
    pub price: Price,
    pub pnl: Decimal,
    pub funding_fee: Decimal,
    pub remaining_size: Amount,
    pub amount_returned: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginChangedEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub delta: Amount,
    pub new_margin: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionLiquidatedEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size: Amount,
    pub margin: Amount,
    pub price: Price,
    pub fee: Amount,
    pub margin_to_pool: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationErrorEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeePaidEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub fee: Amount,
    pub pool_fee: Amount,
    pub treasury_fee: Amount,
    pub keeper_fee: Amount,
    pub is_liquidation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingUpdatedEvent {
    pub asset: AssetId,
    pub market: MarketId,
    pub increment: Decimal,
    pub index: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OiChangedEvent {
    pub asset: AssetId,
    pub market: MarketId,
    pub side: Side,
    pub size: Amount,
    pub market_long: Decimal,
    pub market_short: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDepositEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub amount: Amount,
    pub tax_bps: u32,
    pub lp_minted: Decimal,
    pub pool_balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolWithdrawalEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub amount: Amount,
    pub tax_bps: u32,
    pub amount_after_tax: Amount,
    pub lp_burned: Decimal,
    pub pool_balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectPoolDepositEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPayInEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub amount: Amount,
    pub buffer_balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolPayOutEvent {
    pub user: UserId,
    pub asset: AssetId,
    pub market: MarketId,
    pub amount: Amount,
    pub from_buffer: Amount,
    pub from_principal: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferToPoolEvent {
    pub asset: AssetId,
    pub amount: Amount,
    pub buffer_balance: Amount,
    pub pool_balance: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalUplSetEvent {
    pub asset: AssetId,
    pub upl: Decimal,
}

/// Liquidity-order ids live in their own space; events carry the raw number
/// plus the book tag so the two spaces never collide.
pub fn trade_order_ref(id: OrderId) -> u32 {
    id.0
}

pub fn liquidity_order_ref(id: LiquidityOrderId) -> u32 {
    id.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn events_serialize() {
        let event = Event::new(
            EventId(1),
            Timestamp::from_secs(1_000),
            EventPayload::PoolPayIn(PoolPayInEvent {
                user: UserId(1),
                asset: AssetId(1),
                market: MarketId::from_tag("ETH-USD"),
                amount: Amount::new(dec!(500)),
                buffer_balance: Amount::new(dec!(500)),
            }),
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, EventId(1));
        assert!(matches!(back.payload, EventPayload::PoolPayIn(_)));
    }

    #[test]
    fn order_refs_share_a_number_space_per_book() {
        assert_eq!(trade_order_ref(OrderId(7)), 7);
        assert_eq!(liquidity_order_ref(LiquidityOrderId(7)), 7);
    }
}
