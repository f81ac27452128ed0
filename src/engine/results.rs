// 8.0.2: result types and errors for engine operations.

use crate::custody::LedgerError;
use crate::market::MarketError;
use crate::pool::PoolError;
use crate::position::PositionKey;
use crate::price_feed::FeedError;
use crate::risk::RiskError;
use crate::types::{LiquidityOrderId, OrderId};

#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("caller is not permitted to perform this action")]
    Unauthorized,

    #[error("order {0:?} not found")]
    OrderNotFound(OrderId),

    #[error("liquidity order {0:?} not found")]
    LiquidityOrderNotFound(LiquidityOrderId),

    #[error("no position for {0:?}")]
    PositionNotFound(PositionKey),

    #[error("order expired")]
    Expired,

    #[error("order exceeded its time-to-live")]
    TooOld,

    #[error("oracle publish time too old")]
    Stale,

    #[error("no usable oracle price")]
    PriceUnavailable,

    #[error("price outside the reference band")]
    ReferenceDeviation,

    #[error("trigger conditions not met")]
    NotExecutable,

    #[error("protected market order outside its bound")]
    ProtectedMarketRejected,

    #[error("position was increased too recently")]
    MinHoldTime,

    #[error("remaining position would fall below the asset minimum")]
    MinRemainingSize,

    #[error("margin insufficient for the requested operation")]
    InsufficientMargin,

    #[error("tax would consume the full amount")]
    TaxExceedsBps,

    #[error("amount after tax below the requested minimum")]
    MinAmountAfterTax,

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("engine is paused")]
    Paused,

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Risk(#[from] RiskError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Feed(#[from] FeedError),
}

impl EngineError {
    /// Stable short code recorded in cancellation and error events. These are
    /// the reason strings keepers and hosts key on.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Unauthorized => "!unauthorized",
            EngineError::OrderNotFound(_) => "!order",
            EngineError::LiquidityOrderNotFound(_) => "!order",
            EngineError::PositionNotFound(_) => "!position",
            EngineError::Expired => "!expired",
            EngineError::TooOld => "!too-old",
            EngineError::Stale => "!stale",
            EngineError::PriceUnavailable => "!no-price",
            EngineError::ReferenceDeviation => "!reference-price-deviation",
            EngineError::NotExecutable => "!not-executable",
            EngineError::ProtectedMarketRejected => "!protected",
            EngineError::MinHoldTime => "!min-hold-time",
            EngineError::MinRemainingSize => "!min-remaining-size",
            EngineError::InsufficientMargin => "!insufficient-margin",
            EngineError::TaxExceedsBps => "!tax",
            EngineError::MinAmountAfterTax => "!min-amount",
            EngineError::InvalidInput(code) => code,
            EngineError::Paused => "!paused",
            EngineError::Market(_) => "!market",
            EngineError::Pool(_) => "!insufficient-pool",
            EngineError::Risk(RiskError::OiCapExceeded { .. }) => "!max-oi",
            EngineError::Risk(RiskError::PoolDrawdownExceeded { .. }) => "!pool-risk",
            EngineError::Ledger(_) => "!ledger",
            EngineError::Feed(_) => "!oracle-payload",
        }
    }
}

/// Per-order result of a keeper execution batch. Hard failures cancel the
/// order; transient reasons leave it resting for the next sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Executed,
    Skipped(&'static str),
    Cancelled(String),
}

/// Per-row result of a liquidation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationOutcome {
    Liquidated,
    Failed(String),
}

/// Per-order result of a liquidity execution batch. Failures cancel the
/// order with the reason recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidityOutcome {
    Executed,
    Cancelled(String),
}
