//! Perpetual-futures engine core.
//!
//! A deterministic, in-memory state machine for oracle-priced perpetual
//! trading: keeper-executed orders, isolated-margin positions with funding
//! accrual and liquidation, and siloed per-asset liquidity pools that absorb
//! trader P&L through a time-streamed buffer. All computation is pure and
//! event driven; external value movement, prices, referrals and signatures
//! sit behind capability traits.

pub mod types;
pub mod market;
pub mod order;
pub mod position;
pub mod funding;
pub mod pool;
pub mod risk;
pub mod price_feed;
pub mod custody;
pub mod events;
pub mod engine;

pub use types::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use funding::*;
pub use pool::*;
pub use risk::*;
pub use price_feed::*;
pub use custody::*;
pub use events::*;
pub use engine::*;
