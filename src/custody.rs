// 9.2 custody.rs: external value plumbing behind traits. the in-memory ledger
// just moves balances between users and the engine's custody account; real
// hosts put token transfers behind the same seam. referral lookups and order
// signature checks live here too since they are host capabilities, not engine
// state.

use crate::types::{Amount, AssetId, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Moves collateral between user accounts and engine custody. Transfers are
/// exact: they either move the full amount or fail.
pub trait Ledger {
    /// Pull `amount` of `asset` from `from` into engine custody.
    fn transfer_in(&mut self, asset: AssetId, from: UserId, amount: Amount)
        -> Result<(), LedgerError>;

    /// Push `amount` of `asset` from engine custody to `to`.
    fn transfer_out(&mut self, asset: AssetId, to: UserId, amount: Amount)
        -> Result<(), LedgerError>;

    /// A user's free (non-custodied) balance.
    fn balance_of(&self, asset: AssetId, user: UserId) -> Amount;

    /// Total collateral the engine holds for `asset`.
    fn custody(&self, asset: AssetId) -> Amount;
}

/// Referral code directory. `info` returns `(code, referrer)` when the user
/// has one recorded.
pub trait ReferralDirectory {
    fn info(&self, user: UserId) -> Option<(u64, UserId)>;
    fn set(&mut self, user: UserId, code: u64);
}

/// Verifies a one-time approval signature for first-time order senders.
pub trait SignatureVerifier {
    fn verify(&self, user: UserId, signature: &[u8]) -> bool;
}

/// In-memory ledger used by the test suites and host simulations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryLedger {
    balances: HashMap<(AssetId, UserId), Decimal>,
    custody: HashMap<AssetId, Decimal>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user balance (a faucet, test-only by construction).
    pub fn mint(&mut self, asset: AssetId, user: UserId, amount: Amount) {
        *self.balances.entry((asset, user)).or_insert(Decimal::ZERO) += amount.value();
    }
}

impl Ledger for MemoryLedger {
    fn transfer_in(
        &mut self,
        asset: AssetId,
        from: UserId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount.value()));
        }
        if amount.is_zero() {
            return Ok(());
        }
        let balance = self.balances.entry((asset, from)).or_insert(Decimal::ZERO);
        if *balance < amount.value() {
            return Err(LedgerError::InsufficientFunds {
                asset,
                user: from,
                requested: amount.value(),
                available: *balance,
            });
        }
        *balance -= amount.value();
        *self.custody.entry(asset).or_insert(Decimal::ZERO) += amount.value();
        Ok(())
    }

    fn transfer_out(
        &mut self,
        asset: AssetId,
        to: UserId,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        if amount.is_negative() {
            return Err(LedgerError::NegativeAmount(amount.value()));
        }
        if amount.is_zero() {
            return Ok(());
        }
        let custody = self.custody.entry(asset).or_insert(Decimal::ZERO);
        if *custody < amount.value() {
            return Err(LedgerError::InsufficientCustody {
                asset,
                requested: amount.value(),
                available: *custody,
            });
        }
        *custody -= amount.value();
        *self.balances.entry((asset, to)).or_insert(Decimal::ZERO) += amount.value();
        Ok(())
    }

    fn balance_of(&self, asset: AssetId, user: UserId) -> Amount {
        Amount::new(
            self.balances
                .get(&(asset, user))
                .copied()
                .unwrap_or(Decimal::ZERO),
        )
    }

    fn custody(&self, asset: AssetId) -> Amount {
        Amount::new(self.custody.get(&asset).copied().unwrap_or(Decimal::ZERO))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryReferralDirectory {
    codes: HashMap<UserId, u64>,
    owners: HashMap<u64, UserId>,
}

impl MemoryReferralDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `owner` as the referrer behind `code`.
    pub fn register_code(&mut self, code: u64, owner: UserId) {
        self.owners.insert(code, owner);
    }
}

impl ReferralDirectory for MemoryReferralDirectory {
    fn info(&self, user: UserId) -> Option<(u64, UserId)> {
        let code = self.codes.get(&user)?;
        let referrer = self.owners.get(code)?;
        Some((*code, *referrer))
    }

    fn set(&mut self, user: UserId, code: u64) {
        self.codes.insert(user, code);
    }
}

/// Verifier with a fixed allow-list of users whose signatures check out. The
/// empty-signature case never verifies.
#[derive(Debug, Clone, Default)]
pub struct AllowListVerifier {
    allowed: HashSet<UserId>,
}

impl AllowListVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, user: UserId) {
        self.allowed.insert(user);
    }
}

impl SignatureVerifier for AllowListVerifier {
    fn verify(&self, user: UserId, signature: &[u8]) -> bool {
        !signature.is_empty() && self.allowed.contains(&user)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("transfer amount {0} is negative")]
    NegativeAmount(Decimal),

    #[error("user {user:?} holds {available} of asset {asset:?}, needed {requested}")]
    InsufficientFunds {
        asset: AssetId,
        user: UserId,
        requested: Decimal,
        available: Decimal,
    },

    #[error("custody holds {available} of asset {asset:?}, needed {requested}")]
    InsufficientCustody {
        asset: AssetId,
        requested: Decimal,
        available: Decimal,
    },
}
