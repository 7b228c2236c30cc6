// src/wallet.rs
use crate::error::CoinError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-user coin wallet.
///
/// Invariants:
/// - `available` and `frozen` never go below zero (structural, u64)
/// - `total_earned` and `total_spent` only ever grow
/// - every mutation happens through [`Wallet::apply`] inside the adapter's
///   per-wallet critical section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: Uuid,
    pub available: u64,
    pub frozen: u64,
    pub total_earned: u64,
    pub total_spent: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Balance transition applied under the wallet lock.
#[derive(Debug, Clone, Copy)]
pub enum WalletOp {
    Grant { amount: u64, counts_earned: bool },
    Spend { amount: u64 },
    Freeze { amount: u64 },
    Unfreeze { amount: u64 },
    Settle { amount: u64 },
    Penalize { amount: u64 },
}

impl Wallet {
    pub fn new(user_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            available: 0,
            frozen: 0,
            total_earned: 0,
            total_spent: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one balance transition. Returns the amount actually moved,
    /// which differs from the requested amount only for `Penalize` (clamped
    /// to the available balance).
    ///
    /// All balance rules live here so both adapters execute the exact same
    /// arithmetic on the explicit post-state.
    pub fn apply(&mut self, op: WalletOp) -> Result<u64, CoinError> {
        let moved = match op {
            WalletOp::Grant {
                amount,
                counts_earned,
            } => {
                self.available += amount;
                if counts_earned {
                    self.total_earned += amount;
                }
                amount
            }
            WalletOp::Spend { amount } => {
                if self.available < amount {
                    return Err(CoinError::InsufficientBalance {
                        required: amount,
                        available: self.available,
                    });
                }
                self.available -= amount;
                self.total_spent += amount;
                amount
            }
            WalletOp::Freeze { amount } => {
                if self.available < amount {
                    return Err(CoinError::InsufficientBalance {
                        required: amount,
                        available: self.available,
                    });
                }
                self.available -= amount;
                self.frozen += amount;
                amount
            }
            WalletOp::Unfreeze { amount } => {
                if self.frozen < amount {
                    return Err(CoinError::InvalidState(format!(
                        "unfreeze of {} exceeds frozen balance {}",
                        amount, self.frozen
                    )));
                }
                self.frozen -= amount;
                self.available += amount;
                amount
            }
            WalletOp::Settle { amount } => {
                if self.frozen < amount {
                    return Err(CoinError::InvalidState(format!(
                        "settle of {} exceeds frozen balance {}",
                        amount, self.frozen
                    )));
                }
                self.frozen -= amount;
                self.total_spent += amount;
                amount
            }
            WalletOp::Penalize { amount } => {
                let actual = amount.min(self.available);
                self.available -= actual;
                actual
            }
        };

        self.updated_at = Utc::now();
        Ok(moved)
    }

    pub fn balance(&self) -> Balance {
        Balance {
            user_id: self.user_id,
            available: self.available,
            frozen: self.frozen,
            total: self.available + self.frozen,
            total_earned: self.total_earned,
            total_spent: self.total_spent,
            timestamp: Utc::now(),
        }
    }
}

/// Read snapshot returned by every balance-touching operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: Uuid,
    pub available: u64,
    pub frozen: u64,
    pub total: u64,
    pub total_earned: u64,
    pub total_spent: u64,
    pub timestamp: DateTime<Utc>,
}
