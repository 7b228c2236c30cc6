// src/coin.rs
use crate::adapters::WalletStore;
use crate::entry::{EntryKind, LedgerEntry, Reference};
use crate::error::CoinError;
use crate::reservation::{HoldState, Reservation};
use crate::wallet::{Balance, Wallet, WalletOp};
use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// One wallet mutation, executed atomically by the storage adapter.
///
/// The decision logic lives in [`WalletMutation::apply_to`], which the
/// adapter calls inside its per-wallet critical section. Adapters load the
/// current wallet row and the hold row named by [`WalletMutation::hold_key`],
/// run `apply_to`, and persist the returned effect in the same scope.
#[derive(Debug, Clone)]
pub enum WalletMutation {
    Grant {
        amount: u64,
        kind: EntryKind,
        reference: Reference,
    },
    Spend {
        amount: u64,
        reference: Reference,
    },
    Freeze {
        amount: u64,
        reference: Reference,
    },
    Unfreeze {
        amount: u64,
        reference: Reference,
    },
    Settle {
        reference: Reference,
    },
    Penalize {
        amount: u64,
        reference: Reference,
    },
}

/// Everything an adapter must persist after a successful mutation.
#[derive(Debug, Clone)]
pub struct MutationEffect {
    /// Explicit post-state. Adapters write these columns verbatim.
    pub wallet: Wallet,
    /// Ledger entry to append, if the mutation moved value.
    pub entry: Option<LedgerEntry>,
    /// Hold row to upsert (created by freeze, resolved by settle/unfreeze).
    pub hold: Option<Reservation>,
    /// Amount actually moved. Differs from the requested amount only for
    /// a clamped penalty.
    pub moved: u64,
}

/// What the adapter hands back to the service layer.
#[derive(Debug, Clone)]
pub struct MutationReceipt {
    pub balance: Balance,
    pub entry: Option<LedgerEntry>,
    pub moved: u64,
}

impl WalletMutation {
    pub fn name(&self) -> &'static str {
        match self {
            WalletMutation::Grant { .. } => "grant",
            WalletMutation::Spend { .. } => "spend",
            WalletMutation::Freeze { .. } => "freeze",
            WalletMutation::Unfreeze { .. } => "unfreeze",
            WalletMutation::Settle { .. } => "settle",
            WalletMutation::Penalize { .. } => "penalize",
        }
    }

    /// Reference id whose hold row must be locked together with the wallet.
    pub fn hold_key(&self) -> Option<Uuid> {
        match self {
            WalletMutation::Freeze { reference, .. }
            | WalletMutation::Unfreeze { reference, .. }
            | WalletMutation::Settle { reference } => reference.id,
            _ => None,
        }
    }

    /// Grants create the wallet on first contact; everything else requires
    /// an existing wallet (an absent wallet is not a zero wallet).
    pub fn creates_wallet(&self) -> bool {
        matches!(self, WalletMutation::Grant { .. })
    }

    /// Pure transition from the locked state to the effect to persist.
    /// Every check in here runs inside the adapter's critical section, so
    /// the answers cannot go stale before the write.
    pub fn apply_to(
        &self,
        user: Uuid,
        wallet: Option<Wallet>,
        hold: Option<Reservation>,
    ) -> Result<MutationEffect, CoinError> {
        let mut wallet = match wallet {
            Some(w) => w,
            None if self.creates_wallet() => Wallet::new(user),
            None => return Err(CoinError::WalletNotFound),
        };

        match self {
            WalletMutation::Grant {
                amount,
                kind,
                reference,
            } => {
                if *amount == 0 {
                    return Err(CoinError::InvalidAmount);
                }
                if !kind.is_credit() {
                    return Err(CoinError::Validation(format!(
                        "grant requires a credit entry kind, got {}",
                        kind
                    )));
                }
                let moved = wallet.apply(WalletOp::Grant {
                    amount: *amount,
                    counts_earned: kind.counts_earned(),
                })?;
                Ok(MutationEffect {
                    entry: Some(LedgerEntry::new(user, *kind, *amount, reference.clone())),
                    hold: None,
                    wallet,
                    moved,
                })
            }
            WalletMutation::Spend { amount, reference } => {
                if *amount == 0 {
                    return Err(CoinError::InvalidAmount);
                }
                let moved = wallet.apply(WalletOp::Spend { amount: *amount })?;
                Ok(MutationEffect {
                    entry: Some(LedgerEntry::new(
                        user,
                        EntryKind::Spent,
                        *amount,
                        reference.clone(),
                    )),
                    hold: None,
                    wallet,
                    moved,
                })
            }
            WalletMutation::Freeze { amount, reference } => {
                if *amount == 0 {
                    return Err(CoinError::InvalidAmount);
                }
                let reference_id = reference.id.ok_or_else(|| {
                    CoinError::Validation("freeze requires a reference id".to_string())
                })?;
                // Any existing hold under this reference, resolved or not,
                // means the reservation already happened once
                if hold.is_some() {
                    return Err(CoinError::DuplicateReservation(reference_id));
                }
                let moved = wallet.apply(WalletOp::Freeze { amount: *amount })?;
                Ok(MutationEffect {
                    entry: Some(LedgerEntry::new(
                        user,
                        EntryKind::Reserved,
                        *amount,
                        reference.clone(),
                    )),
                    hold: Some(Reservation::new(reference_id, user, *amount)),
                    wallet,
                    moved,
                })
            }
            WalletMutation::Unfreeze { amount, reference } => {
                let mut hold = hold.ok_or(CoinError::ReservationNotFound)?;
                if hold.user_id != user {
                    return Err(CoinError::Conflict(
                        "reservation belongs to another user".to_string(),
                    ));
                }
                if hold.amount != *amount {
                    return Err(CoinError::InvalidState(format!(
                        "unfreeze amount {} does not match reservation amount {}",
                        amount, hold.amount
                    )));
                }
                if !hold.resolve(HoldState::Released) {
                    return Err(CoinError::InvalidState(
                        "reservation already resolved".to_string(),
                    ));
                }
                let moved = wallet.apply(WalletOp::Unfreeze { amount: *amount })?;
                Ok(MutationEffect {
                    entry: Some(LedgerEntry::new(
                        user,
                        EntryKind::Released,
                        *amount,
                        reference.clone(),
                    )),
                    hold: Some(hold),
                    wallet,
                    moved,
                })
            }
            WalletMutation::Settle { reference } => {
                let mut hold = hold.ok_or(CoinError::ReservationNotFound)?;
                if hold.user_id != user {
                    return Err(CoinError::Conflict(
                        "reservation belongs to another user".to_string(),
                    ));
                }
                // The hold fixes the amount, re-pricing after freeze is
                // unrepresentable
                let amount = hold.amount;
                if !hold.resolve(HoldState::Spent) {
                    return Err(CoinError::InvalidState(
                        "reservation already resolved".to_string(),
                    ));
                }
                let moved = wallet.apply(WalletOp::Settle { amount })?;
                Ok(MutationEffect {
                    entry: Some(LedgerEntry::new(
                        user,
                        EntryKind::Spent,
                        amount,
                        reference.clone(),
                    )),
                    hold: Some(hold),
                    wallet,
                    moved,
                })
            }
            WalletMutation::Penalize { amount, reference } => {
                if *amount == 0 {
                    return Err(CoinError::InvalidAmount);
                }
                let moved = wallet.apply(WalletOp::Penalize { amount: *amount })?;
                // A fully clamped penalty moves nothing and writes nothing:
                // ledger amounts are strictly positive
                let entry = if moved > 0 {
                    Some(LedgerEntry::new(
                        user,
                        EntryKind::Penalty,
                        moved,
                        reference.clone(),
                    ))
                } else {
                    None
                };
                Ok(MutationEffect {
                    entry,
                    hold: None,
                    wallet,
                    moved,
                })
            }
        }
    }
}

/// Audit snapshot comparing the entry sum against the wallet counters.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub user_id: Uuid,
    /// Sum of signed entry weights (holds are weightless).
    pub entry_sum: i64,
    /// `available + frozen` from the wallet row.
    pub wallet_total: u64,
    pub consistent: bool,
}

/// Wallet operations over a [`WalletStore`].
///
/// Every mutation is one atomic critical section per wallet inside the
/// adapter. Reads never take exclusive locks and are advisory by nature.
#[derive(Clone)]
pub struct CoinService {
    wallets: Arc<dyn WalletStore>,
}

impl CoinService {
    pub fn new(wallets: Arc<dyn WalletStore>) -> Self {
        Self { wallets }
    }

    async fn execute(
        &self,
        user: Uuid,
        mutation: WalletMutation,
    ) -> Result<MutationReceipt, CoinError> {
        let op = mutation.name();
        let result = self.wallets.execute(user, mutation).await;

        counter!("coins.mutations.total",
            "op" => op,
            "status" => if result.is_ok() { "success" } else { "failed" }
        )
        .increment(1);

        match &result {
            Ok(receipt) => {
                if receipt.moved > 0 {
                    histogram!("coins.mutation.amount", "op" => op).record(receipt.moved as f64);
                }
                debug!(user = %user, op, moved = receipt.moved, "wallet mutation applied");
            }
            Err(err) => {
                warn!(user = %user, op, error = %err, "wallet mutation rejected");
            }
        }

        result
    }

    /// Credit coins. `Earned` and `Bonus` count toward `total_earned`,
    /// `Refund` does not. Creates the wallet on first credit.
    pub async fn grant(
        &self,
        user: Uuid,
        amount: u64,
        kind: EntryKind,
        reference: Reference,
    ) -> Result<Balance, CoinError> {
        let receipt = self
            .execute(
                user,
                WalletMutation::Grant {
                    amount,
                    kind,
                    reference,
                },
            )
            .await?;
        Ok(receipt.balance)
    }

    /// Direct spend from the available balance, for charges that never went
    /// through a reservation.
    pub async fn spend(
        &self,
        user: Uuid,
        amount: u64,
        reference: Reference,
    ) -> Result<Balance, CoinError> {
        let receipt = self
            .execute(user, WalletMutation::Spend { amount, reference })
            .await?;
        Ok(receipt.balance)
    }

    /// Move coins from available to frozen under a hold keyed by
    /// `reference.id`. A second freeze on the same reference fails with
    /// [`CoinError::DuplicateReservation`].
    pub async fn freeze(
        &self,
        user: Uuid,
        amount: u64,
        reference: Reference,
    ) -> Result<Balance, CoinError> {
        let receipt = self
            .execute(user, WalletMutation::Freeze { amount, reference })
            .await?;
        Ok(receipt.balance)
    }

    /// Return held coins to the available balance. The amount must match
    /// the hold exactly.
    pub async fn unfreeze(
        &self,
        user: Uuid,
        amount: u64,
        reference: Reference,
    ) -> Result<Balance, CoinError> {
        let receipt = self
            .execute(user, WalletMutation::Unfreeze { amount, reference })
            .await?;
        Ok(receipt.balance)
    }

    /// Consume a hold: frozen coins leave the wallet for good and
    /// `total_spent` grows by the hold's amount. Takes no amount on
    /// purpose, the hold is authoritative.
    pub async fn settle(&self, user: Uuid, reference: Reference) -> Result<Balance, CoinError> {
        let receipt = self
            .execute(user, WalletMutation::Settle { reference })
            .await?;
        Ok(receipt.balance)
    }

    /// Deduct up to `amount` from the available balance. Returns the new
    /// balance and the amount actually deducted, which the penalty entry
    /// records (no entry is written when nothing could be deducted).
    pub async fn penalize(
        &self,
        user: Uuid,
        amount: u64,
        reason: impl Into<String>,
    ) -> Result<(Balance, u64), CoinError> {
        let receipt = self
            .execute(
                user,
                WalletMutation::Penalize {
                    amount,
                    reference: Reference::admin(reason.into()),
                },
            )
            .await?;
        Ok((receipt.balance, receipt.moved))
    }

    /// Balance snapshot. An absent wallet is an error, not a zero balance.
    pub async fn balance(&self, user: Uuid) -> Result<Balance, CoinError> {
        let wallet = self.wallets.get_wallet(user).await?;
        Ok(wallet.balance())
    }

    /// Advisory affordability check. Never authoritative: every mutation
    /// re-verifies inside its own lock. A missing wallet reads as false.
    pub async fn has_enough(&self, user: Uuid, amount: u64) -> Result<bool, CoinError> {
        match self.wallets.get_wallet(user).await {
            Ok(wallet) => Ok(wallet.available >= amount),
            Err(CoinError::WalletNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Newest-first page of the user's ledger.
    pub async fn history(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, CoinError> {
        self.wallets.entries(user, limit, offset).await
    }

    /// Recompute the signed entry sum and compare it against the wallet.
    /// A mismatch means a write went around the ledger, or touched only
    /// one side of it; it is reported, never "fixed" silently.
    pub async fn reconcile(&self, user: Uuid) -> Result<Reconciliation, CoinError> {
        let wallet = self.wallets.get_wallet(user).await?;
        let entry_sum = self.wallets.entry_sum(user).await?;
        let wallet_total = wallet.available + wallet.frozen;
        let consistent = entry_sum >= 0 && entry_sum as u64 == wallet_total;

        if !consistent {
            counter!("coins.reconciliation.mismatch").increment(1);
            error!(
                user = %user,
                entry_sum,
                wallet_total,
                "ledger entries do not reconcile with wallet balances"
            );
        }

        Ok(Reconciliation {
            user_id: user,
            entry_sum,
            wallet_total,
            consistent,
        })
    }
}
