// src/entry.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a ledger entry.
///
/// `Reserved` and `Released` track a hold moving value between the
/// available and frozen buckets of the same wallet. They carry zero weight
/// in balance reconstruction; `Spent` is only written when value actually
/// leaves the wallet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Earned,
    Bonus,
    Refund,
    Spent,
    Penalty,
    Reserved,
    Released,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Earned => "earned",
            EntryKind::Bonus => "bonus",
            EntryKind::Refund => "refund",
            EntryKind::Spent => "spent",
            EntryKind::Penalty => "penalty",
            EntryKind::Reserved => "reserved",
            EntryKind::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<EntryKind> {
        match value {
            "earned" => Some(EntryKind::Earned),
            "bonus" => Some(EntryKind::Bonus),
            "refund" => Some(EntryKind::Refund),
            "spent" => Some(EntryKind::Spent),
            "penalty" => Some(EntryKind::Penalty),
            "reserved" => Some(EntryKind::Reserved),
            "released" => Some(EntryKind::Released),
            _ => None,
        }
    }

    /// True for kinds that add spendable value to the wallet.
    pub fn is_credit(&self) -> bool {
        matches!(self, EntryKind::Earned | EntryKind::Bonus | EntryKind::Refund)
    }

    /// True for credit kinds that count toward `total_earned`.
    /// Refunds restore value, they do not create it.
    pub fn counts_earned(&self) -> bool {
        matches!(self, EntryKind::Earned | EntryKind::Bonus)
    }

    /// Reconciliation weight of an entry of this kind.
    /// Invariant: the sum of weights over a wallet's entries equals
    /// `available + frozen` after every operation.
    pub fn signed(&self, amount: u64) -> i64 {
        match self {
            EntryKind::Earned | EntryKind::Bonus | EntryKind::Refund => amount as i64,
            EntryKind::Spent | EntryKind::Penalty => -(amount as i64),
            EntryKind::Reserved | EntryKind::Released => 0,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an entry points back at: a step record, an order, an admin action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub kind: String,
    pub id: Option<Uuid>,
    pub note: Option<String>,
}

impl Reference {
    pub fn new(kind: impl Into<String>, id: Option<Uuid>, note: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            id,
            note,
        }
    }

    pub fn step_record(id: Uuid) -> Self {
        Self::new("step_record", Some(id), None)
    }

    pub fn order(id: Uuid) -> Self {
        Self::new("order", Some(id), None)
    }

    pub fn admin(note: impl Into<String>) -> Self {
        Self::new("admin", None, Some(note.into()))
    }

    pub fn system(note: impl Into<String>) -> Self {
        Self::new("system", None, Some(note.into()))
    }
}

/// Append-only record of one wallet mutation. Never updated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: EntryKind,
    /// Strictly positive. Direction lives in `kind`.
    pub amount: u64,
    pub reference: Reference,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(user_id: Uuid, kind: EntryKind, amount: u64, reference: Reference) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind,
            amount,
            reference,
            created_at: Utc::now(),
        }
    }

    pub fn signed(&self) -> i64 {
        self.kind.signed(self.amount)
    }
}
