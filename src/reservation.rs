// src/reservation.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a coin hold.
/// Transitions are one-way: frozen -> spent (settle) or frozen -> released.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    /// Value moved out of the available bucket, waiting for resolution
    Frozen,
    /// Hold consumed, value left the wallet for good
    Spent,
    /// Hold cancelled, value returned to the available bucket
    Released,
}

impl HoldState {
    pub fn can_transition_to(&self, target: HoldState) -> bool {
        match (self, target) {
            (HoldState::Frozen, HoldState::Spent) => true,
            (HoldState::Frozen, HoldState::Released) => true,
            // Spent and Released are terminal, and no state re-enters itself
            _ => false,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, HoldState::Frozen)
    }

    pub fn is_resolved(&self) -> bool {
        !self.is_frozen()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HoldState::Frozen => "frozen",
            HoldState::Spent => "spent",
            HoldState::Released => "released",
        }
    }

    pub fn parse(value: &str) -> Option<HoldState> {
        match value {
            "frozen" => Some(HoldState::Frozen),
            "spent" => Some(HoldState::Spent),
            "released" => Some(HoldState::Released),
            _ => None,
        }
    }
}

/// A hold over frozen coins, keyed by the reference that created it
/// (for orders, the order id).
///
/// The key is the dedupe guard: one reference can only ever freeze once.
/// The stored amount is authoritative at settle time, so the charge can
/// never drift from what was reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reference_id: Uuid,
    pub user_id: Uuid,
    pub amount: u64,
    pub state: HoldState,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(reference_id: Uuid, user_id: Uuid, amount: u64) -> Self {
        Self {
            reference_id,
            user_id,
            amount,
            state: HoldState::Frozen,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Move the hold to a terminal state. Stamps `resolved_at`.
    pub fn resolve(&mut self, target: HoldState) -> bool {
        if !self.state.can_transition_to(target) {
            return false;
        }
        self.state = target;
        self.resolved_at = Some(Utc::now());
        true
    }
}
