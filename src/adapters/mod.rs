// src/adapters/mod.rs
use crate::coin::{MutationReceipt, WalletMutation};
use crate::entry::LedgerEntry;
use crate::error::CoinError;
use crate::order::{Order, OrderStatus};
use crate::reservation::Reservation;
use crate::settings::Setting;
use crate::steps::{ReviewStatus, StepRecord, ValidationOutcome};
use crate::wallet::Wallet;
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryAdapter;
pub use postgres::PostgresAdapter;

/// Wallet rows, ledger entries and holds.
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Execute one wallet mutation atomically.
    /// Implementors MUST:
    /// 1. BEGIN a transaction (or take the wallet's lock)
    /// 2. Load the wallet row FOR UPDATE, plus the hold row named by
    ///    `mutation.hold_key()` when present
    /// 3. Run `mutation.apply_to` on that state, so every balance and
    ///    hold check happens inside the lock
    /// 4. Persist the returned wallet post-state, ledger entry and hold
    /// 5. COMMIT on success, ROLLBACK on any error
    async fn execute(
        &self,
        user: Uuid,
        mutation: WalletMutation,
    ) -> Result<MutationReceipt, CoinError>;

    // READ OPERATIONS
    async fn get_wallet(&self, user: Uuid) -> Result<Wallet, CoinError>;
    async fn get_hold(&self, reference_id: Uuid) -> Result<Reservation, CoinError>;
    /// Newest-first page of the user's ledger.
    async fn entries(&self, user: Uuid, limit: u32, offset: u32)
    -> Result<Vec<LedgerEntry>, CoinError>;
    /// Sum of signed entry weights for reconciliation.
    async fn entry_sum(&self, user: Uuid) -> Result<i64, CoinError>;
}

/// Orders, line items and the per-day code sequence.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn insert_order(&self, order: Order) -> Result<(), CoinError>;
    async fn get_order(&self, id: Uuid) -> Result<Order, CoinError>;
    async fn get_order_by_code(&self, code: &str) -> Result<Order, CoinError>;
    /// Newest-first page of a user's orders, optionally filtered by status.
    async fn list_orders(
        &self,
        user: Uuid,
        status: Option<OrderStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, CoinError>;
    /// Atomic compare-and-swap on the order status.
    /// Fails with `IllegalTransition { from: actual, .. }` when the current
    /// status no longer matches `from`, so a lost race is always loud.
    /// Stamps the status timestamp for `to` and stores `reason` on
    /// cancellation.
    async fn transition_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, CoinError>;
    /// Next value of the per-day order code sequence, already formatted.
    async fn next_order_code(&self, date: NaiveDate) -> Result<String, CoinError>;
}

/// Step records and their review outcomes.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Insert a record, enforcing at most one per
    /// (user, recorded_date, source). Duplicate submissions fail with
    /// `Conflict`.
    async fn insert_record(&self, record: StepRecord) -> Result<(), CoinError>;
    async fn insert_outcome(&self, outcome: ValidationOutcome) -> Result<(), CoinError>;
    async fn get_record(&self, id: Uuid) -> Result<StepRecord, CoinError>;
    /// Flip a record to verified with its awarded coins, returning the
    /// updated row.
    async fn mark_verified(&self, record_id: Uuid, coins_awarded: u64)
    -> Result<StepRecord, CoinError>;
    /// Newest-first page of a user's records.
    async fn records_for_user(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StepRecord>, CoinError>;
    /// Mean steps per record across the user's history, 0.0 when empty.
    async fn average_steps(&self, user: Uuid) -> Result<f64, CoinError>;
    async fn total_steps(&self, user: Uuid) -> Result<i64, CoinError>;
    /// Pending outcomes at or above the score threshold, most suspicious
    /// first.
    async fn pending_outcomes(
        &self,
        min_score: f64,
        limit: u32,
    ) -> Result<Vec<ValidationOutcome>, CoinError>;
    async fn get_outcome(&self, id: Uuid) -> Result<ValidationOutcome, CoinError>;
    /// Atomic compare-and-swap from `Pending` to the decision. A second
    /// decision on the same outcome fails with `Conflict`.
    async fn resolve_outcome(
        &self,
        id: Uuid,
        status: ReviewStatus,
        admin: Uuid,
        comment: Option<String>,
    ) -> Result<ValidationOutcome, CoinError>;
}

/// Keyed runtime settings.
#[async_trait]
pub trait SettingStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, CoinError>;
    /// Insert or overwrite.
    async fn put_setting(&self, setting: Setting) -> Result<(), CoinError>;
    async fn list_settings(&self) -> Result<Vec<Setting>, CoinError>;
}
