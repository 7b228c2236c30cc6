//! # Stepledger
//!
//! Coin wallet, step rewards and order reservations for a move-to-earn
//! platform: users submit daily step counts, earn coins for them, and
//! spend those coins on orders that reserve first and settle on
//! confirmation.
//!
//! ## What's inside
//!
//! ### Coin wallet
//! One wallet per user, with an `available` and a `frozen` bucket plus
//! lifetime counters. Every mutation runs as a single atomic critical
//! section inside the storage adapter and appends a [`LedgerEntry`];
//! the signed entry sum reconciles against the wallet at any time.
//!
//! ### Reservations
//! Spending is two-phase. Placing an order freezes its total under a hold
//! keyed by the order id, confirmation settles the hold, cancellation
//! releases it. A hold resolves exactly once, so an order can never
//! charge a wallet twice, even under concurrent confirms.
//!
//! ### Step validation
//! Submissions pass hard bounds and a stride plausibility check. Manual
//! entries are scored against the user's own average; suspicious ones are
//! parked unverified in an admin review queue instead of minting coins.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use stepledger::StepLedger;
//!
//! let ledger = StepLedger::in_memory();
//! let record = ledger.steps().record(submission).await?;
//! let balance = ledger.coins().balance(user).await?;
//! ```
//!
//! For Postgres, build an [`adapters::PostgresAdapter`] from a pool, run
//! `init_schema()` once, and hand the adapter to [`StepLedger::new`].

pub mod adapters;
pub mod coin;
pub mod entry;
pub mod error;
pub mod order;
pub mod reservation;
pub mod settings;
pub mod steps;
pub mod wallet;

pub use adapters::{
    MemoryAdapter, OrderStore, PostgresAdapter, SettingStore, StepStore, WalletStore,
};
pub use coin::{CoinService, MutationReceipt, Reconciliation, WalletMutation};
pub use entry::{EntryKind, LedgerEntry, Reference};
pub use error::CoinError;
pub use order::{NewOrderItem, Order, OrderItem, OrderService, OrderStatus};
pub use reservation::{HoldState, Reservation};
pub use settings::{Setting, SettingsService};
pub use steps::{
    ReviewStatus, StepRecord, StepService, StepSource, StepSubmission, ValidationOutcome,
};
pub use wallet::{Balance, Wallet};

use std::sync::Arc;

/// The full platform surface wired over one storage adapter.
#[derive(Clone)]
pub struct StepLedger {
    coins: CoinService,
    steps: StepService,
    orders: OrderService,
    settings: SettingsService,
}

impl StepLedger {
    /// Wire every service over a single adapter instance.
    pub fn new<A>(adapter: A) -> Self
    where
        A: WalletStore + StepStore + OrderStore + SettingStore + 'static,
    {
        let adapter = Arc::new(adapter);
        Self::from_parts(
            adapter.clone(),
            adapter.clone(),
            adapter.clone(),
            adapter,
        )
    }

    /// Wire services over independently chosen stores.
    pub fn from_parts(
        wallets: Arc<dyn WalletStore>,
        steps: Arc<dyn StepStore>,
        orders: Arc<dyn OrderStore>,
        settings: Arc<dyn SettingStore>,
    ) -> Self {
        let coins = CoinService::new(wallets);
        let settings = SettingsService::new(settings);
        let steps = StepService::new(steps, coins.clone(), settings.clone());
        let orders = OrderService::new(orders, coins.clone());
        Self {
            coins,
            steps,
            orders,
            settings,
        }
    }

    /// Everything in memory, for tests and embedding.
    pub fn in_memory() -> Self {
        Self::new(MemoryAdapter::new())
    }

    pub fn coins(&self) -> &CoinService {
        &self.coins
    }

    pub fn steps(&self) -> &StepService {
        &self.steps
    }

    pub fn orders(&self) -> &OrderService {
        &self.orders
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }
}
