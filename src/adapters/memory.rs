// src/adapters/memory.rs
use crate::adapters::{OrderStore, SettingStore, StepStore, WalletStore};
use crate::coin::{MutationReceipt, WalletMutation};
use crate::entry::LedgerEntry;
use crate::error::CoinError;
use crate::order::{Order, OrderStatus, format_order_code};
use crate::reservation::Reservation;
use crate::settings::{Setting, default_settings};
use crate::steps::{ReviewStatus, StepRecord, ValidationOutcome};
use crate::wallet::Wallet;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Everything owned by one wallet: the row itself, its ledger and its
/// holds. The slot mutex is the per-wallet critical section.
#[derive(Default)]
struct WalletSlot {
    wallet: Option<Wallet>,
    entries: Vec<LedgerEntry>,
    holds: HashMap<Uuid, Reservation>,
}

#[derive(Clone)]
struct MemoryStore {
    wallets: Arc<Mutex<HashMap<Uuid, Arc<Mutex<WalletSlot>>>>>,
    orders: Arc<Mutex<HashMap<Uuid, Order>>>,
    order_codes: Arc<Mutex<HashMap<NaiveDate, u64>>>,
    records: Arc<Mutex<HashMap<Uuid, StepRecord>>>,
    outcomes: Arc<Mutex<HashMap<Uuid, ValidationOutcome>>>,
    settings: Arc<Mutex<HashMap<String, Setting>>>,
}

impl MemoryStore {
    fn new() -> Self {
        let mut settings = HashMap::new();
        for setting in default_settings() {
            settings.insert(setting.key.clone(), setting);
        }

        Self {
            wallets: Arc::new(Mutex::new(HashMap::new())),
            orders: Arc::new(Mutex::new(HashMap::new())),
            order_codes: Arc::new(Mutex::new(HashMap::new())),
            records: Arc::new(Mutex::new(HashMap::new())),
            outcomes: Arc::new(Mutex::new(HashMap::new())),
            settings: Arc::new(Mutex::new(settings)),
        }
    }

    /// Slot for mutation, created on first contact. The outer map lock is
    /// only held long enough to clone the Arc; distinct users never
    /// contend past this point.
    fn slot(&self, user: Uuid) -> Arc<Mutex<WalletSlot>> {
        let mut wallets = self.wallets.lock().unwrap();
        Arc::clone(wallets.entry(user).or_default())
    }

    /// Slot for reads, without materializing one for unknown users.
    fn read_slot(&self, user: Uuid) -> Option<Arc<Mutex<WalletSlot>>> {
        self.wallets.lock().unwrap().get(&user).cloned()
    }
}

/// In-process adapter for tests and embedding.
pub struct MemoryAdapter {
    store: MemoryStore,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletStore for MemoryAdapter {
    async fn execute(
        &self,
        user: Uuid,
        mutation: WalletMutation,
    ) -> Result<MutationReceipt, CoinError> {
        let slot_arc = self.store.slot(user);
        let mut slot = slot_arc.lock().unwrap();

        let wallet = slot.wallet.clone();
        let hold = mutation
            .hold_key()
            .and_then(|id| slot.holds.get(&id).cloned());

        // Verified inside the slot lock; this is the double-spend guard
        let effect = mutation.apply_to(user, wallet, hold)?;

        slot.wallet = Some(effect.wallet.clone());
        if let Some(hold) = effect.hold.clone() {
            slot.holds.insert(hold.reference_id, hold);
        }
        if let Some(entry) = effect.entry.clone() {
            slot.entries.push(entry);
        }

        Ok(MutationReceipt {
            balance: effect.wallet.balance(),
            entry: effect.entry,
            moved: effect.moved,
        })
    }

    async fn get_wallet(&self, user: Uuid) -> Result<Wallet, CoinError> {
        let slot_arc = self.store.read_slot(user).ok_or(CoinError::WalletNotFound)?;
        let slot = slot_arc.lock().unwrap();
        slot.wallet.clone().ok_or(CoinError::WalletNotFound)
    }

    async fn get_hold(&self, reference_id: Uuid) -> Result<Reservation, CoinError> {
        let wallets = self.store.wallets.lock().unwrap();
        for slot in wallets.values() {
            let slot = slot.lock().unwrap();
            if let Some(hold) = slot.holds.get(&reference_id) {
                return Ok(hold.clone());
            }
        }
        Err(CoinError::ReservationNotFound)
    }

    async fn entries(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, CoinError> {
        let Some(slot_arc) = self.store.read_slot(user) else {
            return Ok(Vec::new());
        };
        let slot = slot_arc.lock().unwrap();

        // Stored oldest-first, served newest-first
        let mut entries = slot.entries.clone();
        entries.reverse();
        Ok(entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn entry_sum(&self, user: Uuid) -> Result<i64, CoinError> {
        match self.store.read_slot(user) {
            Some(slot_arc) => {
                let slot = slot_arc.lock().unwrap();
                Ok(slot.entries.iter().map(LedgerEntry::signed).sum())
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl OrderStore for MemoryAdapter {
    async fn insert_order(&self, order: Order) -> Result<(), CoinError> {
        let mut orders = self.store.orders.lock().unwrap();
        if orders.contains_key(&order.id) {
            return Err(CoinError::Conflict(format!(
                "order {} already exists",
                order.id
            )));
        }
        orders.insert(order.id, order);
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Order, CoinError> {
        let orders = self.store.orders.lock().unwrap();
        orders.get(&id).cloned().ok_or(CoinError::OrderNotFound)
    }

    async fn get_order_by_code(&self, code: &str) -> Result<Order, CoinError> {
        let orders = self.store.orders.lock().unwrap();
        orders
            .values()
            .find(|order| order.code == code)
            .cloned()
            .ok_or(CoinError::OrderNotFound)
    }

    async fn list_orders(
        &self,
        user: Uuid,
        status: Option<OrderStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, CoinError> {
        let orders = self.store.orders.lock().unwrap();
        let mut matching: Vec<Order> = orders
            .values()
            .filter(|order| {
                order.user_id == user && status.is_none_or(|wanted| order.status == wanted)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn transition_order(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, CoinError> {
        if !from.can_transition_to(to) {
            return Err(CoinError::IllegalTransition { from, to });
        }

        let mut orders = self.store.orders.lock().unwrap();
        let order = orders.get_mut(&id).ok_or(CoinError::OrderNotFound)?;

        // Compare-and-swap under the map lock: the loser of a race sees
        // the winner's status here
        if order.status != from {
            return Err(CoinError::IllegalTransition {
                from: order.status,
                to,
            });
        }

        let now = Utc::now();
        order.status = to;
        order.updated_at = now;
        match to {
            OrderStatus::Confirmed => order.confirmed_at = Some(now),
            OrderStatus::Shipped => order.shipped_at = Some(now),
            OrderStatus::Delivered => order.delivered_at = Some(now),
            OrderStatus::Cancelled => order.cancelled_reason = reason,
            _ => {}
        }

        Ok(order.clone())
    }

    async fn next_order_code(&self, date: NaiveDate) -> Result<String, CoinError> {
        let mut codes = self.store.order_codes.lock().unwrap();
        let seq = codes.entry(date).or_insert(0);
        *seq += 1;
        Ok(format_order_code(date, *seq))
    }
}

#[async_trait]
impl StepStore for MemoryAdapter {
    async fn insert_record(&self, record: StepRecord) -> Result<(), CoinError> {
        let mut records = self.store.records.lock().unwrap();
        let duplicate = records.values().any(|existing| {
            existing.user_id == record.user_id
                && existing.recorded_date == record.recorded_date
                && existing.source == record.source
        });
        if duplicate {
            return Err(CoinError::Conflict(format!(
                "steps already recorded for {} from {}",
                record.recorded_date,
                record.source.as_str()
            )));
        }
        records.insert(record.id, record);
        Ok(())
    }

    async fn insert_outcome(&self, outcome: ValidationOutcome) -> Result<(), CoinError> {
        let mut outcomes = self.store.outcomes.lock().unwrap();
        outcomes.insert(outcome.id, outcome);
        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<StepRecord, CoinError> {
        let records = self.store.records.lock().unwrap();
        records.get(&id).cloned().ok_or(CoinError::RecordNotFound)
    }

    async fn mark_verified(
        &self,
        record_id: Uuid,
        coins_awarded: u64,
    ) -> Result<StepRecord, CoinError> {
        let mut records = self.store.records.lock().unwrap();
        let record = records
            .get_mut(&record_id)
            .ok_or(CoinError::RecordNotFound)?;
        record.verified = true;
        record.coins_awarded = coins_awarded;
        Ok(record.clone())
    }

    async fn records_for_user(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StepRecord>, CoinError> {
        let records = self.store.records.lock().unwrap();
        let mut matching: Vec<StepRecord> = records
            .values()
            .filter(|record| record.user_id == user)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn average_steps(&self, user: Uuid) -> Result<f64, CoinError> {
        let records = self.store.records.lock().unwrap();
        let steps: Vec<i64> = records
            .values()
            .filter(|record| record.user_id == user)
            .map(|record| record.steps)
            .collect();
        if steps.is_empty() {
            return Ok(0.0);
        }
        Ok(steps.iter().sum::<i64>() as f64 / steps.len() as f64)
    }

    async fn total_steps(&self, user: Uuid) -> Result<i64, CoinError> {
        let records = self.store.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|record| record.user_id == user)
            .map(|record| record.steps)
            .sum())
    }

    async fn pending_outcomes(
        &self,
        min_score: f64,
        limit: u32,
    ) -> Result<Vec<ValidationOutcome>, CoinError> {
        let outcomes = self.store.outcomes.lock().unwrap();
        let mut matching: Vec<ValidationOutcome> = outcomes
            .values()
            .filter(|outcome| {
                outcome.status == ReviewStatus::Pending && outcome.anomaly_score >= min_score
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.anomaly_score
                .partial_cmp(&a.anomaly_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn get_outcome(&self, id: Uuid) -> Result<ValidationOutcome, CoinError> {
        let outcomes = self.store.outcomes.lock().unwrap();
        outcomes.get(&id).cloned().ok_or(CoinError::RecordNotFound)
    }

    async fn resolve_outcome(
        &self,
        id: Uuid,
        status: ReviewStatus,
        admin: Uuid,
        comment: Option<String>,
    ) -> Result<ValidationOutcome, CoinError> {
        let mut outcomes = self.store.outcomes.lock().unwrap();
        let outcome = outcomes.get_mut(&id).ok_or(CoinError::RecordNotFound)?;

        // Compare-and-swap under the map lock
        if outcome.status != ReviewStatus::Pending {
            return Err(CoinError::Conflict("review already resolved".to_string()));
        }

        outcome.status = status;
        outcome.reviewed_by = Some(admin);
        outcome.review_comment = comment;
        outcome.reviewed_at = Some(Utc::now());
        Ok(outcome.clone())
    }
}

#[async_trait]
impl SettingStore for MemoryAdapter {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, CoinError> {
        let settings = self.store.settings.lock().unwrap();
        Ok(settings.get(key).cloned())
    }

    async fn put_setting(&self, setting: Setting) -> Result<(), CoinError> {
        let mut settings = self.store.settings.lock().unwrap();
        settings.insert(setting.key.clone(), setting);
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, CoinError> {
        let settings = self.store.settings.lock().unwrap();
        let mut all: Vec<Setting> = settings.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}
