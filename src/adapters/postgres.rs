// src/adapters/postgres.rs
use crate::adapters::{OrderStore, SettingStore, StepStore, WalletStore};
use crate::coin::{MutationReceipt, WalletMutation};
use crate::entry::{EntryKind, LedgerEntry, Reference};
use crate::error::CoinError;
use crate::order::{Order, OrderItem, OrderStatus, format_order_code};
use crate::reservation::{HoldState, Reservation};
use crate::settings::{Setting, default_settings};
use crate::steps::{ReviewStatus, StepRecord, StepSource, ValidationOutcome};
use crate::wallet::Wallet;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

/// Postgres adapter. One wallet mutation is one transaction: lock the
/// wallet row and the named hold row, verify inside the locks, write the
/// explicit post-state, commit.
pub struct PostgresAdapter {
    pool: sqlx::PgPool,
}

impl PostgresAdapter {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &sqlx::PgPool {
        &self.pool
    }

    /// Create every table the adapter needs and seed the default settings.
    /// Idempotent, meant to run at startup.
    pub async fn init_schema(&self) -> Result<(), CoinError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Wallets table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                user_id UUID PRIMARY KEY,
                available BIGINT NOT NULL DEFAULT 0 CHECK (available >= 0),
                frozen BIGINT NOT NULL DEFAULT 0 CHECK (frozen >= 0),
                total_earned BIGINT NOT NULL DEFAULT 0 CHECK (total_earned >= 0),
                total_spent BIGINT NOT NULL DEFAULT 0 CHECK (total_spent >= 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Ledger entries table, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coin_entries (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('earned', 'bonus', 'refund', 'spent', 'penalty', 'reserved', 'released')),
                amount BIGINT NOT NULL CHECK (amount > 0),
                reference_kind TEXT NOT NULL,
                reference_id UUID,
                reference_note TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coin_entries_user
            ON coin_entries(user_id, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Holds table, keyed by the reference that froze the coins
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coin_holds (
                reference_id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                state TEXT NOT NULL CHECK (state IN ('frozen', 'spent', 'released')),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                resolved_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_coin_holds_user
            ON coin_holds(user_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Step records table; the unique constraint is the per-day rule
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_records (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                steps BIGINT NOT NULL CHECK (steps >= 0),
                distance DOUBLE PRECISION,
                source TEXT NOT NULL CHECK (source IN ('manual', 'device', 'wearable', 'import')),
                recorded_date DATE NOT NULL,
                verified BOOLEAN NOT NULL DEFAULT FALSE,
                coins_awarded BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (user_id, recorded_date, source)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_step_records_user
            ON step_records(user_id, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Review outcomes table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS step_validations (
                id UUID PRIMARY KEY,
                record_id UUID NOT NULL REFERENCES step_records(id),
                user_id UUID NOT NULL,
                anomaly_score DOUBLE PRECISION NOT NULL,
                reason TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'approved', 'rejected')),
                reviewed_by UUID,
                review_comment TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                reviewed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_step_validations_queue
            ON step_validations(status, anomaly_score DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Orders table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id UUID PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                user_id UUID NOT NULL,
                total_coins BIGINT NOT NULL CHECK (total_coins > 0),
                status TEXT NOT NULL CHECK (status IN ('pending', 'confirmed', 'processing', 'shipped', 'delivered', 'cancelled', 'refunded')),
                shipping_address TEXT,
                cancelled_reason TEXT,
                confirmed_at TIMESTAMPTZ,
                shipped_at TIMESTAMPTZ,
                delivered_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_user
            ON orders(user_id, created_at DESC)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Order items table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_items (
                id UUID PRIMARY KEY,
                order_id UUID NOT NULL REFERENCES orders(id),
                product_id UUID NOT NULL,
                quantity INTEGER NOT NULL CHECK (quantity > 0),
                price_per_unit BIGINT NOT NULL CHECK (price_per_unit >= 0)
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_order_items_order
            ON order_items(order_id)
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Per-day order code sequence
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS order_code_seq (
                day DATE PRIMARY KEY,
                last_seq BIGINT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Settings table
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                description TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        // Seed defaults without clobbering operator overrides
        for setting in default_settings() {
            sqlx::query(
                r#"
                INSERT INTO settings (key, value, description, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (key) DO NOTHING
                "#,
            )
            .bind(setting.key)
            .bind(setting.value)
            .bind(setting.description)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn items_for(&self, order_id: Uuid) -> Result<Vec<OrderItem>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT id, product_id, quantity, price_per_unit
            FROM order_items
            WHERE order_id = $1
            ORDER BY id
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row_to_item(&row)?);
        }
        Ok(items)
    }

    async fn order_with_items(&self, row: PgRow) -> Result<Order, CoinError> {
        let mut order = row_to_order(&row)?;
        order.items = self.items_for(order.id).await?;
        Ok(order)
    }
}

fn row_to_wallet(row: &PgRow) -> Result<Wallet, CoinError> {
    Ok(Wallet {
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        available: row
            .try_get::<i64, _>("available")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        frozen: row
            .try_get::<i64, _>("frozen")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        total_earned: row
            .try_get::<i64, _>("total_earned")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        total_spent: row
            .try_get::<i64, _>("total_spent")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_hold(row: &PgRow) -> Result<Reservation, CoinError> {
    let state: String = row
        .try_get("state")
        .map_err(|e| CoinError::Storage(e.to_string()))?;
    Ok(Reservation {
        reference_id: row
            .try_get("reference_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        amount: row
            .try_get::<i64, _>("amount")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        state: HoldState::parse(&state)
            .ok_or_else(|| CoinError::Storage(format!("unknown hold state '{}'", state)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        resolved_at: row
            .try_get("resolved_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_entry(row: &PgRow) -> Result<LedgerEntry, CoinError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| CoinError::Storage(e.to_string()))?;
    Ok(LedgerEntry {
        id: row
            .try_get("id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        kind: EntryKind::parse(&kind)
            .ok_or_else(|| CoinError::Storage(format!("unknown entry kind '{}'", kind)))?,
        amount: row
            .try_get::<i64, _>("amount")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        reference: Reference {
            kind: row
                .try_get("reference_kind")
                .map_err(|e| CoinError::Storage(e.to_string()))?,
            id: row
                .try_get("reference_id")
                .map_err(|e| CoinError::Storage(e.to_string()))?,
            note: row
                .try_get("reference_note")
                .map_err(|e| CoinError::Storage(e.to_string()))?,
        },
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_order(row: &PgRow) -> Result<Order, CoinError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoinError::Storage(e.to_string()))?;
    Ok(Order {
        id: row
            .try_get("id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        code: row
            .try_get("code")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        total_coins: row
            .try_get::<i64, _>("total_coins")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        status: OrderStatus::parse(&status)
            .ok_or_else(|| CoinError::Storage(format!("unknown order status '{}'", status)))?,
        items: Vec::new(),
        shipping_address: row
            .try_get("shipping_address")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        cancelled_reason: row
            .try_get("cancelled_reason")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        confirmed_at: row
            .try_get("confirmed_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        shipped_at: row
            .try_get("shipped_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        delivered_at: row
            .try_get("delivered_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_item(row: &PgRow) -> Result<OrderItem, CoinError> {
    Ok(OrderItem {
        id: row
            .try_get("id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        product_id: row
            .try_get("product_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        quantity: row
            .try_get::<i32, _>("quantity")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u32,
        price_per_unit: row
            .try_get::<i64, _>("price_per_unit")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
    })
}

fn row_to_record(row: &PgRow) -> Result<StepRecord, CoinError> {
    let source: String = row
        .try_get("source")
        .map_err(|e| CoinError::Storage(e.to_string()))?;
    Ok(StepRecord {
        id: row
            .try_get("id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        steps: row
            .try_get("steps")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        distance: row
            .try_get("distance")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        source: StepSource::parse(&source)
            .ok_or_else(|| CoinError::Storage(format!("unknown step source '{}'", source)))?,
        recorded_date: row
            .try_get("recorded_date")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        verified: row
            .try_get("verified")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        coins_awarded: row
            .try_get::<i64, _>("coins_awarded")
            .map_err(|e| CoinError::Storage(e.to_string()))? as u64,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_outcome(row: &PgRow) -> Result<ValidationOutcome, CoinError> {
    let status: String = row
        .try_get("status")
        .map_err(|e| CoinError::Storage(e.to_string()))?;
    Ok(ValidationOutcome {
        id: row
            .try_get("id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        record_id: row
            .try_get("record_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        user_id: row
            .try_get("user_id")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        anomaly_score: row
            .try_get("anomaly_score")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        reason: row
            .try_get("reason")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        status: ReviewStatus::parse(&status)
            .ok_or_else(|| CoinError::Storage(format!("unknown review status '{}'", status)))?,
        reviewed_by: row
            .try_get("reviewed_by")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        review_comment: row
            .try_get("review_comment")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        created_at: row
            .try_get("created_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        reviewed_at: row
            .try_get("reviewed_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn row_to_setting(row: &PgRow) -> Result<Setting, CoinError> {
    Ok(Setting {
        key: row
            .try_get("key")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        value: row
            .try_get("value")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        description: row
            .try_get("description")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
        updated_at: row
            .try_get("updated_at")
            .map_err(|e| CoinError::Storage(e.to_string()))?,
    })
}

fn unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl WalletStore for PostgresAdapter {
    async fn execute(
        &self,
        user: Uuid,
        mutation: WalletMutation,
    ) -> Result<MutationReceipt, CoinError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        // ── Phase 1: Lock the wallet row ───────────────────────────────────────
        // Grants create the row first so there is always something to lock
        if mutation.creates_wallet() {
            sqlx::query(
                r#"
                INSERT INTO wallets (user_id)
                VALUES ($1)
                ON CONFLICT (user_id) DO NOTHING
                "#,
            )
            .bind(user)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;
        }

        let wallet_row = sqlx::query(
            r#"
            SELECT user_id, available, frozen, total_earned, total_spent, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let wallet = match &wallet_row {
            Some(row) => Some(row_to_wallet(row)?),
            None => None,
        };

        // ── Phase 2: Lock the hold row, when the mutation names one ────────────
        let hold = match mutation.hold_key() {
            Some(reference_id) => {
                let row = sqlx::query(
                    r#"
                    SELECT reference_id, user_id, amount, state, created_at, resolved_at
                    FROM coin_holds
                    WHERE reference_id = $1
                    FOR UPDATE
                    "#,
                )
                .bind(reference_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| CoinError::Storage(e.to_string()))?;
                match &row {
                    Some(row) => Some(row_to_hold(row)?),
                    None => None,
                }
            }
            None => None,
        };

        // ── Phase 3: Verify and compute inside the locks ───────────────────────
        // Checked INSIDE the locks; this is the real double-spend guard
        let effect = match mutation.apply_to(user, wallet, hold) {
            Ok(effect) => effect,
            Err(err) => {
                tx.rollback().await.ok();
                return Err(err);
            }
        };

        // ── Phase 4: Write the explicit post-state ─────────────────────────────
        sqlx::query(
            r#"
            UPDATE wallets
            SET available = $2, frozen = $3, total_earned = $4, total_spent = $5, updated_at = $6
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .bind(effect.wallet.available as i64)
        .bind(effect.wallet.frozen as i64)
        .bind(effect.wallet.total_earned as i64)
        .bind(effect.wallet.total_spent as i64)
        .bind(effect.wallet.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        if let Some(hold) = &effect.hold {
            sqlx::query(
                r#"
                INSERT INTO coin_holds (reference_id, user_id, amount, state, created_at, resolved_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (reference_id) DO UPDATE SET state = $4, resolved_at = $6
                "#,
            )
            .bind(hold.reference_id)
            .bind(hold.user_id)
            .bind(hold.amount as i64)
            .bind(hold.state.as_str())
            .bind(hold.created_at)
            .bind(hold.resolved_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;
        }

        if let Some(entry) = &effect.entry {
            sqlx::query(
                r#"
                INSERT INTO coin_entries (id, user_id, kind, amount, reference_kind, reference_id, reference_note, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(entry.id)
            .bind(entry.user_id)
            .bind(entry.kind.as_str())
            .bind(entry.amount as i64)
            .bind(&entry.reference.kind)
            .bind(entry.reference.id)
            .bind(&entry.reference.note)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(MutationReceipt {
            balance: effect.wallet.balance(),
            entry: effect.entry,
            moved: effect.moved,
        })
    }

    async fn get_wallet(&self, user: Uuid) -> Result<Wallet, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, available, frozen, total_earned, total_spent, created_at, updated_at
            FROM wallets
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::WalletNotFound)?;

        row_to_wallet(&row)
    }

    async fn get_hold(&self, reference_id: Uuid) -> Result<Reservation, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT reference_id, user_id, amount, state, created_at, resolved_at
            FROM coin_holds
            WHERE reference_id = $1
            "#,
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::ReservationNotFound)?;

        row_to_hold(&row)
    }

    async fn entries(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<LedgerEntry>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, amount, reference_kind, reference_id, reference_note, created_at
            FROM coin_entries
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(row_to_entry(&row)?);
        }
        Ok(entries)
    }

    async fn entry_sum(&self, user: Uuid) -> Result<i64, CoinError> {
        // Reserved and released entries carry zero weight
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(
                CASE
                    WHEN kind IN ('earned', 'bonus', 'refund') THEN amount
                    WHEN kind IN ('spent', 'penalty') THEN -amount
                    ELSE 0
                END
            ), 0)::BIGINT
            FROM coin_entries
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(sum)
    }
}

#[async_trait]
impl OrderStore for PostgresAdapter {
    async fn insert_order(&self, order: Order) -> Result<(), CoinError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO orders (id, code, user_id, total_coins, status, shipping_address,
                                cancelled_reason, confirmed_at, shipped_at, delivered_at,
                                created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(order.id)
        .bind(&order.code)
        .bind(order.user_id)
        .bind(order.total_coins as i64)
        .bind(order.status.as_str())
        .bind(&order.shipping_address)
        .bind(&order.cancelled_reason)
        .bind(order.confirmed_at)
        .bind(order.shipped_at)
        .bind(order.delivered_at)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                CoinError::Conflict(format!("order {} already exists", order.id))
            } else {
                CoinError::Storage(e.to_string())
            }
        })?;

        for item in &order.items {
            sqlx::query(
                r#"
                INSERT INTO order_items (id, order_id, product_id, quantity, price_per_unit)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(item.id)
            .bind(order.id)
            .bind(item.product_id)
            .bind(item.quantity as i32)
            .bind(item.price_per_unit as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Order, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT id, code, user_id, total_coins, status, shipping_address, cancelled_reason,
                   confirmed_at, shipped_at, delivered_at, created_at, updated_at
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::OrderNotFound)?;

        self.order_with_items(row).await
    }

    async fn get_order_by_code(&self, code: &str) -> Result<Order, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT id, code, user_id, total_coins, status, shipping_address, cancelled_reason,
                   confirmed_at, shipped_at, delivered_at, created_at, updated_at
            FROM orders
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::OrderNotFound)?;

        self.order_with_items(row).await
    }

    async fn list_orders(
        &self,
        user: Uuid,
        status: Option<OrderStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, user_id, total_coins, status, shipping_address, cancelled_reason,
                   confirmed_at, shipped_at, delivered_at, created_at, updated_at
            FROM orders
            WHERE user_id = $1 AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user)
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            orders.push(self.order_with_items(row).await?);
        }
        Ok(orders)
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

        // Compare-and-swap: the WHERE clause is the arbiter, a concurrent
        // winner leaves no matching row for the loser
        let row = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                updated_at = NOW(),
                confirmed_at = CASE WHEN $3 = 'confirmed' THEN NOW() ELSE confirmed_at END,
                shipped_at = CASE WHEN $3 = 'shipped' THEN NOW() ELSE shipped_at END,
                delivered_at = CASE WHEN $3 = 'delivered' THEN NOW() ELSE delivered_at END,
                cancelled_reason = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancelled_reason END
            WHERE id = $1 AND status = $2
            RETURNING id, code, user_id, total_coins, status, shipping_address, cancelled_reason,
                      confirmed_at, shipped_at, delivered_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        match row {
            Some(row) => self.order_with_items(row).await,
            None => {
                // Either the order is gone or someone else moved it first
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| CoinError::Storage(e.to_string()))?;

                match current {
                    Some(status) => {
                        let actual = OrderStatus::parse(&status).ok_or_else(|| {
                            CoinError::Storage(format!("unknown order status '{}'", status))
                        })?;
                        Err(CoinError::IllegalTransition { from: actual, to })
                    }
                    None => Err(CoinError::OrderNotFound),
                }
            }
        }
    }

    async fn next_order_code(&self, date: NaiveDate) -> Result<String, CoinError> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO order_code_seq (day, last_seq)
            VALUES ($1, 1)
            ON CONFLICT (day) DO UPDATE SET last_seq = order_code_seq.last_seq + 1
            RETURNING last_seq
            "#,
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(format_order_code(date, seq as u64))
    }
}

#[async_trait]
impl StepStore for PostgresAdapter {
    async fn insert_record(&self, record: StepRecord) -> Result<(), CoinError> {
        sqlx::query(
            r#"
            INSERT INTO step_records (id, user_id, steps, distance, source, recorded_date,
                                      verified, coins_awarded, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.steps)
        .bind(record.distance)
        .bind(record.source.as_str())
        .bind(record.recorded_date)
        .bind(record.verified)
        .bind(record.coins_awarded as i64)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if unique_violation(&e) {
                CoinError::Conflict(format!(
                    "steps already recorded for {} from {}",
                    record.recorded_date,
                    record.source.as_str()
                ))
            } else {
                CoinError::Storage(e.to_string())
            }
        })?;

        Ok(())
    }

    async fn insert_outcome(&self, outcome: ValidationOutcome) -> Result<(), CoinError> {
        sqlx::query(
            r#"
            INSERT INTO step_validations (id, record_id, user_id, anomaly_score, reason, status,
                                          reviewed_by, review_comment, created_at, reviewed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(outcome.id)
        .bind(outcome.record_id)
        .bind(outcome.user_id)
        .bind(outcome.anomaly_score)
        .bind(&outcome.reason)
        .bind(outcome.status.as_str())
        .bind(outcome.reviewed_by)
        .bind(&outcome.review_comment)
        .bind(outcome.created_at)
        .bind(outcome.reviewed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn get_record(&self, id: Uuid) -> Result<StepRecord, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, steps, distance, source, recorded_date, verified, coins_awarded, created_at
            FROM step_records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::RecordNotFound)?;

        row_to_record(&row)
    }

    async fn mark_verified(
        &self,
        record_id: Uuid,
        coins_awarded: u64,
    ) -> Result<StepRecord, CoinError> {
        let row = sqlx::query(
            r#"
            UPDATE step_records
            SET verified = TRUE, coins_awarded = $2
            WHERE id = $1
            RETURNING id, user_id, steps, distance, source, recorded_date, verified, coins_awarded, created_at
            "#,
        )
        .bind(record_id)
        .bind(coins_awarded as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::RecordNotFound)?;

        row_to_record(&row)
    }

    async fn records_for_user(
        &self,
        user: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<StepRecord>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, steps, distance, source, recorded_date, verified, coins_awarded, created_at
            FROM step_records
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn average_steps(&self, user: Uuid) -> Result<f64, CoinError> {
        // AVG over BIGINT yields NUMERIC, cast for the f64 decode
        let average: f64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(AVG(steps), 0)::DOUBLE PRECISION
            FROM step_records
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(average)
    }

    async fn total_steps(&self, user: Uuid) -> Result<i64, CoinError> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(steps), 0)::BIGINT
            FROM step_records
            WHERE user_id = $1
            "#,
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(total)
    }

    async fn pending_outcomes(
        &self,
        min_score: f64,
        limit: u32,
    ) -> Result<Vec<ValidationOutcome>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT id, record_id, user_id, anomaly_score, reason, status, reviewed_by,
                   review_comment, created_at, reviewed_at
            FROM step_validations
            WHERE status = 'pending' AND anomaly_score >= $1
            ORDER BY anomaly_score DESC
            LIMIT $2
            "#,
        )
        .bind(min_score)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }

    async fn get_outcome(&self, id: Uuid) -> Result<ValidationOutcome, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT id, record_id, user_id, anomaly_score, reason, status, reviewed_by,
                   review_comment, created_at, reviewed_at
            FROM step_validations
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?
        .ok_or(CoinError::RecordNotFound)?;

        row_to_outcome(&row)
    }

    async fn resolve_outcome(
        &self,
        id: Uuid,
        status: ReviewStatus,
        admin: Uuid,
        comment: Option<String>,
    ) -> Result<ValidationOutcome, CoinError> {
        // Compare-and-swap on the pending status: exactly one decision wins
        let row = sqlx::query(
            r#"
            UPDATE step_validations
            SET status = $2, reviewed_by = $3, review_comment = $4, reviewed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING id, record_id, user_id, anomaly_score, reason, status, reviewed_by,
                      review_comment, created_at, reviewed_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(admin)
        .bind(comment)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        match row {
            Some(row) => row_to_outcome(&row),
            None => {
                let exists: Option<Uuid> =
                    sqlx::query_scalar("SELECT id FROM step_validations WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(|e| CoinError::Storage(e.to_string()))?;

                match exists {
                    Some(_) => Err(CoinError::Conflict("review already resolved".to_string())),
                    None => Err(CoinError::RecordNotFound),
                }
            }
        }
    }
}

#[async_trait]
impl SettingStore for PostgresAdapter {
    async fn get_setting(&self, key: &str) -> Result<Option<Setting>, CoinError> {
        let row = sqlx::query(
            r#"
            SELECT key, value, description, updated_at
            FROM settings
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        match &row {
            Some(row) => Ok(Some(row_to_setting(row)?)),
            None => Ok(None),
        }
    }

    async fn put_setting(&self, setting: Setting) -> Result<(), CoinError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, description, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET value = $2, description = $3, updated_at = $4
            "#,
        )
        .bind(&setting.key)
        .bind(&setting.value)
        .bind(&setting.description)
        .bind(setting.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, CoinError> {
        let rows = sqlx::query(
            r#"
            SELECT key, value, description, updated_at
            FROM settings
            ORDER BY key
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoinError::Storage(e.to_string()))?;

        let mut settings = Vec::with_capacity(rows.len());
        for row in rows {
            settings.push(row_to_setting(&row)?);
        }
        Ok(settings)
    }
}
