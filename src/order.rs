// src/order.rs
use crate::adapters::OrderStore;
use crate::coin::CoinService;
use crate::entry::{EntryKind, Reference};
use crate::error::CoinError;
use chrono::{DateTime, NaiveDate, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

/// Order lifecycle state.
/// Transitions are driven by a compare-and-swap in the store; there are no
/// self-loops, so a transition can never silently succeed twice.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, target) {
            (Pending, Confirmed) | (Pending, Cancelled) => true,
            (Confirmed, Processing) | (Confirmed, Cancelled) => true,
            (Processing, Shipped) | (Processing, Cancelled) => true,
            (Shipped, Delivered) | (Shipped, Cancelled) => true,
            (Delivered, Refunded) => true,
            // Cancelled and Refunded are terminal
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<OrderStatus> {
        match value {
            "pending" => Some(OrderStatus::Pending),
            "confirmed" => Some(OrderStatus::Confirmed),
            "processing" => Some(OrderStatus::Processing),
            "shipped" => Some(OrderStatus::Shipped),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            "refunded" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Line item as submitted by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: Uuid,
    pub quantity: u32,
    pub price_per_unit: u64,
}

impl NewOrderItem {
    /// Line total, `None` when it overflows u64.
    pub fn subtotal(&self) -> Option<u64> {
        (self.quantity as u64).checked_mul(self.price_per_unit)
    }
}

/// Persisted line item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
    pub price_per_unit: u64,
}

impl OrderItem {
    pub fn from_new(item: NewOrderItem) -> Self {
        Self {
            id: Uuid::now_v7(),
            product_id: item.product_id,
            quantity: item.quantity,
            price_per_unit: item.price_per_unit,
        }
    }

    /// Line total, `None` when it overflows u64.
    pub fn subtotal(&self) -> Option<u64> {
        (self.quantity as u64).checked_mul(self.price_per_unit)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    /// Human-facing code, `FK-YYYYMMDD-NNNNN`, sequenced per day.
    pub code: String,
    pub user_id: Uuid,
    pub total_coins: u64,
    pub status: OrderStatus,
    pub items: Vec<OrderItem>,
    pub shipping_address: Option<String>,
    pub cancelled_reason: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) fn format_order_code(date: NaiveDate, seq: u64) -> String {
    format!("FK-{}-{:05}", date.format("%Y%m%d"), seq)
}

/// Order placement and lifecycle over an [`OrderStore`], with coin side
/// effects riding every crossing of the paid boundary.
#[derive(Clone)]
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    coins: CoinService,
}

impl OrderService {
    pub fn new(orders: Arc<dyn OrderStore>, coins: CoinService) -> Self {
        Self { orders, coins }
    }

    /// Place an order: validate the items, freeze the total under a hold
    /// keyed by the fresh order id, then persist the pending order.
    /// A failed freeze means no order row ever exists; a failed insert
    /// releases the hold before the error surfaces.
    pub async fn create(
        &self,
        user: Uuid,
        items: Vec<NewOrderItem>,
        shipping_address: Option<String>,
    ) -> Result<Order, CoinError> {
        if items.is_empty() {
            return Err(CoinError::Validation(
                "order must contain at least one item".to_string(),
            ));
        }
        if items.iter().any(|item| item.quantity == 0) {
            return Err(CoinError::Validation(
                "item quantity must be positive".to_string(),
            ));
        }
        let total = items
            .iter()
            .try_fold(0u64, |sum, item| {
                item.subtotal().and_then(|sub| sum.checked_add(sub))
            })
            .ok_or_else(|| CoinError::Validation("order total overflows".to_string()))?;
        if total == 0 {
            return Err(CoinError::Validation(
                "order total must be positive".to_string(),
            ));
        }

        let order_id = Uuid::now_v7();
        let code = self.orders.next_order_code(Utc::now().date_naive()).await?;

        self.coins
            .freeze(user, total, Reference::order(order_id))
            .await?;

        let now = Utc::now();
        let order = Order {
            id: order_id,
            code,
            user_id: user,
            total_coins: total,
            status: OrderStatus::Pending,
            items: items.into_iter().map(OrderItem::from_new).collect(),
            shipping_address,
            cancelled_reason: None,
            confirmed_at: None,
            shipped_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.orders.insert_order(order.clone()).await {
            // Do not strand the hold behind a failed insert
            if let Err(release_err) = self
                .coins
                .unfreeze(user, total, Reference::order(order_id))
                .await
            {
                error!(
                    order = %order_id,
                    error = %release_err,
                    "failed to release hold after order insert failure"
                );
            }
            return Err(err);
        }

        counter!("orders.created.total").increment(1);
        Ok(order)
    }

    /// Confirm a pending order. The compare-and-swap on the status row is
    /// the race arbiter: of two concurrent confirms exactly one wins, the
    /// other gets [`CoinError::IllegalTransition`]. Only the winner settles
    /// the hold, so the wallet is charged exactly once.
    pub async fn confirm(&self, order_id: Uuid, user: Uuid) -> Result<Order, CoinError> {
        let order = self.orders.get_order(order_id).await?;
        if order.user_id != user {
            return Err(CoinError::Conflict(
                "order belongs to another user".to_string(),
            ));
        }

        let order = self
            .orders
            .transition_order(order_id, OrderStatus::Pending, OrderStatus::Confirmed, None)
            .await?;

        self.apply_transition_effects(&order, OrderStatus::Pending, OrderStatus::Confirmed)
            .await?;

        counter!("orders.confirmed.total").increment(1);
        Ok(order)
    }

    /// Customer cancellation, allowed from `pending` (hold released) and
    /// `confirmed` (already-settled total granted back as a refund).
    pub async fn cancel(
        &self,
        order_id: Uuid,
        user: Uuid,
        reason: Option<String>,
    ) -> Result<Order, CoinError> {
        let order = self.orders.get_order(order_id).await?;
        if order.user_id != user {
            return Err(CoinError::Conflict(
                "order belongs to another user".to_string(),
            ));
        }

        let from = match order.status {
            status @ (OrderStatus::Pending | OrderStatus::Confirmed) => status,
            _ => {
                return Err(CoinError::Conflict(
                    "only pending or confirmed orders can be cancelled".to_string(),
                ));
            }
        };

        let order = self
            .orders
            .transition_order(order_id, from, OrderStatus::Cancelled, reason)
            .await?;

        self.apply_transition_effects(&order, from, OrderStatus::Cancelled)
            .await?;

        counter!("orders.cancelled.total").increment(1);
        Ok(order)
    }

    /// Admin transition across the full status table. Coin side effects
    /// follow the crossing: confirming settles the hold, cancelling a paid
    /// order refunds it, refunding a delivered order refunds it.
    pub async fn update_status(
        &self,
        order_id: Uuid,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, CoinError> {
        let current = self.orders.get_order(order_id).await?;
        let from = current.status;
        if !from.can_transition_to(to) {
            return Err(CoinError::IllegalTransition { from, to });
        }

        let order = self
            .orders
            .transition_order(order_id, from, to, reason)
            .await?;

        self.apply_transition_effects(&order, from, to).await?;

        counter!("orders.status_changes.total", "to" => to.as_str()).increment(1);
        Ok(order)
    }

    /// The coin consequences of a status change, applied strictly after
    /// the CAS has committed.
    async fn apply_transition_effects(
        &self,
        order: &Order,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<(), CoinError> {
        use OrderStatus::*;

        let reference = Reference::order(order.id);
        let result = match (from, to) {
            (Pending, Confirmed) => self
                .coins
                .settle(order.user_id, reference)
                .await
                .map(|_| ()),
            (Pending, Cancelled) => self
                .coins
                .unfreeze(order.user_id, order.total_coins, reference)
                .await
                .map(|_| ()),
            (Confirmed | Processing | Shipped, Cancelled) | (Delivered, Refunded) => self
                .coins
                .grant(order.user_id, order.total_coins, EntryKind::Refund, reference)
                .await
                .map(|_| ()),
            _ => Ok(()),
        };

        if let Err(err) = result {
            error!(
                order = %order.id,
                from = %from,
                to = %to,
                error = %err,
                "coin side effect failed after order status change"
            );
            return Err(err);
        }
        Ok(())
    }

    pub async fn get(&self, order_id: Uuid) -> Result<Order, CoinError> {
        self.orders.get_order(order_id).await
    }

    /// Fetch with an ownership check, for customer-facing callers.
    pub async fn get_for_user(&self, order_id: Uuid, user: Uuid) -> Result<Order, CoinError> {
        let order = self.orders.get_order(order_id).await?;
        if order.user_id != user {
            return Err(CoinError::Conflict(
                "order belongs to another user".to_string(),
            ));
        }
        Ok(order)
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Order, CoinError> {
        self.orders.get_order_by_code(code).await
    }

    /// Newest-first page of the user's orders, optionally filtered by
    /// status.
    pub async fn list(
        &self,
        user: Uuid,
        status: Option<OrderStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Order>, CoinError> {
        self.orders.list_orders(user, status, limit, offset).await
    }
}
