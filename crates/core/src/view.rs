//! Read-only projections the admin list and the TV display build from a snapshot.

use chrono::{DateTime, Duration, Utc};

use crate::{Order, OrderStatus};

/// Orders younger than this are highlighted as new.
pub const NEW_ORDER_WINDOW_SECS: i64 = 60;

/// Orders still on the shop floor, in collection order.
pub fn active(orders: &[Order]) -> Vec<&Order> {
    orders.iter().filter(|o| o.status().is_active()).collect()
}

pub fn completed(orders: &[Order]) -> Vec<&Order> {
    orders.iter().filter(|o| o.status().effective() == OrderStatus::Completed).collect()
}

/// TV display order: active orders, oldest first.
pub fn display_queue(orders: &[Order]) -> Vec<&Order> {
    let mut out = active(orders);
    out.sort_by_key(|o| o.created_at());
    out
}

/// Admin search box: plate or client name contains `query`, case-insensitive.
pub fn matches_filter(order: &Order, query: &str) -> bool {
    let q = query.trim();
    if q.is_empty() {
        return true;
    }
    order.plate.to_uppercase().contains(&q.to_uppercase())
        || order.client_name.to_lowercase().contains(&q.to_lowercase())
}

pub fn is_new(order: &Order, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(order.created_at()) < Duration::seconds(NEW_ORDER_WINDOW_SECS)
}
