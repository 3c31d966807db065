//! Human-facing notifications emitted by the order store.

use serde::{Deserialize, Serialize};

use crate::OrderStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// One notification per store command, plus sync reloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderEvent {
    Created { display_id: String },
    Updated { display_id: String },
    Deleted { display_id: String },
    StatusChanged { display_id: String, status: OrderStatus },
    /// The durable counter could not issue a display id; no order was created.
    AllocationFailed { reason: String },
    /// Another instance wrote the collection and this one reloaded it.
    Synced { orders: usize },
}

impl OrderEvent {
    pub fn level(&self) -> NoticeLevel {
        match self {
            OrderEvent::Created { .. } | OrderEvent::Updated { .. } => NoticeLevel::Success,
            OrderEvent::Deleted { .. } | OrderEvent::StatusChanged { .. } | OrderEvent::Synced { .. } => {
                NoticeLevel::Info
            }
            OrderEvent::AllocationFailed { .. } => NoticeLevel::Error,
        }
    }

    pub fn message(&self) -> String {
        match self {
            OrderEvent::Created { display_id } => format!("Order #{} created", display_id),
            OrderEvent::Updated { display_id } => format!("Order #{} updated", display_id),
            OrderEvent::Deleted { display_id } => format!("Order #{} deleted", display_id),
            OrderEvent::StatusChanged { display_id, status } => {
                format!("Order #{} is now {}", display_id, status.label())
            }
            OrderEvent::AllocationFailed { reason } => format!("Could not create order: {}", reason),
            OrderEvent::Synced { orders } => format!("Reloaded {} orders from another window", orders),
        }
    }
}
