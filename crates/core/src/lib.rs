//! Taller core types: work orders, their status machine and the store error taxonomy.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use uuid::Uuid;

pub mod events;
pub mod view;

pub use events::{NoticeLevel, OrderEvent};

/// Requested services, usually one to three entries.
pub type Services = SmallVec<[String; 4]>;

/// Client name stored when reception leaves it blank.
pub const ANONYMOUS_CLIENT: &str = "Sin nombre";

/// Minimum plate length accepted by reception.
pub const MIN_PLATE_LEN: usize = 6;

/// Current time truncated to the millisecond precision orders are stored with.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Opaque, process-wide unique order key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct OrderId(Uuid);

impl OrderId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for OrderId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for OrderId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s).map(Self) }
}

/// Work order status.
///
/// `Pending` only exists so that collections written by older releases still
/// load. It reads as `Waiting` for filtering and display and is never written
/// by a command.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Waiting,
    Working,
    Parts,
    Completed,
    Pending,
}

impl OrderStatus {
    /// The states a command may write, in pipeline order.
    pub const WRITABLE: [OrderStatus; 4] = [
        OrderStatus::Waiting,
        OrderStatus::Working,
        OrderStatus::Parts,
        OrderStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Waiting => "waiting",
            OrderStatus::Working => "working",
            OrderStatus::Parts => "parts",
            OrderStatus::Completed => "completed",
            OrderStatus::Pending => "pending",
        }
    }

    /// Label shown on cards, the TV display and exports.
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::Waiting => "En Espera",
            OrderStatus::Working => "En Proceso",
            OrderStatus::Parts => "Esperando Repuestos",
            OrderStatus::Completed => "Completado",
            OrderStatus::Pending => "Pendiente",
        }
    }

    pub fn is_writable(&self) -> bool { !matches!(self, OrderStatus::Pending) }

    /// Status used for filtering: legacy `pending` collapses into `waiting`.
    pub fn effective(&self) -> OrderStatus {
        match self {
            OrderStatus::Pending => OrderStatus::Waiting,
            other => *other,
        }
    }

    /// Everything but `completed` is still on the shop floor.
    pub fn is_active(&self) -> bool { self.effective() != OrderStatus::Completed }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Parses a status coming from a command. Only writable states are accepted.
impl FromStr for OrderStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::WRITABLE
            .iter()
            .copied()
            .find(|st| st.as_str() == s.trim())
            .ok_or_else(|| StoreError::InvalidStatus(s.to_string()))
    }
}

/// One entry of the append-only status audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEntry {
    pub status: OrderStatus,
    #[serde(with = "iso_millis")]
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied descriptive fields for a new order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderPayload {
    pub plate: String,
    pub model: String,
    pub client_name: String,
    pub services: Services,
    pub notes: String,
}

impl OrderPayload {
    /// Reception-form cleanup: trim everything, upper-case the plate and
    /// fill in an anonymous client name.
    pub fn normalize(mut self) -> Self {
        self.plate = self.plate.trim().to_uppercase();
        self.model = self.model.trim().to_string();
        self.client_name = self.client_name.trim().to_string();
        if self.client_name.is_empty() {
            self.client_name = ANONYMOUS_CLIENT.to_string();
        }
        self.notes = self.notes.trim().to_string();
        self.services = self
            .services
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        self
    }

    /// Reception-form rules. Expects a normalized payload.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.plate.is_empty() {
            return Err(StoreError::Validation("plate is required".into()));
        }
        if self.plate.chars().count() < MIN_PLATE_LEN {
            return Err(StoreError::Validation(format!(
                "plate {:?} is too short (min {} characters)",
                self.plate, MIN_PLATE_LEN
            )));
        }
        if self.model.is_empty() {
            return Err(StoreError::Validation("model is required".into()));
        }
        if self.services.is_empty() && self.notes.is_empty() {
            return Err(StoreError::Validation("select at least one service or add notes".into()));
        }
        Ok(())
    }
}

/// Partial update of descriptive fields; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderPatch {
    pub plate: Option<String>,
    pub model: Option<String>,
    pub client_name: Option<String>,
    pub services: Option<Services>,
    pub notes: Option<String>,
}

impl OrderPatch {
    pub fn is_empty(&self) -> bool {
        self.plate.is_none()
            && self.model.is_none()
            && self.client_name.is_none()
            && self.services.is_none()
            && self.notes.is_none()
    }
}

/// A vehicle service request.
///
/// Identity, status and audit trail are only reachable through accessors so
/// that the store stays the single place that assigns or transitions them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    id: OrderId,
    display_id: String,
    status: OrderStatus,
    /// `None` only for records stored before the trail existed; an explicit
    /// empty list is kept as written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status_history: Option<Vec<StatusEntry>>,
    #[serde(with = "iso_millis")]
    created_at: DateTime<Utc>,
    #[serde(default)]
    pub plate: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub services: Services,
    #[serde(default)]
    pub notes: String,
    /// Keys written by other releases (e.g. `job`), carried through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Order {
    /// Fresh order in `waiting` with a single history entry stamped `now`.
    pub fn new(id: OrderId, display_id: String, payload: OrderPayload, now: DateTime<Utc>) -> Self {
        Self {
            id,
            display_id,
            status: OrderStatus::Waiting,
            status_history: Some(vec![StatusEntry { status: OrderStatus::Waiting, timestamp: now }]),
            created_at: now,
            plate: payload.plate,
            model: payload.model,
            client_name: payload.client_name,
            services: payload.services,
            notes: payload.notes,
            extra: serde_json::Map::new(),
        }
    }

    pub fn id(&self) -> OrderId { self.id }
    pub fn display_id(&self) -> &str { &self.display_id }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn status_history(&self) -> &[StatusEntry] { self.status_history.as_deref().unwrap_or(&[]) }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }

    /// Replace only the descriptive fields present in `patch`.
    pub fn apply_patch(&mut self, patch: OrderPatch) {
        if let Some(v) = patch.plate { self.plate = v; }
        if let Some(v) = patch.model { self.model = v; }
        if let Some(v) = patch.client_name { self.client_name = v; }
        if let Some(v) = patch.services { self.services = v; }
        if let Some(v) = patch.notes { self.notes = v; }
    }

    /// Move to `status` and append exactly one history entry. Any writable
    /// state may follow any other, including leaving `completed`.
    pub fn transition(&mut self, status: OrderStatus, at: DateTime<Utc>) -> Result<(), StoreError> {
        if !status.is_writable() {
            return Err(StoreError::InvalidStatus(status.as_str().to_string()));
        }
        self.status = status;
        self.status_history.get_or_insert_with(Vec::new).push(StatusEntry { status, timestamp: at });
        Ok(())
    }
}

/// Immutable view of the order collection, most recently created first.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrderSnapshot {
    pub epoch: u64,
    pub orders: Vec<Order>,
}

impl OrderSnapshot {
    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.iter().find(|o| o.id() == id)
    }

    pub fn by_display_id(&self, display_id: &str) -> Option<&Order> {
        self.orders.iter().find(|o| o.display_id() == display_id)
    }
}

/// Errors surfaced by store commands.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("allocation: {0}")]
    Allocation(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("validation: {0}")]
    Validation(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// RFC 3339 timestamps with millisecond precision and a `Z` suffix.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

pub mod prelude {
    pub use super::{
        now_millis, NoticeLevel, Order, OrderEvent, OrderId, OrderPatch, OrderPayload, OrderSnapshot,
        OrderStatus, Services, StatusEntry, StoreError, StoreResult,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn payload() -> OrderPayload {
        OrderPayload {
            plate: "ABC123".into(),
            model: "Focus".into(),
            client_name: "Juan".into(),
            services: smallvec!["Balanceado".to_string()],
            notes: String::new(),
        }
    }

    #[test]
    fn new_order_starts_waiting_with_one_entry() {
        let now = now_millis();
        let o = Order::new(OrderId::new(), "0001".into(), payload(), now);
        assert_eq!(o.status(), OrderStatus::Waiting);
        assert_eq!(o.status_history(), &[StatusEntry { status: OrderStatus::Waiting, timestamp: now }]);
        assert_eq!(o.created_at(), now);
    }

    #[test]
    fn transition_appends_and_allows_reopening() {
        let mut o = Order::new(OrderId::new(), "0001".into(), payload(), now_millis());
        o.transition(OrderStatus::Completed, now_millis()).unwrap();
        o.transition(OrderStatus::Working, now_millis()).unwrap();
        let trail: Vec<_> = o.status_history().iter().map(|e| e.status).collect();
        assert_eq!(trail, vec![OrderStatus::Waiting, OrderStatus::Completed, OrderStatus::Working]);
        assert_eq!(o.status(), OrderStatus::Working);
    }

    #[test]
    fn legacy_pending_is_never_written() {
        let mut o = Order::new(OrderId::new(), "0001".into(), payload(), now_millis());
        let err = o.transition(OrderStatus::Pending, now_millis()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidStatus(_)));
        assert_eq!(o.status_history().len(), 1);
        assert!("pending".parse::<OrderStatus>().is_err());
        assert!("cancelled".parse::<OrderStatus>().is_err());
        assert_eq!("parts".parse::<OrderStatus>().unwrap(), OrderStatus::Parts);
    }

    #[test]
    fn legacy_record_loads_and_keeps_unknown_keys() {
        let raw = serde_json::json!({
            "id": "7f1c1a6e-3f0a-4b8e-9d55-0a4a5b1d2c3e",
            "displayId": "0007",
            "status": "pending",
            "createdAt": "2024-03-01T12:30:00.000Z",
            "plate": "AB123CD",
            "model": "Gol",
            "clientName": "Ana",
            "services": ["Alineado"],
            "notes": "",
            "job": "Alineado"
        });
        let o: Order = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(o.status().effective(), OrderStatus::Waiting);
        assert!(o.status().is_active());
        assert!(o.status_history().is_empty());
        assert_eq!(o.extra.get("job"), Some(&serde_json::json!("Alineado")));

        let back = serde_json::to_value(&o).unwrap();
        assert_eq!(back["status"], "pending");
        assert_eq!(back["createdAt"], "2024-03-01T12:30:00.000Z");
        assert_eq!(back["job"], "Alineado");
    }

    #[test]
    fn explicit_empty_trail_is_written_back() {
        let raw = serde_json::json!({
            "id": "7f1c1a6e-3f0a-4b8e-9d55-0a4a5b1d2c3e",
            "displayId": "0008",
            "status": "waiting",
            "statusHistory": [],
            "createdAt": "2024-03-01T12:30:00.000Z",
            "plate": "AB123CD",
            "model": "Gol",
            "clientName": "Ana",
            "services": [],
            "notes": "x"
        });
        let mut o: Order = serde_json::from_value(raw.clone()).unwrap();
        assert!(o.status_history().is_empty());
        assert_eq!(serde_json::to_value(&o).unwrap(), raw);

        o.transition(OrderStatus::Working, now_millis()).unwrap();
        assert_eq!(o.status_history().len(), 1);
        assert_eq!(o.status_history()[0].status, OrderStatus::Working);
    }

    #[test]
    fn payload_normalize_and_validate() {
        let p = OrderPayload {
            plate: "  ab123cd ".into(),
            model: " Corsa ".into(),
            client_name: "  ".into(),
            services: smallvec![" Frenos ".to_string(), "".to_string()],
            notes: String::new(),
        }
        .normalize();
        assert_eq!(p.plate, "AB123CD");
        assert_eq!(p.client_name, ANONYMOUS_CLIENT);
        assert_eq!(p.services.as_slice(), &["Frenos".to_string()]);
        assert!(p.validate().is_ok());

        let short = OrderPayload { plate: "AB1".into(), ..p.clone() };
        assert!(matches!(short.validate(), Err(StoreError::Validation(_))));
        let empty = OrderPayload { services: Services::new(), notes: String::new(), ..p };
        assert!(matches!(empty.validate(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn patch_touches_only_supplied_fields() {
        let mut o = Order::new(OrderId::new(), "0001".into(), payload(), now_millis());
        o.apply_patch(OrderPatch { model: Some("Fiesta".into()), ..Default::default() });
        assert_eq!(o.model, "Fiesta");
        assert_eq!(o.plate, "ABC123");
        assert_eq!(o.status_history().len(), 1);
    }
}
