//! # Event Envelope
//!
//! Wire format of every event published on the shopping-list exchange.
//!
//! ```json
//! {
//!   "eventType": "ListaCompartida",
//!   "eventId": "550e8400-e29b-41d4-a716-446655440000",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "aggregateId": "lista-1",
//!   "aggregateType": "Lista",
//!   "version": 1,
//!   "data": { ... }
//! }
//! ```
//!
//! Only `eventType` and `data` are required. Producers that predate the
//! metadata fields send nothing else, so `eventId` and `timestamp` are
//! optional and `version` defaults to 1.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event envelope with a typed (or raw `serde_json::Value`) payload
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new("ListaActualizada", json!({"listaId": "l-1"}))
///     .with_aggregate("l-1", "Lista");
///
/// assert_eq!(envelope.version, 1);
/// assert!(envelope.event_id.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// Tag selecting the payload schema (e.g. `ListaCompartida`)
    pub event_type: String,

    /// Unique event identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// When the event was produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_type: Option<String>,

    /// Schema version of `data`
    #[serde(default = "default_version")]
    pub version: u32,

    /// Event-specific payload
    pub data: T,
}

fn default_version() -> u32 {
    1
}

impl<T> EventEnvelope<T> {
    /// Create an envelope with a generated event id and the current timestamp
    pub fn new(event_type: impl Into<String>, data: T) -> Self {
        Self {
            event_type: event_type.into(),
            event_id: Some(Uuid::new_v4().to_string()),
            timestamp: Some(Utc::now()),
            aggregate_id: None,
            aggregate_type: None,
            version: default_version(),
            data,
        }
    }

    pub fn with_aggregate(
        mut self,
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
    ) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Log-friendly event id (`-` when the producer sent none)
    pub fn event_id_or_dash(&self) -> &str {
        self.event_id.as_deref().unwrap_or("-")
    }
}

/// Validate the envelope fields of a raw JSON message
///
/// # Validation Rules
///
/// - must be a JSON object
/// - `eventType`: string, non-empty
/// - `data`: present
/// - `eventId`: when present, a non-empty string
/// - `timestamp`: when present, an RFC 3339 string
/// - `version`: when present, an integer >= 1
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let object = envelope
        .as_object()
        .ok_or("Envelope must be a JSON object")?;

    let event_type = object
        .get("eventType")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid eventType")?;

    if event_type.trim().is_empty() {
        return Err("eventType cannot be empty".to_string());
    }

    if !object.contains_key("data") {
        return Err("Missing data".to_string());
    }

    if let Some(event_id) = object.get("eventId") {
        let event_id = event_id.as_str().ok_or("Invalid eventId")?;
        if event_id.trim().is_empty() {
            return Err("eventId cannot be empty".to_string());
        }
    }

    if let Some(timestamp) = object.get("timestamp") {
        let timestamp = timestamp.as_str().ok_or("Invalid timestamp")?;
        DateTime::parse_from_rfc3339(timestamp)
            .map_err(|e| format!("Invalid timestamp '{}': {}", timestamp, e))?;
    }

    if let Some(version) = object.get("version") {
        match version.as_u64() {
            Some(v) if v >= 1 && v <= u64::from(u32::MAX) => {}
            _ => return Err("version must be an integer >= 1".to_string()),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = EventEnvelope::new("ListaActualizada", json!({"listaId": "l-1"}));

        assert_eq!(envelope.event_type, "ListaActualizada");
        assert_eq!(envelope.version, 1);
        assert!(envelope.event_id.is_some());
        assert!(envelope.timestamp.is_some());
        assert!(envelope.aggregate_id.is_none());
    }

    #[test]
    fn test_envelope_serializes_camel_case() {
        let envelope = EventEnvelope::new("ListaActualizada", json!({}))
            .with_aggregate("l-1", "Lista")
            .with_version(2);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["eventType"], "ListaActualizada");
        assert_eq!(value["aggregateId"], "l-1");
        assert_eq!(value["aggregateType"], "Lista");
        assert_eq!(value["version"], 2);
        assert!(value.get("event_type").is_none());
    }

    #[test]
    fn test_minimal_envelope_deserializes() {
        let envelope: EventEnvelope<serde_json::Value> =
            serde_json::from_value(json!({"eventType": "UsuarioRegistrado", "data": {}})).unwrap();

        assert_eq!(envelope.version, 1);
        assert!(envelope.event_id.is_none());
        assert_eq!(envelope.event_id_or_dash(), "-");
    }

    #[test]
    fn test_validate_envelope_fields_valid() {
        let envelope = json!({
            "eventType": "ListaCompartida",
            "eventId": "550e8400-e29b-41d4-a716-446655440000",
            "timestamp": "2024-01-01T00:00:00Z",
            "version": 1,
            "data": {}
        });

        assert!(validate_envelope_fields(&envelope).is_ok());
    }

    #[test]
    fn test_validate_envelope_fields_minimal() {
        let envelope = json!({"eventType": "ListaCompartida", "data": {}});
        assert!(validate_envelope_fields(&envelope).is_ok());
    }

    #[test]
    fn test_validate_envelope_fields_missing_event_type() {
        let envelope = json!({"data": {}});
        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_empty_event_type() {
        let envelope = json!({"eventType": "  ", "data": {}});
        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_missing_data() {
        let envelope = json!({"eventType": "ListaCompartida"});
        assert!(validate_envelope_fields(&envelope).is_err());
    }

    #[test]
    fn test_validate_envelope_fields_bad_metadata() {
        let base = |key: &str, value: serde_json::Value| {
            let mut envelope = json!({"eventType": "ListaCompartida", "data": {}});
            envelope[key] = value;
            envelope
        };

        assert!(validate_envelope_fields(&base("eventId", json!(""))).is_err());
        assert!(validate_envelope_fields(&base("eventId", json!(42))).is_err());
        assert!(validate_envelope_fields(&base("timestamp", json!("yesterday"))).is_err());
        assert!(validate_envelope_fields(&base("version", json!(0))).is_err());
        assert!(validate_envelope_fields(&base("version", json!("1"))).is_err());
    }

    #[test]
    fn test_validate_rejects_non_object() {
        assert!(validate_envelope_fields(&json!([1, 2, 3])).is_err());
        assert!(validate_envelope_fields(&json!("ListaCompartida")).is_err());
    }
}
