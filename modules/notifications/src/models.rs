use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::handlers::DispatchError;

// ============================================================================
// EVENT KINDS
// ============================================================================

/// Closed set of events this worker reacts to
///
/// Producers use the Spanish tags; the English names are accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ListShared,
    UserRegistered,
    ProductAdded,
    ListUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ListShared,
        EventKind::UserRegistered,
        EventKind::ProductAdded,
        EventKind::ListUpdated,
    ];

    /// Canonical wire tag
    pub fn tag(self) -> &'static str {
        match self {
            EventKind::ListShared => "ListaCompartida",
            EventKind::UserRegistered => "UsuarioRegistrado",
            EventKind::ProductAdded => "ProductoAnadido",
            EventKind::ListUpdated => "ListaActualizada",
        }
    }

    pub fn alias(self) -> &'static str {
        match self {
            EventKind::ListShared => "ListShared",
            EventKind::UserRegistered => "UserRegistered",
            EventKind::ProductAdded => "ProductAdded",
            EventKind::ListUpdated => "ListUpdated",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag || kind.alias() == tag)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// INCOMING EVENT PAYLOADS
// ============================================================================
//
// Each field reads its Spanish name or its English alias, never both: a body
// carrying `listaId` and `listId` is rejected as a duplicate field.

/// Payload for ListaCompartida
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListSharedPayload {
    #[serde(rename = "listaId", alias = "listId")]
    pub list_id: String,
    #[serde(rename = "usuarioComparteId", alias = "sharedByUserId")]
    pub shared_by_user_id: String,
    #[serde(rename = "emailInvitado", alias = "inviteeEmail")]
    pub invitee_email: String,
    #[serde(rename = "tipoPermiso", alias = "permission")]
    pub permission: String,
    #[serde(rename = "tokenInvitacion", alias = "invitationToken")]
    pub invitation_token: String,
    #[serde(
        rename = "fechaExpiracion",
        alias = "expiresAt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payload for UsuarioRegistrado
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRegisteredPayload {
    #[serde(
        rename = "usuarioId",
        alias = "userId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub user_id: Option<String>,
    pub email: String,
    #[serde(rename = "nombre", alias = "name")]
    pub name: String,
    #[serde(
        rename = "confirmationToken",
        alias = "tokenConfirmacion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub confirmation_token: Option<String>,
}

/// Payload for ProductoAnadido
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAddedPayload {
    #[serde(rename = "listaId", alias = "listId")]
    pub list_id: String,
    #[serde(
        rename = "productoId",
        alias = "productId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub product_id: Option<String>,
    #[serde(rename = "nombreProducto", alias = "productName")]
    pub product_name: String,
    #[serde(
        rename = "cantidad",
        alias = "quantity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub quantity: Option<f64>,
    #[serde(rename = "usuarioId", alias = "userId")]
    pub user_id: String,
}

/// Payload for ListaActualizada
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListUpdatedPayload {
    #[serde(rename = "listaId", alias = "listId")]
    pub list_id: String,
    #[serde(rename = "usuarioId", alias = "userId")]
    pub user_id: String,
    /// Free text or a structured diff, depending on the producer
    #[serde(
        rename = "cambios",
        alias = "changes",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub changes: Option<Value>,
}

impl ListUpdatedPayload {
    /// Human-readable description of the change, if any
    pub fn change_description(&self) -> Option<String> {
        match &self.changes {
            None | Some(Value::Null) => None,
            Some(Value::String(text)) if text.trim().is_empty() => None,
            Some(Value::String(text)) => Some(text.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} cannot be empty", field));
    }
    Ok(())
}

fn require_email(field: &str, value: &str) -> Result<(), String> {
    require(field, value)?;
    if !value.contains('@') {
        return Err(format!("{} is not an email address", field));
    }
    Ok(())
}

impl ListSharedPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("listaId", &self.list_id)?;
        require("usuarioComparteId", &self.shared_by_user_id)?;
        require_email("emailInvitado", &self.invitee_email)?;
        require("tipoPermiso", &self.permission)?;
        require("tokenInvitacion", &self.invitation_token)
    }
}

impl UserRegisteredPayload {
    pub fn validate(&self) -> Result<(), String> {
        require_email("email", &self.email)?;
        require("nombre", &self.name)
    }
}

impl ProductAddedPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("listaId", &self.list_id)?;
        require("nombreProducto", &self.product_name)?;
        require("usuarioId", &self.user_id)?;
        match self.quantity {
            Some(q) if !q.is_finite() || q < 0.0 => Err("cantidad must be a non-negative number".to_string()),
            _ => Ok(()),
        }
    }
}

impl ListUpdatedPayload {
    pub fn validate(&self) -> Result<(), String> {
        require("listaId", &self.list_id)?;
        require("usuarioId", &self.user_id)
    }
}

// ============================================================================
// TYPED EVENT
// ============================================================================

/// A validated event, one variant per [`EventKind`]
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    ListShared(ListSharedPayload),
    UserRegistered(UserRegisteredPayload),
    ProductAdded(ProductAddedPayload),
    ListUpdated(ListUpdatedPayload),
}

impl NotificationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NotificationEvent::ListShared(_) => EventKind::ListShared,
            NotificationEvent::UserRegistered(_) => EventKind::UserRegistered,
            NotificationEvent::ProductAdded(_) => EventKind::ProductAdded,
            NotificationEvent::ListUpdated(_) => EventKind::ListUpdated,
        }
    }

    /// Resolve the envelope's `eventType` and parse `data` into its payload
    pub fn from_envelope(envelope: &EventEnvelope<Value>) -> Result<Self, DispatchError> {
        let kind = EventKind::from_tag(&envelope.event_type)
            .ok_or_else(|| DispatchError::UnknownEventType(envelope.event_type.clone()))?;

        let event = match kind {
            EventKind::ListShared => {
                let payload: ListSharedPayload = parse_data(kind, &envelope.data)?;
                payload.validate().map_err(|reason| invalid(kind, reason))?;
                NotificationEvent::ListShared(payload)
            }
            EventKind::UserRegistered => {
                let payload: UserRegisteredPayload = parse_data(kind, &envelope.data)?;
                payload.validate().map_err(|reason| invalid(kind, reason))?;
                NotificationEvent::UserRegistered(payload)
            }
            EventKind::ProductAdded => {
                let payload: ProductAddedPayload = parse_data(kind, &envelope.data)?;
                payload.validate().map_err(|reason| invalid(kind, reason))?;
                NotificationEvent::ProductAdded(payload)
            }
            EventKind::ListUpdated => {
                let payload: ListUpdatedPayload = parse_data(kind, &envelope.data)?;
                payload.validate().map_err(|reason| invalid(kind, reason))?;
                NotificationEvent::ListUpdated(payload)
            }
        };

        Ok(event)
    }
}

fn parse_data<T: serde::de::DeserializeOwned>(kind: EventKind, data: &Value) -> Result<T, DispatchError> {
    serde_json::from_value(data.clone()).map_err(|e| invalid(kind, e.to_string()))
}

fn invalid(kind: EventKind, reason: String) -> DispatchError {
    DispatchError::InvalidPayload {
        event_type: kind.tag().to_string(),
        reason,
    }
}
