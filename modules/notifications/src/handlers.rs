use async_trait::async_trait;
use event_bus::{validate_envelope_fields, Delivery, EventEnvelope};
use event_consumer::{HandlerError, MessageHandler};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::models::{
    ListSharedPayload, ListUpdatedPayload, NotificationEvent, ProductAddedPayload,
    UserRegisteredPayload,
};
use crate::ports::{
    EmailOutcome, EmailSender, InvitationEmail, ListChange, ListChangeNotification,
    ListRepository, RepositoryError, ShoppingList, User, UserRepository,
};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("{entity} '{id}' not found")]
    MissingEntity { entity: &'static str, id: String },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl DispatchError {
    /// Everything except a repository failure is a property of the message itself
    pub fn is_permanent(&self) -> bool {
        !matches!(self, DispatchError::Repository(_))
    }
}

impl From<DispatchError> for HandlerError {
    fn from(err: DispatchError) -> Self {
        if err.is_permanent() {
            HandlerError::Permanent(err.to_string())
        } else {
            HandlerError::Transient(err.to_string())
        }
    }
}

/// Outcome of dispatching one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Emails accepted by the sender
    pub sent: usize,
    /// Recipients whose lookup or send failed
    pub failed: usize,
    /// Emails intentionally not sent
    pub skipped: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &EmailOutcome) {
        if outcome.success {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Turns shopping-list events into email notifications
///
/// Required lookups (sharer, list, acting user) fail the whole event.
/// Individual recipients in a fan-out never do: their failures are logged
/// and counted in the [`DispatchReport`].
pub struct NotificationHandler {
    users: Arc<dyn UserRepository>,
    lists: Arc<dyn ListRepository>,
    email: Arc<dyn EmailSender>,
}

impl NotificationHandler {
    pub fn new(
        users: Arc<dyn UserRepository>,
        lists: Arc<dyn ListRepository>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self { users, lists, email }
    }

    /// Validate and dispatch a raw JSON message
    pub async fn handle_value(&self, message: &Value) -> Result<DispatchReport, DispatchError> {
        validate_envelope_fields(message).map_err(DispatchError::InvalidEnvelope)?;

        let envelope: EventEnvelope<Value> = serde_json::from_value(message.clone())
            .map_err(|e| DispatchError::InvalidEnvelope(e.to_string()))?;

        self.handle(&envelope).await
    }

    pub async fn handle(&self, envelope: &EventEnvelope<Value>) -> Result<DispatchReport, DispatchError> {
        let event = NotificationEvent::from_envelope(envelope)?;

        tracing::info!(
            event_type = %event.kind(),
            event_id = %envelope.event_id_or_dash(),
            "Handling notification event"
        );

        match event {
            NotificationEvent::ListShared(payload) => self.handle_list_shared(payload).await,
            NotificationEvent::UserRegistered(payload) => self.handle_user_registered(payload).await,
            NotificationEvent::ProductAdded(payload) => self.handle_product_added(payload).await,
            NotificationEvent::ListUpdated(payload) => self.handle_list_updated(payload).await,
        }
    }

    async fn handle_list_shared(&self, payload: ListSharedPayload) -> Result<DispatchReport, DispatchError> {
        let sharer = self.require_user(&payload.shared_by_user_id).await?;
        let list = self.require_list(&payload.list_id).await?;

        let outcome = self
            .email
            .send_invitation_email(&InvitationEmail {
                to: payload.invitee_email.clone(),
                inviter_name: sharer.name,
                list_name: list.name,
                permission: payload.permission,
                invitation_token: payload.invitation_token,
                expires_at: payload.expires_at,
            })
            .await;

        if !outcome.success {
            tracing::warn!(
                list_id = %payload.list_id,
                to = %payload.invitee_email,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Failed to send list invitation email"
            );
        }

        let mut report = DispatchReport::default();
        report.record(&outcome);
        Ok(report)
    }

    async fn handle_user_registered(&self, payload: UserRegisteredPayload) -> Result<DispatchReport, DispatchError> {
        let token = match payload.confirmation_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::info!(
                    email = %payload.email,
                    "No confirmation token, skipping registration email"
                );
                return Ok(DispatchReport {
                    skipped: 1,
                    ..Default::default()
                });
            }
        };

        let outcome = self
            .email
            .send_registration_confirmation(&payload.email, &payload.name, token)
            .await;

        if !outcome.success {
            tracing::warn!(
                email = %payload.email,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Failed to send registration confirmation email"
            );
        }

        let mut report = DispatchReport::default();
        report.record(&outcome);
        Ok(report)
    }

    async fn handle_product_added(&self, payload: ProductAddedPayload) -> Result<DispatchReport, DispatchError> {
        let list = self.require_list(&payload.list_id).await?;
        let actor = self.require_user(&payload.user_id).await?;

        let change = ListChange::ProductAdded {
            product_name: payload.product_name,
            quantity: payload.quantity,
        };
        Ok(self.notify_participants(&list, &actor, change).await)
    }

    async fn handle_list_updated(&self, payload: ListUpdatedPayload) -> Result<DispatchReport, DispatchError> {
        let list = self.require_list(&payload.list_id).await?;
        let actor = self.require_user(&payload.user_id).await?;

        let change = ListChange::ListUpdated {
            description: payload.change_description(),
        };
        Ok(self.notify_participants(&list, &actor, change).await)
    }

    /// Send one notification per participant except the actor
    async fn notify_participants(&self, list: &ShoppingList, actor: &User, change: ListChange) -> DispatchReport {
        let recipients: Vec<&str> = list
            .participant_ids()
            .into_iter()
            .filter(|id| *id != actor.id)
            .collect();

        let outcomes = join_all(
            recipients
                .iter()
                .map(|recipient_id| self.notify_one(list, actor, recipient_id, &change)),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in &outcomes {
            report.record(outcome);
        }

        tracing::info!(
            list_id = %list.id,
            recipients = recipients.len(),
            sent = report.sent,
            failed = report.failed,
            "List change notifications dispatched"
        );
        report
    }

    async fn notify_one(&self, list: &ShoppingList, actor: &User, recipient_id: &str, change: &ListChange) -> EmailOutcome {
        let recipient = match self.users.find_by_id(recipient_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                tracing::warn!(list_id = %list.id, recipient_id, "Recipient not found, skipping");
                return EmailOutcome::failed(format!("user '{}' not found", recipient_id));
            }
            Err(e) => {
                tracing::warn!(list_id = %list.id, recipient_id, error = %e, "Recipient lookup failed, skipping");
                return EmailOutcome::failed(e.to_string());
            }
        };

        let outcome = self
            .email
            .send_list_change_notification(&ListChangeNotification {
                to: recipient.email,
                recipient_name: recipient.name,
                list_name: list.name.clone(),
                actor_name: actor.name.clone(),
                change: change.clone(),
            })
            .await;

        if !outcome.success {
            tracing::warn!(
                list_id = %list.id,
                recipient_id,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "Failed to send list change notification"
            );
        }
        outcome
    }

    async fn require_user(&self, id: &str) -> Result<User, DispatchError> {
        self.users
            .find_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::MissingEntity {
                entity: "user",
                id: id.to_string(),
            })
    }

    async fn require_list(&self, id: &str) -> Result<ShoppingList, DispatchError> {
        self.lists
            .find_by_id(id)
            .await?
            .ok_or_else(|| DispatchError::MissingEntity {
                entity: "list",
                id: id.to_string(),
            })
    }
}

#[async_trait]
impl MessageHandler for NotificationHandler {
    async fn handle(&self, message: &Value, delivery: &Delivery) -> Result<(), HandlerError> {
        match self.handle_value(message).await {
            Ok(report) => {
                tracing::debug!(
                    routing_key = %delivery.routing_key,
                    sent = report.sent,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Notification event processed"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    routing_key = %delivery.routing_key,
                    event_type = message.get("eventType").and_then(serde_json::Value::as_str).unwrap_or("-"),
                    event_id = message.get("eventId").and_then(serde_json::Value::as_str).unwrap_or("-"),
                    error = %e,
                    "Failed to process notification event"
                );
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(DispatchError::UnknownEventType("X".into()).is_permanent());
        assert!(DispatchError::MissingEntity { entity: "user", id: "U1".into() }.is_permanent());
        assert!(!DispatchError::Repository(RepositoryError::Unavailable("down".into())).is_permanent());

        let handler_error: HandlerError = DispatchError::InvalidEnvelope("bad".into()).into();
        assert!(handler_error.is_permanent());

        let handler_error: HandlerError =
            DispatchError::Repository(RepositoryError::Query("timeout".into())).into();
        assert!(!handler_error.is_permanent());
    }

    #[test]
    fn test_report_records_outcomes() {
        let mut report = DispatchReport::default();
        report.record(&EmailOutcome::sent("m1"));
        report.record(&EmailOutcome::failed("smtp down"));
        report.record(&EmailOutcome::sent("m2"));

        assert_eq!(report, DispatchReport { sent: 2, failed: 1, skipped: 0 });
    }
}
