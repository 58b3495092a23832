use async_trait::async_trait;
use uuid::Uuid;

use crate::ports::{EmailOutcome, EmailSender, InvitationEmail, ListChangeNotification};

/// Email sender that only logs what it would send
///
/// Used when no SMTP provider is wired in (local development, `BROKER_TYPE=inmemory`).
#[derive(Debug, Default, Clone)]
pub struct LoggingEmailSender;

impl LoggingEmailSender {
    pub fn new() -> Self {
        Self
    }

    fn message_id() -> String {
        format!("mock-msg-{}", Uuid::new_v4())
    }
}

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_invitation_email(&self, email: &InvitationEmail) -> EmailOutcome {
        let message_id = Self::message_id();
        tracing::info!(
            to = %email.to,
            list = %email.list_name,
            inviter = %email.inviter_name,
            permission = %email.permission,
            message_id = %message_id,
            "Mock: Sending list invitation email"
        );
        EmailOutcome::sent(message_id)
    }

    async fn send_list_change_notification(&self, notification: &ListChangeNotification) -> EmailOutcome {
        let message_id = Self::message_id();
        tracing::info!(
            to = %notification.to,
            list = %notification.list_name,
            actor = %notification.actor_name,
            change = %notification.change.summary(),
            message_id = %message_id,
            "Mock: Sending list change notification"
        );
        EmailOutcome::sent(message_id)
    }

    async fn send_registration_confirmation(&self, email: &str, name: &str, _token: &str) -> EmailOutcome {
        let message_id = Self::message_id();
        tracing::info!(
            to = %email,
            name = %name,
            message_id = %message_id,
            "Mock: Sending registration confirmation email"
        );
        EmailOutcome::sent(message_id)
    }
}
