//! Collaborator ports: user/list lookups and email delivery
//!
//! The worker only reads from the shopping-list domain, so the repositories
//! expose nothing but `find_by_id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShoppingList {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    /// Users the list has been shared with
    pub collaborator_ids: Vec<String>,
}

impl ShoppingList {
    /// Owner followed by collaborators, without duplicates
    pub fn participant_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::with_capacity(self.collaborator_ids.len() + 1);
        for id in std::iter::once(&self.owner_id).chain(&self.collaborator_ids) {
            if !ids.contains(&id.as_str()) {
                ids.push(id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("repository query failed: {0}")]
    Query(String),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// `Ok(None)` when the user does not exist
    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError>;
}

#[async_trait]
pub trait ListRepository: Send + Sync {
    /// `Ok(None)` when the list does not exist
    async fn find_by_id(&self, id: &str) -> Result<Option<ShoppingList>, RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationEmail {
    pub to: String,
    pub inviter_name: String,
    pub list_name: String,
    pub permission: String,
    pub invitation_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListChange {
    ProductAdded {
        product_name: String,
        quantity: Option<f64>,
    },
    ListUpdated {
        description: Option<String>,
    },
}

impl ListChange {
    pub fn summary(&self) -> String {
        match self {
            ListChange::ProductAdded {
                product_name,
                quantity: Some(quantity),
            } => format!("added {} x {}", quantity, product_name),
            ListChange::ProductAdded { product_name, .. } => format!("added {}", product_name),
            ListChange::ListUpdated {
                description: Some(description),
            } => format!("updated the list: {}", description),
            ListChange::ListUpdated { description: None } => "updated the list".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListChangeNotification {
    pub to: String,
    pub recipient_name: String,
    pub list_name: String,
    pub actor_name: String,
    pub change: ListChange,
}

/// Result of one send attempt
///
/// Delivery failures are reported here rather than as errors: the caller
/// decides whether a failed send matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl EmailOutcome {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_invitation_email(&self, email: &InvitationEmail) -> EmailOutcome;

    async fn send_list_change_notification(&self, notification: &ListChangeNotification) -> EmailOutcome;

    async fn send_registration_confirmation(&self, email: &str, name: &str, token: &str) -> EmailOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participants_are_deduplicated() {
        let list = ShoppingList {
            id: "L1".into(),
            name: "Semana".into(),
            owner_id: "U1".into(),
            collaborator_ids: vec!["U2".into(), "U1".into(), "U3".into(), "U2".into()],
        };

        assert_eq!(list.participant_ids(), vec!["U1", "U2", "U3"]);
    }

    #[test]
    fn test_change_summary() {
        let added = ListChange::ProductAdded {
            product_name: "Leche".into(),
            quantity: Some(2.0),
        };
        assert_eq!(added.summary(), "added 2 x Leche");

        let updated = ListChange::ListUpdated { description: None };
        assert_eq!(updated.summary(), "updated the list");
    }
}
