//! In-memory repositories for development and tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::ports::{ListRepository, RepositoryError, ShoppingList, User, UserRepository};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
    unavailable: AtomicBool,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let repo = Self::new();
        for user in users {
            repo.insert(user);
        }
        repo
    }

    pub fn insert(&self, user: User) {
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.id.clone(), user);
    }

    /// Make every lookup fail until called again with `false`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<User>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("user store offline".to_string()));
        }

        Ok(self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

#[derive(Default)]
pub struct InMemoryListRepository {
    lists: RwLock<HashMap<String, ShoppingList>>,
    unavailable: AtomicBool,
}

impl InMemoryListRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lists(lists: impl IntoIterator<Item = ShoppingList>) -> Self {
        let repo = Self::new();
        for list in lists {
            repo.insert(list);
        }
        repo
    }

    pub fn insert(&self, list: ShoppingList) {
        self.lists
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(list.id.clone(), list);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ListRepository for InMemoryListRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<ShoppingList>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("list store offline".to_string()));
        }

        Ok(self
            .lists
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_user_lookup() {
        let repo = InMemoryUserRepository::with_users([User {
            id: "U1".into(),
            email: "ana@example.com".into(),
            name: "Ana".into(),
        }]);

        assert_eq!(repo.find_by_id("U1").await.unwrap().unwrap().name, "Ana");
        assert!(repo.find_by_id("U2").await.unwrap().is_none());

        repo.set_unavailable(true);
        assert!(repo.find_by_id("U1").await.is_err());
    }

    #[tokio::test]
    async fn test_list_lookup() {
        let repo = InMemoryListRepository::with_lists([ShoppingList {
            id: "L1".into(),
            name: "Semana".into(),
            owner_id: "U1".into(),
            collaborator_ids: vec![],
        }]);

        assert!(repo.find_by_id("L1").await.unwrap().is_some());
        assert!(repo.find_by_id("nope").await.unwrap().is_none());
    }
}
