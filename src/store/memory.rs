use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{SessionRecord, SessionStore, UserFilter, UserStore};
use crate::{
    error::StoreError,
    model::{ListOp, ListOutcome, PendingVerification, User},
};

/// Process-local user store. Uniqueness checks and list updates happen under one lock.
#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.users.lock().len()
    }

    fn conflicts(existing: &HashMap<Uuid, User>, user: &User) -> bool {
        existing.values().any(|other| {
            other.id != user.id
                && ((user.credentials.username().is_some()
                    && other.credentials.username() == user.credentials.username())
                    || (user.credentials.federated_id().is_some()
                        && other.credentials.federated_id() == user.credentials.federated_id()))
        })
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.lock().get(&id).cloned())
    }

    async fn find_one(&self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| filter.matches(u))
            .cloned())
    }

    async fn insert(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.lock();
        if users.contains_key(&user.id) || Self::conflicts(&users, user) {
            return Err(StoreError::Conflict);
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn save(&self, user: &User) -> Result<(), StoreError> {
        let mut users = self.users.lock();
        if Self::conflicts(&users, user) {
            return Err(StoreError::Conflict);
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.users.lock().remove(&id);
        Ok(())
    }

    async fn update_lists(
        &self,
        id: Uuid,
        op: &ListOp,
    ) -> Result<Option<ListOutcome>, StoreError> {
        Ok(self
            .users
            .lock()
            .get_mut(&id)
            .map(|user| op.apply(&mut user.lists)))
    }

    async fn set_pending_verification(
        &self,
        id: Uuid,
        pending: &PendingVerification,
    ) -> Result<bool, StoreError> {
        let mut users = self.users.lock();
        match users.get_mut(&id) {
            Some(user) if !user.is_verified => {
                user.pending_verification = Some(pending.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn link_federated(
        &self,
        id: Uuid,
        federated_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let mut users = self.users.lock();
        if users
            .values()
            .any(|u| u.id != id && u.credentials.federated_id() == Some(federated_id))
        {
            return Err(StoreError::Conflict);
        }
        let Some(user) = users.get_mut(&id) else {
            return Ok(None);
        };
        let Some(linked) = user.credentials.clone().link(federated_id.to_string()) else {
            return Ok(None);
        };
        user.credentials = linked;
        Ok(Some(user.clone()))
    }

    async fn consume_verification(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError> {
        let filter = UserFilter::LiveVerificationToken { token_hash, now };
        let mut users = self.users.lock();
        Ok(users.values_mut().find(|u| filter.matches(u)).map(|user| {
            user.mark_verified();
            user.clone()
        }))
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions
            .lock()
            .insert(record.token_hash.clone(), record.clone());
        Ok(())
    }

    async fn find_live(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut sessions = self.sessions.lock();
        match sessions.get(token_hash) {
            Some(record) if record.expires_at > now => Ok(Some(record.user_id)),
            Some(_) => {
                sessions.remove(token_hash);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, token_hash: &str) -> Result<(), StoreError> {
        self.sessions.lock().remove(token_hash);
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, record| record.expires_at > now);
        Ok((before - sessions.len()) as u64)
    }
}
