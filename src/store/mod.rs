use std::{future::Future, time::Duration};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::StoreError,
    model::{ListOp, ListOutcome, PendingVerification, User},
};

pub mod memory;
pub mod postgres;

pub use memory::{MemorySessionStore, MemoryUserStore};
pub use postgres::{PgSessionStore, PgUserStore};

/// Single-record lookups supported by every store.
#[derive(Debug, Clone, Copy)]
pub enum UserFilter<'a> {
    Username(&'a str),
    FederatedId(&'a str),
    /// Matches only while the token has not expired.
    LiveVerificationToken {
        token_hash: &'a str,
        now: OffsetDateTime,
    },
}

impl UserFilter<'_> {
    pub fn matches(&self, user: &User) -> bool {
        match *self {
            UserFilter::Username(username) => user.credentials.username() == Some(username),
            UserFilter::FederatedId(id) => user.credentials.federated_id() == Some(id),
            UserFilter::LiveVerificationToken { token_hash, now } => user
                .pending_verification
                .as_ref()
                .is_some_and(|p| p.token_hash == token_hash && p.is_live(now)),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn find_one(&self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError>;
    /// Fails with `StoreError::Conflict` when the username or federated id is taken.
    async fn insert(&self, user: &User) -> Result<(), StoreError>;
    /// Whole-record writes. Request paths use the targeted updates below instead.
    #[allow(dead_code)]
    async fn save(&self, user: &User) -> Result<(), StoreError>;
    #[allow(dead_code)]
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
    /// Applies `op` to the user's lists as one atomic step. `None` if the user is gone.
    async fn update_lists(&self, id: Uuid, op: &ListOp)
        -> Result<Option<ListOutcome>, StoreError>;
    /// Replaces the pending token of an unverified account. `false` when the account is
    /// gone or already verified.
    async fn set_pending_verification(
        &self,
        id: Uuid,
        pending: &PendingVerification,
    ) -> Result<bool, StoreError>;
    /// Attaches `federated_id` to an account that has none, touching no other field.
    /// `Conflict` when another account owns the id.
    async fn link_federated(&self, id: Uuid, federated_id: &str)
        -> Result<Option<User>, StoreError>;
    /// Marks the owner of a live token verified and clears the token, atomically.
    async fn consume_verification(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<User>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub token_hash: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn find_live(
        &self,
        token_hash: &str,
        now: OffsetDateTime,
    ) -> Result<Option<Uuid>, StoreError>;
    async fn delete(&self, token_hash: &str) -> Result<(), StoreError>;
    /// Drops every session expired at `now`.
    async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, StoreError>;
}

/// Bounds a store call; an elapsed timer surfaces as `StoreError::Unavailable`.
pub async fn timed<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Unavailable)?
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::MemoryUserStore;

    /// Memory store that can be told to stall every call or to fail plain saves.
    #[derive(Default)]
    pub struct FlakyUserStore {
        pub inner: MemoryUserStore,
        hang: AtomicBool,
        fail_saves: AtomicBool,
    }

    impl FlakyUserStore {
        pub fn hang(&self) {
            self.hang.store(true, Ordering::SeqCst);
        }

        pub fn fail_saves(&self) {
            self.fail_saves.store(true, Ordering::SeqCst);
        }

        async fn gate(&self) {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        }
    }

    #[async_trait]
    impl UserStore for FlakyUserStore {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
            self.gate().await;
            self.inner.find_by_id(id).await
        }

        async fn find_one(&self, filter: UserFilter<'_>) -> Result<Option<User>, StoreError> {
            self.gate().await;
            self.inner.find_one(filter).await
        }

        async fn insert(&self, user: &User) -> Result<(), StoreError> {
            self.gate().await;
            self.inner.insert(user).await
        }

        async fn save(&self, user: &User) -> Result<(), StoreError> {
            self.gate().await;
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable);
            }
            self.inner.save(user).await
        }

        async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
            self.gate().await;
            self.inner.delete(id).await
        }

        async fn update_lists(
            &self,
            id: Uuid,
            op: &ListOp,
        ) -> Result<Option<ListOutcome>, StoreError> {
            self.gate().await;
            self.inner.update_lists(id, op).await
        }

        async fn set_pending_verification(
            &self,
            id: Uuid,
            pending: &PendingVerification,
        ) -> Result<bool, StoreError> {
            self.gate().await;
            self.inner.set_pending_verification(id, pending).await
        }

        async fn link_federated(
            &self,
            id: Uuid,
            federated_id: &str,
        ) -> Result<Option<User>, StoreError> {
            self.gate().await;
            self.inner.link_federated(id, federated_id).await
        }

        async fn consume_verification(
            &self,
            token_hash: &str,
            now: OffsetDateTime,
        ) -> Result<Option<User>, StoreError> {
            self.gate().await;
            self.inner.consume_verification(token_hash, now).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timed_reports_unavailable_on_hang() {
        let res: Result<(), StoreError> = timed(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(StoreError::Unavailable)));
    }

    #[tokio::test]
    async fn timed_passes_through_results() {
        let res = timed(Duration::from_secs(1), async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
