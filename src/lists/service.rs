use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    auth::Principal,
    error::AuthError,
    model::{ListOp, ListOutcome, User},
    store::{timed, UserStore},
};

/// Named lists of the signed-in user. Every call needs a `Principal`, so nothing
/// here runs for an unauthenticated request.
#[derive(Clone)]
pub struct ListService {
    users: Arc<dyn UserStore>,
    store_timeout: Duration,
}

impl ListService {
    pub fn new(users: Arc<dyn UserStore>, store_timeout: Duration) -> Self {
        Self {
            users,
            store_timeout,
        }
    }

    async fn apply(&self, who: &Principal, op: ListOp) -> Result<ListOutcome, AuthError> {
        let outcome = timed(self.store_timeout, self.users.update_lists(who.id(), &op))
            .await?
            .ok_or(AuthError::Unauthenticated)?;
        debug!(user_id = %who.id(), ?op, ?outcome, "list update");
        Ok(outcome)
    }

    async fn current(&self, who: &Principal) -> Result<User, AuthError> {
        timed(self.store_timeout, self.users.find_by_id(who.id()))
            .await?
            .ok_or(AuthError::Unauthenticated)
    }

    /// No-op when the list already exists.
    pub async fn add_list(&self, who: &Principal, name: &str) -> Result<ListOutcome, AuthError> {
        self.apply(who, ListOp::AddList(name.to_string())).await
    }

    pub async fn remove_list(&self, who: &Principal, name: &str) -> Result<ListOutcome, AuthError> {
        self.apply(who, ListOp::RemoveList(name.to_string())).await
    }

    /// Appends `item`; a missing list leaves everything untouched.
    pub async fn add_item(
        &self,
        who: &Principal,
        list: &str,
        item: &str,
    ) -> Result<ListOutcome, AuthError> {
        self.apply(
            who,
            ListOp::AddItem {
                list: list.to_string(),
                item: item.to_string(),
            },
        )
        .await
    }

    /// Drops every occurrence of `item`.
    pub async fn remove_item(
        &self,
        who: &Principal,
        list: &str,
        item: &str,
    ) -> Result<ListOutcome, AuthError> {
        self.apply(
            who,
            ListOp::RemoveItem {
                list: list.to_string(),
                item: item.to_string(),
            },
        )
        .await
    }

    pub async fn list_names(&self, who: &Principal) -> Result<Vec<String>, AuthError> {
        Ok(self.current(who).await?.lists.names())
    }

    /// Empty for a list that was never created.
    pub async fn list_items(&self, who: &Principal, list: &str) -> Result<Vec<String>, AuthError> {
        Ok(self.current(who).await?.lists.items(list).to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::SessionManager,
        config::SessionConfig,
        store::{fakes::FlakyUserStore, MemorySessionStore, MemoryUserStore},
    };

    struct Fixture {
        users: Arc<MemoryUserStore>,
        lists: ListService,
        who: Principal,
    }

    async fn fixture() -> Fixture {
        let users = Arc::new(MemoryUserStore::new());
        let timeout = Duration::from_secs(1);
        let sessions = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            users.clone(),
            &SessionConfig {
                ttl_minutes: 5,
                cookie_secure: false,
            },
            timeout,
        );
        let user = User::new_local("a@example.com".into(), None, "hash".into());
        users.insert(&user).await.unwrap();
        let token = sessions.establish(user.id).await.unwrap();
        let who = sessions.resolve(token.as_str()).await.unwrap();
        Fixture {
            lists: ListService::new(users.clone(), timeout),
            users,
            who,
        }
    }

    #[tokio::test]
    async fn add_list_twice_yields_one_empty_list() {
        let f = fixture().await;
        assert_eq!(
            f.lists.add_list(&f.who, "groceries").await.unwrap(),
            ListOutcome::Changed
        );
        assert_eq!(
            f.lists.add_list(&f.who, "groceries").await.unwrap(),
            ListOutcome::Unchanged
        );
        assert_eq!(f.lists.list_names(&f.who).await.unwrap(), vec!["groceries"]);
        assert!(f.lists.list_items(&f.who, "groceries").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_item_removes_all_occurrences() {
        let f = fixture().await;
        f.lists.add_list(&f.who, "l").await.unwrap();
        for item in ["a", "b", "a", "c"] {
            f.lists.add_item(&f.who, "l", item).await.unwrap();
        }
        f.lists.remove_item(&f.who, "l", "a").await.unwrap();
        assert_eq!(f.lists.list_items(&f.who, "l").await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn add_item_to_missing_list_changes_nothing() {
        let f = fixture().await;
        f.lists.add_list(&f.who, "keep").await.unwrap();
        let before = f.users.find_by_id(f.who.id()).await.unwrap().unwrap().lists;

        let outcome = f.lists.add_item(&f.who, "ghost", "milk").await.unwrap();
        assert_eq!(outcome, ListOutcome::MissingList);

        let after = f.users.find_by_id(f.who.id()).await.unwrap().unwrap().lists;
        assert_eq!(before, after);
        assert!(!after.contains("ghost"));
    }

    #[tokio::test]
    async fn missing_targets_are_no_ops() {
        let f = fixture().await;
        assert_eq!(
            f.lists.remove_list(&f.who, "nope").await.unwrap(),
            ListOutcome::MissingList
        );
        assert_eq!(
            f.lists.remove_item(&f.who, "nope", "x").await.unwrap(),
            ListOutcome::MissingList
        );
        assert!(f.lists.list_items(&f.who, "never-created").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_list_drops_items() {
        let f = fixture().await;
        f.lists.add_list(&f.who, "l").await.unwrap();
        f.lists.add_item(&f.who, "l", "x").await.unwrap();
        f.lists.remove_list(&f.who, "l").await.unwrap();
        assert!(f.lists.list_names(&f.who).await.unwrap().is_empty());

        f.lists.add_list(&f.who, "l").await.unwrap();
        assert!(f.lists.list_items(&f.who, "l").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let f = fixture().await;
        f.lists.add_list(&f.who, "l").await.unwrap();
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let lists = f.lists.clone();
                let who = f.who.clone();
                tokio::spawn(async move { lists.add_item(&who, "l", &i.to_string()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(f.lists.list_items(&f.who, "l").await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn deleted_account_is_unauthenticated() {
        let f = fixture().await;
        f.users.delete(f.who.id()).await.unwrap();
        assert!(matches!(
            f.lists.add_list(&f.who, "l").await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn stalled_store_is_unavailable() {
        let users = Arc::new(FlakyUserStore::default());
        let timeout = Duration::from_millis(50);
        let sessions = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            users.clone(),
            &SessionConfig {
                ttl_minutes: 5,
                cookie_secure: false,
            },
            timeout,
        );
        let user = User::new_local("a@example.com".into(), None, "hash".into());
        users.insert(&user).await.unwrap();
        let token = sessions.establish(user.id).await.unwrap();
        let who = sessions.resolve(token.as_str()).await.unwrap();
        let lists = ListService::new(users.clone(), timeout);
        lists.add_list(&who, "l").await.unwrap();

        users.hang();
        assert!(matches!(
            lists.add_item(&who, "l", "milk").await,
            Err(AuthError::StoreUnavailable)
        ));
        assert!(matches!(
            lists.list_items(&who, "l").await,
            Err(AuthError::StoreUnavailable)
        ));
    }
}
