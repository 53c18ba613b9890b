use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// How an account proves who it is. Every variant carries at least one credential,
/// so an account without any way to log in cannot be represented.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Local {
        username: String,
        password_hash: String,
    },
    Federated {
        federated_id: String,
    },
    Linked {
        username: String,
        password_hash: String,
        federated_id: String,
    },
}

impl Credentials {
    /// Rebuild credentials from nullable storage columns.
    pub fn from_parts(
        username: Option<String>,
        password_hash: Option<String>,
        federated_id: Option<String>,
    ) -> Option<Self> {
        match (username, password_hash, federated_id) {
            (Some(username), Some(password_hash), None) => Some(Self::Local {
                username,
                password_hash,
            }),
            (Some(username), Some(password_hash), Some(federated_id)) => Some(Self::Linked {
                username,
                password_hash,
                federated_id,
            }),
            (None, None, Some(federated_id)) => Some(Self::Federated { federated_id }),
            _ => None,
        }
    }

    pub fn username(&self) -> Option<&str> {
        match self {
            Self::Local { username, .. } | Self::Linked { username, .. } => Some(username),
            Self::Federated { .. } => None,
        }
    }

    pub fn password_hash(&self) -> Option<&str> {
        match self {
            Self::Local { password_hash, .. } | Self::Linked { password_hash, .. } => {
                Some(password_hash)
            }
            Self::Federated { .. } => None,
        }
    }

    pub fn federated_id(&self) -> Option<&str> {
        match self {
            Self::Federated { federated_id } | Self::Linked { federated_id, .. } => {
                Some(federated_id)
            }
            Self::Local { .. } => None,
        }
    }

    /// Attach a provider identity to a local account. Returns `None` when the
    /// account already carries a federated id.
    pub fn link(self, federated_id: String) -> Option<Self> {
        match self {
            Self::Local {
                username,
                password_hash,
            } => Some(Self::Linked {
                username,
                password_hash,
                federated_id,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { username, .. } => f
                .debug_struct("Local")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::Federated { federated_id } => f
                .debug_struct("Federated")
                .field("federated_id", federated_id)
                .finish(),
            Self::Linked {
                username,
                federated_id,
                ..
            } => f
                .debug_struct("Linked")
                .field("username", username)
                .field("federated_id", federated_id)
                .finish_non_exhaustive(),
        }
    }
}

/// An outstanding email verification. Only the digest of the token is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVerification {
    pub token_hash: String,
    pub expires_at: OffsetDateTime,
}

impl PendingVerification {
    /// A token is usable strictly before its expiry instant.
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        self.expires_at > now
    }
}

/// User record in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub name: Option<String>,
    pub credentials: Credentials,
    pub is_verified: bool,
    pub pending_verification: Option<PendingVerification>,
    pub lists: UserLists,
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn new_local(username: String, name: Option<String>, password_hash: String) -> Self {
        Self::with_credentials(
            name,
            Credentials::Local {
                username,
                password_hash,
            },
        )
    }

    pub fn new_federated(federated_id: String, name: Option<String>) -> Self {
        Self::with_credentials(name, Credentials::Federated { federated_id })
    }

    fn with_credentials(name: Option<String>, credentials: Credentials) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            credentials,
            is_verified: false,
            pending_verification: None,
            lists: UserLists::default(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Marks the account verified and drops the pending token.
    pub fn mark_verified(&mut self) {
        self.is_verified = true;
        self.pending_verification = None;
    }
}

/// Outcome of a list mutation. `MissingList` and `Unchanged` are no-ops for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOutcome {
    Changed,
    Unchanged,
    MissingList,
}

/// A user's named lists. Names are unique; items keep insertion order and may repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserLists(BTreeMap<String, Vec<String>>);

impl UserLists {
    pub fn add_list(&mut self, name: &str) -> ListOutcome {
        if self.0.contains_key(name) {
            return ListOutcome::Unchanged;
        }
        self.0.insert(name.to_string(), Vec::new());
        ListOutcome::Changed
    }

    pub fn remove_list(&mut self, name: &str) -> ListOutcome {
        match self.0.remove(name) {
            Some(_) => ListOutcome::Changed,
            None => ListOutcome::MissingList,
        }
    }

    pub fn add_item(&mut self, list: &str, item: &str) -> ListOutcome {
        match self.0.get_mut(list) {
            Some(items) => {
                items.push(item.to_string());
                ListOutcome::Changed
            }
            None => ListOutcome::MissingList,
        }
    }

    /// Removes every occurrence of `item`, keeping the order of what remains.
    pub fn remove_item(&mut self, list: &str, item: &str) -> ListOutcome {
        let Some(items) = self.0.get_mut(list) else {
            return ListOutcome::MissingList;
        };
        let before = items.len();
        items.retain(|existing| existing != item);
        if items.len() == before {
            ListOutcome::Unchanged
        } else {
            ListOutcome::Changed
        }
    }

    /// List names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }

    /// Items of `list`, empty when the list does not exist.
    pub fn items(&self, list: &str) -> &[String] {
        self.0.get(list).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub fn contains(&self, list: &str) -> bool {
        self.0.contains_key(list)
    }
}

/// A single mutation of a user's lists, applied atomically by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOp {
    AddList(String),
    RemoveList(String),
    AddItem { list: String, item: String },
    RemoveItem { list: String, item: String },
}

impl ListOp {
    pub fn apply(&self, lists: &mut UserLists) -> ListOutcome {
        match self {
            Self::AddList(name) => lists.add_list(name),
            Self::RemoveList(name) => lists.remove_list(name),
            Self::AddItem { list, item } => lists.add_item(list, item),
            Self::RemoveItem { list, item } => lists.remove_item(list, item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn add_list_is_idempotent() {
        let mut lists = UserLists::default();
        assert_eq!(lists.add_list("groceries"), ListOutcome::Changed);
        assert_eq!(lists.add_list("groceries"), ListOutcome::Unchanged);
        assert_eq!(lists.names(), strings(&["groceries"]));
        assert!(lists.items("groceries").is_empty());
    }

    #[test]
    fn remove_item_drops_every_occurrence() {
        let mut lists = UserLists::default();
        lists.add_list("l");
        for item in ["a", "b", "a", "c"] {
            lists.add_item("l", item);
        }
        assert_eq!(lists.remove_item("l", "a"), ListOutcome::Changed);
        assert_eq!(lists.items("l"), strings(&["b", "c"]).as_slice());
        assert_eq!(lists.remove_item("l", "zzz"), ListOutcome::Unchanged);
    }

    #[test]
    fn operations_on_missing_list_are_no_ops() {
        let mut lists = UserLists::default();
        assert_eq!(lists.add_item("nope", "milk"), ListOutcome::MissingList);
        assert_eq!(lists.remove_item("nope", "milk"), ListOutcome::MissingList);
        assert_eq!(lists.remove_list("nope"), ListOutcome::MissingList);
        assert_eq!(lists, UserLists::default());
        assert!(lists.items("nope").is_empty());
    }

    #[test]
    fn items_keep_insertion_order_and_duplicates() {
        let mut lists = UserLists::default();
        lists.add_list("l");
        for item in ["milk", "eggs", "milk"] {
            ListOp::AddItem {
                list: "l".into(),
                item: item.into(),
            }
            .apply(&mut lists);
        }
        assert_eq!(lists.items("l"), strings(&["milk", "eggs", "milk"]).as_slice());
    }

    #[test]
    fn credentials_from_parts_requires_a_credential() {
        assert!(Credentials::from_parts(None, None, None).is_none());
        assert!(Credentials::from_parts(Some("a@b.c".into()), None, None).is_none());
        let linked =
            Credentials::from_parts(Some("a@b.c".into()), Some("h".into()), Some("g1".into()))
                .expect("linked");
        assert_eq!(linked.username(), Some("a@b.c"));
        assert_eq!(linked.federated_id(), Some("g1"));
    }

    #[test]
    fn credentials_debug_hides_password_hash() {
        let creds = Credentials::Local {
            username: "a@b.c".into(),
            password_hash: "$argon2id$secret".into(),
        };
        assert!(!format!("{creds:?}").contains("argon2id"));
    }

    #[test]
    fn lists_serialize_as_plain_map() {
        let mut lists = UserLists::default();
        lists.add_list("todo");
        lists.add_item("todo", "x");
        let json = serde_json::to_string(&lists).unwrap();
        assert_eq!(json, r#"{"todo":["x"]}"#);
    }
}
