use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::COOKIE, request::Parts, HeaderMap},
};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    auth::token::{generate_token, hash_token},
    config::SessionConfig,
    error::AuthError,
    model::User,
    state::AppState,
    store::{timed, SessionRecord, SessionStore, UserStore},
};

pub const SESSION_COOKIE: &str = "listify_session";

/// Raw session token as handed to the client.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

/// An authenticated user, freshly loaded for the current request.
/// Only `SessionManager::resolve` hands these out.
#[derive(Debug, Clone)]
pub struct Principal {
    user: User,
}

impl Principal {
    pub fn id(&self) -> Uuid {
        self.user.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }
}

#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    ttl: time::Duration,
    cookie_secure: bool,
    store_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        config: &SessionConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            users,
            ttl: time::Duration::minutes(config.ttl_minutes),
            cookie_secure: config.cookie_secure,
            store_timeout,
        }
    }

    pub async fn establish(&self, user_id: Uuid) -> Result<SessionToken, AuthError> {
        let token = generate_token();
        let now = OffsetDateTime::now_utc();
        let record = SessionRecord {
            token_hash: hash_token(&token),
            user_id,
            expires_at: now + self.ttl,
        };
        timed(self.store_timeout, self.sessions.insert(&record)).await?;
        debug!(%user_id, "session established");
        match timed(self.store_timeout, self.sessions.purge_expired(now)).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired sessions removed"),
            Err(e) => warn!(error = %e, "expired session purge failed"),
        }
        Ok(SessionToken(token))
    }

    /// Maps a token to its user, re-reading the user record on every call.
    pub async fn resolve(&self, token: &str) -> Result<Principal, AuthError> {
        let token_hash = hash_token(token);
        let now = OffsetDateTime::now_utc();
        let user_id = timed(self.store_timeout, self.sessions.find_live(&token_hash, now))
            .await?
            .ok_or(AuthError::Unauthenticated)?;
        match timed(self.store_timeout, self.users.find_by_id(user_id)).await? {
            Some(user) => Ok(Principal { user }),
            None => {
                warn!(%user_id, "session refers to a missing user");
                timed(self.store_timeout, self.sessions.delete(&token_hash)).await?;
                Err(AuthError::Unauthenticated)
            }
        }
    }

    pub async fn terminate(&self, token: &str) -> Result<(), AuthError> {
        timed(self.store_timeout, self.sessions.delete(&hash_token(token))).await?;
        Ok(())
    }

    pub fn session_cookie(&self, token: &SessionToken) -> String {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            token.as_str(),
            self.ttl.whole_seconds()
        );
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    pub fn clear_cookie(&self) -> String {
        let mut cookie = format!("{SESSION_COOKIE}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0");
        if self.cookie_secure {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for Principal {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = read_cookie(&parts.headers, SESSION_COOKIE).ok_or(AuthError::Unauthenticated)?;
        state.sessions.resolve(&token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySessionStore, MemoryUserStore};
    use axum::http::HeaderValue;

    fn manager(users: Arc<MemoryUserStore>) -> SessionManager {
        manager_over(Arc::new(MemorySessionStore::new()), users)
    }

    fn manager_over(
        sessions: Arc<MemorySessionStore>,
        users: Arc<MemoryUserStore>,
    ) -> SessionManager {
        SessionManager::new(
            sessions,
            users,
            &SessionConfig {
                ttl_minutes: 30,
                cookie_secure: true,
            },
            Duration::from_secs(1),
        )
    }

    async fn stored_user(users: &MemoryUserStore) -> User {
        let user = User::new_local("a@example.com".into(), None, "hash".into());
        users.insert(&user).await.unwrap();
        user
    }

    #[tokio::test]
    async fn resolve_returns_current_user_record() {
        let users = Arc::new(MemoryUserStore::new());
        let sessions = manager(users.clone());
        let mut user = stored_user(&users).await;
        let token = sessions.establish(user.id).await.unwrap();

        user.name = Some("Alice".into());
        users.save(&user).await.unwrap();

        let principal = sessions.resolve(token.as_str()).await.unwrap();
        assert_eq!(principal.id(), user.id);
        assert_eq!(principal.user().name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn terminate_invalidates_token() {
        let users = Arc::new(MemoryUserStore::new());
        let sessions = manager(users.clone());
        let user = stored_user(&users).await;
        let token = sessions.establish(user.id).await.unwrap();

        sessions.terminate(token.as_str()).await.unwrap();
        let err = sessions.resolve(token.as_str()).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn establish_sweeps_expired_sessions() {
        let users = Arc::new(MemoryUserStore::new());
        let store = Arc::new(MemorySessionStore::new());
        let sessions = manager_over(store.clone(), users.clone());
        let user = stored_user(&users).await;
        store
            .insert(&SessionRecord {
                token_hash: "stale".into(),
                user_id: user.id,
                expires_at: OffsetDateTime::now_utc() - time::Duration::minutes(1),
            })
            .await
            .unwrap();

        sessions.establish(user.id).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unknown_token_is_unauthenticated() {
        let sessions = manager(Arc::new(MemoryUserStore::new()));
        let err = sessions.resolve("made-up").await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated));
    }

    #[tokio::test]
    async fn deleted_user_ends_session() {
        let users = Arc::new(MemoryUserStore::new());
        let sessions = manager(users.clone());
        let user = stored_user(&users).await;
        let token = sessions.establish(user.id).await.unwrap();
        users.delete(user.id).await.unwrap();

        assert!(matches!(
            sessions.resolve(token.as_str()).await,
            Err(AuthError::Unauthenticated)
        ));
    }

    #[test]
    fn cookie_flags_follow_config() {
        let sessions = manager(Arc::new(MemoryUserStore::new()));
        let cookie = sessions.session_cookie(&SessionToken("abc".into()));
        assert!(cookie.starts_with("listify_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=1800"));
        assert!(cookie.ends_with("; Secure"));
        assert!(sessions.clear_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn read_cookie_picks_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; listify_session=tok123; other=1"),
        );
        assert_eq!(
            read_cookie(&headers, SESSION_COOKIE).as_deref(),
            Some("tok123")
        );
        assert_eq!(read_cookie(&headers, "missing"), None);
    }
}
