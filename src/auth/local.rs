use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        password::{burn_hash, hash_password, verify_password, MIN_PASSWORD_LEN},
        session::{SessionManager, SessionToken},
        verification::{Delivery, VerificationManager},
    },
    error::{AuthError, StoreError},
    model::User,
    store::{timed, UserFilter, UserStore},
};

pub(crate) fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

#[derive(Debug)]
pub struct Authenticated {
    pub user: User,
    pub session: SessionToken,
}

#[derive(Clone)]
pub struct LocalAuthenticator {
    users: Arc<dyn UserStore>,
    verification: VerificationManager,
    sessions: SessionManager,
    store_timeout: Duration,
}

impl LocalAuthenticator {
    pub fn new(
        users: Arc<dyn UserStore>,
        verification: VerificationManager,
        sessions: SessionManager,
        store_timeout: Duration,
    ) -> Self {
        Self {
            users,
            verification,
            sessions,
            store_timeout,
        }
    }

    /// Creates an unverified account, token included, in a single write and then sends
    /// the verification email. When delivery fails the account still exists and
    /// `NotificationFailed` is returned.
    #[instrument(skip(self, name, password))]
    pub async fn register(
        &self,
        username: &str,
        name: Option<&str>,
        password: &str,
    ) -> Result<User, AuthError> {
        let username = normalize_username(username);
        if !is_valid_email(&username) {
            return Err(AuthError::InvalidInput("Username must be an email address"));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::InvalidInput("Password too short"));
        }

        let existing = timed(
            self.store_timeout,
            self.users.find_one(UserFilter::Username(&username)),
        )
        .await?;
        if existing.is_some() {
            warn!(%username, "username already registered");
            return Err(AuthError::DuplicateUsername);
        }

        let name = name.map(str::trim).filter(|n| !n.is_empty()).map(String::from);
        let mut user = User::new_local(username, name, hash_password(password)?);
        let token = self.verification.attach(&mut user);
        match timed(self.store_timeout, self.users.insert(&user)).await {
            Ok(()) => {}
            Err(StoreError::Conflict) => return Err(AuthError::DuplicateUsername),
            Err(e) => return Err(e.into()),
        }
        info!(user_id = %user.id, "user registered");

        match self.verification.send_link(&user, &token).await? {
            Delivery::Sent => Ok(user),
            Delivery::Failed => Err(AuthError::NotificationFailed { user_id: user.id }),
        }
    }

    /// Checks the password first, then the verification gate, then opens a session.
    #[instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Authenticated, AuthError> {
        let username = normalize_username(username);
        let found = timed(
            self.store_timeout,
            self.users.find_one(UserFilter::Username(&username)),
        )
        .await?;

        let Some((user, hash)) = found.and_then(|u| {
            let hash = u.credentials.password_hash()?.to_string();
            Some((u, hash))
        }) else {
            burn_hash(password);
            warn!(%username, "login for unknown username");
            return Err(AuthError::InvalidCredentials);
        };

        if !verify_password(password, &hash)? {
            warn!(user_id = %user.id, "login with wrong password");
            return Err(AuthError::InvalidCredentials);
        }
        if !user.is_verified {
            info!(user_id = %user.id, "login before email verification");
            return Err(AuthError::NotVerified);
        }

        let session = self.sessions.establish(user.id).await?;
        info!(user_id = %user.id, "user logged in");
        Ok(Authenticated { user, session })
    }
}
