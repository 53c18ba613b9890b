use std::{sync::Arc, time::Duration};

use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use url::Url;

use crate::{
    auth::{
        local::normalize_username,
        token::{generate_token, hash_token},
    },
    config::VerificationConfig,
    error::AuthError,
    model::{PendingVerification, User},
    notify::{EmailMessage, Notifier},
    store::{timed, UserFilter, UserStore},
};

/// Raw verification token. Only its digest is persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct VerificationToken(String);

impl VerificationToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for VerificationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VerificationToken(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Failed,
}

#[derive(Clone)]
pub struct VerificationManager {
    users: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    ttl: time::Duration,
    verify_url: Url,
    store_timeout: Duration,
    notify_timeout: Duration,
}

impl VerificationManager {
    pub fn new(
        users: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        config: &VerificationConfig,
        store_timeout: Duration,
        notify_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut verify_url = Url::parse(&config.public_base_url)?;
        verify_url.set_path("/auth/verify");
        Ok(Self {
            users,
            notifier,
            ttl: time::Duration::minutes(config.ttl_minutes),
            verify_url,
            store_timeout,
            notify_timeout,
        })
    }

    pub fn link_for(&self, token: &VerificationToken) -> String {
        let mut url = self.verify_url.clone();
        url.query_pairs_mut().append_pair("token", token.as_str());
        url.into()
    }

    fn pending_for(&self, token: &VerificationToken) -> PendingVerification {
        PendingVerification {
            token_hash: hash_token(token.as_str()),
            expires_at: OffsetDateTime::now_utc() + self.ttl,
        }
    }

    /// Puts a fresh token on a not yet stored account so it is written together with
    /// the account itself.
    pub fn attach(&self, user: &mut User) -> VerificationToken {
        let token = VerificationToken(generate_token());
        user.pending_verification = Some(self.pending_for(&token));
        token
    }

    /// Emails the link for `token` to the account's address.
    pub async fn send_link(
        &self,
        user: &User,
        token: &VerificationToken,
    ) -> Result<Delivery, AuthError> {
        let to = user
            .credentials
            .username()
            .ok_or_else(|| anyhow::anyhow!("account has no email address"))?;
        Ok(self.deliver(to, user.name.as_deref(), token).await)
    }

    /// Replaces the stored token of an unverified account and emails the link.
    /// `None` when the account got verified or removed in the meantime; nothing is
    /// written then. A failed delivery leaves the new token in place.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn issue(&self, user: &User) -> Result<Option<Delivery>, AuthError> {
        if user.credentials.username().is_none() {
            return Err(anyhow::anyhow!("account has no email address").into());
        }
        let token = VerificationToken(generate_token());
        let stored = timed(
            self.store_timeout,
            self.users
                .set_pending_verification(user.id, &self.pending_for(&token)),
        )
        .await?;
        if !stored {
            info!("account no longer awaits verification");
            return Ok(None);
        }
        Ok(Some(self.send_link(user, &token).await?))
    }

    async fn deliver(&self, to: &str, name: Option<&str>, token: &VerificationToken) -> Delivery {
        let message = EmailMessage {
            to: to.to_string(),
            subject: "Confirm your Listify account".into(),
            body: format!(
                "Hi {},\n\nOpen this link within {} minutes to confirm your email address:\n{}\n",
                name.unwrap_or("there"),
                self.ttl.whole_minutes(),
                self.link_for(token)
            ),
        };
        match tokio::time::timeout(self.notify_timeout, self.notifier.send(&message)).await {
            Ok(Ok(())) => {
                info!(to, "verification email sent");
                Delivery::Sent
            }
            Ok(Err(e)) => {
                error!(error = %e, to, "verification email failed");
                Delivery::Failed
            }
            Err(_) => {
                error!(to, "verification email timed out");
                Delivery::Failed
            }
        }
    }

    /// One-shot: the matching record is marked verified and loses its token.
    #[instrument(skip_all)]
    pub async fn redeem(&self, token: &str) -> Result<User, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidOrExpiredToken);
        }
        let consumed = timed(
            self.store_timeout,
            self.users
                .consume_verification(&hash_token(token), OffsetDateTime::now_utc()),
        )
        .await?;
        match consumed {
            Some(user) => {
                info!(user_id = %user.id, "email verified");
                Ok(user)
            }
            None => {
                warn!("verification token rejected");
                Err(AuthError::InvalidOrExpiredToken)
            }
        }
    }

    /// Reissues a token for an unverified local account. Unknown or already verified
    /// usernames are a silent no-op.
    #[instrument(skip(self))]
    pub async fn resend(&self, username: &str) -> Result<(), AuthError> {
        let username = normalize_username(username);
        let found = timed(
            self.store_timeout,
            self.users.find_one(UserFilter::Username(&username)),
        )
        .await?;
        let Some(user) = found.filter(|u| !u.is_verified) else {
            return Ok(());
        };
        match self.issue(&user).await? {
            Some(Delivery::Failed) => Err(AuthError::NotificationFailed { user_id: user.id }),
            Some(Delivery::Sent) | None => Ok(()),
        }
    }
}
