use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::form_urlencoded;

use crate::{
    auth::session::Principal,
    config::GoogleConfig,
    error::{AuthError, StoreError},
    model::User,
    store::{timed, UserFilter, UserStore},
};

const FIND_OR_CREATE_ATTEMPTS: usize = 3;

/// What the provider tells us about the person signing in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub id: String,
    pub given_name: Option<String>,
    pub display_name: Option<String>,
}

impl ProviderProfile {
    /// Given name when the provider has one, else the first word of the display name.
    pub fn first_name(&self) -> Option<String> {
        self.given_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| self.display_name.as_deref()?.split_whitespace().next())
            .map(String::from)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn authorize_url(&self, state: &str) -> String;
    async fn exchange(&self, code: &str) -> anyhow::Result<ProviderProfile>;
}

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

pub struct GoogleProvider {
    client: reqwest::Client,
    config: GoogleConfig,
}

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GoogleUserInfo {
    sub: String,
    name: Option<String>,
    given_name: Option<String>,
}

impl GoogleProvider {
    pub fn new(config: GoogleConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build oauth http client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorize_url(&self, state: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.callback_url)
            .append_pair("response_type", "code")
            .append_pair("scope", "profile")
            .append_pair("state", state)
            .finish();
        format!("{GOOGLE_AUTHORIZE_URL}?{query}")
    }

    async fn exchange(&self, code: &str) -> anyhow::Result<ProviderProfile> {
        let token: GoogleTokenResponse = self
            .client
            .post(GOOGLE_TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.callback_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("google token request")?
            .error_for_status()
            .context("google token exchange rejected")?
            .json()
            .await
            .context("google token response")?;

        let info: GoogleUserInfo = self
            .client
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .context("google userinfo request")?
            .error_for_status()
            .context("google userinfo rejected")?
            .json()
            .await
            .context("google userinfo response")?;

        Ok(ProviderProfile {
            id: info.sub,
            given_name: info.given_name,
            display_name: info.name,
        })
    }
}

#[derive(Clone)]
pub struct FederatedAuthenticator {
    users: Arc<dyn UserStore>,
    store_timeout: Duration,
}

impl FederatedAuthenticator {
    pub fn new(users: Arc<dyn UserStore>, store_timeout: Duration) -> Self {
        Self {
            users,
            store_timeout,
        }
    }

    async fn find(&self, provider_id: &str) -> Result<Option<User>, AuthError> {
        Ok(timed(
            self.store_timeout,
            self.users.find_one(UserFilter::FederatedId(provider_id)),
        )
        .await?)
    }

    /// Returns the account for `provider_id`, creating it on first sight. Losing an
    /// insert race to a concurrent call falls back to the winner's record.
    #[instrument(skip(self, name_hint))]
    pub async fn resolve_or_create(
        &self,
        provider_id: &str,
        name_hint: Option<&str>,
    ) -> Result<User, AuthError> {
        for _ in 0..FIND_OR_CREATE_ATTEMPTS {
            if let Some(user) = self.find(provider_id).await? {
                return Ok(user);
            }
            let name = name_hint
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from);
            let user = User::new_federated(provider_id.to_string(), name);
            match timed(self.store_timeout, self.users.insert(&user)).await {
                Ok(()) => {
                    info!(user_id = %user.id, "federated account created");
                    return Ok(user);
                }
                Err(StoreError::Conflict) => {
                    warn!("federated account created concurrently, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(anyhow::anyhow!("federated find-or-create did not settle").into())
    }

    /// Attaches `provider_id` to the signed-in local account.
    #[instrument(skip(self, principal), fields(user_id = %principal.id()))]
    pub async fn link(&self, principal: &Principal, provider_id: &str) -> Result<User, AuthError> {
        if let Some(owner) = self.find(provider_id).await? {
            return if owner.id == principal.id() {
                Ok(owner)
            } else {
                Err(AuthError::AlreadyLinked)
            };
        }

        let linked = timed(
            self.store_timeout,
            self.users.link_federated(principal.id(), provider_id),
        )
        .await;
        match linked {
            Ok(Some(user)) => {
                info!("federated identity linked");
                Ok(user)
            }
            // The account already carries a provider id of its own.
            Ok(None) | Err(StoreError::Conflict) => Err(AuthError::AlreadyLinked),
            Err(e) => Err(e.into()),
        }
    }
}
