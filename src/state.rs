use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use crate::{
    auth::{
        FederatedAuthenticator, GoogleProvider, IdentityProvider, LocalAuthenticator,
        SessionManager, VerificationManager,
    },
    config::AppConfig,
    lists::ListService,
    notify::{LogNotifier, Notifier, WebhookNotifier},
    store::{
        MemorySessionStore, MemoryUserStore, PgSessionStore, PgUserStore, SessionStore, UserStore,
    },
};

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub local: LocalAuthenticator,
    pub verification: VerificationManager,
    pub federated: FederatedAuthenticator,
    pub provider: Option<Arc<dyn IdentityProvider>>,
    pub lists: ListService,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let (users, sessions): (Arc<dyn UserStore>, Arc<dyn SessionStore>) =
            match &config.database_url {
                Some(url) => {
                    let db = PgPoolOptions::new()
                        .max_connections(10)
                        .acquire_timeout(config.store_timeout())
                        .connect(url)
                        .await
                        .context("connect to database")?;
                    sqlx::migrate!("./migrations")
                        .run(&db)
                        .await
                        .context("run migrations")?;
                    (
                        Arc::new(PgUserStore::new(db.clone())) as Arc<dyn UserStore>,
                        Arc::new(PgSessionStore::new(db)) as Arc<dyn SessionStore>,
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; accounts and lists live in memory only");
                    (
                        Arc::new(MemoryUserStore::new()) as Arc<dyn UserStore>,
                        Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>,
                    )
                }
            };

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => {
                info!("NOTIFY_WEBHOOK_URL not set; verification emails are only logged");
                Arc::new(LogNotifier::new(config.notify_log_links))
            }
        };

        let provider = match &config.google {
            Some(google) => Some(Arc::new(GoogleProvider::new(
                google.clone(),
                config.notify_timeout(),
            )?) as Arc<dyn IdentityProvider>),
            None => {
                info!("google sign-in disabled");
                None
            }
        };

        Self::from_parts(config, users, sessions, notifier, provider)
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        notifier: Arc<dyn Notifier>,
        provider: Option<Arc<dyn IdentityProvider>>,
    ) -> anyhow::Result<Self> {
        let store_timeout = config.store_timeout();
        let sessions =
            SessionManager::new(sessions, users.clone(), &config.session, store_timeout);
        let verification = VerificationManager::new(
            users.clone(),
            notifier,
            &config.verification,
            store_timeout,
            config.notify_timeout(),
        )?;
        let local = LocalAuthenticator::new(
            users.clone(),
            verification.clone(),
            sessions.clone(),
            store_timeout,
        );
        Ok(Self {
            federated: FederatedAuthenticator::new(users.clone(), store_timeout),
            lists: ListService::new(users, store_timeout),
            local,
            verification,
            sessions,
            provider,
        })
    }

    #[cfg(test)]
    pub fn fake(notifier: Arc<dyn Notifier>, provider: Option<Arc<dyn IdentityProvider>>) -> Self {
        Self::fake_over(Arc::new(MemoryUserStore::new()), notifier, provider, 1_000)
    }

    #[cfg(test)]
    pub fn fake_over(
        users: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        provider: Option<Arc<dyn IdentityProvider>>,
        store_timeout_ms: u64,
    ) -> Self {
        use crate::config::{SessionConfig, VerificationConfig};

        let config = Arc::new(AppConfig {
            database_url: None,
            session: SessionConfig {
                ttl_minutes: 60,
                cookie_secure: false,
            },
            verification: VerificationConfig {
                ttl_minutes: 60,
                public_base_url: "http://localhost:3000".into(),
            },
            google: None,
            notify_webhook_url: None,
            notify_log_links: false,
            store_timeout_ms,
            notify_timeout_ms: 1_000,
        });
        Self::from_parts(
            config,
            users,
            Arc::new(MemorySessionStore::new()),
            notifier,
            provider,
        )
        .expect("fake state")
    }
}
