use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub ttl_minutes: i64,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    pub ttl_minutes: i64,
    pub public_base_url: String,
}

#[derive(Clone, Deserialize)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub callback_url: String,
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub verification: VerificationConfig,
    pub google: Option<GoogleConfig>,
    pub notify_webhook_url: Option<String>,
    /// Dev only: log undelivered email bodies, verification links included.
    pub notify_log_links: bool,
    pub store_timeout_ms: u64,
    pub notify_timeout_ms: u64,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let session = SessionConfig {
            ttl_minutes: env_or("SESSION_TTL_MINUTES", 60 * 24),
            cookie_secure: env_or("SESSION_COOKIE_SECURE", false),
        };
        let verification = VerificationConfig {
            ttl_minutes: env_or("VERIFICATION_TTL_MINUTES", 60),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".into()),
        };
        let google = match (
            env_opt("GOOGLE_CLIENT_ID"),
            env_opt("GOOGLE_CLIENT_SECRET"),
            env_opt("GOOGLE_CALLBACK_URL"),
        ) {
            (Some(client_id), Some(client_secret), Some(callback_url)) => Some(GoogleConfig {
                client_id,
                client_secret,
                callback_url,
            }),
            (None, None, None) => None,
            _ => anyhow::bail!(
                "GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_CALLBACK_URL must be set together"
            ),
        };
        Ok(Self {
            database_url: env_opt("DATABASE_URL"),
            session,
            verification,
            google,
            notify_webhook_url: env_opt("NOTIFY_WEBHOOK_URL"),
            notify_log_links: env_or("NOTIFY_LOG_LINKS", false),
            store_timeout_ms: env_or("STORE_TIMEOUT_MS", 5_000),
            notify_timeout_ms: env_or("NOTIFY_TIMEOUT_MS", 10_000),
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}
