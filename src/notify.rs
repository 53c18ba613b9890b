use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound email delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Dev notifier: records that a message would have gone out. The body carries a live
/// verification link, so it is only logged (at debug) when `log_links` is set.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    log_links: bool,
}

impl LogNotifier {
    pub fn new(log_links: bool) -> Self {
        Self { log_links }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, "no mail relay configured, email not sent");
        if self.log_links {
            debug!(to = %message.to, body = %message.body, "undelivered email body");
        }
        Ok(())
    }
}

/// Posts each message as JSON to a mail relay.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .context("mail relay request")?
            .error_for_status()
            .context("mail relay rejected message")?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use parking_lot::Mutex;

    use super::*;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    async fn logged(notifier: LogNotifier) -> String {
        let out = Captured::default();
        let writer = out.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let message = EmailMessage {
            to: "a@example.com".into(),
            subject: "Confirm".into(),
            body: "http://localhost:3000/auth/verify?token=s3cr3t-token".into(),
        };
        notifier.send(&message).await.unwrap();
        let bytes = out.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn log_notifier_keeps_links_out_of_logs_by_default() {
        let logs = logged(LogNotifier::default()).await;
        assert!(logs.contains("a@example.com"));
        assert!(!logs.contains("s3cr3t-token"));
    }

    #[tokio::test]
    async fn log_notifier_dumps_links_only_when_asked() {
        let logs = logged(LogNotifier::new(true)).await;
        assert!(logs.contains("s3cr3t-token"));
    }
}
