//! Operator alerts.
//!
//! Alerts are fire-and-forget: delivery failures are logged and never
//! propagate into the job or connection that raised the alert.

use async_trait::async_trait;
use core::time::Duration;
use serde::Serialize;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Writes alerts to the log at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        tracing::error!(subject, body, "Operator alert");
    }
}

#[derive(Serialize)]
struct Alert<'a> {
    subject: &'a str,
    body: &'a str,
}

/// POSTs alerts as JSON to a webhook, falling back to the log if the
/// webhook cannot be reached.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, subject: &str, body: &str) {
        let res = self
            .client
            .post(&self.url)
            .json(&Alert { subject, body })
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        if let Err(e) = res {
            tracing::warn!(url = %self.url, error = %e, "Failed to deliver alert");
            LogNotifier.notify(subject, body).await;
        }
    }
}
