use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::instrument;

use super::Notifier;
use crate::alerts::AlertEvent;
use crate::config::Webhook;
use crate::error::{Error, Result};

/// Posts each alert as a JSON document to a URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    webhook: Webhook,
}

impl WebhookNotifier {
    pub fn new(webhook: Webhook) -> Self {
        Self {
            client: Client::new(),
            webhook,
        }
    }
}

pub fn payload(event: &AlertEvent) -> serde_json::Value {
    json!({
        "message": event.message,
        "database": event.target,
        "metric": event.metric.as_str(),
        "severity": event.severity.as_str(),
        "value": event.value,
        "threshold": event.threshold,
        "timestamp": event.timestamp.to_rfc3339(),
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    #[instrument(skip_all)]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook.url)
            .json(&payload(event))
            .send()
            .await
            .map_err(|e| Error::Notification(format!("webhook request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Notification(format!(
                "webhook returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
