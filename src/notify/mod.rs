//! Delivery of alert events to people

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{error, info, instrument};

use crate::alerts::AlertEvent;
use crate::config::MonitoringConfig;
use crate::error::Result;

pub mod discord;
pub mod email;
pub mod webhook;

pub use discord::DiscordNotifier;
pub use email::EmailNotifier;
pub use webhook::WebhookNotifier;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn send(&self, event: &AlertEvent) -> Result<()>;
}

/// Every configured sink; an event goes to all of them
#[derive(Clone, Default)]
pub struct NotifierSet {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(monitoring: &MonitoringConfig) -> Result<Self> {
        let mut set = Self::new();

        if let Some(email) = &monitoring.email_alerts {
            if email.enabled && !email.alert_recipients.is_empty() {
                set.push(Arc::new(EmailNotifier::new(email)?));
            }
        }
        if let Some(webhook) = &monitoring.webhook {
            set.push(Arc::new(WebhookNotifier::new(webhook.clone())));
        }
        if let Some(discord) = &monitoring.discord {
            set.push(Arc::new(DiscordNotifier::new(discord.clone())));
        }

        Ok(set)
    }

    pub fn push(&mut self, notifier: Arc<dyn Notifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Send to every sink concurrently; returns how many accepted the event
    ///
    /// A failing sink is logged and does not affect the others.
    #[instrument(skip_all, fields(db = %event.target, metric = %event.metric))]
    pub async fn dispatch(&self, event: &AlertEvent) -> usize {
        let results = join_all(self.notifiers.iter().map(|n| async move {
            (n.name(), n.send(event).await)
        }))
        .await;

        let mut delivered = 0;
        for (name, result) in results {
            match result {
                Ok(()) => {
                    info!("{name} notification sent");
                    delivered += 1;
                }
                Err(e) => error!("{name} notification failed: {e}"),
            }
        }
        delivered
    }
}
