use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, instrument};

use super::Notifier;
use crate::alerts::{AlertEvent, AlertMetric, Severity};
use crate::config::Discord;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

const RED: u32 = 15158332;
const ORANGE: u32 = 15105570;
const BLUE: u32 = 3447003;

/// Posts alerts to a Discord webhook as embeds
#[derive(Debug, Clone)]
pub struct DiscordNotifier {
    client: Client,
    discord: Discord,
}

impl DiscordNotifier {
    pub fn new(discord: Discord) -> Self {
        Self {
            client: Client::new(),
            discord,
        }
    }

    pub fn build_alert_embed(&self, event: &AlertEvent) -> Embed {
        let (emoji, color) = match event.severity {
            Severity::Critical => ("🔴", RED),
            Severity::Warning => ("⚠️", ORANGE),
            Severity::Info => ("ℹ️", BLUE),
        };

        let mut fields = vec![
            EmbedField {
                name: "🗄️ Database".to_string(),
                value: event.target.clone(),
                inline: true,
            },
            EmbedField {
                name: "📈 Metric".to_string(),
                value: event.metric.to_string(),
                inline: true,
            },
        ];

        if !matches!(
            event.metric,
            AlertMetric::Availability | AlertMetric::Backup | AlertMetric::BackupSummary
        ) {
            fields.push(EmbedField {
                name: "📊 Status".to_string(),
                value: create_progress_bar(event.value, event.threshold),
                inline: false,
            });
        }

        Embed {
            title: Some(format!("{emoji} {}", event.subject())),
            description: Some(event.message.clone()),
            color: Some(color),
            fields,
            footer: Some(EmbedFooter {
                text: format!("Severity: {}", event.severity),
            }),
            timestamp: Some(event.timestamp.to_rfc3339()),
        }
    }

    pub fn build_message(&self, event: &AlertEvent) -> Message {
        let mut builder = MessageBuilder::new().add_embed(self.build_alert_embed(event));
        if let Some(user_id) = &self.discord.user_id {
            builder = builder.content(format!(
                "🗄️ ({} ~ {}) <@{user_id}>",
                event.target, event.metric
            ));
        }
        builder.build()
    }
}

fn create_progress_bar(current: f64, limit: f64) -> String {
    if limit <= 0.0 {
        return format!("`{current:.1}`");
    }

    let ratio = current / limit;
    let filled = ((ratio * 10.0) as usize).min(10);
    let bar = "█".repeat(filled) + &"░".repeat(10 - filled);
    let status_emoji = if ratio >= 1.0 {
        "🔴"
    } else if ratio >= 0.8 {
        "🟠"
    } else {
        "🟢"
    };

    format!(
        "{status_emoji} `{bar}` {current:.1} / {limit} ({:.0}% of limit)",
        ratio * 100.0
    )
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn name(&self) -> &'static str {
        "discord"
    }

    #[instrument(skip_all)]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let message = self.build_message(event);
        let response = self
            .client
            .post(&self.discord.url)
            .json(&message)
            .send()
            .await
            .map_err(|e| Error::Notification(format!("discord request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            if let Ok(error_text) = response.text().await {
                error!("Discord API error response: {error_text}");
            }
            return Err(Error::Notification(format!("discord returned {status}")));
        }

        Ok(())
    }
}
