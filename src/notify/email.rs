use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, instrument};

use super::Notifier;
use crate::alerts::AlertEvent;
use crate::config::EmailConfig;
use crate::error::{Error, Result};

/// `[DB-AUTOMATION-CRITICAL] Backup failed for orders`
pub fn subject_line(event: &AlertEvent) -> String {
    format!(
        "[DB-AUTOMATION-{}] {}",
        event.severity.as_str().to_uppercase(),
        event.subject()
    )
}

fn body(event: &AlertEvent) -> String {
    format!(
        "{}\n\nDatabase:  {}\nMetric:    {}\nSeverity:  {}\nValue:     {}\nThreshold: {}\nTime:      {}\n",
        event.message,
        event.target,
        event.metric,
        event.severity,
        event.value,
        event.threshold,
        event.timestamp.to_rfc3339(),
    )
}

/// Sends alerts as plain-text mail over SMTP with STARTTLS
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from: Mailbox = config.from_email.parse().map_err(|e| {
            Error::ConfigInvalid(format!("invalid from_email '{}': {e}", config.from_email))
        })?;

        let recipients = config
            .alert_recipients
            .iter()
            .map(|r| {
                r.parse::<Mailbox>()
                    .map_err(|e| Error::ConfigInvalid(format!("invalid alert recipient '{r}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_server)
            .map_err(|e| {
                Error::ConfigInvalid(format!("invalid smtp_server '{}': {e}", config.smtp_server))
            })?
            .port(config.smtp_port);

        if let Some(password) = &config.password {
            builder = builder.credentials(Credentials::new(
                config.from_email.clone(),
                password.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            recipients,
        })
    }

    pub fn build_message(&self, event: &AlertEvent) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject_line(event))
            .header(ContentType::TEXT_PLAIN);

        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        builder
            .body(body(event))
            .map_err(|e| Error::Notification(format!("could not build alert email: {e}")))
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    #[instrument(skip_all)]
    async fn send(&self, event: &AlertEvent) -> Result<()> {
        let message = self.build_message(event)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| Error::Notification(format!("smtp delivery failed: {e}")))?;

        debug!(recipients = self.recipients.len(), "alert email sent");
        Ok(())
    }
}
