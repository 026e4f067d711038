//! Alert delivery to HTTP sinks, alone and from the scheduler

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use db_automation::Error;
use db_automation::actors::{Scheduler, SchedulerSettings};
use db_automation::alerts::{AlertEvent, AlertMetric, Severity};
use db_automation::backup::BackupOptions;
use db_automation::config::{Discord, Webhook};
use db_automation::engine::EngineKind;
use db_automation::history::HealthHistory;
use db_automation::metrics::MetricsRegistry;
use db_automation::notify::{DiscordNotifier, Notifier, NotifierSet, WebhookNotifier};
use db_automation::target::TargetRegistry;
use pretty_assertions::assert_eq;
use prometheus::Registry;
use serde_json::Value;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::ScriptedDb;

fn connection_alert() -> AlertEvent {
    AlertEvent {
        target: "orders".to_string(),
        severity: Severity::Critical,
        metric: AlertMetric::ConnectionCount,
        value: 95.0,
        threshold: 80.0,
        timestamp: Utc::now(),
        message: "orders: connection_count is 95.00, above the limit of 80".to_string(),
    }
}

#[tokio::test]
async fn webhook_posts_alert_document() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/db"))
        .and(body_partial_json(serde_json::json!({
            "database": "orders",
            "metric": "connection_count",
            "severity": "critical",
            "value": 95.0,
            "threshold": 80.0,
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(Webhook {
        url: format!("{}/hooks/db", server.uri()),
    });
    notifier.send(&connection_alert()).await.unwrap();
}

#[tokio::test]
async fn webhook_error_status_is_a_notification_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let notifier = WebhookNotifier::new(Webhook { url: server.uri() });
    let result = notifier.send(&connection_alert()).await;

    assert_matches!(result, Err(Error::Notification(msg)) if msg.contains("500"));
}

#[tokio::test]
async fn discord_receives_embed_with_mention() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/webhooks/1/abc"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = DiscordNotifier::new(Discord {
        url: format!("{}/api/webhooks/1/abc", server.uri()),
        user_id: Some("42".to_string()),
    });
    notifier.send(&connection_alert()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();

    assert!(body["content"].as_str().unwrap().ends_with("<@42>"));
    let embed = &body["embeds"][0];
    assert_eq!(embed["color"], 15158332);
    assert_eq!(embed["fields"][0]["value"], "orders");
    assert_eq!(embed["fields"].as_array().unwrap().len(), 3);
    assert_eq!(embed["description"], connection_alert().message);
}

#[tokio::test]
async fn set_counts_only_accepting_sinks() {
    let ok = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ok)
        .await;
    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&broken)
        .await;

    let mut set = NotifierSet::new();
    set.push(Arc::new(WebhookNotifier::new(Webhook { url: ok.uri() })));
    set.push(Arc::new(WebhookNotifier::new(Webhook { url: broken.uri() })));
    set.push(Arc::new(DiscordNotifier::new(Discord {
        url: ok.uri(),
        user_id: None,
    })));

    assert_eq!(set.dispatch(&connection_alert()).await, 2);
}

#[tokio::test]
async fn unreachable_target_alert_reaches_webhook_before_shutdown_returns() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "database": "legacy",
            "metric": "availability",
            "severity": "critical",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let db = ScriptedDb::new(EngineKind::Postgres).refusing();
    let mut registry = TargetRegistry::new();
    registry.insert(db.target("legacy", 1));

    let mut notifiers = NotifierSet::new();
    notifiers.push(Arc::new(WebhookNotifier::new(Webhook { url: server.uri() })));

    let settings = SchedulerSettings {
        check_interval: Duration::from_secs(3600),
        tick_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(5),
        backup_schedule: None,
        optimize_schedule: None,
        backup: BackupOptions {
            directory: std::env::temp_dir(),
            compression: true,
            retention: chrono::Duration::days(7),
            timeout: Duration::from_secs(60),
        },
    };

    let history = HealthHistory::default();
    let handle = Scheduler::new(
        registry,
        settings,
        MetricsRegistry::new(Registry::new()).unwrap(),
        history.clone(),
    )
    .with_notifiers(notifiers)
    .spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while history.latest("legacy").await.is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    handle.shutdown().await.unwrap();
    server.verify().await;
}
