//! Exposition server over a real socket

use db_automation::api::{ApiConfig, ApiState, spawn_api_server};
use db_automation::engine::EngineKind;
use db_automation::health::HealthChecker;
use db_automation::history::HealthHistory;
use db_automation::metrics::{CONTENT_TYPE, MetricsRegistry};
use db_automation::target::TargetRegistry;
use pretty_assertions::assert_eq;
use prometheus::Registry;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::helpers::ScriptedDb;

struct Server {
    base: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// One checked target (`orders`) and one never checked (`archive`)
async fn start() -> Server {
    let db = ScriptedDb::new(EngineKind::Postgres)
        .with_metric("connection_count", 4.0)
        .with_metric("cache_hit_ratio", 99.5);

    let mut targets = TargetRegistry::new();
    let orders = targets.insert(db.target("orders", 2));
    targets.insert(ScriptedDb::new(EngineKind::SqlServer).target("archive", 1));

    let metrics = MetricsRegistry::new(Registry::new()).unwrap();
    let history = HealthHistory::default();

    let result = HealthChecker::default().check(&orders).await;
    metrics.record_health(&result);
    history.record(result).await;

    let config = ApiConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        metrics_path: "/metrics".to_string(),
    };
    let (stop, stopped) = oneshot::channel::<()>();
    let addr = spawn_api_server(config, ApiState::new(metrics, history, targets), async move {
        let _ = stopped.await;
    })
    .await
    .unwrap();

    Server {
        base: format!("http://{addr}"),
        stop: Some(stop),
    }
}

#[tokio::test]
async fn metrics_are_served_in_text_format() {
    let server = start().await;

    let response = reqwest::get(format!("{}/metrics", server.base)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[reqwest::header::CONTENT_TYPE],
        CONTENT_TYPE
    );

    let body = response.text().await.unwrap();
    assert!(body.contains("# TYPE db_health_status gauge"));
    assert!(body.contains(r#"db_health_status{database="orders"} 1"#));
    assert!(body.contains(r#"db_health_metric{database="orders",metric="connection_count"} 4"#));
    assert!(body.contains(r#"db_connections_total{database="orders",status="success"} 1"#));
    assert!(!body.contains(r#"database="archive""#));
}

#[tokio::test]
async fn liveness_answers_ok() {
    let server = start().await;

    let body: Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    assert!(body["uptime_seconds"].as_i64().unwrap() >= 0);
}

#[tokio::test]
async fn targets_list_includes_latest_result() {
    let server = start().await;

    let body: Value = reqwest::get(format!("{}/api/v1/targets", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["count"], 2);
    let targets = body["targets"].as_array().unwrap();

    let archive = &targets[0];
    assert_eq!(archive["name"], "archive");
    assert!(archive["latest"].is_null());

    let orders = &targets[1];
    assert_eq!(orders["name"], "orders");
    assert_eq!(orders["latest"]["status"], "healthy");
    assert_eq!(orders["latest"]["connection_count"], 4);
    assert_eq!(orders["pool"]["max_size"], 2);
    assert_eq!(orders["pool"]["in_use"], 0);
}

#[tokio::test]
async fn target_detail_and_missing_target() {
    let server = start().await;

    let detail: Value = reqwest::get(format!("{}/api/v1/targets/orders", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["name"], "orders");
    assert_eq!(detail["history"].as_array().unwrap().len(), 1);

    let response = reqwest::get(format!("{}/api/v1/targets/missing", server.base))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("missing"));
}
