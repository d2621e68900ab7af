//! Token relay tests against a mock worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleet_common::StreamEvent;
use fleet_orchestrator::config::RelayConfig;
use fleet_orchestrator::registry::{ProcessRecord, ProcessRegistry, SqliteRegistry};
use fleet_orchestrator::relay::{Relay, WorkerClient};
use fleet_orchestrator::test_util::{test_config, write_models, TestOrchestrator};

struct Fixture {
    _models: TempDir,
    server: MockServer,
    relay: Arc<Relay>,
    t: TestOrchestrator,
}

/// A relay whose orchestrator adopts the mock server as the worker of
/// `llama.bin`.
async fn setup() -> Fixture {
    let models = tempfile::tempdir().unwrap();
    write_models(models.path(), &["llama.bin"]);
    let server = MockServer::start().await;
    let port = server.address().port();

    let registry = Arc::new(SqliteRegistry::in_memory().unwrap());
    registry
        .upsert(&ProcessRecord {
            model_key: "llama.bin".to_string(),
            port,
            last_active_at: Utc::now(),
            owner_id: "other".to_string(),
            pid: None,
        })
        .unwrap();

    let t = TestOrchestrator::new("me", test_config(models.path()), registry);
    t.prober.set_alive(port, true);

    let client = WorkerClient::new("127.0.0.1", Duration::from_secs(2));
    let relay = Arc::new(Relay::new(t.orchestrator.clone(), client, RelayConfig::default()));
    Fixture {
        _models: models,
        server,
        relay,
        t,
    }
}

async fn mount_token(server: &MockServer, priority: u8, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .up_to_n_times(1)
        .with_priority(priority)
        .mount(server)
        .await;
}

async fn stop_pulls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.query().map_or(false, |q| q.contains("stop=true")))
        .count()
}

async fn normal_pulls(server: &MockServer) -> usize {
    let all = server.received_requests().await.unwrap_or_default().len();
    all - stop_pulls(server).await
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// A relay over an orchestrator that spawns `llama.bin` on `port` through
/// the fake launcher, so nothing listens there unless the test starts it.
fn spawning_relay(models: &TempDir, port: u16, startup_grace_secs: u64) -> (Arc<Relay>, TestOrchestrator) {
    let mut config = test_config(models.path());
    config.base_port = port;
    config.max_port = port;
    let t = TestOrchestrator::new("me", config, Arc::new(SqliteRegistry::in_memory().unwrap()));

    let relay_config = RelayConfig {
        startup_grace_secs,
        retry_interval_ms: 50,
        ..RelayConfig::default()
    };
    let client = WorkerClient::new("127.0.0.1", Duration::from_secs(2));
    let relay = Arc::new(Relay::new(t.orchestrator.clone(), client, relay_config));
    (relay, t)
}

async fn collect(stream: impl futures_util::Stream<Item = StreamEvent>) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream did not finish")
}

#[tokio::test]
async fn test_stream_accumulates_until_done() {
    let fx = setup().await;
    mount_token(&fx.server, 1, json!({"content": "Hello", "stop": false})).await;
    mount_token(&fx.server, 2, json!({"content": "", "stop": false})).await;
    mount_token(&fx.server, 3, json!({"content": " world", "stop": false})).await;
    mount_token(&fx.server, 4, json!({"content": "!", "stop": true})).await;

    let events = collect(fx.relay.open_stream("llama.bin")).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::progress(vec!["Hello".into()], false),
            StreamEvent::progress(vec!["Hello".into()], false),
            StreamEvent::progress(vec!["Hello".into(), " world".into()], false),
            StreamEvent::progress(vec!["Hello".into(), " world".into(), "!".into()], true),
        ]
    );
    assert_eq!(events.last().unwrap().text(), "Hello world!");
    assert_eq!(stop_pulls(&fx.server).await, 0);
    // Streaming never spawns; the worker was adopted
    assert_eq!(fx.t.launcher.spawn_count(), 0);
}

#[tokio::test]
async fn test_stream_reports_upstream_failure() {
    let fx = setup().await;
    mount_token(&fx.server, 1, json!({"content": "Hi", "stop": false})).await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(10)
        .mount(&fx.server)
        .await;

    let events = collect(fx.relay.open_stream("llama.bin")).await;
    assert_eq!(events.len(), 2);
    let last = &events[1];
    assert!(last.done);
    assert_eq!(last.tokens, vec!["Hi"]);
    assert!(last.error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn test_stream_for_unknown_model_fails() {
    let fx = setup().await;

    let events = collect(fx.relay.open_stream("missing.bin")).await;
    assert_eq!(events.len(), 1);
    assert!(events[0].done);
    assert!(events[0].tokens.is_empty());
    assert!(events[0].error.as_deref().unwrap().contains("missing.bin"));
}

#[tokio::test]
async fn test_close_stream_stops_worker() {
    let fx = setup().await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .and(query_param("stop", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stop": true})))
        .with_priority(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "x", "stop": false})))
        .with_priority(10)
        .mount(&fx.server)
        .await;

    let mut stream = fx.relay.open_stream("llama.bin");
    let first = stream.next().await.unwrap();
    assert_eq!(first.tokens, vec!["x"]);
    assert!(!first.done);

    assert_eq!(fx.relay.close_stream("llama.bin"), 1);

    // The next poll stops the worker and ends the stream without a done event
    let rest = collect(stream).await;
    assert!(rest.is_empty());
    assert_eq!(stop_pulls(&fx.server).await, 1);
    assert_eq!(normal_pulls(&fx.server).await, 1);
    assert_eq!(fx.relay.open_sessions("llama.bin"), 0);
    assert_eq!(fx.relay.close_stream("llama.bin"), 0);
}

#[tokio::test]
async fn test_dropped_consumer_stops_worker() {
    let fx = setup().await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .and(query_param("stop", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stop": true})))
        .with_priority(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "x", "stop": false})))
        .with_priority(10)
        .mount(&fx.server)
        .await;

    let mut stream = fx.relay.open_stream("llama.bin");
    let first = stream.next().await.unwrap();
    assert_eq!(first.tokens, vec!["x"]);
    drop(stream);

    let mut stops = 0;
    for _ in 0..100 {
        stops = stop_pulls(&fx.server).await;
        if stops > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stops, 1);

    // Only the fragment the consumer read was ever pulled
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(normal_pulls(&fx.server).await, 1);
    assert_eq!(fx.relay.open_sessions("llama.bin"), 0);
}

#[tokio::test]
async fn test_stream_is_lazy() {
    let fx = setup().await;
    mount_token(&fx.server, 1, json!({"content": "x", "stop": false})).await;

    let stream = fx.relay.open_stream("llama.bin");
    assert_eq!(fx.relay.open_sessions("llama.bin"), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(normal_pulls(&fx.server).await, 0);

    // Nothing was resolved, so there is no worker to stop
    drop(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stop_pulls(&fx.server).await, 0);
    assert_eq!(fx.relay.open_sessions("llama.bin"), 0);
}

#[tokio::test]
async fn test_close_stream_signals_every_session() {
    let fx = setup().await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .and(query_param("stop", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"stop": true})))
        .with_priority(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/next-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": "x", "stop": false})))
        .with_priority(10)
        .mount(&fx.server)
        .await;

    let mut a = fx.relay.open_stream("llama.bin");
    let mut b = fx.relay.open_stream("llama.bin");
    a.next().await.unwrap();
    b.next().await.unwrap();
    assert_eq!(fx.relay.open_sessions("llama.bin"), 2);

    assert_eq!(fx.relay.close_stream("llama.bin"), 2);
    collect(a).await;
    collect(b).await;
    assert_eq!(stop_pulls(&fx.server).await, 2);
}

#[tokio::test]
async fn test_stream_waits_for_starting_worker() {
    let models = tempfile::tempdir().unwrap();
    write_models(models.path(), &["llama.bin"]);
    let port = free_port();
    let (relay, t) = spawning_relay(&models, port, 10);

    // The worker starts listening only after the first pulls were refused
    let worker = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let app = axum::Router::new().route(
            "/next-token",
            axum::routing::get(|| async { axum::Json(json!({"content": "Hi", "stop": true})) }),
        );
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        axum::serve(listener, app).await.unwrap();
    });

    let events = collect(relay.open_stream("llama.bin")).await;
    assert_eq!(events, vec![StreamEvent::progress(vec!["Hi".into()], true)]);
    assert_eq!(t.launcher.spawn_count(), 1);
    worker.abort();
}

#[tokio::test]
async fn test_stream_gives_up_on_worker_that_never_listens() {
    let models = tempfile::tempdir().unwrap();
    write_models(models.path(), &["llama.bin"]);
    let port = free_port();
    let (relay, t) = spawning_relay(&models, port, 1);

    let started = std::time::Instant::now();
    let events = collect(relay.open_stream("llama.bin")).await;
    assert!(started.elapsed() >= Duration::from_secs(1));

    assert_eq!(events.len(), 1);
    assert!(events[0].done);
    assert!(events[0].tokens.is_empty());
    assert!(events[0].error.as_deref().unwrap().contains("not ready"));
    assert_eq!(t.launcher.spawn_count(), 1);
}

#[tokio::test]
async fn test_refused_healthy_worker_fails_at_once() {
    let models = tempfile::tempdir().unwrap();
    write_models(models.path(), &["llama.bin"]);
    let port = free_port();
    let (relay, t) = spawning_relay(&models, port, 10);
    // Reported healthy, so a refused pull is not a slow start
    t.prober.set_alive(port, true);
    t.orchestrator.resolve("llama.bin").await.unwrap();

    let started = std::time::Instant::now();
    let events = collect(relay.open_stream("llama.bin")).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(events.len(), 1);
    assert!(events[0].done);
    assert!(events[0].error.as_deref().unwrap().contains("not ready"));
    assert_eq!(t.launcher.spawn_count(), 1);
}
