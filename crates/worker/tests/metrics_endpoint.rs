use std::time::Duration;

use reqwest::StatusCode;

use todo_projector_events::InMemoryBroker;
use todo_projector_infra::read_model::InMemoryProjectionStore;
use todo_projector_infra::workers::{ProjectionWorker, StatsReader, WorkerConfig};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(reader: StatsReader) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = todo_projector_worker::metrics::router(reader);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Stats after one batch: two applied, one unknown type, one undecodable.
fn processed_stats() -> StatsReader {
    let broker = InMemoryBroker::new(Duration::from_secs(30));
    broker.publish(
        r#"{"type":"TodoCreatedEvent","id":"a","userId":"u1","timestamp":"2024-01-01T00:00:00Z","title":"t","description":"d","tags":[]}"#,
    );
    broker.publish(r#"{"type":"TodoDeletedEvent","id":"b"}"#);
    broker.publish(r#"{"type":"Foo","id":"z"}"#);
    broker.publish("garbage");

    let mut worker = ProjectionWorker::new(
        broker,
        InMemoryProjectionStore::new(),
        WorkerConfig::default().with_fetch_wait(Duration::ZERO),
    );
    worker.run_once();
    worker.stats_reader()
}

#[tokio::test]
async fn health_returns_ok() {
    let server = TestServer::spawn(StatsReader::default()).await;

    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_expose_worker_counters() {
    let server = TestServer::spawn(processed_stats()).await;

    let res = reqwest::get(format!("{}/metrics", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(
        res.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );

    let body = res.text().await.unwrap();
    assert!(body.contains("todo_projector_batches_total 1\n"), "{body}");
    assert!(body.contains("todo_projector_messages_fetched_total 4\n"), "{body}");
    assert!(body.contains("todo_projector_events_applied_total 2\n"), "{body}");
    assert!(body.contains("todo_projector_events_ignored_total 1\n"), "{body}");
    assert!(body.contains("todo_projector_decode_failures_total 1\n"), "{body}");
    assert!(body.contains("todo_projector_messages_acked_total 4\n"), "{body}");
}

#[tokio::test]
async fn stats_are_served_as_json() {
    let server = TestServer::spawn(processed_stats()).await;

    let stats: serde_json::Value = reqwest::get(format!("{}/stats", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(stats["applied"], 2);
    assert_eq!(stats["acked"], 4);
    assert_eq!(stats["dead_lettered"], 0);
}
