//! Health and metrics endpoint.

use std::fmt::Write as _;
use std::net::SocketAddr;

use axum::{
    Extension, Json, Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tracing::info;

use todo_projector_infra::workers::{StatsReader, WorkerStats};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn metrics(Extension(stats): Extension<StatsReader>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&stats.snapshot()),
    )
}

pub async fn stats(Extension(stats): Extension<StatsReader>) -> Json<WorkerStats> {
    Json(stats.snapshot())
}

pub fn router(reader: StatsReader) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/stats", get(stats))
        .layer(Extension(reader))
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    reader: StatsReader,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "metrics endpoint listening");

    axum::serve(listener, router(reader))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Prometheus text exposition of the worker counters.
pub fn render(stats: &WorkerStats) -> String {
    let counters: [(&str, &str, u64); 13] = [
        ("batches_total", "Non-empty batches processed.", stats.batches),
        ("messages_fetched_total", "Messages received from the broker.", stats.fetched),
        ("events_applied_total", "Events written to the projection.", stats.applied),
        ("events_ignored_total", "Messages with an unknown event type.", stats.ignored),
        ("decode_failures_total", "Messages dropped as undecodable.", stats.decode_failures),
        ("store_failures_total", "Projection writes that failed.", stats.store_failures),
        ("panics_total", "Messages whose processing panicked.", stats.panics),
        ("messages_acked_total", "Messages acknowledged.", stats.acked),
        (
            "messages_dead_lettered_total",
            "Messages parked on the dead-letter stream.",
            stats.dead_lettered,
        ),
        ("messages_unacked_total", "Messages left for redelivery.", stats.left_unacked),
        ("fetch_errors_total", "Failed fetches.", stats.fetch_errors),
        ("lifecycle_errors_total", "Projection open or close failures.", stats.lifecycle_errors),
        ("ack_errors_total", "Failed acknowledgments.", stats.ack_errors),
    ];

    let mut out = String::new();
    for (name, help, value) in counters {
        let _ = writeln!(out, "# HELP todo_projector_{name} {help}");
        let _ = writeln!(out, "# TYPE todo_projector_{name} counter");
        let _ = writeln!(out, "todo_projector_{name} {value}");
    }
    out
}
