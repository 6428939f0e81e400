use anyhow::Context;
use tracing::{error, info};

use todo_projector_infra::config::WorkerSettings;
use todo_projector_infra::workers::ProjectionWorker;
use todo_projector_worker::{metrics, startup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = WorkerSettings::from_env().context("invalid configuration")?;
    todo_projector_observability::init(&settings.log_level);

    info!(
        stream = %settings.broker.stream,
        group = %settings.broker.consumer_group,
        consumer = %settings.broker.consumer_name,
        batch_size = settings.worker.batch_size,
        ack_policy = ?settings.worker.ack_policy,
        index_scope = ?settings.worker.index_scope,
        "starting projection worker"
    );

    let source = startup::connect_source(&settings).await?;
    let medium = startup::open_medium(&settings).await?;

    let worker = ProjectionWorker::new(source, medium, settings.worker.clone());
    let handle = worker
        .spawn("projection-worker")
        .context("failed to spawn projection worker thread")?;

    let (stop_metrics, metrics_stopped) = tokio::sync::oneshot::channel::<()>();
    let metrics_task = settings.metrics_addr.map(|addr| {
        let reader = handle.stats_reader();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = metrics_stopped.await;
            };
            if let Err(err) = metrics::serve(addr, reader, shutdown).await {
                error!(error = %err, "metrics endpoint failed");
            }
        })
    });

    shutdown_signal().await;
    info!("shutdown requested, finishing in-flight batch");

    let _ = stop_metrics.send(());
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .context("projection worker did not shut down cleanly")?;
    if let Some(task) = metrics_task {
        let _ = task.await;
    }

    info!("projection worker exited");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install ctrl+c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install sigterm handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
