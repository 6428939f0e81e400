//! Startup wiring: turn settings into a connected source and medium.
//!
//! Every failure here is fatal; nothing after startup exits the process.

use anyhow::Context;
use tokio::runtime::Handle;
use tracing::info;

use todo_projector_events::ProjectionMedium;
use todo_projector_infra::config::{ProjectionTarget, WorkerSettings};
use todo_projector_infra::event_bus::RedisStreamsSource;
use todo_projector_infra::read_model::PostgresProjectionStore;
use todo_projector_infra::search_index::SearchIndex;

const PG_MAX_CONNECTIONS: u32 = 2;

/// Connect to the broker and make sure the consumer group exists.
pub async fn connect_source(settings: &WorkerSettings) -> anyhow::Result<RedisStreamsSource> {
    let broker = settings.broker.clone();
    tokio::task::spawn_blocking(move || {
        let mut source = RedisStreamsSource::from_settings(&broker)?;
        source.connect()?;
        Ok::<_, todo_projector_events::BrokerError>(source)
    })
    .await?
    .with_context(|| format!("failed to subscribe to {}", settings.broker.stream))
}

/// Build the configured projection medium and verify it can be written.
pub async fn open_medium(settings: &WorkerSettings) -> anyhow::Result<Box<dyn ProjectionMedium>> {
    match &settings.projection {
        ProjectionTarget::Postgres { url } => {
            let pool = PostgresProjectionStore::connect(url, PG_MAX_CONNECTIONS)
                .await
                .context("failed to connect to projection database")?;
            info!("projection medium: postgres");
            Ok(Box::new(PostgresProjectionStore::new(pool, Handle::current())))
        }
        ProjectionTarget::SearchIndex { path } => {
            let index =
                SearchIndex::new(path.clone()).with_lock_timeout(settings.index_lock_timeout);
            let mut probe = index.clone();
            tokio::task::spawn_blocking(move || probe.open()?.close())
                .await?
                .with_context(|| format!("failed to open search index {}", path.display()))?;
            info!(path = %index.path().display(), "projection medium: search index");
            Ok(Box::new(index))
        }
    }
}
