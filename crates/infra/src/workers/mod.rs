pub mod projection_worker;

pub use projection_worker::{
    AckPolicy, BatchReport, IndexScope, ProjectionWorker, StatsReader, WorkerConfig, WorkerHandle,
    WorkerStats,
};
