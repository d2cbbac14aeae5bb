//! # Bulwark engine
//!
//! Incremental backup and rollback of player structures.
//!
//! The host owns a [`BackupService`], reports world changes through
//! [`BackupService::on_world_change`] and calls [`BackupService::tick`] on its
//! update loop. Each tick promotes records along the state machine in
//! [`tracker`] and drives at most one job: a time-sliced
//! [`SnapshotPipeline`] or a [`RollbackTask`].
//!
//! Everything the engine needs from the simulation goes through the
//! [`WorldHost`] trait. The `testkit` feature adds `testkit::MockWorld`, an
//! in-memory implementation.

pub mod arena;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod handle;
pub mod host;
pub mod pipeline;
pub mod rollback;
pub mod scheduler;
pub mod service;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod tracker;

pub use arena::{BufferPool, BufferPools, PoolStats, Pooled};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BackupConfig;
pub use error::{EngineError, HostError, Result};
pub use events::{BackupEvent, BackupEventHandler};
pub use handle::{HandleState, HandleTable, SnapshotHandle};
pub use host::{QueryKind, WorldHost};
pub use pipeline::{
    is_capturable, BackupOutcome, CompletionCallback, PipelineContext, PipelineStats,
    SliceOutcome, SnapshotPipeline, Stage,
};
pub use rollback::{
    apply_plan, preview, reconcile, PlanSummary, ReconcilePlan, RollbackOutcome, RollbackReport,
    RollbackTask,
};
pub use scheduler::{Job, JobOutcome, Promotion, SnapshotScheduler, TickOutcome, TickReport};
pub use service::BackupService;
pub use tracker::{
    ChangeAction, ChangeLogEntry, ChangeOutcome, ControllerRecord, RecordState, RecordTable,
    SaveAttempt,
};
