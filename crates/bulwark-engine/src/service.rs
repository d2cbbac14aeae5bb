//! `BackupService`: the value a host owns and ticks.
//!
//! It bundles the record table, snapshot store, handle table and scheduler,
//! turns world notifications into record changes, and fans scheduler
//! results out to registered event handlers.

use std::sync::Arc;

use bulwark_model::{EntityId, ObjectKind, UserId, WorldObject, ZoneDescriptor};
use bulwark_storage::{SnapshotMetadata, SnapshotStore};
use uuid::Uuid;

use crate::arena::BufferPools;
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::error::{EngineError, Result};
use crate::events::{BackupEvent, BackupEventHandler};
use crate::handle::{HandleState, HandleTable, SnapshotHandle};
use crate::host::WorldHost;
use crate::pipeline::PipelineContext;
use crate::rollback::{self, ReconcilePlan, RollbackOutcome, RollbackTask};
use crate::scheduler::{Job, JobOutcome, SnapshotScheduler, TickOutcome, TickReport};
use crate::tracker::{ChangeAction, ChangeOutcome, RecordState, RecordTable};

/// Owns every table the engine needs; the host passes itself in per call.
pub struct BackupService {
    config: BackupConfig,
    clock: Arc<dyn Clock>,
    records: RecordTable,
    store: SnapshotStore,
    handles: HandleTable,
    pools: BufferPools,
    scheduler: SnapshotScheduler,
    handlers: Vec<BackupEventHandler>,
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService")
            .field("records", &self.records.len())
            .field("snapshots", &self.store.len())
            .field("handles", &self.handles.len())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl BackupService {
    /// Validate `config` and open the snapshot store it names.
    pub fn new(config: BackupConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let partitioner = config.partitioner()?;
        let store = SnapshotStore::open(config.storage.clone(), clock.now())?;
        tracing::info!(
            root = %config.storage.root.display(),
            snapshots = store.len(),
            "backup service ready"
        );
        Ok(Self {
            records: RecordTable::new(partitioner),
            handles: HandleTable::new(config.lease_duration()),
            scheduler: SnapshotScheduler::new(config.save_delay(), config.max_retries),
            pools: BufferPools::new(),
            handlers: Vec::new(),
            store,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn records(&self) -> &RecordTable {
        &self.records
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn pools(&self) -> &BufferPools {
        &self.pools
    }

    pub fn scheduler(&self) -> &SnapshotScheduler {
        &self.scheduler
    }

    pub fn on_event(&mut self, handler: BackupEventHandler) {
        self.handlers.push(handler);
    }

    fn emit(&self, event: BackupEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    /// Start recording every controller in `objects`. Returns how many were
    /// newly tracked.
    pub fn scan(&mut self, host: &dyn WorldHost, objects: &[WorldObject]) -> usize {
        let mut started = 0;
        for object in objects {
            if object.destroyed || self.records.contains(object.id) {
                continue;
            }
            if object.kind != ObjectKind::Controller {
                continue;
            }
            let tracked = self
                .records
                .start_recording(host, &self.pools, object)
                .map(|_| ());
            match tracked {
                Ok(()) => {
                    started += 1;
                    self.emit(BackupEvent::RecordingStarted {
                        controller: object.id,
                    });
                }
                Err(err) => {
                    tracing::warn!(controller = %object.id, error = %err, "could not track controller")
                }
            }
        }
        started
    }

    /// Change hook the host calls for every create/update/decay/kill.
    pub fn on_world_change(
        &mut self,
        host: &dyn WorldHost,
        object: &WorldObject,
        action: ChangeAction,
        actor: Option<UserId>,
    ) -> Result<ChangeOutcome> {
        let now = self.clock.now();
        let outcome = self
            .records
            .handle_change(host, &self.pools, object, action, actor, now)?;
        match outcome {
            ChangeOutcome::Started(controller) => {
                self.emit(BackupEvent::RecordingStarted { controller })
            }
            ChangeOutcome::Stopped(controller) => {
                self.emit(BackupEvent::RecordingStopped { controller })
            }
            ChangeOutcome::Ignored | ChangeOutcome::Logged { .. } => {}
        }
        Ok(outcome)
    }

    /// One scheduler tick. Errors are logged and reported as events, never
    /// returned.
    pub fn tick(&mut self, host: &mut dyn WorldHost) -> TickReport {
        let now = self.clock.now();
        for handle in self.handles.expire(now) {
            self.emit(BackupEvent::LeaseExpired {
                snapshot: handle.snapshot,
                owner: handle.owner,
            });
        }

        let report = {
            let mut ctx = PipelineContext {
                host,
                records: &mut self.records,
                store: &self.store,
                pools: &self.pools,
                clock: &*self.clock,
                config: &self.config,
            };
            self.scheduler.tick(&mut ctx)
        };

        for promotion in &report.promotions {
            if promotion.to == RecordState::RetryLimitExceeded {
                let error = self
                    .records
                    .get(promotion.controller)
                    .and_then(|r| r.last_error())
                    .map(str::to_string);
                self.emit(BackupEvent::RetryLimitExceeded {
                    controller: promotion.controller,
                    error,
                });
            }
        }

        if let TickOutcome::DispatchedBackup(root) = report.outcome {
            let roots = match self.scheduler.active() {
                Some(Job::Backup(pipeline)) => pipeline.linked(),
                _ => vec![root],
            };
            self.emit(BackupEvent::BackupStarted { roots });
        }

        match &report.finished {
            Some(JobOutcome::Backup(outcome)) => match (&outcome.metadata, outcome.success) {
                (Some(meta), true) => self.emit(BackupEvent::BackupCompleted {
                    snapshot: meta.id,
                    controllers: outcome.linked.clone(),
                    objects: outcome.stats.objects,
                    yields: outcome.stats.yields,
                }),
                _ => self.emit(BackupEvent::BackupFailed {
                    controllers: outcome.linked.clone(),
                    error: outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                }),
            },
            Some(JobOutcome::Rollback(rollback)) => {
                self.handles.finish_rollback(rollback.snapshot);
                if let RollbackOutcome::PartiallyApplied { error } = &rollback.outcome {
                    tracing::error!(
                        snapshot = %rollback.snapshot,
                        killed = rollback.killed,
                        created = rollback.created,
                        updated = rollback.updated,
                        error = %error,
                        "rollback stopped part way"
                    );
                }
                self.emit(BackupEvent::RollbackFinished {
                    report: rollback.clone(),
                });
            }
            None => {}
        }

        let outstanding = self.pools.outstanding();
        if outstanding != 0 {
            tracing::error!(outstanding, "pooled buffers leaked across a tick");
        }
        report
    }

    /// Queue `controller` for the next free slot, skipping the save delay.
    pub fn request_backup(&mut self, controller: EntityId) -> Result<()> {
        self.scheduler.request_backup(&mut self.records, controller)
    }

    pub fn reinitialize(&mut self, host: &dyn WorldHost, controller: EntityId) -> Result<()> {
        self.records.reinitialize(host, &self.pools, controller)
    }

    fn snapshot(&self, snapshot: Uuid) -> Result<SnapshotMetadata> {
        self.store
            .get(snapshot)
            .ok_or_else(|| EngineError::SnapshotNotFound(snapshot.to_string()))
    }

    // ------------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------------

    /// Claim `snapshot` for `user`; returns the code `confirm_lock` expects.
    pub fn request_lock(&mut self, snapshot: Uuid, user: UserId) -> Result<String> {
        self.snapshot(snapshot)?;
        self.handles.request_lock(snapshot, user, self.clock.now())
    }

    pub fn confirm_lock(&mut self, snapshot: Uuid, user: UserId, code: &str) -> Result<()> {
        self.handles
            .confirm_lock(snapshot, user, code, self.clock.now())
    }

    pub fn release_handle(&mut self, snapshot: Uuid, user: UserId) -> Result<SnapshotHandle> {
        self.handles.release(snapshot, user, self.clock.now())
    }

    /// Zones a snapshot covers, for display to the handle holder.
    pub fn preview_zones(&mut self, snapshot: Uuid, user: UserId) -> Result<Vec<ZoneDescriptor>> {
        let meta = self.snapshot(snapshot)?;
        self.handles.set_preview(
            snapshot,
            user,
            HandleState::PreviewZones,
            None,
            self.clock.now(),
        )?;
        Ok(meta.zones().copied().collect())
    }

    /// What a rollback would do right now, without doing it.
    pub fn preview_rollback(
        &mut self,
        host: &dyn WorldHost,
        snapshot: Uuid,
        user: UserId,
    ) -> Result<ReconcilePlan> {
        let now = self.clock.now();
        self.handles.check_holder(snapshot, user, now)?;
        let plan = rollback::preview(host, &self.store, &self.pools, &self.config, snapshot)?;
        self.handles.set_preview(
            snapshot,
            user,
            HandleState::PreviewRollback,
            Some(plan.summary()),
            now,
        )?;
        Ok(plan)
    }

    /// Start rolling back a locked snapshot. The work runs on later ticks.
    pub fn begin_rollback(&mut self, snapshot: Uuid, user: UserId) -> Result<()> {
        self.snapshot(snapshot)?;
        self.handles.begin_rollback(snapshot, user, self.clock.now())?;
        self.scheduler
            .enqueue_rollback(RollbackTask::new(snapshot, user));
        tracing::info!(snapshot = %snapshot, user = %user, "rollback queued");
        self.emit(BackupEvent::RollbackStarted { snapshot, user });
        Ok(())
    }
}
