//! Rolling a structure back to a snapshot.
//!
//! A `RollbackTask` occupies the same job slot as a backup pipeline:
//!
//! 1. load the snapshot metadata and payload,
//! 2. find tracked records whose zones touch the snapshot's zones and back
//!    them up first (the rollback stops if that backup fails),
//! 3. `reconcile` the recorded objects against the live world,
//! 4. apply the plan: kills, then creates, then updates.
//!
//! Mutations are not undone when one fails; the report says how far the
//! apply phase got.

use std::collections::HashSet;

use bulwark_model::{EntityId, PersistedObject, PersistenceId, UserId, WorldObject, ZoneDescriptor};
use bulwark_storage::{SnapshotPayload, SnapshotStore};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arena::BufferPools;
use crate::config::BackupConfig;
use crate::error::{EngineError, HostError, Result};
use crate::host::{QueryKind, WorldHost};
use crate::pipeline::{excluded_collectible, PipelineContext, SliceOutcome, SnapshotPipeline};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub kill: usize,
    pub create: usize,
    pub update: usize,
}

/// What has to change in the live world to match a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ReconcilePlan {
    pub kill: Vec<WorldObject>,
    pub create: Vec<PersistedObject>,
    pub update: Vec<(EntityId, PersistedObject)>,
}

impl ReconcilePlan {
    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            kill: self.kill.len(),
            create: self.create.len(),
            update: self.update.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kill.is_empty() && self.create.is_empty() && self.update.is_empty()
    }
}

/// Diff recorded objects against whatever currently occupies their space.
pub fn reconcile(
    host: &dyn WorldHost,
    pools: &BufferPools,
    config: &BackupConfig,
    payload: &SnapshotPayload,
) -> Result<ReconcilePlan> {
    let tracking: HashSet<PersistenceId> = payload.objects().map(|o| o.id).collect();
    let mut killed: HashSet<EntityId> = HashSet::new();
    let mut matched = pools.ids.acquire();
    let mut plan = ReconcilePlan::default();

    for recorded in payload.objects() {
        let mut nearby = pools.objects.acquire();
        let sphere = ZoneDescriptor::new(recorded.transform.position, recorded.radius);
        host.objects_in_sphere(&sphere, QueryKind::Any, &mut nearby)?;

        let mut live_match = None;
        for live in nearby.iter().filter(|o| !o.destroyed) {
            let pid = live.persistence_id();
            if !tracking.contains(&pid) {
                if !excluded_collectible(live, config) && killed.insert(live.id) {
                    plan.kill.push(live.clone());
                }
            } else if pid == recorded.id && live_match.is_none() && !matched.contains(&live.id) {
                live_match = Some(live.id);
            }
        }

        match live_match {
            Some(id) => {
                matched.push(id);
                plan.update.push((id, recorded.clone()));
            }
            None => plan.create.push(recorded.clone()),
        }
    }

    tracing::debug!(
        kill = plan.kill.len(),
        create = plan.create.len(),
        update = plan.update.len(),
        "reconciled snapshot against live world"
    );
    Ok(plan)
}

/// Compute the plan for a stored snapshot without touching the world.
pub fn preview(
    host: &dyn WorldHost,
    store: &SnapshotStore,
    pools: &BufferPools,
    config: &BackupConfig,
    snapshot: Uuid,
) -> Result<ReconcilePlan> {
    let meta = store
        .get(snapshot)
        .ok_or_else(|| EngineError::SnapshotNotFound(snapshot.to_string()))?;
    let payload = store.read_payload(&meta)?;
    reconcile(host, pools, config, &payload)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    Pending,
    Applied,
    /// A mutation failed; earlier mutations stay applied.
    PartiallyApplied { error: String },
    /// Stopped before touching the world.
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub snapshot: Uuid,
    pub user: UserId,
    pub colliding: Vec<EntityId>,
    pub safety_backup: Option<Uuid>,
    pub planned: PlanSummary,
    pub killed: usize,
    pub created: usize,
    pub updated: usize,
    pub outcome: RollbackOutcome,
}

impl RollbackReport {
    fn new(snapshot: Uuid, user: UserId) -> Self {
        Self {
            snapshot,
            user,
            colliding: Vec::new(),
            safety_backup: None,
            planned: PlanSummary::default(),
            killed: 0,
            created: 0,
            updated: 0,
            outcome: RollbackOutcome::Pending,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RollbackOutcome::Applied
    }
}

/// Apply kills, creates and updates in that order, stopping at the first
/// failure. Counters in `report` reflect what was applied.
pub fn apply_plan(
    host: &mut dyn WorldHost,
    plan: &ReconcilePlan,
    report: &mut RollbackReport,
) -> std::result::Result<(), HostError> {
    for object in &plan.kill {
        host.destroy(object.id)?;
        report.killed += 1;
    }
    for record in &plan.create {
        host.spawn(record)?;
        report.created += 1;
    }
    for (id, record) in &plan.update {
        host.apply(*id, record)?;
        report.updated += 1;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollbackStage {
    Load,
    SafetyBackup,
    Reconcile,
    Apply,
    Done,
}

#[derive(Debug)]
pub struct RollbackTask {
    stage: RollbackStage,
    report: RollbackReport,
    payload: Option<SnapshotPayload>,
    backup: Option<SnapshotPipeline>,
    plan: Option<ReconcilePlan>,
}

impl RollbackTask {
    pub fn new(snapshot: Uuid, user: UserId) -> Self {
        Self {
            stage: RollbackStage::Load,
            report: RollbackReport::new(snapshot, user),
            payload: None,
            backup: None,
            plan: None,
        }
    }

    pub fn snapshot(&self) -> Uuid {
        self.report.snapshot
    }

    pub fn user(&self) -> UserId {
        self.report.user
    }

    pub fn report(&self) -> &RollbackReport {
        &self.report
    }

    pub fn is_finished(&self) -> bool {
        self.stage == RollbackStage::Done
    }

    pub fn run_slice(&mut self, ctx: &mut PipelineContext<'_>) -> SliceOutcome {
        let budget = ctx.config.max_step_duration();
        let slice_start = ctx.clock.elapsed();
        loop {
            match self.stage {
                RollbackStage::Load => {
                    if let Err(err) = self.load(ctx) {
                        return self.abort(err);
                    }
                }
                RollbackStage::SafetyBackup => {
                    let Some(backup) = self.backup.as_mut() else {
                        self.stage = RollbackStage::Reconcile;
                        continue;
                    };
                    match backup.run_slice(ctx) {
                        SliceOutcome::Yielded => return SliceOutcome::Yielded,
                        SliceOutcome::Completed { success: true } => {
                            self.report.safety_backup = backup.metadata().map(|m| m.id);
                            self.stage = RollbackStage::Reconcile;
                        }
                        SliceOutcome::Completed { success: false } => {
                            let reason = backup.error().unwrap_or("unknown error").to_string();
                            return self.abort(EngineError::SafetyBackupFailed(reason));
                        }
                    }
                }
                RollbackStage::Reconcile => {
                    let planned = match self.payload.as_ref() {
                        Some(payload) => reconcile(&*ctx.host, ctx.pools, ctx.config, payload),
                        None => Err(EngineError::SnapshotNotFound(
                            self.report.snapshot.to_string(),
                        )),
                    };
                    match planned {
                        Ok(plan) => {
                            self.report.planned = plan.summary();
                            self.plan = Some(plan);
                            self.stage = RollbackStage::Apply;
                        }
                        Err(err) => return self.abort(err),
                    }
                }
                RollbackStage::Apply => {
                    let plan = self.plan.take().unwrap_or_default();
                    let applied = apply_plan(&mut *ctx.host, &plan, &mut self.report);
                    self.report.outcome = match applied {
                        Ok(()) => RollbackOutcome::Applied,
                        Err(err) => RollbackOutcome::PartiallyApplied {
                            error: err.to_string(),
                        },
                    };
                    for id in &self.report.colliding {
                        let _ = ctx.records.invalidate_zones(*id);
                    }
                    self.stage = RollbackStage::Done;
                    self.payload = None;
                    tracing::info!(
                        snapshot = %self.report.snapshot,
                        killed = self.report.killed,
                        created = self.report.created,
                        updated = self.report.updated,
                        outcome = ?self.report.outcome,
                        "rollback finished"
                    );
                    return SliceOutcome::Completed {
                        success: self.report.is_success(),
                    };
                }
                RollbackStage::Done => {
                    return SliceOutcome::Completed {
                        success: self.report.is_success(),
                    }
                }
            }

            if ctx.clock.elapsed().saturating_sub(slice_start) > budget {
                return SliceOutcome::Yielded;
            }
        }
    }

    fn load(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let id = self.report.snapshot;
        let meta = ctx
            .store
            .get(id)
            .ok_or_else(|| EngineError::SnapshotNotFound(id.to_string()))?;
        let payload = ctx.store.read_payload(&meta)?;

        let colliding: Vec<EntityId> = ctx
            .records
            .colliding(&*ctx.host, ctx.pools, &payload.zones)?
            .into_iter()
            .filter(|id| ctx.host.object(*id).is_some_and(|o| !o.destroyed))
            .collect();

        // Records parked at the retry limit stay parked until reinitialized.
        let backup_roots: Vec<EntityId> = colliding
            .iter()
            .copied()
            .filter(|id| ctx.records.get(*id).is_some_and(|r| r.state().is_claimable()))
            .collect();

        if backup_roots.is_empty() {
            self.stage = RollbackStage::Reconcile;
        } else {
            let mut backup = SnapshotPipeline::new(backup_roots);
            backup
                .start(ctx)
                .map_err(|e| EngineError::SafetyBackupFailed(e.to_string()))?;
            self.backup = Some(backup);
            self.stage = RollbackStage::SafetyBackup;
        }
        tracing::info!(
            snapshot = %id,
            objects = payload.object_count(),
            colliding = colliding.len(),
            "rollback loaded snapshot"
        );
        self.report.colliding = colliding;
        self.payload = Some(payload);
        Ok(())
    }

    fn abort(&mut self, err: EngineError) -> SliceOutcome {
        tracing::warn!(snapshot = %self.report.snapshot, error = %err, "rollback aborted");
        self.report.outcome = RollbackOutcome::Aborted {
            reason: err.to_string(),
        };
        self.stage = RollbackStage::Done;
        self.payload = None;
        SliceOutcome::Completed { success: false }
    }
}
