//! Time-sliced snapshot capture.
//!
//! ```text
//!   start ─► BuildNetwork ─► FindEntities ─► ProcessFoundEntities ─► FinishSave ─► Completed
//!              (1 record)     (1 zone)         (1 object)             (write)
//!                  └──────────────┴───────────────┴──────────────────────┴──► Failed
//! ```
//!
//! Each `step` does one unit of work from the current stage's queue.
//! `run_slice` keeps stepping until the slice has used up the configured
//! budget and then yields; the host's next tick resumes where it stopped.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use bulwark_model::{
    capture, EntityId, ObjectKind, PersistedObject, PersistenceId, UserId, Vec3, WorldObject,
    ZoneDescriptor,
};
use bulwark_storage::{CapturedStructure, NewSnapshot, SnapshotMetadata, SnapshotStore};

use crate::arena::BufferPools;
use crate::clock::Clock;
use crate::config::BackupConfig;
use crate::error::{EngineError, Result};
use crate::host::{QueryKind, WorldHost};
use crate::tracker::{ControllerRecord, RecordState, RecordTable};

/// Everything a running job borrows from its owner for one slice.
pub struct PipelineContext<'a> {
    pub host: &'a mut dyn WorldHost,
    pub records: &'a mut RecordTable,
    pub store: &'a SnapshotStore,
    pub pools: &'a BufferPools,
    pub clock: &'a dyn Clock,
    pub config: &'a BackupConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    BuildNetwork,
    FindEntities,
    ProcessFoundEntities,
    FinishSave,
    Completed,
    Failed,
}

impl Stage {
    fn record_state(self) -> Option<RecordState> {
        match self {
            Stage::BuildNetwork => Some(RecordState::SaveBuildingNetwork),
            Stage::FindEntities => Some(RecordState::SaveFindingEntities),
            Stage::ProcessFoundEntities | Stage::FinishSave => Some(RecordState::SaveWriting),
            Stage::Pending | Stage::Completed | Stage::Failed => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    Yielded,
    Completed { success: bool },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Sum of step durations.
    pub busy: Duration,
    pub longest_step: Duration,
    pub steps: u64,
    pub yields: u32,
    pub objects: usize,
    pub linked: usize,
}

/// Summary of a finished capture.
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub success: bool,
    pub linked: Vec<EntityId>,
    pub metadata: Option<SnapshotMetadata>,
    pub error: Option<String>,
    pub stats: PipelineStats,
}

pub type CompletionCallback = Box<dyn FnOnce(bool, &SnapshotPipeline) + Send>;

#[derive(Debug, Clone, Copy)]
struct Linked {
    id: EntityId,
    persistence_id: PersistenceId,
    position: Vec3,
}

impl Linked {
    fn of(record: &ControllerRecord) -> Self {
        Self {
            id: record.id,
            persistence_id: record.persistence_id,
            position: record.position,
        }
    }
}

pub struct SnapshotPipeline {
    roots: Vec<EntityId>,
    stage: Stage,
    /// Linked records; also the BuildNetwork exploration queue.
    linked: Vec<Linked>,
    explored: usize,
    prepared: bool,
    zones: Vec<Vec<ZoneDescriptor>>,
    zone_cursor: (usize, usize),
    authorized: Vec<UserId>,
    found: VecDeque<(usize, WorldObject)>,
    seen: HashSet<EntityId>,
    captured: Vec<Vec<PersistedObject>>,
    stats: PipelineStats,
    error: Option<String>,
    metadata: Option<SnapshotMetadata>,
    on_complete: Option<CompletionCallback>,
}

impl std::fmt::Debug for SnapshotPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotPipeline")
            .field("roots", &self.roots)
            .field("stage", &self.stage)
            .field("linked", &self.linked.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SnapshotPipeline {
    pub fn new(roots: Vec<EntityId>) -> Self {
        Self {
            roots,
            stage: Stage::Pending,
            linked: Vec::new(),
            explored: 0,
            prepared: false,
            zones: Vec::new(),
            zone_cursor: (0, 0),
            authorized: Vec::new(),
            found: VecDeque::new(),
            seen: HashSet::new(),
            captured: Vec::new(),
            stats: PipelineStats::default(),
            error: None,
            metadata: None,
            on_complete: None,
        }
    }

    pub fn on_complete(&mut self, callback: CompletionCallback) {
        self.on_complete = Some(callback);
    }

    pub fn roots(&self) -> &[EntityId] {
        &self.roots
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn linked(&self) -> Vec<EntityId> {
        self.linked.iter().map(|l| l.id).collect()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The written snapshot, once the pipeline has completed.
    pub fn metadata(&self) -> Option<&SnapshotMetadata> {
        self.metadata.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Completed | Stage::Failed)
    }

    pub fn outcome(&self) -> BackupOutcome {
        BackupOutcome {
            success: self.stage == Stage::Completed,
            linked: self.linked(),
            metadata: self.metadata.clone(),
            error: self.error.clone(),
            stats: self.stats,
        }
    }

    /// Validate the roots and claim them. On error nothing has changed.
    pub fn start(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        if self.stage != Stage::Pending {
            return Err(EngineError::AlreadyStarted);
        }
        if self.roots.is_empty() {
            return Err(EngineError::NoRoots);
        }

        let mut linked: Vec<Linked> = Vec::with_capacity(self.roots.len());
        for &id in &self.roots {
            let record = ctx
                .records
                .get(id)
                .ok_or(EngineError::UnknownController(id))?;
            match ctx.host.object(id) {
                Some(object) if !object.destroyed => {}
                Some(_) => {
                    return Err(EngineError::InvalidRoot {
                        id,
                        reason: "controller is destroyed".into(),
                    })
                }
                None => {
                    return Err(EngineError::InvalidRoot {
                        id,
                        reason: "controller no longer exists".into(),
                    })
                }
            }
            if !record.state().is_claimable() {
                return Err(EngineError::InvalidState {
                    id,
                    state: record.state(),
                });
            }
            if !linked.iter().any(|l| l.id == id) {
                linked.push(Linked::of(record));
            }
        }

        let now = ctx.clock.now();
        for l in &linked {
            ctx.records.begin_capture(l.id, now)?;
        }
        self.linked = linked;
        self.stats.linked = self.linked.len();

        let first = if ctx.config.link_structures {
            Stage::BuildNetwork
        } else {
            Stage::FindEntities
        };
        self.enter(ctx, first);
        tracing::info!(
            roots = ?self.roots,
            linking = ctx.config.link_structures,
            "snapshot pipeline started"
        );
        Ok(())
    }

    /// Run steps until the slice budget is spent or the pipeline finishes.
    pub fn run_slice(&mut self, ctx: &mut PipelineContext<'_>) -> SliceOutcome {
        if self.is_finished() {
            return SliceOutcome::Completed {
                success: self.stage == Stage::Completed,
            };
        }

        let budget = ctx.config.max_step_duration();
        let slice_start = ctx.clock.elapsed();
        loop {
            let step_start = ctx.clock.elapsed();
            let result = self.step(ctx);
            let step_time = ctx.clock.elapsed().saturating_sub(step_start);
            self.stats.busy += step_time;
            self.stats.longest_step = self.stats.longest_step.max(step_time);
            self.stats.steps += 1;

            if let Err(err) = result {
                self.fail(ctx, err);
                return self.complete(false);
            }
            if self.stage == Stage::Completed {
                return self.complete(true);
            }
            if ctx.clock.elapsed().saturating_sub(slice_start) > budget {
                self.stats.yields += 1;
                tracing::trace!(stage = ?self.stage, yields = self.stats.yields, "pipeline yielded");
                return SliceOutcome::Yielded;
            }
        }
    }

    /// One unit of work in the current stage.
    pub fn step(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        match self.stage {
            Stage::Pending => Err(EngineError::NotStarted),
            Stage::BuildNetwork => self.build_network(ctx),
            Stage::FindEntities => self.find_entities(ctx),
            Stage::ProcessFoundEntities => {
                self.process_found(ctx);
                Ok(())
            }
            Stage::FinishSave => self.finish_save(ctx),
            Stage::Completed | Stage::Failed => Ok(()),
        }
    }

    fn enter(&mut self, ctx: &mut PipelineContext<'_>, stage: Stage) {
        tracing::debug!(from = ?self.stage, to = ?stage, "pipeline stage");
        self.stage = stage;
        if let Some(state) = stage.record_state() {
            for l in &self.linked {
                if ctx.records.contains(l.id) {
                    let _ = ctx.records.update(l.id, state);
                }
            }
        }
    }

    fn is_linked(&self, id: EntityId) -> bool {
        self.linked.iter().any(|l| l.id == id)
    }

    fn build_network(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let Some(current) = self.linked.get(self.explored).copied() else {
            self.enter(ctx, Stage::FindEntities);
            return Ok(());
        };
        self.explored += 1;

        if ctx.records.contains(current.id) {
            let mut zones = ctx.pools.zones.acquire();
            zones.extend_from_slice(ctx.records.refresh_zones(&*ctx.host, ctx.pools, current.id)?);
            let mut nearby = ctx.pools.objects.acquire();
            for zone in zones.iter() {
                ctx.host
                    .objects_in_sphere(zone, QueryKind::Controllers, &mut nearby)?;
            }

            let now = ctx.clock.now();
            for object in nearby.iter() {
                if object.destroyed || self.is_linked(object.id) {
                    continue;
                }
                let Some(record) = ctx.records.get(object.id) else {
                    continue;
                };
                if !record.state().is_claimable() {
                    tracing::debug!(
                        neighbour = %object.id,
                        state = ?record.state(),
                        "skipping neighbour that cannot be captured"
                    );
                    continue;
                }
                let link = Linked::of(record);
                ctx.records.begin_capture(object.id, now)?;
                ctx.records
                    .update(object.id, RecordState::SaveBuildingNetwork)?;
                self.linked.push(link);
                tracing::debug!(from = %current.id, linked = %object.id, "linked neighbouring structure");
            }
        }

        if self.explored >= self.linked.len() {
            self.enter(ctx, Stage::FindEntities);
        }
        Ok(())
    }

    fn prepare_find(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let mut zones = Vec::with_capacity(self.linked.len());
        let mut authorized = Vec::new();
        for l in &self.linked {
            match ctx.records.refresh_zones(&*ctx.host, ctx.pools, l.id) {
                Ok(z) => zones.push(z.to_vec()),
                Err(EngineError::UnknownController(_)) => zones.push(Vec::new()),
                Err(err) => return Err(err),
            }
            authorized.extend(ctx.host.authorized_users(l.id));
        }
        authorized.sort();
        authorized.dedup();

        self.captured = vec![Vec::new(); self.linked.len()];
        self.zones = zones;
        self.authorized = authorized;
        self.stats.linked = self.linked.len();
        self.prepared = true;
        Ok(())
    }

    fn find_entities(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        if !self.prepared {
            return self.prepare_find(ctx);
        }

        let (ri, zi) = self.zone_cursor;
        if let Some(zone) = self.zones.get(ri).and_then(|z| z.get(zi)).copied() {
            let mut nearby = ctx.pools.objects.acquire();
            ctx.host.objects_in_sphere(&zone, QueryKind::Any, &mut nearby)?;
            for object in nearby.drain(..) {
                if is_capturable(&object, ctx.config, &self.authorized) {
                    self.found.push_back((ri, object));
                }
            }
        }

        let zone_count = self.zones.get(ri).map_or(0, Vec::len);
        self.zone_cursor = if zi + 1 < zone_count {
            (ri, zi + 1)
        } else {
            (ri + 1, 0)
        };
        if self.zone_cursor.0 >= self.linked.len() {
            self.enter(ctx, Stage::ProcessFoundEntities);
        }
        Ok(())
    }

    fn process_found(&mut self, ctx: &mut PipelineContext<'_>) {
        if let Some((ri, object)) = self.found.pop_front() {
            if self.seen.insert(object.id) {
                self.captured[ri].push(capture(&object));
                self.stats.objects += 1;
            }
        }
        if self.found.is_empty() {
            self.enter(ctx, Stage::FinishSave);
        }
    }

    fn finish_save(&mut self, ctx: &mut PipelineContext<'_>) -> Result<()> {
        let now = ctx.clock.now();
        let structures = self
            .linked
            .iter()
            .enumerate()
            .map(|(i, l)| CapturedStructure {
                controller: l.persistence_id,
                position: l.position,
                zones: std::mem::take(&mut self.zones[i]),
                objects: std::mem::take(&mut self.captured[i]),
            })
            .collect();

        let metadata = ctx.store.write(NewSnapshot {
            created_at: now,
            structures,
            authorized_users: self.authorized.clone(),
        })?;

        for l in &self.linked {
            if ctx.records.contains(l.id) {
                ctx.records.mark_saved(l.id, now)?;
            }
        }
        self.metadata = Some(metadata);
        self.stage = Stage::Completed;
        Ok(())
    }

    fn fail(&mut self, ctx: &mut PipelineContext<'_>, err: EngineError) {
        let message = err.to_string();
        tracing::warn!(roots = ?self.roots, stage = ?self.stage, error = %message, "snapshot pipeline failed");
        let now = ctx.clock.now();
        for l in &self.linked {
            if ctx.records.contains(l.id) {
                let _ = ctx.records.mark_failed(l.id, now, &message);
            }
        }
        self.error = Some(message);
        self.stage = Stage::Failed;
    }

    fn complete(&mut self, success: bool) -> SliceOutcome {
        if let Some(meta) = &self.metadata {
            tracing::info!(
                snapshot = %meta.id,
                objects = self.stats.objects,
                linked = self.stats.linked,
                yields = self.stats.yields,
                busy_ms = self.stats.busy.as_millis() as u64,
                "snapshot pipeline completed"
            );
        }
        if let Some(callback) = self.on_complete.take() {
            callback(success, self);
        }
        SliceOutcome::Completed { success }
    }
}

pub(crate) fn excluded_collectible(object: &WorldObject, config: &BackupConfig) -> bool {
    config.exclude_unowned_collectibles
        && object.kind == ObjectKind::Collectible
        && object.owner.is_none()
}

/// Capture filter applied to every object found in a zone.
pub fn is_capturable(object: &WorldObject, config: &BackupConfig, authorized: &[UserId]) -> bool {
    if object.destroyed || excluded_collectible(object, config) {
        return false;
    }
    if config.require_authorized_owner && object.kind != ObjectKind::Controller {
        return object.owner.is_some_and(|owner| authorized.contains(&owner));
    }
    true
}
