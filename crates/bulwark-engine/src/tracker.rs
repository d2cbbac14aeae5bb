//! Per-controller change tracking.
//!
//! ```text
//!  NeedsInit ─► Idle ─► Modified ─► Queued ─► Processing ─► SaveBuildingNetwork
//!                ▲                    ▲                              │
//!                │                    │                     SaveFindingEntities
//!                │                    │                              │
//!   (Idle|Modified) ◄─ SaveSuccess ◄──┼───────────────────────── SaveWriting
//!                                     │                              │
//!                                     └──────── SaveFailure ◄────────┘
//!                                                     │
//!                                              RetryLimitExceeded
//! ```
//!
//! Changes arriving while a capture is in flight are logged but never pull
//! the record back to `Modified`; the post-save resolution picks them up.

use std::collections::BTreeMap;

use bulwark_model::{
    EntityId, ObjectKind, PersistenceId, UserId, Vec3, WorldObject, ZoneDescriptor,
    ZonePartitioner,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arena::BufferPools;
use crate::error::{EngineError, Result};
use crate::host::WorldHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordState {
    NeedsInit,
    Idle,
    Modified,
    Queued,
    Processing,
    SaveBuildingNetwork,
    SaveFindingEntities,
    SaveWriting,
    SaveSuccess,
    SaveFailure,
    RetryLimitExceeded,
}

impl RecordState {
    /// A capture owns the record.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            RecordState::Processing
                | RecordState::SaveBuildingNetwork
                | RecordState::SaveFindingEntities
                | RecordState::SaveWriting
        )
    }

    pub fn is_terminal(self) -> bool {
        self == RecordState::RetryLimitExceeded
    }

    /// A capture may claim the record: initialised, not owned by another
    /// capture, and not waiting on an operator reset.
    pub fn is_claimable(self) -> bool {
        !(self.is_in_flight() || self.is_terminal() || self == RecordState::NeedsInit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeAction {
    Create,
    Update,
    Decay,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub at: DateTime<Utc>,
    pub action: ChangeAction,
    pub actor: Option<UserId>,
    pub object: EntityId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveAttempt {
    pub at: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerRecord {
    pub id: EntityId,
    pub persistence_id: PersistenceId,
    pub position: Vec3,
    state: RecordState,
    change_log: Vec<ChangeLogEntry>,
    zones: Vec<ZoneDescriptor>,
    zones_dirty: bool,
    attempts: Vec<SaveAttempt>,
    last_error: Option<String>,
    last_saved_at: Option<DateTime<Utc>>,
    capture_started_at: Option<DateTime<Utc>>,
    /// Change log length when the current or last capture started.
    capture_log_len: usize,
}

impl ControllerRecord {
    fn new(controller: &WorldObject) -> Self {
        Self {
            id: controller.id,
            persistence_id: controller.persistence_id(),
            position: controller.transform.position,
            state: RecordState::NeedsInit,
            change_log: Vec::new(),
            zones: Vec::new(),
            zones_dirty: true,
            attempts: Vec::new(),
            last_error: None,
            last_saved_at: None,
            capture_started_at: None,
            capture_log_len: 0,
        }
    }

    pub fn state(&self) -> RecordState {
        self.state
    }

    pub fn change_log(&self) -> &[ChangeLogEntry] {
        &self.change_log
    }

    /// Cached zones; may be stale when `zones_dirty` is set.
    pub fn zones(&self) -> &[ZoneDescriptor] {
        &self.zones
    }

    pub fn zones_dirty(&self) -> bool {
        self.zones_dirty
    }

    pub fn attempts(&self) -> &[SaveAttempt] {
        &self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    pub fn capture_started_at(&self) -> Option<DateTime<Utc>> {
        self.capture_started_at
    }

    /// Consecutive most recent failures, minus the attempt being judged.
    pub fn retry_count(&self) -> u32 {
        let failures = self
            .attempts
            .iter()
            .rev()
            .take_while(|a| !a.success)
            .count();
        failures.saturating_sub(1).min(u32::MAX as usize) as u32
    }

    /// Whether changes were logged after the current or last capture began.
    pub fn changed_since_capture(&self) -> bool {
        self.change_log.len() > self.capture_log_len
    }
}

/// What `handle_change` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Not related to any tracked controller.
    Ignored,
    Started(EntityId),
    Stopped(EntityId),
    Logged {
        controller: EntityId,
        state: RecordState,
    },
}

/// Every tracked controller, keyed by its in-session id.
#[derive(Debug)]
pub struct RecordTable {
    records: BTreeMap<EntityId, ControllerRecord>,
    partitioner: ZonePartitioner,
}

impl RecordTable {
    pub fn new(partitioner: ZonePartitioner) -> Self {
        Self {
            records: BTreeMap::new(),
            partitioner,
        }
    }

    pub fn get(&self, id: EntityId) -> Option<&ControllerRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &ControllerRecord> + '_ {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.records.keys().copied().collect()
    }

    fn record_mut(&mut self, id: EntityId) -> Result<&mut ControllerRecord> {
        self.records
            .get_mut(&id)
            .ok_or(EngineError::UnknownController(id))
    }

    pub fn start_recording(
        &mut self,
        host: &dyn WorldHost,
        pools: &BufferPools,
        controller: &WorldObject,
    ) -> Result<&ControllerRecord> {
        if !self.records.contains_key(&controller.id) {
            if controller.kind != ObjectKind::Controller {
                return Err(EngineError::InvalidRoot {
                    id: controller.id,
                    reason: format!("{:?} is not a controller", controller.kind),
                });
            }
            let mut record = ControllerRecord::new(controller);
            compute_zones(&self.partitioner, host, pools, &mut record)?;
            record.state = RecordState::Idle;
            tracing::debug!(
                controller = %record.id,
                pid = %record.persistence_id,
                zones = record.zones.len(),
                "started recording"
            );
            self.records.insert(controller.id, record);
        }
        self.records
            .get(&controller.id)
            .ok_or(EngineError::UnknownController(controller.id))
    }

    pub fn stop_recording(&mut self, controller: EntityId) -> Option<ControllerRecord> {
        let removed = self.records.remove(&controller);
        if removed.is_some() {
            tracing::debug!(controller = %controller, "stopped recording");
        }
        removed
    }

    /// Route a world change to the record it affects.
    pub fn handle_change(
        &mut self,
        host: &dyn WorldHost,
        pools: &BufferPools,
        object: &WorldObject,
        action: ChangeAction,
        actor: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<ChangeOutcome> {
        let target = if object.kind == ObjectKind::Controller {
            let tracked = self.records.contains_key(&object.id);
            match action {
                ChangeAction::Kill if tracked => {
                    self.stop_recording(object.id);
                    return Ok(ChangeOutcome::Stopped(object.id));
                }
                ChangeAction::Create if !tracked => {
                    self.start_recording(host, pools, object)?;
                    return Ok(ChangeOutcome::Started(object.id));
                }
                _ => object.id,
            }
        } else {
            match object.controller {
                Some(id) => id,
                None => return Ok(ChangeOutcome::Ignored),
            }
        };

        let Some(record) = self.records.get_mut(&target) else {
            tracing::trace!(
                object = %object.id,
                controller = %target,
                "change for untracked controller"
            );
            return Ok(ChangeOutcome::Ignored);
        };

        record.change_log.push(ChangeLogEntry {
            at: now,
            action,
            actor,
            object: object.id,
        });
        if object.is_structural() {
            record.zones_dirty = true;
        }
        if matches!(record.state, RecordState::Idle | RecordState::SaveSuccess) {
            record.state = RecordState::Modified;
        }
        Ok(ChangeOutcome::Logged {
            controller: target,
            state: record.state,
        })
    }

    /// Explicit transition; returns the previous state.
    pub fn update(&mut self, controller: EntityId, state: RecordState) -> Result<RecordState> {
        let record = self.record_mut(controller)?;
        let previous = std::mem::replace(&mut record.state, state);
        if previous != state {
            tracing::debug!(controller = %controller, from = ?previous, to = ?state, "record state");
        }
        Ok(previous)
    }

    /// Cached zones, recomputed first if a structural change dirtied them.
    pub fn refresh_zones(
        &mut self,
        host: &dyn WorldHost,
        pools: &BufferPools,
        controller: EntityId,
    ) -> Result<&[ZoneDescriptor]> {
        let partitioner = self.partitioner;
        let record = self.record_mut(controller)?;
        if record.zones_dirty {
            compute_zones(&partitioner, host, pools, record)?;
        }
        Ok(&record.zones)
    }

    pub fn invalidate_zones(&mut self, controller: EntityId) -> Result<()> {
        self.record_mut(controller)?.zones_dirty = true;
        Ok(())
    }

    /// Operator reset: back through `NeedsInit` to `Idle` with a clean
    /// attempt history.
    pub fn reinitialize(
        &mut self,
        host: &dyn WorldHost,
        pools: &BufferPools,
        controller: EntityId,
    ) -> Result<()> {
        let partitioner = self.partitioner;
        let record = self.record_mut(controller)?;
        if record.state.is_in_flight() {
            return Err(EngineError::InvalidState {
                id: controller,
                state: record.state,
            });
        }
        record.state = RecordState::NeedsInit;
        record.attempts.clear();
        record.last_error = None;
        record.zones_dirty = true;
        compute_zones(&partitioner, host, pools, record)?;
        record.state = RecordState::Idle;
        tracing::info!(controller = %controller, "record reinitialized");
        Ok(())
    }

    /// Ids of records whose zones touch any of `zones`, refreshing dirty
    /// caches on the way.
    pub fn colliding(
        &mut self,
        host: &dyn WorldHost,
        pools: &BufferPools,
        zones: &[ZoneDescriptor],
    ) -> Result<Vec<EntityId>> {
        let mut hits = Vec::new();
        for id in self.ids() {
            let own = self.refresh_zones(host, pools, id)?;
            if own.iter().any(|a| zones.iter().any(|b| a.intersects(b))) {
                hits.push(id);
            }
        }
        Ok(hits)
    }

    // ========================================================================
    // Capture bookkeeping
    // ========================================================================

    pub(crate) fn begin_capture(&mut self, controller: EntityId, now: DateTime<Utc>) -> Result<()> {
        let record = self.record_mut(controller)?;
        record.capture_started_at = Some(now);
        record.capture_log_len = record.change_log.len();
        self.update(controller, RecordState::Processing)?;
        Ok(())
    }

    pub(crate) fn mark_saved(&mut self, controller: EntityId, now: DateTime<Utc>) -> Result<()> {
        let record = self.record_mut(controller)?;
        record.attempts.push(SaveAttempt { at: now, success: true });
        record.last_saved_at = Some(now);
        record.last_error = None;
        self.update(controller, RecordState::SaveSuccess)?;
        Ok(())
    }

    pub(crate) fn mark_failed(
        &mut self,
        controller: EntityId,
        now: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let record = self.record_mut(controller)?;
        record.attempts.push(SaveAttempt {
            at: now,
            success: false,
        });
        record.last_error = Some(error.to_string());
        self.update(controller, RecordState::SaveFailure)?;
        Ok(())
    }
}

fn compute_zones(
    partitioner: &ZonePartitioner,
    host: &dyn WorldHost,
    pools: &BufferPools,
    record: &mut ControllerRecord,
) -> Result<()> {
    let mut points = pools.points.acquire();
    host.structural_points(record.id, &mut points)?;
    record.zones.clear();
    partitioner.partition_into(&points, &mut record.zones);
    record.zones_dirty = false;
    Ok(())
}
