//! Per-snapshot leases.
//!
//! A player must hold a snapshot's handle to preview or roll it back:
//!
//! ```text
//!   request_lock ─► Idle (code issued) ─► PreviewZones / PreviewRollback
//!         │                                       │
//!         └──────────── confirm_lock(code) ◄──────┘
//!                              │
//!                            Locked ─► ProcessRollback ─► (released)
//! ```
//!
//! At most one handle exists per snapshot. Another player can take it over
//! only after it expires or is released. Handles in `ProcessRollback` do not
//! expire while their rollback runs.

use std::collections::HashMap;

use bulwark_model::UserId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::rollback::PlanSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    Idle,
    PreviewZones,
    PreviewRollback,
    ProcessRollback,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle {
    pub snapshot: Uuid,
    pub owner: UserId,
    pub state: HandleState,
    pub confirmation: Option<String>,
    pub modified_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub preview: Option<PlanSummary>,
}

impl SnapshotHandle {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state != HandleState::ProcessRollback && self.expires_at <= now
    }
}

#[derive(Debug)]
pub struct HandleTable {
    handles: HashMap<Uuid, SnapshotHandle>,
    lease: Duration,
}

fn confirmation_code() -> String {
    format!("{:06}", Uuid::new_v4().as_u128() % 1_000_000)
}

impl HandleTable {
    pub fn new(lease: Duration) -> Self {
        Self {
            handles: HashMap::new(),
            lease,
        }
    }

    pub fn get(&self, snapshot: Uuid) -> Option<&SnapshotHandle> {
        self.handles.get(&snapshot)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Claim (or renew) the handle for `snapshot` and return a fresh
    /// confirmation code. A confirmed lock is never downgraded by its holder.
    pub fn request_lock(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if let Some(existing) = self.handles.get(&snapshot) {
            if existing.state == HandleState::ProcessRollback {
                return Err(EngineError::HandleBusy(snapshot));
            }
            if !existing.is_expired(now) {
                if existing.owner != user {
                    return Err(EngineError::LeaseHeld {
                        snapshot,
                        holder: existing.owner,
                    });
                }
                if existing.state == HandleState::Locked {
                    return Err(EngineError::AlreadyLocked(snapshot));
                }
            }
        }

        let code = confirmation_code();
        let handle = SnapshotHandle {
            snapshot,
            owner: user,
            state: HandleState::Idle,
            confirmation: Some(code.clone()),
            modified_at: now,
            expires_at: now + self.lease,
            preview: None,
        };
        self.handles.insert(snapshot, handle);
        tracing::debug!(snapshot = %snapshot, user = %user, "snapshot lock requested");
        Ok(code)
    }

    /// Fail unless `user` holds a live handle on `snapshot` that is not
    /// running a rollback. Changes nothing.
    pub fn check_holder(&self, snapshot: Uuid, user: UserId, now: DateTime<Utc>) -> Result<()> {
        match self.handles.get(&snapshot) {
            Some(h) if h.owner != user => Err(EngineError::NotLeaseHolder { snapshot, user }),
            Some(h) if h.is_expired(now) => Err(EngineError::LeaseExpired(snapshot)),
            Some(h) if h.state == HandleState::ProcessRollback => {
                Err(EngineError::HandleBusy(snapshot))
            }
            Some(_) => Ok(()),
            None => Err(EngineError::NotLeaseHolder { snapshot, user }),
        }
    }

    /// The live handle `user` holds on `snapshot`.
    fn held_mut(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<&mut SnapshotHandle> {
        let Some(handle) = self.handles.get(&snapshot) else {
            return Err(EngineError::NotLeaseHolder { snapshot, user });
        };
        if handle.owner != user {
            return Err(EngineError::NotLeaseHolder { snapshot, user });
        }
        if handle.is_expired(now) {
            self.handles.remove(&snapshot);
            return Err(EngineError::LeaseExpired(snapshot));
        }
        self.handles
            .get_mut(&snapshot)
            .ok_or(EngineError::NotLeaseHolder { snapshot, user })
    }

    pub fn confirm_lock(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lease = self.lease;
        let handle = self.held_mut(snapshot, user, now)?;
        if handle.state == HandleState::ProcessRollback {
            return Err(EngineError::HandleBusy(snapshot));
        }
        if handle.confirmation.as_deref() != Some(code.trim()) {
            return Err(EngineError::ConfirmationMismatch);
        }
        handle.state = HandleState::Locked;
        handle.confirmation = None;
        handle.modified_at = now;
        handle.expires_at = now + lease;
        tracing::info!(snapshot = %snapshot, user = %user, "snapshot locked");
        Ok(())
    }

    /// Record a preview. A locked handle stays locked.
    pub fn set_preview(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        state: HandleState,
        summary: Option<PlanSummary>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let handle = self.held_mut(snapshot, user, now)?;
        match handle.state {
            HandleState::ProcessRollback => return Err(EngineError::HandleBusy(snapshot)),
            HandleState::Locked => {}
            _ => handle.state = state,
        }
        if summary.is_some() {
            handle.preview = summary;
        }
        handle.modified_at = now;
        Ok(())
    }

    /// Check the holder and move a locked handle to `ProcessRollback`.
    pub fn begin_rollback(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let handle = self.held_mut(snapshot, user, now)?;
        if handle.state != HandleState::Locked {
            return Err(EngineError::HandleNotLocked {
                snapshot,
                state: handle.state,
            });
        }
        handle.state = HandleState::ProcessRollback;
        handle.modified_at = now;
        Ok(())
    }

    pub fn finish_rollback(&mut self, snapshot: Uuid) -> Option<SnapshotHandle> {
        self.handles.remove(&snapshot)
    }

    pub fn release(
        &mut self,
        snapshot: Uuid,
        user: UserId,
        now: DateTime<Utc>,
    ) -> Result<SnapshotHandle> {
        let handle = self.held_mut(snapshot, user, now)?;
        if handle.state == HandleState::ProcessRollback {
            return Err(EngineError::HandleBusy(snapshot));
        }
        self.handles
            .remove(&snapshot)
            .ok_or(EngineError::NotLeaseHolder { snapshot, user })
    }

    /// Drop every expired handle and return them.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<SnapshotHandle> {
        let expired: Vec<Uuid> = self
            .handles
            .values()
            .filter(|h| h.is_expired(now))
            .map(|h| h.snapshot)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.handles.remove(&id))
            .inspect(|h| tracing::debug!(snapshot = %h.snapshot, owner = %h.owner, "lease expired"))
            .collect()
    }
}
