//! Tick-driven dispatch.
//!
//! Every tick the scheduler first moves records along the time-based edges
//! of the state machine (retry, save delay, post-save resolution). Then it
//! either drives the active job for one slice or, if the slot is free,
//! dispatches the next one: a pending rollback first, otherwise the lowest
//! `Queued` record. A tick that finishes a job never dispatches another.

use std::collections::VecDeque;

use bulwark_model::EntityId;
use chrono::{DateTime, Utc};

use crate::error::{EngineError, Result};
use crate::pipeline::{BackupOutcome, PipelineContext, SliceOutcome, SnapshotPipeline};
use crate::rollback::{RollbackReport, RollbackTask};
use crate::tracker::{RecordState, RecordTable};

/// A job occupying the single slot.
#[derive(Debug)]
pub enum Job {
    Backup(SnapshotPipeline),
    Rollback(RollbackTask),
}

#[derive(Debug, Clone)]
pub enum JobOutcome {
    Backup(BackupOutcome),
    Rollback(RollbackReport),
}

/// A time-based state change applied during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    pub controller: EntityId,
    pub from: RecordState,
    pub to: RecordState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    DispatchedBackup(EntityId),
    DispatchedRollback(uuid::Uuid),
    Yielded,
    Completed { success: bool },
}

#[derive(Debug)]
pub struct TickReport {
    pub promotions: Vec<Promotion>,
    pub outcome: TickOutcome,
    pub finished: Option<JobOutcome>,
}

#[derive(Debug)]
pub struct SnapshotScheduler {
    save_delay: chrono::Duration,
    max_retries: u32,
    active: Option<Job>,
    pending_rollbacks: VecDeque<RollbackTask>,
}

impl SnapshotScheduler {
    pub fn new(save_delay: chrono::Duration, max_retries: u32) -> Self {
        Self {
            save_delay,
            max_retries,
            active: None,
            pending_rollbacks: VecDeque::new(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    pub fn active(&self) -> Option<&Job> {
        self.active.as_ref()
    }

    pub fn pending_rollbacks(&self) -> usize {
        self.pending_rollbacks.len()
    }

    pub fn enqueue_rollback(&mut self, task: RollbackTask) {
        self.pending_rollbacks.push_back(task);
    }

    /// Queue a record now, ignoring the save delay.
    pub fn request_backup(&self, records: &mut RecordTable, controller: EntityId) -> Result<()> {
        let state = records
            .get(controller)
            .map(|r| r.state())
            .ok_or(EngineError::UnknownController(controller))?;
        if !state.is_claimable() {
            return Err(EngineError::InvalidState {
                id: controller,
                state,
            });
        }
        records.update(controller, RecordState::Queued)?;
        Ok(())
    }

    /// Apply the time-based transitions for every record.
    pub fn promote(&self, records: &mut RecordTable, now: DateTime<Utc>) -> Vec<Promotion> {
        let mut promotions = Vec::new();
        for id in records.ids() {
            let Some(record) = records.get(id) else {
                continue;
            };
            let from = record.state();
            let to = match from {
                RecordState::SaveFailure if record.retry_count() >= self.max_retries => {
                    RecordState::RetryLimitExceeded
                }
                RecordState::SaveFailure => RecordState::Queued,
                RecordState::SaveSuccess if record.changed_since_capture() => RecordState::Modified,
                RecordState::SaveSuccess => RecordState::Idle,
                RecordState::Modified => {
                    let due = record
                        .last_saved_at()
                        .map_or(true, |saved| now - saved >= self.save_delay);
                    if !due {
                        continue;
                    }
                    RecordState::Queued
                }
                _ => continue,
            };
            if to == RecordState::RetryLimitExceeded {
                tracing::warn!(
                    controller = %id,
                    attempts = record.attempts().len(),
                    error = record.last_error().unwrap_or(""),
                    "retry limit exceeded"
                );
            }
            if records.update(id, to).is_ok() {
                promotions.push(Promotion {
                    controller: id,
                    from,
                    to,
                });
            }
        }

        // A success resolved to Modified may already be due.
        let resolved: Vec<EntityId> = promotions
            .iter()
            .filter(|p| p.from == RecordState::SaveSuccess && p.to == RecordState::Modified)
            .map(|p| p.controller)
            .collect();
        for id in resolved {
            let due = records
                .get(id)
                .and_then(|r| r.last_saved_at())
                .map_or(true, |saved| now - saved >= self.save_delay);
            if due && records.update(id, RecordState::Queued).is_ok() {
                promotions.push(Promotion {
                    controller: id,
                    from: RecordState::Modified,
                    to: RecordState::Queued,
                });
            }
        }
        promotions
    }

    pub fn next_queued(records: &RecordTable) -> Option<EntityId> {
        records
            .iter()
            .find(|r| r.state() == RecordState::Queued)
            .map(|r| r.id)
    }

    pub fn tick(&mut self, ctx: &mut PipelineContext<'_>) -> TickReport {
        let now = ctx.clock.now();
        let promotions = self.promote(ctx.records, now);

        if let Some(job) = self.active.as_mut() {
            let slice = match job {
                Job::Backup(pipeline) => pipeline.run_slice(ctx),
                Job::Rollback(task) => task.run_slice(ctx),
            };
            return match slice {
                SliceOutcome::Yielded => TickReport {
                    promotions,
                    outcome: TickOutcome::Yielded,
                    finished: None,
                },
                SliceOutcome::Completed { success } => {
                    let finished = self.active.take().map(|job| match job {
                        Job::Backup(pipeline) => JobOutcome::Backup(pipeline.outcome()),
                        Job::Rollback(task) => JobOutcome::Rollback(task.report().clone()),
                    });
                    TickReport {
                        promotions,
                        outcome: TickOutcome::Completed { success },
                        finished,
                    }
                }
            };
        }

        let (outcome, finished) = self.dispatch(ctx);
        TickReport {
            promotions,
            outcome,
            finished,
        }
    }

    fn dispatch(&mut self, ctx: &mut PipelineContext<'_>) -> (TickOutcome, Option<JobOutcome>) {
        if let Some(task) = self.pending_rollbacks.pop_front() {
            let snapshot = task.snapshot();
            self.active = Some(Job::Rollback(task));
            return (TickOutcome::DispatchedRollback(snapshot), None);
        }

        let Some(root) = Self::next_queued(ctx.records) else {
            return (TickOutcome::Idle, None);
        };
        let mut pipeline = SnapshotPipeline::new(vec![root]);
        match pipeline.start(ctx) {
            Ok(()) => {
                self.active = Some(Job::Backup(pipeline));
                (TickOutcome::DispatchedBackup(root), None)
            }
            Err(err) => {
                // Count it as a failed attempt so the retry limit applies.
                let message = err.to_string();
                tracing::warn!(controller = %root, error = %message, "could not start backup");
                let _ = ctx.records.mark_failed(root, ctx.clock.now(), &message);
                let outcome = BackupOutcome {
                    success: false,
                    linked: vec![root],
                    metadata: None,
                    error: Some(message),
                    stats: pipeline.stats(),
                };
                (TickOutcome::Idle, Some(JobOutcome::Backup(outcome)))
            }
        }
    }
}
