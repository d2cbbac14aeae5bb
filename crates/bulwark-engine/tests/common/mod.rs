//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use bulwark_engine::testkit::MockWorld;
use bulwark_engine::{
    BackupConfig, BackupService, BufferPools, Clock, ManualClock, PipelineContext, RecordTable,
    SliceOutcome, SnapshotPipeline,
};
use bulwark_model::{EntityId, PersistenceId, Vec3};
use bulwark_storage::SnapshotStore;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
}

/// A controller at `origin` with `blocks` foundations laid out along +x.
pub fn build_base(world: &mut MockWorld, origin: Vec3, blocks: usize) -> EntityId {
    let controller = world.add_controller(origin);
    for i in 0..blocks {
        world.add_block(controller, origin + Vec3::new(3.0 * (i + 1) as f32, 0.0, 0.0));
    }
    controller
}

/// Engine pieces wired together by hand, for driving pipelines directly.
pub struct Fixture {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub world: MockWorld,
    pub records: RecordTable,
    pub store: SnapshotStore,
    pub pools: BufferPools,
    pub config: BackupConfig,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(BackupConfig::default())
    }

    pub fn with_config(mut config: BackupConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.storage.root = dir.path().to_path_buf();
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SnapshotStore::open(config.storage.clone(), clock.now()).unwrap();
        let records = RecordTable::new(config.partitioner().unwrap());
        Self {
            dir,
            clock,
            world: MockWorld::new(),
            records,
            store,
            pools: BufferPools::new(),
            config,
        }
    }

    pub fn ctx(&mut self) -> PipelineContext<'_> {
        PipelineContext {
            host: &mut self.world,
            records: &mut self.records,
            store: &self.store,
            pools: &self.pools,
            clock: &*self.clock,
            config: &self.config,
        }
    }

    pub fn track(&mut self, controller: EntityId) {
        let object = self.world.get(controller).unwrap().clone();
        self.records
            .start_recording(&self.world, &self.pools, &object)
            .unwrap();
    }

    /// Build and track a base.
    pub fn base(&mut self, origin: Vec3, blocks: usize) -> EntityId {
        let controller = build_base(&mut self.world, origin, blocks);
        self.track(controller);
        controller
    }

    /// Start `pipeline` and slice it until it finishes; returns whether it
    /// succeeded.
    pub fn run(&mut self, pipeline: &mut SnapshotPipeline) -> bool {
        pipeline.start(&mut self.ctx()).unwrap();
        self.finish(pipeline)
    }

    pub fn finish(&mut self, pipeline: &mut SnapshotPipeline) -> bool {
        for _ in 0..10_000 {
            if let SliceOutcome::Completed { success } = pipeline.run_slice(&mut self.ctx()) {
                return success;
            }
        }
        panic!("pipeline never finished");
    }

    /// Persistence ids of every object in a stored snapshot, sorted.
    pub fn captured_ids(&self, snapshot: uuid::Uuid) -> Vec<PersistenceId> {
        let meta = self.store.get(snapshot).unwrap();
        let payload = self.store.read_payload(&meta).unwrap();
        let mut ids: Vec<PersistenceId> = payload.objects().map(|o| o.id).collect();
        ids.sort();
        ids
    }
}

/// A `BackupService` over a `MockWorld`, with a manual clock.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub world: MockWorld,
    pub service: BackupService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(BackupConfig::default())
    }

    pub fn with_config(mut config: BackupConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        config.storage.root = dir.path().to_path_buf();
        let clock = Arc::new(ManualClock::new(t0()));
        let service = BackupService::new(config, clock.clone()).unwrap();
        Self {
            dir,
            clock,
            world: MockWorld::new(),
            service,
        }
    }

    /// Build a base and register its controller with the service.
    pub fn base(&mut self, origin: Vec3, blocks: usize) -> EntityId {
        let controller = build_base(&mut self.world, origin, blocks);
        let objects: Vec<_> = self.world.objects().cloned().collect();
        self.service.scan(&self.world, &objects);
        controller
    }

    pub fn tick(&mut self) -> bulwark_engine::TickReport {
        self.service.tick(&mut self.world)
    }

    /// Tick (advancing the clock one interval each time) until `done`
    /// returns true.
    pub fn tick_until(&mut self, mut done: impl FnMut(&bulwark_engine::TickReport) -> bool) {
        for _ in 0..1_000 {
            let report = self.tick();
            if done(&report) {
                return;
            }
            self.clock.advance_secs(1);
        }
        panic!("condition never reached");
    }
}
