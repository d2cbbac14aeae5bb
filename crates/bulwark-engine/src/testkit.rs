//! In-memory host for tests and demos.
//!
//! `MockWorld` keeps objects in a map and answers sphere queries by brute
//! force. It can charge virtual time per query against a shared
//! `ManualClock` (to exercise time slicing) and inject query or spawn
//! failures.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bulwark_model::{
    BuildingGrade, EntityId, ObjectKind, PersistedObject, PropertyValue, Transform, UserId, Vec3,
    WorldObject, ZoneDescriptor,
};

use crate::clock::ManualClock;
use crate::error::HostError;
use crate::host::{QueryKind, WorldHost};

pub const CONTROLLER_TYPE: &str = "cupboard";
pub const BLOCK_TYPE: &str = "foundation";
const DEFAULT_MAX_HEALTH: f32 = 500.0;

#[derive(Debug, Default)]
pub struct MockWorld {
    objects: BTreeMap<EntityId, WorldObject>,
    next_id: u64,
    authorized: HashMap<EntityId, Vec<UserId>>,
    query_cost: Option<(Arc<ManualClock>, Duration)>,
    fail_queries: bool,
    fail_spawns: HashSet<String>,
    queries: Cell<usize>,
}

impl MockWorld {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Every sphere query advances `clock` by `cost`.
    pub fn with_query_cost(mut self, clock: Arc<ManualClock>, cost: Duration) -> Self {
        self.query_cost = Some((clock, cost));
        self
    }

    pub fn set_query_cost(&mut self, clock: Arc<ManualClock>, cost: Duration) {
        self.query_cost = Some((clock, cost));
    }

    pub fn fail_queries(&mut self, fail: bool) {
        self.fail_queries = fail;
    }

    pub fn fail_spawns_of(&mut self, type_name: &str) {
        self.fail_spawns.insert(type_name.to_string());
    }

    pub fn query_count(&self) -> usize {
        self.queries.get()
    }

    pub fn insert(&mut self, mut object: WorldObject) -> EntityId {
        if object.id.0 == 0 {
            object.id = self.allocate_id();
        } else {
            self.next_id = self.next_id.max(object.id.0 + 1);
        }
        let id = object.id;
        self.objects.insert(id, object);
        id
    }

    fn allocate_id(&mut self) -> EntityId {
        let id = EntityId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        id
    }

    pub fn add_controller(&mut self, position: Vec3) -> EntityId {
        self.add_object(ObjectKind::Controller, CONTROLLER_TYPE, position, None, None)
    }

    /// A structural block belonging to `controller`, owned like it.
    pub fn add_block(&mut self, controller: EntityId, position: Vec3) -> EntityId {
        let owner = self.objects.get(&controller).and_then(|c| c.owner);
        let id = self.add_object(
            ObjectKind::BuildingBlock,
            BLOCK_TYPE,
            position,
            Some(controller),
            owner,
        );
        if let Some(block) = self.objects.get_mut(&id) {
            block.grade = Some(BuildingGrade::Stone);
        }
        id
    }

    pub fn add_object(
        &mut self,
        kind: ObjectKind,
        type_name: &str,
        position: Vec3,
        controller: Option<EntityId>,
        owner: Option<UserId>,
    ) -> EntityId {
        let object = WorldObject {
            id: EntityId(0),
            kind,
            type_name: type_name.to_string(),
            template: format!("assets/{type_name}.prefab"),
            owner,
            controller,
            transform: Transform::at(position),
            bounds_radius: 1.0,
            grade: None,
            health: DEFAULT_MAX_HEALTH,
            max_health: DEFAULT_MAX_HEALTH,
            inventory: None,
            skin: 0,
            flags: 0,
            destroyed: false,
        };
        self.insert(object)
    }

    pub fn get(&self, id: EntityId) -> Option<&WorldObject> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut WorldObject> {
        self.objects.get_mut(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<WorldObject> {
        self.objects.remove(&id)
    }

    pub fn set_authorized(&mut self, controller: EntityId, users: Vec<UserId>) {
        self.authorized.insert(controller, users);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = &WorldObject> + '_ {
        self.objects.values()
    }

    /// Live objects whose type is `type_name`.
    pub fn count_of(&self, type_name: &str) -> usize {
        self.objects
            .values()
            .filter(|o| !o.destroyed && o.type_name == type_name)
            .count()
    }

    fn charge_query(&self) -> Result<(), HostError> {
        self.queries.set(self.queries.get() + 1);
        if let Some((clock, cost)) = &self.query_cost {
            clock.advance(*cost);
        }
        if self.fail_queries {
            return Err(HostError::Other("sphere query failed".into()));
        }
        Ok(())
    }
}

fn restore_into(object: &mut WorldObject, record: &PersistedObject) {
    object.kind = record.kind;
    object.type_name = record.type_name.clone();
    object.template = record.template.clone();
    object.owner = record.owner;
    object.transform = record.transform;
    object.bounds_radius = record.radius;
    object.grade = record.grade();
    object.health = record.health_fraction().unwrap_or(1.0) * object.max_health;
    object.inventory = record.inventory().cloned();
    object.skin = match record.property("skin") {
        Some(PropertyValue::UInt(skin)) => *skin,
        _ => 0,
    };
    object.flags = match record.property("flags") {
        Some(PropertyValue::UInt(flags)) => *flags as u32,
        _ => 0,
    };
}

impl WorldHost for MockWorld {
    fn objects_in_sphere(
        &self,
        zone: &ZoneDescriptor,
        kind: QueryKind,
        out: &mut Vec<WorldObject>,
    ) -> Result<(), HostError> {
        self.charge_query()?;
        out.extend(
            self.objects
                .values()
                .filter(|o| !o.destroyed && zone.contains(o.transform.position))
                .filter(|o| kind == QueryKind::Any || o.kind == ObjectKind::Controller)
                .cloned(),
        );
        Ok(())
    }

    fn object(&self, id: EntityId) -> Option<WorldObject> {
        self.objects.get(&id).cloned()
    }

    fn structural_points(
        &self,
        controller: EntityId,
        out: &mut Vec<Vec3>,
    ) -> Result<(), HostError> {
        let root = self
            .objects
            .get(&controller)
            .ok_or(HostError::MissingObject(controller))?;
        out.push(root.transform.position);
        out.extend(
            self.objects
                .values()
                .filter(|o| !o.destroyed && o.is_structural() && o.controller == Some(controller))
                .map(|o| o.transform.position),
        );
        Ok(())
    }

    fn authorized_users(&self, controller: EntityId) -> Vec<UserId> {
        self.authorized.get(&controller).cloned().unwrap_or_default()
    }

    fn destroy(&mut self, id: EntityId) -> Result<(), HostError> {
        self.objects
            .remove(&id)
            .map(|_| ())
            .ok_or(HostError::MissingObject(id))
    }

    fn spawn(&mut self, record: &PersistedObject) -> Result<EntityId, HostError> {
        if self.fail_spawns.contains(&record.type_name) {
            return Err(HostError::SpawnFailed {
                type_name: record.type_name.clone(),
                reason: "spawn rejected".into(),
            });
        }
        let mut object = WorldObject {
            id: EntityId(0),
            kind: record.kind,
            type_name: String::new(),
            template: String::new(),
            owner: None,
            controller: None,
            transform: Transform::default(),
            bounds_radius: 0.0,
            grade: None,
            health: DEFAULT_MAX_HEALTH,
            max_health: DEFAULT_MAX_HEALTH,
            inventory: None,
            skin: 0,
            flags: 0,
            destroyed: false,
        };
        restore_into(&mut object, record);
        Ok(self.insert(object))
    }

    fn apply(&mut self, id: EntityId, record: &PersistedObject) -> Result<(), HostError> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(HostError::MissingObject(id))?;
        restore_into(object, record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_query_filters_by_kind_and_distance() {
        let mut world = MockWorld::new();
        let c = world.add_controller(Vec3::ZERO);
        world.add_block(c, Vec3::new(5.0, 0.0, 0.0));
        world.add_block(c, Vec3::new(50.0, 0.0, 0.0));

        let zone = ZoneDescriptor::new(Vec3::ZERO, 10.0);
        let mut out = Vec::new();
        world.objects_in_sphere(&zone, QueryKind::Any, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        out.clear();
        world
            .objects_in_sphere(&zone, QueryKind::Controllers, &mut out)
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(world.query_count(), 2);
    }

    #[test]
    fn structural_points_start_with_controller() {
        let mut world = MockWorld::new();
        let c = world.add_controller(Vec3::new(1.0, 1.0, 1.0));
        world.add_block(c, Vec3::new(2.0, 1.0, 1.0));
        let mut points = Vec::new();
        world.structural_points(c, &mut points).unwrap();
        assert_eq!(points, vec![Vec3::new(1.0, 1.0, 1.0), Vec3::new(2.0, 1.0, 1.0)]);
    }
}
