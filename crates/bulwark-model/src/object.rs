//! World objects as the host reports them, and as a snapshot stores them.

use serde::{Deserialize, Serialize};

use crate::geometry::Transform;
use crate::ids::{EntityId, PersistenceId, UserId};

/// Coarse classification the engine filters and captures by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Anchors and authorizes a structure (defines its build area).
    Controller,
    /// Walls, floors, foundations: the points zones are computed from.
    BuildingBlock,
    /// Placed items: boxes, doors, furnaces.
    Deployable,
    /// Harvestable world items lying on the ground.
    Collectible,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BuildingGrade {
    Twig,
    Wood,
    Stone,
    Metal,
    Armored,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub amount: u32,
    pub skin: u64,
    /// Containers (backpacks, weapons with attachments) carry their own
    /// contents.
    pub contents: Option<Inventory>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Inventory {
    pub capacity: u32,
    pub slots: Vec<ItemStack>,
}

impl Inventory {
    /// Number of stacks, counting nested containers.
    pub fn stack_count(&self) -> usize {
        self.slots
            .iter()
            .map(|s| 1 + s.contents.as_ref().map_or(0, Inventory::stack_count))
            .sum()
    }
}

/// Snapshot of a live object, produced by the host on every query.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldObject {
    pub id: EntityId,
    pub kind: ObjectKind,
    pub type_name: String,
    pub template: String,
    pub owner: Option<UserId>,
    /// Controller whose build area covers this object, if any.
    pub controller: Option<EntityId>,
    pub transform: Transform,
    pub bounds_radius: f32,
    pub grade: Option<BuildingGrade>,
    pub health: f32,
    pub max_health: f32,
    pub inventory: Option<Inventory>,
    pub skin: u64,
    pub flags: u32,
    pub destroyed: bool,
}

impl WorldObject {
    pub fn persistence_id(&self) -> PersistenceId {
        PersistenceId::derive(&self.type_name, self.transform.position)
    }

    pub fn health_fraction(&self) -> f32 {
        if self.max_health <= 0.0 {
            return 1.0;
        }
        (self.health / self.max_health).clamp(0.0, 1.0)
    }

    pub fn is_structural(&self) -> bool {
        self.kind == ObjectKind::BuildingBlock
    }
}

/// Closed set of property value kinds a snapshot can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Text(String),
    Grade(BuildingGrade),
    Inventory(Inventory),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

/// An object as recorded in a snapshot payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedObject {
    pub id: PersistenceId,
    pub kind: ObjectKind,
    pub type_name: String,
    pub template: String,
    pub owner: Option<UserId>,
    pub transform: Transform,
    /// Collision radius derived from the object's bounds; rollback searches
    /// the live world within this radius of the recorded position.
    pub radius: f32,
    pub properties: Vec<Property>,
}

impl PersistedObject {
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }

    pub fn grade(&self) -> Option<BuildingGrade> {
        match self.property("grade") {
            Some(PropertyValue::Grade(g)) => Some(*g),
            _ => None,
        }
    }

    pub fn health_fraction(&self) -> Option<f32> {
        match self.property("health_fraction") {
            Some(PropertyValue::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn inventory(&self) -> Option<&Inventory> {
        match self.property("inventory") {
            Some(PropertyValue::Inventory(inv)) => Some(inv),
            _ => None,
        }
    }
}
