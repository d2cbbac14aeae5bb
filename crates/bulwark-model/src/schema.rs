//! Declarative capture schema.
//!
//! Each object kind has a static table of `FieldSpec`s: a property name, the
//! value kind it must hold, when it is included, and a plain `fn` accessor
//! that reads it from a live `WorldObject`. Capture walks the table; decoding
//! validates a payload against the same table, so the two sides cannot drift.

use thiserror::Error;

use crate::object::{ObjectKind, PersistedObject, Property, PropertyValue, WorldObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Grade,
    Inventory,
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Bool(_) => ValueKind::Bool,
            PropertyValue::Int(_) => ValueKind::Int,
            PropertyValue::UInt(_) => ValueKind::UInt,
            PropertyValue::Float(_) => ValueKind::Float,
            PropertyValue::Text(_) => ValueKind::Text,
            PropertyValue::Grade(_) => ValueKind::Grade,
            PropertyValue::Inventory(_) => ValueKind::Inventory,
        }
    }

    fn is_zero(&self) -> bool {
        match self {
            PropertyValue::Bool(b) => !*b,
            PropertyValue::Int(i) => *i == 0,
            PropertyValue::UInt(u) => *u == 0,
            PropertyValue::Float(f) => *f == 0.0,
            PropertyValue::Text(s) => s.is_empty(),
            PropertyValue::Grade(_) => false,
            PropertyValue::Inventory(inv) => inv.slots.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inclusion {
    Always,
    /// Only when the object is below full health.
    WhenDamaged,
    /// Only when the value differs from its zero/empty default.
    WhenNonZero,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: ValueKind,
    pub inclusion: Inclusion,
    pub read: fn(&WorldObject) -> Option<PropertyValue>,
}

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("property `{name}` is not declared for {kind:?} objects")]
    UndeclaredProperty { kind: ObjectKind, name: String },

    #[error("property `{name}` holds {found:?}, schema declares {expected:?}")]
    PropertyKindMismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("object {id} has a non-finite transform or radius")]
    NonFiniteGeometry { id: String },
}

// ============================================================================
// Accessors
// ============================================================================

fn read_grade(o: &WorldObject) -> Option<PropertyValue> {
    o.grade.map(PropertyValue::Grade)
}

fn read_health_fraction(o: &WorldObject) -> Option<PropertyValue> {
    Some(PropertyValue::Float(o.health_fraction()))
}

fn read_inventory(o: &WorldObject) -> Option<PropertyValue> {
    o.inventory.clone().map(PropertyValue::Inventory)
}

fn read_skin(o: &WorldObject) -> Option<PropertyValue> {
    Some(PropertyValue::UInt(o.skin))
}

fn read_flags(o: &WorldObject) -> Option<PropertyValue> {
    Some(PropertyValue::UInt(o.flags as u64))
}

// ============================================================================
// Field tables
// ============================================================================

const GRADE: FieldSpec = FieldSpec {
    name: "grade",
    kind: ValueKind::Grade,
    inclusion: Inclusion::Always,
    read: read_grade,
};

const HEALTH: FieldSpec = FieldSpec {
    name: "health_fraction",
    kind: ValueKind::Float,
    inclusion: Inclusion::WhenDamaged,
    read: read_health_fraction,
};

const INVENTORY: FieldSpec = FieldSpec {
    name: "inventory",
    kind: ValueKind::Inventory,
    inclusion: Inclusion::Always,
    read: read_inventory,
};

const SKIN: FieldSpec = FieldSpec {
    name: "skin",
    kind: ValueKind::UInt,
    inclusion: Inclusion::WhenNonZero,
    read: read_skin,
};

const FLAGS: FieldSpec = FieldSpec {
    name: "flags",
    kind: ValueKind::UInt,
    inclusion: Inclusion::WhenNonZero,
    read: read_flags,
};

static CONTROLLER_FIELDS: &[FieldSpec] = &[HEALTH, INVENTORY, SKIN, FLAGS];
static BUILDING_BLOCK_FIELDS: &[FieldSpec] = &[GRADE, HEALTH, SKIN, FLAGS];
static DEPLOYABLE_FIELDS: &[FieldSpec] = &[HEALTH, INVENTORY, SKIN, FLAGS];
static COLLECTIBLE_FIELDS: &[FieldSpec] = &[FLAGS];
static OTHER_FIELDS: &[FieldSpec] = &[HEALTH, SKIN, FLAGS];

pub fn fields_for(kind: ObjectKind) -> &'static [FieldSpec] {
    match kind {
        ObjectKind::Controller => CONTROLLER_FIELDS,
        ObjectKind::BuildingBlock => BUILDING_BLOCK_FIELDS,
        ObjectKind::Deployable => DEPLOYABLE_FIELDS,
        ObjectKind::Collectible => COLLECTIBLE_FIELDS,
        ObjectKind::Other => OTHER_FIELDS,
    }
}

/// Capture a live object into its persisted form.
pub fn capture(object: &WorldObject) -> PersistedObject {
    let mut properties = Vec::new();
    for spec in fields_for(object.kind) {
        let Some(value) = (spec.read)(object) else {
            continue;
        };
        let include = match spec.inclusion {
            Inclusion::Always => true,
            Inclusion::WhenDamaged => object.health_fraction() < 1.0,
            Inclusion::WhenNonZero => !value.is_zero(),
        };
        if include {
            properties.push(Property {
                name: spec.name.to_string(),
                value,
            });
        }
    }

    PersistedObject {
        id: object.persistence_id(),
        kind: object.kind,
        type_name: object.type_name.clone(),
        template: object.template.clone(),
        owner: object.owner,
        transform: object.transform,
        radius: object.bounds_radius,
        properties,
    }
}

/// Check a decoded object against its kind's field table.
pub fn validate(object: &PersistedObject) -> Result<(), ModelError> {
    if !object.transform.position.is_finite() || !object.radius.is_finite() {
        return Err(ModelError::NonFiniteGeometry {
            id: object.id.to_string(),
        });
    }
    let fields = fields_for(object.kind);
    for property in &object.properties {
        let Some(spec) = fields.iter().find(|f| f.name == property.name) else {
            return Err(ModelError::UndeclaredProperty {
                kind: object.kind,
                name: property.name.clone(),
            });
        };
        let found = property.value.kind();
        if found != spec.kind {
            return Err(ModelError::PropertyKindMismatch {
                name: property.name.clone(),
                expected: spec.kind,
                found,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Transform, Vec3};
    use crate::ids::EntityId;
    use crate::object::{BuildingGrade, Inventory, ItemStack};

    fn block(health: f32) -> WorldObject {
        WorldObject {
            id: EntityId(7),
            kind: ObjectKind::BuildingBlock,
            type_name: "wall".into(),
            template: "assets/wall.prefab".into(),
            owner: None,
            controller: None,
            transform: Transform::at(Vec3::new(1.0, 2.0, 3.0)),
            bounds_radius: 2.0,
            grade: Some(BuildingGrade::Stone),
            health,
            max_health: 500.0,
            inventory: None,
            skin: 0,
            flags: 0,
            destroyed: false,
        }
    }

    #[test]
    fn full_health_block_captures_grade_only() {
        let captured = capture(&block(500.0));
        assert_eq!(captured.properties.len(), 1);
        assert_eq!(captured.grade(), Some(BuildingGrade::Stone));
        assert!(captured.health_fraction().is_none());
    }

    #[test]
    fn damaged_block_captures_health_fraction() {
        let captured = capture(&block(250.0));
        assert_eq!(captured.health_fraction(), Some(0.5));
    }

    #[test]
    fn deployable_keeps_nested_inventory() {
        let mut obj = block(100.0);
        obj.kind = ObjectKind::Deployable;
        obj.max_health = 100.0;
        obj.inventory = Some(Inventory {
            capacity: 12,
            slots: vec![ItemStack {
                item: "backpack".into(),
                amount: 1,
                skin: 0,
                contents: Some(Inventory {
                    capacity: 6,
                    slots: vec![ItemStack {
                        item: "scrap".into(),
                        amount: 50,
                        skin: 0,
                        contents: None,
                    }],
                }),
            }],
        });
        let captured = capture(&obj);
        assert_eq!(captured.inventory().map(Inventory::stack_count), Some(2));
        assert!(validate(&captured).is_ok());
    }

    #[test]
    fn validate_rejects_mismatched_kind() {
        let mut captured = capture(&block(500.0));
        captured.properties[0].value = PropertyValue::Text("stone".into());
        assert!(matches!(
            validate(&captured),
            Err(ModelError::PropertyKindMismatch { .. })
        ));
    }

    #[test]
    fn validate_rejects_undeclared_property() {
        let mut captured = capture(&block(500.0));
        captured.kind = ObjectKind::Collectible;
        assert!(matches!(
            validate(&captured),
            Err(ModelError::UndeclaredProperty { .. })
        ));
    }
}
