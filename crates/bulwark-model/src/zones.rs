//! Zone partitioning: cover a structure's footprint with bounded spheres.
//!
//! ```text
//!   points ──► group ──► centroid + max distance
//!                              │
//!               2·maxDist + zoneRadius ≤ maxRadius ?
//!                     │yes                │no
//!                emit zone          octant split ──► enqueue non-empty octants
//! ```
//!
//! The work queue is explicit (FIFO) rather than recursive so very large
//! structures cannot grow the call stack, and so the output order is a pure
//! function of the input order: zone lists are cached per structure and
//! compared against snapshots, which requires identical input to produce
//! identical output.
//!
//! Termination: a group whose points are not all equal always splits into at
//! least two octants. For the remaining cases (all points coincide, float
//! rounding keeps every point on one side, or the depth limit is hit) the
//! group falls back to one `zoneRadius` sphere per distinct point, which keeps
//! both invariants: every point is covered and no radius exceeds the maximum.

use std::collections::VecDeque;
use thiserror::Error;

use crate::geometry::{Vec3, ZoneDescriptor};

#[derive(Debug, Error, PartialEq)]
pub enum ZoneConfigError {
    #[error("zone radius must be positive and finite, got {0}")]
    InvalidZoneRadius(f32),

    #[error("max radius {max_radius} must be finite and at least the zone radius {zone_radius}")]
    InvalidMaxRadius { zone_radius: f32, max_radius: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZonePartitioner {
    zone_radius: f32,
    max_radius: f32,
    max_depth: u32,
}

impl ZonePartitioner {
    pub const DEFAULT_MAX_DEPTH: u32 = 16;

    pub fn new(zone_radius: f32, max_radius: f32) -> Result<Self, ZoneConfigError> {
        if !(zone_radius.is_finite() && zone_radius > 0.0) {
            return Err(ZoneConfigError::InvalidZoneRadius(zone_radius));
        }
        if !max_radius.is_finite() || max_radius < zone_radius {
            return Err(ZoneConfigError::InvalidMaxRadius {
                zone_radius,
                max_radius,
            });
        }
        Ok(Self {
            zone_radius,
            max_radius,
            max_depth: Self::DEFAULT_MAX_DEPTH,
        })
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn zone_radius(&self) -> f32 {
        self.zone_radius
    }

    pub fn max_radius(&self) -> f32 {
        self.max_radius
    }

    pub fn partition(&self, points: &[Vec3]) -> Vec<ZoneDescriptor> {
        let mut zones = Vec::new();
        self.partition_into(points, &mut zones);
        zones
    }

    /// Append the zones covering `points` to `out` (which is not cleared).
    pub fn partition_into(&self, points: &[Vec3], out: &mut Vec<ZoneDescriptor>) {
        self.run(points, |zone, _| out.push(zone));
    }

    /// Like `partition`, but also returns the indices of the input points
    /// each zone was computed from.
    pub fn partition_groups(&self, points: &[Vec3]) -> Vec<(ZoneDescriptor, Vec<usize>)> {
        let mut groups = Vec::new();
        self.run(points, |zone, members| groups.push((zone, members.to_vec())));
        groups
    }

    fn run(&self, points: &[Vec3], mut emit: impl FnMut(ZoneDescriptor, &[usize])) {
        // Non-finite positions cannot be covered by any sphere.
        let initial: Vec<usize> = (0..points.len())
            .filter(|&i| points[i].is_finite())
            .collect();
        if initial.is_empty() {
            return;
        }

        let mut queue: VecDeque<(Vec<usize>, u32)> = VecDeque::new();
        queue.push_back((initial, 0));
        let mut scratch: Vec<Vec3> = Vec::new();

        while let Some((group, depth)) = queue.pop_front() {
            scratch.clear();
            scratch.extend(group.iter().map(|&i| points[i]));
            let Some(centroid) = Vec3::centroid(&scratch) else {
                continue;
            };
            let max_distance = scratch
                .iter()
                .map(|p| centroid.distance(*p))
                .fold(0.0f32, f32::max);

            let candidate = 2.0 * max_distance + self.zone_radius;
            if candidate <= self.max_radius {
                emit(ZoneDescriptor::new(centroid, candidate), &group);
                continue;
            }

            if depth >= self.max_depth {
                self.emit_per_point(points, &group, &mut emit);
                continue;
            }

            let mut octants: [Vec<usize>; 8] = Default::default();
            for &i in &group {
                octants[octant_of(points[i], centroid)].push(i);
            }
            if octants.iter().filter(|o| !o.is_empty()).count() <= 1 {
                self.emit_per_point(points, &group, &mut emit);
                continue;
            }
            for octant in octants {
                if !octant.is_empty() {
                    queue.push_back((octant, depth + 1));
                }
            }
        }
    }

    fn emit_per_point(
        &self,
        points: &[Vec3],
        group: &[usize],
        emit: &mut impl FnMut(ZoneDescriptor, &[usize]),
    ) {
        let mut distinct: Vec<(Vec3, Vec<usize>)> = Vec::new();
        for &i in group {
            match distinct.iter_mut().find(|(p, _)| *p == points[i]) {
                Some((_, members)) => members.push(i),
                None => distinct.push((points[i], vec![i])),
            }
        }
        for (point, members) in distinct {
            emit(ZoneDescriptor::new(point, self.zone_radius), &members);
        }
    }
}

/// Octant index: bit 0 = x, bit 1 = y, bit 2 = z; set when the coordinate is
/// at or above the centroid.
fn octant_of(p: Vec3, centroid: Vec3) -> usize {
    let mut idx = 0;
    if p.x >= centroid.x {
        idx |= 1;
    }
    if p.y >= centroid.y {
        idx |= 2;
    }
    if p.z >= centroid.z {
        idx |= 4;
    }
    idx
}
