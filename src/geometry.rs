//! Geometry information

use crate::{
    comm::Communicator,
    constants::{MAX_COORD, MAX_LEVEL},
    error::DomainError,
    tools::gather_to_all,
};

/// A point in physical space.
pub type Point = [f64; 3];

/// Boundary condition of one axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum Boundary {
    /// Particles must stay within `[min, max]`.
    #[default]
    Open,
    /// Coordinates are wrapped into `[min, max)`.
    Periodic,
}

/// The global simulation box.
///
/// Every rank must hold a bit-identical copy for a given iteration, otherwise
/// keys and therefore the global tree diverge between ranks.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingBox {
    coords: [f64; 6],
    boundaries: [Boundary; 3],
}

impl BoundingBox {
    /// Create a new bounding box.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6], boundaries: [Boundary; 3]) -> Result<Self, DomainError> {
        for axis in 0..3 {
            let (min, max) = (coords[axis], coords[3 + axis]);
            if !min.is_finite() || !max.is_finite() || min >= max {
                return Err(DomainError::InvalidBox(format!(
                    "axis {axis} has extent [{min}, {max}]"
                )));
            }
        }
        Ok(Self { coords, boundaries })
    }

    /// A box with open boundaries on all axes.
    pub fn open(coords: [f64; 6]) -> Result<Self, DomainError> {
        Self::new(coords, [Boundary::Open; 3])
    }

    /// A box with periodic boundaries on all axes.
    pub fn periodic(coords: [f64; 6]) -> Result<Self, DomainError> {
        Self::new(coords, [Boundary::Periodic; 3])
    }

    /// The unit cube with the given boundary kind on every axis.
    pub fn unit(boundary: Boundary) -> Self {
        Self {
            coords: [0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            boundaries: [boundary; 3],
        }
    }

    /// Return coordinates
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Lower corner.
    pub fn min(&self) -> Point {
        [self.coords[0], self.coords[1], self.coords[2]]
    }

    /// Upper corner.
    pub fn max(&self) -> Point {
        [self.coords[3], self.coords[4], self.coords[5]]
    }

    /// Edge lengths.
    pub fn lengths(&self) -> [f64; 3] {
        [
            self.coords[3] - self.coords[0],
            self.coords[4] - self.coords[1],
            self.coords[5] - self.coords[2],
        ]
    }

    /// Boundary kinds of the three axes.
    pub fn boundaries(&self) -> [Boundary; 3] {
        self.boundaries
    }

    /// Return true if `axis` is periodic.
    pub fn is_periodic(&self, axis: usize) -> bool {
        self.boundaries[axis] == Boundary::Periodic
    }

    /// Map a point from the reference box [0, 1]^3 to the bounding box.
    pub fn reference_to_physical(&self, point: Point) -> Point {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            xmin + (xmax - xmin) * point[0],
            ymin + (ymax - ymin) * point[1],
            zmin + (zmax - zmin) * point[2],
        ]
    }

    /// Map a point from the physical domain to the reference box.
    pub fn physical_to_reference(&self, point: Point) -> Point {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            (point[0] - xmin) / (xmax - xmin),
            (point[1] - ymin) / (ymax - ymin),
            (point[2] - zmin) / (zmax - zmin),
        ]
    }

    /// Wrap a point into the box along periodic axes.
    ///
    /// Open axes are returned unchanged.
    pub fn wrap(&self, point: Point) -> Point {
        let mut wrapped = point;
        let lengths = self.lengths();
        for axis in 0..3 {
            if !self.is_periodic(axis) {
                continue;
            }
            let min = self.coords[axis];
            let mut value = min + (point[axis] - min).rem_euclid(lengths[axis]);
            // rem_euclid may round up to exactly the length.
            if value >= self.coords[3 + axis] {
                value = min;
            }
            wrapped[axis] = value;
        }
        wrapped
    }

    /// Physical extent of an integer cell box.
    pub fn cell_aabb(&self, cell: &IBox) -> Aabb {
        let lengths = self.lengths();
        let scale = 1.0 / MAX_COORD as f64;
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = self.coords[axis] + lengths[axis] * cell.min[axis] as f64 * scale;
            max[axis] = self.coords[axis] + lengths[axis] * cell.max[axis] as f64 * scale;
        }
        Aabb { min, max }
    }

    /// Replace the extent of open axes, keeping periodic axes as they are.
    fn with_open_extents(&self, lower: Point, upper: Point) -> Result<Self, DomainError> {
        let mut coords = self.coords;
        for axis in 0..3 {
            if !self.is_periodic(axis) {
                coords[axis] = lower[axis];
                coords[3 + axis] = upper[axis];
            }
        }
        Self::new(coords, self.boundaries)
    }
}

impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}

/// An integer box on the grid of the deepest level, half-open on every axis.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct IBox {
    /// Inclusive lower corner.
    pub min: [u32; 3],
    /// Exclusive upper corner.
    pub max: [u32; 3],
}

impl IBox {
    /// Edge length in grid units.
    pub fn edge(&self) -> u32 {
        self.max[0] - self.min[0]
    }
}

/// An axis aligned box in physical space, closed on every side.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    /// Lower corner.
    pub min: Point,
    /// Upper corner.
    pub max: Point,
}

impl Aabb {
    /// Grow the box so that it contains `point`.
    pub fn expand_to(&mut self, point: Point) {
        for (axis, &value) in point.iter().enumerate() {
            self.min[axis] = f64::min(self.min[axis], value);
            self.max[axis] = f64::max(self.max[axis], value);
        }
    }

    /// Grow the box by `delta` on every side.
    pub fn inflate(&self, delta: f64) -> Aabb {
        Aabb {
            min: [self.min[0] - delta, self.min[1] - delta, self.min[2] - delta],
            max: [self.max[0] + delta, self.max[1] + delta, self.max[2] + delta],
        }
    }

    /// Centre of the box.
    pub fn center(&self) -> Point {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    /// Largest edge length.
    pub fn max_extent(&self) -> f64 {
        (0..3)
            .map(|axis| self.max[axis] - self.min[axis])
            .fold(0.0, f64::max)
    }
}

/// Gap between two closed intervals along one axis, honouring periodic images.
fn axis_gap(a: (f64, f64), b: (f64, f64), length: f64, periodic: bool) -> f64 {
    let gap = |shift: f64| f64::max(0.0, f64::max(a.0, b.0 + shift) - f64::min(a.1, b.1 + shift));

    if !periodic {
        return gap(0.0);
    }

    if a.1 - a.0 >= length || b.1 - b.0 >= length {
        return 0.0;
    }

    [-length, 0.0, length]
        .into_iter()
        .map(gap)
        .fold(f64::MAX, f64::min)
}

/// Squared minimum distance between two boxes, taking periodic images into account.
pub fn min_distance_sq(a: &Aabb, b: &Aabb, bbox: &BoundingBox) -> f64 {
    let lengths = bbox.lengths();
    (0..3)
        .map(|axis| {
            let gap = axis_gap(
                (a.min[axis], a.max[axis]),
                (b.min[axis], b.max[axis]),
                lengths[axis],
                bbox.is_periodic(axis),
            );
            gap * gap
        })
        .sum()
}

/// Return true if two closed boxes touch or overlap, taking periodic images into account.
pub fn boxes_overlap(a: &Aabb, b: &Aabb, bbox: &BoundingBox) -> bool {
    let lengths = bbox.lengths();
    (0..3).all(|axis| {
        axis_gap(
            (a.min[axis], a.max[axis]),
            (b.min[axis], b.max[axis]),
            lengths[axis],
            bbox.is_periodic(axis),
        ) == 0.0
    })
}

/// Squared distance between two points under the minimum image convention.
pub fn distance_sq(p: Point, q: Point, bbox: &BoundingBox) -> f64 {
    let lengths = bbox.lengths();
    (0..3)
        .map(|axis| {
            let mut d = (p[axis] - q[axis]).abs();
            if bbox.is_periodic(axis) {
                d = d.rem_euclid(lengths[axis]);
                d = f64::min(d, lengths[axis] - d);
            }
            d * d
        })
        .sum()
}

fn local_extents(x: &[f64], y: &[f64], z: &[f64]) -> [f64; 6] {
    let mut extents = [f64::MAX, f64::MAX, f64::MAX, f64::MIN, f64::MIN, f64::MIN];

    for (axis, values) in [x, y, z].into_iter().enumerate() {
        for &value in values {
            extents[axis] = f64::min(extents[axis], value);
            extents[3 + axis] = f64::max(extents[3 + axis], value);
        }
    }

    extents
}

/// Fit the open axes of `current` to the extents, padded by one cell of the deepest level.
fn fit_to_extents(extents: [f64; 6], current: &BoundingBox) -> Result<BoundingBox, DomainError> {
    if (0..3).any(|axis| extents[axis] > extents[3 + axis]) {
        return Ok(*current);
    }

    let deepest_box_diam = 1.0 / (1u64 << MAX_LEVEL) as f64;
    let mut lower = [0.0; 3];
    let mut upper = [0.0; 3];

    for axis in 0..3 {
        let (min, max) = (extents[axis], extents[3 + axis]);
        let magnitude = f64::max(1.0, f64::max(min.abs(), max.abs()));
        let pad = f64::max((max - min) * deepest_box_diam, 1e-12 * magnitude);
        lower[axis] = min - pad;
        upper[axis] = max + pad;
    }

    current.with_open_extents(lower, upper)
}

impl BoundingBox {
    /// The box of local points with the given boundary kinds.
    ///
    /// Open axes are fitted to the points, periodic axes keep the unit interval.
    pub fn from_points(
        x: &[f64],
        y: &[f64],
        z: &[f64],
        boundaries: [Boundary; 3],
    ) -> Result<BoundingBox, DomainError> {
        let unit = BoundingBox {
            boundaries,
            ..BoundingBox::unit(Boundary::Open)
        };
        fit_to_extents(local_extents(x, y, z), &unit)
    }
}

/// Compute the global bounding box across all points on all processes.
///
/// Open axes are fitted to the global particle extent and padded by one cell of the
/// deepest level. Periodic axes keep the extent of `current`. If there are no particles
/// anywhere, `current` is returned.
pub fn compute_global_bounding_box<C: Communicator>(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    current: &BoundingBox,
    comm: &C,
) -> Result<BoundingBox, DomainError> {
    // Every rank reduces the same gathered extents in the same order, so the result
    // is bit-identical everywhere.
    let all_extents = gather_to_all(&local_extents(x, y, z), comm)?;

    let mut extents = [f64::MAX, f64::MAX, f64::MAX, f64::MIN, f64::MIN, f64::MIN];
    for rank_extents in all_extents.chunks_exact(6) {
        for axis in 0..3 {
            extents[axis] = f64::min(extents[axis], rank_extents[axis]);
            extents[3 + axis] = f64::max(extents[3 + axis], rank_extents[3 + axis]);
        }
    }

    fit_to_extents(extents, current)
}
