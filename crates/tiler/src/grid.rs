//! Spatial grid: sizes a regular 3-D grid from bounds and point count, and maps
//! coordinates to bucket keys.

use serde::{Deserialize, Serialize};

use crate::key::BucketKey;

/// Deepest subdivision the density sizing will pick.
pub const MAX_LEVEL: u32 = 20;

/// Default density target per bucket.
pub const DEFAULT_POINTS_PER_CELL: u64 = 2_000_000;

/// Axis-aligned box. `empty()` is the identity for `grow`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds3 {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for Bounds3 {
    fn default() -> Self {
        Self::empty()
    }
}

impl Bounds3 {
    pub const fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    pub const fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        (0..3).any(|i| !(self.min[i] <= self.max[i]))
    }

    pub fn grow(&mut self, other: &Bounds3) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    #[inline]
    pub fn grow_point(&mut self, p: [f64; 3]) {
        for i in 0..3 {
            if p[i] < self.min[i] {
                self.min[i] = p[i];
            }
            if p[i] > self.max[i] {
                self.max[i] = p[i];
            }
        }
    }

    #[inline]
    pub fn extent(&self) -> [f64; 3] {
        if self.is_empty() {
            return [0.0; 3];
        }
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Half-open containment: `min <= p < max` on every axis.
    #[inline]
    pub fn contains_half_open(&self, p: [f64; 3]) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] < self.max[i])
    }

    /// Cube anchored at `min` with the largest extent as side.
    pub fn cubic(&self) -> Bounds3 {
        if self.is_empty() {
            return *self;
        }
        let e = self.extent();
        let side = e[0].max(e[1]).max(e[2]);
        Bounds3 {
            min: self.min,
            max: [self.min[0] + side, self.min[1] + side, self.min[2] + side],
        }
    }
}

/// How the grid chooses its cell size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GridSizing {
    /// Subdivide until the expected count per cell is at most this many points.
    Density { points_per_cell: u64 },
    /// Fixed cell edge length in source units.
    CellSize(f64),
}

impl Default for GridSizing {
    fn default() -> Self {
        GridSizing::Density {
            points_per_cell: DEFAULT_POINTS_PER_CELL,
        }
    }
}

/// Regular grid over the processing bounds. Read-only once scanning is done.
#[derive(Debug, Clone)]
pub struct SpatialGrid {
    sizing: GridSizing,
    cubic: bool,
    level_override: Option<u32>,
    bounds: Bounds3,
    total_points: u64,

    // derived by `resize`
    level: u32,
    origin: [f64; 3],
    cell_size: [f64; 3],
    cells: [i32; 3],
}

impl SpatialGrid {
    pub fn new(sizing: GridSizing, cubic: bool) -> Self {
        let mut grid = Self {
            sizing,
            cubic,
            level_override: None,
            bounds: Bounds3::empty(),
            total_points: 0,
            level: 0,
            origin: [0.0; 3],
            cell_size: [1.0; 3],
            cells: [1; 3],
        };
        grid.resize();
        grid
    }

    /// Grow the tracked bounds and point count. Called once per source during the scan.
    pub fn expand(&mut self, bounds: &Bounds3, points: u64) {
        if !bounds.is_empty() {
            self.bounds.grow(bounds);
        }
        self.total_points += points;
        self.resize();
    }

    /// Pin the subdivision level instead of deriving it from density.
    pub fn set_level(&mut self, level: u32) {
        self.level_override = Some(level.min(MAX_LEVEL));
        self.resize();
    }

    /// Bucket owning `(x, y, z)`. Cells are half-open; indices clamp into the grid.
    #[inline]
    pub fn key_for(&self, x: f64, y: f64, z: f64) -> BucketKey {
        let p = [x, y, z];
        let mut idx = [0i32; 3];

        for i in 0..3 {
            let last = self.cells[i] as i64 - 1;
            // NaN casts to 0; out-of-range values saturate before the clamp.
            let raw = ((p[i] - self.origin[i]) / self.cell_size[i]).floor() as i64;
            let mut k = raw.clamp(-1, last + 1);

            // The division can round across a face; settle on the faces `cell_bounds` reports.
            if self.cell_low(i, k + 1) <= p[i] {
                k += 1;
            } else if self.cell_low(i, k) > p[i] {
                k -= 1;
            }

            idx[i] = k.clamp(0, last) as i32;
        }

        BucketKey::new(idx[0], idx[1], idx[2], self.level as i32)
    }

    /// Box addressed by `key` (half-open on the upper faces).
    pub fn cell_bounds(&self, key: BucketKey) -> Bounds3 {
        let idx = [key.x, key.y, key.z];
        let mut cell = Bounds3::empty();

        for i in 0..3 {
            cell.min[i] = self.cell_low(i, idx[i] as i64);
            cell.max[i] = self.cell_low(i, idx[i] as i64 + 1);
        }

        cell
    }

    /// Low face of cell `index` along `axis`; the high face is the next cell's low face.
    #[inline]
    fn cell_low(&self, axis: usize, index: i64) -> f64 {
        self.origin[axis] + index as f64 * self.cell_size[axis]
    }

    #[inline]
    pub fn conforming_bounds(&self) -> Bounds3 {
        self.bounds
    }

    #[inline]
    pub fn processing_bounds(&self) -> Bounds3 {
        if self.cubic {
            self.bounds.cubic()
        } else {
            self.bounds
        }
    }

    #[inline]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[inline]
    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    #[inline]
    pub fn cell_size(&self) -> [f64; 3] {
        self.cell_size
    }

    #[inline]
    pub fn cells(&self) -> [i32; 3] {
        self.cells
    }

    #[inline]
    pub fn cubic(&self) -> bool {
        self.cubic
    }

    #[inline]
    pub fn total_points(&self) -> u64 {
        self.total_points
    }

    fn resize(&mut self) {
        let processing = self.processing_bounds();
        let extent = processing.extent();

        self.origin = if processing.is_empty() {
            [0.0; 3]
        } else {
            processing.min
        };

        match self.sizing {
            GridSizing::Density { points_per_cell } => {
                self.level = self
                    .level_override
                    .unwrap_or_else(|| self.density_level(points_per_cell));

                let per_axis = 1i32 << self.level;
                for i in 0..3 {
                    self.cells[i] = per_axis;
                    self.cell_size[i] = if extent[i] > 0.0 {
                        extent[i] / per_axis as f64
                    } else {
                        1.0
                    };
                }
            }
            GridSizing::CellSize(length) => {
                self.level = 0;
                for i in 0..3 {
                    if extent[i] > 0.0 {
                        self.cell_size[i] = length;
                        let n = (extent[i] / length).ceil().min(i32::MAX as f64);
                        self.cells[i] = (n as i32).max(1);
                    } else {
                        self.cell_size[i] = 1.0;
                        self.cells[i] = 1;
                    }
                }
            }
        }
    }

    /// Levels of halving needed to bring the expected per-cell count under the target.
    ///
    /// In cubic mode an axis only splits the count when its conforming extent still
    /// reaches the current cube side, so flat data does not over-divide.
    fn density_level(&self, points_per_cell: u64) -> u32 {
        let target = points_per_cell.max(1) as f64;
        let mut expected = self.total_points as f64;

        let e = self.bounds.extent();
        let mut side = e[0].max(e[1]).max(e[2]);
        let mut level = 0;

        while expected > target && level < MAX_LEVEL {
            if self.cubic {
                for axis in e {
                    if axis >= side {
                        expected /= 2.0;
                    }
                }
                side /= 2.0;
            } else {
                expected /= 8.0;
            }
            level += 1;
        }

        level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_box(max: [f64; 3]) -> Bounds3 {
        Bounds3::new([0.0; 3], max)
    }

    #[test]
    fn density_level_tracks_point_count() {
        let mut grid = SpatialGrid::new(GridSizing::Density { points_per_cell: 1000 }, true);
        grid.expand(&unit_box([100.0; 3]), 1000);
        assert_eq!(grid.level(), 0);

        // 8x the target over a cube needs one split on every axis.
        grid.expand(&unit_box([100.0; 3]), 7000);
        assert_eq!(grid.level(), 1);
        assert_eq!(grid.cells(), [2, 2, 2]);
        assert_eq!(grid.cell_size(), [50.0, 50.0, 50.0]);

        let mut flat = SpatialGrid::new(GridSizing::Density { points_per_cell: 1000 }, true);
        flat.expand(&unit_box([100.0, 100.0, 1.0]), 8000);
        // z never reaches the cube side, so only x and y split the count.
        assert_eq!(flat.level(), 2);

        let mut loose = SpatialGrid::new(GridSizing::Density { points_per_cell: 1000 }, false);
        loose.expand(&unit_box([100.0, 100.0, 1.0]), 8000);
        assert_eq!(loose.level(), 1);
        assert_eq!(loose.cell_size(), [50.0, 50.0, 0.5]);
    }

    #[test]
    fn level_override_wins() {
        let mut grid = SpatialGrid::new(GridSizing::default(), true);
        grid.set_level(3);
        grid.expand(&unit_box([80.0; 3]), 10);
        assert_eq!(grid.level(), 3);
        assert_eq!(grid.cells(), [8, 8, 8]);
        assert_eq!(grid.key_for(79.0, 0.0, 10.0), BucketKey::new(7, 0, 1, 3));
    }

    #[test]
    fn keys_partition_space_half_open() {
        let mut grid = SpatialGrid::new(GridSizing::CellSize(1.0), false);
        grid.expand(&unit_box([4.0, 2.0, 1.0]), 100);
        assert_eq!(grid.cells(), [4, 2, 1]);

        // On a boundary the upper cell owns the point.
        assert_eq!(grid.key_for(1.0, 0.0, 0.0), BucketKey::new(1, 0, 0, 0));
        assert_eq!(grid.key_for(0.999_999, 0.0, 0.0), BucketKey::new(0, 0, 0, 0));

        // The max face and slightly outside values clamp to the edge cells.
        assert_eq!(grid.key_for(4.0, 2.0, 1.0), BucketKey::new(3, 1, 0, 0));
        assert_eq!(grid.key_for(-0.5, 9.0, f64::NAN), BucketKey::new(0, 1, 0, 0));

        for &(x, y) in &[(0.25, 0.5), (1.0, 1.0), (2.75, 1.999), (3.5, 0.0)] {
            let key = grid.key_for(x, y, 0.5);
            assert!(grid.cell_bounds(key).contains_half_open([x, y, 0.5]));
            assert_eq!(grid.key_for(x, y, 0.5), key);

            for other_x in 0..4 {
                for other_y in 0..2 {
                    let other = BucketKey::new(other_x, other_y, 0, 0);
                    if other != key {
                        assert!(!grid.cell_bounds(other).contains_half_open([x, y, 0.5]));
                    }
                }
            }
        }
    }

    #[test]
    fn faces_of_uneven_cells_belong_to_the_upper_cell() {
        let mut grid = SpatialGrid::new(GridSizing::Density { points_per_cell: 1 }, false);
        grid.set_level(4);
        grid.expand(&Bounds3::new([0.1, -3.3, 7.0], [10.3, 4.4, 7.7]), 1000);
        assert_eq!(grid.cells(), [16, 16, 16]);

        let top = grid.cell_bounds(BucketKey::new(15, 15, 15, 4)).max;
        let max: Vec<f64> = (0..3)
            .map(|i| top[i].min(grid.conforming_bounds().max[i]))
            .collect();
        let mut checked = 0;

        for cx in 0..16 {
            let face = grid.cell_bounds(BucketKey::new(cx, cx, cx, 4)).min;
            let key = grid.key_for(face[0], face[1], face[2]);
            assert_eq!(key, BucketKey::new(cx, cx, cx, 4));
        }

        for step in 0..6003 {
            let t = step as f64 / 6003.0;
            let p = [0.1 + t * 10.2, -3.3 + t * 7.7, 7.0 + t * 0.7];
            if (0..3).any(|i| p[i] >= max[i]) {
                continue;
            }
            let key = grid.key_for(p[0], p[1], p[2]);
            assert!(grid.cell_bounds(key).contains_half_open(p), "{p:?} -> {key}");
            checked += 1;
        }

        assert!(checked > 6000);
    }

    #[test]
    fn degenerate_axis_gets_unit_cell() {
        let mut grid = SpatialGrid::new(GridSizing::Density { points_per_cell: 10 }, false);
        grid.expand(&Bounds3::new([5.0, 5.0, 3.0], [25.0, 45.0, 3.0]), 100);

        assert_eq!(grid.cell_size()[2], 1.0);
        assert_eq!(grid.key_for(24.0, 44.0, 3.0).z, 0);
    }

    #[test]
    fn cubic_processing_bounds_use_largest_side() {
        let mut grid = SpatialGrid::new(GridSizing::CellSize(10.0), true);
        grid.expand(&Bounds3::new([1.0, 2.0, 3.0], [41.0, 12.0, 8.0]), 5);

        assert_eq!(
            grid.processing_bounds(),
            Bounds3::new([1.0, 2.0, 3.0], [41.0, 42.0, 43.0])
        );
        assert_eq!(grid.conforming_bounds().max, [41.0, 12.0, 8.0]);
        assert_eq!(grid.cells(), [4, 4, 4]);
    }
}
