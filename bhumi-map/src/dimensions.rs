//! Grid geometry: origin, resolution and size.

use nalgebra::Point2;

use crate::core::{CellBounds, GridCoord};

/// Geometry of the occupancy grid.
///
/// `origin` is the world position of the lower-left corner of cell (0, 0).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MapDimensions {
    origin: Point2<f64>,
    resolution: f64,
    size: GridCoord,
}

impl MapDimensions {
    /// Create new dimensions. `resolution` is metres per cell.
    pub fn new(origin: Point2<f64>, resolution: f64, size: GridCoord) -> Self {
        debug_assert!(resolution > 0.0);
        Self {
            origin,
            resolution,
            size,
        }
    }

    #[inline]
    pub fn origin(&self) -> Point2<f64> {
        self.origin
    }

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    #[inline]
    pub fn size(&self) -> GridCoord {
        self.size
    }

    /// Total number of cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        (self.size.x as usize) * (self.size.y as usize)
    }

    /// Convert a world point to the containing cell (floor semantics).
    #[inline]
    pub fn world_to_grid(&self, point: Point2<f64>) -> GridCoord {
        GridCoord::new(
            ((point.x - self.origin.x) / self.resolution).floor() as i32,
            ((point.y - self.origin.y) / self.resolution).floor() as i32,
        )
    }

    /// Convert a cell coordinate to the world position of its centre.
    #[inline]
    pub fn grid_to_world(&self, coord: GridCoord) -> Point2<f64> {
        Point2::new(
            self.origin.x + (coord.x as f64 + 0.5) * self.resolution,
            self.origin.y + (coord.y as f64 + 0.5) * self.resolution,
        )
    }

    /// Check whether a cell coordinate lies on the grid.
    #[inline]
    pub fn contains(&self, coord: GridCoord) -> bool {
        coord.x >= 0 && coord.y >= 0 && coord.x < self.size.x && coord.y < self.size.y
    }

    /// Check whether a world point lies on the grid.
    #[inline]
    pub fn contains_world(&self, point: Point2<f64>) -> bool {
        self.contains(self.world_to_grid(point))
    }

    /// Flat array index for a coordinate, if on the grid.
    #[inline]
    pub fn index(&self, coord: GridCoord) -> Option<usize> {
        if self.contains(coord) {
            Some(coord.y as usize * self.size.x as usize + coord.x as usize)
        } else {
            None
        }
    }

    /// Bounds covering the whole grid.
    #[inline]
    pub fn bounds(&self) -> CellBounds {
        CellBounds::new(GridCoord::new(0, 0), self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_dimensions() -> MapDimensions {
        MapDimensions::new(Point2::new(-1.0, -1.0), 0.05, GridCoord::new(40, 40))
    }

    #[test]
    fn test_world_grid_round_trip() {
        let dims = create_test_dimensions();

        // The centre of the cell containing p must be within resolution/2 of p.
        for &(x, y) in &[(0.0, 0.0), (-0.99, -0.99), (0.123, 0.777), (0.9749, 0.95)] {
            let p = Point2::new(x, y);
            let centre = dims.grid_to_world(dims.world_to_grid(p));
            assert!((centre.x - p.x).abs() <= 0.025 + 1e-9);
            assert!((centre.y - p.y).abs() <= 0.025 + 1e-9);
        }
    }

    #[test]
    fn test_contains() {
        let dims = create_test_dimensions();
        assert!(dims.contains(GridCoord::new(0, 0)));
        assert!(dims.contains(GridCoord::new(39, 39)));
        assert!(!dims.contains(GridCoord::new(40, 0)));
        assert!(!dims.contains(GridCoord::new(-1, 0)));
        assert!(dims.contains_world(Point2::new(0.0, 0.0)));
        assert!(!dims.contains_world(Point2::new(1.01, 0.0)));
    }

    #[test]
    fn test_floor_semantics() {
        let dims = create_test_dimensions();
        // -1.0 is the lower-left corner of cell (0, 0).
        assert_eq!(dims.world_to_grid(Point2::new(-1.0, -1.0)), GridCoord::new(0, 0));
        assert_eq!(
            dims.world_to_grid(Point2::new(-1.0 + 0.049, -1.0)),
            GridCoord::new(0, 0)
        );
        assert_eq!(
            dims.world_to_grid(Point2::new(-1.0 + 0.051, -1.0)),
            GridCoord::new(1, 0)
        );
    }
}
