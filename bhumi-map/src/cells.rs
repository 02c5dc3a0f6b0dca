//! Dense log-odds cell store with clamped Bayesian updates.

use crate::core::{CellBounds, GridCoord};
use crate::dimensions::MapDimensions;

/// Sentinel for a never-observed cell.
///
/// Because the sentinel is 0.0, `unknown + delta = delta` falls out of the
/// update arithmetic without a special case.
pub const UNKNOWN: f32 = 0.0;

/// Log-odds of a probability: `ln(p / (1 - p))`.
#[inline]
pub fn logodds(p: f64) -> f32 {
    (p / (1.0 - p)).ln() as f32
}

/// Probability of a log-odds value.
#[inline]
pub fn probability(log_odds: f32) -> f64 {
    1.0 - 1.0 / (1.0 + (log_odds as f64).exp())
}

/// Clamping bounds and occupancy threshold, given as probabilities.
#[derive(Clone, Copy, Debug)]
pub struct ClampParams {
    pub min_probability: f64,
    pub max_probability: f64,
    pub occupancy_probability: f64,
}

impl Default for ClampParams {
    fn default() -> Self {
        Self {
            min_probability: 0.1,
            max_probability: 0.9,
            occupancy_probability: 0.8,
        }
    }
}

/// Dense log-odds grid over [`MapDimensions`].
///
/// Every cell is a log-odds scalar bounded by `[min_log, max_log]` with the
/// [`UNKNOWN`] sentinel. Positive deltas mean more occupied.
#[derive(Clone, Debug)]
pub struct LogOddsGrid {
    dims: MapDimensions,
    cells: Vec<f32>,
    min_log: f32,
    max_log: f32,
    occupancy_log: f32,
}

impl LogOddsGrid {
    /// Create a grid of unknown cells.
    pub fn new(dims: MapDimensions, clamp: ClampParams) -> Self {
        Self {
            dims,
            cells: vec![UNKNOWN; dims.cell_count()],
            min_log: logodds(clamp.min_probability),
            max_log: logodds(clamp.max_probability),
            occupancy_log: logodds(clamp.occupancy_probability),
        }
    }

    #[inline]
    pub fn dimensions(&self) -> &MapDimensions {
        &self.dims
    }

    #[inline]
    pub fn min_log(&self) -> f32 {
        self.min_log
    }

    #[inline]
    pub fn max_log(&self) -> f32 {
        self.max_log
    }

    #[inline]
    pub fn occupancy_log(&self) -> f32 {
        self.occupancy_log
    }

    /// Raw cell values in row-major order.
    #[inline]
    pub fn cells(&self) -> &[f32] {
        &self.cells
    }

    /// Cell value, or `None` off the grid.
    #[inline]
    pub fn get(&self, coord: GridCoord) -> Option<f32> {
        self.dims.index(coord).map(|i| self.cells[i])
    }

    /// Apply a clamped log-odds delta. Off-grid coordinates are ignored.
    #[inline]
    pub fn update(&mut self, coord: GridCoord, delta: f32) {
        if let Some(i) = self.dims.index(coord) {
            self.cells[i] = (self.cells[i] + delta).clamp(self.min_log, self.max_log);
        }
    }

    /// Apply a clamped delta only when the coordinate lies inside `bounds`.
    #[inline]
    pub fn update_in(&mut self, coord: GridCoord, delta: f32, bounds: &CellBounds) {
        if bounds.contains(coord) {
            self.update(coord, delta);
        }
    }

    /// Force a cell to `min_log`, overriding accumulated evidence.
    #[inline]
    pub fn set_min(&mut self, coord: GridCoord) {
        if let Some(i) = self.dims.index(coord) {
            self.cells[i] = self.min_log;
        }
    }

    /// Write a raw value, clamped unless it is [`UNKNOWN`].
    #[inline]
    pub fn set(&mut self, coord: GridCoord, value: f32) {
        if let Some(i) = self.dims.index(coord) {
            self.cells[i] = if value == UNKNOWN {
                UNKNOWN
            } else {
                value.clamp(self.min_log, self.max_log)
            };
        }
    }

    /// True if the cell's log-odds meets the occupancy threshold.
    #[inline]
    pub fn occupied(&self, coord: GridCoord) -> bool {
        self.get(coord).map(|c| c >= self.occupancy_log).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    fn create_test_grid() -> LogOddsGrid {
        let dims = MapDimensions::new(Point2::new(0.0, 0.0), 0.05, GridCoord::new(20, 20));
        LogOddsGrid::new(dims, ClampParams::default())
    }

    #[test]
    fn test_unknown_plus_delta() {
        let mut grid = create_test_grid();
        let c = GridCoord::new(3, 4);
        assert_eq!(grid.get(c), Some(UNKNOWN));
        grid.update(c, 0.7);
        assert!((grid.get(c).unwrap() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_update_clamps() {
        let mut grid = create_test_grid();
        let c = GridCoord::new(0, 0);
        for _ in 0..100 {
            grid.update(c, 1.0);
        }
        assert_eq!(grid.get(c), Some(grid.max_log()));
        for _ in 0..100 {
            grid.update(c, -1.0);
        }
        assert_eq!(grid.get(c), Some(grid.min_log()));
    }

    #[test]
    fn test_all_cells_bounded_after_updates() {
        let mut grid = create_test_grid();
        for i in 0..20 {
            grid.update(GridCoord::new(i, i), 5.0);
            grid.update(GridCoord::new(i, 19 - i), -5.0);
        }
        for &c in grid.cells() {
            assert!(c == UNKNOWN || (c >= grid.min_log() && c <= grid.max_log()));
        }
    }

    #[test]
    fn test_set_min_overrides() {
        let mut grid = create_test_grid();
        let c = GridCoord::new(5, 5);
        grid.update(c, 10.0);
        assert_eq!(grid.get(c), Some(grid.max_log()));
        grid.set_min(c);
        assert_eq!(grid.get(c), Some(grid.min_log()));
        // Idempotent.
        grid.set_min(c);
        assert_eq!(grid.get(c), Some(grid.min_log()));
    }

    #[test]
    fn test_off_grid_ignored() {
        let mut grid = create_test_grid();
        grid.update(GridCoord::new(-1, 0), 1.0);
        grid.update(GridCoord::new(0, 20), 1.0);
        assert_eq!(grid.get(GridCoord::new(-1, 0)), None);
    }

    #[test]
    fn test_occupied_threshold() {
        let mut grid = create_test_grid();
        let c = GridCoord::new(1, 1);
        assert!(!grid.occupied(c));
        grid.update(c, logodds(0.8));
        assert!(grid.occupied(c));
    }

    #[test]
    fn test_logodds_round_trip() {
        for &p in &[0.1, 0.4, 0.5, 0.8, 0.9] {
            assert!((probability(logodds(p)) - p).abs() < 1e-6);
        }
    }
}
