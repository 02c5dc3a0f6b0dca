//! Discrete ray tracing through grid cells.

use crate::cells::LogOddsGrid;
use crate::core::{CellBounds, GridCoord};

/// Bresenham line iterator between two cells, inclusive of both endpoints.
#[derive(Clone, Debug)]
pub struct BresenhamLine {
    current: GridCoord,
    end: GridCoord,
    dx: i32,
    dy: i32,
    sx: i32,
    sy: i32,
    err: i32,
    done: bool,
}

impl BresenhamLine {
    pub fn new(start: GridCoord, end: GridCoord) -> Self {
        let dx = (end.x - start.x).abs();
        let dy = (end.y - start.y).abs();
        Self {
            current: start,
            end,
            dx,
            dy,
            sx: if start.x < end.x { 1 } else { -1 },
            sy: if start.y < end.y { 1 } else { -1 },
            err: dx - dy,
            done: false,
        }
    }
}

impl Iterator for BresenhamLine {
    type Item = GridCoord;

    fn next(&mut self) -> Option<GridCoord> {
        if self.done {
            return None;
        }
        let out = self.current;
        if self.current == self.end {
            self.done = true;
        } else {
            let e2 = 2 * self.err;
            if e2 > -self.dy {
                self.err -= self.dy;
                self.current.x += self.sx;
            }
            if e2 < self.dx {
                self.err += self.dx;
                self.current.y += self.sy;
            }
        }
        Some(out)
    }
}

/// Clip the end of a ray to the grid.
///
/// If `end` already lies within `[0, size)` it is returned unchanged.
/// Otherwise the returned coordinate is the last in-bounds cell along the
/// ray from `start`, i.e. the cell just before the ray would leave the grid.
/// `start` must be on the grid.
pub fn clip_ray_end(start: GridCoord, end: GridCoord, size: GridCoord) -> GridCoord {
    let in_bounds =
        |c: GridCoord| c.x >= 0 && c.y >= 0 && c.x < size.x && c.y < size.y;
    if in_bounds(end) {
        return end;
    }

    let dx = (end.x - start.x) as f64;
    let dy = (end.y - start.y) as f64;

    // Smallest parameter at which the ray crosses a boundary of the box
    // [0, size.x - 1] x [0, size.y - 1].
    let mut t_exit = 1.0f64;
    if dx > 0.0 {
        t_exit = t_exit.min((size.x as f64 - 1.0 - start.x as f64) / dx);
    } else if dx < 0.0 {
        t_exit = t_exit.min((0.0 - start.x as f64) / dx);
    }
    if dy > 0.0 {
        t_exit = t_exit.min((size.y as f64 - 1.0 - start.y as f64) / dy);
    } else if dy < 0.0 {
        t_exit = t_exit.min((0.0 - start.y as f64) / dy);
    }

    let clipped = GridCoord::new(
        start.x + (dx * t_exit).round() as i32,
        start.y + (dy * t_exit).round() as i32,
    );
    GridCoord::new(
        clipped.x.clamp(0, size.x - 1),
        clipped.y.clamp(0, size.y - 1),
    )
}

/// Trace a ray applying `delta` to every traversed cell, capped at
/// `max_cells` cells and restricted to `bounds`.
pub fn raytrace(
    grid: &mut LogOddsGrid,
    start: GridCoord,
    end: GridCoord,
    delta: f32,
    max_cells: usize,
    bounds: &CellBounds,
) {
    for (i, coord) in BresenhamLine::new(start, end).enumerate() {
        if i >= max_cells {
            break;
        }
        grid.update_in(coord, delta, bounds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::ClampParams;
    use crate::dimensions::MapDimensions;
    use nalgebra::Point2;

    fn create_test_grid() -> LogOddsGrid {
        let dims = MapDimensions::new(Point2::new(0.0, 0.0), 0.05, GridCoord::new(20, 20));
        LogOddsGrid::new(dims, ClampParams::default())
    }

    #[test]
    fn test_bresenham_straight() {
        let cells: Vec<_> = BresenhamLine::new(GridCoord::new(0, 0), GridCoord::new(4, 0)).collect();
        assert_eq!(cells.len(), 5);
        assert_eq!(cells[0], GridCoord::new(0, 0));
        assert_eq!(cells[4], GridCoord::new(4, 0));
    }

    #[test]
    fn test_bresenham_diagonal() {
        let cells: Vec<_> = BresenhamLine::new(GridCoord::new(0, 0), GridCoord::new(3, 3)).collect();
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[3], GridCoord::new(3, 3));
    }

    #[test]
    fn test_bresenham_single_cell() {
        let cells: Vec<_> = BresenhamLine::new(GridCoord::new(2, 2), GridCoord::new(2, 2)).collect();
        assert_eq!(cells, vec![GridCoord::new(2, 2)]);
    }

    #[test]
    fn test_clip_inside_unchanged() {
        let size = GridCoord::new(20, 20);
        let end = GridCoord::new(5, 7);
        assert_eq!(clip_ray_end(GridCoord::new(0, 0), end, size), end);
    }

    #[test]
    fn test_clip_axis_aligned() {
        let size = GridCoord::new(20, 20);
        let clipped = clip_ray_end(GridCoord::new(10, 10), GridCoord::new(40, 10), size);
        assert_eq!(clipped, GridCoord::new(19, 10));

        let clipped = clip_ray_end(GridCoord::new(10, 10), GridCoord::new(10, -5), size);
        assert_eq!(clipped, GridCoord::new(10, 0));
    }

    #[test]
    fn test_clip_diagonal_stays_on_ray() {
        let size = GridCoord::new(20, 20);
        let clipped = clip_ray_end(GridCoord::new(0, 0), GridCoord::new(40, 40), size);
        assert_eq!(clipped, GridCoord::new(19, 19));
    }

    #[test]
    fn test_raytrace_cap() {
        let mut grid = create_test_grid();
        let bounds = grid.dimensions().bounds();
        raytrace(
            &mut grid,
            GridCoord::new(0, 0),
            GridCoord::new(19, 0),
            -0.4,
            5,
            &bounds,
        );
        assert!(grid.get(GridCoord::new(4, 0)).unwrap() < 0.0);
        assert_eq!(grid.get(GridCoord::new(5, 0)), Some(crate::cells::UNKNOWN));
    }

    #[test]
    fn test_raytrace_respects_bounds() {
        let mut grid = create_test_grid();
        let bounds = CellBounds::new(GridCoord::new(0, 0), GridCoord::new(5, 5));
        raytrace(
            &mut grid,
            GridCoord::new(0, 0),
            GridCoord::new(10, 0),
            -0.4,
            usize::MAX,
            &bounds,
        );
        assert!(grid.get(GridCoord::new(4, 0)).unwrap() < 0.0);
        assert_eq!(grid.get(GridCoord::new(6, 0)), Some(crate::cells::UNKNOWN));
    }
}
