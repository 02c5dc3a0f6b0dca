//! Robot footprint rasterisation.

use nalgebra::{Isometry2, Point2};

use crate::core::GridCoord;
use crate::dimensions::MapDimensions;

/// Cells covered by the robot footprint polygon at `pose`.
///
/// The body-frame polygon is scaled about the body origin by `scale`
/// (1.0 by convention), transformed into the world frame and rasterised by
/// testing cell centres against the polygon. Cells off the grid are
/// omitted.
pub fn footprint_cells(
    dims: &MapDimensions,
    pose: &Isometry2<f64>,
    polygon: &[Point2<f64>],
    scale: f64,
) -> Vec<GridCoord> {
    if polygon.len() < 3 {
        return Vec::new();
    }

    let world: Vec<Point2<f64>> = polygon
        .iter()
        .map(|p| pose * Point2::new(p.x * scale, p.y * scale))
        .collect();

    let mut min_x = f64::MAX;
    let mut min_y = f64::MAX;
    let mut max_x = f64::MIN;
    let mut max_y = f64::MIN;
    for p in &world {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }

    let lo = dims.world_to_grid(Point2::new(min_x, min_y));
    let hi = dims.world_to_grid(Point2::new(max_x, max_y));

    let mut cells = Vec::new();
    for y in lo.y..=hi.y {
        for x in lo.x..=hi.x {
            let coord = GridCoord::new(x, y);
            if !dims.contains(coord) {
                continue;
            }
            if point_in_polygon(dims.grid_to_world(coord), &world) {
                cells.push(coord);
            }
        }
    }
    cells
}

/// Even-odd rule point-in-polygon test.
fn point_in_polygon(point: Point2<f64>, polygon: &[Point2<f64>]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    let mut j = n - 1;
    for i in 0..n {
        let pi = polygon[i];
        let pj = polygon[j];
        if ((pi.y > point.y) != (pj.y > point.y))
            && (point.x < (pj.x - pi.x) * (point.y - pi.y) / (pj.y - pi.y) + pi.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_dimensions() -> MapDimensions {
        MapDimensions::new(Point2::new(-1.0, -1.0), 0.05, GridCoord::new(40, 40))
    }

    fn square_footprint(half: f64) -> Vec<Point2<f64>> {
        vec![
            Point2::new(half, half),
            Point2::new(-half, half),
            Point2::new(-half, -half),
            Point2::new(half, -half),
        ]
    }

    #[test]
    fn test_footprint_covers_origin() {
        let dims = create_test_dimensions();
        let pose = Isometry2::identity();
        let cells = footprint_cells(&dims, &pose, &square_footprint(0.1), 1.0);
        assert!(!cells.is_empty());
        let origin_cell = dims.world_to_grid(Point2::new(0.0, 0.0));
        assert!(cells.contains(&origin_cell));
    }

    #[test]
    fn test_footprint_rotation_invariant_area() {
        let dims = create_test_dimensions();
        let unrotated = footprint_cells(
            &dims,
            &Isometry2::identity(),
            &square_footprint(0.1),
            1.0,
        );
        let rotated = footprint_cells(
            &dims,
            &Isometry2::new(nalgebra::Vector2::new(0.0, 0.0), std::f64::consts::FRAC_PI_4),
            &square_footprint(0.1),
            1.0,
        );
        // Cell counts of a rotated square stay in the same ballpark.
        let ratio = rotated.len() as f64 / unrotated.len() as f64;
        assert!(ratio > 0.7 && ratio < 1.3);
    }

    #[test]
    fn test_footprint_off_grid_clipped() {
        let dims = create_test_dimensions();
        let pose = Isometry2::new(nalgebra::Vector2::new(-1.0, -1.0), 0.0);
        let cells = footprint_cells(&dims, &pose, &square_footprint(0.1), 1.0);
        for c in &cells {
            assert!(dims.contains(*c));
        }
    }
}
