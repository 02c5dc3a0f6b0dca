//! Distance-to-collision and cost fields derived from the grid.

use bhumi_map::{CellBounds, MapData};
use nalgebra::{Isometry2, Point2, Vector2};

/// Body-frame offset points approximating the robot footprint.
pub const BODY_OFFSETS: [[f64; 2]; 10] = [
    [-0.268, 0.000],
    [0.268, 0.000],
    [0.265, -0.185],
    [0.077, -0.185],
    [-0.077, -0.185],
    [-0.265, -0.185],
    [0.265, 0.185],
    [-0.265, 0.185],
    [-0.077, 0.185],
    [0.077, 0.185],
];

/// Squared-distance placeholder for free cells; finite so the parabola
/// intersections in the transform stay well-defined.
const FAR: f64 = 1e12;

/// One-dimensional squared-distance transform (lower parabola envelope).
fn dt1d(f: &[f64], d: &mut [f64], v: &mut [usize], z: &mut [f64]) {
    let n = f.len();
    let mut k = 0usize;
    v[0] = 0;
    z[0] = f64::NEG_INFINITY;
    z[1] = f64::INFINITY;
    for q in 1..n {
        loop {
            let p = v[k];
            let s = ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / ((2 * q - 2 * p) as f64);
            if s <= z[k] {
                k -= 1;
            } else {
                k += 1;
                v[k] = q;
                z[k] = s;
                z[k + 1] = f64::INFINITY;
                break;
            }
        }
    }
    k = 0;
    for q in 0..n {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let dq = q as f64 - v[k] as f64;
        d[q] = dq * dq + f[v[k]];
    }
}

/// Exact Euclidean distance transform of an occupancy mask, in cells.
pub fn euclidean_distance_transform(occupied: &[bool], width: usize, height: usize) -> Vec<f64> {
    let mut grid: Vec<f64> = occupied.iter().map(|&o| if o { 0.0 } else { FAR }).collect();
    if width == 0 || height == 0 {
        return grid;
    }

    let n = width.max(height);
    let mut f = vec![0.0; n];
    let mut d = vec![0.0; n];
    let mut v = vec![0usize; n];
    let mut z = vec![0.0; n + 1];

    for x in 0..width {
        for y in 0..height {
            f[y] = grid[y * width + x];
        }
        dt1d(&f[..height], &mut d[..height], &mut v[..height], &mut z[..height + 1]);
        for y in 0..height {
            grid[y * width + x] = d[y];
        }
    }
    for y in 0..height {
        f[..width].copy_from_slice(&grid[y * width..][..width]);
        dt1d(&f[..width], &mut d[..width], &mut v[..width], &mut z[..width + 1]);
        grid[y * width..][..width].copy_from_slice(&d[..width]);
    }

    for value in grid.iter_mut() {
        *value = value.sqrt();
    }
    grid
}

/// Distance-to-collision and cost fields over the whole grid.
///
/// Occupied cells are dilated by the robot radius with a disc structuring
/// element; the dilated mask is inverted and run through an exact Euclidean
/// distance transform. The cost field is `exp(-w * d)`, equal to 1 on
/// collisions and falling toward 0 in open space.
#[derive(Clone, Debug)]
pub struct Costmap {
    origin: Point2<f64>,
    resolution: f64,
    width: usize,
    height: usize,
    distance_to_collision: Vec<f64>,
    cost: Vec<f64>,
}

impl Costmap {
    /// Build from a snapshot of the current cells. Holds the grid mutex
    /// only while copying the occupancy mask.
    pub fn from_map_data(map: &MapData, robot_radius: f64, exponential_weight: f64) -> Self {
        let dims = *map.dimensions();
        let width = dims.size().x as usize;
        let height = dims.size().y as usize;
        let resolution = dims.resolution();

        let occupied: Vec<bool> = {
            let grid = map.lock();
            let occupancy_log = grid.occupancy_log();
            grid.cells().iter().map(|&c| c >= occupancy_log).collect()
        };

        // Dilate by the robot radius.
        let r_cells = (robot_radius / resolution).ceil() as i32;
        let mut disc = Vec::new();
        for dy in -r_cells..=r_cells {
            for dx in -r_cells..=r_cells {
                if dx * dx + dy * dy <= r_cells * r_cells {
                    disc.push((dx, dy));
                }
            }
        }
        let mut dilated = vec![false; width * height];
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                if !occupied[y as usize * width + x as usize] {
                    continue;
                }
                for &(dx, dy) in &disc {
                    let nx = x + dx;
                    let ny = y + dy;
                    if nx >= 0 && ny >= 0 && nx < width as i32 && ny < height as i32 {
                        dilated[ny as usize * width + nx as usize] = true;
                    }
                }
            }
        }

        let distance_to_collision: Vec<f64> = euclidean_distance_transform(&dilated, width, height)
            .into_iter()
            .map(|d| d * resolution)
            .collect();
        let cost = distance_to_collision
            .iter()
            .map(|&d| (-exponential_weight * d).exp())
            .collect();

        Self {
            origin: dims.origin(),
            resolution,
            width,
            height,
            distance_to_collision,
            cost,
        }
    }

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    #[inline]
    fn index_world(&self, point: Point2<f64>) -> Option<usize> {
        let x = ((point.x - self.origin.x) / self.resolution).floor() as i32;
        let y = ((point.y - self.origin.y) / self.resolution).floor() as i32;
        if x >= 0 && y >= 0 && (x as usize) < self.width && (y as usize) < self.height {
            Some(y as usize * self.width + x as usize)
        } else {
            None
        }
    }

    /// Distance to collision at a world point; 0 off the grid.
    #[inline]
    pub fn distance_at(&self, point: Point2<f64>) -> f64 {
        self.index_world(point)
            .map(|i| self.distance_to_collision[i])
            .unwrap_or(0.0)
    }

    /// Cell cost at a world point; 1 off the grid.
    #[inline]
    pub fn cost_at(&self, point: Point2<f64>) -> f64 {
        self.index_world(point).map(|i| self.cost[i]).unwrap_or(1.0)
    }

    /// Minimum distance to collision over the body offset points.
    pub fn clearance(&self, pose: &Isometry2<f64>) -> f64 {
        BODY_OFFSETS
            .iter()
            .map(|o| self.distance_at(pose * Point2::new(o[0], o[1])))
            .fold(f64::MAX, f64::min)
    }

    /// Maximum cell cost over the body offset points.
    pub fn state_cost(&self, pose: &Isometry2<f64>) -> f64 {
        BODY_OFFSETS
            .iter()
            .map(|o| self.cost_at(pose * Point2::new(o[0], o[1])))
            .fold(0.0, f64::max)
    }

    /// A state is valid iff every offset point has positive clearance.
    #[inline]
    pub fn valid(&self, pose: &Isometry2<f64>) -> bool {
        self.clearance(pose) > 0.0
    }
}

/// Signed distance field over a local region, for the elastic band.
///
/// Built the same way as [`Costmap`] but without dilation: the returned
/// distance is metres to the nearest occupied cell minus the robot radius,
/// so negative values mean collision.
#[derive(Clone, Debug)]
pub struct DistanceField {
    origin: Point2<f64>,
    resolution: f64,
    width: usize,
    height: usize,
    distance: Vec<f64>,
    robot_radius: f64,
}

impl DistanceField {
    pub fn new(map: &MapData, region: CellBounds, robot_radius: f64) -> Self {
        let dims = *map.dimensions();
        let region = region.intersection(&dims.bounds());
        let width = region.width() as usize;
        let height = region.height() as usize;

        let occupied: Vec<bool> = {
            let grid = map.lock();
            let occupancy_log = grid.occupancy_log();
            let mut mask = Vec::with_capacity(width * height);
            for y in region.min.y..region.max.y {
                for x in region.min.x..region.max.x {
                    let c = grid
                        .get(bhumi_map::GridCoord::new(x, y))
                        .unwrap_or(bhumi_map::UNKNOWN);
                    mask.push(c >= occupancy_log);
                }
            }
            mask
        };

        let distance = euclidean_distance_transform(&occupied, width, height)
            .into_iter()
            .map(|d| d * dims.resolution())
            .collect();

        // World position of the lower-left corner of the region.
        let corner = dims.grid_to_world(region.min);
        Self {
            origin: Point2::new(
                corner.x - 0.5 * dims.resolution(),
                corner.y - 0.5 * dims.resolution(),
            ),
            resolution: dims.resolution(),
            width,
            height,
            distance,
            robot_radius,
        }
    }

    #[inline]
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Signed clearance at a world point. Points outside the region clamp
    /// to the nearest region cell.
    pub fn distance(&self, point: Point2<f64>) -> f64 {
        if self.width == 0 || self.height == 0 {
            return f64::MAX;
        }
        let x = (((point.x - self.origin.x) / self.resolution).floor() as i32)
            .clamp(0, self.width as i32 - 1) as usize;
        let y = (((point.y - self.origin.y) / self.resolution).floor() as i32)
            .clamp(0, self.height as i32 - 1) as usize;
        self.distance[y * self.width + x] - self.robot_radius
    }

    /// Unit gradient of the distance field (points away from obstacles).
    pub fn gradient(&self, point: Point2<f64>) -> Vector2<f64> {
        let h = self.resolution;
        let gx = self.distance(Point2::new(point.x + h, point.y))
            - self.distance(Point2::new(point.x - h, point.y));
        let gy = self.distance(Point2::new(point.x, point.y + h))
            - self.distance(Point2::new(point.x, point.y - h));
        let g = Vector2::new(gx, gy);
        let norm = g.norm();
        if norm > 1e-9 {
            g / norm
        } else {
            Vector2::zeros()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bhumi_map::cells::ClampParams;
    use bhumi_map::{GridCoord, HdMap, MapDimensions};
    use std::sync::Arc;

    /// 5m x 5m empty map at 0.05m/cell, centred on the origin.
    fn create_test_map() -> Arc<MapData> {
        let dims = MapDimensions::new(Point2::new(-2.5, -2.5), 0.05, GridCoord::new(100, 100));
        Arc::new(MapData::new(HdMap::default(), dims, ClampParams::default()))
    }

    fn occupy_block(map: &MapData, min: GridCoord, max: GridCoord) {
        let mut grid = map.lock();
        let delta = grid.max_log();
        for y in min.y..max.y {
            for x in min.x..max.x {
                grid.update(GridCoord::new(x, y), delta);
            }
        }
    }

    #[test]
    fn test_edt_single_obstacle() {
        let mut occupied = vec![false; 25];
        occupied[2 * 5 + 2] = true;
        let d = euclidean_distance_transform(&occupied, 5, 5);
        assert_eq!(d[2 * 5 + 2], 0.0);
        assert!((d[2 * 5 + 3] - 1.0).abs() < 1e-9);
        assert!((d[0] - (8.0f64).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_edt_empty_is_far() {
        let occupied = vec![false; 16];
        let d = euclidean_distance_transform(&occupied, 4, 4);
        assert!(d.iter().all(|&v| v > 100.0));
    }

    #[test]
    fn test_costmap_collision_cost_is_one() {
        let map = create_test_map();
        occupy_block(&map, GridCoord::new(48, 48), GridCoord::new(52, 52));
        let costmap = Costmap::from_map_data(&map, 0.25, 2.0);

        // At the obstacle itself.
        assert_eq!(costmap.cost_at(Point2::new(0.0, 0.0)), 1.0);
        assert_eq!(costmap.distance_at(Point2::new(0.0, 0.0)), 0.0);
        // Far away the cost decays.
        assert!(costmap.cost_at(Point2::new(-2.0, -2.0)) < 0.1);
    }

    #[test]
    fn test_costmap_validity_respects_radius() {
        let map = create_test_map();
        occupy_block(&map, GridCoord::new(48, 48), GridCoord::new(52, 52));
        let costmap = Costmap::from_map_data(&map, 0.25, 2.0);

        // On top of the obstacle: invalid.
        assert!(!costmap.valid(&Isometry2::new(nalgebra::Vector2::new(0.0, 0.0), 0.0)));
        // Just inside the dilated radius: still invalid.
        assert!(!costmap.valid(&Isometry2::new(nalgebra::Vector2::new(0.3, 0.0), 0.0)));
        // Well clear of the obstacle: valid.
        assert!(costmap.valid(&Isometry2::new(nalgebra::Vector2::new(1.5, 0.0), 0.0)));
    }

    #[test]
    fn test_costmap_off_grid_is_lethal() {
        let map = create_test_map();
        let costmap = Costmap::from_map_data(&map, 0.25, 2.0);
        assert_eq!(costmap.cost_at(Point2::new(10.0, 10.0)), 1.0);
        assert_eq!(costmap.distance_at(Point2::new(10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_distance_field_sign() {
        let map = create_test_map();
        occupy_block(&map, GridCoord::new(48, 48), GridCoord::new(52, 52));
        let region = map.dimensions().bounds();
        let field = DistanceField::new(&map, region, 0.2);

        assert!(field.distance(Point2::new(0.0, 0.0)) < 0.0);
        assert!(field.distance(Point2::new(1.5, 0.0)) > 0.0);
    }

    #[test]
    fn test_distance_field_gradient_points_away() {
        let map = create_test_map();
        occupy_block(&map, GridCoord::new(48, 48), GridCoord::new(52, 52));
        let region = map.dimensions().bounds();
        let field = DistanceField::new(&map, region, 0.2);

        let g = field.gradient(Point2::new(0.5, 0.0));
        assert!(g.x > 0.5, "gradient should point away from the obstacle");
    }
}
