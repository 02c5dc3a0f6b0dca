//! Elastic-band trajectory planner plugin.

use std::sync::Arc;

use bhumi_map::params::config_with_default_warn;
use bhumi_map::{stamp_now, CellBounds, ConfigError, MapData};
use nalgebra::{Isometry2, Vector3};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interface::{
    KinodynamicState, Path, Trajectory, TrajectoryOutcome, TrajectoryPlanner, TrajectoryResult,
};
use crate::planners::costmap::DistanceField;
use crate::utils::normalize_angle;

use super::{simulate, update_distances, Band, MovingWindow, Node, SimulateParams};

/// Elastic band over a moving window of the nominal path.
pub struct BandPlanner {
    map_data: Option<Arc<MapData>>,
    window: Option<MovingWindow>,

    num_iterations: u32,
    internal_force_gain: f64,
    external_force_gain: f64,
    min_distance: f64,
    max_distance: f64,
    min_overlap: f64,
    max_window_length: f64,
    max_holonomic_distance: f64,
    max_reverse_distance: f64,
    robot_radius: f64,
    rotation_factor: f64,
    velocity_decay: f64,
    alpha_decay: f64,
    desired_speed: f64,
    spline: bool,
}

impl Default for BandPlanner {
    fn default() -> Self {
        Self {
            map_data: None,
            window: None,
            num_iterations: 50,
            internal_force_gain: 0.05,
            external_force_gain: 0.1,
            min_distance: 0.02,
            max_distance: 0.5,
            min_overlap: 0.2,
            max_window_length: 4.0,
            max_holonomic_distance: 0.6,
            max_reverse_distance: 1.5,
            robot_radius: 0.25,
            rotation_factor: 0.05,
            velocity_decay: 0.6,
            alpha_decay: 0.98,
            desired_speed: 0.15,
            spline: true,
        }
    }
}

impl BandPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catmull-Rom resample of the band at `spacing`, with headings
    /// interpolated between the original nodes.
    fn spline_band(band: &Band, spacing: f64) -> Band {
        let n = band.nodes.len();
        if n < 2 {
            return band.clone();
        }
        let points: Vec<_> = band
            .nodes
            .iter()
            .map(|node| node.pose.translation.vector)
            .collect();
        let tangent = |i: usize| {
            let prev = if i == 0 { points[0] } else { points[i - 1] };
            let next = if i + 1 >= n { points[n - 1] } else { points[i + 1] };
            (next - prev) * 0.5
        };

        let mut out = Band::default();
        for i in 0..n - 1 {
            let p0 = points[i];
            let p1 = points[i + 1];
            let m0 = tangent(i);
            let m1 = tangent(i + 1);
            let a0 = band.nodes[i].pose.rotation.angle();
            let a1 = band.nodes[i + 1].pose.rotation.angle();

            let chord = (p1 - p0).norm();
            let steps = (chord / spacing).ceil().max(1.0) as usize;
            for j in 0..steps {
                let t = j as f64 / steps as f64;
                let t2 = t * t;
                let t3 = t2 * t;
                let position = p0 * (2.0 * t3 - 3.0 * t2 + 1.0)
                    + m0 * (t3 - 2.0 * t2 + t)
                    + p1 * (-2.0 * t3 + 3.0 * t2)
                    + m1 * (t3 - t2);
                let heading = normalize_angle(a0 + normalize_angle(a1 - a0) * t);
                out.nodes.push(Node::new(Isometry2::new(position, heading)));
            }
        }
        out.nodes.push(band.nodes[n - 1].clone());
        out
    }
}

impl TrajectoryPlanner for BandPlanner {
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError> {
        self.num_iterations =
            config_with_default_warn(params, "num_iterations", self.num_iterations)?;
        self.internal_force_gain =
            config_with_default_warn(params, "internal_force_gain", self.internal_force_gain)?;
        self.external_force_gain =
            config_with_default_warn(params, "external_force_gain", self.external_force_gain)?;
        self.min_distance = config_with_default_warn(params, "min_distance", self.min_distance)?;
        self.max_distance = config_with_default_warn(params, "max_distance", self.max_distance)?;
        self.min_overlap = config_with_default_warn(params, "min_overlap", self.min_overlap)?;
        self.max_window_length =
            config_with_default_warn(params, "max_window_length", self.max_window_length)?;
        self.max_holonomic_distance = config_with_default_warn(
            params,
            "max_holonomic_distance",
            self.max_holonomic_distance,
        )?;
        self.max_reverse_distance =
            config_with_default_warn(params, "max_reverse_distance", self.max_reverse_distance)?;
        self.robot_radius = config_with_default_warn(params, "robot_radius", self.robot_radius)?;
        self.rotation_factor =
            config_with_default_warn(params, "rotation_factor", self.rotation_factor)?;
        self.velocity_decay =
            config_with_default_warn(params, "velocity_decay", self.velocity_decay)?;
        self.alpha_decay = config_with_default_warn(params, "alpha_decay", self.alpha_decay)?;
        self.desired_speed =
            config_with_default_warn(params, "desired_speed", self.desired_speed)?;
        self.spline = config_with_default_warn(params, "spline", self.spline)?;

        if self.robot_radius <= 0.0 {
            return Err(ConfigError::Invalid("robot_radius must be positive".to_string()));
        }
        if self.min_distance >= self.max_distance {
            return Err(ConfigError::Invalid(
                "min_distance must be below max_distance".to_string(),
            ));
        }
        Ok(())
    }

    fn on_map_changed(&mut self, map: Arc<MapData>) {
        self.map_data = Some(map);
    }

    fn set_path(&mut self, path: Path) -> bool {
        if path.nodes.is_empty() {
            return false;
        }
        self.window = Some(MovingWindow::new(path));
        true
    }

    fn clear_path(&mut self) {
        self.window = None;
    }

    fn path_id(&self) -> Option<Uuid> {
        self.window.as_ref().map(|w| w.nominal.id)
    }

    fn plan(
        &mut self,
        local_region: CellBounds,
        robot_state: &KinodynamicState,
        map_to_odom: &Isometry2<f64>,
    ) -> TrajectoryResult {
        let Some(map) = self.map_data.clone() else {
            return TrajectoryResult::failed();
        };
        let Some(window) = self.window.as_mut() else {
            return TrajectoryResult::failed();
        };

        let robot_pose = map_to_odom * robot_state.pose;
        window.update(&robot_pose, self.max_window_length);
        if window.window.nodes.is_empty() {
            return TrajectoryResult::failed();
        }

        let field = DistanceField::new(&map, local_region, self.robot_radius);

        // The robot anchors the band; the first window node is the segment
        // already behind it.
        let mut band = Band {
            nodes: vec![Node::new(robot_pose)],
        };
        if window.window.nodes.len() > 1 {
            band.nodes.extend(window.window.nodes[1..].iter().cloned());
        } else {
            band.nodes.push(window.window.nodes[0].clone());
        }

        // Regime selection.
        let path_length = window.nominal.length();
        let goal_wrt_robot = robot_pose.inverse()
            * *window
                .nominal
                .nodes
                .last()
                .expect("nominal path is never empty");
        let rotation = goal_wrt_robot.rotation.angle().abs();
        let mut long_path = true;
        let mut reverse_direction = false;
        if path_length < self.max_holonomic_distance {
            long_path = false;
        } else if goal_wrt_robot.translation.x < 0.0
            && path_length < self.max_reverse_distance
            && rotation < std::f64::consts::FRAC_PI_2
        {
            reverse_direction = true;
        }

        let params = SimulateParams {
            num_iterations: self.num_iterations,
            min_overlap: self.min_overlap,
            min_distance: self.min_distance,
            internal_force_gain: self.internal_force_gain,
            external_force_gain: self.external_force_gain,
            rotation_factor: if long_path && !reverse_direction {
                self.rotation_factor
            } else {
                0.0
            },
            reverse_direction,
            velocity_decay: self.velocity_decay,
            alpha_start: 1.0,
            alpha_decay: self.alpha_decay,
            max_distance: self.max_distance,
        };
        simulate(&mut band, &field, &params);

        // The relaxed band becomes the warm window for the next tick.
        window.window.nodes = band.nodes.clone();

        // Truncate at the first colliding node.
        let mut outcome = TrajectoryOutcome::Successful;
        let mut path_end_i = window.end_i;
        if let Some(first_invalid) = band.nodes.iter().position(|n| n.min_distance() < 0.0) {
            let removed = band.nodes.len() - first_invalid;
            band.nodes.truncate(first_invalid);
            outcome = TrajectoryOutcome::Partial;
            path_end_i = window.end_i.saturating_sub(removed);
            warn!("band truncated at node {} (collision ahead)", first_invalid);
            // The band is broken; restart from the nominal path next tick.
            window.reset();
        }
        if band.nodes.is_empty() {
            return TrajectoryResult::failed();
        }

        let band = if self.spline && band.nodes.len() > 1 {
            let mut splined = Self::spline_band(&band, 4.0 * field.resolution());
            update_distances(&mut splined, &field, self.max_distance);
            if splined.nodes.iter().any(|n| n.min_distance() < 0.0) {
                debug!("splined trajectory collides, rejecting");
                return TrajectoryResult::failed();
            }
            splined
        } else {
            band
        };

        // Convert to the odom frame with obstacle-scaled speeds.
        let odom_from_map = map_to_odom.inverse();
        let states = band
            .nodes
            .iter()
            .map(|node| {
                let min_distance = node.min_distance();
                let scale = if min_distance >= self.max_distance {
                    1.0
                } else {
                    4.0 * min_distance
                };
                let velocity = self.desired_speed * scale.max(0.2);
                KinodynamicState {
                    pose: odom_from_map * node.pose,
                    velocity: Vector3::new(velocity, 0.0, 0.0),
                }
            })
            .collect();

        TrajectoryResult {
            outcome,
            trajectory: Some(Trajectory::new(window.nominal.id, stamp_now(), states)),
            path_start_i: window.start_i,
            path_end_i,
            cost: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bhumi_map::cells::ClampParams;
    use bhumi_map::{GridCoord, HdMap, MapDimensions};
    use nalgebra::{Point2, Vector2};

    fn create_test_map() -> Arc<MapData> {
        let dims = MapDimensions::new(Point2::new(-2.5, -2.5), 0.05, GridCoord::new(100, 100));
        Arc::new(MapData::new(HdMap::default(), dims, ClampParams::default()))
    }

    fn straight_path(from: f64, to: f64, spacing: f64) -> Path {
        let count = ((to - from) / spacing) as usize + 1;
        Path::new(
            (0..count)
                .map(|i| Isometry2::new(Vector2::new(from + i as f64 * spacing, 0.0), 0.0))
                .collect(),
        )
    }

    fn create_test_planner(map: &Arc<MapData>) -> BandPlanner {
        let mut planner = BandPlanner::new();
        planner.on_map_changed(map.clone());
        planner
    }

    #[test]
    fn test_plan_without_path_fails() {
        let map = create_test_map();
        let mut planner = create_test_planner(&map);
        let state = KinodynamicState::stationary(Isometry2::identity());
        let result = planner.plan(map.dimensions().bounds(), &state, &Isometry2::identity());
        assert_eq!(result.outcome, TrajectoryOutcome::Failed);
    }

    #[test]
    fn test_plan_produces_odom_trajectory() {
        let map = create_test_map();
        let mut planner = create_test_planner(&map);
        let path = straight_path(0.0, 2.0, 0.1);
        let path_id = path.id;
        assert!(planner.set_path(path));
        assert_eq!(planner.path_id(), Some(path_id));

        let state = KinodynamicState::stationary(Isometry2::identity());
        let result = planner.plan(map.dimensions().bounds(), &state, &Isometry2::identity());

        assert_eq!(result.outcome, TrajectoryOutcome::Successful);
        let trajectory = result.trajectory.unwrap();
        assert_eq!(trajectory.path_id, path_id);
        assert!(trajectory.states.len() > 2);
        // Far from all obstacles the band commands the desired speed.
        assert!(trajectory
            .states
            .iter()
            .all(|s| (s.velocity.x - 0.15).abs() < 1e-9));
    }

    #[test]
    fn test_band_collision_reports_partial() {
        let map = create_test_map();
        // Wall across the path at x = 1.0.
        {
            let mut grid = map.lock();
            let delta = grid.max_log();
            for y in 0..100 {
                for x in 68..72 {
                    grid.update(GridCoord::new(x, y), delta);
                }
            }
        }
        let mut planner = create_test_planner(&map);
        let params: toml::Value = toml::from_str("spline = false").unwrap();
        planner.on_initialize(&params).unwrap();
        planner.set_path(straight_path(0.0, 2.0, 0.1));

        let state = KinodynamicState::stationary(Isometry2::identity());
        let result = planner.plan(map.dimensions().bounds(), &state, &Isometry2::identity());

        assert_eq!(result.outcome, TrajectoryOutcome::Partial);
        // The window was reset for a fresh start next tick.
        let window = planner.window.as_ref().unwrap();
        assert!(window.window.nodes.is_empty());
    }

    #[test]
    fn test_empty_path_rejected() {
        let map = create_test_map();
        let mut planner = create_test_planner(&map);
        assert!(!planner.set_path(Path::new(Vec::new())));
        assert_eq!(planner.path_id(), None);
    }

    #[test]
    fn test_clear_path() {
        let map = create_test_map();
        let mut planner = create_test_planner(&map);
        planner.set_path(straight_path(0.0, 1.0, 0.1));
        planner.clear_path();
        assert_eq!(planner.path_id(), None);
    }
}
