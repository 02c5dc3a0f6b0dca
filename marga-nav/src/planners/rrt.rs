//! Goal-biased randomised tree planner over SE(2).

use std::sync::Arc;
use std::time::{Duration, Instant};

use bhumi_map::{ConfigError, MapData};
use bhumi_map::params::config_with_default_warn;
use nalgebra::{Isometry2, Vector2};
use rand::Rng;
use tracing::{debug, info};

use crate::interface::{Path, PathOutcome, PathPlanner, PlanResult};
use crate::planners::costmap::Costmap;

/// Wall-clock budget of the first solve attempt.
const FIRST_SOLVE_BUDGET: Duration = Duration::from_millis(200);

/// Budget of the continuation when the first attempt fails.
const CONTINUATION_BUDGET: Duration = Duration::from_secs(2);

/// Waypoints closer than this are collapsed during simplification.
const SIMPLIFY_TOLERANCE: f64 = 0.05;

/// Maximum waypoint repair attempts before reporting failure.
const MAX_REPAIR_ATTEMPTS: usize = 1000;

/// Angle weight of the SE(2) distance used for nearest-neighbour search.
const ANGLE_WEIGHT: f64 = 0.3;

struct TreeNode {
    pose: Isometry2<f64>,
    parent: Option<usize>,
}

/// Sampling-based global path planner.
///
/// Grows a goal-biased random tree against the distance-to-collision field,
/// then simplifies, interpolates at grid resolution and repairs the
/// resulting path.
pub struct RrtPathPlanner {
    map_data: Option<Arc<MapData>>,
    costmap: Option<Costmap>,
    robot_radius: f64,
    exponential_weight: f64,
    goal_bias: f64,
    max_extension: f64,
}

impl Default for RrtPathPlanner {
    fn default() -> Self {
        Self {
            map_data: None,
            costmap: None,
            robot_radius: 0.5,
            exponential_weight: 2.0,
            goal_bias: 0.2,
            max_extension: 0.5,
        }
    }
}

impl RrtPathPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    fn se2_distance(a: &Isometry2<f64>, b: &Isometry2<f64>) -> f64 {
        let xy = (b.translation.vector - a.translation.vector).norm();
        let angle = (b.rotation.angle() - a.rotation.angle()).abs();
        xy + ANGLE_WEIGHT * angle
    }

    fn interpolate(a: &Isometry2<f64>, b: &Isometry2<f64>, t: f64) -> Isometry2<f64> {
        let translation = a.translation.vector.lerp(&b.translation.vector, t);
        let rotation = a.rotation.slerp(&b.rotation, t);
        Isometry2::from_parts(translation.into(), rotation)
    }

    /// Check a motion by sampling it at grid resolution.
    fn segment_valid(costmap: &Costmap, a: &Isometry2<f64>, b: &Isometry2<f64>) -> bool {
        let length = (b.translation.vector - a.translation.vector).norm();
        let steps = (length / costmap.resolution()).ceil().max(1.0) as usize;
        (0..=steps).all(|i| costmap.valid(&Self::interpolate(a, b, i as f64 / steps as f64)))
    }

    /// Grow `tree` toward `goal` until the deadline; returns the index of a
    /// node connected to the goal.
    fn grow(
        &self,
        tree: &mut Vec<TreeNode>,
        costmap: &Costmap,
        goal: &Isometry2<f64>,
        bounds: (Vector2<f64>, Vector2<f64>),
        budget: Duration,
    ) -> Option<usize> {
        let deadline = Instant::now() + budget;
        let mut rng = rand::thread_rng();

        while Instant::now() < deadline {
            let target = if rng.gen::<f64>() < self.goal_bias {
                *goal
            } else {
                Isometry2::new(
                    Vector2::new(
                        rng.gen_range(bounds.0.x..bounds.1.x),
                        rng.gen_range(bounds.0.y..bounds.1.y),
                    ),
                    rng.gen_range(-std::f64::consts::PI..std::f64::consts::PI),
                )
            };

            let nearest = (0..tree.len())
                .min_by(|&a, &b| {
                    Self::se2_distance(&tree[a].pose, &target)
                        .partial_cmp(&Self::se2_distance(&tree[b].pose, &target))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap();
            let from = tree[nearest].pose;

            let distance = (target.translation.vector - from.translation.vector).norm();
            let new_pose = if distance <= self.max_extension {
                target
            } else {
                Self::interpolate(&from, &target, self.max_extension / distance)
            };

            if !costmap.valid(&new_pose) || !Self::segment_valid(costmap, &from, &new_pose) {
                continue;
            }
            tree.push(TreeNode {
                pose: new_pose,
                parent: Some(nearest),
            });
            let new_index = tree.len() - 1;

            if Self::segment_valid(costmap, &new_pose, goal) {
                tree.push(TreeNode {
                    pose: *goal,
                    parent: Some(new_index),
                });
                return Some(tree.len() - 1);
            }
        }
        None
    }

    /// Line-of-sight shortcutting followed by near-duplicate collapse.
    fn simplify(costmap: &Costmap, nodes: &[Isometry2<f64>]) -> Vec<Isometry2<f64>> {
        if nodes.len() <= 2 {
            return nodes.to_vec();
        }
        let mut shortcut = vec![nodes[0]];
        let mut i = 0;
        while i < nodes.len() - 1 {
            let mut furthest = i + 1;
            for j in (i + 2)..nodes.len() {
                if Self::segment_valid(costmap, &nodes[i], &nodes[j]) {
                    furthest = j;
                }
            }
            shortcut.push(nodes[furthest]);
            i = furthest;
        }

        let mut out: Vec<Isometry2<f64>> = vec![shortcut[0]];
        for (i, node) in shortcut.iter().enumerate().skip(1) {
            let spacing =
                (node.translation.vector - out.last().unwrap().translation.vector).norm();
            if spacing >= SIMPLIFY_TOLERANCE || i == shortcut.len() - 1 {
                out.push(*node);
            }
        }
        out
    }

    /// Insert waypoints so consecutive nodes are at most one cell apart.
    fn interpolate_path(costmap: &Costmap, nodes: &[Isometry2<f64>]) -> Vec<Isometry2<f64>> {
        let mut out = Vec::new();
        for pair in nodes.windows(2) {
            let length = (pair[1].translation.vector - pair[0].translation.vector).norm();
            let steps = (length / costmap.resolution()).ceil().max(1.0) as usize;
            for i in 0..steps {
                out.push(Self::interpolate(&pair[0], &pair[1], i as f64 / steps as f64));
            }
        }
        out.push(*nodes.last().unwrap());
        out
    }

    /// Nudge invalid waypoints until the whole path checks out.
    fn repair(costmap: &Costmap, nodes: &mut [Isometry2<f64>]) -> bool {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_REPAIR_ATTEMPTS {
            let invalid = nodes.iter().position(|n| !costmap.valid(n));
            let Some(i) = invalid else {
                return true;
            };
            let nudge = 2.0 * costmap.resolution();
            let candidate = Isometry2::from_parts(
                (nodes[i].translation.vector
                    + Vector2::new(rng.gen_range(-nudge..nudge), rng.gen_range(-nudge..nudge)))
                .into(),
                nodes[i].rotation,
            );
            if costmap.valid(&candidate) {
                nodes[i] = candidate;
            }
        }
        nodes.iter().all(|n| costmap.valid(n))
    }

    /// Integral of the max-offset cost along interpolated states.
    fn path_cost(costmap: &Costmap, nodes: &[Isometry2<f64>]) -> f64 {
        if nodes.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        for pair in nodes.windows(2) {
            let length = (pair[1].translation.vector - pair[0].translation.vector).norm();
            let steps = (length / costmap.resolution()).ceil().max(1.0) as usize;
            let ds = length / steps as f64;
            for i in 0..=steps {
                let pose = Self::interpolate(&pair[0], &pair[1], i as f64 / steps as f64);
                if !costmap.valid(&pose) {
                    return f64::MAX;
                }
                total += costmap.state_cost(&pose) * ds;
            }
        }
        total
    }
}

impl PathPlanner for RrtPathPlanner {
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError> {
        self.robot_radius = config_with_default_warn(params, "robot_radius", self.robot_radius)?;
        self.exponential_weight =
            config_with_default_warn(params, "exponential_weight", self.exponential_weight)?;
        self.goal_bias = config_with_default_warn(params, "goal_bias", self.goal_bias)?;
        self.max_extension =
            config_with_default_warn(params, "max_extension", self.max_extension)?;
        if self.robot_radius <= 0.0 {
            return Err(ConfigError::Invalid("robot_radius must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.goal_bias) {
            return Err(ConfigError::Invalid("goal_bias must lie in [0, 1]".to_string()));
        }
        Ok(())
    }

    fn on_map_changed(&mut self, map: Arc<MapData>) {
        self.map_data = Some(map);
        self.costmap = None;
    }

    fn plan(&mut self, start: &Isometry2<f64>, goal: &Isometry2<f64>) -> PlanResult {
        let Some(map) = self.map_data.clone() else {
            return PlanResult::failed();
        };
        let costmap = Costmap::from_map_data(&map, self.robot_radius, self.exponential_weight);

        let dims = *map.dimensions();
        let origin = dims.origin();
        let extent = Vector2::new(
            dims.size().x as f64 * dims.resolution(),
            dims.size().y as f64 * dims.resolution(),
        );
        let bounds = (
            Vector2::new(origin.x, origin.y),
            Vector2::new(origin.x + extent.x, origin.y + extent.y),
        );

        let result = 'plan: {
            if !costmap.valid(start) || !costmap.valid(goal) {
                debug!("start or goal state is in collision");
                break 'plan PlanResult::failed();
            }

            let mut tree = vec![TreeNode {
                pose: *start,
                parent: None,
            }];

            // The straight connection is the best goal-biased first try.
            let solution = if Self::segment_valid(&costmap, start, goal) {
                tree.push(TreeNode {
                    pose: *goal,
                    parent: Some(0),
                });
                Some(tree.len() - 1)
            } else {
                self.grow(&mut tree, &costmap, goal, bounds, FIRST_SOLVE_BUDGET)
                    .or_else(|| {
                        self.grow(&mut tree, &costmap, goal, bounds, CONTINUATION_BUDGET)
                    })
            };

            let Some(goal_index) = solution else {
                debug!("no solution within the planning budget");
                break 'plan PlanResult::failed();
            };

            let mut nodes = Vec::new();
            let mut index = Some(goal_index);
            while let Some(i) = index {
                nodes.push(tree[i].pose);
                index = tree[i].parent;
            }
            nodes.reverse();

            let simplified = Self::simplify(&costmap, &nodes);
            let mut interpolated = Self::interpolate_path(&costmap, &simplified);
            if !Self::repair(&costmap, &mut interpolated) {
                break 'plan PlanResult::failed();
            }

            let cost = Self::path_cost(&costmap, &interpolated);
            let path = Path::new(interpolated);
            info!(
                "planned a path of {} nodes, {:.2}m, cost {:.3}",
                path.nodes.len(),
                path.length(),
                cost
            );
            PlanResult {
                outcome: PathOutcome::Successful,
                path,
                cost,
            }
        };

        self.costmap = Some(costmap);
        result
    }

    fn valid(&self, path: &Path) -> bool {
        let Some(costmap) = &self.costmap else {
            return false;
        };
        if path.nodes.is_empty() {
            return false;
        }
        if path.nodes.len() == 1 {
            return costmap.valid(&path.nodes[0]);
        }
        path.nodes
            .windows(2)
            .all(|pair| Self::segment_valid(costmap, &pair[0], &pair[1]))
    }

    fn cost(&self, path: &Path) -> f64 {
        let Some(costmap) = &self.costmap else {
            return f64::MAX;
        };
        Self::path_cost(costmap, &path.nodes)
    }
}
