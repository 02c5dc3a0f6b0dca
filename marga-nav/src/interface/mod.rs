//! Plugin interfaces for the three planning stages.
//!
//! The path planner, trajectory planner and controller are variant sets
//! behind capability traits; the supervisor dispatches through trait
//! objects and never depends on a concrete implementation.

mod path;
mod trajectory;

pub use path::Path;
pub use trajectory::{KinodynamicState, Trajectory};

use std::sync::Arc;
use std::time::Instant;

use bhumi_map::msgs::{Odometry, Twist};
use bhumi_map::{CellBounds, ConfigError, MapData, Stamp};
use nalgebra::Isometry2;
use uuid::Uuid;

/// Outcome of a path planning attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOutcome {
    Successful,
    Failed,
}

/// Result of [`PathPlanner::plan`].
#[derive(Clone, Debug)]
pub struct PlanResult {
    pub outcome: PathOutcome,
    pub path: Path,
    pub cost: f64,
}

impl PlanResult {
    pub fn failed() -> Self {
        Self {
            outcome: PathOutcome::Failed,
            path: Path::default(),
            cost: 0.0,
        }
    }
}

/// Global path planner.
pub trait PathPlanner: Send {
    /// Read plugin parameters. Errors are fatal.
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError>;

    /// A new map became active.
    fn on_map_changed(&mut self, map: Arc<MapData>);

    /// Plan from `start` to `goal` against a snapshot of the current map.
    fn plan(&mut self, start: &Isometry2<f64>, goal: &Isometry2<f64>) -> PlanResult;

    /// Check a path against the snapshot of the most recent `plan` call.
    ///
    /// `valid` and `cost` may reuse planner state from that call; callers
    /// must not interleave planners.
    fn valid(&self, path: &Path) -> bool;

    /// Cost of an arbitrary path against the most recent snapshot.
    fn cost(&self, path: &Path) -> f64;
}

/// Outcome of a trajectory planning attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrajectoryOutcome {
    Successful,
    /// The band was truncated before an obstacle; the trajectory covers
    /// only part of the window.
    Partial,
    Failed,
}

/// Result of [`TrajectoryPlanner::plan`].
#[derive(Clone, Debug)]
pub struct TrajectoryResult {
    pub outcome: TrajectoryOutcome,
    pub trajectory: Option<Trajectory>,
    /// Range of nominal path nodes covered by the window.
    pub path_start_i: usize,
    pub path_end_i: usize,
    pub cost: f64,
}

impl TrajectoryResult {
    pub fn failed() -> Self {
        Self {
            outcome: TrajectoryOutcome::Failed,
            trajectory: None,
            path_start_i: 0,
            path_end_i: 0,
            cost: 0.0,
        }
    }
}

/// Local trajectory planner.
pub trait TrajectoryPlanner: Send {
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError>;

    fn on_map_changed(&mut self, map: Arc<MapData>);

    /// Adopt a nominal path. Returns false for an empty path.
    fn set_path(&mut self, path: Path) -> bool;

    fn clear_path(&mut self);

    /// Id of the currently-set nominal path.
    fn path_id(&self) -> Option<Uuid>;

    /// Plan a short-horizon trajectory in the odom frame.
    fn plan(
        &mut self,
        local_region: CellBounds,
        robot_state: &KinodynamicState,
        map_to_odom: &Isometry2<f64>,
    ) -> TrajectoryResult;
}

/// Controller execution state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Complete,
    Failed,
}

/// Result of [`Controller::compute_control`].
#[derive(Clone, Copy, Debug)]
pub struct Control {
    pub state: ControlState,
    pub cmd_vel: Twist,
}

impl Control {
    pub fn failed() -> Self {
        Self {
            state: ControlState::Failed,
            cmd_vel: Twist::ZERO,
        }
    }
}

/// Trajectory-tracking controller.
pub trait Controller: Send {
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError>;

    fn set_trajectory(&mut self, trajectory: Trajectory);

    fn clear_trajectory(&mut self);

    /// Id of the currently-set trajectory.
    fn trajectory_id(&self) -> Option<Uuid>;

    /// Compute the next velocity command.
    ///
    /// After `Complete` has been returned for a trajectory, subsequent
    /// calls must not produce motion.
    fn compute_control(&mut self, steady_now: Instant, now: Stamp, odom: &Odometry) -> Control;
}
