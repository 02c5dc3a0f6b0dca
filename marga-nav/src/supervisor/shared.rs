//! Shared state between the supervisor's threads.
//!
//! Lock order, outermost first: goal, tracking path, control trajectory,
//! robot state, grid mutex (inside the layered map). Every function here
//! takes at most one of these locks.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bhumi_map::Stamp;
use nalgebra::Isometry2;
use parking_lot::{Condvar, Mutex};

use crate::interface::{KinodynamicState, Path, Trajectory};

/// Latest robot state, updated on every odometry message.
#[derive(Clone, Debug)]
pub struct RobotState {
    /// Steady-clock time of the update.
    pub time: Instant,
    /// Kinodynamic state in the odom frame.
    pub state: KinodynamicState,
    /// Stamp of the odometry message.
    pub odom_stamp: Stamp,
    /// True if `map_to_odom` is valid.
    pub localised: bool,
    pub map_to_odom: Isometry2<f64>,
}

impl RobotState {
    /// Robot pose in the map frame.
    #[inline]
    pub fn map_pose(&self) -> Isometry2<f64> {
        self.map_to_odom * self.state.pose
    }
}

/// Single-producer, multi-consumer robot state slot.
#[derive(Debug, Default)]
pub struct SharedRobotState {
    inner: Mutex<Option<RobotState>>,
    condvar: Condvar,
}

impl SharedRobotState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new state and wake all waiters.
    pub fn update(&self, state: RobotState) {
        *self.inner.lock() = Some(state);
        self.condvar.notify_all();
    }

    pub fn latest(&self) -> Option<RobotState> {
        self.inner.lock().clone()
    }

    /// Block until a localised state is available or `timeout` expires.
    pub fn wait_for_localised(&self, timeout: Duration) -> Option<RobotState> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock();
        loop {
            if let Some(state) = guard.as_ref() {
                if state.localised {
                    return Some(state.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.condvar.wait_for(&mut guard, deadline - now);
        }
    }
}

/// What the supervisor currently tracks.
#[derive(Clone, Debug)]
pub struct TrackingPath {
    /// Transformed goal pose in the map frame.
    pub goal: Isometry2<f64>,
    pub start_time: Instant,
    pub start_cost: f64,
    /// Invariant: `last_successful_time >= start_time`.
    pub last_successful_time: Instant,
    pub last_successful_cost: f64,
    pub path: Path,
}

/// The trajectory currently being executed.
#[derive(Clone, Debug)]
pub struct ControlTrajectory {
    /// True if the final state coincides with the goal within tolerance.
    pub goal_trajectory: bool,
    pub trajectory: Trajectory,
}

/// Per-goal run flags and failure accounting.
///
/// A stage's counter resets on any successful tick of the same stage;
/// three consecutive failures abort the goal.
#[derive(Debug)]
pub struct GoalRun {
    running: AtomicBool,
    pub controller_done: AtomicBool,
    pub path_failures: AtomicU32,
    pub trajectory_failures: AtomicU32,
    pub control_failures: AtomicU32,
}

impl GoalRun {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            controller_done: AtomicBool::new(false),
            path_failures: AtomicU32::new(0),
            trajectory_failures: AtomicU32::new(0),
            control_failures: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signal the stage threads to stop at their next check.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl Default for GoalRun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn create_test_state(localised: bool) -> RobotState {
        RobotState {
            time: Instant::now(),
            state: KinodynamicState::stationary(Isometry2::new(Vector2::new(1.0, 0.0), 0.0)),
            odom_stamp: Duration::from_secs(1),
            localised,
            map_to_odom: Isometry2::new(Vector2::new(0.5, 0.0), 0.0),
        }
    }

    #[test]
    fn test_map_pose_composition() {
        let state = create_test_state(true);
        assert!((state.map_pose().translation.x - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_wait_for_localised_times_out() {
        let shared = SharedRobotState::new();
        shared.update(create_test_state(false));
        let start = Instant::now();
        assert!(shared.wait_for_localised(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_for_localised_wakes_on_update() {
        let shared = std::sync::Arc::new(SharedRobotState::new());
        let writer = shared.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            writer.update(create_test_state(true));
        });
        let state = shared.wait_for_localised(Duration::from_secs(1));
        assert!(state.is_some());
        handle.join().unwrap();
    }
}
