//! Trajectory-tracking controller plugin.

use std::time::Instant;

use bhumi_map::msgs::{Odometry, Twist};
use bhumi_map::params::config_with_default_warn;
use bhumi_map::{ConfigError, Stamp};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::interface::{Control, ControlState, Controller, Trajectory};
use crate::utils::normalize_angle;

/// Proportional-plus-damping trajectory tracker.
///
/// Tracks the current trajectory in the odom frame. Completion latches:
/// once the final state has been reached within tolerance, no further
/// motion is commanded for that trajectory.
pub struct TrackingController {
    trajectory: Option<Trajectory>,
    /// Index of the last matched trajectory state; never moves backwards.
    progress: usize,
    done: bool,

    max_velocity_xy: f64,
    max_velocity_w: f64,
    xy_goal_tolerance: f64,
    yaw_goal_tolerance: f64,
    k_prop: f64,
    k_damp: f64,
    /// Lateral distance from the trajectory at which tracking fails.
    max_tracking_error: f64,
}

impl Default for TrackingController {
    fn default() -> Self {
        Self {
            trajectory: None,
            progress: 0,
            done: false,
            max_velocity_xy: 0.5,
            max_velocity_w: 1.0,
            xy_goal_tolerance: 0.1,
            yaw_goal_tolerance: 0.05,
            k_prop: 4.0,
            k_damp: 3.5,
            max_tracking_error: 0.5,
        }
    }
}

impl TrackingController {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Controller for TrackingController {
    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError> {
        self.max_velocity_xy =
            config_with_default_warn(params, "max_velocity_xy", self.max_velocity_xy)?;
        self.max_velocity_w =
            config_with_default_warn(params, "max_velocity_w", self.max_velocity_w)?;
        self.xy_goal_tolerance =
            config_with_default_warn(params, "xy_goal_tolerance", self.xy_goal_tolerance)?;
        self.yaw_goal_tolerance =
            config_with_default_warn(params, "yaw_goal_tolerance", self.yaw_goal_tolerance)?;
        self.k_prop = config_with_default_warn(params, "k_prop", self.k_prop)?;
        self.k_damp = config_with_default_warn(params, "k_damp", self.k_damp)?;
        self.max_tracking_error =
            config_with_default_warn(params, "max_tracking_error", self.max_tracking_error)?;
        if self.max_velocity_xy <= 0.0 || self.max_velocity_w <= 0.0 {
            return Err(ConfigError::Invalid(
                "velocity limits must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn set_trajectory(&mut self, trajectory: Trajectory) {
        self.trajectory = Some(trajectory);
        self.progress = 0;
        self.done = false;
    }

    fn clear_trajectory(&mut self) {
        self.trajectory = None;
        self.progress = 0;
        self.done = false;
    }

    fn trajectory_id(&self) -> Option<Uuid> {
        self.trajectory.as_ref().map(|t| t.id)
    }

    fn compute_control(&mut self, _steady_now: Instant, _now: Stamp, odom: &Odometry) -> Control {
        let Some(trajectory) = &self.trajectory else {
            return Control::failed();
        };
        if trajectory.states.is_empty() {
            return Control::failed();
        }

        // Once complete, never move again for this trajectory.
        if self.done {
            return Control {
                state: ControlState::Complete,
                cmd_vel: Twist::ZERO,
            };
        }

        // Odometry predating the trajectory cannot be tracked against it.
        if odom.stamp < trajectory.stamp {
            warn!("odometry is older than the trajectory");
            return Control::failed();
        }

        let robot = odom.pose;

        // Closest state at or after the current progress index.
        let closest = (self.progress..trajectory.states.len())
            .min_by(|&a, &b| {
                let da = (trajectory.states[a].pose.translation.vector
                    - robot.translation.vector)
                    .norm();
                let db = (trajectory.states[b].pose.translation.vector
                    - robot.translation.vector)
                    .norm();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(self.progress);
        self.progress = closest;

        let tracking_error = (trajectory.states[closest].pose.translation.vector
            - robot.translation.vector)
            .norm();
        if tracking_error > self.max_tracking_error {
            warn!(
                "robot is {:.2}m off the trajectory (limit {:.2}m)",
                tracking_error, self.max_tracking_error
            );
            return Control::failed();
        }

        // Goal check against the final state.
        let last = trajectory.states.last().unwrap();
        let goal_error = (last.pose.translation.vector - robot.translation.vector).norm();
        let goal_yaw_error =
            normalize_angle(last.pose.rotation.angle() - robot.rotation.angle()).abs();
        if goal_error <= self.xy_goal_tolerance && goal_yaw_error <= self.yaw_goal_tolerance {
            debug!("trajectory complete ({:.3}m from goal)", goal_error);
            self.done = true;
            return Control {
                state: ControlState::Complete,
                cmd_vel: Twist::ZERO,
            };
        }

        // Track one state ahead of the closest.
        let target = &trajectory.states[(closest + 1).min(trajectory.states.len() - 1)];
        let error = robot.inverse() * target.pose;
        let yaw_error = error.rotation.angle();

        // Proportional drive toward the target with velocity damping,
        // capped by the trajectory's obstacle-scaled speed.
        let speed_cap = if target.velocity.x > 0.0 {
            target.velocity.x.min(self.max_velocity_xy)
        } else {
            self.max_velocity_xy
        };
        let vx = self.k_prop * error.translation.x - self.k_damp * odom.velocity.x;
        let vy = self.k_prop * error.translation.y - self.k_damp * odom.velocity.y;
        let w = self.k_prop * yaw_error - self.k_damp * odom.velocity.z;

        let norm = (vx * vx + vy * vy).sqrt();
        let scale = if norm > speed_cap { speed_cap / norm } else { 1.0 };

        Control {
            state: ControlState::Running,
            cmd_vel: Twist {
                linear_x: vx * scale,
                linear_y: vy * scale,
                angular_z: w.clamp(-self.max_velocity_w, self.max_velocity_w),
            },
        }
    }
}
