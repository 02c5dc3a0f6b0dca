//! Short-horizon trajectory representation.

use bhumi_map::Stamp;
use nalgebra::{Isometry2, Vector3};
use uuid::Uuid;

/// Pose together with velocity, sufficient to predict short-horizon motion.
#[derive(Clone, Copy, Debug)]
pub struct KinodynamicState {
    pub pose: Isometry2<f64>,
    /// Linear x, linear y, angular z.
    pub velocity: Vector3<f64>,
}

impl KinodynamicState {
    pub fn stationary(pose: Isometry2<f64>) -> Self {
        Self {
            pose,
            velocity: Vector3::zeros(),
        }
    }
}

/// Ordered kinodynamic states in the odom frame.
#[derive(Clone, Debug)]
pub struct Trajectory {
    /// Unique id of this trajectory.
    pub id: Uuid,
    /// Id of the path this trajectory was derived from.
    pub path_id: Uuid,
    /// Creation timestamp.
    pub stamp: Stamp,
    pub states: Vec<KinodynamicState>,
}

impl Trajectory {
    pub fn new(path_id: Uuid, stamp: Stamp, states: Vec<KinodynamicState>) -> Self {
        Self {
            id: Uuid::new_v4(),
            path_id,
            stamp,
            states,
        }
    }
}
