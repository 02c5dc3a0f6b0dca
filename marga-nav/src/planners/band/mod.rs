//! Elastic-band trajectory planning over a moving window.

mod planner;
mod simulate;
mod window;

pub use planner::BandPlanner;
pub use simulate::{simulate, SimulateParams};
pub use window::MovingWindow;

use nalgebra::{Isometry2, Point2, Vector2};

use crate::planners::costmap::{DistanceField, BODY_OFFSETS};

/// A body-frame control point with its current clearance.
#[derive(Clone, Debug)]
pub struct ControlPoint {
    pub offset: Vector2<f64>,
    pub distance: f64,
    pub gradient: Vector2<f64>,
}

/// One bubble of the band.
#[derive(Clone, Debug)]
pub struct Node {
    pub pose: Isometry2<f64>,
    pub control_points: Vec<ControlPoint>,
    /// Index of the control point with minimum distance.
    pub closest_point: usize,
}

impl Node {
    pub fn new(pose: Isometry2<f64>) -> Self {
        Self {
            pose,
            control_points: BODY_OFFSETS
                .iter()
                .map(|o| ControlPoint {
                    offset: Vector2::new(o[0], o[1]),
                    distance: f64::MAX,
                    gradient: Vector2::zeros(),
                })
                .collect(),
            closest_point: 0,
        }
    }

    /// Clearance of the worst control point.
    #[inline]
    pub fn min_distance(&self) -> f64 {
        self.control_points[self.closest_point].distance
    }

    /// Refresh control-point distances and gradients from the field.
    pub fn refresh(&mut self, field: &DistanceField, max_distance: f64) {
        let mut closest = 0;
        let mut best = f64::MAX;
        for (i, cp) in self.control_points.iter_mut().enumerate() {
            let world = self.pose * Point2::new(cp.offset.x, cp.offset.y);
            cp.distance = field.distance(world).min(max_distance);
            cp.gradient = field.gradient(world);
            if cp.distance < best {
                best = cp.distance;
                closest = i;
            }
        }
        self.closest_point = closest;
    }
}

/// Sequence of bubbles from the robot toward the window end.
#[derive(Clone, Debug, Default)]
pub struct Band {
    pub nodes: Vec<Node>,
}

impl Band {
    /// Sum of consecutive node distances.
    pub fn length(&self) -> f64 {
        self.nodes
            .windows(2)
            .map(|w| (w[1].pose.translation.vector - w[0].pose.translation.vector).norm())
            .sum()
    }
}

/// Refresh every node against the field.
pub fn update_distances(band: &mut Band, field: &DistanceField, max_distance: f64) {
    for node in &mut band.nodes {
        node.refresh(field, max_distance);
    }
}
