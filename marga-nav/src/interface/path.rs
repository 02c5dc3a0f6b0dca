//! Global path representation.

use nalgebra::Isometry2;
use uuid::Uuid;

/// Ordered sequence of planar rigid transforms from start to goal.
///
/// Every path carries a stable id assigned at creation; the supervisor's
/// pipeline uses id changes to detect path swaps.
#[derive(Clone, Debug)]
pub struct Path {
    pub id: Uuid,
    pub nodes: Vec<Isometry2<f64>>,
}

impl Default for Path {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes: Vec::new(),
        }
    }
}

impl Path {
    /// Create a path with a fresh id.
    pub fn new(nodes: Vec<Isometry2<f64>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            nodes,
        }
    }

    /// Sum of consecutive Euclidean distances.
    pub fn length(&self) -> f64 {
        self.nodes
            .windows(2)
            .map(|w| (w[1].translation.vector - w[0].translation.vector).norm())
            .sum()
    }

    /// Assign a fresh id, marking the path as new to the pipeline.
    pub fn regenerate_id(&mut self) {
        self.id = Uuid::new_v4();
    }
}
