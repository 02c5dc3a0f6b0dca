//! Moving window over the nominal path.

use nalgebra::Isometry2;

use crate::interface::Path;

use super::{Band, Node};

/// Contiguous slice of the nominal path centred on the robot.
///
/// The band nodes inside the window survive between planning ticks so each
/// simulation starts warm; clearing the window forces a fresh start from
/// the nominal path.
#[derive(Debug)]
pub struct MovingWindow {
    pub nominal: Path,
    pub window: Band,
    /// First nominal node covered by the window.
    pub start_i: usize,
    /// Last nominal node covered by the window.
    pub end_i: usize,
}

impl MovingWindow {
    pub fn new(nominal: Path) -> Self {
        Self {
            nominal,
            window: Band::default(),
            start_i: 0,
            end_i: 0,
        }
    }

    /// Advance the window to the robot and grow its end along the path up
    /// to `max_window_length` metres.
    pub fn update(&mut self, robot_pose: &Isometry2<f64>, max_window_length: f64) {
        let n = self.nominal.nodes.len();
        if n == 0 {
            return;
        }

        // Nearest nominal node at or after the current start; the window
        // never moves backwards along the path.
        let robot = robot_pose.translation.vector;
        let nearest = (self.start_i..n)
            .min_by(|&a, &b| {
                let da = (self.nominal.nodes[a].translation.vector - robot).norm();
                let db = (self.nominal.nodes[b].translation.vector - robot).norm();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(self.start_i);
        self.start_i = nearest;

        if self.window.nodes.is_empty() {
            // Fresh window from the nominal path.
            self.end_i = nearest;
            let mut nodes = vec![Node::new(self.nominal.nodes[nearest])];
            let mut length = 0.0;
            while self.end_i + 1 < n && length < max_window_length {
                let previous = self.nominal.nodes[self.end_i].translation.vector;
                let next = self.nominal.nodes[self.end_i + 1];
                length += (next.translation.vector - previous).norm();
                nodes.push(Node::new(next));
                self.end_i += 1;
            }
            self.window.nodes = nodes;
            return;
        }

        // Drop band nodes the robot has passed.
        while self.window.nodes.len() > 1 {
            let first = self.window.nodes[0].pose.translation.vector;
            let second = self.window.nodes[1].pose.translation.vector;
            let segment = second - first;
            let segment_len2 = segment.norm_squared();
            if segment_len2 < 1e-12 {
                self.window.nodes.remove(0);
                continue;
            }
            if (robot - first).dot(&segment) / segment_len2 > 1.0 {
                self.window.nodes.remove(0);
            } else {
                break;
            }
        }

        // Grow the end of the warm window along the path.
        let mut length = self.window.length();
        while self.end_i + 1 < n && length < max_window_length {
            let next = self.nominal.nodes[self.end_i + 1];
            let last = self
                .window
                .nodes
                .last()
                .map(|node| node.pose.translation.vector)
                .unwrap_or(robot);
            length += (next.translation.vector - last).norm();
            self.window.nodes.push(Node::new(next));
            self.end_i += 1;
        }
    }

    /// Force the next tick to rebuild from the nominal path.
    pub fn reset(&mut self) {
        self.window.nodes.clear();
    }
}
