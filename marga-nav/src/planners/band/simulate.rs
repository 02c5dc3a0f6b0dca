//! Band relaxation.

use nalgebra::{Isometry2, Vector2, Vector3};

use crate::planners::costmap::DistanceField;
use crate::utils::normalize_angle;

use super::{update_distances, Band, Node};

/// Hard cap on band size during bubble insertion.
const MAX_BAND_NODES: usize = 100;

/// Parameters of one simulation run.
#[derive(Clone, Copy, Debug)]
pub struct SimulateParams {
    pub num_iterations: u32,
    pub min_overlap: f64,
    pub min_distance: f64,
    pub internal_force_gain: f64,
    pub external_force_gain: f64,
    /// 0.0 disables the rotation term.
    pub rotation_factor: f64,
    pub reverse_direction: bool,
    pub velocity_decay: f64,
    pub alpha_start: f64,
    pub alpha_decay: f64,
    pub max_distance: f64,
}

/// Relax the band between its fixed endpoints.
///
/// Each step applies tangential contraction toward the neighbour midpoint,
/// repulsion along the distance-field gradient, and optional rotational
/// alignment with the local tangent; node velocities are damped by
/// `velocity_decay` and the step size shrinks by `alpha_decay`.
pub fn simulate(band: &mut Band, field: &DistanceField, params: &SimulateParams) {
    update_distances(band, field, params.max_distance);
    if band.nodes.len() < 2 {
        return;
    }

    let mut velocities = vec![Vector3::<f64>::zeros(); band.nodes.len()];
    let mut alpha = params.alpha_start;

    for _ in 0..params.num_iterations {
        maintain_overlap(band, field, params);
        if velocities.len() != band.nodes.len() {
            velocities = vec![Vector3::zeros(); band.nodes.len()];
        }

        let n = band.nodes.len();
        for i in 1..n.saturating_sub(1) {
            let prev = band.nodes[i - 1].pose.translation.vector;
            let next = band.nodes[i + 1].pose.translation.vector;
            let node = &band.nodes[i];
            let position = node.pose.translation.vector;

            // Tangential contraction toward the neighbour midpoint.
            let midpoint = (prev + next) * 0.5;
            let mut force = (midpoint - position) * params.internal_force_gain;

            // Repulsion along the distance gradient while near obstacles.
            let clearance = node.min_distance();
            if clearance < params.max_distance {
                let closest = &node.control_points[node.closest_point];
                force += closest.gradient
                    * (params.external_force_gain * (params.max_distance - clearance));
            }

            // Rotation alignment with the local tangent.
            let mut torque = 0.0;
            if params.rotation_factor != 0.0 {
                let tangent = next - prev;
                if tangent.norm() > 1e-6 {
                    let mut heading = tangent.y.atan2(tangent.x);
                    if params.reverse_direction {
                        heading += std::f64::consts::PI;
                    }
                    let error = normalize_angle(heading - node.pose.rotation.angle());
                    torque = params.rotation_factor * error;
                }
            }

            velocities[i] =
                velocities[i] * params.velocity_decay + Vector3::new(force.x, force.y, torque) * alpha;
        }

        for i in 1..n.saturating_sub(1) {
            let v = velocities[i];
            let pose = band.nodes[i].pose;
            band.nodes[i].pose = Isometry2::new(
                pose.translation.vector + Vector2::new(v.x, v.y),
                normalize_angle(pose.rotation.angle() + v.z),
            );
            band.nodes[i].refresh(field, params.max_distance);
        }

        alpha *= params.alpha_decay;
    }

    update_distances(band, field, params.max_distance);
}

/// Bubble radius used by the overlap constraint.
#[inline]
fn bubble_radius(node: &Node, params: &SimulateParams) -> f64 {
    node.min_distance().clamp(params.min_distance, params.max_distance)
}

/// Keep adjacent bubbles overlapping: insert a node where a gap opens,
/// remove a node whose neighbours already cover it.
fn maintain_overlap(band: &mut Band, field: &DistanceField, params: &SimulateParams) {
    // Insertion pass.
    let mut i = 0;
    while i + 1 < band.nodes.len() && band.nodes.len() < MAX_BAND_NODES {
        let gap = (band.nodes[i + 1].pose.translation.vector
            - band.nodes[i].pose.translation.vector)
            .norm();
        let allowed = (bubble_radius(&band.nodes[i], params)
            + bubble_radius(&band.nodes[i + 1], params))
            * (1.0 - params.min_overlap);
        if gap > allowed {
            let a = band.nodes[i].pose;
            let b = band.nodes[i + 1].pose;
            let midpoint = Isometry2::new(
                (a.translation.vector + b.translation.vector) * 0.5,
                normalize_angle(
                    a.rotation.angle()
                        + normalize_angle(b.rotation.angle() - a.rotation.angle()) * 0.5,
                ),
            );
            let mut node = Node::new(midpoint);
            node.refresh(field, params.max_distance);
            band.nodes.insert(i + 1, node);
        }
        i += 1;
    }

    // Removal pass: endpoints stay fixed.
    let mut i = 1;
    while i + 1 < band.nodes.len() {
        let span = (band.nodes[i + 1].pose.translation.vector
            - band.nodes[i - 1].pose.translation.vector)
            .norm();
        let allowed = (bubble_radius(&band.nodes[i - 1], params)
            + bubble_radius(&band.nodes[i + 1], params))
            * (1.0 - params.min_overlap);
        if span < allowed {
            band.nodes.remove(i);
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bhumi_map::cells::ClampParams;
    use bhumi_map::{GridCoord, HdMap, MapData, MapDimensions};
    use nalgebra::Point2;
    use std::sync::Arc;

    fn create_test_params() -> SimulateParams {
        SimulateParams {
            num_iterations: 50,
            min_overlap: 0.2,
            min_distance: 0.02,
            internal_force_gain: 0.05,
            external_force_gain: 0.1,
            rotation_factor: 0.0,
            reverse_direction: false,
            velocity_decay: 0.6,
            alpha_start: 1.0,
            alpha_decay: 0.98,
            max_distance: 0.5,
        }
    }

    fn create_test_field(occupied_block: Option<(GridCoord, GridCoord)>) -> DistanceField {
        let dims = MapDimensions::new(Point2::new(-2.5, -2.5), 0.05, GridCoord::new(100, 100));
        let map = Arc::new(MapData::new(HdMap::default(), dims, ClampParams::default()));
        if let Some((min, max)) = occupied_block {
            let mut grid = map.lock();
            let delta = grid.max_log();
            for y in min.y..max.y {
                for x in min.x..max.x {
                    grid.update(GridCoord::new(x, y), delta);
                }
            }
        }
        DistanceField::new(&map, dims.bounds(), 0.1)
    }

    fn straight_band(from: f64, to: f64, nodes: usize) -> Band {
        let mut band = Band::default();
        for i in 0..nodes {
            let t = i as f64 / (nodes - 1) as f64;
            band.nodes.push(Node::new(Isometry2::new(
                Vector2::new(from + (to - from) * t, 0.0),
                0.0,
            )));
        }
        band
    }

    #[test]
    fn test_contraction_straightens_a_kink() {
        let field = create_test_field(None);
        let mut band = straight_band(-1.0, 1.0, 5);
        // Kink the middle node sideways.
        band.nodes[2].pose = Isometry2::new(Vector2::new(0.0, 0.6), 0.0);
        let kink_before = band.nodes[2].pose.translation.y;

        simulate(&mut band, &field, &create_test_params());

        // The middle of the band moved back toward the chord.
        let worst = band
            .nodes
            .iter()
            .map(|n| n.pose.translation.y.abs())
            .fold(0.0, f64::max);
        assert!(worst < kink_before);
    }

    #[test]
    fn test_repulsion_pushes_off_obstacle() {
        // Obstacle just below the band's chord.
        let field = create_test_field(Some((GridCoord::new(48, 44), GridCoord::new(52, 50))));
        let mut band = straight_band(-1.0, 1.0, 9);

        let params = create_test_params();
        simulate(&mut band, &field, &params);

        // Nodes near the obstacle gained clearance upward.
        let max_y = band
            .nodes
            .iter()
            .map(|n| n.pose.translation.y)
            .fold(f64::MIN, f64::max);
        assert!(max_y > 0.0);
    }

    #[test]
    fn test_endpoints_fixed() {
        let field = create_test_field(None);
        let mut band = straight_band(-1.0, 1.0, 5);
        simulate(&mut band, &field, &create_test_params());
        assert!((band.nodes.first().unwrap().pose.translation.x + 1.0).abs() < 1e-9);
        assert!((band.nodes.last().unwrap().pose.translation.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlap_insertion_fills_gaps() {
        let field = create_test_field(None);
        // Two distant nodes force bubble insertion.
        let mut band = straight_band(-1.0, 1.0, 2);
        simulate(&mut band, &field, &create_test_params());
        assert!(band.nodes.len() > 2);
        assert!(band.nodes.len() <= MAX_BAND_NODES);
    }
}
