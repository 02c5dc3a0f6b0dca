//! Time-indexed transform buffer.
//!
//! Models the external transform system as a tree of named frames with
//! time-stamped parent-from-child rigid transforms. Lookups compose along
//! the tree and interpolate between bracketing samples.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nalgebra::{Isometry2, Isometry3, Translation3, Vector2, Vector3};
use parking_lot::Mutex;
use thiserror::Error;

/// Message and transform timestamps, as a duration since the UNIX epoch.
pub type Stamp = Duration;

/// Current wall-clock stamp.
pub fn stamp_now() -> Stamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// How far past the newest sample a lookup may reach before failing.
const EXTRAPOLATION_TOLERANCE: Duration = Duration::from_millis(100);

/// How much history each edge retains.
const CACHE_TIME: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("transform {target}<-{frame} requires extrapolation")]
    Extrapolation { target: String, frame: String },

    #[error("unknown frame: {0}")]
    UnknownFrame(String),

    #[error("timed out waiting for transform {target}<-{frame}")]
    Timeout { target: String, frame: String },
}

impl TransformError {
    /// Stable error-kind string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformError::Extrapolation { .. } => "extrapolation",
            TransformError::UnknownFrame(_) => "unknown_frame",
            TransformError::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Debug)]
struct Edge {
    parent: String,
    samples: BTreeMap<Stamp, Isometry3<f64>>,
}

/// Thread-safe frame-tree buffer of 3-D rigid transforms.
#[derive(Debug, Default)]
pub struct TransformBuffer {
    edges: Mutex<HashMap<String, Edge>>,
}

impl TransformBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a parent-from-child sample at `stamp`.
    ///
    /// Re-parenting a frame discards its previous history. History older
    /// than the cache window is pruned.
    pub fn set_transform(
        &self,
        parent: &str,
        child: &str,
        stamp: Stamp,
        transform: Isometry3<f64>,
    ) {
        let mut edges = self.edges.lock();
        let edge = edges.entry(child.to_string()).or_insert_with(|| Edge {
            parent: parent.to_string(),
            samples: BTreeMap::new(),
        });
        if edge.parent != parent {
            edge.parent = parent.to_string();
            edge.samples.clear();
        }
        edge.samples.insert(stamp, transform);

        let newest = *edge.samples.keys().next_back().unwrap();
        let horizon = newest.saturating_sub(CACHE_TIME);
        while edge.samples.len() > 1 {
            let oldest = *edge.samples.keys().next().unwrap();
            if oldest >= horizon {
                break;
            }
            edge.samples.remove(&oldest);
        }
    }

    /// Look up target-from-source at `stamp`.
    pub fn lookup(
        &self,
        target: &str,
        source: &str,
        stamp: Stamp,
    ) -> Result<Isometry3<f64>, TransformError> {
        if target == source {
            return Ok(Isometry3::identity());
        }
        let edges = self.edges.lock();

        let root_from_target = Self::root_chain(&edges, target, source, stamp)?;
        let root_from_source = Self::root_chain(&edges, source, target, stamp)?;

        if root_from_target.0 != root_from_source.0 {
            return Err(TransformError::UnknownFrame(source.to_string()));
        }
        Ok(root_from_target.1.inverse() * root_from_source.1)
    }

    /// Look up target-from-source, polling until `timeout` expires.
    pub fn lookup_with_timeout(
        &self,
        target: &str,
        source: &str,
        stamp: Stamp,
        timeout: Duration,
    ) -> Result<Isometry3<f64>, TransformError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.lookup(target, source, stamp) {
                Ok(t) => return Ok(t),
                Err(_) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(_) => {
                    return Err(TransformError::Timeout {
                        target: target.to_string(),
                        frame: source.to_string(),
                    })
                }
            }
        }
    }

    /// Walk `frame` up to its root, composing root-from-frame.
    fn root_chain(
        edges: &HashMap<String, Edge>,
        frame: &str,
        other: &str,
        stamp: Stamp,
    ) -> Result<(String, Isometry3<f64>), TransformError> {
        let known = |f: &str| edges.contains_key(f) || edges.values().any(|e| e.parent == f);
        if !known(frame) {
            return Err(TransformError::UnknownFrame(frame.to_string()));
        }

        let mut acc = Isometry3::identity();
        let mut current = frame.to_string();
        while let Some(edge) = edges.get(&current) {
            let sample = Self::sample(edge, stamp).ok_or_else(|| TransformError::Extrapolation {
                target: frame.to_string(),
                frame: other.to_string(),
            })?;
            acc = sample * acc;
            current = edge.parent.clone();
        }
        Ok((current, acc))
    }

    /// Sample an edge at `stamp`, interpolating between brackets.
    fn sample(edge: &Edge, stamp: Stamp) -> Option<Isometry3<f64>> {
        let first = edge.samples.keys().next().copied()?;
        let last = edge.samples.keys().next_back().copied()?;

        // A single sample is treated as a static transform.
        if edge.samples.len() == 1 {
            return edge.samples.values().next().copied();
        }
        if stamp <= first {
            return if first.saturating_sub(stamp) <= EXTRAPOLATION_TOLERANCE {
                edge.samples.get(&first).copied()
            } else {
                None
            };
        }
        if stamp >= last {
            return if stamp.saturating_sub(last) <= EXTRAPOLATION_TOLERANCE {
                edge.samples.get(&last).copied()
            } else {
                None
            };
        }

        let (&t0, a) = edge.samples.range(..=stamp).next_back()?;
        let (&t1, b) = edge.samples.range(stamp..).next()?;
        if t0 == t1 {
            return Some(*a);
        }
        let alpha = (stamp - t0).as_secs_f64() / (t1 - t0).as_secs_f64();
        let translation = a.translation.vector.lerp(&b.translation.vector, alpha);
        let rotation = a.rotation.slerp(&b.rotation, alpha);
        Some(Isometry3::from_parts(Translation3::from(translation), rotation))
    }
}

/// Project a 3-D transform onto the plane (translation x/y plus yaw).
pub fn iso3_to_iso2(transform: &Isometry3<f64>) -> Isometry2<f64> {
    let (_, _, yaw) = transform.rotation.euler_angles();
    Isometry2::new(
        Vector2::new(transform.translation.x, transform.translation.y),
        yaw,
    )
}

/// Lift a planar transform into 3-D (zero z, yaw about the z axis).
pub fn iso2_to_iso3(transform: &Isometry2<f64>) -> Isometry3<f64> {
    Isometry3::new(
        Vector3::new(transform.translation.x, transform.translation.y, 0.0),
        Vector3::z() * transform.rotation.angle(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iso3(x: f64, y: f64, yaw: f64) -> Isometry3<f64> {
        Isometry3::new(Vector3::new(x, y, 0.0), Vector3::z() * yaw)
    }

    #[test]
    fn test_identity_lookup() {
        let buffer = TransformBuffer::new();
        let t = buffer.lookup("map", "map", Duration::from_secs(1)).unwrap();
        assert!((t.translation.vector.norm()) < 1e-12);
    }

    #[test]
    fn test_static_transform() {
        let buffer = TransformBuffer::new();
        buffer.set_transform("base_link", "laser", Duration::from_secs(0), iso3(0.1, 0.0, 0.0));
        // Resolves at any stamp.
        let t = buffer
            .lookup("base_link", "laser", Duration::from_secs(100))
            .unwrap();
        assert!((t.translation.x - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_interpolation() {
        let buffer = TransformBuffer::new();
        buffer.set_transform("odom", "base_link", Duration::from_secs(1), iso3(0.0, 0.0, 0.0));
        buffer.set_transform("odom", "base_link", Duration::from_secs(3), iso3(2.0, 0.0, 0.0));
        let t = buffer
            .lookup("odom", "base_link", Duration::from_secs(2))
            .unwrap();
        assert!((t.translation.x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_extrapolation_error() {
        let buffer = TransformBuffer::new();
        buffer.set_transform("odom", "base_link", Duration::from_secs(1), iso3(0.0, 0.0, 0.0));
        buffer.set_transform("odom", "base_link", Duration::from_secs(2), iso3(1.0, 0.0, 0.0));
        let err = buffer
            .lookup("odom", "base_link", Duration::from_secs(10))
            .unwrap_err();
        assert_eq!(err.kind(), "extrapolation");
    }

    #[test]
    fn test_unknown_frame() {
        let buffer = TransformBuffer::new();
        buffer.set_transform("map", "odom", Duration::from_secs(1), iso3(0.0, 0.0, 0.0));
        let err = buffer
            .lookup("map", "lidar", Duration::from_secs(1))
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_frame");
    }

    #[test]
    fn test_chained_lookup() {
        let buffer = TransformBuffer::new();
        let stamp = Duration::from_secs(5);
        buffer.set_transform("map", "odom", stamp, iso3(1.0, 0.0, 0.0));
        buffer.set_transform("odom", "base_link", stamp, iso3(2.0, 0.0, 0.0));
        buffer.set_transform("base_link", "laser", Duration::from_secs(0), iso3(0.5, 0.0, 0.0));

        let t = buffer.lookup("map", "laser", stamp).unwrap();
        assert!((t.translation.x - 3.5).abs() < 1e-9);

        // Reverse direction.
        let t = buffer.lookup("laser", "map", stamp).unwrap();
        assert!((t.translation.x + 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_with_timeout_times_out() {
        let buffer = TransformBuffer::new();
        let err = buffer
            .lookup_with_timeout("map", "odom", Duration::from_secs(1), Duration::from_millis(30))
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_iso_projection_round_trip() {
        let planar = Isometry2::new(Vector2::new(1.0, -2.0), 0.7);
        let lifted = iso2_to_iso3(&planar);
        let back = iso3_to_iso2(&lifted);
        assert!((back.translation.x - 1.0).abs() < 1e-9);
        assert!((back.translation.y + 2.0).abs() < 1e-9);
        assert!((back.rotation.angle() - 0.7).abs() < 1e-9);
    }
}
