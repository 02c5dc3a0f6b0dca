//! Configuration loading for MargaNav.

use std::path::Path;
use std::time::Duration;

use nalgebra::Point2;
use serde::Deserialize;

use crate::error::{MargaError, Result};

/// Main configuration structure.
///
/// The plugin blocks are carried as raw TOML tables and forwarded verbatim
/// to the selected plugin's `on_initialize`.
#[derive(Clone, Debug, Deserialize)]
pub struct MargaConfig {
    /// Frame in which the grid is maintained.
    #[serde(default = "default_global_frame")]
    pub global_frame: String,

    /// Rate at which the full grid is republished (Hz).
    #[serde(default = "default_map_publish_frequency")]
    pub map_publish_frequency: f64,

    /// Radius cleared on goal entry; also the trajectory local region (m).
    #[serde(default = "default_clear_radius")]
    pub clear_radius: f64,

    /// Tick rate of the path thread (Hz).
    #[serde(default = "default_path_planner_frequency")]
    pub path_planner_frequency: f64,

    /// Tick rate of the trajectory thread (Hz).
    #[serde(default = "default_trajectory_planner_frequency")]
    pub trajectory_planner_frequency: f64,

    /// Tick rate of the controller thread (Hz).
    #[serde(default = "default_controller_frequency")]
    pub controller_frequency: f64,

    /// Cost-ratio threshold for adopting a new path.
    #[serde(default = "default_path_swap_fraction")]
    pub path_swap_fraction: f64,

    /// Goal aborts after this many seconds unlocalised.
    #[serde(default = "default_localisation_timeout")]
    pub localisation_timeout: f64,

    /// A path without a successful re-cost for this long is replaced (s).
    #[serde(default = "default_path_persistence_time")]
    pub path_persistence_time: f64,

    /// Robot footprint polygon in the body frame.
    #[serde(default = "default_robot_footprint")]
    pub robot_footprint: Vec<[f64; 2]>,

    /// Forwarded to the path planner plugin.
    #[serde(default = "default_plugin_params")]
    pub path_planner: toml::Value,

    /// Forwarded to the trajectory planner plugin.
    #[serde(default = "default_plugin_params")]
    pub trajectory_planner: toml::Value,

    /// Forwarded to the controller plugin.
    #[serde(default = "default_plugin_params")]
    pub controller: toml::Value,

    /// Sensor layers in apply order.
    #[serde(default)]
    pub layers: Vec<LayerEntry>,
}

/// One sensor layer declaration.
#[derive(Clone, Debug, Deserialize)]
pub struct LayerEntry {
    /// Layer kind: "laser", "depth" or "range".
    pub kind: String,
    pub name: String,
    #[serde(default = "default_plugin_params")]
    pub params: toml::Value,
}

fn default_global_frame() -> String {
    "map".to_string()
}
fn default_map_publish_frequency() -> f64 {
    1.0
}
fn default_clear_radius() -> f64 {
    1.0
}
fn default_path_planner_frequency() -> f64 {
    0.5
}
fn default_trajectory_planner_frequency() -> f64 {
    8.0
}
fn default_controller_frequency() -> f64 {
    20.0
}
fn default_path_swap_fraction() -> f64 {
    0.8
}
fn default_localisation_timeout() -> f64 {
    5.0
}
fn default_path_persistence_time() -> f64 {
    6.0
}
fn default_robot_footprint() -> Vec<[f64; 2]> {
    vec![
        [0.268, 0.000],
        [0.265, 0.185],
        [-0.265, 0.185],
        [-0.268, 0.000],
        [-0.265, -0.185],
        [0.265, -0.185],
    ]
}
fn default_plugin_params() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl Default for MargaConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config deserialises to defaults")
    }
}

impl MargaConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: MargaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("map_publish_frequency", self.map_publish_frequency),
            ("path_planner_frequency", self.path_planner_frequency),
            (
                "trajectory_planner_frequency",
                self.trajectory_planner_frequency,
            ),
            ("controller_frequency", self.controller_frequency),
        ] {
            if value <= 0.0 {
                return Err(MargaError::Config(format!("{} must be positive", name)));
            }
        }
        if !(0.0..=1.0).contains(&self.path_swap_fraction) {
            return Err(MargaError::Config(
                "path_swap_fraction must lie in [0, 1]".to_string(),
            ));
        }
        if self.robot_footprint.len() < 3 {
            return Err(MargaError::Config(
                "robot_footprint needs at least three vertices".to_string(),
            ));
        }
        Ok(())
    }

    pub fn footprint_points(&self) -> Vec<Point2<f64>> {
        self.robot_footprint
            .iter()
            .map(|p| Point2::new(p[0], p[1]))
            .collect()
    }

    pub fn localisation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.localisation_timeout)
    }

    pub fn path_persistence_time(&self) -> Duration {
        Duration::from_secs_f64(self.path_persistence_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MargaConfig::default();
        assert_eq!(config.global_frame, "map");
        assert_eq!(config.path_swap_fraction, 0.8);
        assert_eq!(config.path_persistence_time, 6.0);
        assert!(config.layers.is_empty());
    }

    #[test]
    fn test_parse_with_plugin_blocks() {
        let config: MargaConfig = toml::from_str(
            r#"
            global_frame = "map"
            controller_frequency = 10.0

            [path_planner]
            robot_radius = 0.3

            [[layers]]
            kind = "laser"
            name = "front_laser"
            params = { hit_probability = 0.75, sub_sample = 2 }
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.controller_frequency, 10.0);
        assert_eq!(config.layers.len(), 1);
        assert_eq!(config.layers[0].kind, "laser");
        let radius = config.path_planner.get("robot_radius").unwrap().as_float();
        assert_eq!(radius, Some(0.3));
    }

    #[test]
    fn test_invalid_frequency_rejected() {
        let config: MargaConfig = toml::from_str("controller_frequency = 0.0").unwrap();
        assert!(config.validate().is_err());
    }
}
