//! Depth-image data-source layer.

use std::sync::Arc;

use image::ImageFormat;
use nalgebra::{Point2, Point3};

use crate::cells::LogOddsGrid;
use crate::core::CellBounds;
use crate::footprint::footprint_cells;
use crate::map_data::MapData;
use crate::msgs::CompressedDepthImage;
use crate::params::{config_with_default_warn, ConfigError};
use crate::raycast::{clip_ray_end, raytrace};
use crate::transform::TransformBuffer;

use super::{Layer, LayerError, ObstacleDefaults, ObstacleParams, FOOTPRINT_SCALE};

const DEFAULTS: ObstacleDefaults = ObstacleDefaults {
    hit_probability: 0.7,
    miss_probability: 0.3,
    min_obstacle_height: 0.05,
    max_obstacle_height: 1.8,
    obstacle_range: 2.5,
    raytrace_range: 3.0,
    sub_sample: 1,
};

/// Decodes compressed depth frames and marks the reprojected points.
///
/// Each pixel is reprojected through the pinhole intrinsics into the
/// camera's optical frame (z forward) and then treated exactly like a laser
/// endpoint.
pub struct DepthLayer {
    name: String,
    params: ObstacleParams,
    /// Column/row stride when reprojecting pixels.
    pixel_skip: u32,
    tf: Arc<TransformBuffer>,
    global_frame: String,
    robot_frame: String,
    footprint: Vec<Point2<f64>>,
    map_data: Option<Arc<MapData>>,
    latest: Option<CompressedDepthImage>,
    sub_sample_count: u32,
}

impl DepthLayer {
    pub fn new(
        name: impl Into<String>,
        tf: Arc<TransformBuffer>,
        global_frame: impl Into<String>,
        footprint: Vec<Point2<f64>>,
    ) -> Self {
        Self {
            name: name.into(),
            params: ObstacleParams::from_defaults(&DEFAULTS),
            pixel_skip: 4,
            tf,
            global_frame: global_frame.into(),
            robot_frame: "base_link".to_string(),
            footprint,
            map_data: None,
            latest: None,
            // Primed so the first message is accepted.
            sub_sample_count: DEFAULTS.sub_sample,
        }
    }

    /// Handle one frame from the transport.
    pub fn handle(&mut self, frame: CompressedDepthImage) -> Result<(), LayerError> {
        if !self.params.accept(&mut self.sub_sample_count) {
            return Ok(());
        }
        let map = self.map_data.clone().ok_or(LayerError::NoMapData)?;
        self.latest = Some(frame);
        let bounds = map.dimensions().bounds();
        let mut grid = map.lock();
        self.mark(&mut grid, &bounds)
    }

    fn mark(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError> {
        let Some(frame) = self.latest.clone() else {
            return Ok(());
        };
        let dims = *grid.dimensions();

        let sensor_tf = self
            .tf
            .lookup(&self.global_frame, &frame.frame_id, frame.stamp)?;
        let sensor_cell = dims.world_to_grid(Point2::new(
            sensor_tf.translation.x,
            sensor_tf.translation.y,
        ));
        if !dims.contains(sensor_cell) {
            return Err(LayerError::SensorOffGrid);
        }

        let depth_image = image::load_from_memory_with_format(&frame.png_data, ImageFormat::Png)
            .map_err(|e| LayerError::BadPayload(e.to_string()))?
            .to_luma16();
        if frame.depth_scale <= 0.0 {
            return Err(LayerError::BadPayload("non-positive depth scale".to_string()));
        }

        let robot_tf = self
            .tf
            .lookup(&self.global_frame, &self.robot_frame, frame.stamp)?;
        let robot_pose = crate::transform::iso3_to_iso2(&robot_tf);

        let cell_raytrace_range = self.params.raytrace_cells(dims.resolution());
        let k = frame.intrinsics;
        let skip = self.pixel_skip.max(1);

        for v in (0..depth_image.height()).step_by(skip as usize) {
            for u in (0..depth_image.width()).step_by(skip as usize) {
                let raw = depth_image.get_pixel(u, v).0[0];
                if raw == 0 {
                    continue;
                }
                let depth = raw as f64 / frame.depth_scale;

                // Optical frame: x right, y down, z forward.
                let point = Point3::new(
                    (u as f64 - k.cx) / k.fx * depth,
                    (v as f64 - k.cy) / k.fy * depth,
                    depth,
                );
                let range = point.coords.norm();
                let endpoint = sensor_tf * point;
                if endpoint.z < self.params.min_obstacle_height
                    || endpoint.z > self.params.max_obstacle_height
                {
                    continue;
                }

                let end_cell = dims.world_to_grid(Point2::new(endpoint.x, endpoint.y));
                let ray_end = clip_ray_end(sensor_cell, end_cell, dims.size());
                raytrace(
                    grid,
                    sensor_cell,
                    ray_end,
                    self.params.miss_log,
                    cell_raytrace_range,
                    bounds,
                );
                if range < self.params.obstacle_range {
                    grid.update_in(ray_end, -self.params.miss_log, bounds);
                    grid.update_in(ray_end, self.params.hit_log, bounds);
                }
            }
        }

        for cell in footprint_cells(&dims, &robot_pose, &self.footprint, FOOTPRINT_SCALE) {
            if bounds.contains(cell) {
                grid.set_min(cell);
            }
        }
        Ok(())
    }
}

impl Layer for DepthLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_initialize(&mut self, params: &toml::Value) -> Result<(), ConfigError> {
        self.params = ObstacleParams::from_toml(params, &DEFAULTS)?;
        self.pixel_skip = config_with_default_warn(params, "pixel_skip", self.pixel_skip)?;
        if self.pixel_skip == 0 {
            return Err(ConfigError::Invalid("pixel_skip must be positive".to_string()));
        }
        self.sub_sample_count = self.params.sub_sample;
        Ok(())
    }

    fn on_map_changed(&mut self, map: Arc<MapData>) {
        self.map_data = Some(map);
        self.latest = None;
    }

    fn apply(&mut self, grid: &mut LogOddsGrid, bounds: &CellBounds) -> Result<(), LayerError> {
        if self.map_data.is_none() {
            return Err(LayerError::NoMapData);
        }
        self.mark(grid, bounds)
    }
}
