//! MargaNav - navigation supervisor for ground robots.
//!
//! Runs the three-tier planning pipeline over a BhumiMap layered grid:
//!
//! - **Path thread** (low frequency): global sampling-based planning
//!   against a fresh grid snapshot, with cost-based path swapping
//! - **Trajectory thread** (medium frequency): elastic-band relaxation of
//!   the path inside a moving window
//! - **Controller thread** (high frequency): trajectory tracking producing
//!   velocity commands
//!
//! Sensor layers, odometry and the goal protocol are wired over channels
//! standing in for the message transport.

mod config;
mod control;
mod error;
mod interface;
mod planners;
mod supervisor;
mod utils;

use std::path::Path;
use std::sync::Arc;

use bhumi_map::cells::ClampParams;
use bhumi_map::layers::{spawn_handler, DepthLayer, LaserLayer, Layer, RangeLayer, SharedLayer};
use bhumi_map::msgs::{CompressedDepthImage, LaserScan, RangeReading};
use bhumi_map::{HdMap, LayeredMap, OccupancyImage, TransformBuffer};
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use config::MargaConfig;
use control::TrackingController;
use error::{MargaError, Result};
use interface::{Controller, PathPlanner, TrajectoryPlanner};
use planners::{BandPlanner, RrtPathPlanner};
use supervisor::{goal_channel, Supervisor};

/// Queue depth of each sensor topic.
const SENSOR_QUEUE: usize = 50;

/// Sender ends of every external input; dropping them stops the handler
/// threads.
pub struct SensorInputs {
    pub laser: Vec<Sender<LaserScan>>,
    pub depth: Vec<Sender<CompressedDepthImage>>,
    pub range: Vec<Sender<RangeReading>>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("marga_nav=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = if args.len() > 1 {
        let path = Path::new(&args[1]);
        info!("Loading configuration from {:?}", path);
        MargaConfig::load(path)?
    } else if Path::new("marga.toml").exists() {
        info!("Loading configuration from marga.toml");
        MargaConfig::load(Path::new("marga.toml"))?
    } else {
        info!("Using default configuration");
        MargaConfig::default()
    };

    info!("MargaNav v{}", env!("CARGO_PKG_VERSION"));

    let tf = Arc::new(TransformBuffer::new());
    let footprint = config.footprint_points();

    // Build the sensor layers and their handler threads.
    let mut layers: Vec<SharedLayer> = Vec::new();
    let mut inputs = SensorInputs {
        laser: Vec::new(),
        depth: Vec::new(),
        range: Vec::new(),
    };
    for entry in &config.layers {
        let thread_name = format!("layer_{}", entry.name);
        let layer_name = entry.name.clone();
        match entry.kind.as_str() {
            "laser" => {
                let layer = Arc::new(Mutex::new(LaserLayer::new(
                    entry.name.clone(),
                    tf.clone(),
                    config.global_frame.clone(),
                    footprint.clone(),
                )));
                layer.lock().on_initialize(&entry.params)?;
                let (tx, rx) = bounded(SENSOR_QUEUE);
                let handler = layer.clone();
                let _ = spawn_handler(&thread_name, rx, move |msg: LaserScan| {
                    if let Err(e) = handler.lock().handle(msg) {
                        debug!("[{}] dropped scan ({}): {}", layer_name, e.kind(), e);
                    }
                });
                inputs.laser.push(tx);
                layers.push(layer);
            }
            "depth" => {
                let layer = Arc::new(Mutex::new(DepthLayer::new(
                    entry.name.clone(),
                    tf.clone(),
                    config.global_frame.clone(),
                    footprint.clone(),
                )));
                layer.lock().on_initialize(&entry.params)?;
                let (tx, rx) = bounded(SENSOR_QUEUE);
                let handler = layer.clone();
                let _ = spawn_handler(&thread_name, rx, move |msg: CompressedDepthImage| {
                    if let Err(e) = handler.lock().handle(msg) {
                        debug!("[{}] dropped frame ({}): {}", layer_name, e.kind(), e);
                    }
                });
                inputs.depth.push(tx);
                layers.push(layer);
            }
            "range" => {
                let layer = Arc::new(Mutex::new(RangeLayer::new(
                    entry.name.clone(),
                    tf.clone(),
                    config.global_frame.clone(),
                    footprint.clone(),
                )));
                layer.lock().on_initialize(&entry.params)?;
                let (tx, rx) = bounded(SENSOR_QUEUE);
                let handler = layer.clone();
                let _ = spawn_handler(&thread_name, rx, move |msg: RangeReading| {
                    if let Err(e) = handler.lock().handle(msg) {
                        debug!("[{}] dropped reading ({}): {}", layer_name, e.kind(), e);
                    }
                });
                inputs.range.push(tx);
                layers.push(layer);
            }
            other => {
                return Err(MargaError::Config(format!("unknown layer kind: {}", other)));
            }
        }
    }
    info!("{} sensor layers configured", layers.len());

    let layered_map = Arc::new(LayeredMap::new(layers, ClampParams::default()));

    // Plugins; configuration errors here are fatal.
    let path_planner: Arc<Mutex<dyn PathPlanner>> = {
        let mut planner = RrtPathPlanner::new();
        planner.on_initialize(&config.path_planner)?;
        Arc::new(Mutex::new(planner))
    };
    let trajectory_planner: Arc<Mutex<dyn TrajectoryPlanner>> = {
        let mut planner = BandPlanner::new();
        planner.on_initialize(&config.trajectory_planner)?;
        Arc::new(Mutex::new(planner))
    };
    let controller: Arc<Mutex<dyn Controller>> = {
        let mut controller = TrackingController::new();
        controller.on_initialize(&config.controller)?;
        Arc::new(Mutex::new(controller))
    };

    // Channels standing in for the transport layer.
    let (navigation_client, goal_rx) = goal_channel();
    let (cmd_vel_tx, cmd_vel_rx) = crossbeam_channel::unbounded();
    let (odom_tx, odom_rx) = bounded(SENSOR_QUEUE);
    let (grid_tx, grid_rx) = crossbeam_channel::unbounded();

    let supervisor = Supervisor::new(
        config.clone(),
        layered_map,
        tf.clone(),
        path_planner,
        trajectory_planner,
        controller,
        goal_rx,
        cmd_vel_tx,
    );

    // Bootstrap map until the map manager activates a real one: 20m x 20m
    // of unknown space around the origin.
    let bootstrap = HdMap {
        name: "bootstrap".to_string(),
        description: "empty startup map".to_string(),
        resolution: 0.05,
        width: 400,
        height: 400,
        origin_x: -10.0,
        origin_y: -10.0,
    };
    supervisor.activate_map(bootstrap, OccupancyImage::unknown(400, 400))?;

    let _odometry_thread = supervisor.spawn_odometry(odom_rx);
    let _publisher_thread = supervisor.spawn_map_publisher(grid_tx);

    // Drain diagnostic outputs.
    std::thread::Builder::new()
        .name("cmd_vel_sink".into())
        .spawn(move || {
            while let Ok(twist) = cmd_vel_rx.recv() {
                debug!(
                    "cmd_vel: ({:.3}, {:.3}, {:.3})",
                    twist.linear_x, twist.linear_y, twist.angular_z
                );
            }
        })
        .expect("failed to spawn cmd_vel sink");
    std::thread::Builder::new()
        .name("grid_sink".into())
        .spawn(move || while grid_rx.recv().is_ok() {})
        .expect("failed to spawn grid sink");

    // Keep the external input ends alive for the length of the process.
    let _inputs = (inputs, navigation_client, odom_tx);

    supervisor.run();
    Ok(())
}
