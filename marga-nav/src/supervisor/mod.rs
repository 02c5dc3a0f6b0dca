//! Navigation supervisor.
//!
//! Hosts the goal-lifecycle state machine and the three planning threads.
//! The execution thread waits for goals; for each accepted goal it
//! transforms the target into the map frame, clears the robot's immediate
//! surroundings, then runs the path planner, trajectory planner and
//! controller on their own periodic threads until the goal succeeds, is
//! preempted or aborts.

mod goal;
mod shared;

pub use goal::{
    goal_channel, AbortReason, ClientGoal, GoalHandle, GoalStatus, NavigationClient, PoseStamped,
    STALE_GOAL_AGE,
};
pub use shared::{ControlTrajectory, GoalRun, RobotState, SharedRobotState, TrackingPath};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bhumi_map::msgs::{OccupancyGridMsg, Odometry, Twist};
use bhumi_map::transform::iso3_to_iso2;
use bhumi_map::{stamp_now, CellBounds, LayeredMap, TransformBuffer};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use nalgebra::{Isometry2, Point2};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::MargaConfig;
use crate::error::{MargaError, Result};
use crate::interface::{
    ControlState, Controller, KinodynamicState, PathOutcome, PathPlanner, TrajectoryOutcome,
    TrajectoryPlanner,
};

/// Poll period of the goal monitor loop.
const MONITOR_TICK: Duration = Duration::from_millis(20);

/// Consecutive stage failures that abort a goal.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// The navigation supervisor.
pub struct Supervisor {
    config: MargaConfig,
    layered_map: Arc<LayeredMap>,
    tf: Arc<TransformBuffer>,
    path_planner: Arc<Mutex<dyn PathPlanner>>,
    trajectory_planner: Arc<Mutex<dyn TrajectoryPlanner>>,
    controller: Arc<Mutex<dyn Controller>>,
    robot_state: Arc<SharedRobotState>,
    current_path: Arc<Mutex<Option<TrackingPath>>>,
    current_trajectory: Arc<Mutex<Option<ControlTrajectory>>>,
    goal_rx: Receiver<GoalHandle>,
    cmd_vel_tx: Sender<Twist>,
    shutdown: Arc<AtomicBool>,
}

/// Everything a stage thread needs for one goal.
#[derive(Clone)]
struct StageContext {
    run: Arc<GoalRun>,
    layered_map: Arc<LayeredMap>,
    robot_state: Arc<SharedRobotState>,
    current_path: Arc<Mutex<Option<TrackingPath>>>,
    current_trajectory: Arc<Mutex<Option<ControlTrajectory>>>,
    cmd_vel_tx: Sender<Twist>,
    goal_pose: Isometry2<f64>,
    config: MargaConfig,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MargaConfig,
        layered_map: Arc<LayeredMap>,
        tf: Arc<TransformBuffer>,
        path_planner: Arc<Mutex<dyn PathPlanner>>,
        trajectory_planner: Arc<Mutex<dyn TrajectoryPlanner>>,
        controller: Arc<Mutex<dyn Controller>>,
        goal_rx: Receiver<GoalHandle>,
        cmd_vel_tx: Sender<Twist>,
    ) -> Self {
        Self {
            config,
            layered_map,
            tf,
            path_planner,
            trajectory_planner,
            controller,
            robot_state: Arc::new(SharedRobotState::new()),
            current_path: Arc::new(Mutex::new(None)),
            current_trajectory: Arc::new(Mutex::new(None)),
            goal_rx,
            cmd_vel_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn robot_state(&self) -> Arc<SharedRobotState> {
        self.robot_state.clone()
    }

    /// Flag checked by the execution loop and the publisher thread.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Activate a new map: re-initialise the layered grid and notify the
    /// planner plugins.
    pub fn activate_map(
        &self,
        hd_map: bhumi_map::HdMap,
        occupancy: bhumi_map::OccupancyImage,
    ) -> Result<()> {
        self.layered_map
            .set_map(hd_map, occupancy)
            .map_err(|e| MargaError::Map(e.to_string()))?;
        let map_data = self
            .layered_map
            .map_data()
            .expect("map data present after set_map");
        self.path_planner.lock().on_map_changed(map_data.clone());
        self.trajectory_planner.lock().on_map_changed(map_data);
        Ok(())
    }

    /// Spawn the process-lifetime odometry thread.
    pub fn spawn_odometry(&self, rx: Receiver<Odometry>) -> JoinHandle<()> {
        let robot_state = self.robot_state.clone();
        let tf = self.tf.clone();
        let global_frame = self.config.global_frame.clone();
        std::thread::Builder::new()
            .name("odometry".into())
            .spawn(move || {
                while let Ok(odom) = rx.recv() {
                    let previous = robot_state.latest();
                    let (localised, map_to_odom) = match tf.lookup(&global_frame, "odom", odom.stamp)
                    {
                        Ok(t) => (true, iso3_to_iso2(&t)),
                        Err(e) => {
                            warn!("map->odom unavailable ({}): {}", e.kind(), e);
                            (
                                false,
                                previous
                                    .map(|p| p.map_to_odom)
                                    .unwrap_or_else(Isometry2::identity),
                            )
                        }
                    };
                    robot_state.update(RobotState {
                        time: Instant::now(),
                        state: KinodynamicState {
                            pose: odom.pose,
                            velocity: odom.velocity,
                        },
                        odom_stamp: odom.stamp,
                        localised,
                        map_to_odom,
                    });
                }
            })
            .expect("failed to spawn odometry thread")
    }

    /// Spawn the diagnostic grid publisher: full snapshots at
    /// `map_publish_frequency`, bounded updates around the robot between.
    pub fn spawn_map_publisher(&self, tx: Sender<OccupancyGridMsg>) -> JoinHandle<()> {
        let layered_map = self.layered_map.clone();
        let robot_state = self.robot_state.clone();
        let shutdown = self.shutdown.clone();
        let full_period = Duration::from_secs_f64(1.0 / self.config.map_publish_frequency);
        let clear_radius = self.config.clear_radius;
        std::thread::Builder::new()
            .name("map_publisher".into())
            .spawn(move || {
                let tick = full_period / 5;
                let mut last_full = Instant::now() - full_period;
                while !shutdown.load(Ordering::Acquire) {
                    if last_full.elapsed() >= full_period {
                        layered_map.update();
                        if let Some(msg) = layered_map.snapshot(None, stamp_now()) {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                        last_full = Instant::now();
                    } else if let Some(rs) = robot_state.latest() {
                        if let Some(region) =
                            robot_region(&layered_map, &rs.map_pose(), clear_radius)
                        {
                            layered_map.update_bounds(region);
                            if let Some(msg) = layered_map.snapshot(Some(region), stamp_now()) {
                                if tx.send(msg).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    std::thread::sleep(tick);
                }
            })
            .expect("failed to spawn map publisher thread")
    }

    /// Execution loop: block on goal arrival for the length of the process.
    pub fn run(&self) {
        info!("navigation supervisor ready");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.goal_rx.recv_timeout(Duration::from_millis(100)) {
                Ok(mut goal) => {
                    // The newest goal wins; everything queued behind it is
                    // preempted unseen.
                    while let Ok(next) = self.goal_rx.try_recv() {
                        goal.set_status(GoalStatus::Preempted);
                        goal = next;
                    }
                    self.execute_goal(goal);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("navigation supervisor stopped");
    }

    fn execute_goal(&self, goal: GoalHandle) {
        info!(
            "goal {} received: ({:.2}, {:.2}) in {}",
            goal.id,
            goal.target.pose.translation.x,
            goal.target.pose.translation.y,
            goal.target.frame_id
        );

        if stamp_now().saturating_sub(goal.target.stamp) > STALE_GOAL_AGE {
            warn!("goal {} aborted (stale_goal): stamp too old", goal.id);
            goal.set_status(GoalStatus::Aborted(AbortReason::StaleGoal));
            return;
        }

        // Transform the goal into the map frame, retrying until the
        // localisation timeout.
        let Some(goal_pose) = self.transform_goal(&goal) else {
            if goal.cancel_requested() {
                goal.set_status(GoalStatus::Preempted);
            } else {
                warn!("goal {} aborted (no_transform)", goal.id);
                goal.set_status(GoalStatus::Aborted(AbortReason::NoTransform));
            }
            return;
        };
        goal.set_status(GoalStatus::Planning);

        let Some(robot) = self
            .robot_state
            .wait_for_localised(self.config.localisation_timeout())
        else {
            warn!("goal {} aborted (transform_unavailable): not localised", goal.id);
            goal.set_status(GoalStatus::Aborted(AbortReason::NotLocalised));
            return;
        };

        // Free the robot's immediate surroundings once on entry.
        let robot_map = robot.map_pose();
        self.layered_map.clear_radius(
            Point2::new(robot_map.translation.x, robot_map.translation.y),
            self.config.clear_radius,
        );

        *self.current_path.lock() = None;
        *self.current_trajectory.lock() = None;

        let run = Arc::new(GoalRun::new());
        let context = StageContext {
            run: run.clone(),
            layered_map: self.layered_map.clone(),
            robot_state: self.robot_state.clone(),
            current_path: self.current_path.clone(),
            current_trajectory: self.current_trajectory.clone(),
            cmd_vel_tx: self.cmd_vel_tx.clone(),
            goal_pose,
            config: self.config.clone(),
        };

        let path_handle = {
            let ctx = context.clone();
            let planner = self.path_planner.clone();
            std::thread::Builder::new()
                .name("path_planner".into())
                .spawn(move || path_planner_loop(ctx, planner))
                .expect("failed to spawn path planner thread")
        };
        let trajectory_handle = {
            let ctx = context.clone();
            let planner = self.trajectory_planner.clone();
            std::thread::Builder::new()
                .name("trajectory_planner".into())
                .spawn(move || trajectory_planner_loop(ctx, planner))
                .expect("failed to spawn trajectory planner thread")
        };
        let controller_handle = {
            let ctx = context.clone();
            let controller = self.controller.clone();
            std::thread::Builder::new()
                .name("controller".into())
                .spawn(move || controller_loop(ctx, controller))
                .expect("failed to spawn controller thread")
        };

        let outcome = self.monitor_goal(&goal, &run);

        run.stop();
        let _ = path_handle.join();
        let _ = trajectory_handle.join();
        let _ = controller_handle.join();

        // A single zero twist on every goal exit.
        let _ = self.cmd_vel_tx.send(Twist::ZERO);

        *self.current_path.lock() = None;
        *self.current_trajectory.lock() = None;
        self.trajectory_planner.lock().clear_path();
        self.controller.lock().clear_trajectory();

        if let GoalStatus::Aborted(reason) = outcome {
            warn!("goal {} aborted ({})", goal.id, reason.kind());
        }
        goal.set_status(outcome);
    }

    /// Look up the goal's frame in the map frame, retrying until the
    /// localisation timeout.
    fn transform_goal(&self, goal: &GoalHandle) -> Option<Isometry2<f64>> {
        if goal.target.frame_id == self.config.global_frame {
            return Some(goal.target.pose);
        }
        let deadline = Instant::now() + self.config.localisation_timeout();
        loop {
            if goal.cancel_requested() {
                return None;
            }
            match self.tf.lookup(
                &self.config.global_frame,
                &goal.target.frame_id,
                goal.target.stamp,
            ) {
                Ok(t) => return Some(iso3_to_iso2(&t) * goal.target.pose),
                Err(e) => {
                    if Instant::now() >= deadline {
                        warn!("goal transform failed ({}): {}", e.kind(), e);
                        return None;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }

    /// Watch a running goal until it reaches a terminal condition.
    fn monitor_goal(&self, goal: &GoalHandle, run: &GoalRun) -> GoalStatus {
        let mut last_localised = Instant::now();
        loop {
            std::thread::sleep(MONITOR_TICK);

            if self.shutdown.load(Ordering::Acquire) || goal.cancel_requested() {
                return GoalStatus::Preempted;
            }
            // A newly queued goal preempts the current one.
            if !self.goal_rx.is_empty() {
                return GoalStatus::Preempted;
            }

            if let Some(rs) = self.robot_state.latest() {
                if rs.localised {
                    last_localised = Instant::now();
                }
            }
            if last_localised.elapsed() > self.config.localisation_timeout() {
                return GoalStatus::Aborted(AbortReason::NotLocalised);
            }

            if run.controller_done.load(Ordering::Acquire) {
                return GoalStatus::Succeeded;
            }
            if run.path_failures.load(Ordering::Acquire) >= MAX_CONSECUTIVE_FAILURES {
                return GoalStatus::Aborted(AbortReason::PlanningFailure);
            }
            if run.trajectory_failures.load(Ordering::Acquire) >= MAX_CONSECUTIVE_FAILURES {
                return GoalStatus::Aborted(AbortReason::TrajectoryFailure);
            }
            if run.control_failures.load(Ordering::Acquire) >= MAX_CONSECUTIVE_FAILURES {
                return GoalStatus::Aborted(AbortReason::ControlFailure);
            }

            if goal.status() == GoalStatus::Planning && self.current_path.lock().is_some() {
                goal.set_status(GoalStatus::Executing);
            }
        }
    }
}

/// Bounds of the robot's local region, in cells.
fn robot_region(
    layered_map: &LayeredMap,
    robot_map: &Isometry2<f64>,
    radius: f64,
) -> Option<CellBounds> {
    let map_data = layered_map.map_data()?;
    let dims = *map_data.dimensions();
    let centre = dims.world_to_grid(Point2::new(robot_map.translation.x, robot_map.translation.y));
    let radius_cells = (radius / dims.resolution()).ceil() as i32;
    Some(CellBounds::around(centre, radius_cells).intersection(&dims.bounds()))
}

fn sleep_remainder(start: Instant, tick: Duration) {
    let elapsed = start.elapsed();
    if elapsed < tick {
        std::thread::sleep(tick - elapsed);
    }
}

/// Swap rule of the path thread: adopt the candidate when it is cheaper
/// than the fraction of the current cost, or when the current path has had
/// no successful re-cost within the persistence window.
fn should_swap(
    new_cost: f64,
    old_cost: f64,
    last_successful_time: Instant,
    now: Instant,
    swap_fraction: f64,
    persistence: Duration,
) -> bool {
    new_cost < swap_fraction * old_cost
        || now.duration_since(last_successful_time) > persistence
}

fn path_planner_loop(ctx: StageContext, planner: Arc<Mutex<dyn PathPlanner>>) {
    let tick = Duration::from_secs_f64(1.0 / ctx.config.path_planner_frequency);
    while ctx.run.is_running() {
        let start = Instant::now();
        path_planner_tick(&ctx, &planner);
        sleep_remainder(start, tick);
    }
}

fn path_planner_tick(ctx: &StageContext, planner: &Arc<Mutex<dyn PathPlanner>>) {
    let Some(robot) = ctx.robot_state.latest().filter(|rs| rs.localised) else {
        return;
    };
    let start = robot.map_pose();

    let mut planner = planner.lock();
    let result = planner.plan(&start, &ctx.goal_pose);

    if result.outcome != PathOutcome::Successful || result.cost >= f64::MAX {
        let failures = ctx.run.path_failures.fetch_add(1, Ordering::AcqRel) + 1;
        warn!(
            "path planning failed (planning_budget_exceeded), {} consecutive",
            failures
        );
        return;
    }
    ctx.run.path_failures.store(0, Ordering::Release);

    let now = Instant::now();
    let mut slot = ctx.current_path.lock();
    match slot.as_mut() {
        None => {
            info!(
                "adopting initial path: {} nodes, cost {:.3}",
                result.path.nodes.len(),
                result.cost
            );
            *slot = Some(TrackingPath {
                goal: ctx.goal_pose,
                start_time: now,
                start_cost: result.cost,
                last_successful_time: now,
                last_successful_cost: result.cost,
                path: result.path,
            });
        }
        Some(tracking) => {
            // Re-cost both paths against the fresh snapshot.
            let new_cost = planner.cost(&result.path);
            let old_cost = planner.cost(&tracking.path);
            let last_successful = tracking.last_successful_time;
            if old_cost < f64::MAX {
                tracking.last_successful_time = now;
                tracking.last_successful_cost = old_cost;
            }
            if should_swap(
                new_cost,
                old_cost,
                last_successful,
                now,
                ctx.config.path_swap_fraction,
                ctx.config.path_persistence_time(),
            ) {
                let mut path = result.path;
                path.regenerate_id();
                info!("swapping path: cost {:.3} -> {:.3}", old_cost, new_cost);
                *tracking = TrackingPath {
                    goal: ctx.goal_pose,
                    start_time: now,
                    start_cost: new_cost,
                    last_successful_time: now,
                    last_successful_cost: new_cost,
                    path,
                };
            }
        }
    }
}

fn trajectory_planner_loop(ctx: StageContext, planner: Arc<Mutex<dyn TrajectoryPlanner>>) {
    let tick = Duration::from_secs_f64(1.0 / ctx.config.trajectory_planner_frequency);
    while ctx.run.is_running() {
        let start = Instant::now();
        trajectory_planner_tick(&ctx, &planner);
        sleep_remainder(start, tick);
    }
}

fn trajectory_planner_tick(ctx: &StageContext, planner: &Arc<Mutex<dyn TrajectoryPlanner>>) {
    let Some(robot) = ctx.robot_state.latest().filter(|rs| rs.localised) else {
        return;
    };

    let mut planner = planner.lock();

    // Sync the nominal path; an id change resets the planner's window.
    let path_len = {
        let slot = ctx.current_path.lock();
        match slot.as_ref() {
            None => {
                planner.clear_path();
                return;
            }
            Some(tracking) => {
                if planner.path_id() != Some(tracking.path.id) {
                    planner.set_path(tracking.path.clone());
                }
                tracking.path.nodes.len()
            }
        }
    };

    let Some(region) = robot_region(&ctx.layered_map, &robot.map_pose(), ctx.config.clear_radius)
    else {
        return;
    };
    let result = planner.plan(region, &robot.state, &robot.map_to_odom);
    drop(planner);

    let path_end_i = result.path_end_i;
    match (result.outcome, result.trajectory) {
        (TrajectoryOutcome::Failed, _) | (_, None) => {
            let failures = ctx.run.trajectory_failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                "trajectory planning failed (band_collision), {} consecutive",
                failures
            );
        }
        (outcome, Some(mut trajectory)) => {
            ctx.run.trajectory_failures.store(0, Ordering::Release);
            let goal_trajectory = outcome == TrajectoryOutcome::Successful
                && path_len > 0
                && path_end_i + 1 >= path_len;

            let mut slot = ctx.current_trajectory.lock();
            // Trajectory stamps strictly increase.
            if let Some(previous) = slot.as_ref() {
                if trajectory.stamp <= previous.trajectory.stamp {
                    trajectory.stamp = previous.trajectory.stamp + Duration::from_nanos(1);
                }
            }
            *slot = Some(ControlTrajectory {
                goal_trajectory,
                trajectory,
            });
        }
    }
}

fn controller_loop(ctx: StageContext, controller: Arc<Mutex<dyn Controller>>) {
    let tick = Duration::from_secs_f64(1.0 / ctx.config.controller_frequency);
    while ctx.run.is_running() {
        let start = Instant::now();
        controller_tick(&ctx, &controller);
        sleep_remainder(start, tick);
    }
}

fn controller_tick(ctx: &StageContext, controller: &Arc<Mutex<dyn Controller>>) {
    let Some(robot) = ctx.robot_state.latest() else {
        return;
    };

    // The robot must be locatable on the grid to be controlled.
    if let Some(map_data) = ctx.layered_map.map_data() {
        let robot_map = robot.map_pose();
        let position = Point2::new(robot_map.translation.x, robot_map.translation.y);
        if !map_data.dimensions().contains_world(position) {
            let failures = ctx.run.control_failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!("robot is off the grid (controller_off_path), {} consecutive", failures);
            let _ = ctx.cmd_vel_tx.send(Twist::ZERO);
            return;
        }
    }

    let current = { ctx.current_trajectory.lock().clone() };
    let Some(current) = current else {
        return;
    };

    let mut controller = controller.lock();
    if controller.trajectory_id() != Some(current.trajectory.id) {
        controller.set_trajectory(current.trajectory.clone());
    }

    let odom = Odometry {
        stamp: robot.odom_stamp,
        pose: robot.state.pose,
        velocity: robot.state.velocity,
    };
    let control = controller.compute_control(Instant::now(), stamp_now(), &odom);

    match control.state {
        ControlState::Running => {
            ctx.run.control_failures.store(0, Ordering::Release);
            let _ = ctx.cmd_vel_tx.send(control.cmd_vel);
        }
        ControlState::Complete => {
            let _ = ctx.cmd_vel_tx.send(Twist::ZERO);
            if current.goal_trajectory {
                ctx.run.controller_done.store(true, Ordering::Release);
            }
        }
        ControlState::Failed => {
            let failures = ctx.run.control_failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!("control failed (controller_off_path), {} consecutive", failures);
            let _ = ctx.cmd_vel_tx.send(Twist::ZERO);
            // Force a trajectory reset.
            *ctx.current_trajectory.lock() = None;
            controller.clear_trajectory();
        }
    }
}
