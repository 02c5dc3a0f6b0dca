//! Goal lifecycle and the action-like request protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bhumi_map::Stamp;
use crossbeam_channel::{unbounded, Receiver, Sender};
use nalgebra::Isometry2;
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Goals whose stamp is older than this are aborted on receipt.
pub const STALE_GOAL_AGE: Duration = Duration::from_secs(5);

/// Why a goal was aborted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortReason {
    NoTransform,
    StaleGoal,
    PlanningFailure,
    TrajectoryFailure,
    ControlFailure,
    NotLocalised,
}

impl AbortReason {
    /// Stable error-kind string surfaced to the client and the logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AbortReason::NoTransform => "no_transform",
            AbortReason::StaleGoal => "stale_goal",
            AbortReason::PlanningFailure => "planning_budget_exceeded",
            AbortReason::TrajectoryFailure => "band_collision",
            AbortReason::ControlFailure => "controller_off_path",
            AbortReason::NotLocalised => "transform_unavailable",
        }
    }
}

/// Lifecycle state of a goal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GoalStatus {
    Accepted,
    Planning,
    Executing,
    Succeeded,
    Aborted(AbortReason),
    Preempted,
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GoalStatus::Succeeded | GoalStatus::Aborted(_) | GoalStatus::Preempted
        )
    }
}

/// A goal pose with its frame and stamp.
#[derive(Clone, Debug)]
pub struct PoseStamped {
    pub frame_id: String,
    pub stamp: Stamp,
    pub pose: Isometry2<f64>,
}

/// Supervisor-side handle of an active goal.
#[derive(Clone, Debug)]
pub struct GoalHandle {
    pub id: Uuid,
    pub target: PoseStamped,
    status: Arc<Mutex<GoalStatus>>,
    cancel: Arc<AtomicBool>,
}

impl GoalHandle {
    pub fn status(&self) -> GoalStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: GoalStatus) {
        let mut current = self.status.lock();
        if *current != status {
            info!("goal {}: {:?} -> {:?}", self.id, *current, status);
            *current = status;
        }
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Client-side view of a goal.
#[derive(Clone, Debug)]
pub struct ClientGoal {
    pub id: Uuid,
    status: Arc<Mutex<GoalStatus>>,
    cancel: Arc<AtomicBool>,
}

impl ClientGoal {
    pub fn status(&self) -> GoalStatus {
        *self.status.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Request cancellation; the supervisor preempts at its next check.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }
}

fn goal_pair(target: PoseStamped) -> (GoalHandle, ClientGoal) {
    let status = Arc::new(Mutex::new(GoalStatus::Accepted));
    let cancel = Arc::new(AtomicBool::new(false));
    let id = Uuid::new_v4();
    (
        GoalHandle {
            id,
            target,
            status: status.clone(),
            cancel: cancel.clone(),
        },
        ClientGoal { id, status, cancel },
    )
}

/// Client end of the goal channel.
#[derive(Clone)]
pub struct NavigationClient {
    tx: Sender<GoalHandle>,
}

impl NavigationClient {
    /// Submit a goal. Any previously active goal is preempted by the
    /// supervisor when it picks this one up.
    pub fn send_goal(&self, target: PoseStamped) -> ClientGoal {
        let (handle, client) = goal_pair(target);
        if self.tx.send(handle).is_err() {
            client.cancel();
        }
        client
    }
}

/// Create the goal channel: the client for callers, the receiver for the
/// supervisor.
pub fn goal_channel() -> (NavigationClient, Receiver<GoalHandle>) {
    let (tx, rx) = unbounded();
    (NavigationClient { tx }, rx)
}
