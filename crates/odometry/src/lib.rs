//! Pose estimation for roombad.
//!
//! Integrates wheel motion into an (x, y, theta) pose that is constrained
//! to stay inside the room contour and outside every obstacle. The robot
//! is a disc; the required clearance from any edge is
//! `robot_radius_mm * collision_margin_scale`. A step into geometry slides
//! along the violated edge, or clamps to zero translation in a corner.
//! Heading always integrates; rotation needs no clearance.
//!
//! Every accepted update appends one JSON line to the history file; the
//! last complete line is the authoritative pose after a restart.

mod history;

pub use history::History;

use nalgebra::Vector2;
use plan::Plan;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::{normalize_deg, HistoryRecord, Pose, PoseSource, SensorSnapshot, StepDelta};

#[derive(Error, Debug)]
pub enum OdometryError {
    #[error("History file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("History record error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Which sensor fields drive the integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OdomSource {
    /// Wheel encoder counts (packets 43/44)
    #[default]
    Encoders,
    /// The OI one-frame distance/angle packets (19/20)
    Distance,
}

/// Estimator tuning. Defaults match a 700-series robot.
#[derive(Debug, Clone)]
pub struct OdometryConfig {
    pub source: OdomSource,
    /// Wheel travel per encoder tick
    pub mm_per_tick: f64,
    /// Wheel separation
    pub wheelbase_mm: f64,
    /// Gain on integrated translation
    pub linear_scale: f64,
    /// Gain on integrated rotation
    pub angular_scale: f64,
    /// Collision disc radius
    pub robot_radius_mm: f64,
    /// Fraction of the radius required as edge clearance
    pub collision_margin_scale: f64,
}

impl Default for OdometryConfig {
    fn default() -> Self {
        Self {
            source: OdomSource::Encoders,
            mm_per_tick: 0.445,
            wheelbase_mm: 235.0,
            linear_scale: 1.0,
            angular_scale: 1.0,
            robot_radius_mm: 180.0,
            collision_margin_scale: 0.55,
        }
    }
}

/// Consistent read of the estimator state, refreshed after every update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OdometrySnapshot {
    pub pose: Pose,
    pub step: StepDelta,
    pub source: PoseSource,
    pub timestamp_ms: u64,
}

/// Shared read handle: one writer (the estimator task), many readers.
pub type SharedOdometry = Arc<RwLock<OdometrySnapshot>>;

/// Commands accepted by the estimator task.
#[derive(Debug, Clone)]
pub enum OdometryCommand {
    ApplySnap {
        target: Pose,
        pos_blend: f64,
        theta_blend: f64,
    },
    ResetTo(Pose),
    ResetHistory(Pose),
    /// Swap the collision geometry after a plan reload.
    SetPlan(Arc<Plan>),
}

pub struct Estimator {
    config: OdometryConfig,
    plan: Arc<Plan>,
    pose: Pose,
    last_counts: Option<(u16, u16)>,
    history: History,
}

impl Estimator {
    /// Build an estimator whose start pose is the last history record, or
    /// the plan's start pose when the file is missing or empty.
    pub fn new(
        config: OdometryConfig,
        plan: Arc<Plan>,
        history_path: &std::path::Path,
        fsync: bool,
    ) -> Result<Self, OdometryError> {
        let (history, last) = History::open(history_path, fsync)?;
        let pose = last
            .map(|r| r.pose.normalized())
            .unwrap_or_else(|| plan.start_pose().normalized());
        info!(
            x = pose.x_mm,
            y = pose.y_mm,
            theta = pose.theta_deg,
            restored = last.is_some(),
            "Odometry initialised"
        );
        Ok(Self {
            config,
            plan,
            pose,
            last_counts: None,
            history,
        })
    }

    pub fn current(&self) -> Pose {
        self.pose
    }

    /// Swap in freshly loaded collision geometry.
    pub fn set_plan(&mut self, plan: Arc<Plan>) {
        self.plan = plan;
    }

    fn clearance(&self) -> f64 {
        self.config.robot_radius_mm * self.config.collision_margin_scale
    }

    /// Integrate one sensor frame. Returns the new pose and step.
    pub fn update_from_sensor(
        &mut self,
        snap: &SensorSnapshot,
    ) -> Result<(Pose, StepDelta), OdometryError> {
        let (ds_mm, dtheta_deg, source) = match self.config.source {
            OdomSource::Encoders => {
                let counts = (snap.encoder_left, snap.encoder_right);
                let Some(last) = self.last_counts.replace(counts) else {
                    // First frame only establishes the count baseline.
                    return self.commit(StepDelta::default(), PoseSource::Encoders, snap.timestamp_ms);
                };
                // Counts roll over at 2^16; the wrapping difference
                // reinterpreted as i16 yields the signed delta.
                let dl = counts.0.wrapping_sub(last.0) as i16 as f64;
                let dr = counts.1.wrapping_sub(last.1) as i16 as f64;
                let s_left = dl * self.config.mm_per_tick;
                let s_right = dr * self.config.mm_per_tick;
                let ds = (s_left + s_right) / 2.0 * self.config.linear_scale;
                let dtheta_rad =
                    (s_right - s_left) / self.config.wheelbase_mm * self.config.angular_scale;
                (ds, dtheta_rad.to_degrees(), PoseSource::Encoders)
            }
            OdomSource::Distance => (
                snap.distance_mm as f64 * self.config.linear_scale,
                snap.angle_deg as f64 * self.config.angular_scale,
                PoseSource::Distance,
            ),
        };

        let step = self.integrate(ds_mm, dtheta_deg);
        self.commit(step, source, snap.timestamp_ms)
    }

    /// Advance the pose by a body-frame arc, clamped against the plan.
    fn integrate(&mut self, ds_mm: f64, dtheta_deg: f64) -> StepDelta {
        let heading = self.pose.theta_rad();
        let delta = Vector2::new(ds_mm * heading.cos(), ds_mm * heading.sin());
        let accepted = self.clamp_translation(delta);

        self.pose = Pose::new(
            self.pose.x_mm + accepted.x,
            self.pose.y_mm + accepted.y,
            self.pose.theta_deg + dtheta_deg,
        );

        let ds_accepted = accepted.norm() * ds_mm.signum();
        StepDelta {
            ds_mm: if ds_mm == 0.0 { 0.0 } else { ds_accepted },
            dtheta_deg,
        }
    }

    /// Clamp a translation so the disc keeps its clearance. The step is
    /// decomposed against the nearest violated edge: the normal component
    /// advances only to the contact distance, the tangential component
    /// slides along the edge. A slide that still violates (concave
    /// corner) zeroes the translation. A step never worsens an existing
    /// violation, but escaping one is allowed.
    fn clamp_translation(&self, delta: Vector2<f64>) -> Vector2<f64> {
        if delta.norm_squared() == 0.0 {
            return delta;
        }
        let clearance = self.clearance();
        let here = Vector2::new(self.pose.x_mm, self.pose.y_mm);
        let depth_here = self.violation_depth(here);

        let candidate = here + delta;
        if self.acceptable(candidate, depth_here) {
            return delta;
        }

        let Some(hit) = self.plan.worst_violation(candidate, clearance) else {
            return delta;
        };
        let tangent = hit.edge.tangent();
        let tangential = tangent * delta.dot(&tangent);
        let normal = delta - tangential;
        let normal_len = normal.norm();
        let slack = (hit.edge.distance_to(here) - clearance).max(0.0);
        let mut accepted = tangential;
        if normal_len > f64::EPSILON {
            accepted += normal * (slack.min(normal_len) / normal_len);
        }

        if self.acceptable(here + accepted, depth_here) {
            debug!(depth = hit.depth, "Translation clipped at edge");
            return accepted;
        }
        if tangential.norm_squared() > 0.0 && self.acceptable(here + tangential, depth_here) {
            debug!(depth = hit.depth, "Translation slid along edge");
            return tangential;
        }

        debug!(depth = hit.depth, "Translation clamped");
        Vector2::zeros()
    }

    fn acceptable(&self, candidate: Vector2<f64>, depth_here: f64) -> bool {
        let depth = self.violation_depth(candidate);
        depth <= 0.0 || depth <= depth_here + 1e-9
    }

    fn violation_depth(&self, p: Vector2<f64>) -> f64 {
        self.plan
            .worst_violation(p, self.clearance())
            .map(|hit| hit.depth)
            .unwrap_or(0.0)
    }

    /// Blend toward a target pose: linear on position, shortest-arc on
    /// heading. The blended position still respects the collision clamp.
    pub fn apply_snap(
        &mut self,
        target: Pose,
        pos_blend: f64,
        theta_blend: f64,
    ) -> Result<(Pose, StepDelta), OdometryError> {
        let pos_blend = pos_blend.clamp(0.0, 1.0);
        let theta_blend = theta_blend.clamp(0.0, 1.0);
        let target = target.normalized();

        let delta = Vector2::new(
            (target.x_mm - self.pose.x_mm) * pos_blend,
            (target.y_mm - self.pose.y_mm) * pos_blend,
        );
        let accepted = self.clamp_translation(delta);
        let dtheta = normalize_deg(target.theta_deg - self.pose.theta_deg) * theta_blend;

        self.pose = Pose::new(
            self.pose.x_mm + accepted.x,
            self.pose.y_mm + accepted.y,
            self.pose.theta_deg + dtheta,
        );
        let step = StepDelta {
            ds_mm: accepted.norm(),
            dtheta_deg: dtheta,
        };
        debug!(
            x = self.pose.x_mm,
            y = self.pose.y_mm,
            theta = self.pose.theta_deg,
            "Snap applied"
        );
        self.commit(step, PoseSource::Snap, now_ms())
    }

    /// Set the pose directly (no collision clamp, recorded to history).
    pub fn reset_to(&mut self, pose: Pose) -> Result<(Pose, StepDelta), OdometryError> {
        self.pose = pose.normalized();
        self.last_counts = None;
        self.commit(StepDelta::default(), PoseSource::Snap, now_ms())
    }

    /// Truncate the history and restart it at `pose`.
    pub fn reset_history(&mut self, pose: Pose) -> Result<(), OdometryError> {
        self.pose = pose.normalized();
        self.last_counts = None;
        self.history.reset(&HistoryRecord {
            pose: self.pose,
            step: StepDelta::default(),
            source: PoseSource::Snap,
            timestamp_ms: now_ms(),
        })
    }

    fn commit(
        &mut self,
        step: StepDelta,
        source: PoseSource,
        timestamp_ms: u64,
    ) -> Result<(Pose, StepDelta), OdometryError> {
        self.history.append(&HistoryRecord {
            pose: self.pose,
            step,
            source,
            timestamp_ms,
        })?;
        Ok((self.pose, step))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How far behind the sensor stream the estimator may run before the
/// driver is told to restart it.
const CONSUMER_LAG_MS: u64 = 200;

/// The single-writer estimator task.
///
/// Consumes the driver's no-drop frame queue in arrival order, applies
/// snap/reset commands, refreshes the shared snapshot after every change,
/// and flags the driver when it falls behind the stream.
pub async fn run_estimator(
    mut estimator: Estimator,
    mut frames: mpsc::UnboundedReceiver<SensorSnapshot>,
    mut commands: mpsc::Receiver<OdometryCommand>,
    shared: SharedOdometry,
    on_lag: impl Fn() + Send,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Odometry estimator task started");
    let mut commands_open = true;
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if now_ms().saturating_sub(frame.timestamp_ms) > CONSUMER_LAG_MS {
                    warn!("Odometry consumer lagging behind sensor stream");
                    on_lag();
                }
                let source = match estimator.config.source {
                    OdomSource::Encoders => PoseSource::Encoders,
                    OdomSource::Distance => PoseSource::Distance,
                };
                match estimator.update_from_sensor(&frame) {
                    Ok((pose, step)) => publish(&shared, pose, step, source, frame.timestamp_ms),
                    Err(e) => warn!(?e, "Failed to persist odometry update"),
                }
            }
            command = commands.recv(), if commands_open => {
                let Some(command) = command else {
                    commands_open = false;
                    continue;
                };
                let result = match command {
                    OdometryCommand::ApplySnap { target, pos_blend, theta_blend } => {
                        estimator.apply_snap(target, pos_blend, theta_blend)
                    }
                    OdometryCommand::ResetTo(pose) => estimator.reset_to(pose),
                    OdometryCommand::ResetHistory(pose) => {
                        estimator.reset_history(pose).map(|()| (pose, StepDelta::default()))
                    }
                    OdometryCommand::SetPlan(plan) => {
                        estimator.set_plan(plan);
                        continue;
                    }
                };
                match result {
                    Ok((pose, step)) => publish(&shared, pose, step, PoseSource::Snap, now_ms()),
                    Err(e) => warn!(?e, "Odometry command failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("Odometry estimator task stopped");
}

fn publish(
    shared: &SharedOdometry,
    pose: Pose,
    step: StepDelta,
    source: PoseSource,
    timestamp_ms: u64,
) {
    let mut guard = shared.write().unwrap_or_else(|e| e.into_inner());
    *guard = OdometrySnapshot {
        pose,
        step,
        source,
        timestamp_ms,
    };
}
