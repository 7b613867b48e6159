//! Fiducial marker pipeline for roombad.
//!
//! An external capture process keeps the latest camera JPEG in a
//! `FrameSlot`. The worker wakes on a fixed cadence, decodes the frame to
//! grayscale, runs the dictionary detector, and publishes a
//! `FiducialResult` (latest-wins). The snap applier turns fresh results
//! into pose-correction commands for the odometry estimator.

pub mod detector;
pub mod dict;
pub mod snap;

pub use detector::{ArucoDetector, DetectorConfig};
pub use snap::{compute_target, SnapReject, SnapTuning};

use image::GrayImage;
use odometry::OdometryCommand;
use plan::Plan;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use types::{FiducialResult, MarkerObservation};

/// One camera frame as delivered by the capture process.
#[derive(Debug, Clone)]
pub struct CameraFrame {
    pub jpeg: Arc<Vec<u8>>,
    pub timestamp_ms: u64,
}

/// Latest-frame slot: one external writer, many readers.
#[derive(Debug, Clone, Default)]
pub struct FrameSlot {
    inner: Arc<Mutex<Option<CameraFrame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame (called by the capture collaborator).
    pub fn publish(&self, jpeg: Vec<u8>, timestamp_ms: u64) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = Some(CameraFrame {
            jpeg: Arc::new(jpeg),
            timestamp_ms,
        });
    }

    pub fn latest(&self) -> Option<CameraFrame> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Detector seam: the worker only needs grayscale-in, observations-out.
pub trait Detect: Send + Sync {
    fn detect(&self, gray: &GrayImage, timestamp_ms: u64)
        -> Result<Vec<MarkerObservation>, String>;
}

impl Detect for ArucoDetector {
    fn detect(
        &self,
        gray: &GrayImage,
        timestamp_ms: u64,
    ) -> Result<Vec<MarkerObservation>, String> {
        Ok(ArucoDetector::detect(self, gray, timestamp_ms))
    }
}

/// Resolve a configured dictionary name to a detector.
pub fn detector_for(dictionary: &str) -> Option<Box<dyn Detect>> {
    match dictionary {
        "aruco_4x4_50" => Some(Box::new(ArucoDetector::dict_4x4_50())),
        _ => None,
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub enabled: bool,
    /// Detection cadence
    pub interval: Duration,
    /// Dictionary name, e.g. "aruco_4x4_50"
    pub dictionary: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_millis(500),
            dictionary: "aruco_4x4_50".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    WaitingFrame,
    Detecting,
    Published,
    Failed,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn failure(config: &WorkerConfig, reason: impl Into<String>) -> FiducialResult {
    FiducialResult {
        enabled: config.enabled,
        ok: false,
        reason: Some(reason.into()),
        markers: Vec::new(),
        frame_width: 0,
        frame_height: 0,
        timestamp_ms: now_ms(),
    }
}

/// The detection worker task: fixed cadence, latest-wins results.
pub async fn run_worker(
    config: WorkerConfig,
    slot: FrameSlot,
    results: watch::Sender<FiducialResult>,
    mut shutdown: watch::Receiver<bool>,
) {
    results.send_replace(failure(&config, "idle"));
    if !config.enabled {
        info!("Fiducial worker disabled");
        return;
    }

    let detector = detector_for(&config.dictionary);
    if detector.is_none() {
        warn!(dictionary = %config.dictionary, "Unsupported fiducial dictionary");
    }
    let max_frame_age_ms = 3 * config.interval.as_millis() as u64;
    let mut state = WorkerState::WaitingFrame;
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        dictionary = %config.dictionary,
        interval_ms = config.interval.as_millis() as u64,
        "Fiducial worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let Some(detector) = detector.as_deref() else {
            state = WorkerState::Failed;
            results.send_replace(failure(
                &config,
                format!("unsupported_dictionary:{}", config.dictionary),
            ));
            continue;
        };

        let result = detect_once(&config, &slot, detector, max_frame_age_ms, &mut state);
        debug!(?state, ok = result.ok, reason = ?result.reason, "Worker cycle");
        results.send_replace(result);
    }
    info!("Fiducial worker stopped");
}

/// One worker cycle: waiting_frame -> detecting -> published | failed.
fn detect_once(
    config: &WorkerConfig,
    slot: &FrameSlot,
    detector: &dyn Detect,
    max_frame_age_ms: u64,
    state: &mut WorkerState,
) -> FiducialResult {
    *state = WorkerState::WaitingFrame;
    let Some(frame) = slot.latest() else {
        *state = WorkerState::Failed;
        return failure(config, "no_frame");
    };
    if now_ms().saturating_sub(frame.timestamp_ms) > max_frame_age_ms {
        *state = WorkerState::Failed;
        return failure(config, "no_frame");
    }

    *state = WorkerState::Detecting;
    let gray = match image::load_from_memory_with_format(&frame.jpeg, image::ImageFormat::Jpeg) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            *state = WorkerState::Failed;
            debug!(?e, "Camera frame decode failed");
            return failure(config, "decode_failed");
        }
    };

    match detector.detect(&gray, frame.timestamp_ms) {
        Ok(markers) => {
            *state = WorkerState::Published;
            debug!(count = markers.len(), "Fiducial detection cycle");
            FiducialResult {
                enabled: true,
                ok: true,
                reason: None,
                markers,
                frame_width: gray.width(),
                frame_height: gray.height(),
                timestamp_ms: now_ms(),
            }
        }
        Err(msg) => {
            *state = WorkerState::Failed;
            failure(config, format!("detector_error:{msg}"))
        }
    }
}

/// Snap applier configuration.
#[derive(Debug, Clone)]
pub struct SnapApplierConfig {
    pub enabled: bool,
    pub tuning: SnapTuning,
    pub pos_blend: f64,
    pub theta_blend: f64,
    /// Results older than this are ignored (default 2x detection period)
    pub stale_ms: u64,
}

impl Default for SnapApplierConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tuning: SnapTuning::default(),
            pos_blend: 0.35,
            theta_blend: 0.2,
            stale_ms: 1000,
        }
    }
}

/// Turns fresh fiducial results into odometry snap commands. Rejections
/// are logged once per reason signature; the odometry is untouched.
/// The plan arrives through a latest-value slot so reloads take effect
/// on the next result.
pub async fn run_snap_applier(
    plan: watch::Receiver<Arc<Plan>>,
    mut results: watch::Receiver<FiducialResult>,
    commands: mpsc::Sender<OdometryCommand>,
    config: SnapApplierConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        info!("Fiducial snap disabled");
        return;
    }
    info!(
        pos_blend = config.pos_blend,
        theta_blend = config.theta_blend,
        "Snap applier started"
    );
    let mut logged: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            changed = results.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let result = results.borrow_and_update().clone();
        if !result.ok || result.markers.is_empty() {
            continue;
        }
        if now_ms().saturating_sub(result.timestamp_ms) > config.stale_ms {
            log_rejection(&mut logged, "detection older than the stale threshold");
            continue;
        }
        let active_plan = plan.borrow().clone();
        match compute_target(&active_plan, &result.markers, &config.tuning) {
            Ok(target) => {
                logged.clear();
                debug!(
                    x = target.x_mm,
                    y = target.y_mm,
                    theta = target.theta_deg,
                    "Snap target computed"
                );
                if commands
                    .send(OdometryCommand::ApplySnap {
                        target,
                        pos_blend: config.pos_blend,
                        theta_blend: config.theta_blend,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(reject) => log_rejection(&mut logged, &reject.reason),
        }
    }
    info!("Snap applier stopped");
}

fn log_rejection(logged: &mut HashSet<String>, reason: &str) {
    if logged.insert(reason.to_string()) {
        warn!(%reason, "Snap rejected");
    }
}
