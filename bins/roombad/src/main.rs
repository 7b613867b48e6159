//! roombad — teleoperation and live-monitoring daemon.
//!
//! Wires the services together: plan, OI driver, odometry estimator,
//! fiducial worker + snap applier, control session and telemetry
//! broadcaster. Exit codes: 0 normal, 1 fatal init, 2 plan invalid,
//! 3 serial port unavailable at init.

use anyhow::Result;
use clap::Parser;
use fiducial::{FrameSlot, SnapApplierConfig, SnapTuning, WorkerConfig};
use odometry::{Estimator, OdomSource, OdometryCommand, OdometryConfig, OdometrySnapshot};
use oi::{Driver, DriverConfig, OiError};
use plan::Plan;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use teleop::{BroadcastConfig, Broadcaster, SessionConfig, SessionServer, TelemetryServer};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use types::{FiducialResult, ModeRequest};

/// Flat configuration options (roombad.toml). Every key has a default so a
/// missing file or a partial file is fine.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct FileConfig {
    telemetry_interval_sec: f64,
    roomba_serial_port: String,
    roomba_baudrate: u32,
    roomba_timeout_sec: f64,
    odometry_source: String,
    odometry_mm_per_tick: f64,
    odometry_wheelbase_mm: f64,
    odometry_linear_scale: f64,
    odometry_angular_scale: f64,
    odometry_robot_radius_mm: f64,
    odometry_collision_margin_scale: f64,
    odometry_history_path: PathBuf,
    odometry_history_fsync: bool,
    aruco_enabled: bool,
    aruco_interval_sec: f64,
    aruco_dictionary: String,
    aruco_snap_enabled: bool,
    aruco_focal_px: f64,
    aruco_marker_size_cm: f64,
    aruco_pose_blend: f64,
    aruco_theta_blend: f64,
    aruco_heading_gain_deg: f64,
    aruco_stale_factor: f64,
    plan_path: PathBuf,
    control_ws_port: u16,
    telemetry_ws_port: u16,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_sec: 0.1,
            roomba_serial_port: "/dev/ttyUSB0".into(),
            roomba_baudrate: 115_200,
            roomba_timeout_sec: 1.0,
            odometry_source: "encoders".into(),
            odometry_mm_per_tick: 0.445,
            odometry_wheelbase_mm: 235.0,
            odometry_linear_scale: 1.0,
            odometry_angular_scale: 1.0,
            odometry_robot_radius_mm: 180.0,
            odometry_collision_margin_scale: 0.55,
            odometry_history_path: "odometry_history.jsonl".into(),
            odometry_history_fsync: false,
            aruco_enabled: false,
            aruco_interval_sec: 0.5,
            aruco_dictionary: "aruco_4x4_50".into(),
            aruco_snap_enabled: false,
            aruco_focal_px: 615.0,
            aruco_marker_size_cm: 15.0,
            aruco_pose_blend: 0.35,
            aruco_theta_blend: 0.2,
            aruco_heading_gain_deg: 25.0,
            aruco_stale_factor: 2.0,
            plan_path: "config/plan.json".into(),
            control_ws_port: 4810,
            telemetry_ws_port: 4811,
        }
    }
}

impl FileConfig {
    fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(FileConfig::default())
        }
    }

    fn odometry_source(&self) -> OdomSource {
        match self.odometry_source.as_str() {
            "encoders" => OdomSource::Encoders,
            "distance" => OdomSource::Distance,
            other => {
                warn!(source = other, "Unknown odometry_source, using encoders");
                OdomSource::Encoders
            }
        }
    }
}

#[derive(Parser)]
#[command(name = "roombad", about = "Teleoperation daemon for an Open Interface robot")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/roombad.toml")]
    config: PathBuf,

    /// Plan file. Overrides config file.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Serial device (e.g. /dev/ttyUSB0). Overrides config file.
    #[arg(long)]
    serial_port: Option<String>,

    /// Control WebSocket port. Overrides config file.
    #[arg(long)]
    control_port: Option<u16>,

    /// Telemetry WebSocket port. Overrides config file.
    #[arg(long)]
    telemetry_port: Option<u16>,

    /// Disable the fiducial worker regardless of config
    #[arg(long)]
    no_aruco: bool,

    /// Log directory for text logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // The guard must live for the whole process so logs flush on exit.
    let _log_guard = match init_logging(&args.log_dir, &args.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Cannot initialise logging: {e}");
            return ExitCode::from(1);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(FatalError::PlanInvalid(e)) => {
            error!(%e, "Plan invalid");
            ExitCode::from(2)
        }
        Err(FatalError::PortUnavailable(e)) => {
            error!(%e, "Serial port unavailable");
            ExitCode::from(3)
        }
        Err(FatalError::Init(e)) => {
            error!(%e, "Fatal initialisation error");
            ExitCode::from(1)
        }
    }
}

enum FatalError {
    Init(anyhow::Error),
    PlanInvalid(plan::PlanError),
    PortUnavailable(String),
}

async fn run(args: Args) -> Result<(), FatalError> {
    let config = FileConfig::load(&args.config).map_err(FatalError::Init)?;
    info!(path = %args.config.display(), "Loaded config");

    // Plan
    let plan_path = args.plan.clone().unwrap_or_else(|| config.plan_path.clone());
    let marker_size_mm = config.aruco_marker_size_cm * 10.0;
    let plan = Arc::new(
        Plan::load(&plan_path, marker_size_mm).map_err(FatalError::PlanInvalid)?,
    );

    // Driver
    let serial_port = args
        .serial_port
        .clone()
        .unwrap_or_else(|| config.roomba_serial_port.clone());
    let driver = Arc::new(Driver::new(DriverConfig {
        port: serial_port.clone(),
        baud: config.roomba_baudrate,
        write_timeout: Duration::from_secs_f64(config.roomba_timeout_sec),
        ..DriverConfig::default()
    }));
    match driver.connect() {
        Ok(()) => {}
        Err(OiError::PortUnavailable(e)) => return Err(FatalError::PortUnavailable(e)),
        Err(e) => return Err(FatalError::Init(e.into())),
    }

    // Best-effort robot bring-up; operators re-run `init` any time.
    let session_config = SessionConfig {
        port: args.control_port.unwrap_or(config.control_ws_port),
        ..SessionConfig::default()
    };
    if let Err(e) = bring_up(&driver, &session_config).await {
        warn!(?e, "Robot bring-up failed, continuing degraded");
    }

    // Odometry estimator
    let estimator = Estimator::new(
        OdometryConfig {
            source: config.odometry_source(),
            mm_per_tick: config.odometry_mm_per_tick,
            wheelbase_mm: config.odometry_wheelbase_mm,
            linear_scale: config.odometry_linear_scale,
            angular_scale: config.odometry_angular_scale,
            robot_radius_mm: config.odometry_robot_radius_mm,
            collision_margin_scale: config.odometry_collision_margin_scale,
        },
        plan.clone(),
        &config.odometry_history_path,
        config.odometry_history_fsync,
    )
    .map_err(|e| FatalError::Init(e.into()))?;

    let shared_odometry = Arc::new(RwLock::new(OdometrySnapshot {
        pose: estimator.current(),
        ..Default::default()
    }));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (odom_cmd_tx, odom_cmd_rx) = mpsc::channel::<OdometryCommand>(16);

    let frames = driver
        .take_frames()
        .ok_or_else(|| FatalError::Init(anyhow::anyhow!("sensor frame queue already taken")))?;
    {
        let driver = driver.clone();
        tokio::spawn(odometry::run_estimator(
            estimator,
            frames,
            odom_cmd_rx,
            shared_odometry.clone(),
            move || driver.flag_consumer_lag(),
            shutdown_rx.clone(),
        ));
    }

    // Plan reload: SIGHUP reloads the document; a failed reload keeps
    // the active plan in service. The estimator gets a SetPlan command,
    // the snap applier reads the watch slot.
    let (plan_tx, plan_rx) = watch::channel(plan.clone());
    #[cfg(unix)]
    spawn_plan_reload(plan_tx, plan_path.clone(), marker_size_mm, odom_cmd_tx.clone());
    #[cfg(not(unix))]
    drop(plan_tx);

    // Fiducial worker + snap applier
    let aruco_enabled = config.aruco_enabled && !args.no_aruco;
    let frame_slot = FrameSlot::new();
    let (fiducial_tx, fiducial_rx) = watch::channel(FiducialResult::default());
    tokio::spawn(fiducial::run_worker(
        WorkerConfig {
            enabled: aruco_enabled,
            interval: Duration::from_secs_f64(config.aruco_interval_sec),
            dictionary: config.aruco_dictionary.clone(),
        },
        frame_slot.clone(),
        fiducial_tx,
        shutdown_rx.clone(),
    ));

    let stale_ms = (config.aruco_interval_sec * config.aruco_stale_factor * 1000.0) as u64;
    tokio::spawn(fiducial::run_snap_applier(
        plan_rx,
        fiducial_rx.clone(),
        odom_cmd_tx.clone(),
        SnapApplierConfig {
            enabled: aruco_enabled && config.aruco_snap_enabled,
            tuning: SnapTuning {
                focal_px: config.aruco_focal_px,
                heading_gain_deg: config.aruco_heading_gain_deg,
            },
            pos_blend: config.aruco_pose_blend,
            theta_blend: config.aruco_theta_blend,
            stale_ms,
        },
        shutdown_rx.clone(),
    ));

    // Telemetry broadcaster + servers
    let broadcast_config = BroadcastConfig {
        port: args.telemetry_port.unwrap_or(config.telemetry_ws_port),
        interval: Duration::from_secs_f64(config.telemetry_interval_sec),
        fiducial_stale_ms: stale_ms,
    };
    let telemetry_port = broadcast_config.port;
    let broadcaster = Broadcaster::new(
        broadcast_config,
        shared_odometry.clone(),
        driver.subscribe_latest(),
        driver.clone(),
        fiducial_rx,
    );
    let telemetry_server = TelemetryServer::new(telemetry_port, &broadcaster);
    tokio::spawn(broadcaster.run(shutdown_rx.clone()));
    tokio::spawn(async move {
        if let Err(e) = telemetry_server.run().await {
            error!(?e, "Telemetry server error");
        }
    });

    let session_server = SessionServer::new(
        session_config.clone(),
        driver.clone(),
        driver.subscribe_latest(),
    );
    tokio::spawn(async move {
        if let Err(e) = session_server.run().await {
            error!(?e, "Control session server error");
        }
    });

    info!(
        serial = %serial_port,
        control_port = session_config.port,
        telemetry_port,
        aruco = aruco_enabled,
        "roombad running"
    );

    // Orderly shutdown: stop command, flush, close.
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| FatalError::Init(e.into()))?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
    driver.shutdown().await;
    // Give tasks a moment to observe the signal and release locks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Reload the plan on SIGHUP and fan the fresh one out to the estimator
/// and the snap applier's watch slot.
#[cfg(unix)]
fn spawn_plan_reload(
    plan_tx: watch::Sender<Arc<Plan>>,
    plan_path: PathBuf,
    marker_size_mm: f64,
    commands: mpsc::Sender<OdometryCommand>,
) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(?e, "SIGHUP handler unavailable, plan reload disabled");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            let current = plan_tx.borrow().clone();
            let fresh = Plan::reload(&current, &plan_path, marker_size_mm);
            if Arc::ptr_eq(&fresh, &current) {
                continue;
            }
            let _ = plan_tx.send(fresh.clone());
            if commands
                .send(OdometryCommand::SetPlan(fresh))
                .await
                .is_err()
            {
                break;
            }
            info!(path = %plan_path.display(), "Plan reloaded");
        }
    });
}

/// connect + start + safe + sensor stream, as `init` does for operators.
async fn bring_up(driver: &Driver, config: &SessionConfig) -> Result<(), OiError> {
    driver.start().await?;
    driver.mode(ModeRequest::Safe).await?;
    driver.ensure_sensor_stream(config.stream_group, config.stream_hz)
}

/// Initialise logging with stdout and rolling file output.
///
/// Returns a guard that must be held for the lifetime of the program so
/// logs are flushed on shutdown.
fn init_logging(
    log_dir: &std::path::Path,
    level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "roombad.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("roombad={level},oi={level},odometry={level},fiducial={level},teleop={level},plan={level}")));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
