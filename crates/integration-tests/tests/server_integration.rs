//! End-to-end scenarios across the driver, estimator, safety arbitration
//! and snap pipeline, driven through scripted serial transports.

use approx::assert_relative_eq;
use futures_util::{SinkExt, StreamExt};
use odometry::{Estimator, OdometryCommand, OdometryConfig, OdometrySnapshot, SharedOdometry};
use oi::frame::build_stream_frame;
use oi::{Driver, DriverConfig, Transport, TransportFactory};
use plan::Plan;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use types::{FiducialResult, MarkerObservation, Pose};

const SQUARE_ROOM: &str = r#"{
    "contour": [[0,0],[3000,0],[3000,3000],[0,3000]],
    "start_pose": {"x": 500, "y": 500, "theta": 0}
}"#;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Transport replaying queued chunks; silent (with a short delay) after.
struct ScriptedTransport {
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Transport for ScriptedTransport {
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.chunks.lock().unwrap().pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => {
                std::thread::sleep(Duration::from_millis(2));
                Ok(0)
            }
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.writes.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }
}

struct Rig {
    driver: Arc<Driver>,
    chunks: Arc<Mutex<VecDeque<Vec<u8>>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn scripted_driver() -> Rig {
    let chunks: Arc<Mutex<VecDeque<Vec<u8>>>> = Arc::default();
    let writes: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let (c, w) = (chunks.clone(), writes.clone());
    let factory: TransportFactory = Arc::new(move || {
        Ok(Box::new(ScriptedTransport {
            chunks: c.clone(),
            writes: w.clone(),
        }) as Box<dyn Transport>)
    });
    // Scripts go quiet after replay; a huge silence threshold keeps the
    // self-heal path out of these scenarios.
    let config = DriverConfig {
        silence_periods: 100_000,
        ..DriverConfig::default()
    };
    let driver = Arc::new(Driver::with_factory(config, factory));
    driver.connect().unwrap();
    Rig {
        driver,
        chunks,
        writes,
    }
}

fn encoder_frame(left: u16, right: u16) -> Vec<u8> {
    build_stream_frame(&[(43, &left.to_be_bytes()), (44, &right.to_be_bytes())])
}

fn spawn_estimator(
    plan: &str,
    rig: &Rig,
    dir: &tempfile::TempDir,
) -> (SharedOdometry, mpsc::Sender<OdometryCommand>, watch::Sender<bool>) {
    let plan = Arc::new(Plan::from_json_str(plan, 150.0).unwrap());
    let estimator = Estimator::new(
        OdometryConfig::default(),
        plan,
        &dir.path().join("history.jsonl"),
        false,
    )
    .unwrap();
    let shared: SharedOdometry = Arc::new(RwLock::new(OdometrySnapshot {
        pose: estimator.current(),
        ..Default::default()
    }));
    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let frames = rig.driver.take_frames().unwrap();
    let lag_driver = rig.driver.clone();
    tokio::spawn(odometry::run_estimator(
        estimator,
        frames,
        cmd_rx,
        shared.clone(),
        move || lag_driver.flag_consumer_lag(),
        shutdown_rx,
    ));
    (shared, cmd_tx, shutdown_tx)
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_encoder_stream_moves_shared_pose() {
    // 1000 ticks on both wheels over ten stream frames: +445 mm in x.
    let rig = scripted_driver();
    let dir = tempfile::tempdir().unwrap();
    let (shared, _cmd, _shutdown) = spawn_estimator(SQUARE_ROOM, &rig, &dir);

    {
        let mut chunks = rig.chunks.lock().unwrap();
        for i in 0..=10u16 {
            chunks.push_back(encoder_frame(i * 100, i * 100));
        }
    }
    rig.driver.ensure_sensor_stream(100, 20.0).unwrap();

    wait_for("pose to advance", || {
        (shared.read().unwrap().pose.x_mm - 945.0).abs() < 1.0
    })
    .await;
    let pose = shared.read().unwrap().pose;
    assert_relative_eq!(pose.y_mm, 500.0, epsilon = 1e-6);
    assert_relative_eq!(pose.theta_deg, 0.0, epsilon = 1e-6);
}

#[tokio::test]
async fn test_forward_motion_clamps_at_wall() {
    // Start 201 mm from the wall clearance line and push 445 mm forward.
    let plan = r#"{
        "contour": [[0,0],[3000,0],[3000,3000],[0,3000]],
        "start_pose": {"x": 2700, "y": 500, "theta": 0}
    }"#;
    let rig = scripted_driver();
    let dir = tempfile::tempdir().unwrap();
    let (shared, _cmd, _shutdown) = spawn_estimator(plan, &rig, &dir);

    {
        let mut chunks = rig.chunks.lock().unwrap();
        for i in 0..=10u16 {
            chunks.push_back(encoder_frame(i * 100, i * 100));
        }
    }
    rig.driver.ensure_sensor_stream(100, 20.0).unwrap();

    // Clearance 180 * 0.55 = 99 mm: the centre stops at x = 2901.
    wait_for("pose to reach the wall", || {
        (shared.read().unwrap().pose.x_mm - 2901.0).abs() < 1e-6
    })
    .await;
    let pose = shared.read().unwrap().pose;
    assert_relative_eq!(pose.theta_deg, 0.0, epsilon = 1e-6);
}

#[tokio::test]
async fn test_bumper_guard_over_websocket() {
    // Left bumper active: forward drive is rewritten to stop, a
    // right turn passes through to the wire.
    let rig = scripted_driver();
    rig.chunks
        .lock()
        .unwrap()
        .push_back(build_stream_frame(&[(7, &[0x02])]));
    rig.driver.ensure_sensor_stream(100, 20.0).unwrap();

    let mut sensors = rig.driver.subscribe_latest();
    tokio::time::timeout(Duration::from_secs(2), sensors.changed())
        .await
        .expect("bumper snapshot")
        .unwrap();
    assert!(sensors.borrow().bump_left);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = teleop::SessionServer::new(
        teleop::SessionConfig::default(),
        rig.driver.clone(),
        rig.driver.subscribe_latest(),
    );
    tokio::spawn(server.serve(listener));

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();

    ws.send(Message::Text(
        r#"{"action":"drive","velocity":200,"radius":32768}"#.into(),
    ))
    .await
    .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert!(reply.to_text().unwrap().starts_with("stopped:"));
    assert_eq!(
        rig.writes.lock().unwrap().last().unwrap(),
        &oi::encode_drive(0, oi::RADIUS_STRAIGHT).to_vec()
    );

    ws.send(Message::Text(
        r#"{"action":"drive","velocity":200,"radius":-200}"#.into(),
    ))
    .await
    .unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply.to_text().unwrap(), "ok drive 200 -200");
    assert_eq!(
        rig.writes.lock().unwrap().last().unwrap(),
        &oi::encode_drive(200, -200).to_vec()
    );
}

#[tokio::test]
async fn test_history_restores_across_restart() {
    // A recorded pose beats the plan start pose on the next boot.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    let plan = Arc::new(Plan::from_json_str(SQUARE_ROOM, 150.0).unwrap());
    {
        let mut estimator =
            Estimator::new(OdometryConfig::default(), plan.clone(), &path, false).unwrap();
        estimator
            .reset_to(Pose::new(1234.0, 567.0, 45.0))
            .unwrap();
    }
    let estimator = Estimator::new(OdometryConfig::default(), plan, &path, false).unwrap();
    assert_eq!(estimator.current(), Pose::new(1234.0, 567.0, 45.0));
}

#[tokio::test]
async fn test_fiducial_snap_blends_pose() {
    // Marker 7 with snap_pose (1700, 2000); odometry at (1500, 2000)
    // blends 35% toward the target.
    let plan_doc = r#"{
        "contour": [[0,0],[4000,0],[4000,4000],[0,4000]],
        "start_pose": {"x": 1500, "y": 2000, "theta": 0},
        "aruco_markers": [
            {"id": 7, "x": 2000, "y": 2000, "theta": 180, "size_mm": 150,
             "snap_pose": [1700, 2000]}
        ]
    }"#;
    let rig = scripted_driver();
    let dir = tempfile::tempdir().unwrap();
    let (shared, cmd_tx, _shutdown) = spawn_estimator(plan_doc, &rig, &dir);

    let plan = Arc::new(Plan::from_json_str(plan_doc, 150.0).unwrap());
    let (_plan_tx, plan_rx) = watch::channel(plan);
    let (result_tx, result_rx) = watch::channel(FiducialResult::default());
    let (_shut_tx, shut_rx) = watch::channel(false);
    tokio::spawn(fiducial::run_snap_applier(
        plan_rx,
        result_rx,
        cmd_tx,
        fiducial::SnapApplierConfig {
            enabled: true,
            ..Default::default()
        },
        shut_rx,
    ));

    let observation = MarkerObservation {
        id: 7,
        corners: [
            [291.5, 211.5],
            [348.5, 211.5],
            [348.5, 268.5],
            [291.5, 268.5],
        ],
        center: [320.0, 240.0],
        area_px: 3253.0,
        frame_width: 640,
        frame_height: 480,
        timestamp_ms: now_ms(),
    };
    result_tx.send_replace(FiducialResult {
        enabled: true,
        ok: true,
        reason: None,
        markers: vec![observation],
        frame_width: 640,
        frame_height: 480,
        timestamp_ms: now_ms(),
    });

    wait_for("snap to blend the pose", || {
        (shared.read().unwrap().pose.x_mm - 1570.0).abs() < 1e-6
    })
    .await;
    let snapshot = *shared.read().unwrap();
    assert_relative_eq!(snapshot.pose.y_mm, 2000.0, epsilon = 1e-6);
    assert_relative_eq!(snapshot.pose.theta_deg, 0.0, epsilon = 1e-6);
    assert_eq!(snapshot.source, types::PoseSource::Snap);
}
