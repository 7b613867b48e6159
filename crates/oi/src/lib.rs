//! Serial Open Interface driver for roombad.
//!
//! Owns the robot's serial link exclusively. Commands are encoded here and
//! funnelled through a single I/O thread; the same thread runs the
//! continuous sensor stream decoder and heals the link when it degrades.
//! Consumers receive snapshots through a latest-value slot (`watch`) and a
//! no-drop queue (`mpsc`, for the odometry estimator).

pub mod frame;
mod reader;
mod transport;

pub use transport::{SerialTransport, Transport, TransportFactory};

use reader::{Shared, WireOp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};
use types::{ModeRequest, SensorSnapshot, StreamHealth};

#[derive(Error, Debug)]
pub enum OiError {
    #[error("Serial port unavailable: {0}")]
    PortUnavailable(String),
    #[error("Command write timed out")]
    WriteTimeout,
    #[error("Stream framing errors exceeded the resync limit")]
    FramingExceeded,
    #[error("Decoder inconsistency: {0}")]
    DecoderInconsistent(String),
    #[error("Driver is closed")]
    Closed,
}

/// Open Interface opcodes (iRobot OI specification).
pub mod opcodes {
    pub const START: u8 = 128;
    pub const BAUD: u8 = 129;
    pub const SAFE: u8 = 131;
    pub const FULL: u8 = 132;
    pub const POWER: u8 = 133;
    pub const CLEAN: u8 = 135;
    pub const DRIVE: u8 = 137;
    pub const SENSORS: u8 = 142;
    pub const DOCK: u8 = 143;
    pub const STREAM: u8 = 148;
    pub const QUERY_LIST: u8 = 149;
    pub const PAUSE_RESUME_STREAM: u8 = 150;
}

/// Drive radius special value: no curvature.
pub const RADIUS_STRAIGHT: i32 = 32768;
/// Drive radius special value: spin in place counter-clockwise.
pub const RADIUS_SPIN_CCW: i32 = 1;
/// Drive radius special value: spin in place clockwise.
pub const RADIUS_SPIN_CW: i32 = -1;

/// Encode a drive command: opcode + velocity and radius as signed
/// big-endian words. Velocity clamps to +-500 mm/s; the straight radius
/// encodes as 0x8000 and other radii ride the wire word unchanged.
pub fn encode_drive(velocity_mm_s: i32, radius_mm: i32) -> [u8; 5] {
    let v = velocity_mm_s.clamp(-500, 500) as i16;
    let r: i16 = match radius_mm {
        RADIUS_STRAIGHT => i16::from_be_bytes([0x80, 0x00]),
        RADIUS_SPIN_CCW => 1,
        RADIUS_SPIN_CW => -1,
        // The wire word is signed 16-bit and 0x8000 is reserved for the
        // straight code, so plain radii saturate at +-32767.
        other => other.clamp(-(i16::MAX as i32), i16::MAX as i32) as i16,
    };
    let vb = v.to_be_bytes();
    let rb = r.to_be_bytes();
    [opcodes::DRIVE, vb[0], vb[1], rb[0], rb[1]]
}

/// Decode a drive wire frame back into (velocity, radius); the inverse of
/// `encode_drive` over its output range.
pub fn decode_drive(frame: &[u8; 5]) -> (i32, i32) {
    let v = i16::from_be_bytes([frame[1], frame[2]]) as i32;
    let r_raw = i16::from_be_bytes([frame[3], frame[4]]);
    let r = if r_raw as u16 == 0x8000 {
        RADIUS_STRAIGHT
    } else {
        r_raw as i32
    };
    (v, r)
}

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Serial device path (e.g. "/dev/ttyUSB0")
    pub port: String,
    /// Baud rate (115200 for the 500/700 series)
    pub baud: u32,
    /// How long a queued command may wait for the wire
    pub write_timeout: Duration,
    /// Stream silence threshold, in stream periods
    pub silence_periods: u32,
    /// Consecutive resyncs tolerated before a restart
    pub max_resyncs: u32,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".into(),
            baud: 115_200,
            write_timeout: Duration::from_secs(1),
            silence_periods: 5,
            max_resyncs: 10,
        }
    }
}

/// The Open Interface driver. Cheap to share behind an `Arc`; all methods
/// take `&self`.
pub struct Driver {
    config: DriverConfig,
    factory: TransportFactory,
    shared: Arc<Shared>,
    latest_rx: watch::Receiver<SensorSnapshot>,
    frames_rx: Mutex<Option<mpsc::UnboundedReceiver<SensorSnapshot>>>,
    ctrl: Mutex<Option<std_mpsc::Sender<WireOp>>>,
    last_drive: Mutex<Option<(i32, i32)>>,
    closed: AtomicBool,
}

impl Driver {
    /// Driver over a real serial port.
    pub fn new(config: DriverConfig) -> Self {
        let factory = SerialTransport::factory(config.port.clone(), config.baud);
        Self::with_factory(config, factory)
    }

    /// Driver over an arbitrary transport factory (tests, simulators).
    pub fn with_factory(config: DriverConfig, factory: TransportFactory) -> Self {
        let (latest_tx, latest_rx) = watch::channel(SensorSnapshot::default());
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            config,
            factory,
            shared: Arc::new(Shared::new(latest_tx, frames_tx)),
            latest_rx,
            frames_rx: Mutex::new(Some(frames_rx)),
            ctrl: Mutex::new(None),
            last_drive: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the port and start the I/O thread. Idempotent.
    pub fn connect(&self) -> Result<(), OiError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(OiError::Closed);
        }
        let mut ctrl = self.ctrl.lock().unwrap_or_else(|e| e.into_inner());
        if ctrl.is_some() {
            return Ok(());
        }
        let transport = (self.factory)()?;
        let (tx, rx) = std_mpsc::channel();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let factory = self.factory.clone();
        std::thread::Builder::new()
            .name("oi-io".into())
            .spawn(move || reader::run(transport, factory, rx, shared, config))
            .map_err(|e| OiError::PortUnavailable(format!("spawn failed: {e}")))?;
        *ctrl = Some(tx);
        info!(port = %self.config.port, baud = self.config.baud, "OI driver connected");
        Ok(())
    }

    fn ctrl_sender(&self) -> Result<std_mpsc::Sender<WireOp>, OiError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(OiError::Closed);
        }
        self.ctrl
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| OiError::PortUnavailable("driver not connected".into()))
    }

    async fn write_bytes(&self, bytes: Vec<u8>) -> Result<(), OiError> {
        let sender = self.ctrl_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(WireOp::Write {
                bytes,
                reply: reply_tx,
            })
            .map_err(|_| OiError::Closed)?;
        match tokio::time::timeout(self.config.write_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OiError::Closed),
            Err(_) => {
                self.shared.record_error("command write timed out");
                Err(OiError::WriteTimeout)
            }
        }
    }

    /// Send the OI start opcode (enters Passive mode).
    pub async fn start(&self) -> Result<(), OiError> {
        self.clear_drive_cache();
        self.write_bytes(vec![opcodes::START]).await
    }

    /// Switch between Safe and Full mode.
    pub async fn mode(&self, mode: ModeRequest) -> Result<(), OiError> {
        self.clear_drive_cache();
        let opcode = match mode {
            ModeRequest::Safe => opcodes::SAFE,
            ModeRequest::Full => opcodes::FULL,
        };
        self.write_bytes(vec![opcode]).await
    }

    /// Drive at `velocity_mm_s` along `radius_mm`. Consecutive identical
    /// commands are coalesced to one wire message.
    pub async fn drive(&self, velocity_mm_s: i32, radius_mm: i32) -> Result<(), OiError> {
        let frame = encode_drive(velocity_mm_s, radius_mm);
        let effective = decode_drive(&frame);
        {
            let mut last = self.last_drive.lock().unwrap_or_else(|e| e.into_inner());
            if *last == Some(effective) {
                debug!(v = effective.0, r = effective.1, "Drive coalesced");
                return Ok(());
            }
            *last = Some(effective);
        }
        let result = self.write_bytes(frame.to_vec()).await;
        if result.is_err() {
            // Unknown wire state; resend next time.
            self.clear_drive_cache();
        }
        result
    }

    /// Stop the wheels.
    pub async fn stop(&self) -> Result<(), OiError> {
        self.drive(0, RADIUS_STRAIGHT).await
    }

    pub async fn clean(&self) -> Result<(), OiError> {
        self.clear_drive_cache();
        self.write_bytes(vec![opcodes::CLEAN]).await
    }

    pub async fn dock(&self) -> Result<(), OiError> {
        self.clear_drive_cache();
        self.write_bytes(vec![opcodes::DOCK]).await
    }

    pub async fn power_off(&self) -> Result<(), OiError> {
        self.clear_drive_cache();
        self.write_bytes(vec![opcodes::POWER]).await
    }

    fn clear_drive_cache(&self) {
        *self.last_drive.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// One-shot sensor group query, decoded onto the last known snapshot.
    pub async fn request_sensor_group(&self, group: u8) -> Result<SensorSnapshot, OiError> {
        let sender = self.ctrl_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(WireOp::Query {
                group,
                reply: reply_tx,
            })
            .map_err(|_| OiError::Closed)?;
        match tokio::time::timeout(self.config.write_timeout * 3, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OiError::Closed),
            Err(_) => Err(OiError::WriteTimeout),
        }
    }

    /// Start (or retune) the background sensor stream. Idempotent: the I/O
    /// thread ignores requests matching the active stream.
    pub fn ensure_sensor_stream(&self, group: u8, hz: f64) -> Result<(), OiError> {
        let period = Duration::from_secs_f64(1.0 / hz.max(0.1));
        self.ctrl_sender()?
            .send(WireOp::StartStream { group, period })
            .map_err(|_| OiError::Closed)
    }

    /// Pause the background sensor stream.
    pub fn stop_sensor_stream(&self) -> Result<(), OiError> {
        self.ctrl_sender()?
            .send(WireOp::StopStream)
            .map_err(|_| OiError::Closed)
    }

    /// Latest-value slot of decoded snapshots.
    pub fn subscribe_latest(&self) -> watch::Receiver<SensorSnapshot> {
        self.latest_rx.clone()
    }

    /// The no-drop snapshot queue for the odometry estimator. Yields the
    /// receiver once.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<SensorSnapshot>> {
        self.frames_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Called by the frame consumer when it falls more than 200 ms behind;
    /// forces a stream restart.
    pub fn flag_consumer_lag(&self) {
        self.shared.lag_flagged.store(true, Ordering::Relaxed);
    }

    /// Current stream health.
    pub fn health(&self) -> StreamHealth {
        let last = self.shared.last_frame_ms.load(Ordering::Relaxed);
        let now = self.shared.epoch.elapsed().as_millis() as u64;
        StreamHealth {
            alive: self.shared.alive.load(Ordering::Relaxed),
            last_update_age_ms: if last == 0 { now } else { now.saturating_sub(last) },
            restart_count: self.shared.restart_count.load(Ordering::Relaxed),
            last_error: self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }

    /// Orderly shutdown: stop the wheels, stop the thread, close the port.
    /// The driver is terminal afterwards; every call reports `Closed`.
    pub async fn shutdown(&self) {
        self.clear_drive_cache();
        let _ = self.write_bytes(encode_drive(0, RADIUS_STRAIGHT).to_vec()).await;
        if let Ok(sender) = self.ctrl_sender() {
            let _ = sender.send(WireOp::Shutdown);
        }
        self.closed.store(true, Ordering::Relaxed);
        info!("OI driver closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::build_stream_frame;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Transport fed from a shared script; records every write.
    struct ScriptedTransport {
        chunks: Arc<StdMutex<VecDeque<Vec<u8>>>>,
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl Transport for ScriptedTransport {
        fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let chunk = self
                .chunks
                .lock()
                .unwrap()
                .pop_front();
            match chunk {
                Some(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                None => {
                    // Simulate the serial read timeout.
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
        driver: Driver,
        chunks: Arc<StdMutex<VecDeque<Vec<u8>>>>,
        writes: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    fn rig(config: DriverConfig) -> Rig {
        let chunks: Arc<StdMutex<VecDeque<Vec<u8>>>> = Arc::default();
        let writes: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
        let (c, w) = (chunks.clone(), writes.clone());
        let factory: TransportFactory = Arc::new(move || {
            Ok(Box::new(ScriptedTransport {
                chunks: c.clone(),
                writes: w.clone(),
            }) as Box<dyn Transport>)
        });
        Rig {
            driver: Driver::with_factory(config, factory),
            chunks,
            writes,
        }
    }

    #[test]
    fn test_encode_drive_clamps_velocity() {
        let (v, r) = decode_drive(&encode_drive(900, 200));
        assert_eq!(v, 500);
        assert_eq!(r, 200);
        let (v, _) = decode_drive(&encode_drive(-900, 200));
        assert_eq!(v, -500);
    }

    #[test]
    fn test_encode_drive_preserves_special_radii() {
        for special in [RADIUS_STRAIGHT, RADIUS_SPIN_CCW, RADIUS_SPIN_CW] {
            let (_, r) = decode_drive(&encode_drive(100, special));
            assert_eq!(r, special);
        }
    }

    #[test]
    fn test_encode_drive_wire_bytes() {
        // -200 mm/s straight: 137, 0xFF38, 0x8000
        let frame = encode_drive(-200, RADIUS_STRAIGHT);
        assert_eq!(frame, [137, 0xFF, 0x38, 0x80, 0x00]);
    }

    #[test]
    fn test_encode_drive_plain_radius_roundtrip() {
        for radius in [200, -200, 2000, -2000, 5000, -5000, 32767] {
            let (_, r) = decode_drive(&encode_drive(100, radius));
            assert_eq!(r, radius);
        }
    }

    #[test]
    fn test_encode_drive_radius_bounded_by_wire_word() {
        // -32768 would collide with the straight code
        let (_, r) = decode_drive(&encode_drive(100, 40_000));
        assert_eq!(r, 32_767);
        let (_, r) = decode_drive(&encode_drive(100, -40_000));
        assert_eq!(r, -32_767);
    }

    #[tokio::test]
    async fn test_commands_require_connect() {
        let r = rig(DriverConfig::default());
        assert!(matches!(
            r.driver.start().await,
            Err(OiError::PortUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_mode_write_opcodes() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        r.driver.start().await.unwrap();
        r.driver.mode(ModeRequest::Safe).await.unwrap();
        r.driver.mode(ModeRequest::Full).await.unwrap();
        let writes = r.writes.lock().unwrap();
        assert_eq!(*writes, vec![vec![128], vec![131], vec![132]]);
    }

    #[tokio::test]
    async fn test_drive_coalescing() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        r.driver.drive(200, -200).await.unwrap();
        r.driver.drive(200, -200).await.unwrap();
        r.driver.drive(250, -200).await.unwrap();
        let writes = r.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_after_stop_sends_once() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        r.driver.stop().await.unwrap();
        r.driver.stop().await.unwrap();
        let writes = r.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], encode_drive(0, RADIUS_STRAIGHT).to_vec());
    }

    #[tokio::test]
    async fn test_clamped_duplicates_coalesce() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        // Both clamp to 500 mm/s: the second is a duplicate on the wire.
        r.driver.drive(600, 100).await.unwrap();
        r.driver.drive(900, 100).await.unwrap();
        let writes = r.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_publishes_snapshots() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        r.chunks
            .lock()
            .unwrap()
            .push_back(build_stream_frame(&[(7, &[0x01]), (22, &16000u16.to_be_bytes())]));
        r.driver.ensure_sensor_stream(100, 20.0).unwrap();

        let mut latest = r.driver.subscribe_latest();
        tokio::time::timeout(Duration::from_secs(2), latest.changed())
            .await
            .expect("snapshot published")
            .unwrap();
        let snap = latest.borrow().clone();
        assert!(snap.bump_right);
        assert_eq!(snap.voltage_mv, 16000);
        assert!(snap.link_alive);

        // Stream start went to the wire with the group id.
        assert!(r
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|w| w == &[opcodes::STREAM, 1, 100]));
    }

    #[tokio::test]
    async fn test_frames_queue_receives_every_frame() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        {
            let mut chunks = r.chunks.lock().unwrap();
            for i in 0..3u16 {
                chunks.push_back(build_stream_frame(&[(43, &i.to_be_bytes())]));
            }
        }
        let mut frames = r.driver.take_frames().unwrap();
        r.driver.ensure_sensor_stream(100, 20.0).unwrap();

        for expected in 0..3u16 {
            let snap = tokio::time::timeout(Duration::from_secs(2), frames.recv())
                .await
                .expect("frame")
                .expect("channel open");
            assert_eq!(snap.encoder_left, expected);
        }
        assert!(r.driver.take_frames().is_none());
    }

    #[tokio::test]
    async fn test_stream_recovery_after_silence() {
        let config = DriverConfig {
            silence_periods: 2,
            ..DriverConfig::default()
        };
        let r = rig(config);
        r.driver.connect().unwrap();
        // One frame, then silence; 2 periods at 100 Hz trips quickly. The
        // shared chunk queue feeds the reopened transport too.
        r.chunks
            .lock()
            .unwrap()
            .push_back(build_stream_frame(&[(8, &[1])]));
        r.driver.ensure_sensor_stream(100, 100.0).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if r.driver.health().restart_count >= 1 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "driver never restarted: {:?}",
                r.driver.health()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let health = r.driver.health();
        assert!(health.last_error.is_some());
        // Recovery re-issued start + safe + stream.
        let writes = r.writes.lock().unwrap();
        assert!(writes.iter().any(|w| w == &[opcodes::START]));
        assert!(writes.iter().any(|w| w == &[opcodes::SAFE]));
        assert!(
            writes
                .iter()
                .filter(|w| *w == &vec![opcodes::STREAM, 1, 100])
                .count()
                >= 2
        );

        // Frames resume after the heal.
        drop(writes);
        r.chunks
            .lock()
            .unwrap()
            .push_back(build_stream_frame(&[(8, &[1])]));
        let mut latest = r.driver.subscribe_latest();
        tokio::time::timeout(Duration::from_secs(2), latest.changed())
            .await
            .expect("snapshots resumed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        r.driver.shutdown().await;
        assert!(matches!(r.driver.stop().await, Err(OiError::Closed)));
        assert!(matches!(r.driver.connect(), Err(OiError::Closed)));
        // The stop command reached the wire before the close.
        let writes = r.writes.lock().unwrap();
        assert_eq!(writes[0], encode_drive(0, RADIUS_STRAIGHT).to_vec());
    }

    #[tokio::test]
    async fn test_request_sensor_group_roundtrip() {
        let r = rig(DriverConfig::default());
        r.driver.connect().unwrap();
        // Group 0 reply: 26 bytes, bumps first.
        let mut payload = vec![0u8; frame::group_len(0).unwrap()];
        payload[0] = 0x02; // bump left
        r.chunks.lock().unwrap().push_back(payload);

        let snap = r.driver.request_sensor_group(0).await.unwrap();
        assert!(snap.bump_left);
        assert!(!snap.bump_right);
        assert!(r
            .writes
            .lock()
            .unwrap()
            .iter()
            .any(|w| w == &[opcodes::SENSORS, 0]));
    }
}
