//! The driver's I/O thread.
//!
//! Exactly one thread owns the serial transport. It services queued command
//! writes, runs the continuous sensor stream decoder, and heals the link
//! when frames stop arriving or framing degrades: close, reopen with
//! doubling back-off, re-issue start/safe/stream.

use crate::frame::{self, DecodeEvent, StreamDecoder};
use crate::transport::{Transport, TransportFactory};
use crate::{opcodes, DriverConfig, OiError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc as tokio_mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use types::SensorSnapshot;

const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(1);
const QUERY_DEADLINE: Duration = Duration::from_secs(1);

/// Operations accepted by the I/O thread.
pub(crate) enum WireOp {
    /// Write raw command bytes.
    Write {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<(), OiError>>,
    },
    /// One-shot sensor group query (opcode 142).
    Query {
        group: u8,
        reply: oneshot::Sender<Result<SensorSnapshot, OiError>>,
    },
    /// Start (or retune) the continuous sensor stream.
    StartStream { group: u8, period: Duration },
    /// Pause the stream.
    StopStream,
    /// Stop the thread; the port closes on drop.
    Shutdown,
}

/// State shared between the driver handle and the I/O thread.
pub(crate) struct Shared {
    pub latest: watch::Sender<SensorSnapshot>,
    pub frames: tokio_mpsc::UnboundedSender<SensorSnapshot>,
    pub alive: AtomicBool,
    pub restart_count: AtomicU32,
    /// Milliseconds since `epoch` of the last decoded frame, 0 = never.
    pub last_frame_ms: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    /// Set by the frame consumer when it falls behind; forces a restart.
    pub lag_flagged: AtomicBool,
    pub epoch: Instant,
}

impl Shared {
    pub fn new(
        latest: watch::Sender<SensorSnapshot>,
        frames: tokio_mpsc::UnboundedSender<SensorSnapshot>,
    ) -> Self {
        Self {
            latest,
            frames,
            alive: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
            last_frame_ms: AtomicU64::new(0),
            last_error: Mutex::new(None),
            lag_flagged: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    pub fn record_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "OI link error");
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    fn mono_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn wall_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, PartialEq)]
struct StreamState {
    group: u8,
    period: Duration,
}

pub(crate) fn run(
    mut transport: Box<dyn Transport>,
    factory: TransportFactory,
    ctrl: Receiver<WireOp>,
    shared: std::sync::Arc<Shared>,
    config: DriverConfig,
) {
    let mut decoder = StreamDecoder::new(config.max_resyncs);
    let mut stream: Option<StreamState> = None;
    let mut read_buf = [0u8; 512];

    info!("OI I/O thread started");

    'outer: loop {
        // Service the command queue. While streaming we must not block
        // here; idle we can.
        loop {
            let op = if stream.is_some() {
                match ctrl.try_recv() {
                    Ok(op) => Some(op),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            } else {
                match ctrl.recv_timeout(Duration::from_millis(50)) {
                    Ok(op) => Some(op),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break 'outer,
                }
            };
            let Some(op) = op else { break };
            match op {
                WireOp::Write { bytes, reply } => {
                    let result = transport
                        .write_all(&bytes)
                        .map_err(|e| OiError::PortUnavailable(e.to_string()));
                    if let Err(ref e) = result {
                        shared.record_error(format!("write failed: {e}"));
                    }
                    let _ = reply.send(result);
                }
                WireOp::Query { group, reply } => {
                    let result = run_query(transport.as_mut(), group, stream, &mut decoder);
                    let _ = reply.send(result);
                }
                WireOp::StartStream { group, period } => {
                    let wanted = StreamState { group, period };
                    if stream != Some(wanted) {
                        if let Err(e) =
                            transport.write_all(&[opcodes::STREAM, 1, group])
                        {
                            shared.record_error(format!("stream start failed: {e}"));
                        } else {
                            info!(group, period_ms = period.as_millis() as u64, "Sensor stream started");
                        }
                        decoder.reset_framing();
                        stream = Some(wanted);
                        // Give the first frame a fresh deadline.
                        shared.last_frame_ms.store(shared.mono_ms(), Ordering::Relaxed);
                    }
                }
                WireOp::StopStream => {
                    if stream.take().is_some() {
                        let _ = transport.write_all(&[opcodes::PAUSE_RESUME_STREAM, 0]);
                        shared.alive.store(false, Ordering::Relaxed);
                        info!("Sensor stream stopped");
                    }
                }
                WireOp::Shutdown => break 'outer,
            }
        }

        let Some(active) = stream else { continue };

        // Pump the stream.
        let mut failure: Option<String> = None;
        match transport.read_available(&mut read_buf) {
            Ok(0) => {}
            Ok(n) => {
                let now = wall_ms();
                for event in decoder.feed(&read_buf[..n], now) {
                    match event {
                        DecodeEvent::Frame(snap) => {
                            shared
                                .last_frame_ms
                                .store(shared.mono_ms(), Ordering::Relaxed);
                            shared.alive.store(true, Ordering::Relaxed);
                            shared.latest.send_replace(snap.clone());
                            let _ = shared.frames.send(snap);
                        }
                        DecodeEvent::Inconsistent(msg) => {
                            debug!(%msg, "Dropped inconsistent frame");
                            shared.record_error(msg);
                        }
                        DecodeEvent::FramingExceeded => {
                            failure = Some(format!(
                                "{} (total resyncs {})",
                                OiError::FramingExceeded,
                                decoder.resync_total
                            ));
                        }
                    }
                }
            }
            Err(e) => failure = Some(format!("read failed: {e}")),
        }

        // Silence and consumer-lag watchdogs.
        let age = shared
            .mono_ms()
            .saturating_sub(shared.last_frame_ms.load(Ordering::Relaxed));
        let period_ms = active.period.as_millis() as u64;
        if failure.is_none() && age > period_ms * config.silence_periods as u64 {
            failure = Some(format!("no valid frames for {age} ms"));
        }
        if failure.is_none() && shared.lag_flagged.swap(false, Ordering::Relaxed) {
            failure = Some("sensor consumer lagging over 200 ms".to_string());
        }
        shared
            .alive
            .store(age <= period_ms.saturating_mul(3), Ordering::Relaxed);

        if let Some(reason) = failure {
            match heal(&factory, &ctrl, &shared, active, &mut decoder, reason) {
                Some(t) => transport = t,
                None => break 'outer,
            }
        }
    }

    info!("OI I/O thread stopped");
}

/// Reopen the port with doubling back-off and restore start/safe/stream.
/// Returns `None` when a shutdown arrived while healing.
fn heal(
    factory: &TransportFactory,
    ctrl: &Receiver<WireOp>,
    shared: &Shared,
    stream: StreamState,
    decoder: &mut StreamDecoder,
    reason: String,
) -> Option<Box<dyn Transport>> {
    shared.record_error(reason);
    shared.alive.store(false, Ordering::Relaxed);

    let mut backoff = BACKOFF_INITIAL;
    loop {
        // Fail pending commands instead of stalling their callers, and
        // honour shutdown immediately.
        loop {
            match ctrl.try_recv() {
                Ok(WireOp::Write { reply, .. }) => {
                    let _ = reply.send(Err(OiError::PortUnavailable(
                        "link recovery in progress".into(),
                    )));
                }
                Ok(WireOp::Query { reply, .. }) => {
                    let _ = reply.send(Err(OiError::PortUnavailable(
                        "link recovery in progress".into(),
                    )));
                }
                Ok(WireOp::StartStream { .. }) | Ok(WireOp::StopStream) => {}
                Ok(WireOp::Shutdown) => return None,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return None,
            }
        }

        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(BACKOFF_MAX);

        match factory() {
            Ok(mut transport) => {
                let resume = transport
                    .write_all(&[opcodes::START])
                    .and_then(|_| transport.write_all(&[opcodes::SAFE]))
                    .and_then(|_| transport.write_all(&[opcodes::STREAM, 1, stream.group]));
                match resume {
                    Ok(()) => {
                        decoder.reset_framing();
                        shared
                            .last_frame_ms
                            .store(shared.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
                        let restarts =
                            shared.restart_count.fetch_add(1, Ordering::Relaxed) + 1;
                        info!(restarts, "OI link recovered");
                        return Some(transport);
                    }
                    Err(e) => shared.record_error(format!("restart handshake failed: {e}")),
                }
            }
            Err(e) => shared.record_error(format!("reopen failed: {e}")),
        }
    }
}

/// One-shot group query. Pauses the stream around the exchange so reply
/// bytes are not interleaved with stream frames.
fn run_query(
    transport: &mut dyn Transport,
    group: u8,
    stream: Option<StreamState>,
    decoder: &mut StreamDecoder,
) -> Result<SensorSnapshot, OiError> {
    let expected = frame::group_len(group)
        .ok_or_else(|| OiError::DecoderInconsistent(format!("unknown sensor group {group}")))?;

    let io_err = |e: std::io::Error| OiError::PortUnavailable(e.to_string());

    if stream.is_some() {
        transport
            .write_all(&[opcodes::PAUSE_RESUME_STREAM, 0])
            .map_err(io_err)?;
        drain(transport);
    }

    transport
        .write_all(&[opcodes::SENSORS, group])
        .map_err(io_err)?;

    let mut data = Vec::with_capacity(expected);
    let mut buf = [0u8; 128];
    let deadline = Instant::now() + QUERY_DEADLINE;
    while data.len() < expected {
        if Instant::now() >= deadline {
            return Err(OiError::WriteTimeout);
        }
        let n = transport.read_available(&mut buf).map_err(io_err)?;
        data.extend_from_slice(&buf[..n]);
    }
    data.truncate(expected);

    let mut snap = decoder.snapshot().clone();
    frame::decode_group(group, &data, &mut snap).map_err(OiError::DecoderInconsistent)?;
    snap.timestamp_ms = wall_ms();
    snap.link_alive = true;

    if stream.is_some() {
        transport
            .write_all(&[opcodes::PAUSE_RESUME_STREAM, 1])
            .map_err(io_err)?;
        decoder.reset_framing();
    }

    Ok(snap)
}

/// Discard buffered bytes until the link goes quiet for one read slice.
fn drain(transport: &mut dyn Transport) {
    let mut buf = [0u8; 256];
    while let Ok(n) = transport.read_available(&mut buf) {
        if n == 0 {
            break;
        }
    }
}
