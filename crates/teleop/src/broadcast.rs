//! Telemetry broadcaster.
//!
//! At a fixed interval, assembles one snapshot of robot + odometry +
//! fiducial state and fans it out to every subscriber. Reads take locks in
//! a fixed order (odometry, then sensors, then fiducial). Subscribers that
//! fall behind the bounded queue are dropped.

use crate::TeleopError;
use futures_util::{SinkExt, StreamExt};
use odometry::SharedOdometry;
use oi::Driver;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use types::{FiducialResult, Pose, PoseSource, SensorSnapshot, StepDelta, StreamHealth};

/// Queue depth per subscriber before it is dropped as too slow.
const SUBSCRIBER_QUEUE: usize = 32;

/// One outbound telemetry message. Fields are additive across versions.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub timestamp_ms: u64,
    pub sensors: SensorSnapshot,
    pub battery_percent: f64,
    pub sensor_stream: StreamHealth,
    pub pose: Pose,
    pub step: StepDelta,
    pub pose_source: PoseSource,
    pub fiducial: FiducialResult,
    pub fiducial_stale: bool,
}

/// Broadcaster configuration.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub port: u16,
    pub interval: Duration,
    /// Fiducial results older than this are flagged stale
    pub fiducial_stale_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            port: 4811,
            interval: Duration::from_millis(100),
            fiducial_stale_ms: 1000,
        }
    }
}

/// Periodic snapshot assembler + fan-out.
pub struct Broadcaster {
    config: BroadcastConfig,
    odometry: SharedOdometry,
    sensors: watch::Receiver<SensorSnapshot>,
    driver: Arc<Driver>,
    fiducial: watch::Receiver<FiducialResult>,
    tx: broadcast::Sender<Arc<Telemetry>>,
}

impl Broadcaster {
    pub fn new(
        config: BroadcastConfig,
        odometry: SharedOdometry,
        sensors: watch::Receiver<SensorSnapshot>,
        driver: Arc<Driver>,
        fiducial: watch::Receiver<FiducialResult>,
    ) -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_QUEUE);
        Self {
            config,
            odometry,
            sensors,
            driver,
            fiducial,
            tx,
        }
    }

    /// Subscribe to the telemetry stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Telemetry>> {
        self.tx.subscribe()
    }

    /// Assemble one snapshot. Lock order: odometry, sensors, fiducial.
    pub fn assemble(&self) -> Telemetry {
        let odom = *self.odometry.read().unwrap_or_else(|e| e.into_inner());
        let sensors = self.sensors.borrow().clone();
        let fiducial = self.fiducial.borrow().clone();

        let now = now_ms();
        let battery_percent = sensors.battery_percent();
        let fiducial_stale = fiducial.timestamp_ms == 0
            || now.saturating_sub(fiducial.timestamp_ms) > self.config.fiducial_stale_ms;
        Telemetry {
            timestamp_ms: now,
            sensors,
            battery_percent,
            sensor_stream: self.driver.health(),
            pose: odom.pose,
            step: odom.step,
            pose_source: odom.source,
            fiducial,
            fiducial_stale,
        }
    }

    /// Run the periodic assembly loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "Telemetry broadcaster started"
        );
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
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
            // No receivers is fine; send only fails then.
            let _ = self.tx.send(Arc::new(self.assemble()));
        }
        info!("Telemetry broadcaster stopped");
    }
}

/// One-way WebSocket endpoint streaming telemetry JSON.
pub struct TelemetryServer {
    port: u16,
    tx: broadcast::Sender<Arc<Telemetry>>,
}

impl TelemetryServer {
    pub fn new(port: u16, broadcaster: &Broadcaster) -> Self {
        Self {
            port,
            tx: broadcaster.tx.clone(),
        }
    }

    pub async fn run(self) -> Result<(), TeleopError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr, "Telemetry server listening");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), TeleopError> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "Telemetry subscriber connected");
                    let rx = self.tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = stream_telemetry(stream, rx).await {
                            debug!(?e, "Telemetry subscriber error");
                        }
                        info!(%addr, "Telemetry subscriber disconnected");
                    });
                }
                Err(e) => {
                    error!(?e, "Failed to accept telemetry subscriber");
                }
            }
        }
    }
}

async fn stream_telemetry(
    stream: TcpStream,
    mut rx: broadcast::Receiver<Arc<Telemetry>>,
) -> Result<(), TeleopError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TeleopError::Network(std::io::Error::other(e)))?;
    let (mut sink, mut source) = ws_stream.split();

    loop {
        tokio::select! {
            snapshot = rx.recv() => {
                let snapshot = match snapshot {
                    Ok(s) => s,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Telemetry subscriber too slow, dropping");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let json = serde_json::to_string(&*snapshot)
                    .map_err(|e| TeleopError::Serialization(e.to_string()))?;
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            // Consume (and ignore) anything the subscriber sends so pings
            // and closes are processed.
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
