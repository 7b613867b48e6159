//! WebSocket control session.
//!
//! Operators send JSON objects with an `action` field; every inbound
//! message gets an ack or error string back. Bad payloads reject the one
//! command and keep the channel open; a closed driver ends the session
//! with a reason.

use crate::safety::{arbitrate_drive, Arbitrated};
use crate::TeleopError;
use futures_util::{SinkExt, StreamExt};
use oi::{Driver, OiError};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use types::{ModeRequest, OperatorAction, SensorSnapshot};

/// Control session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port: u16,
    /// Sensor group requested by `init`
    pub stream_group: u8,
    /// Stream rate requested by `init`
    pub stream_hz: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: 4810,
            stream_group: 100,
            stream_hz: 20.0,
        }
    }
}

/// WebSocket control server.
pub struct SessionServer {
    config: SessionConfig,
    driver: Arc<Driver>,
    sensors: watch::Receiver<SensorSnapshot>,
}

impl SessionServer {
    pub fn new(
        config: SessionConfig,
        driver: Arc<Driver>,
        sensors: watch::Receiver<SensorSnapshot>,
    ) -> Self {
        Self {
            config,
            driver,
            sensors,
        }
    }

    /// Bind the configured port and accept operators forever.
    pub async fn run(self) -> Result<(), TeleopError> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr, "Control session server listening");
        self.serve(listener).await
    }

    /// Accept operators on an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<(), TeleopError> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "Operator connected");
                    let driver = self.driver.clone();
                    let sensors = self.sensors.clone();
                    let config = self.config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, driver, sensors, config).await {
                            warn!(?e, "Operator connection error");
                        }
                        info!(%addr, "Operator disconnected");
                    });
                }
                Err(e) => {
                    error!(?e, "Failed to accept operator connection");
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    driver: Arc<Driver>,
    sensors: watch::Receiver<SensorSnapshot>,
    config: SessionConfig,
) -> Result<(), TeleopError> {
    let _ = stream.set_nodelay(true);
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| TeleopError::Network(std::io::Error::other(e)))?;
    let (mut sink, mut source) = ws_stream.split();

    while let Some(message) = source.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(_) => continue,
            Err(e) => {
                warn!(?e, "Operator receive error");
                break;
            }
        };

        let reply = match serde_json::from_str::<OperatorAction>(&text) {
            Ok(action) => {
                debug!(?action, "Operator command");
                execute_action(action, &driver, &sensors, &config).await
            }
            Err(e) => Reply::Error(format!("invalid command: {e}")),
        };

        let (text, fatal) = match reply {
            Reply::Ok(text) => (text, false),
            Reply::Error(text) => (format!("error: {text}"), false),
            Reply::Fatal(text) => (format!("error: {text}"), true),
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
        if fatal {
            let _ = sink.send(Message::Close(None)).await;
            break;
        }
    }
    Ok(())
}

enum Reply {
    Ok(String),
    /// Command rejected; channel stays open.
    Error(String),
    /// Session-level failure; channel closes with the reason.
    Fatal(String),
}

/// Execute one operator action against the driver.
async fn execute_action(
    action: OperatorAction,
    driver: &Driver,
    sensors: &watch::Receiver<SensorSnapshot>,
    config: &SessionConfig,
) -> Reply {
    let result = match action {
        OperatorAction::Ping => return Reply::Ok("pong".into()),
        OperatorAction::Init => init_robot(driver, config).await.map(|()| "ok init".into()),
        OperatorAction::Mode { value } => driver.mode(value).await.map(|()| {
            format!(
                "ok mode {}",
                match value {
                    ModeRequest::Safe => "safe",
                    ModeRequest::Full => "full",
                }
            )
        }),
        OperatorAction::Drive { velocity, radius } => {
            let arbitrated = arbitrate_drive(velocity, radius, &sensors.borrow());
            match arbitrated {
                Arbitrated::Allow => driver
                    .drive(velocity, radius)
                    .await
                    .map(|()| format!("ok drive {velocity} {radius}")),
                Arbitrated::Stop(reason) => {
                    warn!(velocity, radius, reason, "Drive rewritten to stop");
                    driver.stop().await.map(|()| format!("stopped: {reason}"))
                }
            }
        }
        OperatorAction::Stop => driver.stop().await.map(|()| "ok stop".into()),
        OperatorAction::Clean => driver.clean().await.map(|()| "ok clean".into()),
        OperatorAction::Dock => driver.dock().await.map(|()| "ok dock".into()),
    };

    match result {
        Ok(text) => Reply::Ok(text),
        Err(OiError::Closed) => Reply::Fatal("driver closed".into()),
        Err(e) => Reply::Error(e.to_string()),
    }
}

/// `init`: connect + start + safe + ensure the sensor stream.
async fn init_robot(driver: &Driver, config: &SessionConfig) -> Result<(), OiError> {
    driver.connect()?;
    driver.start().await?;
    driver.mode(ModeRequest::Safe).await?;
    driver.ensure_sensor_stream(config.stream_group, config.stream_hz)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oi::{encode_drive, opcodes, DriverConfig, Transport, TransportFactory, RADIUS_STRAIGHT};
    use std::sync::Mutex;

    struct RecordingTransport {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Transport for RecordingTransport {
        fn read_available(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::thread::sleep(std::time::Duration::from_millis(2));
            Ok(0)
        }

        fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
    }

    fn driver_rig() -> (Arc<Driver>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let w = writes.clone();
        let factory: TransportFactory = Arc::new(move || {
            Ok(Box::new(RecordingTransport { writes: w.clone() }) as Box<dyn Transport>)
        });
        let driver = Arc::new(Driver::with_factory(DriverConfig::default(), factory));
        driver.connect().unwrap();
        (driver, writes)
    }

    fn sensor_channel(snap: SensorSnapshot) -> watch::Receiver<SensorSnapshot> {
        // The sender may drop; `borrow` keeps serving the last value.
        let (_tx, rx) = watch::channel(snap);
        rx
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (driver, _) = driver_rig();
        let sensors = sensor_channel(SensorSnapshot::default());
        let reply = execute_action(
            OperatorAction::Ping,
            &driver,
            &sensors,
            &SessionConfig::default(),
        )
        .await;
        assert!(matches!(reply, Reply::Ok(text) if text == "pong"));
    }

    #[tokio::test]
    async fn test_bumper_guard_rewrites_forward_drive() {
        let (driver, writes) = driver_rig();
        let sensors = sensor_channel(SensorSnapshot {
            bump_left: true,
            ..Default::default()
        });
        let config = SessionConfig::default();

        // Forward straight: rewritten to stop
        let reply = execute_action(
            OperatorAction::Drive {
                velocity: 200,
                radius: RADIUS_STRAIGHT,
            },
            &driver,
            &sensors,
            &config,
        )
        .await;
        assert!(matches!(reply, Reply::Ok(text) if text.starts_with("stopped:")));
        assert_eq!(
            writes.lock().unwrap().last().unwrap(),
            &encode_drive(0, RADIUS_STRAIGHT).to_vec()
        );

        // Right turn passes through
        let reply = execute_action(
            OperatorAction::Drive {
                velocity: 200,
                radius: -200,
            },
            &driver,
            &sensors,
            &config,
        )
        .await;
        assert!(matches!(reply, Reply::Ok(text) if text == "ok drive 200 -200"));
        assert_eq!(
            writes.lock().unwrap().last().unwrap(),
            &encode_drive(200, -200).to_vec()
        );
    }

    #[tokio::test]
    async fn test_init_sequences_driver_setup() {
        let (driver, writes) = driver_rig();
        let sensors = sensor_channel(SensorSnapshot::default());
        let reply = execute_action(
            OperatorAction::Init,
            &driver,
            &sensors,
            &SessionConfig::default(),
        )
        .await;
        assert!(matches!(reply, Reply::Ok(text) if text == "ok init"));

        // Stream start is issued by the I/O thread; wait for it.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            {
                let writes = writes.lock().unwrap();
                if writes.iter().any(|w| w == &[opcodes::STREAM, 1, 100]) {
                    assert!(writes.iter().any(|w| w == &[opcodes::START]));
                    assert!(writes.iter().any(|w| w == &[opcodes::SAFE]));
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "stream never started");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_closed_driver_is_fatal() {
        let (driver, _) = driver_rig();
        driver.shutdown().await;
        let sensors = sensor_channel(SensorSnapshot::default());
        let reply = execute_action(
            OperatorAction::Stop,
            &driver,
            &sensors,
            &SessionConfig::default(),
        )
        .await;
        assert!(matches!(reply, Reply::Fatal(_)));
    }

    #[tokio::test]
    async fn test_session_over_websocket() {
        let (driver, _) = driver_rig();
        let sensors = sensor_channel(SensorSnapshot::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SessionServer::new(SessionConfig::default(), driver, sensors);
        tokio::spawn(server.serve(listener));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        ws.send(Message::Text(r#"{"action":"ping"}"#.into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.to_text().unwrap(), "pong");

        // Invalid payload rejects the command but keeps the channel open
        ws.send(Message::Text(r#"{"action":"fly"}"#.into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert!(reply.to_text().unwrap().starts_with("error: invalid command"));

        ws.send(Message::Text(r#"{"action":"stop"}"#.into()))
            .await
            .unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.to_text().unwrap(), "ok stop");
    }
}
