//! Relay WebSocket server: the boundary between clients and the engine.
//!
//! Each connection is a session in the [`ClientRegistry`]. The handler reads
//! client frames and writes whatever the registry queues for the session;
//! replies go through the same queue so they stay ordered with broadcasts.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use crate::audio::{AudioConfig, StreamDecoder, create_decoder};
use crate::device_link::DeviceLinkHandle;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::radio_state::{RadioMode, frequency_in_range};
use crate::registry::{Broadcaster, ClientRegistry, Outbound, SessionId, SessionKind};
use crate::scheduler::{CommandKind, SchedulerHandle};

/// Request path that opens an audio session.
pub const AUDIO_PATH: &str = "/audio";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("missing command")]
    MissingCommand,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("{0} requires a value")]
    MissingValue(&'static str),

    #[error("invalid value for {command}: {reason}")]
    InvalidValue { command: &'static str, reason: String },
}

/// A validated `{type:"command"}` message.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Schedule(CommandKind),
    Sync,
    Status,
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_u64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

pub fn parse_command(msg: &ClientMessage) -> Result<ClientCommand, CommandError> {
    let command = msg.command.as_deref().ok_or(CommandError::MissingCommand)?;

    let value = |name: &'static str| msg.value.as_ref().filter(|v| !v.is_null()).ok_or(CommandError::MissingValue(name));
    let invalid = |command: &'static str, reason: &str| CommandError::InvalidValue {
        command,
        reason: reason.to_string(),
    };

    let kind = match command {
        "set_frequency" | "setFrequency" => {
            let hz = as_u64(value("set_frequency")?).ok_or_else(|| invalid("set_frequency", "not an integer"))?;
            if !frequency_in_range(hz) {
                return Err(invalid("set_frequency", "out of range"));
            }
            CommandKind::SetFrequency(hz)
        }
        "set_mode" | "setMode" => {
            let mode = value("set_mode")?
                .as_str()
                .and_then(RadioMode::parse)
                .ok_or_else(|| invalid("set_mode", "expected USB, LSB, CW, AM, FM or DIGI"))?;
            CommandKind::SetMode(mode)
        }
        "set_ptt" | "setPTT" => {
            let on = as_bool(value("set_ptt")?).ok_or_else(|| invalid("set_ptt", "not a boolean"))?;
            CommandKind::SetPtt(on)
        }
        "set_power" | "setPower" => {
            let percent = as_u64(value("set_power")?)
                .filter(|p| *p <= 100)
                .ok_or_else(|| invalid("set_power", "expected 0..=100"))?;
            CommandKind::SetPower(percent as u8)
        }
        "get_status" | "getStatus" => CommandKind::GetStatus,
        "sync" => return Ok(ClientCommand::Sync),
        "status" => return Ok(ClientCommand::Status),
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(ClientCommand::Schedule(kind))
}

pub struct RelayGateway {
    registry: Arc<ClientRegistry>,
    scheduler: SchedulerHandle,
    device: DeviceLinkHandle,
    audio: AudioConfig,
}

impl RelayGateway {
    pub fn new(
        registry: Arc<ClientRegistry>,
        scheduler: SchedulerHandle,
        device: DeviceLinkHandle,
        audio: AudioConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scheduler,
            device,
            audio,
        })
    }

    /// Accept connections until the task is cancelled.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    continue;
                }
            };
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, peer).await {
                    log::warn!("Connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut path = String::new();
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        })
        .await?;
        let (mut write, mut read) = ws.split();

        let kind = if path == AUDIO_PATH { SessionKind::Audio } else { SessionKind::Control };
        let (id, mut outbound) = match self.registry.register(kind, peer) {
            Ok(session) => session,
            Err(e) => {
                let frame = CloseFrame {
                    code: CloseCode::Again,
                    reason: e.to_string().into(),
                };
                let _ = write.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let mut decoder = match kind {
            SessionKind::Audio => self.audio_decoder(),
            SessionKind::Control => {
                self.registry.send_to(id, ServerEvent::connectivity(self.device.is_connected()));
                None
            }
        };

        let result = async {
            loop {
                tokio::select! {
                    msg = read.next() => match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(id, text.as_str()),
                        Some(Ok(Message::Binary(data))) => self.handle_audio(id, &mut decoder, &data),
                        Some(Ok(Message::Ping(_))) => {
                            self.registry.touch_heartbeat(id);
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                    },
                    out = outbound.recv() => match out {
                        Some(Outbound::Text(text)) => write.send(Message::Text(text.to_string().into())).await?,
                        Some(Outbound::Binary(pcm)) => write.send(Message::Binary(pcm)).await?,
                        None => {
                            // Unregistered elsewhere: heartbeat timeout, eviction or shutdown.
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        self.registry.unregister(id);
        result
    }

    fn audio_decoder(&self) -> Option<Box<dyn StreamDecoder>> {
        match create_decoder(&self.audio.tx_format, self.audio.sample_rate, self.audio.channels) {
            Ok(decoder) => Some(decoder),
            Err(e) => {
                log::warn!("TX audio disabled for this session: {}", e);
                None
            }
        }
    }

    fn reply(&self, id: SessionId, event: ServerEvent) {
        self.registry.send_to(id, event);
    }

    fn status(&self) -> ServerEvent {
        ServerEvent::Status {
            connected: self.device.is_connected(),
            clients_count: Some(self.registry.len()),
            server_time: Some(Utc::now().to_rfc3339()),
        }
    }

    fn handle_text(&self, id: SessionId, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("Malformed message from {}: {}", id, e);
                self.reply(id, ServerEvent::error(format!("malformed message: {}", e)));
                return;
            }
        };

        match msg.msg_type.as_str() {
            "command" => self.handle_command(id, &msg),
            "status" => self.reply(id, self.status()),
            "heartbeat" => {
                self.registry.touch_heartbeat(id);
                self.reply(id, ServerEvent::heartbeat_response());
            }
            "join" => {
                let group = msg.group.clone().unwrap_or_else(|| "default".to_string());
                self.registry.join_group(id, group);
                self.reply(id, ServerEvent::RadioState(self.scheduler.radio_state()));
            }
            other => {
                log::debug!("Ignoring message type {:?} from {}", other, id);
                self.reply(id, ServerEvent::Ack { ignored: other.to_string() });
            }
        }
    }

    fn handle_command(&self, id: SessionId, msg: &ClientMessage) {
        match parse_command(msg) {
            Ok(ClientCommand::Schedule(kind)) => {
                log::debug!("Client {} queued {:?}", id, kind);
                if !self.scheduler.enqueue(kind, Some(id)) {
                    self.reply(id, ServerEvent::error("command scheduler unavailable"));
                }
            }
            Ok(ClientCommand::Sync) => self.device.request_sync(),
            Ok(ClientCommand::Status) => self.reply(id, self.status()),
            Err(e) => {
                log::debug!("Rejected command from {}: {}", id, e);
                self.reply(id, ServerEvent::error(e.to_string()));
            }
        }
    }

    fn handle_audio(&self, id: SessionId, decoder: &mut Option<Box<dyn StreamDecoder>>, data: &[u8]) {
        let Some(decoder) = decoder.as_mut() else {
            log::debug!("Ignoring {} byte binary frame from {}", data.len(), id);
            return;
        };
        match decoder.decode(data) {
            Ok(pcm) => {
                if !self.device.play(pcm) {
                    log::debug!("TX audio from {} dropped: playback unavailable or busy", id);
                }
            }
            Err(e) => log::warn!("Undecodable TX audio from {}: {}", id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use tokio::time::timeout;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

    use super::*;
    use crate::device_link::telemetry::TelemetryConfig;
    use crate::device_link::{DeviceLink, LinkError};
    use crate::device_link::control::ControlTransport;
    use crate::registry::{RegistryConfig, RelayEvent};
    use crate::scheduler::{CommandScheduler, SchedulerConfig};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn message(value: Value) -> ClientMessage {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn commands_are_validated_before_scheduling() {
        let parse = |v: Value| parse_command(&message(v));

        assert_eq!(
            parse(json!({"type": "command", "command": "setFrequency", "value": 14074000})),
            Ok(ClientCommand::Schedule(CommandKind::SetFrequency(14_074_000)))
        );
        assert_eq!(
            parse(json!({"type": "command", "command": "set_frequency", "value": "7074000"})),
            Ok(ClientCommand::Schedule(CommandKind::SetFrequency(7_074_000)))
        );
        assert_eq!(
            parse(json!({"type": "command", "command": "set_mode", "value": "lsb"})),
            Ok(ClientCommand::Schedule(CommandKind::SetMode(RadioMode::Lsb)))
        );
        assert_eq!(
            parse(json!({"type": "command", "command": "setPTT", "value": 1})),
            Ok(ClientCommand::Schedule(CommandKind::SetPtt(true)))
        );
        assert_eq!(
            parse(json!({"type": "command", "command": "set_power", "value": 40})),
            Ok(ClientCommand::Schedule(CommandKind::SetPower(40)))
        );
        assert_eq!(parse(json!({"type": "command", "command": "sync"})), Ok(ClientCommand::Sync));
        assert_eq!(parse(json!({"type": "command", "command": "status"})), Ok(ClientCommand::Status));
    }

    #[test]
    fn invalid_commands_are_rejected_locally() {
        let parse = |v: Value| parse_command(&message(v));

        assert_eq!(parse(json!({"type": "command"})), Err(CommandError::MissingCommand));
        assert_eq!(
            parse(json!({"type": "command", "command": "set_ptt"})),
            Err(CommandError::MissingValue("set_ptt"))
        );
        assert!(matches!(
            parse(json!({"type": "command", "command": "set_frequency", "value": 50})),
            Err(CommandError::InvalidValue { command: "set_frequency", .. })
        ));
        assert!(matches!(
            parse(json!({"type": "command", "command": "set_mode", "value": "SSB"})),
            Err(CommandError::InvalidValue { command: "set_mode", .. })
        ));
        assert!(matches!(
            parse(json!({"type": "command", "command": "set_power", "value": 101})),
            Err(CommandError::InvalidValue { command: "set_power", .. })
        ));
        assert_eq!(
            parse(json!({"type": "command", "command": "reboot"})),
            Err(CommandError::Unknown("reboot".to_string()))
        );
    }

    /// Accepts every set command; queries are not exercised here.
    struct AgreeableRig;

    #[async_trait]
    impl ControlTransport for AgreeableRig {
        async fn request(&mut self, _line: &str, _lines: usize) -> Result<Vec<String>, LinkError> {
            Ok(vec!["RPRT 0".to_string()])
        }
    }

    struct Relay {
        addr: SocketAddr,
        registry: Arc<ClientRegistry>,
    }

    async fn start_relay(max_clients: usize) -> Relay {
        let registry = ClientRegistry::new(RegistryConfig { max_clients, ..RegistryConfig::default() });
        let (scheduler, scheduler_handle) =
            CommandScheduler::new(SchedulerConfig::default(), AgreeableRig, registry.clone());
        tokio::spawn(scheduler.run());
        let (_link, device) = DeviceLink::new(TelemetryConfig::default(), registry.clone(), None);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gateway = RelayGateway::new(registry.clone(), scheduler_handle, device, AudioConfig::default());
        tokio::spawn(gateway.serve(listener));

        Relay { addr, registry }
    }

    async fn connect(relay: &Relay, path: &str) -> Client {
        let (ws, _) = connect_async(format!("ws://{}{}", relay.addr, path)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn next_json(ws: &mut Client) -> Value {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn control_session_gets_status_and_survives_bad_input() {
        let relay = start_relay(10).await;
        let mut ws = connect(&relay, "/").await;

        assert_eq!(next_json(&mut ws).await, json!({"type": "status", "connected": false}));

        ws.send(Message::Text("not json".to_string().into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["type"], "error");

        send(&mut ws, json!({"type": "future_feature"})).await;
        assert_eq!(next_json(&mut ws).await, json!({"type": "ack", "ignored": "future_feature"}));

        send(&mut ws, json!({"type": "status"})).await;
        let status = next_json(&mut ws).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["clients_count"], 1);
        assert!(status["server_time"].is_string());
    }

    #[tokio::test]
    async fn command_is_scheduled_and_acknowledged() {
        let relay = start_relay(10).await;
        let mut ws = connect(&relay, "/").await;
        next_json(&mut ws).await;

        send(&mut ws, json!({"type": "command", "command": "set_frequency", "value": 14074000})).await;

        let state = next_json(&mut ws).await;
        assert_eq!(state["type"], "radio_state");
        assert_eq!(state["frequency"], 14_074_000);
        assert_eq!(
            next_json(&mut ws).await,
            json!({"type": "command_result", "command": "set_frequency", "ok": true})
        );

        send(&mut ws, json!({"type": "command", "command": "set_frequency", "value": 1})).await;
        let error = next_json(&mut ws).await;
        assert_eq!(error["type"], "error");
        assert!(error["message"].as_str().unwrap().contains("out of range"));
    }

    #[tokio::test]
    async fn heartbeat_and_join_are_answered() {
        let relay = start_relay(10).await;
        let mut ws = connect(&relay, "/").await;
        next_json(&mut ws).await;

        send(&mut ws, json!({"type": "heartbeat"})).await;
        let pong = next_json(&mut ws).await;
        assert_eq!(pong["type"], "heartbeat_response");
        assert!(pong["server_time"].is_f64());

        send(&mut ws, json!({"type": "join", "group": "ic7100"})).await;
        let state = next_json(&mut ws).await;
        assert_eq!(state["type"], "radio_state");
        assert_eq!(state["mode"], "USB");
    }

    #[tokio::test]
    async fn connection_over_capacity_is_closed_immediately() {
        let relay = start_relay(1).await;
        let mut first = connect(&relay, "/").await;
        next_json(&mut first).await;

        let mut second = connect(&relay, "/").await;
        let msg = timeout(Duration::from_secs(5), second.next()).await.unwrap();
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Again),
            other => panic!("expected close frame, got {:?}", other),
        }

        // the admitted session is unaffected
        send(&mut first, json!({"type": "status"})).await;
        assert_eq!(next_json(&mut first).await["clients_count"], 1);
    }

    #[tokio::test]
    async fn audio_session_receives_binary_blocks_only() {
        let relay = start_relay(10).await;
        let mut control = connect(&relay, "/").await;
        next_json(&mut control).await;
        let mut audio = connect(&relay, AUDIO_PATH).await;

        timeout(Duration::from_secs(5), async {
            while relay.registry.len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        relay.registry.broadcast(RelayEvent::Audio(Bytes::from_static(&[0x00, 0x40])));
        let msg = timeout(Duration::from_secs(5), audio.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg, Message::Binary(Bytes::from_static(&[0x00, 0x40])));

        // TX audio with no playback device is dropped without closing the session
        audio.send(Message::Binary(Bytes::from_static(&[0x01, 0x00]))).await.unwrap();
        send(&mut control, json!({"type": "status"})).await;
        assert_eq!(next_json(&mut control).await["clients_count"], 2);
    }

    #[tokio::test]
    async fn disconnect_unregisters_the_session() {
        let relay = start_relay(10).await;
        let mut ws = connect(&relay, "/").await;
        next_json(&mut ws).await;
        assert_eq!(relay.registry.len(), 1);

        ws.close(None).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while relay.registry.len() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
