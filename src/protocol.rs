use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame_codec::MeterReading;
use crate::radio_state::RadioState;

/// Inbound control envelope. Only `type` is required; the remaining fields
/// are checked per message kind by the gateway.
#[derive(Deserialize, Debug, Clone)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub command: Option<String>,
    pub value: Option<Value>,
    pub group: Option<String>,
}

/// Meter values as shown to clients.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MeterData {
    pub power: u16,
    pub swr: f64,
    pub max_power: u16,
    pub efficiency: f64,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl From<&MeterReading> for MeterData {
    fn from(reading: &MeterReading) -> Self {
        Self {
            power: reading.forward_power,
            swr: round_to(reading.swr(), 2),
            max_power: reading.max_power,
            efficiency: round_to(reading.efficiency(), 1),
        }
    }
}

/// Outbound JSON events, tagged by `type`.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        connected: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        clients_count: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        server_time: Option<String>,
    },
    Data {
        data: MeterData,
        timestamp: String,
    },
    RadioState(RadioState),
    CommandResult {
        command: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    HeartbeatResponse {
        timestamp: String,
        server_time: f64,
    },
    Error {
        message: String,
    },
    Ack {
        ignored: String,
    },
}

impl ServerEvent {
    pub fn connectivity(connected: bool) -> Self {
        Self::Status { connected, clients_count: None, server_time: None }
    }

    pub fn meter(reading: &MeterReading) -> Self {
        Self::Data {
            data: MeterData::from(reading),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn heartbeat_response() -> Self {
        let now = Utc::now();
        Self::HeartbeatResponse {
            timestamp: now.to_rfc3339(),
            server_time: now.timestamp_millis() as f64 / 1000.0,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
