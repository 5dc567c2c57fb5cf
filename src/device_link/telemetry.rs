//! Meter telemetry over the device's WebSocket.
//!
//! The firmware only reports in response to a sync command, so the link
//! polls with `sync` on a fixed period and decodes whatever frames come back.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use super::{DeviceLink, DeviceLinkState, LinkError};
use crate::frame_codec::{decode_telemetry, encode_sync_command};
use crate::protocol::ServerEvent;
use crate::registry::{Broadcaster, RelayEvent};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// e.g. `ws://192.168.1.12:60001/`
    pub url: String,
    pub sync_interval: Duration,
    /// Bound on the handshake and on the gap between inbound frames.
    pub read_timeout: Duration,
    pub reconnect_delay: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:60001/".to_string(),
            sync_interval: Duration::from_millis(200),
            read_timeout: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Connect once and pump frames until the transport fails. Returns `Ok`
/// only when the link is being shut down (all handles dropped).
pub(super) async fn connect_and_stream(
    config: &TelemetryConfig,
    broadcaster: &dyn Broadcaster,
    state: &watch::Sender<DeviceLinkState>,
    sync_rx: &mut mpsc::Receiver<()>,
) -> Result<(), LinkError> {
    let url = Url::parse(&config.url).map_err(|source| LinkError::InvalidUrl {
        url: config.url.clone(),
        source,
    })?;

    log::info!("Connecting to meter device at {}...", url);
    let (ws_stream, _) = timeout(config.read_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| LinkError::Timeout(config.read_timeout))??;
    let (mut write, mut read) = ws_stream.split();

    DeviceLink::connected(state, broadcaster);
    log::info!("Meter device connected");

    let sync = encode_sync_command();
    let mut poll = tokio::time::interval(config.sync_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                if matches!(msg, Some(Ok(_))) {
                    last_rx = Instant::now();
                }
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match decode_telemetry(&data) {
                            Some(reading) => {
                                log::debug!(
                                    "Meter: power={}W swr={} max={}W eff={:.1}%",
                                    reading.forward_power,
                                    reading.swr(),
                                    reading.max_power,
                                    reading.efficiency(),
                                );
                                broadcaster.broadcast(RelayEvent::Json(ServerEvent::meter(&reading)));
                            }
                            None => log::debug!("Discarding {} byte non-meter frame", data.len()),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::warn!("Meter device closed connection: {:?}", frame);
                        return Err(LinkError::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(LinkError::Closed),
                }
            }
            _ = tokio::time::sleep_until(last_rx + config.read_timeout) => {
                log::warn!("Meter device silent for {:?}", config.read_timeout);
                return Err(LinkError::Timeout(config.read_timeout));
            }
            _ = poll.tick() => {
                write.send(Message::Binary(sync.to_vec().into())).await?;
            }
            req = sync_rx.recv() => {
                match req {
                    Some(()) => write.send(Message::Binary(sync.to_vec().into())).await?,
                    None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }
}
