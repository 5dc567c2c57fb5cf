//! The relay's single owner of the physical device: meter telemetry,
//! audio capture/playback and the rigctld control transport.
//!
//! Other components never touch the device directly. They observe link
//! state through a [`watch`] channel and talk to the device through a
//! [`DeviceLinkHandle`].

pub mod control;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::audio::AudioSystem;
use crate::protocol::ServerEvent;
use crate::registry::{Broadcaster, RelayEvent};
use telemetry::TelemetryConfig;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid device url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection closed by device")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection state of the telemetry transport. Transitions happen only
/// through the methods below, which report whether clients must be told.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLinkState {
    pub status: LinkStatus,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
}

impl Default for DeviceLinkState {
    fn default() -> Self {
        Self {
            status: LinkStatus::Disconnected,
            last_error: None,
            reconnect_attempts: 0,
        }
    }
}

impl DeviceLinkState {
    pub fn begin_connect(&mut self) {
        if self.status == LinkStatus::Disconnected {
            self.status = LinkStatus::Connecting;
            self.reconnect_attempts += 1;
        }
    }

    /// Returns true when this is a change clients have not seen yet.
    pub fn mark_connected(&mut self) -> bool {
        let changed = self.status != LinkStatus::Connected;
        self.status = LinkStatus::Connected;
        self.last_error = None;
        self.reconnect_attempts = 0;
        changed
    }

    /// Returns true only when an established link was lost; a failed
    /// connect attempt is invisible to clients.
    pub fn mark_failed(&mut self, error: &LinkError) -> bool {
        let was_connected = self.status == LinkStatus::Connected;
        self.status = LinkStatus::Disconnected;
        self.last_error = Some(error.to_string());
        was_connected
    }

    pub fn is_connected(&self) -> bool {
        self.status == LinkStatus::Connected
    }
}

/// Cheap, cloneable access to the device link for the gateway.
#[derive(Clone)]
pub struct DeviceLinkHandle {
    state: watch::Receiver<DeviceLinkState>,
    sync_tx: mpsc::Sender<()>,
    playback_tx: Option<mpsc::Sender<Vec<i16>>>,
}

impl DeviceLinkHandle {
    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn state(&self) -> DeviceLinkState {
        self.state.borrow().clone()
    }

    /// Ask for an extra meter frame ahead of the polling schedule. Dropped
    /// when a request is already waiting.
    pub fn request_sync(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Queue decoded TX audio for the playback thread. Returns false when
    /// audio is disabled or the playback queue is full.
    pub fn play(&self, pcm: Vec<i16>) -> bool {
        match &self.playback_tx {
            Some(tx) => tx.try_send(pcm).is_ok(),
            None => false,
        }
    }
}

pub struct DeviceLink {
    telemetry: TelemetryConfig,
    broadcaster: Arc<dyn Broadcaster>,
    state: watch::Sender<DeviceLinkState>,
    sync_rx: mpsc::Receiver<()>,
    // Kept alive for the lifetime of the link; stops the threads on drop.
    _audio: Option<AudioSystem>,
}

impl DeviceLink {
    pub fn new(
        telemetry: TelemetryConfig,
        broadcaster: Arc<dyn Broadcaster>,
        audio: Option<AudioSystem>,
    ) -> (Self, DeviceLinkHandle) {
        let (state_tx, state_rx) = watch::channel(DeviceLinkState::default());
        let (sync_tx, sync_rx) = mpsc::channel(4);
        let playback_tx = audio.as_ref().map(|a| a.playback_sender());

        let link = Self {
            telemetry,
            broadcaster,
            state: state_tx,
            sync_rx,
            _audio: audio,
        };
        let handle = DeviceLinkHandle {
            state: state_rx,
            sync_tx,
            playback_tx,
        };
        (link, handle)
    }

    /// Keep the telemetry transport up until every handle is dropped.
    /// Reconnects after a fixed delay.
    pub async fn run(mut self) {
        loop {
            self.state.send_modify(|s| s.begin_connect());

            match telemetry::connect_and_stream(&self.telemetry, &*self.broadcaster, &self.state, &mut self.sync_rx).await {
                Ok(()) => {
                    log::info!("Device link shutting down");
                    break;
                }
                Err(e) => {
                    let mut lost = false;
                    self.state.send_modify(|s| lost = s.mark_failed(&e));
                    if lost {
                        self.broadcaster.broadcast(RelayEvent::Json(ServerEvent::connectivity(false)));
                    }
                    log::warn!(
                        "Telemetry link error: {}. Retrying in {:?}...",
                        e,
                        self.telemetry.reconnect_delay
                    );
                    if !self.wait_to_retry().await {
                        log::info!("Device link shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Sleep out the reconnect delay. Returns false if every handle was
    /// dropped meanwhile; sync requests while disconnected are discarded.
    async fn wait_to_retry(&mut self) -> bool {
        let retry_at = Instant::now() + self.telemetry.reconnect_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(retry_at) => return true,
                req = self.sync_rx.recv() => {
                    if req.is_none() {
                        return false;
                    }
                }
            }
        }
    }

    /// Record a successful connect and tell clients if it is news.
    fn connected(state: &watch::Sender<DeviceLinkState>, broadcaster: &dyn Broadcaster) {
        let mut changed = false;
        state.send_modify(|s| changed = s.mark_connected());
        if changed {
            broadcaster.broadcast(RelayEvent::Json(ServerEvent::connectivity(true)));
        }
    }
}
