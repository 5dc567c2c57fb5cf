//! Serialized command execution against the rigctld control channel.
//!
//! Commands are queued FIFO and executed one at a time by a single worker,
//! which is also the only writer of [`RadioState`]. Nothing is coalesced or
//! retried; a failed command is acknowledged as failed and the worker moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::device_link::LinkError;
use crate::device_link::control::{ControlTransport, RPRT_OK};
use crate::protocol::ServerEvent;
use crate::radio_state::{RadioMode, RadioState};
use crate::registry::{Broadcaster, RelayEvent, SessionId};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub status_interval: Duration,
    /// Passband in Hz sent with every mode change.
    pub passband: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            passband: 2400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SetFrequency(u64),
    SetMode(RadioMode),
    SetPtt(bool),
    SetPower(u8),
    GetStatus,
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetFrequency(_) => "set_frequency",
            Self::SetMode(_) => "set_mode",
            Self::SetPtt(_) => "set_ptt",
            Self::SetPower(_) => "set_power",
            Self::GetStatus => "get_status",
        }
    }

    fn request_line(&self, passband: u32) -> Option<String> {
        match self {
            Self::SetFrequency(hz) => Some(format!("F {}", hz)),
            Self::SetMode(mode) => Some(format!("M {} {}", mode.rig_name(), passband)),
            Self::SetPtt(on) => Some(format!("T {}", u8::from(*on))),
            Self::SetPower(percent) => Some(format!("L RFPOWER {:.2}", f64::from(*percent) / 100.0)),
            Self::GetStatus => None,
        }
    }

    fn commit(&self, state: &mut RadioState) {
        match *self {
            Self::SetFrequency(hz) => state.frequency = hz,
            Self::SetMode(mode) => state.mode = mode,
            Self::SetPtt(on) => state.ptt = on,
            Self::SetPower(percent) => state.power_percent = percent,
            Self::GetStatus => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub kind: CommandKind,
    pub enqueue_time: Instant,
    /// Session to acknowledge; `None` for internally scheduled polls.
    pub origin: Option<SessionId>,
}

#[derive(Debug, Error)]
enum ExecError {
    #[error("device rejected command: {0}")]
    Rejected(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Cloneable front of the scheduler used by the gateway and the poller.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<PendingCommand>,
    pending: Arc<AtomicUsize>,
    state: watch::Receiver<RadioState>,
}

impl SchedulerHandle {
    /// Queue a command. Returns false once the worker has stopped.
    pub fn enqueue(&self, kind: CommandKind, origin: Option<SessionId>) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let command = PendingCommand {
            kind,
            enqueue_time: Instant::now(),
            origin,
        };
        if self.tx.send(command).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Queued plus in-flight commands.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn radio_state(&self) -> RadioState {
        self.state.borrow().clone()
    }
}

pub struct CommandScheduler<T> {
    config: SchedulerConfig,
    transport: T,
    broadcaster: Arc<dyn Broadcaster>,
    rx: mpsc::UnboundedReceiver<PendingCommand>,
    pending: Arc<AtomicUsize>,
    state: watch::Sender<RadioState>,
}

impl<T: ControlTransport> CommandScheduler<T> {
    pub fn new(config: SchedulerConfig, transport: T, broadcaster: Arc<dyn Broadcaster>) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RadioState::default());
        let pending = Arc::new(AtomicUsize::new(0));

        let handle = SchedulerHandle {
            tx,
            pending: pending.clone(),
            state: state_rx,
        };
        let scheduler = Self {
            config,
            transport,
            broadcaster,
            rx,
            pending,
            state: state_tx,
        };
        (scheduler, handle)
    }

    /// Drain the queue until every handle is dropped.
    pub async fn run(mut self) {
        log::info!("Command scheduler started");
        while let Some(command) = self.rx.recv().await {
            self.execute(command).await;
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        log::info!("Command scheduler stopped");
    }

    async fn execute(&mut self, command: PendingCommand) {
        let name = command.kind.name();
        log::debug!("Executing {} (queued {:?})", name, command.enqueue_time.elapsed());

        let result = match command.kind.request_line(self.config.passband) {
            Some(line) => self.apply(command.kind, &line).await,
            None => self.refresh_status().await,
        };

        if let Err(e) = &result {
            log::warn!("Command {} failed: {}", name, e);
        }
        if let Some(origin) = command.origin {
            let (ok, error) = match result {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            };
            self.broadcaster.send_to(
                origin,
                ServerEvent::CommandResult {
                    command: name.to_string(),
                    ok,
                    error,
                },
            );
        }
    }

    async fn apply(&mut self, kind: CommandKind, line: &str) -> Result<(), ExecError> {
        let response = match self.transport.request(line, 1).await {
            Ok(response) => response,
            Err(e) => {
                self.mark_unreachable();
                return Err(e.into());
            }
        };

        let reply = response.first().map(String::as_str).unwrap_or_default();
        if !reply.starts_with(RPRT_OK) {
            return Err(ExecError::Rejected(reply.to_string()));
        }

        self.state.send_modify(|state| {
            kind.commit(state);
            state.connected = true;
            state.last_update = Some(Utc::now());
        });
        log::info!("Radio: {} applied ({})", kind.name(), line);
        self.publish_state();
        Ok(())
    }

    async fn refresh_status(&mut self) -> Result<(), ExecError> {
        let (frequency, mode, strength) = match self.query_status().await {
            Ok(values) => values,
            Err(e) => {
                self.mark_unreachable();
                return Err(e.into());
            }
        };

        self.state.send_modify(|state| {
            if let Some(hz) = frequency {
                state.frequency = hz;
            }
            if let Some(mode) = mode {
                state.mode = mode;
            }
            if let Some(strength) = strength {
                state.signal_strength = strength;
            }
            state.connected = true;
            state.last_update = Some(Utc::now());
        });
        self.publish_state();
        Ok(())
    }

    async fn query_status(&mut self) -> Result<(Option<u64>, Option<RadioMode>, Option<i32>), LinkError> {
        let frequency = self.query("f", 1).await?.and_then(|v| v.first()?.parse().ok());
        let mode = self.query("m", 2).await?.and_then(|v| RadioMode::from_rig_name(v.first()?));
        let strength = self.query("l STRENGTH", 1).await?.and_then(|v| v.first()?.parse().ok());
        Ok((frequency, mode, strength))
    }

    /// A query answered with `RPRT` carries no value.
    async fn query(&mut self, line: &str, lines: usize) -> Result<Option<Vec<String>>, LinkError> {
        let response = self.transport.request(line, lines).await?;
        if response.first().is_some_and(|r| r.starts_with("RPRT")) {
            log::debug!("rigctld could not answer {:?}: {:?}", line, response);
            return Ok(None);
        }
        Ok(Some(response))
    }

    fn mark_unreachable(&self) {
        let changed = self.state.send_if_modified(|state| {
            let was_connected = state.connected;
            state.connected = false;
            was_connected
        });
        if changed {
            log::warn!("Lost contact with rigctld");
            self.publish_state();
        }
    }

    fn publish_state(&self) {
        let state = self.state.borrow().clone();
        self.broadcaster.broadcast(RelayEvent::Json(ServerEvent::RadioState(state)));
    }
}

/// Enqueue a status refresh every `interval` while the queue is idle.
pub fn spawn_status_poller(handle: SchedulerHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if handle.pending() > 0 {
                continue;
            }
            if !handle.enqueue(CommandKind::GetStatus, None) {
                break;
            }
        }
    })
}
