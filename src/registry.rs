//! Connected relay clients and best-effort fan-out to them.
//!
//! Every session owns a bounded outbound queue. The registry holds the only
//! sender, so unregistering a session closes its queue and the connection
//! handler on the other end shuts the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::ServerEvent;

pub type SessionId = Uuid;

const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_clients: usize,
    pub heartbeat_interval: Duration,
    /// Per-session outbound queue depth; a full queue marks a slow client.
    pub queue_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_clients: 100,
            heartbeat_interval: Duration::from_secs(30),
            queue_depth: 64,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client limit reached ({0})")]
    CapacityExceeded(usize),
}

/// What a session receives: control sessions get JSON, audio sessions get PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Control,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(Arc<str>),
    Binary(Bytes),
}

/// Something published by the device side for all clients.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Json(ServerEvent),
    Audio(Bytes),
}

/// Publishing seam for the device link and the command scheduler.
pub trait Broadcaster: Send + Sync {
    /// Fan an event out to every interested session without blocking.
    fn broadcast(&self, event: RelayEvent);

    /// Deliver an event to a single session, e.g. a command acknowledgment.
    fn send_to(&self, session: SessionId, event: ServerEvent);
}

#[derive(Debug, Clone)]
pub struct ClientSession {
    pub id: SessionId,
    pub kind: SessionKind,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: Instant,
    pub joined_group: Option<String>,
    pub remote_address: SocketAddr,
}

struct SessionEntry {
    session: ClientSession,
    tx: mpsc::Sender<Outbound>,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Clone)]
struct Recipient {
    id: SessionId,
    kind: SessionKind,
    tx: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, SessionEntry>,
    // Rebuilt on membership change, shared read-only with broadcasts.
    snapshot: Arc<Vec<Recipient>>,
}

impl Inner {
    fn rebuild_snapshot(&mut self) {
        let recipients = self
            .sessions
            .values()
            .map(|e| Recipient {
                id: e.session.id,
                kind: e.session.kind,
                tx: e.tx.clone(),
            })
            .collect();
        self.snapshot = Arc::new(recipients);
    }
}

pub struct ClientRegistry {
    config: RegistryConfig,
    inner: Mutex<Inner>,
}

impl ClientRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never panic; recover the data if one ever did.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit a new session and start its heartbeat watcher. Refused outright
    /// once `max_clients` sessions are registered.
    pub fn register(
        self: &Arc<Self>,
        kind: SessionKind,
        remote_address: SocketAddr,
    ) -> Result<(SessionId, mpsc::Receiver<Outbound>), RegistryError> {
        let (tx, rx) = mpsc::channel(self.config.queue_depth.max(1));
        let id = Uuid::new_v4();

        let mut inner = self.lock();
        if inner.sessions.len() >= self.config.max_clients {
            log::warn!(
                "Connection from {} rejected: max connections ({}) reached",
                remote_address,
                self.config.max_clients
            );
            return Err(RegistryError::CapacityExceeded(self.config.max_clients));
        }

        let now = Instant::now();
        let session = ClientSession {
            id,
            kind,
            connected_at: Utc::now(),
            last_heartbeat: now,
            joined_group: None,
            remote_address,
        };
        let watcher = self.spawn_heartbeat_watcher(id, now);
        inner.sessions.insert(id, SessionEntry { session, tx, watcher: Some(watcher) });
        inner.rebuild_snapshot();

        log::info!(
            "Client connected: {} ({:?}) from {}, clients: {}",
            id,
            kind,
            remote_address,
            inner.sessions.len()
        );
        Ok((id, rx))
    }

    /// Remove a session. Returns false if it was already gone.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut inner = self.lock();
        let Some(mut entry) = inner.sessions.remove(&id) else {
            return false;
        };
        inner.rebuild_snapshot();
        let remaining = inner.sessions.len();
        drop(inner);

        if let Some(watcher) = entry.watcher.take() {
            watcher.abort();
        }
        let session = &entry.session;
        log::info!(
            "Client disconnected: {} from {} after {}s, clients: {}",
            id,
            session.remote_address,
            (Utc::now() - session.connected_at).num_seconds(),
            remaining
        );
        true
    }

    pub fn touch_heartbeat(&self, id: SessionId) -> bool {
        match self.lock().sessions.get_mut(&id) {
            Some(entry) => {
                entry.session.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn join_group(&self, id: SessionId, group: String) -> bool {
        match self.lock().sessions.get_mut(&id) {
            Some(entry) => {
                log::info!("Client {} joined group: {}", id, group);
                entry.session.joined_group = Some(group);
                true
            }
            None => false,
        }
    }

    pub fn session(&self, id: SessionId) -> Option<ClientSession> {
        self.lock().sessions.get(&id).map(|e| e.session.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Drop every session, closing all client queues.
    pub fn clear(&self) {
        let ids: Vec<SessionId> = self.lock().sessions.keys().copied().collect();
        for id in ids {
            self.unregister(id);
        }
    }

    fn snapshot(&self) -> Arc<Vec<Recipient>> {
        self.lock().snapshot.clone()
    }

    fn spawn_heartbeat_watcher(self: &Arc<Self>, id: SessionId, since: Instant) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let timeout = self.config.heartbeat_interval * 2;

        tokio::spawn(async move {
            let mut last = since;
            loop {
                // A gap of exactly `timeout` is still alive.
                tokio::time::sleep_until(last + timeout + TIMER_RESOLUTION).await;

                let Some(registry) = registry.upgrade() else { return };
                let Some(session) = registry.session(id) else { return };
                if session.last_heartbeat == last {
                    log::warn!("Client {} heartbeat timeout, disconnecting", id);
                    registry.unregister(id);
                    return;
                }
                last = session.last_heartbeat;
            }
        })
    }

    fn deliver(recipient: &Recipient, message: Outbound) -> bool {
        match recipient.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Client {} is not keeping up, dropping it", recipient.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Broadcaster for ClientRegistry {
    fn broadcast(&self, event: RelayEvent) {
        let (kind, message) = match event {
            RelayEvent::Json(event) => match event.to_json() {
                Ok(text) => (SessionKind::Control, Outbound::Text(Arc::from(text))),
                Err(e) => {
                    log::error!("Failed to serialize broadcast event: {}", e);
                    return;
                }
            },
            RelayEvent::Audio(pcm) => (SessionKind::Audio, Outbound::Binary(pcm)),
        };

        let mut failed = Vec::new();
        for recipient in self.snapshot().iter().filter(|r| r.kind == kind) {
            if !Self::deliver(recipient, message.clone()) {
                failed.push(recipient.id);
            }
        }

        for id in failed {
            self.unregister(id);
        }
    }

    fn send_to(&self, session: SessionId, event: ServerEvent) {
        let recipient = self.snapshot().iter().find(|r| r.id == session).cloned();
        let Some(recipient) = recipient else {
            log::debug!("Dropping reply for departed client {}", session);
            return;
        };

        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Failed to serialize reply: {}", e);
                return;
            }
        };
        if !Self::deliver(&recipient, Outbound::Text(Arc::from(text))) {
            self.unregister(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn registry(max_clients: usize) -> Arc<ClientRegistry> {
        ClientRegistry::new(RegistryConfig { max_clients, ..RegistryConfig::default() })
    }

    #[tokio::test]
    async fn capacity_refuses_the_next_client_only() {
        let registry = registry(100);
        let mut receivers = Vec::new();
        for _ in 0..100 {
            receivers.push(registry.register(SessionKind::Control, addr()).unwrap());
        }

        assert_eq!(
            registry.register(SessionKind::Control, addr()).unwrap_err(),
            RegistryError::CapacityExceeded(100)
        );
        assert_eq!(registry.len(), 100);

        registry.broadcast(RelayEvent::Json(ServerEvent::connectivity(true)));
        for (_, rx) in receivers.iter_mut() {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn failed_client_does_not_block_others() {
        let registry = registry(10);
        let (a, rx_a) = registry.register(SessionKind::Control, addr()).unwrap();
        let (b, mut rx_b) = registry.register(SessionKind::Control, addr()).unwrap();
        let (c, mut rx_c) = registry.register(SessionKind::Control, addr()).unwrap();
        drop(rx_a);

        registry.broadcast(RelayEvent::Json(ServerEvent::connectivity(false)));

        let expected = Outbound::Text(Arc::from(r#"{"type":"status","connected":false}"#));
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert_eq!(rx_c.try_recv().unwrap(), expected);
        assert!(registry.session(a).is_none());
        assert!(registry.session(b).is_some());
        assert!(registry.session(c).is_some());
    }

    #[tokio::test]
    async fn slow_client_is_dropped_when_its_queue_is_full() {
        let registry = ClientRegistry::new(RegistryConfig { queue_depth: 1, ..RegistryConfig::default() });
        let (slow, _rx_slow) = registry.register(SessionKind::Audio, addr()).unwrap();
        let (fast, mut rx_fast) = registry.register(SessionKind::Audio, addr()).unwrap();

        registry.broadcast(RelayEvent::Audio(Bytes::from_static(&[1, 0])));
        assert!(rx_fast.try_recv().is_ok());
        registry.broadcast(RelayEvent::Audio(Bytes::from_static(&[2, 0])));

        assert!(registry.session(slow).is_none());
        assert_eq!(rx_fast.try_recv().unwrap(), Outbound::Binary(Bytes::from_static(&[2, 0])));
        assert!(registry.session(fast).is_some());
    }

    #[tokio::test]
    async fn events_are_routed_by_session_kind() {
        let registry = registry(10);
        let (_, mut control) = registry.register(SessionKind::Control, addr()).unwrap();
        let (_, mut audio) = registry.register(SessionKind::Audio, addr()).unwrap();

        registry.broadcast(RelayEvent::Audio(Bytes::from_static(&[0, 0])));
        registry.broadcast(RelayEvent::Json(ServerEvent::connectivity(true)));

        assert!(matches!(control.try_recv(), Ok(Outbound::Text(_))));
        assert!(control.try_recv().is_err());
        assert!(matches!(audio.try_recv(), Ok(Outbound::Binary(_))));
        assert!(audio.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_closes_the_client_queue() {
        let registry = registry(10);
        let (id, mut rx) = registry.register(SessionKind::Control, addr()).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_target() {
        let registry = registry(10);
        let (a, mut rx_a) = registry.register(SessionKind::Control, addr()).unwrap();
        let (_, mut rx_b) = registry.register(SessionKind::Control, addr()).unwrap();

        registry.send_to(a, ServerEvent::error("bad"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_times_out_after_two_intervals() {
        let registry = registry(10);
        let (id, mut rx) = registry.register(SessionKind::Control, addr()).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(registry.session(id).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(registry.session(id).is_none());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn silence_of_exactly_two_intervals_is_tolerated() {
        let registry = registry(10);
        let (id, _rx) = registry.register(SessionKind::Control, addr()).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.session(id).is_some());
        assert!(registry.touch_heartbeat(id));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.session(id).is_some());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(registry.session(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_at_half_interval_keep_the_session() {
        let registry = registry(10);
        let (id, _rx) = registry.register(SessionKind::Control, addr()).unwrap();

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(15)).await;
            assert!(registry.touch_heartbeat(id));
        }
        assert!(registry.session(id).is_some());
    }

    #[tokio::test]
    async fn session_records_its_origin() {
        let registry = registry(10);
        let before = Utc::now();
        let (id, _rx) = registry.register(SessionKind::Audio, addr()).unwrap();

        let session = registry.session(id).unwrap();
        assert_eq!(session.kind, SessionKind::Audio);
        assert_eq!(session.remote_address, addr());
        assert!(session.connected_at >= before && session.connected_at <= Utc::now());
        assert!(session.joined_group.is_none());
    }

    #[tokio::test]
    async fn join_records_the_group() {
        let registry = registry(10);
        let (id, _rx) = registry.register(SessionKind::Control, addr()).unwrap();
        assert!(registry.join_group(id, "ic7100".to_string()));
        assert_eq!(registry.session(id).unwrap().joined_group.as_deref(), Some("ic7100"));
    }
}
