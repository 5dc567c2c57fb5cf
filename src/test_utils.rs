//! Test doubles shared by the unit tests.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::protocol::ServerEvent;
use crate::registry::{Broadcaster, RelayEvent, SessionId};

/// Broadcaster that records everything published to it.
#[derive(Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<RelayEvent>>,
    replies: Mutex<Vec<(SessionId, ServerEvent)>>,
    notify: Notify,
}

impl RecordingBroadcaster {
    pub fn events(&self) -> Vec<RelayEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn json_events(&self) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RelayEvent::Json(event) => Some(serde_json::to_value(event).unwrap()),
                RelayEvent::Audio(_) => None,
            })
            .collect()
    }

    pub fn replies(&self) -> Vec<(SessionId, ServerEvent)> {
        self.replies.lock().unwrap().clone()
    }

    /// Wait until `done` holds for the recorded JSON events, or panic.
    pub async fn wait_for_json<F>(&self, timeout: Duration, done: F)
    where
        F: Fn(&[serde_json::Value]) -> bool,
    {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if done(&self.json_events()) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("condition not met, events: {:?}", self.json_events()));
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, event: RelayEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }

    fn send_to(&self, session: SessionId, event: ServerEvent) {
        self.replies.lock().unwrap().push((session, event));
        self.notify.notify_waiters();
    }
}
