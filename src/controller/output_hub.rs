use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use uuid::Uuid;

/// One message on a session's streaming topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    Stdout {
        command_id: String,
        data: String,
    },
    Stderr {
        command_id: String,
        data: String,
    },
    Exit {
        command_id: String,
        exit_status: i32,
        duration_ms: u64,
    },
    Error {
        command_id: String,
        message: String,
    },
}

/// Topic-per-session fan-out of command output.
///
/// Topics are created by the first subscriber and closed when the session goes away; closing
/// drops the sender, which ends every subscriber's stream.
pub struct OutputHub {
    capacity: usize,
    topics: Mutex<HashMap<Uuid, broadcast::Sender<StreamFrame>>>,
}

impl OutputHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<StreamFrame> {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Sends `frame` to the session's subscribers. Returns how many received it; frames for a
    /// topic nobody listens to are dropped.
    pub fn publish(&self, session_id: Uuid, frame: StreamFrame) -> usize {
        let topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        match topics.get(&session_id) {
            Some(sender) => sender.send(frame).unwrap_or(0),
            None => 0,
        }
    }

    pub fn close(&self, session_id: Uuid) {
        let removed = self
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        if removed.is_some() {
            debug!("Closed output topic of session {}", session_id);
        }
    }

    pub fn close_all(&self) {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn topic_count(&self) -> usize {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
