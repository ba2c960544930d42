use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;

use crate::broker::ConnectionState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Error,
    System,
    Scheduler,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub broker: ConnectionState,
    pub subscribed_topics: Vec<String>,
    pub series: Vec<String>,
    pub live_listeners: usize,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a broker connection-state transition.
    pub fn record_broker(&mut self, state: ConnectionState) {
        let kind = if state == ConnectionState::Error {
            EventKind::Error
        } else {
            EventKind::System
        };
        self.push_event(kind, format!("broker {state}"));
    }

    /// Record a command published to a device.
    pub fn record_command(&mut self, device_id: &str, topic: &str, payload: &str) {
        self.push_event(
            EventKind::Command,
            format!("{device_id}: '{payload}' -> {topic}"),
        );
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Record a schedule-engine event.
    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Build the JSON-serialisable status snapshot, newest events first.
    pub fn to_status(
        &self,
        broker: ConnectionState,
        subscribed_topics: Vec<String>,
        series: Vec<String>,
        live_listeners: usize,
    ) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            broker,
            subscribed_topics,
            series,
            live_listeners,
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 25) {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "event 25");
    }

    #[test]
    fn status_lists_newest_event_first() {
        let mut st = SystemState::new();
        st.record_system("first".into());
        st.record_command("pump-1", "device/1/status", "1");

        let status = st.to_status(ConnectionState::Connected, vec![], vec![], 0);
        assert_eq!(status.events[0].kind, EventKind::Command);
        assert_eq!(status.events[0].detail, "pump-1: '1' -> device/1/status");
        assert_eq!(status.events[1].detail, "first");
    }

    #[test]
    fn broker_error_recorded_as_error() {
        let mut st = SystemState::new();
        st.record_broker(ConnectionState::Error);
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
        assert_eq!(st.events.back().unwrap().detail, "broker error");
    }
}
