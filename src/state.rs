//! In-memory system state for the live web dashboard: MQTT connection
//! status, the cached dimmer state, and a capped event ring buffer.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::dimmer::DimmerState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

pub type SharedState = Arc<RwLock<SystemState>>;

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub dimmer: Option<DimmerState>,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Dimmer,
    Alarm,
    Interruption,
    Error,
    System,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub dimmer: Option<DimmerState>,
    pub events: Vec<SystemEvent>,
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            dimmer: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record_dimmer(&mut self, state: DimmerState) {
        let detail = format!(
            "dimmer now {} at {}%",
            if state.is_on { "on" } else { "off" },
            state.brightness_percent
        );
        self.dimmer = Some(state);
        self.push_event(EventKind::Dimmer, detail);
    }

    pub fn record_alarm(&mut self, detail: String) {
        self.push_event(EventKind::Alarm, detail);
    }

    pub fn record_interruption(&mut self, detail: String) {
        self.push_event(EventKind::Interruption, detail);
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            dimmer: self.dimmer,
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
    fn new_starts_disconnected_with_no_dimmer_state() {
        let st = SystemState::new();
        assert!(!st.mqtt_connected);
        assert!(st.dimmer.is_none());
        assert!(st.events.is_empty());
    }

    #[test]
    fn record_dimmer_updates_cache_and_event() {
        let mut st = SystemState::new();
        st.record_dimmer(DimmerState::new(true, 75));

        assert_eq!(st.dimmer.unwrap().brightness_percent, 75);
        assert_eq!(st.events.len(), 1);
        assert!(matches!(st.events[0].kind, EventKind::Dimmer));
        assert_eq!(st.events[0].detail, "dimmer now on at 75%");
    }

    #[test]
    fn record_alarm_and_interruption_events() {
        let mut st = SystemState::new();
        st.record_alarm("alarm a1 triggered".to_string());
        st.record_interruption("manual power off detected".to_string());

        assert_eq!(st.events.len(), 2);
        assert!(matches!(st.events[0].kind, EventKind::Alarm));
        assert!(matches!(st.events[1].kind, EventKind::Interruption));
    }

    #[test]
    fn event_ring_buffer_caps_at_max() {
        let mut st = SystemState::new();
        for i in 0..MAX_EVENTS + 50 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
    }

    #[test]
    fn event_ring_buffer_evicts_oldest() {
        let mut st = SystemState::new();
        for i in 0..MAX_EVENTS + 10 {
            st.record_system(format!("event {i}"));
        }
        assert_eq!(st.events.front().unwrap().detail, "event 10");
        assert_eq!(st.events.back().unwrap().detail, format!("event {}", MAX_EVENTS + 9));
    }

    #[test]
    fn to_status_returns_events_in_reverse_order() {
        let mut st = SystemState::new();
        st.record_system("first".to_string());
        st.record_system("second".to_string());
        st.record_system("third".to_string());

        let status = st.to_status();
        assert_eq!(status.events[0].detail, "third");
        assert_eq!(status.events[1].detail, "second");
        assert_eq!(status.events[2].detail, "first");
    }

    #[test]
    fn to_status_reflects_mqtt_connected() {
        let mut st = SystemState::new();
        assert!(!st.to_status().mqtt_connected);
        st.mqtt_connected = true;
        assert!(st.to_status().mqtt_connected);
    }

    #[test]
    fn to_status_uptime_is_non_negative() {
        let st = SystemState::new();
        assert!(st.to_status().uptime_secs < 2);
    }

    #[test]
    fn to_status_serializes_to_json() {
        let mut st = SystemState::new();
        st.record_dimmer(DimmerState::new(true, 50));

        let status = st.to_status();
        let json = serde_json::to_value(&status).expect("should serialize");

        assert!(json["uptime_secs"].is_u64());
        assert!(json["mqtt_connected"].is_boolean());
        assert!(json["dimmer"].is_object());
        assert!(json["events"].is_array());
    }
}
