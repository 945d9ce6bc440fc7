//! Tracks the dimmer's last-known state from its two status topics and
//! fans out a change notification whenever the observed `(is_on,
//! brightness_percent)` pair actually changes.

use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::error::Result;
use crate::mqtt::MqttSupervisor;

use super::types::{DimmerState, DimmerTopics};

const STATE_CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct ResultPayload {
    #[serde(rename = "POWER")]
    power: String,
    #[serde(rename = "Dimmer")]
    dimmer: u8,
}

pub struct DimmerMonitor {
    topics: DimmerTopics,
    state: Mutex<Option<DimmerState>>,
    change_tx: broadcast::Sender<DimmerState>,
}

impl DimmerMonitor {
    pub fn new(topics: DimmerTopics) -> Self {
        let (change_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            topics,
            state: Mutex::new(None),
            change_tx,
        }
    }

    pub fn state_changes(&self) -> broadcast::Receiver<DimmerState> {
        self.change_tx.subscribe()
    }

    pub async fn current(&self) -> Option<DimmerState> {
        *self.state.lock().await
    }

    /// Subscribes to the two configured status topics. Owning this
    /// subscription lifecycle here (rather than leaving it to whoever wires
    /// up the supervisor) keeps the monitor the single place that knows
    /// which topics it cares about.
    pub async fn start(&self, mqtt: &MqttSupervisor) -> Result<()> {
        // Both calls are made regardless of the first's outcome — even while
        // disconnected, subscribe() records the topic so the supervisor
        // resubscribes it automatically once a connection comes up.
        let power = mqtt.subscribe(self.topics.power_status.clone()).await;
        let brightness = mqtt.subscribe(self.topics.brightness_status.clone()).await;
        power?;
        brightness?;
        Ok(())
    }

    pub async fn stop(&self, mqtt: &MqttSupervisor) -> Result<()> {
        let power = mqtt.unsubscribe(self.topics.power_status.clone()).await;
        let brightness = mqtt.unsubscribe(self.topics.brightness_status.clone()).await;
        power?;
        brightness?;
        Ok(())
    }

    /// Feed a raw MQTT message in. No-op if the topic isn't one of the two
    /// dimmer status topics.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.topics.power_status {
            self.handle_power_status(payload).await;
        } else if topic == self.topics.brightness_status {
            self.handle_result_status(payload).await;
        }
    }

    /// Plain-text "ON"/anything-else topic. Brightness carries over from the
    /// cached state (defaulting to 50 if there is none yet); turning off
    /// always forces brightness to 0 in the cache.
    async fn handle_power_status(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload).trim().to_uppercase();
        let is_on = text == "ON";

        let mut guard = self.state.lock().await;
        let prior_brightness = guard.map(|s| s.brightness_percent).unwrap_or(50);
        let brightness = if is_on { prior_brightness } else { 0 };
        self.apply(&mut guard, DimmerState::new(is_on, brightness));
    }

    /// JSON `{"POWER":"ON"/"OFF","Dimmer":0-100}`. Malformed or missing
    /// fields are logged and discarded without touching the cached state.
    async fn handle_result_status(&self, payload: &[u8]) {
        let parsed: ResultPayload = match serde_json::from_slice(payload) {
            Ok(p) => p,
            Err(e) => {
                warn!("malformed dimmer result payload, discarding: {e}");
                return;
            }
        };

        let is_on = parsed.power.trim().eq_ignore_ascii_case("ON");
        let brightness = parsed.dimmer.min(100);

        let mut guard = self.state.lock().await;
        self.apply(&mut guard, DimmerState::new(is_on, brightness));
    }

    fn apply(&self, guard: &mut Option<DimmerState>, next: DimmerState) {
        let changed = guard.as_ref() != Some(&next);
        *guard = Some(next);
        if changed {
            let _ = self.change_tx.send(next);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
