//! Issues commands to the dimmer over MQTT: on/off, direct brightness
//! (subject to a minimum-brightness safety floor) and linear brightness
//! ramps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::mqtt::MqttSupervisor;

use super::types::DimmerTopics;

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    pub minimum_brightness_percent: u8,
    pub step_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            minimum_brightness_percent: 20,
            step_delay: Duration::from_millis(100),
        }
    }
}

/// Monotonically increasing token handed out by [`CommandPublisher::ramp_brightness`];
/// cancelling a ramp means bumping this past the token the in-flight ramp
/// was issued.
pub struct CommandPublisher {
    mqtt: MqttSupervisor,
    topics: DimmerTopics,
    config: PublisherConfig,
    lock: Mutex<()>,
    ramp_generation: Arc<AtomicU64>,
}

impl CommandPublisher {
    pub fn new(mqtt: MqttSupervisor, topics: DimmerTopics, config: PublisherConfig) -> Self {
        Self {
            mqtt,
            topics,
            config,
            lock: Mutex::new(()),
            ramp_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn turn_on(&self) -> Result<()> {
        // Cancellation is a lock-free atomic bump so it always lands
        // immediately, even while a ramp holds `lock` for its full run —
        // otherwise this call would sit behind the very ramp it's meant to
        // interrupt.
        self.cancel_ramp();
        let _guard = self.lock.lock().await;
        self.mqtt
            .publish(self.topics.power_command.clone(), b"{\"POWER\":\"ON\"}".to_vec())
            .await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.cancel_ramp();
        let _guard = self.lock.lock().await;
        self.mqtt
            .publish(self.topics.power_command.clone(), b"{\"POWER\":\"OFF\"}".to_vec())
            .await
    }

    /// Below `minimum_brightness_percent` this redirects to [`Self::turn_off`]
    /// and nothing is published on the brightness topic.
    pub async fn set_brightness(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        if percent < self.config.minimum_brightness_percent {
            return self.turn_off().await;
        }

        self.cancel_ramp();
        let _guard = self.lock.lock().await;
        self.mqtt
            .publish(self.topics.brightness_command.clone(), percent.to_string().into_bytes())
            .await
    }

    /// Cancels any ramp currently in flight. Safe to call with none running.
    pub fn cancel_current_ramp(&self) {
        self.cancel_ramp();
    }

    fn cancel_ramp(&self) {
        self.ramp_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Steps brightness linearly from `start` to `target` over `duration`,
    /// sending a command only when the commanded value actually changes from
    /// the previous step, and sleeping `step_delay` between steps (not after
    /// the last one). `on_progress` is invoked with each brightness value
    /// actually sent. Returns `Ok(true)` if the ramp completed, `Ok(false)`
    /// if cancelled (superseded by a later call to any publisher method).
    ///
    /// Holds the publisher's lock for the entire run, not just the
    /// generation bump — a concurrent `turn_on`/`turn_off`/`set_brightness`
    /// still cancels it instantly (the generation counter is a lock-free
    /// atomic) but its own publish waits in line behind whatever this ramp
    /// is still sending.
    pub async fn ramp_brightness(
        &self,
        start: u8,
        target: u8,
        duration: Duration,
        mut on_progress: impl FnMut(u8),
    ) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let generation = self.ramp_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let steps = ramp_step_count(duration, self.config.step_delay);
        let mut last_sent: Option<u8> = None;

        for k in 0..steps {
            if self.ramp_generation.load(Ordering::SeqCst) != generation {
                return Ok(false);
            }

            let value = ramp_value_at_step(start, target, k, steps);
            if Some(value) != last_sent {
                self.publish_ramp_step(value).await?;
                on_progress(value);
                last_sent = Some(value);
            }

            if k + 1 < steps {
                tokio::time::sleep(self.config.step_delay).await;
            }
        }

        if self.ramp_generation.load(Ordering::SeqCst) != generation {
            return Ok(false);
        }

        if last_sent != Some(target) {
            self.publish_ramp_step(target).await?;
            on_progress(target);
        }

        Ok(true)
    }

    async fn publish_ramp_step(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        if percent < self.config.minimum_brightness_percent {
            self.mqtt
                .publish(self.topics.power_command.clone(), b"{\"POWER\":\"OFF\"}".to_vec())
                .await
        } else {
            self.mqtt
                .publish(self.topics.brightness_command.clone(), percent.to_string().into_bytes())
                .await
        }
    }
}

/// `N = max(1, ceil(duration / step_delay))`.
fn ramp_step_count(duration: Duration, step_delay: Duration) -> u32 {
    if step_delay.is_zero() {
        return 1;
    }
    let n = (duration.as_secs_f64() / step_delay.as_secs_f64()).ceil() as i64;
    n.max(1) as u32
}

/// `brightness(k) = round(start + (target-start) * k/(N-1))`, clamped to
/// `[0,100]`. When `N == 1` the single step is the target value.
fn ramp_value_at_step(start: u8, target: u8, k: u32, steps: u32) -> u8 {
    if steps <= 1 {
        return target.min(100);
    }
    let fraction = k as f64 / (steps - 1) as f64;
    let value = start as f64 + (target as f64 - start as f64) * fraction;
    value.round().clamp(0.0, 100.0) as u8
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_count_rounds_up() {
        assert_eq!(ramp_step_count(Duration::from_secs(10), Duration::from_secs(3)), 4);
        assert_eq!(ramp_step_count(Duration::from_secs(9), Duration::from_secs(3)), 3);
    }

    #[test]
    fn step_count_minimum_is_one() {
        assert_eq!(ramp_step_count(Duration::from_millis(1), Duration::from_secs(3)), 1);
    }

    #[test]
    fn ramp_value_endpoints_match_start_and_target() {
        let steps = 5;
        assert_eq!(ramp_value_at_step(20, 80, 0, steps), 20);
        assert_eq!(ramp_value_at_step(20, 80, steps - 1, steps), 80);
    }

    #[test]
    fn ramp_value_single_step_is_target() {
        assert_eq!(ramp_value_at_step(20, 80, 0, 1), 80);
    }

    #[test]
    fn ramp_value_is_monotonic_increasing() {
        let steps = 6;
        let mut last = -1.0;
        for k in 0..steps {
            let v = ramp_value_at_step(10, 90, k, steps) as f64;
            assert!(v >= last);
            last = v;
        }
    }

    #[tokio::test]
    async fn set_brightness_below_minimum_turns_off_instead() {
        let mqtt = MqttSupervisor::new(crate::mqtt::SupervisorConfig::default());
        let publisher = CommandPublisher::new(mqtt.clone(), DimmerTopics::default(), PublisherConfig::default());

        let mut rx = mqtt.message_received();
        let result = publisher.set_brightness(5).await;
        assert!(result.is_err(), "not connected in test, so publish itself errors");
        assert!(rx.try_recv().is_err());
    }
}
