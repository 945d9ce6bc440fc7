//! Flags dimmer state changes that didn't originate from a command this
//! process issued — someone flipped the switch, or twisted the physical
//! dial, while an alarm ramp was "in charge" of the device.

use tokio::sync::{broadcast, Mutex};
use time::OffsetDateTime;

use super::types::{DimmerState, InterruptionEvent, InterruptionReason};

const INTERRUPTION_CAPACITY: usize = 32;

/// Actual vs expected brightness must differ by more than this to count as a
/// manual adjustment rather than rounding noise from a ramp step.
const BRIGHTNESS_TOLERANCE: u8 = 2;

struct Inner {
    enabled: bool,
    expected: Option<DimmerState>,
}

pub struct InterruptionDetector {
    inner: Mutex<Inner>,
    tx: broadcast::Sender<InterruptionEvent>,
}

impl InterruptionDetector {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(INTERRUPTION_CAPACITY);
        Self {
            inner: Mutex::new(Inner {
                enabled: false,
                expected: None,
            }),
            tx,
        }
    }

    pub fn interruptions(&self) -> broadcast::Receiver<InterruptionEvent> {
        self.tx.subscribe()
    }

    pub async fn enable_detection(&self) {
        self.inner.lock().await.enabled = true;
    }

    pub async fn disable_detection(&self) {
        self.inner.lock().await.enabled = false;
    }

    pub async fn set_expected_state(&self, state: DimmerState) {
        self.inner.lock().await.expected = Some(state);
    }

    pub async fn clear_expected_state(&self) {
        self.inner.lock().await.expected = None;
    }

    /// Classify an observed state against the currently expected state, in
    /// order: manual-off, manual-brightness-adjustment, manual-on. No-op if
    /// detection is disabled or there's no expected state set.
    pub async fn observe(&self, actual: DimmerState) {
        let expected = {
            let inner = self.inner.lock().await;
            if !inner.enabled {
                return;
            }
            match inner.expected {
                Some(e) => e,
                None => return,
            }
        };

        let reason = classify(&expected, &actual);
        if let Some(reason) = reason {
            let event = InterruptionEvent {
                reason,
                expected_state: Some(expected),
                actual_state: Some(actual),
                message: describe(reason, &expected, &actual),
                detected_at_utc: OffsetDateTime::now_utc(),
            };
            let _ = self.tx.send(event);
        }
    }

    /// Separate entry point for interruptions that aren't a state
    /// comparison (broker link lost, status confirmation timeout).
    pub async fn report(&self, reason: InterruptionReason, message: impl Into<String>) {
        let enabled = self.inner.lock().await.enabled;
        if !enabled {
            return;
        }
        let event = InterruptionEvent {
            reason,
            expected_state: None,
            actual_state: None,
            message: message.into(),
            detected_at_utc: OffsetDateTime::now_utc(),
        };
        let _ = self.tx.send(event);
    }
}

impl Default for InterruptionDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn classify(expected: &DimmerState, actual: &DimmerState) -> Option<InterruptionReason> {
    if expected.is_on && !actual.is_on {
        return Some(InterruptionReason::ManualPowerOff);
    }
    if expected.is_on
        && actual.is_on
        && expected.brightness_percent.abs_diff(actual.brightness_percent) > BRIGHTNESS_TOLERANCE
    {
        return Some(InterruptionReason::ManualBrightnessAdjustment);
    }
    if !expected.is_on && actual.is_on {
        return Some(InterruptionReason::ManualPowerOn);
    }
    None
}

fn describe(reason: InterruptionReason, expected: &DimmerState, actual: &DimmerState) -> String {
    match reason {
        InterruptionReason::ManualPowerOff => "dimmer was on but is now reporting off".to_string(),
        InterruptionReason::ManualBrightnessAdjustment => format!(
            "brightness diverged from expected {} to actual {}",
            expected.brightness_percent, actual.brightness_percent
        ),
        InterruptionReason::ManualPowerOn => "dimmer was expected off but is now on".to_string(),
        InterruptionReason::DeviceDisconnected => "device connection lost".to_string(),
        InterruptionReason::StatusConfirmationTimeout => "status confirmation timed out".to_string(),
        InterruptionReason::Unknown => "unrecognized interruption".to_string(),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_event_when_detection_disabled() {
        let detector = InterruptionDetector::new();
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        let mut rx = detector.interruptions();
        detector.observe(DimmerState::new(false, 50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn no_event_when_expected_state_unset() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        let mut rx = detector.interruptions();
        detector.observe(DimmerState::new(false, 50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn manual_power_off_detected() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(false, 0)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, InterruptionReason::ManualPowerOff);
    }

    #[tokio::test]
    async fn manual_power_on_detected() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(false, 0)).await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(true, 50)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, InterruptionReason::ManualPowerOn);
    }

    #[tokio::test]
    async fn manual_brightness_adjustment_detected_beyond_tolerance() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(true, 60)).await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, InterruptionReason::ManualBrightnessAdjustment);
    }

    #[tokio::test]
    async fn small_brightness_drift_within_tolerance_is_ignored() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(true, 52)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn matching_state_produces_no_event() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(true, 50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn clear_expected_state_suppresses_future_events() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        detector.set_expected_state(DimmerState::new(true, 50)).await;
        detector.clear_expected_state().await;
        let mut rx = detector.interruptions();

        detector.observe(DimmerState::new(false, 0)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn report_emits_directly_when_enabled() {
        let detector = InterruptionDetector::new();
        detector.enable_detection().await;
        let mut rx = detector.interruptions();

        detector
            .report(InterruptionReason::StatusConfirmationTimeout, "timed out waiting")
            .await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.reason, InterruptionReason::StatusConfirmationTimeout);
    }
}
