//! Value types shared by the monitor, publisher and detector.

use serde::Serialize;
use time::OffsetDateTime;

/// Cached dimmer state. Equality (and the monitor's change detection) is by
/// `(is_on, brightness_percent)` only — `updated_at_utc` never participates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DimmerState {
    pub is_on: bool,
    pub brightness_percent: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at_utc: OffsetDateTime,
}

impl DimmerState {
    pub fn new(is_on: bool, brightness_percent: u8) -> Self {
        Self {
            is_on,
            brightness_percent,
            updated_at_utc: OffsetDateTime::now_utc(),
        }
    }
}

impl PartialEq for DimmerState {
    fn eq(&self, other: &Self) -> bool {
        self.is_on == other.is_on && self.brightness_percent == other.brightness_percent
    }
}
impl Eq for DimmerState {}

/// One observed transition of the MQTT connection supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct MqttConnectionState {
    pub is_connected: bool,
    pub attempt_number: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at_utc: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionReason {
    ManualPowerOn,
    ManualPowerOff,
    ManualBrightnessAdjustment,
    DeviceDisconnected,
    StatusConfirmationTimeout,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterruptionEvent {
    pub reason: InterruptionReason,
    pub expected_state: Option<DimmerState>,
    pub actual_state: Option<DimmerState>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at_utc: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// MQTT topics (defaults per spec §6.1; all are configurable — see config.rs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DimmerTopics {
    pub power_command: String,
    pub power_status: String,
    pub brightness_command: String,
    pub brightness_status: String,
}

impl Default for DimmerTopics {
    fn default() -> Self {
        Self {
            power_command: "cmnd/dimmer/power".to_string(),
            power_status: "stat/dimmer/POWER".to_string(),
            brightness_command: "cmnd/dimmer/dimmer".to_string(),
            brightness_status: "stat/dimmer/RESULT".to_string(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
