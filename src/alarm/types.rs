//! Value types for the alarm scheduling and execution pipeline.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A stored wake-up alarm. Fields mirror the `alarm_schedules` table plus
/// the profile it resolves to. Brightness/duration ranges are normalized by
/// [`crate::db::Db::resolve_alarm`] (via its ramp profile sanitization) on
/// the way here, so this type carries no separate validation of its own —
/// `start_brightness_percent > target_brightness_percent` in particular is
/// a legitimate constant-brightness hold, not an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmDefinition {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub start_brightness_percent: u8,
    pub target_brightness_percent: u8,
    pub ramp_duration_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Idle,
    Triggered,
    Running,
    Interrupted,
    Completed,
    Failed,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmTrigger {
    SchedulerTrigger,
    Start,
    Cancel,
    ManualOverride,
    Complete,
    Error,
    Reset,
    Pause,
    Resume,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlarmStateTransition {
    pub alarm_id: String,
    pub from: AlarmState,
    pub to: AlarmState,
    pub trigger: AlarmTrigger,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at_utc: OffsetDateTime,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn def() -> AlarmDefinition {
        AlarmDefinition {
            id: "a1".to_string(),
            name: "Morning".to_string(),
            cron_expression: "0 7 * * *".to_string(),
            enabled: true,
            start_brightness_percent: 20,
            target_brightness_percent: 80,
            ramp_duration_secs: 600,
        }
    }

    #[test]
    fn definition_is_plain_data() {
        let d = def();
        assert_eq!(d.id, "a1");
        assert!(d.enabled);
    }
}
