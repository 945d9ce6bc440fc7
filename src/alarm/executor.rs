//! Drives one alarm firing from `Triggered` through to a terminal state:
//! arms interruption detection, runs the brightness ramp, and reacts to
//! whichever finishes first — the ramp completing or a manual interruption.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::dimmer::{CommandPublisher, DimmerState, InterruptionDetector};
use crate::error::{LumiriseError, Result};

use super::machine::AlarmStateMachine;
use super::types::{AlarmDefinition, AlarmState, AlarmTrigger};

pub struct Executor {
    publisher: Arc<CommandPublisher>,
    detector: Arc<InterruptionDetector>,
    /// Guards against two concurrent invocations of the same alarm id.
    lease: Mutex<()>,
}

impl Executor {
    pub fn new(publisher: Arc<CommandPublisher>, detector: Arc<InterruptionDetector>) -> Self {
        Self {
            publisher,
            detector,
            lease: Mutex::new(()),
        }
    }

    /// Runs one firing of `alarm` against `machine`, which must already have
    /// been moved to `Running` by the caller (the `Triggered -> Running`
    /// transition is the caller's to fire, since it's the caller that knows
    /// whether the alarm is enabled and therefore whether `Start` should
    /// happen at all). Returns early with no state change if `alarm` is
    /// disabled. Never panics on a bad device response — errors are folded
    /// into an `Error` transition.
    pub async fn execute(&self, alarm: &AlarmDefinition, machine: &AlarmStateMachine) -> Result<()> {
        if !alarm.enabled {
            return Ok(());
        }

        let Ok(_guard) = self.lease.try_lock() else {
            warn!(alarm_id = %alarm.id, "execution already in flight for this alarm, skipping");
            return Ok(());
        };

        // 1. Running is a precondition, not something execute() arranges —
        // the caller fires Start so that a disabled alarm never transitions
        // at all.
        if machine.current().await != AlarmState::Running {
            return Err(LumiriseError::IllegalTransition {
                state: format!("{:?}", machine.current().await),
                trigger: "Execute (requires Running)".to_string(),
            });
        }

        // 2. Arm interruption detection against the ramp's starting point.
        self.detector
            .set_expected_state(DimmerState::new(true, alarm.start_brightness_percent))
            .await;
        self.detector.enable_detection().await;

        // 3. Subscribe to interruptions before any command goes out, so a
        // manual override during the very first step can't be missed.
        let mut interruptions = self.detector.interruptions();

        // 4. Turn the device on before ramping (idempotent if already on).
        if let Err(e) = self.publisher.turn_on().await {
            warn!(alarm_id = %alarm.id, "turn_on failed: {e}");
        }

        let duration = std::time::Duration::from_secs(alarm.ramp_duration_secs);
        let start = alarm.start_brightness_percent;
        let target = effective_target(start, alarm.target_brightness_percent);

        let detector = self.detector.clone();
        let ramp = self.publisher.ramp_brightness(start, target, duration, move |value| {
            let detector = detector.clone();
            let value = value;
            tokio::spawn(async move {
                detector.set_expected_state(DimmerState::new(true, value)).await;
            });
        });

        // 5/6/7. Race the ramp against an interruption; whichever resolves
        // first decides the terminal transition.
        let outcome = tokio::select! {
            result = ramp => RampOutcome::Finished(result),
            event = interruptions.recv() => RampOutcome::Interrupted(event),
        };

        self.publisher.cancel_current_ramp();

        let result = match outcome {
            RampOutcome::Finished(Ok(true)) => {
                info!(alarm_id = %alarm.id, "ramp completed");
                machine.try_fire(AlarmTrigger::Complete).await;
                Ok(())
            }
            RampOutcome::Finished(Ok(false)) => {
                // Superseded by something else cancelling the ramp generation;
                // treat as an interruption rather than a clean completion.
                machine.try_fire(AlarmTrigger::ManualOverride).await;
                Ok(())
            }
            RampOutcome::Finished(Err(e)) => {
                error!(alarm_id = %alarm.id, "ramp failed: {e}");
                machine.try_fire(AlarmTrigger::Error).await;
                Err(e)
            }
            RampOutcome::Interrupted(Ok(event)) => {
                info!(alarm_id = %alarm.id, reason = ?event.reason, "ramp interrupted");
                machine.try_fire(AlarmTrigger::ManualOverride).await;
                Ok(())
            }
            RampOutcome::Interrupted(Err(_)) => {
                // Lagged or closed channel — not an actionable interruption.
                Ok(())
            }
        };

        // 8. Dispose the interruption subscription before disabling
        // detection/clearing expected state, so a state update racing the
        // teardown can't slip through a half-torn-down detector.
        drop(interruptions);
        self.detector.disable_detection().await;
        self.detector.clear_expected_state().await;

        result.map_err(|_| LumiriseError::TransientBrokerError("ramp execution failed".to_string()))
    }
}

/// A configured target below start isn't a downward ramp — it's a
/// constant-brightness hold at start for the full duration, so the ramp
/// runs from `start` to `start` instead.
fn effective_target(start: u8, target: u8) -> u8 {
    target.max(start)
}

enum RampOutcome {
    Finished(Result<bool>),
    Interrupted(std::result::Result<crate::dimmer::InterruptionEvent, tokio::sync::broadcast::error::RecvError>),
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::types::AlarmState;
    use crate::dimmer::{DimmerTopics, PublisherConfig};
    use crate::mqtt::{MqttSupervisor, SupervisorConfig};

    #[test]
    fn effective_target_clamps_to_start_when_below_it() {
        assert_eq!(effective_target(80, 20), 80);
        assert_eq!(effective_target(20, 80), 80);
        assert_eq!(effective_target(50, 50), 50);
    }

    fn alarm() -> AlarmDefinition {
        AlarmDefinition {
            id: "a1".to_string(),
            name: "test".to_string(),
            cron_expression: "0 7 * * *".to_string(),
            enabled: true,
            start_brightness_percent: 20,
            target_brightness_percent: 30,
            ramp_duration_secs: 1,
        }
    }

    #[tokio::test]
    async fn execute_without_connection_ends_in_failed_state() {
        let mqtt = MqttSupervisor::new(SupervisorConfig::default());
        let publisher = Arc::new(CommandPublisher::new(
            mqtt,
            DimmerTopics::default(),
            PublisherConfig {
                minimum_brightness_percent: 20,
                step_delay: std::time::Duration::from_millis(10),
            },
        ));
        let detector = Arc::new(InterruptionDetector::new());
        let executor = Executor::new(publisher, detector);

        let machine = AlarmStateMachine::new("a1");
        machine.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        machine.fire(AlarmTrigger::Start).await.unwrap();

        let result = executor.execute(&alarm(), &machine).await;
        assert!(result.is_err());
        assert_eq!(machine.current().await, AlarmState::Failed);
    }

    #[tokio::test]
    async fn execute_requires_running_precondition() {
        let mqtt = MqttSupervisor::new(SupervisorConfig::default());
        let publisher = Arc::new(CommandPublisher::new(
            mqtt,
            DimmerTopics::default(),
            PublisherConfig {
                minimum_brightness_percent: 20,
                step_delay: std::time::Duration::from_millis(10),
            },
        ));
        let detector = Arc::new(InterruptionDetector::new());
        let executor = Executor::new(publisher, detector);

        let machine = AlarmStateMachine::new("a1");
        machine.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        // Never fired Start, so still Triggered rather than Running.

        let result = executor.execute(&alarm(), &machine).await;
        assert!(matches!(result, Err(LumiriseError::IllegalTransition { .. })));
        assert_eq!(machine.current().await, AlarmState::Triggered);
    }

    #[tokio::test]
    async fn execute_returns_early_for_disabled_alarm() {
        let mqtt = MqttSupervisor::new(SupervisorConfig::default());
        let publisher = Arc::new(CommandPublisher::new(
            mqtt,
            DimmerTopics::default(),
            PublisherConfig {
                minimum_brightness_percent: 20,
                step_delay: std::time::Duration::from_millis(10),
            },
        ));
        let detector = Arc::new(InterruptionDetector::new());
        let executor = Executor::new(publisher, detector);

        let machine = AlarmStateMachine::new("a1");
        let disabled = AlarmDefinition {
            enabled: false,
            ..alarm()
        };

        let result = executor.execute(&disabled, &machine).await;
        assert!(result.is_ok());
        assert_eq!(machine.current().await, AlarmState::Idle);
    }

    #[tokio::test]
    async fn concurrent_execution_of_same_alarm_is_skipped() {
        let mqtt = MqttSupervisor::new(SupervisorConfig::default());
        let publisher = Arc::new(CommandPublisher::new(
            mqtt,
            DimmerTopics::default(),
            PublisherConfig {
                minimum_brightness_percent: 20,
                step_delay: std::time::Duration::from_millis(10),
            },
        ));
        let detector = Arc::new(InterruptionDetector::new());
        let executor = Arc::new(Executor::new(publisher, detector));

        let machine = Arc::new(AlarmStateMachine::new("a1"));
        machine.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        machine.fire(AlarmTrigger::Start).await.unwrap();

        let _held = executor.lease.lock().await;
        let result = executor.execute(&alarm(), &machine).await;
        assert!(result.is_ok());
        // state untouched because execute() bailed on the lease before touching it
        assert_eq!(machine.current().await, AlarmState::Running);
    }
}
