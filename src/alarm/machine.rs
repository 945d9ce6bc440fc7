//! Table-driven state machine for a single alarm's lifecycle.

use std::sync::Mutex as StdMutex;

use tokio::sync::{broadcast, Mutex};
use time::OffsetDateTime;
use tracing::warn;

use crate::error::{LumiriseError, Result};

use super::types::{AlarmState, AlarmStateTransition, AlarmTrigger};

const TRANSITION_CAPACITY: usize = 32;

fn permitted_target(state: AlarmState, trigger: AlarmTrigger) -> Option<AlarmState> {
    use AlarmState::*;
    use AlarmTrigger::*;
    match (state, trigger) {
        (Idle, SchedulerTrigger) => Some(Triggered),
        (Idle, Pause) => Some(Paused),
        (Triggered, Start) => Some(Running),
        (Triggered, Cancel) => Some(Idle),
        (Running, ManualOverride) => Some(Interrupted),
        (Running, Complete) => Some(Completed),
        (Running, Error) => Some(Failed),
        (Interrupted, Reset) => Some(Idle),
        (Completed, Reset) => Some(Idle),
        (Failed, Reset) => Some(Idle),
        (Paused, Resume) => Some(Idle),
        _ => None,
    }
}

pub struct AlarmStateMachine {
    alarm_id: String,
    state: Mutex<AlarmState>,
    tx: StdMutex<Option<broadcast::Sender<AlarmStateTransition>>>,
}

impl AlarmStateMachine {
    pub fn new(alarm_id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            alarm_id: alarm_id.into(),
            state: Mutex::new(AlarmState::Idle),
            tx: StdMutex::new(Some(tx)),
        }
    }

    /// Subscribes to this machine's transition stream. `None` once
    /// `dispose()` has been called.
    pub fn state_transitions(&self) -> Option<broadcast::Receiver<AlarmStateTransition>> {
        self.tx.lock().unwrap().as_ref().map(|tx| tx.subscribe())
    }

    pub async fn current(&self) -> AlarmState {
        *self.state.lock().await
    }

    pub async fn permitted_triggers(&self) -> Vec<AlarmTrigger> {
        let current = *self.state.lock().await;
        ALL_TRIGGERS
            .iter()
            .copied()
            .filter(|t| permitted_target(current, *t).is_some())
            .collect()
    }

    pub async fn can_fire(&self, trigger: AlarmTrigger) -> bool {
        let current = *self.state.lock().await;
        permitted_target(current, trigger).is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.tx.lock().unwrap().is_none()
    }

    /// Closes the transition stream and makes every subsequent `fire`/
    /// `try_fire` call fail with `ObjectDisposed`. Idempotent.
    pub fn dispose(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Fails with `ObjectDisposed` once `dispose()` has been called, or with
    /// `IllegalTransition` if `trigger` isn't valid from the current state.
    pub async fn fire(&self, trigger: AlarmTrigger) -> Result<AlarmState> {
        if self.is_disposed() {
            return Err(LumiriseError::ObjectDisposed);
        }

        let mut state = self.state.lock().await;
        match permitted_target(*state, trigger) {
            Some(next) => {
                let from = *state;
                *state = next;
                drop(state);
                self.emit(from, next, trigger);
                Ok(next)
            }
            None => Err(LumiriseError::IllegalTransition {
                state: format!("{:?}", *state),
                trigger: format!("{:?}", trigger),
            }),
        }
    }

    /// Like `fire`, but an illegal transition (or a disposed machine) is
    /// logged and treated as a no-op instead of erroring — used by callers
    /// that can race with another path already having moved the state (e.g.
    /// an interruption firing concurrently with completion).
    pub async fn try_fire(&self, trigger: AlarmTrigger) -> AlarmState {
        if self.is_disposed() {
            warn!(alarm_id = %self.alarm_id, trigger = ?trigger, "ignoring fire on disposed machine");
            return *self.state.lock().await;
        }

        let mut state = self.state.lock().await;
        match permitted_target(*state, trigger) {
            Some(next) => {
                let from = *state;
                *state = next;
                drop(state);
                self.emit(from, next, trigger);
                next
            }
            None => {
                warn!(
                    alarm_id = %self.alarm_id,
                    state = ?*state,
                    trigger = ?trigger,
                    "ignoring illegal transition"
                );
                *state
            }
        }
    }

    fn emit(&self, from: AlarmState, to: AlarmState, trigger: AlarmTrigger) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(AlarmStateTransition {
                alarm_id: self.alarm_id.clone(),
                from,
                to,
                trigger,
                occurred_at_utc: OffsetDateTime::now_utc(),
            });
        }
    }
}

const ALL_TRIGGERS: [AlarmTrigger; 9] = [
    AlarmTrigger::SchedulerTrigger,
    AlarmTrigger::Start,
    AlarmTrigger::Cancel,
    AlarmTrigger::ManualOverride,
    AlarmTrigger::Complete,
    AlarmTrigger::Error,
    AlarmTrigger::Reset,
    AlarmTrigger::Pause,
    AlarmTrigger::Resume,
];

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_to_triggered_to_running_to_completed_to_idle() {
        let m = AlarmStateMachine::new("a1");
        assert_eq!(m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap(), AlarmState::Triggered);
        assert_eq!(m.fire(AlarmTrigger::Start).await.unwrap(), AlarmState::Running);
        assert_eq!(m.fire(AlarmTrigger::Complete).await.unwrap(), AlarmState::Completed);
        assert_eq!(m.fire(AlarmTrigger::Reset).await.unwrap(), AlarmState::Idle);
    }

    #[tokio::test]
    async fn running_to_interrupted_via_manual_override() {
        let m = AlarmStateMachine::new("a1");
        m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        m.fire(AlarmTrigger::Start).await.unwrap();
        assert_eq!(m.fire(AlarmTrigger::ManualOverride).await.unwrap(), AlarmState::Interrupted);
        assert_eq!(m.fire(AlarmTrigger::Reset).await.unwrap(), AlarmState::Idle);
    }

    #[tokio::test]
    async fn running_to_failed_via_error() {
        let m = AlarmStateMachine::new("a1");
        m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        m.fire(AlarmTrigger::Start).await.unwrap();
        assert_eq!(m.fire(AlarmTrigger::Error).await.unwrap(), AlarmState::Failed);
    }

    #[tokio::test]
    async fn triggered_to_idle_via_cancel() {
        let m = AlarmStateMachine::new("a1");
        m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        assert_eq!(m.fire(AlarmTrigger::Cancel).await.unwrap(), AlarmState::Idle);
    }

    #[tokio::test]
    async fn idle_pause_and_resume() {
        let m = AlarmStateMachine::new("a1");
        assert_eq!(m.fire(AlarmTrigger::Pause).await.unwrap(), AlarmState::Paused);
        assert_eq!(m.fire(AlarmTrigger::Resume).await.unwrap(), AlarmState::Idle);
    }

    #[tokio::test]
    async fn illegal_transition_errors_and_state_unchanged() {
        let m = AlarmStateMachine::new("a1");
        let result = m.fire(AlarmTrigger::Complete).await;
        assert!(result.is_err());
        assert_eq!(m.current().await, AlarmState::Idle);
    }

    #[tokio::test]
    async fn try_fire_is_noop_on_illegal_transition() {
        let m = AlarmStateMachine::new("a1");
        let state = m.try_fire(AlarmTrigger::Complete).await;
        assert_eq!(state, AlarmState::Idle);
    }

    #[tokio::test]
    async fn permitted_triggers_from_running() {
        let m = AlarmStateMachine::new("a1");
        m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        m.fire(AlarmTrigger::Start).await.unwrap();
        let permitted = m.permitted_triggers().await;
        assert!(permitted.contains(&AlarmTrigger::ManualOverride));
        assert!(permitted.contains(&AlarmTrigger::Complete));
        assert!(permitted.contains(&AlarmTrigger::Error));
        assert_eq!(permitted.len(), 3);
    }

    #[tokio::test]
    async fn state_transitions_stream_emits_on_fire() {
        let m = AlarmStateMachine::new("a1");
        let mut rx = m.state_transitions().unwrap();
        m.fire(AlarmTrigger::SchedulerTrigger).await.unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, AlarmState::Idle);
        assert_eq!(event.to, AlarmState::Triggered);
        assert_eq!(event.trigger, AlarmTrigger::SchedulerTrigger);
    }

    #[tokio::test]
    async fn can_fire_reflects_current_state() {
        let m = AlarmStateMachine::new("a1");
        assert!(m.can_fire(AlarmTrigger::SchedulerTrigger).await);
        assert!(!m.can_fire(AlarmTrigger::Start).await);
    }

    #[tokio::test]
    async fn dispose_closes_stream_and_fails_further_fires() {
        let m = AlarmStateMachine::new("a1");
        assert!(!m.is_disposed());

        m.dispose();

        assert!(m.is_disposed());
        assert!(m.state_transitions().is_none());
        assert!(matches!(
            m.fire(AlarmTrigger::SchedulerTrigger).await,
            Err(LumiriseError::ObjectDisposed)
        ));
    }

    #[tokio::test]
    async fn try_fire_is_noop_on_disposed_machine() {
        let m = AlarmStateMachine::new("a1");
        m.dispose();
        let state = m.try_fire(AlarmTrigger::SchedulerTrigger).await;
        assert_eq!(state, AlarmState::Idle);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let m = AlarmStateMachine::new("a1");
        m.dispose();
        m.dispose();
        assert!(m.is_disposed());
    }
}
