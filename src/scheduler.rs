//! Reconciler/timer: re-lists enabled alarm schedules every tick, matches
//! each one's cron expression against the current wall-clock minute, and
//! fires any that match.
//!
//! This is deliberately not a generalized job scheduler — no one-off jobs,
//! no retries, no priorities. It's the thin timer that calls into the
//! alarm executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alarm::{AlarmStateMachine, AlarmTrigger, Executor};
use crate::db::Db;
use crate::state::SharedState;

/// How often the scheduler re-lists alarms and checks for a cron match.
const TICK_INTERVAL_SEC: u64 = 30;

pub async fn run(db: Db, executor: Arc<Executor>, shared: SharedState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SEC));
    let mut last_fired_minute: HashMap<String, i64> = HashMap::new();
    let mut leases: HashMap<String, Arc<Mutex<()>>> = HashMap::new();

    info!(tick_sec = TICK_INTERVAL_SEC, "alarm scheduler started");
    {
        let mut st = shared.write().await;
        st.record_system("alarm scheduler started".to_string());
    }

    loop {
        ticker.tick().await;

        let alarms = match db.list_enabled_alarms().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("scheduler: list_enabled_alarms failed: {e}");
                continue;
            }
        };

        let now = OffsetDateTime::now_utc();
        let current_minute = now.unix_timestamp() / 60;

        for schedule in alarms {
            if !cron_matches(&schedule.cron_expression, now) {
                continue;
            }
            if last_fired_minute.get(&schedule.id) == Some(&current_minute) {
                continue;
            }
            last_fired_minute.insert(schedule.id.clone(), current_minute);

            let lease = leases
                .entry(schedule.id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();

            let alarm_id = schedule.id.clone();
            let db = db.clone();
            let executor = executor.clone();
            let shared = shared.clone();

            tokio::spawn(async move {
                let Ok(_guard) = lease.try_lock() else {
                    warn!(alarm_id = %alarm_id, "previous firing still running — skipping this tick");
                    return;
                };

                let definition = match db.resolve_alarm(&alarm_id).await {
                    Ok(Some(def)) => def,
                    Ok(None) => {
                        warn!(alarm_id = %alarm_id, "alarm disappeared before firing");
                        return;
                    }
                    Err(e) => {
                        error!(alarm_id = %alarm_id, "resolve_alarm failed: {e}");
                        return;
                    }
                };

                let machine = AlarmStateMachine::new(alarm_id.clone());
                if let Err(e) = machine.fire(AlarmTrigger::SchedulerTrigger).await {
                    error!(alarm_id = %alarm_id, "failed to enter triggered state: {e}");
                    return;
                }
                if definition.enabled {
                    if let Err(e) = machine.fire(AlarmTrigger::Start).await {
                        error!(alarm_id = %alarm_id, "failed to enter running state: {e}");
                        return;
                    }
                }

                {
                    let mut st = shared.write().await;
                    st.record_alarm(format!("alarm '{}' triggered", definition.name));
                }

                if let Err(e) = executor.execute(&definition, &machine).await {
                    error!(alarm_id = %alarm_id, "execution failed: {e}");
                    let mut st = shared.write().await;
                    st.record_error(format!("alarm '{}' failed: {e}", definition.name));
                }
            });
        }
    }
}

/// Matches a 5-field cron expression (`minute hour day-of-month month
/// day-of-week`) against a UTC timestamp. Supports `*` and comma-separated
/// lists; day-of-week follows cron's 0=Sunday convention.
fn cron_matches(expr: &str, now: OffsetDateTime) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        warn!(expr, "malformed cron expression, ignoring");
        return false;
    }

    let minute = now.minute() as i64;
    let hour = now.hour() as i64;
    let day = now.day() as i64;
    let month = now.month() as i64;
    let weekday = now.weekday().number_days_from_sunday() as i64;

    field_matches(fields[0], minute)
        && field_matches(fields[1], hour)
        && field_matches(fields[2], day)
        && field_matches(fields[3], month)
        && field_matches(fields[4], weekday)
}

fn field_matches(field: &str, value: i64) -> bool {
    if field == "*" {
        return true;
    }
    field
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .any(|candidate| candidate == value)
}

// ===========================================================================
// Tests
// ===========================================================================
