//! REST surface: health/status read endpoints plus CRUD over ramp profiles
//! and alarm schedules, and a manual trigger hook. No auth, no pagination —
//! this is a single-operator LAN service, not a multi-tenant API.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::alarm::{AlarmStateMachine, AlarmTrigger, Executor};
use crate::db::{AlarmSchedule, Db, RampProfile};
use crate::dimmer::DimmerMonitor;
use crate::mqtt::MqttSupervisor;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub mqtt: MqttSupervisor,
    pub monitor: Arc<DimmerMonitor>,
    pub executor: Arc<Executor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/status", get(api_status))
        .route("/api/alarms", get(list_alarms).post(create_alarm))
        .route(
            "/api/alarms/{id}",
            get(get_alarm).put(update_alarm).delete(delete_alarm),
        )
        .route("/api/alarms/{id}/trigger", post(trigger_alarm))
        .route("/api/ramp-profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/ramp-profiles/{id}",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .with_state(state)
}

pub async fn serve(state: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind web port");

    info!(%addr, "rest api listening");
    axum::serve(listener, router(state))
        .await
        .expect("web server error");
}

fn err_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

// ---------------------------------------------------------------------------
// Health / status
// ---------------------------------------------------------------------------

/// Liveness probe for a container/orchestrator: 200 as long as the process
/// is up and serving, regardless of broker connectivity (that's what
/// `/api/status` is for).
async fn api_health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

// ---------------------------------------------------------------------------
// Ramp profiles
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RampProfileInput {
    #[serde(default)]
    mode: Option<String>,
    start_brightness_percent: u8,
    target_brightness_percent: u8,
    ramp_duration_seconds: i64,
}

impl RampProfileInput {
    fn into_profile(self, id: String) -> RampProfile {
        RampProfile {
            id,
            mode: self.mode.unwrap_or_else(|| "linear".to_string()),
            start_brightness_percent: self.start_brightness_percent,
            target_brightness_percent: self.target_brightness_percent,
            ramp_duration_seconds: self.ramp_duration_seconds,
        }
    }
}

async fn list_profiles(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_ramp_profiles().await {
        Ok(profiles) => Json(serde_json::json!(profiles)).into_response(),
        Err(e) => {
            error!("list_ramp_profiles failed: {e}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn create_profile(
    State(state): State<AppState>,
    Json(input): Json<RampProfileInput>,
) -> impl IntoResponse {
    match state.db.create_ramp_profile(input.into_profile(String::new())).await {
        Ok(profile) => (StatusCode::CREATED, Json(profile)).into_response(),
        Err(e) => {
            error!("create_ramp_profile failed: {e}");
            err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn get_profile(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.db.get_ramp_profile(&id).await {
        Ok(Some(profile)) => Json(profile).into_response(),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "ramp profile not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<RampProfileInput>,
) -> impl IntoResponse {
    match state.db.update_ramp_profile(input.into_profile(id)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => err_response(StatusCode::NOT_FOUND, "ramp profile not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_profile(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.db.delete_ramp_profile(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => err_response(StatusCode::NOT_FOUND, "ramp profile not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Alarms
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AlarmInput {
    name: String,
    #[serde(default = "default_true")]
    enabled: bool,
    cron_expression: String,
    #[serde(default = "default_timezone")]
    time_zone_id: String,
    ramp_profile_id: String,
}

fn default_true() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl AlarmInput {
    fn into_schedule(self, id: String) -> AlarmSchedule {
        AlarmSchedule {
            id,
            name: self.name,
            enabled: self.enabled,
            cron_expression: self.cron_expression,
            time_zone_id: self.time_zone_id,
            ramp_profile_id: self.ramp_profile_id,
        }
    }
}

/// A fire time in minutes-of-day plus the weekdays it occurs on, extracted
/// from a 5-field cron expression. Only literal `minute`/`hour` fields are
/// supported (`*` or lists in those two fields make the time ambiguous, so
/// such alarms are skipped by the overlap check rather than guessed at).
struct FireWindow {
    minute_of_day: i64,
    weekdays: std::collections::HashSet<i64>,
}

fn cron_fire_window(expr: &str) -> Option<FireWindow> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return None;
    }
    let minute: i64 = fields[0].parse().ok()?;
    let hour: i64 = fields[1].parse().ok()?;

    let weekdays: std::collections::HashSet<i64> = if fields[4] == "*" {
        (0..7).collect()
    } else {
        fields[4].split(',').filter_map(|p| p.trim().parse().ok()).collect()
    };
    if weekdays.is_empty() {
        return None;
    }

    Some(FireWindow {
        minute_of_day: hour * 60 + minute,
        weekdays,
    })
}

fn windows_overlap(a: &FireWindow, a_duration_min: i64, b: &FireWindow, b_duration_min: i64) -> bool {
    if a.weekdays.is_disjoint(&b.weekdays) {
        return false;
    }
    let a_start = a.minute_of_day;
    let a_end = a_start + a_duration_min.max(1);
    let b_start = b.minute_of_day;
    let b_end = b_start + b_duration_min.max(1);
    a_start < b_end && b_start < a_end
}

/// An alarm conflicts with another enabled alarm if their `[fire time, fire
/// time + rampDuration)` windows overlap on a shared weekday. Alarms whose
/// cron expression doesn't pin down an exact minute/hour are left out of the
/// comparison on both sides since there's no single window to compare.
async fn conflicting_alarm(
    db: &Db,
    cron_expression: &str,
    ramp_profile_id: &str,
    exclude_id: Option<&str>,
) -> anyhow::Result<bool> {
    let Some(candidate_window) = cron_fire_window(cron_expression) else {
        return Ok(false);
    };
    let candidate_duration_min = db
        .get_ramp_profile(ramp_profile_id)
        .await?
        .map(|p| (p.ramp_duration_seconds / 60).max(1))
        .unwrap_or(30);

    let existing = db.list_enabled_alarms().await?;
    for other in existing.iter().filter(|a| Some(a.id.as_str()) != exclude_id) {
        let Some(other_window) = cron_fire_window(&other.cron_expression) else {
            continue;
        };
        let other_duration_min = db
            .get_ramp_profile(&other.ramp_profile_id)
            .await?
            .map(|p| (p.ramp_duration_seconds / 60).max(1))
            .unwrap_or(30);

        if windows_overlap(&candidate_window, candidate_duration_min, &other_window, other_duration_min) {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn list_alarms(State(state): State<AppState>) -> impl IntoResponse {
    match state.db.list_alarms().await {
        Ok(alarms) => Json(serde_json::json!(alarms)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn create_alarm(
    State(state): State<AppState>,
    Json(input): Json<AlarmInput>,
) -> impl IntoResponse {
    if state.db.get_ramp_profile(&input.ramp_profile_id).await.ok().flatten().is_none() {
        return err_response(StatusCode::BAD_REQUEST, "unknown ramp_profile_id");
    }

    if input.enabled {
        match conflicting_alarm(&state.db, &input.cron_expression, &input.ramp_profile_id, None).await {
            Ok(true) => return err_response(StatusCode::CONFLICT, "overlaps another enabled alarm's ramp window"),
            Ok(false) => {}
            Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    match state.db.create_alarm(input.into_schedule(String::new())).await {
        Ok(alarm) => (StatusCode::CREATED, Json(alarm)).into_response(),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_alarm(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.db.get_alarm(&id).await {
        Ok(Some(alarm)) => Json(alarm).into_response(),
        Ok(None) => err_response(StatusCode::NOT_FOUND, "alarm not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn update_alarm(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<AlarmInput>,
) -> impl IntoResponse {
    if input.enabled {
        match conflicting_alarm(&state.db, &input.cron_expression, &input.ramp_profile_id, Some(&id)).await {
            Ok(true) => return err_response(StatusCode::CONFLICT, "overlaps another enabled alarm's ramp window"),
            Ok(false) => {}
            Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    match state.db.update_alarm(&input.into_schedule(id)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => err_response(StatusCode::NOT_FOUND, "alarm not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn delete_alarm(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.db.delete_alarm(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => err_response(StatusCode::NOT_FOUND, "alarm not found"),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn trigger_alarm(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let definition = match state.db.resolve_alarm(&id).await {
        Ok(Some(def)) => def,
        Ok(None) => return err_response(StatusCode::NOT_FOUND, "alarm not found"),
        Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let machine = AlarmStateMachine::new(definition.id.clone());
    if let Err(e) = machine.fire(AlarmTrigger::SchedulerTrigger).await {
        return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    // A disabled alarm stays in Triggered — executor.execute() bails out on
    // the `enabled` check before the Running precondition would ever matter.
    if definition.enabled {
        if let Err(e) = machine.fire(AlarmTrigger::Start).await {
            return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    }

    let executor = state.executor.clone();
    let shared = state.shared.clone();
    let name = definition.name.clone();
    let triggered_at = OffsetDateTime::now_utc();
    tokio::spawn(async move {
        {
            let mut st = shared.write().await;
            st.record_alarm(format!("alarm '{name}' manually triggered"));
        }
        if let Err(e) = executor.execute(&definition, &machine).await {
            error!(alarm_id = %definition.id, "manual trigger execution failed: {e}");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "triggered_at": triggered_at.unix_timestamp() })),
    )
        .into_response()
}

// ===========================================================================
// Tests
// ===========================================================================
