//! SQLite persistence layer (via sqlx): ramp profiles and alarm schedules,
//! plus the join that resolves a schedule into the frozen value the
//! executor actually runs against.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::alarm::AlarmDefinition;

const DEFAULT_START_BRIGHTNESS_PERCENT: u8 = 20;
const DEFAULT_TARGET_BRIGHTNESS_PERCENT: u8 = 100;
const DEFAULT_RAMP_DURATION_SECS: i64 = 30 * 60;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampProfile {
    pub id: String,
    pub mode: String,
    pub start_brightness_percent: u8,
    pub target_brightness_percent: u8,
    pub ramp_duration_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSchedule {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub cron_expression: String,
    pub time_zone_id: String,
    pub ramp_profile_id: String,
}

fn new_id() -> String {
    let mut buf = [0u8; 8];
    fastrand::fill(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .expect("OffsetDateTime::now_utc always formats")
}

/// Brightness fields out of range (or a non-positive duration) fall back to
/// the documented defaults rather than being rejected — a profile edited
/// directly in the database shouldn't be able to wedge the scheduler.
///
/// A `start` above `target` is left alone: that's not an out-of-range value,
/// it's a constant-brightness hold, and it's the executor's job to treat it
/// that way rather than this layer silently rewriting it.
fn sanitize_profile(profile: &mut RampProfile) {
    if profile.start_brightness_percent > 100 {
        profile.start_brightness_percent = DEFAULT_START_BRIGHTNESS_PERCENT;
    }
    if profile.target_brightness_percent == 0 || profile.target_brightness_percent > 100 {
        profile.target_brightness_percent = DEFAULT_TARGET_BRIGHTNESS_PERCENT;
    }
    if profile.ramp_duration_seconds <= 0 {
        profile.ramp_duration_seconds = DEFAULT_RAMP_DURATION_SECS;
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/lumirise/lumirise.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db health check failed")?;
        Ok(())
    }

    // ----------------------------
    // Ramp profiles
    // ----------------------------

    pub async fn create_ramp_profile(&self, mut profile: RampProfile) -> Result<RampProfile> {
        sanitize_profile(&mut profile);
        if profile.id.is_empty() {
            profile.id = new_id();
        }
        let now = now_rfc3339();
        let start = profile.start_brightness_percent as i64;
        let target = profile.target_brightness_percent as i64;

        sqlx::query!(
            r#"
            INSERT INTO ramp_profiles (
              id, mode, start_brightness_percent, target_brightness_percent,
              ramp_duration_seconds, created_at_utc, updated_at_utc
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            profile.id,
            profile.mode,
            start,
            target,
            profile.ramp_duration_seconds,
            now,
            now
        )
        .execute(&self.pool)
        .await
        .context("create_ramp_profile failed")?;

        Ok(profile)
    }

    pub async fn update_ramp_profile(&self, mut profile: RampProfile) -> Result<bool> {
        sanitize_profile(&mut profile);
        let now = now_rfc3339();
        let start = profile.start_brightness_percent as i64;
        let target = profile.target_brightness_percent as i64;

        let result = sqlx::query!(
            r#"
            UPDATE ramp_profiles SET
              mode = ?, start_brightness_percent = ?, target_brightness_percent = ?,
              ramp_duration_seconds = ?, updated_at_utc = ?
            WHERE id = ?
            "#,
            profile.mode,
            start,
            target,
            profile.ramp_duration_seconds,
            now,
            profile.id
        )
        .execute(&self.pool)
        .await
        .context("update_ramp_profile failed")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_ramp_profile(&self, id: &str) -> Result<bool> {
        let result = sqlx::query!("DELETE FROM ramp_profiles WHERE id = ?", id)
            .execute(&self.pool)
            .await
            .context("delete_ramp_profile failed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_ramp_profile(&self, id: &str) -> Result<Option<RampProfile>> {
        let row = sqlx::query!(
            r#"
            SELECT id as "id!", mode, start_brightness_percent, target_brightness_percent, ramp_duration_seconds
            FROM ramp_profiles WHERE id = ?
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_ramp_profile failed")?;

        Ok(row.map(|r| RampProfile {
            id: r.id,
            mode: r.mode,
            start_brightness_percent: r.start_brightness_percent as u8,
            target_brightness_percent: r.target_brightness_percent as u8,
            ramp_duration_seconds: r.ramp_duration_seconds,
        }))
    }

    pub async fn list_ramp_profiles(&self) -> Result<Vec<RampProfile>> {
        let rows = sqlx::query!(
            r#"
            SELECT id as "id!", mode, start_brightness_percent, target_brightness_percent, ramp_duration_seconds
            FROM ramp_profiles ORDER BY id
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("list_ramp_profiles failed")?;

        Ok(rows
            .into_iter()
            .map(|r| RampProfile {
                id: r.id,
                mode: r.mode,
                start_brightness_percent: r.start_brightness_percent as u8,
                target_brightness_percent: r.target_brightness_percent as u8,
                ramp_duration_seconds: r.ramp_duration_seconds,
            })
            .collect())
    }

    // ----------------------------
    // Alarm schedules
    // ----------------------------

    pub async fn create_alarm(&self, mut alarm: AlarmSchedule) -> Result<AlarmSchedule> {
        if alarm.id.is_empty() {
            alarm.id = new_id();
        }
        let now = now_rfc3339();
        let enabled = alarm.enabled as i64;

        sqlx::query!(
            r#"
            INSERT INTO alarm_schedules (
              id, name, enabled, cron_expression, time_zone_id, ramp_profile_id,
              created_at_utc, updated_at_utc
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            alarm.id,
            alarm.name,
            enabled,
            alarm.cron_expression,
            alarm.time_zone_id,
            alarm.ramp_profile_id,
            now,
            now
        )
        .execute(&self.pool)
        .await
        .context("create_alarm failed")?;

        Ok(alarm)
    }

    pub async fn update_alarm(&self, alarm: &AlarmSchedule) -> Result<bool> {
        let now = now_rfc3339();
        let enabled = alarm.enabled as i64;

        let result = sqlx::query!(
            r#"
            UPDATE alarm_schedules SET
              name = ?, enabled = ?, cron_expression = ?, time_zone_id = ?,
              ramp_profile_id = ?, updated_at_utc = ?
            WHERE id = ?
            "#,
            alarm.name,
            enabled,
            alarm.cron_expression,
            alarm.time_zone_id,
            alarm.ramp_profile_id,
            now,
            alarm.id
        )
        .execute(&self.pool)
        .await
        .context("update_alarm failed")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_alarm(&self, id: &str) -> Result<bool> {
        let result = sqlx::query!("DELETE FROM alarm_schedules WHERE id = ?", id)
            .execute(&self.pool)
            .await
            .context("delete_alarm failed")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_alarm(&self, id: &str) -> Result<Option<AlarmSchedule>> {
        let row = sqlx::query!(
            r#"
            SELECT id as "id!", name, enabled, cron_expression, time_zone_id, ramp_profile_id
            FROM alarm_schedules WHERE id = ?
            "#,
            id
        )
        .fetch_optional(&self.pool)
        .await
        .context("get_alarm failed")?;

        Ok(row.map(|r| AlarmSchedule {
            id: r.id,
            name: r.name,
            enabled: r.enabled != 0,
            cron_expression: r.cron_expression,
            time_zone_id: r.time_zone_id,
            ramp_profile_id: r.ramp_profile_id,
        }))
    }

    pub async fn list_alarms(&self) -> Result<Vec<AlarmSchedule>> {
        let rows = sqlx::query!(
            r#"
            SELECT id as "id!", name, enabled, cron_expression, time_zone_id, ramp_profile_id
            FROM alarm_schedules ORDER BY id
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("list_alarms failed")?;

        Ok(rows
            .into_iter()
            .map(|r| AlarmSchedule {
                id: r.id,
                name: r.name,
                enabled: r.enabled != 0,
                cron_expression: r.cron_expression,
                time_zone_id: r.time_zone_id,
                ramp_profile_id: r.ramp_profile_id,
            })
            .collect())
    }

    pub async fn list_enabled_alarms(&self) -> Result<Vec<AlarmSchedule>> {
        let rows = sqlx::query!(
            r#"
            SELECT id as "id!", name, enabled, cron_expression, time_zone_id, ramp_profile_id
            FROM alarm_schedules WHERE enabled = 1 ORDER BY id
            "#
        )
        .fetch_all(&self.pool)
        .await
        .context("list_enabled_alarms failed")?;

        Ok(rows
            .into_iter()
            .map(|r| AlarmSchedule {
                id: r.id,
                name: r.name,
                enabled: r.enabled != 0,
                cron_expression: r.cron_expression,
                time_zone_id: r.time_zone_id,
                ramp_profile_id: r.ramp_profile_id,
            })
            .collect())
    }

    /// Joins an alarm schedule with its ramp profile into the frozen value
    /// the executor runs against, applying profile defaults along the way.
    pub async fn resolve_alarm(&self, id: &str) -> Result<Option<AlarmDefinition>> {
        let Some(schedule) = self.get_alarm(id).await? else {
            return Ok(None);
        };
        let Some(mut profile) = self.get_ramp_profile(&schedule.ramp_profile_id).await? else {
            return Ok(None);
        };
        sanitize_profile(&mut profile);

        Ok(Some(AlarmDefinition {
            id: schedule.id,
            name: schedule.name,
            cron_expression: schedule.cron_expression,
            enabled: schedule.enabled,
            start_brightness_percent: profile.start_brightness_percent,
            target_brightness_percent: profile.target_brightness_percent,
            ramp_duration_secs: profile.ramp_duration_seconds.max(1) as u64,
        }))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
