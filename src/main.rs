//! Process entry point: reads env/config, connects to MQTT and SQLite, wires
//! up the dimmer monitor/publisher/detector, the alarm executor, the REST
//! API, and the cron scheduler.

mod alarm;
mod config;
mod db;
mod dimmer;
mod error;
mod mqtt;
mod scheduler;
mod state;
mod web;

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use alarm::Executor;
use db::Db;
use dimmer::{CommandPublisher, DimmerMonitor, InterruptionDetector};
use mqtt::MqttSupervisor;
use state::SharedState;
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let mqtt_host = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let mqtt_user = env::var("MQTT_USER").ok();
    let mqtt_pass = env::var("MQTT_PASS").ok();
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:lumirise.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await.context("connecting to database")?;
    db.migrate().await.context("running migrations")?;
    info!(db_url = %db_url, "database ready");

    // ── Config file (broker/publish/dimmer tuning) ───────────────────
    let cfg = if std::path::Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "no config file found, using defaults");
        config::Config::default()
    };

    // ── Shared dashboard state ───────────────────────────────────────
    let shared: SharedState = Arc::new(tokio::sync::RwLock::new(state::SystemState::new()));
    {
        let mut st = shared.write().await;
        st.record_system("lumirise started".to_string());
    }

    // ── MQTT supervisor ──────────────────────────────────────────────
    let supervisor_config = cfg.supervisor_config(mqtt_host, mqtt_port, mqtt_user, mqtt_pass);
    if supervisor_config.username.is_none() {
        warn!("MQTT_USER / MQTT_PASS not set — connecting without authentication");
    }
    let mqtt = MqttSupervisor::new(supervisor_config);
    mqtt.connect().await;

    let topics = cfg.topics();

    // ── Dimmer monitor / publisher / interruption detector ───────────
    let monitor = Arc::new(DimmerMonitor::new(topics.clone()));
    if let Err(e) = monitor.start(&mqtt).await {
        warn!("dimmer monitor start: {e} (will resubscribe once connected)");
    }
    let publisher = Arc::new(CommandPublisher::new(
        mqtt.clone(),
        topics.clone(),
        cfg.publisher_config(),
    ));
    let detector = Arc::new(InterruptionDetector::new());
    let executor = Arc::new(Executor::new(publisher, detector.clone()));

    // Fan incoming MQTT messages into the dimmer monitor.
    let dispatch_handle = {
        let monitor = monitor.clone();
        let mut messages = mqtt.message_received();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok((topic, payload)) => monitor.handle_message(&topic, &payload).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "mqtt message dispatch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Feed every observed dimmer state into the interruption detector, and
    // mirror it into the shared dashboard state.
    let observe_handle = {
        let detector = detector.clone();
        let shared = shared.clone();
        let mut changes = monitor.state_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(observed) => {
                        detector.observe(observed).await;
                        let mut st = shared.write().await;
                        st.record_dimmer(observed);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "dimmer state dispatch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Record interruptions into the dashboard event log.
    let interruption_log_handle = {
        let shared = shared.clone();
        let mut interruptions = detector.interruptions();
        tokio::spawn(async move {
            loop {
                match interruptions.recv().await {
                    Ok(event) => {
                        let mut st = shared.write().await;
                        st.record_interruption(event.message);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "interruption log dispatch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // Mirror connection state into the dashboard.
    let connection_log_handle = {
        let shared = shared.clone();
        let mut states = mqtt.connection_state_changes();
        tokio::spawn(async move {
            loop {
                match states.recv().await {
                    Ok(conn) => {
                        let mut st = shared.write().await;
                        st.mqtt_connected = conn.is_connected;
                        st.record_system(if conn.is_connected {
                            "mqtt connected".to_string()
                        } else {
                            format!(
                                "mqtt disconnected{}",
                                conn.last_error.map(|e| format!(": {e}")).unwrap_or_default()
                            )
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "connection log dispatch lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // ── REST API ─────────────────────────────────────────────────────
    let mut web_handle = {
        let app_state = AppState {
            db: db.clone(),
            shared: shared.clone(),
            mqtt: mqtt.clone(),
            monitor: monitor.clone(),
            executor: executor.clone(),
        };
        tokio::spawn(async move { web::serve(app_state).await })
    };

    // ── Alarm scheduler ──────────────────────────────────────────────
    let mut scheduler_handle = {
        let sched_db = db.clone();
        let sched_executor = executor.clone();
        let sched_shared = shared.clone();
        tokio::spawn(async move { scheduler::run(sched_db, sched_executor, sched_shared).await })
    };

    // ── Signal handling ──────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;

    loop {
        tokio::select! {
            result = &mut scheduler_handle => {
                error!("CRITICAL: alarm scheduler task exited unexpectedly: {result:?}");
                exit_reason = "scheduler task died";
                break;
            }

            result = &mut web_handle => {
                error!("web server task exited unexpectedly: {result:?}");
                // Not safety-critical — the scheduler keeps firing alarms
                // without the REST API. Log and keep running.
            }

            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }

            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down");
    if let Err(e) = monitor.stop(&mqtt).await {
        warn!("dimmer monitor stop: {e}");
    }
    dispatch_handle.abort();
    observe_handle.abort();
    interruption_log_handle.abort();
    connection_log_handle.abort();
    mqtt.dispose().await;

    info!("shutdown complete");
    Ok(())
}
