//! MQTT connection supervisor: owns the one broker session used by the
//! whole process, converges to connected whenever the broker is reachable,
//! and gives every other component a durable publish/subscribe surface on
//! top of it.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use time::OffsetDateTime;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::dimmer::types::MqttConnectionState;
use crate::error::{LumiriseError, Result};

const CONNECTION_EVENT_CAPACITY: usize = 64;
const MESSAGE_EVENT_CAPACITY: usize = 256;

/// Entries older than this are discarded at dequeue time rather than published.
const QUEUE_ENTRY_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,

    pub reconnection_delay_ms: u64,
    pub max_reconnection_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 0 means unlimited.
    pub max_reconnection_attempts: u32,

    pub command_timeout_ms: u64,
    pub command_queue_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "lumirise".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            reconnection_delay_ms: 1000,
            max_reconnection_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_reconnection_attempts: 0,
            command_timeout_ms: 5000,
            command_queue_depth: 20,
        }
    }
}

struct QueuedMessage {
    topic: String,
    payload: Vec<u8>,
    enqueued_at: Instant,
}

struct Inner {
    connected: bool,
    disconnect_requested: bool,
    disposed: bool,
    subscriptions: HashSet<String>,
    offline_queue: VecDeque<QueuedMessage>,
    consecutive_failures: u32,
}

/// Shared handle to the one MQTT session. Cheap to clone (everything behind
/// an `Arc`); every consumer of MQTT in the process holds one of these.
#[derive(Clone)]
pub struct MqttSupervisor {
    client: Arc<Mutex<AsyncClient>>,
    pending_eventloop: Arc<Mutex<Option<EventLoop>>>,
    inner: Arc<Mutex<Inner>>,
    config: SupervisorConfig,
    conn_tx: broadcast::Sender<MqttConnectionState>,
    msg_tx: broadcast::Sender<(String, Vec<u8>)>,
    drain_notify: Arc<Notify>,
}

impl MqttSupervisor {
    /// Builds the client/eventloop pair and a supervisor handle. The first
    /// `EventLoop` is built here and held internally — call
    /// [`MqttSupervisor::connect`] (no argument) to start driving it. Kept as
    /// a separate step so tests can construct a supervisor without ever
    /// driving a real network connection.
    pub fn new(config: SupervisorConfig) -> Self {
        let (client, eventloop) = Self::build_client(&config);

        let (conn_tx, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);
        let (msg_tx, _) = broadcast::channel(MESSAGE_EVENT_CAPACITY);

        Self {
            client: Arc::new(Mutex::new(client)),
            pending_eventloop: Arc::new(Mutex::new(Some(eventloop))),
            inner: Arc::new(Mutex::new(Inner {
                connected: false,
                disconnect_requested: false,
                disposed: false,
                subscriptions: HashSet::new(),
                offline_queue: VecDeque::new(),
                consecutive_failures: 0,
            })),
            config,
            conn_tx,
            msg_tx,
            drain_notify: Arc::new(Notify::new()),
        }
    }

    fn build_client(config: &SupervisorConfig) -> (AsyncClient, EventLoop) {
        let mut opts = MqttOptions::new(&config.client_id, &config.server, config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(1)));
        opts.set_clean_session(false);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user, pass);
        }
        AsyncClient::new(opts, config.command_queue_depth.max(1))
    }

    pub fn connection_state_changes(&self) -> broadcast::Receiver<MqttConnectionState> {
        self.conn_tx.subscribe()
    }

    pub fn message_received(&self) -> broadcast::Receiver<(String, Vec<u8>)> {
        self.msg_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connected
    }

    pub async fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.lock().await.subscriptions.contains(topic)
    }

    /// Spawns the reconnect-and-poll loop. The first call drives the
    /// `EventLoop` built in [`MqttSupervisor::new`]; if that loop has since
    /// exited (e.g. `max_reconnection_attempts` was exhausted), calling this
    /// again builds a fresh client/eventloop pair — subscriptions and the
    /// offline queue carry over since they live on this same handle — so a
    /// caller can restart the supervisor any number of times.
    pub async fn connect(&self) {
        let eventloop = {
            let mut pending = self.pending_eventloop.lock().await;
            match pending.take() {
                Some(eventloop) => eventloop,
                None => {
                    let (client, eventloop) = Self::build_client(&self.config);
                    *self.client.lock().await = client;
                    eventloop
                }
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.disconnect_requested = false;
            inner.disposed = false;
        }

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.run_reconnect_loop(eventloop).await });
        let drain_supervisor = self.clone();
        tokio::spawn(async move { drain_supervisor.run_drain_loop().await });
    }

    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.disconnect_requested = true;
            inner.offline_queue.clear();
        }
        let client = self.client.lock().await.clone();
        let _ = tokio::time::timeout(Duration::from_secs(10), client.disconnect()).await;
        self.publish_connection_event(false, None).await;
    }

    pub async fn dispose(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.disposed = true;
            inner.disconnect_requested = true;
            inner.offline_queue.clear();
        }
        let client = self.client.lock().await.clone();
        let _ = tokio::time::timeout(Duration::from_secs(10), client.disconnect()).await;
    }

    /// Publish bounded by `command_timeout_ms`. On `NotConnected` the pair is
    /// enqueued (if room) before the error is returned.
    pub async fn publish(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Result<()> {
        self.publish_inner(topic.into(), payload.into(), true).await
    }

    async fn publish_inner(&self, topic: String, payload: Vec<u8>, enqueue_on_disconnect: bool) -> Result<()> {
        let connected = self.is_connected().await;
        if !connected {
            if enqueue_on_disconnect {
                self.enqueue(topic, payload).await;
            }
            return Err(LumiriseError::NotConnected);
        }

        let client = self.client.lock().await.clone();
        let timeout = Duration::from_millis(self.config.command_timeout_ms);
        let result = tokio::time::timeout(
            timeout,
            client.publish(&topic, QoS::AtLeastOnce, false, payload.clone()),
        )
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(topic = %topic, "publish failed, marking disconnected: {e}");
                self.mark_disconnected(Some(e.to_string())).await;
                if enqueue_on_disconnect {
                    self.enqueue(topic, payload).await;
                }
                Err(LumiriseError::NotConnected)
            }
            Err(_) => Err(LumiriseError::Timeout(timeout)),
        }
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        {
            let mut inner = self.inner.lock().await;
            inner.subscriptions.insert(topic.clone());
            if !inner.connected {
                return Err(LumiriseError::NotConnected);
            }
        }
        let client = self.client.lock().await.clone();
        client.subscribe(&topic, QoS::AtLeastOnce).await.map_err(|e| {
            warn!(topic = %topic, "subscribe failed: {e}");
            LumiriseError::TransientBrokerError(e.to_string())
        })
    }

    pub async fn unsubscribe(&self, topic: impl Into<String>) -> Result<()> {
        let topic = topic.into();
        let was_connected = {
            let mut inner = self.inner.lock().await;
            inner.subscriptions.remove(&topic);
            inner.connected
        };
        if !was_connected {
            return Err(LumiriseError::NotConnected);
        }
        let client = self.client.lock().await.clone();
        client.unsubscribe(&topic).await.map_err(|e| {
            warn!(topic = %topic, "unsubscribe failed: {e}");
            LumiriseError::TransientBrokerError(e.to_string())
        })
    }

    async fn enqueue(&self, topic: String, payload: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        if inner.offline_queue.len() >= self.config.command_queue_depth {
            warn!(topic = %topic, "offline queue full — dropping message");
            return;
        }
        inner.offline_queue.push_back(QueuedMessage {
            topic,
            payload,
            enqueued_at: Instant::now(),
        });
    }

    async fn mark_disconnected(&self, last_error: Option<String>) {
        let was_connected = {
            let mut inner = self.inner.lock().await;
            let was = inner.connected;
            inner.connected = false;
            was
        };
        if was_connected {
            self.publish_connection_event(false, last_error).await;
        }
    }

    async fn publish_connection_event(&self, is_connected: bool, last_error: Option<String>) {
        let attempt = self.inner.lock().await.consecutive_failures;
        let _ = self.conn_tx.send(MqttConnectionState {
            is_connected,
            attempt_number: attempt,
            last_error,
            updated_at_utc: OffsetDateTime::now_utc(),
        });
    }

    /// Core reconnect loop: repeatedly polls `eventloop`, handling the events
    /// rumqttc surfaces for us (connect/ping/keepalive are all folded into
    /// `poll()` by the underlying library) and applying the supervisor's
    /// backoff between failed polls.
    async fn run_reconnect_loop(&self, mut eventloop: EventLoop) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.disconnect_requested || inner.disposed {
                    return;
                }
            }

            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let subs: Vec<String> = {
                        let mut inner = self.inner.lock().await;
                        inner.connected = true;
                        inner.consecutive_failures = 0;
                        inner.subscriptions.iter().cloned().collect()
                    };
                    let client = self.client.lock().await.clone();
                    for topic in subs {
                        if let Err(e) = client.subscribe(&topic, QoS::AtLeastOnce).await {
                            error!(topic = %topic, "resubscribe failed: {e}");
                        }
                    }
                    self.publish_connection_event(true, None).await;
                    self.drain_notify.notify_one();
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let _ = self.msg_tx.send((p.topic.clone(), p.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.mark_disconnected(Some("broker disconnect".to_string())).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let failures = {
                        let mut inner = self.inner.lock().await;
                        inner.connected = false;
                        inner.consecutive_failures += 1;
                        inner.consecutive_failures
                    };
                    warn!(attempt = failures, "mqtt connect/poll error: {e}");
                    self.publish_connection_event(false, Some(e.to_string())).await;

                    if self.config.max_reconnection_attempts > 0
                        && failures >= self.config.max_reconnection_attempts
                    {
                        error!(
                            attempts = failures,
                            "max reconnection attempts reached — supervisor loop stopping"
                        );
                        return;
                    }

                    let delay = backoff_delay(&self.config, failures);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drains the offline queue one entry at a time whenever woken by a
    /// successful (re)connect. Stale entries (older than 5 minutes) are
    /// dropped outright; a transient failure re-enqueues once and stops
    /// until the next reconnect wakes it again.
    async fn run_drain_loop(&self) {
        loop {
            self.drain_notify.notified().await;

            loop {
                if !self.is_connected().await {
                    break;
                }

                let next = {
                    let mut inner = self.inner.lock().await;
                    inner.offline_queue.pop_front()
                };

                let Some(entry) = next else { break };

                if entry.enqueued_at.elapsed() > QUEUE_ENTRY_MAX_AGE {
                    warn!(topic = %entry.topic, "dropping stale queued message");
                    continue;
                }

                match self
                    .publish_inner(entry.topic.clone(), entry.payload.clone(), false)
                    .await
                {
                    Ok(()) => {}
                    Err(_) => {
                        warn!(topic = %entry.topic, "queue drain publish failed — re-enqueueing once");
                        let mut inner = self.inner.lock().await;
                        inner.offline_queue.push_front(entry);
                        break;
                    }
                }
            }
        }
    }
}

/// `delay = min(max, base * multiplier^(failures-1)) * jitter`, jitter in
/// `[0.8, 1.2]`.
fn backoff_delay(config: &SupervisorConfig, failures: u32) -> Duration {
    let exponent = (failures.saturating_sub(1)) as i32;
    let raw = config.reconnection_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = raw.min(config.max_reconnection_delay_ms as f64);
    let jitter = 0.8 + fastrand::f64() * 0.4;
    Duration::from_millis((capped * jitter).max(1.0) as u64)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_grows_with_failures_and_respects_cap() {
        let cfg = SupervisorConfig {
            reconnection_delay_ms: 1000,
            max_reconnection_delay_ms: 5000,
            backoff_multiplier: 2.0,
            ..SupervisorConfig::default()
        };

        let d1 = backoff_delay(&cfg, 1).as_millis();
        let d2 = backoff_delay(&cfg, 2).as_millis();
        let d5 = backoff_delay(&cfg, 5).as_millis();

        assert!((800..=1200).contains(&d1));
        assert!((1600..=2400).contains(&d2));
        assert!(d5 <= 6000);
    }

    #[tokio::test]
    async fn publish_while_disconnected_enqueues_and_errors() {
        let supervisor = MqttSupervisor::new(SupervisorConfig::default());

        let result = supervisor.publish("x", b"y".to_vec()).await;
        assert!(matches!(result, Err(LumiriseError::NotConnected)));

        let queued = supervisor.inner.lock().await.offline_queue.len();
        assert_eq!(queued, 1);
    }

    #[tokio::test]
    async fn publish_while_disconnected_drops_when_queue_full() {
        let cfg = SupervisorConfig {
            command_queue_depth: 2,
            ..SupervisorConfig::default()
        };
        let supervisor = MqttSupervisor::new(cfg);

        for _ in 0..5 {
            let _ = supervisor.publish("x", b"y".to_vec()).await;
        }

        let queued = supervisor.inner.lock().await.offline_queue.len();
        assert_eq!(queued, 2);
    }

    #[tokio::test]
    async fn subscribe_while_disconnected_still_records_topic() {
        let supervisor = MqttSupervisor::new(SupervisorConfig::default());

        let result = supervisor.subscribe("stat/dimmer/POWER").await;
        assert!(matches!(result, Err(LumiriseError::NotConnected)));

        let recorded = supervisor
            .inner
            .lock()
            .await
            .subscriptions
            .contains("stat/dimmer/POWER");
        assert!(recorded);
    }

    #[tokio::test]
    async fn unsubscribe_while_disconnected_errors_but_forgets_topic() {
        let supervisor = MqttSupervisor::new(SupervisorConfig::default());
        let _ = supervisor.subscribe("stat/dimmer/POWER").await;

        let result = supervisor.unsubscribe("stat/dimmer/POWER").await;
        assert!(matches!(result, Err(LumiriseError::NotConnected)));

        let recorded = supervisor
            .inner
            .lock()
            .await
            .subscriptions
            .contains("stat/dimmer/POWER");
        assert!(!recorded);
    }

    #[tokio::test]
    async fn is_connected_false_before_connect() {
        let supervisor = MqttSupervisor::new(SupervisorConfig::default());
        assert!(!supervisor.is_connected().await);
    }

    #[tokio::test]
    async fn disconnect_clears_offline_queue() {
        let supervisor = MqttSupervisor::new(SupervisorConfig::default());
        let _ = supervisor.publish("x", b"y".to_vec()).await;
        assert_eq!(supervisor.inner.lock().await.offline_queue.len(), 1);

        supervisor.disconnect().await;
        assert_eq!(supervisor.inner.lock().await.offline_queue.len(), 0);
    }
}
