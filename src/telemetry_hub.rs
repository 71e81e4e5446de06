//! The telemetry hub: one broker session shared by every observer.
//!
//! Public operations are synchronous and never wait on the network. The
//! session handshake, message delivery and publish completion all run on
//! tokio tasks. Connection state and the subscription table sit behind a
//! single mutex so the "already connected" and "already subscribed" checks
//! are atomic across concurrent callers.

use crate::config::{Config, TopicConfig};
use crate::models::{Pump, PumpThresholds};
use crate::mqtt_transport::{BrokerLink, BrokerTransport, LinkEvent, TransportError};
use crate::signals::{numeric_handler, CellReceiver, Reading, Signal, SignalCells};
use crate::topics::{topic_matches, validate_topic_filter, validate_topic_name, TopicError};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives the raw payload of every message matching its filter.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Resolves once the message was written to the broker connection, or with
/// the reason it never will be.
pub type PublishCompletion = oneshot::Receiver<Result<(), HubError>>;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Uninitialized,
    Connecting,
    Open,
    Closed,
}

impl ConnectionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Uninitialized => "uninitialized",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Open => "open",
            ConnectionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Registered,
    AlreadySubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub filter: String,
    /// Confirmed by the broker on the current session, and that session is open.
    pub active: bool,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("no tokio runtime available to drive the hub")]
    NoRuntime,
    #[error(transparent)]
    Topic(#[from] TopicError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("not connected to the MQTT broker")]
    NotConnected,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    /// -1 retries forever, 0 never retries.
    pub max_retries: i32,
    pub retry_interval: Duration,
    pub topics: TopicConfig,
}

impl From<&Config> for HubSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_retries: config.mqtt_max_retries,
            retry_interval: Duration::from_millis(config.mqtt_retry_interval_ms),
            topics: config.topics.clone(),
        }
    }
}

struct Session {
    client_id: String,
    link: Arc<dyn BrokerLink>,
    generation: u64,
}

struct Subscription {
    handler: MessageHandler,
    // Generation of the session that confirmed the filter.
    registered_in: Option<u64>,
}

struct HubState {
    phase: ConnectionPhase,
    session: Option<Session>,
    subscriptions: HashMap<String, Subscription>,
    // Bumped by every new session and every explicit disconnect. Events,
    // handshakes and scheduled retries from an older generation are dropped.
    generation: u64,
    retry_attempt: u32,
}

impl HubState {
    fn is_current(&self, generation: u64) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.generation == generation)
    }
}

struct HubInner {
    state: Mutex<HubState>,
    cells: Arc<SignalCells>,
    transport: Arc<dyn BrokerTransport>,
    settings: HubSettings,
    runtime: Handle,
}

/// Cheaply clonable handle to the shared hub.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl TelemetryHub {
    /// Must be called from within a tokio runtime; the hub spawns its work there.
    pub fn new(settings: HubSettings, transport: Arc<dyn BrokerTransport>) -> Result<Self, HubError> {
        let runtime = Handle::try_current().map_err(|_| HubError::NoRuntime)?;

        Ok(Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    phase: ConnectionPhase::Uninitialized,
                    session: None,
                    subscriptions: HashMap::new(),
                    generation: 0,
                    retry_attempt: 0,
                }),
                cells: Arc::new(SignalCells::new()),
                transport,
                settings,
                runtime,
            }),
        })
    }

    pub fn topics(&self) -> &TopicConfig {
        &self.inner.settings.topics
    }

    /// Starts a session unless one is already connecting or open.
    pub fn connect(&self) {
        let mut state = self.inner.lock_state();
        self.inner.ensure_connected(&mut state);
    }

    /// Closes the current session and drops every subscription.
    ///
    /// Safe at any time: a handshake still in flight is ignored when it
    /// completes, and a scheduled reconnect is cancelled.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock_state();
        match state.phase {
            ConnectionPhase::Uninitialized => {
                debug!("Disconnect requested before any connection.");
            }
            ConnectionPhase::Closed => {
                state.generation += 1;
                state.retry_attempt = 0;
                state.subscriptions.clear();
                debug!("Disconnect requested while closed; pending reconnects cancelled.");
            }
            ConnectionPhase::Connecting | ConnectionPhase::Open => {
                state.generation += 1;
                state.phase = ConnectionPhase::Closed;
                state.retry_attempt = 0;
                state.subscriptions.clear();

                if let Some(session) = state.session.take() {
                    info!("MQTT disconnected ({}).", session.client_id);
                    let link = session.link;
                    self.inner.runtime.spawn(async move {
                        if let Err(e) = link.close().await {
                            debug!("Close request not delivered: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// Registers `handler` for `filter`, connecting first if needed.
    ///
    /// A filter is subscribed at most once; later calls leave the first
    /// handler in place and return [`SubscribeOutcome::AlreadySubscribed`].
    pub fn subscribe_to_topic(
        &self,
        filter: &str,
        handler: MessageHandler,
    ) -> Result<SubscribeOutcome, HubError> {
        validate_topic_filter(filter)?;

        let mut state = self.inner.lock_state();
        if state.subscriptions.contains_key(filter) {
            self.inner.ensure_connected(&mut state);
            debug!("Already subscribed to '{}'.", filter);
            return Ok(SubscribeOutcome::AlreadySubscribed);
        }

        state.subscriptions.insert(
            filter.to_string(),
            Subscription {
                handler,
                registered_in: None,
            },
        );

        // A fresh session registers every known filter itself.
        let started = self.inner.ensure_connected(&mut state);
        if !started {
            if let Some(session) = &state.session {
                self.inner
                    .spawn_subscribe(session.link.clone(), filter.to_string(), session.generation);
            }
        }

        Ok(SubscribeOutcome::Registered)
    }

    /// Feeds numeric payloads on `filter` into the cells routed from `signal`.
    pub fn subscribe_signal(&self, filter: &str, signal: Signal) -> Result<SubscribeOutcome, HubError> {
        self.subscribe_to_topic(filter, numeric_handler(self.inner.cells.clone(), signal))
    }

    /// Subscribes every configured level and flow topic.
    pub fn subscribe_default_signals(&self) -> Result<(), HubError> {
        let topics = &self.inner.settings.topics;
        let routes = [
            (&topics.tank_1, Signal::Tank1Level),
            (&topics.tank_2, Signal::Tank2Level),
            (&topics.flow_1, Signal::Colony1Flow),
            (&topics.flow_2, Signal::Colony2Flow),
            (&topics.sensor, Signal::Legacy),
        ];

        for (topic, signal) in routes {
            self.subscribe_signal(topic, signal)?;
        }
        Ok(())
    }

    /// Hands each alert's trimmed text to `on_alert`.
    pub fn subscribe_to_alerts<F>(&self, filter: &str, on_alert: F) -> Result<SubscribeOutcome, HubError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(move |payload: &[u8]| {
            let message = String::from_utf8_lossy(payload).trim().to_string();
            info!("Alert received: '{}'", message);
            on_alert(message);
        });
        self.subscribe_to_topic(filter, handler)
    }

    /// Sends `message` on `topic`, connecting first if needed. Never retried.
    pub fn publish(&self, topic: &str, message: &str) -> Result<PublishCompletion, HubError> {
        validate_topic_name(topic)?;

        let link = {
            let mut state = self.inner.lock_state();
            self.inner.ensure_connected(&mut state);
            state.session.as_ref().map(|session| session.link.clone())
        };

        let (done_tx, done_rx) = oneshot::channel();
        let topic = topic.to_string();
        let message = message.to_string();

        match link {
            Some(link) => {
                self.inner.runtime.spawn(async move {
                    let result = link
                        .publish(topic.clone(), message.clone().into_bytes())
                        .await
                        .map_err(HubError::from);
                    match &result {
                        Ok(()) => info!("Message published to '{}': {}", topic, message),
                        Err(e) => error!("Failed to publish message to '{}': {}", topic, e),
                    }
                    let _ = done_tx.send(result);
                });
            }
            None => {
                error!("Failed to publish message to '{}': no broker session.", topic);
                let _ = done_tx.send(Err(HubError::NotConnected));
            }
        }

        Ok(done_rx)
    }

    pub fn publish_thresholds(
        &self,
        pump: Pump,
        thresholds: &PumpThresholds,
    ) -> Result<PublishCompletion, HubError> {
        let payload = serde_json::to_string(thresholds)?;
        self.publish(pump.threshold_topic(&self.inner.settings.topics), &payload)
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.inner.lock_state().phase
    }

    pub fn client_id(&self) -> Option<String> {
        let state = self.inner.lock_state();
        state.session.as_ref().map(|session| session.client_id.clone())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let state = self.inner.lock_state();
        let open = state.phase == ConnectionPhase::Open;
        let mut subscriptions: Vec<SubscriptionInfo> = state
            .subscriptions
            .iter()
            .map(|(filter, subscription)| SubscriptionInfo {
                filter: filter.clone(),
                active: open
                    && subscription
                        .registered_in
                        .is_some_and(|generation| state.is_current(generation)),
            })
            .collect();
        subscriptions.sort_by(|a, b| a.filter.cmp(&b.filter));
        subscriptions
    }

    pub fn latest(&self, signal: Signal) -> Option<f32> {
        self.inner.cells.latest(signal).map(|reading| reading.value)
    }

    pub fn reading(&self, signal: Signal) -> Option<Reading> {
        self.inner.cells.latest(signal)
    }

    /// Observer handle for one signal's cell.
    pub fn watch(&self, signal: Signal) -> CellReceiver {
        self.inner.cells.subscribe(signal)
    }
}

impl HubInner {
    fn lock_state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true when a new session was started.
    fn ensure_connected(self: &Arc<Self>, state: &mut HubState) -> bool {
        match state.phase {
            ConnectionPhase::Connecting | ConnectionPhase::Open => false,
            ConnectionPhase::Uninitialized | ConnectionPhase::Closed => self.start_session(state),
        }
    }

    fn start_session(self: &Arc<Self>, state: &mut HubState) -> bool {
        let client_id = format!("fluir_hub_{}", Uuid::new_v4());
        state.generation += 1;
        let generation = state.generation;

        match self.transport.open(&client_id, &self.runtime) {
            Ok(session) => {
                info!("Connecting to MQTT broker as '{}'...", client_id);
                state.phase = ConnectionPhase::Connecting;

                for (filter, subscription) in state.subscriptions.iter_mut() {
                    subscription.registered_in = None;
                    self.spawn_subscribe(session.link.clone(), filter.clone(), generation);
                }

                state.session = Some(Session {
                    client_id,
                    link: session.link,
                    generation,
                });
                self.runtime
                    .spawn(self.clone().pump_events(generation, session.events));
                true
            }
            Err(e) => {
                error!("Error connecting to MQTT broker: {}", e);
                state.phase = ConnectionPhase::Closed;
                state.session = None;
                self.schedule_retry(state);
                false
            }
        }
    }

    fn spawn_subscribe(self: &Arc<Self>, link: Arc<dyn BrokerLink>, filter: String, generation: u64) {
        let inner = self.clone();
        self.runtime.spawn(async move {
            match link.subscribe(filter.clone()).await {
                Ok(()) => {
                    info!("Successfully subscribed to topic '{}'.", filter);
                    inner.mark_registered(generation, &filter);
                }
                Err(e) => error!("Failed to subscribe to topic '{}': {}", filter, e),
            }
        });
    }

    fn mark_registered(&self, generation: u64, filter: &str) {
        let mut state = self.lock_state();
        if !state.is_current(generation) {
            return;
        }
        if let Some(subscription) = state.subscriptions.get_mut(filter) {
            subscription.registered_in = Some(generation);
        }
    }

    /// Handles one session's events in arrival order, which keeps per-topic ordering.
    async fn pump_events(self: Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Connected => self.on_connected(generation),
                LinkEvent::Message { topic, payload } => {
                    if !self.dispatch(generation, &topic, &payload) {
                        debug!("Session {} is gone, stopping its event pump.", generation);
                        return;
                    }
                }
                LinkEvent::Lost(reason) => {
                    self.on_lost(generation, &reason);
                    return;
                }
            }
        }
        self.on_lost(generation, "event stream closed");
    }

    fn on_connected(&self, generation: u64) {
        let mut state = self.lock_state();
        if !state.is_current(generation) {
            debug!("Ignoring handshake of a session that was already closed.");
            return;
        }

        if state.phase == ConnectionPhase::Connecting {
            state.phase = ConnectionPhase::Open;
            state.retry_attempt = 0;
            if let Some(session) = &state.session {
                info!("MQTT connected successfully as '{}'.", session.client_id);
            }
        }
    }

    fn on_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        let mut state = self.lock_state();
        if !state.is_current(generation) {
            return;
        }

        let previous = state.phase;
        state.phase = ConnectionPhase::Closed;
        state.session = None;

        if previous == ConnectionPhase::Connecting {
            error!("Error connecting to MQTT broker: {}", reason);
        } else {
            warn!("Lost connection to MQTT broker: {}", reason);
        }

        self.schedule_retry(&mut state);
    }

    /// Returns false once the session is stale.
    fn dispatch(&self, generation: u64, topic: &str, payload: &[u8]) -> bool {
        let handlers: Vec<MessageHandler> = {
            let state = self.lock_state();
            if !state.is_current(generation) {
                return false;
            }
            state
                .subscriptions
                .iter()
                .filter(|(filter, _)| topic_matches(filter, topic))
                .map(|(_, subscription)| subscription.handler.clone())
                .collect()
        };

        if handlers.is_empty() {
            warn!("Unknown topic received: {}", topic);
            return true;
        }

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
                error!("Handler for topic '{}' panicked; later messages are still delivered.", topic);
            }
        }
        true
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut HubState) {
        let max_retries = self.settings.max_retries;
        if max_retries == 0 {
            return;
        }
        if max_retries > 0 && state.retry_attempt >= max_retries as u32 {
            error!(
                "Maximum number of retries ({}) reached. Waiting for the next request.",
                max_retries
            );
            return;
        }

        let delay = self.retry_delay(state.retry_attempt);
        state.retry_attempt += 1;
        let generation = state.generation;

        warn!("Retrying MQTT connection in {:?}...", delay);
        let inner = self.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.retry(generation);
        });
    }

    fn retry(self: &Arc<Self>, generation: u64) {
        let mut state = self.lock_state();
        if state.generation != generation || state.phase != ConnectionPhase::Closed {
            debug!("Scheduled reconnect superseded.");
            return;
        }
        self.start_session(&mut state);
    }

    /// Retry interval doubled per attempt, capped at one minute.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.settings.retry_interval.as_millis() as u64;
        // Yields 2^n * base for n >= 1, so halve to start at the base interval.
        ExponentialBackoff::from_millis(2)
            .factor(base_ms)
            .map(|delay| (delay / 2).min(MAX_RETRY_DELAY))
            .nth(attempt as usize)
            .unwrap_or(MAX_RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_transport::mock::MockTransport;
    use crate::mqtt_transport::{BrokerOptions, RumqttTransport};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Barrier;
    use tokio::time::timeout;

    const TANK_1: &str = "fluir/tanque/1";
    const TANK_2: &str = "fluir/tanque/2";

    fn settings(max_retries: i32) -> HubSettings {
        HubSettings {
            max_retries,
            retry_interval: Duration::from_millis(100),
            topics: TopicConfig::default(),
        }
    }

    fn hub_with(transport: &Arc<MockTransport>, max_retries: i32) -> TelemetryHub {
        TelemetryHub::new(settings(max_retries), transport.clone()).unwrap()
    }

    async fn eventually<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    async fn wait_for_value(hub: &TelemetryHub, signal: Signal, expected: f32) {
        let mut observer = hub.watch(signal);
        timeout(
            Duration::from_secs(1),
            observer.wait_for(|reading| reading.as_ref().map(|r| r.value) == Some(expected)),
        )
        .await
        .expect("value never arrived")
        .expect("cell dropped");
    }

    #[test]
    fn test_new_requires_runtime() {
        let transport = MockTransport::new();
        let result = TelemetryHub::new(settings(0), transport);
        assert!(matches!(result, Err(HubError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_subscribe_twice_registers_once() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);

        assert_eq!(
            hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap(),
            SubscribeOutcome::Registered
        );
        assert_eq!(
            hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap(),
            SubscribeOutcome::AlreadySubscribed
        );

        let link = transport.latest();
        eventually(|| link.registrations_of(TANK_1) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.registrations_of(TANK_1), 1);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(hub.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_well_formed_payload_updates_cell() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);
        link.deliver(TANK_1, "  3.14 \n");

        wait_for_value(&hub, Signal::Tank1Level, 3.14).await;
    }

    #[tokio::test]
    async fn test_malformed_payloads_leave_cell_unchanged() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();
        hub.subscribe_signal(TANK_2, Signal::Tank2Level).unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);
        link.deliver(TANK_1, "10");
        wait_for_value(&hub, Signal::Tank1Level, 10.0).await;

        link.deliver(TANK_1, "");
        link.deliver(TANK_1, "abc");
        link.deliver(TANK_1, "12.3.4");
        // Same pump, so once tank 2 updates the malformed messages were handled.
        link.deliver(TANK_2, "1");
        wait_for_value(&hub, Signal::Tank2Level, 1.0).await;

        assert_eq!(hub.latest(Signal::Tank1Level), Some(10.0));

        link.deliver(TANK_1, "11");
        wait_for_value(&hub, Signal::Tank1Level, 11.0).await;
    }

    #[tokio::test]
    async fn test_tank_1_and_colony_1_mirror_into_legacy() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_default_signals().unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);

        link.deliver(TANK_2, "45.5");
        link.deliver("fluir/caudal/2", "3");
        wait_for_value(&hub, Signal::Colony2Flow, 3.0).await;
        assert_eq!(hub.latest(Signal::Tank2Level), Some(45.5));
        assert_eq!(hub.latest(Signal::Legacy), None);

        link.deliver(TANK_1, "80");
        wait_for_value(&hub, Signal::Legacy, 80.0).await;

        link.deliver("fluir/caudal/1", "12.5");
        wait_for_value(&hub, Signal::Legacy, 12.5).await;
        assert_eq!(hub.latest(Signal::Colony1Flow), Some(12.5));
        assert_eq!(hub.latest(Signal::Tank1Level), Some(80.0));
    }

    #[tokio::test]
    async fn test_publish_bootstraps_connection() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        assert_eq!(hub.phase(), ConnectionPhase::Uninitialized);

        let done = hub.publish("fluir/umbrales/1", r#"{"min":20,"max":80}"#).unwrap();

        assert_eq!(hub.phase(), ConnectionPhase::Connecting);
        assert_eq!(transport.open_count(), 1);
        assert!(hub.client_id().unwrap().starts_with("fluir_hub_"));

        done.await.unwrap().unwrap();
        assert_eq!(
            transport.latest().publications(),
            vec![("fluir/umbrales/1".to_string(), r#"{"min":20,"max":80}"#.to_string())]
        );

        transport.latest().emit(LinkEvent::Connected);
        eventually(|| hub.phase() == ConnectionPhase::Open).await;
    }

    #[tokio::test]
    async fn test_subscribe_bootstraps_connection() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);

        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();
        assert_eq!(hub.phase(), ConnectionPhase::Connecting);
        assert_eq!(transport.open_count(), 1);

        // Later operations reuse the same session.
        hub.connect();
        hub.publish("fluir/umbrales/2", "{}").unwrap().await.unwrap().unwrap();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect_resumes_delivery() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();

        let first = transport.latest();
        first.emit(LinkEvent::Connected);
        eventually(|| hub.phase() == ConnectionPhase::Open).await;

        hub.disconnect();
        assert_eq!(hub.phase(), ConnectionPhase::Closed);
        assert!(hub.subscriptions().is_empty());
        eventually(|| first.is_closed()).await;

        // Messages from the closed session are dropped.
        first.deliver(TANK_1, "99");

        assert_eq!(
            hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap(),
            SubscribeOutcome::Registered
        );
        assert_eq!(transport.open_count(), 2);

        let second = transport.latest();
        assert_ne!(first.client_id, second.client_id);
        eventually(|| second.registrations_of(TANK_1) == 1).await;

        second.emit(LinkEvent::Connected);
        second.deliver(TANK_1, "55.0");
        wait_for_value(&hub, Signal::Tank1Level, 55.0).await;
        assert_eq!(hub.phase(), ConnectionPhase::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_subscribers_share_one_subscription() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        let barrier = Arc::new(Barrier::new(2));

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let hub = hub.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap());
        }

        let registered = outcomes
            .iter()
            .filter(|outcome| **outcome == SubscribeOutcome::Registered)
            .count();
        assert_eq!(registered, 1);
        assert_eq!(transport.open_count(), 1);

        let link = transport.latest();
        eventually(|| link.registrations_of(TANK_1) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(link.registrations_of(TANK_1), 1);
    }

    #[tokio::test]
    async fn test_two_tanks_end_to_end() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();
        hub.subscribe_signal(TANK_2, Signal::Tank2Level).unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);
        link.deliver(TANK_1, "80");
        link.deliver(TANK_2, "45.5");

        wait_for_value(&hub, Signal::Tank2Level, 45.5).await;
        assert_eq!(hub.latest(Signal::Tank1Level), Some(80.0));
        assert_eq!(hub.latest(Signal::Tank2Level), Some(45.5));
        assert_eq!(hub.latest(Signal::Legacy), Some(80.0));
    }

    #[tokio::test]
    async fn test_disconnect_during_handshake_is_not_resurrected() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 3);
        hub.connect();
        assert_eq!(hub.phase(), ConnectionPhase::Connecting);

        hub.disconnect();
        assert_eq!(hub.phase(), ConnectionPhase::Closed);

        transport.session(0).emit(LinkEvent::Connected);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(hub.phase(), ConnectionPhase::Closed);
        assert_eq!(hub.client_id(), None);
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_without_connection_is_noop() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);

        hub.disconnect();
        hub.disconnect();

        assert_eq!(hub.phase(), ConnectionPhase::Uninitialized);
        assert_eq!(transport.open_attempts(), 0);
    }

    #[tokio::test]
    async fn test_panicking_alert_handler_keeps_delivering() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        let received = Arc::new(StdMutex::new(Vec::new()));

        let sink = received.clone();
        hub.subscribe_to_alerts("fluir/alertas", move |message| {
            if message == "boom" {
                panic!("alert handler failure");
            }
            sink.lock().unwrap().push(message);
        })
        .unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);
        link.deliver("fluir/alertas", "boom");
        link.deliver("fluir/alertas", "  nivel bajo en tanque 2 ");

        eventually(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(received.lock().unwrap()[0], "nivel bajo en tanque 2");
    }

    #[tokio::test]
    async fn test_unknown_topics_are_ignored() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal("fluir/tanque/+", Signal::Tank2Level).unwrap();

        let link = transport.latest();
        link.emit(LinkEvent::Connected);
        link.deliver("fluir/otro", "5");
        link.deliver("fluir/tanque/7", "6");

        wait_for_value(&hub, Signal::Tank2Level, 6.0).await;
        assert_eq!(hub.latest(Signal::Tank1Level), None);
    }

    #[tokio::test]
    async fn test_invalid_topics_are_rejected_without_connecting() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);

        assert!(matches!(
            hub.subscribe_signal("", Signal::Tank1Level),
            Err(HubError::Topic(TopicError::Empty))
        ));
        assert!(matches!(
            hub.publish("fluir/+/1", "1"),
            Err(HubError::Topic(TopicError::WildcardInName(_)))
        ));
        assert_eq!(transport.open_attempts(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_reported_through_completion() {
        let transport = MockTransport::new();
        transport.fail_next_opens(1);
        let hub = hub_with(&transport, 0);

        let done = hub.publish("fluir/umbrales/1", "{}").unwrap();
        assert!(matches!(done.await.unwrap(), Err(HubError::NotConnected)));
        assert_eq!(hub.phase(), ConnectionPhase::Closed);

        // The next request tries again.
        hub.publish("fluir/umbrales/1", "{}").unwrap().await.unwrap().unwrap();
        assert_eq!(transport.open_attempts(), 2);
    }

    #[tokio::test]
    async fn test_publish_thresholds_as_json() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        let thresholds = PumpThresholds::new(25, 75).unwrap();

        hub.publish_thresholds(Pump::Pump2, &thresholds)
            .unwrap()
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            transport.latest().publications(),
            vec![("fluir/umbrales/2".to_string(), r#"{"min":25,"max":75}"#.to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_reconnects_and_restores_subscriptions() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 2);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();

        let first = transport.latest();
        first.emit(LinkEvent::Connected);
        eventually(|| hub.phase() == ConnectionPhase::Open).await;

        first.emit(LinkEvent::Lost("network unreachable".to_string()));
        eventually(|| hub.phase() == ConnectionPhase::Closed).await;
        assert_eq!(hub.subscriptions().len(), 1);
        assert!(!hub.subscriptions()[0].active);

        eventually(|| transport.open_count() == 2).await;
        let second = transport.latest();
        eventually(|| second.registrations_of(TANK_1) == 1).await;

        second.emit(LinkEvent::Connected);
        second.deliver(TANK_1, "42");
        wait_for_value(&hub, Signal::Tank1Level, 42.0).await;
        assert!(hub.subscriptions()[0].active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let transport = MockTransport::new();
        transport.fail_next_opens(10);
        let hub = hub_with(&transport, 2);

        hub.connect();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // The first attempt plus two retries.
        assert_eq!(transport.open_attempts(), 3);
        assert_eq!(hub.phase(), ConnectionPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let transport = MockTransport::new();
        transport.fail_next_opens(1);
        let hub = hub_with(&transport, 5);

        hub.connect();
        assert_eq!(hub.phase(), ConnectionPhase::Closed);
        hub.disconnect();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(transport.open_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_delay_doubles_and_caps() {
        let transport = MockTransport::new();
        let hub = TelemetryHub::new(
            HubSettings {
                max_retries: -1,
                retry_interval: Duration::from_millis(5000),
                topics: TopicConfig::default(),
            },
            transport,
        )
        .unwrap();

        assert_eq!(hub.inner.retry_delay(0), Duration::from_millis(5000));
        assert_eq!(hub.inner.retry_delay(1), Duration::from_millis(10_000));
        assert_eq!(hub.inner.retry_delay(2), Duration::from_millis(20_000));
        assert_eq!(hub.inner.retry_delay(10), MAX_RETRY_DELAY);
        assert_eq!(hub.inner.retry_delay(200), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_retry_delay_keeps_odd_intervals() {
        let transport = MockTransport::new();
        let hub = TelemetryHub::new(
            HubSettings {
                max_retries: -1,
                retry_interval: Duration::from_millis(5001),
                topics: TopicConfig::default(),
            },
            transport,
        )
        .unwrap();

        assert_eq!(hub.inner.retry_delay(0), Duration::from_millis(5001));
        assert_eq!(hub.inner.retry_delay(1), Duration::from_millis(10_002));
    }

    #[tokio::test]
    async fn test_subscription_active_once_confirmed_on_open_session() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();

        let link = transport.latest();
        eventually(|| link.registrations_of(TANK_1) == 1).await;
        assert_eq!(hub.phase(), ConnectionPhase::Connecting);
        assert!(!hub.subscriptions()[0].active);

        link.emit(LinkEvent::Connected);
        eventually(|| hub.subscriptions()[0].active).await;
    }

    #[tokio::test]
    async fn test_rejected_subscription_stays_inactive() {
        let transport = MockTransport::new();
        let hub = hub_with(&transport, 0);
        hub.subscribe_signal(TANK_1, Signal::Tank1Level).unwrap();

        // The subscribe task has not run yet.
        let link = transport.latest();
        link.reject_subscriptions();
        link.emit(LinkEvent::Connected);
        eventually(|| hub.phase() == ConnectionPhase::Open).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(link.registrations_of(TANK_1), 0);
        assert!(!hub.subscriptions()[0].active);
    }

    #[tokio::test]
    async fn test_publish_while_connecting_fails_when_handshake_fails() {
        let transport = Arc::new(RumqttTransport::new(BrokerOptions {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: String::new(),
            password: String::new(),
            tls_enabled: false,
            keep_alive: Duration::from_secs(30),
            request_capacity: 10,
        }));
        let hub = TelemetryHub::new(settings(0), transport).unwrap();

        let done = hub.publish("fluir/umbrales/1", r#"{"min":20,"max":80}"#).unwrap();
        assert_eq!(hub.phase(), ConnectionPhase::Connecting);

        let result = timeout(Duration::from_secs(10), done)
            .await
            .expect("completion never resolved")
            .unwrap();
        assert!(matches!(result, Err(HubError::Transport(TransportError::Closed))));
        eventually(|| hub.phase() == ConnectionPhase::Closed).await;
    }
}
