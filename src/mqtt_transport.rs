use crate::config::Config;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
    Transport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("MQTT client request failed: {0}")]
    Client(String),
    #[error("broker session is closed")]
    Closed,
    #[error("broker rejected the request")]
    Rejected,
}

/// What a live session reports back to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Lost(String),
}

/// Outgoing side of one broker session.
pub trait BrokerLink: Send + Sync {
    fn subscribe(&self, filter: String) -> BoxFuture<'static, Result<(), TransportError>>;
    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'static, Result<(), TransportError>>;
    fn close(&self) -> BoxFuture<'static, Result<(), TransportError>>;
}

pub struct BrokerSession {
    pub link: Arc<dyn BrokerLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens sessions. Opening must not wait on the network; the handshake
/// outcome arrives later as a [`LinkEvent`].
pub trait BrokerTransport: Send + Sync {
    fn open(&self, client_id: &str, runtime: &Handle) -> Result<BrokerSession, TransportError>;
}

/// Broker endpoint and credentials.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls_enabled: bool,
    pub keep_alive: Duration,
    pub request_capacity: usize,
}

impl From<&Config> for BrokerOptions {
    fn from(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            username: config.mqtt_username.clone(),
            password: config.mqtt_password.clone(),
            tls_enabled: config.mqtt_ssl_enabled,
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            // Requests made while connecting wait here until the handshake completes.
            request_capacity: 64,
        }
    }
}

pub struct RumqttTransport {
    options: BrokerOptions,
}

impl RumqttTransport {
    pub fn new(options: BrokerOptions) -> Self {
        Self { options }
    }

    fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        debug!("Configuring MQTT broker at {}:{}...", self.options.host, self.options.port);

        let mut mqtt_options = MqttOptions::new(client_id, &self.options.host, self.options.port);
        mqtt_options.set_keep_alive(self.options.keep_alive);
        mqtt_options.set_clean_session(true);

        if !self.options.username.is_empty() && !self.options.password.is_empty() {
            mqtt_options.set_credentials(&self.options.username, &self.options.password);
        }

        if self.options.tls_enabled {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        mqtt_options
    }
}

impl BrokerTransport for RumqttTransport {
    fn open(&self, client_id: &str, runtime: &Handle) -> Result<BrokerSession, TransportError> {
        if client_id.is_empty() || client_id.starts_with(' ') {
            return Err(TransportError::Client(format!("invalid client id '{}'", client_id)));
        }

        let (client, eventloop) =
            AsyncClient::new(self.mqtt_options(client_id), self.options.request_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending = PendingRequests::default();

        runtime.spawn(drive_event_loop(eventloop, events_tx, pending.clone()));

        Ok(BrokerSession {
            link: Arc::new(RumqttLink { client, pending }),
            events: events_rx,
        })
    }
}

type Ack = oneshot::Sender<Result<(), TransportError>>;

#[derive(Clone, Copy)]
enum RequestKind {
    Publish,
    Subscribe,
}

/// Requests handed to the client whose outcome is not known yet.
#[derive(Default)]
struct InFlight {
    closed: bool,
    publishes: VecDeque<Ack>,
    subscribes: VecDeque<Ack>,
    awaiting_suback: HashMap<u16, Ack>,
}

impl InFlight {
    fn queue(&mut self, kind: RequestKind) -> &mut VecDeque<Ack> {
        match kind {
            RequestKind::Publish => &mut self.publishes,
            RequestKind::Subscribe => &mut self.subscribes,
        }
    }
}

/// Shared between a session's link and its event loop. The client hands
/// requests to the event loop in order, so acks are matched first in, first out.
#[derive(Clone, Default)]
struct PendingRequests(Arc<Mutex<InFlight>>);

impl PendingRequests {
    fn lock(&self) -> MutexGuard<'_, InFlight> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `request` and queues its ack under one lock, so the event loop
    /// can never see the outgoing packet before the ack is queued.
    fn track<F>(&self, kind: RequestKind, request: F) -> BoxFuture<'static, Result<(), TransportError>>
    where
        F: FnOnce() -> Result<(), ClientError>,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = {
            let mut in_flight = self.lock();
            if in_flight.closed {
                Err(TransportError::Closed)
            } else {
                match request() {
                    Ok(()) => {
                        in_flight.queue(kind).push_back(ack_tx);
                        Ok(())
                    }
                    Err(e) => Err(TransportError::Client(e.to_string())),
                }
            }
        };

        async move {
            queued?;
            ack_rx.await.unwrap_or(Err(TransportError::Closed))
        }
        .boxed()
    }

    fn publish_sent(&self) {
        if let Some(ack) = self.lock().publishes.pop_front() {
            let _ = ack.send(Ok(()));
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        let mut in_flight = self.lock();
        if let Some(ack) = in_flight.subscribes.pop_front() {
            in_flight.awaiting_suback.insert(pkid, ack);
        }
    }

    fn subscribe_acked(&self, pkid: u16, result: Result<(), TransportError>) {
        if let Some(ack) = self.lock().awaiting_suback.remove(&pkid) {
            let _ = ack.send(result);
        }
    }

    /// Fails everything still waiting and refuses later requests.
    fn close(&self) {
        let mut guard = self.lock();
        let in_flight = &mut *guard;
        in_flight.closed = true;
        let waiting: Vec<Ack> = in_flight
            .publishes
            .drain(..)
            .chain(in_flight.subscribes.drain(..))
            .chain(in_flight.awaiting_suback.drain().map(|(_, ack)| ack))
            .collect();
        drop(guard);

        for ack in waiting {
            let _ = ack.send(Err(TransportError::Closed));
        }
    }
}

/// Publishes complete once the packet is written to the broker connection;
/// subscribes complete on the broker's SubAck.
struct RumqttLink {
    client: AsyncClient,
    pending: PendingRequests,
}

impl BrokerLink for RumqttLink {
    fn subscribe(&self, filter: String) -> BoxFuture<'static, Result<(), TransportError>> {
        self.pending.track(RequestKind::Subscribe, || {
            self.client.try_subscribe(filter, QoS::AtLeastOnce)
        })
    }

    fn publish(&self, topic: String, payload: Vec<u8>) -> BoxFuture<'static, Result<(), TransportError>> {
        self.pending.track(RequestKind::Publish, || {
            self.client.try_publish(topic, QoS::AtLeastOnce, false, payload)
        })
    }

    fn close(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let client = self.client.clone();
        async move {
            client
                .disconnect()
                .await
                .map_err(|_| TransportError::Closed)
        }
        .boxed()
    }
}

/// Polls one session's event loop until the first error or an outgoing disconnect.
/// Reconnecting is left to the hub, so the loop is never polled after an error.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    pending: PendingRequests,
) {
    loop {
        let forwarded = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected to MQTT broker.");
                events.send(LinkEvent::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => events.send(LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = if ack.return_codes.contains(&SubscribeReasonCode::Failure) {
                    warn!("Broker rejected subscription (packet id {}).", ack.pkid);
                    Err(TransportError::Rejected)
                } else {
                    Ok(())
                };
                pending.subscribe_acked(ack.pkid, result);
                Ok(())
            }
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                pending.publish_sent();
                Ok(())
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                pending.subscribe_sent(pkid);
                Ok(())
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(LinkEvent::Lost("broker sent disconnect".to_string()));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Outgoing disconnect, stopping event loop.");
                break;
            }
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Error in MQTT event loop: {:?}", e);
                let _ = events.send(LinkEvent::Lost(e.to_string()));
                break;
            }
        };

        if forwarded.is_err() {
            debug!("Hub dropped the session, stopping event loop.");
            break;
        }
    }

    pending.close();
}
