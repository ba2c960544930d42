//! The hub's single upstream MQTT connection.
//!
//! [`BrokerConnection`] is a cheap, cloneable handle. It owns the set of
//! subscribed topics (process-local truth, replayed after every reconnect)
//! and publishes connection-state transitions on a `watch` channel.
//!
//! The rumqttc event loop is driven by one background task started with
//! [`BrokerConnection::connect`]. Inbound publishes are forwarded over an
//! mpsc channel so that message handling runs in a single serialized context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;

/// First retry delay after a connection error.
const BACKOFF_BASE_SEC: u64 = 1;
/// Upper bound of the exponential phase.
const BACKOFF_CAP_SEC: u64 = 30;
/// Consecutive failures before switching to the cool-down interval.
const BACKOFF_MAX_ATTEMPTS: u32 = 10;
/// Fixed wait once the exponential phase is exhausted.
const BACKOFF_COOLDOWN_SEC: u64 = 60;

/// Capacity of the rumqttc request channel.
const REQUEST_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("mqtt client request failed: {0}")]
    Client(#[from] ClientError),
}

/// A message received from the broker, queued for the processing loop.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The request side of an MQTT client. Implemented for rumqttc's
/// [`AsyncClient`]; tests substitute a recorder.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError>;
    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError>;
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ClientError>;
}

#[async_trait]
impl BrokerClient for AsyncClient {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        AsyncClient::subscribe(self, topic, qos).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
        AsyncClient::unsubscribe(self, topic).await
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), ClientError> {
        AsyncClient::publish(self, topic, qos, false, payload).await
    }
}

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Exponential backoff (1s doubling, capped at 30s). After
/// `BACKOFF_MAX_ATTEMPTS` consecutive failures the next delay is the fixed
/// cool-down and the sequence starts over. It never gives up.
#[derive(Debug, Default)]
pub struct Backoff {
    failures: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        if self.failures >= BACKOFF_MAX_ATTEMPTS {
            self.failures = 0;
            return Duration::from_secs(BACKOFF_COOLDOWN_SEC);
        }
        let secs = BACKOFF_BASE_SEC
            .saturating_mul(1u64 << self.failures.min(16))
            .min(BACKOFF_CAP_SEC);
        self.failures += 1;
        Duration::from_secs(secs)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

struct Inner {
    client: Arc<dyn BrokerClient>,
    state: watch::Sender<ConnectionState>,
    /// Held across the broker calls that change subscriptions so that a
    /// resubscription pass and a fresh `subscribe` never interleave.
    topics: Mutex<BTreeSet<String>>,
    in_flight: AtomicBool,
    /// Bumped on every ConnAck and every loss. A resubscription pass only
    /// marks the link live if no newer session has started since.
    generation: AtomicU64,
}

/// Build the rumqttc client/event-loop pair for `settings`.
pub fn open(settings: &BrokerSettings) -> (BrokerConnection, EventLoop) {
    let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    options.set_keep_alive(Duration::from_secs(settings.keep_alive_sec));
    options.set_clean_session(true);

    let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
    (BrokerConnection::new(Arc::new(client)), eventloop)
}

impl BrokerConnection {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                client,
                state,
                topics: Mutex::new(BTreeSet::new()),
                in_flight: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start driving `eventloop` in a background task. Returns `None` (and
    /// drops `eventloop`) if a driver is already running for this connection.
    pub fn connect(
        &self,
        eventloop: EventLoop,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Option<JoinHandle<()>> {
        if self
            .inner
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("broker connect already in flight, ignoring");
            return None;
        }

        let conn = self.clone();
        Some(tokio::spawn(async move {
            conn.drive(eventloop, inbound).await;
            conn.inner.in_flight.store(false, Ordering::Release);
        }))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe connection-state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.inner.topics.lock().await.iter().cloned().collect()
    }

    /// Add `topic` to the subscription set. Only the first call per topic
    /// reaches the broker; while disconnected the topic is recorded and sent
    /// on the next connect.
    pub async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.lock().await;
        if !topics.insert(topic.to_string()) {
            debug!(%topic, "already subscribed");
            return Ok(());
        }
        if self.is_connected() {
            self.inner.client.subscribe(topic, QoS::AtLeastOnce).await?;
            info!(%topic, "subscribed");
        } else {
            debug!(%topic, "subscription recorded, will be sent on connect");
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let mut topics = self.inner.topics.lock().await;
        if !topics.remove(topic) {
            return Ok(());
        }
        if self.is_connected() {
            self.inner.client.unsubscribe(topic).await?;
            info!(%topic, "unsubscribed");
        }
        Ok(())
    }

    /// Publish without retain. Fails fast with [`BrokerError::NotConnected`]
    /// when there is no live connection.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.inner.client.publish(topic, qos, payload.into()).await?;
        Ok(())
    }

    // -- Event-loop side ------------------------------------------------------

    async fn drive(&self, mut eventloop: EventLoop, inbound: mpsc::Sender<InboundMessage>) {
        let mut backoff = Backoff::default();
        self.set_state(ConnectionState::Connecting);

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff.reset();
                    let session = self.begin_session();
                    // Resubscribe off the polling task: the subscribe requests
                    // are only flushed while the event loop keeps polling.
                    let conn = self.clone();
                    tokio::spawn(async move { conn.restore_subscriptions(session).await });
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    let msg = InboundMessage {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    };
                    if inbound.send(msg).await.is_err() {
                        info!("inbound channel closed, stopping broker driver");
                        self.set_state(ConnectionState::Closed);
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("broker sent disconnect");
                    self.end_session(ConnectionState::Closed);
                }
                Ok(_) => {}
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        retry_in_sec = delay.as_secs(),
                        "broker connection error"
                    );
                    self.on_connection_lost();
                    tokio::time::sleep(delay).await;
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    fn begin_session(&self) -> u64 {
        self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn is_current(&self, session: u64) -> bool {
        self.inner.generation.load(Ordering::Acquire) == session
    }

    /// Replay every recorded subscription, then mark the connection live
    /// unless `session` was superseded by a loss or a newer ConnAck.
    pub(crate) async fn restore_subscriptions(&self, session: u64) {
        let topics = self.inner.topics.lock().await;
        for topic in topics.iter() {
            if !self.is_current(session) {
                debug!(session, "connection lost during resubscribe");
                return;
            }
            if let Err(e) = self.inner.client.subscribe(topic, QoS::AtLeastOnce).await {
                warn!(%topic, error = %e, "resubscribe failed");
            }
        }
        if self.transition(ConnectionState::Connected, || self.is_current(session)) {
            info!(topics = topics.len(), "broker connected, subscriptions restored");
        } else if !self.is_current(session) {
            debug!(session, "stale resubscribe finished, state left as is");
        }
    }

    /// Start a session and restore subscriptions in one step.
    #[cfg(test)]
    pub(crate) async fn on_connected(&self) {
        let session = self.begin_session();
        self.restore_subscriptions(session).await;
    }

    pub(crate) fn on_connection_lost(&self) {
        self.end_session(ConnectionState::Error);
    }

    fn end_session(&self, next: ConnectionState) {
        self.transition(next, || {
            self.inner.generation.fetch_add(1, Ordering::AcqRel);
            true
        });
    }

    fn set_state(&self, next: ConnectionState) {
        self.transition(next, || true);
    }

    /// Move to `next` if `allowed` holds. `allowed` runs under the watch
    /// channel's lock, so it is atomic with respect to other transitions.
    fn transition(&self, next: ConnectionState, allowed: impl FnOnce() -> bool) -> bool {
        self.inner.state.send_if_modified(|current| {
            if !allowed() || *current == next {
                return false;
            }
            debug!(from = %current, to = %next, "broker state");
            *current = next;
            true
        })
    }
}

// ===========================================================================
// Test support
// ===========================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        Subscribe(String),
        Unsubscribe(String),
        Publish { topic: String, payload: String },
    }

    /// Records every request instead of talking to a broker.
    #[derive(Default)]
    pub(crate) struct RecordingClient {
        calls: parking_lot::Mutex<Vec<Call>>,
    }

    impl RecordingClient {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        pub(crate) fn publishes(&self) -> Vec<(String, String)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Publish { topic, payload } => Some((topic, payload)),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.calls.lock().clear();
        }
    }

    #[async_trait]
    impl BrokerClient for RecordingClient {
        async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), ClientError> {
            self.calls.lock().push(Call::Subscribe(topic.to_string()));
            Ok(())
        }

        async fn unsubscribe(&self, topic: &str) -> Result<(), ClientError> {
            self.calls.lock().push(Call::Unsubscribe(topic.to_string()));
            Ok(())
        }

        async fn publish(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), ClientError> {
            self.calls.lock().push(Call::Publish {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(&payload).into_owned(),
            });
            Ok(())
        }
    }

    pub(crate) fn recording_connection() -> (BrokerConnection, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::default());
        (BrokerConnection::new(client.clone()), client)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
