//! # Connection Lifecycle
//!
//! One task per connection walks the session through
//! `Connecting → AwaitingSubscription → Subscribed → Draining → Closed`.
//!
//! The handler is transport-agnostic: it consumes a stream of [`Inbound`]
//! frames and feeds a sink of [`Outbound`] frames. The axum websocket in
//! `servers` and the in-memory channels in the tests plug in the same way.
//!
//! The handshake never rejects a client. A missing, unparseable or late
//! (past `handshake_timeout`) subscription request becomes the wildcard.

use std::fmt::Display;
use std::pin::pin;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::core::model::{scalar_text, Payload, Snapshot, TopicSelector};
use crate::core::registry::SubscriptionHandle;
use crate::core::Relay;

/// Lifecycle position of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport not yet accepted.
    Connecting,
    /// Waiting for the first message, which selects the topic.
    AwaitingSubscription,
    /// Registered with the registry.
    Subscribed,
    /// Registered; further inbound messages are discarded.
    Draining,
    /// Unregistered. Terminal.
    Closed,
}

/// A frame received from the client, stripped of transport detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text message.
    Text(String),
    /// A binary message, read as UTF-8 JSON during the handshake.
    Binary(Vec<u8>),
    /// A ping; the transport answers it.
    Ping,
    /// A pong.
    Pong,
    /// The peer is closing.
    Close,
}

/// A frame the session wants written to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A rendered record array.
    Payload(Payload),
    /// A keepalive ping.
    Ping,
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or end of stream.
    PeerClosed,
    /// Reading from the transport failed.
    ReadError(String),
    /// Writing to the transport failed.
    SendFailed(String),
    /// The delivery engine dropped the subscription.
    Evicted,
    /// The process is shutting down.
    Shutdown,
}

/// What [`serve_connection`] reports once the connection is gone.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Remote peer description.
    pub peer: String,
    /// The bound selector; `None` if the handshake never completed.
    pub selector: Option<TopicSelector>,
    /// The subscription handle, if one was registered.
    pub handle: Option<SubscriptionHandle>,
    /// Payloads written to the transport.
    pub payloads_sent: u64,
    /// Client messages discarded after subscription.
    pub inbound_ignored: u64,
    /// Why the session ended.
    pub reason: CloseReason,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeRequest {
    #[serde(default, alias = "game_id", alias = "game_ID")]
    topic_id: Option<Value>,
    #[serde(default)]
    full_file: Option<Value>,
}

/// Reads a subscription request. Anything that does not name a topic,
/// including invalid JSON, selects every topic.
pub fn parse_selector(text: &str) -> TopicSelector {
    let request = match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => serde_json::from_value::<SubscribeRequest>(value).ok(),
        _ => None,
    };
    let Some(request) = request else {
        tracing::debug!("subscription request is not a JSON object; using wildcard");
        return TopicSelector::All;
    };
    if matches!(request.full_file, Some(Value::Bool(true))) {
        return TopicSelector::All;
    }
    request
        .topic_id
        .as_ref()
        .and_then(scalar_text)
        .filter(|topic| !topic.is_empty())
        .map(|topic| TopicSelector::topic(topic.into_owned()))
        .unwrap_or_default()
}

/// # Session
///
/// Owns the registration of one connection. Closing is idempotent and also
/// happens on drop, so the subscription can never outlive its connection.
pub struct Session {
    relay: Relay,
    peer: String,
    state: SessionState,
    selector: Option<TopicSelector>,
    handle: Option<SubscriptionHandle>,
}

impl Session {
    /// A session for `peer`, not yet registered.
    pub fn new(relay: Relay, peer: impl Into<String>) -> Self {
        Self {
            relay,
            peer: peer.into(),
            state: SessionState::Connecting,
            selector: None,
            handle: None,
        }
    }

    /// Current lifecycle position.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Remote peer description.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// The registered handle; `None` before subscribing and after close.
    pub fn handle(&self) -> Option<SubscriptionHandle> {
        self.handle
    }

    /// The bound selector.
    pub fn selector(&self) -> Option<&TopicSelector> {
        self.selector.as_ref()
    }

    /// Marks the transport as open and waiting for the first message.
    pub fn accept(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::AwaitingSubscription;
        }
    }

    /// Registers the connection and returns the queue the delivery engine
    /// feeds. With `send_initial_snapshot` set, the current view is queued
    /// straight away.
    pub fn subscribe(&mut self, selector: TopicSelector) -> mpsc::Receiver<Payload> {
        let settings = self.relay.settings();
        let (tx, rx) = mpsc::channel(settings.client_queue_capacity.max(1));
        let handle = self
            .relay
            .registry()
            .register(self.peer.clone(), selector.clone(), tx);

        self.handle = Some(handle);
        self.selector = Some(selector);
        self.state = SessionState::Subscribed;

        if settings.send_initial_snapshot {
            self.queue_initial(handle, self.relay.store().get());
        }
        rx
    }

    /// Queues the view of `snapshot`, then of every revision published in
    /// the meantime. A tick racing the registration can queue a newer view
    /// ahead of the initial one; the queue still ends on the latest.
    fn queue_initial(&self, handle: SubscriptionHandle, mut snapshot: Arc<Snapshot>) {
        loop {
            if let Err(e) = self.relay.dispatcher().deliver_to(handle, &snapshot) {
                tracing::debug!(subscription = %handle, error = %e, "initial snapshot not queued");
                return;
            }
            let latest = self.relay.store().get();
            if latest.revision() <= snapshot.revision() {
                return;
            }
            tracing::debug!(
                subscription = %handle,
                from = snapshot.revision(),
                to = latest.revision(),
                "snapshot published during subscribe; queueing latest"
            );
            snapshot = latest;
        }
    }

    /// From here on inbound messages are read and discarded.
    pub fn drain(&mut self) {
        if self.state == SessionState::Subscribed {
            self.state = SessionState::Draining;
        }
    }

    /// Unregisters the subscription, if any. Safe to call repeatedly and
    /// after the delivery engine already removed it.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.relay.registry().unregister(handle);
        }
        self.state = SessionState::Closed;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

enum Handshake {
    Selector(TopicSelector),
    Gone(CloseReason),
}

async fn read_handshake<I, E>(inbound: &mut std::pin::Pin<&mut I>) -> Handshake
where
    I: Stream<Item = Result<Inbound, E>>,
    E: Display,
{
    loop {
        match inbound.next().await {
            Some(Ok(Inbound::Text(text))) => return Handshake::Selector(parse_selector(&text)),
            Some(Ok(Inbound::Binary(bytes))) => {
                let selector = std::str::from_utf8(&bytes)
                    .map(parse_selector)
                    .unwrap_or_default();
                return Handshake::Selector(selector);
            }
            Some(Ok(Inbound::Ping | Inbound::Pong)) => continue,
            Some(Ok(Inbound::Close)) | None => return Handshake::Gone(CloseReason::PeerClosed),
            Some(Err(e)) => return Handshake::Gone(CloseReason::ReadError(e.to_string())),
        }
    }
}

async fn keepalive_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs one connection from handshake to close.
pub async fn serve_connection<I, O, E>(
    relay: Relay,
    peer: String,
    inbound: I,
    outbound: O,
    shutdown: CancellationToken,
) -> SessionSummary
where
    I: Stream<Item = Result<Inbound, E>>,
    O: Sink<Outbound>,
    O::Error: Display,
    E: Display,
{
    let mut inbound = pin!(inbound);
    let mut outbound = pin!(outbound);
    let handshake_timeout = relay.settings().handshake_timeout;
    let keepalive_every = relay.settings().keepalive_interval;

    let mut session = Session::new(relay, peer);
    session.accept();
    let mut payloads_sent = 0u64;
    let mut inbound_ignored = 0u64;

    let handshake = tokio::select! {
        _ = shutdown.cancelled() => Handshake::Gone(CloseReason::Shutdown),
        first = tokio::time::timeout(handshake_timeout, read_handshake(&mut inbound)) => {
            first.unwrap_or_else(|_| {
                tracing::info!(peer = %session.peer(), "no subscription request in time; using wildcard");
                Handshake::Selector(TopicSelector::All)
            })
        }
    };

    let reason = match handshake {
        Handshake::Gone(reason) => reason,
        Handshake::Selector(selector) => {
            let mut queue = session.subscribe(selector);
            session.drain();

            let mut keepalive = keepalive_every.map(|every| {
                let mut interval = tokio::time::interval_at(Instant::now() + every, every);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                interval
            });

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break CloseReason::Shutdown,
                    payload = queue.recv() => match payload {
                        Some(payload) => {
                            if let Err(e) = outbound.send(Outbound::Payload(payload)).await {
                                break CloseReason::SendFailed(e.to_string());
                            }
                            payloads_sent += 1;
                        }
                        None => break CloseReason::Evicted,
                    },
                    frame = inbound.next() => match frame {
                        Some(Ok(Inbound::Text(_) | Inbound::Binary(_))) => {
                            inbound_ignored += 1;
                            tracing::debug!(peer = %session.peer(), "ignoring client message after subscription");
                        }
                        Some(Ok(Inbound::Ping | Inbound::Pong)) => {}
                        Some(Ok(Inbound::Close)) | None => break CloseReason::PeerClosed,
                        Some(Err(e)) => break CloseReason::ReadError(e.to_string()),
                    },
                    _ = keepalive_tick(&mut keepalive) => {
                        if let Err(e) = outbound.send(Outbound::Ping).await {
                            break CloseReason::SendFailed(e.to_string());
                        }
                    }
                }
            }
        }
    };

    let summary = SessionSummary {
        peer: session.peer().to_string(),
        selector: session.selector().cloned(),
        handle: session.handle(),
        payloads_sent,
        inbound_ignored,
        reason,
    };
    session.close();
    if let Err(e) = outbound.close().await {
        tracing::debug!(peer = %summary.peer, error = %e, "closing outbound failed");
    }
    tracing::info!(
        peer = %summary.peer,
        reason = ?summary.reason,
        payloads = summary.payloads_sent,
        "connection closed"
    );
    summary
}
