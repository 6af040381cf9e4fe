// MIT License
//
// Copyright (c) 2025 Takatoshi Kondo
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! The client: connection lifecycle, session resume and the public
//! publish/subscribe API.
//!
//! A client moves through four states: Disconnected, Connecting, Connected
//! and Reconnecting (entered from Connected when auto-reconnect handles a
//! comms failure). User operations are accepted in every state; what happens
//! to the packet (enqueue now, or persist for the resume pass to replay)
//! depends on the state at call time.

use crate::mqtt_cl::client_error::ClientError;
use crate::mqtt_cl::client_option::ClientOptions;
use crate::mqtt_cl::message_ids::MessageIdRegistry;
use crate::mqtt_cl::packet::{
    Connack, Connect, ConnectReturnCode, Packet, ProtocolError, ProtocolVersion, Publish, QoS,
    Subscribe, Unsubscribe,
};
use crate::mqtt_cl::pump::{PacketAndToken, PumpHandle};
use crate::mqtt_cl::router::{MessageHandler, Router};
use crate::mqtt_cl::store::{is_key_outbound, persist_outbound, MemoryStore, Store};
use crate::mqtt_cl::token::Token;
use crate::mqtt_cl::transport::connect_helper::{self, BrokerAddress};
use crate::mqtt_cl::transport::{TransportError, TransportOps};
use bytes::{Bytes, BytesMut};
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Value reported by [`AsyncClient::last_connack_code`] when the most recent
/// connection attempt failed at the network layer, before any CONNACK was
/// readable.
pub const NETWORK_ERROR_SENTINEL: u8 = 0xFE;

const TRANSPORT_DISCARD_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Reconnecting = 2,
    Connected = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Reconnecting,
            3 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Publish payload: UTF-8 text, raw bytes, or an already shared buffer.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    Buffer(Bytes),
}

impl Payload {
    pub(crate) fn into_bytes(self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::from(text.into_bytes()),
            Payload::Binary(bytes) => Bytes::from(bytes),
            Payload::Buffer(buffer) => buffer,
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Binary(value.to_vec())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Binary(value)
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Payload::Buffer(value)
    }
}

/// The client surface, factored as a trait so user code and test doubles can
/// share one signature. [`AsyncClient`] is the one concrete implementation.
#[allow(async_fn_in_trait)]
pub trait Client {
    /// Whether the client is connected, or will be brought back automatically
    /// (auto-reconnect after a drop, connect-retry during the initial dial).
    fn is_connected(&self) -> bool;
    /// Whether a connection to the broker is open right now.
    fn is_connection_open(&self) -> bool;
    async fn connect(&self) -> Token;
    async fn disconnect(&self, quiesce: Duration);
    async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Payload) -> Token;
    async fn subscribe(&self, filter: &str, qos: QoS, handler: Option<MessageHandler>) -> Token;
    async fn subscribe_multiple(
        &self,
        filters: &[(&str, QoS)],
        handler: Option<MessageHandler>,
    ) -> Token;
    async fn unsubscribe(&self, filters: &[&str]) -> Token;
    /// Installs a handler for a topic filter without subscribing, e.g. a
    /// narrower handler for part of an existing wildcard subscription.
    fn add_route(&self, filter: &str, handler: MessageHandler);
}

/// MQTT v3.1.1 client over tokio. Cloning is cheap and clones share the same
/// session.
#[derive(Clone)]
pub struct AsyncClient {
    core: Arc<ClientCore>,
}

pub(crate) struct ClientCore {
    pub(crate) options: ClientOptions,
    pub(crate) registry: MessageIdRegistry,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) router: Arc<Router>,

    status: AtomicU8,
    /// Serializes multi-field state transitions; plain reads go through the
    /// atomic alone.
    state_mu: Mutex<()>,

    /// Effective protocol revision; rewritten (and pinned) after the first
    /// accepted CONNACK.
    protocol_version: Mutex<ProtocolVersion>,
    protocol_explicit: AtomicBool,
    /// Return code of the last CONNACK, or [`NETWORK_ERROR_SENTINEL`].
    initial_rc: AtomicU8,

    /// Client-level outbound channels; alive for the client's whole life so
    /// operations can block on them across reconnects.
    pub(crate) obound_tx: mpsc::Sender<PacketAndToken>,
    pub(crate) oboundp_tx: mpsc::Sender<PacketAndToken>,
    /// Parking spots for the channel receivers between connections; the
    /// gateway task borrows them while a pump runs.
    pub(crate) obound_rx_slot: Mutex<Option<mpsc::Receiver<PacketAndToken>>>,
    pub(crate) oboundp_rx_slot: Mutex<Option<mpsc::Receiver<PacketAndToken>>>,

    /// Present iff the comms pump is running. Guarded by an async mutex so
    /// start, stop and the error path serialize.
    pub(crate) pump: tokio::sync::Mutex<Option<PumpHandle>>,

    pub(crate) epoch: Instant,
    pub(crate) last_sent_ms: AtomicU64,
    pub(crate) last_received_ms: AtomicU64,
    pub(crate) ping_sent_ms: AtomicU64,
    pub(crate) ping_outstanding: AtomicBool,
}

pub(crate) struct ConnectOutcome {
    transport: Box<dyn TransportOps + Send>,
    session_present: bool,
}

impl AsyncClient {
    /// Creates a client from `options`. Nothing touches the network until
    /// [`AsyncClient::connect`].
    pub fn new(options: ClientOptions) -> Self {
        let store: Arc<dyn Store> = options
            .store()
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let router = Arc::new(Router::new());
        router.set_default(options.default_publish_handler().clone());

        let (obound_tx, obound_rx) = mpsc::channel(1);
        let (oboundp_tx, oboundp_rx) = mpsc::channel(1);

        let initial_version = options.protocol_version().unwrap_or(ProtocolVersion::V3_1_1);
        let protocol_explicit = options.protocol_version().is_some();

        Self {
            core: Arc::new(ClientCore {
                options,
                registry: MessageIdRegistry::new(),
                store,
                router,
                status: AtomicU8::new(ConnectionState::Disconnected as u8),
                state_mu: Mutex::new(()),
                protocol_version: Mutex::new(initial_version),
                protocol_explicit: AtomicBool::new(protocol_explicit),
                initial_rc: AtomicU8::new(0),
                obound_tx,
                oboundp_tx,
                obound_rx_slot: Mutex::new(Some(obound_rx)),
                oboundp_rx_slot: Mutex::new(Some(oboundp_rx)),
                pump: tokio::sync::Mutex::new(None),
                epoch: Instant::now(),
                last_sent_ms: AtomicU64::new(0),
                last_received_ms: AtomicU64::new(0),
                ping_sent_ms: AtomicU64::new(0),
                ping_outstanding: AtomicBool::new(false),
            }),
        }
    }

    /// The options this client runs with.
    pub fn options(&self) -> &ClientOptions {
        &self.core.options
    }

    /// Return code of the most recent CONNACK, or
    /// [`NETWORK_ERROR_SENTINEL`] when the last attempt failed before one was
    /// readable.
    pub fn last_connack_code(&self) -> u8 {
        self.core.initial_rc.load(Ordering::SeqCst)
    }

    /// Dials the broker list and brings the session up.
    ///
    /// By default the handshake runs MQTT v3.1.1 and falls back once per
    /// broker to v3.1 when the CONNACK rejects the protocol level. With a
    /// non-clean session, stored QoS 1/2 flows are replayed after the
    /// connection is established; queued deliveries may therefore reach
    /// handlers immediately, so install routes (or a default handler) before
    /// connecting.
    pub async fn connect(&self) -> Token {
        let token = Token::new();
        debug!("connect requested");

        if self.core.options.connect_retry()
            && self.core.status() != ConnectionState::Disconnected
        {
            // The retry machinery will bring the connection up on its own.
            warn!("connect called but not disconnected");
            token.set_connack(ConnectReturnCode::Accepted, false);
            token.complete();
            return token;
        }

        self.core.store.open();
        if self.core.options.connect_retry() {
            // Claim ids for stored publishes up front so a publish made while
            // still connecting cannot steal an id that resume will need.
            self.core.reserve_stored_publish_ids();
        }
        self.core.set_status(ConnectionState::Connecting);

        let core = self.core.clone();
        let worker_token = token.clone();
        tokio::spawn(async move { core.run_connect_worker(worker_token).await });
        token
    }

    /// Ends the session, waiting up to `quiesce` for the DISCONNECT packet to
    /// reach the wire before tearing down. The enqueue itself is bounded by
    /// the write timeout, like every other outbound packet.
    pub async fn disconnect(&self, quiesce: Duration) {
        if self.core.status() == ConnectionState::Connected {
            debug!("disconnecting");
            self.core.set_status(ConnectionState::Disconnected);

            let token = Token::new();
            self.core
                .enqueue(&self.core.oboundp_tx, Packet::Disconnect, &token)
                .await;
            token.wait_timeout(quiesce).await;
        } else {
            warn!("disconnect called but not connected");
            self.core.set_status(ConnectionState::Disconnected);
        }

        self.core.teardown().await;
    }

    /// Ends the session immediately, skipping the quiesce wait.
    pub async fn force_disconnect(&self) {
        if !self.is_connected() {
            warn!("force disconnect called but already disconnected");
            return;
        }
        debug!("forcefully disconnecting");
        self.core.set_status(ConnectionState::Disconnected);
        self.core.teardown().await;
    }

    /// Publishes `payload` to `topic` at `qos`.
    ///
    /// The returned token completes when the delivery guarantee for `qos` is
    /// met: on write for QoS 0, on PUBACK for QoS 1, on PUBCOMP for QoS 2.
    /// While the client is connecting or reconnecting, QoS 1/2 publishes are
    /// persisted and left for resume instead of being enqueued.
    pub async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retained: bool,
        payload: impl Into<Payload>,
    ) -> Token {
        let token = Token::new();
        if !self.is_connected() {
            token.fail(ClientError::NotConnected);
            return token;
        }
        if self.core.status() == ConnectionState::Reconnecting && qos == QoS::AtMostOnce {
            // Best-effort traffic is not worth queueing behind a reconnect.
            token.complete();
            return token;
        }

        let mut publish = Publish {
            dup: false,
            qos,
            retain: retained,
            topic: topic.to_string(),
            packet_id: 0,
            payload: payload.into().into_bytes(),
        };

        if qos != QoS::AtMostOnce {
            let id = self.core.registry.claim(&token);
            if id == 0 {
                token.fail(ClientError::NoMessageIdsAvailable);
                return token;
            }
            publish.packet_id = id;
            token.set_message_id(id);
        }

        let packet = Packet::Publish(publish);
        persist_outbound(&*self.core.store, &packet);

        match self.core.status() {
            ConnectionState::Connecting => {
                debug!(topic, "storing publish message (connecting)");
            }
            ConnectionState::Reconnecting => {
                debug!(topic, "storing publish message (reconnecting)");
            }
            _ => {
                debug!(topic, "sending publish message");
                self.core
                    .enqueue(&self.core.obound_tx, packet, &token)
                    .await;
            }
        }
        token
    }

    /// Subscribes to `filter` at `qos`, routing matching messages to
    /// `handler` (or the default handler when `None`).
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: Option<MessageHandler>,
    ) -> Token {
        self.subscribe_multiple(&[(filter, qos)], handler).await
    }

    /// Subscribes to several filters in one SUBSCRIBE packet. The SUBACK
    /// grants one QoS code per filter, readable from the token.
    pub async fn subscribe_multiple(
        &self,
        filters: &[(&str, QoS)],
        handler: Option<MessageHandler>,
    ) -> Token {
        let token = Token::new();
        debug!(?filters, "subscribe requested");
        if let Some(error) = self.subscription_precondition() {
            token.fail(error);
            return token;
        }
        for (filter, _) in filters {
            if let Err(error) = validate_topic_filter(filter) {
                token.fail(error);
                return token;
            }
        }

        let subscribe = Subscribe {
            packet_id: 0,
            topics: filters
                .iter()
                .map(|(filter, qos)| (filter.to_string(), *qos))
                .collect(),
        };

        if let Some(handler) = handler {
            for (filter, _) in filters {
                // Shared-subscription prefixes are stripped by the router so
                // inbound topics match directly.
                self.core.router.add_route(filter, handler.clone());
            }
        }

        self.core
            .finish_control_flow(Packet::Subscribe(subscribe), token)
            .await
    }

    /// Ends the subscription to each filter in `filters`. Local routes are
    /// removed only after the UNSUBSCRIBE is enqueued, so in-flight
    /// deliveries still find their handler.
    pub async fn unsubscribe(&self, filters: &[&str]) -> Token {
        let token = Token::new();
        debug!(?filters, "unsubscribe requested");
        if let Some(error) = self.subscription_precondition() {
            token.fail(error);
            return token;
        }

        let unsubscribe = Unsubscribe {
            packet_id: 0,
            topics: filters.iter().map(|f| f.to_string()).collect(),
        };

        let token = self
            .core
            .finish_control_flow(Packet::Unsubscribe(unsubscribe), token)
            .await;
        if token.error().is_none() && self.is_connection_open() {
            for filter in filters {
                self.core.router.delete_route(filter);
            }
        }
        token
    }

    /// Installs `handler` for `filter` without subscribing.
    pub fn add_route(&self, filter: &str, handler: MessageHandler) {
        self.core.router.add_route(filter, handler);
    }

    /// True while connected, and also while the client will bring the
    /// connection up or back by itself (connect-retry during Connecting,
    /// auto-reconnect during Reconnecting).
    pub fn is_connected(&self) -> bool {
        let status = self.core.status();
        match status {
            ConnectionState::Connected => true,
            ConnectionState::Reconnecting => self.core.options.auto_reconnect(),
            ConnectionState::Connecting => self.core.options.connect_retry(),
            ConnectionState::Disconnected => false,
        }
    }

    /// True iff a connection to the broker is open right now.
    pub fn is_connection_open(&self) -> bool {
        self.core.status() == ConnectionState::Connected
    }

    /// Common preconditions for subscribe/unsubscribe: the link must be open,
    /// unless resume-subscriptions will replay the packet later (and the
    /// session is not clean while reconnecting, which would discard it).
    fn subscription_precondition(&self) -> Option<ClientError> {
        if !self.is_connected() {
            return Some(ClientError::NotConnected);
        }
        if !self.is_connection_open() {
            if !self.core.options.resume_subs() {
                return Some(ClientError::NotConnected);
            }
            if self.core.options.clean_session()
                && self.core.status() == ConnectionState::Reconnecting
            {
                return Some(ClientError::NotConnected);
            }
        }
        None
    }
}

impl Client for AsyncClient {
    fn is_connected(&self) -> bool {
        AsyncClient::is_connected(self)
    }

    fn is_connection_open(&self) -> bool {
        AsyncClient::is_connection_open(self)
    }

    async fn connect(&self) -> Token {
        AsyncClient::connect(self).await
    }

    async fn disconnect(&self, quiesce: Duration) {
        AsyncClient::disconnect(self, quiesce).await
    }

    async fn publish(&self, topic: &str, qos: QoS, retained: bool, payload: Payload) -> Token {
        AsyncClient::publish(self, topic, qos, retained, payload).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS, handler: Option<MessageHandler>) -> Token {
        AsyncClient::subscribe(self, filter, qos, handler).await
    }

    async fn subscribe_multiple(
        &self,
        filters: &[(&str, QoS)],
        handler: Option<MessageHandler>,
    ) -> Token {
        AsyncClient::subscribe_multiple(self, filters, handler).await
    }

    async fn unsubscribe(&self, filters: &[&str]) -> Token {
        AsyncClient::unsubscribe(self, filters).await
    }

    fn add_route(&self, filter: &str, handler: MessageHandler) {
        AsyncClient::add_route(self, filter, handler)
    }
}

impl ClientCore {
    pub(crate) fn status(&self) -> ConnectionState {
        ConnectionState::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn set_status(&self, state: ConnectionState) {
        let _guard = self.state_mu.lock().expect("state mutex poisoned");
        self.status.store(state as u8, Ordering::SeqCst);
    }

    fn effective_protocol_version(&self) -> ProtocolVersion {
        *self
            .protocol_version
            .lock()
            .expect("protocol version mutex poisoned")
    }

    /// Claims an id and completes a shared control flow (subscribe or
    /// unsubscribe): persist, then enqueue on the priority channel or leave
    /// in the store for resume depending on the connection state.
    async fn finish_control_flow(&self, packet: Packet, token: Token) -> Token {
        let id = self.registry.claim(&token);
        if id == 0 {
            token.fail(ClientError::NoMessageIdsAvailable);
            return token;
        }
        token.set_message_id(id);
        let packet = match packet {
            Packet::Subscribe(mut s) => {
                s.packet_id = id;
                Packet::Subscribe(s)
            }
            Packet::Unsubscribe(mut u) => {
                u.packet_id = id;
                Packet::Unsubscribe(u)
            }
            other => other,
        };
        persist_outbound(&*self.store, &packet);

        match self.status() {
            ConnectionState::Connecting => {
                debug!("storing control packet (connecting)");
            }
            ConnectionState::Reconnecting => {
                debug!("storing control packet (reconnecting)");
            }
            _ => {
                self.enqueue(&self.oboundp_tx, packet, &token).await;
            }
        }
        token
    }

    /// Enqueues onto a client-level channel, bounded by the write timeout. On
    /// timeout the token fails but the persisted packet stays in the store
    /// for eventual resume.
    async fn enqueue(&self, tx: &mpsc::Sender<PacketAndToken>, packet: Packet, token: &Token) {
        let send = tx.send(PacketAndToken {
            packet,
            token: Some(token.clone()),
        });
        match tokio::time::timeout(self.options.effective_write_timeout(), send).await {
            Ok(Ok(())) => {}
            Ok(Err(_closed)) => token.fail(ClientError::NotConnected),
            Err(_elapsed) => token.fail(ClientError::BrokenByTimeout),
        }
    }

    async fn run_connect_worker(self: Arc<Self>, token: Token) {
        if self.options.servers().is_empty() && self.options.custom_dialer().is_none() {
            self.set_status(ConnectionState::Disconnected);
            self.store.close();
            token.fail(ClientError::NoBrokers);
            return;
        }

        loop {
            match self.attempt_connection().await {
                Ok(outcome) => {
                    token.set_connack(ConnectReturnCode::Accepted, outcome.session_present);
                    let (ibound_tx, ibound_rx) = mpsc::channel(8);
                    if self
                        .clone()
                        .start_comms_workers(outcome.transport, ibound_rx)
                        .await
                    {
                        if self.options.clean_session() {
                            self.store.reset();
                        } else {
                            self.resume(self.options.resume_subs(), ibound_tx).await;
                        }
                    } else {
                        warn!("connection established by another task");
                    }
                    token.complete();
                    return;
                }
                Err(err) => {
                    if self.options.connect_retry() {
                        debug!(
                            interval = ?self.options.connect_retry_interval(),
                            "connect failed, sleeping before retry"
                        );
                        tokio::time::sleep(self.options.connect_retry_interval()).await;
                        if self.status() == ConnectionState::Connecting {
                            continue;
                        }
                    }
                    error!("failed to connect to any broker");
                    self.set_status(ConnectionState::Disconnected);
                    self.store.close();
                    if let ClientError::Rejected(code) = &*err {
                        token.set_connack(*code, false);
                    }
                    token.fail_shared(err);
                    return;
                }
            }
        }
    }

    /// Reconnect worker: doubling backoff from one second up to the
    /// configured maximum, abandoned as soon as a user disconnect moves the
    /// state to Disconnected.
    pub(crate) async fn run_reconnect(self: Arc<Self>) {
        debug!("enter reconnect");
        let mut backoff = Duration::from_secs(1);
        let outcome = loop {
            if let Some(on_reconnecting) = self.options.on_reconnecting() {
                on_reconnecting(backoff);
            }
            match self.attempt_connection().await {
                Ok(outcome) => break Some(outcome),
                Err(err) => {
                    debug!(error = %err, backoff = ?backoff, "reconnect attempt failed")
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.options.max_reconnect_interval());
            if self.status() == ConnectionState::Disconnected {
                break None;
            }
        };

        let Some(outcome) = outcome else {
            debug!("client moved to disconnected state while reconnecting, abandoning");
            return;
        };
        if self.status() == ConnectionState::Disconnected {
            // Disconnect raced our success; close the fresh connection.
            debug!("client moved to disconnected state while reconnecting, abandoning");
            let mut transport = outcome.transport;
            transport.shutdown(TRANSPORT_DISCARD_TIMEOUT).await;
            return;
        }

        let (ibound_tx, ibound_rx) = mpsc::channel(8);
        if self
            .clone()
            .start_comms_workers(outcome.transport, ibound_rx)
            .await
        {
            self.resume(self.options.resume_subs(), ibound_tx).await;
        }
    }

    /// One sweep over the broker list (or the custom dialer). Each broker
    /// gets a dial, a CONNECT/CONNACK exchange under the write deadline, and
    /// possibly one v3.1 retry.
    async fn attempt_connection(&self) -> Result<ConnectOutcome, Arc<ClientError>> {
        let mut last_err: Option<Arc<ClientError>> = None;

        let targets: Vec<Option<BrokerAddress>> = if self.options.custom_dialer().is_some() {
            vec![None]
        } else {
            self.options
                .servers()
                .iter()
                .filter_map(|url| match BrokerAddress::parse(url) {
                    Ok(broker) => Some(Some(broker)),
                    Err(e) => {
                        warn!(url = %url, error = %e, "skipping unusable broker url");
                        last_err = Some(Arc::new(ClientError::Network(e)));
                        None
                    }
                })
                .collect()
        };

        for target in &targets {
            let mut version = self.effective_protocol_version();
            loop {
                debug!("about to write new connect msg");
                let transport = match self.dial_target(target.as_ref()).await {
                    Ok(transport) => transport,
                    Err(e) => {
                        warn!(error = %e, "failed to connect to broker, trying next");
                        self.initial_rc
                            .store(NETWORK_ERROR_SENTINEL, Ordering::SeqCst);
                        last_err = Some(Arc::new(ClientError::Network(e)));
                        break;
                    }
                };
                debug!("socket connected to broker");

                match self.connect_handshake(transport, version).await {
                    Ok((transport, connack)) => {
                        self.initial_rc
                            .store(connack.return_code.as_u8(), Ordering::SeqCst);
                        if connack.return_code == ConnectReturnCode::Accepted {
                            // Lock the revision in for future attempts.
                            *self
                                .protocol_version
                                .lock()
                                .expect("protocol version mutex poisoned") = version;
                            self.protocol_explicit.store(true, Ordering::SeqCst);
                            return Ok(ConnectOutcome {
                                transport,
                                session_present: connack.session_present,
                            });
                        }
                        let mut transport = transport;
                        transport.shutdown(TRANSPORT_DISCARD_TIMEOUT).await;
                        if !self.protocol_explicit.load(Ordering::SeqCst)
                            && version == ProtocolVersion::V3_1_1
                        {
                            debug!("trying connect using mqtt v3.1 protocol");
                            version = ProtocolVersion::V3_1;
                            continue;
                        }
                        error!(code = %connack.return_code, "CONNACK was not accepted");
                        last_err = Some(Arc::new(ClientError::Rejected(connack.return_code)));
                        break;
                    }
                    Err(e) => {
                        self.initial_rc
                            .store(NETWORK_ERROR_SENTINEL, Ordering::SeqCst);
                        warn!(error = %e, "connect handshake failed, trying next broker");
                        last_err = Some(Arc::new(e));
                        break;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Arc::new(ClientError::NoBrokers)))
    }

    async fn dial_target(
        &self,
        target: Option<&BrokerAddress>,
    ) -> Result<Box<dyn TransportOps + Send>, TransportError> {
        if let Some(dialer) = self.options.custom_dialer() {
            return dialer().await;
        }
        let Some(broker) = target else {
            return Err(TransportError::Connect("no broker address".to_string()));
        };
        let timeout = Some(self.options.connect_timeout());
        #[cfg(feature = "tls")]
        let transport = connect_helper::dial(
            broker,
            self.options.tls_config().clone(),
            self.options.http_headers(),
            timeout,
        )
        .await?;
        #[cfg(not(feature = "tls"))]
        let transport =
            connect_helper::dial(broker, self.options.http_headers(), timeout).await?;
        Ok(transport)
    }

    /// Writes CONNECT and reads the CONNACK, all under the write deadline.
    async fn connect_handshake(
        &self,
        mut transport: Box<dyn TransportOps + Send>,
        version: ProtocolVersion,
    ) -> Result<(Box<dyn TransportOps + Send>, Connack), ClientError> {
        let connect = Connect {
            protocol: version,
            client_id: self.options.client_id().clone(),
            keep_alive: self.options.keep_alive().as_secs().min(u64::from(u16::MAX)) as u16,
            clean_session: self.options.clean_session(),
            username: self.options.username().clone(),
            password: self.options.password().clone(),
            will: self.options.will().clone(),
        };
        let bytes = Packet::Connect(connect).to_bytes()?;

        let handshake_timeout = self.options.effective_write_timeout();
        match tokio::time::timeout(handshake_timeout, transport.send(&[IoSlice::new(&bytes)]))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ClientError::Network(e)),
            Err(_elapsed) => return Err(ClientError::Network(TransportError::Timeout)),
        }

        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 1024];
        let deadline = Instant::now() + handshake_timeout;
        loop {
            if let Some(packet) = Packet::decode(&mut buf)? {
                return match packet {
                    Packet::Connack(connack) => Ok((transport, connack)),
                    _ => Err(ClientError::Protocol(ProtocolError::UnexpectedPacket)),
                };
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(ClientError::Network(TransportError::Timeout));
            };
            match tokio::time::timeout(remaining, transport.recv(&mut chunk)).await {
                Ok(Ok(0)) => {
                    return Err(ClientError::Network(TransportError::Io(
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed during connect handshake",
                        ),
                    )))
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(ClientError::Network(e)),
                Err(_elapsed) => return Err(ClientError::Network(TransportError::Timeout)),
            }
        }
    }

    /// Final cleanup shared by disconnect paths: stop the pump, abandon
    /// outstanding tokens, close the store.
    async fn teardown(&self) {
        self.stop_comms_workers().await;
        self.registry.cleanup();
        debug!("disconnected");
        self.store.close();
    }

    /// Comms failure entry point; idempotent across the writer, reader,
    /// keepalive and a racing user disconnect.
    pub(crate) async fn on_comms_error(self: Arc<Self>, err: Arc<ClientError>) {
        debug!(error = %err, "comms error");
        let status = self.status();
        if status != ConnectionState::Disconnected && self.stop_comms_workers().await {
            if self.options.clean_session() && !self.options.auto_reconnect() {
                self.registry.cleanup();
            }
            if self.options.auto_reconnect() {
                self.set_status(ConnectionState::Reconnecting);
                let core = self.clone();
                tokio::spawn(async move { core.run_reconnect().await });
            } else {
                self.set_status(ConnectionState::Disconnected);
            }
            if let Some(on_connection_lost) = self.options.on_connection_lost() {
                let on_connection_lost = on_connection_lost.clone();
                let err = err.clone();
                tokio::spawn(async move { on_connection_lost(err) });
            } else {
                debug!(error = %err, "connection lost");
            }
        }
    }

    /// Claims the identifiers of stored outbound publishes before the
    /// connection comes up, so user publishes in the connecting window draw
    /// from the remaining id space.
    fn reserve_stored_publish_ids(&self) {
        if self.options.clean_session() {
            return;
        }
        for key in self.store.all() {
            if !is_key_outbound(&key) {
                continue;
            }
            if let Some(Packet::Publish(publish)) = self.store.get(&key) {
                let placeholder = Token::new();
                placeholder.set_message_id(publish.packet_id);
                if !self.registry.claim_specific(&placeholder, publish.packet_id) {
                    debug!(id = publish.packet_id, "stored publish id already live");
                }
            }
        }
    }

    /// Replays stored traffic onto the fresh session: outbound publishes and
    /// (optionally) subscription packets re-enter the outbound channels with
    /// fresh tokens; outbound PUBRELs go out with no waiter; inbound PUBRELs
    /// feed the reader so the exactly-once exchange completes. Unrecognized
    /// entries are discarded.
    pub(crate) async fn resume(&self, resume_subs: bool, ibound_tx: mpsc::Sender<Packet>) {
        for key in self.store.all() {
            let Some(packet) = self.store.get(&key) else {
                continue;
            };
            if is_key_outbound(&key) {
                match packet {
                    Packet::Subscribe(subscribe) => {
                        if resume_subs {
                            debug!(id = subscribe.packet_id, "loaded pending subscribe");
                            let token = Token::new();
                            token.set_message_id(subscribe.packet_id);
                            self.reclaim_id(&token, subscribe.packet_id);
                            if self
                                .oboundp_tx
                                .send(PacketAndToken {
                                    packet: Packet::Subscribe(subscribe),
                                    token: Some(token),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Packet::Unsubscribe(unsubscribe) => {
                        if resume_subs {
                            debug!(id = unsubscribe.packet_id, "loaded pending unsubscribe");
                            let token = Token::new();
                            token.set_message_id(unsubscribe.packet_id);
                            self.reclaim_id(&token, unsubscribe.packet_id);
                            if self
                                .oboundp_tx
                                .send(PacketAndToken {
                                    packet: Packet::Unsubscribe(unsubscribe),
                                    token: Some(token),
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                    Packet::Pubrel { packet_id } => {
                        debug!(id = packet_id, "loaded pending pubrel");
                        if self
                            .oboundp_tx
                            .send(PacketAndToken {
                                packet: Packet::Pubrel { packet_id },
                                token: None,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Packet::Publish(publish) => {
                        debug!(id = publish.packet_id, "loaded pending publish");
                        let token = Token::new();
                        token.set_message_id(publish.packet_id);
                        self.reclaim_id(&token, publish.packet_id);
                        let mut republish = publish;
                        republish.dup = true;
                        if self
                            .obound_tx
                            .send(PacketAndToken {
                                packet: Packet::Publish(republish),
                                token: Some(token),
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => {
                        error!(key = %key, "invalid message type in store (discarded)");
                        self.store.del(&key);
                    }
                }
            } else {
                match packet {
                    Packet::Pubrel { packet_id } => {
                        debug!(id = packet_id, "loaded pending incoming pubrel");
                        if ibound_tx
                            .send(Packet::Pubrel { packet_id })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => {
                        error!(key = %key, "invalid message type in store (discarded)");
                        self.store.del(&key);
                    }
                }
            }
        }
    }

    /// Re-registers a persisted identifier for a resumed flow. A collision
    /// means the id is held by the pre-connect reservation (or by the
    /// original token of a publish made in the connecting window); the fresh
    /// resume token supersedes it, and the displaced token is completed.
    fn reclaim_id(&self, token: &Token, id: u16) {
        if !self.registry.claim_specific(token, id) {
            if let Some(displaced) = self.registry.get_and_release(id) {
                displaced.complete();
            }
            if !self.registry.claim_specific(token, id) {
                warn!(id, "packet id contended during resume, skipping reclaim");
            }
        }
    }
}

/// Validates a subscription filter against the MQTT wildcard grammar: `#`
/// only as the final level, `+` and `#` only as whole levels.
fn validate_topic_filter(filter: &str) -> Result<(), ClientError> {
    if filter.is_empty() {
        return Err(ClientError::InvalidTopic(filter.to_string()));
    }
    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        match *level {
            "#" => {
                if i != levels.len() - 1 {
                    return Err(ClientError::InvalidTopic(filter.to_string()));
                }
            }
            "+" => {}
            other => {
                if other.contains('#') || other.contains('+') {
                    return Err(ClientError::InvalidTopic(filter.to_string()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_grammar() {
        assert!(validate_topic_filter("a/b/c").is_ok());
        assert!(validate_topic_filter("a/+/c").is_ok());
        assert!(validate_topic_filter("a/#").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("$share/g/a/+").is_ok());

        assert!(validate_topic_filter("").is_err());
        assert!(validate_topic_filter("a/#/c").is_err());
        assert!(validate_topic_filter("a/b#").is_err());
        assert!(validate_topic_filter("a/b+/c").is_err());
    }

    #[test]
    fn payload_variants_convert() {
        assert_eq!(Payload::from("hi").into_bytes(), Bytes::from_static(b"hi"));
        assert_eq!(
            Payload::from(vec![1u8, 2]).into_bytes(),
            Bytes::from_static(&[1, 2])
        );
        assert_eq!(
            Payload::from(Bytes::from_static(b"buf")).into_bytes(),
            Bytes::from_static(b"buf")
        );
    }
}
