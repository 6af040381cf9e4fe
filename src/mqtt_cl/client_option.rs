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

use crate::mqtt_cl::client_error::ClientError;
use crate::mqtt_cl::packet::{LastWill, ProtocolVersion};
use crate::mqtt_cl::router::MessageHandler;
use crate::mqtt_cl::store::Store;
use crate::mqtt_cl::transport::{TransportError, TransportOps};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Invoked after every successful CONNACK, including reconnects.
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked (asynchronously to the comms pump) when an established connection
/// is lost.
pub type ConnectionLostHandler = Arc<dyn Fn(Arc<ClientError>) + Send + Sync>;

/// Invoked before each reconnect attempt with the backoff delay that will
/// follow a failure of that attempt.
pub type ReconnectHandler = Arc<dyn Fn(Duration) + Send + Sync>;

/// Future returned by a custom dialer.
pub type DialFuture =
    Pin<Box<dyn Future<Output = Result<Box<dyn TransportOps + Send>, TransportError>> + Send>>;

/// Replacement for the built-in URL dialing: returns an opened transport.
/// Useful for out-of-band connection paths such as scanning frameworks or
/// pre-established tunnels.
pub type CustomDialer = Arc<dyn Fn() -> DialFuture + Send + Sync>;

/// MQTT Client Options - Configuration for the client's connection behavior
///
/// This struct contains every knob the client recognizes: broker addresses
/// and identity, session and protocol selection, the timeout family, the
/// retry/reconnect machinery, delivery ordering, transport security, and the
/// user callbacks. Options are effectively read-only once `connect` is
/// called.
///
/// # Usage
///
/// ```ignore
/// use mqtt_client_tokio::mqtt_cl::ClientOptions;
/// use std::time::Duration;
///
/// let options = ClientOptions::builder()
///     .servers(vec!["tcp://broker.local:1883".to_string()])
///     .client_id("sensor-7")
///     .clean_session(false)
///     .keep_alive(Duration::from_secs(30))
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Builder, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
pub struct ClientOptions {
    /// Broker addresses tried in order on every connection attempt
    ///
    /// Each entry is a URL-like string `scheme://host:port[/path]` where the
    /// scheme selects the transport: `tcp`, `ssl` (TLS), `ws` (WebSocket) or
    /// `wss` (WebSocket over TLS). A sweep dials each broker in turn until
    /// one accepts the CONNECT.
    ///
    /// # Default
    /// Empty list
    #[builder(default)]
    #[getset(get = "pub")]
    servers: Vec<String>,

    /// Client identifier sent in CONNECT
    ///
    /// Identifies this session to the broker. Reconnecting with the same
    /// identifier and a non-clean session resumes outstanding QoS 1/2 flows.
    ///
    /// # Default
    /// Empty string
    #[builder(default)]
    #[getset(get = "pub")]
    client_id: String,

    /// Discard session state on connect
    ///
    /// When true, both sides drop prior session state at connect time and
    /// the persistence store is reset. When false, reconnecting with the
    /// same client identifier resumes outstanding QoS 1/2 flows from the
    /// store.
    ///
    /// # Default
    /// true
    #[builder(default = "true")]
    #[getset(get_copy = "pub")]
    clean_session: bool,

    /// Pinned MQTT protocol revision
    ///
    /// When set, the handshake uses exactly this revision. Leaving it unset
    /// selects v3.1.1 with a one-shot per-broker fallback to v3.1 when the
    /// CONNACK rejects the protocol level.
    ///
    /// # Default
    /// None (v3.1.1 with v3.1 fallback)
    #[builder(default, setter(strip_option))]
    #[getset(get_copy = "pub")]
    protocol_version: Option<ProtocolVersion>,

    /// Keepalive interval
    ///
    /// Maximum interval without traffic before a PINGREQ is required. A
    /// PINGREQ left unanswered for another interval counts as a lost
    /// connection. A value of zero disables keepalive and pinging entirely.
    ///
    /// # Default
    /// 30 seconds
    #[builder(default = "Duration::from_secs(30)")]
    #[getset(get_copy = "pub")]
    keep_alive: Duration,

    /// Broker dialing timeout
    ///
    /// Bounds the establishment of a single broker connection, covering the
    /// TCP connect plus any TLS and WebSocket handshakes.
    ///
    /// # Default
    /// 30 seconds
    #[builder(default = "Duration::from_secs(30)")]
    #[getset(get_copy = "pub")]
    connect_timeout: Duration,

    /// Write timeout
    ///
    /// Bounds blocking enqueues from user calls onto the outbound channels,
    /// single transport writes, and the CONNECT/CONNACK exchange. A zero
    /// value falls back to the 30 second default.
    ///
    /// # Default
    /// 30 seconds
    #[builder(default = "Duration::from_secs(30)")]
    #[getset(get_copy = "pub")]
    write_timeout: Duration,

    /// Keep retrying the initial connect
    ///
    /// When enabled, a sweep that exhausts every broker sleeps for the retry
    /// interval and starts over instead of failing the connect token.
    /// Publishes made while still connecting are persisted and replayed by
    /// resume.
    ///
    /// # Default
    /// false
    #[builder(default = "false")]
    #[getset(get_copy = "pub")]
    connect_retry: bool,

    /// Pause between initial-connect retry sweeps
    ///
    /// Only meaningful with `connect_retry` enabled.
    ///
    /// # Default
    /// 30 seconds
    #[builder(default = "Duration::from_secs(30)")]
    #[getset(get_copy = "pub")]
    connect_retry_interval: Duration,

    /// Reconnect automatically after a comms failure
    ///
    /// When enabled, a lost connection moves the client to the reconnecting
    /// state and a background worker re-dials with backoff; `is_connected`
    /// keeps reporting true throughout. When disabled, a comms failure moves
    /// the client straight to disconnected.
    ///
    /// # Default
    /// true
    #[builder(default = "true")]
    #[getset(get_copy = "pub")]
    auto_reconnect: bool,

    /// Cap for the reconnect backoff
    ///
    /// The reconnect worker starts at one second and doubles the pause after
    /// each failed attempt, never exceeding this cap.
    ///
    /// # Default
    /// 600 seconds (10 minutes)
    #[builder(default = "Duration::from_secs(600)")]
    #[getset(get_copy = "pub")]
    max_reconnect_interval: Duration,

    /// Replay stored subscription packets on resume
    ///
    /// When enabled, stored SUBSCRIBE/UNSUBSCRIBE packets are re-sent after
    /// a reconnect, and subscribe/unsubscribe calls are accepted while the
    /// link is down (persisted for the next resume).
    ///
    /// # Default
    /// false
    #[builder(default = "false")]
    #[getset(get_copy = "pub")]
    resume_subs: bool,

    /// Deliver inbound messages in wire order
    ///
    /// When enabled, handlers run serialized on the dispatch task, so a slow
    /// handler delays subsequent deliveries. When disabled, each delivery
    /// gets a fresh task and deliveries may interleave.
    ///
    /// # Default
    /// true
    #[builder(default = "true")]
    #[getset(get_copy = "pub")]
    ordered: bool,

    /// TLS configuration for `ssl://` and `wss://` brokers
    ///
    /// Allows pinning certificates or supplying client authentication. When
    /// unset, the platform's native root certificates are trusted.
    ///
    /// # Default
    /// None (platform roots)
    #[cfg(feature = "tls")]
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    tls_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,

    /// Additional HTTP headers for the WebSocket handshake
    ///
    /// Sent alongside the standard upgrade headers when dialing `ws://` and
    /// `wss://` brokers; ignored by the other schemes.
    ///
    /// # Default
    /// Empty map
    #[builder(default)]
    #[getset(get = "pub")]
    http_headers: HashMap<String, String>,

    /// CONNECT username
    ///
    /// # Default
    /// None
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    username: Option<String>,

    /// CONNECT password
    ///
    /// # Default
    /// None
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    password: Option<Vec<u8>>,

    /// Will message registered with the broker at connect time
    ///
    /// Published by the broker on this client's behalf when the connection
    /// drops without a DISCONNECT.
    ///
    /// # Default
    /// None
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    will: Option<LastWill>,

    /// Handler for inbound messages matching no route
    ///
    /// Invoked when a PUBLISH arrives whose topic matches none of the
    /// installed filters.
    ///
    /// # Default
    /// None (unrouted messages are dropped with a log line)
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    default_publish_handler: Option<MessageHandler>,

    /// Connection-established callback
    ///
    /// Called asynchronously after every successful CONNACK, including
    /// reconnects. A common place to (re)subscribe when not using
    /// `resume_subs`.
    ///
    /// # Default
    /// None
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    on_connect: Option<ConnectHandler>,

    /// Connection-lost callback
    ///
    /// Called asynchronously with the failure when an established connection
    /// drops. Reconnect backoff itself never surfaces here.
    ///
    /// # Default
    /// None (the loss reason is logged at debug level)
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    on_connection_lost: Option<ConnectionLostHandler>,

    /// Reconnect-attempt callback
    ///
    /// Called before each reconnect attempt with the backoff delay that will
    /// follow if that attempt fails. The only way backoff progress is
    /// observable.
    ///
    /// # Default
    /// None
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    on_reconnecting: Option<ReconnectHandler>,

    /// Session persistence backend
    ///
    /// Holds in-flight QoS 1/2 packets so delivery guarantees survive
    /// reconnects, and process restarts when the implementation is durable.
    ///
    /// # Default
    /// None (an in-memory store is created)
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    store: Option<Arc<dyn Store>>,

    /// Custom connection establishment
    ///
    /// Replaces URL dialing entirely: the callback is invoked once per
    /// connection attempt and returns an opened transport. The broker list
    /// is ignored while this is set.
    ///
    /// # Default
    /// None (brokers are dialed by URL scheme)
    #[builder(default, setter(strip_option))]
    #[getset(get = "pub")]
    custom_dialer: Option<CustomDialer>,
}

impl ClientOptions {
    /// Creates a builder preloaded with the defaults documented per field.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let options = ClientOptions::builder()
    ///     .servers(vec!["tcp://127.0.0.1:1883".to_string()])
    ///     .client_id("my-client")
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn builder() -> ClientOptionsBuilder {
        ClientOptionsBuilder::default()
    }

    /// The effective enqueue/write bound: the configured write timeout, with
    /// zero mapped to the 30 second default.
    pub(crate) fn effective_write_timeout(&self) -> Duration {
        if self.write_timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            self.write_timeout
        }
    }
}

/// Default implementation for ClientOptions
///
/// Provides the per-field defaults documented above.
impl Default for ClientOptions {
    fn default() -> Self {
        Self::builder()
            .build()
            .expect("Default ClientOptions should be valid")
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("servers", &self.servers)
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("protocol_version", &self.protocol_version)
            .field("keep_alive", &self.keep_alive)
            .field("connect_retry", &self.connect_retry)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("resume_subs", &self.resume_subs)
            .field("ordered", &self.ordered)
            .finish_non_exhaustive()
    }
}
