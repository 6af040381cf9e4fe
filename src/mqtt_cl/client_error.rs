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

use crate::mqtt_cl::packet::{ConnectReturnCode, ProtocolError};
use crate::mqtt_cl::transport::TransportError;

/// Unified error type surfaced through operation tokens.
///
/// Failures split into connection-state errors (`NotConnected`,
/// `Disconnecting`), resource errors (`NoMessageIdsAvailable`,
/// `BrokenByTimeout`), transport failures (`Network`), protocol failures
/// (`Protocol`, `Rejected`, `PingTimeout`) and input validation
/// (`InvalidTopic`). `Rejected` is the only variant produced by a broker that
/// accepted the TCP-level connection but refused the MQTT session; `Network`
/// is the sentinel for everything that failed before a CONNACK was readable.
#[derive(Debug)]
pub enum ClientError {
    /// The client state does not allow the attempted operation.
    NotConnected,
    /// All 65535 packet identifiers are tied up in unacknowledged flows.
    NoMessageIdsAvailable,
    /// Enqueueing the packet blocked for longer than the write timeout. The
    /// persisted copy stays in the store for a later resume.
    BrokenByTimeout,
    /// Dial, read, write or unexpected EOF at the transport layer.
    Network(TransportError),
    /// A malformed control packet was sent by the peer.
    Protocol(ProtocolError),
    /// The broker answered CONNECT with a non-accepted return code.
    Rejected(ConnectReturnCode),
    /// No PINGRESP arrived within one keepalive interval of the PINGREQ.
    PingTimeout,
    /// The subscription filter fails the MQTT topic grammar.
    InvalidTopic(String),
    /// The client is shutting down; outstanding tokens are abandoned.
    Disconnecting,
    /// Connect was called with an empty broker list and no custom dialer.
    NoBrokers,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "not connected"),
            ClientError::NoMessageIdsAvailable => write!(f, "no message IDs available"),
            ClientError::BrokenByTimeout => write!(f, "operation was broken by timeout"),
            ClientError::Network(e) => write!(f, "network error: {e}"),
            ClientError::Protocol(e) => write!(f, "protocol error: {e}"),
            ClientError::Rejected(code) => write!(f, "{code}"),
            ClientError::PingTimeout => write!(f, "ping response not received, disconnecting"),
            ClientError::InvalidTopic(topic) => write!(f, "invalid topic filter '{topic}'"),
            ClientError::Disconnecting => write!(f, "client disconnecting"),
            ClientError::NoBrokers => write!(f, "no servers defined to connect to"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Network(e) => Some(e),
            ClientError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        ClientError::Network(e)
    }
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}
