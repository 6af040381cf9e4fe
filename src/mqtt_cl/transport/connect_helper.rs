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

//! Helpers for establishing connections with the built-in transports.
//!
//! Broker addresses are URL-like strings of the form `scheme://host:port[/path]`
//! where `scheme` selects the transport: `tcp` (plain TCP), `ssl`/`tls`
//! (TLS), `ws` (WebSocket), `wss` (WebSocket over TLS). [`dial`] parses the
//! address and performs the complete multi-step handshake for the selected
//! transport, returning a boxed [`TransportOps`] ready for the MQTT connect
//! handshake.

use super::{TcpTransport, TransportError, TransportOps};
use std::collections::HashMap;
use tokio::net::TcpStream;
use tokio::time::Duration;

#[cfg(feature = "tls")]
use super::TlsTransport;
#[cfg(feature = "tls")]
use std::sync::Arc;
#[cfg(feature = "tls")]
use tokio_rustls::{client::TlsStream, rustls, TlsConnector};

#[cfg(feature = "ws")]
use super::WebSocketTransport;
#[cfg(feature = "ws")]
use tokio_tungstenite::{
    connect_async, tungstenite, tungstenite::http::Request, MaybeTlsStream, WebSocketStream,
};

/// Transport scheme selected by a broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

/// A parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// WebSocket request path; ignored by the TCP and TLS schemes.
    pub path: String,
}

impl BrokerAddress {
    /// Parses a `scheme://host[:port][/path]` broker address. Ports default to
    /// 1883 (tcp), 8883 (ssl), 80 (ws) and 443 (wss); the WebSocket path
    /// defaults to `/mqtt`.
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| TransportError::Connect(format!("missing scheme in '{url}'")))?;

        let (scheme, default_port) = match scheme_str {
            "tcp" | "mqtt" => (Scheme::Tcp, 1883),
            "ssl" | "tls" | "mqtts" => (Scheme::Tls, 8883),
            "ws" => (Scheme::Ws, 80),
            "wss" => (Scheme::Wss, 443),
            other => {
                return Err(TransportError::Connect(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(TransportError::Connect(format!("missing host in '{url}'")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|e| TransportError::Connect(format!("invalid port: {e}")))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        };

        let path = if path.is_empty() {
            "/mqtt".to_string()
        } else {
            path.to_string()
        };

        Ok(BrokerAddress {
            scheme,
            host,
            port,
            path,
        })
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// TLS configuration handed through from the client options, opaque to the
/// dialer when the `tls` feature is off.
#[cfg(feature = "tls")]
pub type TlsClientConfig = Arc<rustls::ClientConfig>;

/// Dials `broker` and returns a connected transport for its scheme.
///
/// `headers` are additional HTTP headers for the WebSocket handshake and are
/// ignored by the TCP and TLS schemes.
pub async fn dial(
    broker: &BrokerAddress,
    #[cfg(feature = "tls")] tls_config: Option<TlsClientConfig>,
    headers: &HashMap<String, String>,
    timeout: Option<Duration>,
) -> Result<Box<dyn TransportOps + Send>, TransportError> {
    match broker.scheme {
        Scheme::Tcp => {
            let _ = headers;
            let stream = connect_tcp(&broker.addr(), timeout).await?;
            Ok(Box::new(TcpTransport::from_stream(stream)))
        }
        #[cfg(feature = "tls")]
        Scheme::Tls => {
            let stream = connect_tcp_tls(&broker.addr(), &broker.host, tls_config, timeout).await?;
            Ok(Box::new(TlsTransport::from_stream(stream)))
        }
        #[cfg(feature = "ws")]
        Scheme::Ws => {
            let ws = connect_tcp_ws(
                &broker.addr(),
                &broker.host,
                &broker.path,
                Some(headers.clone()),
                timeout,
            )
            .await?;
            Ok(Box::new(WebSocketTransport::from_tcp_client_stream(ws)))
        }
        #[cfg(all(feature = "ws", feature = "tls"))]
        Scheme::Wss => {
            let ws = connect_tcp_tls_ws(
                &broker.addr(),
                &broker.host,
                &broker.path,
                tls_config,
                Some(headers.clone()),
                timeout,
            )
            .await?;
            Ok(Box::new(WebSocketTransport::from_tls_client_stream(ws)))
        }
        #[allow(unreachable_patterns)]
        other => Err(TransportError::Connect(format!(
            "scheme {other:?} not enabled in this build"
        ))),
    }
}

/// Establishes a TCP connection to `addr` (`host:port`, resolved via DNS).
pub async fn connect_tcp(
    addr: &str,
    timeout: Option<Duration>,
) -> Result<TcpStream, TransportError> {
    match timeout {
        Some(timeout_duration) => tokio::time::timeout(timeout_duration, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(TransportError::Io),
        None => TcpStream::connect(addr).await.map_err(TransportError::Io),
    }
}

/// Establishes a TCP connection followed by a TLS handshake.
///
/// `domain` is the server name used for certificate verification. With no
/// explicit `tls_config` the platform's native root certificates are trusted.
#[cfg(feature = "tls")]
pub async fn connect_tcp_tls(
    addr: &str,
    domain: &str,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    timeout: Option<Duration>,
) -> Result<TlsStream<TcpStream>, TransportError> {
    let tcp_stream = connect_tcp(addr, timeout).await?;

    let tls_config = tls_config.unwrap_or_else(|| {
        use rustls::RootCertStore;
        let mut root_store = RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().unwrap_or_default() {
            let _ = root_store.add(&rustls::Certificate(cert.0));
        }
        Arc::new(
            rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    });

    let connector = TlsConnector::from(tls_config);
    let server_name =
        rustls::ServerName::try_from(domain).map_err(|e| TransportError::Tls(Box::new(e)))?;

    match timeout {
        Some(timeout_duration) => {
            tokio::time::timeout(timeout_duration, connector.connect(server_name, tcp_stream))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Tls(Box::new(e)))
        }
        None => connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TransportError::Tls(Box::new(e))),
    }
}

#[cfg(feature = "ws")]
fn ws_request(
    url: &str,
    host_header: &str,
    headers: Option<HashMap<String, String>>,
) -> Result<Request<()>, TransportError> {
    let mut request_builder = Request::builder()
        .uri(url)
        .header("Host", host_header)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Protocol", "mqtt");

    if let Some(headers) = headers {
        for (key, value) in headers {
            request_builder = request_builder.header(key, value);
        }
    }

    request_builder
        .body(())
        .map_err(|e| TransportError::Connect(format!("Failed to build request: {e}")))
}

/// Establishes a TCP connection followed by a WebSocket handshake, including
/// the `Sec-WebSocket-Protocol: mqtt` header required for MQTT over WebSocket.
#[cfg(feature = "ws")]
pub async fn connect_tcp_ws(
    addr: &str,
    host: &str,
    path: &str,
    headers: Option<HashMap<String, String>>,
    timeout: Option<Duration>,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>, TransportError> {
    let url = format!("ws://{addr}{path}");
    let request = ws_request(&url, &format!("{host}:{}", addr_port(addr)), headers)?;

    let (ws_stream, _response) = match timeout {
        Some(timeout_duration) => tokio::time::timeout(timeout_duration, connect_async(request))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::WebSocket(Box::new(e)))?,
        None => connect_async(request)
            .await
            .map_err(|e| TransportError::WebSocket(Box::new(e)))?,
    };

    Ok(ws_stream)
}

/// Establishes a TCP connection, a TLS handshake and a WebSocket handshake in
/// sequence.
#[cfg(all(feature = "ws", feature = "tls"))]
pub async fn connect_tcp_tls_ws(
    addr: &str,
    domain: &str,
    path: &str,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    headers: Option<HashMap<String, String>>,
    timeout: Option<Duration>,
) -> Result<WebSocketStream<TlsStream<TcpStream>>, TransportError> {
    let port = addr_port(addr);
    let url = format!("wss://{domain}:{port}{path}");

    let tls_stream = connect_tcp_tls(addr, domain, tls_config, timeout).await?;

    let request = ws_request(&url, &format!("{domain}:{port}"), headers)?;

    let (ws_stream, _response) = match timeout {
        Some(timeout_duration) => tokio::time::timeout(
            timeout_duration,
            tokio_tungstenite::client_async(request, tls_stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::WebSocket(Box::new(e)))?,
        None => tokio_tungstenite::client_async(request, tls_stream)
            .await
            .map_err(|e| TransportError::WebSocket(Box::new(e)))?,
    };

    Ok(ws_stream)
}

#[cfg(feature = "ws")]
fn addr_port(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(_, p)| p).unwrap_or("80")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_per_scheme() {
        let a = BrokerAddress::parse("tcp://broker.local").unwrap();
        assert_eq!(a.scheme, Scheme::Tcp);
        assert_eq!(a.port, 1883);

        let a = BrokerAddress::parse("ssl://broker.local").unwrap();
        assert_eq!(a.scheme, Scheme::Tls);
        assert_eq!(a.port, 8883);

        let a = BrokerAddress::parse("wss://broker.local/custom").unwrap();
        assert_eq!(a.scheme, Scheme::Wss);
        assert_eq!(a.port, 443);
        assert_eq!(a.path, "/custom");
    }

    #[test]
    fn parse_explicit_port_and_default_ws_path() {
        let a = BrokerAddress::parse("ws://10.0.0.1:9001").unwrap();
        assert_eq!(a.host, "10.0.0.1");
        assert_eq!(a.port, 9001);
        assert_eq!(a.path, "/mqtt");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(BrokerAddress::parse("broker.local:1883").is_err());
        assert!(BrokerAddress::parse("ftp://broker.local").is_err());
        assert!(BrokerAddress::parse("tcp://").is_err());
        assert!(BrokerAddress::parse("tcp://host:notaport").is_err());
    }
}
