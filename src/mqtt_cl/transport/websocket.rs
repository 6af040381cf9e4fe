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

//! WebSocket transport for MQTT over WebSocket (`ws://`) and WebSocket over
//! TLS (`wss://`).
//!
//! MQTT bytes are carried in binary WebSocket messages. The adapter buffers a
//! partially consumed inbound message so `recv` can hand it out in
//! caller-sized chunks, which keeps the packet framing layer transport
//! agnostic.

use super::{TransportError, TransportOps, TransportRead, TransportWrite};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// WebSocket transport over the stream types produced by the connect helpers.
pub enum WebSocketTransport {
    /// `ws://` over plain TCP (possibly TLS when dialed through
    /// `connect_async`, hence the `MaybeTlsStream`).
    Tcp(WsInner<MaybeTlsStream<TcpStream>>),
    /// `wss://` where the TLS handshake was performed explicitly.
    #[cfg(feature = "tls")]
    Tls(WsInner<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl WebSocketTransport {
    /// Creates a transport from a WebSocket stream dialed over TCP.
    pub fn from_tcp_client_stream(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        WebSocketTransport::Tcp(WsInner::new(ws))
    }

    /// Creates a transport from a WebSocket stream dialed over an explicit TLS
    /// connection.
    #[cfg(feature = "tls")]
    pub fn from_tls_client_stream(
        ws: WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>,
    ) -> Self {
        WebSocketTransport::Tls(WsInner::new(ws))
    }
}

impl TransportOps for WebSocketTransport {
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        match self {
            WebSocketTransport::Tcp(inner) => inner.send(buffers),
            #[cfg(feature = "tls")]
            WebSocketTransport::Tls(inner) => inner.send(buffers),
        }
    }

    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        match self {
            WebSocketTransport::Tcp(inner) => inner.recv(buffer),
            #[cfg(feature = "tls")]
            WebSocketTransport::Tls(inner) => inner.recv(buffer),
        }
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout_duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        match self {
            WebSocketTransport::Tcp(inner) => inner.shutdown(timeout_duration),
            #[cfg(feature = "tls")]
            WebSocketTransport::Tls(inner) => inner.shutdown(timeout_duration),
        }
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        match *self {
            WebSocketTransport::Tcp(inner) => inner.into_split(),
            #[cfg(feature = "tls")]
            WebSocketTransport::Tls(inner) => inner.into_split(),
        }
    }
}

/// Unsplit WebSocket adapter carrying a partially consumed inbound message.
pub struct WsInner<S> {
    ws: WebSocketStream<S>,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> WsInner<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            pending: Vec::new(),
            offset: 0,
        }
    }

    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let data = concat_buffers(buffers);
            self.ws
                .send(Message::Binary(data))
                .await
                .map_err(|e| TransportError::WebSocket(Box::new(e)))
        })
    }

    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                if self.offset < self.pending.len() {
                    let n = (self.pending.len() - self.offset).min(buffer.len());
                    buffer[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }
                match self.ws.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        self.pending = data;
                        self.offset = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.pending = text.into_bytes();
                        self.offset = 0;
                    }
                    // Control frames carry no MQTT bytes.
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Ok(0),
                    Some(Err(e)) => return Err(TransportError::WebSocket(Box::new(e))),
                }
            }
        })
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout_duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = timeout(timeout_duration, self.ws.close(None)).await;
        })
    }

    fn into_split(self) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        let (sink, stream) = self.ws.split();
        (
            Box::new(WsReadHalf {
                stream,
                pending: self.pending,
                offset: self.offset,
            }),
            Box::new(WsWriteHalf { sink }),
        )
    }
}

/// Read half of a split WebSocket transport.
pub struct WsReadHalf<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Vec<u8>,
    offset: usize,
}

impl<S> TransportRead for WsReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                if self.offset < self.pending.len() {
                    let n = (self.pending.len() - self.offset).min(buffer.len());
                    buffer[..n].copy_from_slice(&self.pending[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }
                match self.stream.next().await {
                    Some(Ok(Message::Binary(data))) => {
                        self.pending = data;
                        self.offset = 0;
                    }
                    Some(Ok(Message::Text(text))) => {
                        self.pending = text.into_bytes();
                        self.offset = 0;
                    }
                    Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Ok(0),
                    Some(Err(e)) => return Err(TransportError::WebSocket(Box::new(e))),
                }
            }
        })
    }
}

/// Write half of a split WebSocket transport.
pub struct WsWriteHalf<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

impl<S> TransportWrite for WsWriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(async move {
            let data = concat_buffers(buffers);
            self.sink
                .send(Message::Binary(data))
                .await
                .map_err(|e| TransportError::WebSocket(Box::new(e)))
        })
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout_duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = timeout(timeout_duration, self.sink.close()).await;
        })
    }
}

fn concat_buffers(buffers: &[IoSlice<'_>]) -> Vec<u8> {
    let total: usize = buffers.iter().map(|b| b.len()).sum();
    let mut data = Vec::with_capacity(total);
    for buf in buffers {
        data.extend_from_slice(buf);
    }
    data
}
