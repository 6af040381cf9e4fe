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

//! Transport layer for MQTT broker connections.
//!
//! This module provides the transport abstraction and the built-in transport
//! implementations used by the client:
//!
//! - **TCP**: plain TCP socket transport
//! - **TLS**: TLS-encrypted TCP transport (feature `tls`)
//! - **WebSocket / WebSocket over TLS**: WebSocket transport (feature `ws`)
//!
//! A transport is handed to the client as a whole object so the CONNECT /
//! CONNACK handshake can run over it sequentially. Once the handshake has been
//! accepted the comms pump consumes the transport via [`TransportOps::into_split`]
//! and runs the read and write halves from independent tasks.
//!
//! Custom transports (for example out-of-band connection paths provided by a
//! dialer callback) implement [`TransportOps`] plus the two half traits.

pub mod connect_helper;
mod tcp;
#[cfg(feature = "tls")]
mod tls;
#[cfg(feature = "ws")]
mod websocket;

pub use tcp::TcpTransport;
#[cfg(feature = "tls")]
pub use tls::TlsTransport;
#[cfg(feature = "ws")]
pub use websocket::{WebSocketTransport, WsReadHalf, WsWriteHalf};

use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

/// Error types that can occur during transport operations.
///
/// This enum covers all possible errors that may happen during transport
/// layer operations including I/O errors, TLS errors, WebSocket errors,
/// timeouts, and connection failures.
#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    #[cfg(feature = "tls")]
    Tls(Box<dyn std::error::Error + Send + Sync>),
    #[cfg(feature = "ws")]
    WebSocket(Box<dyn std::error::Error + Send + Sync>),
    Timeout,
    Connect(String),
    NotConnected,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {e}"),
            #[cfg(feature = "tls")]
            TransportError::Tls(e) => write!(f, "TLS error: {e}"),
            #[cfg(feature = "ws")]
            TransportError::WebSocket(e) => write!(f, "WebSocket error: {e}"),
            TransportError::Timeout => write!(f, "Operation timed out"),
            TransportError::Connect(msg) => write!(f, "Connection failed: {msg}"),
            TransportError::NotConnected => write!(f, "Transport not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Read half of a split transport.
///
/// The comms pump's reader task owns one of these for the lifetime of a
/// connection.
pub trait TransportRead: Send {
    /// Receives data from the transport layer.
    ///
    /// The method may return before the buffer is completely filled.
    ///
    /// # Parameters
    ///
    /// * `buffer` - Mutable buffer to store the received data
    ///
    /// # Returns
    ///
    /// Returns `Ok(bytes_read)` containing the number of bytes actually read
    /// (0 signals that the peer closed the stream), or a [`TransportError`]
    /// if receiving fails.
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>>;
}

/// Write half of a split transport.
///
/// The comms pump's writer task owns one of these for the lifetime of a
/// connection.
pub trait TransportWrite: Send {
    /// Sends data through the transport layer.
    ///
    /// The implementation handles partial vectored writes internally; on
    /// success every byte of every buffer has been accepted by the
    /// transport.
    ///
    /// # Parameters
    ///
    /// * `buffers` - Array of I/O slices containing the data to send
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` if all data is successfully sent, or a
    /// [`TransportError`] if sending fails.
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Gracefully shuts down the write direction.
    ///
    /// If the timeout expires or the shutdown fails, the connection is
    /// closed anyway when the half is dropped; failures are swallowed.
    ///
    /// # Parameters
    ///
    /// * `timeout` - Maximum duration to wait for graceful shutdown
    fn shutdown<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Core trait that defines the transport layer operations for MQTT
/// connections.
///
/// A connected transport, as produced by the dialer or a custom dial
/// callback. `send`/`recv` drive the CONNECT/CONNACK handshake sequentially
/// before the comms pump exists; `into_split` then consumes the transport
/// and yields independently owned halves for the pump's reader and writer
/// tasks.
///
/// # Custom Transport Implementation
///
/// Users can implement their own custom transport by implementing this trait
/// together with [`TransportRead`] and [`TransportWrite`], and handing it to
/// the client through a custom dialer. This allows integration with custom
/// network protocols, specialized hardware, or other transport mechanisms
/// not covered by the built-in implementations.
///
/// # Examples
///
/// ```ignore
/// use mqtt_client_tokio::mqtt_cl::transport::{TransportOps, TransportRead, TransportWrite, TransportError};
/// use std::io::IoSlice;
/// use std::pin::Pin;
/// use std::future::Future;
/// use tokio::time::Duration;
///
/// struct MyCustomTransport {
///     // Your transport-specific fields
/// }
///
/// impl TransportOps for MyCustomTransport {
///     fn send<'a>(
///         &'a mut self,
///         buffers: &'a [IoSlice<'a>],
///     ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
///         Box::pin(async move {
///             // Implement your send logic
///             Ok(())
///         })
///     }
///
///     fn recv<'a>(
///         &'a mut self,
///         buffer: &'a mut [u8],
///     ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
///         Box::pin(async move {
///             // Implement your receive logic
///             Ok(0)
///         })
///     }
///
///     fn shutdown<'a>(
///         &'a mut self,
///         timeout: Duration,
///     ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
///         Box::pin(async move {
///             // Implement your shutdown logic
///         })
///     }
///
///     fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
///         // Hand each direction to its comms pump task
///         unimplemented!()
///     }
/// }
/// ```
pub trait TransportOps: Send {
    /// Sends data through the transport layer.
    ///
    /// # Parameters
    ///
    /// * `buffers` - Array of I/O slices containing the data to send
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` if all data is successfully sent, or a
    /// [`TransportError`] if sending fails.
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

    /// Receives data from the transport layer.
    ///
    /// The method may return before the buffer is completely filled.
    ///
    /// # Parameters
    ///
    /// * `buffer` - Mutable buffer to store the received data
    ///
    /// # Returns
    ///
    /// Returns `Ok(bytes_read)` containing the number of bytes actually
    /// read, or a [`TransportError`] if receiving fails.
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>>;

    /// Gracefully shuts down the transport connection.
    ///
    /// If the timeout expires, the connection may be forcibly closed.
    ///
    /// # Parameters
    ///
    /// * `timeout` - Maximum duration to wait for graceful shutdown
    fn shutdown<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Splits the transport into its read and write halves.
    ///
    /// # Returns
    ///
    /// The [`TransportRead`] and [`TransportWrite`] halves, each owned by
    /// one comms pump task for the rest of the connection.
    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>);
}

impl TransportOps for Box<dyn TransportOps + Send> {
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        (**self).send(buffers)
    }

    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        (**self).recv(buffer)
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        (**self).shutdown(timeout)
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        (*self).into_split()
    }
}

/// Writes every buffer in `buffers` to `stream`, looping over partial vectored
/// writes, then flushes.
pub(crate) async fn write_all_vectored<S>(
    stream: &mut S,
    buffers: &[IoSlice<'_>],
) -> Result<(), TransportError>
where
    S: AsyncWrite + Send + Unpin,
{
    let total_bytes: usize = buffers.iter().map(|buf| buf.len()).sum();

    let mut buffer_start_indices = vec![0usize; buffers.len()];
    let mut total_written = 0usize;

    while total_written < total_bytes {
        let current_buffers: Vec<IoSlice> = buffers
            .iter()
            .enumerate()
            .filter_map(|(i, buf)| {
                let start = buffer_start_indices[i];
                if start < buf.len() {
                    Some(IoSlice::new(&buf[start..]))
                } else {
                    None
                }
            })
            .collect();

        if current_buffers.is_empty() {
            break;
        }

        let bytes_written = stream
            .write_vectored(&current_buffers)
            .await
            .map_err(TransportError::Io)?;

        if bytes_written == 0 {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0 bytes written",
            )));
        }

        total_written += bytes_written;

        let mut remaining_to_skip = bytes_written;
        for (i, buf) in buffers.iter().enumerate() {
            let available = buf.len() - buffer_start_indices[i];
            if available > 0 {
                let to_consume = remaining_to_skip.min(available);
                buffer_start_indices[i] += to_consume;
                remaining_to_skip -= to_consume;

                if remaining_to_skip == 0 {
                    break;
                }
            }
        }
    }

    stream.flush().await.map_err(TransportError::Io)?;

    Ok(())
}

impl<S> TransportRead for tokio::io::ReadHalf<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        Box::pin(async move { self.read(buffer).await.map_err(TransportError::Io) })
    }
}

impl<S> TransportWrite for tokio::io::WriteHalf<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(write_all_vectored(self, buffers))
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout_duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let _ = timeout(timeout_duration, AsyncWriteExt::shutdown(self)).await;
        })
    }
}
