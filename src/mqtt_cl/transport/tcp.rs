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

use super::{write_all_vectored, TransportError, TransportOps, TransportRead, TransportWrite};
use std::future::Future;
use std::io::IoSlice;
use std::pin::Pin;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

/// TCP transport implementation for MQTT connections.
///
/// This transport provides basic TCP socket connectivity for MQTT
/// communication. It accepts already established TCP streams using
/// [`TcpTransport::from_stream`]. For connection establishment, use the
/// helper functions in [`crate::mqtt_cl::transport::connect_helper`].
///
/// # Examples
///
/// ```ignore
/// use mqtt_client_tokio::mqtt_cl::transport::{TcpTransport, connect_helper};
///
/// let tcp_stream = connect_helper::connect_tcp("127.0.0.1:1883", None).await?;
/// let transport = TcpTransport::from_stream(tcp_stream);
/// ```
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Creates a TCP transport from an already established TCP stream.
    ///
    /// The transport is created in a connected state.
    ///
    /// # Parameters
    ///
    /// * `stream` - An already established TCP stream
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use mqtt_client_tokio::mqtt_cl::transport::{TcpTransport, connect_helper};
    ///
    /// let tcp_stream = connect_helper::connect_tcp("127.0.0.1:1883", None).await?;
    /// let transport = TcpTransport::from_stream(tcp_stream);
    /// ```
    pub fn from_stream(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Provides mutable access to the underlying TCP stream for custom
    /// configuration.
    ///
    /// This method allows users to directly configure the underlying
    /// `TcpStream` for options not covered by the transport abstraction,
    /// such as:
    /// - TCP_NODELAY (`set_nodelay`)
    /// - Time-to-live (`set_ttl`)
    ///
    /// # Safety and Responsibility
    ///
    /// Users are responsible for ensuring that any configuration changes do
    /// not interfere with the transport's normal operation.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use mqtt_client_tokio::mqtt_cl::transport::{TcpTransport, connect_helper};
    ///
    /// let tcp_stream = connect_helper::connect_tcp("127.0.0.1:1883", None).await?;
    /// let mut transport = TcpTransport::from_stream(tcp_stream);
    /// transport.stream_mut().set_nodelay(true)?;
    /// ```
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Provides immutable access to the underlying TCP stream for inspection.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// use mqtt_client_tokio::mqtt_cl::transport::{TcpTransport, connect_helper};
    ///
    /// let tcp_stream = connect_helper::connect_tcp("127.0.0.1:1883", None).await?;
    /// let transport = TcpTransport::from_stream(tcp_stream);
    /// let peer_addr = transport.stream().peer_addr()?;
    /// println!("Connected to {peer_addr}");
    /// ```
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl TransportOps for TcpTransport {
    fn send<'a>(
        &'a mut self,
        buffers: &'a [IoSlice<'a>],
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>> {
        Box::pin(write_all_vectored(&mut self.stream, buffers))
    }

    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        Box::pin(async move { self.stream.read(buffer).await.map_err(TransportError::Io) })
    }

    fn shutdown<'a>(
        &'a mut self,
        timeout_duration: Duration,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            // If graceful shutdown fails or times out the connection is closed
            // when the stream is dropped.
            let _ = timeout(timeout_duration, self.stream.shutdown()).await;
        })
    }

    fn into_split(self: Box<Self>) -> (Box<dyn TransportRead>, Box<dyn TransportWrite>) {
        let (read_half, write_half) = self.stream.into_split();
        (Box::new(read_half), Box::new(write_half))
    }
}

impl TransportRead for OwnedReadHalf {
    fn recv<'a>(
        &'a mut self,
        buffer: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize, TransportError>> + Send + 'a>> {
        Box::pin(async move { self.read(buffer).await.map_err(TransportError::Io) })
    }
}

impl TransportWrite for OwnedWriteHalf {
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
