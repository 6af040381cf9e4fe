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

//! TCP transport against a real loopback listener.

mod common;

use mqtt_client_tokio::mqtt_cl::transport::connect_helper::connect_tcp;
use mqtt_client_tokio::mqtt_cl::transport::TcpTransport;
use mqtt_client_tokio::mqtt_cl::{TransportError, TransportOps};
use std::io::IoSlice;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn tcp_transport_roundtrip_whole_and_split() {
    common::init_tracing();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let echo_task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.unwrap();
        }
    });

    let stream = connect_tcp(&addr.to_string(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let mut transport = TcpTransport::from_stream(stream);

    // Whole-object send/recv, as used by the connect handshake.
    transport.send(&[IoSlice::new(b"ping")]).await.unwrap();
    let mut buf = [0u8; 16];
    let n = transport.recv(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping");

    // Split halves, as used by the comms pump.
    let boxed: Box<dyn TransportOps + Send> = Box::new(transport);
    let (mut read_half, mut write_half) = boxed.into_split();
    write_half
        .send(&[IoSlice::new(b"po"), IoSlice::new(b"ng")])
        .await
        .unwrap();
    let mut received = Vec::new();
    while received.len() < 4 {
        let n = read_half.recv(&mut buf).await.unwrap();
        assert!(n > 0, "echo closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&received, b"pong");

    write_half.shutdown(Duration::from_secs(1)).await;
    echo_task.await.unwrap();
}

#[tokio::test]
async fn dialing_a_closed_port_reports_a_transport_error() {
    common::init_tracing();

    // Bind and immediately drop to get a port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = connect_tcp(&addr.to_string(), Some(Duration::from_secs(5))).await;
    assert!(matches!(
        result,
        Err(TransportError::Io(_)) | Err(TransportError::Timeout)
    ));
}
