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

//! Packet identifier space exhaustion across the public API.

mod common;

use mqtt_client_tokio::mqtt_cl::{AsyncClient, ClientError, ClientOptions, QoS};
use std::time::Duration;
use stub_transport::failing_dialer;

#[tokio::test]
async fn exhausting_the_id_space_fails_the_next_publish() {
    common::init_tracing();

    // Connect-retry against an unreachable broker parks the client in the
    // connecting state, where QoS 1 publishes claim an id and persist without
    // touching the wire.
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(true)
        .connect_retry(true)
        .connect_retry_interval(Duration::from_secs(3600))
        .auto_reconnect(false)
        .keep_alive(Duration::ZERO)
        .custom_dialer(failing_dialer())
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let _connect = client.connect().await;
    assert!(client.is_connected());
    assert!(!client.is_connection_open());

    let mut sampled = Vec::new();
    for i in 0u32..65535 {
        let token = client.publish("a/b", QoS::AtLeastOnce, false, "x").await;
        assert!(
            token.error().is_none(),
            "publish {i} unexpectedly failed: {:?}",
            token.error()
        );
        if i % 10000 == 0 {
            sampled.push(token);
        }
    }

    let overflow = client.publish("a/b", QoS::AtLeastOnce, false, "x").await;
    assert!(matches!(
        *overflow.error().expect("overflow publish should fail"),
        ClientError::NoMessageIdsAvailable
    ));

    // Every earlier token is still pending.
    for token in &sampled {
        assert!(!token.is_complete());
    }

    client.force_disconnect().await;

    // Teardown abandons the outstanding flows.
    for token in &sampled {
        assert!(matches!(
            *token.error().expect("token should be abandoned"),
            ClientError::Disconnecting
        ));
    }
}
