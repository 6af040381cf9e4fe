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

//! Automatic reconnection: in-flight QoS 1 redelivery across a transport
//! drop, and a user disconnect racing the reconnect backoff.

mod common;

use mqtt_client_tokio::mqtt_cl::{AsyncClient, ClientError, ClientOptions, Packet, QoS};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stub_transport::{broker_pair, queue_dialer};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn qos1_publish_survives_mid_flight_reconnect() {
    common::init_tracing();

    let (transport1, mut broker1) = broker_pair();
    let (transport2, mut broker2) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport1, transport2]);

    let on_connect_count = Arc::new(AtomicUsize::new(0));
    let counter = on_connect_count.clone();
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(false)
        .auto_reconnect(true)
        .keep_alive(Duration::ZERO)
        .on_connect(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }) as mqtt_client_tokio::mqtt_cl::ConnectHandler)
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker1_task = tokio::spawn(async move {
        let connect = broker1.accept().await;
        assert!(!connect.clean_session);
        broker1
    });
    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let mut broker1 = broker1_task.await.unwrap();

    let publish_token = client.publish("a/b", QoS::AtLeastOnce, false, "hi").await;
    let packet = broker1
        .recv_packet_timeout(WAIT)
        .await
        .expect("no PUBLISH on the wire");
    let Packet::Publish(first) = packet else {
        panic!("expected PUBLISH, got {packet:?}");
    };
    assert_ne!(first.packet_id, 0);

    // Kill the transport before any PUBACK.
    drop(broker1);

    let first_id = first.packet_id;
    let broker2_task = tokio::spawn(async move {
        let connect = broker2.accept_with(
            mqtt_client_tokio::mqtt_cl::ConnectReturnCode::Accepted,
            true,
        )
        .await;
        assert!(!connect.clean_session);
        let packet = broker2
            .recv_packet_timeout(WAIT)
            .await
            .expect("no redelivered PUBLISH");
        let Packet::Publish(redelivered) = packet else {
            panic!("expected PUBLISH, got {packet:?}");
        };
        assert!(redelivered.dup, "resumed publish should carry the DUP flag");
        assert_eq!(redelivered.packet_id, first_id);
        assert_eq!(&redelivered.payload[..], b"hi");
        broker2
            .send_packet(Packet::Puback {
                packet_id: redelivered.packet_id,
            })
            .await;
        broker2
    });

    tokio::time::timeout(WAIT, publish_token.wait())
        .await
        .expect("publish token never completed")
        .expect("publish failed");
    let _broker2 = broker2_task.await.unwrap();

    // IsConnected held true across the drop: auto-reconnect keeps the client
    // logically connected from the first CONNACK until Disconnect.
    assert!(client.is_connected());

    // OnConnect fires once per successful connection, including the reconnect.
    let deadline = tokio::time::Instant::now() + WAIT;
    while on_connect_count.load(Ordering::SeqCst) < 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "OnConnect not fired for the reconnect"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    client.disconnect(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_reconnect_backoff_stops_the_client() {
    common::init_tracing();

    let (transport1, mut broker1) = broker_pair();
    // Only one staged transport: every reconnect attempt fails.
    let (dialer, _queue) = queue_dialer(vec![transport1]);

    let on_connect_count = Arc::new(AtomicUsize::new(0));
    let counter = on_connect_count.clone();
    let (reconnecting_tx, mut reconnecting_rx) = tokio::sync::mpsc::unbounded_channel();
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(false)
        .auto_reconnect(true)
        .keep_alive(Duration::ZERO)
        .on_connect(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }) as mqtt_client_tokio::mqtt_cl::ConnectHandler)
        .on_reconnecting(Arc::new(move |backoff| {
            let _ = reconnecting_tx.send(backoff);
        }) as mqtt_client_tokio::mqtt_cl::ReconnectHandler)
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker1_task = tokio::spawn(async move {
        broker1.accept().await;
        broker1
    });
    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let broker1 = broker1_task.await.unwrap();

    // Drop the link; the client enters Reconnecting and its attempts fail.
    drop(broker1);
    let backoff = tokio::time::timeout(WAIT, reconnecting_rx.recv())
        .await
        .expect("reconnect worker never started")
        .unwrap();
    assert_eq!(backoff, Duration::from_secs(1));
    assert!(client.is_connected());
    assert!(!client.is_connection_open());

    // Disconnect while the backoff sleeps.
    client.disconnect(Duration::ZERO).await;
    assert!(!client.is_connected());

    // Give any stray reconnect work time to run: no second OnConnect fires
    // and operations keep failing.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(on_connect_count.load(Ordering::SeqCst), 1);
    let publish = client.publish("a/b", QoS::AtLeastOnce, false, "x").await;
    assert!(matches!(
        *publish.error().expect("publish should fail"),
        ClientError::NotConnected
    ));
}
