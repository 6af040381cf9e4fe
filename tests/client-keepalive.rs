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

//! Keepalive: PINGREQ cadence on an idle link and the ping timeout path.

mod common;

use mqtt_client_tokio::mqtt_cl::{AsyncClient, ClientError, ClientOptions, Packet};
use std::sync::Arc;
use std::time::Duration;
use stub_transport::{broker_pair, queue_dialer};

const WAIT: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn idle_link_pings_and_unanswered_ping_disconnects() {
    common::init_tracing();

    let (transport, mut broker) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport]);
    let (lost_tx, mut lost_rx) = tokio::sync::mpsc::unbounded_channel();
    let options = ClientOptions::builder()
        .client_id("test_client")
        .keep_alive(Duration::from_secs(2))
        .auto_reconnect(false)
        .on_connection_lost(Arc::new(move |err: Arc<ClientError>| {
            let _ = lost_tx.send(err);
        }) as mqtt_client_tokio::mqtt_cl::ConnectionLostHandler)
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker_task = tokio::spawn(async move {
        let connect = broker.accept().await;
        assert_eq!(connect.keep_alive, 2);
        broker
    });
    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let mut broker = broker_task.await.unwrap();

    // First idle interval elapses: PINGREQ. Answer it.
    let packet = broker
        .recv_packet_timeout(WAIT)
        .await
        .expect("no PINGREQ on the wire");
    assert_eq!(packet, Packet::Pingreq);
    broker.send_packet(Packet::Pingresp).await;

    // Second PINGREQ goes unanswered; one keepalive interval later the
    // client gives up.
    let packet = broker
        .recv_packet_timeout(WAIT)
        .await
        .expect("no second PINGREQ on the wire");
    assert_eq!(packet, Packet::Pingreq);

    let err = tokio::time::timeout(WAIT, lost_rx.recv())
        .await
        .expect("connection lost callback not invoked")
        .unwrap();
    assert!(matches!(*err, ClientError::PingTimeout));
    assert!(!client.is_connected());
}
