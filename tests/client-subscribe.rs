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

//! Subscription flows: wildcard routing, shared-subscription prefixes,
//! SUBACK grants, unsubscription and filter validation.

mod common;

use mqtt_client_tokio::mqtt_cl::packet::{Publish, Suback};
use mqtt_client_tokio::mqtt_cl::{AsyncClient, ClientError, ClientOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use stub_transport::{broker_pair, queue_dialer, BrokerSide};

const WAIT: Duration = Duration::from_secs(5);

async fn connected_client() -> (AsyncClient, BrokerSide) {
    let (transport, mut broker) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport]);
    let options = ClientOptions::builder()
        .client_id("test_client")
        .keep_alive(Duration::ZERO)
        .auto_reconnect(false)
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker_task = tokio::spawn(async move {
        broker.accept().await;
        broker
    });
    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    (client, broker_task.await.unwrap())
}

fn inbound_publish(topic: &str, payload: &'static [u8]) -> Packet {
    Packet::Publish(Publish {
        dup: false,
        qos: QoS::AtMostOnce,
        retain: false,
        topic: topic.to_string(),
        packet_id: 0,
        payload: bytes::Bytes::from_static(payload),
    })
}

#[tokio::test]
async fn wildcard_subscription_routes_matching_topics_only() {
    common::init_tracing();
    let (client, mut broker) = connected_client().await;

    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Arc::new(move |msg: mqtt_client_tokio::mqtt_cl::Message| {
        let _ = delivered_tx.send(msg.topic);
    });

    let token = client
        .subscribe("sensors/+/temp", QoS::AtLeastOnce, Some(handler))
        .await;

    let packet = broker
        .recv_packet_timeout(WAIT)
        .await
        .expect("no SUBSCRIBE on the wire");
    let Packet::Subscribe(subscribe) = packet else {
        panic!("expected SUBSCRIBE, got {packet:?}");
    };
    assert_eq!(
        subscribe.topics,
        vec![("sensors/+/temp".to_string(), QoS::AtLeastOnce)]
    );

    broker
        .send_packet(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![1],
        }))
        .await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("subscribe timed out")
        .expect("subscribe failed");
    assert_eq!(token.granted_qos(), Some(vec![1]));

    // Matching topic reaches the handler exactly once.
    broker
        .send_packet(inbound_publish("sensors/room1/temp", b"21.5"))
        .await;
    let topic = tokio::time::timeout(WAIT, delivered_rx.recv())
        .await
        .expect("handler not invoked")
        .unwrap();
    assert_eq!(topic, "sensors/room1/temp");

    // Non-matching topic does not.
    broker
        .send_packet(inbound_publish("sensors/room1/humidity", b"40"))
        .await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), delivered_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn shared_subscription_prefix_is_stripped_locally() {
    common::init_tracing();
    let (client, mut broker) = connected_client().await;

    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Arc::new(move |msg: mqtt_client_tokio::mqtt_cl::Message| {
        let _ = delivered_tx.send(msg.topic);
    });

    let token = client
        .subscribe("$share/group1/a/b", QoS::AtLeastOnce, Some(handler))
        .await;

    let packet = broker
        .recv_packet_timeout(WAIT)
        .await
        .expect("no SUBSCRIBE on the wire");
    let Packet::Subscribe(subscribe) = packet else {
        panic!("expected SUBSCRIBE, got {packet:?}");
    };
    // The wire carries the full shared-subscription filter.
    assert_eq!(subscribe.topics[0].0, "$share/group1/a/b");

    broker
        .send_packet(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![1],
        }))
        .await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("subscribe timed out")
        .expect("subscribe failed");

    // Locally the route table maps the stripped filter, so a plain "a/b"
    // delivery finds the handler.
    broker.send_packet(inbound_publish("a/b", b"x")).await;
    let topic = tokio::time::timeout(WAIT, delivered_rx.recv())
        .await
        .expect("handler not invoked")
        .unwrap();
    assert_eq!(topic, "a/b");
}

#[tokio::test]
async fn suback_grants_one_code_per_topic() {
    common::init_tracing();
    let (client, mut broker) = connected_client().await;

    let token = client
        .subscribe_multiple(
            &[("a/b", QoS::AtLeastOnce), ("c/#", QoS::ExactlyOnce)],
            None,
        )
        .await;

    let packet = broker
        .recv_packet_timeout(WAIT)
        .await
        .expect("no SUBSCRIBE on the wire");
    let Packet::Subscribe(subscribe) = packet else {
        panic!("expected SUBSCRIBE, got {packet:?}");
    };
    assert_eq!(subscribe.topics.len(), 2);

    broker
        .send_packet(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![1, 2],
        }))
        .await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("subscribe timed out")
        .expect("subscribe failed");

    let granted = token.granted_qos().unwrap();
    assert_eq!(granted.len(), subscribe.topics.len());
}

#[tokio::test]
async fn unsubscribe_removes_the_route_after_enqueue() {
    common::init_tracing();
    let (client, mut broker) = connected_client().await;

    let (delivered_tx, mut delivered_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Arc::new(move |msg: mqtt_client_tokio::mqtt_cl::Message| {
        let _ = delivered_tx.send(msg.topic);
    });

    let token = client.subscribe("a/b", QoS::AtLeastOnce, Some(handler)).await;
    let packet = broker.recv_packet_timeout(WAIT).await.unwrap();
    let Packet::Subscribe(subscribe) = packet else {
        panic!("expected SUBSCRIBE, got {packet:?}");
    };
    broker
        .send_packet(Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![1],
        }))
        .await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("subscribe timed out")
        .expect("subscribe failed");

    let token = client.unsubscribe(&["a/b"]).await;
    let packet = broker.recv_packet_timeout(WAIT).await.unwrap();
    let Packet::Unsubscribe(unsubscribe) = packet else {
        panic!("expected UNSUBSCRIBE, got {packet:?}");
    };
    assert_eq!(unsubscribe.topics, vec!["a/b".to_string()]);
    broker
        .send_packet(Packet::Unsuback {
            packet_id: unsubscribe.packet_id,
        })
        .await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("unsubscribe timed out")
        .expect("unsubscribe failed");

    // Deliveries no longer reach the removed route.
    broker.send_packet(inbound_publish("a/b", b"late")).await;
    assert!(
        tokio::time::timeout(Duration::from_millis(200), delivered_rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn invalid_filter_fails_without_wire_traffic() {
    common::init_tracing();
    let (client, mut broker) = connected_client().await;

    for filter in ["", "a/#/b", "a/b+"] {
        let token = client.subscribe(filter, QoS::AtLeastOnce, None).await;
        assert!(matches!(
            *token.error().expect("subscribe should fail"),
            ClientError::InvalidTopic(_)
        ));
    }

    assert!(broker
        .recv_packet_timeout(Duration::from_millis(200))
        .await
        .is_none());
}
