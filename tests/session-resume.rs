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

//! Persistence-backed session resume: replay of stored traffic after retried
//! connects and simulated restarts.

mod common;

use mqtt_client_tokio::mqtt_cl::packet::Publish;
use mqtt_client_tokio::mqtt_cl::{
    AsyncClient, ClientOptions, MemoryStore, Packet, QoS, Store,
};
use std::sync::Arc;
use std::time::Duration;
use stub_transport::{broker_pair, queue_dialer};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn publish_while_connecting_is_resumed_after_retry() {
    common::init_tracing();

    // No transport staged yet: the first connect sweep fails and retries.
    let (dialer, queue) = queue_dialer(vec![]);
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(false)
        .connect_retry(true)
        .connect_retry_interval(Duration::from_millis(100))
        .auto_reconnect(false)
        .keep_alive(Duration::ZERO)
        .store(store.clone())
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let connect_token = client.connect().await;

    // A publish in the connecting window is persisted, not enqueued.
    let publish_token = client.publish("a/b", QoS::AtLeastOnce, false, "hi").await;
    assert!(publish_token.error().is_none());
    assert!(!publish_token.is_complete());
    assert_eq!(store.all().len(), 1);

    // Stage a broker; the next retry sweep finds it.
    let (transport, mut broker) = broker_pair();
    queue.lock().unwrap().push_back(transport);

    let broker_task = tokio::spawn(async move {
        let connect = broker.accept().await;
        assert!(!connect.clean_session);
        let packet = broker
            .recv_packet_timeout(WAIT)
            .await
            .expect("no resumed PUBLISH");
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH, got {packet:?}");
        };
        assert!(publish.dup);
        assert_eq!(&publish.payload[..], b"hi");
        broker
            .send_packet(Packet::Puback {
                packet_id: publish.packet_id,
            })
            .await;
        broker
    });

    tokio::time::timeout(WAIT, connect_token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    tokio::time::timeout(WAIT, publish_token.wait())
        .await
        .expect("publish token never completed")
        .expect("publish failed");

    let _broker = broker_task.await.unwrap();

    // Once the PUBACK lands the handshake is done and the entry is gone.
    wait_until(|| store.all().is_empty(), "store entry not deleted").await;

    client.disconnect(Duration::ZERO).await;
}

#[tokio::test]
async fn restart_with_durable_store_redelivers_unacked_publish() {
    common::init_tracing();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    // First client life: publish QoS 1, never acknowledged.
    {
        let (transport, mut broker) = broker_pair();
        let (dialer, _queue) = queue_dialer(vec![transport]);
        let options = ClientOptions::builder()
            .client_id("test_client")
            .clean_session(false)
            .auto_reconnect(false)
            .keep_alive(Duration::ZERO)
            .store(store.clone())
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
        let mut broker = broker_task.await.unwrap();

        let _publish = client.publish("a/b", QoS::AtLeastOnce, false, "hi").await;
        let packet = broker
            .recv_packet_timeout(WAIT)
            .await
            .expect("no PUBLISH on the wire");
        assert!(matches!(packet, Packet::Publish(_)));

        // Crash: no PUBACK, no graceful disconnect.
        client.force_disconnect().await;
    }

    // Second client life over the same store resumes the flow.
    let (transport, mut broker) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport]);
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(false)
        .auto_reconnect(false)
        .keep_alive(Duration::ZERO)
        .store(store.clone())
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker_task = tokio::spawn(async move {
        broker.accept().await;
        let packet = broker
            .recv_packet_timeout(WAIT)
            .await
            .expect("no resumed PUBLISH");
        let Packet::Publish(publish) = packet else {
            panic!("expected PUBLISH, got {packet:?}");
        };
        assert!(publish.dup);
        assert_eq!(&publish.payload[..], b"hi");
        broker
            .send_packet(Packet::Puback {
                packet_id: publish.packet_id,
            })
            .await;
        broker
    });

    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let _broker = broker_task.await.unwrap();

    wait_until(|| store.all().is_empty(), "store entry not deleted").await;
    client.disconnect(Duration::ZERO).await;
}

#[tokio::test]
async fn stored_inbound_pubrel_finishes_the_exchange() {
    common::init_tracing();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.open();
    store.put("i.5", Packet::Pubrel { packet_id: 5 });
    store.close();

    let (transport, mut broker) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport]);
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(false)
        .auto_reconnect(false)
        .keep_alive(Duration::ZERO)
        .store(store.clone())
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker_task = tokio::spawn(async move {
        broker.accept().await;
        let packet = broker
            .recv_packet_timeout(WAIT)
            .await
            .expect("no PUBCOMP on the wire");
        assert_eq!(packet, Packet::Pubcomp { packet_id: 5 });
        broker
    });

    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let _broker = broker_task.await.unwrap();

    wait_until(|| store.all().is_empty(), "inbound entry not deleted").await;
    client.disconnect(Duration::ZERO).await;
}

#[tokio::test]
async fn clean_session_resets_the_store() {
    common::init_tracing();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store.open();
    store.put(
        "o.3",
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: "a/b".to_string(),
            packet_id: 3,
            payload: bytes::Bytes::from_static(b"stale"),
        }),
    );
    store.close();

    let (transport, mut broker) = broker_pair();
    let (dialer, _queue) = queue_dialer(vec![transport]);
    let options = ClientOptions::builder()
        .client_id("test_client")
        .clean_session(true)
        .auto_reconnect(false)
        .keep_alive(Duration::ZERO)
        .store(store.clone())
        .custom_dialer(dialer)
        .build()
        .unwrap();
    let client = AsyncClient::new(options);

    let broker_task = tokio::spawn(async move {
        broker.accept().await;
        // Nothing is replayed on a clean session.
        assert!(broker
            .recv_packet_timeout(Duration::from_millis(200))
            .await
            .is_none());
        broker
    });

    let token = client.connect().await;
    tokio::time::timeout(WAIT, token.wait())
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let _broker = broker_task.await.unwrap();

    assert!(store.all().is_empty());
    client.disconnect(Duration::ZERO).await;
}
