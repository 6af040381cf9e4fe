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

//! Routing of inbound PUBLISH packets to user handlers.
//!
//! The route table maps MQTT topic filters to handlers. Dispatch looks up
//! every filter matching the published topic (wildcard grammar: `+` matches
//! one level, a trailing `#` matches the rest), invokes each handler once per
//! packet, and acknowledges the packet afterwards so a crash between delivery
//! and acknowledgement re-delivers rather than drops.
//!
//! Shared-subscription prefixes (`$share/<group>/`, `$queue/`) are stripped
//! from filters before they enter the table, so inbound topics match the
//! underlying filter directly.

use crate::mqtt_cl::packet::{Packet, Publish, QoS};
use crate::mqtt_cl::pump::PacketAndToken;
use crate::mqtt_cl::store::{persist_inbound, Store};
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// An application message delivered to a subscription handler.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub dup: bool,
    /// Packet identifier of the underlying PUBLISH; 0 for QoS 0.
    pub packet_id: u16,
}

impl Message {
    pub(crate) fn from_publish(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retained: publish.retain,
            dup: publish.dup,
            packet_id: publish.packet_id,
        }
    }
}

/// Callback invoked for each message matching a subscription.
///
/// Handlers run on the dispatch path and must not block it indefinitely; with
/// ordered delivery enabled a slow handler stalls all subsequent deliveries.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

struct Route {
    filter: String,
    handler: MessageHandler,
}

/// Topic-filter → handler table shared between user threads (insertions and
/// removals) and the dispatch loop (lookups).
pub(crate) struct Router {
    routes: Mutex<Vec<Route>>,
    default_handler: Mutex<Option<MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            default_handler: Mutex::new(None),
        }
    }

    /// Installs `handler` for `filter`, replacing any previous handler for the
    /// exact same filter.
    pub fn add_route(&self, filter: &str, handler: MessageHandler) {
        let filter = strip_shared_prefix(filter);
        let mut routes = self.routes.lock().expect("router mutex poisoned");
        if let Some(route) = routes.iter_mut().find(|r| r.filter == filter) {
            route.handler = handler;
        } else {
            routes.push(Route {
                filter: filter.to_string(),
                handler,
            });
        }
    }

    pub fn delete_route(&self, filter: &str) {
        let filter = strip_shared_prefix(filter);
        self.routes
            .lock()
            .expect("router mutex poisoned")
            .retain(|r| r.filter != filter);
    }

    pub fn set_default(&self, handler: Option<MessageHandler>) {
        *self.default_handler.lock().expect("router mutex poisoned") = handler;
    }

    /// Handlers whose filter matches `topic`, falling back to the default
    /// handler when nothing matches.
    fn handlers_for(&self, topic: &str) -> Vec<MessageHandler> {
        let routes = self.routes.lock().expect("router mutex poisoned");
        let matched: Vec<MessageHandler> = routes
            .iter()
            .filter(|r| topic_matches(&r.filter, topic))
            .map(|r| r.handler.clone())
            .collect();
        if matched.is_empty() {
            if let Some(default) = self
                .default_handler
                .lock()
                .expect("router mutex poisoned")
                .clone()
            {
                return vec![default];
            }
        }
        matched
    }

    /// Consumes the inbound PUBLISH stream until it closes.
    ///
    /// With `ordered` set, handlers run serialized on this task in wire order;
    /// otherwise each delivery gets a fresh task and deliveries may interleave.
    /// Acknowledgement (PUBACK for QoS 1, PUBREC opening the QoS 2 exchange)
    /// follows handler completion in both modes.
    pub async fn match_and_dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Publish>,
        ordered: bool,
        mut acks: AckEmitter,
    ) {
        while let Some(publish) = inbound.recv().await {
            let handlers = self.handlers_for(&publish.topic);
            if handlers.is_empty() {
                debug!(topic = %publish.topic, "no route for inbound publish");
            }
            let message = Message::from_publish(&publish);
            if ordered {
                for handler in &handlers {
                    handler(message.clone());
                }
                acks.ack(&publish).await;
            } else {
                let mut acks = acks.clone();
                tokio::spawn(async move {
                    for handler in &handlers {
                        handler(message.clone());
                    }
                    acks.ack(&publish).await;
                });
            }
        }
        debug!("router dispatch loop finished");
    }
}

/// Emits the acknowledgement owed for a delivered PUBLISH into the pump's
/// priority stream.
#[derive(Clone)]
pub(crate) struct AckEmitter {
    store: Arc<dyn Store>,
    priority_tx: mpsc::Sender<PacketAndToken>,
    stop_rx: watch::Receiver<bool>,
}

impl AckEmitter {
    pub fn new(
        store: Arc<dyn Store>,
        priority_tx: mpsc::Sender<PacketAndToken>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            priority_tx,
            stop_rx,
        }
    }

    /// An undelivered acknowledgement (pump shutting down, writer gone) is
    /// simply dropped: the broker redelivers the packet on the next session.
    async fn ack(&mut self, publish: &Publish) {
        let ack = match publish.qos {
            QoS::AtMostOnce => return,
            QoS::AtLeastOnce => Packet::Puback {
                packet_id: publish.packet_id,
            },
            QoS::ExactlyOnce => {
                // Persisted at the moment PUBREC goes out; deleted when the
                // broker's PUBREL is answered.
                persist_inbound(&*self.store, &Packet::Publish(publish.clone()));
                Packet::Pubrec {
                    packet_id: publish.packet_id,
                }
            }
        };
        let pending = PacketAndToken {
            packet: ack,
            token: None,
        };
        tokio::select! {
            _ = self.stop_rx.changed() => {}
            _ = self.priority_tx.send(pending) => {}
        }
    }
}

/// Strips `$share/<group>/` and `$queue/` subscription prefixes, leaving the
/// filter that inbound topics are matched against.
pub(crate) fn strip_shared_prefix(filter: &str) -> &str {
    if let Some(rest) = filter.strip_prefix("$share/") {
        match rest.split_once('/') {
            Some((_group, rest)) => rest,
            None => rest,
        }
    } else if let Some(rest) = filter.strip_prefix("$queue/") {
        rest
    } else {
        filter
    }
}

/// Whether `filter` matches `topic` under the MQTT wildcard grammar.
///
/// Topics beginning with `$` are only matched by filters that name the first
/// level literally, per MQTT v3.1.1 §4.7.2.
pub(crate) fn topic_matches(filter: &str, topic: &str) -> bool {
    let filter_levels: Vec<&str> = filter.split('/').collect();
    let topic_levels: Vec<&str> = topic.split('/').collect();

    if topic.starts_with('$') && (filter_levels[0] == "+" || filter_levels[0] == "#") {
        return false;
    }

    let mut i = 0;
    loop {
        match (filter_levels.get(i), topic_levels.get(i)) {
            (Some(&"#"), _) => return i == filter_levels.len() - 1,
            (Some(&"+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
        i += 1;
    }
}
