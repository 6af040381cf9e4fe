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

//! Durable storage for in-flight QoS 1/2 traffic.
//!
//! Keys are direction-tagged: `o.<id>` for packets this client sent (or is
//! sending), `i.<id>` for packets it received and owes a handshake reply for.
//! Within one identifier the store holds at most one packet; persisting the
//! PUBREL of a QoS 2 flow overwrites the PUBLISH under the same key.
//!
//! Store failures must never take the client down. The trait is therefore
//! infallible at the call sites; implementations log and degrade internally.
//! Implementations must be safe for concurrent access from the writer, the
//! reader and user tasks during resume.

use crate::mqtt_cl::packet::{Packet, QoS};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

const OUTBOUND_PREFIX: &str = "o.";
const INBOUND_PREFIX: &str = "i.";

/// Key for a packet this client originated.
pub fn outbound_key(packet_id: u16) -> String {
    format!("{OUTBOUND_PREFIX}{packet_id}")
}

/// Key for a packet received from the broker that still owes a reply.
pub fn inbound_key(packet_id: u16) -> String {
    format!("{INBOUND_PREFIX}{packet_id}")
}

/// Whether `key` names an outbound entry.
pub fn is_key_outbound(key: &str) -> bool {
    key.starts_with(OUTBOUND_PREFIX)
}

/// Durable bag of control packets, bracketed by `open`/`close` around the
/// client's life.
pub trait Store: Send + Sync {
    /// Prepares the store for use. Called by `connect` before any traffic.
    fn open(&self);
    /// Stores `packet` under `key`, replacing any previous entry.
    fn put(&self, key: &str, packet: Packet);
    /// Retrieves the packet stored under `key`.
    fn get(&self, key: &str) -> Option<Packet>;
    /// Lists all keys currently held.
    fn all(&self) -> Vec<String>;
    /// Removes the entry under `key`, if present.
    fn del(&self, key: &str);
    /// Releases the store. No further access until the next `open`.
    fn close(&self);
    /// Drops every entry. Used when connecting with a clean session.
    fn reset(&self);
}

/// Persists an outbound packet according to its QoS class: QoS 1/2 PUBLISH,
/// SUBSCRIBE, UNSUBSCRIBE and PUBREL are stored; everything else needs no
/// durability.
pub(crate) fn persist_outbound(store: &dyn Store, packet: &Packet) {
    let key = match packet {
        Packet::Publish(p) if p.qos != QoS::AtMostOnce => outbound_key(p.packet_id),
        Packet::Subscribe(s) => outbound_key(s.packet_id),
        Packet::Unsubscribe(u) => outbound_key(u.packet_id),
        Packet::Pubrel { packet_id } => outbound_key(*packet_id),
        _ => return,
    };
    store.put(&key, packet.clone());
}

/// Persists an inbound packet that obligates this client to finish a
/// handshake: the QoS 2 PUBLISH we answered with PUBREC, and the PUBREL that
/// replaces it until our PUBCOMP goes out.
pub(crate) fn persist_inbound(store: &dyn Store, packet: &Packet) {
    let key = match packet {
        Packet::Publish(p) if p.qos == QoS::ExactlyOnce => inbound_key(p.packet_id),
        Packet::Pubrel { packet_id } => inbound_key(*packet_id),
        _ => return,
    };
    store.put(&key, packet.clone());
}

/// In-memory [`Store`], the default when the options name none. Contents do
/// not survive the process, so it upholds QoS guarantees across reconnects
/// but not across restarts.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

struct MemoryStoreInner {
    opened: bool,
    entries: HashMap<String, Packet>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                opened: false,
                entries: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn open(&self) {
        self.inner.lock().expect("store mutex poisoned").opened = true;
    }

    fn put(&self, key: &str, packet: Packet) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if !inner.opened {
            warn!(key, "put on closed store");
            return;
        }
        inner.entries.insert(key.to_string(), packet);
    }

    fn get(&self, key: &str) -> Option<Packet> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        if !inner.opened {
            warn!(key, "get on closed store");
            return None;
        }
        inner.entries.get(key).cloned()
    }

    fn all(&self) -> Vec<String> {
        let inner = self.inner.lock().expect("store mutex poisoned");
        if !inner.opened {
            warn!("all on closed store");
            return Vec::new();
        }
        inner.entries.keys().cloned().collect()
    }

    fn del(&self, key: &str) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if !inner.opened {
            warn!(key, "del on closed store");
            return;
        }
        inner.entries.remove(key);
    }

    fn close(&self) {
        self.inner.lock().expect("store mutex poisoned").opened = false;
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().expect("store mutex poisoned");
        if !inner.opened {
            warn!("reset on closed store");
            return;
        }
        inner.entries.clear();
    }
}
