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

//! Packet identifier allocation.
//!
//! An identifier is live exactly while the registry maps it to a token.
//! Allocation scans from a rotating cursor so recently released identifiers
//! are not immediately reused, which keeps late acknowledgements from
//! completing an unrelated flow.

use crate::mqtt_cl::client_error::ClientError;
use crate::mqtt_cl::token::Token;
use std::collections::HashMap;
use std::sync::Mutex;

const MIN_ID: u16 = 1;
const MAX_ID: u16 = u16::MAX;

/// Maps live packet identifiers to the token completed by the matching
/// acknowledgement.
pub(crate) struct MessageIdRegistry {
    inner: Mutex<MessageIdTable>,
}

struct MessageIdTable {
    index: HashMap<u16, Token>,
    /// Next identifier the scan starts from.
    cursor: u16,
}

impl MessageIdRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MessageIdTable {
                index: HashMap::new(),
                cursor: MIN_ID,
            }),
        }
    }

    /// Claims a free identifier for `token`, returning 0 when the whole
    /// 16-bit space is in use.
    pub fn claim(&self, token: &Token) -> u16 {
        let mut table = self.inner.lock().expect("message id mutex poisoned");
        let start = table.cursor;
        let mut candidate = start;
        loop {
            if !table.index.contains_key(&candidate) {
                table.index.insert(candidate, token.clone());
                table.cursor = if candidate == MAX_ID {
                    MIN_ID
                } else {
                    candidate + 1
                };
                return candidate;
            }
            candidate = if candidate == MAX_ID {
                MIN_ID
            } else {
                candidate + 1
            };
            if candidate == start {
                return 0;
            }
        }
    }

    /// Claims a specific identifier, as required when honoring identifiers
    /// persisted by an earlier session. Returns `false` if the identifier is
    /// already live.
    pub fn claim_specific(&self, token: &Token, id: u16) -> bool {
        if id == 0 {
            return false;
        }
        let mut table = self.inner.lock().expect("message id mutex poisoned");
        if table.index.contains_key(&id) {
            return false;
        }
        table.index.insert(id, token.clone());
        true
    }

    /// Releases `id`; releasing an unknown identifier is tolerated because
    /// acknowledgements can race shutdown.
    pub fn release(&self, id: u16) {
        self.inner
            .lock()
            .expect("message id mutex poisoned")
            .index
            .remove(&id);
    }

    /// Atomically looks up and releases `id`.
    pub fn get_and_release(&self, id: u16) -> Option<Token> {
        self.inner
            .lock()
            .expect("message id mutex poisoned")
            .index
            .remove(&id)
    }

    /// Fails every outstanding token and empties the table. Only used on
    /// clean session teardown.
    pub fn cleanup(&self) {
        let drained: Vec<Token> = {
            let mut table = self.inner.lock().expect("message id mutex poisoned");
            table.index.drain().map(|(_, token)| token).collect()
        };
        for token in drained {
            token.fail(ClientError::Disconnecting);
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.inner
            .lock()
            .expect("message id mutex poisoned")
            .index
            .len()
    }
}
