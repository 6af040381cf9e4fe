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

//! One-shot completion tokens for asynchronous client operations.
//!
//! Every user-facing operation returns a [`Token`] immediately; the comms
//! pump (or the failing precondition check) completes it exactly once. A
//! completed token never reverts, and late completion attempts are ignored so
//! acknowledgements racing a shutdown are harmless.

use crate::mqtt_cl::client_error::ClientError;
use crate::mqtt_cl::packet::ConnectReturnCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Shared one-shot completion handle.
///
/// Clones observe the same completion. Operation-specific results (CONNACK
/// code and session-present flag, SUBACK granted QoS list, the claimed packet
/// identifier) are readable once set, independently of completion.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    notify: Notify,
}

#[derive(Default)]
struct TokenState {
    done: bool,
    error: Option<Arc<ClientError>>,
    connack: Option<(ConnectReturnCode, bool)>,
    granted: Option<Vec<u8>>,
    message_id: u16,
}

impl Token {
    /// Creates a pending token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates a token that is already successfully completed. Used for
    /// operations that finish synchronously, such as a QoS 0 publish while
    /// reconnecting.
    pub fn completed() -> Self {
        let token = Self::new();
        token.complete();
        token
    }

    /// Marks the token successfully completed. The first completion wins;
    /// later calls (success or error) are no-ops.
    pub fn complete(&self) {
        let mut state = self.inner.state.lock().expect("token mutex poisoned");
        if state.done {
            return;
        }
        state.done = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Completes the token with an error.
    pub fn fail(&self, error: ClientError) {
        self.fail_shared(Arc::new(error));
    }

    /// Completes the token with an already shared error.
    pub fn fail_shared(&self, error: Arc<ClientError>) {
        let mut state = self.inner.state.lock().expect("token mutex poisoned");
        if state.done {
            return;
        }
        state.done = true;
        state.error = Some(error);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Whether the token has completed (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().expect("token mutex poisoned").done
    }

    /// The error this token completed with, if any.
    pub fn error(&self) -> Option<Arc<ClientError>> {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .error
            .clone()
    }

    /// Waits for completion.
    pub async fn wait(&self) -> Result<(), Arc<ClientError>> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let state = self.inner.state.lock().expect("token mutex poisoned");
                if state.done {
                    return match &state.error {
                        Some(e) => Err(e.clone()),
                        None => Ok(()),
                    };
                }
            }
            notified.await;
        }
    }

    /// Waits for completion, giving up after `timeout`. Returns `None` while
    /// the operation is still pending.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), Arc<ClientError>>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// The packet identifier claimed for this operation (0 for identifier-less
    /// flows).
    pub fn message_id(&self) -> u16 {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .message_id
    }

    pub(crate) fn set_message_id(&self, id: u16) {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .message_id = id;
    }

    /// CONNACK return code and session-present flag, once observed.
    pub fn connack(&self) -> Option<(ConnectReturnCode, bool)> {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .connack
    }

    pub(crate) fn set_connack(&self, return_code: ConnectReturnCode, session_present: bool) {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .connack = Some((return_code, session_present));
    }

    /// Granted QoS codes from the SUBACK, one per requested topic (0x80 marks
    /// a failed subscription).
    pub fn granted_qos(&self) -> Option<Vec<u8>> {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .granted
            .clone()
    }

    pub(crate) fn set_granted_qos(&self, codes: Vec<u8>) {
        self.inner
            .state
            .lock()
            .expect("token mutex poisoned")
            .granted = Some(codes);
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("token mutex poisoned");
        f.debug_struct("Token")
            .field("done", &state.done)
            .field("error", &state.error)
            .field("message_id", &state.message_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_completion_wins() {
        let token = Token::new();
        token.complete();
        token.fail(ClientError::NotConnected);
        assert!(token.is_complete());
        assert!(token.error().is_none());
        assert!(token.wait().await.is_ok());
    }

    #[tokio::test]
    async fn waiters_wake_on_failure() {
        let token = Token::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        token.fail(ClientError::PingTimeout);
        let result = handle.await.unwrap();
        assert!(matches!(*result.unwrap_err(), ClientError::PingTimeout));
    }

    #[tokio::test]
    async fn wait_timeout_reports_pending() {
        let token = Token::new();
        assert!(token
            .wait_timeout(Duration::from_millis(10))
            .await
            .is_none());
        token.complete();
        assert!(token
            .wait_timeout(Duration::from_millis(10))
            .await
            .unwrap()
            .is_ok());
    }
}
