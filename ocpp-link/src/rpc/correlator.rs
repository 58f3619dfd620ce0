//! Outbound call correlation
//!
//! Every CALL a session sends is registered here under a fresh unique id.
//! The entry lives until exactly one of three things happens: a CALLRESULT
//! resolves it, a CALLERROR rejects it, or its deadline passes. All three
//! paths remove the entry under one mutex, so whichever arrives first wins and
//! the others find nothing to do.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ocpp::ErrorCode;

/// Why an outbound call produced no result payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error("call rejected: {code} - {description}")]
    Rejected {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("timed out waiting for response")]
    Timeout,

    #[error("connection closed")]
    Disconnected,
}

type Outcome = Result<Value, CallFailure>;

struct Entry {
    action: String,
    created_at: Instant,
    result_tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct Pending {
    calls: HashMap<String, Entry>,
    closed: bool,
}

/// Pending-call table for one session
#[derive(Clone, Default)]
pub struct Correlator {
    inner: Arc<Mutex<Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new outbound call.
    ///
    /// Fails with `Disconnected` once the correlator has been closed.
    pub fn issue(&self, action: &str, timeout: Duration) -> Result<PendingCall, CallFailure> {
        let (result_tx, result_rx) = oneshot::channel();
        let created_at = Instant::now();

        let mut pending = self.inner.lock();
        if pending.closed {
            return Err(CallFailure::Disconnected);
        }

        let mut unique_id = Uuid::new_v4().to_string();
        while pending.calls.contains_key(&unique_id) {
            unique_id = Uuid::new_v4().to_string();
        }

        pending.calls.insert(
            unique_id.clone(),
            Entry {
                action: action.to_string(),
                created_at,
                result_tx,
            },
        );
        drop(pending);

        debug!("Issued {} ({})", action, unique_id);

        Ok(PendingCall {
            unique_id,
            action: action.to_string(),
            deadline: created_at + timeout,
            result_rx: Some(result_rx),
            correlator: self.clone(),
        })
    }

    /// Complete a call with its CALLRESULT payload.
    ///
    /// Returns `false` when no such call is pending.
    pub fn resolve(&self, unique_id: &str, payload: Value) -> bool {
        self.complete(unique_id, Ok(payload))
    }

    /// Complete a call with its CALLERROR.
    ///
    /// Returns `false` when no such call is pending.
    pub fn reject(
        &self,
        unique_id: &str,
        code: ErrorCode,
        description: String,
        details: Value,
    ) -> bool {
        self.complete(
            unique_id,
            Err(CallFailure::Rejected {
                code,
                description,
                details,
            }),
        )
    }

    /// Action name of a pending call
    pub fn action_of(&self, unique_id: &str) -> Option<String> {
        self.inner
            .lock()
            .calls
            .get(unique_id)
            .map(|entry| entry.action.clone())
    }

    fn complete(&self, unique_id: &str, outcome: Outcome) -> bool {
        let entry = self.inner.lock().calls.remove(unique_id);

        match entry {
            Some(entry) => {
                debug!(
                    "{} ({}) completed after {:?}",
                    entry.action,
                    unique_id,
                    entry.created_at.elapsed()
                );
                // The waiter may already be gone; nothing to deliver to then
                let _ = entry.result_tx.send(outcome);
                true
            }
            None => {
                warn!("Response for unknown or finished call {}", unique_id);
                false
            }
        }
    }

    /// Deadline path: remove the entry if it is still there
    fn expire(&self, unique_id: &str) -> bool {
        self.inner.lock().calls.remove(unique_id).is_some()
    }

    /// Fail every pending call and refuse new ones
    pub fn close(&self, reason: CallFailure) {
        let drained: Vec<(String, Entry)> = {
            let mut pending = self.inner.lock();
            pending.closed = true;
            pending.calls.drain().collect()
        };

        if !drained.is_empty() {
            debug!("Failing {} pending calls: {}", drained.len(), reason);
        }

        for (_, entry) in drained {
            let _ = entry.result_tx.send(Err(reason.clone()));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().calls.len()
    }
}

/// Waiter for one issued call
pub struct PendingCall {
    unique_id: String,
    action: String,
    deadline: Instant,
    result_rx: Option<oneshot::Receiver<Outcome>>,
    correlator: Correlator,
}

impl PendingCall {
    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Suspend until the call is resolved, rejected or times out
    pub async fn wait(mut self) -> Result<Value, CallFailure> {
        let Some(result_rx) = self.result_rx.as_mut() else {
            return Err(CallFailure::Disconnected);
        };

        let outcome = match tokio::time::timeout_at(self.deadline, &mut *result_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallFailure::Disconnected),
            Err(_) if self.correlator.expire(&self.unique_id) => {
                warn!("{} ({}) timed out", self.action, self.unique_id);
                Err(CallFailure::Timeout)
            }
            // A response took the entry first; its outcome is in the channel
            Err(_) => result_rx.try_recv().unwrap_or(Err(CallFailure::Disconnected)),
        };

        self.result_rx = None;
        outcome
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        // Abandoned before completion, including a cancelled `wait()`
        if self.result_rx.is_some() {
            self.correlator.expire(&self.unique_id);
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("unique_id", &self.unique_id)
            .field("action", &self.action)
            .finish()
    }
}
