//! Correlation tracker: in-flight requests and multipart assembly.
//!
//! Every request this endpoint initiates gets an entry keyed by its
//! `messageId`. Inbound messages with a matching `correlationId` accumulate
//! into the entry until a final part removes it and completes the caller's
//! await with the assembled set. `ProtocolException` completes with the
//! remote error; close completes everything with `SessionClosed`; a
//! deadline expiry completes with `Timeout` and sends nothing on the wire.
//!
//! The tracker has its own mutex, disjoint from the session send lock:
//! registration happens inside the send critical section (so a fast reply
//! cannot race the entry), but delivery never contends with senders.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{ErrorCode, EtpError, Result};
use crate::messages::Body;
use crate::protocol::MessageHeader;

/// Ordered reply parts of one completed request.
pub type ResponseSet = Vec<Body>;

struct PendingRequest {
    protocol: u16,
    parts: Vec<Body>,
    completion: oneshot::Sender<Result<ResponseSet>>,
}

/// Tracks requests awaiting replies. Thread-safe; entries are reclaimed in
/// O(1) when their final part (or error) arrives.
#[derive(Default)]
pub struct CorrelationTracker {
    pending: Mutex<HashMap<i64, PendingRequest>>,
    receivers: Mutex<HashMap<i64, oneshot::Receiver<Result<ResponseSet>>>>,
}

impl CorrelationTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request. Called under the session send lock,
    /// before the request's bytes hit the wire.
    pub fn register(&self, message_id: i64, protocol: u16) {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("tracker poisoned").insert(
            message_id,
            PendingRequest {
                protocol,
                parts: Vec::new(),
                completion: tx,
            },
        );
        self.receivers
            .lock()
            .expect("tracker poisoned")
            .insert(message_id, rx);
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("tracker poisoned").len()
    }

    /// Whether `message_id` still has a pending entry.
    pub fn is_pending(&self, message_id: i64) -> bool {
        self.pending
            .lock()
            .expect("tracker poisoned")
            .contains_key(&message_id)
    }

    /// Feed one inbound correlated message. Returns false when no entry
    /// matches (an orphan: the caller logs it at debug and drops it).
    pub fn accept(&self, header: &MessageHeader, body: &Body) -> bool {
        let mut pending = self.pending.lock().expect("tracker poisoned");

        if let Body::ProtocolException(exception) = body {
            let Some(entry) = pending.remove(&header.correlation_id) else {
                return false;
            };
            let _ = entry.completion.send(Err(EtpError::Remote {
                code: ErrorCode::from_i32(exception.error_code),
                message: exception.error_message.clone(),
            }));
            return true;
        }

        let Some(entry) = pending.get_mut(&header.correlation_id) else {
            return false;
        };
        debug_assert_eq!(entry.protocol, header.protocol);

        if !header.is_no_data() {
            entry.parts.push(body.clone());
        }
        // A final part, or any single (non-multipart) reply, completes the
        // exchange.
        if header.is_final_part() || !header.is_multi_part() {
            let entry = pending.remove(&header.correlation_id).expect("entry exists");
            let _ = entry.completion.send(Ok(entry.parts));
        }
        true
    }

    /// Complete one entry with `Timeout` if it is still pending. Wire-silent:
    /// a reply arriving later is treated as an orphan.
    pub fn expire(&self, message_id: i64) {
        let entry = self
            .pending
            .lock()
            .expect("tracker poisoned")
            .remove(&message_id);
        if let Some(entry) = entry {
            debug!(message_id, protocol = entry.protocol, "request deadline elapsed");
            let _ = entry.completion.send(Err(EtpError::Timeout));
        }
    }

    /// Complete one entry with a local failure (e.g. the request never made
    /// it onto the wire).
    pub fn fail(&self, message_id: i64, error: EtpError) {
        let entry = self
            .pending
            .lock()
            .expect("tracker poisoned")
            .remove(&message_id);
        if let Some(entry) = entry {
            let _ = entry.completion.send(Err(error));
        }
    }

    /// Complete every outstanding entry with `SessionClosed`. Terminal
    /// states discard all pending correlations.
    pub fn complete_all_closed(&self) {
        let entries: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("tracker poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.completion.send(Err(EtpError::SessionClosed));
        }
    }

    /// Take the completion receiver for `message_id`. Each request has a
    /// single awaiter.
    pub fn take_receiver(
        &self,
        message_id: i64,
    ) -> Option<oneshot::Receiver<Result<ResponseSet>>> {
        self.receivers
            .lock()
            .expect("tracker poisoned")
            .remove(&message_id)
    }
}
