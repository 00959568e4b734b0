//! Transport module - the frame-level seam between the session and the
//! wire.
//!
//! The session core is transport-agnostic: it writes [`WireFrame`]s through
//! a [`TransportSink`] (single writer, guarded by the session send lock) and
//! reads them from a [`TransportStream`] (single reader, owned by the
//! receive task). The WebSocket implementation lives in [`ws`]; [`mem`]
//! provides an in-memory pair for tests.

pub mod mem;
pub mod ws;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// One transport frame: binary frames carry Avro-binary, text frames carry
/// the JSON framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// WebSocket binary frame.
    Binary(Vec<u8>),
    /// WebSocket text frame.
    Text(String),
}

impl WireFrame {
    /// Frame payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Binary(bytes) => bytes.len(),
            WireFrame::Text(text) => text.len(),
        }
    }

    /// True when the frame carries no payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write half of a transport. Single-writer: the session send lock is the
/// only path to this sink.
#[async_trait]
pub trait TransportSink: Send {
    /// Write one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<()>;

    /// Close the transport, best effort.
    async fn close(&mut self) -> Result<()>;
}

/// Read half of a transport. Single-reader: owned by the session receive
/// task.
#[async_trait]
pub trait TransportStream: Send {
    /// Read the next frame; `None` when the peer closed cleanly.
    async fn recv(&mut self) -> Result<Option<WireFrame>>;
}

/// HTTP upgrade headers captured at session construction. Lookup is
/// case-insensitive, matching HTTP header semantics.
#[derive(Debug, Clone, Default)]
pub struct HandshakeHeaders {
    entries: HashMap<String, String>,
}

impl HandshakeHeaders {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
