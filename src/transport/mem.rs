//! In-memory transport for tests: two channel-connected endpoints.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{EtpError, Result};

use super::{TransportSink, TransportStream, WireFrame};

/// Channel capacity for each direction.
const CHANNEL_CAPACITY: usize = 64;

/// Sink half of an in-memory endpoint.
pub struct MemorySink {
    tx: Option<mpsc::Sender<WireFrame>>,
}

/// Stream half of an in-memory endpoint.
pub struct MemoryStream {
    rx: mpsc::Receiver<WireFrame>,
}

/// Create two connected endpoints; frames sent on one side arrive on the
/// other in order.
pub fn pair() -> ((MemorySink, MemoryStream), (MemorySink, MemoryStream)) {
    let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        (MemorySink { tx: Some(a_tx) }, MemoryStream { rx: a_rx }),
        (MemorySink { tx: Some(b_tx) }, MemoryStream { rx: b_rx }),
    )
}

#[async_trait]
impl TransportSink for MemorySink {
    async fn send(&mut self, frame: WireFrame) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(EtpError::ConnectionClosed)?;
        tx.send(frame)
            .await
            .map_err(|_| EtpError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the sender makes the peer's recv return None.
        self.tx.take();
        Ok(())
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<WireFrame>> {
        Ok(self.rx.recv().await)
    }
}
