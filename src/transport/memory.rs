//! In-memory duplex pair, used by tests and the in-process relay server

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};

use super::{Duplex, StreamEvent};
use crate::error::SwarmError;

/// One end of an in-memory duplex stream.
pub struct MemoryDuplex {
    peer_tx: mpsc::UnboundedSender<StreamEvent>,
    local_tx: mpsc::UnboundedSender<StreamEvent>,
    events: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    closed: AtomicBool,
}

/// Create a connected pair of in-memory duplex streams.
pub fn memory_pair() -> (std::sync::Arc<MemoryDuplex>, std::sync::Arc<MemoryDuplex>) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemoryDuplex {
        peer_tx: b_tx.clone(),
        local_tx: a_tx.clone(),
        events: Mutex::new(a_rx),
        closed: AtomicBool::new(false),
    };
    let b = MemoryDuplex {
        peer_tx: a_tx,
        local_tx: b_tx,
        events: Mutex::new(b_rx),
        closed: AtomicBool::new(false),
    };
    (std::sync::Arc::new(a), std::sync::Arc::new(b))
}

#[async_trait]
impl Duplex for MemoryDuplex {
    async fn write(&self, bytes: &[u8]) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::Transport("stream is closed".to_string()));
        }
        self.peer_tx
            .send(StreamEvent::Data(bytes.to_vec()))
            .map_err(|_| SwarmError::Transport("remote end is gone".to_string()))
    }

    async fn next_event(&self) -> StreamEvent {
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(event) => event,
            None => StreamEvent::Closed,
        }
    }

    async fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.peer_tx.send(StreamEvent::Closed);
        let _ = self.local_tx.send(StreamEvent::Closed);
    }
}

// ============================================================================
// TESTS
// ============================================================================
