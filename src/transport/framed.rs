//! Length-prefixed framing over TCP for relay links
//!
//! Each frame is a u32 big-endian length followed by the payload bytes.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Duplex, RelayDialer, StreamEvent};
use crate::error::SwarmError;

/// Upper bound on a single frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A TCP stream carrying u32-length-prefixed frames as an opaque duplex.
pub struct FramedTcp {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    events: Mutex<mpsc::UnboundedReceiver<StreamEvent>>,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
    closed: AtomicBool,
}

impl FramedTcp {
    /// Connect to `addr` (host:port) and wrap the stream.
    pub async fn connect(addr: &str) -> Result<Arc<Self>, SwarmError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| SwarmError::Transport(format!("connect {addr}: {e}")))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Arc<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let read_events = event_tx.clone();
        let read_task = tokio::spawn(async move {
            loop {
                let len = match read_half.read_u32().await {
                    Ok(len) => len as usize,
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        let _ = read_events.send(StreamEvent::Closed);
                        break;
                    }
                    Err(e) => {
                        let _ = read_events.send(StreamEvent::Errored(e.to_string()));
                        break;
                    }
                };
                if len == 0 || len > MAX_FRAME_BYTES {
                    let _ = read_events
                        .send(StreamEvent::Errored(format!("invalid frame length {len}")));
                    break;
                }
                let mut buf = vec![0u8; len];
                match read_half.read_exact(&mut buf).await {
                    Ok(_) => {
                        let _ = read_events.send(StreamEvent::Data(buf));
                    }
                    Err(e) => {
                        let _ = read_events.send(StreamEvent::Errored(e.to_string()));
                        break;
                    }
                }
            }
        });

        let write_events = event_tx.clone();
        let write_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let result = async {
                    write_half.write_u32(frame.len() as u32).await?;
                    write_half.write_all(&frame).await?;
                    write_half.flush().await
                }
                .await;
                if let Err(e) = result {
                    let _ = write_events.send(StreamEvent::Errored(e.to_string()));
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Arc::new(Self {
            outbound,
            events: Mutex::new(event_rx),
            event_tx,
            read_task,
            write_task,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Duplex for FramedTcp {
    async fn write(&self, bytes: &[u8]) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SwarmError::Transport("stream is closed".to_string()));
        }
        self.outbound
            .send(bytes.to_vec())
            .map_err(|_| SwarmError::Transport("write half is gone".to_string()))
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
        self.read_task.abort();
        self.write_task.abort();
        let _ = self.event_tx.send(StreamEvent::Closed);
        debug!("framed tcp stream destroyed");
    }
}

/// Dials relay links over raw TCP (`tcp://host:port` or plain `host:port`).
pub struct TcpRelayDialer;

#[async_trait]
impl RelayDialer for TcpRelayDialer {
    async fn dial(&self, url: &str) -> Result<Arc<dyn Duplex>, SwarmError> {
        if url.contains("://") && !url.starts_with("tcp://") {
            return Err(SwarmError::Transport(format!(
                "unsupported relay scheme in {url}"
            )));
        }
        let addr = url.strip_prefix("tcp://").unwrap_or(url);
        let stream = FramedTcp::connect(addr).await?;
        Ok(stream)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frames_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let server = FramedTcp::from_stream(stream);
            // Echo every frame back.
            loop {
                match server.next_event().await {
                    StreamEvent::Data(bytes) => server.write(&bytes).await.unwrap(),
                    _ => break,
                }
            }
        });

        let client = FramedTcp::connect(&addr.to_string()).await.unwrap();
        client.write(b"hello relay").await.unwrap();
        assert_eq!(
            client.next_event().await,
            StreamEvent::Data(b"hello relay".to_vec())
        );
    }

    #[tokio::test]
    async fn test_remote_close_surfaces_closed_event() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = FramedTcp::connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.next_event().await, StreamEvent::Closed);
    }

    #[tokio::test]
    async fn test_destroy_stops_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        });

        let client = FramedTcp::connect(&addr.to_string()).await.unwrap();
        client.destroy().await;
        assert_eq!(client.next_event().await, StreamEvent::Closed);
        assert!(client.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_dialer_rejects_unknown_scheme() {
        let result = TcpRelayDialer.dial("wss://relay.example.org").await;
        assert!(matches!(result, Err(SwarmError::Transport(_))));
    }
}
