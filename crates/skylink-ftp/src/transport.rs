//! Transport boundary
//!
//! The engine never opens sockets. It sends encoded frames through a
//! [`Transport`] and is handed inbound frames through an [`InboundSink`].
//! Delivery is best effort: frames may be lost, duplicated or reordered.
//!
//! ```text
//!   FtpClient ──Transport::send──▶ link ──▶ pump ──InboundSink──▶ FtpServer
//!   FtpClient ◀──InboundSink── pump ◀── link ◀──Transport::send── FtpServer
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use skylink_core::MAX_FRAME_LEN;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link closed")]
    Closed,

    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("no peer known yet")]
    NoPeer,

    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of a link
pub trait Transport: Send + Sync + 'static {
    /// Queue one frame for the peer without blocking
    fn send(&self, frame: &[u8]) -> Result<(), TransportError>;
}

/// Receiver of raw inbound frames
pub trait InboundSink: Send + Sync + 'static {
    fn handle_inbound(&self, frame: &[u8]);
}

/// In-memory link endpoint backed by an unbounded channel
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Transport for ChannelTransport {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_LEN {
            return Err(TransportError::TooLarge {
                size: frame.len(),
                max: MAX_FRAME_LEN,
            });
        }
        self.tx
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }
}

/// Receiving end of a [`ChannelTransport`]
pub struct ChannelReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Forward every received frame to `sink` until the link closes
    pub fn pump(mut self, sink: Arc<dyn InboundSink>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = self.rx.recv().await {
                sink.handle_inbound(&frame);
            }
            trace!("channel link closed");
        })
    }
}

/// One direction of an in-memory link
pub fn channel() -> (ChannelTransport, ChannelReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTransport { tx }, ChannelReceiver { rx })
}

/// Which frames a [`LossyTransport`] drops
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LossPattern {
    /// Deliver everything
    None,
    /// Drop frames number n, 2n, 3n, ... (1-based)
    EveryNth(u64),
    /// Drop the first n frames, then deliver
    FirstN(u64),
    /// Drop everything
    All,
}

/// Wrapper that drops frames according to a [`LossPattern`]
pub struct LossyTransport<T> {
    inner: T,
    pattern: LossPattern,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, pattern: LossPattern) -> Self {
        Self {
            inner,
            pattern,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Frames offered to the wrapper (delivered + dropped)
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let drop = match self.pattern {
            LossPattern::None => false,
            LossPattern::EveryNth(k) => k > 0 && n % k == 0,
            LossPattern::FirstN(k) => n <= k,
            LossPattern::All => true,
        };
        if drop {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(n, "dropping frame");
            return Ok(());
        }
        self.inner.send(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers() {
        let (tx, mut rx) = channel();
        tx.send(&[1, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_channel_rejects_oversized() {
        let (tx, _rx) = channel();
        let err = tx.send(&vec![0u8; MAX_FRAME_LEN + 1]).unwrap_err();
        assert!(matches!(err, TransportError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_channel_closed() {
        let (tx, rx) = channel();
        drop(rx);
        assert_eq!(tx.send(&[0]), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_lossy_every_nth() {
        let (tx, mut rx) = channel();
        let lossy = LossyTransport::new(tx, LossPattern::EveryNth(3));
        for i in 0..6u8 {
            lossy.send(&[i]).unwrap();
        }
        assert_eq!(lossy.sent(), 6);
        assert_eq!(lossy.dropped(), 2);

        let mut got = Vec::new();
        for _ in 0..4 {
            got.push(rx.recv().await.unwrap()[0]);
        }
        assert_eq!(got, vec![0, 1, 3, 4]);
    }

    #[tokio::test]
    async fn test_lossy_first_n() {
        let (tx, mut rx) = channel();
        let lossy = LossyTransport::new(tx, LossPattern::FirstN(2));
        for i in 0..3u8 {
            lossy.send(&[i]).unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), vec![2]);
    }
}
