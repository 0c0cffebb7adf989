//! Transport ports: the engine's view of its two channels.
//!
//! The engine never touches QR rendering or data-channel plumbing. It sees
//! a required visual port (byte frames in/out, fixed capacity) and an
//! optional binary port (ordered messages with a `buffered_amount`
//! backpressure signal). Both are interchangeable from the engine's
//! perspective; emission fans out to both when the binary port is present.
//!
//! The `memory` module provides channel-backed adapters used by the test
//! suite and by hosts that bridge real scanners/channels through queues.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The visual channel: one displayed/scanned byte frame at a time.
#[async_trait]
pub trait VisualPort: Send {
    /// Emit one frame for display.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Next scanned frame, or `None` once the adapter has closed.
    async fn next_frame(&mut self) -> Option<Vec<u8>>;

    fn close(&mut self);
}

/// The binary channel: ordered reliable messages with backpressure
/// feedback.
#[async_trait]
pub trait BinaryPort: Send {
    async fn send_message(&mut self, message: &[u8]) -> Result<(), TransportError>;

    /// Bytes accepted but not yet flushed by the underlying channel. The
    /// engine suspends binary emission while this exceeds its watermark.
    fn buffered_amount(&self) -> usize;

    /// Next inbound message, or `None` once the adapter has closed.
    async fn next_message(&mut self) -> Option<Vec<u8>>;

    fn close(&mut self);
}

// ── In-memory adapters ───────────────────────────────────────────────────────

pub mod memory {
    use super::*;

    /// One endpoint of an in-memory visual link.
    pub struct MemoryVisual {
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    /// Two cross-wired visual endpoints: frames sent on one side arrive on
    /// the other.
    pub fn visual_pair() -> (MemoryVisual, MemoryVisual) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryVisual { tx: Some(a_tx), rx: b_rx },
            MemoryVisual { tx: Some(b_tx), rx: a_rx },
        )
    }

    #[async_trait]
    impl VisualPort for MemoryVisual {
        async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::VisualClosed)?;
            tx.send(frame.to_vec())
                .map_err(|_| TransportError::VisualClosed)
        }

        async fn next_frame(&mut self) -> Option<Vec<u8>> {
            self.rx.recv().await
        }

        fn close(&mut self) {
            self.tx = None;
        }
    }

    /// One endpoint of an in-memory binary link. `buffered_amount` reads a
    /// shared counter that tests steer to simulate a saturated channel.
    pub struct MemoryBinary {
        tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        buffered: Arc<AtomicUsize>,
    }

    impl MemoryBinary {
        /// Handle for driving the simulated `buffered_amount` from outside.
        pub fn backpressure_handle(&self) -> Arc<AtomicUsize> {
            self.buffered.clone()
        }
    }

    /// Two cross-wired binary endpoints.
    pub fn binary_pair() -> (MemoryBinary, MemoryBinary) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            MemoryBinary {
                tx: Some(a_tx),
                rx: b_rx,
                buffered: Arc::new(AtomicUsize::new(0)),
            },
            MemoryBinary {
                tx: Some(b_tx),
                rx: a_rx,
                buffered: Arc::new(AtomicUsize::new(0)),
            },
        )
    }

    #[async_trait]
    impl BinaryPort for MemoryBinary {
        async fn send_message(&mut self, message: &[u8]) -> Result<(), TransportError> {
            let tx = self.tx.as_ref().ok_or(TransportError::BinaryClosed)?;
            tx.send(message.to_vec())
                .map_err(|_| TransportError::BinaryClosed)
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::Relaxed)
        }

        async fn next_message(&mut self) -> Option<Vec<u8>> {
            self.rx.recv().await
        }

        fn close(&mut self) {
            self.tx = None;
        }
    }
}
