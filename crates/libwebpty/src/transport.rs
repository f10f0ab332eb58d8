use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("message of {size} bytes exceeds buffer of {limit} bytes")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("transport i/o: {0}")]
    Io(String),
}

/// A reliable, in-order, message-preserving bidirectional channel.
///
/// One `recv` returns exactly one protocol message; one `send` delivers
/// exactly one protocol message, atomically from the peer's viewpoint.
/// Implementations serialize concurrent senders internally, so a single
/// `Arc<dyn Transport>` may be shared by both session pumps.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Block until one complete message is available and copy it into
    /// `buf`, returning its length. Fails with `MessageTooLarge` when
    /// `buf` is smaller than the message and with `PeerClosed` on an
    /// orderly close.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Send one message. Fails with `PeerClosed` once the remote has
    /// gone away.
    async fn send(&self, msg: &[u8]) -> Result<(), TransportError>;

    /// Tear down the underlying channel. Idempotent.
    async fn close(&self);

    /// Best-effort peer identification for logging and rate limiting.
    fn remote_addr(&self) -> String;
}
