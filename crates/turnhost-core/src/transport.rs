//! The capability a wire transport must provide to carry a client.

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::Payload;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// A connection that yields whole JSON documents and accepts whole documents.
///
/// Framing lives below this trait: by the time [`Transport::receive`]
/// returns, a document is complete.
#[async_trait]
pub trait Transport: Send + 'static {
    /// What the transport surrenders on hand-off.
    type Raw: Send + 'static;

    /// Next complete inbound document, `None` once the peer has closed.
    ///
    /// Must be cancel-safe: the client races it against owner commands and
    /// drops the future when a command wins.
    async fn receive(&mut self) -> Option<Result<Payload, TransportError>>;

    /// Write one document. Resolves when the transport considers it written.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Tear the connection down without flushing.
    async fn close(&mut self);

    /// Surrender the raw connection plus any bytes read but not yet yielded.
    /// Writes still queued are flushed first. `None` if the transport was
    /// already closed or could not be reassembled.
    async fn into_raw(self) -> Option<(Self::Raw, Bytes)>;

    /// Rebuild a transport from a surrendered connection, replaying
    /// `buffered` before reading anything new.
    fn from_raw(raw: Self::Raw, buffered: Bytes) -> Self
    where
        Self: Sized;
}
