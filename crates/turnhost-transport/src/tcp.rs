//! TCP transport: a byte stream wrapped in [`EotCodec`] framing.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use turnhost_core::{Payload, Transport, TransportError};

use crate::framing::EotCodec;

/// A framed byte stream. Generic over the stream so tests and hand-off
/// targets can use anything that reads and writes bytes.
pub struct TcpTransport<S = TcpStream> {
    framed: Option<Framed<S, EotCodec>>,
}

impl<S> TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Frame `stream`.
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            framed: Some(Framed::new(stream, EotCodec::new())),
        }
    }
}

#[async_trait]
impl<S> Transport for TcpTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Raw = S;

    async fn receive(&mut self) -> Option<Result<Payload, TransportError>> {
        let framed = self.framed.as_mut()?;
        framed
            .next()
            .await
            .map(|frame| frame.map(Payload::Text).map_err(TransportError::from))
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let Some(framed) = self.framed.as_mut() else {
            return Ok(());
        };
        framed.send(text).await?;
        Ok(())
    }

    async fn close(&mut self) {
        // Dropping the stream discards anything still queued for writing.
        self.framed.take();
    }

    async fn into_raw(self) -> Option<(Self::Raw, Bytes)> {
        let parts = self.framed?.into_parts();
        Some((parts.io, parts.read_buf.freeze()))
    }

    fn from_raw(raw: Self::Raw, buffered: Bytes) -> Self {
        let mut parts = FramedParts::new::<String>(raw, EotCodec::new());
        parts.read_buf = BytesMut::from(&buffered[..]);
        Self {
            framed: Some(Framed::from_parts(parts)),
        }
    }
}

/// Pause after a failed accept, so a full file table is not spun on.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept TCP connections, forwarding each as a transport.
///
/// Failed accepts are logged and retried. Returns once nobody receives
/// transports any more.
pub async fn serve(listener: TcpListener, accepted: mpsc::UnboundedSender<TcpTransport>) {
    let listener = &listener;
    accept_loop(move || listener.accept(), accepted).await;
}

async fn accept_loop<S, F, Fut>(mut accept: F, accepted: mpsc::UnboundedSender<TcpTransport<S>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                tracing::info!("TCP client connected from {peer}");
                if accepted.send(TcpTransport::new(stream)).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to accept TCP client: {e}");
                if accepted.is_closed() {
                    return;
                }
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
