//! WebSocket transport for browser and WebSocket-only agents.
//!
//! Each WebSocket text message is one complete document; no delimiter is used.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use turnhost_core::{Payload, Transport, TransportError};

/// How long queued messages get to reach the peer on close or hand-off.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

type Writer = JoinHandle<SplitSink<WebSocket, Message>>;

/// An upgraded WebSocket carrying a client.
///
/// Outbound messages go through a queue drained by a writer task, so a peer
/// that stops reading never stalls the client. The upgraded socket is itself
/// the unit of hand-off: axum does not expose the TCP stream under it.
pub struct WsTransport {
    stream: Option<SplitStream<WebSocket>>,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    writer: Option<Writer>,
}

impl WsTransport {
    /// Wrap an already upgraded socket.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let (outbound, queue) = mpsc::unbounded_channel();
        Self {
            stream: Some(stream),
            outbound: Some(outbound),
            writer: Some(tokio::spawn(write_queued(sink, queue))),
        }
    }

    /// Stops accepting messages and gives the writer [`FLUSH_GRACE`] to
    /// drain the queue. Returns the sink if the writer finished in time.
    async fn shut_writer(&mut self) -> Option<SplitSink<WebSocket, Message>> {
        self.outbound.take();
        let mut writer = self.writer.take()?;
        if let Ok(joined) = tokio::time::timeout(FLUSH_GRACE, &mut writer).await {
            return joined.ok();
        }
        tracing::debug!("WebSocket peer is not reading, dropping queued messages");
        writer.abort();
        None
    }
}

impl From<WebSocket> for WsTransport {
    fn from(socket: WebSocket) -> Self {
        Self::new(socket)
    }
}

/// Writer task: sends queued messages in order until the queue closes.
async fn write_queued(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::UnboundedReceiver<Message>,
) -> SplitSink<WebSocket, Message> {
    while let Some(message) = queue.recv().await {
        // Best effort: the peer learns of failures through the read side.
        if let Err(e) = sink.send(message).await {
            tracing::debug!("WebSocket send failed: {e}");
            break;
        }
    }
    sink
}

#[async_trait]
impl Transport for WsTransport {
    type Raw = WebSocket;

    async fn receive(&mut self) -> Option<Result<Payload, TransportError>> {
        loop {
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(Payload::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => return Some(Ok(Payload::Binary(data))),
                Some(Ok(Message::Close(_))) | None => {
                    self.stream.take();
                    return None;
                }
                // Pings are answered by axum.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Err(e)) => {
                    self.stream.take();
                    return Some(Err(TransportError::WebSocket(e.to_string())));
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        // No write completion: the message is only queued.
        if let Some(outbound) = self.outbound.as_ref() {
            let _ = outbound.send(Message::Text(text.into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.shut_writer().await;
        self.stream.take();
    }

    async fn into_raw(mut self) -> Option<(Self::Raw, Bytes)> {
        self.stream.as_ref()?;
        let sink = self.shut_writer().await?;
        let stream = self.stream.take()?;
        match stream.reunite(sink) {
            Ok(socket) => Some((socket, Bytes::new())),
            Err(e) => {
                tracing::warn!("Failed to reassemble WebSocket for hand-off: {e}");
                None
            }
        }
    }

    fn from_raw(raw: Self::Raw, _buffered: Bytes) -> Self {
        Self::new(raw)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// WebSocket handler state.
#[derive(Clone)]
pub struct WsState {
    /// Where upgraded connections are delivered.
    pub accepted: mpsc::UnboundedSender<WsTransport>,
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        tracing::info!("WebSocket client connected");
        if state.accepted.send(WsTransport::new(socket)).is_err() {
            tracing::warn!("WebSocket client dropped: nobody is accepting clients");
        }
    })
}

/// Create WebSocket router.
///
/// # Example
/// ```ignore
/// let (accepted, mut clients) = tokio::sync::mpsc::unbounded_channel();
/// let app = create_ws_router(accepted);
/// ```
#[must_use]
pub fn create_ws_router(accepted: mpsc::UnboundedSender<WsTransport>) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(WsState { accepted })
}
