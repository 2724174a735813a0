//! Wire transports for turnhost clients.
//!
//! Provides:
//! - 0x04 delimiter framing for byte streams
//! - TCP transport and accept loop
//! - WebSocket transport and upgrade router (feature: websocket)

pub mod framing;
pub mod tcp;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use framing::{EOT_CHAR, EotCodec};
pub use tcp::TcpTransport;

#[cfg(feature = "websocket")]
pub use websocket::{WsTransport, create_ws_router};
