//! Minimal lobby accepting agents over TCP and WebSocket.
//!
//! Run with: cargo run -p lobby-server-demo
//!
//! Agents can then connect on the TCP port (0x04 delimited JSON) or the
//! WebSocket port. `alias` is answered with `named` and `play` with `lobbied`;
//! no match is ever started.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnhost_core::{
    Client, ClientEvents, ClientInfo, Config, Lifecycle, Outbound, SentEvent, TimeBudget,
    Transport,
};
use turnhost_transport::{create_ws_router, tcp};

const SHUTDOWN_MESSAGE: &str = "Sorry, the server is shutting down.";

/// Payload of the `lobbied` event.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Lobbied<'a> {
    game_name: &'a str,
    game_version: &'a str,
    game_session: String,
}

/// State shared by every connected agent.
struct Lobby {
    config: Config,
    next_session: AtomicU64,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env();
    let lobby = Arc::new(Lobby {
        config,
        next_session: AtomicU64::new(1),
    });

    let tcp_addr = SocketAddr::from(([0, 0, 0, 0], config.tcp_port));
    let ws_addr = SocketAddr::from(([0, 0, 0, 0], config.ws_port));
    let (tcp_listener, ws_listener) =
        match tokio::try_join!(TcpListener::bind(tcp_addr), TcpListener::bind(ws_addr)) {
            Ok(listeners) => listeners,
            Err(e) => {
                tracing::error!("Failed to bind listeners: {e}");
                return;
            }
        };
    tracing::info!("TCP agents on {tcp_addr}, WebSocket agents on ws://{ws_addr}");

    let (tcp_accepted, mut tcp_clients) = mpsc::unbounded_channel();
    tokio::spawn(tcp::serve(tcp_listener, tcp_accepted));

    let (ws_accepted, mut ws_clients) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(e) = axum::serve(ws_listener, create_ws_router(ws_accepted)).await {
            tracing::error!("WebSocket listener stopped: {e}");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sessions = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            Some(transport) = tcp_clients.recv() => {
                let (client, events) = Client::new(transport, config);
                sessions.spawn(serve_client(client, events, Arc::clone(&lobby), shutdown_rx.clone()));
            }
            Some(transport) = ws_clients.recv() => {
                let (client, events) = Client::new(transport, config);
                sessions.spawn(serve_client(client, events, Arc::clone(&lobby), shutdown_rx.clone()));
            }
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = &mut ctrl_c => break,
        }
    }

    tracing::info!("Shutting down, disconnecting {} clients", sessions.len());
    let _ = shutdown_tx.send(true);
    while sessions.join_next().await.is_some() {}
}

/// Drive one agent until it disconnects or the server shuts down.
async fn serve_client<T: Transport>(
    client: Client<T>,
    mut events: ClientEvents,
    lobby: Arc<Lobby>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            sent = events.sent.recv() => match sent {
                Ok(SentEvent::Alias(alias)) => on_alias(&client, &alias).await,
                Ok(SentEvent::Play(data)) => on_play(&client, &lobby, &data).await,
                Ok(other) => {
                    tracing::debug!(client = %client.name(), "Ignoring '{}' outside a game", other.name());
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(client = %client.name(), "Dropped {skipped} events");
                }
                Err(RecvError::Closed) => return,
            },
            signal = events.lifecycle.recv() => match signal {
                Ok(Lifecycle::TimedOut) => tracing::info!(client = %client.name(), "timed out"),
                Ok(Lifecycle::Disconnected) | Err(RecvError::Closed) => {
                    tracing::info!(client = %client.name(), "left the lobby");
                    return;
                }
                Err(RecvError::Lagged(_)) => {}
            },
            _ = shutdown.changed() => {
                client.disconnect(Some(SHUTDOWN_MESSAGE)).await;
                return;
            }
        }
    }
}

async fn on_alias<T: Transport>(client: &Client<T>, alias: &serde_json::Value) {
    let Some(game_name) = alias.as_str().filter(|name| !name.is_empty()) else {
        client
            .disconnect(Some(&format!("{alias} is not a known game alias for any game.")))
            .await;
        return;
    };
    if let Err(e) = client.send(&Outbound::new("named", game_name)).await {
        tracing::debug!(client = %client.name(), "Failed to send named: {e}");
    }
}

async fn on_play<T: Transport>(client: &Client<T>, lobby: &Lobby, data: &serde_json::Value) {
    let Some(game_name) = data.get("gameName").and_then(serde_json::Value::as_str) else {
        client.disconnect(Some("Sent play without a gameName")).await;
        return;
    };
    let info = match serde_json::from_value::<ClientInfo>(data.clone()) {
        Ok(info) => info,
        Err(e) => {
            client.disconnect(Some(&format!("Sent malformed play data: {e}"))).await;
            return;
        }
    };

    let spectating = info.spectating;
    if let Err(e) = client.set_info(info) {
        client.disconnect(Some(&e.to_string())).await;
        return;
    }
    if !spectating {
        let budget = TimeBudget::from_duration(lobby.config.starting_time);
        if let Err(e) = client.set_player(Arc::new(budget)) {
            tracing::warn!(client = %client.name(), "{e}");
        }
    }

    let lobbied = Lobbied {
        game_name,
        game_version: "",
        game_session: lobby.next_session.fetch_add(1, Ordering::Relaxed).to_string(),
    };
    tracing::info!(
        client = %client.name(),
        language = %client.programming_language(),
        session = %lobbied.game_session,
        "client lobbied for {game_name}"
    );
    if let Err(e) = client.send(&Outbound::new("lobbied", lobbied)).await {
        tracing::debug!(client = %client.name(), "Failed to send lobbied: {e}");
    }
}
