//! End-to-end tests: clients driven over framed byte streams.

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use turnhost_core::{Client, ClientEvents, ClientInfo, Config, Lifecycle, Outbound, SentEvent};
use turnhost_transport::{EotCodec, TcpTransport};

type Peer = Framed<DuplexStream, EotCodec>;

fn connect() -> (Client<TcpTransport<DuplexStream>>, ClientEvents, Peer) {
    let (near, far) = tokio::io::duplex(1024);
    let (client, events) = Client::new(TcpTransport::new(near), Config::default());
    (client, events, Framed::new(far, EotCodec::new()))
}

#[tokio::test]
async fn test_split_document_dispatches_once() {
    let (_client, mut events, mut peer) = connect();

    peer.get_mut().write_all(b"{\"event\":\"ru").await.unwrap();
    peer.get_mut().write_all(b"n\",\"data\":{}}\x04").await.unwrap();

    assert_eq!(events.sent.recv().await.unwrap(), SentEvent::Run(json!({})));
    assert!(events.sent.try_recv().is_err());
}

#[tokio::test]
async fn test_chunk_boundaries_do_not_matter() {
    let stream = b"{\"event\":\"alias\",\"data\":\"foo\"}\x04{\"event\":\"finished\",\"data\":{\"orderIndex\":3}}\x04";

    for split in 0..=stream.len() {
        let (_client, mut events, mut peer) = connect();
        peer.get_mut().write_all(&stream[..split]).await.unwrap();
        peer.get_mut().write_all(&stream[split..]).await.unwrap();

        assert_eq!(
            events.sent.recv().await.unwrap(),
            SentEvent::Alias(json!("foo")),
            "split at {split}"
        );
        assert_eq!(
            events.sent.recv().await.unwrap(),
            SentEvent::Finished(json!({"orderIndex": 3})),
            "split at {split}"
        );
    }
}

#[tokio::test]
async fn test_not_json_gets_fatal_frame_then_close() {
    let (client, mut events, mut peer) = connect();

    peer.get_mut().write_all(b"not json\x04").await.unwrap();

    let frame = peer.next().await.unwrap().unwrap();
    let fatal: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(fatal["event"], "fatal");
    assert_eq!(fatal["data"]["timedOut"], false);
    assert!(
        fatal["data"]["message"]
            .as_str()
            .unwrap()
            .starts_with("Sent malformed JSON: '")
    );

    assert_eq!(events.lifecycle.recv().await.unwrap(), Lifecycle::Disconnected);
    assert!(client.has_disconnected());
    assert!(peer.next().await.is_none());
}

#[tokio::test]
async fn test_outbound_documents_are_delimited() {
    let (client, _events, mut peer) = connect();

    client.send(&Outbound::new("named", "chess")).await.unwrap();
    client.send(&Outbound::new("lobbied", json!({"gameSession": "1"}))).await.unwrap();

    assert_eq!(peer.next().await.unwrap().unwrap(), r#"{"event":"named","data":"chess"}"#);
    assert_eq!(
        peer.next().await.unwrap().unwrap(),
        r#"{"event":"lobbied","data":{"gameSession":"1"}}"#
    );
}

#[tokio::test]
async fn test_hand_off_replays_buffered_bytes() {
    let (client, mut events, mut peer) = connect();
    client
        .set_info(ClientInfo {
            name: Some("Bob".to_string()),
            language: Some("Rust".to_string()),
            ..ClientInfo::default()
        })
        .unwrap();

    peer.get_mut()
        .write_all(b"{\"event\":\"alias\",\"data\":\"a\"}\x04{\"event\":\"al")
        .await
        .unwrap();
    assert_eq!(events.sent.recv().await.unwrap(), SentEvent::Alias(json!("a")));

    assert!(client.stop_listening_to_socket().await);
    let hand_off = client.pop_net_socket().await.unwrap();
    assert_eq!(&hand_off.buffered[..], b"{\"event\":\"al");
    assert!(!client.has_disconnected());

    let (resumed, mut resumed_events) =
        Client::<TcpTransport<DuplexStream>>::from_hand_off(hand_off, Config::default());
    assert_eq!(resumed.name(), "Bob");
    assert_eq!(resumed.programming_language(), "Rust");

    peer.get_mut().write_all(b"ias\",\"data\":\"b\"}\x04").await.unwrap();
    assert_eq!(resumed_events.sent.recv().await.unwrap(), SentEvent::Alias(json!("b")));
    assert!(events.sent.try_recv().is_err());

    resumed.send(&Outbound::new("named", "b")).await.unwrap();
    assert_eq!(peer.next().await.unwrap().unwrap(), r#"{"event":"named","data":"b"}"#);
}

#[tokio::test]
async fn test_serve_accepts_real_sockets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (accepted, mut transports) = mpsc::unbounded_channel();
    tokio::spawn(turnhost_transport::tcp::serve(listener, accepted));

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut peer = Framed::new(stream, EotCodec::new());
    let (client, mut events) = Client::new(transports.recv().await.unwrap(), Config::default());

    peer.send(r#"{"event":"play","data":{"gameName":"chess"}}"#.to_string())
        .await
        .unwrap();
    assert_eq!(
        events.sent.recv().await.unwrap(),
        SentEvent::Play(json!({"gameName": "chess"}))
    );

    client.disconnect(Some("Sorry, the server is shutting down.")).await;
    let frame = peer.next().await.unwrap().unwrap();
    let fatal: Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(fatal["data"]["message"], "Sorry, the server is shutting down.");
    assert_eq!(events.lifecycle.recv().await.unwrap(), Lifecycle::Disconnected);
}
