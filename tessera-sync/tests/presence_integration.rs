//! Presence relay through a live server: stamping, echo policy and
//! membership events.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tessera_sync::client::SyncClient;
use tessera_sync::config::ServerConfig;
use tessera_sync::presence::{PresenceBoard, PresenceSignal, PresenceStatus};
use tessera_sync::protocol::ServerMessage;
use tessera_sync::server::SyncServer;
use tessera_sync::value::Value;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_test_server() -> (String, Arc<SyncServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig::default()));
    let handle = server.clone();
    tokio::spawn(async move {
        handle.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), server)
}

async fn next(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message within timeout")
        .expect("channel open")
}

async fn connect_and_join(
    url: &str,
    actor: &str,
    entity: &str,
) -> (SyncClient, mpsc::Receiver<ServerMessage>) {
    let mut client = SyncClient::new(actor, url);
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.join(entity).await.unwrap();
    loop {
        if let ServerMessage::Snapshot { .. } = next(&mut rx).await {
            break;
        }
    }
    (client, rx)
}

/// Everything received before the reply to a ping.
async fn drain(client: &SyncClient, rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
    client.ping().await.unwrap();
    let mut seen = Vec::new();
    loop {
        match next(rx).await {
            ServerMessage::Pong => return seen,
            other => seen.push(other),
        }
    }
}

#[tokio::test]
async fn test_peer_joined_is_stamped() {
    let (url, _server) = start_test_server().await;
    let (_alice, mut alice_rx) = connect_and_join(&url, "alice", "board-1").await;
    let (bob, _bob_rx) = connect_and_join(&url, "bob", "board-1").await;

    match next(&mut alice_rx).await {
        ServerMessage::PeerJoined { entity_id, sender } => {
            assert_eq!(entity_id, "board-1");
            assert_eq!(sender.actor.as_deref(), Some("bob"));
            assert_eq!(Some(sender.connection_id), bob.connection_id().await);
        }
        other => panic!("Expected PeerJoined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cursor_relayed_to_others_only() {
    let (url, _server) = start_test_server().await;
    let (alice, mut alice_rx) = connect_and_join(&url, "alice", "board-1").await;
    let (_bob, mut bob_rx) = connect_and_join(&url, "bob", "board-1").await;

    alice
        .send_presence("board-1", PresenceSignal::Cursor { x: 100.0, y: 200.0 })
        .await
        .unwrap();

    match next(&mut bob_rx).await {
        ServerMessage::Presence {
            entity_id,
            sender,
            signal,
        } => {
            assert_eq!(entity_id, "board-1");
            assert_eq!(sender.actor.as_deref(), Some("alice"));
            assert_eq!(signal, PresenceSignal::Cursor { x: 100.0, y: 200.0 });
        }
        other => panic!("Expected Presence, got {other:?}"),
    }

    let seen = drain(&alice, &mut alice_rx).await;
    assert!(
        !seen.iter().any(|m| matches!(m, ServerMessage::Presence { .. })),
        "cursor echoed to sender: {seen:?}"
    );
}

#[tokio::test]
async fn test_status_echoes_to_sender() {
    let (url, _server) = start_test_server().await;
    let (alice, mut alice_rx) = connect_and_join(&url, "alice", "board-1").await;
    let (_bob, mut bob_rx) = connect_and_join(&url, "bob", "board-1").await;

    alice
        .send_presence("board-1", PresenceSignal::Status(PresenceStatus::Away))
        .await
        .unwrap();

    let seen = drain(&alice, &mut alice_rx).await;
    assert!(seen.iter().any(|m| matches!(
        m,
        ServerMessage::Presence {
            signal: PresenceSignal::Status(PresenceStatus::Away),
            ..
        }
    )));
    assert!(matches!(
        next(&mut bob_rx).await,
        ServerMessage::Presence {
            signal: PresenceSignal::Status(PresenceStatus::Away),
            ..
        }
    ));
}

#[tokio::test]
async fn test_presence_to_unjoined_room_dropped() {
    let (url, _server) = start_test_server().await;
    let (alice, _alice_rx) = connect_and_join(&url, "alice", "board-1").await;
    let (bob, mut bob_rx) = connect_and_join(&url, "bob", "board-2").await;

    alice
        .send_presence(
            "board-2",
            PresenceSignal::Typing {
                active: true,
                related_entity: None,
            },
        )
        .await
        .unwrap();

    let seen = drain(&bob, &mut bob_rx).await;
    assert!(seen.is_empty(), "unexpected: {seen:?}");
}

#[tokio::test]
async fn test_presence_board_follows_room() {
    let (url, _server) = start_test_server().await;
    let (_alice, mut alice_rx) = connect_and_join(&url, "alice", "board-1").await;
    let (mut bob, _bob_rx) = connect_and_join(&url, "bob", "board-1").await;
    let bob_id = bob.connection_id().await.unwrap();

    bob.send_presence(
        "board-1",
        PresenceSignal::Typing {
            active: true,
            related_entity: Some("card-7".into()),
        },
    )
    .await
    .unwrap();
    bob.send_presence(
        "board-1",
        PresenceSignal::Custom {
            kind: "drag".into(),
            payload: Value::from("card-7"),
        },
    )
    .await
    .unwrap();
    bob.close().await;

    let mut board = PresenceBoard::new("board-1", StdDuration::from_secs(10));
    let mut typing_seen = false;
    loop {
        match next(&mut alice_rx).await {
            ServerMessage::PeerJoined { sender, .. } => board.peer_joined(&sender),
            ServerMessage::Presence { sender, signal, .. } => {
                board.apply(&sender, &signal);
                if board.typing_at(Instant::now()).len() == 1 {
                    typing_seen = true;
                    assert_eq!(
                        board.peer(bob_id).unwrap().typing_in.as_deref(),
                        Some("card-7")
                    );
                }
            }
            ServerMessage::PeerLeft { connection_id, .. } => {
                board.peer_left(connection_id);
                break;
            }
            _ => {}
        }
    }
    assert!(typing_seen);
    assert_eq!(board.peer_count(), 0);
}
