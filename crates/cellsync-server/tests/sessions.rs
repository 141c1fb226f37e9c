//! End-to-end session tests over the raw TCP transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cellsync_server::protocol::{ClientMessage, MessageBuffer, ServerMessage, WireMessage};
use cellsync_server::session::{SessionManager, SessionSettings};
use cellsync_server::transport::tcp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, Arc<SessionManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let manager = Arc::new(SessionManager::new(SessionSettings::default()));
    tokio::spawn(tcp::serve(listener, manager.clone()));
    (addr, manager)
}

struct Client {
    stream: TcpStream,
    buffer: MessageBuffer,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffer: MessageBuffer::new(),
        }
    }

    /// Connect, log in and consume the opening snapshot
    async fn login(addr: SocketAddr, username: &str, spreadsheet: &str) -> (Self, ServerMessage) {
        let mut client = Self::connect(addr).await;
        client
            .send(&ClientMessage::Login {
                username: username.to_string(),
                spreadsheet: spreadsheet.to_string(),
            })
            .await;
        let snapshot = client.recv().await.expect("snapshot after login");
        (client, snapshot)
    }

    async fn send(&mut self, message: &ClientMessage) {
        let mut line = message.encode();
        line.push('\n');
        self.send_raw(line.as_bytes()).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn edit(&mut self, cell: &str, contents: &str) {
        self.send(&ClientMessage::Edit {
            cell: cell.parse().unwrap(),
            contents: contents.to_string(),
        })
        .await;
    }

    /// Next message, or `None` once the server closes the connection
    async fn recv(&mut self) -> Option<ServerMessage> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(message) = self.buffer.next_message::<ServerMessage>().unwrap() {
                return Some(message);
            }
            let n = match timeout(RECV_TIMEOUT, self.stream.read(&mut chunk)).await.unwrap() {
                Ok(n) => n,
                Err(_) => return None,
            };
            if n == 0 {
                return None;
            }
            self.buffer.extend(&chunk[..n]);
        }
    }
}

/// Cell updates of a `CELLS` message as sorted `(cell, value)` pairs
fn updates(message: &ServerMessage) -> Vec<(String, String)> {
    match message {
        ServerMessage::Cells(cells) => {
            let mut pairs: Vec<(String, String)> =
                cells.iter().map(|u| (u.cell.to_string(), u.value.clone())).collect();
            pairs.sort();
            pairs
        }
        other => panic!("expected CELLS, got {:?}", other),
    }
}

fn pairs(expected: &[(&str, &str)]) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> =
        expected.iter().map(|(c, v)| (c.to_string(), v.to_string())).collect();
    pairs.sort();
    pairs
}

#[tokio::test]
async fn test_edits_are_broadcast_to_every_session() {
    let (addr, _manager) = start_server().await;

    let (mut alice, snapshot) = Client::login(addr, "alice", "budget").await;
    assert!(updates(&snapshot).is_empty());
    let (mut bob, _) = Client::login(addr, "bob", "budget").await;

    alice.edit("A1", "1").await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(updates(&client.recv().await.unwrap()), pairs(&[("A1", "1")]));
    }

    bob.edit("B1", "=A1+1").await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(updates(&client.recv().await.unwrap()), pairs(&[("B1", "2")]));
    }

    alice.edit("A1", "5").await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(updates(&client.recv().await.unwrap()), pairs(&[("A1", "5"), ("B1", "6")]));
    }
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let (addr, _manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    alice.edit("A1", "2").await;
    alice.edit("A2", "=A1*3").await;
    alice.recv().await.unwrap();
    alice.recv().await.unwrap();

    let (_bob, snapshot) = Client::login(addr, "bob", "budget").await;
    assert_eq!(updates(&snapshot), pairs(&[("A1", "2"), ("A2", "6")]));
}

#[tokio::test]
async fn test_rejected_edit_only_reaches_submitter() {
    let (addr, _manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    let (mut bob, _) = Client::login(addr, "bob", "budget").await;

    alice.edit("A1", "=A1").await;
    assert!(matches!(alice.recv().await, Some(ServerMessage::Error(_))));

    // Bob's next message is his own edit, nothing about the rejection
    bob.edit("C3", "7").await;
    assert_eq!(updates(&bob.recv().await.unwrap()), pairs(&[("C3", "7")]));
    assert_eq!(updates(&alice.recv().await.unwrap()), pairs(&[("C3", "7")]));
}

#[tokio::test]
async fn test_undo_and_clear_over_the_wire() {
    let (addr, _manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    let (mut bob, _) = Client::login(addr, "bob", "budget").await;

    alice.edit("A1", "1").await;
    bob.edit("A1", "2").await;
    for client in [&mut alice, &mut bob] {
        client.recv().await.unwrap();
        client.recv().await.unwrap();
    }

    alice.send(&ClientMessage::Undo).await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(updates(&client.recv().await.unwrap()), pairs(&[("A1", "1")]));
    }

    bob.send(&ClientMessage::Clear).await;
    for client in [&mut alice, &mut bob] {
        assert_eq!(client.recv().await, Some(ServerMessage::Reset));
    }

    // Nothing left to undo after a clear
    alice.send(&ClientMessage::Undo).await;
    assert!(matches!(alice.recv().await, Some(ServerMessage::Error(_))));
}

#[tokio::test]
async fn test_first_message_must_be_login() {
    let (addr, _manager) = start_server().await;

    let mut client = Client::connect(addr).await;
    client.send(&ClientMessage::Undo).await;

    assert!(matches!(client.recv().await, Some(ServerMessage::Error(_))));
    assert_eq!(client.recv().await, None);
}

#[tokio::test]
async fn test_invalid_login_is_refused() {
    let (addr, manager) = start_server().await;

    let mut client = Client::connect(addr).await;
    client
        .send(&ClientMessage::Login {
            username: "alice".to_string(),
            spreadsheet: "../etc".to_string(),
        })
        .await;

    assert!(matches!(client.recv().await, Some(ServerMessage::Error(_))));
    assert_eq!(client.recv().await, None);
    assert!(manager.open_documents().await.is_empty());
}

#[tokio::test]
async fn test_malformed_message_closes_connection() {
    let (addr, _manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    let (mut bob, _) = Client::login(addr, "bob", "budget").await;

    alice.send_raw(b"SHOUT hello\n").await;
    assert!(matches!(alice.recv().await, Some(ServerMessage::Error(_))));
    assert_eq!(alice.recv().await, None);

    // The document keeps serving everyone else
    bob.edit("A1", "3").await;
    assert_eq!(updates(&bob.recv().await.unwrap()), pairs(&[("A1", "3")]));
}

#[tokio::test]
async fn test_second_login_closes_connection() {
    let (addr, _manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    alice
        .send(&ClientMessage::Login {
            username: "alice".to_string(),
            spreadsheet: "other".to_string(),
        })
        .await;

    assert!(matches!(alice.recv().await, Some(ServerMessage::Error(_))));
    assert_eq!(alice.recv().await, None);
}

#[tokio::test]
async fn test_logout_closes_idle_document() {
    let (addr, manager) = start_server().await;

    let (mut alice, _) = Client::login(addr, "alice", "budget").await;
    assert_eq!(manager.open_documents().await.len(), 1);

    alice.send(&ClientMessage::Logout).await;
    assert_eq!(alice.recv().await, None);

    // The server closes the document after the connection winds down
    for _ in 0..100 {
        if manager.open_documents().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document still open after the last session logged out");
}
