//! End-to-end sessions: two clients exchanging chat, files, folders and
//! listings through a real server.

use peerlink_core::client::{dial, ChecksumStatus, Client, ClientEvent, Connection, HandshakeOutcome};
use peerlink_core::config::{ClientConfig, ServerConfig};
use peerlink_core::crypto::MessageCipher;
use peerlink_core::registry::PeerId;
use peerlink_core::server::{Server, ServerState};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

async fn start_server(
    reconnect_by_address: bool,
    cipher: Option<MessageCipher>,
) -> (SocketAddr, Arc<ServerState>) {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_interval: Duration::from_secs(3600),
        reconnect_by_address,
        ..ServerConfig::default()
    };
    let server = Server::bind(config, cipher).await.unwrap();
    let addr = server.local_addr().unwrap();
    let state = server.state();
    tokio::spawn(server.run());
    (addr, state)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(addr.to_string());
    config.reconnect_wait = Duration::from_millis(300);
    config
}

struct Session {
    client: Client,
    events: mpsc::Receiver<ClientEvent>,
    _root: TempDir,
}

impl Session {
    async fn join(addr: SocketAddr, name: &str, secret: Option<&str>) -> Self {
        let root = TempDir::new().unwrap();
        let cipher = secret.map(|s| MessageCipher::from_secret(s).unwrap());
        let mut connection = Connection::open(client_config(addr), cipher).await.unwrap();
        let outcome = connection
            .register(name, &root.path().to_string_lossy())
            .await
            .unwrap();
        assert!(matches!(outcome, HandshakeOutcome::Registered { .. }));
        let (client, events, _handle) = connection.start(&outcome, root.path());
        Self { client, events, _root: root }
    }

    fn id(&self) -> PeerId {
        self.client.id()
    }

    fn root(&self) -> &Path {
        self.client.storage_root()
    }

    async fn wait_for(&mut self, matches: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }
}

#[tokio::test]
async fn chat_reaches_everyone() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;
    let mut bob = Session::join(addr, "bob", None).await;

    alice
        .wait_for(|e| matches!(e, ClientEvent::Chat(t) if t == "User bob has joined the chat"))
        .await;

    alice.client.send_chat("hi bob").await.unwrap();
    for session in [&mut alice, &mut bob] {
        let event = session
            .wait_for(|e| matches!(e, ClientEvent::Chat(t) if t.contains("hi bob")))
            .await;
        let ClientEvent::Chat(text) = event else { unreachable!() };
        assert!(text.ends_with("alice: hi bob"), "{text}");
    }
}

#[tokio::test]
async fn file_is_written_and_verified() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;
    let mut bob = Session::join(addr, "bob", None).await;

    let source = alice.root().join("report.txt");
    tokio::fs::write(&source, b"hello, world!").await.unwrap();

    let transfer = alice.client.send_file(bob.id(), &source).await.unwrap();
    alice
        .wait_for(|e| matches!(e, ClientEvent::TransferFinished { id, .. } if *id == transfer.id))
        .await;

    let event = bob.wait_for(|e| matches!(e, ClientEvent::FileReceived { .. })).await;
    let ClientEvent::FileReceived { from, path, size, checksum } = event else { unreachable!() };
    assert_eq!(from, alice.id());
    assert_eq!(size, 13);
    assert_eq!(checksum, ChecksumStatus::Verified);
    assert_eq!(path, bob.root().join("report.txt"));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello, world!");
}

#[tokio::test]
async fn folder_is_zipped_and_extracted() {
    let (addr, _state) = start_server(false, None).await;
    let alice = Session::join(addr, "alice", None).await;
    let mut bob = Session::join(addr, "bob", None).await;

    let folder = alice.root().join("album");
    tokio::fs::create_dir_all(folder.join("2024")).await.unwrap();
    tokio::fs::write(folder.join("cover.txt"), b"front").await.unwrap();
    tokio::fs::write(folder.join("2024").join("june.txt"), b"sunny").await.unwrap();

    alice.client.send_folder(bob.id(), &folder).await.unwrap();

    let event = bob.wait_for(|e| matches!(e, ClientEvent::FolderReceived { .. })).await;
    let ClientEvent::FolderReceived { from, path, .. } = event else { unreachable!() };
    assert_eq!(from, alice.id());
    assert_eq!(path, bob.root().join("album"));
    assert_eq!(tokio::fs::read(path.join("cover.txt")).await.unwrap(), b"front");
    assert_eq!(tokio::fs::read(path.join("2024/june.txt")).await.unwrap(), b"sunny");
    assert!(!bob.root().join("album.zip").exists());
}

#[tokio::test]
async fn look_lists_the_peer_storage() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;
    let mut bob = Session::join(addr, "bob", None).await;

    tokio::fs::write(bob.root().join("x.txt"), b"12345").await.unwrap();
    tokio::fs::create_dir(bob.root().join("sub")).await.unwrap();

    alice.client.look(bob.id()).await.unwrap();
    let event = alice.wait_for(|e| matches!(e, ClientEvent::Listing { .. })).await;
    let ClientEvent::Listing { from, text } = event else { unreachable!() };
    assert_eq!(from, bob.id());
    assert_eq!(
        text,
        "=== FOLDERS ===\n[FOLDER] sub (Size: 0 bytes)\n=== FILES ===\n[FILE] x.txt (Size: 5 bytes)"
    );

    let alice_id = alice.id();
    bob.wait_for(|e| matches!(e, ClientEvent::LookServed { requester } if *requester == alice_id))
        .await;
}

#[tokio::test]
async fn download_pulls_a_file_from_the_peer() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;
    let bob = Session::join(addr, "bob", None).await;

    tokio::fs::create_dir(bob.root().join("notes")).await.unwrap();
    tokio::fs::write(bob.root().join("notes/todo.txt"), b"buy milk").await.unwrap();

    alice.client.download(bob.id(), "notes/todo.txt").await.unwrap();
    let event = alice.wait_for(|e| matches!(e, ClientEvent::FileReceived { .. })).await;
    let ClientEvent::FileReceived { from, path, checksum, .. } = event else { unreachable!() };
    assert_eq!(from, bob.id());
    assert_eq!(checksum, ChecksumStatus::Verified);
    assert_eq!(path, alice.root().join("todo.txt"));
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"buy milk");
}

#[tokio::test]
async fn status_reports_offline_peers() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;
    let bob = Session::join(addr, "bob", None).await;
    let bob_id = bob.id();

    bob.client.exit().await.unwrap();
    alice
        .wait_for(|e| matches!(e, ClientEvent::Chat(t) if t == "User bob is now offline"))
        .await;

    alice.client.request_status().await.unwrap();
    let event = alice.wait_for(|e| matches!(e, ClientEvent::Status(_))).await;
    let ClientEvent::Status(lines) = event else { unreachable!() };
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1], format!("bob (id {bob_id}) is offline"));
}

#[tokio::test]
async fn sending_to_an_offline_peer_reports_an_error() {
    let (addr, _state) = start_server(false, None).await;
    let mut alice = Session::join(addr, "alice", None).await;

    let source = alice.root().join("lonely.txt");
    tokio::fs::write(&source, b"anyone?").await.unwrap();
    alice.client.send_file(PeerId::new(77), &source).await.unwrap();

    let event = alice.wait_for(|e| matches!(e, ClientEvent::Error(_))).await;
    let ClientEvent::Error(text) = event else { unreachable!() };
    assert_eq!(text, "user 77 is not online");

    // The drained payload did not corrupt the stream.
    alice.client.send_chat("still framed").await.unwrap();
    alice
        .wait_for(|e| matches!(e, ClientEvent::Chat(t) if t.ends_with("alice: still framed")))
        .await;
}

#[tokio::test]
async fn returning_address_resumes_the_session() {
    let (addr, state) = start_server(true, None).await;
    let root = TempDir::new().unwrap();

    let mut first = Connection::open(client_config(addr), None).await.unwrap();
    assert!(first.await_reconnect().await.unwrap().is_none());
    let outcome = first.register("alice", &root.path().to_string_lossy()).await.unwrap();
    let id = outcome.id();
    let (client, _events, reader) = first.start(&outcome, root.path());

    client.exit().await.unwrap();
    reader.await.unwrap();
    for _ in 0..50 {
        if !state.registry.get(id).await.map(|p| p.online).unwrap_or(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut second = Connection::open(client_config(addr), None).await.unwrap();
    let resumed = second.await_reconnect().await.unwrap();
    assert_eq!(
        resumed,
        Some(HandshakeOutcome::Reconnected { id, name: "alice".into() })
    );
    assert!(state.registry.get(id).await.unwrap().online);
    assert_eq!(state.registry.len().await, 1);
}

#[tokio::test]
async fn verified_stream_resumes_without_a_second_dial() {
    let (addr, state) = start_server(true, None).await;
    let root = TempDir::new().unwrap();

    let mut watcher = Connection::open(client_config(addr), None).await.unwrap();
    assert!(watcher.await_reconnect().await.unwrap().is_none());
    let outcome = watcher.register("bob", &root.path().to_string_lossy()).await.unwrap();
    let (_bob, mut bob_events, _bob_reader) = watcher.start(&outcome, root.path());

    let mut first = Connection::open(client_config(addr), None).await.unwrap();
    assert!(first.await_reconnect().await.unwrap().is_none());
    let outcome = first.register("alice", &root.path().to_string_lossy()).await.unwrap();
    let id = outcome.id();
    let (alice, _events, _reader) = first.start(&outcome, root.path());
    alice.exit().await.unwrap();

    let is_chat = |e: &ClientEvent, text: &str| matches!(e, ClientEvent::Chat(t) if t == text);
    loop {
        let event = tokio::time::timeout(WAIT, bob_events.recv()).await.unwrap().unwrap();
        if is_chat(&event, "User alice is now offline") {
            break;
        }
    }

    let config = client_config(addr);
    let stream = dial(&config).await.unwrap();
    let mut second = Connection::from_stream(stream, config, None);
    let resumed = second.await_reconnect().await.unwrap().unwrap();
    assert_eq!(resumed.id(), id);
    let (alice, _events, _reader) = second.start(&resumed, root.path());
    alice.send_chat("back again").await.unwrap();

    let mut notices = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, bob_events.recv()).await.unwrap().unwrap();
        if let ClientEvent::Chat(text) = event {
            if text.ends_with("alice: back again") {
                break;
            }
            notices.push(text);
        }
    }
    assert_eq!(notices, vec!["User alice is back online".to_string()]);
    assert!(state.registry.get(id).await.unwrap().online);
    assert_eq!(state.registry.len().await, 2);
}

#[tokio::test]
async fn download_outside_storage_is_refused() {
    let (addr, _state) = start_server(false, None).await;
    let alice = Session::join(addr, "alice", None).await;
    let mut bob = Session::join(addr, "bob", None).await;

    let outside = TempDir::new().unwrap();
    let secret = outside.path().join("secret.txt");
    tokio::fs::write(&secret, b"private").await.unwrap();

    alice.client.download(bob.id(), &secret.to_string_lossy()).await.unwrap();
    let event = bob.wait_for(|e| matches!(e, ClientEvent::TransferFailed { .. })).await;
    let ClientEvent::TransferFailed { error, .. } = event else { unreachable!() };
    assert!(error.contains("outside the shared storage"), "{error}");

    alice.client.download(bob.id(), "../secret.txt").await.unwrap();
    let event = bob.wait_for(|e| matches!(e, ClientEvent::TransferFailed { .. })).await;
    let ClientEvent::TransferFailed { error, .. } = event else { unreachable!() };
    assert!(error.contains("outside the shared storage"), "{error}");
}

#[tokio::test]
async fn encrypted_chat_between_keyed_clients() {
    let secret = "correct horse battery staple";
    let (addr, _state) =
        start_server(false, Some(MessageCipher::from_secret(secret).unwrap())).await;
    let alice = Session::join(addr, "alice", Some(secret)).await;
    let mut bob = Session::join(addr, "bob", Some(secret)).await;

    alice.client.send_chat("sealed hello").await.unwrap();
    bob.wait_for(|e| matches!(e, ClientEvent::Chat(t) if t.ends_with("alice: sealed hello")))
        .await;
}

#[tokio::test]
async fn wrong_key_is_refused_at_handshake() {
    let (addr, state) =
        start_server(false, Some(MessageCipher::from_secret("right").unwrap())).await;

    let cipher = MessageCipher::from_secret("wrong").unwrap();
    let mut connection = Connection::open(client_config(addr), Some(cipher)).await.unwrap();
    let result = connection.register("mallory", "/tmp").await;
    assert!(result.is_err());
    assert!(state.registry.is_empty().await);
}
