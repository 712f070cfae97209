//! Client session.
//!
//! A [`Connection`] performs the handshake and then splits into a
//! [`Client`] handle for outbound commands and a background read loop
//! that reports everything it receives as [`ClientEvent`]s.
//!
//! ```text
//!   input loop ──> Client ──> Transport (write half) ──> server
//!   server ──> read loop ──> ClientEvent channel ──> input loop
//! ```

mod intent;
mod reader;

pub use intent::{Intent, HELP_TEXT};

use crate::config::ClientConfig;
use crate::crypto::{open, seal, MessageCipher};
use crate::error::{Error, Result};
use crate::protocol::{is_valid_token, read_line, Command, ERROR_PREFIX};
use crate::registry::PeerId;
use crate::transfer::{
    copy_exact, file_checksum, pack_folder, pad_zeros, Direction, RelayError, Transfer,
    TransferId, TransferKind, TransferManager, TransferSpec,
};
use crate::transport::Transport;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How the handshake ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// A new peer record was created.
    Registered {
        /// Assigned id.
        id: PeerId,
        /// Registered name.
        name: String,
    },
    /// The server matched this connection to a known offline peer.
    Reconnected {
        /// Existing id.
        id: PeerId,
        /// Existing name.
        name: String,
    },
}

impl HandshakeOutcome {
    /// Own peer id.
    pub fn id(&self) -> PeerId {
        match self {
            HandshakeOutcome::Registered { id, .. } | HandshakeOutcome::Reconnected { id, .. } => *id,
        }
    }

    /// Own display name.
    pub fn name(&self) -> &str {
        match self {
            HandshakeOutcome::Registered { name, .. } | HandshakeOutcome::Reconnected { name, .. } => name,
        }
    }
}

/// Result of verifying a received file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    /// Digest matched.
    Verified,
    /// Digest differed; the file is kept.
    Mismatch(String),
    /// Sender declared no digest.
    NotDeclared,
}

/// Something the read loop or a background send observed.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Chat line or server notice.
    Chat(String),
    /// Error notice addressed to this client.
    Error(String),
    /// Reply to `/status`.
    Status(Vec<String>),
    /// A file was written to local storage.
    FileReceived {
        /// Sender id.
        from: PeerId,
        /// Where it was written.
        path: PathBuf,
        /// Size in bytes.
        size: u64,
        /// Checksum verification result.
        checksum: ChecksumStatus,
    },
    /// A folder was received and extracted.
    FolderReceived {
        /// Sender id.
        from: PeerId,
        /// Extracted folder.
        path: PathBuf,
        /// Archive size in bytes.
        size: u64,
    },
    /// Reply to `/look`.
    Listing {
        /// Peer whose storage was listed.
        from: PeerId,
        /// Rendered listing.
        text: String,
    },
    /// Another peer listed our storage.
    LookServed {
        /// Peer that asked.
        requester: PeerId,
    },
    /// Another peer asked for one of our files or folders.
    DownloadRequested {
        /// Peer that asked.
        requester: PeerId,
        /// Requested path.
        path: String,
    },
    /// A transfer started on a background task.
    TransferStarted {
        /// Local transfer id.
        id: TransferId,
        /// File or folder name.
        name: String,
        /// Declared size.
        size: u64,
    },
    /// A background send completed.
    TransferFinished {
        /// Local transfer id.
        id: TransferId,
        /// File or folder name.
        name: String,
    },
    /// A transfer failed.
    TransferFailed {
        /// File or folder name.
        name: String,
        /// What went wrong.
        error: String,
    },
    /// The server closed the connection.
    Disconnected,
}

/// Dial the server within the configured timeout.
pub async fn dial(config: &ClientConfig) -> Result<TcpStream> {
    let stream = tokio::time::timeout(config.dial_timeout, TcpStream::connect(&config.server_addr))
        .await??;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not set TCP_NODELAY");
    }
    Ok(stream)
}

/// A connected but not yet registered session.
pub struct Connection<R> {
    reader: BufReader<R>,
    transport: Arc<Transport>,
    cipher: Option<Arc<MessageCipher>>,
    config: ClientConfig,
}

impl Connection<tokio::net::tcp::OwnedReadHalf> {
    /// Dial the configured server.
    pub async fn open(config: ClientConfig, cipher: Option<MessageCipher>) -> Result<Self> {
        let stream = dial(&config).await?;
        Ok(Connection::from_stream(stream, config, cipher))
    }

    /// Use a stream that is already connected, such as the one a
    /// reachability check dialled.
    ///
    /// The server may resume an offline peer as soon as it accepts, so
    /// every connection that reaches it must be the one the session runs
    /// on.
    pub fn from_stream(stream: TcpStream, config: ClientConfig, cipher: Option<MessageCipher>) -> Self {
        let remote = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Connection::new(reader, writer, remote, config, cipher)
    }
}

impl<R> Connection<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Wrap an established stream.
    pub fn new<W>(
        reader: R,
        writer: W,
        remote: Option<SocketAddr>,
        config: ClientConfig,
        cipher: Option<MessageCipher>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: BufReader::new(reader),
            transport: Arc::new(Transport::new(writer, remote)),
            cipher: cipher.map(Arc::new),
            config,
        }
    }

    /// Wait briefly for the server to recognise this connection as a
    /// returning peer.
    ///
    /// This is the only read with a deadline; it is over once this
    /// returns.
    pub async fn await_reconnect(&mut self) -> Result<Option<HandshakeOutcome>> {
        let read = read_line(&mut self.reader, self.config.max_line_len);
        let line = match tokio::time::timeout(self.config.reconnect_wait, read).await {
            Err(_) => return Ok(None),
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return Err(Error::Transport("server closed the connection".into())),
            Ok(Err(e)) => return Err(e),
        };

        match Command::parse(&line) {
            Ok(Command::Reconnect { name, id }) => {
                info!(peer = %id, name = %name, "Reconnected to existing session");
                Ok(Some(HandshakeOutcome::Reconnected { id, name }))
            }
            _ => {
                debug!(line = %crate::logging::Preview(&line), "Ignoring line before registration");
                Ok(None)
            }
        }
    }

    /// Send credentials and wait for the welcome.
    pub async fn register(&mut self, name: &str, storage_root: &str) -> Result<HandshakeOutcome> {
        let name = name.trim();
        let storage_root = storage_root.trim();
        if name.is_empty() || storage_root.is_empty() {
            return Err(Error::Protocol("name and storage root must not be empty".into()));
        }

        self.transport.send_line(&seal(self.cipher.as_deref(), name)?).await?;
        self.transport.send_line(&seal(self.cipher.as_deref(), storage_root)?).await?;

        let line = read_line(&mut self.reader, self.config.max_line_len)
            .await?
            .ok_or_else(|| Error::Transport("server closed the connection".into()))?;

        match Command::parse(&line) {
            Ok(Command::Welcome { id, name }) => {
                info!(peer = %id, name = %name, "Registered");
                Ok(HandshakeOutcome::Registered { id, name })
            }
            Ok(Command::Chat(text)) => {
                let text = open(self.cipher.as_deref(), &text).unwrap_or(text);
                match text.strip_prefix(ERROR_PREFIX) {
                    Some(reason) => Err(Error::Protocol(format!("registration refused: {}", reason))),
                    None => Err(Error::Protocol(format!("unexpected reply: {}", text))),
                }
            }
            Ok(other) => Err(Error::Protocol(format!("unexpected reply: {}", other))),
            Err(e) => Err(e),
        }
    }

    /// Start the read loop and hand back the client handle.
    pub fn start(
        self,
        outcome: &HandshakeOutcome,
        storage_root: impl Into<PathBuf>,
    ) -> (Client, mpsc::Receiver<ClientEvent>, JoinHandle<()>) {
        let (events, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client = Client {
            inner: Arc::new(ClientInner {
                id: outcome.id(),
                name: outcome.name().to_string(),
                storage_root: storage_root.into(),
                transport: self.transport,
                cipher: self.cipher,
                transfers: TransferManager::new(),
                events,
            }),
        };

        let read_loop = reader::ReadLoop::new(client.clone(), self.reader, self.config.max_line_len);
        let handle = tokio::spawn(read_loop.run());
        (client, event_rx, handle)
    }
}

struct ClientInner {
    id: PeerId,
    name: String,
    storage_root: PathBuf,
    transport: Arc<Transport>,
    cipher: Option<Arc<MessageCipher>>,
    transfers: TransferManager,
    events: mpsc::Sender<ClientEvent>,
}

/// Handle for issuing commands on an active session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Own peer id.
    pub fn id(&self) -> PeerId {
        self.inner.id
    }

    /// Own display name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local storage root.
    pub fn storage_root(&self) -> &Path {
        &self.inner.storage_root
    }

    /// Send a chat line.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let line = seal(self.cipher(), text)?;
        self.inner.transport.send_line_or_defer(line).await?;
        Ok(())
    }

    /// Ask for the peer list.
    pub async fn request_status(&self) -> Result<()> {
        self.send_command(Command::Status).await
    }

    /// Ask for a peer's storage listing.
    pub async fn look(&self, peer: PeerId) -> Result<()> {
        self.send_command(Command::Look { peer }).await
    }

    /// Ask a peer to send us a file or folder.
    pub async fn download(&self, peer: PeerId, path: &str) -> Result<()> {
        let path = path.trim();
        if path.is_empty() {
            return Err(Error::Protocol("usage: /download <peerId> <path>".into()));
        }
        self.send_command(Command::DownloadRequest { peer, path: path.to_string() })
            .await
    }

    /// Leave the chat and close the write half.
    pub async fn exit(&self) -> Result<()> {
        self.inner.transport.send_line(&Command::Exit.to_string()).await?;
        self.inner.transport.shutdown().await;
        Ok(())
    }

    /// All transfers of this session.
    pub async fn transfers(&self) -> Vec<Arc<Transfer>> {
        self.inner.transfers.list().await
    }

    /// Pause a transfer.
    pub async fn pause(&self, id: TransferId) -> Result<()> {
        self.inner.transfers.pause(id).await
    }

    /// Resume a paused transfer.
    pub async fn resume(&self, id: TransferId) -> Result<()> {
        self.inner.transfers.resume(id).await
    }

    /// Send a file to a peer on a background task.
    pub async fn send_file(&self, to: PeerId, path: &Path) -> Result<Arc<Transfer>> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::resource(path, e))?;
        if !meta.is_file() {
            return Err(Error::Resource(format!("{} is not a file", path.display())));
        }
        let name = wire_name(path)?;
        let checksum = file_checksum(path).await?;
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::resource(path, e))?;

        let size = meta.len();
        let header = Command::FileRequest {
            peer: to,
            name: name.clone(),
            size,
            checksum: Some(checksum.clone()),
        };
        let transfer = self
            .inner
            .transfers
            .begin(TransferSpec {
                kind: TransferKind::File,
                name,
                size,
                direction: Direction::Outbound,
                peer: to,
                checksum: Some(checksum),
            })
            .await;

        self.spawn_send(header, file, Arc::clone(&transfer), None);
        Ok(transfer)
    }

    /// Zip a folder and send it to a peer on a background task.
    pub async fn send_folder(&self, to: PeerId, path: &Path) -> Result<Arc<Transfer>> {
        let name = wire_name(path)?;
        let packed = pack_folder(path).await?;
        let archive = packed.open().await?;

        let size = packed.size();
        let header = Command::FolderRequest { peer: to, name: name.clone(), size };
        let transfer = self
            .inner
            .transfers
            .begin(TransferSpec {
                kind: TransferKind::Folder,
                name,
                size,
                direction: Direction::Outbound,
                peer: to,
                checksum: None,
            })
            .await;

        self.spawn_send(header, archive, Arc::clone(&transfer), Some(packed));
        Ok(transfer)
    }

    /// Serve a download request from another peer.
    pub(crate) async fn serve_download(&self, requester: PeerId, path: &str) -> Result<Arc<Transfer>> {
        let resolved = resolve_in(&self.inner.storage_root, path)?;
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| Error::resource(&resolved, e))?;
        if meta.is_dir() {
            self.send_folder(requester, &resolved).await
        } else {
            self.send_file(requester, &resolved).await
        }
    }

    fn spawn_send<S>(
        &self,
        header: Command,
        source: S,
        transfer: Arc<Transfer>,
        keep_alive: Option<crate::transfer::PackedFolder>,
    ) where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let client = self.clone();
        tokio::spawn(async move {
            client
                .emit(ClientEvent::TransferStarted {
                    id: transfer.id,
                    name: transfer.name.clone(),
                    size: transfer.declared_size,
                })
                .await;

            let event = match client.stream_payload(&header, source, &transfer).await {
                Ok(()) => ClientEvent::TransferFinished {
                    id: transfer.id,
                    name: transfer.name.clone(),
                },
                Err(e) => ClientEvent::TransferFailed {
                    name: transfer.name.clone(),
                    error: e.to_string(),
                },
            };
            drop(keep_alive);
            client.emit(event).await;
        });
    }

    /// Write a request header and its payload while holding the writer.
    async fn stream_payload<S>(&self, header: &Command, mut source: S, transfer: &Transfer) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let size = transfer.declared_size;
        let mut writer = self.inner.transport.lock().await;
        crate::protocol::write_line(&mut *writer, &header.to_string()).await?;

        match copy_exact(&mut source, &mut *writer, size, Some(transfer)).await {
            Ok(_) => {
                drop(writer);
                transfer.complete()?;
                info!(transfer = %transfer.id, name = %transfer.name, size, "Transfer sent");
                Ok(())
            }
            Err(e @ RelayError::Sink { .. }) => {
                transfer.fail();
                Err(e.into())
            }
            Err(e) => {
                // The local file changed under us; keep the stream framed.
                pad_zeros(&mut *writer, size - e.consumed()).await?;
                drop(writer);
                transfer.fail();
                warn!(transfer = %transfer.id, error = %e, "Local source ended early");
                Err(e.into())
            }
        }
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        self.inner.transport.send_line_or_defer(command.to_string()).await?;
        Ok(())
    }

    fn cipher(&self) -> Option<&MessageCipher> {
        self.inner.cipher.as_deref()
    }

    fn transport(&self) -> &Arc<Transport> {
        &self.inner.transport
    }

    fn transfer_manager(&self) -> &TransferManager {
        &self.inner.transfers
    }

    async fn emit(&self, event: ClientEvent) {
        if self.inner.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }
}

/// Resolve a requested path inside `root`.
///
/// Relative paths are joined onto the root. Absolute paths must already
/// lie under it. Parent and root components are refused, so a peer can
/// only download what the storage root shares.
fn resolve_in(root: &Path, requested: &str) -> Result<PathBuf> {
    let requested = Path::new(requested.trim());
    let outside = || Error::Resource(format!("{} is outside the shared storage", requested.display()));
    let relative = if requested.is_absolute() {
        requested.strip_prefix(root).map_err(|_| outside())?
    } else {
        requested
    };

    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(outside()),
        }
    }
    Ok(resolved)
}

/// File or folder name as a single protocol token.
fn wire_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Resource(format!("{} has no usable name", path.display())))?;
    let name: String = name
        .chars()
        .map(|c| if c.is_whitespace() || c == crate::protocol::CHECKSUM_SEPARATOR { '_' } else { c })
        .collect();
    if is_valid_token(&name) {
        Ok(name)
    } else {
        Err(Error::Resource(format!("{} has no usable name", path.display())))
    }
}
