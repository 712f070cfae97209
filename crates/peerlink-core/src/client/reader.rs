//! Client read loop.

use super::{ChecksumStatus, Client, ClientEvent};
use crate::crypto::{is_sealed, open};
use crate::error::{Error, Result};
use crate::lookup::list_storage;
use crate::protocol::{read_line, Command, ERROR_PREFIX};
use crate::registry::PeerId;
use crate::transfer::{
    copy_exact, drain_exact, sanitize_name, unpack_archive, verify_file, Direction, RelayError,
    TransferKind, TransferSpec,
};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tracing::{debug, info, warn};

pub(super) struct ReadLoop<R> {
    client: Client,
    reader: BufReader<R>,
    max_line_len: usize,
}

/// Header fields of an inbound file or folder.
struct Inbound {
    kind: TransferKind,
    from: PeerId,
    name: String,
    size: u64,
    checksum: Option<String>,
    storage_root: String,
}

impl<R> ReadLoop<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub(super) fn new(client: Client, reader: BufReader<R>, max_line_len: usize) -> Self {
        Self {
            client,
            reader,
            max_line_len,
        }
    }

    pub(super) async fn run(mut self) {
        if let Err(e) = self.read_loop().await {
            warn!(error = %e, "Read loop stopped");
        }
        self.client.emit(ClientEvent::Disconnected).await;
    }

    async fn read_loop(&mut self) -> Result<()> {
        while let Some(line) = read_line(&mut self.reader, self.max_line_len).await? {
            if line.is_empty() {
                continue;
            }
            match Command::parse(&line) {
                Ok(command) => self.handle(command).await?,
                Err(e) => {
                    debug!(error = %e, "Unparseable line from server");
                    self.client.emit(ClientEvent::Error(e.to_string())).await;
                }
            }
        }
        info!("Server closed the connection");
        Ok(())
    }

    async fn handle(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Ping => {
                self.client
                    .transport()
                    .send_line_or_defer(Command::Pong.to_string())
                    .await?;
            }
            Command::Chat(line) => handle_chat(&self.client, &line).await,
            Command::Users { count } => {
                let mut lines = Vec::with_capacity(count);
                for _ in 0..count {
                    match read_line(&mut self.reader, self.max_line_len).await? {
                        Some(line) => lines.push(line),
                        None => return Err(Error::Transport("status reply cut short".into())),
                    }
                }
                self.client.emit(ClientEvent::Status(lines)).await;
            }
            Command::FileResponse { peer, name, checksum, size, storage_root } => {
                let inbound = Inbound {
                    kind: TransferKind::File,
                    from: peer,
                    name,
                    size,
                    checksum,
                    storage_root,
                };
                self.receive(inbound).await?;
            }
            Command::FolderResponse { peer, name, size, storage_root } => {
                let inbound = Inbound {
                    kind: TransferKind::Folder,
                    from: peer,
                    name,
                    size,
                    checksum: None,
                    storage_root,
                };
                self.receive(inbound).await?;
            }
            Command::LookResponse { peer, size } => {
                let mut payload = Vec::new();
                let read = (&mut self.reader).take(size).read_to_end(&mut payload).await?;
                if (read as u64) < size {
                    return Err(Error::Transport("listing cut short".into()));
                }
                let text = String::from_utf8_lossy(&payload).into_owned();
                self.client.emit(ClientEvent::Listing { from: peer, text }).await;
            }
            Command::LookRequest { storage_root, requester } => {
                let client = self.client.clone();
                tokio::spawn(async move { serve_listing(client, storage_root, requester).await });
            }
            Command::DownloadRequest { peer, path } => {
                self.client
                    .emit(ClientEvent::DownloadRequested { requester: peer, path: path.clone() })
                    .await;
                let client = self.client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.serve_download(peer, &path).await {
                        warn!(requester = %peer, path = %path, error = %e, "Download request failed");
                        client
                            .emit(ClientEvent::TransferFailed { name: path, error: e.to_string() })
                            .await;
                    }
                });
            }
            other => debug!(command = %other, "Ignoring command"),
        }
        Ok(())
    }

    /// Write an inbound payload to local storage.
    ///
    /// The payload is always consumed in full, so a local write failure
    /// never desynchronises the stream.
    async fn receive(&mut self, inbound: Inbound) -> Result<()> {
        let root = if inbound.storage_root.trim().is_empty() {
            self.client.storage_root().to_path_buf()
        } else {
            PathBuf::from(inbound.storage_root.trim())
        };
        let name = sanitize_name(&inbound.name);
        let target = match inbound.kind {
            TransferKind::Folder => root.join(format!("{}.zip", name)),
            _ => root.join(&name),
        };

        let transfer = self
            .client
            .transfer_manager()
            .begin(TransferSpec {
                kind: inbound.kind,
                name: name.clone(),
                size: inbound.size,
                direction: Direction::Inbound,
                peer: inbound.from,
                checksum: inbound.checksum.clone(),
            })
            .await;
        self.client
            .emit(ClientEvent::TransferStarted {
                id: transfer.id,
                name: name.clone(),
                size: inbound.size,
            })
            .await;

        let mut file = match create_file(&target).await {
            Ok(file) => file,
            Err(e) => {
                drain_exact(&mut self.reader, inbound.size).await?;
                transfer.fail();
                report_failure(&self.client, &name, e).await;
                return Ok(());
            }
        };

        match copy_exact(&mut self.reader, &mut file, inbound.size, Some(&transfer)).await {
            Ok(_) => {}
            Err(RelayError::Sink { moved, source }) => {
                drain_exact(&mut self.reader, inbound.size - moved).await?;
                transfer.fail();
                report_failure(&self.client, &name, Error::resource(&target, source)).await;
                return Ok(());
            }
            Err(e) => {
                transfer.fail();
                return Err(e.into());
            }
        }
        drop(file);
        // The stream is framed past the payload; a bookkeeping error only
        // affects this transfer.
        if let Err(e) = transfer.complete() {
            report_failure(&self.client, &name, e).await;
            return Ok(());
        }

        let event = match inbound.kind {
            TransferKind::Folder => {
                let dest = root.join(&name);
                let unpacked = unpack_archive(&target, &dest).await;
                if let Err(e) = tokio::fs::remove_file(&target).await {
                    debug!(path = %target.display(), error = %e, "Could not remove archive");
                }
                match unpacked {
                    Ok(()) => ClientEvent::FolderReceived {
                        from: inbound.from,
                        path: dest,
                        size: inbound.size,
                    },
                    Err(e) => ClientEvent::TransferFailed { name, error: e.to_string() },
                }
            }
            _ => {
                let checksum = match inbound.checksum.as_deref() {
                    None => ChecksumStatus::NotDeclared,
                    Some(expected) => match verify_file(&target, expected).await {
                        Ok(()) => ChecksumStatus::Verified,
                        Err(e) => {
                            warn!(path = %target.display(), error = %e, "Checksum mismatch");
                            ChecksumStatus::Mismatch(e.to_string())
                        }
                    },
                };
                ClientEvent::FileReceived {
                    from: inbound.from,
                    path: target,
                    size: inbound.size,
                    checksum,
                }
            }
        };

        info!(transfer = %transfer.id, name = %transfer.name, size = inbound.size, "Transfer received");
        self.client.emit(event).await;
        Ok(())
    }
}

/// Report a chat line or notice, opening it if sealed.
async fn handle_chat(client: &Client, line: &str) {
    let event = match open(client.cipher(), line) {
        Ok(text) => match text.strip_prefix(ERROR_PREFIX) {
            Some(reason) => ClientEvent::Error(reason.to_string()),
            None => ClientEvent::Chat(text),
        },
        Err(e) if !is_sealed(line) && line.starts_with(ERROR_PREFIX) => {
            debug!(error = %e, "Accepting unsealed error notice");
            ClientEvent::Error(line[ERROR_PREFIX.len()..].to_string())
        }
        Err(e) => {
            warn!(error = %e, "Dropping line that failed to open");
            ClientEvent::Error(format!("unreadable message ({})", e))
        }
    };
    client.emit(event).await;
}

async fn report_failure(client: &Client, name: &str, e: Error) {
    warn!(name = %name, error = %e, "Inbound transfer failed");
    client
        .emit(ClientEvent::TransferFailed { name: name.to_string(), error: e.to_string() })
        .await;
}

async fn create_file(path: &Path) -> Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::resource(parent, e))?;
    }
    tokio::fs::File::create(path)
        .await
        .map_err(|e| Error::resource(path, e))
}

/// Answer a `/LOOK_REQUEST` with a listing, or with the error that
/// prevented one.
async fn serve_listing(client: Client, storage_root: String, requester: PeerId) {
    let text = match list_storage(Path::new(storage_root.trim())).await {
        Ok(text) => text,
        Err(e) => format!("{}{}", ERROR_PREFIX, e),
    };
    let header = Command::LookResponse {
        peer: requester,
        size: text.len() as u64,
    };
    match client.transport().send_blob(&header.to_string(), text.as_bytes()).await {
        Ok(()) => client.emit(ClientEvent::LookServed { requester }).await,
        Err(e) => warn!(requester = %requester, error = %e, "Listing not sent"),
    }
}
