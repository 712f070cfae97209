//! Per-connection session: handshake, then the command dispatch loop.

use super::ServerState;
use crate::crypto::open;
use crate::error::{Error, Result};
use crate::logging::Preview;
use crate::message::{ChatMessage, Notice};
use crate::protocol::{error_line, read_line, write_line, Command, USERS_SENTINEL};
use crate::registry::Peer;
use crate::transfer::{
    copy_exact, drain_exact, pad_zeros, Direction, TransferKind, TransferSpec,
};
use crate::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::{debug, info, warn};

/// Run one connection to completion.
///
/// Errors end only this session. The peer is marked offline and a
/// departure notice is broadcast once the loop stops.
pub async fn serve_connection<R, W>(
    state: Arc<ServerState>,
    reader: R,
    writer: W,
    remote: Option<SocketAddr>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let transport = Arc::new(Transport::new(writer, remote));
    let mut session = Session {
        state,
        reader: BufReader::new(reader),
        transport,
    };

    let peer = match session.handshake().await? {
        Some(peer) => peer,
        None => {
            debug!(?remote, "Connection closed during handshake");
            return Ok(());
        }
    };

    let result = session.dispatch_loop(&peer).await;
    session.state.broadcaster.depart(&peer).await;
    session.transport.shutdown().await;

    match result {
        Err(e) if e.is_disconnect() => {
            debug!(peer = %peer.id, error = %e, "Session closed by transport");
            Ok(())
        }
        other => other,
    }
}

struct Session<R> {
    state: Arc<ServerState>,
    reader: BufReader<R>,
    transport: Arc<Transport>,
}

/// Why the dispatch loop stopped.
enum Flow {
    Continue,
    Exit,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Register or reactivate the peer. `None` if the stream ended first.
    async fn handshake(&mut self) -> Result<Option<Peer>> {
        if let Some(peer) = self.try_reconnect().await? {
            return Ok(Some(peer));
        }

        let name = match self.read_credential("username").await? {
            Some(name) => name,
            None => return Ok(None),
        };
        let storage_root = match self.read_credential("storage root").await? {
            Some(root) => root,
            None => return Ok(None),
        };

        // Hold the writer until the welcome is out, so no broadcast can
        // reach the client ahead of it.
        let registry = &self.state.registry;
        let mut writer = self.transport.lock().await;
        let id = registry.allocate_id();
        let peer = registry
            .register(Peer::new(id, name, storage_root, Arc::clone(&self.transport)))
            .await?;
        let welcome = Command::Welcome { id, name: peer.name.clone() }.to_string();
        write_line(&mut *writer, &welcome).await?;
        drop(writer);
        info!(peer = %id, name = %peer.name, remote = ?self.transport.remote(), "New user connected");
        self.state
            .broadcaster
            .announce(&Notice::Joined(peer.name.clone()).to_string())
            .await?;

        Ok(Some(peer))
    }

    /// Reactivate an offline peer last seen at this connection's address.
    async fn try_reconnect(&mut self) -> Result<Option<Peer>> {
        if !self.state.config.reconnect_by_address {
            return Ok(None);
        }
        let Some(ip) = self.transport.remote().map(|addr| addr.ip()) else {
            return Ok(None);
        };
        let Some(id) = self.state.registry.find_offline_by_addr(ip).await else {
            return Ok(None);
        };

        let mut writer = self.transport.lock().await;
        let peer = match self.state.registry.reactivate(id, Arc::clone(&self.transport)).await {
            Ok(peer) => peer,
            Err(e) => {
                debug!(peer = %id, error = %e, "Reconnect lost a race");
                return Ok(None);
            }
        };
        let signal = Command::Reconnect { name: peer.name.clone(), id }.to_string();
        write_line(&mut *writer, &signal).await?;
        drop(writer);
        info!(peer = %id, name = %peer.name, "User reconnected");
        self.state
            .broadcaster
            .announce(&Notice::BackOnline(peer.name.clone()).to_string())
            .await?;

        Ok(Some(peer))
    }

    async fn read_credential(&mut self, what: &str) -> Result<Option<String>> {
        let Some(line) = read_line(&mut self.reader, self.state.config.max_line_len).await? else {
            return Ok(None);
        };

        let value = match open(self.state.broadcaster.cipher(), &line) {
            Ok(value) => value.trim().to_string(),
            Err(e) => {
                warn!(remote = ?self.transport.remote(), error = %e, "Handshake rejected");
                let _ = self.transport.send_line(&error_line("handshake rejected")).await;
                return Err(e);
            }
        };

        if value.is_empty() {
            let _ = self
                .transport
                .send_line(&error_line(format!("{} must not be empty", what)))
                .await;
            return Err(Error::Protocol(format!("empty {}", what)));
        }
        Ok(Some(value))
    }

    async fn dispatch_loop(&mut self, peer: &Peer) -> Result<()> {
        loop {
            let line = match read_line(&mut self.reader, self.state.config.max_line_len).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!(peer = %peer.id, name = %peer.name, "User disconnected");
                    return Ok(());
                }
                Err(Error::Protocol(reason)) => {
                    // Oversized or non-UTF-8 line: framing is lost.
                    warn!(peer = %peer.id, reason = %reason, "Closing session on unreadable line");
                    let _ = self.reply_error(peer, &reason).await;
                    return Err(Error::Protocol(reason));
                }
                Err(e) => return Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let command = match Command::parse_request(&line) {
                Ok(command) => command,
                Err(e) => {
                    warn!(peer = %peer.id, line = %Preview(&line), error = %e, "Skipping malformed command");
                    self.reply_error(peer, &e.to_string()).await?;
                    continue;
                }
            };

            match self.dispatch(peer, command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => {
                    info!(peer = %peer.id, name = %peer.name, "User left");
                    return Ok(());
                }
                Err(e) if e.is_disconnect() => return Err(e),
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "Command failed");
                    self.reply_error(peer, &user_facing(&e)).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, peer: &Peer, command: Command) -> Result<Flow> {
        match command {
            Command::Chat(line) => self.handle_chat(peer, &line).await?,
            Command::Exit => return Ok(Flow::Exit),
            Command::Ping => {
                self.transport.send_line_or_defer(Command::Pong.to_string()).await?;
            }
            Command::Pong => debug!(peer = %peer.id, "PONG"),
            Command::Status => self.handle_status(peer).await?,
            Command::FileRequest { peer: to, name, size, checksum } => {
                let spec = TransferSpec {
                    kind: TransferKind::File,
                    name,
                    size,
                    direction: Direction::Relay,
                    peer: to,
                    checksum,
                };
                self.relay(peer, spec).await?;
            }
            Command::FolderRequest { peer: to, name, size } => {
                let spec = TransferSpec {
                    kind: TransferKind::Folder,
                    name,
                    size,
                    direction: Direction::Relay,
                    peer: to,
                    checksum: None,
                };
                self.relay(peer, spec).await?;
            }
            Command::LookResponse { peer: requester, size } => {
                let spec = TransferSpec {
                    kind: TransferKind::Listing,
                    name: format!("listing of {}", peer.name),
                    size,
                    direction: Direction::Relay,
                    peer: requester,
                    checksum: None,
                };
                self.relay(peer, spec).await?;
            }
            Command::Look { peer: target } => {
                let target = self.state.registry.get_online(target).await?;
                let request = Command::LookRequest {
                    storage_root: target.storage_root.clone(),
                    requester: peer.id,
                };
                target.transport.send_line_or_defer(request.to_string()).await?;
                debug!(from = %peer.id, to = %target.id, "Lookup forwarded");
            }
            Command::DownloadRequest { peer: target, path } => {
                let target = self.state.registry.get_online(target).await?;
                let request = Command::DownloadRequest { peer: peer.id, path };
                target.transport.send_line_or_defer(request.to_string()).await?;
                debug!(from = %peer.id, to = %target.id, "Download request forwarded");
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected command from client: {}",
                    Preview(&other.to_string())
                )));
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_chat(&mut self, peer: &Peer, line: &str) -> Result<()> {
        let content = open(self.state.broadcaster.cipher(), line)?;
        let message = ChatMessage::new(peer.id, peer.name.clone(), content);
        debug!(peer = %peer.id, content = %Preview(&message.content), "Chat message");
        self.state.broadcaster.announce(&message.render()).await?;
        Ok(())
    }

    async fn handle_status(&mut self, peer: &Peer) -> Result<()> {
        let peers = self.state.registry.snapshot_all().await;
        let mut reply = format!("{} {}", USERS_SENTINEL, peers.len());
        for known in &peers {
            reply.push('\n');
            reply.push_str(&known.status_line());
        }
        self.transport.send_line_or_defer(reply).await?;
        debug!(peer = %peer.id, count = peers.len(), "Status sent");
        Ok(())
    }

    /// Forward exactly `spec.size` payload bytes from this session to the
    /// peer named in `spec.peer`.
    ///
    /// The sender's stream stays framed whatever happens to the recipient:
    /// undeliverable bytes are drained. The recipient's stream stays
    /// framed whatever happens to the sender: missing bytes are zero
    /// padded and followed by an error notice.
    async fn relay(&mut self, sender: &Peer, spec: TransferSpec) -> Result<()> {
        let size = spec.size;
        let recipient = match self.state.registry.get_online(spec.peer).await {
            Ok(recipient) => recipient,
            Err(e) => {
                let drained = drain_exact(&mut self.reader, size).await?;
                if drained < size {
                    return Err(Error::Transport("sender closed while sending payload".into()));
                }
                warn!(from = %sender.id, to = %spec.peer, size, "Recipient unavailable, payload discarded");
                return Err(e);
            }
        };

        let header = match spec.kind {
            TransferKind::File => Command::FileResponse {
                peer: sender.id,
                name: spec.name.clone(),
                checksum: spec.checksum.clone(),
                size,
                storage_root: recipient.storage_root.clone(),
            },
            TransferKind::Folder => Command::FolderResponse {
                peer: sender.id,
                name: spec.name.clone(),
                size,
                storage_root: recipient.storage_root.clone(),
            },
            TransferKind::Listing => Command::LookResponse { peer: sender.id, size },
        };

        let transfer = self.state.transfers.begin(spec).await;
        info!(
            transfer = %transfer.id,
            kind = %transfer.kind,
            from = %sender.id,
            to = %recipient.id,
            size,
            "Relaying payload"
        );

        let mut writer = recipient.transport.lock().await;
        let outcome = match write_line(&mut *writer, &header.to_string()).await {
            Ok(()) => copy_exact(&mut self.reader, &mut *writer, size, Some(&transfer))
                .await
                .map_err(Some),
            Err(e) => {
                debug!(to = %recipient.id, error = %e, "Recipient header write failed");
                Err(None)
            }
        };

        let result = match outcome {
            Ok(moved) => {
                drop(writer);
                let done = transfer.complete();
                debug!(transfer = %transfer.id, moved, "Relay complete");
                done
            }
            Err(Some(e)) if e.is_source() => {
                let missing = size - e.consumed();
                if let Err(pad) = pad_zeros(&mut *writer, missing).await {
                    debug!(to = %recipient.id, error = %pad, "Padding failed");
                }
                drop(writer);
                transfer.fail();
                warn!(transfer = %transfer.id, error = %e, "Sender stream broke mid-relay");
                let notice = format!("transfer of {} from {} failed: {}", transfer.name, sender.name, e);
                if let Err(e) = self.state.broadcaster.notify(&recipient, &error_line(notice)).await {
                    debug!(to = %recipient.id, error = %e, "Failure notice not delivered");
                }
                Err(Error::Transport(e.to_string()))
            }
            Err(sink) => {
                drop(writer);
                let consumed = sink.as_ref().map_or(0, |e| e.consumed());
                let drained = drain_exact(&mut self.reader, size - consumed).await?;
                transfer.fail();
                self.state.broadcaster.demote(&[recipient.id]).await;
                if consumed + drained < size {
                    Err(Error::Transport("sender closed while sending payload".into()))
                } else {
                    Err(Error::NotFound(format!("user {} went offline during transfer", recipient.id)))
                }
            }
        };

        self.state.transfers.remove(transfer.id).await;
        result
    }

    async fn reply_error(&self, peer: &Peer, text: &str) -> Result<()> {
        self.state
            .broadcaster
            .notify(peer, &error_line(text))
            .await
            .map(|_| ())
    }
}

/// Text of an error as shown to the peer that caused it.
fn user_facing(e: &Error) -> String {
    match e {
        Error::NotFound(what) | Error::Resource(what) => what.clone(),
        other => other.to_string(),
    }
}
