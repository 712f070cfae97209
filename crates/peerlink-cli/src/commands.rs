//! Interactive session: prompts, the input loop and event printing.

use anyhow::{bail, Context, Result};
use peerlink_core::client::{
    dial, ChecksumStatus, Client, ClientEvent, Connection, HandshakeOutcome, Intent, HELP_TEXT,
};
use peerlink_core::config::ClientConfig;
use peerlink_core::crypto::MessageCipher;
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Line-oriented terminal input.
pub struct Input {
    lines: Lines<BufReader<Stdin>>,
}

impl Input {
    pub fn stdin() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next line, trimmed. `None` at end of input.
    async fn next(&mut self) -> Result<Option<String>> {
        let line = self.lines.next_line().await.context("Failed to read input")?;
        Ok(line.map(|l| l.trim().to_string()))
    }

    /// Print a prompt and read the answer.
    async fn prompt(&mut self, text: &str) -> Result<String> {
        print!("{}", text);
        std::io::stdout().flush().ok();
        match self.next().await? {
            Some(answer) => Ok(answer),
            None => bail!("Input closed"),
        }
    }
}

/// Expand `~` in a user-supplied path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path.trim()).as_ref())
}

/// Ask for a server address until one is reachable or the user gives up.
///
/// The stream that proved the server reachable is returned for the
/// session to run on.
pub async fn prompt_server(input: &mut Input) -> Result<(ClientConfig, TcpStream)> {
    loop {
        let addr = input.prompt("Server address (host:port): ").await?;
        if addr.is_empty() {
            continue;
        }

        let config = ClientConfig::new(addr.clone());
        match dial(&config).await {
            Ok(stream) => {
                if let Ok(peer) = stream.peer_addr() {
                    debug!(addr = %peer, "Server reachable");
                }
                return Ok((config, stream));
            }
            Err(e) => {
                println!("Cannot reach {}: {}", addr, e);
                let answer = input.prompt("Try again? (y/n): ").await?;
                if !answer.eq_ignore_ascii_case("y") {
                    bail!("No server selected");
                }
            }
        }
    }
}

/// Connect unless already connected, register or resume, then run the
/// session until exit.
pub async fn run(
    config: ClientConfig,
    stream: Option<TcpStream>,
    cipher: Option<MessageCipher>,
    storage: Option<PathBuf>,
    input: &mut Input,
) -> Result<()> {
    let mut connection = match stream {
        Some(stream) => Connection::from_stream(stream, config, cipher),
        None => {
            let server = config.server_addr.clone();
            Connection::open(config, cipher)
                .await
                .with_context(|| format!("Failed to connect to {}", server))?
        }
    };

    let (outcome, storage_root) = match connection.await_reconnect().await? {
        Some(outcome) => {
            println!("Welcome back {}!", outcome.name());
            let root = match storage {
                Some(root) => root,
                None => std::env::current_dir().context("Failed to resolve current directory")?,
            };
            (outcome, root)
        }
        None => register(&mut connection, storage, input).await?,
    };

    if let HandshakeOutcome::Registered { id, name } = &outcome {
        println!("Welcome {}! Your id is {}. Type /help for commands.", name, id);
    }

    let (client, events, _reader) = connection.start(&outcome, storage_root);
    session(client, events, input).await
}

async fn register<R>(
    connection: &mut Connection<R>,
    storage: Option<PathBuf>,
    input: &mut Input,
) -> Result<(HandshakeOutcome, PathBuf)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let name = loop {
        let name = input.prompt("Enter your username: ").await?;
        if !name.is_empty() {
            break name;
        }
    };

    let root = match storage {
        Some(root) => root,
        None => loop {
            let root = input.prompt("Enter your storage path: ").await?;
            if !root.is_empty() {
                break expand_path(&root);
            }
        },
    };
    if !root.is_dir() {
        warn!(path = %root.display(), "Storage path is not a directory yet");
    }

    let outcome = connection
        .register(&name, &root.to_string_lossy())
        .await
        .context("Registration failed")?;
    Ok((outcome, root))
}

async fn session(
    client: Client,
    events: mpsc::Receiver<ClientEvent>,
    input: &mut Input,
) -> Result<()> {
    let mut printer = tokio::spawn(print_events(events));

    loop {
        let line = tokio::select! {
            line = input.next() => line?,
            _ = &mut printer => {
                println!("Disconnected from server");
                return Ok(());
            }
        };
        let Some(line) = line else {
            client.exit().await.ok();
            return Ok(());
        };

        let intent = match Intent::parse(&line) {
            Ok(intent) => intent,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };

        if let Intent::Exit = intent {
            if let Err(e) = client.exit().await {
                debug!(error = %e, "Exit notice not sent");
            }
            println!("Goodbye!");
            return Ok(());
        }

        if let Err(e) = dispatch(&client, intent).await {
            println!("Error: {}", e);
        }
    }
}

async fn dispatch(client: &Client, intent: Intent) -> peerlink_core::Result<()> {
    match intent {
        Intent::Chat(text) => client.send_chat(&text).await?,
        Intent::SendFile { to, path } => {
            let transfer = client.send_file(to, &expand_path(&path.to_string_lossy())).await?;
            println!("Transfer {} queued: {} to user {}", transfer.id, transfer.name, to);
        }
        Intent::SendFolder { to, path } => {
            println!("Packing {} ...", path.display());
            let transfer = client.send_folder(to, &expand_path(&path.to_string_lossy())).await?;
            println!("Transfer {} queued: {} to user {}", transfer.id, transfer.name, to);
        }
        Intent::Download { from, path } => {
            client.download(from, &path).await?;
            println!("Asked user {} for {}", from, path);
        }
        Intent::Look(peer) => client.look(peer).await?,
        Intent::Status => client.request_status().await?,
        Intent::Transfers => {
            let transfers = client.transfers().await;
            if transfers.is_empty() {
                println!("No transfers");
            }
            for transfer in transfers {
                println!("{}", transfer.summary());
            }
        }
        Intent::Pause(id) => {
            client.pause(id).await?;
            println!("Transfer {} paused", id);
        }
        Intent::Resume(id) => {
            client.resume(id).await?;
            println!("Transfer {} resumed", id);
        }
        Intent::Help => println!("{}", HELP_TEXT),
        Intent::Exit | Intent::Nothing => {}
    }
    Ok(())
}

/// Print events until the server goes away.
async fn print_events(mut events: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        if let ClientEvent::Disconnected = event {
            return;
        }
        println!("{}", describe(&event));
    }
}

fn describe(event: &ClientEvent) -> String {
    match event {
        ClientEvent::Chat(text) => text.clone(),
        ClientEvent::Error(text) => format!("Error: {}", text),
        ClientEvent::Status(lines) => {
            let mut out = format!("Users ({}):", lines.len());
            for line in lines {
                out.push_str("\n  ");
                out.push_str(line);
            }
            out
        }
        ClientEvent::FileReceived { from, path, size, checksum } => {
            let verdict = match checksum {
                ChecksumStatus::Verified => "checksum verified".to_string(),
                ChecksumStatus::Mismatch(reason) => format!("CHECKSUM MISMATCH: {}", reason),
                ChecksumStatus::NotDeclared => "no checksum".to_string(),
            };
            format!(
                "Received file from user {}: {} ({} bytes, {})",
                from,
                path.display(),
                size,
                verdict
            )
        }
        ClientEvent::FolderReceived { from, path, size } => format!(
            "Received folder from user {}: {} ({} bytes zipped)",
            from,
            path.display(),
            size
        ),
        ClientEvent::Listing { from, text } => format!("Storage of user {}:\n{}", from, text),
        ClientEvent::LookServed { requester } => {
            format!("User {} looked at your storage", requester)
        }
        ClientEvent::DownloadRequested { requester, path } => {
            format!("User {} requested {}", requester, path)
        }
        ClientEvent::TransferStarted { id, name, size } => {
            format!("Transfer {} started: {} ({} bytes)", id, name, size)
        }
        ClientEvent::TransferFinished { id, name } => format!("Transfer {} finished: {}", id, name),
        ClientEvent::TransferFailed { name, error } => {
            format!("Transfer of {} failed: {}", name, error)
        }
        ClientEvent::Disconnected => "Disconnected from server".to_string(),
    }
}
