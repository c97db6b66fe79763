//! Connection Dispatcher (sender side)
//!
//! The server loads one file before it starts listening and serves that
//! same content to every receiver that connects:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Accept loop                          │
//! │  - one tokio task per connection                        │
//! │  - unbounded unless max_sessions is set                 │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Sender session (per task)               │
//! │  - DH sender half (fresh or pooled parameters)          │
//! │  - AES-128 encrypt shared content under session key     │
//! │  - filename unit, then chunked ciphertext + terminator  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Sessions share only the [`SharedFile`], which is immutable after load.
//! A failing session is logged and its socket dropped; the accept loop and
//! the other sessions carry on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::cipher;
use crate::error::TransferError;
use crate::key_exchange::{self, ParameterMode, ParameterSource};
use crate::protocol::{
    calculate_hash, validate_filename, ChunkedTransport, TextFramer, MAX_FRAME_SIZE,
};
use crate::session::{Role, SessionProgress, SessionState};
use crate::store::{file_name_of, FileStore};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// File served to every receiver
    pub file_path: PathBuf,
    /// Maximum chunk size per frame
    pub frame_size: usize,
    /// Where DH parameters come from
    pub parameters: ParameterMode,
    /// Concurrent session cap; `None` accepts without limit
    pub max_sessions: Option<usize>,
    /// Deadline for a whole session; `None` waits on slow peers forever
    pub session_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, file_path: PathBuf) -> Self {
        Self {
            bind_addr,
            file_path,
            frame_size: MAX_FRAME_SIZE,
            parameters: ParameterMode::default(),
            max_sessions: None,
            session_timeout: None,
        }
    }
}

/// Filename and content loaded once, read by every session
#[derive(Debug)]
pub struct SharedFile {
    pub name: String,
    pub content: Vec<u8>,
}

/// Outcome of one completed sender session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peer: SocketAddr,
    pub frames_sent: usize,
}

/// File sending server
pub struct Server {
    listener: TcpListener,
    file: Arc<SharedFile>,
    parameters: Arc<ParameterSource>,
    transport: ChunkedTransport,
    session_limit: Option<Arc<Semaphore>>,
    session_timeout: Option<Duration>,
}

impl Server {
    /// Load the file, prepare parameters, and bind the listening socket
    pub async fn bind<S: FileStore>(config: ServerConfig, store: &S) -> Result<Self> {
        let content = store
            .read(&config.file_path)
            .await
            .with_context(|| format!("Failed to load {:?}", config.file_path))?;
        let name = file_name_of(&config.file_path)
            .with_context(|| format!("No filename in {:?}", config.file_path))?;

        info!(
            "📄 Loaded {} ({} bytes, sha256: {})",
            name,
            content.len(),
            calculate_hash(&content)
        );

        let parameters = ParameterSource::from_mode(config.parameters)
            .await
            .context("Failed to prepare DH parameters")?;
        Self::bind_with(config, SharedFile { name, content }, parameters).await
    }

    /// Bind with an already loaded file and parameter source.
    ///
    /// Fails before listening if receivers would refuse the file's name.
    pub async fn bind_with(
        config: ServerConfig,
        file: SharedFile,
        parameters: ParameterSource,
    ) -> Result<Self> {
        validate_filename(&file.name)
            .with_context(|| format!("Cannot serve {:?} under that name", file.name))?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

        if config.max_sessions.is_none() {
            debug!("No session cap configured; every connection gets its own task");
        }

        Ok(Self {
            listener,
            file: Arc::new(file),
            parameters: Arc::new(parameters),
            transport: ChunkedTransport::new(config.frame_size),
            session_limit: config.max_sessions.map(|n| Arc::new(Semaphore::new(n))),
            session_timeout: config.session_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Accept connections forever
    pub async fn run(self) -> Result<()> {
        info!(
            "🔒 Serving {} on {}",
            self.file.name,
            self.local_addr()?
        );
        if self.parameters.is_per_connection() {
            info!("🔑 Generating fresh DH parameters for every connection");
        }

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let permit = match &self.session_limit {
                Some(limit) => match limit.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        warn!("Session limit reached, rejecting {}", peer_addr);
                        continue;
                    }
                },
                None => None,
            };

            let file = Arc::clone(&self.file);
            let parameters = Arc::clone(&self.parameters);
            let transport = self.transport;
            let session_timeout = self.session_timeout;

            tokio::spawn(async move {
                let _permit = permit;
                info!("📥 New connection from {}", peer_addr);

                let session =
                    Self::handle_connection(stream, peer_addr, file, parameters, transport);
                let result = match session_timeout {
                    Some(limit) => tokio::time::timeout(limit, session)
                        .await
                        .unwrap_or(Err(TransferError::TimedOut(limit))),
                    None => session.await,
                };

                match result {
                    Ok(report) => info!(
                        "✅ Sent to {} ({} frames)",
                        report.peer, report.frames_sent
                    ),
                    Err(e) => warn!("Session with {} failed: {}", peer_addr, e),
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        file: Arc<SharedFile>,
        parameters: Arc<ParameterSource>,
        transport: ChunkedTransport,
    ) -> Result<SessionReport, TransferError> {
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut progress = SessionProgress::new(Role::Sender, peer_addr);
        let result = serve_session(
            &mut reader,
            &mut writer,
            &file,
            &parameters,
            transport,
            &mut progress,
        )
        .await;

        if result.is_err() {
            progress.fail();
        }
        result
    }
}

/// Run the sender half of the protocol on an established stream
pub async fn serve_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    file: &SharedFile,
    parameters: &ParameterSource,
    transport: ChunkedTransport,
    progress: &mut SessionProgress,
) -> Result<SessionReport, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = key_exchange::sender_half(reader, writer, parameters, progress).await?;

    let ciphertext = cipher::encrypt(&file.content, key.as_bytes())?;

    TextFramer::write_text(writer, &file.name).await?;
    progress.advance(SessionState::FilenameExchanged)?;

    progress.advance(SessionState::TransferInProgress)?;
    let frames_sent = transport.send(writer, ciphertext.as_bytes()).await?;
    progress.advance(SessionState::Complete)?;

    debug!(
        "Sent {} ciphertext bytes in {} frames to {}",
        ciphertext.len(),
        frames_sent,
        progress.peer()
    );

    Ok(SessionReport {
        peer: progress.peer(),
        frames_sent,
    })
}
