//! Receiver Session Module
//!
//! A receiver connects to a sender, runs the receiver half of the key
//! exchange, and pulls down one file:
//!
//! ```text
//! Receiver                                  Sender
//!   |-------- TCP connect --------------------->|
//!   |<------- p, g, A --------------------------|
//!   |-------- B ------------------------------->|
//!   |<------- filename -------------------------|
//!   |<------- frame 1 .. N, "" -----------------|
//!   |                                           |
//!   decrypt, then FileStore.write(output_dir/filename)
//! ```
//!
//! Nothing is written until the whole payload has arrived and decrypted.
//! If the write itself fails the decrypted bytes are dropped. There is no
//! retry.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::cipher;
use crate::error::{ProtocolError, TransferError};
use crate::key_exchange;
use crate::protocol::{calculate_hash, validate_filename, ChunkedTransport, TextFramer};
use crate::session::{Role, SessionProgress, SessionState};
use crate::store::FileStore;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Sender host name or address
    pub host: String,
    /// Sender port
    pub port: u16,
    /// Directory the received file is written into
    pub output_dir: PathBuf,
    /// Deadline for the whole session; `None` waits forever
    pub session_timeout: Option<Duration>,
    /// Show a spinner while frames arrive
    pub show_progress: bool,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            output_dir: PathBuf::from("."),
            session_timeout: None,
            show_progress: false,
        }
    }
}

/// A file that arrived and was written successfully
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub filename: String,
    pub path: PathBuf,
    pub size: usize,
    pub sha256_hash: String,
}

/// Receives one file from a sender
pub struct ReceiverSession<S> {
    config: ClientConfig,
    store: S,
}

impl<S: FileStore> ReceiverSession<S> {
    pub fn new(config: ClientConfig, store: S) -> Self {
        Self { config, store }
    }

    /// Connect, receive, decrypt, and store. Reports the first failure.
    pub async fn run(&self) -> Result<ReceivedFile, TransferError> {
        match self.config.session_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_inner())
                .await
                .unwrap_or(Err(TransferError::TimedOut(limit))),
            None => self.run_inner().await,
        }
    }

    async fn run_inner(&self) -> Result<ReceivedFile, TransferError> {
        info!("🔗 Connecting to {}:{}...", self.config.host, self.config.port);

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        let peer_addr = stream.peer_addr()?;
        debug!("TCP connection established with {}", peer_addr);

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        let mut progress = SessionProgress::new(Role::Receiver, peer_addr);
        let result = self
            .receive(&mut reader, &mut writer, peer_addr, &mut progress)
            .await;
        if result.is_err() {
            progress.fail();
        }
        result
    }

    async fn receive<R, W>(
        &self,
        reader: &mut R,
        writer: &mut W,
        peer_addr: SocketAddr,
        progress: &mut SessionProgress,
    ) -> Result<ReceivedFile, TransferError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (filename, content) =
            receive_payload(reader, writer, progress, self.config.show_progress).await?;

        let path = self.config.output_dir.join(&filename);
        let sha256_hash = calculate_hash(&content);
        self.store.write(&path, &content).await?;
        progress.advance(SessionState::Complete)?;

        info!(
            "✅ File received from {}: {} ({} bytes, sha256: {})",
            peer_addr,
            path.display(),
            content.len(),
            sha256_hash
        );

        Ok(ReceivedFile {
            filename,
            path,
            size: content.len(),
            sha256_hash,
        })
    }
}

/// Run the receiver half of the protocol on an established stream and
/// return the validated filename and decrypted content. Leaves the
/// session in `TransferInProgress`; the caller completes it once the
/// content is stored.
pub async fn receive_payload<R, W>(
    reader: &mut R,
    writer: &mut W,
    progress: &mut SessionProgress,
    show_progress: bool,
) -> Result<(String, Vec<u8>), TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let key = key_exchange::receiver_half(reader, writer, progress).await?;

    let filename = TextFramer::read_text(reader).await?;
    let filename = validate_filename(&filename)?;
    progress.advance(SessionState::FilenameExchanged)?;
    info!("📥 Receiving {}", filename);

    progress.advance(SessionState::TransferInProgress)?;
    let pb = show_progress.then(create_spinner);
    let ciphertext = ChunkedTransport::default()
        .receive_with(reader, |n| {
            if let Some(pb) = &pb {
                pb.inc(n as u64);
            }
        })
        .await?;
    if let Some(pb) = pb {
        pb.finish_with_message("Download complete");
    }

    let ciphertext = String::from_utf8(ciphertext).map_err(|_| ProtocolError::InvalidText)?;
    let content = cipher::decrypt(&ciphertext, key.as_bytes())?;
    Ok((filename, content))
}

/// Spinner for a transfer of unknown length
fn create_spinner() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})")
    {
        pb.set_style(style);
    }
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_exchange::{DhParameters, ParameterSource};
    use crate::server::{serve_session, SharedFile};
    use tokio::io::{duplex, split};

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    async fn run_pair(
        file: SharedFile,
    ) -> (Result<(String, Vec<u8>), TransferError>, SessionState) {
        let (server_io, client_io) = duplex(64 * 1024);
        let (mut sr, mut sw) = split(server_io);
        let (mut cr, mut cw) = split(client_io);
        let source = ParameterSource::fixed(DhParameters::oakley_group_2());

        let sender = async {
            let mut progress = SessionProgress::new(Role::Sender, peer());
            let _ = serve_session(
                &mut sr,
                &mut sw,
                &file,
                &source,
                ChunkedTransport::default(),
                &mut progress,
            )
            .await;
        };
        let receiver = async {
            let mut progress = SessionProgress::new(Role::Receiver, peer());
            let result = receive_payload(&mut cr, &mut cw, &mut progress, false).await;
            if result.is_err() {
                progress.fail();
            }
            (result, progress.state())
        };
        let (_, out) = tokio::join!(sender, receiver);
        out
    }

    #[tokio::test]
    async fn test_receive_payload_binary_content() {
        let content: Vec<u8> = (0..=255u8).cycle().take(2563).collect();
        let (result, state) = run_pair(SharedFile {
            name: "blob.bin".to_string(),
            content: content.clone(),
        })
        .await;

        let (name, received) = result.unwrap();
        assert_eq!(name, "blob.bin");
        assert_eq!(received, content);
        assert_eq!(state, SessionState::TransferInProgress);
    }

    #[tokio::test]
    async fn test_receive_payload_empty_file() {
        let (result, _) = run_pair(SharedFile {
            name: "empty.txt".to_string(),
            content: Vec::new(),
        })
        .await;
        assert!(result.unwrap().1.is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_filename_fails_session() {
        let (result, state) = run_pair(SharedFile {
            name: "../escape.txt".to_string(),
            content: b"x".to_vec(),
        })
        .await;
        assert!(matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::UnsafeFilename(_)))
        ));
        assert_eq!(state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_truncated_stream_fails_session() {
        let (mut server_io, client_io) = duplex(64 * 1024);
        let (mut cr, mut cw) = split(client_io);
        let params = DhParameters::oakley_group_2();

        let sender = async {
            TextFramer::write_text(&mut server_io, &params.p().to_string()).await.unwrap();
            TextFramer::write_text(&mut server_io, "2").await.unwrap();
            TextFramer::write_text(&mut server_io, "4").await.unwrap();
            let _ = TextFramer::read_text(&mut server_io).await.unwrap();
            TextFramer::write_text(&mut server_io, "file.txt").await.unwrap();
            TextFramer::write_unit(&mut server_io, b"QUJD").await.unwrap();
            // Hang up before the terminator
            drop(server_io);
        };
        let receiver = async {
            let mut progress = SessionProgress::new(Role::Receiver, peer());
            receive_payload(&mut cr, &mut cw, &mut progress, false).await
        };

        let (_, result) = tokio::join!(sender, receiver);
        assert!(matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::ConnectionClosed))
        ));
    }
}
