//! Secure File Share CLI - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                 │
//! │        send  │  receive  │  (no subcommand: interactive menu)           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Server (one task per connection)   │   ReceiverSession (one transfer)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Key exchange (DH)  │  Cipher (AES-128)  │  Chunked transport (frames)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use secure_file_share::client::{ClientConfig, ReceiverSession};
use secure_file_share::key_exchange::ParameterMode;
use secure_file_share::server::{Server, ServerConfig};
use secure_file_share::store::LocalFileStore;

/// Secure File Share CLI
///
/// Serve one file to every receiver that connects, encrypted under a
/// per-connection Diffie-Hellman session key.
#[derive(Parser)]
#[command(name = "sfs")]
#[command(version)]
#[command(about = "Serve a file over TCP with per-connection DH encryption", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Omit to get the interactive menu
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a file to all receivers that connect
    Send {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to listen on
        #[arg(short, long)]
        port: u16,

        /// File to serve
        file: PathBuf,

        /// Pre-generate this many DH parameter sets and reuse them
        /// round-robin instead of generating per connection
        #[arg(long)]
        reuse_parameters: Option<usize>,

        /// Reject connections beyond this many concurrent sessions
        #[arg(long)]
        max_sessions: Option<usize>,

        /// Abort a session after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Receive a file from a sender
    Receive {
        /// Sender host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Sender port
        #[arg(short, long)]
        port: u16,

        /// Directory to save the file in
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,

        /// Abort the session after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Some(Commands::Send {
            bind,
            port,
            file,
            reuse_parameters,
            max_sessions,
            timeout,
        }) => {
            let mut config = ServerConfig::new(SocketAddr::new(bind, port), file);
            config.parameters = reuse_parameters
                .map(ParameterMode::Pool)
                .unwrap_or_default();
            config.max_sessions = max_sessions;
            config.session_timeout = timeout.map(Duration::from_secs);
            run_send(config).await
        }
        Some(Commands::Receive {
            host,
            port,
            output_dir,
            timeout,
        }) => {
            let mut config = ClientConfig::new(host, port);
            config.output_dir = output_dir;
            config.session_timeout = timeout.map(Duration::from_secs);
            config.show_progress = true;
            run_receive(config).await
        }
        None => run_menu(&mut BufReader::new(tokio::io::stdin()).lines()).await,
    }
}

async fn run_send(config: ServerConfig) -> Result<()> {
    info!("🚀 Starting sender on {}...", config.bind_addr);
    let server = Server::bind(config, &LocalFileStore).await?;
    server.run().await
}

async fn run_receive(config: ClientConfig) -> Result<()> {
    let session = ReceiverSession::new(config, LocalFileStore);
    let received = session.run().await.context("Transfer failed")?;
    println!("File download complete. Saved in {}", received.path.display());
    Ok(())
}

/// Interactive front end: pick send, receive, or exit. A failed transfer
/// is reported and the menu shown again.
async fn run_menu<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> Result<()> {
    loop {
        println!("Welcome.");
        println!("Please select operation.");
        println!("1. Send File (to all users will connect)");
        println!("2. Receive File");
        println!("3. Exit");

        let Some(selection) = prompt(lines, "> ").await? else {
            return Ok(());
        };

        match selection.as_str() {
            "1" => {
                let port = prompt_parse::<u16, _>(lines, "Enter port for listening: ").await?;
                let Some(path) =
                    prompt(lines, "Enter file path to send to all clients: ").await?
                else {
                    return Ok(());
                };
                let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));
                let config = ServerConfig::new(bind_addr, PathBuf::from(path));
                // Serving only returns if the file or socket could not be set up
                if let Err(e) = run_send(config).await {
                    error!("{:#}", e);
                }
            }
            "2" => {
                let Some(host) = prompt(lines, "Enter server for receiving: ").await? else {
                    return Ok(());
                };
                let port = prompt_parse::<u16, _>(lines, "Enter port: ").await?;
                let mut config = ClientConfig::new(host, port);
                config.show_progress = true;
                if let Err(e) = run_receive(config).await {
                    error!("{:#}", e);
                }
            }
            "3" => {
                println!("Bye bye.");
                return Ok(());
            }
            _ => println!("Select 1, 2 or 3."),
        }
    }
}

/// Print `label` and read one trimmed line. `None` on end of input.
async fn prompt<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    label: &str,
) -> Result<Option<String>> {
    print!("{}", label);
    std::io::stdout().flush()?;
    Ok(lines.next_line().await?.map(|l| l.trim().to_string()))
}

async fn prompt_parse<T: std::str::FromStr, R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    label: &str,
) -> Result<T> {
    loop {
        let line = prompt(lines, label)
            .await?
            .context("Input closed")?;
        match line.parse() {
            Ok(value) => return Ok(value),
            Err(_) => println!("Invalid value: {}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(input: &'static str) -> Lines<BufReader<&'static [u8]>> {
        BufReader::new(input.as_bytes()).lines()
    }

    #[tokio::test]
    async fn test_menu_survives_missing_file() {
        let mut lines = script("1\n0\n/nonexistent/dir/file.txt\n3\n");
        assert!(run_menu(&mut lines).await.is_ok());
        // Exit was read after the failed send
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_menu_reprompts_on_bad_input() {
        let mut lines = script("9\n1\nnot-a-port\n0\n/nonexistent/file.txt\n3\n");
        assert!(run_menu(&mut lines).await.is_ok());
    }

    #[tokio::test]
    async fn test_menu_ends_on_closed_input() {
        let mut lines = script("");
        assert!(run_menu(&mut lines).await.is_ok());
    }
}
