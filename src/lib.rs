//! Secure File Share
//!
//! Serve one file to any number of receivers over plain TCP. Every
//! connection negotiates its own AES-128 key with finite-field
//! Diffie-Hellman, and the encrypted file is streamed as bounded frames.
//!
//! ## Features
//! - Per-connection DH parameters and keys (or an optional rotating pool)
//! - AES-128 encryption of the whole file, Base64 on the wire
//! - One tokio task per receiver, all sharing the read-only file
//! - Length-prefixed text units compatible with Java `writeUTF` peers
//!
//! ## Limitations
//! - Public values are not authenticated, so the exchange is open to an
//!   active man in the middle.
//! - The cipher runs in ECB mode without an IV or integrity tag.
//! - An empty content frame is indistinguishable from the terminator.
//!
//! ## Usage
//!
//! ```bash
//! # Serve a file on port 9000
//! sfs send --port 9000 ./report.txt
//!
//! # Receive it
//! sfs receive --host 127.0.0.1 --port 9000
//! ```

pub mod cipher;
pub mod client;
pub mod error;
pub mod key_exchange;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

pub use client::{ClientConfig, ReceivedFile, ReceiverSession};
pub use error::{CryptoError, ProtocolError, StoreError, TransferError};
pub use key_exchange::{DhParameters, ParameterMode, ParameterSource, SessionKey};
pub use protocol::{ChunkedTransport, TextFramer, MAX_FRAME_SIZE};
pub use server::{Server, ServerConfig, SharedFile};
pub use store::{FileStore, LocalFileStore};
