//! Error types
//!
//! Every failure a transfer session can hit falls into one of three
//! families: socket/file I/O, cryptography, or protocol. A session maps
//! whatever it hits into a [`TransferError`] and terminates; nothing here
//! is ever retried.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::session::SessionState;

/// Failure of one transfer session
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol failure: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("File store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Session timed out after {0:?}")]
    TimedOut(Duration),
}

impl TransferError {
    /// Classify a failed socket read.
    ///
    /// A peer that hangs up in the middle of a unit is a protocol
    /// violation, not a local I/O fault.
    pub(crate) fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            TransferError::Protocol(ProtocolError::ConnectionClosed)
        } else {
            TransferError::Io(err)
        }
    }
}

/// Cryptographic failures
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Malformed ciphertext encoding: {0}")]
    MalformedCiphertext(String),

    #[error("Cipher initialization failed: {0}")]
    CipherInit(String),

    #[error("Decryption failed: bad padding or wrong key")]
    Decryption,

    #[error("Insufficient key material: shared secret is {len} bytes, need 16")]
    InsufficientKeyMaterial { len: usize },

    #[error("Parameter generation failed: {0}")]
    ParameterGeneration(String),
}

/// Wire protocol violations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Unit too large: {0} bytes (max: {1})")]
    UnitTooLarge(usize, usize),

    #[error("Unit is not valid UTF-8 text")]
    InvalidText,

    #[error("Invalid decimal value for {field}")]
    InvalidNumber { field: &'static str },

    #[error("Modulus too small: {bits} bits (min: {min})")]
    WeakModulus { bits: u64, min: u64 },

    #[error("Public value for {field} outside (1, p-1)")]
    InvalidPublicValue { field: &'static str },

    #[error("Empty frame at index {index} precedes the terminator")]
    AmbiguousTerminator { index: usize },

    #[error("Unsafe filename: {0}")]
    UnsafeFilename(String),

    #[error("Invalid session transition: {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

/// FileStore contract failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("File not found: {0:?}")]
    NotFound(PathBuf),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
