//! Protocol Definition Module
//!
//! This module defines the wire format shared by both roles:
//! - Length-prefixed text units
//! - Chunked transfer of the encrypted payload with an empty-frame terminator
//! - Filename validation and content hashing
//!
//! ## Protocol Overview
//!
//! ```text
//! Sender                                Receiver
//!   |-- p (decimal) --------------------->|
//!   |-- g (decimal) --------------------->|
//!   |-- A = g^a mod p (decimal) --------->|
//!   |<-------------- B = g^b mod p -------|
//!   |-- filename ------------------------>|
//!   |-- frame 1 .. N (<= 256 bytes) ----->|
//!   |-- "" (terminator) ----------------->|
//! ```
//!
//! ## Unit format
//!
//! ```text
//! +-----------+------------------+
//! | Length(2) | UTF-8 bytes      |
//! +-----------+------------------+
//! ```
//!
//! The length is a big-endian `u16`, which makes a unit byte-compatible
//! with Java's `DataOutputStream.writeUTF` for ASCII content.
//!
//! ## Terminator ambiguity
//!
//! An empty unit ends the chunked payload. A payload split by
//! [`split_frames`] never contains an empty frame, but nothing on the
//! wire distinguishes an empty content frame from the terminator, so a
//! peer that emits one truncates the payload at that point.
//! [`ChunkedTransport::send_frames`] refuses to send such a frame list and
//! [`find_ambiguous_terminator`] reports where it would happen.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, TransferError};

/// Largest unit a `u16` length prefix can describe
pub const MAX_UNIT_SIZE: usize = u16::MAX as usize;

/// Default maximum chunk size carried by one frame
pub const MAX_FRAME_SIZE: usize = 256;

/// Length-prefixed unit codec
pub struct TextFramer;

impl TextFramer {
    /// Write one unit. Does not flush.
    pub async fn write_unit<W>(writer: &mut W, data: &[u8]) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        if data.len() > MAX_UNIT_SIZE {
            return Err(ProtocolError::UnitTooLarge(data.len(), MAX_UNIT_SIZE).into());
        }
        writer.write_u16(data.len() as u16).await?;
        writer.write_all(data).await?;
        Ok(())
    }

    /// Read one unit
    pub async fn read_unit<R>(reader: &mut R) -> Result<Vec<u8>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader
            .read_u16()
            .await
            .map_err(TransferError::from_read)? as usize;

        let mut data = vec![0u8; len];
        if len > 0 {
            reader
                .read_exact(&mut data)
                .await
                .map_err(TransferError::from_read)?;
        }
        Ok(data)
    }

    pub async fn write_text<W>(writer: &mut W, text: &str) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        Self::write_unit(writer, text.as_bytes()).await
    }

    pub async fn read_text<R>(reader: &mut R) -> Result<String, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let data = Self::read_unit(reader).await?;
        String::from_utf8(data).map_err(|_| ProtocolError::InvalidText.into())
    }
}

/// Split a payload into frames of at most `max_frame_size` bytes.
///
/// An empty payload yields no frames; a payload whose length is an exact
/// multiple of the frame size yields only full frames.
pub fn split_frames(payload: &[u8], max_frame_size: usize) -> Vec<&[u8]> {
    payload.chunks(max_frame_size.max(1)).collect()
}

/// Rebuild a payload the way a receiver does: concatenate frames up to,
/// but not including, the first empty one.
pub fn reassemble<I, F>(frames: I) -> Vec<u8>
where
    I: IntoIterator<Item = F>,
    F: AsRef<[u8]>,
{
    let mut payload = Vec::new();
    for frame in frames {
        let frame = frame.as_ref();
        if frame.is_empty() {
            break;
        }
        payload.extend_from_slice(frame);
    }
    payload
}

/// Index of the first empty frame that a receiver would mistake for the
/// terminator. The final frame is allowed to be empty, since it is the
/// terminator itself when present.
pub fn find_ambiguous_terminator<F: AsRef<[u8]>>(frames: &[F]) -> Option<usize> {
    let last = frames.len().checked_sub(1)?;
    frames[..last].iter().position(|f| f.as_ref().is_empty())
}

/// Streams a payload as bounded frames followed by an empty terminator
#[derive(Debug, Clone, Copy)]
pub struct ChunkedTransport {
    max_frame_size: usize,
}

impl Default for ChunkedTransport {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl ChunkedTransport {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.clamp(1, MAX_UNIT_SIZE),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Send `payload` as frames plus terminator. Returns the number of
    /// content frames sent.
    pub async fn send<W>(&self, writer: &mut W, payload: &[u8]) -> Result<usize, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let frames = split_frames(payload, self.max_frame_size);
        self.send_frames(writer, &frames).await
    }

    /// Send pre-split frames plus terminator.
    ///
    /// Refuses, before writing anything, a frame list in which an empty
    /// frame would be read as the terminator.
    pub async fn send_frames<W, F>(
        &self,
        writer: &mut W,
        frames: &[F],
    ) -> Result<usize, TransferError>
    where
        W: AsyncWrite + Unpin,
        F: AsRef<[u8]>,
    {
        if let Some(index) = frames.iter().position(|f| f.as_ref().is_empty()) {
            return Err(ProtocolError::AmbiguousTerminator { index }.into());
        }
        for frame in frames {
            let frame = frame.as_ref();
            if frame.len() > self.max_frame_size {
                return Err(ProtocolError::UnitTooLarge(frame.len(), self.max_frame_size).into());
            }
            TextFramer::write_unit(writer, frame).await?;
        }
        TextFramer::write_unit(writer, &[]).await?;
        writer.flush().await?;
        Ok(frames.len())
    }

    /// Read frames until the first empty one
    pub async fn receive<R>(&self, reader: &mut R) -> Result<Vec<u8>, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        self.receive_with(reader, |_| {}).await
    }

    /// Like [`receive`](Self::receive), calling `on_frame` with the size of
    /// each content frame as it arrives.
    pub async fn receive_with<R, F>(
        &self,
        reader: &mut R,
        mut on_frame: F,
    ) -> Result<Vec<u8>, TransferError>
    where
        R: AsyncRead + Unpin,
        F: FnMut(usize),
    {
        let mut payload = Vec::new();
        loop {
            let frame = TextFramer::read_unit(reader).await?;
            if frame.is_empty() {
                break;
            }
            on_frame(frame.len());
            payload.extend_from_slice(&frame);
        }
        Ok(payload)
    }
}

/// Calculate SHA-256 hash of data
pub fn calculate_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Check that a filename is a bare name safe to create under the output
/// directory. The sender applies the same rule to the name it announces.
pub fn validate_filename(filename: &str) -> Result<String, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::UnsafeFilename("empty filename".to_string()));
    }

    if filename == "." || filename == ".." {
        return Err(ProtocolError::UnsafeFilename(format!(
            "path traversal in {:?}",
            filename
        )));
    }

    if filename.starts_with('/') || filename.starts_with('\\') {
        return Err(ProtocolError::UnsafeFilename(format!(
            "absolute path {:?}",
            filename
        )));
    }

    // A bare name only; this also rules out `a/../b`
    if filename.contains('/') || filename.contains('\\') || filename.contains('\0') {
        return Err(ProtocolError::UnsafeFilename(format!(
            "path separator in {:?}",
            filename
        )));
    }

    Ok(filename.to_string())
}
