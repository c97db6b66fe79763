//! File access behind the transfer
//!
//! Sessions never touch the filesystem directly. The sender reads its file
//! once through a [`FileStore`] before it starts listening, and the
//! receiver writes the decrypted result through one after the whole
//! payload has arrived and decrypted cleanly.

use std::future::Future;
use std::io;
use std::path::Path;

use tokio::fs;

use crate::error::StoreError;

pub trait FileStore: Send + Sync {
    /// Read the whole file, or `StoreError::NotFound`
    fn read(&self, path: &Path) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    /// Create or overwrite the file with `bytes`
    fn write(
        &self,
        path: &Path,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// The local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStore;

impl FileStore for LocalFileStore {
    async fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_path_buf()))
            }
            Err(e) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        fs::write(path, bytes).await.map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Last path component, used as the filename announced to receivers
pub fn file_name_of(path: &Path) -> Option<String> {
    path.file_name().map(|s| s.to_string_lossy().to_string())
}
