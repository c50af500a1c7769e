//! Location of the native library's on-disk state.
//!
//! The directories are handed to the library with the parameters request;
//! their contents belong to it. The only thing read here is whether a
//! database already exists, which tells if a previous login can resume.

use std::io;
use std::path::{Path, PathBuf};

/// Database and files directories of one client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStore {
    database_directory: PathBuf,
    files_directory:    PathBuf,
}

impl SessionStore {
    /// Keep database and downloaded files under the same directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self { files_directory: dir.clone(), database_directory: dir }
    }

    /// Store downloaded files somewhere else.
    pub fn with_files_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.files_directory = dir.into(); self
    }

    pub fn database_directory(&self) -> &Path { &self.database_directory }

    pub fn files_directory(&self) -> &Path { &self.files_directory }

    /// `true` if the database directory exists and is not empty.
    pub async fn has_session(&self) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.database_directory).await else {
            return false;
        };
        matches!(entries.next_entry().await, Ok(Some(_)))
    }

    /// Create both directories if missing.
    pub async fn ensure(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.database_directory).await?;
        tokio::fs::create_dir_all(&self.files_directory).await
    }
}

impl Default for SessionStore {
    fn default() -> Self { Self::new("tdlib") }
}
