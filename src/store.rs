// src/store.rs

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWrite;
use tracing::debug;

use crate::config::MAX_NAME_ATTEMPTS;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("no free file name for {0}")]
    NamesExhausted(String),
    #[error("not a destination of this store: {0}")]
    UnknownDestination(String),
}

pub type DestinationWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Where downloaded files end up.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    /// Reserves a new, uniquely named destination and returns its URI.
    async fn create(&self, file_name: &str, is_video: bool) -> Result<String, StoreError>;

    /// Opens a previously created destination for writing.
    async fn open(&self, uri: &str) -> Result<DestinationWriter, StoreError>;
}

/// Splits `clip.mp4` into `("clip", ".mp4")`.
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => file_name.split_at(pos),
        _ => (file_name, ""),
    }
}

/// Candidate names in order: `name.ext`, `name(0).ext`, `name(1).ext`, ...
pub fn candidate_name(file_name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return file_name.to_string();
    }
    let (base, ext) = split_extension(file_name);
    format!("{}({}){}", base, attempt - 1, ext)
}

/// Stores files in a local directory, never overwriting an existing file.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub async fn open(root: &Path) -> io::Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        let root = tokio::fs::canonicalize(root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, uri: &str) -> Result<PathBuf, StoreError> {
        let path = reqwest::Url::parse(uri)
            .ok()
            .filter(|url| url.scheme() == "file")
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| StoreError::UnknownDestination(uri.to_string()))?;
        if !path.starts_with(&self.root) {
            return Err(StoreError::UnknownDestination(uri.to_string()));
        }
        Ok(path)
    }
}

#[async_trait]
impl DownloadStore for DirectoryStore {
    async fn create(&self, file_name: &str, is_video: bool) -> Result<String, StoreError> {
        // Never let a peer-supplied name escape the directory.
        let file_name = Path::new(file_name)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("download");

        for attempt in 0..=MAX_NAME_ATTEMPTS {
            let path = self.root.join(candidate_name(file_name, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(_) => {
                    debug!(path = %path.display(), is_video, "created destination");
                    let uri = reqwest::Url::from_file_path(&path)
                        .map_err(|_| StoreError::UnknownDestination(path.display().to_string()))?;
                    return Ok(uri.to_string());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::NamesExhausted(file_name.to_string()))
    }

    async fn open(&self, uri: &str) -> Result<DestinationWriter, StoreError> {
        let path = self.path_of(uri)?;
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }
}
