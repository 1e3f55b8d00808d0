// src/peer.rs

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Manifest, ManifestEntry};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("manifest is malformed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Body of a remote file, yielded in whatever chunks the transport produces.
pub type ByteStream = BoxStream<'static, Result<Bytes, io::Error>>;

/// A remote file whose response headers have been read but whose body has not.
pub struct RemoteFile {
    /// Declared `Content-Length`, if present and parseable.
    pub size: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile").field("size", &self.size).finish_non_exhaustive()
    }
}

/// The peer's embedded file server.
#[async_trait]
pub trait Peer: Send + Sync {
    /// One attempt at reading `http://{host}/data.json`.
    async fn fetch_manifest(&self, host: &str) -> Result<Manifest, FetchError>;

    /// Opens a connection to `url` and reads its headers.
    async fn open_file(&self, url: &str) -> Result<RemoteFile, FetchError>;
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    #[serde(rename = "ConsoleName")]
    console_name: String,
    #[serde(rename = "FileNames")]
    file_names: Vec<String>,
}

pub fn manifest_url(host: &str) -> String {
    format!("http://{host}/data.json")
}

pub fn file_url(host: &str, name: &str) -> String {
    format!("http://{host}/img/{name}")
}

/// Decodes a `data.json` body, resolving every file name against `host`.
pub fn parse_manifest(host: &str, body: &[u8]) -> Result<Manifest, FetchError> {
    let raw: RawManifest = serde_json::from_slice(body)?;
    let entries = raw
        .file_names
        .iter()
        .map(|name| ManifestEntry::new(file_url(host, name)))
        .collect();
    Ok(Manifest {
        console_name: raw.console_name,
        entries,
    })
}

/// `Peer` over plain HTTP with connect and read timeouts.
#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: Client,
}

impl HttpPeer {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Peer for HttpPeer {
    async fn fetch_manifest(&self, host: &str) -> Result<Manifest, FetchError> {
        let body = self
            .client
            .get(manifest_url(host))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        debug!(body = %String::from_utf8_lossy(&body), "data.json");
        let manifest = parse_manifest(host, &body)?;
        info!(
            console = %manifest.console_name,
            files = manifest.entries.len(),
            "manifest fetched"
        );
        Ok(manifest)
    }

    async fn open_file(&self, url: &str) -> Result<RemoteFile, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            // Surfaces as a failure of this item once its transfer starts.
            debug!(url, %status, "peer refused file");
            let error = io::Error::new(io::ErrorKind::Other, format!("HTTP status {status}"));
            return Ok(RemoteFile {
                size: None,
                body: stream::once(async move { Err(error) }).boxed(),
            });
        }
        let size = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)))
            .boxed();
        Ok(RemoteFile { size, body })
    }
}
