// src/models.rs

use serde::{Deserialize, Serialize};

/// The state of the transfer session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Doing nothing. Waiting for `connect`.
    Idle,
    /// Bringing the link up and reading the manifest.
    Connecting,
    /// Tearing down; waiting for in-flight workers to stop.
    Disconnecting,
    Downloading,
}

/// One file listed by the peer's manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub url: String,
    pub is_video: bool,
}

impl ManifestEntry {
    pub fn new(url: String) -> Self {
        let is_video = url.ends_with(".mp4");
        Self { url, is_video }
    }

    /// The last path segment of the URL, used to name the local copy.
    pub fn file_name(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| {
                url.path_segments()
                    .and_then(|mut segments| segments.next_back().map(str::to_owned))
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "download".to_string())
    }
}

/// The decoded `data.json` of a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub console_name: String,
    pub entries: Vec<ManifestEntry>,
}

/// The status of a single item. Only moves from `Downloading` to one of the
/// other two.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Downloading,
    Completed,
    Error,
}

/// Download progress and outcome of one manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadItem {
    pub is_video: bool,
    /// Where the store placed the file. `None` until allocated.
    pub destination: Option<String>,
    /// Declared `Content-Length`, `None` when the peer did not send one.
    pub size: Option<u64>,
    pub downloaded: u64,
    pub status: ItemStatus,
}

impl DownloadItem {
    pub fn new(is_video: bool, size: Option<u64>) -> Self {
        Self {
            is_video,
            destination: None,
            size,
            downloaded: 0,
            status: ItemStatus::Downloading,
        }
    }

    /// Records streamed bytes, never past the declared size.
    pub fn set_downloaded(&mut self, bytes: u64) {
        self.downloaded = match self.size {
            Some(size) => bytes.min(size),
            None => bytes,
        };
    }

    pub fn is_finished(&self) -> bool {
        self.status != ItemStatus::Downloading
    }
}

/// Aggregate progress of a session, as shown by the progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressReport {
    Indeterminate,
    Percent(u8),
}

/// Everything needed to redraw a download list, including after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadState {
    pub console_name: String,
    pub items: Vec<DownloadItem>,
}

impl DownloadState {
    pub fn new(console_name: String, items: Vec<DownloadItem>) -> Self {
        Self { console_name, items }
    }

    /// Sum of declared sizes, or `None` if any item's size is unknown.
    pub fn total_size(&self) -> Option<u64> {
        self.items.iter().map(|item| item.size).sum()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.items.iter().map(|item| item.downloaded).sum()
    }

    pub fn is_finished(&self) -> bool {
        self.items.iter().all(DownloadItem::is_finished)
    }

    /// Calculates the rounded aggregate percentage. 100 is held back until
    /// every item has reached a terminal status.
    pub fn progress(&self) -> ProgressReport {
        let total = match self.total_size() {
            Some(total) => total,
            None => return ProgressReport::Indeterminate,
        };
        let percent = if total == 0 {
            100
        } else {
            let fraction = self.downloaded_bytes() as f64 / total as f64;
            (fraction * 100.0).round().min(100.0) as u8
        };
        if self.is_finished() {
            ProgressReport::Percent(percent)
        } else {
            ProgressReport::Percent(percent.min(99))
        }
    }
}
