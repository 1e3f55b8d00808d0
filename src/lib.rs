pub mod config;
pub mod downloader;
pub mod link;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod models;
pub mod nmcli;
pub mod notify;
pub mod peer;
pub mod pool;
pub mod retry;
pub mod state_manager;
pub mod store;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::config::{LinkBackend, TransferConfig};
    pub use crate::link::{DirectLink, LinkEvent, LinkEventSink, NetworkLink};
    pub use crate::listener::{SessionError, SessionListener};
    pub use crate::manager::{Collaborators, ManagerError, Snapshot, TransferManager};
    pub use crate::models::{DownloadItem, DownloadState, ItemStatus, ProgressReport, SessionState};
    pub use crate::nmcli::NmcliLink;
    pub use crate::notify::{LogNotifier, Notifier};
    pub use crate::peer::{HttpPeer, Peer};
    pub use crate::state_manager::StateManager;
    pub use crate::store::{DirectoryStore, DownloadStore};
}
