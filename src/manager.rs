// src/manager.rs

use crate::config::{resolve_host, TransferConfig};
use crate::downloader::{FileDownloader, TransferOutcome};
use crate::link::{LinkEvent, LinkEventSink, NetworkLink};
use crate::listener::{ListenerSet, SessionError, SessionListener};
use crate::models::{
    DownloadItem, DownloadState, ItemStatus, Manifest, ManifestEntry, ProgressReport,
    SessionState,
};
use crate::notify::Notifier;
use crate::peer::{Peer, RemoteFile};
use crate::pool::WorkerPool;
use crate::retry::RetryPolicy;
use crate::state_manager::StateManager;
use crate::store::DownloadStore;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("a session is already running (state {0:?})")]
    Busy(SessionState),
    #[error("listener is already registered")]
    ListenerAlreadyRegistered,
    #[error("transfer manager has stopped")]
    Stopped,
}

/// The external capabilities a session drives.
#[derive(Clone)]
pub struct Collaborators {
    pub link: Arc<dyn NetworkLink>,
    pub peer: Arc<dyn Peer>,
    pub store: Arc<dyn DownloadStore>,
    pub notifier: Arc<dyn Notifier>,
    pub state_manager: StateManager,
}

/// Point-in-time view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: SessionState,
    pub exiting: bool,
    pub active_workers: usize,
    pub download_state: Option<DownloadState>,
}

/// Result of the background manifest fetch and size lookups.
pub(crate) enum FetchOutcome {
    Ready {
        manifest: Manifest,
        files: Vec<RemoteFile>,
    },
    Failed,
    Cancelled,
}

/// Everything the sequencer reacts to: requests from handles, events from the
/// link, and results posted back by workers.
pub(crate) enum Message {
    Connect {
        ssid: String,
        password: String,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Disconnect,
    AddListener {
        listener: Arc<dyn SessionListener>,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    RemoveListener {
        listener: Arc<dyn SessionListener>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Link {
        attempt: u64,
        event: LinkEvent,
    },
    ManifestReady(FetchOutcome),
    /// Allocate the destination of the next pending file of session `attempt`.
    AllocateNext {
        attempt: u64,
    },
    Progress {
        index: usize,
        downloaded: u64,
    },
    ItemFinished {
        index: usize,
        outcome: TransferOutcome,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Connect { ssid, .. } => f.debug_struct("Connect").field("ssid", ssid).finish_non_exhaustive(),
            Message::Disconnect => f.write_str("Disconnect"),
            Message::AddListener { .. } => f.write_str("AddListener"),
            Message::RemoveListener { .. } => f.write_str("RemoveListener"),
            Message::Snapshot { .. } => f.write_str("Snapshot"),
            Message::Link { attempt, event } => f
                .debug_struct("Link")
                .field("attempt", attempt)
                .field("event", event)
                .finish(),
            Message::ManifestReady(_) => f.write_str("ManifestReady"),
            Message::AllocateNext { attempt } => f
                .debug_struct("AllocateNext")
                .field("attempt", attempt)
                .finish(),
            Message::Progress { index, downloaded } => f
                .debug_struct("Progress")
                .field("index", index)
                .field("downloaded", downloaded)
                .finish(),
            Message::ItemFinished { index, outcome } => f
                .debug_struct("ItemFinished")
                .field("index", index)
                .field("outcome", outcome)
                .finish(),
        }
    }
}

/// Handle to the transfer session. Cheap to clone; every call is forwarded to
/// a single sequencer task that owns all session state.
#[derive(Clone)]
pub struct TransferManager {
    tx: mpsc::UnboundedSender<Message>,
}

impl TransferManager {
    /// Loads any previously completed download state and starts the sequencer.
    pub async fn spawn(config: &TransferConfig, parts: Collaborators) -> Self {
        let download_state = parts.state_manager.load().await;
        if let Some(state) = &download_state {
            info!(console = %state.console_name, items = state.items.len(), "restored saved download state");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sequencer = Sequencer {
            link: parts.link,
            peer: parts.peer,
            store: parts.store,
            notifier: parts.notifier,
            state_manager: parts.state_manager,
            retry: config.retry_policy(),
            downloader: FileDownloader::new(config.progress_granularity),
            pool: WorkerPool::new(config.pool_size),
            tx: tx.downgrade(),
            listeners: ListenerSet::new(),
            state: SessionState::Idle,
            exiting: CancellationToken::new(),
            active_workers: 0,
            attempt: 0,
            link_up: false,
            pending: VecDeque::new(),
            download_state,
        };
        tokio::spawn(sequencer.run(rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(message(reply)).map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }

    /// Starts a session: joins `ssid` and downloads everything the peer lists.
    /// Fails with `Busy` unless the session is idle.
    pub async fn connect(&self, ssid: &str, password: &str) -> Result<(), ManagerError> {
        self.request(|reply| Message::Connect {
            ssid: ssid.to_string(),
            password: password.to_string(),
            reply,
        })
        .await?
    }

    /// Aborts the running session. Safe to call at any time.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Message::Disconnect);
    }

    /// Registers `listener` and immediately tells it the current state.
    pub async fn add_listener(&self, listener: Arc<dyn SessionListener>) -> Result<(), ManagerError> {
        self.request(|reply| Message::AddListener { listener, reply })
            .await?
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SessionListener>) {
        let _ = self.tx.send(Message::RemoveListener {
            listener: listener.clone(),
        });
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ManagerError> {
        self.request(|reply| Message::Snapshot { reply }).await
    }

    pub async fn state(&self) -> Result<SessionState, ManagerError> {
        Ok(self.snapshot().await?.state)
    }

    /// The current, or last saved, download list.
    pub async fn download_state(&self) -> Result<Option<DownloadState>, ManagerError> {
        Ok(self.snapshot().await?.download_state)
    }
}

async fn fetch_manifest(
    peer: &dyn Peer,
    host: &str,
    retry: RetryPolicy,
    exiting: &CancellationToken,
) -> FetchOutcome {
    info!(host, "fetching manifest");
    let manifest = match retry.run(exiting, |_| peer.fetch_manifest(host)).await {
        Ok(manifest) => manifest,
        Err(_) if exiting.is_cancelled() => return FetchOutcome::Cancelled,
        Err(_) => return FetchOutcome::Failed,
    };

    let mut files = Vec::with_capacity(manifest.entries.len());
    for entry in &manifest.entries {
        if exiting.is_cancelled() {
            return FetchOutcome::Cancelled;
        }
        match peer.open_file(&entry.url).await {
            Ok(file) => {
                debug!(url = %entry.url, size = ?file.size, "size known");
                files.push(file);
            }
            Err(e) => {
                error!(url = %entry.url, error = %e, "size lookup failed");
                return FetchOutcome::Failed;
            }
        }
    }
    FetchOutcome::Ready { manifest, files }
}

/// Owns the session. Runs on one task; workers only talk to it via `Message`.
struct Sequencer {
    link: Arc<dyn NetworkLink>,
    peer: Arc<dyn Peer>,
    store: Arc<dyn DownloadStore>,
    notifier: Arc<dyn Notifier>,
    state_manager: StateManager,
    retry: RetryPolicy,
    downloader: FileDownloader,
    pool: WorkerPool,
    tx: mpsc::WeakUnboundedSender<Message>,
    listeners: ListenerSet,

    state: SessionState,
    /// Set once the session is being torn down; a fresh token per session.
    exiting: CancellationToken,
    /// Dispatched units of work (manifest fetch, file transfers) not yet reported back.
    active_workers: usize,
    /// Number of the current connect attempt; link events from other attempts are stale.
    attempt: u64,
    link_up: bool,
    /// Files whose destination has not been allocated yet, in manifest order.
    pending: VecDeque<(usize, ManifestEntry, RemoteFile)>,
    download_state: Option<DownloadState>,
}

impl Sequencer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            self.handle(message).await;
        }
        if self.state != SessionState::Idle {
            self.exiting.cancel();
            self.link.disconnect();
        }
        debug!("transfer manager stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Connect {
                ssid,
                password,
                reply,
            } => {
                let result = self.connect(&ssid, &password).await;
                let _ = reply.send(result);
            }
            Message::Disconnect => self.disconnect(),
            Message::AddListener { listener, reply } => {
                let result = if self.listeners.add(listener.clone()) {
                    listener.on_state_changed(self.state);
                    Ok(())
                } else {
                    Err(ManagerError::ListenerAlreadyRegistered)
                };
                let _ = reply.send(result);
            }
            Message::RemoveListener { listener } => self.listeners.remove(&listener),
            Message::Snapshot { reply } => {
                let _ = reply.send(Snapshot {
                    state: self.state,
                    exiting: self.exiting.is_cancelled(),
                    active_workers: self.active_workers,
                    download_state: self.download_state.clone(),
                });
            }
            Message::Link { attempt, event } => {
                if attempt != self.attempt || self.state == SessionState::Idle {
                    debug!(attempt, ?event, "ignoring stale link event");
                    return;
                }
                self.on_link_event(event).await;
            }
            Message::ManifestReady(outcome) => self.on_manifest(outcome).await,
            Message::AllocateNext { attempt } => {
                if attempt == self.attempt {
                    self.allocate_next().await;
                }
            }
            Message::Progress { index, downloaded } => self.on_progress(index, downloaded),
            Message::ItemFinished { index, outcome } => self.on_item_finished(index, outcome).await,
        }
    }

    fn change_to_state(&mut self, state: SessionState) {
        if state == self.state {
            return;
        }
        info!(from = ?self.state, to = ?state, "session state changed");
        self.state = state;
        self.listeners.for_each(|l| l.on_state_changed(state));
        if state == SessionState::Idle {
            self.notifier.idle();
        }
    }

    /// Moves an exiting session towards `Idle`, waiting for in-flight workers.
    fn settle(&mut self) {
        if self.active_workers == 0 {
            self.change_to_state(SessionState::Idle);
        } else {
            self.change_to_state(SessionState::Disconnecting);
        }
    }

    /// Terminal failure: report it, drop the link and wind down.
    fn fail(&mut self, error: SessionError) {
        error!(%error, "session failed");
        self.listeners.for_each(|l| l.on_session_error(&error));
        self.pending.clear();
        self.exiting.cancel();
        self.link.disconnect();
        self.settle();
    }

    async fn connect(&mut self, ssid: &str, password: &str) -> Result<(), ManagerError> {
        if self.state != SessionState::Idle {
            return Err(ManagerError::Busy(self.state));
        }
        let tx = self.tx.upgrade().ok_or(ManagerError::Stopped)?;

        self.attempt += 1;
        self.active_workers = 0;
        self.exiting = CancellationToken::new();
        self.link_up = false;
        self.pending.clear();
        if let Err(e) = self.state_manager.delete().await {
            warn!(error = %e, "failed to delete saved download state");
        }
        self.download_state = None;

        info!(ssid, attempt = self.attempt, "connecting");
        self.change_to_state(SessionState::Connecting);
        self.notifier.connecting(ssid);
        self.link
            .connect(ssid, password, LinkEventSink::new(self.attempt, tx));
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.state == SessionState::Idle || self.exiting.is_cancelled() {
            return;
        }
        info!(
            active_workers = self.active_workers,
            not_started = self.pending.len(),
            "disconnect requested"
        );
        self.pending.clear();
        self.exiting.cancel();
        self.link.disconnect();
        self.settle();
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        match event.session_error() {
            None => {
                if self.link_up
                    || self.exiting.is_cancelled()
                    || self.state != SessionState::Connecting
                {
                    debug!("ignoring repeated link-up");
                    return;
                }
                self.link_up = true;
                self.start_manifest_fetch().await;
            }
            Some(error) => {
                if self.exiting.is_cancelled() {
                    debug!(%error, "link event while exiting");
                    return;
                }
                self.fail(error);
            }
        }
    }

    async fn start_manifest_fetch(&mut self) {
        let host_override = match self.state_manager.host_override().await {
            Ok(host) => host,
            Err(e) => {
                warn!(error = %e, "failed to read host override");
                None
            }
        };
        let host = resolve_host(host_override.as_deref());
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        self.active_workers += 1;
        let peer = self.peer.clone();
        let retry = self.retry;
        let exiting = self.exiting.clone();
        self.pool.spawn(async move {
            let outcome = fetch_manifest(peer.as_ref(), &host, retry, &exiting).await;
            let _ = tx.send(Message::ManifestReady(outcome));
        });
    }

    async fn on_manifest(&mut self, outcome: FetchOutcome) {
        self.active_workers = self.active_workers.saturating_sub(1);
        if self.exiting.is_cancelled() {
            self.settle();
            return;
        }
        match outcome {
            FetchOutcome::Ready { manifest, files } => self.start_downloads(manifest, files),
            FetchOutcome::Failed | FetchOutcome::Cancelled => self.fail(SessionError::ManifestParse),
        }
    }

    fn start_downloads(&mut self, manifest: Manifest, files: Vec<RemoteFile>) {
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        let items = manifest
            .entries
            .iter()
            .zip(&files)
            .map(|(entry, file)| DownloadItem::new(entry.is_video, file.size))
            .collect();
        let state = DownloadState::new(manifest.console_name, items);
        info!(
            console = %state.console_name,
            items = state.items.len(),
            total = ?state.total_size(),
            "starting downloads"
        );
        self.notifier
            .progress(Some(&state.console_name), ProgressReport::Indeterminate);
        self.download_state = Some(state);
        self.change_to_state(SessionState::Downloading);

        self.pending = manifest
            .entries
            .into_iter()
            .zip(files)
            .enumerate()
            .map(|(index, (entry, file))| (index, entry, file))
            .collect();
        let _ = tx.send(Message::AllocateNext {
            attempt: self.attempt,
        });
    }

    /// Allocates one destination and starts its transfer, then queues the next
    /// allocation behind whatever messages arrived meanwhile.
    async fn allocate_next(&mut self) {
        if self.state != SessionState::Downloading || self.exiting.is_cancelled() {
            self.pending.clear();
            return;
        }
        let Some((index, entry, file)) = self.pending.pop_front() else {
            if self.active_workers == 0 {
                self.finish_session().await;
            }
            return;
        };
        let Some(tx) = self.tx.upgrade() else {
            return;
        };

        let uri = match self.store.create(&entry.file_name(), entry.is_video).await {
            Ok(uri) => uri,
            Err(e) => {
                error!(index, url = %entry.url, error = %e, "can't create file");
                self.fail(SessionError::DestinationCreate);
                return;
            }
        };
        if let Some(item) = self
            .download_state
            .as_mut()
            .and_then(|state| state.items.get_mut(index))
        {
            item.destination = Some(uri.clone());
        }

        self.active_workers += 1;
        let store = self.store.clone();
        let downloader = self.downloader.clone();
        let exiting = self.exiting.clone();
        let worker_tx = tx.clone();
        self.pool.spawn(async move {
            let outcome = match store.open(&uri).await {
                Ok(writer) => {
                    let progress = worker_tx.clone();
                    downloader
                        .run(file, writer, &exiting, move |downloaded| {
                            let _ = progress.send(Message::Progress { index, downloaded });
                        })
                        .await
                }
                Err(e) => TransferOutcome::Failed(e.into()),
            };
            let _ = worker_tx.send(Message::ItemFinished { index, outcome });
        });
        let _ = tx.send(Message::AllocateNext {
            attempt: self.attempt,
        });
    }

    fn report_progress(&self) {
        if self.exiting.is_cancelled() {
            return;
        }
        if let Some(state) = &self.download_state {
            self.notifier
                .progress(Some(&state.console_name), state.progress());
        }
    }

    fn on_progress(&mut self, index: usize, downloaded: u64) {
        let Some(item) = self
            .download_state
            .as_mut()
            .and_then(|state| state.items.get_mut(index))
        else {
            return;
        };
        if item.is_finished() {
            return;
        }
        item.set_downloaded(downloaded);
        self.listeners.for_each(|l| l.on_item_changed(index));
        self.report_progress();
    }

    async fn on_item_finished(&mut self, index: usize, outcome: TransferOutcome) {
        self.active_workers = self.active_workers.saturating_sub(1);
        if let Some(item) = self
            .download_state
            .as_mut()
            .and_then(|state| state.items.get_mut(index))
        {
            match outcome {
                TransferOutcome::Completed(bytes) => {
                    item.set_downloaded(bytes);
                    item.status = ItemStatus::Completed;
                }
                TransferOutcome::Failed(e) => {
                    warn!(index, error = %e, "download failed");
                    item.status = ItemStatus::Error;
                }
                TransferOutcome::Aborted => {}
            }
        }
        self.listeners.for_each(|l| l.on_item_changed(index));
        self.report_progress();

        if self.active_workers > 0 || !self.pending.is_empty() {
            return;
        }
        info!("no more downloads");
        if self.exiting.is_cancelled() {
            self.change_to_state(SessionState::Idle);
        } else {
            self.finish_session().await;
        }
    }

    async fn finish_session(&mut self) {
        if let Some(state) = &self.download_state {
            if let Err(e) = self.state_manager.save(state).await {
                warn!(error = %e, "failed to save download state");
            }
            self.notifier.completed(&state.console_name);
        }
        self.listeners.for_each(|l| l.on_session_completed());
        self.link.disconnect();
        self.change_to_state(SessionState::Idle);
    }
}
