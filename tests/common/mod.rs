#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

use switch_transfer::manager::{Collaborators, TransferManager};
use switch_transfer::models::{Manifest, ManifestEntry, ProgressReport, SessionState};
use switch_transfer::peer::{file_url, FetchError, Peer, RemoteFile};
use switch_transfer::prelude::*;
use switch_transfer::store::{DestinationWriter, StoreError};

// ---------------------------------------------------------------- link

pub enum LinkBehavior {
    /// Report link-up right away.
    Up,
    /// Report this event right away.
    Fail(LinkEvent),
    /// Never report anything on its own.
    Silent,
}

pub struct MockLink {
    behavior: LinkBehavior,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub last_sink: Mutex<Option<LinkEventSink>>,
}

impl MockLink {
    pub fn new(behavior: LinkBehavior) -> Self {
        Self {
            behavior,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            last_sink: Mutex::new(None),
        }
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Emits `event` on the sink of the latest connect attempt.
    pub fn emit(&self, event: LinkEvent) {
        let sink = self.last_sink.lock().unwrap().clone().expect("no connect yet");
        sink.emit(event);
    }
}

impl NetworkLink for MockLink {
    fn connect(&self, _ssid: &str, _password: &str, events: LinkEventSink) {
        self.connects.fetch_add(1, Ordering::SeqCst);
        *self.last_sink.lock().unwrap() = Some(events.clone());
        match &self.behavior {
            LinkBehavior::Up => {
                events.emit(LinkEvent::Up);
            }
            LinkBehavior::Fail(event) => {
                events.emit(event.clone());
            }
            LinkBehavior::Silent => {}
        }
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------- peer

#[derive(Clone)]
pub enum Body {
    /// `len` zero bytes in chunks of `chunk`.
    Data { len: usize, chunk: usize },
    /// One small chunk, then nothing ever again.
    Stall,
    /// One small chunk, then an I/O error.
    Fail,
}

#[derive(Clone)]
pub struct FileSpec {
    pub declared: Option<u64>,
    pub body: Body,
    pub size_fails: bool,
    /// Time the size lookup takes to answer.
    pub size_delay: Option<Duration>,
}

impl FileSpec {
    pub fn ok(len: usize) -> Self {
        Self {
            declared: Some(len as u64),
            body: Body::Data { len, chunk: 4096 },
            size_fails: false,
            size_delay: None,
        }
    }

    pub fn chunked(len: usize, chunk: usize) -> Self {
        Self {
            declared: Some(len as u64),
            body: Body::Data { len, chunk },
            size_fails: false,
            size_delay: None,
        }
    }

    pub fn stalled(declared: u64) -> Self {
        Self {
            declared: Some(declared),
            body: Body::Stall,
            size_fails: false,
            size_delay: None,
        }
    }

    pub fn broken(declared: u64) -> Self {
        Self {
            declared: Some(declared),
            body: Body::Fail,
            size_fails: false,
            size_delay: None,
        }
    }

    pub fn size_unavailable() -> Self {
        Self {
            declared: None,
            body: Body::Stall,
            size_fails: true,
            size_delay: None,
        }
    }

    pub fn slow_size_lookup(mut self, delay: Duration) -> Self {
        self.size_delay = Some(delay);
        self
    }
}

fn decode_error() -> FetchError {
    FetchError::Decode(serde_json::from_str::<u32>("not json").unwrap_err())
}

pub struct MockPeer {
    console_name: String,
    names: Vec<String>,
    files: HashMap<String, FileSpec>,
    failing_attempts: usize,
    pub attempts: Mutex<Vec<Instant>>,
    pub hosts: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
}

impl MockPeer {
    pub fn new(console_name: &str) -> Self {
        Self {
            console_name: console_name.to_string(),
            names: Vec::new(),
            files: HashMap::new(),
            failing_attempts: 0,
            attempts: Mutex::new(Vec::new()),
            hosts: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
        }
    }

    pub fn file(mut self, name: &str, spec: FileSpec) -> Self {
        self.names.push(name.to_string());
        self.files.insert(name.to_string(), spec);
        self
    }

    /// The first `n` manifest fetches fail.
    pub fn failing_attempts(mut self, n: usize) -> Self {
        self.failing_attempts = n;
        self
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Peer for MockPeer {
    async fn fetch_manifest(&self, host: &str) -> Result<Manifest, FetchError> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(Instant::now());
            attempts.len()
        };
        self.hosts.lock().unwrap().push(host.to_string());
        if attempt <= self.failing_attempts {
            return Err(decode_error());
        }
        Ok(Manifest {
            console_name: self.console_name.clone(),
            entries: self
                .names
                .iter()
                .map(|name| ManifestEntry::new(file_url(host, name)))
                .collect(),
        })
    }

    async fn open_file(&self, url: &str) -> Result<RemoteFile, FetchError> {
        let name = url.rsplit('/').next().unwrap_or_default();
        let spec = self.files.get(name).cloned().ok_or_else(decode_error)?;
        if let Some(delay) = spec.size_delay {
            tokio::time::sleep(delay).await;
        }
        if spec.size_fails {
            return Err(decode_error());
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let small = || Ok::<_, io::Error>(Bytes::from_static(b"0123456789"));
        let body = match spec.body {
            Body::Data { len, chunk } => {
                let chunks: Vec<io::Result<Bytes>> = (0..len)
                    .step_by(chunk)
                    .map(|start| Ok(Bytes::from(vec![0u8; chunk.min(len - start)])))
                    .collect();
                stream::iter(chunks).boxed()
            }
            Body::Stall => stream::iter(vec![small()]).chain(stream::pending()).boxed(),
            Body::Fail => stream::iter(vec![
                small(),
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "peer went away")),
            ])
            .boxed(),
        };
        Ok(RemoteFile {
            size: spec.declared,
            body,
        })
    }
}

// ---------------------------------------------------------------- store

#[derive(Default)]
pub struct MemoryStore {
    fail_on: Option<usize>,
    create_delay: Option<Duration>,
    pub created: Mutex<Vec<String>>,
    pub opened: AtomicUsize,
}

impl MemoryStore {
    /// The `n`-th (0-based) `create` call fails.
    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::default()
        }
    }

    /// Every `create` call takes `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            create_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn create_calls(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl DownloadStore for MemoryStore {
    async fn create(&self, file_name: &str, _is_video: bool) -> Result<String, StoreError> {
        let index = {
            let mut created = self.created.lock().unwrap();
            created.push(file_name.to_string());
            created.len() - 1
        };
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on == Some(index) {
            return Err(StoreError::NamesExhausted(file_name.to_string()));
        }
        Ok(format!("mem://{index}/{file_name}"))
    }

    async fn open(&self, _uri: &str) -> Result<DestinationWriter, StoreError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(tokio::io::sink()))
    }
}

// ---------------------------------------------------------------- notifier

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Note {
    Connecting(String),
    Progress(ProgressReport),
    Completed(String),
    Idle,
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notes: Mutex<Vec<Note>>,
}

impl RecordingNotifier {
    pub fn notes(&self) -> Vec<Note> {
        self.notes.lock().unwrap().clone()
    }

    pub fn percentages(&self) -> Vec<u8> {
        self.notes()
            .into_iter()
            .filter_map(|note| match note {
                Note::Progress(ProgressReport::Percent(p)) => Some(p),
                _ => None,
            })
            .collect()
    }
}

impl Notifier for RecordingNotifier {
    fn connecting(&self, ssid: &str) {
        self.notes.lock().unwrap().push(Note::Connecting(ssid.to_string()));
    }

    fn progress(&self, _title: Option<&str>, report: ProgressReport) {
        self.notes.lock().unwrap().push(Note::Progress(report));
    }

    fn completed(&self, console_name: &str) {
        self.notes.lock().unwrap().push(Note::Completed(console_name.to_string()));
    }

    fn idle(&self) {
        self.notes.lock().unwrap().push(Note::Idle);
    }
}

// ---------------------------------------------------------------- listener

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(SessionState),
    Error(SessionError),
    Item(usize),
    Completed,
}

pub struct RecordingListener {
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionListener for RecordingListener {
    fn on_state_changed(&self, state: SessionState) {
        let _ = self.tx.send(Event::State(state));
    }

    fn on_session_error(&self, error: &SessionError) {
        let _ = self.tx.send(Event::Error(error.clone()));
    }

    fn on_item_changed(&self, index: usize) {
        let _ = self.tx.send(Event::Item(index));
    }

    fn on_session_completed(&self) {
        let _ = self.tx.send(Event::Completed);
    }
}

pub fn recording_listener() -> (Arc<RecordingListener>, EventLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(RecordingListener { tx }),
        EventLog {
            rx,
            seen: Vec::new(),
        },
    )
}

/// Everything a listener has been told so far.
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<Event>,
    pub seen: Vec<Event>,
}

impl EventLog {
    /// Receives events until one matches `pred`.
    pub async fn wait_for<F>(&mut self, pred: F)
    where
        F: Fn(&Event) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), self.rx.recv())
                .await
                .expect("timed out waiting for session event")
                .expect("listener channel closed");
            let done = pred(&event);
            self.seen.push(event);
            if done {
                return;
            }
        }
    }

    pub async fn wait_for_state(&mut self, state: SessionState) {
        self.wait_for(|e| *e == Event::State(state)).await;
    }

    /// Picks up whatever has already been delivered.
    pub fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.seen.push(event);
        }
    }

    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&Event) -> bool,
    {
        self.seen.iter().filter(|e| pred(e)).count()
    }

    pub fn states(&self) -> Vec<SessionState> {
        self.seen
            .iter()
            .filter_map(|e| match e {
                Event::State(s) => Some(*s),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------- harness

pub struct Harness {
    pub manager: TransferManager,
    pub link: Arc<MockLink>,
    pub peer: Arc<MockPeer>,
    pub notifier: Arc<RecordingNotifier>,
    pub state_manager: StateManager,
    pub events: EventLog,
    pub config: TransferConfig,
    pub dir: TempDir,
}

/// Polls until the session reports `n` active workers.
pub async fn wait_for_workers(manager: &TransferManager, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while manager.snapshot().await.unwrap().active_workers != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for workers");
}

/// Polls until `f` holds.
pub async fn wait_until<F>(f: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for condition");
}

pub fn test_config(dir: &TempDir) -> TransferConfig {
    TransferConfig {
        retry_backoff_ms: 100,
        state_path: dir.path().join("state.db"),
        download_dir: dir.path().join("downloads"),
        ..TransferConfig::default()
    }
}

pub async fn harness(link: MockLink, peer: MockPeer, store: Arc<dyn DownloadStore>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state_manager = StateManager::open(&dir.path().join("state.db")).await.unwrap();
    harness_with_state(dir, state_manager, link, peer, store).await
}

pub async fn harness_with_state(
    dir: TempDir,
    state_manager: StateManager,
    link: MockLink,
    peer: MockPeer,
    store: Arc<dyn DownloadStore>,
) -> Harness {
    let config = test_config(&dir);
    let link = Arc::new(link);
    let peer = Arc::new(peer);
    let notifier = Arc::new(RecordingNotifier::default());

    let manager = TransferManager::spawn(
        &config,
        Collaborators {
            link: link.clone(),
            peer: peer.clone(),
            store,
            notifier: notifier.clone(),
            state_manager: state_manager.clone(),
        },
    )
    .await;

    let (listener, mut events) = recording_listener();
    manager.add_listener(listener).await.unwrap();
    // Registration reports the current state once.
    events.wait_for_state(SessionState::Idle).await;
    events.seen.clear();

    Harness {
        manager,
        link,
        peer,
        notifier,
        state_manager,
        events,
        config,
        dir,
    }
}
