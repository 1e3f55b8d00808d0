use std::sync::Arc;
use thiserror::Error;

use crate::models::SessionState;

/// Failures that end a session. Each one is followed by a disconnect request
/// and a return to `Idle`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("could not remove the existing Wi-Fi configuration for {ssid}")]
    RemoveWifiConfig { ssid: String },
    #[error("could not add the Wi-Fi configuration")]
    AddWifiConfig,
    #[error("could not disconnect from the current Wi-Fi network")]
    DisconnectWifi,
    #[error("could not enable the Wi-Fi network")]
    EnableWifiNetwork,
    #[error("the Wi-Fi network is unavailable")]
    LinkUnavailable,
    #[error("the Wi-Fi connection was lost")]
    LinkLost,
    #[error("could not read the file list from the console")]
    ManifestParse,
    #[error("could not create a file to download into")]
    DestinationCreate,
}

/// Observer of a transfer session. All callbacks run on the session's
/// sequencer and must not block.
pub trait SessionListener: Send + Sync {
    fn on_state_changed(&self, _state: SessionState) {}

    fn on_session_error(&self, _error: &SessionError) {}

    /// Progress or status of item `index` changed.
    fn on_item_changed(&self, _index: usize) {}

    /// Every item finished and the state was saved.
    fn on_session_completed(&self) {}
}

/// Registered listeners. Dispatch works on a snapshot, so a listener added
/// or removed during a callback does not disturb the current round.
#[derive(Default)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn SessionListener>>,
}

fn same_listener(a: &Arc<dyn SessionListener>, b: &Arc<dyn SessionListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if `listener` is already registered.
    pub fn add(&mut self, listener: Arc<dyn SessionListener>) -> bool {
        if self.contains(&listener) {
            return false;
        }
        self.listeners.push(listener);
        true
    }

    pub fn remove(&mut self, listener: &Arc<dyn SessionListener>) {
        self.listeners.retain(|l| !same_listener(l, listener));
    }

    pub fn contains(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.listeners.iter().any(|l| same_listener(l, listener))
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn for_each<F>(&self, f: F)
    where
        F: Fn(&dyn SessionListener),
    {
        let snapshot = self.listeners.clone();
        for listener in &snapshot {
            f(listener.as_ref());
        }
    }
}
