use tokio::sync::mpsc;
use tracing::debug;

use crate::listener::SessionError;
use crate::manager::Message;

/// What the platform reports about a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Associated and routable; the peer can be reached.
    Up,
    /// The network never became available.
    Unavailable,
    /// The network went away after being up.
    Lost,
    RemoveConfigFailed { ssid: String },
    AddConfigFailed,
    DisconnectFailed,
    EnableFailed,
}

impl LinkEvent {
    /// The error surfaced to listeners, `None` for `Up`.
    pub fn session_error(&self) -> Option<SessionError> {
        match self {
            LinkEvent::Up => None,
            LinkEvent::Unavailable => Some(SessionError::LinkUnavailable),
            LinkEvent::Lost => Some(SessionError::LinkLost),
            LinkEvent::RemoveConfigFailed { ssid } => {
                Some(SessionError::RemoveWifiConfig { ssid: ssid.clone() })
            }
            LinkEvent::AddConfigFailed => Some(SessionError::AddWifiConfig),
            LinkEvent::DisconnectFailed => Some(SessionError::DisconnectWifi),
            LinkEvent::EnableFailed => Some(SessionError::EnableWifiNetwork),
        }
    }
}

/// Delivers the events of one connect attempt to the session. Events emitted
/// after that attempt is over are dropped by the session.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl LinkEventSink {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Safe to call from any thread. Returns `false` once the session is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        debug!(attempt = self.attempt, ?event, "link event");
        self.tx
            .send(Message::Link {
                attempt: self.attempt,
                event,
            })
            .is_ok()
    }
}

/// Platform capability that joins and leaves the peer's access point.
///
/// At most one link is pending or active at a time. `connect` must not block;
/// progress is reported through `events`.
pub trait NetworkLink: Send + Sync {
    fn connect(&self, ssid: &str, password: &str, events: LinkEventSink);

    /// Tears down whatever `connect` set up. A no-op when nothing is connected.
    fn disconnect(&self);
}

/// Link for a peer that is already reachable, e.g. on the local network.
#[derive(Debug, Default, Clone)]
pub struct DirectLink;

impl NetworkLink for DirectLink {
    fn connect(&self, ssid: &str, _password: &str, events: LinkEventSink) {
        debug!(ssid, "direct link, reporting up");
        events.emit(LinkEvent::Up);
    }

    fn disconnect(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_failures_map_to_session_errors() {
        assert_eq!(LinkEvent::Up.session_error(), None);
        assert_eq!(
            LinkEvent::RemoveConfigFailed { ssid: "net".into() }.session_error(),
            Some(SessionError::RemoveWifiConfig { ssid: "net".into() })
        );
        assert_eq!(LinkEvent::Lost.session_error(), Some(SessionError::LinkLost));
        assert_eq!(
            LinkEvent::EnableFailed.session_error(),
            Some(SessionError::EnableWifiNetwork)
        );
    }

    #[test]
    fn direct_link_reports_up_for_its_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        DirectLink.connect("net", "pw", LinkEventSink::new(7, tx));
        match rx.try_recv() {
            Ok(Message::Link { attempt, event }) => {
                assert_eq!(attempt, 7);
                assert_eq!(event, LinkEvent::Up);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
