//! Cluster lifecycle status tracking.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::cluster::events::ClusterEvent;

/// Lifecycle status of a cluster client.
///
/// The happy path runs `wait -> connecting -> connect -> ready`. A lost
/// cluster goes through `disconnecting -> close`, and from `close` either
/// re-enters the cycle via `reconnecting` or terminates in `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Created but not yet connecting (lazy connect).
    Wait,
    /// Fetching the initial topology.
    Connecting,
    /// Topology fetched, at least one node reachable.
    Connect,
    /// Ready check passed (or skipped); commands flow.
    Ready,
    /// Tear-down in progress.
    Disconnecting,
    /// All node connections are gone.
    Close,
    /// Waiting for the retry delay before reconnecting.
    Reconnecting,
    /// Terminal. No further transitions.
    End,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClusterStatus::Wait => "wait",
            ClusterStatus::Connecting => "connecting",
            ClusterStatus::Connect => "connect",
            ClusterStatus::Ready => "ready",
            ClusterStatus::Disconnecting => "disconnecting",
            ClusterStatus::Close => "close",
            ClusterStatus::Reconnecting => "reconnecting",
            ClusterStatus::End => "end",
        };
        f.write_str(name)
    }
}

/// Holds the current status and announces every change.
///
/// All transitions funnel through [`set`](StatusMachine::set), which logs
/// the old and new value and broadcasts a [`ClusterEvent::Status`].
#[derive(Debug)]
pub struct StatusMachine {
    current: Mutex<ClusterStatus>,
    events: broadcast::Sender<ClusterEvent>,
}

impl StatusMachine {
    /// Creates a machine in the `wait` state.
    pub fn new(events: broadcast::Sender<ClusterEvent>) -> Self {
        Self {
            current: Mutex::new(ClusterStatus::Wait),
            events,
        }
    }

    /// Returns the current status.
    pub fn status(&self) -> ClusterStatus {
        *self.current.lock().unwrap()
    }

    /// Moves to a new status and broadcasts it.
    pub fn set(&self, status: ClusterStatus) {
        let old = {
            let mut current = self.current.lock().unwrap();
            let old = *current;
            *current = status;
            old
        };
        debug!("status: {} -> {}", old, status);
        let _ = self.events.send(ClusterEvent::Status(status));
    }

    /// Returns true if the current status is one of `statuses`.
    pub fn is_one_of(&self, statuses: &[ClusterStatus]) -> bool {
        statuses.contains(&self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_wait() {
        let (tx, _rx) = broadcast::channel(16);
        let machine = StatusMachine::new(tx);
        assert_eq!(machine.status(), ClusterStatus::Wait);
    }

    #[tokio::test]
    async fn set_broadcasts_new_status() {
        let (tx, mut rx) = broadcast::channel(16);
        let machine = StatusMachine::new(tx);

        machine.set(ClusterStatus::Connecting);
        machine.set(ClusterStatus::Connect);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::Status(ClusterStatus::Connecting)
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClusterEvent::Status(ClusterStatus::Connect)
        ));
        assert_eq!(machine.status(), ClusterStatus::Connect);
    }

    #[test]
    fn set_without_listeners_does_not_panic() {
        let (tx, rx) = broadcast::channel(16);
        drop(rx);
        let machine = StatusMachine::new(tx);
        machine.set(ClusterStatus::End);
        assert_eq!(machine.status(), ClusterStatus::End);
    }

    #[test]
    fn is_one_of() {
        let (tx, _rx) = broadcast::channel(16);
        let machine = StatusMachine::new(tx);
        machine.set(ClusterStatus::Ready);
        assert!(machine.is_one_of(&[ClusterStatus::Connect, ClusterStatus::Ready]));
        assert!(!machine.is_one_of(&[ClusterStatus::End]));
    }

    #[test]
    fn display_names() {
        assert_eq!(ClusterStatus::Wait.to_string(), "wait");
        assert_eq!(ClusterStatus::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ClusterStatus::End.to_string(), "end");
    }
}
