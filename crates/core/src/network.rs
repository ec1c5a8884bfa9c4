//! Connectivity state fed by the host platform.

use log::debug;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Online,
    Offline,
}

/// Shared online/offline flag with change notification.
///
/// The host calls [`NetworkMonitor::set_online`] on connectivity transitions; the sync manager
/// reads the flag before each remote call and watches it for offline→online edges.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    sender: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn online() -> Self {
        Self::new(NetworkStatus::Online)
    }

    pub fn offline() -> Self {
        Self::new(NetworkStatus::Offline)
    }

    pub fn status(&self) -> NetworkStatus {
        *self.sender.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    pub fn set_online(&self, online: bool) {
        let status = if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        let changed = self.sender.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            debug!("[Network] Connectivity changed: {:?}", status);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transitions_notify_subscribers_once() {
        let monitor = NetworkMonitor::offline();
        let mut rx = monitor.subscribe();
        assert!(!monitor.is_online());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Online);

        // same state again is not a transition
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn clones_share_state() {
        let monitor = NetworkMonitor::online();
        let handle = monitor.clone();
        handle.set_online(false);
        assert_eq!(monitor.status(), NetworkStatus::Offline);
    }
}
