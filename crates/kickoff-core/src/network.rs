//! Connectivity tracking shared by the remote adapter, queue and worker.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared online/offline flag with change notifications.
#[derive(Clone, Debug)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a connectivity change; subscribers are only woken on actual transitions
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_state() {
        let monitor = NetworkMonitor::online();
        let clone = monitor.clone();
        clone.set_online(false);
        assert!(!monitor.is_online());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_see_transitions() {
        let monitor = NetworkMonitor::new(false);
        let mut receiver = monitor.subscribe();
        monitor.set_online(true);
        receiver.changed().await.unwrap();
        assert!(*receiver.borrow());
    }
}
