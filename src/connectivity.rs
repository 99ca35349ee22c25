//! Host connectivity flag with change notification.

use std::sync::Arc;

use log::info;
use tokio::sync::watch;

/// Shared online/offline flag.
///
/// The embedding application flips it from its own network monitor; the
/// retry scheduler subscribes to transitions.
#[derive(Clone)]
pub struct Connectivity {
    state: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Updates the flag. Subscribers are only woken on an actual transition.
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
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}
