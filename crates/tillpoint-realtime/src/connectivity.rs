//! Host network state.

use tokio::sync::watch;

/// Whether the host currently has network access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    Online,
    Offline,
}

impl NetworkState {
    pub fn is_online(self) -> bool {
        self == NetworkState::Online
    }
}

/// Source of online/offline transitions.
///
/// Implementations publish the current state on a watch channel; the
/// manager reacts to every change.
pub trait ConnectivityObserver: Send + Sync {
    /// Subscribe to network state changes.
    fn watch(&self) -> watch::Receiver<NetworkState>;
}

/// Connectivity set by hand.
///
/// Hosts without a native network monitor can drive it from their own
/// signals; tests use it to simulate transitions.
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<NetworkState>,
}

impl ManualConnectivity {
    /// Start in the given state.
    pub fn new(initial: NetworkState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Start online.
    pub fn online() -> Self {
        Self::new(NetworkState::Online)
    }

    /// Report that the network came back.
    pub fn set_online(&self) {
        self.set(NetworkState::Online);
    }

    /// Report that the network went away.
    pub fn set_offline(&self) {
        self.set(NetworkState::Offline);
    }

    /// Current state.
    pub fn state(&self) -> NetworkState {
        *self.tx.borrow()
    }

    fn set(&self, state: NetworkState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::info!(?previous, current = ?state, "network state changed");
        }
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::online()
    }
}

impl ConnectivityObserver for ManualConnectivity {
    fn watch(&self) -> watch::Receiver<NetworkState> {
        self.tx.subscribe()
    }
}
