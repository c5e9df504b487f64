//! Network reachability, as reported by the host platform.

use async_trait::async_trait;
use tokio::sync::watch;

/// Snapshot of the device's connectivity.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// A network interface is up
    pub is_connected: bool,
    /// Whether the internet is reachable through it, `None` while unknown
    pub is_internet_reachable: Option<bool>,
}

impl NetworkState {
    #[must_use]
    pub const fn new(is_connected: bool, is_internet_reachable: Option<bool>) -> Self {
        Self {
            is_connected,
            is_internet_reachable,
        }
    }

    #[must_use]
    pub const fn online() -> Self {
        Self::new(true, Some(true))
    }

    #[must_use]
    pub const fn offline() -> Self {
        Self::new(false, Some(false))
    }

    /// Unknown reachability counts as online; only an explicit `Some(false)` is offline.
    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.is_connected && !matches!(self.is_internet_reachable, Some(false))
    }
}

/// Reports current reachability on demand.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
    async fn state(&self) -> NetworkState;
}

/// Probe for hosts without a reachability signal.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysOnline;

#[async_trait]
impl ConnectivityProbe for AlwaysOnline {
    async fn state(&self) -> NetworkState {
        NetworkState::online()
    }
}

/// Reads the latest state pushed by the platform's reachability listener.
#[async_trait]
impl ConnectivityProbe for watch::Receiver<NetworkState> {
    async fn state(&self) -> NetworkState {
        *self.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_rules() {
        assert!(NetworkState::online().is_online());
        assert!(NetworkState::new(true, None).is_online());
        assert!(!NetworkState::new(true, Some(false)).is_online());
        assert!(!NetworkState::new(false, None).is_online());
        assert!(!NetworkState::offline().is_online());
    }

    #[tokio::test]
    async fn watched_probe_reports_latest_state() {
        let (tx, rx) = watch::channel(NetworkState::online());
        assert!(rx.state().await.is_online());

        tx.send_replace(NetworkState::offline());
        assert!(!rx.state().await.is_online());
    }
}
