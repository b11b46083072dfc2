//! Network and authentication state.
//!
//! The engine only reconciles while the device is online and a user is
//! logged in. Hosts report both through these traits and notify the engine
//! of changes with `on_network_state_changed` / `on_auth_state_changed`.

use std::sync::atomic::{AtomicBool, Ordering};

/// Reports whether the remote store is reachable.
pub trait NetworkMonitor: Send + Sync {
    /// Returns true while connected.
    fn is_connected(&self) -> bool;
}

/// Reports whether a user is logged in.
pub trait AuthMonitor: Send + Sync {
    /// Returns true while logged in.
    fn is_logged_in(&self) -> bool;
}

/// A switchable implementation of both monitors.
///
/// Starts connected and logged in.
#[derive(Debug)]
pub struct Connectivity {
    connected: AtomicBool,
    logged_in: AtomicBool,
}

impl Connectivity {
    /// Creates a connected, logged-in monitor.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            logged_in: AtomicBool::new(true),
        }
    }

    /// Sets the network state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Sets the login state.
    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkMonitor for Connectivity {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl AuthMonitor for Connectivity {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_switches() {
        let monitor = Connectivity::default();
        assert!(monitor.is_connected());
        assert!(monitor.is_logged_in());

        monitor.set_connected(false);
        monitor.set_logged_in(false);
        assert!(!monitor.is_connected());
        assert!(!monitor.is_logged_in());
    }
}
