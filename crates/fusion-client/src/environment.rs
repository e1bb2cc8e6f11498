//! Environment probes: is the consumer visible, is the network reachable.
//!
//! Subscriptions only start fetching while both hold. Hosts that can observe
//! real visibility or connectivity implement [`EnvironmentProbe`] (or drive a
//! [`ManualEnvironment`]) and report transitions to the context as
//! [`EnvironmentEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};

/// Boolean queries about the hosting environment.
pub trait EnvironmentProbe: Send + Sync {
    /// Whether the consumer is currently visible.
    fn is_document_visible(&self) -> bool;

    /// Whether the network is believed reachable.
    fn is_online(&self) -> bool;

    /// Visible and online: subscriptions may run.
    fn is_available(&self) -> bool {
        self.is_document_visible() && self.is_online()
    }
}

/// Probe for hosts that cannot observe either condition: always available.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAvailable;

impl EnvironmentProbe for AlwaysAvailable {
    fn is_document_visible(&self) -> bool {
        true
    }

    fn is_online(&self) -> bool {
        true
    }
}

/// Probe backed by flags the host flips.
#[derive(Debug)]
pub struct ManualEnvironment {
    visible: AtomicBool,
    online: AtomicBool,
}

impl ManualEnvironment {
    /// Start visible and online.
    pub fn new() -> Self {
        Self::with_state(true, true)
    }

    /// Start in an explicit state.
    pub fn with_state(visible: bool, online: bool) -> Self {
        Self {
            visible: AtomicBool::new(visible),
            online: AtomicBool::new(online),
        }
    }

    /// Record a visibility change.
    pub fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
    }

    /// Record a connectivity change.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for ManualEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentProbe for ManualEnvironment {
    fn is_document_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// Environment transitions that may allow parked subscriptions to resume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvironmentEvent {
    /// Visibility changed.
    VisibilityChanged,
    /// The consumer gained focus.
    Focus,
    /// The network became reachable.
    Online,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_available() {
        assert!(AlwaysAvailable.is_available());
    }

    #[test]
    fn manual_requires_both() {
        let env = ManualEnvironment::new();
        assert!(env.is_available());
        env.set_online(false);
        assert!(!env.is_available());
        env.set_online(true);
        env.set_visible(false);
        assert!(!env.is_available());
        assert!(env.is_online());
    }

    #[test]
    fn manual_initial_state() {
        let env = ManualEnvironment::with_state(false, true);
        assert!(!env.is_document_visible());
        assert!(env.is_online());
    }
}
