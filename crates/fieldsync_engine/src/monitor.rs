//! Connectivity tracking.
//!
//! How reachability is measured is environment-specific (OS reachability
//! APIs, captive-portal probes, ...); the surrounding application feeds
//! observations in through [`ConnectionMonitor::set_connectivity`]. The
//! engine itself only depends on the resulting transitions.

use crate::config::NetworkThreshold;
use crate::events::{EngineEvent, EventBus};
use tokio::sync::watch;
use tracing::info;

/// The kind of link the device is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Wifi or comparable unmetered link.
    Wifi,
    /// Cellular/metered link.
    Cellular,
    /// Wired link.
    Ethernet,
}

/// Coarse link quality as reported by the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkQuality {
    /// Link is usable for bulk transfer.
    Good,
    /// Link is degraded.
    Poor,
}

/// A snapshot of current reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connectivity {
    /// Whether the backend is reachable at all.
    pub online: bool,
    /// The link kind, when online.
    pub link: Option<LinkKind>,
    /// The link quality, when online.
    pub quality: LinkQuality,
}

impl Connectivity {
    /// The offline state.
    #[must_use]
    pub fn offline() -> Self {
        Self {
            online: false,
            link: None,
            quality: LinkQuality::Poor,
        }
    }

    /// An online state on the given link.
    #[must_use]
    pub fn online(link: LinkKind, quality: LinkQuality) -> Self {
        Self {
            online: true,
            link: Some(link),
            quality,
        }
    }

    /// Returns true if this state satisfies a sync gate.
    #[must_use]
    pub fn meets(&self, threshold: NetworkThreshold) -> bool {
        if !self.online {
            return false;
        }
        match threshold {
            NetworkThreshold::Any => true,
            NetworkThreshold::WifiOnly => {
                matches!(self.link, Some(LinkKind::Wifi) | Some(LinkKind::Ethernet))
            }
            NetworkThreshold::GoodConnectionOnly => self.quality == LinkQuality::Good,
        }
    }
}

/// Tracks reachability and emits transition events.
///
/// State is transient: every process starts offline until the
/// environment reports otherwise.
pub struct ConnectionMonitor {
    state: watch::Sender<Connectivity>,
    bus: EventBus,
}

impl ConnectionMonitor {
    /// Creates a monitor in the offline state.
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        let (state, _) = watch::channel(Connectivity::offline());
        Self { state, bus }
    }

    /// Feeds a reachability observation in.
    ///
    /// Emits [`EngineEvent::ConnectionChanged`] only on online/offline
    /// transitions, not on link/quality changes.
    pub fn set_connectivity(&self, connectivity: Connectivity) {
        let was_online = self.state.borrow().online;
        self.state.send_replace(connectivity);

        if was_online != connectivity.online {
            info!(online = connectivity.online, "connectivity transition");
            self.bus.publish(EngineEvent::ConnectionChanged {
                online: connectivity.online,
            });
        }
    }

    /// Returns true if the backend is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.borrow().online
    }

    /// Returns the current connectivity snapshot.
    #[must_use]
    pub fn connectivity(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Returns a receiver that observes every connectivity change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Returns true if the current state satisfies a sync gate.
    #[must_use]
    pub fn meets(&self, threshold: NetworkThreshold) -> bool {
        self.state.borrow().meets(threshold)
    }
}
