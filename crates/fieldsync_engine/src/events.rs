//! Typed engine events and the event bus.
//!
//! Components never call into the UI layer. They publish variants of
//! [`EngineEvent`] onto one internal channel; a single dispatcher loop
//! logs each event and fans it out to subscribers. Publishing never
//! blocks and never returns an error into the caller.

use fieldsync_protocol::{
    Collection, ConflictId, EntityId, MutationId, SyncConflict, Timestamp,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// What kicked off a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity came back.
    Online,
    /// The periodic timer fired.
    Interval,
    /// An explicit caller request.
    Manual,
}

/// Outcome of a completed sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Mutations acknowledged by the backend this run.
    pub synced: u64,
    /// Delivery attempts that failed this run.
    pub failed: u64,
    /// Mutations still queued when the run ended.
    pub remaining: u64,
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// True if the run was cancelled before draining the queue.
    pub aborted: bool,
}

/// The closed set of events the engine emits toward the UI layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A sync run started.
    SyncStarted {
        /// What triggered the run.
        trigger: SyncTrigger,
    },
    /// A sync run finished a batch; counts are the run's running totals.
    SyncProgress {
        /// Mutations acknowledged so far.
        synced: u64,
        /// Attempts failed so far.
        failed: u64,
        /// Mutations still queued.
        remaining: u64,
    },
    /// A sync run finished (including aborted runs).
    SyncCompleted {
        /// Run outcome.
        report: SyncReport,
    },
    /// A sync run died on an internal error.
    SyncFailed {
        /// Failure description.
        reason: String,
    },
    /// A queued mutation was dropped terminally.
    MutationFailed {
        /// The dropped mutation.
        mutation_id: MutationId,
        /// The entity it targeted.
        entity_id: EntityId,
        /// Its collection.
        collection: Collection,
        /// Failed attempts at drop time.
        retry_count: u32,
        /// Why the mutation was dropped.
        reason: String,
    },
    /// A divergence between local and remote state was detected.
    ConflictDetected {
        /// The new conflict, both payloads intact.
        conflict: SyncConflict,
    },
    /// An open conflict was terminally resolved.
    ConflictResolved {
        /// The resolved conflict.
        conflict_id: ConflictId,
        /// The entity it concerned.
        entity_id: EntityId,
    },
    /// An entity record was written locally.
    EntitySaved {
        /// Its collection.
        collection: Collection,
        /// The entity.
        entity_id: EntityId,
    },
    /// An entity record was removed locally.
    EntityRemoved {
        /// Its collection.
        collection: Collection,
        /// The entity.
        entity_id: EntityId,
    },
    /// Online/offline transition.
    ConnectionChanged {
        /// True when the device just came online.
        online: bool,
    },
    /// A realtime subscription reached the connected state.
    RealtimeConnected {
        /// The subscribed collection.
        collection: Collection,
    },
    /// A realtime subscription lost its stream.
    RealtimeDisconnected {
        /// The subscribed collection.
        collection: Collection,
        /// Whether an automatic reconnect will follow.
        will_retry: bool,
    },
    /// Periodic liveness signal from a connected subscription.
    RealtimeHeartbeat {
        /// The subscribed collection.
        collection: Collection,
        /// When the heartbeat fired.
        at: Timestamp,
    },
    /// A subscription exhausted its reconnect attempts and gave up.
    ReconnectsExhausted {
        /// The subscribed collection.
        collection: Collection,
        /// Attempts made before giving up.
        attempts: u32,
    },
}

/// Subscriber backlog before the oldest events are dropped.
const SUBSCRIBER_BUFFER: usize = 256;

/// Handle for publishing and subscribing to engine events.
///
/// Cloning is cheap; every component holds one.
#[derive(Clone)]
pub struct EventBus {
    intake: mpsc::UnboundedSender<EngineEvent>,
    fanout: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates the bus and its dispatcher.
    ///
    /// The dispatcher must be driven (spawned) for subscribers to see
    /// events.
    #[must_use]
    pub fn new() -> (Self, EventDispatcher) {
        let (intake, rx) = mpsc::unbounded_channel();
        let (fanout, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let bus = Self {
            intake,
            fanout: fanout.clone(),
        };
        (bus, EventDispatcher { rx, fanout })
    }

    /// Publishes an event. Never blocks; a missing dispatcher (engine
    /// shutting down) silently drops the event.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.intake.send(event);
    }

    /// Returns a new subscription to the fan-out side of the bus.
    ///
    /// Slow subscribers miss the oldest events once their backlog
    /// exceeds the internal buffer.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.fanout.subscribe()
    }
}

/// The single consumer of the internal event channel.
pub struct EventDispatcher {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
    fanout: broadcast::Sender<EngineEvent>,
}

impl EventDispatcher {
    /// Runs until every publishing handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            debug!(?event, "engine event");
            // No subscribers is fine; events are fire-and-forget.
            let _ = self.fanout.send(event);
        }
    }
}
