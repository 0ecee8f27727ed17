//! Per-collection realtime change-stream subscriptions.

use crate::applier::{ApplyOutcome, RemoteApplier};
use crate::config::EngineConfig;
use crate::events::{EngineEvent, EventBus};
use crate::transport::ChangeStreamSource;
use fieldsync_protocol::{ChangeStreamEvent, Collection, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where a subscription stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Not connected and not trying; the initial and terminal state.
    Disconnected,
    /// Opening the stream.
    Connecting,
    /// Live and applying events.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
}

/// In-memory connection state for one subscription.
///
/// Rebuilt from scratch at process start; nothing here is durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Current status.
    pub status: SubscriptionStatus,
    /// Consecutive failed attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// When the last heartbeat fired, if any.
    pub last_heartbeat_at: Option<Timestamp>,
}

impl ConnectionState {
    fn new() -> Self {
        Self {
            status: SubscriptionStatus::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
        }
    }
}

/// Bounded history of applied events, oldest evicted first.
struct ReplayBuffer {
    events: VecDeque<ChangeStreamEvent>,
    capacity: usize,
}

impl ReplayBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    fn push(&mut self, event: ChangeStreamEvent) {
        if self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn events_since(&self, since: Timestamp) -> Vec<ChangeStreamEvent> {
        self.events
            .iter()
            .filter(|e| e.occurred_at > since)
            .cloned()
            .collect()
    }
}

/// Maintains one logical subscription to a remote collection's change
/// stream.
///
/// # Lifecycle
///
/// `Disconnected -> Connecting -> Connected`; on stream error or close,
/// `Connected -> Reconnecting` with a linear capped backoff
/// (`base * attempt`). After `reconnect_max_attempts` consecutive
/// failures the subscription goes terminally `Disconnected` and emits
/// [`EngineEvent::ReconnectsExhausted`] exactly once; only an explicit
/// restart resumes it.
///
/// While connected, a heartbeat timer emits a liveness event on each
/// tick. Staleness is the consumer's judgement; a missing heartbeat
/// never forces a reconnect here.
pub struct RealtimeSubscriber {
    collection: Collection,
    source: Arc<dyn ChangeStreamSource>,
    applier: Arc<RemoteApplier>,
    bus: EventBus,
    config: EngineConfig,
    state: RwLock<ConnectionState>,
    replay: Mutex<ReplayBuffer>,
    /// Stop signal for the current run; replaced wholesale on reset so a
    /// stale run can never be revived by a later restart.
    stop: Mutex<watch::Sender<bool>>,
}

impl RealtimeSubscriber {
    /// Creates a subscriber for one collection.
    #[must_use]
    pub fn new(
        collection: Collection,
        source: Arc<dyn ChangeStreamSource>,
        applier: Arc<RemoteApplier>,
        bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        let capacity = config.buffer_capacity;
        Self {
            collection,
            source,
            applier,
            bus,
            config,
            state: RwLock::new(ConnectionState::new()),
            replay: Mutex::new(ReplayBuffer::new(capacity)),
            stop: Mutex::new(stop),
        }
    }

    /// The collection this subscription covers.
    #[must_use]
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Current connection state snapshot.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Applied events committed after `since`, from the replay buffer.
    ///
    /// Serves catch-up for consumers that reconnect or subscribe late;
    /// events older than the buffer capacity are gone.
    #[must_use]
    pub fn events_since(&self, since: Timestamp) -> Vec<ChangeStreamEvent> {
        self.replay.lock().events_since(since)
    }

    /// Stops the subscription and cancels any pending backoff timer.
    pub fn stop(&self) {
        let _ = self.stop.lock().send(true);
    }

    /// Arms a fresh stop channel and clears the attempt counter ahead of
    /// a restart. Any still-running loop keeps its old (stopped) channel.
    pub fn reset(&self) {
        let (stop, _) = watch::channel(false);
        *self.stop.lock() = stop;
        let mut state = self.state.write();
        state.reconnect_attempts = 0;
        state.status = SubscriptionStatus::Disconnected;
    }

    fn set_status(&self, status: SubscriptionStatus) {
        self.state.write().status = status;
    }

    /// The subscription loop. Runs until stopped, or until reconnect
    /// attempts are exhausted.
    pub async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop.lock().subscribe();
        let mut attempts = 0u32;

        loop {
            if *stop_rx.borrow_and_update() {
                break;
            }

            self.set_status(SubscriptionStatus::Connecting);
            match self.source.subscribe(self.collection).await {
                Ok(stream) => {
                    attempts = 0;
                    {
                        let mut state = self.state.write();
                        state.status = SubscriptionStatus::Connected;
                        state.reconnect_attempts = 0;
                    }
                    info!(collection = %self.collection, "realtime stream connected");
                    self.bus.publish(EngineEvent::RealtimeConnected {
                        collection: self.collection,
                    });

                    let stopped = self.pump(stream, &mut stop_rx).await;
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    debug!(collection = %self.collection, error = %e, "subscribe failed");
                }
            }

            attempts += 1;
            self.state.write().reconnect_attempts = attempts;

            if attempts > self.config.reconnect_max_attempts {
                warn!(
                    collection = %self.collection,
                    attempts = self.config.reconnect_max_attempts,
                    "reconnect attempts exhausted, giving up"
                );
                self.set_status(SubscriptionStatus::Disconnected);
                self.bus.publish(EngineEvent::ReconnectsExhausted {
                    collection: self.collection,
                    attempts: self.config.reconnect_max_attempts,
                });
                return;
            }

            self.set_status(SubscriptionStatus::Reconnecting);
            let delay = self.config.reconnect_delay(attempts);
            debug!(
                collection = %self.collection,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "waiting before reconnect"
            );
            tokio::select! {
                changed = stop_rx.changed() => {
                    // A closed channel means the subscriber was reset out
                    // from under this run; treat it as a stop.
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_status(SubscriptionStatus::Disconnected);
        debug!(collection = %self.collection, "subscription stopped");
    }

    /// Reads one connected stream until it closes or the subscriber is
    /// stopped. Returns true if stopped.
    async fn pump(
        &self,
        mut stream: Box<dyn crate::transport::ChangeStream>,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return true;
                    }
                }
                _ = heartbeat.tick() => {
                    let at = Timestamp::now();
                    self.state.write().last_heartbeat_at = Some(at);
                    self.bus.publish(EngineEvent::RealtimeHeartbeat {
                        collection: self.collection,
                        at,
                    });
                }
                next = stream.next_event() => {
                    match next {
                        Ok(Some(event)) => self.handle_event(event).await,
                        Ok(None) => {
                            info!(collection = %self.collection, "stream closed by remote");
                            self.bus.publish(EngineEvent::RealtimeDisconnected {
                                collection: self.collection,
                                will_retry: true,
                            });
                            return false;
                        }
                        Err(e) => {
                            warn!(collection = %self.collection, error = %e, "stream error");
                            self.bus.publish(EngineEvent::RealtimeDisconnected {
                                collection: self.collection,
                                will_retry: true,
                            });
                            return false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: ChangeStreamEvent) {
        match self.applier.apply(event.clone()).await {
            Ok(ApplyOutcome::Applied) => {
                self.replay.lock().push(event);
            }
            Ok(_) => {}
            Err(e) => {
                // A bad event must not take the stream down.
                warn!(
                    collection = %self.collection,
                    entity = %event.entity_id,
                    error = %e,
                    "failed to apply change event"
                );
            }
        }
    }
}
