//! # FieldSync Engine
//!
//! Offline-first synchronization and conflict resolution for the
//! FieldSync dashboard.
//!
//! This crate provides:
//! - A durable, prioritized [`MutationQueue`] of local writes
//! - A batched upload [`SyncEngine`] with retry, cancellation and a
//!   single-flight run guard
//! - [`ConflictResolver`]: divergence detection and the
//!   client-wins / server-wins / merge / manual strategies
//! - [`RealtimeSubscriber`]: per-collection change-stream subscriptions
//!   with linear capped reconnect backoff, heartbeats and a bounded
//!   replay buffer
//! - [`ConnectionMonitor`]: reachability state and transition events
//! - A typed [`EventBus`] toward the UI layer
//!
//! ## Architecture
//!
//! Local writes land durably in the store and the queue, then flow to
//! the backend in batches; remote changes stream in per collection and
//! pass through conflict detection before touching local state:
//!
//! ```text
//! UI -> MutationQueue -> SyncEngine -> remote backend
//! remote backend -> RealtimeSubscriber -> ConflictResolver -> LocalStore -> EventBus -> UI
//! ```
//!
//! ## Key Invariants
//!
//! - Every local write is durable before the call returns
//! - At most one sync run is in flight; extra triggers are no-ops
//! - Mutation ids are idempotency keys; re-delivery is harmless
//! - At most one open conflict per entity; remote events buffer behind it
//! - All store access is serialized per entity id
//!
//! The engine is one explicit instance ([`Engine::open`]) handed to call
//! sites; there are no globals and no hidden timers. Every background
//! task is owned by the engine's scheduler and dies on
//! [`Engine::shutdown`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod conflict;
mod engine;
mod error;
mod events;
mod locks;
mod monitor;
mod queue;
mod realtime;
mod scheduler;
mod sync;
mod transport;

pub use applier::{ApplyOutcome, RemoteApplier};
pub use config::{EngineConfig, NetworkThreshold};
pub use conflict::{ConflictResolver, MergeFn, Resolution};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, EventBus, EventDispatcher, SyncReport, SyncTrigger};
pub use locks::EntityLocks;
pub use monitor::{ConnectionMonitor, Connectivity, LinkKind, LinkQuality};
pub use queue::{MutationQueue, RequeueOutcome};
pub use realtime::{ConnectionState, RealtimeSubscriber, SubscriptionStatus};
pub use scheduler::Scheduler;
pub use sync::SyncEngine;
pub use transport::{
    ChangeStream, ChangeStreamSource, MockBackend, MockStreamSource, RemoteBackend,
};
