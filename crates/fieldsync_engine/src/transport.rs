//! Transport seams toward the remote backend.
//!
//! The engine never talks to the network directly. Outbound mutations go
//! through [`RemoteBackend`]; inbound change streams come from a
//! [`ChangeStreamSource`]. The authenticated HTTP/stream plumbing behind
//! these traits is supplied by the surrounding application.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fieldsync_protocol::{
    ChangeStreamEvent, Collection, EntityId, MutationAck, MutationId, MutationRequest,
    VersionMarker,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::mpsc;

/// Executes outbound mutation calls against the remote backend.
///
/// The backend must treat `MutationRequest::mutation_id` as an
/// idempotency key: re-delivery after a retry must not duplicate effects.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Issues one mutation call.
    ///
    /// # Errors
    ///
    /// Returns a transport error for delivery failures; permanent
    /// payload rejections come back as [`MutationAck::Rejected`].
    async fn execute(&self, request: &MutationRequest) -> EngineResult<MutationAck>;
}

/// Opens change streams, one per collection.
#[async_trait]
pub trait ChangeStreamSource: Send + Sync {
    /// Opens a stream of changes for one collection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription cannot be
    /// established.
    async fn subscribe(&self, collection: Collection) -> EngineResult<Box<dyn ChangeStream>>;
}

/// A live change stream for one collection.
#[async_trait]
pub trait ChangeStream: Send {
    /// Waits for the next inbound event.
    ///
    /// `Ok(None)` means the stream closed cleanly; an error means it
    /// broke. Either way the subscriber reconnects.
    async fn next_event(&mut self) -> EngineResult<Option<ChangeStreamEvent>>;
}

// ── Mocks ────────────────────────────────────────────────────────

#[derive(Default)]
struct MockBackendState {
    versions: HashMap<(Collection, EntityId), u64>,
    executed: Vec<MutationRequest>,
    transient_failures: u32,
    reject_ids: HashSet<MutationId>,
    offline: bool,
}

/// A scripted in-memory backend for tests.
///
/// By default every mutation is applied and assigned the entity's next
/// version. Failures are injected per call
/// ([`fail_next`](Self::fail_next)) or per mutation id
/// ([`reject`](Self::reject)).
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockBackendState>,
}

impl MockBackend {
    /// Creates a mock backend that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` calls fail with a retryable transport error.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().transient_failures = n;
    }

    /// Makes calls fail while set, as if the backend were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Permanently rejects the given mutation id.
    pub fn reject(&self, id: MutationId) {
        self.state.lock().reject_ids.insert(id);
    }

    /// Every request that reached the backend, in call order.
    #[must_use]
    pub fn executed(&self) -> Vec<MutationRequest> {
        self.state.lock().executed.clone()
    }

    /// The backend's current version for an entity, if any write landed.
    #[must_use]
    pub fn version_of(&self, collection: Collection, entity_id: &EntityId) -> Option<VersionMarker> {
        self.state
            .lock()
            .versions
            .get(&(collection, entity_id.clone()))
            .map(|v| VersionMarker::new(*v))
    }
}

#[async_trait]
impl RemoteBackend for MockBackend {
    async fn execute(&self, request: &MutationRequest) -> EngineResult<MutationAck> {
        let mut state = self.state.lock();

        if state.offline {
            return Err(EngineError::transport_retryable("backend unreachable"));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(EngineError::transport_retryable("injected transport failure"));
        }

        state.executed.push(request.clone());

        if state.reject_ids.contains(&request.mutation_id) {
            return Ok(MutationAck::Rejected {
                reason: "payload rejected".to_string(),
            });
        }

        let version = state
            .versions
            .entry((request.collection, request.entity_id.clone()))
            .and_modify(|v| *v += 1)
            .or_insert(1);
        Ok(MutationAck::Applied {
            version: VersionMarker::new(*version),
        })
    }
}

type MockSession = mpsc::UnboundedReceiver<ChangeStreamEvent>;

#[derive(Default)]
struct MockStreamState {
    sessions: HashMap<Collection, VecDeque<MockSession>>,
    subscribe_failures: u32,
    subscribe_count: u32,
}

/// A scripted change-stream source for tests.
///
/// Each [`push_session`](Self::push_session) scripts one successful
/// subscription; the returned sender feeds it events, and dropping the
/// sender closes the stream (as a remote disconnect would).
#[derive(Default)]
pub struct MockStreamSource {
    state: Mutex<MockStreamState>,
}

impl MockStreamSource {
    /// Creates a source with no scripted sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next successful subscription for a collection.
    #[must_use]
    pub fn push_session(&self, collection: Collection) -> mpsc::UnboundedSender<ChangeStreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .sessions
            .entry(collection)
            .or_default()
            .push_back(rx);
        tx
    }

    /// Makes the next `n` subscribe calls fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.state.lock().subscribe_failures = n;
    }

    /// How many subscribe calls were made (successful or not).
    #[must_use]
    pub fn subscribe_count(&self) -> u32 {
        self.state.lock().subscribe_count
    }
}

struct MockStream {
    rx: MockSession,
}

#[async_trait]
impl ChangeStream for MockStream {
    async fn next_event(&mut self) -> EngineResult<Option<ChangeStreamEvent>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl ChangeStreamSource for MockStreamSource {
    async fn subscribe(&self, collection: Collection) -> EngineResult<Box<dyn ChangeStream>> {
        let mut state = self.state.lock();
        state.subscribe_count += 1;

        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(EngineError::transport_retryable("injected subscribe failure"));
        }

        match state.sessions.entry(collection).or_default().pop_front() {
            Some(rx) => Ok(Box::new(MockStream { rx })),
            None => Err(EngineError::transport_retryable("no scripted session")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{MutationMethod, Payload, ProjectDoc};

    fn request(entity: &str) -> MutationRequest {
        MutationRequest {
            mutation_id: MutationId::generate(),
            method: MutationMethod::Update,
            collection: Collection::Projects,
            entity_id: EntityId::new(entity),
            payload: Some(Payload::Projects(ProjectDoc {
                schema_version: 1,
                name: entity.to_string(),
                status: "active".to_string(),
                site: None,
                notes: None,
            })),
            base_version: None,
        }
    }

    #[tokio::test]
    async fn mock_backend_applies_with_rising_versions() {
        let backend = MockBackend::new();
        let req = request("p-1");

        let MutationAck::Applied { version } = backend.execute(&req).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(version, VersionMarker::new(1));

        let MutationAck::Applied { version } = backend.execute(&req).await.unwrap() else {
            panic!("expected applied");
        };
        assert_eq!(version, VersionMarker::new(2));
        assert_eq!(backend.executed().len(), 2);
    }

    #[tokio::test]
    async fn mock_backend_injects_transient_failures() {
        let backend = MockBackend::new();
        backend.fail_next(2);
        let req = request("p-1");

        assert!(backend.execute(&req).await.unwrap_err().is_retryable());
        assert!(backend.execute(&req).await.unwrap_err().is_retryable());
        assert!(backend.execute(&req).await.is_ok());
    }

    #[tokio::test]
    async fn mock_backend_rejects_permanently() {
        let backend = MockBackend::new();
        let req = request("p-1");
        backend.reject(req.mutation_id);

        let ack = backend.execute(&req).await.unwrap();
        assert!(matches!(ack, MutationAck::Rejected { .. }));
    }

    #[tokio::test]
    async fn mock_stream_delivers_and_closes() {
        let source = MockStreamSource::new();
        let tx = source.push_session(Collection::Projects);

        let mut stream = source.subscribe(Collection::Projects).await.unwrap();

        tx.send(ChangeStreamEvent::insert(
            EntityId::new("p-1"),
            Payload::Projects(ProjectDoc {
                schema_version: 1,
                name: "A".to_string(),
                status: "active".to_string(),
                site: None,
                notes: None,
            }),
            VersionMarker::new(1),
        ))
        .unwrap();

        let event = stream.next_event().await.unwrap().unwrap();
        assert_eq!(event.entity_id, EntityId::new("p-1"));

        drop(tx);
        assert!(stream.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mock_source_scripts_subscribe_failures() {
        let source = MockStreamSource::new();
        source.fail_next_subscribes(1);
        let _tx = source.push_session(Collection::Projects);

        assert!(source.subscribe(Collection::Projects).await.is_err());
        assert!(source.subscribe(Collection::Projects).await.is_ok());
        assert_eq!(source.subscribe_count(), 2);
    }
}
