//! Supervised background tasks.
//!
//! Every timer and loop the engine spawns is registered here, so
//! shutdown is an explicit teardown of known handles instead of orphaned
//! tasks waiting for the runtime to die.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::debug;

/// Owns the engine's background task handles.
#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a named task under supervision.
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        debug!(task = %name, "spawning supervised task");
        let handle = tokio::spawn(future);
        self.tasks.lock().push((name, handle));
    }

    /// Number of tasks ever spawned (finished tasks included).
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Aborts every task. Idempotent.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock();
        for (name, handle) in tasks.drain(..) {
            debug!(task = %name, "aborting supervised task");
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
