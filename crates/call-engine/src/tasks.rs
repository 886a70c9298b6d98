//! Tracked background tasks with cooperative cancellation
//!
//! Every long-running loop of the engine is spawned through a [`TaskSet`] so
//! shutdown can cancel them together and wait (bounded) for them to exit.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct TrackedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// A named group of cancellable tasks
pub struct TaskSet {
    name: &'static str,
    cancel: CancellationToken,
    tasks: Mutex<Vec<TrackedTask>>,
}

impl TaskSet {
    pub fn new(name: &'static str) -> Self {
        Self::with_token(name, CancellationToken::new())
    }

    /// Task set driven by an existing token (e.g. a child of the engine token)
    pub fn with_token(name: &'static str, cancel: CancellationToken) -> Self {
        Self {
            name,
            cancel,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token observed by every task in this set
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Spawn `future`; it is dropped at its next suspension point once the
    /// set is cancelled
    pub fn spawn<F>(&self, name: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = self.cancel.clone();
        let set_name = self.name;
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = future => debug!("Task {}/{} completed", set_name, task_name),
                _ = cancel.cancelled() => debug!("Task {}/{} cancelled", set_name, task_name),
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TrackedTask { name, handle });
    }

    /// Number of tasks not yet finished
    pub fn active(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.handle.is_finished()).count()
    }

    /// Cancel every task and wait up to `timeout` for them to exit; stragglers
    /// are aborted
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        let tasks: Vec<TrackedTask> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        debug!("Shutting down {} task(s) in {}", tasks.len(), self.name);
        let names: Vec<String> = tasks.iter().map(|t| t.name.clone()).collect();
        let aborts: Vec<_> = tasks.iter().map(|t| t.handle.abort_handle()).collect();
        let join_all = async {
            for task in tasks {
                let _ = task.handle.await;
            }
        };

        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("{} shutdown timed out after {:?}, aborting {:?}", self.name, timeout, names);
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
