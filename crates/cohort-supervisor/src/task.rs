//! Workers as tasks of the current process.
//!
//! Same supervision, no `fork`/`exec`: each worker is a tokio task built
//! by a factory closure. Killing one aborts its task, which the supervisor
//! sees as `SIGKILL`. A panicking worker exits with code 101, like a
//! panicking Rust binary.

use std::future::Future;
use std::sync::Arc;

use cohort_protocol::WorkerId;
use dashmap::DashMap;
use tokio::task::{AbortHandle, JoinHandle};

use crate::{ExitCause, SupervisorError, WorkerLauncher, WorkerProcess};

/// Exit code of a worker task that panicked.
const PANIC_EXIT_CODE: i32 = 101;

/// Launches each worker as a task running `factory(id)`.
///
/// Clones share the set of running tasks, so a test can keep one clone
/// to [`kill`](Self::kill) workers while the supervisor owns another.
pub struct TaskLauncher<F> {
    factory: Arc<F>,
    running: Arc<DashMap<WorkerId, AbortHandle>>,
}

impl<F, Fut> TaskLauncher<F>
where
    F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            running: Arc::new(DashMap::new()),
        }
    }

    /// Aborts a running worker. Returns `false` if it was not running.
    pub fn kill(&self, id: WorkerId) -> bool {
        match self.running.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Ids of the workers currently running.
    pub fn running(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.running.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }
}

impl<F> Clone for TaskLauncher<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            running: Arc::clone(&self.running),
        }
    }
}

impl<F, Fut> WorkerLauncher for TaskLauncher<F>
where
    F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Process = TaskProcess;

    async fn launch(&self, id: WorkerId) -> Result<TaskProcess, SupervisorError> {
        let handle = tokio::spawn((self.factory)(id));
        self.running.insert(id, handle.abort_handle());
        Ok(TaskProcess {
            id,
            guard: AbortOnDrop(handle.abort_handle()),
            handle,
            running: Arc::clone(&self.running),
        })
    }
}

/// A worker running as a task. Dropping it aborts the task, the way a
/// child process is killed on drop.
#[derive(Debug)]
pub struct TaskProcess {
    id: WorkerId,
    handle: JoinHandle<()>,
    guard: AbortOnDrop,
    running: Arc<DashMap<WorkerId, AbortHandle>>,
}

impl WorkerProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(self) -> Result<ExitCause, SupervisorError> {
        let TaskProcess {
            id,
            handle,
            guard,
            running,
        } = self;
        let result = handle.await;
        drop(guard);
        running.remove(&id);

        Ok(match result {
            Ok(()) => ExitCause::Code(0),
            Err(e) if e.is_cancelled() => ExitCause::KILLED,
            Err(_) => ExitCause::Code(PANIC_EXIT_CODE),
        })
    }
}

#[derive(Debug)]
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
