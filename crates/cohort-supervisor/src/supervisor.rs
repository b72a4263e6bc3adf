//! The supervisor: a fixed-size pool of workers kept alive forever.

use std::time::Duration;

use cohort_protocol::WorkerId;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::policy::RestartTracker;
use crate::{ExitCause, RestartPolicy, SupervisorError, WorkerLauncher, WorkerProcess};

/// Minimum pause before retrying a replacement that failed to launch.
const LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

/// Lifecycle of one worker incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Being launched.
    Starting,
    /// Launched and not yet seen to exit.
    Running,
    /// Gone. Its slot will be given to a replacement.
    Exited,
}

/// The supervisor's view of one pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Position in the pool, `0..pool_size`. Reused by replacements.
    pub slot: usize,
    /// Unique per incarnation; a replacement gets a fresh one.
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub state: WorkerState,
    /// Why this incarnation ended, once it has.
    pub exit: Option<ExitCause>,
}

/// The whole pool at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerHandle>,
    /// Replacement workers launched since start.
    pub restarts: u64,
}

impl PoolSnapshot {
    /// Number of workers in [`WorkerState::Running`].
    pub fn running(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
            .count()
    }

    /// Ids of the running workers, in slot order.
    pub fn running_ids(&self) -> Vec<WorkerId> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
            .map(|w| w.id)
            .collect()
    }

    pub fn slot(&self, slot: usize) -> Option<&WorkerHandle> {
        self.workers.get(slot)
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Keeps `pool_size` workers alive.
///
/// ```rust,ignore
/// let handle = Supervisor::new(ProcessLauncher::current_exe()?, 4)
///     .restart_policy(RestartPolicy::Immediate)
///     .start()
///     .await?;
/// handle.join().await?;
/// ```
pub struct Supervisor<L> {
    launcher: L,
    pool_size: usize,
    policy: RestartPolicy,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(launcher: L, pool_size: usize) -> Self {
        Self {
            launcher,
            pool_size,
            policy: RestartPolicy::default(),
        }
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Launches the initial pool and starts observing it.
    ///
    /// # Errors
    /// [`SupervisorError::EmptyPool`] for a pool size of 0, or the first
    /// launch error. Workers already launched are stopped in that case.
    pub async fn start(self) -> Result<SupervisorHandle, SupervisorError> {
        if self.pool_size == 0 {
            return Err(SupervisorError::EmptyPool);
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());

        let mut observer = Observer {
            launcher: self.launcher,
            tracker: RestartTracker::new(self.policy),
            pool: Vec::with_capacity(self.pool_size),
            next_id: 1,
            restarts: 0,
            events: events_tx,
            tasks: JoinSet::new(),
            snapshot: snapshot_tx,
        };
        for slot in 0..self.pool_size {
            observer.launch(slot).await?;
        }

        tracing::info!(pool_size = self.pool_size, policy = ?self.policy, "worker pool started");
        let task = tokio::spawn(observer.run(events_rx));

        Ok(SupervisorHandle {
            snapshot: snapshot_rx,
            task: Some(task),
        })
    }
}

/// Handle to a running supervisor. Dropping it stops the supervisor and
/// its workers.
#[derive(Debug)]
pub struct SupervisorHandle {
    snapshot: watch::Receiver<PoolSnapshot>,
    task: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// The pool as of now.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that sees every pool change.
    pub fn subscribe(&self) -> watch::Receiver<PoolSnapshot> {
        self.snapshot.clone()
    }

    /// Waits until at least `n` workers are running.
    pub async fn wait_for_running(&self, n: usize) -> Result<PoolSnapshot, SupervisorError> {
        self.wait_until(|pool| pool.running() >= n).await
    }

    /// Waits until the pool satisfies `condition`.
    pub async fn wait_until(
        &self,
        condition: impl FnMut(&PoolSnapshot) -> bool,
    ) -> Result<PoolSnapshot, SupervisorError> {
        let mut rx = self.snapshot.clone();
        let pool = rx
            .wait_for(condition)
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        Ok(pool.clone())
    }

    /// Runs until the supervisor stops, which only happens if its observer
    /// dies. Under normal operation this never returns.
    pub async fn join(mut self) -> Result<(), SupervisorError> {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "supervisor observer died");
            }
        }
        Err(SupervisorError::Stopped)
    }

    /// Stops observing and stops every worker.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::info!("worker pool stopped");
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

enum Event {
    Exited {
        slot: usize,
        id: WorkerId,
        result: Result<ExitCause, SupervisorError>,
    },
    Relaunch {
        slot: usize,
    },
}

/// Owns the pool. Every wait task and timer lives in `tasks`, so dropping
/// the observer drops them, which stops the workers.
struct Observer<L> {
    launcher: L,
    tracker: RestartTracker,
    pool: Vec<WorkerHandle>,
    next_id: u64,
    restarts: u64,
    events: mpsc::UnboundedSender<Event>,
    tasks: JoinSet<()>,
    snapshot: watch::Sender<PoolSnapshot>,
}

impl<L: WorkerLauncher> Observer<L> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle(event).await,
                Some(_) = self.tasks.join_next(), if !self.tasks.is_empty() => {}
            }
        }
    }

    async fn handle(&mut self, event: Event) {
        match event {
            Event::Exited { slot, id, result } => {
                if self.pool.get(slot).map(|w| w.id) != Some(id) {
                    return;
                }
                let cause = match result {
                    Ok(cause) if cause.is_success() => {
                        tracing::info!(worker_id = %id, slot, %cause, "worker exited");
                        Some(cause)
                    }
                    Ok(cause) => {
                        tracing::warn!(worker_id = %id, slot, %cause, "worker died");
                        Some(cause)
                    }
                    Err(e) => {
                        tracing::error!(worker_id = %id, slot, error = %e, "worker lost");
                        None
                    }
                };
                self.mark_exited(slot, cause);

                let delay = self.tracker.record_exit(Instant::now());
                if delay.is_zero() {
                    self.replace(slot).await;
                } else {
                    self.relaunch_after(slot, delay);
                }
            }
            Event::Relaunch { slot } => self.replace(slot).await,
        }
    }

    async fn replace(&mut self, slot: usize) {
        match self.launch(slot).await {
            Ok(()) => {
                self.restarts += 1;
                self.publish();
            }
            Err(e) => {
                tracing::error!(slot, error = %e, "failed to launch replacement worker");
                self.mark_exited(slot, None);
                let delay = self
                    .tracker
                    .record_exit(Instant::now())
                    .max(LAUNCH_RETRY_DELAY);
                self.relaunch_after(slot, delay);
            }
        }
    }

    fn relaunch_after(&mut self, slot: usize, delay: Duration) {
        let events = self.events.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Relaunch { slot });
        });
    }

    async fn launch(&mut self, slot: usize) -> Result<(), SupervisorError> {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        self.set(WorkerHandle {
            slot,
            id,
            pid: None,
            state: WorkerState::Starting,
            exit: None,
        });

        let process = self.launcher.launch(id).await?;
        let pid = process.pid();
        self.set(WorkerHandle {
            slot,
            id,
            pid,
            state: WorkerState::Running,
            exit: None,
        });
        tracing::info!(worker_id = %id, slot, ?pid, "worker started");

        let events = self.events.clone();
        self.tasks.spawn(async move {
            let result = process.wait().await;
            let _ = events.send(Event::Exited { slot, id, result });
        });
        Ok(())
    }

    fn set(&mut self, handle: WorkerHandle) {
        match self.pool.get_mut(handle.slot) {
            Some(existing) => *existing = handle,
            None => self.pool.push(handle),
        }
        self.publish();
    }

    fn mark_exited(&mut self, slot: usize, cause: Option<ExitCause>) {
        if let Some(worker) = self.pool.get_mut(slot) {
            worker.state = WorkerState::Exited;
            worker.pid = None;
            worker.exit = cause;
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(PoolSnapshot {
            workers: self.pool.clone(),
            restarts: self.restarts,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskLauncher;

    #[tokio::test]
    async fn test_start_empty_pool_is_rejected() {
        let launcher = TaskLauncher::new(|_id| async {});
        let err = Supervisor::new(launcher, 0).start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::EmptyPool));
    }

    #[tokio::test]
    async fn test_start_launches_pool_with_increasing_ids() {
        let launcher = TaskLauncher::new(|_id| std::future::pending::<()>());
        let handle = Supervisor::new(launcher, 3).start().await.unwrap();

        let pool = handle.wait_for_running(3).await.unwrap();
        assert_eq!(pool.running_ids(), vec![WorkerId(1), WorkerId(2), WorkerId(3)]);
        assert_eq!(pool.restarts, 0);
    }

    #[tokio::test]
    async fn test_killed_worker_is_replaced_in_same_slot() {
        let launcher = TaskLauncher::new(|_id| std::future::pending::<()>());
        let handle = Supervisor::new(launcher.clone(), 2).start().await.unwrap();
        handle.wait_for_running(2).await.unwrap();

        assert!(launcher.kill(WorkerId(1)));

        let pool = handle.wait_until(|p| p.restarts == 1).await.unwrap();
        assert_eq!(pool.running(), 2);
        let slot0 = pool.slot(0).unwrap();
        assert_eq!(slot0.id, WorkerId(3));
        assert_eq!(slot0.state, WorkerState::Running);
        // The other worker is untouched.
        assert_eq!(pool.slot(1).unwrap().id, WorkerId(2));
    }

    #[tokio::test]
    async fn test_clean_exit_is_also_replaced() {
        let launcher = TaskLauncher::new(|id: WorkerId| async move {
            // Only the first incarnation exits.
            if id.0 != 1 {
                std::future::pending::<()>().await;
            }
        });
        let handle = Supervisor::new(launcher, 1).start().await.unwrap();

        let pool = handle.wait_until(|p| p.restarts == 1 && p.running() == 1).await.unwrap();
        assert_eq!(pool.running_ids(), vec![WorkerId(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_replacement_in_crash_loop() {
        // Every worker exits immediately.
        let launcher = TaskLauncher::new(|_id| async {});
        let policy = RestartPolicy::Backoff {
            window: Duration::from_secs(60),
            threshold: 2,
            base: Duration::from_secs(10),
            max: Duration::from_secs(10),
        };
        let handle = Supervisor::new(launcher, 1)
            .restart_policy(policy)
            .start()
            .await
            .unwrap();

        // Two immediate replacements, then the third waits for the backoff.
        let pool = handle.wait_until(|p| p.restarts == 2).await.unwrap();
        assert_eq!(pool.restarts, 2);
        let before = Instant::now();
        handle.wait_until(|p| p.restarts == 3).await.unwrap();
        assert!(Instant::now() - before >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let launcher = TaskLauncher::new(move |_id| {
            let tx = tx.clone();
            async move {
                let _keep = tx;
                std::future::pending::<()>().await;
            }
        });
        let handle = Supervisor::new(launcher, 2).start().await.unwrap();
        handle.wait_for_running(2).await.unwrap();

        handle.shutdown().await;

        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}
