//! Worker pool supervision for Cohort.
//!
//! The supervisor is the parent process. It launches a fixed number of
//! workers, watches each one, and when a worker exits for any reason it
//! logs why and launches exactly one replacement. It never serves traffic
//! and never checks health beyond "is it still alive".
//!
//! ```text
//! Supervisor::start
//!   ├── launch slot 0 ── wait task ──┐
//!   ├── launch slot 1 ── wait task ──┤  exit events
//!   └── ...                          ▼
//!                                 observer ── log cause ── RestartPolicy ── relaunch slot
//! ```
//!
//! How a worker is launched is behind [`WorkerLauncher`]:
//! [`ProcessLauncher`] re-executes the current binary in worker mode,
//! [`TaskLauncher`] runs workers as tasks of the current process.

mod error;
mod exit;
mod launcher;
mod policy;
mod supervisor;
mod task;

pub use error::SupervisorError;
pub use exit::{ExitCause, signal_name};
pub use launcher::{
    ChildProcess, ProcessLauncher, WORKER_ID_ENV, WorkerLauncher, WorkerProcess,
    worker_id_from_env,
};
pub use policy::RestartPolicy;
pub use supervisor::{PoolSnapshot, Supervisor, SupervisorHandle, WorkerHandle, WorkerState};
pub use task::{TaskLauncher, TaskProcess};
