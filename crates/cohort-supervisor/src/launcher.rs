//! Launching workers, and the OS-process launcher used in production.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;

use cohort_protocol::WorkerId;
use tokio::process::{Child, Command};

use crate::{ExitCause, SupervisorError};

/// Environment variable that puts a launched binary in worker mode and
/// tells it its id.
pub const WORKER_ID_ENV: &str = "COHORT_WORKER_ID";

/// Returns this process's worker id when it was launched as a worker.
///
/// `None` means the process is the supervisor (or a standalone server).
pub fn worker_id_from_env() -> Option<WorkerId> {
    std::env::var(WORKER_ID_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(WorkerId)
}

/// A running worker as seen by the supervisor.
pub trait WorkerProcess: Send + 'static {
    /// OS process id, when the worker is a separate process.
    fn pid(&self) -> Option<u32>;

    /// Resolves when the worker has stopped.
    ///
    /// Dropping the future before it resolves must stop the worker; the
    /// supervisor relies on that when it shuts down.
    fn wait(self) -> impl Future<Output = Result<ExitCause, SupervisorError>> + Send;
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync + 'static {
    type Process: WorkerProcess;

    /// Starts the worker with the given id. Returns once it is running
    /// (not once it is ready to serve).
    fn launch(
        &self,
        id: WorkerId,
    ) -> impl Future<Output = Result<Self::Process, SupervisorError>> + Send;
}

/// Launches workers as child processes running the same binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Re-executes the running binary with the arguments it was given.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args_os().skip(1),
        ))
    }
}

impl WorkerLauncher for ProcessLauncher {
    type Process = ChildProcess;

    async fn launch(&self, id: WorkerId) -> Result<ChildProcess, SupervisorError> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, id.0.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch { id, source })?;
        Ok(ChildProcess { id, child })
    }
}

/// A worker running as a child process. Killed when dropped.
#[derive(Debug)]
pub struct ChildProcess {
    id: WorkerId,
    child: Child,
}

impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(mut self) -> Result<ExitCause, SupervisorError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| SupervisorError::Wait {
                id: self.id,
                source,
            })?;
        Ok(ExitCause::from(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_exe_points_at_this_binary() {
        let launcher = ProcessLauncher::current_exe().unwrap();
        assert_eq!(launcher.program, std::env::current_exe().unwrap());
    }

    #[tokio::test]
    async fn test_launch_missing_program_is_launch_error() {
        let launcher = ProcessLauncher::new("/definitely/not/a/cohort/binary", Vec::<String>::new());
        let err = launcher.launch(WorkerId(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { id: WorkerId(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launched_child_sees_worker_id_env() {
        let launcher = ProcessLauncher::new(
            "sh",
            ["-c", "test \"$COHORT_WORKER_ID\" = 7"],
        );
        let child = launcher.launch(WorkerId(7)).await.unwrap();
        assert!(child.pid().is_some());
        assert_eq!(child.wait().await.unwrap(), ExitCause::Code(0));
    }
}
