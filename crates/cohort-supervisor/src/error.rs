//! Error types for the supervision layer.

use cohort_protocol::WorkerId;

/// Errors that can occur while starting or running the pool.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// A pool needs at least one worker.
    #[error("pool size must be at least 1")]
    EmptyPool,

    /// The worker could not be started.
    #[error("failed to launch worker {id}: {source}")]
    Launch {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a running worker failed; its fate is unknown.
    #[error("lost track of worker {id}: {source}")]
    Wait {
        id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    /// The supervisor's observer is no longer running.
    #[error("supervisor stopped")]
    Stopped,
}
