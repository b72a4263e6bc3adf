//! Unified error type for the Cohort gateway.

use std::fmt;

use cohort_fanout::FanoutError;
use cohort_protocol::ProtocolError;
use cohort_session::SessionError;
use cohort_supervisor::SupervisorError;
use cohort_transport::TransportError;

use crate::config::ConfigError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically. `Bind` and
/// `Fatal` end the worker process; everything else is reported where it
/// happened.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The shared port could not be bound.
    #[error("Port {port} {reason}")]
    Bind {
        port: u16,
        reason: BindFailure,
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped accepting.
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),

    /// A fault outside any request: a background loop died.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl CohortError {
    /// Classifies a failed bind of `port`.
    pub(crate) fn bind(port: u16, source: std::io::Error) -> Self {
        let reason = match source.kind() {
            std::io::ErrorKind::PermissionDenied => BindFailure::ElevatedPrivileges,
            std::io::ErrorKind::AddrInUse => BindFailure::InUse,
            _ => BindFailure::Other,
        };
        Self::Bind {
            port,
            reason,
            source,
        }
    }

    /// `true` for errors that must terminate the worker process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Bind { .. } | Self::Serve(_) | Self::Fatal(_))
    }
}

/// Why the listening port could not be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFailure {
    /// `EACCES`: privileged port without privileges.
    ElevatedPrivileges,
    /// `EADDRINUSE`: another process holds the port exclusively.
    InUse,
    Other,
}

impl fmt::Display for BindFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ElevatedPrivileges => "requires elevated privileges",
            Self::InUse => "is already in use",
            Self::Other => "could not be bound",
        })
    }
}
