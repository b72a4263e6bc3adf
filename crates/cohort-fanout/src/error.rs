//! Error types for the fan-out layer.

use std::time::Duration;

use cohort_protocol::ProtocolError;
use cohort_transport::ConnectionId;

/// Errors that can occur while publishing, subscribing or dispatching.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    /// The broker could not be reached or rejected the command.
    #[error("broker error: {0}")]
    Broker(String),

    /// A broker round trip exceeded the configured I/O timeout.
    #[error("broker timed out after {0:?}")]
    Timeout(Duration),

    /// A delivery could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection is not registered on this worker.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}
