//! # Cohort
//!
//! Supervised multi-process realtime gateway.
//!
//! A supervisor keeps a fixed pool of identical worker processes alive.
//! Every worker serves HTTP, WebSocket and long-polling on one shared
//! port, authenticates each request and handshake against a session store
//! shared by the whole pool, and fans events out through a broker so a
//! message published on one worker reaches connections held by any other.
//!
//! ```text
//!            ┌──────────── cohortd (supervisor) ────────────┐
//!            │  spawn / observe exit / replace              │
//!            ▼                  ▼                  ▼
//!        worker W-1         worker W-2         worker W-3     (shared port)
//!            │  ▲               │  ▲               │  ▲
//!            ▼  │               ▼  │               ▼  │
//!   ┌──────────────────┐   ┌──────────────────────────────┐
//!   │  session store   │   │  fan-out broker (pub/sub)    │
//!   └──────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cohort::prelude::*;
//!
//! # async fn start(config: WorkerConfig) -> Result<(), CohortError> {
//! let store = MemorySessionStore::new(config.session.ttl);
//! let broker = MemoryBroker::new();
//! let worker = WorkerBuilder::new(config)
//!     .build(store, broker.client())
//!     .await?;
//! worker.run().await
//! # }
//! ```

pub mod boundary;
pub mod config;
mod error;
mod handler;
pub mod logging;
pub mod middleware;
mod polling;
mod server;
mod sessions;

pub use boundary::{AppError, ErrorRenderer, HtmlErrorRenderer};
pub use config::{Cli, CollaboratorConfig, ConfigError, ObjectStoreConfig, Settings, WorkerConfig};
pub use error::{BindFailure, CohortError};
pub use server::{Worker, WorkerBuilder};
pub use sessions::{Authenticated, CurrentSession, Sessions};

pub use cohort_fanout as fanout;
pub use cohort_protocol as protocol;
pub use cohort_session as session;
pub use cohort_supervisor as supervisor;
pub use cohort_transport as transport;

/// Everything needed to embed a worker.
pub mod prelude {
    pub use crate::{
        AppError, Authenticated, CohortError, CollaboratorConfig, CurrentSession, Sessions,
        Worker, WorkerBuilder, WorkerConfig,
    };
    pub use cohort_fanout::{Broadcaster, FanoutBus, MemoryBroker, MemoryBus};
    pub use cohort_protocol::{SessionId, WorkerId};
    pub use cohort_session::{MemorySessionStore, SessionRecord, SessionSettings, SessionStore};
}
