//! Startup configuration.
//!
//! [`Cli`] is what `cohortd` parses from its arguments and `COHORT_*`
//! environment variables. [`Cli::validate`] turns it into [`Settings`],
//! refusing to start on anything missing or contradictory: a worker with
//! no session secret or a wildcard CORS origin never comes up.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::http::HeaderValue;
use clap::Parser;
use cohort_session::{SameSitePolicy, SessionSettings};
use cohort_supervisor::RestartPolicy;
use cohort_transport::TransportKind;

/// Default URL of both the session store and the broker.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Errors found while validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Command line of `cohortd`. Every option can also come from the
/// environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "cohortd", version, about = "Supervised multi-process realtime gateway")]
pub struct Cli {
    /// Port shared by all workers.
    #[arg(short, long, env = "COHORT_PORT", default_value_t = 5000)]
    pub port: u16,

    /// Production mode: no request logging, secure cookies.
    #[arg(long, env = "COHORT_PRODUCTION")]
    pub production: bool,

    #[arg(long, env = "COHORT_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Number of worker processes.
    #[arg(long, env = "COHORT_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Shared session store.
    #[arg(long, env = "COHORT_STORE_URL", default_value = DEFAULT_REDIS_URL)]
    pub store_url: String,

    /// Fan-out broker.
    #[arg(long, env = "COHORT_BROKER_URL", default_value = DEFAULT_REDIS_URL)]
    pub broker_url: String,

    /// Name of the session cookie.
    #[arg(long, env = "COHORT_SESSION_NAME")]
    pub session_name: Option<String>,

    /// Secret that signs session cookies.
    #[arg(long, env = "COHORT_SESSION_SECRET", hide_env_values = true)]
    pub session_secret: Option<String>,

    /// Sliding session lifetime.
    #[arg(long, env = "COHORT_SESSION_TTL_SECS", default_value_t = 604_800)]
    pub session_ttl_secs: u64,

    /// Emit `Secure` on the session cookie. Defaults to on in production.
    ///
    /// Decided here only, never from the request scheme, so a worker
    /// behind a TLS-terminating proxy still sets it on plain-HTTP hops.
    #[arg(
        long,
        env = "COHORT_COOKIE_SECURE",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub cookie_secure: Option<bool>,

    /// `lax`, `strict` or `none`.
    #[arg(long, env = "COHORT_COOKIE_SAME_SITE", default_value = "lax")]
    pub cookie_same_site: SameSitePolicy,

    /// Origin allowed to make credentialed cross-origin requests.
    /// Repeatable; `*` is refused.
    #[arg(long = "allowed-origin", env = "COHORT_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Persistent-connection transports, most preferred first.
    #[arg(
        long,
        env = "COHORT_TRANSPORTS",
        value_delimiter = ',',
        default_value = "websocket,polling"
    )]
    pub transports: Vec<TransportKind>,

    /// Bound on each store and broker round trip.
    #[arg(long, env = "COHORT_IO_TIMEOUT_MS", default_value_t = 2000)]
    pub io_timeout_ms: u64,

    /// Slow down replacements when workers crash in a loop.
    #[arg(long, env = "COHORT_RESTART_BACKOFF")]
    pub restart_backoff: bool,

    #[arg(long, env = "COHORT_RESTART_WINDOW_SECS", default_value_t = 60)]
    pub restart_window_secs: u64,

    /// Exits tolerated inside the window before backing off.
    #[arg(long, env = "COHORT_RESTART_THRESHOLD", default_value_t = 5)]
    pub restart_threshold: u32,

    #[arg(long, env = "COHORT_DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    #[arg(long, env = "COHORT_OBJECT_STORE_BUCKET")]
    pub object_store_bucket: Option<String>,

    #[arg(long, env = "COHORT_OBJECT_STORE_REGION", default_value = "us-east-1")]
    pub object_store_region: String,

    /// Log filter directives; `RUST_LOG` is used when absent.
    #[arg(long, env = "COHORT_LOG_FILTER")]
    pub log_filter: Option<String>,
}

impl Cli {
    /// Checks the command line and resolves it into [`Settings`].
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("--workers", "must be at least 1"));
        }

        let cookie_name = required(&self.session_name, "--session-name")?;
        let secret = required(&self.session_secret, "--session-secret")?;
        if self.session_ttl_secs == 0 {
            return Err(ConfigError::invalid("--session-ttl-secs", "must be positive"));
        }
        if self.io_timeout_ms == 0 {
            return Err(ConfigError::invalid("--io-timeout-ms", "must be positive"));
        }

        let secure = self.cookie_secure.unwrap_or(self.production);
        if self.cookie_same_site == SameSitePolicy::None && !secure {
            return Err(ConfigError::invalid(
                "--cookie-same-site",
                "`none` requires a secure cookie",
            ));
        }

        let io_timeout = Duration::from_millis(self.io_timeout_ms);
        let session = SessionSettings {
            ttl: Duration::from_secs(self.session_ttl_secs),
            cookie_name,
            secret,
            secure,
            same_site: self.cookie_same_site,
            io_timeout,
            ..SessionSettings::default()
        };

        let restart_policy = if self.restart_backoff {
            if self.restart_window_secs == 0 {
                return Err(ConfigError::invalid("--restart-window-secs", "must be positive"));
            }
            RestartPolicy::backoff(Duration::from_secs(self.restart_window_secs), self.restart_threshold)
        } else {
            RestartPolicy::Immediate
        };

        let collaborators = CollaboratorConfig {
            database_url: required(&self.database_url, "--database-url")?,
            object_store: ObjectStoreConfig {
                bucket: required(&self.object_store_bucket, "--object-store-bucket")?,
                region: self.object_store_region.clone(),
            },
        };

        let worker = WorkerConfig {
            addr: SocketAddr::new(self.host, self.port),
            production: self.production,
            session,
            allowed_origins: parse_origins(&self.allowed_origins)?,
            transports: dedup_transports(&self.transports)?,
            io_timeout,
            collaborators,
            ..WorkerConfig::default()
        };

        Ok(Settings {
            pool_size: self.workers,
            restart_policy,
            store_url: self.store_url.clone(),
            broker_url: self.broker_url.clone(),
            worker,
        })
    }
}

/// Everything `cohortd` needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub pool_size: usize,
    pub restart_policy: RestartPolicy,
    pub store_url: String,
    pub broker_url: String,
    pub worker: WorkerConfig,
}

/// Configuration of one worker.
///
/// `Default` binds `127.0.0.1:0` and leaves the session cookie name and
/// secret empty, which [`WorkerBuilder::build`](crate::WorkerBuilder::build)
/// refuses.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub addr: SocketAddr,
    /// Turns request logging off.
    pub production: bool,
    pub session: SessionSettings,
    /// Origins allowed to send credentialed cross-origin requests. Empty
    /// means no CORS headers at all.
    pub allowed_origins: Vec<HeaderValue>,
    /// Enabled transports, most preferred first.
    pub transports: Vec<TransportKind>,
    /// Bound on each store and broker round trip.
    pub io_timeout: Duration,
    /// Prefix of the broker channels owned by the gateway.
    pub channel_prefix: String,
    /// Liveness window of a persistent connection. The worker pings
    /// WebSocket peers every half window and closes one from which
    /// nothing at all (Pong included) arrived within a full window.
    pub idle_timeout: Duration,
    /// How long a long-poll request waits for frames.
    pub poll_wait: Duration,
    /// A polling endpoint not polled for this long is removed.
    pub poll_idle: Duration,
    pub collaborators: CollaboratorConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            production: false,
            session: SessionSettings::default(),
            allowed_origins: Vec::new(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            io_timeout: Duration::from_secs(2),
            channel_prefix: "cohort".to_string(),
            idle_timeout: Duration::from_secs(60),
            poll_wait: Duration::from_secs(25),
            poll_idle: Duration::from_secs(60),
            collaborators: CollaboratorConfig::default(),
        }
    }
}

/// Connection parameters of services owned by application code. The
/// gateway only checks they are present and hands them over as a request
/// extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollaboratorConfig {
    pub database_url: String,
    pub object_store: ObjectStoreConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    pub region: String,
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parse_origins(origins: &[String]) -> Result<Vec<HeaderValue>, ConfigError> {
    origins
        .iter()
        .map(|origin| {
            let origin = origin.trim();
            if origin == "*" {
                return Err(ConfigError::invalid(
                    "--allowed-origin",
                    "`*` cannot be combined with credentials; list origins explicitly",
                ));
            }
            if !(origin.starts_with("http://") || origin.starts_with("https://")) {
                return Err(ConfigError::invalid(
                    "--allowed-origin",
                    format!("`{origin}` is not an http(s) origin"),
                ));
            }
            HeaderValue::from_str(origin.trim_end_matches('/'))
                .map_err(|e| ConfigError::invalid("--allowed-origin", e.to_string()))
        })
        .collect()
}

fn dedup_transports(transports: &[TransportKind]) -> Result<Vec<TransportKind>, ConfigError> {
    let mut out = Vec::with_capacity(transports.len());
    for kind in transports {
        if !out.contains(kind) {
            out.push(*kind);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::invalid("--transports", "at least one transport is required"));
    }
    Ok(out)
}
