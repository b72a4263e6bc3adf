//! `cohortd`: the supervisor and, re-executed with `COHORT_WORKER_ID`
//! set, each of its workers.

use std::panic::AssertUnwindSafe;
use std::process::ExitCode;

use clap::Parser;
use cohort::{Cli, CohortError, Settings, WorkerBuilder, boundary, logging};
use cohort_fanout::RedisBus;
use cohort_protocol::WorkerId;
use cohort_session::RedisSessionStore;
use cohort_supervisor::{ProcessLauncher, Supervisor, worker_id_from_env};
use futures_util::FutureExt;
use tracing::Instrument;

/// Exit status for configuration the process cannot start with.
const EXIT_INVALID_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_filter.as_deref());
    boundary::install_panic_hook();

    let settings = match cli.validate() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_INVALID_CONFIG);
        }
    };

    match worker_id_from_env() {
        Some(id) => run_worker(id, settings).await,
        None => supervise(settings).await,
    }
}

/// Supervisor mode: keep `pool_size` workers alive until told to stop.
async fn supervise(settings: Settings) -> ExitCode {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = settings.pool_size,
        addr = %settings.worker.addr,
        "cohortd starting"
    );

    let launcher = match ProcessLauncher::current_exe() {
        Ok(launcher) => launcher,
        Err(e) => {
            tracing::error!(error = %e, "cannot locate own executable");
            return ExitCode::FAILURE;
        }
    };
    let handle = match Supervisor::new(launcher, settings.pool_size)
        .restart_policy(settings.restart_policy)
        .start()
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "supervisor failed to start");
            return ExitCode::FAILURE;
        }
    };

    shutdown_signal().await;
    tracing::info!("shutting down workers");
    handle.shutdown().await;
    ExitCode::SUCCESS
}

/// Worker mode: serve until a fatal fault, then exit 1 so the supervisor
/// replaces us.
async fn run_worker(id: WorkerId, settings: Settings) -> ExitCode {
    let span = tracing::info_span!("worker", worker_id = %id);
    // A panic on the way is caught here instead of unwinding out of main;
    // the panic hook has already logged it.
    let worker = AssertUnwindSafe(serve(id, settings).instrument(span)).catch_unwind();

    match worker.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            tracing::error!(worker_id = %id, error = %e, "worker failed");
            ExitCode::FAILURE
        }
        Err(_) => {
            tracing::error!(worker_id = %id, "worker crashed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(id: WorkerId, settings: Settings) -> Result<(), CohortError> {
    let Settings {
        store_url,
        broker_url,
        worker: config,
        ..
    } = settings;

    let store = RedisSessionStore::connect(&store_url, &config.session).await?;
    let bus = RedisBus::connect(&broker_url, config.io_timeout).await?;

    let worker = WorkerBuilder::new(config)
        .worker_id(id)
        .build(store, bus)
        .await?;
    worker.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
