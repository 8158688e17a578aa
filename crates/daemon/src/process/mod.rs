pub mod utils;

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

use crate::http_server;
use crate::reconcile::queue::{run_worker, JobReceiver};
use crate::{ServiceConfig, ServiceState};

/// Handle for gracefully shutting down the daemon service.
pub struct ShutdownHandle {
    signal_waiter: tokio::task::JoinHandle<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

impl ShutdownHandle {
    /// Block until the service shuts down (via signal or explicit shutdown).
    pub async fn wait(mut self) {
        let _ = self.shutdown_rx.changed().await;
        self.signal_waiter.abort();

        if timeout(FINAL_SHUTDOWN_TIMEOUT, join_all(self.handles))
            .await
            .is_err()
        {
            tracing::error!(
                "Failed to shut down within {} seconds",
                FINAL_SHUTDOWN_TIMEOUT.as_secs()
            );
            std::process::exit(4);
        }
    }

    /// Trigger shutdown programmatically.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
fn init_logging(
    service_config: &ServiceConfig,
) -> Vec<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_env_filter = EnvFilter::builder()
        .with_default_directive(service_config.log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(stdout_env_filter);

    if let Some(log_dir) = &service_config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "fleetmount.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_env_filter = EnvFilter::builder()
            .with_default_directive(service_config.log_level.into())
            .from_env_lossy();

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(file_env_filter);

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    guards
}

/// Create service state from config, exiting on error.
fn create_state(service_config: &ServiceConfig) -> (ServiceState, JobReceiver) {
    match ServiceState::from_config(service_config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("error creating server state: {}", e);
            std::process::exit(3);
        }
    }
}

/// Spawn the reconcile worker and the provisioning server around `state`.
///
/// A start-up plan, if configured, is queued before the server starts accepting.
pub fn start_with_state(
    service_config: &ServiceConfig,
    state: ServiceState,
    receiver: JobReceiver,
) -> std::io::Result<(ServiceState, ShutdownHandle)> {
    let (signal_waiter, shutdown_tx, shutdown_rx) = utils::graceful_shutdown_blocker()?;
    let mut handles = Vec::new();

    let reconciler = state.reconciler().clone();
    let retry = service_config.retry;
    let worker_rx = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        run_worker(reconciler, receiver, retry, worker_rx).await;
    }));

    if let Some(startup) = &service_config.startup_plan {
        let source = startup.source.display().to_string();
        match state.queue().submit(source.clone(), startup.plan.clone()) {
            Ok(()) => tracing::info!(source = %source, "queued start-up plan"),
            Err(e) => tracing::error!(source = %source, error = %e, "could not queue start-up plan"),
        }
    }

    let http_config = http_server::Config::new(
        service_config.listen_addr,
        service_config.max_concurrent_requests,
    );
    let http_state = state.clone();
    let http_rx = shutdown_rx.clone();
    let http_tx = shutdown_tx.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = http_server::run(http_config, http_state, http_rx).await {
            tracing::error!("provisioning server error: {}", e);
            // nothing left to serve; bring the worker down too
            let _ = http_tx.send(());
        }
    }));

    tracing::info!(
        "Running: provisioning server on {} + reconcile worker",
        service_config.listen_addr
    );

    let handle = ShutdownHandle {
        signal_waiter,
        handles,
        shutdown_tx,
        shutdown_rx,
    };
    Ok((state, handle))
}

/// Spawns the daemon service: provisioning server + reconcile worker.
/// Blocks until shutdown signal is received. Use for CLI binary usage.
pub async fn spawn_service(service_config: &ServiceConfig) {
    let _guards = init_logging(service_config);
    let (state, receiver) = create_state(service_config);
    match start_with_state(service_config, state, receiver) {
        Ok((_, handle)) => handle.wait().await,
        Err(e) => {
            tracing::error!("failed to install signal handlers: {}", e);
            std::process::exit(3);
        }
    }
}
