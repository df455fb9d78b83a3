use mailsink::broker::worker;
use mailsink::services::config::Config;
use mailsink::{MailSinkError, SinkContext};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for structured logging.
///
/// - Debug builds: pretty-printed human-readable output
/// - Release builds: JSON-formatted output for log aggregation
///
/// The log level is controlled by the `RUST_LOG` environment variable,
/// defaulting to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = Config::from_env();
    info!(
        version = mailsink::VERSION,
        host = %config.rabbitmq_host,
        queue = %config.rabbitmq_queue,
        workers = config.worker_count,
        ssl = config.rabbitmq_use_ssl,
        "starting mail sink"
    );

    let ctx = match SinkContext::initialize(config).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    let mut workers: JoinSet<Result<(), MailSinkError>> = JoinSet::new();
    for worker_id in 0..ctx.config.worker_count {
        let ctx = Arc::clone(&ctx);
        workers.spawn(worker::run(worker_id, ctx));
    }

    // A worker exiting for any reason (fatal startup error or a closed
    // delivery stream) takes the process down; the orchestrator restarts
    // it. A signal is the clean path out.
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, stopping mail sink");
            ExitCode::SUCCESS
        }
        joined = workers.join_next() => {
            match joined {
                Some(Ok(Err(e))) => error!(error = %e, "worker terminated with error"),
                Some(Err(e)) => error!(error = %e, "worker task panicked"),
                _ => error!("worker exited, delivery stream closed"),
            }
            ExitCode::FAILURE
        }
    }
}

/// Waits for SIGINT or SIGTERM (Ctrl+C on non-unix platforms).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C");
    }
}
