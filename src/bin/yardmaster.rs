//! Entry point. Grounded on `original_source/src/main.cpp`'s overall shape
//! (parse args → global init → enter main loop → map any startup failure to
//! exit code 1), with `tracing_subscriber::fmt().with_env_filter(...)` for
//! logging setup.
//!
//! `main()` is deliberately a plain function, not `#[tokio::main]`:
//! daemonizing (forking the process) must happen before the Tokio runtime
//! exists, since forking a process with a live multi-threaded runtime only
//! carries the forking thread into the child and leaves the runtime
//! unusable there.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use yardmaster::cli::{self, Cli};
use yardmaster::jq::{JobCallback, JqWorker, WaitOutcome, WorkOutcome};
use yardmaster::reconcile::{Reconciler, ShutdownType, Timeouts};
use yardmaster::{daemon, metrics::Metrics, registry::Registry, signals, slot::SlotRunner, status::StatusServer};

/// Stands in for a real JQ client until one is wired against the
/// [`yardmaster::jq::JqWorker`] trait — the JQ wire protocol is a
/// third-party collaborator this crate never implements. Every attach
/// attempt fails fatally with a clear message rather than silently doing
/// nothing, so a misconfigured deployment fails loudly instead of idling.
struct UnwiredJqWorker;

#[async_trait::async_trait]
impl JqWorker for UnwiredJqWorker {
    fn add_server(&mut self, _server: &str) -> Result<(), bool> {
        Err(false)
    }

    fn add_function(&mut self, _name: &str) -> Result<(), bool> {
        Err(false)
    }

    async fn work(&mut self, _callback: &(dyn JobCallback + Sync)) -> WorkOutcome {
        WorkOutcome::NotConnected
    }

    async fn wait(&mut self) -> WaitOutcome {
        WaitOutcome::NoActiveFds
    }
}

fn main() -> ExitCode {
    let cli = cli::parse_or_exit(std::env::args());

    if let Err(e) = signals::ignore_sigpipe() {
        eprintln!("unable to ignore SIGPIPE: {e}");
        return ExitCode::FAILURE;
    }

    if cli.daemonize {
        if let Err(e) = daemon::daemonize() {
            eprintln!("unable to daemonize: {e}");
            return ExitCode::FAILURE;
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Some(pid_file) = &cli.pid_file {
        if let Err(e) = daemon::write_pid_file(pid_file) {
            tracing::error!(error = %e, "unable to write pid file");
            return ExitCode::FAILURE;
        }
    }

    if let Some(user) = &cli.user {
        if let Err(e) = daemon::drop_privileges(user) {
            tracing::error!(error = %e, user, "unable to drop privileges");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("unable to build async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "yardmaster exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    tracing::info!(
        loop_timeout = cli.loop_timeout,
        max_running_time = cli.max_running_time,
        "starting up"
    );

    let registry = Arc::new(Registry::new());
    let metrics = Arc::new(Metrics::new());
    let global_shutdown = tokio_util::sync::CancellationToken::new();
    let shutdown_flag = signals::spawn_handlers()?;

    let status_shutdown = tokio_util::sync::CancellationToken::new();
    let status_server = StatusServer::new(registry.clone(), metrics.clone());
    let bind_addr = format!("0.0.0.0:{}", cli.status_port);
    let status_shutdown_clone = status_shutdown.clone();
    let status_handle = tokio::spawn(async move {
        if let Err(e) = status_server.run(&bind_addr, status_shutdown_clone).await {
            tracing::error!(error = %e, "status server exited with an error");
        }
    });

    let timeouts = Timeouts::from_response_timeout(
        Duration::from_secs(cli.loop_timeout),
        Duration::from_secs(cli.max_running_time),
    );

    let factory = {
        let registry = registry.clone();
        let metrics = metrics.clone();
        let global_shutdown = global_shutdown.clone();
        move |pool: &str, servers: Vec<String>, jobs: Vec<String>, dispatcher: yardmaster::dispatch::JobDispatcher| {
            SlotRunner::new(
                pool,
                servers,
                jobs,
                dispatcher,
                registry.clone(),
                metrics.clone(),
                global_shutdown.clone(),
                || UnwiredJqWorker,
            )
        }
    };

    let mut reconciler = Reconciler::new(
        cli.jobsconfig.clone(),
        registry.clone(),
        factory,
        global_shutdown,
        timeouts,
    );

    reconciler.run(move || shutdown_flag.get()).await;

    status_shutdown.cancel();
    let _ = status_handle.await;

    tracing::info!("yardmaster stopped");
    Ok(())
}

