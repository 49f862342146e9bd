//! One worker slot: attaches to the JQ broker, runs the `GRAB_JOB`/`POLL`
//! state machine, and retries the whole attach-and-run cycle on transient
//! failure.
//!
//! The outer retry loop is grounded on `original_source/src/thread-loop.cpp`
//! (`MAX_THREAD_LOOP_ATTEMPTS = 5`, `THREAD_LOOP_RETRY_SLEEP_DURATION = 10`
//! seconds, catch-and-recurse-with-incremented-attempts on a retriable
//! failure); the inner state machine is a retranslation of
//! `GearmanClient::run()`. Task spawning and shutdown racing use
//! `tokio::select!` against a `CancellationToken` with
//! `.instrument(info_span!(...))` around the task body.

use crate::dispatch::JobDispatcher;
use crate::jq::{CallbackOutcome, JobCallback, JqJob, JqWorker, WaitOutcome, WorkOutcome};
use crate::metrics::Metrics;
use crate::registry::{Registry, SlotId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Internal position in the two-state cycle. The names are kept exactly as
/// the source has them even though, read literally, `GRAB_JOB` transitioning
/// *to* `POLL` and vice versa looks backwards — that inversion is
/// intentional and must not be "fixed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    GrabJob,
    Poll,
}

/// Delegates the JQ callback straight into a [`JobDispatcher`], reporting
/// the outcome to metrics along the way.
///
/// `global_shutdown` — not the per-slot `shutdown` token — is what gates the
/// in-flight HTTP abort. A pool drain/restart only asks this slot to stop
/// *between* turns (the per-slot token and the registry's `should_shutdown`
/// flag); it must never reach into a job that's already in flight. Only a
/// process-wide HARD shutdown or the job's own wall-deadline may abort a
/// running job, via the same cancellation check curl's progress callback
/// used to make against `g_force_shutdown`.
struct DispatchCallback<'a> {
    dispatcher: &'a JobDispatcher,
    pool: &'a str,
    metrics: &'a Metrics,
    global_shutdown: &'a CancellationToken,
}

#[async_trait::async_trait]
impl JobCallback for DispatchCallback<'_> {
    async fn call(&self, job: JqJob) -> CallbackOutcome {
        let start = Instant::now();
        let result = self
            .dispatcher
            .dispatch(
                &job.function_name,
                &job.handle,
                &job.unique,
                job.workload,
                self.global_shutdown,
            )
            .await;

        match result {
            Ok(r) => {
                // The envelope parsed, which is "success" for metrics purposes
                // regardless of what gearman_ret says — original_source's
                // processJob reports job success right after extracting the
                // two fields, before gearman_ret is even inspected.
                self.metrics
                    .job_success(self.pool, &job.function_name, start.elapsed().as_secs_f64());
                if r.is_success() {
                    CallbackOutcome::Success
                } else {
                    CallbackOutcome::WorkFail
                }
            }
            Err(crate::error::DispatchError::HttpStatus(status)) => {
                self.metrics
                    .http_error(self.pool, &job.function_name, status.as_u16());
                CallbackOutcome::WorkFail
            }
            Err(crate::error::DispatchError::Timeout) => {
                self.metrics.timeout(self.pool, &job.function_name);
                CallbackOutcome::WorkFail
            }
            Err(e) => {
                warn!(error = %e, "job dispatch failed");
                self.metrics.error(self.pool, &job.function_name);
                CallbackOutcome::WorkFail
            }
        }
    }
}

/// Everything one slot needs that outlives a single attach attempt.
pub struct SlotRunner<W: JqWorker> {
    id: SlotId,
    pool: String,
    servers: Vec<String>,
    functions: Vec<String>,
    dispatcher: JobDispatcher,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    global_shutdown: CancellationToken,
    worker_factory: Box<dyn Fn() -> W + Send + Sync>,
}

impl<W: JqWorker> SlotRunner<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: impl Into<String>,
        servers: Vec<String>,
        functions: Vec<String>,
        dispatcher: JobDispatcher,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
        global_shutdown: CancellationToken,
        worker_factory: impl Fn() -> W + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: SlotId::new(),
            pool: pool.into(),
            servers,
            functions,
            dispatcher,
            registry,
            metrics,
            global_shutdown,
            worker_factory: Box::new(worker_factory),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Runs until the registry flags this slot for shutdown or `shutdown`
    /// fires, retrying the attach-and-run cycle on a retriable failure for up
    /// to [`MAX_ATTEMPTS`] retries after the initial attempt (6 total calls
    /// to `attach_and_run`), matching spec.md §4.2's pseudocode
    /// (`attempts := 0` ... `if attempts > MAX_ATTEMPTS (5): give up`) and
    /// `original_source/src/thread-loop.cpp`'s `MAX_THREAD_LOOP_ATTEMPTS = 5`
    /// recursive retry scheme. Registers itself on entry and unregisters on
    /// every exit path, mirroring `ThreadRegistry::registerThread` /
    /// `unregisterThread` being called from `thread-loop.cpp`'s outer
    /// wrapper rather than from `GearmanClient` itself.
    pub async fn run(self, shutdown: CancellationToken) {
        let span = info_span!("slot", pool = %self.pool, id = %self.id);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, shutdown: CancellationToken) {
        self.registry.register(&self.pool, self.id);
        let mut attempts = 0u32;

        loop {
            if self.registry.should_shutdown(self.id)
                || shutdown.is_cancelled()
                || self.global_shutdown.is_cancelled()
            {
                break;
            }

            self.registry.set_state(self.id, "attaching");
            match self.attach_and_run(&shutdown).await {
                Ok(()) => break,
                Err(e) if e.retriable && attempts < MAX_ATTEMPTS => {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e.message, "slot attach failed, retrying");
                    self.registry.set_state(self.id, "retry-backoff");
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    warn!(error = %e.message, retriable = e.retriable, "slot exiting");
                    break;
                }
            }
        }

        self.registry.unregister(&self.pool, self.id);
        info!("slot stopped");
    }

    async fn attach_and_run(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(), crate::error::JqAttachError> {
        let mut worker = (self.worker_factory)();

        for server in &self.servers {
            worker
                .add_server(server)
                .map_err(|retriable| attach_error(retriable, format!("add_server({server})")))?;
        }
        for function in &self.functions {
            worker
                .add_function(function)
                .map_err(|retriable| attach_error(retriable, format!("add_function({function})")))?;
        }

        self.registry.set_state(self.id, "grab_job");
        let mut state = State::GrabJob;

        loop {
            if self.registry.should_shutdown(self.id)
                || shutdown.is_cancelled()
                || self.global_shutdown.is_cancelled()
            {
                return Ok(());
            }

            let callback = DispatchCallback {
                dispatcher: &self.dispatcher,
                pool: &self.pool,
                metrics: &self.metrics,
                global_shutdown: &self.global_shutdown,
            };

            state = match state {
                State::GrabJob => {
                    match worker.work(&callback).await {
                        WorkOutcome::Success => State::GrabJob,
                        WorkOutcome::WorkFailed => State::GrabJob,
                        WorkOutcome::IoWait | WorkOutcome::NoJobs => {
                            self.registry.set_state(self.id, "poll");
                            State::Poll
                        }
                        WorkOutcome::Timeout | WorkOutcome::NotConnected => {
                            return Err(crate::error::JqAttachError::retriable(
                                "connection lost during work()",
                            ));
                        }
                    }
                }
                State::Poll => match worker.wait().await {
                    WaitOutcome::Success => {
                        self.registry.set_state(self.id, "grab_job");
                        State::GrabJob
                    }
                    WaitOutcome::Timeout => State::Poll,
                    WaitOutcome::NoActiveFds => {
                        return Err(crate::error::JqAttachError::fatal("no active connections"));
                    }
                },
            };
        }
    }
}

fn attach_error(retriable: bool, context: String) -> crate::error::JqAttachError {
    if retriable {
        crate::error::JqAttachError::retriable(context)
    } else {
        crate::error::JqAttachError::fatal(context)
    }
}
