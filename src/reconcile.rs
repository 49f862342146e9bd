//! The reconciliation cycle: periodically diffs desired config against the
//! running fleet and applies the difference.
//!
//! Grounded on `original_source/src/main-loop.cpp::run`/`modifyPool`: the
//! shutdown-type check, load-diff-apply body, and the "start one new slot at
//! a time and wait for its registration handshake before starting the next"
//! rule are all carried over. `doShutdown`'s "zero every pool's worker_count,
//! flip the force-shutdown flag, then sleep out the wait window" sequence
//! becomes `Reconciler::shutdown`.

use crate::config::{self, ConfigDiff, DesiredConfig};
use crate::dispatch::JobDispatcher;
use crate::jq::JqWorker;
use crate::registry::Registry;
use crate::slot::SlotRunner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What the signal handler told the main cycle to do, mirroring
/// `main-loop.cpp`'s `ShutdownType` enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownType {
    No,
    Graceful,
    Hard,
}

/// Derived purely from `gearmand_response_timeout`, exactly as
/// `main.cpp` derives `LOOP_SLEEP_DURATION`/`HARD_SHUTDOWN_WAIT_DURATION`/
/// `GRACEFUL_SHUTDOWN_WAIT_DURATION` from `GEARMAND_RESPONSE_TIMEOUT`.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub loop_sleep: Duration,
    pub hard_shutdown_wait: Duration,
    pub graceful_shutdown_wait: Duration,
    pub max_job_running_time: Duration,
}

impl Timeouts {
    pub fn from_response_timeout(gearmand_response_timeout: Duration, max_job_running_time: Duration) -> Self {
        let hard = gearmand_response_timeout * 2;
        Self {
            loop_sleep: gearmand_response_timeout / 2,
            hard_shutdown_wait: hard,
            graceful_shutdown_wait: hard * 2,
            max_job_running_time,
        }
    }
}

struct RunningSlot {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cancels a slot's per-slot token and lets its task wind down on its own
/// time, reaping the `JoinHandle` from a detached background task instead of
/// awaiting it inline. `original_source`'s `modifyPool`/`doShutdown` never
/// join the threads they signal either — `gearman_thread_delegate` detaches
/// its thread immediately after the registration handshake. Awaiting the
/// handle here would block the single-threaded Reconciler for as long as the
/// slot's in-flight HTTP dispatch takes to unwind, up to `max_job_running_time`.
fn detach_slot(slot: RunningSlot) {
    slot.cancel.cancel();
    tokio::spawn(async move {
        if let Err(e) = slot.handle.await {
            warn!(error = %e, "slot task panicked");
        }
    });
}

/// Owns the config path, the live registry, and a handle to every currently
/// running pool's slot tasks (keyed by pool name — the reconciler is the
/// only writer of this map).
pub struct Reconciler<F, W>
where
    F: Fn(&str, Vec<String>, Vec<String>, JobDispatcher) -> SlotRunner<W> + Send + Sync + 'static,
    W: JqWorker + 'static,
{
    config_path: PathBuf,
    registry: Arc<Registry>,
    current: DesiredConfig,
    pools: std::collections::HashMap<String, Vec<RunningSlot>>,
    slot_factory: Arc<F>,
    /// Process-wide abort signal. Distinct from each slot's own
    /// `should_shutdown` flag: that stops a slot between turns (drain,
    /// restart, scale-down), while this one reaches into an in-flight HTTP
    /// dispatch and aborts it immediately. Only the HARD path ever cancels
    /// it — see [`Self::shutdown`].
    global_shutdown: CancellationToken,
    timeouts: Timeouts,
}

impl<F, W> Reconciler<F, W>
where
    F: Fn(&str, Vec<String>, Vec<String>, JobDispatcher) -> SlotRunner<W> + Send + Sync + 'static,
    W: JqWorker + 'static,
{
    pub fn new(
        config_path: PathBuf,
        registry: Arc<Registry>,
        slot_factory: F,
        global_shutdown: CancellationToken,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            config_path,
            registry,
            current: DesiredConfig::empty(),
            pools: std::collections::HashMap::new(),
            slot_factory: Arc::new(slot_factory),
            global_shutdown,
            timeouts,
        }
    }

    /// The main cycle: check shutdown type, load+diff+apply config, verify
    /// every pool's running count still matches its desired count, sleep.
    /// Returns once a graceful or hard shutdown has fully drained.
    pub async fn run(&mut self, shutdown_signal: impl Fn() -> ShutdownType) {
        loop {
            match shutdown_signal() {
                ShutdownType::Graceful => {
                    info!("shutting down gracefully");
                    self.shutdown(self.timeouts.graceful_shutdown_wait, false)
                        .await;
                    return;
                }
                ShutdownType::Hard => {
                    info!("shutting down hard");
                    self.shutdown(self.timeouts.hard_shutdown_wait, true).await;
                    return;
                }
                ShutdownType::No => {}
            }

            match config::load_if_changed(&self.config_path, self.current.loaded_at) {
                Ok(Some(new_config)) => {
                    let diff = config::diff(&self.current, &new_config);
                    self.apply_stops(&diff).await;
                    self.current = new_config;
                    self.apply_starts(&diff).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "config load failed, keeping previous config");
                }
            }

            self.reconcile_counts().await;
            tokio::time::sleep(self.timeouts.loop_sleep).await;
        }
    }

    /// Zero every pool's desired count and flag every running slot for
    /// shutdown, then wait out `wait` before detaching whatever tasks are
    /// still alive — `doShutdown`'s sequence. Detaching, not joining: this
    /// method must return promptly rather than block on a slot that's still
    /// unwinding an in-flight dispatch.
    ///
    /// `hard` decides whether `global_shutdown` is raised. GRACEFUL does
    /// *not* set `global_shutdown`, so an in-flight job is left alone and
    /// can finish naturally within `wait`; HARD sets it immediately, before
    /// anything else in this method runs, so the HTTP progress hook inside
    /// any in-flight dispatch observes it and aborts at its next check — the
    /// `wait` that follows is then just the grace period for the now-aborted
    /// tasks to unwind and unregister, not the thing that aborts them.
    async fn shutdown(&mut self, wait: Duration, hard: bool) {
        if hard {
            self.global_shutdown.cancel();
        }

        for pool in self.current.pools.keys().cloned().collect::<Vec<_>>() {
            let running = self.registry.pool_count(&pool);
            self.registry.request_shutdown(&pool, running);
        }

        tokio::time::sleep(wait).await;

        for (_, slots) in self.pools.drain() {
            for slot in slots {
                detach_slot(slot);
            }
        }
    }

    async fn apply_stops(&mut self, diff: &ConfigDiff) {
        for pool in &diff.pools_to_stop {
            if let Some(slots) = self.pools.remove(pool) {
                let n = slots.len() as u32;
                self.registry.request_shutdown(pool, n);
                for slot in slots {
                    detach_slot(slot);
                }
            }
        }
    }

    async fn apply_starts(&mut self, diff: &ConfigDiff) {
        for pool in &diff.pools_to_start {
            self.pools.entry(pool.clone()).or_default();
        }
        self.reconcile_counts().await;
    }

    /// Start/stop slots within each currently-desired pool until its running
    /// count matches `worker_count` — `modifyPool`'s body, minus the parts
    /// already covered by `apply_stops`/`apply_starts`. One new slot is
    /// started at a time, with the calling cycle waiting for that slot to
    /// reach the registry before starting the next, mirroring the
    /// `s_new_thread_mutex`/`s_new_thread_cond` handshake in
    /// `gearman_thread_delegate`.
    async fn reconcile_counts(&mut self) {
        let pool_names: Vec<String> = self.current.pools.keys().cloned().collect();
        for pool in pool_names {
            // Drop any RunningSlot whose task already finished on its own
            // (e.g. a scale-down's requested shutdown took effect, or the
            // slot exited after exhausting its attach retries). Without
            // this, a scaled-down pool's Vec<RunningSlot> grows forever with
            // dead JoinHandles and never again matches the registry's real
            // count.
            if let Some(slots) = self.pools.get_mut(&pool) {
                slots.retain(|slot| !slot.handle.is_finished());
            }

            let Some(spec) = self.current.pools.get(&pool).cloned() else {
                continue;
            };
            let running = self.registry.pool_count(&pool);

            if running > spec.worker_count {
                self.registry
                    .request_shutdown(&pool, running - spec.worker_count);
            } else if running < spec.worker_count {
                for _ in 0..(spec.worker_count - running) {
                    self.start_one_slot(&pool).await;
                }
            }
        }
    }

    async fn start_one_slot(&mut self, pool: &str) {
        let servers: Vec<String> = self.current.servers.iter().cloned().collect();
        let Some(spec) = self.current.pools.get(pool) else {
            return;
        };
        let jobs: Vec<String> = spec.jobs.iter().cloned().collect();
        let dispatcher = JobDispatcher::new(spec.processing_uri.clone(), self.timeouts.max_job_running_time);

        let runner = (self.slot_factory)(pool, servers, jobs, dispatcher);
        let cancel = CancellationToken::new();
        let (started_tx, started_rx) = oneshot::channel();

        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move {
            let _ = started_tx.send(());
            runner.run(cancel_clone).await;
        });

        // Wait for the handshake: the new task has been scheduled and is on
        // its way to registering. The registry's own register() call (inside
        // SlotRunner::run) is what actually makes the slot visible to
        // pool_count(); this channel only bounds how long we wait for the
        // task to run at all, same role as s_new_thread_cond.
        let _ = started_rx.await;

        self.pools.entry(pool.to_string()).or_default().push(RunningSlot { cancel, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jq::{MockJqWorker, WaitOutcome, WorkOutcome};
    use crate::metrics::Metrics;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn timeouts_derive_from_response_timeout_like_the_source() {
        let t = Timeouts::from_response_timeout(Duration::from_secs(10), Duration::from_secs(60));
        assert_eq!(t.loop_sleep, Duration::from_secs(5));
        assert_eq!(t.hard_shutdown_wait, Duration::from_secs(20));
        assert_eq!(t.graceful_shutdown_wait, Duration::from_secs(40));
    }

    #[tokio::test]
    async fn a_new_pool_is_scaled_up_to_its_worker_count() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"gearman_servers_list": ["s:1"], "pools_list": {{"p1": {{"worker_count": 2, "jobs_list": ["Sum"], "job_processing_uri": "http://127.0.0.1:9/x"}}}}}}"#
        )
        .unwrap();

        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let global_shutdown = CancellationToken::new();
        let wait_calls = Arc::new(AtomicU32::new(0));

        let factory = {
            let registry = registry.clone();
            let metrics = metrics.clone();
            let wait_calls = wait_calls.clone();
            let global_shutdown = global_shutdown.clone();
            move |pool: &str, servers: Vec<String>, jobs: Vec<String>, dispatcher: JobDispatcher| {
                let wait_calls = wait_calls.clone();
                SlotRunner::new(
                    pool,
                    servers,
                    jobs,
                    dispatcher,
                    registry.clone(),
                    metrics.clone(),
                    global_shutdown.clone(),
                    move || {
                        let wait_calls = wait_calls.clone();
                        let mut m = MockJqWorker::new();
                        m.expect_add_server().returning(|_| Ok(()));
                        m.expect_add_function().returning(|_| Ok(()));
                        m.expect_work().returning(|_| WorkOutcome::NoJobs);
                        m.expect_wait().returning(move || {
                            wait_calls.fetch_add(1, Ordering::SeqCst);
                            WaitOutcome::Timeout
                        });
                        m
                    },
                )
            }
        };

        let mut reconciler = Reconciler::new(
            file.path().to_path_buf(),
            registry.clone(),
            factory,
            global_shutdown.clone(),
            Timeouts::from_response_timeout(Duration::from_millis(50), Duration::from_secs(5)),
        );

        let ticks = Arc::new(AtomicU32::new(0));
        reconciler
            .run(move || {
                let n = ticks.fetch_add(1, Ordering::SeqCst);
                if n >= 1 {
                    ShutdownType::Hard
                } else {
                    ShutdownType::No
                }
            })
            .await;

        assert!(global_shutdown.is_cancelled());
        assert!(registry.is_empty());
    }

    /// GRACEFUL must never cancel `global_shutdown` (in-flight jobs are left
    /// alone to finish), only HARD does.
    #[tokio::test]
    async fn graceful_shutdown_does_not_cancel_global_shutdown() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"gearman_servers_list": ["s:1"], "pools_list": {{}}}}"#
        )
        .unwrap();

        let registry = Arc::new(Registry::new());
        let metrics = Arc::new(Metrics::new());
        let global_shutdown = CancellationToken::new();

        let factory = {
            let registry = registry.clone();
            let metrics = metrics.clone();
            let global_shutdown = global_shutdown.clone();
            move |pool: &str, servers: Vec<String>, jobs: Vec<String>, dispatcher: JobDispatcher| {
                SlotRunner::new(
                    pool,
                    servers,
                    jobs,
                    dispatcher,
                    registry.clone(),
                    metrics.clone(),
                    global_shutdown.clone(),
                    || MockJqWorker::new(),
                )
            }
        };

        let mut reconciler = Reconciler::new(
            file.path().to_path_buf(),
            registry.clone(),
            factory,
            global_shutdown.clone(),
            Timeouts::from_response_timeout(Duration::from_millis(20), Duration::from_secs(5)),
        );

        reconciler.run(|| ShutdownType::Graceful).await;

        assert!(!global_shutdown.is_cancelled());
        assert!(registry.is_empty());
    }
}
