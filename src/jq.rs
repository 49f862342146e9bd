//! The JQ client boundary.
//!
//! The JQ client library is treated as a third-party collaborator —
//! `add_server`, `add_function(name, cb)`, `work()`, `wait()` — with
//! implementing its wire protocol out of scope. No such crate exists in
//! this ecosystem, so this module defines the trait a real one would
//! satisfy, a narrow seam the rest of the crate depends on without owning.
//! Production code wires a concrete `JqWorker` in; tests use a
//! `mockall`-generated mock.

use async_trait::async_trait;
use bytes::Bytes;

/// One job handed to this slot's callback by the JQ library's `work()`.
#[derive(Debug, Clone)]
pub struct JqJob {
    pub function_name: String,
    pub handle: String,
    pub unique: String,
    pub workload: Bytes,
}

/// What the job callback reports back to the JQ library, mirroring the
/// `(gearman_ret, result_bytes)` pair the callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Success,
    WorkFail,
}

/// Invoked synchronously from inside [`JqWorker::work`], exactly the way
/// the real library invokes the registered function pointer while still
/// inside `gearman_worker_work()`. Blocking here blocks the whole slot.
/// [`crate::slot::SlotRunner`] implements this by delegating to
/// [`crate::dispatch::JobDispatcher`].
#[async_trait]
pub trait JobCallback: Send + Sync {
    async fn call(&self, job: JqJob) -> CallbackOutcome;
}

/// Outcome of one `GRAB_JOB` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// A job was matched and the callback already ran synchronously.
    Success,
    /// No work available right now; caller should move to `POLL`.
    IoWait,
    NoJobs,
    /// The callback ran but reported a non-success job outcome.
    WorkFailed,
    /// The connection timed out or dropped — retriable.
    Timeout,
    NotConnected,
}

/// Outcome of one `POLL` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Data arrived; caller should return to `GRAB_JOB`.
    Success,
    /// Nothing arrived within the server response timeout.
    Timeout,
    /// Every attached server is gone — fatal.
    NoActiveFds,
}

/// The primitives a real JQ worker handle provides, as consumed by
/// [`crate::slot::SlotRunner`]. `add_server`/`add_function` return
/// `Err(true)` for a retriable attach failure and `Err(false)` for a fatal
/// one.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait JqWorker: Send {
    fn add_server(&mut self, server: &str) -> Result<(), bool>;

    fn add_function(&mut self, name: &str) -> Result<(), bool>;

    /// Non-blocking grab. When a job is matched the implementation invokes
    /// `callback` synchronously before returning, exactly as the real
    /// library invokes the registered function pointer inside
    /// `gearman_worker_work()`.
    async fn work(&mut self, callback: &(dyn JobCallback + Sync)) -> WorkOutcome;

    /// Blocks up to the configured server response timeout.
    async fn wait(&mut self) -> WaitOutcome;
}
