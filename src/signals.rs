//! Signal wiring: SIGPIPE is ignored, SIGTERM/SIGINT/SIGHUP request a hard
//! shutdown, SIGUSR1 requests a graceful one.
//!
//! Grounded on `original_source/src/main-loop.cpp::setupSignals` — the same
//! four signals, the same two-way split (`SIGUSR1` vs everything else), just
//! expressed as `tokio::signal::unix::signal` streams fanning into a shared
//! [`crate::reconcile::ShutdownType`] instead of a `sigaction` handler
//! writing a global. SIGPIPE has no async-signal-safe, portable Tokio
//! equivalent (it isn't a signal Tokio's reactor listens for), so it's
//! ignored directly via `nix::sys::signal`, exactly as the source does with
//! a raw `sigaction`.
use crate::reconcile::ShutdownType;
use nix::sys::signal::{self, SigHandler, Signal};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

const NONE: u8 = 0;
const GRACEFUL: u8 = 1;
const HARD: u8 = 2;

/// Shared flag the reconciliation cycle polls once per iteration.
#[derive(Clone)]
pub struct ShutdownFlag(Arc<AtomicU8>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(NONE)))
    }

    pub fn get(&self) -> ShutdownType {
        match self.0.load(Ordering::SeqCst) {
            GRACEFUL => ShutdownType::Graceful,
            HARD => ShutdownType::Hard,
            _ => ShutdownType::No,
        }
    }

    fn set_graceful(&self) {
        self.0.store(GRACEFUL, Ordering::SeqCst);
    }

    fn set_hard(&self) {
        self.0.store(HARD, Ordering::SeqCst);
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Ignore SIGPIPE the way `setupSignals` does before anything else touches
/// a socket — a write to a peer that has already closed its read side
/// otherwise kills the whole process instead of returning `EPIPE` from the
/// dispatcher's HTTP call.
///
/// # Safety
/// `signal()` only installs `SIG_IGN`, never a Rust closure as the handler,
/// so none of the usual async-signal-safety hazards of a custom handler
/// apply here.
pub fn ignore_sigpipe() -> nix::Result<()> {
    unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }.map(|_| ())
}

/// Spawns the four signal-listening tasks and returns a [`ShutdownFlag`]
/// the reconciler can poll. Each task just updates the flag and returns —
/// the actual shutdown sequencing lives entirely in
/// [`crate::reconcile::Reconciler`].
pub fn spawn_handlers() -> std::io::Result<ShutdownFlag> {
    let flag = ShutdownFlag::new();

    spawn_one(SignalKind::terminate(), flag.clone(), false)?;
    spawn_one(SignalKind::interrupt(), flag.clone(), false)?;
    spawn_one(SignalKind::hangup(), flag.clone(), false)?;
    spawn_one(SignalKind::user_defined1(), flag.clone(), true)?;

    Ok(flag)
}

fn spawn_one(kind: SignalKind, flag: ShutdownFlag, graceful: bool) -> std::io::Result<()> {
    let mut stream = signal(kind)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if graceful {
                info!("received SIGUSR1, requesting graceful shutdown");
                flag.set_graceful();
            } else {
                info!("received termination signal, requesting hard shutdown");
                flag.set_hard();
            }
        }
    });
    Ok(())
}
