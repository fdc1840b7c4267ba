//! Explicit process context: clock and shutdown signal.
//!
//! The bootstrap in `bin/server.rs` used to lean on ambient process state
//! (a global logger, a bare `ctrl_c().await`). This module threads that
//! state explicitly so request-path code never reaches for a singleton.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

/// Source of the current time, abstracted so tests can freeze it.
pub trait Clock: Send + Sync + 'static {
    fn now_unix_secs(&self) -> u64;
}

/// Wall-clock implementation used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }
}

/// Shared, cloneable process context passed down to every subsystem.
#[derive(Clone)]
pub struct Context {
    clock: std::sync::Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl Context {
    pub fn new(clock: std::sync::Arc<dyn Clock>) -> Self {
        Self {
            clock,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn production() -> Self {
        Self::new(std::sync::Arc::new(SystemClock))
    }

    pub fn now_unix_secs(&self) -> u64 {
        self.clock.now_unix_secs()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal every subsystem watching `shutdown_token()` to wind down.
    pub fn begin_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[cfg(test)]
pub struct FrozenClock(pub std::sync::atomic::AtomicU64);

#[cfg(test)]
impl Clock for FrozenClock {
    fn now_unix_secs(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}
