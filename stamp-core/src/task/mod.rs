//! Background execution context.
//!
//! Disk writes, file deletions, JPEG encoding and device-condition
//! polling run here, never on the render path. [`Background`] is a
//! cheap cloneable handle: every task spawned through it is tracked so
//! tests and shutdown code can wait for outstanding work with
//! [`flush`](Background::flush).

use std::future::Future;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::StampError;

/// Handle to the background context.
#[derive(Debug, Clone)]
pub struct Background {
    handle: Handle,
    tracker: TaskTracker,
}

impl Background {
    /// Run background work on `handle`.
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            tracker: TaskTracker::new(),
        }
    }

    /// Use the runtime the caller is currently running on.
    pub fn current() -> Result<Self, StampError> {
        let handle = Handle::try_current().map_err(|e| StampError::NoRuntime(e.to_string()))?;
        Ok(Self::new(handle))
    }

    /// Spawn a tracked task. Never blocks the caller.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(fut, &self.handle)
    }

    /// Run CPU-heavy or blocking work on the blocking pool, tracked.
    pub fn spawn_blocking<F, T>(&self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.tracker.spawn_blocking_on(f, &self.handle)
    }

    /// Number of tracked tasks still running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every task spawned so far (and any they spawn in
    /// turn) has finished. The context stays usable afterwards.
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

// ── Tests ────────────────────────────────────────────────────────
