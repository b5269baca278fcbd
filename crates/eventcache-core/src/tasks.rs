//! Tracked set of detached background tasks.
//!
//! Stale refreshes and remote writes are fire-and-forget from the caller's
//! point of view, but they still belong to someone: this registry owns their
//! handles so shutdown can wait for them or abort them.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::utils::lock;

pub struct BackgroundTasks {
    name: &'static str,
    set: Mutex<JoinSet<()>>,
}

impl BackgroundTasks {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            set: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a task onto the current runtime and track it.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = lock(&self.set);
        // Reap whatever already finished so the set does not grow unbounded
        while let Some(result) = set.try_join_next() {
            self.report(result);
        }
        set.spawn(task);
    }

    /// Number of tracked tasks that have not been reaped yet.
    pub fn len(&self) -> usize {
        lock(&self.set).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every tracked task, including ones spawned while waiting,
    /// has finished.
    pub async fn drain(&self) {
        loop {
            let mut pending = std::mem::take(&mut *lock(&self.set));
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                self.report(result);
            }
        }
    }

    /// Wait up to `grace` for tracked tasks, then abort the rest.
    /// Returns `true` if everything finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let mut pending = std::mem::take(&mut *lock(&self.set));
            if pending.is_empty() {
                return true;
            }
            loop {
                match tokio::time::timeout_at(deadline, pending.join_next()).await {
                    Ok(Some(result)) => self.report(result),
                    Ok(None) => break,
                    Err(_) => {
                        let mut late = std::mem::take(&mut *lock(&self.set));
                        pending.abort_all();
                        late.abort_all();
                        // Joining aborted tasks waits until their futures are dropped
                        while pending.join_next().await.is_some() {}
                        while late.join_next().await.is_some() {}
                        warn!(tasks = self.name, "Shutdown grace period elapsed, aborted remaining tasks");
                        return false;
                    }
                }
            }
        }
    }

    fn report(&self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            if e.is_panic() {
                warn!(tasks = self.name, error = %e, "Background task panicked");
            } else {
                debug!(tasks = self.name, error = %e, "Background task cancelled");
            }
        }
    }
}
