//! Bookkeeping for background workers (acceptor, per-connection readers,
//! reconnect loop, heartbeat and sweep timers).
//!
//! Every worker races its future against a shared [`CancellationToken`], so
//! one [`WorkerSet::shutdown`] stops all of them. Sockets owned by a
//! cancelled worker are dropped with its future, which closes them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

struct Worker {
    id: u64,
    name: &'static str,
    handle: JoinHandle<()>,
}

struct Workers {
    token: CancellationToken,
    running: Vec<Worker>,
}

pub struct WorkerSet {
    label: &'static str,
    inner: Mutex<Workers>,
    next_id: AtomicU64,
}

impl WorkerSet {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            inner: Mutex::new(Workers {
                token: CancellationToken::new(),
                running: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn `fut` as a worker. It is dropped as soon as the set is shut
    /// down; spawning after shutdown (and before [`reset`](Self::reset))
    /// yields a worker that exits immediately.
    pub fn spawn<F>(&self, name: &'static str, fut: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let label = self.label;
        let mut inner = self.inner.lock();
        let token = inner.token.clone();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => trace!(set = label, worker = name, id, "worker cancelled"),
                _ = fut => trace!(set = label, worker = name, id, "worker finished"),
            }
        });

        inner.running.retain(|w| !w.handle.is_finished());
        inner.running.push(Worker { id, name, handle });
        id
    }

    /// A token cancelled together with this set, for work that must also be
    /// stoppable on its own (one connection's reader).
    pub fn child_token(&self) -> CancellationToken {
        self.inner.lock().token.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().token.is_cancelled()
    }

    /// Number of workers that have not finished yet.
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.running.retain(|w| !w.handle.is_finished());
        inner.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the workers still running, in spawn order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut inner = self.inner.lock();
        inner.running.retain(|w| !w.handle.is_finished());
        inner.running.iter().map(|w| w.name).collect()
    }

    /// Cancel every worker without waiting for them.
    pub fn cancel(&self) {
        self.inner.lock().token.cancel();
    }

    /// Cancel every worker and wait for all of them to unwind.
    ///
    /// Must not be awaited from inside one of this set's own workers.
    pub async fn shutdown(&self) {
        let running = {
            let mut inner = self.inner.lock();
            inner.token.cancel();
            std::mem::take(&mut inner.running)
        };
        for worker in running {
            if let Err(e) = worker.handle.await {
                if e.is_panic() {
                    tracing::error!(set = self.label, worker = worker.name, id = worker.id, "worker panicked");
                }
            }
        }
    }

    /// Arm the set again after a shutdown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.token.is_cancelled() {
            inner.token = CancellationToken::new();
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.token.cancel();
        for worker in inner.running.drain(..) {
            worker.handle.abort();
        }
    }
}

impl std::fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSet")
            .field("label", &self.label)
            .field("running", &self.inner.lock().running.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[tokio::test]
    async fn finished_workers_are_pruned() {
        let set = WorkerSet::new("test");
        set.spawn("quick", async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_workers() {
        let set = WorkerSet::new("test");
        let reached = Arc::new(AtomicBool::new(false));
        let flag = reached.clone();
        set.spawn("sleeper", async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(set.names(), vec!["sleeper"]);

        tokio::time::timeout(Duration::from_secs(1), set.shutdown())
            .await
            .expect("shutdown hung");
        assert!(!reached.load(Ordering::SeqCst));
        assert!(set.is_shut_down());
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn child_tokens_follow_the_set_and_reset_rearms() {
        let set = WorkerSet::new("test");
        let child = set.child_token();
        set.shutdown().await;
        assert!(child.is_cancelled());

        // Spawned while shut down: exits at once.
        set.spawn("late", std::future::pending());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(set.is_empty());

        set.reset();
        assert!(!set.is_shut_down());
        assert!(!set.child_token().is_cancelled());
    }
}
