//! Parent/child bookkeeping for running workers.
//!
//! Each worker owns a [`WorkerTree`] of its direct children. A child gets a
//! stop channel (a request to finish gracefully) and a child cancellation
//! token (immediate unwind). A child's returned outcome is its
//! acknowledgement.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::identifiers::WorkerIdentifiers;

/// Receiving half of a worker's stop channel.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<Option<String>>,
}

impl StopSignal {
    /// Creates a linked sender and signal.
    #[must_use]
    pub fn channel() -> (StopHandle, Self) {
        let (tx, rx) = watch::channel(None);
        (StopHandle { tx: Arc::new(tx) }, Self { rx })
    }

    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::channel().1
    }

    /// Reason, if a stop has been requested.
    #[must_use]
    pub fn requested(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Resolves once a stop is requested; returns its reason.
    ///
    /// Pends forever if the sender is dropped without requesting a stop.
    pub async fn wait(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Sending half of a stop channel.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<Option<String>>>,
}

impl StopHandle {
    /// Requests a stop. Only the first reason is kept.
    ///
    /// Returns `true` if this call made the request.
    pub fn stop(&self, reason: &str) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason.to_string());
            true
        })
    }
}

#[derive(Debug)]
struct Child {
    identifiers: WorkerIdentifiers,
    stop: StopHandle,
    cancel: CancellationToken,
}

/// Direct children of one worker.
#[derive(Debug, Clone)]
pub struct WorkerTree {
    children: Arc<Mutex<HashMap<Uuid, Child>>>,
    active: Arc<watch::Sender<usize>>,
}

impl Default for WorkerTree {
    fn default() -> Self {
        Self {
            children: Arc::new(Mutex::new(HashMap::new())),
            active: Arc::new(watch::channel(0).0),
        }
    }
}

impl WorkerTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns a child task.
    ///
    /// `run` receives the child's stop signal and a cancellation token
    /// derived from `parent_cancel`. The child is removed from the tree when
    /// its future returns.
    pub fn spawn<F, Fut, T>(
        &self,
        identifiers: WorkerIdentifiers,
        parent_cancel: &CancellationToken,
        run: F,
    ) -> JoinHandle<T>
    where
        F: FnOnce(StopSignal, CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (stop, signal) = StopSignal::channel();
        let cancel = parent_cancel.child_token();
        let id = identifiers.worker_instance_id;
        if let Ok(mut children) = self.children.lock() {
            children.insert(
                id,
                Child {
                    identifiers,
                    stop,
                    cancel: cancel.clone(),
                },
            );
            self.active.send_replace(children.len());
        }
        let future = run(signal, cancel);
        let tree = self.clone();
        tokio::spawn(async move {
            let output = future.await;
            tree.remove(id);
            output
        })
    }

    fn remove(&self, id: Uuid) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(&id);
            self.active.send_replace(children.len());
        }
    }

    /// Number of children still running.
    #[must_use]
    pub fn len(&self) -> usize {
        *self.active.borrow()
    }

    /// Returns `true` if no child is running.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Identifiers of running children.
    #[must_use]
    pub fn running(&self) -> Vec<WorkerIdentifiers> {
        self.children
            .lock()
            .map(|c| c.values().map(|child| child.identifiers).collect())
            .unwrap_or_default()
    }

    /// Asks every running child to stop; returns how many were asked.
    pub fn stop_all(&self, reason: &str) -> usize {
        let Ok(children) = self.children.lock() else {
            return 0;
        };
        children
            .values()
            .filter(|child| child.stop.stop(reason))
            .inspect(|child| debug!(child = %child.identifiers, reason, "stop requested"))
            .count()
    }

    /// Cancels every running child.
    pub fn cancel_all(&self) {
        if let Ok(children) = self.children.lock() {
            for child in children.values() {
                child.cancel.cancel();
            }
        }
    }

    /// Waits up to `timeout` for every child to finish.
    ///
    /// Returns `true` if the tree emptied in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Stops every child, waits for acknowledgement, then cancels stragglers.
    pub async fn shutdown(&self, reason: &str, ack_timeout: Duration) {
        if self.is_empty() {
            return;
        }
        self.stop_all(reason);
        if self.wait_idle(ack_timeout).await {
            return;
        }
        let stragglers = self.running();
        warn!(count = stragglers.len(), "children did not acknowledge stop, cancelling");
        self.cancel_all();
        if !self.wait_idle(ack_timeout).await {
            warn!(count = self.len(), "children still running after cancellation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::identifiers::WorkerKind;

    fn ids() -> WorkerIdentifiers {
        WorkerIdentifiers::root(WorkerKind::Coordinator, Uuid::new_v4()).child(WorkerKind::LinkFollower)
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (handle, signal) = StopSignal::channel();
        assert!(signal.requested().is_none());
        assert!(handle.stop("first"));
        assert!(!handle.stop("second"));
        assert_eq!(signal.requested().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_stopped_child_acknowledges() {
        let tree = WorkerTree::new();
        let cancel = CancellationToken::new();
        let handle = tree.spawn(ids(), &cancel, |mut stop, _cancel| async move {
            stop.wait().await
        });
        assert_eq!(tree.len(), 1);
        tree.shutdown("done", Duration::from_secs(5)).await;
        assert!(tree.is_empty());
        assert_eq!(handle.await.unwrap_or_default(), "done");
    }

    #[tokio::test]
    async fn test_straggler_is_cancelled() {
        let tree = WorkerTree::new();
        let cancel = CancellationToken::new();
        let handle = tree.spawn(ids(), &cancel, |_stop, cancel| async move {
            cancel.cancelled().await;
            "cancelled".to_string()
        });
        tree.shutdown("done", Duration::from_millis(20)).await;
        assert!(tree.is_empty());
        assert_eq!(handle.await.unwrap_or_default(), "cancelled");
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_children() {
        let tree = WorkerTree::new();
        let cancel = CancellationToken::new();
        let handle = tree.spawn(ids(), &cancel, |_stop, child| async move {
            child.cancelled().await;
            true
        });
        cancel.cancel();
        assert!(handle.await.unwrap_or(false));
        assert!(tree.wait_idle(Duration::from_secs(1)).await);
    }
}
