//! Serialized execution queue.
//!
//! Every [`SerialQueue`] owns one drain loop spawned onto a shared
//! [`ThreadPool`]. Tasks submitted to the same queue run one at a time in
//! submission order, tasks of different queues run concurrently.

use std::{
    fmt::Debug,
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use futures::{
    channel::{mpsc, oneshot},
    executor::ThreadPool,
    FutureExt, StreamExt,
};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle of one serialized queue. The queue shuts down after every
/// handle has been dropped and the already submitted tasks have run.
#[derive(Clone)]
pub struct SerialQueue {
    label: Arc<str>,
    sender: mpsc::UnboundedSender<Task>,
}

impl Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl SerialQueue {
    /// Create new queue and spawn its drain loop on `pool`.
    pub fn new(label: impl Into<String>, pool: &ThreadPool) -> Self {
        let label: Arc<str> = label.into().into();

        let (sender, mut receiver) = mpsc::unbounded::<Task>();

        let loop_label = label.clone();

        pool.spawn_ok(async move {
            while let Some(task) = receiver.next().await {
                if catch_unwind(AssertUnwindSafe(task)).is_err() {
                    log::error!(target:"serial_queue", "queue({}) task panicked", loop_label);
                }
            }

            log::trace!(target:"serial_queue", "queue({}) released", loop_label);
        });

        Self { label, sender }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Submit `task`. Returns false if the queue is no longer running.
    pub fn dispatch_async<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.unbounded_send(Box::new(task)).is_ok()
    }

    /// Resolves after every task submitted before this call has run.
    pub fn barrier(&self) -> impl Future<Output = ()> + Send + 'static {
        let (sender, receiver) = oneshot::channel::<()>();

        self.dispatch_async(move || {
            _ = sender.send(());
        });

        receiver.map(|_| ())
    }

    /// Returns true if both handles refer to the same queue.
    pub fn same_queue(&self, other: &SerialQueue) -> bool {
        self.sender.same_receiver(&other.sender)
    }
}
