//! A single-lane FIFO executor for publishing tasks.
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error};

type PendingTask = BoxFuture<'static, ()>;

/// `Serializer` runs the tasks it is given one at a time, in submission order.
///
/// A task starts only after the previous one completed, successfully or not. This is what stops
/// the exchange declaration and publishing of two concurrent `publish` calls from interleaving.
///
/// # Unbounded
///
/// The queue has no upper bound: if messages are submitted faster than they can be published,
/// memory usage grows without limit. Applying backpressure is up to the caller, e.g. by
/// checking [`Serializer::pending`].
#[derive(Clone)]
pub struct Serializer {
    sender: UnboundedSender<PendingTask>,
    pending: Arc<AtomicUsize>,
}

impl Serializer {
    /// Spawn the worker draining the queue.
    ///
    /// Must be called within a Tokio runtime. The worker stops once every clone of
    /// the `Serializer` has been dropped and all queued tasks have run.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        tokio::spawn(run(receiver, Arc::clone(&pending)));
        Self { sender, pending }
    }

    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task.boxed()).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            error!("The publishing lane has shut down, the task has been dropped");
        }
    }

    /// Number of tasks that are queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut receiver: UnboundedReceiver<PendingTask>, pending: Arc<AtomicUsize>) {
    while let Some(task) = receiver.recv().await {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!("A publishing task panicked");
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("Publishing lane closed");
}
