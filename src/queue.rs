//! Serial execution queues.
//!
//! A [`SerialQueue`] runs its jobs in submission order, one at a time, on
//! a dedicated drain task. Queues on the same runtime execute in parallel
//! with each other; jobs on one queue never overlap. Connections use one
//! queue per concern (send, receive, handler dispatch) so that ordering
//! guarantees follow directly from queue FIFO-ness.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO queue of closures with non-overlapping execution.
///
/// Handles are cheap to clone and all refer to the same queue. The drain
/// task exits when every handle is gone. Creating a queue requires an
/// ambient tokio runtime.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
    label: Arc<str>,
}

static DEFAULT_QUEUE: std::sync::OnceLock<SerialQueue> = std::sync::OnceLock::new();

impl SerialQueue {
    pub fn new(label: impl Into<Arc<str>>) -> SerialQueue {
        let label = label.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });
        SerialQueue { tx, label }
    }

    /// The process-wide default target queue, created on first use.
    ///
    /// Unlike queues made with [`SerialQueue::new`], the default queue
    /// drains on its own dedicated thread, so it keeps working across
    /// runtime shutdowns for as long as the process lives.
    pub fn default_queue() -> SerialQueue {
        DEFAULT_QUEUE
            .get_or_init(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                std::thread::Builder::new()
                    .name("xipc-default-queue".into())
                    .spawn(move || {
                        while let Some(job) = rx.blocking_recv() {
                            job();
                        }
                    })
                    .expect("spawning the default queue thread");
                SerialQueue {
                    tx,
                    label: "xipc.queue.default".into(),
                }
            })
            .clone()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueue `job` and return immediately.
    pub fn dispatch_async(&self, job: impl FnOnce() + Send + 'static) {
        // A closed channel means the runtime is shutting down; the job is
        // dropped, matching dispatch-after-teardown semantics.
        let _ = self.tx.send(Box::new(job));
    }

    /// Enqueue `job` and block the calling thread until it has run.
    ///
    /// All previously enqueued jobs run first. Must not be called from an
    /// async context: it parks the thread.
    pub fn dispatch_sync(&self, job: impl FnOnce() + Send + 'static) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self.tx.send(Box::new(move || {
            job();
            let _ = done_tx.send(());
        }));
        if sent.is_ok() {
            let _ = done_rx.blocking_recv();
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue").field("label", &self.label).finish()
    }
}
