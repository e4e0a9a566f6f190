//! Bounded worker pool for per-item work inside a batch.
//!
//! A pool wraps one handler and runs at most `workers` invocations of it at
//! a time; further submissions wait in an unbounded queue. Each submission
//! returns a [`TaskHandle`] that resolves to the handler's result.
//!
//! ```no_run
//! # async fn demo() -> batchq::error::Result<()> {
//! use batchq::pool::{WorkerPoolBuilder, join_all};
//!
//! let mut pool = WorkerPoolBuilder::new()
//!     .workers(5)
//!     .name("geocode")
//!     .build(|city: String| async move { Ok::<_, String>(city.len()) })?;
//!
//! let handles = ["Berlin", "Oslo"].map(|c| pool.submit(c.to_string()));
//! let lengths = join_all(handles).await; // submission order
//! assert_eq!(lengths.len(), 2);
//! pool.shutdown().await;
//! # Ok(()) }
//! ```
//!
//! Call [`WorkerPool::shutdown`] once nothing more will be submitted. A
//! pool dropped without it detaches its workers: queued work still runs,
//! nobody awaits the workers, and they exit when the queue drains or the
//! runtime stops, whichever comes first.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::FutureExt as _;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Why a pooled task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The handler returned an error.
    #[error("task failed: {0}")]
    Failed(String),
    /// The handler panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task never ran: submitted after shutdown, or its worker went away.
    #[error("task cancelled")]
    Cancelled,
}

type TaskResult<R> = std::result::Result<R, TaskError>;

struct Job<T, R> {
    input: T,
    reply: oneshot::Sender<TaskResult<R>>,
}

/// Future result of one submission.
///
/// Await it directly or call [`TaskHandle::join`].
#[must_use = "a task handle does nothing unless joined"]
pub struct TaskHandle<R> {
    reply: oneshot::Receiver<TaskResult<R>>,
}

impl<R> TaskHandle<R> {
    /// Wait for this task and return its result.
    pub async fn join(self) -> TaskResult<R> {
        self.await
    }

    fn cancelled() -> Self {
        let (_, reply) = oneshot::channel();
        Self { reply }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = TaskResult<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.reply)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Cancelled)))
    }
}

/// Wait for every handle. Results come back in the order of `handles`,
/// with failed tasks as errors in their own positions.
pub async fn join_all<R, I>(handles: I) -> Vec<TaskResult<R>>
where
    I: IntoIterator<Item = TaskHandle<R>>,
{
    futures::future::join_all(handles).await
}

/// Builder for [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    workers: usize,
    name: String,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self {
            workers: 5,
            name: "pool".to_string(),
        }
    }
}

impl WorkerPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maximum number of concurrently running handler invocations.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Name used in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Start the workers around an async handler.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build<T, R, E, F, Fut>(self, handler: F) -> Result<WorkerPool<T, R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Display + Send,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        if self.workers == 0 {
            return Err(Error::Config("worker pool needs at least one worker".into()));
        }

        let (sender, receiver) = mpsc::unbounded_channel::<Job<T, R>>();
        let queue = Arc::new(Mutex::new(receiver));
        let handler = Arc::new(handler);

        let workers = (0..self.workers)
            .map(|worker| {
                let queue = Arc::clone(&queue);
                let handler = Arc::clone(&handler);
                let name = self.name.clone();
                tokio::spawn(async move {
                    loop {
                        let job = queue.lock().await.recv().await;
                        let Some(Job { input, reply }) = job else {
                            break;
                        };
                        let outcome = AssertUnwindSafe(async { handler(input).await })
                            .catch_unwind()
                            .await;
                        let result = match outcome {
                            Ok(Ok(value)) => Ok(value),
                            Ok(Err(err)) => Err(TaskError::Failed(err.to_string())),
                            Err(panic) => {
                                let message = panic_message(panic.as_ref());
                                warn!(pool = %name, worker, %message, "pooled task panicked");
                                Err(TaskError::Panicked(message))
                            }
                        };
                        // The submitter may have dropped its handle.
                        let _ = reply.send(result);
                    }
                    debug!(pool = %name, worker, "worker stopped");
                })
            })
            .collect();

        debug!(pool = %self.name, workers = self.workers, "worker pool started");
        Ok(WorkerPool {
            sender: Some(sender),
            workers,
            name: self.name,
            size: self.workers,
        })
    }

    /// Start the workers around a blocking handler. Each invocation runs on
    /// Tokio's blocking thread pool; at most `workers` run at once.
    pub fn build_blocking<T, R, E, F>(self, handler: F) -> Result<WorkerPool<T, R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(T) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.build(move |input: T| {
            let handler = Arc::clone(&handler);
            async move {
                match tokio::task::spawn_blocking(move || handler(input)).await {
                    Ok(result) => result.map_err(|err| err.to_string()),
                    Err(join) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                    Err(join) => Err(join.to_string()),
                }
            }
        })
    }
}

/// A fixed-size pool of workers running one handler.
pub struct WorkerPool<T, R> {
    sender: Option<mpsc::UnboundedSender<Job<T, R>>>,
    workers: Vec<JoinHandle<()>>,
    name: String,
    size: usize,
}

impl<T, R> WorkerPool<T, R> {
    /// Queue one invocation of the handler.
    ///
    /// After [`shutdown`](Self::shutdown) the returned handle resolves to
    /// [`TaskError::Cancelled`].
    pub fn submit(&self, input: T) -> TaskHandle<R> {
        let Some(sender) = &self.sender else {
            return TaskHandle::cancelled();
        };
        let (reply, receiver) = oneshot::channel();
        if sender.send(Job { input, reply }).is_err() {
            return TaskHandle::cancelled();
        }
        TaskHandle { reply: receiver }
    }

    /// Queue one invocation per input, keeping input order.
    pub fn submit_all<I>(&self, inputs: I) -> Vec<TaskHandle<R>>
    where
        I: IntoIterator<Item = T>,
    {
        inputs.into_iter().map(|input| self.submit(input)).collect()
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.is_none()
    }

    /// Stop accepting work, let queued and running tasks finish, and wait
    /// for every worker to exit. Calling it again is a no-op.
    pub async fn shutdown(&mut self) {
        if self.sender.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                warn!(pool = %self.name, "worker ended abnormally: {err}");
            }
        }
        debug!(pool = %self.name, "worker pool shut down");
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
