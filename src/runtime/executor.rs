//! Task executor bridging blocking handlers and the event loop.
//!
//! Handlers produce a [`Task`]: either a synchronous closure or a future.
//! Synchronous work runs on the bounded worker pool; futures run on the
//! event loop. Either way the submitter gets a [`TaskHandle`] it can await
//! from async code or block on from a worker thread.

use super::pool::{panic_message, SubmitError, WorkerPool};
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::warn;

/// Error returned by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A unit of application work.
pub enum Task<T> {
    /// Runs to completion on a worker thread.
    Blocking(Box<dyn FnOnce() -> Result<T, HandlerError> + Send + 'static>),
    /// Runs on the event loop.
    Async(BoxFuture<'static, Result<T, HandlerError>>),
}

impl<T: Send + 'static> Task<T> {
    pub fn blocking<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T, HandlerError> + Send + 'static,
    {
        Task::Blocking(Box::new(f))
    }

    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, HandlerError>> + Send + 'static,
    {
        Task::Async(Box::pin(fut))
    }

    /// An already computed value.
    pub fn ready(value: T) -> Self {
        Task::Async(Box::pin(std::future::ready(Ok(value))))
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Blocking(_) => write!(f, "Task::Blocking"),
            Task::Async(_) => write!(f, "Task::Async"),
        }
    }
}

/// Why a task did not produce a value.
#[derive(Debug)]
pub enum TaskError {
    /// The handler returned an error.
    Failed(HandlerError),
    /// The handler panicked.
    Panicked(String),
    /// The worker pool was saturated or shut down.
    Rejected,
    /// The task was dropped before finishing.
    Cancelled,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Failed(e) => write!(f, "handler failed: {e}"),
            TaskError::Panicked(msg) => write!(f, "handler panicked: {msg}"),
            TaskError::Rejected => write!(f, "worker pool rejected the task"),
            TaskError::Cancelled => write!(f, "task was cancelled"),
        }
    }
}

impl std::error::Error for TaskError {}

pub type TaskResult<T> = Result<T, TaskError>;

/// Completion of a submitted task.
///
/// Await it from the event loop, or call [`wait`](Self::wait) from a worker
/// thread. Never call `wait` on an event-loop thread.
pub struct TaskHandle<T> {
    state: HandleState<T>,
}

enum HandleState<T> {
    Pending(oneshot::Receiver<TaskResult<T>>),
    Done(Option<TaskResult<T>>),
}

impl<T> TaskHandle<T> {
    fn pending(rx: oneshot::Receiver<TaskResult<T>>) -> Self {
        Self {
            state: HandleState::Pending(rx),
        }
    }

    fn done(result: TaskResult<T>) -> Self {
        Self {
            state: HandleState::Done(Some(result)),
        }
    }

    /// Block the current thread until the task completes.
    pub fn wait(self) -> TaskResult<T> {
        match self.state {
            HandleState::Pending(rx) => rx.blocking_recv().unwrap_or(Err(TaskError::Cancelled)),
            HandleState::Done(result) => result.unwrap_or(Err(TaskError::Cancelled)),
        }
    }
}

// The result is moved out, never pinned.
impl<T> Unpin for TaskHandle<T> {}

impl<T> Future for TaskHandle<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            HandleState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
            HandleState::Done(result) => {
                Poll::Ready(result.take().unwrap_or(Err(TaskError::Cancelled)))
            }
        }
    }
}

/// Routes tasks to the worker pool or the event loop.
#[derive(Clone)]
pub struct TaskExecutor {
    pool: Arc<WorkerPool>,
    runtime: Handle,
}

impl TaskExecutor {
    pub fn new(pool: Arc<WorkerPool>, runtime: Handle) -> Self {
        Self { pool, runtime }
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Schedule a task and return its completion handle.
    ///
    /// A saturated pool yields a handle that resolves to
    /// [`TaskError::Rejected`] immediately.
    pub fn submit<T: Send + 'static>(&self, task: Task<T>) -> TaskHandle<T> {
        match task {
            Task::Blocking(f) => {
                let (tx, rx) = oneshot::channel();
                let job = Box::new(move || {
                    let _ = tx.send(run_blocking(f));
                });
                match self.pool.try_submit(job) {
                    Ok(()) => TaskHandle::pending(rx),
                    Err(SubmitError::Full(_)) | Err(SubmitError::Closed(_)) => {
                        warn!("Worker pool saturated, rejecting task");
                        TaskHandle::done(Err(TaskError::Rejected))
                    }
                }
            }
            Task::Async(fut) => {
                let (tx, rx) = oneshot::channel();
                self.runtime.spawn(async move {
                    let _ = tx.send(run_async(fut).await);
                });
                TaskHandle::pending(rx)
            }
        }
    }

    /// Run a task to completion from a worker thread.
    ///
    /// Blocking tasks run inline since the caller already owns a worker;
    /// futures are handed to the event loop and waited on.
    pub fn run_on_worker<T: Send + 'static>(&self, task: Task<T>) -> TaskResult<T> {
        match task {
            Task::Blocking(f) => run_blocking(f),
            task @ Task::Async(_) => self.submit(task).wait(),
        }
    }
}

fn run_blocking<T>(f: Box<dyn FnOnce() -> Result<T, HandlerError> + Send>) -> TaskResult<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    }
}

async fn run_async<T>(fut: BoxFuture<'static, Result<T, HandlerError>>) -> TaskResult<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(TaskError::Failed(e)),
        Err(panic) => Err(TaskError::Panicked(panic_message(panic.as_ref()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor() -> TaskExecutor {
        let pool = Arc::new(WorkerPool::new("exec", 2, 4).unwrap());
        TaskExecutor::new(pool, Handle::current())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_task_awaited() {
        let exec = executor();
        let handle = exec.submit(Task::blocking(|| Ok(21 * 2)));
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_task_waited_from_worker() {
        let exec = executor();
        let inner = exec.clone();
        let (tx, rx) = oneshot::channel();
        exec.pool()
            .execute(move || {
                let result = inner.run_on_worker(Task::future(async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok("done")
                }));
                let _ = tx.send(result.unwrap());
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failures_are_classified() {
        let exec = executor();

        let failed = exec.submit(Task::<()>::blocking(|| Err("nope".into())));
        assert!(matches!(failed.await, Err(TaskError::Failed(_))));

        let panicked = exec.submit(Task::<()>::blocking(|| panic!("kaboom")));
        match panicked.await {
            Err(TaskError::Panicked(msg)) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected {other:?}"),
        }

        let panicked = exec.submit(Task::<()>::future(async {
            if true {
                panic!("async kaboom");
            }
            Ok(())
        }));
        assert!(matches!(panicked.await, Err(TaskError::Panicked(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_saturated_pool_rejects() {
        let pool = Arc::new(WorkerPool::new("tiny", 1, 1).unwrap());
        let exec = TaskExecutor::new(pool.clone(), Handle::current());
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let first = exec.submit(Task::blocking(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv();
            Ok(1)
        }));
        started_rx.await.unwrap();
        let second = exec.submit(Task::blocking(|| Ok(2)));
        let third = exec.submit(Task::blocking(|| Ok(3)));
        assert!(matches!(third.await, Err(TaskError::Rejected)));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(second.await.unwrap(), 2);
    }

    #[test]
    fn test_ready_task_inline() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let pool = Arc::new(WorkerPool::new("ready", 1, 1).unwrap());
        let exec = TaskExecutor::new(pool, rt.handle().clone());
        let value = rt.block_on(exec.submit(Task::ready(5)));
        assert_eq!(value.unwrap(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_resolves_pinned_values() {
        use std::marker::PhantomPinned;

        let exec = executor();
        let pinned = exec.submit(Task::ready(PhantomPinned)).await;
        assert!(pinned.is_ok());
        let pinned = exec.submit(Task::blocking(|| Ok(PhantomPinned))).await;
        assert!(pinned.is_ok());
    }
}
