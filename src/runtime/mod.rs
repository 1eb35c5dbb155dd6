//! Concurrency runtime.
//!
//! - `acceptor`: listening sockets and the accept loops
//! - `connection`: registry of live connections
//! - `executor`: blocking/async task bridge
//! - `pool`: bounded worker threads
//! - `process`: pre-forked worker supervision
//! - `shutdown`: graceful shutdown signal

pub mod acceptor;
mod connection;
mod executor;
mod pool;
pub mod process;
pub mod shutdown;

pub use connection::{Connection, ConnectionGuard, ConnectionRegistry, Connections};
pub use executor::{HandlerError, Task, TaskError, TaskExecutor, TaskHandle, TaskResult};
pub use pool::{Job, SubmitError, WorkerPool};
pub use shutdown::{ShutdownHandle, ShutdownSignal};

/// Build the event loop with `threads` workers.
pub fn build_event_loop(threads: usize) -> std::io::Result<tokio::runtime::Runtime> {
    if threads <= 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("event-loop")
            .enable_all()
            .build()
    }
}
