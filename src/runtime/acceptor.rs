//! Listening sockets and accept loops.
//!
//! Two strategies share the registry and backpressure rules:
//! - `accept_to_pool`: hands each connection to a bounded worker pool and
//!   pauses accepting while the pool is saturated
//! - `accept_to_tasks`: spawns one event-loop task per connection, bounded by
//!   a semaphore sized to the connection limit

use super::connection::Connection;
use super::pool::{Job, SubmitError, WorkerPool};
use super::shutdown::ShutdownSignal;
use crate::server::Engine;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Create a listening socket.
///
/// `SO_REUSEPORT` lets pre-forked workers and restarts bind the same port.
/// For IPv6 addresses `ipv6_only` controls whether IPv4-mapped peers are
/// refused.
pub fn bind_listener(
    addr: SocketAddr,
    ipv6_only: bool,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(ipv6_only)?;
    }
    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    #[cfg(not(unix))]
    let _ = reuse_port;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Accept connections and run each one on a pool worker.
pub async fn accept_to_pool(
    listener: TcpListener,
    engine: Arc<Engine>,
    pool: Arc<WorkerPool>,
    mut shutdown: ShutdownSignal,
) {
    let backoff = engine.config().accept_backoff;
    info!(address = ?listener.local_addr().ok(), "Accepting into worker pool");

    'accept: loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                // EMFILE and friends: back off instead of spinning
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let Some(guard) = engine
            .connections()
            .register(Connection::new(peer, engine.transport()))
        else {
            warn!(peer = %peer, "Connection limit reached, refusing");
            continue;
        };
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to detach socket from event loop");
                continue;
            }
        };
        debug!(peer = %peer, conn = guard.id(), "New connection");

        let worker_engine = Arc::clone(&engine);
        let mut job: Job = Box::new(move || worker_engine.serve_blocking(stream, guard));
        loop {
            match pool.try_submit(job) {
                Ok(()) => break,
                Err(SubmitError::Full(returned)) => {
                    trace!("Worker pool saturated, pausing accept");
                    job = returned;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait() => break 'accept,
                    }
                }
                Err(SubmitError::Closed(_)) => break 'accept,
            }
        }
    }
    info!("Accept loop stopped");
}

/// Accept connections and run each one as an event-loop task.
pub async fn accept_to_tasks(
    listener: TcpListener,
    engine: Arc<Engine>,
    mut shutdown: ShutdownSignal,
) {
    let backoff = engine.config().accept_backoff;
    let connection_limit = Arc::new(Semaphore::new(engine.config().max_connections));
    info!(address = ?listener.local_addr().ok(), "Accepting into event loop");

    loop {
        // Wait for a connection slot
        let permit = tokio::select! {
            permit = connection_limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.wait() => break,
        };

        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.wait() => break,
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        let Some(guard) = engine
            .connections()
            .register(Connection::new(peer, engine.transport()))
        else {
            warn!(peer = %peer, "Connection limit reached, refusing");
            continue;
        };
        debug!(peer = %peer, conn = guard.id(), "New connection");

        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine.serve_async(stream, guard).await;
            drop(permit);
        });
    }
    info!("Accept loop stopped");
}
