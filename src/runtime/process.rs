//! Pre-forked worker processes.
//!
//! The parent binds the listener, forks `workers` children that each run
//! their own event loop on the inherited socket, then supervises them:
//! SIGINT and SIGTERM are forwarded, and children still alive after the
//! shutdown deadline are killed.

use std::io;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Fork `workers` children running `child`, then supervise them.
///
/// Must be called before any threads (including a tokio runtime) exist in
/// the parent. `child` returns the exit status for the worker process.
#[cfg(unix)]
pub fn run_forked<F>(workers: usize, shutdown_timeout: Duration, child: F) -> io::Result<()>
where
    F: Fn(usize) -> i32,
{
    let mut children = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        // SAFETY: the parent is still single-threaded here
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                let err = io::Error::last_os_error();
                error!(error = %err, "fork failed");
                signal_all(&children, libc::SIGTERM);
                return Err(err);
            }
            0 => {
                let status = child(worker_id);
                std::process::exit(status);
            }
            pid => {
                info!(worker = worker_id, pid, "Worker process started");
                children.push(pid);
            }
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let handle = super::ShutdownHandle::new();
    let mut signal = handle.signal();

    runtime.block_on(async {
        tokio::spawn(super::shutdown::watch_os_signals(handle));
        let mut ticker = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = signal.wait() => break,
                _ = ticker.tick() => {
                    reap(&mut children);
                    if children.is_empty() {
                        info!("All worker processes exited");
                        return;
                    }
                }
            }
        }

        info!(workers = children.len(), "Forwarding shutdown to workers");
        signal_all(&children, libc::SIGTERM);
        let deadline = Instant::now() + shutdown_timeout;
        while !children.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            reap(&mut children);
        }
        if !children.is_empty() {
            warn!(workers = children.len(), "Workers did not exit in time, killing");
            signal_all(&children, libc::SIGKILL);
            for pid in children.drain(..) {
                let mut status = 0;
                // SAFETY: pid is a child of this process
                unsafe { libc::waitpid(pid, &mut status, 0) };
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn run_forked<F>(_workers: usize, _shutdown_timeout: Duration, _child: F) -> io::Result<()>
where
    F: Fn(usize) -> i32,
{
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process workers require a unix platform",
    ))
}

#[cfg(unix)]
fn signal_all(children: &[libc::pid_t], sig: libc::c_int) {
    for &pid in children {
        // SAFETY: pid is a child of this process
        unsafe { libc::kill(pid, sig) };
    }
}

/// Collect exited children without blocking.
#[cfg(unix)]
fn reap(children: &mut Vec<libc::pid_t>) {
    children.retain(|&pid| {
        let mut status = 0;
        // SAFETY: pid is a child of this process
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid {
            if libc::WIFEXITED(status) {
                info!(pid, code = libc::WEXITSTATUS(status), "Worker process exited");
            } else {
                warn!(pid, "Worker process terminated abnormally");
            }
            false
        } else {
            rc == 0
        }
    });
}
