//! Server lifecycle and per-connection dispatch.
//!
//! [`Server`] binds the listener and runs one of the three worker modes.
//! [`Engine`] is what every accepted connection goes through: TLS handshake,
//! entry protocol selection, the HTTP/1.1 loop, and the hand-off to an
//! HTTP/2 or WebSocket session on the event loop.

use crate::config::{Config, ConfigError, WorkerMode};
use crate::error::{ConnectionError, ServerError};
use crate::protocols::dispatch::{self, Entry};
use crate::protocols::http1::{self, Handoff};
use crate::protocols::websocket::WebSocketSession;
use crate::protocols::{http2, Protocol, ServeContext};
use crate::runtime::acceptor::{accept_to_pool, accept_to_tasks, bind_listener};
use crate::runtime::shutdown::watch_os_signals;
use crate::runtime::{
    build_event_loop, process, ConnectionGuard, Connections, ShutdownHandle, TaskExecutor,
    WorkerPool,
};
use crate::service::{ConnectionInfo, Service};
use crate::transport::tls::load_server_config;
use crate::transport::{AsyncSocket, BlockingSocket, Rewind, Transport, TransportError};
use bytes::Bytes;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Blocking task threads in each forked worker process.
const CHILD_TASK_WORKERS: usize = 2;

/// Shared state for serving connections.
pub struct Engine {
    ctx: ServeContext,
    tls: Option<TlsAcceptor>,
    connections: Arc<Connections>,
    shutdown: ShutdownHandle,
}

impl Engine {
    pub fn new(
        ctx: ServeContext,
        tls: Option<Arc<ServerConfig>>,
        shutdown: ShutdownHandle,
    ) -> Arc<Self> {
        let connections = Connections::new(ctx.config.max_connections);
        Arc::new(Self {
            ctx,
            tls: tls.map(TlsAcceptor::from),
            connections,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    pub fn transport(&self) -> Transport {
        if self.tls.is_some() {
            Transport::Tls
        } else {
            Transport::Plain
        }
    }

    /// Serve a connection on the calling worker thread.
    ///
    /// HTTP/1.1 runs here; a switch to HTTP/2 or WebSocket moves the socket
    /// onto the event loop and frees the worker.
    pub fn serve_blocking(self: &Arc<Self>, stream: std::net::TcpStream, guard: ConnectionGuard) {
        let id = guard.id();
        if let Err(e) = self.run_blocking(stream, guard) {
            log_connection_error(id, &e);
        }
    }

    fn run_blocking(
        self: &Arc<Self>,
        stream: std::net::TcpStream,
        guard: ConnectionGuard,
    ) -> Result<(), ConnectionError> {
        let mut socket = match &self.tls {
            Some(acceptor) => {
                BlockingSocket::tls(stream, acceptor, self.ctx.executor.runtime().clone())
            }
            None => BlockingSocket::plain(stream),
        }
        .map_err(TransportError::from)?;
        socket.do_handshake(self.config().handshake_timeout)?;
        let info = ConnectionInfo {
            peer_addr: socket.peer_addr(),
            transport: socket.transport(),
            protocol: Protocol::Http1,
        };

        let entry = dispatch::select_entry(
            socket.alpn_protocol(),
            info.transport == Transport::Tls,
            self.config().http2.enabled,
        );
        let handoff = match entry {
            Entry::Http2 => Handoff::Http2 {
                io: socket,
                buffered: Bytes::new(),
                upgrade: None,
            },
            Entry::Http1 { h2c } => {
                let signal = self.shutdown.signal();
                http1::blocking::serve(socket, h2c, &self.ctx, &guard, &signal)?
            }
        };
        if matches!(handoff, Handoff::Closed) {
            return Ok(());
        }

        let runtime = self.ctx.executor.runtime().clone();
        let handoff = {
            let _entered = runtime.enter();
            handoff
                .try_map_io(BlockingSocket::into_async)
                .map_err(TransportError::from)?
        };
        let engine = Arc::clone(self);
        runtime.spawn(async move {
            let id = guard.id();
            if let Err(e) = engine.continue_session(handoff, info, &guard).await {
                log_connection_error(id, &e);
            }
        });
        Ok(())
    }

    /// Serve a connection as an event-loop task.
    pub async fn serve_async(self: Arc<Self>, stream: tokio::net::TcpStream, guard: ConnectionGuard) {
        if let Err(e) = self.run_async(stream, &guard).await {
            log_connection_error(guard.id(), &e);
        }
    }

    async fn run_async(
        &self,
        stream: tokio::net::TcpStream,
        guard: &ConnectionGuard,
    ) -> Result<(), ConnectionError> {
        let mut socket = match &self.tls {
            Some(acceptor) => AsyncSocket::tls(stream, acceptor),
            None => AsyncSocket::plain(stream),
        }
        .map_err(TransportError::from)?;
        socket.do_handshake(self.config().handshake_timeout).await?;
        let info = ConnectionInfo {
            peer_addr: socket.peer_addr(),
            transport: socket.transport(),
            protocol: Protocol::Http1,
        };

        let entry = dispatch::select_entry(
            socket.alpn_protocol(),
            info.transport == Transport::Tls,
            self.config().http2.enabled,
        );
        let handoff = match entry {
            Entry::Http2 => Handoff::Http2 {
                io: socket,
                buffered: Bytes::new(),
                upgrade: None,
            },
            Entry::Http1 { h2c } => {
                http1::nonblocking::serve(
                    socket,
                    &[],
                    info,
                    h2c,
                    &self.ctx,
                    guard,
                    self.shutdown.signal(),
                )
                .await?
            }
        };
        self.continue_session(handoff, info, guard).await
    }

    /// Run whatever protocol the HTTP/1.1 loop handed over.
    async fn continue_session<S>(
        &self,
        handoff: Handoff<S>,
        info: ConnectionInfo,
        guard: &ConnectionGuard,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        match handoff {
            Handoff::Closed => Ok(()),
            Handoff::Http2 {
                io,
                buffered,
                upgrade,
            } => {
                guard.set_protocol(Protocol::Http2);
                debug!(conn = guard.id(), h2c = upgrade.is_some(), "Starting HTTP/2 session");
                let info = ConnectionInfo {
                    protocol: Protocol::Http2,
                    ..info
                };
                http2::serve(
                    io,
                    buffered,
                    upgrade,
                    &self.ctx,
                    info,
                    Some(guard),
                    self.shutdown.signal(),
                )
                .await?;
                Ok(())
            }
            Handoff::WebSocket {
                io,
                buffered,
                view,
                deflate,
            } => {
                guard.set_protocol(Protocol::WebSocket);
                debug!(conn = guard.id(), deflate = deflate.is_some(), "Starting WebSocket session");
                let session = WebSocketSession::new(
                    Rewind::new(buffered, io),
                    self.config().websocket.clone(),
                    view,
                    deflate,
                    self.ctx.executor.clone(),
                );
                let frame = session.run(self.shutdown.signal()).await;
                debug!(conn = guard.id(), code = ?frame.code, "WebSocket session closed");
                Ok(())
            }
        }
    }
}

fn log_connection_error(conn: usize, e: &ConnectionError) {
    if e.is_routine() {
        debug!(conn, error = %e, "Connection closed");
    } else {
        warn!(conn, error = %e, "Connection failed");
    }
}

/// A bound server, ready to run.
pub struct Server {
    config: Config,
    service: Arc<dyn Service>,
    tls: Option<Arc<ServerConfig>>,
    listener: std::net::TcpListener,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Bind the configured address and load TLS material.
    pub fn bind<S: Service>(config: Config, service: S) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|_| ConfigError::Invalid("listen must be an IP address and port"))?;
        let reuse_port = config.worker_mode == WorkerMode::Processes;
        let listener = bind_listener(addr, config.ipv6_only, reuse_port)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let tls = match &config.tls {
            Some(files) => Some(load_server_config(
                &files.cert,
                &files.key,
                config.http2.enabled,
            )?),
            None => None,
        };
        Ok(Self {
            config,
            service: Arc::new(service),
            tls,
            listener,
            shutdown: ShutdownHandle::new(),
        })
    }

    /// Serve TLS with an already built rustls configuration.
    pub fn with_tls_config(mut self, tls: Arc<ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle for stopping the server from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until shutdown, then drain open connections.
    pub fn run(self) -> Result<(), ServerError> {
        info!(
            address = %self.config.listen,
            mode = ?self.config.worker_mode,
            workers = self.config.workers,
            tls = self.tls.is_some(),
            "Server listening"
        );
        let result = match self.config.worker_mode {
            WorkerMode::Threads | WorkerMode::EventLoop => {
                let listener = self.listener.try_clone().map_err(ServerError::Runtime)?;
                self.run_local(self.config.worker_mode, listener, self.config.workers)
            }
            WorkerMode::Processes => process::run_forked(
                self.config.workers,
                self.config.shutdown_timeout,
                |worker| self.run_child(worker),
            )
            .map_err(ServerError::Runtime),
        };
        crate::logging::flush();
        result
    }

    fn run_child(&self, worker: usize) -> i32 {
        let served = self
            .listener
            .try_clone()
            .map_err(ServerError::Runtime)
            .and_then(|listener| {
                self.run_local(WorkerMode::EventLoop, listener, CHILD_TASK_WORKERS)
            });
        match served {
            Ok(()) => 0,
            Err(e) => {
                error!(worker, error = %e, "Worker process failed");
                1
            }
        }
    }

    /// Run one accept loop in this process.
    fn run_local(
        &self,
        mode: WorkerMode,
        listener: std::net::TcpListener,
        task_workers: usize,
    ) -> Result<(), ServerError> {
        let config = &self.config;
        let runtime = build_event_loop(config.event_loop_threads).map_err(ServerError::Runtime)?;
        let task_pool = Arc::new(
            WorkerPool::new("task", task_workers, config.queue_depth)
                .map_err(ServerError::Runtime)?,
        );
        let ctx = ServeContext {
            config: Arc::new(config.clone()),
            service: Arc::clone(&self.service),
            executor: TaskExecutor::new(Arc::clone(&task_pool), runtime.handle().clone()),
        };
        let engine = Engine::new(ctx, self.tls.clone(), self.shutdown.clone());
        let conn_pool = match mode {
            WorkerMode::Threads => Some(Arc::new(
                WorkerPool::new("conn", config.workers, config.queue_depth)
                    .map_err(ServerError::Runtime)?,
            )),
            _ => None,
        };

        let served: Result<(), ServerError> = runtime.block_on(async {
            tokio::spawn(watch_os_signals(self.shutdown.clone()));
            let listener =
                tokio::net::TcpListener::from_std(listener).map_err(ServerError::Runtime)?;
            let signal = self.shutdown.signal();
            match &conn_pool {
                Some(pool) => {
                    accept_to_pool(listener, Arc::clone(&engine), Arc::clone(pool), signal).await
                }
                None => accept_to_tasks(listener, Arc::clone(&engine), signal).await,
            }

            // the accept loop only returns once shutdown has begun
            self.shutdown.shutdown();
            let open = engine.connections().drain(config.shutdown_timeout).await;
            if open > 0 {
                warn!(open, "Connections still open at shutdown deadline");
            } else {
                info!("All connections closed");
            }
            Ok(())
        });

        if let Some(pool) = conn_pool {
            pool.shutdown(config.shutdown_timeout);
        }
        task_pool.shutdown(config.shutdown_timeout);
        runtime.shutdown_timeout(config.shutdown_timeout);
        served
    }
}
