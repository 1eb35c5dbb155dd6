//! HTTP/1.1 on a worker thread.
//!
//! The worker owns the socket for the life of the connection and runs
//! blocking handlers inline. Async handlers and async response bodies are
//! driven on the event loop while the worker waits.

use super::conn::{Http1Conn, Progress};
use super::response::{self, Framing};
use super::{
    prepare_response, route, task_error_response, Exchange, Handoff, Http1Error, LengthCheck,
    Route, CONTINUE, READ_CHUNK,
};
use crate::error::ConnectionError;
use crate::protocols::{Protocol, ServeContext};
use crate::runtime::{ConnectionGuard, ShutdownSignal};
use crate::service::{Body, ConnectionInfo};
use crate::transport::BlockingSocket;
use bytes::BytesMut;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Longest single wait while idle, so shutdown is noticed promptly.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Serve requests until the connection closes or changes protocol.
pub fn serve(
    mut socket: BlockingSocket,
    h2c: bool,
    ctx: &ServeContext,
    guard: &ConnectionGuard,
    shutdown: &ShutdownSignal,
) -> Result<Handoff<BlockingSocket>, ConnectionError> {
    let limits = &ctx.config.http;
    let info = ConnectionInfo {
        peer_addr: socket.peer_addr(),
        transport: socket.transport(),
        protocol: Protocol::Http1,
    };
    let mut conn = Http1Conn::new(limits.clone(), info, h2c, &[]);
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut idle_deadline: Option<Instant> = None;

    loop {
        let progress = match conn.advance() {
            Ok(progress) => progress,
            Err(e) => {
                reject(&mut socket, e, limits.write_timeout);
                return Err(e.into());
            }
        };

        match progress {
            Progress::NeedMore => {
                let idle = conn.is_idle();
                let timeout = if idle {
                    if shutdown.is_shutdown() {
                        socket.close();
                        return Ok(Handoff::Closed);
                    }
                    let wait = if conn.served() == 0 {
                        limits.read_timeout
                    } else {
                        limits.keepalive_timeout
                    };
                    let deadline = *idle_deadline.get_or_insert_with(|| Instant::now() + wait);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(peer = %info.peer_addr, served = conn.served(), "Keep-alive timeout");
                        socket.close();
                        return Ok(Handoff::Closed);
                    }
                    remaining.min(IDLE_POLL)
                } else {
                    limits.read_timeout
                };

                match socket.read(&mut scratch, timeout) {
                    Ok(0) => {
                        trace!(peer = %info.peer_addr, "Peer closed connection");
                        return Ok(Handoff::Closed);
                    }
                    Ok(n) => {
                        conn.buffer_mut().extend_from_slice(&scratch[..n]);
                        idle_deadline = None;
                        guard.touch();
                    }
                    Err(e) if e.is_timeout() && idle => {}
                    Err(e) if e.is_timeout() => {
                        reject(&mut socket, Http1Error::Timeout, limits.write_timeout);
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Progress::SendContinue => socket.write_all(CONTINUE, limits.write_timeout)?,
            Progress::Http2Preface => {
                return Ok(Handoff::Http2 {
                    io: socket,
                    buffered: conn.take_buffer().freeze(),
                    upgrade: None,
                });
            }
            Progress::Request(parsed) => {
                guard.record_request();
                match route(*parsed, ctx) {
                    Route::Serve {
                        request,
                        keep_alive,
                    } => {
                        let exchange = Exchange::new(&request, keep_alive);
                        trace!(method = %exchange.method, uri = %request.uri(), "Dispatching request");
                        let response = ctx
                            .executor
                            .run_on_worker(ctx.service.call(request))
                            .unwrap_or_else(|e| task_error_response(&e));

                        conn.start_response();
                        let outgoing = prepare_response(
                            &conn,
                            response,
                            &exchange,
                            guard.server_under_pressure(),
                            shutdown.is_shutdown(),
                            limits.keepalive_timeout,
                        );
                        socket.write_all(&outgoing.head, limits.write_timeout)?;
                        write_body(
                            &mut socket,
                            outgoing.framing,
                            outgoing.body,
                            ctx,
                            limits.write_timeout,
                        )?;
                        if !conn.finish_response(outgoing.keep_alive) {
                            socket.close();
                            return Ok(Handoff::Closed);
                        }
                    }
                    Route::H2c { head, upgrade } => {
                        socket.write_all(&head, limits.write_timeout)?;
                        return Ok(Handoff::Http2 {
                            io: socket,
                            buffered: conn.take_buffer().freeze(),
                            upgrade: Some(upgrade),
                        });
                    }
                    Route::WebSocket {
                        head,
                        view,
                        deflate,
                    } => {
                        socket.write_all(&head, limits.write_timeout)?;
                        return Ok(Handoff::WebSocket {
                            io: socket,
                            buffered: conn.take_buffer().freeze(),
                            view,
                            deflate,
                        });
                    }
                    Route::Reject { head } => {
                        socket.write_all(&head, limits.write_timeout)?;
                        socket.close();
                        return Ok(Handoff::Closed);
                    }
                }
            }
        }
    }
}

/// Answer a request that could not be read, then close.
fn reject(socket: &mut BlockingSocket, error: Http1Error, timeout: Duration) {
    debug!(peer = %socket.peer_addr(), error = %error, "Rejecting request");
    let mut head = BytesMut::new();
    response::encode_error(error.status(), &mut head);
    let _ = socket.write_all(&head, timeout);
    socket.close();
}

fn write_body(
    socket: &mut BlockingSocket,
    framing: Framing,
    body: Body,
    ctx: &ServeContext,
    timeout: Duration,
) -> Result<(), ConnectionError> {
    if framing == Framing::None {
        return Ok(());
    }
    let mut check = LengthCheck::new(framing);
    let mut out = BytesMut::with_capacity(READ_CHUNK + 16);
    for chunk in body.into_blocking_chunks(ctx.executor.runtime()) {
        let chunk = chunk.map_err(ConnectionError::Body)?;
        out.clear();
        response::encode_chunk(framing, check.admit(&chunk), &mut out);
        if !out.is_empty() {
            socket.write_all(&out, timeout)?;
        }
    }
    check.finish()?;
    out.clear();
    response::encode_end(framing, &mut out);
    if !out.is_empty() {
        socket.write_all(&out, timeout)?;
    }
    Ok(())
}
