//! HTTP/1.1 on the event loop.
//!
//! Same exchange rules as the blocking driver. Handlers are submitted to
//! the executor and awaited, and idle waits race the shutdown signal.

use super::conn::{Http1Conn, Progress};
use super::response::{self, Framing};
use super::{
    prepare_response, route, task_error_response, Exchange, Handoff, Http1Error, LengthCheck,
    Route, CONTINUE, READ_CHUNK,
};
use crate::error::ConnectionError;
use crate::protocols::ServeContext;
use crate::runtime::{ConnectionGuard, ShutdownSignal};
use crate::service::{Body, ConnectionInfo};
use crate::transport::{TransportError, TransportResult};
use bytes::BytesMut;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Serve requests until the connection closes or changes protocol.
///
/// `buffered` holds bytes already read from `io`.
pub async fn serve<S>(
    mut io: S,
    buffered: &[u8],
    info: ConnectionInfo,
    h2c: bool,
    ctx: &ServeContext,
    guard: &ConnectionGuard,
    mut shutdown: ShutdownSignal,
) -> Result<Handoff<S>, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let limits = &ctx.config.http;
    let mut conn = Http1Conn::new(limits.clone(), info, h2c, buffered);
    let mut scratch = vec![0u8; READ_CHUNK];

    loop {
        let progress = match conn.advance() {
            Ok(progress) => progress,
            Err(e) => {
                reject(&mut io, &info, e, limits.write_timeout).await;
                return Err(e.into());
            }
        };

        match progress {
            Progress::NeedMore => {
                let read = if conn.is_idle() {
                    let wait = if conn.served() == 0 {
                        limits.read_timeout
                    } else {
                        limits.keepalive_timeout
                    };
                    let deadline = Instant::now() + wait;
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => {
                            trace!(peer = %info.peer_addr, "Closing idle connection for shutdown");
                            close(&mut io).await;
                            return Ok(Handoff::Closed);
                        }
                        read = tokio::time::timeout_at(deadline, io.read(&mut scratch)) => match read {
                            Ok(read) => read.map_err(TransportError::from),
                            Err(_) => {
                                debug!(peer = %info.peer_addr, served = conn.served(), "Keep-alive timeout");
                                close(&mut io).await;
                                return Ok(Handoff::Closed);
                            }
                        },
                    }
                } else {
                    read_some(&mut io, &mut scratch, limits.read_timeout).await
                };

                match read {
                    Ok(0) => {
                        trace!(peer = %info.peer_addr, "Peer closed connection");
                        return Ok(Handoff::Closed);
                    }
                    Ok(n) => {
                        conn.buffer_mut().extend_from_slice(&scratch[..n]);
                        guard.touch();
                    }
                    Err(e) if e.is_timeout() => {
                        reject(&mut io, &info, Http1Error::Timeout, limits.write_timeout).await;
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Progress::SendContinue => write_all(&mut io, CONTINUE, limits.write_timeout).await?,
            Progress::Http2Preface => {
                return Ok(Handoff::Http2 {
                    io,
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
                            .submit(ctx.service.call(request))
                            .await
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
                        write_all(&mut io, &outgoing.head, limits.write_timeout).await?;
                        write_body(&mut io, outgoing.framing, outgoing.body, limits.write_timeout)
                            .await?;
                        if !conn.finish_response(outgoing.keep_alive) {
                            close(&mut io).await;
                            return Ok(Handoff::Closed);
                        }
                    }
                    Route::H2c { head, upgrade } => {
                        write_all(&mut io, &head, limits.write_timeout).await?;
                        return Ok(Handoff::Http2 {
                            io,
                            buffered: conn.take_buffer().freeze(),
                            upgrade: Some(upgrade),
                        });
                    }
                    Route::WebSocket {
                        head,
                        view,
                        deflate,
                    } => {
                        write_all(&mut io, &head, limits.write_timeout).await?;
                        return Ok(Handoff::WebSocket {
                            io,
                            buffered: conn.take_buffer().freeze(),
                            view,
                            deflate,
                        });
                    }
                    Route::Reject { head } => {
                        write_all(&mut io, &head, limits.write_timeout).await?;
                        close(&mut io).await;
                        return Ok(Handoff::Closed);
                    }
                }
            }
        }
    }
}

async fn read_some<S>(io: &mut S, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, io.read(buf)).await {
        Ok(read) => read.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn write_all<S>(io: &mut S, buf: &[u8], timeout: Duration) -> TransportResult<()>
where
    S: AsyncWrite + Unpin,
{
    match tokio::time::timeout(timeout, io.write_all(buf)).await {
        Ok(written) => written.map_err(TransportError::from),
        Err(_) => Err(TransportError::Timeout),
    }
}

async fn close<S: AsyncWrite + Unpin>(io: &mut S) {
    let _ = tokio::time::timeout(Duration::from_millis(100), io.shutdown()).await;
}

/// Answer a request that could not be read, then close.
async fn reject<S>(io: &mut S, info: &ConnectionInfo, error: Http1Error, timeout: Duration)
where
    S: AsyncWrite + Unpin,
{
    debug!(peer = %info.peer_addr, error = %error, "Rejecting request");
    let mut head = BytesMut::new();
    response::encode_error(error.status(), &mut head);
    let _ = write_all(io, &head, timeout).await;
    close(io).await;
}

async fn write_body<S>(
    io: &mut S,
    framing: Framing,
    body: Body,
    timeout: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncWrite + Unpin,
{
    if framing == Framing::None {
        return Ok(());
    }
    let mut check = LengthCheck::new(framing);
    let mut out = BytesMut::with_capacity(READ_CHUNK + 16);
    let mut chunks = body.into_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(ConnectionError::Body)?;
        out.clear();
        response::encode_chunk(framing, check.admit(&chunk), &mut out);
        if !out.is_empty() {
            write_all(io, &out, timeout).await?;
        }
    }
    check.finish()?;
    out.clear();
    response::encode_end(framing, &mut out);
    if !out.is_empty() {
        write_all(io, &out, timeout).await?;
    }
    io.flush().await.map_err(TransportError::from)?;
    Ok(())
}
