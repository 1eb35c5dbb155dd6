//! The HTTP/2 connection loop.
//!
//! One task owns the socket, the HPACK contexts and every stream. Handlers
//! run on the [`TaskExecutor`](crate::runtime::TaskExecutor); their
//! responses and streamed body chunks come back over a bounded event
//! channel. Outbound DATA is written round-robin, one frame per ready stream
//! per pass, within the connection and stream send windows.

use super::flow::{RecvWindow, SendWindow};
use super::frame::{self, Frame, Settings, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE};
use super::hpack::{self, HeaderDecoder, HeaderEncoder, HeaderError};
use super::stream::StreamState;
use super::{ErrorCode, H2Error, H2Result};
use crate::protocols::dispatch::H2_PREFACE;
use crate::protocols::ServeContext;
use crate::runtime::{ConnectionGuard, ShutdownSignal, TaskError, TaskResult};
use crate::service::{Body, ConnectionInfo, Request, Response};
use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use http::request::Parts;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

const EVENT_QUEUE: usize = 64;
/// Response bytes a body producer may run ahead of the socket.
const STREAM_BUFFER: usize = 64 * 1024;
/// Recently reset streams whose late frames are dropped silently.
const RECENTLY_RESET: usize = 64;
/// Stop queueing DATA once this much is waiting to be written.
const WRITE_HIGH_WATER: usize = 256 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// A request that arrived as HTTP/1.1 with `Upgrade: h2c`. It becomes
/// stream 1 of the new session.
pub struct H2cUpgrade {
    pub request: Request,
    /// Decoded `HTTP2-Settings` payload.
    pub settings: Bytes,
}

/// Serve one HTTP/2 connection until it closes.
///
/// `buffered` holds bytes already read from `io` (the sniffed preface).
/// Connection errors are answered with GOAWAY before returning them.
pub async fn serve<S>(
    io: S,
    buffered: Bytes,
    upgrade: Option<H2cUpgrade>,
    ctx: &ServeContext,
    info: ConnectionInfo,
    guard: Option<&ConnectionGuard>,
    mut shutdown: ShutdownSignal,
) -> H2Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut session = Session::new(io, buffered, ctx, info, guard);
    let result = session.run(upgrade, &mut shutdown).await;
    if let Err(H2Error::Protocol { code, reason }) = &result {
        debug!(peer = %info.peer_addr, %code, reason, "HTTP/2 connection error");
        frame::encode_goaway(
            session.last_stream_id,
            *code,
            reason.as_bytes(),
            &mut session.write_buf,
        );
        let _ = session.write_out().await;
    }
    session.close().await;
    result
}

enum Event {
    Response {
        stream_id: u32,
        result: TaskResult<Response>,
    },
    Data {
        stream_id: u32,
        chunk: Bytes,
    },
    End {
        stream_id: u32,
    },
    BodyError {
        stream_id: u32,
    },
}

struct Stream {
    state: StreamState,
    send: SendWindow,
    recv: RecvWindow,
    head: Option<Parts>,
    body: BytesMut,
    head_request: bool,
    /// Response DATA not yet written.
    pending: VecDeque<Bytes>,
    /// END_STREAM follows once `pending` drains.
    end_pending: bool,
    /// Present in the ready queue.
    queued: bool,
    /// Producer credit, returned as bytes reach the socket.
    credit: Option<Arc<Semaphore>>,
    owed: usize,
    tasks: Vec<AbortHandle>,
}

impl Stream {
    fn new(state: StreamState, send_window: u32, recv_window: u32) -> Self {
        Self {
            state,
            send: SendWindow::new(send_window),
            recv: RecvWindow::new(recv_window),
            head: None,
            body: BytesMut::new(),
            head_request: false,
            pending: VecDeque::new(),
            end_pending: false,
            queued: false,
            credit: None,
            owed: 0,
            tasks: Vec::new(),
        }
    }

    fn has_output(&self) -> bool {
        !self.pending.is_empty() || self.end_pending
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// A header block spread over HEADERS and CONTINUATION frames.
struct PendingBlock {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

struct Session<'a, S> {
    io: S,
    ctx: &'a ServeContext,
    info: ConnectionInfo,
    guard: Option<&'a ConnectionGuard>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    decoder: HeaderDecoder,
    encoder: HeaderEncoder,
    settings_received: bool,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    conn_send: SendWindow,
    conn_recv: RecvWindow,
    streams: HashMap<u32, Stream>,
    ready: VecDeque<u32>,
    recently_reset: VecDeque<u32>,
    last_stream_id: u32,
    continuation: Option<PendingBlock>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    goaway_sent: bool,
    goaway_received: bool,
}

impl<'a, S> Session<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(
        io: S,
        buffered: Bytes,
        ctx: &'a ServeContext,
        info: ConnectionInfo,
        guard: Option<&'a ConnectionGuard>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK.max(buffered.len()));
        read_buf.extend_from_slice(&buffered);
        Self {
            io,
            ctx,
            info,
            guard,
            read_buf,
            write_buf: BytesMut::with_capacity(READ_CHUNK),
            decoder: HeaderDecoder::new(),
            encoder: HeaderEncoder::new(),
            settings_received: false,
            peer_initial_window: DEFAULT_WINDOW_SIZE,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            conn_send: SendWindow::new(DEFAULT_WINDOW_SIZE),
            conn_recv: RecvWindow::new(DEFAULT_WINDOW_SIZE),
            streams: HashMap::new(),
            ready: VecDeque::new(),
            recently_reset: VecDeque::with_capacity(RECENTLY_RESET),
            last_stream_id: 0,
            continuation: None,
            events_tx,
            events_rx,
            goaway_sent: false,
            goaway_received: false,
        }
    }

    async fn run(
        &mut self,
        upgrade: Option<H2cUpgrade>,
        shutdown: &mut ShutdownSignal,
    ) -> H2Result<()> {
        self.send_preface();
        self.write_out().await?;
        if let Some(upgrade) = upgrade {
            self.accept_upgrade(upgrade)?;
        }
        self.read_preface().await?;

        let idle_timeout = self.ctx.config.http.keepalive_timeout;
        loop {
            while let Some(frame) =
                frame::decode(&mut self.read_buf, self.ctx.config.http2.max_frame_size)?
            {
                trace!(?frame, "HTTP/2 frame");
                self.on_frame(frame)?;
            }
            while self.flush_data() {
                self.write_out().await?;
            }
            self.write_out().await?;

            if (self.goaway_sent || self.goaway_received) && self.streams.is_empty() {
                return Ok(());
            }

            let idle = self.streams.is_empty();
            self.read_buf.reserve(READ_CHUNK);
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.on_event(event),
                read = self.io.read_buf(&mut self.read_buf) => {
                    if read? == 0 {
                        debug!(peer = %self.info.peer_addr, "Peer closed HTTP/2 connection");
                        return Ok(());
                    }
                    if let Some(guard) = self.guard {
                        guard.touch();
                    }
                }
                _ = shutdown.wait(), if !self.goaway_sent => {
                    self.send_goaway(ErrorCode::NO_ERROR, "server shutting down");
                }
                _ = tokio::time::sleep(idle_timeout), if idle => {
                    debug!(peer = %self.info.peer_addr, "HTTP/2 connection idle");
                    self.send_goaway(ErrorCode::NO_ERROR, "idle timeout");
                    self.write_out().await?;
                    return Ok(());
                }
            }
        }
    }

    fn send_preface(&mut self) {
        let limits = &self.ctx.config.http2;
        let settings = Settings {
            enable_push: Some(false),
            max_concurrent_streams: Some(limits.max_concurrent_streams),
            initial_window_size: Some(limits.initial_window_size),
            max_frame_size: Some(limits.max_frame_size),
            max_header_list_size: Some(self.ctx.config.http.max_header_bytes as u32),
            ..Settings::default()
        };
        frame::encode_settings(&settings, &mut self.write_buf);
        if let Some(increment) = self.conn_recv.grow_to(limits.initial_window_size) {
            frame::encode_window_update(0, increment, &mut self.write_buf);
        }
    }

    async fn read_preface(&mut self) -> H2Result<()> {
        let timeout = self.ctx.config.http.read_timeout;
        while self.read_buf.len() < H2_PREFACE.len() {
            if !H2_PREFACE.starts_with(&self.read_buf) {
                return Err(H2Error::protocol("invalid connection preface"));
            }
            self.read_buf.reserve(READ_CHUNK);
            let read = tokio::time::timeout(timeout, self.io.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| timed_out("waiting for the connection preface"))??;
            if read == 0 {
                return Err(H2Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        }
        if !self.read_buf.starts_with(H2_PREFACE) {
            return Err(H2Error::protocol("invalid connection preface"));
        }
        self.read_buf.advance(H2_PREFACE.len());
        Ok(())
    }

    /// Stream 1 carries the upgraded request, already half closed.
    fn accept_upgrade(&mut self, upgrade: H2cUpgrade) -> H2Result<()> {
        let settings = Settings::decode(&upgrade.settings)?;
        self.apply_peer_settings(settings)?;

        let (mut head, body) = upgrade.request.into_parts();
        head.version = Version::HTTP_2;
        head.headers.remove(header::CONNECTION);
        head.headers.remove(header::UPGRADE);
        head.headers.remove("http2-settings");

        let mut stream = Stream::new(
            StreamState::HalfClosedRemote,
            self.peer_initial_window,
            self.ctx.config.http2.initial_window_size,
        );
        stream.head = Some(head);
        stream.body = BytesMut::from(&body[..]);
        self.streams.insert(1, stream);
        self.last_stream_id = 1;
        self.dispatch(1);
        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> H2Result<()> {
        if !self.settings_received && !matches!(frame, Frame::Settings { ack: false, .. }) {
            return Err(H2Error::protocol("first frame must be SETTINGS"));
        }
        if let Some(pending) = &self.continuation {
            let continues = matches!(
                frame,
                Frame::Continuation { stream_id, .. } if stream_id == pending.stream_id
            );
            if !continues {
                return Err(H2Error::protocol("header block interrupted"));
            }
        }

        match frame {
            Frame::Settings { ack: true, .. } => Ok(()),
            Frame::Settings {
                ack: false,
                settings,
            } => {
                self.apply_peer_settings(settings)?;
                self.settings_received = true;
                frame::encode_settings_ack(&mut self.write_buf);
                Ok(())
            }
            Frame::Ping { ack, payload } => {
                if !ack {
                    frame::encode_ping(true, payload, &mut self.write_buf);
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id,
                code,
                ..
            } => {
                debug!(peer = %self.info.peer_addr, last_stream_id, %code, "Peer sent GOAWAY");
                self.goaway_received = true;
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                if increment == 0 {
                    return Err(H2Error::protocol("zero WINDOW_UPDATE increment"));
                }
                self.conn_send.increase(increment).map_err(|_| {
                    H2Error::with_code(ErrorCode::FLOW_CONTROL_ERROR, "connection window overflow")
                })?;
                self.schedule_all();
                Ok(())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => self.on_stream_window_update(stream_id, increment),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                dependency,
            } => {
                if stream_id % 2 == 0 {
                    return Err(H2Error::protocol("client used an even stream id"));
                }
                if dependency == Some(stream_id) {
                    return Err(H2Error::protocol("stream depends on itself"));
                }
                if end_headers {
                    return self.on_header_block(stream_id, &block, end_stream);
                }
                self.continuation = Some(PendingBlock {
                    stream_id,
                    end_stream,
                    block: BytesMut::from(&block[..]),
                });
                self.check_pending_block()
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(pending) = self.continuation.as_mut() else {
                    return Err(H2Error::protocol("CONTINUATION without HEADERS"));
                };
                pending.block.extend_from_slice(&block);
                self.check_pending_block()?;
                if !end_headers {
                    return Ok(());
                }
                match self.continuation.take() {
                    Some(pending) => {
                        self.on_header_block(pending.stream_id, &pending.block, pending.end_stream)
                    }
                    None => Ok(()),
                }
            }
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, data, end_stream, flow_len),
            Frame::RstStream { stream_id, code } => {
                if self.is_idle(stream_id) {
                    return Err(H2Error::protocol("RST_STREAM on idle stream"));
                }
                if self.streams.remove(&stream_id).is_some() {
                    debug!(stream_id, %code, "Stream reset by peer");
                    self.remember_reset(stream_id);
                }
                Ok(())
            }
            Frame::Priority {
                stream_id,
                dependency,
            } => {
                if stream_id == dependency {
                    return Err(H2Error::protocol("stream depends on itself"));
                }
                Ok(())
            }
            Frame::PushPromise { .. } => Err(H2Error::protocol("client sent PUSH_PROMISE")),
            Frame::Unknown { .. } => Ok(()),
        }
    }

    /// Header blocks are bounded while they are being assembled.
    fn check_pending_block(&self) -> H2Result<()> {
        match &self.continuation {
            Some(pending) if pending.block.len() > self.ctx.config.http.max_header_bytes * 2 => {
                Err(H2Error::with_code(
                    ErrorCode::ENHANCE_YOUR_CALM,
                    "header block too large",
                ))
            }
            _ => Ok(()),
        }
    }

    fn apply_peer_settings(&mut self, settings: Settings) -> H2Result<()> {
        if let Some(size) = settings.header_table_size {
            self.encoder.set_peer_table_size(size);
        }
        if let Some(size) = settings.max_frame_size {
            self.peer_max_frame_size = size;
        }
        if let Some(initial) = settings.initial_window_size {
            let delta = initial as i64 - self.peer_initial_window as i64;
            self.peer_initial_window = initial;
            for stream in self.streams.values_mut() {
                stream.send.adjust(delta).map_err(|_| {
                    H2Error::with_code(ErrorCode::FLOW_CONTROL_ERROR, "stream window overflow")
                })?;
            }
            if delta > 0 {
                self.schedule_all();
            }
        }
        Ok(())
    }

    fn on_stream_window_update(&mut self, stream_id: u32, increment: u32) -> H2Result<()> {
        if self.is_idle(stream_id) {
            return Err(H2Error::protocol("WINDOW_UPDATE on idle stream"));
        }
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if increment == 0 {
            self.reset_stream(stream_id, ErrorCode::PROTOCOL_ERROR);
        } else if stream.send.increase(increment).is_err() {
            self.reset_stream(stream_id, ErrorCode::FLOW_CONTROL_ERROR);
        } else {
            self.schedule(stream_id);
        }
        Ok(())
    }

    fn on_header_block(&mut self, stream_id: u32, block: &[u8], end_stream: bool) -> H2Result<()> {
        // decode even when the stream is refused, to keep the table in sync
        let fields = self.decoder.decode(block)?;

        if self.streams.contains_key(&stream_id) {
            return self.on_trailers(stream_id, &fields, end_stream);
        }
        if stream_id <= self.last_stream_id {
            if self.recently_reset.contains(&stream_id) {
                return Ok(());
            }
            return Err(H2Error::with_code(
                ErrorCode::STREAM_CLOSED,
                "HEADERS on a closed stream",
            ));
        }
        self.last_stream_id = stream_id;
        if self.goaway_sent {
            return Ok(());
        }
        if self.streams.len() >= self.ctx.config.http2.max_concurrent_streams as usize {
            debug!(stream_id, "Refusing stream over the concurrency limit");
            self.reset_stream(stream_id, ErrorCode::REFUSED_STREAM);
            return Ok(());
        }

        let state = if end_stream {
            StreamState::HalfClosedRemote
        } else {
            StreamState::Open
        };
        let mut stream = Stream::new(
            state,
            self.peer_initial_window,
            self.ctx.config.http2.initial_window_size,
        );
        match hpack::request_head(fields, self.ctx.config.http.max_header_bytes) {
            Ok(head) => {
                stream.head = Some(head);
                self.streams.insert(stream_id, stream);
                if end_stream {
                    self.dispatch(stream_id);
                }
            }
            Err(HeaderError::Malformed(reason)) => {
                debug!(stream_id, reason, "Malformed request headers");
                self.reset_stream(stream_id, ErrorCode::PROTOCOL_ERROR);
            }
            Err(HeaderError::TooLarge) => {
                self.streams.insert(stream_id, stream);
                self.respond_status(stream_id, StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
            }
        }
        Ok(())
    }

    fn on_trailers(
        &mut self,
        stream_id: u32,
        fields: &hpack::Fields,
        end_stream: bool,
    ) -> H2Result<()> {
        let can_recv = self
            .streams
            .get(&stream_id)
            .is_some_and(|stream| stream.state.can_recv());
        if !can_recv {
            return Err(H2Error::with_code(
                ErrorCode::STREAM_CLOSED,
                "HEADERS after END_STREAM",
            ));
        }
        if !end_stream {
            return Err(H2Error::protocol("trailers without END_STREAM"));
        }
        if let Err(HeaderError::Malformed(reason)) = hpack::check_trailers(fields) {
            debug!(stream_id, reason, "Malformed trailers");
            self.reset_stream(stream_id, ErrorCode::PROTOCOL_ERROR);
            return Ok(());
        }
        self.finish_request(stream_id);
        Ok(())
    }

    fn on_data(
        &mut self,
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        flow_len: u32,
    ) -> H2Result<()> {
        self.conn_recv.receive(flow_len).map_err(|_| {
            H2Error::with_code(ErrorCode::FLOW_CONTROL_ERROR, "connection window overrun")
        })?;
        // request bodies are buffered whole, so connection credit comes back at once
        if let Some(increment) = self.conn_recv.release(flow_len) {
            frame::encode_window_update(0, increment, &mut self.write_buf);
        }

        if !self.streams.contains_key(&stream_id) {
            if self.is_idle(stream_id) {
                return Err(H2Error::protocol("DATA on idle stream"));
            }
            if self.recently_reset.contains(&stream_id) {
                return Ok(());
            }
            return Err(H2Error::with_code(
                ErrorCode::STREAM_CLOSED,
                "DATA on a closed stream",
            ));
        }
        let max_request_bytes = self.ctx.config.http.max_request_bytes;
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        if !stream.state.can_recv() {
            return Err(H2Error::with_code(
                ErrorCode::STREAM_CLOSED,
                "DATA after END_STREAM",
            ));
        }
        if stream.recv.receive(flow_len).is_err() {
            self.reset_stream(stream_id, ErrorCode::FLOW_CONTROL_ERROR);
            return Ok(());
        }
        if stream.body.len() + data.len() > max_request_bytes {
            debug!(stream_id, "Request body over the limit");
            self.respond_status(stream_id, StatusCode::PAYLOAD_TOO_LARGE);
            return Ok(());
        }
        stream.body.extend_from_slice(&data);
        if end_stream {
            self.finish_request(stream_id);
        } else if let Some(increment) = stream.recv.release(flow_len) {
            frame::encode_window_update(stream_id, increment, &mut self.write_buf);
        }
        Ok(())
    }

    /// The peer finished sending a request.
    fn finish_request(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match stream.state.recv_end_stream() {
            Some(StreamState::Closed) => {
                self.streams.remove(&stream_id);
            }
            Some(next) => {
                stream.state = next;
                self.dispatch(stream_id);
            }
            None => {}
        }
    }

    fn dispatch(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let Some(head) = stream.head.take() else {
            return;
        };
        let body = std::mem::take(&mut stream.body).freeze();
        let mut request = Request::from_parts(head, body);
        request.extensions_mut().insert(self.info);
        stream.head_request = request.method() == Method::HEAD;
        if let Some(guard) = self.guard {
            guard.record_request();
        }

        let handle = self.ctx.executor.submit(self.ctx.service.call(request));
        let events = self.events_tx.clone();
        let waiter = self.ctx.executor.runtime().spawn(async move {
            let result = handle.await;
            let _ = events.send(Event::Response { stream_id, result }).await;
        });
        stream.tasks.push(waiter.abort_handle());
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Response { stream_id, result } => match result {
                Ok(response) => self.start_response(stream_id, response),
                Err(e) => {
                    warn!(stream_id, error = %e, "Request handler failed");
                    let status = match e {
                        TaskError::Rejected => StatusCode::SERVICE_UNAVAILABLE,
                        _ => StatusCode::INTERNAL_SERVER_ERROR,
                    };
                    self.respond_status(stream_id, status);
                }
            },
            Event::Data { stream_id, chunk } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.owed += chunk.len().min(STREAM_BUFFER);
                    stream.pending.push_back(chunk);
                    self.schedule(stream_id);
                }
            }
            Event::End { stream_id } => {
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.end_pending = true;
                    self.schedule(stream_id);
                }
            }
            Event::BodyError { stream_id } => {
                self.reset_stream(stream_id, ErrorCode::INTERNAL_ERROR);
            }
        }
    }

    fn start_response(&mut self, stream_id: u32, response: Response) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        if !stream.state.can_send() {
            return;
        }
        let (parts, body) = response.into_parts();
        let bodiless = parts.status == StatusCode::NO_CONTENT
            || parts.status == StatusCode::NOT_MODIFIED
            || parts.status.is_informational();
        let mut headers = parts.headers;
        if let Some(len) = body.len() {
            if !bodiless && !headers.contains_key(header::CONTENT_LENGTH) {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }
        let end_now = bodiless || stream.head_request || body.is_empty();

        let block = self.encoder.encode_response(parts.status, &headers);
        frame::encode_headers(
            stream_id,
            &block,
            end_now,
            self.peer_max_frame_size,
            &mut self.write_buf,
        );
        if end_now {
            self.sent_end_stream(stream_id);
            return;
        }

        match body {
            Body::Full(bytes) => {
                stream.pending.push_back(bytes);
                stream.end_pending = true;
                self.schedule(stream_id);
            }
            body => {
                let credit = Arc::new(Semaphore::new(STREAM_BUFFER));
                stream.credit = Some(Arc::clone(&credit));
                let events = self.events_tx.clone();
                let producer = self
                    .ctx
                    .executor
                    .runtime()
                    .spawn(produce_body(stream_id, body, credit, events));
                stream.tasks.push(producer.abort_handle());
            }
        }
    }

    /// Answer a stream with a bare status and no body.
    fn respond_status(&mut self, stream_id: u32, status: StatusCode) {
        let can_send = self
            .streams
            .get(&stream_id)
            .is_some_and(|stream| stream.state.can_send());
        if !can_send {
            return;
        }
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(0u32));
        let block = self.encoder.encode_response(status, &headers);
        frame::encode_headers(
            stream_id,
            &block,
            true,
            self.peer_max_frame_size,
            &mut self.write_buf,
        );
        self.sent_end_stream(stream_id);
    }

    /// We set END_STREAM. A peer still sending is told to stop.
    fn sent_end_stream(&mut self, stream_id: u32) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match stream.state.send_end_stream() {
            Some(StreamState::Closed) => {
                self.streams.remove(&stream_id);
            }
            Some(_) => self.reset_stream(stream_id, ErrorCode::NO_ERROR),
            None => {}
        }
    }

    fn reset_stream(&mut self, stream_id: u32, code: ErrorCode) {
        frame::encode_rst_stream(stream_id, code, &mut self.write_buf);
        self.streams.remove(&stream_id);
        self.remember_reset(stream_id);
    }

    fn remember_reset(&mut self, stream_id: u32) {
        if self.recently_reset.len() == RECENTLY_RESET {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(stream_id);
    }

    fn send_goaway(&mut self, code: ErrorCode, reason: &str) {
        frame::encode_goaway(
            self.last_stream_id,
            code,
            reason.as_bytes(),
            &mut self.write_buf,
        );
        self.goaway_sent = true;
    }

    fn is_idle(&self, stream_id: u32) -> bool {
        !self.streams.contains_key(&stream_id)
            && (stream_id > self.last_stream_id || stream_id % 2 == 0)
    }

    fn schedule(&mut self, stream_id: u32) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if !stream.queued && stream.has_output() {
                stream.queued = true;
                self.ready.push_back(stream_id);
            }
        }
    }

    fn schedule_all(&mut self) {
        for (id, stream) in self.streams.iter_mut() {
            if !stream.queued && stream.has_output() {
                stream.queued = true;
                self.ready.push_back(*id);
            }
        }
    }

    /// Queue one DATA frame per ready stream, round-robin. Returns true when
    /// it stopped at the write high-water mark with output still ready.
    fn flush_data(&mut self) -> bool {
        while let Some(stream_id) = self.ready.pop_front() {
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            stream.queued = false;

            let Some(front) = stream.pending.front_mut() else {
                if stream.end_pending {
                    stream.end_pending = false;
                    frame::encode_data(stream_id, &[], true, &mut self.write_buf);
                    self.sent_end_stream(stream_id);
                }
                continue;
            };

            let limit = self
                .conn_send
                .available()
                .min(stream.send.available())
                .min(self.peer_max_frame_size as usize);
            if limit == 0 {
                if self.conn_send.available() == 0 {
                    // resumes on a connection WINDOW_UPDATE
                    stream.queued = true;
                    self.ready.push_front(stream_id);
                    return false;
                }
                // resumes on a stream WINDOW_UPDATE
                continue;
            }

            let chunk = if front.len() <= limit {
                stream.pending.pop_front().unwrap_or_default()
            } else {
                front.split_to(limit)
            };
            let n = chunk.len();
            self.conn_send.consume(n);
            stream.send.consume(n);
            let released = n.min(stream.owed);
            stream.owed -= released;
            if let Some(credit) = &stream.credit {
                credit.add_permits(released);
            }

            let end = stream.pending.is_empty() && stream.end_pending;
            frame::encode_data(stream_id, &chunk, end, &mut self.write_buf);
            if end {
                stream.end_pending = false;
                self.sent_end_stream(stream_id);
            } else if !stream.pending.is_empty() {
                stream.queued = true;
                self.ready.push_back(stream_id);
            }

            if self.write_buf.len() >= WRITE_HIGH_WATER {
                return !self.ready.is_empty();
            }
        }
        false
    }

    async fn write_out(&mut self) -> H2Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let timeout = self.ctx.config.http.write_timeout;
        let write = async {
            self.io.write_all(&self.write_buf).await?;
            self.io.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| timed_out("writing frames"))??;
        self.write_buf.clear();
        Ok(())
    }

    async fn close(&mut self) {
        self.streams.clear();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.io.shutdown()).await;
    }
}

/// Feed a streamed body to the session, staying at most [`STREAM_BUFFER`]
/// bytes ahead of the socket.
async fn produce_body(
    stream_id: u32,
    body: Body,
    credit: Arc<Semaphore>,
    events: mpsc::Sender<Event>,
) {
    let mut chunks = body.into_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) if chunk.is_empty() => continue,
            Ok(chunk) => chunk,
            Err(e) => {
                debug!(stream_id, error = %e, "Response body failed");
                let _ = events.send(Event::BodyError { stream_id }).await;
                return;
            }
        };
        let permits = chunk.len().min(STREAM_BUFFER) as u32;
        match credit.acquire_many(permits).await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }
        if events.send(Event::Data { stream_id, chunk }).await.is_err() {
            return;
        }
    }
    let _ = events.send(Event::End { stream_id }).await;
}

fn timed_out(what: &'static str) -> H2Error {
    H2Error::Io(io::Error::new(io::ErrorKind::TimedOut, what))
}
