//! A running WebSocket connection.
//!
//! Four tasks share one session:
//! - the receive loop (the caller of [`WebSocketSession::run`]) parses
//!   frames and reassembles messages
//! - the view task runs the application callbacks on the worker pool, one
//!   at a time and in wire order
//! - the writer owns the write half; every outbound frame goes through its
//!   queue so fragments of different messages never interleave
//! - the heartbeat pings on a fixed interval and kills the session when
//!   nothing arrives within the pong timeout
//!
//! State only moves forward: Connecting, Open, Closing, Closed.

use super::close::{CloseCode, CloseFrame};
use super::deflate::{DeflateConfig, Deflater, Inflater};
use super::frame::{Frame, FrameReader, OpCode, ParseOptions, Role, MAX_CONTROL_PAYLOAD};
use super::{WsError, WsResult};
use crate::config::WebSocketLimits;
use crate::runtime::{ShutdownSignal, Task, TaskError, TaskExecutor};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

const OUTBOUND_QUEUE: usize = 64;

/// Messages waiting for the view before the receive loop stops reading.
const INBOUND_QUEUE: usize = 16;

/// Pause before resubmitting a callback the saturated pool turned away.
const SUBMIT_RETRY: Duration = Duration::from_millis(10);
const SUBMIT_ATTEMPTS: u32 = 50;

/// Lower bound on how long a closing handshake or final flush may take.
const MIN_CLOSE_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Clone)]
struct StateCell {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::Connecting);
        Self { tx: Arc::new(tx) }
    }

    fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    /// Move to `next` unless the session is already there or beyond.
    fn advance(&self, next: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.tx.send_if_modified(|state| {
            if *state == from && to > from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Read-only view of a session's state.
#[derive(Debug, Clone)]
pub struct SessionStateHandle {
    rx: watch::Receiver<SessionState>,
}

impl SessionStateHandle {
    pub fn get(&self) -> SessionState {
        *self.rx.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn closed(&mut self) {
        let _ = self.rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

enum Outbound {
    Message { opcode: OpCode, payload: Bytes },
    Control(Frame),
    /// Stop the writer once everything queued before it is written.
    Finish,
}

/// Why an outbound frame was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The outbound queue is full.
    Full,
    /// The session is closing or closed.
    Closed,
    /// Control payloads are limited to 125 bytes.
    ControlTooLarge,
    /// The close code may not be sent on the wire.
    InvalidCloseCode,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Full => write!(f, "outbound queue full"),
            SendError::Closed => write!(f, "websocket is not open"),
            SendError::ControlTooLarge => write!(f, "control payload over 125 bytes"),
            SendError::InvalidCloseCode => write!(f, "close code is reserved"),
        }
    }
}

impl std::error::Error for SendError {}

/// Handle for queueing frames on a session. Cloning is cheap.
///
/// Sends never block: they fail with [`SendError::Full`] once the queue
/// holds more frames than the writer has flushed.
#[derive(Clone)]
pub struct WebSocketSender {
    tx: mpsc::Sender<Outbound>,
    state: StateCell,
}

impl WebSocketSender {
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send_message(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_message(OpCode::Binary, data.into())
    }

    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_control(OpCode::Ping, payload.into())
    }

    pub fn send_pong(&self, payload: impl Into<Bytes>) -> Result<(), SendError> {
        self.send_control(OpCode::Pong, payload.into())
    }

    /// Start the closing handshake. `None` sends a CLOSE without status.
    pub fn send_close(&self, frame: Option<CloseFrame>) -> Result<(), SendError> {
        let frame = close_frame(frame.as_ref())?;
        if self.state() != SessionState::Open {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Outbound::Control(frame))
            .map_err(queue_error)?;
        self.state.transition(SessionState::Open, SessionState::Closing);
        Ok(())
    }

    /// Queue a CLOSE from inside the session, waiting for queue space.
    async fn close_with(&self, frame: Option<CloseFrame>, grace: Duration) {
        let Ok(frame) = close_frame(frame.as_ref()) else {
            return;
        };
        if !self
            .state
            .transition(SessionState::Open, SessionState::Closing)
        {
            return;
        }
        let sent = tokio::time::timeout(grace, self.tx.send(Outbound::Control(frame))).await;
        if !matches!(sent, Ok(Ok(()))) {
            debug!("Could not queue CLOSE frame");
        }
    }

    fn send_message(&self, opcode: OpCode, payload: Bytes) -> Result<(), SendError> {
        if self.state() != SessionState::Open {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Outbound::Message { opcode, payload })
            .map_err(queue_error)
    }

    fn send_control(&self, opcode: OpCode, payload: Bytes) -> Result<(), SendError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(SendError::ControlTooLarge);
        }
        if self.state() != SessionState::Open {
            return Err(SendError::Closed);
        }
        self.tx
            .try_send(Outbound::Control(Frame::new(opcode, payload)))
            .map_err(queue_error)
    }
}

impl std::fmt::Debug for WebSocketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSender")
            .field("state", &self.state())
            .finish()
    }
}

fn queue_error<T>(e: mpsc::error::TrySendError<T>) -> SendError {
    match e {
        mpsc::error::TrySendError::Full(_) => SendError::Full,
        mpsc::error::TrySendError::Closed(_) => SendError::Closed,
    }
}

fn close_frame(frame: Option<&CloseFrame>) -> Result<Frame, SendError> {
    match frame {
        None => Ok(Frame::new(OpCode::Close, Bytes::new())),
        Some(frame) if frame.code.is_sendable() => Ok(Frame::new(OpCode::Close, frame.encode())),
        Some(_) => Err(SendError::InvalidCloseCode),
    }
}

/// Application callbacks for one WebSocket connection.
///
/// Callbacks run on a worker thread, one at a time per connection, in the
/// order the frames arrived. They may block; while one runs, the session
/// keeps answering pings but stops reading new messages once a few are
/// queued. A callback that panics closes the connection with 1011.
pub trait WebSocketView: Send {
    /// Subprotocol to confirm, chosen from the ones the client offered.
    fn subprotocol(&self, offered: &[String]) -> Option<String> {
        let _ = offered;
        None
    }

    fn on_open(&mut self, sender: &WebSocketSender) {
        let _ = sender;
    }

    /// A complete text or binary message. Text payloads are valid UTF-8.
    fn on_receive(&mut self, sender: &WebSocketSender, payload: Bytes, opcode: OpCode);

    /// Called once. Carries the peer's close frame, 1005 when it had no
    /// status, or 1006 when the connection ended without one.
    fn on_close(&mut self, frame: &CloseFrame) {
        let _ = frame;
    }
}

struct PartialMessage {
    opcode: OpCode,
    compressed: bool,
    data: BytesMut,
}

enum Flow {
    Continue,
    /// A complete text or binary message.
    Message(OpCode, Bytes),
    /// Peer sent CLOSE.
    Closed(Option<CloseFrame>),
}

#[derive(Clone)]
enum ViewEvent {
    Open,
    Message(OpCode, Bytes),
    Close(CloseFrame),
}

/// A WebSocket connection after the 101 response was written.
pub struct WebSocketSession<S> {
    io: S,
    limits: WebSocketLimits,
    view: Box<dyn WebSocketView>,
    deflate: Option<DeflateConfig>,
    executor: TaskExecutor,
    state: StateCell,
}

impl<S> WebSocketSession<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        io: S,
        limits: WebSocketLimits,
        view: Box<dyn WebSocketView>,
        deflate: Option<DeflateConfig>,
        executor: TaskExecutor,
    ) -> Self {
        Self {
            io,
            limits,
            view,
            deflate,
            executor,
            state: StateCell::new(),
        }
    }

    pub fn state_handle(&self) -> SessionStateHandle {
        SessionStateHandle {
            rx: self.state.tx.subscribe(),
        }
    }

    /// Drive the session until it is closed. Returns the frame passed to
    /// the view's `on_close`.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> CloseFrame {
        let Self {
            io,
            limits,
            view,
            deflate,
            executor,
            state,
        } = self;
        let grace = limits.pong_timeout.max(MIN_CLOSE_GRACE);

        let (mut reader, writer) = tokio::io::split(io);
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let sender = WebSocketSender {
            tx,
            state: state.clone(),
        };
        let mut writer_task =
            tokio::spawn(write_loop(writer, rx, deflate.as_ref().map(Deflater::new)));

        let activity = Arc::new(AtomicU64::new(0));
        let timed_out = Arc::new(AtomicBool::new(false));
        let heartbeat_task = (!limits.ping_interval.is_zero()).then(|| {
            tokio::spawn(heartbeat(
                sender.clone(),
                state.clone(),
                activity.clone(),
                timed_out.clone(),
                limits.ping_interval,
                limits.pong_timeout,
            ))
        });

        let (events, events_rx) = mpsc::channel(INBOUND_QUEUE);
        let view_task = tokio::spawn(run_view(view, sender.clone(), executor, events_rx, grace));

        state.advance(SessionState::Open);
        let _ = events.send(ViewEvent::Open).await;

        let opts = ParseOptions {
            role: Role::Server,
            max_payload: limits.max_frame_size,
            allow_rsv1: deflate.is_some(),
        };
        let mut frames = FrameReader::new(opts);
        let mut inflater = deflate.as_ref().map(Inflater::new);
        let mut partial: Option<PartialMessage> = None;
        let mut received: Option<Option<CloseFrame>> = None;
        let mut failure: Option<WsError> = None;
        let mut going_away = false;

        let stopped = until_stopped(state.tx.subscribe(), grace);
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                biased;
                _ = &mut stopped => break,
                _ = shutdown.wait(), if !going_away => {
                    going_away = true;
                    debug!("Closing websocket for shutdown");
                    sender
                        .close_with(Some(CloseFrame::new(CloseCode::GoingAway, "server shutting down")), grace)
                        .await;
                }
                frame = frames.read_frame(&mut reader) => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            debug!("Peer closed websocket without CLOSE");
                            break;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    };
                    activity.fetch_add(1, Ordering::Relaxed);
                    trace!(opcode = ?frame.opcode, len = frame.payload.len(), "Received frame");
                    match on_frame(frame, &mut partial, inflater.as_mut(), &limits, &sender) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Message(opcode, payload)) => {
                            // data arriving after our CLOSE is discarded
                            if sender.state() == SessionState::Open
                                && events.send(ViewEvent::Message(opcode, payload)).await.is_err()
                            {
                                break;
                            }
                        }
                        Ok(Flow::Closed(frame)) => {
                            // echo with the same code
                            sender.close_with(frame.clone(), grace).await;
                            received = Some(frame);
                            break;
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            }
        }

        if timed_out.load(Ordering::Relaxed) {
            failure = Some(WsError::HeartbeatTimeout);
        }
        if let Some(e) = &failure {
            match e {
                WsError::Io(_) | WsError::HeartbeatTimeout => debug!(error = %e, "Websocket ended"),
                _ => {
                    warn!(error = %e, "Websocket protocol failure");
                    sender
                        .close_with(Some(CloseFrame::new(e.close_code(), "")), grace)
                        .await;
                }
            }
        }

        // let the writer flush what is queued, unless the peer is gone
        let peer_gone = matches!(failure, Some(WsError::HeartbeatTimeout | WsError::Io(_)));
        if !peer_gone {
            let _ = tokio::time::timeout(grace, sender.tx.send(Outbound::Finish)).await;
            if tokio::time::timeout(grace, &mut writer_task).await.is_err() {
                writer_task.abort();
            }
        } else {
            writer_task.abort();
        }
        state.advance(SessionState::Closed);
        if let Some(task) = heartbeat_task {
            task.abort();
        }

        let reported = match (received, failure) {
            (Some(Some(frame)), _) => frame,
            (Some(None), _) => CloseFrame::new(CloseCode::NoStatus, ""),
            (None, Some(e)) => CloseFrame::new(CloseCode::Abnormal, e.to_string()),
            (None, None) => CloseFrame::new(CloseCode::Abnormal, ""),
        };
        if events.send(ViewEvent::Close(reported.clone())).await.is_ok() {
            drop(events);
            let _ = view_task.await;
        }
        reported
    }
}

/// Feed session events to the view, each as a blocking task.
///
/// Waits for every callback before starting the next so messages reach the
/// view in wire order. A failed callback closes the session with 1011 and
/// later events are dropped.
async fn run_view(
    view: Box<dyn WebSocketView>,
    sender: WebSocketSender,
    executor: TaskExecutor,
    mut events: mpsc::Receiver<ViewEvent>,
    grace: Duration,
) {
    let view = Arc::new(Mutex::new(view));
    while let Some(event) = events.recv().await {
        let closing = matches!(event, ViewEvent::Close(_));
        if let Err(e) = dispatch(&view, &sender, &executor, event).await {
            warn!(error = %e, "WebSocket callback failed");
            if !closing {
                sender
                    .close_with(Some(CloseFrame::new(CloseCode::InternalError, "")), grace)
                    .await;
            }
            return;
        }
    }
}

async fn dispatch(
    view: &Arc<Mutex<Box<dyn WebSocketView>>>,
    sender: &WebSocketSender,
    executor: &TaskExecutor,
    event: ViewEvent,
) -> Result<(), TaskError> {
    let mut attempts = 0;
    loop {
        let task = callback(Arc::clone(view), sender.clone(), event.clone());
        match executor.submit(task).await {
            Err(TaskError::Rejected) if attempts < SUBMIT_ATTEMPTS => {
                attempts += 1;
                tokio::time::sleep(SUBMIT_RETRY).await;
            }
            result => return result,
        }
    }
}

fn callback(
    view: Arc<Mutex<Box<dyn WebSocketView>>>,
    sender: WebSocketSender,
    event: ViewEvent,
) -> Task<()> {
    Task::blocking(move || {
        let mut view = view.lock().map_err(|_| "view poisoned by an earlier panic")?;
        match event {
            ViewEvent::Open => view.on_open(&sender),
            ViewEvent::Message(opcode, payload) => {
                // the session may have closed while this waited in the queue
                if sender.state() == SessionState::Open {
                    view.on_receive(&sender, payload, opcode);
                }
            }
            ViewEvent::Close(frame) => view.on_close(&frame),
        }
        Ok(())
    })
}

/// Resolves when the heartbeat kills the session, or when a close we sent
/// has gone unanswered for `grace`.
async fn until_stopped(mut rx: watch::Receiver<SessionState>, grace: Duration) {
    if rx.wait_for(|s| *s >= SessionState::Closing).await.is_err() {
        return;
    }
    let _ = tokio::time::timeout(grace, rx.wait_for(|s| *s == SessionState::Closed)).await;
}

fn on_frame(
    frame: Frame,
    partial: &mut Option<PartialMessage>,
    inflater: Option<&mut Inflater>,
    limits: &WebSocketLimits,
    sender: &WebSocketSender,
) -> WsResult<Flow> {
    match frame.opcode {
        OpCode::Ping => {
            if sender.send_pong(frame.payload).is_err() {
                trace!("Dropped PONG reply");
            }
            Ok(Flow::Continue)
        }
        OpCode::Pong => Ok(Flow::Continue),
        OpCode::Close => Ok(Flow::Closed(CloseFrame::parse(&frame.payload)?)),
        OpCode::Text | OpCode::Binary => {
            if partial.is_some() {
                return Err(WsError::Protocol("new message before the previous one finished"));
            }
            check_size(frame.payload.len(), limits)?;
            let message = PartialMessage {
                opcode: frame.opcode,
                compressed: frame.rsv1,
                data: BytesMut::from(&frame.payload[..]),
            };
            if frame.fin {
                return deliver(message, inflater, limits);
            }
            *partial = Some(message);
            Ok(Flow::Continue)
        }
        OpCode::Continuation => {
            if frame.rsv1 {
                return Err(WsError::Protocol("RSV1 set on a continuation frame"));
            }
            let Some(message) = partial.as_mut() else {
                return Err(WsError::Protocol("continuation without a message"));
            };
            check_size(message.data.len() + frame.payload.len(), limits)?;
            message.data.extend_from_slice(&frame.payload);
            match partial.take() {
                Some(message) if frame.fin => deliver(message, inflater, limits),
                message => {
                    *partial = message;
                    Ok(Flow::Continue)
                }
            }
        }
    }
}

fn check_size(size: usize, limits: &WebSocketLimits) -> WsResult<()> {
    if size > limits.max_message_size {
        return Err(WsError::MessageTooBig {
            size,
            limit: limits.max_message_size,
        });
    }
    Ok(())
}

/// Finish a reassembled message for the view.
fn deliver(
    message: PartialMessage,
    inflater: Option<&mut Inflater>,
    limits: &WebSocketLimits,
) -> WsResult<Flow> {
    let payload = match (message.compressed, inflater) {
        (false, _) => message.data.freeze(),
        (true, Some(inflater)) => {
            Bytes::from(inflater.decompress(&message.data, limits.max_message_size)?)
        }
        (true, None) => return Err(WsError::Protocol("compressed message without deflate")),
    };
    if message.opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
        return Err(WsError::InvalidUtf8);
    }
    Ok(Flow::Message(message.opcode, payload))
}

async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut rx: mpsc::Receiver<Outbound>,
    mut deflater: Option<Deflater>,
) -> WsResult<()>
where
    S: AsyncRead + AsyncWrite,
{
    let mut buf = BytesMut::new();
    while let Some(outbound) = rx.recv().await {
        buf.clear();
        let closing = match outbound {
            Outbound::Finish => break,
            Outbound::Message { opcode, payload } => {
                let frame = match deflater.as_mut() {
                    Some(deflater) => {
                        Frame::new(opcode, deflater.compress(&payload)?).with_rsv1(true)
                    }
                    None => Frame::new(opcode, payload),
                };
                frame.encode(None, &mut buf);
                false
            }
            Outbound::Control(frame) => {
                frame.encode(None, &mut buf);
                frame.opcode == OpCode::Close
            }
        };
        writer.write_all(&buf).await?;
        writer.flush().await?;
        if closing {
            trace!("CLOSE written");
            break;
        }
    }
    Ok(())
}

async fn heartbeat(
    sender: WebSocketSender,
    state: StateCell,
    activity: Arc<AtomicU64>,
    timed_out: Arc<AtomicBool>,
    interval: Duration,
    pong_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let seen = activity.load(Ordering::Relaxed);
        if sender.send_ping(Bytes::new()).is_err() && sender.state() != SessionState::Open {
            return;
        }
        tokio::time::sleep(pong_timeout).await;
        if activity.load(Ordering::Relaxed) == seen {
            debug!(timeout = ?pong_timeout, "No traffic after PING");
            timed_out.store(true, Ordering::Relaxed);
            state.advance(SessionState::Closed);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ShutdownHandle, WorkerPool};
    use tokio::io::{duplex, DuplexStream};
    use tokio::runtime::Handle;

    const CLIENT: ParseOptions = ParseOptions {
        role: Role::Client,
        max_payload: 1 << 20,
        allow_rsv1: true,
    };

    struct Echo;

    impl WebSocketView for Echo {
        fn on_receive(&mut self, sender: &WebSocketSender, payload: Bytes, opcode: OpCode) {
            let _ = match opcode {
                OpCode::Text => sender.send_text(String::from_utf8_lossy(&payload).into_owned()),
                _ => sender.send_binary(payload),
            };
        }
    }

    fn limits() -> WebSocketLimits {
        WebSocketLimits {
            max_frame_size: 1024,
            max_message_size: 4096,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_millis(200),
            permessage_deflate: true,
        }
    }

    /// The client end of a session under test.
    struct Peer {
        io: DuplexStream,
        frames: FrameReader,
    }

    fn executor() -> TaskExecutor {
        let pool = Arc::new(WorkerPool::new("ws-view", 1, 8).unwrap());
        TaskExecutor::new(pool, Handle::current())
    }

    fn start_with(
        limits: WebSocketLimits,
        deflate: Option<DeflateConfig>,
        view: Box<dyn WebSocketView>,
    ) -> (
        Peer,
        SessionStateHandle,
        ShutdownHandle,
        tokio::task::JoinHandle<CloseFrame>,
    ) {
        let (client, server) = duplex(1 << 16);
        let session = WebSocketSession::new(server, limits, view, deflate, executor());
        let state = session.state_handle();
        let shutdown = ShutdownHandle::new();
        let task = tokio::spawn(session.run(shutdown.signal()));
        let peer = Peer {
            io: client,
            frames: FrameReader::new(CLIENT),
        };
        (peer, state, shutdown, task)
    }

    fn start(
        limits: WebSocketLimits,
        deflate: Option<DeflateConfig>,
    ) -> (
        Peer,
        SessionStateHandle,
        ShutdownHandle,
        tokio::task::JoinHandle<CloseFrame>,
    ) {
        start_with(limits, deflate, Box::new(Echo))
    }

    fn masked(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(Some([1, 2, 3, 4]), &mut buf);
        buf
    }

    async fn send(client: &mut Peer, frame: Frame) {
        client.io.write_all(&masked(&frame)).await.unwrap();
    }

    async fn recv(client: &mut Peer) -> Frame {
        client.frames.read_frame(&mut client.io).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_echo_ping_and_close_handshake() {
        let (mut client, state, _shutdown, task) = start(limits(), None);

        send(&mut client, Frame::new(OpCode::Text, "hello")).await;
        let frame = recv(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hello");

        send(&mut client, Frame::new(OpCode::Ping, "p")).await;
        let frame = recv(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(&frame.payload[..], b"p");

        let close = CloseFrame::new(CloseCode::Normal, "done");
        send(&mut client, Frame::new(OpCode::Close, close.encode())).await;
        let frame = recv(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Close);
        assert_eq!(CloseFrame::parse(&frame.payload).unwrap(), Some(close.clone()));

        assert_eq!(task.await.unwrap(), close);
        assert_eq!(state.get(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_fragmented_message_reassembled() {
        let (mut client, _state, _shutdown, task) = start(limits(), None);

        send(&mut client, Frame::new(OpCode::Text, "frag").with_fin(false)).await;
        // control frames may arrive between fragments
        send(&mut client, Frame::new(OpCode::Ping, "")).await;
        send(&mut client, Frame::new(OpCode::Continuation, "mented")).await;

        assert_eq!(recv(&mut client).await.opcode, OpCode::Pong);
        let frame = recv(&mut client).await;
        assert_eq!(&frame.payload[..], b"fragmented");

        drop(client);
        assert_eq!(task.await.unwrap().code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_1007() {
        let (mut client, _state, _shutdown, task) = start(limits(), None);
        send(&mut client, Frame::new(OpCode::Text, vec![0xff, 0xfe])).await;

        let frame = recv(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Close);
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::InvalidData);
        assert_eq!(task.await.unwrap().code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_with_1002() {
        let (mut client, _state, _shutdown, task) = start(limits(), None);
        let mut buf = BytesMut::new();
        Frame::new(OpCode::Text, "hi").encode(None, &mut buf);
        client.io.write_all(&buf).await.unwrap();

        let frame = recv(&mut client).await;
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::Protocol);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let (mut client, _state, _shutdown, task) = start(limits(), None);
        send(&mut client, Frame::new(OpCode::Binary, vec![0u8; 1000]).with_fin(false)).await;
        for _ in 0..4 {
            send(&mut client, Frame::new(OpCode::Continuation, vec![0u8; 1000]).with_fin(false))
                .await;
        }
        let frame = recv(&mut client).await;
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::MessageTooBig);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let limits = WebSocketLimits {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_millis(50),
            ..limits()
        };
        let (mut client, mut state, _shutdown, task) = start(limits, None);

        assert_eq!(recv(&mut client).await.opcode, OpCode::Ping);
        tokio::time::timeout(Duration::from_secs(2), state.closed())
            .await
            .unwrap();
        let reported = task.await.unwrap();
        assert_eq!(reported.code, CloseCode::Abnormal);

        // the server dropped its end
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut client.io, &mut rest)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_going_away() {
        let (mut client, _state, shutdown, task) = start(limits(), None);
        shutdown.shutdown();

        let frame = recv(&mut client).await;
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::GoingAway);

        send(&mut client, Frame::new(OpCode::Close, close.encode())).await;
        assert_eq!(task.await.unwrap().code, CloseCode::GoingAway);
    }

    #[tokio::test]
    async fn test_compressed_echo() {
        let config = DeflateConfig::default();
        let (mut client, _state, _shutdown, task) = start(limits(), Some(config));
        let mut deflater = Deflater::new(&config);
        let mut inflater = Inflater::new(&config);

        let compressed = deflater.compress(b"squeeze me").unwrap();
        send(&mut client, Frame::new(OpCode::Text, compressed).with_rsv1(true)).await;

        let frame = recv(&mut client).await;
        assert!(frame.rsv1);
        assert_eq!(inflater.decompress(&frame.payload, 4096).unwrap(), b"squeeze me");

        send(&mut client, Frame::new(OpCode::Close, Bytes::new())).await;
        let frame = recv(&mut client).await;
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(frame.payload.is_empty());
        assert_eq!(task.await.unwrap().code, CloseCode::NoStatus);
    }

    #[tokio::test]
    async fn test_partial_frame_survives_shutdown() {
        let (mut client, _state, shutdown, task) = start(limits(), None);
        let wire = masked(&Frame::new(OpCode::Binary, vec![5u8; 200]));

        client.io.write_all(&wire[..50]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.shutdown();
        let frame = recv(&mut client).await;
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::GoingAway);

        // the rest of the frame, then our answer to the CLOSE
        client.io.write_all(&wire[50..]).await.unwrap();
        let reply = CloseFrame::new(CloseCode::GoingAway, "");
        send(&mut client, Frame::new(OpCode::Close, reply.encode())).await;
        assert_eq!(task.await.unwrap().code, CloseCode::GoingAway);
    }

    /// Records which thread ran each callback.
    struct Recorder {
        threads: Arc<Mutex<Vec<(String, Option<String>)>>>,
    }

    impl Recorder {
        fn record(&self, event: &str) {
            let name = std::thread::current().name().map(str::to_string);
            self.threads.lock().unwrap().push((event.to_string(), name));
        }
    }

    impl WebSocketView for Recorder {
        fn on_open(&mut self, _: &WebSocketSender) {
            self.record("open");
        }

        fn on_receive(&mut self, sender: &WebSocketSender, payload: Bytes, _: OpCode) {
            // slow handlers must not reorder messages
            std::thread::sleep(Duration::from_millis(5));
            self.record(&String::from_utf8_lossy(&payload));
            let _ = sender.send_binary(payload);
        }

        fn on_close(&mut self, _: &CloseFrame) {
            self.record("close");
        }
    }

    #[tokio::test]
    async fn test_callbacks_run_on_worker_in_order() {
        let threads = Arc::new(Mutex::new(Vec::new()));
        let view = Recorder {
            threads: threads.clone(),
        };
        let (mut client, _state, _shutdown, task) = start_with(limits(), None, Box::new(view));

        for text in ["a", "b", "c"] {
            send(&mut client, Frame::new(OpCode::Text, text)).await;
        }
        for text in ["a", "b", "c"] {
            assert_eq!(&recv(&mut client).await.payload[..], text.as_bytes());
        }
        send(&mut client, Frame::new(OpCode::Close, Bytes::new())).await;
        task.await.unwrap();

        let threads = threads.lock().unwrap();
        let events: Vec<&str> = threads.iter().map(|(event, _)| event.as_str()).collect();
        assert_eq!(events, ["open", "a", "b", "c", "close"]);
        let runtime_thread = std::thread::current().name().map(str::to_string);
        for (event, name) in threads.iter() {
            assert_ne!(name, &runtime_thread, "{event} ran on the event loop");
        }
    }

    struct Panicky;

    impl WebSocketView for Panicky {
        fn on_receive(&mut self, _: &WebSocketSender, _: Bytes, _: OpCode) {
            panic!("view bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_callback_closes_with_1011() {
        let (mut client, _state, _shutdown, task) = start_with(limits(), None, Box::new(Panicky));
        send(&mut client, Frame::new(OpCode::Text, "boom")).await;

        let frame = recv(&mut client).await;
        let close = CloseFrame::parse(&frame.payload).unwrap().unwrap();
        assert_eq!(close.code, CloseCode::InternalError);
        send(&mut client, Frame::new(OpCode::Close, close.encode())).await;
        task.await.unwrap();
    }

    #[test]
    fn test_sender_rules() {
        let (tx, _rx) = mpsc::channel(1);
        let state = StateCell::new();
        let sender = WebSocketSender {
            tx,
            state: state.clone(),
        };
        assert_eq!(sender.send_text("early"), Err(SendError::Closed));

        state.advance(SessionState::Open);
        assert_eq!(sender.send_ping(vec![0u8; 126]), Err(SendError::ControlTooLarge));
        assert_eq!(
            sender.send_close(Some(CloseFrame::new(CloseCode::Abnormal, ""))),
            Err(SendError::InvalidCloseCode)
        );
        sender.send_text("one").unwrap();
        assert_eq!(sender.send_text("two"), Err(SendError::Full));

        // state never moves backwards
        state.advance(SessionState::Closed);
        assert!(!state.advance(SessionState::Open));
        assert_eq!(sender.state(), SessionState::Closed);
    }
}
