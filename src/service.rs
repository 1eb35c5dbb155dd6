//! Boundary between the connection engine and the application.
//!
//! Requests reach the application as `http::Request<Bytes>` with a
//! [`ConnectionInfo`] in their extensions. The application answers with an
//! `http::Response<Body>` produced by a [`Task`], so it can choose per
//! request whether to run blocking or async.

use crate::protocols::Protocol;
use crate::runtime::Task;
use crate::transport::Transport;
use bytes::Bytes;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use http::{header, HeaderValue, StatusCode};
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddr;
use std::ops::RangeInclusive;

pub use crate::protocols::websocket::WebSocketView;

/// Granularity used when draining readers and iterators.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub type Request = http::Request<Bytes>;
pub type Response = http::Response<Body>;

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: SocketAddr,
    pub transport: Transport,
    pub protocol: Protocol,
}

/// Response payload.
pub enum Body {
    Empty,
    Full(Bytes),
    /// Produced on demand by a blocking iterator.
    Chunks(Box<dyn Iterator<Item = io::Result<Bytes>> + Send + 'static>),
    /// Produced on demand by an async stream.
    Stream(BoxStream<'static, io::Result<Bytes>>),
    /// Exactly `len` bytes read from a blocking reader.
    Reader {
        reader: Box<dyn Read + Send + 'static>,
        len: u64,
    },
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = io::Result<Bytes>>,
        I::IntoIter: Send + 'static,
    {
        Body::Chunks(Box::new(iter.into_iter()))
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Body::Stream(stream.boxed())
    }

    pub fn from_reader<R: Read + Send + 'static>(reader: R, len: u64) -> Self {
        Body::Reader {
            reader: Box::new(reader),
            len,
        }
    }

    /// Length when known before the body is produced.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Reader { len, .. } => Some(*len),
            Body::Chunks(_) | Body::Stream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Turn the body into a blocking chunk iterator.
    ///
    /// Async streams are driven on `runtime`, so this must only be used from
    /// a worker thread.
    pub fn into_blocking_chunks(
        self,
        runtime: &tokio::runtime::Handle,
    ) -> Box<dyn Iterator<Item = io::Result<Bytes>> + Send + 'static> {
        match self {
            Body::Empty => Box::new(std::iter::empty()),
            Body::Full(bytes) => Box::new(std::iter::once(Ok(bytes))),
            Body::Chunks(iter) => iter,
            Body::Reader { reader, len } => Box::new(ReaderChunks {
                reader,
                remaining: len,
            }),
            Body::Stream(mut stream) => {
                let runtime = runtime.clone();
                Box::new(std::iter::from_fn(move || runtime.block_on(stream.next())))
            }
        }
    }

    /// Turn the body into an async chunk stream.
    ///
    /// Blocking producers are drained on tokio's blocking threads and fed
    /// through a small channel, so the event loop never blocks on them.
    pub fn into_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            Body::Empty => futures_util::stream::empty().boxed(),
            Body::Full(bytes) => futures_util::stream::once(async move { Ok(bytes) }).boxed(),
            Body::Stream(stream) => stream,
            Body::Chunks(iter) => blocking_stream(iter),
            Body::Reader { reader, len } => blocking_stream(Box::new(ReaderChunks {
                reader,
                remaining: len,
            })),
        }
    }
}

fn blocking_stream(
    mut iter: Box<dyn Iterator<Item = io::Result<Bytes>> + Send + 'static>,
) -> BoxStream<'static, io::Result<Bytes>> {
    let (tx, mut rx) = tokio::sync::mpsc::channel(4);
    tokio::task::spawn_blocking(move || {
        for chunk in iter.by_ref() {
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
    });
    futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}

struct ReaderChunks {
    reader: Box<dyn Read + Send + 'static>,
    remaining: u64,
}

impl Iterator for ReaderChunks {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let want = self.remaining.min(CHUNK_SIZE as u64) as usize;
        let mut buf = vec![0u8; want];
        match self.reader.read(&mut buf) {
            Ok(0) => {
                self.remaining = 0;
                Some(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "body reader ended before its declared length",
                )))
            }
            Ok(n) => {
                buf.truncate(n);
                self.remaining -= n as u64;
                Some(Ok(Bytes::from(buf)))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.next(),
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Full(bytes) => write!(f, "Body::Full({} bytes)", bytes.len()),
            Body::Chunks(_) => write!(f, "Body::Chunks"),
            Body::Stream(_) => write!(f, "Body::Stream"),
            Body::Reader { len, .. } => write!(f, "Body::Reader({len} bytes)"),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::Full(bytes)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Full(Bytes::from(bytes))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Full(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Body::Full(Bytes::from_static(s.as_bytes()))
    }
}

/// Build a `206 Partial Content` response for `range` of a seekable source.
///
/// `total` is the full length of the resource. An unsatisfiable range
/// yields `416 Range Not Satisfiable`.
pub fn partial_content<R>(mut reader: R, range: RangeInclusive<u64>, total: u64) -> io::Result<Response>
where
    R: Read + Seek + Send + 'static,
{
    let (start, end) = (*range.start(), *range.end());
    if start > end || end >= total {
        let mut response = http::Response::new(Body::Empty);
        *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
        response.headers_mut().insert(
            header::CONTENT_RANGE,
            header_value(format!("bytes */{total}"))?,
        );
        return Ok(response);
    }

    reader.seek(SeekFrom::Start(start))?;
    let len = end - start + 1;
    let mut response = http::Response::new(Body::from_reader(reader, len));
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_RANGE,
        header_value(format!("bytes {start}-{end}/{total}"))?,
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

fn header_value(s: String) -> io::Result<HeaderValue> {
    HeaderValue::try_from(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// The application.
///
/// `call` turns a request into a response task. `websocket` is consulted
/// for valid upgrade requests; returning a view accepts the upgrade.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: Request) -> Task<Response>;

    fn websocket(&self, request: &Request) -> Option<Box<dyn WebSocketView>> {
        let _ = request;
        None
    }
}

impl<F> Service for F
where
    F: Fn(Request) -> Task<Response> + Send + Sync + 'static,
{
    fn call(&self, request: Request) -> Task<Response> {
        self(request)
    }
}
