//! Per-connection HTTP/1.1 state, independent of the socket flavour.
//!
//! Both drivers feed bytes into [`Http1Conn`] and act on the [`Progress`] it
//! reports. Requests are completed one at a time, so pipelined requests are
//! answered in order.

use super::body::BodyDecoder;
use super::parser::{self, RequestHead};
use super::Http1Error;
use crate::config::HttpLimits;
use crate::protocols::dispatch::{self, has_token, Sniff, Upgrade};
use crate::service::{ConnectionInfo, Request};
use bytes::BytesMut;
use http::{header, HeaderMap, Version};

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http1State {
    AwaitingRequest,
    ReadingHeaders,
    ReadingBody,
    Dispatching,
    WritingResponse,
    Closing,
}

/// What the driver should do next.
#[derive(Debug)]
pub enum Progress {
    /// Read more bytes into [`Http1Conn::buffer_mut`].
    NeedMore,
    /// Write `100 Continue`, then call `advance` again.
    SendContinue,
    /// The HTTP/2 connection preface arrived instead of a request.
    Http2Preface,
    /// A complete request.
    Request(Box<ParsedRequest>),
}

#[derive(Debug)]
pub struct ParsedRequest {
    pub request: Request,
    /// The client allows the connection to persist.
    pub keep_alive: bool,
    pub upgrade: Upgrade,
}

struct InFlight {
    head: RequestHead,
    decoder: BodyDecoder,
    body: BytesMut,
    continue_sent: bool,
}

pub struct Http1Conn {
    buf: BytesMut,
    state: Http1State,
    limits: HttpLimits,
    info: ConnectionInfo,
    /// Cleartext HTTP/2 (preface or upgrade) is allowed.
    h2c: bool,
    served: u64,
    in_flight: Option<InFlight>,
}

impl Http1Conn {
    pub fn new(limits: HttpLimits, info: ConnectionInfo, h2c: bool, buffered: &[u8]) -> Self {
        let mut buf = BytesMut::with_capacity(8192.max(buffered.len()));
        buf.extend_from_slice(buffered);
        Self {
            buf,
            state: Http1State::AwaitingRequest,
            limits,
            info,
            h2c,
            served: 0,
            in_flight: None,
        }
    }

    pub fn state(&self) -> Http1State {
        self.state
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    /// Read target for the driver.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes read past the last request, returned on protocol handoff.
    pub fn take_buffer(&mut self) -> BytesMut {
        std::mem::take(&mut self.buf)
    }

    /// Waiting between requests with nothing buffered: the idle timer runs.
    pub fn is_idle(&self) -> bool {
        self.state == Http1State::AwaitingRequest && self.buf.is_empty()
    }

    /// Process buffered input.
    pub fn advance(&mut self) -> Result<Progress, Http1Error> {
        if self.in_flight.is_none() {
            if self.buf.is_empty() {
                return Ok(Progress::NeedMore);
            }
            self.state = Http1State::ReadingHeaders;

            if self.h2c && self.served == 0 {
                match dispatch::sniff_preface(&self.buf) {
                    Sniff::Http2Preface => return Ok(Progress::Http2Preface),
                    Sniff::NeedMore => return Ok(Progress::NeedMore),
                    Sniff::Http1 => {}
                }
            }

            let Some((head, len)) = parser::parse_head(
                &self.buf,
                self.limits.max_header_bytes,
                self.limits.max_request_bytes,
            )?
            else {
                return Ok(Progress::NeedMore);
            };
            let _ = self.buf.split_to(len);
            self.state = Http1State::ReadingBody;
            self.in_flight = Some(InFlight {
                decoder: BodyDecoder::new(head.framing),
                head,
                body: BytesMut::new(),
                continue_sent: false,
            });
        }

        let Some(in_flight) = self.in_flight.as_mut() else {
            return Ok(Progress::NeedMore);
        };
        let done = in_flight.decoder.decode(
            &mut self.buf,
            &mut in_flight.body,
            self.limits.max_request_bytes,
        )?;
        if !done {
            if in_flight.head.expect_continue && !in_flight.continue_sent {
                in_flight.continue_sent = true;
                return Ok(Progress::SendContinue);
            }
            return Ok(Progress::NeedMore);
        }

        let Some(InFlight { head, body, .. }) = self.in_flight.take() else {
            return Ok(Progress::NeedMore);
        };
        self.state = Http1State::Dispatching;
        self.served += 1;

        let keep_alive = client_keep_alive(head.parts.version, &head.parts.headers);
        let upgrade = dispatch::classify_upgrade(
            &head.parts.method,
            head.parts.version,
            &head.parts.headers,
            self.h2c,
        );
        let mut request = Request::from_parts(head.parts, body.freeze());
        request.extensions_mut().insert(self.info);
        Ok(Progress::Request(Box::new(ParsedRequest {
            request,
            keep_alive,
            upgrade,
        })))
    }

    pub fn start_response(&mut self) {
        self.state = Http1State::WritingResponse;
    }

    /// Finish the current exchange. Returns whether the connection stays open.
    pub fn finish_response(&mut self, keep_alive: bool) -> bool {
        self.state = if keep_alive {
            Http1State::AwaitingRequest
        } else {
            Http1State::Closing
        };
        keep_alive
    }

    /// Whether another request may follow, given what the client asked for,
    /// the response, and server limits.
    pub fn keep_alive(
        &self,
        client_keep_alive: bool,
        response_headers: &HeaderMap,
        under_pressure: bool,
        shutting_down: bool,
    ) -> bool {
        client_keep_alive
            && !has_token(response_headers, &header::CONNECTION, "close")
            && self.served < self.limits.max_requests_per_connection
            && !under_pressure
            && !shutting_down
    }
}

/// HTTP/1.1 persists unless told otherwise; HTTP/1.0 only on request.
pub fn client_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::HTTP_11 => !has_token(headers, &header::CONNECTION, "close"),
        Version::HTTP_10 => has_token(headers, &header::CONNECTION, "keep-alive"),
        _ => false,
    }
}
