//! Per-connection request loop.
//!
//! One `HttpConnection` owns a socket for its whole life and serves
//! requests back to back until keep-alive ends, a limit trips, or the
//! peer misbehaves. Failures here never leave this connection: a
//! malformed request closes the socket without a reply, a failed
//! handler gets the error responder, and the loop simply returns.

use crate::errors::{Fallback, ParseError};
use crate::http::request::{find_blank_line, HeaderMap, Parser, Request, RequestLine};
use crate::http::response::{encode_chunk, Response, CHUNK_TERMINATOR};
use crate::limits::{ConnLimits, ReqLimits, RespLimits};
use crate::net::socket::{Connection, IoFailure};
use crate::route::middleware::{Flow, Middleware};
use crate::route::router::{Resolution, Router};
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Everything the connection loop shares with its siblings: the frozen
/// dispatch table and the limit set. Built once at startup.
pub(crate) struct Dispatch {
    pub(crate) router: Router,
    pub(crate) conn_limits: ConnLimits,
    /// Must already be precalculated.
    pub(crate) req_limits: ReqLimits,
    pub(crate) resp_limits: RespLimits,
}

/// Why the loop stopped early. Logged at debug, never sent to the peer.
enum Close {
    Io(IoFailure),
    Malformed(ParseError),
}

impl fmt::Display for Close {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Malformed(err) => write!(f, "malformed request: {err}"),
        }
    }
}

pub(crate) struct HttpConnection {
    conn: Connection,
    parser: Parser,
    /// Overflow body storage when the body outgrows the parse buffer.
    spill: Vec<u8>,
    shared: Arc<Dispatch>,
}

impl HttpConnection {
    pub(crate) fn new(conn: Connection, shared: Arc<Dispatch>) -> Self {
        Self {
            conn,
            parser: Parser::new(&shared.req_limits),
            spill: Vec::new(),
            shared,
        }
    }

    /// Serves the connection to completion.
    pub(crate) async fn run(mut self) {
        let opened = Instant::now();
        let limits = self.shared.conn_limits.clone();
        let mut served = 0;

        loop {
            let last =
                served + 1 >= limits.max_requests || opened.elapsed() >= limits.lifetime;

            match self.serve_one(last).await {
                Ok(true) if !last => served += 1,
                Ok(_) => break,
                Err(close) => {
                    debug!("closing connection: {close}");
                    break;
                }
            }
        }
    }

    /// Reads, dispatches, and answers a single request. `Ok(true)`
    /// means the connection persists for another round.
    async fn serve_one(&mut self, last: bool) -> Result<bool, Close> {
        self.parser.reset();
        self.conn
            .set_read_deadline(Some(Instant::now() + self.shared.conn_limits.read_deadline));

        // Fill until the head terminator is in the buffer. A head that
        // does not fit the buffer is over limit, not incomplete.
        let head_at = loop {
            if let Some(at) = find_blank_line(self.parser.filled()) {
                break at;
            }
            if self.parser.is_full() {
                return Err(Close::Malformed(ParseError::InvalidHeader));
            }

            let n = match self.conn.read_some(self.parser.spare()).await {
                Ok(n) => n,
                // nothing started yet, the peer just went quiet
                Err(IoFailure::TimedOut) if self.parser.filled().is_empty() => {
                    return Ok(false)
                }
                Err(err) => return Err(Close::Io(err)),
            };
            if n == 0 {
                if self.parser.filled().is_empty() {
                    return Ok(false);
                }
                return Err(Close::Io(IoFailure::Eof));
            }
            self.parser.advance(n);
        };
        let received = Instant::now();

        let line = RequestLine::parse(self.parser.filled(), &self.shared.req_limits)
            .map_err(Close::Malformed)?;

        let head_end = head_at + 2;
        if head_end < line.end {
            return Err(Close::Malformed(ParseError::InvalidHeader));
        }

        if !line.version.is_served() {
            self.conn
                .write_all(Fallback::VersionNotSupported.as_http(line.version))
                .await
                .map_err(Close::Io)?;
            return Ok(false);
        }

        // Headers are parsed eagerly here: body framing needs
        // content-length before the request can be handed out.
        let filled = self.parser.filled();
        let headers = HeaderMap::parse(&filled[line.end..head_end], &self.shared.req_limits)
            .map_err(Close::Malformed)?;

        let expected = headers.content_length.unwrap_or(0);
        if expected > self.shared.req_limits.body_size {
            return Err(Close::Malformed(ParseError::BodyTooLarge));
        }

        let inline = &filled[head_at + 4..];
        let body: &[u8] = if expected <= inline.len() {
            if expected < inline.len() {
                return Err(Close::Malformed(ParseError::BodyMismatch {
                    expected,
                    available: inline.len(),
                }));
            }
            inline
        } else {
            self.spill.clear();
            self.spill.extend_from_slice(inline);
            self.spill.resize(expected, 0);
            self.conn
                .read_full(&mut self.spill[inline.len()..])
                .await
                .map_err(Close::Io)?;
            &self.spill
        };
        self.conn.set_read_deadline(None);

        let path = line.path_str(filled).map_err(Close::Malformed)?;
        let request = Request::from_parts(
            filled,
            line,
            head_end,
            path,
            body,
            Some(headers),
            &self.shared.req_limits,
        );

        let mut response = Response::new(request.version());
        response.stamp_received(received);

        match self
            .shared
            .router
            .resolve(request.method(), request.version(), request.path())
        {
            Resolution::Fixed(wire) => {
                self.conn.write_all(&wire).await.map_err(Close::Io)?;
                return Ok(request.keep_alive() && !last);
            }
            Resolution::Dynamic { route, params } => {
                for (name, value) in params {
                    response.bind_param(name, &value);
                }
                response.stamp_loaded();

                let stopped = run_chain(
                    self.shared.router.middleware_chain(),
                    &request,
                    &mut response,
                );
                if !stopped {
                    // a dynamic route always carries a handler
                    if let Some(handler) = route.handler() {
                        if let Err(err) = handler.handle(&request, &mut response).await {
                            warn!("handler failed on {}: {err}", request.path());
                            return answer_failure(&mut self.conn, &self.shared, &request, received)
                                .await;
                        }
                    }
                }
            }
            Resolution::NotFound(Some(handler)) => {
                response.stamp_loaded();
                let stopped = run_chain(
                    self.shared.router.middleware_chain(),
                    &request,
                    &mut response,
                );
                if !stopped {
                    if let Err(err) = handler.handle(&request, &mut response).await {
                        warn!("not-found responder failed on {}: {err}", request.path());
                        return answer_failure(&mut self.conn, &self.shared, &request, received)
                            .await;
                    }
                }
            }
            Resolution::NotFound(None) => {
                self.conn
                    .write_all(Fallback::NotFound.as_http(request.version()))
                    .await
                    .map_err(Close::Io)?;
                return Ok(false);
            }
        }

        response.stamp_processed();
        if !request.keep_alive() || last {
            response.keep_alive = false;
        }

        if response.is_stream() {
            let head = response.serialize_head();
            self.conn.write_all(&head).await.map_err(Close::Io)?;

            if let Some(mut source) = response.take_stream() {
                let mut wire = Vec::new();
                while let Some(chunk) = source.next_chunk() {
                    // a zero-length chunk on the wire would terminate
                    if chunk.is_empty() {
                        continue;
                    }
                    wire.clear();
                    encode_chunk(&mut wire, &chunk);
                    self.conn.write_all(&wire).await.map_err(Close::Io)?;
                }
            }
            self.conn
                .write_all(CHUNK_TERMINATOR)
                .await
                .map_err(Close::Io)?;
        } else {
            let wire = response.serialize();
            if wire.len() > self.shared.resp_limits.max_size {
                warn!(
                    "response for {} exceeds the size cap ({} bytes)",
                    request.path(),
                    wire.len()
                );
                return answer_failure(&mut self.conn, &self.shared, &request, received).await;
            }
            self.conn.write_all(&wire).await.map_err(Close::Io)?;
        }

        Ok(response.keep_alive)
    }
}

/// Renders the configured error responder, or the built-in 500.
/// Either way this request's connection closes.
async fn answer_failure(
    conn: &mut Connection,
    shared: &Dispatch,
    request: &Request<'_>,
    received: Instant,
) -> Result<bool, Close> {
    if let Some(responder) = shared.router.error_handler().cloned() {
        let mut response = Response::new(request.version());
        response.stamp_received(received);
        response.stamp_loaded();

        if responder.handle(request, &mut response).await.is_ok() {
            response.stamp_processed();
            response.close();

            if !response.is_stream() {
                let wire = response.serialize();
                if wire.len() <= shared.resp_limits.max_size {
                    conn.write_all(&wire).await.map_err(Close::Io)?;
                    return Ok(false);
                }
            }
        }
        warn!("error responder failed, replying with the built-in 500");
    }

    conn.write_all(Fallback::HandlerFailed.as_http(request.version()))
        .await
        .map_err(Close::Io)?;
    Ok(false)
}

fn run_chain(chain: &[Arc<dyn Middleware>], req: &Request<'_>, resp: &mut Response) -> bool {
    for mw in chain {
        if !mw.applies(req) {
            continue;
        }
        if mw.handle(req, resp) == Flow::Stop {
            return true;
        }
    }
    false
}
