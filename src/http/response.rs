//! Response construction and wire serialization.
//!
//! A [Response] accumulates structure (status, headers, cookies, body,
//! bound route parameters) and serializes in one pass into a single
//! contiguous buffer pre-sized to the exact byte total, so the write
//! path never reallocates. Streamed bodies go out as chunked
//! transfer-encoding instead.

use crate::http::types::{StatusCode, Version};
use std::mem;
use std::sync::Arc;
use std::time::Instant;

/// Pull-based source for a streamed response body.
///
/// Returning `None` ends the stream; the writer then emits the
/// zero-length terminating chunk.
pub trait ChunkSource: Send {
    fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

impl<F: FnMut() -> Option<Vec<u8>> + Send> ChunkSource for F {
    fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self()
    }
}

/// Response payload.
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    Stream(Box<dyn ChunkSource>),
}

impl Body {
    #[inline(always)]
    fn bytes(&self) -> &[u8] {
        match self {
            Body::Bytes(bytes) => bytes,
            _ => b"",
        }
    }
}

/// One HTTP response under construction.
///
/// Created by the server per request and handed to middleware and the
/// handler; also constructed directly when precomputing fixed routes.
pub struct Response {
    pub(crate) version: Version,
    status: StatusCode,
    headers: Vec<(Box<str>, Box<str>)>,
    cookies: Vec<Box<str>>,
    content_type: Option<(Box<str>, Option<Box<str>>)>,
    body: Body,
    params: Vec<(Arc<str>, Box<str>)>,
    /// Free-form per-request storage, passed along the middleware chain
    /// into the handler. Never serialized.
    extensions: Vec<(Box<str>, Box<str>)>,
    pub(crate) keep_alive: bool,

    received: Option<Instant>,
    loaded: Option<Instant>,
    processed: Option<Instant>,
}

impl Response {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            status: StatusCode::Ok,
            headers: Vec::new(),
            cookies: Vec::new(),
            content_type: None,
            body: Body::Empty,
            params: Vec::new(),
            extensions: Vec::new(),
            keep_alive: true,
            received: None,
            loaded: None,
            processed: None,
        }
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    /// Appends a header. Emission order is insertion order; names are
    /// not deduplicated.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers
            .push((name.into().into_boxed_str(), value.into().into_boxed_str()));
        self
    }

    /// Appends a `set-cookie` line. One line per call, after the
    /// regular headers.
    pub fn cookie(&mut self, value: impl Into<String>) -> &mut Self {
        self.cookies.push(value.into().into_boxed_str());
        self
    }

    pub fn content_type(
        &mut self,
        media: impl Into<String>,
        charset: Option<&str>,
    ) -> &mut Self {
        self.content_type = Some((
            media.into().into_boxed_str(),
            charset.map(|c| c.to_owned().into_boxed_str()),
        ));
        self
    }

    pub fn body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = Body::Bytes(body.into());
        self
    }

    /// Replaces the body with a streamed source. The response goes out
    /// with `transfer-encoding: chunked`.
    pub fn stream(&mut self, source: impl ChunkSource + 'static) -> &mut Self {
        self.body = Body::Stream(Box::new(source));
        self
    }

    /// Forces the connection to close after this response.
    pub fn close(&mut self) -> &mut Self {
        self.keep_alive = false;
        self
    }

    // Bound route parameters, in route declaration order.

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v.as_ref())
    }

    pub fn param_at(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|(_, v)| v.as_ref())
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(n, v)| (n.as_ref(), v.as_ref()))
    }

    pub(crate) fn bind_param(&mut self, name: Arc<str>, value: &str) {
        self.params.push((name, value.to_owned().into_boxed_str()));
    }

    // Request-scoped extensions: middleware stores, handlers read.

    /// Stores a value under `key`, replacing any previous one.
    pub fn set_ext(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into().into_boxed_str();
        let value = value.into().into_boxed_str();

        match self.extensions.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.extensions.push((key, value)),
        }
        self
    }

    pub fn ext(&self, key: &str) -> Option<&str> {
        self.extensions
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| v.as_ref())
    }

    // Stage timestamps, stamped by the connection around dispatch.

    /// When the request bytes arrived.
    pub fn received(&self) -> Option<Instant> {
        self.received
    }

    /// When routing finished and the request was bound.
    pub fn loaded(&self) -> Option<Instant> {
        self.loaded
    }

    /// When the handler returned.
    pub fn processed(&self) -> Option<Instant> {
        self.processed
    }

    pub(crate) fn stamp_received(&mut self, at: Instant) {
        self.received = Some(at);
    }

    pub(crate) fn stamp_loaded(&mut self) {
        self.loaded = Some(Instant::now());
    }

    pub(crate) fn stamp_processed(&mut self) {
        self.processed = Some(Instant::now());
    }

    #[inline(always)]
    pub(crate) fn is_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    pub(crate) fn take_stream(&mut self) -> Option<Box<dyn ChunkSource>> {
        match mem::replace(&mut self.body, Body::Empty) {
            Body::Stream(source) => Some(source),
            other => {
                self.body = other;
                None
            }
        }
    }
}

// Serialization

const CONN_KEEP_ALIVE: &[u8] = b"connection: keep-alive\r\n";
const CONN_CLOSE: &[u8] = b"connection: close\r\n";
const SET_COOKIE: &[u8] = b"set-cookie: ";
const CONTENT_TYPE: &[u8] = b"content-type: ";
const CHARSET: &[u8] = b"; charset=";
const CONTENT_LENGTH: &[u8] = b"content-length: ";
const TRANSFER_CHUNKED: &[u8] = b"transfer-encoding: chunked\r\n";
const CRLF: &[u8] = b"\r\n";

pub(crate) const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

impl Response {
    /// Serializes status line, headers, cookies, content metadata, and
    /// body into one buffer allocated at its exact final size.
    ///
    /// Streamed bodies never come through here.
    pub(crate) fn serialize(&self) -> Vec<u8> {
        debug_assert!(!self.is_stream(), "streamed responses use serialize_head");

        let body = self.body.bytes();
        let total = self.head_size() + CONTENT_LENGTH.len() + decimal_len(body.len()) + 2
            + CRLF.len()
            + body.len();

        let mut wire = Vec::with_capacity(total);
        self.write_head(&mut wire);

        wire.extend_from_slice(CONTENT_LENGTH);
        push_decimal(&mut wire, body.len());
        wire.extend_from_slice(CRLF);

        wire.extend_from_slice(CRLF);
        wire.extend_from_slice(body);

        debug_assert_eq!(wire.len(), total);
        wire
    }

    /// Head for a chunked response: same layout, `transfer-encoding`
    /// in place of `content-length`.
    pub(crate) fn serialize_head(&self) -> Vec<u8> {
        let total = self.head_size() + TRANSFER_CHUNKED.len() + CRLF.len();

        let mut wire = Vec::with_capacity(total);
        self.write_head(&mut wire);
        wire.extend_from_slice(TRANSFER_CHUNKED);
        wire.extend_from_slice(CRLF);

        debug_assert_eq!(wire.len(), total);
        wire
    }

    /// Bytes of everything before the framing header (content-length or
    /// transfer-encoding).
    fn head_size(&self) -> usize {
        let conn = match self.keep_alive {
            true => CONN_KEEP_ALIVE,
            false => CONN_CLOSE,
        };

        let mut total = self.status.first_line(self.version).len() + conn.len();

        for (name, value) in &self.headers {
            total += name.len() + 2 + value.len() + 2;
        }
        for cookie in &self.cookies {
            total += SET_COOKIE.len() + cookie.len() + 2;
        }
        if let Some((media, charset)) = &self.content_type {
            total += CONTENT_TYPE.len() + media.len() + 2;
            if let Some(charset) = charset {
                total += CHARSET.len() + charset.len();
            }
        }

        total
    }

    fn write_head(&self, wire: &mut Vec<u8>) {
        wire.extend_from_slice(self.status.first_line(self.version));
        wire.extend_from_slice(match self.keep_alive {
            true => CONN_KEEP_ALIVE,
            false => CONN_CLOSE,
        });

        for (name, value) in &self.headers {
            wire.extend_from_slice(name.as_bytes());
            wire.extend_from_slice(b": ");
            wire.extend_from_slice(value.as_bytes());
            wire.extend_from_slice(CRLF);
        }
        for cookie in &self.cookies {
            wire.extend_from_slice(SET_COOKIE);
            wire.extend_from_slice(cookie.as_bytes());
            wire.extend_from_slice(CRLF);
        }
        if let Some((media, charset)) = &self.content_type {
            wire.extend_from_slice(CONTENT_TYPE);
            wire.extend_from_slice(media.as_bytes());
            if let Some(charset) = charset {
                wire.extend_from_slice(CHARSET);
                wire.extend_from_slice(charset.as_bytes());
            }
            wire.extend_from_slice(CRLF);
        }
    }
}

/// One chunked-encoding frame: hex length, CRLF, payload, CRLF.
pub(crate) fn encode_chunk(wire: &mut Vec<u8>, chunk: &[u8]) {
    push_hex(wire, chunk.len());
    wire.extend_from_slice(CRLF);
    wire.extend_from_slice(chunk);
    wire.extend_from_slice(CRLF);
}

#[inline(always)]
fn decimal_len(mut n: usize) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

fn push_decimal(wire: &mut Vec<u8>, mut n: usize) {
    let mut digits = [0u8; 20];
    let mut at = digits.len();

    loop {
        at -= 1;
        digits[at] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }

    wire.extend_from_slice(&digits[at..]);
}

fn push_hex(wire: &mut Vec<u8>, mut n: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut digits = [0u8; 16];
    let mut at = digits.len();

    loop {
        at -= 1;
        digits[at] = HEX[n % 16];
        n /= 16;
        if n == 0 {
            break;
        }
    }

    wire.extend_from_slice(&digits[at..]);
}
