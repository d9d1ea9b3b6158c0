//! Zero-copy request parsing over a fixed-capacity buffer.
//!
//! The request line is parsed eagerly; headers and query parameters are
//! parsed on first access and memoized. All parsed views borrow the
//! parser buffer, nothing is copied until a value must outlive the
//! request (parameter binding does that explicitly).

use crate::errors::ParseError;
use crate::http::query;
use crate::http::types::{slice_to_usize, Method, Version};
use crate::limits::ReqLimits;
use memchr::{memchr, memchr2, memchr_iter, memmem};
use once_cell::sync::OnceCell;

/// Fixed-capacity input buffer for one connection.
///
/// Sized once from [ReqLimits] at accept time and reused for every
/// request on the connection.
pub(crate) struct Parser {
    buffer: Box<[u8]>,
    len: usize,
}

impl Parser {
    pub(crate) fn new(limits: &ReqLimits) -> Self {
        debug_assert!(limits.precalc.buffer > 0, "limits not precalculated");

        Self {
            buffer: vec![0; limits.precalc.buffer].into_boxed_slice(),
            len: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn reset(&mut self) {
        self.len = 0;
    }

    #[inline(always)]
    pub(crate) fn filled(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    #[inline(always)]
    pub(crate) fn spare(&mut self) -> &mut [u8] {
        &mut self.buffer[self.len..]
    }

    #[inline(always)]
    pub(crate) fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.buffer.len());
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.len == self.buffer.len()
    }
}

/// Byte range inside the parser buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Span {
    pub(crate) start: usize,
    pub(crate) end: usize,
}

impl Span {
    #[inline(always)]
    pub(crate) fn of<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// Returns the index of the `\r\n\r\n` terminating the request head.
#[inline(always)]
pub(crate) fn find_blank_line(buf: &[u8]) -> Option<usize> {
    memmem::find(buf, b"\r\n\r\n")
}

/// Parsed request line. Spans index into the buffer it was parsed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub(crate) method: Method,
    pub(crate) version: Version,
    pub(crate) target: Span,
    pub(crate) path: Span,
    pub(crate) query: Option<Span>,
    /// Offset just past the request line CRLF.
    pub(crate) end: usize,
}

impl RequestLine {
    /// Parses `METHOD SP /path[?query] SP HTTP/x.y CRLF`.
    ///
    /// Only scans within the precalculated first-line window: a line that
    /// does not terminate inside it is over limit, not incomplete.
    pub(crate) fn parse(buf: &[u8], limits: &ReqLimits) -> Result<Self, ParseError> {
        let window = &buf[..buf.len().min(limits.precalc.first_line)];

        let (method, path_start) = Method::from_bytes(window)?;
        if window.get(path_start) != Some(&b'/') {
            return Err(ParseError::InvalidTarget);
        }

        let from_path = &window[path_start..];
        let rel = match memchr2(b' ', b'?', from_path) {
            Some(rel) => rel,
            None if window.len() == limits.precalc.first_line => {
                return Err(ParseError::TargetTooLong)
            }
            None => return Err(ParseError::InvalidTarget),
        };

        let path_end = path_start + rel;
        let (query, version_at) = match window[path_end] {
            b'?' => {
                let q_start = path_end + 1;
                let q_rel = match memchr(b' ', &window[q_start..]) {
                    Some(rel) => rel,
                    None if window.len() == limits.precalc.first_line => {
                        return Err(ParseError::TargetTooLong)
                    }
                    None => return Err(ParseError::InvalidTarget),
                };

                let span = Span {
                    start: q_start,
                    end: q_start + q_rel,
                };
                (Some(span), span.end + 1)
            }
            _ => (None, path_end + 1),
        };

        let target = Span {
            start: path_start,
            end: version_at - 1,
        };
        if target.end - target.start > limits.target_size {
            return Err(ParseError::TargetTooLong);
        }

        let path = Span {
            start: path_start,
            end: path_end,
        };
        let slashes = memchr_iter(b'/', path.of(window)).count();
        if slashes > limits.path_segments {
            return Err(ParseError::TooManySegments);
        }

        let version = Version::from_token(&buf[version_at..])?;

        let crlf = version_at + Version::TOKEN_LEN;
        if buf.get(crlf..crlf + 2) != Some(b"\r\n") {
            return Err(ParseError::InvalidVersion);
        }

        Ok(Self {
            method,
            version,
            target,
            path,
            query,
            end: crlf + 2,
        })
    }

    /// The path as UTF-8, validated here so downstream code stays on `&str`.
    #[inline(always)]
    pub(crate) fn path_str<'a>(&self, buf: &'a [u8]) -> Result<&'a str, ParseError> {
        simdutf8::basic::from_utf8(self.path.of(buf)).map_err(|_| ParseError::InvalidEncoding)
    }
}

/// Headers parsed from the request head. Values borrow the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct HeaderMap<'b> {
    entries: Vec<(&'b [u8], &'b [u8])>,
    pub(crate) content_length: Option<usize>,
    /// Explicit `connection: keep-alive` / `close`, when present.
    pub(crate) keep_alive: Option<bool>,
}

impl<'b> HeaderMap<'b> {
    /// Parses `name: value` CRLF lines. `head` must cover exactly the
    /// header block, request line and blank line excluded.
    pub(crate) fn parse(head: &'b [u8], limits: &ReqLimits) -> Result<Self, ParseError> {
        simdutf8::basic::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;

        let mut map = Self {
            entries: Vec::with_capacity(limits.header_count.min(16)),
            content_length: None,
            keep_alive: None,
        };

        let mut start = 0;
        for nl in memchr_iter(b'\n', head) {
            if nl == 0 || head[nl - 1] != b'\r' {
                return Err(ParseError::InvalidHeader);
            }
            if map.entries.len() >= limits.header_count {
                return Err(ParseError::TooManyHeaders);
            }

            let line = &head[start..nl - 1];
            let colon = memchr(b':', line).ok_or(ParseError::InvalidHeader)?;

            let name = &line[..colon];
            if name.is_empty() || name.len() > limits.header_name_size {
                return Err(ParseError::InvalidHeader);
            }

            let mut value = &line[colon + 1..];
            while let [b' ' | b'\t', rest @ ..] = value {
                value = rest;
            }
            if value.len() > limits.header_value_size {
                return Err(ParseError::InvalidHeader);
            }

            if name.eq_ignore_ascii_case(b"content-length") {
                map.content_length =
                    Some(slice_to_usize(value).ok_or(ParseError::InvalidContentLength)?);
            } else if name.eq_ignore_ascii_case(b"connection") {
                if value.eq_ignore_ascii_case(b"keep-alive") {
                    map.keep_alive = Some(true);
                } else if value.eq_ignore_ascii_case(b"close") {
                    map.keep_alive = Some(false);
                }
            }

            map.entries.push((name, value));
            start = nl + 1;
        }

        // bytes after the last CRLF would be a line without a terminator
        if start != head.len() {
            return Err(ParseError::InvalidHeader);
        }

        Ok(map)
    }

    #[inline(always)]
    pub(crate) fn get(&self, name: &[u8]) -> Option<&'b [u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|&(_, v)| v)
    }

    #[inline(always)]
    pub(crate) fn entries(&self) -> &[(&'b [u8], &'b [u8])] {
        &self.entries
    }
}

/// One parsed request. Borrows the connection's parser buffer.
pub struct Request<'b> {
    buf: &'b [u8],
    line: RequestLine,
    /// Offset just past the final header CRLF (start of the blank line).
    head_end: usize,
    path: &'b str,
    /// Complete body: inline buffer remainder, or the connection's spill
    /// buffer when the body exceeded the initial read.
    body: &'b [u8],
    headers: OnceCell<Result<HeaderMap<'b>, ParseError>>,
    query_pairs: OnceCell<Result<Vec<(&'b [u8], &'b [u8])>, ParseError>>,
    limits: &'b ReqLimits,
}

impl<'b> Request<'b> {
    pub(crate) fn from_parts(
        buf: &'b [u8],
        line: RequestLine,
        head_end: usize,
        path: &'b str,
        body: &'b [u8],
        headers: Option<HeaderMap<'b>>,
        limits: &'b ReqLimits,
    ) -> Self {
        let cell = match headers {
            Some(map) => OnceCell::with_value(Ok(map)),
            None => OnceCell::new(),
        };

        Self {
            buf,
            line,
            head_end,
            path,
            body,
            headers: cell,
            query_pairs: OnceCell::new(),
            limits,
        }
    }

    /// Parses a complete in-buffer request. Headers stay lazy.
    ///
    /// The body is whatever follows the blank line; the caller is
    /// responsible for length-checking it against `content-length`.
    pub(crate) fn from_bytes(buf: &'b [u8], limits: &'b ReqLimits) -> Result<Self, ParseError> {
        let line = RequestLine::parse(buf, limits)?;

        let blank = find_blank_line(buf).ok_or(ParseError::InvalidHeader)?;
        let head_end = blank + 2;
        if head_end < line.end {
            return Err(ParseError::InvalidHeader);
        }

        let path = line.path_str(buf)?;
        let body = &buf[head_end + 2..];

        Ok(Self::from_parts(buf, line, head_end, path, body, None, limits))
    }

    #[inline(always)]
    pub fn method(&self) -> Method {
        self.line.method
    }

    #[inline(always)]
    pub fn version(&self) -> Version {
        self.line.version
    }

    /// Path and query exactly as they appeared on the wire.
    #[inline(always)]
    pub fn target(&self) -> &'b [u8] {
        self.line.target.of(self.buf)
    }

    #[inline(always)]
    pub fn path(&self) -> &'b str {
        self.path
    }

    /// Raw query string without the leading `?`, if any.
    #[inline(always)]
    pub fn query(&self) -> Option<&'b [u8]> {
        self.line.query.as_ref().map(|span| span.of(self.buf))
    }

    /// All headers in wire order. First access parses and memoizes.
    pub fn headers(&self) -> Result<&[(&'b [u8], &'b [u8])], ParseError> {
        match self.header_map() {
            Ok(map) => Ok(map.entries()),
            Err(err) => Err(err),
        }
    }

    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &[u8]) -> Result<Option<&'b [u8]>, ParseError> {
        Ok(self.header_map()?.get(name))
    }

    /// Declared `content-length`, `0` when absent.
    pub fn content_length(&self) -> Result<usize, ParseError> {
        Ok(self.header_map()?.content_length.unwrap_or(0))
    }

    /// Whether the connection should persist after this request.
    ///
    /// An explicit `connection` header wins; otherwise the version
    /// default applies. An unparseable header block closes.
    pub fn keep_alive(&self) -> bool {
        match self.header_map() {
            Ok(map) => map
                .keep_alive
                .unwrap_or_else(|| self.line.version.default_keep_alive()),
            Err(_) => false,
        }
    }

    /// Query parameters in wire order. First access parses and memoizes.
    pub fn query_pairs(&self) -> Result<&[(&'b [u8], &'b [u8])], ParseError> {
        let pairs = self.query_pairs.get_or_init(|| {
            match self.query() {
                Some(raw) => query::parse_pairs(raw, self.limits.query_pairs),
                None => Ok(Vec::new()),
            }
        });

        match pairs {
            Ok(pairs) => Ok(pairs),
            Err(err) => Err(err.clone()),
        }
    }

    /// First value for the given query key.
    pub fn query_value(&self, key: &[u8]) -> Result<Option<&'b [u8]>, ParseError> {
        Ok(self
            .query_pairs()?
            .iter()
            .find(|&&(k, _)| k == key)
            .map(|&(_, v)| v))
    }

    /// The complete body as one slice.
    #[inline(always)]
    pub fn body(&self) -> &'b [u8] {
        self.body
    }

    /// The body in fixed-size chunks; the marker is `true` on the final
    /// (possibly short) chunk.
    pub fn body_chunks(&self) -> BodyChunks<'b> {
        BodyChunks {
            rest: self.body,
            chunk: self.limits.body_chunk.max(1),
        }
    }

    fn header_map(&self) -> Result<&HeaderMap<'b>, ParseError> {
        let parsed = self.headers.get_or_init(|| {
            HeaderMap::parse(&self.buf[self.line.end..self.head_end], self.limits)
        });

        match parsed {
            Ok(map) => Ok(map),
            Err(err) => Err(err.clone()),
        }
    }
}

/// Fixed-size view iterator over a request body.
pub struct BodyChunks<'b> {
    rest: &'b [u8],
    chunk: usize,
}

impl<'b> Iterator for BodyChunks<'b> {
    /// `(chunk, is_last)`
    type Item = (&'b [u8], bool);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }

        let take = self.chunk.min(self.rest.len());
        let (chunk, rest) = self.rest.split_at(take);
        self.rest = rest;

        Some((chunk, rest.is_empty()))
    }
}
