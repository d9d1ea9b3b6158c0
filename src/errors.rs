use crate::http::types::Version;
use std::{error, fmt, io};
use thiserror::Error;

/// Reasons a request fails to parse.
///
/// Any of these closes the connection without a response: a response
/// cannot be framed without a valid request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    InvalidMethod,

    InvalidTarget,
    TargetTooLong,
    TooManySegments,
    TooManyQueryPairs,

    InvalidVersion,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,
    InvalidEncoding,

    BodyTooLarge,
    BodyMismatch { expected: usize, available: usize },
}

impl error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMethod => write!(f, "invalid request method"),
            Self::InvalidTarget => write!(f, "invalid request target"),
            Self::TargetTooLong => write!(f, "request target over limit"),
            Self::TooManySegments => write!(f, "too many path segments"),
            Self::TooManyQueryPairs => write!(f, "too many query parameters"),
            Self::InvalidVersion => write!(f, "invalid protocol version token"),
            Self::InvalidHeader => write!(f, "invalid header line"),
            Self::TooManyHeaders => write!(f, "too many headers"),
            Self::InvalidContentLength => write!(f, "invalid content-length value"),
            Self::InvalidEncoding => write!(f, "request head is not valid UTF-8"),
            Self::BodyTooLarge => write!(f, "request body over limit"),
            Self::BodyMismatch {
                expected,
                available,
            } => write!(f, "body length mismatch: {expected} declared, {available} read"),
        }
    }
}

/// Built-in wire responses used when no user responder applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fallback {
    NotFound,
    HandlerFailed,
    VersionNotSupported,
}

macro_rules! canned_responses {
    ($($name:ident: $status_code:expr, $len:literal => $json:literal; )*) => {
        pub(crate) const fn as_http(&self, version: Version) -> &'static [u8] {
            match (self, version) { $(
                (Self::$name, Version::Http10) => concat!(
                    "HTTP/1.0 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (Self::$name, Version::Http12) => concat!(
                    "HTTP/1.2 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
                (Self::$name, _) => concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "connection: close\r\n",
                    "content-length: ", $len, "\r\n",
                    "content-type: application/json\r\n",
                    "\r\n",
                    $json
                ),
            )* }.as_bytes()
        }
    };
}

impl Fallback {
    canned_responses! {
        NotFound: "404 Not Found", "47"
            => r#"{"error":"No route matched","code":"NOT_FOUND"}"#;
        HandlerFailed: "500 Internal Server Error", "50"
            => r#"{"error":"Handler failed","code":"HANDLER_FAILED"}"#;
        VersionNotSupported: "505 HTTP Version Not Supported", "67"
            => r#"{"error":"HTTP version not supported","code":"UNSUPPORTED_VERSION"}"#;
    }
}

/// Failure raised by a request handler.
///
/// Caught at the request boundary: the connection renders the configured
/// error responder (or the built-in 500) and keeps running.
#[derive(Debug)]
pub struct HandlerError {
    message: Box<str>,
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into().into_boxed_str(),
        }
    }
}

impl error::Error for HandlerError {}
impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<io::Error> for HandlerError {
    fn from(err: io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::msg(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::msg(message)
    }
}

/// Errors raised while registering routes, groups, or responders.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// A route with the same method, path, version, and case mode already
    /// exists and override was not requested. The table is unchanged.
    #[error("duplicate route: {0}")]
    Duplicate(String),

    #[error("invalid route pattern `{pattern}`: {reason}")]
    InvalidPattern {
        pattern: String,
        reason: &'static str,
    },

    /// A precomputed route was given a response that cannot be rendered
    /// ahead of time (streamed body).
    #[error("route `{0}` cannot precompute a streamed response")]
    Unrenderable(String),
}

/// Fatal startup errors. Everything here aborts `Server::run`.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("listener setup failed: {0}")]
    Listener(io::Error),

    #[error("acceptor setup failed: {0}")]
    Acceptor(io::Error),

    #[error(transparent)]
    Reactor(#[from] ReactorError),

    #[error(transparent)]
    Route(#[from] RegisterError),
}

/// Errors inside the readiness shards.
///
/// After startup these are logged per descriptor and never fatal.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("shard initialization failed: {0}")]
    Init(io::Error),

    #[error("registration failed: {0}")]
    Registration(io::Error),

    #[error("polling failed: {0}")]
    Polling(io::Error),

    #[error("mutex lock poisoned")]
    LockPoisoned,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) type ReactorResult<T> = std::result::Result<T, ReactorError>;
