//! Tunable limits for the listener, connections, requests, and responses.
//!
//! Every struct here implements [Default] with values safe for a public
//! endpoint. Raise them deliberately, not preemptively.

use std::net::{IpAddr, Ipv6Addr};
use std::time::Duration;

/// Listener socket configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerLimits {
    /// Bind address. IPv4 addresses are mapped so a single dual-stack
    /// IPv6 socket serves both families.
    pub addr: IpAddr,
    pub port: u16,

    /// Pending-connection queue length, capped at [ListenerLimits::MAX_BACKLOG].
    pub backlog: u32,

    pub reuse_address: bool,
    /// `SO_REUSEPORT` where the platform has it. Lets several processes
    /// share one port for zero-downtime restarts.
    pub reuse_port: bool,

    /// `TCP_NODELAY` on accepted streams.
    pub nodelay: bool,
}

impl ListenerLimits {
    pub const MAX_BACKLOG: u32 = 1024;
}

impl Default for ListenerLimits {
    fn default() -> Self {
        Self {
            addr: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            port: 8080,
            backlog: 512,
            reuse_address: true,
            reuse_port: false,
            nodelay: true,
        }
    }
}

/// Reactor shard and worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerLimits {
    /// Readiness shards. Connections are pinned to `fd % shards`.
    /// `0` means one shard per logical CPU.
    pub shards: usize,

    /// Upper bound on worker threads running request cycles.
    /// `0` means `cpus * 8`.
    pub workers: usize,

    /// How long an idle worker waits for new tasks before exiting.
    pub worker_keep_alive: Duration,

    /// Event capacity handed to each shard's poll call.
    pub max_events: usize,

    /// Upper bound on a single blocking poll. Bounds how stale the
    /// idle-deadline sweep and the shutdown check can get.
    pub poll_timeout: Duration,
}

impl ServerLimits {
    pub(crate) fn shard_count(&self) -> usize {
        match self.shards {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        match self.workers {
            0 => num_cpus::get().max(1) * 8,
            n => n,
        }
    }
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            shards: 0,
            workers: 0,
            worker_keep_alive: Duration::from_secs(6),
            max_events: 256,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Per-connection lifecycle limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnLimits {
    /// Idle deadline for reading the next request. Expiry closes the
    /// connection between requests, not mid-parse.
    pub read_deadline: Duration,

    /// Keep-alive request cap. The connection closes after serving
    /// this many requests.
    pub max_requests: usize,

    /// Wall-clock cap on a single connection.
    pub lifetime: Duration,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(10),
            max_requests: 1024,
            lifetime: Duration::from_secs(600),
        }
    }
}

/// Request parsing limits.
///
/// [Server::run](crate::Server::run) calls `precalculate` once at startup:
/// it derives the fixed parser buffer size so no per-request sizing happens
/// on the hot path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReqLimits {
    /// Request target (path + query) byte cap.
    pub target_size: usize,
    /// Path segment cap for dynamic matching.
    pub path_segments: usize,
    /// Query parameter cap.
    pub query_pairs: usize,

    pub header_count: usize,
    pub header_name_size: usize,
    pub header_value_size: usize,

    /// Request body byte cap.
    pub body_size: usize,
    /// Read size for body bytes beyond the initial buffer. Also the
    /// chunk size handed out by streamed body access.
    pub body_chunk: usize,

    #[doc(hidden)]
    pub precalc: ReqPrecalc,
}

#[doc(hidden)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReqPrecalc {
    /// Parser buffer: request line + full header block + blank line.
    pub(crate) buffer: usize,
    /// Longest valid request line: method + target + version + CRLF.
    pub(crate) first_line: usize,
}

impl ReqLimits {
    // First line:
    // OPTIONS /url/test?q=1 HTTP/1.1\r\n
    // |-----| |-----------| |--------|
    //  Method    Target      Version
    //
    // Formula: Method(7) + " " + Target + " " + Version(8) + "\r\n"
    pub(crate) fn precalculate(mut self) -> Self {
        self.precalc.first_line = 8 + self.target_size + 10;

        let header_line = self.header_name_size + 2 + self.header_value_size + 2;
        self.precalc.buffer = self.precalc.first_line + self.header_count * header_line + 2;

        self
    }
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            target_size: 2048,
            path_segments: 32,
            query_pairs: 32,
            header_count: 48,
            header_name_size: 64,
            header_value_size: 1024,
            body_size: 1024 * 1024,
            body_chunk: 4096,
            precalc: ReqPrecalc::default(),
        }
    }
}

/// Response serialization limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RespLimits {
    /// Hard cap on a serialized response. Larger bodies must stream.
    pub max_size: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            max_size: 8 * 1024 * 1024,
        }
    }
}
