//! Listener setup and bounded connection I/O.

use crate::errors::SetupError;
use crate::limits::ListenerLimits;
use crate::net::reactor::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Builds the nonblocking listener socket.
///
/// Always binds a dual-stack IPv6 socket; IPv4 bind addresses are
/// mapped so one socket serves both families.
pub(crate) fn bind_listener(limits: &ListenerLimits) -> Result<std::net::TcpListener, SetupError> {
    let socket =
        Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).map_err(SetupError::Listener)?;

    socket.set_only_v6(false).map_err(SetupError::Listener)?;
    if limits.reuse_address {
        socket.set_reuse_address(true).map_err(SetupError::Listener)?;
    }
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if limits.reuse_port {
        socket.set_reuse_port(true).map_err(SetupError::Listener)?;
    }
    // broken pipes surface as write errors instead of signals
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true).map_err(SetupError::Listener)?;

    let addr = match limits.addr {
        IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
        v6 => v6,
    };
    let addr = SocketAddr::new(addr, limits.port);

    socket.bind(&addr.into()).map_err(SetupError::Listener)?;
    socket
        .listen(limits.backlog.min(ListenerLimits::MAX_BACKLOG) as i32)
        .map_err(SetupError::Listener)?;
    socket.set_nonblocking(true).map_err(SetupError::Listener)?;

    Ok(socket.into())
}

/// Why a connection's I/O stopped.
#[derive(Debug)]
pub(crate) enum IoFailure {
    /// Peer closed mid-operation.
    Eof,
    /// The idle read deadline expired.
    TimedOut,
    /// Server shutdown observed between partial operations.
    Cancelled,
    Hard(io::Error),
}

impl fmt::Display for IoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "peer closed the connection"),
            Self::TimedOut => write!(f, "read deadline expired"),
            Self::Cancelled => write!(f, "server shutting down"),
            Self::Hard(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<io::Error> for IoFailure {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => Self::TimedOut,
            io::ErrorKind::UnexpectedEof => Self::Eof,
            _ => Self::Hard(err),
        }
    }
}

/// One accepted connection: the reactor-backed stream plus cooperative
/// cancellation. All loops re-check the cancel flag between partial
/// operations, never inside one.
pub(crate) struct Connection {
    stream: TcpStream,
    cancel: Arc<AtomicBool>,
    /// Slice bound for body reads and response writes.
    chunk: usize,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, cancel: Arc<AtomicBool>, chunk: usize) -> Self {
        Self {
            stream,
            cancel,
            chunk: chunk.max(1),
        }
    }

    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.stream.set_read_deadline(deadline);
    }

    /// One read, however much the socket has. `Ok(0)` is a clean EOF.
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize, IoFailure> {
        self.check_cancel()?;
        Ok(self.stream.read(buf).await?)
    }

    /// Fills `buf` completely, reading in chunk-sized slices. EOF
    /// before the buffer fills is an error, never retried.
    pub(crate) async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), IoFailure> {
        let mut at = 0;
        while at < buf.len() {
            self.check_cancel()?;

            let end = (at + self.chunk).min(buf.len());
            let n = self.stream.read(&mut buf[at..end]).await?;
            if n == 0 {
                return Err(IoFailure::Eof);
            }
            at += n;
        }

        Ok(())
    }

    /// Writes all of `data` in chunk-sized slices.
    pub(crate) async fn write_all(&mut self, mut data: &[u8]) -> Result<(), IoFailure> {
        while !data.is_empty() {
            self.check_cancel()?;

            let end = data.len().min(self.chunk);
            let n = self.stream.write(&data[..end]).await?;
            if n == 0 {
                return Err(IoFailure::Eof);
            }
            data = &data[n..];
        }

        Ok(())
    }

    #[inline(always)]
    fn check_cancel(&self) -> Result<(), IoFailure> {
        match self.cancel.load(Ordering::Acquire) {
            true => Err(IoFailure::Cancelled),
            false => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Parker;
    use crate::limits::ServerLimits;
    use crate::net::reactor::Reactor;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn reactor_pair() -> (Reactor, Arc<AtomicBool>) {
        let cancel = Arc::new(AtomicBool::new(false));
        let limits = ServerLimits {
            shards: 1,
            poll_timeout: Duration::from_millis(20),
            ..ServerLimits::default()
        };
        (Reactor::new(&limits, cancel.clone()).unwrap(), cancel)
    }

    #[test]
    fn binds_ephemeral_port() {
        let limits = ListenerLimits {
            port: 0,
            ..ListenerLimits::default()
        };

        let listener = bind_listener(&limits).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn chunked_write_arrives_whole() {
        let (reactor, cancel) = reactor_pair();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).unwrap();
            received
        });

        let stream = reactor
            .register(std::net::TcpStream::connect(addr).unwrap())
            .unwrap();
        let mut conn = Connection::new(stream, cancel.clone(), 8);

        let payload: Vec<u8> = (0..100u8).cycle().take(1000).collect();
        let sent = payload.clone();

        let parker = Parker::new();
        parker.block_on(async move {
            conn.write_all(&payload).await.unwrap();
            // conn drops here, closing the socket
        });

        assert_eq!(peer.join().unwrap(), sent);

        cancel.store(true, Ordering::Release);
        reactor.shutdown();
    }

    #[test]
    fn eof_mid_fill_is_an_error() {
        let (reactor, cancel) = reactor_pair();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"short").unwrap();
            // drop closes before the requested 16 bytes arrive
        });

        let stream = reactor
            .register(std::net::TcpStream::connect(addr).unwrap())
            .unwrap();
        let mut conn = Connection::new(stream, cancel.clone(), 4);

        let parker = Parker::new();
        let result = parker.block_on(async {
            let mut buf = [0u8; 16];
            conn.read_full(&mut buf).await
        });

        assert!(matches!(result, Err(IoFailure::Eof)));
        peer.join().unwrap();

        cancel.store(true, Ordering::Release);
        reactor.shutdown();
    }

    #[test]
    fn cancellation_stops_io() {
        let (reactor, cancel) = reactor_pair();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = reactor
            .register(std::net::TcpStream::connect(addr).unwrap())
            .unwrap();
        let _accepted = listener.accept().unwrap();
        let mut conn = Connection::new(stream, cancel.clone(), 4);

        cancel.store(true, Ordering::Release);

        let parker = Parker::new();
        let result = parker.block_on(async {
            let mut buf = [0u8; 4];
            conn.read_some(&mut buf).await
        });

        assert!(matches!(result, Err(IoFailure::Cancelled)));
        reactor.shutdown();
    }
}
