//! Server assembly: listener, acceptor thread, reactor, worker pool.

use crate::errors::SetupError;
use crate::executor::Executor;
use crate::limits::{ConnLimits, ListenerLimits, ReqLimits, RespLimits, ServerLimits};
use crate::net::reactor::Reactor;
use crate::net::socket::{bind_listener, Connection};
use crate::route::router::Router;
use crate::server::connection::{Dispatch, HttpConnection};
use log::{debug, error, info, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const LISTENER: Token = Token(0);
const WAKE: Token = Token(1);

/// A configured server, ready to start.
///
/// # Examples
///
/// ```no_run
/// use shard_web::{Method, Response, Route, Router, Server, StatusCode, Version};
///
/// let mut hello = Response::new(Version::Http11);
/// hello.status(StatusCode::Ok).body("hello");
///
/// let mut router = Router::new();
/// router
///     .route(Route::fixed(Method::Get, Version::Http11, "/hello", true, hello).unwrap())
///     .unwrap();
///
/// let handle = Server::builder(router).build().run().unwrap();
/// // ... serve until told otherwise ...
/// handle.shutdown();
/// ```
pub struct Server {
    router: Router,
    listener_limits: ListenerLimits,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl Server {
    /// Starts configuring a server around a finished dispatch table.
    pub fn builder(router: Router) -> ServerBuilder {
        ServerBuilder {
            router,
            listener_limits: ListenerLimits::default(),
            server_limits: ServerLimits::default(),
            conn_limits: ConnLimits::default(),
            req_limits: ReqLimits::default(),
            resp_limits: RespLimits::default(),
        }
    }

    /// Binds the listener, starts the reactor shards, the worker pool,
    /// and the acceptor thread, then returns without blocking.
    ///
    /// This is the only point where a failure is fatal; once the handle
    /// is returned, connection-level problems never stop the server.
    pub fn run(self) -> Result<ServerHandle, SetupError> {
        let req_limits = self.req_limits.precalculate();

        let listener = bind_listener(&self.listener_limits)?;
        let local_addr = listener.local_addr().map_err(SetupError::Listener)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let reactor = Arc::new(Reactor::new(&self.server_limits, cancel.clone())?);
        let executor = Executor::new(
            self.server_limits.worker_count(),
            self.server_limits.worker_keep_alive,
        );

        let shared = Arc::new(Dispatch {
            router: self.router,
            conn_limits: self.conn_limits,
            req_limits,
            resp_limits: self.resp_limits,
        });

        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(err) => {
                cancel.store(true, Ordering::Release);
                reactor.shutdown();
                return Err(SetupError::Acceptor(err));
            }
        };
        let setup = Waker::new(poll.registry(), WAKE).and_then(|waker| {
            poll.registry()
                .register(&mut SourceFd(&listener.as_raw_fd()), LISTENER, Interest::READABLE)
                .map(|_| waker)
        });
        let waker = match setup {
            Ok(waker) => waker,
            Err(err) => {
                cancel.store(true, Ordering::Release);
                reactor.shutdown();
                return Err(SetupError::Acceptor(err));
            }
        };

        info!(
            "listening on {local_addr}, {} routes, {} shards",
            shared.router.route_count(),
            self.server_limits.shard_count(),
        );

        let nodelay = self.listener_limits.nodelay;
        let spawned = {
            let reactor = reactor.clone();
            let cancel = cancel.clone();
            let shared = shared.clone();
            thread::Builder::new().name("acceptor".to_owned()).spawn(move || {
                acceptor_loop(listener, poll, reactor, executor, shared, cancel, nodelay)
            })
        };
        let acceptor = match spawned {
            Ok(join) => join,
            Err(err) => {
                cancel.store(true, Ordering::Release);
                reactor.shutdown();
                return Err(SetupError::Acceptor(err));
            }
        };

        Ok(ServerHandle {
            cancel,
            waker,
            acceptor,
            reactor,
            local_addr,
        })
    }
}

/// Builder over the server's limit sets. Every limit has a default;
/// only the router is mandatory, and it is taken up front.
pub struct ServerBuilder {
    router: Router,
    listener_limits: ListenerLimits,
    server_limits: ServerLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,
    resp_limits: RespLimits,
}

impl ServerBuilder {
    /// Bind address, port, backlog, and socket options.
    pub fn listener_limits(mut self, limits: ListenerLimits) -> Self {
        self.listener_limits = limits;
        self
    }

    /// Shard and worker pool sizing.
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = limits;
        self
    }

    /// Per-connection deadlines and request caps.
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.conn_limits = limits;
        self
    }

    /// Request parsing limits. The parse buffer is sized from these
    /// once at startup.
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.req_limits = limits;
        self
    }

    /// Response size cap.
    pub fn response_limits(mut self, limits: RespLimits) -> Self {
        self.resp_limits = limits;
        self
    }

    pub fn build(self) -> Server {
        Server {
            router: self.router,
            listener_limits: self.listener_limits,
            server_limits: self.server_limits,
            conn_limits: self.conn_limits,
            req_limits: self.req_limits,
            resp_limits: self.resp_limits,
        }
    }
}

/// Control handle for a running server.
pub struct ServerHandle {
    cancel: Arc<AtomicBool>,
    waker: Waker,
    acceptor: JoinHandle<()>,
    reactor: Arc<Reactor>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// The bound address, useful when the port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, cancels in-flight connections cooperatively,
    /// and joins every server thread.
    pub fn shutdown(self) {
        self.cancel.store(true, Ordering::Release);

        if let Err(err) = self.waker.wake() {
            warn!("acceptor wake failed: {err}");
        }
        if self.acceptor.join().is_err() {
            error!("acceptor thread panicked");
        }

        self.reactor.shutdown();
        info!("server stopped");
    }
}

fn acceptor_loop(
    listener: std::net::TcpListener,
    mut poll: Poll,
    reactor: Arc<Reactor>,
    executor: Executor,
    shared: Arc<Dispatch>,
    cancel: Arc<AtomicBool>,
    nodelay: bool,
) {
    let fd = listener.as_raw_fd();
    let mut events = Events::with_capacity(64);

    loop {
        if cancel.load(Ordering::Acquire) {
            break;
        }

        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("acceptor poll failed: {err}");
            continue;
        }

        for event in events.iter() {
            // WAKE only interrupts the poll; cancel is re-checked above
            if event.token() == LISTENER {
                accept_ready(&listener, &reactor, &executor, &shared, &cancel, nodelay);
            }
        }
    }

    if let Err(err) = poll.registry().deregister(&mut SourceFd(&fd)) {
        debug!("listener deregister failed: {err}");
    }
    debug!("acceptor stopped");
}

/// Drains the accept queue. One bad connection is dropped and logged,
/// never propagated.
fn accept_ready(
    listener: &std::net::TcpListener,
    reactor: &Arc<Reactor>,
    executor: &Executor,
    shared: &Arc<Dispatch>,
    cancel: &Arc<AtomicBool>,
    nodelay: bool,
) {
    loop {
        let (stream, addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!("accept failed: {err}");
                break;
            }
        };

        if nodelay {
            if let Err(err) = stream.set_nodelay(true) {
                debug!("nodelay on {addr} failed: {err}");
            }
        }

        match reactor.register(stream) {
            Ok(stream) => {
                let conn = Connection::new(stream, cancel.clone(), shared.req_limits.body_chunk);
                executor.spawn(HttpConnection::new(conn, shared.clone()).run());
            }
            Err(err) => warn!("dropping connection from {addr}: {err}"),
        }
    }
}
