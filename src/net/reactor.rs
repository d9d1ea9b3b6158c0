//! Sharded readiness reactor.
//!
//! N shards, each owning one `mio::Poll` and one thread. Accepted
//! streams are pinned to `fd % N` and stay there for life. A shard only
//! moves readiness state and wakes tasks; request work never runs on a
//! shard thread. Each shard carries a `mio::Waker` so shutdown can
//! interrupt a blocked poll.

use crate::errors::{ReactorError, ReactorResult};
use crate::limits::ServerLimits;
use log::{debug, warn};
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll as TaskPoll, Waker};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub(crate) mod direction {
    pub(crate) const READ: usize = 0;
    pub(crate) const WRITE: usize = 1;
}

const WAKER_TOKEN: Token = Token(usize::MAX);

/// Per-stream readiness state shared between its shard and its task.
struct Source {
    token: Token,
    interest: Mutex<[Option<Waker>; 2]>,
    triggered: [AtomicBool; 2],
    /// Idle deadline for the next read. Swept by the shard loop.
    deadline: Mutex<Option<Instant>>,
    timed_out: AtomicBool,
}

impl Source {
    fn new(token: Token) -> Self {
        Self {
            token,
            interest: Mutex::new([None, None]),
            triggered: [AtomicBool::new(false), AtomicBool::new(false)],
            deadline: Mutex::new(None),
            timed_out: AtomicBool::new(false),
        }
    }

    fn take_waker(&self, dir: usize) -> Option<Waker> {
        self.interest.lock().ok()?[dir].take()
    }
}

struct Shard {
    registry: Registry,
    waker: mio::Waker,
    sources: Mutex<HashMap<Token, Arc<Source>>>,
    cancel: Arc<AtomicBool>,
}

impl Shard {
    fn run(&self, mut poll: Poll, max_events: usize, poll_timeout: Duration) {
        let mut events = Events::with_capacity(max_events);
        let mut wakers: Vec<Waker> = Vec::new();

        while !self.cancel.load(Ordering::Acquire) {
            if let Err(err) = poll.poll(&mut events, Some(poll_timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("shard poll failed: {err}");
                continue;
            }

            // collect wakers under the lock, wake outside it
            match self.sources.lock() {
                Ok(sources) => {
                    for event in events.iter() {
                        if event.token() == WAKER_TOKEN {
                            continue;
                        }
                        let source = match sources.get(&event.token()) {
                            Some(source) => source,
                            // raced with deregistration, the fd is gone
                            None => continue,
                        };

                        if event.is_readable() {
                            source.triggered[direction::READ].store(true, Ordering::Release);
                            wakers.extend(source.take_waker(direction::READ));
                        }
                        if event.is_writable() {
                            source.triggered[direction::WRITE].store(true, Ordering::Release);
                            wakers.extend(source.take_waker(direction::WRITE));
                        }
                    }

                    let now = Instant::now();
                    for source in sources.values() {
                        let expired = source
                            .deadline
                            .lock()
                            .ok()
                            .and_then(|slot| *slot)
                            .is_some_and(|deadline| deadline <= now);

                        if expired && !source.timed_out.swap(true, Ordering::AcqRel) {
                            wakers.extend(source.take_waker(direction::READ));
                        }
                    }
                }
                Err(_) => {
                    warn!("shard source map poisoned, stopping");
                    break;
                }
            }

            for waker in wakers.drain(..) {
                waker.wake();
            }
        }

        // wake every parked task so it observes the cancel flag
        if let Ok(sources) = self.sources.lock() {
            for source in sources.values() {
                if let Ok(mut interest) = source.interest.lock() {
                    for waker in interest.iter_mut().filter_map(Option::take) {
                        waker.wake();
                    }
                }
            }
        }

        debug!("shard stopped");
    }
}

/// The shard set. One instance per server.
pub(crate) struct Reactor {
    shards: Vec<Arc<Shard>>,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Reactor {
    pub(crate) fn new(limits: &ServerLimits, cancel: Arc<AtomicBool>) -> ReactorResult<Self> {
        let count = limits.shard_count();
        let mut shards = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);

        for id in 0..count {
            let poll = Poll::new().map_err(ReactorError::Init)?;
            let registry = poll.registry().try_clone().map_err(ReactorError::Init)?;
            let waker =
                mio::Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReactorError::Init)?;

            let shard = Arc::new(Shard {
                registry,
                waker,
                sources: Mutex::new(HashMap::new()),
                cancel: cancel.clone(),
            });

            let runner = shard.clone();
            let (max_events, poll_timeout) = (limits.max_events, limits.poll_timeout);
            let join = thread::Builder::new()
                .name(format!("shard-{id}"))
                .spawn(move || runner.run(poll, max_events, poll_timeout))
                .map_err(ReactorError::Init)?;

            shards.push(shard);
            joins.push(join);
        }

        debug!("reactor started, {count} shards");

        Ok(Self {
            shards,
            joins: Mutex::new(joins),
        })
    }

    /// Registers an accepted stream on its `fd % N` shard. The token is
    /// the fd itself: unique process-wide while the socket is open.
    pub(crate) fn register(&self, stream: std::net::TcpStream) -> ReactorResult<TcpStream> {
        stream
            .set_nonblocking(true)
            .map_err(ReactorError::Registration)?;

        let fd = stream.as_raw_fd();
        let token = Token(fd as usize);
        let shard = self.shards[fd as usize % self.shards.len()].clone();

        let mut sys = mio::net::TcpStream::from_std(stream);
        let source = Arc::new(Source::new(token));

        // the source must be visible before the first edge fires
        shard
            .sources
            .lock()
            .map_err(|_| ReactorError::LockPoisoned)?
            .insert(token, source.clone());

        if let Err(err) = shard.registry.register(
            &mut sys,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            if let Ok(mut sources) = shard.sources.lock() {
                sources.remove(&token);
            }
            return Err(ReactorError::Registration(err));
        }

        Ok(TcpStream { sys, shard, source })
    }

    /// Wakes every shard out of its poll and joins the threads. The
    /// cancel flag must already be set.
    pub(crate) fn shutdown(&self) {
        for shard in &self.shards {
            if let Err(err) = shard.waker.wake() {
                warn!("shard wake failed: {err}");
            }
        }

        if let Ok(mut joins) = self.joins.lock() {
            for join in joins.drain(..) {
                let _ = join.join();
            }
        }

        debug!("reactor stopped");
    }
}

/// A reactor-backed stream speaking tokio's async I/O traits.
pub(crate) struct TcpStream {
    sys: mio::net::TcpStream,
    shard: Arc<Shard>,
    source: Arc<Source>,
}

impl TcpStream {
    /// Arms (or clears) the idle read deadline for this stream.
    pub(crate) fn set_read_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut slot) = self.source.deadline.lock() {
            *slot = deadline;
        }
        self.source.timed_out.store(false, Ordering::Release);
    }

    fn poll_ready(&self, dir: usize, cx: &mut Context<'_>) -> TaskPoll<io::Result<()>> {
        if dir == direction::READ && self.source.timed_out.load(Ordering::Acquire) {
            return TaskPoll::Ready(Err(io::ErrorKind::TimedOut.into()));
        }
        if self.source.triggered[dir].load(Ordering::Acquire) {
            return TaskPoll::Ready(Ok(()));
        }

        match self.source.interest.lock() {
            Ok(mut interest) => interest[dir] = Some(cx.waker().clone()),
            Err(_) => {
                return TaskPoll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "reactor state poisoned",
                )))
            }
        }

        // re-check: the edge may have fired between the fast path and
        // parking the waker
        if self.source.triggered[dir].load(Ordering::Acquire)
            || (dir == direction::READ && self.source.timed_out.load(Ordering::Acquire))
        {
            return TaskPoll::Ready(Ok(()));
        }

        TaskPoll::Pending
    }

    fn poll_io<T>(
        &self,
        dir: usize,
        cx: &mut Context<'_>,
        mut op: impl FnMut() -> io::Result<T>,
    ) -> TaskPoll<io::Result<T>> {
        loop {
            ready!(self.poll_ready(dir, cx))?;

            match op() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.source.triggered[dir].store(false, Ordering::Release);
                }
                result => return TaskPoll::Ready(result),
            }
        }
    }
}

// mio's TcpStream implements Read/Write for shared references, which
// lets the closures below capture the socket immutably alongside the
// readiness state.
impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> TaskPoll<io::Result<()>> {
        let this = self.get_mut();
        let unfilled = buf.initialize_unfilled();
        let mut sys = &this.sys;

        let n = ready!(this.poll_io(direction::READ, cx, || Read::read(
            &mut sys,
            &mut *unfilled
        )))?;
        buf.advance(n);
        TaskPoll::Ready(Ok(()))
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> TaskPoll<io::Result<usize>> {
        let this = self.get_mut();
        let mut sys = &this.sys;
        this.poll_io(direction::WRITE, cx, || Write::write(&mut sys, data))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> TaskPoll<io::Result<()>> {
        let this = self.get_mut();
        let mut sys = &this.sys;
        this.poll_io(direction::WRITE, cx, || Write::flush(&mut sys))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> TaskPoll<io::Result<()>> {
        TaskPoll::Ready(self.sys.shutdown(std::net::Shutdown::Write))
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if let Ok(mut sources) = self.shard.sources.lock() {
            sources.remove(&self.source.token);
        }
        if let Err(err) = self.shard.registry.deregister(&mut self.sys) {
            debug!("deregister failed: {err}");
        }
    }
}
