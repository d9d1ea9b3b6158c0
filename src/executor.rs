//! Worker pool for connection tasks.
//!
//! Each connection runs as one boxed future. A worker thread drives one
//! future at a time to completion with a park/unpark waker; the shared
//! task queue is lock-free, the mutex below only tracks worker
//! bookkeeping for idle parking. Idle workers exit after a keep-alive
//! period, so the pool shrinks to zero when traffic stops.

use crossbeam::queue::SegQueue;
use log::{debug, error};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;
use std::time::Duration;

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Thread-parking waker for driving one future on the current thread.
pub(crate) struct Parker {
    inner: Arc<ParkState>,
}

struct ParkState {
    thread: thread::Thread,
    unparked: AtomicBool,
}

impl Wake for ParkState {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.unparked.swap(true, Ordering::Release) {
            self.thread.unpark();
        }
    }
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ParkState {
                thread: thread::current(),
                unparked: AtomicBool::new(false),
            }),
        }
    }

    /// Drives the future to completion, parking between polls.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        let waker = Waker::from(self.inner.clone());
        let mut cx = Context::from_waker(&waker);

        let mut future = std::pin::pin!(future);
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return output;
            }

            while !self.inner.unparked.swap(false, Ordering::Acquire) {
                thread::park();
            }
        }
    }
}

struct Bookkeeping {
    workers: usize,
    idle: usize,
    notified: usize,
}

struct Inner {
    tasks: SegQueue<Task>,
    shared: Mutex<Bookkeeping>,
    condvar: Condvar,
    keep_alive: Duration,
    max_workers: usize,
}

/// Spawns connection futures onto a bounded, self-shrinking pool.
#[derive(Clone)]
pub(crate) struct Executor {
    inner: Arc<Inner>,
}

impl Executor {
    pub(crate) fn new(max_workers: usize, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: SegQueue::new(),
                shared: Mutex::new(Bookkeeping {
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive,
                max_workers: max_workers.max(1),
            }),
        }
    }

    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.inner.tasks.push(Box::pin(future));

        let mut shared = match self.inner.shared.lock() {
            Ok(shared) => shared,
            Err(err) => {
                error!("executor bookkeeping poisoned: {err}");
                return;
            }
        };

        if shared.idle > shared.notified {
            shared.notified += 1;
            self.inner.condvar.notify_one();
        } else if shared.workers < self.inner.max_workers {
            shared.workers += 1;
            drop(shared);
            self.start_worker();
        }
        // else: all workers busy and at the cap, the task waits queued
    }

    fn start_worker(&self) {
        let inner = self.inner.clone();

        let spawned = thread::Builder::new()
            .name("conn-worker".to_owned())
            .spawn(move || worker_loop(&inner));

        if let Err(err) = spawned {
            error!("worker spawn failed: {err}");
            if let Ok(mut shared) = self.inner.shared.lock() {
                shared.workers -= 1;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.inner.shared.lock().map(|s| s.workers).unwrap_or(0)
    }
}

fn worker_loop(inner: &Inner) {
    let parker = Parker::new();

    'alive: loop {
        while let Some(task) = inner.tasks.pop() {
            parker.block_on(task);
        }

        let mut shared = match inner.shared.lock() {
            Ok(shared) => shared,
            Err(err) => {
                error!("executor bookkeeping poisoned: {err}");
                return;
            }
        };
        shared.idle += 1;

        // a task pushed between the drain and the lock would otherwise
        // wait for the next spawn to notify
        if !inner.tasks.is_empty() {
            shared.idle -= 1;
            continue 'alive;
        }

        loop {
            let (next, timeout) = match inner.condvar.wait_timeout(shared, inner.keep_alive) {
                Ok(woken) => woken,
                Err(err) => {
                    error!("executor bookkeeping poisoned: {err}");
                    return;
                }
            };
            shared = next;

            if shared.notified > 0 {
                shared.notified -= 1;
                shared.idle -= 1;
                continue 'alive;
            }
            if timeout.timed_out() {
                break;
            }
        }

        shared.idle -= 1;
        shared.workers -= 1;
        debug!("idle worker exiting");
        return;
    }
}
