// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A static (fixed-size) work-stealing thread pool: each worker owns a BWoS
//! deque, falls back to a shared overflow vector when contended, and steals
//! from a shuffled victim list when idle. Workers park on a condvar once
//! every queue (own, overflow, and every victim) comes up empty.

mod bwos;
mod worker;

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

use parking_lot::Condvar;

use crate::env::StopToken;
use crate::error::PoolError;
use crate::task::Outcome;
use crate::util::Completion;
use bwos::BwosDeque;

/// Tunables for a [`StaticThreadPool`]: how many workers, and how each
/// worker's BWoS deque is shaped.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub worker_count: usize,
    pub num_blocks: usize,
    pub block_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            num_blocks: 8,
            block_size: 8,
        }
    }
}

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) trait Runnable: Send + Sync {
    fn run(self: Arc<Self>);
}

struct PoolState {
    tasks: Vec<Arc<dyn Runnable>>,
    thiefs: usize,
    sleeping: usize,
    stopping: bool,
}

struct Shared {
    state: parking_lot::Mutex<PoolState>,
    condvar: Condvar,
    queues: Vec<Arc<BwosDeque<Arc<dyn Runnable>>>>,
}

thread_local! {
    static CURRENT_WORKER: Cell<Option<(*const Shared, usize)>> = const { Cell::new(None) };
}

/// A fixed pool of OS threads, each running its own BWoS-backed work-stealing
/// loop. Dropping the pool requests every worker to stop and joins them.
pub struct StaticThreadPool {
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl StaticThreadPool {
    pub fn new(config: Config) -> Self {
        let worker_count = config.worker_count.max(1);
        let queues: Vec<Arc<BwosDeque<Arc<dyn Runnable>>>> = (0..worker_count)
            .map(|_| Arc::new(BwosDeque::new(config.num_blocks, config.block_size)))
            .collect();
        let shared = Arc::new(Shared {
            state: parking_lot::Mutex::new(PoolState {
                tasks: Vec::new(),
                thiefs: 0,
                sleeping: 0,
                stopping: false,
            }),
            condvar: Condvar::new(),
            queues,
        });
        let threads = (0..worker_count)
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("coro-runtime-worker-{index}"))
                    .spawn(move || worker::run(shared, index))
                    .expect("failed to spawn pool worker thread")
            })
            .collect();
        StaticThreadPool { shared, threads }
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle(self.shared.clone())
    }

    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    pub fn schedule(&self) -> Schedule {
        self.handle().schedule()
    }

    #[allow(clippy::type_complexity)]
    pub fn schedule_bulk<F, Fut, E>(&self, count: usize, f: F) -> ScheduleBulk<E>
    where
        F: Fn(usize, StopToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        self.handle().schedule_bulk(count, f)
    }
}

impl Drop for StaticThreadPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.stopping = true;
        }
        self.shared.condvar.notify_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// A cloneable reference to a running pool, usable from any thread
/// (including the pool's own workers) to enqueue work.
#[derive(Clone)]
pub struct PoolHandle(Arc<Shared>);

impl PoolHandle {
    fn enqueue_runnable(&self, mut task: Arc<dyn Runnable>) {
        let ptr = Arc::as_ptr(&self.0);
        let current_index = CURRENT_WORKER.with(|cell| {
            cell.get()
                .filter(|(owner, _)| std::ptr::eq(*owner, ptr))
                .map(|(_, index)| index)
        });
        if let Some(index) = current_index {
            match self.0.queues[index].push_back(task) {
                Ok(()) => return,
                Err(back) => task = back,
            }
        }
        {
            let mut state = self.0.state.lock();
            state.tasks.push(task);
        }
        self.0.condvar.notify_one();
    }

    /// Spawns a fire-and-forget future onto the pool. Used by scoped
    /// primitives that need genuine parallel execution rather than a single
    /// scheduling hop; the future is responsible for reporting its own
    /// outcome (e.g. by resolving a `Completion`).
    pub(crate) fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        let task: Arc<dyn Runnable> = Arc::new(FutureTask {
            future: Mutex::new(Some(Box::pin(future))),
            handle: self.clone(),
        });
        self.enqueue_runnable(task);
    }

    /// A sender that completes, on a pool worker thread, after hopping off
    /// whatever thread is currently driving the awaiting task.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            handle: self.clone(),
            submitted: false,
        }
    }

    #[allow(clippy::type_complexity)]
    pub fn schedule_bulk<F, Fut, E>(&self, count: usize, f: F) -> ScheduleBulk<E>
    where
        F: Fn(usize, StopToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome<(), E>> + Send + 'static,
        E: Send + 'static,
    {
        ScheduleBulk {
            handle: self.clone(),
            count,
            f: Some(Arc::new(move |index, token| {
                Box::pin(f(index, token)) as Pin<Box<dyn Future<Output = Outcome<(), E>> + Send>>
            })),
            completion: Completion::new(),
            submitted: false,
        }
    }
}

struct FutureTask {
    future: Mutex<Option<BoxFuture>>,
    handle: PoolHandle,
}

impl Wake for FutureTask {
    fn wake(self: Arc<Self>) {
        self.handle.clone().enqueue_runnable(self);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().wake();
    }
}

impl Runnable for FutureTask {
    fn run(self: Arc<Self>) {
        let mut guard = self.future.lock().unwrap();
        let Some(mut future) = guard.take() else {
            return;
        };
        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {}
            Poll::Pending => *guard = Some(future),
        }
    }
}

struct WakeRunnable(Waker);

impl Runnable for WakeRunnable {
    fn run(self: Arc<Self>) {
        self.0.wake_by_ref();
    }
}

/// A sender that enqueues a continuation onto the pool and resolves once it
/// has actually run there. The direct counterpart of the original's
/// `ScheduleSender`.
pub struct Schedule {
    handle: PoolHandle,
    submitted: bool,
}

impl Future for Schedule {
    type Output = Outcome<(), PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.submitted {
            self.submitted = true;
            let waker: Arc<dyn Runnable> = Arc::new(WakeRunnable(cx.waker().clone()));
            self.handle.enqueue_runnable(waker);
            return Poll::Pending;
        }
        Poll::Ready(Outcome::Value(()))
    }
}

struct BulkShared<E> {
    remaining: AtomicUsize,
    stop: crate::env::StopSource,
    first_error: Mutex<Option<E>>,
    completion: Completion<Outcome<(), E>>,
}

/// A sender that runs `count` independent child senders on the pool and
/// completes once all of them have, aggregating to the first error (or
/// `Stopped` if none errored but at least one was cancelled). The direct
/// counterpart of the original's `BulkSender`/`BulkSharedState`.
#[allow(clippy::type_complexity)]
pub struct ScheduleBulk<E> {
    handle: PoolHandle,
    count: usize,
    f: Option<Arc<dyn Fn(usize, StopToken) -> Pin<Box<dyn Future<Output = Outcome<(), E>> + Send>> + Send + Sync>>,
    completion: Completion<Outcome<(), E>>,
    submitted: bool,
}

impl<E: Send + 'static> Future for ScheduleBulk<E> {
    type Output = Outcome<(), E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.submitted {
            self.submitted = true;
            let shared = Arc::new(BulkShared {
                remaining: AtomicUsize::new(self.count),
                stop: crate::env::StopSource::new(),
                first_error: Mutex::new(None),
                completion: self.completion.clone(),
            });
            if self.count == 0 {
                shared.completion.resolve(Outcome::Value(()));
            } else {
                let f = self.f.take().expect("ScheduleBulk polled twice before submission");
                for index in 0..self.count {
                    let f = f.clone();
                    let shared = shared.clone();
                    let token = shared.stop.token();
                    self.handle.spawn(async move {
                        let outcome = f(index, token).await;
                        match outcome {
                            Outcome::Value(()) => {}
                            Outcome::Error(err) => {
                                let mut slot = shared.first_error.lock().unwrap();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                                shared.stop.request_stop();
                            }
                            Outcome::Stopped => {
                                shared.stop.request_stop();
                            }
                        }
                        if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let outcome = match shared.first_error.lock().unwrap().take() {
                                Some(err) => Outcome::Error(err),
                                None if shared.stop.is_stop_requested() => Outcome::Stopped,
                                None => Outcome::Value(()),
                            };
                            shared.completion.resolve(outcome);
                        }
                    });
                }
            }
        }
        self.completion.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn schedule_runs_on_a_worker_thread() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 2,
            ..Config::default()
        });
        let this_thread = thread::current().id();
        let observed = crate::task::sync_wait(async move {
            let handle = pool.handle();
            handle.schedule().await;
            Outcome::<_, PoolError>::Value(thread::current().id())
        });
        assert_ne!(observed, Some(this_thread));
    }

    #[test]
    fn schedule_bulk_runs_every_index_exactly_once() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            ..Config::default()
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let outcome = crate::task::sync_wait({
            let seen = seen.clone();
            pool.schedule_bulk(16, move |index, _stop| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(index);
                    Outcome::<(), PoolError>::Value(())
                }
            })
        });
        assert!(outcome.is_some());
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn schedule_bulk_propagates_first_error() {
        #[derive(Debug, PartialEq, Eq)]
        struct Boom;

        let pool = StaticThreadPool::new(Config {
            worker_count: 2,
            ..Config::default()
        });
        let outcome = crate::task::try_sync_wait(pool.schedule_bulk(8, |index, _stop| async move {
            if index == 3 {
                Outcome::Error(Boom)
            } else {
                Outcome::Value(())
            }
        }));
        assert_eq!(outcome, Err(Boom));
    }

    #[test]
    fn many_spawned_tasks_all_complete() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            num_blocks: 4,
            block_size: 4,
        });
        let handle = pool.handle();
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..500 {
            let counter = counter.clone();
            let handle2 = handle.clone();
            handle.spawn(async move {
                handle2.schedule().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // give the pool time to drain; this is a smoke test, not a
        // completion barrier (the pool has none to offer for fire-and-forget
        // spawns).
        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 500);
    }
}
