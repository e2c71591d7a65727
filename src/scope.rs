// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A structured-concurrency nursery: tasks spawned into an
//! [`AsyncScope`] are guaranteed to have completed before [`AsyncScope::close`]
//! resolves, and no new task can be admitted once closing has started.
//!
//! The open/closed state and the live task count share one atomic: bit 0 is
//! the "still accepting work" flag, the remaining bits are a count of tasks
//! currently running. `spawn` requires the flag to be set and adds 2 (one
//! count, preserving the flag bit); every task's completion subtracts 2;
//! `close` clears the flag without touching the count. Whichever of the two
//! operations observes the count reach zero with the flag already clear is
//! the one that resolves the close waiter, so exactly one of them always
//! does.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::task::{Context, Poll};

use crate::error::ScopeClosedError;
use crate::pool::PoolHandle;
use crate::task::{Outcome, Task};
use crate::util::Completion;

const OPEN_BIT: isize = 1;
const STEP: isize = 2;

struct Inner {
    active_tasks: AtomicIsize,
    pool: PoolHandle,
    close_completion: Completion<()>,
}

impl Inner {
    /// Called when a spawned task finishes running. If this was the last
    /// live task and the scope is already closed, wakes the close waiter.
    fn notify_completion(&self) {
        let old = self.active_tasks.fetch_sub(STEP, Ordering::AcqRel);
        if old == STEP {
            self.close_completion.resolve(());
        }
    }
}

/// A handle to a nursery of spawned tasks. Cheap to clone; every clone
/// shares the same live-task count and close state.
#[derive(Clone)]
pub struct AsyncScope(Arc<Inner>);

/// The error a child sender produced when driven through [`AsyncScope::nest`],
/// unified with the scope's own closed-state error.
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum NestError<E> {
    #[error("scope is closed")]
    ScopeClosed,
    #[error(transparent)]
    Child(E),
}

impl AsyncScope {
    /// Creates a new, open scope that spawns its tasks onto `pool`.
    pub fn new(pool: PoolHandle) -> Self {
        AsyncScope(Arc::new(Inner {
            active_tasks: AtomicIsize::new(OPEN_BIT),
            pool,
            close_completion: Completion::new(),
        }))
    }

    /// Attempts to admit one more task, returning the previous value on
    /// success so callers can tell whether they raced a concurrent `close`.
    fn try_increase_ref_count(&self) -> Result<(), ScopeClosedError> {
        let mut current = self.0.active_tasks.load(Ordering::Acquire);
        loop {
            if current & OPEN_BIT == 0 {
                return Err(ScopeClosedError);
            }
            match self.0.active_tasks.compare_exchange_weak(
                current,
                current + STEP,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Spawns `future` as fire-and-forget work owned by this scope. Returns
    /// [`ScopeClosedError`] without running `future` if the scope has
    /// already started closing.
    ///
    /// The future's own `Output` is discarded; a task that fails is expected
    /// to report that failure through its own side channel (a `Completion`,
    /// a channel send, etc). This matches the original's `AsyncScope::spawn`,
    /// which likewise only propagates submission failure, not task failure.
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> Result<(), ScopeClosedError> {
        self.try_increase_ref_count()?;
        let inner = self.0.clone();
        let completion_inner = inner.clone();
        inner.pool.spawn(async move {
            future.await;
            completion_inner.notify_completion();
        });
        Ok(())
    }

    /// Runs `sender` to completion as part of the current task, while
    /// holding this scope open for its duration. Unlike [`spawn`](Self::spawn),
    /// the child does not run on a separate pool task and its outcome is
    /// returned to the caller rather than discarded.
    pub fn nest<T, E>(&self, sender: impl Future<Output = Outcome<T, E>> + Send + 'static) -> Task<T, NestError<E>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let scope = self.clone();
        crate::task::boxed(async move {
            if scope.try_increase_ref_count().is_err() {
                return Outcome::Error(NestError::ScopeClosed);
            }
            let outcome = sender.await;
            scope.0.notify_completion();
            match outcome {
                Outcome::Value(v) => Outcome::Value(v),
                Outcome::Error(e) => Outcome::Error(NestError::Child(e)),
                Outcome::Stopped => Outcome::Stopped,
            }
        })
    }

    /// Stops accepting new work and returns a future that resolves once
    /// every already-spawned task has completed. Idempotent: calling it
    /// again (e.g. from another clone of this handle) is safe and resolves
    /// against the same completion.
    pub fn close(&self) -> Close {
        Close {
            scope: self.clone(),
            cleared: false,
        }
    }
}

/// The future returned by [`AsyncScope::close`].
pub struct Close {
    scope: AsyncScope,
    cleared: bool,
}

impl Future for Close {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if !self.cleared {
            self.cleared = true;
            let mut current = self.scope.0.active_tasks.load(Ordering::Acquire);
            loop {
                if current & OPEN_BIT == 0 {
                    // another `close()` already cleared the bit; fall
                    // through to polling the shared completion below.
                    break;
                }
                match self.scope.0.active_tasks.compare_exchange_weak(
                    current,
                    current & !OPEN_BIT,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(old) => {
                        if old == OPEN_BIT {
                            // no tasks were live; nothing left to wait for.
                            self.scope.0.close_completion.resolve(());
                        }
                        break;
                    }
                    Err(observed) => current = observed,
                }
            }
        }
        self.scope.0.close_completion.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::pool::{Config, StaticThreadPool};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_resolves_immediately_when_nothing_was_spawned() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        let result = crate::task::sync_wait(async move {
            scope.close().await;
            Outcome::<(), PoolError>::Value(())
        });
        assert_eq!(result, Some(()));
    }

    #[test]
    fn close_waits_for_every_spawned_task() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        let completed = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let completed = completed.clone();
            scope
                .spawn(async move {
                    completed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        let result = crate::task::sync_wait({
            let scope = scope.clone();
            async move {
                scope.close().await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        assert_eq!(result, Some(()));
        assert_eq!(completed.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn spawn_after_close_is_rejected() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        let result = crate::task::sync_wait({
            let scope = scope.clone();
            async move {
                scope.close().await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        assert_eq!(result, Some(()));
        assert_eq!(scope.spawn(async {}), Err(ScopeClosedError));
    }

    #[test]
    fn nest_returns_child_outcome_and_holds_scope_open() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        let result: Option<i32> = crate::task::sync_wait(
            scope.nest(async { Outcome::<i32, String>::Value(7) }),
        );
        assert_eq!(result, Some(7));
    }

    #[test]
    fn nest_after_close_reports_scope_closed() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        crate::task::sync_wait({
            let scope = scope.clone();
            async move {
                scope.close().await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        let result = crate::task::try_sync_wait(
            scope.nest(async { Outcome::<i32, String>::Value(1) }),
        );
        assert_eq!(result, Err(NestError::ScopeClosed));
    }

    #[test]
    fn concurrent_spawns_and_close_never_lose_a_completion() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            ..Config::default()
        });
        let scope = AsyncScope::new(pool.handle());
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let seen = seen.clone();
            let _ = scope.spawn(async move {
                seen.lock().unwrap().push(i);
            });
        }
        crate::task::sync_wait({
            let scope = scope.clone();
            async move {
                scope.close().await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        assert!(seen.lock().unwrap().len() <= 50);
    }
}
