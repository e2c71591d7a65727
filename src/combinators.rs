// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Sender combinators: concurrent joins (`when_all`, `when_any`), a
//! resource-acquisition bridge from [`Observable`] back to [`Task`]
//! (`use_resource`), a stop-to-value adapter (`stopped_as_optional`), and
//! environment read/write wrappers (`read_env`, `write_env`).
//!
//! `when_all`/`when_any` are fixed-arity (2- and 3-way) rather than
//! variadic: Rust has no parameter-pack equivalent on stable, and a
//! `Vec`-based homogeneous join would lose the distinct result types each
//! child normally has.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::env::{Env, Query, StopSource, StopToken};
use crate::error::CoreError;
use crate::observable::{Observable, Receiver};
use crate::pool::PoolHandle;
use crate::scope::AsyncScope;
use crate::task::{Outcome, Task};
use crate::util::{Completion, CompletionFuture};

/// Converts a stopped completion into an absent value; a value or error
/// passes through unchanged. A thin wrapper around [`Outcome::into_result_optional`].
pub fn stopped_as_optional<T, E>(sender: impl Future<Output = Outcome<T, E>> + Send + 'static) -> Task<Option<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    crate::task::boxed(async move {
        match sender.await.into_result_optional() {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e),
        }
    })
}

/// A sender whose value is `env.query::<Q>()`.
pub fn read_env<Q: Query>(env: Env) -> Task<Q::Value, std::convert::Infallible> {
    crate::task::ready(env.query::<Q>())
}

/// Runs `child` against an environment that answers `Q` with `value`,
/// forwarding every other query to `env`.
pub fn write_env<Q, T, E>(env: Env, value: Q::Value, child: impl FnOnce(Env) -> Task<T, E>) -> Task<T, E>
where
    Q: Query,
    T: Send + 'static,
    E: Send + 'static,
{
    child(env.overlay::<Q>(value))
}

// ---------------------------------------------------------------------
// when_all
// ---------------------------------------------------------------------

enum JoinOutcome {
    Pending,
    Error(CoreError),
    Stopped,
}

struct JoinState {
    outcome: Mutex<JoinOutcome>,
    stop_source: StopSource,
}

impl JoinState {
    fn new() -> Self {
        JoinState {
            outcome: Mutex::new(JoinOutcome::Pending),
            stop_source: StopSource::new(),
        }
    }

    /// First-wins: records `err`/`stopped` only if nothing has been recorded
    /// yet, and requests stop on the shared source exactly once.
    fn record_failure(&self, outcome: JoinOutcome) {
        let mut current = self.outcome.lock().unwrap();
        if matches!(*current, JoinOutcome::Pending) {
            *current = outcome;
            self.stop_source.request_stop();
        }
    }
}

/// Runs two senders concurrently, each built from a [`StopToken`] linked to
/// a shared [`StopSource`]: the first child to fail or stop requests that
/// source's stop, so a well-behaved sibling observes it and winds down
/// early. Completes with both values once both children have value-completed;
/// the first recorded error or stop otherwise.
pub fn when_all2<T1, T2>(
    pool: PoolHandle,
    make_a: impl FnOnce(StopToken) -> Task<T1, CoreError> + Send + 'static,
    make_b: impl FnOnce(StopToken) -> Task<T2, CoreError> + Send + 'static,
) -> Task<(T1, T2), CoreError>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    let state = Arc::new(JoinState::new());
    let scope = AsyncScope::new(pool);

    let slot_a: Arc<Mutex<Option<T1>>> = Arc::new(Mutex::new(None));
    let slot_b: Arc<Mutex<Option<T2>>> = Arc::new(Mutex::new(None));

    {
        let state = state.clone();
        let slot_a = slot_a.clone();
        let token = state.stop_source.token();
        let _ = scope.spawn(async move {
            match make_a(token).await {
                Outcome::Value(v) => *slot_a.lock().unwrap() = Some(v),
                Outcome::Error(e) => state.record_failure(JoinOutcome::Error(e)),
                Outcome::Stopped => state.record_failure(JoinOutcome::Stopped),
            }
        });
    }
    {
        let state = state.clone();
        let slot_b = slot_b.clone();
        let token = state.stop_source.token();
        let _ = scope.spawn(async move {
            match make_b(token).await {
                Outcome::Value(v) => *slot_b.lock().unwrap() = Some(v),
                Outcome::Error(e) => state.record_failure(JoinOutcome::Error(e)),
                Outcome::Stopped => state.record_failure(JoinOutcome::Stopped),
            }
        });
    }

    crate::task::boxed(async move {
        scope.close().await;
        match std::mem::replace(&mut *state.outcome.lock().unwrap(), JoinOutcome::Pending) {
            JoinOutcome::Pending => {
                let a = slot_a.lock().unwrap().take().expect("value recorded before scope closed");
                let b = slot_b.lock().unwrap().take().expect("value recorded before scope closed");
                Outcome::Value((a, b))
            }
            JoinOutcome::Error(e) => Outcome::Error(e),
            JoinOutcome::Stopped => Outcome::Stopped,
        }
    })
}

/// Three-way [`when_all2`]: all three children share one [`StopSource`], so
/// the first of the three to fail or stop cancels both remaining siblings,
/// not just the one it happened to be paired with.
pub fn when_all3<T1, T2, T3>(
    pool: PoolHandle,
    make_a: impl FnOnce(StopToken) -> Task<T1, CoreError> + Send + 'static,
    make_b: impl FnOnce(StopToken) -> Task<T2, CoreError> + Send + 'static,
    make_c: impl FnOnce(StopToken) -> Task<T3, CoreError> + Send + 'static,
) -> Task<(T1, T2, T3), CoreError>
where
    T1: Send + 'static,
    T2: Send + 'static,
    T3: Send + 'static,
{
    let state = Arc::new(JoinState::new());
    let scope = AsyncScope::new(pool);

    let slot_a: Arc<Mutex<Option<T1>>> = Arc::new(Mutex::new(None));
    let slot_b: Arc<Mutex<Option<T2>>> = Arc::new(Mutex::new(None));
    let slot_c: Arc<Mutex<Option<T3>>> = Arc::new(Mutex::new(None));

    {
        let state = state.clone();
        let slot_a = slot_a.clone();
        let token = state.stop_source.token();
        let _ = scope.spawn(async move {
            match make_a(token).await {
                Outcome::Value(v) => *slot_a.lock().unwrap() = Some(v),
                Outcome::Error(e) => state.record_failure(JoinOutcome::Error(e)),
                Outcome::Stopped => state.record_failure(JoinOutcome::Stopped),
            }
        });
    }
    {
        let state = state.clone();
        let slot_b = slot_b.clone();
        let token = state.stop_source.token();
        let _ = scope.spawn(async move {
            match make_b(token).await {
                Outcome::Value(v) => *slot_b.lock().unwrap() = Some(v),
                Outcome::Error(e) => state.record_failure(JoinOutcome::Error(e)),
                Outcome::Stopped => state.record_failure(JoinOutcome::Stopped),
            }
        });
    }
    {
        let state = state.clone();
        let slot_c = slot_c.clone();
        let token = state.stop_source.token();
        let _ = scope.spawn(async move {
            match make_c(token).await {
                Outcome::Value(v) => *slot_c.lock().unwrap() = Some(v),
                Outcome::Error(e) => state.record_failure(JoinOutcome::Error(e)),
                Outcome::Stopped => state.record_failure(JoinOutcome::Stopped),
            }
        });
    }

    crate::task::boxed(async move {
        scope.close().await;
        match std::mem::replace(&mut *state.outcome.lock().unwrap(), JoinOutcome::Pending) {
            JoinOutcome::Pending => {
                let a = slot_a.lock().unwrap().take().expect("value recorded before scope closed");
                let b = slot_b.lock().unwrap().take().expect("value recorded before scope closed");
                let c = slot_c.lock().unwrap().take().expect("value recorded before scope closed");
                Outcome::Value((a, b, c))
            }
            JoinOutcome::Error(e) => Outcome::Error(e),
            JoinOutcome::Stopped => Outcome::Stopped,
        }
    })
}

// ---------------------------------------------------------------------
// when_any
// ---------------------------------------------------------------------

/// The value channel of a two-way [`when_any2`]: which side produced it.
#[derive(Debug, PartialEq)]
pub enum Either2<T1, T2> {
    First(T1),
    Second(T2),
}

struct RaceState<T1, T2> {
    completion: Completion<Outcome<Either2<T1, T2>, CoreError>>,
    claimed: Mutex<bool>,
    remaining: AtomicUsize,
    stop_source: StopSource,
}

impl<T1, T2> RaceState<T1, T2>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    /// First-wins resolve of the race completion; returns whether this call
    /// was the one that claimed it.
    fn try_resolve(&self, outcome: Outcome<Either2<T1, T2>, CoreError>) -> bool {
        let mut claimed = self.claimed.lock().unwrap();
        if *claimed {
            return false;
        }
        *claimed = true;
        self.completion.resolve(outcome);
        true
    }

    fn finish_child(&self, outcome: Outcome<Either2<T1, T2>, CoreError>) {
        match outcome {
            Outcome::Stopped => {}
            other => {
                if self.try_resolve(other) {
                    self.stop_source.request_stop();
                }
            }
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.try_resolve(Outcome::Stopped);
        }
    }
}

/// Races two senders: completes with the first non-stopped terminal
/// result, immediately requesting stop on the linked [`StopSource`] so a
/// well-behaved sibling can wind down. Completes `Stopped` only if every
/// child stops.
pub fn when_any2<T1, T2>(
    pool: PoolHandle,
    make_a: impl FnOnce(StopToken) -> Task<T1, CoreError> + Send + 'static,
    make_b: impl FnOnce(StopToken) -> Task<T2, CoreError> + Send + 'static,
) -> Task<Either2<T1, T2>, CoreError>
where
    T1: Send + 'static,
    T2: Send + 'static,
{
    let state = Arc::new(RaceState {
        completion: Completion::new(),
        claimed: Mutex::new(false),
        remaining: AtomicUsize::new(2),
        stop_source: StopSource::new(),
    });

    {
        let state = state.clone();
        let token = state.stop_source.token();
        pool.spawn(async move {
            let outcome = make_a(token).await.map(Either2::First);
            state.finish_child(outcome);
        });
    }
    {
        let state = state.clone();
        let token = state.stop_source.token();
        pool.spawn(async move {
            let outcome = make_b(token).await.map(Either2::Second);
            state.finish_child(outcome);
        });
    }

    crate::task::boxed(CompletionFuture(state.completion.clone()))
}

// ---------------------------------------------------------------------
// use_resource
// ---------------------------------------------------------------------

enum SetupResult<T, E> {
    Value(T, Completion<()>),
    Error(E),
    Stopped,
}

/// Grants access to a resource acquired through an [`Observable`]'s single
/// emission. Dropping the guard signals the source to run its cleanup code
/// (whatever follows the receiver's await inside the observable's own
/// `subscribe` body).
pub struct UseResourceGuard<T> {
    value: Option<T>,
    release: Option<Completion<()>>,
}

impl<T> Deref for UseResourceGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("value present for the guard's lifetime")
    }
}

impl<T> DerefMut for UseResourceGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("value present for the guard's lifetime")
    }
}

impl<T> Drop for UseResourceGuard<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release.resolve(());
        }
    }
}

/// Subscribes to `obs`, which is expected to emit exactly one value, and
/// returns a guard wrapping it. The subscription keeps running in
/// `scope` until the guard is dropped, at which point the source observes
/// a `Stopped` receiver result and its cleanup code (if any) runs; the
/// error path (`obs` errors before emitting) reports directly without
/// ever producing a guard, and the scope-closed path reports `Stopped`.
pub fn use_resource<T, E>(obs: Observable<T, E>, scope: &AsyncScope) -> Task<UseResourceGuard<T>, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    let setup: Completion<SetupResult<T, E>> = Completion::new();
    let setup_for_subscription = setup.clone();
    let subscription = async move {
        let setup = setup_for_subscription;
        let receiver: Receiver<T, E> = Box::new(move |task: Task<T, E>| {
            let setup = setup.clone();
            Box::pin(async move {
                match task.await {
                    Outcome::Value(value) => {
                        let release = Completion::new();
                        setup.resolve(SetupResult::Value(value, release.clone()));
                        CompletionFuture(release).await;
                        Outcome::Value(())
                    }
                    Outcome::Error(e) => {
                        setup.resolve(SetupResult::Error(e));
                        Outcome::Stopped
                    }
                    Outcome::Stopped => {
                        setup.resolve(SetupResult::Stopped);
                        Outcome::Stopped
                    }
                }
            })
        });
        let _ = obs.subscribe(receiver).await;
    };

    if scope.spawn(subscription).is_err() {
        return crate::task::stopped();
    }

    crate::task::boxed(async move {
        match CompletionFuture(setup).await {
            SetupResult::Value(value, release) => Outcome::Value(UseResourceGuard {
                value: Some(value),
                release: Some(release),
            }),
            SetupResult::Error(e) => Outcome::Error(e),
            SetupResult::Stopped => Outcome::Stopped,
        }
    })
}
