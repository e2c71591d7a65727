// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cold, multi-shot producer built on top of [`Task`]: each emission hands
//! the receiver a fresh `Task<T, E>`, and the receiver must await it (or
//! explicitly discard it) before the next emission is produced.
//!
//! An async closure is not yet expressible as a trait object on stable, so
//! [`Receiver`] is the boxed-future-returning-closure shape the wider
//! `futures` ecosystem uses for the same reason.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use crate::task::{Outcome, Task};

/// A callback invoked once per emission with a fresh, lazy `Task<T, E>`.
/// Must be polled to completion (or intentionally dropped) before the
/// source produces its next value.
pub type Receiver<T, E> = Box<dyn FnMut(Task<T, E>) -> Pin<Box<dyn Future<Output = Outcome<(), E>> + Send>> + Send>;

/// A cold, multi-shot producer. Subscribing is a one-shot operation — the
/// same `Observable` cannot be subscribed twice, matching the original's
/// move-only subscribe.
pub struct Observable<T, E>(Box<dyn FnOnce(Receiver<T, E>) -> Task<(), E> + Send>);

impl<T, E> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(subscribe: impl FnOnce(Receiver<T, E>) -> Task<(), E> + Send + 'static) -> Self {
        Observable(Box::new(subscribe))
    }

    /// Drives the source: calls `receiver` once per emission, in order,
    /// awaiting each returned `Task<(), E>` before producing the next value.
    pub fn subscribe(self, receiver: Receiver<T, E>) -> Task<(), E> {
        (self.0)(receiver)
    }
}

/// Calls the shared receiver once, dropping the lock before the returned
/// future is awaited (the future itself owns everything it needs).
pub(crate) type SharedReceiver<T, E> = Arc<Mutex<Receiver<T, E>>>;

pub(crate) fn call_receiver<T, E>(
    receiver: &SharedReceiver<T, E>,
    task: Task<T, E>,
) -> Pin<Box<dyn Future<Output = Outcome<(), E>> + Send>> {
    let mut guard = receiver.lock().unwrap();
    (guard)(task)
}

/// An observable with exactly one emission: `sender`'s outcome.
pub fn single<T, E>(sender: impl Future<Output = Outcome<T, E>> + Send + 'static) -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Observable::new(move |mut receiver| {
        crate::task::boxed(async move { (receiver)(crate::task::boxed(sender)).await })
    })
}

/// An observable with no emissions; its subscription task completes
/// immediately with a value.
pub fn empty<T, E>() -> Observable<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Observable::new(|_receiver| crate::task::ready(()))
}

/// Maps every emitted value through `f` before it reaches the downstream
/// receiver. Errors and stopped signals pass through unchanged.
pub fn then<T, U, E>(src: Observable<T, E>, f: impl Fn(T) -> U + Send + Clone + 'static) -> Observable<U, E>
where
    T: Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    Observable::new(move |receiver| {
        let receiver: SharedReceiver<U, E> = Arc::new(Mutex::new(receiver));
        let inner: Receiver<T, E> = Box::new(move |task: Task<T, E>| {
            let f = f.clone();
            let receiver = receiver.clone();
            Box::pin(async move {
                let mapped: Task<U, E> = match task.await {
                    Outcome::Value(v) => crate::task::ready(f(v)),
                    Outcome::Error(e) => crate::task::error(e),
                    Outcome::Stopped => crate::task::stopped(),
                };
                call_receiver(&receiver, mapped).await
            })
        });
        src.subscribe(inner)
    })
}

/// Bridges the first emission of `src` directly into a `Task`: awaits the
/// first value, then signals the source to stop producing more.
pub fn first<T, E>(src: Observable<T, E>) -> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    crate::task::boxed(async move {
        let captured: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
        let captured_for_receiver = captured.clone();
        let receiver: Receiver<T, E> = Box::new(move |task: Task<T, E>| {
            let captured = captured_for_receiver.clone();
            Box::pin(async move {
                match task.await {
                    Outcome::Value(v) => {
                        *captured.lock().unwrap() = Some(v);
                        Outcome::Stopped
                    }
                    Outcome::Error(e) => Outcome::Error(e),
                    Outcome::Stopped => Outcome::Stopped,
                }
            })
        });
        let subscription_outcome = src.subscribe(receiver).await;
        match captured.lock().unwrap().take() {
            Some(value) => Outcome::Value(value),
            None => match subscription_outcome {
                Outcome::Value(()) => Outcome::Stopped,
                Outcome::Error(e) => Outcome::Error(e),
                Outcome::Stopped => Outcome::Stopped,
            },
        }
    })
}

/// Pairs the first emission of `a` with the first emission of `b`. A
/// simplification of the original's streaming, N-ary `zip`: since every
/// `Observable` in this crate is ultimately backed by a `Task` that emits at
/// most once, zipping reduces to "take the first of each, then pair them".
pub fn zip<T1, T2, E>(a: Observable<T1, E>, b: Observable<T2, E>) -> Observable<(T1, T2), E>
where
    T1: Send + 'static,
    T2: Send + 'static,
    E: Send + 'static,
{
    Observable::new(move |mut receiver| {
        crate::task::boxed(async move {
            let value_a = match first(a).await {
                Outcome::Value(v) => v,
                Outcome::Error(e) => return Outcome::Error(e),
                Outcome::Stopped => return Outcome::Stopped,
            };
            let value_b = match first(b).await {
                Outcome::Value(v) => v,
                Outcome::Error(e) => return Outcome::Error(e),
                Outcome::Stopped => return Outcome::Stopped,
            };
            (receiver)(crate::task::ready((value_a, value_b))).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;

    #[test]
    fn single_emits_exactly_one_value() {
        let result = crate::task::sync_wait(async move {
            let obs: Observable<i32, PoolError> = single(async { Outcome::Value(7) });
            let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
            let seen2 = seen.clone();
            let receiver: Receiver<i32, PoolError> = Box::new(move |task| {
                let seen2 = seen2.clone();
                Box::pin(async move {
                    if let Outcome::Value(v) = task.await {
                        seen2.lock().unwrap().push(v);
                    }
                    Outcome::Value(())
                })
            });
            obs.subscribe(receiver).await;
            Outcome::<Vec<i32>, PoolError>::Value(seen.lock().unwrap().clone())
        });
        assert_eq!(result, Some(vec![7]));
    }

    #[test]
    fn empty_observable_never_emits() {
        let result = crate::task::sync_wait(async move {
            let obs: Observable<i32, PoolError> = empty();
            let calls = Arc::new(Mutex::new(0));
            let calls2 = calls.clone();
            let receiver: Receiver<i32, PoolError> = Box::new(move |_task| {
                let calls2 = calls2.clone();
                Box::pin(async move {
                    *calls2.lock().unwrap() += 1;
                    Outcome::Value(())
                })
            });
            obs.subscribe(receiver).await;
            Outcome::<i32, PoolError>::Value(*calls.lock().unwrap())
        });
        assert_eq!(result, Some(0));
    }

    #[test]
    fn then_maps_the_emitted_value() {
        let obs: Observable<i32, PoolError> = single(async { Outcome::Value(3) });
        let mapped = then(obs, |v| v * 10);
        let value = crate::task::sync_wait(first(mapped));
        assert_eq!(value, Some(30));
    }

    #[test]
    fn first_of_single_yields_its_value() {
        let obs: Observable<i32, PoolError> = single(async { Outcome::Value(42) });
        let value = crate::task::sync_wait(first(obs));
        assert_eq!(value, Some(42));
    }

    #[test]
    fn zip_pairs_both_first_values() {
        let a: Observable<i32, PoolError> = single(async { Outcome::Value(1) });
        let b: Observable<&'static str, PoolError> = single(async { Outcome::Value("x") });
        let value = crate::task::sync_wait(first(zip(a, b)));
        assert_eq!(value, Some((1, "x")));
    }
}
