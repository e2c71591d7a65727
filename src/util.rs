// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Small internal plumbing shared by the reactor and the scoped primitives:
//! a one-shot "resume with a value" cell standing in for the original's
//! `coroutine_handle::resume()`.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Inner<T> {
    value: Option<T>,
    waker: Option<Waker>,
}

/// A single-value, single-consumer completion cell. Cloning shares the same
/// underlying slot: one side calls `resolve`, the other polls.
pub(crate) struct Completion<T>(Arc<Mutex<Inner<T>>>);

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Completion(self.0.clone())
    }
}

impl<T> Completion<T> {
    pub(crate) fn new() -> Self {
        Completion(Arc::new(Mutex::new(Inner {
            value: None,
            waker: None,
        })))
    }

    pub(crate) fn resolve(&self, value: T) {
        let waker = {
            let mut inner = self.0.lock().unwrap();
            inner.value = Some(value);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn poll(&self, cx: &mut Context<'_>) -> Poll<T> {
        let mut inner = self.0.lock().unwrap();
        if let Some(value) = inner.value.take() {
            Poll::Ready(value)
        } else {
            inner.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }

    /// Identity comparison between two handles to the same slot, used by
    /// waiters that must find and remove themselves from a shared list
    /// (e.g. `AsyncUnorderedMap::wait_for`'s cancellation path).
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A future adapter over [`Completion`], so it can be `.await`ed directly.
pub(crate) struct CompletionFuture<T>(pub(crate) Completion<T>);

impl<T> Future for CompletionFuture<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        self.0.poll(cx)
    }
}

/// A FIFO set of wakers, for primitives that must wake every waiter at once
/// (`AsyncScope::close`, `AsyncUnorderedMap::emplace`).
#[derive(Default)]
pub(crate) struct WakeAll(Mutex<Vec<Waker>>);

impl WakeAll {
    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock().unwrap();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.0.lock().unwrap());
        for waker in wakers {
            waker.wake();
        }
    }
}
