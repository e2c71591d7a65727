// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A FIFO async mutex: waiters are granted the lock in the order they
//! called [`Strand::lock`], and releasing hands off directly to the next
//! waiter rather than letting the scheduler reorder who goes next.
//!
//! The original expresses the guarded section as a receiver callback
//! (`lock()` returns an `Observable<void>` whose subscriber body *is* the
//! critical section, because a C++ coroutine has no safe way to suspend
//! across a caller-held RAII guard). A [`Future`] plus a drop-released guard
//! gives Rust the same FIFO exclusion without the callback indirection, so
//! `lock()` here returns a guard future in the shape of `std::sync::Mutex`/
//! `tokio::sync::Mutex` instead.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::util::Completion;

struct State {
    held: bool,
    waiters: VecDeque<Completion<()>>,
}

struct Inner {
    state: Mutex<State>,
}

/// A mutual-exclusion primitive for async code: at most one [`StrandGuard`]
/// exists at a time, and waiters queue up FIFO.
#[derive(Clone)]
pub struct Strand(Arc<Inner>);

impl Default for Strand {
    fn default() -> Self {
        Self::new()
    }
}

impl Strand {
    pub fn new() -> Self {
        Strand(Arc::new(Inner {
            state: Mutex::new(State {
                held: false,
                waiters: VecDeque::new(),
            }),
        }))
    }

    /// Returns a future that resolves to a [`StrandGuard`] once this strand
    /// is free. Waiters are queued in the order `lock` was called, not in
    /// the order the executor happens to poll them.
    pub fn lock(&self) -> Lock {
        Lock {
            strand: self.clone(),
            waiter: None,
        }
    }

    fn release(&self) {
        let mut state = self.0.state.lock().unwrap();
        match state.waiters.pop_front() {
            Some(next) => {
                // ownership transfers directly to `next`; `held` stays true
                // the whole time so no other `lock()` caller can slip in
                // between the hand-off and `next` actually resuming.
                drop(state);
                next.resolve(());
            }
            None => state.held = false,
        }
    }
}

/// The future returned by [`Strand::lock`].
pub struct Lock {
    strand: Strand,
    waiter: Option<Completion<()>>,
}

impl Future for Lock {
    type Output = StrandGuard;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<StrandGuard> {
        if let Some(waiter) = &self.waiter {
            return waiter.poll(cx).map(|()| StrandGuard {
                strand: self.strand.clone(),
            });
        }
        let mut state = self.strand.0.state.lock().unwrap();
        if !state.held {
            state.held = true;
            return Poll::Ready(StrandGuard {
                strand: self.strand.clone(),
            });
        }
        let waiter = Completion::new();
        state.waiters.push_back(waiter.clone());
        drop(state);
        let poll = waiter.poll(cx);
        self.waiter = Some(waiter);
        poll.map(|()| StrandGuard {
            strand: self.strand.clone(),
        })
    }
}

/// Proof of exclusive access to a [`Strand`]. Releases the strand to the
/// next waiter (or marks it free) when dropped.
pub struct StrandGuard {
    strand: Strand,
}

impl Drop for StrandGuard {
    fn drop(&mut self) {
        self.strand.release();
    }
}
