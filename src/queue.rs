// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An unbounded async FIFO queue: `push` never blocks, `pop` waits (in
//! request order) until a value is available.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use crate::task::{Outcome, Task};
use crate::util::{Completion, CompletionFuture};

struct State<T> {
    values: VecDeque<T>,
    waiters: VecDeque<Completion<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// An unbounded FIFO queue with async `pop`. Cheap to clone; every clone
/// shares the same underlying queue.
pub struct AsyncQueue<T>(Arc<Inner<T>>);

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        AsyncQueue(self.0.clone())
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncQueue<T> {
    pub fn new() -> Self {
        AsyncQueue(Arc::new(Inner {
            state: Mutex::new(State {
                values: VecDeque::new(),
                waiters: VecDeque::new(),
            }),
        }))
    }
}

impl<T: Send + 'static> AsyncQueue<T> {
    /// Pushes `value` onto the back of the queue, or hands it directly to
    /// the longest-waiting `pop()` if one is pending.
    pub fn push(&self, value: T) -> Task<(), Infallible> {
        let mut state = self.0.state.lock().unwrap();
        match state.waiters.pop_front() {
            Some(waiter) => {
                drop(state);
                waiter.resolve(value);
            }
            None => state.values.push_back(value),
        }
        crate::task::ready(())
    }

    /// Pops the oldest value, waiting if the queue is currently empty.
    /// Waiters are served in the order `pop()` was called.
    pub fn pop(&self) -> Task<T, Infallible> {
        let inner = self.0.clone();
        crate::task::boxed(async move {
            let waiter = {
                let mut state = inner.state.lock().unwrap();
                match state.values.pop_front() {
                    Some(value) => return Outcome::Value(value),
                    None => {
                        let waiter = Completion::new();
                        state.waiters.push_back(waiter.clone());
                        waiter
                    }
                }
            };
            Outcome::Value(CompletionFuture(waiter).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::pool::{Config, StaticThreadPool};

    #[test]
    fn push_then_pop_is_fifo() {
        let queue: AsyncQueue<i32> = AsyncQueue::new();
        let result = crate::task::sync_wait(async move {
            queue.push(1).await;
            queue.push(2).await;
            let a = queue.pop().await.value().unwrap();
            let b = queue.pop().await.value().unwrap();
            Outcome::<(i32, i32), PoolError>::Value((a, b))
        });
        assert_eq!(result, Some((1, 2)));
    }

    #[test]
    fn pop_before_push_is_woken_in_request_order() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            ..Config::default()
        });
        let queue: AsyncQueue<i32> = AsyncQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = crate::scope::AsyncScope::new(pool.handle());
        for id in 0..3 {
            let queue = queue.clone();
            let order = order.clone();
            scope
                .spawn(async move {
                    let value = queue.pop().await.value().unwrap();
                    order.lock().unwrap().push((id, value));
                })
                .unwrap();
        }
        crate::task::sync_wait({
            let queue = queue.clone();
            async move {
                queue.push(10).await;
                queue.push(20).await;
                queue.push(30).await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        crate::task::sync_wait({
            let scope = scope.clone();
            async move {
                scope.close().await;
                Outcome::<(), PoolError>::Value(())
            }
        });
        let mut values: Vec<i32> = order.lock().unwrap().iter().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, vec![10, 20, 30]);
    }
}
