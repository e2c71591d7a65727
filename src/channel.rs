// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-slot rendezvous channel: `send` either hands its value directly
//! to an already-waiting `receive`, or buffers it until one arrives.
//! Sending while a value is already buffered is a [`ChannelOverflowError`],
//! not a queueing opportunity — the buffer holds at most one value.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::ChannelOverflowError;
use crate::task::{Outcome, Task};
use crate::util::{Completion, CompletionFuture};

struct State<T> {
    value: Option<T>,
    send_ack: Option<Completion<()>>,
    receivers: VecDeque<Completion<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

/// A zero-capacity-beyond-one rendezvous channel between senders and
/// receivers. Cheap to clone; every clone refers to the same underlying
/// slot.
pub struct AsyncChannel<T>(Arc<Inner<T>>);

impl<T> Clone for AsyncChannel<T> {
    fn clone(&self) -> Self {
        AsyncChannel(self.0.clone())
    }
}

impl<T> Default for AsyncChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncChannel<T> {
    pub fn new() -> Self {
        AsyncChannel(Arc::new(Inner {
            state: Mutex::new(State {
                value: None,
                send_ack: None,
                receivers: VecDeque::new(),
            }),
        }))
    }
}

impl<T: Send + 'static> AsyncChannel<T> {
    /// Deposits `value`. Resolves once some `receive()` has actually taken
    /// it (immediately, if a receiver is already waiting). Fails without
    /// suspending if a previous value is still buffered.
    pub fn send(&self, value: T) -> Task<(), ChannelOverflowError> {
        let inner = self.0.clone();
        crate::task::boxed(async move {
            let handoff = {
                let mut state = inner.state.lock().unwrap();
                if state.value.is_some() {
                    return Outcome::Error(ChannelOverflowError);
                }
                match state.receivers.pop_front() {
                    Some(waiting) => Handoff::Direct(waiting, value),
                    None => {
                        let ack = Completion::new();
                        state.value = Some(value);
                        state.send_ack = Some(ack.clone());
                        Handoff::Buffered(ack)
                    }
                }
            };
            match handoff {
                Handoff::Direct(waiting, value) => {
                    waiting.resolve(value);
                }
                Handoff::Buffered(ack) => {
                    CompletionFuture(ack).await;
                }
            }
            Outcome::Value(())
        })
    }

    /// Waits for a value: takes one immediately if already buffered,
    /// otherwise queues as a waiter in the order `receive()` was called.
    pub fn receive(&self) -> Task<T, std::convert::Infallible> {
        let inner = self.0.clone();
        crate::task::boxed(async move {
            let taken = {
                let mut state = inner.state.lock().unwrap();
                state.value.take().map(|value| (value, state.send_ack.take()))
            };
            if let Some((value, ack)) = taken {
                if let Some(ack) = ack {
                    ack.resolve(());
                }
                return Outcome::Value(value);
            }
            let waiter = Completion::new();
            {
                let mut state = inner.state.lock().unwrap();
                state.receivers.push_back(waiter.clone());
            }
            Outcome::Value(CompletionFuture(waiter).await)
        })
    }
}

enum Handoff<T> {
    Direct(Completion<T>, T),
    Buffered(Completion<()>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::pool::{Config, StaticThreadPool};

    #[test]
    fn buffered_send_then_receive_round_trips() {
        let channel: AsyncChannel<i32> = AsyncChannel::new();
        let result = crate::task::sync_wait(async move {
            channel.send(42).await;
            let value = channel.receive().await.value().unwrap();
            Outcome::<i32, PoolError>::Value(value)
        });
        assert_eq!(result, Some(42));
    }

    #[test]
    fn second_send_before_consumption_overflows() {
        let channel: AsyncChannel<i32> = AsyncChannel::new();
        let result = crate::task::try_sync_wait(async move {
            channel.send(1).await;
            channel.send(2).await
        });
        assert_eq!(result, Err(ChannelOverflowError));
    }

    #[test]
    fn a_run_of_sends_is_received_in_order() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 2,
            ..Config::default()
        });
        let channel: AsyncChannel<i32> = AsyncChannel::new();
        let scope = crate::scope::AsyncScope::new(pool.handle());
        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let channel = channel.clone();
            let received = received.clone();
            scope
                .spawn(async move {
                    for _ in 0..5 {
                        let value = channel.receive().await.value().unwrap();
                        received.lock().unwrap().push(value);
                    }
                })
                .unwrap();
        }
        crate::task::sync_wait({
            let channel = channel.clone();
            async move {
                for value in 0..5 {
                    channel.send(value).await.value().unwrap();
                }
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
        assert_eq!(*received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn waiting_receiver_gets_value_directly() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 2,
            ..Config::default()
        });
        let channel: AsyncChannel<i32> = AsyncChannel::new();
        let scope = crate::scope::AsyncScope::new(pool.handle());
        let received = Arc::new(Mutex::new(None));
        {
            let channel = channel.clone();
            let received = received.clone();
            scope
                .spawn(async move {
                    let value = channel.receive().await.value().unwrap();
                    *received.lock().unwrap() = Some(value);
                })
                .unwrap();
        }
        crate::task::sync_wait({
            let channel = channel.clone();
            async move {
                // whether the spawned receiver has registered yet or not,
                // the value ends up delivered either directly or buffered.
                channel.send(7).await;
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
        assert_eq!(*received.lock().unwrap(), Some(7));
    }
}
