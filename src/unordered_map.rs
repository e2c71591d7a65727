// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A keyed wait map: `wait_for(key)` suspends until some `emplace` inserts
//! that key, and is cancellation-safe — a stopped waiter removes itself
//! from the wait list instead of leaking it.

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::env::StopToken;
use crate::pool::PoolHandle;
use crate::scope::{AsyncScope, NestError};
use crate::task::{Outcome, Task};
use crate::util::{Completion, CompletionFuture};

enum WaitOutcome<V> {
    Value(V),
    Cancelled,
}

struct State<K, V> {
    map: HashMap<K, V>,
    waiters: HashMap<K, VecDeque<Completion<WaitOutcome<V>>>>,
}

struct Inner<K, V> {
    scope: AsyncScope,
    state: Mutex<State<K, V>>,
}

/// A map whose entries may be awaited before they exist. Every clone shares
/// the same underlying map and the same [`AsyncScope`], so [`close`](Self::close)
/// on any clone waits for every in-flight `emplace`/`wait_for` across all of
/// them.
pub struct AsyncUnorderedMap<K, V>(Arc<Inner<K, V>>);

impl<K, V> Clone for AsyncUnorderedMap<K, V> {
    fn clone(&self) -> Self {
        AsyncUnorderedMap(self.0.clone())
    }
}

impl<K, V> AsyncUnorderedMap<K, V> {
    pub fn new(pool: PoolHandle) -> Self {
        AsyncUnorderedMap(Arc::new(Inner {
            scope: AsyncScope::new(pool),
            state: Mutex::new(State {
                map: HashMap::new(),
                waiters: HashMap::new(),
            }),
        }))
    }
}

impl<K, V> AsyncUnorderedMap<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Inserts `value` under `key` unless it is already present. Resolves
    /// every waiter blocked on this key if the insertion succeeds.
    pub fn emplace(&self, key: K, value: V) -> Task<bool, NestError<Infallible>> {
        let inner = self.0.clone();
        self.0.scope.nest(async move {
            let waiters = {
                let mut state = inner.state.lock().unwrap();
                if state.map.contains_key(&key) {
                    return Outcome::Value(false);
                }
                state.map.insert(key.clone(), value.clone());
                state.waiters.remove(&key)
            };
            if let Some(waiters) = waiters {
                for waiter in waiters {
                    waiter.resolve(WaitOutcome::Value(value.clone()));
                }
            }
            Outcome::Value(true)
        })
    }

    /// Waits for `key` to be present, returning its value. If `stop_token`
    /// is cancelled first, removes this waiter from the wait list and
    /// completes as `Stopped` rather than leaking a dangling registration.
    pub fn wait_for(&self, key: K, stop_token: StopToken) -> Task<V, NestError<Infallible>> {
        let inner = self.0.clone();
        self.0.scope.nest(async move {
            {
                let state = inner.state.lock().unwrap();
                if let Some(value) = state.map.get(&key) {
                    return Outcome::Value(value.clone());
                }
            }
            let completion: Completion<WaitOutcome<V>> = Completion::new();
            {
                let mut state = inner.state.lock().unwrap();
                if let Some(value) = state.map.get(&key) {
                    return Outcome::Value(value.clone());
                }
                state
                    .waiters
                    .entry(key.clone())
                    .or_default()
                    .push_back(completion.clone());
            }
            let guard = {
                let inner = inner.clone();
                let key = key.clone();
                let completion = completion.clone();
                stop_token.on_stop(move || {
                    let mut state = inner.state.lock().unwrap();
                    if let Some(list) = state.waiters.get_mut(&key) {
                        if let Some(pos) = list.iter().position(|c| c.ptr_eq(&completion)) {
                            list.remove(pos);
                            if list.is_empty() {
                                state.waiters.remove(&key);
                            }
                            drop(state);
                            completion.resolve(WaitOutcome::Cancelled);
                        }
                    }
                })
            };
            let outcome = CompletionFuture(completion).await;
            drop(guard);
            match outcome {
                WaitOutcome::Value(value) => Outcome::Value(value),
                WaitOutcome::Cancelled => Outcome::Stopped,
            }
        })
    }

    /// Stops accepting new `emplace`/`wait_for` calls and waits for every
    /// in-flight one to finish, per [`AsyncScope::close`].
    pub async fn close(&self) {
        self.0.scope.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use crate::pool::{Config, StaticThreadPool};

    #[test]
    fn wait_for_existing_key_resolves_immediately() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let map: AsyncUnorderedMap<&'static str, i32> = AsyncUnorderedMap::new(pool.handle());
        let result = crate::task::sync_wait(async move {
            map.emplace("a", 1).await;
            let value = map.wait_for("a", StopToken::never_stopped()).await.value();
            Outcome::<Option<i32>, PoolError>::Value(value)
        });
        assert_eq!(result, Some(Some(1)));
    }

    #[test]
    fn wait_for_unblocks_on_matching_emplace() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 4,
            ..Config::default()
        });
        let map: AsyncUnorderedMap<&'static str, i32> = AsyncUnorderedMap::new(pool.handle());
        let scope = crate::scope::AsyncScope::new(pool.handle());
        let seen = Arc::new(Mutex::new(None));
        {
            let map = map.clone();
            let seen = seen.clone();
            scope
                .spawn(async move {
                    let value = map.wait_for("k", StopToken::never_stopped()).await.value();
                    *seen.lock().unwrap() = value;
                })
                .unwrap();
        }
        crate::task::sync_wait({
            let map = map.clone();
            async move {
                map.emplace("k", 99).await;
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
        assert_eq!(*seen.lock().unwrap(), Some(Some(99)));
    }

    #[test]
    fn second_emplace_of_same_key_is_a_no_op() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let map: AsyncUnorderedMap<&'static str, i32> = AsyncUnorderedMap::new(pool.handle());
        let result = crate::task::sync_wait(async move {
            let first = map.emplace("a", 1).await.value();
            let second = map.emplace("a", 2).await.value();
            Outcome::<(Option<bool>, Option<bool>), PoolError>::Value((first, second))
        });
        assert_eq!(result, Some((Some(true), Some(false))));
    }

    #[test]
    fn cancelling_a_waiter_removes_it_without_leaking() {
        let pool = StaticThreadPool::new(Config {
            worker_count: 1,
            ..Config::default()
        });
        let map: AsyncUnorderedMap<&'static str, i32> = AsyncUnorderedMap::new(pool.handle());
        let stop_source = crate::env::StopSource::new();
        let result = crate::task::try_sync_wait({
            let map = map.clone();
            let token = stop_source.token();
            async move {
                stop_source.request_stop();
                map.wait_for("never", token).await
            }
        });
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), None);
    }
}
