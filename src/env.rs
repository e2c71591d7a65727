// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-task environment: a cancellation token, a scheduler handle, and
//! an extensible set of queries a parent may answer for its children.
//!
//! Environments are passed explicitly rather than through a thread-local
//! "current environment" (see the re-architecture guidance on global
//! state): every sender that needs one takes an `&Env` or owns a clone.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// The reactor handle an environment may carry as its "scheduler" query
/// answer. Scoped primitives that need the thread pool instead hold a
/// `pool::PoolHandle` directly, captured at construction time, rather than
/// fetching it out of the environment — the pool's own `enqueue` API is the
/// load-bearing interface there, not a generic env query.
pub type SchedulerHandle = crate::io_context::IoScheduler;

struct StopInner {
    requested: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Box<dyn FnOnce() + Send>)>>,
}

/// The cancelling half of a stop-token pair.
#[derive(Clone)]
pub struct StopSource(Arc<StopInner>);

/// The observing half of a stop-token pair. Cheap to clone; many tasks may
/// hold a token for the same source.
#[derive(Clone)]
pub struct StopToken(Arc<StopInner>);

/// Guard returned by [`StopToken::on_stop`]; unregisters the callback on
/// drop unless it has already fired.
pub struct StopCallback {
    inner: Arc<StopInner>,
    id: Option<u64>,
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSource {
    pub fn new() -> Self {
        Self(Arc::new(StopInner {
            requested: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            callbacks: Mutex::new(Vec::new()),
        }))
    }

    pub fn token(&self) -> StopToken {
        StopToken(self.0.clone())
    }

    /// Requests stop. Idempotent: returns `true` only the first time it
    /// actually transitions the source, and runs every registered callback
    /// exactly once in that case.
    pub fn request_stop(&self) -> bool {
        if self.0.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.0.callbacks.lock().unwrap());
        for (_, cb) in callbacks {
            cb();
        }
        true
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }
}

impl StopToken {
    /// A token that can never be stopped, used as the default answer to
    /// `get_stop_token` when no parent has installed one.
    pub fn never_stopped() -> Self {
        StopSource::new().token()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Registers `f` to run when stop is requested. If stop has already
    /// been requested, `f` runs inline before this returns, matching
    /// `std::stop_callback`'s construction-time semantics.
    pub fn on_stop(&self, f: impl FnOnce() + Send + 'static) -> StopCallback {
        if self.0.requested.load(Ordering::SeqCst) {
            f();
            return StopCallback {
                inner: self.0.clone(),
                id: None,
            };
        }
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        let mut callbacks = self.0.callbacks.lock().unwrap();
        // stop may have been requested while we waited for the lock
        if self.0.requested.load(Ordering::SeqCst) {
            drop(callbacks);
            f();
            return StopCallback {
                inner: self.0.clone(),
                id: None,
            };
        }
        callbacks.push((id, Box::new(f)));
        StopCallback {
            inner: self.0.clone(),
            id: Some(id),
        }
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        if let Some(id) = self.id {
            let mut callbacks = self.inner.callbacks.lock().unwrap();
            callbacks.retain(|(cb_id, _)| *cb_id != id);
        }
    }
}

/// A query tag. `get_stop_token`/`get_scheduler` are the two standard
/// queries; combinators may define their own for `write_env`/`read_env`.
pub trait Query: 'static {
    type Value: Clone + Send + Sync + 'static;

    fn default_value() -> Self::Value;
}

pub struct GetStopToken;

impl Query for GetStopToken {
    type Value = StopToken;

    fn default_value() -> StopToken {
        StopToken::never_stopped()
    }
}

pub struct GetScheduler;

impl Query for GetScheduler {
    type Value = Option<SchedulerHandle>;

    fn default_value() -> Option<SchedulerHandle> {
        None
    }
}

enum Node {
    Root(HashMap<TypeId, Arc<dyn Any + Send + Sync>>),
    Overlay {
        type_id: TypeId,
        value: Arc<dyn Any + Send + Sync>,
        parent: Env,
    },
}

/// An immutable, cheaply-cloned per-task environment.
#[derive(Clone)]
pub struct Env(Arc<Node>);

impl Env {
    pub fn new(stop_token: StopToken, scheduler: Option<SchedulerHandle>) -> Self {
        let mut defaults: HashMap<TypeId, Arc<dyn Any + Send + Sync>> = HashMap::new();
        defaults.insert(TypeId::of::<GetStopToken>(), Arc::new(stop_token));
        defaults.insert(TypeId::of::<GetScheduler>(), Arc::new(scheduler));
        Env(Arc::new(Node::Root(defaults)))
    }

    /// The environment a program with no ambient stop source or scheduler
    /// starts from: a never-stopped token, no scheduler.
    pub fn empty() -> Self {
        Self::new(StopToken::never_stopped(), None)
    }

    /// Returns a child environment that answers `Q` with `value`, forwarding
    /// every other query to `self`. This is the building block behind
    /// `write_env`.
    pub fn overlay<Q: Query>(&self, value: Q::Value) -> Self {
        Env(Arc::new(Node::Overlay {
            type_id: TypeId::of::<Q>(),
            value: Arc::new(value),
            parent: self.clone(),
        }))
    }

    pub fn query<Q: Query>(&self) -> Q::Value {
        let mut node = self;
        loop {
            match &*node.0 {
                Node::Overlay {
                    type_id,
                    value,
                    parent,
                } => {
                    if *type_id == TypeId::of::<Q>() {
                        return value
                            .downcast_ref::<Q::Value>()
                            .expect("query value type mismatch")
                            .clone();
                    }
                    node = parent;
                }
                Node::Root(defaults) => {
                    return defaults
                        .get(&TypeId::of::<Q>())
                        .and_then(|v| v.downcast_ref::<Q::Value>())
                        .cloned()
                        .unwrap_or_else(Q::default_value);
                }
            }
        }
    }

    pub fn stop_token(&self) -> StopToken {
        self.query::<GetStopToken>()
    }

    pub fn scheduler(&self) -> Option<SchedulerHandle> {
        self.query::<GetScheduler>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_token_never_stops() {
        let env = Env::empty();
        assert!(!env.stop_token().is_stop_requested());
    }

    #[test]
    fn overlay_answers_its_own_query_and_forwards_others() {
        struct Marker;
        impl Query for Marker {
            type Value = u32;
            fn default_value() -> u32 {
                0
            }
        }

        let source = StopSource::new();
        let base = Env::new(source.token(), None);
        let child = base.overlay::<Marker>(42);

        assert_eq!(child.query::<Marker>(), 42);
        assert!(!child.stop_token().is_stop_requested());
        source.request_stop();
        assert!(child.stop_token().is_stop_requested());
    }

    #[test]
    fn stop_callback_fires_once_and_unregisters_on_drop() {
        use std::sync::atomic::AtomicUsize;

        let source = StopSource::new();
        let token = source.token();
        let count = Arc::new(AtomicUsize::new(0));

        let count2 = count.clone();
        let guard = token.on_stop(move || {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        drop(guard);
        source.request_stop();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let count3 = count.clone();
        let source2 = StopSource::new();
        let _guard2 = source2.token().on_stop(move || {
            count3.fetch_add(1, Ordering::SeqCst);
        });
        source2.request_stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
