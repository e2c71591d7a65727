// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Typed errors for every module, plus a type-erased aggregate for call
//! sites that need to unify errors from heterogeneous children (`when_all`,
//! `when_any`).

use std::io;
use std::sync::Arc;

/// A scope has stopped accepting new work.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("scope is closed")]
pub struct ScopeClosedError;

/// `AsyncChannel::send` attempted to deposit a value while one was already
/// pending; the channel's zero-capacity invariant was violated.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("channel already has a value pending")]
pub struct ChannelOverflowError;

/// The reactor's command queue or wake-up handle could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("reactor has already stopped")]
    Stopped,
    #[error("i/o error driving the reactor: {0}")]
    Io(#[from] io::Error),
}

/// `StaticThreadPool::enqueue`/`schedule_bulk` failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("thread pool has been shut down")]
    Closed,
}

/// Crate-level type-erased error, used where multiple children with
/// different concrete error types must be unified into one channel (e.g.
/// `when_all` surfacing the first of N heterogeneous child errors).
#[derive(Debug, Clone, thiserror::Error)]
#[error(transparent)]
pub struct CoreError(Arc<dyn std::error::Error + Send + Sync + 'static>);

impl CoreError {
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Arc::new(err))
    }
}

impl From<ScopeClosedError> for CoreError {
    fn from(err: ScopeClosedError) -> Self {
        CoreError::new(err)
    }
}

impl From<ChannelOverflowError> for CoreError {
    fn from(err: ChannelOverflowError) -> Self {
        CoreError::new(err)
    }
}

impl From<ReactorError> for CoreError {
    fn from(err: ReactorError) -> Self {
        CoreError::new(err)
    }
}

impl From<PoolError> for CoreError {
    fn from(err: PoolError) -> Self {
        CoreError::new(err)
    }
}
