// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A structured-concurrency async execution core.
//!
//! Four subsystems compose the runtime: a single-threaded reactor
//! ([`io_context`]), a work-stealing thread pool ([`pool`]), a cold
//! sender/receiver task algebra ([`task`], [`observable`], [`combinators`]),
//! and a set of scoped concurrency primitives ([`scope`], [`strand`],
//! [`channel`], [`queue`], [`unordered_map`]).

pub mod channel;
pub mod combinators;
pub mod env;
pub mod error;
pub mod io_context;
pub mod observable;
pub mod pool;
pub mod queue;
pub mod scope;
pub mod strand;
pub mod task;
pub mod unordered_map;
mod util;

pub use combinators::{
    read_env, stopped_as_optional, use_resource, when_all2, when_all3, when_any2, write_env, Either2, UseResourceGuard,
};
pub use env::{Env, StopSource, StopToken};
pub use error::CoreError;
pub use io_context::{Config as IoContextConfig, IoContext, IoScheduler, Interest};
pub use observable::{empty, first, single, then, zip, Observable, Receiver};
pub use pool::{Config as PoolConfig, StaticThreadPool};
pub use task::{sync_wait, try_sync_wait, Outcome, Task};
