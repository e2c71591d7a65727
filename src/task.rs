// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The three-channel completion contract and the root driver, `sync_wait`.
//!
//! A [`Future`] is already cold (inert until polled) and single-continuation
//! (only the executor that owns it holds a waker), so it is the natural
//! carrier for the "Task" concept: no hand-rolled coroutine state machine is
//! needed the way the C++ original requires one.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use crate::io_context::IoContext;

/// The three-channel result of a suspendable computation: exactly one of
/// these is ever produced for a given task.
#[derive(Debug)]
pub enum Outcome<T, E> {
    Value(T),
    Error(E),
    Stopped,
}

impl<T, E> Outcome<T, E> {
    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Outcome::Stopped)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U, E> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Stopped => Outcome::Stopped,
        }
    }

    pub fn map_err<F>(self, f: impl FnOnce(E) -> F) -> Outcome<T, F> {
        match self {
            Outcome::Value(v) => Outcome::Value(v),
            Outcome::Error(e) => Outcome::Error(f(e)),
            Outcome::Stopped => Outcome::Stopped,
        }
    }

    /// Converts to a `Result`, collapsing `Stopped` into `Ok(None)` and a
    /// value into `Ok(Some(_))`, per `stopped_as_optional`'s contract.
    pub fn into_result_optional(self) -> Result<Option<T>, E> {
        match self {
            Outcome::Value(v) => Ok(Some(v)),
            Outcome::Error(e) => Err(e),
            Outcome::Stopped => Ok(None),
        }
    }
}

/// A sender: any future producing a three-channel outcome. Constructing one
/// does no work; only polling (awaiting) it does.
pub trait Sender<T, E>: Future<Output = Outcome<T, E>> + Send {}

impl<T, E, F> Sender<T, E> for F where F: Future<Output = Outcome<T, E>> + Send {}

/// A boxed, type-erased sender — the `Task<T>` of the external interface.
pub type Task<T, E> = Pin<Box<dyn Sender<T, E>>>;

pub fn boxed<T, E>(fut: impl Sender<T, E> + 'static) -> Task<T, E> {
    Box::pin(fut)
}

pub fn ready<T, E>(value: T) -> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    boxed(std::future::ready(Outcome::Value(value)))
}

pub fn error<T, E>(err: E) -> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    boxed(std::future::ready(Outcome::Error(err)))
}

pub fn stopped<T, E>() -> Task<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    boxed(std::future::ready(Outcome::Stopped))
}

/// Drives a fresh, private [`IoContext`] until `sender` produces a terminal
/// outcome, then reports the error (if any) to the caller.
///
/// This is the error-preserving counterpart to [`sync_wait`]; the latter is
/// kept signature-compatible with the external interface (`Option<T>`),
/// which silently discards both "stopped" and "errored".
pub fn try_sync_wait<T, E>(sender: impl Sender<T, E> + 'static) -> Result<Option<T>, E>
where
    T: Send + 'static,
    E: fmt::Debug + Send + 'static,
{
    let context = IoContext::new(crate::io_context::Config::default());
    let outcome = context.run_until_complete(sender);
    outcome.into_result_optional()
}

/// Drives a fresh, private [`IoContext`] until `sender` produces a terminal
/// outcome. Returns `None` for both "stopped" and "errored" completions,
/// matching the external interface's `sync_wait(sender) -> optional<T>`.
pub fn sync_wait<T, E>(sender: impl Sender<T, E> + 'static) -> Option<T>
where
    T: Send + 'static,
    E: fmt::Debug + Send + 'static,
{
    match try_sync_wait(sender) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(?err, "sync_wait: root sender completed with an error");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_wait_of_ready_value() {
        let result: Option<i32> = sync_wait(std::future::ready(Outcome::<i32, String>::Value(42)));
        assert_eq!(result, Some(42));
    }

    #[test]
    fn sync_wait_of_stopped_is_none() {
        let result: Option<i32> = sync_wait(std::future::ready(Outcome::<i32, String>::Stopped));
        assert_eq!(result, None);
    }

    #[test]
    fn try_sync_wait_preserves_error() {
        let result: Result<Option<i32>, String> =
            try_sync_wait(std::future::ready(Outcome::<i32, String>::Error(
                "boom".to_string(),
            )));
        assert_eq!(result, Err("boom".to_string()));
    }
}
