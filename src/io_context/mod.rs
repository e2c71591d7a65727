// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The single-threaded reactor. Owns timers and FD readiness; everything
//! else (the thread pool, scoped primitives) schedules work through the
//! [`IoScheduler`] handle this module hands out.

mod poll;
mod timer;

pub use poll::Interest;
pub(crate) use poll::PollSignal;
pub(crate) use timer::TimerSignal;

use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::{Duration, Instant};

use mio::Events;

use crate::env::StopToken;
use crate::error::ReactorError;
use crate::task::{Outcome, Sender};
use crate::util::Completion;
use poll::{id_from_token, PollSet, WAKE_TOKEN};
use timer::TimerQueue;

/// Tunables for a single [`IoContext`]. There is no environment- or
/// file-based configuration layer; callers construct this directly.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of the `mio::Events` buffer used per reactor pass.
    pub events_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            events_capacity: 128,
        }
    }
}

enum Command {
    Immediate(Completion<()>),
    Timed {
        id: u64,
        at: Instant,
        completion: Completion<TimerSignal>,
    },
    CancelTimed(u64),
    Poll {
        id: u64,
        fd: RawFd,
        interest: Interest,
        completion: Completion<PollSignal>,
    },
    CancelPoll(u64),
}

struct Shared {
    commands: Mutex<Vec<Command>>,
    waker: mio::Waker,
    next_id: AtomicU64,
    stop: AtomicBool,
}

impl Shared {
    fn enqueue(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
        let _ = self.waker.wake();
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A cheaply-cloned handle used to schedule work onto an [`IoContext`] from
/// any thread.
#[derive(Clone)]
pub struct IoScheduler {
    shared: Arc<Shared>,
}

impl IoScheduler {
    /// Completes immediately, on the reactor thread, on the next pass.
    pub fn schedule(&self) -> ScheduleImmediate {
        ScheduleImmediate {
            scheduler: self.clone(),
            submitted: false,
            completion: Completion::new(),
        }
    }

    pub fn schedule_after(&self, delay: Duration, stop_token: StopToken) -> ScheduleTimer {
        self.schedule_at(Instant::now() + delay, stop_token)
    }

    pub fn schedule_at(&self, at: Instant, stop_token: StopToken) -> ScheduleTimer {
        ScheduleTimer {
            scheduler: self.clone(),
            at,
            stop_token,
            state: TimerState::Unsubmitted,
        }
    }

    pub fn poll(&self, fd: RawFd, interest: Interest, stop_token: StopToken) -> PollFd {
        PollFd {
            scheduler: self.clone(),
            fd,
            interest,
            stop_token,
            state: PollState::Unsubmitted,
        }
    }

    pub fn request_stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            let _ = self.shared.waker.wake();
        }
    }
}

pub struct ScheduleImmediate {
    scheduler: IoScheduler,
    submitted: bool,
    completion: Completion<()>,
}

impl Future for ScheduleImmediate {
    type Output = Outcome<(), ReactorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.submitted {
            self.submitted = true;
            self.scheduler
                .shared
                .enqueue(Command::Immediate(self.completion.clone()));
        }
        self.completion.poll(cx).map(|()| Outcome::Value(()))
    }
}

enum TimerState {
    Unsubmitted,
    Submitted {
        id: u64,
        completion: Completion<TimerSignal>,
        _stop_guard: crate::env::StopCallback,
    },
}

pub struct ScheduleTimer {
    scheduler: IoScheduler,
    at: Instant,
    stop_token: StopToken,
    state: TimerState,
}

impl Future for ScheduleTimer {
    type Output = Outcome<(), ReactorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.state {
            TimerState::Unsubmitted => {
                let id = self.scheduler.shared.next_id();
                let completion = Completion::new();
                self.scheduler.shared.enqueue(Command::Timed {
                    id,
                    at: self.at,
                    completion: completion.clone(),
                });
                let scheduler = self.scheduler.clone();
                let guard = self.stop_token.on_stop(move || {
                    scheduler.shared.enqueue(Command::CancelTimed(id));
                });
                self.state = TimerState::Submitted {
                    id,
                    completion,
                    _stop_guard: guard,
                };
                self.poll(cx)
            }
            TimerState::Submitted { completion, .. } => completion.clone().poll(cx).map(|signal| {
                match signal {
                    TimerSignal::Fired => Outcome::Value(()),
                    TimerSignal::Cancelled => Outcome::Stopped,
                }
            }),
        }
    }
}

enum PollState {
    Unsubmitted,
    Submitted {
        completion: Completion<PollSignal>,
        _stop_guard: crate::env::StopCallback,
    },
}

pub struct PollFd {
    scheduler: IoScheduler,
    fd: RawFd,
    interest: Interest,
    stop_token: StopToken,
    state: PollState,
}

impl Future for PollFd {
    type Output = Outcome<Interest, ReactorError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.state {
            PollState::Unsubmitted => {
                let id = self.scheduler.shared.next_id();
                let completion = Completion::new();
                self.scheduler.shared.enqueue(Command::Poll {
                    id,
                    fd: self.fd,
                    interest: self.interest,
                    completion: completion.clone(),
                });
                let scheduler = self.scheduler.clone();
                let guard = self.stop_token.on_stop(move || {
                    scheduler.shared.enqueue(Command::CancelPoll(id));
                });
                self.state = PollState::Submitted {
                    completion,
                    _stop_guard: guard,
                };
                self.poll(cx)
            }
            PollState::Submitted { completion, .. } => {
                completion.clone().poll(cx).map(|signal| match signal {
                    PollSignal::Ready(interest) => Outcome::Value(interest),
                    PollSignal::Cancelled => Outcome::Stopped,
                })
            }
        }
    }
}

/// The single-threaded reactor: timers plus FD readiness polling.
pub struct IoContext {
    poll: mio::Poll,
    events: Events,
    timers: TimerQueue,
    polls: PollSet,
    shared: Arc<Shared>,
}

impl IoContext {
    pub fn new(config: Config) -> Self {
        let poll = mio::Poll::new().expect("failed to create mio::Poll");
        let waker =
            mio::Waker::new(poll.registry(), WAKE_TOKEN).expect("failed to create wakeup handle");
        Self {
            events: Events::with_capacity(config.events_capacity),
            timers: TimerQueue::new(),
            polls: PollSet::new(),
            shared: Arc::new(Shared {
                commands: Mutex::new(Vec::new()),
                waker,
                next_id: AtomicU64::new(0),
                stop: AtomicBool::new(false),
            }),
            poll,
        }
    }

    pub fn scheduler(&self) -> IoScheduler {
        IoScheduler {
            shared: self.shared.clone(),
        }
    }

    pub fn request_stop(&self) {
        self.scheduler().request_stop()
    }

    /// Runs the standalone event loop described in step 1-7 of the reactor
    /// contract until stop is requested and the command queue is empty.
    #[tracing::instrument(skip(self))]
    pub fn run(&mut self) -> Result<(), ReactorError> {
        loop {
            self.run_pass()?;
            if self.shared.stop.load(Ordering::SeqCst)
                && self.shared.commands.lock().unwrap().is_empty()
                && self.timers.next_deadline().is_none()
                && self.polls.is_empty()
            {
                return Ok(());
            }
        }
    }

    /// Drives `sender` to completion on a private reactor pump, interleaving
    /// polls of the root future with reactor passes. This is the engine
    /// behind [`crate::task::sync_wait`].
    pub fn run_until_complete<T, E>(mut self, sender: impl Sender<T, E> + 'static) -> Outcome<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let mut fut = Box::pin(sender);
        let waker = Waker::from(Arc::new(RootWaker {
            shared: self.shared.clone(),
        }));
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Poll::Ready(outcome) = fut.as_mut().poll(&mut cx) {
                return outcome;
            }
            self.run_pass()
                .expect("reactor-level syscall failure is fatal");
        }
    }

    /// One pass of the 7-step event loop, steps 1 through 6 (the caller
    /// decides whether/when to repeat, i.e. step 7).
    fn run_pass(&mut self) -> Result<(), ReactorError> {
        // Step 1: atomically swap the pending command queue.
        let commands = std::mem::take(&mut *self.shared.commands.lock().unwrap());

        // Step 2: apply each command.
        for command in commands {
            match command {
                Command::Immediate(completion) => completion.resolve(()),
                Command::Timed { id, at, completion } => self.timers.schedule(id, at, completion),
                Command::CancelTimed(id) => self.timers.cancel(id),
                Command::Poll {
                    id,
                    fd,
                    interest,
                    completion,
                } => {
                    self.polls
                        .register(self.poll.registry(), id, fd, interest, completion)?;
                }
                Command::CancelPoll(id) => self.polls.cancel(self.poll.registry(), id),
            }
        }

        // Step 3: drain all expired timers, re-reading `now` to bound drift.
        self.timers.drain_expired(Instant::now());

        // Step 4/5: block on readiness with a timeout bounded by the next
        // timer deadline, or indefinitely if none is pending.
        let timeout = self
            .timers
            .next_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()));

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ReactorError::Io(err)),
            }
        }

        // Step 6: drain the wakeup handle (no-op token) and dispatch ready
        // fds, removing each from the poll list.
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let id = id_from_token(token);
            let interest = Interest {
                readable: event.is_readable(),
                writable: event.is_writable(),
            };
            tracing::trace!(id, ?interest, "dispatching ready fd");
            self.polls.dispatch(self.poll.registry(), id, interest);
        }

        Ok(())
    }
}

struct RootWaker {
    shared: Arc<Shared>,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        let _ = self.shared.waker.wake();
    }
    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.shared.waker.wake();
    }
}
