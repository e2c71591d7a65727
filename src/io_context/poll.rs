// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness-based FD polling, backed by `mio`. Stands in for the
//! original's `ppoll`-over-a-pollfd-vector step of the event loop.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;

use mio::unix::SourceFd;
use mio::{Interest as MioInterest, Registry, Token};

use crate::util::Completion;

/// Readiness bits a caller is interested in, and the bits a completed poll
/// reports. A typed stand-in for the original's raw `short` bitmask.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn readable_and_writable() -> Interest {
        Interest {
            readable: true,
            writable: true,
        }
    }

    pub(crate) fn to_mio(self) -> MioInterest {
        match (self.readable, self.writable) {
            (true, true) => MioInterest::READABLE.add(MioInterest::WRITABLE),
            (true, false) => MioInterest::READABLE,
            (false, true) => MioInterest::WRITABLE,
            (false, false) => MioInterest::READABLE,
        }
    }
}

/// What a poll sender resolves with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum PollSignal {
    Ready(Interest),
    Cancelled,
}

struct Entry {
    fd: RawFd,
    completion: Completion<PollSignal>,
}

pub(crate) struct PollSet {
    entries: HashMap<u64, Entry>,
}

impl PollSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn register(
        &mut self,
        registry: &Registry,
        id: u64,
        fd: RawFd,
        interest: Interest,
        completion: Completion<PollSignal>,
    ) -> io::Result<()> {
        registry.register(&mut SourceFd(&fd), Token(token_value(id)), interest.to_mio())?;
        self.entries.insert(id, Entry { fd, completion });
        Ok(())
    }

    /// A cancel against a poll that already fired (and was removed from
    /// `entries` by `dispatch`) is a no-op.
    pub(crate) fn cancel(&mut self, registry: &Registry, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            let _ = registry.deregister(&mut SourceFd(&entry.fd));
            entry.completion.resolve(PollSignal::Cancelled);
        }
    }

    /// Completes and deregisters the poll identified by `id`, if still
    /// pending.
    pub(crate) fn dispatch(&mut self, registry: &Registry, id: u64, interest: Interest) {
        if let Some(entry) = self.entries.remove(&id) {
            let _ = registry.deregister(&mut SourceFd(&entry.fd));
            entry.completion.resolve(PollSignal::Ready(interest));
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The `mio::Token` reserved for the cross-thread wakeup handle; poll/timer
/// ids start at 0 and are distinguished from it by this offset.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

fn token_value(id: u64) -> usize {
    // ids are allocated from an AtomicU64 starting at 0 and are vanishingly
    // unlikely to reach usize::MAX - 1 in a single process's lifetime.
    usize::try_from(id).expect("poll id exceeds usize range")
}

pub(crate) fn id_from_token(token: Token) -> u64 {
    token.0 as u64
}
