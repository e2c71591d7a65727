// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A min-heap timer queue, the direct counterpart of the original
//! `TimerQueue` (`std::vector` kept as a binary heap via
//! `push_heap`/`pop_heap`/`make_heap`, keyed on `scheduledTime`).
//!
//! Deliberately not a hierarchical timer wheel: the spec calls out "no
//! timer coalescing beyond min-heap ordering" as a constraint.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use crate::util::Completion;

/// What a timer sender resolves with: it either fired naturally, or was
/// cancelled before its deadline (which the awaiting sender surfaces as a
/// stopped completion).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum TimerSignal {
    Fired,
    Cancelled,
}

pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, Completion<TimerSignal>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashMap::new(),
        }
    }

    pub(crate) fn schedule(&mut self, id: u64, at: Instant, completion: Completion<TimerSignal>) {
        self.heap.push(Reverse((at, id)));
        self.pending.insert(id, completion);
    }

    /// A cancel against a timer that has already fired (and so is no longer
    /// in `pending`) is a no-op, matching the "race makes cancel a no-op"
    /// rule.
    pub(crate) fn cancel(&mut self, id: u64) {
        if let Some(completion) = self.pending.remove(&id) {
            completion.resolve(TimerSignal::Cancelled);
        }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Drains every timer whose deadline has passed, re-reading `now` after
    /// each completion to bound drift, per the event loop's step 3.
    pub(crate) fn drain_expired(&mut self, mut now: Instant) {
        while let Some(&Reverse((at, id))) = self.heap.peek() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(completion) = self.pending.remove(&id) {
                completion.resolve(TimerSignal::Fired);
                now = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_after_fire_is_a_no_op() {
        let mut queue = TimerQueue::new();
        let completion = Completion::new();
        queue.schedule(1, Instant::now(), completion.clone());
        queue.drain_expired(Instant::now());
        // already fired and removed from `pending`; cancelling must not panic
        // or double-resolve.
        queue.cancel(1);
    }

    #[test]
    fn earliest_deadline_drains_first() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let late = Completion::new();
        let early = Completion::new();
        queue.schedule(1, now + std::time::Duration::from_secs(10), late);
        queue.schedule(2, now, early);
        assert_eq!(queue.next_deadline(), Some(now));
        queue.drain_expired(now);
        assert!(queue.pending.contains_key(&1));
        assert!(!queue.pending.contains_key(&2));
    }
}
