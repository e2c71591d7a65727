// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The worker run loop: own queue, then overflow, then steal, then sleep.
//! A direct port of `WrokerThreadState::run`/`try_pop_remote`/`try_steal_task`.

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use super::bwos::BwosDeque;
use super::{CURRENT_WORKER, PoolState, Runnable, Shared};

pub(super) fn run(shared: Arc<Shared>, index: usize) {
    CURRENT_WORKER.with(|cell| cell.set(Some((Arc::as_ptr(&shared), index))));

    let queue = shared.queues[index].clone();
    let victims: Vec<Arc<BwosDeque<Arc<dyn Runnable>>>> = shared
        .queues
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, q)| q.clone())
        .collect();
    let mut rng = SmallRng::from_os_rng();

    loop {
        if let Some(task) = queue.pop_back() {
            task.run();
            continue;
        }

        {
            let mut state = shared.state.lock();
            if try_pop_remote(&mut state, &shared, &queue) {
                continue;
            }
            state.thiefs += 1;
        }

        if let Some(task) = try_steal_task(&victims, &mut rng) {
            {
                let mut state = shared.state.lock();
                state.thiefs -= 1;
            }
            task.run();
            continue;
        }

        let mut state = shared.state.lock();
        state.thiefs -= 1;
        if try_pop_remote(&mut state, &shared, &queue) {
            continue;
        }
        state.sleeping += 1;
        if state.stopping {
            return;
        }
        if state.thiefs == 0 && state.sleeping < shared.queues.len() {
            // wake up another thread, there may still be victims to check
            shared.condvar.notify_one();
        }
        shared.condvar.wait(&mut state);
        state.sleeping -= 1;
    }
}

/// Pulls this worker's fair share of the shared overflow queue into its own
/// BWoS deque. Any leftover that doesn't fit is pushed back onto the
/// overflow rather than dropped.
fn try_pop_remote(state: &mut PoolState, shared: &Shared, queue: &BwosDeque<Arc<dyn Runnable>>) -> bool {
    if state.tasks.is_empty() {
        return false;
    }
    let share = (state.tasks.len() / shared.queues.len()).clamp(1, queue.capacity().max(1));
    let start = state.tasks.len() - share.min(state.tasks.len());
    let drained: Vec<_> = state.tasks.split_off(start);
    for task in drained {
        if let Err(task) = queue.push_back(task) {
            state.tasks.push(task);
        }
    }
    true
}

fn try_steal_task(
    victims: &[Arc<BwosDeque<Arc<dyn Runnable>>>],
    rng: &mut SmallRng,
) -> Option<Arc<dyn Runnable>> {
    let mut order: Vec<usize> = (0..victims.len()).collect();
    order.shuffle(rng);
    for index in order {
        if let Some(task) = victims[index].steal_front() {
            return Some(task);
        }
    }
    None
}
