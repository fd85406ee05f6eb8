//! Shared work queue drained by the worker pool.

use std::collections::VecDeque;
use std::ops::Deref;

use parking_lot::{Condvar, Mutex};

use crate::key::NodeKey;

/// One unit of work: process `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Work {
    pub key: NodeKey,
    /// Number of earlier runs that ended in a restart.
    pub restart: u32,
}

#[derive(Default)]
struct QueueState {
    units: VecDeque<Work>,
    /// Units popped but not yet released.
    active: usize,
    shutdown: bool,
}

/// FIFO queue that also tracks quiescence: the queue is idle when it holds no
/// units and every popped unit has been released.
#[derive(Default)]
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    idle: Condvar,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, work: Work) {
        let mut state = self.state.lock();
        state.units.push_back(work);
        self.available.notify_one();
    }

    /// Block until a unit is available. Returns `None` after shutdown.
    pub fn pop(&self) -> Option<Claim<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(work) = state.units.pop_front() {
                state.active += 1;
                return Some(Claim { queue: self, work });
            }
            self.available.wait(&mut state);
        }
    }

    /// Block until no unit is queued or being processed.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while !(state.units.is_empty() && state.active == 0) {
            self.idle.wait(&mut state);
        }
    }

    /// Wake every blocked `pop` and make it return `None`.
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().units.is_empty()
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.active -= 1;
        if state.active == 0 && state.units.is_empty() {
            self.idle.notify_all();
        }
    }
}

/// A popped unit. Dropping it marks the unit as finished, also on panic.
pub(crate) struct Claim<'a> {
    queue: &'a WorkQueue,
    work: Work,
}

impl Deref for Claim<'_> {
    type Target = Work;

    fn deref(&self) -> &Work {
        &self.work
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}
