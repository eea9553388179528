//! Bookkeeping for the timers an SCTP engine requests through
//! [`crate::socket::SctpTimerCallbacks`].
//!
//! The teacher's `rtc-sctp::association::timer::TimerTable` keys timers by a
//! small fixed enum, since it owns a bounded, known set of protocol timers.
//! Here the engine names its own timers by an id of its own choosing and
//! only asks us to track deadlines for it, so the table is a
//! `HashMap<TimerId, TimerState>` rather than a fixed array — the
//! `Option<Instant>`-per-slot deadline model and `next_timeout`/`is_expired`
//! shape are carried over unchanged.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::socket::TimerId;

#[derive(Debug, Copy, Clone)]
struct TimerState {
    deadline: Option<Instant>,
}

/// Table of timers requested by the engine, keyed by the id it supplied to
/// `timeout_create`.
#[derive(Debug, Default)]
pub(crate) struct TimerTable {
    slots: HashMap<TimerId, TimerState>,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    /// Registers `id` as a known timer. Not armed until `start` is called.
    pub(crate) fn create(&mut self, id: TimerId) {
        self.slots.entry(id).or_insert(TimerState { deadline: None });
    }

    pub(crate) fn delete(&mut self, id: TimerId) {
        self.slots.remove(&id);
    }

    pub(crate) fn start(&mut self, id: TimerId, duration: Duration, now: Instant) {
        self.slots
            .entry(id)
            .or_insert(TimerState { deadline: None })
            .deadline = Some(now + duration);
    }

    pub(crate) fn stop(&mut self, id: TimerId) {
        if let Some(state) = self.slots.get_mut(&id) {
            state.deadline = None;
        }
    }

    /// Earliest deadline across every armed timer, used by the event loop to
    /// bound how long it blocks waiting for the next job.
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.slots.values().filter_map(|s| s.deadline).min()
    }

    /// Every timer whose deadline has passed `now`, disarming each (the
    /// engine re-arms via `timeout_start` if it wants another round).
    pub(crate) fn expired(&mut self, now: Instant) -> Vec<TimerId> {
        let ids: Vec<TimerId> = self
            .slots
            .iter()
            .filter_map(|(&id, s)| s.deadline.filter(|&d| d <= now).map(|_| id))
            .collect();
        for &id in &ids {
            if let Some(state) = self.slots.get_mut(&id) {
                state.deadline = None;
            }
        }
        ids
    }

    /// Cancels every pending timer on teardown, so stray wakeups never fire
    /// after the association has closed its socket.
    pub(crate) fn cancel_all(&mut self) {
        for state in self.slots.values_mut() {
            state.deadline = None;
        }
        self.slots.clear();
    }
}
