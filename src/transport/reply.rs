// Cantrip
// Copyright (C) 2026  The Cantrip Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Named reply queues fed by the transport's receive worker.

use crate::error::{Error, Result};
use rosc::OscType;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A bounded blocking FIFO of reply payloads for one OSC address.
///
/// The transport's receive worker is the single producer; any number of
/// threads may consume, and each item is delivered to exactly one consumer.
/// Retrieval is skip-aware: by default a consumer is only interested in the
/// most recent reply, and older ones are discarded and counted in
/// [`skips`](ReplyQueue::skips).
#[derive(Debug)]
pub struct ReplyQueue {
    address: String,
    capacity: usize,
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug)]
struct State {
    items: VecDeque<Vec<OscType>>,
    skips: u64,
    closed: bool,
}

impl ReplyQueue {
    pub(crate) fn new(address: impl Into<String>, capacity: usize) -> ReplyQueue {
        assert!(capacity > 0, "reply queue capacity must be positive");
        ReplyQueue {
            address: address.into(),
            capacity,
            state: Mutex::new(State {
                items: VecDeque::new(),
                skips: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// The incoming OSC address this queue is registered under.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The number of items currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many replies were dropped without being delivered, either by a
    /// skipping [`get`](ReplyQueue::get) or by eviction from a full queue.
    pub fn skips(&self) -> u64 {
        self.state.lock().unwrap().skips
    }

    /// Enqueues one payload. When the queue is full the oldest item is
    /// evicted and counted as skipped.
    pub(crate) fn put(&self, payload: Vec<OscType>) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        if state.items.len() == self.capacity {
            state.items.pop_front();
            state.skips += 1;
            log::warn!("reply queue {} is full, dropping oldest item", self.address);
        }
        state.items.push_back(payload);
        drop(state);
        self.available.notify_all();
    }

    /// Wakes every blocked consumer with [`Error::Shutdown`] and rejects all
    /// further items.
    pub(crate) fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    /// Retrieves one payload, blocking up to `timeout`.
    ///
    /// With `skip` set (the usual mode), everything but the most recent item
    /// is discarded first and each discarded item increments
    /// [`skips`](ReplyQueue::skips). Without it, the oldest item is returned
    /// and the rest are left in place.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TimedOut`] when the timeout expires on an empty
    /// queue and with [`Error::Shutdown`] once the queue is closed.
    pub fn get(&self, timeout: Duration, skip: bool) -> Result<Vec<OscType>> {
        self.wait(timeout, |state| {
            if state.items.is_empty() {
                return None;
            }
            if skip {
                while state.items.len() > 1 {
                    let dropped = state.items.pop_front();
                    state.skips += 1;
                    log::debug!("reply queue skipped value {:?}", dropped);
                }
            }
            state.items.pop_front()
        })
    }

    /// Retrieves the first payload matching `matches`, blocking up to
    /// `timeout`. Non-matching items are left in place for other consumers
    /// and the skip counter is untouched.
    ///
    /// Used for correlated replies such as `/synced`, where concurrent
    /// waiters must each receive the item carrying their own id.
    pub fn get_where<F>(&self, timeout: Duration, matches: F) -> Result<Vec<OscType>>
    where
        F: Fn(&[OscType]) -> bool,
    {
        self.wait(timeout, |state| {
            let position = state.items.iter().position(|item| matches(item))?;
            state.items.remove(position)
        })
    }

    fn wait<F>(&self, timeout: Duration, mut take: F) -> Result<Vec<OscType>>
    where
        F: FnMut(&mut State) -> Option<Vec<OscType>>,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(Error::Shutdown);
            }
            if let Some(payload) = take(&mut state) {
                return Ok(payload);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut);
            }
            let (guard, _) = self.available.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }
    }
}
