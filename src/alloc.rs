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

//! Allocators for node, buffer, and bus IDs.
//!
//! The audio engine accepts arbitrary numeric IDs; what matters is that no
//! two live resources of one client share an ID, and that every client stays
//! inside its own sub-range when the engine is shared. [`IdAllocator`]
//! enforces both: IDs come from a `[low, high]` range, a freed ID is only
//! handed out again once it has been returned, and reuse happens in the
//! order IDs were freed.
//!
//! Freed IDs are preferred only when the free list can satisfy a request
//! entirely; otherwise the whole request is served from fresh IDs. Reusing
//! an ID too eagerly can race the engine's `/n_end` notification for its
//! previous owner.

use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A monotonic ID allocator with free-list reuse over an inclusive range.
///
/// All methods take `&self`; the allocator is internally mutex-protected and
/// safe to share between threads.
#[derive(Debug)]
pub struct IdAllocator {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    low: i32,
    high: i32,
    next: i32,
    free: VecDeque<i32>,
    allocated: BitSet,
}

impl IdAllocator {
    /// Creates an allocator over the inclusive range `[low, high]`.
    ///
    /// # Panics
    ///
    /// Panics if the range is empty.
    pub fn new(low: i32, high: i32) -> IdAllocator {
        assert!(low <= high, "empty id range [{}, {}]", low, high);
        IdAllocator {
            state: Mutex::new(State {
                low,
                high,
                next: low,
                free: VecDeque::new(),
                allocated: BitSet::new((high - low + 1) as usize),
            }),
        }
    }

    /// The lowest ID this allocator may hand out.
    pub fn low(&self) -> i32 {
        self.state.lock().unwrap().low
    }

    /// The highest ID this allocator may hand out.
    pub fn high(&self) -> i32 {
        self.state.lock().unwrap().high
    }

    /// Allocates `count` IDs.
    ///
    /// When the free list holds at least `count` IDs the request is served
    /// from it in the order the IDs were freed. Otherwise the whole request
    /// comes from previously untouched IDs.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Exhausted`] when not enough fresh IDs remain.
    pub fn allocate(&self, count: usize) -> Result<Vec<i32>> {
        let mut state = self.state.lock().unwrap();
        if count == 0 {
            return Ok(Vec::new());
        }
        if state.free.len() >= count {
            let ids: Vec<i32> = state.free.drain(..count).collect();
            for &id in &ids {
                state.mark(id, true);
            }
            return Ok(ids);
        }
        let remaining = (state.high - state.next + 1).max(0) as usize;
        if remaining < count {
            return Err(Error::Exhausted {
                requested: count,
                low: state.low,
                high: state.high,
            });
        }
        let start = state.next;
        state.next += count as i32;
        let ids: Vec<i32> = (start..start + count as i32).collect();
        for &id in &ids {
            state.mark(id, true);
        }
        Ok(ids)
    }

    /// Returns IDs to the free list, preserving the order given.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidId`] if any ID is outside the range or not
    /// currently allocated; in that case nothing is freed.
    pub fn free(&self, ids: &[i32]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        for (position, &id) in ids.iter().enumerate() {
            let duplicate = ids[..position].contains(&id);
            if id < state.low || id > state.high || duplicate || !state.is_allocated(id) {
                return Err(Error::InvalidId(id));
            }
        }
        for &id in ids {
            state.mark(id, false);
            state.free.push_back(id);
        }
        Ok(())
    }

    /// The number of IDs currently held by callers.
    pub fn allocated_count(&self) -> usize {
        self.state.lock().unwrap().allocated.count()
    }
}

impl State {
    fn is_allocated(&self, id: i32) -> bool {
        self.allocated.contains((id - self.low) as usize)
    }

    fn mark(&mut self, id: i32, allocated: bool) {
        self.allocated.set((id - self.low) as usize, allocated);
    }
}

/// A fixed-size bitset tracking which IDs in the range are live.
#[derive(Debug)]
struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    fn new(len: usize) -> BitSet {
        BitSet {
            words: vec![0; (len + 63) / 64],
        }
    }

    fn contains(&self, index: usize) -> bool {
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize, value: bool) {
        if value {
            self.words[index / 64] |= 1 << (index % 64);
        } else {
            self.words[index / 64] &= !(1 << (index % 64));
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }
}
