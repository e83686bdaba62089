// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The ready table: one list per priority level plus a bitmap for O(1)
//! highest-priority lookup.
//!
//! Invariant: bit *i* of the bitmap is set exactly when ready list *i* is
//! non-empty, at every boundary outside an interrupt-locked section. The
//! reschedule *decision* lives in the kernel context, which owns the
//! current-thread pointer; this module only maintains eligibility.

use abi::{Priority, NUM_PRIORITIES};

use crate::list::{Link, List};

pub(crate) struct ReadyTable {
    lists: [List; NUM_PRIORITIES],
    bitmap: u32,
}

impl ReadyTable {
    pub fn new() -> Self {
        ReadyTable { lists: [List::EMPTY; NUM_PRIORITIES], bitmap: 0 }
    }

    /// Makes a thread eligible for selection at `prio`. Threads are
    /// appended to the tail of their level's list; a thread carrying the
    /// yield flag is prepended instead.
    pub fn insert(
        &mut self,
        links: &mut [Link],
        idx: u16,
        prio: Priority,
        yielded: bool,
    ) {
        let level = usize::from(prio.0);
        assert!(level < NUM_PRIORITIES);
        if yielded {
            self.lists[level].push_front(links, idx);
        } else {
            self.lists[level].push_back(links, idx);
        }
        self.bitmap |= 1 << level;
    }

    /// Takes a thread out of consideration. The bitmap bit is cleared when
    /// this empties the level's list.
    pub fn remove(&mut self, links: &mut [Link], idx: u16, prio: Priority) {
        let level = usize::from(prio.0);
        assert!(level < NUM_PRIORITIES);
        self.lists[level].remove(links, idx);
        if self.lists[level].is_empty() {
            self.bitmap &= !(1 << level);
        }
    }

    /// Head of the most important non-empty level, or `None` when no
    /// thread is ready (the caller falls back to whatever is running,
    /// normally the idle thread).
    pub fn peek_highest(&self) -> Option<u16> {
        let level = self.bitmap.trailing_zeros() as usize;
        if level >= NUM_PRIORITIES {
            return None;
        }
        let head = self.lists[level].head();
        assert!(head.is_some());
        head
    }

    #[cfg(test)]
    pub fn bitmap_matches_lists(&self) -> bool {
        (0..NUM_PRIORITIES).all(|level| {
            let bit = self.bitmap & (1 << level) != 0;
            bit == !self.lists[level].is_empty()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_tracks_list_emptiness_through_churn() {
        let mut links = [Link::default(); 8];
        let mut rt = ReadyTable::new();
        assert!(rt.bitmap_matches_lists());
        assert_eq!(rt.peek_highest(), None);

        rt.insert(&mut links, 0, Priority(5), false);
        rt.insert(&mut links, 1, Priority(5), false);
        rt.insert(&mut links, 2, Priority(2), false);
        assert!(rt.bitmap_matches_lists());

        // Highest priority (lowest index) wins.
        assert_eq!(rt.peek_highest(), Some(2));
        rt.remove(&mut links, 2, Priority(2));
        assert!(rt.bitmap_matches_lists());

        // Level 5 still has two entries; removing one must not clear the
        // bit.
        assert_eq!(rt.peek_highest(), Some(0));
        rt.remove(&mut links, 0, Priority(5));
        assert!(rt.bitmap_matches_lists());
        assert_eq!(rt.peek_highest(), Some(1));

        rt.remove(&mut links, 1, Priority(5));
        assert!(rt.bitmap_matches_lists());
        assert_eq!(rt.peek_highest(), None);
    }

    #[test]
    fn same_level_is_fifo_for_non_yielding_threads() {
        let mut links = [Link::default(); 8];
        let mut rt = ReadyTable::new();
        rt.insert(&mut links, 4, Priority(1), false);
        rt.insert(&mut links, 5, Priority(1), false);
        assert_eq!(rt.peek_highest(), Some(4));
    }

    #[test]
    fn yielding_thread_is_prepended() {
        let mut links = [Link::default(); 8];
        let mut rt = ReadyTable::new();
        rt.insert(&mut links, 4, Priority(1), false);
        rt.insert(&mut links, 5, Priority(1), true);
        assert_eq!(rt.peek_highest(), Some(5));
    }
}
