// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Index-linked doubly-linked lists over fixed arenas.
//!
//! Records that participate in a list embed a [`Link`]; the list itself is
//! only a head/tail pair. All operations take the arena's link array as a
//! parameter, so the same machinery serves the scheduler ready table, wait
//! queues, and the defunct list without any of them owning the records.
//!
//! A record may be a member of at most one list at a time. The operations
//! assume the caller upholds that; membership is tracked by the state
//! machine that owns the record (thread state, timer linkage depth), not by
//! the link itself.

/// Link fields embedded (by index) in every arena record that can be
/// listed.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct Link {
    prev: Option<u16>,
    next: Option<u16>,
}

/// A doubly-linked list threaded through an arena's `Link` array.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct List {
    head: Option<u16>,
    tail: Option<u16>,
}

impl List {
    pub const EMPTY: List = List { head: None, tail: None };

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn head(&self) -> Option<u16> {
        self.head
    }

    /// Successor of `idx` within whatever list it is linked in.
    pub fn next_of(links: &[Link], idx: u16) -> Option<u16> {
        links[usize::from(idx)].next
    }

    pub fn push_back(&mut self, links: &mut [Link], idx: u16) {
        let i = usize::from(idx);
        links[i] = Link { prev: self.tail, next: None };
        match self.tail {
            Some(t) => links[usize::from(t)].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    pub fn push_front(&mut self, links: &mut [Link], idx: u16) {
        let i = usize::from(idx);
        links[i] = Link { prev: None, next: self.head };
        match self.head {
            Some(h) => links[usize::from(h)].prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    /// Inserts `idx` immediately before `at`, which must be a member.
    pub fn insert_before(&mut self, links: &mut [Link], at: u16, idx: u16) {
        let before = links[usize::from(at)].prev;
        links[usize::from(idx)] = Link { prev: before, next: Some(at) };
        links[usize::from(at)].prev = Some(idx);
        match before {
            Some(p) => links[usize::from(p)].next = Some(idx),
            None => self.head = Some(idx),
        }
    }

    /// Unlinks `idx`, which must be a member of this list.
    pub fn remove(&mut self, links: &mut [Link], idx: u16) {
        let Link { prev, next } = links[usize::from(idx)];
        match prev {
            Some(p) => links[usize::from(p)].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => links[usize::from(n)].prev = prev,
            None => self.tail = prev,
        }
        links[usize::from(idx)] = Link::default();
    }

    pub fn pop_front(&mut self, links: &mut [Link]) -> Option<u16> {
        let h = self.head?;
        self.remove(links, h);
        Some(h)
    }
}
