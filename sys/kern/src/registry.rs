// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The object registry.
//!
//! Every kernel entity -- thread, timer, semaphore, mutex, event group,
//! message queue, memory pool, rwlock -- holds exactly one slot here for
//! as long as it is alive. The registry gives each entity a type tag and a
//! fixed-capacity name, and supports lookup by `(type, name)` and per-type
//! counting for diagnostics.
//!
//! Slots are addressed by generation-checked [`ObjectId`] handles, so a
//! handle kept across a release is detected as stale rather than resolving
//! to the slot's next occupant.

use abi::{Generation, KernError, KernResult, ObjectType};
use heapless::String;

use crate::config::{OBJECTS_MAX, OBJECT_NAME_LEN};

/// Generation-checked handle to a registry slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ObjectId(u16);

impl ObjectId {
    const INDEX_BITS: u32 = 10;
    const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;

    const fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        ObjectId(
            (index as u16 & Self::INDEX_MASK)
                | (gen.raw() as u16) << Self::INDEX_BITS,
        )
    }

    fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    fn generation(&self) -> Generation {
        Generation::from((self.0 >> Self::INDEX_BITS) as u8)
    }
}

struct Object {
    otype: ObjectType,
    /// Set for kernel-owned storage (the `create` family); the reaper uses
    /// it to decide whether backing memory must be freed.
    created: bool,
    name: String<OBJECT_NAME_LEN>,
}

/// The registry arena.
pub struct Registry {
    slots: [Option<Object>; OBJECTS_MAX],
    gens: [Generation; OBJECTS_MAX],
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry {
            slots: core::array::from_fn(|_| None),
            gens: [Generation::ZERO; OBJECTS_MAX],
        }
    }

    /// Claims a slot for a new entity. Names longer than
    /// [`OBJECT_NAME_LEN`] are truncated.
    pub(crate) fn register(
        &mut self,
        otype: ObjectType,
        name: &str,
        created: bool,
    ) -> KernResult<ObjectId> {
        let index = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernError::NoMemory)?;

        let mut stored = String::new();
        for c in name.chars() {
            if stored.push(c).is_err() {
                break;
            }
        }
        self.slots[index] = Some(Object { otype, created, name: stored });
        Ok(ObjectId::for_index_and_gen(index, self.gens[index]))
    }

    /// Releases a slot and bumps its generation, invalidating outstanding
    /// handles to it.
    pub(crate) fn release(&mut self, id: ObjectId) {
        let index = id.index();
        assert!(self.get(id).is_some());
        self.slots[index] = None;
        self.gens[index] = self.gens[index].next();
    }

    fn get(&self, id: ObjectId) -> Option<&Object> {
        let index = id.index();
        if index >= OBJECTS_MAX || self.gens[index] != id.generation() {
            return None;
        }
        self.slots[index].as_ref()
    }

    /// The entity's registered name, if the handle is still live.
    pub fn name(&self, id: ObjectId) -> Option<&str> {
        self.get(id).map(|o| o.name.as_str())
    }

    /// Whether the entity came from the `create` family (kernel-owned
    /// storage).
    pub fn is_created(&self, id: ObjectId) -> bool {
        self.get(id).map(|o| o.created).unwrap_or(false)
    }

    /// Finds a live object of `otype` whose name matches exactly. Empty
    /// names never match.
    pub fn find(&self, otype: ObjectType, name: &str) -> Option<ObjectId> {
        if name.is_empty() {
            return None;
        }
        self.slots.iter().enumerate().find_map(|(i, slot)| {
            let o = slot.as_ref()?;
            if o.otype == otype && o.name.as_str() == name {
                Some(ObjectId::for_index_and_gen(i, self.gens[i]))
            } else {
                None
            }
        })
    }

    /// Number of live objects of the given type.
    pub fn count(&self, otype: ObjectType) -> usize {
        self.slots
            .iter()
            .filter(|s| s.as_ref().map(|o| o.otype == otype).unwrap_or(false))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_find_release_round_trip() {
        let mut reg = Registry::new();
        let id = reg.register(ObjectType::Semaphore, "lock0", false).unwrap();
        assert_eq!(reg.name(id), Some("lock0"));
        assert_eq!(reg.find(ObjectType::Semaphore, "lock0"), Some(id));
        // Same name under a different type tag is a different namespace.
        assert_eq!(reg.find(ObjectType::Mutex, "lock0"), None);
        assert_eq!(reg.count(ObjectType::Semaphore), 1);

        reg.release(id);
        assert_eq!(reg.find(ObjectType::Semaphore, "lock0"), None);
        assert_eq!(reg.count(ObjectType::Semaphore), 0);
    }

    #[test]
    fn stale_handles_do_not_resolve_to_new_occupants() {
        let mut reg = Registry::new();
        let old = reg.register(ObjectType::Timer, "t", false).unwrap();
        reg.release(old);
        // The slot gets reused by a fresh registration...
        let new = reg.register(ObjectType::Timer, "t2", true).unwrap();
        // ...but the stale handle doesn't see it.
        assert_eq!(reg.name(old), None);
        assert!(!reg.is_created(old));
        assert_eq!(reg.name(new), Some("t2"));
        assert!(reg.is_created(new));
    }

    #[test]
    fn long_names_truncate_rather_than_fail() {
        let mut reg = Registry::new();
        let id = reg
            .register(ObjectType::Thread, "a-name-well-beyond-the-limit", false)
            .unwrap();
        assert_eq!(reg.name(id).unwrap().len(), OBJECT_NAME_LEN);
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let mut reg = Registry::new();
        for _ in 0..OBJECTS_MAX {
            reg.register(ObjectType::Event, "", false).unwrap();
        }
        assert_eq!(
            reg.register(ObjectType::Event, "", false),
            Err(KernError::NoMemory)
        );
    }
}
