//! Reference-counted tag manager (spec.md §3, §9 "Tag manager"), bidirectional map between
//! opaque [`Tag`]s and the `(AccessRange, AccessRecord)` pair they identify.
//!
//! Grounded in `original_source/src/TagManager.{h,cpp}`. The original is a process-wide
//! Meyers singleton (`TagManager::getInstance()`); per spec.md §9 "Singletons", this becomes
//! a plain value owned by [`crate::engine::Engine`].

use crate::access::{AccessRange, AccessRecord};
use hashbrown::HashMap;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

struct TaggedAccess {
    range: AccessRange,
    record: AccessRecord,
}

/// Keyed on the identity the original used for its `accessToTag` map: the range plus the
/// record's execution order, which is unique per observed instruction instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct AccessKey {
    range: AccessRange,
    order: u64,
}

pub struct TagManager {
    tag_to_access: HashMap<Tag, TaggedAccess>,
    access_to_tag: HashMap<AccessKey, Tag>,
    ref_count: HashMap<Tag, u32>,
    free_tags: VecDeque<Tag>,
    next_unused: u64,
}

impl Default for TagManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TagManager {
    pub fn new() -> Self {
        TagManager {
            tag_to_access: HashMap::new(),
            access_to_tag: HashMap::new(),
            ref_count: HashMap::new(),
            free_tags: VecDeque::new(),
            next_unused: 0,
        }
    }

    fn new_tag(&mut self) -> Tag {
        let tag = match self.free_tags.pop_front() {
            Some(t) => t,
            None => {
                let t = Tag(self.next_unused);
                self.next_unused += 1;
                t
            }
        };
        self.ref_count.insert(tag, 0);
        tag
    }

    /// Returns the existing tag for `(range, record)`, or allocates and registers a fresh one.
    /// Mirrors `TagManager::getTag`: allocation on first sharing, §3 "Lifecycles".
    pub fn tag_for(&mut self, range: AccessRange, record: AccessRecord) -> Tag {
        let key = AccessKey {
            range,
            order: record.order,
        };
        if let Some(&tag) = self.access_to_tag.get(&key) {
            return tag;
        }
        let tag = self.new_tag();
        self.tag_to_access.insert(tag, TaggedAccess { range, record });
        self.access_to_tag.insert(key, tag);
        tag
    }

    pub fn access(&self, tag: Tag) -> Option<(&AccessRange, &AccessRecord)> {
        self.tag_to_access.get(&tag).map(|t| (&t.range, &t.record))
    }

    pub fn increase_ref_count(&mut self, tag: Tag) {
        if let Some(c) = self.ref_count.get_mut(&tag) {
            *c += 1;
        }
    }

    /// Drops to the free-list once the reference count reaches zero, matching the original's
    /// "<= 1" collapse-to-free check (spec.md §3 "Lifecycles": "freed when reference count
    /// drops to zero").
    pub fn decrease_ref_count(&mut self, tag: Tag) {
        let Some(count) = self.ref_count.get_mut(&tag) else {
            return;
        };
        if *count <= 1 {
            self.ref_count.remove(&tag);
            if let Some(tag) = self.tag_to_access.remove(&tag) {
                let key = AccessKey {
                    range: tag.range,
                    order: tag.record.order,
                };
                self.access_to_tag.remove(&key);
            }
            self.free_tags.push_back(tag);
        } else {
            *count -= 1;
        }
    }

    pub fn decrease_ref_count_all(&mut self, tags: &std::collections::BTreeSet<Tag>) {
        for &t in tags {
            self.decrease_ref_count(t);
        }
    }

    /// P4: the reference count equals the number of live occurrences; exposed for tests.
    pub fn ref_count_of(&self, tag: Tag) -> u32 {
        *self.ref_count.get(&tag).unwrap_or(&0)
    }

    pub fn is_live(&self, tag: Tag) -> bool {
        self.ref_count.contains_key(&tag)
    }
}

/// Minimal `AccessRecord` builder shared across this crate's unit tests, exposed so other
/// modules' tests (pending, aggregator) don't each re-derive boilerplate fixture records.
#[cfg(test)]
pub mod tests_support {
    use crate::access::{AccessRange, AccessRecord, AccessType, Discriminator};
    use crate::emulator::Opcode;

    pub fn dummy_record(order: u64) -> AccessRecord {
        AccessRecord {
            order,
            ip: 0x1000,
            actual_ip: 0x1000,
            opcode: Opcode(0),
            access_type: AccessType::Read,
            range: AccessRange::new(0x7fff0000, 16),
            sp_offset: 0,
            bp_offset: 0,
            disasm: None,
            is_uninitialized_read: true,
            uninitialized_snapshot: None,
            discriminator: Discriminator::Stack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::dummy_record;
    use super::*;

    #[test]
    fn same_access_returns_same_tag() {
        let mut mgr = TagManager::new();
        let range = AccessRange::new(0x7fff0000, 16);
        let rec = dummy_record(1);
        let t1 = mgr.tag_for(range, rec.clone());
        let t2 = mgr.tag_for(range, rec);
        assert_eq!(t1, t2);
    }

    #[test]
    fn ref_count_lifecycle_frees_tag_at_zero() {
        // P4.
        let mut mgr = TagManager::new();
        let range = AccessRange::new(0x7fff0000, 16);
        let tag = mgr.tag_for(range, dummy_record(1));
        mgr.increase_ref_count(tag);
        mgr.increase_ref_count(tag);
        assert_eq!(mgr.ref_count_of(tag), 2);
        mgr.decrease_ref_count(tag);
        assert!(mgr.is_live(tag));
        mgr.decrease_ref_count(tag);
        assert!(!mgr.is_live(tag));
    }

    #[test]
    fn freed_tags_are_reused() {
        let mut mgr = TagManager::new();
        let range = AccessRange::new(0x7fff0000, 16);
        let t1 = mgr.tag_for(range, dummy_record(1));
        mgr.increase_ref_count(t1);
        mgr.decrease_ref_count(t1);
        let range2 = AccessRange::new(0x8000, 4);
        let t2 = mgr.tag_for(range2, dummy_record(2));
        assert_eq!(t1, t2);
    }
}
