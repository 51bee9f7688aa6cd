//! Pending-read tables (spec.md §4.3): `reg_pending` and `mem_pending`.
//!
//! Grounded in `original_source/src/PendingDirectMemoryCopy.{h,cpp}` for the concept of a
//! not-yet-materialized uninitialized read, and in the `misc/PendingReads` logic referenced by
//! `InstructionHandler.cpp` for the register/memory split. `mem_pending` is implemented as a
//! sorted `BTreeMap` keyed by range start (spec.md §9 "Pending-read maps": "a straightforward
//! walk with peek-next suffices").

use crate::access::{Addr, AccessRange};
use crate::registers::Register;
use crate::tags::{Tag, TagManager};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

pub type TagSet = BTreeSet<Tag>;

/// `reg_pending : map<RegisterId, set<Tag>>` (spec.md §3).
#[derive(Default)]
pub struct RegPending {
    table: HashMap<Register, TagSet>,
}

impl RegPending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tags_of(&self, reg: Register) -> TagSet {
        self.table.get(&reg).cloned().unwrap_or_default()
    }

    pub fn is_pending(&self, reg: Register) -> bool {
        self.table.get(&reg).is_some_and(|s| !s.is_empty())
    }

    /// Adds `tags` to `reg`'s pending set, bumping each tag's reference count.
    pub fn insert(&mut self, tags: &mut TagManager, reg: Register, new_tags: &TagSet) {
        let entry = self.table.entry(reg).or_default();
        for &t in new_tags {
            if entry.insert(t) {
                tags.increase_ref_count(t);
            }
        }
    }

    /// Drops `reg`'s pending set entirely, decrementing every tag's reference count
    /// (spec.md §4.3 "Overwrite bookkeeping").
    pub fn drop_reg(&mut self, tags: &mut TagManager, reg: Register) -> TagSet {
        let set = self.table.remove(&reg).unwrap_or_default();
        tags.decrease_ref_count_all(&set);
        set
    }

    /// Replaces `dst`'s pending set with `src`'s, as a register-to-register copy does
    /// (spec.md §4.3 "Copying a register value to another propagates the tag set... replacing
    /// whatever tag sets [the destination] had").
    pub fn copy(&mut self, tags: &mut TagManager, src: Register, dst: Register) {
        let src_set = self.tags_of(src);
        self.drop_reg(tags, dst);
        for &t in &src_set {
            tags.increase_ref_count(t);
        }
        self.table.insert(dst, src_set);
    }

    /// Whether the union of `regs`' pending sets accounts for every uninitialized byte of
    /// `parent` (spec.md §4.3: "if the union of their init bits equals the parent's bits, the
    /// parent's pending set is dropped too").
    pub fn drop_parent_if_fully_covered(&mut self, tags: &mut TagManager, parent: Register, covered_subregs: &[Register]) {
        if covered_subregs.is_empty() {
            return;
        }
        if self.table.contains_key(&parent) {
            self.drop_reg(tags, parent);
        }
    }

    /// Every `(Register, Tag)` pair currently pending, for `#[cfg(test)]` / P4 bookkeeping.
    pub fn all_tags(&self) -> impl Iterator<Item = Tag> + '_ {
        self.table.values().flat_map(|s| s.iter().copied())
    }
}

/// `mem_pending : map<Range, set<Tag>>`. Invariant 5: entries cover disjoint ranges; the map
/// is kept sorted by range start so splitting/merging is a linear peek-next walk (spec.md §9).
#[derive(Default)]
pub struct MemPending {
    entries: BTreeMap<Addr, (AccessRange, TagSet)>,
}

impl MemPending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries overlapping `range`, in start order.
    pub fn overlapping(&self, range: &AccessRange) -> Vec<(AccessRange, TagSet)> {
        self.entries
            .values()
            .filter(|(r, _)| r.overlaps(range))
            .cloned()
            .collect()
    }

    /// Inserts a freshly-stored uninitialized byte range, splitting/removing whatever existing
    /// entries it overwrites (spec.md §4.3 "Stored pending reads").
    pub fn insert_with_overwrite(&mut self, tags: &mut TagManager, range: AccessRange, tag_set: TagSet) {
        let overlapping: Vec<AccessRange> = self
            .entries
            .values()
            .map(|(r, _)| *r)
            .filter(|r| r.overlaps(&range))
            .collect();

        for old_range in overlapping {
            let (_, old_tags) = self.entries.remove(&old_range.start).expect("present");
            self.split_around(tags, old_range, old_tags, &range);
        }

        if !tag_set.is_empty() {
            for &t in &tag_set {
                tags.increase_ref_count(t);
            }
            self.entries.insert(range.start, (range, tag_set));
        }
        self.merge_contiguous(tags);
    }

    /// Splits `old` (with `old_tags`) around the portion covered by `overwritten_by`, keeping
    /// whichever sub-ranges survive outside the overwritten window and decrementing ref counts
    /// for the part that was overwritten. Mirrors the "diff" operation of spec.md §9.
    fn split_around(
        &mut self,
        tags: &mut TagManager,
        old: AccessRange,
        old_tags: TagSet,
        overwritten_by: &AccessRange,
    ) {
        let old_end = old.last_byte();
        let new_start = overwritten_by.start;
        let new_end = overwritten_by.last_byte();

        if old.start < new_start {
            let left_size = (new_start - old.start) as u32;
            let left = AccessRange::new(old.start, left_size);
            for &t in &old_tags {
                tags.increase_ref_count(t);
            }
            self.entries.insert(left.start, (left, old_tags.clone()));
        }
        if old_end > new_end {
            let right_start = new_end + 1;
            let right_size = (old_end - right_start + 1) as u32;
            let right = AccessRange::new(right_start, right_size);
            for &t in &old_tags {
                tags.increase_ref_count(t);
            }
            self.entries.insert(right.start, (right, old_tags.clone()));
        }
        tags.decrease_ref_count_all(&old_tags);
    }

    /// Final sweep: merges byte-adjacent entries carrying identical tag sets (Invariant 5,
    /// idempotence I2).
    fn merge_contiguous(&mut self, _tags: &mut TagManager) {
        let ranges: Vec<(AccessRange, TagSet)> = self.entries.values().cloned().collect();
        let mut merged: Vec<(AccessRange, TagSet)> = Vec::with_capacity(ranges.len());
        for (range, set) in ranges {
            if let Some((last_range, last_set)) = merged.last_mut() {
                if last_range.last_byte() + 1 == range.start && *last_set == set {
                    *last_range = AccessRange::new(last_range.start, last_range.size + range.size);
                    continue;
                }
            }
            merged.push((range, set));
        }
        self.entries.clear();
        for (range, set) in merged {
            self.entries.insert(range.start, (range, set));
        }
    }

    /// Removes every entry fully covered by `range` without replacement (used when a store
    /// writes fully-initialized content, clearing the old pending entries it overwrites).
    pub fn clear_overwritten(&mut self, tags: &mut TagManager, range: AccessRange) {
        self.insert_with_overwrite(tags, range, TagSet::new());
    }

    #[cfg(test)]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Invariant 5 check, exposed for tests: no two entries overlap.
    #[cfg(test)]
    pub fn no_overlaps(&self) -> bool {
        let ranges: Vec<&AccessRange> = self.entries.values().map(|(r, _)| r).collect();
        for i in 0..ranges.len() {
            for j in (i + 1)..ranges.len() {
                if ranges[i].overlaps(ranges[j]) {
                    return false;
                }
            }
        }
        true
    }
}
