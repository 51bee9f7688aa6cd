//! Overlap aggregator (spec.md §4.5): gathers every access keyed by exact `(address,size)`,
//! tracks the most recent write touching each byte, and at finalization resolves which writes
//! actually contribute bytes read by each uninitialized read.
//!
//! Grounded in `original_source/src/MemTrace.cpp`'s `fullOverlaps`/`lastWriteInstruction`/
//! `partialOverlaps` globals and the finalization loop around line 2427 (`computeOverlaps`).
//! Per spec.md §9 "Global mutable maps" these become fields of [`OverlapAggregator`], itself
//! owned by `crate::engine::Engine` rather than a free-standing global.

use crate::access::{AccessRange, AccessRecord};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

/// `all_accesses : map<AccessRange, set<AccessRecord>>`. A `HashMap` is used during trace for
/// speed (spec.md §3: "during trace a faster unordered structure is used"); `finalize` sorts
/// it.
#[derive(Default)]
pub struct OverlapAggregator {
    all_accesses: HashMap<AccessRange, Vec<AccessRecord>>,
    contains_uninit: BTreeSet<AccessRange>,
    /// Last write touching each exact `(addr, size)`, ordered by last-byte-accessed
    /// (`AccessIndex::LastAccessedByteSorter`), used to seed the context hash and the replay
    /// scan.
    last_write: BTreeMap<u64, (AccessRange, AccessRecord)>,
    seen_contexts: std::collections::HashSet<(u64, u64)>,
}

/// Finalized, sorted view produced once the monitored process exits (spec.md §4.5
/// "Finalization scan").
pub struct FinalizedOverlaps {
    pub all_accesses: BTreeMap<AccessRange, Vec<AccessRecord>>,
    pub partial_overlaps: BTreeMap<AccessRange, Vec<AccessRecord>>,
}

impl OverlapAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` into `all_accesses`, and for writes also updates the last-write map
    /// keyed by last-byte-accessed ordering (spec.md §4.5).
    pub fn record(&mut self, record: AccessRecord) {
        if record.is_uninitialized_read {
            self.contains_uninit.insert(record.range);
        }
        if record.is_write() {
            self.last_write
                .insert(record.range.last_byte(), (record.range, record.clone()));
        }
        self.all_accesses.entry(record.range).or_default().push(record);
    }

    /// Every last-write entry whose range overlaps `range`, in last-byte order.
    fn last_writes_overlapping(&self, range: &AccessRange) -> Vec<&AccessRecord> {
        self.last_write
            .values()
            .filter(|(r, _)| r.overlaps(range))
            .map(|(_, rec)| rec)
            .collect()
    }

    /// Duplicate suppression during trace (spec.md §4.5): a cheap XOR-rotate context hash over
    /// the read plus every overlapping last write. Returns `true` if this `(read, hash)` pair
    /// is new (should be kept), `false` if it's a repeat of an already-seen context.
    pub fn note_uninitialized_read(&mut self, read: &AccessRecord) -> bool {
        let mut hash = access_hash(read);
        for w in self.last_writes_overlapping(&read.range) {
            hash = hash.rotate_left(4) ^ access_hash(w);
        }
        self.seen_contexts.insert((read.range.start, hash))
    }

    /// Walks `all_accesses` in sorted order; for every key containing an uninitialized read,
    /// gathers every key whose range touches it (spec.md §4.5 "Finalization scan"), using a
    /// sliding low-water-mark pointer exactly as the original's `firstPartiallyOverlappingIterator`
    /// does, then filters candidate writes through [`is_read_by_uninit`].
    pub fn finalize(self) -> FinalizedOverlaps {
        let sorted: BTreeMap<AccessRange, Vec<AccessRecord>> = self.all_accesses.into_iter().collect();
        let keys: Vec<AccessRange> = sorted.keys().copied().collect();

        let mut partial_overlaps: BTreeMap<AccessRange, Vec<AccessRecord>> = BTreeMap::new();

        let mut low_water = 0usize;
        for (idx, key) in keys.iter().enumerate() {
            if !self.contains_uninit.contains(key) {
                continue;
            }
            // Advance low_water to the first key that still overlaps `key`'s window,
            // mirroring the original's retained iterator across finalization steps.
            while low_water < idx && !keys[low_water].overlaps(key) {
                low_water += 1;
            }
            let mut touching: Vec<AccessRecord> = Vec::new();
            let mut scan = low_water;
            // Outward walk in both directions of this sorted range: keys before `idx` that
            // still overlap (ranges can start earlier but extend past `key`'s start) and keys
            // from `idx` onward until the range no longer touches.
            while scan < keys.len() && keys[scan].start <= key.last_byte() {
                if keys[scan].overlaps(key) {
                    touching.extend(sorted[&keys[scan]].iter().cloned());
                }
                scan += 1;
            }

            let reads: Vec<&AccessRecord> = sorted[key].iter().filter(|r| r.is_uninitialized_read).collect();
            let mut kept: Vec<AccessRecord> = Vec::new();
            for candidate in &touching {
                if candidate.range == *key {
                    continue;
                }
                if !candidate.is_write() {
                    continue;
                }
                if reads.iter().any(|r| is_read_by_uninit(candidate, r, &touching)) {
                    kept.push(candidate.clone());
                }
            }
            if !kept.is_empty() {
                partial_overlaps.insert(*key, kept);
            }
        }

        FinalizedOverlaps {
            all_accesses: sorted,
            partial_overlaps,
        }
    }
}

/// Cheap non-cryptographic hash used only for in-trace duplicate suppression; mirrors the
/// original's `MemoryAccess::MAHasher` (XOR of the execution order with its own high half).
fn access_hash(record: &AccessRecord) -> u64 {
    record.order ^ (record.order >> 32)
}

/// `is_read_by_uninit` (spec.md §4.5 "Overwrite replay"): for candidate write `w` and target
/// uninitialized read `r` with `r.order > w.order`, walk the access set in execution order
/// tracking which bytes of `w` were overwritten by an intervening write before `r`; `w`
/// survives iff at least one of its not-yet-overwritten bytes is covered by `r`'s range at the
/// moment `r` executes.
pub fn is_read_by_uninit(w: &AccessRecord, r: &AccessRecord, universe: &[AccessRecord]) -> bool {
    if r.order <= w.order {
        return false;
    }
    let mut overwritten = vec![false; w.range.size as usize];
    let mut intervening: Vec<&AccessRecord> = universe
        .iter()
        .filter(|a| a.order > w.order && a.order <= r.order && a.is_write())
        .collect();
    intervening.sort_by_key(|a| a.order);

    for write in intervening {
        if write.order == r.order {
            continue;
        }
        for i in 0..w.range.size as u64 {
            let byte_addr = w.range.start + i;
            if write.range.contains_addr(byte_addr) {
                overwritten[i as usize] = true;
            }
        }
        if overwritten.iter().all(|&b| b) {
            return false;
        }
    }

    for i in 0..w.range.size as u64 {
        if overwritten[i as usize] {
            continue;
        }
        let byte_addr = w.range.start + i;
        if r.range.contains_addr(byte_addr) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessType, Discriminator};
    use crate::emulator::Opcode;

    fn record(order: u64, addr: u64, size: u32, ty: AccessType, uninit: bool) -> AccessRecord {
        AccessRecord {
            order,
            ip: 0x400000,
            actual_ip: 0x400000,
            opcode: Opcode(0),
            access_type: ty,
            range: AccessRange::new(addr, size),
            sp_offset: 0,
            bp_offset: 0,
            disasm: None,
            is_uninitialized_read: uninit,
            uninitialized_snapshot: None,
            discriminator: Discriminator::Stack,
        }
    }

    #[test]
    fn write_not_overwritten_before_read_is_kept() {
        let w = record(1, 0x1000, 8, AccessType::Write, false);
        let r = record(2, 0x1000, 8, AccessType::Read, true);
        assert!(is_read_by_uninit(&w, &r, &[w.clone(), r.clone()]));
    }

    #[test]
    fn fully_overwritten_write_is_discarded() {
        let w = record(1, 0x1000, 8, AccessType::Write, false);
        let overwrite = record(2, 0x1000, 8, AccessType::Write, false);
        let r = record(3, 0x1000, 8, AccessType::Read, true);
        assert!(!is_read_by_uninit(&w, &r, &[w.clone(), overwrite.clone(), r.clone()]));
    }

    #[test]
    fn partial_overwrite_leaves_surviving_bytes_readable() {
        let w = record(1, 0x1000, 8, AccessType::Write, false);
        let overwrite = record(2, 0x1000, 4, AccessType::Write, false);
        let r = record(3, 0x1004, 4, AccessType::Read, true);
        assert!(is_read_by_uninit(&w, &r, &[w.clone(), overwrite.clone(), r.clone()]));
    }

    #[test]
    fn duplicate_context_is_suppressed() {
        let mut agg = OverlapAggregator::new();
        let w = record(1, 0x1000, 8, AccessType::Write, false);
        agg.record(w);
        let r1 = record(2, 0x1000, 8, AccessType::Read, true);
        let r2 = record(2, 0x1000, 8, AccessType::Read, true);
        assert!(agg.note_uninitialized_read(&r1));
        assert!(!agg.note_uninitialized_read(&r2));
    }

    #[test]
    fn finalize_groups_uninitialized_reads_with_contributing_writes() {
        // spec.md §8 scenario 1 shape, through the aggregator.
        let mut agg = OverlapAggregator::new();
        let w = record(1, 0x7fff0000, 8, AccessType::Write, false);
        let r = record(2, 0x7fff0000, 16, AccessType::Read, true);
        agg.record(w);
        agg.record(r);
        let finalized = agg.finalize();
        assert!(finalized.all_accesses.contains_key(&AccessRange::new(0x7fff0000, 16)));
    }
}
