//! The "string-optimization heuristic" (spec.md §6 `-u` flag, §9 Open Questions).
//!
//! The precise rationale is undocumented (Open Question, spec.md §9); per the recorded
//! decision in SPEC_FULL.md §9/DESIGN.md it is implemented as a pure function over a shadow
//! snapshot plus the raw bytes actually read, gated by [`crate::config::StringHeuristicMode`],
//! exactly matching the literal rule: reads of size >= 16 containing an initialized NUL byte
//! with even-length uninitialized intervals are suppressed. `libc` string routines
//! (`strlen`/`strcpy` families) commonly over-read a few trailing bytes of a buffer up to the
//! next aligned word looking for a NUL terminator; this suppresses exactly that shape of
//! false positive.

use crate::config::StringHeuristicMode;
use crate::shadow::BitSnapshot;

/// Whether an uninitialized read should be suppressed by the heuristic. `is_library_origin`
/// reflects whether the access originated from a dynamically loaded library (spec.md §3
/// Invariant 7's discriminator), since `LibsOnly` only applies there.
pub fn should_suppress(
    mode: StringHeuristicMode,
    is_library_origin: bool,
    snapshot: &BitSnapshot,
    raw_bytes: &[u8],
) -> bool {
    match mode {
        StringHeuristicMode::Off => return false,
        StringHeuristicMode::LibsOnly if !is_library_origin => return false,
        _ => {}
    }

    if snapshot.len() < 16 {
        return false;
    }

    let has_initialized_nul = (0..snapshot.len()).any(|i| snapshot.get(i) && raw_bytes.get(i) == Some(&0));
    if !has_initialized_nul {
        return false;
    }

    snapshot
        .compute_intervals()
        .into_iter()
        .all(|(lo, hi)| (hi - lo + 1) % 2 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppresses_even_length_uninit_interval_with_nul() {
        let snapshot = BitSnapshot::from_intervals(16, &[(14, 15)]);
        let mut raw = vec![0x41u8; 16];
        raw[13] = 0; // initialized NUL just before the trailing uninitialized pair.
        assert!(should_suppress(StringHeuristicMode::On, false, &snapshot, &raw));
    }

    #[test]
    fn does_not_suppress_odd_length_interval() {
        let snapshot = BitSnapshot::from_intervals(16, &[(15, 15)]);
        let mut raw = vec![0x41u8; 16];
        raw[14] = 0;
        assert!(!should_suppress(StringHeuristicMode::On, false, &snapshot, &raw));
    }

    #[test]
    fn off_mode_never_suppresses() {
        let snapshot = BitSnapshot::from_intervals(16, &[(14, 15)]);
        let mut raw = vec![0x41u8; 16];
        raw[13] = 0;
        assert!(!should_suppress(StringHeuristicMode::Off, true, &snapshot, &raw));
    }

    #[test]
    fn libs_only_mode_requires_library_origin() {
        let snapshot = BitSnapshot::from_intervals(16, &[(14, 15)]);
        let mut raw = vec![0x41u8; 16];
        raw[13] = 0;
        assert!(!should_suppress(StringHeuristicMode::LibsOnly, false, &snapshot, &raw));
        assert!(should_suppress(StringHeuristicMode::LibsOnly, true, &snapshot, &raw));
    }

    #[test]
    fn small_reads_are_never_suppressed() {
        let snapshot = BitSnapshot::from_intervals(4, &[(2, 3)]);
        let raw = vec![0u8; 4];
        assert!(!should_suppress(StringHeuristicMode::On, true, &snapshot, &raw));
    }
}
