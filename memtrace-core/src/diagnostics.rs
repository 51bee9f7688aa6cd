//! Trace-anomaly side channel (spec.md §7 taxonomy item 2; SPEC_FULL.md §10 "Logging").
//!
//! Unknown opcodes/registers and mismatched load/store sizes are never `Result::Err` — they
//! are absorbed by the default emulator and only surfaced here: as a `log::warn!` at a
//! dedicated target so they can be filtered independently of the general log stream, and as
//! an in-memory counter plus an append-only `warningOpcodes.log`-style side file for offline
//! review, mirroring the original's `cerr`-based anomaly notes in `MemTrace.cpp`.

use crate::emulator::Opcode;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ANOMALY_TARGET: &str = "memtrace::anomaly";

#[derive(Debug, Default, Clone, Copy)]
pub struct DiagnosticsCounters {
    pub unknown_opcodes: u32,
    pub unknown_registers: u32,
    pub mismatched_sizes: u32,
    pub skipped_syscalls: u32,
}

pub struct Diagnostics {
    counters: DiagnosticsCounters,
    warnings_log_path: PathBuf,
}

impl Diagnostics {
    pub fn new(warnings_log_path: impl Into<PathBuf>) -> Self {
        Diagnostics {
            counters: DiagnosticsCounters::default(),
            warnings_log_path: warnings_log_path.into(),
        }
    }

    pub fn counters(&self) -> DiagnosticsCounters {
        self.counters
    }

    fn append_line(&self, line: &str) {
        if let Ok(mut f) = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.warnings_log_path)
        {
            let _ = writeln!(f, "{line}");
        }
    }

    pub fn unknown_opcode(&mut self, op: Opcode, ip: u64) {
        self.counters.unknown_opcodes += 1;
        log::warn!(target: ANOMALY_TARGET, "unknown opcode {:?} at {:#x}", op, ip);
        self.append_line(&format!("unknown-opcode {:?} ip={:#x}", op, ip));
    }

    pub fn unknown_register(&mut self, ip: u64) {
        self.counters.unknown_registers += 1;
        log::warn!(target: ANOMALY_TARGET, "unknown register referenced at {:#x}", ip);
    }

    pub fn mismatched_size(&mut self, op: Opcode, src_len: usize, dst_len: usize) {
        self.counters.mismatched_sizes += 1;
        log::warn!(
            target: ANOMALY_TARGET,
            "opcode {:?}: source/destination size mismatch ({} vs {})",
            op,
            src_len,
            dst_len
        );
        self.append_line(&format!(
            "size-mismatch opcode={:?} src={} dst={}",
            op, src_len, dst_len
        ));
    }

    pub fn skipped_syscall(&mut self, nr: u64) {
        self.counters.skipped_syscalls += 1;
        log::warn!(
            target: ANOMALY_TARGET,
            "syscall {} has no registered handler; skipped (may yield false positives)",
            nr
        );
    }

    pub fn warnings_log_path(&self) -> &Path {
        &self.warnings_log_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_anomaly_kind() {
        let dir = std::env::temp_dir().join(format!("memtrace-diag-test-{}", std::process::id()));
        let mut diag = Diagnostics::new(dir.join("warningOpcodes.log"));
        diag.unknown_opcode(Opcode(999), 0x1000);
        diag.mismatched_size(Opcode(1), 4, 8);
        diag.skipped_syscall(42);
        let c = diag.counters();
        assert_eq!(c.unknown_opcodes, 1);
        assert_eq!(c.mismatched_sizes, 1);
        assert_eq!(c.skipped_syscalls, 1);
        let _ = std::fs::remove_file(diag.warnings_log_path());
    }
}
