//! `EngineConfig`: the single configuration value threaded into `Engine::new` (spec.md §6,
//! §9 "Singletons" / "Global mutable maps" — no global mutable configuration state).
//!
//! Grounded in `original_source/src/KnobTypes.h` (the Pin "knob" types backing the CLI flags
//! the original reads at startup) and `original_source/src/AnalysisArgs.{h,cpp}` for the
//! shape of per-call arguments threaded through the analysis routines. CLI parsing itself
//! (the `clap` surface) lives in the `memtrace-cli` binary crate; this type is the plain,
//! host-agnostic value it builds.

use crate::emulator::Opcode;
use hashbrown::HashMap;
use std::path::PathBuf;

/// The "string-optimization heuristic" scope (spec.md §6 `-u` flag, §9 Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringHeuristicMode {
    On,
    Off,
    /// Default: only suppressed for accesses originating from library code.
    LibsOnly,
}

impl Default for StringHeuristicMode {
    fn default() -> Self {
        StringHeuristicMode::LibsOnly
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_32,
    X86_64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub arch: Arch,
    /// `-o`, default `./overlaps.bin`.
    pub report_path: PathBuf,
    /// `-u`, default `LIBS`.
    pub string_heuristic: StringHeuristicMode,
    /// `--keep-ld`, default off: whether to include the dynamic linker's own instructions.
    pub keep_ld: bool,
    /// `--warnings-log`, default `./warningOpcodes.log`.
    pub warnings_log_path: PathBuf,
    /// `--log-format`.
    pub log_format: LogFormat,
    /// Opcodes for which a mismatched load/destination size warning is silenced (spec.md
    /// §4.4 "a configurable allow-list of opcodes silences the warning").
    pub size_mismatch_allow_list: Vec<Opcode>,
}

impl EngineConfig {
    pub fn allow_list_map(&self) -> HashMap<Opcode, (), fnv::FnvBuildHasher> {
        let mut m: HashMap<Opcode, (), fnv::FnvBuildHasher> = HashMap::default();
        for &op in &self.size_mismatch_allow_list {
            m.insert(op, ());
        }
        m
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            arch: Arch::X86_64,
            report_path: PathBuf::from("./overlaps.bin"),
            string_heuristic: StringHeuristicMode::default(),
            keep_ld: false,
            warnings_log_path: PathBuf::from("./warningOpcodes.log"),
            log_format: LogFormat::default(),
            size_mismatch_allow_list: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_cli_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.report_path, PathBuf::from("./overlaps.bin"));
        assert_eq!(cfg.string_heuristic, StringHeuristicMode::LibsOnly);
        assert!(!cfg.keep_ld);
    }
}
