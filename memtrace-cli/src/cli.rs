//! Flag surface for the `memtrace` binary. Grounded in
//! `examples/mstange-samply/samply/src/cli.rs`'s `clap::Parser` derive style; unlike `samply`
//! this tool has no subcommands, so `Opt` is parsed directly.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use memtrace_core::config::{Arch, EngineConfig, LogFormat as CoreLogFormat, StringHeuristicMode};

#[derive(Debug, Parser)]
#[command(
    name = "memtrace",
    version,
    about = "Traces a process for reads of uninitialized stack/heap memory."
)]
pub struct Opt {
    /// Path the binary overlap report is written to.
    #[arg(short = 'o', long = "output", default_value = "./overlaps.bin")]
    pub report_path: PathBuf,

    /// Scope of the string-optimization heuristic that suppresses likely false positives
    /// from libc's word-at-a-time string routines.
    #[arg(short = 'u', long = "string-heuristic", value_enum, default_value_t = StringHeuristicArg::Libs)]
    pub string_heuristic: StringHeuristicArg,

    /// Include the dynamic linker's own instructions in the trace.
    #[arg(long = "keep-ld", default_value_t = false)]
    pub keep_ld: bool,

    /// Raise the log level; repeat for more detail (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format for the engine's own log stream.
    #[arg(long = "log-format", value_enum, default_value_t = LogFormatArg::Pretty)]
    pub log_format: LogFormatArg,

    /// Path trace anomalies (unknown opcodes, unknown registers) are appended to.
    #[arg(long = "warnings-log", default_value = "./warningOpcodes.log")]
    pub warnings_log_path: PathBuf,

    /// Target instruction width; the trace source determines this in practice, but a
    /// synthetic or recorded trace needs it spelled out up front.
    #[arg(long = "arch", value_enum, default_value_t = ArchArg::X86_64)]
    pub arch: ArchArg,

    /// The program to trace, followed by its own arguments.
    #[arg(trailing_var_arg = true, required = true)]
    pub program_and_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StringHeuristicArg {
    On,
    Off,
    Libs,
}

impl From<StringHeuristicArg> for StringHeuristicMode {
    fn from(value: StringHeuristicArg) -> Self {
        match value {
            StringHeuristicArg::On => StringHeuristicMode::On,
            StringHeuristicArg::Off => StringHeuristicMode::Off,
            StringHeuristicArg::Libs => StringHeuristicMode::LibsOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for CoreLogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => CoreLogFormat::Pretty,
            LogFormatArg::Json => CoreLogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ArchArg {
    #[value(name = "x86")]
    X86_32,
    #[value(name = "x86-64")]
    X86_64,
}

impl From<ArchArg> for Arch {
    fn from(value: ArchArg) -> Self {
        match value {
            ArchArg::X86_32 => Arch::X86_32,
            ArchArg::X86_64 => Arch::X86_64,
        }
    }
}

impl Opt {
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            arch: self.arch.into(),
            report_path: self.report_path.clone(),
            string_heuristic: self.string_heuristic.into(),
            keep_ld: self.keep_ld,
            warnings_log_path: self.warnings_log_path.clone(),
            log_format: self.log_format.into(),
            size_mismatch_allow_list: Vec::new(),
        }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
