//! Fatal-environment error taxonomy (spec.md section 7, item 1/4).
//!
//! Trace anomalies (unknown opcode/register, mismatched sizes, invalid syscalls) are *not*
//! represented here: they are absorbed locally and surfaced only through `log::warn!` plus
//! [`crate::diagnostics::Diagnostics`]. Only conditions the spec calls fatal get a variant.

use snafu::prelude::*;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("failed to allocate shadow page for region starting at {base:#x}"))]
    ShadowAllocation { base: u64 },

    #[snafu(display("thread {thread_id} started with no recorded initial stack pointer"))]
    InvalidThreadId { thread_id: u64 },

    #[snafu(display("free() of untracked pointer {ptr:#x}"))]
    CorruptedAllocatorState { ptr: u64 },

    #[snafu(display("could not write report to {}: {source}", path.display()))]
    ReportIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("could not open warnings log at {}: {source}", path.display()))]
    WarningsLogIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
