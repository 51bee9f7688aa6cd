//! Syscall adapter (spec.md §4.6). Grounded in `original_source/src/SyscallHandler.h`'s
//! state-pattern entry/exit machine and `original_source/x86_64_linux_syscall_handlers.h`'s
//! per-syscall-number handler table (`sys_read_handler`, `sys_write_handler`, ...).
//!
//! Per spec.md §9 "Singletons"/"Global mutable maps", the original's `SyscallHandlerState`
//! class hierarchy (Unset/Entry/Exit) collapses to a plain `SyscallPhase` enum owned by
//! [`SyscallAdapter`], which the engine drives directly rather than through virtual dispatch.

use crate::access::{Addr, AccessType};
use fnv::FnvBuildHasher;
use hashbrown::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyscallPhase {
    Unset,
    Entry,
    Exit,
}

/// One buffer range touched by a syscall (`SyscallMemAccess` in the original).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallMemAccess {
    pub addr: Addr,
    pub size: u32,
    pub access_type: AccessType,
}

type HandlerFn = fn(retval: i64, args: &[u64]) -> Vec<SyscallMemAccess>;

/// `sys_read_handler`/`sys_pread_handler`: the return value is the number of bytes actually
/// written into `args[1]`.
fn read_like(retval: i64, args: &[u64]) -> Vec<SyscallMemAccess> {
    if retval <= 0 {
        return Vec::new();
    }
    vec![SyscallMemAccess {
        addr: args[1],
        size: retval as u32,
        access_type: AccessType::Write,
    }]
}

/// `sys_write_handler`/`sys_pwrite_handler`: the kernel reads `args[2]` bytes from `args[1]`
/// (the return value is how many were actually consumed; the original's handler still treats
/// the whole requested range as read since a short write still reads its prefix).
fn write_like(retval: i64, args: &[u64]) -> Vec<SyscallMemAccess> {
    if retval <= 0 {
        return Vec::new();
    }
    vec![SyscallMemAccess {
        addr: args[1],
        size: retval as u32,
        access_type: AccessType::Read,
    }]
}

/// `recvfrom(2)`: writes into the buffer at `args[1]`, up to `retval` bytes.
fn recvfrom(retval: i64, args: &[u64]) -> Vec<SyscallMemAccess> {
    read_like(retval, args)
}

/// `mmap(2)`: the kernel does not touch the mapped bytes itself (no content flows through the
/// syscall boundary); tracked only so the allocator adapter can see the returned base via
/// `retval`. No direct memory access to report.
fn mmap(_retval: i64, _args: &[u64]) -> Vec<SyscallMemAccess> {
    Vec::new()
}

/// `brk(2)`: like `mmap`, no buffer content crosses the boundary; handled separately by the
/// allocator adapter invalidating last-write entries above the new break (spec.md §4.6).
fn brk(_retval: i64, _args: &[u64]) -> Vec<SyscallMemAccess> {
    Vec::new()
}

pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_PREAD64: u64 = 17;
pub const SYS_PWRITE64: u64 = 18;
pub const SYS_RECVFROM: u64 = 45;
pub const SYS_MMAP: u64 = 9;
pub const SYS_BRK: u64 = 12;

fn handler_table() -> HashMap<u64, HandlerFn, FnvBuildHasher> {
    let mut m: HashMap<u64, HandlerFn, FnvBuildHasher> = HashMap::default();
    m.insert(SYS_READ, read_like);
    m.insert(SYS_WRITE, write_like);
    m.insert(SYS_PREAD64, read_like);
    m.insert(SYS_PWRITE64, write_like);
    m.insert(SYS_RECVFROM, recvfrom);
    m.insert(SYS_MMAP, mmap);
    m.insert(SYS_BRK, brk);
    m
}

/// Drives the entry/exit state machine and dispatches to the per-syscall handler table
/// (spec.md §4.6). Owned by `crate::engine::Engine`; never a process-wide singleton.
pub struct SyscallAdapter {
    phase: SyscallPhase,
    sys_num: u64,
    args: Vec<u64>,
    handlers: HashMap<u64, HandlerFn, FnvBuildHasher>,
}

impl Default for SyscallAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SyscallAdapter {
    pub fn new() -> Self {
        SyscallAdapter {
            phase: SyscallPhase::Unset,
            sys_num: 0,
            args: Vec::new(),
            handlers: handler_table(),
        }
    }

    pub fn on_entry(&mut self, sys_num: u64, args: Vec<u64>) {
        self.phase = SyscallPhase::Entry;
        self.sys_num = sys_num;
        self.args = args;
    }

    /// Returns the buffer ranges touched by the syscall, or `None` if no handler is registered
    /// (spec.md §7 taxonomy item 3: "the syscall is skipped with a note that this may yield
    /// false positives").
    pub fn on_exit(&mut self, retval: i64) -> Option<Vec<SyscallMemAccess>> {
        debug_assert_eq!(self.phase, SyscallPhase::Entry);
        self.phase = SyscallPhase::Exit;
        let result = self
            .handlers
            .get(&self.sys_num)
            .map(|handler| handler(retval, &self.args));
        self.phase = SyscallPhase::Unset;
        result
    }

    pub fn has_handler(&self, sys_num: u64) -> bool {
        self.handlers.contains_key(&sys_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_syscall_reports_a_write_to_the_buffer() {
        let mut adapter = SyscallAdapter::new();
        adapter.on_entry(SYS_READ, vec![3, 0x7fff_1000, 64]);
        let accesses = adapter.on_exit(32).unwrap();
        assert_eq!(accesses.len(), 1);
        assert_eq!(accesses[0].access_type, AccessType::Write);
        assert_eq!(accesses[0].size, 32);
    }

    #[test]
    fn unregistered_syscall_is_skipped_not_fatal() {
        let mut adapter = SyscallAdapter::new();
        adapter.on_entry(999, vec![]);
        assert!(adapter.on_exit(0).is_none());
    }

    #[test]
    fn mmap_and_brk_report_no_direct_accesses() {
        let mut adapter = SyscallAdapter::new();
        adapter.on_entry(SYS_MMAP, vec![0, 4096, 3, 0x22, u64::MAX, 0]);
        assert_eq!(adapter.on_exit(0x7f0000000000).unwrap().len(), 0);
    }
}
