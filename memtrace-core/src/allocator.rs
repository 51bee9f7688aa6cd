//! Allocator adapter (spec.md §4.6). Grounded in
//! `original_source/x86_64_linux_malloc_handlers.h`: `malloc_get_block_size`,
//! `malloc_get_block_beginning`, `malloc_get_main_heap_upper_bound`, and
//! `malloc_mem_to_reinit` (the ptmalloc2 carve-out). The original reinitializes
//! `[block_addr + 32, block_addr + blockSize)`, where `block_addr = user_ptr - 16`: the
//! 16-byte chunk header precedes `block_addr`, so `block_addr + 32` lands exactly 16 bytes
//! *past* the user pointer, not 32 — `reinit_segments` below is keyed off the user pointer
//! directly, so its offset is that 16, matching "avoid re-initializing the first 16 bytes of
//! the payload" (the part of it `free()`'s `fd`/`bk` free-list linkage overwrites).

use crate::access::Addr;

pub trait AllocatorAdapter {
    /// Carve-out kept un-reset on `free()`, as `(offset_from_block_start, size)` pairs
    /// relative to the user pointer (spec.md §4.6 "published as `reinit_segments`").
    fn reinit_segments(&self, block_size: u64) -> Vec<(u64, u64)>;

    /// User-pointer offset back to the allocator's internal block-start bookkeeping address,
    /// used only to decide mmap-single-chunk vs normal heap membership.
    fn block_beginning(&self, user_ptr: Addr) -> Addr;
}

/// glibc ptmalloc2 on x86-64: the first 16 bytes of the user payload alias `free()`'s
/// `fd`/`bk` free-list linkage and must stay untouched; mirrors `malloc_mem_to_reinit`'s
/// `block_addr + 32` re-expressed relative to the user pointer (`block_addr = user_ptr - 16`).
pub struct GlibcPtmalloc2;

impl AllocatorAdapter for GlibcPtmalloc2 {
    fn reinit_segments(&self, block_size: u64) -> Vec<(u64, u64)> {
        if block_size <= 16 {
            return Vec::new();
        }
        vec![(16, block_size - 16)]
    }

    fn block_beginning(&self, user_ptr: Addr) -> Addr {
        user_ptr.wrapping_sub(16)
    }
}

/// A heap block's live metadata, used to replay the buffered writes an intercepted
/// `malloc`/`calloc`/`realloc` makes before control returns to the monitored program
/// (spec.md §4.6 "Inside the call, all heap writes are diverted to a temporary buffer").
#[derive(Debug, Clone)]
pub struct PendingAllocation {
    pub requested_size: u64,
    /// For `realloc`/`free`: the block's previous size, read before the call.
    pub previous_size: Option<u64>,
    pub buffered_writes: Vec<(Addr, Vec<u8>)>,
}

impl PendingAllocation {
    pub fn new(requested_size: u64, previous_size: Option<u64>) -> Self {
        PendingAllocation {
            requested_size,
            previous_size,
            buffered_writes: Vec::new(),
        }
    }

    pub fn buffer_write(&mut self, addr: Addr, bytes: Vec<u8>) {
        self.buffered_writes.push((addr, bytes));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glibc_carveout_keeps_freelist_linkage() {
        // P3-relevant constant check: 16-byte carve-out from the user pointer, as the
        // original's malloc_mem_to_reinit computes relative to block_addr = user_ptr - 16.
        let adapter = GlibcPtmalloc2;
        assert_eq!(adapter.reinit_segments(64), vec![(16, 48)]);
        assert_eq!(adapter.block_beginning(0x1000), 0xff0);
    }

    #[test]
    fn tiny_blocks_have_no_reinit_segment() {
        let adapter = GlibcPtmalloc2;
        assert!(adapter.reinit_segments(16).is_empty());
    }
}
