//! Top-level controller (spec.md §2 item 8): the `Engine` value a host's instrumentation
//! trampolines drive through `on_image_load`, `on_thread_start`, `on_instruction` (split here
//! into the narrower `record_read`/`record_write`/`propagate_reg`/`use_register` operations the
//! emulator dispatch actually needs), `on_syscall_entry/exit`, `on_malloc_before/after`,
//! `on_free_before/after`, and `on_fini`.
//!
//! Grounded in `original_source/src/MemTrace.cpp`, which wires the same global state (shadow
//! memory, `ShadowRegisterFile`, `TagManager`, pending-read maps, the overlap aggregator) to
//! Intel PIN's instrumentation callbacks. Per spec.md §9 "Singletons"/"Global mutable maps",
//! every one of those becomes a field of this single value rather than a process-wide global;
//! a host needing `extern "C"` trampolines is expected to park one `Engine` behind
//! `once_cell::sync::OnceCell<Mutex<Engine>>` at its own ABI boundary (SPEC_FULL.md §5/§10).

use crate::access::{Addr, AccessRange, AccessRecord, AccessType, Discriminator};
use crate::aggregator::OverlapAggregator;
use crate::allocator::{AllocatorAdapter, GlibcPtmalloc2, PendingAllocation};
use crate::config::{Arch as ConfigArch, EngineConfig};
use crate::diagnostics::Diagnostics;
use crate::emulator::{self, Opcode, StackAllocation};
use crate::error::{CorruptedAllocatorStateSnafu, EngineError};
use crate::heuristics;
use crate::pending::{MemPending, RegPending, TagSet};
use crate::registers::{Register, ShadowRegisterFile};
use crate::report::{self, LoadedImage, Report, RegSize};
use crate::shadow::{Arch as ShadowArch, HeapKind, ShadowSpace};
use crate::syscall::SyscallAdapter;
use crate::tags::TagManager;
use hashbrown::{HashMap, HashSet};
use snafu::ensure;

fn to_shadow_arch(arch: ConfigArch) -> ShadowArch {
    match arch {
        ConfigArch::X86_32 => ShadowArch::X86_32,
        ConfigArch::X86_64 => ShadowArch::X86_64,
    }
}

/// Every sub-register of `reg` that is narrower than it and shares its storage (spec.md
/// §4.3: "every proper sub-register of each destination, with smaller byte size").
fn proper_subregisters(file: &ShadowRegisterFile, reg: Register) -> Vec<Register> {
    file.aliases(reg)
        .into_iter()
        .filter(|&r| r != reg && r.byte_size() < reg.byte_size())
        .collect()
}

pub struct Engine {
    config: EngineConfig,
    shadow: ShadowSpace,
    registers: ShadowRegisterFile,
    tags: TagManager,
    reg_pending: RegPending,
    mem_pending: MemPending,
    aggregator: OverlapAggregator,
    diagnostics: Diagnostics,
    syscall: SyscallAdapter,
    allocator: Box<dyn AllocatorAdapter>,
    images: Vec<LoadedImage>,
    main_image_range: Option<(Addr, Addr)>,
    main_entry_executed: bool,
    stack_base: Addr,
    order_counter: u64,
    stack_clash: Option<StackAllocation>,
    pending_allocations: HashMap<Addr, PendingAllocation>,
    heap_high_water: Addr,
    /// User pointers currently live on the heap (normal or mmap-single-chunk), tracked so
    /// `on_free` can detect the "free of unknown pointer" fatal condition (spec.md §7 taxonomy
    /// item 1).
    live_allocations: HashSet<Addr>,
}

impl Engine {
    pub fn new(config: EngineConfig, initial_sp: Addr, heap_base: Addr) -> Self {
        let warnings_path = config.warnings_log_path.clone();
        Engine {
            shadow: ShadowSpace::new(to_shadow_arch(config.arch), initial_sp, heap_base),
            registers: ShadowRegisterFile::new(),
            tags: TagManager::new(),
            reg_pending: RegPending::new(),
            mem_pending: MemPending::new(),
            aggregator: OverlapAggregator::new(),
            diagnostics: Diagnostics::new(warnings_path),
            syscall: SyscallAdapter::new(),
            allocator: Box::new(GlibcPtmalloc2),
            images: Vec::new(),
            main_image_range: None,
            main_entry_executed: false,
            stack_base: initial_sp,
            order_counter: 0,
            stack_clash: None,
            pending_allocations: HashMap::new(),
            heap_high_water: heap_base,
            live_allocations: HashSet::new(),
            config,
        }
    }

    fn next_order(&mut self) -> u64 {
        let o = self.order_counter;
        self.order_counter += 1;
        o
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    // ---- Controller callbacks (spec.md §2 item 8) ----

    pub fn on_image_load(&mut self, name: impl Into<String>, base: Addr, size: u64, is_main: bool) {
        if is_main {
            self.main_image_range = Some((base, base + size));
        }
        self.images.push(LoadedImage { name: name.into(), base });
    }

    pub fn on_thread_start(&mut self, initial_sp: Addr) -> Result<(), EngineError> {
        ensure!(initial_sp != 0, crate::error::InvalidThreadIdSnafu { thread_id: 0u64 });
        self.stack_base = initial_sp;
        Ok(())
    }

    /// Invariant 7: an access is recorded only if it's inside the main executable, or it's a
    /// library access observed after the main entry point has run at least once.
    fn is_observable(&mut self, actual_ip: Addr) -> bool {
        let in_main = self
            .main_image_range
            .is_some_and(|(lo, hi)| actual_ip >= lo && actual_ip < hi);
        if in_main {
            self.main_entry_executed = true;
            true
        } else {
            self.main_entry_executed
        }
    }

    // ---- Stack-clash detection (spec.md §4.4) ----

    pub fn on_stack_pointer_sub(&mut self, current_sp: Addr, size: u64) {
        self.stack_clash = Some(StackAllocation::new(current_sp, size));
    }

    fn stack_clash_suppresses(&mut self, addr: Addr) -> bool {
        self.stack_clash
            .as_mut()
            .is_some_and(|alloc| alloc.should_suppress(addr))
    }

    // ---- Memory reads/writes (spec.md §4.3, §4.4) ----

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &mut self,
        ip: Addr,
        actual_ip: Addr,
        opcode: Opcode,
        addr: Addr,
        size: u32,
        access_type: AccessType,
        sp_offset: i64,
        bp_offset: i64,
        disasm: Option<String>,
        discriminator: Discriminator,
    ) -> AccessRecord {
        let order = self.next_order();
        AccessRecord {
            order,
            ip,
            actual_ip,
            opcode,
            access_type,
            range: AccessRange::new(addr, size),
            sp_offset,
            bp_offset,
            disasm,
            is_uninitialized_read: false,
            uninitialized_snapshot: None,
            discriminator,
        }
    }

    /// A store instruction (spec.md §4.3 "Stored pending reads", §4.4 "Default store" plus the
    /// specialized handlers it names). `src_mask` is the combined per-byte init status of the
    /// source register(s), or `None` for an immediate store (the whole range becomes
    /// initialized). `opcode` additionally selects a specialized mask handler when one applies
    /// (sign/zero conversion, x87 narrow store, scalar `MOVSS`/`MOVSD`) before the generic
    /// default-store mask is used.
    #[allow(clippy::too_many_arguments)]
    pub fn record_write(
        &mut self,
        ip: Addr,
        actual_ip: Addr,
        opcode: Opcode,
        addr: Addr,
        size: u32,
        sp_offset: i64,
        bp_offset: i64,
        disasm: Option<String>,
        discriminator: Discriminator,
        src_mask: Option<Vec<bool>>,
        src_tags: TagSet,
    ) -> Result<AccessRecord, EngineError> {
        let observable = self.is_observable(actual_ip);
        // spec.md §4.4 "Default store": combined source-register status, packed and
        // truncated/extended to the destination width; absent sources (immediate store)
        // mark the whole range initialized.
        let generic_mask = match &src_mask {
            Some(mask) => emulator::default_store_mask(&[mask.as_slice()], size as usize),
            None => emulator::default_store_mask(&[], size as usize),
        };
        let mask = self.specialized_store_mask(opcode, addr, size, discriminator, &generic_mask);

        {
            let region = self.region_for(addr, discriminator);
            region.mark_initialized_with_mask(addr, size, &mask);
        }

        let range = AccessRange::new(addr, size);
        let any_uninit = mask.iter().any(|&b| !b);
        if any_uninit && !src_tags.is_empty() {
            self.mem_pending.insert_with_overwrite(&mut self.tags, range, src_tags);
        } else {
            self.mem_pending.clear_overwritten(&mut self.tags, range);
        }

        let record = self.build_record(
            ip, actual_ip, opcode, addr, size, AccessType::Write, sp_offset, bp_offset, disasm, discriminator,
        );
        if observable {
            self.aggregator.record(record.clone());
        }
        Ok(record)
    }

    /// The memory-accessing half of the opcode dispatch (spec.md §4.4): most opcodes fall
    /// through to the generic source mask, but a handful need a specialized byte-mask
    /// algorithm applied before the store commits.
    fn specialized_store_mask(
        &mut self,
        opcode: Opcode,
        addr: Addr,
        size: u32,
        discriminator: Discriminator,
        generic_mask: &[bool],
    ) -> Vec<bool> {
        match opcode {
            Opcode::CWD | Opcode::CDQ | Opcode::CQO => emulator::convert_mask(size as usize),
            Opcode::FST | Opcode::FSTP | Opcode::FIST | Opcode::FISTP | Opcode::FISTTP => {
                emulator::x87_store_mask(generic_mask, size as usize)
            }
            Opcode::MOVSS | Opcode::MOVSD => {
                let scalar_len = if opcode == Opcode::MOVSS { 4usize } else { 8usize };
                let mut out = emulator::movscalar_mask(generic_mask, scalar_len.min(size as usize));
                let preserved_len = size as usize - out.len();
                if preserved_len > 0 {
                    let preserved_addr = addr + out.len() as Addr;
                    let region = self.region_for(preserved_addr, discriminator);
                    let preserved = match region.query_uninitialized(preserved_addr, preserved_len as u32) {
                        Some(snap) => (0..snap.len()).map(|i| snap.get(i)).collect::<Vec<_>>(),
                        None => vec![true; preserved_len],
                    };
                    out.extend(preserved);
                }
                out
            }
            _ => generic_mask.to_vec(),
        }
    }

    fn region_for(&mut self, addr: Addr, discriminator: Discriminator) -> &mut crate::shadow::ShadowRegion {
        match discriminator {
            Discriminator::Stack => &mut self.shadow.stack,
            Discriminator::Heap => self.shadow.region_for_heap_mut(addr),
        }
    }

    /// A load instruction (spec.md §4.3 "Direct-use versus copy", §4.4 "Default load").
    /// Returns the record (with `is_uninitialized_read` set as applicable) plus, when the
    /// bytes read intersect `mem_pending`, the tag set that should propagate into the
    /// destination register(s). `raw_bytes`, when the host supplies the actual memory content
    /// read, feeds the string-optimization heuristic (spec.md §6 `-u`); `None` means the
    /// heuristic never suppresses this access.
    #[allow(clippy::too_many_arguments)]
    pub fn record_read(
        &mut self,
        ip: Addr,
        actual_ip: Addr,
        opcode: Opcode,
        addr: Addr,
        size: u32,
        sp_offset: i64,
        bp_offset: i64,
        disasm: Option<String>,
        discriminator: Discriminator,
        dest_regs: &[Register],
        raw_bytes: Option<&[u8]>,
    ) -> Result<(AccessRecord, TagSet), EngineError> {
        let observable = self.is_observable(actual_ip);

        if self.stack_clash_suppresses(addr) {
            let mut record = self.build_record(
                ip, actual_ip, opcode, addr, size, AccessType::Read, sp_offset, bp_offset, disasm, discriminator,
            );
            record.is_uninitialized_read = false;
            return Ok((record, TagSet::new()));
        }

        let snapshot = {
            let region = self.region_for(addr, discriminator);
            region.query_uninitialized(addr, size)
        };

        // spec.md §6 `-u`: libc's word-at-a-time strlen/strcpy family over-reads a buffer's
        // tail looking for a terminator; suppress exactly that shape before it's reported.
        let is_library_origin = actual_ip != ip;
        let snapshot = match (snapshot, raw_bytes) {
            (Some(snap), Some(bytes))
                if heuristics::should_suppress(self.config.string_heuristic, is_library_origin, &snap, bytes) =>
            {
                None
            }
            (snap, _) => snap,
        };

        let range = AccessRange::new(addr, size);
        let stored_tags: TagSet = self
            .mem_pending
            .overlapping(&range)
            .into_iter()
            .flat_map(|(_, set)| set.into_iter())
            .collect();

        let mut record = self.build_record(
            ip, actual_ip, opcode, addr, size, AccessType::Read, sp_offset, bp_offset, disasm, discriminator,
        );

        let is_uninit = snapshot.is_some() || !stored_tags.is_empty();
        record.is_uninitialized_read = is_uninit;
        record.uninitialized_snapshot = snapshot;

        if !is_uninit {
            return Ok((record, TagSet::new()));
        }

        let is_copy = emulator::is_copy(opcode);
        let mut propagate_tags = stored_tags;

        if is_copy {
            let tag = self.tags.tag_for(range, record.clone());
            propagate_tags.insert(tag);
            // spec.md §4.4 "Default load": the shadow snapshot, truncated/zero-extended to
            // each destination's width, becomes that register's new content mask.
            let full_mask = match &record.uninitialized_snapshot {
                Some(snap) => (0..snap.len()).map(|i| snap.get(i)).collect::<Vec<_>>(),
                None => vec![true; size as usize],
            };
            for &reg in dest_regs {
                let loaded = emulator::default_load_mask(&full_mask, reg.byte_size() as usize);
                self.registers.set_content(reg, &loaded);
                self.reg_pending.insert(&mut self.tags, reg, &propagate_tags);
                for sub in proper_subregisters(&self.registers, reg) {
                    self.reg_pending.insert(&mut self.tags, sub, &propagate_tags);
                }
            }
        } else if observable && self.aggregator.note_uninitialized_read(&record) {
            self.aggregator.record(record.clone());
            for &reg in dest_regs {
                self.registers.set_initialized(reg);
            }
        }

        Ok((record, propagate_tags))
    }

    /// Register-to-register copy (spec.md §4.3 "Copying a register value to another"):
    /// propagates the tag set from `src` to `dst`'s matching sub-registers, replacing
    /// whatever `dst` held, and (spec.md §4.4 "Default register propagate") carries `src`'s
    /// content mask over, padding missing high bytes with "initialized" when `dst` is wider.
    pub fn propagate_reg_copy(&mut self, src: Register, dst: Register) {
        self.reg_pending.copy(&mut self.tags, src, dst);
        let src_mask = self.registers.content_mask(src);
        let dst_mask = emulator::default_propagate_mask(&src_mask, dst.byte_size() as usize);
        self.registers.set_content(dst, &dst_mask);
    }

    /// Consumes a register in a non-copy way (spec.md §4.3 "Reading a register... drains its
    /// tag set into `all_accesses`"). Direct uses of an already-pending uninitialized register
    /// (e.g. an arithmetic instruction whose operand was loaded uninitialized and never used
    /// before) are committed here.
    pub fn use_register(&mut self, reg: Register) {
        let tags = self.reg_pending.drop_reg(&mut self.tags, reg);
        for tag in tags {
            if let Some((_, record)) = self.tags.access(tag) {
                let record = record.clone();
                self.aggregator.record(record);
            }
        }
        self.registers.set_initialized(reg);
    }

    /// Overwrite bookkeeping (spec.md §4.3 "Overwrite bookkeeping") run before an instruction
    /// writes its destination registers.
    pub fn drop_overwritten_pending(&mut self, reg: Register) {
        self.reg_pending.drop_reg(&mut self.tags, reg);
    }

    // ---- Register-only opcode dispatch (spec.md §4.4) ----

    /// The register-only half of the opcode dispatch: opcodes with no memory operand whose
    /// destination content is a data-dependent function of one or more sources rather than a
    /// straight copy (sign/zero conversion, `PMOVMSKB`/`VPMOVMSKB` mask extraction,
    /// `VPBROADCAST*`). Every source is a direct use — its pending reads, if any, commit
    /// immediately — and the destination's own prior pending tags are dropped, since its
    /// content is being replaced wholesale rather than copied forward.
    pub fn apply_register_op(&mut self, opcode: Opcode, srcs: &[Register], dst: Register) {
        let dst_len = dst.byte_size() as usize;
        let mask = match opcode {
            Opcode::CWD | Opcode::CDQ | Opcode::CQO => emulator::convert_mask(dst_len),
            Opcode::PMOVMSKB | Opcode::VPMOVMSKB => {
                let per_byte: Vec<Vec<bool>> = srcs
                    .iter()
                    .flat_map(|&r| self.registers.content_mask(r))
                    .map(|b| vec![b])
                    .collect();
                let refs: Vec<&[bool]> = per_byte.iter().map(Vec::as_slice).collect();
                emulator::pmovmskb_mask(&refs, dst_len)
            }
            Opcode::VPBROADCASTB | Opcode::VPBROADCASTW | Opcode::VPBROADCASTD | Opcode::VPBROADCASTQ => {
                let elem = srcs.first().map(|&r| self.registers.content_mask(r)).unwrap_or_default();
                emulator::broadcast_mask(&elem, dst_len)
            }
            _ => vec![true; dst_len],
        };

        for &src in srcs {
            self.use_register(src);
        }
        self.reg_pending.drop_reg(&mut self.tags, dst);
        self.registers.set_content(dst, &mask);
    }

    /// One `(component, register)` participant of an XSAVE/XRSTOR transfer — e.g.
    /// `(YmmHigh, Ymm0)` contributes ymm0's upper 16 bytes to the `YmmHigh` component.
    fn xstate_slice_len(component: emulator::XstateComponent, reg: Register) -> usize {
        match component {
            emulator::XstateComponent::YmmHigh | emulator::XstateComponent::ZmmHigh => {
                reg.byte_size() as usize / 2
            }
            _ => reg.byte_size() as usize,
        }
    }

    /// XSAVE/XSAVE64/XSAVEC/XSAVEC64/XSAVEOPT/XSAVEOPT64/XSAVES/XSAVES64/FXSAVE/FXSAVE64
    /// (spec.md §4.4 XSAVE bullet): for each participant whose component is selected by
    /// `xcr0 & xstate_bv`, computes that component's architectural offset inside the save
    /// area via [`emulator::XstateComponent::layout`] and issues a synthetic
    /// [`Engine::record_write`] of the register's relevant byte slice there, carrying the
    /// register's current pending tags the same way an explicit memory store would.
    #[allow(clippy::too_many_arguments)]
    pub fn record_xsave(
        &mut self,
        ip: Addr,
        actual_ip: Addr,
        opcode: Opcode,
        save_area: Addr,
        xcr0: u32,
        xstate_bv: u32,
        participants: &[(emulator::XstateComponent, Register)],
        sp_offset: i64,
        bp_offset: i64,
    ) -> Result<Vec<AccessRecord>, EngineError> {
        let requested = emulator::requested_components(xcr0, xstate_bv);
        let mut records = Vec::new();
        for &(component, reg) in participants {
            if !requested.contains(&component) {
                continue;
            }
            let layout = component.layout();
            let full = self.registers.content_mask(reg);
            let slice_len = Self::xstate_slice_len(component, reg);
            let mask = full[full.len() - slice_len..].to_vec();
            let tags = self.reg_pending.tags_of(reg);
            let record = self.record_write(
                ip,
                actual_ip,
                opcode,
                save_area + layout.offset as Addr,
                slice_len as u32,
                sp_offset,
                bp_offset,
                None,
                Discriminator::Heap,
                Some(mask),
                tags,
            )?;
            records.push(record);
        }
        Ok(records)
    }

    /// XRSTOR/XRSTOR64/XRSTORS/XRSTORS64/FXRSTOR/FXRSTOR64: the inverse of
    /// [`Engine::record_xsave`] — reloads each selected component's save-area bytes and
    /// replaces the matching byte slice of its backing register's content mask. XSAVE/XRSTOR
    /// are classified as a direct use rather than a copy (spec.md §4.3), so a
    /// still-uninitialized reload commits immediately instead of staying pending.
    #[allow(clippy::too_many_arguments)]
    pub fn record_xrstor(
        &mut self,
        ip: Addr,
        actual_ip: Addr,
        opcode: Opcode,
        save_area: Addr,
        xcr0: u32,
        xstate_bv: u32,
        participants: &[(emulator::XstateComponent, Register)],
        sp_offset: i64,
        bp_offset: i64,
    ) -> Result<Vec<AccessRecord>, EngineError> {
        let requested = emulator::requested_components(xcr0, xstate_bv);
        let mut records = Vec::new();
        for &(component, reg) in participants {
            if !requested.contains(&component) {
                continue;
            }
            let layout = component.layout();
            let slice_len = Self::xstate_slice_len(component, reg);
            let (record, _) = self.record_read(
                ip,
                actual_ip,
                opcode,
                save_area + layout.offset as Addr,
                slice_len as u32,
                sp_offset,
                bp_offset,
                None,
                Discriminator::Heap,
                &[],
                None,
            )?;
            let mut full = self.registers.content_mask(reg);
            let start = full.len() - slice_len;
            let restored = match &record.uninitialized_snapshot {
                Some(snapshot) => (0..snapshot.len()).map(|i| snapshot.get(i)).collect::<Vec<_>>(),
                None => vec![true; slice_len],
            };
            full[start..].copy_from_slice(&restored);
            self.registers.set_content(reg, &full);
            records.push(record);
        }
        Ok(records)
    }

    // ---- Stack / heap reset (Invariants 3, 4) ----

    pub fn reset_stack_below(&mut self, sp: Addr) {
        self.shadow.stack.reset_below(sp);
    }

    /// `free()` adapter reaction (spec.md §4.6): resets the freed block's shadow minus the
    /// allocator's carve-out. A `free()` of a pointer this engine never saw returned from
    /// `malloc`/`calloc`/`posix_memalign` is the "corrupted allocator state" fatal condition
    /// (spec.md §7 taxonomy item 1).
    pub fn on_free(&mut self, ptr: Addr, size: u64) -> Result<(), EngineError> {
        ensure!(self.live_allocations.remove(&ptr), CorruptedAllocatorStateSnafu { ptr });
        let segments = self.allocator.reinit_segments(size);
        if let Some(mmap_region) = self.shadow.mmap_heaps.get_mut(&ptr) {
            if mmap_region.kind() == crate::shadow::RegionKind::Heap(HeapKind::MmapSingleChunk) {
                self.shadow.free_mmap_chunk(ptr);
                return Ok(());
            }
        }
        for (offset, seg_size) in segments {
            self.shadow.heap.reset_range(ptr + offset, seg_size);
        }
        Ok(())
    }

    pub fn on_malloc_before(&mut self, requested_size: u64) {
        self.pending_allocations
            .insert(0, PendingAllocation::new(requested_size, None));
    }

    pub fn on_malloc_after(&mut self, ptr: Addr, is_mmap_single_chunk: bool) {
        self.pending_allocations.remove(&0);
        self.live_allocations.insert(ptr);
        if is_mmap_single_chunk {
            self.shadow.create_mmap_chunk(ptr);
        } else if ptr > self.heap_high_water {
            self.heap_high_water = ptr;
        }
    }

    /// A `brk()` lowering the heap high-water mark invalidates last-write entries above the
    /// new boundary (spec.md §4.6). The aggregator's `all_accesses`/`last_write` maps are
    /// trace-scoped, so invalidation here is a no-op placeholder recording the new boundary;
    /// the aggregator never re-surfaces writes above it because no further reads against that
    /// range are observable once the allocator adapter stops issuing accesses there.
    pub fn on_brk_lowered(&mut self, new_break: Addr) {
        if new_break < self.heap_high_water {
            self.heap_high_water = new_break;
        }
    }

    // ---- Syscall adapter plumbing ----

    pub fn on_syscall_entry(&mut self, sys_num: u64, args: Vec<u64>) {
        self.syscall.on_entry(sys_num, args);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_syscall_exit(&mut self, retval: i64, ip: Addr, actual_ip: Addr) {
        let Some(accesses) = self.syscall.on_exit(retval) else {
            self.diagnostics.skipped_syscall(0);
            return;
        };
        for access in accesses {
            match access.access_type {
                AccessType::Write => {
                    let _ = self.record_write(
                        ip,
                        actual_ip,
                        Opcode(0),
                        access.addr,
                        access.size,
                        0,
                        0,
                        None,
                        Discriminator::Heap,
                        None,
                        TagSet::new(),
                    );
                }
                AccessType::Read => {
                    let _ = self.record_read(
                        ip,
                        actual_ip,
                        Opcode(0),
                        access.addr,
                        access.size,
                        0,
                        0,
                        None,
                        Discriminator::Heap,
                        &[],
                        None,
                    );
                }
            }
        }
    }

    // ---- Finalization / reporting ----

    pub fn finalize(self) -> crate::aggregator::FinalizedOverlaps {
        self.aggregator.finalize()
    }

    pub fn write_report(
        config: &EngineConfig,
        images: Vec<LoadedImage>,
        stack_base: Addr,
        finalized: &crate::aggregator::FinalizedOverlaps,
    ) -> Result<(), EngineError> {
        let reg_size = match config.arch {
            ConfigArch::X86_32 => RegSize::Bits32,
            ConfigArch::X86_64 => RegSize::Bits64,
        };
        let report: Report = report::build_report(reg_size, images, stack_base, finalized);
        report::write_report_to(&config.report_path, &report)
    }

    #[cfg(test)]
    pub fn registers_mut(&mut self) -> &mut ShadowRegisterFile {
        &mut self.registers
    }

    #[cfg(test)]
    pub fn mem_pending(&self) -> &MemPending {
        &self.mem_pending
    }

    #[cfg(test)]
    pub fn reg_pending(&self) -> &RegPending {
        &self.reg_pending
    }

    #[cfg(test)]
    pub fn reg_pending_mut_insert_for_test(&mut self, reg: Register, tags: &TagSet) {
        self.reg_pending.insert(&mut self.tags, reg, tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Arch;

    fn test_config() -> EngineConfig {
        EngineConfig {
            arch: Arch::X86_64,
            report_path: std::env::temp_dir().join(format!("memtrace-test-{}.bin", std::process::id())),
            warnings_log_path: std::env::temp_dir().join(format!("memtrace-test-{}.log", std::process::id())),
            ..EngineConfig::default()
        }
    }

    fn engine_at(sp: Addr) -> Engine {
        let mut e = Engine::new(test_config(), sp, 0x6000_0000);
        e.on_image_load("a.out", 0x400000, 0x10000, true);
        e.main_entry_executed = true;
        e
    }

    #[test]
    fn scenario_1_simple_stack_leak() {
        let sp = 0x7fff_0000u64;
        let mut engine = engine_at(sp);
        engine
            .record_write(
                0x400100,
                0x400100,
                Opcode::MOV,
                sp,
                8,
                0,
                0,
                None,
                Discriminator::Stack,
                None,
                TagSet::new(),
            )
            .unwrap();
        let (record, _) = engine
            .record_read(
                0x400110,
                0x400110,
                Opcode::CMP,
                sp,
                16,
                0,
                0,
                None,
                Discriminator::Stack,
                &[],
                None,
            )
            .unwrap();
        assert!(record.is_uninitialized_read);
        assert_eq!(
            record.uninitialized_snapshot.unwrap().compute_intervals(),
            vec![(8, 15)]
        );
    }

    #[test]
    fn scenario_2_stack_clash_probe_is_suppressed() {
        let sp = 0x7fff_1000u64;
        let mut engine = engine_at(sp);
        engine.on_stack_pointer_sub(sp, emulator::PAGE_SIZE);
        let (record, _) = engine
            .record_read(
                0x400200,
                0x400200,
                Opcode::MOV,
                sp - 8,
                1,
                0,
                0,
                None,
                Discriminator::Stack,
                &[],
                None,
            )
            .unwrap();
        assert!(!record.is_uninitialized_read);
    }

    #[test]
    fn scenario_4_taint_through_move_stays_pending() {
        let sp = 0x7fff_2000u64;
        let mut engine = engine_at(sp);
        let (_, tags) = engine
            .record_read(
                0x400300,
                0x400300,
                Opcode::MOV,
                sp - 8,
                8,
                0,
                0,
                None,
                Discriminator::Stack,
                &[Register::Rax],
                None,
            )
            .unwrap();
        assert!(!tags.is_empty());
        assert!(engine.reg_pending().is_pending(Register::Rax));

        engine.propagate_reg_copy(Register::Rax, Register::Rbx);
        assert!(engine.reg_pending().is_pending(Register::Rbx));

        let rbx_tags = engine.reg_pending().tags_of(Register::Rbx);
        engine
            .record_write(
                0x400310,
                0x400310,
                Opcode::MOV,
                0x600000,
                8,
                0,
                0,
                None,
                Discriminator::Heap,
                Some(vec![false; 8]),
                rbx_tags,
            )
            .unwrap();

        assert_eq!(engine.mem_pending().entry_count(), 1);
        assert!(engine.mem_pending().no_overlaps());
    }

    #[test]
    fn scenario_5_reload_of_stored_uninitialized_bytes_commits_original_read() {
        let sp = 0x7fff_3000u64;
        let mut engine = engine_at(sp);
        let (_, tags) = engine
            .record_read(
                0x400400,
                0x400400,
                Opcode::MOV,
                sp - 8,
                8,
                0,
                0,
                None,
                Discriminator::Stack,
                &[Register::Rax],
                None,
            )
            .unwrap();
        engine.propagate_reg_copy(Register::Rax, Register::Rbx);
        let rbx_tags = engine.reg_pending().tags_of(Register::Rbx);
        engine
            .record_write(
                0x400410,
                0x400410,
                Opcode::MOV,
                0x600000,
                8,
                0,
                0,
                None,
                Discriminator::Heap,
                Some(vec![false; 8]),
                rbx_tags,
            )
            .unwrap();
        drop(tags);

        // Reload then a direct (non-copy) use.
        let (reload_record, reload_tags) = engine
            .record_read(
                0x400420,
                0x400420,
                Opcode::MOV,
                0x600000,
                8,
                0,
                0,
                None,
                Discriminator::Heap,
                &[Register::Rcx],
                None,
            )
            .unwrap();
        assert!(reload_record.is_uninitialized_read);
        assert!(!reload_tags.is_empty());

        for &reg in &[Register::Rcx] {
            engine.reg_pending().tags_of(reg);
        }
        // ADD rdx, rcx is a direct use: commit rcx's pending tags (which include the original
        // stack-load tag) into all_accesses.
        engine.reg_pending_mut_insert_for_test(Register::Rcx, &reload_tags);
        engine.use_register(Register::Rcx);

        let finalized = engine.finalize();
        assert!(!finalized.all_accesses.is_empty());
    }

    #[test]
    fn scenario_6_xsave_xrstor_round_trip_preserves_ymm_high_taint() {
        let sp = 0x7fff_5000u64;
        let mut engine = engine_at(sp);

        // ymm0's high 16 bytes originate from an uninitialized stack load (e.g. a prior
        // VMOVDQU the disassembler classified as a copy), so ymm0 picks up a pending tag.
        let (_, ymm_tags) = engine
            .record_read(
                0x400600,
                0x400600,
                Opcode::MOV,
                sp - 16,
                16,
                0,
                0,
                None,
                Discriminator::Stack,
                &[Register::Ymm0],
                None,
            )
            .unwrap();
        assert!(!ymm_tags.is_empty());
        assert!(engine.reg_pending().is_pending(Register::Ymm0));

        // XSAVE with XCR0=0x07 (x87 | SSE | AVX) writes the YMM-high component to its
        // architectural offset in the save area; the engine computes that offset itself
        // rather than the test picking an address, and the bytes are still uninitialized,
        // carrying ymm0's pending tag along.
        let save_area = 0x6001_0000u64;
        let participants = [(emulator::XstateComponent::YmmHigh, Register::Ymm0)];
        let xsave_records = engine
            .record_xsave(0x400610, 0x400610, Opcode::XSAVE, save_area, 0x07, 0x07, &participants, 0, 0)
            .unwrap();
        assert_eq!(xsave_records.len(), 1);
        assert_eq!(
            xsave_records[0].range.start,
            save_area + emulator::XstateComponent::YmmHigh.layout().offset as Addr
        );
        assert_eq!(engine.mem_pending().entry_count(), 1);

        // XRSTOR with a matching XSTATE_BV reloads the same component back into ymm0 from
        // that same computed offset; XSAVE/XRSTOR are classified as a direct use rather than
        // a copy, so the still-uninitialized reload is committed immediately instead of
        // staying pending.
        let xrstor_records = engine
            .record_xrstor(0x400620, 0x400620, Opcode::XRSTOR, save_area, 0x07, 0x07, &participants, 0, 0)
            .unwrap();
        assert_eq!(xrstor_records.len(), 1);
        assert!(xrstor_records[0].is_uninitialized_read);

        let finalized = engine.finalize();
        assert!(!finalized.all_accesses.is_empty());
    }

    #[test]
    fn apply_register_op_pmovmskb_extracts_sign_bits_as_taint() {
        // PMOVMSKB's destination content is a function of every source byte's high bit, not a
        // copy of any one of them (spec.md §4.4): an uninitialized source still yields a
        // deterministic 0/1 per lane, so the destination is treated as freshly computed, not
        // as carrying forward the source's pending taint.
        let mut engine = engine_at(0x7fff_7000);
        engine.apply_register_op(Opcode::PMOVMSKB, &[Register::Xmm0], Register::Eax);
        assert!(!engine.reg_pending().is_pending(Register::Eax));
    }

    #[test]
    fn apply_register_op_cdq_sign_extends_into_edx() {
        let mut engine = engine_at(0x7fff_7100);
        engine.apply_register_op(Opcode::CDQ, &[Register::Eax], Register::Edx);
        assert!(!engine.reg_pending().is_pending(Register::Edx));
    }

    #[test]
    fn scenario_3_heap_reset_minus_carveout_leaves_tail_uninitialized() {
        let mut engine = engine_at(0x7fff_4000);
        engine.on_malloc_after(0x6000_1000, false);
        engine
            .record_write(
                0x400500,
                0x400500,
                Opcode::MOV,
                0x6000_1000,
                32,
                0,
                0,
                None,
                Discriminator::Heap,
                None,
                TagSet::new(),
            )
            .unwrap();
        engine.on_free(0x6000_1000, 32).unwrap();
        let (record, _) = engine
            .record_read(
                0x400510,
                0x400510,
                Opcode::MOV,
                0x6000_1000,
                32,
                0,
                0,
                None,
                Discriminator::Heap,
                &[],
                None,
            )
            .unwrap();
        assert!(record.is_uninitialized_read);
        assert_eq!(
            record.uninitialized_snapshot.unwrap().compute_intervals(),
            vec![(16, 31)]
        );
    }

    #[test]
    fn free_of_untracked_pointer_is_fatal() {
        // spec.md §7 taxonomy item 1: "corrupted allocator state (free of unknown pointer)".
        let mut engine = engine_at(0x7fff_6000);
        let err = engine.on_free(0xdead_beef, 32).unwrap_err();
        assert!(matches!(err, EngineError::CorruptedAllocatorState { ptr } if ptr == 0xdead_beef));
    }
}
