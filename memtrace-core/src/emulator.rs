//! Instruction classification and the stateless byte-mask algorithms of the default and
//! specialized opcode handlers (spec.md §4.4).
//!
//! Grounded in `original_source/src/InstructionHandler.{h,cpp}`, `RegInstructionEmulator.h`,
//! `MemInstructionEmulator.h` and `XsaveHandler.{h,cpp}`. The original dispatches through two
//! `map<OPCODE, ...Emulator*>` tables of polymorphic handler objects; per spec.md §9 this
//! becomes a closed enumeration (no virtual hierarchy) plus a pair of dispatch tables keyed by
//! [`Opcode`], matching the teacher's `VMEXIT_HANDLERS: RwLock<HashMap<_, _, FnvBuildHasher>>`
//! pattern (see DESIGN.md). The mask arithmetic here is pure and stateless; the engine
//! (`crate::engine`) owns shadow memory, the register file, pending tables and the tag
//! manager, and calls into these functions while holding them.

use fnv::FnvBuildHasher;
use hashbrown::{HashMap, HashSet};
use once_cell::sync::Lazy;

/// Opaque instruction identifier handed in by the (out-of-scope) disassembler. The engine
/// never decodes bytes; it only ever compares this against the closed set of opcodes it
/// recognizes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Opcode(pub u32);

macro_rules! opcode_consts {
    ($($name:ident = $val:expr),+ $(,)?) => {
        impl Opcode {
            $(pub const $name: Opcode = Opcode($val);)+
        }
    };
}

// A closed vocabulary of the opcodes this engine special-cases (spec.md §4.4, §4.6). Numeric
// values are arbitrary stable ids local to this crate, not real x86 encodings: the engine
// receives `Opcode` from its disassembler collaborator and never needs the real encoding.
opcode_consts! {
    MOV = 1, MOVZX = 2, MOVSX = 3, PUSH = 4, POP = 5, LEA = 6, XCHG = 7,
    CWD = 10, CDQ = 11, CQO = 12,
    PMOVMSKB = 20, VPMOVMSKB = 21,
    VPBROADCASTB = 30, VPBROADCASTW = 31, VPBROADCASTD = 32, VPBROADCASTQ = 33,
    MOVSS = 40, MOVSD = 41,
    FST = 50, FSTP = 51, FIST = 52, FISTP = 53, FISTTP = 54,
    XSAVE = 60, XSAVE64 = 61, XSAVEC = 62, XSAVEC64 = 63, XSAVEOPT = 64, XSAVEOPT64 = 65,
    XSAVES = 66, XSAVES64 = 67, FXSAVE = 68, FXSAVE64 = 69,
    XRSTOR = 70, XRSTOR64 = 71, XRSTORS = 72, XRSTORS64 = 73, FXRSTOR = 74, FXRSTOR64 = 75,
    CMP = 80, TEST = 81, SETCC = 82,
    SUB = 90,
}

static COPY_OPCODES: Lazy<HashSet<Opcode, FnvBuildHasher>> = Lazy::new(|| {
    let mut s = HashSet::default();
    for op in [Opcode::MOV, Opcode::MOVZX, Opcode::MOVSX, Opcode::PUSH, Opcode::POP, Opcode::XCHG] {
        s.insert(op);
    }
    s
});

static COMPARISON_OPCODES: Lazy<HashSet<Opcode, FnvBuildHasher>> = Lazy::new(|| {
    let mut s = HashSet::default();
    for op in [Opcode::CMP, Opcode::TEST, Opcode::SETCC] {
        s.insert(op);
    }
    s
});

/// spec.md §4.3 "Direct-use versus copy": plain move variants, push/pop and friends leave an
/// uninitialized load pending rather than reporting it immediately.
pub fn is_copy(op: Opcode) -> bool {
    COPY_OPCODES.contains(&op)
}

/// Operands are "used" by the instruction but not propagated into a fresh value, so register
/// reads are not treated as a new taint-producing use (spec.md §4.3).
pub fn is_comparison(op: Opcode) -> bool {
    COMPARISON_OPCODES.contains(&op)
}

/// Every opcode that is neither a copy nor a pure comparison is a direct use: its uninitialized
/// loads are committed immediately (spec.md §4.3).
pub fn is_direct_use(op: Opcode) -> bool {
    !is_copy(op) && !is_comparison(op)
}

pub fn is_stack_pointer_sub(op: Opcode) -> bool {
    op == Opcode::SUB
}

/// A byte-granular initialization mask, `true` = initialized, indexed from the low byte of the
/// access. Shared currency between shadow-memory snapshots and register content masks so the
/// default handlers below can move status between the two without caring which kind of
/// storage it came from.
pub type Mask = Vec<bool>;

/// Default load (spec.md §4.4): a memory snapshot truncated/zero-extended to a destination
/// width. Truncation takes the low `dst_len` bytes; zero-extension pads with `true`
/// (initialized) high bytes, matching "zero-extend means the new bytes are known zero".
pub fn default_load_mask(src: &[bool], dst_len: usize) -> Mask {
    if dst_len <= src.len() {
        src[..dst_len].to_vec()
    } else {
        let mut out = src.to_vec();
        out.resize(dst_len, true);
        out
    }
}

/// Default store (spec.md §4.4): packs the combined status of `srcs` (bitwise AND across
/// sources, matching "source register status" combination) and truncates/extends it to the
/// destination size. Absent source registers (immediate store) means "fully initialized",
/// handled by the caller passing `None`.
pub fn default_store_mask(srcs: &[&[bool]], dst_len: usize) -> Mask {
    if srcs.is_empty() {
        return vec![true; dst_len];
    }
    let min_len = srcs.iter().map(|s| s.len()).min().unwrap_or(0);
    let mut combined = vec![true; min_len];
    for src in srcs {
        for (i, slot) in combined.iter_mut().enumerate() {
            *slot &= src[i];
        }
    }
    default_load_mask(&combined, dst_len)
}

/// Default register-to-register propagate (spec.md §4.4): "takes the narrowest source status
/// that fits, pads the missing high bytes with initialized".
pub fn default_propagate_mask(src: &[bool], dst_len: usize) -> Mask {
    default_load_mask(src, dst_len)
}

/// CWD/CDQ/CQO (spec.md §4.4 "Sign/zero conversion"): destination becomes fully initialized
/// regardless of source status.
pub fn convert_mask(dst_len: usize) -> Mask {
    vec![true; dst_len]
}

/// PMOVMSKB/VPMOVMSKB (spec.md §4.4 "Pack-mask extraction"): one destination bit per source
/// byte, set (initialized) iff the whole source byte is initialized. Returned as a byte mask
/// sized to `dst_len` with only the low `src_bytes.len()` bits meaningful; padding bits above
/// that are "initialized" (the instruction always zero-extends).
pub fn pmovmskb_mask(src_bytes: &[&[bool]], dst_len: usize) -> Mask {
    let mut bits = vec![true; dst_len * 8];
    for (i, byte) in src_bytes.iter().enumerate() {
        bits[i] = byte.iter().all(|&b| b);
    }
    // Pack back down to a byte mask: a destination byte is initialized iff all its bits are.
    (0..dst_len)
        .map(|byte_idx| (0..8).all(|bit| bits[byte_idx * 8 + bit]))
        .collect()
}

/// VPBROADCASTB/W/D/Q (spec.md §4.4 "Broadcast"): replicate the LSB element's status through
/// the whole destination width; any uninitialized replicated byte marks every copy
/// uninitialized.
pub fn broadcast_mask(src_elem: &[bool], dst_len: usize) -> Mask {
    let elem_init = src_elem.iter().all(|&b| b);
    let mut out = Vec::with_capacity(dst_len);
    let mut remaining = dst_len;
    while remaining > 0 {
        let take = remaining.min(src_elem.len());
        out.extend(std::iter::repeat(elem_init).take(take));
        remaining -= take;
    }
    out
}

/// x87 store to smaller precision (spec.md §4.4): any uninitialized bit in the source ST
/// register marks the entire narrower destination uninitialized.
pub fn x87_store_mask(src_st: &[bool], dst_len: usize) -> Mask {
    let all_init = src_st.iter().all(|&b| b);
    vec![all_init; dst_len]
}

/// MOVSS/MOVSD (spec.md §4.4 "Move scalar"): only the low 4/8 bytes are overwritten; returns
/// `None` for bytes above `scalar_len` to signal "preserve existing destination content".
pub fn movscalar_mask(src: &[bool], scalar_len: usize) -> Mask {
    src[..scalar_len.min(src.len())].to_vec()
}

/// One XSAVE/XRSTOR state component's layout within the save area (spec.md §4.4 XSAVE bullet).
/// Grounded in `original_source/src/XsaveHandler.{h,cpp}`'s `XsaveComponent`/`getComponentInfo`:
/// components 0 (x87) and 1 (SSE) are architecturally fixed; components >= 2 are queried from
/// `CPUID.(EAX=0DH, ECX=n)` in the original. Since this engine never executes on real
/// hardware, the table below hardcodes the well-known Intel/AMD layout for components 0-4
/// (x87, SSE, AVX YMM-high, MPX, AVX-512) documented in the Intel SDM vol. 1 §13.4.1, which is
/// the same data `getComponentInfo`'s `cpuid` branch would return on a real part.
#[derive(Debug, Clone, Copy)]
pub struct XsaveComponent {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XstateComponent {
    X87,
    Sse,
    YmmHigh,
    KMask,
    ZmmHigh,
    ZmmExtra,
}

impl XstateComponent {
    pub const ALL: [XstateComponent; 6] = [
        XstateComponent::X87,
        XstateComponent::Sse,
        XstateComponent::YmmHigh,
        XstateComponent::KMask,
        XstateComponent::ZmmHigh,
        XstateComponent::ZmmExtra,
    ];

    /// Bit position of this component in the XCR0 / XSTATE_BV bitmap.
    pub fn bit(self) -> u32 {
        match self {
            XstateComponent::X87 => 0,
            XstateComponent::Sse => 1,
            XstateComponent::YmmHigh => 2,
            XstateComponent::KMask => 5,
            XstateComponent::ZmmHigh => 6,
            XstateComponent::ZmmExtra => 7,
        }
    }

    pub fn layout(self) -> XsaveComponent {
        match self {
            XstateComponent::X87 => XsaveComponent { offset: 32, size: 128 },
            XstateComponent::Sse => XsaveComponent { offset: 160, size: 256 },
            XstateComponent::YmmHigh => XsaveComponent { offset: 576, size: 256 },
            XstateComponent::KMask => XsaveComponent { offset: 1088, size: 64 },
            XstateComponent::ZmmHigh => XsaveComponent { offset: 1152, size: 512 },
            XstateComponent::ZmmExtra => XsaveComponent { offset: 1664, size: 1024 },
        }
    }
}

/// Which components an XSAVE/XRSTOR should process: `xcr0 & request_mask`, per spec.md §4.4.
pub fn requested_components(xcr0: u32, request_mask: u32) -> Vec<XstateComponent> {
    let active = xcr0 & request_mask;
    XstateComponent::ALL
        .into_iter()
        .filter(|c| (active >> c.bit()) & 1 == 1)
        .collect()
}

/// Stack-clash probe bookkeeping (spec.md §4.4 "Stack-clash detection"). One active allocation
/// is tracked at a time, mirroring the original engine's single most-recent `SUB rsp` record.
#[derive(Debug, Clone, Copy)]
pub struct StackAllocation {
    pub start: u64,
    pub size: u64,
    pub requires_probe: bool,
}

pub const PAGE_SIZE: u64 = 4096;

impl StackAllocation {
    pub fn new(current_sp: u64, size: u64) -> Self {
        StackAllocation {
            start: current_sp,
            size,
            requires_probe: size == PAGE_SIZE,
        }
    }

    /// Whether `addr` falls in the newly allocated page and the probe hasn't fired yet
    /// (spec.md: "The next read whose address falls inside `[start - size, start - 1]`").
    pub fn should_suppress(&mut self, addr: u64) -> bool {
        if !self.requires_probe {
            return false;
        }
        let lo = self.start.saturating_sub(self.size);
        let hi = self.start.wrapping_sub(1);
        if addr >= lo && addr <= hi {
            self.requires_probe = false;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EmulatorStats {
    pub mismatched_size_warnings: u32,
    pub unknown_opcode_count: u32,
}

/// Mismatched source/destination size allow-list (spec.md §4.4: "a configurable allow-list of
/// opcodes silences the warning"). Threaded through `EngineConfig`.
pub fn size_mismatch_is_silenced(op: Opcode, allow_list: &HashMap<Opcode, (), FnvBuildHasher>) -> bool {
    allow_list.contains_key(&op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_opcodes_are_classified() {
        assert!(is_copy(Opcode::MOV));
        assert!(is_copy(Opcode::PUSH));
        assert!(!is_copy(Opcode::CMP));
    }

    #[test]
    fn comparison_opcodes_are_not_direct_use() {
        assert!(is_comparison(Opcode::CMP));
        assert!(!is_direct_use(Opcode::CMP));
        assert!(is_direct_use(Opcode::XSAVE));
    }

    #[test]
    fn default_load_truncates_and_zero_extends() {
        let src = vec![true, false, true, true];
        assert_eq!(default_load_mask(&src, 2), vec![true, false]);
        let extended = default_load_mask(&src, 6);
        assert_eq!(extended, vec![true, false, true, true, true, true]);
    }

    #[test]
    fn broadcast_replicates_and_taints_all_on_any_uninit() {
        let elem = vec![true, false];
        let out = broadcast_mask(&elem, 8);
        assert!(out.iter().all(|&b| !b));
        let elem_init = vec![true, true];
        let out2 = broadcast_mask(&elem_init, 8);
        assert!(out2.iter().all(|&b| b));
    }

    #[test]
    fn pmovmskb_sets_bit_iff_whole_byte_initialized() {
        let b0 = vec![true; 8];
        let b1 = vec![true, false, true, true, true, true, true, true];
        let mask = pmovmskb_mask(&[&b0, &b1], 1);
        // byte 0 covers bits for 8 source bytes but we only fed 2; packing collapses to one
        // destination byte where bit0 (b0) is init and bit1 (b1) is not -> not all bits init.
        assert_eq!(mask, vec![false]);
    }

    #[test]
    fn stack_clash_probe_suppresses_then_resets() {
        let mut alloc = StackAllocation::new(0x7fff_1000, PAGE_SIZE);
        assert!(alloc.should_suppress(0x7fff_1000 - 8));
        assert!(!alloc.should_suppress(0x7fff_1000 - 8));
    }

    #[test]
    fn requested_components_mask_by_xcr0() {
        let comps = requested_components(0x07, 0xff);
        assert!(comps.contains(&XstateComponent::X87));
        assert!(comps.contains(&XstateComponent::Sse));
        assert!(comps.contains(&XstateComponent::YmmHigh));
        assert!(!comps.contains(&XstateComponent::KMask));
    }
}
