use super::Register;
use hashbrown::HashMap;

/// Byte-granular shadow register file (spec.md §4.2).
///
/// Storage is allocated once per *root* register (one with no parent other than itself); every
/// sub-register view indexes into its root's byte array. This mirrors
/// `ShadowRegisterFile::initShadowRegistersPtr` in the original, which stores each
/// super-register's bytes once and has sub-registers point into it, without a separate
/// allocation per alias.
pub struct ShadowRegisterFile {
    storage: HashMap<Register, Vec<bool>>,
}

impl Default for ShadowRegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowRegisterFile {
    pub fn new() -> Self {
        let mut storage = HashMap::new();
        for &r in Register::ALL {
            if r.is_root() {
                storage.insert(r, vec![false; r.byte_size() as usize]);
            }
        }
        ShadowRegisterFile { storage }
    }

    fn byte_offset(reg: Register) -> usize {
        if reg.is_high_byte() {
            1
        } else {
            0
        }
    }

    pub fn byte_size(&self, reg: Register) -> u32 {
        reg.byte_size()
    }

    pub fn is_uninitialized(&self, reg: Register) -> bool {
        let parent = reg.parent();
        let bytes = &self.storage[&parent];
        let off = Self::byte_offset(reg);
        let len = reg.byte_size() as usize;
        bytes[off..off + len].iter().any(|&b| !b)
    }

    /// Returns a copy of the byte-granular init mask covering `reg`.
    pub fn content_mask(&self, reg: Register) -> Vec<bool> {
        let parent = reg.parent();
        let bytes = &self.storage[&parent];
        let off = Self::byte_offset(reg);
        let len = reg.byte_size() as usize;
        bytes[off..off + len].to_vec()
    }

    /// Marks `reg` fully initialized. If `reg` is an overwriting sub-register (the natural
    /// 32-bit view on a 64-bit machine), the parent's upper bytes are also flipped to
    /// initialized (P6).
    pub fn set_initialized(&mut self, reg: Register) {
        self.set_content(reg, &vec![true; reg.byte_size() as usize]);
    }

    /// Replaces `reg`'s byte-granular init mask with `mask` (must be `reg.byte_size()` long).
    /// This is a full replace, matching the C++ `setAsInitialized(REG, uint8_t*)` overload: a
    /// byte written with uninitialized content becomes uninitialized, even if it previously
    /// held initialized data.
    pub fn set_content(&mut self, reg: Register, mask: &[bool]) {
        assert_eq!(mask.len(), reg.byte_size() as usize);
        let parent = reg.parent();
        let off = Self::byte_offset(reg);
        {
            let bytes = self.storage.get_mut(&parent).expect("root register storage");
            bytes[off..off + mask.len()].copy_from_slice(mask);
        }
        if reg.is_overwriting() {
            let parent_len = parent.byte_size() as usize;
            let bytes = self.storage.get_mut(&parent).expect("root register storage");
            for b in &mut bytes[mask.len()..parent_len] {
                *b = true;
            }
        }
    }

    /// All registers sharing storage with `reg` (its parent and every sibling sub-register),
    /// including `reg` itself.
    pub fn aliases(&self, reg: Register) -> Vec<Register> {
        let parent = reg.parent();
        Register::ALL
            .iter()
            .copied()
            .filter(|&r| r.parent() == parent)
            .collect()
    }

    /// Filters `candidates` down to those that alias `reg` (share its parent).
    pub fn corresponding_registers_of(&self, reg: Register, candidates: &[Register]) -> Vec<Register> {
        let parent = reg.parent();
        candidates
            .iter()
            .copied()
            .filter(|&c| c.parent() == parent)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_file_is_fully_uninitialized() {
        let file = ShadowRegisterFile::new();
        assert!(file.is_uninitialized(Register::Rax));
        assert!(file.is_uninitialized(Register::Eax));
    }

    #[test]
    fn eax_write_initializes_and_extends_parent() {
        // P6.
        let mut file = ShadowRegisterFile::new();
        file.set_initialized(Register::Eax);
        assert!(!file.is_uninitialized(Register::Eax));
        assert!(!file.is_uninitialized(Register::Rax));
    }

    #[test]
    fn al_write_does_not_touch_ah_or_parent_high_bytes() {
        let mut file = ShadowRegisterFile::new();
        file.set_initialized(Register::Al);
        assert!(!file.is_uninitialized(Register::Al));
        assert!(file.is_uninitialized(Register::Ah));
        assert!(file.is_uninitialized(Register::Rax));
    }

    #[test]
    fn high_byte_sits_at_offset_one() {
        let mut file = ShadowRegisterFile::new();
        file.set_initialized(Register::Ah);
        let mask = file.content_mask(Register::Ax);
        assert_eq!(mask, vec![false, true]);
    }

    #[test]
    fn writing_uninitialized_content_can_clear_prior_state() {
        let mut file = ShadowRegisterFile::new();
        file.set_initialized(Register::Rax);
        assert!(!file.is_uninitialized(Register::Rax));
        file.set_content(Register::Al, &[false]);
        assert!(file.is_uninitialized(Register::Rax));
        assert!(file.is_uninitialized(Register::Al));
    }

    #[test]
    fn aliases_include_all_sibling_views() {
        let file = ShadowRegisterFile::new();
        let aliases = file.aliases(Register::Al);
        assert!(aliases.contains(&Register::Rax));
        assert!(aliases.contains(&Register::Eax));
        assert!(aliases.contains(&Register::Ah));
    }
}
