use bitflags::bitflags;

bitflags! {
    /// Per-category translator disable flags.
    ///
    /// Every translator checks its category first and unconditionally
    /// defers to the interpreter fallback when disabled — the single
    /// source of truth for "is this opcode safe to JIT right now",
    /// toggleable for bisection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JitDisable: u32 {
        const ALU = 1 << 0;
        const SHIFT = 1 << 1;
        const MULDIV = 1 << 2;
        const BRANCH = 1 << 3;
        const LSU = 1 << 4;
        const LSU_UNALIGNED = 1 << 5;
        const FPU = 1 << 6;
        const VPU = 1 << 7;
        const BLOCKLINK = 1 << 8;
        const REGALLOC_GPR = 1 << 9;
        const REGALLOC_FPR = 1 << 10;
    }
}

/// Compile-time options for the translator.
#[derive(Debug, Clone)]
pub struct JitOptions {
    /// Patch block exits to jump directly to known successor blocks.
    pub enable_blocklink: bool,
    /// Mask addresses into the RAM window at run time instead of
    /// range-checking them. Only safe when the guest is trusted to stay
    /// inside RAM.
    pub fast_memory: bool,
    /// Resolve branches with all-immediate operands at translation time.
    pub imm_branches: bool,
    /// Continue compiling past a predicted branch inside the same block.
    pub continue_branches: bool,
    /// Instruction budget for a block that keeps continuing.
    pub continue_max_instructions: u32,
    /// Disabled translator categories.
    pub disabled: JitDisable,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            enable_blocklink: true,
            fast_memory: false,
            imm_branches: true,
            continue_branches: false,
            continue_max_instructions: 300,
            disabled: JitDisable::empty(),
        }
    }
}

impl JitOptions {
    pub fn disabled(&self, cat: JitDisable) -> bool {
        self.disabled.contains(cat)
    }
}
