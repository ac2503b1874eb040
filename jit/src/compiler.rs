//! Block translator driver.
//!
//! `Jit::run` drives the dispatch/translate cycle: enter the generated
//! dispatcher, translate a block on a miss, jump straight to the fresh
//! block's unchecked entry, repeat until the CPU stops. `do_jit` is the
//! per-block translation loop; the per-category handlers live in the
//! `comp_*` modules as further `impl Jit` blocks.

use bitflags::bitflags;
use vex_backend::x86_64::emitter::{
    emit_align, emit_arith_mi, emit_arith_ri, emit_call_abs, emit_cmp_mi, emit_jcc_fwd,
    emit_jmp, emit_load, emit_mov_ri, emit_mov_rr, emit_pop, emit_push, emit_store,
    emit_store_imm, set_jump_target, ArithOp, Cond,
};
use vex_backend::x86_64::{Reg, CTX, MEMBASE};
use vex_backend::CodeArena;
use vex_core::decode::{decode, Instr};
use vex_core::mem;
use vex_core::state::{CpuState, ExecState};

use crate::analyst::{Analysis, LOOKAHEAD_OPS};
use crate::blocks::{BlockCache, BlockExit, EXIT_SIZE, MAX_BLOCKS, MAX_BLOCK_EXITS, MAX_BLOCK_INSTRUCTIONS};
use crate::dispatch::{generate_fixed_code, EnterFn, FixedCode, EXIT_COMPILE};
use crate::fpr::{FprCache, FprState};
use crate::gpr::{GprCache, GprState, MapFlags};
use crate::offsets;
use crate::options::{JitDisable, JitOptions};

/// External functions reachable from generated code. Threaded through
/// explicitly — there is no process-wide "current CPU" anywhere.
#[derive(Clone, Copy)]
pub struct JitCallbacks {
    pub read8: extern "C" fn(*mut CpuState, u32) -> u32,
    pub read16: extern "C" fn(*mut CpuState, u32) -> u32,
    pub read32: extern "C" fn(*mut CpuState, u32) -> u32,
    pub write8: extern "C" fn(*mut CpuState, u32, u32),
    pub write16: extern "C" fn(*mut CpuState, u32, u32),
    pub write32: extern "C" fn(*mut CpuState, u32, u32),
    pub interp_op: extern "C" fn(*mut CpuState, u32),
    pub interp_branch_pair: extern "C" fn(*mut CpuState),
    pub invalid_jump: extern "C" fn(*mut CpuState, u32),
}

extern "C" fn default_invalid_jump(cpu: *mut CpuState, target: u32) {
    let cpu = unsafe { &mut *cpu };
    tracing::error!(
        target = format_args!("{target:08x}"),
        pc = format_args!("{:08x}", cpu.pc),
        "jump to invalid guest address"
    );
    cpu.last_fault_addr = target;
    cpu.set_exec_state(ExecState::Exception);
}

impl Default for JitCallbacks {
    fn default() -> Self {
        Self {
            read8: mem::mem_read8,
            read16: mem::mem_read16,
            read32: mem::mem_read32,
            write8: mem::mem_write8,
            write16: mem::mem_write16,
            write32: mem::mem_write32,
            interp_op: vex_core::interp::interp_op,
            interp_branch_pair: vex_core::interp::interp_branch_pair,
            invalid_jump: default_invalid_jump,
        }
    }
}

bitflags! {
    /// How to compile a branch's delay slot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DelayFlags: u8 {
        /// The slot cannot interfere with the branch decision.
        const NICE = 1;
        /// Host flags must survive the slot (a compare was already
        /// emitted).
        const SAFE = 2;
        /// Flush all caches after the slot.
        const FLUSH = 4;
    }
}

/// Per-block translation state.
pub(crate) struct JitState {
    pub block_start: u32,
    pub compiler_pc: u32,
    pub compiling: bool,
    pub in_delay_slot: bool,
    pub downcount_amount: i32,
    pub next_exit: usize,
    /// Emit an exec-state check after the current instruction (set by
    /// anything that calls out and may stop the CPU).
    pub after_op_state_check: bool,
    pub num_instructions: u32,
    pub cur_block: u32,
    pub last_continued_pc: u32,
    pub initial_block_size: u32,
}

impl JitState {
    fn new(start: u32, block: u32) -> Self {
        Self {
            block_start: start,
            compiler_pc: start,
            compiling: true,
            in_delay_slot: false,
            downcount_amount: 0,
            next_exit: 0,
            after_op_state_check: false,
            num_instructions: 0,
            cur_block: block,
            last_continued_pc: 0,
            initial_block_size: 0,
        }
    }
}

/// Register-allocator bookkeeping snapshot (both allocators).
#[derive(Clone)]
pub struct CacheState {
    pub(crate) gpr: GprState,
    pub(crate) fpr: FprState,
}

pub struct Jit {
    pub(crate) buf: CodeArena,
    pub(crate) blocks: BlockCache,
    pub(crate) gpr: GprCache,
    pub(crate) fpr: FprCache,
    pub(crate) an: Analysis,
    pub(crate) js: JitState,
    pub(crate) jo: JitOptions,
    pub(crate) cb: JitCallbacks,
    pub(crate) fixed: FixedCode,
}

impl Jit {
    /// Build a translator for `cpu`. The CPU's memory arena and hook
    /// functions must already be attached; the fixed dispatcher code
    /// bakes them in.
    pub fn new(jo: JitOptions, cb: JitCallbacks, cpu: &CpuState) -> Self {
        assert!(!cpu.mem_base.is_null(), "attach guest memory before building the JIT");
        let mut buf = CodeArena::with_default_size().expect("code arena allocation failed");
        let fixed = generate_fixed_code(&mut buf, cpu);
        buf.set_executable().expect("code arena protection failed");
        Self {
            buf,
            blocks: BlockCache::new(),
            gpr: GprCache::new(),
            fpr: FprCache::new(),
            an: Analysis::empty(0),
            js: JitState::new(0, 0),
            jo,
            cb,
            fixed,
        }
    }

    pub fn with_default_callbacks(jo: JitOptions, cpu: &CpuState) -> Self {
        Self::new(jo, JitCallbacks::default(), cpu)
    }

    pub fn options(&self) -> &JitOptions {
        &self.jo
    }

    /// Run until the guest stops (halt, exception, or timing hook ends
    /// the session).
    pub fn run(&mut self, cpu: &mut CpuState) {
        let enter: EnterFn =
            unsafe { std::mem::transmute(self.buf.ptr_at(self.fixed.enter)) };
        let mut target = self.buf.ptr_at(self.fixed.dispatcher);
        loop {
            let code = unsafe { enter(cpu, target) };
            if code != EXIT_COMPILE {
                break;
            }
            let pc = cpu.pc;
            match self.compile_block(cpu, pc) {
                // Block miss: translate, then jump straight to the new
                // block's unchecked entry.
                Some(entry) => target = self.buf.ptr_at(entry),
                None => break,
            }
            if cpu.exec_state() != ExecState::Running {
                break;
            }
        }
    }

    /// Translate the block at `addr`; returns the unchecked entry offset.
    pub fn compile_block(&mut self, cpu: &mut CpuState, addr: u32) -> Option<usize> {
        if self.buf.remaining() < 0x10000 || self.blocks.is_full() {
            tracing::debug!(
                blocks = self.blocks.num_blocks(),
                max = MAX_BLOCKS,
                "translation cache full, clearing"
            );
            self.clear_cache(cpu);
        }
        if !cpu.addr_valid(addr) || addr & 3 != 0 {
            (self.cb.invalid_jump)(cpu, addr);
            return None;
        }

        self.buf.set_writable().expect("code arena protection failed");
        let num = self.blocks.allocate_block(addr);
        self.do_jit(cpu, addr, num);
        let link = self.jo.enable_blocklink && !self.jo.disabled(JitDisable::BLOCKLINK);
        self.blocks.finalize_block(num, cpu, &mut self.buf, link);
        self.buf.set_executable().expect("code arena protection failed");

        Some(self.blocks.block(num).normal_entry as usize)
    }

    /// Drop all translated code and start over (guest self-modification,
    /// arena exhaustion, bisection).
    pub fn clear_cache(&mut self, cpu: &mut CpuState) {
        self.blocks.clear(cpu);
        self.buf.set_offset(self.fixed.end);
    }

    /// Void every block overlapping the guest address range.
    pub fn invalidate_range(&mut self, cpu: &mut CpuState, start: u32, end: u32) {
        self.buf.set_writable().expect("code arena protection failed");
        self.blocks
            .invalidate_range(start, end, cpu, &mut self.buf, self.fixed.dispatcher);
        self.buf.set_executable().expect("code arena protection failed");
    }

    /// Fold any block tag back to the original instruction.
    pub fn read_instruction(&self, cpu: &CpuState, addr: u32) -> u32 {
        let word = cpu.read32_unchecked(addr);
        self.blocks.original_opcode_at(word, addr)
    }

    // -- Whole-machine save-state coordination (§ external interfaces) --

    /// Allocator bookkeeping snapshot. Only meaningful at a block
    /// boundary, where both caches are flushed.
    pub fn snapshot(&self) -> CacheState {
        CacheState { gpr: self.gpr.state(), fpr: self.fpr.state() }
    }

    pub fn restore(&mut self, state: &CacheState) {
        self.gpr.restore_state(&state.gpr);
        self.fpr.restore_state(&state.fpr);
    }

    /// Remove live tags from guest memory before an outside reader walks
    /// it; pair with [`Self::finish_memory_snapshot`].
    pub fn prepare_memory_snapshot(&mut self, cpu: &mut CpuState) -> Vec<(u32, u32)> {
        self.blocks.save_and_clear_tags(cpu)
    }

    pub fn finish_memory_snapshot(&mut self, cpu: &mut CpuState, saved: &[(u32, u32)]) {
        self.blocks.restore_tags(cpu, saved);
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.blocks
    }

    // -- Block translation --

    fn do_jit(&mut self, cpu: &mut CpuState, addr: u32, num: u32) {
        self.js = JitState::new(addr, num);
        let scan_len = (MAX_BLOCK_INSTRUCTIONS + LOOKAHEAD_OPS) as usize;
        let blocks = &self.blocks;
        self.an = Analysis::scan(addr, scan_len, |a| {
            if cpu.addr_valid(a) {
                Some(blocks.original_opcode_at(cpu.read32_unchecked(a), a))
            } else {
                None
            }
        });

        emit_align(&mut self.buf, 4);
        self.buf.reserve(0x800);

        // Checked entry: verify the tag in guest memory still marks this
        // address as ours (the guest may overwrite its own code).
        let checked = self.buf.offset();
        let tag = (crate::blocks::EMUHACK_MARKER << 24) | checked as u32;
        emit_load(
            &mut self.buf,
            false,
            Reg::Rax,
            MEMBASE,
            (addr & (cpu.ram_size - 1)) as i32,
        );
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, tag as i32);
        let tag_ok = emit_jcc_fwd(&mut self.buf, Cond::E);
        emit_store_imm(&mut self.buf, CTX, offsets::pc(), addr);
        emit_jmp(&mut self.buf, self.fixed.dispatcher);
        set_jump_target(&mut self.buf, tag_ok);

        // Unchecked entry: downcount check only, then the body.
        let normal = self.buf.offset();
        emit_cmp_mi(&mut self.buf, CTX, offsets::downcount(), 0);
        let count_ok = emit_jcc_fwd(&mut self.buf, Cond::Ns);
        emit_store_imm(&mut self.buf, CTX, offsets::pc(), addr);
        emit_jmp(&mut self.buf, self.fixed.outer_loop);
        set_jump_target(&mut self.buf, count_ok);

        {
            let b = self.blocks.block_mut(num);
            b.checked_entry = checked as u32;
            b.normal_entry = normal as u32;
        }

        self.gpr.start();
        self.fpr.start();

        while self.js.compiling {
            self.buf.reserve(0x200);
            let word = self.read_instruction(cpu, self.js.compiler_pc);
            self.js.downcount_amount += 1;
            let instr = decode(word);
            self.compile_instr(cpu, instr, word);

            if self.js.after_op_state_check {
                self.js.after_op_state_check = false;
                self.emit_state_check_exit();
            }

            self.js.compiler_pc = self.js.compiler_pc.wrapping_add(4);
            self.js.num_instructions += 1;

            if self.jo.disabled(JitDisable::REGALLOC_GPR) {
                self.gpr.flush_all(&mut self.buf);
            }
            if self.jo.disabled(JitDisable::REGALLOC_FPR) {
                self.fpr.flush_all(&mut self.buf);
            }

            // Block size safety valve.
            if self.js.compiling
                && (self.js.num_instructions >= MAX_BLOCK_INSTRUCTIONS
                    || self.js.next_exit >= MAX_BLOCK_EXITS - 1
                    || self.buf.remaining() < 0x8000)
            {
                self.flush_all();
                let pc = self.js.compiler_pc;
                let exit = self.alloc_exit();
                self.write_exit(cpu, pc, exit);
                self.js.compiling = false;
            }
        }

        {
            let code_size = (self.buf.offset() - normal) as u32;
            let b = self.blocks.block_mut(num);
            b.code_size = code_size;
        }
        emit_align(&mut self.buf, 16);

        if self.js.last_continued_pc == 0 {
            self.blocks.block_mut(num).original_size = self.js.num_instructions.max(1);
        } else {
            // We continued at least once: register the last region and
            // credit the root only with its initial run.
            let words = self
                .js
                .compiler_pc
                .wrapping_sub(self.js.last_continued_pc)
                / 4;
            self.blocks
                .proxy_block(num, self.js.last_continued_pc, words);
            self.blocks.block_mut(num).original_size = self.js.initial_block_size.max(1);
        }
    }

    /// Exhaustive routing of one decoded instruction to its translator
    /// category.
    fn compile_instr(&mut self, cpu: &mut CpuState, instr: Instr, word: u32) {
        match instr {
            Instr::AluReg { .. }
            | Instr::AluImm { .. }
            | Instr::Ext { .. }
            | Instr::Ins { .. }
            | Instr::SignExt8 { .. }
            | Instr::SignExt16 { .. }
            | Instr::Bit { .. } => self.comp_alu(instr, word),
            Instr::ShiftImm { .. } | Instr::ShiftReg { .. } => self.comp_shift(instr, word),
            Instr::MulDiv { .. } | Instr::MoveFromHiLo { .. } | Instr::MoveToHiLo { .. } => {
                self.comp_muldiv(instr, word)
            }
            Instr::Jump { .. }
            | Instr::JumpReg { .. }
            | Instr::BranchCmp { .. }
            | Instr::BranchZero { .. }
            | Instr::BranchFpu { .. }
            | Instr::BranchVpu { .. } => self.comp_branch(cpu, instr, word),
            Instr::Syscall { .. } | Instr::Break { .. } => self.comp_trap(cpu, instr),
            Instr::Load { .. } | Instr::Store { .. } | Instr::LoadFpu { .. }
            | Instr::StoreFpu { .. } => self.comp_loadstore(cpu, instr, word),
            Instr::LoadVpu { .. } | Instr::StoreVpu { .. } => self.comp_vpu_mem(cpu, instr, word),
            Instr::FpuArith { .. }
            | Instr::FpuCmp { .. }
            | Instr::FpuConv { .. }
            | Instr::FpuXfer { .. } => self.comp_fpu(instr, word),
            Instr::VpuArith { .. }
            | Instr::VpuUnary { .. }
            | Instr::VpuCmp { .. }
            | Instr::VpuXfer { .. } => self.comp_vpu(instr, word),
            Instr::Unknown { word } => self.comp_generic(word),
        }
    }

    /// Interpreter fallback for one instruction: flush everything, point
    /// PC at the instruction, call out. Never used for branches.
    pub(crate) fn comp_generic(&mut self, word: u32) {
        debug_assert!(
            !decode(word).has_delay_slot(),
            "interpreter fallback cannot handle branch ops"
        );
        tracing::trace!(
            word = format_args!("{word:08x}"),
            pc = format_args!("{:08x}", self.js.compiler_pc),
            "deferring to interpreter"
        );
        self.flush_all();
        emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
        emit_mov_ri(&mut self.buf, false, Reg::Rsi, word as u64);
        emit_call_abs(&mut self.buf, self.cb.interp_op as usize);
        self.js.after_op_state_check = true;
    }

    // -- Shared emission helpers --

    pub(crate) fn flush_all(&mut self) {
        self.gpr.flush_all(&mut self.buf);
        self.fpr.flush_all(&mut self.buf);
    }

    pub(crate) fn map_reg(&mut self, r: u8, flags: MapFlags) -> Reg {
        self.gpr
            .map_reg(&mut self.buf, &self.an, self.js.compiler_pc, r, flags)
    }

    pub(crate) fn alloc_exit(&mut self) -> usize {
        let n = self.js.next_exit;
        assert!(n < MAX_BLOCK_EXITS, "out of block exits");
        self.js.next_exit += 1;
        n
    }

    /// Subtract the cycles this block has consumed so far.
    pub(crate) fn write_downcount(&mut self) {
        emit_arith_mi(
            &mut self.buf,
            ArithOp::Sub,
            CTX,
            offsets::downcount(),
            self.js.downcount_amount,
        );
    }

    /// Standard block exit towards a known guest address. Links directly
    /// to the destination's unchecked entry when it is already compiled.
    pub(crate) fn write_exit(&mut self, cpu: &CpuState, dest: u32, exit_num: usize) {
        if !cpu.addr_valid(dest) || dest & 3 != 0 {
            tracing::error!(
                dest = format_args!("{dest:08x}"),
                pc = format_args!("{:08x}", self.js.compiler_pc),
                "block exit to invalid destination"
            );
            // Same observable state as the interpreter hitting the bad
            // fetch: PC at the destination, fault recorded, block over.
            emit_store_imm(&mut self.buf, CTX, offsets::pc(), dest);
            emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
            emit_mov_ri(&mut self.buf, false, Reg::Rsi, dest as u64);
            emit_call_abs(&mut self.buf, self.cb.invalid_jump as usize);
            self.write_downcount();
            emit_jmp(&mut self.buf, self.fixed.check_state);
            return;
        }

        self.write_downcount();

        let stub = self.buf.offset() as u32;
        let linked = if self.jo.enable_blocklink && !self.jo.disabled(JitDisable::BLOCKLINK) {
            self.blocks.block_num_at(dest)
        } else {
            None
        };
        match linked {
            Some(tn) => {
                let entry = self.blocks.block(tn).normal_entry as usize;
                let start = self.buf.offset();
                emit_jmp(&mut self.buf, entry);
                let used = self.buf.offset() - start;
                self.buf.poison(EXIT_SIZE - used);
                let b = self.blocks.block_mut(self.js.cur_block);
                b.exits[exit_num] = BlockExit { target: dest, offset: stub, linked: true };
            }
            None => {
                BlockCache::emit_default_stub(&mut self.buf, dest, self.fixed.dispatcher);
                let b = self.blocks.block_mut(self.js.cur_block);
                b.exits[exit_num] = BlockExit { target: dest, offset: stub, linked: false };
            }
        }
    }

    /// Block exit with the destination in a host register (computed
    /// jumps). Validates the target at run time; invalid targets go
    /// through the fault reporter and the normal exception exit.
    pub(crate) fn write_exit_dest_in_reg(&mut self, cpu: &CpuState, reg: Reg) {
        debug_assert!(reg == Reg::Rcx || reg == Reg::Rdx, "use a scratch register");
        emit_mov_rr(&mut self.buf, false, Reg::Rax, reg);
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rax, 3);
        let misaligned = emit_jcc_fwd(&mut self.buf, Cond::Ne);
        emit_mov_rr(&mut self.buf, false, Reg::Rax, reg);
        emit_arith_ri(&mut self.buf, ArithOp::Sub, false, Reg::Rax, cpu.ram_base as i32);
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, cpu.ram_size as i32);
        let in_range = emit_jcc_fwd(&mut self.buf, Cond::B);

        set_jump_target(&mut self.buf, misaligned);
        emit_store(&mut self.buf, false, reg, CTX, offsets::pc());
        emit_mov_rr(&mut self.buf, false, Reg::Rsi, reg);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
        emit_call_abs(&mut self.buf, self.cb.invalid_jump as usize);
        self.write_downcount();
        emit_jmp(&mut self.buf, self.fixed.check_state);

        set_jump_target(&mut self.buf, in_range);
        emit_store(&mut self.buf, false, reg, CTX, offsets::pc());
        self.write_downcount();
        emit_jmp(&mut self.buf, self.fixed.dispatcher);
    }

    /// Post-callout check: if the callee stopped the CPU, leave through
    /// the dispatcher's state check with PC at the next instruction.
    fn emit_state_check_exit(&mut self) {
        emit_cmp_mi(&mut self.buf, CTX, offsets::exec_state(), 0);
        let ok = emit_jcc_fwd(&mut self.buf, Cond::E);
        emit_store_imm(
            &mut self.buf,
            CTX,
            offsets::pc(),
            self.js.compiler_pc.wrapping_add(4),
        );
        self.write_downcount();
        emit_jmp(&mut self.buf, self.fixed.check_state);
        set_jump_target(&mut self.buf, ok);
    }

    /// Compile the instruction in the branch's delay slot.
    pub(crate) fn compile_delay_slot(&mut self, cpu: &mut CpuState, flags: DelayFlags) {
        if flags.contains(DelayFlags::SAFE) {
            // pushfq; pop rax; save
            self.buf.emit_u8(0x9C);
            emit_pop(&mut self.buf, Reg::Rax);
            emit_store(&mut self.buf, true, Reg::Rax, CTX, offsets::saved_flags());
        }

        self.js.in_delay_slot = true;
        let slot_pc = self.js.compiler_pc.wrapping_add(4);
        let word = self.read_instruction(cpu, slot_pc);
        self.js.downcount_amount += 1;
        let saved_pc = self.js.compiler_pc;
        self.js.compiler_pc = slot_pc;
        self.compile_instr(cpu, decode(word), word);
        if self.js.after_op_state_check {
            self.js.after_op_state_check = false;
            self.emit_state_check_exit();
        }
        self.js.compiler_pc = saved_pc;
        self.js.in_delay_slot = false;

        if flags.contains(DelayFlags::FLUSH) {
            self.flush_all();
        }
        if flags.contains(DelayFlags::SAFE) {
            emit_load(&mut self.buf, true, Reg::Rax, CTX, offsets::saved_flags());
            emit_push(&mut self.buf, Reg::Rax);
            self.buf.emit_u8(0x9D);
        }
    }

    /// Skip over an instruction that was consumed by fusion.
    pub(crate) fn eat_instruction(&mut self) {
        self.js.compiler_pc = self.js.compiler_pc.wrapping_add(4);
        self.js.num_instructions += 1;
        self.js.downcount_amount += 1;
    }

    // -- Branch continuation plumbing --

    pub(crate) fn can_continue_branch(&self, cpu: &CpuState, target: u32) -> bool {
        self.jo.continue_branches
            && self.js.num_instructions < self.jo.continue_max_instructions
            && self.js.next_exit + 2 < MAX_BLOCK_EXITS
            && cpu.addr_valid(target)
            && target & 3 == 0
    }

    pub(crate) fn add_continued_block(&mut self, dest: u32) {
        if self.js.last_continued_pc == 0 {
            self.js.initial_block_size = self.js.num_instructions;
        } else {
            let words = self
                .js
                .compiler_pc
                .wrapping_sub(self.js.last_continued_pc)
                / 4;
            self.blocks
                .proxy_block(self.js.cur_block, self.js.last_continued_pc, words);
        }
        self.js.last_continued_pc = dest;
    }

    pub(crate) fn get_state_and_flush_all(&mut self) -> CacheState {
        let state = CacheState { gpr: self.gpr.state(), fpr: self.fpr.state() };
        self.flush_all();
        state
    }

    pub(crate) fn restore_cache_state(&mut self, state: &CacheState) {
        self.gpr.restore_state(&state.gpr);
        self.fpr.restore_state(&state.fpr);
    }

    // -- Syscall / break --

    fn comp_trap(&mut self, cpu: &CpuState, instr: Instr) {
        self.flush_all();
        match instr {
            Instr::Syscall { code } => {
                emit_store_imm(
                    &mut self.buf,
                    CTX,
                    offsets::pc(),
                    self.js.compiler_pc.wrapping_add(4),
                );
                match cpu.syscall_handler {
                    Some(handler) => {
                        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                        emit_mov_ri(&mut self.buf, false, Reg::Rsi, code as u64);
                        emit_call_abs(&mut self.buf, handler as usize);
                    }
                    None => {
                        emit_store_imm(
                            &mut self.buf,
                            CTX,
                            offsets::exec_state(),
                            ExecState::Halted as u32,
                        );
                    }
                }
            }
            Instr::Break { .. } => {
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_store_imm(
                    &mut self.buf,
                    CTX,
                    offsets::exec_state(),
                    ExecState::Exception as u32,
                );
            }
            _ => unreachable!(),
        }
        self.write_downcount();
        emit_jmp(&mut self.buf, self.fixed.check_state);
        self.js.compiling = false;
    }
}
