//! Fixed bootstrap code: entry trampoline, outer loop and dispatcher.
//!
//! Generated once at the start of the arena and never moved; every block
//! exit stub ends in a jump to one of these labels. The host-side run loop
//! enters through `enter` with a target pointer (the dispatcher, or a
//! freshly translated block's unchecked entry) and gets back an exit code.

use vex_backend::x86_64::emitter::{
    self, emit_align, emit_arith_ri, emit_call_reg, emit_cmp_mi, emit_jcc, emit_jcc_fwd,
    emit_jmp, emit_jmp_fwd, emit_jmp_reg, emit_load, emit_load_sib, emit_mov_ri, emit_mov_rr,
    emit_pop, emit_push, emit_ret, emit_shift_ri, emit_store_imm, set_jump_target, ArithOp,
    Cond, ShiftOp,
};
use vex_backend::x86_64::{Reg, CALLEE_SAVED, CALL_ARG_REGS, CTX, MEMBASE};
use vex_backend::CodeArena;
use vex_core::state::CpuState;

use crate::blocks::{EMUHACK_MARKER, EMUHACK_VALUE_MASK};
use crate::offsets;

/// Exit codes returned by the generated epilogue.
pub const EXIT_STATE: u32 = 0;
pub const EXIT_COMPILE: u32 = 1;

/// Signature of the generated entry trampoline.
pub type EnterFn = unsafe extern "C" fn(*mut CpuState, *const u8) -> u32;

/// Arena offsets of the fixed code labels.
#[derive(Debug, Clone, Copy)]
pub struct FixedCode {
    pub enter: usize,
    pub outer_loop: usize,
    /// Exec-state check falling through into the dispatcher; syscall
    /// exits jump here.
    pub check_state: usize,
    pub dispatcher: usize,
    pub epilogue: usize,
    /// First offset available for translated blocks.
    pub end: usize,
}

pub fn generate_fixed_code(buf: &mut CodeArena, cpu: &CpuState) -> FixedCode {
    let ram_mask = cpu.ram_size - 1;
    let arena_base = buf.base_ptr() as u64;

    // -- enter(ctx, target) --
    emit_align(buf, 16);
    let enter = buf.offset();
    for &reg in CALLEE_SAVED {
        emit_push(buf, reg);
    }
    // Keep RSP 16-byte aligned for calls out of generated code.
    emit_arith_ri(buf, ArithOp::Sub, true, Reg::Rsp, 8);
    emit_mov_rr(buf, true, CTX, CALL_ARG_REGS[0]);
    emit_load(buf, true, MEMBASE, CTX, offsets::mem_base());
    emit_jmp_reg(buf, CALL_ARG_REGS[1]);

    // -- outer loop: advance timing, re-check state --
    emit_align(buf, 16);
    let outer_loop = buf.offset();
    match cpu.timing_advance {
        Some(hook) => {
            emit_mov_rr(buf, true, Reg::Rdi, CTX);
            emit_mov_ri(buf, true, Reg::Rax, hook as usize as u64);
            emit_call_reg(buf, Reg::Rax);
        }
        None => {
            // No timing hook: an expired downcount halts the CPU.
            emit_store_imm(
                buf,
                CTX,
                offsets::exec_state(),
                vex_core::state::ExecState::Halted as u32,
            );
        }
    }

    // -- state check + dispatcher --
    let check_state = buf.offset();
    emit_cmp_mi(buf, CTX, offsets::exec_state(), 0);
    let exit_state = emit_jcc_fwd(buf, Cond::Ne);

    let dispatcher = buf.offset();
    emit_cmp_mi(buf, CTX, offsets::downcount(), 0);
    emit_jcc(buf, Cond::S, outer_loop);

    // Fetch the guest word at PC and test for a block tag.
    emit_load(buf, false, Reg::Rax, CTX, offsets::pc());
    emit_mov_rr(buf, false, Reg::Rcx, Reg::Rax);
    emit_arith_ri(buf, ArithOp::And, false, Reg::Rcx, ram_mask as i32);
    emit_load_sib(buf, false, Reg::Rdx, MEMBASE, Reg::Rcx, 0, 0);
    emit_mov_rr(buf, false, Reg::Rcx, Reg::Rdx);
    emit_shift_ri(buf, ShiftOp::Shr, false, Reg::Rcx, 24);
    emit_arith_ri(buf, ArithOp::Cmp, false, Reg::Rcx, EMUHACK_MARKER as i32);
    let no_block = emit_jcc_fwd(buf, Cond::Ne);

    // Tag hit: jump to the checked entry encoded in the tag. An offset
    // past the arena means a fabricated tag; hand it to the translator,
    // which resolves it through the block table instead.
    let arena_cap = buf.capacity() as i32;
    emit_arith_ri(buf, ArithOp::And, false, Reg::Rdx, EMUHACK_VALUE_MASK as i32);
    emit_arith_ri(buf, ArithOp::Cmp, false, Reg::Rdx, arena_cap);
    let bad_tag = emit_jcc_fwd(buf, Cond::Ae);
    emit_mov_ri(buf, true, Reg::Rax, arena_base);
    emitter::emit_arith_rr(buf, ArithOp::Add, true, Reg::Rax, Reg::Rdx);
    emit_jmp_reg(buf, Reg::Rax);
    set_jump_target(buf, bad_tag);

    // Tag miss: hand control back to the host loop for translation.
    set_jump_target(buf, no_block);
    emit_mov_ri(buf, false, Reg::Rax, EXIT_COMPILE as u64);
    let to_epilogue = emit_jmp_fwd(buf);

    set_jump_target(buf, exit_state);
    emit_mov_ri(buf, false, Reg::Rax, EXIT_STATE as u64);

    // -- epilogue --
    set_jump_target(buf, to_epilogue);
    let epilogue = buf.offset();
    emit_arith_ri(buf, ArithOp::Add, true, Reg::Rsp, 8);
    for &reg in CALLEE_SAVED.iter().rev() {
        emit_pop(buf, reg);
    }
    emit_ret(buf);

    emit_align(buf, 16);
    let end = buf.offset();

    FixedCode {
        enter,
        outer_loop,
        check_state,
        dispatcher,
        epilogue,
        end,
    }
}
