//! Branch, jump and call translators.
//!
//! Every branch classifies its delay slot first: a *nice* slot cannot
//! interfere with the branch decision and may be compiled before the
//! outcome is known; a branch-in-branch contributes only its link write
//! (architecturally undefined, preserved as observed); anything else is
//! compiled between the compare and the conditional jump with the host
//! flags saved around it.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_arith_rr, emit_call_abs, emit_cmp_mi, emit_jcc_fwd, emit_jmp,
    emit_load, emit_mov_rr, emit_store, emit_store_imm, emit_test_mi, set_jump_target,
    ArithOp, Cond, FixupBranch,
};
use vex_backend::x86_64::{Reg, CTX};
use vex_core::decode::{decode, CmpCond, Instr, ZeroCond};
use vex_core::state::{CpuState, REG_RA, REG_ZERO};

use crate::compiler::{DelayFlags, Jit};
use crate::gpr::MapFlags;
use crate::offsets;
use crate::options::JitDisable;

/// Classified delay-slot facts for one branch.
struct BranchInfo {
    slot: Instr,
    likely: bool,
    and_link: bool,
    nice: bool,
    is_branch: bool,
}

impl Jit {
    pub(crate) fn comp_branch(&mut self, cpu: &mut CpuState, instr: Instr, word: u32) {
        if self.js.in_delay_slot {
            // The outer branch already decided what this inner branch
            // contributes (its link write); nothing to compile here.
            tracing::warn!(
                pc = format_args!("{:08x}", self.js.compiler_pc),
                "branch in delay slot"
            );
            return;
        }
        if self.jo.disabled(JitDisable::BRANCH) {
            return self.comp_branch_generic(word);
        }
        match instr {
            Instr::BranchCmp { cond, rs, rt, offset, likely } => {
                self.branch_cmp(cpu, cond, rs, rt, offset, likely)
            }
            Instr::BranchZero { cond, rs, offset, likely, link } => {
                self.branch_zero(cpu, cond, rs, offset, likely, link)
            }
            Instr::BranchFpu { sense, offset, likely } => {
                self.branch_flag(cpu, offset, likely, FlagSrc::FpCond, sense, 0)
            }
            Instr::BranchVpu { sense, cc, offset, likely } => {
                self.branch_flag(cpu, offset, likely, FlagSrc::Vcmp, sense, cc)
            }
            Instr::Jump { target26, link } => self.comp_jump(cpu, target26, link),
            Instr::JumpReg { rs, rd, link } => self.comp_jump_reg(cpu, rs, rd, link),
            _ => unreachable!(),
        }
    }

    /// Disabled-category fallback: interpret the branch together with its
    /// delay slot, then leave through the dispatcher.
    fn comp_branch_generic(&mut self, _word: u32) {
        self.flush_all();
        emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
        emit_call_abs(&mut self.buf, self.cb.interp_branch_pair as usize);
        // The pair includes the delay slot's cycle.
        self.js.downcount_amount += 1;
        self.write_downcount();
        emit_jmp(&mut self.buf, self.fixed.check_state);
        self.js.compiling = false;
    }

    fn branch_info(&self, cpu: &CpuState, likely: bool, and_link: bool) -> BranchInfo {
        let slot_pc = self.js.compiler_pc.wrapping_add(4);
        let slot = if cpu.addr_valid(slot_pc) {
            decode(self.read_instruction(cpu, slot_pc))
        } else {
            Instr::Unknown { word: 0 }
        };
        BranchInfo {
            slot,
            likely,
            and_link,
            nice: false,
            is_branch: slot.has_delay_slot(),
        }
    }

    fn target_of(&self, offset: i16) -> u32 {
        self.js
            .compiler_pc
            .wrapping_add(4)
            .wrapping_add((offset as i32 as u32) << 2)
    }

    fn not_taken_of(&self) -> u32 {
        self.js.compiler_pc.wrapping_add(8)
    }

    fn branch_cmp(&mut self, cpu: &mut CpuState, cond: CmpCond, rs: u8, rt: u8, offset: i16, likely: bool) {
        let target = self.target_of(offset);
        let not_taken = self.not_taken_of();
        let mut info = self.branch_info(cpu, likely, false);
        info.nice = !info.is_branch
            && info.slot.gpr_writes() & ((1u64 << rs) | (1u64 << rt)) == 0;

        // Both operands known: the branch direction is a translation-time
        // fact.
        if self.gpr.is_imm(rs) && self.gpr.is_imm(rt) && !info.is_branch {
            let taken = match cond {
                CmpCond::Eq => self.gpr.get_imm(rs) == self.gpr.get_imm(rt),
                CmpCond::Ne => self.gpr.get_imm(rs) != self.gpr.get_imm(rt),
            };
            return self.branch_imm(cpu, taken, target, not_taken, info);
        }

        if !likely && info.nice {
            self.compile_delay_slot(cpu, DelayFlags::NICE);
        }

        // Emit the compare; the emitted Jcc skips the branch.
        let skip_cc = match cond {
            CmpCond::Eq => Cond::Ne,
            CmpCond::Ne => Cond::E,
        };
        if self.gpr.is_imm(rt) {
            let imm = self.gpr.get_imm(rt) as i32;
            let rs_h = self.map_reg(rs, MapFlags::empty());
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, rs_h, imm);
        } else if self.gpr.is_imm(rs) {
            let imm = self.gpr.get_imm(rs) as i32;
            let rt_h = self.map_reg(rt, MapFlags::empty());
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, rt_h, imm);
        } else {
            self.gpr.spill_lock(&[rs, rt]);
            let rs_h = self.map_reg(rs, MapFlags::empty());
            let rt_h = self.map_reg(rt, MapFlags::empty());
            emit_arith_rr(&mut self.buf, ArithOp::Cmp, false, rs_h, rt_h);
            self.gpr.release_spill_locks();
        }
        self.branch_exits(cpu, skip_cc, target, not_taken, info);
    }

    fn branch_zero(&mut self, cpu: &mut CpuState, cond: ZeroCond, rs: u8, offset: i16, likely: bool, link: bool) {
        let target = self.target_of(offset);
        let not_taken = self.not_taken_of();
        let mut info = self.branch_info(cpu, likely, link);
        info.nice = !info.is_branch && info.slot.gpr_writes() & (1u64 << rs) == 0;

        if self.gpr.is_imm(rs) && !info.is_branch {
            let a = self.gpr.get_imm(rs) as i32;
            let taken = match cond {
                ZeroCond::Lez => a <= 0,
                ZeroCond::Gtz => a > 0,
                ZeroCond::Ltz => a < 0,
                ZeroCond::Gez => a >= 0,
            };
            return self.branch_imm(cpu, taken, target, not_taken, info);
        }

        if !likely && info.nice {
            self.compile_delay_slot(cpu, DelayFlags::NICE);
        }

        let skip_cc = match cond {
            ZeroCond::Lez => Cond::G,
            ZeroCond::Gtz => Cond::Le,
            ZeroCond::Ltz => Cond::Ns,
            ZeroCond::Gez => Cond::S,
        };
        let rs_h = self.map_reg(rs, MapFlags::empty());
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, rs_h, 0);
        self.branch_exits(cpu, skip_cc, target, not_taken, info);
    }

    fn branch_flag(&mut self, cpu: &mut CpuState, offset: i16, likely: bool, src: FlagSrc, sense: bool, cc_bit: u8) {
        let target = self.target_of(offset);
        let not_taken = self.not_taken_of();
        let mut info = self.branch_info(cpu, likely, false);
        info.nice = !info.is_branch
            && match src {
                FlagSrc::FpCond => !info.slot.writes_fp_cond(),
                FlagSrc::Vcmp => !info.slot.writes_vcmp(),
            };

        if !likely && info.nice {
            self.compile_delay_slot(cpu, DelayFlags::NICE);
        }

        let skip_cc = match src {
            FlagSrc::FpCond => {
                emit_cmp_mi(&mut self.buf, CTX, offsets::fp_cond(), 0);
                // Taken when (fp_cond != 0) == sense.
                if sense {
                    Cond::E
                } else {
                    Cond::Ne
                }
            }
            FlagSrc::Vcmp => {
                emit_test_mi(&mut self.buf, CTX, offsets::vcmp(), 1 << cc_bit);
                if sense {
                    Cond::E
                } else {
                    Cond::Ne
                }
            }
        };
        self.branch_exits(cpu, skip_cc, target, not_taken, info);
    }

    /// Translation-time-resolved branch: one exit, or a continuation.
    fn branch_imm(&mut self, cpu: &mut CpuState, taken: bool, target: u32, not_taken: u32, info: BranchInfo) {
        if self.jo.imm_branches
            && self.can_continue_branch(cpu, if taken { target } else { not_taken })
        {
            if !taken {
                if info.and_link {
                    self.gpr.set_imm(REG_RA, self.js.compiler_pc.wrapping_add(8));
                }
                // Fall straight through; a likely branch skips the slot,
                // otherwise it is simply the next instruction.
                if info.likely {
                    self.js.compiler_pc = self.js.compiler_pc.wrapping_add(4);
                }
                return;
            }
            if info.and_link {
                self.gpr.set_imm(REG_RA, self.js.compiler_pc.wrapping_add(8));
            }
            self.compile_delay_slot(cpu, DelayFlags::NICE);
            self.add_continued_block(target);
            // The main loop adds 4.
            self.js.compiler_pc = target.wrapping_sub(4);
            self.js.compiling = true;
            return;
        }

        if info.and_link {
            self.gpr.set_imm(REG_RA, self.js.compiler_pc.wrapping_add(8));
        }
        if info.is_branch {
            // The slot branch links only when the slot actually runs.
            if taken || !info.likely {
                self.delay_slot_branch_links(&info);
            }
            self.flush_all();
        } else if taken || !info.likely {
            self.compile_delay_slot(cpu, DelayFlags::FLUSH);
        } else {
            self.flush_all();
        }
        let dest = if taken { target } else { not_taken };
        let exit = self.alloc_exit();
        self.write_exit(cpu, dest, exit);
        self.js.compiling = false;
    }

    /// Emit the taken/not-taken exits (or continue along the predicted
    /// path). `skip_cc` is the host condition that skips the branch.
    fn branch_exits(&mut self, cpu: &mut CpuState, skip_cc: Cond, target: u32, not_taken: u32, info: BranchInfo) {
        if info.and_link {
            self.gpr.set_imm(REG_RA, self.js.compiler_pc.wrapping_add(8));
        }

        // Likely branches are overwhelmingly taken; otherwise backward
        // branches predict taken.
        let predict_taken = info.likely || target <= self.js.compiler_pc;
        if !info.is_branch
            && self.can_continue_branch(cpu, if predict_taken { target } else { not_taken })
        {
            // The Jcc jumps to the continuation path; the fallthrough is
            // the flushed block exit for the other direction.
            let cc = if predict_taken { skip_cc.invert() } else { skip_cc };
            let fix: FixupBranch;
            let state;
            if !info.likely {
                if !info.nice {
                    self.compile_delay_slot(cpu, DelayFlags::SAFE);
                }
                fix = emit_jcc_fwd(&mut self.buf, cc);
                state = self.get_state_and_flush_all();
            } else {
                fix = emit_jcc_fwd(&mut self.buf, cc);
                if predict_taken {
                    state = self.get_state_and_flush_all();
                } else {
                    // Snapshot before the slot: the continuation path
                    // skips it entirely.
                    state = self.snapshot();
                    self.compile_delay_slot(cpu, DelayFlags::FLUSH);
                }
            }

            if predict_taken {
                let exit = self.alloc_exit();
                self.write_exit(cpu, not_taken, exit);
                set_jump_target(&mut self.buf, fix);
                self.restore_cache_state(&state);
                if info.likely {
                    self.compile_delay_slot(cpu, DelayFlags::NICE);
                }
                self.add_continued_block(target);
                self.js.compiler_pc = target.wrapping_sub(4);
            } else {
                let exit = self.alloc_exit();
                self.write_exit(cpu, target, exit);
                set_jump_target(&mut self.buf, fix);
                self.restore_cache_state(&state);
                // Skip the delay slot; the loop adds the other 4.
                self.js.compiler_pc = self.js.compiler_pc.wrapping_add(4);
            }
            // In case the delay slot ended the block.
            self.js.compiling = true;
            return;
        }

        let fix: FixupBranch;
        if !info.likely {
            // The slot runs on both outcomes, so a slot branch links on
            // both exits.
            if info.is_branch {
                self.delay_slot_branch_links(&info);
            }
            if !info.nice && !info.is_branch {
                self.compile_delay_slot(cpu, DelayFlags::SAFE | DelayFlags::FLUSH);
            } else {
                self.flush_all();
            }
            fix = emit_jcc_fwd(&mut self.buf, skip_cc);
        } else {
            // Likely: the slot (and any link write it carries) belongs
            // to the taken path only.
            self.flush_all();
            fix = emit_jcc_fwd(&mut self.buf, skip_cc);
            if info.is_branch {
                self.delay_slot_branch_links(&info);
                self.flush_all();
            } else {
                self.compile_delay_slot(cpu, DelayFlags::FLUSH);
            }
        }

        let exit = self.alloc_exit();
        self.write_exit(cpu, target, exit);
        set_jump_target(&mut self.buf, fix);
        let exit = self.alloc_exit();
        self.write_exit(cpu, not_taken, exit);
        self.js.compiling = false;
    }

    /// A branch sitting in a delay slot contributes only its link write,
    /// from its own perspective (slot pc + 8 = branch pc + 12).
    fn delay_slot_branch_links(&mut self, info: &BranchInfo) {
        let link_value = self.js.compiler_pc.wrapping_add(12);
        match info.slot {
            Instr::Jump { link: true, .. } => self.gpr.set_imm(REG_RA, link_value),
            Instr::JumpReg { rd, link: true, .. } => {
                if rd != REG_ZERO {
                    self.gpr.set_imm(rd, link_value);
                }
            }
            Instr::BranchZero { link: true, .. } => self.gpr.set_imm(REG_RA, link_value),
            _ => {}
        }
    }

    fn comp_jump(&mut self, cpu: &mut CpuState, target26: u32, link: bool) {
        let target = (self.js.compiler_pc & 0xF000_0000) | (target26 << 2);
        let info = self.branch_info(cpu, false, link);

        if link {
            self.gpr.set_imm(REG_RA, self.js.compiler_pc.wrapping_add(8));
        }
        if info.is_branch {
            self.delay_slot_branch_links(&info);
            self.flush_all();
        } else {
            self.compile_delay_slot(cpu, DelayFlags::NICE);
            self.flush_all();
        }
        let exit = self.alloc_exit();
        self.write_exit(cpu, target, exit);
        self.js.compiling = false;
    }

    fn comp_jump_reg(&mut self, cpu: &mut CpuState, rs: u8, rd: u8, link: bool) {
        let info = self.branch_info(cpu, false, false);

        if self.gpr.is_imm(rs) {
            // Constant target: this is really a direct jump.
            let target = self.gpr.get_imm(rs);
            if link && rd != REG_ZERO {
                self.gpr.set_imm(rd, self.js.compiler_pc.wrapping_add(8));
            }
            if info.is_branch {
                self.delay_slot_branch_links(&info);
                self.flush_all();
            } else {
                self.compile_delay_slot(cpu, DelayFlags::NICE);
                self.flush_all();
            }
            let exit = self.alloc_exit();
            self.write_exit(cpu, target, exit);
            self.js.compiling = false;
            return;
        }

        // Capture the target before the slot or the link write can
        // clobber the source register.
        let rs_h = self.map_reg(rs, MapFlags::empty());
        emit_store(&mut self.buf, false, rs_h, CTX, offsets::scratch_jump());
        if link && rd != REG_ZERO {
            self.gpr.set_imm(rd, self.js.compiler_pc.wrapping_add(8));
        }
        if info.is_branch {
            self.delay_slot_branch_links(&info);
            self.flush_all();
        } else {
            self.compile_delay_slot(cpu, DelayFlags::NICE);
            self.flush_all();
        }
        emit_load(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        self.write_exit_dest_in_reg(cpu, Reg::Rcx);
        self.js.compiling = false;
    }
}

#[derive(Clone, Copy)]
enum FlagSrc {
    FpCond,
    Vcmp,
}
