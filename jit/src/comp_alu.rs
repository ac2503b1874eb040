//! Integer ALU, shift and multiply/divide translators.
//!
//! Shared policy for every handler here: writes to `$0` vanish before any
//! allocator state is touched, reads of `$0` become the immediate zero,
//! and an operation whose operands are all known immediates is computed at
//! translation time — no host instruction is emitted at all.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_arith_rr, emit_bsr, emit_cdq, emit_cmovcc, emit_div, emit_ext_rr,
    emit_idiv, emit_imul1, emit_imul_ri, emit_imul_rr, emit_jcc_fwd, emit_jmp_fwd, emit_lea,
    emit_mov_ri, emit_mov_rr, emit_mul, emit_not, emit_setcc, emit_shift_cl, emit_shift_ri,
    emit_test_rr, set_jump_target, ArithOp, Cond, ShiftOp as HostShift, OPC_MOVSBL,
    OPC_MOVSWL, OPC_MOVZBL,
};
use vex_backend::x86_64::Reg;
use vex_core::decode::{AluImmOp, AluRegOp, BitOp, Instr, MulDivOp, ShOp};
use vex_core::state::{GPR_HI, GPR_LO, REG_ZERO};

use crate::compiler::Jit;
use crate::gpr::MapFlags;
use crate::options::JitDisable;

impl Jit {
    pub(crate) fn comp_alu(&mut self, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::ALU) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::AluImm { op, rt, rs, imm } => self.alu_imm(op, rt, rs, imm),
            Instr::AluReg { op, rd, rs, rt } => self.alu_reg(op, rd, rs, rt),
            Instr::Ext { rt, rs, pos, size } => self.alu_ext(rt, rs, pos, size),
            Instr::Ins { rt, rs, pos, size } => self.alu_ins(rt, rs, pos, size),
            Instr::SignExt8 { rd, rt } => self.alu_signext(rd, rt, true),
            Instr::SignExt16 { rd, rt } => self.alu_signext(rd, rt, false),
            Instr::Bit { op, rd, rs } => self.alu_bit(op, rd, rs),
            _ => unreachable!(),
        }
    }

    fn alu_imm(&mut self, op: AluImmOp, rt: u8, rs: u8, imm: u16) {
        if rt == REG_ZERO {
            return;
        }
        if op == AluImmOp::Lui {
            self.gpr.set_imm(rt, (imm as u32) << 16);
            return;
        }
        let se = imm as i16 as i32;
        if self.gpr.is_imm(rs) {
            let a = self.gpr.get_imm(rs);
            let v = match op {
                AluImmOp::Addiu => a.wrapping_add(se as u32),
                AluImmOp::Slti => ((a as i32) < se) as u32,
                AluImmOp::Sltiu => (a < se as u32) as u32,
                AluImmOp::Andi => a & imm as u32,
                AluImmOp::Ori => a | imm as u32,
                AluImmOp::Xori => a ^ imm as u32,
                AluImmOp::Lui => unreachable!(),
            };
            self.gpr.set_imm(rt, v);
            return;
        }

        match op {
            AluImmOp::Addiu => {
                self.gpr.spill_lock(&[rt, rs]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                if rt == rs {
                    let rt_h = self.map_reg(rt, MapFlags::DIRTY);
                    if se != 0 {
                        emit_arith_ri(&mut self.buf, ArithOp::Add, false, rt_h, se);
                    }
                } else {
                    let rt_h = self.map_reg(rt, MapFlags::NOINIT);
                    emit_lea(&mut self.buf, false, rt_h, rs_h, se);
                }
                self.gpr.release_spill_locks();
            }
            AluImmOp::Slti | AluImmOp::Sltiu => {
                self.gpr.spill_lock(&[rt, rs]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, rs_h, se);
                let cond = if op == AluImmOp::Slti { Cond::L } else { Cond::B };
                emit_setcc(&mut self.buf, cond, Reg::Rax);
                emit_ext_rr(&mut self.buf, OPC_MOVZBL, Reg::Rax, Reg::Rax);
                let rt_h = self.map_reg(rt, MapFlags::NOINIT);
                emit_mov_rr(&mut self.buf, false, rt_h, Reg::Rax);
                self.gpr.release_spill_locks();
            }
            AluImmOp::Andi | AluImmOp::Ori | AluImmOp::Xori => {
                let arith = match op {
                    AluImmOp::Andi => ArithOp::And,
                    AluImmOp::Ori => ArithOp::Or,
                    _ => ArithOp::Xor,
                };
                self.gpr.spill_lock(&[rt, rs]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = if rt == rs {
                    self.map_reg(rt, MapFlags::DIRTY)
                } else {
                    let rt_h = self.map_reg(rt, MapFlags::NOINIT);
                    emit_mov_rr(&mut self.buf, false, rt_h, rs_h);
                    rt_h
                };
                // The immediate is zero-extended; bit 15 never sign-bleeds.
                emit_arith_ri(&mut self.buf, arith, false, rt_h, imm as i32);
                self.gpr.release_spill_locks();
            }
            AluImmOp::Lui => unreachable!(),
        }
    }

    fn alu_reg(&mut self, op: AluRegOp, rd: u8, rs: u8, rt: u8) {
        if rd == REG_ZERO {
            return;
        }
        if self.gpr.is_imm(rs) && self.gpr.is_imm(rt) {
            let a = self.gpr.get_imm(rs);
            let b = self.gpr.get_imm(rt);
            let folded = match op {
                AluRegOp::Addu => Some(a.wrapping_add(b)),
                AluRegOp::Subu => Some(a.wrapping_sub(b)),
                AluRegOp::And => Some(a & b),
                AluRegOp::Or => Some(a | b),
                AluRegOp::Xor => Some(a ^ b),
                AluRegOp::Nor => Some(!(a | b)),
                AluRegOp::Slt => Some(((a as i32) < (b as i32)) as u32),
                AluRegOp::Sltu => Some((a < b) as u32),
                AluRegOp::Min => Some((a as i32).min(b as i32) as u32),
                AluRegOp::Max => Some((a as i32).max(b as i32) as u32),
                // Conditional moves also read the destination.
                AluRegOp::Movz | AluRegOp::Movn => None,
            };
            if let Some(v) = folded {
                self.gpr.set_imm(rd, v);
                return;
            }
        }

        match op {
            AluRegOp::Addu => self.alu3(rd, rs, rt, ArithOp::Add, true),
            AluRegOp::And => self.alu3(rd, rs, rt, ArithOp::And, true),
            AluRegOp::Or => self.alu3(rd, rs, rt, ArithOp::Or, true),
            AluRegOp::Xor => self.alu3(rd, rs, rt, ArithOp::Xor, true),
            AluRegOp::Subu => self.alu3(rd, rs, rt, ArithOp::Sub, false),
            AluRegOp::Nor => {
                self.alu3(rd, rs, rt, ArithOp::Or, true);
                let rd_h = self.gpr.host_reg(rd);
                emit_not(&mut self.buf, false, rd_h);
            }
            AluRegOp::Slt | AluRegOp::Sltu => {
                self.gpr.spill_lock(&[rd, rs, rt]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = self.map_reg(rt, MapFlags::empty());
                emit_arith_rr(&mut self.buf, ArithOp::Cmp, false, rs_h, rt_h);
                let cond = if op == AluRegOp::Slt { Cond::L } else { Cond::B };
                emit_setcc(&mut self.buf, cond, Reg::Rax);
                emit_ext_rr(&mut self.buf, OPC_MOVZBL, Reg::Rax, Reg::Rax);
                let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                emit_mov_rr(&mut self.buf, false, rd_h, Reg::Rax);
                self.gpr.release_spill_locks();
            }
            AluRegOp::Min | AluRegOp::Max => {
                self.gpr.spill_lock(&[rd, rs, rt]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = self.map_reg(rt, MapFlags::empty());
                emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
                emit_arith_rr(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, rt_h);
                let cond = if op == AluRegOp::Min { Cond::G } else { Cond::L };
                emit_cmovcc(&mut self.buf, cond, Reg::Rax, rt_h);
                let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                emit_mov_rr(&mut self.buf, false, rd_h, Reg::Rax);
                self.gpr.release_spill_locks();
            }
            AluRegOp::Movz | AluRegOp::Movn => {
                // rd also reads its own old value.
                if self.gpr.is_imm(rt) {
                    let cond_met = (self.gpr.get_imm(rt) == 0) == (op == AluRegOp::Movz);
                    if cond_met {
                        if self.gpr.is_imm(rs) {
                            let v = self.gpr.get_imm(rs);
                            self.gpr.set_imm(rd, v);
                        } else {
                            self.gpr.spill_lock(&[rd, rs]);
                            let rs_h = self.map_reg(rs, MapFlags::empty());
                            let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                            emit_mov_rr(&mut self.buf, false, rd_h, rs_h);
                            self.gpr.release_spill_locks();
                        }
                    }
                    return;
                }
                self.gpr.spill_lock(&[rd, rs, rt]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = self.map_reg(rt, MapFlags::empty());
                let rd_h = self.map_reg(rd, MapFlags::DIRTY);
                emit_test_rr(&mut self.buf, rt_h, rt_h);
                let cond = if op == AluRegOp::Movz { Cond::E } else { Cond::Ne };
                emit_cmovcc(&mut self.buf, cond, rd_h, rs_h);
                self.gpr.release_spill_locks();
            }
        }
    }

    /// Two-operand host arithmetic for a three-register guest op.
    fn alu3(&mut self, rd: u8, rs: u8, rt: u8, arith: ArithOp, commutative: bool) {
        // One known operand still beats a register for the common
        // accumulate-into patterns.
        if self.gpr.is_imm(rt) && rd == rs {
            let b = self.gpr.get_imm(rt) as i32;
            let rd_h = self.map_reg(rd, MapFlags::DIRTY);
            emit_arith_ri(&mut self.buf, arith, false, rd_h, b);
            return;
        }

        self.gpr.spill_lock(&[rd, rs, rt]);
        let rs_h = self.map_reg(rs, MapFlags::empty());
        let rt_h = self.map_reg(rt, MapFlags::empty());
        if rd == rs {
            let rd_h = self.map_reg(rd, MapFlags::DIRTY);
            emit_arith_rr(&mut self.buf, arith, false, rd_h, rt_h);
        } else if rd == rt && commutative {
            let rd_h = self.map_reg(rd, MapFlags::DIRTY);
            emit_arith_rr(&mut self.buf, arith, false, rd_h, rs_h);
        } else if rd == rt {
            // rd = rs - rd needs a detour.
            emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
            emit_arith_rr(&mut self.buf, arith, false, Reg::Rax, rt_h);
            let rd_h = self.map_reg(rd, MapFlags::NOINIT);
            emit_mov_rr(&mut self.buf, false, rd_h, Reg::Rax);
        } else {
            let rd_h = self.map_reg(rd, MapFlags::NOINIT);
            emit_mov_rr(&mut self.buf, false, rd_h, rs_h);
            emit_arith_rr(&mut self.buf, arith, false, rd_h, rt_h);
        }
        self.gpr.release_spill_locks();
    }

    fn alu_ext(&mut self, rt: u8, rs: u8, pos: u8, size: u8) {
        if rt == REG_ZERO {
            return;
        }
        let mask = if size >= 32 { u32::MAX } else { (1u32 << size) - 1 };
        if self.gpr.is_imm(rs) {
            let v = (self.gpr.get_imm(rs) >> pos) & mask;
            self.gpr.set_imm(rt, v);
            return;
        }
        self.gpr.spill_lock(&[rt, rs]);
        let rs_h = self.map_reg(rs, MapFlags::empty());
        let rt_h = if rt == rs {
            self.map_reg(rt, MapFlags::DIRTY)
        } else {
            let rt_h = self.map_reg(rt, MapFlags::NOINIT);
            emit_mov_rr(&mut self.buf, false, rt_h, rs_h);
            rt_h
        };
        if pos != 0 {
            emit_shift_ri(&mut self.buf, HostShift::Shr, false, rt_h, pos);
        }
        if (pos + size) < 32 {
            emit_arith_ri(&mut self.buf, ArithOp::And, false, rt_h, mask as i32);
        }
        self.gpr.release_spill_locks();
    }

    fn alu_ins(&mut self, rt: u8, rs: u8, pos: u8, size: u8) {
        if rt == REG_ZERO {
            return;
        }
        let mask = if size >= 32 { u32::MAX } else { (1u32 << size) - 1 };
        let keep = !(mask << pos);
        if self.gpr.is_imm(rs) && self.gpr.is_imm(rt) {
            let field = (self.gpr.get_imm(rs) & mask) << pos;
            let v = (self.gpr.get_imm(rt) & keep) | field;
            self.gpr.set_imm(rt, v);
            return;
        }
        self.gpr.spill_lock(&[rt, rs]);
        if self.gpr.is_imm(rs) {
            let field = (self.gpr.get_imm(rs) & mask) << pos;
            let rt_h = self.map_reg(rt, MapFlags::DIRTY);
            emit_arith_ri(&mut self.buf, ArithOp::And, false, rt_h, keep as i32);
            if field != 0 {
                emit_arith_ri(&mut self.buf, ArithOp::Or, false, rt_h, field as i32);
            }
        } else {
            let rs_h = self.map_reg(rs, MapFlags::empty());
            let rt_h = self.map_reg(rt, MapFlags::DIRTY);
            emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
            emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rax, mask as i32);
            if pos != 0 {
                emit_shift_ri(&mut self.buf, HostShift::Shl, false, Reg::Rax, pos);
            }
            emit_arith_ri(&mut self.buf, ArithOp::And, false, rt_h, keep as i32);
            emit_arith_rr(&mut self.buf, ArithOp::Or, false, rt_h, Reg::Rax);
        }
        self.gpr.release_spill_locks();
    }

    fn alu_signext(&mut self, rd: u8, rt: u8, byte: bool) {
        if rd == REG_ZERO {
            return;
        }
        if self.gpr.is_imm(rt) {
            let a = self.gpr.get_imm(rt);
            let v = if byte { a as i8 as i32 as u32 } else { a as i16 as i32 as u32 };
            self.gpr.set_imm(rd, v);
            return;
        }
        self.gpr.spill_lock(&[rd, rt]);
        let rt_h = self.map_reg(rt, MapFlags::empty());
        let rd_h = self.map_reg(rd, if rd == rt { MapFlags::DIRTY } else { MapFlags::NOINIT });
        let opc = if byte { OPC_MOVSBL } else { OPC_MOVSWL };
        emit_ext_rr(&mut self.buf, opc, rd_h, rt_h);
        self.gpr.release_spill_locks();
    }

    fn alu_bit(&mut self, op: BitOp, rd: u8, rs: u8) {
        if rd == REG_ZERO {
            return;
        }
        if self.gpr.is_imm(rs) {
            let a = self.gpr.get_imm(rs);
            let v = match op {
                BitOp::Clz => a.leading_zeros(),
                BitOp::Clo => a.leading_ones(),
            };
            self.gpr.set_imm(rd, v);
            return;
        }
        self.gpr.spill_lock(&[rd, rs]);
        let rs_h = self.map_reg(rs, MapFlags::empty());
        emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
        if op == BitOp::Clo {
            emit_not(&mut self.buf, false, Reg::Rax);
        }
        let rd_h = self.map_reg(rd, if rd == rs { MapFlags::DIRTY } else { MapFlags::NOINIT });
        emit_bsr(&mut self.buf, Reg::Rax, Reg::Rax);
        emit_mov_ri(&mut self.buf, false, rd_h, 32);
        let all_zero = emit_jcc_fwd(&mut self.buf, Cond::E);
        emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rax, 31);
        emit_mov_rr(&mut self.buf, false, rd_h, Reg::Rax);
        set_jump_target(&mut self.buf, all_zero);
        self.gpr.release_spill_locks();
    }

    // -- Shifts --

    pub(crate) fn comp_shift(&mut self, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::SHIFT) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::ShiftImm { op, rd, rt, sa } => {
                if rd == REG_ZERO {
                    return;
                }
                if self.gpr.is_imm(rt) {
                    let a = self.gpr.get_imm(rt);
                    let v = match op {
                        ShOp::Sll => a << sa,
                        ShOp::Srl => a >> sa,
                        ShOp::Sra => ((a as i32) >> sa) as u32,
                        ShOp::Rotr => a.rotate_right(sa as u32),
                    };
                    self.gpr.set_imm(rd, v);
                    return;
                }
                self.gpr.spill_lock(&[rd, rt]);
                let rt_h = self.map_reg(rt, MapFlags::empty());
                let rd_h = if rd == rt {
                    self.map_reg(rd, MapFlags::DIRTY)
                } else {
                    let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                    emit_mov_rr(&mut self.buf, false, rd_h, rt_h);
                    rd_h
                };
                if sa != 0 {
                    emit_shift_ri(&mut self.buf, host_shift(op), false, rd_h, sa);
                }
                self.gpr.release_spill_locks();
            }
            Instr::ShiftReg { op, rd, rt, rs } => {
                if rd == REG_ZERO {
                    return;
                }
                if self.gpr.is_imm(rs) {
                    let sa = (self.gpr.get_imm(rs) & 31) as u8;
                    return self.comp_shift(
                        Instr::ShiftImm { op, rd, rt, sa },
                        word,
                    );
                }
                self.gpr.spill_lock(&[rd, rt, rs]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                emit_mov_rr(&mut self.buf, false, Reg::Rcx, rs_h);
                let rt_h = self.map_reg(rt, MapFlags::empty());
                let rd_h = if rd == rt {
                    self.map_reg(rd, MapFlags::DIRTY)
                } else {
                    let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                    emit_mov_rr(&mut self.buf, false, rd_h, rt_h);
                    rd_h
                };
                // 32-bit shifts mask CL to 5 bits in hardware, matching
                // the guest's shift-amount truncation.
                emit_shift_cl(&mut self.buf, host_shift(op), false, rd_h);
                self.gpr.release_spill_locks();
            }
            _ => unreachable!(),
        }
    }

    // -- Multiply / divide --

    pub(crate) fn comp_muldiv(&mut self, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::MULDIV) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::MoveFromHiLo { rd, hi } => {
                if rd == REG_ZERO {
                    return;
                }
                let src = if hi { GPR_HI } else { GPR_LO };
                if self.gpr.is_imm(src) {
                    let v = self.gpr.get_imm(src);
                    self.gpr.set_imm(rd, v);
                    return;
                }
                self.gpr.spill_lock(&[rd, src]);
                let src_h = self.map_reg(src, MapFlags::empty());
                let rd_h = if rd == src {
                    self.map_reg(rd, MapFlags::DIRTY)
                } else {
                    self.map_reg(rd, MapFlags::NOINIT)
                };
                if rd_h != src_h {
                    emit_mov_rr(&mut self.buf, false, rd_h, src_h);
                }
                self.gpr.release_spill_locks();
            }
            Instr::MoveToHiLo { rs, hi } => {
                let dst = if hi { GPR_HI } else { GPR_LO };
                if self.gpr.is_imm(rs) {
                    let v = self.gpr.get_imm(rs);
                    self.gpr.set_imm(dst, v);
                    return;
                }
                self.gpr.spill_lock(&[dst, rs]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let dst_h = self.map_reg(dst, MapFlags::NOINIT);
                emit_mov_rr(&mut self.buf, false, dst_h, rs_h);
                self.gpr.release_spill_locks();
            }
            Instr::MulDiv { op, rs, rt, rd } => self.muldiv_op(op, rs, rt, rd),
            _ => unreachable!(),
        }
    }

    fn muldiv_op(&mut self, op: MulDivOp, rs: u8, rt: u8, rd: u8) {
        let both_imm = self.gpr.is_imm(rs) && self.gpr.is_imm(rt);
        let acc = matches!(
            op,
            MulDivOp::Madd | MulDivOp::Maddu | MulDivOp::Msub | MulDivOp::Msubu
        );
        let acc_imm = !acc || (self.gpr.is_imm(GPR_HI) && self.gpr.is_imm(GPR_LO));

        if both_imm && acc_imm {
            let a = self.gpr.get_imm(rs);
            let b = self.gpr.get_imm(rt);
            match op {
                MulDivOp::Mul => {
                    if rd != REG_ZERO {
                        self.gpr.set_imm(rd, a.wrapping_mul(b));
                    }
                    return;
                }
                _ => {
                    let acc_val = if acc { self.gpr_hi_lo_imm() } else { 0 };
                    let (hi, lo) = muldiv_fold(op, a, b, acc_val);
                    self.gpr.set_imm(GPR_HI, hi);
                    self.gpr.set_imm(GPR_LO, lo);
                    return;
                }
            }
        }

        match op {
            MulDivOp::Mul => {
                if rd == REG_ZERO {
                    return;
                }
                // One known operand: three-operand imul folds it in.
                if self.gpr.is_imm(rs) != self.gpr.is_imm(rt) {
                    let (reg, imm) = if self.gpr.is_imm(rs) {
                        (rt, self.gpr.get_imm(rs))
                    } else {
                        (rs, self.gpr.get_imm(rt))
                    };
                    self.gpr.spill_lock(&[rd, reg]);
                    let reg_h = self.map_reg(reg, MapFlags::empty());
                    let rd_h = if rd == reg {
                        self.map_reg(rd, MapFlags::DIRTY)
                    } else {
                        self.map_reg(rd, MapFlags::NOINIT)
                    };
                    emit_imul_ri(&mut self.buf, rd_h, reg_h, imm as i32);
                    self.gpr.release_spill_locks();
                    return;
                }
                self.gpr.spill_lock(&[rd, rs, rt]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = self.map_reg(rt, MapFlags::empty());
                if rd == rs {
                    let rd_h = self.map_reg(rd, MapFlags::DIRTY);
                    emit_imul_rr(&mut self.buf, rd_h, rt_h);
                } else if rd == rt {
                    let rd_h = self.map_reg(rd, MapFlags::DIRTY);
                    emit_imul_rr(&mut self.buf, rd_h, rs_h);
                } else {
                    let rd_h = self.map_reg(rd, MapFlags::NOINIT);
                    emit_mov_rr(&mut self.buf, false, rd_h, rs_h);
                    emit_imul_rr(&mut self.buf, rd_h, rt_h);
                }
                self.gpr.release_spill_locks();
            }
            MulDivOp::Mult | MulDivOp::Multu | MulDivOp::Madd | MulDivOp::Maddu
            | MulDivOp::Msub | MulDivOp::Msubu => {
                let signed = matches!(op, MulDivOp::Mult | MulDivOp::Madd | MulDivOp::Msub);
                self.gpr.spill_lock(&[rs, rt, GPR_HI, GPR_LO]);
                let rs_h = self.map_reg(rs, MapFlags::empty());
                let rt_h = self.map_reg(rt, MapFlags::empty());
                let hilo_flags = if acc { MapFlags::DIRTY } else { MapFlags::NOINIT };
                let hi_h = self.map_reg(GPR_HI, hilo_flags);
                let lo_h = self.map_reg(GPR_LO, hilo_flags);
                emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
                if signed {
                    emit_imul1(&mut self.buf, rt_h);
                } else {
                    emit_mul(&mut self.buf, rt_h);
                }
                match op {
                    MulDivOp::Mult | MulDivOp::Multu => {
                        emit_mov_rr(&mut self.buf, false, lo_h, Reg::Rax);
                        emit_mov_rr(&mut self.buf, false, hi_h, Reg::Rdx);
                    }
                    MulDivOp::Madd | MulDivOp::Maddu => {
                        emit_arith_rr(&mut self.buf, ArithOp::Add, false, lo_h, Reg::Rax);
                        emit_arith_rr(&mut self.buf, ArithOp::Adc, false, hi_h, Reg::Rdx);
                    }
                    MulDivOp::Msub | MulDivOp::Msubu => {
                        emit_arith_rr(&mut self.buf, ArithOp::Sub, false, lo_h, Reg::Rax);
                        emit_arith_rr(&mut self.buf, ArithOp::Sbb, false, hi_h, Reg::Rdx);
                    }
                    _ => unreachable!(),
                }
                self.gpr.release_spill_locks();
            }
            MulDivOp::Div => self.div_op(rs, rt, true),
            MulDivOp::Divu => self.div_op(rs, rt, false),
        }
    }

    /// Division with the guest's fully defined divide-by-zero and
    /// overflow results, branched at run time.
    fn div_op(&mut self, rs: u8, rt: u8, signed: bool) {
        self.gpr.spill_lock(&[rs, rt, GPR_HI, GPR_LO]);
        let rs_h = self.map_reg(rs, MapFlags::empty());
        let rt_h = self.map_reg(rt, MapFlags::empty());
        let hi_h = self.map_reg(GPR_HI, MapFlags::NOINIT);
        let lo_h = self.map_reg(GPR_LO, MapFlags::NOINIT);

        emit_mov_rr(&mut self.buf, false, Reg::Rax, rs_h);
        emit_test_rr(&mut self.buf, rt_h, rt_h);
        let div_zero = emit_jcc_fwd(&mut self.buf, Cond::E);

        let mut done = Vec::new();
        if signed {
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, rt_h, -1);
            let no_ovf = emit_jcc_fwd(&mut self.buf, Cond::Ne);
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, i32::MIN);
            let no_ovf2 = emit_jcc_fwd(&mut self.buf, Cond::Ne);
            emit_mov_ri(&mut self.buf, false, lo_h, 0x8000_0000);
            emit_mov_ri(&mut self.buf, false, hi_h, 0xffff_ffff);
            done.push(emit_jmp_fwd(&mut self.buf));
            set_jump_target(&mut self.buf, no_ovf);
            set_jump_target(&mut self.buf, no_ovf2);
            emit_cdq(&mut self.buf);
            emit_idiv(&mut self.buf, rt_h);
        } else {
            emit_mov_ri(&mut self.buf, false, Reg::Rdx, 0);
            emit_div(&mut self.buf, rt_h);
        }
        emit_mov_rr(&mut self.buf, false, lo_h, Reg::Rax);
        emit_mov_rr(&mut self.buf, false, hi_h, Reg::Rdx);
        done.push(emit_jmp_fwd(&mut self.buf));

        set_jump_target(&mut self.buf, div_zero);
        emit_mov_rr(&mut self.buf, false, hi_h, Reg::Rax);
        if signed {
            emit_mov_ri(&mut self.buf, false, lo_h, 0xffff_ffff);
            emit_test_rr(&mut self.buf, Reg::Rax, Reg::Rax);
            let non_neg = emit_jcc_fwd(&mut self.buf, Cond::Ns);
            emit_mov_ri(&mut self.buf, false, lo_h, 1);
            set_jump_target(&mut self.buf, non_neg);
        } else {
            emit_mov_ri(&mut self.buf, false, lo_h, 0xffff);
            emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, 0x10000);
            let small = emit_jcc_fwd(&mut self.buf, Cond::B);
            emit_mov_ri(&mut self.buf, false, lo_h, 0xffff_ffff);
            set_jump_target(&mut self.buf, small);
        }
        for fix in done {
            set_jump_target(&mut self.buf, fix);
        }
        self.gpr.release_spill_locks();
    }

    fn gpr_hi_lo_imm(&self) -> u64 {
        ((self.gpr.get_imm(GPR_HI) as u64) << 32) | self.gpr.get_imm(GPR_LO) as u64
    }
}

fn host_shift(op: ShOp) -> HostShift {
    match op {
        ShOp::Sll => HostShift::Shl,
        ShOp::Srl => HostShift::Shr,
        ShOp::Sra => HostShift::Sar,
        ShOp::Rotr => HostShift::Ror,
    }
}

fn muldiv_fold(op: MulDivOp, a: u32, b: u32, acc: u64) -> (u32, u32) {
    let r = match op {
        MulDivOp::Mult => (a as i32 as i64).wrapping_mul(b as i32 as i64) as u64,
        MulDivOp::Multu => (a as u64).wrapping_mul(b as u64),
        MulDivOp::Madd => acc.wrapping_add((a as i32 as i64).wrapping_mul(b as i32 as i64) as u64),
        MulDivOp::Maddu => acc.wrapping_add((a as u64).wrapping_mul(b as u64)),
        MulDivOp::Msub => acc.wrapping_sub((a as i32 as i64).wrapping_mul(b as i32 as i64) as u64),
        MulDivOp::Msubu => acc.wrapping_sub((a as u64).wrapping_mul(b as u64)),
        MulDivOp::Div => {
            let (a, b) = (a as i32, b as i32);
            if a == i32::MIN && b == -1 {
                ((!0u32 as u64) << 32) | 0x8000_0000
            } else if b != 0 {
                (((a % b) as u32 as u64) << 32) | (a / b) as u32 as u64
            } else {
                ((a as u32 as u64) << 32) | if a < 0 { 1 } else { !0u32 as u64 }
            }
        }
        MulDivOp::Divu => {
            if b != 0 {
                (((a % b) as u64) << 32) | (a / b) as u64
            } else {
                ((a as u64) << 32) | if a <= 0xFFFF { 0xFFFF } else { !0u32 as u64 }
            }
        }
        MulDivOp::Mul => unreachable!(),
    };
    ((r >> 32) as u32, r as u32)
}
