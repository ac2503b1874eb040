//! Scalar float translators: arithmetic, compares into the float
//! condition flag, conversions, and GPR transfers.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_cvtsi2ss, emit_cvttss2si, emit_ext_rr, emit_movaps_rr, emit_movd_rx,
    emit_movd_xr, emit_roundss, emit_setcc, emit_sse_rr, emit_store, emit_store_imm,
    emit_ucomiss, ArithOp, Cond, RoundMode, OPC_ADDSS, OPC_DIVSS, OPC_MOVZBL, OPC_MULSS,
    OPC_SQRTSS, OPC_SUBSS,
};
use vex_backend::x86_64::{Reg, Xmm, CTX};
use vex_core::decode::{FpuCond, FpuConvOp, FpuOp, Instr};
use vex_core::state::REG_ZERO;

use crate::compiler::Jit;
use crate::gpr::MapFlags;
use crate::offsets;
use crate::options::JitDisable;

impl Jit {
    pub(crate) fn comp_fpu(&mut self, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::FPU) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::FpuArith { op, fd, fs, ft } => self.fpu_arith(op, fd, fs, ft),
            Instr::FpuCmp { cond, fs, ft } => self.fpu_cmp(cond, fs, ft),
            Instr::FpuConv { op, fd, fs } => self.fpu_conv(op, fd, fs),
            Instr::FpuXfer { to_fpu, rt, fs } => self.fpu_xfer(to_fpu, rt, fs),
            _ => unreachable!(),
        }
    }

    fn fpu_arith(&mut self, op: FpuOp, fd: u8, fs: u8, ft: u8) {
        let (fd, fs, ft) = (fd as u16, fs as u16, ft as u16);
        match op {
            FpuOp::Add | FpuOp::Sub | FpuOp::Mul | FpuOp::Div => {
                let opc = match op {
                    FpuOp::Add => OPC_ADDSS,
                    FpuOp::Sub => OPC_SUBSS,
                    FpuOp::Mul => OPC_MULSS,
                    _ => OPC_DIVSS,
                };
                self.fpr.spill_lock(&[fd, fs, ft]);
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                let ft_x = self.fpr.map_fpr(&mut self.buf, ft, MapFlags::empty());
                if fd == fs {
                    let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY);
                    emit_sse_rr(&mut self.buf, opc, fd_x, ft_x);
                } else if fd == ft {
                    // fd = fs OP fd: detour through scratch for the
                    // non-commutative forms; harmless for the rest.
                    emit_movaps_rr(&mut self.buf, Xmm::Xmm0, fs_x);
                    emit_sse_rr(&mut self.buf, opc, Xmm::Xmm0, ft_x);
                    let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT);
                    emit_movaps_rr(&mut self.buf, fd_x, Xmm::Xmm0);
                } else {
                    let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT);
                    emit_movaps_rr(&mut self.buf, fd_x, fs_x);
                    emit_sse_rr(&mut self.buf, opc, fd_x, ft_x);
                }
                self.fpr.release_spill_locks();
            }
            FpuOp::Sqrt => {
                self.fpr.spill_lock(&[fd, fs]);
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                let fd_x = if fd == fs {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY)
                } else {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT)
                };
                emit_sse_rr(&mut self.buf, OPC_SQRTSS, fd_x, fs_x);
                self.fpr.release_spill_locks();
            }
            FpuOp::Mov => {
                if fd == fs {
                    return;
                }
                self.fpr.spill_lock(&[fd, fs]);
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT);
                emit_movaps_rr(&mut self.buf, fd_x, fs_x);
                self.fpr.release_spill_locks();
            }
            FpuOp::Abs | FpuOp::Neg => {
                // Sign-bit games go through the integer unit; NaN
                // payloads survive untouched.
                self.fpr.spill_lock(&[fd, fs]);
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                emit_movd_rx(&mut self.buf, Reg::Rax, fs_x);
                if op == FpuOp::Abs {
                    emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rax, 0x7fff_ffff);
                } else {
                    emit_arith_ri(
                        &mut self.buf,
                        ArithOp::Xor,
                        false,
                        Reg::Rax,
                        0x8000_0000u32 as i32,
                    );
                }
                let fd_x = if fd == fs {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY)
                } else {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT)
                };
                emit_movd_xr(&mut self.buf, fd_x, Reg::Rax);
                self.fpr.release_spill_locks();
            }
        }
    }

    fn fpu_cmp(&mut self, cond: FpuCond, fs: u8, ft: u8) {
        if cond == FpuCond::False {
            emit_store_imm(&mut self.buf, CTX, offsets::fp_cond(), 0);
            return;
        }
        self.fpr.spill_lock(&[fs as u16, ft as u16]);
        let fs_x = self.fpr.map_fpr(&mut self.buf, fs as u16, MapFlags::empty());
        let ft_x = self.fpr.map_fpr(&mut self.buf, ft as u16, MapFlags::empty());
        match cond {
            FpuCond::Eq => {
                // Equal and ordered: ZF set, PF clear.
                emit_ucomiss(&mut self.buf, fs_x, ft_x);
                emit_setcc(&mut self.buf, Cond::E, Reg::Rax);
                emit_setcc(&mut self.buf, Cond::Np, Reg::Rcx);
                vex_backend::x86_64::emitter::emit_arith_rr(
                    &mut self.buf,
                    ArithOp::And,
                    false,
                    Reg::Rax,
                    Reg::Rcx,
                );
            }
            FpuCond::Lt => {
                // Swapped compare: CF covers unordered correctly.
                emit_ucomiss(&mut self.buf, ft_x, fs_x);
                emit_setcc(&mut self.buf, Cond::A, Reg::Rax);
            }
            FpuCond::Le => {
                emit_ucomiss(&mut self.buf, ft_x, fs_x);
                emit_setcc(&mut self.buf, Cond::Ae, Reg::Rax);
            }
            FpuCond::False => unreachable!(),
        }
        emit_ext_rr(&mut self.buf, OPC_MOVZBL, Reg::Rax, Reg::Rax);
        emit_store(&mut self.buf, false, Reg::Rax, CTX, offsets::fp_cond());
        self.fpr.release_spill_locks();
    }

    fn fpu_conv(&mut self, op: FpuConvOp, fd: u8, fs: u8) {
        let (fd, fs) = (fd as u16, fs as u16);
        self.fpr.spill_lock(&[fd, fs]);
        match op {
            FpuConvOp::CvtSw => {
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                emit_movd_rx(&mut self.buf, Reg::Rax, fs_x);
                let fd_x = if fd == fs {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY)
                } else {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT)
                };
                emit_cvtsi2ss(&mut self.buf, fd_x, Reg::Rax);
            }
            _ => {
                let mode = match op {
                    FpuConvOp::TruncWs => None,
                    FpuConvOp::CvtWs | FpuConvOp::RoundWs => Some(RoundMode::Nearest),
                    FpuConvOp::FloorWs => Some(RoundMode::Floor),
                    FpuConvOp::CeilWs => Some(RoundMode::Ceil),
                    FpuConvOp::CvtSw => unreachable!(),
                };
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
                let src = match mode {
                    Some(m) => {
                        emit_roundss(&mut self.buf, Xmm::Xmm0, fs_x, m);
                        Xmm::Xmm0
                    }
                    None => fs_x,
                };
                // Truncating convert; overflow and NaN produce the
                // saturated 0x8000_0000, same as the interpreter.
                emit_cvttss2si(&mut self.buf, Reg::Rax, src);
                let fd_x = if fd == fs {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY)
                } else {
                    self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT)
                };
                emit_movd_xr(&mut self.buf, fd_x, Reg::Rax);
            }
        }
        self.fpr.release_spill_locks();
    }

    fn fpu_xfer(&mut self, to_fpu: bool, rt: u8, fs: u8) {
        if to_fpu {
            if self.gpr.is_imm(rt) {
                let v = self.gpr.get_imm(rt);
                let fs_x = self.fpr.map_fpr(&mut self.buf, fs as u16, MapFlags::NOINIT);
                vex_backend::x86_64::emitter::emit_mov_ri(
                    &mut self.buf,
                    false,
                    Reg::Rax,
                    v as u64,
                );
                emit_movd_xr(&mut self.buf, fs_x, Reg::Rax);
                return;
            }
            let rt_h = self.map_reg(rt, MapFlags::empty());
            let fs_x = self.fpr.map_fpr(&mut self.buf, fs as u16, MapFlags::NOINIT);
            emit_movd_xr(&mut self.buf, fs_x, rt_h);
        } else {
            if rt == REG_ZERO {
                return;
            }
            let fs_x = self.fpr.map_fpr(&mut self.buf, fs as u16, MapFlags::empty());
            let rt_h = self.map_reg(rt, MapFlags::NOINIT);
            emit_movd_rx(&mut self.buf, rt_h, fs_x);
        }
    }
}
