//! Vector-unit translators.
//!
//! Elementwise math prefers mapping whole operand groups into SIMD lanes;
//! whenever the group cannot be packed (register-numbering aliasing,
//! members held by other packs), an elementwise scalar fallback produces
//! identical results. Destination/source overlap at different positions is
//! detected through the same index derivation used for addressing and
//! serialized through the translator temps.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_arith_rr, emit_call_abs, emit_cmpps, emit_ext_rr, emit_extractps_store,
    emit_insertps_load, emit_jcc_fwd, emit_jmp_fwd, emit_load, emit_movaps_rr, emit_movd_rx,
    emit_movd_xr, emit_mov_ri, emit_mov_rr, emit_movmskps, emit_movss_load, emit_movss_store,
    emit_movups_load, emit_movups_load_sib, emit_movups_store, emit_movups_store_sib,
    emit_pshufd, emit_setcc, emit_shufps, emit_sse_rr, emit_store, emit_store_imm,
    emit_ucomiss, emit_xorps_self, set_jump_target, ArithOp, CmpPsOp, Cond, OPC_ADDPS,
    OPC_ADDSS, OPC_ANDPS, OPC_DIVPS, OPC_DIVSS, OPC_MAXPS, OPC_MAXSS, OPC_MINPS, OPC_MINSS,
    OPC_MOVZBL, OPC_MULPS, OPC_MULSS, OPC_SUBPS, OPC_SUBSS, OPC_XORPS,
};
use vex_backend::x86_64::{Reg, Xmm, CTX, MEMBASE};
use vex_core::decode::{Instr, VpuCond, VpuOp, VpuUnaryOp};
use vex_core::state::{CpuState, REG_ZERO, VCMP_ALL, VCMP_ANY};
use vex_core::vreg::{get_vector_regs, overlaps_badly, VectorSize};

use crate::compiler::Jit;
use crate::fpr::{TEMP_BASE, VPR_BASE};
use crate::gpr::MapFlags;
use crate::offsets;
use crate::options::JitDisable;

/// Float-space indices of a vector operand group.
fn vgroup(vreg: u8, sz: VectorSize) -> Vec<u16> {
    get_vector_regs(vreg, sz)[..sz.len()]
        .iter()
        .map(|&r| VPR_BASE + r as u16)
        .collect()
}

fn velem(vreg: u8) -> u16 {
    VPR_BASE + get_vector_regs(vreg, VectorSize::Single)[0] as u16
}

fn packed_opc(op: VpuOp) -> u32 {
    match op {
        VpuOp::Add => OPC_ADDPS,
        VpuOp::Sub => OPC_SUBPS,
        VpuOp::Mul | VpuOp::Scl => OPC_MULPS,
        VpuOp::Div => OPC_DIVPS,
        VpuOp::Min => OPC_MINPS,
        VpuOp::Max => OPC_MAXPS,
        VpuOp::Dot => unreachable!(),
    }
}

fn scalar_opc(op: VpuOp) -> u32 {
    match op {
        VpuOp::Add => OPC_ADDSS,
        VpuOp::Sub => OPC_SUBSS,
        VpuOp::Mul | VpuOp::Scl | VpuOp::Dot => OPC_MULSS,
        VpuOp::Div => OPC_DIVSS,
        VpuOp::Min => OPC_MINSS,
        VpuOp::Max => OPC_MAXSS,
    }
}

impl Jit {
    pub(crate) fn comp_vpu(&mut self, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::VPU) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::VpuArith { op, sz, vd, vs, vt } => match op {
                VpuOp::Dot => self.vpu_dot(sz, vd, vs, vt),
                VpuOp::Scl => self.vpu_scale(sz, vd, vs, vt),
                _ => self.vpu_elementwise(op, sz, vd, vs, vt),
            },
            Instr::VpuUnary { op, sz, vd, vs } => self.vpu_unary(op, sz, vd, vs),
            Instr::VpuCmp { cond, sz, vs, vt } => self.vpu_cmp(cond, sz, vs, vt),
            Instr::VpuXfer { to_vpu, rt, vreg } => self.vpu_xfer(to_vpu, rt, vreg),
            _ => unreachable!(),
        }
    }

    // -- Elementwise arithmetic --

    fn vpu_elementwise(&mut self, op: VpuOp, sz: VectorSize, vd: u8, vs: u8, vt: u8) {
        let n = sz.len();
        let d = vgroup(vd, sz);
        let s = vgroup(vs, sz);
        let t = vgroup(vt, sz);

        // Destination overlapping a source at a different position must
        // serialize through temps; exact same-position overlap is fine
        // because lane i depends only on lane i.
        let bad = overlaps_badly(&d, &s) || overlaps_badly(&d, &t);

        if !bad && n > 1 && self.try_vpu_simd(op, &d, &s, &t) {
            return;
        }
        self.vpu_scalar_elementwise(op, n, &d, &s, &t, bad);
    }

    /// The SIMD fast path. Returns false (with no guest-visible effect)
    /// when any group refuses to pack; correctness never depends on
    /// getting here.
    fn try_vpu_simd(&mut self, op: VpuOp, d: &[u16], s: &[u16], t: &[u16]) -> bool {
        let opc = packed_opc(op);
        let Some(sx) = self.fpr.try_map_vec(&mut self.buf, s, MapFlags::empty()) else {
            return false;
        };
        self.fpr.lock_xmm(sx);
        let tx = if t == s {
            sx
        } else {
            match self.fpr.try_map_vec(&mut self.buf, t, MapFlags::empty()) {
                Some(x) => x,
                None => {
                    self.fpr.release_spill_locks();
                    return false;
                }
            }
        };
        self.fpr.lock_xmm(tx);

        if d == s {
            let dx = self
                .fpr
                .try_map_vec(&mut self.buf, d, MapFlags::DIRTY)
                .expect("exact pack must remap");
            emit_sse_rr(&mut self.buf, opc, dx, tx);
        } else if d == t {
            // Result must be s OP t in that order (NaN propagation and
            // min/max tie rules are operand-ordered).
            emit_movaps_rr(&mut self.buf, Xmm::Xmm0, sx);
            emit_sse_rr(&mut self.buf, opc, Xmm::Xmm0, tx);
            let dx = self
                .fpr
                .try_map_vec(&mut self.buf, d, MapFlags::DIRTY)
                .expect("exact pack must remap");
            emit_movaps_rr(&mut self.buf, dx, Xmm::Xmm0);
        } else {
            let Some(dx) = self.fpr.try_map_vec(&mut self.buf, d, MapFlags::NOINIT) else {
                self.fpr.release_spill_locks();
                return false;
            };
            emit_movaps_rr(&mut self.buf, dx, sx);
            emit_sse_rr(&mut self.buf, opc, dx, tx);
        }
        self.fpr.release_spill_locks();
        true
    }

    /// Mandatory scalar fallback with identical results; `bad` routes the
    /// writes through the translator temps first.
    fn vpu_scalar_elementwise(&mut self, op: VpuOp, n: usize, d: &[u16], s: &[u16], t: &[u16], bad: bool) {
        let opc = scalar_opc(op);
        if bad {
            for i in 0..n {
                self.scalar3(opc, TEMP_BASE + i as u16, s[i], t[i]);
            }
            for i in 0..n {
                self.scalar_copy(d[i], TEMP_BASE + i as u16);
            }
        } else {
            for i in 0..n {
                self.scalar3(opc, d[i], s[i], t[i]);
            }
        }
    }

    /// fd = fs OP ft over float-space indices, order-preserving.
    fn scalar3(&mut self, opc: u32, fd: u16, fs: u16, ft: u16) {
        self.fpr.spill_lock(&[fd, fs, ft]);
        let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
        let ft_x = self.fpr.map_fpr(&mut self.buf, ft, MapFlags::empty());
        if fd == fs {
            let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::DIRTY);
            emit_sse_rr(&mut self.buf, opc, fd_x, ft_x);
        } else if fd == ft {
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

    fn scalar_copy(&mut self, fd: u16, fs: u16) {
        if fd == fs {
            return;
        }
        self.fpr.spill_lock(&[fd, fs]);
        let fs_x = self.fpr.map_fpr(&mut self.buf, fs, MapFlags::empty());
        let fd_x = self.fpr.map_fpr(&mut self.buf, fd, MapFlags::NOINIT);
        emit_movaps_rr(&mut self.buf, fd_x, fs_x);
        self.fpr.release_spill_locks();
    }

    // -- Scale by scalar --

    fn vpu_scale(&mut self, sz: VectorSize, vd: u8, vs: u8, vt: u8) {
        let n = sz.len();
        let d = vgroup(vd, sz);
        let s = vgroup(vs, sz);
        let t0 = velem(vt);
        let bad = overlaps_badly(&d, &s);

        // Snapshot the scale factor first; writing d can alias it.
        self.fpr.read_to_scratch(&mut self.buf, t0, Xmm::Xmm1);

        if !bad && n > 1 {
            if let Some(sx) = self.fpr.try_map_vec(&mut self.buf, &s, MapFlags::empty()) {
                self.fpr.lock_xmm(sx);
                emit_shufps(&mut self.buf, Xmm::Xmm1, Xmm::Xmm1, 0);
                let dx = if d == s {
                    self.fpr.try_map_vec(&mut self.buf, &d, MapFlags::DIRTY)
                } else {
                    self.fpr.try_map_vec(&mut self.buf, &d, MapFlags::NOINIT)
                };
                if let Some(dx) = dx {
                    if dx != sx {
                        emit_movaps_rr(&mut self.buf, dx, sx);
                    }
                    emit_sse_rr(&mut self.buf, OPC_MULPS, dx, Xmm::Xmm1);
                    self.fpr.release_spill_locks();
                    return;
                }
                self.fpr.release_spill_locks();
                // Xmm1 still holds the unbroadcast scale in lane 0 after
                // the shuffle; re-read to be safe.
                self.fpr.read_to_scratch(&mut self.buf, t0, Xmm::Xmm1);
            }
        }

        // Scalar fallback: multiply each element by the snapshot.
        let dst: Vec<u16> = if bad {
            (0..n).map(|i| TEMP_BASE + i as u16).collect()
        } else {
            d.clone()
        };
        for i in 0..n {
            self.fpr.spill_lock(&[dst[i], s[i]]);
            let s_x = self.fpr.map_fpr(&mut self.buf, s[i], MapFlags::empty());
            emit_movaps_rr(&mut self.buf, Xmm::Xmm0, s_x);
            emit_sse_rr(&mut self.buf, OPC_MULSS, Xmm::Xmm0, Xmm::Xmm1);
            let d_x = self.fpr.map_fpr(&mut self.buf, dst[i], MapFlags::NOINIT);
            emit_movaps_rr(&mut self.buf, d_x, Xmm::Xmm0);
            self.fpr.release_spill_locks();
        }
        if bad {
            for i in 0..n {
                self.scalar_copy(d[i], TEMP_BASE + i as u16);
            }
        }
    }

    // -- Dot product --

    fn vpu_dot(&mut self, sz: VectorSize, vd: u8, vs: u8, vt: u8) {
        let n = sz.len();
        let s = vgroup(vs, sz);
        let t = vgroup(vt, sz);
        let d0 = velem(vd);

        // Plain scalar accumulation; whole-pack stores dominate the SIMD
        // path and a reduction would not.
        for i in 0..n {
            self.fpr.read_to_scratch(&mut self.buf, s[i], Xmm::Xmm0);
            let t_x = self.fpr.map_fpr(&mut self.buf, t[i], MapFlags::empty());
            emit_sse_rr(&mut self.buf, OPC_MULSS, Xmm::Xmm0, t_x);
            if i == 0 {
                emit_movaps_rr(&mut self.buf, Xmm::Xmm1, Xmm::Xmm0);
            } else {
                emit_sse_rr(&mut self.buf, OPC_ADDSS, Xmm::Xmm1, Xmm::Xmm0);
            }
        }
        let d_x = self.fpr.map_fpr(&mut self.buf, d0, MapFlags::NOINIT);
        emit_movaps_rr(&mut self.buf, d_x, Xmm::Xmm1);
    }

    // -- Unary --

    fn vpu_unary(&mut self, op: VpuUnaryOp, sz: VectorSize, vd: u8, vs: u8) {
        let n = sz.len();
        let d = vgroup(vd, sz);

        match op {
            VpuUnaryOp::Zero | VpuUnaryOp::One => {
                let one_bits = 1.0f32.to_bits();
                if n > 1 {
                    if let Some(dx) = self.fpr.try_map_vec(&mut self.buf, &d, MapFlags::NOINIT) {
                        if op == VpuUnaryOp::Zero {
                            emit_xorps_self(&mut self.buf, dx);
                        } else {
                            emit_mov_ri(&mut self.buf, false, Reg::Rax, one_bits as u64);
                            emit_movd_xr(&mut self.buf, Xmm::Xmm0, Reg::Rax);
                            emit_pshufd(&mut self.buf, dx, Xmm::Xmm0, 0);
                        }
                        return;
                    }
                }
                for &di in &d {
                    let d_x = self.fpr.map_fpr(&mut self.buf, di, MapFlags::NOINIT);
                    if op == VpuUnaryOp::Zero {
                        emit_xorps_self(&mut self.buf, d_x);
                    } else {
                        emit_mov_ri(&mut self.buf, false, Reg::Rax, one_bits as u64);
                        emit_movd_xr(&mut self.buf, d_x, Reg::Rax);
                    }
                }
                return;
            }
            _ => {}
        }

        let s = vgroup(vs, sz);
        if d == s && op == VpuUnaryOp::Mov {
            return;
        }
        let bad = overlaps_badly(&d, &s);

        if !bad && n > 1 {
            if let Some(sx) = self.fpr.try_map_vec(&mut self.buf, &s, MapFlags::empty()) {
                self.fpr.lock_xmm(sx);
                let dx = if d == s {
                    self.fpr.try_map_vec(&mut self.buf, &d, MapFlags::DIRTY)
                } else {
                    self.fpr.try_map_vec(&mut self.buf, &d, MapFlags::NOINIT)
                };
                if let Some(dx) = dx {
                    match op {
                        VpuUnaryOp::Mov => {
                            if dx != sx {
                                emit_movaps_rr(&mut self.buf, dx, sx);
                            }
                        }
                        VpuUnaryOp::Neg | VpuUnaryOp::Abs => {
                            let mask = if op == VpuUnaryOp::Neg { 0x8000_0000u32 } else { 0x7fff_ffff };
                            let mopc = if op == VpuUnaryOp::Neg { OPC_XORPS } else { OPC_ANDPS };
                            emit_mov_ri(&mut self.buf, false, Reg::Rax, mask as u64);
                            emit_movd_xr(&mut self.buf, Xmm::Xmm0, Reg::Rax);
                            emit_pshufd(&mut self.buf, Xmm::Xmm0, Xmm::Xmm0, 0);
                            if dx != sx {
                                emit_movaps_rr(&mut self.buf, dx, sx);
                            }
                            emit_sse_rr(&mut self.buf, mopc, dx, Xmm::Xmm0);
                        }
                        VpuUnaryOp::Zero | VpuUnaryOp::One => unreachable!(),
                    }
                    self.fpr.release_spill_locks();
                    return;
                }
                self.fpr.release_spill_locks();
            }
        }

        // Scalar fallback, through temps on bad overlap.
        let dst: Vec<u16> = if bad {
            (0..n).map(|i| TEMP_BASE + i as u16).collect()
        } else {
            d.clone()
        };
        for i in 0..n {
            self.fpr.read_to_scratch(&mut self.buf, s[i], Xmm::Xmm0);
            match op {
                VpuUnaryOp::Mov => {}
                VpuUnaryOp::Neg | VpuUnaryOp::Abs => {
                    emit_movd_rx(&mut self.buf, Reg::Rax, Xmm::Xmm0);
                    if op == VpuUnaryOp::Neg {
                        emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rax, 0x8000_0000u32 as i32);
                    } else {
                        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rax, 0x7fff_ffff);
                    }
                    emit_movd_xr(&mut self.buf, Xmm::Xmm0, Reg::Rax);
                }
                VpuUnaryOp::Zero | VpuUnaryOp::One => unreachable!(),
            }
            let d_x = self.fpr.map_fpr(&mut self.buf, dst[i], MapFlags::NOINIT);
            emit_movaps_rr(&mut self.buf, d_x, Xmm::Xmm0);
        }
        if bad {
            for i in 0..n {
                self.scalar_copy(d[i], TEMP_BASE + i as u16);
            }
        }
    }

    // -- Compare into the vcmp flags --

    fn vpu_cmp(&mut self, cond: VpuCond, sz: VectorSize, vs: u8, vt: u8) {
        let n = sz.len();
        let s = vgroup(vs, sz);
        let t = vgroup(vt, sz);
        let lane_mask = (1u32 << n) - 1;

        let simd_ok = n > 1 && {
            if let Some(sx) = self.fpr.try_map_vec(&mut self.buf, &s, MapFlags::empty()) {
                self.fpr.lock_xmm(sx);
                let tx = if t == s {
                    Some(sx)
                } else {
                    self.fpr.try_map_vec(&mut self.buf, &t, MapFlags::empty())
                };
                match tx {
                    Some(tx) => {
                        let pred = match cond {
                            VpuCond::Eq => CmpPsOp::Eq,
                            VpuCond::Lt => CmpPsOp::Lt,
                            VpuCond::Le => CmpPsOp::Le,
                        };
                        emit_movaps_rr(&mut self.buf, Xmm::Xmm0, sx);
                        emit_cmpps(&mut self.buf, Xmm::Xmm0, tx, pred);
                        emit_movmskps(&mut self.buf, Reg::Rax, Xmm::Xmm0);
                        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rax, lane_mask as i32);
                        self.fpr.release_spill_locks();
                        true
                    }
                    None => {
                        self.fpr.release_spill_locks();
                        false
                    }
                }
            } else {
                false
            }
        };

        if !simd_ok {
            // Scalar fallback: build the lane bits in EDX one compare at
            // a time, with identical NaN behavior.
            emit_mov_ri(&mut self.buf, false, Reg::Rdx, 0);
            for i in 0..n {
                self.fpr.read_to_scratch(&mut self.buf, s[i], Xmm::Xmm0);
                let t_x = self.fpr.map_fpr(&mut self.buf, t[i], MapFlags::empty());
                match cond {
                    VpuCond::Eq => {
                        emit_ucomiss(&mut self.buf, Xmm::Xmm0, t_x);
                        emit_setcc(&mut self.buf, Cond::E, Reg::Rax);
                        emit_setcc(&mut self.buf, Cond::Np, Reg::Rcx);
                        emit_arith_rr(&mut self.buf, ArithOp::And, false, Reg::Rax, Reg::Rcx);
                    }
                    VpuCond::Lt | VpuCond::Le => {
                        // Swapped operands make CF cover unordered.
                        emit_ucomiss(&mut self.buf, t_x, Xmm::Xmm0);
                        let cc = if cond == VpuCond::Lt { Cond::A } else { Cond::Ae };
                        emit_setcc(&mut self.buf, cc, Reg::Rax);
                    }
                }
                emit_ext_rr(&mut self.buf, OPC_MOVZBL, Reg::Rax, Reg::Rax);
                if i != 0 {
                    emit_shift_left(&mut self.buf, Reg::Rax, i as u8);
                }
                emit_arith_rr(&mut self.buf, ArithOp::Or, false, Reg::Rdx, Reg::Rax);
            }
            emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rdx);
        }

        // EAX holds the lane bits; derive any/all and store.
        emit_mov_ri(&mut self.buf, false, Reg::Rcx, 0);
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, lane_mask as i32);
        emit_setcc(&mut self.buf, Cond::E, Reg::Rcx);
        emit_shift_left(&mut self.buf, Reg::Rcx, 5);
        debug_assert_eq!(1u32 << 5, VCMP_ALL);
        emit_mov_ri(&mut self.buf, false, Reg::Rdx, 0);
        vex_backend::x86_64::emitter::emit_test_rr(&mut self.buf, Reg::Rax, Reg::Rax);
        emit_setcc(&mut self.buf, Cond::Ne, Reg::Rdx);
        emit_shift_left(&mut self.buf, Reg::Rdx, 4);
        debug_assert_eq!(1u32 << 4, VCMP_ANY);
        emit_arith_rr(&mut self.buf, ArithOp::Or, false, Reg::Rax, Reg::Rcx);
        emit_arith_rr(&mut self.buf, ArithOp::Or, false, Reg::Rax, Reg::Rdx);
        emit_store(&mut self.buf, false, Reg::Rax, CTX, offsets::vcmp());
    }

    // -- GPR transfers --

    fn vpu_xfer(&mut self, to_vpu: bool, rt: u8, vreg: u8) {
        let idx = velem(vreg);
        if to_vpu {
            if self.gpr.is_imm(rt) {
                let v = self.gpr.get_imm(rt);
                let x = self.fpr.map_fpr(&mut self.buf, idx, MapFlags::NOINIT);
                emit_mov_ri(&mut self.buf, false, Reg::Rax, v as u64);
                emit_movd_xr(&mut self.buf, x, Reg::Rax);
                return;
            }
            let rt_h = self.map_reg(rt, MapFlags::empty());
            let x = self.fpr.map_fpr(&mut self.buf, idx, MapFlags::NOINIT);
            emit_movd_xr(&mut self.buf, x, rt_h);
        } else {
            if rt == REG_ZERO {
                return;
            }
            let x = self.fpr.map_fpr(&mut self.buf, idx, MapFlags::empty());
            let rt_h = self.map_reg(rt, MapFlags::NOINIT);
            emit_movd_rx(&mut self.buf, rt_h, x);
        }
    }

    // -- Vector loads/stores --

    pub(crate) fn comp_vpu_mem(&mut self, cpu: &mut CpuState, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::VPU) || self.jo.disabled(JitDisable::LSU) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::LoadVpu { vt, base, offset, quad: false } => {
                self.guarded_read(
                    cpu,
                    base,
                    offset as i32,
                    crate::safemem::ReadKind::W32,
                    !3,
                );
                let idx = velem(vt);
                let x = self.fpr.map_fpr(&mut self.buf, idx, MapFlags::NOINIT);
                emit_movd_xr(&mut self.buf, x, Reg::Rax);
            }
            Instr::StoreVpu { vt, base, offset, quad: false } => {
                let idx = velem(vt);
                self.fpr.flush_reg(&mut self.buf, idx);
                self.guarded_write(
                    cpu,
                    base,
                    offset as i32,
                    crate::safemem::WriteKind::W32,
                    !3,
                    crate::safemem::StoreSrc::FprHome(idx),
                );
            }
            Instr::LoadVpu { vt, base, offset, quad: true } => {
                self.vpu_load_quad(cpu, vt, base, offset as i32)
            }
            Instr::StoreVpu { vt, base, offset, quad: true } => {
                self.vpu_store_quad(cpu, vt, base, offset as i32)
            }
            _ => unreachable!(),
        }
    }

    fn vpu_load_quad(&mut self, cpu: &CpuState, vt: u8, base: u8, offset: i32) {
        let group = vgroup(vt, VectorSize::Quad);
        let mask = (cpu.ram_size - 1) as i32;

        match self.guest_addr(cpu, base, offset, !15) {
            crate::safemem::GuestAddr::ConstIn(addr) => {
                let disp = (addr & mask as u32) as i32;
                if let Some(dx) = self.fpr.try_map_vec(&mut self.buf, &group, MapFlags::NOINIT) {
                    emit_movups_load(&mut self.buf, dx, MEMBASE, disp);
                } else {
                    // Aliased group: go through the homes.
                    for &g in &group {
                        self.fpr.flush_reg(&mut self.buf, g);
                    }
                    emit_movups_load(&mut self.buf, Xmm::Xmm0, MEMBASE, disp);
                    self.store_lanes_to_homes(&group);
                }
            }
            crate::safemem::GuestAddr::ConstOut(addr) => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_ri(&mut self.buf, false, Reg::Rsi, addr as u64);
                emit_call_abs(&mut self.buf, self.cb.read32 as usize);
                self.js.after_op_state_check = true;
            }
            crate::safemem::GuestAddr::Dyn if self.jo.fast_memory => {
                emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, mask);
                if let Some(dx) = self.fpr.try_map_vec(&mut self.buf, &group, MapFlags::NOINIT) {
                    emit_movups_load_sib(&mut self.buf, dx, MEMBASE, Reg::Rcx, 0);
                } else {
                    for &g in &group {
                        self.fpr.flush_reg(&mut self.buf, g);
                    }
                    emit_movups_load_sib(&mut self.buf, Xmm::Xmm0, MEMBASE, Reg::Rcx, 0);
                    self.store_lanes_to_homes(&group);
                }
            }
            crate::safemem::GuestAddr::Dyn => {
                // Checked path works through the homes: nothing may stay
                // register-resident across the slow call, and a faulting
                // access must leave the registers untouched.
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
                emit_arith_ri(&mut self.buf, ArithOp::Sub, false, Reg::Rax, cpu.ram_base as i32);
                emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, cpu.ram_size as i32);
                let outside = emit_jcc_fwd(&mut self.buf, Cond::Ae);
                emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, mask);
                emit_movups_load_sib(&mut self.buf, Xmm::Xmm0, MEMBASE, Reg::Rcx, 0);
                self.store_lanes_to_homes(&group);
                let done = emit_jmp_fwd(&mut self.buf);
                set_jump_target(&mut self.buf, outside);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
                emit_call_abs(&mut self.buf, self.cb.read32 as usize);
                set_jump_target(&mut self.buf, done);
                self.js.after_op_state_check = true;
            }
        }
    }

    fn vpu_store_quad(&mut self, cpu: &CpuState, vt: u8, base: u8, offset: i32) {
        let group = vgroup(vt, VectorSize::Quad);
        let mask = (cpu.ram_size - 1) as i32;

        match self.guest_addr(cpu, base, offset, !15) {
            crate::safemem::GuestAddr::ConstIn(addr) => {
                let disp = (addr & mask as u32) as i32;
                if let Some(sx) = self.fpr.try_map_vec(&mut self.buf, &group, MapFlags::empty()) {
                    emit_movups_store(&mut self.buf, sx, MEMBASE, disp);
                } else {
                    for &g in &group {
                        self.fpr.flush_reg(&mut self.buf, g);
                    }
                    self.load_lanes_from_homes(&group);
                    emit_movups_store(&mut self.buf, Xmm::Xmm0, MEMBASE, disp);
                }
            }
            crate::safemem::GuestAddr::ConstOut(addr) => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::fpr(group[0]));
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_ri(&mut self.buf, false, Reg::Rsi, addr as u64);
                emit_call_abs(&mut self.buf, self.cb.write32 as usize);
                self.js.after_op_state_check = true;
            }
            crate::safemem::GuestAddr::Dyn if self.jo.fast_memory => {
                emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, mask);
                if let Some(sx) = self.fpr.try_map_vec(&mut self.buf, &group, MapFlags::empty()) {
                    emit_movups_store_sib(&mut self.buf, sx, MEMBASE, Reg::Rcx, 0);
                } else {
                    for &g in &group {
                        self.fpr.flush_reg(&mut self.buf, g);
                    }
                    self.load_lanes_from_homes(&group);
                    emit_movups_store_sib(&mut self.buf, Xmm::Xmm0, MEMBASE, Reg::Rcx, 0);
                }
            }
            crate::safemem::GuestAddr::Dyn => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
                emit_arith_ri(&mut self.buf, ArithOp::Sub, false, Reg::Rax, cpu.ram_base as i32);
                emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, cpu.ram_size as i32);
                let outside = emit_jcc_fwd(&mut self.buf, Cond::Ae);
                self.load_lanes_from_homes(&group);
                emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, mask);
                emit_movups_store_sib(&mut self.buf, Xmm::Xmm0, MEMBASE, Reg::Rcx, 0);
                let done = emit_jmp_fwd(&mut self.buf);
                set_jump_target(&mut self.buf, outside);
                // Any write to the bad address reports the fault; the
                // value is immaterial.
                emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::fpr(group[0]));
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
                emit_call_abs(&mut self.buf, self.cb.write32 as usize);
                set_jump_target(&mut self.buf, done);
                self.js.after_op_state_check = true;
            }
        }
    }

    /// Spread XMM0's four lanes over the group's home slots.
    fn store_lanes_to_homes(&mut self, group: &[u16]) {
        emit_movss_store(&mut self.buf, Xmm::Xmm0, CTX, offsets::fpr(group[0]));
        for (i, &g) in group.iter().enumerate().skip(1) {
            emit_extractps_store(&mut self.buf, Xmm::Xmm0, CTX, offsets::fpr(g), i as u8);
        }
    }

    /// Gather the group's home slots into XMM0's lanes.
    fn load_lanes_from_homes(&mut self, group: &[u16]) {
        emit_movss_load(&mut self.buf, Xmm::Xmm0, CTX, offsets::fpr(group[0]));
        for (i, &g) in group.iter().enumerate().skip(1) {
            emit_insertps_load(&mut self.buf, Xmm::Xmm0, CTX, offsets::fpr(g), i as u8);
        }
    }
}

fn emit_shift_left(buf: &mut vex_backend::CodeArena, reg: Reg, n: u8) {
    vex_backend::x86_64::emitter::emit_shift_ri(
        buf,
        vex_backend::x86_64::emitter::ShiftOp::Shl,
        false,
        reg,
        n,
    );
}
