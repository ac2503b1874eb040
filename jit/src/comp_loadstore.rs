//! Integer and scalar-float load/store translators, including the
//! unaligned left/right pairs.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_load, emit_mov_ri, emit_mov_rr, emit_movd_xr, emit_shift_cl,
    emit_shift_ri, emit_store, ArithOp, ShiftOp,
};
use vex_backend::x86_64::{Reg, CTX};
use vex_core::decode::{Instr, LoadOp, StoreOp};
use vex_core::state::{CpuState, REG_ZERO};

use crate::compiler::Jit;
use crate::gpr::MapFlags;
use crate::offsets;
use crate::options::JitDisable;
use crate::safemem::{ReadKind, StoreSrc, WriteKind};

impl Jit {
    pub(crate) fn comp_loadstore(&mut self, cpu: &mut CpuState, instr: Instr, word: u32) {
        if self.jo.disabled(JitDisable::LSU) {
            return self.comp_generic(word);
        }
        match instr {
            Instr::Load { op, rt, base, offset } => match op {
                LoadOp::Lwl | LoadOp::Lwr => self.comp_load_lr(cpu, op, rt, base, offset, word),
                _ => self.comp_load(cpu, op, rt, base, offset),
            },
            Instr::Store { op, rt, base, offset } => match op {
                StoreOp::Swl | StoreOp::Swr => self.comp_store_lr(cpu, op, rt, base, offset, word),
                _ => self.comp_store(cpu, op, rt, base, offset),
            },
            Instr::LoadFpu { ft, base, offset } => {
                self.guarded_read(cpu, base, offset as i32, ReadKind::W32, u32::MAX);
                let xmm = self.fpr.map_fpr(&mut self.buf, ft as u16, MapFlags::NOINIT);
                emit_movd_xr(&mut self.buf, xmm, Reg::Rax);
            }
            Instr::StoreFpu { ft, base, offset } => {
                // Value goes through its home slot; works on every path.
                self.fpr.flush_reg(&mut self.buf, ft as u16);
                self.guarded_write(
                    cpu,
                    base,
                    offset as i32,
                    WriteKind::W32,
                    u32::MAX,
                    StoreSrc::FprHome(ft as u16),
                );
            }
            _ => unreachable!(),
        }
    }

    fn comp_load(&mut self, cpu: &CpuState, op: LoadOp, rt: u8, base: u8, offset: i16) {
        let kind = match op {
            LoadOp::Lb => ReadKind::S8,
            LoadOp::Lbu => ReadKind::U8,
            LoadOp::Lh => ReadKind::S16,
            LoadOp::Lhu => ReadKind::U16,
            LoadOp::Lw => ReadKind::W32,
            LoadOp::Lwl | LoadOp::Lwr => unreachable!(),
        };
        self.guarded_read(cpu, base, offset as i32, kind, u32::MAX);
        // A load into $0 still performs the access (it can fault); only
        // the register write disappears.
        if rt != REG_ZERO {
            let rt_h = self.map_reg(rt, MapFlags::NOINIT);
            emit_mov_rr(&mut self.buf, false, rt_h, Reg::Rax);
        }
    }

    fn comp_store(&mut self, cpu: &CpuState, op: StoreOp, rt: u8, base: u8, offset: i16) {
        let kind = match op {
            StoreOp::Sb => WriteKind::B8,
            StoreOp::Sh => WriteKind::H16,
            StoreOp::Sw => WriteKind::W32,
            StoreOp::Swl | StoreOp::Swr => unreachable!(),
        };
        self.guarded_write(cpu, base, offset as i32, kind, u32::MAX, StoreSrc::Gpr(rt));
    }

    /// lwl/lwr. An adjacent pair covering one unaligned word is fused
    /// into a single access; a lone half reconstructs through shifts.
    fn comp_load_lr(&mut self, cpu: &mut CpuState, op: LoadOp, rt: u8, base: u8, offset: i16, word: u32) {
        if self.jo.disabled(JitDisable::LSU_UNALIGNED) {
            return self.comp_generic(word);
        }

        // Pair fusion: `lwl rt, X(base); lwr rt, X-3(base)` loads the
        // word at X-3. Requires base != rt (the unfused second half
        // would otherwise see a partially merged base) and must not
        // straddle a delay slot.
        if op == LoadOp::Lwl && !self.js.in_delay_slot && base != rt {
            let next = self.an.instr_at(self.js.compiler_pc.wrapping_add(4));
            if let Some(Instr::Load { op: LoadOp::Lwr, rt: rt2, base: base2, offset: offset2 }) = next {
                if rt2 == rt && base2 == base && offset2 == offset.wrapping_sub(3) {
                    self.guarded_read(cpu, base, offset as i32 - 3, ReadKind::W32, u32::MAX);
                    if rt != REG_ZERO {
                        let rt_h = self.map_reg(rt, MapFlags::NOINIT);
                        emit_mov_rr(&mut self.buf, false, rt_h, Reg::Rax);
                    }
                    self.eat_instruction();
                    return;
                }
            }
        }

        // Lone half: keep the unaligned address around, read the aligned
        // word, then shift-merge with the old register value.
        match self.guest_addr(cpu, base, offset as i32, u32::MAX) {
            crate::safemem::GuestAddr::ConstIn(addr) | crate::safemem::GuestAddr::ConstOut(addr) => {
                emit_mov_ri(&mut self.buf, false, Reg::Rcx, addr as u64);
            }
            crate::safemem::GuestAddr::Dyn => {}
        }
        emit_store(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        // Nothing may stay resident across the slow-path call.
        self.flush_all();
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, !3i32);
        self.guarded_read_at_ecx(cpu, ReadKind::W32);
        // ECX = shift = (addr & 3) * 8
        emit_load(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, 3);
        emit_shift_ri(&mut self.buf, ShiftOp::Shl, false, Reg::Rcx, 3);

        if rt == REG_ZERO {
            return;
        }
        emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::gpr(rt));
        match op {
            LoadOp::Lwl => {
                // rt = (rt & (0x00ffffff >> shift)) | (mem << (24 - shift))
                emit_mov_ri(&mut self.buf, true, Reg::Rdi, 0x00ff_ffff);
                emit_shift_cl(&mut self.buf, ShiftOp::Shr, false, Reg::Rdi);
                emit_arith_rr_and(&mut self.buf, Reg::Rdx, Reg::Rdi);
                // 24 - shift == shift ^ 24 for byte-granular shifts.
                emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rcx, 24);
                emit_shift_cl(&mut self.buf, ShiftOp::Shl, false, Reg::Rax);
                emit_arith_rr_or(&mut self.buf, Reg::Rax, Reg::Rdx);
            }
            LoadOp::Lwr => {
                // rt = (rt & (0xffffff00 << (24 - shift))) | (mem >> shift)
                emit_shift_cl(&mut self.buf, ShiftOp::Shr, false, Reg::Rax);
                emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rcx, 24);
                emit_mov_ri(&mut self.buf, true, Reg::Rdi, 0xffff_ff00);
                emit_shift_cl(&mut self.buf, ShiftOp::Shl, false, Reg::Rdi);
                emit_arith_rr_and(&mut self.buf, Reg::Rdx, Reg::Rdi);
                emit_arith_rr_or(&mut self.buf, Reg::Rax, Reg::Rdx);
            }
            _ => unreachable!(),
        }
        emit_store(&mut self.buf, false, Reg::Rax, CTX, offsets::gpr(rt));
    }

    /// swl/swr, mirroring the load pair handling.
    fn comp_store_lr(&mut self, cpu: &mut CpuState, op: StoreOp, rt: u8, base: u8, offset: i16, word: u32) {
        if self.jo.disabled(JitDisable::LSU_UNALIGNED) {
            return self.comp_generic(word);
        }

        if op == StoreOp::Swl && !self.js.in_delay_slot {
            let next = self.an.instr_at(self.js.compiler_pc.wrapping_add(4));
            if let Some(Instr::Store { op: StoreOp::Swr, rt: rt2, base: base2, offset: offset2 }) = next {
                if rt2 == rt && base2 == base && offset2 == offset.wrapping_sub(3) {
                    self.guarded_write(
                        cpu,
                        base,
                        offset as i32 - 3,
                        WriteKind::W32,
                        u32::MAX,
                        StoreSrc::Gpr(rt),
                    );
                    self.eat_instruction();
                    return;
                }
            }
        }

        // Lone half: read-modify-write of the aligned word.
        match self.guest_addr(cpu, base, offset as i32, u32::MAX) {
            crate::safemem::GuestAddr::ConstIn(addr) | crate::safemem::GuestAddr::ConstOut(addr) => {
                emit_mov_ri(&mut self.buf, false, Reg::Rcx, addr as u64);
            }
            crate::safemem::GuestAddr::Dyn => {}
        }
        emit_store(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        // Nothing may stay resident across the slow-path call.
        self.flush_all();
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, !3i32);
        self.guarded_read_at_ecx(cpu, ReadKind::W32);
        emit_load(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, 3);
        emit_shift_ri(&mut self.buf, ShiftOp::Shl, false, Reg::Rcx, 3);

        emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::gpr(rt));
        match op {
            StoreOp::Swl => {
                // mem = (rt >> (24 - shift)) | (mem & (0xffffff00 << shift))
                emit_mov_ri(&mut self.buf, true, Reg::Rdi, 0xffff_ff00);
                emit_shift_cl(&mut self.buf, ShiftOp::Shl, false, Reg::Rdi);
                emit_arith_rr_and(&mut self.buf, Reg::Rax, Reg::Rdi);
                emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rcx, 24);
                emit_shift_cl(&mut self.buf, ShiftOp::Shr, false, Reg::Rdx);
                emit_arith_rr_or(&mut self.buf, Reg::Rax, Reg::Rdx);
            }
            StoreOp::Swr => {
                // mem = (rt << shift) | (mem & (0x00ffffff >> (24 - shift)))
                emit_shift_cl(&mut self.buf, ShiftOp::Shl, false, Reg::Rdx);
                emit_arith_ri(&mut self.buf, ArithOp::Xor, false, Reg::Rcx, 24);
                emit_mov_ri(&mut self.buf, true, Reg::Rdi, 0x00ff_ffff);
                emit_shift_cl(&mut self.buf, ShiftOp::Shr, false, Reg::Rdi);
                emit_arith_rr_and(&mut self.buf, Reg::Rax, Reg::Rdi);
                emit_arith_rr_or(&mut self.buf, Reg::Rax, Reg::Rdx);
            }
            _ => unreachable!(),
        }
        // Write the merged word back to the aligned address.
        emit_load(&mut self.buf, false, Reg::Rcx, CTX, offsets::scratch_jump());
        emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, !3i32);
        emit_mov_rr(&mut self.buf, false, Reg::Rdx, Reg::Rax);
        self.guarded_write_at_ecx(cpu, WriteKind::W32);
    }

}

fn emit_arith_rr_and(buf: &mut vex_backend::CodeArena, dst: Reg, src: Reg) {
    vex_backend::x86_64::emitter::emit_arith_rr(buf, ArithOp::And, false, dst, src);
}

fn emit_arith_rr_or(buf: &mut vex_backend::CodeArena, dst: Reg, src: Reg) {
    vex_backend::x86_64::emitter::emit_arith_rr(buf, ArithOp::Or, false, dst, src);
}

// Dead simple helper used by the unaligned paths: a guarded read/write
// whose address is already in ECX.
impl Jit {
    pub(crate) fn guarded_read_at_ecx(&mut self, cpu: &CpuState, kind: ReadKind) {
        use vex_backend::x86_64::emitter::{emit_jmp_fwd, set_jump_target};
        if self.jo.fast_memory {
            emit_arith_ri(
                &mut self.buf,
                ArithOp::And,
                false,
                Reg::Rcx,
                (cpu.ram_size - 1) as i32,
            );
            self.read_direct_at(kind, Reg::Rcx);
            return;
        }
        // Caches are already flushed by the callers.
        vex_backend::x86_64::emitter::emit_store_imm(
            &mut self.buf,
            CTX,
            offsets::pc(),
            self.js.compiler_pc,
        );
        let outside = self.range_check_ecx(cpu);
        emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
        emit_arith_ri(
            &mut self.buf,
            ArithOp::And,
            false,
            Reg::Rax,
            (cpu.ram_size - 1) as i32,
        );
        self.read_direct_at(kind, Reg::Rax);
        let done = emit_jmp_fwd(&mut self.buf);
        set_jump_target(&mut self.buf, outside);
        // ECX dies in the call; callers reload the unaligned address
        // from its save slot afterwards.
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
        emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
        let accessor = match kind {
            ReadKind::U8 | ReadKind::S8 => self.cb.read8 as usize,
            ReadKind::U16 | ReadKind::S16 => self.cb.read16 as usize,
            ReadKind::W32 => self.cb.read32 as usize,
        };
        emit_call_abs_local(&mut self.buf, accessor);
        set_jump_target(&mut self.buf, done);
        self.js.after_op_state_check = true;
    }

    pub(crate) fn guarded_write_at_ecx(&mut self, cpu: &CpuState, kind: WriteKind) {
        use vex_backend::x86_64::emitter::{emit_jmp_fwd, set_jump_target};
        if self.jo.fast_memory {
            emit_arith_ri(
                &mut self.buf,
                ArithOp::And,
                false,
                Reg::Rcx,
                (cpu.ram_size - 1) as i32,
            );
            self.write_direct_edx_at(kind, Reg::Rcx);
            return;
        }
        vex_backend::x86_64::emitter::emit_store_imm(
            &mut self.buf,
            CTX,
            offsets::pc(),
            self.js.compiler_pc,
        );
        let outside = self.range_check_ecx(cpu);
        emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
        emit_arith_ri(
            &mut self.buf,
            ArithOp::And,
            false,
            Reg::Rax,
            (cpu.ram_size - 1) as i32,
        );
        self.write_direct_edx_at(kind, Reg::Rax);
        let done = emit_jmp_fwd(&mut self.buf);
        set_jump_target(&mut self.buf, outside);
        emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
        emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
        let accessor = match kind {
            WriteKind::B8 => self.cb.write8 as usize,
            WriteKind::H16 => self.cb.write16 as usize,
            WriteKind::W32 => self.cb.write32 as usize,
        };
        emit_call_abs_local(&mut self.buf, accessor);
        set_jump_target(&mut self.buf, done);
        self.js.after_op_state_check = true;
    }

    fn range_check_ecx(&mut self, cpu: &CpuState) -> vex_backend::x86_64::emitter::FixupBranch {
        use vex_backend::x86_64::emitter::emit_jcc_fwd;
        emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
        emit_arith_ri(&mut self.buf, ArithOp::Sub, false, Reg::Rax, cpu.ram_base as i32);
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, cpu.ram_size as i32);
        emit_jcc_fwd(&mut self.buf, vex_backend::x86_64::Cond::Ae)
    }

    fn read_direct_at(&mut self, kind: ReadKind, index: Reg) {
        use vex_backend::x86_64::emitter::{
            emit_ext_load_sib, emit_load_sib, OPC_MOVZBL as ZB, OPC_MOVZWL as ZW,
        };
        match kind {
            ReadKind::U8 | ReadKind::S8 => {
                emit_ext_load_sib(&mut self.buf, ZB, Reg::Rax, vex_backend::x86_64::MEMBASE, index, 0)
            }
            ReadKind::U16 | ReadKind::S16 => {
                emit_ext_load_sib(&mut self.buf, ZW, Reg::Rax, vex_backend::x86_64::MEMBASE, index, 0)
            }
            ReadKind::W32 => emit_load_sib(
                &mut self.buf,
                false,
                Reg::Rax,
                vex_backend::x86_64::MEMBASE,
                index,
                0,
                0,
            ),
        }
    }

    fn write_direct_edx_at(&mut self, kind: WriteKind, index: Reg) {
        use vex_backend::x86_64::emitter::{emit_store16_sib, emit_store8_sib, emit_store_sib};
        match kind {
            WriteKind::B8 => {
                emit_store8_sib(&mut self.buf, Reg::Rdx, vex_backend::x86_64::MEMBASE, index, 0)
            }
            WriteKind::H16 => {
                emit_store16_sib(&mut self.buf, Reg::Rdx, vex_backend::x86_64::MEMBASE, index, 0)
            }
            WriteKind::W32 => emit_store_sib(
                &mut self.buf,
                false,
                Reg::Rdx,
                vex_backend::x86_64::MEMBASE,
                index,
                0,
                0,
            ),
        }
    }
}

fn emit_call_abs_local(buf: &mut vex_backend::CodeArena, target: usize) {
    vex_backend::x86_64::emitter::emit_call_abs(buf, target)
}
