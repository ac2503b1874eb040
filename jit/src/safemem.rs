//! Guarded guest memory access emission.
//!
//! Each access is a tiny two-state machine: a Fast form (compile-time
//! constant address inside RAM, or fast-memory mode masking the address
//! into the window) emits one direct host access off the membase register;
//! the Checked form range-checks at run time and falls back to the
//! address-validating accessor functions, with both paths converging.
//! Checked accesses flush the register caches first, so the guest state is
//! fully observable in memory if the access faults.

use vex_backend::x86_64::emitter::{
    emit_arith_ri, emit_call_abs, emit_ext_load_sib, emit_ext_rr, emit_jcc_fwd, emit_jmp_fwd,
    emit_load, emit_load_sib, emit_mov_ri, emit_mov_rr, emit_store16_sib, emit_store8_sib,
    emit_store_imm, emit_store_sib, set_jump_target, ArithOp, Cond, OPC_MOVSBL, OPC_MOVSWL,
    OPC_MOVZBL, OPC_MOVZWL,
};
use vex_backend::x86_64::{Reg, CTX, MEMBASE};
use vex_core::state::CpuState;

use crate::compiler::Jit;
use crate::gpr::MapFlags;
use crate::offsets;

/// Result width and extension of a guarded read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadKind {
    U8,
    S8,
    U16,
    S16,
    W32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteKind {
    B8,
    H16,
    W32,
}

/// Where a guarded store's value comes from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StoreSrc {
    Imm(u32),
    Gpr(u8),
    /// Float-space home slot; the caller has already flushed it.
    FprHome(u16),
}

/// Where the effective address ended up.
pub(crate) enum GuestAddr {
    /// Compile-time constant inside the RAM window.
    ConstIn(u32),
    /// Compile-time constant outside it: always the slow path.
    ConstOut(u32),
    /// Run-time value in ECX (unmasked guest address).
    Dyn,
}

impl Jit {
    /// Compute base+offset, applying `align_mask`. Constant bases fold
    /// completely; otherwise the address materializes in ECX.
    pub(crate) fn guest_addr(
        &mut self,
        cpu: &CpuState,
        base: u8,
        offset: i32,
        align_mask: u32,
    ) -> GuestAddr {
        if self.gpr.is_imm(base) {
            let addr = self.gpr.get_imm(base).wrapping_add(offset as u32) & align_mask;
            if cpu.addr_valid(addr) {
                return GuestAddr::ConstIn(addr);
            }
            return GuestAddr::ConstOut(addr);
        }
        let base_h = self.map_reg(base, MapFlags::empty());
        emit_mov_rr(&mut self.buf, false, Reg::Rcx, base_h);
        if offset != 0 {
            emit_arith_ri(&mut self.buf, ArithOp::Add, false, Reg::Rcx, offset);
        }
        if align_mask != u32::MAX {
            emit_arith_ri(&mut self.buf, ArithOp::And, false, Reg::Rcx, align_mask as i32);
        }
        GuestAddr::Dyn
    }

    fn read_accessor(&self, kind: ReadKind) -> usize {
        match kind {
            ReadKind::U8 | ReadKind::S8 => self.cb.read8 as usize,
            ReadKind::U16 | ReadKind::S16 => self.cb.read16 as usize,
            ReadKind::W32 => self.cb.read32 as usize,
        }
    }

    fn write_accessor(&self, kind: WriteKind) -> usize {
        match kind {
            WriteKind::B8 => self.cb.write8 as usize,
            WriteKind::H16 => self.cb.write16 as usize,
            WriteKind::W32 => self.cb.write32 as usize,
        }
    }

    fn emit_direct_load(&mut self, kind: ReadKind, index: Reg, disp: i32) {
        match kind {
            ReadKind::U8 | ReadKind::S8 => {
                emit_ext_load_sib(&mut self.buf, OPC_MOVZBL, Reg::Rax, MEMBASE, index, disp)
            }
            ReadKind::U16 | ReadKind::S16 => {
                emit_ext_load_sib(&mut self.buf, OPC_MOVZWL, Reg::Rax, MEMBASE, index, disp)
            }
            ReadKind::W32 => emit_load_sib(&mut self.buf, false, Reg::Rax, MEMBASE, index, 0, disp),
        }
    }

    fn emit_sign_fixup(&mut self, kind: ReadKind) {
        match kind {
            ReadKind::S8 => emit_ext_rr(&mut self.buf, OPC_MOVSBL, Reg::Rax, Reg::Rax),
            ReadKind::S16 => emit_ext_rr(&mut self.buf, OPC_MOVSWL, Reg::Rax, Reg::Rax),
            _ => {}
        }
    }

    /// Range check of the guest address in ECX; returns the fixup taken
    /// when the address is outside RAM.
    fn emit_range_check(
        &mut self,
        cpu: &CpuState,
    ) -> vex_backend::x86_64::emitter::FixupBranch {
        emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
        emit_arith_ri(&mut self.buf, ArithOp::Sub, false, Reg::Rax, cpu.ram_base as i32);
        emit_arith_ri(&mut self.buf, ArithOp::Cmp, false, Reg::Rax, cpu.ram_size as i32);
        emit_jcc_fwd(&mut self.buf, Cond::Ae)
    }

    /// Emit a guarded read of `kind` at base+offset (with `align_mask`);
    /// the result lands in EAX with the requested extension. The register
    /// caches are flushed whenever the access can fault.
    pub(crate) fn guarded_read(
        &mut self,
        cpu: &CpuState,
        base: u8,
        offset: i32,
        kind: ReadKind,
        align_mask: u32,
    ) {
        match self.guest_addr(cpu, base, offset, align_mask) {
            GuestAddr::ConstIn(addr) => {
                let disp = (addr & (cpu.ram_size - 1)) as i32;
                // Index register unused; fold the whole address into the
                // displacement off membase.
                match kind {
                    ReadKind::U8 | ReadKind::S8 => {
                        vex_backend::x86_64::emitter::emit_ext_load(
                            &mut self.buf,
                            OPC_MOVZBL,
                            Reg::Rax,
                            MEMBASE,
                            disp,
                        );
                    }
                    ReadKind::U16 | ReadKind::S16 => {
                        vex_backend::x86_64::emitter::emit_ext_load(
                            &mut self.buf,
                            OPC_MOVZWL,
                            Reg::Rax,
                            MEMBASE,
                            disp,
                        );
                    }
                    ReadKind::W32 => {
                        emit_load(&mut self.buf, false, Reg::Rax, MEMBASE, disp);
                    }
                }
            }
            GuestAddr::ConstOut(addr) => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_ri(&mut self.buf, false, Reg::Rsi, addr as u64);
                let acc = self.read_accessor(kind);
                emit_call_abs(&mut self.buf, acc);
                self.js.after_op_state_check = true;
            }
            GuestAddr::Dyn if self.jo.fast_memory => {
                emit_arith_ri(
                    &mut self.buf,
                    ArithOp::And,
                    false,
                    Reg::Rcx,
                    (cpu.ram_size - 1) as i32,
                );
                self.emit_direct_load(kind, Reg::Rcx, 0);
            }
            GuestAddr::Dyn => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                let outside = self.emit_range_check(cpu);
                emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
                emit_arith_ri(
                    &mut self.buf,
                    ArithOp::And,
                    false,
                    Reg::Rax,
                    (cpu.ram_size - 1) as i32,
                );
                self.emit_direct_load(kind, Reg::Rax, 0);
                let done = emit_jmp_fwd(&mut self.buf);
                set_jump_target(&mut self.buf, outside);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
                let acc = self.read_accessor(kind);
                emit_call_abs(&mut self.buf, acc);
                set_jump_target(&mut self.buf, done);
                self.js.after_op_state_check = true;
            }
        }
        self.emit_sign_fixup(kind);
    }

    /// Load the store value into EDX for the checked/slow paths. Only
    /// valid after a flush (register homes are authoritative).
    fn emit_value_to_edx(&mut self, src: StoreSrc) {
        match src {
            StoreSrc::Imm(v) => emit_mov_ri(&mut self.buf, false, Reg::Rdx, v as u64),
            StoreSrc::Gpr(r) => emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::gpr(r)),
            StoreSrc::FprHome(i) => {
                emit_load(&mut self.buf, false, Reg::Rdx, CTX, offsets::fpr(i))
            }
        }
    }

    fn emit_direct_store_edx(&mut self, kind: WriteKind, index: Reg) {
        match kind {
            WriteKind::B8 => emit_store8_sib(&mut self.buf, Reg::Rdx, MEMBASE, index, 0),
            WriteKind::H16 => emit_store16_sib(&mut self.buf, Reg::Rdx, MEMBASE, index, 0),
            WriteKind::W32 => emit_store_sib(&mut self.buf, false, Reg::Rdx, MEMBASE, index, 0, 0),
        }
    }

    /// Emit a guarded store. Before any path that can fault, the current
    /// guest PC is written back so a fault reports an accurate address.
    pub(crate) fn guarded_write(
        &mut self,
        cpu: &CpuState,
        base: u8,
        offset: i32,
        kind: WriteKind,
        align_mask: u32,
        src: StoreSrc,
    ) {
        match self.guest_addr(cpu, base, offset, align_mask) {
            GuestAddr::ConstIn(addr) => {
                let disp = (addr & (cpu.ram_size - 1)) as i32;
                match src {
                    StoreSrc::Gpr(r) if !self.gpr.is_imm(r) => {
                        let r_h = self.map_reg(r, MapFlags::empty());
                        match kind {
                            WriteKind::B8 => {
                                vex_backend::x86_64::emitter::emit_store8(
                                    &mut self.buf,
                                    r_h,
                                    MEMBASE,
                                    disp,
                                );
                            }
                            WriteKind::H16 => {
                                vex_backend::x86_64::emitter::emit_store16(
                                    &mut self.buf,
                                    r_h,
                                    MEMBASE,
                                    disp,
                                );
                            }
                            WriteKind::W32 => {
                                vex_backend::x86_64::emitter::emit_store(
                                    &mut self.buf,
                                    false,
                                    r_h,
                                    MEMBASE,
                                    disp,
                                );
                            }
                        }
                    }
                    _ => {
                        self.emit_value_to_edx(self.resolve_imm_src(src));
                        emit_mov_ri(&mut self.buf, false, Reg::Rcx, disp as u64);
                        self.emit_direct_store_edx(kind, Reg::Rcx);
                    }
                }
            }
            GuestAddr::ConstOut(addr) => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                self.emit_value_to_edx(src);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_ri(&mut self.buf, false, Reg::Rsi, addr as u64);
                let acc = self.write_accessor(kind);
                emit_call_abs(&mut self.buf, acc);
                self.js.after_op_state_check = true;
            }
            GuestAddr::Dyn if self.jo.fast_memory => {
                emit_arith_ri(
                    &mut self.buf,
                    ArithOp::And,
                    false,
                    Reg::Rcx,
                    (cpu.ram_size - 1) as i32,
                );
                match src {
                    StoreSrc::Gpr(r) if !self.gpr.is_imm(r) => {
                        let r_h = self.map_reg(r, MapFlags::empty());
                        emit_mov_rr(&mut self.buf, false, Reg::Rdx, r_h);
                    }
                    other => self.emit_value_to_edx(self.resolve_imm_src(other)),
                }
                self.emit_direct_store_edx(kind, Reg::Rcx);
            }
            GuestAddr::Dyn => {
                self.flush_all();
                emit_store_imm(&mut self.buf, CTX, offsets::pc(), self.js.compiler_pc);
                self.emit_value_to_edx(src);
                let outside = self.emit_range_check(cpu);
                emit_mov_rr(&mut self.buf, false, Reg::Rax, Reg::Rcx);
                emit_arith_ri(
                    &mut self.buf,
                    ArithOp::And,
                    false,
                    Reg::Rax,
                    (cpu.ram_size - 1) as i32,
                );
                self.emit_direct_store_edx(kind, Reg::Rax);
                let done = emit_jmp_fwd(&mut self.buf);
                set_jump_target(&mut self.buf, outside);
                emit_mov_rr(&mut self.buf, true, Reg::Rdi, CTX);
                emit_mov_rr(&mut self.buf, false, Reg::Rsi, Reg::Rcx);
                let acc = self.write_accessor(kind);
                emit_call_abs(&mut self.buf, acc);
                set_jump_target(&mut self.buf, done);
                self.js.after_op_state_check = true;
            }
        }
    }

    /// Known-immediate GPR values become literal immediates so the fast
    /// paths can use them without a register home.
    fn resolve_imm_src(&self, src: StoreSrc) -> StoreSrc {
        match src {
            StoreSrc::Gpr(r) if self.gpr.is_imm(r) => StoreSrc::Imm(self.gpr.get_imm(r)),
            other => other,
        }
    }
}
