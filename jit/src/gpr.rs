//! General-purpose register cache.
//!
//! Maps guest integer registers (plus HI/LO) to host registers or to
//! known-immediate values. The host-slot table owns residency; each guest
//! register holds only a back-reference to its slot, so the two views
//! cannot drift apart without `sanity_check` catching it.

use bitflags::bitflags;
use vex_backend::x86_64::emitter::{emit_load, emit_mov_ri, emit_store, emit_store_imm};
use vex_backend::x86_64::{Reg, CTX};
use vex_backend::CodeArena;
use vex_core::state::{GPR_HI, GPR_LO, NUM_GPR_SLOTS, REG_ZERO};

use crate::analyst::{Analysis, LOOKAHEAD_OPS};
use crate::offsets;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// The mapping will be written; mark the slot dirty.
        const DIRTY = 1;
        /// The current value is irrelevant (pure overwrite): skip the load.
        /// Implies DIRTY.
        const NOINIT = 3;
    }
}

/// Host registers handed to the allocator, in allocation preference order.
/// RAX/RCX/RDX stay out: they are the translators' scratch registers
/// (shift counts, mul/div operands, call plumbing).
pub const ALLOC_ORDER: &[Reg] = &[
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::R12,
    Reg::R13,
    Reg::Rbp,
    Reg::Rbx,
];

const NO_HOST: u8 = 0xff;
const NO_GUEST: u8 = 0xff;

/// Where a guest register's authoritative value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Loc {
    /// At its home slot in the guest state block.
    Mem,
    /// In a host register.
    Reg,
    /// In a host register, and the value is also a known immediate.
    RegImm,
    /// A known immediate, materialized nowhere.
    Imm,
}

#[derive(Debug, Clone, Copy)]
struct GuestReg {
    loc: Loc,
    host: u8,
    imm: u32,
    spill_lock: bool,
}

#[derive(Debug, Clone, Copy)]
struct HostSlot {
    guest: u8,
    dirty: bool,
}

/// Snapshot of the allocator bookkeeping (not host register contents).
#[derive(Clone)]
pub struct GprState {
    guest: [GuestReg; NUM_GPR_SLOTS],
    host: [HostSlot; 16],
}

pub struct GprCache {
    guest: [GuestReg; NUM_GPR_SLOTS],
    host: [HostSlot; 16],
}

impl GprCache {
    pub fn new() -> Self {
        let mut cache = Self {
            guest: [GuestReg { loc: Loc::Mem, host: NO_HOST, imm: 0, spill_lock: false };
                NUM_GPR_SLOTS],
            host: [HostSlot { guest: NO_GUEST, dirty: false }; 16],
        };
        cache.guest[REG_ZERO as usize].loc = Loc::Imm;
        cache
    }

    /// Reset for a new block.
    pub fn start(&mut self) {
        *self = Self::new();
    }

    pub fn is_imm(&self, r: u8) -> bool {
        r == REG_ZERO || matches!(self.guest[r as usize].loc, Loc::Imm | Loc::RegImm)
    }

    pub fn get_imm(&self, r: u8) -> u32 {
        if r == REG_ZERO {
            return 0;
        }
        let g = &self.guest[r as usize];
        assert!(
            matches!(g.loc, Loc::Imm | Loc::RegImm),
            "get_imm on non-immediate register {r}"
        );
        g.imm
    }

    pub fn is_mapped(&self, r: u8) -> bool {
        matches!(self.guest[r as usize].loc, Loc::Reg | Loc::RegImm)
    }

    /// Host register currently holding `r`. Panics if not resident.
    pub fn host_reg(&self, r: u8) -> Reg {
        let g = &self.guest[r as usize];
        assert!(matches!(g.loc, Loc::Reg | Loc::RegImm), "register {r} not resident");
        Reg::from_index(g.host)
    }

    /// Discard any residency and record the immediate directly. Later
    /// reads constant-fold instead of generating instructions.
    pub fn set_imm(&mut self, r: u8, val: u32) {
        if r == REG_ZERO {
            if val != 0 {
                tracing::error!(val, "attempt to set an immediate on the zero register");
            }
            return;
        }
        let g = self.guest[r as usize];
        if g.loc == Loc::RegImm && g.imm == val {
            // Already holds that exact value; keep it in the register.
            return;
        }
        if let Loc::Reg | Loc::RegImm = g.loc {
            self.host[g.host as usize] = HostSlot { guest: NO_GUEST, dirty: false };
        }
        self.guest[r as usize] = GuestReg { loc: Loc::Imm, host: NO_HOST, imm: val, spill_lock: g.spill_lock };
    }

    pub fn spill_lock(&mut self, regs: &[u8]) {
        for &r in regs {
            self.guest[r as usize].spill_lock = true;
        }
    }

    pub fn release_spill_locks(&mut self) {
        for g in self.guest.iter_mut() {
            g.spill_lock = false;
        }
    }

    fn find_free(&self) -> Option<Reg> {
        ALLOC_ORDER
            .iter()
            .copied()
            .find(|&reg| self.host[reg as usize].guest == NO_GUEST)
    }

    /// Two-tier spill policy: prefer a slot whose guest register is
    /// provably dead in the lookahead window (discarded, not stored);
    /// otherwise a used-but-spillable one (written back first).
    fn find_best_to_spill(&self, an: &Analysis, pc: u32, unused_only: bool) -> Option<(Reg, bool)> {
        for &reg in ALLOC_ORDER {
            let guest = self.host[reg as usize].guest;
            if guest == NO_GUEST || self.guest[guest as usize].spill_lock {
                continue;
            }
            if an.is_clobbered(guest, pc, LOOKAHEAD_OPS) {
                return Some((reg, true));
            }
            if unused_only && an.is_used(guest, pc, LOOKAHEAD_OPS) {
                continue;
            }
            return Some((reg, false));
        }
        None
    }

    fn alloc_host(&mut self, buf: &mut CodeArena, an: &Analysis, pc: u32) -> Reg {
        if let Some(reg) = self.find_free() {
            return reg;
        }
        let (reg, clobbered) = self
            .find_best_to_spill(an, pc, true)
            .or_else(|| self.find_best_to_spill(an, pc, false))
            .unwrap_or_else(|| {
                // The translators lock only a handful of registers at a
                // time, so a candidate must exist; this is a translator
                // bug, not a guest-code condition.
                panic!("out of spillable registers at {pc:08x}")
            });
        let guest = self.host[reg as usize].guest;
        if clobbered {
            self.discard(guest);
        } else {
            self.flush_reg(buf, guest);
        }
        reg
    }

    fn bind(&mut self, reg: Reg, r: u8, dirty: bool) {
        self.host[reg as usize] = HostSlot { guest: r, dirty };
        self.guest[r as usize].host = reg as u8;
    }

    /// Map guest register `r` into a host register.
    ///
    /// If resident, returns the existing slot (upgrading the dirty bit).
    /// If immediate, demotes to resident, materializing the constant only
    /// when the current value is needed. If at home, allocates a slot and
    /// loads only when the current value is needed — a pure overwrite
    /// never pays a load.
    pub fn map_reg(
        &mut self,
        buf: &mut CodeArena,
        an: &Analysis,
        pc: u32,
        r: u8,
        flags: MapFlags,
    ) -> Reg {
        let noinit = flags.contains(MapFlags::NOINIT);
        let dirty = flags.contains(MapFlags::DIRTY);
        debug_assert!(
            !(r == REG_ZERO && dirty),
            "mapping the zero register for write"
        );

        match self.guest[r as usize].loc {
            Loc::Reg | Loc::RegImm => {
                let host = self.guest[r as usize].host;
                debug_assert_eq!(
                    self.host[host as usize].guest, r,
                    "register mapping out of sync for {r}"
                );
                if dirty {
                    // The known immediate no longer matches the value.
                    self.guest[r as usize].loc = Loc::Reg;
                    self.host[host as usize].dirty = true;
                }
                Reg::from_index(host)
            }
            Loc::Imm => {
                let imm = self.guest[r as usize].imm;
                let reg = self.alloc_host(buf, an, pc);
                if !noinit {
                    emit_mov_ri(buf, false, reg, imm as u64);
                }
                self.guest[r as usize].loc = if dirty && r != REG_ZERO {
                    Loc::Reg
                } else {
                    Loc::RegImm
                };
                // An immediate differs from home until written back.
                self.bind(reg, r, true);
                reg
            }
            Loc::Mem => {
                // The zero register never leaves the immediate state, so
                // this arm only sees real registers.
                let reg = self.alloc_host(buf, an, pc);
                if !noinit {
                    emit_load(buf, false, reg, CTX, offsets::gpr(r));
                }
                self.guest[r as usize].loc = Loc::Reg;
                self.bind(reg, r, dirty);
                reg
            }
        }
    }

    /// Write `r` back to its home slot (if needed) and drop any residency.
    pub fn flush_reg(&mut self, buf: &mut CodeArena, r: u8) {
        let g = self.guest[r as usize];
        match g.loc {
            Loc::Imm => {
                if r != REG_ZERO {
                    emit_store_imm(buf, CTX, offsets::gpr(r), g.imm);
                }
            }
            Loc::Reg | Loc::RegImm => {
                let host = g.host as usize;
                if self.host[host].dirty && r != REG_ZERO {
                    emit_store(buf, false, Reg::from_index(g.host), CTX, offsets::gpr(r));
                }
                self.host[host] = HostSlot { guest: NO_GUEST, dirty: false };
            }
            Loc::Mem => {}
        }
        self.guest[r as usize] = GuestReg {
            loc: if r == REG_ZERO { Loc::Imm } else { Loc::Mem },
            host: NO_HOST,
            imm: 0,
            spill_lock: g.spill_lock,
        };
    }

    /// Drop `r` without writing it back; its value will never be read.
    pub fn discard(&mut self, r: u8) {
        let g = self.guest[r as usize];
        if let Loc::Reg | Loc::RegImm = g.loc {
            self.host[g.host as usize] = HostSlot { guest: NO_GUEST, dirty: false };
        }
        self.guest[r as usize] = GuestReg {
            loc: if r == REG_ZERO { Loc::Imm } else { Loc::Mem },
            host: NO_HOST,
            imm: 0,
            spill_lock: g.spill_lock,
        };
    }

    /// Flush every register to home. Required at block boundaries and
    /// before any call out of generated code.
    pub fn flush_all(&mut self, buf: &mut CodeArena) {
        for r in 0..NUM_GPR_SLOTS as u8 {
            self.flush_reg(buf, r);
        }
        self.sanity_check();
    }

    // -- Convenience wrappers: lock operands, map, release --

    pub fn map_in_in(&mut self, buf: &mut CodeArena, an: &Analysis, pc: u32, a: u8, b: u8) {
        self.spill_lock(&[a, b]);
        self.map_reg(buf, an, pc, a, MapFlags::empty());
        self.map_reg(buf, an, pc, b, MapFlags::empty());
        self.release_spill_locks();
    }

    /// Map destination (write) and one source. `avoid_load` skips loading
    /// the destination when it is a pure overwrite.
    pub fn map_dirty_in(
        &mut self,
        buf: &mut CodeArena,
        an: &Analysis,
        pc: u32,
        rd: u8,
        rs: u8,
        avoid_load: bool,
    ) {
        self.spill_lock(&[rd, rs]);
        let load = !avoid_load || rd == rs;
        self.map_reg(buf, an, pc, rd, if load { MapFlags::DIRTY } else { MapFlags::NOINIT });
        self.map_reg(buf, an, pc, rs, MapFlags::empty());
        self.release_spill_locks();
    }

    pub fn map_dirty_in_in(
        &mut self,
        buf: &mut CodeArena,
        an: &Analysis,
        pc: u32,
        rd: u8,
        rs: u8,
        rt: u8,
        avoid_load: bool,
    ) {
        self.spill_lock(&[rd, rs, rt]);
        let load = !avoid_load || rd == rs || rd == rt;
        self.map_reg(buf, an, pc, rd, if load { MapFlags::DIRTY } else { MapFlags::NOINIT });
        self.map_reg(buf, an, pc, rs, MapFlags::empty());
        self.map_reg(buf, an, pc, rt, MapFlags::empty());
        self.release_spill_locks();
    }

    // -- Snapshots --

    pub fn state(&self) -> GprState {
        GprState { guest: self.guest, host: self.host }
    }

    pub fn restore_state(&mut self, state: &GprState) {
        self.guest = state.guest;
        self.host = state.host;
    }

    /// Verify the guest and host tables describe each other exactly.
    /// A violation is a translator bug that could produce silently wrong
    /// guest-visible results, so it is fatal.
    pub fn sanity_check(&self) {
        for (i, h) in self.host.iter().enumerate() {
            if h.guest != NO_GUEST {
                let g = &self.guest[h.guest as usize];
                assert!(
                    matches!(g.loc, Loc::Reg | Loc::RegImm) && g.host == i as u8,
                    "host slot {i} claims guest {} but guest disagrees",
                    h.guest
                );
            }
        }
        for (r, g) in self.guest.iter().enumerate() {
            if matches!(g.loc, Loc::Reg | Loc::RegImm) {
                assert!(
                    self.host[g.host as usize].guest == r as u8,
                    "guest {r} claims host slot {} but slot disagrees",
                    g.host
                );
            }
        }
        assert!(
            matches!(self.guest[REG_ZERO as usize].loc, Loc::Imm | Loc::RegImm)
                && self.guest[REG_ZERO as usize].imm == 0,
            "zero register lost its immediate"
        );
    }

    /// Whether HI/LO or any GPR still occupies a host register.
    pub fn any_resident(&self) -> bool {
        self.host.iter().any(|h| h.guest != NO_GUEST)
    }
}

impl Default for GprCache {
    fn default() -> Self {
        Self::new()
    }
}

// Keep the wrappers honest about index space.
const _: () = assert!(GPR_HI == 32 && GPR_LO == 33);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn buf() -> CodeArena {
        CodeArena::new(64 * 1024).unwrap()
    }

    fn an() -> Analysis {
        Analysis::empty(0x0800_0000)
    }

    #[test]
    fn imm_then_map_materializes() {
        let mut c = GprCache::new();
        let mut b = buf();
        c.set_imm(8, 1234);
        assert!(c.is_imm(8));
        assert_eq!(c.get_imm(8), 1234);
        let before = b.offset();
        let _ = c.map_reg(&mut b, &an(), 0, 8, MapFlags::empty());
        assert!(b.offset() > before, "materialization must emit a load");
        assert!(c.is_imm(8), "value is still known after mapping");
        c.sanity_check();
    }

    #[test]
    fn noinit_skips_load() {
        let mut c = GprCache::new();
        let mut b = buf();
        let before = b.offset();
        let _ = c.map_reg(&mut b, &an(), 0, 9, MapFlags::NOINIT);
        assert_eq!(b.offset(), before, "pure overwrite must not emit a load");
        c.sanity_check();
    }

    #[test]
    fn dirty_upgrade_invalidates_imm() {
        let mut c = GprCache::new();
        let mut b = buf();
        c.set_imm(8, 7);
        let _ = c.map_reg(&mut b, &an(), 0, 8, MapFlags::empty());
        assert!(c.is_imm(8));
        let _ = c.map_reg(&mut b, &an(), 0, 8, MapFlags::DIRTY);
        assert!(!c.is_imm(8));
        c.sanity_check();
    }

    #[test]
    fn zero_reg_is_always_zero_imm() {
        let mut c = GprCache::new();
        assert!(c.is_imm(0));
        assert_eq!(c.get_imm(0), 0);
        c.set_imm(0, 5);
        assert_eq!(c.get_imm(0), 0);
    }

    #[test]
    fn spill_everything_until_panic_does_not_happen_with_locks_released() {
        let mut c = GprCache::new();
        let mut b = buf();
        // Map more registers than there are host slots; eviction must kick in.
        for r in 1..=(ALLOC_ORDER.len() as u8 + 3) {
            let _ = c.map_reg(&mut b, &an(), 0, r, MapFlags::DIRTY);
        }
        c.sanity_check();
        c.flush_all(&mut b);
        assert!(!c.any_resident());
    }

    #[test]
    #[should_panic(expected = "out of spillable registers")]
    fn exhaustion_with_all_locked_is_fatal() {
        let mut c = GprCache::new();
        let mut b = buf();
        let all: Vec<u8> = (1..=ALLOC_ORDER.len() as u8 + 1).collect();
        c.spill_lock(&all);
        for &r in &all {
            let _ = c.map_reg(&mut b, &an(), 0, r, MapFlags::empty());
        }
    }

    proptest! {
        /// Register-cache round trip: any call sequence leaves the
        /// guest/host tables mutually consistent.
        #[test]
        fn random_ops_keep_tables_consistent(ops in proptest::collection::vec((0u8..5, 1u8..34, any::<u32>()), 1..120)) {
            let mut c = GprCache::new();
            let mut b = CodeArena::new(1024 * 1024).unwrap();
            let a = an();
            for (op, r, val) in ops {
                match op {
                    0 => { let _ = c.map_reg(&mut b, &a, 0, r, MapFlags::empty()); }
                    1 => { let _ = c.map_reg(&mut b, &a, 0, r, MapFlags::DIRTY); }
                    2 => c.set_imm(r, val),
                    3 => c.flush_reg(&mut b, r),
                    4 => c.flush_all(&mut b),
                    _ => unreachable!(),
                }
                c.sanity_check();
            }
            c.flush_all(&mut b);
            prop_assert!(!c.any_resident());
        }
    }
}
