//! Float/vector register cache.
//!
//! Maps guest scalar floats, vector-unit registers and translator temps
//! (one shared index space, see [`crate::offsets::fpr`]) onto host SIMD
//! registers. A host register holds either one guest register in lane 0 or
//! a pack of up to four as lanes 0..n. The host-slot table owns the
//! bindings; guest entries only point back at their slot and lane.

use vex_backend::x86_64::emitter::{
    emit_extractps_store, emit_insertps_load, emit_movss_load, emit_movss_store,
    emit_movups_load, emit_movups_store, emit_pshufd,
};
use vex_backend::x86_64::{Xmm, CTX};
use vex_backend::CodeArena;

use crate::gpr::MapFlags;
use crate::offsets;

/// Scalar float registers are 0..32, vector registers 32..160, temps
/// 160..164 in the shared float index space.
pub const VPR_BASE: u16 = 32;
pub const TEMP_BASE: u16 = 160;
pub const NUM_FPR_SLOTS: usize = 164;

const NO_GUEST: u16 = 0xffff;

/// XMM0/XMM1 are translator scratch; the rest belong to the allocator.
pub const ALLOC_ORDER: &[Xmm] = &[
    Xmm::Xmm2,
    Xmm::Xmm3,
    Xmm::Xmm4,
    Xmm::Xmm5,
    Xmm::Xmm6,
    Xmm::Xmm7,
    Xmm::Xmm8,
    Xmm::Xmm9,
    Xmm::Xmm10,
    Xmm::Xmm11,
    Xmm::Xmm12,
    Xmm::Xmm13,
    Xmm::Xmm14,
    Xmm::Xmm15,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FLoc {
    /// At home in the guest state block.
    Mem,
    /// Lane `lane` of host register `xmm` (lane 0 of a width-1 slot is a
    /// plain scalar residency).
    Lane { xmm: u8, lane: u8 },
}

#[derive(Debug, Clone, Copy)]
struct GuestFloat {
    loc: FLoc,
    spill_lock: bool,
}

#[derive(Debug, Clone, Copy)]
struct XmmSlot {
    lanes: [u16; 4],
    /// Number of occupied lanes; 0 means free.
    width: u8,
    /// Dirty bit per lane.
    dirty: u8,
    /// Caller requires this slot to stay stable across an emission
    /// sequence.
    locked: bool,
}

const EMPTY_SLOT: XmmSlot = XmmSlot { lanes: [NO_GUEST; 4], width: 0, dirty: 0, locked: false };

/// Snapshot of the allocator bookkeeping.
#[derive(Clone)]
pub struct FprState {
    guest: [GuestFloat; NUM_FPR_SLOTS],
    xmm: [XmmSlot; 16],
}

pub struct FprCache {
    guest: [GuestFloat; NUM_FPR_SLOTS],
    xmm: [XmmSlot; 16],
}

impl FprCache {
    pub fn new() -> Self {
        Self {
            guest: [GuestFloat { loc: FLoc::Mem, spill_lock: false }; NUM_FPR_SLOTS],
            xmm: [EMPTY_SLOT; 16],
        }
    }

    pub fn start(&mut self) {
        *self = Self::new();
    }

    /// Whether `idx` currently lives inside a multi-lane pack.
    pub fn is_packed(&self, idx: u16) -> bool {
        match self.guest[idx as usize].loc {
            FLoc::Lane { xmm, .. } => self.xmm[xmm as usize].width > 1,
            FLoc::Mem => false,
        }
    }

    pub fn is_mapped(&self, idx: u16) -> bool {
        matches!(self.guest[idx as usize].loc, FLoc::Lane { .. })
    }

    pub fn spill_lock(&mut self, idxs: &[u16]) {
        for &i in idxs {
            self.guest[i as usize].spill_lock = true;
        }
    }

    pub fn release_spill_locks(&mut self) {
        for g in self.guest.iter_mut() {
            g.spill_lock = false;
        }
        for s in self.xmm.iter_mut() {
            s.locked = false;
        }
    }

    /// Pin a host slot for the remainder of the emission sequence.
    pub fn lock_xmm(&mut self, x: Xmm) {
        self.xmm[x as usize].locked = true;
    }

    fn slot_evictable(&self, x: usize) -> bool {
        let s = &self.xmm[x];
        if s.locked {
            return false;
        }
        s.lanes[..s.width as usize]
            .iter()
            .all(|&g| g == NO_GUEST || !self.guest[g as usize].spill_lock)
    }

    fn alloc_xmm(&mut self, buf: &mut CodeArena) -> Xmm {
        if let Some(&x) = ALLOC_ORDER
            .iter()
            .find(|&&x| self.xmm[x as usize].width == 0 && !self.xmm[x as usize].locked)
        {
            return x;
        }
        let x = ALLOC_ORDER
            .iter()
            .copied()
            .find(|&x| self.slot_evictable(x as usize))
            .unwrap_or_else(|| panic!("out of spillable SIMD registers"));
        self.flush_xmm(buf, x);
        x
    }

    /// Whether the group's home slots are 4-byte consecutive, which allows
    /// whole-register loads and stores.
    fn consecutive(regs: &[u16]) -> bool {
        let base = offsets::fpr(regs[0]);
        regs.iter()
            .enumerate()
            .all(|(i, &r)| offsets::fpr(r) == base + 4 * i as i32)
    }

    /// Map one guest float scalar. A register living inside a pack is
    /// first unpacked to home (other lanes undisturbed), then mapped as a
    /// lone scalar.
    pub fn map_fpr(&mut self, buf: &mut CodeArena, idx: u16, flags: MapFlags) -> Xmm {
        let dirty = flags.contains(MapFlags::DIRTY);
        let noinit = flags.contains(MapFlags::NOINIT);

        if let FLoc::Lane { xmm, .. } = self.guest[idx as usize].loc {
            if self.xmm[xmm as usize].width == 1 {
                if dirty {
                    self.xmm[xmm as usize].dirty |= 1;
                }
                return Xmm::from_index(xmm);
            }
            // Inside a pack: write the pack back, then fall through.
            self.flush_xmm(buf, Xmm::from_index(xmm));
        }

        let x = self.alloc_xmm(buf);
        if !noinit {
            emit_movss_load(buf, x, CTX, offsets::fpr(idx));
        }
        let slot = &mut self.xmm[x as usize];
        *slot = EMPTY_SLOT;
        slot.lanes[0] = idx;
        slot.width = 1;
        slot.dirty = dirty as u8;
        self.guest[idx as usize].loc = FLoc::Lane { xmm: x as u8, lane: 0 };
        x
    }

    /// Map a whole register group into the lanes of one host register.
    ///
    /// Returns `None` — and changes nothing — when the group cannot be
    /// packed: a member is locked, duplicated (register-numbering
    /// aliasing), or resident in a different pack. The caller must then
    /// take the scalar fallback. Lone-scalar or at-home members are
    /// loaded into their correct lane.
    pub fn try_map_vec(&mut self, buf: &mut CodeArena, regs: &[u16], flags: MapFlags) -> Option<Xmm> {
        let n = regs.len();
        assert!((1..=4).contains(&n), "bad group width {n}");
        let dirty = flags.contains(MapFlags::DIRTY);
        let noinit = flags.contains(MapFlags::NOINIT);

        for (i, &r) in regs.iter().enumerate() {
            if regs[..i].contains(&r) {
                return None;
            }
            if self.guest[r as usize].spill_lock {
                return None;
            }
        }

        // Exact existing pack?
        if let FLoc::Lane { xmm, lane: 0 } = self.guest[regs[0] as usize].loc {
            let slot = &self.xmm[xmm as usize];
            if slot.width as usize == n && slot.lanes[..n] == *regs {
                let x = Xmm::from_index(xmm);
                if dirty {
                    self.xmm[xmm as usize].dirty = ((1u16 << n) - 1) as u8;
                }
                return Some(x);
            }
        }

        // A member held by a *different* pack defeats packing.
        for &r in regs {
            if let FLoc::Lane { xmm, .. } = self.guest[r as usize].loc {
                if self.xmm[xmm as usize].width > 1 {
                    return None;
                }
            }
        }

        // Lone scalar residents go home first so every lane loads from a
        // single authoritative location.
        for &r in regs {
            if let FLoc::Lane { xmm, .. } = self.guest[r as usize].loc {
                self.flush_xmm(buf, Xmm::from_index(xmm));
            }
        }

        let x = self.alloc_xmm(buf);
        if !noinit {
            if n == 4 && Self::consecutive(regs) {
                emit_movups_load(buf, x, CTX, offsets::fpr(regs[0]));
            } else {
                emit_movss_load(buf, x, CTX, offsets::fpr(regs[0]));
                for (i, &r) in regs.iter().enumerate().skip(1) {
                    emit_insertps_load(buf, x, CTX, offsets::fpr(r), i as u8);
                }
            }
        }
        let slot = &mut self.xmm[x as usize];
        *slot = EMPTY_SLOT;
        for (i, &r) in regs.iter().enumerate() {
            slot.lanes[i] = r;
        }
        slot.width = n as u8;
        slot.dirty = if dirty { ((1u16 << n) - 1) as u8 } else { 0 };
        for (i, &r) in regs.iter().enumerate() {
            self.guest[r as usize].loc = FLoc::Lane { xmm: x as u8, lane: i as u8 };
        }
        Some(x)
    }

    /// Copy the current value of `idx` into a scratch register without
    /// touching the allocator state.
    pub fn read_to_scratch(&self, buf: &mut CodeArena, idx: u16, scratch: Xmm) {
        match self.guest[idx as usize].loc {
            FLoc::Lane { xmm, lane } => {
                // pshufd's low selector picks the source lane into lane 0.
                emit_pshufd(buf, scratch, Xmm::from_index(xmm), lane);
            }
            FLoc::Mem => emit_movss_load(buf, scratch, CTX, offsets::fpr(idx)),
        }
    }

    /// Write back every dirty lane of `x` and free it. Writing a lane
    /// dirties only that lane's home location; a fully dirty consecutive
    /// quad goes out as one store.
    pub fn flush_xmm(&mut self, buf: &mut CodeArena, x: Xmm) {
        let slot = self.xmm[x as usize];
        if slot.width == 0 {
            return;
        }
        let n = slot.width as usize;
        let regs = &slot.lanes[..n];
        if n == 4 && slot.dirty == 0xf && Self::consecutive(regs) {
            emit_movups_store(buf, x, CTX, offsets::fpr(regs[0]));
        } else {
            for (i, &r) in regs.iter().enumerate() {
                if slot.dirty & (1 << i) != 0 {
                    if i == 0 {
                        emit_movss_store(buf, x, CTX, offsets::fpr(r));
                    } else {
                        emit_extractps_store(buf, x, CTX, offsets::fpr(r), i as u8);
                    }
                }
            }
        }
        for &r in regs {
            self.guest[r as usize].loc = FLoc::Mem;
        }
        self.xmm[x as usize] = EMPTY_SLOT;
    }

    /// Flush one guest register (and whatever slot it shares).
    pub fn flush_reg(&mut self, buf: &mut CodeArena, idx: u16) {
        if let FLoc::Lane { xmm, .. } = self.guest[idx as usize].loc {
            self.flush_xmm(buf, Xmm::from_index(xmm));
        }
    }

    /// Drop a slot without writing it back.
    pub fn discard_xmm(&mut self, x: Xmm) {
        let slot = self.xmm[x as usize];
        for &r in &slot.lanes[..slot.width as usize] {
            self.guest[r as usize].loc = FLoc::Mem;
        }
        self.xmm[x as usize] = EMPTY_SLOT;
    }

    pub fn flush_all(&mut self, buf: &mut CodeArena) {
        for &x in ALLOC_ORDER {
            self.flush_xmm(buf, x);
        }
        self.sanity_check();
    }

    pub fn state(&self) -> FprState {
        FprState { guest: self.guest, xmm: self.xmm }
    }

    pub fn restore_state(&mut self, state: &FprState) {
        self.guest = state.guest;
        self.xmm = state.xmm;
    }

    pub fn any_resident(&self) -> bool {
        self.xmm.iter().any(|s| s.width > 0)
    }

    /// Verify slot/guest mutual consistency and pack shape (no hole
    /// before a filled lane). Fatal on violation.
    pub fn sanity_check(&self) {
        for (xi, s) in self.xmm.iter().enumerate() {
            for (li, &g) in s.lanes.iter().enumerate() {
                if li < s.width as usize {
                    assert!(
                        g != NO_GUEST,
                        "SIMD pack in xmm{xi} has a hole at lane {li}"
                    );
                    assert!(
                        self.guest[g as usize].loc
                            == FLoc::Lane { xmm: xi as u8, lane: li as u8 },
                        "xmm{xi} lane {li} claims guest {g} but guest disagrees"
                    );
                } else {
                    assert!(
                        g == NO_GUEST,
                        "xmm{xi} has a lane binding beyond its width"
                    );
                }
            }
        }
        for (gi, g) in self.guest.iter().enumerate() {
            if let FLoc::Lane { xmm, lane } = g.loc {
                assert!(
                    self.xmm[xmm as usize].lanes[lane as usize] == gi as u16,
                    "guest {gi} claims xmm{xmm} lane {lane} but slot disagrees"
                );
            }
        }
    }
}

impl Default for FprCache {
    fn default() -> Self {
        Self::new()
    }
}
