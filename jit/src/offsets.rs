//! Displacements of guest state fields from the context register.

use std::mem::offset_of;
use vex_core::state::{CpuState, GPR_HI, GPR_LO};

pub fn gpr(slot: u8) -> i32 {
    match slot {
        0..=31 => (offset_of!(CpuState, r) + slot as usize * 4) as i32,
        GPR_HI => offset_of!(CpuState, hi) as i32,
        GPR_LO => offset_of!(CpuState, lo) as i32,
        _ => panic!("bad general register slot {slot}"),
    }
}

/// Float-space index: 0..32 scalar floats, 32..160 vector registers,
/// 160..164 translator temps.
pub fn fpr(idx: u16) -> i32 {
    match idx {
        0..=31 => (offset_of!(CpuState, f) + idx as usize * 4) as i32,
        32..=159 => (offset_of!(CpuState, v) + (idx as usize - 32) * 4) as i32,
        160..=163 => (offset_of!(CpuState, vtemp) + (idx as usize - 160) * 4) as i32,
        _ => panic!("bad float register index {idx}"),
    }
}

pub fn pc() -> i32 {
    offset_of!(CpuState, pc) as i32
}

pub fn downcount() -> i32 {
    offset_of!(CpuState, downcount) as i32
}

pub fn exec_state() -> i32 {
    offset_of!(CpuState, exec_state) as i32
}

pub fn fp_cond() -> i32 {
    offset_of!(CpuState, fp_cond) as i32
}

pub fn vcmp() -> i32 {
    offset_of!(CpuState, vcmp) as i32
}

pub fn mem_base() -> i32 {
    offset_of!(CpuState, mem_base) as i32
}

pub fn saved_flags() -> i32 {
    offset_of!(CpuState, saved_flags) as i32
}

pub fn scratch_jump() -> i32 {
    offset_of!(CpuState, scratch_jump) as i32
}
