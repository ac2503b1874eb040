//! The disablement escape hatch: every category flag forces its
//! translators through the interpreter fallback without changing results.

use crate::asm::*;
use crate::harness::{run_interp, run_jit_with};
use vex_core::mem::RAM_BASE;
use vex_jit::{JitDisable, JitOptions};

const T0: u8 = 8;
const T1: u8 = 9;
const T2: u8 = 10;
const S0: u8 = 16;

fn mixed_program() -> Vec<u32> {
    let data = RAM_BASE + 0x8000;
    vec![
        lui(S0, (data >> 16) as u16),
        ori(S0, S0, (data & 0xffff) as u16),
        addiu(T0, 0, 100),
        sll(T1, T0, 2),
        mult(T0, T1),
        mflo(T2),
        sw(T2, S0, 0),
        lw(T2, S0, 0),
        add_s(2, 0, 1),
        c_lt_s(0, 1),
        vadd(4, 0x01, 0x00, 0x04),
        beq(T0, T0, 1),
        addiu(T1, T1, 1),
        syscall(),
        nop(),
    ]
}

fn setup(cpu: &mut vex_core::CpuState) {
    cpu.f[0] = 1.5;
    cpu.f[1] = 2.5;
    for i in 0..128 {
        cpu.v[i] = i as f32;
    }
}

#[test]
fn every_disable_flag_still_matches_the_interpreter() {
    let program = mixed_program();
    let reference = run_interp(&program, setup);
    for flag in [
        JitDisable::ALU,
        JitDisable::SHIFT,
        JitDisable::MULDIV,
        JitDisable::BRANCH,
        JitDisable::LSU,
        JitDisable::LSU_UNALIGNED,
        JitDisable::FPU,
        JitDisable::VPU,
        JitDisable::BLOCKLINK,
        JitDisable::REGALLOC_GPR,
        JitDisable::REGALLOC_FPR,
    ] {
        let mut jo = JitOptions::default();
        jo.disabled |= flag;
        let got = run_jit_with(&program, jo, setup);
        assert_eq!(reference, got, "divergence with {flag:?} disabled");
    }

    // Everything at once: the translator degenerates to a glorified
    // interpreter driver but stays correct.
    let mut jo = JitOptions::default();
    jo.disabled = JitDisable::all();
    let got = run_jit_with(&program, jo, setup);
    assert_eq!(reference, got, "divergence with all categories disabled");
}

#[test]
fn unknown_opcode_raises_guest_exception() {
    // An unassigned encoding must fail over to the interpreter, which
    // reports it as a guest exception — never emit wrong code.
    let program = [0xffff_ffffu32, syscall(), nop()];
    let reference = run_interp(&program, |_| {});
    let got = run_jit_with(&program, JitOptions::default(), |_| {});
    assert_eq!(reference, got);
    assert_eq!(got.exec_state, vex_core::ExecState::Exception as u32);
}
