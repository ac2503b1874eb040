//! Guarded memory access: fault reporting, unaligned left/right pairs,
//! and the fused-pair fast path.

use crate::asm::*;
use crate::harness::{run_interp, run_jit, Machine, START};
use vex_core::mem::RAM_BASE;
use vex_core::state::ExecState;
use vex_jit::{Jit, JitOptions};

const T0: u8 = 8;
const T1: u8 = 9;
const S0: u8 = 16;

/// Invalid accesses are a defined, recoverable guest condition — never a
/// host fault. (Fast-memory mode is excluded: it masks addresses into
/// the window by design.)
#[test]
fn invalid_access_reports_through_guest_state() {
    for word in [lw(T0, S0, 0), sw(T0, S0, 0), lb(T0, S0, 0), sh(T0, S0, 0)] {
        let program = [word, syscall(), nop()];
        let setup = |cpu: &mut vex_core::CpuState| {
            cpu.r[S0 as usize] = 0x0001_0000; // outside the RAM window
        };
        let reference = run_interp(&program, setup);
        let jitted = run_jit(&program, setup);
        assert_eq!(reference, jitted);
        assert_eq!(jitted.exec_state, ExecState::Exception as u32);
        assert_eq!(jitted.last_fault_addr, 0x0001_0000);
    }
}

#[test]
fn checked_write_stops_the_block_at_the_fault() {
    let program = [nop(), sw(T0, S0, 4), syscall(), nop()];
    let mut m = Machine::new(&program);
    m.cpu.r[S0 as usize] = 0x0200_0000;
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);
    // The fault must end execution before the trailing syscall can
    // overwrite the exception, and the PC resumes after the faulting
    // store, exactly like the interpreter.
    assert_eq!(m.cpu.exec_state(), ExecState::Exception);
    assert_eq!(m.cpu.pc, START + 8);
    assert_eq!(m.cpu.last_fault_addr, 0x0200_0004);
}

#[test]
fn unaligned_pairs_and_lone_halves_match_interpreter() {
    let data = RAM_BASE + 0x8000;
    let setup = move |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = data;
        cpu.r[T1 as usize] = 0x1122_3344;
        cpu.write32_unchecked(data, 0xaabb_ccdd);
        cpu.write32_unchecked(data + 4, 0x5566_7788);
        cpu.write32_unchecked(data + 8, 0x99aa_bbcc);
    };

    // The canonical fused pair at every misalignment.
    for off in 0..4i16 {
        let program = [
            lwl(T0, S0, off + 3),
            lwr(T0, S0, off),
            syscall(),
            nop(),
        ];
        crate::harness::assert_equivalent(&program, setup);

        let store = [
            swl(T1, S0, off + 3),
            swr(T1, S0, off),
            lw(T0, S0, 0),
            lw(T1, S0, 4),
            syscall(),
            nop(),
        ];
        crate::harness::assert_equivalent(&store, setup);
    }

    // Lone halves fall back to shift reconstruction.
    for off in 0..4i16 {
        for word in [lwl(T0, S0, off), lwr(T0, S0, off)] {
            let program = [word, syscall(), nop()];
            crate::harness::assert_equivalent(&program, move |cpu| {
                setup(cpu);
                cpu.r[T0 as usize] = 0xf0f0_f0f0;
            });
        }
        for word in [swl(T1, S0, off), swr(T1, S0, off)] {
            let program = [word, lw(T0, S0, 0), lw(T1, S0, 4), syscall(), nop()];
            crate::harness::assert_equivalent(&program, setup);
        }
    }

    // A pair with a different destination register must not fuse into
    // nonsense: base == rt blocks fusion.
    let program = [
        lwl(S0, S0, 3),
        lwr(S0, S0, 0),
        syscall(),
        nop(),
    ];
    crate::harness::assert_equivalent(&program, setup);
}

/// Constant addresses collapse to a single direct host access but keep
/// identical semantics.
#[test]
fn constant_address_loads_match() {
    let data = RAM_BASE + 0x8000;
    let program = [
        lui(S0, (data >> 16) as u16),
        ori(S0, S0, (data & 0xffff) as u16),
        lw(T0, S0, 0),
        lb(T1, S0, 1),
        sw(T0, S0, 8),
        syscall(),
        nop(),
    ];
    crate::harness::assert_equivalent(&program, move |cpu| {
        cpu.write32_unchecked(data, 0x8091_a2b3);
    });
}

/// Jumps to addresses outside RAM end the block through the fault
/// reporter; the machine observes the same state as an interpreter
/// fetching from the bad address.
#[test]
fn invalid_jump_target_is_guest_visible() {
    // jr to an out-of-window address; the delay slot still runs.
    let program = [jr(S0), addiu(T0, 0, 55), syscall(), nop()];
    let setup = |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = 0x0900_0000;
    };
    let reference = run_interp(&program, setup);
    let jitted = run_jit(&program, setup);
    assert_eq!(reference, jitted);
    assert_eq!(jitted.exec_state, ExecState::Exception as u32);
    assert_eq!(jitted.last_fault_addr, 0x0900_0000);
    assert_eq!(jitted.r[T0 as usize], 55, "delay slot must run before the fault");

    // Same through a static jump.
    let program = [j(0x0900_0000), addiu(T0, 0, 56), syscall(), nop()];
    let reference = run_interp(&program, |_| {});
    let jitted = run_jit(&program, |_| {});
    assert_eq!(reference, jitted);
    assert_eq!(jitted.exec_state, ExecState::Exception as u32);
}

/// A load whose destination is $0 still performs the access (and can
/// fault) but writes nothing.
#[test]
fn load_to_zero_register_still_faults() {
    let program = [lw(0, S0, 0), syscall(), nop()];
    let setup = |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = 0x0300_0000;
    };
    let reference = run_interp(&program, setup);
    let jitted = run_jit(&program, setup);
    assert_eq!(reference, jitted);
    assert_eq!(jitted.exec_state, ExecState::Exception as u32);
}
