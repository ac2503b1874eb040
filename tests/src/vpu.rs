//! Vector-unit behavior: SIMD packing vs. scalar fallback, overlap
//! safety under the register-numbering aliasing, compares, and the quad
//! memory operations.

use crate::asm::*;
use crate::harness::{assert_equivalent, Machine};
use vex_core::mem::RAM_BASE;
use vex_core::state::ExecState;
use vex_core::vreg::{get_vector_regs, VectorSize};
use vex_jit::{Jit, JitOptions};

const T0: u8 = 8;
const S0: u8 = 16;

/// Column 0 of bank 0 (elements 0,32,64,96).
const COL0: u8 = 0x00;
/// The transposed row through the same bank (elements 0..3).
const ROW0: u8 = 0x20;
/// Column 1 of bank 0.
const COL1: u8 = 0x01;
/// Column 0 of bank 1 (disjoint from bank 0).
const BANK1: u8 = 0x04;

const FLOAT_EDGES: &[f32] = &[0.0, -0.0, 1.5, -2.25, f32::NAN, f32::INFINITY, 1.0e-20];

fn fill_group(cpu: &mut vex_core::CpuState, vreg: u8, values: [f32; 4]) {
    let regs = get_vector_regs(vreg, VectorSize::Quad);
    for (i, &r) in regs.iter().enumerate() {
        cpu.v[r as usize] = values[i];
    }
}

#[test]
fn elementwise_ops_match_interpreter() {
    for n in [1usize, 2, 3, 4] {
        for word in [
            vadd(n, COL1, COL0, BANK1),
            vsub(n, COL1, COL0, BANK1),
            vmul(n, COL1, COL0, BANK1),
            vdiv(n, COL1, COL0, BANK1),
            vmin(n, COL1, COL0, BANK1),
            vmax(n, COL1, COL0, BANK1),
        ] {
            assert_equivalent(&[word, syscall(), nop()], |cpu| {
                fill_group(cpu, COL0, [1.5, -2.0, f32::NAN, 8.25]);
                fill_group(cpu, BANK1, [0.5, -2.0, 3.0, f32::INFINITY]);
            });
        }
    }
}

#[test]
fn elementwise_same_operands_and_dest_aliasing() {
    // vd == vs, vd == vt, vs == vt: identical-position overlap is legal
    // and must not detour through memory incorrectly.
    for word in [
        vadd(4, COL0, COL0, BANK1),
        vadd(4, BANK1, COL0, BANK1),
        vmul(4, COL0, COL0, COL0),
        vsub(4, COL0, COL0, COL0),
    ] {
        assert_equivalent(&[word, syscall(), nop()], |cpu| {
            fill_group(cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
            fill_group(cpu, BANK1, [10.0, 20.0, 30.0, 40.0]);
        });
    }
}

/// Row and column views of one bank share storage; writing one while
/// reading the other is the §overlap hazard and must serialize.
#[test]
fn overlapping_row_column_views_are_safe() {
    for word in [
        vadd(4, ROW0, COL0, COL1),
        vmul(4, COL0, ROW0, COL1),
        vmov(4, ROW0, COL0),
        vneg(4, ROW0, COL0),
    ] {
        assert_equivalent(&[word, syscall(), nop()], |cpu| {
            for i in 0..128 {
                cpu.v[i] = i as f32 * 0.5 - 20.0;
            }
        });
    }
}

#[test]
fn scale_and_dot_match_interpreter() {
    for n in [2usize, 3, 4] {
        for &scale in FLOAT_EDGES {
            assert_equivalent(&[vscl(n, COL1, COL0, BANK1), syscall(), nop()], move |cpu| {
                fill_group(cpu, COL0, [1.0, -2.5, 3.25, 0.5]);
                let t0 = get_vector_regs(BANK1, VectorSize::Single)[0];
                cpu.v[t0 as usize] = scale;
            });
        }
        assert_equivalent(&[vdot(n, COL1, COL0, BANK1), syscall(), nop()], |cpu| {
            fill_group(cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
            fill_group(cpu, BANK1, [0.5, -1.0, 2.0, 8.0]);
        });
        // Dot with the destination inside a source group.
        assert_equivalent(&[vdot(n, COL0, COL0, COL0), syscall(), nop()], |cpu| {
            fill_group(cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
        });
    }
}

#[test]
fn unary_ops_match_interpreter() {
    for n in [1usize, 2, 3, 4] {
        for word in [
            vmov(n, COL1, COL0),
            vneg(n, COL1, COL0),
            vabs(n, COL1, COL0),
            vzero(n, COL1),
            vone(n, COL1),
        ] {
            assert_equivalent(&[word, syscall(), nop()], |cpu| {
                fill_group(cpu, COL0, [-1.5, f32::NAN, 0.0, -0.0]);
                fill_group(cpu, COL1, [9.0, 9.0, 9.0, 9.0]);
            });
        }
    }
}

#[test]
fn vcmp_flags_and_branches_match_interpreter() {
    for &(a, b) in &[(1.0f32, 2.0f32), (2.0, 2.0), (f32::NAN, 2.0), (3.0, -1.0)] {
        for cond in 0u8..3 {
            for n in [1usize, 4] {
                assert_equivalent(&[vcmp(cond, n, COL0, BANK1), syscall(), nop()], move |cpu| {
                    fill_group(cpu, COL0, [a, 2.0, b, 0.0]);
                    fill_group(cpu, BANK1, [b, 2.0, a, 1.0]);
                });
            }
        }
    }

    // Branch on the aggregate "any"/"all" bits.
    for cc in [0u8, 4, 5] {
        for word in [bvt(cc, 2), bvf(cc, 2), bvtl(cc, 2)] {
            let prog = [
                vcmp(0, 4, COL0, BANK1),
                word,
                addiu(T0, 0, 1), // delay slot
                addiu(T0, 0, 7),
                syscall(),
                addiu(T0, 0, 9),
                syscall(),
                nop(),
            ];
            assert_equivalent(&prog, |cpu| {
                fill_group(cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
                fill_group(cpu, BANK1, [1.0, 2.0, 0.0, 4.0]);
            });
        }
    }
}

#[test]
fn transfers_match_interpreter() {
    assert_equivalent(
        &[
            mtv(T0, 5),
            mfv(T0.wrapping_add(1), 5),
            syscall(),
            nop(),
        ],
        |cpu| {
            cpu.r[T0 as usize] = 0x4080_0000; // 4.0f32
        },
    );
}

#[test]
fn vector_memory_matches_interpreter() {
    let data = RAM_BASE + 0x9000;
    let setup = move |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = data;
        for i in 0..8 {
            cpu.write32_unchecked(data + i * 4, 0x3f80_0000 + i);
        }
        fill_group(cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
    };
    for word in [
        lv_s(5, S0, 4),
        sv_s(5, S0, 12),
        lv_q(COL0, S0, 0),
        sv_q(COL0, S0, 16),
        // Transposed group: non-consecutive homes exercise the
        // lane-at-a-time path.
        lv_q(ROW0, S0, 0),
        sv_q(ROW0, S0, 16),
        // Alignment mask: a sloppy address is masked down.
        lv_q(COL0, S0, 7),
    ] {
        let prog = [word, syscall(), nop()];
        assert_equivalent(&prog, setup);
    }
}

#[test]
fn quad_access_fault_is_guest_visible() {
    let prog = [lv_q(COL0, S0, 0), syscall(), nop()];
    let setup = |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = 0x0400_0000;
        fill_group(cpu, COL0, [7.0, 7.0, 7.0, 7.0]);
    };
    let reference = crate::harness::run_interp(&prog, setup);
    let jitted = crate::harness::run_jit(&prog, setup);
    assert_eq!(reference, jitted);
    assert_eq!(jitted.exec_state, ExecState::Exception as u32);
}

/// Pack four registers, unpack by reading each scalar back: the values
/// survive and lane order is preserved.
#[test]
fn pack_unpack_round_trip() {
    // vadd packs COL0 as a quad; the mfv reads then force scalar
    // extraction from the pack.
    let regs = get_vector_regs(COL0, VectorSize::Quad);
    let prog = [
        vadd(4, COL0, COL0, BANK1),
        mfv(T0, COL0),                       // element 0
        mfv(T0 + 1, 0x20),                   // element 1 through another numbering
        sv_q(COL0, S0, 0),
        syscall(),
        nop(),
    ];
    let data = RAM_BASE + 0xa000;
    let mut m = Machine::new(&prog);
    m.cpu.r[S0 as usize] = data;
    fill_group(&mut m.cpu, COL0, [1.0, 2.0, 3.0, 4.0]);
    fill_group(&mut m.cpu, BANK1, [0.25, 0.25, 0.25, 0.25]);
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);

    assert_eq!(m.cpu.exec_state(), ExecState::Halted);
    assert_eq!(m.cpu.v[regs[0] as usize], 1.25);
    assert_eq!(m.cpu.v[regs[1] as usize], 2.25);
    assert_eq!(m.cpu.v[regs[2] as usize], 3.25);
    assert_eq!(m.cpu.v[regs[3] as usize], 4.25);
    assert_eq!(m.cpu.r[T0 as usize], 1.25f32.to_bits());
    // Memory got the packed store in group order.
    assert_eq!(m.cpu.read32_unchecked(data), 1.25f32.to_bits());
    assert_eq!(m.cpu.read32_unchecked(data + 12), 4.25f32.to_bits());
}
