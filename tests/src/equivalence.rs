//! Equivalence: for every supported opcode and representative operand
//! values (zero, extremes, NaN/Inf for floats), translating-and-running a
//! program must leave the guest state identical to interpreting it.

use crate::asm::*;
use crate::harness::{assert_equivalent, START};
use vex_core::mem::RAM_BASE;

const T0: u8 = 8;
const T1: u8 = 9;
const T2: u8 = 10;
const T3: u8 = 11;
const S0: u8 = 16;

/// Integer operand values that tend to break ALU codegen.
const INT_EDGES: &[u32] = &[0, 1, 0xffff_ffff, 0x7fff_ffff, 0x8000_0000, 0x1234_5678, 0xfffe];

fn alu_program(op_word: u32) -> Vec<u32> {
    vec![op_word, syscall(), nop()]
}

#[test]
fn alu_reg_ops_match_interpreter() {
    let ops: &[fn(u8, u8, u8) -> u32] = &[addu, subu, and, or, xor, nor, slt, sltu, min, max];
    for &op in ops {
        for &a in INT_EDGES {
            for &b in INT_EDGES {
                assert_equivalent(&alu_program(op(T2, T0, T1)), move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T1 as usize] = b;
                });
                // Destination aliasing the sources.
                assert_equivalent(&alu_program(op(T0, T0, T1)), move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T1 as usize] = b;
                });
                assert_equivalent(&alu_program(op(T1, T0, T1)), move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T1 as usize] = b;
                });
            }
        }
    }
}

#[test]
fn alu_imm_ops_match_interpreter() {
    for &a in INT_EDGES {
        for imm in [0i16, 1, -1, i16::MAX, i16::MIN, 0x7ff] {
            for word in [
                addiu(T1, T0, imm),
                slti(T1, T0, imm),
                sltiu(T1, T0, imm),
                andi(T1, T0, imm as u16),
                ori(T1, T0, imm as u16),
                xori(T1, T0, imm as u16),
            ] {
                assert_equivalent(&alu_program(word), move |cpu| {
                    cpu.r[T0 as usize] = a;
                });
            }
        }
    }
}

#[test]
fn zero_register_reads_and_writes() {
    // Writes to $0 vanish; reads substitute 0.
    assert_equivalent(
        &[
            addiu(0, 0, 1234),
            addu(T0, 0, 0),
            addiu(T1, 0, -1),
            sll(0, T1, 4),
            syscall(),
            nop(),
        ],
        |_| {},
    );
}

#[test]
fn bitfield_ops_match_interpreter() {
    for &a in INT_EDGES {
        for word in [
            ext(T1, T0, 4, 8),
            ext(T1, T0, 0, 32),
            ext(T1, T0, 31, 1),
            ins(T1, T0, 8, 16),
            ins(T1, T0, 0, 32),
            seb(T1, T0),
            seh(T1, T0),
            clz(T1, T0),
            clo(T1, T0),
        ] {
            assert_equivalent(&alu_program(word), move |cpu| {
                cpu.r[T0 as usize] = a;
                cpu.r[T1 as usize] = 0xdead_beef;
            });
        }
    }
}

#[test]
fn shifts_match_interpreter() {
    for &a in INT_EDGES {
        for sa in [0u8, 1, 15, 31] {
            for word in [sll(T1, T0, sa), srl(T1, T0, sa), sra(T1, T0, sa), rotr(T1, T0, sa)] {
                assert_equivalent(&alu_program(word), move |cpu| {
                    cpu.r[T0 as usize] = a;
                });
            }
        }
        for amt in [0u32, 1, 31, 32, 33, 0xff] {
            for word in [sllv(T1, T0, T2), srlv(T1, T0, T2), srav(T1, T0, T2), rotrv(T1, T0, T2)] {
                assert_equivalent(&alu_program(word), move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T2 as usize] = amt;
                });
            }
        }
    }
}

#[test]
fn movz_movn_match_interpreter() {
    for &cond in &[0u32, 1, 0xffff_ffff] {
        for word in [movz(T2, T0, T1), movn(T2, T0, T1)] {
            assert_equivalent(&alu_program(word), move |cpu| {
                cpu.r[T0 as usize] = 0xaaaa_5555;
                cpu.r[T1 as usize] = cond;
                cpu.r[T2 as usize] = 0x1111_2222;
            });
        }
    }
}

#[test]
fn muldiv_match_interpreter() {
    for &a in INT_EDGES {
        for &b in INT_EDGES {
            for word in [mult(T0, T1), multu(T0, T1), div(T0, T1), divu(T0, T1), mul(T2, T0, T1)] {
                assert_equivalent(
                    &[word, mfhi(T2), mflo(T3), syscall(), nop()],
                    move |cpu| {
                        cpu.r[T0 as usize] = a;
                        cpu.r[T1 as usize] = b;
                    },
                );
            }
            assert_equivalent(
                &[mthi(T0), mtlo(T1), madd(T0, T1), mfhi(T2), mflo(T3), syscall(), nop()],
                move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T1 as usize] = b;
                },
            );
            assert_equivalent(
                &[msub(T0, T1), mfhi(T2), mflo(T3), syscall(), nop()],
                move |cpu| {
                    cpu.r[T0 as usize] = a;
                    cpu.r[T1 as usize] = b;
                    cpu.hi = 0x1234;
                    cpu.lo = 0x9999_9999;
                },
            );
        }
    }
}

#[test]
fn div_by_zero_and_overflow_are_defined() {
    assert_equivalent(&[div(T0, T1), mfhi(T2), mflo(T3), syscall(), nop()], |cpu| {
        cpu.r[T0 as usize] = 0x8000_0000;
        cpu.r[T1 as usize] = 0xffff_ffff;
    });
    assert_equivalent(&[divu(T0, T1), mfhi(T2), mflo(T3), syscall(), nop()], |cpu| {
        cpu.r[T0 as usize] = 7;
        cpu.r[T1 as usize] = 0;
    });
}

#[test]
fn branches_match_interpreter() {
    for &(a, b) in &[(0u32, 0u32), (1, 2), (0xffff_ffff, 1), (5, 5)] {
        for word in [beq(T0, T1, 2), bne(T0, T1, 2), beql(T0, T1, 2), bnel(T0, T1, 2)] {
            // not taken path: t2 = 7; taken path skips to t3 = 9.
            let prog = vec![
                word,
                addiu(T3, 0, 1), // delay slot
                addiu(T2, 0, 7),
                syscall(),
                addiu(T2, 0, 9), // branch target
                syscall(),
                nop(),
            ];
            assert_equivalent(&prog, move |cpu| {
                cpu.r[T0 as usize] = a;
                cpu.r[T1 as usize] = b;
            });
        }
    }
    for &a in &[0u32, 1, 0x8000_0000, 0x7fff_ffff] {
        for word in [blez(T0, 2), bgtz(T0, 2), bltz(T0, 2), bgez(T0, 2)] {
            let prog = vec![
                word,
                addiu(T3, 0, 1),
                addiu(T2, 0, 7),
                syscall(),
                addiu(T2, 0, 9),
                syscall(),
                nop(),
            ];
            assert_equivalent(&prog, move |cpu| {
                cpu.r[T0 as usize] = a;
            });
        }
    }
}

#[test]
fn non_nice_delay_slot_preserves_branch_decision() {
    // The slot overwrites a branch source register: the branch must have
    // captured its decision first (host flags survive the slot).
    for &(a, b) in &[(5u32, 5u32), (5, 6)] {
        let prog = vec![
            beq(T0, T1, 2),
            addiu(T0, 0, 999), // slot clobbers rs
            addiu(T2, 0, 7),
            syscall(),
            addiu(T2, 0, 9),
            syscall(),
            nop(),
        ];
        assert_equivalent(&prog, move |cpu| {
            cpu.r[T0 as usize] = a;
            cpu.r[T1 as usize] = b;
        });
    }
}

#[test]
fn branch_and_link_writes_ra_even_when_not_taken() {
    for &a in &[1u32, 0x8000_0000] {
        let prog = vec![
            bltzal(T0, 2),
            nop(),
            addiu(T2, 0, 7),
            syscall(),
            addiu(T2, 0, 9),
            syscall(),
            nop(),
        ];
        assert_equivalent(&prog, move |cpu| {
            cpu.r[T0 as usize] = a;
        });
    }
}

#[test]
fn jumps_and_calls_match_interpreter() {
    let target = START + 5 * 4;
    assert_equivalent(
        &[
            j(target),
            addiu(T0, 0, 1),
            addiu(T2, 0, 7), // skipped
            syscall(),
            nop(),
            addiu(T2, 0, 9), // target
            syscall(),
            nop(),
        ],
        |_| {},
    );
    assert_equivalent(
        &[
            jal(target),
            addiu(T0, 0, 1),
            addiu(T2, 0, 7),
            syscall(),
            nop(),
            addiu(T2, 0, 9),
            syscall(),
            nop(),
        ],
        |_| {},
    );
    // jr through a register value set at run time.
    assert_equivalent(
        &[
            jr(S0),
            addiu(T0, 0, 1),
            addiu(T2, 0, 7),
            syscall(),
            nop(),
            addiu(T2, 0, 9),
            syscall(),
            nop(),
        ],
        move |cpu| {
            cpu.r[S0 as usize] = target;
        },
    );
    // jalr with the delay slot overwriting the jump source.
    assert_equivalent(
        &[
            jalr(T3, S0),
            addiu(S0, 0, 77),
            addiu(T2, 0, 7),
            syscall(),
            nop(),
            addiu(T2, 0, 9),
            syscall(),
            nop(),
        ],
        move |cpu| {
            cpu.r[S0 as usize] = target;
        },
    );
}

#[test]
fn likely_branch_skips_delay_slot_when_not_taken() {
    assert_equivalent(
        &[
            beql(T0, T1, 2),
            addiu(T2, 0, 111), // must not run when not taken
            addiu(T3, 0, 7),
            syscall(),
            addiu(T3, 0, 9),
            syscall(),
            nop(),
        ],
        |cpu| {
            cpu.r[T0 as usize] = 1;
            cpu.r[T1 as usize] = 2;
        },
    );
}

#[test]
fn loads_and_stores_match_interpreter() {
    let data = RAM_BASE + 0x8000;
    let setup = move |cpu: &mut vex_core::CpuState| {
        cpu.r[S0 as usize] = data;
        cpu.write32_unchecked(data, 0x8899_aabb);
        cpu.write32_unchecked(data + 4, 0x1122_3344);
    };
    for word in [
        lb(T0, S0, 0),
        lb(T0, S0, 3),
        lbu(T0, S0, 1),
        lh(T0, S0, 0),
        lh(T0, S0, 2),
        lhu(T0, S0, 0),
        lw(T0, S0, 0),
        lw(T0, S0, 4),
        lw(T0, S0, -4),
    ] {
        assert_equivalent(&[word, syscall(), nop()], setup);
    }
    for word in [sb(T1, S0, 5), sh(T1, S0, 6), sw(T1, S0, 8)] {
        assert_equivalent(
            &[word, lw(T2, S0, 4), lw(T3, S0, 8), syscall(), nop()],
            move |cpu| {
                setup(cpu);
                cpu.r[T1 as usize] = 0xcafe_f00d;
            },
        );
    }
}

#[test]
fn fpu_arith_matches_interpreter() {
    let edges: &[f32] = &[
        0.0,
        -0.0,
        1.5,
        -3.25,
        f32::NAN,
        f32::INFINITY,
        f32::NEG_INFINITY,
        f32::MIN,
        f32::MAX,
    ];
    for &a in edges {
        for &b in edges {
            for word in [
                add_s(2, 0, 1),
                sub_s(2, 0, 1),
                mul_s(2, 0, 1),
                div_s(2, 0, 1),
                add_s(0, 0, 1),
                sub_s(1, 0, 1),
            ] {
                assert_equivalent(&[word, syscall(), nop()], move |cpu| {
                    cpu.f[0] = a;
                    cpu.f[1] = b;
                });
            }
            for word in [c_eq_s(0, 1), c_lt_s(0, 1), c_le_s(0, 1)] {
                assert_equivalent(&[word, syscall(), nop()], move |cpu| {
                    cpu.f[0] = a;
                    cpu.f[1] = b;
                });
            }
        }
        for word in [abs_s(2, 0), neg_s(2, 0), mov_s(2, 0), sqrt_s(2, 0)] {
            assert_equivalent(&[word, syscall(), nop()], move |cpu| {
                cpu.f[0] = a;
            });
        }
    }
}

#[test]
fn fpu_conversions_saturate_like_the_interpreter() {
    let edges: &[f32] = &[
        0.0,
        1.4,
        1.5,
        2.5,
        -1.5,
        -2147483648.0,
        2147483648.0,
        3.0e9,
        -3.0e9,
        f32::NAN,
    ];
    for &a in edges {
        for word in [trunc_w_s(2, 0), floor_w_s(2, 0), cvt_w_s(2, 0)] {
            assert_equivalent(&[word, syscall(), nop()], move |cpu| {
                cpu.f[0] = a;
            });
        }
    }
    for &bits in &[0u32, 1, 0x7fff_ffff, 0x8000_0000, 0xffff_ffff] {
        assert_equivalent(&[cvt_s_w(2, 0), syscall(), nop()], move |cpu| {
            cpu.f[0] = f32::from_bits(bits);
        });
    }
}

#[test]
fn fpu_transfers_and_memory() {
    let data = RAM_BASE + 0x8000;
    assert_equivalent(
        &[
            lwc1(4, S0, 0),
            mfc1(T0, 4),
            mtc1(T1, 5),
            swc1(5, S0, 8),
            lw(T2, S0, 8),
            syscall(),
            nop(),
        ],
        move |cpu| {
            cpu.r[S0 as usize] = data;
            cpu.r[T1 as usize] = 0x3f80_0000;
            cpu.write32_unchecked(data, 0x4048_f5c3);
        },
    );
}

#[test]
fn fpu_branch_matches_interpreter() {
    for &(a, b) in &[(1.0f32, 2.0f32), (2.0, 1.0), (f32::NAN, 1.0)] {
        for word in [bc1t(2), bc1f(2)] {
            assert_equivalent(
                &[
                    c_lt_s(0, 1),
                    word,
                    nop(),
                    addiu(T2, 0, 7),
                    syscall(),
                    addiu(T2, 0, 9),
                    syscall(),
                    nop(),
                ],
                move |cpu| {
                    cpu.f[0] = a;
                    cpu.f[1] = b;
                },
            );
        }
    }
}
