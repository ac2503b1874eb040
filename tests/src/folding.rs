//! Constant-folding soundness and the canonical three-instruction
//! scenario.

use crate::asm::*;
use crate::harness::{Machine, START};
use vex_core::state::ExecState;
use vex_jit::{Jit, JitOptions};

const T0: u8 = 8;
const T1: u8 = 9;
const T2: u8 = 10;

/// addiu $t0,$zero,5 ; addiu $t1,$t0,3 ; beq $t0,$t0,label ; nop.
/// After one run to the next block boundary: $t0 == 5, $t1 == 8, and the
/// PC sits at the label — with zero host instructions for the two
/// all-immediate ALU ops.
#[test]
fn three_instruction_scenario() {
    let label = START + 6 * 4;
    let program = [
        addiu(T0, 0, 5),
        addiu(T1, T0, 3),
        beq(T0, T0, 3), // -> label
        nop(),
        nop(),
        nop(),
        // label:
        syscall(),
        nop(),
    ];
    let mut m = Machine::new(&program);
    // Four cycles in the block; a shorter timeslice stops execution at
    // the boundary after one pass.
    m.cpu.downcount = 3;
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);

    assert_eq!(m.cpu.exec_state(), ExecState::Halted);
    assert_eq!(m.cpu.r[T0 as usize], 5);
    assert_eq!(m.cpu.r[T1 as usize], 8);
    assert_eq!(m.cpu.pc, label);
}

/// Adding more all-immediate ALU instructions to a block must not grow
/// the generated code: the operations themselves emit nothing. Both
/// programs end with the same set of known registers to flush, so any
/// size difference would come from the folded instructions.
#[test]
fn folded_alu_ops_emit_no_host_code() {
    let short = [
        addiu(T0, 0, 5),
        beq(T0, T0, 4),
        nop(),
        nop(),
        nop(),
        nop(),
        syscall(),
        nop(),
    ];
    let long = [
        addiu(T0, 0, 5),
        addiu(T0, T0, 3),
        addiu(T0, T0, -3),
        beq(T0, T0, 2),
        nop(),
        nop(),
        syscall(),
        nop(),
    ];

    let size_of = |program: &[u32]| {
        let mut m = Machine::new(program);
        let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
        jit.compile_block(&mut m.cpu, START).expect("compile failed");
        let num = jit.block_cache().block_num_at(START).unwrap();
        jit.block_cache().block(num).code_size
    };

    assert_eq!(size_of(&short), size_of(&long));
}

/// Folded values must still reach memory at the block boundary.
#[test]
fn folded_values_are_flushed_at_block_end() {
    let program = [
        lui(T0, 0x1234),
        ori(T0, T0, 0x5678),
        sll(T1, T0, 4),
        nor(T2, T0, T1),
        syscall(),
        nop(),
    ];
    let mut m = Machine::new(&program);
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.r[T0 as usize], 0x1234_5678);
    assert_eq!(m.cpu.r[T1 as usize], 0x2345_6780);
    assert_eq!(m.cpu.r[T2 as usize], !(0x1234_5678 | 0x2345_6780u32));
}

/// Immediate-resolved branches fold away entirely under continuation.
#[test]
fn immediate_branch_continues_compilation() {
    let program = [
        addiu(T0, 0, 1),
        beq(T0, T0, 2), // always taken, target known at translation time
        nop(),
        addiu(T1, 0, 77), // skipped
        addiu(T1, 0, 42), // target
        syscall(),
        nop(),
    ];
    let mut m = Machine::new(&program);
    let mut jo = JitOptions::default();
    jo.continue_branches = true;
    let mut jit = Jit::with_default_callbacks(jo, &m.cpu);
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.r[T1 as usize], 42);

    // The continued region is tracked for invalidation (proxy block).
    let root = jit.block_cache().block_num_at(START).unwrap();
    assert!(jit.block_cache().block(root).original_size >= 1);
}
