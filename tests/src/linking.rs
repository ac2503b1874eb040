//! Block linking, unlinking and cache invalidation.

use crate::asm::*;
use crate::harness::{Machine, START};
use vex_core::state::ExecState;
use vex_jit::{Jit, JitDisable, JitOptions};

const T0: u8 = 8;

/// Two blocks A -> B: once both are compiled, A's exit stub is patched to
/// jump directly at B's unchecked entry; invalidating B restores the
/// dispatcher-return stub.
#[test]
fn link_then_unlink_on_invalidation() {
    let b_addr = START + 0x100;
    let program_a = [j(b_addr), nop()];
    let program_b = [addiu(T0, 0, 3), syscall(), nop()];

    let mut m = Machine::new(&program_a);
    m.mem.load_words(b_addr, &program_b);

    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);

    jit.compile_block(&mut m.cpu, START).unwrap();
    let a = jit.block_cache().block_num_at(START).unwrap();
    let exit = jit.block_cache().block(a).exits[0];
    assert_eq!(exit.target, b_addr);
    assert!(!exit.linked, "nothing to link against yet");

    jit.compile_block(&mut m.cpu, b_addr).unwrap();
    let b = jit.block_cache().block_num_at(b_addr).unwrap();
    let exit = jit.block_cache().block(a).exits[0];
    assert!(exit.linked, "compiling B must patch A's exit stub");

    // The whole chain still runs correctly through the direct link.
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.exec_state(), ExecState::Halted);
    assert_eq!(m.cpu.r[T0 as usize], 3);

    // Invalidate B: A's stub reverts to dispatcher-return and B's tag
    // disappears from guest memory.
    jit.invalidate_range(&mut m.cpu, b_addr, b_addr + 4);
    let exit = jit.block_cache().block(a).exits[0];
    assert!(!exit.linked, "invalidation must unpatch the stub");
    assert!(jit.block_cache().block(b).invalid);
    assert_eq!(jit.block_cache().block_num_at(b_addr), None);
    assert_eq!(m.cpu.read32_unchecked(b_addr), program_b[0]);

    // Re-running recompiles B and still produces the same result.
    m.cpu.pc = START;
    m.cpu.set_exec_state(ExecState::Running);
    m.cpu.r[T0 as usize] = 0;
    m.cpu.downcount = 1 << 24;
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.r[T0 as usize], 3);
}

#[test]
fn blocklink_disable_flag_is_honored() {
    let b_addr = START + 0x100;
    let program_a = [j(b_addr), nop()];
    let program_b = [syscall(), nop()];

    let mut m = Machine::new(&program_a);
    m.mem.load_words(b_addr, &program_b);

    let mut jo = JitOptions::default();
    jo.disabled |= JitDisable::BLOCKLINK;
    let mut jit = Jit::with_default_callbacks(jo, &m.cpu);
    jit.compile_block(&mut m.cpu, START).unwrap();
    jit.compile_block(&mut m.cpu, b_addr).unwrap();
    let a = jit.block_cache().block_num_at(START).unwrap();
    assert!(!jit.block_cache().block(a).exits[0].linked);
}

/// The tag written over a block's first instruction is masked out for
/// outside readers and restored afterwards.
#[test]
fn memory_snapshot_masks_tags() {
    let program = [addiu(T0, 0, 1), syscall(), nop()];
    let mut m = Machine::new(&program);
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);

    let tagged = m.cpu.read32_unchecked(START);
    assert_ne!(tagged, program[0], "a live block leaves a tag in memory");

    let saved = jit.prepare_memory_snapshot(&mut m.cpu);
    assert_eq!(m.cpu.read32_unchecked(START), program[0]);
    jit.finish_memory_snapshot(&mut m.cpu, &saved);
    assert_eq!(m.cpu.read32_unchecked(START), tagged);
}

/// Self-modifying guest code: overwriting a compiled block's first
/// instruction and invalidating makes the new code take effect.
#[test]
fn invalidation_follows_self_modification() {
    let program = [addiu(T0, 0, 1), syscall(), nop()];
    let mut m = Machine::new(&program);
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.r[T0 as usize], 1);

    // Guest writes new code over the block.
    jit.invalidate_range(&mut m.cpu, START, START + 4);
    m.cpu.write32_unchecked(START, addiu(T0, 0, 99));

    m.cpu.pc = START;
    m.cpu.set_exec_state(ExecState::Running);
    m.cpu.downcount = 1 << 24;
    jit.run(&mut m.cpu);
    assert_eq!(m.cpu.r[T0 as usize], 99);
}

/// Whole-cache clear drops every tag and block.
#[test]
fn clear_cache_restores_all_tags() {
    let program = [addiu(T0, 0, 1), syscall(), nop()];
    let mut m = Machine::new(&program);
    let mut jit = Jit::with_default_callbacks(JitOptions::default(), &m.cpu);
    jit.run(&mut m.cpu);
    assert!(vex_jit::blocks::BlockCache::is_tag(m.cpu.read32_unchecked(START)));

    jit.clear_cache(&mut m.cpu);
    assert_eq!(m.cpu.read32_unchecked(START), program[0]);
    assert_eq!(jit.block_cache().num_blocks(), 0);
}
