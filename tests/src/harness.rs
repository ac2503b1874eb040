//! Shared scaffolding: build a machine, run a program under the
//! interpreter and the translator, compare the full guest state.

use std::sync::Once;

use vex_core::interp;
use vex_core::mem::{GuestMemory, RAM_BASE};
use vex_core::state::{CpuState, ExecState};
use vex_jit::{Jit, JitOptions};

pub const START: u32 = RAM_BASE + 0x1000;

/// `RUST_LOG=vex_jit=trace` shows per-instruction translation decisions.
pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub struct Machine {
    pub cpu: Box<CpuState>,
    pub mem: GuestMemory,
}

impl Machine {
    pub fn new(program: &[u32]) -> Self {
        init_logging();
        let mut mem = GuestMemory::with_default_size();
        let mut cpu = Box::new(CpuState::new());
        mem.attach(&mut cpu);
        mem.load_words(START, program);
        cpu.pc = START;
        cpu.downcount = 1 << 24;
        Self { cpu, mem }
    }
}

/// A comparable snapshot of the architectural state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub r: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub fp_cond: u32,
    pub vcmp: u32,
    pub f: [u32; 32],
    pub v: Vec<u32>,
    pub pc: u32,
    pub exec_state: u32,
    pub last_fault_addr: u32,
}

pub fn snapshot(cpu: &CpuState) -> Snapshot {
    Snapshot {
        r: cpu.r,
        hi: cpu.hi,
        lo: cpu.lo,
        fp_cond: cpu.fp_cond,
        vcmp: cpu.vcmp,
        f: cpu.f.map(f32::to_bits),
        v: cpu.v.iter().map(|f| f.to_bits()).collect(),
        pc: cpu.pc,
        exec_state: cpu.exec_state,
        last_fault_addr: cpu.last_fault_addr,
    }
}

/// Run under the interpreter until the CPU stops.
pub fn run_interp(program: &[u32], setup: impl Fn(&mut CpuState)) -> Snapshot {
    let mut m = Machine::new(program);
    setup(&mut m.cpu);
    interp::run(&mut m.cpu, 1 << 20);
    assert_ne!(
        m.cpu.exec_state(),
        ExecState::Running,
        "interpreter did not terminate"
    );
    snapshot(&m.cpu)
}

/// Run under the translator until the CPU stops.
pub fn run_jit_with(program: &[u32], jo: JitOptions, setup: impl Fn(&mut CpuState)) -> Snapshot {
    let mut m = Machine::new(program);
    setup(&mut m.cpu);
    let mut jit = Jit::with_default_callbacks(jo, &m.cpu);
    jit.run(&mut m.cpu);
    assert_ne!(
        m.cpu.exec_state(),
        ExecState::Running,
        "translated code did not terminate"
    );
    // Tagged block opcodes must never leak into a memory snapshot.
    let saved = jit.prepare_memory_snapshot(&mut m.cpu);
    let snap = snapshot(&m.cpu);
    jit.finish_memory_snapshot(&mut m.cpu, &saved);
    snap
}

pub fn run_jit(program: &[u32], setup: impl Fn(&mut CpuState)) -> Snapshot {
    run_jit_with(program, JitOptions::default(), setup)
}

/// The equivalence oracle: translating and running must match
/// interpreting exactly, across every option set worth exercising.
pub fn assert_equivalent(program: &[u32], setup: impl Fn(&mut CpuState) + Copy) {
    let reference = run_interp(program, setup);

    let default = run_jit(program, setup);
    assert_eq!(reference, default, "jit (default options) diverged");

    let mut fast = JitOptions::default();
    fast.fast_memory = true;
    let fastmem = run_jit_with(program, fast, setup);
    assert_eq!(reference, fastmem, "jit (fast memory) diverged");

    let mut cont = JitOptions::default();
    cont.continue_branches = true;
    let continued = run_jit_with(program, cont, setup);
    assert_eq!(reference, continued, "jit (branch continuation) diverged");
}
