//! Guest CPU model: state block, memory map, instruction decoding, the
//! vector-unit register addressing scheme, and the interpreter that serves
//! as the translator's fallback and reference oracle.

pub mod decode;
pub mod interp;
pub mod mem;
pub mod state;
pub mod vreg;

pub use decode::{decode, Instr};
pub use mem::{GuestMemory, MemError, RAM_BASE, RAM_SIZE};
pub use state::{CpuState, ExecState, GPR_HI, GPR_LO, NUM_GPR_SLOTS, REG_RA, REG_ZERO};
pub use vreg::{get_vector_regs, overlaps_badly, vector_overlap, VectorSize};
