//! x86-64 host backend: register definitions and instruction emitter.

pub mod emitter;
pub mod regs;

pub use emitter::{ArithOp, CmpPsOp, Cond, Ext3Op, FixupBranch, RoundMode, ShiftOp};
pub use regs::{Reg, Xmm, CALLEE_SAVED, CALL_ARG_REGS, CTX, MEMBASE};
