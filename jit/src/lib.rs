//! Dynamic binary translator for the vex guest CPU on x86-64 hosts.
//!
//! The pieces, leaf first: the two register caches ([`gpr`], [`fpr`]),
//! the static liveness scan ([`analyst`]), guarded memory access emission
//! ([`safemem`]), the per-category opcode translators (`comp_*`), the
//! block cache with tagged-opcode linking ([`blocks`]), and the generated
//! dispatcher ([`dispatch`]). [`compiler::Jit`] owns all of it; see
//! `Jit::run` for the dispatch/translate cycle.

pub mod analyst;
pub mod blocks;
mod comp_alu;
mod comp_branch;
mod comp_fpu;
mod comp_loadstore;
mod comp_vpu;
pub mod compiler;
pub mod dispatch;
pub mod fpr;
pub mod gpr;
mod offsets;
pub mod options;
mod safemem;

pub use compiler::{CacheState, Jit, JitCallbacks};
pub use options::{JitDisable, JitOptions};
