//! Cross-crate scenario tests for the vex translator.
//!
//! `asm` and `harness` are the shared scaffolding; each sibling module
//! covers one slice of observable behavior, always with the interpreter
//! as the oracle.

pub mod asm;
pub mod harness;

#[cfg(test)]
mod equivalence;
#[cfg(test)]
mod fallback;
#[cfg(test)]
mod folding;
#[cfg(test)]
mod linking;
#[cfg(test)]
mod memory;
#[cfg(test)]
mod vpu;
