//! Host code generation backend: the W^X code arena and the x86-64
//! instruction emitter.
//!
//! This crate knows nothing about the guest ISA. It owns exactly two
//! concerns: a page-aligned, writable-then-executable memory arena with a
//! write cursor, and one emit function per host instruction form. A second
//! host architecture would be a sibling module with the same shape.

pub mod arena;
pub mod x86_64;

pub use arena::CodeArena;
