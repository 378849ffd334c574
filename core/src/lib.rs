//! Template-interpreter core for a JVM-style bytecode machine.
//!
//! This crate implements the portable ("zero") execution model of a bytecode
//! template interpreter: the frame and operand-stack addressing model, the
//! constant-pool-cache resolution protocol, one handler per bytecode, and the
//! invocation/allocation/monitor/branch control-flow patterns those handlers
//! share. Code generation, garbage collection, and JIT compilation are
//! external collaborators reached through seams (`heap::barrier`,
//! `interp::osr::CompilerBridge`).

pub mod config;
pub mod heap;
pub mod interp;
pub mod meta;
pub mod rt;
pub mod value;
