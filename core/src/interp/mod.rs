//! The template interpreter: frame model, constant-pool cache, bytecode
//! dispatch, and the branch/OSR machinery.

pub mod bytecodes;
pub mod counters;
pub mod cpcache;
pub mod frame;
pub mod osr;
pub mod safepoint;
mod run;

pub use run::call_method;

#[cfg(test)]
mod interp_test;

use std::sync::Arc;

use crate::heap::Tlab;
use crate::rt::VmEnv;

use frame::JavaStack;
use safepoint::SafepointPoll;

/// One Java execution thread: its stack arena, allocation buffer, and
/// safepoint poll. Exclusively owned by the native thread driving it.
pub struct JavaThread {
    pub id: u16,
    pub stack: JavaStack,
    pub tlab: Tlab,
    pub poll: SafepointPoll,
    /// Decached top-of-stack, kept current around runtime calls so a
    /// reentrant invocation (e.g. `<clinit>`) stacks above live frames.
    pub(crate) top_sp: usize,
}

impl JavaThread {
    pub fn new(env: &Arc<VmEnv>) -> JavaThread {
        let stack = JavaStack::new(env.config.stack_words);
        let top_sp = stack.base_sp();
        JavaThread {
            id: env.next_thread_id(),
            stack,
            tlab: Tlab::new(),
            poll: SafepointPoll::new(env.safepoint.clone()),
            top_sp,
        }
    }
}
