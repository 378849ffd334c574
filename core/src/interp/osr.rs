//! On-stack replacement handoff.
//!
//! The interpreter's side of the contract: when a backedge counter
//! overflows, ask the compiler bridge for an OSR method at the branch bci;
//! re-validate it (the bridge may invalidate concurrently), migrate the
//! frame's locals and monitors into a compiler-owned buffer, then transfer
//! control one-way into the compiled entry. The bridge itself — and any
//! real compilation — lives outside this crate; the default bridge never
//! compiles.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::rt::JavaThrowable;
use crate::value::{JValue, MethodId, ObjRef};

/// Compiled-code states; only `InUse` is enterable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmethodState {
    InUse = 0,
    NotEntrant = 1,
    Zombie = 2,
}

/// Locals and monitors of a migrating interpreter activation.
#[derive(Debug)]
pub struct OsrBuffer {
    /// Raw local slots, index 0 first.
    pub locals: Vec<u64>,
    /// Still-held monitors, top-of-block first: object and displaced mark.
    pub monitors: Vec<(ObjRef, u64)>,
    /// Bytecode index the OSR entry corresponds to.
    pub bci: usize,
}

pub type OsrEntry =
    Box<dyn Fn(OsrBuffer) -> Result<Option<JValue>, JavaThrowable> + Send + Sync>;

/// A compiled method with an OSR entry point.
pub struct OsrNmethod {
    state: AtomicU8,
    pub osr_bci: usize,
    entry: OsrEntry,
}

impl OsrNmethod {
    pub fn new(osr_bci: usize, entry: OsrEntry) -> OsrNmethod {
        OsrNmethod {
            state: AtomicU8::new(NmethodState::InUse as u8),
            osr_bci,
            entry,
        }
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.state.load(Ordering::Acquire) == NmethodState::InUse as u8
    }

    /// Deoptimization event: the nmethod may no longer be entered.
    pub fn invalidate(&self) {
        self.state.store(NmethodState::NotEntrant as u8, Ordering::Release);
    }

    pub fn enter(&self, buffer: OsrBuffer) -> Result<Option<JValue>, JavaThrowable> {
        (self.entry)(buffer)
    }
}

/// Seam to the JIT. `frequency_counter_overflow` may compile synchronously,
/// return an already-compiled nmethod, or decline with `None`.
pub trait CompilerBridge: Send + Sync {
    fn frequency_counter_overflow(
        &self,
        method: MethodId,
        branch_bci: usize,
    ) -> Option<Arc<OsrNmethod>>;
}

/// Bridge that never compiles; counters still run.
pub struct NullCompilerBridge;

impl CompilerBridge for NullCompilerBridge {
    fn frequency_counter_overflow(
        &self,
        _method: MethodId,
        _branch_bci: usize,
    ) -> Option<Arc<OsrNmethod>> {
        None
    }
}
