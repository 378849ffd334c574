//! Invocation and backedge counters.
//!
//! Two homes for the same discipline: a plain `MethodCounters` object built
//! lazily by the first backward branch, and a `MethodData` profiling object
//! that, when present, takes precedence. Overflow is a mask test on the
//! post-increment value.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct InvocationCounter(AtomicU32);

impl InvocationCounter {
    pub fn new() -> InvocationCounter {
        InvocationCounter(AtomicU32::new(0))
    }

    /// Bump and report overflow: true when the post-increment count has all
    /// mask bits clear.
    #[inline]
    pub fn increment_and_test(&self, mask: u32) -> bool {
        let v = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        v & mask == 0
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lazily created per-method counter object.
#[derive(Debug)]
pub struct MethodCounters {
    pub invocation: InvocationCounter,
    pub backedge: InvocationCounter,
    pub invocation_mask: u32,
    pub backedge_mask: u32,
}

impl MethodCounters {
    pub fn new(invocation_mask: u32, backedge_mask: u32) -> MethodCounters {
        MethodCounters {
            invocation: InvocationCounter::new(),
            backedge: InvocationCounter::new(),
            invocation_mask,
            backedge_mask,
        }
    }
}

/// Per-method profiling data. Only the pieces the interpreter maintains:
/// the backedge counter the branch protocol prefers over `MethodCounters`,
/// and taken/not-taken branch profiles by bci.
#[derive(Debug)]
pub struct MethodData {
    pub backedge: InvocationCounter,
    pub backedge_mask: u32,
    taken: Box<[AtomicU32]>,
    not_taken: Box<[AtomicU32]>,
}

impl MethodData {
    pub fn new(code_len: usize, backedge_mask: u32) -> MethodData {
        let mut taken = Vec::with_capacity(code_len);
        taken.resize_with(code_len, || AtomicU32::new(0));
        let mut not_taken = Vec::with_capacity(code_len);
        not_taken.resize_with(code_len, || AtomicU32::new(0));
        MethodData {
            backedge: InvocationCounter::new(),
            backedge_mask,
            taken: taken.into_boxed_slice(),
            not_taken: not_taken.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn profile_taken_branch(&self, bci: usize) {
        if let Some(c) = self.taken.get(bci) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn profile_not_taken_branch(&self, bci: usize) {
        if let Some(c) = self.not_taken.get(bci) {
            c.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn taken_count(&self, bci: usize) -> u32 {
        self.taken[bci].load(Ordering::Relaxed)
    }

    pub fn not_taken_count(&self, bci: usize) -> u32 {
        self.not_taken[bci].load(Ordering::Relaxed)
    }
}
