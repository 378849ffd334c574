use serde::{Deserialize, Serialize};

/// Runtime knobs the interpreter dispatches on.
///
/// These correspond to the switches a template interpreter consults while
/// emitting or executing bytecode handlers; they are fixed for the lifetime
/// of a [`crate::rt::VmEnv`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Use thread-local allocation buffers for the instance fast path.
    pub use_tlab: bool,
    /// TLAB memory is guaranteed pre-zeroed; skip explicit field clearing.
    pub zero_tlab: bool,
    /// Allow in-place quickening rewrites of the bytecode stream.
    pub rewrite_bytecodes: bool,
    /// Rewrite frequent bytecode pairs (`iload;iload`, `aload_0;getfield`).
    pub rewrite_frequent_pairs: bool,
    /// Maintain invocation/backedge counters.
    pub use_loop_counter: bool,
    /// Hand hot loops to the compiler bridge via on-stack replacement.
    pub use_on_stack_replacement: bool,
    /// Prefer per-method profiling data counters over the plain counters.
    pub profile_interpreter: bool,
    /// Perform the fast class-initialization check on `invokestatic`.
    pub fast_class_init_checks: bool,
    /// Backedge counter mask; overflow when `counter & mask == 0`.
    pub backedge_mask: u32,
    /// Invocation counter mask.
    pub invocation_mask: u32,
    /// Emit a full fence before volatile reads (IRIW-safe discipline).
    pub strong_volatile_fences: bool,
    /// Heap arena size in words.
    pub heap_words: usize,
    /// TLAB refill size in words.
    pub tlab_words: usize,
    /// Per-thread expression-stack arena size in words.
    pub stack_words: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            use_tlab: true,
            zero_tlab: false,
            rewrite_bytecodes: true,
            rewrite_frequent_pairs: true,
            use_loop_counter: true,
            use_on_stack_replacement: true,
            profile_interpreter: false,
            fast_class_init_checks: true,
            backedge_mask: 0x3ff,
            invocation_mask: 0x3ff,
            strong_volatile_fences: true,
            heap_words: 1 << 20,
            tlab_words: 8 * 1024,
            stack_words: 64 * 1024,
        }
    }
}
