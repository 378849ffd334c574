//! Interpreter frame layout and operand-stack/locals addressing.
//!
//! Activations live in a per-thread word arena. The stack grows downward
//! (toward index 0). A frame is addressed by its frame-pointer index with
//! fixed word offsets; below the fixed header sits the monitor block, and
//! below that the expression stack:
//!
//! ```text
//!   locals_base          -> local 0 (== first argument slot)
//!   ...                     locals, descending
//!   fp + 1               -> return info (caller resume bci)
//!   fp + 0               -> link (caller fp)
//!   fp - 1 .. fp - 8     -> sender sp, last sp, method, mdx,
//!                           oop temp, cache, locals, bcx
//!   fp - 9               -> monitor block top (stored index)
//!   [monitor records]       2 words each, newest at the lowest index
//!   [expression stack]      grows down from the monitor block top
//! ```
//!
//! Local n is addressed at `locals_base - n` (local 0 farthest from the
//! frame pointer); category-2 locals span slots n and n+1 with the value in
//! the higher-numbered slot's position.

use crate::meta::Method;
use crate::rt::{JavaExKind, JavaThrowable};
use crate::value::{
    bits_double, bits_float, bits_int, bits_long, double_bits, float_bits, int_bits, long_bits,
    MethodId, ObjRef, PoolId,
};

pub const RETURN_INFO_OFFSET: isize = 1;
pub const LINK_OFFSET: isize = 0;
pub const SENDER_SP_OFFSET: isize = -1;
pub const LAST_SP_OFFSET: isize = -2;
pub const METHOD_OFFSET: isize = -3;
pub const MDX_OFFSET: isize = -4;
pub const OOP_TEMP_OFFSET: isize = -5;
pub const CACHE_OFFSET: isize = -6;
pub const LOCALS_OFFSET: isize = -7;
pub const BCX_OFFSET: isize = -8;
pub const MONITOR_BLOCK_TOP_OFFSET: isize = -9;

/// Words between the frame pointer and the monitor block.
pub const FRAME_HEADER_WORDS: usize = 9;
/// Words in one monitor record: displaced mark, then object.
pub const MONITOR_SLOTS: usize = 2;

/// Caller fp of the entry frame.
pub const SENTINEL_FP: u64 = u64::MAX;

/// Per-thread stack arena.
pub struct JavaStack {
    words: Vec<u64>,
    limit: usize,
}

impl JavaStack {
    pub fn new(words: usize) -> JavaStack {
        JavaStack {
            words: vec![0; words],
            // Red zone at the low end; running into it is StackOverflowError.
            limit: 32,
        }
    }

    #[inline]
    pub fn word(&self, index: usize) -> u64 {
        self.words[index]
    }

    #[inline]
    pub fn set_word(&mut self, index: usize, v: u64) {
        self.words[index] = v;
    }

    /// Initial stack pointer: next free slot at the high end.
    pub fn base_sp(&self) -> usize {
        self.words.len() - 1
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Handle on one activation; all state lives in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub fp: usize,
}

impl Frame {
    #[inline]
    fn index(&self, offset: isize) -> usize {
        (self.fp as isize + offset) as usize
    }

    /// Raw word at a frame-relative offset. No bounds discipline beyond the
    /// arena's own; callers must pass a defined offset.
    #[inline]
    pub fn ptr_at(&self, stack: &JavaStack, offset: isize) -> u64 {
        stack.word(self.index(offset))
    }

    #[inline]
    pub fn ptr_at_put(&self, stack: &mut JavaStack, offset: isize, v: u64) {
        stack.set_word(self.index(offset), v);
    }

    #[inline]
    pub fn method_id(&self, stack: &JavaStack) -> MethodId {
        MethodId(self.ptr_at(stack, METHOD_OFFSET) as u32)
    }

    #[inline]
    pub fn pool_id(&self, stack: &JavaStack) -> PoolId {
        PoolId(self.ptr_at(stack, CACHE_OFFSET) as u32)
    }

    #[inline]
    pub fn locals_base(&self, stack: &JavaStack) -> usize {
        self.ptr_at(stack, LOCALS_OFFSET) as usize
    }

    #[inline]
    pub fn bcx(&self, stack: &JavaStack) -> usize {
        self.ptr_at(stack, BCX_OFFSET) as usize
    }

    #[inline]
    pub fn set_bcx(&self, stack: &mut JavaStack, bci: usize) {
        self.ptr_at_put(stack, BCX_OFFSET, bci as u64);
    }

    /// Saved outgoing stack pointer, recorded around runtime calls and
    /// invocations so a stack walker can find the live operand-stack range.
    #[inline]
    pub fn interpreter_frame_last_sp(&self, stack: &JavaStack) -> Option<usize> {
        match self.ptr_at(stack, LAST_SP_OFFSET) {
            0 => None,
            v => Some(v as usize),
        }
    }

    #[inline]
    pub fn interpreter_frame_set_last_sp(&self, stack: &mut JavaStack, sp: Option<usize>) {
        self.ptr_at_put(stack, LAST_SP_OFFSET, sp.map_or(0, |v| v as u64));
    }

    /// Return address of this activation: the caller's resume bci.
    #[inline]
    pub fn sender_pc(&self, stack: &JavaStack) -> u64 {
        self.ptr_at(stack, RETURN_INFO_OFFSET)
    }

    #[inline]
    pub fn link(&self, stack: &JavaStack) -> u64 {
        self.ptr_at(stack, LINK_OFFSET)
    }

    #[inline]
    pub fn sender_sp(&self, stack: &JavaStack) -> usize {
        self.ptr_at(stack, SENDER_SP_OFFSET) as usize
    }

    /// Monitor-block boundary nearest the header; records live strictly
    /// below this index.
    #[inline]
    pub fn monitor_block_bottom(&self) -> usize {
        self.index(MONITOR_BLOCK_TOP_OFFSET)
    }

    /// Index of the newest monitor record; equals the bottom when empty.
    #[inline]
    pub fn monitor_block_top(&self, stack: &JavaStack) -> usize {
        self.ptr_at(stack, MONITOR_BLOCK_TOP_OFFSET) as usize
    }

    #[inline]
    pub fn set_monitor_block_top(&self, stack: &mut JavaStack, top: usize) {
        self.ptr_at_put(stack, MONITOR_BLOCK_TOP_OFFSET, top as u64);
    }

    /// Monitor records from the newest (top) to the oldest (bottom).
    pub fn monitors(&self, stack: &JavaStack) -> impl Iterator<Item = MonitorRecord> {
        let top = self.monitor_block_top(stack);
        let bottom = self.monitor_block_bottom();
        (top..bottom)
            .step_by(MONITOR_SLOTS)
            .map(|index| MonitorRecord { index })
    }

    /// Grow the monitor block by one record: shift the expression stack
    /// down a record's worth, word by word, and move the stored top. The
    /// new record is the block's new top; its words are left for the caller
    /// to fill. Fails when the shift would run into the stack limit.
    pub fn grow_monitor_block(
        &self,
        stack: &mut JavaStack,
        sp: &mut usize,
    ) -> Result<MonitorRecord, JavaThrowable> {
        if *sp < stack.limit() + MONITOR_SLOTS {
            return Err(JavaThrowable::bare(JavaExKind::StackOverflowError));
        }
        let old_top = self.monitor_block_top(stack);
        // Expression-stack words occupy (sp, old_top); copy lowest first.
        for idx in (*sp + 1)..old_top {
            let w = stack.word(idx);
            stack.set_word(idx - MONITOR_SLOTS, w);
        }
        let new_top = old_top - MONITOR_SLOTS;
        self.set_monitor_block_top(stack, new_top);
        *sp -= MONITOR_SLOTS;
        Ok(MonitorRecord { index: new_top })
    }
}

/// One lock record inside a frame's monitor block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorRecord {
    /// Lowest word index of the record.
    pub index: usize,
}

impl MonitorRecord {
    #[inline]
    pub fn obj(&self, stack: &JavaStack) -> Option<ObjRef> {
        ObjRef::from_bits(stack.word(self.index + 1))
    }

    #[inline]
    pub fn set_obj(&self, stack: &mut JavaStack, obj: Option<ObjRef>) {
        stack.set_word(self.index + 1, ObjRef::bits(obj));
    }

    #[inline]
    pub fn displaced_header(&self, stack: &JavaStack) -> u64 {
        stack.word(self.index)
    }

    #[inline]
    pub fn set_displaced_header(&self, stack: &mut JavaStack, mark: u64) {
        stack.set_word(self.index, mark);
    }
}

/// Push an interpreter activation. The arguments are already on the caller's
/// expression stack and become the callee's first locals; `sp` is the
/// caller's next-free slot below them.
pub fn push_interpreter_frame(
    stack: &mut JavaStack,
    caller_fp: u64,
    return_bci: usize,
    sp_after_args: usize,
    method_id: MethodId,
    method: &Method,
) -> Result<(Frame, usize), JavaThrowable> {
    let param_slots = method.param_slots();
    let max_locals = (method.max_locals as usize).max(param_slots);
    let locals_base = sp_after_args + param_slots;
    let fp = locals_base
        .checked_sub(max_locals + 1)
        .ok_or_else(|| JavaThrowable::bare(JavaExKind::StackOverflowError))?;
    let lowest_needed = fp
        .checked_sub(FRAME_HEADER_WORDS + method.max_stack as usize)
        .unwrap_or(0);
    if lowest_needed <= stack.limit() {
        return Err(JavaThrowable::bare(JavaExKind::StackOverflowError));
    }

    // Extra locals beyond the arguments start out zeroed.
    for n in param_slots..max_locals {
        stack.set_word(locals_base - n, 0);
    }

    let frame = Frame { fp };
    frame.ptr_at_put(stack, RETURN_INFO_OFFSET, return_bci as u64);
    frame.ptr_at_put(stack, LINK_OFFSET, caller_fp);
    frame.ptr_at_put(stack, SENDER_SP_OFFSET, locals_base as u64);
    frame.ptr_at_put(stack, LAST_SP_OFFSET, 0);
    frame.ptr_at_put(stack, METHOD_OFFSET, method_id.0 as u64);
    frame.ptr_at_put(stack, MDX_OFFSET, 0);
    frame.ptr_at_put(stack, OOP_TEMP_OFFSET, 0);
    frame.ptr_at_put(stack, CACHE_OFFSET, method.pool.0 as u64);
    frame.ptr_at_put(stack, LOCALS_OFFSET, locals_base as u64);
    frame.ptr_at_put(stack, BCX_OFFSET, 0);
    let bottom = frame.monitor_block_bottom();
    frame.set_monitor_block_top(stack, bottom);

    let sp = bottom - 1;
    Ok((frame, sp))
}

// Locals addressing. All pure index computation; the sign convention is
// descending from the locals base and must agree with the frame layout
// above.

#[inline]
pub fn iaddress(locals_base: usize, n: usize) -> usize {
    locals_base - n
}

#[inline]
pub fn faddress(locals_base: usize, n: usize) -> usize {
    iaddress(locals_base, n)
}

#[inline]
pub fn aaddress(locals_base: usize, n: usize) -> usize {
    iaddress(locals_base, n)
}

/// Category-2 local n spans slots n and n+1; the value word sits at the
/// second slot's position.
#[inline]
pub fn laddress(locals_base: usize, n: usize) -> usize {
    locals_base - n - 1
}

#[inline]
pub fn daddress(locals_base: usize, n: usize) -> usize {
    laddress(locals_base, n)
}

// Expression-stack addressing relative to the current sp (next free slot,
// descending).

#[inline]
pub fn at_tos(sp: usize) -> usize {
    sp + 1
}

#[inline]
pub fn at_tos_p1(sp: usize) -> usize {
    sp + 2
}

#[inline]
pub fn at_tos_p2(sp: usize) -> usize {
    sp + 3
}

// Push/pop primitives used by every bytecode handler.

#[inline]
pub fn push_raw(stack: &mut JavaStack, sp: &mut usize, v: u64) {
    stack.set_word(*sp, v);
    *sp -= 1;
}

#[inline]
pub fn pop_raw(stack: &JavaStack, sp: &mut usize) -> u64 {
    *sp += 1;
    stack.word(*sp)
}

#[inline]
pub fn raw_at(stack: &JavaStack, sp: usize, depth: usize) -> u64 {
    stack.word(sp + 1 + depth)
}

#[inline]
pub fn set_raw_at(stack: &mut JavaStack, sp: usize, depth: usize, v: u64) {
    stack.set_word(sp + 1 + depth, v);
}

#[inline]
pub fn push_int(stack: &mut JavaStack, sp: &mut usize, v: i32) {
    push_raw(stack, sp, int_bits(v));
}

#[inline]
pub fn pop_int(stack: &JavaStack, sp: &mut usize) -> i32 {
    bits_int(pop_raw(stack, sp))
}

#[inline]
pub fn push_float(stack: &mut JavaStack, sp: &mut usize, v: f32) {
    push_raw(stack, sp, float_bits(v));
}

#[inline]
pub fn pop_float(stack: &JavaStack, sp: &mut usize) -> f32 {
    bits_float(pop_raw(stack, sp))
}

/// Category-2 push: filler slot first, value on top.
#[inline]
pub fn push_long(stack: &mut JavaStack, sp: &mut usize, v: i64) {
    push_raw(stack, sp, 0);
    push_raw(stack, sp, long_bits(v));
}

#[inline]
pub fn pop_long(stack: &JavaStack, sp: &mut usize) -> i64 {
    let v = bits_long(pop_raw(stack, sp));
    let _ = pop_raw(stack, sp);
    v
}

#[inline]
pub fn push_double(stack: &mut JavaStack, sp: &mut usize, v: f64) {
    push_raw(stack, sp, 0);
    push_raw(stack, sp, double_bits(v));
}

#[inline]
pub fn pop_double(stack: &JavaStack, sp: &mut usize) -> f64 {
    let v = bits_double(pop_raw(stack, sp));
    let _ = pop_raw(stack, sp);
    v
}

#[inline]
pub fn push_obj(stack: &mut JavaStack, sp: &mut usize, v: Option<ObjRef>) {
    push_raw(stack, sp, ObjRef::bits(v));
}

#[inline]
pub fn pop_obj(stack: &JavaStack, sp: &mut usize) -> Option<ObjRef> {
    ObjRef::from_bits(pop_raw(stack, sp))
}
