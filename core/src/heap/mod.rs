//! Non-moving word-arena heap.
//!
//! Objects are contiguous runs of 64-bit words: a mark word, a klass word,
//! then instance fields (arrays add a length word before the elements).
//! The arena never reuses memory, so a collecting GC is not emulated here;
//! [`barrier`] is the seam where one would hook in. All words are atomics so
//! the interpreter can express the memory-ordering contract directly
//! (plain accesses relaxed, volatile accesses acquire/release, publication
//! fences explicit).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::value::{KlassId, ObjRef, TosState};

pub mod barrier;
mod tlab;

pub use tlab::Tlab;

/// Word offset of the mark word within an object.
pub const MARK_OFFSET: usize = 0;
/// Word offset of the klass word.
pub const KLASS_OFFSET: usize = 1;
/// First instance-field word.
pub const INSTANCE_BASE_OFFSET: usize = 2;
/// Array length word.
pub const ARRAY_LENGTH_OFFSET: usize = 2;
/// First array-element word.
pub const ARRAY_BASE_OFFSET: usize = 3;
/// Header words of an instance object.
pub const HEADER_WORDS: usize = 2;

/// Mark-word encoding: the low two bits select the lock state.
///
/// `01` unlocked, `00` fast-locked (upper bits name the owning lock record),
/// `10` inflated (upper bits name a heavy monitor).
pub mod mark {
    pub const UNLOCKED_VALUE: u64 = 0b01;
    pub const MONITOR_VALUE: u64 = 0b10;
    pub const LOCK_MASK: u64 = 0b11;

    /// Mark of a freshly allocated object: unlocked, no hash.
    pub fn prototype() -> u64 {
        UNLOCKED_VALUE
    }

    pub fn set_unlocked(m: u64) -> u64 {
        (m & !LOCK_MASK) | UNLOCKED_VALUE
    }

    pub fn is_unlocked(m: u64) -> bool {
        m & LOCK_MASK == UNLOCKED_VALUE
    }

    pub fn is_fast_locked(m: u64) -> bool {
        m & LOCK_MASK == 0
    }

    pub fn is_monitor(m: u64) -> bool {
        m & LOCK_MASK == MONITOR_VALUE
    }

    /// Fast-lock mark pointing at a frame lock record.
    pub fn from_lock_record(thread: u16, record_index: usize) -> u64 {
        ((thread as u64) << 40) | ((record_index as u64) << 2)
    }

    pub fn lock_record_thread(m: u64) -> u16 {
        (m >> 40) as u16
    }

    pub fn lock_record_index(m: u64) -> usize {
        ((m >> 2) & ((1u64 << 38) - 1)) as usize
    }

    pub fn from_monitor(monitor_id: u64) -> u64 {
        (monitor_id << 2) | MONITOR_VALUE
    }

    pub fn monitor_id(m: u64) -> u64 {
        m >> 2
    }
}

pub struct Heap {
    words: Box<[AtomicU64]>,
    /// Shared bump pointer; word 0 is reserved so no object gets index 0.
    top: AtomicUsize,
}

impl Heap {
    pub fn new(heap_words: usize) -> Heap {
        let mut v = Vec::with_capacity(heap_words);
        v.resize_with(heap_words, || AtomicU64::new(0));
        Heap {
            words: v.into_boxed_slice(),
            top: AtomicUsize::new(1),
        }
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }

    /// Bump-allocate `words` from the shared arena. The arena starts zeroed
    /// and is never reused, so fresh memory is always zero.
    pub fn alloc_shared(&self, words: usize) -> Option<usize> {
        let mut cur = self.top.load(Ordering::Relaxed);
        loop {
            let new_top = cur.checked_add(words)?;
            if new_top > self.words.len() {
                tracing::warn!(target: "robusta::heap", requested = words, "shared arena exhausted");
                return None;
            }
            match self
                .top
                .compare_exchange_weak(cur, new_top, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    // Raw word access, object-relative.

    #[inline]
    pub fn get_word(&self, obj: ObjRef, offset: usize) -> u64 {
        self.word(obj.index() + offset).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_word(&self, obj: ObjRef, offset: usize, v: u64) {
        self.word(obj.index() + offset).store(v, Ordering::Relaxed)
    }

    #[inline]
    pub fn get_word_acquire(&self, obj: ObjRef, offset: usize) -> u64 {
        self.word(obj.index() + offset).load(Ordering::Acquire)
    }

    #[inline]
    pub fn put_word_release(&self, obj: ObjRef, offset: usize, v: u64) {
        self.word(obj.index() + offset).store(v, Ordering::Release)
    }

    /// Raw word access by arena index (lock records, migration buffers).
    #[inline]
    pub fn get_arena_word(&self, index: usize) -> u64 {
        self.word(index).load(Ordering::Relaxed)
    }

    #[inline]
    pub fn put_arena_word(&self, index: usize, v: u64) {
        self.word(index).store(v, Ordering::Relaxed)
    }

    // Header access.

    #[inline]
    pub fn mark(&self, obj: ObjRef) -> u64 {
        self.word(obj.index() + MARK_OFFSET).load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_mark(&self, obj: ObjRef, m: u64) {
        self.word(obj.index() + MARK_OFFSET).store(m, Ordering::Release)
    }

    /// Compare-and-set the mark word; returns the previous value on failure.
    pub fn cas_mark(&self, obj: ObjRef, expected: u64, new: u64) -> Result<u64, u64> {
        self.word(obj.index() + MARK_OFFSET)
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    #[inline]
    pub fn klass_id(&self, obj: ObjRef) -> KlassId {
        KlassId(self.word(obj.index() + KLASS_OFFSET).load(Ordering::Acquire) as u32)
    }

    /// The klass word is stored last during allocation so a concurrent scan
    /// never observes a zeroed body behind a valid klass.
    #[inline]
    pub fn set_klass_release(&self, obj: ObjRef, klass: KlassId) {
        self.word(obj.index() + KLASS_OFFSET)
            .store(klass.0 as u64, Ordering::Release)
    }

    #[inline]
    pub fn array_length(&self, obj: ObjRef) -> i32 {
        self.get_word(obj, ARRAY_LENGTH_OFFSET) as i32
    }

    pub fn set_array_length(&self, obj: ObjRef, len: i32) {
        self.put_word(obj, ARRAY_LENGTH_OFFSET, len as u32 as u64)
    }
}

/// Truncate slot bits for a field or array store of the given category.
/// Boolean stores keep only the LSB; char/short keep the low 16 bits.
#[inline]
pub fn truncate_for_store(tos: TosState, bits: u64) -> u64 {
    match tos {
        TosState::Ztos => bits & 0x1,
        TosState::Btos => bits & 0xff,
        TosState::Ctos | TosState::Stos => bits & 0xffff,
        TosState::Itos | TosState::Ftos => bits & 0xffff_ffff,
        _ => bits,
    }
}

/// Extend stored bits back to an int-category slot on load: bytes and shorts
/// sign-extend, booleans and chars zero-extend.
#[inline]
pub fn extend_for_load(tos: TosState, bits: u64) -> u64 {
    match tos {
        TosState::Ztos => bits & 0x1,
        TosState::Btos => (bits as u8 as i8) as i32 as u32 as u64,
        TosState::Ctos => bits & 0xffff,
        TosState::Stos => (bits as u16 as i16) as i32 as u32 as u64,
        _ => bits,
    }
}
