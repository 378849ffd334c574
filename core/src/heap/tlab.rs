use tracing::trace;

use super::Heap;

/// Thread-local allocation buffer: a bump region carved out of the shared
/// arena. Owned exclusively by one thread; no synchronization on the fast
/// path.
#[derive(Debug, Default)]
pub struct Tlab {
    top: usize,
    end: usize,
}

impl Tlab {
    pub fn new() -> Tlab {
        Tlab { top: 0, end: 0 }
    }

    /// Fast-path allocation: compute the new top, compare against the end,
    /// fail on overflow, else commit. Returns the arena index of the first
    /// word.
    #[inline]
    pub fn allocate(&mut self, words: usize) -> Option<usize> {
        let result = self.top;
        let new_top = result + words;
        if new_top > self.end {
            return None;
        }
        self.top = new_top;
        Some(result)
    }

    /// Refill from the shared arena. The fresh region is zeroed by
    /// construction (the arena is never reused).
    pub fn refill(&mut self, heap: &Heap, words: usize) -> bool {
        match heap.alloc_shared(words) {
            Some(start) => {
                trace!(target: "robusta::heap", start, words, "tlab.refill");
                self.top = start;
                self.end = start + words;
                true
            }
            None => false,
        }
    }

    pub fn remaining(&self) -> usize {
        self.end - self.top
    }
}
