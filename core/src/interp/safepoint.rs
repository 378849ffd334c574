//! Cooperative safepoint polling.
//!
//! Each thread owns a poll word; arming it makes every taken branch and
//! every return run the pending handshake operations before the bytecode
//! completes. Handlers never block mid-bytecode — the poll sites are the
//! only cooperative suspension points the interpreter adds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

pub type Handshake = Box<dyn FnMut(u16) + Send>;

/// Process-wide safepoint state shared by all thread poll words.
#[derive(Default)]
pub struct SafepointMechanism {
    armed: AtomicBool,
    handshakes: Mutex<Vec<Handshake>>,
}

impl SafepointMechanism {
    pub fn new() -> SafepointMechanism {
        SafepointMechanism::default()
    }

    /// Arm every thread's poll; queued handshakes run at the next poll site
    /// of each thread.
    pub fn arm(&self, handshake: Handshake) {
        self.handshakes.lock().push(handshake);
        self.armed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn should_process(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Run pending handshakes on behalf of `thread`. Disarms once the queue
    /// drains.
    pub fn process_if_requested(&self, thread: u16) {
        if !self.should_process() {
            return;
        }
        let mut pending = self.handshakes.lock();
        for h in pending.iter_mut() {
            h(thread);
        }
        pending.clear();
        self.armed.store(false, Ordering::Release);
    }
}

/// Per-thread view: a cached handle on the shared mechanism. The poll test
/// stays one atomic load.
#[derive(Clone)]
pub struct SafepointPoll {
    mechanism: Arc<SafepointMechanism>,
}

impl SafepointPoll {
    pub fn new(mechanism: Arc<SafepointMechanism>) -> SafepointPoll {
        SafepointPoll { mechanism }
    }

    #[inline]
    pub fn should_process(&self) -> bool {
        self.mechanism.should_process()
    }

    pub fn process_if_requested(&self, thread: u16) {
        self.mechanism.process_if_requested(thread);
    }
}
