//! Object synchronizer: the slow path behind `monitorenter`/`monitorexit`.
//!
//! The fast path lives in the bytecode handler (mark-word CAS against a
//! frame lock record). This module owns inflation to heavy monitors and
//! blocking acquisition. Monitors never deflate; once an object's mark
//! points at a heavy monitor it stays inflated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::heap::{mark, Heap};
use crate::rt::{JavaExKind, JavaThrowable};
use crate::value::ObjRef;

struct MonitorInner {
    owner: Option<u16>,
    recursions: u32,
}

pub struct ObjectMonitor {
    inner: Mutex<MonitorInner>,
    cv: Condvar,
}

impl ObjectMonitor {
    fn new() -> ObjectMonitor {
        ObjectMonitor {
            inner: Mutex::new(MonitorInner {
                owner: None,
                recursions: 0,
            }),
            cv: Condvar::new(),
        }
    }
}

#[derive(Default)]
pub struct ObjectSynchronizer {
    monitors: DashMap<u64, Arc<ObjectMonitor>>,
    by_object: DashMap<u64, u64>,
    next_id: AtomicU64,
}

impl ObjectSynchronizer {
    pub fn new() -> ObjectSynchronizer {
        ObjectSynchronizer::default()
    }

    fn monitor_entry(&self, obj: ObjRef) -> (u64, Arc<ObjectMonitor>) {
        let key = ObjRef::bits(Some(obj));
        let id = *self.by_object.entry(key).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            self.monitors.insert(id, Arc::new(ObjectMonitor::new()));
            id
        });
        let mon = self.monitors.get(&id).expect("monitor table entry").clone();
        (id, mon)
    }

    fn monitor_of(&self, obj: ObjRef) -> Option<Arc<ObjectMonitor>> {
        let key = ObjRef::bits(Some(obj));
        let id = *self.by_object.get(&key)?;
        self.monitors.get(&id).map(|m| m.clone())
    }

    /// Contended enter: inflate the object's mark to a heavy monitor and
    /// block until ownership is acquired. Inflation of one object is
    /// serialized under that monitor's own lock, so the seeded owner (the
    /// fast-lock holder at inflation time) is never raced.
    pub fn slow_enter(&self, heap: &Heap, obj: ObjRef, thread: u16) {
        let (id, mon) = self.monitor_entry(obj);
        let mut inner = mon.inner.lock();
        loop {
            let m = heap.mark(obj);
            if mark::is_monitor(m) {
                break;
            }
            let seeded_owner = if mark::is_fast_locked(m) {
                Some(mark::lock_record_thread(m))
            } else {
                None
            };
            if heap.cas_mark(obj, m, mark::from_monitor(id)).is_ok() {
                inner.owner = seeded_owner;
                inner.recursions = 0;
                trace!(target: "robusta::interp::slowpath", obj = obj.index(), id, "monitor inflated");
                break;
            }
        }
        loop {
            match inner.owner {
                None => {
                    inner.owner = Some(thread);
                    return;
                }
                Some(o) if o == thread => {
                    inner.recursions += 1;
                    return;
                }
                Some(_) => self.cv_wait(&mon, &mut inner),
            }
        }
    }

    fn cv_wait(&self, mon: &Arc<ObjectMonitor>, inner: &mut parking_lot::MutexGuard<'_, MonitorInner>) {
        mon.cv.wait(inner);
    }

    /// Release after the record-based fast unlock failed (the mark was
    /// inflated underneath the owner).
    pub fn slow_exit(&self, _heap: &Heap, obj: ObjRef, thread: u16) -> Result<(), JavaThrowable> {
        let Some(mon) = self.monitor_of(obj) else {
            return Err(JavaThrowable::bare(JavaExKind::IllegalMonitorStateException));
        };
        let mut inner = mon.inner.lock();
        match inner.owner {
            Some(o) if o == thread => {
                if inner.recursions > 0 {
                    inner.recursions -= 1;
                } else {
                    inner.owner = None;
                    mon.cv.notify_one();
                }
                Ok(())
            }
            _ => Err(JavaThrowable::bare(JavaExKind::IllegalMonitorStateException)),
        }
    }

    /// Current owner, for assertions and diagnostics.
    pub fn owner_of(&self, heap: &Heap, obj: ObjRef) -> Option<u16> {
        let m = heap.mark(obj);
        if mark::is_fast_locked(m) {
            return Some(mark::lock_record_thread(m));
        }
        if mark::is_monitor(m) {
            return self.monitor_of(obj).and_then(|mon| mon.inner.lock().owner);
        }
        None
    }
}
