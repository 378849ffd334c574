//! Constant-pool cache: per-site resolved metadata shared by all threads
//! executing a method.
//!
//! Each entry carries two tag bytes (get and put variants of a field site
//! share one entry) published with release stores and read with acquire
//! loads, plus the resolved payload behind a lock. Once a tag matches the
//! current bytecode's canonical code, the payload is stable and readable
//! without re-entering the resolution runtime; the payload layout — tos
//! state, volatile/final/vfinal/forced-virtual/has-appendix flags,
//! parameter size — is a fixed contract with the resolution runtime.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::value::{KlassId, MethodId, ObjRef, TosState};

use super::bytecodes as bc;

/// Which tag byte a bytecode checks: `f2` for `invokevirtual`
/// (vtable-indexed payload) and put-variants, `f1` for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteNo {
    F1,
    F2,
}

/// Tag byte selection per bytecode, mirroring the resolution runtime's
/// publication side.
pub fn byte_no_for(code: u8) -> ByteNo {
    match code {
        bc::INVOKEVIRTUAL | bc::PUTFIELD | bc::PUTSTATIC => ByteNo::F2,
        _ => ByteNo::F1,
    }
}

/// Resolved field payload.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedField {
    pub holder: KlassId,
    /// Word offset within the object (mirror for statics).
    pub offset: u32,
    pub tos: TosState,
    pub is_volatile: bool,
    pub is_final: bool,
    pub is_static: bool,
}

/// How an invocation site dispatches once resolved.
#[derive(Debug, Clone, Copy)]
pub enum CallKind {
    /// Direct call: static, special, or vfinal virtual.
    Direct,
    /// Receiver-class vtable indexed.
    Vtable { index: u16 },
    /// Interface itable lookup against `interface`.
    Itable { interface: KlassId, index: u16 },
}

/// Resolved invocation payload.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedMethod {
    pub method: MethodId,
    pub kind: CallKind,
    /// Declaring klass (the resolved REFC for interface calls).
    pub holder: KlassId,
    /// Argument slots including receiver and appendix.
    pub param_slots: u8,
    pub return_tos: TosState,
    pub is_vfinal: bool,
    pub is_forced_virtual: bool,
    pub has_appendix: bool,
    pub appendix: Option<ObjRef>,
}

/// Union of the things a cache entry can resolve to, replacing the raw
/// `f1`/`f2` word pair with a tagged payload.
#[derive(Debug, Clone, Copy)]
pub enum ResolvedInfo {
    Unresolved,
    Field(ResolvedField),
    Method(ResolvedMethod),
}

#[derive(Debug)]
pub struct CpCacheEntry {
    /// Constant-pool index this entry shadows.
    cp_index: u16,
    tag1: AtomicU8,
    tag2: AtomicU8,
    state: RwLock<ResolvedInfo>,
    resolve_lock: Mutex<()>,
}

impl CpCacheEntry {
    fn new(cp_index: u16) -> CpCacheEntry {
        CpCacheEntry {
            cp_index,
            tag1: AtomicU8::new(0),
            tag2: AtomicU8::new(0),
            state: RwLock::new(ResolvedInfo::Unresolved),
            resolve_lock: Mutex::new(()),
        }
    }

    #[inline]
    pub fn cp_index(&self) -> u16 {
        self.cp_index
    }

    fn tag(&self, byte_no: ByteNo) -> &AtomicU8 {
        match byte_no {
            ByteNo::F1 => &self.tag1,
            ByteNo::F2 => &self.tag2,
        }
    }

    /// Has this entry been resolved for `code`? Acquire pairs with the
    /// publishing release in [`CpCacheEntry::publish`].
    #[inline]
    pub fn is_resolved(&self, code: u8) -> bool {
        self.tag(byte_no_for(code)).load(Ordering::Acquire) == code
    }

    /// Snapshot the resolved payload. Valid only after `is_resolved`
    /// returned true for the current bytecode.
    #[inline]
    pub fn info(&self) -> ResolvedInfo {
        *self.state.read()
    }

    /// Publish payload then tag, so a reader that observes the tag sees the
    /// payload. Called by the resolution runtime under its own entry lock.
    pub fn publish(&self, code: u8, info: ResolvedInfo) {
        *self.state.write() = info;
        self.tag(byte_no_for(code)).store(code, Ordering::Release);
    }

    /// Serialize racing resolvers; the winner publishes, losers re-check
    /// the tag once inside and find the work done.
    pub fn with_resolution_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.resolve_lock.lock();
        f()
    }

    pub fn resolved_field(&self) -> Option<ResolvedField> {
        match self.info() {
            ResolvedInfo::Field(f) => Some(f),
            _ => None,
        }
    }

    pub fn resolved_method(&self) -> Option<ResolvedMethod> {
        match self.info() {
            ResolvedInfo::Method(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct CpCache {
    entries: Vec<CpCacheEntry>,
}

impl CpCache {
    #[inline]
    pub fn entry_at(&self, index: u16) -> &CpCacheEntry {
        &self.entries[index as usize]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates cache entries while the rewriter walks a pool's methods.
/// Sites naming the same constant share one entry, which is what lets a
/// `getfield`/`putfield` pair share a cache line.
pub struct CpCacheBuilder {
    by_cp_index: FxHashMap<u16, u16>,
    entries: Vec<u16>,
}

impl Default for CpCacheBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CpCacheBuilder {
    pub fn new() -> CpCacheBuilder {
        CpCacheBuilder {
            by_cp_index: FxHashMap::default(),
            entries: Vec::new(),
        }
    }

    /// Cache index for a constant-pool index, allocating on first use.
    pub fn add(&mut self, cp_index: u16) -> u16 {
        if let Some(&idx) = self.by_cp_index.get(&cp_index) {
            return idx;
        }
        let idx = self.entries.len() as u16;
        self.entries.push(cp_index);
        self.by_cp_index.insert(cp_index, idx);
        idx
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(&self, _pool: &crate::meta::ConstantPool) -> CpCache {
        CpCache {
            entries: self.entries.iter().map(|&cp| CpCacheEntry::new(cp)).collect(),
        }
    }
}
