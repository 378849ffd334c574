//! The runtime environment: every external collaborator the template
//! interpreter calls into, gathered behind one handle.
//!
//! Covers the resolution runtime (`resolve_from_cache`, `resolve_ldc`,
//! `quicken_io_cc`), the allocation runtime, finalizer registration, the
//! JVMTI-shaped watch counters and breakpoint table, safepoint arming, and
//! the compiler bridge. Interpreter handlers treat these as slow-path
//! calls: state is decached before and recached after.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::config::VmConfig;
use crate::heap::{mark, Heap, ARRAY_BASE_OFFSET, MARK_OFFSET};
use crate::interp::bytecodes as bc;
use crate::interp::cpcache::{
    CallKind, ResolvedField, ResolvedInfo, ResolvedMethod,
};
use crate::interp::osr::{CompilerBridge, NullCompilerBridge, OsrNmethod};
use crate::interp::safepoint::SafepointMechanism;
use crate::interp::JavaThread;
use crate::meta::{
    ConstantPool, KlassKind, MetaRegistry, Method, PoolConstant, Tag,
};
use crate::value::{BasicType, JValue, KlassId, MethodId, ObjRef, TosState};

use super::synchronizer::ObjectSynchronizer;
use super::{BcResult, ExecSignal, InvokeOutcome, JavaExKind, JavaThrowable};

/// JVMTI-shaped eventing: watch counters, event log, breakpoint table.
#[derive(Default)]
pub struct JvmtiSupport {
    field_access_count: AtomicI32,
    field_modification_count: AtomicI32,
    can_post_breakpoint: AtomicBool,
    breakpoints: Mutex<FxHashMap<(u32, u32), u8>>,
    events: Mutex<Vec<JvmtiEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JvmtiEvent {
    FieldAccess {
        method: MethodId,
        bci: usize,
        cp_index: u16,
    },
    FieldModification {
        method: MethodId,
        bci: usize,
        cp_index: u16,
    },
    Breakpoint {
        method: MethodId,
        bci: usize,
    },
}

impl JvmtiSupport {
    pub fn add_field_access_watch(&self) {
        self.field_access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_field_access_watch(&self) {
        self.field_access_count.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_field_modification_watch(&self) {
        self.field_modification_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove_field_modification_watch(&self) {
        self.field_modification_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Cheap fast-path gate: handlers skip the posting work entirely while
    /// the watch count is zero.
    #[inline]
    pub fn field_access_watched(&self) -> bool {
        self.field_access_count.load(Ordering::Relaxed) > 0
    }

    #[inline]
    pub fn field_modification_watched(&self) -> bool {
        self.field_modification_count.load(Ordering::Relaxed) > 0
    }

    pub fn post_event(&self, event: JvmtiEvent) {
        self.events.lock().push(event);
    }

    pub fn drain_events(&self) -> Vec<JvmtiEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    #[inline]
    pub fn can_post_breakpoint(&self) -> bool {
        self.can_post_breakpoint.load(Ordering::Relaxed)
    }

    /// Install a breakpoint: remember the byte under it, patch the stream.
    pub fn set_breakpoint(&self, method: &Method, mid: MethodId, bci: usize) {
        let original = method.code_byte(bci);
        self.breakpoints
            .lock()
            .insert((mid.0, bci as u32), original);
        method.patch_code_byte(bci, bc::BREAKPOINT);
        self.can_post_breakpoint.store(true, Ordering::Relaxed);
    }

    pub fn clear_breakpoint(&self, method: &Method, mid: MethodId, bci: usize) {
        if let Some(original) = self.breakpoints.lock().remove(&(mid.0, bci as u32)) {
            method.patch_code_byte(bci, original);
        }
    }

    pub fn get_original_bytecode_at(&self, mid: MethodId, bci: usize) -> Option<u8> {
        self.breakpoints.lock().get(&(mid.0, bci as u32)).copied()
    }

    /// Quickening at a breakpointed site rewrites the *remembered* byte so
    /// the semantics change survives breakpoint removal.
    pub fn set_original_bytecode_at(&self, mid: MethodId, bci: usize, code: u8) {
        self.breakpoints.lock().insert((mid.0, bci as u32), code);
    }
}

pub struct VmEnv {
    pub config: VmConfig,
    pub registry: Arc<MetaRegistry>,
    pub heap: Arc<Heap>,
    pub synchronizer: ObjectSynchronizer,
    pub safepoint: Arc<SafepointMechanism>,
    pub jvmti: JvmtiSupport,
    compiler: Box<dyn CompilerBridge>,
    finalizer_queue: Mutex<Vec<ObjRef>>,
    interned_strings: Mutex<FxHashMap<Arc<str>, ObjRef>>,
    null_sentinel: OnceCell<ObjRef>,
    next_thread_id: AtomicU16,
}

impl VmEnv {
    pub fn new(config: VmConfig) -> anyhow::Result<Arc<VmEnv>> {
        Self::with_compiler(config, Box::new(NullCompilerBridge))
    }

    pub fn with_compiler(
        config: VmConfig,
        compiler: Box<dyn CompilerBridge>,
    ) -> anyhow::Result<Arc<VmEnv>> {
        let registry = Arc::new(MetaRegistry::new());
        Self::with_registry(config, compiler, registry)
    }

    /// Build around an embedder-populated registry (it may already define
    /// the root class).
    pub fn with_registry(
        config: VmConfig,
        compiler: Box<dyn CompilerBridge>,
        registry: Arc<MetaRegistry>,
    ) -> anyhow::Result<Arc<VmEnv>> {
        registry.ensure_bootstrap()?;
        let heap = Arc::new(Heap::new(config.heap_words));
        let env = Arc::new(VmEnv {
            config,
            registry,
            heap,
            synchronizer: ObjectSynchronizer::new(),
            safepoint: Arc::new(SafepointMechanism::new()),
            jvmti: JvmtiSupport::default(),
            compiler,
            finalizer_queue: Mutex::new(Vec::new()),
            interned_strings: Mutex::new(FxHashMap::default()),
            null_sentinel: OnceCell::new(),
            next_thread_id: AtomicU16::new(1),
        });
        // The sentinel object stands for "resolved to null" in the
        // resolved-references array, distinct from "not yet resolved".
        let object = env
            .registry
            .object_klass()
            .ok_or_else(|| anyhow!("bootstrap did not register the root class"))?;
        let sentinel = env
            .allocate_instance_shared(object)
            .map_err(|t| anyhow!("allocating null sentinel: {t}"))?;
        env.null_sentinel.set(sentinel).expect("sentinel set once");
        Ok(env)
    }

    pub(crate) fn next_thread_id(&self) -> u16 {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn the_null_sentinel(&self) -> ObjRef {
        *self.null_sentinel.get().expect("env bootstrapped")
    }

    pub fn pending_finalizers(&self) -> Vec<ObjRef> {
        self.finalizer_queue.lock().clone()
    }

    /// `return_register_finalizer` lands here when the receiver's class has
    /// a finalizer.
    pub fn register_finalizer(&self, obj: ObjRef) {
        self.finalizer_queue.lock().push(obj);
    }

    // ------------------------------------------------------------------
    // Resolution runtime.

    /// Resolve the cache entry a bytecode site names, publishing
    /// `f1`/`f2`/flags equivalents for `code`. Idempotent: racing callers
    /// serialize on the entry lock, losers find the tag already set.
    pub fn resolve_from_cache(
        self: &Arc<Self>,
        thread: &mut JavaThread,
        pool: &Arc<ConstantPool>,
        cache_index: u16,
        code: u8,
    ) -> BcResult<()> {
        let cache = pool
            .cache()
            .context("resolving through a pool with no cache")?
            .clone();
        let entry = cache.entry_at(cache_index);
        let cp_index = entry.cp_index();

        let mut static_field_holder = None;
        let mut static_call_holder = None;
        entry.with_resolution_lock(|| -> BcResult<()> {
            if entry.is_resolved(code) {
                return Ok(());
            }
            match code {
                bc::GETFIELD | bc::PUTFIELD | bc::GETSTATIC | bc::PUTSTATIC => {
                    let info = self.resolve_field(pool, cp_index, code)?;
                    if info.is_static {
                        static_field_holder = Some(info.holder);
                    }
                    entry.publish(code, ResolvedInfo::Field(info));
                }
                bc::INVOKEVIRTUAL
                | bc::INVOKESPECIAL
                | bc::INVOKESTATIC
                | bc::INVOKEINTERFACE
                | bc::INVOKEDYNAMIC
                | bc::INVOKEHANDLE => {
                    let info = self.resolve_invoke(pool, cp_index, code)?;
                    if code == bc::INVOKESTATIC {
                        static_call_holder = Some(info.holder);
                    }
                    entry.publish(code, ResolvedInfo::Method(info));
                }
                other => {
                    return Err(ExecSignal::Fatal(anyhow!(
                        "resolve_from_cache on non-cache bytecode {}",
                        bc::name(other)
                    )))
                }
            }
            debug!(
                target: "robusta::resolve",
                code = bc::name(code),
                cp_index,
                cache_index,
                "cache entry resolved"
            );
            Ok(())
        })?;

        // Class initialization runs outside the entry lock: `<clinit>`
        // bytecode may name this very entry again, and the published tag
        // lets that inner execution take the fast path.
        if let Some(holder) = static_field_holder.or(static_call_holder) {
            self.initialize_class(thread, holder)
                .map_err(ExecSignal::Throw)?;
        }
        Ok(())
    }

    fn resolve_field(
        &self,
        pool: &Arc<ConstantPool>,
        cp_index: u16,
        code: u8,
    ) -> BcResult<ResolvedField> {
        let PoolConstant::Fieldref(fref) = pool.constant(cp_index) else {
            return Err(ExecSignal::Fatal(anyhow!(
                "field bytecode names constant {cp_index} which is not a field reference"
            )));
        };
        let name = fref.name.clone();
        let ref_kid = self
            .resolve_klass(pool, fref.class_index)
            .map_err(ExecSignal::Throw)?;
        let (holder, field) = self
            .registry
            .lookup_field(ref_kid, &name)
            .ok_or_else(|| {
                ExecSignal::Throw(JavaThrowable::new(
                    JavaExKind::NoSuchFieldError,
                    name.as_ref(),
                ))
            })?;
        let want_static = matches!(code, bc::GETSTATIC | bc::PUTSTATIC);
        if field.is_static != want_static {
            return Err(ExecSignal::Throw(JavaThrowable::new(
                JavaExKind::IncompatibleClassChangeError,
                format!("field {name} static-ness does not match the bytecode"),
            )));
        }
        Ok(ResolvedField {
            holder,
            offset: field.offset,
            tos: field.tos,
            is_volatile: field.is_volatile,
            is_final: field.is_final,
            is_static: field.is_static,
        })
    }

    fn resolve_invoke(
        &self,
        pool: &Arc<ConstantPool>,
        cp_index: u16,
        code: u8,
    ) -> BcResult<ResolvedMethod> {
        if matches!(code, bc::INVOKEDYNAMIC | bc::INVOKEHANDLE) {
            let PoolConstant::InvokeDynamic { adapter, appendix } = pool.constant(cp_index)
            else {
                return Err(ExecSignal::Fatal(anyhow!(
                    "dynamic invocation names constant {cp_index} which is not an indy entry"
                )));
            };
            let m = self.registry.method(*adapter);
            return Ok(ResolvedMethod {
                method: *adapter,
                kind: CallKind::Direct,
                holder: m.holder,
                param_slots: m.param_slots() as u8,
                return_tos: m.return_type.tos(),
                is_vfinal: true,
                is_forced_virtual: false,
                has_appendix: appendix.is_some(),
                appendix: *appendix,
            });
        }

        let mref = match pool.constant(cp_index) {
            PoolConstant::Methodref(m) | PoolConstant::InterfaceMethodref(m) => m.clone(),
            _ => {
                return Err(ExecSignal::Fatal(anyhow!(
                    "invoke bytecode names constant {cp_index} which is not a method reference"
                )))
            }
        };
        let ref_kid = self
            .resolve_klass(pool, mref.class_index)
            .map_err(ExecSignal::Throw)?;
        let mid = self
            .registry
            .lookup_method(ref_kid, &mref.name)
            .ok_or_else(|| {
                ExecSignal::Throw(JavaThrowable::new(
                    JavaExKind::NoSuchMethodError,
                    mref.name.as_ref(),
                ))
            })?;
        let m = self.registry.method(mid);
        let param_slots = m.param_slots() as u8;
        let return_tos = m.return_type.tos();

        let info = match code {
            bc::INVOKESTATIC => {
                if !m.flags.is_static {
                    return Err(ExecSignal::Throw(JavaThrowable::new(
                        JavaExKind::IncompatibleClassChangeError,
                        format!("expected static method {}", mref.name),
                    )));
                }
                ResolvedMethod {
                    method: mid,
                    kind: CallKind::Direct,
                    holder: m.holder,
                    param_slots,
                    return_tos,
                    is_vfinal: false,
                    is_forced_virtual: false,
                    has_appendix: false,
                    appendix: None,
                }
            }
            bc::INVOKESPECIAL => ResolvedMethod {
                method: mid,
                kind: CallKind::Direct,
                holder: m.holder,
                param_slots,
                return_tos,
                is_vfinal: false,
                is_forced_virtual: false,
                has_appendix: false,
                appendix: None,
            },
            bc::INVOKEVIRTUAL => {
                let vfinal = m.flags.is_final || m.flags.is_private || m.vtable_index.is_none();
                ResolvedMethod {
                    method: mid,
                    kind: if vfinal {
                        CallKind::Direct
                    } else {
                        CallKind::Vtable {
                            index: m.vtable_index.expect("virtual method has vtable slot"),
                        }
                    },
                    holder: m.holder,
                    param_slots,
                    return_tos,
                    is_vfinal: vfinal,
                    is_forced_virtual: false,
                    has_appendix: false,
                    appendix: None,
                }
            }
            bc::INVOKEINTERFACE => {
                if Some(m.holder) == self.registry.object_klass() {
                    // Interface call landing on a root-class method:
                    // dispatched as if virtual.
                    ResolvedMethod {
                        method: mid,
                        kind: match m.vtable_index {
                            Some(index) => CallKind::Vtable { index },
                            None => CallKind::Direct,
                        },
                        holder: m.holder,
                        param_slots,
                        return_tos,
                        is_vfinal: m.vtable_index.is_none(),
                        is_forced_virtual: true,
                        has_appendix: false,
                        appendix: None,
                    }
                } else if m.flags.is_private {
                    // Private interface method: direct, with a
                    // receiver-subtype assertion at dispatch.
                    ResolvedMethod {
                        method: mid,
                        kind: CallKind::Direct,
                        holder: ref_kid,
                        param_slots,
                        return_tos,
                        is_vfinal: true,
                        is_forced_virtual: false,
                        has_appendix: false,
                        appendix: None,
                    }
                } else {
                    let index = m.itable_index.ok_or_else(|| {
                        ExecSignal::Throw(JavaThrowable::new(
                            JavaExKind::IncompatibleClassChangeError,
                            format!("{} is not an itable method", mref.name),
                        ))
                    })?;
                    ResolvedMethod {
                        method: mid,
                        kind: CallKind::Itable {
                            interface: m.holder,
                            index,
                        },
                        holder: ref_kid,
                        param_slots,
                        return_tos,
                        is_vfinal: false,
                        is_forced_virtual: false,
                        has_appendix: false,
                        appendix: None,
                    }
                }
            }
            other => {
                return Err(ExecSignal::Fatal(anyhow!(
                    "resolve_invoke on {}",
                    bc::name(other)
                )))
            }
        };
        Ok(info)
    }

    /// Resolve a `Class` constant, caching errors: a slot that failed once
    /// rethrows the recorded error deterministically ever after.
    pub fn resolve_klass(
        &self,
        pool: &Arc<ConstantPool>,
        index: u16,
    ) -> Result<KlassId, JavaThrowable> {
        match pool.tag_at(index) {
            Tag::Class => Ok(pool
                .resolved_klass_at(index)
                .expect("resolved tag implies klass slot")),
            Tag::UnresolvedClass => {
                let PoolConstant::Class { name } = pool.constant(index) else {
                    return Err(JavaThrowable::new(
                        JavaExKind::InternalError,
                        "class tag on non-class constant",
                    ));
                };
                match self.registry.find_klass(name) {
                    Some(kid) => {
                        pool.set_resolved_klass(index, kid);
                        Ok(kid)
                    }
                    None => {
                        let t = JavaThrowable::new(
                            JavaExKind::NoClassDefFoundError,
                            name.as_ref(),
                        );
                        pool.record_error(index, t.clone(), Tag::UnresolvedClassInError);
                        Err(t)
                    }
                }
            }
            Tag::UnresolvedClassInError => Err(pool
                .cached_error(index)
                .unwrap_or_else(|| JavaThrowable::bare(JavaExKind::NoClassDefFoundError))),
            other => Err(JavaThrowable::new(
                JavaExKind::InternalError,
                format!("resolve_klass on {other:?} constant"),
            )),
        }
    }

    /// `checkcast`/`instanceof` slow path.
    pub fn quicken_io_cc(
        &self,
        pool: &Arc<ConstantPool>,
        index: u16,
    ) -> Result<KlassId, JavaThrowable> {
        self.resolve_klass(pool, index)
    }

    /// `ldc` slow path: strings, class mirrors, and dynamically-computed
    /// constants. Object results land in the resolved-references slot, with
    /// an actually-null condy result represented by the null sentinel.
    pub fn resolve_ldc(
        &self,
        pool: &Arc<ConstantPool>,
        index: u16,
    ) -> Result<JValue, JavaThrowable> {
        match pool.tag_at(index) {
            Tag::String => {
                let PoolConstant::String(s) = pool.constant(index) else {
                    return Err(JavaThrowable::new(
                        JavaExKind::InternalError,
                        "string tag on non-string constant",
                    ));
                };
                let obj = self.intern_string(s)?;
                pool.set_resolved_reference(index, obj);
                Ok(JValue::Obj(Some(obj)))
            }
            Tag::Class | Tag::UnresolvedClass | Tag::UnresolvedClassInError => {
                let kid = self.resolve_klass(pool, index)?;
                let mirror = self.mirror_of(kid)?;
                Ok(JValue::Obj(Some(mirror)))
            }
            Tag::Dynamic => {
                let mut values = pool.condy_values_lock();
                if let Some(v) = values.get(&index) {
                    return Ok(*v);
                }
                let PoolConstant::Dynamic { producer, tos } = pool.constant(index) else {
                    return Err(JavaThrowable::new(
                        JavaExKind::InternalError,
                        "dynamic tag on non-dynamic constant",
                    ));
                };
                match (producer.as_ref())() {
                    Ok(v) => {
                        if *tos == TosState::Atos {
                            let stored = match v {
                                JValue::Obj(Some(o)) => o,
                                _ => self.the_null_sentinel(),
                            };
                            pool.set_resolved_reference(index, stored);
                        }
                        values.insert(index, v);
                        Ok(v)
                    }
                    Err(cause) => {
                        drop(values);
                        let t = JavaThrowable::new(
                            JavaExKind::BootstrapMethodError,
                            cause.to_string(),
                        );
                        pool.record_error(index, t.clone(), Tag::DynamicInError);
                        Err(t)
                    }
                }
            }
            Tag::DynamicInError => Err(pool
                .cached_error(index)
                .unwrap_or_else(|| JavaThrowable::bare(JavaExKind::BootstrapMethodError))),
            other => Err(JavaThrowable::new(
                JavaExKind::InternalError,
                format!("resolve_ldc on {other:?} constant"),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Class initialization.

    /// Initialize a class (supers first), running `<clinit>` through the
    /// interpreter. Blocks while another thread initializes; reentrant for
    /// the initializing thread itself.
    pub fn initialize_class(
        self: &Arc<Self>,
        thread: &mut JavaThread,
        kid: KlassId,
    ) -> Result<(), JavaThrowable> {
        let klass = self.registry.klass(kid);
        if klass.is_initialized() {
            return Ok(());
        }
        if let Some(s) = klass.super_id {
            self.initialize_class(thread, s)?;
        }
        let env = self.clone();
        let result = klass.ensure_initialized(thread.id, |mid| {
            match crate::interp::call_method(&env, thread, mid, &[]) {
                Ok(InvokeOutcome::Normal(_)) => Ok(()),
                Ok(InvokeOutcome::Threw(t)) => Err(t),
                Err(fatal) => Err(JavaThrowable::new(
                    JavaExKind::InternalError,
                    fatal.to_string(),
                )),
            }
        });
        match result {
            Ok(()) => Ok(()),
            Err(crate::meta::InitFailure::ErrorState) => Err(JavaThrowable::new(
                JavaExKind::NoClassDefFoundError,
                format!("could not initialize class {}", klass.name),
            )),
            Err(crate::meta::InitFailure::Clinit(t)) => Err(JavaThrowable::new(
                JavaExKind::ExceptionInInitializerError,
                t.to_string(),
            )),
        }
    }

    // ------------------------------------------------------------------
    // Allocation runtime.

    /// Mirror object carrying a klass's statics; created on first use.
    pub fn mirror_of(&self, kid: KlassId) -> Result<ObjRef, JavaThrowable> {
        let klass = self.registry.klass(kid);
        let mirror_klass = self
            .registry
            .class_klass()
            .or_else(|| self.registry.object_klass())
            .expect("bootstrap registered the mirror klass");
        klass
            .mirror_cell()
            .get_or_try_init(|| {
                let words = klass.mirror_size_words();
                let start = self
                    .heap
                    .alloc_shared(words)
                    .ok_or_else(|| JavaThrowable::bare(JavaExKind::OutOfMemoryError))?;
                let obj = ObjRef::from_index(start);
                self.heap.put_word(obj, MARK_OFFSET, mark::prototype());
                self.heap.set_klass_release(obj, mirror_klass);
                std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
                Ok(obj)
            })
            .copied()
    }

    /// Embedder-facing instance allocation (receivers for `call_method`,
    /// exception objects, test fixtures). Shared-arena path, header fully
    /// published.
    pub fn new_instance(&self, kid: KlassId) -> Result<ObjRef, JavaThrowable> {
        self.allocate_instance_shared(kid)
    }

    fn allocate_instance_shared(&self, kid: KlassId) -> Result<ObjRef, JavaThrowable> {
        let klass = self.registry.klass(kid);
        let words = klass
            .instance_size_words()
            .ok_or_else(|| JavaThrowable::bare(JavaExKind::InstantiationError))?;
        let start = self
            .heap
            .alloc_shared(words)
            .ok_or_else(|| JavaThrowable::bare(JavaExKind::OutOfMemoryError))?;
        let obj = ObjRef::from_index(start);
        self.heap.put_word(obj, MARK_OFFSET, mark::prototype());
        self.heap.set_klass_release(obj, kid);
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        Ok(obj)
    }

    /// `_new` slow path: resolve, initialize, and allocate (TLAB first,
    /// shared arena as fallback).
    pub fn instr_new_slow(
        self: &Arc<Self>,
        thread: &mut JavaThread,
        pool: &Arc<ConstantPool>,
        cp_index: u16,
    ) -> Result<ObjRef, JavaThrowable> {
        let kid = self.resolve_klass(pool, cp_index)?;
        let klass = self.registry.klass(kid);
        let Some(shape_words) = klass.instance_size_words() else {
            return Err(JavaThrowable::new(
                JavaExKind::InstantiationError,
                klass.name.as_ref(),
            ));
        };
        if klass.is_interface() {
            return Err(JavaThrowable::new(
                JavaExKind::InstantiationError,
                klass.name.as_ref(),
            ));
        }
        self.initialize_class(thread, kid)?;
        let mut start = thread.tlab.allocate(shape_words);
        if start.is_none()
            && self.config.use_tlab
            && thread
                .tlab
                .refill(&self.heap, self.config.tlab_words.max(shape_words))
        {
            start = thread.tlab.allocate(shape_words);
        }
        let start = match start {
            Some(s) => s,
            None => self
                .heap
                .alloc_shared(shape_words)
                .ok_or_else(|| JavaThrowable::bare(JavaExKind::OutOfMemoryError))?,
        };
        let obj = ObjRef::from_index(start);
        self.heap.put_word(obj, MARK_OFFSET, mark::prototype());
        self.heap.set_klass_release(obj, kid);
        // Publication order: zeroed body and header precede any store that
        // makes the reference visible.
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        Ok(obj)
    }

    /// Primitive array allocation; always the runtime path.
    pub fn newarray(&self, elem: BasicType, length: i32) -> Result<ObjRef, JavaThrowable> {
        if length < 0 {
            return Err(JavaThrowable::new(
                JavaExKind::NegativeArraySizeException,
                length.to_string(),
            ));
        }
        let kid = self
            .registry
            .primitive_array_klass(elem)
            .map_err(|e| JavaThrowable::new(JavaExKind::InternalError, e.to_string()))?;
        self.allocate_array(kid, length)
    }

    pub fn anewarray(
        &self,
        pool: &Arc<ConstantPool>,
        cp_index: u16,
        length: i32,
    ) -> Result<ObjRef, JavaThrowable> {
        if length < 0 {
            return Err(JavaThrowable::new(
                JavaExKind::NegativeArraySizeException,
                length.to_string(),
            ));
        }
        let elem = self.resolve_klass(pool, cp_index)?;
        let kid = self
            .registry
            .obj_array_klass(elem)
            .map_err(|e| JavaThrowable::new(JavaExKind::InternalError, e.to_string()))?;
        self.allocate_array(kid, length)
    }

    /// Multi-dimensional allocation: the constant names the outermost array
    /// klass; inner dimensions follow its element chain. A zero length
    /// stops the recursion, as deeper arrays are never observable.
    pub fn multianewarray(
        &self,
        pool: &Arc<ConstantPool>,
        cp_index: u16,
        dims: &[i32],
    ) -> Result<ObjRef, JavaThrowable> {
        let kid = self.resolve_klass(pool, cp_index)?;
        for &d in dims {
            if d < 0 {
                return Err(JavaThrowable::new(
                    JavaExKind::NegativeArraySizeException,
                    d.to_string(),
                ));
            }
        }
        self.allocate_multi(kid, dims)
    }

    fn allocate_multi(&self, kid: KlassId, dims: &[i32]) -> Result<ObjRef, JavaThrowable> {
        let length = dims[0];
        let arr = self.allocate_array(kid, length)?;
        if dims.len() > 1 && length > 0 {
            let klass = self.registry.klass(kid);
            let KlassKind::ObjArray { elem_klass } = klass.kind else {
                return Err(JavaThrowable::new(
                    JavaExKind::InternalError,
                    "multianewarray rank exceeds array klass depth",
                ));
            };
            for i in 0..length {
                let inner = self.allocate_multi(elem_klass, &dims[1..])?;
                crate::heap::barrier::store_heap_oop(
                    &self.heap,
                    arr,
                    ARRAY_BASE_OFFSET + i as usize,
                    Some(inner),
                    crate::heap::barrier::IN_HEAP
                        | crate::heap::barrier::IS_ARRAY
                        | crate::heap::barrier::IS_DEST_UNINITIALIZED,
                );
            }
        }
        Ok(arr)
    }

    pub fn allocate_array(&self, kid: KlassId, length: i32) -> Result<ObjRef, JavaThrowable> {
        let words = ARRAY_BASE_OFFSET + length as usize;
        let start = self
            .heap
            .alloc_shared(words)
            .ok_or_else(|| JavaThrowable::bare(JavaExKind::OutOfMemoryError))?;
        let obj = ObjRef::from_index(start);
        self.heap.put_word(obj, MARK_OFFSET, mark::prototype());
        self.heap.set_array_length(obj, length);
        self.heap.set_klass_release(obj, kid);
        std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
        Ok(obj)
    }

    /// Interned string: a char array shared per distinct literal. The table
    /// lock covers the whole check-allocate-insert sequence so racing
    /// resolvers agree on one object.
    pub fn intern_string(&self, s: &Arc<str>) -> Result<ObjRef, JavaThrowable> {
        let mut table = self.interned_strings.lock();
        if let Some(obj) = table.get(s) {
            return Ok(*obj);
        }
        let chars: Vec<u16> = s.encode_utf16().collect();
        let kid = self
            .registry
            .primitive_array_klass(BasicType::Char)
            .map_err(|e| JavaThrowable::new(JavaExKind::InternalError, e.to_string()))?;
        let obj = self.allocate_array(kid, chars.len() as i32)?;
        for (i, c) in chars.iter().enumerate() {
            self.heap.put_word(obj, ARRAY_BASE_OFFSET + i, *c as u64);
        }
        table.insert(s.clone(), obj);
        Ok(obj)
    }

    // ------------------------------------------------------------------
    // Branch/OSR runtime.

    /// Backedge counter overflow: hand the loop to the compiler bridge.
    pub fn frequency_counter_overflow(
        &self,
        method: MethodId,
        branch_bci: usize,
    ) -> Option<Arc<OsrNmethod>> {
        self.compiler.frequency_counter_overflow(method, branch_bci)
    }

    /// Lazily build a method's counters object; the interpreter calls this
    /// from the first backward branch that finds none.
    pub fn build_method_counters(&self, method: &Method) {
        method.build_method_counters(self.config.invocation_mask, self.config.backedge_mask);
    }
}
