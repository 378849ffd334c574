use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::interp::cpcache::CpCache;
use crate::rt::JavaThrowable;
use crate::value::{JValue, KlassId, MethodId, ObjRef, PoolId, TosState};

/// Constant-pool tag byte. Tags are mutable: class entries move through
/// `UnresolvedClass → Class` (or `→ UnresolvedClassInError`), dynamic
/// entries through `Dynamic → DynamicInError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Invalid = 0,
    Integer = 1,
    Float = 2,
    Long = 3,
    Double = 4,
    String = 5,
    Class = 6,
    UnresolvedClass = 7,
    UnresolvedClassInError = 8,
    Fieldref = 9,
    Methodref = 10,
    InterfaceMethodref = 11,
    Dynamic = 12,
    DynamicInError = 13,
    InvokeDynamic = 14,
}

impl Tag {
    pub fn from_raw(raw: u8) -> Tag {
        match raw {
            1 => Tag::Integer,
            2 => Tag::Float,
            3 => Tag::Long,
            4 => Tag::Double,
            5 => Tag::String,
            6 => Tag::Class,
            7 => Tag::UnresolvedClass,
            8 => Tag::UnresolvedClassInError,
            9 => Tag::Fieldref,
            10 => Tag::Methodref,
            11 => Tag::InterfaceMethodref,
            12 => Tag::Dynamic,
            13 => Tag::DynamicInError,
            14 => Tag::InvokeDynamic,
            _ => Tag::Invalid,
        }
    }
}

/// Producer for a dynamically-computed constant; runs at most once per slot.
pub type CondyProducer = Arc<dyn Fn() -> Result<JValue, JavaThrowable> + Send + Sync>;

#[derive(Clone)]
pub struct FieldRefConst {
    pub class_index: u16,
    pub name: Arc<str>,
}

#[derive(Clone)]
pub struct MethodRefConst {
    pub class_index: u16,
    pub name: Arc<str>,
}

#[derive(Clone)]
pub enum PoolConstant {
    Empty,
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(Arc<str>),
    Class { name: Arc<str> },
    Fieldref(FieldRefConst),
    Methodref(MethodRefConst),
    InterfaceMethodref(MethodRefConst),
    Dynamic { tos: TosState, producer: CondyProducer },
    InvokeDynamic {
        adapter: MethodId,
        appendix: Option<ObjRef>,
    },
}

impl std::fmt::Debug for PoolConstant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolConstant::Empty => write!(f, "Empty"),
            PoolConstant::Integer(v) => write!(f, "Integer({v})"),
            PoolConstant::Float(v) => write!(f, "Float({v})"),
            PoolConstant::Long(v) => write!(f, "Long({v})"),
            PoolConstant::Double(v) => write!(f, "Double({v})"),
            PoolConstant::String(s) => write!(f, "String({s:?})"),
            PoolConstant::Class { name } => write!(f, "Class({name})"),
            PoolConstant::Fieldref(r) => write!(f, "Fieldref({})", r.name),
            PoolConstant::Methodref(r) => write!(f, "Methodref({})", r.name),
            PoolConstant::InterfaceMethodref(r) => write!(f, "InterfaceMethodref({})", r.name),
            PoolConstant::Dynamic { tos, .. } => write!(f, "Dynamic({tos:?})"),
            PoolConstant::InvokeDynamic { adapter, .. } => write!(f, "InvokeDynamic({adapter:?})"),
        }
    }
}

pub struct ConstantPool {
    id: OnceCell<PoolId>,
    holder: OnceCell<KlassId>,
    tags: Box<[AtomicU8]>,
    constants: Vec<PoolConstant>,
    /// Resolved klass per Class constant, `kid + 1`; 0 = unresolved.
    resolved_klasses: Box<[AtomicU32]>,
    /// Resolved reference (string, condy object) per constant; 0 = none.
    resolved_references: Box<[AtomicU64]>,
    /// Primitive condy results, keyed by constant index.
    condy_values: Mutex<FxHashMap<u16, JValue>>,
    /// First resolution error per constant; replayed on re-reference.
    errors: Mutex<FxHashMap<u16, JavaThrowable>>,
    cache: OnceCell<Arc<CpCache>>,
}

impl ConstantPool {
    fn initial_tag(c: &PoolConstant) -> Tag {
        match c {
            PoolConstant::Empty => Tag::Invalid,
            PoolConstant::Integer(_) => Tag::Integer,
            PoolConstant::Float(_) => Tag::Float,
            PoolConstant::Long(_) => Tag::Long,
            PoolConstant::Double(_) => Tag::Double,
            PoolConstant::String(_) => Tag::String,
            PoolConstant::Class { .. } => Tag::UnresolvedClass,
            PoolConstant::Fieldref(_) => Tag::Fieldref,
            PoolConstant::Methodref(_) => Tag::Methodref,
            PoolConstant::InterfaceMethodref(_) => Tag::InterfaceMethodref,
            PoolConstant::Dynamic { .. } => Tag::Dynamic,
            PoolConstant::InvokeDynamic { .. } => Tag::InvokeDynamic,
        }
    }

    pub fn new(constants: Vec<PoolConstant>) -> ConstantPool {
        let tags = constants
            .iter()
            .map(|c| AtomicU8::new(Self::initial_tag(c) as u8))
            .collect::<Vec<_>>();
        let n = constants.len();
        let mut resolved_klasses = Vec::with_capacity(n);
        resolved_klasses.resize_with(n, || AtomicU32::new(0));
        let mut resolved_references = Vec::with_capacity(n);
        resolved_references.resize_with(n, || AtomicU64::new(0));
        ConstantPool {
            id: OnceCell::new(),
            holder: OnceCell::new(),
            tags: tags.into_boxed_slice(),
            constants,
            resolved_klasses: resolved_klasses.into_boxed_slice(),
            resolved_references: resolved_references.into_boxed_slice(),
            condy_values: Mutex::new(FxHashMap::default()),
            errors: Mutex::new(FxHashMap::default()),
            cache: OnceCell::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn id(&self) -> PoolId {
        *self.id.get().expect("pool not registered")
    }

    pub(crate) fn set_id(&self, id: PoolId) {
        self.id.set(id).expect("pool registered twice");
    }

    pub fn holder(&self) -> Option<KlassId> {
        self.holder.get().copied()
    }

    pub(crate) fn set_holder(&self, kid: KlassId) {
        let _ = self.holder.set(kid);
    }

    #[inline]
    pub fn tag_at(&self, index: u16) -> Tag {
        Tag::from_raw(self.tags[index as usize].load(Ordering::Acquire))
    }

    pub fn set_tag(&self, index: u16, tag: Tag) {
        self.tags[index as usize].store(tag as u8, Ordering::Release);
    }

    #[inline]
    pub fn constant(&self, index: u16) -> &PoolConstant {
        &self.constants[index as usize]
    }

    pub fn resolved_klass_at(&self, index: u16) -> Option<KlassId> {
        match self.resolved_klasses[index as usize].load(Ordering::Acquire) {
            0 => None,
            raw => Some(KlassId(raw - 1)),
        }
    }

    /// Publish a resolved klass and flip the tag, in that order, so a reader
    /// that observes `Tag::Class` always finds the klass word.
    pub fn set_resolved_klass(&self, index: u16, kid: KlassId) {
        self.resolved_klasses[index as usize].store(kid.0 + 1, Ordering::Release);
        self.set_tag(index, Tag::Class);
    }

    pub fn resolved_reference_at(&self, index: u16) -> Option<ObjRef> {
        ObjRef::from_bits(self.resolved_references[index as usize].load(Ordering::Acquire))
    }

    pub fn set_resolved_reference(&self, index: u16, obj: ObjRef) {
        self.resolved_references[index as usize].store(ObjRef::bits(Some(obj)), Ordering::Release);
    }

    pub fn condy_value(&self, index: u16) -> Option<JValue> {
        self.condy_values.lock().get(&index).copied()
    }

    /// Lock the condy table for a check-then-compute sequence, so a
    /// dynamically-computed constant's producer runs at most once.
    pub fn condy_values_lock(&self) -> parking_lot::MutexGuard<'_, FxHashMap<u16, JValue>> {
        self.condy_values.lock()
    }

    pub fn set_condy_value(&self, index: u16, v: JValue) {
        self.condy_values.lock().insert(index, v);
    }

    /// Record a resolution error; later references replay it without
    /// re-attempting resolution.
    pub fn record_error(&self, index: u16, error: JavaThrowable, tag: Tag) {
        self.errors.lock().entry(index).or_insert(error);
        self.set_tag(index, tag);
    }

    pub fn cached_error(&self, index: u16) -> Option<JavaThrowable> {
        self.errors.lock().get(&index).cloned()
    }

    pub fn cache(&self) -> Option<&Arc<CpCache>> {
        self.cache.get()
    }

    pub(crate) fn set_cache(&self, cache: Arc<CpCache>) {
        self.cache.set(cache).expect("pool cache installed twice");
    }
}

/// Builder assigning constant indices in push order; index 0 stays invalid
/// as in the class-file format.
pub struct PoolBuilder {
    constants: Vec<PoolConstant>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    pub fn new() -> PoolBuilder {
        PoolBuilder {
            constants: vec![PoolConstant::Empty],
        }
    }

    fn push(&mut self, c: PoolConstant) -> u16 {
        let idx = self.constants.len() as u16;
        self.constants.push(c);
        idx
    }

    pub fn integer(&mut self, v: i32) -> u16 {
        self.push(PoolConstant::Integer(v))
    }

    pub fn float(&mut self, v: f32) -> u16 {
        self.push(PoolConstant::Float(v))
    }

    pub fn long(&mut self, v: i64) -> u16 {
        // Category-2 constants take two slots in the class-file format.
        let idx = self.push(PoolConstant::Long(v));
        self.push(PoolConstant::Empty);
        idx
    }

    pub fn double(&mut self, v: f64) -> u16 {
        let idx = self.push(PoolConstant::Double(v));
        self.push(PoolConstant::Empty);
        idx
    }

    pub fn string(&mut self, s: &str) -> u16 {
        self.push(PoolConstant::String(Arc::from(s)))
    }

    pub fn class(&mut self, name: &str) -> u16 {
        self.push(PoolConstant::Class { name: Arc::from(name) })
    }

    pub fn fieldref(&mut self, class_index: u16, name: &str) -> u16 {
        self.push(PoolConstant::Fieldref(FieldRefConst {
            class_index,
            name: Arc::from(name),
        }))
    }

    pub fn methodref(&mut self, class_index: u16, name: &str) -> u16 {
        self.push(PoolConstant::Methodref(MethodRefConst {
            class_index,
            name: Arc::from(name),
        }))
    }

    pub fn interface_methodref(&mut self, class_index: u16, name: &str) -> u16 {
        self.push(PoolConstant::InterfaceMethodref(MethodRefConst {
            class_index,
            name: Arc::from(name),
        }))
    }

    pub fn dynamic(&mut self, tos: TosState, producer: CondyProducer) -> u16 {
        self.push(PoolConstant::Dynamic { tos, producer })
    }

    pub fn invokedynamic(&mut self, adapter: MethodId, appendix: Option<ObjRef>) -> u16 {
        self.push(PoolConstant::InvokeDynamic { adapter, appendix })
    }

    pub fn build(self) -> ConstantPool {
        ConstantPool::new(self.constants)
    }
}
