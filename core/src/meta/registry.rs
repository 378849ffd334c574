use std::sync::Arc;

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::heap::INSTANCE_BASE_OFFSET;
use crate::interp::cpcache::CpCacheBuilder;
use crate::value::{BasicType, KlassId, MethodId, PoolId, TosState};

use super::klass::{
    FieldInfo, InitState, InstanceShape, ItableBlock, Klass, KlassKind,
};
use super::method::{validate_decl, Method, MethodDecl};
use super::pool::ConstantPool;
use super::rewriter::rewrite_method;

pub const OBJECT_KLASS_NAME: &str = "java/lang/Object";
pub const CLASS_KLASS_NAME: &str = "java/lang/Class";

/// Process-wide metadata registry. Initialized at VM bootstrap, torn down at
/// VM shutdown; passed explicitly to every subsystem that allocates or
/// resolves metadata.
pub struct MetaRegistry {
    klasses: RwLock<Vec<Option<Arc<Klass>>>>,
    names: RwLock<FxHashMap<Arc<str>, KlassId>>,
    methods: RwLock<Vec<Arc<Method>>>,
    pools: RwLock<Vec<Arc<ConstantPool>>>,
    object_klass: OnceCell<KlassId>,
    class_klass: OnceCell<KlassId>,
    primitive_arrays: Mutex<FxHashMap<BasicType, KlassId>>,
    obj_arrays: Mutex<FxHashMap<KlassId, KlassId>>,
}

impl Default for MetaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaRegistry {
    pub fn new() -> MetaRegistry {
        MetaRegistry {
            klasses: RwLock::new(Vec::new()),
            names: RwLock::new(FxHashMap::default()),
            methods: RwLock::new(Vec::new()),
            pools: RwLock::new(Vec::new()),
            object_klass: OnceCell::new(),
            class_klass: OnceCell::new(),
            primitive_arrays: Mutex::new(FxHashMap::default()),
            obj_arrays: Mutex::new(FxHashMap::default()),
        }
    }

    /// Register the well-known klasses if the embedder has not already done
    /// so: the root class, the mirror class, and the primitive array
    /// klasses.
    pub fn ensure_bootstrap(self: &Arc<Self>) -> Result<()> {
        if self.find_klass(OBJECT_KLASS_NAME).is_none() {
            KlassBuilder::new(OBJECT_KLASS_NAME)
                .init_state(InitState::FullyInitialized)
                .register_plain(self)?;
        }
        if self.find_klass(CLASS_KLASS_NAME).is_none() {
            let object = self.object_klass().expect("root class registered");
            KlassBuilder::new(CLASS_KLASS_NAME)
                .super_klass(object)
                .init_state(InitState::FullyInitialized)
                .register_plain(self)?;
        }
        let prims = [
            BasicType::Boolean,
            BasicType::Char,
            BasicType::Float,
            BasicType::Double,
            BasicType::Byte,
            BasicType::Short,
            BasicType::Int,
            BasicType::Long,
        ];
        for elem in prims {
            self.primitive_array_klass(elem)?;
        }
        Ok(())
    }

    pub fn object_klass(&self) -> Option<KlassId> {
        self.object_klass.get().copied()
    }

    pub fn class_klass(&self) -> Option<KlassId> {
        self.class_klass.get().copied()
    }

    fn reserve_klass(&self, name: &Arc<str>) -> Result<KlassId> {
        let mut names = self.names.write();
        if names.contains_key(name) {
            bail!("klass {name} already registered");
        }
        let mut klasses = self.klasses.write();
        let id = KlassId(klasses.len() as u32);
        klasses.push(None);
        names.insert(name.clone(), id);
        Ok(id)
    }

    fn install_klass(&self, id: KlassId, klass: Arc<Klass>) {
        if klass.name.as_ref() == OBJECT_KLASS_NAME {
            let _ = self.object_klass.set(id);
        }
        if klass.name.as_ref() == CLASS_KLASS_NAME {
            let _ = self.class_klass.set(id);
        }
        self.klasses.write()[id.index()] = Some(klass);
    }

    pub fn klass(&self, id: KlassId) -> Arc<Klass> {
        self.klasses.read()[id.index()]
            .clone()
            .expect("klass id refers to a reserved, uninstalled klass")
    }

    pub fn find_klass(&self, name: &str) -> Option<KlassId> {
        self.names.read().get(name).copied()
    }

    pub(crate) fn register_method(&self, method: Method) -> MethodId {
        let mut methods = self.methods.write();
        let id = MethodId(methods.len() as u32);
        methods.push(Arc::new(method));
        id
    }

    pub fn method(&self, id: MethodId) -> Arc<Method> {
        self.methods.read()[id.index()].clone()
    }

    pub fn register_pool(&self, pool: ConstantPool) -> Arc<ConstantPool> {
        let mut pools = self.pools.write();
        let id = PoolId(pools.len() as u32);
        pool.set_id(id);
        let pool = Arc::new(pool);
        pools.push(pool.clone());
        pool
    }

    pub fn pool(&self, id: PoolId) -> Arc<ConstantPool> {
        self.pools.read()[id.index()].clone()
    }

    /// Klass of `elem[]` for a primitive element type.
    pub fn primitive_array_klass(self: &Arc<Self>, elem: BasicType) -> Result<KlassId> {
        let mut table = self.primitive_arrays.lock();
        if let Some(id) = table.get(&elem) {
            return Ok(*id);
        }
        let name: Arc<str> = Arc::from(format!("[{}", type_descriptor(elem)));
        let id = self.reserve_klass(&name)?;
        let klass = Klass::new(
            name,
            id,
            self.object_klass(),
            Vec::new(),
            KlassKind::TypeArray { elem },
            InitState::FullyInitialized,
        );
        self.install_klass(id, Arc::new(klass));
        table.insert(elem, id);
        Ok(id)
    }

    /// Klass of `E[]` for a reference element klass, created on first use.
    pub fn obj_array_klass(self: &Arc<Self>, elem_klass: KlassId) -> Result<KlassId> {
        let mut table = self.obj_arrays.lock();
        if let Some(id) = table.get(&elem_klass) {
            return Ok(*id);
        }
        let elem = self.klass(elem_klass);
        let name: Arc<str> = Arc::from(format!("[L{};", elem.name));
        let id = self.reserve_klass(&name)?;
        let klass = Klass::new(
            name,
            id,
            self.object_klass(),
            Vec::new(),
            KlassKind::ObjArray { elem_klass },
            InitState::FullyInitialized,
        );
        self.install_klass(id, Arc::new(klass));
        table.insert(elem_klass, id);
        Ok(id)
    }

    /// Subtype test over classes, interfaces, and covariant object arrays.
    pub fn is_subtype_of(&self, sub: KlassId, sup: KlassId) -> bool {
        if sub == sup {
            return true;
        }
        if Some(sup) == self.object_klass() {
            return true;
        }
        let sup_k = self.klass(sup);
        let sub_k = self.klass(sub);
        match (&sub_k.kind, &sup_k.kind) {
            (
                KlassKind::ObjArray { elem_klass: se },
                KlassKind::ObjArray { elem_klass: pe },
            ) => self.is_subtype_of(*se, *pe),
            (_, KlassKind::Instance(_)) => {
                if sup_k.is_interface() {
                    self.implements_interface(sub, sup)
                } else {
                    self.super_chain_contains(sub, sup)
                }
            }
            _ => false,
        }
    }

    fn super_chain_contains(&self, mut k: KlassId, target: KlassId) -> bool {
        loop {
            let klass = self.klass(k);
            match klass.super_id {
                Some(s) if s == target => return true,
                Some(s) => k = s,
                None => return false,
            }
        }
    }

    fn implements_interface(&self, sub: KlassId, iface: KlassId) -> bool {
        let mut cur = Some(sub);
        while let Some(k) = cur {
            let klass = self.klass(k);
            for &i in &klass.interfaces {
                if i == iface || self.interface_extends(i, iface) {
                    return true;
                }
            }
            cur = klass.super_id;
        }
        false
    }

    fn interface_extends(&self, sub: KlassId, sup: KlassId) -> bool {
        if sub == sup {
            return true;
        }
        let klass = self.klass(sub);
        klass.interfaces.iter().any(|&i| self.interface_extends(i, sup))
    }

    /// Transitive interface closure of a klass, in discovery order.
    pub fn interface_closure(&self, kid: KlassId) -> Vec<KlassId> {
        let mut out = Vec::new();
        let mut cur = Some(kid);
        while let Some(k) = cur {
            let klass = self.klass(k);
            for &i in &klass.interfaces {
                self.collect_interface(i, &mut out);
            }
            cur = klass.super_id;
        }
        out
    }

    fn collect_interface(&self, iface: KlassId, out: &mut Vec<KlassId>) {
        if out.contains(&iface) {
            return;
        }
        out.push(iface);
        let klass = self.klass(iface);
        for &i in &klass.interfaces {
            self.collect_interface(i, out);
        }
    }

    /// Find a field by name, walking the super chain from `kid`.
    pub fn lookup_field(&self, kid: KlassId, name: &str) -> Option<(KlassId, FieldInfo)> {
        let mut cur = Some(kid);
        while let Some(k) = cur {
            let klass = self.klass(k);
            if let Some(shape) = klass.instance() {
                if let Some(f) = shape.fields.iter().find(|f| f.name.as_ref() == name) {
                    return Some((k, f.clone()));
                }
            }
            cur = klass.super_id;
        }
        None
    }

    /// Find a method by name: declared methods up the super chain, then
    /// default methods in the interface closure.
    pub fn lookup_method(&self, kid: KlassId, name: &str) -> Option<MethodId> {
        let mut cur = Some(kid);
        while let Some(k) = cur {
            let klass = self.klass(k);
            if let Some(shape) = klass.instance() {
                for &mid in &shape.methods {
                    if self.method(mid).name.as_ref() == name {
                        return Some(mid);
                    }
                }
            }
            cur = klass.super_id;
        }
        for iface in self.interface_closure(kid) {
            let klass = self.klass(iface);
            if let Some(shape) = klass.instance() {
                for &mid in &shape.methods {
                    let m = self.method(mid);
                    if m.name.as_ref() == name && !m.flags.is_abstract {
                        return Some(mid);
                    }
                }
            }
        }
        None
    }

    pub fn method_at_vtable(&self, kid: KlassId, index: usize) -> Option<MethodId> {
        let klass = self.klass(kid);
        // Array klasses dispatch virtual calls through the root class.
        let holder = if klass.is_array() {
            self.object_klass()?
        } else {
            kid
        };
        self.klass(holder).instance()?.vtable.get(index).copied()
    }

    pub fn find_itable_block(&self, kid: KlassId, iface: KlassId) -> Option<ItableBlock> {
        let klass = self.klass(kid);
        klass
            .instance()?
            .itable
            .iter()
            .find(|b| b.interface == iface)
            .cloned()
    }
}

fn type_descriptor(t: BasicType) -> char {
    match t {
        BasicType::Boolean => 'Z',
        BasicType::Char => 'C',
        BasicType::Float => 'F',
        BasicType::Double => 'D',
        BasicType::Byte => 'B',
        BasicType::Short => 'S',
        BasicType::Int => 'I',
        BasicType::Long => 'J',
        BasicType::Object => 'L',
        BasicType::Void => 'V',
    }
}

/// Field declaration consumed by [`KlassBuilder`].
pub struct FieldDecl {
    pub name: Arc<str>,
    pub tos: TosState,
    pub is_static: bool,
    pub is_volatile: bool,
    pub is_final: bool,
}

/// Builder assembling a klass the way a class-file parser would: fields get
/// offsets, methods get vtable/itable slots, the pool gets its cache, and
/// every method body runs through the link-time rewriter.
pub struct KlassBuilder {
    name: Arc<str>,
    super_id: Option<KlassId>,
    interfaces: Vec<KlassId>,
    is_interface: bool,
    has_finalizer: bool,
    init_state: InitState,
    fields: Vec<FieldDecl>,
    methods: Vec<MethodDecl>,
}

impl KlassBuilder {
    pub fn new(name: &str) -> KlassBuilder {
        KlassBuilder {
            name: Arc::from(name),
            super_id: None,
            interfaces: Vec::new(),
            is_interface: false,
            has_finalizer: false,
            init_state: InitState::Linked,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn super_klass(mut self, kid: KlassId) -> Self {
        self.super_id = Some(kid);
        self
    }

    pub fn implements(mut self, iface: KlassId) -> Self {
        self.interfaces.push(iface);
        self
    }

    pub fn interface(mut self) -> Self {
        self.is_interface = true;
        self
    }

    pub fn finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }

    pub fn init_state(mut self, state: InitState) -> Self {
        self.init_state = state;
        self
    }

    pub fn field(mut self, decl: FieldDecl) -> Self {
        self.fields.push(decl);
        self
    }

    pub fn instance_field(self, name: &str, tos: TosState) -> Self {
        self.field(FieldDecl {
            name: Arc::from(name),
            tos,
            is_static: false,
            is_volatile: false,
            is_final: false,
        })
    }

    pub fn volatile_field(self, name: &str, tos: TosState) -> Self {
        self.field(FieldDecl {
            name: Arc::from(name),
            tos,
            is_static: false,
            is_volatile: true,
            is_final: false,
        })
    }

    pub fn static_field(self, name: &str, tos: TosState) -> Self {
        self.field(FieldDecl {
            name: Arc::from(name),
            tos,
            is_static: true,
            is_volatile: false,
            is_final: false,
        })
    }

    pub fn static_volatile_field(self, name: &str, tos: TosState) -> Self {
        self.field(FieldDecl {
            name: Arc::from(name),
            tos,
            is_static: true,
            is_volatile: true,
            is_final: false,
        })
    }

    pub fn final_field(self, name: &str, tos: TosState) -> Self {
        self.field(FieldDecl {
            name: Arc::from(name),
            tos,
            is_static: false,
            is_volatile: false,
            is_final: true,
        })
    }

    pub fn method(mut self, decl: MethodDecl) -> Self {
        self.methods.push(decl);
        self
    }

    /// Register without a constant pool; only valid when no method carries
    /// bytecode (bootstrap and marker klasses).
    pub fn register_plain(self, registry: &Arc<MetaRegistry>) -> Result<KlassId> {
        let pool = registry.register_pool(super::pool::PoolBuilder::new().build());
        self.register(registry, pool)
    }

    pub fn register(
        self,
        registry: &Arc<MetaRegistry>,
        pool: Arc<ConstantPool>,
    ) -> Result<KlassId> {
        let kid = registry.reserve_klass(&self.name)?;
        pool.set_holder(kid);

        let super_shape_size = match self.super_id {
            Some(s) => registry
                .klass(s)
                .instance_size_words()
                .context("super klass is not an instance klass")?,
            None => INSTANCE_BASE_OFFSET,
        };
        let inherited_finalizer = self
            .super_id
            .map(|s| registry.klass(s).has_finalizer())
            .unwrap_or(false);

        // Field layout: instance fields extend the super's block, statics
        // live in the mirror.
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut instance_offset = super_shape_size as u32;
        let mut static_offset = INSTANCE_BASE_OFFSET as u32;
        for decl in &self.fields {
            let offset = if decl.is_static {
                let o = static_offset;
                static_offset += 1;
                o
            } else {
                let o = instance_offset;
                instance_offset += 1;
                o
            };
            fields.push(FieldInfo {
                name: decl.name.clone(),
                tos: decl.tos,
                offset,
                is_static: decl.is_static,
                is_volatile: decl.is_volatile,
                is_final: decl.is_final,
            });
        }

        // Vtable: super's table plus overrides/appends, by name.
        let mut vtable: Vec<MethodId> = match self.super_id {
            Some(s) => registry
                .klass(s)
                .instance()
                .map(|sh| sh.vtable.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        let mut methods = Vec::with_capacity(self.methods.len());
        let mut clinit = None;
        let mut itable_count: u16 = 0;
        for decl in self.methods {
            validate_decl(&decl)?;
            let virtual_dispatch = !decl.flags.is_static
                && !decl.flags.is_private
                && decl.name.as_ref() != "<init>";
            let (vtable_index, itable_index) = if self.is_interface {
                let idx = if virtual_dispatch {
                    let i = itable_count;
                    itable_count += 1;
                    Some(i)
                } else {
                    None
                };
                (None, idx)
            } else if virtual_dispatch {
                let existing = vtable.iter().position(|&mid| {
                    registry.method(mid).name == decl.name
                });
                match existing {
                    Some(i) => (Some(i as u16), None),
                    None => (Some(vtable.len() as u16), None),
                }
            } else {
                (None, None)
            };

            let is_clinit = decl.name.as_ref() == "<clinit>";
            let method = Method::new(
                decl.name,
                kid,
                pool.id(),
                decl.max_stack,
                decl.max_locals,
                decl.flags,
                decl.param_types,
                decl.return_type,
                decl.code,
                decl.native,
                vtable_index,
                itable_index,
                decl.register_finalizer_on_return,
            );
            let mid = registry.register_method(method);
            methods.push(mid);
            if is_clinit {
                clinit = Some(mid);
            }
            if let Some(i) = vtable_index {
                let i = i as usize;
                if i < vtable.len() {
                    vtable[i] = mid;
                } else {
                    vtable.push(mid);
                }
            }
        }

        // Itable: one block per interface in the closure, resolving each
        // interface method to this klass's implementation.
        let mut itable = Vec::new();
        if !self.is_interface {
            let mut closure = Vec::new();
            for &i in &self.interfaces {
                registry.collect_interface(i, &mut closure);
            }
            if let Some(s) = self.super_id {
                for i in registry.interface_closure(s) {
                    if !closure.contains(&i) {
                        closure.push(i);
                    }
                }
            }
            for iface in closure {
                let iface_klass = registry.klass(iface);
                let Some(iface_shape) = iface_klass.instance() else {
                    continue;
                };
                let mut slots: Vec<Option<MethodId>> = Vec::new();
                for &imid in &iface_shape.methods {
                    let im = registry.method(imid);
                    let Some(itable_index) = im.itable_index else {
                        continue;
                    };
                    let idx = itable_index as usize;
                    if slots.len() <= idx {
                        slots.resize(idx + 1, None);
                    }
                    let impl_mid = if im.flags.is_private {
                        Some(imid)
                    } else {
                        let found = vtable
                            .iter()
                            .copied()
                            .find(|&mid| registry.method(mid).name == im.name)
                            .or_else(|| (!im.flags.is_abstract).then_some(imid));
                        found.filter(|&mid| !registry.method(mid).flags.is_abstract)
                    };
                    slots[idx] = impl_mid;
                }
                itable.push(ItableBlock {
                    interface: iface,
                    methods: slots,
                });
            }
        }

        let shape = InstanceShape {
            size_words: instance_offset as usize,
            static_words: (static_offset as usize) - INSTANCE_BASE_OFFSET,
            fields,
            methods: methods.clone(),
            vtable,
            itable,
            has_finalizer: self.has_finalizer || inherited_finalizer,
            is_interface: self.is_interface,
            clinit,
        };
        let klass = Klass::new(
            self.name.clone(),
            kid,
            self.super_id,
            self.interfaces,
            KlassKind::Instance(shape),
            self.init_state,
        );
        registry.install_klass(kid, Arc::new(klass));

        // Link-time rewrite: cache indices to native order, switch variants,
        // finalizer returns. Builds this pool's cache as a side effect.
        let mut cache_builder = CpCacheBuilder::new();
        for &mid in &methods {
            let m = registry.method(mid);
            if m.code_len() > 0 {
                rewrite_method(&m, &pool, &mut cache_builder)?;
            }
        }
        if pool.cache().is_none() {
            pool.set_cache(Arc::new(cache_builder.build(&pool)));
        } else if !cache_builder.is_empty() {
            bail!("constant pool shared across klasses with rewritten methods");
        }

        debug!(target: "robusta::resolve", klass = %self.name, id = kid.0, "klass registered");
        Ok(kid)
    }
}
