use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::interp::counters::{MethodCounters, MethodData};
use crate::rt::JavaThrowable;
use crate::value::{BasicType, JValue, KlassId, PoolId};

pub type NativeMethod =
    Arc<dyn Fn(&[JValue]) -> Result<Option<JValue>, JavaThrowable> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_synchronized: bool,
    pub is_abstract: bool,
    pub is_private: bool,
    pub is_final: bool,
    pub is_native: bool,
}

/// One method's metadata. The bytecode bytes are atomics: quickening patches
/// them in place while other threads execute the same stream, and racy
/// idempotent patching is well-defined on `AtomicU8`.
pub struct Method {
    pub name: Arc<str>,
    pub holder: KlassId,
    pub pool: PoolId,
    pub max_stack: u16,
    pub max_locals: u16,
    pub flags: MethodFlags,
    /// Declared parameter types, receiver excluded.
    pub param_types: Vec<BasicType>,
    pub return_type: BasicType,
    pub vtable_index: Option<u16>,
    pub itable_index: Option<u16>,
    /// Rewrites `return` to `return_register_finalizer` (root-class
    /// constructor).
    pub register_finalizer_on_return: bool,
    pub native: Option<NativeMethod>,
    code: Box<[AtomicU8]>,
    counters: OnceCell<Arc<MethodCounters>>,
    method_data: OnceCell<Arc<MethodData>>,
}

impl Method {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        name: Arc<str>,
        holder: KlassId,
        pool: PoolId,
        max_stack: u16,
        max_locals: u16,
        flags: MethodFlags,
        param_types: Vec<BasicType>,
        return_type: BasicType,
        code: Vec<u8>,
        native: Option<NativeMethod>,
        vtable_index: Option<u16>,
        itable_index: Option<u16>,
        register_finalizer_on_return: bool,
    ) -> Method {
        let code = code.into_iter().map(AtomicU8::new).collect::<Vec<_>>();
        Method {
            name,
            holder,
            pool,
            max_stack,
            max_locals,
            flags,
            param_types,
            return_type,
            vtable_index,
            itable_index,
            register_finalizer_on_return,
            native,
            code: code.into_boxed_slice(),
            counters: OnceCell::new(),
            method_data: OnceCell::new(),
        }
    }

    /// Argument slots including the receiver for instance methods.
    pub fn param_slots(&self) -> usize {
        let mut slots = if self.flags.is_static { 0 } else { 1 };
        for t in &self.param_types {
            slots += t.slots();
        }
        slots
    }

    #[inline]
    pub fn code_len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn code_byte(&self, bci: usize) -> u8 {
        self.code[bci].load(Ordering::Relaxed)
    }

    /// Patch one bytecode byte in place (quickening, breakpoints).
    #[inline]
    pub fn patch_code_byte(&self, bci: usize, byte: u8) {
        self.code[bci].store(byte, Ordering::Relaxed);
    }

    /// Big-endian operand as the class file encodes it.
    #[inline]
    pub fn java_u2(&self, bci: usize) -> u16 {
        u16::from_be_bytes([self.code_byte(bci), self.code_byte(bci + 1)])
    }

    #[inline]
    pub fn java_u4(&self, bci: usize) -> u32 {
        u32::from_be_bytes([
            self.code_byte(bci),
            self.code_byte(bci + 1),
            self.code_byte(bci + 2),
            self.code_byte(bci + 3),
        ])
    }

    /// Native-order operand written by the rewriter (cache indices).
    #[inline]
    pub fn native_u2(&self, bci: usize) -> u16 {
        u16::from_le_bytes([self.code_byte(bci), self.code_byte(bci + 1)])
    }

    #[inline]
    pub fn native_u4(&self, bci: usize) -> u32 {
        u32::from_le_bytes([
            self.code_byte(bci),
            self.code_byte(bci + 1),
            self.code_byte(bci + 2),
            self.code_byte(bci + 3),
        ])
    }

    pub fn write_native_u2(&self, bci: usize, v: u16) {
        let [a, b] = v.to_le_bytes();
        self.patch_code_byte(bci, a);
        self.patch_code_byte(bci + 1, b);
    }

    pub fn write_native_u4(&self, bci: usize, v: u32) {
        for (i, byte) in v.to_le_bytes().into_iter().enumerate() {
            self.patch_code_byte(bci + i, byte);
        }
    }

    /// Existing counters, if any backward branch created them yet.
    pub fn method_counters(&self) -> Option<&Arc<MethodCounters>> {
        self.counters.get()
    }

    /// Lazily build the counters object; idempotent under races.
    pub fn build_method_counters(
        &self,
        invocation_mask: u32,
        backedge_mask: u32,
    ) -> &Arc<MethodCounters> {
        self.counters
            .get_or_init(|| Arc::new(MethodCounters::new(invocation_mask, backedge_mask)))
    }

    pub fn method_data(&self) -> Option<&Arc<MethodData>> {
        self.method_data.get()
    }

    pub fn ensure_method_data(&self, backedge_mask: u32) -> &Arc<MethodData> {
        self.method_data
            .get_or_init(|| Arc::new(MethodData::new(self.code_len(), backedge_mask)))
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("code_len", &self.code.len())
            .finish()
    }
}

/// Declaration consumed by `KlassBuilder`; becomes a registered [`Method`].
pub struct MethodDecl {
    pub name: Arc<str>,
    pub max_stack: u16,
    pub max_locals: u16,
    pub flags: MethodFlags,
    pub param_types: Vec<BasicType>,
    pub return_type: BasicType,
    pub code: Vec<u8>,
    pub native: Option<NativeMethod>,
    pub register_finalizer_on_return: bool,
}

/// Builder for method declarations, mirroring what a class-file parser
/// would produce.
pub struct MethodBuilder {
    decl: MethodDecl,
}

impl MethodBuilder {
    pub fn new(name: &str) -> MethodBuilder {
        MethodBuilder {
            decl: MethodDecl {
                name: Arc::from(name),
                max_stack: 8,
                max_locals: 8,
                flags: MethodFlags::default(),
                param_types: Vec::new(),
                return_type: BasicType::Void,
                code: Vec::new(),
                native: None,
                register_finalizer_on_return: false,
            },
        }
    }

    pub fn max_stack(mut self, n: u16) -> Self {
        self.decl.max_stack = n;
        self
    }

    pub fn max_locals(mut self, n: u16) -> Self {
        self.decl.max_locals = n;
        self
    }

    pub fn code(mut self, code: Vec<u8>) -> Self {
        self.decl.code = code;
        self
    }

    pub fn params(mut self, types: &[BasicType]) -> Self {
        self.decl.param_types = types.to_vec();
        self
    }

    pub fn returns(mut self, t: BasicType) -> Self {
        self.decl.return_type = t;
        self
    }

    pub fn static_method(mut self) -> Self {
        self.decl.flags.is_static = true;
        self
    }

    pub fn synchronized(mut self) -> Self {
        self.decl.flags.is_synchronized = true;
        self
    }

    pub fn abstract_method(mut self) -> Self {
        self.decl.flags.is_abstract = true;
        self
    }

    pub fn private_method(mut self) -> Self {
        self.decl.flags.is_private = true;
        self
    }

    pub fn final_method(mut self) -> Self {
        self.decl.flags.is_final = true;
        self
    }

    pub fn native_impl(mut self, f: NativeMethod) -> Self {
        self.decl.flags.is_native = true;
        self.decl.native = Some(f);
        self
    }

    pub fn registers_finalizer(mut self) -> Self {
        self.decl.register_finalizer_on_return = true;
        self
    }

    pub fn build(self) -> MethodDecl {
        self.decl
    }
}

/// Trivial sanity checks a verifier would do; kept to what the interpreter
/// relies on.
pub fn validate_decl(decl: &MethodDecl) -> anyhow::Result<()> {
    if !decl.flags.is_abstract && !decl.flags.is_native && decl.code.is_empty() {
        anyhow::bail!("concrete method {} has no code", decl.name);
    }
    let mut min_locals = if decl.flags.is_static { 0 } else { 1 };
    for t in &decl.param_types {
        min_locals += t.slots();
    }
    if (decl.max_locals as usize) < min_locals {
        anyhow::bail!(
            "method {} declares max_locals {} below its {} parameter slots",
            decl.name,
            decl.max_locals,
            min_locals
        );
    }
    Ok(())
}
