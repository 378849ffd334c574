//! Scenario tests for the interpreter: assembled bytecode methods run
//! through the real entry point.

use std::sync::Arc;

pub(super) use crate::config::VmConfig;
pub(super) use crate::interp::bytecodes as bc;
pub(super) use crate::interp::JavaThread;
pub(super) use crate::meta::{KlassBuilder, MethodBuilder, PoolBuilder};
pub(super) use crate::rt::{InvokeOutcome, JavaExKind, JavaThrowable, VmEnv};
pub(super) use crate::value::{BasicType, JValue, KlassId, MethodId, ObjRef, TosState};

use crate::interp::call_method;

mod arithmetic;
mod control_flow;
mod fields_objects;

/// Branch target to be patched once bound.
#[derive(Debug, Clone, Copy)]
pub(super) struct Label(usize);

enum Fix {
    Rel16 { opcode_at: usize, operand_at: usize, label: Label },
    Rel32 { opcode_at: usize, operand_at: usize, label: Label },
}

/// Minimal bytecode assembler with label patching; offsets are relative to
/// the branching opcode, as in the class-file format.
pub(super) struct Asm {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixes: Vec<Fix>,
}

impl Asm {
    pub fn new() -> Asm {
        Asm {
            code: Vec::new(),
            labels: Vec::new(),
            fixes: Vec::new(),
        }
    }

    pub fn here(&self) -> usize {
        self.code.len()
    }

    pub fn op(&mut self, op: u8) -> &mut Self {
        self.code.push(op);
        self
    }

    pub fn u1(&mut self, v: u8) -> &mut Self {
        self.code.push(v);
        self
    }

    pub fn u2(&mut self, v: u16) -> &mut Self {
        self.code.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u4(&mut self, v: u32) -> &mut Self {
        self.code.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, l: Label) -> &mut Self {
        self.labels[l.0] = Some(self.code.len());
        self
    }

    pub fn branch(&mut self, op: u8, l: Label) -> &mut Self {
        let opcode_at = self.code.len();
        self.code.push(op);
        self.fixes.push(Fix::Rel16 {
            opcode_at,
            operand_at: self.code.len(),
            label: l,
        });
        self.code.extend_from_slice(&[0, 0]);
        self
    }

    fn pad4(&mut self) {
        while self.code.len() % 4 != 0 {
            self.code.push(0);
        }
    }

    fn rel32(&mut self, opcode_at: usize, label: Label) {
        self.fixes.push(Fix::Rel32 {
            opcode_at,
            operand_at: self.code.len(),
            label,
        });
        self.code.extend_from_slice(&[0, 0, 0, 0]);
    }

    pub fn tableswitch(&mut self, default: Label, low: i32, targets: &[Label]) -> &mut Self {
        let opcode_at = self.code.len();
        self.code.push(bc::TABLESWITCH);
        self.pad4();
        self.rel32(opcode_at, default);
        self.code.extend_from_slice(&low.to_be_bytes());
        let high = low + targets.len() as i32 - 1;
        self.code.extend_from_slice(&high.to_be_bytes());
        for &t in targets {
            self.rel32(opcode_at, t);
        }
        self
    }

    pub fn lookupswitch(&mut self, default: Label, pairs: &[(i32, Label)]) -> &mut Self {
        let opcode_at = self.code.len();
        self.code.push(bc::LOOKUPSWITCH);
        self.pad4();
        self.rel32(opcode_at, default);
        self.code
            .extend_from_slice(&(pairs.len() as u32).to_be_bytes());
        for &(key, t) in pairs {
            self.code.extend_from_slice(&key.to_be_bytes());
            self.rel32(opcode_at, t);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        let Asm {
            mut code,
            labels,
            fixes,
        } = self;
        for fix in fixes {
            match fix {
                Fix::Rel16 {
                    opcode_at,
                    operand_at,
                    label,
                } => {
                    let target = labels[label.0].expect("unbound label");
                    let offset = target as isize - opcode_at as isize;
                    code[operand_at..operand_at + 2]
                        .copy_from_slice(&(offset as i16).to_be_bytes());
                }
                Fix::Rel32 {
                    opcode_at,
                    operand_at,
                    label,
                } => {
                    let target = labels[label.0].expect("unbound label");
                    let offset = target as isize - opcode_at as isize;
                    code[operand_at..operand_at + 4]
                        .copy_from_slice(&(offset as i32).to_be_bytes());
                }
            }
        }
        code
    }
}

pub(super) struct Fixture {
    pub env: Arc<VmEnv>,
    pub thread: JavaThread,
}

impl Fixture {
    pub fn new() -> Fixture {
        Fixture::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Fixture {
        let env = VmEnv::new(config).unwrap();
        Fixture::with_env(env)
    }

    pub fn with_env(env: Arc<VmEnv>) -> Fixture {
        let thread = JavaThread::new(&env);
        Fixture { env, thread }
    }

    pub fn object_klass(&self) -> KlassId {
        self.env.registry.object_klass().unwrap()
    }

    pub fn run(&mut self, mid: MethodId, args: &[JValue]) -> InvokeOutcome {
        call_method(&self.env, &mut self.thread, mid, args).unwrap()
    }

    pub fn call_int(&mut self, mid: MethodId, args: &[JValue]) -> i32 {
        match self.run(mid, args) {
            InvokeOutcome::Normal(Some(JValue::Int(v))) => v,
            other => panic!("expected int result, got {other:?}"),
        }
    }

    pub fn call_long(&mut self, mid: MethodId, args: &[JValue]) -> i64 {
        match self.run(mid, args) {
            InvokeOutcome::Normal(Some(JValue::Long(v))) => v,
            other => panic!("expected long result, got {other:?}"),
        }
    }

    pub fn call_float(&mut self, mid: MethodId, args: &[JValue]) -> f32 {
        match self.run(mid, args) {
            InvokeOutcome::Normal(Some(JValue::Float(v))) => v,
            other => panic!("expected float result, got {other:?}"),
        }
    }

    pub fn call_double(&mut self, mid: MethodId, args: &[JValue]) -> f64 {
        match self.run(mid, args) {
            InvokeOutcome::Normal(Some(JValue::Double(v))) => v,
            other => panic!("expected double result, got {other:?}"),
        }
    }

    pub fn call_obj(&mut self, mid: MethodId, args: &[JValue]) -> Option<ObjRef> {
        match self.run(mid, args) {
            InvokeOutcome::Normal(Some(JValue::Obj(v))) => v,
            other => panic!("expected object result, got {other:?}"),
        }
    }

    pub fn call_void(&mut self, mid: MethodId, args: &[JValue]) {
        match self.run(mid, args) {
            InvokeOutcome::Normal(None) => {}
            other => panic!("expected void result, got {other:?}"),
        }
    }

    pub fn call_threw(&mut self, mid: MethodId, args: &[JValue]) -> JavaThrowable {
        match self.run(mid, args) {
            InvokeOutcome::Threw(t) => t,
            other => panic!("expected a thrown exception, got {other:?}"),
        }
    }

    pub fn new_instance(&self, kid: KlassId) -> ObjRef {
        self.env.new_instance(kid).unwrap()
    }
}

/// Register a klass from a builder plus its pool.
pub(super) fn register_class(env: &Arc<VmEnv>, builder: KlassBuilder, pool: PoolBuilder) -> KlassId {
    let pool = env.registry.register_pool(pool.build());
    builder.register(&env.registry, pool).unwrap()
}

/// One throwaway klass holding a single method, on a fresh VM.
pub(super) fn single_method_fixture(decl: crate::meta::MethodDecl) -> (Fixture, MethodId) {
    let fx = Fixture::new();
    let object = fx.object_klass();
    let name = decl.name.clone();
    let kid = register_class(
        &fx.env,
        KlassBuilder::new("Test").super_klass(object).method(decl),
        PoolBuilder::new(),
    );
    let mid = method_named(&fx.env, kid, &name);
    (fx, mid)
}

pub(super) fn method_named(env: &Arc<VmEnv>, kid: KlassId, name: &str) -> MethodId {
    let klass = env.registry.klass(kid);
    let shape = klass.instance().expect("instance klass");
    *shape
        .methods
        .iter()
        .find(|&&m| env.registry.method(m).name.as_ref() == name)
        .unwrap_or_else(|| panic!("method {name} on {}", klass.name))
}
