use super::*;
use crate::heap::ARRAY_BASE_OFFSET;

/// Point-like class with an int, a volatile long, and a reference field.
fn point_class(fx: &Fixture) -> KlassId {
    register_class(
        &fx.env,
        KlassBuilder::new("P")
            .super_klass(fx.object_klass())
            .instance_field("x", TosState::Itos)
            .volatile_field("v", TosState::Ltos)
            .instance_field("o", TosState::Atos),
        PoolBuilder::new(),
    )
}

#[test]
fn instance_field_round_trip() {
    let fx = Fixture::new();
    let p_kid = point_class(&fx);

    let mut pool = PoolBuilder::new();
    let p_cls = pool.class("P");
    let fx_x = pool.fieldref(p_cls, "x");
    let fx_v = pool.fieldref(p_cls, "v");

    let mut a = Asm::new();
    a.op(bc::ALOAD_0).op(bc::ILOAD_1);
    a.op(bc::PUTFIELD).u2(fx_x);
    a.op(bc::ALOAD_0).op(bc::LLOAD_2);
    a.op(bc::PUTFIELD).u2(fx_v);
    a.op(bc::ALOAD_0);
    a.op(bc::GETFIELD).u2(fx_v);
    a.op(bc::L2I);
    a.op(bc::ALOAD_0);
    a.op(bc::GETFIELD).u2(fx_x);
    a.op(bc::IADD).op(bc::IRETURN);
    let set_get = MethodBuilder::new("setGet")
        .static_method()
        .params(&[BasicType::Object, BasicType::Int, BasicType::Long])
        .max_stack(6)
        .max_locals(4)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();

    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T")
            .super_klass(fx.object_klass())
            .method(set_get),
        pool,
    );
    let mid = method_named(&fx.env, t_kid, "setGet");
    let mut fx = fx;
    let p = fx.new_instance(p_kid);
    let args = [JValue::Obj(Some(p)), JValue::Int(5), JValue::Long(100)];
    assert_eq!(fx.call_int(mid, &args), 105);
    // Second run goes through the quickened fast forms.
    assert_eq!(fx.call_int(mid, &args), 105);

    let t = fx.call_threw(mid, &[JValue::Obj(None), JValue::Int(1), JValue::Long(1)]);
    assert_eq!(t.kind, JavaExKind::NullPointerException);
}

#[test]
fn statics_run_class_initialization_first() {
    let fx = Fixture::new();

    // class S { static int x; static { x = 42; } }
    let mut s_pool = PoolBuilder::new();
    let s_cls = s_pool.class("S");
    let s_x = s_pool.fieldref(s_cls, "x");
    let mut clinit = Asm::new();
    clinit.op(bc::BIPUSH).u1(42);
    clinit.op(bc::PUTSTATIC).u2(s_x);
    clinit.op(bc::RETURN);
    let clinit = MethodBuilder::new("<clinit>")
        .static_method()
        .max_stack(2)
        .code(clinit.finish())
        .build();
    register_class(
        &fx.env,
        KlassBuilder::new("S")
            .super_klass(fx.object_klass())
            .static_field("x", TosState::Itos)
            .method(clinit),
        s_pool,
    );

    let mut t_pool = PoolBuilder::new();
    let s_cls = t_pool.class("S");
    let s_x = t_pool.fieldref(s_cls, "x");
    let mut a = Asm::new();
    a.op(bc::GETSTATIC).u2(s_x);
    a.op(bc::IRETURN);
    let get = MethodBuilder::new("get")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(get),
        t_pool,
    );
    let mid = method_named(&fx.env, t_kid, "get");
    let mut fx = fx;
    assert_eq!(fx.call_int(mid, &[]), 42, "clinit must run before the read");
    assert_eq!(fx.call_int(mid, &[]), 42);
}

#[test]
fn static_mismatch_is_incompatible_class_change() {
    let fx = Fixture::new();
    let p_kid = point_class(&fx);
    let mut pool = PoolBuilder::new();
    let p_cls = pool.class("P");
    let f_x = pool.fieldref(p_cls, "x");
    // getstatic on an instance field.
    let mut a = Asm::new();
    a.op(bc::GETSTATIC).u2(f_x);
    a.op(bc::IRETURN);
    let get = MethodBuilder::new("bad")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(get),
        pool,
    );
    let _ = p_kid;
    let mid = method_named(&fx.env, t_kid, "bad");
    let mut fx = fx;
    let t = fx.call_threw(mid, &[]);
    assert_eq!(t.kind, JavaExKind::IncompatibleClassChangeError);
}

#[test]
fn primitive_arrays_bounds_and_store_semantics() {
    let fx = Fixture::new();
    // int[] a = new int[3]; a[i] = v; return a[i];
    let mut a = Asm::new();
    a.op(bc::ICONST_3);
    a.op(bc::NEWARRAY).u1(10); // T_INT
    a.op(bc::ASTORE_2);
    a.op(bc::ALOAD_2).op(bc::ILOAD_0).op(bc::ILOAD_1).op(bc::IASTORE);
    a.op(bc::ALOAD_2).op(bc::ILOAD_0).op(bc::IALOAD).op(bc::IRETURN);
    let decl = MethodBuilder::new("roundtrip")
        .static_method()
        .params(&[BasicType::Int, BasicType::Int])
        .max_stack(4)
        .max_locals(3)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx2, mid) = single_method_fixture(decl);
    let _ = fx;
    assert_eq!(fx2.call_int(mid, &[JValue::Int(2), JValue::Int(-7)]), -7);

    let t = fx2.call_threw(mid, &[JValue::Int(-1), JValue::Int(0)]);
    assert_eq!(t.kind, JavaExKind::ArrayIndexOutOfBoundsException);
    assert_eq!(
        t.message.as_deref(),
        Some("Index -1 out of bounds for length 3"),
        "negative index must not wrap to a huge positive one"
    );
    let t = fx2.call_threw(mid, &[JValue::Int(3), JValue::Int(0)]);
    assert_eq!(
        t.message.as_deref(),
        Some("Index 3 out of bounds for length 3")
    );
}

#[test]
fn negative_array_size_faults() {
    let mut a = Asm::new();
    a.op(bc::ILOAD_0);
    a.op(bc::NEWARRAY).u1(10);
    a.op(bc::ARETURN);
    let decl = MethodBuilder::new("mk")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Object)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    let t = fx.call_threw(mid, &[JValue::Int(-5)]);
    assert_eq!(t.kind, JavaExKind::NegativeArraySizeException);
    assert_eq!(t.message.as_deref(), Some("-5"));
    assert!(fx.call_obj(mid, &[JValue::Int(0)]).is_some());
}

#[test]
fn bastore_masks_only_boolean_arrays() {
    // Store the same value into a boolean[] and a byte[]; only the boolean
    // array masks to {0,1}.
    for (atype, input, expected) in [(4u8, 0x05, 1), (8u8, 0x05, 5), (4u8, 0x04, 0)] {
        let mut a = Asm::new();
        a.op(bc::ICONST_1);
        a.op(bc::NEWARRAY).u1(atype);
        a.op(bc::ASTORE_1);
        a.op(bc::ALOAD_1).op(bc::ICONST_0).op(bc::ILOAD_0).op(bc::BASTORE);
        a.op(bc::ALOAD_1).op(bc::ICONST_0).op(bc::BALOAD).op(bc::IRETURN);
        let decl = MethodBuilder::new("mask")
            .static_method()
            .params(&[BasicType::Int])
            .max_stack(4)
            .max_locals(2)
            .returns(BasicType::Int)
            .code(a.finish())
            .build();
        let (mut fx, mid) = single_method_fixture(decl);
        assert_eq!(fx.call_int(mid, &[JValue::Int(input)]), expected);
    }
}

#[test]
fn aastore_checks_assignability() {
    let fx = Fixture::new();
    let a_kid = register_class(
        &fx.env,
        KlassBuilder::new("A").super_klass(fx.object_klass()),
        PoolBuilder::new(),
    );
    let b_kid = register_class(
        &fx.env,
        KlassBuilder::new("B").super_klass(a_kid),
        PoolBuilder::new(),
    );
    let c_kid = register_class(
        &fx.env,
        KlassBuilder::new("C").super_klass(fx.object_klass()),
        PoolBuilder::new(),
    );

    let mut a = Asm::new();
    a.op(bc::ALOAD_0).op(bc::ICONST_0).op(bc::ALOAD_1).op(bc::AASTORE);
    a.op(bc::ALOAD_0).op(bc::ICONST_0).op(bc::AALOAD).op(bc::ARETURN);
    let decl = MethodBuilder::new("store")
        .static_method()
        .params(&[BasicType::Object, BasicType::Object])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Object)
        .code(a.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(decl),
        PoolBuilder::new(),
    );
    let mid = method_named(&fx.env, t_kid, "store");

    let arr_kid = fx.env.registry.obj_array_klass(a_kid).unwrap();
    let arr = fx.env.allocate_array(arr_kid, 1).unwrap();
    let mut fx = fx;
    let b = fx.new_instance(b_kid);
    let c = fx.new_instance(c_kid);

    assert_eq!(
        fx.call_obj(mid, &[JValue::Obj(Some(arr)), JValue::Obj(Some(b))]),
        Some(b),
        "subtype store succeeds"
    );
    let t = fx.call_threw(mid, &[JValue::Obj(Some(arr)), JValue::Obj(Some(c))]);
    assert_eq!(t.kind, JavaExKind::ArrayStoreException);
    assert_eq!(
        fx.call_obj(mid, &[JValue::Obj(Some(arr)), JValue::Obj(None)]),
        None,
        "null store skips the subtype check"
    );
}

#[test]
fn multianewarray_allocates_nested_arrays() {
    let fx = Fixture::new();
    let int_arr = fx.env.registry.primitive_array_klass(BasicType::Int).unwrap();
    let outer = fx.env.registry.obj_array_klass(int_arr).unwrap();
    let outer_name = fx.env.registry.klass(outer).name.to_string();

    let mut pool = PoolBuilder::new();
    let cls = pool.class(&outer_name);
    let mut a = Asm::new();
    a.op(bc::ICONST_2).op(bc::ICONST_3);
    a.op(bc::MULTIANEWARRAY).u2(cls).u1(2);
    a.op(bc::ARETURN);
    let decl = MethodBuilder::new("mk")
        .static_method()
        .max_stack(4)
        .returns(BasicType::Object)
        .code(a.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(decl),
        pool,
    );
    let mid = method_named(&fx.env, t_kid, "mk");
    let mut fx = fx;
    let arr = fx.call_obj(mid, &[]).unwrap();
    assert_eq!(fx.env.heap.array_length(arr), 2);
    for i in 0..2 {
        let inner =
            ObjRef::from_bits(fx.env.heap.get_word(arr, ARRAY_BASE_OFFSET + i)).unwrap();
        assert_eq!(fx.env.heap.klass_id(inner), int_arr);
        assert_eq!(fx.env.heap.array_length(inner), 3);
    }
}

#[test]
fn checkcast_and_instanceof() {
    let fx = Fixture::new();
    let a_kid = register_class(
        &fx.env,
        KlassBuilder::new("A").super_klass(fx.object_klass()),
        PoolBuilder::new(),
    );
    let b_kid = register_class(
        &fx.env,
        KlassBuilder::new("B").super_klass(a_kid),
        PoolBuilder::new(),
    );

    let mut pool = PoolBuilder::new();
    let a_cls = pool.class("A");
    let mut asm = Asm::new();
    asm.op(bc::ALOAD_0);
    asm.op(bc::CHECKCAST).u2(a_cls);
    asm.op(bc::ARETURN);
    let cast = MethodBuilder::new("cast")
        .static_method()
        .params(&[BasicType::Object])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Object)
        .code(asm.finish())
        .build();
    let mut asm = Asm::new();
    asm.op(bc::ALOAD_0);
    asm.op(bc::INSTANCEOF).u2(a_cls);
    asm.op(bc::IRETURN);
    let is_a = MethodBuilder::new("isA")
        .static_method()
        .params(&[BasicType::Object])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(asm.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T")
            .super_klass(fx.object_klass())
            .method(cast)
            .method(is_a),
        pool,
    );
    let cast = method_named(&fx.env, t_kid, "cast");
    let is_a = method_named(&fx.env, t_kid, "isA");

    let mut fx = fx;
    let b = fx.new_instance(b_kid);
    let plain = fx.new_instance(fx.object_klass());
    assert_eq!(fx.call_obj(cast, &[JValue::Obj(Some(b))]), Some(b));
    assert_eq!(fx.call_obj(cast, &[JValue::Obj(None)]), None, "null always casts");
    let t = fx.call_threw(cast, &[JValue::Obj(Some(plain))]);
    assert_eq!(t.kind, JavaExKind::ClassCastException);
    let msg = t.message.unwrap();
    assert!(msg.contains("java/lang/Object") && msg.contains('A'), "{msg}");

    assert_eq!(fx.call_int(is_a, &[JValue::Obj(Some(b))]), 1);
    assert_eq!(fx.call_int(is_a, &[JValue::Obj(Some(plain))]), 0);
    assert_eq!(fx.call_int(is_a, &[JValue::Obj(None)]), 0);
}

#[test]
fn failed_resolution_is_cached_and_replayed() {
    let fx = Fixture::new();
    let mut pool = PoolBuilder::new();
    let missing = pool.class("Missing");
    let mut asm = Asm::new();
    asm.op(bc::ALOAD_0);
    asm.op(bc::CHECKCAST).u2(missing);
    asm.op(bc::ARETURN);
    let decl = MethodBuilder::new("cast")
        .static_method()
        .params(&[BasicType::Object])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Object)
        .code(asm.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(decl),
        pool,
    );
    let mid = method_named(&fx.env, t_kid, "cast");
    let mut fx = fx;
    let obj = fx.new_instance(fx.object_klass());

    let t = fx.call_threw(mid, &[JValue::Obj(Some(obj))]);
    assert_eq!(t.kind, JavaExKind::NoClassDefFoundError);

    // Registering the class afterwards must not heal the site: the first
    // error is recorded and replayed deterministically.
    register_class(
        &fx.env,
        KlassBuilder::new("Missing").super_klass(fx.object_klass()),
        PoolBuilder::new(),
    );
    let t = fx.call_threw(mid, &[JValue::Obj(Some(obj))]);
    assert_eq!(t.kind, JavaExKind::NoClassDefFoundError);
}

#[test]
fn ldc_constants() {
    let fx = Fixture::new();
    let mut pool = PoolBuilder::new();
    let k_int = pool.integer(123456);
    let k_float = pool.float(1.5);
    let k_long = pool.long(1i64 << 40);
    let k_double = pool.double(2.5);
    let k_str = pool.string("hi");

    let mut asm = Asm::new();
    asm.op(bc::LDC).u1(k_int as u8);
    asm.op(bc::IRETURN);
    let c_int = MethodBuilder::new("cInt")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Int)
        .code(asm.finish())
        .build();

    let mut asm = Asm::new();
    asm.op(bc::LDC_W).u2(k_float);
    asm.op(bc::FRETURN);
    let c_float = MethodBuilder::new("cFloat")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Float)
        .code(asm.finish())
        .build();

    let mut asm = Asm::new();
    asm.op(bc::LDC2_W).u2(k_long);
    asm.op(bc::LRETURN);
    let c_long = MethodBuilder::new("cLong")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Long)
        .code(asm.finish())
        .build();

    let mut asm = Asm::new();
    asm.op(bc::LDC2_W).u2(k_double);
    asm.op(bc::DRETURN);
    let c_double = MethodBuilder::new("cDouble")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Double)
        .code(asm.finish())
        .build();

    let mut asm = Asm::new();
    asm.op(bc::LDC).u1(k_str as u8);
    asm.op(bc::ARETURN);
    let c_str = MethodBuilder::new("cStr")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Object)
        .code(asm.finish())
        .build();

    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T")
            .super_klass(fx.object_klass())
            .method(c_int)
            .method(c_float)
            .method(c_long)
            .method(c_double)
            .method(c_str),
        pool,
    );
    let mut fx = fx;
    assert_eq!(fx.call_int(method_named(&fx.env, t_kid, "cInt"), &[]), 123456);
    assert_eq!(fx.call_float(method_named(&fx.env, t_kid, "cFloat"), &[]), 1.5);
    assert_eq!(fx.call_long(method_named(&fx.env, t_kid, "cLong"), &[]), 1i64 << 40);
    assert_eq!(fx.call_double(method_named(&fx.env, t_kid, "cDouble"), &[]), 2.5);

    let s_mid = method_named(&fx.env, t_kid, "cStr");
    // String ldc was rewritten to fast_aldc at link time.
    assert_eq!(fx.env.registry.method(s_mid).code_byte(0), bc::FAST_ALDC);
    let s1 = fx.call_obj(s_mid, &[]).unwrap();
    let s2 = fx.call_obj(s_mid, &[]).unwrap();
    assert_eq!(s1, s2, "interned literal resolves to one object");
    assert_eq!(fx.env.heap.array_length(s1), 2);
    assert_eq!(fx.env.heap.get_word(s1, ARRAY_BASE_OFFSET), 'h' as u64);
}

#[test]
fn dynamic_constants_cache_and_null_sentinel() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    let fx = Fixture::new();
    let runs = StdArc::new(AtomicU32::new(0));
    let runs2 = runs.clone();

    let mut pool = PoolBuilder::new();
    let k_condy = pool.dynamic(
        TosState::Itos,
        StdArc::new(move || {
            runs2.fetch_add(1, Ordering::Relaxed);
            Ok(JValue::Int(77))
        }),
    );
    let k_null = pool.dynamic(TosState::Atos, StdArc::new(|| Ok(JValue::Obj(None))));

    let mut asm = Asm::new();
    asm.op(bc::LDC).u1(k_condy as u8);
    asm.op(bc::IRETURN);
    let c_int = MethodBuilder::new("condy")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Int)
        .code(asm.finish())
        .build();

    let mut asm = Asm::new();
    asm.op(bc::LDC).u1(k_null as u8);
    asm.op(bc::ARETURN);
    let c_null = MethodBuilder::new("condyNull")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Object)
        .code(asm.finish())
        .build();

    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T")
            .super_klass(fx.object_klass())
            .method(c_int)
            .method(c_null),
        pool,
    );
    let mut fx = fx;
    let condy = method_named(&fx.env, t_kid, "condy");
    assert_eq!(fx.call_int(condy, &[]), 77);
    assert_eq!(fx.call_int(condy, &[]), 77);
    assert_eq!(runs.load(Ordering::Relaxed), 1, "producer runs at most once");

    // A null condy resolves to the sentinel internally but pushes null.
    let condy_null = method_named(&fx.env, t_kid, "condyNull");
    assert_eq!(fx.env.registry.method(condy_null).code_byte(0), bc::FAST_ALDC);
    assert_eq!(fx.call_obj(condy_null, &[]), None);
    assert_eq!(fx.call_obj(condy_null, &[]), None);
}

#[test]
fn new_fast_path_zeroes_and_publishes() {
    let fx = Fixture::new();
    let p_kid = point_class(&fx);
    let mut pool = PoolBuilder::new();
    let p_cls = pool.class("P");
    let mut asm = Asm::new();
    asm.op(bc::NEW).u2(p_cls);
    asm.op(bc::ARETURN);
    let decl = MethodBuilder::new("mk")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Object)
        .code(asm.finish())
        .build();
    let t_kid = register_class(
        &fx.env,
        KlassBuilder::new("T").super_klass(fx.object_klass()).method(decl),
        pool,
    );
    let mid = method_named(&fx.env, t_kid, "mk");
    let mut fx = fx;

    // First allocation resolves and initializes through the slow path, the
    // second takes the TLAB fast path.
    let first = fx.call_obj(mid, &[]).unwrap();
    let second = fx.call_obj(mid, &[]).unwrap();
    assert_ne!(first, second);
    for obj in [first, second] {
        assert_eq!(fx.env.heap.klass_id(obj), p_kid);
        let size = fx.env.registry.klass(p_kid).instance_size_words().unwrap();
        for w in crate::heap::INSTANCE_BASE_OFFSET..size {
            assert_eq!(fx.env.heap.get_word(obj, w), 0, "field word {w} not zeroed");
        }
    }
}

#[test]
fn finalizer_registration_on_constructor_return() {
    let fx = Fixture::new();
    let mut init = Asm::new();
    init.op(bc::RETURN);
    let ctor = MethodBuilder::new("<init>")
        .max_stack(2)
        .max_locals(1)
        .code(init.finish())
        .registers_finalizer()
        .build();
    let f_kid = register_class(
        &fx.env,
        KlassBuilder::new("F")
            .super_klass(fx.object_klass())
            .finalizer()
            .method(ctor),
        PoolBuilder::new(),
    );
    let ctor = method_named(&fx.env, f_kid, "<init>");
    // The rewriter turned the plain return into the finalizer variant.
    assert_eq!(
        fx.env.registry.method(ctor).code_byte(0),
        bc::RETURN_REGISTER_FINALIZER
    );
    let mut fx = fx;
    let obj = fx.new_instance(f_kid);
    fx.call_void(ctor, &[JValue::Obj(Some(obj))]);
    assert_eq!(fx.env.pending_finalizers(), vec![obj]);
}

#[test]
fn arraylength_null_pointer() {
    let mut a = Asm::new();
    a.op(bc::ALOAD_0).op(bc::ARRAYLENGTH).op(bc::IRETURN);
    let decl = MethodBuilder::new("len")
        .static_method()
        .params(&[BasicType::Object])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    let t = fx.call_threw(mid, &[JValue::Obj(None)]);
    assert_eq!(t.kind, JavaExKind::NullPointerException);
}
