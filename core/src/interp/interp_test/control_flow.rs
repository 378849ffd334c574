use super::*;

#[test]
fn conditional_branches_and_loops() {
    // sum = 0; for (i = n; i > 0; i--) sum += i; return sum;
    let mut a = Asm::new();
    let loop_top = a.new_label();
    let done = a.new_label();
    a.op(bc::ICONST_0).op(bc::ISTORE_1);
    a.bind(loop_top);
    a.op(bc::ILOAD_0);
    a.branch(bc::IFLE, done);
    a.op(bc::ILOAD_1).op(bc::ILOAD_0).op(bc::IADD).op(bc::ISTORE_1);
    a.op(bc::IINC).u1(0).u1(0xff); // n -= 1
    a.branch(bc::GOTO, loop_top);
    a.bind(done);
    a.op(bc::ILOAD_1).op(bc::IRETURN);

    let decl = MethodBuilder::new("sum")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(10)]), 55);
    assert_eq!(fx.call_int(mid, &[JValue::Int(0)]), 0);
}

#[test]
fn reference_comparisons() {
    let mut a = Asm::new();
    let ne = a.new_label();
    a.op(bc::ALOAD_0).op(bc::ALOAD_1);
    a.branch(bc::IF_ACMPNE, ne);
    a.op(bc::ICONST_1).op(bc::IRETURN);
    a.bind(ne);
    a.op(bc::ICONST_0).op(bc::IRETURN);
    let decl = MethodBuilder::new("same")
        .static_method()
        .params(&[BasicType::Object, BasicType::Object])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    let obj = fx.new_instance(fx.object_klass());
    let other = fx.new_instance(fx.object_klass());
    assert_eq!(
        fx.call_int(mid, &[JValue::Obj(Some(obj)), JValue::Obj(Some(obj))]),
        1
    );
    assert_eq!(
        fx.call_int(mid, &[JValue::Obj(Some(obj)), JValue::Obj(Some(other))]),
        0
    );
    assert_eq!(
        fx.call_int(mid, &[JValue::Obj(None), JValue::Obj(None)]),
        1
    );
}

#[test]
fn null_branches() {
    let mut a = Asm::new();
    let nonnull = a.new_label();
    a.op(bc::ALOAD_0);
    a.branch(bc::IFNONNULL, nonnull);
    a.op(bc::ICONST_0).op(bc::IRETURN);
    a.bind(nonnull);
    a.op(bc::ICONST_1).op(bc::IRETURN);
    let decl = MethodBuilder::new("nn")
        .static_method()
        .params(&[BasicType::Object])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    let obj = fx.new_instance(fx.object_klass());
    assert_eq!(fx.call_int(mid, &[JValue::Obj(None)]), 0);
    assert_eq!(fx.call_int(mid, &[JValue::Obj(Some(obj))]), 1);
}

fn switch_fixture(build: impl FnOnce(&mut Asm)) -> (Fixture, MethodId) {
    let mut a = Asm::new();
    build(&mut a);
    let decl = MethodBuilder::new("sw")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(4)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    single_method_fixture(decl)
}

/// Emit `return <n>` stubs bound to each label.
fn emit_cases(a: &mut Asm, cases: &[(Label, i32)]) {
    for &(label, value) in cases {
        a.bind(label);
        a.op(bc::BIPUSH).u1(value as u8);
        a.op(bc::IRETURN);
    }
}

#[test]
fn tableswitch_dispatch() {
    let (mut fx, mid) = switch_fixture(|a| {
        let default = a.new_label();
        let c0 = a.new_label();
        let c1 = a.new_label();
        let c2 = a.new_label();
        a.op(bc::ILOAD_0);
        a.tableswitch(default, 5, &[c0, c1, c2]);
        emit_cases(a, &[(default, 99), (c0, 10), (c1, 20), (c2, 30)]);
    });
    assert_eq!(fx.call_int(mid, &[JValue::Int(5)]), 10);
    assert_eq!(fx.call_int(mid, &[JValue::Int(6)]), 20);
    assert_eq!(fx.call_int(mid, &[JValue::Int(7)]), 30);
    assert_eq!(fx.call_int(mid, &[JValue::Int(4)]), 99);
    assert_eq!(fx.call_int(mid, &[JValue::Int(-1)]), 99);
    assert_eq!(fx.call_int(mid, &[JValue::Int(1000)]), 99);
}

#[test]
fn lookupswitch_linear_dispatch() {
    // Three pairs stay under the binary-search threshold.
    let (mut fx, mid) = switch_fixture(|a| {
        let default = a.new_label();
        let c0 = a.new_label();
        let c1 = a.new_label();
        let c2 = a.new_label();
        a.op(bc::ILOAD_0);
        a.lookupswitch(default, &[(0, c0), (5, c1), (9, c2)]);
        emit_cases(a, &[(default, 99), (c0, 10), (c1, 20), (c2, 30)]);
    });
    let method = fx.env.registry.method(mid);
    assert_eq!(method.code_byte(1), bc::FAST_LINEARSWITCH);
    assert_eq!(fx.call_int(mid, &[JValue::Int(0)]), 10);
    assert_eq!(fx.call_int(mid, &[JValue::Int(5)]), 20);
    assert_eq!(fx.call_int(mid, &[JValue::Int(9)]), 30);
    assert_eq!(fx.call_int(mid, &[JValue::Int(4)]), 99);
    assert_eq!(fx.call_int(mid, &[JValue::Int(-1)]), 99);
    assert_eq!(fx.call_int(mid, &[JValue::Int(1000)]), 99);
}

#[test]
fn lookupswitch_binary_dispatch() {
    // Six pairs force the binary-search variant; exercises the tie-break
    // converging on a[i] <= key < a[i+1].
    let keys = [-20, -3, 0, 5, 9, 1000];
    let (mut fx, mid) = switch_fixture(|a| {
        let default = a.new_label();
        let case_labels: Vec<Label> = keys.iter().map(|_| a.new_label()).collect();
        a.op(bc::ILOAD_0);
        let pairs: Vec<(i32, Label)> = keys
            .iter()
            .copied()
            .zip(case_labels.iter().copied())
            .collect();
        a.lookupswitch(default, &pairs);
        let mut cases = vec![(default, 99)];
        for (i, &l) in case_labels.iter().enumerate() {
            cases.push((l, 10 * (i as i32 + 1)));
        }
        emit_cases(a, &cases);
    });
    let method = fx.env.registry.method(mid);
    assert_eq!(method.code_byte(1), bc::FAST_BINARYSWITCH);
    for (i, &k) in keys.iter().enumerate() {
        assert_eq!(fx.call_int(mid, &[JValue::Int(k)]), 10 * (i as i32 + 1));
    }
    for miss in [-21, -2, 4, 8, 10, i32::MAX, i32::MIN] {
        assert_eq!(fx.call_int(mid, &[JValue::Int(miss)]), 99);
    }
}

#[test]
fn jsr_and_ret_round_trip() {
    // jsr pushes a plain bci; the subroutine stores it and rets through it.
    let mut a = Asm::new();
    let sub = a.new_label();
    a.op(bc::ICONST_2).op(bc::ISTORE_1);
    a.branch(bc::JSR, sub);
    a.op(bc::ILOAD_1).op(bc::IRETURN);
    a.bind(sub);
    a.op(bc::ASTORE_0); // return address
    a.op(bc::ILOAD_1).op(bc::ICONST_3).op(bc::IMUL).op(bc::ISTORE_1);
    a.op(bc::RET).u1(0);
    let decl = MethodBuilder::new("jsr")
        .static_method()
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[]), 6);
}

#[test]
fn wide_forms() {
    // wide istore/iload at a 300-slot index plus wide iinc.
    let mut a = Asm::new();
    a.op(bc::ILOAD_0);
    a.op(bc::WIDE).op(bc::ISTORE).u2(300);
    a.op(bc::WIDE).op(bc::IINC).u2(300).u2(7);
    a.op(bc::WIDE).op(bc::ILOAD).u2(300);
    a.op(bc::IRETURN);
    let decl = MethodBuilder::new("wide")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(4)
        .max_locals(301)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(5)]), 12);
}

#[test]
fn goto_w_long_form() {
    let mut a = Asm::new();
    let over = a.new_label();
    let opcode_at = a.here();
    a.op(bc::GOTO_W);
    // 32-bit offset patched by hand: skip the iconst_0/ireturn pair.
    a.u4(0); // placeholder
    a.op(bc::ICONST_0).op(bc::IRETURN);
    a.bind(over);
    a.op(bc::ICONST_1).op(bc::IRETURN);
    let mut code = a.finish();
    let target = code.len() - 2;
    let offset = (target - opcode_at) as i32;
    code[opcode_at + 1..opcode_at + 5].copy_from_slice(&offset.to_be_bytes());
    let decl = MethodBuilder::new("gotow")
        .static_method()
        .max_stack(2)
        .returns(BasicType::Int)
        .code(code)
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[]), 1);
}

#[test]
fn safepoint_poll_runs_handshakes_on_branches() {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc as StdArc;

    let mut a = Asm::new();
    let loop_top = a.new_label();
    let done = a.new_label();
    a.bind(loop_top);
    a.op(bc::ILOAD_0);
    a.branch(bc::IFLE, done);
    a.op(bc::IINC).u1(0).u1(0xff);
    a.branch(bc::GOTO, loop_top);
    a.bind(done);
    a.op(bc::RETURN);
    let decl = MethodBuilder::new("spin")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(2)
        .max_locals(1)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);

    let hits = StdArc::new(AtomicU32::new(0));
    let h = hits.clone();
    fx.env.safepoint.arm(Box::new(move |_| {
        h.fetch_add(1, Ordering::Relaxed);
    }));
    fx.call_void(mid, &[JValue::Int(5)]);
    assert_eq!(hits.load(Ordering::Relaxed), 1, "handshake ran at a poll site");
}
