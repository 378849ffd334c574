use super::*;

fn int_expr(code: Vec<u8>, max_stack: u16) -> i32 {
    let decl = MethodBuilder::new("expr")
        .static_method()
        .max_stack(max_stack)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(code)
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    fx.call_int(mid, &[])
}

#[test]
fn constant_pushes_and_int_arithmetic() {
    let mut a = Asm::new();
    a.op(bc::ICONST_2).op(bc::ICONST_3).op(bc::IADD).op(bc::IRETURN);
    assert_eq!(int_expr(a.finish(), 4), 5);

    let mut a = Asm::new();
    a.op(bc::BIPUSH).u1(0x90); // -112
    a.op(bc::SIPUSH).u2(0x8000u16); // -32768
    a.op(bc::IMUL).op(bc::IRETURN);
    assert_eq!(int_expr(a.finish(), 4), -112 * -32768);
}

#[test]
fn division_by_zero_throws_before_dividing() {
    let mut a = Asm::new();
    a.op(bc::ICONST_1).op(bc::ICONST_0).op(bc::IDIV).op(bc::IRETURN);
    let decl = MethodBuilder::new("div")
        .static_method()
        .max_stack(4)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    let t = fx.call_threw(mid, &[]);
    assert_eq!(t.kind, JavaExKind::ArithmeticException);
    assert_eq!(t.message.as_deref(), Some("/ by zero"));
}

#[test]
fn min_value_division_does_not_trap() {
    // MIN / -1 and MIN % -1 per two's-complement semantics.
    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::ILOAD_1).op(bc::IDIV).op(bc::IRETURN);
    let decl = MethodBuilder::new("div")
        .static_method()
        .params(&[BasicType::Int, BasicType::Int])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(
        fx.call_int(mid, &[JValue::Int(i32::MIN), JValue::Int(-1)]),
        i32::MIN
    );
    assert_eq!(fx.call_int(mid, &[JValue::Int(7), JValue::Int(-2)]), -3);

    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::ILOAD_1).op(bc::IREM).op(bc::IRETURN);
    let decl = MethodBuilder::new("rem")
        .static_method()
        .params(&[BasicType::Int, BasicType::Int])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(i32::MIN), JValue::Int(-1)]), 0);
}

#[test]
fn long_arithmetic_and_lcmp() {
    let mut a = Asm::new();
    a.op(bc::LLOAD_0).op(bc::LLOAD_2).op(bc::LDIV);
    a.op(bc::LLOAD_0).op(bc::LLOAD_2).op(bc::LREM);
    a.op(bc::LADD).op(bc::LRETURN);
    let decl = MethodBuilder::new("divrem")
        .static_method()
        .params(&[BasicType::Long, BasicType::Long])
        .max_stack(8)
        .max_locals(4)
        .returns(BasicType::Long)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(
        fx.call_long(mid, &[JValue::Long(17), JValue::Long(5)]),
        17 / 5 + 17 % 5
    );
    assert_eq!(
        fx.call_long(mid, &[JValue::Long(i64::MIN), JValue::Long(-1)]),
        i64::MIN
    );
    let t = fx.call_threw(mid, &[JValue::Long(1), JValue::Long(0)]);
    assert_eq!(t.kind, JavaExKind::ArithmeticException);
    assert_eq!(t.message.as_deref(), Some("/ by long zero"));

    let mut a = Asm::new();
    a.op(bc::LLOAD_0).op(bc::LLOAD_2).op(bc::LCMP).op(bc::IRETURN);
    let decl = MethodBuilder::new("cmp")
        .static_method()
        .params(&[BasicType::Long, BasicType::Long])
        .max_stack(8)
        .max_locals(4)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Long(1), JValue::Long(2)]), -1);
    assert_eq!(fx.call_int(mid, &[JValue::Long(2), JValue::Long(2)]), 0);
    assert_eq!(fx.call_int(mid, &[JValue::Long(3), JValue::Long(2)]), 1);
}

#[test]
fn shifts_mask_their_count() {
    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::ILOAD_1).op(bc::ISHL).op(bc::IRETURN);
    let decl = MethodBuilder::new("shl")
        .static_method()
        .params(&[BasicType::Int, BasicType::Int])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(1), JValue::Int(33)]), 2);

    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::ILOAD_1).op(bc::IUSHR).op(bc::IRETURN);
    let decl = MethodBuilder::new("ushr")
        .static_method()
        .params(&[BasicType::Int, BasicType::Int])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(-1), JValue::Int(28)]), 0xf);
}

#[test]
fn float_comparison_takes_unordered_result() {
    for (op, nan_result) in [(bc::FCMPL, -1), (bc::FCMPG, 1)] {
        let mut a = Asm::new();
        a.op(bc::FLOAD_0).op(bc::FLOAD_1).op(op).op(bc::IRETURN);
        let decl = MethodBuilder::new("cmp")
            .static_method()
            .params(&[BasicType::Float, BasicType::Float])
            .max_stack(4)
            .max_locals(2)
            .returns(BasicType::Int)
            .code(a.finish())
            .build();
        let (mut fx, mid) = single_method_fixture(decl);
        assert_eq!(
            fx.call_int(mid, &[JValue::Float(f32::NAN), JValue::Float(0.0)]),
            nan_result
        );
        assert_eq!(
            fx.call_int(mid, &[JValue::Float(1.0), JValue::Float(2.0)]),
            -1
        );
        assert_eq!(
            fx.call_int(mid, &[JValue::Float(2.0), JValue::Float(1.0)]),
            1
        );
    }
}

#[test]
fn narrowing_conversions_saturate() {
    let mut a = Asm::new();
    a.op(bc::FLOAD_0).op(bc::F2I).op(bc::IRETURN);
    let decl = MethodBuilder::new("f2i")
        .static_method()
        .params(&[BasicType::Float])
        .max_stack(4)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Float(f32::NAN)]), 0);
    assert_eq!(fx.call_int(mid, &[JValue::Float(1e10)]), i32::MAX);
    assert_eq!(fx.call_int(mid, &[JValue::Float(-1e10)]), i32::MIN);
    assert_eq!(fx.call_int(mid, &[JValue::Float(-2.75)]), -2);

    let mut a = Asm::new();
    a.op(bc::DLOAD_0).op(bc::D2L).op(bc::LRETURN);
    let decl = MethodBuilder::new("d2l")
        .static_method()
        .params(&[BasicType::Double])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Long)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_long(mid, &[JValue::Double(f64::NAN)]), 0);
    assert_eq!(fx.call_long(mid, &[JValue::Double(1e300)]), i64::MAX);
}

#[test]
fn int_truncations_and_widenings() {
    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::I2B).op(bc::IRETURN);
    let decl = MethodBuilder::new("i2b")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(0x181)]), -127);

    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::I2C).op(bc::IRETURN);
    let decl = MethodBuilder::new("i2c")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(-1)]), 0xffff);

    let mut a = Asm::new();
    a.op(bc::ILOAD_0).op(bc::I2L).op(bc::L2D).op(bc::D2F).op(bc::F2L).op(bc::LRETURN);
    let decl = MethodBuilder::new("chain")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(4)
        .max_locals(1)
        .returns(BasicType::Long)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_long(mid, &[JValue::Int(-5)]), -5);
}

#[test]
fn floating_remainder_delegates_to_fmod() {
    let mut a = Asm::new();
    a.op(bc::FLOAD_0).op(bc::FLOAD_1).op(bc::FREM).op(bc::FRETURN);
    let decl = MethodBuilder::new("frem")
        .static_method()
        .params(&[BasicType::Float, BasicType::Float])
        .max_stack(4)
        .max_locals(2)
        .returns(BasicType::Float)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(
        fx.call_float(mid, &[JValue::Float(5.5), JValue::Float(2.0)]),
        1.5
    );

    let mut a = Asm::new();
    a.op(bc::DLOAD_0).op(bc::DLOAD_2).op(bc::DREM).op(bc::DRETURN);
    let decl = MethodBuilder::new("drem")
        .static_method()
        .params(&[BasicType::Double, BasicType::Double])
        .max_stack(8)
        .max_locals(4)
        .returns(BasicType::Double)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(
        fx.call_double(mid, &[JValue::Double(-7.25), JValue::Double(2.0)]),
        -1.25
    );
}

#[test]
fn iinc_and_negation() {
    let mut a = Asm::new();
    a.op(bc::IINC).u1(0).u1(0xfb); // local0 += -5
    a.op(bc::ILOAD_0).op(bc::INEG).op(bc::IRETURN);
    let decl = MethodBuilder::new("inc")
        .static_method()
        .params(&[BasicType::Int])
        .max_stack(2)
        .max_locals(1)
        .returns(BasicType::Int)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_int(mid, &[JValue::Int(3)]), 2);
}

#[test]
fn stack_shuffles_preserve_values() {
    // dup2_x1 on (1, 2L): ..., v1, {v2} -> keeps long pair intact.
    let mut a = Asm::new();
    a.op(bc::ICONST_1);
    a.op(bc::LCONST_1);
    a.op(bc::DUP2_X1); // 1L, 1, 1L
    a.op(bc::POP2); // drop the upper long
    a.op(bc::POP); // drop the int
    a.op(bc::LRETURN);
    let decl = MethodBuilder::new("shuffle")
        .static_method()
        .max_stack(8)
        .returns(BasicType::Long)
        .code(a.finish())
        .build();
    let (mut fx, mid) = single_method_fixture(decl);
    assert_eq!(fx.call_long(mid, &[]), 1);

    let mut a = Asm::new();
    a.op(bc::ICONST_1).op(bc::ICONST_2).op(bc::SWAP).op(bc::ISUB).op(bc::IRETURN);
    assert_eq!(int_expr(a.finish(), 4), 1); // 2 - 1 after swap
}
