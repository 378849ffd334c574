//! The template table: one handler per bytecode, transforming the operand
//! stack and advancing the bytecode pointer.
//!
//! Handlers run to completion; every slow-path call is bracketed by the
//! decache/recache discipline so a walker sees a consistent frame. Taken
//! branches and returns are the cooperative safepoint poll sites.

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::heap::{
    barrier, extend_for_load, mark, truncate_for_store, ARRAY_BASE_OFFSET,
    INSTANCE_BASE_OFFSET, MARK_OFFSET,
};
use crate::interp::bytecodes as bc;
use crate::interp::frame::{self, Frame, MonitorRecord};
use crate::interp::osr::OsrBuffer;
use crate::interp::JavaThread;
use crate::meta::{ConstantPool, KlassKind, Method, Tag};
use crate::rt::{BcResult, ExecSignal, JavaExKind, JavaThrowable, JvmtiEvent, VmEnv};
use crate::value::{bits_int, int_bits, BasicType, JValue, MethodId, ObjRef, TosState};

use super::fields::{self, null_check};
use super::invoke;
use super::math;
use super::quicken::{self, RewriteControl};
use super::{clear_last_sp, decache, lock_object, unlock_object};

enum BranchOutcome {
    Continue(usize),
    OsrReturn(Option<JValue>),
}

/// How the dispatch loop left the activation: a bytecode return unwinds
/// normally, an OSR transfer leaves a dead frame whose monitors moved into
/// the compiler's buffer.
pub(super) enum InterpExit {
    Return(Option<JValue>),
    Osr(Option<JValue>),
}

pub(super) fn interpret(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    sp0: usize,
) -> BcResult<InterpExit> {
    let pool = env.registry.pool(method.pool);
    let lb = f.locals_base(&thread.stack);
    let mut bci: usize = 0;
    let mut sp: usize = sp0;
    let mut opcode_override: Option<u8> = None;

    loop {
        debug_assert!(sp > thread.stack.limit(), "expression stack overran the arena");
        let opcode = match opcode_override.take() {
            Some(op) => op,
            None => method.code_byte(bci),
        };

        match opcode {
            bc::NOP => bci += 1,

            // Constant pushes.
            bc::ACONST_NULL => {
                frame::push_obj(&mut thread.stack, &mut sp, None);
                bci += 1;
            }
            bc::ICONST_M1..=bc::ICONST_5 => {
                frame::push_int(&mut thread.stack, &mut sp, opcode as i32 - bc::ICONST_0 as i32);
                bci += 1;
            }
            bc::LCONST_0 | bc::LCONST_1 => {
                frame::push_long(&mut thread.stack, &mut sp, (opcode - bc::LCONST_0) as i64);
                bci += 1;
            }
            bc::FCONST_0 | bc::FCONST_1 | bc::FCONST_2 => {
                frame::push_float(&mut thread.stack, &mut sp, (opcode - bc::FCONST_0) as f32);
                bci += 1;
            }
            bc::DCONST_0 | bc::DCONST_1 => {
                frame::push_double(&mut thread.stack, &mut sp, (opcode - bc::DCONST_0) as f64);
                bci += 1;
            }
            bc::BIPUSH => {
                frame::push_int(&mut thread.stack, &mut sp, method.code_byte(bci + 1) as i8 as i32);
                bci += 2;
            }
            bc::SIPUSH => {
                frame::push_int(&mut thread.stack, &mut sp, method.java_u2(bci + 1) as i16 as i32);
                bci += 3;
            }
            bc::LDC | bc::LDC_W => {
                let (index, incr) = if opcode == bc::LDC {
                    (method.code_byte(bci + 1) as u16, 2)
                } else {
                    (method.java_u2(bci + 1), 3)
                };
                sp = ldc_cat1(env, thread, f, &pool, bci, sp, index)?;
                bci += incr;
            }
            bc::LDC2_W => {
                let index = method.java_u2(bci + 1);
                match pool.tag_at(index) {
                    Tag::Long => {
                        let crate::meta::PoolConstant::Long(v) = pool.constant(index) else {
                            return Err(ExecSignal::Fatal(anyhow!("long tag mismatch")));
                        };
                        frame::push_long(&mut thread.stack, &mut sp, *v);
                    }
                    Tag::Double => {
                        let crate::meta::PoolConstant::Double(v) = pool.constant(index) else {
                            return Err(ExecSignal::Fatal(anyhow!("double tag mismatch")));
                        };
                        frame::push_double(&mut thread.stack, &mut sp, *v);
                    }
                    Tag::Dynamic | Tag::DynamicInError => {
                        decache(thread, f, bci, sp);
                        let v = env.resolve_ldc(&pool, index).map_err(ExecSignal::Throw)?;
                        clear_last_sp(thread, f);
                        match v {
                            JValue::Long(l) => frame::push_long(&mut thread.stack, &mut sp, l),
                            JValue::Double(d) => frame::push_double(&mut thread.stack, &mut sp, d),
                            _ => {
                                return Err(ExecSignal::Fatal(anyhow!(
                                    "category-2 dynamic constant produced a one-slot value"
                                )))
                            }
                        }
                    }
                    other => {
                        return Err(ExecSignal::Fatal(anyhow!("ldc2_w on {other:?} constant")))
                    }
                }
                bci += 3;
            }
            bc::FAST_ALDC | bc::FAST_ALDC_W => {
                let (index, incr) = if opcode == bc::FAST_ALDC {
                    (method.code_byte(bci + 1) as u16, 2)
                } else {
                    (method.native_u2(bci + 1), 3)
                };
                let mut result = pool.resolved_reference_at(index);
                if result.is_none() {
                    decache(thread, f, bci, sp);
                    env.resolve_ldc(&pool, index).map_err(ExecSignal::Throw)?;
                    clear_last_sp(thread, f);
                    result = pool.resolved_reference_at(index);
                }
                // The sentinel marks "resolved, and actually null".
                let result = result.filter(|&o| o != env.the_null_sentinel());
                frame::push_obj(&mut thread.stack, &mut sp, result);
                bci += incr;
            }

            // Local loads.
            bc::ILOAD | bc::NOFAST_ILOAD => {
                if opcode == bc::ILOAD && env.config.rewrite_bytecodes {
                    quicken::quicken_iload(env, method, mid, bci);
                }
                let n = method.code_byte(bci + 1) as usize;
                let v = thread.stack.word(frame::iaddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 2;
            }
            bc::FAST_ILOAD | bc::FLOAD | bc::ALOAD => {
                let n = method.code_byte(bci + 1) as usize;
                let v = thread.stack.word(frame::iaddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 2;
            }
            bc::FAST_ILOAD2 => {
                let n = method.code_byte(bci + 1) as usize;
                let v = thread.stack.word(frame::iaddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                let n2 = method.code_byte(bci + 3) as usize;
                let v2 = thread.stack.word(frame::iaddress(lb, n2));
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                bci += 4;
            }
            bc::LLOAD | bc::DLOAD => {
                let n = method.code_byte(bci + 1) as usize;
                let v = thread.stack.word(frame::laddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, 0);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 2;
            }
            bc::ILOAD_0..=bc::ILOAD_3 => {
                let n = (opcode - bc::ILOAD_0) as usize;
                let v = thread.stack.word(frame::iaddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::FLOAD_0..=bc::FLOAD_3 => {
                let n = (opcode - bc::FLOAD_0) as usize;
                let v = thread.stack.word(frame::faddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::LLOAD_0..=bc::LLOAD_3 => {
                let n = (opcode - bc::LLOAD_0) as usize;
                let v = thread.stack.word(frame::laddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, 0);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::DLOAD_0..=bc::DLOAD_3 => {
                let n = (opcode - bc::DLOAD_0) as usize;
                let v = thread.stack.word(frame::daddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, 0);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::ALOAD_0 | bc::NOFAST_ALOAD_0 | bc::FAST_ALOAD_0 => {
                if opcode == bc::ALOAD_0 && env.config.rewrite_bytecodes {
                    quicken::quicken_aload_0(env, method, mid, bci);
                }
                let v = thread.stack.word(frame::aaddress(lb, 0));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::ALOAD_1..=bc::ALOAD_3 => {
                let n = (opcode - bc::ALOAD_0) as usize;
                let v = thread.stack.word(frame::aaddress(lb, n));
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }

            // Array loads.
            bc::IALOAD | bc::FALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::LALOAD | bc::DALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, 0);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::AALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = barrier::load_heap_oop(
                    &env.heap,
                    arr,
                    ARRAY_BASE_OFFSET + index as usize,
                    barrier::IN_HEAP | barrier::IS_ARRAY,
                );
                frame::push_obj(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::BALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, extend_for_load(TosState::Btos, v));
                bci += 1;
            }
            bc::CALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, extend_for_load(TosState::Ctos, v));
                bci += 1;
            }
            bc::SALOAD => {
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, extend_for_load(TosState::Stos, v));
                bci += 1;
            }
            bc::FAST_ICALOAD => {
                let n = method.code_byte(bci + 1) as usize;
                let index = bits_int(thread.stack.word(frame::iaddress(lb, n)));
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let v = env.heap.get_word(arr, ARRAY_BASE_OFFSET + index as usize);
                frame::push_raw(&mut thread.stack, &mut sp, extend_for_load(TosState::Ctos, v));
                bci += 3;
            }

            // Local stores.
            bc::ISTORE | bc::FSTORE | bc::ASTORE => {
                let n = method.code_byte(bci + 1) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::iaddress(lb, n), v);
                bci += 2;
            }
            bc::LSTORE | bc::DSTORE => {
                let n = method.code_byte(bci + 1) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                let _ = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::laddress(lb, n), v);
                bci += 2;
            }
            bc::ISTORE_0..=bc::ISTORE_3 => {
                let n = (opcode - bc::ISTORE_0) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::iaddress(lb, n), v);
                bci += 1;
            }
            bc::FSTORE_0..=bc::FSTORE_3 => {
                let n = (opcode - bc::FSTORE_0) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::faddress(lb, n), v);
                bci += 1;
            }
            bc::ASTORE_0..=bc::ASTORE_3 => {
                let n = (opcode - bc::ASTORE_0) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::aaddress(lb, n), v);
                bci += 1;
            }
            bc::LSTORE_0..=bc::LSTORE_3 => {
                let n = (opcode - bc::LSTORE_0) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                let _ = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::laddress(lb, n), v);
                bci += 1;
            }
            bc::DSTORE_0..=bc::DSTORE_3 => {
                let n = (opcode - bc::DSTORE_0) as usize;
                let v = frame::pop_raw(&thread.stack, &mut sp);
                let _ = frame::pop_raw(&thread.stack, &mut sp);
                thread.stack.set_word(frame::daddress(lb, n), v);
                bci += 1;
            }

            // Array stores.
            bc::IASTORE | bc::FASTORE => {
                let v = frame::pop_raw(&thread.stack, &mut sp);
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                env.heap.put_word(arr, ARRAY_BASE_OFFSET + index as usize, v);
                bci += 1;
            }
            bc::LASTORE | bc::DASTORE => {
                let v = frame::pop_raw(&thread.stack, &mut sp);
                let _ = frame::pop_raw(&thread.stack, &mut sp);
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                env.heap.put_word(arr, ARRAY_BASE_OFFSET + index as usize, v);
                bci += 1;
            }
            bc::AASTORE => {
                let value = frame::pop_obj(&thread.stack, &mut sp);
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                let mut decorators = barrier::IN_HEAP | barrier::IS_ARRAY;
                if let Some(v) = value {
                    // Assignability of the stored value against the array's
                    // element class; must not allocate.
                    let value_kid = env.heap.klass_id(v);
                    let arr_klass = env.registry.klass(env.heap.klass_id(arr));
                    let KlassKind::ObjArray { elem_klass } = arr_klass.kind else {
                        return Err(ExecSignal::Throw(JavaThrowable::bare(
                            JavaExKind::ArrayStoreException,
                        )));
                    };
                    if value_kid != elem_klass
                        && !env.registry.is_subtype_of(value_kid, elem_klass)
                    {
                        return Err(ExecSignal::Throw(JavaThrowable::bare(
                            JavaExKind::ArrayStoreException,
                        )));
                    }
                } else {
                    decorators |= barrier::STORING_NULL;
                }
                barrier::store_heap_oop(
                    &env.heap,
                    arr,
                    ARRAY_BASE_OFFSET + index as usize,
                    value,
                    decorators,
                );
                bci += 1;
            }
            bc::BASTORE => {
                let mut v = frame::pop_int(&thread.stack, &mut sp);
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                // Boolean and byte arrays share this bytecode; the array's
                // actual element kind decides the 0/1 masking.
                if env.registry.klass(env.heap.klass_id(arr)).is_boolean_array() {
                    v &= 1;
                }
                env.heap.put_word(
                    arr,
                    ARRAY_BASE_OFFSET + index as usize,
                    truncate_for_store(TosState::Btos, int_bits(v)),
                );
                bci += 1;
            }
            bc::CASTORE | bc::SASTORE => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                let index = frame::pop_int(&thread.stack, &mut sp);
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                bounds_check(env, arr, index)?;
                env.heap.put_word(
                    arr,
                    ARRAY_BASE_OFFSET + index as usize,
                    truncate_for_store(TosState::Ctos, int_bits(v)),
                );
                bci += 1;
            }

            // Stack shuffles.
            bc::POP => {
                sp += 1;
                bci += 1;
            }
            bc::POP2 => {
                sp += 2;
                bci += 1;
            }
            bc::DUP => {
                let v = frame::raw_at(&thread.stack, sp, 0);
                frame::push_raw(&mut thread.stack, &mut sp, v);
                bci += 1;
            }
            bc::DUP_X1 => {
                let v1 = frame::pop_raw(&thread.stack, &mut sp);
                let v2 = frame::pop_raw(&thread.stack, &mut sp);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                bci += 1;
            }
            bc::DUP_X2 => {
                let v1 = frame::pop_raw(&thread.stack, &mut sp);
                let v2 = frame::pop_raw(&thread.stack, &mut sp);
                let v3 = frame::pop_raw(&thread.stack, &mut sp);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                frame::push_raw(&mut thread.stack, &mut sp, v3);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                bci += 1;
            }
            bc::DUP2 => {
                let v1 = frame::raw_at(&thread.stack, sp, 0);
                let v2 = frame::raw_at(&thread.stack, sp, 1);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                bci += 1;
            }
            bc::DUP2_X1 => {
                let v1 = frame::pop_raw(&thread.stack, &mut sp);
                let v2 = frame::pop_raw(&thread.stack, &mut sp);
                let v3 = frame::pop_raw(&thread.stack, &mut sp);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                frame::push_raw(&mut thread.stack, &mut sp, v3);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                bci += 1;
            }
            bc::DUP2_X2 => {
                let v1 = frame::pop_raw(&thread.stack, &mut sp);
                let v2 = frame::pop_raw(&thread.stack, &mut sp);
                let v3 = frame::pop_raw(&thread.stack, &mut sp);
                let v4 = frame::pop_raw(&thread.stack, &mut sp);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                frame::push_raw(&mut thread.stack, &mut sp, v4);
                frame::push_raw(&mut thread.stack, &mut sp, v3);
                frame::push_raw(&mut thread.stack, &mut sp, v2);
                frame::push_raw(&mut thread.stack, &mut sp, v1);
                bci += 1;
            }
            bc::SWAP => {
                let v1 = frame::raw_at(&thread.stack, sp, 0);
                let v2 = frame::raw_at(&thread.stack, sp, 1);
                frame::set_raw_at(&mut thread.stack, sp, 0, v2);
                frame::set_raw_at(&mut thread.stack, sp, 1, v1);
                bci += 1;
            }

            // Integer/long binary arithmetic.
            bc::IADD | bc::ISUB | bc::IMUL | bc::IAND | bc::IOR | bc::IXOR => {
                let b = frame::pop_int(&thread.stack, &mut sp);
                let a = frame::pop_int(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::IADD => a.wrapping_add(b),
                    bc::ISUB => a.wrapping_sub(b),
                    bc::IMUL => a.wrapping_mul(b),
                    bc::IAND => a & b,
                    bc::IOR => a | b,
                    _ => a ^ b,
                };
                frame::push_int(&mut thread.stack, &mut sp, r);
                bci += 1;
            }
            bc::IDIV | bc::IREM => {
                let b = frame::pop_int(&thread.stack, &mut sp);
                let a = frame::pop_int(&thread.stack, &mut sp);
                let r = if opcode == bc::IDIV {
                    math::idiv(a, b)
                } else {
                    math::irem(a, b)
                }
                .map_err(ExecSignal::Throw)?;
                frame::push_int(&mut thread.stack, &mut sp, r);
                bci += 1;
            }
            bc::LADD | bc::LSUB | bc::LMUL | bc::LAND | bc::LOR | bc::LXOR => {
                let b = frame::pop_long(&thread.stack, &mut sp);
                let a = frame::pop_long(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::LADD => a.wrapping_add(b),
                    bc::LSUB => a.wrapping_sub(b),
                    bc::LMUL => a.wrapping_mul(b),
                    bc::LAND => a & b,
                    bc::LOR => a | b,
                    _ => a ^ b,
                };
                frame::push_long(&mut thread.stack, &mut sp, r);
                bci += 1;
            }
            bc::LDIV | bc::LREM => {
                let b = frame::pop_long(&thread.stack, &mut sp);
                let a = frame::pop_long(&thread.stack, &mut sp);
                let r = if opcode == bc::LDIV {
                    math::ldiv(a, b)
                } else {
                    math::lrem(a, b)
                }
                .map_err(ExecSignal::Throw)?;
                frame::push_long(&mut thread.stack, &mut sp, r);
                bci += 1;
            }

            // Float/double arithmetic; remainder delegates to the fmod leaf.
            bc::FADD | bc::FSUB | bc::FMUL | bc::FDIV | bc::FREM => {
                let b = frame::pop_float(&thread.stack, &mut sp);
                let a = frame::pop_float(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::FADD => a + b,
                    bc::FSUB => a - b,
                    bc::FMUL => a * b,
                    bc::FDIV => a / b,
                    _ => math::frem(a, b),
                };
                frame::push_float(&mut thread.stack, &mut sp, r);
                bci += 1;
            }
            bc::DADD | bc::DSUB | bc::DMUL | bc::DDIV | bc::DREM => {
                let b = frame::pop_double(&thread.stack, &mut sp);
                let a = frame::pop_double(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::DADD => a + b,
                    bc::DSUB => a - b,
                    bc::DMUL => a * b,
                    bc::DDIV => a / b,
                    _ => math::drem(a, b),
                };
                frame::push_double(&mut thread.stack, &mut sp, r);
                bci += 1;
            }

            bc::INEG => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, v.wrapping_neg());
                bci += 1;
            }
            bc::LNEG => {
                let v = frame::pop_long(&thread.stack, &mut sp);
                frame::push_long(&mut thread.stack, &mut sp, v.wrapping_neg());
                bci += 1;
            }
            bc::FNEG => {
                let v = frame::pop_float(&thread.stack, &mut sp);
                frame::push_float(&mut thread.stack, &mut sp, -v);
                bci += 1;
            }
            bc::DNEG => {
                let v = frame::pop_double(&thread.stack, &mut sp);
                frame::push_double(&mut thread.stack, &mut sp, -v);
                bci += 1;
            }

            // Shifts mask the count to the value width.
            bc::ISHL | bc::ISHR | bc::IUSHR => {
                let s = frame::pop_int(&thread.stack, &mut sp) & 0x1f;
                let a = frame::pop_int(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::ISHL => a.wrapping_shl(s as u32),
                    bc::ISHR => a.wrapping_shr(s as u32),
                    _ => ((a as u32) >> s) as i32,
                };
                frame::push_int(&mut thread.stack, &mut sp, r);
                bci += 1;
            }
            bc::LSHL | bc::LSHR | bc::LUSHR => {
                let s = frame::pop_int(&thread.stack, &mut sp) & 0x3f;
                let a = frame::pop_long(&thread.stack, &mut sp);
                let r = match opcode {
                    bc::LSHL => a.wrapping_shl(s as u32),
                    bc::LSHR => a.wrapping_shr(s as u32),
                    _ => ((a as u64) >> s) as i64,
                };
                frame::push_long(&mut thread.stack, &mut sp, r);
                bci += 1;
            }

            bc::IINC => {
                let n = method.code_byte(bci + 1) as usize;
                let delta = method.code_byte(bci + 2) as i8 as i32;
                let idx = frame::iaddress(lb, n);
                let v = bits_int(thread.stack.word(idx)).wrapping_add(delta);
                thread.stack.set_word(idx, int_bits(v));
                bci += 3;
            }

            // Conversions.
            bc::I2L => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_long(&mut thread.stack, &mut sp, v as i64);
                bci += 1;
            }
            bc::I2F => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_float(&mut thread.stack, &mut sp, v as f32);
                bci += 1;
            }
            bc::I2D => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_double(&mut thread.stack, &mut sp, v as f64);
                bci += 1;
            }
            bc::L2I => {
                let v = frame::pop_long(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, v as i32);
                bci += 1;
            }
            bc::L2F => {
                let v = frame::pop_long(&thread.stack, &mut sp);
                frame::push_float(&mut thread.stack, &mut sp, v as f32);
                bci += 1;
            }
            bc::L2D => {
                let v = frame::pop_long(&thread.stack, &mut sp);
                frame::push_double(&mut thread.stack, &mut sp, v as f64);
                bci += 1;
            }
            bc::F2I => {
                let v = frame::pop_float(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, math::f2i(v));
                bci += 1;
            }
            bc::F2L => {
                let v = frame::pop_float(&thread.stack, &mut sp);
                frame::push_long(&mut thread.stack, &mut sp, math::f2l(v));
                bci += 1;
            }
            bc::F2D => {
                let v = frame::pop_float(&thread.stack, &mut sp);
                frame::push_double(&mut thread.stack, &mut sp, v as f64);
                bci += 1;
            }
            bc::D2I => {
                let v = frame::pop_double(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, math::d2i(v));
                bci += 1;
            }
            bc::D2L => {
                let v = frame::pop_double(&thread.stack, &mut sp);
                frame::push_long(&mut thread.stack, &mut sp, math::d2l(v));
                bci += 1;
            }
            bc::D2F => {
                let v = frame::pop_double(&thread.stack, &mut sp);
                frame::push_float(&mut thread.stack, &mut sp, v as f32);
                bci += 1;
            }
            bc::I2B => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, v as i8 as i32);
                bci += 1;
            }
            bc::I2C => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, v as u16 as i32);
                bci += 1;
            }
            bc::I2S => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, v as i16 as i32);
                bci += 1;
            }

            // Comparisons.
            bc::LCMP => {
                let b = frame::pop_long(&thread.stack, &mut sp);
                let a = frame::pop_long(&thread.stack, &mut sp);
                frame::push_int(&mut thread.stack, &mut sp, math::lcmp(a, b));
                bci += 1;
            }
            bc::FCMPL | bc::FCMPG => {
                let b = frame::pop_float(&thread.stack, &mut sp);
                let a = frame::pop_float(&thread.stack, &mut sp);
                let unordered = if opcode == bc::FCMPL { -1 } else { 1 };
                frame::push_int(&mut thread.stack, &mut sp, math::fcmp(a, b, unordered));
                bci += 1;
            }
            bc::DCMPL | bc::DCMPG => {
                let b = frame::pop_double(&thread.stack, &mut sp);
                let a = frame::pop_double(&thread.stack, &mut sp);
                let unordered = if opcode == bc::DCMPL { -1 } else { 1 };
                frame::push_int(&mut thread.stack, &mut sp, math::dcmp(a, b, unordered));
                bci += 1;
            }

            // Conditional branches.
            bc::IFEQ..=bc::IFLE => {
                let v = frame::pop_int(&thread.stack, &mut sp);
                let taken = match opcode {
                    bc::IFEQ => v == 0,
                    bc::IFNE => v != 0,
                    bc::IFLT => v < 0,
                    bc::IFGE => v >= 0,
                    bc::IFGT => v > 0,
                    _ => v <= 0,
                };
                match conditional(env, thread, f, mid, method, bci, sp, taken, 3)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::IF_ICMPEQ..=bc::IF_ICMPLE => {
                let b = frame::pop_int(&thread.stack, &mut sp);
                let a = frame::pop_int(&thread.stack, &mut sp);
                let taken = match opcode {
                    bc::IF_ICMPEQ => a == b,
                    bc::IF_ICMPNE => a != b,
                    bc::IF_ICMPLT => a < b,
                    bc::IF_ICMPGE => a >= b,
                    bc::IF_ICMPGT => a > b,
                    _ => a <= b,
                };
                match conditional(env, thread, f, mid, method, bci, sp, taken, 3)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::IF_ACMPEQ | bc::IF_ACMPNE => {
                let b = frame::pop_obj(&thread.stack, &mut sp);
                let a = frame::pop_obj(&thread.stack, &mut sp);
                let taken = (a == b) == (opcode == bc::IF_ACMPEQ);
                match conditional(env, thread, f, mid, method, bci, sp, taken, 3)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::IFNULL | bc::IFNONNULL => {
                let v = frame::pop_obj(&thread.stack, &mut sp);
                let taken = v.is_none() == (opcode == bc::IFNULL);
                match conditional(env, thread, f, mid, method, bci, sp, taken, 3)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::GOTO => {
                let offset = method.java_u2(bci + 1) as i16 as isize;
                let target = (bci as isize + offset) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::GOTO_W => {
                let offset = method.java_u4(bci + 1) as i32 as isize;
                let target = (bci as isize + offset) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::JSR | bc::JSR_W => {
                // The return address is a bci relative to the code base, a
                // plain integer that survives frame migration.
                let (offset, len) = if opcode == bc::JSR {
                    (method.java_u2(bci + 1) as i16 as isize, 3usize)
                } else {
                    (method.java_u4(bci + 1) as i32 as isize, 5usize)
                };
                frame::push_int(&mut thread.stack, &mut sp, (bci + len) as i32);
                let target = (bci as isize + offset) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::RET => {
                let n = method.code_byte(bci + 1) as usize;
                bci = bits_int(thread.stack.word(frame::iaddress(lb, n))) as usize;
                safepoint_poll(thread, f, bci, sp);
            }

            bc::TABLESWITCH => {
                let key = frame::pop_int(&thread.stack, &mut sp);
                let aligned = bc::align_up4(bci + 1);
                let default = method.java_u4(aligned) as i32;
                let low = method.java_u4(aligned + 4) as i32;
                let high = method.java_u4(aligned + 8) as i32;
                let skip = if key < low || key > high {
                    default
                } else {
                    method.java_u4(aligned + 12 + 4 * (key - low) as usize) as i32
                };
                let target = (bci as isize + skip as isize) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::LOOKUPSWITCH | bc::FAST_LINEARSWITCH => {
                let key = frame::pop_int(&thread.stack, &mut sp);
                let aligned = bc::align_up4(bci + 1);
                let default = method.java_u4(aligned) as i32;
                let npairs = method.java_u4(aligned + 4) as usize;
                let mut skip = default;
                for i in 0..npairs {
                    if method.java_u4(aligned + 8 + 8 * i) as i32 == key {
                        skip = method.java_u4(aligned + 12 + 8 * i) as i32;
                        break;
                    }
                }
                let target = (bci as isize + skip as isize) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }
            bc::FAST_BINARYSWITCH => {
                let key = frame::pop_int(&thread.stack, &mut sp);
                let aligned = bc::align_up4(bci + 1);
                let default = method.java_u4(aligned) as i32;
                let npairs = method.java_u4(aligned + 4) as i32;
                let pair_match = |h: i32| method.java_u4(aligned + 8 + 8 * h as usize) as i32;
                let pair_offset = |h: i32| method.java_u4(aligned + 12 + 8 * h as usize) as i32;
                // Binary search converging on i with a[i] <= key < a[i+1].
                let mut i = 0i32;
                let mut j = npairs;
                while i + 1 < j {
                    let h = (i + j) >> 1;
                    if key < pair_match(h) {
                        j = h;
                    } else {
                        i = h;
                    }
                }
                let skip = if npairs > 0 && pair_match(i) == key {
                    pair_offset(i)
                } else {
                    default
                };
                let target = (bci as isize + skip as isize) as usize;
                match branch_to(env, thread, f, mid, method, bci, target, sp)? {
                    BranchOutcome::Continue(next) => bci = next,
                    BranchOutcome::OsrReturn(v) => return Ok(InterpExit::Osr(v)),
                }
            }

            // Returns. Narrow sub-int results here so already-compiled
            // callers see pre-narrowed values.
            bc::IRETURN => {
                safepoint_poll(thread, f, bci, sp);
                let v = frame::pop_int(&thread.stack, &mut sp);
                return Ok(InterpExit::Return(Some(JValue::Int(narrow_int(
                    v,
                    method.return_type,
                )))));
            }
            bc::LRETURN => {
                safepoint_poll(thread, f, bci, sp);
                let v = frame::pop_long(&thread.stack, &mut sp);
                return Ok(InterpExit::Return(Some(JValue::Long(v))));
            }
            bc::FRETURN => {
                safepoint_poll(thread, f, bci, sp);
                let v = frame::pop_float(&thread.stack, &mut sp);
                return Ok(InterpExit::Return(Some(JValue::Float(v))));
            }
            bc::DRETURN => {
                safepoint_poll(thread, f, bci, sp);
                let v = frame::pop_double(&thread.stack, &mut sp);
                return Ok(InterpExit::Return(Some(JValue::Double(v))));
            }
            bc::ARETURN => {
                safepoint_poll(thread, f, bci, sp);
                let v = frame::pop_obj(&thread.stack, &mut sp);
                return Ok(InterpExit::Return(Some(JValue::Obj(v))));
            }
            bc::RETURN => {
                // A constructor's stores must be visible before the object
                // escapes through the caller.
                fence(Ordering::Release);
                safepoint_poll(thread, f, bci, sp);
                return Ok(InterpExit::Return(None));
            }
            bc::RETURN_REGISTER_FINALIZER => {
                let recv = ObjRef::from_bits(thread.stack.word(frame::aaddress(lb, 0)));
                if let Some(obj) = recv {
                    if env.registry.klass(env.heap.klass_id(obj)).has_finalizer() {
                        decache(thread, f, bci, sp);
                        env.register_finalizer(obj);
                        clear_last_sp(thread, f);
                    }
                }
                fence(Ordering::Release);
                safepoint_poll(thread, f, bci, sp);
                return Ok(InterpExit::Return(None));
            }

            // Field access.
            bc::GETFIELD | bc::GETSTATIC => {
                (bci, sp) = fields::getfield_or_static(
                    env, thread, f, mid, method, &pool, bci, sp, opcode,
                    RewriteControl::MayRewrite,
                )?;
            }
            bc::NOFAST_GETFIELD => {
                (bci, sp) = fields::getfield_or_static(
                    env, thread, f, mid, method, &pool, bci, sp, opcode,
                    RewriteControl::MayNotRewrite,
                )?;
            }
            bc::PUTFIELD | bc::PUTSTATIC => {
                (bci, sp) = fields::putfield_or_static(
                    env, thread, f, mid, method, &pool, bci, sp, opcode,
                    RewriteControl::MayRewrite,
                )?;
            }
            bc::NOFAST_PUTFIELD => {
                (bci, sp) = fields::putfield_or_static(
                    env, thread, f, mid, method, &pool, bci, sp, opcode,
                    RewriteControl::MayNotRewrite,
                )?;
            }
            bc::FAST_AGETFIELD..=bc::FAST_SGETFIELD => {
                (bci, sp) = fields::fast_accessfield(env, thread, f, mid, method, &pool, bci, sp)?;
            }
            bc::FAST_APUTFIELD..=bc::FAST_SPUTFIELD => {
                (bci, sp) = fields::fast_storefield(env, thread, f, mid, method, &pool, bci, sp)?;
            }
            bc::FAST_IACCESS_0 | bc::FAST_AACCESS_0 | bc::FAST_FACCESS_0 => {
                (bci, sp) = fields::fast_xaccess(env, thread, f, method, &pool, bci, sp)?;
            }

            // Invocations.
            bc::INVOKEVIRTUAL
            | bc::INVOKESPECIAL
            | bc::INVOKESTATIC
            | bc::INVOKEINTERFACE
            | bc::INVOKEDYNAMIC
            | bc::INVOKEHANDLE
            | bc::FAST_INVOKEVFINAL => {
                (bci, sp) = invoke::do_invoke(
                    env, thread, f, mid, method, &pool, bci, sp, opcode,
                    RewriteControl::MayRewrite,
                )?;
            }

            // Allocation.
            bc::NEW => {
                let index = method.java_u2(bci + 1);
                let mut allocated = None;
                // Fast path: resolved class, fully initialized, trivial
                // layout, TLAB has room.
                if env.config.use_tlab && pool.tag_at(index) == Tag::Class {
                    let kid = pool
                        .resolved_klass_at(index)
                        .expect("resolved tag implies klass slot");
                    let klass = env.registry.klass(kid);
                    if klass.is_initialized() && klass.is_fastpath_allocatable() {
                        let size = klass.instance_size_words().expect("instance klass");
                        if let Some(start) = thread.tlab.allocate(size) {
                            if !env.config.zero_tlab {
                                for w in INSTANCE_BASE_OFFSET..size {
                                    env.heap.put_arena_word(start + w, 0);
                                }
                            }
                            let obj = ObjRef::from_index(start);
                            env.heap.put_word(obj, MARK_OFFSET, mark::prototype());
                            // Klass goes in last; then nothing may reorder
                            // the initializing stores past the publication.
                            env.heap.set_klass_release(obj, kid);
                            fence(Ordering::Release);
                            allocated = Some(obj);
                        }
                    }
                }
                let obj = match allocated {
                    Some(obj) => obj,
                    None => {
                        decache(thread, f, bci, sp);
                        let obj = env
                            .instr_new_slow(thread, &pool, index)
                            .map_err(ExecSignal::Throw)?;
                        clear_last_sp(thread, f);
                        fence(Ordering::Release);
                        obj
                    }
                };
                frame::push_obj(&mut thread.stack, &mut sp, Some(obj));
                bci += 3;
            }
            bc::NEWARRAY => {
                let ty = method.code_byte(bci + 1);
                let length = frame::pop_int(&thread.stack, &mut sp);
                let elem = BasicType::from_newarray_code(ty)
                    .ok_or_else(|| anyhow!("newarray type operand {ty}"))?;
                decache(thread, f, bci, sp);
                let arr = env.newarray(elem, length).map_err(ExecSignal::Throw)?;
                clear_last_sp(thread, f);
                frame::push_obj(&mut thread.stack, &mut sp, Some(arr));
                bci += 2;
            }
            bc::ANEWARRAY => {
                let index = method.java_u2(bci + 1);
                let length = frame::pop_int(&thread.stack, &mut sp);
                decache(thread, f, bci, sp);
                let arr = env
                    .anewarray(&pool, index, length)
                    .map_err(ExecSignal::Throw)?;
                clear_last_sp(thread, f);
                frame::push_obj(&mut thread.stack, &mut sp, Some(arr));
                bci += 3;
            }
            bc::MULTIANEWARRAY => {
                let index = method.java_u2(bci + 1);
                let rank = method.code_byte(bci + 3) as usize;
                let mut dims = vec![0i32; rank];
                for slot in (0..rank).rev() {
                    dims[slot] = frame::pop_int(&thread.stack, &mut sp);
                }
                decache(thread, f, bci, sp);
                let arr = env
                    .multianewarray(&pool, index, &dims)
                    .map_err(ExecSignal::Throw)?;
                clear_last_sp(thread, f);
                frame::push_obj(&mut thread.stack, &mut sp, Some(arr));
                bci += 4;
            }
            bc::ARRAYLENGTH => {
                let arr = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                frame::push_int(&mut thread.stack, &mut sp, env.heap.array_length(arr));
                bci += 1;
            }

            bc::ATHROW => {
                let obj = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                decache(thread, f, bci, sp);
                return Err(ExecSignal::Throw(JavaThrowable::thrown(obj)));
            }

            bc::CHECKCAST => {
                let obj = ObjRef::from_bits(frame::raw_at(&thread.stack, sp, 0));
                if let Some(o) = obj {
                    let kid = resolve_cast_klass(env, thread, f, &pool, bci, sp, method)?;
                    let okid = env.heap.klass_id(o);
                    if okid != kid && !env.registry.is_subtype_of(okid, kid) {
                        let message = format!(
                            "class {} cannot be cast to class {}",
                            env.registry.klass(okid).name,
                            env.registry.klass(kid).name
                        );
                        return Err(ExecSignal::Throw(JavaThrowable::new(
                            JavaExKind::ClassCastException,
                            message,
                        )));
                    }
                }
                bci += 3;
            }
            bc::INSTANCEOF => {
                let obj = frame::pop_obj(&thread.stack, &mut sp);
                let result = match obj {
                    None => 0,
                    Some(o) => {
                        let kid = resolve_cast_klass(env, thread, f, &pool, bci, sp, method)?;
                        let okid = env.heap.klass_id(o);
                        (okid == kid || env.registry.is_subtype_of(okid, kid)) as i32
                    }
                };
                frame::push_int(&mut thread.stack, &mut sp, result);
                bci += 3;
            }

            // Monitors.
            bc::MONITORENTER => {
                let obj = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                // Scan for a free record, stopping at an existing record
                // for the same object so the re-entrant record is the
                // newest one.
                let mut free: Option<MonitorRecord> = None;
                for rec in f.monitors(&thread.stack) {
                    match rec.obj(&thread.stack) {
                        None => free = Some(rec),
                        Some(o) if o == obj => break,
                        Some(_) => {}
                    }
                }
                let rec = match free {
                    Some(r) => r,
                    None => match f.grow_monitor_block(&mut thread.stack, &mut sp) {
                        Ok(r) => r,
                        Err(t) => {
                            f.set_bcx(&mut thread.stack, bci + 1);
                            return Err(ExecSignal::Throw(t));
                        }
                    },
                };
                rec.set_obj(&mut thread.stack, Some(obj));
                // Advance first: if locking trips the stack check, the
                // exception reports at the following instruction, matching
                // the already-consumed operand.
                bci += 1;
                decache(thread, f, bci, sp);
                lock_object(env, thread, rec, obj);
                clear_last_sp(thread, f);
                if sp <= thread.stack.limit() {
                    return Err(ExecSignal::Throw(JavaThrowable::bare(
                        JavaExKind::StackOverflowError,
                    )));
                }
            }
            bc::MONITOREXIT => {
                let obj = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
                let mut found = false;
                let records: Vec<MonitorRecord> = f.monitors(&thread.stack).collect();
                for rec in records {
                    if rec.obj(&thread.stack) == Some(obj) {
                        unlock_object(env, thread, rec, obj).map_err(ExecSignal::Throw)?;
                        found = true;
                        break;
                    }
                }
                if !found {
                    // Unbalanced unlock is a bytecode-contract violation.
                    decache(thread, f, bci, sp);
                    return Err(ExecSignal::Throw(JavaThrowable::bare(
                        JavaExKind::IllegalMonitorStateException,
                    )));
                }
                bci += 1;
            }

            bc::WIDE => {
                let sub = method.code_byte(bci + 1);
                let n = method.java_u2(bci + 2) as usize;
                match sub {
                    bc::ILOAD | bc::FLOAD | bc::ALOAD => {
                        let v = thread.stack.word(frame::iaddress(lb, n));
                        frame::push_raw(&mut thread.stack, &mut sp, v);
                        bci += 4;
                    }
                    bc::LLOAD | bc::DLOAD => {
                        let v = thread.stack.word(frame::laddress(lb, n));
                        frame::push_raw(&mut thread.stack, &mut sp, 0);
                        frame::push_raw(&mut thread.stack, &mut sp, v);
                        bci += 4;
                    }
                    bc::ISTORE | bc::FSTORE | bc::ASTORE => {
                        let v = frame::pop_raw(&thread.stack, &mut sp);
                        thread.stack.set_word(frame::iaddress(lb, n), v);
                        bci += 4;
                    }
                    bc::LSTORE | bc::DSTORE => {
                        let v = frame::pop_raw(&thread.stack, &mut sp);
                        let _ = frame::pop_raw(&thread.stack, &mut sp);
                        thread.stack.set_word(frame::laddress(lb, n), v);
                        bci += 4;
                    }
                    bc::IINC => {
                        let delta = method.java_u2(bci + 4) as i16 as i32;
                        let idx = frame::iaddress(lb, n);
                        let v = bits_int(thread.stack.word(idx)).wrapping_add(delta);
                        thread.stack.set_word(idx, int_bits(v));
                        bci += 6;
                    }
                    bc::RET => {
                        bci = bits_int(thread.stack.word(frame::iaddress(lb, n))) as usize;
                        safepoint_poll(thread, f, bci, sp);
                    }
                    other => {
                        return Err(ExecSignal::Fatal(anyhow!(
                            "wide prefix on {}",
                            bc::name(other)
                        )))
                    }
                }
            }

            bc::BREAKPOINT => {
                let original = env
                    .jvmti
                    .get_original_bytecode_at(mid, bci)
                    .ok_or_else(|| anyhow!("breakpoint with no remembered bytecode at {bci}"))?;
                env.jvmti.post_event(JvmtiEvent::Breakpoint { method: mid, bci });
                opcode_override = Some(original);
            }

            other => {
                // Supposedly-exhaustive dispatch: an unknown opcode is a
                // fatal interpreter bug, not a user-visible condition.
                return Err(ExecSignal::Fatal(anyhow!(
                    "unimplemented opcode {other:#x} ({}) in {} at bci {bci}",
                    bc::name(other),
                    method.name
                )));
            }
        }
    }
}

fn narrow_int(v: i32, rt: BasicType) -> i32 {
    match rt {
        BasicType::Boolean => v & 1,
        BasicType::Byte => v as i8 as i32,
        BasicType::Char => v as u16 as i32,
        BasicType::Short => v as i16 as i32,
        _ => v,
    }
}

fn bounds_check(env: &Arc<VmEnv>, arr: ObjRef, index: i32) -> Result<(), ExecSignal> {
    let length = env.heap.array_length(arr);
    // Unsigned compare: negative indices fault instead of wrapping.
    if (index as u32) >= (length as u32) {
        return Err(ExecSignal::Throw(JavaThrowable::new(
            JavaExKind::ArrayIndexOutOfBoundsException,
            format!("Index {index} out of bounds for length {length}"),
        )));
    }
    Ok(())
}

fn safepoint_poll(thread: &mut JavaThread, f: Frame, bci: usize, sp: usize) {
    if thread.poll.should_process() {
        decache(thread, f, bci, sp);
        thread.poll.process_if_requested(thread.id);
        clear_last_sp(thread, f);
    }
}

/// `ldc`/`ldc_w` for one-slot constants, dispatching on the pool tag.
#[allow(clippy::too_many_arguments)]
fn ldc_cat1(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
    index: u16,
) -> BcResult<usize> {
    match pool.tag_at(index) {
        Tag::Integer => {
            let crate::meta::PoolConstant::Integer(v) = pool.constant(index) else {
                return Err(ExecSignal::Fatal(anyhow!("integer tag mismatch")));
            };
            frame::push_int(&mut thread.stack, &mut sp, *v);
        }
        Tag::Float => {
            let crate::meta::PoolConstant::Float(v) = pool.constant(index) else {
                return Err(ExecSignal::Fatal(anyhow!("float tag mismatch")));
            };
            frame::push_float(&mut thread.stack, &mut sp, *v);
        }
        Tag::Class => {
            let kid = pool
                .resolved_klass_at(index)
                .expect("resolved tag implies klass slot");
            let mirror = env.mirror_of(kid).map_err(ExecSignal::Throw)?;
            frame::push_obj(&mut thread.stack, &mut sp, Some(mirror));
        }
        Tag::String | Tag::UnresolvedClass | Tag::UnresolvedClassInError => {
            if let Some(obj) = pool.resolved_reference_at(index) {
                frame::push_obj(&mut thread.stack, &mut sp, Some(obj));
            } else {
                decache(thread, f, bci, sp);
                let v = env.resolve_ldc(pool, index).map_err(ExecSignal::Throw)?;
                clear_last_sp(thread, f);
                match v {
                    JValue::Obj(o) => frame::push_obj(&mut thread.stack, &mut sp, o),
                    _ => {
                        return Err(ExecSignal::Fatal(anyhow!(
                            "reference constant produced a primitive"
                        )))
                    }
                }
            }
        }
        Tag::Dynamic | Tag::DynamicInError => {
            decache(thread, f, bci, sp);
            let v = env.resolve_ldc(pool, index).map_err(ExecSignal::Throw)?;
            clear_last_sp(thread, f);
            match v {
                JValue::Int(i) => frame::push_int(&mut thread.stack, &mut sp, i),
                JValue::Float(x) => frame::push_float(&mut thread.stack, &mut sp, x),
                JValue::Obj(o) => frame::push_obj(&mut thread.stack, &mut sp, o),
                _ => {
                    return Err(ExecSignal::Fatal(anyhow!(
                        "one-slot dynamic constant produced a category-2 value"
                    )))
                }
            }
        }
        other => {
            return Err(ExecSignal::Fatal(anyhow!("ldc on {other:?} constant")));
        }
    }
    Ok(sp)
}

/// `checkcast`/`instanceof` klass operand: already-resolved fast path, or
/// the `quicken_io_cc` runtime call.
fn resolve_cast_klass(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    pool: &Arc<ConstantPool>,
    bci: usize,
    sp: usize,
    method: &Arc<Method>,
) -> BcResult<crate::value::KlassId> {
    let index = method.java_u2(bci + 1);
    if pool.tag_at(index) == Tag::Class {
        return Ok(pool
            .resolved_klass_at(index)
            .expect("resolved tag implies klass slot"));
    }
    decache(thread, f, bci, sp);
    let kid = env.quicken_io_cc(pool, index).map_err(ExecSignal::Throw)?;
    clear_last_sp(thread, f);
    Ok(kid)
}

/// Conditional-branch tail shared by every `if*` handler.
#[allow(clippy::too_many_arguments)]
fn conditional(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    bci: usize,
    sp: usize,
    taken: bool,
    not_taken_len: usize,
) -> BcResult<BranchOutcome> {
    if !taken {
        if let Some(md) = method.method_data() {
            md.profile_not_taken_branch(bci);
        }
        return Ok(BranchOutcome::Continue(bci + not_taken_len));
    }
    let offset = method.java_u2(bci + 1) as i16 as isize;
    let target = (bci as isize + offset) as usize;
    branch_to(env, thread, f, mid, method, bci, target, sp)
}

/// Taken-branch protocol: backward branches feed the backedge counter
/// (profiling data first, plain counters otherwise, built lazily), and a
/// counter overflow may hand the activation to compiled code via OSR.
#[allow(clippy::too_many_arguments)]
fn branch_to(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    bci: usize,
    target: usize,
    sp: usize,
) -> BcResult<BranchOutcome> {
    let backward = target <= bci;
    if env.config.use_loop_counter && backward {
        if let Some(md) = method.method_data() {
            md.profile_taken_branch(bci);
        }
        if method.method_counters().is_none() {
            decache(thread, f, bci, sp);
            env.build_method_counters(method);
            clear_last_sp(thread, f);
        }
        let overflow = if env.config.profile_interpreter {
            match method.method_data() {
                Some(md) => md.backedge.increment_and_test(md.backedge_mask),
                None => match method.method_counters() {
                    Some(mc) => mc.backedge.increment_and_test(mc.backedge_mask),
                    None => false,
                },
            }
        } else {
            match method.method_counters() {
                Some(mc) => mc.backedge.increment_and_test(mc.backedge_mask),
                None => false,
            }
        };
        if overflow && env.config.use_on_stack_replacement {
            decache(thread, f, bci, sp);
            if let Some(nm) = env.frequency_counter_overflow(mid, target) {
                // The nmethod may have been invalidated while we blocked in
                // the runtime call.
                if nm.is_in_use() {
                    let buffer = osr_migration_begin(thread, f, method, target);
                    tracing::debug!(
                        target: "robusta::interp::osr",
                        method = %method.name,
                        bci = target,
                        "entering OSR nmethod"
                    );
                    let result = nm.enter(buffer).map_err(ExecSignal::Throw)?;
                    return Ok(BranchOutcome::OsrReturn(result));
                }
            }
            clear_last_sp(thread, f);
        }
    }
    safepoint_poll(thread, f, target, sp);
    Ok(BranchOutcome::Continue(target))
}

/// Migrate the activation's locals and monitors into a compiler-owned
/// buffer; the interpreter frame is dead once the OSR entry runs.
fn osr_migration_begin(
    thread: &mut JavaThread,
    f: Frame,
    method: &Arc<Method>,
    target_bci: usize,
) -> OsrBuffer {
    let lb = f.locals_base(&thread.stack);
    let locals = (0..method.max_locals as usize)
        .map(|n| thread.stack.word(frame::iaddress(lb, n)))
        .collect();
    let records: Vec<MonitorRecord> = f.monitors(&thread.stack).collect();
    let mut monitors = Vec::new();
    for rec in records {
        if let Some(obj) = rec.obj(&thread.stack) {
            monitors.push((obj, rec.displaced_header(&thread.stack)));
            // Ownership moves to the buffer; the interpreter record dies
            // with the frame.
            rec.set_obj(&mut thread.stack, None);
        }
    }
    OsrBuffer {
        locals,
        monitors,
        bci: target_bci,
    }
}
