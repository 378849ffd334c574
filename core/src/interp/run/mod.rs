//! Interpreter entry points and the frame lifecycle around the dispatch
//! loop: argument transfer, synchronized-method locking, exception unwind,
//! and the decache/recache discipline around runtime calls.

mod dispatch;
mod fields;
mod invoke;
mod math;
mod quicken;

use std::sync::Arc;

use anyhow::anyhow;
use tracing::debug;

use crate::heap::mark;
use crate::interp::frame::{
    self, push_interpreter_frame, Frame, JavaStack, MonitorRecord, SENTINEL_FP,
};
use crate::interp::JavaThread;
use crate::meta::Method;
use crate::rt::{
    BcResult, ExecSignal, InvokeOutcome, JavaExKind, JavaThrowable, VmEnv,
};
use crate::value::{JValue, MethodId, ObjRef};

/// Invoke a method from the embedder. Arguments are typed; the result is
/// either the method's return value or the Java exception that unwound out
/// of it. Fatal interpreter errors surface as `Err`.
pub fn call_method(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    mid: MethodId,
    args: &[JValue],
) -> anyhow::Result<InvokeOutcome> {
    let method = env.registry.method(mid);
    let saved_sp = thread.top_sp;
    let mut sp = saved_sp;
    for a in args {
        match *a {
            JValue::Int(v) => frame::push_int(&mut thread.stack, &mut sp, v),
            JValue::Long(v) => frame::push_long(&mut thread.stack, &mut sp, v),
            JValue::Float(v) => frame::push_float(&mut thread.stack, &mut sp, v),
            JValue::Double(v) => frame::push_double(&mut thread.stack, &mut sp, v),
            JValue::Obj(v) => frame::push_obj(&mut thread.stack, &mut sp, v),
        }
    }
    let pushed: usize = args.iter().map(JValue::slots).sum();
    if pushed != method.param_slots() {
        thread.top_sp = saved_sp;
        return Err(anyhow!(
            "method {} takes {} argument slots, got {}",
            method.name,
            method.param_slots(),
            pushed
        ));
    }
    let outcome = invoke_java(env, thread, mid, &method, sp, SENTINEL_FP, 0);
    thread.top_sp = saved_sp;
    match outcome {
        Ok(v) => Ok(InvokeOutcome::Normal(v)),
        Err(ExecSignal::Throw(t)) => Ok(InvokeOutcome::Threw(t)),
        Err(ExecSignal::Fatal(e)) => Err(e),
    }
}

/// Run one method activation: natives directly, bytecode through a pushed
/// interpreter frame. The caller's arguments sit on the stack above
/// `sp_after_args` and become the callee's locals.
pub(crate) fn invoke_java(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    mid: MethodId,
    method: &Arc<Method>,
    sp_after_args: usize,
    caller_fp: u64,
    return_bci: usize,
) -> BcResult<Option<JValue>> {
    if method.flags.is_abstract {
        return Err(ExecSignal::Throw(JavaThrowable::new(
            JavaExKind::AbstractMethodError,
            method.name.as_ref(),
        )));
    }
    if let Some(native) = &method.native {
        let args = collect_native_args(&thread.stack, method, sp_after_args);
        return (native.as_ref())(&args).map_err(ExecSignal::Throw);
    }
    if method.code_len() == 0 {
        return Err(ExecSignal::Fatal(anyhow!(
            "method {} has no code and no native implementation",
            method.name
        )));
    }

    // Entry counters mirror the backedge discipline.
    if env.config.use_loop_counter {
        env.build_method_counters(method);
        if env.config.profile_interpreter {
            method.ensure_method_data(env.config.backedge_mask);
        }
        if let Some(mc) = method.method_counters() {
            mc.invocation.increment_and_test(mc.invocation_mask);
        }
    }

    let (f, mut sp) =
        push_interpreter_frame(&mut thread.stack, caller_fp, return_bci, sp_after_args, mid, method)
            .map_err(ExecSignal::Throw)?;
    thread.top_sp = sp;

    // Synchronized methods own their receiver (or mirror) for the whole
    // activation, through the frame's first monitor record.
    let method_monitor = if method.flags.is_synchronized {
        let obj = if method.flags.is_static {
            env.mirror_of(method.holder).map_err(ExecSignal::Throw)?
        } else {
            let locals_base = f.locals_base(&thread.stack);
            ObjRef::from_bits(thread.stack.word(frame::aaddress(locals_base, 0))).ok_or_else(
                || ExecSignal::Throw(JavaThrowable::bare(JavaExKind::NullPointerException)),
            )?
        };
        let rec = f
            .grow_monitor_block(&mut thread.stack, &mut sp)
            .map_err(ExecSignal::Throw)?;
        rec.set_obj(&mut thread.stack, Some(obj));
        lock_object(env, thread, rec, obj);
        Some((rec, obj))
    } else {
        None
    };

    let result = dispatch::interpret(env, thread, f, mid, method, sp);

    match result {
        Ok(dispatch::InterpExit::Return(value)) => {
            remove_activation(env, thread, f, method_monitor).map_err(ExecSignal::Throw)?;
            Ok(value)
        }
        // One-way OSR transfer: the interpreter frame is gone and its
        // monitors migrated with it; there is no activation to remove.
        Ok(dispatch::InterpExit::Osr(value)) => Ok(value),
        Err(signal) => {
            // Forced unwind: release whatever this frame still holds so the
            // exception propagates with a consistent monitor state.
            release_frame_monitors(env, thread, f);
            if let ExecSignal::Throw(t) = &signal {
                debug!(
                    target: "robusta::interp",
                    method = %method.name,
                    bci = f.bcx(&thread.stack),
                    exception = %t,
                    "unwinding activation"
                );
            }
            Err(signal)
        }
    }
}

fn collect_native_args(stack: &JavaStack, method: &Method, sp_after_args: usize) -> Vec<JValue> {
    let locals_base = sp_after_args + method.param_slots();
    let mut args = Vec::with_capacity(method.param_types.len() + 1);
    let mut slot = 0usize;
    if !method.flags.is_static {
        args.push(JValue::Obj(ObjRef::from_bits(
            stack.word(frame::aaddress(locals_base, 0)),
        )));
        slot = 1;
    }
    for t in &method.param_types {
        let idx = frame::iaddress(locals_base, slot);
        let v = match t {
            crate::value::BasicType::Long => {
                JValue::Long(crate::value::bits_long(stack.word(idx - 1)))
            }
            crate::value::BasicType::Double => {
                JValue::Double(crate::value::bits_double(stack.word(idx - 1)))
            }
            crate::value::BasicType::Float => {
                JValue::Float(crate::value::bits_float(stack.word(idx)))
            }
            crate::value::BasicType::Object => JValue::Obj(ObjRef::from_bits(stack.word(idx))),
            _ => JValue::Int(crate::value::bits_int(stack.word(idx))),
        };
        args.push(v);
        slot += t.slots();
    }
    args
}

/// Normal-return teardown: the synchronized-method monitor is released and
/// the monitor block must come back empty; a still-held monitor is an
/// unbalanced-locking bug in the bytecode.
fn remove_activation(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    method_monitor: Option<(MonitorRecord, ObjRef)>,
) -> Result<(), JavaThrowable> {
    if let Some((rec, obj)) = method_monitor {
        if rec.obj(&thread.stack) != Some(obj) {
            return Err(JavaThrowable::bare(JavaExKind::IllegalMonitorStateException));
        }
        unlock_object(env, thread, rec, obj)?;
    }
    let dangling = f
        .monitors(&thread.stack)
        .filter(|r| r.obj(&thread.stack).is_some())
        .count();
    if dangling > 0 {
        return Err(JavaThrowable::bare(JavaExKind::IllegalMonitorStateException));
    }
    Ok(())
}

/// Exception-path teardown: release everything still locked, silently.
fn release_frame_monitors(env: &Arc<VmEnv>, thread: &mut JavaThread, f: Frame) {
    let records: Vec<MonitorRecord> = f.monitors(&thread.stack).collect();
    for rec in records {
        if let Some(obj) = rec.obj(&thread.stack) {
            let _ = unlock_object(env, thread, rec, obj);
        }
    }
}

/// Fast-path lock: displace the mark into the record and CAS the mark to
/// point at it; recursive and contended cases diverge from there.
pub(crate) fn lock_object(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    rec: MonitorRecord,
    obj: ObjRef,
) {
    let heap = &env.heap;
    let displaced = mark::set_unlocked(heap.mark(obj));
    rec.set_displaced_header(&mut thread.stack, displaced);
    match heap.cas_mark(obj, displaced, mark::from_lock_record(thread.id, rec.index)) {
        Ok(_) => {}
        Err(current) => {
            if mark::is_fast_locked(current) && mark::lock_record_thread(current) == thread.id {
                // Recursive enter: the record exists purely for unlock
                // bookkeeping.
                rec.set_displaced_header(&mut thread.stack, 0);
            } else {
                env.synchronizer.slow_enter(heap, obj, thread.id);
            }
        }
    }
}

/// Fast-path unlock mirroring [`lock_object`]; restores the record for the
/// slow path when the mark was inflated underneath us.
pub(crate) fn unlock_object(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    rec: MonitorRecord,
    obj: ObjRef,
) -> Result<(), JavaThrowable> {
    let heap = &env.heap;
    let header = rec.displaced_header(&thread.stack);
    rec.set_obj(&mut thread.stack, None);
    if header != 0 {
        let locked = mark::from_lock_record(thread.id, rec.index);
        if heap.cas_mark(obj, locked, header).is_err() {
            rec.set_obj(&mut thread.stack, Some(obj));
            env.synchronizer.slow_exit(heap, obj, thread.id)?;
            rec.set_obj(&mut thread.stack, None);
        }
    }
    Ok(())
}

/// Flush interpreter-visible state before a call that may safepoint,
/// allocate, or reenter the interpreter.
#[inline]
pub(crate) fn decache(thread: &mut JavaThread, f: Frame, bci: usize, sp: usize) {
    f.set_bcx(&mut thread.stack, bci);
    f.interpreter_frame_set_last_sp(&mut thread.stack, Some(sp));
    thread.top_sp = sp;
}

#[inline]
pub(crate) fn clear_last_sp(thread: &mut JavaThread, f: Frame) {
    f.interpreter_frame_set_last_sp(&mut thread.stack, None);
}
