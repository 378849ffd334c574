//! Invocation family: resolve through the cache, locate the target per
//! dispatch kind, null-check the receiver where one exists, and transfer
//! control. The interface error paths restore canonical interpreter state
//! (decache) before throwing, since the lookup may have run arbitrary
//! resolution code.

use std::sync::Arc;

use anyhow::anyhow;

use crate::interp::bytecodes as bc;
use crate::interp::cpcache::{CallKind, ResolvedInfo, ResolvedMethod};
use crate::interp::frame::{self, Frame};
use crate::interp::JavaThread;
use crate::meta::{ConstantPool, Method};
use crate::rt::{BcResult, ExecSignal, JavaExKind, JavaThrowable, VmEnv};
use crate::value::{JValue, MethodId, ObjRef};

use super::fields::{null_check, resolve_cache_and_index, IndexSize};
use super::quicken::{self, RewriteControl};
use super::{clear_last_sp, decache};

#[allow(clippy::too_many_arguments)]
pub(super) fn do_invoke(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    sp: usize,
    raw_code: u8,
    rc: RewriteControl,
) -> BcResult<(usize, usize)> {
    let index_size = if raw_code == bc::INVOKEDYNAMIC {
        IndexSize::U4
    } else {
        IndexSize::U2
    };
    let (info, _, _) =
        resolve_cache_and_index(env, thread, f, method, pool, bci, sp, raw_code, index_size)?;
    let ResolvedInfo::Method(m) = info else {
        return Err(ExecSignal::Fatal(anyhow!(
            "invoke bytecode in {} found a non-method cache entry",
            method.name
        )));
    };

    let mut sp = sp;
    // The trailing appendix argument goes on before the receiver's stack
    // position is computed; its slot is part of the declared window.
    if m.has_appendix {
        frame::push_obj(&mut thread.stack, &mut sp, m.appendix);
    }
    let total_slots = m.param_slots as usize;

    let code = bc::java_code(raw_code);
    let callee_mid = match code {
        bc::INVOKESTATIC | bc::INVOKEDYNAMIC => m.method,
        bc::INVOKESPECIAL | bc::INVOKEHANDLE => {
            receiver(thread, sp, total_slots)?;
            m.method
        }
        bc::INVOKEVIRTUAL => {
            let recv = receiver(thread, sp, total_slots)?;
            if m.is_vfinal {
                if raw_code == bc::INVOKEVIRTUAL && rc == RewriteControl::MayRewrite {
                    quicken::patch_bytecode(env, method, mid, bci, bc::FAST_INVOKEVFINAL);
                }
                m.method
            } else {
                let CallKind::Vtable { index } = m.kind else {
                    return Err(ExecSignal::Fatal(anyhow!(
                        "non-vfinal virtual call without a vtable index"
                    )));
                };
                vtable_dispatch(env, recv, index)?
            }
        }
        bc::INVOKEINTERFACE => interface_dispatch(env, thread, f, bci, sp, total_slots, &m)?,
        other => {
            return Err(ExecSignal::Fatal(anyhow!(
                "do_invoke on {}",
                bc::name(other)
            )))
        }
    };

    let advance = match code {
        bc::INVOKEINTERFACE | bc::INVOKEDYNAMIC => 5,
        _ => 3,
    };

    let callee = env.registry.method(callee_mid);
    decache(thread, f, bci, sp);
    let ret = super::invoke_java(env, thread, callee_mid, &callee, sp, f.fp as u64, bci + advance)?;
    clear_last_sp(thread, f);

    let mut sp = sp + total_slots;
    push_return(thread, &mut sp, ret);
    Ok((bci + advance, sp))
}

fn receiver(thread: &JavaThread, sp: usize, total_slots: usize) -> Result<ObjRef, ExecSignal> {
    null_check(ObjRef::from_bits(frame::raw_at(
        &thread.stack,
        sp,
        total_slots - 1,
    )))
}

fn vtable_dispatch(env: &Arc<VmEnv>, recv: ObjRef, index: u16) -> BcResult<MethodId> {
    let kid = env.heap.klass_id(recv);
    env.registry
        .method_at_vtable(kid, index as usize)
        .ok_or_else(|| {
            ExecSignal::Throw(JavaThrowable::bare(JavaExKind::AbstractMethodError))
        })
}

/// Interface dispatch with its three sub-cases: root-class methods
/// (virtual), private interface methods (direct plus a subtype assertion),
/// and the general itable lookup with its two error paths.
fn interface_dispatch(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    bci: usize,
    sp: usize,
    total_slots: usize,
    m: &ResolvedMethod,
) -> BcResult<MethodId> {
    if m.is_forced_virtual {
        let recv = receiver(thread, sp, total_slots)?;
        return match m.kind {
            CallKind::Vtable { index } => vtable_dispatch(env, recv, index),
            _ => Ok(m.method),
        };
    }

    let recv = receiver(thread, sp, total_slots)?;
    let recv_kid = env.heap.klass_id(recv);

    if m.is_vfinal {
        if !env.registry.is_subtype_of(recv_kid, m.holder) {
            decache(thread, f, bci, sp);
            return Err(ExecSignal::Throw(incompatible(env, recv_kid, m.holder)));
        }
        return Ok(m.method);
    }

    let CallKind::Itable { interface, index } = m.kind else {
        return Err(ExecSignal::Fatal(anyhow!(
            "interface call resolved without an itable slot"
        )));
    };

    // Receiver subtype check against the resolved interface (REFC); the
    // link resolver only verified the first caller's receiver class.
    if !env.registry.is_subtype_of(recv_kid, m.holder) {
        decache(thread, f, bci, sp);
        return Err(ExecSignal::Throw(incompatible(env, recv_kid, m.holder)));
    }

    let Some(block) = env.registry.find_itable_block(recv_kid, interface) else {
        decache(thread, f, bci, sp);
        return Err(ExecSignal::Throw(incompatible(env, recv_kid, interface)));
    };
    match block.methods.get(index as usize).copied().flatten() {
        Some(target) => Ok(target),
        None => {
            decache(thread, f, bci, sp);
            let name = env.registry.method(m.method).name.clone();
            Err(ExecSignal::Throw(JavaThrowable::new(
                JavaExKind::AbstractMethodError,
                name.as_ref(),
            )))
        }
    }
}

fn incompatible(env: &Arc<VmEnv>, recv: crate::value::KlassId, iface: crate::value::KlassId) -> JavaThrowable {
    JavaThrowable::new(
        JavaExKind::IncompatibleClassChangeError,
        format!(
            "Class {} does not implement the requested interface {}",
            env.registry.klass(recv).name,
            env.registry.klass(iface).name
        ),
    )
}

pub(super) fn push_return(thread: &mut JavaThread, sp: &mut usize, v: Option<JValue>) {
    match v {
        None => {}
        Some(JValue::Int(i)) => frame::push_int(&mut thread.stack, sp, i),
        Some(JValue::Long(l)) => frame::push_long(&mut thread.stack, sp, l),
        Some(JValue::Float(x)) => frame::push_float(&mut thread.stack, sp, x),
        Some(JValue::Double(x)) => frame::push_double(&mut thread.stack, sp, x),
        Some(JValue::Obj(o)) => frame::push_obj(&mut thread.stack, sp, o),
    }
}
