//! Field access family and the cache-resolution protocol (`getfield`,
//! `putfield`, `getstatic`, `putstatic`, and their quickened forms).

use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use anyhow::anyhow;

use crate::heap::{barrier, extend_for_load, truncate_for_store};
use crate::interp::bytecodes as bc;
use crate::interp::cpcache::{ResolvedField, ResolvedInfo};
use crate::interp::frame::{self, Frame};
use crate::interp::JavaThread;
use crate::meta::{ConstantPool, Method};
use crate::rt::{BcResult, ExecSignal, JavaExKind, JavaThrowable, JvmtiEvent, VmEnv};
use crate::value::{MethodId, ObjRef, TosState};

use super::quicken::{
    self, fast_getfield_code, fast_putfield_code, RewriteControl,
};
use super::{clear_last_sp, decache};

/// Width of the cache-index operand embedded past the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum IndexSize {
    U2,
    U4,
}

#[inline]
pub(super) fn null_check(obj: Option<ObjRef>) -> Result<ObjRef, ExecSignal> {
    obj.ok_or_else(|| ExecSignal::Throw(JavaThrowable::bare(JavaExKind::NullPointerException)))
}

/// The cache-resolution state machine: load the cache index embedded at
/// `bci + 1`, normalize nofast variants, compare the recorded tag against
/// the canonical code, call the resolution runtime on a miss, re-read, and
/// apply the class-initialization barrier for `invokestatic`.
#[allow(clippy::too_many_arguments)]
pub(super) fn resolve_cache_and_index(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    sp: usize,
    raw_code: u8,
    index_size: IndexSize,
) -> BcResult<(ResolvedInfo, u16, u16)> {
    let code = match raw_code {
        bc::NOFAST_GETFIELD => bc::GETFIELD,
        bc::NOFAST_PUTFIELD => bc::PUTFIELD,
        bc::FAST_INVOKEVFINAL => bc::INVOKEVIRTUAL,
        other => other,
    };
    let cache = pool
        .cache()
        .ok_or_else(|| anyhow!("method {} resolves through a cacheless pool", method.name))?
        .clone();
    let cache_index = match index_size {
        IndexSize::U2 => method.native_u2(bci + 1),
        IndexSize::U4 => method.native_u4(bci + 1) as u16,
    };
    let entry = cache.entry_at(cache_index);
    if !entry.is_resolved(code) {
        decache(thread, f, bci, sp);
        env.resolve_from_cache(thread, pool, cache_index, code)?;
        clear_last_sp(thread, f);
    }

    // Class-initialization barrier: a resolved static call site may still
    // race ahead of its declaring class's initialization; fall back to the
    // slow path until the class is usable from this thread.
    if code == bc::INVOKESTATIC && env.config.fast_class_init_checks {
        loop {
            let ResolvedInfo::Method(m) = entry.info() else {
                break;
            };
            if env.registry.klass(m.holder).is_init_ok_for(thread.id) {
                break;
            }
            decache(thread, f, bci, sp);
            env.resolve_from_cache(thread, pool, cache_index, code)?;
            clear_last_sp(thread, f);
        }
    }

    Ok((entry.info(), entry.cp_index(), cache_index))
}

fn resolved_field_of(info: ResolvedInfo, method: &Method) -> BcResult<ResolvedField> {
    match info {
        ResolvedInfo::Field(fd) => Ok(fd),
        _ => Err(ExecSignal::Fatal(anyhow!(
            "field bytecode in {} found a non-field cache entry",
            method.name
        ))),
    }
}

/// Push a field's value. Volatile reads take a leading full fence (IRIW
/// discipline) and an acquire load; object fields go through the read
/// barrier.
fn load_field_value(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    sp: &mut usize,
    obj: ObjRef,
    fd: &ResolvedField,
) {
    let heap = &env.heap;
    if fd.is_volatile && env.config.strong_volatile_fences {
        fence(Ordering::SeqCst);
    }
    let offset = fd.offset as usize;
    match fd.tos {
        TosState::Ltos | TosState::Dtos => {
            let bits = if fd.is_volatile {
                heap.get_word_acquire(obj, offset)
            } else {
                heap.get_word(obj, offset)
            };
            frame::push_raw(&mut thread.stack, sp, 0);
            frame::push_raw(&mut thread.stack, sp, bits);
        }
        TosState::Atos => {
            let mut decorators = barrier::IN_HEAP;
            if fd.is_volatile {
                decorators |= barrier::MO_ACQUIRE;
            }
            let v = barrier::load_heap_oop(heap, obj, offset, decorators);
            frame::push_obj(&mut thread.stack, sp, v);
        }
        tos => {
            let bits = if fd.is_volatile {
                heap.get_word_acquire(obj, offset)
            } else {
                heap.get_word(obj, offset)
            };
            frame::push_raw(&mut thread.stack, sp, extend_for_load(tos, bits));
        }
    }
}

/// Store the popped value into a field. Volatile writes release-store and
/// trail a full fence (store-load); object fields go through the write
/// barrier.
fn store_field_value(
    env: &Arc<VmEnv>,
    obj: ObjRef,
    fd: &ResolvedField,
    value: FieldValue,
) {
    let heap = &env.heap;
    let offset = fd.offset as usize;
    match value {
        FieldValue::Oop(v) => {
            let mut decorators = barrier::IN_HEAP;
            if v.is_none() {
                decorators |= barrier::STORING_NULL;
            }
            if fd.is_volatile {
                decorators |= barrier::MO_RELEASE;
            }
            barrier::store_heap_oop(heap, obj, offset, v, decorators);
        }
        FieldValue::Bits(bits) => {
            let bits = truncate_for_store(fd.tos, bits);
            if fd.is_volatile {
                heap.put_word_release(obj, offset, bits);
            } else {
                heap.put_word(obj, offset, bits);
            }
        }
    }
    if fd.is_volatile {
        fence(Ordering::SeqCst);
    }
}

enum FieldValue {
    Bits(u64),
    Oop(Option<ObjRef>),
}

fn pop_field_value(thread: &mut JavaThread, sp: &mut usize, tos: TosState) -> FieldValue {
    match tos {
        TosState::Atos => FieldValue::Oop(frame::pop_obj(&thread.stack, sp)),
        TosState::Ltos | TosState::Dtos => {
            let bits = frame::pop_raw(&thread.stack, sp);
            let _ = frame::pop_raw(&thread.stack, sp);
            FieldValue::Bits(bits)
        }
        _ => FieldValue::Bits(frame::pop_raw(&thread.stack, sp)),
    }
}

#[allow(clippy::too_many_arguments)]
pub(super) fn getfield_or_static(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
    raw_code: u8,
    rc: RewriteControl,
) -> BcResult<(usize, usize)> {
    let is_static = bc::java_code(raw_code) == bc::GETSTATIC;
    let (info, cp_index, _) =
        resolve_cache_and_index(env, thread, f, method, pool, bci, sp, raw_code, IndexSize::U2)?;
    let fd = resolved_field_of(info, method)?;

    // Watch-count gate keeps the common path free of eventing work.
    if env.jvmti.field_access_watched() {
        env.jvmti.post_event(JvmtiEvent::FieldAccess {
            method: mid,
            bci,
            cp_index,
        });
    }

    let obj = if is_static {
        env.mirror_of(fd.holder).map_err(ExecSignal::Throw)?
    } else {
        null_check(frame::pop_obj(&thread.stack, &mut sp))?
    };
    load_field_value(env, thread, &mut sp, obj, &fd);

    if !is_static && rc == RewriteControl::MayRewrite {
        quicken::patch_bytecode(env, method, mid, bci, fast_getfield_code(fd.tos));
    }
    Ok((bci + 3, sp))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn putfield_or_static(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
    raw_code: u8,
    rc: RewriteControl,
) -> BcResult<(usize, usize)> {
    let is_static = bc::java_code(raw_code) == bc::PUTSTATIC;
    let (info, cp_index, _) =
        resolve_cache_and_index(env, thread, f, method, pool, bci, sp, raw_code, IndexSize::U2)?;
    let fd = resolved_field_of(info, method)?;

    if env.jvmti.field_modification_watched() {
        env.jvmti.post_event(JvmtiEvent::FieldModification {
            method: mid,
            bci,
            cp_index,
        });
    }

    let value = pop_field_value(thread, &mut sp, fd.tos);
    let obj = if is_static {
        env.mirror_of(fd.holder).map_err(ExecSignal::Throw)?
    } else {
        null_check(frame::pop_obj(&thread.stack, &mut sp))?
    };
    store_field_value(env, obj, &fd, value);

    // Final fields keep the slow form so every store re-enters resolution.
    if !is_static && rc == RewriteControl::MayRewrite && !fd.is_final {
        quicken::patch_bytecode(env, method, mid, bci, fast_putfield_code(fd.tos));
    }
    Ok((bci + 3, sp))
}

/// Quickened instance field load; the entry is normally resolved already,
/// but a racing thread may see the patched opcode first.
#[allow(clippy::too_many_arguments)]
pub(super) fn fast_accessfield(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
) -> BcResult<(usize, usize)> {
    let (info, cp_index, _) =
        resolve_cache_and_index(env, thread, f, method, pool, bci, sp, bc::GETFIELD, IndexSize::U2)?;
    let fd = resolved_field_of(info, method)?;
    if env.jvmti.field_access_watched() {
        env.jvmti.post_event(JvmtiEvent::FieldAccess {
            method: mid,
            bci,
            cp_index,
        });
    }
    let obj = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
    load_field_value(env, thread, &mut sp, obj, &fd);
    Ok((bci + 3, sp))
}

#[allow(clippy::too_many_arguments)]
pub(super) fn fast_storefield(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    mid: MethodId,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
) -> BcResult<(usize, usize)> {
    let (info, cp_index, _) =
        resolve_cache_and_index(env, thread, f, method, pool, bci, sp, bc::PUTFIELD, IndexSize::U2)?;
    let fd = resolved_field_of(info, method)?;
    if env.jvmti.field_modification_watched() {
        env.jvmti.post_event(JvmtiEvent::FieldModification {
            method: mid,
            bci,
            cp_index,
        });
    }
    let value = pop_field_value(thread, &mut sp, fd.tos);
    let obj = null_check(frame::pop_obj(&thread.stack, &mut sp))?;
    store_field_value(env, obj, &fd, value);
    Ok((bci + 3, sp))
}

/// Fused `aload_0; getfield` forms: receiver from local 0, cache index at
/// `bci + 2`, four bytes consumed.
#[allow(clippy::too_many_arguments)]
pub(super) fn fast_xaccess(
    env: &Arc<VmEnv>,
    thread: &mut JavaThread,
    f: Frame,
    method: &Arc<Method>,
    pool: &Arc<ConstantPool>,
    bci: usize,
    mut sp: usize,
) -> BcResult<(usize, usize)> {
    let locals_base = f.locals_base(&thread.stack);
    let obj = null_check(ObjRef::from_bits(
        thread.stack.word(frame::aaddress(locals_base, 0)),
    ))?;

    let cache = pool
        .cache()
        .ok_or_else(|| anyhow!("method {} resolves through a cacheless pool", method.name))?
        .clone();
    let cache_index = method.native_u2(bci + 2);
    let entry = cache.entry_at(cache_index);
    if !entry.is_resolved(bc::GETFIELD) {
        decache(thread, f, bci, sp);
        env.resolve_from_cache(thread, pool, cache_index, bc::GETFIELD)?;
        clear_last_sp(thread, f);
    }
    let fd = resolved_field_of(entry.info(), method)?;
    load_field_value(env, thread, &mut sp, obj, &fd);
    Ok((bci + 4, sp))
}
