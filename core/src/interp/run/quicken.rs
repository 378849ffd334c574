//! Quickening: in-place rewrites of the bytecode stream to faster variants
//! after first successful execution.
//!
//! A site with an installed breakpoint is never patched directly; the
//! rewrite lands in the breakpoint table's remembered byte instead, so the
//! debugger keeps its opcode and the semantics change survives breakpoint
//! removal. Patches are idempotent under races: the byte is only written
//! while it still carries the original (or already the target) code.

use std::sync::Arc;

use tracing::trace;

use crate::interp::bytecodes as bc;
use crate::meta::Method;
use crate::rt::VmEnv;
use crate::value::{MethodId, TosState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RewriteControl {
    MayRewrite,
    MayNotRewrite,
}

pub(super) fn patch_bytecode(
    env: &Arc<VmEnv>,
    method: &Method,
    mid: MethodId,
    bci: usize,
    target: u8,
) {
    if !env.config.rewrite_bytecodes {
        return;
    }
    if env.jvmti.can_post_breakpoint() && method.code_byte(bci) == bc::BREAKPOINT {
        // Let the breakpoint table carry the quickened form.
        env.jvmti.set_original_bytecode_at(mid, bci, target);
        return;
    }
    let current = method.code_byte(bci);
    if current == bc::java_code(target) || current == target {
        method.patch_code_byte(bci, target);
        trace!(
            target: "robusta::interp::slowpath",
            method = %method.name,
            bci,
            to = bc::name(target),
            "bytecode quickened"
        );
    }
}

/// Rewrite decision for `iload`: pairs with a following `fast_iload` fuse
/// to `fast_iload2`, with `caload` to `fast_icaload`; a following plain
/// `iload` defers (it will quicken first), anything else gets `fast_iload`.
pub(super) fn quicken_iload(env: &Arc<VmEnv>, method: &Method, mid: MethodId, bci: usize) {
    let next_bci = bci + 2;
    let next = if next_bci < method.code_len() {
        method.code_byte(next_bci)
    } else {
        bc::NOP
    };
    if next == bc::ILOAD {
        return;
    }
    let target = match next {
        bc::FAST_ILOAD => bc::FAST_ILOAD2,
        bc::CALOAD => bc::FAST_ICALOAD,
        _ => bc::FAST_ILOAD,
    };
    patch_bytecode(env, method, mid, bci, target);
}

/// Rewrite decision for `aload_0`: fuses with an already-quickened
/// `getfield` into the `fast_*access_0` forms; a not-yet-quickened
/// `getfield` defers, anything else gets `fast_aload_0`.
pub(super) fn quicken_aload_0(env: &Arc<VmEnv>, method: &Method, mid: MethodId, bci: usize) {
    if !env.config.rewrite_frequent_pairs {
        return;
    }
    let next_bci = bci + 1;
    let next = if next_bci < method.code_len() {
        method.code_byte(next_bci)
    } else {
        bc::NOP
    };
    if next == bc::GETFIELD {
        return;
    }
    let target = match next {
        bc::FAST_IGETFIELD => bc::FAST_IACCESS_0,
        bc::FAST_AGETFIELD => bc::FAST_AACCESS_0,
        bc::FAST_FGETFIELD => bc::FAST_FACCESS_0,
        _ => bc::FAST_ALOAD_0,
    };
    patch_bytecode(env, method, mid, bci, target);
}

pub(super) fn fast_getfield_code(tos: TosState) -> u8 {
    match tos {
        TosState::Btos | TosState::Ztos => bc::FAST_BGETFIELD,
        TosState::Ctos => bc::FAST_CGETFIELD,
        TosState::Stos => bc::FAST_SGETFIELD,
        TosState::Itos => bc::FAST_IGETFIELD,
        TosState::Ltos => bc::FAST_LGETFIELD,
        TosState::Ftos => bc::FAST_FGETFIELD,
        TosState::Dtos => bc::FAST_DGETFIELD,
        TosState::Atos => bc::FAST_AGETFIELD,
        TosState::Vtos => bc::GETFIELD,
    }
}

pub(super) fn fast_putfield_code(tos: TosState) -> u8 {
    match tos {
        TosState::Btos => bc::FAST_BPUTFIELD,
        TosState::Ztos => bc::FAST_ZPUTFIELD,
        TosState::Ctos => bc::FAST_CPUTFIELD,
        TosState::Stos => bc::FAST_SPUTFIELD,
        TosState::Itos => bc::FAST_IPUTFIELD,
        TosState::Ltos => bc::FAST_LPUTFIELD,
        TosState::Ftos => bc::FAST_FPUTFIELD,
        TosState::Dtos => bc::FAST_DPUTFIELD,
        TosState::Atos => bc::FAST_APUTFIELD,
        TosState::Vtos => bc::PUTFIELD,
    }
}
