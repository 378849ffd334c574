//! Link-time bytecode rewriting.
//!
//! Runs once per method when its klass registers: constant-pool operand
//! indices of field/invoke sites become native-order constant-pool-cache
//! indices (allocating the cache entries as it goes), `lookupswitch`
//! becomes its linear or binary fast variant by pair count, object-loading
//! `ldc` sites become `fast_aldc`, and the root constructor's `return`
//! becomes `return_register_finalizer`. Quickening proper happens later, at
//! execution time.

use anyhow::{bail, Result};

use crate::interp::bytecodes as bc;
use crate::interp::cpcache::CpCacheBuilder;
use crate::value::TosState;

use super::method::Method;
use super::pool::{ConstantPool, PoolConstant};

/// `lookupswitch` pair count below which a linear scan beats the binary
/// search.
const BINARY_SWITCH_THRESHOLD: usize = 5;

pub fn rewrite_method(
    method: &Method,
    pool: &ConstantPool,
    cache_builder: &mut CpCacheBuilder,
) -> Result<()> {
    let mut bci = 0;
    while bci < method.code_len() {
        let op = method.code_byte(bci);
        let len = bc::length_at(bci, |i| method.code_byte(i), |i| method.java_u4(i));
        match op {
            bc::GETFIELD
            | bc::PUTFIELD
            | bc::NOFAST_GETFIELD
            | bc::NOFAST_PUTFIELD
            | bc::GETSTATIC
            | bc::PUTSTATIC
            | bc::INVOKEVIRTUAL
            | bc::INVOKESPECIAL
            | bc::INVOKESTATIC
            | bc::INVOKEINTERFACE
            | bc::INVOKEHANDLE => {
                let cp_index = method.java_u2(bci + 1);
                check_index(pool, cp_index, method, bci)?;
                let cache_index = cache_builder.add(cp_index);
                method.write_native_u2(bci + 1, cache_index);
            }
            bc::INVOKEDYNAMIC => {
                let cp_index = method.java_u2(bci + 1);
                check_index(pool, cp_index, method, bci)?;
                let cache_index = cache_builder.add(cp_index);
                method.write_native_u4(bci + 1, cache_index as u32);
            }
            bc::LOOKUPSWITCH => {
                let aligned = bc::align_up4(bci + 1);
                let npairs = method.java_u4(aligned + 4) as usize;
                let fast = if npairs < BINARY_SWITCH_THRESHOLD {
                    bc::FAST_LINEARSWITCH
                } else {
                    bc::FAST_BINARYSWITCH
                };
                method.patch_code_byte(bci, fast);
            }
            bc::LDC => {
                let cp_index = method.code_byte(bci + 1) as u16;
                check_index(pool, cp_index, method, bci)?;
                if is_object_constant(pool, cp_index) {
                    method.patch_code_byte(bci, bc::FAST_ALDC);
                }
            }
            bc::LDC_W => {
                let cp_index = method.java_u2(bci + 1);
                check_index(pool, cp_index, method, bci)?;
                if is_object_constant(pool, cp_index) {
                    method.patch_code_byte(bci, bc::FAST_ALDC_W);
                    method.write_native_u2(bci + 1, cp_index);
                }
            }
            bc::RETURN if method.register_finalizer_on_return => {
                method.patch_code_byte(bci, bc::RETURN_REGISTER_FINALIZER);
            }
            _ => {}
        }
        bci += len;
    }
    Ok(())
}

/// Strings and reference-typed dynamic constants resolve through the
/// resolved-references array; those are the `fast_aldc` candidates.
fn is_object_constant(pool: &ConstantPool, cp_index: u16) -> bool {
    matches!(
        pool.constant(cp_index),
        PoolConstant::String(_) | PoolConstant::Dynamic { tos: TosState::Atos, .. }
    )
}

fn check_index(pool: &ConstantPool, cp_index: u16, method: &Method, bci: usize) -> Result<()> {
    if cp_index as usize >= pool.len() {
        bail!(
            "method {} bci {}: constant index {} outside pool of {}",
            method.name,
            bci,
            cp_index,
            pool.len()
        );
    }
    Ok(())
}
