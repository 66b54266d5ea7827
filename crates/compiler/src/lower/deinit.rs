//! Destructor insertion.
//!
//! Each block that owns destructible values allocates a one-byte liveness
//! flag per value, initialized to 1. Moves store 0 through the flag (see
//! `expr::track_move`). At block exit every registered destructor runs
//! behind a flag check; sub-field destructors fire before the owning
//! value's.

use crate::ssa::{self, Comparison, Operand};
use crate::symbols::DeinitId;

use super::{call, location, LowerCtx, LowerError};

const FLAG_TYPE: ssa::Type = ssa::I8;

/// Allocates and sets the liveness flags for a block's destructible values.
pub fn init_flags(ctx: &mut LowerCtx, deinits: &[DeinitId]) {
    for &id in deinits {
        let flag = ctx.append_alloca(FLAG_TYPE);
        ctx.append_store(
            Operand::from_int_immediate(1, FLAG_TYPE),
            Operand::from_register(flag, ssa::ADDR),
        );
        ctx.deinit_flags.insert(id, flag);

        let children = ctx.unit.deinit(id).children.clone();
        init_flags(ctx, &children);
    }
}

/// Emits the flag-guarded destructor calls for a block's values, children
/// first.
pub fn build_exit_calls(ctx: &mut LowerCtx, deinits: &[DeinitId]) -> Result<(), LowerError> {
    for &id in deinits {
        let children = ctx.unit.deinit(id).children.clone();
        build_exit_calls(ctx, &children)?;
        build_cond_deinit_call(ctx, id)?;
    }

    Ok(())
}

fn build_cond_deinit_call(ctx: &mut LowerCtx, id: DeinitId) -> Result<(), LowerError> {
    let descriptor = ctx.unit.deinit(id);
    if descriptor.unmanaged || !descriptor.has_deinit {
        return Ok(());
    }

    let flag = *ctx
        .deinit_flags
        .get(&id)
        .expect("destructor without an allocated flag");

    let label = ctx.next_deinit_flag_id();
    let do_deinit = ctx.create_block(format!("deinit.do.{}", label));
    let skip_deinit = ctx.create_block(format!("deinit.skip.{}", label));

    let loaded = ctx.append_load(FLAG_TYPE, Operand::from_register(flag, ssa::ADDR));
    ctx.append_cjmp(
        loaded,
        Comparison::Eq,
        Operand::from_int_immediate(1, FLAG_TYPE),
        do_deinit,
        skip_deinit,
    );

    ctx.enter_block(do_deinit);
    build_deinit_call(ctx, id)?;
    ctx.append_jmp(skip_deinit);
    ctx.enter_block(skip_deinit);

    Ok(())
}

fn build_deinit_call(ctx: &mut LowerCtx, id: DeinitId) -> Result<(), LowerError> {
    let deinit_location = ctx.unit.deinit(id).location.clone();
    let value = location::build_location(ctx, &deinit_location, false)?.value;

    let value_ty = deinit_location.ty().clone();
    let func = ctx
        .unit
        .method_of(&value_ty, "__deinit__")
        .ok_or_else(|| {
            LowerError::MalformedInput("destructible value without __deinit__".to_string())
        })?;

    call::build_direct_call(ctx, func, vec![value.value_or_ptr]);
    Ok(())
}
