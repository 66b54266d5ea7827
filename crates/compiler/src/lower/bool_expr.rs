//! Short-circuit boolean lowering.
//!
//! Conditions are lowered against a pair of successor blocks instead of
//! materializing a value: `&&` and `||` thread the targets through their
//! operands, `!` swaps them, comparisons emit a `cjmp`/`fcjmp` directly.
//! Only when a boolean is consumed as a value does the expression lowerer
//! wrap this in store-1/store-0 blocks.

use crate::ast::{BinaryOp, NodeId, NodeKind};
use crate::ssa::{BlockId, Comparison, Operand};
use crate::types::Type;

use super::{expr, LowerCtx, LowerError};

pub fn build(
    ctx: &mut LowerCtx,
    node: NodeId,
    true_block: BlockId,
    false_block: BlockId,
) -> Result<(), LowerError> {
    match ctx.ast.node(node).kind.clone() {
        NodeKind::True => {
            ctx.append_jmp(true_block);
            Ok(())
        }
        NodeKind::False => {
            ctx.append_jmp(false_block);
            Ok(())
        }
        NodeKind::Binary(BinaryOp::And) => {
            let id = ctx.next_and_id();
            let rhs_block = ctx.create_block(format!("and.right.{}", id));
            let lhs = ctx.ast.child(node, 0);
            let rhs = ctx.ast.child(node, 1);

            build(ctx, lhs, rhs_block, false_block)?;
            ctx.enter_block(rhs_block);
            build(ctx, rhs, true_block, false_block)
        }
        NodeKind::Binary(BinaryOp::Or) => {
            let id = ctx.next_or_id();
            let rhs_block = ctx.create_block(format!("or.right.{}", id));
            let lhs = ctx.ast.child(node, 0);
            let rhs = ctx.ast.child(node, 1);

            build(ctx, lhs, true_block, rhs_block)?;
            ctx.enter_block(rhs_block);
            build(ctx, rhs, true_block, false_block)
        }
        NodeKind::Not => {
            let inner = ctx.ast.child(node, 0);
            build(ctx, inner, false_block, true_block)
        }
        NodeKind::Binary(op) if op.is_comparison() => {
            build_comparison(ctx, node, op, true_block, false_block)
        }
        _ => {
            let value = expr::build_into_value(ctx, node)?.direct();
            build_bool_eval(ctx, value, true_block, false_block);
            Ok(())
        }
    }
}

fn build_comparison(
    ctx: &mut LowerCtx,
    node: NodeId,
    op: BinaryOp,
    true_block: BlockId,
    false_block: BlockId,
) -> Result<(), LowerError> {
    let lhs_node = ctx.ast.child(node, 0);
    let rhs_node = ctx.ast.child(node, 1);
    let lhs_ty = ctx.ast.ty(lhs_node).clone();

    // Struct comparisons go through the overloaded operator and test its
    // boolean result.
    if matches!(lhs_ty, Type::Struct(_)) {
        let value = expr::build_into_value(ctx, node)?.direct();
        build_bool_eval(ctx, value, true_block, false_block);
        return Ok(());
    }

    let lhs = expr::build_into_value(ctx, lhs_node)?.direct();
    let rhs = expr::build_into_value(ctx, rhs_node)?.direct();

    let is_fp = lhs.ty().is_floating_point();
    let is_unsigned = lhs_ty.is_unsigned_int();
    let comparison = select_comparison(op, is_fp, is_unsigned);

    ctx.append_cjmp(lhs, comparison, rhs, true_block, false_block);
    Ok(())
}

fn build_bool_eval(
    ctx: &mut LowerCtx,
    value: Operand,
    true_block: BlockId,
    false_block: BlockId,
) {
    let is_fp = value.ty().is_floating_point();
    let comparison = if is_fp { Comparison::Fne } else { Comparison::Ne };
    let zero = if is_fp {
        Operand::from_fp_immediate(0.0, value.ty())
    } else {
        Operand::from_int_immediate(0, value.ty())
    };

    ctx.append_cjmp(value, comparison, zero, true_block, false_block);
}

fn select_comparison(op: BinaryOp, is_fp: bool, is_unsigned: bool) -> Comparison {
    if is_fp {
        match op {
            BinaryOp::Eq => Comparison::Feq,
            BinaryOp::Ne => Comparison::Fne,
            BinaryOp::Gt => Comparison::Fgt,
            BinaryOp::Ge => Comparison::Fge,
            BinaryOp::Lt => Comparison::Flt,
            BinaryOp::Le => Comparison::Fle,
            _ => unreachable!("non-comparison operator"),
        }
    } else if is_unsigned {
        match op {
            BinaryOp::Eq => Comparison::Eq,
            BinaryOp::Ne => Comparison::Ne,
            BinaryOp::Gt => Comparison::Ugt,
            BinaryOp::Ge => Comparison::Uge,
            BinaryOp::Lt => Comparison::Ult,
            BinaryOp::Le => Comparison::Ule,
            _ => unreachable!("non-comparison operator"),
        }
    } else {
        match op {
            BinaryOp::Eq => Comparison::Eq,
            BinaryOp::Ne => Comparison::Ne,
            BinaryOp::Gt => Comparison::Sgt,
            BinaryOp::Ge => Comparison::Sge,
            BinaryOp::Lt => Comparison::Slt,
            BinaryOp::Le => Comparison::Sle,
            _ => unreachable!("non-comparison operator"),
        }
    }
}
