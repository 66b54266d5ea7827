//! Control-flow statement lowering: `if` chains, `while`, `for`, `switch`
//! over tagged unions and `try` over Optional/Result values.

use crate::ast::{NodeId, NodeKind};
use crate::ssa::{self, Comparison, Instruction, Opcode, Operand};
use crate::types::Type;

use super::storage::StoredValue;
use super::{bool_expr, call, expr, func, LowerCtx, LowerError};

/// A sequence of condition blocks feeding `then` blocks that all join in a
/// common end block; the boolean lowering threads the branch targets
/// directly so no condition value materializes.
pub fn lower_if_chain(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let chain_id = ctx.next_if_chain_id();
    let end_block = ctx.create_block(format!("if.end.{}", chain_id));

    let branches = ctx.ast.children(node).to_vec();
    for (index, branch) in branches.iter().enumerate() {
        match ctx.ast.node(*branch).kind.clone() {
            NodeKind::If | NodeKind::ElseIf => {
                let condition = ctx.ast.child(*branch, 0);
                let block = ctx.ast.child(*branch, 1);

                let then_block =
                    ctx.create_block(format!("if.then.{}.{}", chain_id, index));
                let next_block = if index == branches.len() - 1 {
                    end_block
                } else {
                    match ctx.ast.node(branches[index + 1]).kind {
                        NodeKind::Else => ctx.create_block(format!("if.else.{}", chain_id)),
                        _ => ctx.create_block(format!("if.condition.{}.{}", chain_id, index + 1)),
                    }
                };

                bool_expr::build(ctx, condition, then_block, next_block)?;
                ctx.enter_block(then_block);
                func::lower_block(ctx, block, None)?;
                ctx.append_jmp(end_block);

                if next_block != end_block {
                    ctx.enter_block(next_block);
                }
            }
            NodeKind::Else => {
                let block = ctx.ast.child(*branch, 0);
                func::lower_block(ctx, block, None)?;
                ctx.append_jmp(end_block);
            }
            _ => {
                return Err(LowerError::MalformedInput(
                    "unexpected node in an if chain".to_string(),
                ));
            }
        }
    }

    ctx.enter_block(end_block);
    Ok(())
}

/// Three blocks: the condition in the entry, the body with a back edge to
/// the entry, and the exit. `break` and `continue` target exit and entry.
pub fn lower_while(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let condition = ctx.ast.child(node, 0);
    let body = ctx.ast.child(node, 1);

    let id = ctx.next_while_id();
    let entry = ctx.create_block(format!("while.entry.{}", id));
    let then_block = ctx.create_block(format!("while.block.{}", id));
    let exit = ctx.create_block(format!("while.exit.{}", id));

    ctx.push_loop_scope(entry, exit);

    ctx.append_jmp(entry);
    ctx.enter_block(entry);
    bool_expr::build(ctx, condition, then_block, exit)?;

    ctx.enter_block(then_block);
    func::lower_block(ctx, body, None)?;
    ctx.append_jmp(entry);

    ctx.enter_block(exit);
    ctx.pop_loop_scope();
    Ok(())
}

pub fn lower_for(ctx: &mut LowerCtx, node: NodeId, by_ref: bool) -> Result<(), LowerError> {
    let iterable = ctx.ast.child(node, 1);

    if matches!(ctx.ast.node(iterable).kind, NodeKind::Range) {
        lower_range_for(ctx, node)
    } else {
        lower_iter_for(ctx, node, by_ref)
    }
}

/// Counted loop over an integer range: induction counter in a slot,
/// compared against the end bound with `ne`, incremented at the bottom.
fn lower_range_for(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let var_node = ctx.ast.child(node, 0);
    let range = ctx.ast.child(node, 1);
    let body = ctx.ast.child(node, 2);

    let start = ctx.ast.child(range, 0);
    let end = ctx.ast.child(range, 1);

    let id = ctx.next_for_id();
    let entry = ctx.create_block(format!("for.entry.{}", id));
    let block = ctx.create_block(format!("for.block.{}", id));
    let exit = ctx.create_block(format!("for.exit.{}", id));

    ctx.push_loop_scope(entry, exit);
    func::alloc_block_locals(ctx, body);

    let var = func::bound_local(ctx, var_node)?;
    let counter_reg = *ctx
        .local_regs
        .get(&var)
        .expect("loop variable without a slot");
    let counter_lang = ctx.unit.local(var).ty.clone();
    let counter_ty = ctx.build_type(&counter_lang);
    let counter_ptr = Operand::from_register(counter_reg, ssa::ADDR);

    expr::build_and_store(ctx, start, counter_ptr.clone())?;

    ctx.append_jmp(entry);
    ctx.enter_block(entry);

    let counter = ctx.append_load(counter_ty, counter_ptr.clone());
    let end_value = expr::build_into_value_if_possible(ctx, end)?;
    ctx.append_cjmp(counter, Comparison::Ne, end_value.value_or_ptr, block, exit);

    ctx.enter_block(block);
    func::build_block_children(ctx, body)?;

    let counter = ctx.append_load(counter_ty, counter_ptr.clone());
    let inc_reg = ctx.next_reg();
    ctx.emit(Instruction::with_dest(
        Opcode::Add,
        inc_reg,
        vec![counter, Operand::from_int_immediate(1, counter_ty)],
    ));
    ctx.append_store(Operand::from_register(inc_reg, counter_ty), counter_ptr);

    ctx.append_jmp(entry);
    ctx.enter_block(exit);
    ctx.pop_loop_scope();
    Ok(())
}

/// Iterator protocol: `__iter__` yields the iterator, `__next__` a pointer
/// to the next element or null when exhausted. The element is copied or
/// aliased into the loop variable depending on the iteration mode.
fn lower_iter_for(ctx: &mut LowerCtx, node: NodeId, by_ref: bool) -> Result<(), LowerError> {
    let var_node = ctx.ast.child(node, 0);
    let iterable_node = ctx.ast.child(node, 1);
    let body = ctx.ast.child(node, 2);

    let id = ctx.next_for_id();
    let entry = ctx.create_block(format!("for.entry.{}", id));
    let block = ctx.create_block(format!("for.block.{}", id));
    let exit = ctx.create_block(format!("for.exit.{}", id));

    ctx.push_loop_scope(entry, exit);
    func::alloc_block_locals(ctx, body);

    let iterable_ty = ctx.ast.ty(iterable_node).clone();
    let iterable = expr::build_into_ptr(ctx, iterable_node)?;

    let iter_func = ctx
        .unit
        .method_of(&iterable_ty, "__iter__")
        .ok_or_else(|| LowerError::MalformedInput("iterable without __iter__".to_string()))?;
    let iterator = call::build_direct_call(ctx, iter_func, vec![iterable.ptr()])
        .turn_into_reference(ctx);

    let iter_ty = ctx.unit.function(iter_func).return_type.clone();
    let next_func = ctx
        .unit
        .method_of(&iter_ty, "__next__")
        .ok_or_else(|| LowerError::MalformedInput("iterator without __next__".to_string()))?;

    ctx.append_jmp(entry);
    ctx.enter_block(entry);

    let next_ptr = call::build_direct_call(ctx, next_func, vec![iterator.ptr()]).direct();
    let null = Operand::from_int_immediate(0, ssa::ADDR);
    ctx.append_cjmp(next_ptr.clone(), Comparison::Ne, null, block, exit);

    ctx.enter_block(block);

    let var = func::bound_local(ctx, var_node)?;
    let var_reg = *ctx
        .local_regs
        .get(&var)
        .expect("loop variable without a slot");
    let var_lang = ctx.unit.local(var).ty.clone();
    let var_ty = ctx.build_type(&var_lang);
    let var_ptr = Operand::from_register(var_reg, ssa::ADDR);

    if by_ref {
        ctx.append_store(next_ptr, var_ptr);
    } else {
        StoredValue::reference(next_ptr, var_ty).copy_to(&var_ptr, ctx);
    }

    func::build_block_children(ctx, body)?;

    ctx.append_jmp(entry);
    ctx.enter_block(exit);
    ctx.pop_loop_scope();
    Ok(())
}

/// Switch over a tagged union: load the tag, compare against each case's
/// discriminant, copy the payload into the bound variable on a match.
pub fn lower_switch(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let value_node = ctx.ast.child(node, 0);
    let cases: Vec<NodeId> = ctx.ast.children(node)[1..].to_vec();

    let id = ctx.next_switch_id();

    let value = expr::build_into_ptr(ctx, value_node)?;
    let tag_reg = ctx.append_memberptr(value.value_type, value.ptr(), 0);
    let tag = ctx.append_load(ssa::I32, Operand::from_register(tag_reg, ssa::ADDR));

    let data_reg = ctx.append_memberptr(value.value_type, value.ptr(), 1);
    let data_ptr = Operand::from_register(data_reg, ssa::ADDR);

    let exit = ctx.create_block(format!("switch.exit.{}", id));

    for (index, case) in cases.iter().enumerate() {
        let else_block = if index == cases.len() - 1 {
            exit
        } else {
            ctx.create_block(format!("switch.else.{}.{}", id, index))
        };

        if matches!(ctx.ast.node(*case).kind, NodeKind::SwitchDefault) {
            let block = ctx.ast.child(*case, 0);
            func::lower_block(ctx, block, None)?;
            ctx.append_jmp(exit);
            ctx.enter_block(else_block);
            continue;
        }

        let name_node = ctx.ast.child(*case, 0);
        let type_node = ctx.ast.child(*case, 1);
        let block = ctx.ast.child(*case, 2);

        let Type::UnionCase(union_id, case_index) = ctx.ast.ty(type_node).clone() else {
            return Err(LowerError::MalformedInput(
                "switch case without a union case type".to_string(),
            ));
        };

        let then_block = ctx.create_block(format!("switch.then.{}.{}", id, index));
        let case_tag = Operand::from_int_immediate(case_index as i128, ssa::I32);
        ctx.append_cjmp(tag.clone(), Comparison::Eq, case_tag, then_block, else_block);

        ctx.enter_block(then_block);

        func::alloc_block_locals(ctx, block);

        // Bind the payload before the case body runs.
        let bound = func::bound_local(ctx, name_node)?;
        let bound_reg = *ctx
            .local_regs
            .get(&bound)
            .expect("switch binding without a slot");
        let case_struct = ctx.union_case_struct(union_id, case_index);
        let case_ty = ssa::Type::structure(case_struct);
        ctx.append_copy(
            Operand::from_register(bound_reg, ssa::ADDR),
            data_ptr.clone(),
            case_ty,
        );

        func::lower_block(ctx, block, None)?;
        ctx.append_jmp(exit);
        ctx.enter_block(else_block);
    }

    Ok(())
}

/// `try` over Optional/Result: inspect the success flag, bind the value or
/// the error, run the matching block, join at the exit.
pub fn lower_try(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let id = ctx.next_switch_id();
    let success_block = ctx.create_block(format!("try.success.{}", id));
    let exit = ctx.create_block(format!("try.exit.{}", id));

    let cases = ctx.ast.children(node).to_vec();
    let mut value: Option<StoredValue> = None;

    for (index, case) in cases.iter().enumerate() {
        let next_block = if index == cases.len() - 1 {
            exit
        } else {
            match ctx.ast.node(cases[index + 1]).kind {
                NodeKind::TryError => ctx.create_block(format!("try.error.{}", id)),
                NodeKind::TryElse => ctx.create_block(format!("try.else.{}", id)),
                _ => exit,
            }
        };

        match ctx.ast.node(*case).kind.clone() {
            NodeKind::TrySuccess => {
                let var_node = ctx.ast.child(*case, 0);
                let value_node = ctx.ast.child(*case, 1);
                let block = ctx.ast.child(*case, 2);

                let stored = expr::build_into_ptr(ctx, value_node)?;
                let flag_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 0);
                let flag = ctx.append_load(ssa::I8, Operand::from_register(flag_reg, ssa::ADDR));

                let false_value = Operand::from_int_immediate(0, ssa::I8);
                ctx.append_cjmp(flag, Comparison::Eq, false_value, next_block, success_block);

                ctx.enter_block(success_block);

                let value_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 1);
                let value_ptr = Operand::from_register(value_reg, ssa::ADDR);

                func::alloc_block_locals(ctx, block);
                let bound = func::bound_local(ctx, var_node)?;
                let bound_reg = *ctx
                    .local_regs
                    .get(&bound)
                    .expect("try binding without a slot");
                let bound_lang = ctx.unit.local(bound).ty.clone();
                let bound_ty = ctx.build_type(&bound_lang);
                StoredValue::reference(value_ptr, bound_ty)
                    .copy_to(&Operand::from_register(bound_reg, ssa::ADDR), ctx);

                func::lower_block(ctx, block, None)?;
                ctx.append_jmp(exit);

                value = Some(stored);
            }
            NodeKind::TryError => {
                let var_node = ctx.ast.child(*case, 0);
                let block = ctx.ast.child(*case, 1);

                let stored = value.clone().ok_or_else(|| {
                    LowerError::MalformedInput("error case before success case".to_string())
                })?;

                let error_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 2);
                let error_ptr = Operand::from_register(error_reg, ssa::ADDR);

                func::alloc_block_locals(ctx, block);
                let bound = func::bound_local(ctx, var_node)?;
                let bound_reg = *ctx
                    .local_regs
                    .get(&bound)
                    .expect("try binding without a slot");
                let bound_lang = ctx.unit.local(bound).ty.clone();
                let bound_ty = ctx.build_type(&bound_lang);
                StoredValue::reference(error_ptr, bound_ty)
                    .copy_to(&Operand::from_register(bound_reg, ssa::ADDR), ctx);

                func::lower_block(ctx, block, None)?;
                ctx.append_jmp(exit);
            }
            NodeKind::TryElse => {
                let block = ctx.ast.child(*case, 0);
                func::lower_block(ctx, block, None)?;
                ctx.append_jmp(exit);
            }
            _ => {
                return Err(LowerError::MalformedInput(
                    "unexpected node in a try statement".to_string(),
                ));
            }
        }

        if next_block != exit || index == cases.len() - 1 {
            ctx.enter_block(next_block);
        }
    }

    if !cases.is_empty() {
        // Ensure the lowering continues in the exit block.
        ctx.enter_block(exit);
    }

    Ok(())
}
