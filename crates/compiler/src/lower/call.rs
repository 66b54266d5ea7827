//! Function call lowering.
//!
//! The callee comes out of a location: a direct function or method, a
//! function-pointer value, a closure value, or a protocol-method slot. The
//! return convention is decided against the data layout: large returns get
//! a hidden leading `addr` parameter, the IR return type becomes `void`,
//! and the caller owns the result slot.

use crate::ast::NodeId;
use crate::ssa::{self, Instruction, Opcode, Operand};
use crate::symbols::FuncId;
use crate::types::Type;

use super::storage::{StorageHints, StoredValue};
use super::{expr, location, LowerCtx, LowerError};

/// Emits a direct call to a known function with already-built arguments.
/// Used by string/array/map literals, coercions, operator overloads, `for`
/// iteration and destructor invocation.
pub fn build_direct_call(
    ctx: &mut LowerCtx,
    func: FuncId,
    args: Vec<Operand>,
) -> StoredValue {
    build_direct_call_impl(ctx, func, args, None)
}

pub fn build_direct_call_into(
    ctx: &mut LowerCtx,
    func: FuncId,
    args: Vec<Operand>,
    dst: Operand,
) -> StoredValue {
    build_direct_call_impl(ctx, func, args, Some(dst))
}

fn build_direct_call_impl(
    ctx: &mut LowerCtx,
    func: FuncId,
    args: Vec<Operand>,
    dst: Option<Operand>,
) -> StoredValue {
    let return_lang = ctx.unit.function(func).return_type.clone();
    let return_ty = ctx.build_type(&return_lang);
    let return_by_ref = ctx.layout.is_return_by_ref(return_ty);

    let callee_ty = if return_by_ref { ssa::VOID } else { return_ty };
    let mut operands = vec![ctx.func_operand(func, callee_ty)];

    if return_by_ref {
        let dst = match dst {
            Some(dst) => dst.with_type(ssa::ADDR),
            None => {
                let slot = ctx.append_alloca(return_ty);
                Operand::from_register(slot, ssa::ADDR)
            }
        };
        operands.push(dst.clone());
        operands.extend(args);
        ctx.emit(Instruction::new(Opcode::Call, operands));
        return StoredValue::reference(dst, return_ty);
    }

    operands.extend(args);

    if return_lang.is_void() {
        ctx.emit(Instruction::new(Opcode::Call, operands));
        return StoredValue::value(Operand::from_int_immediate(0, ssa::VOID));
    }

    let dest = match dst.as_ref().and_then(Operand::register) {
        Some(reg) => reg,
        None => ctx.next_reg(),
    };
    ctx.emit(Instruction::with_dest(Opcode::Call, dest, operands));
    StoredValue::value_reg(dest, return_ty)
}

/// Lowers a call expression node: children are the callee location followed
/// by the arguments. When `use_result` is false the call's value is
/// discarded and no destination register is assigned.
pub fn build_call_expr(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
    use_result: bool,
) -> Result<StoredValue, LowerError> {
    let callee_node = ctx.ast.child(node, 0);
    let arg_nodes: Vec<NodeId> = ctx.ast.children(node)[1..].to_vec();

    let call_location = ctx
        .ast
        .node(callee_node)
        .expr
        .location
        .clone()
        .ok_or_else(|| LowerError::MalformedInput("call without a resolved callee".to_string()))?;

    let lowered = location::build_location(ctx, &call_location, false)?;

    let location_ty = call_location.ty().clone();
    let fn_ty = location_ty
        .function_type()
        .cloned()
        .ok_or_else(|| LowerError::MalformedInput("callee is not callable".to_string()))?;

    let return_ty = ctx.build_type(&fn_ty.ret);
    let return_by_ref = ctx.layout.is_return_by_ref(return_ty);
    let is_method = lowered
        .func
        .map(|func| ctx.unit.function(func).modifiers.method)
        .unwrap_or(lowered.is_proto_method);

    let callee_ty = if return_by_ref { ssa::VOID } else { return_ty };
    let mut operands = Vec::new();

    if let Some(func) = lowered.func {
        operands.push(ctx.func_operand(func, callee_ty));
    } else {
        match location_ty {
            Type::Closure(_) => {
                // Field 0 of the closure record is the lifted function.
                let closure_ptr = lowered.value.clone().turn_into_reference(ctx);
                let fn_ptr_reg =
                    ctx.append_memberptr(closure_ptr.value_type, closure_ptr.ptr(), 0);
                let fn_ptr = ctx.append_load(
                    ssa::ADDR,
                    Operand::from_register(fn_ptr_reg, ssa::ADDR),
                );
                operands.push(fn_ptr.with_type(callee_ty));
            }
            _ => {
                // Function pointer (or protocol method slot): the location's
                // storage holds the address.
                let fn_ptr = ctx.append_load(ssa::ADDR, lowered.value.value_or_ptr.clone());
                operands.push(fn_ptr.with_type(callee_ty));
            }
        }
    }

    // Hidden return slot.
    let mut return_slot = None;
    if return_by_ref {
        let slot = StoredValue::alloc(return_ty, hints, ctx);
        operands.push(slot.ptr());
        return_slot = Some(slot);
    }

    // Receiver or closure context.
    if is_method {
        let receiver = lowered
            .self_value
            .as_ref()
            .ok_or_else(|| LowerError::MalformedInput("method call without receiver".to_string()))?
            .clone();
        let operand = if receiver.reference {
            ctx.append_load(receiver.value_type, receiver.ptr())
        } else {
            receiver.direct()
        };
        operands.push(operand);
    } else if matches!(location_ty, Type::Closure(_)) {
        let closure_ptr = lowered.value.clone().turn_into_reference(ctx);
        let ctx_ptr_reg = ctx.append_memberptr(closure_ptr.value_type, closure_ptr.ptr(), 1);
        let ctx_ptr = ctx.append_load(
            ssa::ADDR,
            Operand::from_register(ctx_ptr_reg, ssa::ADDR),
        );
        operands.push(ctx_ptr);
    }

    // Arguments: pass-by-reference parameters receive pointers, everything
    // else is loaded into value form.
    for arg_node in arg_nodes {
        let value = expr::build_into_value_if_possible(ctx, arg_node)?;
        operands.push(value.value_or_ptr);
    }

    if return_by_ref {
        ctx.emit(Instruction::new(Opcode::Call, operands));
        return Ok(return_slot.expect("return slot missing"));
    }

    if !use_result || fn_ty.ret.is_void() {
        ctx.emit(Instruction::new(Opcode::Call, operands));
        return Ok(StoredValue::value(Operand::from_int_immediate(0, ssa::VOID)));
    }

    let dest = match hints.dst.as_ref().and_then(Operand::register) {
        Some(reg) => reg,
        None => ctx.next_reg(),
    };
    ctx.emit(Instruction::with_dest(Opcode::Call, dest, operands));
    Ok(StoredValue::value_reg(dest, return_ty))
}
