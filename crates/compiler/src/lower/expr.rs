//! Expression lowering.
//!
//! Every AST expression kind has one deterministic rule here. Implicit
//! coercions attached by the front-end are peeled outermost-first: wrapping
//! into `Optional`/`Result`, union-case-to-union injection and
//! struct-to-protocol fat pointers all happen before the node's own kind is
//! considered.

use crate::ast::{BinaryOp, NodeId, NodeKind};
use crate::diagnostics::{Diagnostic, Note, Severity};
use crate::ssa::{self, Instruction, Opcode, Operand};
use crate::symbols::LocationElementKind;
use crate::types::Type;

use super::storage::{StorageHints, StoredValue};
use super::{bool_expr, call, closure, conversion, location, LowerCtx, LowerError};

pub fn build(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    lower_node(ctx, node, &StorageHints::none(), 0)
}

pub fn build_with_hints(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    lower_node(ctx, node, hints, 0)
}

pub fn build_into_value(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    Ok(build(ctx, node)?.turn_into_value(ctx))
}

pub fn build_into_value_if_possible(
    ctx: &mut LowerCtx,
    node: NodeId,
) -> Result<StoredValue, LowerError> {
    Ok(build(ctx, node)?.try_turn_into_value(ctx))
}

pub fn build_into_ptr(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    Ok(lower_node(ctx, node, &StorageHints::prefer_reference(), 0)?.turn_into_reference(ctx))
}

pub fn build_and_store(
    ctx: &mut LowerCtx,
    node: NodeId,
    dst: Operand,
) -> Result<(), LowerError> {
    let value = lower_node(ctx, node, &StorageHints::into_dst(dst.clone()), 0)?;
    value.copy_to(&dst, ctx);
    Ok(())
}

/// The type this node has at the given coercion level: the node's own type
/// when no coercion applies, otherwise the chain entry.
fn effective_type(ctx: &LowerCtx, node: NodeId, level: usize) -> Type {
    let chain = &ctx.ast.node(node).expr.coercion_chain;
    if chain.is_empty() {
        ctx.ast.ty(node).clone()
    } else {
        chain[level].clone()
    }
}

fn is_coerced(ctx: &LowerCtx, node: NodeId, level: usize) -> bool {
    ctx.ast.node(node).expr.coercion_chain.len() >= level + 2
}

fn coercion_base(ctx: &LowerCtx, node: NodeId, level: usize) -> Type {
    ctx.ast.node(node).expr.coercion_chain[level + 1].clone()
}

pub(super) fn lower_node(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
    level: usize,
) -> Result<StoredValue, LowerError> {
    let lang_type = effective_type(ctx, node, level);

    if is_coerced(ctx, node, level) {
        let base = coercion_base(ctx, node, level);

        if ctx.unit.is_std_struct(&lang_type, "Optional") {
            return build_implicit_optional(ctx, node, &lang_type, level);
        }
        if ctx.unit.is_std_struct(&lang_type, "Result") {
            return build_implicit_result(ctx, node, &lang_type, &base, level);
        }
        if let (Type::Union(union_id), Type::UnionCase(_, case)) = (&lang_type, &base) {
            return build_union_coercion(ctx, node, *union_id, *case, hints, level);
        }
        if let (Type::Proto(proto), Type::Struct(struct_id)) = (&lang_type, &base) {
            return build_proto_coercion(ctx, node, *proto, *struct_id, hints, level);
        }
    }

    let kind = ctx.ast.node(node).kind.clone();
    match kind {
        NodeKind::IntLiteral(value) => {
            let ty = ctx.build_type(&lang_type);
            Ok(StoredValue::value(Operand::from_int_immediate(value, ty)))
        }
        NodeKind::FloatLiteral(value) => {
            let ty = ctx.build_type(&lang_type);
            Ok(StoredValue::value(Operand::from_fp_immediate(value, ty)))
        }
        NodeKind::CharLiteral(text) => {
            let mut index = 0;
            let byte = decode_char(text.as_bytes(), &mut index);
            Ok(StoredValue::value(Operand::from_int_immediate(
                byte as i128,
                ssa::I8,
            )))
        }
        NodeKind::True => Ok(StoredValue::value(Operand::from_int_immediate(1, ssa::I8))),
        NodeKind::False => Ok(StoredValue::value(Operand::from_int_immediate(0, ssa::I8))),
        NodeKind::Null | NodeKind::NoneLiteral => {
            Ok(StoredValue::value(Operand::from_int_immediate(0, ssa::ADDR)))
        }
        NodeKind::StringLiteral(text) => build_string_literal(ctx, node, &text, &lang_type, level),
        NodeKind::ArrayLiteral => build_array_literal(ctx, node, &lang_type, hints),
        NodeKind::MapLiteral => build_map_literal(ctx, node, &lang_type),
        NodeKind::TupleLiteral => build_tuple_literal(ctx, node, &lang_type, hints),
        NodeKind::StructLiteral => build_struct_literal(ctx, node, &lang_type, hints),
        NodeKind::Binary(op) if op.is_comparison() || op.is_logical() => {
            build_bool_materialization(ctx, node, hints)
        }
        NodeKind::Binary(op) => build_binary_operation(ctx, node, op, hints),
        NodeKind::Not => build_bool_materialization(ctx, node, hints),
        NodeKind::Neg => build_neg(ctx, node),
        NodeKind::AddressOf => {
            let inner = ctx.ast.child(node, 0);
            let value = lower_node(ctx, inner, &StorageHints::prefer_reference(), 0)?
                .turn_into_reference(ctx);
            Ok(StoredValue::value(value.ptr()))
        }
        NodeKind::Deref => build_deref(ctx, node),
        NodeKind::Identifier(_) | NodeKind::Dot | NodeKind::SelfLiteral => {
            let value = location::build_node_location(ctx, node, hints)?;
            track_move(ctx, node)?;
            Ok(value)
        }
        NodeKind::Index => build_index(ctx, node),
        NodeKind::Call => {
            let callee = ctx.ast.child(node, 0);
            let is_union_case = ctx
                .ast
                .node(callee)
                .expr
                .location
                .as_ref()
                .is_some_and(|location| {
                    matches!(location.last().kind, LocationElementKind::UnionCase(..))
                });

            if is_union_case {
                build_union_case_expr(ctx, node, hints)
            } else {
                call::build_call_expr(ctx, node, hints, true)
            }
        }
        NodeKind::Cast => {
            let inner = ctx.ast.child(node, 0);
            let from = ctx.ast.ty(inner).clone();
            let value = build_into_value(ctx, inner)?.direct();
            let converted = conversion::build(ctx, value, &from, &lang_type);
            Ok(StoredValue::value(converted))
        }
        NodeKind::Closure(func) => closure::build_closure(ctx, node, func, hints),
        NodeKind::SizeOf(ty) => {
            let ir_ty = ctx.build_type(&ty);
            let size = ctx.size_of(ir_ty);
            Ok(StoredValue::value(Operand::from_int_immediate(
                size as i128,
                ssa::I64,
            )))
        }
        other => Err(LowerError::MalformedInput(format!(
            "node kind {:?} in expression position",
            other
        ))),
    }
}

/// Use-after-move detection: the front-end marks moving expressions; the
/// first move clears the liveness flag, a second use is diagnosed with both
/// sites and aborts the function.
fn track_move(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    let Some(move_info) = ctx.ast.node(node).expr.moves else {
        return Ok(());
    };
    let range = ctx.ast.node(node).range;

    if let Some(previous) = ctx.previous_move(move_info.deinit) {
        ctx.diags.report(Diagnostic {
            severity: Severity::Error,
            message: "use of moved value".to_string(),
            range: Some(range),
            notes: vec![Note {
                message: "value was moved here".to_string(),
                range: Some(previous),
            }],
        });
        return Err(LowerError::UseAfterMove);
    }

    ctx.record_move(move_info.deinit, range);

    if let Some(&flag) = ctx.deinit_flags.get(&move_info.deinit) {
        ctx.append_store(
            Operand::from_int_immediate(0, ssa::I8),
            Operand::from_register(flag, ssa::ADDR),
        );
    }

    Ok(())
}

fn build_implicit_optional(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
    level: usize,
) -> Result<StoredValue, LowerError> {
    let struct_id = lang_type
        .struct_id()
        .expect("Optional coercion target is not a struct");

    if matches!(ctx.ast.node(node).kind, NodeKind::NoneLiteral) {
        let func = ctx.unit.assoc_of(struct_id, "new_none").ok_or_else(|| {
            LowerError::MalformedInput("Optional without new_none".to_string())
        })?;
        return Ok(call::build_direct_call(ctx, func, Vec::new()));
    }

    let value = lower_node(ctx, node, &StorageHints::none(), level + 1)?
        .try_turn_into_value(ctx);
    let func = ctx
        .unit
        .assoc_of(struct_id, "new_some")
        .ok_or_else(|| LowerError::MalformedInput("Optional without new_some".to_string()))?;
    Ok(call::build_direct_call(ctx, func, vec![value.value_or_ptr]))
}

fn build_implicit_result(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
    base: &Type,
    level: usize,
) -> Result<StoredValue, LowerError> {
    let struct_id = lang_type
        .struct_id()
        .expect("Result coercion target is not a struct");

    // The error type is the second generic argument of the Result instance.
    let error_ty = ctx
        .unit
        .structure(struct_id)
        .generic_instance_of
        .and_then(|(generic, index)| {
            ctx.unit
                .generic_struct(generic)
                .instances
                .get(index)
                .and_then(|instance| instance.args.get(1).cloned())
        });

    let is_error = error_ty.as_ref() == Some(base);
    let name = if is_error { "failure" } else { "success" };

    let value = lower_node(ctx, node, &StorageHints::none(), level + 1)?
        .try_turn_into_value(ctx);
    let func = ctx.unit.assoc_of(struct_id, name).ok_or_else(|| {
        LowerError::MalformedInput(format!("Result without {}", name))
    })?;
    Ok(call::build_direct_call(ctx, func, vec![value.value_or_ptr]))
}

/// Union-case-to-union injection: store the tag, then lower the payload
/// straight into the data slot.
fn build_union_coercion(
    ctx: &mut LowerCtx,
    node: NodeId,
    union_id: crate::symbols::UnionId,
    case: usize,
    hints: &StorageHints,
    level: usize,
) -> Result<StoredValue, LowerError> {
    let union_ty = ctx.build_type(&Type::Union(union_id));
    let stored = StoredValue::alloc(union_ty, hints, ctx);

    let tag_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 0);
    ctx.append_store(
        Operand::from_int_immediate(case as i128, ssa::I32),
        Operand::from_register(tag_reg, ssa::ADDR),
    );

    let data_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 1);
    let data_ptr = Operand::from_register(data_reg, ssa::ADDR);
    let payload = lower_node(ctx, node, &StorageHints::into_dst(data_ptr.clone()), level + 1)?;
    payload.copy_to(&data_ptr, ctx);

    Ok(stored)
}

/// Struct-to-protocol coercion builds the fat pointer: the value's address
/// in field 0, the struct's resolved vtable in field 1.
fn build_proto_coercion(
    ctx: &mut LowerCtx,
    node: NodeId,
    proto: crate::symbols::ProtoId,
    struct_id: crate::symbols::StructId,
    hints: &StorageHints,
    level: usize,
) -> Result<StoredValue, LowerError> {
    let fat_struct = ctx.fat_pointer_struct(proto);
    let fat_ty = ssa::Type::structure(fat_struct);
    let stored = StoredValue::alloc(fat_ty, hints, ctx);

    let inner = lower_node(ctx, node, &StorageHints::prefer_reference(), level + 1)?
        .turn_into_reference(ctx);

    let vtable_global = ctx
        .unit
        .structure(struct_id)
        .proto_impls
        .iter()
        .find(|impl_| impl_.proto == proto)
        .map(|impl_| impl_.vtable_global.clone())
        .ok_or_else(|| {
            LowerError::MalformedInput("protocol coercion without an implementation".to_string())
        })?;

    let self_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 0);
    ctx.append_store(inner.ptr(), Operand::from_register(self_reg, ssa::ADDR));

    let vtable_reg = ctx.append_memberptr(stored.value_type, stored.ptr(), 1);
    ctx.append_store(
        Operand::Global(vtable_global, ssa::ADDR),
        Operand::from_register(vtable_reg, ssa::ADDR),
    );

    Ok(stored)
}

fn build_string_literal(
    ctx: &mut LowerCtx,
    _node: NodeId,
    text: &str,
    lang_type: &Type,
    _level: usize,
) -> Result<StoredValue, LowerError> {
    let cstr = build_cstr_literal(ctx, text);

    // A literal whose coercion target is the standard String struct goes
    // through its `from` constructor; otherwise it stays a raw pointer.
    if let Some(struct_id) = lang_type.struct_id()
        && ctx.unit.is_std_struct(lang_type, "String")
    {
        let func = ctx.unit.assoc_of(struct_id, "from").ok_or_else(|| {
            LowerError::MalformedInput("String without a from constructor".to_string())
        })?;
        return Ok(call::build_direct_call(ctx, func, vec![cstr.value_or_ptr]));
    }

    Ok(cstr)
}

fn build_cstr_literal(ctx: &mut LowerCtx, text: &str) -> StoredValue {
    let bytes = text.as_bytes();
    let mut encoded = Vec::with_capacity(bytes.len() + 1);
    let mut index = 0;
    while index < bytes.len() {
        encoded.push(decode_char(bytes, &mut index));
    }
    encoded.push(0);

    let name = ctx.next_string_name();
    ctx.module.globals.push(ssa::Global {
        name: name.clone(),
        ty: ssa::ADDR,
        initial: Operand::Bytes(encoded),
        external: false,
    });

    StoredValue::value(Operand::Global(name, ssa::ADDR))
}

fn decode_char(bytes: &[u8], index: &mut usize) -> u8 {
    let c = bytes[*index];
    *index += 1;

    if c != b'\\' || *index >= bytes.len() {
        return c;
    }

    let escaped = bytes[*index];
    *index += 1;
    match escaped {
        b'n' => 0x0a,
        b'r' => 0x0d,
        b't' => 0x09,
        b'0' => 0x00,
        b'\\' => b'\\',
        b'x' => {
            let hex = &bytes[*index..*index + 2];
            *index += 2;
            let text = std::str::from_utf8(hex).unwrap_or("0");
            u8::from_str_radix(text, 16).unwrap_or(0)
        }
        other => other,
    }
}

fn build_array_literal(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    match lang_type {
        Type::StaticArray(element, _) => {
            let element = element.as_ref().clone();
            let ty = ctx.build_type(lang_type);
            let stored = StoredValue::alloc(ty, hints, ctx);
            let element_ty = ctx.build_type(&element);

            let children = ctx.ast.children(node).to_vec();
            for (index, child) in children.into_iter().enumerate() {
                let slot = ctx.append_offsetptr(
                    stored.ptr(),
                    Operand::from_int_immediate(index as i128, ctx.layout.usize_type()),
                    element_ty,
                );
                build_and_store(ctx, child, Operand::from_register(slot, ssa::ADDR))?;
            }

            Ok(stored)
        }
        Type::Struct(struct_id) => {
            // Dynamic array: `sized(n)` then `set(i, element)`.
            let struct_id = *struct_id;
            let children = ctx.ast.children(node).to_vec();

            let create = ctx.unit.assoc_of(struct_id, "sized").ok_or_else(|| {
                LowerError::MalformedInput("array struct without sized".to_string())
            })?;
            let count = Operand::from_int_immediate(children.len() as i128, ssa::I32);
            let stored = match &hints.dst {
                Some(dst) => call::build_direct_call_into(ctx, create, vec![count], dst.clone()),
                None => call::build_direct_call(ctx, create, vec![count]),
            };

            let set = ctx
                .unit
                .method_of(lang_type, "set")
                .ok_or_else(|| LowerError::MalformedInput("array struct without set".to_string()))?;

            for (index, child) in children.into_iter().enumerate() {
                let element = build_into_value_if_possible(ctx, child)?;
                let index_op = Operand::from_int_immediate(index as i128, ssa::I32);
                call::build_direct_call(
                    ctx,
                    set,
                    vec![stored.value_or_ptr.clone(), index_op, element.value_or_ptr],
                );
            }

            Ok(stored)
        }
        _ => Err(LowerError::MalformedInput(
            "array literal with a non-array type".to_string(),
        )),
    }
}

fn build_map_literal(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
) -> Result<StoredValue, LowerError> {
    let struct_id = lang_type
        .struct_id()
        .ok_or_else(|| LowerError::MalformedInput("map literal without a map type".to_string()))?;

    let create = ctx
        .unit
        .assoc_of(struct_id, "new")
        .ok_or_else(|| LowerError::MalformedInput("map struct without new".to_string()))?;
    let stored = call::build_direct_call(ctx, create, Vec::new());

    let insert = ctx
        .unit
        .method_of(lang_type, "insert")
        .ok_or_else(|| LowerError::MalformedInput("map struct without insert".to_string()))?;

    let entries = ctx.ast.children(node).to_vec();
    for entry in entries {
        let key_node = ctx.ast.child(entry, 0);
        let value_node = ctx.ast.child(entry, 1);

        let key = build_into_value_if_possible(ctx, key_node)?;
        let value = build_into_value_if_possible(ctx, value_node)?;
        call::build_direct_call(
            ctx,
            insert,
            vec![stored.value_or_ptr.clone(), key.value_or_ptr, value.value_or_ptr],
        );
    }

    Ok(stored)
}

fn build_tuple_literal(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let ty = ctx.build_type(lang_type);
    let stored = StoredValue::alloc(ty, hints, ctx);

    let children = ctx.ast.children(node).to_vec();
    for (index, child) in children.into_iter().enumerate() {
        let slot = ctx.append_memberptr(stored.value_type, stored.ptr(), index);
        build_and_store(ctx, child, Operand::from_register(slot, ssa::ADDR))?;
    }

    Ok(stored)
}

fn build_struct_literal(
    ctx: &mut LowerCtx,
    node: NodeId,
    lang_type: &Type,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let ty = ctx.build_type(lang_type);
    let stored = StoredValue::alloc(ty, hints, ctx);

    let children = ctx.ast.children(node).to_vec();
    for (index, child) in children.into_iter().enumerate() {
        if matches!(ctx.ast.node(child).kind, NodeKind::Skipped) {
            continue;
        }

        let slot = ctx.append_memberptr(stored.value_type, stored.ptr(), index);
        build_and_store(ctx, child, Operand::from_register(slot, ssa::ADDR))?;
    }

    Ok(stored)
}

fn build_union_case_expr(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let callee = ctx.ast.child(node, 0);
    let location = ctx.ast.node(callee).expr.location.clone().unwrap();
    let LocationElementKind::UnionCase(union_id, case) = location.last().kind else {
        unreachable!("checked by the caller");
    };

    let case_struct = ctx.union_case_struct(union_id, case);
    let ty = ssa::Type::structure(case_struct);
    let stored = StoredValue::alloc(ty, hints, ctx);

    let args = ctx.ast.children(node)[1..].to_vec();
    for (index, arg) in args.into_iter().enumerate() {
        if matches!(ctx.ast.node(arg).kind, NodeKind::Skipped) {
            continue;
        }

        let slot = ctx.append_memberptr(stored.value_type, stored.ptr(), index);
        build_and_store(ctx, arg, Operand::from_register(slot, ssa::ADDR))?;
    }

    Ok(stored)
}

fn build_binary_operation(
    ctx: &mut LowerCtx,
    node: NodeId,
    op: BinaryOp,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let lhs_node = ctx.ast.child(node, 0);
    let rhs_node = ctx.ast.child(node, 1);
    let lhs_ty = ctx.ast.ty(lhs_node).clone();

    if matches!(lhs_ty, Type::Struct(_)) {
        return build_overloaded_operator(ctx, node, hints);
    }

    let is_signed = lhs_ty.is_signed_int();
    let mut lhs = build_into_value(ctx, lhs_node)?.direct();
    let mut rhs = build_into_value(ctx, rhs_node)?.direct();

    // Pointer arithmetic scales by the pointee size.
    if let Type::Pointer(base) = &lhs_ty {
        debug_assert!(op == BinaryOp::Add);
        let base = base.as_ref().clone();
        let element_ty = ctx.build_type(&base);
        let reg = ctx.append_offsetptr(lhs.clone(), rhs, element_ty);
        return Ok(StoredValue::value_reg(reg, lhs.ty()));
    }

    let is_fp = lhs.ty().is_floating_point();
    let (opcode, commutative) = if is_fp {
        match op {
            BinaryOp::Add => (Opcode::Fadd, false),
            BinaryOp::Sub => (Opcode::Fsub, false),
            BinaryOp::Mul => (Opcode::Fmul, false),
            BinaryOp::Div => (Opcode::Fdiv, false),
            _ => unreachable!("non-arithmetic float operator"),
        }
    } else {
        match op {
            BinaryOp::Add => (Opcode::Add, true),
            BinaryOp::Sub => (Opcode::Sub, false),
            BinaryOp::Mul => (Opcode::Mul, true),
            BinaryOp::Div => (if is_signed { Opcode::Sdiv } else { Opcode::Udiv }, false),
            BinaryOp::Mod => (if is_signed { Opcode::Srem } else { Opcode::Urem }, false),
            BinaryOp::BitAnd => (Opcode::And, true),
            BinaryOp::BitOr => (Opcode::Or, true),
            BinaryOp::BitXor => (Opcode::Xor, true),
            BinaryOp::Shl => (Opcode::Shl, false),
            BinaryOp::Shr => (Opcode::Shr, false),
            _ => unreachable!("logical operator in arithmetic lowering"),
        }
    };

    // Optimization becomes easier if immediates are always on the
    // right-hand side.
    if commutative && lhs.is_immediate() {
        std::mem::swap(&mut lhs, &mut rhs);
    }

    if matches!(opcode, Opcode::Shl | Opcode::Shr) {
        rhs.set_type(ssa::I8);
    }

    let ty = lhs.ty();
    let reg = ctx.next_reg();
    ctx.emit(Instruction::with_dest(opcode, reg, vec![lhs, rhs]));
    Ok(StoredValue::value_reg(reg, ty))
}

/// Binary operators on struct operands dispatch to the resolved overload
/// (`__add__`, `__eq__`, ...): receiver by reference, the other operand as
/// its parameter type requires.
pub(super) fn build_overloaded_operator(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let func = ctx.ast.node(node).expr.operator_func.ok_or_else(|| {
        LowerError::MalformedInput("struct operator without a resolved overload".to_string())
    })?;

    let lhs_node = ctx.ast.child(node, 0);
    let rhs_node = ctx.ast.child(node, 1);

    let lhs = build_into_ptr(ctx, lhs_node)?.ptr();

    let rhs_param = ctx.unit.function(func).function_type(ctx.unit).params[1].clone();
    let rhs = if matches!(rhs_param, Type::Pointer(_)) {
        build_into_ptr(ctx, rhs_node)?.ptr()
    } else {
        build_into_value_if_possible(ctx, rhs_node)?.value_or_ptr
    };

    let result = match &hints.dst {
        Some(dst) => call::build_direct_call_into(ctx, func, vec![lhs, rhs], dst.clone()),
        None => call::build_direct_call(ctx, func, vec![lhs, rhs]),
    };
    Ok(result)
}

fn build_neg(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    let inner = ctx.ast.child(node, 0);
    let value = build_into_value(ctx, inner)?.direct();
    let ty = value.ty();
    let reg = ctx.next_reg();

    if ty.is_floating_point() {
        ctx.emit(Instruction::with_dest(
            Opcode::Fsub,
            reg,
            vec![Operand::from_fp_immediate(0.0, ty), value],
        ));
    } else {
        ctx.emit(Instruction::with_dest(
            Opcode::Sub,
            reg,
            vec![Operand::from_int_immediate(0, ty), value],
        ));
    }

    Ok(StoredValue::value_reg(reg, ty))
}

fn build_deref(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    let inner = ctx.ast.child(node, 0);
    let inner_ty = ctx.ast.ty(inner).clone();
    let value = build(ctx, inner)?.try_turn_into_value(ctx);

    match inner_ty {
        Type::Pointer(_) => {
            let target = ctx.ast.ty(node).clone();
            let ir_ty = ctx.build_type(&target);
            Ok(StoredValue::reference(value.value_or_ptr, ir_ty))
        }
        Type::Struct(_) => {
            // Smart pointers dispatch to their `deref` method.
            let func = ctx.unit.method_of(&inner_ty, "deref").ok_or_else(|| {
                LowerError::MalformedInput("deref of a struct without a deref method".to_string())
            })?;
            let result = call::build_direct_call(ctx, func, vec![value.value_or_ptr]);

            let target = ctx.ast.ty(node).clone();
            let ir_ty = ctx.build_type(&target);
            Ok(StoredValue::reference(result.direct(), ir_ty))
        }
        _ => Err(LowerError::MalformedInput(
            "dereference of a non-pointer".to_string(),
        )),
    }
}

fn build_index(ctx: &mut LowerCtx, node: NodeId) -> Result<StoredValue, LowerError> {
    let base_node = ctx.ast.child(node, 0);
    let index_node = ctx.ast.child(node, 1);
    let base_ty = ctx.ast.ty(base_node).clone();

    match &base_ty {
        Type::Pointer(element) => {
            let element = element.as_ref().clone();
            let base = build(ctx, base_node)?.try_turn_into_value(ctx);
            let element_ty = ctx.build_type(&element);
            let index = build(ctx, index_node)?.try_turn_into_value(ctx);
            Ok(offset_into(ctx, base, index, element_ty))
        }
        Type::StaticArray(element, _) => {
            let element = element.as_ref().clone();
            let base = lower_node(ctx, base_node, &StorageHints::prefer_reference(), 0)?
                .turn_into_reference(ctx);
            let element_ty = ctx.build_type(&element);
            let index = build(ctx, index_node)?.try_turn_into_value(ctx);
            Ok(offset_into(ctx, base, index, element_ty))
        }
        Type::Struct(_) => {
            // Collection structs expose `ref`, returning a pointer to the
            // element.
            let base = build(ctx, base_node)?.turn_into_reference(ctx);
            let index = build(ctx, index_node)?.try_turn_into_value(ctx);

            let func = ctx.unit.method_of(&base_ty, "ref").ok_or_else(|| {
                LowerError::MalformedInput("indexing a struct without a ref method".to_string())
            })?;

            let element_lang = match &ctx.unit.function(func).return_type {
                Type::Pointer(base) => base.as_ref().clone(),
                other => other.clone(),
            };

            let pointer =
                call::build_direct_call(ctx, func, vec![base.ptr(), index.value_or_ptr]);
            let ir_ty = ctx.build_type(&element_lang);
            Ok(StoredValue::reference(pointer.direct(), ir_ty))
        }
        _ => Err(LowerError::MalformedInput(
            "indexing a non-indexable value".to_string(),
        )),
    }
}

fn offset_into(
    ctx: &mut LowerCtx,
    base: StoredValue,
    index: StoredValue,
    element_ty: ssa::Type,
) -> StoredValue {
    let offset_ty = ctx.layout.usize_type();
    let offset = match &index.value_or_ptr {
        Operand::IntImmediate(value, _) => Operand::from_int_immediate(*value, offset_ty),
        Operand::Register(reg, _) => Operand::from_register(*reg, offset_ty),
        other => other.clone(),
    };

    let reg = ctx.append_offsetptr(base.value_or_ptr.clone(), offset, element_ty);
    StoredValue::reference_reg(reg, element_ty)
}

/// Materializes a boolean expression into a one-byte stack slot by routing
/// the short-circuit lowering into store-1/store-0 blocks.
fn build_bool_materialization(
    ctx: &mut LowerCtx,
    node: NodeId,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    if ctx.ast.node(node).expr.operator_func.is_some() {
        return build_overloaded_operator(ctx, node, hints);
    }

    let id = ctx.next_cmp_to_val_id();
    let true_block = ctx.create_block(format!("cmp.{}.true", id));
    let false_block = ctx.create_block(format!("cmp.{}.false", id));
    let end_block = ctx.create_block(format!("cmp.{}.end", id));

    let slot = ctx.append_alloca(ssa::I8);
    let dst = Operand::from_register(slot, ssa::ADDR);

    bool_expr::build(ctx, node, true_block, false_block)?;

    ctx.enter_block(true_block);
    ctx.append_store(Operand::from_int_immediate(1, ssa::I8), dst.clone());
    ctx.append_jmp(end_block);

    ctx.enter_block(false_block);
    ctx.append_store(Operand::from_int_immediate(0, ssa::I8), dst.clone());
    ctx.append_jmp(end_block);

    ctx.enter_block(end_block);
    Ok(StoredValue::reference(dst, ssa::I8))
}
