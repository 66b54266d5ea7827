//! Lowering of locations (l-value paths).
//!
//! A location is a resolved chain: a root (variable, constant, function,
//! enum variant, `self`, or an address-producing expression) followed by
//! field, tuple-index and method navigations. Reading a location yields the
//! storage of its last element; method elements additionally record the
//! receiver so call lowering can pick it up.
//!
//! Two special paths live here: captured variables (an identifier inside a
//! closure body that refers to an enclosing function's variable turns into
//! a load through the closure context) and protocol methods (fat-pointer
//! unpacking plus a vtable index).

use crate::ssa::{self, Operand};
use crate::symbols::{FuncId, Location, LocationElement, LocationElementKind};
use crate::types::Type;

use super::storage::{StorageHints, StoredValue};
use super::{LowerCtx, LowerError, VarRef};

/// Result of lowering a location.
pub struct LoweredLocation {
    pub value: StoredValue,
    /// Directly resolved function or method, if the path ends in one.
    pub func: Option<FuncId>,
    /// Receiver storage for method and protocol-method paths.
    pub self_value: Option<StoredValue>,
    pub is_proto_method: bool,
}

pub fn build_location(
    ctx: &mut LowerCtx,
    location: &Location,
    return_value: bool,
) -> Result<LoweredLocation, LowerError> {
    assert!(!location.elements.is_empty(), "location has no root");

    let mut lowered = build_root(ctx, &location.elements[0])?;

    for index in 1..location.elements.len() {
        let previous = &location.elements[index - 1];
        build_element(ctx, &mut lowered, &location.elements[index], &previous.ty)?;
    }

    // Reading a function-typed location yields the function's address
    // unless the path is consumed as a callee.
    if return_value
        && let Some(func) = lowered.func
        && matches!(location.ty(), Type::Function(_))
        && !ctx.unit.function(func).modifiers.native
    {
        lowered.value = StoredValue::value(ctx.func_operand(func, ssa::ADDR));
    }

    Ok(lowered)
}

fn build_root(ctx: &mut LowerCtx, root: &LocationElement) -> Result<LoweredLocation, LowerError> {
    let mut lowered = LoweredLocation {
        value: StoredValue::value(Operand::from_int_immediate(0, ssa::VOID)),
        func: None,
        self_value: None,
        is_proto_method: false,
    };

    match &root.kind {
        LocationElementKind::Local(id) => {
            lowered.value = var_value(ctx, VarRef::Local(*id));
        }
        LocationElementKind::Param(id) => {
            lowered.value = var_value(ctx, VarRef::Param(*id));
        }
        LocationElementKind::Global(id) => {
            let ty = ctx.unit.global(*id).ty.clone();
            let ir_ty = ctx.build_type(&ty);
            let name = ctx.global_link_name(*id);
            lowered.value = StoredValue::reference(Operand::Global(name, ssa::ADDR), ir_ty);
        }
        LocationElementKind::Const(id) => {
            let constant = ctx.unit.constant(*id);
            let ty = constant.ty.clone();
            let value = constant.value.clone();
            let ir_ty = ctx.build_type(&ty);
            lowered.value = StoredValue::value(match value {
                crate::symbols::ConstValue::Int(v) => Operand::from_int_immediate(v, ir_ty),
                crate::symbols::ConstValue::Float(v) => Operand::from_fp_immediate(v, ir_ty),
                crate::symbols::ConstValue::Str(_) => {
                    return Err(LowerError::MalformedInput(
                        "string constant used as a location root".to_string(),
                    ));
                }
            });
        }
        LocationElementKind::Func(id) => {
            lowered.func = Some(*id);
            lowered.value = StoredValue::value(ctx.func_operand(*id, ssa::ADDR));
        }
        LocationElementKind::EnumVariant(enum_id, index) => {
            let value = ctx.unit.enumeration(*enum_id).variants[*index].value;
            lowered.value = StoredValue::value(Operand::from_int_immediate(value, ssa::I32));
        }
        LocationElementKind::UnionCase(..) => {
            // Construction of a union case value happens at the call
            // expression wrapping this location.
            lowered.value = StoredValue::value(Operand::from_int_immediate(0, ssa::ADDR));
        }
        LocationElementKind::SelfValue => {
            let lang_func = ctx.unit.function(ctx.cur_lang_func());
            let return_type = lang_func.return_type.clone();
            let ir_return = ctx.build_type(&return_type);
            let self_index = usize::from(ctx.layout.is_return_by_ref(ir_return));

            let slot = ctx.arg_regs()[self_index];
            lowered.value = StoredValue::reference_reg(slot, ssa::ADDR);
        }
        LocationElementKind::Expr(node) => {
            let value = super::expr::build_into_ptr(ctx, *node)?;
            debug_assert!(value.reference);
            lowered.value = value;
        }
        _ => {
            return Err(LowerError::MalformedInput(
                "field navigation as a location root".to_string(),
            ));
        }
    }

    Ok(lowered)
}

fn build_element(
    ctx: &mut LowerCtx,
    lowered: &mut LoweredLocation,
    element: &LocationElement,
    previous_ty: &Type,
) -> Result<(), LowerError> {
    match &element.kind {
        LocationElementKind::Field(index) => match previous_ty {
            Type::Struct(_) => build_field_access(ctx, lowered, *index, &element.ty),
            Type::Pointer(base) => build_ptr_field_access(ctx, lowered, base, *index, &element.ty),
            _ => {
                return Err(LowerError::MalformedInput(
                    "field access on a non-struct value".to_string(),
                ));
            }
        },
        LocationElementKind::UnionCaseField(index) => {
            build_field_access(ctx, lowered, *index, &element.ty);
        }
        LocationElementKind::TupleIndex(index) => {
            build_field_access(ctx, lowered, *index, &element.ty);
        }
        LocationElementKind::Method(func) => match previous_ty {
            Type::Pointer(_) => {
                // The stored value already is the receiver pointer.
                lowered.self_value = Some(lowered.value.clone());
                lowered.func = Some(*func);
            }
            _ => {
                let receiver = lowered.value.clone().turn_into_reference(ctx);
                lowered.self_value = Some(StoredValue::value(receiver.ptr()));
                lowered.value = receiver;
                lowered.func = Some(*func);
            }
        },
        LocationElementKind::ProtoMethod(slot) => {
            let proto = match previous_ty {
                Type::Proto(id) => *id,
                Type::Pointer(base) => match base.as_ref() {
                    Type::Proto(id) => *id,
                    _ => {
                        return Err(LowerError::MalformedInput(
                            "protocol method on a non-protocol value".to_string(),
                        ));
                    }
                },
                _ => {
                    return Err(LowerError::MalformedInput(
                        "protocol method on a non-protocol value".to_string(),
                    ));
                }
            };
            build_proto_method_access(ctx, lowered, proto, *slot);
        }
        _ => {
            return Err(LowerError::MalformedInput(
                "location root in element position".to_string(),
            ));
        }
    }

    Ok(())
}

fn build_field_access(
    ctx: &mut LowerCtx,
    lowered: &mut LoweredLocation,
    index: usize,
    field_ty: &Type,
) {
    let base = lowered.value.clone().turn_into_reference(ctx);
    let reg = ctx.append_memberptr(base.value_type, base.ptr(), index);

    let ty = field_ty.clone();
    let ir_ty = ctx.build_type(&ty);
    lowered.value = StoredValue::reference_reg(reg, ir_ty);
}

/// Field access through a pointer: load the pointer, then index the
/// pointee.
fn build_ptr_field_access(
    ctx: &mut LowerCtx,
    lowered: &mut LoweredLocation,
    pointee: &Type,
    index: usize,
    field_ty: &Type,
) {
    let pointee = pointee.clone();
    let struct_ty = ctx.build_type(&pointee);

    let base_ptr = if lowered.value.reference {
        ctx.append_load(ssa::ADDR, lowered.value.ptr())
    } else {
        lowered.value.direct()
    };

    let reg = ctx.append_memberptr(struct_ty, base_ptr, index);
    let ty = field_ty.clone();
    let ir_ty = ctx.build_type(&ty);
    lowered.value = StoredValue::reference_reg(reg, ir_ty);
}

/// Protocol method access on a fat pointer:
/// 1. load the receiver from field 0,
/// 2. load the vtable pointer from field 1,
/// 3. index the vtable at the method's slot.
fn build_proto_method_access(
    ctx: &mut LowerCtx,
    lowered: &mut LoweredLocation,
    proto: crate::symbols::ProtoId,
    slot: usize,
) {
    let fat = lowered.value.clone().turn_into_reference(ctx);
    let fat_ty = fat.value_type;
    let base = fat.ptr();

    let self_ptr_reg = ctx.append_memberptr(fat_ty, base.clone(), 0);
    let self_value = ctx.append_load(
        ssa::ADDR,
        Operand::from_register(self_ptr_reg, ssa::ADDR),
    );
    lowered.self_value = Some(StoredValue::value(self_value));

    let vtable_ptr_reg = ctx.append_memberptr(fat_ty, base, 1);
    let vtable_ptr = ctx.append_load(
        ssa::ADDR,
        Operand::from_register(vtable_ptr_reg, ssa::ADDR),
    );

    let vtable_struct = ctx.vtable_struct(proto);
    let method_ptr_reg =
        ctx.append_memberptr(ssa::Type::structure(vtable_struct), vtable_ptr, slot);

    lowered.value = StoredValue::reference_reg(method_ptr_reg, ssa::ADDR);
    lowered.is_proto_method = true;
}

/// Storage of a plain variable, routing captured variables through the
/// closure context.
pub fn var_value(ctx: &mut LowerCtx, var: VarRef) -> StoredValue {
    if is_captured(ctx, var) {
        return captured_var_value(ctx, var);
    }

    match var {
        VarRef::Local(id) => {
            let ty = ctx.unit.local(id).ty.clone();
            let ir_ty = ctx.build_type(&ty);
            let reg = *ctx
                .local_regs
                .get(&id)
                .expect("local without an allocated slot");
            StoredValue::reference_reg(reg, ir_ty)
        }
        VarRef::Param(id) => {
            let ty = ctx.unit.param(id).ty.clone();
            let ir_ty = ctx.build_type(&ty);
            let slot = *ctx
                .param_slots
                .get(&id)
                .expect("parameter without an arg slot");

            if ctx.layout.is_pass_by_ref(ir_ty) {
                // The slot holds the caller's pointer, not the value.
                let ptr = ctx.append_load(ssa::ADDR, Operand::from_register(slot, ssa::ADDR));
                StoredValue::reference(ptr, ir_ty)
            } else {
                StoredValue::reference_reg(slot, ir_ty)
            }
        }
    }
}

/// A variable is captured when a closure body refers to a variable the
/// closure itself did not declare.
fn is_captured(ctx: &LowerCtx, var: VarRef) -> bool {
    ctx.closure.is_some() && !ctx.is_func_var(var)
}

fn captured_var_value(ctx: &mut LowerCtx, var: VarRef) -> StoredValue {
    let ty = match var {
        VarRef::Local(id) => ctx.unit.local(id).ty.clone(),
        VarRef::Param(id) => ctx.unit.param(id).ty.clone(),
    };
    let member_ty = ctx.build_type(&ty);

    let closure = ctx.closure.as_mut().expect("capture outside a closure");
    let context_struct = closure.context_struct;
    let member_index = match closure.captured.iter().position(|&v| v == var) {
        Some(index) => index,
        None => {
            closure.captured.push(var);
            closure.captured.len() - 1
        }
    };

    // The hidden first argument is the context pointer; its spill slot is
    // arg slot 0.
    let ctx_slot = ctx.arg_regs()[0];
    let context_ptr = ctx.append_load(ssa::ADDR, Operand::from_register(ctx_slot, ssa::ADDR));
    let member_ptr = ctx.append_memberptr(
        ssa::Type::structure(context_struct),
        context_ptr,
        member_index,
    );

    StoredValue::reference_reg(member_ptr, member_ty)
}

/// Convenience for expression lowering: read the location attached to a
/// node.
pub fn build_node_location(
    ctx: &mut LowerCtx,
    node: crate::ast::NodeId,
    _hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let location = ctx
        .ast
        .node(node)
        .expr
        .location
        .clone()
        .ok_or_else(|| LowerError::MalformedInput("expression without a location".to_string()))?;

    Ok(build_location(ctx, &location, true)?.value)
}
