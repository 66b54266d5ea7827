//! Closure lowering.
//!
//! A closure literal becomes a two-field record `{ fn, ctx }`. The body is
//! lifted into a function named `<enclosing>.$<n>`; while it is lowered,
//! identifier accesses that cross the closure boundary populate the capture
//! list. Afterwards the context struct gains one field per capture, a heap
//! block of its size is allocated, the captures are copied in, and the
//! record is filled.
//!
//! The heap-to-stack pass later turns the `malloc` into an `alloca` when a
//! matching `free` stays in the same block.

use crate::ast::NodeId;
use crate::ssa::{self, Instruction, Opcode, Operand};
use crate::symbols::FuncId;

use super::storage::{StorageHints, StoredValue};
use super::{func, location, ClosureState, LowerCtx, LowerError, VarRef};

pub fn build_closure(
    ctx: &mut LowerCtx,
    node: NodeId,
    lifted: FuncId,
    hints: &StorageHints,
) -> Result<StoredValue, LowerError> {
    let closure_ty = ssa::Type::structure(ctx.closure_value_struct());
    let stored = StoredValue::alloc(closure_ty, hints, ctx);

    // Unique lifted-function name derived from the enclosing function.
    let enclosing = ctx.cur_lang_func();
    let enclosing_name = ctx.func_link_name(enclosing);
    let name = format!("{}.${}", enclosing_name, ctx.next_closure_id());

    let context_struct = ctx.module.add_struct(ssa::Structure {
        name: format!("closure.struct.{}", name),
        members: Vec::new(),
    });

    // Lower the body as a function of its own, with the enclosing state
    // (including any outer closure's capture list) saved around it.
    let saved = ctx.save_func_state();
    let outer_closure = ctx.closure.take();
    ctx.closure = Some(ClosureState {
        node,
        context_struct,
        captured: Vec::new(),
    });

    func::lower_closure_function(ctx, lifted, name.clone())?;

    let closure_state = ctx.closure.take().expect("closure state dropped");
    ctx.closure = outer_closure;
    ctx.restore_func_state(saved);

    // The context struct's fields are known only now that the body has
    // been lowered.
    let captured = closure_state.captured;
    let mut members = Vec::new();
    for &var in &captured {
        let (var_name, ty) = match var {
            VarRef::Local(id) => {
                let symbol = ctx.unit.local(id);
                (symbol.name.clone(), symbol.ty.clone())
            }
            VarRef::Param(id) => {
                let symbol = ctx.unit.param(id);
                (symbol.name.clone(), symbol.ty.clone())
            }
        };
        let ir_ty = ctx.build_type(&ty);
        members.push(ssa::StructureMember {
            name: var_name,
            ty: ir_ty,
        });
    }
    ctx.module.structure_mut(context_struct).members = members;

    // Heap-allocate the context and copy the captures into it.
    let context_ty = ssa::Type::structure(context_struct);
    let size = ctx.size_of(context_ty);
    let usize_ty = ctx.layout.usize_type();

    ctx.ensure_extern_func("malloc", vec![usize_ty], ssa::ADDR);

    let data_reg = ctx.next_reg();
    ctx.emit(Instruction::with_dest(
        Opcode::Call,
        data_reg,
        vec![
            Operand::ExternFunc("malloc".to_string(), ssa::ADDR),
            Operand::from_int_immediate(size as i128, usize_ty),
        ],
    ));
    let data_ptr = Operand::from_register(data_reg, ssa::ADDR);

    for (index, &var) in captured.iter().enumerate() {
        let source = location::var_value(ctx, var);
        let member_reg = ctx.append_memberptr(context_ty, data_ptr.clone(), index);
        let member_ptr = Operand::from_register(member_reg, ssa::ADDR);
        source.copy_to(&member_ptr, ctx);
    }

    // Fill the closure record: the lifted function, then the context.
    let fn_slot = ctx.append_memberptr(stored.value_type, stored.ptr(), 0);
    ctx.append_store(
        Operand::Func(name, ssa::ADDR),
        Operand::from_register(fn_slot, ssa::ADDR),
    );

    let ctx_slot = ctx.append_memberptr(stored.value_type, stored.ptr(), 1);
    ctx.append_store(data_ptr, Operand::from_register(ctx_slot, ssa::ADDR));

    Ok(stored)
}
