//! Function definition and statement lowering.
//!
//! Layout of every lowered function: the entry block holds the return slot,
//! the argument spill slots and all other allocas; the body follows; a
//! single exit block runs the destructor walk and the final `ret`. `return`
//! statements store into the return slot (or through the hidden return
//! pointer) and jump to the exit block.

use crate::ast::{BinaryOp, NodeId, NodeKind};
use crate::ssa::{
    self, Instruction, Opcode, Operand, FLAG_ARG_STORE, FLAG_SAVE_ARG,
};
use crate::symbols::{FuncId, SymbolRef};
use crate::types::Type;

use super::storage::StorageHints;
use super::{call, control_flow, deinit, expr, LowerCtx, LowerError, VarRef};

pub fn lower_function(ctx: &mut LowerCtx, id: FuncId) -> Result<(), LowerError> {
    let link_name = ctx.func_link_name(id);
    lower_func_common(ctx, id, link_name, false)
}

/// Entered from closure lowering with the enclosing function's state saved.
pub fn lower_closure_function(
    ctx: &mut LowerCtx,
    id: FuncId,
    link_name: String,
) -> Result<(), LowerError> {
    lower_func_common(ctx, id, link_name, true)
}

fn lower_func_common(
    ctx: &mut LowerCtx,
    id: FuncId,
    link_name: String,
    is_closure: bool,
) -> Result<(), LowerError> {
    let symbol = ctx.unit.function(id);
    let lang_params: Vec<crate::symbols::ParamId> = symbol.params.clone();
    let return_lang = symbol.return_type.clone();
    let modifiers = symbol.modifiers;
    let name = symbol.name.clone();
    let body = symbol.body.expect("lowering a function without a body");

    // Parameter types: pass-by-reference parameters travel as `addr`.
    let mut ir_params = Vec::new();
    if is_closure {
        ir_params.push(ssa::ADDR);
    }
    for &param in &lang_params {
        let ty = ctx.unit.param(param).ty.clone();
        let ir_ty = ctx.build_type(&ty);
        if ctx.layout.is_pass_by_ref(ir_ty) {
            ir_params.push(ssa::ADDR);
        } else {
            ir_params.push(ir_ty);
        }
    }

    let mut return_ty = ctx.build_type(&return_lang);
    let return_by_ref = ctx.layout.is_return_by_ref(return_ty);
    if return_by_ref {
        ir_params.insert(0, ssa::ADDR);
        return_ty = ssa::VOID;
    }

    tracing::debug!(func = %link_name, "lowering function");

    let calling_conv = ctx.config.target.default_calling_conv();
    let mut func = ssa::Function::new(link_name.clone(), ir_params.clone(), return_ty, calling_conv);
    func.global = modifiers.exposed || modifiers.dllexport || name == "main";

    ctx.begin_func(func, id);
    ctx.push_move_scope();

    // One spill slot per IR parameter.
    let arg_regs: Vec<ssa::VirtualRegister> =
        (0..ir_params.len()).map(|_| ctx.next_reg()).collect();
    ctx.set_arg_regs(arg_regs.clone());

    let lang_arg_start = usize::from(return_by_ref) + usize::from(is_closure);
    for (index, &param) in lang_params.iter().enumerate() {
        ctx.param_slots
            .insert(param, arg_regs[index + lang_arg_start]);
        ctx.register_func_var(VarRef::Param(param));
    }

    let has_return_value = !return_lang.is_void() && !return_by_ref;
    if has_return_value {
        let return_reg = ctx.append_alloca(return_ty);
        ctx.set_return_reg(return_reg);
    }

    build_arg_store(ctx, &ir_params, &arg_regs);

    // The body block's exit is the function's single exit.
    let exit_id = ctx.next_block_id();
    let exit = ctx.create_block(format!("block.exit.{}", exit_id));
    ctx.set_func_exit(exit);
    lower_block(ctx, body, Some(exit))?;

    build_return(ctx, &name, has_return_value, return_by_ref)?;

    if modifiers.dllexport && ctx.config.target.is_windows() {
        let func_name = ctx.func().name.clone();
        ctx.module.dll_exports.push(func_name);
    }

    ctx.pop_move_scope();
    ctx.finish_func();
    Ok(())
}

/// Spills every argument into a stack slot so the body can treat
/// parameters as ordinary addressable variables. The triple is flagged so
/// the back-end can coalesce it.
fn build_arg_store(
    ctx: &mut LowerCtx,
    ir_params: &[ssa::Type],
    arg_regs: &[ssa::VirtualRegister],
) {
    for (index, &param_ty) in ir_params.iter().enumerate() {
        let slot = arg_regs[index];
        let alloca_id = ctx.append_alloca_into(slot, param_ty);
        {
            let entry = ctx.func().entry();
            let func = ctx.func_mut();
            func.block_mut(entry)
                .instrs
                .get_mut(alloca_id)
                .set_flag(FLAG_ARG_STORE);
        }

        let value_reg = ctx.next_reg();
        let mut loadarg = Instruction::with_dest(
            Opcode::Loadarg,
            value_reg,
            vec![
                Operand::Type(param_ty),
                Operand::from_int_immediate(index as i128, ssa::I32),
            ],
        );
        loadarg.set_flag(FLAG_SAVE_ARG);
        ctx.emit(loadarg);

        let mut store = Instruction::new(
            Opcode::Store,
            vec![
                Operand::from_register(value_reg, param_ty),
                Operand::from_register(slot, ssa::ADDR),
            ],
        );
        store.set_flag(FLAG_SAVE_ARG);
        ctx.emit(store);
    }
}

fn build_return(
    ctx: &mut LowerCtx,
    name: &str,
    has_return_value: bool,
    return_by_ref: bool,
) -> Result<(), LowerError> {
    if has_return_value {
        let return_reg = ctx.return_reg().expect("missing return slot");
        let return_ty = ctx.func().return_type;
        let value = ctx.append_load(return_ty, Operand::from_register(return_reg, ssa::ADDR));
        ctx.append_ret(Some(value));
    } else if name == "main" && !return_by_ref {
        ctx.append_ret(Some(Operand::from_int_immediate(0, ssa::I32)));
    } else {
        ctx.append_ret(None);
    }

    Ok(())
}

/// Allocates stack slots for a block's locals. Idempotent: `switch` and
/// `for` pre-allocate so they can bind their variable before the block
/// body runs.
pub fn alloc_block_locals(ctx: &mut LowerCtx, block: NodeId) {
    if !ctx.mark_block_allocated(block) {
        return;
    }

    let NodeKind::Block(info) = &ctx.ast.node(block).kind else {
        return;
    };

    let locals = ctx.unit.table(info.table).locals.clone();
    for local in locals {
        let ty = ctx.unit.local(local).ty.clone();
        let ir_ty = ctx.build_type(&ty);
        let reg = ctx.append_alloca(ir_ty);
        ctx.local_regs.insert(local, reg);
        ctx.register_func_var(VarRef::Local(local));
    }
}

/// Lowers a block: local slots, destructor flags, the statements, then a
/// jump into the block's exit where the destructor walk runs. The function
/// body passes its own exit in; nested blocks create one.
pub fn lower_block(
    ctx: &mut LowerCtx,
    block: NodeId,
    exit: Option<ssa::BlockId>,
) -> Result<(), LowerError> {
    let NodeKind::Block(info) = ctx.ast.node(block).kind.clone() else {
        return Err(LowerError::MalformedInput("expected a block node".to_string()));
    };

    ctx.push_move_scope();
    alloc_block_locals(ctx, block);
    deinit::init_flags(ctx, &info.deinits);

    build_block_children(ctx, block)?;

    let exit = match exit {
        Some(exit) => exit,
        None => {
            let id = ctx.next_block_id();
            ctx.create_block(format!("block.exit.{}", id))
        }
    };

    ctx.append_jmp(exit);
    ctx.enter_block(exit);
    deinit::build_exit_calls(ctx, &info.deinits)?;

    ctx.pop_move_scope();
    Ok(())
}

/// Lowers the statements of a block without the surrounding exit and
/// destructor machinery. Loop bodies use this directly.
pub fn build_block_children(ctx: &mut LowerCtx, block: NodeId) -> Result<(), LowerError> {
    let children = ctx.ast.children(block).to_vec();
    for child in children {
        lower_stmt(ctx, child)?;
    }
    Ok(())
}

fn lower_stmt(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    match ctx.ast.node(node).kind.clone() {
        NodeKind::VarDecl(local) => {
            if let Some(&init) = ctx.ast.children(node).first() {
                let reg = *ctx
                    .local_regs
                    .get(&local)
                    .expect("local without an allocated slot");
                expr::build_and_store(ctx, init, Operand::from_register(reg, ssa::ADDR))?;
            }
            Ok(())
        }
        NodeKind::Assign => {
            let target = ctx.ast.child(node, 0);
            let value = ctx.ast.child(node, 1);

            let dst = expr::build_into_ptr(ctx, target)?;
            expr::build_and_store(ctx, value, dst.ptr())
        }
        NodeKind::CompoundAssign(op) => lower_compound_assign(ctx, node, op),
        NodeKind::IfChain => control_flow::lower_if_chain(ctx, node),
        NodeKind::Switch => control_flow::lower_switch(ctx, node),
        NodeKind::While => control_flow::lower_while(ctx, node),
        NodeKind::For { by_ref } => control_flow::lower_for(ctx, node, by_ref),
        NodeKind::Try => control_flow::lower_try(ctx, node),
        NodeKind::Call => {
            call::build_call_expr(ctx, node, &StorageHints::none(), false)?;
            Ok(())
        }
        NodeKind::Return => lower_return(ctx, node),
        NodeKind::Break => {
            let exit = ctx
                .loop_scope()
                .map(|scope| scope.exit)
                .ok_or_else(|| LowerError::MalformedInput("break outside a loop".to_string()))?;
            ctx.append_jmp(exit);
            Ok(())
        }
        NodeKind::Continue => {
            let entry = ctx
                .loop_scope()
                .map(|scope| scope.entry)
                .ok_or_else(|| LowerError::MalformedInput("continue outside a loop".to_string()))?;
            ctx.append_jmp(entry);
            Ok(())
        }
        NodeKind::Block(_) => lower_block(ctx, node, None),
        _ => Ok(()),
    }
}

/// `x op= e` loads the location once, applies the operator and stores back
/// without re-evaluating the location.
fn lower_compound_assign(
    ctx: &mut LowerCtx,
    node: NodeId,
    op: BinaryOp,
) -> Result<(), LowerError> {
    let target = ctx.ast.child(node, 0);
    let value = ctx.ast.child(node, 1);
    let target_ty = ctx.ast.ty(target).clone();

    let dst = expr::build_into_ptr(ctx, target)?;
    let current = ctx.append_load(dst.value_type, dst.ptr());

    if matches!(target_ty, Type::Struct(_)) {
        return Err(LowerError::MalformedInput(
            "compound assignment on a struct value".to_string(),
        ));
    }

    let mut rhs = expr::build_into_value(ctx, value)?.direct();

    let is_fp = current.ty().is_floating_point();
    let is_signed = target_ty.is_signed_int();
    let opcode = if is_fp {
        match op {
            BinaryOp::Add => Opcode::Fadd,
            BinaryOp::Sub => Opcode::Fsub,
            BinaryOp::Mul => Opcode::Fmul,
            BinaryOp::Div => Opcode::Fdiv,
            _ => {
                return Err(LowerError::MalformedInput(
                    "bitwise compound assignment on a float".to_string(),
                ));
            }
        }
    } else {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Sub => Opcode::Sub,
            BinaryOp::Mul => Opcode::Mul,
            BinaryOp::Div => {
                if is_signed {
                    Opcode::Sdiv
                } else {
                    Opcode::Udiv
                }
            }
            BinaryOp::Mod => {
                if is_signed {
                    Opcode::Srem
                } else {
                    Opcode::Urem
                }
            }
            BinaryOp::BitAnd => Opcode::And,
            BinaryOp::BitOr => Opcode::Or,
            BinaryOp::BitXor => Opcode::Xor,
            BinaryOp::Shl => Opcode::Shl,
            BinaryOp::Shr => Opcode::Shr,
            _ => {
                return Err(LowerError::MalformedInput(
                    "invalid compound assignment operator".to_string(),
                ));
            }
        }
    };

    if matches!(opcode, Opcode::Shl | Opcode::Shr) {
        rhs.set_type(ssa::I8);
    }

    let result = ctx.next_reg();
    let result_ty = current.ty();
    ctx.emit(Instruction::with_dest(opcode, result, vec![current, rhs]));
    ctx.append_store(Operand::from_register(result, result_ty), dst.ptr());
    Ok(())
}

fn lower_return(ctx: &mut LowerCtx, node: NodeId) -> Result<(), LowerError> {
    if let Some(&value) = ctx.ast.children(node).first() {
        let lang_func = ctx.unit.function(ctx.cur_lang_func());
        let return_lang = lang_func.return_type.clone();
        let return_ir = ctx.build_type(&return_lang);

        let dst = if ctx.layout.is_return_by_ref(return_ir) {
            // The hidden return pointer sits in arg slot 0.
            let slot = ctx.arg_regs()[0];
            ctx.append_load(ssa::ADDR, Operand::from_register(slot, ssa::ADDR))
        } else {
            let reg = ctx.return_reg().expect("missing return slot");
            Operand::from_register(reg, ssa::ADDR)
        };

        expr::build_and_store(ctx, value, dst)?;
    }

    let exit = ctx.func_exit();
    ctx.append_jmp(exit);
    Ok(())
}

/// Resolves a bound-variable node (an identifier with a local symbol) to
/// its local id.
pub fn bound_local(ctx: &LowerCtx, node: NodeId) -> Result<crate::symbols::LocalId, LowerError> {
    match ctx.ast.node(node).expr.symbol {
        Some(SymbolRef::Local(id)) => Ok(id),
        _ => Err(LowerError::MalformedInput(
            "binding without a resolved local".to_string(),
        )),
    }
}
