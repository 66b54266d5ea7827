//! Stack-to-register promotion.
//!
//! Promotes register-sized, address-never-taken stack slots to SSA values:
//! block parameters are placed on the dominance frontiers of the defining
//! blocks ("phi placement"), then a rename walk over the dominator tree
//! rewrites loads into the current value and deletes the stores and
//! allocas. Constant folding and dead-code removal run afterwards to sweep
//! up the leftovers.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::ssa::cfg::ControlFlowGraph;
use crate::ssa::dominators::DominatorTree;
use crate::ssa::{
    BlockId, BlockParam, Function, Module, Opcode, Operand, Type, VirtualRegister,
};
use crate::target::Target;

use super::{dead_code, for_each_value_mut, precompute, Pass};

pub struct StackToRegPass;

impl Pass for StackToRegPass {
    fn name(&self) -> &'static str {
        "stack-to-reg"
    }

    fn run(&mut self, module: &mut Module, target: &Target) {
        // Struct slots are never promoted, so the layout's primitive view
        // is all this pass needs.
        let layout = target.data_layout();
        for func in &mut module.functions {
            run_function(func, &layout);
        }
    }
}

struct SlotInfo {
    ty: Type,
    def_blocks: Vec<BlockId>,
    use_blocks: HashSet<BlockId>,
    param_blocks: HashSet<BlockId>,
    promotable: bool,
}

struct NewParam {
    param_index: usize,
    slot: VirtualRegister,
}

fn run_function(func: &mut Function, layout: &crate::target::DataLayout) {
    let cfg = ControlFlowGraph::build(func);
    let domtree = DominatorTree::build(&cfg);

    let mut slots = find_stack_slots(func, layout);
    if slots.is_empty() {
        // Still sweep: earlier passes (inlining in particular) leave folded
        // chains and unused address computations behind.
        precompute::precompute_function(func);
        dead_code::run(func);
        return;
    }

    let mut new_params: HashMap<BlockId, Vec<NewParam>> = HashMap::new();
    let mut init_replacements: HashMap<VirtualRegister, Operand> = HashMap::new();

    // Sorted so parameter placement (and with it the output) is
    // deterministic.
    let mut slot_regs: Vec<VirtualRegister> = slots.keys().copied().collect();
    slot_regs.sort_unstable();
    for slot_reg in slot_regs {
        let info = &slots[&slot_reg];

        if info.def_blocks.is_empty() {
            // Never stored to: every load yields the zero of its type.
            init_replacements.insert(slot_reg, zero_value(info.ty));
            continue;
        }

        // Def blocks grow as params are placed; a new param is itself a
        // definition.
        let mut index = 0;
        while index < slots[&slot_reg].def_blocks.len() {
            let def_block = slots[&slot_reg].def_blocks[index];
            index += 1;

            let Some(def_node) = cfg.node_of(def_block) else {
                continue;
            };

            let frontier = domtree.node(def_node).frontier.clone();
            for frontier_node in frontier {
                let frontier_block = cfg.node(frontier_node).block;

                if slots[&slot_reg].param_blocks.contains(&frontier_block) {
                    continue;
                }

                let mut visited = HashSet::new();
                if !is_slot_used(&slots[&slot_reg], &cfg, frontier_node, &mut visited) {
                    continue;
                }

                trace!(
                    slot = slot_reg,
                    block = %func.block(frontier_block).label,
                    "placing block parameter"
                );

                let ty = slots[&slot_reg].ty;
                let param_reg = func.next_virtual_reg();
                let param_index = func.block(frontier_block).params.len();
                func.block_mut(frontier_block)
                    .params
                    .push(BlockParam { reg: param_reg, ty });

                new_params
                    .entry(frontier_block)
                    .or_default()
                    .push(NewParam {
                        param_index,
                        slot: slot_reg,
                    });

                let info = slots.get_mut(&slot_reg).expect("slot disappeared");
                info.param_blocks.insert(frontier_block);
                init_replacements.insert(slot_reg, zero_value(info.ty));

                if !info.def_blocks.contains(&frontier_block) {
                    info.def_blocks.push(frontier_block);
                }
            }
        }
    }

    let entry = func.entry();
    rename(
        func,
        entry,
        &slots,
        &new_params,
        init_replacements,
        &cfg,
        &domtree,
    );

    precompute::precompute_function(func);
    dead_code::run(func);
}

fn find_stack_slots(
    func: &Function,
    layout: &crate::target::DataLayout,
) -> HashMap<VirtualRegister, SlotInfo> {
    let mut slots: HashMap<VirtualRegister, SlotInfo> = HashMap::new();

    for block_id in func.blocks.ids() {
        let block = func.block(block_id);

        for instr in block.instrs.iter() {
            match instr.opcode {
                Opcode::Alloca => {
                    let dest = instr.dest.expect("alloca without dest");
                    let ty = match instr.operands[0] {
                        Operand::Type(ty) => ty,
                        _ => continue,
                    };

                    if layout.fits_in_register(ty) {
                        slots.insert(
                            dest,
                            SlotInfo {
                                ty,
                                def_blocks: Vec::new(),
                                use_blocks: HashSet::new(),
                                param_blocks: HashSet::new(),
                                promotable: true,
                            },
                        );
                    }
                }
                Opcode::Store => {
                    if let Some(reg) = instr.operands[1].register()
                        && let Some(info) = slots.get_mut(&reg)
                    {
                        info.def_blocks.push(block_id);
                    }
                    // Storing the slot's address somewhere lets it escape.
                    if let Some(reg) = instr.operands[0].register()
                        && let Some(info) = slots.get_mut(&reg)
                    {
                        info.promotable = false;
                    }
                }
                _ => {
                    let is_load = instr.opcode == Opcode::Load;
                    super::for_each_reg(&instr.operands, &mut |reg| {
                        let Some(info) = slots.get_mut(&reg) else {
                            return;
                        };

                        if !info.def_blocks.contains(&block_id) {
                            info.use_blocks.insert(block_id);
                        }

                        if !is_load {
                            info.promotable = false;
                        }
                    });
                }
            }
        }
    }

    slots.retain(|_, info| info.promotable);
    slots
}

/// Whether the slot's value is observable at or after `node`; frontiers
/// where it is not need no parameter.
fn is_slot_used(
    info: &SlotInfo,
    cfg: &ControlFlowGraph,
    node: usize,
    visited: &mut HashSet<usize>,
) -> bool {
    if info.use_blocks.contains(&cfg.node(node).block) {
        return true;
    }

    visited.insert(node);

    for &succ in &cfg.node(node).successors {
        if !visited.contains(&succ) && is_slot_used(info, cfg, succ, visited) {
            return true;
        }
    }

    false
}

#[allow(clippy::too_many_arguments)]
fn rename(
    func: &mut Function,
    block_id: BlockId,
    slots: &HashMap<VirtualRegister, SlotInfo>,
    new_params: &HashMap<BlockId, Vec<NewParam>>,
    mut replacements: HashMap<VirtualRegister, Operand>,
    cfg: &ControlFlowGraph,
    domtree: &DominatorTree,
) {
    if let Some(params) = new_params.get(&block_id) {
        for param in params {
            let block_param = &func.block(block_id).params[param.param_index];
            replacements.insert(
                param.slot,
                Operand::from_register(block_param.reg, block_param.ty),
            );
        }
    }

    for instr_id in func.blocks.get(block_id).instrs.ids().collect::<Vec<_>>() {
        let instr = func.blocks.get(block_id).instrs.get(instr_id);

        match instr.opcode {
            Opcode::Alloca => {
                let dest = instr.dest.expect("alloca without dest");
                if slots.contains_key(&dest) {
                    func.blocks.get_mut(block_id).instrs.remove(instr_id);
                }
            }
            Opcode::Store if instr.operands[1].register().is_some_and(|r| slots.contains_key(&r)) => {
                let slot = instr.operands[1].register().expect("checked");
                let value = instr.operands[0].clone();

                let resolved = match value.register() {
                    Some(reg) => replacements.get(&reg).cloned().unwrap_or(value),
                    None => value,
                };

                replacements.insert(slot, resolved);
                func.blocks.get_mut(block_id).instrs.remove(instr_id);
            }
            Opcode::Load if instr.operands[1].register().is_some_and(|r| slots.contains_key(&r)) => {
                let slot = instr.operands[1].register().expect("checked");
                let dest = instr.dest.expect("load without dest");
                let ty = match instr.operands[0] {
                    Operand::Type(ty) => ty,
                    _ => slots[&slot].ty,
                };

                let value = replacements
                    .get(&slot)
                    .cloned()
                    .unwrap_or_else(|| zero_value(slots[&slot].ty))
                    .with_type(ty);
                replacements.insert(dest, value);
                func.blocks.get_mut(block_id).instrs.remove(instr_id);
            }
            Opcode::Jmp | Opcode::Cjmp | Opcode::Fcjmp => {
                let instr = func.blocks.get_mut(block_id).instrs.get_mut(instr_id);

                for operand in &mut instr.operands {
                    let Some(target) = operand.branch_target_mut() else {
                        continue;
                    };
                    let Some(params) = new_params.get(&target.block) else {
                        continue;
                    };

                    for param in params {
                        let value = replacements
                            .get(&param.slot)
                            .cloned()
                            .unwrap_or_else(|| zero_value(slots[&param.slot].ty));
                        target.args.push(value);
                    }
                }

                apply_replacements(instr, &replacements);
            }
            _ => {
                let instr = func.blocks.get_mut(block_id).instrs.get_mut(instr_id);
                apply_replacements(instr, &replacements);
            }
        }
    }

    // Recurse into dominator-tree children with a copy of the current
    // values.
    let Some(node) = cfg.node_of(block_id) else {
        return;
    };
    for &child in &domtree.node(node).children {
        let child_block = cfg.node(child).block;
        rename(
            func,
            child_block,
            slots,
            new_params,
            replacements.clone(),
            cfg,
            domtree,
        );
    }
}

fn apply_replacements(
    instr: &mut crate::ssa::Instruction,
    replacements: &HashMap<VirtualRegister, Operand>,
) {
    for_each_value_mut(&mut instr.operands, &mut |operand| {
        if let Some(reg) = operand.register()
            && let Some(value) = replacements.get(&reg)
        {
            *operand = value.with_type(operand.ty());
        }
    });
}

fn zero_value(ty: Type) -> Operand {
    if ty.is_floating_point() {
        Operand::from_fp_immediate(0.0, ty)
    } else {
        Operand::from_int_immediate(0, ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        StackToRegPass.run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn straight_line_slot_disappears() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = alloca i32\n\
                 %1 = loadarg i32, i32 0\n\
                 store i32 %1, addr %0\n\
                 %2 = load i32, addr %0\n\
                 %3 = add i32 %2, i32 1\n\
                 ret i32 %3\n\
             }\n",
        );
        assert!(!out.contains("alloca"));
        assert!(!out.contains("store"));
        assert!(!out.contains("load i32, addr"));
        assert!(out.contains("%3 = add i32 %1, i32 1"));
    }

    #[test]
    fn join_block_gains_a_parameter_across_a_branch() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = alloca i32\n\
                 %1 = loadarg i32, i32 0\n\
                 cjmp i32 %1, slt, i32 0, neg, pos\n\
             neg:\n\
                 store i32 -1, addr %0\n\
                 jmp join\n\
             pos:\n\
                 store i32 1, addr %0\n\
                 jmp join\n\
             join:\n\
                 %2 = load i32, addr %0\n\
                 ret i32 %2\n\
             }\n",
        );

        assert!(!out.contains("alloca"));
        assert!(!out.contains("store"));
        // The join block now takes the value as a parameter, supplied by
        // both arms.
        assert!(out.contains("join(%3: i32):"), "{}", out);
        assert!(out.contains("jmp join(i32 -1)"));
        assert!(out.contains("jmp join(i32 1)"));
        assert!(out.contains("ret i32 %3"));
    }

    #[test]
    fn escaping_slots_are_left_alone() {
        let out = run(
            "decl @observe(addr) -> void\n\
             func @f() -> i32 {\n\
             entry:\n\
                 %0 = alloca i32\n\
                 store i32 7, addr %0\n\
                 call void @observe, addr %0\n\
                 %1 = load i32, addr %0\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("alloca i32"));
        assert!(out.contains("store i32 7"));
    }

    #[test]
    fn loop_carried_value_gets_header_parameter() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = alloca i32\n\
                 %1 = loadarg i32, i32 0\n\
                 store i32 0, addr %0\n\
                 jmp header\n\
             header:\n\
                 %2 = load i32, addr %0\n\
                 cjmp i32 %2, slt, i32 %1, body, exit\n\
             body:\n\
                 %3 = load i32, addr %0\n\
                 %4 = add i32 %3, i32 1\n\
                 store i32 %4, addr %0\n\
                 jmp header\n\
             exit:\n\
                 %5 = load i32, addr %0\n\
                 ret i32 %5\n\
             }\n",
        );

        assert!(!out.contains("alloca"));
        assert!(out.contains("header(%6: i32):"), "{}", out);
        assert!(out.contains("jmp header(i32 0)"));
        assert!(out.contains("jmp header(i32 %4)"));
    }
}
