//! Branch elimination.
//!
//! A conditional branch into two jump-only blocks that both land on the
//! same join block and differ in exactly one argument collapses into a
//! `select` plus a direct jump. When the join has no other predecessors the
//! blocks are merged outright.

use crate::ssa::cfg::ControlFlowGraph;
use crate::ssa::{Function, Instruction, Module, Opcode, Operand};
use crate::target::Target;

use super::Pass;

pub struct BranchElimPass;

impl Pass for BranchElimPass {
    fn name(&self) -> &'static str {
        "branch-elimination"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            run_function(func);
        }
    }
}

fn run_function(func: &mut Function) {
    // Collapsing a diamond restructures the graph; rebuild and rescan
    // until nothing changes.
    loop {
        if !collapse_one_diamond(func) {
            break;
        }
    }
}

fn collapse_one_diamond(func: &mut Function) -> bool {
    let cfg = ControlFlowGraph::build(func);

    for node in cfg.nodes() {
        if node.successors.len() != 2 {
            continue;
        }

        let block_id = node.block;
        let branch_id = match func.block(block_id).instrs.last() {
            Some(id) => id,
            None => continue,
        };
        let branch = func.block(block_id).instrs.get(branch_id);
        if !matches!(branch.opcode, Opcode::Cjmp | Opcode::Fcjmp) {
            continue;
        }

        let true_block = branch.operands[3].branch_target().expect("no true target").block;
        let false_block = branch.operands[4].branch_target().expect("no false target").block;
        if true_block == false_block {
            continue;
        }

        // Both successors must be jump-only blocks with this block as
        // their single predecessor.
        let arm_ok = |arm: crate::ssa::BlockId| {
            func.block(arm).instrs.len() == 1
                && func.block(arm).params.is_empty()
                && func
                    .block(arm)
                    .last_instr()
                    .is_some_and(|instr| instr.opcode == Opcode::Jmp)
                && cfg
                    .node_of(arm)
                    .is_some_and(|n| cfg.node(n).predecessors.len() == 1)
        };
        if !arm_ok(true_block) || !arm_ok(false_block) {
            continue;
        }

        let true_target = func.block(true_block).last_instr().unwrap().operands[0]
            .branch_target()
            .expect("jmp without target")
            .clone();
        let false_target = func.block(false_block).last_instr().unwrap().operands[0]
            .branch_target()
            .expect("jmp without target")
            .clone();

        if true_target.block != false_target.block
            || true_target.args.len() != false_target.args.len()
        {
            continue;
        }

        let join_block = true_target.block;
        let mut unequal = Vec::new();
        for index in 0..true_target.args.len() {
            if true_target.args[index] != false_target.args[index] {
                unequal.push(index);
            }
        }
        if unequal.len() != 1 {
            continue;
        }
        let arg_index = unequal[0];

        let join_preds = cfg
            .node_of(join_block)
            .map(|n| cfg.node(n).predecessors.len())
            .unwrap_or(0);

        // When the diamond is the join's only source, the select's result
        // feeds the join parameter directly and the blocks merge.
        let dest = if join_preds == 2 {
            func.block(join_block).params[arg_index].reg
        } else {
            func.next_virtual_reg()
        };

        let branch = func.block(block_id).instrs.get(branch_id).clone();
        let select = Instruction::with_dest(
            Opcode::Select,
            dest,
            vec![
                branch.operands[0].clone(),
                branch.operands[1].clone(),
                branch.operands[2].clone(),
                true_target.args[arg_index].clone(),
                false_target.args[arg_index].clone(),
            ],
        );

        func.block_mut(block_id).instrs.remove(branch_id);
        func.block_mut(block_id).append(select);

        if join_preds == 2 {
            // Substitute the remaining join parameters with the common
            // arguments and merge.
            let params = func.block(join_block).params.clone();
            for (index, param) in params.iter().enumerate() {
                if index == arg_index {
                    continue;
                }
                let value = true_target.args[index].with_type(param.ty);
                super::replace_in_func(func, param.reg, &value);
            }
            func.block_mut(join_block).params.clear();
            func.merge_blocks(block_id, join_block);
        } else {
            let mut args = true_target.args.clone();
            args[arg_index] = Operand::from_register(dest, args[arg_index].ty());
            func.block_mut(block_id).append(Instruction::new(
                Opcode::Jmp,
                vec![Operand::BranchTarget(crate::ssa::BranchTarget {
                    block: join_block,
                    args,
                })],
            ));
        }

        func.blocks.remove(true_block);
        func.blocks.remove(false_block);
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    #[test]
    fn diamond_collapses_to_select() {
        let mut module = parse_module(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 cjmp i32 %0, slt, i32 0, neg, pos\n\
             neg:\n\
                 jmp join(i32 -1)\n\
             pos:\n\
                 jmp join(i32 1)\n\
             join(%1: i32):\n\
                 ret i32 %1\n\
             }\n",
        )
        .unwrap();

        BranchElimPass.run(&mut module, &Target::host_default());
        let out = write_module(&module);

        assert!(
            out.contains("%1 = select i32 %0, slt, i32 0, i32 -1, i32 1"),
            "{}",
            out
        );
        assert!(!out.contains("cjmp"));
        assert!(!out.contains("neg:"));
        assert!(!out.contains("pos:"));
        // Join merged into the entry.
        assert!(out.contains("ret i32 %1"));
        assert_eq!(out.matches(':').count(), 1, "{}", out);
    }

    #[test]
    fn arms_with_extra_instructions_are_kept() {
        let source = "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 cjmp i32 %0, slt, i32 0, neg, pos\n\
             neg:\n\
                 %1 = sub i32 0, i32 %0\n\
                 jmp join(i32 %1)\n\
             pos:\n\
                 jmp join(i32 %0)\n\
             join(%2: i32):\n\
                 ret i32 %2\n\
             }\n";

        let mut module = parse_module(source).unwrap();
        BranchElimPass.run(&mut module, &Target::host_default());
        let out = write_module(&module);
        assert!(out.contains("cjmp"));
    }
}
