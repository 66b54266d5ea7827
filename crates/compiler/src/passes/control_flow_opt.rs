//! Control-flow cleanup.
//!
//! Three rewrites per round, run four rounds per function:
//! 1. merge blocks into their only predecessor when it ends in an
//!    unconditional jump, substituting block parameters with the jump's
//!    arguments,
//! 2. thread jumps through blocks that only contain an unconditional jump,
//! 3. delete blocks the control-flow graph cannot reach.
//!
//! Constant folding runs afterwards since merges frequently expose folds.

use crate::ssa::cfg::ControlFlowGraph;
use crate::ssa::{Function, Module, Opcode};
use crate::target::Target;

use super::{precompute, replace_in_func, Pass};

pub struct ControlFlowOptPass;

impl Pass for ControlFlowOptPass {
    fn name(&self) -> &'static str {
        "control-flow-opt"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            for _ in 0..4 {
                optimize_blocks(func);
            }
        }
    }
}

fn optimize_blocks(func: &mut Function) {
    merge_single_predecessor_blocks(func);
    thread_trivial_jumps(func);
    remove_unreachable_blocks(func);
    precompute::precompute_function(func);
}

fn merge_single_predecessor_blocks(func: &mut Function) {
    // Merging removes a block, which stales the graph, so rebuild after
    // every successful merge.
    loop {
        let cfg = ControlFlowGraph::build(func);
        let mut merged = false;

        for node in cfg.nodes() {
            if node.predecessors.len() != 1 {
                continue;
            }

            let block_id = node.block;
            if block_id == func.entry() {
                continue;
            }
            let pred_id = cfg.node(node.predecessors[0]).block;
            if pred_id == block_id {
                continue;
            }

            // Only merge when the predecessor ends in an unconditional jump
            // to this block.
            let Some(last) = func.block(pred_id).last_instr() else {
                continue;
            };
            if last.opcode != Opcode::Jmp {
                continue;
            }
            let Some(target) = last.operands[0].branch_target() else {
                continue;
            };
            if target.block != block_id {
                continue;
            }

            let args = target.args.clone();
            let params = func.block(block_id).params.clone();

            for (param, arg) in params.iter().zip(args) {
                let value = arg.with_type(param.ty);
                replace_in_func(func, param.reg, &value);
            }

            let jmp_id = func.block(pred_id).instrs.last().expect("checked above");
            func.block_mut(pred_id).instrs.remove(jmp_id);
            func.merge_blocks(pred_id, block_id);

            merged = true;
            break;
        }

        if !merged {
            break;
        }
    }
}

fn thread_trivial_jumps(func: &mut Function) {
    let cfg = ControlFlowGraph::build(func);

    for node in cfg.nodes() {
        let block = func.block(node.block);
        if !block.params.is_empty() || block.instrs.len() != 1 {
            continue;
        }

        let last = block.last_instr().expect("len checked");
        if last.opcode != Opcode::Jmp {
            continue;
        }
        let target = last.operands[0]
            .branch_target()
            .expect("jmp without target")
            .clone();

        if target.block == node.block {
            continue;
        }

        let trivial_block = node.block;
        for &pred in &node.predecessors {
            let pred_id = cfg.node(pred).block;
            let Some(branch_id) = func.block(pred_id).instrs.last() else {
                continue;
            };

            let branch = func.block_mut(pred_id).instrs.get_mut(branch_id);
            for operand in &mut branch.operands {
                if let Some(branch_target) = operand.branch_target_mut()
                    && branch_target.block == trivial_block
                    && branch_target.args.is_empty()
                {
                    *branch_target = target.clone();
                }
            }
        }
    }
}

fn remove_unreachable_blocks(func: &mut Function) {
    let cfg = ControlFlowGraph::build(func);

    for block_id in func.blocks.ids().collect::<Vec<_>>() {
        if !cfg.contains(block_id) {
            func.blocks.remove(block_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        ControlFlowOptPass.run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn merges_single_predecessor_chain() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 jmp middle\n\
             middle:\n\
                 %0 = add i32 1, i32 2\n\
                 jmp end\n\
             end:\n\
                 ret i32 %0\n\
             }\n",
        );
        // Everything collapses into the entry block with the fold applied.
        assert!(out.contains("entry:\n    ret i32 3\n"));
        assert!(!out.contains("middle:"));
        assert!(!out.contains("end:"));
    }

    #[test]
    fn substitutes_block_params_on_merge() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 jmp next(i32 41)\n\
             next(%0: i32):\n\
                 %1 = add i32 %0, i32 1\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("ret i32 42"));
        assert!(!out.contains("next"));
    }

    #[test]
    fn threads_jump_only_blocks() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 cjmp i32 %0, slt, i32 0, hop, other\n\
             hop:\n\
                 jmp done\n\
             other:\n\
                 jmp done\n\
             done:\n\
                 ret i32 %0\n\
             }\n",
        );
        assert!(!out.contains("hop"));
        assert!(out.contains("cjmp i32 %0, slt, i32 0, done, done"));
    }

    #[test]
    fn removes_unreachable_blocks() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 ret i32 0\n\
             island:\n\
                 ret i32 9\n\
             }\n",
        );
        assert!(!out.contains("island"));
    }
}
