//! Loop-invariant code motion.
//!
//! In every natural loop with a single entry block, instructions whose
//! operands are all defined outside the loop are hoisted in front of the
//! entry's terminator. Loads, stores, calls and memberptrs are treated as
//! side-effecting and never move.

use std::collections::HashSet;

use tracing::trace;

use crate::ssa::cfg::ControlFlowGraph;
use crate::ssa::dominators::DominatorTree;
use crate::ssa::loops::{find_loops, Loop};
use crate::ssa::{Function, Module, Opcode, VirtualRegister};
use crate::target::Target;

use super::{for_each_reg, Pass};

pub struct LicmPass;

impl Pass for LicmPass {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            let cfg = ControlFlowGraph::build(func);
            let domtree = DominatorTree::build(&cfg);
            let loops = find_loops(&cfg, &domtree);

            for lp in &loops {
                hoist(func, lp, &cfg);
            }
        }
    }
}

fn hoist(func: &mut Function, lp: &Loop, cfg: &ControlFlowGraph) {
    if lp.entries.len() != 1 {
        return;
    }

    let entry_block = cfg.node(*lp.entries.iter().next().expect("checked")).block;

    // Hoisting one instruction can make another invariant; iterate to a
    // fixed point.
    loop {
        let mut in_loop_defs: HashSet<VirtualRegister> = HashSet::new();
        for &node in &lp.body {
            let block = func.block(cfg.node(node).block);
            for param in &block.params {
                in_loop_defs.insert(param.reg);
            }
            for instr in block.instrs.iter() {
                if let Some(dest) = instr.dest {
                    in_loop_defs.insert(dest);
                }
            }
        }

        let mut changed = false;

        let mut body: Vec<usize> = lp.body.iter().copied().collect();
        body.sort_unstable();
        for node in body {
            let block_id = cfg.node(node).block;

            for instr_id in func.block(block_id).instrs.ids().collect::<Vec<_>>() {
                let instr = func.block(block_id).instrs.get(instr_id);

                if matches!(
                    instr.opcode,
                    Opcode::Load | Opcode::Store | Opcode::Call | Opcode::Memberptr
                ) || instr.is_terminator()
                    || instr.dest.is_none()
                {
                    continue;
                }

                let mut uses_loop_def = false;
                for_each_reg(&instr.operands, &mut |reg| {
                    if in_loop_defs.contains(&reg) {
                        uses_loop_def = true;
                    }
                });
                if uses_loop_def {
                    continue;
                }

                trace!(dest = instr.dest, "hoisting loop-invariant instruction");

                let moved = func.block_mut(block_id).instrs.remove(instr_id);
                in_loop_defs.remove(&moved.dest.expect("checked above"));

                let anchor = func
                    .block(entry_block)
                    .instrs
                    .last()
                    .expect("entry without terminator");
                func.block_mut(entry_block).instrs.insert_before(anchor, moved);

                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}
