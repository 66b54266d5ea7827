//! Loop inversion.
//!
//! Rotates `while`-shaped loops into `do-while` shape: the header's
//! condition is duplicated into the tail, so iterating costs one
//! conditional branch instead of a branch plus a jump. Only loops with a
//! single exit edge originating at the header and a tail that jumps
//! unconditionally back are inverted; loops with `break` edges are left
//! alone.

use tracing::trace;

use crate::ssa::cfg::ControlFlowGraph;
use crate::ssa::dominators::DominatorTree;
use crate::ssa::loops::{find_loops, Loop};
use crate::ssa::{invert_comparison, Function, Instruction, Module, Opcode, Operand};
use crate::target::Target;

use super::{rename_in_block, Pass};

pub struct LoopInversionPass;

impl Pass for LoopInversionPass {
    fn name(&self) -> &'static str {
        "loop-inversion"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            run_function(func);
        }
    }
}

fn run_function(func: &mut Function) {
    // Each inversion invalidates the analyses; rebuild and retry until no
    // loop qualifies.
    loop {
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);
        let loops = find_loops(&cfg, &domtree);

        let mut changed = false;
        for lp in &loops {
            if invert(func, lp, &cfg) {
                changed = true;
                break;
            }
        }

        if !changed {
            break;
        }
    }
}

fn invert(func: &mut Function, lp: &Loop, cfg: &ControlFlowGraph) -> bool {
    // Conservative precondition: exactly one exit edge and it leaves from
    // the header.
    if lp.exits.len() != 1 {
        return false;
    }
    let exit_edge = lp.exits.iter().next().expect("checked above");
    if exit_edge.from != lp.header {
        return false;
    }

    let header_id = cfg.node(lp.header).block;
    let tail_id = cfg.node(lp.tail).block;
    let exit_id = cfg.node(exit_edge.to).block;

    let header_term = match func.block(header_id).instrs.last() {
        Some(id) => id,
        None => return false,
    };
    if !matches!(
        func.block(header_id).instrs.get(header_term).opcode,
        Opcode::Cjmp | Opcode::Fcjmp
    ) {
        return false;
    }

    // Only invert loops whose tail branches unconditionally to the header;
    // a conditional back edge means the loop was probably already inverted.
    let tail_term = match func.block(tail_id).instrs.last() {
        Some(id) => id,
        None => return false,
    };
    if func.block(tail_id).instrs.get(tail_term).opcode != Opcode::Jmp {
        return false;
    }

    // The rotation renames the header's parameters and definitions, and the
    // tail's duplicates only dominate the loop itself. A use outside the
    // loop (the exit reading the final counter, say) would lose its
    // definition, so such loops stay in `while` shape.
    let loop_blocks: std::collections::HashSet<crate::ssa::BlockId> =
        lp.body.iter().map(|&node| cfg.node(node).block).collect();
    let mut loop_defined: std::collections::HashSet<crate::ssa::VirtualRegister> = func
        .block(header_id)
        .params
        .iter()
        .map(|param| param.reg)
        .collect();
    for instr in func.block(header_id).instrs.iter() {
        if let Some(dest) = instr.dest {
            loop_defined.insert(dest);
        }
    }
    for block_id in func.blocks.ids() {
        if loop_blocks.contains(&block_id) {
            continue;
        }
        let mut escapes = false;
        for instr in func.block(block_id).instrs.iter() {
            super::for_each_reg(&instr.operands, &mut |reg| {
                if loop_defined.contains(&reg) {
                    escapes = true;
                }
            });
        }
        if escapes {
            return false;
        }
    }

    trace!(header = %func.block(header_id).label, "inverting loop");

    // Orient the header's branch so the true side enters the loop body.
    {
        let term = func.block_mut(header_id).instrs.get_mut(header_term);
        let false_block = term.operands[4]
            .branch_target()
            .expect("branch without target")
            .block;
        if false_block != exit_id {
            let comparison = term.operands[1].comparison().expect("branch without cmp");
            term.operands[1] = Operand::Comparison(invert_comparison(comparison));
            term.operands.swap(3, 4);
        }
    }

    let cond_jump = func.block(header_id).instrs.get(header_term).clone();
    let body_target = cond_jump.operands[3]
        .branch_target()
        .expect("missing true target")
        .clone();
    let exit_target = cond_jump.operands[4]
        .branch_target()
        .expect("missing false target")
        .clone();
    let back_target = func
        .block(tail_id)
        .instrs
        .get(tail_term)
        .operands[0]
        .branch_target()
        .expect("jmp without target")
        .clone();

    // The body's entry block takes over the header's parameters.
    let header_params = func.block(header_id).params.clone();
    func.block_mut(body_target.block).params = header_params.clone();

    // In the duplicated condition the loop-carried values are the ones the
    // back edge passes, not the ones this iteration entered with.
    let subst: std::collections::HashMap<crate::ssa::VirtualRegister, Operand> = header_params
        .iter()
        .zip(&back_target.args)
        .map(|(param, arg)| (param.reg, arg.clone()))
        .collect();

    // The tail now re-checks the condition itself: true continues with the
    // body entry (fed the back-edge arguments), false leaves the loop.
    let mut tail_cond = cond_jump.clone();
    tail_cond.operands[3] = Operand::BranchTarget(crate::ssa::BranchTarget {
        block: body_target.block,
        args: back_target.args.clone(),
    });
    tail_cond.operands[4] = Operand::BranchTarget(exit_target);
    apply_subst(&mut tail_cond, &subst);
    func.block_mut(tail_id).instrs.replace(tail_term, tail_cond);

    // Duplicate the header's computation in front of the tail's new branch.
    let header_instrs: Vec<Instruction> = func
        .block(header_id)
        .instrs
        .ids()
        .filter(|&id| id != header_term)
        .map(|id| {
            let mut instr = func.block(header_id).instrs.get(id).clone();
            apply_subst(&mut instr, &subst);
            instr
        })
        .collect();
    let new_tail_term = func.block(tail_id).instrs.last().expect("tail has branch");
    for instr in header_instrs {
        func.block_mut(tail_id).instrs.insert_before(new_tail_term, instr);
    }

    // The old parameter registers are now defined by the body's entry
    // block; the header gets fresh ones and passes them along when
    // entering the body.
    for (index, param) in header_params.iter().enumerate() {
        let new_reg = func.next_virtual_reg();
        func.block_mut(header_id).params[index].reg = new_reg;
        rename_in_block(func.block_mut(header_id), param.reg, new_reg);

        let term_id = func.block(header_id).instrs.last().expect("header branch");
        let term = func.block_mut(header_id).instrs.get_mut(term_id);
        if let Some(target) = term.operands[3].branch_target_mut() {
            target.args.push(Operand::from_register(new_reg, param.ty));
        }
    }

    // Registers computed in the header are now also defined by the tail's
    // copies; rename the header's definitions so each register keeps a
    // single definition.
    let defs: Vec<crate::ssa::VirtualRegister> = func
        .block(header_id)
        .instrs
        .iter()
        .filter_map(|instr| instr.dest)
        .collect();
    for old in defs {
        let new_reg = func.next_virtual_reg();
        rename_in_block(func.block_mut(header_id), old, new_reg);
    }

    true
}

fn apply_subst(
    instr: &mut Instruction,
    subst: &std::collections::HashMap<crate::ssa::VirtualRegister, Operand>,
) {
    super::for_each_value_mut(&mut instr.operands, &mut |operand| {
        if let Some(reg) = operand.register()
            && let Some(value) = subst.get(&reg)
        {
            *operand = value.with_type(operand.ty());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    #[test]
    fn while_loop_becomes_do_while() {
        let mut module = parse_module(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 jmp header(i32 0)\n\
             header(%1: i32):\n\
                 cjmp i32 %1, slt, i32 %0, body, exit\n\
             body:\n\
                 %2 = add i32 %1, i32 1\n\
                 jmp header(i32 %2)\n\
             exit:\n\
                 ret i32 0\n\
             }\n",
        )
        .unwrap();

        LoopInversionPass.run(&mut module, &Target::host_default());
        let out = write_module(&module);

        // The tail now ends in the duplicated condition; the body entry
        // carries the loop parameter.
        assert!(out.contains("body(%1: i32):"), "{}", out);
        assert!(out.contains("cjmp i32 %2, slt, i32 %0, body(i32 %2), exit"), "{}", out);
        // The header re-checks with its own fresh parameter.
        assert!(out.contains("header(%3: i32):"), "{}", out);
        assert!(out.contains("cjmp i32 %3, slt, i32 %0, body(i32 %3), exit"), "{}", out);
    }

    #[test]
    fn loops_with_body_exits_are_skipped() {
        let source = "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 jmp header\n\
             header:\n\
                 cjmp i32 %0, slt, i32 10, body, exit\n\
             body:\n\
                 cjmp i32 %0, eq, i32 5, exit, tail\n\
             tail:\n\
                 jmp header\n\
             exit:\n\
                 ret i32 0\n\
             }\n";

        let mut module = parse_module(source).unwrap();
        LoopInversionPass.run(&mut module, &Target::host_default());
        assert_eq!(write_module(&module), parse_and_print(source));
    }

    fn parse_and_print(source: &str) -> String {
        write_module(&parse_module(source).unwrap())
    }
}
