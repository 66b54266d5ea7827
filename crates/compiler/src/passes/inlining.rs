//! Call-graph guided inlining.
//!
//! Callees are visited before their callers, so inlining begins deep in
//! the call graph and composed wins bubble upward. A callee qualifies when
//! it is small enough for its situation: a single caller allows up to 64
//! blocks, a single-block body up to 64 instructions, anything else at
//! most 24 instructions in total. Self-recursion and mutual inlining
//! cycles are rejected.
//!
//! Inlining rewrites `loadarg` into the actual argument operand, renumbers
//! every callee register into the caller's space, clones the callee's
//! blocks (preserving block parameters), splits the caller block around
//! the call, and routes the callee's return to the continuation block.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::ssa::call_graph::CallGraph;
use crate::ssa::{
    BlockId, BlockParam, Function, Instruction, Module, Opcode, Operand, VirtualRegister,
};
use crate::target::Target;

use super::{precompute, replace_in_func, Pass};

pub struct InliningPass {
    visited: HashSet<String>,
    /// (inlinee, host) pairs already performed; inlining the host back into
    /// the inlinee would cycle.
    inlined: HashSet<(String, String)>,
}

impl InliningPass {
    pub fn new() -> InliningPass {
        InliningPass {
            visited: HashSet::new(),
            inlined: HashSet::new(),
        }
    }
}

impl Default for InliningPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for InliningPass {
    fn name(&self) -> &'static str {
        "inlining"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        self.visited.clear();
        self.inlined.clear();

        let graph = CallGraph::build(module);
        let roots: Vec<String> = module
            .functions
            .iter()
            .filter(|func| func.global)
            .map(|func| func.name.clone())
            .collect();

        for root in roots {
            self.visit(module, &graph, &root);
        }
    }
}

/// Snapshot of a callee taken before the caller is mutated.
struct CalleeClone {
    blocks: Vec<ClonedBlock>,
    /// Callee block id -> position in `blocks`, for branch-target
    /// remapping.
    index_of: HashMap<BlockId, usize>,
}

struct ClonedBlock {
    params: Vec<BlockParam>,
    instrs: Vec<Instruction>,
}

impl InliningPass {
    fn visit(&mut self, module: &mut Module, graph: &CallGraph, name: &str) {
        if !self.visited.insert(name.to_string()) {
            return;
        }

        for callee in graph.callees(name).to_vec() {
            self.visit(module, graph, &callee);
        }

        // Rescan after every successful inline; the block structure
        // changed under the iteration.
        loop {
            if !self.inline_one_call(module, graph, name) {
                break;
            }
        }
    }

    fn inline_one_call(&mut self, module: &mut Module, graph: &CallGraph, caller: &str) -> bool {
        let Some(caller_index) = module.functions.iter().position(|f| f.name == caller) else {
            return false;
        };

        // Find the next inlinable call site.
        let mut site = None;
        'outer: for block_id in module.functions[caller_index].blocks.ids() {
            let block = module.functions[caller_index].block(block_id);
            for instr_id in block.instrs.ids() {
                let instr = block.instrs.get(instr_id);
                if instr.opcode != Opcode::Call {
                    continue;
                }
                let Some(Operand::Func(callee, _)) = instr.operands.first() else {
                    continue;
                };

                if !self.is_inlining_legal(caller, callee)
                    || !is_inlining_beneficial(module, graph, callee)
                {
                    continue;
                }

                site = Some((block_id, instr_id, callee.clone()));
                break 'outer;
            }
        }

        let Some((call_block, call_instr, callee_name)) = site else {
            return false;
        };

        trace!(callee = %callee_name, caller, "inlining");
        self.inlined.insert((callee_name.clone(), caller.to_string()));

        let callee_clone = clone_callee(module.function(&callee_name).expect("callee exists"));
        inline_at(
            &mut module.functions[caller_index],
            call_block,
            call_instr,
            &callee_clone,
        );

        precompute::precompute_function(&mut module.functions[caller_index]);
        true
    }

    fn is_inlining_legal(&self, caller: &str, callee: &str) -> bool {
        if caller == callee {
            return false;
        }

        // The caller was inlined into the callee at some point; doing the
        // reverse would bounce code back and forth.
        !self.inlined.contains(&(caller.to_string(), callee.to_string()))
    }
}

fn is_inlining_beneficial(module: &Module, graph: &CallGraph, callee: &str) -> bool {
    let Some(func) = module.function(callee) else {
        return false;
    };

    if graph.callers(callee) == 1 {
        return func.blocks.len() <= 64;
    }

    if func.blocks.len() == 1 {
        return func.block(func.entry()).instrs.len() <= 64;
    }

    let total: usize = func.blocks.iter().map(|block| block.instrs.len()).sum();
    total <= 24
}

fn clone_callee(callee: &Function) -> CalleeClone {
    let mut blocks = Vec::new();

    for block_id in callee.blocks.ids() {
        let block = callee.block(block_id);
        blocks.push(ClonedBlock {
            params: block.params.clone(),
            instrs: block.instrs.iter().cloned().collect(),
        });
    }

    let index_of: HashMap<BlockId, usize> = callee
        .blocks
        .ids()
        .enumerate()
        .map(|(index, id)| (id, index))
        .collect();

    CalleeClone { blocks, index_of }
}

fn inline_at(
    caller: &mut Function,
    call_block: BlockId,
    call_instr: crate::ssa::InstrId,
    callee: &CalleeClone,
) {
    let call = caller.block(call_block).instrs.get(call_instr).clone();
    let call_dest = call.dest;
    let call_operands = call.operands.clone();

    let single_block = callee.blocks.len() == 1;

    let end_block = if single_block {
        None
    } else {
        Some(caller.split_block_after(call_block, call_instr))
    };

    // Prepass: argument loads become the call's operands, foldable
    // instructions fold, every other destination gets a fresh register.
    let mut reg2val: HashMap<VirtualRegister, Operand> = HashMap::new();
    let mut reg2reg: HashMap<VirtualRegister, VirtualRegister> = HashMap::new();
    let mut removed: HashSet<(usize, usize)> = HashSet::new();
    let mut return_val: Option<Operand> = None;

    for (block_index, block) in callee.blocks.iter().enumerate() {
        for (instr_index, instr) in block.instrs.iter().enumerate() {
            match instr.opcode {
                Opcode::Loadarg => {
                    let arg_index = instr.operands[1]
                        .int_immediate()
                        .expect("loadarg without index") as usize;
                    let value = call_operands[arg_index + 1].clone();
                    reg2val.insert(instr.dest.expect("loadarg without dest"), value);
                    removed.insert((block_index, instr_index));
                    continue;
                }
                Opcode::Ret => {
                    if !instr.operands.is_empty() && call_dest.is_some() {
                        return_val = Some(instr.operands[0].clone());
                    }
                    // With a single block the return needs no jump at all.
                    if single_block {
                        removed.insert((block_index, instr_index));
                    }
                    continue;
                }
                _ => {}
            }

            if let Some(result) = precompute::precompute_result(instr) {
                reg2val.insert(instr.dest.expect("foldable without dest"), result);
                removed.insert((block_index, instr_index));
                continue;
            }

            if let Some(dest) = instr.dest {
                reg2reg.insert(dest, caller.next_virtual_reg());
            }
        }
    }

    // Create the landing blocks, renumbering block parameters.
    let mut block_map: Vec<BlockId> = Vec::with_capacity(callee.blocks.len());
    if single_block {
        block_map.push(call_block);
    } else {
        let end = end_block.expect("multi-block inline without end block");

        for (index, block) in callee.blocks.iter().enumerate() {
            let label = format!("inlined.{}", index);
            let new_block = caller.blocks.insert_before(end, crate::ssa::BasicBlock::new(label));

            if index > 0 {
                let params: Vec<BlockParam> = block
                    .params
                    .iter()
                    .map(|param| {
                        let new_reg = caller.next_virtual_reg();
                        reg2reg.insert(param.reg, new_reg);
                        BlockParam {
                            reg: new_reg,
                            ty: param.ty,
                        }
                    })
                    .collect();
                caller.block_mut(new_block).params = params;
            }

            block_map.push(new_block);
        }
    }

    let remap_value = |operand: &Operand| -> Operand {
        if let Some(reg) = operand.register() {
            if let Some(&new_reg) = reg2reg.get(&reg) {
                return Operand::from_register(new_reg, operand.ty());
            }
            if let Some(value) = reg2val.get(&reg) {
                return value.with_type(operand.ty());
            }
        }
        operand.clone()
    };

    for (block_index, block) in callee.blocks.iter().enumerate() {
        for (instr_index, instr) in block.instrs.iter().enumerate() {
            if removed.contains(&(block_index, instr_index)) {
                continue;
            }

            // Returns become jumps to the continuation; their target is a
            // caller block, so they bypass the block remapping below.
            if instr.opcode == Opcode::Ret {
                let end = end_block.expect("return outside a single block");
                caller.block_mut(block_map[block_index]).append(Instruction::new(
                    Opcode::Jmp,
                    vec![Operand::BranchTarget(crate::ssa::BranchTarget {
                        block: end,
                        args: Vec::new(),
                    })],
                ));
                continue;
            }

            let mut inline_instr = instr.clone();

            if let Some(dest) = inline_instr.dest
                && let Some(&new_reg) = reg2reg.get(&dest)
            {
                inline_instr.dest = Some(new_reg);
            }

            for operand in &mut inline_instr.operands {
                if let Some(target) = operand.branch_target_mut() {
                    let clone_index = callee.index_of[&target.block];
                    target.block = block_map[clone_index];
                    for arg in &mut target.args {
                        *arg = remap_value(arg);
                    }
                } else {
                    *operand = remap_value(operand);
                }
            }

            if single_block {
                caller
                    .block_mut(call_block)
                    .instrs
                    .insert_before(call_instr, inline_instr);
            } else {
                caller.block_mut(block_map[block_index]).append(inline_instr);
            }
        }
    }

    // Route the caller into the inlined entry and stitch the result.
    if !single_block {
        caller.block_mut(call_block).instrs.remove(call_instr);
        caller.block_mut(call_block).append(Instruction::new(
            Opcode::Jmp,
            vec![Operand::BranchTarget(crate::ssa::BranchTarget {
                block: block_map[0],
                args: Vec::new(),
            })],
        ));
    } else {
        caller.block_mut(call_block).instrs.remove(call_instr);
    }

    if let (Some(dest), Some(value)) = (call_dest, return_val) {
        let value = remap_value(&value);
        replace_in_func(caller, dest, &value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        for func in &mut module.functions {
            if func.name == "main" {
                func.global = true;
            }
        }
        InliningPass::new().run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn single_block_callee_disappears_into_caller() {
        let out = run(
            "func @add_one(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = add i32 %0, i32 1\n\
                 ret i32 %1\n\
             }\n\
             func @main(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = call i32 @add_one, i32 %0\n\
                 ret i32 %1\n\
             }\n",
        );

        let main_section = out.split("func @main").nth(1).unwrap();
        assert!(!main_section.contains("call"), "{}", out);
        assert!(main_section.contains("add i32 %0, i32 1"), "{}", out);
    }

    #[test]
    fn constant_argument_folds_through() {
        let out = run(
            "func @add_one(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = add i32 %0, i32 1\n\
                 ret i32 %1\n\
             }\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @add_one, i32 41\n\
                 ret i32 %0\n\
             }\n",
        );

        let main_section = out.split("func @main").nth(1).unwrap();
        assert!(main_section.contains("ret i32 42"), "{}", out);
    }

    #[test]
    fn recursive_functions_are_not_inlined() {
        let out = run(
            "func @loop(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = call i32 @loop, i32 %0\n\
                 ret i32 %1\n\
             }\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @loop, i32 3\n\
                 ret i32 %0\n\
             }\n",
        );

        let loop_section = out.split("func @loop").nth(1).unwrap();
        let loop_section = loop_section.split("func ").next().unwrap();
        assert!(loop_section.contains("call i32 @loop"), "{}", out);
    }

    #[test]
    fn multi_block_callee_splits_the_caller() {
        let out = run(
            "func @abs(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 cjmp i32 %0, slt, i32 0, neg, pos\n\
             neg:\n\
                 %1 = sub i32 0, i32 %0\n\
                 jmp done(i32 %1)\n\
             pos:\n\
                 jmp done(i32 %0)\n\
             done(%2: i32):\n\
                 ret i32 %2\n\
             }\n\
             func @main(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = call i32 @abs, i32 %0\n\
                 %2 = add i32 %1, i32 10\n\
                 ret i32 %2\n\
             }\n",
        );

        let main_section = out.split("func @main").nth(1).unwrap();
        assert!(!main_section.contains("call"), "{}", out);
        assert!(main_section.contains("inlined."), "{}", out);
        assert!(main_section.contains("cjmp"), "{}", out);
    }
}
