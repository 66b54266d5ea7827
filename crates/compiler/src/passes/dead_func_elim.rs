//! Dead-function elimination.
//!
//! Reachability walk from the module's roots: functions marked global
//! (exposed, dllexport, `main`) and functions referenced by global
//! initializers. Anything not reached is deleted.

use std::collections::HashSet;

use crate::ssa::{Module, Operand};
use crate::target::Target;

use super::Pass;

pub struct DeadFuncElimPass;

impl Pass for DeadFuncElimPass {
    fn name(&self) -> &'static str {
        "dead-func-elimination"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        let mut used: HashSet<String> = HashSet::new();
        let mut worklist: Vec<String> = Vec::new();

        for func in &module.functions {
            if func.global {
                worklist.push(func.name.clone());
            }
        }

        for global in &module.globals {
            collect_funcs(&global.initial, &mut worklist);
        }

        while let Some(name) = worklist.pop() {
            if !used.insert(name.clone()) {
                continue;
            }

            let Some(func) = module.function(&name) else {
                continue;
            };

            for block in func.blocks.iter() {
                for instr in block.instrs.iter() {
                    for operand in &instr.operands {
                        collect_funcs(operand, &mut worklist);
                    }
                }
            }
        }

        module
            .functions
            .retain(|func| func.global || used.contains(&func.name));
    }
}

fn collect_funcs(operand: &Operand, worklist: &mut Vec<String>) {
    match operand {
        Operand::Func(name, _) => worklist.push(name.clone()),
        Operand::BranchTarget(target) => {
            for arg in &target.args {
                collect_funcs(arg, worklist);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    #[test]
    fn unreachable_functions_are_deleted() {
        let mut module = parse_module(
            "func @helper() -> i32 {\n\
             entry:\n\
                 ret i32 1\n\
             }\n\
             func @orphan() -> i32 {\n\
             entry:\n\
                 ret i32 2\n\
             }\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @helper\n\
                 ret i32 %0\n\
             }\n",
        )
        .unwrap();
        module.function_mut("main").unwrap().global = true;

        DeadFuncElimPass.run(&mut module, &Target::host_default());

        assert!(module.function("main").is_some());
        assert!(module.function("helper").is_some());
        assert!(module.function("orphan").is_none());
    }

    #[test]
    fn function_typed_globals_are_roots() {
        let mut module = parse_module(
            "global @handler addr = addr @callback\n\
             func @callback() -> void {\n\
             entry:\n\
                 ret\n\
             }\n",
        )
        .unwrap();

        DeadFuncElimPass.run(&mut module, &Target::host_default());
        assert!(module.function("callback").is_some());
    }
}
