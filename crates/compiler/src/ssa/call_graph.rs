//! Module-level call graph.
//!
//! Edges come from `call` instructions whose callee operand is a function
//! defined in the module; calls through pointers and calls to external
//! functions do not create edges. Used by inlining (callee-first ordering)
//! and by dead-function elimination.

use std::collections::{HashMap, HashSet};

use super::{Module, Opcode, Operand};

pub struct CallGraph {
    /// Callee name -> caller names.
    callers: HashMap<String, HashSet<String>>,
    /// Caller name -> callee names, in first-call order.
    callees: HashMap<String, Vec<String>>,
}

impl CallGraph {
    pub fn build(module: &Module) -> CallGraph {
        let mut callers: HashMap<String, HashSet<String>> = HashMap::new();
        let mut callees: HashMap<String, Vec<String>> = HashMap::new();

        for func in &module.functions {
            let entry = callees.entry(func.name.clone()).or_default();

            for block in func.blocks.iter() {
                for instr in block.instrs.iter() {
                    if instr.opcode != Opcode::Call {
                        continue;
                    }

                    if let Some(Operand::Func(name, _)) = instr.operands.first() {
                        if !entry.contains(name) {
                            entry.push(name.clone());
                        }
                        callers
                            .entry(name.clone())
                            .or_default()
                            .insert(func.name.clone());
                    }
                }
            }
        }

        CallGraph { callers, callees }
    }

    pub fn callers(&self, func: &str) -> usize {
        self.callers.get(func).map_or(0, HashSet::len)
    }

    pub fn callees(&self, func: &str) -> &[String] {
        self.callees.get(func).map_or(&[], Vec::as_slice)
    }

    pub fn calls(&self, caller: &str, callee: &str) -> bool {
        self.callees(caller).iter().any(|name| name == callee)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    #[test]
    fn direct_calls_create_edges() {
        let module = parse_module(
            "func @leaf(i32) -> i32 {\n\
             entry:\n\
                 ret i32 0\n\
             }\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @leaf, i32 1\n\
                 %1 = call i32 @leaf, i32 2\n\
                 ret i32 %0\n\
             }\n",
        )
        .unwrap();

        let graph = CallGraph::build(&module);
        assert!(graph.calls("main", "leaf"));
        assert!(!graph.calls("leaf", "main"));
        assert_eq!(graph.callers("leaf"), 1);
        assert_eq!(graph.callees("main"), ["leaf"]);
    }

    #[test]
    fn external_calls_do_not_create_edges() {
        let module = parse_module(
            "decl @malloc(i64) -> addr\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call addr @malloc, i64 16\n\
                 ret i32 0\n\
             }\n",
        )
        .unwrap();

        let graph = CallGraph::build(&module);
        assert!(graph.callees("main").is_empty());
    }
}
