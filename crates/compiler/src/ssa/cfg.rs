//! Control-flow graph over a function's basic blocks.
//!
//! Rebuilt on demand; passes construct a fresh graph after mutating the block
//! structure instead of patching a cached one. Blocks that cannot be reached
//! from the entry are not part of the graph.

use std::collections::HashMap;

use super::{BlockId, Function, Opcode};

#[derive(Debug, Clone)]
pub struct Node {
    pub block: BlockId,
    pub predecessors: Vec<usize>,
    pub successors: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: usize,
    pub to: usize,
}

pub struct ControlFlowGraph {
    nodes: Vec<Node>,
    by_block: HashMap<BlockId, usize>,
}

impl ControlFlowGraph {
    /// Builds the graph by following terminator operands from the entry.
    pub fn build(func: &Function) -> ControlFlowGraph {
        let mut cfg = ControlFlowGraph {
            nodes: Vec::new(),
            by_block: HashMap::new(),
        };

        let entry = func.entry();
        cfg.add_node(entry);

        let mut worklist = vec![0];
        while let Some(index) = worklist.pop() {
            let block_id = cfg.nodes[index].block;
            let block = func.block(block_id);

            let Some(last) = block.last_instr() else {
                continue;
            };

            if !matches!(last.opcode, Opcode::Jmp | Opcode::Cjmp | Opcode::Fcjmp) {
                continue;
            }

            let targets: Vec<BlockId> = last
                .operands
                .iter()
                .filter_map(|operand| operand.branch_target())
                .map(|target| target.block)
                .collect();

            for target in targets {
                let succ = match cfg.by_block.get(&target) {
                    Some(&succ) => succ,
                    None => {
                        let succ = cfg.add_node(target);
                        worklist.push(succ);
                        succ
                    }
                };

                cfg.nodes[index].successors.push(succ);
                cfg.nodes[succ].predecessors.push(index);
            }
        }

        cfg
    }

    fn add_node(&mut self, block: BlockId) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            block,
            predecessors: Vec::new(),
            successors: Vec::new(),
        });
        self.by_block.insert(block, index);
        index
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.by_block.contains_key(&block)
    }

    pub fn node_of(&self, block: BlockId) -> Option<usize> {
        self.by_block.get(&block).copied()
    }

    /// Node indices in reverse postorder. The entry always comes first.
    pub fn reverse_postorder(&self) -> Vec<usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut postorder = Vec::with_capacity(self.nodes.len());
        self.postorder_visit(0, &mut visited, &mut postorder);
        postorder.reverse();
        postorder
    }

    fn postorder_visit(&self, index: usize, visited: &mut [bool], out: &mut Vec<usize>) {
        visited[index] = true;
        for &succ in &self.nodes[index].successors {
            if !visited[succ] {
                self.postorder_visit(succ, visited, out);
            }
        }
        out.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    fn diamond() -> crate::ssa::Module {
        parse_module(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 cjmp i32 %0, slt, i32 0, left, right\n\
             left:\n\
                 jmp join\n\
             right:\n\
                 jmp join\n\
             join:\n\
                 ret i32 0\n\
             }\n",
        )
        .unwrap()
    }

    #[test]
    fn diamond_edges() {
        let module = diamond();
        let func = module.function("f").unwrap();
        let cfg = ControlFlowGraph::build(func);

        assert_eq!(cfg.nodes().len(), 4);
        let entry = &cfg.node(0);
        assert_eq!(entry.successors.len(), 2);

        let join = cfg
            .nodes()
            .iter()
            .position(|node| func.block(node.block).label == "join")
            .unwrap();
        assert_eq!(cfg.node(join).predecessors.len(), 2);
    }

    #[test]
    fn unreachable_blocks_are_excluded() {
        let module = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 ret\n\
             orphan:\n\
                 ret\n\
             }\n",
        )
        .unwrap();
        let func = module.function("f").unwrap();
        let cfg = ControlFlowGraph::build(func);

        assert_eq!(cfg.nodes().len(), 1);
        let orphan = func
            .blocks
            .ids()
            .find(|&id| func.block(id).label == "orphan")
            .unwrap();
        assert!(!cfg.contains(orphan));
    }

    #[test]
    fn reverse_postorder_starts_at_entry() {
        let module = diamond();
        let func = module.function("f").unwrap();
        let cfg = ControlFlowGraph::build(func);

        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo[0], 0);
        assert_eq!(rpo.len(), 4);

        // The join block must come after both arms.
        let pos = |label: &str| {
            rpo.iter()
                .position(|&n| func.block(cfg.node(n).block).label == label)
                .unwrap()
        };
        assert!(pos("join") > pos("left"));
        assert!(pos("join") > pos("right"));
    }
}
