//! Natural-loop discovery.
//!
//! A back edge is a CFG edge whose target dominates its source. Each back
//! edge induces a loop: the header (the edge's target), the tail (its
//! source), the body (every block that reaches the tail without leaving the
//! region dominated by the header), the entries (header predecessors outside
//! the loop) and the exits (edges leaving the body).

use std::collections::HashSet;

use super::cfg::{ControlFlowGraph, Edge};
use super::dominators::DominatorTree;

#[derive(Debug, Clone)]
pub struct Loop {
    pub header: usize,
    pub tail: usize,
    pub body: HashSet<usize>,
    pub entries: HashSet<usize>,
    pub exits: HashSet<Edge>,
}

pub fn find_loops(cfg: &ControlFlowGraph, domtree: &DominatorTree) -> Vec<Loop> {
    let mut loops = Vec::new();

    for index in 0..cfg.nodes().len() {
        for &succ in &cfg.node(index).successors {
            if domtree.is_dominated_by(index, succ) {
                loops.push(analyze_back_edge(cfg, index, succ));
            }
        }
    }

    loops
}

fn analyze_back_edge(cfg: &ControlFlowGraph, from: usize, to: usize) -> Loop {
    let mut lp = Loop {
        header: to,
        tail: from,
        body: HashSet::from([to]),
        entries: HashSet::new(),
        exits: HashSet::new(),
    };

    collect_body(cfg, &mut lp.body, lp.tail);

    for &pred in &cfg.node(lp.header).predecessors {
        if !lp.body.contains(&pred) {
            lp.entries.insert(pred);
        }
    }

    for &node in &lp.body {
        for &succ in &cfg.node(node).successors {
            if !lp.body.contains(&succ) {
                lp.exits.insert(Edge { from: node, to: succ });
            }
        }
    }

    lp
}

fn collect_body(cfg: &ControlFlowGraph, body: &mut HashSet<usize>, node: usize) {
    if !body.insert(node) {
        return;
    }

    for &pred in &cfg.node(node).predecessors {
        collect_body(cfg, body, pred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    #[test]
    fn while_shape_loop() {
        let module = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 jmp header\n\
             header:\n\
                 cjmp i32 0, slt, i32 10, body, exit\n\
             body:\n\
                 jmp header\n\
             exit:\n\
                 ret\n\
             }\n",
        )
        .unwrap();
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        let loops = find_loops(&cfg, &domtree);
        assert_eq!(loops.len(), 1);

        let lp = &loops[0];
        let label = |index: usize| func.block(cfg.node(index).block).label.clone();

        assert_eq!(label(lp.header), "header");
        assert_eq!(label(lp.tail), "body");
        assert_eq!(lp.body.len(), 2);
        assert_eq!(lp.entries.len(), 1);
        assert_eq!(lp.exits.len(), 1);

        let exit = lp.exits.iter().next().unwrap();
        assert_eq!(label(exit.from), "header");
        assert_eq!(label(exit.to), "exit");
    }

    #[test]
    fn straight_line_code_has_no_loops() {
        let module = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 jmp next\n\
             next:\n\
                 ret\n\
             }\n",
        )
        .unwrap();
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        assert!(find_loops(&cfg, &domtree).is_empty());
    }

    #[test]
    fn nested_body_blocks_are_collected() {
        let module = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 jmp header\n\
             header:\n\
                 cjmp i32 0, slt, i32 10, a, exit\n\
             a:\n\
                 cjmp i32 0, eq, i32 1, b, c\n\
             b:\n\
                 jmp tail\n\
             c:\n\
                 jmp tail\n\
             tail:\n\
                 jmp header\n\
             exit:\n\
                 ret\n\
             }\n",
        )
        .unwrap();
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        let loops = find_loops(&cfg, &domtree);
        assert_eq!(loops.len(), 1);
        // header, a, b, c, tail
        assert_eq!(loops[0].body.len(), 5);
    }
}
