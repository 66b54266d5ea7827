//! Dominator tree and dominance frontiers.
//!
//! Implements the iterative algorithm from Cooper, Harvey and Kennedy
//! ("A Simple, Fast Dominance Algorithm") over the control-flow graph's
//! reverse postorder. Dominance frontiers drive block-parameter placement in
//! the stack-to-register pass.

use super::cfg::ControlFlowGraph;

#[derive(Debug, Clone)]
pub struct DomNode {
    /// Immediate dominator as a CFG node index. The entry is its own parent.
    pub parent: usize,
    /// CFG node indices immediately dominated by this node.
    pub children: Vec<usize>,
    /// Dominance frontier as CFG node indices.
    pub frontier: Vec<usize>,
}

pub struct DominatorTree {
    nodes: Vec<DomNode>,
}

impl DominatorTree {
    pub fn build(cfg: &ControlFlowGraph) -> DominatorTree {
        let count = cfg.nodes().len();
        let rpo = cfg.reverse_postorder();

        let mut rpo_number = vec![0usize; count];
        for (order, &node) in rpo.iter().enumerate() {
            rpo_number[node] = order;
        }

        let mut idom: Vec<Option<usize>> = vec![None; count];
        idom[0] = Some(0);

        let mut changed = true;
        while changed {
            changed = false;

            for &node in rpo.iter().skip(1) {
                let mut new_idom = None;

                for &pred in &cfg.node(node).predecessors {
                    if idom[pred].is_none() {
                        continue;
                    }

                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(other) => intersect(&idom, &rpo_number, pred, other),
                    });
                }

                if let Some(new_idom) = new_idom
                    && idom[node] != Some(new_idom)
                {
                    idom[node] = Some(new_idom);
                    changed = true;
                }
            }
        }

        let mut nodes: Vec<DomNode> = (0..count)
            .map(|node| DomNode {
                parent: idom[node].unwrap_or(0),
                children: Vec::new(),
                frontier: Vec::new(),
            })
            .collect();

        for node in 1..count {
            let parent = nodes[node].parent;
            if parent != node {
                nodes[parent].children.push(node);
            }
        }

        // Frontier computation: walk up from each join point's predecessors
        // until the immediate dominator of the join is reached.
        for node in 0..count {
            let preds = cfg.node(node).predecessors.clone();
            if preds.len() < 2 {
                continue;
            }

            for pred in preds {
                let mut runner = pred;
                while runner != nodes[node].parent {
                    if !nodes[runner].frontier.contains(&node) {
                        nodes[runner].frontier.push(node);
                    }
                    if runner == nodes[runner].parent {
                        break;
                    }
                    runner = nodes[runner].parent;
                }
            }
        }

        DominatorTree { nodes }
    }

    pub fn node(&self, index: usize) -> &DomNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True if node `a` is dominated by node `b` (both as CFG node indices).
    pub fn is_dominated_by(&self, a: usize, b: usize) -> bool {
        if a == b {
            return true;
        }

        let mut runner = a;
        while self.nodes[runner].parent != runner {
            runner = self.nodes[runner].parent;
            if runner == b {
                return true;
            }
        }

        false
    }
}

fn intersect(idom: &[Option<usize>], rpo_number: &[usize], a: usize, b: usize) -> usize {
    let mut finger_a = a;
    let mut finger_b = b;

    while finger_a != finger_b {
        while rpo_number[finger_a] > rpo_number[finger_b] {
            finger_a = idom[finger_a].expect("intersect over unprocessed node");
        }
        while rpo_number[finger_b] > rpo_number[finger_a] {
            finger_b = idom[finger_b].expect("intersect over unprocessed node");
        }
    }

    finger_a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    fn analyze(source: &str) -> (crate::ssa::Module, Vec<(String, usize)>) {
        let module = parse_module(source).unwrap();
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let labels = cfg
            .nodes()
            .iter()
            .enumerate()
            .map(|(index, node)| (func.block(node.block).label.clone(), index))
            .collect();
        (module, labels)
    }

    fn index_of(labels: &[(String, usize)], label: &str) -> usize {
        labels.iter().find(|(l, _)| l == label).unwrap().1
    }

    const DIAMOND: &str = "func @f(i32) -> i32 {\n\
        entry:\n\
            cjmp i32 %0, slt, i32 0, left, right\n\
        left:\n\
            jmp join\n\
        right:\n\
            jmp join\n\
        join:\n\
            ret i32 0\n\
        }\n";

    #[test]
    fn diamond_dominators() {
        let (module, labels) = analyze(DIAMOND);
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        let entry = index_of(&labels, "entry");
        let left = index_of(&labels, "left");
        let right = index_of(&labels, "right");
        let join = index_of(&labels, "join");

        assert_eq!(domtree.node(left).parent, entry);
        assert_eq!(domtree.node(right).parent, entry);
        // Neither arm dominates the join; it hangs off the entry.
        assert_eq!(domtree.node(join).parent, entry);

        assert!(domtree.is_dominated_by(join, entry));
        assert!(!domtree.is_dominated_by(join, left));
    }

    #[test]
    fn diamond_frontiers() {
        let (module, labels) = analyze(DIAMOND);
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        let left = index_of(&labels, "left");
        let right = index_of(&labels, "right");
        let join = index_of(&labels, "join");

        assert_eq!(domtree.node(left).frontier, vec![join]);
        assert_eq!(domtree.node(right).frontier, vec![join]);
        assert!(domtree.node(join).frontier.is_empty());
    }

    #[test]
    fn loop_header_is_its_own_frontier() {
        let (module, labels) = analyze(
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
        );
        let func = &module.functions[0];
        let cfg = ControlFlowGraph::build(func);
        let domtree = DominatorTree::build(&cfg);

        let header = index_of(&labels, "header");
        let body = index_of(&labels, "body");

        assert_eq!(domtree.node(body).parent, header);
        assert!(domtree.node(body).frontier.contains(&header));
        assert!(domtree.node(header).frontier.contains(&header));
    }
}
