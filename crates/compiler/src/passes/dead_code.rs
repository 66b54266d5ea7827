//! Instruction-level dead-code removal.
//!
//! Deletes instructions whose destination register has no remaining uses
//! and whose opcode is free of side effects. Runs as a cleanup inside
//! stack-to-register promotion, which strips loads and stores and tends to
//! leave orphaned address computations behind.

use std::collections::HashMap;

use crate::ssa::{Function, VirtualRegister};

use super::for_each_reg;

pub fn run(func: &mut Function) {
    loop {
        let mut use_counts: HashMap<VirtualRegister, usize> = HashMap::new();

        for block in func.blocks.iter() {
            for param in &block.params {
                use_counts.entry(param.reg).or_insert(0);
            }
            for instr in block.instrs.iter() {
                for_each_reg(&instr.operands, &mut |reg| {
                    *use_counts.entry(reg).or_insert(0) += 1;
                });
            }
        }

        let mut removed = false;

        for block_id in func.blocks.ids().collect::<Vec<_>>() {
            for instr_id in func.blocks.get(block_id).instrs.ids().collect::<Vec<_>>() {
                let instr = func.blocks.get(block_id).instrs.get(instr_id);

                if instr.opcode.has_side_effects() {
                    continue;
                }

                let Some(dest) = instr.dest else {
                    continue;
                };

                if use_counts.get(&dest).copied().unwrap_or(0) == 0 {
                    func.blocks.get_mut(block_id).instrs.remove(instr_id);
                    removed = true;
                }
            }
        }

        if !removed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    #[test]
    fn removes_unused_chains() {
        let mut module = parse_module(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = add i32 %0, i32 1\n\
                 %2 = mul i32 %1, i32 2\n\
                 ret i32 %0\n\
             }\n",
        )
        .unwrap();

        run(&mut module.functions[0]);

        let func = &module.functions[0];
        let entry = func.block(func.entry());
        assert_eq!(entry.instrs.len(), 2);
    }

    #[test]
    fn keeps_side_effecting_instructions() {
        let mut module = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 %0 = alloca i32\n\
                 store i32 1, addr %0\n\
                 %1 = call i32 @f\n\
                 ret\n\
             }\n",
        )
        .unwrap();

        run(&mut module.functions[0]);

        let func = &module.functions[0];
        let entry = func.block(func.entry());
        // The call survives (side effects); the alloca survives because the
        // store uses it.
        assert_eq!(entry.instrs.len(), 4);
    }
}
