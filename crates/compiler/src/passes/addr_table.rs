//! Address-table indirection (off by default).
//!
//! For platforms that want late binding, direct symbol references are
//! replaced by loads out of a per-module table of addresses: one
//! pointer-sized global per known symbol, emitted back-to-back so the
//! table is contiguous, with the first entry carrying the `addr_table`
//! name. Uses become an `add` of the table base plus the slot offset
//! followed by a `load`.

use std::collections::HashMap;

use crate::ssa::{Instruction, Module, Opcode, Operand};
use crate::target::Target;

use super::Pass;

pub struct AddrTablePass {
    slots: HashMap<String, usize>,
}

impl AddrTablePass {
    pub fn new() -> AddrTablePass {
        AddrTablePass {
            slots: HashMap::new(),
        }
    }
}

impl Default for AddrTablePass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for AddrTablePass {
    fn name(&self) -> &'static str {
        "addr-table"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        let mut names: Vec<(String, Operand)> = Vec::new();

        for func in &module.functions {
            names.push((
                func.name.clone(),
                Operand::Func(func.name.clone(), crate::ssa::ADDR),
            ));
        }
        for decl in &module.extern_functions {
            names.push((
                decl.name.clone(),
                Operand::ExternFunc(decl.name.clone(), crate::ssa::ADDR),
            ));
        }
        for decl in &module.extern_globals {
            names.push((
                decl.name.clone(),
                Operand::ExternGlobal(decl.name.clone(), crate::ssa::ADDR),
            ));
        }

        for (index, (name, initial)) in names.into_iter().enumerate() {
            self.slots.insert(name, index);

            let global_name = if index == 0 {
                "addr_table".to_string()
            } else {
                format!("addr_table.{}", index)
            };

            module.globals.push(crate::ssa::Global {
                name: global_name,
                ty: crate::ssa::I64,
                initial,
                external: true,
            });
        }

        for func_index in 0..module.functions.len() {
            self.replace_uses(module, func_index);
        }
    }
}

impl AddrTablePass {
    fn replace_uses(&self, module: &mut Module, func_index: usize) {
        let func = &mut module.functions[func_index];

        for block_id in func.blocks.ids().collect::<Vec<_>>() {
            for instr_id in func.block(block_id).instrs.ids().collect::<Vec<_>>() {
                let operand_count = func.block(block_id).instrs.get(instr_id).operands.len();

                for operand_index in 0..operand_count {
                    let operand =
                        func.block(block_id).instrs.get(instr_id).operands[operand_index].clone();

                    let name = match &operand {
                        Operand::Func(name, _)
                        | Operand::ExternFunc(name, _)
                        | Operand::Global(name, _)
                        | Operand::ExternGlobal(name, _) => name.clone(),
                        _ => continue,
                    };

                    let Some(&slot) = self.slots.get(&name) else {
                        continue;
                    };

                    let ptr_reg = func.next_virtual_reg();
                    let value_reg = func.next_virtual_reg();

                    func.block_mut(block_id).instrs.insert_before(
                        instr_id,
                        Instruction::with_dest(
                            Opcode::Add,
                            ptr_reg,
                            vec![
                                Operand::Global("addr_table".to_string(), crate::ssa::ADDR),
                                Operand::from_int_immediate(8 * slot as i128, crate::ssa::I64),
                            ],
                        ),
                    );
                    func.block_mut(block_id).instrs.insert_before(
                        instr_id,
                        Instruction::with_dest(
                            Opcode::Load,
                            value_reg,
                            vec![
                                Operand::Type(crate::ssa::ADDR),
                                Operand::from_register(ptr_reg, crate::ssa::ADDR),
                            ],
                        ),
                    );

                    let ty = operand.ty();
                    func.block_mut(block_id).instrs.get_mut(instr_id).operands[operand_index] =
                        Operand::from_register(value_reg, ty);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    #[test]
    fn external_calls_go_through_the_table() {
        let mut module = parse_module(
            "decl @puts(addr) -> i32\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @puts, addr 0\n\
                 ret i32 %0\n\
             }\n",
        )
        .unwrap();

        AddrTablePass::new().run(&mut module, &Target::host_default());
        let out = write_module(&module);

        assert!(out.contains("global @addr_table i64"), "{}", out);
        assert!(out.contains("add addr @addr_table"), "{}", out);
        assert!(!out.contains("call i32 @puts"), "{}", out);
    }
}
