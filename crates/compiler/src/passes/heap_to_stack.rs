//! Heap-to-stack promotion.
//!
//! A `malloc` with an immediate size whose result is freed in the same
//! block becomes an entry-block `alloca` of that many bytes; both calls are
//! deleted. Closure contexts that never escape their creating block are
//! the main beneficiary.

use std::collections::HashMap;

use crate::ssa::{
    Function, Instruction, InstrId, Module, Opcode, Operand, Primitive, Type, VirtualRegister,
};
use crate::target::Target;

use super::Pass;

pub struct HeapToStackPass;

impl Pass for HeapToStackPass {
    fn name(&self) -> &'static str {
        "heap-to-stack"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            run_function(func);
        }
    }
}

fn run_function(func: &mut Function) {
    for block_id in func.blocks.ids().collect::<Vec<_>>() {
        let mut heap_allocs: HashMap<VirtualRegister, InstrId> = HashMap::new();
        let mut replaceable: Vec<(InstrId, InstrId)> = Vec::new();

        for instr_id in func.block(block_id).instrs.ids() {
            let instr = func.block(block_id).instrs.get(instr_id);
            if instr.opcode != Opcode::Call {
                continue;
            }

            let Some(Operand::ExternFunc(name, _)) = instr.operands.first() else {
                continue;
            };

            match name.as_str() {
                "malloc" => {
                    let Some(dest) = instr.dest else {
                        continue;
                    };
                    if instr.operands.get(1).is_none_or(|arg| !arg.is_int_immediate()) {
                        continue;
                    }
                    heap_allocs.insert(dest, instr_id);
                }
                "free" => {
                    let Some(arg) = instr.operands.get(1).and_then(Operand::register) else {
                        continue;
                    };
                    if let Some(&alloc) = heap_allocs.get(&arg) {
                        replaceable.push((alloc, instr_id));
                    }
                }
                _ => {}
            }
        }

        for (alloc_id, free_id) in replaceable {
            let alloc = func.block(block_id).instrs.get(alloc_id);
            let reg = alloc.dest.expect("tracked malloc without dest");
            let size = alloc.operands[1]
                .int_immediate()
                .expect("tracked malloc without immediate size");

            let alloca = Instruction::with_dest(
                Opcode::Alloca,
                reg,
                vec![Operand::Type(Type::array(Primitive::I8, size as u32))],
            );

            let entry = func.entry();
            match func.block(entry).instrs.first() {
                Some(first) => {
                    func.block_mut(entry).instrs.insert_before(first, alloca);
                }
                None => {
                    func.block_mut(entry).append(alloca);
                }
            }

            func.block_mut(block_id).instrs.remove(alloc_id);
            func.block_mut(block_id).instrs.remove(free_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    #[test]
    fn paired_malloc_free_becomes_alloca() {
        let mut module = parse_module(
            "decl @malloc(i64) -> addr\n\
             decl @free(addr) -> void\n\
             func @f() -> i32 {\n\
             entry:\n\
                 %0 = call addr @malloc, i64 16\n\
                 store i32 7, addr %0\n\
                 %1 = load i32, addr %0\n\
                 call void @free, addr %0\n\
                 ret i32 %1\n\
             }\n",
        )
        .unwrap();

        HeapToStackPass.run(&mut module, &Target::host_default());
        let out = write_module(&module);

        assert!(out.contains("%0 = alloca i8[16]"), "{}", out);
        assert!(!out.contains("malloc"));
        assert!(!out.contains("free"));
    }

    #[test]
    fn unpaired_malloc_is_kept() {
        let source = "decl @malloc(i64) -> addr\n\
             func @f() -> addr {\n\
             entry:\n\
                 %0 = call addr @malloc, i64 16\n\
                 ret addr %0\n\
             }\n";
        let mut module = parse_module(source).unwrap();
        HeapToStackPass.run(&mut module, &Target::host_default());
        assert!(write_module(&module).contains("malloc"));
    }

    #[test]
    fn dynamic_size_is_kept() {
        let source = "decl @malloc(i64) -> addr\n\
             decl @free(addr) -> void\n\
             func @f(i64) -> void {\n\
             entry:\n\
                 %0 = loadarg i64, i32 0\n\
                 %1 = call addr @malloc, i64 %0\n\
                 call void @free, addr %1\n\
                 ret\n\
             }\n";
        let mut module = parse_module(source).unwrap();
        HeapToStackPass.run(&mut module, &Target::host_default());
        assert!(write_module(&module).contains("malloc"));
    }
}
