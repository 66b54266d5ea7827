//! Canonicalization.
//!
//! Rewrites `offsetptr` with a constant element offset into a struct-typed
//! base as the `memberptr` of the member living at that byte offset, which
//! lets scalar replacement and the validator reason about the access.

use crate::ssa::{Function, Instruction, Module, Opcode, Operand, Type, VirtualRegister};
use crate::target::{DataLayout, Target};

use super::Pass;

pub struct CanonicalizePass;

impl Pass for CanonicalizePass {
    fn name(&self) -> &'static str {
        "canonicalization"
    }

    fn run(&mut self, module: &mut Module, target: &Target) {
        let layout = target.data_layout();

        for func_index in 0..module.functions.len() {
            run_function(module, func_index, &layout);
        }
    }
}

fn run_function(module: &mut Module, func_index: usize, layout: &DataLayout) {
    let block_ids: Vec<_> = module.functions[func_index].blocks.ids().collect();

    for block_id in block_ids {
        let instr_ids: Vec<_> = module.functions[func_index]
            .block(block_id)
            .instrs
            .ids()
            .collect();

        for instr_id in instr_ids {
            let func = &module.functions[func_index];
            let instr = func.block(block_id).instrs.get(instr_id);
            if instr.opcode != Opcode::Offsetptr {
                continue;
            }

            let Some(base) = instr.operands[0].register() else {
                continue;
            };
            let Some(offset) = instr.operands[1].int_immediate() else {
                continue;
            };
            let Operand::Type(element_ty) = instr.operands[2] else {
                continue;
            };

            // The base must be a struct-typed stack slot.
            let Some(base_ty) = alloca_type(func, base) else {
                continue;
            };
            let Some(struct_id) = base_ty.struct_id() else {
                continue;
            };
            if base_ty.len != 1 {
                continue;
            }

            let byte_offset = offset as i64 * layout.size(element_ty, module) as i64;
            if byte_offset < 0 {
                continue;
            }

            let member_count = module.structure(struct_id).members.len();
            let mut replacement = None;
            for index in 0..member_count {
                let member_offset = layout.member_offset(struct_id, index, module) as i64;
                if member_offset == byte_offset {
                    replacement = Some(index);
                    break;
                }
                if member_offset > byte_offset {
                    break;
                }
            }

            let Some(member_index) = replacement else {
                continue;
            };

            let dest = instr.dest.expect("offsetptr without dest");
            let base_operand = instr.operands[0].clone();
            module.functions[func_index]
                .block_mut(block_id)
                .instrs
                .replace(
                    instr_id,
                    Instruction::with_dest(
                        Opcode::Memberptr,
                        dest,
                        vec![
                            Operand::Type(base_ty),
                            base_operand,
                            Operand::from_int_immediate(member_index as i128, crate::ssa::I32),
                        ],
                    ),
                );
        }
    }
}

/// The value type of `reg` when it is defined by an `alloca`.
fn alloca_type(func: &Function, reg: VirtualRegister) -> Option<Type> {
    for block in func.blocks.iter() {
        for instr in block.instrs.iter() {
            if instr.dest == Some(reg) {
                if instr.opcode != Opcode::Alloca {
                    return None;
                }
                return match instr.operands[0] {
                    Operand::Type(ty) => Some(ty),
                    _ => None,
                };
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    #[test]
    fn constant_offset_becomes_memberptr() {
        let mut module = parse_module(
            "struct @Pair {\n\
                 i32 first;\n\
                 i32 second;\n\
             }\n\
             func @f() -> i32 {\n\
             entry:\n\
                 %0 = alloca @Pair\n\
                 %1 = offsetptr addr %0, i64 1, i32\n\
                 %2 = load i32, addr %1\n\
                 ret i32 %2\n\
             }\n",
        )
        .unwrap();

        CanonicalizePass.run(&mut module, &Target::host_default());
        let out = write_module(&module);

        assert!(
            out.contains("%1 = memberptr @Pair, addr %0, i32 1"),
            "{}",
            out
        );
        assert!(!out.contains("offsetptr"));
    }

    #[test]
    fn misaligned_offset_is_kept() {
        let mut module = parse_module(
            "struct @Wide {\n\
                 i64 a;\n\
                 i64 b;\n\
             }\n\
             func @f() -> addr {\n\
             entry:\n\
                 %0 = alloca @Wide\n\
                 %1 = offsetptr addr %0, i64 1, i32\n\
                 ret addr %1\n\
             }\n",
        )
        .unwrap();

        CanonicalizePass.run(&mut module, &Target::host_default());
        let out = write_module(&module);
        assert!(out.contains("offsetptr"));
    }
}
