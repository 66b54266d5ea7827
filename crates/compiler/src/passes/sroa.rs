//! Scalar replacement of aggregates.
//!
//! Entry-block allocas of struct type whose address never escapes into a
//! context other than `load`/`store`/`memberptr` are split into per-member
//! allocas. `memberptr` chains into split values are rewritten to the split
//! slots, and `copy` instructions between splittable values are expanded
//! into member-wise load/store pairs. The stack-to-register pass then
//! promotes the scalar pieces.

use std::collections::HashMap;

use crate::ssa::{
    BlockId, Function, Instruction, InstrId, Module, Opcode, Operand, Type, VirtualRegister,
};
use crate::target::Target;

use super::{replace_in_func, Pass};

pub struct SroaPass {
    values: Vec<StackValue>,
    roots: HashMap<VirtualRegister, usize>,
    /// memberptr destination registers pointing into tracked values.
    ptr_defs: HashMap<VirtualRegister, usize>,
}

struct StackValue {
    alloca_block: BlockId,
    alloca_instr: InstrId,
    ty: Type,
    parent: Option<usize>,
    members: Vec<usize>,
    splittable: bool,
    split_alloca: Option<VirtualRegister>,
}

impl SroaPass {
    pub fn new() -> SroaPass {
        SroaPass {
            values: Vec::new(),
            roots: HashMap::new(),
            ptr_defs: HashMap::new(),
        }
    }
}

impl Default for SroaPass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for SroaPass {
    fn name(&self) -> &'static str {
        "sroa"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for index in 0..module.functions.len() {
            self.values.clear();
            self.roots.clear();
            self.ptr_defs.clear();

            self.run_function(module, index);
        }
    }
}

impl SroaPass {
    fn run_function(&mut self, module: &mut Module, func_index: usize) {
        self.collect_stack_values(module, func_index);
        self.collect_uses(module, func_index);

        let mut root_indices: Vec<usize> = self.roots.values().copied().collect();
        root_indices.sort_unstable();
        for root in root_indices {
            self.split_root(module, func_index, root);
        }

        self.split_copies(module, func_index);
        self.apply_splits(module, func_index);
    }

    fn collect_stack_values(&mut self, module: &Module, func_index: usize) {
        let func = &module.functions[func_index];

        for block_id in func.blocks.ids() {
            for instr_id in func.block(block_id).instrs.ids() {
                let instr = func.block(block_id).instrs.get(instr_id);
                if instr.opcode != Opcode::Alloca {
                    continue;
                }

                let ty = match instr.operands[0] {
                    Operand::Type(ty) => ty,
                    _ => continue,
                };
                if !is_aggregate(ty) {
                    continue;
                }

                let index = self.values.len();
                self.values.push(StackValue {
                    alloca_block: block_id,
                    alloca_instr: instr_id,
                    ty,
                    parent: None,
                    members: Vec::new(),
                    splittable: is_splitting_possible(module, ty),
                    split_alloca: None,
                });
                self.roots
                    .insert(instr.dest.expect("alloca without dest"), index);

                self.collect_members(module, index);
            }
        }
    }

    fn collect_members(&mut self, module: &Module, value_index: usize) {
        let ty = self.values[value_index].ty;
        let Some(struct_id) = ty.struct_id() else {
            return;
        };

        let member_types: Vec<Type> = module
            .structure(struct_id)
            .members
            .iter()
            .map(|member| member.ty)
            .collect();

        for member_ty in member_types {
            let member_index = self.values.len();
            self.values.push(StackValue {
                alloca_block: self.values[value_index].alloca_block,
                alloca_instr: self.values[value_index].alloca_instr,
                ty: member_ty,
                parent: Some(value_index),
                members: Vec::new(),
                splittable: is_splitting_possible(module, member_ty),
                split_alloca: None,
            });
            self.values[value_index].members.push(member_index);

            if is_aggregate(member_ty) {
                self.collect_members(module, member_index);
            }
        }
    }

    fn collect_uses(&mut self, module: &Module, func_index: usize) {
        let func = &module.functions[func_index];

        for block_id in func.blocks.ids() {
            for instr_id in func.block(block_id).instrs.ids() {
                let instr = func.block(block_id).instrs.get(instr_id);

                if instr.opcode == Opcode::Memberptr
                    && instr.operands[1].is_register()
                {
                    self.analyze_memberptr(instr);
                    continue;
                }

                // Whole-value loads and stores pin the value itself; uses
                // through member pointers stop further splitting below that
                // member only.
                if matches!(instr.opcode, Opcode::Load | Opcode::Store) {
                    let mut pinned = Vec::new();
                    super::for_each_reg(&instr.operands, &mut |reg| {
                        if let Some(&root) = self.roots.get(&reg) {
                            pinned.push(root);
                        } else if let Some(&member) = self.ptr_defs.get(&reg) {
                            pinned.push(member);
                        }
                    });
                    for value in pinned {
                        self.disable_splitting(value);
                    }
                    continue;
                }

                if instr.opcode == Opcode::Copy {
                    // Expanded member-wise later.
                    continue;
                }

                // Any other context means the address escapes.
                let mut escaped = Vec::new();
                super::for_each_reg(&instr.operands, &mut |reg| {
                    if let Some(&member) = self.ptr_defs.get(&reg) {
                        escaped.push(member);
                    }
                    if let Some(&root) = self.roots.get(&reg) {
                        escaped.push(root);
                    }
                });
                for value in escaped {
                    self.disable_splitting(value);
                }
            }
        }
    }

    fn analyze_memberptr(&mut self, instr: &Instruction) {
        let Operand::Type(ty) = instr.operands[0] else {
            return;
        };
        let Some(base) = instr.operands[1].register() else {
            return;
        };
        let Some(member_index) = instr.operands[2].int_immediate() else {
            return;
        };
        let Some(dest) = instr.dest else {
            return;
        };

        let value_index = match self.roots.get(&base) {
            Some(&index) => index,
            None => match self.ptr_defs.get(&base) {
                Some(&index) => index,
                None => return,
            },
        };

        // A pointer cast between the definition and the memberptr leaves
        // the types out of sync; don't track through it.
        if ty != self.values[value_index].ty {
            return;
        }

        let member = self.values[value_index].members[member_index as usize];
        self.ptr_defs.insert(dest, member);
    }

    fn disable_splitting(&mut self, value: usize) {
        self.values[value].splittable = false;

        let members = self.values[value].members.clone();
        for member in members {
            self.disable_splitting(member);
        }
    }

    fn split_root(&mut self, module: &mut Module, func_index: usize, root: usize) {
        if !self.values[root].splittable || !is_aggregate(self.values[root].ty) {
            return;
        }

        let members = self.values[root].members.clone();
        for member in members {
            self.split_member(module, func_index, member);
        }

        let func = &mut module.functions[func_index];
        let block = self.values[root].alloca_block;
        func.block_mut(block).instrs.remove(self.values[root].alloca_instr);
    }

    fn split_member(&mut self, module: &mut Module, func_index: usize, value: usize) {
        if self.values[value].splittable && is_aggregate(self.values[value].ty) {
            let members = self.values[value].members.clone();
            for member in members {
                self.split_member(module, func_index, member);
            }
            return;
        }

        let func = &mut module.functions[func_index];
        let reg = func.next_virtual_reg();
        let block = self.values[value].alloca_block;
        let anchor = self.values[value].alloca_instr;

        func.block_mut(block).instrs.insert_before(
            anchor,
            Instruction::with_dest(
                Opcode::Alloca,
                reg,
                vec![Operand::Type(self.values[value].ty)],
            ),
        );
        self.values[value].split_alloca = Some(reg);
    }

    /// Replaces aggregate copies between tracked values with member-wise
    /// load/store pairs, descending into nested aggregates.
    fn split_copies(&mut self, module: &mut Module, func_index: usize) {
        let block_ids: Vec<BlockId> = module.functions[func_index].blocks.ids().collect();

        for block_id in block_ids {
            let instr_ids: Vec<InstrId> =
                module.functions[func_index].block(block_id).instrs.ids().collect();

            for instr_id in instr_ids {
                let instr = module.functions[func_index].block(block_id).instrs.get(instr_id);
                if instr.opcode != Opcode::Copy {
                    continue;
                }

                let dst = instr.operands[0].clone();
                let src = instr.operands[1].clone();
                let ty = match instr.operands[2] {
                    Operand::Type(ty) => ty,
                    _ => continue,
                };

                if !is_aggregate(ty) || dst.ty() != src.ty() {
                    continue;
                }
                let (Some(dst_reg), Some(src_reg)) = (dst.register(), src.register()) else {
                    continue;
                };

                let dst_ref = Ref {
                    ptr: dst_reg,
                    value: self.find_value(dst_reg),
                };
                let src_ref = Ref {
                    ptr: src_reg,
                    value: self.find_value(src_reg),
                };

                self.copy_members(module, func_index, block_id, instr_id, dst_ref, src_ref, ty);
                module.functions[func_index]
                    .block_mut(block_id)
                    .instrs
                    .remove(instr_id);
            }
        }
    }

    fn find_value(&self, reg: VirtualRegister) -> Option<usize> {
        self.roots
            .get(&reg)
            .or_else(|| self.ptr_defs.get(&reg))
            .copied()
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_members(
        &mut self,
        module: &mut Module,
        func_index: usize,
        block: BlockId,
        before: InstrId,
        dst: Ref,
        src: Ref,
        ty: Type,
    ) {
        if !is_splitting_possible(module, ty) {
            let instr = Instruction::new(
                Opcode::Copy,
                vec![
                    Operand::from_register(dst.ptr, crate::ssa::ADDR),
                    Operand::from_register(src.ptr, crate::ssa::ADDR),
                    Operand::Type(ty),
                ],
            );
            module.functions[func_index]
                .block_mut(block)
                .instrs
                .insert_before(before, instr);
            return;
        }

        let struct_id = ty.struct_id().expect("splittable non-struct");
        let member_types: Vec<Type> = module
            .structure(struct_id)
            .members
            .iter()
            .map(|member| member.ty)
            .collect();

        for (index, member_ty) in member_types.into_iter().enumerate() {
            let member_dst = self.final_memberptr(module, func_index, block, before, &dst, ty, index);
            let member_src = self.final_memberptr(module, func_index, block, before, &src, ty, index);

            if is_aggregate(member_ty) {
                self.copy_members(
                    module, func_index, block, before, member_dst, member_src, member_ty,
                );
                continue;
            }

            let func = &mut module.functions[func_index];
            let tmp = func.next_virtual_reg();
            func.block_mut(block).instrs.insert_before(
                before,
                Instruction::with_dest(
                    Opcode::Load,
                    tmp,
                    vec![
                        Operand::Type(member_ty),
                        Operand::from_register(member_src.ptr, crate::ssa::ADDR),
                    ],
                ),
            );
            func.block_mut(block).instrs.insert_before(
                before,
                Instruction::new(
                    Opcode::Store,
                    vec![
                        Operand::from_register(tmp, member_ty),
                        Operand::from_register(member_dst.ptr, crate::ssa::ADDR),
                    ],
                ),
            );
        }
    }

    /// Pointer to one member of a tracked value: the split slot when one
    /// exists, a fresh `memberptr` otherwise.
    #[allow(clippy::too_many_arguments)]
    fn final_memberptr(
        &mut self,
        module: &mut Module,
        func_index: usize,
        block: BlockId,
        before: InstrId,
        base: &Ref,
        parent_ty: Type,
        index: usize,
    ) -> Ref {
        if let Some(value) = base.value {
            let member = self.values[value].members.get(index).copied();
            if let Some(member) = member
                && let Some(split) = self.values[member].split_alloca
            {
                return Ref {
                    ptr: split,
                    value: Some(member),
                };
            }
        }

        let func = &mut module.functions[func_index];
        let ptr = func.next_virtual_reg();
        func.block_mut(block).instrs.insert_before(
            before,
            Instruction::with_dest(
                Opcode::Memberptr,
                ptr,
                vec![
                    Operand::Type(parent_ty),
                    Operand::from_register(base.ptr, crate::ssa::ADDR),
                    Operand::from_int_immediate(index as i128, crate::ssa::I32),
                ],
            ),
        );

        let member = base
            .value
            .and_then(|value| self.values[value].members.get(index).copied());
        if let Some(member) = member {
            self.ptr_defs.insert(ptr, member);
        }

        Ref { ptr, value: member }
    }

    /// Rewrites memberptrs into split values to use the split slots and
    /// deletes them.
    fn apply_splits(&mut self, module: &mut Module, func_index: usize) {
        let func = &mut module.functions[func_index];

        for block_id in func.blocks.ids().collect::<Vec<_>>() {
            for instr_id in func.block(block_id).instrs.ids().collect::<Vec<_>>() {
                let instr = func.block(block_id).instrs.get(instr_id);
                if instr.opcode != Opcode::Memberptr {
                    continue;
                }
                let Some(dest) = instr.dest else {
                    continue;
                };
                let Some(&value) = self.ptr_defs.get(&dest) else {
                    continue;
                };

                let parent = self.values[value].parent.expect("member without parent");
                if !self.values[parent].splittable {
                    continue;
                }

                if let Some(split) = self.values[value].split_alloca {
                    replace_in_func(func, dest, &Operand::from_register(split, crate::ssa::ADDR));
                }

                func.block_mut(block_id).instrs.remove(instr_id);
            }
        }
    }
}

struct Ref {
    ptr: VirtualRegister,
    value: Option<usize>,
}

fn is_aggregate(ty: Type) -> bool {
    ty.is_struct() && ty.len == 1
}

fn is_splitting_possible(module: &Module, ty: Type) -> bool {
    let Some(struct_id) = ty.struct_id() else {
        return false;
    };
    if ty.len != 1 {
        return false;
    }

    for member in &module.structure(struct_id).members {
        if member.ty.len != 1 {
            return false;
        }
        if is_aggregate(member.ty) && !is_splitting_possible(module, member.ty) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        SroaPass::new().run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn splits_two_field_struct() {
        let out = run(
            "struct @Pair {\n\
                 i32 first;\n\
                 i32 second;\n\
             }\n\
             func @f() -> i32 {\n\
             entry:\n\
                 %0 = alloca @Pair\n\
                 %1 = memberptr @Pair, addr %0, i32 0\n\
                 store i32 1, addr %1\n\
                 %2 = memberptr @Pair, addr %0, i32 1\n\
                 store i32 2, addr %2\n\
                 %3 = load i32, addr %1\n\
                 %4 = load i32, addr %2\n\
                 %5 = add i32 %3, i32 %4\n\
                 ret i32 %5\n\
             }\n",
        );

        // The aggregate alloca is gone; two scalar slots remain and the
        // loads and stores go straight at them.
        assert!(!out.contains("alloca @Pair"), "{}", out);
        assert_eq!(out.matches("alloca i32").count(), 2);
        assert!(!out.contains("memberptr"));
    }

    #[test]
    fn escaping_aggregate_is_untouched() {
        let out = run(
            "struct @Pair {\n\
                 i32 first;\n\
                 i32 second;\n\
             }\n\
             decl @observe(addr) -> void\n\
             func @f() -> void {\n\
             entry:\n\
                 %0 = alloca @Pair\n\
                 call void @observe, addr %0\n\
                 ret\n\
             }\n",
        );
        assert!(out.contains("alloca @Pair"));
    }

    #[test]
    fn copies_expand_into_member_moves() {
        let out = run(
            "struct @Pair {\n\
                 i32 first;\n\
                 i32 second;\n\
             }\n\
             func @f() -> void {\n\
             entry:\n\
                 %0 = alloca @Pair\n\
                 %1 = alloca @Pair\n\
                 copy addr %0, addr %1, @Pair\n\
                 ret\n\
             }\n",
        );

        assert!(!out.contains("copy"), "{}", out);
        assert_eq!(out.matches("alloca i32").count(), 4);
        assert_eq!(out.matches("load i32").count(), 2);
        assert_eq!(out.matches("store i32").count(), 2);
    }
}
