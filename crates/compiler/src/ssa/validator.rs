//! Structural well-formedness checks over an SSA module.
//!
//! Non-modifying; reports problems as text and returns a module-level
//! verdict. The pass runner calls this after every pass in debug mode and
//! aborts compilation on the first failure.

use std::collections::HashSet;
use std::fmt::Write as _;

use super::{Function, Module, Opcode, Operand, VirtualRegister};

pub struct Validator {
    report: String,
}

impl Validator {
    pub fn new() -> Validator {
        Validator {
            report: String::new(),
        }
    }

    pub fn validate(&mut self, module: &Module) -> bool {
        let mut valid = true;

        for func in &module.functions {
            valid &= self.validate_function(module, func);
        }

        valid
    }

    pub fn report(&self) -> &str {
        &self.report
    }

    fn validate_function(&mut self, module: &Module, func: &Function) -> bool {
        let mut valid = true;

        let mut defs: HashSet<VirtualRegister> = HashSet::new();
        for block in func.blocks.iter() {
            for param in &block.params {
                defs.insert(param.reg);
            }
            for instr in block.instrs.iter() {
                if let Some(dest) = instr.dest {
                    defs.insert(dest);
                }
            }
        }

        for block_id in func.blocks.ids() {
            let block = func.block(block_id);
            let mut terminators = 0;

            for instr_id in block.instrs.ids() {
                let instr = block.instrs.get(instr_id);

                for_each_register(&instr.operands, &mut |reg| {
                    if !defs.contains(&reg) {
                        let _ = writeln!(
                            self.report,
                            "error in `{}`: %{} is not defined",
                            func.name, reg
                        );
                        valid = false;
                    }
                });

                if instr.is_terminator() {
                    terminators += 1;

                    if block.instrs.next(instr_id).is_some() {
                        let _ = writeln!(
                            self.report,
                            "error in `{}`: terminator before end of `{}`",
                            func.name, block.label
                        );
                        valid = false;
                    }
                }

                match instr.opcode {
                    Opcode::Memberptr => valid &= self.validate_memberptr(module, func, instr),
                    Opcode::Cjmp | Opcode::Fcjmp | Opcode::Jmp => {
                        valid &= self.validate_branch_arity(func, instr);
                    }
                    _ => {}
                }
            }

            if terminators != 1 {
                let _ = writeln!(
                    self.report,
                    "error in `{}`: block `{}` has {} terminators",
                    func.name, block.label, terminators
                );
                valid = false;
            }
        }

        valid
    }

    fn validate_memberptr(
        &mut self,
        module: &Module,
        func: &Function,
        instr: &super::Instruction,
    ) -> bool {
        let Some(Operand::Type(ty)) = instr.operands.first() else {
            return true;
        };
        let Some(index) = instr.operands.get(2).and_then(Operand::int_immediate) else {
            return true;
        };

        if let Some(struct_id) = ty.struct_id() {
            let structure = module.structure(struct_id);
            if index as usize >= structure.members.len() {
                let _ = writeln!(
                    self.report,
                    "error in `{}`: memberptr index {} out of bounds for @{}",
                    func.name, index, structure.name
                );
                return false;
            }
        }

        true
    }

    fn validate_branch_arity(&mut self, func: &Function, instr: &super::Instruction) -> bool {
        let mut valid = true;

        for operand in &instr.operands {
            let Some(target) = operand.branch_target() else {
                continue;
            };

            let params = &func.block(target.block).params;
            if params.len() != target.args.len() {
                let _ = writeln!(
                    self.report,
                    "error in `{}`: branch to `{}` passes {} args for {} params",
                    func.name,
                    func.block(target.block).label,
                    target.args.len(),
                    params.len()
                );
                valid = false;
            }
        }

        valid
    }

}

fn for_each_register(operands: &[Operand], callback: &mut impl FnMut(VirtualRegister)) {
    for operand in operands {
        match operand {
            Operand::Register(reg, _) => callback(*reg),
            Operand::BranchTarget(target) => {
                for arg in &target.args {
                    if let Operand::Register(reg, _) = arg {
                        callback(*reg);
                    }
                }
            }
            _ => {}
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;

    fn check(source: &str) -> (bool, String) {
        let module = parse_module(source).unwrap();
        let mut validator = Validator::new();
        let valid = validator.validate(&module);
        (valid, validator.report().to_string())
    }

    #[test]
    fn accepts_well_formed_module() {
        let (valid, report) = check(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = add i32 %0, i32 1\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(valid, "{}", report);
    }

    #[test]
    fn rejects_undefined_register() {
        let (valid, report) = check(
            "func @f() -> i32 {\n\
             entry:\n\
                 %0 = add i32 %9, i32 1\n\
                 ret i32 %0\n\
             }\n",
        );
        assert!(!valid);
        assert!(report.contains("%9 is not defined"));
        assert!(report.contains("`f`"));
    }

    #[test]
    fn block_params_count_as_definitions() {
        let (valid, report) = check(
            "func @f() -> i32 {\n\
             entry:\n\
                 jmp next(i32 1)\n\
             next(%0: i32):\n\
                 ret i32 %0\n\
             }\n",
        );
        assert!(valid, "{}", report);
    }

    #[test]
    fn rejects_out_of_bounds_memberptr() {
        let (valid, report) = check(
            "struct @Pair {\n\
                 i32 first;\n\
                 i32 second;\n\
             }\n\
             func @f(addr) -> void {\n\
             entry:\n\
                 %0 = loadarg addr, i32 0\n\
                 %1 = memberptr @Pair, addr %0, i32 2\n\
                 ret\n\
             }\n",
        );
        assert!(!valid);
        assert!(report.contains("out of bounds"));
    }

    #[test]
    fn rejects_missing_terminator() {
        let (valid, report) = check(
            "func @f() -> void {\n\
             entry:\n\
                 %0 = add i32 1, i32 2\n\
             }\n",
        );
        assert!(!valid);
        assert!(report.contains("0 terminators"));
    }

    #[test]
    fn rejects_branch_arity_mismatch() {
        let (valid, report) = check(
            "func @f() -> i32 {\n\
             entry:\n\
                 jmp next\n\
             next(%0: i32):\n\
                 ret i32 %0\n\
             }\n",
        );
        assert!(!valid);
        assert!(report.contains("passes 0 args for 1 params"));
    }
}
