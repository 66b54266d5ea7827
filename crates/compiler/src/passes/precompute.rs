//! Constant folding.
//!
//! Runs both as a standalone pipeline pass and as a cleanup subroutine
//! inside control-flow optimization, inlining, peephole and
//! stack-to-register promotion. Folds integer and floating-point
//! arithmetic, comparisons in `select` and `cjmp` (rewriting the branch to
//! an unconditional jump), immediate extensions and truncations,
//! integer-to-float conversions and `sqrt` of a constant.

use crate::ssa::{
    Comparison, Function, Instruction, Module, Opcode, Operand,
};
use crate::target::Target;

use super::{replace_in_func, Pass};

pub struct PrecomputePass;

impl Pass for PrecomputePass {
    fn name(&self) -> &'static str {
        "precomputing"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            precompute_function(func);
        }
    }
}

/// Folds until nothing changes; replacing one instruction's result can make
/// another foldable.
pub fn precompute_function(func: &mut Function) {
    loop {
        let mut changed = false;

        for block_id in func.blocks.ids().collect::<Vec<_>>() {
            for instr_id in func.blocks.get(block_id).instrs.ids().collect::<Vec<_>>() {
                let instr = func.blocks.get(block_id).instrs.get(instr_id);

                if matches!(instr.opcode, Opcode::Cjmp | Opcode::Fcjmp) {
                    let lhs = &instr.operands[0];
                    let rhs = &instr.operands[2];

                    if lhs.is_immediate() && rhs.is_immediate() {
                        let comparison = instr.operands[1]
                            .comparison()
                            .expect("branch without a comparison");
                        let taken = precompute_cmp(lhs, rhs, comparison);
                        let target = instr.operands[if taken { 3 } else { 4 }].clone();

                        let block = func.blocks.get_mut(block_id);
                        block
                            .instrs
                            .replace(instr_id, Instruction::new(Opcode::Jmp, vec![target]));
                        changed = true;
                    }
                    continue;
                }

                if let Some(result) = precompute_result(instr) {
                    let dest = instr.dest.expect("foldable instruction without dest");
                    func.blocks.get_mut(block_id).instrs.remove(instr_id);
                    replace_in_func(func, dest, &result);
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }
}

/// The folded result of a single instruction, if all inputs are immediate.
pub fn precompute_result(instr: &Instruction) -> Option<Operand> {
    match instr.opcode {
        Opcode::Add => int_binary(instr, |a, b| a.wrapping_add(b)),
        Opcode::Sub => int_binary(instr, |a, b| a.wrapping_sub(b)),
        Opcode::Mul => int_binary(instr, |a, b| a.wrapping_mul(b)),
        Opcode::Sdiv | Opcode::Udiv => checked_int_binary(instr, i128::checked_div),
        Opcode::Srem | Opcode::Urem => checked_int_binary(instr, i128::checked_rem),
        Opcode::And => int_binary(instr, |a, b| a & b),
        Opcode::Or => int_binary(instr, |a, b| a | b),
        Opcode::Xor => int_binary(instr, |a, b| a ^ b),
        Opcode::Shl => int_binary(instr, |a, b| a.wrapping_shl(b as u32)),
        Opcode::Shr => int_binary(instr, |a, b| a.wrapping_shr(b as u32)),
        Opcode::Fadd => fp_binary(instr, |a, b| a + b),
        Opcode::Fsub => fp_binary(instr, |a, b| a - b),
        Opcode::Fmul => fp_binary(instr, |a, b| a * b),
        Opcode::Fdiv => fp_binary(instr, |a, b| a / b),
        Opcode::Select => precompute_select(instr),
        Opcode::Sextend | Opcode::Uextend => precompute_extend(instr),
        Opcode::Truncate => precompute_extend(instr),
        Opcode::Stof | Opcode::Utof => precompute_itof(instr),
        Opcode::Sqrt => precompute_sqrt(instr),
        _ => None,
    }
}

fn int_binary(instr: &Instruction, f: impl Fn(i128, i128) -> i128) -> Option<Operand> {
    let lhs = instr.operands[0].int_immediate()?;
    let rhs = instr.operands[1].int_immediate()?;
    Some(Operand::from_int_immediate(
        f(lhs, rhs),
        instr.operands[0].ty(),
    ))
}

fn checked_int_binary(
    instr: &Instruction,
    f: impl Fn(i128, i128) -> Option<i128>,
) -> Option<Operand> {
    let lhs = instr.operands[0].int_immediate()?;
    let rhs = instr.operands[1].int_immediate()?;
    Some(Operand::from_int_immediate(
        f(lhs, rhs)?,
        instr.operands[0].ty(),
    ))
}

fn fp_binary(instr: &Instruction, f: impl Fn(f64, f64) -> f64) -> Option<Operand> {
    let lhs = instr.operands[0].fp_immediate()?;
    let rhs = instr.operands[1].fp_immediate()?;
    Some(Operand::from_fp_immediate(
        f(lhs, rhs),
        instr.operands[0].ty(),
    ))
}

fn precompute_select(instr: &Instruction) -> Option<Operand> {
    let lhs = &instr.operands[0];
    let comparison = instr.operands[1].comparison()?;
    let rhs = &instr.operands[2];

    if !lhs.is_immediate() || !rhs.is_immediate() {
        return None;
    }

    let taken = precompute_cmp(lhs, rhs, comparison);
    Some(instr.operands[if taken { 3 } else { 4 }].clone())
}

fn precompute_extend(instr: &Instruction) -> Option<Operand> {
    let value = instr.operands[0].int_immediate()?;
    let ty = match &instr.operands[1] {
        Operand::Type(ty) => *ty,
        _ => return None,
    };
    Some(Operand::from_int_immediate(value, ty))
}

fn precompute_itof(instr: &Instruction) -> Option<Operand> {
    let value = instr.operands[0].int_immediate()?;
    let ty = match &instr.operands[1] {
        Operand::Type(ty) => *ty,
        _ => return None,
    };
    Some(Operand::from_fp_immediate(value as f64, ty))
}

fn precompute_sqrt(instr: &Instruction) -> Option<Operand> {
    let value = instr.operands[0].fp_immediate()?;
    Some(Operand::from_fp_immediate(
        value.sqrt(),
        instr.operands[0].ty(),
    ))
}

pub fn precompute_cmp(lhs: &Operand, rhs: &Operand, comparison: Comparison) -> bool {
    use Comparison::*;

    match comparison {
        Feq | Fne | Fgt | Fge | Flt | Fle => {
            let a = lhs.fp_immediate().unwrap_or(0.0);
            let b = rhs.fp_immediate().unwrap_or(0.0);
            match comparison {
                Feq => a == b,
                Fne => a != b,
                Fgt => a > b,
                Fge => a >= b,
                Flt => a < b,
                Fle => a <= b,
                _ => unreachable!(),
            }
        }
        _ => {
            let a = lhs.int_immediate().unwrap_or(0);
            let b = rhs.int_immediate().unwrap_or(0);
            match comparison {
                Eq => a == b,
                Ne => a != b,
                Ugt | Sgt => a > b,
                Uge | Sge => a >= b,
                Ult | Slt => a < b,
                Ule | Sle => a <= b,
                _ => unreachable!(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;
    use crate::target::Target;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        PrecomputePass.run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn folds_arithmetic_chains() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 %0 = add i32 2, i32 3\n\
                 %1 = mul i32 %0, i32 4\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("ret i32 20"));
        assert!(!out.contains("add"));
        assert!(!out.contains("mul"));
    }

    #[test]
    fn folds_constant_branch_to_jmp() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 cjmp i32 1, slt, i32 2, yes, no\n\
             yes:\n\
                 ret i32 1\n\
             no:\n\
                 ret i32 0\n\
             }\n",
        );
        assert!(out.contains("jmp yes"));
        assert!(!out.contains("cjmp"));
    }

    #[test]
    fn folds_select_and_sqrt() {
        let out = run(
            "func @f() -> f64 {\n\
             entry:\n\
                 %0 = select i32 5, sgt, i32 3, f64 4.0, f64 9.0\n\
                 %1 = sqrt f64 %0\n\
                 ret f64 %1\n\
             }\n",
        );
        assert!(out.contains("ret f64 2.0"));
    }

    #[test]
    fn folds_extend_of_immediate() {
        let out = run(
            "func @f() -> i64 {\n\
             entry:\n\
                 %0 = sextend i32 -7, i64\n\
                 ret i64 %0\n\
             }\n",
        );
        assert!(out.contains("ret i64 -7"));
    }

    #[test]
    fn division_by_zero_is_left_alone() {
        let out = run(
            "func @f() -> i32 {\n\
             entry:\n\
                 %0 = sdiv i32 5, i32 0\n\
                 ret i32 %0\n\
             }\n",
        );
        assert!(out.contains("sdiv"));
    }
}
