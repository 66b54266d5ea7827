//! Peephole optimizations.
//!
//! Algebraic identities (`x+0`, `x-0`, `x*1`, power-of-two multiplies and
//! divides into shifts), canonicalization of immediates onto the right-hand
//! side of commutative operators, and strength reduction of `sqrtf` calls
//! into the `sqrt` opcode. Folded instructions go through the shared
//! constant folder first.

use crate::ssa::{Function, Instruction, Module, Opcode, Operand};
use crate::target::Target;

use super::{precompute, replace_in_func, Pass};

pub struct PeepholePass;

impl Pass for PeepholePass {
    fn name(&self) -> &'static str {
        "peephole-opt"
    }

    fn run(&mut self, module: &mut Module, _target: &Target) {
        for func in &mut module.functions {
            run_function(func);
        }
    }
}

fn run_function(func: &mut Function) {
    for block_id in func.blocks.ids().collect::<Vec<_>>() {
        for instr_id in func.blocks.get(block_id).instrs.ids().collect::<Vec<_>>() {
            let instr = func.blocks.get(block_id).instrs.get(instr_id);

            if let Some(value) = precompute::precompute_result(instr) {
                let dest = instr.dest.expect("foldable instruction without dest");
                func.blocks.get_mut(block_id).instrs.remove(instr_id);
                replace_in_func(func, dest, &value);
                continue;
            }

            match instr.opcode {
                Opcode::Add | Opcode::Fadd => optimize_add(func, block_id, instr_id),
                Opcode::Sub | Opcode::Fsub => optimize_sub(func, block_id, instr_id),
                Opcode::Mul => optimize_mul(func, block_id, instr_id),
                Opcode::Udiv => optimize_udiv(func, block_id, instr_id),
                Opcode::Fmul => optimize_fmul(func, block_id, instr_id),
                Opcode::Call => optimize_sqrt_call(func, block_id, instr_id),
                _ => {}
            }
        }
    }
}

fn optimize_add(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    let i = func.blocks.get(block).instrs.get(instr);
    if is_zero(&i.operands[0]) {
        let replacement = i.operands[1].clone();
        eliminate(func, block, instr, replacement);
    } else if is_zero(&i.operands[1]) {
        let replacement = i.operands[0].clone();
        eliminate(func, block, instr, replacement);
    }
}

fn optimize_sub(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    let i = func.blocks.get(block).instrs.get(instr);
    if is_zero(&i.operands[1]) {
        let replacement = i.operands[0].clone();
        eliminate(func, block, instr, replacement);
    }
}

fn optimize_mul(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    canonicalize_commutative(func, block, instr);

    let i = func.blocks.get(block).instrs.get(instr);
    if is_int_one(&i.operands[1]) {
        let replacement = i.operands[0].clone();
        eliminate(func, block, instr, replacement);
        return;
    }

    if let Some(value) = i.operands[1].int_immediate()
        && let Some(shift) = power_of_two(value)
    {
        let lhs = i.operands[0].clone();
        let dest = i.dest.expect("mul without dest");
        func.blocks.get_mut(block).instrs.replace(
            instr,
            Instruction::with_dest(
                Opcode::Shl,
                dest,
                vec![lhs, Operand::from_int_immediate(shift, crate::ssa::I8)],
            ),
        );
    }
}

fn optimize_udiv(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    let i = func.blocks.get(block).instrs.get(instr);
    if is_int_one(&i.operands[1]) {
        let replacement = i.operands[0].clone();
        eliminate(func, block, instr, replacement);
        return;
    }

    if let Some(value) = i.operands[1].int_immediate()
        && let Some(shift) = power_of_two(value)
    {
        let lhs = i.operands[0].clone();
        let dest = i.dest.expect("udiv without dest");
        func.blocks.get_mut(block).instrs.replace(
            instr,
            Instruction::with_dest(
                Opcode::Shr,
                dest,
                vec![lhs, Operand::from_int_immediate(shift, crate::ssa::I8)],
            ),
        );
    }
}

fn optimize_fmul(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    canonicalize_commutative(func, block, instr);

    let i = func.blocks.get(block).instrs.get(instr);
    if is_fp_one(&i.operands[1]) {
        let replacement = i.operands[0].clone();
        eliminate(func, block, instr, replacement);
    }
}

/// `call @sqrtf, x` becomes the dedicated opcode.
fn optimize_sqrt_call(func: &mut Function, block: crate::ssa::BlockId, instr: crate::ssa::InstrId) {
    let i = func.blocks.get(block).instrs.get(instr);

    let is_sqrtf = matches!(&i.operands[0], Operand::ExternFunc(name, _) if name == "sqrtf");
    if !is_sqrtf || i.dest.is_none() || i.operands.len() != 2 {
        return;
    }

    let dest = i.dest.expect("checked above");
    let arg = i.operands[1].clone();
    func.blocks
        .get_mut(block)
        .instrs
        .replace(instr, Instruction::with_dest(Opcode::Sqrt, dest, vec![arg]));
}

fn canonicalize_commutative(
    func: &mut Function,
    block: crate::ssa::BlockId,
    instr: crate::ssa::InstrId,
) {
    let i = func.blocks.get_mut(block).instrs.get_mut(instr);
    if i.operands[0].is_immediate() && !i.operands[1].is_immediate() {
        i.operands.swap(0, 1);
    }
}

fn eliminate(
    func: &mut Function,
    block: crate::ssa::BlockId,
    instr: crate::ssa::InstrId,
    value: Operand,
) {
    let dest = func
        .blocks
        .get(block)
        .instrs
        .get(instr)
        .dest
        .expect("eliminating an instruction without dest");

    func.blocks.get_mut(block).instrs.remove(instr);
    replace_in_func(func, dest, &value);
}

fn is_zero(operand: &Operand) -> bool {
    operand.int_immediate() == Some(0) || operand.fp_immediate() == Some(0.0)
}

fn is_int_one(operand: &Operand) -> bool {
    operand.int_immediate() == Some(1)
}

fn is_fp_one(operand: &Operand) -> bool {
    operand.fp_immediate() == Some(1.0)
}

fn power_of_two(value: i128) -> Option<i128> {
    if value > 0 && (value & (value - 1)) == 0 {
        Some(value.trailing_zeros() as i128)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::parser::parse_module;
    use crate::ssa::writer::write_module;

    fn run(source: &str) -> String {
        let mut module = parse_module(source).unwrap();
        PeepholePass.run(&mut module, &Target::host_default());
        write_module(&module)
    }

    #[test]
    fn add_zero_is_identity() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = add i32 %0, i32 0\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("ret i32 %0"));
        assert!(!out.contains("add"));
    }

    #[test]
    fn multiply_by_power_of_two_becomes_shift() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = mul i32 %0, i32 8\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("%1 = shl i32 %0, i8 3"));
    }

    #[test]
    fn immediates_move_to_the_right() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = mul i32 3, i32 %0\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("mul i32 %0, i32 3"));
    }

    #[test]
    fn udiv_by_power_of_two_becomes_shift() {
        let out = run(
            "func @f(i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = udiv i32 %0, i32 4\n\
                 ret i32 %1\n\
             }\n",
        );
        assert!(out.contains("%1 = shr i32 %0, i8 2"));
    }

    #[test]
    fn sqrtf_call_becomes_sqrt_opcode() {
        let out = run(
            "decl @sqrtf(f32) -> f32\n\
             func @f(f32) -> f32 {\n\
             entry:\n\
                 %0 = loadarg f32, i32 0\n\
                 %1 = call f32 @sqrtf, f32 %0\n\
                 ret f32 %1\n\
             }\n",
        );
        assert!(out.contains("%1 = sqrt f32 %0"));
        assert!(!out.contains("call"));
    }
}
