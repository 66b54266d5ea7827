//! Numeric conversion selection.
//!
//! Given source and destination language types, pick the conversion opcode
//! from the sizes and signedness involved. Same-size conversions within one
//! domain are free: the operand just changes its IR type.

use crate::ssa::{Instruction, Opcode, Operand};
use crate::types::Type;

use super::LowerCtx;

pub fn build(ctx: &mut LowerCtx, value: Operand, from: &Type, to: &Type) -> Operand {
    let ir_from = ctx.build_type(from);
    let ir_to = ctx.build_type(to);

    let size_from = ctx.size_of(ir_from);
    let size_to = ctx.size_of(ir_to);
    let promotion = size_to > size_from;

    if size_from == size_to && from.is_floating_point() == to.is_floating_point() {
        return value.with_type(ir_to);
    }

    // Integer immediates convert to floating point at compile time.
    if to.is_floating_point()
        && let Some(int_value) = value.int_immediate()
    {
        return Operand::from_fp_immediate(int_value as f64, ir_to);
    }

    let opcode = if from.is_floating_point() {
        if to.is_floating_point() {
            if promotion { Opcode::Fpromote } else { Opcode::Fdemote }
        } else if to.is_signed_int() {
            Opcode::Ftos
        } else {
            Opcode::Ftou
        }
    } else if to.is_floating_point() {
        if from.is_signed_int() { Opcode::Stof } else { Opcode::Utof }
    } else if promotion {
        if from.is_signed_int() { Opcode::Sextend } else { Opcode::Uextend }
    } else {
        Opcode::Truncate
    };

    let reg = ctx.next_reg();
    ctx.emit(Instruction::with_dest(
        opcode,
        reg,
        vec![value, Operand::Type(ir_to)],
    ));
    Operand::from_register(reg, ir_to)
}
