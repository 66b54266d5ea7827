//! Deterministic textual form of an SSA module.
//!
//! Structure definitions come first, then external declarations, globals and
//! function definitions, all in module order. The output is parsed back by
//! [`super::parser`], which the test fixtures and the `opalc` CLI rely on.
//!
//! ```text
//! struct @Vec2 {
//!     f32 x;
//!     f32 y;
//! }
//!
//! func @length(addr) -> f32 {
//! entry:
//!     %1 = memberptr @Vec2, addr %0, 0
//!     ...
//! }
//! ```

use std::fmt::Write as _;

use super::{BasicBlock, Function, Instruction, Module, Operand, Type, TypeBase};

pub fn write_module(module: &Module) -> String {
    let mut out = String::new();

    for structure in &module.structs {
        let _ = writeln!(out, "struct @{} {{", structure.name);
        for member in &structure.members {
            let _ = writeln!(out, "    {} {};", type_to_string(module, member.ty), member.name);
        }
        let _ = writeln!(out, "}}");
        out.push('\n');
    }

    for decl in &module.extern_functions {
        let params: Vec<String> = decl.params.iter().map(|ty| type_to_string(module, *ty)).collect();
        let _ = writeln!(
            out,
            "decl @{}({}) -> {}",
            decl.name,
            params.join(", "),
            type_to_string(module, decl.return_type)
        );
    }
    if !module.extern_functions.is_empty() {
        out.push('\n');
    }

    for decl in &module.extern_globals {
        let _ = writeln!(out, "extern global @{} {}", decl.name, type_to_string(module, decl.ty));
    }

    for global in &module.globals {
        let _ = writeln!(
            out,
            "global @{} {} = {}",
            global.name,
            type_to_string(module, global.ty),
            operand_to_string(module, None, &global.initial)
        );
    }
    if !module.globals.is_empty() || !module.extern_globals.is_empty() {
        out.push('\n');
    }

    for name in &module.dll_exports {
        let _ = writeln!(out, "dllexport @{}", name);
    }

    for func in &module.functions {
        write_function(module, func, &mut out);
        out.push('\n');
    }

    out
}

fn write_function(module: &Module, func: &Function, out: &mut String) {
    let params: Vec<String> = func.params.iter().map(|ty| type_to_string(module, *ty)).collect();
    let _ = writeln!(
        out,
        "func @{}({}) -> {} {{",
        func.name,
        params.join(", "),
        type_to_string(module, func.return_type)
    );

    for block_id in func.blocks.ids() {
        write_block(module, func, func.block(block_id), out);
    }

    let _ = writeln!(out, "}}");
}

fn write_block(module: &Module, func: &Function, block: &BasicBlock, out: &mut String) {
    if block.params.is_empty() {
        let _ = writeln!(out, "{}:", block.label);
    } else {
        let params: Vec<String> = block
            .params
            .iter()
            .map(|param| format!("%{}: {}", param.reg, type_to_string(module, param.ty)))
            .collect();
        let _ = writeln!(out, "{}({}):", block.label, params.join(", "));
    }

    for instr in block.instrs.iter() {
        write_instr(module, func, instr, out);
    }
}

fn write_instr(module: &Module, func: &Function, instr: &Instruction, out: &mut String) {
    out.push_str("    ");

    if let Some(dest) = instr.dest {
        let _ = write!(out, "%{} = ", dest);
    }

    let _ = write!(out, "{}", instr.opcode);

    for (index, operand) in instr.operands.iter().enumerate() {
        if index == 0 {
            out.push(' ');
        } else {
            out.push_str(", ");
        }
        out.push_str(&operand_to_string(module, Some(func), operand));
    }

    out.push('\n');
}

pub fn type_to_string(module: &Module, ty: Type) -> String {
    let base = match ty.base {
        TypeBase::Primitive(primitive) => primitive.to_string(),
        TypeBase::Struct(id) => format!("@{}", module.structure(id).name),
    };

    if ty.len == 1 {
        base
    } else {
        format!("{}[{}]", base, ty.len)
    }
}

pub fn operand_to_string(module: &Module, func: Option<&Function>, operand: &Operand) -> String {
    match operand {
        Operand::Register(reg, ty) => format!("{} %{}", type_to_string(module, *ty), reg),
        Operand::IntImmediate(value, ty) => format!("{} {}", type_to_string(module, *ty), value),
        Operand::FpImmediate(value, ty) => {
            format!("{} {}", type_to_string(module, *ty), fp_to_string(*value))
        }
        Operand::Type(ty) => type_to_string(module, *ty),
        Operand::Global(name, ty)
        | Operand::Func(name, ty)
        | Operand::ExternFunc(name, ty)
        | Operand::ExternGlobal(name, ty) => format!("{} @{}", type_to_string(module, *ty), name),
        Operand::Comparison(comparison) => comparison.to_string(),
        Operand::BranchTarget(target) => {
            let func = func.expect("branch target outside a function");
            let label = &func.block(target.block).label;

            if target.args.is_empty() {
                label.clone()
            } else {
                let args: Vec<String> = target
                    .args
                    .iter()
                    .map(|arg| operand_to_string(module, Some(func), arg))
                    .collect();
                format!("{}({})", label, args.join(", "))
            }
        }
        Operand::Bytes(bytes) => bytes_to_string(bytes),
    }
}

/// Floating-point immediates always carry a decimal point so the parser can
/// tell them apart from integers.
fn fp_to_string(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() {
        format!("{:.1}", value)
    } else {
        format!("{}", value)
    }
}

fn bytes_to_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');

    for &byte in bytes {
        match byte {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                let _ = write!(out, "\\{:02x}", byte);
            }
        }
    }

    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::{CallingConv, Instruction, Opcode, I32, VOID};

    #[test]
    fn writes_simple_function() {
        let mut module = Module::new();
        let mut func = Function::new("id", vec![I32], I32, CallingConv::SysV);
        let entry = func.entry();
        let reg = func.next_virtual_reg();
        func.block_mut(entry).append(Instruction::with_dest(
            Opcode::Loadarg,
            reg,
            vec![Operand::Type(I32), Operand::from_int_immediate(0, I32)],
        ));
        func.block_mut(entry)
            .append(Instruction::new(Opcode::Ret, vec![Operand::from_register(reg, I32)]));
        module.functions.push(func);

        let text = write_module(&module);
        assert_eq!(
            text,
            "func @id(i32) -> i32 {\n\
             entry:\n\
             \x20   %0 = loadarg i32, i32 0\n\
             \x20   ret i32 %0\n\
             }\n\n"
        );
    }

    #[test]
    fn fp_immediates_keep_a_decimal_point() {
        assert_eq!(fp_to_string(2.0), "2.0");
        assert_eq!(fp_to_string(2.5), "2.5");
        assert_eq!(fp_to_string(-1.0), "-1.0");
    }

    #[test]
    fn bytes_are_escaped() {
        assert_eq!(bytes_to_string(b"hi\0"), "\"hi\\00\"");
        assert_eq!(bytes_to_string(b"a\"b\\"), "\"a\\\"b\\\\\"");
    }

    #[test]
    fn void_function_writes_bare_ret() {
        let mut module = Module::new();
        let mut func = Function::new("nop", vec![], VOID, CallingConv::SysV);
        let entry = func.entry();
        func.block_mut(entry).append(Instruction::new(Opcode::Ret, vec![]));
        module.functions.push(func);

        let text = write_module(&module);
        assert!(text.contains("func @nop() -> void {\n"));
        assert!(text.contains("    ret\n"));
    }
}
