//! Parser for the textual IR form, the inverse of [`super::writer`].
//!
//! Used by the test fixtures (pass tests are written as IR-in, IR-out pairs)
//! and by the `opalc` CLI to load modules from disk. The grammar is
//! line-oriented: one declaration, label or instruction per line.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use super::{
    BasicBlock, BlockId, BlockParam, CallingConv, Comparison, Function, FunctionDecl, Global,
    GlobalDecl, Instruction, Module, Opcode, Operand, Primitive, StructId, Structure,
    StructureMember, Type,
};

#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

impl Error for ParseError {}

pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    Parser::new(source).parse()
}

struct Parser<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
    module: Module,
    struct_ids: HashMap<String, StructId>,
}

/// Cursor over a single line.
struct Line<'a> {
    number: usize,
    text: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Parser<'a> {
        let lines = source
            .lines()
            .enumerate()
            .map(|(number, line)| (number + 1, line.trim()))
            .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
            .collect();

        Parser {
            lines,
            pos: 0,
            module: Module::new(),
            struct_ids: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<Module, ParseError> {
        while self.pos < self.lines.len() {
            let (number, text) = self.lines[self.pos];

            if text.starts_with("struct ") {
                self.parse_struct()?;
            } else if text.starts_with("decl ") {
                self.parse_extern_func()?;
            } else if text.starts_with("extern global ") {
                self.parse_extern_global()?;
            } else if text.starts_with("global ") {
                self.parse_global()?;
            } else if text.starts_with("dllexport ") {
                let name = text["dllexport ".len()..].trim();
                let name = name.strip_prefix('@').unwrap_or(name);
                self.module.dll_exports.push(name.to_string());
                self.pos += 1;
            } else if text.starts_with("func ") {
                self.parse_func()?;
            } else {
                return Err(ParseError {
                    line: number,
                    message: format!("unexpected top-level line: {}", text),
                });
            }
        }

        self.resolve_symbols();
        Ok(self.module)
    }

    /// Interns a structure by name, creating an empty placeholder for
    /// forward references.
    fn struct_id(&mut self, name: &str) -> StructId {
        if let Some(&id) = self.struct_ids.get(name) {
            return id;
        }

        let id = self.module.add_struct(Structure {
            name: name.to_string(),
            members: Vec::new(),
        });
        self.struct_ids.insert(name.to_string(), id);
        id
    }

    fn parse_struct(&mut self) -> Result<(), ParseError> {
        let (number, text) = self.lines[self.pos];
        let mut line = Line::new(number, text);

        line.expect_word("struct")?;
        let name = line.parse_symbol_name()?;
        line.expect_char('{')?;
        self.pos += 1;

        let id = self.struct_id(&name);
        let mut members = Vec::new();

        loop {
            if self.pos >= self.lines.len() {
                return Err(ParseError {
                    line: number,
                    message: "unterminated struct definition".to_string(),
                });
            }

            let (member_number, member_text) = self.lines[self.pos];
            self.pos += 1;

            if member_text == "}" {
                break;
            }

            let mut line = Line::new(member_number, member_text);
            let ty = self.parse_type(&mut line)?;
            line.skip_whitespace();
            let member_name = line.parse_ident()?;
            line.expect_char(';')?;

            members.push(StructureMember {
                name: member_name,
                ty,
            });
        }

        self.module.structure_mut(id).members = members;
        Ok(())
    }

    fn parse_extern_func(&mut self) -> Result<(), ParseError> {
        let (number, text) = self.lines[self.pos];
        let mut line = Line::new(number, text);
        self.pos += 1;

        line.expect_word("decl")?;
        let name = line.parse_symbol_name()?;
        line.expect_char('(')?;

        let mut params = Vec::new();
        line.skip_whitespace();
        if !line.peek_is(')') {
            loop {
                params.push(self.parse_type(&mut line)?);
                line.skip_whitespace();
                if !line.consume_if(',') {
                    break;
                }
            }
        }
        line.expect_char(')')?;
        line.expect_word("->")?;
        let return_type = self.parse_type(&mut line)?;

        self.module.extern_functions.push(FunctionDecl {
            name,
            params,
            return_type,
        });
        Ok(())
    }

    fn parse_extern_global(&mut self) -> Result<(), ParseError> {
        let (number, text) = self.lines[self.pos];
        let mut line = Line::new(number, text);
        self.pos += 1;

        line.expect_word("extern")?;
        line.expect_word("global")?;
        let name = line.parse_symbol_name()?;
        let ty = self.parse_type(&mut line)?;

        self.module.extern_globals.push(GlobalDecl { name, ty });
        Ok(())
    }

    fn parse_global(&mut self) -> Result<(), ParseError> {
        let (number, text) = self.lines[self.pos];
        let mut line = Line::new(number, text);
        self.pos += 1;

        line.expect_word("global")?;
        let name = line.parse_symbol_name()?;
        let ty = self.parse_type(&mut line)?;
        line.expect_char('=')?;
        let initial = self.parse_operand(&mut line, None, None)?;

        self.module.globals.push(Global {
            name,
            ty,
            initial,
            external: false,
        });
        Ok(())
    }

    fn parse_func(&mut self) -> Result<(), ParseError> {
        let (number, text) = self.lines[self.pos];
        let mut line = Line::new(number, text);
        self.pos += 1;

        line.expect_word("func")?;
        let name = line.parse_symbol_name()?;
        line.expect_char('(')?;

        let mut params = Vec::new();
        line.skip_whitespace();
        if !line.peek_is(')') {
            loop {
                params.push(self.parse_type(&mut line)?);
                line.skip_whitespace();
                if !line.consume_if(',') {
                    break;
                }
            }
        }
        line.expect_char(')')?;
        line.expect_word("->")?;
        let return_type = self.parse_type(&mut line)?;
        line.expect_char('{')?;

        let mut func = Function::new(name, params, return_type, CallingConv::SysV);

        // First sweep: find the body's extent and create all labeled blocks
        // so branch targets can refer to blocks defined later.
        let body_start = self.pos;
        let mut body_end = self.pos;
        while body_end < self.lines.len() && self.lines[body_end].1 != "}" {
            body_end += 1;
        }
        if body_end == self.lines.len() {
            return Err(ParseError {
                line: number,
                message: "unterminated function body".to_string(),
            });
        }

        let mut blocks: HashMap<String, BlockId> = HashMap::new();
        let mut first_label = true;
        for index in body_start..body_end {
            let (label_number, label_text) = self.lines[index];
            if !is_label_line(label_text) {
                continue;
            }

            let mut line = Line::new(label_number, label_text);
            let label = line.parse_ident()?;

            let block_id = if first_label {
                // The first label names the entry block created by
                // `Function::new`.
                first_label = false;
                let entry = func.entry();
                func.block_mut(entry).label = label.clone();
                entry
            } else {
                func.create_block(label.clone())
            };

            if line.consume_if('(') {
                loop {
                    line.skip_whitespace();
                    line.expect_char('%')?;
                    let reg = line.parse_number()? as u32;
                    line.expect_char(':')?;
                    let ty = self.parse_type(&mut line)?;
                    func.bump_reg_counter(reg);
                    func.block_mut(block_id).params.push(BlockParam { reg, ty });
                    line.skip_whitespace();
                    if !line.consume_if(',') {
                        break;
                    }
                }
                line.expect_char(')')?;
            }

            blocks.insert(label, block_id);
        }

        // Second sweep: instructions.
        let mut cur_block = func.entry();
        for index in body_start..body_end {
            let (instr_number, instr_text) = self.lines[index];

            if is_label_line(instr_text) {
                let mut line = Line::new(instr_number, instr_text);
                let label = line.parse_ident()?;
                cur_block = blocks[&label];
                continue;
            }

            let instr = self.parse_instr(instr_number, instr_text, &blocks, &mut func)?;
            func.block_mut(cur_block).append(instr);
        }

        self.pos = body_end + 1;
        self.module.functions.push(func);
        Ok(())
    }

    fn parse_instr(
        &mut self,
        number: usize,
        text: &str,
        blocks: &HashMap<String, BlockId>,
        func: &mut Function,
    ) -> Result<Instruction, ParseError> {
        let mut line = Line::new(number, text);
        line.skip_whitespace();

        let mut dest = None;
        if line.peek_is('%') {
            line.expect_char('%')?;
            let reg = line.parse_number()? as u32;
            func.bump_reg_counter(reg);
            dest = Some(reg);
            line.expect_char('=')?;
        }

        line.skip_whitespace();
        let opcode_name = line.parse_ident()?;
        let opcode = opcode_from_str(&opcode_name).ok_or_else(|| ParseError {
            line: number,
            message: format!("unknown opcode: {}", opcode_name),
        })?;

        let mut operands = Vec::new();
        line.skip_whitespace();
        if !line.at_end() {
            loop {
                operands.push(self.parse_operand(&mut line, Some(blocks), Some(&mut *func))?);
                line.skip_whitespace();
                if !line.consume_if(',') {
                    break;
                }
            }
        }

        Ok(Instruction {
            opcode,
            dest,
            operands,
            flags: 0,
        })
    }

    fn parse_operand(
        &mut self,
        line: &mut Line<'_>,
        blocks: Option<&HashMap<String, BlockId>>,
        func: Option<&mut Function>,
    ) -> Result<Operand, ParseError> {
        line.skip_whitespace();

        if line.peek_is('"') {
            return Ok(Operand::Bytes(line.parse_bytes()?));
        }

        if line.peek_is('@') || line.peek_is_primitive_type() {
            let ty = self.parse_type(line)?;
            line.skip_whitespace();

            if line.peek_is('%') {
                line.expect_char('%')?;
                let reg = line.parse_number()? as u32;
                if let Some(func) = func {
                    func.bump_reg_counter(reg);
                }
                return Ok(Operand::Register(reg, ty));
            }

            if line.peek_is('@') {
                let name = line.parse_symbol_name()?;
                // Classified properly in `resolve_symbols` once the whole
                // module is known.
                return Ok(Operand::ExternFunc(name, ty));
            }

            if line.peek_is('-') || line.peek_is_digit() {
                let text = line.parse_numeric_text()?;
                if text.contains('.') {
                    let value = text.parse::<f64>().map_err(|_| ParseError {
                        line: line.number,
                        message: format!("bad float immediate: {}", text),
                    })?;
                    return Ok(Operand::FpImmediate(value, ty));
                }
                let value = text.parse::<i128>().map_err(|_| ParseError {
                    line: line.number,
                    message: format!("bad integer immediate: {}", text),
                })?;
                return Ok(Operand::IntImmediate(value, ty));
            }

            return Ok(Operand::Type(ty));
        }

        let ident = line.parse_ident()?;

        if let Some(comparison) = comparison_from_str(&ident) {
            return Ok(Operand::Comparison(comparison));
        }

        // Anything else is a branch target.
        let blocks = blocks.ok_or_else(|| ParseError {
            line: line.number,
            message: format!("branch target `{}` outside a function body", ident),
        })?;
        let block = *blocks.get(&ident).ok_or_else(|| ParseError {
            line: line.number,
            message: format!("unknown block: {}", ident),
        })?;

        let mut args = Vec::new();
        if line.consume_if('(') {
            let mut func = func;
            loop {
                args.push(self.parse_operand(line, Some(blocks), func.as_deref_mut())?);
                line.skip_whitespace();
                if !line.consume_if(',') {
                    break;
                }
            }
            line.expect_char(')')?;
        }

        Ok(Operand::BranchTarget(super::BranchTarget { block, args }))
    }

    fn parse_type(&mut self, line: &mut Line<'_>) -> Result<Type, ParseError> {
        line.skip_whitespace();

        let base = if line.peek_is('@') {
            let name = line.parse_symbol_name()?;
            super::TypeBase::Struct(self.struct_id(&name))
        } else {
            let name = line.parse_ident()?;
            let primitive = primitive_from_str(&name).ok_or_else(|| ParseError {
                line: line.number,
                message: format!("unknown type: {}", name),
            })?;
            super::TypeBase::Primitive(primitive)
        };

        let mut len = 1;
        if line.consume_if('[') {
            len = line.parse_number()? as u32;
            line.expect_char(']')?;
        }

        Ok(Type { base, len })
    }

    /// Reclassifies `@name` operands now that every section of the module is
    /// known: defined function, external function, global or external global.
    fn resolve_symbols(&mut self) {
        let func_names: Vec<String> = self.module.functions.iter().map(|f| f.name.clone()).collect();
        let global_names: Vec<String> = self.module.globals.iter().map(|g| g.name.clone()).collect();
        let extern_global_names: Vec<String> =
            self.module.extern_globals.iter().map(|g| g.name.clone()).collect();

        let classify = |operand: &mut Operand| {
            if let Operand::ExternFunc(name, ty) = operand {
                if func_names.iter().any(|n| n == name) {
                    *operand = Operand::Func(name.clone(), *ty);
                } else if global_names.iter().any(|n| n == name) {
                    *operand = Operand::Global(name.clone(), *ty);
                } else if extern_global_names.iter().any(|n| n == name) {
                    *operand = Operand::ExternGlobal(name.clone(), *ty);
                }
            } else if let Operand::BranchTarget(target) = operand {
                // Recursion depth is the nesting of branch-target args, which
                // is 1 in practice.
                for arg in &mut target.args {
                    if let Operand::ExternFunc(name, ty) = arg {
                        if func_names.iter().any(|n| n == name) {
                            *arg = Operand::Func(name.clone(), *ty);
                        } else if global_names.iter().any(|n| n == name) {
                            *arg = Operand::Global(name.clone(), *ty);
                        }
                    }
                }
            }
        };

        for func in &mut self.module.functions {
            for block_id in func.blocks.ids().collect::<Vec<_>>() {
                for instr_id in func.block(block_id).instrs.ids().collect::<Vec<_>>() {
                    let instr = func.block_mut(block_id).instrs.get_mut(instr_id);
                    for operand in &mut instr.operands {
                        classify(operand);
                    }
                }
            }
        }

        for global in &mut self.module.globals {
            classify(&mut global.initial);
        }
    }
}

fn is_label_line(text: &str) -> bool {
    text.ends_with(':') && !text.contains(' ') && !text.contains('=')
        || text.ends_with("):") && !text.contains('=') && !text.starts_with('%')
}

impl<'a> Line<'a> {
    fn new(number: usize, text: &'a str) -> Line<'a> {
        Line {
            number,
            text: text.as_bytes(),
            pos: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn peek(&self) -> u8 {
        if self.at_end() { 0 } else { self.text[self.pos] }
    }

    fn peek_is(&self, c: char) -> bool {
        self.peek() == c as u8
    }

    fn peek_is_digit(&self) -> bool {
        self.peek().is_ascii_digit()
    }

    fn peek_is_primitive_type(&self) -> bool {
        let rest = &self.text[self.pos..];
        for name in ["void", "i8", "i16", "i32", "i64", "f32", "f64", "addr"] {
            if rest.starts_with(name.as_bytes()) {
                let after = rest.get(name.len()).copied().unwrap_or(b' ');
                if !after.is_ascii_alphanumeric() && after != b'.' && after != b'_' {
                    return true;
                }
            }
        }
        false
    }

    fn skip_whitespace(&mut self) {
        while !self.at_end() && (self.peek() == b' ' || self.peek() == b'\t') {
            self.pos += 1;
        }
    }

    fn consume_if(&mut self, c: char) -> bool {
        self.skip_whitespace();
        if self.peek_is(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, c: char) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.peek_is(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError {
                line: self.number,
                message: format!("expected `{}`", c),
            })
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<(), ParseError> {
        self.skip_whitespace();
        if self.text[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(())
        } else {
            Err(ParseError {
                line: self.number,
                message: format!("expected `{}`", word),
            })
        }
    }

    fn parse_ident(&mut self) -> Result<String, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        while !self.at_end() {
            let c = self.peek();
            if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' || c == b'$' {
                self.pos += 1;
            } else {
                break;
            }
        }

        if start == self.pos {
            return Err(ParseError {
                line: self.number,
                message: "expected identifier".to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&self.text[start..self.pos]).into_owned())
    }

    fn parse_symbol_name(&mut self) -> Result<String, ParseError> {
        self.expect_char('@')?;
        self.parse_ident()
    }

    fn parse_number(&mut self) -> Result<i64, ParseError> {
        self.skip_whitespace();
        let start = self.pos;
        if self.peek_is('-') {
            self.pos += 1;
        }
        while self.peek_is_digit() {
            self.pos += 1;
        }

        std::str::from_utf8(&self.text[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ParseError {
                line: self.number,
                message: "expected number".to_string(),
            })
    }

    fn parse_numeric_text(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        if self.peek_is('-') {
            self.pos += 1;
        }
        while self.peek_is_digit() || self.peek_is('.') {
            self.pos += 1;
        }

        if start == self.pos {
            return Err(ParseError {
                line: self.number,
                message: "expected numeric immediate".to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&self.text[start..self.pos]).into_owned())
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, ParseError> {
        self.expect_char('"')?;
        let mut bytes = Vec::new();

        while !self.at_end() && !self.peek_is('"') {
            let c = self.peek();
            self.pos += 1;

            if c != b'\\' {
                bytes.push(c);
                continue;
            }

            let escaped = self.peek();
            self.pos += 1;
            match escaped {
                b'"' => bytes.push(b'"'),
                b'\\' => bytes.push(b'\\'),
                _ => {
                    // Two-digit hex escape.
                    let hi = escaped;
                    let lo = self.peek();
                    self.pos += 1;
                    let hex = [hi, lo];
                    let text = std::str::from_utf8(&hex).map_err(|_| self.bad_escape())?;
                    bytes.push(u8::from_str_radix(text, 16).map_err(|_| self.bad_escape())?);
                }
            }
        }

        self.expect_char('"')?;
        Ok(bytes)
    }

    fn bad_escape(&self) -> ParseError {
        ParseError {
            line: self.number,
            message: "bad escape in byte string".to_string(),
        }
    }
}

fn primitive_from_str(name: &str) -> Option<Primitive> {
    match name {
        "void" => Some(Primitive::Void),
        "i8" => Some(Primitive::I8),
        "i16" => Some(Primitive::I16),
        "i32" => Some(Primitive::I32),
        "i64" => Some(Primitive::I64),
        "f32" => Some(Primitive::F32),
        "f64" => Some(Primitive::F64),
        "addr" => Some(Primitive::Addr),
        _ => None,
    }
}

fn comparison_from_str(name: &str) -> Option<Comparison> {
    match name {
        "eq" => Some(Comparison::Eq),
        "ne" => Some(Comparison::Ne),
        "ugt" => Some(Comparison::Ugt),
        "uge" => Some(Comparison::Uge),
        "ult" => Some(Comparison::Ult),
        "ule" => Some(Comparison::Ule),
        "sgt" => Some(Comparison::Sgt),
        "sge" => Some(Comparison::Sge),
        "slt" => Some(Comparison::Slt),
        "sle" => Some(Comparison::Sle),
        "feq" => Some(Comparison::Feq),
        "fne" => Some(Comparison::Fne),
        "fgt" => Some(Comparison::Fgt),
        "fge" => Some(Comparison::Fge),
        "flt" => Some(Comparison::Flt),
        "fle" => Some(Comparison::Fle),
        _ => None,
    }
}

fn opcode_from_str(name: &str) -> Option<Opcode> {
    match name {
        "alloca" => Some(Opcode::Alloca),
        "load" => Some(Opcode::Load),
        "store" => Some(Opcode::Store),
        "loadarg" => Some(Opcode::Loadarg),
        "copy" => Some(Opcode::Copy),
        "add" => Some(Opcode::Add),
        "sub" => Some(Opcode::Sub),
        "mul" => Some(Opcode::Mul),
        "sdiv" => Some(Opcode::Sdiv),
        "srem" => Some(Opcode::Srem),
        "udiv" => Some(Opcode::Udiv),
        "urem" => Some(Opcode::Urem),
        "and" => Some(Opcode::And),
        "or" => Some(Opcode::Or),
        "xor" => Some(Opcode::Xor),
        "shl" => Some(Opcode::Shl),
        "shr" => Some(Opcode::Shr),
        "fadd" => Some(Opcode::Fadd),
        "fsub" => Some(Opcode::Fsub),
        "fmul" => Some(Opcode::Fmul),
        "fdiv" => Some(Opcode::Fdiv),
        "sqrt" => Some(Opcode::Sqrt),
        "sextend" => Some(Opcode::Sextend),
        "uextend" => Some(Opcode::Uextend),
        "truncate" => Some(Opcode::Truncate),
        "fpromote" => Some(Opcode::Fpromote),
        "fdemote" => Some(Opcode::Fdemote),
        "utof" => Some(Opcode::Utof),
        "stof" => Some(Opcode::Stof),
        "ftou" => Some(Opcode::Ftou),
        "ftos" => Some(Opcode::Ftos),
        "memberptr" => Some(Opcode::Memberptr),
        "offsetptr" => Some(Opcode::Offsetptr),
        "jmp" => Some(Opcode::Jmp),
        "cjmp" => Some(Opcode::Cjmp),
        "fcjmp" => Some(Opcode::Fcjmp),
        "select" => Some(Opcode::Select),
        "call" => Some(Opcode::Call),
        "ret" => Some(Opcode::Ret),
        "asm" => Some(Opcode::Asm),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssa::writer::write_module;

    #[test]
    fn parses_function_with_branches() {
        let module = parse_module(
            "func @max(i32, i32) -> i32 {\n\
             entry:\n\
                 %0 = loadarg i32, i32 0\n\
                 %1 = loadarg i32, i32 1\n\
                 cjmp i32 %0, sgt, i32 %1, big(i32 %0), big(i32 %1)\n\
             big(%2: i32):\n\
                 ret i32 %2\n\
             }\n",
        )
        .unwrap();

        let func = module.function("max").unwrap();
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.blocks.len(), 2);

        let entry = func.block(func.entry());
        let last = entry.last_instr().unwrap();
        assert_eq!(last.opcode, Opcode::Cjmp);
        assert_eq!(last.operands[1].comparison(), Some(Comparison::Sgt));
        assert_eq!(last.operands[3].branch_target().unwrap().args.len(), 1);
    }

    #[test]
    fn register_counter_accounts_for_parsed_regs() {
        let mut module = parse_module(
            "func @f() -> i32 {\n\
             entry:\n\
                 %7 = loadarg i32, i32 0\n\
                 ret i32 %7\n\
             }\n",
        )
        .unwrap();

        assert_eq!(module.functions[0].next_virtual_reg(), 8);
    }

    #[test]
    fn resolves_symbol_kinds() {
        let module = parse_module(
            "decl @puts(addr) -> i32\n\
             global @greeting addr = \"hi\\00\"\n\
             func @main() -> i32 {\n\
             entry:\n\
                 %0 = call i32 @puts, addr @greeting\n\
                 %1 = call i32 @helper\n\
                 ret i32 %1\n\
             }\n\
             func @helper() -> i32 {\n\
             entry:\n\
                 ret i32 3\n\
             }\n",
        )
        .unwrap();

        let main = module.function("main").unwrap();
        let entry = main.block(main.entry());
        let instrs: Vec<&Instruction> = entry.instrs.iter().collect();

        assert!(matches!(&instrs[0].operands[0], Operand::ExternFunc(name, _) if name == "puts"));
        assert!(matches!(&instrs[0].operands[1], Operand::Global(name, _) if name == "greeting"));
        assert!(matches!(&instrs[1].operands[0], Operand::Func(name, _) if name == "helper"));
    }

    #[test]
    fn struct_definitions_round_trip() {
        let source = "struct @Pair {\n\
             \x20   i32 first;\n\
             \x20   i32 second;\n\
             }\n\
             \n\
             func @zero(addr) -> void {\n\
             entry:\n\
             \x20   %0 = loadarg addr, i32 0\n\
             \x20   %1 = memberptr @Pair, addr %0, i32 0\n\
             \x20   store i32 0, addr %1\n\
             \x20   ret\n\
             }\n\
             \n";

        let module = parse_module(source).unwrap();
        assert_eq!(write_module(&module), source);
    }

    #[test]
    fn full_operand_menu_round_trips() {
        let source = "struct @Box {\n\
             \x20   i64 value;\n\
             }\n\
             \n\
             decl @sqrtf(f32) -> f32\n\
             \n\
             global @table addr = \"\\01\\02\"\n\
             \n\
             func @f(i32) -> i32 {\n\
             entry:\n\
             \x20   %0 = loadarg i32, i32 0\n\
             \x20   %1 = alloca @Box\n\
             \x20   %2 = memberptr @Box, addr %1, i32 0\n\
             \x20   store i64 -5, addr %2\n\
             \x20   %3 = call f32 @sqrtf, f32 2.5\n\
             \x20   %4 = select i32 %0, slt, i32 0, i32 1, i32 2\n\
             \x20   jmp exit(i32 %4)\n\
             exit(%5: i32):\n\
             \x20   ret i32 %5\n\
             }\n\
             \n";

        let module = parse_module(source).unwrap();
        assert_eq!(write_module(&module), source);
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        let err = parse_module(
            "func @f() -> void {\n\
             entry:\n\
                 frobnicate i32 1\n\
             }\n",
        )
        .unwrap_err();
        assert!(err.message.contains("unknown opcode"));
    }
}
