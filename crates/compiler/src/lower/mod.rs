//! AST to SSA lowering.
//!
//! [`LowerCtx`] carries the state one function's lowering needs: the block
//! cursor, the entry-block alloca cursor, loop and move scopes, the spill
//! slots of locals and parameters, and the caches mapping language types to
//! IR structures. The per-construct rules live in the submodules:
//!
//! - `expr`: literals, operators, casts, coercions
//! - `bool_expr`: short-circuit lowering against a pair of branch targets
//! - `location`: l-value paths, captured variables, protocol dispatch
//! - `call`: calls through functions, pointers, closures and vtables
//! - `closure`: closure lifting and context construction
//! - `control_flow`: if/while/for/switch/try statements
//! - `deinit`: destructor flags and the scope-exit destructor walk
//! - `func`: whole function definitions
//! - `conversion`: numeric conversion selection

pub mod bool_expr;
pub mod call;
pub mod closure;
pub mod control_flow;
pub mod conversion;
pub mod deinit;
pub mod expr;
pub mod func;
pub mod location;
pub mod storage;

use std::collections::HashMap;
use std::error::Error;
use std::fmt;

use crate::ast::{Ast, NodeId, SourceRange};
use crate::config::Config;
use crate::diagnostics::DiagnosticBuffer;
use crate::ssa::{
    self, BlockId, BranchTarget, Comparison, Instruction, InstrId, Opcode, Operand,
    VirtualRegister,
};
use crate::symbols::{
    DeinitId, FuncId, LocalId, ParamId, ProtoId, SymbolRef, UnionId, Unit,
};
use crate::target::DataLayout;
use crate::types::{PrimitiveType, Type};

#[derive(Debug)]
pub enum LowerError {
    /// A destructible value was used after its ownership moved; lowering of
    /// the containing function aborts.
    UseAfterMove,
    /// The resolved AST violated a front-end contract.
    MalformedInput(String),
}

impl fmt::Display for LowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LowerError::UseAfterMove => write!(f, "use of moved value"),
            LowerError::MalformedInput(message) => write!(f, "malformed input: {}", message),
        }
    }
}

impl Error for LowerError {}

/// Reference to a capturable variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarRef {
    Local(LocalId),
    Param(ParamId),
}

/// State of the closure whose body is currently being lowered.
pub struct ClosureState {
    pub node: NodeId,
    pub context_struct: ssa::StructId,
    pub captured: Vec<VarRef>,
}

pub struct LoopScope {
    pub entry: BlockId,
    pub exit: BlockId,
}

/// Lexical move-tracking scope; conditional scopes merge into their parent
/// when closed.
#[derive(Default)]
pub struct MoveScope {
    pub moves: HashMap<DeinitId, SourceRange>,
}

#[derive(Default)]
struct Counters {
    string: u32,
    block: u32,
    if_chain: u32,
    switch: u32,
    while_loop: u32,
    for_loop: u32,
    or: u32,
    and: u32,
    cmp_to_val: u32,
    deinit_flag: u32,
    closure: u32,
    dead: u32,
}

/// Saved per-function state, restored after a closure body is lowered.
pub struct FuncState {
    func: Option<ssa::Function>,
    cur_block: Option<BlockId>,
    cur_lang_func: Option<FuncId>,
    arg_regs: Vec<VirtualRegister>,
    return_reg: Option<VirtualRegister>,
    func_exit: Option<BlockId>,
    last_alloca: Option<InstrId>,
    loop_scopes: Vec<LoopScope>,
    move_scopes: Vec<MoveScope>,
    func_vars: std::collections::HashSet<VarRef>,
}

pub struct LowerCtx<'a> {
    pub unit: &'a Unit,
    pub ast: &'a Ast,
    pub config: &'a Config,
    pub layout: DataLayout,
    pub module: ssa::Module,
    pub diags: &'a mut DiagnosticBuffer,

    func: Option<ssa::Function>,
    cur_block: Option<BlockId>,
    cur_lang_func: Option<FuncId>,
    pub closure: Option<ClosureState>,
    arg_regs: Vec<VirtualRegister>,
    return_reg: Option<VirtualRegister>,
    func_exit: Option<BlockId>,
    last_alloca: Option<InstrId>,
    loop_scopes: Vec<LoopScope>,
    move_scopes: Vec<MoveScope>,
    /// Variables declared by the function currently being lowered; a
    /// reference to anything else from inside a closure body is a capture.
    func_vars: std::collections::HashSet<VarRef>,

    pub local_regs: HashMap<LocalId, VirtualRegister>,
    pub param_slots: HashMap<ParamId, VirtualRegister>,
    pub deinit_flags: HashMap<DeinitId, VirtualRegister>,

    allocated_blocks: std::collections::HashSet<NodeId>,

    struct_cache: HashMap<crate::symbols::StructId, ssa::StructId>,
    union_cache: HashMap<UnionId, ssa::StructId>,
    union_case_cache: HashMap<(UnionId, usize), ssa::StructId>,
    proto_cache: HashMap<ProtoId, ssa::StructId>,
    vtable_cache: HashMap<ProtoId, ssa::StructId>,
    tuple_cache: HashMap<Vec<ssa::Type>, ssa::StructId>,
    closure_struct: Option<ssa::StructId>,

    counters: Counters,
}

impl<'a> LowerCtx<'a> {
    pub fn new(
        unit: &'a Unit,
        ast: &'a Ast,
        config: &'a Config,
        diags: &'a mut DiagnosticBuffer,
    ) -> LowerCtx<'a> {
        LowerCtx {
            unit,
            ast,
            config,
            layout: config.target.data_layout(),
            module: ssa::Module::new(),
            diags,
            func: None,
            cur_block: None,
            cur_lang_func: None,
            closure: None,
            arg_regs: Vec::new(),
            return_reg: None,
            func_exit: None,
            last_alloca: None,
            loop_scopes: Vec::new(),
            move_scopes: Vec::new(),
            func_vars: std::collections::HashSet::new(),
            allocated_blocks: std::collections::HashSet::new(),
            local_regs: HashMap::new(),
            param_slots: HashMap::new(),
            deinit_flags: HashMap::new(),
            struct_cache: HashMap::new(),
            union_cache: HashMap::new(),
            union_case_cache: HashMap::new(),
            proto_cache: HashMap::new(),
            vtable_cache: HashMap::new(),
            tuple_cache: HashMap::new(),
            closure_struct: None,
            counters: Counters::default(),
        }
    }

    // ---- current function plumbing ----

    pub fn func(&self) -> &ssa::Function {
        self.func.as_ref().expect("no function being lowered")
    }

    pub fn func_mut(&mut self) -> &mut ssa::Function {
        self.func.as_mut().expect("no function being lowered")
    }

    pub fn begin_func(&mut self, func: ssa::Function, lang_func: FuncId) {
        let entry = func.entry();
        self.func = Some(func);
        self.cur_block = Some(entry);
        self.cur_lang_func = Some(lang_func);
        self.return_reg = None;
        self.func_exit = None;
        self.last_alloca = None;
        self.arg_regs.clear();
        self.loop_scopes.clear();
        self.move_scopes.clear();
        self.func_vars.clear();
    }

    /// Finishes the current function and adds it to the module.
    pub fn finish_func(&mut self) {
        let func = self.func.take().expect("no function to finish");
        self.module.functions.push(func);
        self.cur_block = None;
        self.cur_lang_func = None;
    }

    pub fn save_func_state(&mut self) -> FuncState {
        FuncState {
            func: self.func.take(),
            cur_block: self.cur_block.take(),
            cur_lang_func: self.cur_lang_func.take(),
            arg_regs: std::mem::take(&mut self.arg_regs),
            return_reg: self.return_reg.take(),
            func_exit: self.func_exit.take(),
            last_alloca: self.last_alloca.take(),
            loop_scopes: std::mem::take(&mut self.loop_scopes),
            move_scopes: std::mem::take(&mut self.move_scopes),
            func_vars: std::mem::take(&mut self.func_vars),
        }
    }

    pub fn restore_func_state(&mut self, state: FuncState) {
        self.func = state.func;
        self.cur_block = state.cur_block;
        self.cur_lang_func = state.cur_lang_func;
        self.arg_regs = state.arg_regs;
        self.return_reg = state.return_reg;
        self.func_exit = state.func_exit;
        self.last_alloca = state.last_alloca;
        self.loop_scopes = state.loop_scopes;
        self.move_scopes = state.move_scopes;
        self.func_vars = state.func_vars;
    }

    pub fn register_func_var(&mut self, var: VarRef) {
        self.func_vars.insert(var);
    }

    pub fn is_func_var(&self, var: VarRef) -> bool {
        self.func_vars.contains(&var)
    }

    /// Marks a block's locals as allocated; returns false if they already
    /// were.
    pub fn mark_block_allocated(&mut self, block: NodeId) -> bool {
        self.allocated_blocks.insert(block)
    }

    pub fn cur_lang_func(&self) -> FuncId {
        self.cur_lang_func.expect("no language function set")
    }

    pub fn arg_regs(&self) -> &[VirtualRegister] {
        &self.arg_regs
    }

    pub fn set_arg_regs(&mut self, regs: Vec<VirtualRegister>) {
        self.arg_regs = regs;
    }

    pub fn return_reg(&self) -> Option<VirtualRegister> {
        self.return_reg
    }

    pub fn set_return_reg(&mut self, reg: VirtualRegister) {
        self.return_reg = Some(reg);
    }

    pub fn func_exit(&self) -> BlockId {
        self.func_exit.expect("no function exit block")
    }

    pub fn set_func_exit(&mut self, block: BlockId) {
        self.func_exit = Some(block);
    }

    // ---- blocks and the instruction cursor ----

    pub fn cur_block(&self) -> BlockId {
        self.cur_block.expect("no current block")
    }

    pub fn create_block(&mut self, label: String) -> BlockId {
        self.func_mut().create_block(label)
    }

    /// Moves the cursor: subsequent instructions go to `block`.
    pub fn enter_block(&mut self, block: BlockId) {
        self.cur_block = Some(block);
    }

    /// Appends to the current block. Emitting past a terminator opens a
    /// fresh unreachable block so the single-terminator rule holds; the
    /// control-flow cleanup pass deletes those blocks later.
    pub fn emit(&mut self, instr: Instruction) -> InstrId {
        let block = self.cur_block();
        if self.func().block(block).is_terminated() {
            let label = format!("dead.{}", self.counters.dead);
            self.counters.dead += 1;
            let dead = self.create_block(label);
            self.enter_block(dead);
        }

        let block = self.cur_block();
        self.func_mut().block_mut(block).append(instr)
    }

    pub fn next_reg(&mut self) -> VirtualRegister {
        self.func_mut().next_virtual_reg()
    }

    pub fn is_terminated(&self) -> bool {
        self.func().block(self.cur_block()).is_terminated()
    }

    // ---- instruction helpers ----

    /// Allocates a stack slot in the entry block, keeping allocas adjacent
    /// behind a cursor.
    pub fn append_alloca(&mut self, ty: ssa::Type) -> VirtualRegister {
        let reg = self.next_reg();
        self.append_alloca_into(reg, ty);
        reg
    }

    pub fn append_alloca_into(&mut self, dest: VirtualRegister, ty: ssa::Type) -> InstrId {
        let instr = Instruction::with_dest(Opcode::Alloca, dest, vec![Operand::Type(ty)]);
        let entry = self.func().entry();

        let id = match self.last_alloca {
            Some(last) => {
                let func = self.func_mut();
                func.block_mut(entry).instrs.insert_after(last, instr)
            }
            None => match self.func().block(entry).instrs.first() {
                Some(first) => {
                    let func = self.func_mut();
                    func.block_mut(entry).instrs.insert_before(first, instr)
                }
                None => self.func_mut().block_mut(entry).append(instr),
            },
        };

        self.last_alloca = Some(id);
        id
    }

    pub fn append_store(&mut self, src: Operand, dst: Operand) -> InstrId {
        self.emit(Instruction::new(Opcode::Store, vec![src, dst]))
    }

    pub fn append_load(&mut self, ty: ssa::Type, ptr: Operand) -> Operand {
        let reg = self.next_reg();
        self.emit(Instruction::with_dest(
            Opcode::Load,
            reg,
            vec![Operand::Type(ty), ptr],
        ));
        Operand::from_register(reg, ty)
    }

    pub fn append_load_into(&mut self, dest: VirtualRegister, ty: ssa::Type, ptr: Operand) {
        self.emit(Instruction::with_dest(
            Opcode::Load,
            dest,
            vec![Operand::Type(ty), ptr],
        ));
    }

    pub fn append_jmp(&mut self, block: BlockId) {
        self.append_jmp_with_args(block, Vec::new());
    }

    pub fn append_jmp_with_args(&mut self, block: BlockId, args: Vec<Operand>) {
        self.emit(Instruction::new(
            Opcode::Jmp,
            vec![Operand::BranchTarget(BranchTarget { block, args })],
        ));
    }

    pub fn append_cjmp(
        &mut self,
        lhs: Operand,
        comparison: Comparison,
        rhs: Operand,
        true_block: BlockId,
        false_block: BlockId,
    ) {
        let opcode = if lhs.ty().is_floating_point() {
            Opcode::Fcjmp
        } else {
            Opcode::Cjmp
        };

        self.emit(Instruction::new(
            opcode,
            vec![
                lhs,
                Operand::Comparison(comparison),
                rhs,
                Operand::BranchTarget(BranchTarget {
                    block: true_block,
                    args: Vec::new(),
                }),
                Operand::BranchTarget(BranchTarget {
                    block: false_block,
                    args: Vec::new(),
                }),
            ],
        ));
    }

    pub fn append_memberptr(
        &mut self,
        struct_ty: ssa::Type,
        base: Operand,
        member: usize,
    ) -> VirtualRegister {
        let reg = self.next_reg();
        self.append_memberptr_into(reg, struct_ty, base, member);
        reg
    }

    pub fn append_memberptr_into(
        &mut self,
        dest: VirtualRegister,
        struct_ty: ssa::Type,
        base: Operand,
        member: usize,
    ) {
        self.emit(Instruction::with_dest(
            Opcode::Memberptr,
            dest,
            vec![
                Operand::Type(struct_ty),
                base,
                Operand::from_int_immediate(member as i128, ssa::I32),
            ],
        ));
    }

    pub fn append_offsetptr(
        &mut self,
        base: Operand,
        offset: Operand,
        element_ty: ssa::Type,
    ) -> VirtualRegister {
        let reg = self.next_reg();
        self.emit(Instruction::with_dest(
            Opcode::Offsetptr,
            reg,
            vec![base, offset, Operand::Type(element_ty)],
        ));
        reg
    }

    pub fn append_ret(&mut self, value: Option<Operand>) {
        let operands = value.into_iter().collect();
        self.emit(Instruction::new(Opcode::Ret, operands));
    }

    pub fn append_copy(&mut self, dst: Operand, src: Operand, ty: ssa::Type) {
        self.emit(Instruction::new(
            Opcode::Copy,
            vec![dst, src, Operand::Type(ty)],
        ));
    }

    pub fn size_of(&self, ty: ssa::Type) -> u32 {
        self.layout.size(ty, &self.module)
    }

    pub fn fits_in_register(&self, ty: ssa::Type) -> bool {
        self.layout.fits_in_register(ty)
    }

    // ---- loop scopes ----

    pub fn push_loop_scope(&mut self, entry: BlockId, exit: BlockId) {
        self.loop_scopes.push(LoopScope { entry, exit });
    }

    pub fn pop_loop_scope(&mut self) {
        self.loop_scopes.pop();
    }

    pub fn loop_scope(&self) -> Option<&LoopScope> {
        self.loop_scopes.last()
    }

    // ---- move scopes ----

    pub fn push_move_scope(&mut self) {
        self.move_scopes.push(MoveScope::default());
    }

    /// Closes a scope; its moves merge into the parent so a conditional
    /// move still counts as a move afterwards.
    pub fn pop_move_scope(&mut self) {
        let Some(scope) = self.move_scopes.pop() else {
            return;
        };
        if let Some(parent) = self.move_scopes.last_mut() {
            for (deinit, range) in scope.moves {
                parent.moves.entry(deinit).or_insert(range);
            }
        }
    }

    pub fn previous_move(&self, deinit: DeinitId) -> Option<SourceRange> {
        self.move_scopes
            .iter()
            .rev()
            .find_map(|scope| scope.moves.get(&deinit).copied())
    }

    pub fn record_move(&mut self, deinit: DeinitId, range: SourceRange) {
        if let Some(scope) = self.move_scopes.last_mut() {
            scope.moves.insert(deinit, range);
        }
    }

    // ---- label counters ----

    pub fn next_string_name(&mut self) -> String {
        let name = format!("str.{}", self.counters.string);
        self.counters.string += 1;
        name
    }

    pub fn next_block_id(&mut self) -> u32 {
        next(&mut self.counters.block)
    }

    pub fn next_if_chain_id(&mut self) -> u32 {
        next(&mut self.counters.if_chain)
    }

    pub fn next_switch_id(&mut self) -> u32 {
        next(&mut self.counters.switch)
    }

    pub fn next_while_id(&mut self) -> u32 {
        next(&mut self.counters.while_loop)
    }

    pub fn next_for_id(&mut self) -> u32 {
        next(&mut self.counters.for_loop)
    }

    pub fn next_or_id(&mut self) -> u32 {
        next(&mut self.counters.or)
    }

    pub fn next_and_id(&mut self) -> u32 {
        next(&mut self.counters.and)
    }

    pub fn next_cmp_to_val_id(&mut self) -> u32 {
        next(&mut self.counters.cmp_to_val)
    }

    pub fn next_deinit_flag_id(&mut self) -> u32 {
        next(&mut self.counters.deinit_flag)
    }

    pub fn next_closure_id(&mut self) -> u32 {
        next(&mut self.counters.closure)
    }

    // ---- type building ----

    /// Maps a language-level type to its IR type, interning structure
    /// definitions into the module on first use.
    pub fn build_type(&mut self, ty: &Type) -> ssa::Type {
        match ty {
            Type::Primitive(primitive) => primitive_type(*primitive),
            Type::Pointer(_) | Type::Function(_) => ssa::ADDR,
            Type::Enum(_) => ssa::I32,
            Type::Struct(id) => ssa::Type::structure(self.lang_struct(*id)),
            Type::Union(id) => ssa::Type::structure(self.union_struct(*id)),
            Type::UnionCase(id, case) => ssa::Type::structure(self.union_case_struct(*id, *case)),
            Type::Proto(id) => ssa::Type::structure(self.fat_pointer_struct(*id)),
            Type::Closure(_) => ssa::Type::structure(self.closure_value_struct()),
            Type::StaticArray(base, len) => {
                let element = self.build_type(base);
                ssa::Type {
                    base: element.base,
                    len: element.len * len,
                }
            }
            Type::Tuple(types) => {
                let members: Vec<ssa::Type> =
                    types.iter().map(|ty| self.build_type(ty)).collect();
                ssa::Type::structure(self.tuple_struct(members))
            }
            Type::Generic(_) => {
                unreachable!("generic placeholder survived to lowering")
            }
        }
    }

    fn lang_struct(&mut self, id: crate::symbols::StructId) -> ssa::StructId {
        if let Some(&interned) = self.struct_cache.get(&id) {
            return interned;
        }

        let name = self.unit.structure(id).name.clone();
        let interned = self.module.add_struct(ssa::Structure {
            name,
            members: Vec::new(),
        });
        self.struct_cache.insert(id, interned);

        let fields = self.unit.structure(id).fields.clone();
        let members = fields
            .iter()
            .map(|field| ssa::StructureMember {
                name: field.name.clone(),
                ty: self.build_type(&field.ty),
            })
            .collect();
        self.module.structure_mut(interned).members = members;

        interned
    }

    /// A tagged union lowers to `{ i32 tag, i8[size] data }` where the data
    /// blob is as large as the largest case.
    fn union_struct(&mut self, id: UnionId) -> ssa::StructId {
        if let Some(&interned) = self.union_cache.get(&id) {
            return interned;
        }

        let name = format!("union.{}", self.unit.union(id).name);
        let interned = self.module.add_struct(ssa::Structure {
            name,
            members: Vec::new(),
        });
        self.union_cache.insert(id, interned);

        let case_count = self.unit.union(id).cases.len();
        let mut data_size = 0;
        for case in 0..case_count {
            let case_struct = self.union_case_struct(id, case);
            data_size = data_size.max(self.size_of(ssa::Type::structure(case_struct)));
        }

        self.module.structure_mut(interned).members = vec![
            ssa::StructureMember {
                name: "tag".to_string(),
                ty: ssa::I32,
            },
            ssa::StructureMember {
                name: "data".to_string(),
                ty: ssa::Type::array(ssa::Primitive::I8, data_size.max(1)),
            },
        ];

        interned
    }

    pub fn union_case_struct(&mut self, id: UnionId, case: usize) -> ssa::StructId {
        if let Some(&interned) = self.union_case_cache.get(&(id, case)) {
            return interned;
        }

        let union_symbol = self.unit.union(id);
        let name = format!("union.{}.{}", union_symbol.name, union_symbol.cases[case].name);
        let interned = self.module.add_struct(ssa::Structure {
            name,
            members: Vec::new(),
        });
        self.union_case_cache.insert((id, case), interned);

        let fields = self.unit.union(id).cases[case].fields.clone();
        let members = fields
            .iter()
            .map(|field| ssa::StructureMember {
                name: field.name.clone(),
                ty: self.build_type(&field.ty),
            })
            .collect();
        self.module.structure_mut(interned).members = members;

        interned
    }

    /// Protocol-typed values travel as `{ addr self, addr vtable }`.
    pub fn fat_pointer_struct(&mut self, id: ProtoId) -> ssa::StructId {
        if let Some(&interned) = self.proto_cache.get(&id) {
            return interned;
        }

        let name = format!("proto.{}", self.unit.protocol(id).name);
        let interned = self.module.add_struct(ssa::Structure {
            name,
            members: vec![
                ssa::StructureMember {
                    name: "self".to_string(),
                    ty: ssa::ADDR,
                },
                ssa::StructureMember {
                    name: "vtable".to_string(),
                    ty: ssa::ADDR,
                },
            ],
        });
        self.proto_cache.insert(id, interned);
        interned
    }

    /// The vtable structure of a protocol: one `addr` slot per method, in
    /// signature order.
    pub fn vtable_struct(&mut self, id: ProtoId) -> ssa::StructId {
        if let Some(&interned) = self.vtable_cache.get(&id) {
            return interned;
        }

        let proto = self.unit.protocol(id);
        let name = format!("vtable.{}", proto.name);
        let members = proto
            .methods
            .iter()
            .map(|method| ssa::StructureMember {
                name: method.name.clone(),
                ty: ssa::ADDR,
            })
            .collect();

        let interned = self.module.add_struct(ssa::Structure { name, members });
        self.vtable_cache.insert(id, interned);
        interned
    }

    /// The two-field `{ addr fn, addr ctx }` record every closure value
    /// shares.
    pub fn closure_value_struct(&mut self) -> ssa::StructId {
        if let Some(interned) = self.closure_struct {
            return interned;
        }

        let interned = self.module.add_struct(ssa::Structure {
            name: "closure".to_string(),
            members: vec![
                ssa::StructureMember {
                    name: "fn".to_string(),
                    ty: ssa::ADDR,
                },
                ssa::StructureMember {
                    name: "ctx".to_string(),
                    ty: ssa::ADDR,
                },
            ],
        });
        self.closure_struct = Some(interned);
        interned
    }

    fn tuple_struct(&mut self, members: Vec<ssa::Type>) -> ssa::StructId {
        if let Some(&interned) = self.tuple_cache.get(&members) {
            return interned;
        }

        let name = format!("tuple.{}", self.tuple_cache.len());
        let interned = self.module.add_struct(ssa::Structure {
            name,
            members: members
                .iter()
                .enumerate()
                .map(|(index, &ty)| ssa::StructureMember {
                    name: format!("item{}", index),
                    ty,
                })
                .collect(),
        });
        self.tuple_cache.insert(members, interned);
        interned
    }

    // ---- symbol plumbing ----

    /// The link name a function gets in the IR: an explicit link name wins,
    /// native/exposed functions keep their plain name, everything else is
    /// mangled with its module path (and enclosing type).
    pub fn func_link_name(&self, func: FuncId) -> String {
        let symbol = self.unit.function(func);

        if let Some(link_name) = &symbol.link_name {
            return link_name.clone();
        }

        let modifiers = symbol.modifiers;
        if modifiers.native || modifiers.exposed || modifiers.dllexport || symbol.name == "main" {
            return symbol.name.clone();
        }

        let mut name = self.unit.module(symbol.module).path_string();
        match symbol.enclosing {
            Some(SymbolRef::Struct(id)) => {
                name.push('.');
                name.push_str(&self.unit.structure(id).name);
            }
            Some(SymbolRef::Union(id)) => {
                name.push('.');
                name.push_str(&self.unit.union(id).name);
            }
            _ => {}
        }
        name.push('.');
        name.push_str(&symbol.name);
        name
    }

    pub fn global_link_name(&self, id: crate::symbols::GlobalId) -> String {
        let symbol = self.unit.global(id);

        if let Some(link_name) = &symbol.link_name {
            return link_name.clone();
        }
        if symbol.native || symbol.exposed {
            return symbol.name.clone();
        }

        format!(
            "{}.{}",
            self.unit.module(symbol.module).path_string(),
            symbol.name
        )
    }

    /// Declares an external function once; later calls with the same name
    /// are no-ops.
    pub fn ensure_extern_func(&mut self, name: &str, params: Vec<ssa::Type>, ret: ssa::Type) {
        if self.module.extern_function(name).is_none() {
            self.module.extern_functions.push(ssa::FunctionDecl {
                name: name.to_string(),
                params,
                return_type: ret,
            });
        }
    }

    /// Callee operand for a direct call: defined functions by link name,
    /// native ones as external references.
    pub fn func_operand(&self, func: FuncId, ty: ssa::Type) -> Operand {
        let symbol = self.unit.function(func);
        let name = self.func_link_name(func);

        if symbol.modifiers.native {
            Operand::ExternFunc(name, ty)
        } else {
            Operand::Func(name, ty)
        }
    }
}

fn next(counter: &mut u32) -> u32 {
    let value = *counter;
    *counter += 1;
    value
}


fn primitive_type(primitive: PrimitiveType) -> ssa::Type {
    match primitive {
        PrimitiveType::I8 | PrimitiveType::U8 | PrimitiveType::Bool => ssa::I8,
        PrimitiveType::I16 | PrimitiveType::U16 => ssa::I16,
        PrimitiveType::I32 | PrimitiveType::U32 => ssa::I32,
        PrimitiveType::I64 | PrimitiveType::U64 => ssa::I64,
        PrimitiveType::F32 => ssa::F32,
        PrimitiveType::F64 => ssa::F64,
        PrimitiveType::Addr => ssa::ADDR,
        PrimitiveType::Void => ssa::VOID,
    }
}

/// Lowers every function definition in the unit into one SSA module,
/// together with globals, external declarations and vtables.
pub fn lower_unit(
    unit: &Unit,
    ast: &Ast,
    config: &Config,
    diags: &mut DiagnosticBuffer,
) -> ssa::Module {
    let mut ctx = LowerCtx::new(unit, ast, config, diags);

    // Globals first so initializers are available to function bodies.
    for (index, symbol) in unit.globals.iter().enumerate() {
        let id = crate::symbols::GlobalId(index as u32);
        let name = ctx.global_link_name(id);
        let ty = ctx.build_type(&symbol.ty);
        let initial = match &symbol.initial {
            Some(crate::symbols::ConstValue::Int(value)) => Operand::from_int_immediate(*value, ty),
            Some(crate::symbols::ConstValue::Float(value)) => Operand::from_fp_immediate(*value, ty),
            Some(crate::symbols::ConstValue::Str(bytes)) => Operand::Bytes(bytes.clone()),
            None => Operand::from_int_immediate(0, ty),
        };

        if symbol.native {
            ctx.module.extern_globals.push(ssa::GlobalDecl { name, ty });
        } else {
            ctx.module.globals.push(ssa::Global {
                name,
                ty,
                initial,
                external: false,
            });
        }
    }

    // External declarations for native functions.
    for (index, symbol) in unit.functions.iter().enumerate() {
        if !symbol.modifiers.native {
            continue;
        }
        let id = FuncId(index as u32);
        let name = ctx.func_link_name(id);
        let params = symbol
            .params
            .iter()
            .map(|&param| {
                let ty = unit.param(param).ty.clone();
                ctx.build_type(&ty)
            })
            .collect();
        let return_type = {
            let ty = symbol.return_type.clone();
            ctx.build_type(&ty)
        };
        ctx.module.extern_functions.push(ssa::FunctionDecl {
            name,
            params,
            return_type,
        });
    }

    // Vtable globals: one address-sized global per method slot, emitted
    // back-to-back so the table is contiguous, the first slot carrying the
    // vtable's symbol name.
    for structure in &unit.structs {
        for proto_impl in &structure.proto_impls {
            let proto = unit.protocol(proto_impl.proto);
            ctx.vtable_struct(proto_impl.proto);

            for (slot, method_sig) in proto.methods.iter().enumerate() {
                let method = structure
                    .methods
                    .iter()
                    .copied()
                    .find(|&func| unit.function(func).name == method_sig.name);

                let initial = match method {
                    Some(func) => ctx.func_operand(func, ssa::ADDR),
                    None => Operand::from_int_immediate(0, ssa::ADDR),
                };
                let name = if slot == 0 {
                    proto_impl.vtable_global.clone()
                } else {
                    format!("{}.{}", proto_impl.vtable_global, slot)
                };

                ctx.module.globals.push(ssa::Global {
                    name,
                    ty: ssa::ADDR,
                    initial,
                    external: false,
                });
            }
        }
    }

    // Function bodies. Closure bodies hang under their closure expression
    // and are lowered when the enclosing function reaches them.
    for index in 0..unit.functions.len() {
        let id = FuncId(index as u32);
        let symbol = unit.function(id);

        if symbol.modifiers.native || symbol.body.is_none() {
            continue;
        }

        let is_closure_body = symbol.body.is_some_and(|body| {
            ast.node(body)
                .parent
                .is_some_and(|parent| matches!(ast.node(parent).kind, crate::ast::NodeKind::Closure(_)))
        });
        if is_closure_body {
            continue;
        }

        if let Err(error) = func::lower_function(&mut ctx, id) {
            match error {
                LowerError::UseAfterMove => {
                    // Diagnostic already buffered with both sites; drop the
                    // partial function and move on.
                    ctx.func = None;
                    ctx.cur_block = None;
                    ctx.cur_lang_func = None;
                }
                LowerError::MalformedInput(message) => {
                    ctx.diags.error(
                        format!("internal lowering failure: {}", message),
                        None,
                    );
                    ctx.func = None;
                    ctx.cur_block = None;
                    ctx.cur_lang_func = None;
                }
            }
        }
    }

    ctx.module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BinaryOp, BlockInfo, MoveInfo, NodeKind};
    use crate::ssa::validator::Validator;
    use crate::ssa::writer::write_module;
    use crate::symbols::{
        DeinitDescriptor, Field, FunctionModifiers, FunctionSymbol, LocalSymbol, Location,
        LocationElement, LocationElementKind, ModuleDecl, ParamSymbol, StructSymbol, SymbolTable,
        UnionCase, UnionSymbol,
    };
    use crate::types::PrimitiveType;

    fn int_ty() -> Type {
        Type::Primitive(PrimitiveType::I32)
    }

    fn bool_ty() -> Type {
        Type::Primitive(PrimitiveType::Bool)
    }

    struct Builder {
        unit: Unit,
        ast: Ast,
        module: crate::symbols::ModuleId,
    }

    impl Builder {
        fn new() -> Builder {
            let mut unit = Unit::new();
            let table = unit.add_table(SymbolTable::new(None));
            let module = unit.add_module(ModuleDecl {
                path: vec!["main".to_string()],
                table,
            });
            Builder {
                unit,
                ast: Ast::new(),
                module,
            }
        }

        fn expr(&mut self, kind: NodeKind, ty: Type) -> NodeId {
            let id = self.ast.add(kind);
            self.ast.node_mut(id).expr.ty = Some(ty);
            id
        }

        fn block(&mut self, deinits: Vec<DeinitId>) -> NodeId {
            let table = self.unit.add_table(SymbolTable::new(None));
            self.ast.add(NodeKind::Block(BlockInfo { table, deinits }))
        }

        fn local(&mut self, block: NodeId, name: &str, ty: Type, deinit: Option<DeinitId>) -> LocalId {
            let id = self.unit.add_local(LocalSymbol {
                name: name.to_string(),
                ty,
                deinit,
            });
            let NodeKind::Block(info) = &self.ast.node(block).kind else {
                panic!("locals belong to blocks");
            };
            let table = info.table;
            self.unit.table_mut(table).locals.push(id);
            id
        }

        fn func(
            &mut self,
            name: &str,
            params: Vec<(&str, Type)>,
            ret: Type,
            body: NodeId,
        ) -> FuncId {
            let params = params
                .into_iter()
                .map(|(param_name, ty)| {
                    self.unit.add_param(ParamSymbol {
                        name: param_name.to_string(),
                        ty,
                    })
                })
                .collect();

            self.unit.add_function(FunctionSymbol {
                name: name.to_string(),
                module: self.module,
                params,
                return_type: ret,
                modifiers: FunctionModifiers::default(),
                link_name: None,
                enclosing: None,
                generic_instance_of: None,
                body: Some(body),
            })
        }

        fn param_ident(&mut self, param: crate::symbols::ParamId, ty: Type) -> NodeId {
            let node = self.expr(NodeKind::Identifier("p".to_string()), ty.clone());
            self.ast.node_mut(node).expr.location = Some(Location {
                elements: vec![LocationElement {
                    kind: LocationElementKind::Param(param),
                    ty,
                }],
            });
            node
        }

        fn local_ident(&mut self, local: LocalId, ty: Type) -> NodeId {
            let node = self.expr(NodeKind::Identifier("l".to_string()), ty.clone());
            self.ast.node_mut(node).expr.location = Some(Location {
                elements: vec![LocationElement {
                    kind: LocationElementKind::Local(local),
                    ty,
                }],
            });
            self.ast.node_mut(node).expr.symbol = Some(SymbolRef::Local(local));
            node
        }

        fn lower(&mut self) -> (ssa::Module, DiagnosticBuffer) {
            let config = Config::default();
            let mut diags = DiagnosticBuffer::new();
            let module = lower_unit(&self.unit, &self.ast, &config, &mut diags);
            (module, diags)
        }
    }

    fn assert_valid(module: &ssa::Module) {
        let mut validator = Validator::new();
        assert!(
            validator.validate(module),
            "{}\n{}",
            validator.report(),
            write_module(module)
        );
    }

    #[test]
    fn lowers_identity_add_function() {
        let mut b = Builder::new();
        let body = b.block(vec![]);
        let func = b.func("f", vec![("x", int_ty())], int_ty(), body);

        let x = b.unit.function(func).params[0];
        let x_ident = b.param_ident(x, int_ty());
        let zero = b.expr(NodeKind::IntLiteral(0), int_ty());
        let add = b.expr(NodeKind::Binary(BinaryOp::Add), int_ty());
        b.ast.append_child(add, x_ident);
        b.ast.append_child(add, zero);

        let ret = b.ast.add(NodeKind::Return);
        b.ast.append_child(ret, add);
        b.ast.append_child(body, ret);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        assert!(out.contains("func @main.f(i32) -> i32"), "{}", out);
        assert!(out.contains("loadarg i32, i32 0"), "{}", out);
        assert!(out.contains("add i32"), "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn optimized_identity_add_reduces_to_the_argument() {
        let mut b = Builder::new();
        let body = b.block(vec![]);
        let func = b.func("f", vec![("x", int_ty())], int_ty(), body);

        let x = b.unit.function(func).params[0];
        let x_ident = b.param_ident(x, int_ty());
        let zero = b.expr(NodeKind::IntLiteral(0), int_ty());
        let add = b.expr(NodeKind::Binary(BinaryOp::Add), int_ty());
        b.ast.append_child(add, x_ident);
        b.ast.append_child(add, zero);
        let ret = b.ast.add(NodeKind::Return);
        b.ast.append_child(ret, add);
        b.ast.append_child(body, ret);

        let (mut module, diags) = b.lower();
        assert!(!diags.has_errors());

        for func in &mut module.functions {
            func.global = true;
        }
        crate::passes::PassRunner::new(Config::default())
            .run(&mut module)
            .unwrap();

        let out = write_module(&module);
        assert!(!out.contains("alloca"), "{}", out);
        assert!(!out.contains("store"), "{}", out);
        assert!(!out.contains("add i32"), "{}", out);
        assert!(out.contains("loadarg"), "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn boolean_short_circuit_threads_branch_targets() {
        let mut b = Builder::new();
        let body = b.block(vec![]);
        let func = b.func(
            "f",
            vec![("a", bool_ty()), ("c", bool_ty())],
            Type::Primitive(PrimitiveType::Void),
            body,
        );

        let a = b.unit.function(func).params[0];
        let c = b.unit.function(func).params[1];
        let a_ident = b.param_ident(a, bool_ty());
        let c_ident = b.param_ident(c, bool_ty());

        let and = b.expr(NodeKind::Binary(BinaryOp::And), bool_ty());
        b.ast.append_child(and, a_ident);
        b.ast.append_child(and, c_ident);

        let then_block = b.block(vec![]);
        let if_node = b.ast.add(NodeKind::If);
        b.ast.append_child(if_node, and);
        b.ast.append_child(if_node, then_block);
        let chain = b.ast.add(NodeKind::IfChain);
        b.ast.append_child(chain, if_node);
        b.ast.append_child(body, chain);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        assert!(out.contains("and.right.0:"), "{}", out);
        assert!(out.contains("if.then.0.0"), "{}", out);
        assert!(out.contains("if.end.0"), "{}", out);
        // No boolean value materializes: the condition is pure branches.
        assert!(out.matches("cjmp").count() >= 2, "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn while_loop_has_entry_body_exit_shape() {
        let mut b = Builder::new();
        let body = b.block(vec![]);
        let func = b.func(
            "f",
            vec![("n", int_ty())],
            Type::Primitive(PrimitiveType::Void),
            body,
        );

        let n = b.unit.function(func).params[0];
        let n_ident = b.param_ident(n, int_ty());
        let zero = b.expr(NodeKind::IntLiteral(0), int_ty());
        let cond = b.expr(NodeKind::Binary(BinaryOp::Gt), bool_ty());
        b.ast.append_child(cond, n_ident);
        b.ast.append_child(cond, zero);

        let loop_body = b.block(vec![]);
        let while_node = b.ast.add(NodeKind::While);
        b.ast.append_child(while_node, cond);
        b.ast.append_child(while_node, loop_body);
        b.ast.append_child(body, while_node);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        assert!(out.contains("while.entry.0"), "{}", out);
        assert!(out.contains("while.block.0"), "{}", out);
        assert!(out.contains("while.exit.0"), "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn union_switch_compares_tags_and_copies_payload() {
        let mut b = Builder::new();

        let union_id = b.unit.add_union(UnionSymbol {
            name: "Event".to_string(),
            cases: vec![
                UnionCase {
                    name: "Click".to_string(),
                    fields: vec![Field {
                        name: "value".to_string(),
                        ty: int_ty(),
                    }],
                },
                UnionCase {
                    name: "Scroll".to_string(),
                    fields: vec![Field {
                        name: "delta".to_string(),
                        ty: Type::Primitive(PrimitiveType::F32),
                    }],
                },
            ],
            methods: Vec::new(),
        });

        let body = b.block(vec![]);
        let func = b.func(
            "handle",
            vec![("e", Type::Union(union_id))],
            Type::Primitive(PrimitiveType::Void),
            body,
        );
        let e = b.unit.function(func).params[0];
        let e_ident = b.param_ident(e, Type::Union(union_id));

        let switch = b.ast.add(NodeKind::Switch);
        b.ast.append_child(switch, e_ident);

        for (index, case_name) in ["Click", "Scroll"].iter().enumerate() {
            let case_block = b.block(vec![]);
            let bound = b.local(
                case_block,
                "x",
                Type::UnionCase(union_id, index),
                None,
            );
            let bound_ident = b.local_ident(bound, Type::UnionCase(union_id, index));
            let type_node = b.expr(
                NodeKind::Identifier(case_name.to_string()),
                Type::UnionCase(union_id, index),
            );

            let case = b.ast.add(NodeKind::SwitchCase);
            b.ast.append_child(case, bound_ident);
            b.ast.append_child(case, type_node);
            b.ast.append_child(case, case_block);
            b.ast.append_child(switch, case);
        }

        b.ast.append_child(body, switch);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        // Tag and payload pointers come from the union layout.
        assert!(out.contains("memberptr @union.Event,"), "{}", out);
        assert!(out.contains(", eq, i32 0, switch.then.0.0"), "{}", out);
        assert!(out.contains(", eq, i32 1, switch.then.0.1"), "{}", out);
        // Each arm copies the payload into its binding before the body.
        assert!(out.matches("copy addr").count() == 2, "{}", out);
        assert!(out.contains("@union.Event.Click"), "{}", out);
        assert_valid(&module);

        // The textual form survives a round trip.
        let reparsed = crate::ssa::parser::parse_module(&out).unwrap();
        assert_eq!(write_module(&reparsed), out);
    }

    #[test]
    fn destructor_runs_flag_guarded_in_the_exit_block() {
        let mut b = Builder::new();

        let struct_id = b.unit.add_struct(StructSymbol {
            name: "Guard".to_string(),
            module: b.module,
            fields: vec![Field {
                name: "handle".to_string(),
                ty: int_ty(),
            }],
            methods: Vec::new(),
            assoc_funcs: Vec::new(),
            proto_impls: Vec::new(),
            generic_instance_of: None,
        });

        // Native destructor; the call site is what matters here.
        let self_param = b.unit.add_param(ParamSymbol {
            name: "self".to_string(),
            ty: Type::pointer(Type::Struct(struct_id)),
        });
        let deinit_func = b.unit.add_function(FunctionSymbol {
            name: "__deinit__".to_string(),
            module: b.module,
            params: vec![self_param],
            return_type: Type::Primitive(PrimitiveType::Void),
            modifiers: FunctionModifiers {
                native: true,
                method: true,
                ..Default::default()
            },
            link_name: None,
            enclosing: Some(SymbolRef::Struct(struct_id)),
            generic_instance_of: None,
            body: None,
        });
        b.unit.structs[struct_id.index()].methods.push(deinit_func);

        let body = b.block(vec![]);
        let func = b.func(
            "f",
            vec![("early", bool_ty())],
            Type::Primitive(PrimitiveType::Void),
            body,
        );

        let guard = b.local(body, "g", Type::Struct(struct_id), None);
        let descriptor = b.unit.add_deinit(DeinitDescriptor {
            location: Location {
                elements: vec![LocationElement {
                    kind: LocationElementKind::Local(guard),
                    ty: Type::Struct(struct_id),
                }],
            },
            unmanaged: false,
            has_deinit: true,
            children: Vec::new(),
        });
        b.unit.locals[guard.index()].deinit = Some(descriptor);
        let NodeKind::Block(info) = &mut b.ast.node_mut(body).kind else {
            unreachable!();
        };
        info.deinits.push(descriptor);

        let decl = b.ast.add(NodeKind::VarDecl(guard));
        b.ast.append_child(body, decl);

        // if early { return; }
        let early = b.unit.function(func).params[0];
        let early_ident = b.param_ident(early, bool_ty());
        let then_block = b.block(vec![]);
        let ret = b.ast.add(NodeKind::Return);
        b.ast.append_child(then_block, ret);
        let if_node = b.ast.add(NodeKind::If);
        b.ast.append_child(if_node, early_ident);
        b.ast.append_child(if_node, then_block);
        let chain = b.ast.add(NodeKind::IfChain);
        b.ast.append_child(chain, if_node);
        b.ast.append_child(body, chain);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        // The early return goes through the function's single exit block,
        // where the flag-guarded destructor call lives.
        assert!(out.contains("block.exit.0"), "{}", out);
        assert!(out.contains("deinit.do.0"), "{}", out);
        assert!(out.contains("deinit.skip.0"), "{}", out);
        assert!(out.contains("call void @__deinit__"), "{}", out);
        assert!(out.contains(", eq, i8 1, deinit.do.0, deinit.skip.0"), "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn use_after_move_is_diagnosed_and_aborts_the_function() {
        let mut b = Builder::new();

        let struct_id = b.unit.add_struct(StructSymbol {
            name: "Token".to_string(),
            module: b.module,
            fields: vec![Field {
                name: "id".to_string(),
                ty: int_ty(),
            }],
            methods: Vec::new(),
            assoc_funcs: Vec::new(),
            proto_impls: Vec::new(),
            generic_instance_of: None,
        });

        let body = b.block(vec![]);
        b.func("f", vec![], Type::Primitive(PrimitiveType::Void), body);

        let a = b.local(body, "a", Type::Struct(struct_id), None);
        let descriptor = b.unit.add_deinit(DeinitDescriptor {
            location: Location {
                elements: vec![LocationElement {
                    kind: LocationElementKind::Local(a),
                    ty: Type::Struct(struct_id),
                }],
            },
            unmanaged: false,
            has_deinit: true,
            children: Vec::new(),
        });
        b.unit.locals[a.index()].deinit = Some(descriptor);

        let first = b.local(body, "first", Type::Struct(struct_id), None);
        let second = b.local(body, "second", Type::Struct(struct_id), None);

        for target in [first, second] {
            let source = b.local_ident(a, Type::Struct(struct_id));
            b.ast.node_mut(source).expr.moves = Some(MoveInfo { deinit: descriptor });

            let decl = b.ast.add(NodeKind::VarDecl(target));
            b.ast.append_child(decl, source);
            b.ast.append_child(body, decl);
        }

        let (module, diags) = b.lower();
        assert!(diags.has_errors());
        let moved = diags
            .diagnostics()
            .iter()
            .find(|diagnostic| diagnostic.message.contains("moved"))
            .expect("missing use-after-move diagnostic");
        assert!(!moved.notes.is_empty());
        // Lowering of the offending function aborted.
        assert!(module.functions.is_empty());
    }

    #[test]
    fn protocol_calls_dispatch_through_the_vtable() {
        let mut b = Builder::new();

        let proto = b.unit.add_protocol(crate::symbols::ProtocolSymbol {
            name: "Pingable".to_string(),
            methods: vec![crate::symbols::ProtoMethod {
                name: "ping".to_string(),
                params: vec![],
                ret: Type::Primitive(PrimitiveType::Void),
            }],
        });

        // A struct implementing the protocol; its resolved vtable symbol is
        // what the coercion and the dispatch share.
        let struct_id = b.unit.add_struct(StructSymbol {
            name: "Radar".to_string(),
            module: b.module,
            fields: vec![Field {
                name: "id".to_string(),
                ty: int_ty(),
            }],
            methods: Vec::new(),
            assoc_funcs: Vec::new(),
            proto_impls: vec![crate::symbols::ProtoImpl {
                proto,
                vtable_global: "vtable.Radar.Pingable".to_string(),
            }],
            generic_instance_of: None,
        });

        let self_param = b.unit.add_param(ParamSymbol {
            name: "self".to_string(),
            ty: Type::pointer(Type::Struct(struct_id)),
        });
        let ping = b.unit.add_function(FunctionSymbol {
            name: "ping".to_string(),
            module: b.module,
            params: vec![self_param],
            return_type: Type::Primitive(PrimitiveType::Void),
            modifiers: FunctionModifiers {
                native: true,
                method: true,
                ..Default::default()
            },
            link_name: None,
            enclosing: Some(SymbolRef::Struct(struct_id)),
            generic_instance_of: None,
            body: None,
        });
        b.unit.structs[struct_id.index()].methods.push(ping);

        // fn poll(p: Pingable) { p.ping(); }
        let body = b.block(vec![]);
        let func = b.func(
            "poll",
            vec![("p", Type::Proto(proto))],
            Type::Primitive(PrimitiveType::Void),
            body,
        );
        let p = b.unit.function(func).params[0];

        let method_ty = Type::function(vec![], Type::Primitive(PrimitiveType::Void));
        let callee = b.expr(NodeKind::Dot, method_ty.clone());
        b.ast.node_mut(callee).expr.location = Some(Location {
            elements: vec![
                LocationElement {
                    kind: LocationElementKind::Param(p),
                    ty: Type::Proto(proto),
                },
                LocationElement {
                    kind: LocationElementKind::ProtoMethod(0),
                    ty: method_ty,
                },
            ],
        });

        let call = b.ast.add(NodeKind::Call);
        b.ast.append_child(call, callee);
        b.ast.append_child(body, call);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        let out = write_module(&module);
        // The vtable global points at the implementation.
        assert!(out.contains("global @vtable.Radar.Pingable addr = addr @ping"), "{}", out);
        // Dispatch unpacks the fat pointer and indexes the vtable.
        assert!(out.contains("memberptr @proto.Pingable,"), "{}", out);
        assert!(out.contains("memberptr @vtable.Pingable,"), "{}", out);
        // The callee is a loaded function pointer, not a symbol.
        assert!(out.contains("call void %"), "{}", out);
        assert_valid(&module);
    }

    #[test]
    fn closure_captures_through_a_heap_context() {
        let mut b = Builder::new();

        // Enclosing function with a local the closure reads.
        let body = b.block(vec![]);
        b.func("f", vec![], Type::Primitive(PrimitiveType::Void), body);

        let x = b.local(body, "x", int_ty(), None);
        let x_init = b.expr(NodeKind::IntLiteral(5), int_ty());
        let x_decl = b.ast.add(NodeKind::VarDecl(x));
        b.ast.append_child(x_decl, x_init);
        b.ast.append_child(body, x_decl);

        // The lifted function: its body reads `x` from the outer scope.
        let closure_body = b.block(vec![]);
        let lifted = b.func(
            "lambda",
            vec![],
            Type::Primitive(PrimitiveType::Void),
            closure_body,
        );

        let y = b.local(closure_body, "y", int_ty(), None);
        let x_read = b.local_ident(x, int_ty());
        let y_decl = b.ast.add(NodeKind::VarDecl(y));
        b.ast.append_child(y_decl, x_read);
        b.ast.append_child(closure_body, y_decl);

        let closure_ty = Type::closure(vec![], Type::Primitive(PrimitiveType::Void));
        let closure_node = b.expr(NodeKind::Closure(lifted), closure_ty.clone());
        b.ast.append_child(closure_node, closure_body);

        let holder = b.local(body, "cb", closure_ty, None);
        let decl = b.ast.add(NodeKind::VarDecl(holder));
        b.ast.append_child(decl, closure_node);
        b.ast.append_child(body, decl);

        let (module, diags) = b.lower();
        assert!(!diags.has_errors());

        // The lifted function exists under its generated name and reads the
        // capture through the context struct.
        assert!(module.function("main.f.$0").is_some());
        let out = write_module(&module);
        assert!(out.contains("struct @closure.struct.main.f.$0"), "{}", out);
        assert!(out.contains("call addr @malloc, i64 4"), "{}", out);
        assert!(out.contains("memberptr @closure.struct.main.f.$0"), "{}", out);
        assert_valid(&module);
    }
}
