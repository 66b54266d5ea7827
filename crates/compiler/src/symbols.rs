//! Declared entities and symbol tables.
//!
//! Every long-lived declaration (functions, variables, structures, unions,
//! enums, protocols, generics) lives in the per-compilation [`Unit`] arena
//! and is referred to by id. The cyclic shape of the symbol graph (methods
//! point at their struct, the struct's method table points back) is broken
//! by ids: the struct owns the method list, methods carry the struct's id.

use std::collections::HashMap;

use crate::ast::NodeId;
use crate::types::{FunctionType, Type};

macro_rules! arena_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(ModuleId);
arena_id!(FuncId);
arena_id!(StructId);
arena_id!(EnumId);
arena_id!(UnionId);
arena_id!(ProtoId);
arena_id!(GlobalId);
arena_id!(ConstId);
arena_id!(LocalId);
arena_id!(ParamId);
arena_id!(GenericFuncId);
arena_id!(GenericStructId);
arena_id!(UseId);
arena_id!(TableId);
arena_id!(DeinitId);

/// Tagged reference to any declared entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    Module(ModuleId),
    Func(FuncId),
    Local(LocalId),
    Param(ParamId),
    Global(GlobalId),
    Const(ConstId),
    Struct(StructId),
    Enum(EnumId),
    EnumVariant(EnumId, usize),
    Union(UnionId),
    UnionCase(UnionId, usize),
    Proto(ProtoId),
    GenericFunc(GenericFuncId),
    GenericStruct(GenericStructId),
    Use(UseId),
}

impl SymbolRef {
    /// Discriminant used by the duplicate-declaration check: two symbols
    /// clash when they share a name and a kind.
    fn kind_tag(&self) -> u8 {
        match self {
            SymbolRef::Module(_) => 0,
            SymbolRef::Func(_) => 1,
            SymbolRef::Local(_) => 2,
            SymbolRef::Param(_) => 3,
            SymbolRef::Global(_) => 4,
            SymbolRef::Const(_) => 5,
            SymbolRef::Struct(_) => 6,
            SymbolRef::Enum(_) => 7,
            SymbolRef::EnumVariant(..) => 8,
            SymbolRef::Union(_) => 9,
            SymbolRef::UnionCase(..) => 10,
            SymbolRef::Proto(_) => 11,
            SymbolRef::GenericFunc(_) => 12,
            SymbolRef::GenericStruct(_) => 13,
            SymbolRef::Use(_) => 14,
        }
    }
}

/// Value of a symbol-table entry: one symbol, or an overload group of
/// functions sharing a name.
#[derive(Debug, Clone)]
pub enum Entry {
    Single(SymbolRef),
    Group(Vec<SymbolRef>),
}

#[derive(Debug)]
pub struct DuplicateSymbol {
    pub name: String,
}

pub struct SymbolTable {
    pub parent: Option<TableId>,
    symbols: HashMap<String, Entry>,
    /// Declaration-ordered views used by block lowering.
    pub locals: Vec<LocalId>,
    pub params: Vec<ParamId>,
}

impl SymbolTable {
    pub fn new(parent: Option<TableId>) -> SymbolTable {
        SymbolTable {
            parent,
            symbols: HashMap::new(),
            locals: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn insert(&mut self, name: &str, symbol: SymbolRef) -> Result<(), DuplicateSymbol> {
        match self.symbols.get(name) {
            Some(Entry::Single(existing)) if existing.kind_tag() == symbol.kind_tag() => {
                Err(DuplicateSymbol {
                    name: name.to_string(),
                })
            }
            _ => {
                self.symbols.insert(name.to_string(), Entry::Single(symbol));
                Ok(())
            }
        }
    }

    /// Inserts a function, growing an overload group if the name is taken by
    /// other functions.
    pub fn insert_function(&mut self, name: &str, func: FuncId) {
        match self.symbols.get_mut(name) {
            Some(Entry::Group(group)) => group.push(SymbolRef::Func(func)),
            Some(entry) => {
                if let Entry::Single(existing @ SymbolRef::Func(_)) = entry {
                    let first = *existing;
                    *entry = Entry::Group(vec![first, SymbolRef::Func(func)]);
                } else {
                    *entry = Entry::Single(SymbolRef::Func(func));
                }
            }
            None => {
                self.symbols
                    .insert(name.to_string(), Entry::Single(SymbolRef::Func(func)));
            }
        }
    }

    pub fn lookup_local(&self, name: &str) -> Option<&Entry> {
        self.symbols.get(name)
    }
}

pub struct ModuleDecl {
    pub path: Vec<String>,
    pub table: TableId,
}

impl ModuleDecl {
    pub fn path_string(&self) -> String {
        self.path.join(".")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunctionModifiers {
    pub native: bool,
    pub exposed: bool,
    pub dllexport: bool,
    pub method: bool,
    pub test: bool,
}

pub struct FunctionSymbol {
    pub name: String,
    pub module: ModuleId,
    pub params: Vec<ParamId>,
    pub return_type: Type,
    pub modifiers: FunctionModifiers,
    pub link_name: Option<String>,
    /// Enclosing struct or union for methods and associated functions.
    pub enclosing: Option<SymbolRef>,
    /// Back-reference into the generic entity's instance list, resolved by
    /// index rather than aliasing.
    pub generic_instance_of: Option<(GenericFuncId, usize)>,
    /// Body block; `None` for native declarations.
    pub body: Option<NodeId>,
}

impl FunctionSymbol {
    pub fn function_type(&self, unit: &Unit) -> FunctionType {
        FunctionType {
            params: self
                .params
                .iter()
                .map(|&param| unit.param(param).ty.clone())
                .collect(),
            ret: Box::new(self.return_type.clone()),
        }
    }
}

pub struct ParamSymbol {
    pub name: String,
    pub ty: Type,
}

pub struct LocalSymbol {
    pub name: String,
    pub ty: Type,
    /// Destruction bookkeeping for values with (or containing) a
    /// user-defined destructor.
    pub deinit: Option<DeinitId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i128),
    Float(f64),
    Str(Vec<u8>),
}

pub struct GlobalSymbol {
    pub name: String,
    pub module: ModuleId,
    pub ty: Type,
    pub initial: Option<ConstValue>,
    pub native: bool,
    pub exposed: bool,
    pub link_name: Option<String>,
}

pub struct ConstSymbol {
    pub name: String,
    pub ty: Type,
    pub value: ConstValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ty: Type,
}

pub struct ProtoImpl {
    pub proto: ProtoId,
    /// Module-level global holding the resolved vtable for this pairing.
    pub vtable_global: String,
}

pub struct StructSymbol {
    pub name: String,
    pub module: ModuleId,
    pub fields: Vec<Field>,
    /// Instance methods, in declaration order.
    pub methods: Vec<FuncId>,
    /// Associated (static) functions such as constructors.
    pub assoc_funcs: Vec<FuncId>,
    pub proto_impls: Vec<ProtoImpl>,
    pub generic_instance_of: Option<(GenericStructId, usize)>,
}

impl StructSymbol {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct EnumVariant {
    pub name: String,
    pub value: i128,
}

pub struct EnumSymbol {
    pub name: String,
    pub variants: Vec<EnumVariant>,
}

#[derive(Debug, Clone)]
pub struct UnionCase {
    pub name: String,
    pub fields: Vec<Field>,
}

impl UnionCase {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

pub struct UnionSymbol {
    pub name: String,
    pub cases: Vec<UnionCase>,
    pub methods: Vec<FuncId>,
}

#[derive(Debug, Clone)]
pub struct ProtoMethod {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
}

pub struct ProtocolSymbol {
    pub name: String,
    /// Position is the vtable slot index.
    pub methods: Vec<ProtoMethod>,
}

impl ProtocolSymbol {
    pub fn method_index(&self, name: &str) -> Option<usize> {
        self.methods.iter().position(|method| method.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericParamKind {
    /// A single type parameter.
    Type,
    /// A trailing parameter sequence; arguments beyond the fixed ones are
    /// collected into a tuple.
    Sequence,
}

#[derive(Debug, Clone)]
pub struct GenericParam {
    pub name: String,
    pub kind: GenericParamKind,
}

pub struct GenericInstance<Id> {
    pub args: Vec<Type>,
    pub entity: Id,
}

pub struct GenericFuncSymbol {
    pub name: String,
    pub module: ModuleId,
    pub params: Vec<GenericParam>,
    pub node: NodeId,
    pub instances: Vec<GenericInstance<FuncId>>,
}

pub struct GenericStructSymbol {
    pub name: String,
    pub module: ModuleId,
    pub params: Vec<GenericParam>,
    pub node: NodeId,
    /// Field layout with `Generic(i)` placeholders; instantiation
    /// substitutes the arguments into a concrete struct.
    pub fields: Vec<Field>,
    pub instances: Vec<GenericInstance<StructId>>,
}

/// Import forwarder; resolving it yields the target, walking through chains
/// of other `use` symbols.
pub struct UseSymbol {
    pub name: String,
    pub target: Option<SymbolRef>,
}

/// A compile-time path identifying an addressable value: a root (variable,
/// constant, function, enum variant, ...) followed by field, index and
/// method navigations. Built by name resolution, consumed by the lowering's
/// location builder.
#[derive(Debug, Clone)]
pub struct Location {
    pub elements: Vec<LocationElement>,
}

impl Location {
    pub fn root(&self) -> &LocationElement {
        &self.elements[0]
    }

    pub fn last(&self) -> &LocationElement {
        self.elements.last().expect("empty location")
    }

    /// The type of the value the whole path denotes.
    pub fn ty(&self) -> &Type {
        &self.last().ty
    }
}

#[derive(Debug, Clone)]
pub struct LocationElement {
    pub kind: LocationElementKind,
    /// Type of the value reached after this element.
    pub ty: Type,
}

#[derive(Debug, Clone, Copy)]
pub enum LocationElementKind {
    Local(LocalId),
    Param(ParamId),
    Global(GlobalId),
    Const(ConstId),
    Func(FuncId),
    EnumVariant(EnumId, usize),
    UnionCase(UnionId, usize),
    SelfValue,
    /// Arbitrary expression producing an addressable value.
    Expr(NodeId),
    /// Struct field access by index; through a pointer base the builder
    /// loads the pointer first.
    Field(usize),
    UnionCaseField(usize),
    TupleIndex(usize),
    /// Instance method on the preceding value.
    Method(FuncId),
    /// Protocol method by vtable slot on a fat-pointer value.
    ProtoMethod(usize),
}

/// A node of the destructor bookkeeping tree. Mirrors the field layout of a
/// destructible value; `flag` slots are assigned during lowering.
pub struct DeinitDescriptor {
    pub location: Location,
    pub unmanaged: bool,
    pub has_deinit: bool,
    pub children: Vec<DeinitId>,
}

/// Per-compilation arena owning every declared entity.
#[derive(Default)]
pub struct Unit {
    pub modules: Vec<ModuleDecl>,
    pub functions: Vec<FunctionSymbol>,
    pub structs: Vec<StructSymbol>,
    pub enums: Vec<EnumSymbol>,
    pub unions: Vec<UnionSymbol>,
    pub protocols: Vec<ProtocolSymbol>,
    pub globals: Vec<GlobalSymbol>,
    pub constants: Vec<ConstSymbol>,
    pub locals: Vec<LocalSymbol>,
    pub params: Vec<ParamSymbol>,
    pub generic_funcs: Vec<GenericFuncSymbol>,
    pub generic_structs: Vec<GenericStructSymbol>,
    pub uses: Vec<UseSymbol>,
    pub tables: Vec<SymbolTable>,
    pub deinits: Vec<DeinitDescriptor>,
}

impl Unit {
    pub fn new() -> Unit {
        Unit::default()
    }

    pub fn add_table(&mut self, table: SymbolTable) -> TableId {
        self.tables.push(table);
        TableId((self.tables.len() - 1) as u32)
    }

    pub fn table(&self, id: TableId) -> &SymbolTable {
        &self.tables[id.index()]
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut SymbolTable {
        &mut self.tables[id.index()]
    }

    /// Local-first lookup walking the parent chain.
    pub fn lookup(&self, table: TableId, name: &str) -> Option<&Entry> {
        let mut cur = Some(table);

        while let Some(id) = cur {
            let table = self.table(id);
            if let Some(entry) = table.lookup_local(name) {
                return Some(entry);
            }
            cur = table.parent;
        }

        None
    }

    pub fn add_module(&mut self, module: ModuleDecl) -> ModuleId {
        self.modules.push(module);
        ModuleId((self.modules.len() - 1) as u32)
    }

    pub fn add_function(&mut self, func: FunctionSymbol) -> FuncId {
        self.functions.push(func);
        FuncId((self.functions.len() - 1) as u32)
    }

    pub fn add_struct(&mut self, symbol: StructSymbol) -> StructId {
        self.structs.push(symbol);
        StructId((self.structs.len() - 1) as u32)
    }

    pub fn add_enum(&mut self, symbol: EnumSymbol) -> EnumId {
        self.enums.push(symbol);
        EnumId((self.enums.len() - 1) as u32)
    }

    pub fn add_union(&mut self, symbol: UnionSymbol) -> UnionId {
        self.unions.push(symbol);
        UnionId((self.unions.len() - 1) as u32)
    }

    pub fn add_protocol(&mut self, symbol: ProtocolSymbol) -> ProtoId {
        self.protocols.push(symbol);
        ProtoId((self.protocols.len() - 1) as u32)
    }

    pub fn add_global(&mut self, symbol: GlobalSymbol) -> GlobalId {
        self.globals.push(symbol);
        GlobalId((self.globals.len() - 1) as u32)
    }

    pub fn add_constant(&mut self, symbol: ConstSymbol) -> ConstId {
        self.constants.push(symbol);
        ConstId((self.constants.len() - 1) as u32)
    }

    pub fn add_local(&mut self, symbol: LocalSymbol) -> LocalId {
        self.locals.push(symbol);
        LocalId((self.locals.len() - 1) as u32)
    }

    pub fn add_param(&mut self, symbol: ParamSymbol) -> ParamId {
        self.params.push(symbol);
        ParamId((self.params.len() - 1) as u32)
    }

    pub fn add_generic_func(&mut self, symbol: GenericFuncSymbol) -> GenericFuncId {
        self.generic_funcs.push(symbol);
        GenericFuncId((self.generic_funcs.len() - 1) as u32)
    }

    pub fn add_generic_struct(&mut self, symbol: GenericStructSymbol) -> GenericStructId {
        self.generic_structs.push(symbol);
        GenericStructId((self.generic_structs.len() - 1) as u32)
    }

    pub fn add_use(&mut self, symbol: UseSymbol) -> UseId {
        self.uses.push(symbol);
        UseId((self.uses.len() - 1) as u32)
    }

    pub fn add_deinit(&mut self, descriptor: DeinitDescriptor) -> DeinitId {
        self.deinits.push(descriptor);
        DeinitId((self.deinits.len() - 1) as u32)
    }

    pub fn module(&self, id: ModuleId) -> &ModuleDecl {
        &self.modules[id.index()]
    }

    pub fn function(&self, id: FuncId) -> &FunctionSymbol {
        &self.functions[id.index()]
    }

    pub fn structure(&self, id: StructId) -> &StructSymbol {
        &self.structs[id.index()]
    }

    pub fn enumeration(&self, id: EnumId) -> &EnumSymbol {
        &self.enums[id.index()]
    }

    pub fn union(&self, id: UnionId) -> &UnionSymbol {
        &self.unions[id.index()]
    }

    pub fn protocol(&self, id: ProtoId) -> &ProtocolSymbol {
        &self.protocols[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalSymbol {
        &self.globals[id.index()]
    }

    pub fn constant(&self, id: ConstId) -> &ConstSymbol {
        &self.constants[id.index()]
    }

    pub fn local(&self, id: LocalId) -> &LocalSymbol {
        &self.locals[id.index()]
    }

    pub fn param(&self, id: ParamId) -> &ParamSymbol {
        &self.params[id.index()]
    }

    pub fn generic_func(&self, id: GenericFuncId) -> &GenericFuncSymbol {
        &self.generic_funcs[id.index()]
    }

    pub fn generic_struct(&self, id: GenericStructId) -> &GenericStructSymbol {
        &self.generic_structs[id.index()]
    }

    pub fn use_symbol(&self, id: UseId) -> &UseSymbol {
        &self.uses[id.index()]
    }

    pub fn deinit(&self, id: DeinitId) -> &DeinitDescriptor {
        &self.deinits[id.index()]
    }

    /// Finds an instance method on a struct or union type.
    pub fn method_of(&self, ty: &Type, name: &str) -> Option<FuncId> {
        let methods = match ty {
            Type::Struct(id) => &self.structure(*id).methods,
            Type::Union(id) => &self.union(*id).methods,
            Type::UnionCase(id, _) => &self.union(*id).methods,
            _ => return None,
        };

        methods
            .iter()
            .copied()
            .find(|&func| self.function(func).name == name)
    }

    /// Finds an associated (static) function on a struct.
    pub fn assoc_of(&self, struct_id: StructId, name: &str) -> Option<FuncId> {
        self.structure(struct_id)
            .assoc_funcs
            .iter()
            .copied()
            .find(|&func| self.function(func).name == name)
    }

    pub fn assoc_with_params(
        &self,
        struct_id: StructId,
        name: &str,
        params: &[Type],
    ) -> Option<FuncId> {
        self.structure(struct_id)
            .assoc_funcs
            .iter()
            .copied()
            .find(|&func| {
                let symbol = self.function(func);
                symbol.name == name
                    && Type::equal_lists(&symbol.function_type(self).params, params)
            })
    }

    /// Detection of the standard library wrapper structs the lowering gives
    /// special treatment to (`Optional`, `Result`, `String`).
    pub fn is_std_struct(&self, ty: &Type, name: &str) -> bool {
        match ty {
            Type::Struct(id) => {
                let symbol = self.structure(*id);
                let base = symbol
                    .generic_instance_of
                    .map(|(generic, _)| self.generic_struct(generic).name.as_str())
                    .unwrap_or(symbol.name.as_str());
                base == name
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    #[test]
    fn lookup_walks_parent_chain() {
        let mut unit = Unit::new();
        let root = unit.add_table(SymbolTable::new(None));
        let child = unit.add_table(SymbolTable::new(Some(root)));

        let local = unit.add_local(LocalSymbol {
            name: "x".to_string(),
            ty: Type::Primitive(PrimitiveType::I32),
            deinit: None,
        });
        unit.table_mut(root)
            .insert("x", SymbolRef::Local(local))
            .unwrap();

        let entry = unit.lookup(child, "x").unwrap();
        assert!(matches!(entry, Entry::Single(SymbolRef::Local(id)) if *id == local));
        assert!(unit.lookup(child, "y").is_none());
    }

    #[test]
    fn local_shadows_parent() {
        let mut unit = Unit::new();
        let root = unit.add_table(SymbolTable::new(None));
        let child = unit.add_table(SymbolTable::new(Some(root)));

        let outer = unit.add_local(LocalSymbol {
            name: "x".to_string(),
            ty: Type::Primitive(PrimitiveType::I32),
            deinit: None,
        });
        let inner = unit.add_local(LocalSymbol {
            name: "x".to_string(),
            ty: Type::Primitive(PrimitiveType::I64),
            deinit: None,
        });

        unit.table_mut(root).insert("x", SymbolRef::Local(outer)).unwrap();
        unit.table_mut(child).insert("x", SymbolRef::Local(inner)).unwrap();

        let entry = unit.lookup(child, "x").unwrap();
        assert!(matches!(entry, Entry::Single(SymbolRef::Local(id)) if *id == inner));
    }

    #[test]
    fn duplicate_same_kind_fails() {
        let mut unit = Unit::new();
        let table = unit.add_table(SymbolTable::new(None));

        let a = unit.add_local(LocalSymbol {
            name: "x".to_string(),
            ty: Type::Primitive(PrimitiveType::I32),
            deinit: None,
        });
        let b = unit.add_local(LocalSymbol {
            name: "x".to_string(),
            ty: Type::Primitive(PrimitiveType::I32),
            deinit: None,
        });

        unit.table_mut(table).insert("x", SymbolRef::Local(a)).unwrap();
        assert!(unit.table_mut(table).insert("x", SymbolRef::Local(b)).is_err());
    }

    #[test]
    fn functions_with_shared_name_form_a_group() {
        let mut unit = Unit::new();
        let module = unit.add_module(ModuleDecl {
            path: vec!["main".to_string()],
            table: TableId(0),
        });
        let table = unit.add_table(SymbolTable::new(None));

        let make_func = |unit: &mut Unit, ty| {
            let param = unit.add_param(ParamSymbol {
                name: "v".to_string(),
                ty,
            });
            unit.add_function(FunctionSymbol {
                name: "print".to_string(),
                module,
                params: vec![param],
                return_type: Type::Primitive(PrimitiveType::Void),
                modifiers: FunctionModifiers::default(),
                link_name: None,
                enclosing: None,
                generic_instance_of: None,
                body: None,
            })
        };

        let a = make_func(&mut unit, Type::Primitive(PrimitiveType::I32));
        let b = make_func(&mut unit, Type::Primitive(PrimitiveType::F64));

        unit.table_mut(table).insert_function("print", a);
        unit.table_mut(table).insert_function("print", b);

        match unit.lookup(table, "print").unwrap() {
            Entry::Group(group) => assert_eq!(group.len(), 2),
            Entry::Single(_) => panic!("expected overload group"),
        }
    }
}
