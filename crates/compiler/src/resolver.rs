//! Symbol reference resolution: import forwarding, overload selection and
//! generic instantiation.
//!
//! Name binding itself happens in the front-end; what remains here is the
//! machinery later stages lean on: `use` symbols forward to their targets
//! (chains are walked, cycles diagnosed), call sites pick one function out
//! of an overload group by positional argument types, and generic entities
//! cache their instances keyed by structural argument equality.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;

use crate::ast::Ast;
use crate::symbols::{
    Entry, FuncId, GenericFuncId, GenericParamKind, GenericInstance, SymbolRef, Unit, UseId,
};
use crate::types::Type;

#[derive(Debug)]
pub enum ResolveError {
    /// A `use` chain loops back on itself.
    UseCycle { name: String },
    /// A `use` symbol was never bound to a target.
    UnresolvedUse { name: String },
    /// No overload of the group matches the argument types.
    NoMatchingOverload {
        name: String,
        candidates: Vec<FuncId>,
    },
    /// Two structurally equal signatures in one group. The front-end must
    /// not produce this; surfaced as an internal error.
    AmbiguousOverload { name: String },
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UseCycle { name } => {
                write!(f, "cyclic `use` definition involving `{}`", name)
            }
            ResolveError::UnresolvedUse { name } => {
                write!(f, "`use {}` has no resolved target", name)
            }
            ResolveError::NoMatchingOverload { name, candidates } => {
                write!(
                    f,
                    "no overload of `{}` matches the call ({} candidates)",
                    name,
                    candidates.len()
                )
            }
            ResolveError::AmbiguousOverload { name } => {
                write!(f, "internal error: duplicate signatures for `{}`", name)
            }
        }
    }
}

impl Error for ResolveError {}

/// Follows `use` forwarders until a concrete symbol is reached. Each `use`
/// may be visited once per resolution; revisiting one means the imports form
/// a cycle.
pub fn resolve_symbol(unit: &Unit, symbol: SymbolRef) -> Result<SymbolRef, ResolveError> {
    let mut visited: HashSet<UseId> = HashSet::new();
    let mut cur = symbol;

    while let SymbolRef::Use(id) = cur {
        if !visited.insert(id) {
            return Err(ResolveError::UseCycle {
                name: unit.use_symbol(id).name.clone(),
            });
        }

        cur = unit
            .use_symbol(id)
            .target
            .ok_or_else(|| ResolveError::UnresolvedUse {
                name: unit.use_symbol(id).name.clone(),
            })?;
    }

    Ok(cur)
}

/// Selects the function in `entry` whose parameter types match `args`
/// positionally. For methods the leading `self` parameter is skipped before
/// matching.
pub fn resolve_overload(
    unit: &Unit,
    name: &str,
    entry: &Entry,
    args: &[Type],
) -> Result<FuncId, ResolveError> {
    let group: Vec<FuncId> = match entry {
        Entry::Single(SymbolRef::Func(func)) => vec![*func],
        Entry::Single(_) => {
            return Err(ResolveError::NoMatchingOverload {
                name: name.to_string(),
                candidates: Vec::new(),
            });
        }
        Entry::Group(symbols) => symbols
            .iter()
            .filter_map(|symbol| match symbol {
                SymbolRef::Func(func) => Some(*func),
                _ => None,
            })
            .collect(),
    };

    let mut matches = group.iter().copied().filter(|&func| {
        let symbol = unit.function(func);
        let mut params = symbol.function_type(unit).params;
        if symbol.modifiers.method && !params.is_empty() {
            params.remove(0);
        }
        Type::equal_lists(&params, args)
    });

    let Some(selected) = matches.next() else {
        return Err(ResolveError::NoMatchingOverload {
            name: name.to_string(),
            candidates: group,
        });
    };

    if matches.next().is_some() {
        return Err(ResolveError::AmbiguousOverload {
            name: name.to_string(),
        });
    }

    Ok(selected)
}

/// Collects generic arguments against the entity's parameter list. A
/// trailing parameter sequence swallows the remaining arguments into one
/// tuple type.
pub fn collect_generic_args(
    params: &[crate::symbols::GenericParam],
    args: Vec<Type>,
) -> Vec<Type> {
    let Some(last) = params.last() else {
        return args;
    };

    if last.kind != GenericParamKind::Sequence {
        return args;
    }

    let fixed = params.len() - 1;
    let mut collected: Vec<Type> = args.iter().take(fixed).cloned().collect();
    collected.push(Type::Tuple(args.into_iter().skip(fixed).collect()));
    collected
}

/// Returns the cached instance for `args`, or clones the generic function's
/// AST subtree with the arguments substituted and records a new one.
///
/// The front-end re-runs its name and type stages over fresh clones before
/// lowering sees them; this function leaves a hook for that by returning
/// whether the instance was newly created.
pub fn instantiate_generic_func(
    unit: &mut Unit,
    ast: &mut Ast,
    generic: GenericFuncId,
    args: Vec<Type>,
) -> (FuncId, bool) {
    let args = collect_generic_args(&unit.generic_func(generic).params.clone(), args);

    if let Some(instance) = unit
        .generic_func(generic)
        .instances
        .iter()
        .find(|instance| Type::equal_lists(&instance.args, &args))
    {
        return (instance.entity, false);
    }

    let node = unit.generic_func(generic).node;
    let clone = ast.clone_subtree(node, &args);

    let (name, module) = {
        let symbol = unit.generic_func(generic);
        (symbol.name.clone(), symbol.module)
    };
    let instance_index = unit.generic_func(generic).instances.len();

    // The cloned subtree is a plain function definition. Its specialized
    // symbol starts out skeletal; the front-end's re-analysis hook fills in
    // parameters and the return type before the function is lowered.
    let func = unit.add_function(crate::symbols::FunctionSymbol {
        name: name.clone(),
        module,
        params: Vec::new(),
        return_type: Type::Primitive(crate::types::PrimitiveType::Void),
        modifiers: Default::default(),
        link_name: Some(format!("{}${}", name, instance_index)),
        enclosing: None,
        generic_instance_of: Some((generic, instance_index)),
        body: Some(clone),
    });

    if let crate::ast::NodeKind::FunctionDef(ref mut id) = ast.node_mut(clone).kind {
        *id = func;
    }

    unit.generic_funcs[generic.index()]
        .instances
        .push(GenericInstance { args, entity: func });

    (func, true)
}

/// Struct counterpart of [`instantiate_generic_func`]: the cache is keyed
/// by structural argument equality; a miss clones the declaration subtree,
/// substitutes the field template and registers the specialized structure
/// as `Name<index>`.
pub fn instantiate_generic_struct(
    unit: &mut Unit,
    ast: &mut Ast,
    generic: crate::symbols::GenericStructId,
    args: Vec<Type>,
) -> (crate::symbols::StructId, bool) {
    let args = {
        let params = unit.generic_struct(generic).params.clone();
        collect_generic_args(&params, args)
    };

    if let Some(instance) = unit
        .generic_struct(generic)
        .instances
        .iter()
        .find(|instance| Type::equal_lists(&instance.args, &args))
    {
        return (instance.entity, false);
    }

    let node = unit.generic_struct(generic).node;
    let _clone = ast.clone_subtree(node, &args);

    let (name, module, fields) = {
        let symbol = unit.generic_struct(generic);
        (symbol.name.clone(), symbol.module, symbol.fields.clone())
    };
    let instance_index = unit.generic_struct(generic).instances.len();

    let fields = fields
        .into_iter()
        .map(|field| crate::symbols::Field {
            name: field.name,
            ty: field.ty.substitute(&args),
        })
        .collect();

    let entity = unit.add_struct(crate::symbols::StructSymbol {
        name: format!("{}{}", name, instance_index),
        module,
        fields,
        methods: Vec::new(),
        assoc_funcs: Vec::new(),
        proto_impls: Vec::new(),
        generic_instance_of: Some((generic, instance_index)),
    });

    unit.generic_structs[generic.index()]
        .instances
        .push(GenericInstance { args, entity });

    (entity, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;
    use crate::symbols::{
        FunctionModifiers, FunctionSymbol, GenericFuncSymbol, GenericParam, ModuleDecl,
        ParamSymbol, SymbolTable, UseSymbol,
    };
    use crate::types::PrimitiveType;

    fn unit_with_module() -> (Unit, crate::symbols::ModuleId) {
        let mut unit = Unit::new();
        let table = unit.add_table(SymbolTable::new(None));
        let module = unit.add_module(ModuleDecl {
            path: vec!["main".to_string()],
            table,
        });
        (unit, module)
    }

    fn add_func(unit: &mut Unit, module: crate::symbols::ModuleId, name: &str, params: &[Type]) -> FuncId {
        let params = params
            .iter()
            .map(|ty| {
                unit.add_param(ParamSymbol {
                    name: "p".to_string(),
                    ty: ty.clone(),
                })
            })
            .collect();

        unit.add_function(FunctionSymbol {
            name: name.to_string(),
            module,
            params,
            return_type: Type::Primitive(PrimitiveType::Void),
            modifiers: FunctionModifiers::default(),
            link_name: None,
            enclosing: None,
            generic_instance_of: None,
            body: None,
        })
    }

    #[test]
    fn use_chains_forward_to_target() {
        let (mut unit, module) = unit_with_module();
        let func = add_func(&mut unit, module, "f", &[]);

        let inner = unit.add_use(UseSymbol {
            name: "inner".to_string(),
            target: Some(SymbolRef::Func(func)),
        });
        let outer = unit.add_use(UseSymbol {
            name: "outer".to_string(),
            target: Some(SymbolRef::Use(inner)),
        });

        let resolved = resolve_symbol(&unit, SymbolRef::Use(outer)).unwrap();
        assert_eq!(resolved, SymbolRef::Func(func));
    }

    #[test]
    fn use_cycles_are_diagnosed() {
        let (mut unit, _) = unit_with_module();

        let a = unit.add_use(UseSymbol {
            name: "a".to_string(),
            target: None,
        });
        let b = unit.add_use(UseSymbol {
            name: "b".to_string(),
            target: Some(SymbolRef::Use(a)),
        });
        unit.uses[a.index()].target = Some(SymbolRef::Use(b));

        let err = resolve_symbol(&unit, SymbolRef::Use(a)).unwrap_err();
        assert!(matches!(err, ResolveError::UseCycle { .. }));
    }

    #[test]
    fn overload_selection_by_argument_types() {
        let (mut unit, module) = unit_with_module();
        let int_func = add_func(&mut unit, module, "print", &[Type::Primitive(PrimitiveType::I32)]);
        let float_func = add_func(&mut unit, module, "print", &[Type::Primitive(PrimitiveType::F64)]);

        let entry = Entry::Group(vec![SymbolRef::Func(int_func), SymbolRef::Func(float_func)]);

        let selected =
            resolve_overload(&unit, "print", &entry, &[Type::Primitive(PrimitiveType::F64)])
                .unwrap();
        assert_eq!(selected, float_func);

        let err =
            resolve_overload(&unit, "print", &entry, &[Type::Primitive(PrimitiveType::Bool)])
                .unwrap_err();
        match err {
            ResolveError::NoMatchingOverload { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn duplicate_signatures_are_an_internal_error() {
        let (mut unit, module) = unit_with_module();
        let a = add_func(&mut unit, module, "f", &[Type::Primitive(PrimitiveType::I32)]);
        let b = add_func(&mut unit, module, "f", &[Type::Primitive(PrimitiveType::I32)]);

        let entry = Entry::Group(vec![SymbolRef::Func(a), SymbolRef::Func(b)]);
        let err = resolve_overload(&unit, "f", &entry, &[Type::Primitive(PrimitiveType::I32)])
            .unwrap_err();
        assert!(matches!(err, ResolveError::AmbiguousOverload { .. }));
    }

    #[test]
    fn generic_instances_are_cached_structurally() {
        let (mut unit, module) = unit_with_module();
        let mut ast = Ast::new();

        let node = ast.add(NodeKind::FunctionDef(FuncId(0)));
        let generic = unit.add_generic_func(GenericFuncSymbol {
            name: "id".to_string(),
            module,
            params: vec![GenericParam {
                name: "T".to_string(),
                kind: GenericParamKind::Type,
            }],
            node,
            instances: Vec::new(),
        });

        let (first, created) = instantiate_generic_func(
            &mut unit,
            &mut ast,
            generic,
            vec![Type::Primitive(PrimitiveType::I32)],
        );
        assert!(created);

        let (second, created) = instantiate_generic_func(
            &mut unit,
            &mut ast,
            generic,
            vec![Type::Primitive(PrimitiveType::I32)],
        );
        assert!(!created);
        assert_eq!(first, second);

        let (third, created) = instantiate_generic_func(
            &mut unit,
            &mut ast,
            generic,
            vec![Type::Primitive(PrimitiveType::I64)],
        );
        assert!(created);
        assert_ne!(first, third);
        assert_eq!(unit.generic_func(generic).instances.len(), 2);
    }

    #[test]
    fn generic_struct_instances_substitute_their_fields() {
        let (mut unit, module) = unit_with_module();
        let mut ast = Ast::new();

        let node = ast.add(NodeKind::StructDef);
        let generic = unit.add_generic_struct(crate::symbols::GenericStructSymbol {
            name: "Pair".to_string(),
            module,
            params: vec![GenericParam {
                name: "T".to_string(),
                kind: GenericParamKind::Type,
            }],
            node,
            fields: vec![
                crate::symbols::Field {
                    name: "first".to_string(),
                    ty: Type::Generic(0),
                },
                crate::symbols::Field {
                    name: "second".to_string(),
                    ty: Type::Generic(0),
                },
            ],
            instances: Vec::new(),
        });

        let (instance, created) = instantiate_generic_struct(
            &mut unit,
            &mut ast,
            generic,
            vec![Type::Primitive(PrimitiveType::I64)],
        );
        assert!(created);

        let symbol = unit.structure(instance);
        assert_eq!(symbol.name, "Pair0");
        assert_eq!(symbol.fields[0].ty, Type::Primitive(PrimitiveType::I64));
        assert_eq!(symbol.generic_instance_of, Some((generic, 0)));

        let (again, created) = instantiate_generic_struct(
            &mut unit,
            &mut ast,
            generic,
            vec![Type::Primitive(PrimitiveType::I64)],
        );
        assert!(!created);
        assert_eq!(instance, again);
    }

    #[test]
    fn parameter_sequences_collect_into_a_tuple() {
        let params = vec![
            GenericParam {
                name: "T".to_string(),
                kind: GenericParamKind::Type,
            },
            GenericParam {
                name: "Rest".to_string(),
                kind: GenericParamKind::Sequence,
            },
        ];

        let collected = collect_generic_args(
            &params,
            vec![
                Type::Primitive(PrimitiveType::I32),
                Type::Primitive(PrimitiveType::F32),
                Type::Primitive(PrimitiveType::F64),
            ],
        );

        assert_eq!(collected.len(), 2);
        assert_eq!(
            collected[1],
            Type::Tuple(vec![
                Type::Primitive(PrimitiveType::F32),
                Type::Primitive(PrimitiveType::F64),
            ])
        );
    }
}
