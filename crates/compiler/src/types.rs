//! Language-level type model.
//!
//! These are the types attached to resolved AST expressions and declared
//! symbols; they are distinct from the IR types in [`crate::ssa`], which the
//! lowering produces from them. Equality is structural throughout, including
//! through pointers, tuples and function signatures.

use crate::symbols::{EnumId, ProtoId, StructId, UnionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Addr,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub ret: Box<Type>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Primitive(PrimitiveType),
    Struct(StructId),
    Enum(EnumId),
    Union(UnionId),
    /// A single case of a tagged union, usable as a type of its own before
    /// coercion into the full union.
    UnionCase(UnionId, usize),
    Proto(ProtoId),
    Pointer(Box<Type>),
    StaticArray(Box<Type>, u32),
    Tuple(Vec<Type>),
    Function(FunctionType),
    Closure(FunctionType),
    /// Placeholder inside a generic declaration; the index selects the
    /// generic parameter it stands for.
    Generic(usize),
}

impl Type {
    pub fn pointer(base: Type) -> Type {
        Type::Pointer(Box::new(base))
    }

    pub fn function(params: Vec<Type>, ret: Type) -> Type {
        Type::Function(FunctionType {
            params,
            ret: Box::new(ret),
        })
    }

    pub fn closure(params: Vec<Type>, ret: Type) -> Type {
        Type::Closure(FunctionType {
            params,
            ret: Box::new(ret),
        })
    }

    pub fn is_primitive(&self, primitive: PrimitiveType) -> bool {
        matches!(self, Type::Primitive(p) if *p == primitive)
    }

    pub fn is_void(&self) -> bool {
        self.is_primitive(PrimitiveType::Void)
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(
            self,
            Type::Primitive(
                PrimitiveType::I8 | PrimitiveType::I16 | PrimitiveType::I32 | PrimitiveType::I64
            )
        )
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(
            self,
            Type::Primitive(
                PrimitiveType::U8 | PrimitiveType::U16 | PrimitiveType::U32 | PrimitiveType::U64
            )
        )
    }

    pub fn is_int(&self) -> bool {
        self.is_signed_int() || self.is_unsigned_int()
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            Type::Primitive(PrimitiveType::F32 | PrimitiveType::F64)
        )
    }

    pub fn struct_id(&self) -> Option<StructId> {
        match self {
            Type::Struct(id) => Some(*id),
            _ => None,
        }
    }

    pub fn base_type(&self) -> Option<&Type> {
        match self {
            Type::Pointer(base) => Some(base),
            Type::StaticArray(base, _) => Some(base),
            _ => None,
        }
    }

    pub fn function_type(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(ty) | Type::Closure(ty) => Some(ty),
            _ => None,
        }
    }

    /// Replaces `Generic(i)` placeholders with `args[i]`, recursing through
    /// every composite position. Used by generic instantiation.
    pub fn substitute(&self, args: &[Type]) -> Type {
        match self {
            Type::Generic(index) => args
                .get(*index)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            Type::Pointer(base) => Type::pointer(base.substitute(args)),
            Type::StaticArray(base, len) => {
                Type::StaticArray(Box::new(base.substitute(args)), *len)
            }
            Type::Tuple(types) => {
                Type::Tuple(types.iter().map(|ty| ty.substitute(args)).collect())
            }
            Type::Function(ty) => Type::function(
                ty.params.iter().map(|p| p.substitute(args)).collect(),
                ty.ret.substitute(args),
            ),
            Type::Closure(ty) => Type::closure(
                ty.params.iter().map(|p| p.substitute(args)).collect(),
                ty.ret.substitute(args),
            ),
            _ => self.clone(),
        }
    }

    pub fn equal_lists(a: &[Type], b: &[Type]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_structural() {
        let a = Type::pointer(Type::Primitive(PrimitiveType::I32));
        let b = Type::pointer(Type::Primitive(PrimitiveType::I32));
        let c = Type::pointer(Type::Primitive(PrimitiveType::I64));

        assert_eq!(a, b);
        assert_ne!(a, c);

        let f = Type::function(vec![a.clone()], Type::Primitive(PrimitiveType::Void));
        let g = Type::function(vec![b], Type::Primitive(PrimitiveType::Void));
        assert_eq!(f, g);
        // A closure type never equals the function type with the same shape.
        assert_ne!(
            f,
            Type::closure(vec![a], Type::Primitive(PrimitiveType::Void))
        );
    }

    #[test]
    fn substitute_reaches_nested_positions() {
        let generic = Type::function(
            vec![Type::Generic(0), Type::pointer(Type::Generic(1))],
            Type::Tuple(vec![Type::Generic(0)]),
        );

        let concrete = generic.substitute(&[
            Type::Primitive(PrimitiveType::I32),
            Type::Primitive(PrimitiveType::F64),
        ]);

        assert_eq!(
            concrete,
            Type::function(
                vec![
                    Type::Primitive(PrimitiveType::I32),
                    Type::pointer(Type::Primitive(PrimitiveType::F64)),
                ],
                Type::Tuple(vec![Type::Primitive(PrimitiveType::I32)]),
            )
        );
    }

    #[test]
    fn int_classification() {
        assert!(Type::Primitive(PrimitiveType::I16).is_signed_int());
        assert!(Type::Primitive(PrimitiveType::U64).is_unsigned_int());
        assert!(!Type::Primitive(PrimitiveType::F32).is_int());
        assert!(Type::Primitive(PrimitiveType::F32).is_floating_point());
    }
}
