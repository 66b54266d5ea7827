//! The storage model the expression lowerer trades in.
//!
//! Every lowered expression becomes a [`StoredValue`]: either a direct IR
//! value or a pointer to a stack slot holding the value. [`StorageHints`]
//! lets an outer context steer where a value materializes, which is what
//! keeps struct literals, call results and coercions from bouncing through
//! redundant temporaries.

use crate::ssa::{self, Operand, VirtualRegister};

use super::LowerCtx;

/// Storage preferences passed down into expression lowering.
#[derive(Clone, Default)]
pub struct StorageHints {
    /// Write the result into this pointer instead of fresh storage.
    pub dst: Option<Operand>,
    /// Produce the reference form even for register-sized values.
    pub prefer_reference: bool,
}

impl StorageHints {
    pub fn none() -> StorageHints {
        StorageHints::default()
    }

    pub fn prefer_reference() -> StorageHints {
        StorageHints {
            dst: None,
            prefer_reference: true,
        }
    }

    pub fn into_dst(dst: Operand) -> StorageHints {
        StorageHints {
            dst: Some(dst),
            prefer_reference: false,
        }
    }
}

#[derive(Clone)]
pub struct StoredValue {
    /// False: `value_or_ptr` holds the value itself. True: it holds a
    /// pointer to a slot containing the value.
    pub reference: bool,
    /// The type of the value, never the pointer type.
    pub value_type: ssa::Type,
    pub value_or_ptr: Operand,
}

impl StoredValue {
    pub fn value(operand: Operand) -> StoredValue {
        StoredValue {
            reference: false,
            value_type: operand.ty(),
            value_or_ptr: operand,
        }
    }

    pub fn value_reg(reg: VirtualRegister, ty: ssa::Type) -> StoredValue {
        StoredValue::value(Operand::from_register(reg, ty))
    }

    pub fn reference(ptr: Operand, value_type: ssa::Type) -> StoredValue {
        StoredValue {
            reference: true,
            value_type,
            value_or_ptr: ptr,
        }
    }

    pub fn reference_reg(reg: VirtualRegister, value_type: ssa::Type) -> StoredValue {
        StoredValue::reference(Operand::from_register(reg, ssa::ADDR), value_type)
    }

    /// A slot for a value of `ty`: the hinted destination if one was given,
    /// a fresh stack slot otherwise.
    pub fn alloc(ty: ssa::Type, hints: &StorageHints, ctx: &mut LowerCtx) -> StoredValue {
        let ptr = match &hints.dst {
            Some(dst) => dst.with_type(ssa::ADDR),
            None => {
                let reg = ctx.append_alloca(ty);
                Operand::from_register(reg, ssa::ADDR)
            }
        };

        StoredValue::reference(ptr, ty)
    }

    pub fn fits_in_reg(&self, ctx: &LowerCtx) -> bool {
        ctx.fits_in_register(self.value_type)
    }

    /// The pointer form of this value; only valid on references.
    pub fn ptr(&self) -> Operand {
        debug_assert!(self.reference, "ptr() on a direct value");
        self.value_or_ptr.clone()
    }

    /// The direct form of this value; only valid on non-references.
    pub fn direct(&self) -> Operand {
        debug_assert!(!self.reference, "direct() on a reference");
        self.value_or_ptr.clone()
    }

    /// Spills a direct value into a stack slot; references pass through.
    pub fn turn_into_reference(self, ctx: &mut LowerCtx) -> StoredValue {
        if self.reference {
            return self;
        }

        let slot = ctx.append_alloca(self.value_type);
        let dst = Operand::from_register(slot, ssa::ADDR);
        ctx.append_store(self.value_or_ptr, dst.clone());
        StoredValue::reference(dst, self.value_type)
    }

    /// Loads a register-sized reference into a direct value; larger values
    /// stay behind their pointer.
    pub fn try_turn_into_value(self, ctx: &mut LowerCtx) -> StoredValue {
        if self.reference && self.fits_in_reg(ctx) {
            let value = ctx.append_load(self.value_type, self.value_or_ptr);
            StoredValue::value(value)
        } else {
            self
        }
    }

    /// Loads a reference into a direct value; the type must fit in a
    /// register.
    pub fn turn_into_value(self, ctx: &mut LowerCtx) -> StoredValue {
        if self.reference {
            debug_assert!(self.fits_in_reg(ctx), "loading an unsized value");
            let value = ctx.append_load(self.value_type, self.value_or_ptr);
            StoredValue::value(value)
        } else {
            self
        }
    }

    /// Copies this value to `dst`: load-store for register-sized
    /// references, a `copy` for larger ones, a plain store for direct
    /// values. Storing a slot onto itself is a no-op.
    pub fn copy_to(&self, dst: &Operand, ctx: &mut LowerCtx) {
        if self.value_or_ptr.is_register() && self.value_or_ptr == *dst {
            return;
        }

        if self.reference {
            if self.fits_in_reg(ctx) {
                let value = ctx.append_load(self.value_type, self.value_or_ptr.clone());
                ctx.append_store(value, dst.clone());
            } else {
                ctx.append_copy(
                    dst.with_type(ssa::ADDR),
                    self.value_or_ptr.clone(),
                    self.value_type,
                );
            }
        } else {
            ctx.append_store(self.value_or_ptr.clone(), dst.clone());
        }
    }
}
