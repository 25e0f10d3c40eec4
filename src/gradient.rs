//! Maps primal types to their gradient types.
//!
//! `f32` and `f64` are their own gradients; integers and `none` carry no
//! gradient at all; struct and array types map structurally, dropping the
//! components that carry nothing. Results are memoized so repeated queries
//! return the same heap ids.

use crate::ir::module::Types;
use crate::ir::types::{Field, HeapId, HeapType, Type};
use std::collections::{HashMap, HashSet};

/// A type kind outside the differentiable set (`v128`, `funcref`, …).
///
/// Carries the kind name; the driver wraps it with the offending function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unsupported(pub &'static str);

/// Memoizing primal-to-gradient type mapper.
#[derive(Debug, Default)]
pub struct TypeMap {
    values: HashMap<Type, Type>,
    heaps: HashMap<HeapId, HeapId>,
    in_progress: HashSet<HeapId>,
}

impl TypeMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether differentiation flips a struct field or array element mutable,
    /// so the backward pass can accumulate in place.
    #[must_use]
    pub fn differentiable(ty: &Type) -> bool {
        ty.is_float()
    }

    /// Gradient type of a value type. `None` means unit: no gradient flows.
    pub fn grad(&mut self, types: &mut Types, ty: &Type) -> Result<Type, Unsupported> {
        if let Some(grad) = self.values.get(ty) {
            return Ok(grad.clone());
        }
        let grad = match ty {
            Type::F32 => Type::F32,
            Type::F64 => Type::F64,
            Type::None | Type::I32 | Type::I64 => Type::None,
            Type::Ref(heap) => Type::Ref(self.grad_heap(types, *heap)?),
            Type::Tuple(components) => {
                let mut mapped = Vec::with_capacity(components.len());
                for component in components {
                    let grad = self.grad(types, component)?;
                    if !grad.is_none() {
                        mapped.push(grad);
                    }
                }
                Type::tuple(mapped)
            }
            Type::V128 => return Err(Unsupported("v128")),
            Type::Funcref => return Err(Unsupported("funcref")),
            Type::Externref => return Err(Unsupported("externref")),
        };
        self.values.insert(ty.clone(), grad.clone());
        Ok(grad)
    }

    /// Gradient heap type of a struct or array type, added to the module's
    /// table on first use.
    ///
    /// A struct keeps only fields with non-unit gradients; an array whose
    /// element gradient is unit collapses to an empty struct. Surviving
    /// fields become mutable when the primal field was mutable or the primal
    /// type is differentiable.
    pub fn grad_heap(&mut self, types: &mut Types, heap: HeapId) -> Result<HeapId, Unsupported> {
        if let Some(&mapped) = self.heaps.get(&heap) {
            return Ok(mapped);
        }
        if !self.in_progress.insert(heap) {
            return Err(Unsupported("recursive heap type"));
        }
        let result = self.map_heap(types, heap);
        self.in_progress.remove(&heap);
        let mapped = types.add(result?);
        self.heaps.insert(heap, mapped);
        Ok(mapped)
    }

    fn map_heap(&mut self, types: &mut Types, heap: HeapId) -> Result<HeapType, Unsupported> {
        match types.get(heap).clone() {
            HeapType::Struct(fields) => {
                let mut mapped = Vec::with_capacity(fields.len());
                for field in fields {
                    let grad = self.grad(types, &field.ty)?;
                    if !grad.is_none() {
                        mapped.push(Field {
                            mutable: field.mutable || Self::differentiable(&field.ty),
                            ty: grad,
                        });
                    }
                }
                Ok(HeapType::Struct(mapped))
            }
            HeapType::Array(element) => {
                let grad = self.grad(types, &element.ty)?;
                if grad.is_none() {
                    Ok(HeapType::Struct(Vec::new()))
                } else {
                    Ok(HeapType::Array(Field {
                        mutable: element.mutable || Self::differentiable(&element.ty),
                        ty: grad,
                    }))
                }
            }
        }
    }
}
