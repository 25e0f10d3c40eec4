use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// WebAssembly proposals a [`Module`](crate::ir::module::Module) declares
    /// itself to use.
    ///
    /// The differentiation driver requires `MULTIVALUE | REFERENCE_TYPES | GC`:
    /// forward passes return multi-value tuples, and tapes are GC structs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const MULTIVALUE = 1 << 0;
        const REFERENCE_TYPES = 1 << 1;
        const GC = 1 << 2;
    }
}

/// Index of a struct or array type in the module's heap-type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapId(pub u32);

/// A value type.
///
/// `None` is the empty tuple: the type of statements, and the gradient type of
/// everything that carries no gradient. `Tuple` never has fewer than two
/// components; use [`Type::tuple`] to normalize.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    None,
    I32,
    I64,
    F32,
    F64,
    V128,
    Funcref,
    Externref,
    Ref(HeapId),
    Tuple(Vec<Type>),
}

impl Type {
    /// Normalizing tuple constructor: zero components collapse to `None`, a
    /// single component collapses to the component itself.
    #[must_use]
    pub fn tuple(mut components: Vec<Type>) -> Type {
        match components.len() {
            0 => Type::None,
            1 => components.pop().unwrap(),
            _ => Type::Tuple(components),
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Type::None)
    }

    /// `f32` and `f64` are the differentiable scalars.
    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Type::F32 | Type::F64)
    }

    #[must_use]
    pub fn is_ref(&self) -> bool {
        matches!(self, Type::Ref(_))
    }

    /// The flattened component list: `None` has no components, a tuple has its
    /// elements, everything else is a single component.
    #[must_use]
    pub fn components(&self) -> Vec<Type> {
        match self {
            Type::None => Vec::new(),
            Type::Tuple(components) => components.clone(),
            other => vec![other.clone()],
        }
    }

    #[must_use]
    pub fn component_count(&self) -> usize {
        match self {
            Type::None => 0,
            Type::Tuple(components) => components.len(),
            _ => 1,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::None => "none",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::V128 => "v128",
            Type::Funcref => "funcref",
            Type::Externref => "externref",
            Type::Ref(_) => "ref",
            Type::Tuple(_) => "tuple",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Ref(heap) => write!(f, "(ref null $t{})", heap.0),
            Type::Tuple(components) => {
                f.write_str("(tuple")?;
                for component in components {
                    write!(f, " {component}")?;
                }
                f.write_str(")")
            }
            other => f.write_str(other.kind_name()),
        }
    }
}

/// A struct field or array element description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub ty: Type,
    pub mutable: bool,
}

impl Field {
    #[must_use]
    pub fn immutable(ty: Type) -> Self {
        Self { ty, mutable: false }
    }

    #[must_use]
    pub fn mutable(ty: Type) -> Self {
        Self { ty, mutable: true }
    }
}

/// A GC heap type. Packed storage types are not modeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapType {
    Struct(Vec<Field>),
    Array(Field),
}
