//! Reverse-mode automatic differentiation for WebAssembly GC modules

/// Transformation driver
pub mod autodiff;
mod generate;
/// Gradient type mapping
pub mod gradient;
mod names;
/// Tape planning
pub mod plan;

/// Host IR: types, expressions, module containers, text output
pub mod ir {
    /// Expression nodes and arenas
    pub mod expr;
    /// Functions, modules, heap-type tables
    pub mod module;
    /// Text-format dumps
    pub mod text;
    /// Value and heap types, feature flags
    pub mod types;
}

pub use self::autodiff::{Error, autodiff};
pub use self::gradient::TypeMap;
pub use self::ir::module::{Function, Module};
pub use self::ir::types::{Features, Type};
pub use self::plan::TapePlan;
