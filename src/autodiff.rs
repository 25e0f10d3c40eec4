//! The transformation driver.
//!
//! Plans every function, builds all tape struct types in a single recursion
//! group (call fields may reference each other cyclically), mints unique
//! forward/backward names, and appends the generated pairs to the module.
//! Any error aborts the whole transformation with the module unchanged.

use crate::generate::{GenCtx, generate};
use crate::gradient::TypeMap;
use crate::ir::module::Module;
use crate::ir::types::{Features, Field, HeapType, Type};
use crate::names::NameSet;
use crate::plan::{Planner, TapeField};
use std::{error, fmt};

/// Transformation errors. All are fatal: no partial output is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The input module does not declare the listed required features.
    MissingFeatures(Features),
    MissingBody {
        func: String,
    },
    UnsupportedType {
        func: String,
        kind: &'static str,
    },
    UnsupportedExpression {
        func: String,
        kind: &'static str,
    },
    UnsupportedConstant {
        func: String,
        kind: &'static str,
    },
    /// A non-zero constant was assigned a field-kind gradient load. This
    /// signals an analysis bug rather than bad input.
    NonZeroGradientConstant {
        func: String,
    },
    TailCall {
        func: String,
    },
    InvalidInit {
        func: String,
        kind: &'static str,
    },
    UnresolvedName {
        func: String,
        target: String,
    },
    InternalInvariant {
        func: String,
        message: &'static str,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFeatures(missing) => {
                write!(f, "module is missing required features {missing:?}")
            }
            Self::MissingBody { func } => write!(f, "function `{func}` has no body"),
            Self::UnsupportedType { func, kind } => {
                write!(f, "unsupported type `{kind}` in function `{func}`")
            }
            Self::UnsupportedExpression { func, kind } => {
                write!(f, "unsupported expression `{kind}` in function `{func}`")
            }
            Self::UnsupportedConstant { func, kind } => {
                write!(f, "unsupported constant payload `{kind}` in function `{func}`")
            }
            Self::NonZeroGradientConstant { func } => {
                write!(
                    f,
                    "non-zero constant with a taped gradient in function `{func}`"
                )
            }
            Self::TailCall { func } => write!(f, "tail call in function `{func}`"),
            Self::InvalidInit { func, kind } => write!(f, "{kind} in function `{func}`"),
            Self::UnresolvedName { func, target } => {
                write!(f, "call to unknown function `{target}` in function `{func}`")
            }
            Self::InternalInvariant { func, message } => {
                write!(f, "internal invariant violated in function `{func}`: {message}")
            }
        }
    }
}

impl error::Error for Error {}

/// Features the input module must declare.
pub const REQUIRED_FEATURES: Features = Features::MULTIVALUE
    .union(Features::REFERENCE_TYPES)
    .union(Features::GC);

/// Differentiate every function in the module.
///
/// For each function `N` this appends `N_fwd` and `N_bwd` (names suffixed
/// numerically on collision). `N_fwd` takes the original parameters followed
/// by their gradients and returns the original results, their gradients, and
/// an opaque tape reference; `N_bwd` takes the parameter gradients, result
/// gradients, and the tape, and returns the accumulated parameter gradients.
/// Exported functions get their pairs exported under the minted names.
pub fn autodiff(module: &mut Module) -> Result<(), Error> {
    if !module.features.contains(REQUIRED_FEATURES) {
        return Err(Error::MissingFeatures(
            REQUIRED_FEATURES.difference(module.features),
        ));
    }

    let mut map = TypeMap::new();
    let mut plans = Vec::with_capacity(module.functions.len());
    {
        let functions = &module.functions;
        let types = &mut module.types;
        for func in functions {
            plans.push(Planner::plan_function(func, functions, types, &mut map)?);
        }
    }

    // One recursion group for every tape struct, so a caller's tape can hold
    // a reference to its callee's.
    let mut builder = module.types.builder(plans.len());
    for (i, plan) in plans.iter().enumerate() {
        let fields = plan
            .fields
            .iter()
            .map(|field| {
                Field::immutable(match field {
                    TapeField::Value(ty) | TapeField::Grad(ty) => ty.clone(),
                    TapeField::Call(callee) => Type::Ref(builder.slot(*callee)),
                })
            })
            .collect();
        builder.define(i, HeapType::Struct(fields));
    }
    let tape_heaps = builder.build();

    let mut names = NameSet::new();
    for func in &module.functions {
        names.insert(&func.name);
    }
    for export in &module.exports {
        names.insert(&export.name);
    }
    let mut fwd_names = Vec::with_capacity(module.functions.len());
    let mut bwd_names = Vec::with_capacity(module.functions.len());
    for func in &module.functions {
        fwd_names.push(names.mint(&func.name, "_fwd"));
        bwd_names.push(names.mint(&func.name, "_bwd"));
    }

    let ctx = GenCtx {
        tape_heaps,
        fwd_names,
        bwd_names,
    };
    let mut pairs = Vec::with_capacity(plans.len());
    {
        let functions = &module.functions;
        let types = &mut module.types;
        for (i, func) in functions.iter().enumerate() {
            pairs.push(generate(func, functions, types, &mut map, &plans[i], &ctx, i)?);
        }
    }

    let mut new_exports = Vec::new();
    for (i, func) in module.functions.iter().enumerate() {
        if module.exports.iter().any(|e| e.func == func.name) {
            new_exports.push(ctx.fwd_names[i].clone());
            new_exports.push(ctx.bwd_names[i].clone());
        }
    }
    for (fwd, bwd) in pairs {
        module.functions.push(fwd);
        module.functions.push(bwd);
    }
    for name in new_exports {
        let func = name.clone();
        module.export(name, func);
    }
    Ok(())
}
