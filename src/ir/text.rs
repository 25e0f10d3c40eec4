//! Text-format output for debugging and test assertions.
//!
//! The dialect is the WebAssembly text format with Binaryen's spellings for
//! the IR-only constructs (`tuple.make`, `tuple.extract`, tuple-typed
//! locals). Output only; there is no parser.

use crate::ir::expr::{Expr, ExprId, Literal};
use crate::ir::module::{Function, Module};
use crate::ir::types::{HeapId, HeapType};
use std::fmt;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "(module")?;
        for &(start, len) in self.types.rec_groups() {
            if len == 1 {
                write_type(f, self, start, 1)?;
            } else {
                writeln!(f, "  (rec")?;
                for offset in 0..len {
                    write_type(f, self, start + offset, 2)?;
                }
                writeln!(f, "  )")?;
            }
        }
        for function in &self.functions {
            write_function(f, function)?;
        }
        for export in &self.exports {
            writeln!(f, "  (export {:?} (func ${}))", export.name, export.func)?;
        }
        writeln!(f, ")")
    }
}

fn write_type(f: &mut fmt::Formatter<'_>, module: &Module, index: u32, depth: usize) -> fmt::Result {
    let indent = Indent(depth);
    let id = HeapId(index);
    write!(f, "{indent}(type $t{index} ")?;
    match module.types.get(id) {
        HeapType::Struct(fields) => {
            write!(f, "(struct")?;
            for field in fields {
                if field.mutable {
                    write!(f, " (field (mut {}))", field.ty)?;
                } else {
                    write!(f, " (field {})", field.ty)?;
                }
            }
            writeln!(f, "))")
        }
        HeapType::Array(field) => {
            if field.mutable {
                writeln!(f, "(array (mut {})))", field.ty)
            } else {
                writeln!(f, "(array {}))", field.ty)
            }
        }
    }
}

fn write_function(f: &mut fmt::Formatter<'_>, function: &Function) -> fmt::Result {
    write!(f, "  (func ${}", function.name)?;
    if !function.params.is_empty() {
        write!(f, " (param")?;
        for param in &function.params {
            write!(f, " {param}")?;
        }
        write!(f, ")")?;
    }
    if !function.results.is_none() {
        write!(f, " (result")?;
        for component in function.results.components() {
            write!(f, " {component}")?;
        }
        write!(f, ")")?;
    }
    writeln!(f)?;
    for var in function.vars() {
        writeln!(f, "    (local {var})")?;
    }
    if let Some(body) = function.body {
        write_expr(f, function, body, 2)?;
        writeln!(f)?;
    }
    writeln!(f, "  )")
}

struct Indent(usize);

impl fmt::Display for Indent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for _ in 0..self.0 {
            f.write_str("  ")?;
        }
        Ok(())
    }
}

fn write_literal(f: &mut fmt::Formatter<'_>, literal: &Literal) -> fmt::Result {
    match literal {
        Literal::I32(v) => write!(f, "(i32.const {v})"),
        Literal::I64(v) => write!(f, "(i64.const {v})"),
        Literal::F32(v) => write!(f, "(f32.const {v})"),
        Literal::F64(v) => write!(f, "(f64.const {v})"),
        Literal::V128(bytes) => {
            write!(f, "(v128.const i8x16")?;
            for byte in bytes {
                write!(f, " {byte}")?;
            }
            write!(f, ")")
        }
    }
}

fn write_expr(
    f: &mut fmt::Formatter<'_>,
    function: &Function,
    id: ExprId,
    depth: usize,
) -> fmt::Result {
    let indent = Indent(depth);
    match &function.arena[id] {
        Expr::Const(literal) => {
            write!(f, "{indent}")?;
            write_literal(f, literal)
        }
        Expr::LocalGet { local } => write!(f, "{indent}(local.get {local})"),
        Expr::RefNull { heap } => write!(f, "{indent}(ref.null $t{})", heap.0),
        Expr::Block { children } => {
            write!(f, "{indent}(block")?;
            if !function.arena.ty(id).is_none() {
                write!(f, " (result {})", function.arena.ty(id))?;
            }
            write_children(f, function, children, depth)
        }
        Expr::LocalSet { local, value, tee } => {
            let op = if *tee { "local.tee" } else { "local.set" };
            write!(f, "{indent}({op} {local}")?;
            write_children(f, function, std::slice::from_ref(value), depth)
        }
        Expr::Binary { op, lhs, rhs } => {
            write!(f, "{indent}({}", op.name())?;
            write_children(f, function, &[*lhs, *rhs], depth)
        }
        Expr::Call {
            target,
            operands,
            return_call,
        } => {
            let op = if *return_call { "return_call" } else { "call" };
            write!(f, "{indent}({op} ${target}")?;
            write_children(f, function, operands, depth)
        }
        Expr::StructNew { heap, operands } => {
            if operands.is_empty() {
                write!(f, "{indent}(struct.new_default $t{})", heap.0)
            } else {
                write!(f, "{indent}(struct.new $t{}", heap.0)?;
                write_children(f, function, operands, depth)
            }
        }
        Expr::StructGet {
            heap,
            field,
            object,
        } => {
            write!(f, "{indent}(struct.get $t{} {field}", heap.0)?;
            write_children(f, function, std::slice::from_ref(object), depth)
        }
        Expr::ArrayNew { heap, size, init } => match init {
            None => {
                write!(f, "{indent}(array.new_default $t{}", heap.0)?;
                write_children(f, function, std::slice::from_ref(size), depth)
            }
            Some(init) => {
                write!(f, "{indent}(array.new $t{}", heap.0)?;
                write_children(f, function, &[*init, *size], depth)
            }
        },
        Expr::ArrayGet { array, index } => {
            write!(f, "{indent}(array.get")?;
            write_children(f, function, &[*array, *index], depth)
        }
        Expr::ArraySet {
            array,
            index,
            value,
        } => {
            write!(f, "{indent}(array.set")?;
            write_children(f, function, &[*array, *index, *value], depth)
        }
        Expr::ArrayLen { array } => {
            write!(f, "{indent}(array.len")?;
            write_children(f, function, std::slice::from_ref(array), depth)
        }
        Expr::TupleMake { operands } => {
            write!(f, "{indent}(tuple.make {}", operands.len())?;
            write_children(f, function, operands, depth)
        }
        Expr::TupleExtract { tuple, index } => {
            let arity = function.arena.ty(*tuple).component_count();
            write!(f, "{indent}(tuple.extract {arity} {index}")?;
            write_children(f, function, std::slice::from_ref(tuple), depth)
        }
    }
}

fn write_children(
    f: &mut fmt::Formatter<'_>,
    function: &Function,
    children: &[ExprId],
    depth: usize,
) -> fmt::Result {
    for &child in children {
        writeln!(f)?;
        write_expr(f, function, child, depth + 1)?;
    }
    write!(f, ")")
}
