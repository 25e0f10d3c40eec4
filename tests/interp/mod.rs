//! A tree-walking evaluator over the host IR, for executing generated
//! modules in tests. Panics on anything a real engine would trap on.

use std::cell::RefCell;
use std::rc::Rc;
use wasm_autodiff::ir::expr::{BinaryOp, Expr, ExprId, Literal};
use wasm_autodiff::ir::module::{Function, Module};
use wasm_autodiff::ir::types::{HeapType, Type};

#[derive(Debug, Clone)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Null,
    Obj(Rc<RefCell<Obj>>),
    Tuple(Vec<Val>),
}

#[derive(Debug)]
pub enum Obj {
    Struct(Vec<Val>),
    Array(Vec<Val>),
}

impl Val {
    #[track_caller]
    pub fn f64(&self) -> f64 {
        match self {
            Val::F64(v) => *v,
            other => panic!("expected f64, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn f32(&self) -> f32 {
        match self {
            Val::F32(v) => *v,
            other => panic!("expected f32, got {other:?}"),
        }
    }

    #[track_caller]
    pub fn i32(&self) -> i32 {
        match self {
            Val::I32(v) => *v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    #[track_caller]
    fn obj(&self) -> Rc<RefCell<Obj>> {
        match self {
            Val::Obj(obj) => obj.clone(),
            other => panic!("expected a heap object, got {other:?}"),
        }
    }

    /// Flatten a multi-value result; scalars become one-element lists.
    pub fn into_parts(self) -> Vec<Val> {
        match self {
            Val::Tuple(parts) => parts,
            other => vec![other],
        }
    }

    fn unit() -> Val {
        Val::Tuple(Vec::new())
    }
}

fn zero(module: &Module, ty: &Type) -> Val {
    match ty {
        Type::I32 => Val::I32(0),
        Type::I64 => Val::I64(0),
        Type::F32 => Val::F32(0.0),
        Type::F64 => Val::F64(0.0),
        Type::Ref(_) | Type::Funcref | Type::Externref => Val::Null,
        Type::Tuple(components) => {
            Val::Tuple(components.iter().map(|c| zero(module, c)).collect())
        }
        other => panic!("no zero value for {other:?}"),
    }
}

/// Call a function by name. Multi-value results come back as `Val::Tuple`.
#[track_caller]
pub fn call(module: &Module, name: &str, args: Vec<Val>) -> Val {
    let func = module
        .function(name)
        .unwrap_or_else(|| panic!("no function named {name}"));
    assert_eq!(args.len(), func.params.len(), "arity mismatch calling {name}");
    let mut locals = args;
    for ty in func.vars() {
        locals.push(zero(module, ty));
    }
    let body = func.body.unwrap_or_else(|| panic!("{name} has no body"));
    eval(module, func, &mut locals, body)
}

fn binary(op: BinaryOp, lhs: &Val, rhs: &Val) -> Val {
    use BinaryOp::*;
    match op {
        AddF32 => Val::F32(lhs.f32() + rhs.f32()),
        SubF32 => Val::F32(lhs.f32() - rhs.f32()),
        MulF32 => Val::F32(lhs.f32() * rhs.f32()),
        DivF32 => Val::F32(lhs.f32() / rhs.f32()),
        AddF64 => Val::F64(lhs.f64() + rhs.f64()),
        SubF64 => Val::F64(lhs.f64() - rhs.f64()),
        MulF64 => Val::F64(lhs.f64() * rhs.f64()),
        DivF64 => Val::F64(lhs.f64() / rhs.f64()),
        AddI32 => Val::I32(lhs.i32().wrapping_add(rhs.i32())),
        SubI32 => Val::I32(lhs.i32().wrapping_sub(rhs.i32())),
        MulI32 => Val::I32(lhs.i32().wrapping_mul(rhs.i32())),
        AddI64 | SubI64 | MulI64 => match (lhs, rhs) {
            (Val::I64(a), Val::I64(b)) => Val::I64(match op {
                AddI64 => a.wrapping_add(*b),
                SubI64 => a.wrapping_sub(*b),
                _ => a.wrapping_mul(*b),
            }),
            other => panic!("expected i64 operands, got {other:?}"),
        },
    }
}

fn eval(module: &Module, func: &Function, locals: &mut Vec<Val>, id: ExprId) -> Val {
    match &func.arena[id] {
        Expr::Block { children } => {
            let mut last = Val::unit();
            for &child in children {
                last = eval(module, func, locals, child);
            }
            last
        }
        Expr::Const(literal) => match literal {
            Literal::I32(v) => Val::I32(*v),
            Literal::I64(v) => Val::I64(*v),
            Literal::F32(v) => Val::F32(*v),
            Literal::F64(v) => Val::F64(*v),
            Literal::V128(_) => panic!("v128 constants are not executable here"),
        },
        Expr::LocalGet { local } => locals[*local as usize].clone(),
        Expr::LocalSet { local, value, tee } => {
            let value = eval(module, func, locals, *value);
            locals[*local as usize] = value.clone();
            if *tee { value } else { Val::unit() }
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(module, func, locals, *lhs);
            let rhs = eval(module, func, locals, *rhs);
            binary(*op, &lhs, &rhs)
        }
        Expr::Call {
            target, operands, ..
        } => {
            let args = operands
                .iter()
                .map(|&operand| eval(module, func, locals, operand))
                .collect();
            call(module, target, args)
        }
        Expr::StructNew { heap, operands } => {
            let fields = match module.types.get(*heap) {
                HeapType::Struct(fields) => fields,
                HeapType::Array(_) => panic!("struct.new of an array type"),
            };
            let values = if operands.is_empty() {
                fields.iter().map(|f| zero(module, &f.ty)).collect()
            } else {
                operands
                    .iter()
                    .map(|&operand| eval(module, func, locals, operand))
                    .collect()
            };
            Val::Obj(Rc::new(RefCell::new(Obj::Struct(values))))
        }
        Expr::StructGet { field, object, .. } => {
            let object = eval(module, func, locals, *object).obj();
            let object = object.borrow();
            match &*object {
                Obj::Struct(fields) => fields[*field as usize].clone(),
                Obj::Array(_) => panic!("struct.get of an array"),
            }
        }
        Expr::ArrayNew { heap, size, init } => {
            let init = init.map(|init| eval(module, func, locals, init));
            let size = eval(module, func, locals, *size).i32() as usize;
            let element = match module.types.get(*heap) {
                HeapType::Array(element) => element,
                HeapType::Struct(_) => panic!("array.new of a struct type"),
            };
            let fill = init.unwrap_or_else(|| zero(module, &element.ty));
            Val::Obj(Rc::new(RefCell::new(Obj::Array(vec![fill; size]))))
        }
        Expr::ArrayGet { array, index } => {
            let array = eval(module, func, locals, *array).obj();
            let index = eval(module, func, locals, *index).i32() as usize;
            let array = array.borrow();
            match &*array {
                Obj::Array(elements) => elements[index].clone(),
                Obj::Struct(_) => panic!("array.get of a struct"),
            }
        }
        Expr::ArraySet {
            array,
            index,
            value,
        } => {
            let array = eval(module, func, locals, *array).obj();
            let index = eval(module, func, locals, *index).i32() as usize;
            let value = eval(module, func, locals, *value);
            match &mut *array.borrow_mut() {
                Obj::Array(elements) => elements[index] = value,
                Obj::Struct(_) => panic!("array.set of a struct"),
            }
            Val::unit()
        }
        Expr::ArrayLen { array } => {
            let array = eval(module, func, locals, *array).obj();
            let array = array.borrow();
            match &*array {
                Obj::Array(elements) => Val::I32(elements.len() as i32),
                Obj::Struct(_) => panic!("array.len of a struct"),
            }
        }
        Expr::RefNull { .. } => Val::Null,
        Expr::TupleMake { operands } => Val::Tuple(
            operands
                .iter()
                .map(|&operand| eval(module, func, locals, operand))
                .collect(),
        ),
        Expr::TupleExtract { tuple, index } => {
            match eval(module, func, locals, *tuple) {
                Val::Tuple(parts) => parts[*index as usize].clone(),
                other => panic!("tuple.extract of {other:?}"),
            }
        }
    }
}
