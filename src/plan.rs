//! Tape planning: a symbolic interpretation of a function body that decides
//! which intermediate values the backward pass will need, and assigns each
//! one a field in the function's tape struct.

use crate::autodiff::Error;
use crate::gradient::TypeMap;
use crate::ir::expr::{Arith, Expr, ExprId, Literal};
use crate::ir::module::{Function, Types};
use crate::ir::types::Type;
use std::collections::HashMap;

/// What the planner knows about a subexpression's value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// An unevaluated initial local binding.
    Param,
    /// No value: statement position.
    Void,
    /// A literal known at plan time.
    Const(Literal),
    /// Equal to the result of the given expression node.
    Expr(ExprId),
}

/// How the backward pass obtains a value it needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Load {
    /// Re-materialize the literal; nothing is stored.
    Const(Literal),
    /// Read the given tape field.
    Field(u32),
}

/// What a tape field holds, as laid out by the planner.
///
/// `Call` fields hold the callee's sub-tape; their reference type is resolved
/// by the driver once every function's tape struct has a reserved heap id.
#[derive(Debug, Clone, PartialEq)]
pub enum TapeField {
    /// A stored primal value of the given type.
    Value(Type),
    /// A stored gradient value of the given type.
    Grad(Type),
    /// The sub-tape of the function at the given module index.
    Call(usize),
}

/// The per-function plan: tape field layout, store points, load sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TapePlan {
    /// Field table, indexed by the field numbers in the maps below.
    pub fields: Vec<TapeField>,
    /// Forward-pass expressions whose value is teed into a tape field.
    pub stores: HashMap<ExprId, u32>,
    /// Expressions whose in-forward gradient value is saved into a tape field.
    pub grads: HashMap<ExprId, u32>,
    /// For each differentiating `array.set`, the field holding the overwritten
    /// element's gradient prior to the store.
    pub sets: HashMap<ExprId, u32>,
    /// The field holding the callee's sub-tape, per call site.
    pub calls: HashMap<ExprId, u32>,
    /// For every backward-pass use of a primal, how to obtain it.
    pub loads: HashMap<ExprId, Load>,
    /// Analogous for gradients that must be reloaded.
    pub grad_loads: HashMap<ExprId, Load>,
}

impl TapePlan {
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }
}

pub(crate) struct Planner<'a> {
    func: &'a Function,
    functions: &'a [Function],
    types: &'a mut Types,
    map: &'a mut TypeMap,
    vars: Vec<Value>,
    plan: TapePlan,
}

impl<'a> Planner<'a> {
    pub(crate) fn plan_function(
        func: &'a Function,
        functions: &'a [Function],
        types: &'a mut Types,
        map: &'a mut TypeMap,
    ) -> Result<TapePlan, Error> {
        let body = func.body.ok_or_else(|| Error::MissingBody {
            func: func.name.clone(),
        })?;
        let mut planner = Planner {
            func,
            functions,
            types,
            map,
            // Unwritten vars read back their zero default, which the lifting
            // at `local.get` handles the same way as a parameter.
            vars: vec![Value::Param; func.num_locals()],
            plan: TapePlan::default(),
        };
        planner.plan(body)?;
        Ok(planner.plan)
    }

    fn unsupported_type(&self, kind: &'static str) -> Error {
        Error::UnsupportedType {
            func: self.func.name.clone(),
            kind,
        }
    }

    fn alloc(&mut self, field: TapeField) -> u32 {
        let index = self.plan.fields.len() as u32;
        self.plan.fields.push(field);
        index
    }

    /// Record that the backward pass will need `value` at `at`.
    fn mark(&mut self, at: ExprId, value: Value) -> Result<(), Error> {
        match value {
            Value::Const(literal) => {
                self.plan.loads.insert(at, Load::Const(literal));
            }
            Value::Expr(expr) => {
                let index = match self.plan.stores.get(&expr) {
                    Some(&index) => index,
                    None => {
                        let ty = self.func.arena.ty(expr).clone();
                        let index = self.alloc(TapeField::Value(ty));
                        self.plan.stores.insert(expr, index);
                        index
                    }
                };
                self.plan.loads.insert(at, Load::Field(index));
            }
            Value::Param | Value::Void => {
                return Err(Error::InternalInvariant {
                    func: self.func.name.clone(),
                    message: "marked a param or void value for the tape",
                });
            }
        }
        Ok(())
    }

    /// Plan the subexpression and mark its value for tape storage.
    fn save(&mut self, expr: ExprId) -> Result<(), Error> {
        let value = self.plan(expr)?;
        self.mark(expr, value)
    }

    /// Reserve (or reuse) a tape field for the in-forward gradient of `expr`.
    fn mark_grad(&mut self, expr: ExprId) -> Result<(), Error> {
        let index = match self.plan.grads.get(&expr) {
            Some(&index) => index,
            None => {
                let grad = self
                    .map
                    .grad(self.types, self.func.arena.ty(expr))
                    .map_err(|u| self.unsupported_type(u.0))?;
                let index = self.alloc(TapeField::Grad(grad));
                self.plan.grads.insert(expr, index);
                index
            }
        };
        self.plan.grad_loads.insert(expr, Load::Field(index));
        Ok(())
    }

    fn plan(&mut self, id: ExprId) -> Result<Value, Error> {
        match &self.func.arena[id] {
            Expr::Block { children } => {
                let mut last = Value::Void;
                for &child in children {
                    last = self.plan(child)?;
                }
                Ok(last)
            }
            Expr::Const(literal) => match literal {
                Literal::V128(_) => Err(Error::UnsupportedConstant {
                    func: self.func.name.clone(),
                    kind: literal.kind_name(),
                }),
                literal => Ok(Value::Const(*literal)),
            },
            Expr::LocalGet { local } => {
                let slot = *local as usize;
                if self.vars[slot] == Value::Param {
                    // First read: this get becomes the tape source for the
                    // binding, and every later read sees the same value.
                    self.vars[slot] = Value::Expr(id);
                }
                Ok(self.vars[slot])
            }
            Expr::LocalSet { local, value, tee } => {
                let planned = self.plan(*value)?;
                self.vars[*local as usize] = planned;
                Ok(if *tee { planned } else { Value::Void })
            }
            Expr::Binary { op, lhs, rhs } => {
                if op.is_float() {
                    match op.arith() {
                        // Neither operand's primal appears in the reverse rule.
                        Arith::Add | Arith::Sub => {
                            self.plan(*lhs)?;
                            self.plan(*rhs)?;
                        }
                        Arith::Mul => {
                            self.save(*lhs)?;
                            self.save(*rhs)?;
                        }
                        // The reverse rule needs the divisor and the quotient
                        // itself.
                        Arith::Div => {
                            self.plan(*lhs)?;
                            self.save(*rhs)?;
                            self.mark(id, Value::Expr(id))?;
                        }
                    }
                } else {
                    self.plan(*lhs)?;
                    self.plan(*rhs)?;
                }
                Ok(Value::Expr(id))
            }
            Expr::Call {
                target,
                operands,
                return_call,
            } => {
                if *return_call {
                    return Err(Error::TailCall {
                        func: self.func.name.clone(),
                    });
                }
                let callee = self
                    .functions
                    .iter()
                    .position(|f| f.name == *target)
                    .ok_or_else(|| Error::UnresolvedName {
                        func: self.func.name.clone(),
                        target: target.clone(),
                    })?;
                for &operand in operands {
                    self.plan(operand)?;
                    // Reference gradients cannot be conjured in the backward
                    // pass; tape them so the callee's backward call can take
                    // them as inputs.
                    if self.func.arena.ty(operand).is_ref() {
                        self.mark_grad(operand)?;
                    }
                }
                let index = self.alloc(TapeField::Call(callee));
                self.plan.calls.insert(id, index);
                Ok(Value::Expr(id))
            }
            Expr::StructNew { operands, .. } => {
                if !operands.is_empty() {
                    return Err(Error::InvalidInit {
                        func: self.func.name.clone(),
                        kind: "struct.new with operands",
                    });
                }
                Ok(Value::Expr(id))
            }
            Expr::ArrayNew { size, init, .. } => {
                if init.is_some() {
                    return Err(Error::InvalidInit {
                        func: self.func.name.clone(),
                        kind: "array.new with a non-default initializer",
                    });
                }
                self.plan(*size)?;
                Ok(Value::Expr(id))
            }
            Expr::ArrayGet { array, index } => {
                self.plan(*array)?;
                if TypeMap::differentiable(self.func.arena.ty(id)) {
                    self.mark_grad(*array)?;
                    self.save(*index)?;
                } else {
                    self.plan(*index)?;
                }
                Ok(Value::Expr(id))
            }
            Expr::ArraySet {
                array,
                index,
                value,
            } => {
                self.plan(*array)?;
                self.save(*index)?;
                self.plan(*value)?;
                let element_grad = self
                    .map
                    .grad(self.types, self.func.arena.ty(*value))
                    .map_err(|u| self.unsupported_type(u.0))?;
                if !element_grad.is_none() {
                    self.mark_grad(*array)?;
                    self.mark_grad(*value)?;
                    let index = self.alloc(TapeField::Grad(element_grad));
                    self.plan.sets.insert(id, index);
                }
                Ok(Value::Void)
            }
            Expr::ArrayLen { array } => {
                self.plan(*array)?;
                Ok(Value::Expr(id))
            }
            other => Err(Error::UnsupportedExpression {
                func: self.func.name.clone(),
                kind: other.kind_name(),
            }),
        }
    }
}
