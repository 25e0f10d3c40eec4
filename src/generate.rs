//! Emission of the paired forward and backward functions from a tape plan.
//!
//! The forward body mirrors the original, teeing planned values into tape
//! field locals and maintaining forward gradient objects for compound values.
//! Backward statements are collected in source order, one statement or block
//! per expression with block-internal order being execution order, and the
//! whole list is reversed when the backward body is assembled.

use crate::autodiff::Error;
use crate::gradient::TypeMap;
use crate::ir::expr::{Arith, BinaryOp, Expr, ExprId, LocalId};
use crate::ir::module::{Function, Types};
use crate::ir::types::{HeapId, HeapType, Type};
use crate::plan::{Load, TapeField, TapePlan};

/// Shared context for all function pairs of one transformation.
pub(crate) struct GenCtx {
    /// Tape struct heap id per original function index.
    pub tape_heaps: Vec<HeapId>,
    pub fwd_names: Vec<String>,
    pub bwd_names: Vec<String>,
}

/// Per-local generation state.
struct Var {
    ty: Type,
    /// Primal copy in the forward function.
    fwd: LocalId,
    /// In-forward gradient copy (materialized for compound gradients).
    grad: LocalId,
    /// Current accumulator in the backward function; renamed at each
    /// `local.set` to mimic SSA in the reversed body.
    bwd: LocalId,
}

/// What one translated expression hands to its consumer.
#[derive(Clone, Copy)]
struct Flow {
    fwd: ExprId,
    grad: LocalId,
    bwd: LocalId,
}

pub(crate) struct Generator<'a> {
    source: &'a Function,
    functions: &'a [Function],
    types: &'a mut Types,
    map: &'a mut TypeMap,
    plan: &'a TapePlan,
    ctx: &'a GenCtx,
    index: usize,
    fwd: Function,
    bwd: Function,
    vars: Vec<Var>,
    fwd_fields: Vec<LocalId>,
    bwd_fields: Vec<LocalId>,
    bwd_stmts: Vec<ExprId>,
    num_param_grads: usize,
    tape_param: LocalId,
    fwd_zero_f32: Option<LocalId>,
    fwd_zero_f64: Option<LocalId>,
    fwd_void: LocalId,
    bwd_void: LocalId,
}

fn float_op(arith: Arith, ty: &Type) -> BinaryOp {
    use BinaryOp::*;
    match ty {
        Type::F32 => match arith {
            Arith::Add => AddF32,
            Arith::Sub => SubF32,
            Arith::Mul => MulF32,
            Arith::Div => DivF32,
        },
        _ => match arith {
            Arith::Add => AddF64,
            Arith::Sub => SubF64,
            Arith::Mul => MulF64,
            Arith::Div => DivF64,
        },
    }
}

pub(crate) fn generate(
    source: &Function,
    functions: &[Function],
    types: &mut Types,
    map: &mut TypeMap,
    plan: &TapePlan,
    ctx: &GenCtx,
    index: usize,
) -> Result<(Function, Function), Error> {
    let name = &source.name;
    let grad_err = |u: crate::gradient::Unsupported| Error::UnsupportedType {
        func: name.clone(),
        kind: u.0,
    };

    let mut param_grads = Vec::new();
    for (i, param) in source.params.iter().enumerate() {
        let grad = map.grad(types, param).map_err(grad_err)?;
        if !grad.is_none() {
            param_grads.push((i, grad));
        }
    }
    let results_grad = map.grad(types, &source.results).map_err(grad_err)?;
    let tape_ty = Type::Ref(ctx.tape_heaps[index]);

    let mut fwd_params = source.params.clone();
    fwd_params.extend(param_grads.iter().map(|(_, g)| g.clone()));
    let mut fwd_results = source.results.components();
    fwd_results.extend(results_grad.components());
    fwd_results.push(tape_ty.clone());
    let mut fwd = Function::new(
        ctx.fwd_names[index].clone(),
        fwd_params,
        Type::tuple(fwd_results),
    );

    let mut bwd_params: Vec<Type> = param_grads.iter().map(|(_, g)| g.clone()).collect();
    let num_param_grads = bwd_params.len();
    bwd_params.extend(results_grad.components());
    bwd_params.push(tape_ty);
    let tape_param = (bwd_params.len() - 1) as LocalId;
    let bwd_results = Type::tuple(param_grads.iter().map(|(_, g)| g.clone()).collect());
    let mut bwd = Function::new(ctx.bwd_names[index].clone(), bwd_params, bwd_results);

    let fwd_void = fwd.add_var(Type::I32);
    let bwd_void = bwd.add_var(Type::I32);

    let mut vars = Vec::with_capacity(source.num_locals());
    for (i, param) in source.params.iter().enumerate() {
        let slot = param_grads.iter().position(|(p, _)| *p == i);
        vars.push(Var {
            ty: param.clone(),
            fwd: i as LocalId,
            grad: match slot {
                Some(k) => (source.params.len() + k) as LocalId,
                None => fwd_void,
            },
            bwd: match slot {
                Some(k) => k as LocalId,
                None => bwd_void,
            },
        });
    }
    for ty in source.vars() {
        let grad = map.grad(types, ty).map_err(grad_err)?;
        let fwd_local = fwd.add_var(ty.clone());
        let grad_local = if grad.is_none() {
            fwd_void
        } else {
            fwd.add_var(grad.clone())
        };
        let bwd_local = if grad.is_float() {
            bwd.add_var(grad)
        } else {
            bwd_void
        };
        vars.push(Var {
            ty: ty.clone(),
            fwd: fwd_local,
            grad: grad_local,
            bwd: bwd_local,
        });
    }

    let mut fwd_fields = Vec::with_capacity(plan.fields.len());
    let mut bwd_fields = Vec::with_capacity(plan.fields.len());
    for field in &plan.fields {
        let ty = field_ty(field, ctx);
        fwd_fields.push(fwd.add_var(ty.clone()));
        bwd_fields.push(bwd.add_var(ty));
    }

    let generator = Generator {
        source,
        functions,
        types,
        map,
        plan,
        ctx,
        index,
        fwd,
        bwd,
        vars,
        fwd_fields,
        bwd_fields,
        bwd_stmts: Vec::new(),
        num_param_grads,
        tape_param,
        fwd_zero_f32: None,
        fwd_zero_f64: None,
        fwd_void,
        bwd_void,
    };
    generator.finish()
}

fn field_ty(field: &TapeField, ctx: &GenCtx) -> Type {
    match field {
        TapeField::Value(ty) | TapeField::Grad(ty) => ty.clone(),
        TapeField::Call(callee) => Type::Ref(ctx.tape_heaps[*callee]),
    }
}

impl Generator<'_> {
    fn internal(&self, message: &'static str) -> Error {
        Error::InternalInvariant {
            func: self.source.name.clone(),
            message,
        }
    }

    fn grad_of(&mut self, ty: &Type) -> Result<Type, Error> {
        self.map
            .grad(self.types, ty)
            .map_err(|u| Error::UnsupportedType {
                func: self.source.name.clone(),
                kind: u.0,
            })
    }

    fn grad_heap_of(&mut self, heap: HeapId) -> Result<HeapId, Error> {
        self.map
            .grad_heap(self.types, heap)
            .map_err(|u| Error::UnsupportedType {
                func: self.source.name.clone(),
                kind: u.0,
            })
    }

    /// The zero-initialized sentinel carrying the forward gradient of values
    /// that cannot have one.
    fn fwd_zero(&mut self, ty: &Type) -> LocalId {
        match ty {
            Type::F32 => match self.fwd_zero_f32 {
                Some(local) => local,
                None => {
                    let local = self.fwd.add_var(Type::F32);
                    self.fwd_zero_f32 = Some(local);
                    local
                }
            },
            Type::F64 => match self.fwd_zero_f64 {
                Some(local) => local,
                None => {
                    let local = self.fwd.add_var(Type::F64);
                    self.fwd_zero_f64 = Some(local);
                    local
                }
            },
            _ => self.fwd_void,
        }
    }

    /// Backward-pass read of a planned primal value.
    fn load(&mut self, at: ExprId) -> Result<ExprId, Error> {
        match self.plan.loads.get(&at) {
            Some(Load::Const(literal)) => Ok(self.bwd.constant(*literal)),
            Some(Load::Field(index)) => Ok(self.bwd.local_get(self.bwd_fields[*index as usize])),
            None => Err(self.internal("use of a primal the planner did not record")),
        }
    }

    /// Backward-function local holding a reloaded gradient object.
    fn grad_field_local(&self, at: ExprId) -> Result<LocalId, Error> {
        match self.plan.grad_loads.get(&at) {
            Some(Load::Field(index)) => Ok(self.bwd_fields[*index as usize]),
            _ => Err(self.internal("use of a gradient the planner did not record")),
        }
    }

    /// `local += value` in the backward function.
    fn accum(&mut self, local: LocalId, value: ExprId, ty: &Type) -> ExprId {
        let current = self.bwd.local_get(local);
        let sum = self.bwd.binary(float_op(Arith::Add, ty), current, value);
        self.bwd.local_set(local, sum)
    }

    /// `local -= value` in the backward function.
    fn deccum(&mut self, local: LocalId, value: ExprId, ty: &Type) -> ExprId {
        let current = self.bwd.local_get(local);
        let difference = self.bwd.binary(float_op(Arith::Sub, ty), current, value);
        self.bwd.local_set(local, difference)
    }

    fn emit(&mut self, id: ExprId) -> Result<Flow, Error> {
        let flow = self.emit_inner(id)?;
        self.wrap_saves(id, flow)
    }

    /// Tee the result (and its forward gradient) into the tape field locals
    /// the planner assigned to this expression.
    fn wrap_saves(&mut self, id: ExprId, flow: Flow) -> Result<Flow, Error> {
        let store = self.plan.stores.get(&id).copied();
        let grad = self.plan.grads.get(&id).copied();
        match (store, grad) {
            (None, None) => Ok(flow),
            (Some(index), None) => {
                let fwd = self
                    .fwd
                    .local_tee(self.fwd_fields[index as usize], flow.fwd);
                Ok(Flow { fwd, ..flow })
            }
            (store, Some(grad_index)) => {
                let value_local = match store {
                    Some(index) => self.fwd_fields[index as usize],
                    None => {
                        let ty = self.source.arena.ty(id).clone();
                        self.fwd.add_var(ty)
                    }
                };
                let set_value = self.fwd.local_set(value_local, flow.fwd);
                let grad_get = self.fwd.local_get(flow.grad);
                let set_grad = self
                    .fwd
                    .local_set(self.fwd_fields[grad_index as usize], grad_get);
                let get_back = self.fwd.local_get(value_local);
                let fwd = self.fwd.block(vec![set_value, set_grad, get_back]);
                Ok(Flow { fwd, ..flow })
            }
        }
    }

    fn emit_inner(&mut self, id: ExprId) -> Result<Flow, Error> {
        let expr = self.source.arena[id].clone();
        match expr {
            Expr::Block { children } => {
                let mut stmts = Vec::with_capacity(children.len());
                let mut last = None;
                for child in children {
                    let flow = self.emit(child)?;
                    stmts.push(flow.fwd);
                    last = Some(flow);
                }
                let fwd = self.fwd.block(stmts);
                Ok(match last {
                    Some(flow) => Flow { fwd, ..flow },
                    None => Flow {
                        fwd,
                        grad: self.fwd_void,
                        bwd: self.bwd_void,
                    },
                })
            }
            Expr::Const(literal) => {
                let ty = literal.ty();
                let fwd = self.fwd.constant(literal);
                let grad = self.fwd_zero(&ty);
                let bwd = match self.plan.grad_loads.get(&id) {
                    Some(Load::Field(index)) => {
                        if !literal.is_zero() {
                            return Err(Error::NonZeroGradientConstant {
                                func: self.source.name.clone(),
                            });
                        }
                        self.bwd_fields[*index as usize]
                    }
                    Some(Load::Const(_)) => {
                        return Err(self.internal("constant-kind gradient load"));
                    }
                    None => {
                        if ty.is_float() {
                            self.bwd.add_var(ty)
                        } else {
                            self.bwd_void
                        }
                    }
                };
                Ok(Flow { fwd, grad, bwd })
            }
            Expr::LocalGet { local } => {
                let var = &self.vars[local as usize];
                let (fwd_local, grad, bwd) = (var.fwd, var.grad, var.bwd);
                let fwd = self.fwd.local_get(fwd_local);
                Ok(Flow { fwd, grad, bwd })
            }
            Expr::LocalSet { local, value, tee } => self.emit_local_set(local, value, tee),
            Expr::Binary { op, lhs, rhs } => self.emit_binary(id, op, lhs, rhs),
            Expr::Call {
                target,
                operands,
                return_call,
            } => {
                if return_call {
                    return Err(Error::TailCall {
                        func: self.source.name.clone(),
                    });
                }
                self.emit_call(id, &target, &operands)
            }
            Expr::StructNew { heap, .. } => {
                let grad_heap = self.grad_heap_of(heap)?;
                let grad_local = self.fwd.add_var(Type::Ref(grad_heap));
                let new_grad = self.fwd.struct_new(grad_heap, Vec::new());
                let set_grad = self.fwd.local_set(grad_local, new_grad);
                let value = self.fwd.struct_new(heap, Vec::new());
                let fwd = self.fwd.block(vec![set_grad, value]);
                Ok(Flow {
                    fwd,
                    grad: grad_local,
                    bwd: self.bwd_void,
                })
            }
            Expr::ArrayNew { heap, size, .. } => self.emit_array_new(heap, size),
            Expr::ArrayGet { array, index } => self.emit_array_get(id, array, index),
            Expr::ArraySet {
                array,
                index,
                value,
            } => self.emit_array_set(id, array, index, value),
            Expr::ArrayLen { array } => {
                let a = self.emit(array)?;
                let fwd = self.fwd.array_len(a.fwd);
                Ok(Flow {
                    fwd,
                    grad: self.fwd_void,
                    bwd: self.bwd_void,
                })
            }
            other => Err(Error::UnsupportedExpression {
                func: self.source.name.clone(),
                kind: other.kind_name(),
            }),
        }
    }

    fn emit_local_set(&mut self, local: LocalId, value: ExprId, tee: bool) -> Result<Flow, Error> {
        let v = self.emit(value)?;
        let var_ty = self.vars[local as usize].ty.clone();
        let grad = self.grad_of(&var_ty)?;
        let (var_fwd, var_grad) = {
            let var = &self.vars[local as usize];
            (var.fwd, var.grad)
        };
        let fwd = if grad.is_none() {
            if tee {
                self.fwd.local_tee(var_fwd, v.fwd)
            } else {
                self.fwd.local_set(var_fwd, v.fwd)
            }
        } else {
            let set_primal = self.fwd.local_set(var_fwd, v.fwd);
            let grad_get = self.fwd.local_get(v.grad);
            let set_grad = self.fwd.local_set(var_grad, grad_get);
            if tee {
                let get_back = self.fwd.local_get(var_fwd);
                self.fwd.block(vec![set_primal, set_grad, get_back])
            } else {
                self.fwd.block(vec![set_primal, set_grad])
            }
        };
        if grad.is_float() {
            // New SSA name for the binding; the pushed statement hands the
            // accumulated gradient back to the right-hand side on reversal.
            let new_bwd = self.bwd.add_var(grad.clone());
            let handoff = self.bwd.local_get(new_bwd);
            let stmt = self.accum(v.bwd, handoff, &grad);
            self.bwd_stmts.push(stmt);
            self.vars[local as usize].bwd = new_bwd;
        }
        if tee {
            Ok(Flow {
                fwd,
                grad: var_grad,
                bwd: self.vars[local as usize].bwd,
            })
        } else {
            Ok(Flow {
                fwd,
                grad: self.fwd_void,
                bwd: self.bwd_void,
            })
        }
    }

    fn emit_binary(
        &mut self,
        id: ExprId,
        op: BinaryOp,
        lhs: ExprId,
        rhs: ExprId,
    ) -> Result<Flow, Error> {
        let l = self.emit(lhs)?;
        let r = self.emit(rhs)?;
        let fwd = self.fwd.binary(op, l.fwd, r.fwd);
        if !op.is_float() {
            return Ok(Flow {
                fwd,
                grad: self.fwd_void,
                bwd: self.bwd_void,
            });
        }
        let ty = op.ty();
        let bwd = self.bwd.add_var(ty.clone());
        let stmt = match op.arith() {
            Arith::Add => {
                let dz_l = self.bwd.local_get(bwd);
                let into_l = self.accum(l.bwd, dz_l, &ty);
                let dz_r = self.bwd.local_get(bwd);
                let into_r = self.accum(r.bwd, dz_r, &ty);
                self.bwd.block(vec![into_l, into_r])
            }
            Arith::Sub => {
                let dz_l = self.bwd.local_get(bwd);
                let into_l = self.accum(l.bwd, dz_l, &ty);
                let dz_r = self.bwd.local_get(bwd);
                let into_r = self.deccum(r.bwd, dz_r, &ty);
                self.bwd.block(vec![into_l, into_r])
            }
            Arith::Mul => {
                let dz_l = self.bwd.local_get(bwd);
                let rhs_primal = self.load(rhs)?;
                let dl = self.bwd.binary(float_op(Arith::Mul, &ty), dz_l, rhs_primal);
                let into_l = self.accum(l.bwd, dl, &ty);
                let dz_r = self.bwd.local_get(bwd);
                let lhs_primal = self.load(lhs)?;
                let dr = self.bwd.binary(float_op(Arith::Mul, &ty), dz_r, lhs_primal);
                let into_r = self.accum(r.bwd, dr, &ty);
                self.bwd.block(vec![into_l, into_r])
            }
            Arith::Div => {
                // dx1 = dz / y; dx += dx1; dy -= dx1 * z
                let dx1 = self.bwd.add_var(ty.clone());
                let dz = self.bwd.local_get(bwd);
                let divisor = self.load(rhs)?;
                let quotient = self.bwd.binary(float_op(Arith::Div, &ty), dz, divisor);
                let set_dx1 = self.bwd.local_set(dx1, quotient);
                let dx1_l = self.bwd.local_get(dx1);
                let into_l = self.accum(l.bwd, dx1_l, &ty);
                let dx1_r = self.bwd.local_get(dx1);
                let self_primal = self.load(id)?;
                let dr = self
                    .bwd
                    .binary(float_op(Arith::Mul, &ty), dx1_r, self_primal);
                let into_r = self.deccum(r.bwd, dr, &ty);
                self.bwd.block(vec![set_dx1, into_l, into_r])
            }
        };
        self.bwd_stmts.push(stmt);
        Ok(Flow {
            fwd,
            grad: self.fwd_zero(&ty),
            bwd,
        })
    }

    fn emit_call(&mut self, id: ExprId, target: &str, operands: &[ExprId]) -> Result<Flow, Error> {
        let functions = self.functions;
        let callee_index = functions
            .iter()
            .position(|f| f.name == target)
            .ok_or_else(|| Error::UnresolvedName {
                func: self.source.name.clone(),
                target: target.to_owned(),
            })?;
        let callee_params = functions[callee_index].params.clone();
        let callee_results = functions[callee_index].results.clone();

        let mut flows = Vec::with_capacity(operands.len());
        for &operand in operands {
            flows.push(self.emit(operand)?);
        }
        let mut operand_grads = Vec::with_capacity(callee_params.len());
        for param in &callee_params {
            operand_grads.push(self.grad_of(param)?);
        }
        let results_grad = self.grad_of(&callee_results)?;

        // Forward: call the callee's forward pass with zero input gradients
        // (gradient objects are passed through for reference operands).
        let mut args: Vec<ExprId> = flows.iter().map(|f| f.fwd).collect();
        for (flow, grad) in flows.iter().zip(&operand_grads) {
            match grad {
                Type::None => {}
                Type::F32 => args.push(self.fwd.f32_const(0.0)),
                Type::F64 => args.push(self.fwd.f64_const(0.0)),
                _ => args.push(self.fwd.local_get(flow.grad)),
            }
        }
        let callee_tape = Type::Ref(self.ctx.tape_heaps[callee_index]);
        let primal_n = callee_results.component_count();
        let grad_n = results_grad.component_count();
        let total = primal_n + grad_n + 1;
        let mut result_comps = callee_results.components();
        result_comps.extend(results_grad.components());
        result_comps.push(callee_tape);
        let call_ty = Type::tuple(result_comps);
        let fwd_name = self.ctx.fwd_names[callee_index].clone();
        let call = self.fwd.call(fwd_name, args, call_ty.clone());

        let tuple_local = self.fwd.add_var(call_ty);
        let mut stmts = vec![self.fwd.local_set(tuple_local, call)];
        let field = *self
            .plan
            .calls
            .get(&id)
            .ok_or_else(|| self.internal("call site the planner did not record"))?
            as usize;
        let tape_value = self.extract_fwd(tuple_local, total, primal_n + grad_n);
        stmts.push(self.fwd.local_set(self.fwd_fields[field], tape_value));
        let grad_local = if grad_n == 0 {
            self.fwd_void
        } else {
            let grad_local = self.fwd.add_var(results_grad.clone());
            let value = if grad_n == 1 {
                self.extract_fwd(tuple_local, total, primal_n)
            } else {
                let mut parts = Vec::with_capacity(grad_n);
                for i in 0..grad_n {
                    parts.push(self.extract_fwd(tuple_local, total, primal_n + i));
                }
                self.fwd.tuple_make(parts)
            };
            stmts.push(self.fwd.local_set(grad_local, value));
            grad_local
        };
        if primal_n == 1 {
            let value = self.extract_fwd(tuple_local, total, 0);
            stmts.push(value);
        } else if primal_n > 1 {
            let mut parts = Vec::with_capacity(primal_n);
            for i in 0..primal_n {
                parts.push(self.extract_fwd(tuple_local, total, i));
            }
            let value = self.fwd.tuple_make(parts);
            stmts.push(value);
        }
        let fwd = self.fwd.block(stmts);

        // Backward: invoke the callee's backward pass with zero input
        // gradients and add the returned components into the operand
        // accumulators. Zero seeds keep operands sharing one accumulator
        // (f(x, x)) from clobbering each other.
        let bwd_acc = if results_grad.is_float() {
            self.bwd.add_var(results_grad.clone())
        } else {
            self.bwd_void
        };
        let mut bargs = Vec::new();
        for (grad, &operand) in operand_grads.iter().zip(operands) {
            match grad {
                Type::None => {}
                Type::F32 => bargs.push(self.bwd.f32_const(0.0)),
                Type::F64 => bargs.push(self.bwd.f64_const(0.0)),
                Type::Ref(heap) => {
                    // The operand's gradient object was taped at plan time.
                    let arg = match self.plan.grad_loads.get(&operand) {
                        Some(Load::Field(index)) => {
                            self.bwd.local_get(self.bwd_fields[*index as usize])
                        }
                        _ => self.bwd.ref_null(*heap),
                    };
                    bargs.push(arg);
                }
                _ => return Err(self.internal("unexpected operand gradient type")),
            }
        }
        for component in results_grad.components() {
            if component.is_float() {
                if bwd_acc == self.bwd_void {
                    return Err(self.internal("tuple result gradients are unsupported"));
                }
                bargs.push(self.bwd.local_get(bwd_acc));
            } else if let Type::Ref(heap) = component {
                let arg = match self.plan.grad_loads.get(&id) {
                    Some(Load::Field(index)) => self.bwd.local_get(self.bwd_fields[*index as usize]),
                    _ => self.bwd.ref_null(heap),
                };
                bargs.push(arg);
            } else {
                return Err(self.internal("unexpected result gradient type"));
            }
        }
        let tape_get = self.bwd.local_get(self.bwd_fields[field]);
        bargs.push(tape_get);
        let bwd_result_ty = Type::tuple(
            operand_grads
                .iter()
                .filter(|g| !g.is_none())
                .cloned()
                .collect(),
        );
        let bwd_name = self.ctx.bwd_names[callee_index].clone();
        let bcall = self.bwd.call(bwd_name, bargs, bwd_result_ty.clone());
        let mut bstmts = Vec::new();
        if bwd_result_ty.is_none() {
            bstmts.push(bcall);
        } else {
            let result_local = self.bwd.add_var(bwd_result_ty.clone());
            bstmts.push(self.bwd.local_set(result_local, bcall));
            let n = bwd_result_ty.component_count();
            let mut position = 0u32;
            for (flow, grad) in flows.iter().zip(&operand_grads) {
                match grad {
                    Type::None => {}
                    Type::F32 | Type::F64 => {
                        let value = if n == 1 {
                            self.bwd.local_get(result_local)
                        } else {
                            let tuple = self.bwd.local_get(result_local);
                            self.bwd.tuple_extract(tuple, position)
                        };
                        bstmts.push(self.accum(flow.bwd, value, grad));
                        position += 1;
                    }
                    _ => {
                        // Reference gradients are mutated in place.
                        position += 1;
                    }
                }
            }
        }
        let stmt = self.bwd.block(bstmts);
        self.bwd_stmts.push(stmt);
        Ok(Flow {
            fwd,
            grad: grad_local,
            bwd: bwd_acc,
        })
    }

    fn extract_fwd(&mut self, tuple_local: LocalId, total: usize, position: usize) -> ExprId {
        if total == 1 {
            self.fwd.local_get(tuple_local)
        } else {
            let tuple = self.fwd.local_get(tuple_local);
            self.fwd.tuple_extract(tuple, position as u32)
        }
    }

    fn emit_array_new(&mut self, heap: HeapId, size: ExprId) -> Result<Flow, Error> {
        let s = self.emit(size)?;
        let grad_heap = self.grad_heap_of(heap)?;
        let len_local = self.fwd.add_var(Type::I32);
        let grad_local = self.fwd.add_var(Type::Ref(grad_heap));
        let set_len = self.fwd.local_set(len_local, s.fwd);
        // A unit element gradient collapses the whole array to an empty
        // struct; otherwise mirror the primal allocation length.
        let grad_is_struct = matches!(self.types.get(grad_heap), HeapType::Struct(_));
        let grad_new = if grad_is_struct {
            self.fwd.struct_new(grad_heap, Vec::new())
        } else {
            let len = self.fwd.local_get(len_local);
            self.fwd.array_new(grad_heap, len, None)
        };
        let set_grad = self.fwd.local_set(grad_local, grad_new);
        let len = self.fwd.local_get(len_local);
        let value = self.fwd.array_new(heap, len, None);
        let fwd = self.fwd.block(vec![set_len, set_grad, value]);
        Ok(Flow {
            fwd,
            grad: grad_local,
            bwd: self.bwd_void,
        })
    }

    fn emit_array_get(&mut self, id: ExprId, array: ExprId, index: ExprId) -> Result<Flow, Error> {
        let element = self.source.arena.ty(id).clone();
        let a = self.emit(array)?;
        if TypeMap::differentiable(&element) {
            let i = self.emit(index)?;
            let fwd = self.fwd.array_get(a.fwd, i.fwd, element.clone());
            let bwd = self.bwd.add_var(element.clone());
            // grad_array[index] += dz
            let grad_array = self.grad_field_local(array)?;
            let target = self.bwd.local_get(grad_array);
            let target_index = self.load(index)?;
            let source_array = self.bwd.local_get(grad_array);
            let source_index = self.load(index)?;
            let current = self.bwd.array_get(source_array, source_index, element.clone());
            let dz = self.bwd.local_get(bwd);
            let sum = self.bwd.binary(float_op(Arith::Add, &element), current, dz);
            let stmt = self.bwd.array_set(target, target_index, sum);
            self.bwd_stmts.push(stmt);
            Ok(Flow {
                fwd,
                grad: self.fwd_zero(&element),
                bwd,
            })
        } else {
            let grad = self.grad_of(&element)?;
            let i = self.emit(index)?;
            if grad.is_none() {
                let fwd = self.fwd.array_get(a.fwd, i.fwd, element);
                Ok(Flow {
                    fwd,
                    grad: self.fwd_void,
                    bwd: self.bwd_void,
                })
            } else {
                // Structural gradient: read the gradient array at the same
                // (teed) index. Adjoints flow through the shared object.
                let array_ty = self.source.arena.ty(array).clone();
                let array_local = self.fwd.add_var(array_ty);
                let index_local = self.fwd.add_var(Type::I32);
                let grad_local = self.fwd.add_var(grad.clone());
                let set_array = self.fwd.local_set(array_local, a.fwd);
                let set_index = self.fwd.local_set(index_local, i.fwd);
                let grad_source = self.fwd.local_get(a.grad);
                let grad_index = self.fwd.local_get(index_local);
                let grad_read = self.fwd.array_get(grad_source, grad_index, grad);
                let set_grad = self.fwd.local_set(grad_local, grad_read);
                let primal_array = self.fwd.local_get(array_local);
                let primal_index = self.fwd.local_get(index_local);
                let value = self.fwd.array_get(primal_array, primal_index, element);
                let fwd = self.fwd.block(vec![set_array, set_index, set_grad, value]);
                Ok(Flow {
                    fwd,
                    grad: grad_local,
                    bwd: self.bwd_void,
                })
            }
        }
    }

    fn emit_array_set(
        &mut self,
        id: ExprId,
        array: ExprId,
        index: ExprId,
        value: ExprId,
    ) -> Result<Flow, Error> {
        let a = self.emit(array)?;
        let i = self.emit(index)?;
        let v = self.emit(value)?;
        let element = self.source.arena.ty(value).clone();
        let grad = self.grad_of(&element)?;
        if grad.is_none() {
            let fwd = self.fwd.array_set(a.fwd, i.fwd, v.fwd);
            return Ok(Flow {
                fwd,
                grad: self.fwd_void,
                bwd: self.bwd_void,
            });
        }
        let field = *self
            .plan
            .sets
            .get(&id)
            .ok_or_else(|| self.internal("array.set the planner did not record"))?
            as usize;
        let array_ty = self.source.arena.ty(array).clone();
        let array_local = self.fwd.add_var(array_ty);
        let index_local = self.fwd.add_var(Type::I32);
        let value_local = self.fwd.add_var(element.clone());
        let set_array = self.fwd.local_set(array_local, a.fwd);
        let set_index = self.fwd.local_set(index_local, i.fwd);
        let set_value = self.fwd.local_set(value_local, v.fwd);
        // Save the overwritten element's gradient before the store.
        let grad_array = self.fwd.local_get(a.grad);
        let at = self.fwd.local_get(index_local);
        let old = self.fwd.array_get(grad_array, at, grad.clone());
        let save_old = self.fwd.local_set(self.fwd_fields[field], old);
        let primal_array = self.fwd.local_get(array_local);
        let primal_index = self.fwd.local_get(index_local);
        let primal_value = self.fwd.local_get(value_local);
        let store = self.fwd.array_set(primal_array, primal_index, primal_value);
        let grad_array = self.fwd.local_get(a.grad);
        let grad_index = self.fwd.local_get(index_local);
        let grad_value = self.fwd.local_get(v.grad);
        let overwrite = self.fwd.array_set(grad_array, grad_index, grad_value);
        let fwd = self.fwd.block(vec![
            set_array, set_index, set_value, save_old, store, overwrite,
        ]);
        // Backward: collect the slot into the value's accumulator, then
        // restore the slot to its pre-store gradient.
        let grad_array_local = self.grad_field_local(array)?;
        let mut stmts = Vec::new();
        if grad.is_float() {
            let source = self.bwd.local_get(grad_array_local);
            let source_index = self.load(index)?;
            let slot = self.bwd.array_get(source, source_index, grad.clone());
            stmts.push(self.accum(v.bwd, slot, &grad));
        }
        let target = self.bwd.local_get(grad_array_local);
        let target_index = self.load(index)?;
        let saved = self.bwd.local_get(self.bwd_fields[field]);
        stmts.push(self.bwd.array_set(target, target_index, saved));
        let stmt = self.bwd.block(stmts);
        self.bwd_stmts.push(stmt);
        Ok(Flow {
            fwd,
            grad: self.fwd_void,
            bwd: self.bwd_void,
        })
    }

    fn finish(mut self) -> Result<(Function, Function), Error> {
        let body = self.source.body.ok_or_else(|| Error::MissingBody {
            func: self.source.name.clone(),
        })?;
        let flow = self.emit(body)?;

        // Forward body: primal result, result gradients, then the tape.
        let results = self.source.results.clone();
        let results_grad = self.grad_of(&results)?;
        let mut stmts = Vec::new();
        let mut components = Vec::new();
        if results.is_none() {
            stmts.push(flow.fwd);
        } else {
            let out = self.fwd.add_var(results.clone());
            stmts.push(self.fwd.local_set(out, flow.fwd));
            components.push(self.fwd.local_get(out));
        }
        if !results_grad.is_none() {
            components.push(self.fwd.local_get(flow.grad));
        }
        let mut field_gets = Vec::with_capacity(self.fwd_fields.len());
        for i in 0..self.fwd_fields.len() {
            let local = self.fwd_fields[i];
            field_gets.push(self.fwd.local_get(local));
        }
        let tape = self.fwd.struct_new(self.ctx.tape_heaps[self.index], field_gets);
        components.push(tape);
        let result = if components.len() == 1 {
            components.pop().unwrap()
        } else {
            self.fwd.tuple_make(components)
        };
        stmts.push(result);
        let fwd_body = self.fwd.block(stmts);
        self.fwd.set_body(fwd_body);

        // Backward body: reload tape fields, seed the result gradient,
        // replay the statement list in reverse, return parameter gradients.
        let mut bstmts = Vec::new();
        let tape_heap = self.ctx.tape_heaps[self.index];
        for i in 0..self.plan.fields.len() {
            let ty = field_ty(&self.plan.fields[i], self.ctx);
            let object = self.bwd.local_get(self.tape_param);
            let value = self.bwd.struct_get(tape_heap, i as u32, object, ty);
            bstmts.push(self.bwd.local_set(self.bwd_fields[i], value));
        }
        let mut seed_param = self.num_param_grads as LocalId;
        for component in results_grad.components() {
            if component.is_float() {
                let seed = self.bwd.local_get(seed_param);
                bstmts.push(self.accum(flow.bwd, seed, &component));
            }
            seed_param += 1;
        }
        let mut tail = std::mem::take(&mut self.bwd_stmts);
        tail.reverse();
        bstmts.extend(tail);
        let mut returns = Vec::new();
        let params = self.source.params.clone();
        for (i, param) in params.iter().enumerate() {
            let grad = self.grad_of(param)?;
            if !grad.is_none() {
                returns.push(self.bwd.local_get(self.vars[i].bwd));
            }
        }
        if !returns.is_empty() {
            let value = if returns.len() == 1 {
                returns.pop().unwrap()
            } else {
                self.bwd.tuple_make(returns)
            };
            bstmts.push(value);
        }
        let bwd_body = self.bwd.block(bstmts);
        self.bwd.set_body(bwd_body);

        Ok((self.fwd, self.bwd))
    }
}
