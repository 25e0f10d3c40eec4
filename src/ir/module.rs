use crate::ir::expr::{Arena, BinaryOp, Expr, ExprId, Literal, LocalId};
use crate::ir::types::{Features, HeapId, HeapType, Type};

/// A function: named, with flat scalar/ref params, a (possibly tuple) result
/// type, declared vars, and a body owned by the function's expression arena.
///
/// Locals are indexed params-first, then vars.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub results: Type,
    vars: Vec<Type>,
    pub body: Option<ExprId>,
    pub arena: Arena,
}

impl Function {
    #[must_use]
    pub fn new(name: impl Into<String>, params: Vec<Type>, results: Type) -> Self {
        Self {
            name: name.into(),
            params,
            results,
            vars: Vec::new(),
            body: None,
            arena: Arena::new(),
        }
    }

    /// Declare a new var; returns its local index.
    pub fn add_var(&mut self, ty: Type) -> LocalId {
        let index = (self.params.len() + self.vars.len()) as LocalId;
        self.vars.push(ty);
        index
    }

    #[must_use]
    pub fn vars(&self) -> &[Type] {
        &self.vars
    }

    #[must_use]
    pub fn local_ty(&self, local: LocalId) -> &Type {
        let local = local as usize;
        if local < self.params.len() {
            &self.params[local]
        } else {
            &self.vars[local - self.params.len()]
        }
    }

    #[must_use]
    pub fn num_locals(&self) -> usize {
        self.params.len() + self.vars.len()
    }

    pub fn set_body(&mut self, body: ExprId) {
        self.body = Some(body);
    }

    pub fn block(&mut self, children: Vec<ExprId>) -> ExprId {
        let ty = match children.last() {
            Some(&last) => self.arena.ty(last).clone(),
            None => Type::None,
        };
        self.arena.push(Expr::Block { children }, ty)
    }

    pub fn constant(&mut self, literal: Literal) -> ExprId {
        let ty = literal.ty();
        self.arena.push(Expr::Const(literal), ty)
    }

    pub fn f32_const(&mut self, value: f32) -> ExprId {
        self.constant(Literal::F32(value))
    }

    pub fn f64_const(&mut self, value: f64) -> ExprId {
        self.constant(Literal::F64(value))
    }

    pub fn i32_const(&mut self, value: i32) -> ExprId {
        self.constant(Literal::I32(value))
    }

    pub fn i64_const(&mut self, value: i64) -> ExprId {
        self.constant(Literal::I64(value))
    }

    pub fn local_get(&mut self, local: LocalId) -> ExprId {
        let ty = self.local_ty(local).clone();
        self.arena.push(Expr::LocalGet { local }, ty)
    }

    pub fn local_set(&mut self, local: LocalId, value: ExprId) -> ExprId {
        self.arena.push(
            Expr::LocalSet {
                local,
                value,
                tee: false,
            },
            Type::None,
        )
    }

    pub fn local_tee(&mut self, local: LocalId, value: ExprId) -> ExprId {
        let ty = self.local_ty(local).clone();
        self.arena.push(
            Expr::LocalSet {
                local,
                value,
                tee: true,
            },
            ty,
        )
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.arena.push(Expr::Binary { op, lhs, rhs }, op.ty())
    }

    /// A direct call; `results` is the callee's declared result type.
    pub fn call(&mut self, target: impl Into<String>, operands: Vec<ExprId>, results: Type) -> ExprId {
        self.arena.push(
            Expr::Call {
                target: target.into(),
                operands,
                return_call: false,
            },
            results,
        )
    }

    pub fn return_call(
        &mut self,
        target: impl Into<String>,
        operands: Vec<ExprId>,
        results: Type,
    ) -> ExprId {
        self.arena.push(
            Expr::Call {
                target: target.into(),
                operands,
                return_call: true,
            },
            results,
        )
    }

    pub fn struct_new(&mut self, heap: HeapId, operands: Vec<ExprId>) -> ExprId {
        self.arena.push(Expr::StructNew { heap, operands }, Type::Ref(heap))
    }

    /// `ty` is the field's value type (the arena stores no heap-type table).
    pub fn struct_get(&mut self, heap: HeapId, field: u32, object: ExprId, ty: Type) -> ExprId {
        self.arena.push(
            Expr::StructGet {
                heap,
                field,
                object,
            },
            ty,
        )
    }

    pub fn array_new(&mut self, heap: HeapId, size: ExprId, init: Option<ExprId>) -> ExprId {
        self.arena
            .push(Expr::ArrayNew { heap, size, init }, Type::Ref(heap))
    }

    /// `ty` is the element's value type.
    pub fn array_get(&mut self, array: ExprId, index: ExprId, ty: Type) -> ExprId {
        self.arena.push(Expr::ArrayGet { array, index }, ty)
    }

    pub fn array_set(&mut self, array: ExprId, index: ExprId, value: ExprId) -> ExprId {
        self.arena
            .push(Expr::ArraySet { array, index, value }, Type::None)
    }

    pub fn array_len(&mut self, array: ExprId) -> ExprId {
        self.arena.push(Expr::ArrayLen { array }, Type::I32)
    }

    pub fn ref_null(&mut self, heap: HeapId) -> ExprId {
        self.arena.push(Expr::RefNull { heap }, Type::Ref(heap))
    }

    pub fn tuple_make(&mut self, operands: Vec<ExprId>) -> ExprId {
        let ty = Type::Tuple(
            operands
                .iter()
                .map(|&operand| self.arena.ty(operand).clone())
                .collect(),
        );
        self.arena.push(Expr::TupleMake { operands }, ty)
    }

    pub fn tuple_extract(&mut self, tuple: ExprId, index: u32) -> ExprId {
        let ty = match self.arena.ty(tuple) {
            Type::Tuple(components) => components[index as usize].clone(),
            other => other.clone(),
        };
        self.arena.push(Expr::TupleExtract { tuple, index }, ty)
    }
}

/// The module's heap-type table, grouped into recursion groups.
///
/// Plain additions form singleton groups; [`TypeBuilder`] commits several
/// mutually referential types as one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Types {
    heap_types: Vec<HeapType>,
    rec_groups: Vec<(u32, u32)>,
}

impl Types {
    /// Add a heap type in its own recursion group.
    pub fn add(&mut self, ty: HeapType) -> HeapId {
        let id = HeapId(self.heap_types.len() as u32);
        self.heap_types.push(ty);
        self.rec_groups.push((id.0, 1));
        id
    }

    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapType {
        &self.heap_types[id.0 as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap_types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap_types.is_empty()
    }

    /// `(start, len)` spans over the table, in declaration order.
    #[must_use]
    pub fn rec_groups(&self) -> &[(u32, u32)] {
        &self.rec_groups
    }

    /// Start building `count` heap types that may reference each other.
    ///
    /// [`TypeBuilder::slot`] ids are valid immediately, before the types they
    /// denote are defined, so cyclic references can be written up front.
    pub fn builder(&mut self, count: usize) -> TypeBuilder<'_> {
        let start = self.heap_types.len() as u32;
        TypeBuilder {
            types: self,
            start,
            slots: vec![None; count],
        }
    }
}

/// Builds one recursion group of mutually referential heap types.
#[derive(Debug)]
pub struct TypeBuilder<'a> {
    types: &'a mut Types,
    start: u32,
    slots: Vec<Option<HeapType>>,
}

impl TypeBuilder<'_> {
    /// The id slot `index` will occupy once [`build`](Self::build) commits.
    #[must_use]
    pub fn slot(&self, index: usize) -> HeapId {
        HeapId(self.start + index as u32)
    }

    pub fn define(&mut self, index: usize, ty: HeapType) {
        self.slots[index] = Some(ty);
    }

    /// Commit every slot as a single recursion group.
    ///
    /// Every slot must have been defined.
    pub fn build(self) -> Vec<HeapId> {
        let count = self.slots.len() as u32;
        let ids = (0..count).map(|i| HeapId(self.start + i)).collect();
        for slot in self.slots {
            let ty = slot.expect("type builder slot left undefined");
            self.types.heap_types.push(ty);
        }
        if count > 0 {
            self.types.rec_groups.push((self.start, count));
        }
        ids
    }
}

/// An exported function, by internal name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub func: String,
}

/// A WebAssembly module in builder form.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub features: Features,
    pub types: Types,
    pub functions: Vec<Function>,
    pub exports: Vec<Export>,
}

impl Module {
    #[must_use]
    pub fn new(features: Features) -> Self {
        Self {
            features,
            types: Types::default(),
            functions: Vec::new(),
            exports: Vec::new(),
        }
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    #[must_use]
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn export(&mut self, name: impl Into<String>, func: impl Into<String>) {
        self.exports.push(Export {
            name: name.into(),
            func: func.into(),
        });
    }
}
