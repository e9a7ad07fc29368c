//! The tree-walking evaluator (spec §4.3).
//!
//! `eval` assumes its input already passed [`crate::typesolve::solve`]
//! with zero findings: it does not re-check types, only values. Control
//! flow (`return` unwinding through nested blocks) is threaded through
//! [`Signal`] rather than a Rust exception, since the evaluator never
//! unwinds across a `VatRt` call boundary.

use crate::{
    address::EntityAddress,
    ast::{AstKind, AstNode, BinOp, CommMode, CompareOp, Pattern, UnOp},
    ctype::{CType, DType, PType},
    error::RtError,
    scope::Scope,
    vatrt::EvalContext,
};
use std::rc::Rc;

enum Signal {
    Value(AstNode),
    Return(AstNode),
}

/// Evaluate a single expression or statement to a value.
pub fn eval(ctx: &mut EvalContext<'_>, node: &AstNode) -> Result<AstNode, RtError> {
    match eval_signal(ctx, node)? {
        Signal::Value(v) | Signal::Return(v) => Ok(v),
    }
}

/// A block is a sequence of statements; a `return` anywhere in it (or in
/// a nested `if`/`for`/`while`, once those lower to blocks) short-circuits
/// the remaining statements and becomes the block's value. Without one,
/// the block's value is its last statement's value, or `None` if empty.
pub fn eval_block(ctx: &mut EvalContext<'_>, body: &[AstNode]) -> Result<AstNode, RtError> {
    let mut last = AstNode::none();
    for stmt in body {
        match eval_signal(ctx, stmt)? {
            Signal::Value(v) => last = v,
            Signal::Return(v) => return Ok(v),
        }
    }
    Ok(last)
}

fn eval_signal(ctx: &mut EvalContext<'_>, node: &AstNode) -> Result<Signal, RtError> {
    match &*node.kind {
        AstKind::Number(_)
        | AstKind::Str(_)
        | AstKind::Char(_)
        | AstKind::Bool(_)
        | AstKind::None
        | AstKind::EntityRef(_)
        | AstKind::PromiseRes(..)
        | AstKind::FuncStmt(_)
        | AstKind::EntityDef(_)
        | AstKind::Import { .. } => Ok(Signal::Value(node.clone())),

        AstKind::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(eval(ctx, item)?);
            }
            Ok(Signal::Value(AstNode::new(AstKind::List(values), node.ctype.clone())))
        }

        AstKind::Symbol(s) => ctx
            .scope
            .get(s)
            .map(Signal::Value)
            .ok_or_else(|| RtError::UnresolvedSymbol(s.clone())),

        AstKind::BinOp(op, lhs, rhs) => {
            let l = eval(ctx, lhs)?;
            let r = eval(ctx, rhs)?;
            eval_binop(*op, &l, &r, &node.ctype).map(Signal::Value)
        }

        AstKind::UnOp(op, operand) => {
            let v = eval(ctx, operand)?;
            eval_unop(*op, &v).map(Signal::Value)
        }

        AstKind::Compare(op, lhs, rhs) => {
            let l = eval(ctx, lhs)?;
            let r = eval(ctx, rhs)?;
            Ok(Signal::Value(AstNode::bool(eval_compare(*op, &l, &r))))
        }

        AstKind::Index(base, idx) => {
            let b = eval(ctx, base)?;
            let i = eval(ctx, idx)?;
            let items = match &*b.kind {
                AstKind::List(items) => items,
                _ => {
                    return Err(RtError::TypeMismatch {
                        expected: "list".into(),
                        found: b.ctype.to_string().into(),
                    })
                }
            };
            let idx = i.as_number().ok_or_else(|| RtError::TypeMismatch {
                expected: "i64".into(),
                found: i.ctype.to_string().into(),
            })?;
            let idx = usize::try_from(idx).map_err(|_| RtError::TypeMismatch {
                expected: "non-negative index".into(),
                found: idx.to_string().into(),
            })?;
            items
                .get(idx)
                .cloned()
                .map(Signal::Value)
                .ok_or(RtError::TypeMismatch {
                    expected: "index in range".into(),
                    found: idx.to_string().into(),
                })
        }

        AstKind::FieldAccess(base, field) => {
            let b = eval(ctx, base)?;
            let addr = entity_addr(&b)?;
            let entity = ctx
                .rt
                .entity(addr.entity_id)
                .ok_or(RtError::EntityNotFound { entity_id: addr.entity_id })?;
            entity
                .data
                .get(field)
                .cloned()
                .map(Signal::Value)
                .ok_or_else(|| RtError::MethodNotFound {
                    entity_name: entity.def.name.clone(),
                    method: field.clone(),
                })
        }

        AstKind::Call(callee, args) => {
            let callee_val = eval(ctx, callee)?;
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(ctx, a)?);
            }
            match &*callee_val.kind {
                AstKind::FuncStmt(f) => {
                    if let Some(native) = f.native {
                        native(ctx, &values).map(Signal::Value)
                    } else {
                        let scope = Scope::child(&ctx.scope);
                        for (p, v) in f.params.iter().zip(values) {
                            scope.bind_here(p.clone(), v);
                        }
                        let mut inner = EvalContext::new(ctx.rt, ctx.entity_id, scope);
                        eval_block(&mut inner, &f.body).map(Signal::Value)
                    }
                }
                _ => Err(RtError::TypeMismatch {
                    expected: "callable".into(),
                    found: callee_val.ctype.to_string().into(),
                }),
            }
        }

        AstKind::MessageSend { target, mode, method, args, then } => {
            let target_val = eval(ctx, target)?;
            let addr = entity_addr(&target_val)?;
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(ctx, a)?);
            }
            eval_message_send(ctx, addr, *mode, method, values, node.ctype.clone(), then.as_ref())
                .map(Signal::Value)
        }

        AstKind::Match(scrutinee, arms) => {
            let s = eval(ctx, scrutinee)?;
            for arm in arms {
                match &arm.pattern {
                    Pattern::Wildcard => return eval_signal(ctx, &arm.body),
                    Pattern::Literal(lit) => {
                        let l = eval(ctx, lit)?;
                        if l == s {
                            return eval_signal(ctx, &arm.body);
                        }
                    }
                    Pattern::Bind(name) => {
                        let scope = Scope::child(&ctx.scope);
                        scope.bind_here(name.clone(), s.clone());
                        let mut inner = EvalContext::new(ctx.rt, ctx.entity_id, scope);
                        return eval_signal(&mut inner, &arm.body);
                    }
                }
            }
            Ok(Signal::Value(AstNode::none()))
        }

        AstKind::Assignment { sym, value, kind } => {
            let v = eval(ctx, value)?;
            match kind {
                DType::Local => ctx.scope.bind_here(sym.clone(), v.clone()),
                DType::Far | DType::Alien => {
                    let entity = ctx
                        .rt
                        .entity_mut(ctx.entity_id)
                        .ok_or(RtError::EntityNotFound { entity_id: ctx.entity_id })?;
                    entity.data.insert(sym.clone(), v.clone());
                }
            }
            Ok(Signal::Value(v))
        }

        AstKind::Return(v) => eval(ctx, v).map(Signal::Return),

        AstKind::For { sym, iterable, body } => {
            let it = eval(ctx, iterable)?;
            let items = match &*it.kind {
                AstKind::List(items) => items.clone(),
                _ => {
                    return Err(RtError::TypeMismatch {
                        expected: "list".into(),
                        found: it.ctype.to_string().into(),
                    })
                }
            };
            for item in items {
                let scope = Scope::child(&ctx.scope);
                scope.bind_here(sym.clone(), item);
                let mut inner = EvalContext::new(ctx.rt, ctx.entity_id, scope);
                if let Signal::Return(v) = eval_block_signal(&mut inner, body)? {
                    return Ok(Signal::Return(v));
                }
            }
            Ok(Signal::Value(AstNode::none()))
        }

        AstKind::While { cond, body } => {
            loop {
                let c = eval(ctx, cond)?;
                if !c.as_bool().unwrap_or(false) {
                    break;
                }
                let scope = Scope::child(&ctx.scope);
                let mut inner = EvalContext::new(ctx.rt, ctx.entity_id, scope);
                if let Signal::Return(v) = eval_block_signal(&mut inner, body)? {
                    return Ok(Signal::Return(v));
                }
            }
            Ok(Signal::Value(AstNode::none()))
        }

        AstKind::Fallthrough => Ok(Signal::Value(AstNode::none())),
    }
}

fn eval_block_signal(ctx: &mut EvalContext<'_>, body: &[AstNode]) -> Result<Signal, RtError> {
    let mut last = AstNode::none();
    for stmt in body {
        match eval_signal(ctx, stmt)? {
            Signal::Value(v) => last = v,
            ret @ Signal::Return(_) => return Ok(ret),
        }
    }
    Ok(Signal::Value(last))
}

fn entity_addr(v: &AstNode) -> Result<EntityAddress, RtError> {
    match &*v.kind {
        AstKind::EntityRef(addr) => Ok(*addr),
        _ => Err(RtError::TypeMismatch { expected: "entity".into(), found: v.ctype.to_string().into() }),
    }
}

/// `Sync` runs the target method straight through to completion and is
/// only legal same-vat; reaching it for a cross-vat target means the
/// solver let something through it should have rejected (spec §4.3).
/// `Async` is always legal and always goes out as a queued
/// [`crate::msg::Msg`], same-vat or not — only the scheduler can name a
/// reply's eventual arrival, so there is no same-vat fast path that
/// skips the promise (spec §8 invariant 1: every async send allocates
/// exactly one promise).
fn eval_message_send(
    ctx: &mut EvalContext<'_>,
    addr: EntityAddress,
    mode: CommMode,
    method: &arcstr::ArcStr,
    args: Vec<AstNode>,
    result_ctype: CType,
    then: Option<&crate::ast::ThenClause>,
) -> Result<AstNode, RtError> {
    match mode {
        CommMode::Sync => {
            if !is_local_to(ctx, addr) {
                return Err(RtError::TypeMismatch {
                    expected: "sync send target on the same vat".into(),
                    found: format!("cross-vat target {addr}").into(),
                });
            }
            call_local_method(ctx, addr, method, args)
        }
        CommMode::Async => {
            let promise_id = ctx.rt.alloc_promise_id();
            let callback_id = match then {
                Some(clause) => {
                    let id = ctx.rt.alloc_callback_id();
                    ctx.rt.register_callback(
                        id,
                        crate::vatrt::PendingCallback {
                            param: clause.param.clone(),
                            body: clause.body.clone(),
                            env: ctx.scope.clone(),
                        },
                    );
                    Some(id)
                }
                None => None,
            };
            ctx.rt.register_promise(promise_id, callback_id);
            let msg = crate::msg::Msg::call(addr, ctx.rt.address(), method.clone(), args, promise_id);
            ctx.rt.enqueue_outbound(msg);
            // `result_ctype` is already `CType::promise(ret)` (typesolve
            // wraps the target method's return type for `Async` sends);
            // wrap only the `PromiseRes` payload, not the type again.
            Ok(AstNode::new(AstKind::PromiseRes(promise_id, callback_id), result_ctype))
        }
    }
}

fn is_local_to(ctx: &EvalContext<'_>, addr: EntityAddress) -> bool {
    let here = ctx.rt.address();
    addr.node_id == here.node_id && addr.vat_id == here.vat_id
}

fn call_local_method(
    ctx: &mut EvalContext<'_>,
    addr: EntityAddress,
    method: &arcstr::ArcStr,
    args: Vec<AstNode>,
) -> Result<AstNode, RtError> {
    let entity = ctx
        .rt
        .entity(addr.entity_id)
        .ok_or(RtError::EntityNotFound { entity_id: addr.entity_id })?;
    let func = entity
        .def
        .functions
        .get(method)
        .cloned()
        .ok_or_else(|| RtError::MethodNotFound {
            entity_name: entity.def.name.clone(),
            method: method.clone(),
        })?;
    let file_scope = Rc::clone(&entity.file_scope);

    if let Some(native) = func.native {
        let scope = Scope::child(&file_scope);
        scope.bind_here("self".into(), AstNode::entity_ref(addr, func.name.clone()));
        let mut inner = EvalContext::new(ctx.rt, addr.entity_id, scope);
        return native(&mut inner, &args);
    }

    let scope = Scope::child(&file_scope);
    scope.bind_here("self".into(), AstNode::entity_ref(addr, func.name.clone()));
    for (p, v) in func.params.iter().zip(args) {
        scope.bind_here(p.clone(), v);
    }
    let mut inner = EvalContext::new(ctx.rt, addr.entity_id, scope);
    eval_block(&mut inner, &func.body)
}

fn eval_binop(op: BinOp, l: &AstNode, r: &AstNode, ctype: &CType) -> Result<AstNode, RtError> {
    if ctype.basetype == PType::Str {
        let (a, b) = (str_of(l)?, str_of(r)?);
        return match op {
            BinOp::Add => Ok(AstNode::string(format!("{a}{b}"))),
            _ => Err(RtError::TypeMismatch { expected: "i64".into(), found: "str".into() }),
        };
    }
    let a = num_of(l)?;
    let b = num_of(r)?;
    let result = match op {
        BinOp::Add => a.checked_add(b),
        BinOp::Sub => a.checked_sub(b),
        BinOp::Mul => a.checked_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(RtError::DivisionByZero);
            }
            a.checked_div(b)
        }
    };
    result.map(AstNode::number).ok_or(RtError::IntegerOverflow)
}

fn eval_unop(op: UnOp, v: &AstNode) -> Result<AstNode, RtError> {
    match op {
        UnOp::Neg => num_of(v)?.checked_neg().map(AstNode::number).ok_or(RtError::IntegerOverflow),
        UnOp::Not => Ok(AstNode::bool(!bool_of(v)?)),
    }
}

fn eval_compare(op: CompareOp, l: &AstNode, r: &AstNode) -> bool {
    match op {
        CompareOp::Eq => l == r,
        CompareOp::Neq => l != r,
        CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else { return false };
            match op {
                CompareOp::Lt => a < b,
                CompareOp::Lte => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Gte => a >= b,
                CompareOp::Eq | CompareOp::Neq => unreachable!(),
            }
        }
    }
}

fn num_of(v: &AstNode) -> Result<i64, RtError> {
    v.as_number().ok_or_else(|| RtError::TypeMismatch { expected: "i64".into(), found: v.ctype.to_string().into() })
}

fn str_of(v: &AstNode) -> Result<arcstr::ArcStr, RtError> {
    v.as_str().cloned().ok_or_else(|| RtError::TypeMismatch { expected: "str".into(), found: v.ctype.to_string().into() })
}

fn bool_of(v: &AstNode) -> Result<bool, RtError> {
    v.as_bool().ok_or_else(|| RtError::TypeMismatch { expected: "bool".into(), found: v.ctype.to_string().into() })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        address::EntityAddress,
        ast::{AstKind, CommMode, EntityDef},
        ctype::DType,
        ids::{CallbackId, PromiseId},
        msg::Msg,
        vatrt::{Entity, PendingCallback, VatRt},
    };
    use fxhash::FxHashMap;

    struct FakeRt {
        addr: EntityAddress,
        entities: FxHashMap<u64, Entity>,
        outbound: Vec<Msg>,
        next_id: u64,
    }

    impl FakeRt {
        fn new() -> Self {
            Self {
                addr: EntityAddress::new(0, 0, 0),
                entities: FxHashMap::default(),
                outbound: Vec::new(),
                next_id: 1,
            }
        }
    }

    impl VatRt for FakeRt {
        fn address(&self) -> EntityAddress {
            self.addr
        }
        fn alloc_promise_id(&mut self) -> PromiseId {
            let id = self.next_id;
            self.next_id += 1;
            PromiseId(id)
        }
        fn alloc_entity_id(&mut self) -> u64 {
            let id = self.next_id;
            self.next_id += 1;
            id
        }
        fn alloc_callback_id(&mut self) -> CallbackId {
            let id = self.next_id;
            self.next_id += 1;
            CallbackId(id)
        }
        fn entity(&self, id: u64) -> Option<&Entity> {
            self.entities.get(&id)
        }
        fn entity_mut(&mut self, id: u64) -> Option<&mut Entity> {
            self.entities.get_mut(&id)
        }
        fn insert_entity(&mut self, entity: Entity) {
            self.entities.insert(entity.address.entity_id, entity);
        }
        fn register_callback(&mut self, _id: CallbackId, _cb: PendingCallback) {}
        fn take_callback(&mut self, _id: CallbackId) -> Option<PendingCallback> {
            None
        }
        fn register_promise(&mut self, _id: PromiseId, _callback: Option<CallbackId>) {}
        fn enqueue_outbound(&mut self, msg: Msg) {
            self.outbound.push(msg);
        }
        fn kernel_entity(&self, _module_name: &str) -> Option<triomphe::Arc<crate::ast::EntityDef>> {
            None
        }
        fn system_entity_ref(&mut self, _name: &str) -> Result<EntityAddress, RtError> {
            Err(RtError::EntityNotFound { entity_id: 0 })
        }
        fn transport_dial(&mut self, _host: &str, _port: u16) -> Result<u64, RtError> {
            Ok(0)
        }
        fn transport_local_port(&self) -> u16 {
            0
        }
        fn n_running_programs(&self) -> u64 {
            1
        }
        fn bump_running_programs(&mut self) -> u64 {
            1
        }
        fn log_error(&self, _msg: &str) {}
    }

    fn ctx(rt: &mut FakeRt) -> EvalContext<'_> {
        EvalContext::new(rt, 0, Scope::root())
    }

    #[test]
    fn arithmetic_checks_division_by_zero() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let node = AstNode::new(
            AstKind::BinOp(BinOp::Div, AstNode::number(4), AstNode::number(0)),
            CType::i64(),
        );
        assert_eq!(eval(&mut c, &node), Err(RtError::DivisionByZero));
    }

    #[test]
    fn arithmetic_checks_overflow() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let node = AstNode::new(
            AstKind::BinOp(BinOp::Add, AstNode::number(i64::MAX), AstNode::number(1)),
            CType::i64(),
        );
        assert_eq!(eval(&mut c, &node), Err(RtError::IntegerOverflow));
    }

    #[test]
    fn unresolved_symbol_errors() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let node = AstNode::new(AstKind::Symbol("nope".into()), CType::none());
        assert_eq!(eval(&mut c, &node), Err(RtError::UnresolvedSymbol("nope".into())));
    }

    #[test]
    fn assignment_binds_and_returns_value() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let assign = AstNode::new(
            AstKind::Assignment { sym: "x".into(), value: AstNode::number(7), kind: DType::Local },
            CType::i64(),
        );
        let v = eval(&mut c, &assign).unwrap();
        assert_eq!(v.as_number(), Some(7));
        assert_eq!(c.scope.get("x").unwrap().as_number(), Some(7));
    }

    #[test]
    fn far_assignment_mutates_entity_data_instead_of_the_scope() {
        let mut rt = FakeRt::new();
        rt.insert_entity(Entity {
            def: triomphe::Arc::new(EntityDef {
                name: "Counter".into(),
                functions: FxHashMap::default(),
                data_fields: FxHashMap::default(),
                children: Vec::new(),
            }),
            address: EntityAddress::new(0, 0, 0),
            data: FxHashMap::default(),
            file_scope: Scope::root(),
        });
        let mut c = ctx(&mut rt);
        let assign = AstNode::new(
            AstKind::Assignment { sym: "n".into(), value: AstNode::number(3), kind: DType::Far },
            CType::i64(),
        );
        let v = eval(&mut c, &assign).unwrap();
        assert_eq!(v.as_number(), Some(3));
        assert!(c.scope.get("n").is_none());
        assert_eq!(rt.entities.get(&0).unwrap().data.get("n").unwrap().as_number(), Some(3));
    }

    #[test]
    fn async_send_to_far_entity_allocates_a_promise() {
        let mut rt = FakeRt::new();
        rt.addr = EntityAddress::new(0, 0, 0);
        let mut c = ctx(&mut rt);
        let far = EntityAddress::new(0, 1, 5);
        let target = AstNode::entity_ref(far, "Greeter");
        let node = AstNode::new(
            AstKind::MessageSend {
                target,
                mode: CommMode::Async,
                method: "hello".into(),
                args: vec![],
                then: None,
            },
            CType::promise(CType::none()),
        );
        let v = eval(&mut c, &node).unwrap();
        assert!(matches!(&*v.kind, AstKind::PromiseRes(..)));
        assert_eq!(rt.outbound.len(), 1);
    }

    #[test]
    fn async_send_with_then_registers_a_callback() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let far = EntityAddress::new(0, 1, 5);
        let target = AstNode::entity_ref(far, "Greeter");
        let node = AstNode::new(
            AstKind::MessageSend {
                target,
                mode: CommMode::Async,
                method: "hello".into(),
                args: vec![],
                then: Some(crate::ast::ThenClause {
                    param: "result".into(),
                    body: vec![AstNode::new(
                        AstKind::Return(AstNode::new(AstKind::Symbol("result".into()), CType::none())),
                        CType::none(),
                    )],
                }),
            },
            CType::promise(CType::none()),
        );
        let v = eval(&mut c, &node).unwrap();
        match &*v.kind {
            AstKind::PromiseRes(_, cb) => assert!(cb.is_some()),
            other => panic!("expected PromiseRes, got {other:?}"),
        }
    }

    #[test]
    fn sync_send_across_vat_boundary_is_rejected() {
        let mut rt = FakeRt::new();
        let mut c = ctx(&mut rt);
        let far = EntityAddress::new(0, 1, 5);
        let target = AstNode::entity_ref(far, "Greeter");
        let node = AstNode::new(
            AstKind::MessageSend {
                target,
                mode: CommMode::Sync,
                method: "hello".into(),
                args: vec![],
                then: None,
            },
            CType::none(),
        );
        assert!(matches!(eval(&mut c, &node), Err(RtError::TypeMismatch { .. })));
    }
}
