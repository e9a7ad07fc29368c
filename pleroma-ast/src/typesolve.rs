//! Static type solver (spec §4.2), grounded in the two-pass shape of the
//! original tokenizer/typesolver: first a module-wide pass records the
//! declared type of every top-level symbol (`record_top_types`), then a
//! second pass walks each function body checking every sub-expression
//! against that table (`typesolve_sub`). `solve` drives both passes over
//! a whole [`Module`] and accumulates every finding rather than stopping
//! at the first one, so a caller sees every type error in one run.

use crate::{
    ast::{AstKind, AstNode, CommMode, EntityDef, Module},
    ctype::{exact_match, CType, DType, PType},
    error::TypesolverError,
};
use arcstr::ArcStr;
use fxhash::FxHashMap;

/// The table `record_top_types` builds: every free function and every
/// entity method's declared signature, keyed by name.
#[derive(Debug, Default)]
pub struct TopTypes {
    pub functions: FxHashMap<ArcStr, (Vec<CType>, CType)>,
    pub entities: FxHashMap<ArcStr, FxHashMap<ArcStr, (Vec<CType>, CType)>>,
    pub data_fields: FxHashMap<ArcStr, FxHashMap<ArcStr, CType>>,
}

/// First pass: walk a module's declarations and record the *declared*
/// type of every name without looking inside any function body. This
/// must run to completion before `typesolve_sub` starts, since a
/// function may reference an entity declared later in the same module.
pub fn record_top_types(module: &Module) -> TopTypes {
    let mut top = TopTypes::default();
    for (name, f) in &module.functions {
        top.functions
            .insert(name.clone(), (f.param_types.clone(), f.return_type.clone()));
    }
    for (name, e) in &module.entities {
        record_entity_top_types(&mut top, name, e);
    }
    top
}

fn record_entity_top_types(top: &mut TopTypes, name: &ArcStr, def: &EntityDef) {
    let mut methods = FxHashMap::default();
    for (mname, f) in &def.functions {
        methods.insert(mname.clone(), (f.param_types.clone(), f.return_type.clone()));
    }
    top.entities.insert(name.clone(), methods);

    let mut fields = FxHashMap::default();
    for (fname, init) in &def.data_fields {
        fields.insert(fname.clone(), init.ctype.clone());
    }
    top.data_fields.insert(name.clone(), fields);

    for child in &def.children {
        record_entity_top_types(top, &child.name, child);
    }
}

/// Second pass: check one expression tree against the declared table and
/// a local variable scope, appending findings to `errors` rather than
/// short-circuiting on the first one. Returns the expression's resolved
/// type so the caller can keep checking outward (e.g. a `BinOp`'s
/// operand types feed into checking the `BinOp` itself).
pub fn typesolve_sub(
    node: &AstNode,
    top: &TopTypes,
    locals: &mut FxHashMap<ArcStr, CType>,
    errors: &mut Vec<TypesolverError>,
) -> CType {
    match &*node.kind {
        AstKind::Number(_) => CType::i64(),
        AstKind::Str(_) => CType::str(),
        AstKind::Char(_) => CType::char(),
        AstKind::Bool(_) => CType::bool(),
        AstKind::None => CType::none(),
        AstKind::EntityRef(_) => node.ctype.clone(),
        AstKind::PromiseRes(..) => node.ctype.clone(),

        AstKind::List(items) => {
            let elt = node
                .ctype
                .subtype
                .as_deref()
                .cloned()
                .unwrap_or_else(CType::none);
            for item in items {
                let t = typesolve_sub(item, top, locals, errors);
                if !exact_match(&t, &elt) {
                    errors.push(TypesolverError {
                        message: "list element type mismatch".into(),
                        function: None,
                        expected: Some(elt.to_string().into()),
                        found: Some(t.to_string().into()),
                    });
                }
            }
            CType::list(elt)
        }

        AstKind::Symbol(s) => locals.get(s).cloned().unwrap_or_else(|| {
            errors.push(TypesolverError {
                message: format!("unresolved symbol `{s}`").into(),
                function: None,
                expected: None,
                found: None,
            });
            CType::none()
        }),

        AstKind::BinOp(_, lhs, rhs) => {
            let lt = typesolve_sub(lhs, top, locals, errors);
            let rt = typesolve_sub(rhs, top, locals, errors);
            if !exact_match(&lt, &rt) {
                errors.push(TypesolverError {
                    message: "arithmetic on mismatched types".into(),
                    function: None,
                    expected: Some(lt.to_string().into()),
                    found: Some(rt.to_string().into()),
                });
            }
            lt
        }

        AstKind::UnOp(_, operand) => typesolve_sub(operand, top, locals, errors),

        AstKind::Compare(_, lhs, rhs) => {
            let lt = typesolve_sub(lhs, top, locals, errors);
            let rt = typesolve_sub(rhs, top, locals, errors);
            if !exact_match(&lt, &rt) {
                errors.push(TypesolverError {
                    message: "comparison on mismatched types".into(),
                    function: None,
                    expected: Some(lt.to_string().into()),
                    found: Some(rt.to_string().into()),
                });
            }
            CType::bool()
        }

        AstKind::Index(base, idx) => {
            let bt = typesolve_sub(base, top, locals, errors);
            let _ = typesolve_sub(idx, top, locals, errors);
            bt.subtype.map(|s| *s).unwrap_or_else(CType::none)
        }

        AstKind::FieldAccess(base, field) => {
            let bt = typesolve_sub(base, top, locals, errors);
            match &bt.entity_name {
                Some(name) => top
                    .data_fields
                    .get(name)
                    .and_then(|fields| fields.get(field))
                    .cloned()
                    .unwrap_or_else(|| {
                        errors.push(TypesolverError {
                            message: format!("no field `{field}` on `{name}`").into(),
                            function: None,
                            expected: None,
                            found: None,
                        });
                        CType::none()
                    }),
                None => CType::none(),
            }
        }

        AstKind::Call(callee, args) => {
            let name = match &*callee.kind {
                AstKind::Symbol(s) => Some(s.clone()),
                _ => None,
            };
            for a in args {
                typesolve_sub(a, top, locals, errors);
            }
            match name.and_then(|n| top.functions.get(&n)) {
                Some((params, ret)) => {
                    check_arity_and_types(params, args, top, locals, errors);
                    ret.clone()
                }
                None => CType::none(),
            }
        }

        AstKind::MessageSend { target, mode, method, args, then } => {
            let tt = typesolve_sub(target, top, locals, errors);
            for a in args {
                typesolve_sub(a, top, locals, errors);
            }
            let ret = match &tt.entity_name {
                Some(name) => top
                    .entities
                    .get(name)
                    .and_then(|methods| methods.get(method))
                    .map(|(params, ret)| {
                        check_arity_and_types(params, args, top, locals, errors);
                        ret.clone()
                    })
                    .unwrap_or_else(|| {
                        errors.push(TypesolverError {
                            message: format!("no method `{method}` on `{name}`").into(),
                            function: None,
                            expected: None,
                            found: None,
                        });
                        CType::none()
                    }),
                None if tt.basetype == PType::BaseEntity => CType::none(),
                None => CType::none(),
            };
            if let Some(clause) = then {
                if *mode != CommMode::Async {
                    errors.push(TypesolverError {
                        message: "`.then` callback is only meaningful on an async send".into(),
                        function: None,
                        expected: None,
                        found: None,
                    });
                }
                let mut inner = locals.clone();
                inner.insert(clause.param.clone(), ret.clone());
                for stmt in &clause.body {
                    typesolve_sub(stmt, top, &mut inner, errors);
                }
            }
            match mode {
                CommMode::Sync => ret,
                CommMode::Async => CType::promise(ret),
            }
        }

        AstKind::Match(scrutinee, arms) => {
            let st = typesolve_sub(scrutinee, top, locals, errors);
            let mut result = None;
            for arm in arms {
                let t = typesolve_sub(&arm.body, top, locals, errors);
                if let crate::ast::Pattern::Literal(lit) = &arm.pattern {
                    let lt = typesolve_sub(lit, top, locals, errors);
                    if !exact_match(&lt, &st) {
                        errors.push(TypesolverError {
                            message: "match arm pattern type mismatch".into(),
                            function: None,
                            expected: Some(st.to_string().into()),
                            found: Some(lt.to_string().into()),
                        });
                    }
                }
                result.get_or_insert(t);
            }
            result.unwrap_or_else(CType::none)
        }

        AstKind::Assignment { sym, value, kind } => {
            let mut vt = typesolve_sub(value, top, locals, errors);
            vt.dtype = *kind;
            // reassigning a bound symbol must not change its type
            if let Some(lexpr) = locals.get(sym) {
                if !exact_match(lexpr, &vt) {
                    errors.push(TypesolverError {
                        message: format!("assignment to `{sym}` changes its type").into(),
                        function: None,
                        expected: Some(lexpr.to_string().into()),
                        found: Some(vt.to_string().into()),
                    });
                }
            }
            locals.insert(sym.clone(), vt.clone());
            vt
        }

        AstKind::Return(v) => typesolve_sub(v, top, locals, errors),

        AstKind::For { sym, iterable, body } => {
            let it = typesolve_sub(iterable, top, locals, errors);
            let elt = it.subtype.map(|s| *s).unwrap_or_else(CType::none);
            locals.insert(sym.clone(), elt);
            for stmt in body {
                typesolve_sub(stmt, top, locals, errors);
            }
            CType::none()
        }

        AstKind::While { cond, body } => {
            let ct = typesolve_sub(cond, top, locals, errors);
            if ct.basetype != PType::Bool {
                errors.push(TypesolverError {
                    message: "while condition must be bool".into(),
                    function: None,
                    expected: Some(CType::bool().to_string().into()),
                    found: Some(ct.to_string().into()),
                });
            }
            for stmt in body {
                typesolve_sub(stmt, top, locals, errors);
            }
            CType::none()
        }

        AstKind::Fallthrough => CType::none(),
        AstKind::FuncStmt(_) | AstKind::EntityDef(_) | AstKind::Import { .. } => CType::none(),
    }
}

fn check_arity_and_types(
    params: &[CType],
    args: &[AstNode],
    top: &TopTypes,
    locals: &mut FxHashMap<ArcStr, CType>,
    errors: &mut Vec<TypesolverError>,
) {
    if params.len() != args.len() {
        errors.push(TypesolverError {
            message: format!(
                "wrong number of arguments: expected {}, found {}",
                params.len(),
                args.len()
            )
            .into(),
            function: None,
            expected: None,
            found: None,
        });
        return;
    }
    for (param, arg) in params.iter().zip(args) {
        let at = typesolve_sub(arg, top, locals, errors);
        if !exact_match(param, &at) {
            errors.push(TypesolverError {
                message: "argument type mismatch".into(),
                function: None,
                expected: Some(param.to_string().into()),
                found: Some(at.to_string().into()),
            });
        }
    }
}

/// Checks one function body against its declared return type: every
/// `Return`, wherever it's nested (including inside `for`/`while`
/// bodies), must `exact_match` the declared type, and if the body
/// contains no `Return` at all the declared type must be `None` (spec
/// §4.2, `FuncStmt` rule). Returns whether any `Return` was found.
fn check_returns(
    stmts: &[AstNode],
    top: &TopTypes,
    locals: &mut FxHashMap<ArcStr, CType>,
    return_type: &CType,
    label: &ArcStr,
    errors: &mut Vec<TypesolverError>,
) -> bool {
    let mut saw_return = false;
    for stmt in stmts {
        let t = typesolve_sub(stmt, top, locals, errors);
        match &*stmt.kind {
            AstKind::Return(_) => {
                saw_return = true;
                if !exact_match(&t, return_type) {
                    errors.push(TypesolverError {
                        message: "return type mismatch".into(),
                        function: Some(label.clone()),
                        expected: Some(return_type.to_string().into()),
                        found: Some(t.to_string().into()),
                    });
                }
            }
            AstKind::For { body, .. } | AstKind::While { body, .. } => {
                saw_return |= check_returns(body, top, locals, return_type, label, errors);
            }
            _ => {}
        }
    }
    saw_return
}

fn check_function(
    name: &ArcStr,
    f: &crate::ast::FuncStmt,
    top: &TopTypes,
    locals: &mut FxHashMap<ArcStr, CType>,
    errors: &mut Vec<TypesolverError>,
) {
    let saw_return = check_returns(&f.body, top, locals, &f.return_type, name, errors);
    if !saw_return && f.return_type.basetype != PType::None {
        errors.push(TypesolverError {
            message: "function has no return statement".into(),
            function: Some(name.clone()),
            expected: Some(f.return_type.to_string().into()),
            found: Some(CType::none().to_string().into()),
        });
    }
}

/// Drives both passes over a module and returns every finding. An empty
/// result is the evaluator's precondition to start running (spec §4.2).
pub fn solve(module: &Module) -> Vec<TypesolverError> {
    let top = record_top_types(module);
    let mut errors = Vec::new();

    for (name, f) in &module.functions {
        let mut locals: FxHashMap<ArcStr, CType> =
            f.params.iter().cloned().zip(f.param_types.iter().cloned()).collect();
        check_function(name, f, &top, &mut locals, &mut errors);
    }

    for def in module.entities.values() {
        solve_entity(def, &top, &mut errors);
    }

    errors
}

fn solve_entity(def: &EntityDef, top: &TopTypes, errors: &mut Vec<TypesolverError>) {
    for (name, f) in &def.functions {
        let mut locals: FxHashMap<ArcStr, CType> =
            f.params.iter().cloned().zip(f.param_types.iter().cloned()).collect();
        locals.insert("self".into(), CType::entity(def.name.clone(), DType::Local));
        let label: ArcStr = format!("{}.{}", def.name, name).into();
        check_function(&label, f, top, &mut locals, errors);
    }
    for child in &def.children {
        solve_entity(child, top, errors);
    }
}
