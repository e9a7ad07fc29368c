//! The kernel of built-in entities every node starts with: `Monad`,
//! `Io`, `Net` and `Fs` (spec §3, SPEC_FULL §0.2). Each is an ordinary
//! [`pleroma_ast::ast::EntityDef`] whose methods carry a native function
//! pointer instead of an interpreted body, so the evaluator calls a
//! kernel method exactly the way it calls a user-defined one.

pub mod fs;
pub mod io;
pub mod monad;
pub mod net;

use arcstr::ArcStr;
use fxhash::FxHashMap;
use pleroma_ast::{
    ast::{AstNode, EntityDef, FuncStmt, NativeFn},
    ctype::CType,
    error::RtError,
};
use triomphe::Arc;

/// Build an `EntityDef` whose every method is a native function, no
/// interpreted body and no data fields — the shape every kernel module
/// shares.
fn entity_def(name: &str, methods: Vec<(&str, Vec<(&str, CType)>, CType, NativeFn)>) -> Arc<EntityDef> {
    let mut functions = FxHashMap::default();
    for (mname, params, return_type, native) in methods {
        let (names, types): (Vec<ArcStr>, Vec<CType>) =
            params.into_iter().map(|(n, t)| (ArcStr::from(n), t)).unzip();
        functions.insert(
            ArcStr::from(mname),
            Arc::new(FuncStmt {
                name: mname.into(),
                params: names,
                param_types: types,
                body: Vec::new(),
                return_type,
                native: Some(native),
            }),
        );
    }
    Arc::new(EntityDef {
        name: name.into(),
        functions,
        data_fields: FxHashMap::default(),
        children: Vec::new(),
    })
}

fn str_arg(args: &[AstNode], idx: usize, method: &str) -> Result<ArcStr, RtError> {
    args.get(idx)
        .and_then(|a| a.as_str())
        .cloned()
        .ok_or_else(|| RtError::TypeMismatch {
            expected: format!("str argument {idx} to {method}").into(),
            found: "missing or wrong type".into(),
        })
}

fn num_arg(args: &[AstNode], idx: usize, method: &str) -> Result<i64, RtError> {
    args.get(idx)
        .and_then(|a| a.as_number())
        .ok_or_else(|| RtError::TypeMismatch {
            expected: format!("i64 argument {idx} to {method}").into(),
            found: "missing or wrong type".into(),
        })
}

/// Every kernel module, paired with its registration name. A host
/// (`pleroma-rt::Node` via the `pleroma` facade) registers each of these
/// before starting any vat.
pub fn modules() -> Vec<(&'static str, Arc<EntityDef>)> {
    vec![
        ("Monad", monad::load()),
        ("Io", io::load()),
        ("Net", net::load()),
        ("Fs", fs::load()),
    ]
}
