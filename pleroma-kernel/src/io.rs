//! `Io`: the kernel's console entity, standing in for the original's
//! direct stdio writes from native function calls.

use crate::{entity_def, str_arg};
use pleroma_ast::{ast::AstNode, ctype::CType, error::RtError, vatrt::EvalContext};
use std::io::Write;
use triomphe::Arc;

fn print(_ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let s = str_arg(args, 0, "print")?;
    let mut out = std::io::stdout();
    let _ = writeln!(out, "{s}");
    Ok(AstNode::none())
}

fn eprint(_ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let s = str_arg(args, 0, "eprint")?;
    let mut out = std::io::stderr();
    let _ = writeln!(out, "{s}");
    Ok(AstNode::none())
}

pub fn load() -> Arc<pleroma_ast::ast::EntityDef> {
    entity_def(
        "Io",
        vec![
            ("print", vec![("msg", CType::str())], CType::none(), print as _),
            ("eprint", vec![("msg", CType::str())], CType::none(), eprint as _),
        ],
    )
}
