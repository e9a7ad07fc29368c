//! `Fs`: plain synchronous file access. The original runs single
//! threaded per vat with no async I/O story either, so a blocking
//! `std::fs` call here blocks only the calling vat's own thread, not the
//! rest of the node.

use crate::{entity_def, str_arg};
use pleroma_ast::{ast::AstNode, ctype::CType, error::RtError, vatrt::EvalContext};
use triomphe::Arc;

fn read(_ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let path = str_arg(args, 0, "read")?;
    let contents = std::fs::read_to_string(path.as_str())
        .map_err(|e| RtError::TransportFailed(format!("Fs.read {path}: {e}").into()))?;
    Ok(AstNode::string(contents))
}

fn write(_ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let path = str_arg(args, 0, "write")?;
    let contents = str_arg(args, 1, "write")?;
    std::fs::write(path.as_str(), contents.as_str())
        .map_err(|e| RtError::TransportFailed(format!("Fs.write {path}: {e}").into()))?;
    Ok(AstNode::none())
}

pub fn load() -> Arc<pleroma_ast::ast::EntityDef> {
    entity_def(
        "Fs",
        vec![
            ("read", vec![("path", CType::str())], CType::str(), read as _),
            (
                "write",
                vec![("path", CType::str()), ("contents", CType::str())],
                CType::none(),
                write as _,
            ),
        ],
    )
}
