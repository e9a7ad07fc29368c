//! `Net`: the kernel's transport entity, fronting the router's dial and
//! local-port operations (grounded in the original's `netcode.cpp`,
//! which exposes equivalent connect/listen-port primitives to script
//! code through the same native-call path as every other builtin).

use crate::{entity_def, num_arg, str_arg};
use pleroma_ast::{ast::AstNode, ctype::CType, error::RtError, vatrt::EvalContext};
use triomphe::Arc;

fn dial(ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let host = str_arg(args, 0, "dial")?;
    let port = num_arg(args, 1, "dial")?;
    let port = u16::try_from(port).map_err(|_| RtError::TypeMismatch {
        expected: "u16 port".into(),
        found: port.to_string().into(),
    })?;
    let node_id = ctx.rt.transport_dial(&host, port)?;
    Ok(AstNode::number(node_id as i64))
}

fn local_port(ctx: &mut EvalContext<'_>, _args: &[AstNode]) -> Result<AstNode, RtError> {
    Ok(AstNode::number(ctx.rt.transport_local_port() as i64))
}

pub fn load() -> Arc<pleroma_ast::ast::EntityDef> {
    entity_def(
        "Net",
        vec![
            (
                "dial",
                vec![("host", CType::str()), ("port", CType::i64())],
                CType::i64(),
                dial as _,
            ),
            ("local_port", vec![], CType::i64(), local_port as _),
        ],
    )
}
