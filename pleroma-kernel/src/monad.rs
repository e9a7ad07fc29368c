//! `Monad`: the kernel's entity factory. Every node's `n_running_programs`
//! starts at 1 for the Monad itself (SPEC_FULL §0.1); `Monad.create`
//! instantiates a fresh entity on the calling vat, and `start-program`
//! hands it its first `main(0)` asynchronously.

use crate::{entity_def, str_arg};
use fxhash::FxHashMap;
use pleroma_ast::{
    address::EntityAddress,
    ast::{AstKind, AstNode},
    ctype::{CType, DType},
    error::RtError,
    eval,
    ids::PromiseId,
    vatrt::{Entity, EvalContext},
    Scope,
};
use triomphe::Arc;

/// A program's own `main` is an ordinary entity method; the Monad's
/// exists only so the cold-boot vat has something to invoke, and so
/// `start-program` has a uniform way to kick off any entity — echo the
/// argument back as the u8 `spec.md` §4.6 declares.
fn main_entry(_ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let i = args.first().and_then(AstNode::as_number).unwrap_or(0);
    Ok(AstNode::new(AstKind::Number(i), CType::u8()))
}

/// Increment the node's running-programs counter and send `main(0)` to
/// `eref` asynchronously (`spec.md` §4.6). Unlike the host's own
/// `Node::start_program` bootstrap call, this never spawns a vat: `eref`
/// already names a live entity, most likely one just returned by
/// `create`.
fn start_program(ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let eref = args.first().ok_or_else(|| RtError::TypeMismatch {
        expected: "an entity reference".into(),
        found: "no argument".into(),
    })?;
    let AstKind::EntityRef(addr) = &*eref.kind else {
        return Err(RtError::TypeMismatch {
            expected: "Far Entity".into(),
            found: eref.ctype.to_string().into(),
        });
    };

    let promise_id: PromiseId = ctx.rt.alloc_promise_id();
    ctx.rt.register_promise(promise_id, None);
    let call_arg = AstNode::new(AstKind::Number(0), CType::u8());
    let msg = pleroma_ast::msg::Msg::call(*addr, ctx.rt.address(), "main", vec![call_arg], promise_id);
    ctx.rt.enqueue_outbound(msg);

    let n = ctx.rt.bump_running_programs();
    Ok(AstNode::new(AstKind::Number(n as i64), CType::u8()))
}

/// Count of programs currently running on this node, the Monad included,
/// as a decimal string (spec §4.6: `n-programs() -> Str`).
fn n_programs(ctx: &mut EvalContext<'_>, _args: &[AstNode]) -> Result<AstNode, RtError> {
    Ok(AstNode::string(ctx.rt.n_running_programs().to_string()))
}

fn create(ctx: &mut EvalContext<'_>, args: &[AstNode]) -> Result<AstNode, RtError> {
    let name = str_arg(args, 0, "create")?;
    let def = ctx
        .rt
        .kernel_entity(&name)
        .ok_or_else(|| RtError::MethodNotFound { entity_name: "Monad".into(), method: name.clone() })?;

    let entity_id = ctx.rt.alloc_entity_id();
    let here = ctx.rt.address();
    let address = EntityAddress::new(here.node_id, here.vat_id, entity_id);
    let file_scope = Scope::root();

    let mut data = FxHashMap::default();
    for (field_name, init) in &def.data_fields {
        let mut inner = EvalContext::new(ctx.rt, entity_id, file_scope.clone());
        let value = eval::eval(&mut inner, init)?;
        data.insert(field_name.clone(), value);
    }

    ctx.rt.insert_entity(Entity { def: def.clone(), address, data, file_scope });
    Ok(AstNode::entity_ref(address, name))
}

pub fn load() -> Arc<pleroma_ast::ast::EntityDef> {
    entity_def(
        "Monad",
        vec![
            (
                "create",
                vec![("entity_name", CType::str())],
                CType::base_entity(DType::Local),
                create as _,
            ),
            ("main", vec![("i", CType::u8())], CType::u8(), main_entry as _),
            (
                "start-program",
                vec![("eref", CType::base_entity(DType::Far))],
                CType::u8(),
                start_program as _,
            ),
            ("n-programs", vec![], CType::str(), n_programs as _),
        ],
    )
}
