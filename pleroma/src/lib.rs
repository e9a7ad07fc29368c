//! Bootstrap glue: the only crate that depends on both `pleroma-rt` and
//! `pleroma-kernel`, the same role `graphix-shell` plays for
//! `graphix-rt`/`graphix-stdlib` in the parent project.

use anyhow::Result;
use pleroma_rt::{Node, NodeConfig};
use std::sync::Arc;

/// Start a node with the full kernel (`Monad`, `Io`, `Net`, `Fs`)
/// already registered and ready to instantiate.
pub fn bootstrap(config: NodeConfig) -> Result<Arc<Node>> {
    let node = Node::start(config)?;
    for (name, def) in pleroma_kernel::modules() {
        node.register_kernel_entity(name, def);
    }
    Ok(node)
}
