//! The vat scheduler, router and node bootstrap for the pleroma actor
//! runtime (spec components 5 and 6).
//!
//! Evaluation itself lives in `pleroma-ast`; this crate supplies the
//! concrete [`vat::VatRt`](pleroma_ast::vatrt::VatRt) implementation that
//! actually schedules entities, moves messages between vats, and
//! forwards cross-node traffic over the wire.

pub mod node;
pub mod router;
pub mod vat;

pub use node::{Node, NodeConfig, NodeConfigBuilder, DEFAULT_PORT};
pub use router::RouterHandle;
pub use vat::{VatCmd, VatHandle};
