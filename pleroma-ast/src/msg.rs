//! `Msg` and `PromiseResult` (spec §3), and the kernel module index.

use crate::{ast::AstNode, ids::PromiseId};
use arcstr::ArcStr;

/// Enumerated kernel module. `load_kernel` in the original source keys
/// its module table by this enum rather than by string name; per
/// SPEC_FULL §0.1 that enum-keyed form is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemModule {
    Monad,
    Io,
    Net,
    Fs,
}

impl SystemModule {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Monad => "Monad",
            Self::Io => "Io",
            Self::Net => "Net",
            Self::Fs => "Fs",
        }
    }
}

/// A message in flight between entities, same-vat, cross-vat or
/// cross-node. `response` distinguishes an outbound call from a reply.
/// `response_err` is this spec's addition to the wire contract (SPEC_FULL
/// §0.1): the source has no channel for a failed call, so replies here
/// carry an optional error instead of always requiring a `values` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub dst: crate::address::EntityAddress,
    pub src: crate::address::EntityAddress,
    pub function_name: ArcStr,
    pub values: Vec<AstNode>,
    pub promise_id: PromiseId,
    pub response: bool,
    pub response_err: Option<ArcStr>,
}

impl Msg {
    pub fn call(
        dst: crate::address::EntityAddress,
        src: crate::address::EntityAddress,
        function_name: impl Into<ArcStr>,
        values: Vec<AstNode>,
        promise_id: PromiseId,
    ) -> Self {
        Self {
            dst,
            src,
            function_name: function_name.into(),
            values,
            promise_id,
            response: false,
            response_err: None,
        }
    }

    pub fn reply_ok(&self, result: AstNode) -> Self {
        Self {
            dst: self.src,
            src: self.dst,
            function_name: self.function_name.clone(),
            values: vec![result],
            promise_id: self.promise_id,
            response: true,
            response_err: None,
        }
    }

    pub fn reply_err(&self, err: impl Into<ArcStr>) -> Self {
        Self {
            dst: self.src,
            src: self.dst,
            function_name: self.function_name.clone(),
            values: vec![],
            promise_id: self.promise_id,
            response: true,
            response_err: Some(err.into()),
        }
    }
}

/// Created the moment an async send is issued; resolved when the
/// matching reply arrives, firing `callback` if one was attached.
#[derive(Debug, Clone, Default)]
pub struct PromiseResult {
    pub resolved: bool,
    pub results: Vec<AstNode>,
    pub error: Option<ArcStr>,
    pub callback: Option<crate::ids::CallbackId>,
}

impl PromiseResult {
    pub fn pending(callback: Option<crate::ids::CallbackId>) -> Self {
        Self { resolved: false, results: Vec::new(), error: None, callback }
    }

    /// `resolved` is monotonic: false -> true, never back. Attempting to
    /// resolve an already-resolved promise is a no-op rather than a panic
    /// (a duplicate or late reply should not corrupt state).
    pub fn resolve(&mut self, results: Vec<AstNode>, error: Option<ArcStr>) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.results = results;
        self.error = error;
    }
}
