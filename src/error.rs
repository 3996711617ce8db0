//! Recoverable error types.
//!
//! Per the error handling design: programming errors (precondition violations, handle misuse,
//! double-write conflicts) are fatal and reported by panicking, not by this type. `RenderGraphError`
//! covers only the conditions a caller can reasonably observe and recover from: persistent
//! resource exhaustion, empty submissions, and backend-reported failures.

use std::fmt::{self, Display, Formatter};

/// An error a caller of this crate may observe and recover from.
#[derive(Debug, Clone)]
pub enum RenderGraphError {
    /// The persistent registry could not allocate a new slot because the backend reported
    /// allocation failure (e.g. out of device memory) while materializing the resource.
    ResourceExhausted,

    /// `execute()` was called on a graph with no enqueued passes.
    ///
    /// The submission still produces a resolved wait-token (for the most recently submitted
    /// command on this graph's queue), but any presentation callback registered for the frame is
    /// invoked with this error rather than running to completion.
    EmptyRenderGraph,

    /// The backend reported a failure while submitting or fencing a compiled graph.
    BackendFailure(String),
}

impl Display for RenderGraphError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceExhausted => write!(f, "persistent resource allocation failed"),
            Self::EmptyRenderGraph => write!(f, "render graph had no passes to submit"),
            Self::BackendFailure(reason) => write!(f, "backend submission failed: {reason}"),
        }
    }
}

impl std::error::Error for RenderGraphError {}
