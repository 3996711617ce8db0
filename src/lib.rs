#![deny(warnings)]
#![allow(dead_code)]

//! Substrate's deferred GPU command scheduler.
//!
//! A [`graph::RenderGraph`] accumulates passes behind a builder, the same way `screen-13`'s render
//! graph defers GPU work behind a resolve step: callers describe what each pass reads and writes,
//! and [`graph::RenderGraph::execute`] culls unreachable passes, analyses dependencies, merges and
//! reorders draw passes, and hands the backend a compiled command stream plus a resource usage
//! timeline for barrier and aliasing planning. Everything past that boundary — encoding, memory
//! aliasing, actual barrier placement — is the concern of a [`backend::Backend`] implementation,
//! not this crate.

pub mod arena;
pub mod backend;
pub mod command;
pub mod compiler;
pub mod config;
pub mod dependency;
pub mod driver;
pub mod error;
pub mod graph;
pub mod handle;
pub mod pass;
pub mod recorder;
pub mod registry;
pub mod resource;
pub mod usage;

pub(crate) mod sync;

/// The types most programs touch on every frame.
pub mod prelude {
    pub use crate::backend::{Backend, NullBackend, SharedBackend};
    pub use crate::config::RenderGraphConfig;
    pub use crate::driver::{FrameState, WaitToken};
    pub use crate::error::RenderGraphError;
    pub use crate::graph::RenderGraph;
    pub use crate::handle::{ResourceFlags, ResourceHandle, ResourceKind};
    pub use crate::pass::{PassKind, RenderTargetsDescriptor};
    pub use crate::recorder::CommandRecorder;
    pub use crate::resource::{ResourceDescriptor, UsageHint};
    pub use crate::usage::{AccessKind, ShaderStageMask, SubRange};
}
