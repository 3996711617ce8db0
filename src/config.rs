//! Crate-wide tunables.

use derive_builder::Builder;

/// Configuration for a [`crate::graph::RenderGraph`] and the [`crate::driver::SubmissionDriver`]
/// that services it.
///
/// Mirrors the way `screen-13`'s `PoolInfo` is built: a `derive_builder`-generated builder with
/// sensible defaults, so most callers only override the field they care about.
#[derive(Builder, Clone, Copy, Debug, PartialEq, Eq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "RenderGraphConfigBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct RenderGraphConfig {
    /// Size, in bytes, of a single tagged-arena page. Defaults to
    /// [`RenderGraphConfig::DEFAULT_ARENA_PAGE_SIZE`] (2 MiB, per §4.1).
    #[builder(default = "RenderGraphConfig::DEFAULT_ARENA_PAGE_SIZE")]
    pub arena_page_size: usize,

    /// Maximum number of frames the submission driver allows in flight before `execute()`
    /// suspends the caller. Defaults to 2.
    #[builder(default = "2")]
    pub max_in_flight_frames: u32,

    /// Fixed capacity, per resource kind, of a transient registry generation. Exhaustion is a
    /// fatal programming error (§4.2), so this should be sized generously for the workload.
    #[builder(default = "4096")]
    pub transient_registry_capacity: u32,

    /// When set, diagnostic strings (pass names synthesized from call sites, debug labels
    /// forwarded to the backend) are not allocated. Trims allocation in label-heavy code paths
    /// at the cost of less useful backend captures (§6).
    #[builder(default = "false")]
    pub disable_automatic_labels: bool,
}

impl RenderGraphConfig {
    /// Default tagged-arena page size: 2 MiB, as specified in §4.1.
    pub const DEFAULT_ARENA_PAGE_SIZE: usize = 2 * 1024 * 1024;
}

impl Default for RenderGraphConfig {
    fn default() -> Self {
        RenderGraphConfigBuilder::default().into()
    }
}

impl From<RenderGraphConfigBuilder> for RenderGraphConfig {
    fn from(builder: RenderGraphConfigBuilder) -> Self {
        builder.build()
    }
}

// HACK: see https://github.com/colin-kiegel/rust-derive-builder/issues/56 — the generated
// `build()` cannot fail because every field has a default, so expose an infallible wrapper.
impl RenderGraphConfigBuilder {
    /// Builds a new `RenderGraphConfig`.
    pub fn build(self) -> RenderGraphConfig {
        self.fallible_build()
            .expect("all fields have defaults")
    }
}

#[derive(Debug)]
pub struct RenderGraphConfigBuilderError;

impl From<derive_builder::UninitializedFieldError> for RenderGraphConfigBuilderError {
    fn from(_: derive_builder::UninitializedFieldError) -> Self {
        Self
    }
}

impl std::fmt::Display for RenderGraphConfigBuilderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "render graph config builder error")
    }
}

impl std::error::Error for RenderGraphConfigBuilderError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = RenderGraphConfig::default();

        assert_eq!(config.arena_page_size, 2 * 1024 * 1024);
        assert_eq!(config.max_in_flight_frames, 2);
        assert_eq!(config.transient_registry_capacity, 4096);
        assert!(!config.disable_automatic_labels);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let config = RenderGraphConfigBuilder::default()
            .max_in_flight_frames(4)
            .disable_automatic_labels(true)
            .build();

        assert_eq!(config.max_in_flight_frames, 4);
        assert!(config.disable_automatic_labels);
        assert_eq!(config.arena_page_size, RenderGraphConfig::DEFAULT_ARENA_PAGE_SIZE);
    }
}
